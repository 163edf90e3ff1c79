// REST client for the auction backend.
//
// The socket channel delivers events; this client carries the queries and
// mutations: auction listing/seeding, the authoritative bid-placement
// path, auto-bid setup/cancel/status, leaderboards, and aggregate stats.
// Every call sends the host-app token (`Authorization: tma <token>`) and,
// when configured for development, an `X-Dev-User-Id` fallback header.
// Rejection bodies (`{"error": "..."}`) surface as `ApiError::Rejected`,
// distinct from transport faults and bare non-2xx statuses.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::autobid::AutoBidState;
use crate::protocol::{AuctionStatus, LeaderboardEntry, StopReason};
use crate::store::{Auction, Bid};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server returned status {status}")]
    Status { status: u16 },

    /// Business-rule rejection parsed from an error body.
    #[error("{reason}")]
    Rejected { reason: String },
}

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionDetail {
    pub id: String,
    pub gift_name: String,
    pub starting_price: u64,
    pub current_price: u64,
    pub increment_amount: u64,
    pub end_time: DateTime<Utc>,
    pub status: AuctionStatus,
    #[serde(default)]
    pub total_bids: u64,
    #[serde(default)]
    pub bids: Vec<BidRecord>,
    #[serde(default)]
    pub winner_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidRecord {
    pub id: i64,
    pub bidder_id: String,
    pub bidder_name: String,
    pub amount: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_auto_bid: bool,
}

impl From<AuctionDetail> for Auction {
    fn from(d: AuctionDetail) -> Self {
        Auction {
            id: d.id,
            gift_name: d.gift_name,
            starting_price: d.starting_price,
            current_price: d.current_price,
            increment_amount: d.increment_amount,
            end_time: d.end_time,
            status: d.status,
            total_bids: d.total_bids,
            bids: d
                .bids
                .into_iter()
                .map(|b| Bid {
                    id: b.id,
                    bidder_id: b.bidder_id,
                    bidder_name: b.bidder_name,
                    amount: b.amount,
                    created_at: b.created_at,
                    is_auto_bid: b.is_auto_bid,
                })
                .collect(),
            winner_name: d.winner_name,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionPage {
    pub auctions: Vec<AuctionDetail>,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub page: u32,
}

/// Filter/sort/pagination parameters for the auction list.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub status: Option<AuctionStatus>,
    pub sort: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidResponse {
    #[serde(default)]
    pub bid_id: Option<i64>,
    pub new_price: u64,
    #[serde(default)]
    pub new_balance: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoBidStatus {
    pub is_active: bool,
    #[serde(default)]
    pub max_amount: u64,
    #[serde(default)]
    pub current_bid: u64,
    #[serde(default)]
    pub bid_count: u32,
    #[serde(default)]
    pub stopped_reason: Option<StopReason>,
}

impl From<AutoBidStatus> for AutoBidState {
    fn from(s: AutoBidStatus) -> Self {
        if s.is_active {
            AutoBidState::Active {
                max_amount: s.max_amount,
                current_bid: s.current_bid,
                bid_count: s.bid_count,
            }
        } else {
            match s.stopped_reason {
                Some(reason) if reason != StopReason::None => AutoBidState::Stopped(reason),
                _ => AutoBidState::Idle,
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveAutoBid {
    pub auction_id: String,
    pub max_amount: u64,
    pub current_bid: u64,
    pub bid_count: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoBidStats {
    #[serde(default)]
    pub total_subscriptions: u64,
    #[serde(default)]
    pub total_bids_placed: u64,
    #[serde(default)]
    pub total_spent: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterFacets {
    #[serde(default)]
    pub statuses: Vec<String>,
    #[serde(default)]
    pub gift_names: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionStats {
    #[serde(default)]
    pub active_auctions: u64,
    #[serde(default)]
    pub completed_auctions: u64,
    #[serde(default)]
    pub total_bids: u64,
    #[serde(default)]
    pub total_volume: u64,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    dev_user_id: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: String, token: String, dev_user_id: Option<String>) -> Self {
        ApiClient {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            dev_user_id,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self
            .http
            .request(method, url)
            .header("Authorization", format!("tma {}", self.token));
        if let Some(dev) = &self.dev_user_id {
            builder = builder.header("X-Dev-User-Id", dev);
        }
        builder
    }

    /// Check the response status and decode the body, turning error bodies
    /// into `ApiError::Rejected`.
    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        #[derive(Deserialize)]
        struct ErrorBody {
            error: String,
        }
        let text = response.text().await.unwrap_or_default();
        if let Ok(body) = serde_json::from_str::<ErrorBody>(&text) {
            return Err(ApiError::Rejected { reason: body.error });
        }
        Err(ApiError::Status {
            status: status.as_u16(),
        })
    }

    // -- auctions ----------------------------------------------------------

    pub async fn list_auctions(&self, query: &ListQuery) -> Result<AuctionPage, ApiError> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(status) = query.status {
            let value = match status {
                AuctionStatus::Pending => "pending",
                AuctionStatus::Active => "active",
                AuctionStatus::Completed => "completed",
                AuctionStatus::Cancelled => "cancelled",
            };
            params.push(("status", value.to_string()));
        }
        if let Some(sort) = &query.sort {
            params.push(("sort", sort.clone()));
        }
        if let Some(page) = query.page {
            params.push(("page", page.to_string()));
        }
        if let Some(limit) = query.limit {
            params.push(("limit", limit.to_string()));
        }

        let response = self
            .request(reqwest::Method::GET, "/auctions")
            .query(&params)
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn fetch_auction(&self, auction_id: &str) -> Result<AuctionDetail, ApiError> {
        debug!(auction_id, "fetching auction");
        let response = self
            .request(reqwest::Method::GET, &format!("/auctions/{auction_id}"))
            .send()
            .await?;
        Self::decode(response).await
    }

    /// Authoritative bid placement path. The socket `bid:place` command is
    /// a convenience path converging on the same server-side effect.
    pub async fn place_bid(&self, auction_id: &str, amount: u64) -> Result<BidResponse, ApiError> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/auctions/{auction_id}/bids"),
            )
            .json(&serde_json::json!({ "amount": amount }))
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn auction_stats(&self) -> Result<AuctionStats, ApiError> {
        let response = self
            .request(reqwest::Method::GET, "/auctions/stats")
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn filter_facets(&self) -> Result<FilterFacets, ApiError> {
        let response = self
            .request(reqwest::Method::GET, "/auctions/facets")
            .send()
            .await?;
        Self::decode(response).await
    }

    // -- auto-bid ----------------------------------------------------------

    pub async fn setup_autobid(
        &self,
        auction_id: &str,
        max_amount: u64,
    ) -> Result<AutoBidStatus, ApiError> {
        let response = self
            .request(reqwest::Method::POST, "/autobids")
            .json(&serde_json::json!({
                "auctionId": auction_id,
                "maxAmount": max_amount,
            }))
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn cancel_autobid(&self, auction_id: &str) -> Result<AutoBidStatus, ApiError> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/autobids/{auction_id}"))
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn autobid_status(&self, auction_id: &str) -> Result<AutoBidStatus, ApiError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/autobids/{auction_id}"))
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn active_autobids(&self) -> Result<Vec<ActiveAutoBid>, ApiError> {
        let response = self
            .request(reqwest::Method::GET, "/autobids")
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn autobid_stats(&self) -> Result<AutoBidStats, ApiError> {
        let response = self
            .request(reqwest::Method::GET, "/autobids/stats")
            .send()
            .await?;
        Self::decode(response).await
    }

    // -- leaderboard -------------------------------------------------------

    pub async fn leaderboard(&self, period: &str) -> Result<Vec<LeaderboardEntry>, ApiError> {
        let response = self
            .request(reqwest::Method::GET, "/leaderboard")
            .query(&[("period", period)])
            .send()
            .await?;
        Self::decode(response).await
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Spawn a one-shot HTTP server that answers any request with the
    /// given status line and JSON body, and returns (base_url, captured
    /// request headers+line).
    async fn one_shot_server(
        status_line: &'static str,
        body: &'static str,
    ) -> (String, tokio::sync::oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (req_tx, req_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut request = String::new();
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                request.push_str(&String::from_utf8_lossy(&buf[..n]));
                if n == 0 || request.contains("\r\n\r\n") {
                    break;
                }
            }
            let response = format!(
                "{status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = req_tx.send(request);
        });

        (format!("http://{addr}"), req_rx)
    }

    #[tokio::test]
    async fn place_bid_parses_success_response() {
        let (base, _req) = one_shot_server(
            "HTTP/1.1 200 OK",
            r#"{"bidId": 77, "newPrice": 200, "newBalance": 800}"#,
        )
        .await;
        let client = ApiClient::new(base, "tok".into(), None);

        let response = client.place_bid("a1", 200).await.unwrap();
        assert_eq!(response.bid_id, Some(77));
        assert_eq!(response.new_price, 200);
        assert_eq!(response.new_balance, Some(800));
    }

    #[tokio::test]
    async fn error_body_surfaces_as_rejection() {
        let (base, _req) = one_shot_server(
            "HTTP/1.1 400 Bad Request",
            r#"{"error": "auction already ended"}"#,
        )
        .await;
        let client = ApiClient::new(base, "tok".into(), None);

        let err = client.place_bid("a1", 200).await.unwrap_err();
        match err {
            ApiError::Rejected { reason } => assert_eq!(reason, "auction already ended"),
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bare_failure_status_is_not_a_rejection() {
        let (base, _req) = one_shot_server("HTTP/1.1 502 Bad Gateway", "oops").await;
        let client = ApiClient::new(base, "tok".into(), None);

        let err = client.fetch_auction("a1").await.unwrap_err();
        match err {
            ApiError::Status { status } => assert_eq!(status, 502),
            other => panic!("expected Status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn requests_carry_identity_headers() {
        let (base, req_rx) = one_shot_server("HTTP/1.1 200 OK", "[]").await;
        let client = ApiClient::new(base, "tok-123".into(), Some("dev-7".into()));

        client.active_autobids().await.unwrap();

        let request = req_rx.await.unwrap();
        assert!(request.contains("GET /autobids HTTP/1.1"));
        assert!(request.to_lowercase().contains("authorization: tma tok-123"));
        assert!(request.to_lowercase().contains("x-dev-user-id: dev-7"));
    }

    #[tokio::test]
    async fn list_query_builds_filter_params() {
        let (base, req_rx) = one_shot_server(
            "HTTP/1.1 200 OK",
            r#"{"auctions": [], "total": 0, "page": 2}"#,
        )
        .await;
        let client = ApiClient::new(base, "tok".into(), None);

        let page = client
            .list_auctions(&ListQuery {
                status: Some(AuctionStatus::Active),
                sort: Some("price_desc".into()),
                page: Some(2),
                limit: Some(20),
            })
            .await
            .unwrap();
        assert_eq!(page.page, 2);

        let request = req_rx.await.unwrap();
        assert!(request.contains("status=active"));
        assert!(request.contains("sort=price_desc"));
        assert!(request.contains("page=2"));
        assert!(request.contains("limit=20"));
    }

    #[test]
    fn autobid_status_maps_to_cache_states() {
        let active = AutoBidStatus {
            is_active: true,
            max_amount: 500,
            current_bid: 120,
            bid_count: 3,
            stopped_reason: None,
        };
        assert_eq!(
            AutoBidState::from(active),
            AutoBidState::Active {
                max_amount: 500,
                current_bid: 120,
                bid_count: 3
            }
        );

        let stopped = AutoBidStatus {
            is_active: false,
            max_amount: 0,
            current_bid: 0,
            bid_count: 0,
            stopped_reason: Some(StopReason::MaxReached),
        };
        assert_eq!(
            AutoBidState::from(stopped),
            AutoBidState::Stopped(StopReason::MaxReached)
        );

        let idle = AutoBidStatus {
            is_active: false,
            max_amount: 0,
            current_bid: 0,
            bid_count: 0,
            stopped_reason: None,
        };
        assert_eq!(AutoBidState::from(idle), AutoBidState::Idle);
    }
}
