// Library root: re-exports all modules so integration tests and external
// consumers can access the crate's public API.

pub mod api;
pub mod autobid;
pub mod config;
pub mod connection;
pub mod engine;
pub mod optimistic;
pub mod protocol;
pub mod reconcile;
pub mod store;
pub mod timer;
