//! photowall daemon - ingestion, relay fanout and viewer server
//!
//! This crate provides the pipeline behind the broadcast wall:
//! - `queue` - Bounded ingestion queue between uploads and workers
//! - `workers` - Worker pool that publishes submissions under a permit limit
//! - `relay` - Pub/sub relay backends and the single relay listener
//! - `registry` - Viewer connections split across pools
//! - `fanout` - Chunked broadcast to every live connection
//! - `keepalive` - Liveness sweep for silent viewers
//! - `server` - HTTP upload, viewer WebSockets, health
//! - `broker` - Standalone Unix socket relay broker
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────────┐   ┌─────────────┐
//! │ POST       │──▶│ IngestionQueue │──▶│ Workers     │
//! │ /upload    │   │  (capacity C)  │   │ (N, M perm) │
//! └─────┬──────┘   └────────────────┘   └──────┬──────┘
//!       │ queue full: publish directly         │ publish
//!       └──────────────────────────────────────▼
//!                                      ┌───────────────┐
//!                                      │     Relay     │
//!                                      └───────┬───────┘
//!                                              │ one subscription
//!                                              ▼
//! ┌────────────────────┐  snapshot   ┌─────────────────┐
//! │ ConnectionRegistry │◀────────────│ RelayListener → │
//! │   (P pools)        │  prune dead │   Broadcaster   │
//! └────────────────────┘             └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod broker;
pub mod config;
pub mod context;
pub mod fanout;
pub mod health;
pub mod keepalive;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod server;
pub mod workers;

pub use config::{ConfigError, WallConfig};
pub use context::{ShutdownReport, SubmitError, SubmitOutcome, WallContext};
