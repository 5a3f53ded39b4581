//! Offline cache agent for a single-page web app.
//!
//! The agent reacts to three lifecycle events:
//! - install: pre-populate a named cache bucket with a fixed asset list
//! - activate: drop every bucket whose name is not the current one, claim clients
//! - fetch: cache-first for GET, runtime caching of allowed origins, offline fallback
//!
//! Storage, network and the worker host are injected through traits so the same
//! policy runs against SQLite + reqwest in the CLI and against fakes in tests.

pub mod agent;
pub mod cache;
pub mod config;
pub mod host;
pub mod http;
pub mod net;
pub mod policy;

pub use agent::{FetchOutcome, InstallOutcome, OfflineAgent, ResponseSource};
pub use config::Config;
