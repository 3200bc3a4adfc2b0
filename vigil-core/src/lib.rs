//! # vigil-core
//!
//! Core library for vigil - an agent session monitor.
//!
//! This library provides:
//! - Domain types for monitored sessions, steps, and summaries
//! - Incremental transcript parsing with byte-offset checkpoints
//! - Launch-to-transcript correlation with lifetime pinning
//! - A crash-consistent filesystem session store
//! - Per-invocation monitors with a shared registry
//! - A list/detail/tail query surface
//!
//! ## Architecture
//!
//! An external agent writes append-only JSONL transcripts; vigil never talks
//! to the agent, only to the filesystem:
//!
//! ```text
//! transcripts (read-only) ─► Correlator ─► Monitor ─► Parser ─► Store
//!                                                                 │
//!                                       CLI / GUI ◄─ QuerySurface ┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use vigil_core::{Config, SessionStore, SessionFilter};
//!
//! let config = Config::load().expect("failed to load config");
//! let store = SessionStore::new(Config::store_root());
//! let sessions = store.list_sessions(&SessionFilter::default()).expect("list failed");
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use error::{Error, Result};
pub use monitor::{Monitor, MonitorOutcome, Registry, SessionControl};
pub use query::SessionQuery;
pub use store::{SessionFilter, SessionStore};
pub use types::*;

// Public modules
pub mod config;
pub mod correlate;
pub mod error;
pub mod format;
pub mod logging;
pub mod monitor;
pub mod parser;
pub mod query;
pub mod store;
pub mod types;
