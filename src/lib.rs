//! hermes-index: semantic search over a torrent-metadata database
//!
//! The crate keeps an external vector index synchronized with upstream
//! Postgres rows (incremental, hash-diffed, per-source watermarks) and
//! serves a cross-language hybrid search API over it. See DESIGN.md for
//! the component map.

pub mod config;
pub mod embed;
pub mod enrich;
pub mod error;
pub mod expand;
pub mod search;
pub mod server;
pub mod source;
pub mod state;
pub mod store;
pub mod sync;

pub use config::Config;
pub use error::{Error, Result};
