// src/lib.rs
//! A caching HTTP proxy for a package-distribution ecosystem: serves package
//! files from a local cache, transparently fetching and fanning out
//! in-progress downloads to every concurrent requester for the same file,
//! and falls back across a ranked list of upstream mirrors when one is slow
//! or unavailable.
//!
//! # Components
//!
//! - [`mirror`] ranks and rotates upstream mirrors.
//! - [`content_length`] persists known file sizes across restarts.
//! - [`serializer`] is the single coordinator enforcing at most one
//!   in-flight download per filename.
//! - [`downloader`] streams a file from the first mirror that answers.
//! - [`filewatcher`] notifies readers as a growing cache file gains bytes.
//! - [`request`] runs the per-connection state machine; [`acceptor`] accepts
//!   connections and spawns it.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use cpcache::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     cpcache::init();
//!     let config = Config::load_from_config_dir()?;
//!     println!("listening on port {}", config.port);
//!     Ok(())
//! }
//! ```

pub mod acceptor;
pub mod auth;
pub mod cli;
pub mod config;
pub mod content_length;
pub mod downloader;
pub mod error;
pub mod filewatcher;
pub mod http;
pub mod key;
pub mod mirror;
pub mod request;
pub mod sendfile;
pub mod serializer;
pub mod store;

/// Initializes the process logging system. Safe to call multiple times;
/// subsequent calls are ignored.
///
/// # Examples
///
/// ```
/// cpcache::init();
/// ```
pub fn init() {
    let _ = env_logger::try_init();
    log::info!("cpcache initialized");
}
