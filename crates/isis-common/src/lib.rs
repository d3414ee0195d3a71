//! isis Common Library
//!
//! Shared error handling and logging for the isis workspace.
//!
//! - **Error Handling**: [`IsisError`] and the [`Result`] alias used by every
//!   library crate in the workspace
//! - **Logging**: centralized `tracing` setup driven by [`logging::LogConfig`]
//!
//! # Example
//!
//! ```no_run
//! use isis_common::logging::{init_logging, LogConfig};
//!
//! fn start() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     init_logging(&config)?;
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;

pub use error::{IsisError, Result};
