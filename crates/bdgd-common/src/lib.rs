//! BDGD Common Library
//!
//! Shared plumbing for the BDGD import workspace.
//!
//! - **Error Handling**: the common error type and result alias
//! - **Checksums**: content digests used for deterministic identities
//! - **Logging**: tracing subscriber setup driven by `LOG_*` variables
//!
//! # Example
//!
//! ```no_run
//! use bdgd_common::checksum::digest_parts;
//! use bdgd_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> bdgd_common::Result<()> {
//!     init_logging(&LogConfig::from_env()?)?;
//!     let key = digest_parts(&["123", "2023", "UCBT", "5160"]);
//!     tracing::info!(%key, "derived key");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
