//! Centralized error types for FirmKit
//!
//! This crate provides the unified error taxonomy for the FirmKit daemon
//! and its device plugins. Errors are classified by *kind* rather than by
//! origin so that generic orchestration code can make retry/abort/report
//! decisions without device-specific branches.
//!
//! # Architecture
//!
//! - [`device`]: the [`DeviceError`] type used by every device operation,
//!   plus the serializable [`ErrorKind`] projection used when an error is
//!   recorded into an emulation event log
//! - [`common`]: severity classification shared across all crates
//!
//! # Example
//!
//! ```
//! use firmkit_errors::prelude::*;
//!
//! fn close(refcount: u32) -> Result<()> {
//!     if refcount == 0 {
//!         return Err(DeviceError::nothing_to_do("cannot close device, refcount already zero"));
//!     }
//!     Ok(())
//! }
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod common;
pub mod device;
pub mod prelude;

pub use common::ErrorSeverity;
pub use device::{DeviceError, ErrorKind};

/// A specialized `Result` type for FirmKit device operations.
pub type Result<T> = std::result::Result<T, DeviceError>;
