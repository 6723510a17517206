//! Convenience re-exports for the common case.

pub use crate::Result;
pub use crate::common::ErrorSeverity;
pub use crate::device::{DeviceError, ErrorKind};
