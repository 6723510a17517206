//! Bounded retry with per-kind recovery.
//!
//! A worker runs up to a fixed try count with a fixed delay between
//! tries. Failures are matched against a registered table of error kinds:
//! a match with a recovery function runs it (and the recovery failing
//! aborts the whole loop); a match without one is fatal immediately; no
//! match means the error is transient and the worker retries. Sleeps
//! route through [`crate::Device::sleep`], so emulated replay never
//! blocks.

use std::sync::Arc;

use tracing::info;

use firmkit_errors::prelude::*;

use crate::device::Device;

/// A recovery action run before the next retry, e.g. a device reset.
pub type RecoveryFunc = Arc<dyn Fn(&Device) -> Result<()> + Send + Sync>;

/// Pauses polling for as long as it is held.
///
/// Taken around open/close so a poll never races a half-configured
/// device; the counter tolerates concurrent holders.
pub struct PollLocker<'a> {
    device: &'a Device,
}

impl Drop for PollLocker<'_> {
    fn drop(&mut self) {
        self.device
            .poll_paused
            .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Device {
    /// Pause polling until the returned guard is dropped.
    pub fn poll_locker(&self) -> PollLocker<'_> {
        self.poll_paused
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        PollLocker { device: self }
    }

    /// Register a recovery action for an error kind.
    ///
    /// Passing `None` marks the kind immediately fatal instead of
    /// transient.
    pub fn retry_add_recovery(&self, kind: ErrorKind, recovery: Option<RecoveryFunc>) {
        self.state.write().retry_recoveries.push((kind, recovery));
    }

    /// Set the delay between failed retries, in milliseconds.
    pub fn retry_set_delay(&self, delay_ms: u32) {
        self.state.write().retry_delay_ms = delay_ms;
    }

    /// Run a worker with the registered recovery table and the device
    /// retry delay.
    ///
    /// # Errors
    ///
    /// See [`Device::retry_full`].
    pub fn retry<F>(&self, func: F, count: u32) -> Result<()>
    where
        F: FnMut(&Device) -> Result<()>,
    {
        let delay_ms = self.state.read().retry_delay_ms;
        self.retry_full(func, count, delay_ms)
    }

    /// Run a worker up to `count` times with `delay_ms` between tries.
    ///
    /// With no recovery registered for an error's kind, every failure is
    /// treated as transient until the tries are exhausted.
    ///
    /// # Errors
    ///
    /// The recovery function's own error; a fatal-kind match prefixed
    /// with "device recovery not possible"; or the last transient error
    /// wrapped with "failed after N retries".
    pub fn retry_full<F>(&self, mut func: F, count: u32, delay_ms: u32) -> Result<()>
    where
        F: FnMut(&Device) -> Result<()>,
    {
        debug_assert!(count >= 1);
        for i in 0.. {
            if i > 0 {
                self.sleep(delay_ms);
            }

            let error = match func(self) {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };

            // too many retries
            if i >= count.saturating_sub(1) {
                return Err(error.prefixed(&format!("failed after {count} retries: ")));
            }

            let recoveries = self.state.read().retry_recoveries.clone();
            if recoveries.is_empty() {
                info!("failed on try {} of {count}: {error}", i + 1);
                continue;
            }

            // find the condition that matches
            for (kind, recovery) in &recoveries {
                if *kind != error.kind() {
                    continue;
                }
                match recovery {
                    // the recovery failing aborts the whole loop
                    Some(recovery) => recovery(self)?,
                    None => {
                        return Err(error.prefixed("device recovery not possible: "));
                    }
                }
            }
        }
        Err(DeviceError::internal("retry loop finished without an error set"))
    }
}
