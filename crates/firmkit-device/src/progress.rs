//! Cooperative progress reporting and interactive requests.
//!
//! Long-running operations pre-declare a fixed number of steps and advance
//! one at a time as whole chunks complete; there is no mid-chunk
//! cancellation. Interactive requests ("remove and reinstall the battery")
//! travel back to the requester through the sender attached here; with no
//! sender attached they fail immediately instead of blocking forever.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use firmkit_errors::prelude::*;

/// What the device is currently doing, for client display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressStatus {
    /// Nothing specific
    #[default]
    Unknown,
    /// Loading or parsing a firmware payload
    Loading,
    /// Decompressing a firmware payload
    Decompressing,
    /// Waiting for the device to restart
    DeviceRestart,
    /// Writing firmware to the device
    DeviceWrite,
    /// Verifying written firmware
    DeviceVerify,
    /// Reading firmware back from the device
    DeviceRead,
    /// Erasing device storage
    DeviceErase,
    /// Waiting for the user to act on a request
    WaitingForUser,
    /// Sleeping out a mandated hardware delay
    Sleeping,
}

/// When an interactive request should be shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestKind {
    /// Show after the write completes, e.g. "replug the device"
    Post,
    /// Show immediately, blocking the write until acted on
    Immediate,
}

/// The well-known generic request shown when a device needs a replug.
pub const REQUEST_ID_REMOVE_REPLUG: &str = "remove-replug";

/// An interactive request emitted mid-update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// When to show the request
    pub kind: RequestKind,
    /// Stable request ID, e.g. [`REQUEST_ID_REMOVE_REPLUG`]
    pub id: Option<String>,
    /// The message shown to the user
    pub message: Option<String>,
    /// An optional illustrating image URL
    pub image: Option<String>,
    /// The emitting device ID
    pub device_id: Option<String>,
}

type RequestSender = Arc<dyn Fn(&Request) -> Result<()> + Send + Sync>;

#[derive(Default)]
struct ProgressInner {
    id: Option<String>,
    steps: u32,
    steps_done: u32,
    percentage: u32,
    status: ProgressStatus,
    sender: Option<RequestSender>,
    no_sender: bool,
}

/// Cooperative progress reporter threaded through long-running operations.
#[derive(Default)]
pub struct Progress {
    inner: Mutex<ProgressInner>,
}

impl Progress {
    /// Create an idle progress object.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag the progress with the owning operation, usually a source location.
    pub fn set_id(&self, id: &str) {
        self.inner.lock().id = Some(id.to_string());
    }

    /// Pre-declare the number of whole steps; resets completion.
    pub fn set_steps(&self, steps: u32) {
        let mut inner = self.inner.lock();
        inner.steps = steps;
        inner.steps_done = 0;
        inner.percentage = 0;
    }

    /// Mark one pre-declared step complete.
    pub fn step_done(&self) {
        let mut inner = self.inner.lock();
        if inner.steps == 0 {
            return;
        }
        inner.steps_done = (inner.steps_done + 1).min(inner.steps);
        inner.percentage = inner.steps_done * 100 / inner.steps;
    }

    /// Set the percentage directly for operations without discrete steps.
    pub fn set_percentage(&self, percentage: u32) {
        self.inner.lock().percentage = percentage.min(100);
    }

    /// Current completion percentage, 0..=100.
    pub fn percentage(&self) -> u32 {
        self.inner.lock().percentage
    }

    /// Set the displayed status.
    pub fn set_status(&self, status: ProgressStatus) {
        self.inner.lock().status = status;
    }

    /// Current displayed status.
    pub fn status(&self) -> ProgressStatus {
        self.inner.lock().status
    }

    /// Sleep for a mandated hardware delay, updating the percentage in
    /// chunks so clients see movement.
    ///
    /// Callers inside the device core should use `Device::sleep_full`
    /// instead, which elides the delay entirely for emulated devices.
    pub fn sleep(&self, delay_ms: u32) {
        const CHUNK_MS: u32 = 100;
        if delay_ms == 0 {
            return;
        }
        let prev_status = self.status();
        self.set_status(ProgressStatus::Sleeping);
        self.set_percentage(0);
        let chunks = delay_ms.div_ceil(CHUNK_MS);
        for i in 0..chunks {
            let this_chunk = CHUNK_MS.min(delay_ms - i * CHUNK_MS);
            std::thread::sleep(Duration::from_millis(u64::from(this_chunk)));
            self.set_percentage((i + 1) * 100 / chunks);
        }
        self.set_status(prev_status);
    }

    /// Attach the sender that delivers interactive requests to the
    /// original requester.
    pub fn set_request_sender<F>(&self, sender: F)
    where
        F: Fn(&Request) -> Result<()> + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        inner.sender = Some(Arc::new(sender));
        inner.no_sender = false;
    }

    /// Mark that the original requester has disconnected.
    ///
    /// Pending interactive requests then fail immediately rather than
    /// blocking indefinitely waiting for user input.
    pub fn set_no_sender(&self) {
        let mut inner = self.inner.lock();
        inner.sender = None;
        inner.no_sender = true;
    }

    /// Whether a request sender is attached.
    pub fn has_sender(&self) -> bool {
        self.inner.lock().sender.is_some()
    }

    /// Deliver a request to the attached sender.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotSupported`] when no sender is attached, or
    /// whatever error the sender itself raises; either aborts the
    /// in-flight operation.
    pub fn send_request(&self, request: &Request) -> Result<()> {
        let sender = {
            let inner = self.inner.lock();
            if inner.no_sender {
                return Err(DeviceError::not_supported(
                    "request sender has disconnected",
                ));
            }
            inner.sender.clone()
        };
        let sender = sender
            .ok_or_else(|| DeviceError::not_supported("no sender connected to deliver request"))?;
        debug!("delivering request {:?}", request.id);
        sender(request)
    }
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Progress")
            .field("id", &inner.id)
            .field("steps", &inner.steps)
            .field("steps_done", &inner.steps_done)
            .field("percentage", &inner.percentage)
            .field("status", &inner.status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_drive_percentage() {
        let progress = Progress::new();
        progress.set_steps(4);
        assert_eq!(progress.percentage(), 0);
        progress.step_done();
        assert_eq!(progress.percentage(), 25);
        progress.step_done();
        progress.step_done();
        progress.step_done();
        assert_eq!(progress.percentage(), 100);
        // extra steps saturate
        progress.step_done();
        assert_eq!(progress.percentage(), 100);
    }

    #[test]
    fn test_request_without_sender_fails() {
        let progress = Progress::new();
        let request = Request {
            kind: RequestKind::Immediate,
            id: None,
            message: Some("remove and reinstall the battery".to_string()),
            image: None,
            device_id: None,
        };
        let err = progress.send_request(&request).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }

    #[test]
    fn test_request_sender_receives() {
        let progress = Progress::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_tx = seen.clone();
        progress.set_request_sender(move |request: &Request| {
            seen_tx.lock().push(request.clone());
            Ok(())
        });
        let request = Request {
            kind: RequestKind::Post,
            id: Some(REQUEST_ID_REMOVE_REPLUG.to_string()),
            message: Some("replug".to_string()),
            image: None,
            device_id: None,
        };
        progress.send_request(&request).unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_disconnected_sender_fails_fast() {
        let progress = Progress::new();
        progress.set_request_sender(|_| Ok(()));
        progress.set_no_sender();
        let request = Request {
            kind: RequestKind::Immediate,
            id: None,
            message: None,
            image: None,
            device_id: None,
        };
        assert!(progress.send_request(&request).is_err());
    }
}
