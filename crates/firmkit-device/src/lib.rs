//! Device lifecycle state machine and event-replay core for FirmKit
//!
//! This crate models heterogeneous hardware devices behind one uniform
//! lifecycle contract so that generic "detach → write firmware → attach →
//! verify" orchestration never needs device-specific branches. Concrete
//! device types implement [`DeviceHooks`]; the core owns:
//!
//! - **identity**: content-addressed device IDs, instance IDs hashed to
//!   GUIDs for quirk matching
//! - **lifecycle**: probe → open → setup → ready with latched phases and
//!   balanced open/close reference counting
//! - **inhibits**: named problems that gate updatability, with automatic
//!   battery and reachability rules
//! - **the device graph**: owned children, weak parents, weak-by-default
//!   proxies
//! - **record/replay**: every boundary operation logs a keyed event so a
//!   real hardware session can be captured once and replayed
//!   deterministically without the hardware
//!
//! # Example
//!
//! ```
//! use firmkit_device::{Device, DeviceFlags};
//!
//! let device = Device::raw();
//! device.set_physical_id("usb:1-2");
//! device.ensure_id().unwrap();
//! device.add_flag(DeviceFlags::UPDATABLE);
//!
//! device.inhibit("example", Some("Device is busy right now"));
//! assert!(!device.has_flag(DeviceFlags::UPDATABLE));
//! device.uninhibit("example");
//! assert!(device.has_flag(DeviceFlags::UPDATABLE));
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod context;
pub mod device;
pub mod event;
pub mod firmware;
pub mod flags;
pub mod graph;
pub mod hooks;
mod identity;
mod inhibit;
mod io;
pub mod progress;
pub mod quirks;
pub mod registry;
pub mod retry;
pub mod snapshot;
pub mod version;

pub use context::{BATTERY_LEVEL_INVALID, BATTERY_THRESHOLD_DEFAULT, Context, ContextFlags,
                  QuirkSource, SmbiosSource};
pub use device::{Device, DeviceRef, SubscriptionId, UpdateState, device_id_is_valid};
pub use event::{DeviceEvent, EventRecord, EventValue};
pub use firmware::{FirmwareContainer, InstallFlags, ParseFlags, RawContainer};
pub use flags::{DeviceFlags, DeviceProblem, InstanceFlags, private_flags};
pub use graph::IncorporateFlags;
pub use hooks::{Backend, DeviceHooks, RawHooks};
pub use identity::{guid_from_string, guid_is_valid};
pub use progress::{Progress, ProgressStatus, REQUEST_ID_REMOVE_REPLUG, Request, RequestKind};
pub use quirks::quirk_keys;
pub use retry::{PollLocker, RecoveryFunc};
pub use snapshot::DeviceSnapshot;
pub use version::VersionFormat;

/// Re-export of the error types every API here returns.
pub use firmkit_errors::{DeviceError, ErrorKind, Result};
