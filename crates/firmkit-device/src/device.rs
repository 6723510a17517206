//! The device object.
//!
//! A [`Device`] models one updatable piece of hardware behind the uniform
//! lifecycle contract: probe → ensure-id → open → setup → ready, then
//! detach → write → attach → cleanup during an update. Concrete device
//! types supply behavior through [`DeviceHooks`]; the core owns calling
//! order, reference counting, identity derivation, the inhibit rules and
//! the event log used for deterministic replay.
//!
//! Devices are shared as [`DeviceRef`] (`Arc<Device>`). The bulk of the
//! mutable state sits behind a single `RwLock` under a cooperative
//! single-writer-per-device discipline; the open refcount and the poll
//! pause counter are atomics because independent call sites increment
//! them concurrently.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use firmkit_errors::prelude::*;

use crate::context::{BATTERY_LEVEL_INVALID, BATTERY_THRESHOLD_DEFAULT, Context};
use crate::event::DeviceEvent;
use crate::firmware::{FirmwareContainer, InstallFlags, ParseFlags, RawContainer};
use crate::flags::{DeviceFlags, DeviceProblem, InstanceFlags, private_flags};
use crate::hooks::{Backend, DeviceHooks, RawHooks};
use crate::progress::{Progress, Request, RequestKind};
use crate::registry;
use crate::version::VersionFormat;

/// A shared handle to a device.
pub type DeviceRef = Arc<Device>;

/// Retry attempts for the subclass open hook under `retry-open`.
pub const RETRY_OPEN_COUNT: u32 = 5;
/// Delay between open retries, in milliseconds.
pub const RETRY_OPEN_DELAY_MS: u32 = 50;
/// Remove delay used when a device re-enumerates during update.
pub const REMOVE_DELAY_RE_ENUMERATE_MS: u32 = 10_000;
/// Default delay for the device to settle after an update.
pub const ACQUIESCE_DELAY_DEFAULT_MS: u32 = 50;
/// Timestamps must be 0 or beyond this, guarding seconds-as-micros bugs.
pub const TIMESTAMP_SANITY_USEC: i64 = 10_000_000_000;

/// Result of the last update attempt, persisted across reboots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateState {
    /// No update attempted
    #[default]
    Unknown,
    /// Update scheduled for next reboot
    Pending,
    /// Last update succeeded
    Success,
    /// Last update failed
    Failed,
    /// Last update failed for a transient reason
    FailedTransient,
    /// Device needs a reboot to finish the update
    NeedsReboot,
}

/// One instance-ID entry before conversion to visible GUIDs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceIdItem {
    /// The human-readable instance ID, absent if a GUID was added directly
    pub instance_id: Option<String>,
    /// The derived (or directly supplied) GUID
    pub guid: String,
    /// Visibility and matching flags
    pub flags: InstanceFlags,
}

/// One active inhibit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Inhibit {
    pub(crate) problem: DeviceProblem,
    pub(crate) reason: String,
}

#[derive(Default)]
pub(crate) struct EventLog {
    pub(crate) items: Vec<Arc<DeviceEvent>>,
    pub(crate) cursor: usize,
}

/// Handle for removing a registered observer callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(pub(crate) u64);

pub(crate) type FlagObserver = Arc<dyn Fn(&Device) + Send + Sync>;
pub(crate) type ChildObserver = Arc<dyn Fn(&DeviceRef) + Send + Sync>;
pub(crate) type RequestObserver = Arc<dyn Fn(&Request) -> Result<()> + Send + Sync>;

#[derive(Default)]
pub(crate) struct Observers {
    next_token: AtomicU64,
    pub(crate) flags: Mutex<Vec<(u64, FlagObserver)>>,
    pub(crate) child_added: Mutex<Vec<(u64, ChildObserver)>>,
    pub(crate) child_removed: Mutex<Vec<(u64, ChildObserver)>>,
    pub(crate) request: Mutex<Vec<(u64, RequestObserver)>>,
}

impl Observers {
    pub(crate) fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Default)]
pub(crate) struct DeviceState {
    // identity
    pub(crate) id: Option<String>,
    pub(crate) device_id_valid: bool,
    pub(crate) physical_id: Option<String>,
    pub(crate) logical_id: Option<String>,
    pub(crate) backend_id: Option<String>,
    pub(crate) equivalent_id: Option<String>,
    pub(crate) composite_id: Option<String>,
    pub(crate) parent_id: Option<String>,

    // classification
    pub(crate) name: Option<String>,
    pub(crate) summary: Option<String>,
    pub(crate) branch: Option<String>,
    pub(crate) vendor: Option<String>,
    pub(crate) protocol: Option<String>,
    pub(crate) vid: u16,
    pub(crate) pid: u16,
    pub(crate) vendor_ids: Vec<String>,
    pub(crate) icons: Vec<String>,
    pub(crate) issues: Vec<String>,
    pub(crate) possible_plugins: Vec<String>,
    pub(crate) guids: Vec<String>,
    pub(crate) exported_instance_ids: Vec<String>,
    pub(crate) instance_items: Vec<InstanceIdItem>,
    pub(crate) parent_guids: Vec<String>,

    // versions
    pub(crate) version: Option<String>,
    pub(crate) version_lowest: Option<String>,
    pub(crate) version_bootloader: Option<String>,
    pub(crate) version_raw: u64,
    pub(crate) version_lowest_raw: u64,
    pub(crate) version_bootloader_raw: u64,
    pub(crate) version_format: VersionFormat,

    // flags and problems
    pub(crate) flags: DeviceFlags,
    pub(crate) problems: DeviceProblem,
    pub(crate) private_flags: HashSet<String>,
    pub(crate) custom_flags: Option<String>,

    // timing
    pub(crate) created_usec: i64,
    pub(crate) modified_usec: i64,
    pub(crate) remove_delay_ms: u32,
    pub(crate) acquiesce_delay_ms: u32,
    pub(crate) retry_delay_ms: u32,
    pub(crate) install_duration_s: u32,
    pub(crate) poll_interval_ms: u32,
    pub(crate) priority: u32,
    pub(crate) order: i32,

    // update
    pub(crate) update_message: Option<String>,
    pub(crate) update_image: Option<String>,
    pub(crate) update_request_id: Option<String>,
    pub(crate) update_error: Option<String>,
    pub(crate) update_state: UpdateState,
    pub(crate) firmware_size_min: u64,
    pub(crate) firmware_size_max: u64,
    pub(crate) required_free: u64,
    pub(crate) battery_level: u32,
    pub(crate) battery_threshold: u32,
    pub(crate) request_counts: BTreeMap<RequestKind, u32>,

    // lazy maps
    pub(crate) inhibits: Option<BTreeMap<String, Inhibit>>,
    pub(crate) metadata: Option<BTreeMap<String, String>>,
    pub(crate) instance_hash: Option<BTreeMap<String, String>>,

    // type bindings, first write wins
    pub(crate) specialized_type: Option<String>,
    pub(crate) proxy_type: Option<String>,
    pub(crate) firmware_type: Option<String>,
    pub(crate) proxy_guid: Option<String>,

    // graph
    pub(crate) parent: Weak<Device>,
    pub(crate) children: Vec<DeviceRef>,
    pub(crate) proxy_weak: Weak<Device>,
    pub(crate) proxy_strong: Option<DeviceRef>,
    pub(crate) proxy_subscription: Option<(Weak<Device>, SubscriptionId)>,
    pub(crate) target: Option<DeviceRef>,
    pub(crate) backend: Option<Weak<dyn Backend>>,
    pub(crate) ctx: Option<Arc<Context>>,

    // retry recovery table, keyed by error kind
    pub(crate) retry_recoveries: Vec<(ErrorKind, Option<crate::retry::RecoveryFunc>)>,

    // lifecycle latches
    pub(crate) done_probe: bool,
    pub(crate) done_setup: bool,
}

impl DeviceState {
    fn new() -> Self {
        Self {
            battery_level: BATTERY_LEVEL_INVALID,
            battery_threshold: BATTERY_THRESHOLD_DEFAULT,
            acquiesce_delay_ms: ACQUIESCE_DELAY_DEFAULT_MS,
            ..Self::default()
        }
    }
}

/// One updatable device.
pub struct Device {
    pub(crate) hooks: Box<dyn DeviceHooks>,
    pub(crate) weak_self: Weak<Device>,
    pub(crate) state: RwLock<DeviceState>,
    pub(crate) open_refcount: AtomicU32,
    pub(crate) poll_paused: AtomicU32,
    pub(crate) events: Mutex<EventLog>,
    pub(crate) observers: Observers,
}

/// Check a string against the canonical device-ID grammar: 40 lowercase
/// hex chars, the rendering of a SHA-1 digest.
pub fn device_id_is_valid(id: &str) -> bool {
    id.len() == 40 && id.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

impl Device {
    /// Create a device with subclass behavior.
    pub fn new(hooks: Box<dyn DeviceHooks>) -> DeviceRef {
        Arc::new_cyclic(|weak_self| Self {
            hooks,
            weak_self: weak_self.clone(),
            state: RwLock::new(DeviceState::new()),
            open_refcount: AtomicU32::new(0),
            poll_paused: AtomicU32::new(0),
            events: Mutex::new(EventLog::default()),
            observers: Observers::default(),
        })
    }

    /// Create a plain device with no subclass behavior.
    pub fn raw() -> DeviceRef {
        Self::new(Box::new(RawHooks))
    }

    /// Create a device bound to a shared context.
    pub fn with_context(ctx: Arc<Context>, hooks: Box<dyn DeviceHooks>) -> DeviceRef {
        let device = Self::new(hooks);
        device.set_context(ctx);
        device
    }

    /// The stable name of the concrete device type.
    pub fn kind(&self) -> &'static str {
        self.hooks.kind()
    }

    /// Attach the shared daemon context.
    pub fn set_context(&self, ctx: Arc<Context>) {
        self.state.write().ctx = Some(ctx);
        self.refresh_system_power_inhibit();
    }

    /// The shared daemon context, if attached.
    pub fn context(&self) -> Option<Arc<Context>> {
        self.state.read().ctx.clone()
    }

    /// Attach the originating backend, held weakly.
    pub fn set_backend(&self, backend: &Arc<dyn Backend>) {
        self.state.write().backend = Some(Arc::downgrade(backend));
    }

    /// The originating backend, if still alive.
    pub fn backend(&self) -> Option<Arc<dyn Backend>> {
        self.state.read().backend.as_ref()?.upgrade()
    }

    // ---- identity accessors ----

    /// The canonical device ID, if derived or set.
    pub fn id(&self) -> Option<String> {
        self.state.read().id.clone()
    }

    pub(crate) fn id_or_unset(&self) -> String {
        self.id().unwrap_or_else(|| "(unset)".to_string())
    }

    /// The physical ID representing the electrical connection.
    pub fn physical_id(&self) -> Option<String> {
        self.state.read().physical_id.clone()
    }

    /// Set the physical ID. Multiple devices may share one physical ID.
    ///
    /// Not allowed once setup has completed; a late change logs and is
    /// ignored.
    pub fn set_physical_id(&self, physical_id: &str) {
        let mut state = self.state.write();
        if state.physical_id.as_deref() == Some(physical_id) {
            return;
        }
        if state.done_setup {
            warn!(
                "cannot change {} physical ID from {:?} to {} as setup has already completed",
                state.id.as_deref().unwrap_or("(unset)"),
                state.physical_id,
                physical_id
            );
            return;
        }
        state.physical_id = Some(physical_id.to_string());
        state.device_id_valid = false;
    }

    /// The logical ID disambiguating devices with the same physical ID.
    pub fn logical_id(&self) -> Option<String> {
        self.state.read().logical_id.clone()
    }

    /// Set the logical ID; same late-change rule as the physical ID.
    pub fn set_logical_id(&self, logical_id: &str) {
        let mut state = self.state.write();
        if state.logical_id.as_deref() == Some(logical_id) {
            return;
        }
        if state.done_setup {
            warn!(
                "cannot change {} logical ID from {:?} to {} as setup has already completed",
                state.id.as_deref().unwrap_or("(unset)"),
                state.logical_id,
                logical_id
            );
            return;
        }
        state.logical_id = Some(logical_id.to_string());
        state.device_id_valid = false;
    }

    /// The backend ID, falling back to the physical ID when unset.
    pub fn backend_id(&self) -> Option<String> {
        let state = self.state.read();
        state.backend_id.clone().or_else(|| state.physical_id.clone())
    }

    /// Set the backend ID, typically a sysfs path or platform ID.
    pub fn set_backend_id(&self, backend_id: &str) {
        let mut state = self.state.write();
        if state.backend_id.as_deref() == Some(backend_id) {
            return;
        }
        state.backend_id = Some(backend_id.to_string());
        state.device_id_valid = false;
    }

    /// The ID of an equivalent device, if any.
    pub fn equivalent_id(&self) -> Option<String> {
        self.state.read().equivalent_id.clone()
    }

    /// Set the ID of an equivalent device.
    pub fn set_equivalent_id(&self, equivalent_id: &str) {
        self.state.write().equivalent_id = Some(equivalent_id.to_string());
    }

    /// The ID of the parent as exported to clients.
    pub fn parent_id(&self) -> Option<String> {
        self.state.read().parent_id.clone()
    }

    // ---- classification accessors ----

    /// The device name.
    pub fn name(&self) -> Option<String> {
        self.state.read().name.clone()
    }

    /// Set the device name.
    pub fn set_name(&self, name: &str) {
        self.state.write().name = Some(name.to_string());
    }

    /// The one-line summary.
    pub fn summary(&self) -> Option<String> {
        self.state.read().summary.clone()
    }

    /// Set the one-line summary.
    pub fn set_summary(&self, summary: &str) {
        self.state.write().summary = Some(summary.to_string());
    }

    /// The firmware branch, if not the default.
    pub fn branch(&self) -> Option<String> {
        self.state.read().branch.clone()
    }

    /// Set the firmware branch.
    pub fn set_branch(&self, branch: &str) {
        self.state.write().branch = Some(branch.to_string());
    }

    /// The vendor name.
    pub fn vendor(&self) -> Option<String> {
        self.state.read().vendor.clone()
    }

    /// Set the vendor name.
    pub fn set_vendor(&self, vendor: &str) {
        self.state.write().vendor = Some(vendor.to_string());
    }

    /// The update protocol name.
    pub fn protocol(&self) -> Option<String> {
        self.state.read().protocol.clone()
    }

    /// Set the update protocol name.
    pub fn set_protocol(&self, protocol: &str) {
        self.state.write().protocol = Some(protocol.to_string());
    }

    /// The numeric vendor ID.
    pub fn vid(&self) -> u16 {
        self.state.read().vid
    }

    /// Set the numeric vendor ID.
    pub fn set_vid(&self, vid: u16) {
        self.state.write().vid = vid;
    }

    /// The numeric product ID.
    pub fn pid(&self) -> u16 {
        self.state.read().pid
    }

    /// Set the numeric product ID.
    pub fn set_pid(&self, pid: u16) {
        self.state.write().pid = pid;
    }

    /// All vendor-ID strings, e.g. `USB:0x1234`.
    pub fn vendor_ids(&self) -> Vec<String> {
        self.state.read().vendor_ids.clone()
    }

    /// Add a vendor-ID string, duplicate-safe.
    pub fn add_vendor_id(&self, vendor_id: &str) {
        let mut state = self.state.write();
        if !state.vendor_ids.iter().any(|v| v == vendor_id) {
            state.vendor_ids.push(vendor_id.to_string());
        }
    }

    /// All icon names.
    pub fn icons(&self) -> Vec<String> {
        self.state.read().icons.clone()
    }

    /// Add an icon name, duplicate-safe.
    pub fn add_icon(&self, icon: &str) {
        let mut state = self.state.write();
        if !state.icons.iter().any(|i| i == icon) {
            state.icons.push(icon.to_string());
        }
    }

    /// All known issue identifiers, e.g. CVEs fixed by an update.
    pub fn issues(&self) -> Vec<String> {
        self.state.read().issues.clone()
    }

    /// Add an issue identifier, duplicate-safe.
    pub fn add_issue(&self, issue: &str) {
        let mut state = self.state.write();
        if !state.issues.iter().any(|i| i == issue) {
            state.issues.push(issue.to_string());
        }
    }

    /// Plugin names that might handle this device, in quirk order.
    pub fn possible_plugins(&self) -> Vec<String> {
        self.state.read().possible_plugins.clone()
    }

    /// Add a plugin name that might handle this device, duplicate-safe.
    pub fn add_possible_plugin(&self, plugin: &str) {
        let mut state = self.state.write();
        if !state.possible_plugins.iter().any(|p| p == plugin) {
            state.possible_plugins.push(plugin.to_string());
        }
    }

    // ---- metadata ----

    /// Get a free-form metadata value.
    pub fn metadata(&self, key: &str) -> Option<String> {
        self.state
            .read()
            .metadata
            .as_ref()
            .and_then(|m| m.get(key).cloned())
    }

    /// Get a metadata value parsed as boolean `true`/`false`.
    pub fn metadata_boolean(&self, key: &str) -> Option<bool> {
        match self.metadata(key)?.as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }

    /// Get a metadata value parsed as an unsigned integer.
    pub fn metadata_integer(&self, key: &str) -> Option<u64> {
        self.metadata(key)?.parse().ok()
    }

    /// Set a free-form metadata value.
    pub fn set_metadata(&self, key: &str, value: &str) {
        self.state
            .write()
            .metadata
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
    }

    /// Set a boolean metadata value.
    pub fn set_metadata_boolean(&self, key: &str, value: bool) {
        self.set_metadata(key, if value { "true" } else { "false" });
    }

    /// Set an integer metadata value.
    pub fn set_metadata_integer(&self, key: &str, value: u64) {
        self.set_metadata(key, &value.to_string());
    }

    /// Remove a metadata value.
    pub fn remove_metadata(&self, key: &str) {
        if let Some(map) = self.state.write().metadata.as_mut() {
            map.remove(key);
        }
    }

    // ---- timing ----

    /// When the device was created, in microseconds since the epoch.
    pub fn created_usec(&self) -> i64 {
        self.state.read().created_usec
    }

    /// Set the creation time; 0 or a value beyond the sanity threshold.
    pub fn set_created_usec(&self, created_usec: i64) {
        if created_usec != 0 && created_usec <= TIMESTAMP_SANITY_USEC {
            warn!("ignoring suspicious created timestamp {created_usec}, seconds instead of usec?");
            return;
        }
        self.state.write().created_usec = created_usec;
    }

    /// When the device was last modified, in microseconds since the epoch.
    pub fn modified_usec(&self) -> i64 {
        self.state.read().modified_usec
    }

    /// Set the modification time; 0 or a value beyond the sanity threshold.
    pub fn set_modified_usec(&self, modified_usec: i64) {
        if modified_usec != 0 && modified_usec <= TIMESTAMP_SANITY_USEC {
            warn!(
                "ignoring suspicious modified timestamp {modified_usec}, seconds instead of usec?"
            );
            return;
        }
        self.state.write().modified_usec = modified_usec;
    }

    /// Maximum expected replug delay in milliseconds.
    pub fn remove_delay(&self) -> u32 {
        self.state.read().remove_delay_ms
    }

    /// Set the maximum expected replug delay in milliseconds.
    pub fn set_remove_delay(&self, delay_ms: u32) {
        self.state.write().remove_delay_ms = delay_ms;
    }

    /// Time to wait for the device to settle after an update.
    pub fn acquiesce_delay(&self) -> u32 {
        self.state.read().acquiesce_delay_ms
    }

    /// Set the settle delay in milliseconds.
    pub fn set_acquiesce_delay(&self, delay_ms: u32) {
        self.state.write().acquiesce_delay_ms = delay_ms;
    }

    /// Expected install duration in seconds, for client display.
    pub fn install_duration(&self) -> u32 {
        self.state.read().install_duration_s
    }

    /// Set the expected install duration in seconds.
    pub fn set_install_duration(&self, duration_s: u32) {
        self.state.write().install_duration_s = duration_s;
    }

    /// Device priority when several devices are equivalent.
    pub fn priority(&self) -> u32 {
        self.state.read().priority
    }

    /// Set the device priority.
    pub fn set_priority(&self, priority: u32) {
        self.state.write().priority = priority;
    }

    /// Explicit install ordering relative to other devices.
    pub fn order(&self) -> i32 {
        self.state.read().order
    }

    /// Set the explicit install ordering.
    pub fn set_order(&self, order: i32) {
        self.state.write().order = order;
    }

    // ---- update fields ----

    /// The message shown to the user after an update.
    pub fn update_message(&self) -> Option<String> {
        self.state.read().update_message.clone()
    }

    /// Set the post-update user message.
    pub fn set_update_message(&self, message: &str) {
        self.state.write().update_message = Some(message.to_string());
    }

    /// The image URL shown with the post-update message.
    pub fn update_image(&self) -> Option<String> {
        self.state.read().update_image.clone()
    }

    /// Set the post-update image URL.
    pub fn set_update_image(&self, image: &str) {
        self.state.write().update_image = Some(image.to_string());
    }

    /// The stable request ID used for the synthesized post-update request.
    pub fn update_request_id(&self) -> Option<String> {
        self.state.read().update_request_id.clone()
    }

    /// Set the stable request ID for the synthesized post-update request.
    pub fn set_update_request_id(&self, request_id: &str) {
        self.state.write().update_request_id = Some(request_id.to_string());
    }

    /// The aggregate reason the device cannot be updated, if inhibited.
    pub fn update_error(&self) -> Option<String> {
        self.state.read().update_error.clone()
    }

    pub(crate) fn set_update_error(&self, error: Option<String>) {
        self.state.write().update_error = error;
    }

    /// The result of the last update attempt.
    pub fn update_state(&self) -> UpdateState {
        self.state.read().update_state
    }

    /// Set the result of the last update attempt.
    pub fn set_update_state(&self, update_state: UpdateState) {
        self.state.write().update_state = update_state;
    }

    /// Minimum accepted firmware size in bytes, 0 for no limit.
    pub fn firmware_size_min(&self) -> u64 {
        self.state.read().firmware_size_min
    }

    /// Set the minimum accepted firmware size in bytes.
    pub fn set_firmware_size_min(&self, size: u64) {
        self.state.write().firmware_size_min = size;
    }

    /// Maximum accepted firmware size in bytes, 0 for no limit.
    pub fn firmware_size_max(&self) -> u64 {
        self.state.read().firmware_size_max
    }

    /// Set the maximum accepted firmware size in bytes.
    pub fn set_firmware_size_max(&self, size: u64) {
        self.state.write().firmware_size_max = size;
    }

    /// Set both firmware size bounds to an exact value.
    pub fn set_firmware_size(&self, size: u64) {
        let mut state = self.state.write();
        state.firmware_size_min = size;
        state.firmware_size_max = size;
    }

    /// Free space required on the device to apply an update.
    pub fn required_free(&self) -> u64 {
        self.state.read().required_free
    }

    /// Set the free space required to apply an update.
    pub fn set_required_free(&self, required_free: u64) {
        self.state.write().required_free = required_free;
    }

    // ---- versions ----

    /// The current firmware version string.
    pub fn version(&self) -> Option<String> {
        self.state.read().version.clone()
    }

    /// Set the current firmware version string.
    pub fn set_version(&self, version: &str) {
        self.state.write().version = Some(version.to_string());
    }

    /// The lowest installable firmware version.
    pub fn version_lowest(&self) -> Option<String> {
        self.state.read().version_lowest.clone()
    }

    /// Set the lowest installable firmware version.
    pub fn set_version_lowest(&self, version: &str) {
        self.state.write().version_lowest = Some(version.to_string());
    }

    /// The bootloader version string.
    pub fn version_bootloader(&self) -> Option<String> {
        self.state.read().version_bootloader.clone()
    }

    /// Set the bootloader version string.
    pub fn set_version_bootloader(&self, version: &str) {
        self.state.write().version_bootloader = Some(version.to_string());
    }

    /// The raw integer form of the current version.
    pub fn version_raw(&self) -> u64 {
        self.state.read().version_raw
    }

    /// Set the current version from its raw integer form.
    ///
    /// The string form comes from the subclass `convert_version` hook if
    /// implemented, else from the device version format.
    pub fn set_version_raw(&self, raw: u64) {
        self.state.write().version_raw = raw;
        let version = self
            .hooks
            .convert_version(self, raw)
            .unwrap_or_else(|| self.version_format().render(raw));
        self.set_version(&version);
    }

    /// Set the lowest installable version from its raw integer form.
    pub fn set_version_lowest_raw(&self, raw: u64) {
        self.state.write().version_lowest_raw = raw;
        let version = self
            .hooks
            .convert_version(self, raw)
            .unwrap_or_else(|| self.version_format().render(raw));
        self.set_version_lowest(&version);
    }

    /// Set the bootloader version from its raw integer form.
    pub fn set_version_bootloader_raw(&self, raw: u64) {
        self.state.write().version_bootloader_raw = raw;
        let version = self
            .hooks
            .convert_version(self, raw)
            .unwrap_or_else(|| self.version_format().render(raw));
        self.set_version_bootloader(&version);
    }

    /// The version rendering format.
    pub fn version_format(&self) -> VersionFormat {
        self.state.read().version_format
    }

    /// Set the version rendering format, re-rendering any raw versions.
    pub fn set_version_format(&self, format: VersionFormat) {
        let (old, raw, lowest_raw, bootloader_raw) = {
            let mut state = self.state.write();
            let old = state.version_format;
            if old == format {
                return;
            }
            state.version_format = format;
            (
                old,
                state.version_raw,
                state.version_lowest_raw,
                state.version_bootloader_raw,
            )
        };
        debug!(
            "changing version format for {}: {old}->{format}",
            self.id_or_unset()
        );
        if raw != 0 {
            self.set_version_raw(raw);
        }
        if lowest_raw != 0 {
            self.set_version_lowest_raw(lowest_raw);
        }
        if bootloader_raw != 0 {
            self.set_version_bootloader_raw(bootloader_raw);
        }
    }

    // ---- battery ----

    /// Device battery percentage, falling back to the parent when the
    /// `use-parent-for-battery` private flag is set.
    pub fn battery_level(&self) -> u32 {
        let own = self.state.read().battery_level;
        if own == BATTERY_LEVEL_INVALID
            && self.has_private_flag(private_flags::USE_PARENT_FOR_BATTERY)
            && let Some(parent) = self.parent()
        {
            return parent.battery_level();
        }
        own
    }

    /// Set the device battery percentage, recomputing the power inhibit.
    pub fn set_battery_level(&self, level: u32) {
        if level > BATTERY_LEVEL_INVALID {
            warn!("ignoring battery level {level}%");
            return;
        }
        self.state.write().battery_level = level;
        self.ensure_battery_inhibit();
    }

    /// Minimum device battery percentage required for updates, with the
    /// same parent fallback as the level.
    pub fn battery_threshold(&self) -> u32 {
        let own = self.state.read().battery_threshold;
        if own == BATTERY_LEVEL_INVALID
            && self.has_private_flag(private_flags::USE_PARENT_FOR_BATTERY)
            && let Some(parent) = self.parent()
        {
            return parent.battery_threshold();
        }
        own
    }

    /// Set the minimum battery percentage, recomputing the power inhibit.
    pub fn set_battery_threshold(&self, threshold: u32) {
        if threshold > BATTERY_LEVEL_INVALID {
            warn!("ignoring battery threshold {threshold}%");
            return;
        }
        self.state.write().battery_threshold = threshold;
        self.ensure_battery_inhibit();
    }

    // ---- exported flags ----

    /// Check an exported flag; for compound sets, checks all bits.
    pub fn has_flag(&self, flag: DeviceFlags) -> bool {
        self.state.read().flags.contains(flag)
    }

    /// All exported flags.
    pub fn flags(&self) -> DeviceFlags {
        self.state.read().flags
    }

    /// Whether the device is updatable now or merely inhibited.
    pub fn is_updatable(&self) -> bool {
        let state = self.state.read();
        state.flags.contains(DeviceFlags::UPDATABLE)
            || state.flags.contains(DeviceFlags::UPDATABLE_HIDDEN)
    }

    /// Whether the device is replaying a recorded session.
    pub fn is_emulated(&self) -> bool {
        self.has_flag(DeviceFlags::EMULATED)
    }

    /// Add an exported flag, applying the cross-cutting flag rules.
    pub fn add_flag(&self, flag: DeviceFlags) {
        if flag.is_empty() {
            return;
        }

        // emulated devices do not need a replug or shutdown, and can
        // never be tagged for recording
        if flag.contains(DeviceFlags::EMULATED) {
            if self.has_flag(DeviceFlags::NEEDS_REBOOT) {
                debug!("removing needs-reboot for emulated device");
                self.remove_flag(DeviceFlags::NEEDS_REBOOT);
            }
            if self.has_flag(DeviceFlags::NEEDS_SHUTDOWN) {
                debug!("removing needs-shutdown for emulated device");
                self.remove_flag(DeviceFlags::NEEDS_SHUTDOWN);
            }
            self.remove_flag(DeviceFlags::CAN_EMULATION_TAG);
        }
        if flag.contains(DeviceFlags::CAN_EMULATION_TAG) && self.has_flag(DeviceFlags::EMULATED) {
            return;
        }

        // mutually exclusive pairs
        if flag.contains(DeviceFlags::NEEDS_BOOTLOADER) {
            self.remove_flag(DeviceFlags::IS_BOOTLOADER);
        }
        if flag.contains(DeviceFlags::IS_BOOTLOADER) {
            self.remove_flag(DeviceFlags::NEEDS_BOOTLOADER);
        }
        if flag.contains(DeviceFlags::SIGNED_PAYLOAD) {
            self.remove_flag(DeviceFlags::UNSIGNED_PAYLOAD);
        }
        if flag.contains(DeviceFlags::UNSIGNED_PAYLOAD) {
            self.remove_flag(DeviceFlags::SIGNED_PAYLOAD);
        }

        // one implies the other
        let mut flag = flag;
        if flag.contains(DeviceFlags::CAN_VERIFY_IMAGE) {
            flag |= DeviceFlags::CAN_VERIFY;
        }
        if flag.contains(DeviceFlags::INSTALL_ALL_RELEASES) {
            flag |= DeviceFlags::VERSION_CHECK_REQUIRED;
        }

        let has_inhibits = {
            let mut state = self.state.write();
            state.flags.insert(flag);
            state.inhibits.as_ref().is_some_and(|i| !i.is_empty())
        };

        // updatable may be discovered after the inhibits were added
        if flag.contains(DeviceFlags::UPDATABLE) && has_inhibits {
            self.ensure_inhibits();
        }

        // activatable devices are not updatable until activated
        if flag.contains(DeviceFlags::NEEDS_ACTIVATION) {
            self.inhibit("needs-activation", Some("Pending activation"));
        }

        // out-of-range devices are not updatable until back in range
        if flag.contains(DeviceFlags::UNREACHABLE) {
            self.add_problem(DeviceProblem::UNREACHABLE);
        }

        // fix up a forgotten remove delay
        if flag.contains(DeviceFlags::WAIT_FOR_REPLUG) && self.remove_delay() == 0 {
            warn!(
                "wait-for-replug added to {} but the remove delay is unset",
                self.id_or_unset()
            );
            self.set_remove_delay(REMOVE_DELAY_RE_ENUMERATE_MS);
        }

        self.notify_flags_changed();
    }

    /// Remove an exported flag, releasing any flag-derived inhibit.
    pub fn remove_flag(&self, flag: DeviceFlags) {
        self.state.write().flags.remove(flag);
        if flag.contains(DeviceFlags::NEEDS_ACTIVATION) {
            self.uninhibit("needs-activation");
        }
        if flag.contains(DeviceFlags::UNREACHABLE) {
            self.uninhibit("unreachable");
        }
        self.notify_flags_changed();
    }

    pub(crate) fn notify_flags_changed(&self) {
        let observers: Vec<FlagObserver> = self
            .observers
            .flags
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for observer in observers {
            observer(self);
        }
    }

    /// Subscribe to exported-flag changes.
    pub fn subscribe_flags<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Device) + Send + Sync + 'static,
    {
        let token = self.observers.next_token();
        self.observers
            .flags
            .lock()
            .push((token, Arc::new(callback)));
        SubscriptionId(token)
    }

    /// Remove a flag-change subscription.
    pub fn unsubscribe_flags(&self, id: SubscriptionId) {
        self.observers.flags.lock().retain(|(t, _)| *t != id.0);
    }

    // ---- private flags ----

    /// Register a private flag for this device type.
    ///
    /// Call once per flag from the subclass constructor path; duplicate
    /// registration of a custom name is a loud programming error.
    pub fn register_private_flag(&self, flag: &str) {
        if DeviceFlags::from_name(flag).is_some() {
            tracing::error!(
                "{} private flag {flag} already exists as an exported flag",
                self.kind()
            );
            return;
        }
        registry::register_private_flag(self.kind(), flag);
    }

    /// Check a private flag. Unregistered names log and read as unset.
    pub fn has_private_flag(&self, flag: &str) -> bool {
        if !registry::private_flag_is_registered(self.kind(), flag) {
            warn!(
                "{} flag {flag} is unknown, use register_private_flag()",
                self.kind()
            );
            return false;
        }
        self.state.read().private_flags.contains(flag)
    }

    /// Add a private flag. Unregistered names log and no-op.
    pub fn add_private_flag(&self, flag: &str) {
        // removed devices are not updatable until re-connected
        if flag == private_flags::UNCONNECTED {
            self.inhibit("unconnected", Some("Device has been removed"));
        }

        // counterpart instance IDs already added become visible
        if flag == private_flags::COUNTERPART_VISIBLE {
            let mut state = self.state.write();
            for item in &mut state.instance_items {
                if item.flags.contains(InstanceFlags::COUNTERPART) {
                    item.flags |= InstanceFlags::VISIBLE;
                }
            }
        }

        if !registry::private_flag_is_registered(self.kind(), flag) {
            warn!(
                "{} flag {flag} is unknown, use register_private_flag()",
                self.kind()
            );
            return;
        }
        self.state.write().private_flags.insert(flag.to_string());
    }

    /// Remove a private flag. Unregistered names log and no-op.
    pub fn remove_private_flag(&self, flag: &str) {
        if flag == private_flags::UNCONNECTED {
            self.uninhibit("unconnected");
        }
        if !registry::private_flag_is_registered(self.kind(), flag) {
            warn!(
                "{} flag {flag} is unknown, use register_private_flag()",
                self.kind()
            );
            return;
        }
        self.state.write().private_flags.remove(flag);
    }

    // ---- lifecycle ----

    /// Whether the probe phase has completed.
    pub fn done_probe(&self) -> bool {
        self.state.read().done_probe
    }

    /// Whether the setup phase has completed.
    pub fn done_setup(&self) -> bool {
        self.state.read().done_setup
    }

    /// Probe the device, setting parameters that do not need it open.
    ///
    /// No-op success when already probed. A device carrying the
    /// `no-probe` private flag has excluded itself and fails immediately;
    /// the hook setting the flag mid-call fails the probe afterwards.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotSupported`] for self-excluded devices, or
    /// whatever the subclass probe hook raises.
    pub fn probe(&self) -> Result<()> {
        if self.state.read().done_probe {
            return Ok(());
        }
        if self.has_private_flag(private_flags::NO_PROBE) {
            return Err(DeviceError::not_supported("not probing"));
        }
        self.hooks.probe(self)?;
        if self.has_private_flag(private_flags::NO_PROBE) {
            return Err(DeviceError::not_supported("not probing"));
        }
        self.state.write().done_probe = true;
        Ok(())
    }

    /// Force the next probe and setup to hit the hardware again, e.g.
    /// after a hot-replug, dropping any cached session state.
    pub fn probe_invalidate(&self) {
        let mut state = self.state.write();
        state.done_probe = false;
        state.done_setup = false;
        drop(state);
        self.hooks.invalidate(self);
    }

    /// Tell the device that all probing has finished.
    pub fn probe_complete(&self) {
        self.hooks.probe_complete(self);
    }

    /// Set up the device; requires it open and the interface claimed.
    ///
    /// Runs probe if not yet done, the subclass setup hook, then setup on
    /// every child, converts instance IDs to visible GUIDs, and finally
    /// the subclass ready hook. Latches `done_setup` only when everything
    /// succeeded.
    ///
    /// # Errors
    ///
    /// Whatever probe, the hooks, or a child setup raises.
    pub fn setup(&self) -> Result<()> {
        self.probe()?;
        if self.state.read().done_setup {
            return Ok(());
        }
        self.hooks.setup(self)?;

        // the hook may have excluded the device
        if self.has_private_flag(private_flags::NO_PROBE) {
            return Err(DeviceError::not_supported("not probing"));
        }

        // children must be set up after our hook and before ready
        let children = self.children();
        for child in &children {
            child.setup()?;
        }

        self.convert_instance_ids();
        self.hooks.ready(self)?;

        self.state.write().done_setup = true;
        Ok(())
    }

    fn open_internal(&self) -> Result<()> {
        if self.open_refcount.fetch_add(1, Ordering::SeqCst) > 0 {
            return Ok(());
        }
        self.probe().map_err(|e| e.prefixed("failed to probe: "))?;
        self.ensure_id()
            .map_err(|e| e.prefixed("failed to ensure ID: "))?;

        if self.has_private_flag(private_flags::RETRY_OPEN) {
            self.retry_full(
                |device| device.hooks.open(device),
                RETRY_OPEN_COUNT,
                RETRY_OPEN_DELAY_MS,
            )
            .map_err(|e| e.prefixed("failed to retry subclass open: "))?;
        } else {
            self.hooks
                .open(self)
                .map_err(|e| e.prefixed("failed to subclass open: "))?;
        }

        self.setup().map_err(|e| e.prefixed("failed to setup: "))?;
        self.ensure_id()
            .map_err(|e| e.prefixed("failed to ensure ID: "))?;

        self.add_private_flag(private_flags::IS_OPEN);
        Ok(())
    }

    /// Open the device, running the subclass open hook on the first call.
    ///
    /// Reentrant: nested calls only increment the refcount and each must
    /// be paired with [`Device::close`]. With `use-parent-for-open` or
    /// `use-proxy-for-open` the sequence redirects to the linked device.
    ///
    /// Call [`Device::close`] even when this fails, as the device may be
    /// partially initialized.
    ///
    /// # Errors
    ///
    /// Whatever probe, ensure-id, the open hook or setup raises.
    pub fn open(&self) -> Result<()> {
        if self.has_private_flag(private_flags::USE_PARENT_FOR_OPEN) {
            let parent = self
                .parent()
                .ok_or_else(|| DeviceError::not_supported("no parent device"))?;
            return parent.open_internal();
        }
        if self.has_private_flag(private_flags::USE_PROXY_FOR_OPEN) {
            let proxy = self
                .proxy()
                .ok_or_else(|| DeviceError::not_supported("no proxy device"))?;
            proxy.open_internal()?;
        }
        self.open_internal()
    }

    fn close_internal(&self) -> Result<()> {
        let prev = self
            .open_refcount
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .map_err(|_| {
                DeviceError::nothing_to_do("cannot close device, refcount already zero")
            })?;
        if prev != 1 {
            return Ok(());
        }
        self.hooks.close(self)?;
        self.remove_private_flag(private_flags::IS_OPEN);
        Ok(())
    }

    /// Close the device, running the subclass close hook when the
    /// refcount returns to zero.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NothingToDo`] for an unbalanced close, or whatever
    /// the close hook raises.
    pub fn close(&self) -> Result<()> {
        // close self first in case the hook still needs the parent/proxy
        self.close_internal()?;

        if self.has_private_flag(private_flags::USE_PARENT_FOR_OPEN) {
            let parent = self
                .parent()
                .ok_or_else(|| DeviceError::not_supported("no parent device"))?;
            return parent.close_internal();
        }
        if self.has_private_flag(private_flags::USE_PROXY_FOR_OPEN) {
            let proxy = self
                .proxy()
                .ok_or_else(|| DeviceError::not_supported("no proxy device"))?;
            proxy.close_internal()?;
        }
        Ok(())
    }

    /// Current open refcount; nonzero while any caller holds the device.
    pub fn open_refcount(&self) -> u32 {
        self.open_refcount.load(Ordering::SeqCst)
    }

    /// Detach the device into bootloader mode.
    ///
    /// # Errors
    ///
    /// Whatever the subclass detach hook raises; trivially succeeds
    /// without one.
    pub fn detach(&self, progress: &Progress) -> Result<()> {
        self.hooks.set_progress(self, progress);
        self.hooks.detach(self, progress)
    }

    /// Attach the device back into application mode.
    ///
    /// # Errors
    ///
    /// Whatever the subclass attach hook raises; trivially succeeds
    /// without one.
    pub fn attach(&self, progress: &Progress) -> Result<()> {
        self.hooks.set_progress(self, progress);
        self.hooks.attach(self, progress)
    }

    /// Reload device state after it returned to application mode.
    ///
    /// # Errors
    ///
    /// Whatever the subclass reload hook raises.
    pub fn reload(&self) -> Result<()> {
        self.hooks.reload(self)
    }

    /// Prepare the device for an update.
    ///
    /// # Errors
    ///
    /// Whatever the subclass prepare hook raises.
    pub fn prepare(&self, progress: &Progress, flags: InstallFlags) -> Result<()> {
        self.hooks.set_progress(self, progress);
        self.hooks.prepare(self, progress, flags)
    }

    /// Clean up the device after an update.
    ///
    /// # Errors
    ///
    /// Whatever the subclass cleanup hook raises.
    pub fn cleanup(&self, progress: &Progress, flags: InstallFlags) -> Result<()> {
        self.hooks.set_progress(self, progress);
        self.hooks.cleanup(self, progress, flags)
    }

    /// Write a parsed firmware payload to the device.
    ///
    /// If the device carries an update message but the subclass emitted
    /// no post-write request, a generic "remove and re-insert" request is
    /// synthesized so the user still sees the instruction; its delivery
    /// failure aborts the write.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotSupported`] without a write hook, or whatever
    /// the hook or the request delivery raises.
    pub fn write_firmware(
        &self,
        firmware: &dyn FirmwareContainer,
        progress: &Progress,
        flags: InstallFlags,
    ) -> Result<()> {
        info!(
            "installing {} bytes onto {}",
            firmware.size(),
            self.id_or_unset()
        );
        self.hooks.set_progress(self, progress);
        self.hooks.write_firmware(self, firmware, progress, flags)?;

        // the device set an update message, possibly from a quirk, but
        // never emitted a request; guess something sensible
        if self.request_count(RequestKind::Post) == 0
            && let Some(message) = self.update_message()
        {
            let request = Request {
                kind: RequestKind::Post,
                id: Some(
                    self.update_request_id()
                        .unwrap_or_else(|| crate::progress::REQUEST_ID_REMOVE_REPLUG.to_string()),
                ),
                message: Some(message),
                image: self.update_image(),
                device_id: self.id(),
            };
            self.emit_request(request, progress)?;
        }
        Ok(())
    }

    /// Parse and validate a firmware payload for this device.
    ///
    /// Delegates to the subclass parse hook if present, else to the
    /// registered firmware container type, else to the raw container;
    /// then enforces the configured size bounds.
    ///
    /// # Errors
    ///
    /// [`DeviceError::InvalidFile`] when the size bounds are violated,
    /// reporting the exact byte delta; parse errors otherwise.
    pub fn prepare_firmware(
        &self,
        data: &[u8],
        progress: &Progress,
        flags: ParseFlags,
    ) -> Result<Box<dyn FirmwareContainer>> {
        let firmware = match self.hooks.prepare_firmware(self, data, progress, flags)? {
            Some(firmware) => firmware,
            None => {
                let mut container: Box<dyn FirmwareContainer> =
                    match self.state.read().firmware_type.clone() {
                        Some(type_name) => registry::create_container(&type_name)?,
                        None => Box::new(RawContainer::default()),
                    };
                container.parse(data, flags)?;
                container
            }
        };

        let size = firmware.size();
        if size != 0 {
            let size_max = self.firmware_size_max();
            if size_max > 0 && size > size_max {
                return Err(DeviceError::invalid_file(format!(
                    "firmware is {:#06x} bytes larger than the allowed maximum size of {size_max:#06x} bytes",
                    size - size_max
                )));
            }
            let size_min = self.firmware_size_min();
            if size_min > 0 && size < size_min {
                return Err(DeviceError::invalid_file(format!(
                    "firmware is {:#06x} bytes smaller than the allowed minimum size of {size_min:#06x} bytes",
                    size_min - size
                )));
            }
        }
        Ok(firmware)
    }

    /// Read back firmware suitable for checksum verification.
    ///
    /// Falls back to [`Device::dump_firmware`] plus container parsing
    /// when the subclass has no read hook.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotSupported`] when neither hook exists.
    pub fn read_firmware(&self, progress: &Progress) -> Result<Box<dyn FirmwareContainer>> {
        self.hooks.set_progress(self, progress);
        if let Some(firmware) = self.hooks.read_firmware(self, progress)? {
            return Ok(firmware);
        }
        let blob = self.dump_firmware(progress)?;
        let mut container: Box<dyn FirmwareContainer> =
            match self.state.read().firmware_type.clone() {
                Some(type_name) => registry::create_container(&type_name)?,
                None => Box::new(RawContainer::default()),
            };
        container.parse(&blob, ParseFlags::empty())?;
        Ok(container)
    }

    /// Dump the raw firmware image from the device.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotSupported`] without a dump hook.
    pub fn dump_firmware(&self, progress: &Progress) -> Result<Vec<u8>> {
        self.hooks.set_progress(self, progress);
        self.hooks.dump_firmware(self, progress)
    }

    /// Fetch the results of the last update attempt.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotSupported`] without a results hook.
    pub fn get_results(&self) -> Result<String> {
        self.hooks.get_results(self)
    }

    /// Activate a staged firmware update.
    ///
    /// # Errors
    ///
    /// Whatever the subclass activate hook raises.
    pub fn activate(&self, progress: &Progress) -> Result<()> {
        self.hooks.set_progress(self, progress);
        self.hooks.activate(self, progress)
    }

    /// Poll the device unless polling is paused.
    ///
    /// # Errors
    ///
    /// Whatever the subclass poll hook raises.
    pub fn poll(&self) -> Result<()> {
        if self.poll_paused.load(Ordering::SeqCst) > 0 {
            return Ok(());
        }
        self.hooks.poll(self)
    }

    /// The configured poll interval in milliseconds, 0 for no polling.
    pub fn poll_interval(&self) -> u32 {
        self.state.read().poll_interval_ms
    }

    /// Set the poll interval in milliseconds.
    pub fn set_poll_interval(&self, interval_ms: u32) {
        self.state.write().poll_interval_ms = interval_ms;
    }

    /// Re-scan the device after an external change.
    ///
    /// # Errors
    ///
    /// Whatever the subclass rescan hook raises.
    pub fn rescan(&self) -> Result<()> {
        self.hooks.rescan(self)
    }

    /// Metadata collected before an update for failure reports.
    pub fn report_metadata_pre(&self) -> Vec<(String, String)> {
        self.hooks.report_metadata_pre(self)
    }

    /// Metadata collected after an update for failure reports.
    pub fn report_metadata_post(&self) -> Vec<(String, String)> {
        self.hooks.report_metadata_post(self)
    }

    /// Bind a kernel driver to the device.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotSupported`] without a bind hook.
    pub fn bind_driver(&self, subsystem: &str, driver: &str) -> Result<()> {
        self.hooks.bind_driver(self, subsystem, driver)
    }

    /// Unbind the kernel driver from the device.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotSupported`] without an unbind hook.
    pub fn unbind_driver(&self) -> Result<()> {
        self.hooks.unbind_driver(self)
    }

    // ---- requests ----

    pub(crate) fn request_count(&self, kind: RequestKind) -> u32 {
        self.state
            .read()
            .request_counts
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }

    /// Emit an interactive request to the user.
    ///
    /// Delivered to any registered request observers, else through the
    /// progress request sender. Failure to deliver aborts the in-flight
    /// operation rather than being ignored.
    ///
    /// # Errors
    ///
    /// [`DeviceError::InvalidData`] for a request without a message,
    /// [`DeviceError::NotSupported`] when nothing can deliver it.
    pub fn emit_request(&self, request: Request, progress: &Progress) -> Result<()> {
        if request.message.is_none() {
            return Err(DeviceError::invalid_data("request message not set"));
        }
        let mut request = request;
        if request.device_id.is_none() {
            request.device_id = self.id();
        }

        let observers: Vec<RequestObserver> = self
            .observers
            .request
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        if observers.is_empty() {
            progress.send_request(&request)?;
        } else {
            for observer in observers {
                observer(&request)?;
            }
        }

        *self
            .state
            .write()
            .request_counts
            .entry(request.kind)
            .or_insert(0) += 1;
        Ok(())
    }

    /// Subscribe to interactive requests emitted by this device.
    pub fn subscribe_requests<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Request) -> Result<()> + Send + Sync + 'static,
    {
        let token = self.observers.next_token();
        self.observers
            .request
            .lock()
            .push((token, Arc::new(callback)));
        SubscriptionId(token)
    }

    /// Remove a request subscription.
    pub fn unsubscribe_requests(&self, id: SubscriptionId) {
        self.observers.request.lock().retain(|(t, _)| *t != id.0);
    }

    // ---- sleeping ----

    /// Sleep for a hardware-mandated delay.
    ///
    /// Elided entirely for emulated devices, or devices whose proxy is
    /// emulated, so replay is instantaneous and deterministic.
    pub fn sleep(&self, delay_ms: u32) {
        if self.sleep_elided() {
            return;
        }
        if delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(u64::from(delay_ms)));
        }
    }

    /// Sleep with progress updates, elided the same way as [`Device::sleep`].
    pub fn sleep_full(&self, delay_ms: u32, progress: &Progress) {
        if self.sleep_elided() {
            return;
        }
        if delay_ms > 0 {
            progress.sleep(delay_ms);
        }
    }

    fn sleep_elided(&self) -> bool {
        if self.has_flag(DeviceFlags::EMULATED) {
            return true;
        }
        self.proxy().is_some_and(|p| p.has_flag(DeviceFlags::EMULATED))
    }

    // ---- event log ----

    /// The event-redirect target, if set.
    pub fn target(&self) -> Option<DeviceRef> {
        self.state.read().target.clone()
    }

    /// Append an event to the log, following the redirect target.
    pub fn add_event(&self, event: Arc<DeviceEvent>) {
        if let Some(target) = self.target() {
            target.add_event(event);
            return;
        }
        self.events.lock().items.push(event);
    }

    /// Create a new event keyed by `id` and append it to the log.
    ///
    /// Returns the live handle for the caller to populate with the typed
    /// response fields before the real I/O runs.
    pub fn save_event(&self, id: &str) -> Arc<DeviceEvent> {
        if let Some(target) = self.target() {
            return target.save_event(id);
        }
        let event = DeviceEvent::new(id);
        debug!("saved event {id}");
        self.add_event(event.clone());
        event
    }

    /// Load the next unconsumed event, which must match `id`.
    ///
    /// Replay ordering is strict: the cursor advances monotonically and
    /// the event under it must be the one requested. The cursor wraps to
    /// the start only when it has run past the end of the log, enabling
    /// repeated full-sequence replays. Requesting an event that exists in
    /// the log but not at the cursor means the caller is replaying
    /// operations in a different order than they were recorded, which is
    /// a contract bug and reported distinctly.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotFound`]: "no events loaded" for an empty log,
    /// the distinct out-of-order report, or a plain no-such-event miss.
    pub fn load_event(&self, id: &str) -> Result<Arc<DeviceEvent>> {
        if let Some(target) = self.target() {
            return target.load_event(id);
        }
        let mut log = self.events.lock();
        if log.items.is_empty() {
            return Err(DeviceError::not_found("no events loaded"));
        }

        // support replaying the whole sequence in a loop
        if log.cursor >= log.items.len() {
            debug!("resetting event index");
            log.cursor = 0;
        }

        let id_hash = DeviceEvent::build_id(id);
        let cursor = log.cursor;
        if log.items[cursor].id() == id_hash {
            log.cursor = cursor + 1;
            return Ok(log.items[cursor].clone());
        }

        // a match anywhere else means the replay order diverged from the
        // recorded order
        if let Some(pos) = log.items.iter().position(|e| e.id() == id_hash) {
            return Err(DeviceError::not_found(format!(
                "found out-of-order event {id} at position {pos}, expected position {cursor}"
            )));
        }
        Err(DeviceError::not_found(format!("no event with ID {id}")))
    }

    /// All recorded events, following the redirect target.
    pub fn events(&self) -> Vec<Arc<DeviceEvent>> {
        if let Some(target) = self.target() {
            return target.events();
        }
        self.events.lock().items.clone()
    }

    /// Drop all recorded events and reset the read cursor, typically
    /// after persisting the log to an emulation capture.
    pub fn clear_events(&self) {
        if let Some(target) = self.target() {
            target.clear_events();
            return;
        }
        let mut log = self.events.lock();
        log.items.clear();
        log.cursor = 0;
    }

    /// Redirect future events to another device's log, migrating any
    /// already-recorded events first.
    ///
    /// A proxy's child devices all logging through the proxy produces one
    /// ordered timeline for the whole interaction instead of N
    /// independent ones.
    pub fn set_target(&self, target: Option<DeviceRef>) {
        if let Some(target) = &target {
            target.incorporate(self, crate::graph::IncorporateFlags::EVENTS);
        }
        self.state.write().target = target;
    }

    // ---- debug dump ----

    /// Multi-line debug dump of the device state.
    pub fn to_debug_string(&self) -> String {
        let state = self.state.read();
        let mut lines = vec![format!("{}:", self.kind())];
        let mut push = |key: &str, value: String| {
            lines.push(format!("  {key}: {value}"));
        };
        if let Some(id) = &state.id {
            push("DeviceId", id.clone());
        }
        if let Some(name) = &state.name {
            push("Name", name.clone());
        }
        if let Some(physical_id) = &state.physical_id {
            push("PhysicalId", physical_id.clone());
        }
        if let Some(logical_id) = &state.logical_id {
            push("LogicalId", logical_id.clone());
        }
        if let Some(backend_id) = &state.backend_id {
            push("BackendId", backend_id.clone());
        }
        if let Some(vendor) = &state.vendor {
            push("Vendor", vendor.clone());
        }
        if state.vid != 0 {
            push("Vid", format!("{:#06x}", state.vid));
        }
        if state.pid != 0 {
            push("Pid", format!("{:#06x}", state.pid));
        }
        if let Some(version) = &state.version {
            push("Version", version.clone());
        }
        if !state.flags.is_empty() {
            push("Flags", state.flags.names().join("|"));
        }
        if !state.private_flags.is_empty() {
            let mut flags: Vec<&str> = state.private_flags.iter().map(String::as_str).collect();
            flags.sort_unstable();
            push("PrivateFlags", flags.join("|"));
        }
        for item in &state.instance_items {
            let id = item.instance_id.as_deref().unwrap_or(&item.guid);
            push("InstanceId", format!("{id} <- {}", item.guid));
        }
        if let Some(inhibits) = &state.inhibits {
            for (inhibit_id, inhibit) in inhibits {
                push("Inhibit", format!("[{inhibit_id}] {}", inhibit.reason));
            }
        }
        if let Some(error) = &state.update_error {
            push("UpdateError", error.clone());
        }
        drop(state);
        for (key, value) in self.hooks.describe(self) {
            lines.push(format!("  {key}: {value}"));
        }
        lines.join("\n")
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("kind", &self.kind())
            .field("id", &self.id())
            .field("physical_id", &self.physical_id())
            .field("open_refcount", &self.open_refcount())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct CountingHooks {
        probes: AtomicU32,
        opens: AtomicU32,
        closes: AtomicU32,
        setups: AtomicU32,
        readies: AtomicU32,
        fail_opens: AtomicU32,
        exclude_in_probe: AtomicBool,
    }

    impl DeviceHooks for CountingHooks {
        fn kind(&self) -> &'static str {
            "counting-device"
        }

        fn probe(&self, device: &Device) -> Result<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if device.physical_id().is_none() {
                device.set_physical_id("usb:1-2");
            }
            if self.exclude_in_probe.load(Ordering::SeqCst) {
                device.add_private_flag(private_flags::NO_PROBE);
            }
            Ok(())
        }

        fn open(&self, _device: &Device) -> Result<()> {
            if self.fail_opens.load(Ordering::SeqCst) > 0 {
                self.fail_opens.fetch_sub(1, Ordering::SeqCst);
                return Err(DeviceError::busy("interface claimed by kernel"));
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&self, _device: &Device) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn setup(&self, _device: &Device) -> Result<()> {
            self.setups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn ready(&self, _device: &Device) -> Result<()> {
            self.readies.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn write_firmware(
            &self,
            _device: &Device,
            _firmware: &dyn FirmwareContainer,
            _progress: &Progress,
            _flags: InstallFlags,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn counting_device() -> (DeviceRef, &'static CountingHooks) {
        let hooks = Box::leak(Box::new(CountingHooks::default()));
        let device = Device::new(Box::new(HooksProxy(hooks)));
        (device, hooks)
    }

    // hands the test a stable reference to the hook counters
    struct HooksProxy(&'static CountingHooks);

    impl DeviceHooks for HooksProxy {
        fn kind(&self) -> &'static str {
            self.0.kind()
        }
        fn probe(&self, device: &Device) -> Result<()> {
            self.0.probe(device)
        }
        fn open(&self, device: &Device) -> Result<()> {
            self.0.open(device)
        }
        fn close(&self, device: &Device) -> Result<()> {
            self.0.close(device)
        }
        fn setup(&self, device: &Device) -> Result<()> {
            self.0.setup(device)
        }
        fn ready(&self, device: &Device) -> Result<()> {
            self.0.ready(device)
        }
        fn write_firmware(
            &self,
            device: &Device,
            firmware: &dyn FirmwareContainer,
            progress: &Progress,
            flags: InstallFlags,
        ) -> Result<()> {
            self.0.write_firmware(device, firmware, progress, flags)
        }
    }

    #[test]
    fn test_open_close_balance() {
        let (device, hooks) = counting_device();

        device.open().unwrap();
        device.open().unwrap();
        device.open().unwrap();
        assert_eq!(hooks.opens.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.probes.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.setups.load(Ordering::SeqCst), 1);
        assert!(device.has_private_flag(private_flags::IS_OPEN));
        assert_eq!(device.open_refcount(), 3);

        device.close().unwrap();
        device.close().unwrap();
        assert_eq!(hooks.closes.load(Ordering::SeqCst), 0);
        device.close().unwrap();
        assert_eq!(hooks.closes.load(Ordering::SeqCst), 1);
        assert!(!device.has_private_flag(private_flags::IS_OPEN));

        // unbalanced close must not go negative
        let err = device.close().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NothingToDo);
        assert_eq!(device.open_refcount(), 0);

        // a second open/close cycle fires the hooks again
        device.open().unwrap();
        assert_eq!(hooks.opens.load(Ordering::SeqCst), 2);
        device.close().unwrap();
        assert_eq!(hooks.closes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_open_retries_subclass_hook() {
        let (device, hooks) = counting_device();
        device.add_private_flag(private_flags::RETRY_OPEN);
        device.retry_set_delay(0);
        hooks.fail_opens.store(2, Ordering::SeqCst);

        device.open().unwrap();
        assert_eq!(hooks.opens.load(Ordering::SeqCst), 1);
        device.close().unwrap();
    }

    #[test]
    fn test_probe_latches_and_self_exclusion() {
        let (device, hooks) = counting_device();
        device.probe().unwrap();
        device.probe().unwrap();
        assert_eq!(hooks.probes.load(Ordering::SeqCst), 1);
        assert!(device.done_probe());

        device.probe_invalidate();
        assert!(!device.done_probe());
        assert!(!device.done_setup());

        // the hook excluding the device mid-call still fails the probe
        hooks.exclude_in_probe.store(true, Ordering::SeqCst);
        let err = device.probe().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
        assert!(!device.done_probe());
    }

    #[test]
    fn test_setup_runs_children_and_ready() {
        let (device, hooks) = counting_device();
        let (child, child_hooks) = counting_device();
        child.set_physical_id("usb:1-2.1");
        device.set_physical_id("usb:1-2");
        device.add_child(&child);

        device.setup().unwrap();
        assert!(device.done_setup());
        assert!(child.done_setup());
        assert_eq!(hooks.setups.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.readies.load(Ordering::SeqCst), 1);
        assert_eq!(child_hooks.setups.load(Ordering::SeqCst), 1);

        // latched: setup again is a no-op
        device.setup().unwrap();
        assert_eq!(hooks.setups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_physical_id_immutable_after_setup() {
        let (device, _hooks) = counting_device();
        device.set_physical_id("usb:1-2");
        device.setup().unwrap();
        device.set_physical_id("usb:9-9");
        assert_eq!(device.physical_id().as_deref(), Some("usb:1-2"));
        device.set_logical_id("late");
        assert_eq!(device.logical_id(), None);
    }

    #[test]
    fn test_flag_side_effects() {
        let device = Device::raw();

        device.add_flag(DeviceFlags::NEEDS_BOOTLOADER);
        device.add_flag(DeviceFlags::IS_BOOTLOADER);
        assert!(!device.has_flag(DeviceFlags::NEEDS_BOOTLOADER));
        assert!(device.has_flag(DeviceFlags::IS_BOOTLOADER));

        device.add_flag(DeviceFlags::SIGNED_PAYLOAD);
        device.add_flag(DeviceFlags::UNSIGNED_PAYLOAD);
        assert!(!device.has_flag(DeviceFlags::SIGNED_PAYLOAD));
        assert!(device.has_flag(DeviceFlags::UNSIGNED_PAYLOAD));

        device.add_flag(DeviceFlags::CAN_VERIFY_IMAGE);
        assert!(device.has_flag(DeviceFlags::CAN_VERIFY));

        device.set_remove_delay(5000);
        device.add_flag(DeviceFlags::NEEDS_REBOOT);
        device.add_flag(DeviceFlags::EMULATED);
        assert!(!device.has_flag(DeviceFlags::NEEDS_REBOOT));
        device.add_flag(DeviceFlags::CAN_EMULATION_TAG);
        assert!(!device.has_flag(DeviceFlags::CAN_EMULATION_TAG));
    }

    #[test]
    fn test_wait_for_replug_fixes_up_remove_delay() {
        let device = Device::raw();
        assert_eq!(device.remove_delay(), 0);
        device.add_flag(DeviceFlags::WAIT_FOR_REPLUG);
        assert_eq!(device.remove_delay(), REMOVE_DELAY_RE_ENUMERATE_MS);
    }

    #[test]
    fn test_unreachable_flag_round_trip() {
        let device = Device::raw();
        device.add_flag(DeviceFlags::UPDATABLE);
        assert!(device.is_updatable());

        device.add_flag(DeviceFlags::UNREACHABLE);
        assert!(device.has_problem(DeviceProblem::UNREACHABLE));
        assert!(!device.has_flag(DeviceFlags::UPDATABLE));
        assert!(device.has_flag(DeviceFlags::UPDATABLE_HIDDEN));
        assert!(device.is_updatable());

        device.remove_flag(DeviceFlags::UNREACHABLE);
        assert!(!device.has_problem(DeviceProblem::UNREACHABLE));
        assert!(device.has_flag(DeviceFlags::UPDATABLE));
    }

    #[test]
    fn test_write_firmware_not_supported_without_hook() {
        let device = Device::raw();
        let mut container = RawContainer::default();
        container.parse(&[0u8; 16], ParseFlags::empty()).unwrap();
        let progress = Progress::new();
        let err = device
            .write_firmware(&container, &progress, InstallFlags::empty())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }

    #[test]
    fn test_write_firmware_synthesizes_post_request() {
        let (device, _hooks) = counting_device();
        device.set_update_message("Replug the device to finish the update");
        let mut container = RawContainer::default();
        container.parse(&[0u8; 16], ParseFlags::empty()).unwrap();

        // no sender connected: the synthesized request fails the write
        let progress = Progress::new();
        let err = device
            .write_firmware(&container, &progress, InstallFlags::empty())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);

        // with a sender the generic remove-replug request is delivered
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_tx = seen.clone();
        progress.set_request_sender(move |request: &Request| {
            seen_tx.lock().push(request.clone());
            Ok(())
        });
        device
            .write_firmware(&container, &progress, InstallFlags::empty())
            .unwrap();
        let requests = seen.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].kind, RequestKind::Post);
        assert_eq!(
            requests[0].id.as_deref(),
            Some(crate::progress::REQUEST_ID_REMOVE_REPLUG)
        );
    }

    #[test]
    fn test_prepare_firmware_size_bounds() {
        let device = Device::raw();
        let progress = Progress::new();
        device.set_firmware_size_min(8);
        device.set_firmware_size_max(16);

        assert!(
            device
                .prepare_firmware(&[0u8; 12], &progress, ParseFlags::empty())
                .is_ok()
        );

        let err = device
            .prepare_firmware(&[0u8; 20], &progress, ParseFlags::empty())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFile);
        assert!(err.message().contains("0x0004 bytes larger"));

        let err = device
            .prepare_firmware(&[0u8; 4], &progress, ParseFlags::empty())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFile);
        assert!(err.message().contains("0x0004 bytes smaller"));
    }

    #[test]
    fn test_event_replay_order() {
        let device = Device::raw();
        device.save_event("A").set_i64("Value", 1);
        device.save_event("B").set_i64("Value", 2);
        device.save_event("A").set_i64("Value", 3);

        // in-order replay returns the respective payloads
        assert_eq!(device.load_event("A").unwrap().get_i64("Value").unwrap(), 1);
        assert_eq!(device.load_event("B").unwrap().get_i64("Value").unwrap(), 2);
        assert_eq!(device.load_event("A").unwrap().get_i64("Value").unwrap(), 3);

        // exhausted: the cursor wraps for a repeated full replay
        assert_eq!(device.load_event("A").unwrap().get_i64("Value").unwrap(), 1);
    }

    #[test]
    fn test_event_replay_out_of_order_is_distinct() {
        let device = Device::raw();
        device.save_event("A").set_i64("Value", 1);
        device.save_event("B").set_i64("Value", 2);
        device.save_event("A").set_i64("Value", 3);

        let err = device.load_event("B").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.message().contains("out-of-order"));

        let err = device.load_event("C").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!err.message().contains("out-of-order"));
    }

    #[test]
    fn test_event_redirect_target() {
        let device = Device::raw();
        let target = Device::raw();
        device.save_event("Before").set_i64("Value", 1);
        device.set_target(Some(target.clone()));

        // the existing event migrated, new ones follow the redirect
        device.save_event("After").set_i64("Value", 2);
        assert_eq!(target.events().len(), 2);
        assert_eq!(device.events().len(), 2);
        device.clear_events();
        assert!(target.events().is_empty());
    }

    #[test]
    fn test_close_with_use_parent_for_open() {
        let (device, hooks) = counting_device();
        let (parent, parent_hooks) = counting_device();
        parent.set_physical_id("usb:1");
        parent.add_child(&device);
        device.add_private_flag(private_flags::USE_PARENT_FOR_OPEN);

        device.open().unwrap();
        assert_eq!(parent_hooks.opens.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.opens.load(Ordering::SeqCst), 0);
        // the child itself was not opened, only the parent
        assert_eq!(device.open_refcount(), 0);

        // the façade itself holds no refcount, so its close is unbalanced
        let err = device.close().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NothingToDo);
        parent.close().unwrap();
        assert_eq!(parent_hooks.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sleep_elided_for_emulated() {
        let device = Device::raw();
        device.add_flag(DeviceFlags::EMULATED);
        let started = std::time::Instant::now();
        device.sleep(5_000);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_timestamp_sanity_guard() {
        let device = Device::raw();
        // seconds instead of microseconds is rejected
        device.set_created_usec(1_700_000_000);
        assert_eq!(device.created_usec(), 0);
        device.set_created_usec(1_700_000_000_000_000);
        assert_eq!(device.created_usec(), 1_700_000_000_000_000);
    }

    #[test]
    fn test_metadata_typed_accessors() {
        let device = Device::raw();
        device.set_metadata_boolean("seen", true);
        device.set_metadata_integer("attempts", 3);
        assert_eq!(device.metadata_boolean("seen"), Some(true));
        assert_eq!(device.metadata_integer("attempts"), Some(3));
        device.remove_metadata("seen");
        assert_eq!(device.metadata("seen"), None);
    }

    #[test]
    fn test_version_raw_uses_format() {
        let device = Device::raw();
        device.set_version_format(VersionFormat::Triplet);
        device.set_version_raw(0x01020003);
        assert_eq!(device.version().as_deref(), Some("1.2.3"));
        // changing the format re-renders the raw version
        device.set_version_format(VersionFormat::Hex);
        assert_eq!(device.version().as_deref(), Some("0x01020003"));
    }

    #[test]
    fn test_to_debug_string_mentions_identity() {
        let device = Device::raw();
        device.set_physical_id("usb:1-2");
        device.set_name("ColorHug");
        let dump = device.to_debug_string();
        assert!(dump.contains("PhysicalId: usb:1-2"));
        assert!(dump.contains("Name: ColorHug"));
    }
}
