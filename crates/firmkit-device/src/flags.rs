//! Exported device flags, device problems and instance-ID flags.
//!
//! Exported flags are the fixed, universally-known capability vocabulary
//! shared with clients. Private flags are open-ended string-named toggles
//! registered per concrete device type; see [`crate::registry`].

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Exported device capability and state flags.
    ///
    /// The bit layout is stable: flags are persisted by name, never by
    /// value, so new flags may only claim currently unused bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[repr(transparent)]
    pub struct DeviceFlags: u64 {
        /// Device should not be shown to the user
        const INTERNAL = 1 << 0;
        /// Device is allowed to receive firmware updates
        const UPDATABLE = 1 << 1;
        /// Device would be updatable but is currently inhibited
        const UPDATABLE_HIDDEN = 1 << 2;
        /// Device is replaying a recorded event log instead of real hardware
        const EMULATED = 1 << 3;
        /// Device may be tagged for event recording
        const CAN_EMULATION_TAG = 1 << 4;
        /// The system needs a reboot to apply the new firmware
        const NEEDS_REBOOT = 1 << 5;
        /// The system needs a shutdown to apply the new firmware
        const NEEDS_SHUTDOWN = 1 << 6;
        /// Device must be put in bootloader mode before updating
        const NEEDS_BOOTLOADER = 1 << 7;
        /// Device is currently in bootloader mode
        const IS_BOOTLOADER = 1 << 8;
        /// Device disappears during update and re-enumerates
        const WAIT_FOR_REPLUG = 1 << 9;
        /// Firmware payloads are cryptographically signed
        const SIGNED_PAYLOAD = 1 << 10;
        /// Firmware payloads are not signed
        const UNSIGNED_PAYLOAD = 1 << 11;
        /// Firmware checksum can be verified against metadata
        const CAN_VERIFY = 1 << 12;
        /// Firmware image can be read back for verification
        const CAN_VERIFY_IMAGE = 1 << 13;
        /// Device is out of wireless range or otherwise unreachable
        const UNREACHABLE = 1 << 14;
        /// A staged update is waiting for activation
        const NEEDS_ACTIVATION = 1 << 15;
        /// Version checks are required when installing
        const VERSION_CHECK_REQUIRED = 1 << 16;
        /// All intermediate releases must be installed in order
        const INSTALL_ALL_RELEASES = 1 << 17;
    }
}

impl DeviceFlags {
    const NAMES: &'static [(DeviceFlags, &'static str)] = &[
        (Self::INTERNAL, "internal"),
        (Self::UPDATABLE, "updatable"),
        (Self::UPDATABLE_HIDDEN, "updatable-hidden"),
        (Self::EMULATED, "emulated"),
        (Self::CAN_EMULATION_TAG, "can-emulation-tag"),
        (Self::NEEDS_REBOOT, "needs-reboot"),
        (Self::NEEDS_SHUTDOWN, "needs-shutdown"),
        (Self::NEEDS_BOOTLOADER, "needs-bootloader"),
        (Self::IS_BOOTLOADER, "is-bootloader"),
        (Self::WAIT_FOR_REPLUG, "wait-for-replug"),
        (Self::SIGNED_PAYLOAD, "signed-payload"),
        (Self::UNSIGNED_PAYLOAD, "unsigned-payload"),
        (Self::CAN_VERIFY, "can-verify"),
        (Self::CAN_VERIFY_IMAGE, "can-verify-image"),
        (Self::UNREACHABLE, "unreachable"),
        (Self::NEEDS_ACTIVATION, "needs-activation"),
        (Self::VERSION_CHECK_REQUIRED, "version-check-required"),
        (Self::INSTALL_ALL_RELEASES, "install-all-releases"),
    ];

    /// Look up a single flag from its kebab-case name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(flag, _)| *flag)
    }

    /// The kebab-case name of a single flag, or `None` for compound sets.
    pub fn name(&self) -> Option<&'static str> {
        Self::NAMES
            .iter()
            .find(|(flag, _)| flag == self)
            .map(|(_, n)| *n)
    }

    /// All set flags as kebab-case names, for export and debug dumps.
    pub fn names(&self) -> Vec<&'static str> {
        self.iter().filter_map(|f| f.name()).collect()
    }
}

bitflags! {
    /// Named problems preventing a device from being updated.
    ///
    /// The aggregate problem set is derived from the inhibit map and
    /// republished whenever the map changes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[repr(transparent)]
    pub struct DeviceProblem: u64 {
        /// Device is unreachable or out of wireless range
        const UNREACHABLE = 1 << 0;
        /// An update is already pending and waiting to be applied
        const UPDATE_PENDING = 1 << 1;
        /// AC power must be connected
        const REQUIRE_AC_POWER = 1 << 2;
        /// The laptop lid is closed
        const LID_IS_CLOSED = 1 << 3;
        /// Device is emulated and cannot be updated for real
        const IS_EMULATED = 1 << 4;
        /// Another update is in progress
        const UPDATE_IN_PROGRESS = 1 << 5;
        /// Device is in use
        const IN_USE = 1 << 6;
        /// A display must be plugged in
        const DISPLAY_REQUIRED = 1 << 7;
        /// An equivalent device has a higher priority
        const LOWER_PRIORITY = 1 << 8;
        /// A required license is not installed
        const MISSING_LICENSE = 1 << 9;
        /// System battery is below the system threshold
        const SYSTEM_POWER_TOO_LOW = 1 << 10;
        /// Device battery is below the device threshold
        const POWER_TOO_LOW = 1 << 11;
    }
}

impl DeviceProblem {
    const NAMES: &'static [(DeviceProblem, &'static str)] = &[
        (Self::UNREACHABLE, "unreachable"),
        (Self::UPDATE_PENDING, "update-pending"),
        (Self::REQUIRE_AC_POWER, "require-ac-power"),
        (Self::LID_IS_CLOSED, "lid-is-closed"),
        (Self::IS_EMULATED, "is-emulated"),
        (Self::UPDATE_IN_PROGRESS, "update-in-progress"),
        (Self::IN_USE, "in-use"),
        (Self::DISPLAY_REQUIRED, "display-required"),
        (Self::LOWER_PRIORITY, "lower-priority"),
        (Self::MISSING_LICENSE, "missing-license"),
        (Self::SYSTEM_POWER_TOO_LOW, "system-power-too-low"),
        (Self::POWER_TOO_LOW, "power-too-low"),
    ];

    /// The kebab-case name of a single problem, or `None` for compound sets.
    pub fn name(&self) -> Option<&'static str> {
        Self::NAMES
            .iter()
            .find(|(problem, _)| problem == self)
            .map(|(_, n)| *n)
    }
}

bitflags! {
    /// Flags attached to each instance-ID entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[repr(transparent)]
    pub struct InstanceFlags: u8 {
        /// Exported to clients and converted to a visible GUID
        const VISIBLE = 1 << 0;
        /// Used for quirk-database matching
        const QUIRKS = 1 << 1;
        /// Too generic to identify the device uniquely
        const GENERIC = 1 << 2;
        /// The same device in the other (bootloader/runtime) mode
        const COUNTERPART = 1 << 3;
    }
}

/// Private flags registered for every device type.
pub mod private_flags {
    /// The device has completed probe, open and setup
    pub const IS_OPEN: &str = "is-open";
    /// The device excluded itself from probing
    pub const NO_PROBE: &str = "no-probe";
    /// Retry the subclass open hook on failure
    pub const RETRY_OPEN: &str = "retry-open";
    /// Inhibits and uninhibits recurse into child devices
    pub const INHIBIT_CHILDREN: &str = "inhibit-children";
    /// Open and close redirect to the parent device
    pub const USE_PARENT_FOR_OPEN: &str = "use-parent-for-open";
    /// Open and close also open the proxy device
    pub const USE_PROXY_FOR_OPEN: &str = "use-proxy-for-open";
    /// Battery level and threshold fall back to the parent
    pub const USE_PARENT_FOR_BATTERY: &str = "use-parent-for-battery";
    /// Fall back to the proxy device when one is set
    pub const USE_PROXY_FALLBACK: &str = "use-proxy-fallback";
    /// Hold a strong reference to the proxy and log events through it
    pub const REFCOUNTED_PROXY: &str = "refcounted-proxy";
    /// Drop GENERIC-flagged instance IDs when converting to GUIDs
    pub const NO_GENERIC_GUIDS: &str = "no-generic-guids";
    /// COUNTERPART instance IDs are also made VISIBLE
    pub const COUNTERPART_VISIBLE: &str = "counterpart-visible";
    /// The backing hardware has been removed
    pub const UNCONNECTED: &str = "unconnected";
    /// Ignore the system power level when computing inhibits
    pub const IGNORE_SYSTEM_POWER: &str = "ignore-system-power";

    /// The baseline set registered implicitly for every device type.
    pub const BASELINE: &[&str] = &[
        IS_OPEN,
        NO_PROBE,
        RETRY_OPEN,
        INHIBIT_CHILDREN,
        USE_PARENT_FOR_OPEN,
        USE_PROXY_FOR_OPEN,
        USE_PARENT_FOR_BATTERY,
        USE_PROXY_FALLBACK,
        REFCOUNTED_PROXY,
        NO_GENERIC_GUIDS,
        COUNTERPART_VISIBLE,
        UNCONNECTED,
        IGNORE_SYSTEM_POWER,
    ];
}
