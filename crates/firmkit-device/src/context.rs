//! Shared daemon environment.
//!
//! One [`Context`] is shared read-mostly by every device: system power
//! state, daemon-wide behavior flags, and the capability interfaces the
//! core consumes but does not implement (quirk lookup, SMBIOS strings).

use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use parking_lot::RwLock;

use firmkit_errors::prelude::*;

/// Battery percentage meaning "not known".
pub const BATTERY_LEVEL_INVALID: u32 = 101;

/// Default minimum battery percentage required for an update.
pub const BATTERY_THRESHOLD_DEFAULT: u32 = 10;

bitflags! {
    /// Daemon-wide behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[repr(transparent)]
    pub struct ContextFlags: u32 {
        /// Record an event for every boundary operation, even on
        /// non-emulated devices; used when capturing an emulation
        const SAVE_EVENTS = 1 << 0;
    }
}

/// Quirk lookup capability: key/value overrides keyed by GUID.
///
/// The lookup engine itself is an external collaborator; the core only
/// consumes the results through the quirk-key interpreter.
pub trait QuirkSource: Send + Sync {
    /// All `(key, value)` pairs registered for a GUID.
    fn lookup(&self, guid: &str) -> Vec<(String, String)>;
}

/// SMBIOS string lookup capability.
pub trait SmbiosSource: Send + Sync {
    /// Get a hardware SMBIOS string by structure type, length and offset.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotFound`] when the structure or offset is absent.
    fn string(&self, structure_type: u8, length: u8, offset: u8) -> Result<String>;
}

/// Shared configuration and environment for all devices.
#[derive(Default)]
pub struct Context {
    flags: RwLock<ContextFlags>,
    battery_level: AtomicU32,
    battery_threshold: AtomicU32,
    quirks: RwLock<Option<Box<dyn QuirkSource>>>,
    smbios: RwLock<Option<Box<dyn SmbiosSource>>>,
}

impl Context {
    /// Create a context with no capabilities attached.
    pub fn new() -> Self {
        Self {
            flags: RwLock::new(ContextFlags::empty()),
            battery_level: AtomicU32::new(BATTERY_LEVEL_INVALID),
            battery_threshold: AtomicU32::new(BATTERY_THRESHOLD_DEFAULT),
            quirks: RwLock::new(None),
            smbios: RwLock::new(None),
        }
    }

    /// Add a daemon-wide flag.
    pub fn add_flag(&self, flag: ContextFlags) {
        self.flags.write().insert(flag);
    }

    /// Remove a daemon-wide flag.
    pub fn remove_flag(&self, flag: ContextFlags) {
        self.flags.write().remove(flag);
    }

    /// Check a daemon-wide flag.
    pub fn has_flag(&self, flag: ContextFlags) -> bool {
        self.flags.read().contains(flag)
    }

    /// System battery percentage, or [`BATTERY_LEVEL_INVALID`].
    pub fn battery_level(&self) -> u32 {
        self.battery_level.load(Ordering::Relaxed)
    }

    /// Set the system battery percentage.
    pub fn set_battery_level(&self, level: u32) {
        self.battery_level.store(level, Ordering::Relaxed);
    }

    /// Minimum system battery percentage required for updates.
    pub fn battery_threshold(&self) -> u32 {
        self.battery_threshold.load(Ordering::Relaxed)
    }

    /// Set the minimum system battery percentage required for updates.
    pub fn set_battery_threshold(&self, threshold: u32) {
        self.battery_threshold.store(threshold, Ordering::Relaxed);
    }

    /// Whether the system battery is known to be below the threshold.
    pub fn system_power_too_low(&self) -> bool {
        let level = self.battery_level();
        level != BATTERY_LEVEL_INVALID && level < self.battery_threshold()
    }

    /// Attach the quirk lookup capability.
    pub fn set_quirk_source(&self, source: Box<dyn QuirkSource>) {
        *self.quirks.write() = Some(source);
    }

    /// Look up all quirk key/values for a GUID; empty without a source.
    pub fn lookup_quirks(&self, guid: &str) -> Vec<(String, String)> {
        match self.quirks.read().as_ref() {
            Some(source) => source.lookup(guid),
            None => Vec::new(),
        }
    }

    /// Attach the SMBIOS lookup capability.
    pub fn set_smbios_source(&self, source: Box<dyn SmbiosSource>) {
        *self.smbios.write() = Some(source);
    }

    /// Get a hardware SMBIOS string.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotSupported`] without a source attached, otherwise
    /// whatever the source raises.
    pub fn smbios_string(&self, structure_type: u8, length: u8, offset: u8) -> Result<String> {
        match self.smbios.read().as_ref() {
            Some(source) => source.string(structure_type, length, offset),
            None => Err(DeviceError::not_supported("no SMBIOS data loaded")),
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("flags", &*self.flags.read())
            .field("battery_level", &self.battery_level())
            .field("battery_threshold", &self.battery_threshold())
            .finish()
    }
}
