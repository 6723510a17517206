//! The subclass contract.
//!
//! Concrete device types implement [`DeviceHooks`]; the core owns the
//! calling order and the invariants between calls. Every method has a
//! default, so a subclass implements only what its hardware needs: the
//! default is a trivial success where skipping is harmless (detach on a
//! device with no bootloader mode) and `NotSupported` where the caller
//! must know the capability is absent (writing firmware).

use firmkit_errors::prelude::*;

use crate::device::{Device, DeviceRef};
use crate::firmware::{FirmwareContainer, InstallFlags, ParseFlags};
use crate::progress::Progress;

/// Device-specific behavior supplied by a concrete device type.
///
/// Hooks receive the owning [`Device`] and mutate its state through the
/// normal accessors; subclass-local state lives in the implementing
/// struct behind interior mutability.
pub trait DeviceHooks: Send + Sync {
    /// Stable name of the concrete device type.
    ///
    /// Keys the private-flag registry, so every subclass sharing a flag
    /// vocabulary must return the same name.
    fn kind(&self) -> &'static str {
        "device"
    }

    /// Set parameters that do not need the device open.
    ///
    /// # Errors
    ///
    /// Any error marks the device incompatible and aborts enumeration.
    fn probe(&self, _device: &Device) -> Result<()> {
        Ok(())
    }

    /// Set parameters that require the device open and claimed.
    ///
    /// # Errors
    ///
    /// Any error aborts setup; `done_setup` is not latched.
    fn setup(&self, _device: &Device) -> Result<()> {
        Ok(())
    }

    /// Called after setup and all child setups have completed.
    ///
    /// # Errors
    ///
    /// Any error aborts setup; `done_setup` is not latched.
    fn ready(&self, _device: &Device) -> Result<()> {
        Ok(())
    }

    /// Open the hardware connection. Called only on the 0→1 refcount edge.
    ///
    /// # Errors
    ///
    /// Any error aborts the open; with the `retry-open` private flag the
    /// core retries a bounded number of times first.
    fn open(&self, _device: &Device) -> Result<()> {
        Ok(())
    }

    /// Close the hardware connection. Called only on the 1→0 refcount edge.
    ///
    /// # Errors
    ///
    /// Any error propagates to the caller of `close`.
    fn close(&self, _device: &Device) -> Result<()> {
        Ok(())
    }

    /// Put the device into bootloader mode.
    ///
    /// # Errors
    ///
    /// Any error aborts the update.
    fn detach(&self, _device: &Device, _progress: &Progress) -> Result<()> {
        Ok(())
    }

    /// Return the device from bootloader to application mode.
    ///
    /// # Errors
    ///
    /// Any error aborts the update.
    fn attach(&self, _device: &Device, _progress: &Progress) -> Result<()> {
        Ok(())
    }

    /// Refresh cached state after the device returned to application mode.
    ///
    /// # Errors
    ///
    /// Any error aborts the update.
    fn reload(&self, _device: &Device) -> Result<()> {
        Ok(())
    }

    /// Prepare the device for an update, before detach.
    ///
    /// # Errors
    ///
    /// Any error aborts the update before anything was written.
    fn prepare(&self, _device: &Device, _progress: &Progress, _flags: InstallFlags) -> Result<()> {
        Ok(())
    }

    /// Clean up after an update, after attach.
    ///
    /// # Errors
    ///
    /// Any error is reported but the firmware has already been written.
    fn cleanup(&self, _device: &Device, _progress: &Progress, _flags: InstallFlags) -> Result<()> {
        Ok(())
    }

    /// Write a parsed firmware payload to the device.
    ///
    /// # Errors
    ///
    /// The default reports the capability as absent.
    fn write_firmware(
        &self,
        _device: &Device,
        _firmware: &dyn FirmwareContainer,
        _progress: &Progress,
        _flags: InstallFlags,
    ) -> Result<()> {
        Err(DeviceError::not_supported(
            "writing firmware not supported by device",
        ))
    }

    /// Parse a firmware payload, e.g. to strip a vendor header.
    ///
    /// Return `None` to use the registered container type, or the raw
    /// container as the final fallback.
    ///
    /// # Errors
    ///
    /// [`DeviceError::InvalidFile`] for malformed payloads.
    fn prepare_firmware(
        &self,
        _device: &Device,
        _data: &[u8],
        _progress: &Progress,
        _flags: ParseFlags,
    ) -> Result<Option<Box<dyn FirmwareContainer>>> {
        Ok(None)
    }

    /// Read back firmware suitable for checksum verification.
    ///
    /// Return `None` to fall back to [`DeviceHooks::dump_firmware`] plus
    /// container parsing.
    ///
    /// # Errors
    ///
    /// Any device-specific read failure.
    fn read_firmware(
        &self,
        _device: &Device,
        _progress: &Progress,
    ) -> Result<Option<Box<dyn FirmwareContainer>>> {
        Ok(None)
    }

    /// Dump the raw firmware image, byte-for-byte.
    ///
    /// # Errors
    ///
    /// The default reports the capability as absent.
    fn dump_firmware(&self, _device: &Device, _progress: &Progress) -> Result<Vec<u8>> {
        Err(DeviceError::not_supported(
            "dumping firmware is not supported by device",
        ))
    }

    /// Fetch the results of the last update attempt.
    ///
    /// # Errors
    ///
    /// The default reports the capability as absent.
    fn get_results(&self, _device: &Device) -> Result<String> {
        Err(DeviceError::not_supported(
            "getting results not supported by device",
        ))
    }

    /// Activate a staged firmware update.
    ///
    /// # Errors
    ///
    /// Any device-specific activation failure.
    fn activate(&self, _device: &Device, _progress: &Progress) -> Result<()> {
        Ok(())
    }

    /// Periodic poll for devices needing it.
    ///
    /// # Errors
    ///
    /// Any device-specific poll failure.
    fn poll(&self, _device: &Device) -> Result<()> {
        Ok(())
    }

    /// Re-scan the device after an external change.
    ///
    /// # Errors
    ///
    /// Any device-specific rescan failure.
    fn rescan(&self, _device: &Device) -> Result<()> {
        Ok(())
    }

    /// Bind a kernel driver to the device.
    ///
    /// # Errors
    ///
    /// The default reports the capability as absent.
    fn bind_driver(&self, _device: &Device, _subsystem: &str, _driver: &str) -> Result<()> {
        Err(DeviceError::not_supported(
            "binding drivers is not supported by device",
        ))
    }

    /// Unbind the kernel driver from the device.
    ///
    /// # Errors
    ///
    /// The default reports the capability as absent.
    fn unbind_driver(&self, _device: &Device) -> Result<()> {
        Err(DeviceError::not_supported(
            "unbinding drivers is not supported by device",
        ))
    }

    /// Convert a raw integer version to a display string.
    ///
    /// Return `None` to use the device version format.
    fn convert_version(&self, _device: &Device, _raw: u64) -> Option<String> {
        None
    }

    /// Copy subclass-specific fields from a donor, only where unset.
    fn incorporate(&self, _device: &Device, _donor: &Device) {}

    /// Copy state from a disconnected predecessor device object.
    fn replace(&self, _device: &Device, _donor: &Device) {}

    /// Drop cached hardware-session state after probe invalidation.
    fn invalidate(&self, _device: &Device) {}

    /// All probing has finished; release coldplug-only resources.
    fn probe_complete(&self, _device: &Device) {}

    /// Interpret a device-specific quirk key.
    ///
    /// Called only for keys the core vocabulary does not cover.
    ///
    /// # Errors
    ///
    /// The default reports the key as unsupported.
    fn set_quirk_kv(&self, _device: &Device, key: &str, _value: &str) -> Result<()> {
        Err(DeviceError::not_supported(format!(
            "quirk key {key} not supported"
        )))
    }

    /// The progress object for the current operation changed.
    fn set_progress(&self, _device: &Device, _progress: &Progress) {}

    /// Metadata useful for debugging a failed update, collected before
    /// the update starts.
    fn report_metadata_pre(&self, _device: &Device) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Metadata useful for debugging a failed update, collected after
    /// the update finished.
    fn report_metadata_post(&self, _device: &Device) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Extra `key: value` lines for the debug dump.
    fn describe(&self, _device: &Device) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Subclass extension block for the persisted snapshot.
    fn to_json(&self, _device: &Device) -> Option<serde_json::Value> {
        None
    }

    /// Restore subclass state from the persisted snapshot.
    ///
    /// # Errors
    ///
    /// [`DeviceError::InvalidData`] for malformed extension blocks.
    fn from_json(&self, _device: &Device, _value: &serde_json::Value) -> Result<()> {
        Ok(())
    }
}

/// The hook set of a plain device with no subclass behavior.
#[derive(Debug, Default)]
pub struct RawHooks;

impl DeviceHooks for RawHooks {}

/// A backend enumerates devices from one transport (USB, PCI, BMC, ...).
///
/// Devices hold a weak reference to the backend that created them; the
/// backend may be asked to resolve the physically enclosing device.
pub trait Backend: Send + Sync {
    /// Stable backend name, e.g. `usb`.
    fn name(&self) -> &str;

    /// Resolve the enclosing parent device, optionally constrained to a
    /// subsystem.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotFound`] when no parent exists,
    /// [`DeviceError::NotSupported`] when the backend cannot resolve
    /// parents.
    fn get_device_parent(&self, device: &Device, subsystem: Option<&str>) -> Result<DeviceRef>;
}
