//! Persisted device snapshots.
//!
//! One structured record serves both normal status export and emulation
//! captures: identity, versions, flags, the recorded event log, and an
//! opaque subclass extension block. Timestamps render as ISO-8601.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use firmkit_errors::prelude::*;

use crate::device::{Device, UpdateState};
use crate::event::{DeviceEvent, EventRecord};
use crate::flags::DeviceFlags;
use crate::version::VersionFormat;

/// The serializable shape of a device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DeviceSnapshot {
    /// Creation time, ISO-8601
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    /// Canonical device ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Physical ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_id: Option<String>,
    /// Logical ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logical_id: Option<String>,
    /// Backend ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
    /// Device name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Vendor name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    /// Numeric vendor ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vid: Option<u16>,
    /// Numeric product ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u16>,
    /// Version string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Bootloader version string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_bootloader: Option<String>,
    /// Version rendering format
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_format: Option<VersionFormat>,
    /// Exported flags by name
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    /// Visible GUIDs
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub guids: Vec<String>,
    /// Visible instance IDs
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub instance_ids: Vec<String>,
    /// Result of the last update attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_state: Option<UpdateState>,
    /// Recorded event log
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<EventRecord>,
    /// Subclass extension block
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<serde_json::Value>,
}

impl Device {
    /// Snapshot the device into its serializable shape.
    pub fn to_snapshot(&self) -> DeviceSnapshot {
        let created = match self.created_usec() {
            0 => None,
            usec => DateTime::<Utc>::from_timestamp_micros(usec)
                .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Micros, true)),
        };
        DeviceSnapshot {
            created,
            device_id: self.id(),
            physical_id: self.physical_id(),
            logical_id: self.logical_id(),
            backend_id: self.state.read().backend_id.clone(),
            name: self.name(),
            vendor: self.vendor(),
            vid: (self.vid() != 0).then(|| self.vid()),
            pid: (self.pid() != 0).then(|| self.pid()),
            version: self.version(),
            version_bootloader: self.version_bootloader(),
            version_format: (self.version_format() != VersionFormat::Unknown)
                .then(|| self.version_format()),
            flags: self.flags().names().iter().map(|s| s.to_string()).collect(),
            guids: self.guids(),
            instance_ids: self.instance_ids(),
            update_state: (self.update_state() != UpdateState::Unknown)
                .then(|| self.update_state()),
            events: self.events().iter().map(|e| e.to_record()).collect(),
            extension: self.hooks.to_json(self),
        }
    }

    /// Apply a snapshot, setting each field only where present.
    ///
    /// # Errors
    ///
    /// Whatever the subclass `from_json` hook raises for the extension
    /// block.
    pub fn apply_snapshot(&self, snapshot: &DeviceSnapshot) -> Result<()> {
        if let Some(created) = &snapshot.created {
            match DateTime::parse_from_rfc3339(created) {
                Ok(dt) => self.set_created_usec(dt.timestamp_micros()),
                Err(e) => warn!("ignoring unparseable created timestamp {created}: {e}"),
            }
        }
        if let Some(device_id) = &snapshot.device_id {
            self.set_id(device_id);
        }
        if let Some(physical_id) = &snapshot.physical_id {
            self.set_physical_id(physical_id);
        }
        if let Some(logical_id) = &snapshot.logical_id {
            self.set_logical_id(logical_id);
        }
        if let Some(backend_id) = &snapshot.backend_id {
            self.set_backend_id(backend_id);
        }
        if let Some(name) = &snapshot.name {
            self.set_name(name);
        }
        if let Some(vendor) = &snapshot.vendor {
            self.set_vendor(vendor);
        }
        if let Some(vid) = snapshot.vid {
            self.set_vid(vid);
        }
        if let Some(pid) = snapshot.pid {
            self.set_pid(pid);
        }
        if let Some(format) = snapshot.version_format {
            self.set_version_format(format);
        }
        if let Some(version) = &snapshot.version {
            self.set_version(version);
        }
        if let Some(version) = &snapshot.version_bootloader {
            self.set_version_bootloader(version);
        }
        for name in &snapshot.flags {
            match DeviceFlags::from_name(name) {
                Some(flag) => self.add_flag(flag),
                None => warn!("ignoring unknown flag {name}"),
            }
        }
        for guid in &snapshot.guids {
            self.add_instance_id_full(guid, crate::flags::InstanceFlags::VISIBLE);
        }
        for instance_id in &snapshot.instance_ids {
            self.add_instance_id_full(instance_id, crate::flags::InstanceFlags::VISIBLE);
        }
        if let Some(update_state) = snapshot.update_state {
            self.set_update_state(update_state);
        }
        for record in &snapshot.events {
            self.add_event(DeviceEvent::from_record(record.clone()));
        }
        if let Some(extension) = &snapshot.extension {
            self.hooks.from_json(self, extension)?;
        }
        Ok(())
    }

    /// Serialize the device to an emulation capture.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Internal`] on serialization failure.
    pub fn save_emulation(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.to_snapshot())
            .map_err(|e| DeviceError::internal(format!("failed to serialize device: {e}")))
    }

    /// Restore a device from an emulation capture and mark it emulated.
    ///
    /// # Errors
    ///
    /// [`DeviceError::InvalidData`] for unparseable captures.
    pub fn load_emulation(&self, json: &str) -> Result<()> {
        let snapshot: DeviceSnapshot = serde_json::from_str(json)
            .map_err(|e| DeviceError::invalid_data(format!("failed to parse capture: {e}")))?;
        self.apply_snapshot(&snapshot)?;
        self.add_flag(DeviceFlags::EMULATED);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_round_trip() {
        let device = Device::raw();
        device.set_physical_id("usb:01:00");
        device.set_logical_id("dev2");
        device.set_name("ColorHug");
        device.set_vid(0x273f);
        device.set_version_format(VersionFormat::Triplet);
        device.set_version_raw(0x01020003);
        device.set_created_usec(1_700_000_000_000_000);
        device.add_flag(DeviceFlags::UPDATABLE);
        device.ensure_id().unwrap();
        let event = device.save_event("GetContents:Filename=/dev/fw");
        event.set_str("Data", "1.2.3");

        let json = device.save_emulation().unwrap();
        assert!(json.contains("\"Created\""));

        let restored = Device::raw();
        restored.load_emulation(&json).unwrap();
        assert_eq!(restored.id(), device.id());
        assert_eq!(restored.physical_id(), device.physical_id());
        assert_eq!(restored.version().as_deref(), Some("1.2.3"));
        assert!(restored.has_flag(DeviceFlags::EMULATED));
        assert_eq!(restored.created_usec(), 1_700_000_000_000_000);
        let event = restored.load_event("GetContents:Filename=/dev/fw").unwrap();
        assert_eq!(event.get_str("Data").unwrap(), "1.2.3");
    }
}
