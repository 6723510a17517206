//! Event-recorded boundary I/O.
//!
//! Every operation here touches the world outside the process and
//! therefore follows the same record-or-replay pattern: compute a
//! canonical event-id string from the arguments; when the device is
//! emulated, load the previously recorded event and replay its result
//! instead of doing the real I/O; when the context demands recording,
//! perform the real I/O and save the result under that event id.
//! Emulated devices never perform the real I/O.

use std::io::{Read, Write};
use std::path::Path;

use tracing::debug;

use firmkit_errors::prelude::*;

use crate::context::ContextFlags;
use crate::device::{Device, DeviceRef};
use crate::event::DeviceEvent;
use crate::flags::DeviceFlags;
use crate::progress::Progress;

const IO_CHUNK_SIZE: usize = 0x8000;

impl Device {
    fn save_events_enabled(&self) -> bool {
        self.context()
            .is_some_and(|ctx| ctx.has_flag(ContextFlags::SAVE_EVENTS))
    }

    fn boundary_event_id(&self, id: impl FnOnce() -> String) -> Option<String> {
        if self.has_flag(DeviceFlags::EMULATED) || self.save_events_enabled() {
            Some(id())
        } else {
            None
        }
    }

    /// Read up to `count` bytes from a file, emulating if required.
    ///
    /// # Errors
    ///
    /// Real-I/O failures, or whatever the recorded event replays.
    pub fn get_contents_bytes(
        &self,
        filename: &str,
        count: usize,
        progress: Option<&Progress>,
    ) -> Result<Vec<u8>> {
        let event_id = self.boundary_event_id(|| format!("GetContents:Filename={filename}"));

        if self.has_flag(DeviceFlags::EMULATED) {
            let event = self.load_event(event_id.as_deref().unwrap_or_default())?;
            event.check_error()?;
            return event.get_bytes("Data");
        }

        let event = event_id.as_deref().map(|id| self.save_event(id));

        let blob = read_file_limited(filename, count)?;
        if let Some(progress) = progress {
            progress.set_percentage(100);
        }

        if let Some(event) = &event {
            event.set_bytes("Data", &blob);
        }
        Ok(blob)
    }

    /// Read ASCII text from a file, emulating if required.
    ///
    /// # Errors
    ///
    /// [`DeviceError::InvalidData`] for non-ASCII content, plus
    /// everything [`Device::get_contents_bytes`] can raise.
    pub fn get_contents(
        &self,
        filename: &str,
        count: usize,
        progress: Option<&Progress>,
    ) -> Result<String> {
        let event_id = self.boundary_event_id(|| format!("GetContents:Filename={filename}"));

        if self.has_flag(DeviceFlags::EMULATED) {
            let event = self.load_event(event_id.as_deref().unwrap_or_default())?;
            event.check_error()?;
            return event.get_str("Data");
        }

        let event = event_id.as_deref().map(|id| self.save_event(id));

        let blob = read_file_limited(filename, count)?;
        if let Some(progress) = progress {
            progress.set_percentage(100);
        }
        let text = String::from_utf8(blob)
            .ok()
            .filter(|s| s.chars().all(|c| c.is_ascii() && (!c.is_control() || c == '\n')))
            .map(|s| s.trim_end_matches(['\n', '\r', '\0']).to_string())
            .ok_or_else(|| DeviceError::invalid_data("invalid ASCII data"))?;

        if let Some(event) = &event {
            event.set_str("Data", &text);
        }
        Ok(text)
    }

    /// Write a blob to a file in fixed-size chunks, emulating if required.
    ///
    /// During replay the recorded payload is compared against the new
    /// one; a mismatch means the replayed session diverged from the
    /// recorded hardware interaction.
    ///
    /// # Errors
    ///
    /// Real-I/O failures, or [`DeviceError::InvalidData`] on a replay
    /// payload mismatch.
    pub fn set_contents_bytes(
        &self,
        filename: &str,
        blob: &[u8],
        progress: &Progress,
    ) -> Result<()> {
        let event_id = self.boundary_event_id(|| format!("SetContents:Filename={filename}"));

        if self.has_flag(DeviceFlags::EMULATED) {
            let event = self.load_event(event_id.as_deref().unwrap_or_default())?;
            event.check_error()?;
            let recorded = event.get_bytes("Data")?;
            if recorded != blob {
                return Err(DeviceError::invalid_data(format!(
                    "wrote {} bytes but {} bytes were recorded",
                    blob.len(),
                    recorded.len()
                )));
            }
            return Ok(());
        }

        let event = event_id.as_deref().map(|id| self.save_event(id));

        let mut file = std::fs::File::create(filename)
            .map_err(|e| DeviceError::invalid_file(format!("failed to open {filename}: {e}")))?;
        let chunks: Vec<&[u8]> = blob.chunks(IO_CHUNK_SIZE).collect();
        progress.set_steps(chunks.len() as u32);
        for chunk in chunks {
            file.write_all(chunk).map_err(|e| {
                DeviceError::invalid_file(format!("failed to write {filename}: {e}"))
            })?;
            progress.step_done();
        }

        if let Some(event) = &event {
            event.set_bytes("Data", blob);
        }
        Ok(())
    }

    /// Check whether a file exists, emulating if required.
    ///
    /// # Errors
    ///
    /// Only replay misses; the real check cannot fail.
    pub fn query_file_exists(&self, filename: &str) -> Result<bool> {
        let event_id = self.boundary_event_id(|| format!("FileExists:Filename={filename}"));

        if self.has_flag(DeviceFlags::EMULATED) {
            let event = self.load_event(event_id.as_deref().unwrap_or_default())?;
            return Ok(event.get_i64("Exists")? == 1);
        }

        let event = event_id.as_deref().map(|id| self.save_event(id));

        let exists = Path::new(filename).exists();
        if let Some(event) = &event {
            event.set_i64("Exists", i64::from(exists));
        }
        Ok(exists)
    }

    /// Get a hardware SMBIOS string through the context, emulating if
    /// required. Lookup errors are themselves recorded and replayed.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotSupported`] without a context, the context
    /// lookup error, or its recorded equivalent during replay.
    pub fn get_smbios_string(&self, structure_type: u8, length: u8, offset: u8) -> Result<String> {
        let event_id = self.boundary_event_id(|| {
            format!(
                "GetSmbiosString:Type={structure_type:#04x},Length={length:#04x},Offset={offset:#04x}"
            )
        });

        if self.has_flag(DeviceFlags::EMULATED) {
            let event = self.load_event(event_id.as_deref().unwrap_or_default())?;
            event.check_error()?;
            return event.get_str("Data");
        }

        let event = event_id.as_deref().map(|id| self.save_event(id));

        let ctx = self
            .context()
            .ok_or_else(|| DeviceError::not_supported("no context set"))?;
        match ctx.smbios_string(structure_type, length, offset) {
            Ok(value) => {
                if let Some(event) = &event {
                    event.set_str("Data", &value);
                }
                Ok(value)
            }
            Err(error) => {
                if let Some(event) = &event {
                    event.set_error(&error);
                }
                Err(error)
            }
        }
    }

    /// Resolve the physically enclosing parent device via the backend,
    /// emulating if required.
    ///
    /// During replay a stand-in device is built from the recorded
    /// backend and physical IDs rather than asking any backend.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotSupported`] without a backend, the backend
    /// error, or its recorded equivalent during replay.
    pub fn get_backend_parent_with_subsystem(
        &self,
        subsystem: Option<&str>,
    ) -> Result<DeviceRef> {
        let event_id = self.boundary_event_id(|| {
            format!(
                "GetBackendParent:Subsystem={}",
                subsystem.unwrap_or_default()
            )
        });

        if self.has_flag(DeviceFlags::EMULATED) {
            let event = self.load_event(event_id.as_deref().unwrap_or_default())?;
            event.check_error()?;
            let parent = Device::raw();
            parent.set_backend_id(&event.get_str("BackendId")?);
            if let Ok(physical_id) = event.get_str("PhysicalId") {
                parent.set_physical_id(&physical_id);
            }
            parent.add_flag(DeviceFlags::EMULATED);
            return Ok(parent);
        }

        let event = event_id.as_deref().map(|id| self.save_event(id));

        let backend = self
            .backend()
            .ok_or_else(|| DeviceError::not_supported("no backend set"))?;
        match backend.get_device_parent(self, subsystem) {
            Ok(parent) => {
                if let Some(event) = &event {
                    if let Some(backend_id) = parent.backend_id() {
                        event.set_str("BackendId", &backend_id);
                    }
                    if let Some(physical_id) = parent.physical_id() {
                        event.set_str("PhysicalId", &physical_id);
                    }
                }
                Ok(parent)
            }
            Err(error) => {
                if let Some(event) = &event {
                    event.set_error(&error);
                }
                Err(error)
            }
        }
    }

    /// Resolve the physically enclosing parent device via the backend.
    ///
    /// # Errors
    ///
    /// See [`Device::get_backend_parent_with_subsystem`].
    pub fn get_backend_parent(&self) -> Result<DeviceRef> {
        self.get_backend_parent_with_subsystem(None)
    }

    /// Persist the recorded event log and clear it, returning the number
    /// of events written.
    ///
    /// # Errors
    ///
    /// Serialization or filesystem failures.
    pub fn save_event_log(&self, path: &str) -> Result<usize> {
        let records: Vec<crate::event::EventRecord> =
            self.events().iter().map(|e| e.to_record()).collect();
        let json = serde_json::to_string_pretty(&records)
            .map_err(|e| DeviceError::internal(format!("failed to serialize events: {e}")))?;
        std::fs::write(path, json)
            .map_err(|e| DeviceError::invalid_file(format!("failed to write {path}: {e}")))?;
        debug!("saved {} events to {path}", records.len());
        self.clear_events();
        Ok(records.len())
    }

    /// Load a recorded event log, replacing the current one.
    ///
    /// # Errors
    ///
    /// Parse or filesystem failures.
    pub fn load_event_log(&self, path: &str) -> Result<usize> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| DeviceError::invalid_file(format!("failed to read {path}: {e}")))?;
        let records: Vec<crate::event::EventRecord> = serde_json::from_str(&json)
            .map_err(|e| DeviceError::invalid_data(format!("failed to parse {path}: {e}")))?;
        self.clear_events();
        let count = records.len();
        for record in records {
            self.add_event(DeviceEvent::from_record(record));
        }
        Ok(count)
    }
}

fn read_file_limited(filename: &str, count: usize) -> Result<Vec<u8>> {
    let file = std::fs::File::open(filename)
        .map_err(|e| DeviceError::invalid_file(format!("failed to open {filename}: {e}")))?;
    let mut blob = Vec::new();
    let mut handle = file.take(count as u64);
    handle
        .read_to_end(&mut blob)
        .map_err(|e| DeviceError::invalid_file(format!("failed to read {filename}: {e}")))?;
    Ok(blob)
}
