//! Recorded device events.
//!
//! A [`DeviceEvent`] captures one externally observable interaction: a
//! caller-chosen ID plus the typed response payload (or error) observed
//! when the operation ran against real hardware. Replaying the event later
//! returns the identical payload, or raises the identical error, without
//! touching the hardware.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use firmkit_errors::prelude::*;

/// One typed value recorded under a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "kebab-case")]
pub enum EventValue {
    /// UTF-8 string payload
    Str(String),
    /// Raw byte payload, base64 in the serialized form
    Bytes(#[serde(with = "base64_blob")] Vec<u8>),
    /// 64-bit integer payload
    I64(i64),
}

mod base64_blob {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// An error observed while recording, persisted by kind and message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedError {
    /// The error kind
    pub kind: ErrorKind,
    /// The error message without the kind prefix
    pub message: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct EventData {
    values: BTreeMap<String, EventValue>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    error: Option<RecordedError>,
}

/// The serialized form of an event, used in emulation captures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Canonicalized event ID
    pub id: String,
    #[serde(flatten)]
    data: EventData,
}

/// One recorded interaction with the outside world.
///
/// Created by [`crate::Device::save_event`], which returns a live handle
/// the caller populates with typed fields before the real I/O runs.
#[derive(Debug)]
pub struct DeviceEvent {
    id: String,
    data: Mutex<EventData>,
}

impl DeviceEvent {
    /// Create a new event; the ID is canonicalized with [`DeviceEvent::build_id`].
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: Self::build_id(id),
            data: Mutex::new(EventData::default()),
        })
    }

    /// Canonicalize an event ID for matching.
    ///
    /// IDs may embed long filenames or argument dumps; they are stored and
    /// compared as `#` plus the first 8 hex chars of the SHA-1 digest. An
    /// already-canonical ID passes through unchanged.
    pub fn build_id(id: &str) -> String {
        if id.starts_with('#') {
            return id.to_string();
        }
        let digest = Sha1::digest(id.as_bytes());
        let mut hashed = hex::encode(digest);
        hashed.truncate(8);
        format!("#{hashed}")
    }

    /// The canonicalized event ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Check if this event matches a raw (uncanonicalized) ID.
    pub fn matches(&self, id: &str) -> bool {
        self.id == Self::build_id(id)
    }

    /// Record a string value.
    pub fn set_str(&self, key: &str, value: &str) {
        self.data
            .lock()
            .values
            .insert(key.to_string(), EventValue::Str(value.to_string()));
    }

    /// Record a byte-blob value.
    pub fn set_bytes(&self, key: &str, value: &[u8]) {
        self.data
            .lock()
            .values
            .insert(key.to_string(), EventValue::Bytes(value.to_vec()));
    }

    /// Record an integer value.
    pub fn set_i64(&self, key: &str, value: i64) {
        self.data
            .lock()
            .values
            .insert(key.to_string(), EventValue::I64(value));
    }

    /// Record the error the real operation raised.
    pub fn set_error(&self, error: &DeviceError) {
        self.data.lock().error = Some(RecordedError {
            kind: error.kind(),
            message: error.message().to_string(),
        });
    }

    /// Raise the recorded error, if any.
    ///
    /// Replay must fail with an error equivalent to the recorded one
    /// rather than returning any cached payload.
    ///
    /// # Errors
    ///
    /// The reconstructed error, when one was recorded.
    pub fn check_error(&self) -> Result<()> {
        match self.data.lock().error.clone() {
            Some(recorded) => Err(recorded.kind.into_error(recorded.message)),
            None => Ok(()),
        }
    }

    /// Get a recorded string value.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotFound`] if the key is missing,
    /// [`DeviceError::InvalidData`] if it holds a different type.
    pub fn get_str(&self, key: &str) -> Result<String> {
        match self.data.lock().values.get(key) {
            Some(EventValue::Str(value)) => Ok(value.clone()),
            Some(_) => Err(DeviceError::invalid_data(format!(
                "event {} key {key} is not a string",
                self.id
            ))),
            None => Err(DeviceError::not_found(format!(
                "no value for {key} in event {}",
                self.id
            ))),
        }
    }

    /// Get a recorded byte-blob value.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotFound`] if the key is missing,
    /// [`DeviceError::InvalidData`] if it holds a different type.
    pub fn get_bytes(&self, key: &str) -> Result<Vec<u8>> {
        match self.data.lock().values.get(key) {
            Some(EventValue::Bytes(value)) => Ok(value.clone()),
            Some(_) => Err(DeviceError::invalid_data(format!(
                "event {} key {key} is not a byte blob",
                self.id
            ))),
            None => Err(DeviceError::not_found(format!(
                "no value for {key} in event {}",
                self.id
            ))),
        }
    }

    /// Get a recorded integer value.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotFound`] if the key is missing,
    /// [`DeviceError::InvalidData`] if it holds a different type.
    pub fn get_i64(&self, key: &str) -> Result<i64> {
        match self.data.lock().values.get(key) {
            Some(EventValue::I64(value)) => Ok(*value),
            Some(_) => Err(DeviceError::invalid_data(format!(
                "event {} key {key} is not an integer",
                self.id
            ))),
            None => Err(DeviceError::not_found(format!(
                "no value for {key} in event {}",
                self.id
            ))),
        }
    }

    /// Snapshot this event into its serializable record form.
    pub fn to_record(&self) -> EventRecord {
        EventRecord {
            id: self.id.clone(),
            data: self.data.lock().clone(),
        }
    }

    /// Reconstruct an event from its serialized record.
    pub fn from_record(record: EventRecord) -> Arc<Self> {
        Arc::new(Self {
            id: record.id,
            data: Mutex::new(record.data),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_id_hashes() {
        let id = DeviceEvent::build_id("GetContents:Filename=/sys/devices/fw");
        assert!(id.starts_with('#'));
        assert_eq!(id.len(), 9);
        // already-canonical IDs pass through
        assert_eq!(DeviceEvent::build_id(&id), id);
        // deterministic
        assert_eq!(
            DeviceEvent::build_id("GetContents:Filename=/sys/devices/fw"),
            id
        );
    }

    #[test]
    fn test_typed_values() {
        let event = DeviceEvent::new("test");
        event.set_str("Data", "hello");
        event.set_bytes("Blob", &[0x01, 0x02]);
        event.set_i64("Exists", 1);
        assert_eq!(event.get_str("Data").unwrap(), "hello");
        assert_eq!(event.get_bytes("Blob").unwrap(), vec![0x01, 0x02]);
        assert_eq!(event.get_i64("Exists").unwrap(), 1);
        assert_eq!(
            event.get_str("Missing").unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            event.get_str("Exists").unwrap_err().kind(),
            ErrorKind::InvalidData
        );
    }

    #[test]
    fn test_recorded_error_replays() {
        let event = DeviceEvent::new("test");
        assert!(event.check_error().is_ok());
        event.set_error(&DeviceError::not_supported("no SMBIOS data"));
        let err = event.check_error().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
        assert_eq!(err.message(), "no SMBIOS data");
    }

    #[test]
    fn test_record_round_trip() {
        let event = DeviceEvent::new("GetContents:Filename=/dev/null");
        event.set_bytes("Data", &[0xde, 0xad, 0xbe, 0xef]);
        event.set_error(&DeviceError::busy("device claimed"));

        let json = serde_json::to_string(&event.to_record()).unwrap();
        assert!(json.contains("3q2+7w==")); // base64 of deadbeef

        let record: EventRecord = serde_json::from_str(&json).unwrap();
        let restored = DeviceEvent::from_record(record);
        assert_eq!(restored.id(), event.id());
        assert_eq!(
            restored.get_bytes("Data").unwrap(),
            vec![0xde, 0xad, 0xbe, 0xef]
        );
        assert_eq!(restored.check_error().unwrap_err().kind(), ErrorKind::Busy);
    }
}
