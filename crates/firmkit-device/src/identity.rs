//! Identity derivation and the instance-ID engine.
//!
//! Device IDs are content-addressed: the SHA-1 of `physical_id:logical_id`
//! unless the caller supplies a string already matching the canonical
//! grammar. Instance IDs are human-readable identity strings hashed into
//! GUIDs for quirk and metadata matching.

use std::collections::BTreeMap;

use sha1::{Digest, Sha1};
use tracing::{debug, warn};
use uuid::Uuid;

use firmkit_errors::prelude::*;

use crate::device::{Device, InstanceIdItem, device_id_is_valid};
use crate::flags::{InstanceFlags, private_flags};

/// Check a string against the canonical GUID grammar.
pub fn guid_is_valid(guid: &str) -> bool {
    guid.len() == 36 && Uuid::try_parse(guid).is_ok()
}

/// Hash an instance ID into its name-based GUID.
///
/// SHA-1 name-based UUID (v5) in the DNS namespace; stable across
/// processes and machines.
pub fn guid_from_string(value: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, value.as_bytes()).to_string()
}

impl Device {
    /// Derive and set the canonical device ID if not already valid.
    ///
    /// The ID is the join `physical_id:logical_id`; a missing logical ID
    /// contributes an empty trailing segment. No-op success when a valid
    /// ID is already cached.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotSupported`] when no physical ID is set, with a
    /// debug dump of the device embedded in the message.
    pub fn ensure_id(&self) -> Result<()> {
        if self.state.read().device_id_valid {
            return Ok(());
        }
        let Some(physical_id) = self.physical_id() else {
            return Err(DeviceError::not_supported(format!(
                "cannot ensure ID: {}",
                self.to_debug_string()
            )));
        };
        let device_id = format!(
            "{physical_id}:{}",
            self.logical_id().unwrap_or_default()
        );
        self.set_id(&device_id);
        Ok(())
    }

    /// Set the device ID.
    ///
    /// A string matching the canonical grammar is used verbatim; anything
    /// else is hashed with SHA-1. The new ID propagates to the children's
    /// parent ID, and any child composite ID equal to the *previous* ID
    /// is rewritten recursively so grouped update transactions stay
    /// consistent across ID churn.
    pub fn set_id(&self, id: &str) {
        let id_hash = if device_id_is_valid(id) {
            id.to_string()
        } else {
            let hashed = hex::encode(Sha1::digest(id.as_bytes()));
            debug!("using {hashed} for {id}");
            hashed
        };

        let id_old = {
            let mut state = self.state.write();
            let id_old = state.id.take();
            state.id = Some(id_hash.clone());
            state.device_id_valid = true;
            id_old
        };

        for child in self.children() {
            child.state.write().parent_id = Some(id_hash.clone());
            if let Some(id_old) = &id_old
                && child.state.read().composite_id.as_deref() == Some(id_old)
            {
                child.set_composite_id(&id_hash);
            }
        }
    }

    /// The composite ID grouping a multi-device update transaction,
    /// falling back to the device's own ID.
    pub fn composite_id(&self) -> Option<String> {
        let state = self.state.read();
        state.composite_id.clone().or_else(|| state.id.clone())
    }

    /// Set the composite ID here and on all descendants.
    pub fn set_composite_id(&self, composite_id: &str) {
        self.state.write().composite_id = Some(composite_id.to_string());
        for child in self.children() {
            child.set_composite_id(composite_id);
        }
    }

    // ---- instance IDs ----

    fn find_instance_item(
        items: &[InstanceIdItem],
        instance_id: &str,
    ) -> Option<usize> {
        items.iter().position(|item| {
            item.instance_id.as_deref() == Some(instance_id) || item.guid == instance_id
        })
    }

    /// Check for an instance ID or GUID carrying any of `flags`.
    pub fn has_instance_id(&self, instance_id: &str, flags: InstanceFlags) -> bool {
        self.state.read().instance_items.iter().any(|item| {
            item.flags.intersects(flags)
                && (item.instance_id.as_deref() == Some(instance_id)
                    || item.guid == instance_id)
        })
    }

    /// Add a visible, quirked instance ID.
    pub fn add_instance_id(&self, instance_id: &str) {
        self.add_instance_id_full(
            instance_id,
            InstanceFlags::VISIBLE | InstanceFlags::QUIRKS,
        );
    }

    /// Add an instance ID or GUID with explicit flags.
    ///
    /// A string already shaped like a GUID is stored as a GUID only;
    /// anything else also keeps the readable form. Re-adding an existing
    /// entry merges the flags, and upgrading an entry to QUIRKS
    /// re-triggers the quirk lookup for its GUID. After setup, additions
    /// export immediately instead of waiting for conversion.
    pub fn add_instance_id_full(&self, instance_id: &str, flags: InstanceFlags) {
        let mut flags = flags;
        if flags.contains(InstanceFlags::COUNTERPART)
            && self.has_private_flag(private_flags::COUNTERPART_VISIBLE)
        {
            debug!("making {instance_id} also visible");
            flags |= InstanceFlags::VISIBLE;
        }

        let (guid_for_quirks, exported) = {
            let mut state = self.state.write();
            match Self::find_instance_item(&state.instance_items, instance_id) {
                Some(idx) => {
                    let needs_quirks = !state.instance_items[idx]
                        .flags
                        .contains(InstanceFlags::QUIRKS)
                        && flags.contains(InstanceFlags::QUIRKS);
                    state.instance_items[idx].flags |= flags;
                    let item = state.instance_items[idx].clone();
                    (needs_quirks.then(|| item.guid.clone()), item)
                }
                None => {
                    let item = if guid_is_valid(instance_id) {
                        InstanceIdItem {
                            instance_id: None,
                            guid: instance_id.to_string(),
                            flags,
                        }
                    } else {
                        InstanceIdItem {
                            instance_id: Some(instance_id.to_string()),
                            guid: guid_from_string(instance_id),
                            flags,
                        }
                    };
                    state.instance_items.push(item.clone());
                    (
                        flags.contains(InstanceFlags::QUIRKS).then(|| item.guid.clone()),
                        item,
                    )
                }
            }
        };

        if let Some(guid) = guid_for_quirks {
            self.add_guid_quirks(&guid);
        }

        // setup has already exported the collections, so keep them fresh
        if self.done_setup() {
            let mut state = self.state.write();
            if let Some(instance_id) = &exported.instance_id
                && !state.exported_instance_ids.iter().any(|i| i == instance_id)
            {
                state.exported_instance_ids.push(instance_id.clone());
            }
            if !state.guids.iter().any(|g| g == &exported.guid) {
                state.guids.push(exported.guid.clone());
            }
        }
    }

    /// One-shot promotion of accumulated instance IDs into the visible
    /// GUID and instance-ID collections.
    ///
    /// Filters on VISIBLE, dropping GENERIC entries when the
    /// `no-generic-guids` private flag is set. No-op when the visible
    /// GUID list is already non-empty.
    pub fn convert_instance_ids(&self) {
        if !self.state.read().guids.is_empty() {
            return;
        }
        let no_generic_guids = self.has_private_flag(private_flags::NO_GENERIC_GUIDS);
        let mut state = self.state.write();
        let items = state.instance_items.clone();
        for item in items {
            if !item.flags.contains(InstanceFlags::VISIBLE) {
                continue;
            }
            if item.flags.contains(InstanceFlags::GENERIC) && no_generic_guids {
                continue;
            }
            if let Some(instance_id) = item.instance_id
                && !state.exported_instance_ids.iter().any(|i| i == &instance_id)
            {
                state.exported_instance_ids.push(instance_id);
            }
            if !state.guids.iter().any(|g| g == &item.guid) {
                state.guids.push(item.guid);
            }
        }
    }

    /// All visible GUIDs, populated by [`Device::convert_instance_ids`].
    pub fn guids(&self) -> Vec<String> {
        self.state.read().guids.clone()
    }

    /// Check for a visible GUID.
    pub fn has_guid(&self, guid: &str) -> bool {
        self.state.read().guids.iter().any(|g| g == guid)
    }

    /// All visible instance IDs.
    pub fn instance_ids(&self) -> Vec<String> {
        self.state.read().exported_instance_ids.clone()
    }

    /// All instance-ID entries, converted or not.
    pub fn instance_items(&self) -> Vec<InstanceIdItem> {
        self.state.read().instance_items.clone()
    }

    /// GUIDs of the same device in its other (bootloader/runtime) mode.
    pub fn counterpart_guids(&self) -> Vec<String> {
        self.state
            .read()
            .instance_items
            .iter()
            .filter(|item| item.flags.contains(InstanceFlags::COUNTERPART))
            .map(|item| item.guid.clone())
            .collect()
    }

    /// GUIDs identifying acceptable parent devices.
    pub fn parent_guids(&self) -> Vec<String> {
        self.state.read().parent_guids.clone()
    }

    /// Check for a parent GUID.
    pub fn has_parent_guid(&self, guid: &str) -> bool {
        self.state.read().parent_guids.iter().any(|g| g == guid)
    }

    /// Add a GUID identifying an acceptable parent device; non-GUID
    /// strings are hashed first. Duplicate-safe.
    pub fn add_parent_guid(&self, guid: &str) {
        let guid = if guid_is_valid(guid) {
            guid.to_string()
        } else {
            guid_from_string(guid)
        };
        let mut state = self.state.write();
        if !state.parent_guids.iter().any(|g| g == &guid) {
            state.parent_guids.push(guid);
        }
    }

    // ---- instance-hash keys ----

    /// Look up an instance-hash value on this device only.
    pub fn instance_str(&self, key: &str) -> Option<String> {
        self.state
            .read()
            .instance_hash
            .as_ref()
            .and_then(|map| map.get(key).cloned())
    }

    fn instance_hash_insert(&self, key: &str, value: Option<String>) {
        self.state
            .write()
            .instance_hash
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.unwrap_or_default());
    }

    /// Assign an instance-hash value for `key`.
    pub fn add_instance_str(&self, key: &str, value: &str) {
        self.instance_hash_insert(key, Some(value.to_string()));
    }

    /// Assign a sanitized instance-hash value for `key`.
    ///
    /// Problematic characters collapse to a single `-` per run and a
    /// trailing `-` is trimmed; a value with nothing left is not stored.
    pub fn add_instance_strsafe(&self, key: &str, value: &str) {
        match strsafe_instance_value(value) {
            Some(safe) => self.instance_hash_insert(key, Some(safe)),
            None => warn!("no valid chars left in instance value for {key}"),
        }
    }

    /// Assign an uppercased instance-hash value for `key`.
    pub fn add_instance_strup(&self, key: &str, value: &str) {
        self.instance_hash_insert(key, Some(value.to_uppercase()));
    }

    /// Assign a 4-bit value rendered as one uppercase hex digit.
    pub fn add_instance_u4(&self, key: &str, value: u8) {
        self.instance_hash_insert(key, Some(format!("{:01X}", value & 0xf)));
    }

    /// Assign an 8-bit value rendered as two uppercase hex digits.
    pub fn add_instance_u8(&self, key: &str, value: u8) {
        self.instance_hash_insert(key, Some(format!("{value:02X}")));
    }

    /// Assign a 16-bit value rendered as four uppercase hex digits.
    pub fn add_instance_u16(&self, key: &str, value: u16) {
        self.instance_hash_insert(key, Some(format!("{value:04X}")));
    }

    /// Assign a 32-bit value rendered as eight uppercase hex digits.
    pub fn add_instance_u32(&self, key: &str, value: u32) {
        self.instance_hash_insert(key, Some(format!("{value:08X}")));
    }

    /// Build and add a visible, quirked composite instance ID.
    ///
    /// See [`Device::build_instance_id_full`].
    ///
    /// # Errors
    ///
    /// [`DeviceError::InvalidData`] naming the first unresolvable key.
    pub fn build_instance_id(&self, subsystem: &str, keys: &[&str]) -> Result<()> {
        self.build_instance_id_full(
            InstanceFlags::VISIBLE | InstanceFlags::QUIRKS,
            subsystem,
            keys,
        )
    }

    /// Build a composite instance ID `SUBSYS\KEY1_V1&KEY2_V2` from
    /// instance-hash keys and add it with explicit flags.
    ///
    /// Each key resolves on this device first, then the parent, then the
    /// proxy. If *any* key resolves to nothing the whole instance ID is
    /// dropped; there are no partial IDs.
    ///
    /// # Errors
    ///
    /// [`DeviceError::InvalidData`] naming the first unresolvable key.
    pub fn build_instance_id_full(
        &self,
        flags: InstanceFlags,
        subsystem: &str,
        keys: &[&str],
    ) -> Result<()> {
        let parent = self.parent();
        let proxy = self.proxy();
        let mut instance_id = subsystem.to_string();
        for (i, key) in keys.iter().enumerate() {
            let value = self
                .instance_str(key)
                .or_else(|| parent.as_ref().and_then(|p| p.instance_str(key)))
                .or_else(|| proxy.as_ref().and_then(|p| p.instance_str(key)))
                .ok_or_else(|| DeviceError::invalid_data(format!("no value for {key}")))?;
            instance_id.push(if i == 0 { '\\' } else { '&' });
            instance_id.push_str(&format!("{key}_{value}"));
        }
        self.add_instance_id_full(&instance_id, flags);
        Ok(())
    }

    // ---- vendor IDs ----

    /// Add a vendor ID `PREFIX:value`, skipped for an empty value.
    pub fn build_vendor_id(&self, prefix: &str, value: Option<&str>) {
        let Some(value) = value else { return };
        self.add_vendor_id(&format!("{prefix}:{value}"));
    }

    /// Add a vendor ID `PREFIX:0xABCD`, skipped for a zero value.
    pub fn build_vendor_id_u16(&self, prefix: &str, value: u16) {
        if value == 0 {
            return;
        }
        self.add_vendor_id(&format!("{prefix}:{value:#06X}"));
    }
}

fn strsafe_valid_char(c: char) -> bool {
    if matches!(
        c,
        ' ' | '_' | '&' | '/' | '\\' | '-' | '(' | ')' | ','
    ) {
        return false;
    }
    c.is_ascii_graphic()
}

fn strsafe_instance_value(value: &str) -> Option<String> {
    let mut out = String::new();
    let mut has_content = false;
    for c in value.chars() {
        if strsafe_valid_char(c) {
            out.push(c);
            has_content = true;
        } else if has_content {
            out.push('-');
            has_content = false;
        }
    }
    if out.ends_with('-') {
        out.pop();
    }
    (!out.is_empty()).then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ensure_id_without_logical_id() {
        let device = Device::raw();
        device.set_physical_id("usb:1-2");
        device.ensure_id().unwrap();
        // SHA-1 of "usb:1-2:", the logical part contributing an empty
        // trailing segment
        assert_eq!(
            device.id().as_deref(),
            Some("ad48feb354af30630e0e611cae7d1a113f7cbda6")
        );
    }

    #[test]
    fn test_ensure_id_with_logical_id() {
        let device = Device::raw();
        device.set_physical_id("usb:1-2");
        device.set_logical_id("dev2");
        device.ensure_id().unwrap();
        assert_eq!(
            device.id().as_deref(),
            Some("b4a6be9b06a6bdd580bc6582e94706af0ee8cf63")
        );
    }

    #[test]
    fn test_ensure_id_idempotent() {
        let device = Device::raw();
        device.set_physical_id("usb:1-2");
        device.ensure_id().unwrap();
        let first = device.id();
        device.ensure_id().unwrap();
        assert_eq!(device.id(), first);

        // identity churn invalidates and re-derives
        device.set_logical_id("dev2");
        device.ensure_id().unwrap();
        assert_ne!(device.id(), first);
    }

    #[test]
    fn test_ensure_id_requires_physical_id() {
        let device = Device::raw();
        let err = device.ensure_id().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
        assert!(err.message().contains("cannot ensure ID"));
    }

    #[test]
    fn test_set_id_passthrough_for_canonical() {
        let device = Device::raw();
        let canonical = "ad48feb354af30630e0e611cae7d1a113f7cbda6";
        device.set_id(canonical);
        assert_eq!(device.id().as_deref(), Some(canonical));

        // anything else is content-addressed
        device.set_id("not canonical at all");
        assert_ne!(device.id().as_deref(), Some("not canonical at all"));
        assert!(device_id_is_valid(&device.id().unwrap()));
    }

    #[test]
    fn test_add_instance_id_merges_flags() {
        let device = Device::raw();
        device.add_instance_id_full("USB\\VID_273F", InstanceFlags::VISIBLE);
        device.add_instance_id_full("USB\\VID_273F", InstanceFlags::GENERIC);
        let items = device.instance_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].flags, InstanceFlags::VISIBLE | InstanceFlags::GENERIC);
    }

    #[test]
    fn test_guid_shaped_instance_id_stored_as_guid() {
        let device = Device::raw();
        device.add_instance_id("2fa8891f-3ece-53a4-adc4-0dd875685f30");
        let items = device.instance_items();
        assert_eq!(items[0].instance_id, None);
        assert_eq!(items[0].guid, "2fa8891f-3ece-53a4-adc4-0dd875685f30");
    }

    #[test]
    fn test_convert_instance_ids_filters_and_latches() {
        let device = Device::raw();
        device.add_private_flag(private_flags::NO_GENERIC_GUIDS);
        device.add_instance_id_full("USB\\VID_273F&PID_1004", InstanceFlags::VISIBLE);
        device.add_instance_id_full(
            "USB\\VID_273F",
            InstanceFlags::VISIBLE | InstanceFlags::GENERIC,
        );
        device.add_instance_id_full("USB\\HIDDEN", InstanceFlags::QUIRKS);

        device.convert_instance_ids();
        assert_eq!(
            device.instance_ids(),
            vec!["USB\\VID_273F&PID_1004".to_string()]
        );
        assert_eq!(device.guids().len(), 1);
        assert!(device.has_guid(&guid_from_string("USB\\VID_273F&PID_1004")));

        // idempotent once visible GUIDs exist
        device.add_instance_id_full("USB\\LATE", InstanceFlags::VISIBLE);
        device.convert_instance_ids();
        assert_eq!(device.guids().len(), 1);
    }

    #[test]
    fn test_build_instance_id_resolves_parent_and_proxy() {
        let parent = Device::raw();
        parent.set_physical_id("usb:1");
        parent.add_instance_u16("VID", 0x273f);
        let device = Device::raw();
        device.set_physical_id("usb:1-2");
        parent.add_child(&device);
        device.add_instance_u16("PID", 0x1004);

        device.build_instance_id("USB", &["VID", "PID"]).unwrap();
        assert!(device.has_instance_id("USB\\VID_273F&PID_1004", InstanceFlags::VISIBLE));
    }

    #[test]
    fn test_build_instance_id_drops_partial() {
        let device = Device::raw();
        device.add_instance_str("VID", "273F");
        let err = device.build_instance_id("USB", &["VID", "PID"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(err.message().contains("PID"));
        assert!(device.instance_items().is_empty());
    }

    #[test]
    fn test_instance_value_renderings() {
        let device = Device::raw();
        device.add_instance_u4("REV", 0xa);
        device.add_instance_u8("CLS", 0x03);
        device.add_instance_u16("VID", 0x273f);
        device.add_instance_u32("DID", 0xdead_beef);
        device.add_instance_strup("NAME", "hidpp");
        assert_eq!(device.instance_str("REV").as_deref(), Some("A"));
        assert_eq!(device.instance_str("CLS").as_deref(), Some("03"));
        assert_eq!(device.instance_str("VID").as_deref(), Some("273F"));
        assert_eq!(device.instance_str("DID").as_deref(), Some("DEADBEEF"));
        assert_eq!(device.instance_str("NAME").as_deref(), Some("HIDPP"));
    }

    #[test]
    fn test_build_vendor_id() {
        let device = Device::raw();
        device.build_vendor_id("USB", Some("0x273F"));
        device.build_vendor_id("PCI", None);
        device.build_vendor_id_u16("HIDRAW", 0x046d);
        device.build_vendor_id_u16("I2C", 0);
        assert_eq!(
            device.vendor_ids(),
            vec!["USB:0x273F".to_string(), "HIDRAW:0x046D".to_string()]
        );
    }

    proptest! {
        #[test]
        fn prop_derived_id_is_canonical(
            physical in "[a-z0-9:._-]{1,32}",
            logical in proptest::option::of("[a-z0-9:._-]{1,16}"),
        ) {
            let device = Device::raw();
            device.set_physical_id(&physical);
            if let Some(logical) = &logical {
                device.set_logical_id(logical);
            }
            device.ensure_id().unwrap();
            let id = device.id().unwrap();
            prop_assert!(device_id_is_valid(&id));

            // deriving twice with no identity change is stable
            device.ensure_id().unwrap();
            prop_assert_eq!(device.id().unwrap(), id);
        }
    }

    #[test]
    fn test_guid_from_string_stable() {
        // pinned so captures recorded by other builds still match
        assert_eq!(
            guid_from_string("USB\\VID_273F&PID_1004"),
            "2fa8891f-3ece-53a4-adc4-0dd875685f30"
        );
        assert!(guid_is_valid(&guid_from_string("anything")));
        assert!(!guid_is_valid("not-a-guid"));
    }

    #[test]
    fn test_strsafe_collapses_runs() {
        assert_eq!(
            strsafe_instance_value("My (Vendor) Device"),
            Some("My-Vendor-Device".to_string())
        );
        assert_eq!(strsafe_instance_value("tail one "), Some("tail-one".to_string()));
        assert_eq!(strsafe_instance_value("  ()  "), None);
    }
}
