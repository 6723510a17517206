//! Quirk key interpretation.
//!
//! Quirks are externally supplied key/value overrides keyed by GUID,
//! applied at setup time to correct or augment hardware-reported
//! metadata. The fixed vocabulary below is interpreted by the core before
//! falling back to the subclass `set_quirk_kv` hook. Application is
//! best-effort: one bad quirk logs and continues, it never takes the
//! daemon down.

use tracing::{debug, warn};

use firmkit_errors::prelude::*;

use crate::device::Device;
use crate::flags::{DeviceFlags, InstanceFlags};
use crate::registry;
use crate::version::VersionFormat;

/// The fixed quirk key vocabulary.
pub mod quirk_keys {
    /// Plugin names that may handle the device, comma-separated
    pub const PLUGIN: &str = "Plugin";
    /// Custom flags string, see `Device::set_custom_flags`
    pub const FLAGS: &str = "Flags";
    /// Device name
    pub const NAME: &str = "Name";
    /// One-line summary
    pub const SUMMARY: &str = "Summary";
    /// Firmware branch
    pub const BRANCH: &str = "Branch";
    /// Vendor name
    pub const VENDOR: &str = "Vendor";
    /// Vendor-ID string, e.g. `USB:0x273F`
    pub const VENDOR_ID: &str = "VendorId";
    /// Update protocol name
    pub const PROTOCOL: &str = "Protocol";
    /// Issue identifier fixed by updates, e.g. a CVE
    pub const ISSUE: &str = "Issue";
    /// Version string override
    pub const VERSION: &str = "Version";
    /// Post-update user message
    pub const UPDATE_MESSAGE: &str = "UpdateMessage";
    /// Post-update image URL
    pub const UPDATE_IMAGE: &str = "UpdateImage";
    /// Icon names, comma-separated
    pub const ICON: &str = "Icon";
    /// Extra visible+quirked instance IDs or GUIDs, comma-separated
    pub const GUID: &str = "Guid";
    /// Extra quirk-only instance IDs or GUIDs, comma-separated
    pub const GUID_QUIRK: &str = "GuidQuirk";
    /// GUID of the same device in the other mode, comma-separated
    pub const COUNTERPART_GUID: &str = "CounterpartGuid";
    /// GUID of an acceptable parent device
    pub const PARENT_GUID: &str = "ParentGuid";
    /// GUID used to match the proxy device
    pub const PROXY_GUID: &str = "ProxyGuid";
    /// Exact firmware size in bytes
    pub const FIRMWARE_SIZE: &str = "FirmwareSize";
    /// Minimum firmware size in bytes
    pub const FIRMWARE_SIZE_MIN: &str = "FirmwareSizeMin";
    /// Maximum firmware size in bytes
    pub const FIRMWARE_SIZE_MAX: &str = "FirmwareSizeMax";
    /// Expected install duration in seconds
    pub const INSTALL_DURATION: &str = "InstallDuration";
    /// Device priority among equivalents
    pub const PRIORITY: &str = "Priority";
    /// Minimum device battery percentage for updates
    pub const BATTERY_THRESHOLD: &str = "BatteryThreshold";
    /// Replug delay in milliseconds
    pub const REMOVE_DELAY: &str = "RemoveDelay";
    /// Settle delay in milliseconds
    pub const ACQUIESCE_DELAY: &str = "AcquiesceDelay";
    /// Version rendering format name
    pub const VERSION_FORMAT: &str = "VersionFormat";
    /// Inhibit directives `id:reason`, empty reason uninhibits
    pub const INHIBIT: &str = "Inhibit";
    /// Concrete device type name, first write wins
    pub const GTYPE: &str = "GType";
    /// Concrete proxy device type name, first write wins
    pub const PROXY_GTYPE: &str = "ProxyGType";
    /// Firmware container type name, first write wins
    pub const FIRMWARE_GTYPE: &str = "FirmwareGType";
    /// Child-spawn directives `[Type|]GUID`, comma-separated
    pub const CHILDREN: &str = "Children";
}

fn parse_number(value: &str) -> Result<u64> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| DeviceError::invalid_data(format!("cannot parse {value} as a number")))
}

impl Device {
    /// The custom-flags string last applied, kept for incorporation.
    pub fn custom_flags(&self) -> Option<String> {
        self.state.read().custom_flags.clone()
    }

    /// Apply a comma-separated custom-flags string.
    ///
    /// Each token is a flag name to set, or `~name` to clear. Names
    /// resolve against the exported enumeration first, then the private
    /// registry; unrecognized tokens are silently ignored so quirk files
    /// can carry flags for types not yet loaded.
    pub fn set_custom_flags(&self, custom_flags: &str) {
        self.state.write().custom_flags = Some(custom_flags.to_string());
        for hint in custom_flags.split(',') {
            self.set_custom_flag(hint);
        }
    }

    fn set_custom_flag(&self, hint: &str) {
        if let Some(name) = hint.strip_prefix('~') {
            if let Some(flag) = DeviceFlags::from_name(name) {
                self.remove_flag(flag);
            } else if registry::private_flag_is_registered(self.kind(), name) {
                self.remove_private_flag(name);
            }
            return;
        }
        if let Some(flag) = DeviceFlags::from_name(hint) {
            self.add_flag(flag);
        } else if registry::private_flag_is_registered(self.kind(), hint) {
            self.add_private_flag(hint);
        }
    }

    /// The concrete device type bound by quirk, first write wins.
    pub fn specialized_type(&self) -> Option<String> {
        self.state.read().specialized_type.clone()
    }

    /// Bind the concrete device type name; later writes are ignored.
    pub fn set_specialized_type(&self, type_name: &str) {
        let mut state = self.state.write();
        if state.specialized_type.is_none() {
            state.specialized_type = Some(type_name.to_string());
        }
    }

    /// The concrete proxy device type bound by quirk.
    pub fn proxy_type(&self) -> Option<String> {
        self.state.read().proxy_type.clone()
    }

    /// Bind the proxy device type name; later writes are ignored.
    pub fn set_proxy_type(&self, type_name: &str) {
        let mut state = self.state.write();
        if state.proxy_type.is_none() {
            state.proxy_type = Some(type_name.to_string());
        }
    }

    /// The firmware container type bound by quirk.
    pub fn firmware_type(&self) -> Option<String> {
        self.state.read().firmware_type.clone()
    }

    /// Bind the firmware container type name; later writes are ignored.
    pub fn set_firmware_type(&self, type_name: &str) {
        let mut state = self.state.write();
        if state.firmware_type.is_none() {
            state.firmware_type = Some(type_name.to_string());
        }
    }

    fn set_quirk_inhibit_section(&self, value: &str) -> Result<()> {
        let Some((inhibit_id, reason)) = value.split_once(':') else {
            return Err(DeviceError::not_supported(
                "quirk key not supported, expected k1:v1[,k2:v2][,k3:]",
            ));
        };
        if reason.is_empty() {
            self.uninhibit(inhibit_id);
        } else {
            self.inhibit(inhibit_id, Some(reason));
        }
        Ok(())
    }

    fn add_child_by_directive(&self, directive: &str) -> Result<()> {
        let (type_name, guid) = match directive.split_once('|') {
            Some((type_name, guid)) => (Some(type_name), guid),
            None => (None, directive),
        };
        let child = match type_name {
            Some(type_name) => registry::create_device(type_name)?,
            None => Device::raw(),
        };
        child.add_instance_id(guid);
        self.add_child(&child);
        Ok(())
    }

    /// Apply one quirk key/value to the device.
    ///
    /// The fixed vocabulary is handled here; unknown keys go to the
    /// subclass hook.
    ///
    /// # Errors
    ///
    /// [`DeviceError::InvalidData`] for malformed values,
    /// [`DeviceError::NotSupported`] for keys nobody handles.
    pub fn set_quirk_kv(&self, key: &str, value: &str) -> Result<()> {
        match key {
            quirk_keys::PLUGIN => {
                for plugin in value.split(',') {
                    self.add_possible_plugin(plugin);
                }
                Ok(())
            }
            quirk_keys::FLAGS => {
                self.set_custom_flags(value);
                Ok(())
            }
            quirk_keys::NAME => {
                self.set_name(value);
                Ok(())
            }
            quirk_keys::SUMMARY => {
                self.set_summary(value);
                Ok(())
            }
            quirk_keys::BRANCH => {
                self.set_branch(value);
                Ok(())
            }
            quirk_keys::VENDOR => {
                self.set_vendor(value);
                Ok(())
            }
            quirk_keys::VENDOR_ID => {
                self.add_vendor_id(value);
                Ok(())
            }
            quirk_keys::PROTOCOL => {
                self.set_protocol(value);
                Ok(())
            }
            quirk_keys::ISSUE => {
                self.add_issue(value);
                Ok(())
            }
            quirk_keys::VERSION => {
                self.set_version(value);
                Ok(())
            }
            quirk_keys::UPDATE_MESSAGE => {
                self.set_update_message(value);
                Ok(())
            }
            quirk_keys::UPDATE_IMAGE => {
                self.set_update_image(value);
                Ok(())
            }
            quirk_keys::ICON => {
                for icon in value.split(',') {
                    self.add_icon(icon);
                }
                Ok(())
            }
            quirk_keys::GUID => {
                for guid in value.split(',') {
                    self.add_instance_id_full(
                        guid,
                        InstanceFlags::VISIBLE | InstanceFlags::QUIRKS,
                    );
                }
                Ok(())
            }
            quirk_keys::GUID_QUIRK => {
                for guid in value.split(',') {
                    self.add_instance_id_full(guid, InstanceFlags::QUIRKS);
                }
                Ok(())
            }
            quirk_keys::COUNTERPART_GUID => {
                for guid in value.split(',') {
                    self.add_instance_id_full(guid, InstanceFlags::COUNTERPART);
                }
                Ok(())
            }
            quirk_keys::PARENT_GUID => {
                self.add_parent_guid(value);
                Ok(())
            }
            quirk_keys::PROXY_GUID => {
                self.state.write().proxy_guid = Some(value.to_string());
                Ok(())
            }
            quirk_keys::FIRMWARE_SIZE => {
                self.set_firmware_size(parse_number(value)?);
                Ok(())
            }
            quirk_keys::FIRMWARE_SIZE_MIN => {
                self.set_firmware_size_min(parse_number(value)?);
                Ok(())
            }
            quirk_keys::FIRMWARE_SIZE_MAX => {
                self.set_firmware_size_max(parse_number(value)?);
                Ok(())
            }
            quirk_keys::INSTALL_DURATION => {
                self.set_install_duration(parse_number(value)? as u32);
                Ok(())
            }
            quirk_keys::PRIORITY => {
                self.set_priority(parse_number(value)? as u32);
                Ok(())
            }
            quirk_keys::BATTERY_THRESHOLD => {
                self.set_battery_threshold(parse_number(value)? as u32);
                Ok(())
            }
            quirk_keys::REMOVE_DELAY => {
                self.set_remove_delay(parse_number(value)? as u32);
                Ok(())
            }
            quirk_keys::ACQUIESCE_DELAY => {
                self.set_acquiesce_delay(parse_number(value)? as u32);
                Ok(())
            }
            quirk_keys::VERSION_FORMAT => {
                let format = VersionFormat::from_name(value).ok_or_else(|| {
                    DeviceError::invalid_data(format!("version format {value} unsupported"))
                })?;
                self.set_version_format(format);
                Ok(())
            }
            quirk_keys::INHIBIT => self.set_quirk_inhibit_section(value),
            quirk_keys::GTYPE => {
                self.set_specialized_type(value);
                Ok(())
            }
            quirk_keys::PROXY_GTYPE => {
                self.set_proxy_type(value);
                Ok(())
            }
            quirk_keys::FIRMWARE_GTYPE => {
                self.set_firmware_type(value);
                Ok(())
            }
            quirk_keys::CHILDREN => {
                for directive in value.split(',') {
                    self.add_child_by_directive(directive)?;
                }
                Ok(())
            }
            _ => self.hooks.set_quirk_kv(self, key, value),
        }
    }

    /// The GUID used to match the proxy device.
    pub fn proxy_guid(&self) -> Option<String> {
        self.state.read().proxy_guid.clone()
    }

    /// Set the GUID used to match the proxy device.
    pub fn set_proxy_guid(&self, guid: &str) {
        self.state.write().proxy_guid = Some(guid.to_string());
    }

    /// Look up and apply all quirks registered for a GUID.
    ///
    /// Best-effort: a key failing to apply logs at debug level and the
    /// rest still apply.
    pub fn add_guid_quirks(&self, guid: &str) {
        let Some(ctx) = self.context() else { return };
        for (key, value) in ctx.lookup_quirks(guid) {
            debug!("quirk {key}={value} for {guid}");
            if let Err(e) = self.set_quirk_kv(&key, &value) {
                warn!("failed to apply quirk {key}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, QuirkSource};
    use crate::flags::private_flags;

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("1000").unwrap(), 1000);
        assert_eq!(parse_number("0x8000").unwrap(), 0x8000);
        assert!(parse_number("banana").is_err());
    }

    #[test]
    fn test_custom_flags_set_and_clear() {
        let device = Device::raw();
        device.add_flag(DeviceFlags::INTERNAL);
        device.set_custom_flags("updatable,~internal");
        assert!(device.has_flag(DeviceFlags::UPDATABLE));
        assert!(!device.has_flag(DeviceFlags::INTERNAL));
        assert_eq!(device.custom_flags().as_deref(), Some("updatable,~internal"));
    }

    #[test]
    fn test_custom_flags_resolve_private_registry() {
        let device = Device::raw();
        device.set_custom_flags("retry-open");
        assert!(device.has_private_flag(private_flags::RETRY_OPEN));
        device.set_custom_flags("~retry-open");
        assert!(!device.has_private_flag(private_flags::RETRY_OPEN));
    }

    #[test]
    fn test_custom_flags_ignore_unknown_tokens() {
        let device = Device::raw();
        device.set_custom_flags("no-such-flag,updatable");
        assert!(device.has_flag(DeviceFlags::UPDATABLE));
    }

    #[test]
    fn test_quirk_kv_core_keys() {
        let device = Device::raw();
        device.set_quirk_kv(quirk_keys::NAME, "ColorHug").unwrap();
        device.set_quirk_kv(quirk_keys::VENDOR, "Hughski").unwrap();
        device
            .set_quirk_kv(quirk_keys::PLUGIN, "colorhug,colorhug2")
            .unwrap();
        device
            .set_quirk_kv(quirk_keys::FIRMWARE_SIZE_MAX, "0x20000")
            .unwrap();
        device.set_quirk_kv(quirk_keys::REMOVE_DELAY, "8000").unwrap();
        device
            .set_quirk_kv(quirk_keys::VERSION_FORMAT, "triplet")
            .unwrap();

        assert_eq!(device.name().as_deref(), Some("ColorHug"));
        assert_eq!(device.vendor().as_deref(), Some("Hughski"));
        assert_eq!(
            device.possible_plugins(),
            vec!["colorhug".to_string(), "colorhug2".to_string()]
        );
        assert_eq!(device.firmware_size_max(), 0x20000);
        assert_eq!(device.remove_delay(), 8000);
        assert_eq!(device.version_format(), VersionFormat::Triplet);
    }

    #[test]
    fn test_quirk_inhibit_section() {
        let device = Device::raw();
        device.add_flag(DeviceFlags::UPDATABLE);
        device
            .set_quirk_kv(quirk_keys::INHIBIT, "vendor-borked:Wait for a fixed firmware")
            .unwrap();
        assert!(device.has_inhibit("vendor-borked"));

        // empty value unsets the inhibit
        device.set_quirk_kv(quirk_keys::INHIBIT, "vendor-borked:").unwrap();
        assert!(!device.has_inhibit("vendor-borked"));

        let err = device.set_quirk_kv(quirk_keys::INHIBIT, "malformed").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }

    #[test]
    fn test_quirk_type_bindings_first_write_wins() {
        let device = Device::raw();
        device.set_quirk_kv(quirk_keys::GTYPE, "FirstType").unwrap();
        device.set_quirk_kv(quirk_keys::GTYPE, "SecondType").unwrap();
        assert_eq!(device.specialized_type().as_deref(), Some("FirstType"));
    }

    #[test]
    fn test_quirk_children_directive() {
        let device = Device::raw();
        device.set_physical_id("usb:1");
        device
            .set_quirk_kv(quirk_keys::CHILDREN, "2fa8891f-3ece-53a4-adc4-0dd875685f30")
            .unwrap();
        let children = device.children();
        assert_eq!(children.len(), 1);
        assert!(children[0].has_instance_id(
            "2fa8891f-3ece-53a4-adc4-0dd875685f30",
            InstanceFlags::VISIBLE
        ));

        let err = device
            .set_quirk_kv(quirk_keys::CHILDREN, "NoSuchType|aabbccdd")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_unknown_quirk_key_falls_through() {
        let device = Device::raw();
        let err = device.set_quirk_kv("VendorSpecificKey", "1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }

    struct MapQuirks(Vec<(String, String)>);

    impl QuirkSource for MapQuirks {
        fn lookup(&self, _guid: &str) -> Vec<(String, String)> {
            self.0.clone()
        }
    }

    #[test]
    fn test_quirks_applied_on_instance_id() {
        let ctx = std::sync::Arc::new(Context::new());
        ctx.set_quirk_source(Box::new(MapQuirks(vec![
            (quirk_keys::NAME.to_string(), "Quirked Name".to_string()),
            (quirk_keys::FLAGS.to_string(), "updatable".to_string()),
            ("BadKey".to_string(), "ignored".to_string()),
        ])));
        let device = Device::raw();
        device.set_context(ctx);

        // adding a quirked instance ID triggers the lookup; the bad key
        // logs and the rest still apply
        device.add_instance_id("USB\\VID_273F&PID_1004");
        assert_eq!(device.name().as_deref(), Some("Quirked Name"));
        assert!(device.has_flag(DeviceFlags::UPDATABLE));
    }

    #[test]
    fn test_quirk_upgrade_to_quirks_triggers_lookup() {
        let ctx = std::sync::Arc::new(Context::new());
        ctx.set_quirk_source(Box::new(MapQuirks(vec![(
            quirk_keys::SUMMARY.to_string(),
            "Late quirk".to_string(),
        )])));
        let device = Device::raw();
        device.set_context(ctx);

        device.add_instance_id_full("USB\\VID_273F", InstanceFlags::VISIBLE);
        assert_eq!(device.summary(), None);

        // visible -> visible+quirks re-triggers the lookup
        device.add_instance_id_full("USB\\VID_273F", InstanceFlags::QUIRKS);
        assert_eq!(device.summary().as_deref(), Some("Late quirk"));
    }
}
