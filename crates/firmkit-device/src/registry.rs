//! Process-wide registries.
//!
//! Two registries live here:
//!
//! - the **private-flag registry**, which interns the string-named flags
//!   each concrete device type is allowed to use, and
//! - the **type registry**, which maps string type names to factory
//!   functions for late-bound device and firmware-container construction
//!   (quirk files select types by name).
//!
//! Both are lazily initialized and read-mostly after startup.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::{debug, error};

use firmkit_errors::prelude::*;

use crate::device::DeviceRef;
use crate::firmware::FirmwareContainer;
use crate::flags::private_flags;

type FlagRegistry = RwLock<HashMap<String, HashSet<String>>>;

fn flag_registry() -> &'static FlagRegistry {
    static REGISTRY: OnceLock<FlagRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Ensure the baseline flag set is registered for a device type.
///
/// Idempotent; called the first time any private-flag operation touches an
/// instance of the type.
pub(crate) fn ensure_baseline(kind: &str) {
    let mut registry = flag_registry().write();
    let flags = registry.entry(kind.to_string()).or_default();
    if flags.is_empty() {
        for flag in private_flags::BASELINE {
            flags.insert((*flag).to_string());
        }
    }
}

/// Register a private flag for a device type.
///
/// Registering the same custom name twice is a programming error and logs
/// loudly; re-registering a baseline name is silently ignored.
pub(crate) fn register_private_flag(kind: &str, flag: &str) {
    ensure_baseline(kind);
    let mut registry = flag_registry().write();
    let flags = registry.entry(kind.to_string()).or_default();
    if !flags.insert(flag.to_string()) && !private_flags::BASELINE.contains(&flag) {
        error!("already registered private {kind} flag {flag}");
    }
}

/// Check whether a private flag has been registered for a device type.
pub(crate) fn private_flag_is_registered(kind: &str, flag: &str) -> bool {
    ensure_baseline(kind);
    let registry = flag_registry().read();
    registry.get(kind).is_some_and(|flags| flags.contains(flag))
}

type DeviceFactory = Arc<dyn Fn() -> DeviceRef + Send + Sync>;
type ContainerFactory = Arc<dyn Fn() -> Box<dyn FirmwareContainer> + Send + Sync>;

#[derive(Default)]
struct TypeRegistry {
    devices: HashMap<String, DeviceFactory>,
    containers: HashMap<String, ContainerFactory>,
}

fn type_registry() -> &'static RwLock<TypeRegistry> {
    static REGISTRY: OnceLock<RwLock<TypeRegistry>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(TypeRegistry::default()))
}

/// Register a device constructor under a type name.
///
/// Plugin modules call this at startup; quirk directives such as
/// `Children = Type|GUID` then construct by name. First registration wins;
/// a duplicate name logs loudly and is ignored.
pub fn register_device_type<F>(name: &str, factory: F)
where
    F: Fn() -> DeviceRef + Send + Sync + 'static,
{
    let mut registry = type_registry().write();
    if registry.devices.contains_key(name) {
        error!("device type {name} already registered");
        return;
    }
    debug!("registered device type {name}");
    registry.devices.insert(name.to_string(), Arc::new(factory));
}

/// Register a firmware-container constructor under a type name.
pub fn register_container_type<F>(name: &str, factory: F)
where
    F: Fn() -> Box<dyn FirmwareContainer> + Send + Sync + 'static,
{
    let mut registry = type_registry().write();
    if registry.containers.contains_key(name) {
        error!("container type {name} already registered");
        return;
    }
    debug!("registered container type {name}");
    registry
        .containers
        .insert(name.to_string(), Arc::new(factory));
}

/// Construct a device from a registered type name.
///
/// # Errors
///
/// Returns [`DeviceError::InvalidData`] for an unknown name; an unknown
/// type is an explicit error, never a null-type sentinel.
pub fn create_device(name: &str) -> Result<DeviceRef> {
    let factory = {
        let registry = type_registry().read();
        registry.devices.get(name).cloned()
    };
    let factory =
        factory.ok_or_else(|| DeviceError::invalid_data(format!("unknown device type {name}")))?;
    Ok(factory())
}

/// Construct a firmware container from a registered type name.
///
/// # Errors
///
/// Returns [`DeviceError::InvalidData`] for an unknown name.
pub fn create_container(name: &str) -> Result<Box<dyn FirmwareContainer>> {
    let factory = {
        let registry = type_registry().read();
        registry.containers.get(name).cloned()
    };
    let factory = factory
        .ok_or_else(|| DeviceError::invalid_data(format!("unknown container type {name}")))?;
    Ok(factory())
}
