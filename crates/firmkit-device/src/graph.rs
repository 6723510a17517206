//! The parent/child/proxy device graph.
//!
//! Children are owned; parents are weak back-pointers, so edges are
//! acyclic by construction. The proxy link is weak by default and nulls
//! out when the proxy is destroyed; the `refcounted-proxy` private flag
//! opts into a strong reference, which also makes the proxy the event
//! redirect target so a multi-device interaction produces one timeline.

use std::sync::Arc;

use bitflags::bitflags;
use tracing::{debug, info, warn};

use crate::device::{Device, DeviceRef, SubscriptionId};
use crate::flags::{DeviceFlags, private_flags};

bitflags! {
    /// Which donor fields [`Device::incorporate`] copies when unset.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct IncorporateFlags: u32 {
        /// Vendor name
        const VENDOR = 1 << 0;
        /// Physical ID
        const PHYSICAL_ID = 1 << 1;
        /// Logical ID
        const LOGICAL_ID = 1 << 2;
        /// Backend ID
        const BACKEND_ID = 1 << 3;
        /// Numeric vendor ID
        const VID = 1 << 4;
        /// Numeric product ID
        const PID = 1 << 5;
        /// Vendor-ID strings
        const VENDOR_IDS = 1 << 6;
        /// Replug delay
        const REMOVE_DELAY = 1 << 7;
        /// Settle delay
        const ACQUIESCE_DELAY = 1 << 8;
        /// Icon names
        const ICONS = 1 << 9;
        /// Recorded events
        const EVENTS = 1 << 10;
        /// Update error string
        const UPDATE_ERROR = 1 << 11;
        /// Update state
        const UPDATE_STATE = 1 << 12;
        /// Post-update message
        const UPDATE_MESSAGE = 1 << 13;
        /// Post-update image
        const UPDATE_IMAGE = 1 << 14;
        /// Instance-ID entries
        const INSTANCE_IDS = 1 << 15;
        /// Possible plugin names
        const POSSIBLE_PLUGINS = 1 << 16;
        /// Instance-hash keys
        const INSTANCE_KEYS = 1 << 17;
    }
}

impl IncorporateFlags {
    /// Everything, plus the once-only extras handled by incorporate.
    pub const ALL: Self = Self::all();
}

impl Device {
    /// The parent device, if set and still alive.
    pub fn parent(&self) -> Option<DeviceRef> {
        self.state.read().parent.upgrade()
    }

    /// All child devices.
    pub fn children(&self) -> Vec<DeviceRef> {
        self.state.read().children.clone()
    }

    /// Walk to the top of the tree; self when there is no parent.
    pub fn root(self: &Arc<Self>) -> DeviceRef {
        let mut device = self.clone();
        while let Some(parent) = device.parent() {
            device = parent;
        }
        device
    }

    /// Set the parent back-pointer, inheriting the composite ID and the
    /// context.
    pub fn set_parent(&self, parent: Option<&Device>) {
        if let Some(parent) = parent {
            info!(
                "setting parent of {} to be {}",
                self.id_or_unset(),
                parent.id_or_unset()
            );
            if let Some(composite_id) = parent.composite_id() {
                self.set_composite_id(&composite_id);
            }
            if self.context().is_none()
                && let Some(ctx) = parent.context()
            {
                self.set_context(ctx);
            }
            let mut state = self.state.write();
            state.parent = parent.weak_self.clone();
            state.parent_id = parent.id();
        } else {
            let mut state = self.state.write();
            state.parent = std::sync::Weak::new();
            state.parent_id = None;
        }
    }

    /// Add a child device, wiring the reverse parent pointer.
    ///
    /// Duplicate-safe. An emulated parent forces the child emulated;
    /// active inhibits propagate down under `inhibit-children`; the
    /// remove and acquiesce delays ratchet up to the max over all
    /// children, with the acquiesce delay pushed back down; unset child
    /// fields are donated from the parent.
    pub fn add_child(&self, child: &DeviceRef) {
        // if the parent is emulated, the child must be too
        if self.has_flag(DeviceFlags::EMULATED) {
            child.add_flag(DeviceFlags::EMULATED);
        }

        child.convert_instance_ids();

        {
            let mut state = self.state.write();
            if !state.children.iter().any(|c| Arc::ptr_eq(c, child)) {
                state.children.push(child.clone());
            }
        }

        // propagate active inhibits down
        if self.has_private_flag(private_flags::INHIBIT_CHILDREN) {
            for (inhibit_id, reason) in self.inhibit_reasons() {
                child.inhibit(&inhibit_id, Some(&reason));
            }
        }

        // the parent delay is the max over all current children; child
        // removal never shrinks it back
        let children = self.children();
        for child_tmp in &children {
            let remove_delay = child_tmp.remove_delay();
            if remove_delay > self.remove_delay() {
                debug!(
                    "setting remove delay to {remove_delay}ms as child is greater than {}ms",
                    self.remove_delay()
                );
                self.set_remove_delay(remove_delay);
            }
        }
        for child_tmp in &children {
            let acquiesce_delay = child_tmp.acquiesce_delay();
            if acquiesce_delay > self.acquiesce_delay() {
                debug!(
                    "setting acquiesce delay to {acquiesce_delay}ms as child is greater than {}ms",
                    self.acquiesce_delay()
                );
                self.set_acquiesce_delay(acquiesce_delay);
            }
        }
        for child_tmp in &children {
            child_tmp.set_acquiesce_delay(self.acquiesce_delay());
        }

        // copy from the main device where unset
        child.incorporate(
            self,
            IncorporateFlags::PHYSICAL_ID
                | IncorporateFlags::BACKEND_ID
                | IncorporateFlags::REMOVE_DELAY
                | IncorporateFlags::ACQUIESCE_DELAY
                | IncorporateFlags::VENDOR_IDS
                | IncorporateFlags::ICONS
                | IncorporateFlags::VENDOR,
        );

        if let Err(e) = child.ensure_id() {
            warn!("failed to ensure child: {e}");
        }

        child.set_parent(Some(self));

        let observers: Vec<crate::device::ChildObserver> = self
            .observers
            .child_added
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for observer in observers {
            observer(child);
        }
    }

    /// Remove a child device, clearing its parent pointer.
    pub fn remove_child(&self, child: &DeviceRef) {
        let removed = {
            let mut state = self.state.write();
            let before = state.children.len();
            state.children.retain(|c| !Arc::ptr_eq(c, child));
            state.children.len() != before
        };
        if !removed {
            return;
        }
        child.set_parent(None);
        let observers: Vec<crate::device::ChildObserver> = self
            .observers
            .child_removed
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for observer in observers {
            observer(child);
        }
    }

    /// Remove all child devices.
    pub fn remove_children(&self) {
        for child in self.children() {
            self.remove_child(&child);
        }
    }

    /// Subscribe to child additions.
    pub fn subscribe_child_added<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&DeviceRef) + Send + Sync + 'static,
    {
        let token = self.observers.next_token();
        self.observers
            .child_added
            .lock()
            .push((token, Arc::new(callback)));
        SubscriptionId(token)
    }

    /// Remove a child-added subscription.
    pub fn unsubscribe_child_added(&self, id: SubscriptionId) {
        self.observers
            .child_added
            .lock()
            .retain(|(t, _)| *t != id.0);
    }

    /// Subscribe to child removals.
    pub fn subscribe_child_removed<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&DeviceRef) + Send + Sync + 'static,
    {
        let token = self.observers.next_token();
        self.observers
            .child_removed
            .lock()
            .push((token, Arc::new(callback)));
        SubscriptionId(token)
    }

    /// Remove a child-removed subscription.
    pub fn unsubscribe_child_removed(&self, id: SubscriptionId) {
        self.observers
            .child_removed
            .lock()
            .retain(|(t, _)| *t != id.0);
    }

    // ---- proxy ----

    /// The proxy device: strong if `refcounted-proxy`, else weak and
    /// `None` once the proxy is destroyed.
    pub fn proxy(&self) -> Option<DeviceRef> {
        let state = self.state.read();
        state
            .proxy_strong
            .clone()
            .or_else(|| state.proxy_weak.upgrade())
    }

    /// The proxy when `use-proxy-fallback` is set and one exists, else
    /// self.
    pub fn proxy_with_fallback(self: &Arc<Self>) -> DeviceRef {
        if self.has_private_flag(private_flags::USE_PROXY_FALLBACK)
            && let Some(proxy) = self.proxy()
        {
            return proxy;
        }
        self.clone()
    }

    fn mirror_proxy_flags(&self, proxy: &Device) {
        for flag in [DeviceFlags::EMULATED, DeviceFlags::UNREACHABLE] {
            if proxy.has_flag(flag) && !self.has_flag(flag) {
                debug!("propagating {:?} from proxy", flag.name());
                self.add_flag(flag);
            }
        }
    }

    /// Set the proxy device used to perform actions on our behalf.
    ///
    /// Copies the proxy's physical ID if ours is unset and mirrors the
    /// emulated/unreachable flags for as long as the link exists. With
    /// `refcounted-proxy` the reference is strong and the proxy becomes
    /// the event redirect target.
    pub fn set_proxy(&self, proxy: Option<&DeviceRef>) {
        if let Some(proxy) = proxy
            && std::ptr::eq(self, proxy.as_ref() as *const Device)
        {
            warn!("cannot use {} as its own proxy", self.id_or_unset());
            return;
        }

        // unchanged
        {
            let current = self.proxy();
            match (&current, proxy) {
                (Some(current), Some(new)) if Arc::ptr_eq(current, new) => return,
                (None, None) => return,
                _ => {}
            }
        }

        // disconnect from the old proxy
        let old_subscription = self.state.write().proxy_subscription.take();
        if let Some((old_proxy, token)) = old_subscription
            && let Some(old_proxy) = old_proxy.upgrade()
        {
            old_proxy.unsubscribe_flags(token);
        }

        if let Some(proxy) = proxy {
            self.incorporate(proxy, IncorporateFlags::PHYSICAL_ID);
            let weak_self = self.weak_self.clone();
            let token = proxy.subscribe_flags(move |proxy| {
                if let Some(this) = weak_self.upgrade() {
                    this.mirror_proxy_flags(proxy);
                }
            });
            self.state.write().proxy_subscription = Some((Arc::downgrade(proxy), token));
            self.mirror_proxy_flags(proxy);
        }

        // sometimes strong, sometimes weak
        if self.has_private_flag(private_flags::REFCOUNTED_PROXY) {
            self.state.write().proxy_strong = proxy.cloned();
            self.set_target(proxy.cloned());
        } else {
            let mut state = self.state.write();
            state.proxy_strong = None;
            state.proxy_weak = match proxy {
                Some(proxy) => Arc::downgrade(proxy),
                None => std::sync::Weak::new(),
            };
        }
    }

    // ---- incorporation ----

    /// Copy fields from a donor device, each only when unset on self.
    ///
    /// Used for child initialization and for superseding a disconnected
    /// device object with a freshly enumerated one. The context and
    /// backend links are donated unconditionally; everything else follows
    /// the flag set.
    pub fn incorporate(&self, donor: &Device, flags: IncorporateFlags) {
        // do these unconditionally
        if self.context().is_none()
            && let Some(ctx) = donor.context()
        {
            self.set_context(ctx);
        }
        if self.backend().is_none() {
            let donor_backend = donor.state.read().backend.clone();
            if donor_backend.as_ref().is_some_and(|b| b.upgrade().is_some()) {
                self.state.write().backend = donor_backend;
            }
        }

        if flags.contains(IncorporateFlags::VENDOR)
            && self.vendor().is_none()
            && let Some(vendor) = donor.vendor()
        {
            self.set_vendor(&vendor);
        }
        if flags.contains(IncorporateFlags::PHYSICAL_ID)
            && self.physical_id().is_none()
            && let Some(physical_id) = donor.physical_id()
        {
            self.set_physical_id(&physical_id);
        }
        if flags.contains(IncorporateFlags::LOGICAL_ID)
            && self.logical_id().is_none()
            && let Some(logical_id) = donor.logical_id()
        {
            self.set_logical_id(&logical_id);
        }
        if flags.contains(IncorporateFlags::BACKEND_ID)
            && self.state.read().backend_id.is_none()
            && let Some(backend_id) = donor.state.read().backend_id.clone()
        {
            self.set_backend_id(&backend_id);
        }
        if flags.contains(IncorporateFlags::VID) && self.vid() == 0 && donor.vid() != 0 {
            self.set_vid(donor.vid());
        }
        if flags.contains(IncorporateFlags::PID) && self.pid() == 0 && donor.pid() != 0 {
            self.set_pid(donor.pid());
        }
        if flags.contains(IncorporateFlags::VENDOR_IDS) {
            for vendor_id in donor.vendor_ids() {
                self.add_vendor_id(&vendor_id);
            }
        }
        if flags.contains(IncorporateFlags::REMOVE_DELAY)
            && self.remove_delay() == 0
            && donor.remove_delay() != 0
        {
            self.set_remove_delay(donor.remove_delay());
        }
        if flags.contains(IncorporateFlags::ACQUIESCE_DELAY)
            && self.acquiesce_delay() == 0
            && donor.acquiesce_delay() != 0
        {
            self.set_acquiesce_delay(donor.acquiesce_delay());
        }
        if flags.contains(IncorporateFlags::ICONS) && self.icons().is_empty() {
            for icon in donor.icons() {
                self.add_icon(&icon);
            }
        }
        if flags.contains(IncorporateFlags::EVENTS) {
            // a proxy already shares our timeline, copying would duplicate
            let donor_is_proxy = self
                .proxy()
                .is_some_and(|p| std::ptr::eq(p.as_ref() as *const Device, donor));
            if !donor_is_proxy {
                for event in donor.events.lock().items.clone() {
                    self.add_event(event);
                }
            }
        }
        if flags.contains(IncorporateFlags::UPDATE_ERROR)
            && self.update_error().is_none()
            && let Some(update_error) = donor.update_error()
        {
            self.set_update_error(Some(update_error));
        }
        if flags.contains(IncorporateFlags::UPDATE_STATE)
            && self.update_state() == crate::device::UpdateState::Unknown
            && donor.update_state() != crate::device::UpdateState::Unknown
        {
            self.set_update_state(donor.update_state());
        }
        if flags.contains(IncorporateFlags::UPDATE_MESSAGE)
            && self.update_message().is_none()
            && let Some(message) = donor.update_message()
        {
            self.set_update_message(&message);
        }
        if flags.contains(IncorporateFlags::UPDATE_IMAGE)
            && self.update_image().is_none()
            && let Some(image) = donor.update_image()
        {
            self.set_update_image(&image);
        }
        if flags.contains(IncorporateFlags::INSTANCE_IDS) {
            let no_generic_guids = self.has_private_flag(private_flags::NO_GENERIC_GUIDS);
            for item in donor.instance_items() {
                if item.flags.contains(crate::flags::InstanceFlags::GENERIC) && no_generic_guids {
                    continue;
                }
                match &item.instance_id {
                    Some(instance_id) => self.add_instance_id_full(instance_id, item.flags),
                    None => self.add_instance_id_full(&item.guid, item.flags),
                }
            }
        }
        if flags.contains(IncorporateFlags::POSSIBLE_PLUGINS) {
            for plugin in donor.possible_plugins() {
                self.add_possible_plugin(&plugin);
            }
        }
        if flags.contains(IncorporateFlags::INSTANCE_KEYS) {
            let donor_hash = donor.state.read().instance_hash.clone();
            if let Some(donor_hash) = donor_hash {
                for (key, value) in donor_hash {
                    if self.instance_str(&key).is_none() {
                        self.add_instance_str(&key, &value);
                    }
                }
            }
        }

        // the once-only extras
        if flags == IncorporateFlags::ALL {
            self.incorporate_all_extras(donor);
        }

        // run the subclass incorporate exactly once
        self.hooks.incorporate(self, donor);
    }

    fn incorporate_all_extras(&self, donor: &Device) {
        // only private flags our own type has registered
        let donor_private: Vec<String> = donor
            .state
            .read()
            .private_flags
            .iter()
            .cloned()
            .collect();
        for flag in donor_private {
            if crate::registry::private_flag_is_registered(self.kind(), &flag) {
                self.add_private_flag(&flag);
            }
        }
        if self.created_usec() == 0 && donor.created_usec() != 0 {
            self.set_created_usec(donor.created_usec());
        }
        if self.modified_usec() == 0 && donor.modified_usec() != 0 {
            self.set_modified_usec(donor.modified_usec());
        }
        if self.equivalent_id().is_none()
            && let Some(equivalent_id) = donor.equivalent_id()
        {
            self.set_equivalent_id(&equivalent_id);
        }
        if donor.required_free() > 0 {
            self.set_required_free(donor.required_free());
        }
        if self.update_request_id().is_none()
            && let Some(request_id) = donor.update_request_id()
        {
            self.set_update_request_id(&request_id);
        }
        if self.has_private_flag(private_flags::REFCOUNTED_PROXY)
            && donor.has_private_flag(private_flags::REFCOUNTED_PROXY)
            && self.proxy().is_none()
            && let Some(proxy) = donor.proxy()
        {
            self.set_proxy(Some(&proxy));
        }
        if self.state.read().custom_flags.is_none() {
            let donor_custom = donor.state.read().custom_flags.clone();
            if let Some(custom_flags) = donor_custom {
                self.set_custom_flags(&custom_flags);
            }
        }
        for guid in donor.parent_guids() {
            self.add_parent_guid(&guid);
        }
        let donor_metadata = donor.state.read().metadata.clone();
        if let Some(donor_metadata) = donor_metadata {
            for (key, value) in donor_metadata {
                if self.metadata(&key).is_none() {
                    self.set_metadata(&key, &value);
                }
            }
        }

        // match quirks against the donated instance IDs
        for instance_id in donor.instance_ids() {
            let guid = crate::identity::guid_from_string(&instance_id);
            self.add_guid_quirks(&guid);
        }
    }

    /// Copy properties from the old, no-longer-connected device object to
    /// this freshly enumerated one.
    pub fn replace(&self, donor: &Device) {
        self.hooks.replace(self, donor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_add_child_wires_parent_and_composite() {
        let parent = Device::raw();
        parent.set_physical_id("usb:1");
        parent.ensure_id().unwrap();
        let child = Device::raw();
        child.set_physical_id("usb:1-2");

        parent.add_child(&child);
        assert!(Arc::ptr_eq(&child.parent().unwrap(), &parent));
        assert_eq!(child.parent_id(), parent.id());
        assert_eq!(child.composite_id(), parent.id());
        assert!(Arc::ptr_eq(&child.root(), &parent));

        // duplicate-safe
        parent.add_child(&child);
        assert_eq!(parent.children().len(), 1);
    }

    #[test]
    fn test_remove_delay_ratchets_up() {
        let parent = Device::raw();
        parent.set_physical_id("usb:1");
        let child = Device::raw();
        child.set_physical_id("usb:1-2");
        child.set_remove_delay(5000);

        parent.add_child(&child);
        assert_eq!(parent.remove_delay(), 5000);

        // the ratchet never shrinks on removal
        parent.remove_child(&child);
        assert_eq!(parent.remove_delay(), 5000);
        assert!(child.parent().is_none());
    }

    #[test]
    fn test_acquiesce_delay_pushed_down() {
        let parent = Device::raw();
        parent.set_physical_id("usb:1");
        let slow = Device::raw();
        slow.set_physical_id("usb:1-2");
        slow.set_acquiesce_delay(9000);
        let fast = Device::raw();
        fast.set_physical_id("usb:1-3");
        fast.set_acquiesce_delay(100);

        parent.add_child(&slow);
        parent.add_child(&fast);
        assert_eq!(parent.acquiesce_delay(), 9000);
        assert_eq!(fast.acquiesce_delay(), 9000);
    }

    #[test]
    fn test_emulated_parent_forces_child() {
        let parent = Device::raw();
        parent.set_physical_id("usb:1");
        parent.add_flag(DeviceFlags::EMULATED);
        let child = Device::raw();
        child.set_physical_id("usb:1-2");
        parent.add_child(&child);
        assert!(child.has_flag(DeviceFlags::EMULATED));
    }

    #[test]
    fn test_child_donated_fields_only_if_unset() {
        let parent = Device::raw();
        parent.set_physical_id("usb:1");
        parent.set_vendor("Hughski");
        parent.add_vendor_id("USB:0x273F");
        let child = Device::raw();
        child.set_vendor("Somebody Else");

        parent.add_child(&child);
        assert_eq!(child.vendor().as_deref(), Some("Somebody Else"));
        assert_eq!(child.physical_id().as_deref(), Some("usb:1"));
        assert_eq!(child.vendor_ids(), vec!["USB:0x273F".to_string()]);
    }

    #[test]
    fn test_child_added_notification() {
        let parent = Device::raw();
        parent.set_physical_id("usb:1");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_tx = seen.clone();
        let sub = parent.subscribe_child_added(move |child: &DeviceRef| {
            seen_tx.lock().push(child.physical_id());
        });

        let child = Device::raw();
        child.set_physical_id("usb:1-2");
        parent.add_child(&child);
        assert_eq!(seen.lock().len(), 1);

        parent.unsubscribe_child_added(sub);
        let other = Device::raw();
        other.set_physical_id("usb:1-3");
        parent.add_child(&other);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_weak_proxy_clears_on_drop() {
        let device = Device::raw();
        let proxy = Device::raw();
        proxy.set_physical_id("usb:9");
        device.set_proxy(Some(&proxy));
        assert!(device.proxy().is_some());
        // the physical ID was copied over one-time
        assert_eq!(device.physical_id().as_deref(), Some("usb:9"));

        drop(proxy);
        assert!(device.proxy().is_none());
    }

    #[test]
    fn test_refcounted_proxy_is_strong_and_event_target() {
        let device = Device::raw();
        device.add_private_flag(private_flags::REFCOUNTED_PROXY);
        let proxy = Device::raw();
        proxy.set_physical_id("usb:9");
        device.set_proxy(Some(&proxy.clone()));

        // events recorded on the logical device land in the proxy log
        device.save_event("TestEvent").set_i64("Value", 7);
        assert_eq!(proxy.events().len(), 1);

        let weak = Arc::downgrade(&proxy);
        drop(proxy);
        assert!(weak.upgrade().is_some());
        assert!(device.proxy().is_some());
    }

    #[test]
    fn test_proxy_flags_mirrored() {
        let device = Device::raw();
        let proxy = Device::raw();
        proxy.set_physical_id("usb:9");
        device.set_proxy(Some(&proxy));

        proxy.add_flag(DeviceFlags::EMULATED);
        assert!(device.has_flag(DeviceFlags::EMULATED));

        proxy.add_flag(DeviceFlags::UNREACHABLE);
        assert!(device.has_flag(DeviceFlags::UNREACHABLE));
    }

    #[test]
    fn test_proxy_with_fallback() {
        let device = Device::raw();
        let proxy = Device::raw();
        proxy.set_physical_id("usb:9");
        device.set_proxy(Some(&proxy));

        // without the opt-in flag, fallback returns self
        assert!(Arc::ptr_eq(&device.proxy_with_fallback(), &device));
        device.add_private_flag(private_flags::USE_PROXY_FALLBACK);
        assert!(Arc::ptr_eq(&device.proxy_with_fallback(), &proxy));
    }

    #[test]
    fn test_incorporate_only_if_unset() {
        let donor = Device::raw();
        donor.set_physical_id("usb:1");
        donor.set_vendor("Hughski");
        donor.set_update_message("replug it");
        donor.add_instance_str("VID", "273F");

        let device = Device::raw();
        device.set_vendor("Existing");
        device.incorporate(&donor, IncorporateFlags::ALL);
        assert_eq!(device.vendor().as_deref(), Some("Existing"));
        assert_eq!(device.physical_id().as_deref(), Some("usb:1"));
        assert_eq!(device.update_message().as_deref(), Some("replug it"));
        assert_eq!(device.instance_str("VID").as_deref(), Some("273F"));
    }

    #[test]
    fn test_composite_id_rewritten_on_id_churn() {
        let parent = Device::raw();
        parent.set_physical_id("usb:1");
        parent.ensure_id().unwrap();
        let child = Device::raw();
        child.set_physical_id("usb:1-2");
        parent.add_child(&child);
        let old_composite = child.composite_id();

        // identity churn: the composite follows the new parent ID
        parent.set_id("mylittlepony");
        assert_ne!(child.composite_id(), old_composite);
        assert_eq!(child.composite_id(), parent.id());
        assert_eq!(child.parent_id(), parent.id());
    }
}
