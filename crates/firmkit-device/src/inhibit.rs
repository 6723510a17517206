//! The inhibit tracker.
//!
//! Each inhibit is a named reason preventing the device from being
//! offered for update. The aggregate rule is simple and absolute: a
//! device with any active inhibit cannot carry the `updatable` flag, only
//! `updatable-hidden`; emptying the inhibit map restores it. The
//! update-error string is recomputed as the comma-join of the active
//! reasons on every change, and the aggregate problem bitset is
//! republished alongside.

use std::collections::BTreeMap;

use tracing::debug;

use crate::context::BATTERY_LEVEL_INVALID;
use crate::device::{Device, Inhibit};
use crate::flags::{DeviceFlags, DeviceProblem, private_flags};

impl Device {
    fn problem_to_reason(&self, problem: DeviceProblem) -> String {
        if problem == DeviceProblem::UNREACHABLE {
            return "Device is unreachable, or out of wireless range".to_string();
        }
        if problem == DeviceProblem::UPDATE_PENDING {
            return "Device is waiting for the update to be applied".to_string();
        }
        if problem == DeviceProblem::REQUIRE_AC_POWER {
            return "Device requires AC power to be connected".to_string();
        }
        if problem == DeviceProblem::LID_IS_CLOSED {
            return "Device cannot be used while the lid is closed".to_string();
        }
        if problem == DeviceProblem::IS_EMULATED {
            return "Device is emulated".to_string();
        }
        if problem == DeviceProblem::UPDATE_IN_PROGRESS {
            return "An update is in progress".to_string();
        }
        if problem == DeviceProblem::IN_USE {
            return "Device is in use".to_string();
        }
        if problem == DeviceProblem::DISPLAY_REQUIRED {
            return "Device requires a display to be plugged in".to_string();
        }
        if problem == DeviceProblem::MISSING_LICENSE {
            return "Device does not have the necessary license installed".to_string();
        }
        if problem == DeviceProblem::LOWER_PRIORITY {
            return match self.equivalent_id() {
                Some(equivalent_id) => {
                    format!("Device is lower priority than equivalent device {equivalent_id}")
                }
                None => "Device is lower priority than an equivalent device".to_string(),
            };
        }
        if problem == DeviceProblem::SYSTEM_POWER_TOO_LOW {
            return match self.context() {
                Some(ctx) => format!(
                    "System power is too low ({}%, requires {}%)",
                    ctx.battery_level(),
                    ctx.battery_threshold()
                ),
                None => "System power is too low".to_string(),
            };
        }
        if problem == DeviceProblem::POWER_TOO_LOW {
            let level = self.battery_level();
            let threshold = self.battery_threshold();
            if level == BATTERY_LEVEL_INVALID || threshold == BATTERY_LEVEL_INVALID {
                return "Device battery power is too low".to_string();
            }
            return format!(
                "Device battery power is too low ({level}%, requires {threshold}%)"
            );
        }
        "Device cannot be updated".to_string()
    }

    /// Re-derive the aggregate state from the inhibit map: the
    /// updatable/updatable-hidden exchange, the update-error string, and
    /// the problem bitset.
    pub(crate) fn ensure_inhibits(&self) {
        {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let empty = BTreeMap::new();
            let inhibits = state.inhibits.as_ref().unwrap_or(&empty);
            let mut problems = DeviceProblem::empty();
            if inhibits.is_empty() {
                if state.flags.contains(DeviceFlags::UPDATABLE_HIDDEN) {
                    state.flags.remove(DeviceFlags::UPDATABLE_HIDDEN);
                    state.flags.insert(DeviceFlags::UPDATABLE);
                }
                state.update_error = None;
            } else {
                // devices might have inhibits and *not* be automatically
                // updatable, so only exchange an existing updatable flag
                if state.flags.contains(DeviceFlags::UPDATABLE) {
                    state.flags.remove(DeviceFlags::UPDATABLE);
                    state.flags.insert(DeviceFlags::UPDATABLE_HIDDEN);
                }
                let reasons: Vec<&str> = inhibits.values().map(|i| i.reason.as_str()).collect();
                for inhibit in inhibits.values() {
                    problems |= inhibit.problem;
                }
                state.update_error = Some(reasons.join(", "));
            }
            state.problems = problems;
        }
        self.notify_flags_changed();
    }

    pub(crate) fn inhibit_full(
        &self,
        problem: DeviceProblem,
        inhibit_id: Option<&str>,
        reason: Option<&str>,
    ) {
        let inhibit_id = match inhibit_id {
            Some(id) => id.to_string(),
            None => problem
                .name()
                .unwrap_or("unknown-problem")
                .to_string(),
        };

        // compute before taking the write lock, the reason reads state
        let reason = match reason {
            Some(reason) => reason.to_string(),
            None => self.problem_to_reason(problem),
        };

        {
            let mut state = self.state.write();
            let inhibits = state.inhibits.get_or_insert_with(BTreeMap::new);
            if inhibits.contains_key(&inhibit_id) {
                return;
            }
            debug!("inhibiting [{inhibit_id}]: {reason}");
            inhibits.insert(
                inhibit_id.clone(),
                Inhibit {
                    problem,
                    reason: reason.clone(),
                },
            );
        }
        self.ensure_inhibits();

        if self.has_private_flag(private_flags::INHIBIT_CHILDREN) {
            for child in self.children() {
                child.inhibit_full(problem, Some(&inhibit_id), Some(&reason));
            }
        }
    }

    /// Prevent the device from being updated under a unique ID.
    ///
    /// Idempotent: an inhibit already present under the same ID is
    /// ignored. Without a reason a canned per-problem message is used.
    pub fn inhibit(&self, inhibit_id: &str, reason: Option<&str>) {
        self.inhibit_full(DeviceProblem::empty(), Some(inhibit_id), reason);
    }

    /// Check for an inhibit with a specific ID.
    pub fn has_inhibit(&self, inhibit_id: &str) -> bool {
        self.state
            .read()
            .inhibits
            .as_ref()
            .is_some_and(|map| map.contains_key(inhibit_id))
    }

    /// Allow the device to be updated again if no other inhibitors
    /// remain. Removing a non-existent inhibit is a no-op.
    pub fn uninhibit(&self, inhibit_id: &str) {
        let removed = {
            let mut state = self.state.write();
            state
                .inhibits
                .as_mut()
                .is_some_and(|map| map.remove(inhibit_id).is_some())
        };
        if removed {
            self.ensure_inhibits();
        }
        if self.has_private_flag(private_flags::INHIBIT_CHILDREN) {
            for child in self.children() {
                child.uninhibit(inhibit_id);
            }
        }
    }

    /// Add a well-known problem, inhibiting under the problem's name.
    pub fn add_problem(&self, problem: DeviceProblem) {
        if problem.is_empty() {
            return;
        }
        self.inhibit_full(problem, None, None);
    }

    /// Remove a well-known problem.
    pub fn remove_problem(&self, problem: DeviceProblem) {
        let Some(name) = problem.name() else { return };
        self.uninhibit(name);
    }

    /// Query a well-known problem.
    pub fn has_problem(&self, problem: DeviceProblem) -> bool {
        problem.name().is_some_and(|name| self.has_inhibit(name))
    }

    /// The aggregate problem bitset derived from the inhibit map.
    pub fn problems(&self) -> DeviceProblem {
        self.state.read().problems
    }

    /// Active inhibit IDs and reasons, for export and debugging.
    pub fn inhibit_reasons(&self) -> Vec<(String, String)> {
        self.state
            .read()
            .inhibits
            .as_ref()
            .map(|map| {
                map.iter()
                    .map(|(id, inhibit)| (id.clone(), inhibit.reason.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Re-derive the device-battery inhibit after a level or threshold
    /// change.
    pub(crate) fn ensure_battery_inhibit(&self) {
        let level = self.battery_level();
        if level == BATTERY_LEVEL_INVALID || level >= self.battery_threshold() {
            self.remove_problem(DeviceProblem::POWER_TOO_LOW);
            return;
        }
        self.add_problem(DeviceProblem::POWER_TOO_LOW);
    }

    /// Re-derive the system-power inhibit from the shared context.
    ///
    /// Called when the context is attached; the daemon calls it again
    /// whenever system power changes.
    pub fn refresh_system_power_inhibit(&self) {
        if self.has_private_flag(private_flags::IGNORE_SYSTEM_POWER) {
            self.remove_problem(DeviceProblem::SYSTEM_POWER_TOO_LOW);
            return;
        }
        let too_low = self
            .context()
            .is_some_and(|ctx| ctx.system_power_too_low());
        if too_low {
            self.add_problem(DeviceProblem::SYSTEM_POWER_TOO_LOW);
        } else {
            self.remove_problem(DeviceProblem::SYSTEM_POWER_TOO_LOW);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::device::Device;
    use std::sync::Arc;

    #[test]
    fn test_inhibit_round_trip() {
        let device = Device::raw();
        device.add_flag(DeviceFlags::UPDATABLE);

        device.inhibit("low-power", Some("Device battery is too low"));
        assert!(device.has_inhibit("low-power"));
        assert!(!device.has_flag(DeviceFlags::UPDATABLE));
        assert!(device.has_flag(DeviceFlags::UPDATABLE_HIDDEN));
        assert_eq!(
            device.update_error().as_deref(),
            Some("Device battery is too low")
        );

        // idempotent: the first reason wins
        device.inhibit("low-power", Some("another reason"));
        assert_eq!(
            device.update_error().as_deref(),
            Some("Device battery is too low")
        );

        device.uninhibit("low-power");
        assert!(!device.has_inhibit("low-power"));
        assert!(device.has_flag(DeviceFlags::UPDATABLE));
        assert_eq!(device.update_error(), None);

        // removing a non-existent inhibit is a no-op
        device.uninhibit("low-power");
        assert!(device.has_flag(DeviceFlags::UPDATABLE));
    }

    #[test]
    fn test_update_error_is_comma_join() {
        let device = Device::raw();
        device.inhibit("aa", Some("first reason"));
        device.inhibit("bb", Some("second reason"));
        assert_eq!(
            device.update_error().as_deref(),
            Some("first reason, second reason")
        );
        device.uninhibit("aa");
        assert_eq!(device.update_error().as_deref(), Some("second reason"));
    }

    #[test]
    fn test_not_automatically_updatable() {
        // a device that was never updatable must not become updatable
        // just because its inhibits clear
        let device = Device::raw();
        device.inhibit("reason", None);
        device.uninhibit("reason");
        assert!(!device.has_flag(DeviceFlags::UPDATABLE));
    }

    #[test]
    fn test_problems_aggregate() {
        let device = Device::raw();
        device.add_problem(DeviceProblem::UNREACHABLE);
        device.add_problem(DeviceProblem::UPDATE_PENDING);
        assert_eq!(
            device.problems(),
            DeviceProblem::UNREACHABLE | DeviceProblem::UPDATE_PENDING
        );
        device.remove_problem(DeviceProblem::UNREACHABLE);
        assert_eq!(device.problems(), DeviceProblem::UPDATE_PENDING);
    }

    #[test]
    fn test_battery_inhibit_automatic() {
        let device = Device::raw();
        device.add_flag(DeviceFlags::UPDATABLE);
        device.set_battery_threshold(20);

        device.set_battery_level(10);
        assert!(device.has_problem(DeviceProblem::POWER_TOO_LOW));
        assert!(!device.has_flag(DeviceFlags::UPDATABLE));
        let reason = device.update_error().unwrap();
        assert!(reason.contains("10%"));
        assert!(reason.contains("20%"));

        device.set_battery_level(80);
        assert!(!device.has_problem(DeviceProblem::POWER_TOO_LOW));
        assert!(device.has_flag(DeviceFlags::UPDATABLE));
    }

    #[test]
    fn test_system_power_inhibit() {
        let ctx = Arc::new(Context::new());
        ctx.set_battery_level(5);
        let device = Device::raw();
        device.add_flag(DeviceFlags::UPDATABLE);
        device.set_context(ctx.clone());
        assert!(device.has_problem(DeviceProblem::SYSTEM_POWER_TOO_LOW));
        let reason = device.update_error().unwrap();
        assert!(reason.contains("5%"));

        ctx.set_battery_level(95);
        device.refresh_system_power_inhibit();
        assert!(!device.has_problem(DeviceProblem::SYSTEM_POWER_TOO_LOW));
        assert!(device.has_flag(DeviceFlags::UPDATABLE));
    }

    #[test]
    fn test_inhibit_children_propagation() {
        let parent = Device::raw();
        parent.set_physical_id("usb:1");
        parent.add_private_flag(private_flags::INHIBIT_CHILDREN);
        let child = Device::raw();
        child.set_physical_id("usb:1-2");
        parent.add_child(&child);

        parent.inhibit("shared", Some("Parent is busy"));
        assert!(child.has_inhibit("shared"));

        parent.uninhibit("shared");
        assert!(!child.has_inhibit("shared"));

        // inhibits already active propagate onto late-added children
        parent.inhibit("early", None);
        let late = Device::raw();
        late.set_physical_id("usb:1-3");
        parent.add_child(&late);
        assert!(late.has_inhibit("early"));
    }

    #[test]
    fn test_unconnected_private_flag_inhibits() {
        let device = Device::raw();
        device.add_flag(DeviceFlags::UPDATABLE);
        device.add_private_flag(private_flags::UNCONNECTED);
        assert!(device.has_inhibit("unconnected"));
        assert!(!device.has_flag(DeviceFlags::UPDATABLE));
        device.remove_private_flag(private_flags::UNCONNECTED);
        assert!(device.has_flag(DeviceFlags::UPDATABLE));
    }
}
