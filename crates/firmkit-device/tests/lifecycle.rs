//! The generic update flow a daemon drives, end to end: enumerate →
//! open → prepare → detach → write → attach → cleanup → close, with no
//! device-specific branches in the orchestration.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;

use firmkit_device::{
    Device, DeviceFlags, DeviceHooks, DeviceProblem, FirmwareContainer, InstallFlags, ParseFlags,
    Progress, VersionFormat, private_flags,
};

#[derive(Default)]
struct Dfu {
    detached: AtomicU32,
    attached: AtomicU32,
    writes: AtomicU32,
}

struct DfuDevice(Arc<Dfu>);

impl DeviceHooks for DfuDevice {
    fn kind(&self) -> &'static str {
        "dfu-device"
    }

    fn probe(&self, device: &Device) -> firmkit_device::Result<()> {
        device.set_physical_id("usb:2-1");
        device.set_vid(0x273f);
        device.set_pid(0x1004);
        device.add_instance_u16("VID", 0x273f);
        device.add_instance_u16("PID", 0x1004);
        device.build_instance_id("USB", &["VID", "PID"])?;
        Ok(())
    }

    fn setup(&self, device: &Device) -> firmkit_device::Result<()> {
        device.set_version_format(VersionFormat::Triplet);
        device.set_version_raw(0x01020003);
        device.add_flag(DeviceFlags::UPDATABLE);
        Ok(())
    }

    fn detach(&self, device: &Device, _progress: &Progress) -> firmkit_device::Result<()> {
        self.0.detached.fetch_add(1, Ordering::SeqCst);
        device.add_flag(DeviceFlags::IS_BOOTLOADER);
        Ok(())
    }

    fn attach(&self, device: &Device, _progress: &Progress) -> firmkit_device::Result<()> {
        self.0.attached.fetch_add(1, Ordering::SeqCst);
        device.remove_flag(DeviceFlags::IS_BOOTLOADER);
        Ok(())
    }

    fn write_firmware(
        &self,
        _device: &Device,
        firmware: &dyn FirmwareContainer,
        progress: &Progress,
        _flags: InstallFlags,
    ) -> firmkit_device::Result<()> {
        let chunks = firmware.bytes().chunks(4).count() as u32;
        progress.set_steps(chunks);
        for _ in 0..chunks {
            progress.step_done();
        }
        self.0.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_generic_update_flow() -> Result<()> {
    let state = Arc::new(Dfu::default());
    let device = Device::new(Box::new(DfuDevice(state.clone())));
    device.set_firmware_size_max(64);

    device.open()?;
    assert_eq!(device.version().as_deref(), Some("1.2.3"));
    assert!(device.has_guid(&firmkit_device::guid_from_string(
        "USB\\VID_273F&PID_1004"
    )));

    let progress = Progress::new();
    let firmware = device.prepare_firmware(&[0xaa; 16], &progress, ParseFlags::empty())?;

    device.prepare(&progress, InstallFlags::empty())?;
    device.detach(&progress)?;
    assert!(device.has_flag(DeviceFlags::IS_BOOTLOADER));

    device.write_firmware(firmware.as_ref(), &progress, InstallFlags::empty())?;
    assert_eq!(progress.percentage(), 100);

    device.attach(&progress)?;
    assert!(!device.has_flag(DeviceFlags::IS_BOOTLOADER));
    device.cleanup(&progress, InstallFlags::empty())?;
    device.close()?;

    assert_eq!(state.detached.load(Ordering::SeqCst), 1);
    assert_eq!(state.writes.load(Ordering::SeqCst), 1);
    assert_eq!(state.attached.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_child_delay_propagates_to_parent() -> Result<()> {
    // scenario: a composite device where only the child knows it needs
    // five seconds to re-enumerate
    let parent = Device::raw();
    parent.set_physical_id("usb:3");
    parent.set_remove_delay(0);
    let child = Device::raw();
    child.set_physical_id("usb:3-1");
    child.set_remove_delay(5000);

    parent.add_child(&child);
    assert_eq!(parent.remove_delay(), 5000);
    Ok(())
}

#[test]
fn test_inhibit_gates_updatability_end_to_end() -> Result<()> {
    let device = Device::raw();
    device.add_flag(DeviceFlags::UPDATABLE);

    device.add_flag(DeviceFlags::UNREACHABLE);
    assert!(device.has_problem(DeviceProblem::UNREACHABLE));
    assert!(!device.has_flag(DeviceFlags::UPDATABLE));
    assert!(device.has_flag(DeviceFlags::UPDATABLE_HIDDEN));

    device.remove_flag(DeviceFlags::UNREACHABLE);
    assert!(!device.has_problem(DeviceProblem::UNREACHABLE));
    assert!(device.has_flag(DeviceFlags::UPDATABLE));
    Ok(())
}

#[test]
fn test_facade_opens_through_proxy() -> Result<()> {
    let proxy = Device::raw();
    proxy.set_physical_id("usb:9");
    let device = Device::raw();
    device.set_physical_id("usb:9-1");
    device.add_private_flag(private_flags::USE_PROXY_FOR_OPEN);
    device.set_proxy(Some(&proxy));

    device.open()?;
    assert!(proxy.has_private_flag(private_flags::IS_OPEN));
    assert!(device.has_private_flag(private_flags::IS_OPEN));

    device.close()?;
    assert!(!proxy.has_private_flag(private_flags::IS_OPEN));
    assert!(!device.has_private_flag(private_flags::IS_OPEN));
    Ok(())
}
