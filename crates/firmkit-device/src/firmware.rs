//! Firmware container capability.
//!
//! The core never interprets firmware contents itself; it parses payloads
//! through this capability interface and enforces the declared size
//! bounds. Concrete container formats are registered by name in
//! [`crate::registry`] and selected by quirk.

use bitflags::bitflags;

use firmkit_errors::prelude::*;

bitflags! {
    /// Flags controlling firmware parsing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[repr(transparent)]
    pub struct ParseFlags: u32 {
        /// Skip strict content validation
        const NO_CHECKSUM = 1 << 0;
        /// Caller explicitly forced the install
        const FORCE = 1 << 1;
    }
}

bitflags! {
    /// Flags controlling a firmware install.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[repr(transparent)]
    pub struct InstallFlags: u32 {
        /// Allow downgrading to an older version
        const ALLOW_OLDER = 1 << 0;
        /// Allow reinstalling the current version
        const ALLOW_REINSTALL = 1 << 1;
        /// Skip safety checks the user explicitly waived
        const FORCE = 1 << 2;
    }
}

/// A parsed firmware payload.
pub trait FirmwareContainer: Send + Sync {
    /// Parse the payload bytes into the container.
    ///
    /// # Errors
    ///
    /// [`DeviceError::InvalidFile`] when the payload does not match the
    /// container format.
    fn parse(&mut self, data: &[u8], flags: ParseFlags) -> Result<()>;

    /// Total payload size in bytes.
    fn size(&self) -> u64;

    /// The raw payload bytes.
    fn bytes(&self) -> &[u8];
}

/// The type-less fallback container: the payload taken verbatim.
#[derive(Debug, Default)]
pub struct RawContainer {
    data: Vec<u8>,
}

impl FirmwareContainer for RawContainer {
    fn parse(&mut self, data: &[u8], _flags: ParseFlags) -> Result<()> {
        self.data = data.to_vec();
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn bytes(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_container_parse() {
        let mut container = RawContainer::default();
        container.parse(&[1, 2, 3], ParseFlags::empty()).unwrap();
        assert_eq!(container.size(), 3);
        assert_eq!(container.bytes(), &[1, 2, 3]);
    }
}
