//! The narrow contract the controller holds against a CH341 bus driver.
//!
//! Concrete bindings (libusb, vendor DLL) live outside this workspace and
//! register themselves as [`DriverProbe`]s; the controller tries probes in
//! registration order, mirroring the libusb-first-then-vendor detection of
//! the stock toolchain.

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// No device matched, or the device refused the open.
    #[error("connection refused")]
    Refused,
    /// The link died mid-transfer.
    #[error("connection broken")]
    Broken,
    /// No usable USB backend on this host.
    #[error("no usb backend")]
    NoBackend,
}

/// Blocking CH341 bridge operations used by the sender thread.
pub trait UsbDriver: Send {
    fn open(&mut self) -> Result<(), DriverError>;
    fn close(&mut self);
    /// Send one 32-byte frame (leading zero, 30-byte payload, CRC).
    fn write(&mut self, frame: &[u8]) -> Result<(), DriverError>;
    /// Issue a status query and return the 6-byte answer.
    fn get_status(&mut self) -> Result<[u8; 6], DriverError>;
    fn get_chip_version(&mut self) -> Result<i32, DriverError>;
}

/// Factory for a [`UsbDriver`] matching the configured addressing criteria.
pub trait DriverProbe: Send {
    fn name(&self) -> &'static str;
    fn probe(&self, usb: &core_config::UsbConfig) -> Result<Box<dyn UsbDriver>, DriverError>;
}

/// Connection-level lifecycle published on `pipe;usb_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbState {
    Uninitialized,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    ConnectionFailed,
    NoBackend,
    Mock,
}

impl UsbState {
    pub fn code(self) -> i32 {
        match self {
            UsbState::Uninitialized => 0,
            UsbState::Connecting => 1,
            UsbState::Connected => 2,
            UsbState::Disconnecting => 3,
            UsbState::Disconnected => 4,
            UsbState::ConnectionFailed => 5,
            UsbState::NoBackend => 6,
            UsbState::Mock => 7,
        }
    }

    pub fn from_code(code: i32) -> Option<UsbState> {
        match code {
            0 => Some(UsbState::Uninitialized),
            1 => Some(UsbState::Connecting),
            2 => Some(UsbState::Connected),
            3 => Some(UsbState::Disconnecting),
            4 => Some(UsbState::Disconnected),
            5 => Some(UsbState::ConnectionFailed),
            6 => Some(UsbState::NoBackend),
            7 => Some(UsbState::Mock),
            _ => None,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            UsbState::Uninitialized => "Uninitialized",
            UsbState::Connecting => "Connecting...",
            UsbState::Connected => "Connected",
            UsbState::Disconnecting => "Disconnecting...",
            UsbState::Disconnected => "Disconnected",
            UsbState::ConnectionFailed => "Connection Failed",
            UsbState::NoBackend => "No USB Backend",
            UsbState::Mock => "Mock Driver",
        }
    }

    /// Display name for a raw code, tolerating unknown values.
    pub fn describe_code(code: i32) -> &'static str {
        UsbState::from_code(code).map_or("Unknown", UsbState::describe)
    }
}
