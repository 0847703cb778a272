use crate::UnsupportedPlatformError;

/// Classic CAN SocketCAN adapter (non-Linux stub).
#[derive(Debug, Default)]
pub struct SocketCan;

impl SocketCan {
    /// Always returns [`UnsupportedPlatformError`] on non-Linux targets.
    pub fn open(_iface: &str) -> Result<Self, UnsupportedPlatformError> {
        Err(UnsupportedPlatformError)
    }
}

/// CAN FD SocketCAN adapter (non-Linux stub).
#[derive(Debug, Default)]
pub struct SocketCanFd;

impl SocketCanFd {
    /// Always returns [`UnsupportedPlatformError`] on non-Linux targets.
    pub fn open(_iface: &str) -> Result<Self, UnsupportedPlatformError> {
        Err(UnsupportedPlatformError)
    }
}
