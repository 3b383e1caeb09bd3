//! Device id conventions.
//!
//! Device ids are opaque to the services, but the two endpoint classes are
//! distinguishable by prefix: `browser-` for ephemeral client endpoints and
//! `host-` for long-lived agents. The relay session id both endpoints dial
//! is derived deterministically from the pair.

/// Prefix of ephemeral client endpoint device ids.
pub const BROWSER_DEVICE_PREFIX: &str = "browser-";

/// Prefix of long-lived host agent device ids.
pub const HOST_DEVICE_PREFIX: &str = "host-";

/// The two endpoint classes a device id can encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Browser,
    Host,
}

/// Classify a device id by prefix.
pub fn device_class(device_id: &str) -> Option<DeviceClass> {
    if device_id.starts_with(BROWSER_DEVICE_PREFIX) {
        Some(DeviceClass::Browser)
    } else if device_id.starts_with(HOST_DEVICE_PREFIX) {
        Some(DeviceClass::Host)
    } else {
        None
    }
}

/// Generate a fresh browser-class device id.
pub fn new_browser_device_id() -> String {
    format!("{BROWSER_DEVICE_PREFIX}{}", uuid::Uuid::new_v4())
}

/// Generate a fresh host-class device id.
pub fn new_host_device_id() -> String {
    format!("{HOST_DEVICE_PREFIX}{}", uuid::Uuid::new_v4())
}

/// Deterministic relay session id for a client/host pair.
///
/// Both endpoints derive the same id independently, so the relay can pair
/// them without further coordination.
pub fn relay_session_id(browser_device_id: &str, host_device_id: &str) -> String {
    format!("{browser_device_id}-{host_device_id}")
}
