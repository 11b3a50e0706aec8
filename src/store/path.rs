//! Store path schema and validation

use crate::{Error, Result};

/// Connectivity flag managed by the store itself
pub const CONNECTED: &str = ".info/connected";

/// Last-seen session records, one child per device
pub const CONNECTED_DEVICES: &str = "connected_devices";

/// Administrative device status records, one child per device
pub const DEVICES: &str = "devices";

/// Shared broadcast command slot
pub const BROADCAST: &str = "commands/broadcast";

/// Append-only command response log
pub const RESPONSES: &str = "commands/responses";

/// Target value meaning "every device"
pub const ALL_DEVICES: &str = "all";

/// Device ids that would alias a fixed path under `commands/`
const RESERVED_IDS: &[&str] = &["broadcast", "responses", ALL_DEVICES];

/// Characters that may never appear in a path segment
const FORBIDDEN: &[char] = &['.', '$', '#', '[', ']', '/'];

/// Path of a device's session record
#[must_use]
pub fn session(device_id: &str) -> String {
    format!("{CONNECTED_DEVICES}/{device_id}")
}

/// Path of a device's administrative status record
#[must_use]
pub fn device(device_id: &str) -> String {
    format!("{DEVICES}/{device_id}")
}

/// Path of a device's targeted command slot
#[must_use]
pub fn targeted(device_id: &str) -> String {
    format!("commands/{device_id}")
}

/// Split a path into validated segments
///
/// Leading, trailing and repeated slashes are ignored; an empty result
/// addresses the root.
///
/// # Errors
///
/// Returns error if a segment contains a forbidden character. The
/// store-managed `.info` prefix is the only dotted segment allowed.
pub fn segments(path: &str) -> Result<Vec<String>> {
    let segs: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect();

    for (i, seg) in segs.iter().enumerate() {
        if i == 0 && seg == ".info" {
            continue;
        }
        if seg.contains(FORBIDDEN) {
            return Err(Error::InvalidPath(path.to_string()));
        }
    }

    Ok(segs)
}

/// Check that a device id can be used as a single store key
///
/// # Errors
///
/// Returns error if the id is empty, contains a forbidden character, or
/// collides with a reserved command path
pub fn validate_device_id(device_id: &str) -> Result<()> {
    let trimmed = device_id.trim();
    if trimmed.is_empty()
        || trimmed.len() != device_id.len()
        || device_id.contains(FORBIDDEN)
        || device_id.chars().any(char::is_control)
        || RESERVED_IDS.contains(&device_id)
    {
        return Err(Error::InvalidDeviceId(device_id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_normalize_slashes() {
        assert_eq!(segments("/commands//dev1/").unwrap(), vec!["commands", "dev1"]);
        assert!(segments("").unwrap().is_empty());
    }

    #[test]
    fn info_prefix_is_allowed() {
        assert_eq!(segments(CONNECTED).unwrap(), vec![".info", "connected"]);
    }

    #[test]
    fn dotted_segments_rejected() {
        assert!(segments("devices/a.b").is_err());
        assert!(segments("devices/$x").is_err());
    }

    #[test]
    fn device_ids_validated() {
        assert!(validate_device_id("web_1a2b_k9").is_ok());
        assert!(validate_device_id("").is_err());
        assert!(validate_device_id("a/b").is_err());
        assert!(validate_device_id(" padded").is_err());
        assert!(validate_device_id("broadcast").is_err());
        assert!(validate_device_id("all").is_err());
    }

    #[test]
    fn paths_are_built_per_device() {
        assert_eq!(session("d1"), "connected_devices/d1");
        assert_eq!(device("d1"), "devices/d1");
        assert_eq!(targeted("d1"), "commands/d1");
    }
}
