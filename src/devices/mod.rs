//! Device session registry
//!
//! Sessions live at `connected_devices/{id}` and are refreshed on every
//! contact. Administrative status lives separately at `devices/{id}` and
//! is what the access gate follows.

pub mod registry;
pub mod types;

pub use registry::{DEFAULT_REASON, DeviceRegistry};
pub use types::{DeviceMetadata, DeviceRecord, DeviceSession, DeviceStatus};
