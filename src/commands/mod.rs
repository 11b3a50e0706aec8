//! Command bus
//!
//! Administrators issue commands into store slots; each device subscribes to
//! its own targeted slot and the shared broadcast slot and executes what it
//! finds. Delivery is at-least-once: targeted commands are cleared after
//! execution, broadcasts stay in place and are suppressed by a per-device
//! watermark.

pub mod bus;
pub mod dedup;
pub mod types;
pub mod watermark;

pub use bus::{BusSubscription, CommandBus, CommandHandler};
pub use dedup::CommandDedup;
pub use types::{
    CommandEnvelope, CommandKind, CommandResponse, IssuedCommand, ResponseStatus, Target,
};
pub use watermark::Watermark;
