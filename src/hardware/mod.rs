//! Control-bus hardware access.
//!
//! - [`capabilities`] defines the traits the stress test is written against
//! - [`mock`] implements them in-process for the binary and the tests

pub mod capabilities;
pub mod mock;

pub use capabilities::{
    AttributeReader, AttributeValue, ControlBus, DeviceControl, DeviceState, Event, EventHandler,
    EventKind, SubscriptionId,
};
