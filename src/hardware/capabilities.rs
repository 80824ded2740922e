//! Control-Bus Capabilities
//!
//! The stress test never speaks a wire protocol itself. It reaches remote
//! attributes and devices through three small capability traits:
//!
//! - [`ControlBus`] resolves fully qualified names into attribute or device handles
//! - [`AttributeReader`] performs one round-trip read of a single attribute
//! - [`DeviceControl`] exposes state, attribute get/set, commands and event
//!   subscription for a whole device (the camera)
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! A client library with a blocking API should wrap each call in
//! `tokio::task::spawn_blocking` inside its `read` implementation so that
//! pollers never stall the runtime.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn probe(bus: &dyn ControlBus, fqdn: &str) -> anyhow::Result<()> {
//!     let attr = bus.attribute(fqdn).await?;
//!     let value = attr.read().await?;
//!     println!("{} = {}", attr.name(), value);
//!     Ok(())
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Operating state reported by a device on the bus.
///
/// Mirrors the usual control-system state set. A camera reports `Moving`
/// while it is acquiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    /// Powered and idle
    On,
    /// Powered off
    Off,
    /// Closed (shutters, valves)
    Close,
    /// Open (shutters, valves)
    Open,
    /// Inserted
    Insert,
    /// Extracted
    Extract,
    /// Busy; for cameras this means acquiring
    Moving,
    /// Standing by
    Standby,
    /// Faulted
    Fault,
    /// Initialising
    Init,
    /// Running a long task
    Running,
    /// Within limits but alarming
    Alarm,
    /// Disabled by interlock or operator
    Disable,
    /// State could not be determined
    Unknown,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::On => "ON",
            DeviceState::Off => "OFF",
            DeviceState::Close => "CLOSE",
            DeviceState::Open => "OPEN",
            DeviceState::Insert => "INSERT",
            DeviceState::Extract => "EXTRACT",
            DeviceState::Moving => "MOVING",
            DeviceState::Standby => "STANDBY",
            DeviceState::Fault => "FAULT",
            DeviceState::Init => "INIT",
            DeviceState::Running => "RUNNING",
            DeviceState::Alarm => "ALARM",
            DeviceState::Disable => "DISABLE",
            DeviceState::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Value returned by an attribute read.
///
/// The stress test only cares how long a read takes, so the payload is kept
/// coarse. Images carry their dimensions only.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    /// Boolean scalar
    Bool(bool),
    /// Integer scalar (short, long, enum)
    Long(i64),
    /// Floating point scalar
    Double(f64),
    /// String scalar
    Text(String),
    /// Device state
    State(DeviceState),
    /// One-dimensional numeric array
    Spectrum(Vec<f64>),
    /// Two-dimensional image, dimensions in pixels
    Image {
        /// Width in pixels
        width: u32,
        /// Height in pixels
        height: u32,
    },
}

impl AttributeValue {
    /// Numeric view of scalar values, `None` for arrays, text and states.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            AttributeValue::Long(v) => Some(*v as f64),
            AttributeValue::Double(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(v) => write!(f, "{v}"),
            AttributeValue::Long(v) => write!(f, "{v}"),
            AttributeValue::Double(v) => write!(f, "{v}"),
            AttributeValue::Text(v) => f.write_str(v),
            AttributeValue::State(s) => write!(f, "{s}"),
            AttributeValue::Spectrum(v) => write!(f, "[{} values]", v.len()),
            AttributeValue::Image { width, height } => write!(f, "[{width}x{height} image]"),
        }
    }
}

/// Kind of event a subscription listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Value changed
    Change,
    /// Fired at a fixed period
    Periodic,
    /// Archive threshold crossed
    Archive,
    /// New data is ready to be read
    DataReady,
}

/// Event delivered to a subscription handler.
#[derive(Debug, Clone)]
pub struct Event {
    /// Attribute that produced the event
    pub attribute: String,
    /// Subscribed event kind
    pub kind: EventKind,
    /// Attribute value carried by the event
    pub value: AttributeValue,
}

/// Callback invoked for every delivered event.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Opaque identifier returned by a subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub i64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Capability: Single Attribute Readout
///
/// # Contract
/// - `read()` performs one full round trip to the device server
/// - No client-side caching; every call must hit the bus
#[async_trait]
pub trait AttributeReader: Send + Sync {
    /// Fully qualified attribute name
    fn name(&self) -> &str;

    /// Read the current value
    ///
    /// # Returns
    /// - Ok(value) on successful read
    /// - Err on timeout, disconnected server or device error
    async fn read(&self) -> Result<AttributeValue>;
}

/// Capability: Device Control Surface
///
/// Devices with state, writable attributes, commands and event subscriptions.
/// The acquisition controller drives a camera entirely through this trait.
#[async_trait]
pub trait DeviceControl: Send + Sync {
    /// Fully qualified device name
    fn name(&self) -> &str;

    /// Query the device state
    async fn state(&self) -> Result<DeviceState>;

    /// Read a named attribute of this device
    async fn read_attribute(&self, name: &str) -> Result<AttributeValue>;

    /// Write a named attribute of this device
    ///
    /// # Returns
    /// - Err if the attribute is read-only, unknown or the value is rejected
    async fn write_attribute(&self, name: &str, value: AttributeValue) -> Result<()>;

    /// Execute a command without arguments
    async fn command(&self, name: &str) -> Result<()>;

    /// Register `handler` for events of `kind` on `attribute`
    ///
    /// # Returns
    /// Identifier to pass to [`DeviceControl::unsubscribe_event`]
    async fn subscribe_event(
        &self,
        attribute: &str,
        kind: EventKind,
        handler: EventHandler,
    ) -> Result<SubscriptionId>;

    /// Cancel a subscription
    async fn unsubscribe_event(&self, id: SubscriptionId) -> Result<()>;
}

/// Capability: Name Resolution
///
/// Entry point to the control bus. Resolving a name may already contact the
/// device server, so failures here count as unreachable attributes.
#[async_trait]
pub trait ControlBus: Send + Sync {
    /// Resolve an attribute by its fully qualified name
    async fn attribute(&self, fqdn: &str) -> Result<Arc<dyn AttributeReader>>;

    /// Resolve a device by its fully qualified name
    async fn device(&self, fqdn: &str) -> Result<Arc<dyn DeviceControl>>;
}
