//! Runtime event types, broadcast bus, and subscriber fan-out.

mod bus;
mod event;
mod log;
mod subscriber;

pub use bus::Bus;
pub use event::{Event, EventKind};
pub use log::LogSubscriber;
pub use subscriber::{Subscribe, SubscriberSet};
