//! 通知层：编排事件与异步发布/订阅总线

pub mod bus;
pub mod events;

pub use bus::{EventCollector, EventHandler, LoggingHandler, NotificationBus, SubscriptionId};
pub use events::{Event, EventKind, EventPayload};
