pub mod config;
pub mod error;
pub mod event;

pub use config::{Config, ConfigError};
pub use error::{EventBusError, PetrelError, Result};
pub use event::{
    BroadcastEventBus, Channel, Event, EventBus, EventPayload, EventSource, EventSubscription,
};
