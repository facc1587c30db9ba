//! Mission lifecycle events and the integration bus

mod bus;
mod types;

pub use bus::{BusStats, HandlerFactory, IntegrationBus, IntegrationHandler, IntegrationInfo, IntegrationPriority};
pub use types::{Event, EventKind};
