//! Household reminder bot: schedules, composition, chat binding and delivery.

pub mod binding;
pub mod commands;
pub mod composer;
pub mod deployment;
pub mod notifier;
pub mod schedule;
pub mod store;
pub mod transport;

pub use binding::{Action, ChatBinding, ControlPattern};
pub use composer::{ComposedMessage, Composer, compose};
pub use deployment::{BuildInfo, DeploymentCheck, DeploymentGuard};
pub use notifier::{Event, InboundMessage, Notifier, Routing, spawn_schedule};
pub use schedule::{NotificationRule, Schedule, Topic, household_rules};
pub use store::{KeyValueStore, SqliteStore, StoreError};
pub use transport::{TelegramTransport, Transport, TransportError};
