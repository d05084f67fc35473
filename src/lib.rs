//! Service Essentials - shared messaging core for the service fleet.
//!
//! Request/reply RPC and fire-and-forget notifications over RabbitMQ,
//! with the configuration and logging bootstrap every service needs.

pub mod bus;
pub mod config;
pub mod messaging;
pub mod utils;

pub use bus::{BusError, Result};
pub use config::Config;
pub use messaging::MessagingService;
