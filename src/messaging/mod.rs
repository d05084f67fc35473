//! Request/reply and notification messaging over a broker.
//!
//! - `ConnectionManager`: lazy, retrying connection with a single shared channel,
//!   replaced when the broker drops it
//! - `PendingRequests`: correlation id to response handler table
//! - `MessagingService`: the facade services call

pub mod connection;
pub mod correlator;
pub mod service;

pub use connection::{ConnectionManager, Session};
pub use correlator::{PendingRequests, ResponseHandler};
pub use service::MessagingService;
