pub mod config;
pub mod error;
pub mod message;
pub mod metrics;
pub mod paths;

pub use config::{AdapterConfig, AdapterKind, Config};
pub use error::{DecodeError, DeliveryError, Error, NoHandlerError, Result, RoutingError, StoreError};
pub use message::{MessageParts, UniversalMessage, DEFAULT_TENANT};
pub use metrics::Metrics;
pub use paths::Paths;
