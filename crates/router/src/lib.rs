pub mod address;
pub mod router;

pub use address::RoutingAddress;
pub use router::{MessageRouter, RouterBuilder, TargetResult};
