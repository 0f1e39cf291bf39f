pub mod command;
pub mod event;
pub mod projection;
pub mod query;
pub mod runtime;
pub mod subscriber;

pub use command::{CommandBus, CommandHandler};
pub use event::{record_from_message, Event, EventBus, EventMeta, PublishOutcome};
pub use projection::{replay, AgentStatus, AgentStatusChanged, AgentStatusReadModel, Projector};
pub use query::{Query, QueryBus, QueryHandler};
pub use runtime::MeshRuntime;
pub use subscriber::{MessageHandler, ProjectionHandler, Subscriber};
