pub mod commands;
pub mod context;
pub mod dispatch;
pub mod history;
pub mod orchestrator;

pub use context::{ChatType, RequestContext, UserContext};
pub use dispatch::Dispatcher;
pub use orchestrator::{Reply, ReplyOrchestrator};
