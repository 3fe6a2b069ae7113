//! Real-time chat gateway: the per-connection protocol, the process-local
//! pub/sub registry, and the assistant streaming bridge.

pub mod assistant;
pub mod connection;
pub mod dispatcher;
pub mod generator;
pub mod handler;

pub use assistant::{AssistantBridge, AssistantConfig};
pub use connection::handle_connection;
pub use dispatcher::{Channel, ConnId, Dispatcher};
pub use generator::{Generator, OpenAiGenerator, TextStream};
pub use handler::{Gateway, Session};
