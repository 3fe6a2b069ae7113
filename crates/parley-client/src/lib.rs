//! Client side of the chat gateway: a reconnecting socket manager, the
//! local chat state it feeds, and a small REST client.

pub mod api;
pub mod backoff;
pub mod config;
pub mod socket;
pub mod state;

pub use api::{ClientError, RestClient};
pub use backoff::Backoff;
pub use config::{BackoffConfig, ClientConfig};
pub use socket::{ConnectionState, Link, SocketManager, Subscription, Transport, WsTransport};
pub use state::{
    Attachment, ChatState, Entry, EventSink, PendingMessage, PendingStream, SendStatus,
    ThreadState,
};
