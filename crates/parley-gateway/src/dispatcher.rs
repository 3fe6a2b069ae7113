use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use parley_types::events::ServerEvent;

pub type ConnId = Uuid;

/// Pub/sub topic. `user:{id}` carries every fan-out for that user across all
/// of their devices; `thread:{id}` tracks which connections have a thread open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    User(Uuid),
    Thread(Uuid),
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{}", id),
            Self::Thread(id) => write!(f, "thread:{}", id),
        }
    }
}

/// Process-local channel registry. A multi-instance deployment needs a shared
/// broker in its place; nothing here crosses process boundaries.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

#[derive(Default)]
struct DispatcherInner {
    /// Per-connection outbound queues: conn_id -> sender
    connections: RwLock<HashMap<ConnId, mpsc::UnboundedSender<ServerEvent>>>,

    /// Subscriptions: channel -> conn_ids. Lock order is channels, then connections.
    channels: RwLock<HashMap<Channel, HashSet<ConnId>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's outbound queue. Returns (conn_id, receiver).
    pub async fn register(&self) -> (ConnId, mpsc::UnboundedReceiver<ServerEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.connections.write().await.insert(conn_id, tx);
        (conn_id, rx)
    }

    /// Drop a connection and every subscription it held.
    pub async fn unregister(&self, conn_id: ConnId) {
        {
            let mut channels = self.inner.channels.write().await;
            channels.retain(|_, subs| {
                subs.remove(&conn_id);
                !subs.is_empty()
            });
        }
        self.inner.connections.write().await.remove(&conn_id);
    }

    pub async fn subscribe(&self, conn_id: ConnId, channel: Channel) {
        self.inner
            .channels
            .write()
            .await
            .entry(channel)
            .or_default()
            .insert(conn_id);
    }

    /// Returns whether the connection was subscribed.
    pub async fn unsubscribe(&self, conn_id: ConnId, channel: Channel) -> bool {
        let mut channels = self.inner.channels.write().await;
        let Some(subs) = channels.get_mut(&channel) else {
            return false;
        };
        let removed = subs.remove(&conn_id);
        if subs.is_empty() {
            channels.remove(&channel);
        }
        removed
    }

    pub async fn is_subscribed(&self, conn_id: ConnId, channel: Channel) -> bool {
        self.inner
            .channels
            .read()
            .await
            .get(&channel)
            .is_some_and(|subs| subs.contains(&conn_id))
    }

    pub async fn subscriber_count(&self, channel: Channel) -> usize {
        self.inner
            .channels
            .read()
            .await
            .get(&channel)
            .map_or(0, HashSet::len)
    }

    /// Deliver an event to every connection on a channel. Returns the number of queues reached.
    pub async fn publish(&self, channel: Channel, event: ServerEvent) -> usize {
        let channels = self.inner.channels.read().await;
        let Some(subs) = channels.get(&channel) else {
            return 0;
        };
        let connections = self.inner.connections.read().await;
        subs.iter()
            .filter_map(|conn_id| connections.get(conn_id))
            .filter(|tx| tx.send(event.clone()).is_ok())
            .count()
    }

    /// Publish to the `user:{id}` channel of each user.
    pub async fn fan_out(&self, user_ids: &[Uuid], event: ServerEvent) -> usize {
        let mut delivered = 0;
        for user_id in user_ids {
            delivered += self.publish(Channel::User(*user_id), event.clone()).await;
        }
        delivered
    }

    /// Send directly to one connection (replies and errors).
    pub async fn send_to_conn(&self, conn_id: ConnId, event: ServerEvent) -> bool {
        self.inner
            .connections
            .read()
            .await
            .get(&conn_id)
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_types::events::{ErrorCode, ThreadRef};

    fn joined(thread_id: Uuid) -> ServerEvent {
        ServerEvent::ThreadJoined(ThreadRef { thread_id })
    }

    #[tokio::test]
    async fn user_channel_reaches_every_device() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let (phone, mut phone_rx) = dispatcher.register().await;
        let (laptop, mut laptop_rx) = dispatcher.register().await;
        dispatcher.subscribe(phone, Channel::User(user)).await;
        dispatcher.subscribe(laptop, Channel::User(user)).await;

        let thread = Uuid::new_v4();
        assert_eq!(dispatcher.fan_out(&[user], joined(thread)).await, 2);
        assert_eq!(phone_rx.recv().await, Some(joined(thread)));
        assert_eq!(laptop_rx.recv().await, Some(joined(thread)));
    }

    #[tokio::test]
    async fn unregister_leaves_other_connections_alone() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let (a, _a_rx) = dispatcher.register().await;
        let (b, mut b_rx) = dispatcher.register().await;
        dispatcher.subscribe(a, Channel::User(user)).await;
        dispatcher.subscribe(b, Channel::User(user)).await;

        dispatcher.unregister(a).await;
        assert_eq!(dispatcher.connection_count().await, 1);
        assert_eq!(dispatcher.subscriber_count(Channel::User(user)).await, 1);

        let err = ServerEvent::error(ErrorCode::ServerError, "x");
        assert_eq!(dispatcher.fan_out(&[user], err.clone()).await, 1);
        assert_eq!(b_rx.recv().await, Some(err));
    }

    #[tokio::test]
    async fn thread_subscription_toggles() {
        let dispatcher = Dispatcher::new();
        let (conn, _rx) = dispatcher.register().await;
        let thread = Channel::Thread(Uuid::new_v4());

        assert!(!dispatcher.is_subscribed(conn, thread).await);
        dispatcher.subscribe(conn, thread).await;
        assert!(dispatcher.is_subscribed(conn, thread).await);
        assert!(dispatcher.unsubscribe(conn, thread).await);
        assert!(!dispatcher.unsubscribe(conn, thread).await);
        assert_eq!(dispatcher.subscriber_count(thread).await, 0);
    }

    #[test]
    fn channel_names() {
        let id = Uuid::nil();
        assert_eq!(Channel::User(id).to_string(), format!("user:{}", id));
        assert_eq!(Channel::Thread(id).to_string(), format!("thread:{}", id));
    }
}
