//! Chat use-cases: access control, message creation, read cursors and
//! thread setup. Everything here is blocking; async callers use
//! [`ChatService::blocking`].

pub mod access;
pub mod directory;
pub mod error;
pub mod messages;
pub mod read_state;
pub mod settings;
pub mod threads;

use std::sync::Arc;

use anyhow::anyhow;

use parley_db::Database;

pub use access::{AccessContext, Action};
pub use directory::Directory;
pub use error::{ChatError, ChatResult};
pub use messages::{CreateMessage, CreatedMessage};

#[derive(Clone)]
pub struct ChatService {
    inner: Arc<ChatInner>,
}

struct ChatInner {
    db: Arc<Database>,
    directory: Arc<dyn Directory>,
}

impl ChatService {
    /// Uses the database's own friendship/team tables as the directory.
    pub fn new(db: Arc<Database>) -> Self {
        let directory: Arc<dyn Directory> = db.clone();
        Self::with_directory(db, directory)
    }

    pub fn with_directory(db: Arc<Database>, directory: Arc<dyn Directory>) -> Self {
        Self {
            inner: Arc::new(ChatInner { db, directory }),
        }
    }

    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    pub fn directory(&self) -> &dyn Directory {
        self.inner.directory.as_ref()
    }

    /// Run a use-case off the async runtime.
    pub async fn blocking<F, T>(&self, f: F) -> ChatResult<T>
    where
        F: FnOnce(&ChatService) -> ChatResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let service = self.clone();
        tokio::task::spawn_blocking(move || f(&service))
            .await
            .map_err(|e| ChatError::Server(anyhow!("spawn_blocking join error: {}", e)))?
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parley_types::permissions::{CHAT_ACCESS, CHAT_AI, Permissions, TEAM_READ, TEAM_WRITE};

    pub fn service() -> ChatService {
        ChatService::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    pub fn base() -> Permissions {
        Permissions::new([CHAT_ACCESS])
    }

    pub fn full() -> Permissions {
        Permissions::new([CHAT_ACCESS, CHAT_AI, TEAM_READ, TEAM_WRITE])
    }

    pub fn none() -> Permissions {
        Permissions::default()
    }
}
