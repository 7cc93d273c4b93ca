//! Connection registry - maps a session id to the outbound channels of
//! every live connection currently bound to it.
//!
//! Broadcasts reach all tabs/observers of a session, not just the sender.
//! Closed channels are pruned on every broadcast; empty entries are removed
//! on unregister.

use dashmap::DashMap;
use tokio::sync::mpsc;

use chatdock_protocol::ServerMessage;

struct SessionSubscriber {
    conn_id: u64,
    tx: mpsc::Sender<ServerMessage>,
}

/// Shared registry of live connections, keyed by session id
#[derive(Default)]
pub struct Registry {
    sessions: DashMap<String, Vec<SessionSubscriber>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a connection's broadcast channel to a session.
    pub fn register(&self, session_id: &str, conn_id: u64, tx: mpsc::Sender<ServerMessage>) {
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .push(SessionSubscriber { conn_id, tx });
    }

    /// Unbind a connection from a session. Removes the session entry when
    /// no connections remain.
    pub fn unregister(&self, session_id: &str, conn_id: u64) {
        if let Some(mut subscribers) = self.sessions.get_mut(session_id) {
            subscribers.retain(|s| s.conn_id != conn_id);
            let empty = subscribers.is_empty();
            drop(subscribers);
            if empty {
                self.sessions
                    .remove_if(session_id, |_, subs| subs.is_empty());
            }
        }
    }

    /// Broadcast a message to every connection bound to a session.
    pub async fn broadcast(&self, session_id: &str, msg: ServerMessage) {
        // Clone senders out of the map first; holding a shard guard across
        // an await point risks deadlocking other connections.
        let senders: Vec<mpsc::Sender<ServerMessage>> = match self.sessions.get_mut(session_id) {
            Some(mut subscribers) => {
                subscribers.retain(|s| !s.tx.is_closed());
                subscribers.iter().map(|s| s.tx.clone()).collect()
            }
            None => return,
        };

        for tx in senders {
            let _ = tx.send(msg.clone()).await;
        }
    }

    /// Number of live connections bound to a session.
    pub fn connection_count(&self, session_id: &str) -> usize {
        self.sessions
            .get(session_id)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}
