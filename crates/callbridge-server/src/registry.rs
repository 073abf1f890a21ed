//! Process-wide registry of active call sessions.
//!
//! The registry is the only state shared between call tasks. It records which
//! call identifiers currently have an open media stream and holds the hangup
//! signal for each one; the session contents themselves (transcript,
//! in-flight generation) stay with the call task that owns them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Debug)]
struct SessionEntry {
    connection_id: Uuid,
    stream_sid: Option<String>,
    started_at: DateTime<Utc>,
    hangup: Arc<Notify>,
}

/// Handle returned by [`SessionRegistry::register`].
///
/// `connection_id` distinguishes this channel from any later channel that
/// claims the same call identifier, so teardown of a displaced channel cannot
/// remove its replacement.
#[derive(Debug, Clone)]
pub struct SessionTicket {
    pub call_id: String,
    pub connection_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub hangup: Arc<Notify>,
}

/// Public view of one registered session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveCall {
    pub call_sid: String,
    pub stream_sid: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_secs: i64,
}

type SessionMap = HashMap<String, SessionEntry>;

/// Maps call identifiers to their live sessions.
///
/// Uses `std::sync::Mutex`: every critical section is a short map operation
/// that never spans an `.await`.
#[derive(Clone, Debug, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<SessionMap>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SessionMap> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("session registry lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Registers a session for `call_id`.
    ///
    /// If the call already has a session (the provider reconnected the
    /// stream), the old entry is replaced and its channel is told to hang up.
    pub fn register(&self, call_id: &str, stream_sid: Option<String>) -> SessionTicket {
        let ticket = SessionTicket {
            call_id: call_id.to_string(),
            connection_id: Uuid::new_v4(),
            started_at: Utc::now(),
            hangup: Arc::new(Notify::new()),
        };

        let displaced = self.lock().insert(
            call_id.to_string(),
            SessionEntry {
                connection_id: ticket.connection_id,
                stream_sid,
                started_at: ticket.started_at,
                hangup: ticket.hangup.clone(),
            },
        );

        if let Some(old) = displaced {
            tracing::info!(
                call_sid = %call_id,
                old_connection_id = %old.connection_id,
                "replaced existing session for call; signalling old channel to hang up"
            );
            old.hangup.notify_one();
        }

        ticket
    }

    /// Removes the session for `call_id` if it still belongs to `connection_id`.
    ///
    /// Returns `false` for stale removals (entry missing or owned by a newer
    /// channel).
    pub fn remove(&self, call_id: &str, connection_id: Uuid) -> bool {
        let mut sessions = self.lock();
        match sessions.get(call_id) {
            Some(entry) if entry.connection_id == connection_id => {
                sessions.remove(call_id);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.lock().contains_key(call_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Signals the channel serving `call_id` to end the call.
    ///
    /// Returns `false` if no such session exists.
    pub fn request_hangup(&self, call_id: &str) -> bool {
        match self.lock().get(call_id) {
            Some(entry) => {
                entry.hangup.notify_one();
                true
            }
            None => false,
        }
    }

    /// Lists active sessions, oldest first.
    pub fn snapshot(&self) -> Vec<ActiveCall> {
        let now = Utc::now();
        let mut calls: Vec<ActiveCall> = self
            .lock()
            .iter()
            .map(|(call_id, entry)| ActiveCall {
                call_sid: call_id.clone(),
                stream_sid: entry.stream_sid.clone(),
                started_at: entry.started_at,
                duration_secs: (now - entry.started_at).num_seconds(),
            })
            .collect();
        calls.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_remove() {
        let registry = SessionRegistry::new();
        let ticket = registry.register("CA1", Some("MZ1".into()));

        assert!(registry.contains("CA1"));
        assert_eq!(registry.len(), 1);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].call_sid, "CA1");
        assert_eq!(snapshot[0].stream_sid.as_deref(), Some("MZ1"));

        assert!(registry.remove("CA1", ticket.connection_id));
        assert!(registry.is_empty());
        assert!(!registry.remove("CA1", ticket.connection_id));
    }

    #[test]
    fn stale_removal_keeps_replacement() {
        let registry = SessionRegistry::new();
        let first = registry.register("CA1", None);
        let second = registry.register("CA1", None);

        assert_ne!(first.connection_id, second.connection_id);
        assert!(!registry.remove("CA1", first.connection_id));
        assert!(registry.contains("CA1"));
        assert!(registry.remove("CA1", second.connection_id));
    }

    #[tokio::test]
    async fn replacement_signals_old_channel() {
        let registry = SessionRegistry::new();
        let first = registry.register("CA1", None);
        let _second = registry.register("CA1", None);

        // notify_one stores a permit, so this resolves even though nobody
        // was waiting when the replacement happened.
        tokio::time::timeout(std::time::Duration::from_secs(1), first.hangup.notified())
            .await
            .expect("old channel should be signalled");
    }

    #[tokio::test]
    async fn request_hangup_signals_session() {
        let registry = SessionRegistry::new();
        let ticket = registry.register("CA7", None);

        assert!(registry.request_hangup("CA7"));
        assert!(!registry.request_hangup("CA404"));

        tokio::time::timeout(std::time::Duration::from_secs(1), ticket.hangup.notified())
            .await
            .expect("hangup should be signalled");
    }
}
