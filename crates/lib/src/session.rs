//! Session registry: session id -> external runtime thread reference, plus the conversation transcript.
//!
//! The registry is the only state shared across connections. `bind` after a thread start/resume is
//! the only writer of the thread reference. Turns on the same session id are serialized through
//! [`SessionRegistry::lock_turn`], so resolve-then-bind is atomic per id. Evicting a session bumps its
//! generation; a turn that started before the eviction can no longer bind or append to it.

use crate::confirm::ConfirmPayload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Unique session identifier (opaque string).
pub type SessionId = String;

/// New opaque session id.
pub fn new_session_id() -> SessionId {
    format!("sess-{}", uuid::Uuid::new_v4())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Message,
    Confirm,
    Error,
}

/// One entry of a conversation. The streaming assistant message is mutated in place, then frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub kind: MessageKind,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm_payload: Option<ConfirmPayload>,
    #[serde(default)]
    pub action_trace: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: Role, kind: MessageKind, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            kind,
            text: text.into(),
            confirm_payload: None,
            action_trace: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, MessageKind::Message, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, MessageKind::Message, text)
    }
}

/// A registry entry. `conversation_id` is set once the persistence collaborator has created a record.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: SessionId,
    pub thread_ref: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub conversation_id: Option<String>,
    pub title: Option<String>,
    pub messages: Vec<ChatMessage>,
}

/// Per-id turn lock and eviction count.
#[derive(Default)]
struct TurnSlot {
    lock: Arc<Mutex<()>>,
    generation: u64,
}

impl TurnSlot {
    fn in_use(&self) -> bool {
        Arc::strong_count(&self.lock) > 1
    }
}

/// An accepted turn that has not taken the session's turn lock yet.
pub struct TurnTicket {
    lock: Arc<Mutex<()>>,
    generation: u64,
}

impl TurnTicket {
    pub async fn lock(self) -> TurnGuard {
        TurnGuard {
            _lock: self.lock.lock_owned().await,
            generation: self.generation,
        }
    }
}

/// Held for the whole turn on a session.
pub struct TurnGuard {
    _lock: OwnedMutexGuard<()>,
    generation: u64,
}

/// Concurrency-safe session store, owned by the gateway instance and injected where needed.
///
/// Lock order is `turn_locks` then `inner`.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<HashMap<SessionId, Session>>,
    turn_locks: Mutex<HashMap<SessionId, TurnSlot>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize turns on one session id. Held for the whole turn by the connection running it.
    pub async fn lock_turn(&self, session_id: &str) -> TurnGuard {
        self.turn_ticket(session_id).await.lock().await
    }

    /// Claim a place in the session's turn queue without waiting. The ticket pins the current
    /// generation, so an eviction between accepting a turn and running it still applies to it.
    pub async fn turn_ticket(&self, session_id: &str) -> TurnTicket {
        let mut locks = self.turn_locks.lock().await;
        let slot = locks.entry(session_id.to_string()).or_default();
        TurnTicket {
            lock: slot.lock.clone(),
            generation: slot.generation,
        }
    }

    /// False once the session has been evicted since the turn was accepted.
    pub async fn is_current(&self, session_id: &str, turn: &TurnGuard) -> bool {
        let locks = self.turn_locks.lock().await;
        Self::current(&locks, session_id, turn)
    }

    fn current(locks: &HashMap<SessionId, TurnSlot>, session_id: &str, turn: &TurnGuard) -> bool {
        locks
            .get(session_id)
            .map_or(false, |slot| slot.generation == turn.generation)
    }

    /// [`bind`](Self::bind) unless the session was evicted during the turn. Returns whether it bound.
    pub async fn bind_for_turn(&self, session_id: &str, thread_ref: &str, turn: &TurnGuard) -> bool {
        let locks = self.turn_locks.lock().await;
        if !Self::current(&locks, session_id, turn) {
            return false;
        }
        self.bind(session_id, thread_ref).await;
        true
    }

    /// [`append_messages`](Self::append_messages) unless the session was evicted during the turn.
    pub async fn append_for_turn(
        &self,
        session_id: &str,
        title: Option<&str>,
        messages: Vec<ChatMessage>,
        turn: &TurnGuard,
    ) -> Option<Session> {
        let locks = self.turn_locks.lock().await;
        if !Self::current(&locks, session_id, turn) {
            return None;
        }
        self.append_messages(session_id, title, messages).await
    }

    /// Thread reference bound to the session, if any. Marks the session active.
    pub async fn resolve(&self, session_id: &str) -> Option<String> {
        let mut g = self.inner.write().await;
        let session = g.get_mut(session_id)?;
        session.last_active_at = Utc::now();
        Some(session.thread_ref.clone())
    }

    /// Upsert the thread reference for a session.
    pub async fn bind(&self, session_id: &str, thread_ref: &str) {
        let now = Utc::now();
        let mut g = self.inner.write().await;
        match g.get_mut(session_id) {
            Some(session) => {
                if session.thread_ref != thread_ref {
                    log::info!(
                        "session {} rebound from thread {} to {}",
                        session_id,
                        session.thread_ref,
                        thread_ref
                    );
                }
                session.thread_ref = thread_ref.to_string();
                session.last_active_at = now;
            }
            None => {
                g.insert(
                    session_id.to_string(),
                    Session {
                        session_id: session_id.to_string(),
                        thread_ref: thread_ref.to_string(),
                        created_at: now,
                        last_active_at: now,
                        conversation_id: None,
                        title: None,
                        messages: Vec::new(),
                    },
                );
            }
        }
    }

    /// Remove the session and end the generation of any turn running on it. Returns true when an
    /// entry existed.
    pub async fn evict(&self, session_id: &str) -> bool {
        let mut locks = self.turn_locks.lock().await;
        let removed = self.inner.write().await.remove(session_id).is_some();
        Self::retire_slot(&mut locks, session_id);
        removed
    }

    fn retire_slot(locks: &mut HashMap<SessionId, TurnSlot>, session_id: &str) {
        match locks.get_mut(session_id) {
            Some(slot) if slot.in_use() => slot.generation += 1,
            Some(_) => {
                locks.remove(session_id);
            }
            None => {}
        }
    }

    /// Return a clone of the session if it exists.
    pub async fn get(&self, session_id: &str) -> Option<Session> {
        self.inner.read().await.get(session_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Append finished messages to the transcript; sets the title when none is set yet.
    /// Returns a snapshot for persistence, or None when the session is unknown.
    pub async fn append_messages(
        &self,
        session_id: &str,
        title: Option<&str>,
        messages: Vec<ChatMessage>,
    ) -> Option<Session> {
        let mut g = self.inner.write().await;
        let session = g.get_mut(session_id)?;
        if session.title.is_none() {
            session.title = title
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string);
        }
        session.messages.extend(messages);
        session.last_active_at = Utc::now();
        Some(session.clone())
    }

    pub async fn set_conversation_id(&self, session_id: &str, conversation_id: &str) {
        if let Some(session) = self.inner.write().await.get_mut(session_id) {
            session.conversation_id = Some(conversation_id.to_string());
        }
    }

    /// Evict sessions idle for longer than `ttl` whose turn lock is free. Returns evicted ids.
    pub async fn evict_idle(&self, ttl: Duration) -> Vec<SessionId> {
        let cutoff = match chrono::Duration::from_std(ttl) {
            Ok(d) => Utc::now() - d,
            Err(_) => return Vec::new(),
        };
        let mut locks = self.turn_locks.lock().await;
        let mut g = self.inner.write().await;
        let expired: Vec<SessionId> = g
            .values()
            .filter(|s| s.last_active_at < cutoff)
            .filter(|s| {
                locks
                    .get(&s.session_id)
                    .map_or(true, |slot| slot.lock.try_lock().is_ok())
            })
            .map(|s| s.session_id.clone())
            .collect();
        for id in &expired {
            g.remove(id);
            Self::retire_slot(&mut locks, id);
        }
        locks.retain(|id, slot| g.contains_key(id) || slot.in_use());
        expired
    }
}
