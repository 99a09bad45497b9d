//! Server-side session state.
//!
//! One store per server process, owned by the resolver behind a single
//! `tokio::sync::RwLock`. Everything mutable lives here: in-progress inbound
//! reassembly, the outbound response chunk map, and bounded conversation
//! history. The chunking engine itself stays stateless.

use crate::chunking::{Fragment, Reassembly};
use crate::llm::ChatTurn;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Sessions idle longer than this are swept by the janitor task.
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug)]
struct Session {
    reassembly: Option<Reassembly>,
    chunks: HashMap<u32, String>,
    history: Vec<ChatTurn>,
    last_activity: Instant,
}

impl Session {
    fn new() -> Self {
        Self {
            reassembly: None,
            chunks: HashMap::new(),
            history: Vec::new(),
            last_activity: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// All per-session server state, keyed by session token.
#[derive(Debug)]
pub struct SessionStore {
    sessions: HashMap<String, Session>,
    max_history_turns: usize,
}

impl SessionStore {
    pub fn new(max_history_turns: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            max_history_turns,
        }
    }

    /// Record an inbound fragment. Returns the reassembled message bytes
    /// once the session's fragment set completes; the reassembly state is
    /// destroyed at that instant so the token can carry a fresh message.
    pub fn ingest_fragment(&mut self, fragment: Fragment) -> Option<Vec<u8>> {
        let session = self
            .sessions
            .entry(fragment.session.clone())
            .or_insert_with(Session::new);
        session.touch();

        let buf = session
            .reassembly
            .get_or_insert_with(|| Reassembly::new(fragment.total));
        if fragment.total != buf.total() {
            log::warn!(
                "session {}: fragment declares total {} but reassembly started with {}",
                fragment.session,
                fragment.total,
                buf.total()
            );
        }
        buf.insert(fragment.index, fragment.data);

        if !buf.is_complete() {
            return None;
        }
        let assembled = buf.assemble();
        session.reassembly = None;
        match assembled {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                log::warn!("session {}: reassembly failed: {}", fragment.session, e);
                None
            }
        }
    }

    /// Replace the session's outbound chunk map wholesale. Stale indices
    /// from the previous snapshot vanish atomically with the swap.
    pub fn publish_chunks(&mut self, session: &str, chunks: HashMap<u32, String>) {
        let entry = self
            .sessions
            .entry(session.to_string())
            .or_insert_with(Session::new);
        entry.touch();
        entry.chunks = chunks;
    }

    /// Look up one published response chunk.
    pub fn chunk(&self, session: &str, index: u32) -> Option<String> {
        self.sessions
            .get(session)
            .and_then(|s| s.chunks.get(&index))
            .cloned()
    }

    /// Copy of the session's conversation history.
    pub fn history(&self, session: &str) -> Vec<ChatTurn> {
        self.sessions
            .get(session)
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    /// Append a completed exchange, evicting oldest turns past the bound.
    pub fn record_exchange(&mut self, session: &str, user: String, assistant: String) {
        let entry = self
            .sessions
            .entry(session.to_string())
            .or_insert_with(Session::new);
        entry.touch();
        entry.history.push(ChatTurn::user(user));
        entry.history.push(ChatTurn::assistant(assistant));
        let len = entry.history.len();
        if len > self.max_history_turns {
            entry.history.drain(..len - self.max_history_turns);
        }
    }

    pub fn clear_history(&mut self, session: &str) {
        if let Some(entry) = self.sessions.get_mut(session) {
            entry.history.clear();
            entry.touch();
        }
    }

    /// Drop all state for a session. Best-effort; absent sessions are fine.
    pub fn remove(&mut self, session: &str) -> bool {
        self.sessions.remove(session).is_some()
    }

    /// Drop sessions idle beyond [`SESSION_IDLE_TIMEOUT`]; returns how many.
    pub fn sweep_idle(&mut self) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| s.last_activity.elapsed() <= SESSION_IDLE_TIMEOUT);
        before - self.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
