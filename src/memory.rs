use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One entry of the append-only conversation log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: Role,
    pub content: String,
    pub timestamp_ms: u128,
    pub metadata: Option<Value>,
}

/// A timestamped record of observed screen/window state, kept for post-hoc
/// debugging ("what did the screen look like around the time action X
/// happened").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub screen_state: String,
    pub active_window: String,
    pub timestamp_ms: u128,
}

struct ContextEntry {
    value: Value,
    expires_at: Option<Instant>,
}

const CONVERSATION_LIMIT: usize = 100;
const CONVERSATION_KEEP_RECENT: usize = 50;
const SNAPSHOT_LIMIT: usize = 50;

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Layered agent memory: a bounded conversation window, a TTL-expiring
/// short-term context, an unbounded persistent key/value store and a snapshot
/// ring buffer.
#[derive(Default)]
pub struct AgentMemory {
    conversation: Vec<ConversationEntry>,
    context: HashMap<String, ContextEntry>,
    long_term: HashMap<String, Value>,
    snapshots: VecDeque<MemorySnapshot>,
}

impl AgentMemory {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- conversation ----

    pub fn add_entry(&mut self, role: Role, content: impl Into<String>, metadata: Option<Value>) {
        self.conversation.push(ConversationEntry {
            role,
            content: content.into(),
            timestamp_ms: now_ms(),
            metadata,
        });
    }

    /// When the window has overflowed, keep every system entry plus the most
    /// recent non-system tail. System entries carry agent-identity
    /// instructions needed by every future prompt, so they are never evicted.
    /// Applied lazily on reads, like the TTL sweep, so a burst of appends
    /// costs nothing until someone looks.
    fn trim_conversation(&mut self) {
        if self.conversation.len() <= CONVERSATION_LIMIT {
            return;
        }
        let system: Vec<ConversationEntry> = self
            .conversation
            .iter()
            .filter(|e| e.role == Role::System)
            .cloned()
            .collect();
        let recent: Vec<ConversationEntry> = self
            .conversation
            .iter()
            .filter(|e| e.role != Role::System)
            .rev()
            .take(CONVERSATION_KEEP_RECENT)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        debug!(
            kept = system.len() + recent.len(),
            dropped = self.conversation.len() - system.len() - recent.len(),
            "trimmed conversation window"
        );
        self.conversation = system;
        self.conversation.extend(recent);
    }

    pub fn conversation(&mut self) -> &[ConversationEntry] {
        self.trim_conversation();
        &self.conversation
    }

    /// The `n` most recent entries, oldest first.
    pub fn recent(&mut self, n: usize) -> &[ConversationEntry] {
        self.trim_conversation();
        let start = self.conversation.len().saturating_sub(n);
        &self.conversation[start..]
    }

    /// Case-insensitive substring search over entry contents.
    pub fn search(&mut self, query: &str) -> Vec<&ConversationEntry> {
        self.trim_conversation();
        let q = query.to_lowercase();
        self.conversation
            .iter()
            .filter(|e| e.content.to_lowercase().contains(&q))
            .collect()
    }

    // ---- short-term context (TTL) ----

    pub fn set_context(&mut self, key: impl Into<String>, value: Value, ttl: Option<Duration>) {
        self.context.insert(
            key.into(),
            ContextEntry {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    /// Reads sweep expired entries lazily; there is no background timer.
    pub fn get_context(&mut self, key: &str) -> Option<Value> {
        self.sweep_context();
        self.context.get(key).map(|e| e.value.clone())
    }

    pub fn context_keys(&mut self) -> Vec<String> {
        self.sweep_context();
        self.context.keys().cloned().collect()
    }

    fn sweep_context(&mut self) {
        let now = Instant::now();
        self.context
            .retain(|_, e| e.expires_at.map(|at| at > now).unwrap_or(true));
    }

    // ---- long-term store ----

    pub fn remember(&mut self, key: impl Into<String>, value: Value) {
        self.long_term.insert(key.into(), value);
    }

    pub fn recall(&self, key: &str) -> Option<&Value> {
        self.long_term.get(key)
    }

    pub fn forget(&mut self, key: &str) -> bool {
        self.long_term.remove(key).is_some()
    }

    // ---- snapshots ----

    pub fn add_snapshot(&mut self, screen_state: impl Into<String>, active_window: impl Into<String>) {
        self.add_snapshot_at(screen_state, active_window, now_ms());
    }

    pub fn add_snapshot_at(
        &mut self,
        screen_state: impl Into<String>,
        active_window: impl Into<String>,
        timestamp_ms: u128,
    ) {
        if self.snapshots.len() >= SNAPSHOT_LIMIT {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(MemorySnapshot {
            screen_state: screen_state.into(),
            active_window: active_window.into(),
            timestamp_ms,
        });
    }

    /// Linear scan for the snapshot closest to `timestamp_ms`; ties resolve
    /// to the first in insertion order.
    pub fn find_snapshot_near(&self, timestamp_ms: u128) -> Option<&MemorySnapshot> {
        self.snapshots.iter().min_by_key(|s| {
            (s.timestamp_ms as i128 - timestamp_ms as i128).unsigned_abs()
        })
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &MemorySnapshot> {
        self.snapshots.iter()
    }

    // ---- diagnostics ----

    pub fn clear(&mut self) {
        self.conversation.clear();
        self.context.clear();
        self.long_term.clear();
        self.snapshots.clear();
    }

    /// Full dump for diagnostics. Context entries are exported without their
    /// deadlines; `Instant` has no wall-clock meaning outside this process.
    pub fn export(&mut self) -> Value {
        self.trim_conversation();
        self.sweep_context();
        let context: HashMap<&String, &Value> =
            self.context.iter().map(|(k, e)| (k, &e.value)).collect();
        json!({
            "conversation": &self.conversation,
            "context": context,
            "long_term": &self.long_term,
            "snapshots": &self.snapshots,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trim_keeps_system_plus_recent_fifty() {
        let mut m = AgentMemory::new();
        m.add_entry(Role::System, "you are an automation agent", None);
        for i in 0..149 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            m.add_entry(role, format!("message {i}"), None);
        }
        // Appends alone never shrink the log; the first read collapses it.
        assert_eq!(m.conversation.len(), 150);
        assert_eq!(m.conversation().len(), 51);
        assert_eq!(m.conversation()[0].role, Role::System);
        assert_eq!(m.conversation()[1].content, "message 99");
        assert_eq!(m.conversation().last().unwrap().content, "message 148");
    }

    #[test]
    fn recent_and_search() {
        let mut m = AgentMemory::new();
        m.add_entry(Role::User, "open the browser", None);
        m.add_entry(Role::Assistant, "clicked Chrome icon", None);
        m.add_entry(Role::Assistant, "typed weather query", None);

        let recent = m.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "clicked Chrome icon");

        assert_eq!(m.search("CHROME").len(), 1);
        assert!(m.search("nothing here").is_empty());
    }

    #[test]
    fn context_ttl_expires_on_read() {
        let mut m = AgentMemory::new();
        m.set_context("transient", json!(1), Some(Duration::ZERO));
        m.set_context("stable", json!(2), None);
        m.set_context("later", json!(3), Some(Duration::from_secs(3600)));

        assert!(m.get_context("transient").is_none());
        assert_eq!(m.get_context("stable"), Some(json!(2)));
        assert_eq!(m.get_context("later"), Some(json!(3)));
        assert_eq!(m.context_keys().len(), 2);
    }

    #[test]
    fn long_term_remember_recall_forget() {
        let mut m = AgentMemory::new();
        m.remember("favorite_browser", json!("Chrome"));
        assert_eq!(m.recall("favorite_browser"), Some(&json!("Chrome")));
        assert!(m.forget("favorite_browser"));
        assert!(!m.forget("favorite_browser"));
        assert!(m.recall("favorite_browser").is_none());
    }

    #[test]
    fn snapshot_ring_evicts_oldest() {
        let mut m = AgentMemory::new();
        for i in 0..(SNAPSHOT_LIMIT + 5) {
            m.add_snapshot_at(format!("state {i}"), "win", i as u128);
        }
        assert_eq!(m.snapshots().count(), SNAPSHOT_LIMIT);
        assert_eq!(m.snapshots().next().unwrap().screen_state, "state 5");
    }

    #[test]
    fn snapshot_nearest_timestamp() {
        let mut m = AgentMemory::new();
        for t in [0u128, 10, 30] {
            m.add_snapshot_at(format!("t{t}"), "win", t);
        }
        assert_eq!(m.find_snapshot_near(12).unwrap().timestamp_ms, 10);
        // Tie between 0 and 10 resolves to the first inserted.
        assert_eq!(m.find_snapshot_near(5).unwrap().timestamp_ms, 0);
        assert_eq!(m.find_snapshot_near(1000).unwrap().timestamp_ms, 30);
        assert!(AgentMemory::new().find_snapshot_near(5).is_none());
    }

    #[test]
    fn export_contains_all_layers() {
        let mut m = AgentMemory::new();
        m.add_entry(Role::User, "hello", None);
        m.set_context("k", json!(true), None);
        m.remember("p", json!("v"));
        m.add_snapshot("desktop", "Finder");

        let dump = m.export();
        assert_eq!(dump["conversation"].as_array().unwrap().len(), 1);
        assert_eq!(dump["context"]["k"], json!(true));
        assert_eq!(dump["long_term"]["p"], json!("v"));
        assert_eq!(dump["snapshots"].as_array().unwrap().len(), 1);
    }
}
