//! Replicated key/value store
//!
//! A CRDT-lite last-writer-wins register map. Writes are ordered by
//! `(clock, actor)`: higher clock wins, ties break on the lexicographically
//! greater actor. Each actor's clock is tracked monotonically; the local
//! actor's clock strictly increases on every local set, so two writes from
//! the same session can never tie.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::envelope::StatePatchPayload;
use crate::errors::{Result, StateError};
use crate::types::{StreamId, Timestamp};

// ----------------------------------------------------------------------------
// Entries and Snapshots
// ----------------------------------------------------------------------------

/// One replicated entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEntry {
    pub key: String,
    pub value: Value,
    pub actor: StreamId,
    pub clock: u64,
    pub updated_at: u64,
}

impl StateEntry {
    /// LWW dominance: `self` wins over `other` iff it has a higher clock, or
    /// the same clock and a lexicographically greater actor.
    fn dominates(&self, other: &StateEntry) -> bool {
        self.clock > other.clock
            || (self.clock == other.clock && self.actor.as_str() > other.actor.as_str())
    }

    fn to_patch(&self) -> StatePatchPayload {
        StatePatchPayload {
            key: self.key.clone(),
            value: self.value.clone(),
            actor: self.actor.clone(),
            clock: self.clock,
            updated_at: self.updated_at,
        }
    }
}

/// Full-store snapshot exchanged over `state.snapshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub room: String,
    pub stream_id: StreamId,
    /// Sorted by key and truncated to the snapshot entry cap.
    pub entries: Vec<StateEntry>,
    pub actor_clock: HashMap<StreamId, u64>,
    pub generated_at: u64,
}

/// What applying a remote patch did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Entry stored (new key or dominated the existing one).
    Applied,
    /// Existing entry already dominates; no change.
    Ignored,
}

// ----------------------------------------------------------------------------
// State Engine
// ----------------------------------------------------------------------------

/// Per-session LWW store.
pub struct StateEngine {
    room: String,
    actor: StreamId,
    max_keys: usize,
    max_snapshot_entries: usize,
    entries: HashMap<String, StateEntry>,
    actor_clock: HashMap<StreamId, u64>,
    local_clock: u64,
}

impl StateEngine {
    pub fn new(room: String, actor: StreamId, max_keys: usize, max_snapshot_entries: usize) -> Self {
        Self {
            room,
            actor,
            max_keys,
            max_snapshot_entries,
            entries: HashMap::new(),
            actor_clock: HashMap::new(),
            local_clock: 0,
        }
    }

    /// The local actor's current clock.
    pub fn local_clock(&self) -> u64 {
        self.local_clock
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Local write. Bumps the local clock and returns the patch to broadcast.
    pub fn set(&mut self, key: &str, value: Value) -> Result<StatePatchPayload> {
        if key.is_empty() {
            return Err(StateError::EmptyKey.into());
        }
        if !self.entries.contains_key(key) && self.entries.len() >= self.max_keys {
            return Err(StateError::KeyLimitReached {
                max: self.max_keys,
            }
            .into());
        }

        self.local_clock += 1;
        let entry = StateEntry {
            key: key.to_string(),
            value,
            actor: self.actor.clone(),
            clock: self.local_clock,
            updated_at: Timestamp::now().as_millis(),
        };
        self.bump_actor_clock(&self.actor.clone(), self.local_clock);
        let patch = entry.to_patch();
        self.entries.insert(key.to_string(), entry);
        Ok(patch)
    }

    /// Apply a remote patch under the dominance rule.
    pub fn apply_patch(&mut self, patch: StatePatchPayload) -> Result<ApplyOutcome> {
        if patch.key.is_empty() {
            return Err(StateError::EmptyKey.into());
        }
        let incoming = StateEntry {
            key: patch.key,
            value: patch.value,
            actor: patch.actor,
            clock: patch.clock,
            updated_at: patch.updated_at,
        };

        match self.entries.get(&incoming.key) {
            Some(existing) if !incoming.dominates(existing) => return Ok(ApplyOutcome::Ignored),
            Some(_) => {}
            None => {
                if self.entries.len() >= self.max_keys {
                    return Err(StateError::KeyLimitReached {
                        max: self.max_keys,
                    }
                    .into());
                }
            }
        }

        self.bump_actor_clock(&incoming.actor.clone(), incoming.clock);
        self.entries.insert(incoming.key.clone(), incoming);
        Ok(ApplyOutcome::Applied)
    }

    /// Read one key's value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(|e| &e.value)
    }

    /// Read one key's full entry.
    pub fn get_entry(&self, key: &str) -> Option<&StateEntry> {
        self.entries.get(key)
    }

    /// All entries sorted by key, plus the actor-clock map.
    pub fn read_all(&self) -> (Vec<StateEntry>, &HashMap<StreamId, u64>) {
        let mut entries: Vec<StateEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        (entries, &self.actor_clock)
    }

    /// Build the snapshot answered to `state.snapshot_req`.
    pub fn snapshot(&self) -> StateSnapshot {
        let mut entries: Vec<StateEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries.truncate(self.max_snapshot_entries);
        StateSnapshot {
            room: self.room.clone(),
            stream_id: self.actor.clone(),
            entries,
            actor_clock: self.actor_clock.clone(),
            generated_at: Timestamp::now().as_millis(),
        }
    }

    /// Merge a received snapshot entry-by-entry; returns the keys that
    /// changed.
    pub fn apply_snapshot(&mut self, snapshot: StateSnapshot) -> Vec<StateEntry> {
        let mut applied = Vec::new();
        for entry in snapshot.entries {
            let patch = entry.to_patch();
            if let Ok(ApplyOutcome::Applied) = self.apply_patch(patch) {
                applied.push(self.entries[&entry.key].clone());
            }
        }
        for (actor, clock) in snapshot.actor_clock {
            self.bump_actor_clock(&actor, clock);
        }
        applied
    }

    fn bump_actor_clock(&mut self, actor: &StreamId, clock: u64) {
        let tracked = self.actor_clock.entry(actor.clone()).or_insert(0);
        *tracked = (*tracked).max(clock);
        // Lamport receive rule: the next local set must dominate anything
        // already applied.
        self.local_clock = self.local_clock.max(clock);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(actor: &str) -> StateEngine {
        StateEngine::new("room1".into(), StreamId::new(actor), 8, 4)
    }

    #[test]
    fn test_set_then_get() {
        let mut state = engine("agent_a");
        let patch = state.set("mission", serde_json::json!("alpha")).unwrap();
        assert_eq!(patch.clock, 1);
        assert_eq!(state.get("mission"), Some(&serde_json::json!("alpha")));
        assert_eq!(state.get_entry("mission").unwrap().clock, state.local_clock());
    }

    #[test]
    fn test_local_clock_strictly_increases() {
        let mut state = engine("agent_a");
        state.set("a", serde_json::json!(1)).unwrap();
        state.set("a", serde_json::json!(2)).unwrap();
        state.set("b", serde_json::json!(3)).unwrap();
        assert_eq!(state.local_clock(), 3);
        assert_eq!(state.get_entry("a").unwrap().clock, 2);
    }

    #[test]
    fn test_remote_patch_dominance() {
        let mut state = engine("agent_a");
        state.set("mission", serde_json::json!("alpha")).unwrap();

        // Higher clock wins.
        let outcome = state
            .apply_patch(StatePatchPayload {
                key: "mission".into(),
                value: serde_json::json!("bravo"),
                actor: StreamId::new("agent_b"),
                clock: 5,
                updated_at: 0,
            })
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(state.get("mission"), Some(&serde_json::json!("bravo")));

        // Lower clock loses.
        let outcome = state
            .apply_patch(StatePatchPayload {
                key: "mission".into(),
                value: serde_json::json!("stale"),
                actor: StreamId::new("agent_c"),
                clock: 2,
                updated_at: 0,
            })
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Ignored);
        assert_eq!(state.get("mission"), Some(&serde_json::json!("bravo")));
    }

    #[test]
    fn test_equal_clock_actor_tiebreak() {
        let mut state = engine("agent_a");
        state
            .apply_patch(StatePatchPayload {
                key: "k".into(),
                value: serde_json::json!("from_b"),
                actor: StreamId::new("agent_b"),
                clock: 3,
                updated_at: 0,
            })
            .unwrap();

        // Same clock, lexicographically smaller actor: ignored.
        let outcome = state
            .apply_patch(StatePatchPayload {
                key: "k".into(),
                value: serde_json::json!("from_a"),
                actor: StreamId::new("agent_a"),
                clock: 3,
                updated_at: 0,
            })
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Ignored);

        // Same clock, greater actor: applied.
        let outcome = state
            .apply_patch(StatePatchPayload {
                key: "k".into(),
                value: serde_json::json!("from_z"),
                actor: StreamId::new("agent_z"),
                clock: 3,
                updated_at: 0,
            })
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
    }

    #[test]
    fn test_patch_idempotence() {
        let mut state = engine("agent_a");
        let patch = StatePatchPayload {
            key: "k".into(),
            value: serde_json::json!(42),
            actor: StreamId::new("agent_b"),
            clock: 1,
            updated_at: 0,
        };
        assert_eq!(state.apply_patch(patch.clone()).unwrap(), ApplyOutcome::Applied);
        // Re-applying the identical patch changes nothing (equal clock, equal
        // actor does not dominate).
        assert_eq!(state.apply_patch(patch).unwrap(), ApplyOutcome::Ignored);
        assert_eq!(state.get("k"), Some(&serde_json::json!(42)));
    }

    #[test]
    fn test_key_limit() {
        let mut state = StateEngine::new("room1".into(), StreamId::new("a"), 2, 4);
        state.set("k1", serde_json::json!(1)).unwrap();
        state.set("k2", serde_json::json!(2)).unwrap();
        let err = state.set("k3", serde_json::json!(3)).unwrap_err();
        assert!(err.to_string().contains("limit"));
        // Overwriting an existing key is still allowed at the cap.
        assert!(state.set("k1", serde_json::json!(10)).is_ok());
        // Remote patches for new keys are rejected too.
        let err = state
            .apply_patch(StatePatchPayload {
                key: "k3".into(),
                value: serde_json::json!(3),
                actor: StreamId::new("b"),
                clock: 1,
                updated_at: 0,
            })
            .unwrap_err();
        assert!(err.to_string().contains("limit"));
    }

    #[test]
    fn test_actor_clock_monotone() {
        let mut state = engine("agent_a");
        state
            .apply_patch(StatePatchPayload {
                key: "k".into(),
                value: serde_json::json!(1),
                actor: StreamId::new("agent_b"),
                clock: 7,
                updated_at: 0,
            })
            .unwrap();
        // A late, smaller-clock patch on another key cannot regress the map.
        state
            .apply_patch(StatePatchPayload {
                key: "other".into(),
                value: serde_json::json!(2),
                actor: StreamId::new("agent_b"),
                clock: 3,
                updated_at: 0,
            })
            .unwrap();
        let (_, clocks) = state.read_all();
        assert_eq!(clocks[&StreamId::new("agent_b")], 7);
    }

    #[test]
    fn test_snapshot_sorted_and_truncated() {
        let mut state = StateEngine::new("room1".into(), StreamId::new("a"), 16, 2);
        for key in ["zeta", "alpha", "mid"] {
            state.set(key, serde_json::json!(key)).unwrap();
        }
        let snapshot = state.snapshot();
        assert_eq!(snapshot.entries.len(), 2);
        assert_eq!(snapshot.entries[0].key, "alpha");
        assert_eq!(snapshot.entries[1].key, "mid");
        assert_eq!(snapshot.room, "room1");
    }

    #[test]
    fn test_snapshot_merge_converges() {
        let mut a = engine("agent_a");
        let mut b = engine("agent_b");
        a.set("mission", serde_json::json!("alpha")).unwrap();
        b.set("mission", serde_json::json!("bravo")).unwrap();
        b.set("extra", serde_json::json!(1)).unwrap();

        // agent_b's entries carry the same clock (1 and 2); "mission" ties at
        // clock 1 and agent_b wins the tiebreak.
        let applied = a.apply_snapshot(b.snapshot());
        assert_eq!(applied.len(), 2);
        assert_eq!(a.get("mission"), Some(&serde_json::json!("bravo")));
        let (_, clocks) = a.read_all();
        assert_eq!(clocks[&StreamId::new("agent_b")], 2);

        // Merging the same snapshot again is a no-op.
        let applied = a.apply_snapshot(b.snapshot());
        assert!(applied.is_empty());
    }
}
