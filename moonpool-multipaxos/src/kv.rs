//! Key-value state machine and the records the log carries.
//!
//! The consensus core treats log values as opaque bytes. Each value is a
//! JSON-encoded [`LogRecord`]: a [`Command`] tagged with the [`RequestId`]
//! of the client request that produced it. The id makes two clients'
//! identical commands distinct values, and lets the apply engine recognise
//! a record that was committed twice.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{NodeId, PaxosError};

/// A state machine command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Unconditionally set `key` to `value`.
    Set {
        /// Target key.
        key: String,
        /// New value.
        value: String,
    },
    /// Set `key` to `new_value` only if its current value equals `expected`
    /// (`None` meaning absent).
    CompareAndSwap {
        /// Target key.
        key: String,
        /// Required current value.
        expected: Option<String>,
        /// Value to install on match.
        new_value: String,
    },
    /// Changes nothing. Used for read barriers and to fill holes.
    NoOp,
}

/// Outcome of applying a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// `Set`: the new value. `CompareAndSwap`: the value before the swap.
    pub value: Option<String>,
    /// `false` only for a compare-and-swap whose expectation failed.
    pub success: bool,
}

/// Globally unique id of a client request.
///
/// `incarnation` is drawn at random when a node starts, so sequences that
/// restart from zero after a crash never collide with earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId {
    /// Node that accepted the request.
    pub node: NodeId,
    /// Random per-start tag.
    pub incarnation: u64,
    /// Per-incarnation counter.
    pub sequence: u64,
}

/// The value stored at one log index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Request this record belongs to.
    pub id: RequestId,
    /// Command to apply.
    pub command: Command,
}

impl LogRecord {
    /// Encode to log value bytes.
    pub fn encode(&self) -> Result<Vec<u8>, PaxosError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from log value bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, PaxosError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Deterministic state machine fed by the apply engine.
pub trait StateMachine {
    /// Apply one command.
    fn apply(&mut self, command: &Command) -> CommandResult;

    /// Read a key from local state.
    fn get(&self, key: &str) -> Option<String>;
}

/// String key-value store.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KvStore {
    entries: BTreeMap<String, String>,
}

impl KvStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every key and value.
    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }
}

impl StateMachine for KvStore {
    fn apply(&mut self, command: &Command) -> CommandResult {
        match command {
            Command::Set { key, value } => {
                self.entries.insert(key.clone(), value.clone());
                CommandResult {
                    value: Some(value.clone()),
                    success: true,
                }
            }
            Command::CompareAndSwap {
                key,
                expected,
                new_value,
            } => {
                let existing = self.entries.get(key).cloned();
                let success = existing == *expected;
                if success {
                    self.entries.insert(key.clone(), new_value.clone());
                }
                CommandResult {
                    value: existing,
                    success,
                }
            }
            Command::NoOp => CommandResult {
                value: None,
                success: true,
            },
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(key: &str, value: &str) -> Command {
        Command::Set {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_set_and_get() {
        let mut kv = KvStore::new();
        let result = kv.apply(&set("x", "1"));

        assert!(result.success);
        assert_eq!(result.value.as_deref(), Some("1"));
        assert_eq!(kv.get("x").as_deref(), Some("1"));
        assert!(kv.get("y").is_none());
    }

    #[test]
    fn test_compare_and_swap() {
        let mut kv = KvStore::new();
        kv.apply(&set("x", "1"));

        let miss = kv.apply(&Command::CompareAndSwap {
            key: "x".to_string(),
            expected: Some("0".to_string()),
            new_value: "2".to_string(),
        });
        assert!(!miss.success);
        assert_eq!(miss.value.as_deref(), Some("1"));
        assert_eq!(kv.get("x").as_deref(), Some("1"));

        let hit = kv.apply(&Command::CompareAndSwap {
            key: "x".to_string(),
            expected: Some("1".to_string()),
            new_value: "2".to_string(),
        });
        assert!(hit.success);
        assert_eq!(hit.value.as_deref(), Some("1"));
        assert_eq!(kv.get("x").as_deref(), Some("2"));
    }

    #[test]
    fn test_compare_and_swap_on_absent_key() {
        let mut kv = KvStore::new();
        let hit = kv.apply(&Command::CompareAndSwap {
            key: "k".to_string(),
            expected: None,
            new_value: "v".to_string(),
        });
        assert!(hit.success);
        assert!(hit.value.is_none());
        assert_eq!(kv.get("k").as_deref(), Some("v"));
    }

    #[test]
    fn test_noop_changes_nothing() {
        let mut kv = KvStore::new();
        kv.apply(&set("x", "1"));
        let before = kv.clone();
        assert!(kv.apply(&Command::NoOp).success);
        assert_eq!(kv, before);
    }

    #[test]
    fn test_record_codec() {
        let record = LogRecord {
            id: RequestId {
                node: NodeId(2),
                incarnation: 99,
                sequence: 4,
            },
            command: set("a", "b"),
        };
        let bytes = record.encode().expect("encode");
        assert_eq!(LogRecord::decode(&bytes).expect("decode"), record);
        assert!(matches!(
            LogRecord::decode(b"not json"),
            Err(PaxosError::Codec(_))
        ));
    }
}
