//! Channel cells for state communication between supersteps.
//!
//! A channel is a named, versioned communication cell. Nodes subscribe to
//! channels via triggers and become eligible to run when a subscribed channel
//! advances past the version they last observed. Writes land at the end of a
//! superstep; reads happen at planning time against a consistent snapshot.
//!
//! Three behaviors cover the execution model:
//!
//! - [`Channel::LastValue`] - overwrite on write, read the current value.
//!   Available once it has been written at least once.
//! - [`Channel::Barrier`] - records contributor ids; available only when
//!   every expected contributor has written since the last reset.
//! - [`Channel::Topic`] - append-only accumulator; reads return the values
//!   received since the last consume.
//!
//! Versions are *not* stored here: the executor owns a `channel_versions`
//! map (monotonic `u64` per channel) that is bumped whenever a write call
//! returns `true`, and the map is checkpointed verbatim alongside the
//! channel snapshots produced by [`Channel::checkpoint`].

use crate::error::{CheckpointError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Monotonic channel version. Strictly increases on every successful write.
pub type ChannelVersion = u64;

/// A named communication cell with behavior-dependent write/read semantics.
///
/// Modeled as a tagged variant rather than a trait hierarchy: the behavior
/// set is closed and the dispatch sites are few, so matching on the tag
/// keeps checkpoint round-trips and cloning trivial.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "behavior", rename_all = "snake_case")]
pub enum Channel {
    /// Stores only the latest value. One write per step.
    LastValue {
        value: Option<Value>,
    },
    /// Waits for all expected contributors before becoming available.
    Barrier {
        expected: BTreeSet<String>,
        received: BTreeSet<String>,
    },
    /// Append-only accumulator, drained on consume.
    Topic {
        values: Vec<Value>,
    },
}

impl Channel {
    /// Create an empty last-value channel.
    pub fn last_value() -> Self {
        Channel::LastValue { value: None }
    }

    /// Create a last-value channel holding `value`.
    pub fn last_value_with(value: Value) -> Self {
        Channel::LastValue { value: Some(value) }
    }

    /// Create a barrier channel expecting the given contributor ids.
    pub fn barrier(expected: impl IntoIterator<Item = String>) -> Self {
        Channel::Barrier {
            expected: expected.into_iter().collect(),
            received: BTreeSet::new(),
        }
    }

    /// Create an empty topic (accumulator) channel.
    pub fn topic() -> Self {
        Channel::Topic { values: Vec::new() }
    }

    /// Apply one write to the channel.
    ///
    /// For `LastValue` and `Topic` the value is the payload; for `Barrier`
    /// it must be a string contributor id drawn from the expected set.
    /// Returns `true` if the channel changed (the caller bumps the version).
    pub fn write(&mut self, name: &str, value: Value) -> Result<bool> {
        match self {
            Channel::LastValue { value: slot } => {
                *slot = Some(value);
                Ok(true)
            }
            Channel::Barrier { expected, received } => {
                let contributor = value.as_str().ok_or_else(|| CheckpointError::InvalidWrite {
                    channel: name.to_string(),
                    reason: "barrier writes must be string contributor ids".to_string(),
                })?;
                if !expected.contains(contributor) {
                    return Err(CheckpointError::UnknownContributor {
                        channel: name.to_string(),
                        contributor: contributor.to_string(),
                    });
                }
                Ok(received.insert(contributor.to_string()))
            }
            Channel::Topic { values } => {
                values.push(value);
                Ok(true)
            }
        }
    }

    /// Read the channel's current value.
    ///
    /// `LastValue` yields the stored value; `Barrier` yields the received
    /// contributor set (only once full); `Topic` yields the accumulated list.
    pub fn read(&self, name: &str) -> Result<Value> {
        match self {
            Channel::LastValue { value } => value
                .clone()
                .ok_or_else(|| CheckpointError::EmptyChannel(name.to_string())),
            Channel::Barrier { expected, received } => {
                if !received.is_superset(expected) {
                    return Err(CheckpointError::EmptyChannel(name.to_string()));
                }
                Ok(Value::Array(
                    received.iter().cloned().map(Value::String).collect(),
                ))
            }
            Channel::Topic { values } => {
                if values.is_empty() {
                    return Err(CheckpointError::EmptyChannel(name.to_string()));
                }
                Ok(Value::Array(values.clone()))
            }
        }
    }

    /// Whether a consumer may read the channel.
    pub fn is_available(&self) -> bool {
        match self {
            Channel::LastValue { value } => value.is_some(),
            Channel::Barrier { expected, received } => received.is_superset(expected),
            Channel::Topic { values } => !values.is_empty(),
        }
    }

    /// Notify the channel that a subscribed task consumed it.
    ///
    /// A full barrier resets its received set; a topic drains. Returns
    /// `true` if the channel changed.
    pub fn consume(&mut self) -> bool {
        match self {
            Channel::LastValue { .. } => false,
            Channel::Barrier { expected, received } => {
                if received.is_superset(expected) && !expected.is_empty() {
                    received.clear();
                    true
                } else {
                    false
                }
            }
            Channel::Topic { values } => {
                if values.is_empty() {
                    false
                } else {
                    values.clear();
                    true
                }
            }
        }
    }

    /// Snapshot the channel's value state for a checkpoint.
    ///
    /// The expected set of a barrier is part of the compiled graph and is
    /// not snapshotted; only the received contributors are.
    pub fn checkpoint(&self) -> Value {
        match self {
            Channel::LastValue { value } => value.clone().unwrap_or(Value::Null),
            Channel::Barrier { received, .. } => Value::Array(
                received.iter().cloned().map(Value::String).collect(),
            ),
            Channel::Topic { values } => Value::Array(values.clone()),
        }
    }

    /// Restore value state from a checkpoint snapshot produced by
    /// [`Channel::checkpoint`].
    pub fn restore(&mut self, name: &str, snapshot: Value) -> Result<()> {
        match self {
            Channel::LastValue { value } => {
                *value = if snapshot.is_null() { None } else { Some(snapshot) };
                Ok(())
            }
            Channel::Barrier { received, .. } => {
                let arr = snapshot.as_array().ok_or_else(|| {
                    CheckpointError::Invalid(format!(
                        "barrier snapshot for '{}' must be an array of contributor ids",
                        name
                    ))
                })?;
                *received = arr
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect();
                Ok(())
            }
            Channel::Topic { values } => {
                let arr = snapshot.as_array().ok_or_else(|| {
                    CheckpointError::Invalid(format!(
                        "topic snapshot for '{}' must be an array",
                        name
                    ))
                })?;
                *values = arr.clone();
                Ok(())
            }
        }
    }

    /// The behavior tag as a display string.
    pub fn behavior(&self) -> &'static str {
        match self {
            Channel::LastValue { .. } => "last_value",
            Channel::Barrier { .. } => "barrier",
            Channel::Topic { .. } => "topic",
        }
    }
}
