//! Work entry types flowing through the engine's input queue.
//!
//! Every event the engine reacts to — an inbound broker message, a
//! subscription change, a timer tick, an expired per-topic timeout — is
//! expressed as one [`WorkEntry`] and travels through the single
//! [`WorkQueue`](crate::queue::WorkQueue). Producers hand ownership of the
//! entry to the queue; the engine takes ownership back on pop and the entry
//! is destroyed after dispatch.

use bytes::Bytes;

use anyhow::{bail, Result};

/// Maximum topic length in bytes accepted from the subscription table.
pub const MAX_TOPIC_LEN: usize = 250;

/// Maximum script file name length in bytes.
pub const MAX_SCRIPT_NAME_LEN: usize = 127;

// ─── SubscriptionInfo ──────────────────────────────────────────────────────

/// A single row of the subscription table: which topic to monitor, which
/// script handles it, and how often (if at all) its timer fires.
///
/// `period_seconds == 0` means a message-only subscription with no timer.
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    topic: String,
    script_name: String,
    period_seconds: u32,
}

impl SubscriptionInfo {
    /// Build a validated subscription row.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic exceeds [`MAX_TOPIC_LEN`] bytes or the
    /// script name exceeds [`MAX_SCRIPT_NAME_LEN`] bytes.
    pub fn new(
        topic: impl Into<String>,
        script_name: impl Into<String>,
        period_seconds: u32,
    ) -> Result<Self> {
        let topic = topic.into();
        let script_name = script_name.into();
        if topic.len() > MAX_TOPIC_LEN {
            bail!(
                "topic is {} bytes, maximum is {MAX_TOPIC_LEN}",
                topic.len()
            );
        }
        if script_name.len() > MAX_SCRIPT_NAME_LEN {
            bail!(
                "script name '{script_name}' is {} bytes, maximum is {MAX_SCRIPT_NAME_LEN}",
                script_name.len()
            );
        }
        Ok(Self {
            topic,
            script_name,
            period_seconds,
        })
    }

    /// The monitored topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// File name of the handler script under the scripts directory.
    #[must_use]
    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    /// Timer period in seconds; 0 means no timer.
    #[must_use]
    pub fn period_seconds(&self) -> u32 {
        self.period_seconds
    }
}

// ─── OwnedMessage ──────────────────────────────────────────────────────────

/// An inbound broker message whose buffer this process now owns.
///
/// The reader thread constructs one of these at the moment it takes the
/// message off the wire, then moves it into a [`WorkEntry::MessageReceived`].
/// Ownership travels through the queue to the engine; dropping the wrapper
/// releases the buffer, exactly once.
#[derive(Debug)]
pub struct OwnedMessage {
    destination: String,
    payload: Bytes,
}

impl OwnedMessage {
    /// Take ownership of a delivered message.
    #[must_use]
    pub fn new(destination: String, payload: Bytes) -> Self {
        Self {
            destination,
            payload,
        }
    }

    /// The topic this message was published on.
    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// The binary payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

// ─── WorkEntry ─────────────────────────────────────────────────────────────

/// One unit of work for the engine, tagged by kind.
///
/// `Shutdown` is the drain sentinel: the engine unsubscribes everything and
/// exits its loop when it pops one.
#[derive(Debug)]
pub enum WorkEntry {
    /// An inbound message, buffer owned by the entry.
    MessageReceived {
        /// The owned message.
        message: OwnedMessage,
    },
    /// Begin monitoring a topic.
    Subscribe {
        /// The validated subscription row.
        info: SubscriptionInfo,
    },
    /// Stop monitoring a topic.
    Unsubscribe {
        /// The subscription row to revoke.
        info: SubscriptionInfo,
    },
    /// One second of wall-clock time elapsed; advance the wheel.
    TimerTick,
    /// A per-topic timeout expired, emitted by the wheel.
    Timeout {
        /// Topic whose timer fired.
        topic: String,
        /// Period used to reschedule the timer.
        period_seconds: u32,
    },
    /// Drain and exit.
    Shutdown,
}
