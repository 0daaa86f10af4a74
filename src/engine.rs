//! Single-consumer monitoring engine.
//!
//! One worker thread pops work entries off the queue and dispatches by kind.
//! The engine is the only thread that touches the topic map, the timeout
//! wheel and the Lua runtime, so none of them are locked.
//!
//! ```text
//! WorkQueue ─pop─► dispatch ──┬─ MessageReceived → invoke onMessage
//!                             ├─ Subscribe       → load script, arm wheel, map topic
//!                             ├─ Unsubscribe     → unmap topic, drop env
//!                             ├─ TimerTick       → wheel.tick() (may emit Timeouts)
//!                             ├─ Timeout         → invoke onTimer, re-arm wheel
//!                             └─ Shutdown        → unsubscribe all, exit loop
//! ```
//!
//! Because one consumer services all entries in FIFO order, script
//! invocations for a single topic are observed in broker-receive order. A
//! faulty script is logged and skipped; it never takes the loop down.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::broker::Outcome;
use crate::queue::WorkQueue;
use crate::script::{ScriptHost, ON_MESSAGE_FN, ON_TIMER_FN};
use crate::wheel::TimeoutWheel;
use crate::work::{OwnedMessage, SubscriptionInfo, WorkEntry};

/// The slice of the broker the engine consumes: revoking a broker-side
/// subscription when a topic stops being monitored.
pub trait TopicControl {
    /// Unsubscribe `topic` at the broker.
    ///
    /// # Errors
    ///
    /// Returns an error if the revocation fails; the engine logs and moves on.
    fn unsubscribe(&self, topic: &str) -> Result<Outcome>;
}

/// Owns the topic→script map, the timeout wheel and the script host; runs
/// the dispatch loop.
pub struct MonitoringEngine {
    queue: Arc<WorkQueue>,
    broker: Arc<dyn TopicControl + Send + Sync>,
    scripts: ScriptHost,
    /// Monitored topics: presence of a key means messages for it are
    /// dispatched to the named script; absence means they are dropped.
    topics: HashMap<String, String>,
    wheel: TimeoutWheel,
}

impl std::fmt::Debug for MonitoringEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoringEngine")
            .field("monitored_topics", &self.topics.len())
            .field("wheel_ticks", &self.wheel.ticks())
            .finish_non_exhaustive()
    }
}

impl MonitoringEngine {
    /// Create an engine consuming `queue` and revoking subscriptions
    /// through `broker`.
    #[must_use]
    pub fn new(
        queue: Arc<WorkQueue>,
        broker: Arc<dyn TopicControl + Send + Sync>,
        scripts: ScriptHost,
    ) -> Self {
        Self {
            queue,
            broker,
            scripts,
            topics: HashMap::new(),
            wheel: TimeoutWheel::new(),
        }
    }

    /// Script currently monitoring `topic`, if any.
    #[must_use]
    pub fn monitored_script(&self, topic: &str) -> Option<&str> {
        self.topics.get(topic).map(String::as_str)
    }

    /// Run until a shutdown sentinel is popped.
    pub fn run(&mut self) {
        log::info!("monitoring engine running");
        while self.step() {}
        log::info!("monitoring engine stopped");
    }

    /// Pop and dispatch one entry. Returns `false` once shutdown completed.
    pub fn step(&mut self) -> bool {
        let entry = self.queue.pop();
        match entry {
            WorkEntry::MessageReceived { message } => {
                self.handle_message(&message);
                // `message` dropped here: the broker buffer is released
                // exactly once, after dispatch.
            }
            WorkEntry::Subscribe { info } => self.handle_subscribe(&info),
            WorkEntry::Unsubscribe { info } => self.handle_unsubscribe(&info),
            WorkEntry::TimerTick => self.wheel.tick(&self.queue),
            WorkEntry::Timeout {
                topic,
                period_seconds,
            } => self.handle_timeout(&topic, period_seconds),
            WorkEntry::Shutdown => {
                self.shutdown();
                return false;
            }
        }
        true
    }

    // ── Handlers ────────────────────────────────────────────────────────────

    fn handle_message(&self, message: &OwnedMessage) {
        let topic = message.destination();
        let Some(script) = self.topics.get(topic) else {
            log::info!("dropping message for unmonitored topic '{topic}'");
            return;
        };
        if let Err(e) = self.scripts.invoke_message(script, message.payload()) {
            log::error!("{ON_MESSAGE_FN} failed for topic '{topic}': {e:#}");
        }
    }

    fn handle_subscribe(&mut self, info: &SubscriptionInfo) {
        if let Err(e) = self.try_subscribe(info) {
            log::warn!(
                "rejecting subscription of topic '{}' to script '{}': {e:#}",
                info.topic(),
                info.script_name()
            );
            // Revoke the broker-side subscription so no message can arrive
            // for a topic with no map entry.
            self.scripts.remove(info.script_name());
            if let Err(e) = self.broker.unsubscribe(info.topic()) {
                log::error!(
                    "failed to revoke broker subscription for '{}': {e:#}",
                    info.topic()
                );
            }
        }
    }

    fn try_subscribe(&mut self, info: &SubscriptionInfo) -> Result<()> {
        self.scripts.load(info.script_name())?;
        if !self.scripts.has_function(info.script_name(), ON_MESSAGE_FN) {
            bail!(
                "script '{}' does not define {ON_MESSAGE_FN}",
                info.script_name()
            );
        }
        if info.period_seconds() > 0 {
            if !self.scripts.has_function(info.script_name(), ON_TIMER_FN) {
                bail!(
                    "script '{}' sets a {}s timer but does not define {ON_TIMER_FN}",
                    info.script_name(),
                    info.period_seconds()
                );
            }
            self.wheel.add(info.topic(), info.period_seconds());
            if log::log_enabled!(log::Level::Debug) {
                self.wheel.dump_state();
            }
        }
        self.topics
            .insert(info.topic().to_owned(), info.script_name().to_owned());
        log::info!(
            "monitoring topic '{}' with script '{}' (period {}s)",
            info.topic(),
            info.script_name(),
            info.period_seconds()
        );
        Ok(())
    }

    fn handle_unsubscribe(&mut self, info: &SubscriptionInfo) {
        let Some(script) = self.topics.remove(info.topic()) else {
            log::debug!("unsubscribe for unmonitored topic '{}'", info.topic());
            return;
        };
        // Pending wheel entries stay where they are; the Timeout handler
        // drops them when it finds the topic unmapped.
        self.scripts.remove(&script);
        if let Err(e) = self.broker.unsubscribe(info.topic()) {
            log::error!(
                "failed to revoke broker subscription for '{}': {e:#}",
                info.topic()
            );
        }
        log::info!("stopped monitoring topic '{}'", info.topic());
    }

    fn handle_timeout(&mut self, topic: &str, period_seconds: u32) {
        let Some(script) = self.topics.get(topic) else {
            // Stale entry from a topic unsubscribed after scheduling.
            log::debug!("dropping stale timeout for topic '{topic}'");
            return;
        };
        if let Err(e) = self.scripts.invoke_timer(script) {
            log::error!("{ON_TIMER_FN} failed for topic '{topic}': {e:#}");
        }
        // Re-arm regardless of the invocation result: the timer is periodic.
        self.wheel.add(topic, period_seconds);
    }

    fn shutdown(&mut self) {
        log::info!("shutting down: revoking {} subscription(s)", self.topics.len());
        for (topic, script) in self.topics.drain() {
            if let Err(e) = self.broker.unsubscribe(&topic) {
                log::error!("failed to unsubscribe '{topic}' during shutdown: {e:#}");
            }
            self.scripts.remove(&script);
        }
    }

    /// Pending wheel entries for `topic` (diagnostics and tests).
    #[must_use]
    pub fn pending_timeouts(&self, topic: &str) -> usize {
        self.wheel.pending_for(topic)
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────
