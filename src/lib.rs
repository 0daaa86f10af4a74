//! topicwatch — monitors pub/sub topics and runs a Lua script per topic.
//!
//! The engine consumes a single queue of typed work entries produced by the
//! broker adapter's I/O threads, dispatches them on one worker, and drives
//! per-topic sandboxed Lua scripts on message arrival and on periodic
//! timeouts scheduled by a 60-slot timing wheel.

// Library modules
pub mod broker;
pub mod config;
pub mod engine;
pub mod logging;
pub mod queue;
pub mod script;
pub mod wheel;
pub mod work;

// Re-export commonly used types
pub use broker::{BrokerAdapter, Outcome};
pub use config::{load_credentials, load_subscription_table, Credentials};
pub use engine::{MonitoringEngine, TopicControl};
pub use queue::WorkQueue;
pub use script::ScriptHost;
pub use wheel::TimeoutWheel;
pub use work::{OwnedMessage, SubscriptionInfo, WorkEntry};
