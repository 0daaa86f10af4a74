//! topicwatch binary — startup, shutdown, and the engine loop.
//!
//! Startup order matters: logging first, then credentials, then the broker
//! session, then the subscription table. Each table row is subscribed at the
//! broker and enqueued as a `Subscribe` work entry; the engine (running on
//! this thread) performs the script loading and wheel arming. Ctrl-c pushes
//! the shutdown sentinel, the engine drains and unsubscribes everything, and
//! the process exits 0. Any startup failure exits −1.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use topicwatch::{
    config, fatal, logging, BrokerAdapter, MonitoringEngine, ScriptHost, WorkEntry, WorkQueue,
};

/// Monitor pub/sub topics with per-topic Lua scripts.
#[derive(Debug, Parser)]
#[command(name = "topicwatch", version, about)]
struct Cli {
    /// Directory containing credentials.lua and subscriptionTable.lua.
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,

    /// Directory containing the monitoring scripts.
    #[arg(long, default_value = "scripts")]
    scripts_dir: PathBuf,

    /// Override the broker address from credentials.lua (host:port).
    #[arg(long)]
    broker: Option<String>,
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        fatal!("{e:#}");
    }
}

fn run(cli: Cli) -> Result<()> {
    let credentials = config::load_credentials(&cli.config_dir.join("credentials.lua"))?;
    let subscriptions =
        config::load_subscription_table(&cli.config_dir.join("subscriptionTable.lua"))?;
    log::info!(
        "loaded {} subscription(s) from {}",
        subscriptions.len(),
        cli.config_dir.display()
    );

    let queue = Arc::new(WorkQueue::new());
    let broker = Arc::new(BrokerAdapter::new(Arc::clone(&queue)));

    let host = cli.broker.as_deref().unwrap_or(&credentials.host);
    broker.connect(
        host,
        &credentials.vpn,
        &credentials.username,
        &credentials.password,
    )?;

    // Tear the session down on every exit path, clean or not.
    let _teardown = scopeguard::guard(Arc::clone(&broker), |broker| {
        if let Err(e) = broker.stop_tick_timer() {
            log::error!("failed to stop tick timer: {e:#}");
        }
        if let Err(e) = broker.disconnect() {
            log::error!("failed to disconnect from broker: {e:#}");
        }
    });

    let scripts = ScriptHost::new(&cli.scripts_dir)?;

    // Subscribe at the broker first, then hand the row to the engine. If the
    // engine later rejects the row (bad script), its cleanup path revokes
    // this subscription again.
    for info in subscriptions {
        match broker.subscribe(info.topic()) {
            Ok(_) => queue.push(WorkEntry::Subscribe { info }),
            Err(e) => log::warn!(
                "broker subscription for topic '{}' failed: {e:#}",
                info.topic()
            ),
        }
    }

    broker.start_tick_timer(Duration::from_secs(1))?;

    {
        let queue = Arc::clone(&queue);
        ctrlc::set_handler(move || queue.push(WorkEntry::Shutdown))
            .context("failed to install shutdown handler")?;
    }

    let mut engine = MonitoringEngine::new(queue, broker, scripts);
    engine.run();

    log::info!("clean shutdown");
    Ok(())
}
