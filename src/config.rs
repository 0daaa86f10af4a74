//! Startup configuration: broker credentials and the subscription table.
//!
//! Both files are Lua, executed once at startup in a throwaway Lua state
//! (separate from the engine's script runtime):
//!
//! ```lua
//! -- credentials.lua
//! host     = "broker.example.com:55555"
//! vpn      = "default"
//! username = "monitor"
//! password = "secret"
//! ```
//!
//! ```lua
//! -- subscriptionTable.lua
//! subscriptionTable = {
//!     ["metrics/temp"] = { filename = "temp.lua", timer = 30 },
//!     ["alerts/fan"]   = { filename = "fan.lua" },
//! }
//! ```
//!
//! Any shape error is a startup failure; the caller exits. Per the error
//! policy, nothing here is recoverable — a monitor with a broken
//! configuration has nothing to monitor.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use mlua::{Lua, Table, Value};

use crate::work::SubscriptionInfo;

/// Name of the global table `subscriptionTable.lua` must define.
const SUBSCRIPTION_TABLE_GLOBAL: &str = "subscriptionTable";

/// Broker session credentials from `credentials.lua`.
#[derive(Clone)]
pub struct Credentials {
    /// Broker address, `host:port`.
    pub host: String,
    /// Message VPN name.
    pub vpn: String,
    /// Account user name.
    pub username: String,
    /// Account password.
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("vpn", &self.vpn)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Load credentials from a Lua file defining `host`, `vpn`, `username` and
/// `password` as global strings.
///
/// # Errors
///
/// Returns an error if the file cannot be read or executed, or any field is
/// missing or not a string.
pub fn load_credentials(path: &Path) -> Result<Credentials> {
    let lua = exec_config_file(path)?;
    Ok(Credentials {
        host: string_global(&lua, path, "host")?,
        vpn: string_global(&lua, path, "vpn")?,
        username: string_global(&lua, path, "username")?,
        password: string_global(&lua, path, "password")?,
    })
}

/// Load the subscription table from a Lua file defining a global
/// `subscriptionTable` mapping topics to `{ filename, timer? }`.
///
/// `timer` is the period in seconds and must be at least 1 when present;
/// absent means a message-only subscription. Unknown keys in an entry are
/// rejected.
///
/// # Errors
///
/// Returns an error on any shape violation, including over-long topics or
/// file names.
pub fn load_subscription_table(path: &Path) -> Result<Vec<SubscriptionInfo>> {
    let lua = exec_config_file(path)?;

    let table: Table = lua
        .globals()
        .get(SUBSCRIPTION_TABLE_GLOBAL)
        .map_err(|_| {
            anyhow!(
                "{} does not define a global table '{SUBSCRIPTION_TABLE_GLOBAL}'",
                path.display()
            )
        })?;

    let mut subscriptions = Vec::new();
    for pair in table.pairs::<Value, Value>() {
        let (key, value) = pair.map_err(|e| anyhow!("failed to iterate subscription table: {e}"))?;

        let Value::String(topic) = key else {
            bail!("subscription table keys must be topic strings");
        };
        let topic = topic.to_string_lossy();

        let Value::Table(entry) = value else {
            bail!("subscription entry for topic '{topic}' must be a table");
        };

        let mut filename: Option<String> = None;
        let mut timer: Option<u32> = None;
        for field in entry.pairs::<String, Value>() {
            let (name, field_value) = field.map_err(|e| {
                anyhow!("invalid field in subscription entry for topic '{topic}': {e}")
            })?;
            match name.as_str() {
                "filename" => {
                    let Value::String(s) = field_value else {
                        bail!("'filename' for topic '{topic}' must be a string");
                    };
                    filename = Some(s.to_string_lossy());
                }
                "timer" => {
                    let Value::Integer(n) = field_value else {
                        bail!("'timer' for topic '{topic}' must be an integer");
                    };
                    if n < 1 {
                        bail!("'timer' for topic '{topic}' must be at least 1, got {n}");
                    }
                    timer = Some(u32::try_from(n).map_err(|_| {
                        anyhow!("'timer' for topic '{topic}' is out of range: {n}")
                    })?);
                }
                unknown => bail!("unknown key '{unknown}' in subscription entry for topic '{topic}'"),
            }
        }

        let filename =
            filename.ok_or_else(|| anyhow!("subscription for topic '{topic}' has no filename"))?;
        let info = SubscriptionInfo::new(topic.clone(), filename, timer.unwrap_or(0))
            .with_context(|| format!("invalid subscription for topic '{topic}'"))?;
        subscriptions.push(info);
    }

    Ok(subscriptions)
}

fn exec_config_file(path: &Path) -> Result<Lua> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let lua = Lua::new();
    lua.load(&source)
        .set_name(path.to_string_lossy())
        .exec()
        .map_err(|e| anyhow!("failed to execute config file {}: {e}", path.display()))?;
    Ok(lua)
}

fn string_global(lua: &Lua, path: &Path, name: &str) -> Result<String> {
    match lua.globals().get::<Value>(name) {
        Ok(Value::String(s)) => Ok(s.to_string_lossy()),
        Ok(Value::Nil) | Err(_) => bail!("{} does not define '{name}'", path.display()),
        Ok(_) => bail!("'{name}' in {} must be a string", path.display()),
    }
}
