//! Built-in functions available to monitoring scripts.
//!
//! Registered in the shared globals, which every script environment reads
//! through its metatable.
//!
//! # Usage in Lua
//!
//! ```lua
//! function onMessage(payload)
//!     log.info("got " .. payload)
//! end
//! ```
//!
//! Messages are routed through Rust's `log` crate under the `script` target,
//! so they land in the same sink as engine logs and respect the configured
//! level filters.

use anyhow::{anyhow, Result};
use mlua::Lua;

/// Register every primitive with the Lua state.
///
/// # Errors
///
/// Returns an error if any registration fails.
pub fn register_all(lua: &Lua) -> Result<()> {
    register_log(lua)?;
    Ok(())
}

/// Register the `log` table with `debug`/`info`/`warn`/`error` functions.
fn register_log(lua: &Lua) -> Result<()> {
    let log_table = lua
        .create_table()
        .map_err(|e| anyhow!("failed to create log table: {e}"))?;

    let debug_fn = lua
        .create_function(|_, msg: String| {
            log::debug!(target: "script", "{}", msg);
            Ok(())
        })
        .map_err(|e| anyhow!("failed to create log.debug: {e}"))?;
    log_table
        .set("debug", debug_fn)
        .map_err(|e| anyhow!("failed to set log.debug: {e}"))?;

    let info_fn = lua
        .create_function(|_, msg: String| {
            log::info!(target: "script", "{}", msg);
            Ok(())
        })
        .map_err(|e| anyhow!("failed to create log.info: {e}"))?;
    log_table
        .set("info", info_fn)
        .map_err(|e| anyhow!("failed to set log.info: {e}"))?;

    let warn_fn = lua
        .create_function(|_, msg: String| {
            log::warn!(target: "script", "{}", msg);
            Ok(())
        })
        .map_err(|e| anyhow!("failed to create log.warn: {e}"))?;
    log_table
        .set("warn", warn_fn)
        .map_err(|e| anyhow!("failed to set log.warn: {e}"))?;

    let error_fn = lua
        .create_function(|_, msg: String| {
            log::error!(target: "script", "{}", msg);
            Ok(())
        })
        .map_err(|e| anyhow!("failed to create log.error: {e}"))?;
    log_table
        .set("error", error_fn)
        .map_err(|e| anyhow!("failed to set log.error: {e}"))?;

    lua.globals()
        .set("log", log_table)
        .map_err(|e| anyhow!("failed to register log table globally: {e}"))?;

    Ok(())
}
