//! Embedded Lua runtime hosting the per-topic monitoring scripts.
//!
//! One [`mlua::Lua`] instance serves every script, but each script runs in
//! its own *environment*: a fresh table whose metatable falls through to the
//! shared globals on reads while writes stay in the table. A script can call
//! anything registered globally (the Lua stdlib, the `log` table) yet cannot
//! see another script's top-level assignments.
//!
//! Environments live in the Lua named registry under the script's file name,
//! so the host never juggles raw stack slots — callers go through
//! [`ScriptHost::load`], [`ScriptHost::invoke_message`],
//! [`ScriptHost::invoke_timer`] and [`ScriptHost::remove`].
//!
//! The `Lua` state is not shared across threads; the engine thread is the
//! only caller.

pub mod primitives;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use mlua::{Lua, Table, Value};

/// Handler a script must define to receive messages.
pub const ON_MESSAGE_FN: &str = "onMessage";

/// Handler a script must define when its subscription has a timer.
pub const ON_TIMER_FN: &str = "onTimer";

/// Owns the Lua interpreter and the per-script environments.
pub struct ScriptHost {
    lua: Lua,
    scripts_dir: PathBuf,
}

impl std::fmt::Debug for ScriptHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptHost")
            .field("scripts_dir", &self.scripts_dir)
            .finish_non_exhaustive()
    }
}

impl ScriptHost {
    /// Create the runtime and register the primitives scripts may call.
    ///
    /// # Errors
    ///
    /// Returns an error if primitive registration fails.
    pub fn new(scripts_dir: impl Into<PathBuf>) -> Result<Self> {
        let lua = Lua::new();
        primitives::register_all(&lua).context("failed to register script primitives")?;
        Ok(Self {
            lua,
            scripts_dir: scripts_dir.into(),
        })
    }

    /// Directory scripts are loaded from.
    #[must_use]
    pub fn scripts_dir(&self) -> &Path {
        &self.scripts_dir
    }

    /// Load and run `<scripts_dir>/<script_name>` inside a fresh environment.
    ///
    /// The environment is registered under `script_name` before the chunk
    /// runs, so a partially-initialised environment is visible to
    /// [`ScriptHost::remove`] if the top level raises.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, fails to compile, or its
    /// top level raises.
    pub fn load(&self, script_name: &str) -> Result<()> {
        let path = self.scripts_dir.join(script_name);
        let source = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read script file: {}", path.display()))?;

        let env = self
            .lua
            .create_table()
            .map_err(|e| anyhow!("failed to create environment table: {e}"))?;
        let meta = self
            .lua
            .create_table()
            .map_err(|e| anyhow!("failed to create environment metatable: {e}"))?;
        meta.set("__index", self.lua.globals())
            .map_err(|e| anyhow!("failed to set __index fall-through: {e}"))?;
        env.set_metatable(Some(meta));

        self.lua
            .set_named_registry_value(script_name, &env)
            .map_err(|e| anyhow!("failed to register environment '{script_name}': {e}"))?;

        self.lua
            .load(&source)
            .set_name(script_name)
            .set_environment(env)
            .exec()
            .map_err(|e| anyhow!("failed to execute script {}: {e}", path.display()))?;

        log::debug!("loaded script: {}", path.display());
        Ok(())
    }

    /// Whether `name` resolves to a callable in the script's environment.
    ///
    /// The lookup honours the metatable, so a function defined globally also
    /// counts — the same resolution the script itself would see.
    #[must_use]
    pub fn has_function(&self, script_name: &str, name: &str) -> bool {
        let Ok(env) = self.env(script_name) else {
            return false;
        };
        matches!(env.get::<Value>(name), Ok(Value::Function(_)))
    }

    /// Call the script's `onMessage(payload)` handler.
    ///
    /// The payload is passed as a binary-safe Lua string.
    ///
    /// # Errors
    ///
    /// Returns an error carrying the script's raised message if the call
    /// traps, or if no environment is loaded under `script_name`.
    pub fn invoke_message(&self, script_name: &str, payload: &[u8]) -> Result<()> {
        let payload = self
            .lua
            .create_string(payload)
            .map_err(|e| anyhow!("failed to create payload string: {e}"))?;
        self.call_in_env(script_name, ON_MESSAGE_FN, payload)
    }

    /// Call the script's `onTimer()` handler.
    ///
    /// # Errors
    ///
    /// Same contract as [`ScriptHost::invoke_message`].
    pub fn invoke_timer(&self, script_name: &str) -> Result<()> {
        self.call_in_env(script_name, ON_TIMER_FN, ())
    }

    /// Drop the script's environment. Subsequent invocations for this name
    /// fail until the script is loaded again. Removing an unknown name is a
    /// no-op.
    pub fn remove(&self, script_name: &str) {
        if let Err(e) = self.lua.unset_named_registry_value(script_name) {
            log::warn!("failed to drop environment '{script_name}': {e}");
        }
    }

    fn env(&self, script_name: &str) -> Result<Table> {
        self.lua
            .named_registry_value::<Table>(script_name)
            .map_err(|_| anyhow!("no environment loaded for script '{script_name}'"))
    }

    fn call_in_env(
        &self,
        script_name: &str,
        fn_name: &str,
        args: impl mlua::IntoLuaMulti,
    ) -> Result<()> {
        let env = self.env(script_name)?;
        let func: mlua::Function = env
            .get(fn_name)
            .map_err(|e| anyhow!("script '{script_name}' has no function {fn_name}: {e}"))?;
        func.call::<()>(args)
            .map_err(|e| anyhow!("script '{script_name}' {fn_name} raised: {e}"))?;
        Ok(())
    }

    /// Evaluate an expression inside a script's environment. Test-only
    /// observation hook.
    #[cfg(test)]
    pub(crate) fn eval_in_env<R: mlua::FromLuaMulti>(
        &self,
        script_name: &str,
        code: &str,
    ) -> Result<R> {
        let env = self.env(script_name)?;
        self.lua
            .load(code)
            .set_environment(env)
            .eval::<R>()
            .map_err(|e| anyhow!("eval failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    /// Write `source` as a script file and return the host plus tempdir.
    fn host_with_script(name: &str, source: &str) -> (ScriptHost, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("create tempdir");
        let mut file = std::fs::File::create(dir.path().join(name)).expect("create script");
        file.write_all(source.as_bytes()).expect("write script");
        let host = ScriptHost::new(dir.path()).expect("create host");
        (host, dir)
    }

    #[test]
    fn load_missing_script_fails() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let host = ScriptHost::new(dir.path()).expect("create host");
        let err = host.load("absent.lua").unwrap_err();
        assert!(err.to_string().contains("absent.lua"));
    }

    #[test]
    fn load_ill_formed_script_fails() {
        let (host, _dir) = host_with_script("bad.lua", "function onMessage(");
        assert!(host.load("bad.lua").is_err());
    }

    #[test]
    fn load_script_whose_top_level_raises_fails() {
        let (host, _dir) = host_with_script("boom.lua", r#"error("top level boom")"#);
        let err = host.load("boom.lua").unwrap_err();
        assert!(err.to_string().contains("top level boom"));
    }

    #[test]
    fn has_function_distinguishes_defined_handlers() {
        let (host, _dir) = host_with_script(
            "t.lua",
            "function onMessage(p) end",
        );
        host.load("t.lua").expect("load");
        assert!(host.has_function("t.lua", ON_MESSAGE_FN));
        assert!(!host.has_function("t.lua", ON_TIMER_FN));
        assert!(!host.has_function("unloaded.lua", ON_MESSAGE_FN));
    }

    #[test]
    fn invoke_message_delivers_payload() {
        let (host, _dir) = host_with_script(
            "t.lua",
            "function onMessage(p) last_payload = p end",
        );
        host.load("t.lua").expect("load");
        host.invoke_message("t.lua", b"42").expect("invoke");
        let got: String = host.eval_in_env("t.lua", "return last_payload").expect("eval");
        assert_eq!(got, "42");
    }

    #[test]
    fn invoke_message_is_binary_safe() {
        let (host, _dir) = host_with_script(
            "t.lua",
            "function onMessage(p) seen_len = #p end",
        );
        host.load("t.lua").expect("load");
        host.invoke_message("t.lua", &[0x00, 0xff, 0x00, 0x7f])
            .expect("invoke");
        let len: usize = host.eval_in_env("t.lua", "return seen_len").expect("eval");
        assert_eq!(len, 4);
    }

    #[test]
    fn trap_in_handler_surfaces_script_message() {
        let (host, _dir) = host_with_script(
            "t.lua",
            r#"function onMessage(p) error("handler boom: " .. p) end"#,
        );
        host.load("t.lua").expect("load");
        let err = host.invoke_message("t.lua", b"x").unwrap_err();
        assert!(err.to_string().contains("handler boom: x"));

        // The environment survives the trap.
        assert!(host.has_function("t.lua", ON_MESSAGE_FN));
        host.invoke_message("t.lua", b"y").unwrap_err();
    }

    #[test]
    fn environments_are_isolated() {
        let dir = tempfile::tempdir().expect("create tempdir");
        std::fs::write(
            dir.path().join("a.lua"),
            "secret = \"from a\"\nfunction onMessage(p) end",
        )
        .expect("write a");
        std::fs::write(
            dir.path().join("b.lua"),
            "function onMessage(p) leaked = secret end",
        )
        .expect("write b");

        let host = ScriptHost::new(dir.path()).expect("create host");
        host.load("a.lua").expect("load a");
        host.load("b.lua").expect("load b");

        host.invoke_message("b.lua", b"").expect("invoke b");
        let leaked: Value = host.eval_in_env("b.lua", "return leaked").expect("eval");
        assert!(matches!(leaked, Value::Nil), "b must not see a's globals");
    }

    #[test]
    fn scripts_read_shared_globals() {
        let (host, _dir) = host_with_script(
            "t.lua",
            "function onMessage(p) has_log = log ~= nil end",
        );
        host.load("t.lua").expect("load");
        host.invoke_message("t.lua", b"").expect("invoke");
        let has_log: bool = host.eval_in_env("t.lua", "return has_log").expect("eval");
        assert!(has_log, "shared globals must be readable through the env");
    }

    #[test]
    fn remove_drops_environment() {
        let (host, _dir) = host_with_script("t.lua", "function onMessage(p) end");
        host.load("t.lua").expect("load");
        host.remove("t.lua");
        assert!(!host.has_function("t.lua", ON_MESSAGE_FN));
        assert!(host.invoke_message("t.lua", b"").is_err());
    }

    #[test]
    fn reload_after_remove_starts_fresh() {
        let (host, _dir) = host_with_script(
            "t.lua",
            "counter = (counter or 0) + 1\nfunction onMessage(p) end",
        );
        host.load("t.lua").expect("load");
        host.remove("t.lua");
        host.load("t.lua").expect("reload");
        let counter: i64 = host.eval_in_env("t.lua", "return counter").expect("eval");
        assert_eq!(counter, 1, "fresh environment must not see old writes");
    }
}
