//! Native callback surface offered to scripts.
//!
//! The game server decides which natives a script may call; the script host
//! only hands every new interpreter to a [`HostBindings`] implementation
//! before the script body runs.

use mlua::{AnyUserData, Lua, Result as LuaResult, Value};

use super::types::ScriptId;

/// Global holding the opaque identity of the running script.
pub const SELF_GLOBAL: &str = "g_Self";

/// Registers native functions into a fresh interpreter.
pub trait HostBindings {
    /// Install natives for the script identified by `script`.
    fn register(&self, lua: &Lua, script: ScriptId) -> LuaResult<()>;
}

/// Bindings that register nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBindings;

impl HostBindings for NoBindings {
    fn register(&self, _lua: &Lua, _script: ScriptId) -> LuaResult<()> {
        Ok(())
    }
}

impl<F> HostBindings for F
where
    F: Fn(&Lua, ScriptId) -> LuaResult<()>,
{
    fn register(&self, lua: &Lua, script: ScriptId) -> LuaResult<()> {
        self(lua, script)
    }
}

/// Identify the script a native callback was invoked from.
pub fn caller_id(lua: &Lua) -> LuaResult<ScriptId> {
    let this: AnyUserData = lua.globals().get(SELF_GLOBAL)?;
    let id = *this.borrow::<ScriptId>()?;
    Ok(id)
}

impl ScriptId {
    /// Read the id of the script that owns `lua`, see [`caller_id`].
    pub fn from_lua_self(lua: &Lua) -> LuaResult<Self> {
        caller_id(lua)
    }
}

/// Install the self reference of a script.
pub(crate) fn set_caller_id(lua: &Lua, id: ScriptId) -> LuaResult<()> {
    let this = lua.create_userdata(id)?;
    lua.globals().set(SELF_GLOBAL, this)
}

/// Render a Lua value for logs and messages.
pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.to_string_lossy().to_string(),
        Value::Table(_) => "[table]".to_string(),
        Value::Function(_) => "[function]".to_string(),
        Value::Thread(_) => "[thread]".to_string(),
        Value::UserData(_) => "[userdata]".to_string(),
        Value::LightUserData(_) => "[lightuserdata]".to_string(),
        Value::Error(e) => format!("[error: {}]", e),
        _ => "[unknown]".to_string(),
    }
}
