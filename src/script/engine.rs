//! Lua interpreter construction with capability-gated sandboxing.

use std::collections::HashMap;

use mlua::{ChunkMode, Function, Lua, LuaOptions, StdLib, Value, Variadic};
use tracing::{debug, error, info, warn};

use super::api::value_to_string;
use super::capability::Capabilities;
use super::marshal::{CallArgs, CallError, ExecutionBudget, FromCallResult, Marshaller};
use super::types::Bootstrap;

/// Replaces `load` with a text-only version. Binary chunks only enter an
/// interpreter through the host's verified loading path.
const TEXT_ONLY_LOAD: &str = r##"
local raw_load = load
load = function(chunk, name, _, ...)
    if select("#", ...) > 0 then
        return raw_load(chunk, name, "t", ...)
    end
    return raw_load(chunk, name, "t")
end
"##;

/// Resource limits for script execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum number of instructions per call into the script (0 = unlimited).
    pub max_instructions: u64,
    /// Maximum memory in bytes (0 = unlimited).
    pub max_memory: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_instructions: 1_000_000,
            max_memory: 10 * 1024 * 1024, // 10MB
        }
    }
}

impl ResourceLimits {
    /// Per-call execution budget.
    pub fn budget(&self) -> ExecutionBudget {
        ExecutionBudget::instructions(self.max_instructions)
    }
}

/// Libraries every script gets.
///
/// The base library is always opened. Lua 5.4 has native bitwise operators.
pub fn baseline_libs() -> StdLib {
    StdLib::COROUTINE | StdLib::TABLE | StdLib::STRING | StdLib::UTF8 | StdLib::MATH
}

/// Libraries opened for a capability set.
pub fn library_set(capabilities: Capabilities) -> StdLib {
    let mut libs = baseline_libs();
    if capabilities.contains(Capabilities::IO) {
        libs = libs | StdLib::IO;
    }
    if capabilities.contains(Capabilities::OS) {
        libs = libs | StdLib::OS;
    }
    if capabilities.contains(Capabilities::PACKAGE) {
        libs = libs | StdLib::PACKAGE;
    }
    if capabilities.contains(Capabilities::DEBUG) {
        libs = libs | StdLib::DEBUG;
    }
    libs
}

/// One sandboxed interpreter together with its call machinery.
pub struct ScriptEngine {
    lua: Lua,
    marshaller: Marshaller,
    /// Event hooks resolved so far; `None` caches a missing hook.
    hooks: HashMap<String, Option<Function>>,
    name: String,
}

impl ScriptEngine {
    /// Create an interpreter for the script `name` with the given capabilities.
    pub fn new(name: &str, capabilities: Capabilities, limits: &ResourceLimits) -> mlua::Result<Self> {
        // SAFETY: the library set is built from the baseline plus granted
        // capabilities only. Binary chunks are needed for compiled scripts
        // and are checked by the integrity verifier before loading; the
        // script-facing `load` is restricted to text below.
        let lua = unsafe { Lua::unsafe_new_with(library_set(capabilities), LuaOptions::new()) };

        if limits.max_memory > 0 {
            lua.set_memory_limit(limits.max_memory)?;
        }

        Self::apply_sandbox(&lua, name, capabilities)?;

        let marshaller = Marshaller::new(&lua, limits.budget())?;

        Ok(Self {
            lua,
            marshaller,
            hooks: HashMap::new(),
            name: name.to_string(),
        })
    }

    /// Apply sandbox restrictions and host natives to the Lua environment.
    fn apply_sandbox(lua: &Lua, name: &str, capabilities: Capabilities) -> mlua::Result<()> {
        let globals = lua.globals();

        if !capabilities.contains(Capabilities::IO) {
            globals.set("dofile", Value::Nil)?;
            globals.set("loadfile", Value::Nil)?;
        }
        if capabilities.contains(Capabilities::FFI) {
            warn!("script '{}' requests ffi, which this interpreter does not provide", name);
        }

        lua.load(TEXT_ONLY_LOAD).set_name("=sandbox").exec()?;

        let script = name.to_string();
        let print = lua.create_function(move |_, values: Variadic<Value>| {
            let text: Vec<String> = values.iter().map(value_to_string).collect();
            info!(target: "script", "[{}] {}", script, text.join("\t"));
            Ok(())
        })?;
        globals.set("print", print)?;

        let script = name.to_string();
        let errorfunc = lua.create_function(move |_, message: Value| {
            error!("script error in '{}': {}", script, value_to_string(&message));
            Ok(message)
        })?;
        globals.set("errorfunc", errorfunc)?;

        Ok(())
    }

    /// Execute the bootstrap definitions.
    pub fn load_bootstrap(&self, bootstrap: &Bootstrap) -> mlua::Result<()> {
        self.lua
            .load(bootstrap.source.as_str())
            .set_name(bootstrap.name.as_str())
            .exec()
    }

    /// Compile and run a chunk under the execution budget.
    pub fn run_chunk(&self, chunk_name: &str, bytes: Vec<u8>, mode: ChunkMode) -> Result<(), CallError> {
        let body = self
            .lua
            .load(bytes)
            .set_name(format!("@{}", chunk_name))
            .set_mode(mode)
            .into_function()
            .map_err(|e| CallError::RuntimeError(e.to_string()))?;

        self.marshaller
            .invoke::<()>(&self.lua, chunk_name, &body, &CallArgs::new())
    }

    /// Resolve a global function.
    pub fn get_function(&self, name: &str) -> Option<Function> {
        match self.lua.globals().get::<Value>(name) {
            Ok(Value::Function(func)) => Some(func),
            _ => {
                debug!("function '{}' not found in '{}'", name, self.name);
                None
            }
        }
    }

    /// Call a global function with typed arguments and result.
    pub fn call<R: FromCallResult>(&self, function: &str, args: &CallArgs) -> Result<R, CallError> {
        self.marshaller.call(&self.lua, function, args)
    }

    /// Call an already resolved function.
    pub fn invoke<R: FromCallResult>(
        &self,
        name: &str,
        func: &Function,
        args: &CallArgs,
    ) -> Result<R, CallError> {
        self.marshaller.invoke(&self.lua, name, func, args)
    }

    /// Call the hook for `event`, resolving it on first use.
    ///
    /// Returns `None` if the script does not define the hook.
    pub fn call_hook(&mut self, event: &str, args: &CallArgs) -> Option<Result<(), CallError>> {
        let Self {
            lua,
            marshaller,
            hooks,
            ..
        } = self;

        let func = hooks
            .entry(event.to_string())
            .or_insert_with(|| match lua.globals().get::<Value>(event) {
                Ok(Value::Function(func)) => Some(func),
                _ => None,
            })
            .clone()?;

        Some(marshaller.invoke::<()>(lua, event, &func, args))
    }

    /// Read a global value.
    pub fn get_global(&self, name: &str) -> mlua::Result<Value> {
        self.lua.globals().get(name)
    }

    /// Get a reference to the underlying Lua instance.
    pub fn lua(&self) -> &Lua {
        &self.lua
    }
}
