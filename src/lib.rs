//! scripthost - sandboxed Lua mod host for multiplayer game servers.
//!
//! Discovers script mods on disk, runs each in its own capability-gated
//! interpreter and delivers game events to them.

pub mod config;
pub mod error;
pub mod logging;
pub mod script;

pub use config::Config;
pub use error::{Result, ScriptHostError};
pub use script::{
    CallArgs, CallError, Capabilities, FileStorage, HostBindings, HostSettings, NoBindings,
    ScriptId, ScriptRegistry, ScriptState, Storage,
};
