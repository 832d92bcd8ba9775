//! Script host types and data structures.

use std::fmt;

use mlua::UserData;

use super::capability::Capabilities;
use super::engine::ResourceLimits;

/// Shared definitions loaded into every script before its body.
const DEFAULT_BOOTSTRAP: &str = include_str!("bootstrap.lua");

/// Default name of the persisted autoload list.
pub const DEFAULT_AUTOLOAD_FILE: &str = "luafiles.cfg";

/// Identity of one script instance.
///
/// Ids are never reused by a registry, so a reloaded script gets a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptId(pub u64);

impl fmt::Display for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Exposed to scripts as the opaque `g_Self` value.
impl UserData for ScriptId {}

/// Lifecycle state of a script instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptState {
    /// Registered but not initialized; no interpreter exists.
    Uninitialized,
    /// Initialized and receiving events.
    Loaded,
    /// Interpreter destroyed. Terminal.
    Unloaded,
}

impl fmt::Display for ScriptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Loaded => "loaded",
            Self::Unloaded => "unloaded",
        };
        f.write_str(s)
    }
}

/// Snapshot of one script for administrative listings.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptSummary {
    pub id: ScriptId,
    pub filename: String,
    pub state: ScriptState,
    /// Value of `g_ScriptInfo`, if the script set one.
    pub metadata: Option<String>,
    pub autoload: bool,
    pub capabilities: Capabilities,
    /// Reason of the last forced unload.
    pub last_error: Option<String>,
    /// Current consecutive-error count.
    pub error_count: u32,
}

/// Result of scanning a script folder.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Number of scripts added.
    pub added: usize,
    /// Number of scripts initialized because they are autoloaded.
    pub loaded: usize,
    /// Files that were found but not added, with the reason.
    pub rejected: Vec<(String, String)>,
}

impl ScanReport {
    /// Check if any script was rejected.
    pub fn has_rejections(&self) -> bool {
        !self.rejected.is_empty()
    }
}

/// Result of broadcasting one event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Number of hook functions called.
    pub calls: usize,
    /// Number of calls that failed.
    pub faults: usize,
    /// Scripts unloaded because of this dispatch.
    pub quarantined: Vec<String>,
}

/// What the fault-isolation policy did with one error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The error was counted; the value is the new consecutive-error count.
    Counted(u32),
    /// The error limit was reached and the script was unloaded.
    Quarantined,
    /// No script with that id is registered.
    UnknownScript,
    /// The script is not loaded; nothing was counted.
    NotLoaded,
}

/// Shared definitions executed in every interpreter before the script body.
#[derive(Debug, Clone)]
pub struct Bootstrap {
    /// Chunk name used in error messages.
    pub name: String,
    /// Lua source.
    pub source: String,
}

impl Default for Bootstrap {
    fn default() -> Self {
        Self {
            name: "=bootstrap".to_string(),
            source: DEFAULT_BOOTSTRAP.to_string(),
        }
    }
}

/// Settings shared by every script instance of a registry.
#[derive(Debug, Clone)]
pub struct HostSettings {
    /// Storage path of the persisted autoload list.
    pub autoload_file: String,
    /// Interpreter limits.
    pub limits: ResourceLimits,
    /// Bootstrap definitions.
    pub bootstrap: Bootstrap,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            autoload_file: DEFAULT_AUTOLOAD_FILE.to_string(),
            limits: ResourceLimits::default(),
            bootstrap: Bootstrap::default(),
        }
    }
}
