//! Lua script mods hosted by the game server.
//!
//! Every script runs in its own interpreter. The standard libraries it may
//! use are granted by a permission header at the top of the file, payloads
//! are checked against their claimed source/compiled kind before they run,
//! and a script that keeps failing is unloaded by the registry.

pub mod api;
pub mod capability;
pub mod engine;
pub mod instance;
pub mod integrity;
pub mod marshal;
pub mod registry;
pub mod storage;
pub mod types;

pub use api::{caller_id, HostBindings, NoBindings, SELF_GLOBAL};
pub use capability::{parse_permission_header, Capabilities};
pub use engine::{ResourceLimits, ScriptEngine};
pub use instance::{InitError, ScriptInstance, INIT_HOOK, MAX_METADATA_LEN, METADATA_GLOBAL};
pub use integrity::{IntegrityError, ScriptKind, LUA_SIGNATURE};
pub use marshal::{
    CallArg, CallArgs, CallError, CallValue, ExecutionBudget, FromCallResult, Marshaller,
};
pub use registry::{compare_filenames, RegistryError, ScriptRegistry, ERROR_LIMIT, QUARANTINE_MESSAGE};
pub use storage::{DirEntry, FileStorage, ListFilter, Storage};
pub use types::{
    Bootstrap, DispatchReport, FaultOutcome, HostSettings, ScanReport, ScriptId, ScriptState,
    ScriptSummary, DEFAULT_AUTOLOAD_FILE,
};
