//! A single script together with its private interpreter.

use mlua::{Function, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::api::{self, HostBindings};
use super::capability::{parse_permission_header, Capabilities};
use super::engine::ScriptEngine;
use super::integrity::{self, IntegrityError, ScriptKind};
use super::marshal::{CallArgs, CallError, FromCallResult};
use super::storage::Storage;
use super::types::{HostSettings, ScriptId, ScriptState, ScriptSummary};

/// Hook called once after the script body ran.
pub const INIT_HOOK: &str = "OnScriptInit";

/// Global a script may set to describe itself.
pub const METADATA_GLOBAL: &str = "g_ScriptInfo";

/// Longest metadata string kept, in bytes.
pub const MAX_METADATA_LEN: usize = 127;

/// Failure to bring a script to the loaded state.
#[derive(Error, Debug)]
pub enum InitError {
    /// The filename does not have a script extension.
    #[error("'{0}' is not a script file")]
    NotAScript(String),

    /// The interpreter could not be created.
    #[error("failed to create interpreter for '{file}': {message}")]
    Interpreter { file: String, message: String },

    /// The shared bootstrap definitions failed to load.
    #[error("failed to load bootstrap definitions into '{file}': {message}")]
    Bootstrap { file: String, message: String },

    /// The host bindings could not be registered.
    #[error("failed to register host bindings for '{file}': {message}")]
    Bindings { file: String, message: String },

    /// The payload failed the integrity check.
    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    /// The script body failed to compile or run.
    #[error("failed to load script '{file}': {source}")]
    Load { file: String, source: CallError },

    /// The init hook returned false.
    #[error("'{0}' rejected being loaded, did '{INIT_HOOK}()' return true...?")]
    Rejected(String),

    /// The init hook raised an error.
    #[error("'{INIT_HOOK}' of '{file}' failed: {source}")]
    Hook { file: String, source: CallError },

    /// The script was not in the uninitialized state.
    #[error("script '{file}' cannot be initialized while {state}")]
    InvalidState { file: String, state: ScriptState },

    /// The script file could not be read.
    #[error("failed to read script '{file}': {source}")]
    Io {
        file: String,
        source: std::io::Error,
    },
}

enum Slot {
    Uninitialized,
    Loaded(ScriptEngine),
    Unloaded,
}

/// One script file and its interpreter.
pub struct ScriptInstance {
    id: ScriptId,
    filename: String,
    kind: ScriptKind,
    capabilities: Capabilities,
    autoload: bool,
    metadata: Option<String>,
    last_error: Option<String>,
    slot: Slot,
}

impl ScriptInstance {
    /// Create an uninitialized instance and read its permission header.
    pub fn new(
        id: ScriptId,
        filename: impl Into<String>,
        autoload: bool,
        storage: &dyn Storage,
    ) -> Result<Self, InitError> {
        let filename = filename.into();
        let kind = ScriptKind::from_filename(&filename)
            .ok_or_else(|| InitError::NotAScript(filename.clone()))?;

        // Compiled chunks carry no readable header.
        let capabilities = match kind {
            ScriptKind::Source => {
                let bytes = storage.read(&filename).map_err(|source| InitError::Io {
                    file: filename.clone(),
                    source,
                })?;
                parse_permission_header(&String::from_utf8_lossy(&bytes))
            }
            ScriptKind::Compiled => Capabilities::empty(),
        };

        if !capabilities.is_empty() {
            debug!(
                "script '{}' requests capabilities: {}",
                filename,
                capabilities.keywords().join(", ")
            );
        }

        Ok(Self {
            id,
            filename,
            kind,
            capabilities,
            autoload,
            metadata: None,
            last_error: None,
            slot: Slot::Uninitialized,
        })
    }

    /// Build the interpreter, load the script and run its init hook.
    pub fn init(
        &mut self,
        storage: &dyn Storage,
        bindings: &dyn HostBindings,
        settings: &HostSettings,
    ) -> Result<(), InitError> {
        if !matches!(self.slot, Slot::Uninitialized) {
            return Err(InitError::InvalidState {
                file: self.filename.clone(),
                state: self.state(),
            });
        }

        let engine = self.build_engine(storage, bindings, settings)?;
        self.slot = Slot::Loaded(engine);

        info!(
            "loaded script '{}'{}",
            self.filename,
            self.metadata
                .as_deref()
                .map(|m| format!(" ({})", m))
                .unwrap_or_default()
        );
        Ok(())
    }

    fn build_engine(
        &mut self,
        storage: &dyn Storage,
        bindings: &dyn HostBindings,
        settings: &HostSettings,
    ) -> Result<ScriptEngine, InitError> {
        let file = self.filename.clone();

        let engine = ScriptEngine::new(&file, self.capabilities, &settings.limits).map_err(|e| {
            InitError::Interpreter {
                file: file.clone(),
                message: e.to_string(),
            }
        })?;

        engine
            .load_bootstrap(&settings.bootstrap)
            .map_err(|e| InitError::Bootstrap {
                file: file.clone(),
                message: e.to_string(),
            })?;

        bindings
            .register(engine.lua(), self.id)
            .map_err(|e| InitError::Bindings {
                file: file.clone(),
                message: e.to_string(),
            })?;

        integrity::verify(storage, &file, self.kind)?;
        let bytes = storage.read(&file).map_err(|source| InitError::Io {
            file: file.clone(),
            source,
        })?;
        engine
            .run_chunk(&file, bytes, self.kind.chunk_mode())
            .map_err(|source| InitError::Load {
                file: file.clone(),
                source,
            })?;

        self.metadata = match engine.get_global(METADATA_GLOBAL) {
            Ok(value @ (Value::String(_) | Value::Integer(_) | Value::Number(_))) => {
                Some(truncate(&api::value_to_string(&value), MAX_METADATA_LEN))
            }
            _ => None,
        };

        api::set_caller_id(engine.lua(), self.id).map_err(|e| InitError::Interpreter {
            file: file.clone(),
            message: e.to_string(),
        })?;

        if let Ok(Value::Function(hook)) = engine.get_global(INIT_HOOK) {
            let accepted = engine
                .invoke::<bool>(INIT_HOOK, &hook, &CallArgs::new())
                .map_err(|source| InitError::Hook {
                    file: file.clone(),
                    source,
                })?;
            if !accepted {
                return Err(InitError::Rejected(file));
            }
        }

        Ok(engine)
    }

    /// Resolve a global function of the loaded script.
    pub fn get_function(&self, name: &str) -> Option<Function> {
        self.engine()?.get_function(name)
    }

    /// Call a global function with typed arguments and result.
    pub fn call<R: FromCallResult>(&self, function: &str, args: &CallArgs) -> Result<R, CallError> {
        self.engine()
            .ok_or_else(|| CallError::NotLoaded(self.filename.clone()))?
            .call(function, args)
    }

    /// Call the hook for `event`; `None` if not loaded or no such hook.
    pub fn call_hook(&mut self, event: &str, args: &CallArgs) -> Option<Result<(), CallError>> {
        match &mut self.slot {
            Slot::Loaded(engine) => engine.call_hook(event, args),
            _ => None,
        }
    }

    /// Destroy the interpreter. Returns false if it was not loaded.
    pub fn unload(&mut self) -> bool {
        let was_loaded = self.is_loaded();
        self.slot = Slot::Unloaded;
        if was_loaded {
            info!("unloaded script '{}'", self.filename);
        }
        was_loaded
    }

    /// Destroy the interpreter and record why.
    pub fn force_unload(&mut self, reason: &str) {
        warn!("force-unloading script '{}': {}", self.filename, reason);
        self.last_error = Some(reason.to_string());
        self.slot = Slot::Unloaded;
    }

    fn engine(&self) -> Option<&ScriptEngine> {
        match &self.slot {
            Slot::Loaded(engine) => Some(engine),
            _ => None,
        }
    }

    pub fn id(&self) -> ScriptId {
        self.id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn kind(&self) -> ScriptKind {
        self.kind
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn autoload(&self) -> bool {
        self.autoload
    }

    pub fn metadata(&self) -> Option<&str> {
        self.metadata.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn state(&self) -> ScriptState {
        match self.slot {
            Slot::Uninitialized => ScriptState::Uninitialized,
            Slot::Loaded(_) => ScriptState::Loaded,
            Slot::Unloaded => ScriptState::Unloaded,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.slot, Slot::Loaded(_))
    }

    /// Snapshot for listings; `error_count` comes from the registry.
    pub fn summary(&self, error_count: u32) -> ScriptSummary {
        ScriptSummary {
            id: self.id,
            filename: self.filename.clone(),
            state: self.state(),
            metadata: self.metadata.clone(),
            autoload: self.autoload,
            capabilities: self.capabilities,
            last_error: self.last_error.clone(),
            error_count,
        }
    }
}

/// Truncate to at most `max` bytes on a char boundary.
fn truncate(s: &str, max: usize) -> String {
    let mut end = s.len().min(max);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
