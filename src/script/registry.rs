//! Script registry: discovery, autoload persistence, event dispatch and
//! fault isolation.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::io;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::api::HostBindings;
use super::instance::{InitError, ScriptInstance};
use super::integrity::{self, IntegrityError, ScriptKind};
use super::marshal::{CallArgs, CallError, FromCallResult};
use super::storage::{ListFilter, Storage};
use super::types::{
    DispatchReport, FaultOutcome, HostSettings, ScanReport, ScriptId, ScriptState, ScriptSummary,
};

/// Consecutive errors after which a script is unloaded.
pub const ERROR_LIMIT: u32 = 512;

/// Reason recorded on a script unloaded by fault isolation.
pub const QUARANTINE_MESSAGE: &str = "error count limit exceeded (too many errors raised)";

/// Registry operation error.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("'{0}' is not a script file")]
    NotAScript(String),

    #[error("script '{0}' is already registered")]
    Duplicate(String),

    #[error("script '{0}' not found")]
    NotFound(String),

    #[error("script '{file}' is {state}")]
    InvalidState { file: String, state: ScriptState },

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Init(#[from] InitError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error("failed to access '{path}': {source}")]
    Io { path: String, source: io::Error },
}

/// Owns every script instance of a server.
pub struct ScriptRegistry {
    storage: Box<dyn Storage>,
    bindings: Box<dyn HostBindings>,
    settings: HostSettings,
    scripts: Vec<ScriptInstance>,
    autoload_candidates: HashSet<String>,
    error_counters: HashMap<ScriptId, u32>,
    next_id: u64,
}

impl ScriptRegistry {
    /// Create an empty registry.
    pub fn new(
        storage: Box<dyn Storage>,
        bindings: Box<dyn HostBindings>,
        settings: HostSettings,
    ) -> Self {
        Self {
            storage,
            bindings,
            settings,
            scripts: Vec::new(),
            autoload_candidates: HashSet::new(),
            error_counters: HashMap::new(),
            next_id: 1,
        }
    }

    /// Recursively discover scripts below `root` and add them.
    ///
    /// Afterwards the scripts are sorted by their path below `root`.
    pub fn scan(&mut self, root: &str) -> ScanReport {
        let mut report = ScanReport::default();
        self.scan_directory(root, &mut report);
        self.sort_scripts(root.len() + 1);

        info!(
            "scanned '{}': {} added, {} loaded, {} rejected",
            root,
            report.added,
            report.loaded,
            report.rejected.len()
        );
        report
    }

    fn scan_directory(&mut self, dir: &str, report: &mut ScanReport) {
        let entries = match self.storage.list_directory(ListFilter::All, dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("failed to list script folder '{}': {}", dir, e);
                return;
            }
        };

        for entry in entries {
            if entry.name.starts_with('.') {
                continue;
            }

            let path = format!("{}/{}", dir, entry.name);
            if entry.is_dir {
                self.scan_directory(&path, report);
                continue;
            }
            if ScriptKind::from_filename(&path).is_none() {
                continue;
            }

            match self.add_script(&path) {
                Ok(id) => {
                    report.added += 1;
                    if self.get_by_id(id).is_some_and(ScriptInstance::is_loaded) {
                        report.loaded += 1;
                    }
                }
                Err(RegistryError::Duplicate(_)) => {}
                Err(e) => report.rejected.push((path, e.to_string())),
            }
        }
    }

    /// Stable sort by filename, ignoring case and the first `skip` bytes.
    pub fn sort_scripts(&mut self, skip: usize) {
        self.scripts
            .sort_by(|a, b| compare_filenames(a.filename(), b.filename(), skip));
    }

    /// Add a script, autoloading it if it is an autoload candidate.
    pub fn add_script(&mut self, filename: &str) -> Result<ScriptId, RegistryError> {
        let autoload = self.autoload_candidates.contains(filename);
        self.add_script_with(filename, autoload)
    }

    /// Add a script with an explicit autoload flag.
    ///
    /// An autoloaded script whose init fails is not kept.
    pub fn add_script_with(
        &mut self,
        filename: &str,
        autoload: bool,
    ) -> Result<ScriptId, RegistryError> {
        let kind = ScriptKind::from_filename(filename)
            .ok_or_else(|| RegistryError::NotAScript(filename.to_string()))?;

        if self.position(filename).is_some() {
            debug!("script '{}' is already registered", filename);
            return Err(RegistryError::Duplicate(filename.to_string()));
        }

        integrity::verify(self.storage.as_ref(), filename, kind)?;

        let id = self.allocate_id();
        let mut script = ScriptInstance::new(id, filename, autoload, self.storage.as_ref())?;
        if autoload {
            script
                .init(self.storage.as_ref(), self.bindings.as_ref(), &self.settings)
                .inspect_err(|e| warn!("failed to autoload script '{}': {}", filename, e))?;
        }

        debug!("added script '{}' as {}", filename, id);
        self.scripts.push(script);
        Ok(id)
    }

    /// Rewrite the autoload file with every autoloaded script.
    pub fn persist_autoloads(&self) -> Result<(), RegistryError> {
        let lines: Vec<String> = self
            .scripts
            .iter()
            .filter(|s| s.autoload())
            .map(|s| s.filename().to_string())
            .collect();

        let path = &self.settings.autoload_file;
        self.storage
            .write_lines(path, &lines)
            .map_err(|source| RegistryError::Io {
                path: path.clone(),
                source,
            })?;

        debug!("saved {} autoload entries to '{}'", lines.len(), path);
        Ok(())
    }

    /// Read the autoload file into the candidate set.
    ///
    /// A missing file yields an empty set. Returns the number of candidates.
    pub fn restore_autoloads(&mut self) -> Result<usize, RegistryError> {
        let path = &self.settings.autoload_file;
        let lines = match self.storage.read_lines(path) {
            Ok(lines) => lines,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no autoload file at '{}'", path);
                Vec::new()
            }
            Err(source) => {
                return Err(RegistryError::Io {
                    path: path.clone(),
                    source,
                })
            }
        };

        self.autoload_candidates = lines
            .into_iter()
            .map(|line| line.trim_end().to_string())
            .filter(|line| !line.is_empty())
            .collect();

        debug!(
            "restored {} autoload entries from '{}'",
            self.autoload_candidates.len(),
            path
        );
        Ok(self.autoload_candidates.len())
    }

    /// Whether `filename` was listed in the restored autoload file.
    pub fn is_autoload_candidate(&self, filename: &str) -> bool {
        self.autoload_candidates.contains(filename)
    }

    /// Call the hook for `event` on every loaded script.
    pub fn dispatch_event(&mut self, event: &str, args: &CallArgs) -> DispatchReport {
        let mut report = DispatchReport::default();

        for index in 0..self.scripts.len() {
            let script = &mut self.scripts[index];
            if !script.is_loaded() {
                continue;
            }
            let Some(result) = script.call_hook(event, args) else {
                continue;
            };
            report.calls += 1;

            if let Err(e) = result {
                report.faults += 1;
                let id = script.id();
                if self.handle_fault(id, &e) == FaultOutcome::Quarantined {
                    report
                        .quarantined
                        .push(self.scripts[index].filename().to_string());
                }
            }
        }

        report
    }

    /// Count an error of script `id` and unload it at the error limit.
    ///
    /// Successful calls never reset the count. Errors of scripts that are not
    /// loaded are not counted.
    pub fn handle_fault(&mut self, id: ScriptId, error: &CallError) -> FaultOutcome {
        let Some(index) = self.scripts.iter().position(|s| s.id() == id) else {
            return FaultOutcome::UnknownScript;
        };
        if !self.scripts[index].is_loaded() {
            debug!(
                "ignoring error of script '{}' while {}: {}",
                self.scripts[index].filename(),
                self.scripts[index].state(),
                error
            );
            return FaultOutcome::NotLoaded;
        }

        let counter = self.error_counters.entry(id).or_insert(0);
        *counter += 1;
        let count = *counter;

        let script = &mut self.scripts[index];
        warn!(
            "error in script '{}' ({}/{}): {}",
            script.filename(),
            count,
            ERROR_LIMIT - 1,
            error
        );

        if count < ERROR_LIMIT {
            return FaultOutcome::Counted(count);
        }

        self.error_counters.remove(&id);
        script.force_unload(QUARANTINE_MESSAGE);
        error!(
            "script '{}' unloaded: {}",
            script.filename(),
            QUARANTINE_MESSAGE
        );
        FaultOutcome::Quarantined
    }

    /// Current consecutive-error count of script `id`.
    pub fn error_count(&self, id: ScriptId) -> u32 {
        self.error_counters.get(&id).copied().unwrap_or(0)
    }

    /// Persist the autoload set and drop every script.
    pub fn shutdown(&mut self) -> Result<(), RegistryError> {
        let persisted = self.persist_autoloads();
        let count = self.scripts.len();
        self.scripts.clear();
        self.error_counters.clear();
        info!("script host shut down, released {} scripts", count);
        persisted
    }

    /// Summaries of every script, in registry order.
    pub fn scripts(&self) -> Vec<ScriptSummary> {
        self.scripts
            .iter()
            .map(|s| s.summary(self.error_count(s.id())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    pub fn get(&self, filename: &str) -> Option<&ScriptInstance> {
        self.scripts.iter().find(|s| s.filename() == filename)
    }

    pub fn get_by_id(&self, id: ScriptId) -> Option<&ScriptInstance> {
        self.scripts.iter().find(|s| s.id() == id)
    }

    /// Initialize a registered, uninitialized script.
    ///
    /// A script whose init fails is removed.
    pub fn load(&mut self, filename: &str) -> Result<(), RegistryError> {
        let index = self.require(filename)?;
        let state = self.scripts[index].state();
        if state != ScriptState::Uninitialized {
            return Err(RegistryError::InvalidState {
                file: filename.to_string(),
                state,
            });
        }

        let result = self.scripts[index].init(
            self.storage.as_ref(),
            self.bindings.as_ref(),
            &self.settings,
        );
        if let Err(e) = result {
            warn!("failed to load script '{}': {}", filename, e);
            let removed = self.scripts.remove(index);
            self.error_counters.remove(&removed.id());
            return Err(e.into());
        }
        Ok(())
    }

    /// Unload a loaded script. It stays listed as unloaded.
    pub fn unload(&mut self, filename: &str) -> Result<(), RegistryError> {
        let index = self.require(filename)?;
        let script = &mut self.scripts[index];
        if !script.unload() {
            return Err(RegistryError::InvalidState {
                file: filename.to_string(),
                state: script.state(),
            });
        }
        self.error_counters.remove(&script.id());
        Ok(())
    }

    /// Replace a script with a fresh instance and initialize it.
    ///
    /// The new instance keeps the registry position and autoload flag but
    /// gets a new id. If its init fails the script is removed.
    pub fn reload(&mut self, filename: &str) -> Result<ScriptId, RegistryError> {
        let index = self.require(filename)?;
        let old = self.scripts.remove(index);
        self.error_counters.remove(&old.id());
        let autoload = old.autoload();
        drop(old);

        let kind = ScriptKind::from_filename(filename)
            .ok_or_else(|| RegistryError::NotAScript(filename.to_string()))?;
        integrity::verify(self.storage.as_ref(), filename, kind)?;

        let id = self.allocate_id();
        let mut script = ScriptInstance::new(id, filename, autoload, self.storage.as_ref())?;
        script
            .init(self.storage.as_ref(), self.bindings.as_ref(), &self.settings)
            .inspect_err(|e| warn!("failed to reload script '{}': {}", filename, e))?;

        info!("reloaded script '{}' as {}", filename, id);
        self.scripts.insert(index, script);
        Ok(id)
    }

    /// Call a function of one script. Errors of a loaded script also count
    /// as faults.
    pub fn call<R: FromCallResult>(
        &mut self,
        filename: &str,
        function: &str,
        args: &CallArgs,
    ) -> Result<R, RegistryError> {
        let index = self.require(filename)?;
        let id = self.scripts[index].id();

        match self.scripts[index].call(function, args) {
            Ok(value) => Ok(value),
            Err(e @ CallError::NotLoaded(_)) => Err(RegistryError::Call(e)),
            Err(e) => {
                self.handle_fault(id, &e);
                Err(RegistryError::Call(e))
            }
        }
    }

    fn position(&self, filename: &str) -> Option<usize> {
        self.scripts.iter().position(|s| s.filename() == filename)
    }

    fn require(&self, filename: &str) -> Result<usize, RegistryError> {
        self.position(filename)
            .ok_or_else(|| RegistryError::NotFound(filename.to_string()))
    }

    fn allocate_id(&mut self) -> ScriptId {
        let id = ScriptId(self.next_id);
        self.next_id += 1;
        id
    }
}

/// Compare two filenames ignoring case and their first `skip` bytes.
///
/// Names shorter than `skip` compare as empty.
pub fn compare_filenames(a: &str, b: &str, skip: usize) -> Ordering {
    let a = String::from_utf8_lossy(a.as_bytes().get(skip..).unwrap_or_default());
    let b = String::from_utf8_lossy(b.as_bytes().get(skip..).unwrap_or_default());
    a.chars()
        .flat_map(char::to_uppercase)
        .cmp(b.chars().flat_map(char::to_uppercase))
}
