//! Test helpers for script host integration tests.
//!
//! Provides a scratch script folder and a registry wired to it.

#![allow(dead_code)]

use std::fs;
use std::path::Path;

use tempfile::TempDir;

use scripthost::script::{
    FileStorage, HostBindings, HostSettings, NoBindings, ScriptRegistry,
};

/// Folder scanned by the helpers.
pub const ROOT: &str = "scripts";

/// Scratch base directory holding a script folder.
pub struct TestHost {
    pub dir: TempDir,
}

impl TestHost {
    /// Create an empty base directory with an empty script folder.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        fs::create_dir_all(dir.path().join(ROOT)).expect("failed to create script folder");
        Self { dir }
    }

    /// Base directory path.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write a file relative to the base directory, creating parents.
    pub fn write(&self, name: &str, content: impl AsRef<[u8]>) -> &Self {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("failed to create parent");
        }
        fs::write(path, content).expect("failed to write file");
        self
    }

    /// Write a script below the script folder.
    pub fn script(&self, name: &str, content: impl AsRef<[u8]>) -> &Self {
        self.write(&format!("{ROOT}/{name}"), content)
    }

    /// Read a file relative to the base directory.
    pub fn read(&self, name: &str) -> String {
        fs::read_to_string(self.dir.path().join(name)).expect("failed to read file")
    }

    /// Registry without host natives.
    pub fn registry(&self) -> ScriptRegistry {
        self.registry_with(NoBindings)
    }

    /// Registry with the given host natives.
    pub fn registry_with(&self, bindings: impl HostBindings + 'static) -> ScriptRegistry {
        ScriptRegistry::new(
            Box::new(FileStorage::new(self.dir.path())),
            Box::new(bindings),
            HostSettings::default(),
        )
    }
}

/// Compile Lua source to a precompiled chunk.
pub fn compile(source: &str) -> Vec<u8> {
    mlua::Lua::new()
        .load(source)
        .into_function()
        .expect("failed to compile fixture")
        .dump(false)
}

/// Full script path for a name below the script folder.
pub fn path(name: &str) -> String {
    format!("{ROOT}/{name}")
}
