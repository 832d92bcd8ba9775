//! Integrity checks run before a script payload reaches the interpreter.
//!
//! Compiled chunks must start with the Lua bytecode signature and source
//! files must not. This keeps precompiled payloads from hiding behind a
//! `.lua` name and stops truncated or foreign binaries from being loaded as
//! bytecode.

use mlua::ChunkMode;
use thiserror::Error;
use tracing::warn;

use super::storage::Storage;

/// Leading bytes of every Lua binary chunk.
pub const LUA_SIGNATURE: &[u8; 4] = b"\x1bLua";

/// Extension of source scripts.
pub const SOURCE_EXTENSION: &str = ".lua";

/// Extension of compiled scripts ("compiled lua chunk").
pub const COMPILED_EXTENSION: &str = ".clc";

/// Claimed nature of a script file, derived from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    Source,
    Compiled,
}

impl ScriptKind {
    /// Classify a filename by its extension, ignoring case.
    ///
    /// Names that are only an extension (or shorter) are not scripts.
    pub fn from_filename(filename: &str) -> Option<Self> {
        if filename.len() <= SOURCE_EXTENSION.len() {
            return None;
        }

        let ext = filename.get(filename.len() - SOURCE_EXTENSION.len()..)?;
        if ext.eq_ignore_ascii_case(SOURCE_EXTENSION) {
            Some(Self::Source)
        } else if ext.eq_ignore_ascii_case(COMPILED_EXTENSION) {
            Some(Self::Compiled)
        } else {
            None
        }
    }

    /// Chunk mode the interpreter must load this kind with.
    pub fn chunk_mode(&self) -> ChunkMode {
        match self {
            Self::Source => ChunkMode::Text,
            Self::Compiled => ChunkMode::Binary,
        }
    }
}

/// Integrity violation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    /// A compiled script does not carry the bytecode signature.
    #[error("invalid precompiled script '{file}' (signature {found} != {expected})")]
    TamperedBinary {
        file: String,
        found: String,
        expected: String,
    },

    /// A source script starts with the bytecode signature.
    #[error("precompiled script '{file}' pretending to be a source script")]
    SpoofedSource { file: String },

    /// The file could not be read for the check.
    #[error("failed to open script '{file}' for integrity check: {message}")]
    Unreadable { file: String, message: String },
}

/// Whether a file prefix carries the bytecode signature.
pub fn has_signature(prefix: &[u8]) -> bool {
    prefix.starts_with(LUA_SIGNATURE)
}

/// Check a file prefix against the claimed kind.
pub fn check_prefix(file: &str, prefix: &[u8], kind: ScriptKind) -> Result<(), IntegrityError> {
    match (kind, has_signature(prefix)) {
        (ScriptKind::Compiled, false) => Err(IntegrityError::TamperedBinary {
            file: file.to_string(),
            found: escape_bytes(prefix),
            expected: escape_bytes(LUA_SIGNATURE),
        }),
        (ScriptKind::Source, true) => Err(IntegrityError::SpoofedSource {
            file: file.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Read the prefix of `filename` and check it against `kind`.
///
/// Rejections are logged as security warnings.
pub fn verify(storage: &dyn Storage, filename: &str, kind: ScriptKind) -> Result<(), IntegrityError> {
    let prefix = storage
        .read_prefix(filename, LUA_SIGNATURE.len())
        .map_err(|e| IntegrityError::Unreadable {
            file: filename.to_string(),
            message: e.to_string(),
        })?;

    check_prefix(filename, &prefix, kind).inspect_err(|e| {
        warn!("!! SECURITY: prevented loading script: {}", e);
    })
}

fn escape_bytes(bytes: &[u8]) -> String {
    bytes.escape_ascii().to_string()
}
