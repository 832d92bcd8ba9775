//! Capability flags parsed from a script's permission header.
//!
//! A script asks for powerful standard libraries in a comment block at the
//! top of its source:
//!
//! ```lua
//! --[[#!
//!     #io
//!     #os
//! ]]
//! ```
//!
//! Everything outside the block, and every line inside it that is not a
//! `#keyword` for a known capability, is ignored.

use bitflags::bitflags;

/// Opening marker of the permission header.
pub const HEADER_OPEN: &str = "--[[#!";

/// Closing marker of the permission header. Scanning stops at the first
/// line containing it, even before the opening marker was seen.
pub const HEADER_CLOSE: &str = "]]";

/// Only the first bytes of a header line are considered.
const MAX_HEADER_LINE: usize = 31;

bitflags! {
    /// Libraries a script may be given in addition to the safe baseline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u8 {
        /// File input/output (`io`, plus `dofile`/`loadfile`).
        const IO      = 1 << 0;
        /// The `debug` library.
        const DEBUG   = 1 << 1;
        /// Foreign function interface. Recorded, but Lua 5.4 has no `ffi` library.
        const FFI     = 1 << 2;
        /// The `os` library.
        const OS      = 1 << 3;
        /// Module loading (`package`, `require`).
        const PACKAGE = 1 << 4;
    }
}

impl Capabilities {
    /// Map a header keyword to its flag, ignoring case.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        const KEYWORDS: [(&str, Capabilities); 5] = [
            ("io", Capabilities::IO),
            ("debug", Capabilities::DEBUG),
            ("ffi", Capabilities::FFI),
            ("os", Capabilities::OS),
            ("package", Capabilities::PACKAGE),
        ];

        KEYWORDS
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(keyword))
            .map(|(_, flag)| *flag)
    }

    /// Keywords of the granted capabilities, in flag order.
    pub fn keywords(&self) -> Vec<&'static str> {
        self.iter_names()
            .map(|(name, _)| match name {
                "IO" => "io",
                "DEBUG" => "debug",
                "FFI" => "ffi",
                "OS" => "os",
                _ => "package",
            })
            .collect()
    }
}

/// Parse the permission header of a script's source text.
pub fn parse_permission_header(content: &str) -> Capabilities {
    let mut capabilities = Capabilities::empty();
    let mut searching = true;

    for line in content.lines() {
        if line.contains(HEADER_CLOSE) {
            break;
        }

        if searching {
            if line.trim_end() == HEADER_OPEN {
                searching = false;
            }
            continue;
        }

        if let Some(flag) = parse_header_line(line) {
            capabilities |= flag;
        }
    }

    capabilities
}

/// Parse one line inside the header block.
fn parse_header_line(line: &str) -> Option<Capabilities> {
    let mut end = line.len().min(MAX_HEADER_LINE);
    while !line.is_char_boundary(end) {
        end -= 1;
    }

    let cleaned: String = line[..end]
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();

    let keyword = cleaned.trim_start_matches([' ', '\t']).strip_prefix('#')?;
    Capabilities::from_keyword(keyword.trim_end())
}
