// Copyright 2024-2026 Commune Contributors
// SPDX-License-Identifier: Apache-2.0

//! CLI subcommands that work without a running server.
//!
//! ## Usage
//!
//! ```bash
//! commune-server history              # Recent calls, newest last
//! commune-server history rm --all     # Purge every server's history
//! commune-server config validate      # Check configuration
//! commune-server key new              # Generate a server key seed
//! ```

pub mod config_cmd;
pub mod history_cmd;
pub mod key_cmd;

/// Value following `name` in `args`, if any.
pub fn flag_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

pub fn has_flag(args: &[String], name: &str) -> bool {
    args.iter().any(|a| a == name)
}

/// Truncate to at most `max` characters.
pub(crate) fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
