// Copyright 2024-2026 Commune Contributors
// SPDX-License-Identifier: Apache-2.0

//! Config CLI subcommands: show, defaults, validate.
//!
//! These read configuration from the environment and the optional config
//! file; no running server is needed.

use crate::config::{self, EffectiveConfig, EnvConfig};

/// Print effective config as `VAR=value` lines to stdout.
///
/// Returns 0, or 2 when the config file cannot be loaded.
pub fn run_show() -> i32 {
    match config::load() {
        Ok(env) => {
            print_config(&env.effective_config());
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            2
        }
    }
}

/// Print default config values (no env or file overrides) to stdout.
pub fn run_defaults() {
    print_config(&EnvConfig::default().effective_config());
}

/// Validate configuration for obvious misconfigurations.
///
/// Returns 0 if valid, 1 if any warnings are found, 2 if the config file
/// cannot be loaded.
pub fn run_validate() -> i32 {
    match config::load() {
        Ok(env) => report(&env),
        Err(e) => {
            eprintln!("Error: {}", e);
            2
        }
    }
}

fn report(env: &EnvConfig) -> i32 {
    let problems = env.validate();
    if problems.is_empty() {
        println!("Configuration is valid.");
        return 0;
    }
    for problem in &problems {
        eprintln!("WARNING: {}", problem);
    }
    1
}

fn print_config(cfg: &EffectiveConfig) {
    for line in cfg.to_env_lines() {
        println!("{}", line);
    }
}
