// Copyright 2024-2026 Commune Contributors
// SPDX-License-Identifier: Apache-2.0

//! Key CLI subcommands: new, show.

use serde_json::json;

use crate::config;
use crate::identity::Keypair;

/// Generate a fresh server key and print its seed and address.
pub fn run_new(json_output: bool) {
    print_key(&Keypair::generate(), json_output);
}

/// Print the address of the configured server key.
///
/// Returns 0 on success, 1 when no seed is configured, 2 on config error.
pub fn run_show() -> i32 {
    let env = match config::load() {
        Ok(env) => env,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 2;
        }
    };
    if env.key_seed.is_none() {
        eprintln!("COMMUNE_KEY_SEED is not set; the server generates a key at startup.");
        return 1;
    }
    match env.keypair() {
        Ok(keypair) => {
            println!("{}", keypair.address());
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            2
        }
    }
}

fn print_key(keypair: &Keypair, json_output: bool) {
    if json_output {
        println!(
            "{}",
            json!({"seed": keypair.seed_hex(), "address": keypair.address()})
        );
    } else {
        println!("COMMUNE_KEY_SEED={}", keypair.seed_hex());
        println!("# address: {}", keypair.address());
    }
}
