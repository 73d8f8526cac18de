// Copyright 2024-2026 Commune Contributors
// SPDX-License-Identifier: Apache-2.0

//! History CLI subcommands: list and rm.
//!
//! Reads the history directory directly; the server does not need to be
//! running.

use crate::cli::{flag_value, has_flag, truncate};
use crate::history::{HistoryEntry, HistoryRecord, HistoryStore};

const DEFAULT_LIMIT: usize = 20;

/// Options of `history [--caller A] [--limit N] [--json]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOptions {
    pub caller: Option<String>,
    pub limit: usize,
    pub json: bool,
}

impl ListOptions {
    pub fn parse(args: &[String]) -> Result<Self, String> {
        let limit = match flag_value(args, "--limit") {
            Some(raw) => raw
                .parse()
                .map_err(|_| format!("invalid --limit value: {}", raw))?,
            None => DEFAULT_LIMIT,
        };
        Ok(Self {
            caller: flag_value(args, "--caller").map(str::to_string),
            limit,
            json: has_flag(args, "--json"),
        })
    }
}

/// What `history rm` deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgeTarget {
    Caller(String),
    Server,
    All,
}

impl PurgeTarget {
    pub fn parse(args: &[String]) -> Result<Self, String> {
        if let Some(caller) = flag_value(args, "--caller") {
            return Ok(Self::Caller(caller.to_string()));
        }
        if has_flag(args, "--all") {
            return Ok(Self::All);
        }
        if has_flag(args, "--server") {
            return Ok(Self::Server);
        }
        Err("history rm needs --caller ADDRESS, --server or --all".to_string())
    }
}

/// Run `history`. Returns 0 on success, 1 on read failure.
pub fn run_list(store: &HistoryStore, options: &ListOptions) -> i32 {
    let entries = match options.caller.as_deref() {
        Some(caller) => store.list(Some(caller)).map(|mut entries| {
            let skip = entries.len().saturating_sub(options.limit);
            entries.split_off(skip)
        }),
        None => store.recent(options.limit),
    };

    match entries {
        Ok(entries) if options.json => {
            let records: Vec<&HistoryRecord> = entries.iter().map(|e| &e.record).collect();
            match serde_json::to_string_pretty(&records) {
                Ok(text) => {
                    println!("{}", text);
                    0
                }
                Err(e) => {
                    eprintln!("Error encoding history: {}", e);
                    1
                }
            }
        }
        Ok(entries) => {
            print_entries(&entries, chrono::Utc::now().timestamp());
            0
        }
        Err(e) => {
            eprintln!("Error reading history at {}: {}", store.root().display(), e);
            1
        }
    }
}

/// Run `history rm`. Returns 0 on success, 1 on failure.
pub fn run_purge(store: &HistoryStore, target: &PurgeTarget) -> i32 {
    let removed = match target {
        PurgeTarget::Caller(caller) => store.purge_caller(caller),
        PurgeTarget::Server => store.purge_server(),
        PurgeTarget::All => HistoryStore::purge_all(store.root()),
    };
    match removed {
        Ok(n) => {
            println!("Removed {} record(s).", n);
            0
        }
        Err(e) => {
            eprintln!("Error purging history: {}", e);
            1
        }
    }
}

/// Print entries as a table, oldest first.
pub fn print_entries(entries: &[HistoryEntry], now: i64) {
    if entries.is_empty() {
        println!("No history recorded.");
        return;
    }

    println!(
        "{:>8} {:<18} {:<20} {:<8} {:>12}",
        "AGO (s)", "CALLER", "FN", "STATUS", "LATENCY (ms)"
    );
    println!("{}", "-".repeat(70));

    for entry in entries {
        let record = &entry.record;
        println!(
            "{:>8} {:<18} {:<20} {:<8} {:>12.1}",
            entry.seconds_ago(now),
            truncate(&record.address, 17),
            truncate(&record.function, 19),
            if record.success { "ok" } else { "failed" },
            record.latency * 1000.0,
        );
    }

    let failed = entries.iter().filter(|e| !e.record.success).count();
    println!("{}", "-".repeat(70));
    println!("{} call(s)  |  {} failed", entries.len(), failed);
}
