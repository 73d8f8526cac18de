//! commune-server entry point.
//!
//! ## CLI Subcommands
//!
//! - `commune-server` or `commune-server serve` - Serve the built-in module (default)
//! - `commune-server history` - List recorded calls
//! - `commune-server history rm` - Purge recorded calls
//! - `commune-server config` - Show or validate configuration
//! - `commune-server key` - Generate or show the server key

use std::process::ExitCode;

use commune_server::cli::history_cmd::{self, ListOptions, PurgeTarget};
use commune_server::cli::{config_cmd, has_flag, key_cmd};
use commune_server::config::{self, EnvConfig};
use commune_server::history::HistoryStore;
use commune_server::module::builtin::default_module;
use commune_server::shutdown::ShutdownResult;
use commune_server::telemetry::{init_logging, init_metrics};
use commune_server::Server;

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("serve");

    match command {
        "serve" | "" => {
            let Some(config) = load_config() else {
                return ExitCode::from(2u8);
            };
            serve(config).await
        }
        "history" => {
            let Some(config) = load_config() else {
                return ExitCode::from(2u8);
            };
            let store = HistoryStore::new(&config.history_path, &config.name);
            let rest = &args[2..];
            let code = if rest.first().map(|s| s.as_str()) == Some("rm") {
                match PurgeTarget::parse(&rest[1..]) {
                    Ok(target) => history_cmd::run_purge(&store, &target),
                    Err(e) => usage_error("history", &e),
                }
            } else {
                match ListOptions::parse(rest) {
                    Ok(options) => history_cmd::run_list(&store, &options),
                    Err(e) => usage_error("history", &e),
                }
            };
            ExitCode::from(code as u8)
        }
        "config" => {
            let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("show");
            match subcommand {
                "show" => ExitCode::from(config_cmd::run_show() as u8),
                "defaults" => {
                    config_cmd::run_defaults();
                    ExitCode::SUCCESS
                }
                "validate" => ExitCode::from(config_cmd::run_validate() as u8),
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_command_help("config");
                    ExitCode::FAILURE
                }
            }
        }
        "key" => {
            let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("new");
            match subcommand {
                "new" => {
                    key_cmd::run_new(has_flag(&args, "--json"));
                    ExitCode::SUCCESS
                }
                "show" => ExitCode::from(key_cmd::run_show() as u8),
                _ => {
                    eprintln!("Unknown key subcommand: {}", subcommand);
                    print_command_help("key");
                    ExitCode::FAILURE
                }
            }
        }
        "help" | "--help" | "-h" => {
            if let Some(subcommand) = args.get(2) {
                print_command_help(subcommand);
            } else {
                print_usage();
            }
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("commune-server {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn load_config() -> Option<EnvConfig> {
    match config::load() {
        Ok(config) => Some(config),
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            None
        }
    }
}

fn usage_error(command: &str, message: &str) -> i32 {
    eprintln!("{}", message);
    print_command_help(command);
    1
}

async fn serve(config: EnvConfig) -> ExitCode {
    if let Err(e) = init_logging(&config.log) {
        eprintln!("Logging setup failed: {}", e);
        return ExitCode::from(2u8);
    }
    init_metrics();

    for problem in config.validate() {
        tracing::warn!(%problem, "configuration warning");
    }

    let module = default_module(&config.name);
    let server = match Server::new(config, module) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::from(2u8);
        }
    };

    match server.run().await {
        Ok(ShutdownResult::Complete) => {
            eprintln!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Ok(ShutdownResult::Timeout { remaining }) => {
            eprintln!("Shutdown timeout, {} calls remaining", remaining);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Server error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "commune-server - signed function calls over HTTP v{}

USAGE:
    commune-server [COMMAND] [OPTIONS]

COMMANDS:
    serve        Serve the built-in module (default when no command given)
    history      List recorded calls, or purge them with `history rm`
    config       Manage configuration (show, defaults, validate)
    key          Generate or show the server key (new, show)
    version      Show version information
    help         Show this help message

EXAMPLES:
    commune-server                          # Serve (default)
    commune-server history --limit 5        # Five most recent calls
    commune-server history rm --caller KEY  # Purge one caller
    commune-server config validate          # Validate configuration
    commune-server key new                  # Print a fresh key seed

ENVIRONMENT:
    COMMUNE_CONFIG       Optional TOML config file
    COMMUNE_PORT         Bind port (default: 8888)
    COMMUNE_KEY_SEED     Hex seed of the server key (default: generated)
    RUST_LOG             Log level (debug, info, warn, error)

    Run `commune-server config defaults` for the full list.

EXIT CODES:
    0  Success
    1  Failure
    2  Configuration error
",
        version
    );
}

/// Print detailed help for a specific command.
fn print_command_help(command: &str) {
    match command {
        "serve" => {
            eprintln!(
                "commune-server serve - Serve the built-in module

USAGE:
    commune-server serve

DESCRIPTION:
    Binds COMMUNE_IP:COMMUNE_PORT and answers POST /{{fn}} calls until
    Ctrl+C, then drains in-flight calls and pending history writes.
"
            );
        }
        "history" => {
            eprintln!(
                "commune-server history - Recorded calls

USAGE:
    commune-server history [--caller ADDRESS] [--limit N] [--json]
    commune-server history rm (--caller ADDRESS | --server | --all)

DESCRIPTION:
    Lists calls recorded under COMMUNE_HISTORY_PATH/COMMUNE_NAME, oldest
    first (default limit: 20). `rm --all` removes every server's history.
"
            );
        }
        "config" => {
            eprintln!(
                "commune-server config - Configuration

USAGE:
    commune-server config [show|defaults|validate]

EXIT CODES:
    0  Valid
    1  Warnings found
    2  Config file unreadable or malformed
"
            );
        }
        "key" => {
            eprintln!(
                "commune-server key - Server key

USAGE:
    commune-server key new [--json]
    commune-server key show
"
            );
        }
        _ => {
            eprintln!("No help for '{}'.", command);
            print_usage();
        }
    }
}
