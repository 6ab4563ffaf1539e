//! CLI argument parsing and config file loading.
//!
//! The daemon reads a JSON config file (the [`AppConfig`] schema,
//! unknown keys rejected) and applies CLI overrides on top.

use std::path::{Path, PathBuf};

use diiisco_types::config::AppConfig;
use diiisco_types::{DiiiscoError, Result};

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// Parsed command-line arguments.
pub struct CliArgs {
    pub config_path: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub listen_port: Option<u16>,
    pub api_port: Option<u16>,
    pub bootstrap: Vec<String>,
    pub provider: bool,
    pub mnemonic: Option<String>,
}

impl CliArgs {
    /// Parses CLI arguments from `std::env::args`.
    pub fn parse_from_env() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut cli = Self {
            config_path: None,
            data_dir: None,
            listen_port: None,
            api_port: None,
            bootstrap: Vec::new(),
            provider: false,
            mnemonic: None,
        };

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--config" => {
                    i += 1;
                    cli.config_path = args.get(i).map(PathBuf::from);
                }
                "--data-dir" => {
                    i += 1;
                    cli.data_dir = args.get(i).map(PathBuf::from);
                }
                "--port" => {
                    i += 1;
                    cli.listen_port = args.get(i).and_then(|s| s.parse().ok());
                }
                "--api-port" => {
                    i += 1;
                    cli.api_port = args.get(i).and_then(|s| s.parse().ok());
                }
                "--bootstrap" => {
                    i += 1;
                    if let Some(addr) = args.get(i) {
                        cli.bootstrap.push(addr.clone());
                    }
                }
                "--provider" => {
                    cli.provider = true;
                }
                "--mnemonic" => {
                    i += 1;
                    cli.mnemonic = args.get(i).cloned();
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                other => {
                    eprintln!("unknown argument: {other}");
                    eprintln!("use --help for usage information");
                    std::process::exit(1);
                }
            }
            i += 1;
        }

        cli
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Loads the config file (when given) and applies CLI overrides.
///
/// The wallet phrase resolves in priority order: `--mnemonic`, the
/// `DIIISCO_MNEMONIC` environment variable, then the config file.
pub fn resolve_config(cli: &CliArgs) -> Result<AppConfig> {
    let mut config = match &cli.config_path {
        Some(path) => load_file(path)?,
        None => AppConfig::default(),
    };

    if let Some(port) = cli.listen_port {
        config.node.port = port;
    }
    if let Some(port) = cli.api_port {
        config.api.port = port;
    }
    if !cli.bootstrap.is_empty() {
        config
            .libp2p_bootstrap_servers
            .extend(cli.bootstrap.iter().cloned());
    }
    if cli.provider {
        config.models.enabled = true;
    }
    if let Some(mnemonic) = &cli.mnemonic {
        config.algorand.mnemonic = Some(mnemonic.clone());
    } else if config.algorand.mnemonic.is_none() {
        if let Ok(mnemonic) = std::env::var("DIIISCO_MNEMONIC") {
            config.algorand.mnemonic = Some(mnemonic);
        }
    }

    config.validate()?;
    Ok(config)
}

fn load_file(path: &Path) -> Result<AppConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| DiiiscoError::ConfigError {
        reason: format!("failed to read config file {}: {e}", path.display()),
    })?;
    serde_json::from_str(&text).map_err(|e| DiiiscoError::ConfigError {
        reason: format!("invalid config JSON in {}: {e}", path.display()),
    })
}

/// Platform default data directory (`~/.diiisco`).
pub fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".diiisco"),
        None => PathBuf::from("diiisco-data"),
    }
}

fn print_help() {
    println!(
        r#"diiisco-daemon - peer-to-peer inference marketplace node

USAGE:
    diiisco-daemon [OPTIONS]

OPTIONS:
    --config <PATH>       Load settings from a JSON config file
    --data-dir <PATH>     Data directory (default: ~/.diiisco)
    --port <PORT>         libp2p listen port (default: 8777)
    --api-port <PORT>     HTTP facade port (default: 8080)
    --bootstrap <ADDR>    Bootstrap multiaddr or registry alias (repeatable)
    --provider            Serve models (provider mode)
    --mnemonic <PHRASE>   Wallet secret phrase (or set DIIISCO_MNEMONIC)
    -h, --help            Show this help

EXAMPLES:
    # Customer node against a local mesh
    diiisco-daemon --bootstrap /ip4/1.2.3.4/tcp/8777/p2p/12D3KooW...

    # Provider node with a local Ollama runtime
    diiisco-daemon --provider --config provider.json

ENVIRONMENT:
    DIIISCO_MNEMONIC     Wallet secret phrase
    RUST_LOG             Log level filter (default: info)
"#
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
