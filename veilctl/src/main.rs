//! VeilLink operator CLI.
//!
//! Inspects and edits the client's local state: configuration and the
//! pinned-server trust store. Connection control lives in the client
//! app; this tool is for operators and debugging.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use veil_common::config::{default_config_path, ClientConfig};
use veil_common::crypto::{AesGcmCipher, KEY_SIZE};
use veil_common::logging::{init_logging, LogOptions};
use veil_trust::CertificateTrustStore;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogLevelArg {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevelArg> for tracing::Level {
    fn from(level: LogLevelArg) -> Self {
        match level {
            LogLevelArg::Trace => tracing::Level::TRACE,
            LogLevelArg::Debug => tracing::Level::DEBUG,
            LogLevelArg::Info => tracing::Level::INFO,
            LogLevelArg::Warn => tracing::Level::WARN,
            LogLevelArg::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    long_about = None,
    after_help = "Examples:\n  veilctl config show\n  veilctl trust keygen --key-file ~/.veillink.key\n  veilctl trust list --key-file ~/.veillink.key --output json\n  veilctl trust remove gw-1.example.net --key-file ~/.veillink.key"
)]
struct Args {
    /// Log level
    #[arg(short, long, value_enum, default_value = "warn")]
    log_level: LogLevelArg,

    /// Path to the client config file (defaults to the platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output format for command results (table|json)
    #[arg(long, value_enum, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inspect or initialize the client configuration
    Config {
        #[command(subcommand)]
        action: ConfigCmd,
    },
    /// Manage the pinned-server trust store
    Trust {
        #[command(subcommand)]
        action: TrustCmd,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCmd {
    /// Print the effective configuration
    Show,
    /// Print the config file path in use
    Path,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum TrustCmd {
    /// Generate a fresh store key file
    Keygen {
        #[arg(long)]
        key_file: PathBuf,
        /// Overwrite an existing key file
        #[arg(long)]
        force: bool,
    },
    /// List pinned servers
    List {
        #[arg(long)]
        key_file: PathBuf,
    },
    /// Remove the pin for a hostname
    Remove {
        hostname: String,
        #[arg(long)]
        key_file: PathBuf,
    },
    /// Delete the entire trust store file (explicit recovery for a
    /// corrupt store)
    Reset {
        /// Required: confirms the deletion
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let _guard = init_logging(LogOptions {
        level: args.log_level.into(),
        ..Default::default()
    });

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    // A missing file means defaults; a present-but-broken file is an error
    // (except for `config init`, which is how you get a fresh one).
    let config = if config_path.exists() && !matches!(args.command, Command::Config { action: ConfigCmd::Init { .. } }) {
        ClientConfig::load(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        ClientConfig::default()
    };

    match args.command {
        Command::Config { action } => run_config(action, &config, &config_path, args.output),
        Command::Trust { action } => run_trust(action, &config, args.output),
    }
}

fn run_config(
    action: ConfigCmd,
    config: &ClientConfig,
    config_path: &PathBuf,
    output: OutputFormat,
) -> Result<()> {
    match action {
        ConfigCmd::Show => {
            match output {
                OutputFormat::Table => println!("{}", config.to_toml()?),
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(config)?)
                }
            }
            Ok(())
        }
        ConfigCmd::Path => {
            println!("{}", config_path.display());
            Ok(())
        }
        ConfigCmd::Init { force } => {
            if config_path.exists() && !force {
                bail!(
                    "config file already exists at {} (use --force to overwrite)",
                    config_path.display()
                );
            }
            if let Some(parent) = config_path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            fs::write(config_path, ClientConfig::default().to_toml()?)
                .with_context(|| format!("writing {}", config_path.display()))?;
            info!(path = %config_path.display(), "Wrote default config");
            println!("wrote {}", config_path.display());
            Ok(())
        }
    }
}

fn run_trust(action: TrustCmd, config: &ClientConfig, output: OutputFormat) -> Result<()> {
    let store_path = config.trust.resolved_store_path();

    match action {
        TrustCmd::Keygen { key_file, force } => {
            if key_file.exists() && !force {
                bail!(
                    "key file already exists at {} (use --force to overwrite)",
                    key_file.display()
                );
            }
            let key = AesGcmCipher::generate_key();
            fs::write(&key_file, key)
                .with_context(|| format!("writing {}", key_file.display()))?;
            println!("wrote {}", key_file.display());
            Ok(())
        }
        TrustCmd::List { key_file } => {
            let store = open_store(&store_path, &key_file)?;
            let entries = store.entries();
            match output {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&entries)?)
                }
                OutputFormat::Table => {
                    if entries.is_empty() {
                        println!("no pinned servers");
                    }
                    for entry in entries {
                        println!(
                            "{}\t{}\tfirst_seen={}ms\tlast_verified={}ms",
                            entry.hostname, entry.pin, entry.first_seen_at, entry.last_verified_at
                        );
                    }
                }
            }
            Ok(())
        }
        TrustCmd::Remove { hostname, key_file } => {
            let store = open_store(&store_path, &key_file)?;
            if store.remove_trust(&hostname)? {
                println!("removed pin for {}", hostname);
            } else {
                println!("no pin stored for {}", hostname);
            }
            Ok(())
        }
        TrustCmd::Reset { yes } => {
            if !yes {
                bail!("refusing to delete {} without --yes", store_path.display());
            }
            if store_path.exists() {
                fs::remove_file(&store_path)
                    .with_context(|| format!("removing {}", store_path.display()))?;
                println!("removed {}", store_path.display());
            } else {
                println!("no trust store at {}", store_path.display());
            }
            Ok(())
        }
    }
}

fn open_store(store_path: &PathBuf, key_file: &PathBuf) -> Result<CertificateTrustStore> {
    let key = fs::read(key_file)
        .with_context(|| format!("reading key file {}", key_file.display()))?;
    if key.len() != KEY_SIZE {
        bail!(
            "key file {} must contain exactly {} raw bytes",
            key_file.display(),
            KEY_SIZE
        );
    }
    CertificateTrustStore::open(store_path, &key)
        .with_context(|| format!("opening trust store {}", store_path.display()))
}
