use alacena::config::{Config, ConfigError, LoggingConfig};
use alacena::utils::{format_bytes, format_duration};
use alacena::{CacheClient, ClientConfig, ProtocolKind, ServerSpec};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "alacena")]
#[command(about = "An asynchronous memcached client")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Alacena Team")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Server to use instead of a configuration file (repeatable)
    #[arg(short, long, global = true)]
    server: Vec<String>,

    /// Wire protocol when no configuration file is given
    #[arg(short, long, global = true, default_value = "text")]
    protocol: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a key
    Get { key: String },
    /// Store a key
    Set {
        key: String,
        value: String,
        /// Time to live in seconds
        #[arg(short, long)]
        ttl: Option<u64>,
    },
    /// Delete a key
    Delete { key: String },
    /// Show statistics of every server
    Stats,
    /// Generate example configuration file
    Config {
        /// Protocol for the example (text or binary)
        #[arg(long, default_value = "text")]
        example_protocol: String,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        path: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Config {
            example_protocol,
            output,
        } => return generate_config(example_protocol, output),
        Commands::Validate { path } => return validate_config(path),
        Commands::Version => {
            show_version();
            return Ok(());
        }
        _ => {}
    }

    let (client_config, logging) = load_client_config(&cli)?;
    init_logging(&logging)?;
    let client = CacheClient::new(client_config).context("Failed to build client")?;
    debug!("client ready: {:?}", client);

    match cli.command {
        Commands::Get { key } => match client.get(&key).await? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => {
                eprintln!("{}: not found", key);
                std::process::exit(1);
            }
        },
        Commands::Set { key, value, ttl } => {
            let stored = client
                .set(&key, value, ttl.map(Duration::from_secs))
                .await?;
            println!("{}", if stored { "STORED" } else { "NOT_STORED" });
        }
        Commands::Delete { key } => {
            let deleted = client.delete(&key).await?;
            println!("{}", if deleted { "DELETED" } else { "NOT_FOUND" });
        }
        Commands::Stats => show_stats(&client).await?,
        Commands::Config { .. } | Commands::Validate { .. } | Commands::Version => {}
    }

    client.close().await;
    Ok(())
}

fn load_client_config(cli: &Cli) -> anyhow::Result<(ClientConfig, LoggingConfig)> {
    if let Some(path) = &cli.config {
        let config = Config::load_from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?;
        let logging = config.logging.clone();
        return Ok((config.into_client_config()?, logging));
    }

    let protocol: ProtocolKind = match cli.protocol.parse() {
        Ok(protocol) => protocol,
        Err(e) => bail!(e),
    };
    let servers = if cli.server.is_empty() {
        vec![ServerSpec::new("127.0.0.1", alacena::core::DEFAULT_PORT)]
    } else {
        cli.server
            .iter()
            .map(|s| s.parse::<ServerSpec>())
            .collect::<Result<Vec<_>, _>>()?
    };
    let defaults = Config::default();
    let client_config = ClientConfig::new(servers, protocol)?
        .with_connect_timeout(Duration::from_secs(2))
        .with_operation_timeout(Duration::from_secs(2));
    Ok((client_config, defaults.logging))
}

async fn show_stats(client: &CacheClient) -> anyhow::Result<()> {
    let stats = client.stats().await?;
    let mut servers: Vec<_> = stats.iter().collect();
    servers.sort_by_key(|(server, _)| server.to_string());

    for (server, result) in servers {
        match result {
            Ok(values) => {
                println!("{}", server);
                if let Some(version) = values.get("version") {
                    println!("  version: {}", version);
                }
                if let Some(uptime) = values.get("uptime").and_then(|v| v.parse().ok()) {
                    println!("  uptime: {}", format_duration(Duration::from_secs(uptime)));
                }
                if let Some(bytes) = values.get("bytes").and_then(|v| v.parse().ok()) {
                    println!("  bytes: {}", format_bytes(bytes));
                }
                for name in ["curr_items", "curr_connections", "get_hits", "get_misses"] {
                    if let Some(value) = values.get(name) {
                        println!("  {}: {}", name, value);
                    }
                }
            }
            Err(e) => println!("{}\n  unavailable: {}", server, e),
        }
    }
    Ok(())
}

fn generate_config(protocol: &str, output: &Path) -> anyhow::Result<()> {
    println!("Generating {} configuration file: {:?}", protocol, output);

    Config::create_example_config(output, protocol).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  alacena --config {:?} stats", output);

    Ok(())
}

fn validate_config(config_path: &Path) -> anyhow::Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Protocol: {}", config.client.protocol);
            if let Some(namespace) = &config.client.namespace {
                println!("  Namespace: {}", namespace);
            }
            println!("  Servers: {} instances", config.servers.len());
            for (i, server) in config.servers.iter().enumerate() {
                println!("    {}: {} (weight {})", i + 1, server, server.weight());
            }
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn show_version() {
    println!("alacena v{}", env!("CARGO_PKG_VERSION"));
    println!("An asynchronous memcached client");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Text and binary memcached protocols");
    println!("  • Pipelined commands over one connection per server");
    println!("  • Per-server failure isolation for stats, version and flush_all");
    println!("  • Reconnect backoff for unreachable servers");
}

fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Invalid log level")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let result = match config.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    if let Err(e) = result {
        bail!("Failed to initialize logging: {}", e);
    }

    info!("Logging initialized at level: {}", config.level);
    Ok(())
}
