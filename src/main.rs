//! Backhaul - a reverse-tunneling load balancer

use std::path::PathBuf;

use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use backhaul::broker::Broker;
use backhaul::config::{BrokerConfig, DEFAULT_BIND_ADDRESS};
use backhaul::error::Result;

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    // Initialize logging
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    let config = match &args.config {
        Some(path) => BrokerConfig::load(path)?,
        None => BrokerConfig::default(),
    };

    info!("Backhaul v{} starting", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let listener = TcpListener::bind(&args.bind).await?;
        info!("accepting downstream connections on {}", args.bind);

        let broker = Broker::new(listener, config);
        if let Err(e) = broker.serve().await {
            error!("broker stopped: {}", e);
            return Err(e);
        }
        Ok(())
    })?;

    Ok(())
}

/// Command line arguments
struct Args {
    bind: String,
    config: Option<PathBuf>,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut bind = DEFAULT_BIND_ADDRESS.to_string();
        let mut config = None;
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--bind" => {
                    if i + 1 < args.len() {
                        bind = args[i + 1].clone();
                        i += 1;
                    }
                }
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                _ => {}
            }
            i += 1;
        }

        Self {
            bind,
            config,
            version,
        }
    }
}

fn print_help() {
    println!(
        r#"Backhaul - a reverse-tunneling load balancer

USAGE:
    backhaul [OPTIONS]

OPTIONS:
    --bind <HOST:PORT>      Address to accept downstream worker connections
                            (default: {DEFAULT_BIND_ADDRESS})
    -c, --config <FILE>     Path to JSON configuration file
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    backhaul
    backhaul --bind 0.0.0.0:9999
    backhaul --bind 127.0.0.1:9999 -c broker.json
"#
    );
}

fn print_version() {
    println!("Backhaul v{}", env!("CARGO_PKG_VERSION"));
    println!("A reverse-tunneling load balancer");
}
