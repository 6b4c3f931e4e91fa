//! Atrium: a memcached-compatible binary-protocol front-end server.
//!
//! This is the main entry point for the server binary.

use atrium::{Server, Settings, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let cli = parse_args(&args)?;

    if cli.help {
        print_help();
        return Ok(());
    }
    if cli.version {
        println!("atrium-server version {VERSION}");
        return Ok(());
    }

    // Load configuration
    let mut settings = if let Some(ref config_path) = cli.config {
        match Settings::load_from_file(config_path) {
            Ok(settings) => {
                eprintln!("Loaded configuration from: {}", config_path.display());
                settings
            }
            Err(e) => {
                eprintln!("Error loading config file: {e}");
                std::process::exit(1);
            }
        }
    } else {
        Settings::default()
    };

    // Override with CLI arguments
    if let Some(port) = cli.port {
        settings.port = port;
    }
    if let Some(bind) = cli.bind {
        settings.bind = bind;
    }
    if let Some(threads) = cli.threads {
        settings.worker_threads = threads;
    }
    if let Some(users_file) = cli.users_file {
        settings.users_file = Some(users_file);
    }
    if let Some(verbosity) = cli.verbosity {
        settings.verbosity = verbosity;
    }

    // Initialize logging
    let log_level = match settings.verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    fmt().with_env_filter(filter).init();

    info!("atrium-server {VERSION} starting");

    let server = Arc::new(Server::new(settings.clone())?);
    if let Some(ref bucket) = settings.default_bucket {
        server.register_memory_bucket(bucket);
    }

    server.run().await?;
    Ok(())
}

#[derive(Default)]
struct CliArgs {
    help: bool,
    version: bool,
    config: Option<PathBuf>,
    port: Option<u16>,
    bind: Option<String>,
    threads: Option<usize>,
    users_file: Option<PathBuf>,
    verbosity: Option<u32>,
}

fn parse_args(args: &[String]) -> anyhow::Result<CliArgs> {
    let mut cli = CliArgs::default();
    let mut iter = args.iter().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => cli.help = true,
            "-V" | "--version" => cli.version = true,
            "-c" | "--config" => {
                cli.config = Some(PathBuf::from(next_value(&mut iter, arg)?));
            }
            "-p" | "--port" => {
                cli.port = Some(next_value(&mut iter, arg)?.parse()?);
            }
            "-b" | "--bind" => {
                cli.bind = Some(next_value(&mut iter, arg)?);
            }
            "-t" | "--threads" => {
                cli.threads = Some(next_value(&mut iter, arg)?.parse()?);
            }
            "-u" | "--users" => {
                cli.users_file = Some(PathBuf::from(next_value(&mut iter, arg)?));
            }
            "-v" => {
                cli.verbosity = Some(cli.verbosity.unwrap_or(0) + 1);
            }
            other => {
                anyhow::bail!("unknown argument: {other}");
            }
        }
    }
    Ok(cli)
}

fn next_value<'a>(
    iter: &mut impl Iterator<Item = &'a String>,
    flag: &str,
) -> anyhow::Result<String> {
    iter.next()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("missing value for {flag}"))
}

fn print_help() {
    println!(
        "atrium-server {VERSION}
A memcached-compatible binary-protocol front-end server

USAGE:
    atrium-server [OPTIONS]

OPTIONS:
    -c, --config <FILE>    Load settings from a JSON file
    -p, --port <PORT>      Client port (default: 11210)
    -b, --bind <ADDR>      Bind address (default: 127.0.0.1)
    -t, --threads <N>      Worker reactor threads (default: 4)
    -u, --users <FILE>     User database (JSON)
    -v                     Increase verbosity (repeatable)
    -h, --help             Print help
    -V, --version          Print version"
    );
}
