//! rivet - serve a directory of JavaScript route handlers
//!
//! Every request runs the matching route module's exported handler on a pooled
//! Boa engine. Pages without a script are rendered from their template.

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use miette::{IntoDiagnostic, Result};
use std::path::PathBuf;
use std::time::Duration;

use rivet::cli::{self, logging::LogFormat};
use rivet::server::{Server, ServerConfig};

#[derive(Parser)]
#[command(name = "rivet")]
#[command(author, version, about = "Serve JavaScript route handlers on pooled Boa engines")]
struct Cli {
    /// Default log filter when RIVET_LOG and RUST_LOG are unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server for a site directory
    Serve(ServeArgs),
    /// Run a script once with timers and promises
    Run {
        /// JavaScript file to run
        file: PathBuf,
        /// Give up on pending timers after this many milliseconds
        #[arg(long, default_value = "30000")]
        timeout_ms: u64,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// Site root containing the routes directory
    #[arg(default_value = ".")]
    root: PathBuf,
    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,
    /// Hostname to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Routes directory below the root
    #[arg(long, default_value = "routes")]
    routes_dir: String,
    /// Engines kept per pool
    #[arg(long, default_value = "3")]
    pool_size: usize,
    /// Request timeout in milliseconds
    #[arg(long, default_value = "10000")]
    timeout_ms: u64,
    /// Minimum wait for async responses after the handler returns
    #[arg(long, default_value = "5000")]
    grace_ms: u64,
    /// Give every request any idle engine instead of the client's own
    #[arg(long)]
    no_session_affinity: bool,
    /// Site version; engines are pooled per version
    #[arg(long, default_value = "dev")]
    version_tag: String,
}

impl ServeArgs {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            root: self.root,
            routes_dir: self.routes_dir,
            hostname: self.host,
            port: self.port,
            version: self.version_tag,
            pool_size: self.pool_size,
            request_timeout_ms: self.timeout_ms,
            async_grace_ms: self.grace_ms,
            session_affinity: !self.no_session_affinity,
            ..ServerConfig::default()
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    cli::logging::init(&cli.log_level, cli.log_format);

    match cli.command {
        Commands::Serve(args) => serve(args.into_config()),
        Commands::Run { file, timeout_ms } => run_file(&file, timeout_ms),
    }
}

/// Start HTTP server
fn serve(config: ServerConfig) -> Result<()> {
    println!(
        "{}: serving {} on http://{}:{}",
        "Info".cyan(),
        config.root.display(),
        config.hostname,
        config.port
    );

    let server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    };
    println!("  Routes: {}", server.routes().len());

    server.start().into_diagnostic()
}

/// Run a script to completion
fn run_file(path: &PathBuf, timeout_ms: u64) -> Result<()> {
    match cli::run_script(path, Duration::from_millis(timeout_ms)) {
        Ok(outcome) => {
            if let Some(exports) = outcome.exports {
                println!("{}", exports);
            }
            if !outcome.completed {
                eprintln!(
                    "{}: pending timers or promises after {} ms",
                    "Warning".yellow(),
                    timeout_ms
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }
}
