//! `lfs-server`: Git LFS server.
//!
//! ```text
//! lfs-server serve -c lfs.toml                     # HTTP API
//! lfs-server serve -l 0.0.0.0:8080                 # override listen address
//! lfs-server transfer alice/assets upload --user alice
//! ```
//!
//! `transfer` speaks the `git-lfs-transfer` protocol on stdin/stdout and is
//! meant to be invoked by an SSH forced command.

use std::io::{self, BufWriter};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use lfs_server::batch::Operation;
use lfs_server::config::Config;
use lfs_server::repo::AccessControl;
use lfs_server::server::{LfsServer, LfsServerConfig};
use lfs_server::service::Credentials;
use lfs_server::telemetry::{self, LogTarget};
use lfs_server::token::Scope;
use lfs_server::transfer::Session;

#[derive(Parser)]
#[command(name = "lfs-server", version, about = "Git LFS server")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true, env = "LFS_SERVER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API.
    Serve {
        /// Override the listen address (e.g. "0.0.0.0:8080").
        #[arg(short = 'l', long)]
        listen_addr: Option<String>,
    },

    /// Run one git-lfs-transfer session on stdin/stdout.
    Transfer {
        /// Repository as `owner/name`.
        repo: String,

        operation: OperationArg,

        /// Authenticated user; anonymous when absent.
        #[arg(long, env = "LFS_USER")]
        user: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OperationArg {
    Upload,
    Download,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load config")?;

    match cli.command {
        Commands::Serve { listen_addr } => {
            telemetry::init(&config.log.level, LogTarget::Stdout);
            let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
            runtime.block_on(serve(config, listen_addr))
        }
        Commands::Transfer {
            repo,
            operation,
            user,
        } => {
            telemetry::init(&config.log.level, LogTarget::Stderr);
            transfer(config, &repo, operation, user.as_deref())
        }
    }
}

async fn serve(config: Config, listen_addr: Option<String>) -> Result<()> {
    let addr = listen_addr.unwrap_or_else(|| config.server.listen_addr.clone());
    let components = config.build().context("invalid configuration")?;

    let server = LfsServer::new(LfsServerConfig {
        service: components.service,
        artifacts: components.artifacts,
        artifacts_serve_direct: config.artifacts.serve_direct,
    });
    server
        .serve_with_shutdown(&addr, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutting down");
        })
        .await
        .with_context(|| format!("failed to serve on {addr}"))
}

fn transfer(config: Config, repo: &str, operation: OperationArg, user: Option<&str>) -> Result<()> {
    let (owner, name) = repo
        .trim_matches('/')
        .split_once('/')
        .context("repository must be given as owner/name")?;
    let components = config.build().context("invalid configuration")?;

    let credentials = match user {
        Some(user) => Credentials::Principal(
            components
                .directory
                .principal_by_name(user)
                .with_context(|| format!("unknown user {user:?}"))?,
        ),
        None => Credentials::Anonymous,
    };
    let (operation, scope) = match operation {
        OperationArg::Upload => (Operation::Upload, Scope::Upload),
        OperationArg::Download => (Operation::Download, Scope::Download),
    };
    let access = components
        .service
        .authorize(owner, name, &credentials, scope)
        .with_context(|| format!("access to {owner}/{name} denied"))?;

    let stdin = io::stdin().lock();
    let stdout = BufWriter::new(io::stdout().lock());
    Session::new(&components.service, access, operation, stdin, stdout)
        .run()
        .context("transfer session failed")
}
