use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use localsock_core::SocketDefaults;

mod commands;

#[derive(Parser)]
#[command(name = "localsock")]
#[command(author, version, about = "Serve and inspect local Unix domain socket endpoints")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an echo server that logs each peer's credentials
    Serve {
        /// Socket path (filesystem path, or a name when --abstract is set)
        #[arg(short, long)]
        path: String,
        /// Endpoint title used in logs
        #[arg(short, long, default_value = "echo")]
        title: String,
        /// Bind in the abstract namespace instead of the filesystem
        #[arg(long = "abstract")]
        abstract_namespace: bool,
        /// Connection deadline in milliseconds (0 = none)
        #[arg(long)]
        deadline_ms: Option<u64>,
        /// Listen backlog
        #[arg(long)]
        backlog: Option<i32>,
    },
    /// Print the diagnostics for a run config without binding it
    Describe {
        #[arg(short, long)]
        path: String,
        #[arg(short, long, default_value = "echo")]
        title: String,
        #[arg(long = "abstract")]
        abstract_namespace: bool,
        /// Print markdown instead of a single log line
        #[arg(long)]
        markdown: bool,
    },
    /// Send a message to an endpoint and print the reply
    Send {
        #[arg(short, long)]
        path: String,
        #[arg(long = "abstract")]
        abstract_namespace: bool,
        /// Message to send
        message: String,
    },
}

/// Abstract names are given without the leading NUL on the command line
fn socket_path(path: String, abstract_namespace: bool) -> String {
    if abstract_namespace {
        format!("\0{}", path)
    } else {
        path
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();

    // Load configuration
    let defaults = SocketDefaults::load()?;

    match cli.command {
        Commands::Serve {
            path,
            title,
            abstract_namespace,
            deadline_ms,
            backlog,
        } => {
            let options = commands::serve::ServeOptions {
                title,
                path: socket_path(path, abstract_namespace),
                deadline_ms,
                backlog,
            };
            commands::serve::run(options, defaults).await
        }
        Commands::Describe {
            path,
            title,
            abstract_namespace,
            markdown,
        } => commands::describe::run(
            &title,
            &socket_path(path, abstract_namespace),
            markdown,
            defaults,
        ),
        Commands::Send {
            path,
            abstract_namespace,
            message,
        } => commands::send::run(&socket_path(path, abstract_namespace), &message).await,
    }
}
