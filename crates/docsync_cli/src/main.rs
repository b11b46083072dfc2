//! docsync CLI
//!
//! Offline inspection of a docsync `FileStore` directory.
//!
//! # Commands
//!
//! - `namespaces` - List synchronized namespaces with document counts
//! - `documents` - List synchronized documents and their sync flags
//! - `undo` - Dump undo records left by interrupted writes
//! - `show` - Show one document with its sync state

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// docsync store inspection tools.
#[derive(Parser)]
#[command(name = "docsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Instance key the engine was configured with
    #[arg(global = true, short, long, default_value = "default")]
    instance: String,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List synchronized namespaces
    Namespaces {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List synchronized documents of a namespace
    Documents {
        /// Namespace as database.collection
        namespace: String,

        /// Only documents with a pending local write
        #[arg(long)]
        pending: bool,

        /// Only paused documents
        #[arg(long)]
        paused: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump undo records of a namespace
    Undo {
        /// Namespace as database.collection
        namespace: String,
    },

    /// Show a document and its sync state
    Show {
        /// Namespace as database.collection
        namespace: String,

        /// Document id, as JSON or a bare string
        id: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Namespaces { format } => {
            let path = cli.path.ok_or("Store path required for namespaces")?;
            commands::namespaces::run(&path, &cli.instance, &format)?;
        }
        Commands::Documents {
            namespace,
            pending,
            paused,
            format,
        } => {
            let path = cli.path.ok_or("Store path required for documents")?;
            let namespace = commands::parse_namespace(&namespace)?;
            let only = commands::documents::Only { pending, paused };
            commands::documents::run(&path, &cli.instance, &namespace, only, &format)?;
        }
        Commands::Undo { namespace } => {
            let path = cli.path.ok_or("Store path required for undo")?;
            let namespace = commands::parse_namespace(&namespace)?;
            commands::undo::run(&path, &namespace)?;
        }
        Commands::Show { namespace, id, format } => {
            let path = cli.path.ok_or("Store path required for show")?;
            let namespace = commands::parse_namespace(&namespace)?;
            let id = commands::parse_id(&id);
            commands::show::run(&path, &cli.instance, &namespace, &id, &format)?;
        }
        Commands::Version => {
            println!("docsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("sync protocol v{}", docsync_protocol::SYNC_PROTOCOL_VERSION);
        }
    }

    Ok(())
}
