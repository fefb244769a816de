//! objput - command-line object uploader
//!
//! Uploads, inspects, downloads and deletes objects using the same client
//! the library exposes. Logs go to stderr so `get` can stream to stdout.

use anyhow::Context;
use clap::{Parser, Subcommand};
use objput::{
    client::{ObjectClient, PutOptions},
    config::Config,
};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// objput - object-storage upload client
#[derive(Parser, Debug)]
#[command(name = "objput")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a local file, or stdin when LOCAL is `-`
    Put {
        local: String,
        remote: String,
        /// Explicit Content-Type
        #[arg(long)]
        content_type: Option<String>,
        /// Declared length for stdin uploads
        #[arg(long)]
        length: Option<u64>,
    },
    /// Download an object
    Get {
        remote: String,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print an object's metadata
    Head { remote: String },
    /// Delete an object
    Delete { remote: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!("Loaded configuration from {:?}", args.config);

    let client = ObjectClient::from_config(&config)?;

    match args.command {
        Command::Put {
            local,
            remote,
            content_type,
            length,
        } => {
            let mut options = PutOptions::new();
            options.content_type = content_type;
            options.content_length = length;

            let descriptor = if local == "-" {
                client.put_stream(&remote, tokio::io::stdin(), options).await?
            } else {
                client.put_file(&remote, &local, options).await?
            };
            println!("{}", serde_json::to_string_pretty(&descriptor)?);
        }
        Command::Get { remote, output } => {
            let content = client.get(&remote).await?;
            match output {
                Some(path) => tokio::fs::write(&path, &content.data)
                    .await
                    .with_context(|| format!("writing {}", path.display()))?,
                None => {
                    let mut stdout = tokio::io::stdout();
                    stdout.write_all(&content.data).await?;
                    stdout.flush().await?;
                }
            }
        }
        Command::Head { remote } => {
            let descriptor = client.head(&remote).await?;
            println!("{}", serde_json::to_string_pretty(&descriptor)?);
        }
        Command::Delete { remote } => {
            client.delete(&remote).await?;
        }
    }

    Ok(())
}
