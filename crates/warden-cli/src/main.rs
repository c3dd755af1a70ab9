use anyhow::{bail, Context, Result};
use base64::prelude::*;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "warden", about = "Warden face recognition CLI")]
struct Cli {
    /// Base URL of the wardend HTTP surface.
    #[arg(long, default_value = "http://127.0.0.1:8787")]
    daemon_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new identity from a single-face image
    Register {
        /// Library (named group) the identity belongs to
        #[arg(short, long)]
        library: String,
        /// Display name of the person
        #[arg(short, long)]
        name: String,
        /// Path to the source image
        image: PathBuf,
    },
    /// List registered identities
    List,
    /// Show recent access log entries
    Logs {
        /// Maximum number of entries
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Register { library, name, image } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("reading {}", image.display()))?;
            let body = serde_json::json!({
                "library": library,
                "name": name,
                "image": BASE64_STANDARD.encode(bytes),
            });

            let resp = client
                .post(format!("{}/api/identities", cli.daemon_url))
                .json(&body)
                .send()
                .await
                .context("contacting wardend")?;

            if !resp.status().is_success() {
                let status = resp.status();
                let detail = resp.text().await.unwrap_or_default();
                bail!("registration failed ({status}): {detail}");
            }

            let created: serde_json::Value = resp.json().await?;
            println!(
                "Registered {name} in library {library} (id: {})",
                created["id"].as_str().unwrap_or("?")
            );
            println!("Embedding computation runs in the background; the identity activates once it completes.");
        }

        Commands::List => {
            let identities: Vec<serde_json::Value> = client
                .get(format!("{}/api/identities", cli.daemon_url))
                .send()
                .await
                .context("contacting wardend")?
                .error_for_status()?
                .json()
                .await?;

            if identities.is_empty() {
                println!("No identities registered");
            }
            for identity in identities {
                println!(
                    "{}  {:24}  library={}  active={}",
                    identity["id"].as_str().unwrap_or("?"),
                    identity["name"].as_str().unwrap_or("?"),
                    identity["library"].as_str().unwrap_or("?"),
                    identity["active"].as_bool().unwrap_or(false),
                );
            }
        }

        Commands::Logs { limit } => {
            let logs: Vec<serde_json::Value> = client
                .get(format!("{}/api/logs?limit={limit}", cli.daemon_url))
                .send()
                .await
                .context("contacting wardend")?
                .error_for_status()?
                .json()
                .await?;

            if logs.is_empty() {
                println!("Access log is empty");
            }
            for log in logs {
                println!(
                    "{}  matched={:5}  {}",
                    log["timestamp"].as_str().unwrap_or("?"),
                    log["matched"].as_bool().unwrap_or(false),
                    log["message"].as_str().unwrap_or(""),
                );
            }
        }

        Commands::Status => {
            let status: serde_json::Value = client
                .get(format!("{}/api/status", cli.daemon_url))
                .send()
                .await
                .context("contacting wardend")?
                .error_for_status()?
                .json()
                .await?;
            println!("wardend {}", status["version"].as_str().unwrap_or("?"));
            println!("known faces: {}", status["known_faces"]);
            println!("similarity threshold: {}", status["similarity_threshold"]);
        }
    }

    Ok(())
}
