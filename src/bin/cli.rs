//! Courier CLI
//!
//! Command-line interface for Courier operations:
//! - Register, poll and delete event queues
//! - Post notices
//! - Inspect snapshot files
//! - Check status

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use courier::events::persistence::decode_snapshot;
use serde_json::{json, Value};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "courier")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Real-time event delivery for chat clients")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// API server URL
    #[arg(long, default_value = "http://localhost:9993", global = true)]
    pub api_url: String,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show server status
    Status,

    /// Allocate an event queue
    Register {
        /// User the queue belongs to
        #[arg(short, long)]
        user: u64,
        /// Realm of the user
        #[arg(short, long, default_value = "0")]
        realm: u64,
        /// Event types to receive (default: all)
        #[arg(short, long)]
        event_types: Vec<String>,
        /// Receive every public stream message in the realm
        #[arg(long)]
        firehose: bool,
        /// Client name reported to the server
        #[arg(long, default_value = "courier-cli")]
        client_name: String,
        /// Requested idle timeout in seconds
        #[arg(long, default_value = "0")]
        lifespan: u64,
    },

    /// Poll a queue
    Poll {
        /// Queue id
        queue_id: String,
        /// User owning the queue
        #[arg(short, long)]
        user: u64,
        /// Highest event id already processed
        #[arg(short, long, default_value = "-1", allow_hyphen_values = true)]
        last_event_id: i64,
        /// Return immediately when nothing is queued
        #[arg(long)]
        dont_block: bool,
        /// Keep polling, acknowledging what was printed
        #[arg(long)]
        follow: bool,
    },

    /// Post a notice
    Notify {
        /// Event as JSON, e.g. '{"type": "typing", "op": "start"}'
        event: String,
        /// Recipient user ids (comma-separated or repeated)
        #[arg(short, long, required = true)]
        users: Vec<String>,
    },

    /// Delete a queue
    Drop {
        /// Queue id
        queue_id: String,
        /// User owning the queue
        #[arg(short, long)]
        user: u64,
    },

    /// Show the queues stored in a snapshot file
    Inspect {
        /// Path to the snapshot
        path: PathBuf,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Status => {
            let response = client.get(format!("{}/health", cli.api_url)).send().await;

            match response {
                Ok(resp) => {
                    let health: Value = resp.json().await?;
                    if cli.format == "json" {
                        println!("{}", serde_json::to_string_pretty(&health)?);
                        return Ok(());
                    }

                    println!("Courier v{}", env!("CARGO_PKG_VERSION"));
                    println!();
                    println!(
                        "API Status: {}",
                        health["status"].as_str().unwrap_or("unknown")
                    );

                    if let Some(queues) = health.get("queues") {
                        println!();
                        println!("Queues:");
                        for key in ["queues", "users", "connected", "firehose"] {
                            println!("  {:<10} {}", key, queues[key].as_u64().unwrap_or(0));
                        }
                    }

                    if let Some(uptime) = health["uptime_seconds"].as_u64() {
                        println!();
                        println!("Uptime: {}", format_duration(uptime));
                    }
                }
                Err(e) => {
                    eprintln!("Cannot connect to Courier API at {}", cli.api_url);
                    eprintln!("Error: {}", e);
                    eprintln!();
                    eprintln!("Make sure the Courier server is running:");
                    eprintln!("  cargo run --bin courier");
                    std::process::exit(1);
                }
            }
        }

        Commands::Register {
            user,
            realm,
            event_types,
            firehose,
            client_name,
            lifespan,
        } => {
            let event_types = split_list(&event_types);
            let body = json!({
                "event_types": (!event_types.is_empty()).then_some(event_types),
                "firehose": firehose,
                "client_name": client_name,
                "lifespan_secs": lifespan,
            });

            let request = client
                .post(format!("{}/api/v1/register", cli.api_url))
                .header("X-User-Id", user)
                .header("X-Realm-Id", realm)
                .json(&body);
            let registered = send(request).await?;

            if cli.format == "json" {
                println!("{}", serde_json::to_string_pretty(&registered)?);
            } else {
                println!(
                    "Registered queue {}",
                    registered["queue_id"].as_str().unwrap_or("?")
                );
            }
        }

        Commands::Poll {
            queue_id,
            user,
            mut last_event_id,
            dont_block,
            follow,
        } => loop {
            let request = client
                .get(format!("{}/api/v1/events", cli.api_url))
                .header("X-User-Id", user)
                .query(&[
                    ("queue_id", queue_id.clone()),
                    ("last_event_id", last_event_id.to_string()),
                    ("dont_block", dont_block.to_string()),
                    ("client_name", "courier-cli".to_string()),
                ]);
            let body = send(request).await?;
            let events = body["events"].as_array().cloned().unwrap_or_default();

            for event in &events {
                if cli.format == "json" {
                    println!("{}", event);
                } else {
                    print_event(event);
                }
                if let Some(id) = event["id"].as_i64() {
                    last_event_id = last_event_id.max(id);
                }
            }
            if events.is_empty() && cli.format != "json" {
                println!("No events");
            }

            if !follow {
                break;
            }
        },

        Commands::Notify { event, users } => {
            let event: Value = serde_json::from_str(&event).context("event is not valid JSON")?;
            let users = split_list(&users)
                .iter()
                .map(|u| u.parse::<u64>())
                .collect::<Result<Vec<_>, _>>()
                .context("user ids must be integers")?;

            let request = client
                .post(format!("{}/api/v1/notify", cli.api_url))
                .json(&json!({ "event": event, "users": users }));
            let stats = send(request).await?;

            if cli.format == "json" {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!(
                    "Delivered to {} of {} queues ({} filtered, {} suppressed)",
                    stats["delivered"], stats["matched"], stats["filtered"], stats["suppressed"]
                );
            }
        }

        Commands::Drop { queue_id, user } => {
            let request = client
                .delete(format!("{}/api/v1/events", cli.api_url))
                .header("X-User-Id", user)
                .query(&[("queue_id", &queue_id)]);
            send(request).await?;
            println!("Deleted queue {}", queue_id);
        }

        Commands::Inspect { path } => {
            let bytes = std::fs::read(&path).with_context(|| format!("reading {:?}", path))?;
            let descriptors = decode_snapshot(&bytes)?;

            if cli.format == "json" {
                println!("{}", serde_json::to_string_pretty(&descriptors)?);
                return Ok(());
            }

            println!(
                "{:<16} {:>8} {:>6} {:<16} {:>7} {:>8}  {}",
                "Queue", "User", "Realm", "Client", "Events", "Timeout", "Last activity"
            );
            for descriptor in &descriptors {
                println!(
                    "{:<16} {:>8} {:>6} {:<16} {:>7} {:>8}  {}",
                    descriptor.id(),
                    descriptor.user_id,
                    descriptor.realm_id,
                    descriptor.options.client_name,
                    descriptor.event_queue.len() + descriptor.event_queue.virtual_len(),
                    format_duration(descriptor.timeout_secs),
                    descriptor.last_activity.format("%Y-%m-%dT%H:%M:%SZ"),
                );
            }
            println!();
            println!("{} queues", descriptors.len());
        }

        Commands::Config { output } => {
            let config = courier::config::generate_default_config();

            match output {
                Some(path) => {
                    // Create parent directory if needed
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, &config)?;
                    println!("Config written to {:?}", path);
                }
                None => {
                    print!("{}", config);
                }
            }
        }
    }

    Ok(())
}

/// Send a request and decode the JSON body, turning API errors into messages
async fn send(request: reqwest::RequestBuilder) -> anyhow::Result<Value> {
    let response = request.send().await.context("cannot reach Courier API")?;
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);

    if !status.is_success() {
        let message = body["error"]["message"].as_str().unwrap_or("no details");
        bail!("request failed ({}): {}", status, message);
    }
    Ok(body)
}

fn split_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .flat_map(|v| v.split(',').map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty())
        .collect()
}

fn print_event(event: &Value) {
    let id = event["id"].as_i64().unwrap_or(-1);
    let kind = event["type"].as_str().unwrap_or("?");
    let mut rest = event.clone();
    if let Some(fields) = rest.as_object_mut() {
        fields.remove("id");
        fields.remove("type");
    }
    println!("{:>6}  {:<16} {}", id, kind, rest);
}

fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else if seconds < 86400 {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    } else {
        format!("{}d {}h", seconds / 86400, (seconds % 86400) / 3600)
    }
}
