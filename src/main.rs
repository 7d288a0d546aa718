//! Shortlink command-line client

use clap::{Parser, Subcommand};
use shortlink_relay::{
    Config, ConnectionReport, FileSettingsStore, HandoffStore, HttpRelay, InstrumentedRelay,
    QueryKind, RelayError, Result, ServerKey, Settings, ShortenerClient, StatsReport, spawn_relay,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "shortlink", version, about = "Shorten links through a self-hosted YOURLS server")]
struct Cli {
    /// Settings file (overrides SHORTLINK_SETTINGS_PATH)
    #[arg(long, global = true)]
    settings_file: Option<PathBuf>,

    /// Handoff file (overrides SHORTLINK_HANDOFF_PATH)
    #[arg(long, global = true)]
    handoff_file: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "SHORTLINK_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Shorten a URL (defaults to a stashed handoff link)
    Shorten {
        url: Option<String>,
        #[arg(short, long)]
        keyword: Option<String>,
        #[arg(short, long, default_value = "primary")]
        server: ServerKey,
    },
    /// Show dashboard totals or top-link analytics
    Stats {
        #[arg(long)]
        analytics: bool,
        /// Ignore cached data
        #[arg(long)]
        refresh: bool,
        #[arg(short, long, default_value = "primary")]
        server: ServerKey,
    },
    /// Test a server URL and signature (defaults to the saved primary)
    Test {
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        credential: Option<String>,
    },
    /// Inspect or change persisted settings
    Settings {
        #[command(subcommand)]
        action: SettingsCommand,
    },
    /// Stash a link or selection for the next `shorten`
    Handoff {
        #[command(subcommand)]
        action: HandoffCommand,
    },
}

#[derive(Debug, Subcommand)]
enum SettingsCommand {
    /// Print settings with credentials masked
    Show,
    /// Set one or more values, e.g. `serverUrl=https://sho.rt credential=abc`
    Set {
        #[arg(required = true)]
        assignments: Vec<String>,
    },
    /// List the servers currently selectable
    Servers,
    /// Print the admin URL of a server
    Admin {
        #[arg(short, long, default_value = "primary")]
        server: ServerKey,
    },
}

#[derive(Debug, Subcommand)]
enum HandoffCommand {
    /// Stash a link, optionally with selected text to use as its keyword
    Link {
        url: String,
        #[arg(long)]
        selection: Option<String>,
    },
    /// Stash selected text to use as the keyword
    Selection { text: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    initialize_tracing(cli.json);

    let mut config = Config::from_env();
    if let Some(path) = cli.settings_file.clone() {
        config.settings_path = path;
    }
    if let Some(path) = cli.handoff_file.clone() {
        config.handoff_path = path;
    }

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(cli.command, config).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(command: Command, config: Config) -> Result<()> {
    let handoff = HandoffStore::new(config.handoff_path.clone());
    let store = Arc::new(FileSettingsStore::new(config.settings_path.clone()));

    let relay = Arc::new(InstrumentedRelay::new(HttpRelay::new()?));
    let (handle, worker) = spawn_relay(relay.clone(), config.relay_queue_depth);
    let client = ShortenerClient::new(config, store, Arc::new(handle));

    let outcome = match command {
        Command::Shorten {
            url,
            keyword,
            server,
        } => shorten(&client, &handoff, url, keyword, server).await,
        Command::Stats {
            analytics,
            refresh,
            server,
        } => {
            let kind = if analytics {
                QueryKind::Analytics
            } else {
                QueryKind::Dashboard
            };
            client
                .statistics(server, kind, refresh)
                .await
                .map(|report| print_stats(&report))
        }
        Command::Test { url, credential } => test_connection(&client, url, credential).await,
        Command::Settings { action } => settings(&client, action).await,
        Command::Handoff { action } => match action {
            HandoffCommand::Link { url, selection } => {
                handoff.stash_link(&url, selection.as_deref()).await
            }
            HandoffCommand::Selection { text } => handoff.stash_selection(&text).await,
        },
    };

    // Dropping the client closes the bridge so the worker can finish.
    drop(client);
    let _ = worker.await;

    let metrics = relay.metrics().await;
    if metrics.attempts > 0 {
        info!(
            "Relay metrics - {} attempts, {:.1}% success rate, avg {}ms",
            metrics.attempts, metrics.success_rate, metrics.avg_duration_ms
        );
    }

    outcome
}

async fn shorten(
    client: &ShortenerClient,
    handoff: &HandoffStore,
    url: Option<String>,
    keyword: Option<String>,
    server: ServerKey,
) -> Result<()> {
    let stashed = handoff.take().await?;

    let url = url.or(stashed.context_menu_url).ok_or_else(|| {
        RelayError::InvalidInput("no URL given and no handoff link stashed".to_string())
    })?;

    let mut keyword = keyword.or(stashed.selected_text);
    if keyword.is_none() && client.load_settings().await?.ask_for_keyword {
        keyword = prompt("Keyword (leave empty for a generated one): ").await?;
    }

    let result = client.shorten(&url, keyword.as_deref(), server).await?;
    println!("{}", result.short_url);
    Ok(())
}

async fn prompt(message: &str) -> Result<Option<String>> {
    eprint!("{}", message);
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    let answer = line.trim();
    Ok((!answer.is_empty()).then(|| answer.to_string()))
}

async fn test_connection(
    client: &ShortenerClient,
    url: Option<String>,
    credential: Option<String>,
) -> Result<()> {
    let saved = client.load_settings().await?;
    let url = url.unwrap_or(saved.server_url);
    let credential = credential.unwrap_or(saved.credential);

    match client.test_connection(&url, &credential).await? {
        ConnectionReport::Connected => println!("Connection successful"),
        ConnectionReport::UnexpectedFormat(data) => {
            println!("Connected, but the response had an unexpected format:");
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
    }
    Ok(())
}

async fn settings(client: &ShortenerClient, action: SettingsCommand) -> Result<()> {
    match action {
        SettingsCommand::Show => {
            let settings = client.load_settings().await?;
            println!("{}", serde_json::to_string_pretty(&settings.redacted())?);
        }
        SettingsCommand::Set { assignments } => {
            let mut settings: Settings = client.load_settings().await?;
            for assignment in &assignments {
                let (key, value) = assignment.split_once('=').ok_or_else(|| {
                    RelayError::InvalidInput(format!("expected key=value, got '{}'", assignment))
                })?;
                settings.set_field(key.trim(), value)?;
            }
            client.save_settings(&settings).await?;
            println!("Settings saved");
        }
        SettingsCommand::Servers => {
            let settings = client.load_settings().await?;
            for profile in shortlink_relay::selector::selectable_profiles(&settings) {
                println!("{:<10} {:<12} {}", profile.key(), profile.label(), profile.base_url);
            }
        }
        SettingsCommand::Admin { server } => {
            println!("{}", client.admin_url(server).await?);
        }
    }
    Ok(())
}

fn print_stats(report: &StatsReport) {
    let freshness = if report.stats.from_cache {
        "cached"
    } else {
        "fresh"
    };
    println!(
        "{} ({}) - {} data fetched {}",
        report.server_label,
        report.server,
        freshness,
        report.stats.fetched_at.format("%Y-%m-%d %H:%M:%S UTC")
    );

    if let Some(links) = report.total_links() {
        println!("Total links:  {}", links);
    }
    if let Some(clicks) = report.total_clicks() {
        println!("Total clicks: {}", clicks);
    }

    for (rank, link) in report.links().iter().enumerate() {
        println!(
            "{:>3}. {} -> {} ({} clicks)",
            rank + 1,
            link["shorturl"].as_str().unwrap_or("?"),
            link["url"].as_str().unwrap_or("?"),
            link["clicks"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| link["clicks"].to_string())
        );
    }
}

/// Initialize structured logging on stderr
fn initialize_tracing(json: bool) {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false);

    let registry = tracing_subscriber::registry().with(filter_layer);
    if json {
        registry.with(fmt_layer.json()).init();
    } else {
        registry.with(fmt_layer).init();
    }
}
