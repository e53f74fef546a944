use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};
use gotify_companion::{
    settings::SettingsUpdate, util::truncate_message, Companion, CoreEvent, Result,
};
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const APP_DIR_NAME: &str = "gotify-companion";

#[derive(Parser)]
#[command(name = "gotify-companion")]
#[command(about = "Headless Gotify stream, cache and notification gating")]
#[command(version)]
struct Cli {
    /// Directory holding settings.json and messages.json
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the stream and log events until Ctrl-C
    Run,
    /// Fetch a link preview
    Preview { url: String },
    /// Check server URL and token against /application
    TestConnection {
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long)]
        token: Option<String>,
    },
    /// Pause notifications for N minutes, or until resumed
    Pause {
        #[arg(required_unless_present = "forever")]
        minutes: Option<u64>,
        #[arg(long, conflicts_with = "minutes")]
        forever: bool,
    },
    Resume,
    /// Print the runtime diagnostics snapshot
    Diagnostics,
    /// Print cached messages, newest first
    Messages {
        /// Pull from the server before printing
        #[arg(long)]
        sync: bool,
        #[arg(long, short, default_value = "20")]
        limit: usize,
    },
    /// Show settings, or update the given fields
    Configure {
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long)]
        token: Option<String>,
        #[arg(long)]
        min_priority: Option<i64>,
        #[arg(long)]
        cache_limit: Option<usize>,
        #[arg(long)]
        quiet_start: Option<u8>,
        #[arg(long)]
        quiet_end: Option<u8>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("gotify_companion=info,warn"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let config_dir = cli.config_dir.clone().unwrap_or_else(default_config_dir);

    match execute(cli.command, config_dir).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn execute(command: Commands, config_dir: PathBuf) -> Result<()> {
    let companion = Companion::open(&config_dir)?;

    match command {
        Commands::Run => run(&companion).await,
        Commands::Preview { url } => print_json(&companion.fetch_url_preview(&url).await?),
        Commands::TestConnection { base_url, token } => {
            let status = companion
                .test_connection(base_url.as_deref(), token.as_deref())
                .await?;
            println!("{status}");
            Ok(())
        }
        Commands::Pause { minutes, forever } => {
            let state = match minutes {
                Some(minutes) if !forever => companion.pause_notifications(minutes, None)?,
                _ => companion.pause_notifications_forever()?,
            };
            println!("{state}");
            Ok(())
        }
        Commands::Resume => {
            println!("{}", companion.resume_notifications()?);
            Ok(())
        }
        Commands::Diagnostics => print_json(&companion.get_runtime_diagnostics()?),
        Commands::Messages { sync, limit } => {
            if sync {
                let size = companion.sync_messages().await?;
                info!(size, "synced");
            }
            let messages: Vec<_> = companion
                .get_cached_messages()?
                .into_iter()
                .take(limit)
                .collect();
            print_json(&messages)
        }
        Commands::Configure {
            base_url,
            token,
            min_priority,
            cache_limit,
            quiet_start,
            quiet_end,
        } => {
            let current = companion.load_settings()?;
            let unchanged = base_url.is_none()
                && token.is_none()
                && min_priority.is_none()
                && cache_limit.is_none()
                && quiet_start.is_none()
                && quiet_end.is_none();
            if unchanged {
                return print_json(&current);
            }
            let view = companion.save_settings(SettingsUpdate {
                base_url: base_url.unwrap_or(current.base_url),
                token: token.unwrap_or_default(),
                min_priority,
                cache_limit,
                quiet_hours_start: quiet_start,
                quiet_hours_end: quiet_end,
                ..SettingsUpdate::default()
            })?;
            print_json(&view)
        }
    }
}

async fn run(companion: &Companion) -> Result<()> {
    let mut subscription = companion.subscribe();
    companion.start_stream()?;
    info!(pause = %companion.get_pause_state()?, "stream started, Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            event = subscription.recv() => {
                let Some(event) = event else { break };
                log_event(&event);
            }
        }
    }

    companion.stop_stream()
}

fn log_event(event: &CoreEvent) {
    match event {
        CoreEvent::ConnectionState(state) => info!(%state, "connection"),
        CoreEvent::ConnectionError(reason) => warn!(%reason, "connection error"),
        CoreEvent::MessageReceived(message) => info!(
            id = message.id,
            app = %message.app_name,
            priority = message.priority,
            title = %truncate_message(&message.title, 80),
            "message"
        ),
        CoreEvent::MessagesUpdated(messages) => info!(count = messages.len(), "messages updated"),
        CoreEvent::NotificationMessage { content, .. } => info!(
            title = %content.title,
            subtitle = %content.subtitle,
            body = %content.body,
            "notify"
        ),
        CoreEvent::NotificationsPausedUntil { until, mode } => {
            info!(until, ?mode, "notifications paused")
        }
        CoreEvent::NotificationsResumed => info!("notifications resumed"),
        CoreEvent::RuntimeDiagnostics(_) => {}
    }
}
