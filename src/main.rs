use std::{path::PathBuf, process::ExitCode, time::Duration};

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;

use tasklist_live::{
    logging, LiveClient, LiveError, LiveEvent, PushMessage, SessionId, SessionStore, Settings,
};

#[derive(Parser)]
#[command(
    name = "tasklist-live",
    about = "Follow live notifications and task updates from a TaskList server",
    version
)]
struct Cli {
    /// Settings file (JSON). Missing files fall back to defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Session (user) id to follow. Defaults to the persisted session.
    #[arg(long)]
    session: Option<i64>,

    /// Forget the persisted session and exit
    #[arg(long)]
    logout: bool,

    /// Print a diagnostics snapshot every N seconds (0 disables)
    #[arg(long, default_value = "30")]
    diagnostics_every: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "tasklist-live failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), LiveError> {
    let settings = Settings::load(cli.config.as_deref())?;
    let store = settings.session_file.clone().map(SessionStore::new);

    if cli.logout {
        if let Some(store) = &store {
            store.clear()?;
            tracing::info!(path = %store.path().display(), "persisted session cleared");
        }
        return Ok(());
    }

    let session = match (cli.session, &store) {
        (Some(id), _) => Some(SessionId(id)),
        (None, Some(store)) => store.load()?,
        (None, None) => None,
    };

    let client = LiveClient::from_settings(&settings)?;
    let mut events = client.subscribe();
    client.start(session).await?;
    tracing::info!(session = ?session, base_url = %settings.base_url, "following live updates");

    let every = Duration::from_secs(cli.diagnostics_every.max(1));
    let mut diagnostics = tokio::time::interval(every);
    diagnostics.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received shutdown signal");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => report(&event),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event log lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = diagnostics.tick(), if cli.diagnostics_every > 0 => {
                println!("{}", serde_json::to_string(&client.diagnostics())?);
            }
        }
    }

    client.shutdown();
    Ok(())
}

fn report(event: &LiveEvent) {
    match event {
        LiveEvent::ConnectionState(status) => tracing::info!(%status, "connection state"),
        LiveEvent::ConnectionError(reason) => tracing::warn!(%reason, "connect failed"),
        LiveEvent::ReconnectScheduled { attempt, delay } => tracing::info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        ),
        LiveEvent::ReconnectGaveUp { attempts } => {
            tracing::warn!(attempts, "reconnect gave up")
        }
        LiveEvent::NotificationsChanged { total, unread } => {
            tracing::info!(total, unread, "notifications updated")
        }
        LiveEvent::Push(PushMessage::Notifications { channel, records }) => {
            tracing::debug!(?channel, count = records.len(), "notification push")
        }
        other => tracing::debug!(event = ?other, "live event"),
    }
}
