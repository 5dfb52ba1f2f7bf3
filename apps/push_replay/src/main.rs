use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::Parser;
use client_core::{
    config::DEFAULT_SETTINGS_FILE, load_settings_from, prepare_database_url, ChannelChatNotifier,
    Clock, Dispatch, ManualClock, NotifierEvent, PushHandler, SystemClock,
};
use serde::Deserialize;
use shared::{domain::UserId, protocol::OutOfBandMessage};
use storage::Storage;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, BufReader},
    sync::{broadcast, oneshot},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Replays a capture of out-of-band chat envelopes through the push pipeline
/// and prints the resulting UI notifications.
#[derive(Parser, Debug)]
struct Args {
    /// JSON lines capture. Reads stdin when omitted.
    #[arg(long)]
    input: Option<PathBuf>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long, default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,
    /// Sleep for real between envelopes instead of advancing a virtual clock.
    #[arg(long)]
    realtime: bool,
    /// Time allowed to pass after the last envelope, so open gaps and typers
    /// time out.
    #[arg(long, default_value_t = 0)]
    settle_ms: u64,
    /// Print notifications as JSON lines.
    #[arg(long)]
    json: bool,
}

/// One capture line: `{"uid":1,"system":"chat.activity","body_b64":"..."}`
/// or the same with an inline JSON `body`.
#[derive(Debug, Deserialize)]
struct CapturedEnvelope {
    uid: UserId,
    system: String,
    #[serde(default)]
    body_b64: Option<String>,
    #[serde(default)]
    body: Option<serde_json::Value>,
    /// Time that passed before this envelope arrived.
    #[serde(default)]
    delay_ms: u64,
}

impl CapturedEnvelope {
    fn into_message(self) -> Result<(OutOfBandMessage, Duration)> {
        let body = match (self.body_b64, self.body) {
            (Some(encoded), _) => STANDARD
                .decode(encoded.trim())
                .context("body_b64 is not valid base64")?,
            (None, Some(body)) => serde_json::to_vec(&body)?,
            (None, None) => Vec::new(),
        };
        Ok((
            OutOfBandMessage::new(self.uid, self.system, body),
            Duration::from_millis(self.delay_ms),
        ))
    }
}

enum ReplayClock {
    Virtual(ManualClock),
    Real,
}

impl ReplayClock {
    async fn wait(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        match self {
            Self::Virtual(clock) => clock.advance(delay).await,
            Self::Real => tokio::time::sleep(delay).await,
        }
    }
}

#[derive(Debug, Default)]
struct ReplayStats {
    handled: u64,
    ignored: u64,
    rejected: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let settings = load_settings_from(&args.config);
    let database_url = prepare_database_url(
        args.database_url
            .as_deref()
            .unwrap_or(&settings.database_url),
    );
    let storage = Arc::new(Storage::new(&database_url).await?);
    storage.health_check().await?;
    info!(database_url = %database_url, "replay: storage ready");

    let (replay_clock, clock) = if args.realtime {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::current()?);
        (ReplayClock::Real, clock)
    } else {
        let manual = ManualClock::new();
        let clock: Arc<dyn Clock> = Arc::new(manual.clone());
        (ReplayClock::Virtual(manual), clock)
    };

    let notifier = ChannelChatNotifier::default();
    let (printer_shutdown, printer_shutdown_rx) = oneshot::channel();
    let printer = tokio::spawn(print_events(
        notifier.subscribe(),
        args.json,
        printer_shutdown_rx,
    ));

    let handler = PushHandler::new(&settings, storage.clone(), Arc::new(notifier), clock);
    handler.start();

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &args.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open capture '{}'", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };
    let stats = replay(&handler, &replay_clock, reader).await?;
    replay_clock
        .wait(Duration::from_millis(args.settle_ms))
        .await;

    flush(&handler).await;
    handler.stop().await;
    let _ = printer_shutdown.send(());
    printer.await?;

    info!(
        handled = stats.handled,
        ignored = stats.ignored,
        rejected = stats.rejected,
        "replay: finished"
    );
    for stored in storage.list_inbox_versions().await? {
        println!(
            "uid={} inbox_version={} updated_at={}",
            stored.user_id.0, stored.version.0, stored.updated_at
        );
    }
    Ok(())
}

async fn replay(
    handler: &PushHandler,
    clock: &ReplayClock,
    reader: Box<dyn AsyncBufRead + Unpin + Send>,
) -> Result<ReplayStats> {
    let mut stats = ReplayStats::default();
    let mut lines = reader.lines();
    let mut line_no = 0u64;

    while let Some(raw) = lines.next_line().await? {
        line_no += 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parsed = serde_json::from_str::<CapturedEnvelope>(line)
            .context("not a capture envelope")
            .and_then(CapturedEnvelope::into_message);
        let (msg, delay) = match parsed {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(line = line_no, error = %format!("{err:#}"), "replay: skipping capture line");
                stats.rejected += 1;
                continue;
            }
        };

        clock.wait(delay).await;
        match handler.dispatch(&msg).await {
            Ok(Dispatch::Handled) => stats.handled += 1,
            Ok(Dispatch::Ignored) => stats.ignored += 1,
            Err(err) => {
                warn!(line = line_no, error = %err, "replay: envelope rejected");
                stats.rejected += 1;
            }
        }
    }

    Ok(stats)
}

/// Waits for every notification queued so far to reach the notifier.
async fn flush(handler: &PushHandler) {
    let (tx, rx) = oneshot::channel();
    handler
        .funnel()
        .enqueue(Box::pin(async move {
            let _ = tx.send(());
        }))
        .await;
    let _ = rx.await;
}

async fn print_events(
    mut events: broadcast::Receiver<NotifierEvent>,
    json: bool,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_event(&event, json),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "replay: printer fell behind, notifications lost");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            _ = &mut shutdown => break,
        }
    }
    while let Ok(event) = events.try_recv() {
        print_event(&event, json);
    }
}

fn print_event(event: &NotifierEvent, json: bool) {
    if !json {
        println!("{event:?}");
        return;
    }
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(err) => warn!(error = %err, "replay: failed to encode notification"),
    }
}
