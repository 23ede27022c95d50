mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cli::{Cli, Commands};
use slotsync::{
    day_grid, AvailabilitySession, ConfigLoader, ConfigValidator, ConnectionState, SessionHandle, SlotTime,
    SlotView, SubscriptionKey, SyncConfig, SyncNotification, WsConnector,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("slotsync=info,warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::ConfigSample { output } => {
            let path = output.unwrap_or_else(|| PathBuf::from("./slotsync.sample.yaml"));
            SyncConfig::sample()
                .save(&path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Sample configuration written to {}", path.display());
        }
        Commands::Watch {
            provider,
            service,
            date,
            url,
            select,
        } => {
            let mut config = ConfigLoader::load_or_default(cli.config_path.as_deref())
                .context("failed to load configuration")?;
            if let Some(url) = url {
                config.server.url = url;
            }
            ConfigValidator::validate(&config).context("invalid configuration")?;

            let select = select
                .map(|s| s.parse::<SlotTime>())
                .transpose()
                .context("--select expects HH:MM")?;

            let key = SubscriptionKey::new(provider, service, date);
            watch(config, key, select).await?;
        }
    }

    Ok(())
}

async fn watch(config: SyncConfig, key: SubscriptionKey, select: Option<SlotTime>) -> Result<()> {
    let (handle, task) = AvailabilitySession::spawn(&config, Arc::new(WsConnector));
    let mut notifications = handle.notifications();
    info!(client = %handle.client_id(), subscription = %key, "Watching availability");
    handle.subscribe(key).await?;
    print_placeholder();

    let mut pending_select = select;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; shutting down");
                break;
            }
            notification = notifications.recv() => match notification {
                Ok(notification) => {
                    print_notification(&notification);
                    if let SyncNotification::Connection(ConnectionState::Subscribed) = notification {
                        if let Some(time) = pending_select.take() {
                            try_select(&handle, time).await;
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Notification stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    if handle.shutdown().await.is_ok() {
        task.await.context("session task panicked")?;
    }
    Ok(())
}

async fn try_select(handle: &SessionHandle, time: SlotTime) {
    match handle.select(time).await {
        Ok(update) => println!("claim {} on {}", update.state, update.slot),
        Err(e) => println!("cannot select {}: {}", time, e),
    }
}

fn print_notification(notification: &SyncNotification) {
    match notification {
        SyncNotification::Connection(state) => println!("connection: {}", state),
        SyncNotification::Slots(view) => print_view(view),
        SyncNotification::Claim(update) => match &update.reason {
            Some(reason) => println!("claim {} on {} ({})", update.state, update.slot, reason),
            None => println!("claim {} on {}", update.state, update.slot),
        },
        SyncNotification::Activity(presence) => {
            if presence.others_viewing > 0 {
                println!("{} other(s) viewing", presence.others_viewing);
            }
            if let Some(latest) = presence.recent.first() {
                println!("activity: {}", latest.describe());
            }
        }
        SyncNotification::Update(_) => {}
    }
}

fn print_view(view: &SlotView) {
    if view.is_empty() {
        return;
    }
    let marker = if view.stale { " (stale)" } else { "" };
    println!("slots{}:", marker);
    for slot in view.iter() {
        let status = if view.claimed == Some(slot.time()) {
            "held by you".to_string()
        } else if !slot.available() {
            "full".to_string()
        } else if slot.is_almost_full() {
            format!("{} left, almost full", slot.remaining())
        } else {
            format!("{} left", slot.remaining())
        };
        println!("  {}  {}", slot.time(), status);
    }
}

/// Empty 09:00-17:00 half-hour grid shown until the first snapshot arrives
fn print_placeholder() {
    let (Some(open), Some(close)) = (SlotTime::new(9, 0), SlotTime::new(17, 0)) else {
        return;
    };
    println!("loading availability...");
    for slot in day_grid(open, close, 30, 1) {
        println!("  {}  ...", slot.time());
    }
}
