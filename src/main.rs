use std::{env, path::PathBuf};

use anyhow::Context as _;
use dashboard_notify::{NotificationCenter, Settings, StreamMessage};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SETTINGS_ENV: &str = "DASHBOARD_NOTIFY_SETTINGS";
const DEFAULT_SETTINGS_PATH: &str = "notify-settings.json";

fn settings_path() -> PathBuf {
    env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| env::var_os(SETTINGS_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let path = settings_path();
    let settings =
        Settings::load(&path).with_context(|| format!("loading settings from {path:?}"))?;
    let recent_limit = settings.recent_limit;
    info!("using settings {path:?} ({:?})", settings.environment);

    let mut center =
        NotificationCenter::from_settings(settings).context("starting notification center")?;
    let mut updates = center.subscribe();
    center.start().context("starting notification stream")?;

    match center.refresh().await {
        Ok(inserted) => info!("initial sync: {inserted} notifications"),
        Err(error) => warn!("initial sync failed: {error}"),
    }
    print_recent(&center, recent_limit);

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(StreamMessage::Notification(notification)) => {
                    println!(
                        "[{}] {}: {}",
                        notification.kind, notification.title, notification.message
                    );
                    print_badge(&center);
                }
                Ok(StreamMessage::UnreadList(list)) => {
                    info!("received {} unread notifications", list.len());
                    print_recent(&center, recent_limit);
                }
                Ok(StreamMessage::Unrecognized) => {}
                Err(RecvError::Lagged(skipped)) => warn!("skipped {skipped} updates"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    center.stop();
    Ok(())
}

fn print_badge(center: &NotificationCenter) {
    match center.unread_count() {
        Ok(count) => println!("unread: {count}"),
        Err(error) => warn!("unread count unavailable: {error}"),
    }
}

fn print_recent(center: &NotificationCenter, limit: usize) {
    match center.recent(limit) {
        Ok(recent) => {
            for notification in recent {
                let marker = if notification.is_read { ' ' } else { '*' };
                let when = notification
                    .created_at
                    .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{marker} {when} #{} {}", notification.id, notification.title);
            }
        }
        Err(error) => warn!("recent notifications unavailable: {error}"),
    }
    print_badge(center);
}
