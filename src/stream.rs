use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::{
    backoff::ReconnectPolicy,
    classify::{classify_text, StreamMessage},
    consts::{
        LOG_PAYLOAD_MAX_CHARS, STREAM_CLOSE_GRACE_MS, STREAM_CONNECT_TIMEOUT_SECS,
        STREAM_LIVENESS_CHECK_INTERVAL_SECS, STREAM_LIVENESS_IDLE_SECS,
        STREAM_LIVENESS_PING_GRACE_SECS,
    },
    diagnostics::{RuntimeDiagnostics, RuntimeTracker},
    error::Result,
    model::{ConnectionState, OutboundFrame},
    settings::Settings,
    util::{redact_ws_url, truncate_message, unix_now_secs},
};

pub type MessageHandler = Arc<dyn Fn(StreamMessage) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub request_unread_on_open: bool,
    pub liveness_check_interval: Duration,
    pub liveness_idle: Duration,
    pub liveness_ping_grace: Duration,
}

impl StreamConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(STREAM_CONNECT_TIMEOUT_SECS),
            request_unread_on_open: true,
            liveness_check_interval: Duration::from_secs(STREAM_LIVENESS_CHECK_INTERVAL_SECS),
            liveness_idle: Duration::from_secs(STREAM_LIVENESS_IDLE_SECS),
            liveness_ping_grace: Duration::from_secs(STREAM_LIVENESS_PING_GRACE_SECS),
        }
    }

    pub fn from_settings(settings: &Settings, token: Option<&str>) -> Result<Self> {
        let mut config = Self::new(settings.stream_url(token)?);
        config.connect_timeout = settings.connect_timeout();
        config.request_unread_on_open = settings.request_unread_on_connect;
        Ok(config)
    }
}

struct Session {
    stop_tx: watch::Sender<bool>,
    outbound_tx: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

/// Owns at most one live notification socket and its reconnect loop.
///
/// Must be used from inside a Tokio runtime. Dropping the stream tears the
/// connection down.
pub struct NotificationStream {
    config: StreamConfig,
    handler: MessageHandler,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    runtime: RuntimeTracker,
    /// Bumped on every connect/teardown. A task only publishes state while its
    /// own epoch is current, so a task that is still winding down cannot
    /// clobber its replacement.
    epoch: Arc<AtomicU64>,
    session: Option<Session>,
}

impl NotificationStream {
    pub fn new<F>(config: StreamConfig, handler: F) -> Self
    where
        F: Fn(StreamMessage) + Send + Sync + 'static,
    {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            handler: Arc::new(handler),
            state_tx: Arc::new(state_tx),
            runtime: RuntimeTracker::default(),
            epoch: Arc::new(AtomicU64::new(0)),
            session: None,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Replaces the endpoint settings. Takes effect on the next `connect()`;
    /// a running session keeps its socket.
    pub fn set_config(&mut self, config: StreamConfig) {
        self.config = config;
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn diagnostics(&self) -> RuntimeDiagnostics {
        self.runtime.snapshot()
    }

    /// Opens a fresh connection, tearing down any attempt that is in flight,
    /// open, or waiting to reconnect.
    pub fn connect(&mut self) {
        self.teardown();

        let (stop_tx, stop_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let task_epoch = self.epoch.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        self.runtime.reset_session();

        let task = StreamTask {
            config: self.config.clone(),
            handler: self.handler.clone(),
            state_tx: self.state_tx.clone(),
            runtime: self.runtime.clone(),
            epoch: self.epoch.clone(),
            task_epoch,
        };
        task.publish(ConnectionState::Connecting);
        debug!("spawning notification stream task epoch={task_epoch}");
        let handle = tokio::spawn(run_stream_loop(task, stop_rx, outbound_rx));

        self.session = Some(Session {
            stop_tx,
            outbound_tx,
            task: handle,
        });
    }

    /// Cancels any pending reconnect and closes the socket.
    pub fn disconnect(&mut self) {
        if self.session.is_some() {
            info!("notification stream disconnect requested");
        }
        self.teardown();
        self.state_tx.send_replace(ConnectionState::Disconnected);
        self.runtime.set_state(ConnectionState::Disconnected);
    }

    /// Serializes and queues `payload` if the socket is open. Returns whether
    /// the frame was queued; never fails.
    pub fn send<T: Serialize>(&self, payload: &T) -> bool {
        if !self.is_connected() {
            debug!("send skipped: stream not connected");
            return false;
        }
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        let text = match serde_json::to_string(payload) {
            Ok(text) => text,
            Err(error) => {
                warn!("failed to serialize outbound frame: {error}");
                return false;
            }
        };
        session.outbound_tx.send(text).is_ok()
    }

    pub fn mark_as_read(&self, notification_id: i64) -> bool {
        self.send(&OutboundFrame::MarkAsRead { notification_id })
    }

    pub fn mark_all_as_read(&self) -> bool {
        self.send(&OutboundFrame::MarkAllAsRead)
    }

    pub fn request_unread(&self) -> bool {
        self.send(&OutboundFrame::GetUnread)
    }

    fn teardown(&mut self) {
        // Invalidate the running task before signalling it.
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(session) = self.session.take() {
            let _ = session.stop_tx.send(true);
            drop(session.outbound_tx);
            reap_task(session.task, Duration::from_millis(STREAM_CLOSE_GRACE_MS));
        }
    }
}

/// Gives a stopped task `grace` to send its close frame, then aborts it.
/// Outside a runtime (e.g. dropped after shutdown) it is aborted at once.
fn reap_task(mut task: JoinHandle<()>, grace: Duration) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                if tokio::time::timeout(grace, &mut task).await.is_err() {
                    debug!("stream task ignored stop signal; aborting");
                    task.abort();
                }
            });
        }
        Err(_) => task.abort(),
    }
}

impl Drop for NotificationStream {
    fn drop(&mut self) {
        self.teardown();
    }
}

struct StreamTask {
    config: StreamConfig,
    handler: MessageHandler,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    runtime: RuntimeTracker,
    epoch: Arc<AtomicU64>,
    task_epoch: u64,
}

impl StreamTask {
    fn is_current(&self) -> bool {
        self.epoch.load(Ordering::SeqCst) == self.task_epoch
    }

    fn publish(&self, state: ConnectionState) {
        if !self.is_current() {
            return;
        }
        self.state_tx.send_replace(state);
        self.runtime.set_state(state);
    }

    fn deliver(&self, message: StreamMessage) {
        if !self.is_current() {
            return;
        }
        let id = match &message {
            StreamMessage::Notification(notification) => Some(notification.id),
            _ => None,
        };
        self.runtime.mark_message(unix_now_secs(), id);
        (self.handler)(message);
    }
}

async fn run_stream_loop(
    task: StreamTask,
    mut stop_rx: watch::Receiver<bool>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
) {
    let mut policy = ReconnectPolicy::new();
    debug!("stream task started");

    loop {
        if *stop_rx.borrow() {
            break;
        }

        task.publish(ConnectionState::Connecting);
        debug!("attempting stream connection");
        let err = match stream_once(&task, &mut stop_rx, &mut outbound_rx, &mut policy).await {
            Ok(()) => break,
            Err(err) => err,
        };
        if *stop_rx.borrow() {
            break;
        }

        let delay = policy.next_delay();
        warn!(
            "notification stream error: {err}; reconnecting in {}ms (attempt {})",
            delay.as_millis(),
            policy.attempt()
        );
        if task.is_current() {
            task.runtime.mark_backoff(&err, delay.as_millis() as u64);
        }
        task.publish(ConnectionState::Backoff);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    task.publish(ConnectionState::Disconnected);
    debug!("stream task finished");
}

/// Runs one connection until it fails (`Err`, reconnect) or is stopped
/// (`Ok`, exit).
async fn stream_once(
    task: &StreamTask,
    stop_rx: &mut watch::Receiver<bool>,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    policy: &mut ReconnectPolicy,
) -> std::result::Result<(), String> {
    let config = &task.config;
    debug!("ws connect {}", redact_ws_url(&config.url));

    let connect = tokio::time::timeout(config.connect_timeout, connect_async(config.url.as_str()));
    let (mut ws_stream, _) = tokio::select! {
        result = connect => result
            .map_err(|_| format!(
                "Stream connection timed out after {} seconds",
                config.connect_timeout.as_secs()
            ))?
            .map_err(|error| format!("Stream connection failed: {error}"))?,
        _ = stop_rx.changed() => return Ok(()),
    };

    policy.reset();
    if task.is_current() {
        task.runtime.mark_connected(unix_now_secs());
    }
    task.publish(ConnectionState::Connected);
    info!("notification stream connected");

    if config.request_unread_on_open {
        let frame = serde_json::to_string(&OutboundFrame::GetUnread)
            .map_err(|error| format!("Failed to encode unread request: {error}"))?;
        ws_stream
            .send(Message::Text(frame.into()))
            .await
            .map_err(|error| format!("Failed to request unread notifications: {error}"))?;
    }

    let mut liveness_interval = tokio::time::interval(config.liveness_check_interval);
    liveness_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    liveness_interval.tick().await;
    let mut last_activity_at = Instant::now();
    let mut pending_ping_since: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                let _ = ws_stream.close(None).await;
                return Ok(());
            }
            outbound = outbound_rx.recv() => {
                let Some(text) = outbound else {
                    let _ = ws_stream.close(None).await;
                    return Ok(());
                };
                debug!("ws send {}", truncate_message(&text, LOG_PAYLOAD_MAX_CHARS));
                ws_stream
                    .send(Message::Text(text.into()))
                    .await
                    .map_err(|error| format!("Failed to send frame: {error}"))?;
            }
            incoming = ws_stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        last_activity_at = Instant::now();
                        pending_ping_since = None;
                        task.runtime.mark_activity(unix_now_secs());
                        debug!("ws text frame bytes={}", text.len());
                        match classify_text(text.as_str()) {
                            StreamMessage::Unrecognized => {
                                debug!(
                                    "ws frame ignored: {}",
                                    truncate_message(text.as_str(), LOG_PAYLOAD_MAX_CHARS)
                                );
                            }
                            message => task.deliver(message),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        last_activity_at = Instant::now();
                        pending_ping_since = None;
                        task.runtime.mark_activity(unix_now_secs());
                        ws_stream.send(Message::Pong(payload)).await
                            .map_err(|error| format!("Failed to send pong: {error}"))?;
                    }
                    Some(Ok(Message::Close(_))) => {
                        return Err("Stream closed by server".to_string());
                    }
                    Some(Ok(_)) => {
                        last_activity_at = Instant::now();
                        pending_ping_since = None;
                        task.runtime.mark_activity(unix_now_secs());
                    }
                    Some(Err(error)) => return Err(format!("Stream read error: {error}")),
                    None => return Err("Stream ended unexpectedly".to_string()),
                }
            }
            _ = liveness_interval.tick() => {
                let now = Instant::now();
                if now.duration_since(last_activity_at) < config.liveness_idle {
                    continue;
                }
                match pending_ping_since {
                    None => {
                        debug!("ws liveness ping sent");
                        ws_stream
                            .send(Message::Ping(Vec::<u8>::new().into()))
                            .await
                            .map_err(|error| format!("Failed to send liveness ping: {error}"))?;
                        pending_ping_since = Some(now);
                    }
                    Some(started) => {
                        if now.duration_since(started) >= config.liveness_ping_grace {
                            return Err(format!(
                                "Stream liveness timeout after {}s idle",
                                now.duration_since(last_activity_at).as_secs()
                            ));
                        }
                    }
                }
            }
        }
    }
}
