use serde::Serialize;
use std::sync::{Arc, Mutex};

use crate::{
    consts::LAST_ERROR_MAX_CHARS,
    model::ConnectionState,
    util::{truncate_message, unix_now_secs},
};

/// Mutable bookkeeping written by the stream task.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeState {
    pub(crate) connection_state: ConnectionState,
    pub(crate) last_connected_at: Option<u64>,
    pub(crate) last_event_at: Option<u64>,
    pub(crate) last_message_at: Option<u64>,
    pub(crate) last_message_id: Option<i64>,
    pub(crate) last_error: Option<String>,
    pub(crate) backoff_ms: u64,
    pub(crate) reconnect_attempts: u64,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            connection_state: ConnectionState::Disconnected,
            last_connected_at: None,
            last_event_at: None,
            last_message_at: None,
            last_message_id: None,
            last_error: None,
            backoff_ms: 0,
            reconnect_attempts: 0,
        }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct RuntimeDiagnostics {
    pub connection_state: ConnectionState,
    pub last_connected_at: Option<u64>,
    pub last_event_at: Option<u64>,
    pub last_message_at: Option<u64>,
    pub last_message_id: Option<i64>,
    pub stale_for_seconds: Option<u64>,
    pub last_error: Option<String>,
    pub backoff_ms: u64,
    pub reconnect_attempts: u64,
}

/// Cloneable handle to the runtime bookkeeping. A poisoned lock only loses
/// diagnostics, so writers skip the update instead of failing.
#[derive(Debug, Clone, Default)]
pub(crate) struct RuntimeTracker {
    inner: Arc<Mutex<RuntimeState>>,
}

impl RuntimeTracker {
    fn update(&self, apply: impl FnOnce(&mut RuntimeState)) {
        if let Ok(mut runtime) = self.inner.lock() {
            apply(&mut runtime);
        }
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.update(|runtime| runtime.connection_state = state);
    }

    pub(crate) fn mark_connected(&self, at: u64) {
        self.update(|runtime| {
            runtime.connection_state = ConnectionState::Connected;
            runtime.last_connected_at = Some(at);
            runtime.last_event_at = Some(at);
            runtime.last_error = None;
            runtime.backoff_ms = 0;
        });
    }

    pub(crate) fn mark_activity(&self, at: u64) {
        self.update(|runtime| runtime.last_event_at = Some(at));
    }

    pub(crate) fn mark_message(&self, at: u64, id: Option<i64>) {
        self.update(|runtime| {
            runtime.last_event_at = Some(at);
            runtime.last_message_at = Some(at);
            if id.is_some() {
                runtime.last_message_id = id;
            }
        });
    }

    pub(crate) fn mark_backoff(&self, error: &str, delay_ms: u64) {
        self.update(|runtime| {
            runtime.connection_state = ConnectionState::Backoff;
            runtime.last_error = Some(truncate_message(error, LAST_ERROR_MAX_CHARS));
            runtime.backoff_ms = delay_ms;
            runtime.reconnect_attempts = runtime.reconnect_attempts.saturating_add(1);
        });
    }

    pub(crate) fn reset_session(&self) {
        self.update(|runtime| {
            runtime.last_error = None;
            runtime.backoff_ms = 0;
            runtime.reconnect_attempts = 0;
        });
    }

    pub(crate) fn snapshot(&self) -> RuntimeDiagnostics {
        let runtime = match self.inner.lock() {
            Ok(runtime) => runtime.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let stale_for_seconds = runtime
            .last_event_at
            .map(|last| unix_now_secs().saturating_sub(last));

        RuntimeDiagnostics {
            connection_state: runtime.connection_state,
            last_connected_at: runtime.last_connected_at,
            last_event_at: runtime.last_event_at,
            last_message_at: runtime.last_message_at,
            last_message_id: runtime.last_message_id,
            stale_for_seconds,
            last_error: runtime.last_error,
            backoff_ms: runtime.backoff_ms,
            reconnect_attempts: runtime.reconnect_attempts,
        }
    }
}
