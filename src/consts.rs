pub(crate) const DEFAULT_LOCAL_HOST: &str = "localhost:8000";
pub(crate) const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api";
pub(crate) const DEFAULT_STORAGE_KEY: &str = "access_token";
pub(crate) const DEFAULT_TOKEN_FILE: &str = "token-store.json";
pub(crate) const DEFAULT_RECENT_LIMIT: usize = 10;
pub(crate) const DEFAULT_REFRESH_PAGES: u32 = 1;

pub(crate) const NOTIFICATIONS_WS_PATH: &str = "/ws/notifications/";

pub(crate) const STREAM_CONNECT_TIMEOUT_SECS: u64 = 10;
pub(crate) const STREAM_LIVENESS_CHECK_INTERVAL_SECS: u64 = 15;
pub(crate) const STREAM_LIVENESS_IDLE_SECS: u64 = 90;
pub(crate) const STREAM_LIVENESS_PING_GRACE_SECS: u64 = 30;
pub(crate) const STREAM_CLOSE_GRACE_MS: u64 = 2_000;

pub(crate) const RECONNECT_BASE_DELAY_MS: u64 = 1_000;
pub(crate) const RECONNECT_MAX_DELAY_MS: u64 = 30_000;

pub(crate) const API_REQUEST_TIMEOUT_SECS: u64 = 15;
pub(crate) const API_ERROR_BODY_MAX_CHARS: usize = 200;
pub(crate) const LOG_PAYLOAD_MAX_CHARS: usize = 140;
pub(crate) const LAST_ERROR_MAX_CHARS: usize = 300;
