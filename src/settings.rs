use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf, time::Duration};
use tracing::debug;

use crate::{
    consts::{
        DEFAULT_API_BASE_URL, DEFAULT_LOCAL_HOST, DEFAULT_RECENT_LIMIT, DEFAULT_REFRESH_PAGES,
        DEFAULT_STORAGE_KEY, DEFAULT_TOKEN_FILE, NOTIFICATIONS_WS_PATH,
        STREAM_CONNECT_TIMEOUT_SECS,
    },
    error::{Error, Result},
    token::{FileTokenStore, KeyringTokenStore, TokenStore},
    util::write_atomically,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Local,
    Deployed,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub environment: Environment,
    pub local_host: String,
    pub deployed_host: String,
    pub api_base_url: String,
    pub token_file: PathBuf,
    pub storage_key: String,
    pub keyring_service: Option<String>,
    pub request_unread_on_connect: bool,
    pub connect_timeout_secs: u64,
    pub recent_limit: usize,
    pub refresh_pages: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            environment: Environment::Local,
            local_host: DEFAULT_LOCAL_HOST.to_string(),
            deployed_host: String::new(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            token_file: PathBuf::from(DEFAULT_TOKEN_FILE),
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            keyring_service: None,
            request_unread_on_connect: true,
            connect_timeout_secs: STREAM_CONNECT_TIMEOUT_SECS,
            recent_limit: DEFAULT_RECENT_LIMIT,
            refresh_pages: DEFAULT_REFRESH_PAGES,
        }
    }
}

impl Settings {
    /// Reads settings from `path`, falling back to defaults when the file does
    /// not exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("settings file {path:?} not found, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str::<Settings>(&content).map_err(|source| Error::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        write_atomically(path, &content)
    }

    /// Host for the active environment, normalized.
    pub fn stream_host(&self) -> Result<String> {
        let raw = match self.environment {
            Environment::Local => &self.local_host,
            Environment::Deployed => &self.deployed_host,
        };
        normalize_host(raw)
    }

    pub fn stream_scheme(&self) -> &'static str {
        match self.environment {
            Environment::Local => "ws",
            Environment::Deployed => "wss",
        }
    }

    pub fn stream_url(&self, token: Option<&str>) -> Result<String> {
        build_stream_ws_url(self.stream_scheme(), &self.stream_host()?, token)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    /// Token store selected by configuration: the keychain when a service name
    /// is configured, otherwise the storage file.
    pub fn token_store(&self) -> Box<dyn TokenStore> {
        match self.keyring_service.as_deref().map(str::trim) {
            Some(service) if !service.is_empty() => {
                Box::new(KeyringTokenStore::new(service, self.storage_key.clone()))
            }
            _ => Box::new(FileTokenStore::new(
                self.token_file.clone(),
                self.storage_key.clone(),
            )),
        }
    }
}

pub fn normalize_base_url(input: &str) -> Result<String> {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::InvalidUrl("API base URL is required".to_string()));
    }

    let url = reqwest::Url::parse(trimmed).map_err(|error| Error::InvalidUrl(error.to_string()))?;

    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(Error::InvalidUrl(
            "API base URL must start with http:// or https://".to_string(),
        ));
    }

    Ok(trimmed.to_string())
}

/// Accepts `host`, `host:port`, or a full URL and keeps only the authority.
pub fn normalize_host(input: &str) -> Result<String> {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::InvalidUrl("Stream host is required".to_string()));
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("ws://{trimmed}")
    };
    let url =
        reqwest::Url::parse(&with_scheme).map_err(|error| Error::InvalidUrl(error.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidUrl(format!("No host in {trimmed:?}")))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

pub fn build_stream_ws_url(scheme: &str, host: &str, token: Option<&str>) -> Result<String> {
    if scheme != "ws" && scheme != "wss" {
        return Err(Error::InvalidUrl(format!(
            "Stream scheme must be ws or wss, got {scheme:?}"
        )));
    }
    let mut ws_url = reqwest::Url::parse(&format!("{scheme}://{host}"))
        .map_err(|error| Error::InvalidUrl(error.to_string()))?;
    ws_url.set_path(NOTIFICATIONS_WS_PATH);

    if let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) {
        ws_url.query_pairs_mut().append_pair("token", token);
    }
    Ok(ws_url.to_string())
}
