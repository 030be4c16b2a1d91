//! Bearer token lookup.
//!
//! The dashboard has written the token under several encodings over time (bare
//! string, JSON string, JSON object), so reads go through [`resolve_token`],
//! which accepts all of them. New writes always store the bare token.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde_json::Value;
use tracing::debug;

use crate::{
    error::{Error, Result},
    util::write_atomically,
};

/// Object fields that may carry the token, in lookup order.
const TOKEN_FIELDS: [&str; 4] = ["access", "access_token", "accessToken", "token"];

/// Extracts a bearer token from a persisted value. Never fails: anything that
/// is not a recognizable encoding yields `None`.
pub fn resolve_token(raw: Option<&str>) -> Option<String> {
    let trimmed = raw?.trim();
    if trimmed.is_empty() {
        return None;
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => token_from_json(&value, true),
        Err(_) => Some(trimmed.to_string()),
    }
}

fn token_from_json(value: &Value, allow_object: bool) -> Option<String> {
    match value {
        Value::String(inner) => non_empty(inner),
        Value::Object(map) if allow_object => TOKEN_FIELDS
            .iter()
            .filter_map(|field| map.get(*field))
            .find_map(|field_value| match field_value {
                Value::String(inner) => match serde_json::from_str::<Value>(inner.trim()) {
                    Ok(Value::String(nested)) => non_empty(&nested),
                    _ => non_empty(inner),
                },
                _ => None,
            }),
        _ => None,
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Canonical encoding for new writes.
pub fn encode_token(token: &str) -> String {
    token.trim().to_string()
}

/// Persisted storage for the single token value.
pub trait TokenStore: Send + Sync {
    /// Raw stored value, in whatever encoding it was written.
    fn load_raw(&self) -> Result<Option<String>>;

    fn save(&self, token: &str) -> Result<()>;

    fn clear(&self) -> Result<()>;

    fn load(&self) -> Result<Option<String>> {
        Ok(resolve_token(self.load_raw()?.as_deref()))
    }
}

/// A JSON object file of `key -> raw string`, mirroring browser storage. Only
/// the configured key is touched; other keys survive writes.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
    key: String,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            key: key.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_entries(&self) -> Result<BTreeMap<String, Value>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path).map_err(|source| Error::Read {
            path: self.path.clone(),
            source,
        })?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content).map_err(|source| Error::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn write_entries(&self, entries: &BTreeMap<String, Value>) -> Result<()> {
        let content = serde_json::to_string_pretty(entries)?;
        write_atomically(&self.path, &content)
    }
}

impl TokenStore for FileTokenStore {
    fn load_raw(&self) -> Result<Option<String>> {
        let entries = self.read_entries()?;
        Ok(match entries.get(&self.key) {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) => Some(raw.clone()),
            // Older writers stored the object itself rather than its JSON text.
            Some(other) => Some(other.to_string()),
        })
    }

    fn save(&self, token: &str) -> Result<()> {
        let mut entries = self.read_entries()?;
        entries.insert(self.key.clone(), Value::String(encode_token(token)));
        self.write_entries(&entries)?;
        debug!("token saved to {:?}", self.path);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut entries = self.read_entries()?;
        if entries.remove(&self.key).is_some() {
            self.write_entries(&entries)?;
        }
        Ok(())
    }
}

/// Token kept in the OS keychain under `service`/`key`.
pub struct KeyringTokenStore {
    service: String,
    key: String,
}

impl KeyringTokenStore {
    pub fn new(service: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            key: key.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry> {
        Ok(keyring::Entry::new(&self.service, &self.key)?)
    }
}

impl TokenStore for KeyringTokenStore {
    fn load_raw(&self) -> Result<Option<String>> {
        match self.entry()?.get_password() {
            Ok(raw) => Ok(Some(raw)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    fn save(&self, token: &str) -> Result<()> {
        self.entry()?.set_password(&encode_token(token))?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}
