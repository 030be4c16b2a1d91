//! Glue between the socket stream, the REST collaborator and the local cache.
//!
//! Both channels write into the same cache with last-write-wins semantics. A
//! REST response and a socket push for the same id may race; whichever is
//! applied last decides, and the next refresh reconciles with the server.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::{
    api::ApiClient,
    cache::{NotificationCache, ReadSnapshot},
    classify::StreamMessage,
    diagnostics::RuntimeDiagnostics,
    error::{Error, Result},
    model::{ConnectionState, Notification},
    settings::Settings,
    stream::{NotificationStream, StreamConfig},
    token::TokenStore,
};

const UPDATES_CHANNEL_CAPACITY: usize = 64;

pub type SharedCache = Arc<Mutex<NotificationCache>>;

/// Applies one classified frame to the cache.
pub fn apply_stream_message(cache: &mut NotificationCache, message: &StreamMessage) {
    match message {
        StreamMessage::Notification(notification) => {
            cache.upsert_one(notification.clone());
        }
        StreamMessage::UnreadList(list) => {
            let inserted = cache.upsert_many(list.iter().cloned());
            debug!("unread list merged: {} entries, {inserted} new", list.len());
        }
        StreamMessage::Unrecognized => {}
    }
}

pub struct NotificationCenter {
    settings: Settings,
    cache: SharedCache,
    stream: NotificationStream,
    api: Option<ApiClient>,
    token_store: Box<dyn TokenStore>,
    updates_tx: broadcast::Sender<StreamMessage>,
}

impl NotificationCenter {
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let token_store = settings.token_store();
        Self::new(settings, token_store)
    }

    /// Resolves the token from `token_store`. An unreadable store is treated
    /// as "no token": the socket connects anonymously and REST calls fail
    /// with [`Error::MissingToken`].
    pub fn new(settings: Settings, token_store: Box<dyn TokenStore>) -> Result<Self> {
        let token = load_token(token_store.as_ref());

        let cache: SharedCache = Arc::new(Mutex::new(NotificationCache::new()));
        let (updates_tx, _) = broadcast::channel(UPDATES_CHANNEL_CAPACITY);

        let handler_cache = cache.clone();
        let handler_tx = updates_tx.clone();
        let stream = NotificationStream::new(
            StreamConfig::from_settings(&settings, token.as_deref())?,
            move |message| {
                match handler_cache.lock() {
                    Ok(mut cache) => apply_stream_message(&mut cache, &message),
                    Err(_) => warn!("notification cache lock poisoned; frame dropped"),
                }
                let _ = handler_tx.send(message);
            },
        );

        let api = token
            .map(|token| ApiClient::new(&settings.api_base_url, token))
            .transpose()?;

        Ok(Self {
            settings,
            cache,
            stream,
            api,
            token_store,
            updates_tx,
        })
    }

    /// Points the stream URL and the REST client at `token`.
    fn apply_token(&mut self, token: Option<String>) -> Result<()> {
        self.stream
            .set_config(StreamConfig::from_settings(&self.settings, token.as_deref())?);
        self.api = token
            .map(|token| ApiClient::new(&self.settings.api_base_url, token))
            .transpose()?;
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn cache(&self) -> SharedCache {
        self.cache.clone()
    }

    pub fn stream(&self) -> &NotificationStream {
        &self.stream
    }

    /// Frames applied to the cache, in arrival order.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamMessage> {
        self.updates_tx.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.stream.subscribe_state()
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_connected()
    }

    pub fn diagnostics(&self) -> RuntimeDiagnostics {
        self.stream.diagnostics()
    }

    /// Re-reads the token store and (re)connects with whatever token it
    /// holds now.
    pub fn start(&mut self) -> Result<()> {
        let token = load_token(self.token_store.as_ref());
        self.apply_token(token)?;
        self.stream.connect();
        Ok(())
    }

    /// Stores `token` and uses it for REST calls and the next `start()`.
    pub fn login(&mut self, token: &str) -> Result<()> {
        self.token_store.save(token)?;
        let token = load_token(self.token_store.as_ref());
        if token.is_none() {
            return Err(Error::MissingToken);
        }
        self.apply_token(token)?;
        info!("token stored");
        Ok(())
    }

    pub fn stop(&mut self) {
        self.stream.disconnect();
    }

    fn lock_cache(&self) -> Result<MutexGuard<'_, NotificationCache>> {
        self.cache
            .lock()
            .map_err(|_| Error::LockPoisoned("Notification cache"))
    }

    fn api(&self) -> Result<&ApiClient> {
        self.api.as_ref().ok_or(Error::MissingToken)
    }

    /// Pulls the latest notifications over REST and merges them. Returns the
    /// number of entries that were new to the cache.
    pub async fn refresh(&self) -> Result<usize> {
        let fresh = self.api()?.fetch_all(self.settings.refresh_pages).await?;
        let fetched = fresh.len();
        let inserted = self.lock_cache()?.upsert_many(fresh);
        debug!("refresh merged {fetched} notifications, {inserted} new");
        Ok(inserted)
    }

    /// Fetches one notification by id and merges it.
    pub async fn fetch(&self, id: i64) -> Result<Notification> {
        let notification = self.api()?.fetch_notification(id).await?;
        self.lock_cache()?.upsert_one(notification.clone());
        Ok(notification)
    }

    /// Optimistically marks `id` read, reverting if the server rejects it.
    pub async fn mark_read(&self, id: i64) -> Result<()> {
        let snapshot = self.lock_cache()?.begin_mark_read(id);
        let result = match self.api() {
            Ok(api) => api.mark_read(id).await,
            Err(error) => Err(error),
        };
        self.settle(result, snapshot, &format!("mark_read id={id}"))
    }

    pub async fn mark_all_read(&self) -> Result<()> {
        let snapshot = self.lock_cache()?.begin_mark_all_read();
        let result = match self.api() {
            Ok(api) => api.mark_all_read().await,
            Err(error) => Err(error),
        };
        self.settle(result, snapshot, "mark_all_read")
    }

    fn settle(&self, result: Result<()>, snapshot: ReadSnapshot, action: &str) -> Result<()> {
        if let Err(error) = result {
            warn!("{action} failed, reverting optimistic update: {error}");
            if snapshot.is_empty() {
                return Err(error);
            }
            match self.cache.lock() {
                Ok(mut cache) => cache.rollback(snapshot),
                Err(_) => warn!("notification cache lock poisoned; rollback skipped"),
            }
            return Err(error);
        }
        Ok(())
    }

    pub fn unread_count(&self) -> Result<usize> {
        Ok(self.lock_cache()?.unread_count())
    }

    pub async fn server_unread_count(&self) -> Result<u64> {
        self.api()?.unread_count().await
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<Notification>> {
        Ok(self.lock_cache()?.recent(limit))
    }

    /// Disconnects, drops every cached notification and forgets the token.
    pub fn logout(&mut self) -> Result<()> {
        self.stream.disconnect();
        self.lock_cache()?.clear();
        self.apply_token(None)?;
        self.token_store.clear()?;
        info!("logged out; notification cache cleared");
        Ok(())
    }
}

fn load_token(store: &dyn TokenStore) -> Option<String> {
    let token = store.load().unwrap_or_else(|error| {
        warn!("failed to load token: {error}");
        None
    });
    if token.is_none() {
        info!("no stored token; REST sync disabled");
    }
    token
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::FileTokenStore;

    fn notification(id: i64, is_read: bool) -> Notification {
        Notification {
            id,
            kind: "invoice_issued".to_string(),
            title: format!("Invoice #{id}"),
            message: String::new(),
            created_at: None,
            is_read,
        }
    }

    #[test]
    fn applies_frames_to_cache() {
        let mut cache = NotificationCache::new();
        apply_stream_message(&mut cache, &StreamMessage::Notification(notification(1, false)));
        apply_stream_message(
            &mut cache,
            &StreamMessage::UnreadList(vec![notification(1, true), notification(2, false)]),
        );
        apply_stream_message(&mut cache, &StreamMessage::Unrecognized);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.unread_count(), 1);
    }

    fn offline_center(dir: &tempfile::TempDir, token: Option<&str>) -> NotificationCenter {
        let store = FileTokenStore::new(dir.path().join("storage.json"), "access_token");
        if let Some(token) = token {
            store.save(token).unwrap();
        }
        let settings = Settings {
            local_host: "127.0.0.1:9".to_string(),
            api_base_url: "http://127.0.0.1:9/api".to_string(),
            ..Settings::default()
        };
        NotificationCenter::new(settings, Box::new(store)).unwrap()
    }

    #[tokio::test]
    async fn failed_mark_read_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let center = offline_center(&dir, Some("tok"));
        center.cache().lock().unwrap().upsert_one(notification(7, false));

        assert!(center.mark_read(7).await.is_err());
        assert_eq!(center.unread_count().unwrap(), 1);

        center.cache().lock().unwrap().upsert_one(notification(8, false));
        assert!(center.mark_all_read().await.is_err());
        assert_eq!(center.unread_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn missing_token_rolls_back_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let center = offline_center(&dir, None);
        center.cache().lock().unwrap().upsert_one(notification(3, false));

        assert!(matches!(center.mark_read(3).await, Err(Error::MissingToken)));
        assert_eq!(center.unread_count().unwrap(), 1);
        assert!(matches!(center.refresh().await, Err(Error::MissingToken)));
    }

    #[tokio::test]
    async fn logout_clears_cache_and_token() {
        let dir = tempfile::tempdir().unwrap();
        let mut center = offline_center(&dir, Some("tok"));
        center.cache().lock().unwrap().upsert_one(notification(1, false));

        center.logout().unwrap();
        assert_eq!(center.recent(10).unwrap(), Vec::new());
        assert_eq!(center.stream().state(), ConnectionState::Disconnected);
        let store = FileTokenStore::new(dir.path().join("storage.json"), "access_token");
        assert_eq!(store.load().unwrap(), None);
    }

    #[tokio::test]
    async fn logout_drops_token_from_stream_url() {
        let dir = tempfile::tempdir().unwrap();
        let mut center = offline_center(&dir, Some("secret-tok"));
        assert!(center.stream().config().url.ends_with("?token=secret-tok"));

        center.logout().unwrap();
        assert_eq!(
            center.stream().config().url,
            "ws://127.0.0.1:9/ws/notifications/"
        );

        center.start().unwrap();
        assert!(!center.stream().config().url.contains("token="));
        assert!(matches!(center.refresh().await, Err(Error::MissingToken)));
        center.stop();
    }

    #[tokio::test]
    async fn start_picks_up_token_saved_after_construction() {
        let dir = tempfile::tempdir().unwrap();
        let mut center = offline_center(&dir, None);
        assert!(!center.stream().config().url.contains("token="));

        let store = FileTokenStore::new(dir.path().join("storage.json"), "access_token");
        store.save("late-tok").unwrap();
        center.start().unwrap();
        assert!(center.stream().config().url.ends_with("?token=late-tok"));
        center.stop();

        center.login("  fresh-tok ").unwrap();
        assert!(center.stream().config().url.ends_with("?token=fresh-tok"));
        assert_eq!(store.load().unwrap(), Some("fresh-tok".to_string()));
    }
}
