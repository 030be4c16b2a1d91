//! Live notification sync for the utility connections dashboard.
//!
//! A [`NotificationStream`] keeps one WebSocket open to the notification
//! endpoint and reconnects with exponential backoff. Frames are classified by
//! [`classify`] and merged into a [`NotificationCache`]; the
//! [`NotificationCenter`] ties that together with the REST endpoints, which
//! remain the source of truth.

pub mod api;
pub mod backoff;
pub mod cache;
pub mod classify;
mod consts;
mod util;
pub mod diagnostics;
pub mod error;
pub mod model;
pub mod settings;
pub mod stream;
pub mod sync;
pub mod token;

pub use api::{ApiClient, NotificationPage};
pub use backoff::ReconnectPolicy;
pub use cache::{NotificationCache, ReadSnapshot};
pub use classify::{classify, classify_text, StreamMessage};
pub use diagnostics::RuntimeDiagnostics;
pub use error::{Error, Result};
pub use model::{ConnectionState, Notification, OutboundFrame};
pub use settings::{Environment, Settings};
pub use stream::{NotificationStream, StreamConfig};
pub use sync::{apply_stream_message, NotificationCenter};
pub use token::{resolve_token, FileTokenStore, KeyringTokenStore, TokenStore};
