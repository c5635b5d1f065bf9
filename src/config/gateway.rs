use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use secrecy::SecretString;
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::fs;

use crate::session::SessionSettings;

// -----------------------------------------------------------------------------
// ----- Singleton -------------------------------------------------------------

static GATEWAY: OnceCell<GatewayConfigHandle> = OnceCell::new();

#[derive(Debug)]
struct GatewayConfigHandle {
    inner: Arc<RwLock<GatewayConfig>>,
}

// -----------------------------------------------------------------------------
// ----- GatewayConfig ---------------------------------------------------------

/// Resolved contents of the gateway TOML file.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub backend: BackendSettings,
    pub slots: SlotSettings,
    pub session: SessionSettings,
    pub tls: Option<TlsSettings>,
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub url: String,
    pub pool_size: usize,
    pub credentials_file: Option<PathBuf>,
    pub token: Option<SecretString>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSettings {
    pub prefix: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    pub cert: PathBuf,
    pub key: PathBuf,
}

// -----------------------------------------------------------------------------
// ----- GatewayConfig: Static -------------------------------------------------

impl GatewayConfig {
    /// Init: panic on any error. Do not start with a bad config.
    pub async fn init(path: &Path) {
        let cfg = Self::from_file_async(path)
            .await
            .unwrap_or_else(|e| panic!("failed to load gateway config from {:?}: {e}", path));

        GATEWAY
            .set(GatewayConfigHandle {
                inner: Arc::new(RwLock::new(cfg)),
            })
            .unwrap_or_else(|_| panic!("GatewayConfig::init called twice"));
    }

    pub fn snapshot() -> GatewayConfig {
        handle().inner.read().clone()
    }
}

// -----------------------------------------------------------------------------
// ----- GatewayConfig: Private ------------------------------------------------

impl GatewayConfig {
    async fn from_file_async(path: &Path) -> Result<GatewayConfig, GatewayConfigError> {
        let raw = fs::read_to_string(path)
            .await
            .map_err(|e| GatewayConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        Self::parse(&raw)
    }

    fn parse(raw: &str) -> Result<GatewayConfig, GatewayConfigError> {
        let doc: GatewayFile =
            toml::from_str(raw).map_err(|e| GatewayConfigError::Toml { source: e })?;
        validate(&doc)?;

        let defaults = SessionSettings::default();
        let session = SessionSettings {
            inbound_capacity: doc.session.inbound_capacity.unwrap_or(defaults.inbound_capacity),
            outbound_capacity: doc
                .session
                .outbound_capacity
                .unwrap_or(defaults.outbound_capacity),
            inactivity_timeout: doc
                .session
                .inactivity_timeout
                .unwrap_or(defaults.inactivity_timeout),
            reply_timeout: doc.session.reply_timeout.unwrap_or(defaults.reply_timeout),
        };
        validate_session(&session)?;

        let tls = match (doc.tls.cert, doc.tls.key) {
            (Some(cert), Some(key)) => Some(TlsSettings { cert, key }),
            (None, None) => None,
            _ => return Err(GatewayConfigError::InvalidField("tls: cert and key go together".into())),
        };

        Ok(GatewayConfig {
            backend: BackendSettings {
                url: doc.backend.url,
                pool_size: doc.backend.pool_size,
                credentials_file: doc.backend.credentials_file,
                token: doc.backend.token.map(|t| SecretString::new(t.into_boxed_str())),
            },
            slots: SlotSettings {
                prefix: doc.slots.prefix,
                count: doc.slots.count,
            },
            session,
            tls,
        })
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: On-disk format ----------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct GatewayFile {
    backend: BackendEntry,
    slots: SlotsEntry,
    #[serde(default)]
    session: SessionEntry,
    #[serde(default)]
    tls: TlsEntry,
}

#[derive(Debug, Clone, Deserialize)]
struct BackendEntry {
    url: String,
    #[serde(default = "default_pool_size")]
    pool_size: usize,
    credentials_file: Option<PathBuf>,
    token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlotsEntry {
    #[serde(default = "default_slot_prefix")]
    prefix: String,
    count: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SessionEntry {
    inbound_capacity: Option<usize>,
    outbound_capacity: Option<usize>,
    #[serde(default, deserialize_with = "de_duration")]
    inactivity_timeout: Option<Duration>,
    #[serde(default, deserialize_with = "de_duration")]
    reply_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TlsEntry {
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
}

fn default_pool_size() -> usize {
    4
}

fn default_slot_prefix() -> String {
    "voice".to_string()
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn handle() -> &'static GatewayConfigHandle {
    GATEWAY.get().expect("GatewayConfig not initialized")
}

fn validate(doc: &GatewayFile) -> Result<(), GatewayConfigError> {
    if doc.backend.url.trim().is_empty() {
        return Err(GatewayConfigError::InvalidField("backend.url".into()));
    }
    if doc.slots.prefix.trim().is_empty() {
        return Err(GatewayConfigError::InvalidField("slots.prefix".into()));
    }
    if doc.slots.count == 0 {
        return Err(GatewayConfigError::InvalidField("slots.count".into()));
    }
    Ok(())
}

fn validate_session(session: &SessionSettings) -> Result<(), GatewayConfigError> {
    if session.inbound_capacity == 0 {
        return Err(GatewayConfigError::InvalidField("session.inbound_capacity".into()));
    }
    if session.outbound_capacity == 0 {
        return Err(GatewayConfigError::InvalidField("session.outbound_capacity".into()));
    }
    if session.reply_timeout >= session.inactivity_timeout {
        return Err(GatewayConfigError::InvalidField(
            "session.reply_timeout must be shorter than session.inactivity_timeout".into(),
        ));
    }
    Ok(())
}

/// Accepts integer milliseconds (`30000`) or a humantime string (`"30s"`).
fn de_duration<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{Error, Unexpected, Visitor};
    use std::fmt;

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Option<Duration>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("milliseconds (e.g. 30000) or a duration string (e.g. \"30s\")")
        }

        fn visit_u64<E: Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(Duration::from_millis(v)))
        }

        fn visit_i64<E: Error>(self, v: i64) -> Result<Self::Value, E> {
            if v < 0 {
                return Err(E::invalid_value(Unexpected::Signed(v), &self));
            }
            Ok(Some(Duration::from_millis(v as u64)))
        }

        fn visit_str<E: Error>(self, v: &str) -> Result<Self::Value, E> {
            humantime::parse_duration(v)
                .map(Some)
                .map_err(|_| E::invalid_value(Unexpected::Str(v), &self))
        }
    }

    d.deserialize_any(DurationVisitor)
}

// -----------------------------------------------------------------------------
// ----- Errors ----------------------------------------------------------------

#[derive(Debug, Error)]
pub enum GatewayConfigError {
    #[error("invalid or missing field '{0}'")]
    InvalidField(String),

    #[error("read error for {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("toml parse error: {source}")]
    Toml { source: toml::de::Error },
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
