//! Versioned credential persistence.
//!
//! The config is one JSON document:
//!
//! ```json
//! { "version": 2, "wifi": { "ssid": "Home", "password": "hunter22" } }
//! ```
//!
//! Version 1 documents (no `version` key, `ssid`/`password` at the top
//! level) are migrated on load and the migrated form is written back.
//! Unknown top-level keys of a current document survive a save. A missing
//! or unreadable document means "no credentials", never an error.
//!
//! # Example
//!
//! ```
//! use picore_w::store::{ConfigStore, MemoryStorage};
//!
//! let store = ConfigStore::new(MemoryStorage::new());
//! store.save_wifi_credentials("Home", "hunter22").unwrap();
//! assert_eq!(store.get_wifi_credentials().unwrap().ssid(), "Home");
//! assert_eq!(store.get_version(), 2);
//! ```

#[cfg(feature = "esp32")]
mod nvs;
mod storage;

#[cfg(feature = "esp32")]
pub use nvs::NvsStorage;
pub use storage::{FileStorage, MemoryStorage, Storage};

use crate::config::{Credentials, CredentialsError};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::io;
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Current document version.
pub const CONFIG_VERSION: u32 = 2;

/// Station section of the document.
#[derive(Clone, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct WifiSection {
    #[serde(default)]
    ssid: String,
    #[serde(default)]
    password: String,
}

/// A loaded document, already migrated to the current layout.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoredConfig {
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    wifi: Option<WifiSection>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl WifiSection {
    fn from_credentials(creds: &Credentials) -> Self {
        Self {
            ssid: creds.ssid().to_string(),
            password: creds.password().to_string(),
        }
    }
}

impl StoredConfig {
    fn with_credentials(creds: &Credentials) -> Self {
        Self {
            version: CONFIG_VERSION,
            wifi: Some(WifiSection::from_credentials(creds)),
            extra: Map::new(),
        }
    }

    /// Document version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Stored credentials, if present and valid.
    pub fn credentials(&self) -> Option<Credentials> {
        let wifi = self.wifi.as_ref()?;
        match Credentials::new(wifi.ssid.as_str(), wifi.password.as_str()) {
            Ok(creds) => Some(creds),
            Err(e) => {
                warn!("Ignoring stored credentials: {}", e);
                None
            }
        }
    }

    /// Top-level keys this crate does not interpret.
    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }
}

impl fmt::Debug for StoredConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredConfig")
            .field("version", &self.version)
            .field("ssid", &self.wifi.as_ref().map(|w| w.ssid.as_str()))
            .field("extra", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Turn a version-1 document into the current layout.
///
/// Returns `None` if the document is already current.
fn migrate(doc: &Map<String, Value>) -> Option<Value> {
    let version = doc.get("version").and_then(Value::as_u64).unwrap_or(1);
    if version >= u64::from(CONFIG_VERSION) {
        return None;
    }
    let field = |key: &str| {
        doc.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    Some(serde_json::json!({
        "version": CONFIG_VERSION,
        "wifi": { "ssid": field("ssid"), "password": field("password") },
    }))
}

/// Credential store over a [`Storage`] backend.
///
/// Cheap to clone; clones share the backend.
#[derive(Clone)]
pub struct ConfigStore {
    storage: Arc<dyn Storage>,
}

impl ConfigStore {
    /// Store over `storage`.
    pub fn new(storage: impl Storage + 'static) -> Self {
        Self {
            storage: Arc::new(storage),
        }
    }

    /// Store over a shared backend.
    pub fn from_shared(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Load and migrate the stored document.
    ///
    /// Returns `None` if nothing is stored or the document is unreadable.
    pub fn load(&self) -> Option<StoredConfig> {
        let mut bytes = match self.storage.read() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read config: {}", e);
                return None;
            }
        };
        let parsed = serde_json::from_slice::<Value>(&bytes);
        bytes.zeroize();

        let doc = match parsed {
            Ok(Value::Object(doc)) => doc,
            Ok(_) => {
                warn!("Error loading config: not a JSON object");
                return None;
            }
            Err(e) => {
                warn!("Error loading config: {}", e);
                return None;
            }
        };

        let value = match migrate(&doc) {
            Some(migrated) => {
                info!("Migrating config to version {}", CONFIG_VERSION);
                if let Err(e) = self.write_value(&migrated) {
                    warn!("Failed to save migrated config: {}", e);
                }
                migrated
            }
            None => Value::Object(doc),
        };

        match serde_json::from_value::<StoredConfig>(value) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Error loading config: {}", e);
                None
            }
        }
    }

    /// Stored credentials, `None` if absent or invalid.
    pub fn get_wifi_credentials(&self) -> Option<Credentials> {
        self.load()?.credentials()
    }

    /// Persist credentials and confirm the write by reading it back.
    ///
    /// Other top-level keys of a current-version document are kept.
    pub fn save_wifi_credentials(&self, ssid: &str, password: &str) -> Result<(), StoreError> {
        let creds = Credentials::new(ssid, password)?;

        let config = match self.load() {
            Some(mut existing) if existing.version == CONFIG_VERSION => {
                existing.wifi = Some(WifiSection::from_credentials(&creds));
                existing
            }
            _ => StoredConfig::with_credentials(&creds),
        };

        let mut bytes = serde_json::to_vec(&config)?;
        let written = self.storage.write(&bytes);
        bytes.zeroize();
        written?;

        let verified = self
            .load()
            .filter(|c| c.version == CONFIG_VERSION)
            .and_then(|c| c.credentials());
        if verified.as_ref() != Some(&creds) {
            return Err(StoreError::VerificationFailed);
        }

        info!("Config saved for SSID {:?}", creds.ssid());
        Ok(())
    }

    /// Version of the stored document, 0 if nothing valid is stored.
    pub fn get_version(&self) -> u32 {
        self.load().map_or(0, |c| c.version)
    }

    /// Remove the stored document. Returns `false` if there was none.
    pub fn delete_config(&self) -> Result<bool, StoreError> {
        let removed = self.storage.remove()?;
        if removed {
            info!("Config deleted");
        }
        Ok(removed)
    }

    fn write_value(&self, value: &Value) -> Result<(), StoreError> {
        let mut bytes = serde_json::to_vec(value)?;
        let written = self.storage.write(&bytes);
        bytes.zeroize();
        Ok(written?)
    }
}

impl fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigStore").finish_non_exhaustive()
    }
}

/// Config persistence errors.
#[derive(Debug)]
pub enum StoreError {
    /// Backend read/write failed.
    Io(io::Error),
    /// Document could not be encoded.
    Serialize(serde_json::Error),
    /// Read-back did not match what was written.
    VerificationFailed,
    /// Credentials rejected before writing.
    Invalid(CredentialsError),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "storage error: {}", e),
            Self::Serialize(e) => write!(f, "config encoding error: {}", e),
            Self::VerificationFailed => write!(f, "config verification failed"),
            Self::Invalid(e) => write!(f, "invalid credentials: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Serialize(e) => Some(e),
            Self::Invalid(e) => Some(e),
            Self::VerificationFailed => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialize(e)
    }
}

impl From<CredentialsError> for StoreError {
    fn from(e: CredentialsError) -> Self {
        Self::Invalid(e)
    }
}
