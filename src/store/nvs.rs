//! NVS persistence for the config document.
//!
//! The document is stored as a single NVS blob, so a write replaces it
//! atomically.

use super::Storage;
use esp_idf_svc::nvs::{EspNvs, EspNvsPartition, NvsDefault};
use esp_idf_sys::EspError;
use std::io;
use std::sync::{Mutex, PoisonError};

/// NVS namespace for the config document.
const NVS_NAMESPACE: &str = "wifi_config";

/// NVS key for the document blob.
const NVS_KEY: &str = "document";

/// Maximum document size read back from NVS.
const MAX_DOCUMENT_SIZE: usize = 1024;

/// Config document in the default NVS partition.
pub struct NvsStorage {
    nvs: Mutex<EspNvs<NvsDefault>>,
}

impl NvsStorage {
    /// Open the config namespace in the default NVS partition.
    pub fn take() -> Result<Self, EspError> {
        let partition = EspNvsPartition::<NvsDefault>::take()?;
        Self::new(partition)
    }

    /// Open the config namespace in an already-taken partition.
    pub fn new(partition: EspNvsPartition<NvsDefault>) -> Result<Self, EspError> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)?;
        Ok(Self {
            nvs: Mutex::new(nvs),
        })
    }
}

fn to_io(e: EspError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

impl Storage for NvsStorage {
    fn read(&self) -> io::Result<Option<Vec<u8>>> {
        let nvs = self.nvs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut buf = [0u8; MAX_DOCUMENT_SIZE];
        let bytes = nvs.get_raw(NVS_KEY, &mut buf).map_err(to_io)?;
        if bytes.is_none() {
            log::debug!("No config found in NVS");
        }
        Ok(bytes.map(<[u8]>::to_vec))
    }

    fn write(&self, data: &[u8]) -> io::Result<()> {
        if data.len() > MAX_DOCUMENT_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "config document too large: {} bytes (max {})",
                    data.len(),
                    MAX_DOCUMENT_SIZE
                ),
            ));
        }
        let mut nvs = self.nvs.lock().unwrap_or_else(PoisonError::into_inner);
        nvs.set_raw(NVS_KEY, data).map_err(to_io)?;
        Ok(())
    }

    fn remove(&self) -> io::Result<bool> {
        let mut nvs = self.nvs.lock().unwrap_or_else(PoisonError::into_inner);
        nvs.remove(NVS_KEY).map_err(to_io)
    }
}
