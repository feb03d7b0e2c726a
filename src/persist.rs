//! Persisted-state blobs.
//!
//! Each subsystem's durable state (DNS cache, HSTS list, tracker block
//! statistics, HTTP/3 session tickets, compression cache index) is
//! serialized as an opaque blob keyed by subsystem name: a 4-byte magic,
//! a u16 version, then a bincode body. Unknown magics or versions are
//! rejected; the owning subsystem then simply starts empty.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};

const MAGIC: &[u8; 4] = b"NBS1";
const VERSION: u16 = 1;

/// Blob store rooted at one directory, one file per subsystem.
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> CoreResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Serialize `value` as the blob for `subsystem`.
    pub fn save<T: Serialize>(&self, subsystem: &str, value: &T) -> CoreResult<()> {
        let body = bincode::serialize(value)
            .map_err(|e| CoreError::Codec(format!("{subsystem} blob encode: {e}")))?;
        let mut blob = Vec::with_capacity(body.len() + 6);
        blob.extend_from_slice(MAGIC);
        blob.extend_from_slice(&VERSION.to_be_bytes());
        blob.extend_from_slice(&body);

        let path = self.blob_path(subsystem);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &blob)?;
        std::fs::rename(&tmp, &path)?;
        debug!("persisted {subsystem} blob ({} bytes)", blob.len());
        Ok(())
    }

    /// Load and decode the blob for `subsystem`. `Ok(None)` when no blob
    /// exists yet.
    pub fn load<T: DeserializeOwned>(&self, subsystem: &str) -> CoreResult<Option<T>> {
        let path = self.blob_path(subsystem);
        let blob = match std::fs::read(&path) {
            Ok(blob) => blob,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if blob.len() < 6 || &blob[..4] != MAGIC {
            return Err(CoreError::Config(format!(
                "{subsystem} blob has an unrecognized header"
            )));
        }
        let version = u16::from_be_bytes([blob[4], blob[5]]);
        if version != VERSION {
            return Err(CoreError::Config(format!(
                "{subsystem} blob version {version} is not supported"
            )));
        }
        let value = bincode::deserialize(&blob[6..])
            .map_err(|e| CoreError::Codec(format!("{subsystem} blob decode: {e}")))?;
        Ok(Some(value))
    }

    /// Load, mapping any corruption to an empty start with a warning.
    pub fn load_or_default<T: DeserializeOwned + Default>(&self, subsystem: &str) -> T {
        match self.load(subsystem) {
            Ok(Some(value)) => value,
            Ok(None) => T::default(),
            Err(e) => {
                warn!("discarding unreadable {subsystem} blob: {e}");
                T::default()
            }
        }
    }

    fn blob_path(&self, subsystem: &str) -> PathBuf {
        self.root.join(format!("{subsystem}.blob"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
    struct Sample {
        names: Vec<String>,
        count: u64,
    }

    #[test]
    fn blobs_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path()).unwrap();
        let sample = Sample {
            names: vec!["a".into(), "b".into()],
            count: 7,
        };
        store.save("dns-cache", &sample).unwrap();
        let loaded: Sample = store.load("dns-cache").unwrap().unwrap();
        assert_eq!(loaded, sample);
    }

    #[test]
    fn missing_blob_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path()).unwrap();
        assert!(store.load::<Sample>("never-saved").unwrap().is_none());
    }

    #[test]
    fn wrong_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path()).unwrap();
        store.save("tickets", &Sample::default()).unwrap();

        // Bump the version byte in place.
        let path = dir.path().join("tickets.blob");
        let mut blob = std::fs::read(&path).unwrap();
        blob[5] = 9;
        std::fs::write(&path, &blob).unwrap();

        assert!(matches!(
            store.load::<Sample>("tickets"),
            Err(CoreError::Config(_))
        ));
        // load_or_default degrades to the empty state.
        let fallback: Sample = store.load_or_default("tickets");
        assert_eq!(fallback, Sample::default());
    }

    #[test]
    fn corrupt_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("hsts.blob"), b"JUNKDATA").unwrap();
        assert!(store.load::<Sample>("hsts").is_err());
    }
}
