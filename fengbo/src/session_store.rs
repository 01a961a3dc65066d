// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use sha1::{Digest, Sha1};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, ErrorKind};
use crate::session::{unix_seconds_now, SessionState};

/// Persistence contract of the session state.
///
/// The store may be shared with application code; the client serialises
/// its own calls, and a partially written document must never come back
/// as a valid load.
pub trait SessionStore {
    /// Persist `state` under `client_id`.
    ///
    /// # Errors
    ///
    /// Returns `SessionStoreError` if the document cannot be written.
    fn save(&self, client_id: &str, state: &SessionState) -> Result<(), Error>;

    /// Load the state saved under `client_id`, or `None`.
    ///
    /// # Errors
    ///
    /// Returns `SessionStoreError` if the stored document is corrupt.
    fn load(&self, client_id: &str) -> Result<Option<SessionState>, Error>;

    /// Remove the state saved under `client_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns `SessionStoreError` if removal fails.
    fn delete(&self, client_id: &str) -> Result<(), Error>;

    /// Check whether state is saved under `client_id`.
    ///
    /// # Errors
    ///
    /// Returns `SessionStoreError` if the store is unreadable.
    fn exists(&self, client_id: &str) -> Result<bool, Error>;
}

/// File-backed session store: one JSON document per client id.
///
/// Writes go to a temporary sibling file first and are moved into place
/// with a rename, so a crash mid-write leaves either the old document
/// or none. Client ids that are not strictly filename safe are mapped
/// to `mqtt_<sha1-hex>` to keep path separators out of the directory.
pub struct FileSessionStore {
    dir: PathBuf,
    default_expiry: Option<Duration>,
}

impl FileSessionStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns `SessionStoreError` if the directory cannot be created.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|err| {
            Error::from_string(
                ErrorKind::SessionStoreError,
                format!("Failed to create session dir {dir:?}: {err}"),
            )
        })?;
        Ok(Self {
            dir,
            default_expiry: None,
        })
    }

    /// Derive a store that treats documents older than `expiry` as
    /// gone: an expired load deletes the file and returns `None`.
    #[must_use]
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.default_expiry = Some(expiry);
        self
    }

    fn store_error(action: &str, err: &std::io::Error) -> Error {
        Error::from_string(
            ErrorKind::SessionStoreError,
            format!("Failed to {action}: {err}"),
        )
    }

    fn path_for(&self, client_id: &str) -> PathBuf {
        self.dir.join(file_name(client_id))
    }

    fn is_expired(&self, state: &SessionState) -> bool {
        self.default_expiry.is_some_and(|expiry| {
            unix_seconds_now().saturating_sub(state.saved_at()) > expiry.as_secs()
        })
    }

    /// Scan the directory and remove every expired document, returning
    /// the number removed.
    ///
    /// # Errors
    ///
    /// Returns `SessionStoreError` if the directory cannot be read.
    pub fn cleanup(&self) -> Result<usize, Error> {
        let Some(_expiry) = self.default_expiry else {
            return Ok(0);
        };
        let mut removed = 0;
        let entries =
            fs::read_dir(&self.dir).map_err(|err| Self::store_error("read session dir", &err))?;
        for entry in entries {
            let entry = entry.map_err(|err| Self::store_error("read session dir", &err))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Ok(bytes) = fs::read(&path) else {
                continue;
            };
            let Ok(state) = serde_json::from_slice::<SessionState>(&bytes) else {
                continue;
            };
            if self.is_expired(&state) {
                fs::remove_file(&path)
                    .map_err(|err| Self::store_error("remove expired session", &err))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

impl SessionStore for FileSessionStore {
    fn save(&self, client_id: &str, state: &SessionState) -> Result<(), Error> {
        let document = serde_json::to_vec_pretty(state)?;
        let path = self.path_for(client_id);
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, document)
            .map_err(|err| Self::store_error("write session document", &err))?;
        fs::rename(&tmp_path, &path)
            .map_err(|err| Self::store_error("move session document", &err))?;
        Ok(())
    }

    fn load(&self, client_id: &str) -> Result<Option<SessionState>, Error> {
        let path = self.path_for(client_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Self::store_error("read session document", &err)),
        };
        let state: SessionState = serde_json::from_slice(&bytes)?;
        if self.is_expired(&state) {
            log::info!("session_store: session of `{client_id}` expired, removing");
            let _ = fs::remove_file(&path);
            return Ok(None);
        }
        Ok(Some(state))
    }

    fn delete(&self, client_id: &str) -> Result<(), Error> {
        match fs::remove_file(self.path_for(client_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Self::store_error("remove session document", &err)),
        }
    }

    fn exists(&self, client_id: &str) -> Result<bool, Error> {
        Ok(self.path_for(client_id).is_file())
    }
}

/// Check whether `client_id` can be used as a filename directly.
fn is_filename_safe(client_id: &str) -> bool {
    !client_id.is_empty()
        && client_id.len() <= 64
        && client_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Map a client id to its on-disk filename.
///
/// Hostile ids (path separators, dots, overlong strings) are replaced
/// by `mqtt_<sha1-hex>` so they cannot traverse out of the store
/// directory.
#[must_use]
pub fn file_name(client_id: &str) -> String {
    if is_filename_safe(client_id) {
        return client_id.to_string();
    }
    let digest = Sha1::digest(client_id.as_bytes());
    let mut name = String::with_capacity(5 + 40);
    name.push_str("mqtt_");
    for byte in digest {
        let _ = write!(name, "{byte:02x}");
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SubscriptionEntry;
    use codec::QoS;
    use std::env;

    fn temp_store(tag: &str) -> FileSessionStore {
        let dir = env::temp_dir().join(format!("fengbo-session-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        FileSessionStore::new(dir).unwrap()
    }

    #[test]
    fn test_file_name_safety() {
        assert_eq!(file_name("test-A"), "test-A");
        assert_eq!(file_name("dev_01"), "dev_01");

        for hostile in ["../../etc/passwd", "a/b", "id with space", "", "日本語"] {
            let name = file_name(hostile);
            assert!(name.starts_with("mqtt_"));
            assert_eq!(name.len(), 45);
            assert!(!name.contains('/'));
            assert!(name[5..].chars().all(|c| c.is_ascii_hexdigit()));
        }

        let long_id = "x".repeat(65);
        assert!(file_name(&long_id).starts_with("mqtt_"));
    }

    #[test]
    fn test_save_load_round_trip() {
        let store = temp_store("round-trip");
        let mut state = SessionState::new();
        state.insert_subscription(
            "sensors/#",
            SubscriptionEntry {
                qos: QoS::AtLeastOnce,
                options: None,
            },
        );
        state.add_pending_qos2(42);
        state.touch();

        store.save("client-1", &state).unwrap();
        assert!(store.exists("client-1").unwrap());
        let loaded = store.load("client-1").unwrap().unwrap();
        assert_eq!(loaded, state);

        store.delete("client-1").unwrap();
        assert!(!store.exists("client-1").unwrap());
        assert!(store.load("client-1").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_document_is_an_error() {
        let store = temp_store("corrupt");
        fs::write(store.path_for("broken"), b"{\"subscriptions\":").unwrap();
        let err = store.load("broken").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionStoreError);
    }

    #[test]
    fn test_expired_session_is_dropped() {
        let store = temp_store("expiry").with_expiry(Duration::from_secs(10));
        // saved_at stays 0, far past any expiry window.
        let state = SessionState::new();
        store.save("stale", &state).unwrap();
        assert!(store.load("stale").unwrap().is_none());
        assert!(!store.exists("stale").unwrap());
    }

    #[test]
    fn test_cleanup_removes_expired_files() {
        let store = temp_store("cleanup").with_expiry(Duration::from_secs(10));
        let stale = SessionState::new();
        store.save("stale-1", &stale).unwrap();
        store.save("stale-2", &stale).unwrap();
        let mut fresh = SessionState::new();
        fresh.touch();
        store.save("fresh", &fresh).unwrap();

        assert_eq!(store.cleanup().unwrap(), 2);
        assert!(store.exists("fresh").unwrap());
    }
}
