use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;

use super::credential::{Credential, ExpiryPolicy};
use super::error::{SessionError, SessionResult};

/// Snapshot of the cached session for operators.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub path: PathBuf,
    pub present: bool,
    pub username: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub age_seconds: Option<i64>,
    pub expired: bool,
}

/// Owns the on-disk session file and an in-memory copy of it.
#[derive(Debug)]
pub struct SessionStore {
    path: PathBuf,
    policy: ExpiryPolicy,
    clock: Arc<dyn Clock>,
    cache: Mutex<Option<Credential>>,
}

impl SessionStore {
    pub fn new(path: impl AsRef<Path>, policy: ExpiryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            policy,
            clock,
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> ExpiryPolicy {
        self.policy
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Returns the cached credential for `username` if one exists and has not expired.
    pub fn load_valid(&self, username: &str) -> SessionResult<Option<Credential>> {
        let now = self.clock.now();
        let mut cache = self.cache();
        if cache.is_none() {
            *cache = self.read_file()?;
        }
        let Some(credential) = cache.as_ref() else {
            return Ok(None);
        };
        if credential.username != username {
            info!(
                cached = %credential.username,
                configured = %username,
                "cached session belongs to another account"
            );
            return Ok(None);
        }
        if self.policy.is_expired(credential, now) {
            debug!(issued_at = %credential.issued_at, "cached session expired");
            return Ok(None);
        }
        Ok(Some(credential.clone()))
    }

    pub fn save(&self, credential: &Credential) -> SessionResult<()> {
        let content = serde_json::to_vec_pretty(credential)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| SessionError::Io {
                    source,
                    path: parent.to_path_buf(),
                })?;
            }
        }
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, content).map_err(|source| SessionError::Io {
            source,
            path: temp_path.clone(),
        })?;
        restrict_permissions(&temp_path)?;
        fs::rename(&temp_path, &self.path).map_err(|source| SessionError::Io {
            source,
            path: self.path.clone(),
        })?;
        *self.cache() = Some(credential.clone());
        debug!(path = %self.path.display(), "session persisted");
        Ok(())
    }

    /// Drops the cached session. Returns whether a file was removed.
    pub fn clear(&self) -> SessionResult<bool> {
        *self.cache() = None;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(SessionError::Io {
                source,
                path: self.path.clone(),
            }),
        }
    }

    /// Clears the session only if it still holds `service_token`; a newer login is left alone.
    pub fn invalidate_if_matches(&self, service_token: &str) -> SessionResult<bool> {
        let current = {
            let mut cache = self.cache();
            if cache.is_none() {
                *cache = self.read_file()?;
            }
            cache.clone()
        };
        match current {
            Some(credential) if credential.service_token == service_token => {
                warn!(username = %credential.username, "invalidating rejected session");
                self.clear()
            }
            _ => Ok(false),
        }
    }

    pub fn status(&self) -> SessionResult<SessionStatus> {
        let now = self.clock.now();
        let credential = self.read_file()?;
        Ok(match credential {
            Some(credential) => SessionStatus {
                path: self.path.clone(),
                present: true,
                username: Some(credential.username.clone()),
                issued_at: Some(credential.issued_at),
                expires_at: Some(self.policy.expires_at(&credential)),
                age_seconds: Some(credential.age(now).num_seconds()),
                expired: self.policy.is_expired(&credential, now),
            },
            None => SessionStatus {
                path: self.path.clone(),
                present: false,
                username: None,
                issued_at: None,
                expires_at: None,
                age_seconds: None,
                expired: false,
            },
        })
    }

    fn read_file(&self) -> SessionResult<Option<Credential>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SessionError::Io {
                    source,
                    path: self.path.clone(),
                })
            }
        };
        match serde_json::from_slice::<Credential>(&bytes) {
            Ok(credential) => Ok(Some(credential)),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "ignoring unreadable session file");
                Ok(None)
            }
        }
    }

    fn cache(&self) -> MutexGuard<'_, Option<Credential>> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> SessionResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|source| {
        SessionError::Io {
            source,
            path: path.to_path_buf(),
        }
    })
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> SessionResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::session::LoginGrant;
    use chrono::{Duration, TimeZone};
    use tempfile::tempdir;

    fn grant(token: &str) -> LoginGrant {
        LoginGrant {
            user_id: "42".into(),
            service_token: token.into(),
            ssecurity: Some("sec".into()),
            cuser_id: None,
            pass_token: None,
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn missing_file_means_no_session() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(start()));
        let store = SessionStore::new(dir.path().join("session.json"), ExpiryPolicy::default(), clock);
        assert!(store.load_valid("alice").unwrap().is_none());
        assert!(!store.status().unwrap().present);
        assert!(!store.clear().unwrap());
    }

    #[test]
    fn saved_session_survives_a_new_store_until_expiry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");
        let clock = Arc::new(ManualClock::new(start()));
        let store = SessionStore::new(&path, ExpiryPolicy::from_hours(24), clock.clone());
        store
            .save(&Credential::from_grant("alice", grant("t1"), start()))
            .unwrap();

        let reopened = SessionStore::new(&path, ExpiryPolicy::from_hours(24), clock.clone());
        let loaded = reopened.load_valid("alice").unwrap().unwrap();
        assert_eq!(loaded.service_token, "t1");
        assert!(reopened.load_valid("bob").unwrap().is_none());

        clock.advance(Duration::hours(25));
        assert!(reopened.load_valid("alice").unwrap().is_none());
        let status = reopened.status().unwrap();
        assert!(status.present);
        assert!(status.expired);
        assert_eq!(status.age_seconds, Some(25 * 3600));
    }

    #[test]
    fn corrupted_file_is_treated_as_absent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        fs::write(&path, b"{not json").unwrap();
        let store = SessionStore::new(
            &path,
            ExpiryPolicy::default(),
            Arc::new(ManualClock::new(start())),
        );
        assert!(store.load_valid("alice").unwrap().is_none());
    }

    #[test]
    fn invalidation_only_clears_matching_token() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        let store = SessionStore::new(
            &path,
            ExpiryPolicy::default(),
            Arc::new(ManualClock::new(start())),
        );
        store
            .save(&Credential::from_grant("alice", grant("fresh"), start()))
            .unwrap();
        assert!(!store.invalidate_if_matches("stale").unwrap());
        assert!(path.exists());
        assert!(store.invalidate_if_matches("fresh").unwrap());
        assert!(!path.exists());
        assert!(store.load_valid("alice").unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn session_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        let store = SessionStore::new(
            &path,
            ExpiryPolicy::default(),
            Arc::new(ManualClock::new(start())),
        );
        store
            .save(&Credential::from_grant("alice", grant("t"), start()))
            .unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
