use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use ganglion_core::domain::session::{Session, SessionId};

use super::{assemble, ContextRecord, HistoryRecord, SessionStore, StoreError};
use crate::locks::KeyedMutex;

const HISTORY_FILE: &str = "history.json";
const CONTEXT_FILE: &str = "context.json";

/// Directory-per-session store:
///
/// ```text
/// <root>/sessions/<id>/history.json
/// <root>/sessions/<id>/context.json
/// <root>/archive/<id>-<timestamp>/
/// ```
///
/// Every file is written to `<file>.tmp` and renamed over the target, so a
/// reader sees either the previous or the new content.
pub struct FileSessionStore {
    root: PathBuf,
    locks: KeyedMutex,
}

impl FileSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), locks: KeyedMutex::new() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, id: &SessionId) -> PathBuf {
        self.root.join("sessions").join(id.as_str())
    }

    pub fn history_path(&self, id: &SessionId) -> PathBuf {
        self.session_dir(id).join(HISTORY_FILE)
    }

    pub fn context_path(&self, id: &SessionId) -> PathBuf {
        self.session_dir(id).join(CONTEXT_FILE)
    }

    fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }

    async fn write_context(&self, session: &Session) -> Result<(), StoreError> {
        let record = ContextRecord::from_session(session);
        let bytes = serde_json::to_vec_pretty(&record)?;
        write_atomic(&self.context_path(&session.id), &bytes).await
    }

    async fn write_history(&self, session: &Session) -> Result<(), StoreError> {
        let record = HistoryRecord::from_session(session);
        let bytes = serde_json::to_vec_pretty(&record)?;
        write_atomic(&self.history_path(&session.id), &bytes).await
    }

    async fn ensure_session_dir(&self, id: &SessionId) -> Result<(), StoreError> {
        let dir = self.session_dir(id);
        fs::create_dir_all(&dir).await.map_err(|source| StoreError::Io { path: dir, source })
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        let _guard = self.locks.lock(id.as_str()).await;

        let history_path = self.history_path(id);
        let Some(history) = read_record::<HistoryRecord>(&history_path).await? else {
            debug!(event_name = "store.session.miss", session_id = %id, "no stored session");
            return Ok(None);
        };
        if &history.session_id != id {
            return Err(StoreError::Corrupt {
                path: history_path,
                reason: format!("record belongs to session `{}`", history.session_id),
            });
        }

        let context_path = self.context_path(id);
        let context = match read_record::<ContextRecord>(&context_path).await? {
            Some(context) if &context.session_id != id => {
                return Err(StoreError::Corrupt {
                    path: context_path,
                    reason: format!("record belongs to session `{}`", context.session_id),
                });
            }
            Some(context) => context,
            None => ContextRecord::empty(id.clone(), history.last_modified),
        };

        debug!(
            event_name = "store.session.loaded",
            session_id = %id,
            turns = history.turns.len(),
            context_keys = context.values.len(),
            "session loaded"
        );
        Ok(Some(assemble(history, context)))
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        let _guard = self.locks.lock(session.id.as_str()).await;
        self.ensure_session_dir(&session.id).await?;

        // Context first: a crash between the two writes leaves no history,
        // which reads back as a fresh session rather than a mismatched pair.
        self.write_context(session).await?;
        self.write_history(session).await?;

        debug!(
            event_name = "store.session.saved",
            session_id = %session.id,
            status = session.status.as_str(),
            turns = session.history.len(),
            "session saved"
        );
        Ok(())
    }

    async fn save_context_only(&self, session: &Session) -> Result<(), StoreError> {
        let _guard = self.locks.lock(session.id.as_str()).await;
        self.ensure_session_dir(&session.id).await?;
        self.write_context(session).await?;

        debug!(
            event_name = "store.session.context_saved",
            session_id = %session.id,
            context_keys = session.context.len(),
            "session context saved"
        );
        Ok(())
    }

    async fn delete(&self, id: &SessionId) -> Result<bool, StoreError> {
        let _guard = self.locks.lock(id.as_str()).await;
        let dir = self.session_dir(id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(event_name = "store.session.deleted", session_id = %id, "session deleted");
                Ok(true)
            }
            Err(source) if source.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io { path: dir, source }),
        }
    }

    async fn archive(&self, id: &SessionId) -> Result<bool, StoreError> {
        let _guard = self.locks.lock(id.as_str()).await;
        let dir = self.session_dir(id);
        if !path_exists(&dir).await? {
            return Ok(false);
        }

        let archive_root = self.archive_dir();
        fs::create_dir_all(&archive_root)
            .await
            .map_err(|source| StoreError::Io { path: archive_root.clone(), source })?;

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let target = archive_root.join(format!("{id}-{stamp}"));
        fs::rename(&dir, &target)
            .await
            .map_err(|source| StoreError::Io { path: target.clone(), source })?;

        info!(
            event_name = "store.session.archived",
            session_id = %id,
            archived_to = %target.display(),
            "session archived"
        );
        Ok(true)
    }
}

async fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(source) if source.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(StoreError::Io { path: path.to_path_buf(), source }),
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|error| StoreError::Corrupt { path: path.to_path_buf(), reason: error.to_string() })
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut tmp_name = path.file_name().map(|name| name.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let io_error = |source: std::io::Error| StoreError::Io { path: tmp_path.clone(), source };
    let mut file = fs::File::create(&tmp_path).await.map_err(io_error)?;
    file.write_all(bytes).await.map_err(io_error)?;
    file.sync_all().await.map_err(io_error)?;
    drop(file);

    fs::rename(&tmp_path, path)
        .await
        .map_err(|source| StoreError::Io { path: path.to_path_buf(), source })
}

async fn path_exists(path: &Path) -> Result<bool, StoreError> {
    fs::try_exists(path).await.map_err(|source| StoreError::Io { path: path.to_path_buf(), source })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use ganglion_core::domain::conversation::Turn;
    use ganglion_core::domain::session::{Session, SessionId, SessionStatus};

    use super::FileSessionStore;
    use crate::sessions::{SessionStore, StoreError};

    fn sample_session(id: &str) -> Session {
        let mut session =
            Session::start(SessionId::parse(id).expect("valid id"), "persona", "summarise the log");
        session.append(Turn::assistant("I will use search."));
        session.context.insert("cursor".to_string(), json!(3));
        session
    }

    #[tokio::test]
    async fn missing_session_loads_as_none() {
        let dir = TempDir::new().expect("tempdir");
        let store = FileSessionStore::new(dir.path());
        let loaded = store.load(&SessionId::parse("nobody").expect("id")).await.expect("load");
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn history_without_context_loads_with_empty_context() {
        let dir = TempDir::new().expect("tempdir");
        let store = FileSessionStore::new(dir.path());
        let session = sample_session("thread-1");
        store.save(&session).await.expect("save");
        std::fs::remove_file(store.context_path(&session.id)).expect("remove context");

        let loaded = store.load(&session.id).await.expect("load").expect("present");
        assert!(loaded.context.is_empty());
        assert_eq!(loaded.history, session.history);
    }

    #[tokio::test]
    async fn corrupt_context_is_reported() {
        let dir = TempDir::new().expect("tempdir");
        let store = FileSessionStore::new(dir.path());
        let session = sample_session("thread-2");
        store.save(&session).await.expect("save");
        std::fs::write(store.context_path(&session.id), b"{\"session_id\":").expect("truncate");

        let error = store.load(&session.id).await.expect_err("corrupt context");
        assert!(matches!(error, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn archive_moves_session_out_of_live_set() {
        let dir = TempDir::new().expect("tempdir");
        let store = FileSessionStore::new(dir.path());
        let mut session = sample_session("thread-3");
        session.transition_to(SessionStatus::Terminated).expect("terminate");
        store.save(&session).await.expect("save");

        assert!(store.archive(&session.id).await.expect("archive"));
        assert!(store.load(&session.id).await.expect("load").is_none());
        assert!(!store.archive(&session.id).await.expect("second archive"));

        let archived: Vec<_> = std::fs::read_dir(dir.path().join("archive"))
            .expect("archive dir")
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(archived.len(), 1);
        assert!(archived[0].starts_with("thread-3-"));
    }

    #[tokio::test]
    async fn delete_reports_whether_anything_was_removed() {
        let dir = TempDir::new().expect("tempdir");
        let store = FileSessionStore::new(dir.path());
        let session = sample_session("thread-4");
        store.save(&session).await.expect("save");

        assert!(store.delete(&session.id).await.expect("delete"));
        assert!(!store.delete(&session.id).await.expect("delete again"));
    }
}
