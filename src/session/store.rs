//! File-backed session store
//!
//! Stores one pretty-printed JSON document per session.
//!
//! # Directory Structure
//!
//! ```text
//! research_data/
//! ├── 20260101120000_rust_async_runtimes_3f9a1c2e.json
//! ├── 20260102093000_battery_chemistry_77d0b1aa.json
//! └── .20260102093000_battery_chemistry_77d0b1aa.<uuid>.tmp   (crash debris, ignored)
//! ```
//!
//! Writes go to a uniquely named temp file in the same directory, are synced,
//! and then renamed over the target, so readers see either the old document or
//! the new one.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ResearchSession, SessionSummary, SCHEMA_VERSION};
use crate::error::StoreError;

const SLUG_CHARS: usize = 30;

/// Versioned, atomic persistence for [`ResearchSession`]s
#[derive(Debug)]
pub struct SessionStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionStore {
    /// Create a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create and persist a new session for `topic`, returning its id
    pub async fn create(&self, topic: &str) -> Result<String, StoreError> {
        let session_id = generate_session_id(topic);
        let mut session = ResearchSession::new(&session_id, topic);
        self.save(&mut session).await?;
        debug!(session_id = %session_id, "Created session");
        Ok(session_id)
    }

    /// Path of the document for `session_id`
    pub fn path_for(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        validate_session_id(session_id)?;
        Ok(self.dir.join(format!("{}.json", session_id)))
    }

    /// Load and validate a session document
    pub async fn load(&self, session_id: &str) -> Result<ResearchSession, StoreError> {
        let path = self.path_for(session_id)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(session_id.to_string()))
            }
            Err(e) => return Err(StoreError::io(format!("reading {}", path.display()), e)),
        };
        decode(session_id, &bytes)
    }

    /// Atomically persist `session`, stamping `updated_at`
    pub async fn save(&self, session: &mut ResearchSession) -> Result<(), StoreError> {
        self.save_with(session, |_| Ok(())).await
    }

    async fn save_with<F>(&self, session: &mut ResearchSession, before_rename: F) -> Result<(), StoreError>
    where
        F: FnOnce(&Path) -> io::Result<()>,
    {
        let path = self.path_for(&session.session_id)?;
        let lock = self.lock_for(&session.session_id);
        let saved = {
            let _guard = lock.lock().await;
            self.write_document(session, &path, before_rename).await
        };
        self.release_lock(&session.session_id, lock);
        saved
    }

    async fn write_document<F>(
        &self,
        session: &mut ResearchSession,
        path: &Path,
        before_rename: F,
    ) -> Result<(), StoreError>
    where
        F: FnOnce(&Path) -> io::Result<()>,
    {
        session.updated_at = Utc::now();
        let data = serde_json::to_vec_pretty(session)?;

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::io(format!("creating {}", self.dir.display()), e))?;

        let temp_path = self.dir.join(format!(
            ".{}.{}.tmp",
            session.session_id,
            Uuid::new_v4().simple()
        ));

        let written: io::Result<()> = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            before_rename(&temp_path)?;
            fs::rename(&temp_path, path).await?;
            sync_dir(&self.dir).await
        }
        .await;

        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&temp_path).await {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!(path = %temp_path.display(), error = %cleanup, "Failed to remove temp file");
                }
            }
            return Err(StoreError::io(
                format!("writing session {}", session.session_id),
                e,
            ));
        }

        debug!(
            session_id = %session.session_id,
            stage = %session.stage,
            bytes = data.len(),
            "Saved session"
        );
        Ok(())
    }

    /// Summaries of every readable session, newest first.
    ///
    /// Unreadable documents are skipped with a warning.
    pub async fn list(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let exists = fs::try_exists(&self.dir)
            .await
            .map_err(|e| StoreError::io(format!("checking {}", self.dir.display()), e))?;
        if !exists {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| StoreError::io(format!("reading {}", self.dir.display()), e))?;

        let mut summaries = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(format!("reading {}", self.dir.display()), e))?
        {
            let Some(session_id) = session_id_from_path(&entry.path()) else {
                continue;
            };
            match self.load(&session_id).await {
                Ok(session) => summaries.push(session.summary()),
                Err(e) => warn!(session_id = %session_id, error = %e, "Skipping unreadable session"),
            }
        }

        summaries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.session_id.cmp(&a.session_id))
        });
        Ok(summaries)
    }

    /// Remove a session document
    pub async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        let path = self.path_for(session_id)?;
        let lock = self.lock_for(session_id);
        let removed = {
            let _guard = lock.lock().await;
            match fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    Err(StoreError::NotFound(session_id.to_string()))
                }
                Err(e) => Err(StoreError::io(format!("removing {}", path.display()), e)),
            }
        };
        self.release_lock(session_id, lock);
        removed
    }

    fn lock_for(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(session_id.to_string()).or_default())
    }

    /// Drop the map entry for `session_id` once nobody else holds or awaits it
    fn release_lock(&self, session_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let idle = locks
            .get(session_id)
            .is_some_and(|entry| Arc::ptr_eq(entry, &lock) && Arc::strong_count(&lock) == 2);
        if idle {
            locks.remove(session_id);
        }
    }
}

/// Flush the directory entry so a completed rename survives power loss
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// Validate the schema version, then decode the full document
fn decode(session_id: &str, bytes: &[u8]) -> Result<ResearchSession, StoreError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| StoreError::corrupt(session_id, e.to_string()))?;

    let found = value.get("schema_version").and_then(Value::as_u64);
    if found != Some(u64::from(SCHEMA_VERSION)) {
        return Err(StoreError::SchemaMismatch {
            session_id: session_id.to_string(),
            expected: SCHEMA_VERSION,
            found,
        });
    }

    serde_json::from_value(value).map_err(|e| StoreError::corrupt(session_id, e.to_string()))
}

/// `{timestamp}_{topic slug}_{8 hex}`
fn generate_session_id(topic: &str) -> String {
    let slug: String = topic
        .chars()
        .take(SLUG_CHARS)
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}",
        Utc::now().format("%Y%m%d%H%M%S"),
        slug,
        &suffix[..8]
    )
}

fn validate_session_id(session_id: &str) -> Result<(), StoreError> {
    let valid = !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidSessionId(session_id.to_string()))
    }
}

/// Session id for a `{id}.json` document path; temp files and others yield `None`
pub(crate) fn session_id_from_path(path: &Path) -> Option<String> {
    if path.extension()? != "json" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    validate_session_id(stem).ok()?;
    Some(stem.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{Query, SearchResult, SearchStatus};
    use crate::session::Stage;

    #[tokio::test]
    async fn test_create_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        let id = store.create("Rust async runtimes?").await.unwrap();
        let session = store.load(&id).await.unwrap();

        assert_eq!(session.session_id, id);
        assert_eq!(session.topic, "Rust async runtimes?");
        assert_eq!(session.stage, Stage::Created);
        assert_eq!(session.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn test_session_id_format() {
        let id = generate_session_id("Quantum computing: a review of error correction codes");
        let parts: Vec<&str> = id.splitn(2, '_').collect();
        assert_eq!(parts[0].len(), 14);
        assert!(parts[0].chars().all(|c| c.is_ascii_digit()));

        let suffix = id.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(id.contains("Quantum_computing__a_review_of"));
        assert!(validate_session_id(&id).is_ok());
    }

    #[test]
    fn test_rejects_path_traversal() {
        let store = SessionStore::new("unused");
        assert!(matches!(
            store.path_for("../etc/passwd"),
            Err(StoreError::InvalidSessionId(_))
        ));
        assert!(store.path_for("").is_err());
        assert!(store.path_for("ok_id-1").is_ok());
    }

    #[tokio::test]
    async fn test_save_round_trip_and_updated_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let id = store.create("topic").await.unwrap();

        let mut session = store.load(&id).await.unwrap();
        let before = session.updated_at;
        session.advance();
        session.plan = vec![Query::new(0, "first"), Query::new(1, "second")];
        session.record_result(SearchResult {
            query_id: 1,
            query: "second".into(),
            status: SearchStatus::Success,
            content: "data".into(),
            error_kind: None,
            original_length: 4,
            truncated: false,
        });
        store.save(&mut session).await.unwrap();

        let reloaded = store.load(&id).await.unwrap();
        assert_eq!(reloaded, session);
        assert!(reloaded.updated_at >= before);
    }

    #[tokio::test]
    async fn test_interrupted_save_keeps_previous_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let id = store.create("topic").await.unwrap();
        let path = store.path_for(&id).unwrap();
        let before = std::fs::read(&path).unwrap();

        let mut session = store.load(&id).await.unwrap();
        session.questions = vec!["will this be lost?".into()];
        let err = store
            .save_with(&mut session, |_| {
                Err(io::Error::new(io::ErrorKind::Interrupted, "simulated crash"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));

        assert_eq!(std::fs::read(&path).unwrap(), before);
        let reloaded = store.load(&id).await.unwrap();
        assert!(reloaded.questions.is_empty());

        // No temp file left behind
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().extension().is_some_and(|x| x == "tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_load_missing_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        assert!(matches!(
            store.load("nope").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_schema_mismatch_detected_before_decode() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        std::fs::write(
            dir.path().join("old.json"),
            r#"{"query": "legacy topic", "status": "planned"}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("future.json"),
            r#"{"schema_version": 9, "topic": "t"}"#,
        )
        .unwrap();

        match store.load("old").await {
            Err(StoreError::SchemaMismatch { expected, found, .. }) => {
                assert_eq!(expected, SCHEMA_VERSION);
                assert_eq!(found, None);
            }
            other => panic!("expected schema mismatch, got {:?}", other),
        }
        assert!(matches!(
            store.load("future").await,
            Err(StoreError::SchemaMismatch { found: Some(9), .. })
        ));
    }

    #[tokio::test]
    async fn test_corrupt_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        std::fs::write(dir.path().join("broken.json"), "{\"schema_version\": 1, \"topic\"").unwrap();

        let err = store.load("broken").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert!(err.needs_repair());
    }

    #[tokio::test]
    async fn test_list_newest_first_skipping_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        let older = store.create("older").await.unwrap();
        let newer = store.create("newer").await.unwrap();
        let mut session = store.load(&older).await.unwrap();
        session.created_at -= chrono::Duration::hours(1);
        store.save(&mut session).await.unwrap();

        std::fs::write(dir.path().join("garbage.json"), "not json").unwrap();
        std::fs::write(dir.path().join(".leftover.1234.tmp"), "{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let listed: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(listed, vec![newer, older]);
    }

    #[tokio::test]
    async fn test_list_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("absent"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_saves_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path()));
        let id = store.create("topic").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                let mut session = store.load(&id).await.unwrap();
                session.questions = vec![format!("writer {}", i)];
                store.save(&mut session).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let session = store.load(&id).await.unwrap();
        assert_eq!(session.questions.len(), 1);
        assert!(session.questions[0].starts_with("writer "));
    }

    #[tokio::test]
    async fn test_lock_entries_released() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path()));
        let id = store.create("topic").await.unwrap();

        let mut session = store.load(&id).await.unwrap();
        store.save(&mut session).await.unwrap();
        assert!(store.locks.lock().unwrap().is_empty());

        let held = store.lock_for(&id);
        let guard = held.lock().await;
        let waiting = {
            let store = Arc::clone(&store);
            let mut session = session.clone();
            tokio::spawn(async move { store.save(&mut session).await })
        };
        tokio::task::yield_now().await;
        drop(guard);
        store.release_lock(&id, held);
        // The waiting save still holds the entry
        assert_eq!(store.locks.lock().unwrap().len(), 1);
        waiting.await.unwrap().unwrap();
        assert!(store.locks.lock().unwrap().is_empty());

        store.delete(&id).await.unwrap();
        assert!(store.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let id = store.create("topic").await.unwrap();

        store.delete(&id).await.unwrap();
        assert!(matches!(store.load(&id).await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete(&id).await, Err(StoreError::NotFound(_))));
    }
}
