// SPDX-License-Identifier: MIT

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{rebuild, Session, SessionMeta, SessionStore, StoreError};
use crate::parley::flow::state::{Delta, ExecutionContext, SessionStatus};

const META_FILE: &str = "meta.json";
const LOG_FILE: &str = "deltas.jsonl";
const SNAPSHOT_FILE: &str = "snapshot.json";

/// Directory-backed session store
///
/// Each session gets `<root>/<session_id>/` holding `meta.json`, the
/// append-only `deltas.jsonl` (one delta per line, flushed per write) and
/// an optional `snapshot.json`. JSON files are replaced by rename, so a crash
/// leaves either the old or the new version.
pub struct FileSessionStore {
    root: PathBuf,
}

impl FileSessionStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        log::info!("Session store at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidId(session_id.to_string()));
        }
        Ok(self.root.join(session_id))
    }

    /// Directory of an existing session
    async fn existing_dir(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        let dir = self.session_dir(session_id)?;
        if !fs::try_exists(dir.join(META_FILE)).await? {
            return Err(StoreError::NotFound(session_id.to_string()));
        }
        Ok(dir)
    }

    async fn read_meta(dir: &Path) -> Result<SessionMeta, StoreError> {
        read_json(&dir.join(META_FILE)).await
    }

    async fn read_log(dir: &Path) -> Result<Vec<Delta>, StoreError> {
        Ok(Self::scan_log(dir).await?.0)
    }

    async fn scan_log(dir: &Path) -> Result<(Vec<Delta>, Tail), StoreError> {
        let path = dir.join(LOG_FILE);
        if !fs::try_exists(&path).await? {
            return Ok((Vec::new(), Tail::Clean));
        }
        parse_log(&fs::read_to_string(&path).await?)
    }

    /// Read the log, cutting a torn last write off the file
    async fn recover_log(session_id: &str, dir: &Path) -> Result<Vec<Delta>, StoreError> {
        let (deltas, tail) = Self::scan_log(dir).await?;
        let path = dir.join(LOG_FILE);
        match tail {
            Tail::Clean => {}
            Tail::Torn(valid) => {
                log::warn!(
                    "[{}] Dropping torn last line of {} at byte {}",
                    session_id,
                    path.display(),
                    valid
                );
                let file = fs::OpenOptions::new().write(true).open(&path).await?;
                file.set_len(valid as u64).await?;
            }
            Tail::Unterminated => {
                log::warn!("[{}] Terminating last line of {}", session_id, path.display());
                let mut file = fs::OpenOptions::new().append(true).open(&path).await?;
                file.write_all(b"\n").await?;
                file.flush().await?;
            }
        }
        Ok(deltas)
    }
}

/// State of the end of a delta log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tail {
    Clean,
    /// Last line is a partial write; the valid prefix is this many bytes
    Torn(usize),
    /// Last line parses but lacks its newline
    Unterminated,
}

/// Parse a delta log. Only the last line may be cut short; a bad line
/// anywhere else is an error.
fn parse_log(content: &str) -> Result<(Vec<Delta>, Tail), StoreError> {
    let mut deltas = Vec::new();
    let mut offset = 0;
    for line in content.split_inclusive('\n') {
        let start = offset;
        offset += line.len();
        let terminated = line.ends_with('\n');
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(delta) => {
                deltas.push(delta);
                if !terminated {
                    return Ok((deltas, Tail::Unterminated));
                }
            }
            Err(_) if !terminated => return Ok((deltas, Tail::Torn(start))),
            Err(e) => return Err(e.into()),
        }
    }
    Ok((deltas, Tail::Clean))
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let content = fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}

/// Write via a temp file and rename over the target
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(value)?).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn create(&self, meta: &SessionMeta) -> Result<(), StoreError> {
        let dir = self.session_dir(&meta.session_id)?;
        if fs::try_exists(dir.join(META_FILE)).await? {
            return Err(StoreError::AlreadyExists(meta.session_id.clone()));
        }
        fs::create_dir_all(&dir).await?;
        write_json(&dir.join(META_FILE), meta).await
    }

    async fn load(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let dir = self.session_dir(session_id)?;
        if !fs::try_exists(dir.join(META_FILE)).await? {
            return Ok(None);
        }
        let meta = Self::read_meta(&dir).await?;
        let snapshot_path = dir.join(SNAPSHOT_FILE);
        let snapshot: Option<ExecutionContext> = if fs::try_exists(&snapshot_path).await? {
            Some(read_json(&snapshot_path).await?)
        } else {
            None
        };
        let log = Self::recover_log(session_id, &dir).await?;
        log::debug!(
            "[{}] Loading from snapshot at seq {} plus {} logged deltas",
            session_id,
            snapshot.as_ref().map(|s| s.last_seq()).unwrap_or(0),
            log.len()
        );
        let context = rebuild(session_id, snapshot, &log)?;
        Ok(Some(Session { meta, context }))
    }

    async fn append(&self, session_id: &str, delta: &Delta) -> Result<(), StoreError> {
        let dir = self.existing_dir(session_id).await?;
        let mut line = serde_json::to_string(delta)?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn log(&self, session_id: &str) -> Result<Vec<Delta>, StoreError> {
        let dir = self.existing_dir(session_id).await?;
        Self::read_log(&dir).await
    }

    async fn snapshot(&self, session_id: &str, context: &ExecutionContext) -> Result<(), StoreError> {
        let dir = self.existing_dir(session_id).await?;
        write_json(&dir.join(SNAPSHOT_FILE), context).await
    }

    async fn save_meta(&self, meta: &SessionMeta) -> Result<(), StoreError> {
        let dir = self.existing_dir(&meta.session_id).await?;
        write_json(&dir.join(META_FILE), meta).await
    }

    async fn archive(&self, session_id: &str) -> Result<(), StoreError> {
        let dir = self.existing_dir(session_id).await?;
        let mut meta = Self::read_meta(&dir).await?;
        meta.archived = true;
        write_json(&dir.join(META_FILE), &meta).await
    }

    async fn list_waiting(&self) -> Result<Vec<SessionMeta>, StoreError> {
        let mut waiting = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta_path = entry.path().join(META_FILE);
            if !fs::try_exists(&meta_path).await? {
                continue;
            }
            match read_json::<SessionMeta>(&meta_path).await {
                Ok(meta) if !meta.archived && meta.status == SessionStatus::Waiting => {
                    waiting.push(meta)
                }
                Ok(_) => {}
                Err(e) => log::warn!("Skipping unreadable {}: {}", meta_path.display(), e),
            }
        }
        Ok(waiting)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing;
    use super::*;
    use crate::parley::flow::strategy::Strategy;

    #[tokio::test]
    async fn test_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::open(dir.path()).await.unwrap();
        testing::roundtrip(&store).await;

        let log = fs::read_to_string(dir.path().join("s1").join(LOG_FILE))
            .await
            .unwrap();
        assert_eq!(log.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_reopened_store_sees_sessions() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileSessionStore::open(dir.path()).await.unwrap();
            let meta = SessionMeta::new("kept", "flow", Strategy::Staged);
            store.create(&meta).await.unwrap();
        }
        let store = FileSessionStore::open(dir.path()).await.unwrap();
        let session = store.load("kept").await.unwrap().unwrap();
        assert_eq!(session.meta.strategy, Strategy::Staged);
        assert_eq!(session.context.last_seq(), 0);
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::open(dir.path()).await.unwrap();
        assert!(matches!(
            store.load("../etc").await,
            Err(StoreError::InvalidId(_))
        ));
    }

    fn delta(seq: u64, key: &str) -> Delta {
        let mut delta = Delta::new(None);
        delta.set_var(key, serde_json::json!(seq));
        delta.seq = seq;
        delta
    }

    #[tokio::test]
    async fn test_torn_last_line_is_dropped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::open(dir.path()).await.unwrap();
        store
            .create(&SessionMeta::new("torn", "flow", Strategy::Sequential))
            .await
            .unwrap();
        store.append("torn", &delta(1, "a")).await.unwrap();

        // a crash in the middle of the second append
        let path = dir.path().join("torn").join(LOG_FILE);
        let mut file = fs::OpenOptions::new().append(true).open(&path).await.unwrap();
        file.write_all(br#"{"seq":2,"recorded_at":"2024-05-01T"#)
            .await
            .unwrap();
        drop(file);

        let session = store.load("torn").await.unwrap().unwrap();
        assert_eq!(session.context.last_seq(), 1);
        assert_eq!(session.context.var("a"), Some(&serde_json::json!(1)));

        // the cut was repaired, so the next delta lands on its own line
        store.append("torn", &delta(2, "b")).await.unwrap();
        let session = store.load("torn").await.unwrap().unwrap();
        assert_eq!(session.context.last_seq(), 2);
        assert_eq!(store.log("torn").await.unwrap().len(), 2);
    }

    #[test]
    fn test_parse_log_tails() {
        let line = serde_json::to_string(&delta(1, "a")).unwrap();

        let (deltas, tail) = parse_log(&format!("{}\n", line)).unwrap();
        assert_eq!((deltas.len(), tail), (1, Tail::Clean));

        let (deltas, tail) = parse_log(&line).unwrap();
        assert_eq!((deltas.len(), tail), (1, Tail::Unterminated));

        let torn = format!("{}\n{{\"seq\":2", line);
        let (deltas, tail) = parse_log(&torn).unwrap();
        assert_eq!((deltas.len(), tail), (1, Tail::Torn(line.len() + 1)));

        // damage before the last line is not a torn write
        assert!(parse_log(&format!("{{\"seq\":1\n{}\n", line)).is_err());
    }
}
