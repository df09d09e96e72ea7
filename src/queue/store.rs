//! Append-only journal backing the heartbeat queue.
//!
//! Every queue mutation is appended as one JSON line before it is
//! considered done. On startup the journal is replayed to rebuild the
//! pending heartbeats. The journal is compacted once it holds far more
//! records than there are pending heartbeats.

use crate::core::heartbeat::{Heartbeat, HeartbeatId, QueuedHeartbeat};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// One line of the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalRecord {
    /// Written at the head of a compacted journal
    Checkpoint { next_id: u64 },
    Enqueue {
        id: HeartbeatId,
        heartbeat: Heartbeat,
    },
    /// Removal by acknowledgment or by overflow shedding
    Ack { ids: Vec<HeartbeatId> },
}

/// Queue state recovered from the journal.
#[derive(Debug, Default)]
pub struct Replay {
    /// Pending heartbeats in id order
    pub pending: Vec<QueuedHeartbeat>,
    /// Next id to assign
    pub next_id: u64,
    /// Lines that could not be parsed
    pub skipped_lines: usize,
}

/// Queue storage errors.
#[derive(Debug)]
pub enum QueueError {
    Io(String),
    Serialize(String),
    /// Another process has the journal open
    Locked(String),
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Io(e) => write!(f, "Queue IO error: {e}"),
            QueueError::Serialize(e) => write!(f, "Queue serialize error: {e}"),
            QueueError::Locked(path) => write!(
                f,
                "Queue journal {path} is in use by another editor-heartbeat process"
            ),
        }
    }
}

impl std::error::Error for QueueError {}

impl From<std::io::Error> for QueueError {
    fn from(e: std::io::Error) -> Self {
        QueueError::Io(e.to_string())
    }
}

/// Exclusive advisory lock on the journal, held for the life of the store.
#[derive(Debug)]
struct JournalLock {
    #[cfg_attr(not(unix), allow(dead_code))]
    file: File,
}

impl JournalLock {
    /// Take the lock without waiting.
    fn acquire(path: &Path) -> Result<Self, QueueError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    return Err(QueueError::Locked(path.display().to_string()));
                }
                return Err(err.into());
            }
        }

        Ok(Self { file })
    }
}

impl Drop for JournalLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::flock(
                std::os::unix::io::AsRawFd::as_raw_fd(&self.file),
                libc::LOCK_UN,
            );
        };
    }
}

/// A compacted journal written next to the live one, not yet installed.
#[derive(Debug)]
pub struct Snapshot {
    path: PathBuf,
    file: File,
    records: usize,
}

impl Snapshot {
    /// Write a checkpoint and the given pending heartbeats to `path`.
    ///
    /// Needs no access to the live store, so callers can do this without
    /// holding the queue lock.
    pub fn write<'a>(
        path: &Path,
        next_id: u64,
        pending: impl Iterator<Item = &'a QueuedHeartbeat>,
    ) -> Result<Self, QueueError> {
        let mut file = File::create(path)?;
        let mut records = 0;

        write_record(&mut file, &JournalRecord::Checkpoint { next_id })?;
        records += 1;
        for queued in pending {
            write_record(
                &mut file,
                &JournalRecord::Enqueue {
                    id: queued.id,
                    heartbeat: queued.heartbeat.clone(),
                },
            )?;
            records += 1;
        }
        file.sync_data()?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            records,
        })
    }
}

fn write_record(file: &mut File, record: &JournalRecord) -> Result<(), QueueError> {
    let mut line =
        serde_json::to_string(record).map_err(|e| QueueError::Serialize(e.to_string()))?;
    line.push('\n');
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// Journal file handle.
#[derive(Debug)]
pub struct QueueStore {
    path: PathBuf,
    file: File,
    /// Records currently in the journal
    records: usize,
    _lock: JournalLock,
}

impl QueueStore {
    /// Open (or create) the journal at `path` and replay it.
    ///
    /// Fails with [`QueueError::Locked`] while another process holds it.
    pub fn open(path: &Path) -> Result<(Self, Replay), QueueError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock = JournalLock::acquire(&path.with_extension("lock"))?;

        let (replay, records) = if path.exists() {
            replay(path)?
        } else {
            (Replay::default(), 0)
        };

        if replay.skipped_lines > 0 {
            tracing::warn!(
                skipped = replay.skipped_lines,
                path = %path.display(),
                "skipped unreadable queue journal lines"
            );
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        // a torn last line must not swallow the next record
        if !ends_with_newline(&mut file)? {
            file.write_all(b"\n")?;
        }

        Ok((
            Self {
                path: path.to_path_buf(),
                file,
                records,
                _lock: lock,
            },
            replay,
        ))
    }

    /// Read the pending heartbeats of a journal without opening it for writing.
    pub fn inspect(path: &Path) -> Result<Replay, QueueError> {
        if !path.exists() {
            return Ok(Replay::default());
        }
        replay(path).map(|(replay, _)| replay)
    }

    /// Append one record.
    pub fn append(&mut self, record: &JournalRecord) -> Result<(), QueueError> {
        write_record(&mut self.file, record)?;
        self.records += 1;
        Ok(())
    }

    /// Number of records in the journal.
    pub fn records(&self) -> usize {
        self.records
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where a compacted journal is staged before it replaces this one.
    pub fn snapshot_path(&self) -> PathBuf {
        self.path.with_extension("jsonl.tmp")
    }

    /// Rewrite the journal to hold only a checkpoint and the pending heartbeats.
    pub fn compact<'a>(
        &mut self,
        next_id: u64,
        pending: impl Iterator<Item = &'a QueuedHeartbeat>,
    ) -> Result<(), QueueError> {
        let snapshot = Snapshot::write(&self.snapshot_path(), next_id, pending)?;
        self.install(snapshot, &[])
    }

    /// Replace the journal with `snapshot` plus the records appended since
    /// it was taken.
    pub fn install(
        &mut self,
        mut snapshot: Snapshot,
        tail: &[JournalRecord],
    ) -> Result<(), QueueError> {
        for record in tail {
            write_record(&mut snapshot.file, record)?;
        }
        snapshot.file.sync_data()?;

        std::fs::rename(&snapshot.path, &self.path)?;
        self.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        self.records = snapshot.records + tail.len();

        tracing::debug!(records = self.records, "compacted queue journal");
        Ok(())
    }

    /// Flush journal contents to disk.
    pub fn sync(&self) -> Result<(), QueueError> {
        self.file.sync_data()?;
        Ok(())
    }
}

fn ends_with_newline(file: &mut File) -> Result<bool, QueueError> {
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn replay(path: &Path) -> Result<(Replay, usize), QueueError> {
    let reader = BufReader::new(File::open(path)?);
    let mut pending: BTreeMap<HeartbeatId, Heartbeat> = BTreeMap::new();
    let mut next_id = 0u64;
    let mut records = 0usize;
    let mut skipped_lines = 0usize;

    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                skipped_lines += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if line.trim().is_empty() {
            continue;
        }

        // A crash mid-append leaves a torn last line.
        let record: JournalRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(_) => {
                skipped_lines += 1;
                continue;
            }
        };
        records += 1;

        match record {
            JournalRecord::Checkpoint { next_id: checkpoint } => {
                next_id = next_id.max(checkpoint);
            }
            JournalRecord::Enqueue { id, heartbeat } => {
                next_id = next_id.max(id.0 + 1);
                pending.insert(id, heartbeat);
            }
            JournalRecord::Ack { ids } => {
                let ids: HashSet<HeartbeatId> = ids.into_iter().collect();
                pending.retain(|id, _| !ids.contains(id));
            }
        }
    }

    let pending = pending
        .into_iter()
        .map(|(id, heartbeat)| QueuedHeartbeat { id, heartbeat })
        .collect();

    Ok((
        Replay {
            pending,
            next_id,
            skipped_lines,
        },
        records,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityEvent;

    fn temp_journal() -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("heartbeat-store-{}", uuid::Uuid::new_v4()));
        let path = dir.join("queue.jsonl");
        (dir, path)
    }

    fn heartbeat(path: &str) -> Heartbeat {
        Heartbeat::from_event(&ActivityEvent::edit(path))
    }

    #[test]
    fn test_replay_applies_acks() {
        let (dir, path) = temp_journal();
        {
            let (mut store, replay) = QueueStore::open(&path).unwrap();
            assert!(replay.pending.is_empty());
            for (i, name) in ["a", "b", "c"].iter().enumerate() {
                store
                    .append(&JournalRecord::Enqueue {
                        id: HeartbeatId(i as u64),
                        heartbeat: heartbeat(name),
                    })
                    .unwrap();
            }
            store
                .append(&JournalRecord::Ack {
                    ids: vec![HeartbeatId(1)],
                })
                .unwrap();
        }

        let (store, replay) = QueueStore::open(&path).unwrap();
        let entities: Vec<&str> = replay
            .pending
            .iter()
            .map(|q| q.heartbeat.entity.as_str())
            .collect();
        assert_eq!(entities, vec!["a", "c"]);
        assert_eq!(replay.next_id, 3);
        assert_eq!(store.records(), 4);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_torn_line_is_skipped() {
        let (dir, path) = temp_journal();
        {
            let (mut store, _) = QueueStore::open(&path).unwrap();
            store
                .append(&JournalRecord::Enqueue {
                    id: HeartbeatId(0),
                    heartbeat: heartbeat("a"),
                })
                .unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"op\":\"enqueue\",\"id\":1,\"heartb").unwrap();
        drop(file);

        {
            let (mut store, replay) = QueueStore::open(&path).unwrap();
            assert_eq!(replay.pending.len(), 1);
            assert_eq!(replay.skipped_lines, 1);

            // the next record starts on a fresh line
            store
                .append(&JournalRecord::Enqueue {
                    id: HeartbeatId(replay.next_id),
                    heartbeat: heartbeat("b"),
                })
                .unwrap();
        }

        let (_, replay) = QueueStore::open(&path).unwrap();
        let entities: Vec<&str> = replay
            .pending
            .iter()
            .map(|q| q.heartbeat.entity.as_str())
            .collect();
        assert_eq!(entities, vec!["a", "b"]);
        assert_eq!(replay.skipped_lines, 1);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_complete_line_without_newline_is_kept() {
        let (dir, path) = temp_journal();
        std::fs::create_dir_all(&dir).unwrap();
        let record = serde_json::to_string(&JournalRecord::Enqueue {
            id: HeartbeatId(0),
            heartbeat: heartbeat("a"),
        })
        .unwrap();
        std::fs::write(&path, record).unwrap();

        {
            let (mut store, replay) = QueueStore::open(&path).unwrap();
            assert_eq!(replay.pending.len(), 1);
            store
                .append(&JournalRecord::Enqueue {
                    id: HeartbeatId(1),
                    heartbeat: heartbeat("b"),
                })
                .unwrap();
        }

        let (_, replay) = QueueStore::open(&path).unwrap();
        assert_eq!(replay.pending.len(), 2);
        assert_eq!(replay.skipped_lines, 0);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn test_second_open_is_refused_while_locked() {
        let (dir, path) = temp_journal();
        let first = QueueStore::open(&path).unwrap();

        let second = QueueStore::open(&path);
        assert!(matches!(second, Err(QueueError::Locked(_))));

        // reading is still allowed
        assert!(QueueStore::inspect(&path).is_ok());

        drop(first);
        assert!(QueueStore::open(&path).is_ok());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_compaction_preserves_next_id() {
        let (dir, path) = temp_journal();
        {
            let (mut store, _) = QueueStore::open(&path).unwrap();
            for i in 0..10 {
                store
                    .append(&JournalRecord::Enqueue {
                        id: HeartbeatId(i),
                        heartbeat: heartbeat("x"),
                    })
                    .unwrap();
            }
            store
                .append(&JournalRecord::Ack {
                    ids: (0..9).map(HeartbeatId).collect(),
                })
                .unwrap();

            let survivor = QueuedHeartbeat {
                id: HeartbeatId(9),
                heartbeat: heartbeat("x"),
            };
            store.compact(10, std::iter::once(&survivor)).unwrap();
            assert_eq!(store.records(), 2);
        }

        let (_, replay) = QueueStore::open(&path).unwrap();
        assert_eq!(replay.pending.len(), 1);
        assert_eq!(replay.pending[0].id, HeartbeatId(9));
        assert_eq!(replay.next_id, 10);

        let _ = std::fs::remove_dir_all(dir);
    }
}
