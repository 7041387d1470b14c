//! JSONL artifact streams between stages.
//!
//! Each stage appends one JSON record per line to its output files. Files
//! are never rewritten, so a forced re-run can leave several records for the
//! same id; readers resolve those last-write-wins. Batch stages (cluster,
//! position) stamp every record with a run id and close the run with a
//! [`BatchRun`] header in [`RUNS`]; readers keep only the records of the
//! stage's last header.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::{Error, Result};
use crate::models::{BatchRun, Keyed, RunScoped};

pub const CONVERSATIONS: &str = "conversations.jsonl";
pub const MESSAGES: &str = "messages.jsonl";
pub const CHUNKS: &str = "chunks.jsonl";
pub const ENRICHED: &str = "enriched.jsonl";
pub const EMBEDDINGS: &str = "embeddings.jsonl";
pub const ASSIGNMENTS: &str = "assignments.jsonl";
pub const CLUSTERS: &str = "clusters.jsonl";
pub const POSITIONS: &str = "positions.jsonl";
pub const LOAD_LOG: &str = "load.jsonl";
pub const RUNS: &str = "runs.jsonl";

/// Append-only writer for one artifact file.
pub struct ArtifactWriter {
    path: PathBuf,
    file: File,
    written: usize,
}

impl ArtifactWriter {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            written: 0,
        })
    }

    /// Append one record and flush it to the OS before returning.
    pub fn append<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let mut line = serde_json::to_string(record).map_err(|e| Error::Artifact {
            path: self.path.clone(),
            line: self.written + 1,
            reason: e.to_string(),
        })?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        self.written += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

/// Read every record in order. A missing file is an error.
pub fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path).map_err(|e| Error::Artifact {
        path: path.to_path_buf(),
        line: 0,
        reason: format!("cannot open: {}", e),
    })?;
    let reader = BufReader::new(file);
    let lines: Vec<String> = reader.lines().collect::<std::io::Result<_>>()?;
    let total = lines.len();
    let mut records = Vec::with_capacity(total);

    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(record) => records.push(record),
            Err(e) if i + 1 == total => {
                // Last line of an interrupted append.
                warn!(path = %path.display(), error = %e, "skipping torn artifact tail");
            }
            Err(e) => {
                return Err(Error::Artifact {
                    path: path.to_path_buf(),
                    line: i + 1,
                    reason: e.to_string(),
                })
            }
        }
    }

    Ok(records)
}

/// Like [`read_records`] but a missing file yields an empty stream.
pub fn read_optional<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    read_records(path)
}

/// Resolve duplicates last-write-wins, keeping first-seen order.
pub fn latest_by_key<T: Keyed>(records: Vec<T>) -> Vec<T> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<T> = Vec::with_capacity(records.len());
    for record in records {
        match index.get(record.key()) {
            Some(&pos) => out[pos] = record,
            None => {
                index.insert(record.key().to_string(), out.len());
                out.push(record);
            }
        }
    }
    out
}

/// Read a keyed stream and resolve duplicates.
pub fn read_latest<T: DeserializeOwned + Keyed>(path: &Path) -> Result<Vec<T>> {
    Ok(latest_by_key(read_records(path)?))
}

/// Id of the last committed run of a batch stage, if it ever committed.
pub fn current_run(path: &Path, stage: &str) -> Result<Option<String>> {
    Ok(read_optional::<BatchRun>(path)?
        .into_iter()
        .rev()
        .find(|r| r.stage == stage)
        .map(|r| r.run))
}

/// Records stamped with `run`. No run means no records.
pub fn records_of_run<T: RunScoped>(records: Vec<T>, run: Option<&str>) -> Vec<T> {
    match run {
        Some(run) => records.into_iter().filter(|r| r.run() == run).collect(),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkPosition, LayoutMethod, Message};
    use tempfile::TempDir;

    fn msg(id: &str, content: &str) -> Message {
        Message {
            id: id.into(),
            conversation_id: "c".into(),
            role: "user".into(),
            content: content.into(),
            timestamp: None,
            parent_id: None,
        }
    }

    #[test]
    fn test_last_write_wins() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("messages.jsonl");
        let mut w = ArtifactWriter::open(&path).unwrap();
        w.append(&msg("a", "first")).unwrap();
        w.append(&msg("b", "other")).unwrap();
        w.append(&msg("a", "second")).unwrap();

        let latest: Vec<Message> = read_latest(&path).unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].id, "a");
        assert_eq!(latest[0].content, "second");
        assert_eq!(latest[1].id, "b");
    }

    #[test]
    fn test_missing_file_is_error() {
        let tmp = TempDir::new().unwrap();
        let result = read_records::<Message>(&tmp.path().join("nope.jsonl"));
        assert!(result.is_err());
        let empty = read_optional::<Message>(&tmp.path().join("nope.jsonl")).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_torn_tail_skipped_but_middle_corruption_fatal() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("m.jsonl");
        let good = serde_json::to_string(&msg("a", "x")).unwrap();
        std::fs::write(&path, format!("{}\n{{\"id\":\"b\"", good)).unwrap();
        assert_eq!(read_records::<Message>(&path).unwrap().len(), 1);

        std::fs::write(&path, format!("{{broken\n{}\n", good)).unwrap();
        assert!(read_records::<Message>(&path).is_err());
    }

    #[test]
    fn test_records_of_run_filter() {
        let pos = |run: &str, id: &str| ChunkPosition {
            run: run.into(),
            chunk_id: id.into(),
            x: 0.0,
            y: 0.0,
            method: LayoutMethod::Random,
        };
        let records = vec![pos("r1", "a"), pos("r1", "b"), pos("r2", "a")];
        let current = records_of_run(records.clone(), Some("r1"));
        assert_eq!(current.len(), 2);
        assert!(records_of_run(records, None).is_empty());
    }

    #[test]
    fn test_current_run_is_last_header_per_stage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(RUNS);
        assert_eq!(current_run(&path, "cluster").unwrap(), None);

        let mut w = ArtifactWriter::open(&path).unwrap();
        for (stage, run) in [("cluster", "c1"), ("position", "p1"), ("cluster", "c2")] {
            w.append(&BatchRun {
                stage: stage.into(),
                run: run.into(),
                records: 0,
                created_at: 0,
            })
            .unwrap();
        }
        assert_eq!(current_run(&path, "cluster").unwrap().as_deref(), Some("c2"));
        assert_eq!(current_run(&path, "position").unwrap().as_deref(), Some("p1"));
    }
}
