//! Append-only processed-hash log, one per stage.
//!
//! On disk a manifest is a plain text file with one lowercase hex SHA-256
//! digest per line, so it can be inspected (or pruned) with ordinary shell
//! tools. Entries are appended and flushed one at a time; the pipeline
//! marks a unit only after its artifact has been written, so a crash can at
//! worst leave a unit written-but-unmarked and cause it to be reprocessed.
//!
//! A final line without a trailing newline is a torn write from an
//! interrupted run; it is ignored on load. Any other malformed line makes
//! the manifest corrupt, which is fatal to the owning stage.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Processed-hash set for one stage.
pub struct Manifest {
    path: PathBuf,
    entries: HashSet<String>,
    file: File,
    force: bool,
    appended: usize,
}

impl Manifest {
    /// Open (creating if needed) the manifest at `path`.
    ///
    /// With `force`, existing entries are still loaded but
    /// [`contains`](Manifest::contains) always answers `false`, so every
    /// unit is reprocessed.
    pub fn open(path: &Path, force: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let entries = if path.exists() {
            load_entries(path)?
        } else {
            HashSet::new()
        };

        truncate_torn_tail(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        debug!(path = %path.display(), entries = entries.len(), force, "manifest opened");

        Ok(Self {
            path: path.to_path_buf(),
            entries,
            file,
            force,
            appended: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_forced(&self) -> bool {
        self.force
    }

    /// Whether `digest` counts as already processed.
    pub fn contains(&self, digest: &str) -> bool {
        !self.force && self.entries.contains(digest)
    }

    /// Append `digest`. Returns `true` if it was not already recorded.
    pub fn mark(&mut self, digest: &str) -> Result<bool> {
        if !is_digest(digest) {
            return Err(Error::Config(format!(
                "refusing to record non-digest '{}' in {}",
                digest,
                self.path.display()
            )));
        }
        if self.entries.contains(digest) {
            return Ok(false);
        }
        self.file.write_all(format!("{}\n", digest).as_bytes())?;
        self.file.flush()?;
        self.entries.insert(digest.to_string());
        self.appended += 1;
        Ok(true)
    }

    /// Number of recorded digests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Digests appended since this handle was opened.
    pub fn appended(&self) -> usize {
        self.appended
    }
}

/// Read the digests recorded at `path` without opening it for writing.
pub fn read_entries(path: &Path) -> Result<HashSet<String>> {
    if !path.exists() {
        return Ok(HashSet::new());
    }
    load_entries(path)
}

fn load_entries(path: &Path) -> Result<HashSet<String>> {
    let content = std::fs::read_to_string(path)?;
    let torn_tail = !content.is_empty() && !content.ends_with('\n');
    let lines: Vec<&str> = content.lines().collect();
    let mut entries = HashSet::with_capacity(lines.len());

    for (i, line) in lines.iter().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if is_digest(line) {
            entries.insert(line.to_string());
            continue;
        }
        if torn_tail && i + 1 == lines.len() {
            warn!(path = %path.display(), "ignoring torn manifest tail");
            continue;
        }
        return Err(Error::ManifestCorrupt {
            path: path.to_path_buf(),
            line: i + 1,
        });
    }

    Ok(entries)
}

/// Drop an unterminated final line so the next append starts cleanly.
fn truncate_torn_tail(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let bytes = std::fs::read(path)?;
    if matches!(bytes.last(), None | Some(b'\n')) {
        return Ok(());
    }
    let keep = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|pos| pos + 1)
        .unwrap_or(0);
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(keep as u64)?;
    Ok(())
}

fn is_digest(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
