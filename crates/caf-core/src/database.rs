//! Local payload store: a directory holding `database.txt` and one blob file per
//! payload revision.
//!
//! Index lines look like `dbstore/<name> <revision> <expLow,runLow,expHigh,runHigh>`.
//! Entries are only ever appended. A lookup returns the highest revision whose
//! IoV contains the requested run, so the last commit wins.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::iov::{ExpRun, Iov};
use crate::{atomic_write_bytes, ensure_dir, sha256_bytes, sha256_file, LockFile};

pub const DATABASE_FILE: &str = "database.txt";
const LOCK_FILE: &str = "database.lock";
const ENTRY_PREFIX: &str = "dbstore/";
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayloadEntry {
    pub name: String,
    pub revision: u32,
    pub iov: Iov,
}

impl PayloadEntry {
    pub fn blob_file_name(&self) -> String {
        format!("dbstore_{}_rev_{}.payload", self.name, self.revision)
    }

    fn to_index_line(&self) -> String {
        format!(
            "{}{} {} {}",
            ENTRY_PREFIX,
            self.name,
            self.revision,
            self.iov.to_wire()
        )
    }

    fn parse_index_line(line: &str, line_no: usize) -> Result<Self> {
        let mut fields = line.split_whitespace();
        let (Some(key), Some(rev), Some(iov), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(anyhow!(
                "malformed database.txt line {}: '{}'",
                line_no,
                line
            ));
        };
        let name = key
            .strip_prefix(ENTRY_PREFIX)
            .ok_or_else(|| anyhow!("database.txt line {}: missing '{}' prefix", line_no, ENTRY_PREFIX))?;
        let revision = rev
            .parse::<u32>()
            .map_err(|_| anyhow!("database.txt line {}: bad revision '{}'", line_no, rev))?;
        let iov = iov
            .parse::<Iov>()
            .map_err(|e| anyhow!("database.txt line {}: {}", line_no, e))?;
        Ok(Self {
            name: name.to_string(),
            revision,
            iov,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Appended(PayloadEntry),
    /// The same bytes were already the winning payload for the whole IoV.
    Unchanged(PayloadEntry),
}

impl CommitOutcome {
    pub fn entry(&self) -> &PayloadEntry {
        match self {
            CommitOutcome::Appended(e) | CommitOutcome::Unchanged(e) => e,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PayloadStore {
    dir: PathBuf,
    lock_timeout: Duration,
}

impl PayloadStore {
    /// Opens (creating if needed) the store rooted at `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        ensure_dir(dir)?;
        // Never truncates: a concurrent writer may already own the index.
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(DATABASE_FILE))
        {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    /// Opens an existing store without creating anything.
    pub fn open_existing(dir: &Path) -> Result<Self> {
        if !dir.join(DATABASE_FILE).is_file() {
            return Err(anyhow!(
                "no {} found in {}",
                DATABASE_FILE,
                dir.display()
            ));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join(DATABASE_FILE)
    }

    pub fn entries(&self) -> Result<Vec<PayloadEntry>> {
        let raw = fs::read_to_string(self.index_path())?;
        raw.lines()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty())
            .map(|(i, l)| PayloadEntry::parse_index_line(l.trim(), i + 1))
            .collect()
    }

    pub fn commit(&self, name: &str, iov: Iov, bytes: &[u8]) -> Result<CommitOutcome> {
        validate_payload_name(name)?;
        let _lock = LockFile::acquire(&self.dir.join(LOCK_FILE), self.lock_timeout)?;
        let entries = self.entries()?;

        let digest = sha256_bytes(bytes);
        if let Some(existing) = self.winning_entry_for_iov(&entries, name, &iov) {
            if sha256_file(&self.dir.join(existing.blob_file_name()))? == digest {
                debug!(payload = name, iov = %iov, "payload already committed, skipping");
                return Ok(CommitOutcome::Unchanged(existing.clone()));
            }
        }

        let revision = entries
            .iter()
            .filter(|e| e.name == name)
            .map(|e| e.revision)
            .max()
            .unwrap_or(0)
            + 1;
        let entry = PayloadEntry {
            name: name.to_string(),
            revision,
            iov,
        };
        atomic_write_bytes(&self.dir.join(entry.blob_file_name()), bytes)?;

        let mut index = fs::read_to_string(self.index_path())?;
        if !index.is_empty() && !index.ends_with('\n') {
            index.push('\n');
        }
        index.push_str(&entry.to_index_line());
        index.push('\n');
        atomic_write_bytes(&self.index_path(), index.as_bytes())?;
        info!(
            payload = name,
            revision,
            iov = %iov,
            database = %self.dir.display(),
            "committed payload"
        );
        Ok(CommitOutcome::Appended(entry))
    }

    // Newest entry with this exact IoV, provided no later revision of the same
    // payload overlaps it (otherwise it no longer wins every lookup in the IoV).
    fn winning_entry_for_iov<'a>(
        &self,
        entries: &'a [PayloadEntry],
        name: &str,
        iov: &Iov,
    ) -> Option<&'a PayloadEntry> {
        let candidate = entries
            .iter()
            .filter(|e| e.name == name && e.iov == *iov)
            .max_by_key(|e| e.revision)?;
        let shadowed = entries
            .iter()
            .any(|e| e.name == name && e.revision > candidate.revision && e.iov.overlaps(iov));
        if shadowed {
            None
        } else {
            Some(candidate)
        }
    }

    pub fn lookup_entry(&self, name: &str, exprun: ExpRun) -> Result<Option<PayloadEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.name == name && e.iov.contains(exprun))
            .max_by_key(|e| e.revision))
    }

    pub fn lookup(&self, name: &str, exprun: ExpRun) -> Result<Option<(PayloadEntry, Vec<u8>)>> {
        match self.lookup_entry(name, exprun)? {
            Some(entry) => {
                let path = self.dir.join(entry.blob_file_name());
                let bytes = fs::read(&path)
                    .map_err(|e| anyhow!("missing payload blob {}: {}", path.display(), e))?;
                Ok(Some((entry, bytes)))
            }
            None => Ok(None),
        }
    }

    /// Re-commits every entry of `other`, oldest revision first.
    pub fn merge_from(&self, other: &PayloadStore) -> Result<Vec<CommitOutcome>> {
        let mut outcomes = Vec::new();
        for entry in other.entries()? {
            let bytes = fs::read(other.dir.join(entry.blob_file_name()))?;
            outcomes.push(self.commit(&entry.name, entry.iov, &bytes)?);
        }
        Ok(outcomes)
    }
}

fn validate_payload_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name
            .chars()
            .any(|c| c.is_whitespace() || c == '/' || c == '\\')
    {
        return Err(anyhow!("invalid payload name '{}'", name));
    }
    Ok(())
}
