//! Commit journal: one JSON record per committed unit of work.
//!
//! A record is written and synced before its effects become visible in
//! memory, so a crash leaves either the whole unit or none of it on disk.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{error, info, warn};

use super::StoreError;
use crate::model::{Cart, LedgerEntry, PaymentToken, Product, SaleRecord, User, Wallet};

/// Row images and appended records of one committed unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitRecord {
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<User>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wallets: Vec<Wallet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub products: Vec<Product>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tokens: Vec<PaymentToken>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub carts: Vec<Cart>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<LedgerEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sales: Vec<SaleRecord>,
}

impl CommitRecord {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
            && self.wallets.is_empty()
            && self.products.is_empty()
            && self.tokens.is_empty()
            && self.carts.is_empty()
            && self.entries.is_empty()
            && self.sales.is_empty()
    }
}

/// Where journal bytes go.
pub trait JournalFile: Write + Send {
    fn sync(&mut self) -> io::Result<()>;

    /// Cut the file back to `len` bytes and continue writing from there.
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl JournalFile for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.seek(SeekFrom::Start(len))?;
        self.sync_data()
    }
}

pub struct Journal {
    file: Box<dyn JournalFile>,
    /// Length of the complete records on disk.
    len: u64,
    failed: bool,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("len", &self.len)
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

impl Journal {
    /// Open (or create) a journal and return the records already in it.
    ///
    /// A torn final line, left by a crash mid-write, is cut off. Corruption
    /// anywhere else is an error.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<CommitRecord>), StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut records = Vec::new();
        let mut valid_len: u64 = 0;
        let mut torn: Option<(usize, String)> = None;

        let mut reader = BufReader::new(&file);
        let mut line = String::new();
        let mut line_no = 0;
        loop {
            line.clear();
            let read = reader.read_line(&mut line)?;
            if read == 0 {
                break;
            }
            line_no += 1;

            if let Some((bad_line, reason)) = torn.take() {
                // something follows the bad line, so it was not a torn tail
                return Err(StoreError::Corrupt {
                    line: bad_line,
                    reason,
                });
            }

            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                valid_len += read as u64;
                continue;
            }
            match serde_json::from_str::<CommitRecord>(trimmed) {
                Ok(record) if line.ends_with('\n') => {
                    records.push(record);
                    valid_len += read as u64;
                }
                // complete JSON without its newline: the write never finished
                Ok(_) => torn = Some((line_no, "missing line terminator".to_string())),
                Err(source) => torn = Some((line_no, source.to_string())),
            }
        }
        drop(reader);

        if let Some((bad_line, reason)) = torn {
            warn!(
                path = %path.display(),
                line = bad_line,
                reason = %reason,
                "discarding torn journal tail"
            );
            file.set_len(valid_len)?;
            file.sync_data()?;
        }
        let len = file.seek(SeekFrom::End(0))?;

        info!(path = %path.display(), records = records.len(), "journal opened");
        Ok((Self::from_file(Box::new(file), len), records))
    }

    /// Journal over an already positioned file holding `len` bytes of records.
    pub fn from_file(file: Box<dyn JournalFile>, len: u64) -> Self {
        Self {
            file,
            len,
            failed: false,
        }
    }

    /// Append one record and sync it to disk.
    ///
    /// A failed write is cut back off, so the next record starts on a clean
    /// line. If even that fails the journal refuses every later append.
    pub fn append(&mut self, record: &CommitRecord) -> Result<(), StoreError> {
        if self.failed {
            return Err(StoreError::JournalFailed);
        }
        let mut buf = serde_json::to_vec(record).map_err(StoreError::Encode)?;
        buf.push(b'\n');

        let written = self
            .file
            .write_all(&buf)
            .and_then(|()| self.file.sync());
        if let Err(e) = written {
            if let Err(undo) = self.file.truncate(self.len) {
                error!(reason = %undo, "failed to cut a partial journal record");
                self.failed = true;
            }
            return Err(e.into());
        }
        self.len += buf.len() as u64;
        Ok(())
    }
}
