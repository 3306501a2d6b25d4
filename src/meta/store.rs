//! Transactional metadata index
//!
//! Persists path -> record mappings in named buckets and hands out per-bucket
//! monotonic sequence numbers (inode numbers). Backed by redb, so every
//! read-write transaction is atomic and durable on commit, and only one
//! writer commits at a time.

use std::path::{Path, PathBuf};

use redb::{
    Database, ReadTransaction, ReadableTable, TableDefinition, TableError, WriteTransaction,
};
use tracing::{debug, info, warn};

/// Sequence counter per bucket. A bucket exists iff it has an entry here.
const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("__sequences");

/// Metadata store errors
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error("Failed to create metadata directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to open metadata store: {0}")]
    Open(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit failed: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Corrupt record at {key}: {source}")]
    Corrupt {
        key: String,
        source: serde_json::Error,
    },

    #[error("Failed to encode record: {0}")]
    Encode(serde_json::Error),
}

/// Handle to the on-disk metadata index
pub struct MetaStore {
    db: Database,
    path: PathBuf,
}

impl MetaStore {
    /// Open (or create) the store at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MetaError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| MetaError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let db = Database::create(&path)?;
        info!(path = %path.display(), "Metadata store opened");

        Ok(Self { db, path })
    }

    /// Run `f` inside a read-write transaction.
    ///
    /// The transaction commits if `f` returns `Ok` and is aborted otherwise;
    /// either way the store stays usable for later transactions.
    pub fn update<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&WriteTx) -> Result<T, E>,
        E: From<MetaError>,
    {
        let tx = WriteTx {
            txn: self.db.begin_write().map_err(MetaError::from)?,
        };

        match f(&tx) {
            Ok(value) => {
                tx.txn.commit().map_err(MetaError::from)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = tx.txn.abort() {
                    warn!(error = %abort_err, "Failed to abort metadata transaction");
                }
                debug!("Metadata transaction aborted");
                Err(e)
            }
        }
    }

    /// Run `f` inside a read-only transaction.
    pub fn view<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&ReadTx) -> Result<T, E>,
        E: From<MetaError>,
    {
        let tx = ReadTx {
            txn: self.db.begin_read().map_err(MetaError::from)?,
        };
        f(&tx)
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the store, flushing nothing beyond what committed transactions
    /// already made durable.
    pub fn close(self) {
        info!(path = %self.path.display(), "Metadata store closed");
        drop(self.db);
    }
}

fn bucket_table(name: &str) -> String {
    format!("bucket:{}", name)
}

/// Read-write transaction
pub struct WriteTx {
    txn: WriteTransaction,
}

impl WriteTx {
    /// Look up an existing bucket
    pub fn bucket(&self, name: &str) -> Result<Option<BucketMut<'_>>, MetaError> {
        let exists = {
            let seqs = self.txn.open_table(SEQUENCES)?;
            let found = seqs.get(name)?.is_some();
            found
        };

        Ok(exists.then(|| BucketMut {
            txn: &self.txn,
            name: name.to_string(),
            table: bucket_table(name),
        }))
    }

    /// Look up a bucket that must exist
    pub fn require_bucket(&self, name: &str) -> Result<BucketMut<'_>, MetaError> {
        self.bucket(name)?
            .ok_or_else(|| MetaError::BucketNotFound(name.to_string()))
    }

    /// Create the bucket (and its sequence counter) unless it already exists
    pub fn create_bucket_if_not_exists(&self, name: &str) -> Result<BucketMut<'_>, MetaError> {
        let table = bucket_table(name);
        {
            let mut seqs = self.txn.open_table(SEQUENCES)?;
            let exists = seqs.get(name)?.is_some();
            if !exists {
                seqs.insert(name, 0)?;
                debug!(bucket = name, "Created metadata bucket");
            }
        }
        // Opening in a write transaction materializes the table
        self.txn
            .open_table(TableDefinition::<&'static str, &'static [u8]>::new(&table))?;

        Ok(BucketMut {
            txn: &self.txn,
            name: name.to_string(),
            table,
        })
    }
}

/// Bucket handle inside a read-write transaction
pub struct BucketMut<'t> {
    txn: &'t WriteTransaction,
    name: String,
    table: String,
}

impl BucketMut<'_> {
    fn def(&self) -> TableDefinition<'_, &'static str, &'static [u8]> {
        TableDefinition::new(&self.table)
    }

    /// Bucket name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Allocate the next sequence number for this bucket.
    ///
    /// Values start at 1 and are never handed out twice, even if the keys
    /// they were used for are deleted later.
    pub fn next_sequence(&self) -> Result<u64, MetaError> {
        let mut seqs = self.txn.open_table(SEQUENCES)?;
        let current = seqs.get(self.name.as_str())?.map(|v| v.value()).unwrap_or(0);
        let next = current + 1;
        seqs.insert(self.name.as_str(), next)?;
        Ok(next)
    }

    /// Read the raw value stored at `key`
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, MetaError> {
        let table = self.txn.open_table(self.def())?;
        let value = table.get(key)?.map(|v| v.value().to_vec());
        Ok(value)
    }

    /// Store `value` at `key`, replacing any previous value
    pub fn put(&self, key: &str, value: &[u8]) -> Result<(), MetaError> {
        let mut table = self.txn.open_table(self.def())?;
        table.insert(key, value)?;
        Ok(())
    }

    /// Remove `key`; returns whether it was present
    pub fn delete(&self, key: &str) -> Result<bool, MetaError> {
        let mut table = self.txn.open_table(self.def())?;
        let removed = table.remove(key)?.is_some();
        Ok(removed)
    }

    /// All entries whose key starts with `prefix`, in key order
    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, MetaError> {
        let table = self.txn.open_table(self.def())?;
        collect_prefix(&table, prefix)
    }
}

/// Read-only transaction
pub struct ReadTx {
    txn: ReadTransaction,
}

impl ReadTx {
    /// Look up an existing bucket
    pub fn bucket(&self, name: &str) -> Result<Option<Bucket<'_>>, MetaError> {
        let seqs = match self.txn.open_table(SEQUENCES) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let exists = seqs.get(name)?.is_some();

        Ok(exists.then(|| Bucket {
            txn: &self.txn,
            table: bucket_table(name),
        }))
    }

    /// Look up a bucket that must exist
    pub fn require_bucket(&self, name: &str) -> Result<Bucket<'_>, MetaError> {
        self.bucket(name)?
            .ok_or_else(|| MetaError::BucketNotFound(name.to_string()))
    }
}

/// Bucket handle inside a read-only transaction
pub struct Bucket<'t> {
    txn: &'t ReadTransaction,
    table: String,
}

impl Bucket<'_> {
    fn def(&self) -> TableDefinition<'_, &'static str, &'static [u8]> {
        TableDefinition::new(&self.table)
    }

    /// Read the raw value stored at `key`
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, MetaError> {
        let table = match self.txn.open_table(self.def()) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value = table.get(key)?.map(|v| v.value().to_vec());
        Ok(value)
    }

    /// All entries whose key starts with `prefix`, in key order
    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, MetaError> {
        let table = match self.txn.open_table(self.def()) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        collect_prefix(&table, prefix)
    }
}

fn collect_prefix<T>(table: &T, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, MetaError>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let mut entries = Vec::new();
    for item in table.range::<&str>(prefix..)? {
        let (key, value) = item?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        entries.push((key.to_string(), value.value().to_vec()));
    }
    Ok(entries)
}
