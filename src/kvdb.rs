//! Bucket-structured transactional store layered over redb.
//!
//! The whole namespace lives in one flat table. Nested buckets are encoded
//! as composite keys: every path segment is the lowercase hex of its binary
//! name, segments joined by `/`. Hex preserves byte order, so lexicographic
//! iteration over the flat table equals bytewise iteration of the logical
//! keys and prefix scans are O(matches). A bucket's existence, independent
//! of its contents, is recorded by a marker key `path + "/"`, which sorts
//! before every child of that bucket.

use std::cell::RefCell;
use std::path::Path;

use log::warn;
use redb::{Database, ReadOnlyTable, ReadableTable, Table, TableDefinition};
use thiserror::Error;

const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("channeldb");

const SEPARATOR: char = '/';

/// Errors surfaced by the backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A bucket deletion targeted a bucket that does not exist.
    #[error("bucket not found")]
    BucketNotFound,
    /// A mutation was issued through a read-only transaction.
    #[error("transaction is not writable")]
    TxNotWritable,
    /// A flat key was not valid hex path encoding.
    #[error("corrupted key encoding: {0}")]
    CorruptKey(#[from] hex::FromHexError),
}

/// Internal access surface shared by read-only and read-write transactions.
///
/// Mutations through a read-only transaction fail with `TxNotWritable`, the
/// bbolt-style contract callers rely on.
trait KvTx {
    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    /// All entries with key >= `start` whose key begins with `prefix`, in
    /// ascending key order. Buffered: mutation during iteration is safe.
    fn scan_raw(&self, start: &str, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
    fn put_raw(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    fn delete_raw(&self, key: &str) -> Result<(), StoreError>;
}

struct ReadTx {
    table: ReadOnlyTable<&'static str, &'static [u8]>,
}

impl KvTx for ReadTx {
    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.table.get(key)?.map(|v| v.value().to_vec()))
    }

    fn scan_raw(&self, start: &str, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut out = Vec::new();
        for item in self.table.range(start..)? {
            let (k, v) = item?;
            if !k.value().starts_with(prefix) {
                break;
            }
            out.push((k.value().to_string(), v.value().to_vec()));
        }
        Ok(out)
    }

    fn put_raw(&self, _key: &str, _value: &[u8]) -> Result<(), StoreError> {
        Err(StoreError::TxNotWritable)
    }

    fn delete_raw(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::TxNotWritable)
    }
}

struct WriteTx<'txn> {
    table: RefCell<Table<'txn, &'static str, &'static [u8]>>,
}

impl<'txn> KvTx for WriteTx<'txn> {
    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let table = self.table.borrow();
        let value = table.get(key)?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    fn scan_raw(&self, start: &str, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let table = self.table.borrow();
        let mut out = Vec::new();
        for item in table.range(start..)? {
            let (k, v) = item?;
            if !k.value().starts_with(prefix) {
                break;
            }
            out.push((k.value().to_string(), v.value().to_vec()));
        }
        Ok(out)
    }

    fn put_raw(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.table.borrow_mut().insert(key, value)?;
        Ok(())
    }

    fn delete_raw(&self, key: &str) -> Result<(), StoreError> {
        self.table.borrow_mut().remove(key)?;
        Ok(())
    }
}

/// A transaction handle giving access to the top-level bucket namespace.
pub struct Tx<'a> {
    inner: &'a dyn KvTx,
}

impl<'a> Tx<'a> {
    /// Look up a top-level bucket, `None` if it has never been created.
    pub fn bucket(&self, name: &[u8]) -> Result<Option<Bucket<'a>>, StoreError> {
        let path = hex::encode(name);
        let exists = self.inner.get_raw(&marker_key(&path))?.is_some();
        Ok(exists.then(|| Bucket { tx: self.inner, path }))
    }

    /// Open a top-level bucket, creating it when absent.
    pub fn create_bucket_if_not_exists(&self, name: &[u8]) -> Result<Bucket<'a>, StoreError> {
        let path = hex::encode(name);
        let marker = marker_key(&path);
        if self.inner.get_raw(&marker)?.is_none() {
            self.inner.put_raw(&marker, &[])?;
        }
        Ok(Bucket { tx: self.inner, path })
    }

    /// Delete a top-level bucket and everything nested under it.
    pub fn delete_bucket(&self, name: &[u8]) -> Result<(), StoreError> {
        delete_subtree(self.inner, &hex::encode(name))
    }

    /// Delete a top-level bucket, treating an absent bucket as a no-op.
    pub fn delete_bucket_if_exists(&self, name: &[u8]) -> Result<(), StoreError> {
        match self.delete_bucket(name) {
            Err(StoreError::BucketNotFound) => Ok(()),
            other => other,
        }
    }
}

/// A named mapping from binary keys to values or sub-buckets.
pub struct Bucket<'a> {
    tx: &'a dyn KvTx,
    path: String,
}

impl<'a> Bucket<'a> {
    fn key_for(&self, key: &[u8]) -> String {
        format!("{}{}{}", self.path, SEPARATOR, hex::encode(key))
    }

    fn children_prefix(&self) -> String {
        format!("{}{}", self.path, SEPARATOR)
    }

    /// Fetch the value stored under `key`, `None` when absent.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.tx.get_raw(&self.key_for(key))
    }

    /// Store `value` under `key`, replacing any prior value.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.tx.put_raw(&self.key_for(key), value)
    }

    /// Remove the value stored under `key`. Removing an absent key is a
    /// no-op.
    pub fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.tx.delete_raw(&self.key_for(key))
    }

    /// Look up a nested bucket, `None` if it has never been created.
    pub fn bucket(&self, name: &[u8]) -> Result<Option<Bucket<'a>>, StoreError> {
        let path = self.key_for(name);
        let exists = self.tx.get_raw(&marker_key(&path))?.is_some();
        Ok(exists.then(|| Bucket { tx: self.tx, path }))
    }

    /// Open a nested bucket, creating it when absent.
    pub fn create_bucket_if_not_exists(&self, name: &[u8]) -> Result<Bucket<'a>, StoreError> {
        let path = self.key_for(name);
        let marker = marker_key(&path);
        if self.tx.get_raw(&marker)?.is_none() {
            self.tx.put_raw(&marker, &[])?;
        }
        Ok(Bucket { tx: self.tx, path })
    }

    /// Delete a nested bucket and everything under it.
    pub fn delete_bucket(&self, name: &[u8]) -> Result<(), StoreError> {
        delete_subtree(self.tx, &self.key_for(name))
    }

    /// Delete a nested bucket, treating an absent bucket as a no-op.
    pub fn delete_bucket_if_exists(&self, name: &[u8]) -> Result<(), StoreError> {
        match self.delete_bucket(name) {
            Err(StoreError::BucketNotFound) => Ok(()),
            other => other,
        }
    }

    /// Direct children of this bucket in ascending bytewise key order.
    ///
    /// Value entries carry `Some(value)`; sub-buckets carry `None`, matching
    /// the nil-value convention scans branch on.
    pub fn items(&self) -> Result<Vec<(Vec<u8>, Option<Vec<u8>>)>, StoreError> {
        let prefix = self.children_prefix();
        let mut out = Vec::new();
        let mut last_bucket: Option<String> = None;
        for (k, v) in self.tx.scan_raw(&prefix, &prefix)? {
            let rest = &k[prefix.len()..];
            if rest.is_empty() {
                // this bucket's own marker
                continue;
            }
            match rest.find(SEPARATOR) {
                None => out.push((hex::decode(rest).map_err(StoreError::from)?, Some(v))),
                Some(idx) => {
                    let seg = &rest[..idx];
                    if last_bucket.as_deref() != Some(seg) {
                        out.push((hex::decode(seg).map_err(StoreError::from)?, None));
                        last_bucket = Some(seg.to_string());
                    }
                }
            }
        }
        Ok(out)
    }

    /// Whether this bucket has neither values nor sub-buckets.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.items()?.is_empty())
    }

    /// Value entries whose key is >= `seek`, ascending. The cursor analog of
    /// "seek to first key >= k then next".
    pub fn range_from(&self, seek: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let prefix = self.children_prefix();
        let start = format!("{}{}", prefix, hex::encode(seek));
        let mut out = Vec::new();
        for (k, v) in self.tx.scan_raw(&start, &prefix)? {
            let rest = &k[prefix.len()..];
            if rest.is_empty() || rest.contains(SEPARATOR) {
                // marker or an entry inside a nested bucket
                continue;
            }
            out.push((hex::decode(rest).map_err(StoreError::from)?, v));
        }
        Ok(out)
    }
}

fn marker_key(path: &str) -> String {
    format!("{}{}", path, SEPARATOR)
}

fn delete_subtree(tx: &dyn KvTx, path: &str) -> Result<(), StoreError> {
    let marker = marker_key(path);
    if tx.get_raw(&marker)?.is_none() {
        return Err(StoreError::BucketNotFound);
    }
    // buffer the keys before deleting, never delete through a live cursor
    let keys: Vec<String> =
        tx.scan_raw(&marker, &marker)?.into_iter().map(|(k, _)| k).collect();
    for key in keys {
        tx.delete_raw(&key)?;
    }
    Ok(())
}

/// A single-file store with nested buckets and serializable transactions.
pub struct Store {
    db: Database,
}

impl Store {
    /// Open or create the store file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let mut db = Database::create(path.as_ref())?;
        if !db.check_integrity()? {
            warn!("database was repaired");
        }
        // make sure the flat table exists so read transactions can open it
        let tx = db.begin_write()?;
        tx.open_table(TABLE)?;
        tx.commit()?;
        Ok(Store { db })
    }

    /// Run `f` inside a read-only snapshot.
    pub fn view<T, E>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let txn = self.db.begin_read().map_err(|e| E::from(StoreError::from(e)))?;
        let table = txn.open_table(TABLE).map_err(|e| E::from(StoreError::from(e)))?;
        let read = ReadTx { table };
        f(&Tx { inner: &read })
    }

    /// Run `f` inside a read-write transaction. The transaction commits when
    /// `f` returns `Ok` and is rolled back in full when it returns `Err`.
    pub fn update<T, E>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let txn = self.db.begin_write().map_err(|e| E::from(StoreError::from(e)))?;
        let table_err = {
            match txn.open_table(TABLE) {
                Ok(table) => {
                    let write = WriteTx { table: RefCell::new(table) };
                    Ok(f(&Tx { inner: &write }))
                }
                Err(e) => Err(e),
            }
        };
        let result = match table_err {
            Ok(result) => result,
            Err(e) => {
                let _ = txn.abort();
                return Err(E::from(StoreError::from(e)));
            }
        };
        match result {
            Ok(value) => {
                txn.commit().map_err(|e| E::from(StoreError::from(e)))?;
                Ok(value)
            }
            Err(e) => {
                let _ = txn.abort();
                Err(e)
            }
        }
    }
}
