//! src/services/local_storage.rs
//!
//! LocalStorage: an `ObjectStorage` backend keeping metadata in SQLite and
//! payloads on local disk, sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{key}`. Used for development and for
//! running the gateway without an S3 endpoint.

use crate::{
    models::object::{DEFAULT_CONTENT_TYPE, ObjectRecord, ObjectRef, ObjectStream, UploadDescriptor},
    services::storage_service::{
        KeyStream, ObjectReader, ObjectStorage, StorageError, StorageResult,
    },
};
use async_trait::async_trait;
use chrono::Utc;
use futures::{StreamExt, stream};
use md5::Context;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::{
    collections::{HashMap, VecDeque},
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex, PoisonError, Weak},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::{Mutex, OwnedMutexGuard},
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const MIGRATION_SQL: &str = include_str!("../../migrations/0001_init.sql");
const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const LIST_PAGE_SIZE: usize = 256;

#[derive(Clone)]
pub struct LocalStorage {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    /// Keeps the payload file and the metadata row of one key in step.
    locks: Arc<KeyLocks>,
}

/// One async mutex per object key, held only while a file and its row are
/// swapped, removed, or opened together.
#[derive(Default)]
struct KeyLocks {
    entries: StdMutex<HashMap<ObjectRef, Weak<Mutex<()>>>>,
}

impl KeyLocks {
    async fn lock(&self, object: &ObjectRef) -> OwnedMutexGuard<()> {
        let lock = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.retain(|_, entry| entry.strong_count() > 0);
            match entries.get(object).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(Mutex::new(()));
                    entries.insert(object.clone(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }
}

impl LocalStorage {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            locks: Arc::default(),
        }
    }

    /// Open (creating if needed) the SQLite database and storage directory,
    /// then apply the schema.
    pub async fn connect(database_url: &str, base_path: impl Into<PathBuf>) -> StorageResult<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).await?;

        // SQLx refuses to open a missing file, so create it up front.
        let db_path = database_url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:")
            .trim_start_matches("file:");
        if !db_path.starts_with(":memory:") {
            let db_path = Path::new(db_path);
            if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).await?;
            }
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(db_path)?;
            debug!("SQLite database file ready at {}", db_path.display());
        }

        let db = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let storage = Self::new(Arc::new(db), base_path);
        storage.migrate().await?;
        Ok(storage)
    }

    /// Run the embedded schema statements. Safe to call repeatedly.
    pub async fn migrate(&self) -> StorageResult<()> {
        let statements = MIGRATION_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty());

        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Reject keys that could escape the bucket directory.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StorageError::InvalidObjectKey);
        }
        // Empty segments (`a//b`, `dir/`, `/a`) would not survive the path join.
        if key
            .split('/')
            .any(|seg| seg.is_empty() || seg == ".." || seg == ".")
        {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.bytes().any(|b| b.is_ascii_control() || b == b'\\') {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Validate bucket name format.
    ///
    /// Enforces S3-like naming rules so the bucket maps onto a predictable
    /// directory: 3–63 characters of lowercase letters, digits, dots and
    /// hyphens, starting and ending alphanumerically, not shaped like an IPv4
    /// address.
    fn ensure_bucket_name_safe(&self, name: &str) -> StorageResult<()> {
        let invalid = |reason: &str| StorageError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        let len = name.len();
        if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
            return Err(invalid("must be between 3 and 63 characters"));
        }

        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, dots, and hyphens",
            ));
        }

        if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
            return Err(invalid("must start and end with a lowercase letter or digit"));
        }

        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return Err(invalid(
                "cannot contain consecutive dots or dot-hyphen combinations",
            ));
        }

        if is_ipv4_like(name) {
            return Err(invalid("must not be formatted like an IP address"));
        }

        Ok(())
    }

    fn ensure_object_safe(&self, object: &ObjectRef) -> StorageResult<()> {
        self.ensure_bucket_name_safe(&object.bucket)?;
        self.ensure_key_safe(&object.key)
    }

    fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        self.base_path.join(bucket_name)
    }

    /// Two-level shard directories from MD5(bucket/key), keeping the file
    /// count per directory small.
    fn object_shards(object: &ObjectRef) -> (String, String) {
        let digest = md5::compute(object.to_string());
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, object: &ObjectRef) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(object);
        let mut path = self.bucket_root(&object.bucket);
        path.push(shard_a);
        path.push(shard_b);
        path.push(&object.key);
        path
    }

    async fn fetch_object(&self, object: &ObjectRef) -> StorageResult<ObjectRecord> {
        sqlx::query_as::<_, ObjectRecord>(
            "SELECT bucket, key, content_type, size_bytes, etag, metadata, last_modified
             FROM objects
             WHERE bucket = ? AND key = ?",
        )
        .bind(&object.bucket)
        .bind(&object.key)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::no_such_key(object),
            other => StorageError::Sqlx(other),
        })
    }

    /// Copy the body into `tmp_path`, returning its size and MD5 etag.
    ///
    /// Reads one chunk at a time; nothing beyond the current chunk is held
    /// in memory.
    async fn write_payload(
        &self,
        tmp_path: &Path,
        mut body: ObjectStream,
    ) -> StorageResult<(u64, String)> {
        let mut file = File::create(tmp_path).await?;
        let mut size_bytes: u64 = 0;
        let mut digest = Context::new();

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            size_bytes += chunk.len() as u64;
            digest.consume(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        Ok((size_bytes, format!("{:x}", digest.compute())))
    }

    /// Remove empty shard directories up to (not including) the bucket root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    /// Writes to a temporary file and fsyncs it, then renames it into place
    /// and upserts the metadata row under the key lock (overwrite semantics).
    async fn put(&self, object: &ObjectRef, upload: UploadDescriptor) -> StorageResult<u64> {
        self.ensure_object_safe(object)?;

        let file_path = self.object_path(object);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let (size_bytes, etag) = match self.write_payload(&tmp_path, upload.body).await {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };

        let _guard = self.locks.lock(object).await;
        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        let content_type = upload
            .content_type
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        let metadata = serde_json::to_string(&upload.metadata)?;

        let upsert = sqlx::query(
            r#"
            INSERT INTO objects (
                bucket, key, content_type, size_bytes, etag, metadata, last_modified
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket, key) DO UPDATE SET
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                metadata = excluded.metadata,
                last_modified = excluded.last_modified
            "#,
        )
        .bind(&object.bucket)
        .bind(&object.key)
        .bind(&content_type)
        .bind(size_bytes as i64)
        .bind(&etag)
        .bind(&metadata)
        .bind(Utc::now())
        .execute(&*self.db)
        .await;

        match upsert {
            Ok(_) => Ok(size_bytes),
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                Err(StorageError::Sqlx(err))
            }
        }
    }

    async fn get(&self, object: &ObjectRef) -> StorageResult<ObjectReader> {
        self.ensure_object_safe(object)?;

        // Row and file are read under the key lock; once open, the handle
        // keeps this version readable even if it is replaced.
        let guard = self.locks.lock(object).await;
        let record = self.fetch_object(object).await?;
        let file = File::open(self.object_path(object))
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    StorageError::no_such_key(object)
                } else {
                    StorageError::Io(err)
                }
            })?;
        drop(guard);

        Ok(ObjectReader {
            body: ReaderStream::new(file).boxed(),
            info: record.info().map_err(StorageError::from),
        })
    }

    fn list(&self, bucket: &str, prefix: &str) -> KeyStream {
        if let Err(err) = self.ensure_bucket_name_safe(bucket) {
            return stream::once(async move { Err(err) }).boxed();
        }

        ListCursor {
            db: self.db.clone(),
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            after: String::new(),
            page: VecDeque::new(),
            exhausted: false,
        }
        .into_stream()
    }

    /// Hard-deletes the row, removes the payload and prunes empty shard
    /// directories.
    async fn delete(&self, object: &ObjectRef) -> StorageResult<()> {
        self.ensure_object_safe(object)?;
        let _guard = self.locks.lock(object).await;

        let result = sqlx::query("DELETE FROM objects WHERE bucket = ? AND key = ?")
            .bind(&object.bucket)
            .bind(&object.key)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::no_such_key(object));
        }

        let file_path = self.object_path(object);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            let bucket_root = self.bucket_root(&object.bucket);
            self.prune_empty_dirs(parent, &bucket_root).await;
        }

        Ok(())
    }

    /// `SELECT 1` against SQLite plus a write/read/delete probe under
    /// `base_path`.
    async fn check(&self) -> StorageResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;

        let probe = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&probe, b"readyz").await?;
        let read_back = fs::read(&probe).await;
        let _ = fs::remove_file(&probe).await;

        if read_back? != b"readyz" {
            return Err(StorageError::Io(io::Error::other("file content mismatch")));
        }
        Ok(())
    }
}

/// Keyset-paginated walk over the `objects` table.
struct ListCursor {
    db: Arc<SqlitePool>,
    bucket: String,
    prefix: String,
    after: String,
    page: VecDeque<String>,
    exhausted: bool,
}

impl ListCursor {
    fn into_stream(self) -> KeyStream {
        stream::unfold(self, |mut cursor| async move {
            if cursor.page.is_empty() && !cursor.exhausted {
                if let Err(err) = cursor.fetch_page().await {
                    cursor.exhausted = true;
                    return Some((Err(err), cursor));
                }
            }

            let key = cursor.page.pop_front()?;
            cursor.after.clone_from(&key);
            Some((Ok(key), cursor))
        })
        .boxed()
    }

    async fn fetch_page(&mut self) -> StorageResult<()> {
        let keys: Vec<String> = sqlx::query_scalar(
            "SELECT key FROM objects
             WHERE bucket = ? AND substr(key, 1, length(?)) = ? AND key > ?
             ORDER BY key ASC
             LIMIT ?",
        )
        .bind(&self.bucket)
        .bind(&self.prefix)
        .bind(&self.prefix)
        .bind(&self.after)
        .bind(LIST_PAGE_SIZE as i64)
        .fetch_all(&*self.db)
        .await?;

        debug!(
            bucket = %self.bucket,
            prefix = %self.prefix,
            count = keys.len(),
            "fetched listing page"
        );
        self.exhausted = keys.len() < LIST_PAGE_SIZE;
        self.page.extend(keys);
        Ok(())
    }
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::TryStreamExt;
    use std::{collections::BTreeMap, time::Duration};
    use tempfile::TempDir;

    async fn storage() -> (LocalStorage, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        let storage = LocalStorage::new(Arc::new(db), dir.path().join("objects"));
        storage.migrate().await.expect("migrate");
        fs::create_dir_all(&storage.base_path).await.unwrap();
        (storage, dir)
    }

    fn upload(chunks: &[&'static str], content_type: Option<&str>) -> UploadDescriptor {
        let chunks: Vec<io::Result<Bytes>> = chunks
            .iter()
            .map(|c| Ok(Bytes::from_static(c.as_bytes())))
            .collect();
        UploadDescriptor {
            content_type: content_type.map(str::to_string),
            declared_size: None,
            metadata: BTreeMap::from([("author".to_string(), "ada".to_string())]),
            body: stream::iter(chunks).boxed(),
        }
    }

    async fn read_all(reader: ObjectReader) -> Vec<u8> {
        reader
            .body
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn put_then_get_round_trips_payload_and_metadata() {
        let (storage, _dir) = storage().await;
        let object = ObjectRef::new("mybucket", "docs/report.txt");

        let written = storage
            .put(&object, upload(&["hello ", "world"], Some("text/plain")))
            .await
            .unwrap();
        assert_eq!(written, 11);

        let reader = storage.get(&object).await.unwrap();
        let info = reader.info.as_ref().unwrap().clone();
        assert_eq!(info.content_type, "text/plain");
        assert_eq!(info.size, Some(11));
        assert_eq!(info.metadata["x-amz-meta-author"], vec!["ada".to_string()]);
        assert_eq!(read_all(reader).await, b"hello world");
    }

    #[tokio::test]
    async fn put_overwrites_existing_object() {
        let (storage, _dir) = storage().await;
        let object = ObjectRef::new("mybucket", "a.txt");

        storage.put(&object, upload(&["first"], None)).await.unwrap();
        storage.put(&object, upload(&["second!"], None)).await.unwrap();

        let reader = storage.get(&object).await.unwrap();
        assert_eq!(
            reader.info.as_ref().unwrap().content_type,
            DEFAULT_CONTENT_TYPE
        );
        assert_eq!(read_all(reader).await, b"second!");
    }

    #[tokio::test]
    async fn failed_body_leaves_no_object_behind() {
        let (storage, _dir) = storage().await;
        let object = ObjectRef::new("mybucket", "broken.bin");
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(ErrorKind::ConnectionReset, "client went away")),
        ])
        .boxed();

        let err = storage
            .put(
                &object,
                UploadDescriptor {
                    content_type: None,
                    declared_size: Some(100),
                    metadata: BTreeMap::new(),
                    body,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));

        let missing = storage.get(&object).await.err().expect("object must not exist");
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn get_missing_object_is_structured_not_found() {
        let (storage, _dir) = storage().await;
        let err = storage
            .get(&ObjectRef::new("mybucket", "missing.txt"))
            .await
            .err()
            .unwrap();

        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "The specified key does not exist.");
        assert!(err.verbose().contains("key: missing.txt"));
    }

    #[tokio::test]
    async fn list_filters_by_prefix_across_pages() {
        let (storage, _dir) = storage().await;
        for i in 0..(LIST_PAGE_SIZE + 3) {
            let object = ObjectRef::new("mybucket", format!("logs/{:04}.log", i));
            storage.put(&object, upload(&["x"], None)).await.unwrap();
        }
        storage
            .put(&ObjectRef::new("mybucket", "other/1.log"), upload(&["x"], None))
            .await
            .unwrap();
        storage
            .put(&ObjectRef::new("elsewhere", "logs/9999.log"), upload(&["x"], None))
            .await
            .unwrap();

        let keys: Vec<String> = storage
            .list("mybucket", "logs/")
            .try_collect()
            .await
            .unwrap();

        assert_eq!(keys.len(), LIST_PAGE_SIZE + 3);
        assert_eq!(keys[0], "logs/0000.log");
        assert!(keys.iter().all(|k| k.starts_with("logs/")));
    }

    #[tokio::test]
    async fn list_treats_like_wildcards_literally() {
        let (storage, _dir) = storage().await;
        storage
            .put(&ObjectRef::new("mybucket", "a_b/1"), upload(&["x"], None))
            .await
            .unwrap();
        storage
            .put(&ObjectRef::new("mybucket", "axb/1"), upload(&["x"], None))
            .await
            .unwrap();

        let keys: Vec<String> = storage.list("mybucket", "a_b").try_collect().await.unwrap();
        assert_eq!(keys, vec!["a_b/1".to_string()]);
    }

    #[tokio::test]
    async fn list_with_invalid_bucket_yields_single_error() {
        let (storage, _dir) = storage().await;
        let items: Vec<StorageResult<String>> = storage.list("A", "").collect().await;

        assert_eq!(items.len(), 1);
        assert!(matches!(
            items[0],
            Err(StorageError::InvalidBucketName { .. })
        ));
    }

    #[tokio::test]
    async fn delete_removes_object_and_reports_missing() {
        let (storage, _dir) = storage().await;
        let object = ObjectRef::new("mybucket", "nested/dir/file.txt");
        storage.put(&object, upload(&["x"], None)).await.unwrap();

        storage.delete(&object).await.unwrap();
        assert!(!storage.object_path(&object).exists());
        assert!(storage.get(&object).await.err().unwrap().is_not_found());
        assert!(storage.delete(&object).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn rejects_unsafe_keys_and_buckets() {
        let (storage, _dir) = storage().await;

        for key in ["../escape", "/abs", "a/../b", "bad\\key"] {
            let err = storage
                .put(&ObjectRef::new("mybucket", key), upload(&["x"], None))
                .await
                .unwrap_err();
            assert!(matches!(err, StorageError::InvalidObjectKey), "{key}");
        }

        for bucket in ["ab", "Upper", "-lead", "1.2.3.4", "a..b"] {
            let err = storage
                .put(&ObjectRef::new(bucket, "k"), upload(&["x"], None))
                .await
                .unwrap_err();
            assert!(
                matches!(err, StorageError::InvalidBucketName { .. }),
                "{bucket}"
            );
        }
    }

    #[tokio::test]
    async fn check_passes_on_healthy_storage() {
        let (storage, _dir) = storage().await;
        storage.check().await.unwrap();
    }

    #[tokio::test]
    async fn rejects_keys_with_empty_segments() {
        let (storage, _dir) = storage().await;

        for key in ["dir/", "a//b", "/lead", "trail//"] {
            let object = ObjectRef::new("mybucket", key);
            let err = storage.put(&object, upload(&["x"], None)).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidObjectKey), "{key}");
            assert!(matches!(
                storage.get(&object).await.err().unwrap(),
                StorageError::InvalidObjectKey
            ));
        }
    }

    #[tokio::test]
    async fn key_lock_blocks_same_key_only() {
        let locks = KeyLocks::default();
        let object = ObjectRef::new("mybucket", "a.txt");

        let held = locks.lock(&object).await;
        let same = tokio::time::timeout(Duration::from_millis(50), locks.lock(&object)).await;
        assert!(same.is_err());

        let other = tokio::time::timeout(
            Duration::from_millis(50),
            locks.lock(&ObjectRef::new("mybucket", "b.txt")),
        )
        .await;
        assert!(other.is_ok());

        drop(held);
        drop(other);
        let again = tokio::time::timeout(Duration::from_millis(50), locks.lock(&object)).await;
        assert!(again.is_ok());
    }

    /// Reads back `object` and checks the row describes the bytes on disk.
    async fn assert_consistent(storage: &LocalStorage, object: &ObjectRef) -> usize {
        let reader = storage.get(object).await.unwrap();
        let info = reader.info.as_ref().unwrap().clone();
        let body = read_all(reader).await;

        assert_eq!(info.size, Some(body.len() as u64));
        assert_eq!(
            info.metadata["etag"],
            vec![format!("\"{:x}\"", md5::compute(&body))]
        );
        body.len()
    }

    async fn file_backed_storage() -> (LocalStorage, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let url = format!("sqlite://{}", dir.path().join("meta/gateway.db").display());
        let storage = LocalStorage::connect(&url, dir.path().join("objects"))
            .await
            .expect("local storage");
        (storage, dir)
    }

    fn sized_upload(len: usize) -> UploadDescriptor {
        // Several chunks so writers yield and interleave.
        let chunks: Vec<io::Result<Bytes>> = Bytes::from(vec![len as u8; len])
            .chunks(len / 4 + 1)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        UploadDescriptor {
            content_type: None,
            declared_size: Some(len as u64),
            metadata: BTreeMap::new(),
            body: stream::iter(chunks).boxed(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_puts_on_one_key_keep_row_and_payload_in_step() {
        let (storage, _dir) = file_backed_storage().await;
        let object = ObjectRef::new("mybucket", "contended.bin");

        for round in 0..8 {
            let writers: Vec<_> = (1..=6)
                .map(|i| {
                    let storage = storage.clone();
                    let object = object.clone();
                    tokio::spawn(async move {
                        storage.put(&object, sized_upload(i * 1000 + round)).await
                    })
                })
                .collect();
            for writer in writers {
                writer.await.unwrap().unwrap();
            }

            let len = assert_consistent(&storage, &object).await;
            assert_eq!((len - round) % 1000, 0);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_put_and_delete_never_orphan_the_row() {
        let (storage, _dir) = file_backed_storage().await;
        let object = ObjectRef::new("mybucket", "churn.bin");

        for _ in 0..8 {
            let put = {
                let (storage, object) = (storage.clone(), object.clone());
                tokio::spawn(async move { storage.put(&object, sized_upload(4096)).await })
            };
            let delete = {
                let (storage, object) = (storage.clone(), object.clone());
                tokio::spawn(async move { storage.delete(&object).await })
            };
            put.await.unwrap().unwrap();
            let _ = delete.await.unwrap();

            let listed: Vec<String> = storage
                .list("mybucket", "")
                .try_collect()
                .await
                .unwrap();
            match storage.get(&object).await {
                Ok(_) => {
                    assert_eq!(listed, vec!["churn.bin".to_string()]);
                    assert_consistent(&storage, &object).await;
                }
                Err(err) => {
                    assert!(err.is_not_found());
                    assert!(listed.is_empty());
                }
            }
        }
    }
}
