//! src/services/storage_service.rs
//!
//! ObjectStore - filename-keyed image payloads persisted in SQLite, with a
//! SHA-256 checksum per record, a capacity cap, an age-based sweep and a
//! read cache shared through the `PipelineContext`.
//!
//! Writes are single upsert statements, so a reader sees either the old
//! record or the new one in full.

use crate::{
    context::PipelineContext,
    models::{media_type::MediaType, stored_object::StoredObject},
    validation::{self, Policy, ValidationError},
};
use bytes::Bytes;
use chrono::Utc;
use rand::Rng;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const MAX_STORED_IMAGES: usize = 100;
pub const RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

const GENERATED_PREFIX: &str = "image-";
const SUFFIX_LEN: usize = 5;
const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const INIT_MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("store already holds the maximum of {max} images")]
    CapacityExceeded { max: usize },
    #[error("`{0}` not found")]
    NotFound(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Limits the store enforces on write and re-checks on read.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub max_stored_images: usize,
    pub retention: Duration,
    pub policy: Policy,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            max_stored_images: MAX_STORED_IMAGES,
            retention: RETENTION,
            policy: Policy::default(),
        }
    }
}

/// ObjectStore provides the three vault operations:
/// - `put` validates, checksums and upserts a payload under a filename
/// - `get` revalidates and returns a payload, preferring the read cache
/// - `sweep` deletes everything older than the retention window
#[derive(Clone)]
pub struct ObjectStore {
    /// Shared SQLite connection pool holding the `stored_objects` table.
    pub db: Arc<SqlitePool>,

    ctx: PipelineContext,
    settings: Arc<StoreSettings>,

    /// Holds a `get` between loading a row and caching it.
    #[cfg(test)]
    load_pause: Option<Arc<tests::LoadPause>>,
}

impl ObjectStore {
    pub fn new(db: Arc<SqlitePool>, ctx: PipelineContext, settings: StoreSettings) -> Self {
        Self {
            db,
            ctx,
            settings: Arc::new(settings),
            #[cfg(test)]
            load_pause: None,
        }
    }

    /// Apply the embedded schema. Safe to run on every start.
    pub async fn migrate(db: &SqlitePool) -> StorageResult<()> {
        let statements = INIT_MIGRATION
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        info!("Running {} migration statements...", statements.len());

        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(db).await?;
        }
        Ok(())
    }

    /// Store a payload and return the key it lives under.
    ///
    /// A missing `filename` gets a generated one. At capacity the write is
    /// refused; existing records are never evicted to make room, but an
    /// overwrite of a key that is already live is still accepted.
    pub async fn put(
        &self,
        payload: Bytes,
        media_type: &str,
        filename: Option<&str>,
        original_name: Option<&str>,
    ) -> StorageResult<String> {
        let policy = &self.settings.policy;
        let media = policy.check_media_type(media_type)?;
        policy.check_size(payload.len())?;

        let filename = match filename {
            Some(requested) => {
                let clean = validation::sanitize(requested);
                validation::check_name(&clean)?;
                clean
            }
            None => generate_filename(media),
        };
        let original_name = original_name
            .map(validation::sanitize)
            .filter(|name| !name.is_empty());
        let checksum = digest_hex(&payload);
        let created_at = Utc::now().timestamp_millis();

        let result = sqlx::query(
            r#"
            INSERT INTO stored_objects (
                filename, media_type, payload, size_bytes, created_at,
                original_name, checksum
            )
            SELECT ?, ?, ?, ?, ?, ?, ?
            WHERE (SELECT COUNT(*) FROM stored_objects) < ?
               OR EXISTS (SELECT 1 FROM stored_objects WHERE filename = ?)
            ON CONFLICT(filename) DO UPDATE SET
                media_type = excluded.media_type,
                payload = excluded.payload,
                size_bytes = excluded.size_bytes,
                created_at = excluded.created_at,
                original_name = excluded.original_name,
                checksum = excluded.checksum
            "#,
        )
        .bind(&filename)
        .bind(media.as_mime())
        .bind(payload.as_ref())
        .bind(payload.len() as i64)
        .bind(created_at)
        .bind(original_name.as_deref())
        .bind(&checksum)
        .bind(self.settings.max_stored_images as i64)
        .bind(&filename)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            warn!(%filename, "put refused: store at capacity");
            return Err(StorageError::CapacityExceeded {
                max: self.settings.max_stored_images,
            });
        }

        self.ctx.bump_write_epoch();
        self.ctx.cache().invalidate(&filename).await;
        info!(%filename, size = payload.len(), media_type = %media, "stored object");
        Ok(filename)
    }

    /// Fetch a payload by key.
    ///
    /// Anything that would not survive `sanitize` unchanged, fails its
    /// checksum, or no longer passes the type/size policy reads as missing.
    pub async fn get(&self, filename: &str) -> StorageResult<Arc<StoredObject>> {
        if validation::sanitize(filename) != filename || validation::check_name(filename).is_err()
        {
            debug!(filename, "rejecting lookup of unsanitized filename");
            return Err(StorageError::NotFound(filename.to_string()));
        }

        let cache = self.ctx.cache();
        if let Some(cached) = cache.get(filename).await {
            if self.passes_policy(&cached) {
                debug!(filename, "read cache hit");
                return Ok(cached);
            }
            cache.invalidate(filename).await;
        }
        debug!(filename, "read cache miss");

        let epoch = self.ctx.write_epoch();
        let record = sqlx::query_as::<_, StoredObject>(
            "SELECT filename, media_type, payload, size_bytes, created_at,
                    original_name, checksum
             FROM stored_objects WHERE filename = ?",
        )
        .bind(filename)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| StorageError::NotFound(filename.to_string()))?;

        if !self.passes_integrity(&record) || !self.passes_policy(&record) {
            return Err(StorageError::NotFound(filename.to_string()));
        }

        #[cfg(test)]
        if let Some(pause) = &self.load_pause {
            pause.hold().await;
        }

        let record = Arc::new(record);
        cache.insert(filename.to_string(), record.clone()).await;
        // a put or sweep committed during the load and may have invalidated
        // before this insert landed
        if self.ctx.write_epoch() != epoch {
            cache.invalidate(filename).await;
        }
        Ok(record)
    }

    /// Delete every record older than the retention window.
    ///
    /// Returns how many rows went. Repeated or concurrent calls are safe.
    pub async fn sweep(&self) -> StorageResult<u64> {
        let retention_ms = i64::try_from(self.settings.retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp_millis().saturating_sub(retention_ms);

        let removed: Vec<String> = sqlx::query_scalar(
            "DELETE FROM stored_objects WHERE created_at < ? RETURNING filename",
        )
        .bind(cutoff)
        .fetch_all(&*self.db)
        .await?;

        if !removed.is_empty() {
            self.ctx.bump_write_epoch();
        }
        for filename in &removed {
            self.ctx.cache().invalidate(filename).await;
        }
        if !removed.is_empty() {
            info!(deleted = removed.len(), "sweep removed expired objects");
        }
        Ok(removed.len() as u64)
    }

    /// Number of live records.
    pub async fn count(&self) -> StorageResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stored_objects")
            .fetch_one(&*self.db)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Type and size checks against the current policy.
    fn passes_policy(&self, record: &StoredObject) -> bool {
        let policy = &self.settings.policy;
        let ok = policy.check_media_type(&record.media_type).is_ok()
            && policy.check_size(record.payload.len()).is_ok()
            && record.size_bytes == record.payload.len() as i64;
        if !ok {
            debug!(filename = %record.filename, "record no longer passes policy");
        }
        ok
    }

    fn passes_integrity(&self, record: &StoredObject) -> bool {
        match record.checksum.as_deref() {
            Some(expected) if digest_hex(&record.payload) != expected => {
                warn!(filename = %record.filename, "checksum mismatch, treating as missing");
                false
            }
            _ => true,
        }
    }
}

/// Lowercase hex SHA-256.
pub fn digest_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// `image-<base36 millis>-<5 random base36>.<ext>`
fn generate_filename(media: MediaType) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| BASE36[rng.random_range(0..BASE36.len())] as char)
        .collect();
    let stamp = to_base36(Utc::now().timestamp_millis().max(0) as u64);
    format!(
        "{GENERATED_PREFIX}{stamp}-{suffix}.{}",
        media.preferred_extension()
    )
}

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".into();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use tokio::sync::Notify;

    /// Lets a test run writes while a `get` sits between its SELECT and
    /// its cache insert.
    #[derive(Default)]
    pub(crate) struct LoadPause {
        loaded: Notify,
        resume: Notify,
    }

    impl LoadPause {
        pub(crate) async fn hold(&self) {
            self.loaded.notify_one();
            self.resume.notified().await;
        }
    }

    const WEBP: &[u8] = b"RIFF\x24\x00\x00\x00WEBPVP8 payload";

    /// Single-connection in-memory pool with the schema applied.
    pub(crate) async fn memory_pool() -> Arc<SqlitePool> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        ObjectStore::migrate(&pool).await.unwrap();
        Arc::new(pool)
    }

    async fn store_with(settings: StoreSettings) -> ObjectStore {
        ObjectStore::new(memory_pool().await, PipelineContext::new(16), settings)
    }

    async fn store() -> ObjectStore {
        store_with(StoreSettings::default()).await
    }

    async fn age_record(store: &ObjectStore, filename: &str, by: Duration) {
        sqlx::query("UPDATE stored_objects SET created_at = created_at - ? WHERE filename = ?")
            .bind(by.as_millis() as i64)
            .bind(filename)
            .execute(&*store.db)
            .await
            .unwrap();
    }

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1_700_000_000_000), "loyw3v28");
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = store().await;
        let key = store
            .put(Bytes::from_static(WEBP), "image/webp", None, Some("cat.png"))
            .await
            .unwrap();

        let record = store.get(&key).await.unwrap();
        assert_eq!(record.payload, WEBP);
        assert_eq!(record.media_type, "image/webp");
        assert_eq!(record.original_name.as_deref(), Some("cat.png"));
        assert_eq!(record.checksum.as_deref(), Some(digest_hex(WEBP).as_str()));
    }

    #[tokio::test]
    async fn test_generated_filename_shape() {
        let store = store().await;
        let key = store
            .put(Bytes::from_static(WEBP), "image/webp", None, None)
            .await
            .unwrap();

        assert!(key.starts_with(GENERATED_PREFIX));
        assert!(key.ends_with(".webp"));
        let stem = &key[GENERATED_PREFIX.len()..key.len() - ".webp".len()];
        let (stamp, suffix) = stem.split_once('-').unwrap();
        assert!(!stamp.is_empty());
        assert_eq!(suffix.len(), SUFFIX_LEN);
        assert!(validation::check_name(&key).is_ok());
    }

    #[tokio::test]
    async fn test_put_sanitizes_supplied_names() {
        let store = store().await;
        let key = store
            .put(
                Bytes::from_static(WEBP),
                "image/webp",
                Some("../evil<1>.webp"),
                Some("..\u{0}orig.webp"),
            )
            .await
            .unwrap();
        assert_eq!(key, "evil1.webp");
        let record = store.get(&key).await.unwrap();
        assert_eq!(record.original_name.as_deref(), Some("orig.webp"));
    }

    #[tokio::test]
    async fn test_put_rejects_invalid_input() {
        let store = store().await;
        assert!(matches!(
            store
                .put(Bytes::from_static(b"x"), "text/plain", None, None)
                .await,
            Err(StorageError::Validation(ValidationError::UnsupportedType(_)))
        ));
        assert!(matches!(
            store.put(Bytes::new(), "image/png", None, None).await,
            Err(StorageError::Validation(ValidationError::Empty))
        ));
        assert!(matches!(
            store
                .put(Bytes::from_static(WEBP), "image/webp", Some("..."), None)
                .await,
            Err(StorageError::Validation(ValidationError::EmptyName))
        ));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_put_refuses_over_capacity_without_eviction() {
        let store = store_with(StoreSettings {
            max_stored_images: 3,
            ..StoreSettings::default()
        })
        .await;

        let mut keys = Vec::new();
        for i in 0..3 {
            let name = format!("img-{i}.webp");
            keys.push(
                store
                    .put(Bytes::from_static(WEBP), "image/webp", Some(&name), None)
                    .await
                    .unwrap(),
            );
        }

        let err = store
            .put(Bytes::from_static(WEBP), "image/webp", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::CapacityExceeded { max: 3 }));
        assert_eq!(store.count().await.unwrap(), 3);
        for key in &keys {
            assert!(store.get(key).await.is_ok());
        }

        // replacing a live key does not grow the store
        store
            .put(Bytes::from_static(b"GIF89a"), "image/gif", Some("img-0.webp"), None)
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_overwrite_last_put_wins() {
        let store = store().await;
        store
            .put(Bytes::from_static(WEBP), "image/webp", Some("same.webp"), None)
            .await
            .unwrap();
        assert_eq!(store.get("same.webp").await.unwrap().payload, WEBP);

        store
            .put(Bytes::from_static(b"second"), "image/webp", Some("same.webp"), None)
            .await
            .unwrap();
        let record = store.get("same.webp").await.unwrap();
        assert_eq!(record.payload, b"second");
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_rejects_unsanitized_names() {
        let store = store().await;
        for name in ["a..b.webp", "<x>.webp", ".hidden", "", "dir/a.webp"] {
            assert!(matches!(
                store.get(name).await,
                Err(StorageError::NotFound(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_get_fails_closed_on_checksum_mismatch() {
        let store = store().await;
        let key = store
            .put(Bytes::from_static(WEBP), "image/webp", Some("t.webp"), None)
            .await
            .unwrap();
        sqlx::query("UPDATE stored_objects SET payload = ? WHERE filename = ?")
            .bind(&b"RIFF tampered"[..])
            .bind(&key)
            .execute(&*store.db)
            .await
            .unwrap();

        assert!(matches!(store.get(&key).await, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_record_without_checksum_is_readable() {
        let store = store().await;
        sqlx::query(
            "INSERT INTO stored_objects (filename, media_type, payload, size_bytes, created_at)
             VALUES ('legacy.webp', 'image/webp', ?, ?, ?)",
        )
        .bind(WEBP)
        .bind(WEBP.len() as i64)
        .bind(Utc::now().timestamp_millis())
        .execute(&*store.db)
        .await
        .unwrap();

        assert_eq!(store.get("legacy.webp").await.unwrap().payload, WEBP);
    }

    #[tokio::test]
    async fn test_get_rechecks_tightened_policy() {
        let db = memory_pool().await;
        let lenient = ObjectStore::new(db.clone(), PipelineContext::new(4), StoreSettings::default());
        lenient
            .put(Bytes::from_static(WEBP), "image/webp", Some("big.webp"), None)
            .await
            .unwrap();

        let strict = ObjectStore::new(
            db,
            PipelineContext::new(4),
            StoreSettings {
                policy: Policy::with_max_blob_size(4),
                ..StoreSettings::default()
            },
        );
        assert!(matches!(
            strict.get("big.webp").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(lenient.get("big.webp").await.is_ok());
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let store = store().await;
        let old = store
            .put(Bytes::from_static(WEBP), "image/webp", Some("old.webp"), None)
            .await
            .unwrap();
        let fresh = store
            .put(Bytes::from_static(WEBP), "image/webp", Some("fresh.webp"), None)
            .await
            .unwrap();
        let nearly = store
            .put(Bytes::from_static(WEBP), "image/webp", Some("nearly.webp"), None)
            .await
            .unwrap();
        // warm the cache so the sweep has to invalidate it
        store.get(&old).await.unwrap();
        age_record(&store, &old, RETENTION + Duration::from_secs(3600)).await;
        age_record(&store, &nearly, RETENTION - Duration::from_secs(60)).await;

        assert_eq!(store.sweep().await.unwrap(), 1);
        assert!(matches!(store.get(&old).await, Err(StorageError::NotFound(_))));
        assert!(store.get(&fresh).await.is_ok());
        assert!(store.get(&nearly).await.is_ok());

        assert_eq!(store.sweep().await.unwrap(), 0);
    }

    /// Store whose `get` parks after loading a row, plus the pause handle.
    async fn pausing_store() -> (ObjectStore, Arc<LoadPause>) {
        let mut store = store().await;
        let pause = Arc::new(LoadPause::default());
        store.load_pause = Some(pause.clone());
        (store, pause)
    }

    #[tokio::test]
    async fn test_overwrite_during_load_is_not_cached_stale() {
        let (store, pause) = pausing_store().await;
        let mut writer = store.clone();
        writer.load_pause = None;
        writer
            .put(Bytes::from_static(WEBP), "image/webp", Some("race.webp"), None)
            .await
            .unwrap();

        let reader = store.clone();
        let pending = tokio::spawn(async move { reader.get("race.webp").await });
        pause.loaded.notified().await;

        writer
            .put(Bytes::from_static(b"second"), "image/webp", Some("race.webp"), None)
            .await
            .unwrap();
        pause.resume.notify_one();

        // the overlapping read may return either version
        pending.await.unwrap().unwrap();
        assert_eq!(writer.get("race.webp").await.unwrap().payload, b"second");
    }

    #[tokio::test]
    async fn test_sweep_during_load_is_not_cached_stale() {
        let (store, pause) = pausing_store().await;
        let mut writer = store.clone();
        writer.load_pause = None;
        writer
            .put(Bytes::from_static(WEBP), "image/webp", Some("gone.webp"), None)
            .await
            .unwrap();
        age_record(&writer, "gone.webp", RETENTION + Duration::from_secs(60)).await;

        let reader = store.clone();
        let pending = tokio::spawn(async move { reader.get("gone.webp").await });
        pause.loaded.notified().await;

        assert_eq!(writer.sweep().await.unwrap(), 1);
        pause.resume.notify_one();

        pending.await.unwrap().unwrap();
        assert!(matches!(
            writer.get("gone.webp").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_verified_payload() {
        let store = store().await;
        let key = store
            .put(Bytes::from_static(WEBP), "image/webp", None, None)
            .await
            .unwrap();

        let (a, b) = tokio::join!(store.get(&key), store.get(&key));
        let (a, b) = (a.unwrap(), b.unwrap());
        let expected = digest_hex(WEBP);
        assert_eq!(digest_hex(&a.payload), expected);
        assert_eq!(digest_hex(&b.payload), expected);
        assert_eq!(a.checksum.as_deref(), Some(expected.as_str()));
    }

    #[tokio::test]
    async fn test_get_and_put_on_different_keys_do_not_interfere() {
        let store = store().await;
        let existing = store
            .put(Bytes::from_static(WEBP), "image/webp", Some("a.webp"), None)
            .await
            .unwrap();

        let (read, write) = tokio::join!(
            store.get(&existing),
            store.put(Bytes::from_static(b"GIF89a"), "image/gif", Some("b.gif"), None)
        );
        assert_eq!(read.unwrap().payload, WEBP);
        assert_eq!(write.unwrap(), "b.gif");
        assert_eq!(store.get("b.gif").await.unwrap().payload, b"GIF89a");
    }
}
