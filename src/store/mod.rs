//! Crash-safe, watchable, per-key-locked CRUD over a directory (spec §4.1).
//!
//! `Store<E>` is the sole persister for any [`crate::metadata::Object`] type:
//! the reconciler and the RPC façade only ever read or mutate through it, so
//! `resource_version` and the watch stream stay authoritative.

mod watch;

pub use watch::{Event, Watch, DEFAULT_WATCH_CAPACITY};

use crate::error::{RuntimeError, RuntimeResult};
use crate::lockmap::LockMap;
use crate::metadata::Object;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{instrument, warn};
use watch::Subscribers;

/// Hook applied to a record the moment it is first persisted (e.g. stamping
/// `status.state = Pending`). Spec §4.1 calls this the `CreateStrategy`.
pub type CreateStrategy<E> = Arc<dyn Fn(&mut E) + Send + Sync>;

/// Typed CRUD store for one entity type, rooted at a single directory.
///
/// One file per record, named after its `id`. `kind` is a human-readable
/// label (e.g. `"Machine"`) used only to annotate errors.
pub struct Store<E: Object> {
    dir: PathBuf,
    kind: &'static str,
    locks: LockMap<String>,
    subscribers: Arc<Subscribers<E>>,
    create_strategy: Option<CreateStrategy<E>>,
}

impl<E: Object> Store<E> {
    /// Opens (creating if necessary) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>, kind: &'static str) -> RuntimeResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            kind,
            locks: LockMap::new(),
            subscribers: Arc::new(Subscribers::new()),
            create_strategy: None,
        })
    }

    pub fn with_create_strategy(mut self, strategy: CreateStrategy<E>) -> Self {
        self.create_strategy = Some(strategy);
        self
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    async fn read_file(&self, id: &str) -> RuntimeResult<Option<E>> {
        match fs::read(self.path_for(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
                RuntimeError::internal(format!("{} {id:?}: unmarshal failed: {e}", self.kind))
            })?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whole-file replacement via write-to-temp + rename, so a crash mid-write
    /// never leaves a half-written record at the canonical path (spec §4.1).
    /// I/O errors here are surfaced to the caller as `Internal`, not
    /// swallowed — see spec §9(i).
    async fn write_file(&self, id: &str, obj: &E) -> RuntimeResult<()> {
        let payload = serde_json::to_vec_pretty(obj)?;
        let final_path = self.path_for(id);
        let tmp_path = self.dir.join(format!(".{id}.tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&tmp_path, &payload).await.map_err(|e| {
            warn!(kind = self.kind, id, error = %e, "store write failed");
            RuntimeError::from(e)
        })?;
        fs::rename(&tmp_path, &final_path).await.map_err(|e| {
            warn!(kind = self.kind, id, error = %e, "store rename failed");
            RuntimeError::from(e)
        })
    }

    async fn remove_file(&self, id: &str) -> RuntimeResult<()> {
        match fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, obj), fields(kind = self.kind, id = %obj.meta().id))]
    pub async fn create(&self, mut obj: E) -> RuntimeResult<E> {
        let id = obj.meta().id.clone();
        let _guard = self.locks.lock(id.clone());
        if self.read_file(&id).await?.is_some() {
            return Err(RuntimeError::already_exists(self.kind, id));
        }
        let now = now_millis();
        {
            let meta = obj.meta_mut();
            meta.created_at = now;
            meta.resource_version = 1;
        }
        if let Some(strategy) = &self.create_strategy {
            strategy(&mut obj);
        }
        self.write_file(&id, &obj).await?;
        self.subscribers.publish(Event::Created(obj.clone()));
        Ok(obj)
    }

    #[instrument(skip(self), fields(kind = self.kind))]
    pub async fn get(&self, id: &str) -> RuntimeResult<E> {
        let _guard = self.locks.lock(id.to_string());
        self.read_file(id)
            .await?
            .ok_or_else(|| RuntimeError::not_found(self.kind, id))
    }

    #[instrument(skip(self, obj), fields(kind = self.kind, id = %obj.meta().id))]
    pub async fn update(&self, obj: E) -> RuntimeResult<E> {
        let id = obj.meta().id.clone();
        let _guard = self.locks.lock(id.clone());
        let current = self
            .read_file(&id)
            .await?
            .ok_or_else(|| RuntimeError::not_found(self.kind, id.clone()))?;

        if current.meta().resource_version != obj.meta().resource_version {
            return Err(RuntimeError::ResourceVersionConflict {
                kind: self.kind,
                id,
                expected: obj.meta().resource_version,
                actual: current.meta().resource_version,
            });
        }

        if obj.meta().deleted_at.is_some() && obj.meta().finalizers.is_empty() {
            self.remove_file(&id).await?;
            self.subscribers.publish(Event::Deleted(obj.clone()));
            return Ok(obj);
        }

        if current == obj {
            return Ok(obj);
        }

        let spec_changed = obj.spec_changed(&current);
        let mut next = obj;
        next.meta_mut().resource_version += 1;
        if spec_changed {
            next.meta_mut().generation += 1;
        }
        self.write_file(&id, &next).await?;
        self.subscribers.publish(Event::Updated(next.clone()));
        Ok(next)
    }

    #[instrument(skip(self), fields(kind = self.kind))]
    pub async fn delete(&self, id: &str) -> RuntimeResult<()> {
        let _guard = self.locks.lock(id.to_string());
        let mut current = self
            .read_file(id)
            .await?
            .ok_or_else(|| RuntimeError::not_found(self.kind, id))?;

        if current.meta().can_hard_delete() {
            self.remove_file(id).await?;
            self.subscribers.publish(Event::Deleted(current));
            return Ok(());
        }

        if current.meta().is_deleted() {
            // Idempotent: already soft-deleted, nothing to do.
            return Ok(());
        }

        current.meta_mut().deleted_at = Some(now_millis());
        current.meta_mut().resource_version += 1;
        self.write_file(id, &current).await?;
        self.subscribers.publish(Event::Deleted(current));
        Ok(())
    }

    #[instrument(skip(self), fields(kind = self.kind))]
    pub async fn list(&self) -> RuntimeResult<Vec<E>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // Skip in-flight temp files from a concurrent write.
            if name.starts_with('.') {
                continue;
            }
            ids.push(name.into_owned());
        }

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(&id).await {
                Ok(obj) => out.push(obj),
                Err(RuntimeError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Lists records whose labels satisfy `selector` (empty selector matches
    /// everything).
    pub async fn list_matching(&self, selector: &BTreeMap<String, String>) -> RuntimeResult<Vec<E>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|o| o.meta().matches_labels(selector))
            .collect())
    }

    /// Subscribes to the store's change feed with the default bounded
    /// capacity (spec §4.1).
    pub fn watch(&self) -> Watch<E> {
        self.subscribers.subscribe(DEFAULT_WATCH_CAPACITY)
    }

    pub fn watch_with_capacity(&self, capacity: usize) -> Watch<E> {
        self.subscribers.subscribe(capacity)
    }

    pub fn root(&self) -> &Path {
        &self.dir
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ObjectMeta;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Widget {
        metadata: ObjectMeta,
        value: i64,
    }

    impl Object for Widget {
        fn meta(&self) -> &ObjectMeta {
            &self.metadata
        }
        fn meta_mut(&mut self) -> &mut ObjectMeta {
            &mut self.metadata
        }
    }

    fn widget(id: &str, value: i64) -> Widget {
        Widget {
            metadata: ObjectMeta::new(id),
            value,
        }
    }

    /// A spec/status-split record, used to exercise `generation` tracking
    /// the way `Machine` does (`src/machine/mod.rs`'s `Object` impl) without
    /// pulling the whole machine domain into a store test.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Widget2 {
        metadata: ObjectMeta,
        spec: i64,
        status: i64,
    }

    impl Object for Widget2 {
        fn meta(&self) -> &ObjectMeta {
            &self.metadata
        }
        fn meta_mut(&mut self) -> &mut ObjectMeta {
            &mut self.metadata
        }
        fn spec_changed(&self, previous: &Self) -> bool {
            self.spec != previous.spec
        }
    }

    fn widget2(id: &str, spec: i64, status: i64) -> Widget2 {
        Widget2 {
            metadata: ObjectMeta::new(id),
            spec,
            status,
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store: Store<Widget> = Store::open(dir.path(), "Widget").await.unwrap();
        let created = store.create(widget("w1", 1)).await.unwrap();
        assert_eq!(created.metadata.resource_version, 1);
        assert_ne!(created.metadata.created_at, 0);

        let got = store.get("w1").await.unwrap();
        assert_eq!(got, created);
    }

    #[tokio::test]
    async fn create_twice_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store: Store<Widget> = Store::open(dir.path(), "Widget").await.unwrap();
        store.create(widget("w1", 1)).await.unwrap();
        let err = store.create(widget("w1", 2)).await.unwrap_err();
        assert!(matches!(err, RuntimeError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn update_stale_version_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let store: Store<Widget> = Store::open(dir.path(), "Widget").await.unwrap();
        let mut w = store.create(widget("w1", 1)).await.unwrap();
        w.value = 2;
        let updated = store.update(w.clone()).await.unwrap();
        assert_eq!(updated.metadata.resource_version, 2);

        let mut stale = w;
        stale.value = 3;
        let err = store.update(stale).await.unwrap_err();
        assert!(matches!(err, RuntimeError::ResourceVersionConflict { .. }));
    }

    #[tokio::test]
    async fn update_no_op_does_not_bump_version() {
        let dir = tempfile::tempdir().unwrap();
        let store: Store<Widget> = Store::open(dir.path(), "Widget").await.unwrap();
        let w = store.create(widget("w1", 1)).await.unwrap();
        let same = store.update(w.clone()).await.unwrap();
        assert_eq!(same.metadata.resource_version, w.metadata.resource_version);
    }

    #[tokio::test]
    async fn delete_with_finalizers_soft_deletes_then_hard_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store: Store<Widget> = Store::open(dir.path(), "Widget").await.unwrap();
        let mut w = widget("m1", 1);
        w.metadata.finalizers.push("reconciler".into());
        let w = store.create(w).await.unwrap();

        store.delete(&w.metadata.id).await.unwrap();
        let soft_deleted = store.get(&w.metadata.id).await.unwrap();
        assert!(soft_deleted.metadata.deleted_at.is_some());

        // Still visible from List.
        assert_eq!(store.list().await.unwrap().len(), 1);

        let mut cleared = soft_deleted;
        cleared.metadata.finalizers.clear();
        store.update(cleared).await.unwrap();

        let err = store.get("m1").await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound { .. }));
    }

    #[tokio::test]
    async fn delete_unknown_id_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store: Store<Widget> = Store::open(dir.path(), "Widget").await.unwrap();
        let err = store.delete("ghost").await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound { .. }));
    }

    #[tokio::test]
    async fn delete_without_finalizers_hard_deletes_and_emits_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let store: Store<Widget> = Store::open(dir.path(), "Widget").await.unwrap();
        let mut watch = store.watch();
        store.create(widget("w1", 1)).await.unwrap();
        store.delete("w1").await.unwrap();

        assert!(matches!(watch.recv().await, Some(Event::Created(_))));
        assert!(matches!(watch.recv().await, Some(Event::Deleted(_))));
        let err = store.get("w1").await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound { .. }));
    }

    #[tokio::test]
    async fn watch_overflow_drops_but_list_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let store: Store<Widget> = Store::open(dir.path(), "Widget").await.unwrap();
        let mut watch = store.watch_with_capacity(1);

        store.create(widget("w1", 1)).await.unwrap();
        // Fill and overflow the bounded channel without draining it.
        for i in 0..5 {
            let mut w = store.get("w1").await.unwrap();
            w.value = i;
            store.update(w).await.unwrap();
        }

        // Only ever observe a subset; List is the resync path.
        let mut seen = 0;
        while watch.try_recv().is_some() {
            seen += 1;
        }
        assert!(seen < 6);

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn status_only_update_bumps_resource_version_but_not_generation() {
        let dir = tempfile::tempdir().unwrap();
        let store: Store<Widget2> = Store::open(dir.path(), "Widget2").await.unwrap();
        let created = store.create(widget2("w1", 1, 1)).await.unwrap();
        assert_eq!(created.metadata.generation, 0);

        let mut w = created.clone();
        w.status = 2;
        let updated = store.update(w).await.unwrap();
        assert_eq!(updated.metadata.resource_version, created.metadata.resource_version + 1);
        assert_eq!(updated.metadata.generation, 0);
    }

    #[tokio::test]
    async fn spec_changing_update_bumps_generation() {
        let dir = tempfile::tempdir().unwrap();
        let store: Store<Widget2> = Store::open(dir.path(), "Widget2").await.unwrap();
        let created = store.create(widget2("w1", 1, 1)).await.unwrap();

        let mut w = created.clone();
        w.spec = 2;
        let updated = store.update(w).await.unwrap();
        assert_eq!(updated.metadata.generation, 1);

        // A second spec change bumps it again, independently of resource_version.
        let mut w2 = updated.clone();
        w2.spec = 3;
        w2.status = 9;
        let updated2 = store.update(w2).await.unwrap();
        assert_eq!(updated2.metadata.generation, 2);
        assert_eq!(updated2.metadata.resource_version, created.metadata.resource_version + 2);
    }
}
