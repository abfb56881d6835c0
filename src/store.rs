/// The kernel's durable state: internal-key allocation, the foreign-key
/// index, stored initial documents, and the audit log of rejected patches.
///
/// The trait surface is split into a read-write handle (used by the
/// kernel while it holds a transaction open) and a read-only handle (used
/// by adaptors and inspection tools, which must not be able to mutate
/// kernel state). [`InMemoryStore`] is the reference implementation: a
/// `DashMap`-backed store with one lock per internal key, held for the
/// duration of a transaction so concurrent rounds against the same
/// logical entity serialize while unrelated entities proceed in
/// parallel.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::document::Document;
use crate::error::RetconResult;
use crate::keys::{ForeignKey, InternalKey, SourceName};
use crate::patch::Patch;

/// One entry in a key's rejected-patch audit log: the source whose patch
/// lost, the patch itself, why the merge policy rejected it, and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedPatch {
    pub source: SourceName,
    pub patch: Patch,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

/// The internal-key lifecycle state the kernel's protocol reasons about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// No internal key has ever been allocated for this foreign key, or
    /// every foreign key once bound to it has since been deleted and the
    /// record removed.
    Absent,
    /// At least one source currently has a live view recorded.
    Live,
    /// Transient, same-round-only state: the last foreign key bound to
    /// this internal key was just removed. Never observed after a
    /// transaction commits — the record is deleted outright the moment
    /// its foreign-key list goes empty, so a later lookup sees `Absent`.
    Tombstoned,
}

/// A transaction handle held across one reconciliation round. Dropping it
/// without committing is equivalent to `rollback`.
#[async_trait]
pub trait Transaction: Send {
    /// Commit all writes made through this handle.
    async fn commit(self: Box<Self>) -> RetconResult<()>;

    /// Discard all writes made through this handle.
    async fn rollback(self: Box<Self>) -> RetconResult<()>;

    /// Resolve the internal key for `fk`, allocating a fresh one if this
    /// is the first time the foreign key has been seen.
    async fn resolve_internal_key(&mut self, fk: &ForeignKey) -> RetconResult<InternalKey>;

    /// Allocate a brand-new internal key, unconditionally. Used for
    /// `create` requests, where no foreign key exists yet to resolve
    /// against.
    async fn allocate_internal_key(&mut self) -> RetconResult<InternalKey>;

    /// The current lifecycle state of `ik`.
    async fn key_state(&mut self, ik: InternalKey) -> RetconResult<KeyState>;

    /// Record that `fk` currently refers to `ik`.
    async fn record_foreign_key(&mut self, fk: &ForeignKey, ik: InternalKey) -> RetconResult<()>;

    /// All foreign keys currently recorded against `ik`.
    async fn lookup_foreign_keys(&mut self, ik: InternalKey) -> RetconResult<Vec<ForeignKey>>;

    /// Remove the association between `fk` and its internal key (the
    /// source no longer carries a view of this entity). Once the last
    /// foreign key bound to an internal key is removed this way, the
    /// internal key's record (including its initial document) is deleted
    /// outright.
    async fn delete_foreign_key(&mut self, fk: &ForeignKey) -> RetconResult<()>;

    /// Delete `ik` and cascade: every foreign key still bound to it is
    /// removed from the index too, and the record (including its initial
    /// document) is deleted. `ik` reads back as `Absent` afterwards.
    async fn delete_internal_key(&mut self, ik: InternalKey) -> RetconResult<()>;

    /// The stored initial (common-ancestor) document for `ik`, if any has
    /// ever been written.
    async fn read_initial_document(&mut self, ik: InternalKey) -> RetconResult<Option<Document>>;

    /// Persist the initial document computed for `ik` this round.
    async fn write_initial_document(
        &mut self,
        ik: InternalKey,
        document: Document,
    ) -> RetconResult<()>;

    /// Append a rejected per-source patch to the audit log for `ik`, tagged
    /// with the merge policy's reason for rejecting it.
    async fn record_rejected_patch(
        &mut self,
        ik: InternalKey,
        source: &SourceName,
        patch: Patch,
        reason: String,
    ) -> RetconResult<()>;
}

/// A read-only handle for inspection and adaptor use: everything
/// `Transaction` can read, nothing it can write.
#[async_trait]
pub trait ReadOnlyStore: Send + Sync {
    /// Look up the internal key currently associated with `fk`, if any.
    async fn find_internal_key(&self, fk: &ForeignKey) -> RetconResult<Option<InternalKey>>;

    /// The current lifecycle state of `ik`.
    async fn key_state(&self, ik: InternalKey) -> RetconResult<KeyState>;

    /// All foreign keys currently recorded against `ik`.
    async fn lookup_foreign_keys(&self, ik: InternalKey) -> RetconResult<Vec<ForeignKey>>;

    /// The stored initial document for `ik`, if any.
    async fn read_initial_document(&self, ik: InternalKey) -> RetconResult<Option<Document>>;

    /// The rejected-patch audit log recorded for `ik`, oldest first.
    async fn rejected_patches(&self, ik: InternalKey) -> RetconResult<Vec<RejectedPatch>>;
}

/// Opens transactions and hands out the read-only view used by adaptors.
#[async_trait]
pub trait Store: Send + Sync {
    /// Begin a transaction. Implementations serialize transactions that
    /// touch the same internal key; transactions against disjoint keys may
    /// proceed concurrently.
    async fn begin(&self) -> RetconResult<Box<dyn Transaction>>;

    /// A read-only view of the same underlying state.
    fn read_only(&self) -> Arc<dyn ReadOnlyStore>;
}

#[derive(Debug, Default, Clone)]
struct KeyRecord {
    state: KeyState,
    foreign_keys: Vec<ForeignKey>,
    initial_document: Option<Document>,
    rejected: Vec<RejectedPatch>,
}

impl Default for KeyState {
    fn default() -> Self {
        KeyState::Absent
    }
}

/// The reference in-memory `Store`. Not durable across process restarts;
/// intended for tests, demos, and as the scaffold a persistent
/// implementation would follow.
pub struct InMemoryStore {
    next_key: AtomicU64,
    foreign_key_index: DashMap<ForeignKey, InternalKey>,
    records: DashMap<InternalKey, KeyRecord>,
    locks: DashMap<InternalKey, Arc<Mutex<()>>>,
}

impl InMemoryStore {
    /// An empty store with no allocated internal keys.
    pub fn new() -> Arc<Self> {
        Arc::new(InMemoryStore {
            next_key: AtomicU64::new(1),
            foreign_key_index: DashMap::new(),
            records: DashMap::new(),
            locks: DashMap::new(),
        })
    }

    fn lock_for(&self, ik: InternalKey) -> Arc<Mutex<()>> {
        self.locks.entry(ik).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        InMemoryStore {
            next_key: AtomicU64::new(1),
            foreign_key_index: DashMap::new(),
            records: DashMap::new(),
            locks: DashMap::new(),
        }
    }
}

#[async_trait]
impl Store for Arc<InMemoryStore> {
    async fn begin(&self) -> RetconResult<Box<dyn Transaction>> {
        Ok(Box::new(InMemoryTransaction {
            store: self.clone(),
            held_locks: BTreeMap::new(),
            staged_records: BTreeMap::new(),
            staged_foreign_keys: BTreeMap::new(),
            committed: false,
        }))
    }

    fn read_only(&self) -> Arc<dyn ReadOnlyStore> {
        self.clone()
    }
}

#[async_trait]
impl ReadOnlyStore for InMemoryStore {
    async fn find_internal_key(&self, fk: &ForeignKey) -> RetconResult<Option<InternalKey>> {
        Ok(self.foreign_key_index.get(fk).map(|r| *r))
    }

    async fn key_state(&self, ik: InternalKey) -> RetconResult<KeyState> {
        Ok(self.records.get(&ik).map(|r| r.state).unwrap_or(KeyState::Absent))
    }

    async fn lookup_foreign_keys(&self, ik: InternalKey) -> RetconResult<Vec<ForeignKey>> {
        Ok(self
            .records
            .get(&ik)
            .map(|r| r.foreign_keys.clone())
            .unwrap_or_default())
    }

    async fn read_initial_document(&self, ik: InternalKey) -> RetconResult<Option<Document>> {
        Ok(self.records.get(&ik).and_then(|r| r.initial_document.clone()))
    }

    async fn rejected_patches(&self, ik: InternalKey) -> RetconResult<Vec<RejectedPatch>> {
        Ok(self.records.get(&ik).map(|r| r.rejected.clone()).unwrap_or_default())
    }
}

/// A transaction's view of one internal key's record, staged in memory
/// until commit. `Removed` means this transaction has deleted the record
/// (the last foreign key was dropped, or `delete_internal_key` was
/// called); committing it removes the row from the store rather than
/// writing anything back.
#[derive(Debug, Clone)]
enum Staged {
    Present(KeyRecord),
    Removed,
}

/// A transaction against [`InMemoryStore`]. Holds the lock for each
/// internal key it touches until committed or dropped. Every write goes
/// through `staged_records`/`staged_foreign_keys` first, read back by the
/// same transaction's own lookups (read-your-own-writes); only `commit`
/// applies them to the shared store, so `rollback` can discard a failed
/// round's writes without ever having mutated shared state.
struct InMemoryTransaction {
    store: Arc<InMemoryStore>,
    held_locks: BTreeMap<InternalKey, OwnedMutexGuard<()>>,
    staged_records: BTreeMap<InternalKey, Staged>,
    staged_foreign_keys: BTreeMap<ForeignKey, Option<InternalKey>>,
    committed: bool,
}

impl InMemoryTransaction {
    async fn ensure_locked(&mut self, ik: InternalKey) {
        if self.held_locks.contains_key(&ik) {
            return;
        }
        let lock = self.store.lock_for(ik);
        let guard = lock.lock_owned().await;
        self.held_locks.insert(ik, guard);
    }

    /// Resolve `fk` against this transaction's staged overlay, falling
    /// back to the committed store if nothing has been staged yet.
    fn find_foreign_key(&self, fk: &ForeignKey) -> Option<InternalKey> {
        match self.staged_foreign_keys.get(fk) {
            Some(staged) => *staged,
            None => self.store.foreign_key_index.get(fk).map(|r| *r),
        }
    }

    /// A snapshot of `ik`'s record as this transaction currently sees it.
    fn record_snapshot(&self, ik: InternalKey) -> KeyRecord {
        match self.staged_records.get(&ik) {
            Some(Staged::Present(record)) => record.clone(),
            Some(Staged::Removed) => KeyRecord::default(),
            None => self.store.records.get(&ik).map(|r| r.clone()).unwrap_or_default(),
        }
    }

    /// A mutable handle to `ik`'s staged record, seeded from the store
    /// (or a fresh default) the first time this transaction touches it.
    fn stage_mut(&mut self, ik: InternalKey) -> &mut KeyRecord {
        if !self.staged_records.contains_key(&ik) {
            let existing = self.store.records.get(&ik).map(|r| r.clone()).unwrap_or_default();
            self.staged_records.insert(ik, Staged::Present(existing));
        }
        let entry = self.staged_records.get_mut(&ik).expect("just inserted");
        if matches!(entry, Staged::Removed) {
            *entry = Staged::Present(KeyRecord::default());
        }
        match entry {
            Staged::Present(record) => record,
            Staged::Removed => unreachable!("just replaced with Present"),
        }
    }

    fn stage_remove(&mut self, ik: InternalKey) {
        self.staged_records.insert(ik, Staged::Removed);
    }

    /// Bind `fk` to `ik` in both the foreign-key overlay and `ik`'s
    /// staged record, marking the record `Live`.
    fn stage_bind(&mut self, fk: &ForeignKey, ik: InternalKey) {
        self.staged_foreign_keys.insert(fk.clone(), Some(ik));
        let record = self.stage_mut(ik);
        if !record.foreign_keys.contains(fk) {
            record.foreign_keys.push(fk.clone());
        }
        record.state = KeyState::Live;
    }
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn commit(mut self: Box<Self>) -> RetconResult<()> {
        for (fk, staged) in std::mem::take(&mut self.staged_foreign_keys) {
            match staged {
                Some(ik) => {
                    self.store.foreign_key_index.insert(fk, ik);
                }
                None => {
                    self.store.foreign_key_index.remove(&fk);
                }
            }
        }
        for (ik, staged) in std::mem::take(&mut self.staged_records) {
            match staged {
                Staged::Present(record) => {
                    self.store.records.insert(ik, record);
                }
                Staged::Removed => {
                    self.store.records.remove(&ik);
                }
            }
        }
        self.committed = true;
        self.held_locks.clear();
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> RetconResult<()> {
        // Staged writes are local to this transaction and never touched
        // the shared store; dropping them here is the whole rollback.
        self.staged_records.clear();
        self.staged_foreign_keys.clear();
        self.held_locks.clear();
        Ok(())
    }

    async fn resolve_internal_key(&mut self, fk: &ForeignKey) -> RetconResult<InternalKey> {
        if let Some(ik) = self.find_foreign_key(fk) {
            self.ensure_locked(ik).await;
            return Ok(ik);
        }
        let ik = InternalKey::new(self.store.next_key.fetch_add(1, Ordering::SeqCst));
        self.ensure_locked(ik).await;
        self.stage_bind(fk, ik);
        Ok(ik)
    }

    async fn allocate_internal_key(&mut self) -> RetconResult<InternalKey> {
        let ik = InternalKey::new(self.store.next_key.fetch_add(1, Ordering::SeqCst));
        self.ensure_locked(ik).await;
        Ok(ik)
    }

    async fn key_state(&mut self, ik: InternalKey) -> RetconResult<KeyState> {
        self.ensure_locked(ik).await;
        Ok(self.record_snapshot(ik).state)
    }

    async fn record_foreign_key(&mut self, fk: &ForeignKey, ik: InternalKey) -> RetconResult<()> {
        self.ensure_locked(ik).await;
        if let Some(existing) = self.find_foreign_key(fk) {
            if existing != ik {
                return Err(crate::error::RetconError::store_permanent(format!(
                    "foreign key '{}' is already bound to a different internal key",
                    fk
                )));
            }
        }
        self.stage_bind(fk, ik);
        Ok(())
    }

    async fn lookup_foreign_keys(&mut self, ik: InternalKey) -> RetconResult<Vec<ForeignKey>> {
        self.ensure_locked(ik).await;
        Ok(self.record_snapshot(ik).foreign_keys)
    }

    async fn delete_foreign_key(&mut self, fk: &ForeignKey) -> RetconResult<()> {
        let Some(ik) = self.find_foreign_key(fk) else {
            return Ok(());
        };
        self.ensure_locked(ik).await;
        self.staged_foreign_keys.insert(fk.clone(), None);
        let now_empty = {
            let record = self.stage_mut(ik);
            record.foreign_keys.retain(|k| k != fk);
            record.foreign_keys.is_empty()
        };
        if now_empty {
            self.stage_remove(ik);
        }
        Ok(())
    }

    async fn delete_internal_key(&mut self, ik: InternalKey) -> RetconResult<()> {
        self.ensure_locked(ik).await;
        for fk in self.record_snapshot(ik).foreign_keys {
            self.staged_foreign_keys.insert(fk, None);
        }
        self.stage_remove(ik);
        Ok(())
    }

    async fn read_initial_document(&mut self, ik: InternalKey) -> RetconResult<Option<Document>> {
        self.ensure_locked(ik).await;
        Ok(self.record_snapshot(ik).initial_document)
    }

    async fn write_initial_document(
        &mut self,
        ik: InternalKey,
        document: Document,
    ) -> RetconResult<()> {
        self.ensure_locked(ik).await;
        self.stage_mut(ik).initial_document = Some(document);
        Ok(())
    }

    async fn record_rejected_patch(
        &mut self,
        ik: InternalKey,
        source: &SourceName,
        patch: Patch,
        reason: String,
    ) -> RetconResult<()> {
        self.ensure_locked(ik).await;
        self.stage_mut(ik).rejected.push(RejectedPatch {
            source: source.clone(),
            patch,
            reason,
            recorded_at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::keys::{EntityName, SourceName};

    fn fk(key: &str) -> ForeignKey {
        ForeignKey::new(EntityName::new("customer"), SourceName::new("data"), key)
    }

    #[tokio::test]
    async fn resolving_the_same_foreign_key_twice_gives_the_same_internal_key() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let ik1 = tx.resolve_internal_key(&fk("K1")).await.unwrap();
        let ik2 = tx.resolve_internal_key(&fk("K1")).await.unwrap();
        assert_eq!(ik1, ik2);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn distinct_foreign_keys_get_distinct_internal_keys() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let ik1 = tx.resolve_internal_key(&fk("K1")).await.unwrap();
        let ik2 = tx.resolve_internal_key(&fk("K2")).await.unwrap();
        assert_ne!(ik1, ik2);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn initial_document_round_trips_through_commit() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let ik = tx.resolve_internal_key(&fk("K1")).await.unwrap();
        tx.write_initial_document(ik, Document::scalar("x")).await.unwrap();
        tx.commit().await.unwrap();

        let read_only = store.read_only();
        let doc = read_only.read_initial_document(ik).await.unwrap();
        assert_eq!(doc, Some(Document::scalar("x")));
    }

    #[tokio::test]
    async fn deleting_the_only_foreign_key_removes_the_internal_key() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let ik = tx.resolve_internal_key(&fk("K1")).await.unwrap();
        tx.record_foreign_key(&fk("K1"), ik).await.unwrap();
        tx.write_initial_document(ik, Document::scalar("x")).await.unwrap();
        tx.delete_foreign_key(&fk("K1")).await.unwrap();
        tx.commit().await.unwrap();

        let read_only = store.read_only();
        assert_eq!(read_only.key_state(ik).await.unwrap(), KeyState::Absent);
        assert!(read_only.lookup_foreign_keys(ik).await.unwrap().is_empty());
        assert_eq!(read_only.read_initial_document(ik).await.unwrap(), None);
        assert!(read_only.find_internal_key(&fk("K1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deleting_the_internal_key_cascades_every_bound_foreign_key() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let data_fk = fk("K1");
        let tr_fk = ForeignKey::new(EntityName::new("customer"), SourceName::new("test-results"), "K1");
        let ik = tx.resolve_internal_key(&data_fk).await.unwrap();
        tx.record_foreign_key(&tr_fk, ik).await.unwrap();
        tx.delete_internal_key(ik).await.unwrap();
        tx.commit().await.unwrap();

        let read_only = store.read_only();
        assert_eq!(read_only.key_state(ik).await.unwrap(), KeyState::Absent);
        assert!(read_only.find_internal_key(&data_fk).await.unwrap().is_none());
        assert!(read_only.find_internal_key(&tr_fk).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn a_transaction_sees_its_own_uncommitted_writes() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let ik = tx.resolve_internal_key(&fk("K1")).await.unwrap();
        tx.record_foreign_key(&fk("K1"), ik).await.unwrap();
        assert_eq!(tx.lookup_foreign_keys(ik).await.unwrap(), vec![fk("K1")]);
        assert!(store.read_only().find_internal_key(&fk("K1")).await.unwrap().is_none());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn rolling_back_discards_every_staged_write() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let ik = tx.resolve_internal_key(&fk("K1")).await.unwrap();
        tx.record_foreign_key(&fk("K1"), ik).await.unwrap();
        tx.write_initial_document(ik, Document::scalar("x")).await.unwrap();
        tx.rollback().await.unwrap();

        let read_only = store.read_only();
        assert!(read_only.find_internal_key(&fk("K1")).await.unwrap().is_none());
        assert_eq!(read_only.key_state(ik).await.unwrap(), KeyState::Absent);
        assert_eq!(read_only.read_initial_document(ik).await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejected_patches_are_logged_in_order() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let ik = tx.resolve_internal_key(&fk("K1")).await.unwrap();
        tx.record_rejected_patch(
            ik,
            &SourceName::new("data"),
            Patch::empty(),
            "conflict at /name".to_string(),
        )
        .await
        .unwrap();
        tx.record_rejected_patch(
            ik,
            &SourceName::new("test-results"),
            Patch::empty(),
            "conflict at /name".to_string(),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let read_only = store.read_only();
        let log = read_only.rejected_patches(ik).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].source, SourceName::new("data"));
        assert_eq!(log[1].source, SourceName::new("test-results"));
        assert_eq!(log[0].reason, "conflict at /name");
    }
}
