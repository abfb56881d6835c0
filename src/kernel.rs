/// The reconciliation kernel: the orchestration of a single request against
/// the configured sources, store, and merge policy.
///
/// Each request resolves an internal key, reads every enabled source's
/// current view, computes (or loads) the common-ancestor document, diffs
/// each source's view against it, merges the patches per the entity's
/// configured policy, applies the merged patch to the ancestor, and
/// propagates the result back to every source whose view differs from it
/// — all inside one store transaction, with a bounded number of retries on
/// transient store failures.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value as JsonValue;

use crate::document::Document;
use crate::error::{RetconError, RetconResult};
use crate::keys::{EntityName, EntityUniverse, ForeignKey, InternalKey, SourceName};
use crate::merge::MergePolicy;
use crate::patch::{apply, calculate_initial_document, diff};
use crate::store::Store;
use crate::trace::{SourceOutcome, TraceRecord, TraceSink};
use crate::datasource::DataSource;

/// One of the four operations the CLI (or any other front end) can ask
/// the kernel to perform.
#[derive(Debug, Clone)]
pub enum Request {
    /// Create a new entity, seeded from the payload, at the named source.
    Create {
        entity: EntityName,
        source: SourceName,
        document: JsonValue,
    },
    /// Read the reconciled view of an existing foreign key.
    Read(ForeignKey),
    /// Update the view at one source, then reconcile.
    Update { key: ForeignKey, document: JsonValue },
    /// Delete the view at one source, then reconcile (propagating the
    /// deletion to every other source once all have deleted it).
    Delete(ForeignKey),
}

/// What a request produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The reconciled document after the round, and the foreign key that
    /// now identifies it (for `Create`, the newly assigned key).
    Reconciled { key: ForeignKey, document: JsonValue },
    /// The entity no longer exists at any source.
    Deleted,
}

/// Everything the kernel needs to run one round: the entity universe, the
/// per-entity merge policies, the configured sources, the store, and the
/// trace sink.
pub struct Kernel {
    universe: EntityUniverse,
    policies: HashMap<EntityName, Box<dyn MergePolicy>>,
    sources: HashMap<(EntityName, SourceName), Arc<dyn DataSource>>,
    store: Arc<dyn Store>,
    trace: Arc<dyn TraceSink>,
    max_retries: u32,
    retry_backoff: Duration,
}

impl Kernel {
    /// Assemble a kernel from its configured pieces.
    pub fn new(
        universe: EntityUniverse,
        policies: HashMap<EntityName, Box<dyn MergePolicy>>,
        sources: HashMap<(EntityName, SourceName), Arc<dyn DataSource>>,
        store: Arc<dyn Store>,
        trace: Arc<dyn TraceSink>,
    ) -> Self {
        Kernel {
            universe,
            policies,
            sources,
            store,
            trace,
            max_retries: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }

    /// Override the retry bound and initial backoff (defaults: 3
    /// attempts, 50ms).
    pub fn with_retry_policy(mut self, max_retries: u32, retry_backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = retry_backoff;
        self
    }

    fn policy_for(&self, entity: &EntityName) -> RetconResult<&dyn MergePolicy> {
        self.policies
            .get(entity)
            .map(AsRef::as_ref)
            .ok_or_else(|| RetconError::Config(format!("no merge policy configured for entity '{}'", entity)))
    }

    fn source_for(&self, entity: &EntityName, source: &SourceName) -> RetconResult<Arc<dyn DataSource>> {
        self.sources
            .get(&(entity.clone(), source.clone()))
            .cloned()
            .ok_or_else(|| {
                RetconError::Config(format!(
                    "no data source adaptor configured for '{}/{}'",
                    entity, source
                ))
            })
    }

    /// Run `request` to completion, retrying transient store failures up
    /// to the configured bound.
    pub async fn handle(&self, request: Request) -> RetconResult<Outcome> {
        let mut attempt = 0;
        loop {
            match self.handle_once(&request).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn handle_once(&self, request: &Request) -> RetconResult<Outcome> {
        let entity = match request {
            Request::Create { entity, .. } => entity.clone(),
            Request::Read(fk) | Request::Delete(fk) => fk.entity.clone(),
            Request::Update { key, .. } => key.entity.clone(),
        };

        // Step 1: resolve or allocate the internal key. `Create` has no
        // foreign key to resolve against yet (the source assigns the key
        // during its own step below), so it always allocates fresh; every
        // other request resolves against the key it was given.
        let seed_fk = match request {
            Request::Create { entity, source, .. } => {
                ForeignKey::new(entity.clone(), source.clone(), String::new())
            }
            Request::Read(fk) | Request::Update { key: fk, .. } | Request::Delete(fk) => fk.clone(),
        };
        self.universe.validate(&seed_fk)?;

        // `Read` never allocates: resolving an unknown foreign key through
        // the transactional `resolve_internal_key` would register it and
        // mint a fresh internal key as a side effect, which a read-only
        // probe must not do. Look it up read-only instead, and report
        // nothing found without opening a write transaction at all.
        if let Request::Read(fk) = request {
            let Some(ik) = self.store.read_only().find_internal_key(fk).await? else {
                return Ok(Outcome::Deleted);
            };
            let mut tx = self.store.begin().await?;
            let result = self.reconcile(&entity, request, ik, tx.as_mut()).await;
            return match result {
                Ok(outcome) => {
                    tx.rollback().await?;
                    Ok(outcome)
                }
                Err(e) => {
                    tx.rollback().await?;
                    Err(e)
                }
            };
        }

        // `Delete` of a foreign key nobody has ever resolved an internal
        // key for commits a no-op (§4.6 step 1): going through
        // `resolve_internal_key` here would allocate a fresh internal key
        // and index it just to immediately delete it, a side effect on
        // persistent state the spec forbids. Look it up read-only first,
        // exactly as `Read` does above.
        if let Request::Delete(fk) = request {
            let Some(ik) = self.store.read_only().find_internal_key(fk).await? else {
                return Ok(Outcome::Deleted);
            };
            let mut tx = self.store.begin().await?;
            let result = self.reconcile(&entity, request, ik, tx.as_mut()).await;
            return match result {
                Ok(outcome) => {
                    tx.commit().await?;
                    Ok(outcome)
                }
                Err(e) => {
                    tx.rollback().await?;
                    Err(e)
                }
            };
        }

        let mut tx = self.store.begin().await?;

        let ik = if matches!(request, Request::Create { .. }) {
            tx.allocate_internal_key().await?
        } else {
            tx.resolve_internal_key(&seed_fk).await?
        };

        let result = self.reconcile(&entity, request, ik, tx.as_mut()).await;
        match result {
            Ok(outcome) => {
                tx.commit().await?;
                Ok(outcome)
            }
            Err(e) => {
                tx.rollback().await?;
                Err(e)
            }
        }
    }

    async fn reconcile(
        &self,
        entity: &EntityName,
        request: &Request,
        ik: InternalKey,
        tx: &mut dyn crate::store::Transaction,
    ) -> RetconResult<Outcome> {
        let policy = self.policy_for(entity)?;
        let enabled_sources = self.universe.sources_for(entity).to_vec();

        // Step 2: apply the request's own write first, so its effect is
        // visible when every source's view is fetched in step 3.
        let written_key = match request {
            Request::Create { source, document, .. } => {
                let adaptor = self.source_for(entity, source)?;
                let key = adaptor.create(entity.as_str(), document).await?;
                let fk = ForeignKey::new(entity.clone(), source.clone(), key.clone());
                tx.record_foreign_key(&fk, ik).await?;
                Some(key)
            }
            Request::Update { key, document } => {
                let adaptor = self.source_for(entity, &key.source)?;
                adaptor.update(entity.as_str(), &key.key, document).await?;
                tx.record_foreign_key(key, ik).await?;
                None
            }
            Request::Delete(key) => {
                let adaptor = self.source_for(entity, &key.source)?;
                adaptor.delete(entity.as_str(), &key.key).await?;
                tx.delete_foreign_key(key).await?;
                None
            }
            Request::Read(_) => None,
        };

        // Step 3: fetch every enabled source's current view. Reads are
        // issued concurrently, but consumed in `SourceName` ascending order
        // so the merged patch is a pure function of the fetched values,
        // independent of which call happened to land first.
        let foreign_keys = tx.lookup_foreign_keys(ik).await?;
        let mut sorted_sources = enabled_sources.clone();
        sorted_sources.sort();
        let entity_str = entity.as_str().to_string();

        let mut fetches = Vec::new();
        for source in &sorted_sources {
            let Some(fk) = foreign_keys.iter().find(|fk| &fk.source == source).cloned() else {
                continue;
            };
            let adaptor = self.source_for(entity, source)?;
            let source = source.clone();
            let entity_str = entity_str.clone();
            fetches.push(async move {
                let result = adaptor.read(&entity_str, &fk.key).await;
                (source, result)
            });
        }
        let fetched = join_all(fetches).await;

        let mut views: Vec<(SourceName, Document)> = Vec::new();
        let mut outcomes: Vec<SourceOutcome> = Vec::new();
        for (source, result) in fetched {
            match result {
                Ok(Some(json)) => {
                    let doc = Document::from_json(&json)?;
                    outcomes.push(SourceOutcome::ok(source.clone(), doc.clone()));
                    views.push((source, doc));
                }
                Ok(None) => {
                    outcomes.push(SourceOutcome::absent(source));
                }
                Err(e) => {
                    outcomes.push(SourceOutcome::error(source, e.0.clone()));
                }
            }
        }

        if views.is_empty() && matches!(request, Request::Delete(_) | Request::Read(_)) {
            if matches!(request, Request::Delete(_)) {
                tx.delete_internal_key(ik).await?;
            }
            self.trace.record(TraceRecord::new(
                request_label(request),
                ik,
                outcomes,
                None,
                None,
                Vec::new(),
            ));
            return Ok(Outcome::Deleted);
        }

        // Step 4: load or compute the common-ancestor document.
        let stored_initial = tx.read_initial_document(ik).await?;
        let initial = match stored_initial {
            Some(doc) => doc,
            None => calculate_initial_document(views.iter().map(|(_, d)| d)),
        };

        // `Read` is a side-effect-free probe (§4.6): it still computes the
        // reconciled view so operators see what a real round would
        // converge to, but it must not persist a rejected-patch log,
        // overwrite the stored initial document, or write to any source.
        let is_read = matches!(request, Request::Read(_));

        // Step 5: diff each view against the ancestor, then merge.
        let patches: Vec<(SourceName, crate::patch::Patch)> = views
            .iter()
            .map(|(source, doc)| (source.clone(), diff(&initial, doc)))
            .collect();
        let (merged_patch, rejected) = policy.merge(&initial, &patches);
        if !is_read {
            for (source, patch) in &rejected {
                tx.record_rejected_patch(
                    ik,
                    source,
                    patch.clone(),
                    format!("rejected by merge policy '{}'", policy.name()),
                )
                .await?;
            }
        }

        // Step 6: compute the new agreed document.
        let mut agreed = apply(&initial, &merged_patch);
        if matches!(request, Request::Delete(_)) {
            agreed = Document::empty();
        }
        if !is_read {
            tx.write_initial_document(ik, agreed.clone()).await?;
        }

        // Step 7: propagate the agreed document back to every enabled
        // source, not just the ones a view was fetched from this round — a
        // source with no foreign key yet still needs `create`d into
        // existence (scenario: a freshly-created entity's other sources).
        // Adaptor failures here are recorded but must not abort the round:
        // the new initial is still committed so a later round retries
        // convergence (§4.6 step 7, §7 taxonomy for `DataSourceError`).
        if !is_read {
            for source in &sorted_sources {
                let existing_fk = foreign_keys.iter().find(|fk| &fk.source == source).cloned();
                let adaptor = self.source_for(entity, source)?;
                match existing_fk {
                    None => {
                        if agreed.is_empty() {
                            continue;
                        }
                        let json = agreed.to_json(|msg| {
                            tracing::warn!(target: "retcon::trace", internal_key = %ik, "{}", msg);
                        });
                        match adaptor.create(entity.as_str(), &json).await {
                            Ok(new_key) => {
                                let fk = ForeignKey::new(entity.clone(), source.clone(), new_key);
                                tx.record_foreign_key(&fk, ik).await?;
                            }
                            Err(e) => {
                                tracing::warn!(
                                    target: "retcon::trace",
                                    internal_key = %ik,
                                    source = %source,
                                    "propagate create failed: {}",
                                    e
                                );
                            }
                        }
                    }
                    Some(fk) => {
                        let already_converged = views
                            .iter()
                            .find(|(s, _)| s == source)
                            .map(|(_, view)| view == &agreed)
                            .unwrap_or(false);
                        if already_converged {
                            continue;
                        }
                        if agreed.is_empty() {
                            match adaptor.delete(entity.as_str(), &fk.key).await {
                                Ok(()) => {
                                    tx.delete_foreign_key(&fk).await?;
                                }
                                Err(e) => {
                                    tracing::warn!(
                                        target: "retcon::trace",
                                        internal_key = %ik,
                                        source = %source,
                                        "propagate delete failed: {}",
                                        e
                                    );
                                }
                            }
                        } else {
                            let json = agreed.to_json(|msg| {
                                tracing::warn!(target: "retcon::trace", internal_key = %ik, "{}", msg);
                            });
                            if let Err(e) = adaptor.update(entity.as_str(), &fk.key, &json).await {
                                tracing::warn!(
                                    target: "retcon::trace",
                                    internal_key = %ik,
                                    source = %source,
                                    "propagate update failed: {}",
                                    e
                                );
                            }
                        }
                    }
                }
            }
        }

        self.trace.record(TraceRecord::new(
            request_label(request),
            ik,
            outcomes,
            Some(initial.clone()),
            Some(agreed.clone()),
            rejected.clone(),
        ));

        let final_key = match request {
            Request::Create { source, .. } => {
                let new_key = written_key.expect("create always assigns a key");
                ForeignKey::new(entity.clone(), source.clone(), new_key)
            }
            Request::Read(fk) | Request::Update { key: fk, .. } | Request::Delete(fk) => fk.clone(),
        };

        if agreed.is_empty() && matches!(request, Request::Delete(_)) {
            Ok(Outcome::Deleted)
        } else {
            let json = agreed.to_json(|msg| tracing::warn!(target: "retcon::trace", "{}", msg));
            Ok(Outcome::Reconciled {
                key: final_key,
                document: json,
            })
        }
    }
}

fn request_label(request: &Request) -> &'static str {
    match request {
        Request::Create { .. } => "create",
        Request::Read(_) => "read",
        Request::Update { .. } => "update",
        Request::Delete(_) => "delete",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::DataSourceError;
    use crate::keys::EntityName;
    use crate::merge::parse_policy;
    use crate::store::InMemoryStore;
    use crate::trace::NullTraceSink;
    use dashmap::DashMap;
    use serde_json::json;

    /// An in-memory test double standing in for a real external system,
    /// keyed by an opaque counter.
    struct FakeSource {
        name: String,
        records: DashMap<String, JsonValue>,
        next_key: std::sync::atomic::AtomicU64,
    }

    impl FakeSource {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(FakeSource {
                name: name.to_string(),
                records: DashMap::new(),
                next_key: std::sync::atomic::AtomicU64::new(1),
            })
        }

        fn seed(&self, key: &str, value: JsonValue) {
            self.records.insert(key.to_string(), value);
        }
    }

    #[async_trait::async_trait]
    impl DataSource for FakeSource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn create(&self, _entity: &str, document: &JsonValue) -> Result<String, DataSourceError> {
            let key = self
                .next_key
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                .to_string();
            self.records.insert(key.clone(), document.clone());
            Ok(key)
        }

        async fn read(&self, _entity: &str, key: &str) -> Result<Option<JsonValue>, DataSourceError> {
            Ok(self.records.get(key).map(|r| r.clone()))
        }

        async fn update(&self, _entity: &str, key: &str, document: &JsonValue) -> Result<(), DataSourceError> {
            self.records.insert(key.to_string(), document.clone());
            Ok(())
        }

        async fn delete(&self, _entity: &str, key: &str) -> Result<(), DataSourceError> {
            self.records.remove(key);
            Ok(())
        }
    }

    fn test_kernel_with_store(
        policy: &str,
        data: Arc<FakeSource>,
        test_results: Arc<FakeSource>,
        store: Arc<InMemoryStore>,
    ) -> Kernel {
        let universe = EntityUniverse::new([(
            EntityName::new("customer"),
            vec![SourceName::new("data"), SourceName::new("test-results")],
        )]);
        let mut policies: HashMap<EntityName, Box<dyn MergePolicy>> = HashMap::new();
        policies.insert(EntityName::new("customer"), parse_policy(policy).unwrap());
        let mut sources: HashMap<(EntityName, SourceName), Arc<dyn DataSource>> = HashMap::new();
        sources.insert((EntityName::new("customer"), SourceName::new("data")), data);
        sources.insert(
            (EntityName::new("customer"), SourceName::new("test-results")),
            test_results,
        );
        // `Store` is implemented on `Arc<InMemoryStore>` itself (so a
        // transaction can cheaply hold its own strong reference back to
        // the store); wrapping once more is what turns that into the
        // `Arc<dyn Store>` trait object the kernel holds.
        let store: Arc<dyn Store> = Arc::new(store);
        Kernel::new(universe, policies, sources, store, Arc::new(NullTraceSink))
    }

    fn test_kernel(policy: &str, data: Arc<FakeSource>, test_results: Arc<FakeSource>) -> Kernel {
        test_kernel_with_store(policy, data, test_results, InMemoryStore::new())
    }

    /// Links `data/key` and `test-results/key` to the same internal key, as
    /// if a prior round had already discovered the correspondence between
    /// the two sources' views, and records `agreed_initial` as the
    /// already-converged ancestor document from that prior round.
    async fn linked_store(key: &str, agreed_initial: Document) -> Arc<InMemoryStore> {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let data_fk = ForeignKey::new(EntityName::new("customer"), SourceName::new("data"), key);
        let tr_fk = ForeignKey::new(
            EntityName::new("customer"),
            SourceName::new("test-results"),
            key,
        );
        let ik = tx.resolve_internal_key(&data_fk).await.unwrap();
        tx.record_foreign_key(&data_fk, ik).await.unwrap();
        tx.record_foreign_key(&tr_fk, ik).await.unwrap();
        tx.write_initial_document(ik, agreed_initial).await.unwrap();
        tx.commit().await.unwrap();
        store
    }

    #[tokio::test]
    async fn create_seeds_a_view_at_one_source() {
        let data = FakeSource::new("data");
        let test_results = FakeSource::new("test-results");
        let kernel = test_kernel("ignore-conflicts", data, test_results);

        let outcome = kernel
            .handle(Request::Create {
                entity: EntityName::new("customer"),
                source: SourceName::new("data"),
                document: json!({"name": "Alice"}),
            })
            .await
            .unwrap();

        match outcome {
            Outcome::Reconciled { document, .. } => {
                assert_eq!(document, json!({"name": "Alice"}));
            }
            Outcome::Deleted => panic!("expected a reconciled document"),
        }
    }

    #[tokio::test]
    async fn create_propagates_to_every_other_enabled_source() {
        let data = FakeSource::new("data");
        let test_results = FakeSource::new("test-results");
        let kernel = test_kernel("ignore-conflicts", data.clone(), test_results.clone());

        kernel
            .handle(Request::Create {
                entity: EntityName::new("customer"),
                source: SourceName::new("data"),
                document: json!({"name": "Alice"}),
            })
            .await
            .unwrap();

        assert_eq!(test_results.records.len(), 1);
        let seeded = test_results.records.iter().next().unwrap().value().clone();
        assert_eq!(seeded, json!({"name": "Alice"}));
    }

    #[tokio::test]
    async fn update_converges_a_second_source_to_the_merged_value() {
        let data = FakeSource::new("data");
        let test_results = FakeSource::new("test-results");
        data.seed("K1", json!({"name": "Alice"}));
        test_results.seed("K1", json!({"name": "Alice"}));
        let store = linked_store("K1", Document::from_json(&json!({"name": "Alice"})).unwrap()).await;
        let kernel = test_kernel_with_store("ignore-conflicts", data.clone(), test_results.clone(), store);

        let key = ForeignKey::new(EntityName::new("customer"), SourceName::new("data"), "K1");
        kernel
            .handle(Request::Update {
                key: key.clone(),
                document: json!({"name": "Alicia"}),
            })
            .await
            .unwrap();

        let tr_key = ForeignKey::new(EntityName::new("customer"), SourceName::new("test-results"), "K1");
        let outcome = kernel.handle(Request::Read(tr_key)).await.unwrap();
        match outcome {
            Outcome::Reconciled { document, .. } => {
                assert_eq!(document, json!({"name": "Alicia"}));
            }
            Outcome::Deleted => panic!("expected a reconciled document"),
        }
    }

    #[tokio::test]
    async fn delete_propagates_once_all_sources_agree() {
        let data = FakeSource::new("data");
        let test_results = FakeSource::new("test-results");
        data.seed("K1", json!({"name": "Alice"}));
        test_results.seed("K1", json!({"name": "Alice"}));
        let store = linked_store("K1", Document::from_json(&json!({"name": "Alice"})).unwrap()).await;
        let kernel = test_kernel_with_store("ignore-conflicts", data.clone(), test_results.clone(), store.clone());

        let key = ForeignKey::new(EntityName::new("customer"), SourceName::new("data"), "K1");
        let ik = store.read_only().find_internal_key(&key).await.unwrap().unwrap();
        kernel.handle(Request::Delete(key.clone())).await.unwrap();

        assert!(test_results.records.is_empty());
        // The internal-key row and its initial document are removed
        // outright, not left behind in a tombstoned state (§8 scenario 5).
        let read_only = store.read_only();
        assert_eq!(read_only.key_state(ik).await.unwrap(), crate::store::KeyState::Absent);
        assert_eq!(read_only.read_initial_document(ik).await.unwrap(), None);
        assert!(read_only.find_internal_key(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_of_an_unknown_key_does_not_allocate_one() {
        let data = FakeSource::new("data");
        let test_results = FakeSource::new("test-results");
        let store = InMemoryStore::new();
        let kernel = test_kernel_with_store("ignore-conflicts", data, test_results, store.clone());

        let key = ForeignKey::new(EntityName::new("customer"), SourceName::new("data"), "ghost");
        let outcome = kernel.handle(Request::Read(key.clone())).await.unwrap();

        assert_eq!(outcome, Outcome::Deleted);
        assert!(store.read_only().find_internal_key(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_of_an_unknown_key_commits_a_no_op() {
        let data = FakeSource::new("data");
        let test_results = FakeSource::new("test-results");
        let store = InMemoryStore::new();
        let kernel = test_kernel_with_store("ignore-conflicts", data.clone(), test_results, store.clone());

        let key = ForeignKey::new(EntityName::new("customer"), SourceName::new("data"), "ghost");
        let outcome = kernel.handle(Request::Delete(key.clone())).await.unwrap();

        assert_eq!(outcome, Outcome::Deleted);
        // No internal key was allocated and no adaptor call was made.
        assert!(store.read_only().find_internal_key(&key).await.unwrap().is_none());
        assert!(data.records.is_empty());
    }
}
