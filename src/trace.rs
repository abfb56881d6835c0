/// The verbose tracing side channel: a structured record of each
/// reconciliation round, independent of what gets returned to the caller.
///
/// A [`TraceRecord`] is emitted once per round by the kernel, win or lose,
/// carrying each source's outcome, the ancestor and merged documents (when
/// the round got that far), and the patches any merge policy rejected. The
/// default [`TraceSink`] forwards records through `tracing` under the
/// `retcon::trace` target; callers that need to inspect rounds
/// programmatically (tests, an audit UI) can supply their own sink.
use crate::document::Document;
use crate::keys::{InternalKey, SourceName};
use crate::patch::Patch;

/// One source's contribution to a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceOutcome {
    pub source: SourceName,
    pub status: SourceStatus,
}

/// What happened when the kernel tried to read a source's view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceStatus {
    /// The source returned a view, included here for the trace.
    Ok(Document),
    /// The source has no record for this entity.
    Absent,
    /// The read failed; the round proceeded without this source.
    Error(String),
}

impl SourceOutcome {
    pub fn ok(source: SourceName, document: Document) -> Self {
        SourceOutcome {
            source,
            status: SourceStatus::Ok(document),
        }
    }

    pub fn absent(source: SourceName) -> Self {
        SourceOutcome {
            source,
            status: SourceStatus::Absent,
        }
    }

    pub fn error(source: SourceName, reason: String) -> Self {
        SourceOutcome {
            source,
            status: SourceStatus::Error(reason),
        }
    }
}

/// A full record of one reconciliation round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub request_kind: &'static str,
    pub internal_key: InternalKey,
    pub sources: Vec<SourceOutcome>,
    pub initial_document: Option<Document>,
    pub merged_document: Option<Document>,
    pub rejected_patches: Vec<(SourceName, Patch)>,
}

impl TraceRecord {
    pub fn new(
        request_kind: &'static str,
        internal_key: InternalKey,
        sources: Vec<SourceOutcome>,
        initial_document: Option<Document>,
        merged_document: Option<Document>,
        rejected_patches: Vec<(SourceName, Patch)>,
    ) -> Self {
        TraceRecord {
            request_kind,
            internal_key,
            sources,
            initial_document,
            merged_document,
            rejected_patches,
        }
    }
}

/// Receives one [`TraceRecord`] per round. Implementations must not block
/// the kernel for long; the default sink only formats and logs.
pub trait TraceSink: Send + Sync {
    fn record(&self, record: TraceRecord);
}

/// Forwards every record to `tracing` under the `retcon::trace` target, at
/// `debug` level with one `info`-level summary line.
#[derive(Debug, Default)]
pub struct TracingSink;

impl TraceSink for TracingSink {
    fn record(&self, record: TraceRecord) {
        let ok = record
            .sources
            .iter()
            .filter(|s| matches!(s.status, SourceStatus::Ok(_)))
            .count();
        let absent = record
            .sources
            .iter()
            .filter(|s| matches!(s.status, SourceStatus::Absent))
            .count();
        let errored = record
            .sources
            .iter()
            .filter(|s| matches!(s.status, SourceStatus::Error(_)))
            .count();
        tracing::info!(
            target: "retcon::trace",
            internal_key = %record.internal_key,
            request = record.request_kind,
            sources_ok = ok,
            sources_absent = absent,
            sources_errored = errored,
            rejected = record.rejected_patches.len(),
            "reconciliation round"
        );
        for outcome in &record.sources {
            if let SourceStatus::Error(reason) = &outcome.status {
                tracing::debug!(
                    target: "retcon::trace",
                    internal_key = %record.internal_key,
                    source = %outcome.source,
                    "source read failed: {}",
                    reason
                );
            }
        }
        for (source, patch) in &record.rejected_patches {
            tracing::debug!(
                target: "retcon::trace",
                internal_key = %record.internal_key,
                source = %source,
                ops = patch.len(),
                "patch rejected by merge policy"
            );
        }
    }
}

/// Discards every record. Useful for tests that don't care about tracing
/// output.
#[derive(Debug, Default)]
pub struct NullTraceSink;

impl TraceSink for NullTraceSink {
    fn record(&self, _record: TraceRecord) {}
}

/// A sink that simply collects every record, for tests that want to
/// assert on what the kernel traced.
#[derive(Debug, Default)]
pub struct CollectingTraceSink {
    records: std::sync::Mutex<Vec<TraceRecord>>,
}

impl CollectingTraceSink {
    pub fn new() -> Self {
        CollectingTraceSink::default()
    }

    pub fn records(&self) -> Vec<TraceRecord> {
        self.records.lock().expect("trace sink mutex poisoned").clone()
    }
}

impl TraceSink for CollectingTraceSink {
    fn record(&self, record: TraceRecord) {
        self.records.lock().expect("trace sink mutex poisoned").push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SourceName;

    #[test]
    fn collecting_sink_keeps_records_in_order() {
        let sink = CollectingTraceSink::new();
        sink.record(TraceRecord::new(
            "read",
            InternalKey::new(1),
            vec![SourceOutcome::absent(SourceName::new("data"))],
            None,
            None,
            Vec::new(),
        ));
        sink.record(TraceRecord::new(
            "update",
            InternalKey::new(1),
            vec![],
            None,
            None,
            Vec::new(),
        ));
        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].request_kind, "read");
        assert_eq!(records[1].request_kind, "update");
    }

    #[test]
    fn null_sink_discards_everything() {
        let sink = NullTraceSink;
        sink.record(TraceRecord::new("read", InternalKey::new(1), vec![], None, None, Vec::new()));
    }
}
