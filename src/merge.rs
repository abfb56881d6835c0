/// Merge policies: pure functions that combine several sources' patches
/// (each derived against a common ancestor) into one merged patch plus a
/// list of rejected per-source patches.
///
/// "Conflict" means two sources' patches both touch the same
/// [`DocumentPath`] with different operations; an `Insert`/`Insert` with
/// identical values is not a conflict. Every built-in policy here is a
/// pure, deterministic function of its inputs: given the same patches in
/// the same canonical order, it produces bitwise-identical output.
use std::collections::BTreeMap;
use std::fmt;

use crate::document::{Document, DocumentPath};
use crate::error::RetconError;
use crate::keys::SourceName;
use crate::patch::{DocumentChange, Patch};

/// A merge policy, as configured for one entity.
pub trait MergePolicy: fmt::Debug + Send + Sync {
    /// Combine `initial` (the common ancestor, unused by the policies
    /// themselves but part of the documented contract — a policy is free
    /// to consult it) with each source's patch, returning the merged patch
    /// to apply to `initial` and the patches rejected per source.
    fn merge(
        &self,
        initial: &Document,
        patches: &[(SourceName, Patch)],
    ) -> (Patch, Vec<(SourceName, Patch)>);

    /// The canonical name used in configuration and traces.
    fn name(&self) -> String;
}

/// Any conflict between two sources at the same path rejects both
/// conflicting ops; non-conflicting ops are all accepted.
#[derive(Debug, Default)]
pub struct RejectAll;

/// Accept every op; ties at a conflicting path are broken by taking the
/// op from the source whose name sorts last.
#[derive(Debug, Default)]
pub struct IgnoreConflicts;

/// Accept only ops from the named source; everything else is rejected.
#[derive(Debug)]
pub struct TrustOnly(pub SourceName);

/// Accept every op; no rejections. Ties broken identically to
/// `IgnoreConflicts`. Distinguished from `IgnoreConflicts` only by name —
/// both built-ins describe the same resolution rule.
#[derive(Debug, Default)]
pub struct MergeAll;

/// One path's contributions, sorted by source name ascending so tie-break
/// ("take the last") and determinism fall out of plain iteration order.
fn group_by_path(
    patches: &[(SourceName, Patch)],
) -> BTreeMap<DocumentPath, Vec<(SourceName, Option<String>)>> {
    let mut sorted: Vec<&(SourceName, Patch)> = patches.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut grouped: BTreeMap<DocumentPath, Vec<(SourceName, Option<String>)>> = BTreeMap::new();
    for (source, patch) in sorted {
        for change in &patch.0 {
            let (path, value) = match change {
                DocumentChange::Insert(p, v) => (p.clone(), Some(v.clone())),
                DocumentChange::Delete(p) => (p.clone(), None),
            };
            grouped
                .entry(path)
                .or_default()
                .push((source.clone(), value));
        }
    }
    grouped
}

fn to_change(path: &DocumentPath, value: &Option<String>) -> DocumentChange {
    match value {
        Some(v) => DocumentChange::Insert(path.clone(), v.clone()),
        None => DocumentChange::Delete(path.clone()),
    }
}

fn is_conflict(ops: &[(SourceName, Option<String>)]) -> bool {
    ops.windows(2).any(|w| w[0].1 != w[1].1)
}

fn push_rejected(
    rejected: &mut BTreeMap<SourceName, Vec<DocumentChange>>,
    source: &SourceName,
    change: DocumentChange,
) {
    rejected.entry(source.clone()).or_default().push(change);
}

fn finish(
    merged: Vec<DocumentChange>,
    rejected: BTreeMap<SourceName, Vec<DocumentChange>>,
) -> (Patch, Vec<(SourceName, Patch)>) {
    let merged = Patch(merged).canonicalize();
    let rejected = rejected
        .into_iter()
        .map(|(source, ops)| (source, Patch(ops).canonicalize()))
        .collect();
    (merged, rejected)
}

impl MergePolicy for RejectAll {
    fn merge(
        &self,
        _initial: &Document,
        patches: &[(SourceName, Patch)],
    ) -> (Patch, Vec<(SourceName, Patch)>) {
        let mut merged = Vec::new();
        let mut rejected: BTreeMap<SourceName, Vec<DocumentChange>> = BTreeMap::new();
        for (path, ops) in group_by_path(patches) {
            if is_conflict(&ops) {
                for (source, value) in &ops {
                    push_rejected(&mut rejected, source, to_change(&path, value));
                }
            } else {
                let (_, value) = &ops[0];
                merged.push(to_change(&path, value));
            }
        }
        finish(merged, rejected)
    }

    fn name(&self) -> String {
        "reject-all".to_string()
    }
}

impl MergePolicy for IgnoreConflicts {
    fn merge(
        &self,
        _initial: &Document,
        patches: &[(SourceName, Patch)],
    ) -> (Patch, Vec<(SourceName, Patch)>) {
        let mut merged = Vec::new();
        for (path, ops) in group_by_path(patches) {
            // `ops` is already sorted by source name ascending; the last
            // entry is the tie-break winner whether or not there is an
            // actual conflict.
            let (_, value) = ops.last().expect("group_by_path never emits empty groups");
            merged.push(to_change(&path, value));
        }
        finish(merged, BTreeMap::new())
    }

    fn name(&self) -> String {
        "ignore-conflicts".to_string()
    }
}

impl MergePolicy for MergeAll {
    fn merge(
        &self,
        initial: &Document,
        patches: &[(SourceName, Patch)],
    ) -> (Patch, Vec<(SourceName, Patch)>) {
        IgnoreConflicts.merge(initial, patches)
    }

    fn name(&self) -> String {
        "merge-all".to_string()
    }
}

impl MergePolicy for TrustOnly {
    fn merge(
        &self,
        _initial: &Document,
        patches: &[(SourceName, Patch)],
    ) -> (Patch, Vec<(SourceName, Patch)>) {
        let mut merged = Vec::new();
        let mut rejected: BTreeMap<SourceName, Vec<DocumentChange>> = BTreeMap::new();
        for (path, ops) in group_by_path(patches) {
            for (source, value) in &ops {
                if *source == self.0 {
                    merged.push(to_change(&path, value));
                } else {
                    push_rejected(&mut rejected, source, to_change(&path, value));
                }
            }
        }
        finish(merged, rejected)
    }

    fn name(&self) -> String {
        format!("trust-only:{}", self.0)
    }
}

/// Parse a `merge-policy` configuration string into a built-in policy, per
/// the grammar `reject-all|ignore-conflicts|trust-only:Source|merge-all`.
pub fn parse_policy(spec: &str) -> Result<Box<dyn MergePolicy>, RetconError> {
    match spec {
        "reject-all" => Ok(Box::new(RejectAll)),
        "ignore-conflicts" => Ok(Box::new(IgnoreConflicts)),
        "merge-all" => Ok(Box::new(MergeAll)),
        _ => {
            if let Some(source) = spec.strip_prefix("trust-only:") {
                if source.is_empty() {
                    return Err(RetconError::Config(
                        "trust-only: requires a source name".to_string(),
                    ));
                }
                Ok(Box::new(TrustOnly(SourceName::new(source))))
            } else {
                Err(RetconError::Config(format!(
                    "unknown merge policy '{}'",
                    spec
                )))
            }
        }
    }
}
