/// The diff/patch algebra over [`Document`]s.
///
/// A [`Patch`] is an ordered, canonical sequence of [`DocumentChange`]
/// operations. `diff` computes the patch that turns one document into
/// another; `apply` is total and pushes a patch through a document;
/// `calculate_initial_document` computes the "agreement" of a collection of
/// documents, used as a common-ancestor surrogate when no stored initial
/// exists.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::document::{Document, DocumentPath};

/// One patch operation: either create/overwrite a scalar, or remove one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentChange {
    /// Create or overwrite the scalar at `path`, creating intermediate
    /// internal nodes as needed.
    Insert(DocumentPath, String),
    /// Remove the scalar at `path`; intermediate empty internal nodes are
    /// pruned.
    Delete(DocumentPath),
}

impl DocumentChange {
    fn path(&self) -> &DocumentPath {
        match self {
            DocumentChange::Insert(p, _) => p,
            DocumentChange::Delete(p) => p,
        }
    }

    /// Ordering rank used for canonical sort: `Delete` sorts before
    /// `Insert` at the same path.
    fn kind_rank(&self) -> u8 {
        match self {
            DocumentChange::Delete(_) => 0,
            DocumentChange::Insert(_, _) => 1,
        }
    }
}

/// An ordered sequence of [`DocumentChange`]s. Patches compose by
/// concatenation; [`Patch::canonicalize`] sorts and deduplicates them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch(pub Vec<DocumentChange>);

impl Patch {
    /// The empty patch.
    pub fn empty() -> Self {
        Patch(Vec::new())
    }

    /// True if this patch has no operations.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of operations, after canonicalization would not change it
    /// (callers that need the canonical count should canonicalize first).
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Concatenate two patches (non-canonical; call `canonicalize` after if
    /// you need the canonical form).
    pub fn concat(mut self, other: Patch) -> Patch {
        self.0.extend(other.0);
        self
    }

    /// Sort by `(path, kind)` with `Delete` before `Insert` at the same
    /// path, and deduplicate: the *last* operation at a given path wins
    /// (a later `Insert` supersedes an earlier `Insert` or `Delete`; a
    /// `Delete` supersedes earlier `Insert`s at that path).
    pub fn canonicalize(&self) -> Patch {
        // Preserve input order among operations at the same path so "later
        // wins" is well defined, then let a stable sort bring same-path
        // operations together without disturbing that relative order.
        let mut winners: BTreeMap<DocumentPath, (usize, DocumentChange)> = BTreeMap::new();
        for (idx, change) in self.0.iter().enumerate() {
            winners.insert(change.path().clone(), (idx, change.clone()));
        }
        let mut ops: Vec<DocumentChange> = winners.into_values().map(|(_, c)| c).collect();
        ops.sort_by(|a, b| a.path().cmp(b.path()).then(a.kind_rank().cmp(&b.kind_rank())));
        Patch(ops)
    }
}

/// Compute the canonical patch `p` such that `apply(a, p) == b`.
///
/// Enumerates the union of paths appearing in `a` or `b`; for each path,
/// emits nothing if the scalars agree, an `Insert` if `b` has a different
/// (or new) scalar, or a `Delete` if `b` has none where `a` did.
pub fn diff(a: &Document, b: &Document) -> Patch {
    let mut seen = std::collections::BTreeSet::new();
    let mut ops = Vec::new();
    for (path, _) in a.paths() {
        seen.insert(path);
    }
    for (path, _) in b.paths() {
        seen.insert(path);
    }
    for path in seen {
        let a_val = a.get(&path);
        let b_val = b.get(&path);
        if a_val == b_val {
            continue;
        }
        match b_val {
            Some(v) => ops.push(DocumentChange::Insert(path, v.to_string())),
            None => ops.push(DocumentChange::Delete(path)),
        }
    }
    Patch(ops).canonicalize()
}

/// Apply a patch to a document. Total: deleting a nonexistent path is a
/// no-op, and inserting creates intermediate nodes. After application, any
/// internal node left empty (no scalar, no children) is pruned — this
/// falls out of [`Document::unset`]'s own pruning behaviour.
pub fn apply(document: &Document, patch: &Patch) -> Document {
    let mut result = document.clone();
    for change in &patch.0 {
        match change {
            DocumentChange::Insert(path, value) => result.set(path, value.clone()),
            DocumentChange::Delete(path) => result.unset(path),
        }
    }
    result
}

/// The "agreement" of a non-empty collection of documents: a path/scalar
/// pair is included iff every input document has that exact scalar at that
/// path. The empty document is returned for an empty input.
///
/// Used as the common-ancestor surrogate when no stored initial document
/// exists for an internal key.
pub fn calculate_initial_document<'a>(docs: impl IntoIterator<Item = &'a Document>) -> Document {
    let docs: Vec<&Document> = docs.into_iter().collect();
    if docs.is_empty() {
        return Document::empty();
    }
    let mut candidates: BTreeMap<DocumentPath, String> = docs[0]
        .paths()
        .into_iter()
        .collect();
    for doc in &docs[1..] {
        let doc_paths: BTreeMap<DocumentPath, String> = doc.paths().into_iter().collect();
        candidates.retain(|path, value| doc_paths.get(path) == Some(value));
    }
    let mut result = Document::empty();
    for (path, value) in candidates {
        result.set(&path, value);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        Document::from_json(&value).unwrap()
    }

    #[test]
    fn diff_of_identical_documents_is_empty() {
        let a = doc(json!({"name": "Alice"}));
        assert!(diff(&a, &a).is_empty());
    }

    #[test]
    fn apply_diff_of_self_is_identity() {
        let a = doc(json!({"name": "Alice", "age": "30"}));
        assert_eq!(apply(&a, &diff(&a, &a)), a);
    }

    #[test]
    fn apply_diff_reaches_target() {
        let a = doc(json!({"name": "Alice"}));
        let b = doc(json!({"name": "Alicia", "age": "30"}));
        assert_eq!(apply(&a, &diff(&a, &b)), b);
    }

    #[test]
    fn diff_emits_deletes_for_removed_paths() {
        let a = doc(json!({"name": "Alice", "age": "30"}));
        let b = doc(json!({"name": "Alice"}));
        let p = diff(&a, &b);
        assert!(p
            .0
            .iter()
            .any(|c| matches!(c, DocumentChange::Delete(path) if path.to_string() == "/age")));
    }

    #[test]
    fn apply_delete_on_missing_path_is_noop() {
        let a = doc(json!({"name": "Alice"}));
        let p = Patch(vec![DocumentChange::Delete(DocumentPath::new(["ghost"]))]);
        assert_eq!(apply(&a, &p), a);
    }

    #[test]
    fn apply_prunes_empty_internal_nodes() {
        let a = doc(json!({"address": {"city": "Berlin"}}));
        let p = Patch(vec![DocumentChange::Delete(DocumentPath::new([
            "address", "city",
        ]))]);
        assert_eq!(apply(&a, &p), Document::empty());
    }

    #[test]
    fn canonical_form_dedups_later_insert_wins() {
        let path = DocumentPath::new(["name"]);
        let p = Patch(vec![
            DocumentChange::Insert(path.clone(), "Alice".into()),
            DocumentChange::Insert(path.clone(), "Alicia".into()),
        ]);
        let canon = p.canonicalize();
        assert_eq!(canon.0, vec![DocumentChange::Insert(path, "Alicia".into())]);
    }

    #[test]
    fn canonical_form_delete_supersedes_earlier_insert() {
        let path = DocumentPath::new(["name"]);
        let p = Patch(vec![
            DocumentChange::Insert(path.clone(), "Alice".into()),
            DocumentChange::Delete(path.clone()),
        ]);
        assert_eq!(p.canonicalize().0, vec![DocumentChange::Delete(path)]);
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let a = doc(json!({"b": "2", "a": "1"}));
        let b = doc(json!({"b": "3", "c": "4"}));
        let p = diff(&a, &b);
        assert_eq!(p.canonicalize(), p.canonicalize().canonicalize());
    }

    #[test]
    fn diff_composition_law() {
        let a = doc(json!({"name": "Alice"}));
        let b = doc(json!({"name": "Alicia", "age": "30"}));
        let c = doc(json!({"name": "Alicia"}));
        let combined = diff(&a, &b).concat(diff(&b, &c)).canonicalize();
        assert_eq!(apply(&a, &combined), c);
    }

    #[test]
    fn calculate_initial_document_of_empty_is_empty() {
        assert_eq!(calculate_initial_document(std::iter::empty()), Document::empty());
    }

    #[test]
    fn calculate_initial_document_keeps_only_universal_agreement() {
        let a = doc(json!({"name": "Alice", "age": "30"}));
        let b = doc(json!({"name": "Alice", "age": "31"}));
        let initial = calculate_initial_document([&a, &b]);
        assert_eq!(initial.get(&DocumentPath::new(["name"])), Some("Alice"));
        assert_eq!(initial.get(&DocumentPath::new(["age"])), None);
    }

    #[test]
    fn calculate_initial_document_idempotent_under_duplication() {
        let a = doc(json!({"name": "Alice"}));
        let b = doc(json!({"name": "Alicia"}));
        let once = calculate_initial_document([&a, &b]);
        let twice = calculate_initial_document([&a, &b, &a, &b]);
        assert_eq!(once, twice);
    }

    #[test]
    fn calculate_initial_document_single_doc_is_itself() {
        let a = doc(json!({"name": "Alice", "age": "30"}));
        assert_eq!(calculate_initial_document([&a]), a);
    }
}
