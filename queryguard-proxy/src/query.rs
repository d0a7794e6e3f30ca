//! Admission and mutation of client queries.
//!
//! Admission mirrors the server's own index selection heuristic for simple
//! queries: the leading field of a compound index is what prefix matching
//! keys on, so a query whose first indexable field leads no index gets no
//! index at all. The check is deliberately conservative: a query the
//! server could serve through a non-leading field is still rejected.
//!
//! Mutation canonicalizes an admitted query to the wrapped `$query` form,
//! caps its server-side run time, and tags it so the overrun path can find
//! the exact in-progress operation later.

use bson::{doc, Bson, Document};
use tracing::warn;
use uuid::Uuid;

use queryguard_domain::{ControlChannelPtr, Namespace};

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

/// Find a top-level key by name, ASCII case-insensitively, ignoring a
/// leading `$`. Returns the key's exact spelling in the document.
fn find_key<'a>(doc: &'a Document, name: &str) -> Option<&'a str> {
    // ---
    doc.keys()
        .find(|k| k.trim_start_matches('$').eq_ignore_ascii_case(name))
        .map(String::as_str)
}

// ---

fn get_value<'a>(doc: &'a Document, name: &str) -> Option<&'a Bson> {
    // ---
    let key = find_key(doc, name)?;
    doc.get(key)
}

// ---------------------------------------------------------------------------
// First indexable field
// ---------------------------------------------------------------------------

/// The field name the server would use to pick an index for `query`.
///
/// For a wrapped query, the inner predicate's first key; failing that, the
/// first `orderby` key (string form with any leading `-` stripped); failing
/// that, the query's own first key. `None` only for an empty document,
/// which never reaches admission.
pub fn first_indexable_field(query: &Document) -> Option<String> {
    // ---
    let (first_key, first_value) = query.iter().next()?;

    if first_key.trim_start_matches('$') == "query" {
        if let Bson::Document(inner) = first_value {
            if let Some(k) = inner.keys().next() {
                return Some(k.clone());
            }
        }

        if let Some(orderby) = get_value(query, "orderby") {
            match orderby {
                Bson::Document(d) => {
                    if let Some(k) = d.keys().next() {
                        return Some(k.clone());
                    }
                }
                Bson::String(s) => return Some(s.trim_start_matches('-').to_string()),
                other => warn!(kind = ?other.element_type(), "unrecognized orderby type"),
            }
        }
    }

    Some(first_key.clone())
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

/// Decide whether `query` may run against `ns`.
///
/// An empty (or nonexistent) collection admits everything; it has no
/// useful indexes and rejecting would break first writes. So does a failed
/// count, which is indistinguishable from that case here. A failed index
/// listing admits nothing for this query; both failures are logged.
pub async fn check_for_index(
    control: &ControlChannelPtr,
    ns: &Namespace,
    query: &Document,
) -> bool {
    // ---
    match control.count_documents(ns.database(), ns.collection()).await {
        Ok(0) => return true,
        Ok(_) => {}
        Err(e) => {
            warn!(ns = %ns.full_name(), error = %e, "document count failed, admitting");
            return true;
        }
    }

    let indexes = match control.list_indexes(ns.database(), ns.collection()).await {
        Ok(list) => list,
        Err(e) => {
            warn!(ns = %ns.full_name(), error = %e, "index listing failed");
            Vec::new()
        }
    };

    let Some(field) = first_indexable_field(query) else {
        return true;
    };

    indexes
        .iter()
        .any(|index| index.first_key().is_some_and(|k| k.eq_ignore_ascii_case(&field)))
}

// ---------------------------------------------------------------------------
// Mutation
// ---------------------------------------------------------------------------

/// Tracking token for one admitted query: `Q` + a random 32-hex-char tail.
pub fn new_tracking_id() -> String {
    // ---
    format!("Q{}", Uuid::new_v4().simple())
}

// ---

/// Rewrite an admitted query for forwarding.
///
/// 1. Wrap in `{ $query: ... }` unless the first key (leading `$`
///    stripped) is already `query`.
/// 2. Clamp an existing top-level `maxTimeMS` (any casing, leading `$`
///    ignored, key spelling preserved) to `max_cap_ms`, or append
///    `$maxTimeMS = max_cap_ms`.
/// 3. Append the `$queryGuard` envelope with the client address and
///    tracking id.
pub fn mutate_query(
    query: Document,
    remote_addr: &str,
    tracking_id: &str,
    max_cap_ms: f64,
) -> Document {
    // ---
    let wrapped = query
        .keys()
        .next()
        .is_some_and(|k| k.trim_start_matches('$') == "query");
    let mut query = if wrapped { query } else { doc! { "$query": query } };

    if let Some(key) = find_key(&query, "maxTimeMS").map(String::from) {
        if let Some(value) = query.get_mut(&key) {
            let over = match &*value {
                Bson::Double(v) => *v > max_cap_ms,
                Bson::Int32(v) => f64::from(*v) > max_cap_ms,
                Bson::Int64(v) => *v as f64 > max_cap_ms,
                _ => false,
            };
            if over {
                *value = Bson::Double(max_cap_ms);
            }
        }
    } else {
        query.insert("$maxTimeMS", max_cap_ms);
    }

    query.insert(
        "$queryGuard",
        doc! { "remoteaddr": remote_addr, "track": tracking_id },
    );

    query
}

// ---------------------------------------------------------------------------
// Flatten (untagged kill fingerprint)
// ---------------------------------------------------------------------------

/// Flatten every leaf of `value` into `out` as dotted-path equality
/// constraints.
///
/// Documents contribute their key to the path; arrays recurse without a
/// path component, so an array leaf lands under the enclosing path. That
/// keeps the walk deterministic but means documents inside arrays can
/// produce ambiguous paths; the fingerprint is best-effort against the
/// operation-record format it matches.
pub fn flatten_query(value: &Bson, path: &mut Vec<String>, out: &mut Document) {
    // ---
    match value {
        Bson::Document(doc) => {
            for (k, v) in doc {
                path.push(k.clone());
                flatten_query(v, path, out);
                path.pop();
            }
        }
        Bson::Array(items) => {
            for v in items {
                flatten_query(v, path, out);
            }
        }
        leaf => {
            out.insert(path.join("."), leaf.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
