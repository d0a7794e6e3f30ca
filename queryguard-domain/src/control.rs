//! The control channel: a separately established, authenticated session to
//! the cluster used only for introspection and kill-op, never for client
//! traffic.

use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document};

use super::error::Result;

// ---------------------------------------------------------------------------
// IndexSpec
// ---------------------------------------------------------------------------

/// One index on a collection, reduced to what admission needs: the ordered
/// key field names. A leading `-` marks a descending key and is stripped
/// before comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    // ---
    /// Index name as reported by the server (`email_1`, `_id_`, ...).
    pub name: String,

    /// Key field names in index order, descending keys prefixed `-`.
    pub keys: Vec<String>,
}

// ---

impl IndexSpec {
    /// First key field with any leading `-` stripped, or `None` for an
    /// index the server reported with no keys at all.
    pub fn first_key(&self) -> Option<&str> {
        // ---
        self.keys.first().map(|k| k.trim_start_matches('-'))
    }
}

// ---------------------------------------------------------------------------
// ControlChannel
// ---------------------------------------------------------------------------

/// Cluster introspection used by admission and the overrun kill path.
///
/// Implementations: `queryguard_control::ClusterControl` in production,
/// hand-rolled stubs in tests. Implementations may pool connections, but
/// every call must behave as an independent logical session so concurrent
/// callers never serialize on shared per-request state.
///
/// `#[async_trait]` keeps the trait dyn-compatible so
/// [`ControlChannelPtr`] = `Arc<dyn ControlChannel>` compiles.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    // ---
    /// All indexes on `database.collection`, in server order.
    async fn list_indexes(&self, database: &str, collection: &str) -> Result<Vec<IndexSpec>>;

    /// Document count for `database.collection`. A count of 0 also covers
    /// collections that do not exist yet.
    async fn count_documents(&self, database: &str, collection: &str) -> Result<i64>;

    /// Opids of in-progress server operations matching `filter`.
    async fn find_ops(&self, filter: Document) -> Result<Vec<Bson>>;

    /// Kill one in-progress operation by opid.
    async fn kill_op(&self, opid: Bson) -> Result<()>;
}

// ---

/// Convenience alias for a shared [`ControlChannel`] handle.
pub type ControlChannelPtr = Arc<dyn ControlChannel>;
