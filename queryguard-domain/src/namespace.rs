//! Full collection names and their admission classification.
//!
//! A full collection name is the `<database>.<collection>` string carried
//! in query messages (null terminator excluded here). The collection half
//! may itself contain dots (`db.system.indexes`). Only [`NsKind::User`]
//! namespaces go through index admission; everything else is forwarded
//! untouched.

// ---------------------------------------------------------------------------
// NsKind
// ---------------------------------------------------------------------------

/// What kind of namespace a query targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsKind {
    // ---
    /// `<db>.$cmd` — a database command.
    Command,

    /// Ends in `.indexes` — index metadata reads (`db.system.indexes`).
    IndexMeta,

    /// Contains `.system.` — other system collections.
    System,

    /// A regular user collection. Subject to admission.
    User,
}

// ---------------------------------------------------------------------------
// Namespace
// ---------------------------------------------------------------------------

/// A parsed full collection name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    // ---
    database: String,
    collection: String,
}

// ---

impl Namespace {
    // ---

    /// Split `<database>.<collection>` at the first dot.
    ///
    /// Returns `None` for a name with no dot at all; callers treat such a
    /// name as unclassifiable and forward the message verbatim.
    pub fn parse(full_name: &str) -> Option<Self> {
        // ---
        let (database, collection) = full_name.split_once('.')?;
        Some(Self {
            database: database.to_string(),
            collection: collection.to_string(),
        })
    }

    pub fn database(&self) -> &str {
        self.database.as_str()
    }

    pub fn collection(&self) -> &str {
        self.collection.as_str()
    }

    /// The `<database>.<collection>` form used in operation filters.
    pub fn full_name(&self) -> String {
        // ---
        format!("{}.{}", self.database, self.collection)
    }

    /// Classify for admission. Suffix and infix checks run against the
    /// full name, so `db.system.indexes` is [`NsKind::IndexMeta`] even
    /// though it also contains `.system.`; both bypass admission, so the
    /// distinction only matters for logs.
    pub fn kind(&self) -> NsKind {
        // ---
        let full = self.full_name();
        if full.ends_with(".$cmd") {
            NsKind::Command
        } else if full.ends_with(".indexes") {
            NsKind::IndexMeta
        } else if full.contains(".system.") {
            NsKind::System
        } else {
            NsKind::User
        }
    }

    /// True unless this is a plain user collection.
    pub fn bypasses_admission(&self) -> bool {
        // ---
        self.kind() != NsKind::User
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    // ---

    #[test]
    fn classification_table() {
        // ---
        let cases = [
            ("admin.$cmd", NsKind::Command),
            ("app.system.indexes", NsKind::IndexMeta),
            ("app.foo.indexes", NsKind::IndexMeta),
            ("app.system.users", NsKind::System),
            ("app.users", NsKind::User),
            ("app.users.archive", NsKind::User),
        ];

        for (name, want) in cases {
            let ns = Namespace::parse(name).unwrap();
            assert_eq!(ns.kind(), want, "namespace {name}");
        }
    }

    // ---

    #[test]
    fn collection_keeps_inner_dots() {
        // ---
        let ns = Namespace::parse("db.system.indexes").unwrap();
        assert_eq!(ns.database(), "db");
        assert_eq!(ns.collection(), "system.indexes");
        assert_eq!(ns.full_name(), "db.system.indexes");
    }

    // ---

    #[test]
    fn dotless_name_is_unparseable() {
        // ---
        assert!(Namespace::parse("nodots").is_none());
    }

    // ---

    #[test]
    fn user_namespaces_admit() {
        // ---
        assert!(!Namespace::parse("app.users").unwrap().bypasses_admission());
        assert!(Namespace::parse("admin.$cmd").unwrap().bypasses_admission());
        assert!(Namespace::parse("app.system.js").unwrap().bypasses_admission());
    }
}
