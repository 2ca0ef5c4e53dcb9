/// Default key prefix for all driftlock-managed state.
pub const DEFAULT_PREFIX: &str = "driftlock";

/// Common key-construction helpers used by the Redis backend.
#[derive(Debug, Clone)]
pub struct KeyContext<'a> {
    pub prefix: &'a str,
}

impl<'a> KeyContext<'a> {
    pub fn new(prefix: &'a str) -> Self {
        Self { prefix }
    }

    pub fn document(&self, collection: &str, document_id: &str) -> String {
        format!("{}:{}:{}", self.prefix, collection, document_id)
    }

    /// Pattern matching every key under a collection, including index keys.
    pub fn collection_pattern(&self, collection: &str) -> String {
        format!("{}:{}:*", self.prefix, collection)
    }

    /// Stored schema contract for a collection.
    pub fn schema(&self, collection: &str) -> String {
        format!("{}:schema:{}", self.prefix, collection)
    }

    /// Hash of index specs declared on a collection, keyed by field.
    pub fn indexes(&self, collection: &str) -> String {
        format!("{}:indexes:{}", self.prefix, collection)
    }

    /// Hash backing a unique index: encoded value -> document id.
    pub fn unique_index(&self, collection: &str, field: &str) -> String {
        format!("{}:{}:unique:{}", self.prefix, collection, field)
    }

    /// Prefix shared by all unique-index keys of a collection. Used to
    /// filter index keys out of document scans.
    pub fn unique_prefix(&self, collection: &str) -> String {
        format!("{}:{}:unique", self.prefix, collection)
    }

    /// Hash of applied-migration records, keyed by unit id.
    pub fn applied(&self) -> String {
        format!("{}:applied", self.prefix)
    }

    /// The single migration lock record.
    pub fn lock(&self) -> String {
        format!("{}:lock", self.prefix)
    }
}
