//! Server-side prepared statements and the per-connection cache that
//! remembers them by SQL text.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use super::protocol::{FieldDescription, Format};
use super::types::Oid;

/// Column descriptions shared by every row a statement produces.
pub type SharedColumns = Arc<Vec<FieldDescription>>;

/// Capacity used when a connection is built without explicit configuration.
const DEFAULT_CAPACITY: usize = 100;

/// Prefix of names handed out by [`StatementCache::next_statement_name`].
const NAME_PREFIX: &str = "__pgpipe_";

/// A statement the server has parsed under `name`.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub name: String,
    pub query: String,
    /// Parameter OIDs as resolved by the server's ParameterDescription.
    pub param_types: Vec<Oid>,
    /// Result shape, empty for statements that produce no rows.
    pub columns: SharedColumns,
}

impl PreparedStatement {
    pub fn new(name: String, query: String) -> Self {
        Self {
            name,
            query,
            param_types: Vec::new(),
            columns: SharedColumns::default(),
        }
    }

    pub fn set_param_types(&mut self, types: Vec<Oid>) {
        self.param_types = types;
    }

    /// Record the RowDescription from a statement Describe.
    ///
    /// The server reports format 0 for every column at this stage since the
    /// result format is only fixed at Bind. Bind always asks for binary, so
    /// the stored descriptions are rewritten to match what DataRows carry.
    pub fn set_columns(&mut self, columns: Vec<FieldDescription>) {
        let columns = columns
            .into_iter()
            .map(|column| FieldDescription {
                format: Format::Binary,
                ..column
            })
            .collect();
        self.columns = Arc::new(columns);
    }

    pub fn returns_rows(&self) -> bool {
        !self.columns.is_empty()
    }
}

/// Least-recently-used map from SQL text to prepared statement.
///
/// Inserting past capacity pushes out the coldest statement and hands it
/// back; the connection then closes it on the server.
pub struct StatementCache {
    entries: LruCache<String, Arc<PreparedStatement>>,
    issued: u32,
}

impl StatementCache {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            issued: 0,
        }
    }

    /// Look up `query`, promoting it to most recently used.
    pub fn get(&mut self, query: &str) -> Option<Arc<PreparedStatement>> {
        self.entries.get(query).cloned()
    }

    /// Membership test that leaves recency untouched.
    pub fn contains(&self, query: &str) -> bool {
        self.entries.contains(query)
    }

    /// Store `statement`, returning whatever was evicted to make room.
    pub fn insert(&mut self, statement: Arc<PreparedStatement>) -> Option<Arc<PreparedStatement>> {
        let key = statement.query.clone();
        let displaced = self.entries.push(key, statement)?;
        // Re-inserting the same SQL replaces in place and evicts nothing.
        if self.entries.contains(&displaced.0) {
            None
        } else {
            Some(displaced.1)
        }
    }

    pub fn remove(&mut self, query: &str) -> Option<Arc<PreparedStatement>> {
        self.entries.pop(query)
    }

    /// Fresh statement name, unique for the life of the connection.
    pub fn next_statement_name(&mut self) -> String {
        self.issued = self.issued.wrapping_add(1);
        format!("{NAME_PREFIX}{}", self.issued)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
