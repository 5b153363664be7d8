use bytes::Bytes;
use cassandra_cql::frame::response::result::ResultMetadata;
use dashmap::DashMap;

/// A statement prepared by the server, executed with [`Session::execute`](crate::Session::execute).
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    id: Bytes,
    statement: String,
    metadata: ResultMetadata,
}

impl PreparedStatement {
    pub(crate) fn new(id: Bytes, statement: String, metadata: ResultMetadata) -> Self {
        Self {
            id,
            statement,
            metadata,
        }
    }

    pub fn get_id(&self) -> &Bytes {
        &self.id
    }

    pub fn get_statement(&self) -> &str {
        &self.statement
    }

    /// Metadata of the bound variables.
    pub fn get_variables_metadata(&self) -> &ResultMetadata {
        &self.metadata
    }
}

/// Every statement prepared through the session, by id. Connections opened
/// later prepare them before their first use.
#[derive(Default)]
pub(crate) struct PreparedStatementRegistry {
    statements: DashMap<Bytes, String>,
}

impl PreparedStatementRegistry {
    pub(crate) fn insert(&self, id: Bytes, statement: String) {
        self.statements.insert(id, statement);
    }

    pub(crate) fn ids(&self) -> Vec<Bytes> {
        self.statements
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Statement texts of `ids`; unknown ids are skipped.
    pub(crate) fn lookup(&self, ids: &[Bytes]) -> Vec<(Bytes, String)> {
        ids.iter()
            .filter_map(|id| {
                self.statements
                    .get(id)
                    .map(|statement| (id.clone(), statement.value().clone()))
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.statements.len()
    }
}
