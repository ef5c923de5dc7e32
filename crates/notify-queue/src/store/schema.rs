//! DDL for the queue table.

#[cfg(test)]
#[path = "schema_tests.rs"]
mod tests;

/// Builds the statements that create the queue table and its indexes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaManager {
    table: String,
}

impl SchemaManager {
    /// `table` must already be a validated identifier, optionally schema-qualified
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Idempotent statements, in execution order
    pub fn create_statements(&self) -> Vec<String> {
        let table = &self.table;
        let prefix = self.index_prefix();

        vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 id BIGSERIAL PRIMARY KEY, \
                 dedup_key TEXT NOT NULL, \
                 encoded_payload BYTEA NOT NULL, \
                 headers TEXT NOT NULL, \
                 provider_name TEXT NULL, \
                 template_name TEXT NULL, \
                 handled BOOLEAN NOT NULL DEFAULT FALSE, \
                 push_sent BOOLEAN NOT NULL DEFAULT FALSE, \
                 email_sent BOOLEAN NOT NULL DEFAULT FALSE, \
                 created_at TIMESTAMPTZ NOT NULL, \
                 available_at TIMESTAMPTZ NOT NULL, \
                 delivered_at TIMESTAMPTZ NULL)"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {prefix}_available_idx \
                 ON {table} (available_at) WHERE handled = FALSE"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {prefix}_pending_key_idx \
                 ON {table} (dedup_key, template_name)"
            ),
        ]
    }

    /// Index names are unqualified; they live in the table's schema
    fn index_prefix(&self) -> &str {
        self.table
            .rsplit_once('.')
            .map(|(_, name)| name)
            .unwrap_or(&self.table)
    }
}
