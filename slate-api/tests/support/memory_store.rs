#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use slate_api::db::{BackendError, StoreBackend};

struct StoredItem {
    index: HashMap<String, String>,
    doc: String,
}

/// In-memory stand-in for the DynamoDB backend.
///
/// Tables spring into existence on first write, matching the semantics the
/// service sees after `ensure_tables`.
pub struct MemoryBackend {
    tables: RwLock<HashMap<String, HashMap<String, StoredItem>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn put(
        &self,
        table: &str,
        key: &str,
        index: &[(&str, String)],
        doc: String,
    ) -> Result<(), BackendError> {
        let mut tables = self.tables.write().unwrap();
        let items = tables.entry(table.to_string()).or_default();
        items.insert(
            key.to_string(),
            StoredItem {
                index: index
                    .iter()
                    .map(|(attr, value)| (attr.to_string(), value.clone()))
                    .collect(),
                doc,
            },
        );

        Ok(())
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<String>, BackendError> {
        let tables = self.tables.read().unwrap();

        Ok(tables
            .get(table)
            .and_then(|items| items.get(key))
            .map(|item| item.doc.clone()))
    }

    async fn delete(&self, table: &str, key: &str) -> Result<(), BackendError> {
        let mut tables = self.tables.write().unwrap();
        if let Some(items) = tables.get_mut(table) {
            items.remove(key);
        }

        Ok(())
    }

    async fn find(
        &self,
        table: &str,
        filters: &[(&str, String)],
    ) -> Result<Vec<String>, BackendError> {
        let tables = self.tables.read().unwrap();
        let Some(items) = tables.get(table) else {
            return Ok(Vec::new());
        };

        Ok(items
            .values()
            .filter(|item| {
                filters
                    .iter()
                    .all(|(attr, value)| item.index.get(*attr) == Some(value))
            })
            .map(|item| item.doc.clone())
            .collect())
    }
}
