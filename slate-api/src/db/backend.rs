use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::SdkError;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ScalarAttributeType,
};
use aws_sdk_dynamodb::{Client, config::Credentials};
use thiserror::Error;
use tracing::info;

use crate::config::AwsSettings;
use crate::db::ALL_TABLES;

/// Attribute holding the primary key of every item.
const KEY_ATTRIBUTE: &str = "id";

/// Attribute holding the serialized entity document.
const DOC_ATTRIBUTE: &str = "doc";

/// Errors emitted by the key-value backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("The key-value store is unavailable: {0}")]
    Unavailable(String),
}

/// Key-value backend interface used by the store.
///
/// Entities are stored as JSON documents under a string primary key, with a
/// flat set of scalar index attributes alongside for equality lookups. The
/// backend guarantees single-operation atomicity only; nothing here spans
/// items.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Writes a document, replacing any existing item with the same key.
    async fn put(
        &self,
        table: &str,
        key: &str,
        index: &[(&str, String)],
        doc: String,
    ) -> Result<(), BackendError>;

    /// Reads a document by primary key.
    async fn get(&self, table: &str, key: &str) -> Result<Option<String>, BackendError>;

    /// Deletes an item by primary key. Deleting an absent item succeeds.
    async fn delete(&self, table: &str, key: &str) -> Result<(), BackendError>;

    /// Returns the documents whose index attributes equal every given filter.
    ///
    /// An empty filter list returns the whole table. Results are eventually
    /// consistent.
    async fn find(
        &self,
        table: &str,
        filters: &[(&str, String)],
    ) -> Result<Vec<String>, BackendError>;
}

/// Backend talking to DynamoDB (or a DynamoDB-compatible local endpoint).
pub struct DynamoBackend {
    client: Client,
    table_prefix: String,
}

impl DynamoBackend {
    /// Builds a client from the configured credentials, region, and optional
    /// endpoint override.
    pub async fn new(settings: &AwsSettings) -> Self {
        let credentials = Credentials::new(
            settings.access_key_id.clone(),
            settings.secret_access_key.expose().to_owned(),
            None,
            None,
            "slate-config",
        );

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()))
            .credentials_provider(credentials);
        if let Some(endpoint_url) = settings.endpoint_url() {
            loader = loader.endpoint_url(endpoint_url);
        }
        let config = loader.load().await;

        Self {
            client: Client::new(&config),
            table_prefix: settings.table_prefix.clone(),
        }
    }

    fn table_name(&self, table: &str) -> String {
        format!("{}{}", self.table_prefix, table)
    }

    /// Creates every entity table that does not exist yet.
    ///
    /// Existing tables are left untouched.
    pub async fn ensure_tables(&self) -> Result<(), BackendError> {
        for &table in ALL_TABLES {
            let request = self
                .client
                .create_table()
                .table_name(self.table_name(table))
                .attribute_definitions(
                    AttributeDefinition::builder()
                        .attribute_name(KEY_ATTRIBUTE)
                        .attribute_type(ScalarAttributeType::S)
                        .build()
                        .map_err(|e| BackendError::Unavailable(e.to_string()))?,
                )
                .key_schema(
                    KeySchemaElement::builder()
                        .attribute_name(KEY_ATTRIBUTE)
                        .key_type(KeyType::Hash)
                        .build()
                        .map_err(|e| BackendError::Unavailable(e.to_string()))?,
                )
                .billing_mode(BillingMode::PayPerRequest);

            match request.send().await {
                Ok(_) => info!(table, "created store table"),
                Err(SdkError::ServiceError(err)) if err.err().is_resource_in_use_exception() => {}
                Err(e) => return Err(BackendError::Unavailable(e.to_string())),
            }
        }

        Ok(())
    }
}

#[async_trait]
impl StoreBackend for DynamoBackend {
    async fn put(
        &self,
        table: &str,
        key: &str,
        index: &[(&str, String)],
        doc: String,
    ) -> Result<(), BackendError> {
        let mut request = self
            .client
            .put_item()
            .table_name(self.table_name(table))
            .item(KEY_ATTRIBUTE, AttributeValue::S(key.to_string()))
            .item(DOC_ATTRIBUTE, AttributeValue::S(doc));
        for (attr, value) in index {
            request = request.item(*attr, AttributeValue::S(value.clone()));
        }

        request
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<String>, BackendError> {
        let output = self
            .client
            .get_item()
            .table_name(self.table_name(table))
            .key(KEY_ATTRIBUTE, AttributeValue::S(key.to_string()))
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        Ok(output
            .item()
            .and_then(|item| item.get(DOC_ATTRIBUTE))
            .and_then(|value| value.as_s().ok())
            .cloned())
    }

    async fn delete(&self, table: &str, key: &str) -> Result<(), BackendError> {
        self.client
            .delete_item()
            .table_name(self.table_name(table))
            .key(KEY_ATTRIBUTE, AttributeValue::S(key.to_string()))
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        Ok(())
    }

    async fn find(
        &self,
        table: &str,
        filters: &[(&str, String)],
    ) -> Result<Vec<String>, BackendError> {
        let mut docs = Vec::new();
        let mut last_key: Option<HashMap<String, AttributeValue>> = None;

        loop {
            let mut request = self.client.scan().table_name(self.table_name(table));
            if !filters.is_empty() {
                let expression = (0..filters.len())
                    .map(|i| format!("#a{i} = :v{i}"))
                    .collect::<Vec<_>>()
                    .join(" and ");
                request = request.filter_expression(expression);
                for (i, (attr, value)) in filters.iter().enumerate() {
                    request = request
                        .expression_attribute_names(format!("#a{i}"), *attr)
                        .expression_attribute_values(
                            format!(":v{i}"),
                            AttributeValue::S(value.clone()),
                        );
                }
            }
            request = request.set_exclusive_start_key(last_key.take());

            let output = request
                .send()
                .await
                .map_err(|e| BackendError::Unavailable(e.to_string()))?;

            for item in output.items() {
                if let Some(doc) = item.get(DOC_ATTRIBUTE).and_then(|value| value.as_s().ok()) {
                    docs.push(doc.clone());
                }
            }

            match output.last_evaluated_key() {
                Some(key) if !key.is_empty() => last_key = Some(key.clone()),
                _ => break,
            }
        }

        Ok(docs)
    }
}
