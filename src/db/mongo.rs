//! MongoDB client and collection wrapper

use bson::{doc, Bson, Document};
use mongodb::{
    error::{ErrorKind, WriteFailure},
    options::{IndexOptions, UpdateModifications},
    results::UpdateResult,
    Client, Collection, IndexModel,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{error, info};

use crate::types::BailiffError;

/// Server error code for a unique index violation
const DUPLICATE_KEY_CODE: i32 = 11000;

/// Decode a raw document, naming it by `_id` on failure
pub fn decode_document<T: DeserializeOwned>(raw: Document) -> Result<T, BailiffError> {
    let id = raw
        .get("_id")
        .map(|id| id.to_string())
        .unwrap_or_else(|| "<no _id>".to_string());
    bson::from_document(raw).map_err(|e| {
        error!(document = %id, error = %e, "Undecodable document");
        BailiffError::Database(format!("Failed to decode document {}: {}", id, e))
    })
}

/// Trait for schemas that provide index definitions
pub trait IntoIndexes {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)>;
}

/// Whether a driver error is a unique-index violation
pub fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == DUPLICATE_KEY_CODE,
        ErrorKind::Command(e) => e.code == DUPLICATE_KEY_CODE,
        _ => false,
    }
}

/// MongoDB client wrapper
#[derive(Clone)]
pub struct MongoClient {
    client: Client,
    db_name: String,
}

impl MongoClient {
    /// Create a new MongoDB client
    pub async fn new(uri: &str, db_name: &str) -> Result<Self, BailiffError> {
        info!("Connecting to MongoDB at {}", uri);

        // Use serverSelectionTimeoutMS to avoid hanging on unreachable MongoDB
        let timeout_uri = if uri.contains('?') {
            format!("{}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        } else {
            format!("{}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        };

        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(|e| BailiffError::Database(format!("Failed to connect to MongoDB: {}", e)))?;

        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| BailiffError::Database(format!("MongoDB ping failed: {}", e)))?;

        info!("Connected to MongoDB database '{}'", db_name);

        Ok(Self {
            client,
            db_name: db_name.to_string(),
        })
    }

    /// Get a typed collection
    pub async fn collection<T>(&self, name: &str) -> Result<MongoCollection<T>, BailiffError>
    where
        T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes,
    {
        MongoCollection::new(&self.client, &self.db_name, name).await
    }

    /// Get the database name
    pub fn db_name(&self) -> &str {
        &self.db_name
    }
}

/// Typed MongoDB collection with automatic indexing
#[derive(Debug, Clone)]
pub struct MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync,
{
    inner: Collection<T>,
}

impl<T> MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes,
{
    /// Create a new collection and apply indexes
    pub async fn new(
        client: &Client,
        db_name: &str,
        collection_name: &str,
    ) -> Result<Self, BailiffError> {
        let collection = client.database(db_name).collection::<T>(collection_name);
        let mongo_collection = MongoCollection { inner: collection };

        mongo_collection.apply_indexes().await?;

        Ok(mongo_collection)
    }

    /// Apply schema-defined indexes
    async fn apply_indexes(&self) -> Result<(), BailiffError> {
        let schema_indices = T::into_indices();

        if schema_indices.is_empty() {
            return Ok(());
        }

        let indices: Vec<IndexModel> = schema_indices
            .into_iter()
            .map(|(keys, opts)| IndexModel::builder().keys(keys).options(opts).build())
            .collect();

        self.inner
            .create_indexes(indices)
            .await
            .map_err(|e| BailiffError::Database(format!("Failed to create indexes: {}", e)))?;

        Ok(())
    }

    /// Find one document by filter
    pub async fn find_one(&self, filter: Document) -> Result<Option<T>, BailiffError> {
        self.inner
            .find_one(filter)
            .await
            .map_err(|e| BailiffError::Database(format!("Find failed: {}", e)))
    }

    /// Find many documents by filter. Fails on the first document that does not decode.
    pub async fn find_many(&self, filter: Document) -> Result<Vec<T>, BailiffError> {
        use futures_util::TryStreamExt;

        let mut cursor = self
            .inner
            .clone_with_type::<Document>()
            .find(filter)
            .await
            .map_err(|e| BailiffError::Database(format!("Find failed: {}", e)))?;

        let mut results = Vec::new();
        while let Some(raw) = cursor
            .try_next()
            .await
            .map_err(|e| BailiffError::Database(format!("Cursor failed: {}", e)))?
        {
            results.push(decode_document(raw)?);
        }

        Ok(results)
    }

    /// Update one document
    pub async fn update_one(
        &self,
        filter: Document,
        update: impl Into<UpdateModifications>,
    ) -> Result<UpdateResult, BailiffError> {
        self.inner
            .update_one(filter, update.into())
            .await
            .map_err(|e| BailiffError::Database(format!("Update failed: {}", e)))
    }

    /// Distinct string values of a field
    pub async fn distinct_strings(
        &self,
        field: &str,
        filter: Document,
    ) -> Result<Vec<String>, BailiffError> {
        let values = self
            .inner
            .distinct(field, filter)
            .await
            .map_err(|e| BailiffError::Database(format!("Distinct failed: {}", e)))?;

        Ok(values
            .into_iter()
            .filter_map(|v| match v {
                Bson::String(s) => Some(s),
                _ => None,
            })
            .collect())
    }

    /// Get the underlying collection for advanced operations
    pub fn inner(&self) -> &Collection<T> {
        &self.inner
    }
}
