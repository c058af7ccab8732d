//! The document-store contract the command surface talks to.
//!
//! [`crate::connection::MongoStore`] implements it on the MongoDB driver and
//! [`crate::memory::MemoryStore`] implements it in process. The supervisor
//! publishes whichever one its connector produced as a [`StoreHandle`].

use async_trait::async_trait;
use bson::{Bson, Document as BsonDocument};
use docrelay_common::{DocRelayError, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Live handle to a connected store, shared by every command
pub type StoreHandle = Arc<dyn DocumentStore>;

/// Options for a find request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub projection: Option<BsonDocument>,
    pub limit: Option<i64>,
    pub skip: Option<u64>,
}

impl FindOptions {
    pub fn projection(mut self, projection: Option<BsonDocument>) -> Self {
        self.projection = projection;
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }
}

/// Result of an update or replace request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<Bson>,
}

/// Index creation options.
///
/// Indexes are always built in the background; `background` cannot be
/// switched off.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct IndexOptions {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sparse: bool,
    #[serde(default)]
    pub expire_after_seconds: Option<u64>,
    #[serde(default = "always_background")]
    background: bool,
}

fn always_background() -> bool {
    true
}

impl IndexOptions {
    /// Parse options from a BSON document, rejecting unrecognized keys.
    ///
    /// Accepts `name`, `unique`, `sparse`, `expireAfterSeconds` and
    /// `background` (which is forced on regardless of its value).
    pub fn from_document(options: BsonDocument) -> Result<Self> {
        let parsed: Self = bson::from_document(options)
            .map_err(|e| DocRelayError::Validation(format!("Invalid index options: {}", e)))?;
        Ok(parsed.in_background())
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    pub fn sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }

    pub fn expire_after(mut self, ttl: Duration) -> Self {
        self.expire_after_seconds = Some(ttl.as_secs());
        self
    }

    pub fn background(&self) -> bool {
        self.background
    }

    pub(crate) fn in_background(mut self) -> Self {
        self.background = true;
        self
    }
}

/// Request/response interface over a document store.
///
/// Each method is a single request; implementations surface rejections as
/// [`DocRelayError::Store`] carrying the store's own message.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Name of the database this handle is bound to
    fn database_name(&self) -> &str;

    /// Check the store is reachable
    async fn ping(&self) -> Result<()>;

    async fn find(
        &self,
        collection: &str,
        filter: BsonDocument,
        options: FindOptions,
    ) -> Result<Vec<BsonDocument>>;

    async fn count(&self, collection: &str, filter: BsonDocument) -> Result<u64>;

    /// Insert one document, returning its `_id`
    async fn insert_one(&self, collection: &str, document: BsonDocument) -> Result<Bson>;

    async fn update_one(
        &self,
        collection: &str,
        filter: BsonDocument,
        update: BsonDocument,
        upsert: bool,
    ) -> Result<UpdateOutcome>;

    async fn update_many(
        &self,
        collection: &str,
        filter: BsonDocument,
        update: BsonDocument,
        upsert: bool,
    ) -> Result<UpdateOutcome>;

    async fn replace_one(
        &self,
        collection: &str,
        filter: BsonDocument,
        replacement: BsonDocument,
        upsert: bool,
    ) -> Result<UpdateOutcome>;

    /// Apply `update` to the first match and return the document as it is
    /// after the update
    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: BsonDocument,
        update: BsonDocument,
        upsert: bool,
    ) -> Result<Option<BsonDocument>>;

    async fn delete_one(&self, collection: &str, filter: BsonDocument) -> Result<u64>;

    async fn delete_many(&self, collection: &str, filter: BsonDocument) -> Result<u64>;

    /// Create an index, returning its name
    async fn create_index(
        &self,
        collection: &str,
        keys: BsonDocument,
        options: IndexOptions,
    ) -> Result<String>;

    async fn list_indexes(&self, collection: &str) -> Result<Vec<BsonDocument>>;

    /// Run an aggregation pipeline with disk spill allowed
    async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<BsonDocument>,
    ) -> Result<Vec<BsonDocument>>;
}

/// Default index name the way the server derives it: `field_1_other_-1`
pub fn default_index_name(keys: &BsonDocument) -> String {
    keys.iter()
        .map(|(field, direction)| {
            let direction = match direction {
                Bson::Int32(v) => v.to_string(),
                Bson::Int64(v) => v.to_string(),
                Bson::Double(v) => v.to_string(),
                Bson::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("{}_{}", field, direction)
        })
        .collect::<Vec<_>>()
        .join("_")
}
