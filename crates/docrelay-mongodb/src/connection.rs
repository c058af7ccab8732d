//! MongoDB connection: the connector used by the supervisor and the
//! driver-backed [`DocumentStore`].

use async_trait::async_trait;
use bson::{doc, Bson, Document as BsonDocument};
use docrelay_common::{DocRelayError, Result};
use futures::TryStreamExt;
use mongodb::{
    options::{ClientOptions, ReturnDocument},
    results::UpdateResult,
    Client, Collection, Database, IndexModel,
};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ConnectionConfig;
use crate::store::{DocumentStore, FindOptions, IndexOptions, StoreHandle, UpdateOutcome};

/// Performs a single connection attempt.
///
/// The supervisor owns retrying; a connector only reports whether one
/// attempt produced a live handle.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> Result<StoreHandle>;
}

/// Connector for a real MongoDB deployment
#[derive(Debug, Clone, Default)]
pub struct MongoConnector;

#[async_trait]
impl Connector for MongoConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<StoreHandle> {
        let store = MongoStore::connect(config).await?;
        Ok(Arc::new(store))
    }
}

/// MongoDB-backed store bound to one database
#[derive(Debug, Clone)]
pub struct MongoStore {
    client: Client,
    database: Database,
    database_name: String,
}

impl MongoStore {
    /// Open a client and verify it with a ping.
    ///
    /// The driver connects lazily, so the ping is what actually proves
    /// credentials and reachability. Every failure is a Connection error.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let uri = config.connection_uri()?;
        let database_name = config.database_name()?.to_string();

        let mut client_options = ClientOptions::parse(&uri)
            .await
            .map_err(|e| DocRelayError::Connection(e.to_string()))?;
        if let Some(app) = &config.transport().app_name {
            client_options.app_name = Some(app.clone());
        }

        let client = Client::with_options(client_options)
            .map_err(|e| DocRelayError::Connection(e.to_string()))?;
        let database = client.database(&database_name);

        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| DocRelayError::Connection(format!("Ping failed: {}", e)))?;

        Ok(Self {
            client,
            database,
            database_name,
        })
    }

    /// Get a reference to the database
    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Get a reference to the client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Get a collection by name (returns untyped BsonDocument collection)
    pub fn collection(&self, name: &str) -> Collection<BsonDocument> {
        self.database.collection(name)
    }
}

impl From<UpdateResult> for UpdateOutcome {
    fn from(result: UpdateResult) -> Self {
        Self {
            matched_count: result.matched_count,
            modified_count: result.modified_count,
            upserted_id: result.upserted_id,
        }
    }
}

#[allow(deprecated)]
fn driver_index_options(options: IndexOptions) -> mongodb::options::IndexOptions {
    // Ignored by 4.2+ servers, still honored by older deployments
    mongodb::options::IndexOptions::builder()
        .background(options.background())
        .name(options.name)
        .unique(options.unique.then_some(true))
        .sparse(options.sparse.then_some(true))
        .expire_after(options.expire_after_seconds.map(Duration::from_secs))
        .build()
}

#[async_trait]
impl DocumentStore for MongoStore {
    fn database_name(&self) -> &str {
        &self.database_name
    }

    async fn ping(&self) -> Result<()> {
        self.database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| DocRelayError::Connection(format!("Ping failed: {}", e)))?;
        Ok(())
    }

    async fn find(
        &self,
        collection: &str,
        filter: BsonDocument,
        options: FindOptions,
    ) -> Result<Vec<BsonDocument>> {
        let coll = self.collection(collection);
        let mut action = coll.find(filter);
        if let Some(projection) = options.projection {
            action = action.projection(projection);
        }
        if let Some(limit) = options.limit {
            action = action.limit(limit);
        }
        if let Some(skip) = options.skip {
            action = action.skip(skip);
        }

        let cursor = action.await?;
        Ok(cursor.try_collect().await?)
    }

    async fn count(&self, collection: &str, filter: BsonDocument) -> Result<u64> {
        Ok(self.collection(collection).count_documents(filter).await?)
    }

    async fn insert_one(&self, collection: &str, document: BsonDocument) -> Result<Bson> {
        let result = self.collection(collection).insert_one(document).await?;
        Ok(result.inserted_id)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: BsonDocument,
        update: BsonDocument,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        let result = self
            .collection(collection)
            .update_one(filter, update)
            .upsert(upsert)
            .await?;
        Ok(result.into())
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: BsonDocument,
        update: BsonDocument,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        let result = self
            .collection(collection)
            .update_many(filter, update)
            .upsert(upsert)
            .await?;
        Ok(result.into())
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: BsonDocument,
        replacement: BsonDocument,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        let result = self
            .collection(collection)
            .replace_one(filter, replacement)
            .upsert(upsert)
            .await?;
        Ok(result.into())
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: BsonDocument,
        update: BsonDocument,
        upsert: bool,
    ) -> Result<Option<BsonDocument>> {
        Ok(self
            .collection(collection)
            .find_one_and_update(filter, update)
            .upsert(upsert)
            .return_document(ReturnDocument::After)
            .await?)
    }

    async fn delete_one(&self, collection: &str, filter: BsonDocument) -> Result<u64> {
        let result = self.collection(collection).delete_one(filter).await?;
        Ok(result.deleted_count)
    }

    async fn delete_many(&self, collection: &str, filter: BsonDocument) -> Result<u64> {
        let result = self.collection(collection).delete_many(filter).await?;
        Ok(result.deleted_count)
    }

    async fn create_index(
        &self,
        collection: &str,
        keys: BsonDocument,
        options: IndexOptions,
    ) -> Result<String> {
        let model = IndexModel::builder()
            .keys(keys)
            .options(Some(driver_index_options(options)))
            .build();
        let result = self.collection(collection).create_index(model).await?;
        Ok(result.index_name)
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<BsonDocument>> {
        let cursor = self.collection(collection).list_indexes().await?;
        let models: Vec<IndexModel> = cursor.try_collect().await?;
        models
            .iter()
            .map(|model| bson::to_document(model).map_err(DocRelayError::from))
            .collect()
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<BsonDocument>,
    ) -> Result<Vec<BsonDocument>> {
        let cursor = self
            .collection(collection)
            .aggregate(pipeline)
            .allow_disk_use(true)
            .await?;
        Ok(cursor.try_collect().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;

    #[tokio::test]
    async fn test_connect_rejects_incomplete_config() {
        let config = ConnectionConfig::builder().host("localhost:27017").build();
        let err = MongoConnector.connect(&config).await.err().unwrap();
        assert!(err.is_connection());
    }

    /// Store pointed at a port nothing listens on; requests fail fast
    async fn unreachable_store() -> MongoStore {
        let client = Client::with_uri_str("mongodb://127.0.0.1:1/?serverSelectionTimeoutMS=200")
            .await
            .unwrap();
        let database = client.database("test_db");
        MongoStore {
            client,
            database,
            database_name: "test_db".to_string(),
        }
    }

    #[tokio::test]
    async fn test_find_with_all_options_reports_store_error() {
        let store = unreachable_store().await;
        let options = FindOptions::default()
            .projection(Some(doc! { "a": 1 }))
            .limit(5)
            .skip(10);
        let err = store.find("c", doc! {}, options).await.err().unwrap();
        assert!(matches!(err, DocRelayError::Store(_)));
    }

    #[tokio::test]
    async fn test_ping_unreachable_is_connection_error() {
        let store = unreachable_store().await;
        assert!(store.ping().await.err().unwrap().is_connection());
    }

    #[test]
    #[allow(deprecated)]
    fn test_driver_index_options() {
        let options = driver_index_options(
            IndexOptions::default()
                .in_background()
                .name("ttl_idx")
                .expire_after(Duration::from_secs(600)),
        );
        assert_eq!(options.background, Some(true));
        assert_eq!(options.name.as_deref(), Some("ttl_idx"));
        assert_eq!(options.expire_after, Some(Duration::from_secs(600)));
        assert_eq!(options.unique, None);
    }
}
