//! Command surface
//!
//! One method per data-access pattern. Each call checks readiness, validates
//! its arguments and issues a single request against the supervisor's
//! current handle. Write-style calls stamp a `TTL` datetime on the stored
//! document; the caller's own document is never modified.

use bson::{doc, Bson, Document as BsonDocument};
use docrelay_common::{DocRelayError, Result};
use std::sync::Arc;

use crate::store::{FindOptions, IndexOptions, StoreHandle, UpdateOutcome};
use crate::supervisor::Supervisor;
use crate::validation::{CollectionName, FieldPath};

/// Field stamped with the write time on every write
pub const TTL_FIELD: &str = "TTL";

/// Page size used by `limit` and `skip` when the caller has no preference
pub const DEFAULT_PAGE_SIZE: i64 = 50;

/// Window for [`Commands::skip`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub skip: u64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            skip: DEFAULT_PAGE_SIZE as u64,
        }
    }
}

/// The fixed catalog of store operations
#[derive(Debug, Clone)]
pub struct Commands {
    supervisor: Arc<Supervisor>,
}

impl Commands {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Readiness first, so a call made while disconnected is always NotReady
    fn route(&self, operation: &str, collection: &str) -> Result<(StoreHandle, CollectionName)> {
        let handle = self.supervisor.handle()?;
        let collection = CollectionName::new(collection)?;
        tracing::debug!(operation, collection = %collection, "Routing command");
        Ok((handle, collection))
    }

    /// All matching documents, projected
    pub async fn find(
        &self,
        collection: &str,
        filter: BsonDocument,
        projection: Option<BsonDocument>,
    ) -> Result<Vec<BsonDocument>> {
        let (store, collection) = self.route("find", collection)?;
        store
            .find(collection.as_str(), filter, FindOptions::default().projection(projection))
            .await
    }

    /// Like `find`, bounded to `limit` documents
    pub async fn limit(
        &self,
        collection: &str,
        filter: BsonDocument,
        projection: Option<BsonDocument>,
        limit: i64,
    ) -> Result<Vec<BsonDocument>> {
        let (store, collection) = self.route("limit", collection)?;
        let options = FindOptions::default().projection(projection).limit(limit);
        store.find(collection.as_str(), filter, options).await
    }

    /// Like `find`, bounded to `page.limit` documents after skipping `page.skip`
    pub async fn skip(
        &self,
        collection: &str,
        filter: BsonDocument,
        projection: Option<BsonDocument>,
        page: Page,
    ) -> Result<Vec<BsonDocument>> {
        let (store, collection) = self.route("skip", collection)?;
        let options = FindOptions::default()
            .projection(projection)
            .limit(page.limit)
            .skip(page.skip);
        store.find(collection.as_str(), filter, options).await
    }

    pub async fn count(&self, collection: &str, filter: BsonDocument) -> Result<u64> {
        let (store, collection) = self.route("count", collection)?;
        store.count(collection.as_str(), filter).await
    }

    /// Insert one document stamped with `TTL`, returning its `_id`
    pub async fn insert(&self, collection: &str, data: &BsonDocument) -> Result<Bson> {
        let (store, collection) = self.route("insert", collection)?;
        store
            .insert_one(collection.as_str(), stamped(data, false))
            .await
    }

    /// Upsert one document via `$set`. A caller-supplied `TTL` is kept.
    pub async fn set(
        &self,
        collection: &str,
        filter: BsonDocument,
        data: &BsonDocument,
    ) -> Result<UpdateOutcome> {
        let (store, collection) = self.route("set", collection)?;
        let update = doc! { "$set": stamped(data, true) };
        store
            .update_one(collection.as_str(), filter, update, true)
            .await
    }

    /// Upsert every matching document via `$set`. A caller-supplied `TTL` is kept.
    pub async fn set_many(
        &self,
        collection: &str,
        filter: BsonDocument,
        data: &BsonDocument,
    ) -> Result<UpdateOutcome> {
        let (store, collection) = self.route("set_many", collection)?;
        let update = doc! { "$set": stamped(data, true) };
        store
            .update_many(collection.as_str(), filter, update, true)
            .await
    }

    /// Replace the first match (or insert) with `data` stamped with `TTL`
    pub async fn rep(
        &self,
        collection: &str,
        filter: BsonDocument,
        data: &BsonDocument,
    ) -> Result<UpdateOutcome> {
        let (store, collection) = self.route("rep", collection)?;
        store
            .replace_one(collection.as_str(), filter, stamped(data, false), true)
            .await
    }

    /// Atomically add the numeric fields of `increments`, upserting
    pub async fn math(
        &self,
        collection: &str,
        filter: BsonDocument,
        increments: &BsonDocument,
    ) -> Result<UpdateOutcome> {
        let (store, collection) = self.route("math", collection)?;
        let update = doc! { "$inc": increments.clone(), "$set": { TTL_FIELD: now() } };
        store
            .update_one(collection.as_str(), filter, update, true)
            .await
    }

    /// Append to array fields, upserting
    pub async fn push(
        &self,
        collection: &str,
        filter: BsonDocument,
        data: &BsonDocument,
    ) -> Result<UpdateOutcome> {
        let (store, collection) = self.route("push", collection)?;
        let update = doc! { "$push": data.clone(), "$set": { TTL_FIELD: now() } };
        store
            .update_one(collection.as_str(), filter, update, true)
            .await
    }

    /// Remove matching elements from array fields of an existing document
    pub async fn pull(
        &self,
        collection: &str,
        filter: BsonDocument,
        data: &BsonDocument,
    ) -> Result<UpdateOutcome> {
        let (store, collection) = self.route("pull", collection)?;
        let update = doc! { "$pull": data.clone(), "$set": { TTL_FIELD: now() } };
        store
            .update_one(collection.as_str(), filter, update, false)
            .await
    }

    /// Remove fields from an existing document
    pub async fn unset(
        &self,
        collection: &str,
        filter: BsonDocument,
        data: &BsonDocument,
    ) -> Result<UpdateOutcome> {
        let (store, collection) = self.route("unset", collection)?;
        let update = doc! { "$unset": data.clone(), "$set": { TTL_FIELD: now() } };
        store
            .update_one(collection.as_str(), filter, update, false)
            .await
    }

    /// Increment the counter `field` of the matching document and return its
    /// new value.
    ///
    /// A single upserting find-and-modify: `$inc` on a missing field starts
    /// from zero, so a fresh document and an existing document without the
    /// counter both yield 1, and concurrent callers never see the same value.
    pub async fn next(&self, collection: &str, filter: BsonDocument, field: &str) -> Result<i64> {
        let (store, collection) = self.route("next", collection)?;
        let field = FieldPath::new(field)?;

        let mut increment = BsonDocument::new();
        increment.insert(field.as_str(), 1_i64);
        let updated = store
            .find_one_and_update(collection.as_str(), filter, doc! { "$inc": increment }, true)
            .await?
            .ok_or_else(|| {
                DocRelayError::Store(format!(
                    "Counter upsert on '{}' returned no document",
                    collection
                ))
            })?;

        counter_value(&updated, field.as_str()).ok_or_else(|| {
            DocRelayError::Store(format!(
                "Counter field '{}' is not numeric after increment",
                field.as_str()
            ))
        })
    }

    /// Delete the first matching document, returning how many were deleted
    pub async fn del(&self, collection: &str, filter: BsonDocument) -> Result<u64> {
        let (store, collection) = self.route("del", collection)?;
        store.delete_one(collection.as_str(), filter).await
    }

    /// Delete every matching document, returning how many were deleted
    pub async fn del_many(&self, collection: &str, filter: BsonDocument) -> Result<u64> {
        let (store, collection) = self.route("del_many", collection)?;
        store.delete_many(collection.as_str(), filter).await
    }

    /// Create a background index, returning its name
    ///
    /// # Errors
    /// Returns a Validation error if `keys` is missing or empty
    pub async fn create_index(
        &self,
        collection: &str,
        keys: Option<BsonDocument>,
        options: IndexOptions,
    ) -> Result<String> {
        let (store, collection) = self.route("create_index", collection)?;
        let keys = keys
            .filter(|k| !k.is_empty())
            .ok_or_else(|| DocRelayError::Validation("No index provided".to_string()))?;
        store
            .create_index(collection.as_str(), keys, options.in_background())
            .await
    }

    pub async fn list_indexes(&self, collection: &str) -> Result<Vec<BsonDocument>> {
        let (store, collection) = self.route("list_indexes", collection)?;
        store.list_indexes(collection.as_str()).await
    }

    /// Run `pipeline`, with `{$match: condition}` prepended when given
    pub async fn aggregate(
        &self,
        collection: &str,
        match_condition: Option<BsonDocument>,
        pipeline: Vec<BsonDocument>,
    ) -> Result<Vec<BsonDocument>> {
        let (store, collection) = self.route("aggregate", collection)?;
        store
            .aggregate(collection.as_str(), with_match_stage(match_condition, pipeline))
            .await
    }

    /// Whether the store is ready to take commands
    pub fn status(&self) -> bool {
        self.supervisor.is_ready()
    }
}

fn now() -> Bson {
    Bson::DateTime(bson::DateTime::now())
}

/// Copy of `data` carrying a `TTL` of now. With `keep_existing`, a `TTL`
/// already present in `data` wins.
fn stamped(data: &BsonDocument, keep_existing: bool) -> BsonDocument {
    let mut payload = data.clone();
    if !(keep_existing && payload.contains_key(TTL_FIELD)) {
        payload.insert(TTL_FIELD, now());
    }
    payload
}

fn with_match_stage(
    match_condition: Option<BsonDocument>,
    pipeline: Vec<BsonDocument>,
) -> Vec<BsonDocument> {
    match match_condition {
        Some(condition) => std::iter::once(doc! { "$match": condition })
            .chain(pipeline)
            .collect(),
        None => pipeline,
    }
}

/// Read a numeric counter at a (dotted) path
fn counter_value(document: &BsonDocument, path: &str) -> Option<i64> {
    let mut parts = path.split('.');
    let mut current = document.get(parts.next()?)?;
    for part in parts {
        current = current.as_document()?.get(part)?;
    }
    match current {
        Bson::Int32(v) => Some(i64::from(*v)),
        Bson::Int64(v) => Some(*v),
        Bson::Double(v) if v.fract() == 0.0 => Some(*v as i64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::memory::{MemoryConnector, MemoryStore};

    fn idle_commands() -> Commands {
        let connector = Arc::new(MemoryConnector::new(Arc::new(MemoryStore::new("db"))));
        Commands::new(Arc::new(Supervisor::new(ConnectionConfig::default(), connector)))
    }

    #[test]
    fn test_default_page() {
        let page = Page::default();
        assert_eq!(page.limit, 50);
        assert_eq!(page.skip, 50);
    }

    #[test]
    fn test_stamped_leaves_input_untouched() {
        let data = doc! { "a": 1 };
        let payload = stamped(&data, false);
        assert!(payload.get_datetime(TTL_FIELD).is_ok());
        assert_eq!(payload.get_i32("a").unwrap(), 1);
        assert_eq!(data, doc! { "a": 1 });
    }

    #[test]
    fn test_stamped_keeps_existing_ttl_when_asked() {
        let fixed = bson::DateTime::from_millis(0);
        let data = doc! { "a": 1, "TTL": fixed };
        assert_eq!(stamped(&data, true).get_datetime(TTL_FIELD).unwrap(), &fixed);
        assert_ne!(stamped(&data, false).get_datetime(TTL_FIELD).unwrap(), &fixed);
    }

    #[test]
    fn test_match_stage_prepended() {
        let pipeline = vec![doc! { "$limit": 5 }];
        let combined = with_match_stage(Some(doc! { "a": 1 }), pipeline.clone());
        assert_eq!(combined, vec![doc! { "$match": { "a": 1 } }, doc! { "$limit": 5 }]);
        assert_eq!(with_match_stage(None, pipeline.clone()), pipeline);
    }

    #[test]
    fn test_counter_value() {
        assert_eq!(counter_value(&doc! { "seq": 3 }, "seq"), Some(3));
        assert_eq!(counter_value(&doc! { "seq": 3_i64 }, "seq"), Some(3));
        assert_eq!(counter_value(&doc! { "s": { "n": 2.0 } }, "s.n"), Some(2));
        assert_eq!(counter_value(&doc! { "seq": "x" }, "seq"), None);
        assert_eq!(counter_value(&doc! {}, "seq"), None);
    }

    #[tokio::test]
    async fn test_commands_fail_fast_when_not_ready() {
        let commands = idle_commands();
        assert!(!commands.status());

        let err = commands.find("c", doc! {}, None).await.unwrap_err();
        assert!(err.is_not_ready());
        let err = commands.set("c", doc! { "_id": 1 }, &doc! { "a": 1 }).await.unwrap_err();
        assert!(err.is_not_ready());
        let err = commands.next("counters", doc! { "_id": "x" }, "seq").await.unwrap_err();
        assert!(err.is_not_ready());
        // Readiness is checked before arguments
        let err = commands.create_index("c", None, IndexOptions::default()).await.unwrap_err();
        assert!(err.is_not_ready());
    }
}
