//! In-process document store
//!
//! Implements [`DocumentStore`] over plain BSON documents so the supervisor
//! and the command surface can run without a server. Supported:
//! - equality filters on (dotted) fields plus `$eq $ne $gt $gte $lt $lte
//!   $in $nin $exists $and $or`
//! - `$set $unset $inc $push $pull $setOnInsert` updates
//! - inclusion/exclusion projections
//! - `_id` and unique secondary indexes
//! - `$match $sort $skip $limit $project $count` pipeline stages
//!
//! Every request holds the store lock for its whole duration, so each one
//! is atomic with respect to the others.

use async_trait::async_trait;
use bson::{doc, oid::ObjectId, Bson, Document as BsonDocument};
use docrelay_common::{DocRelayError, Result};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ConnectionConfig;
use crate::connection::Connector;
use crate::store::{
    default_index_name, DocumentStore, FindOptions, IndexOptions, StoreHandle, UpdateOutcome,
};

#[derive(Debug, Default)]
struct MemoryCollection {
    documents: Vec<BsonDocument>,
    indexes: Vec<BsonDocument>,
}

impl MemoryCollection {
    fn new() -> Self {
        Self {
            documents: Vec::new(),
            indexes: vec![doc! { "v": 2, "key": { "_id": 1 }, "name": "_id_" }],
        }
    }

    /// Reject `candidate` if it collides with another document on `_id` or
    /// on any unique index. `skip` is the position of the document being
    /// replaced, if any.
    fn check_unique(
        &self,
        namespace: &str,
        candidate: &BsonDocument,
        skip: Option<usize>,
    ) -> Result<()> {
        for index in &self.indexes {
            let is_id = index.get_str("name").ok() == Some("_id_");
            if !is_id && !index.get_bool("unique").unwrap_or(false) {
                continue;
            }
            let Ok(keys) = index.get_document("key") else {
                continue;
            };
            let key_of = |doc: &BsonDocument| -> Vec<Bson> {
                keys.keys()
                    .map(|k| get_path(doc, k).cloned().unwrap_or(Bson::Null))
                    .collect()
            };
            let wanted = key_of(candidate);
            let clash = self
                .documents
                .iter()
                .enumerate()
                .filter(|(i, _)| Some(*i) != skip)
                .any(|(_, existing)| {
                    let existing = key_of(existing);
                    existing.len() == wanted.len()
                        && existing
                            .iter()
                            .zip(&wanted)
                            .all(|(a, b)| compare_values(a, b) == Ordering::Equal)
                });
            if clash {
                return Err(DocRelayError::Store(format!(
                    "E11000 duplicate key error collection: {} index: {} dup key: {}",
                    namespace,
                    index.get_str("name").unwrap_or_default(),
                    keys.keys()
                        .zip(&wanted)
                        .map(|(k, v)| format!("{}: {}", k, v))
                        .collect::<Vec<_>>()
                        .join(", ")
                )));
            }
        }
        Ok(())
    }
}

/// In-memory [`DocumentStore`]
#[derive(Debug)]
pub struct MemoryStore {
    database_name: String,
    online: AtomicBool,
    ping_latency: Mutex<Duration>,
    collections: Mutex<HashMap<String, MemoryCollection>>,
}

impl MemoryStore {
    pub fn new(database_name: impl Into<String>) -> Self {
        Self {
            database_name: database_name.into(),
            online: AtomicBool::new(true),
            ping_latency: Mutex::new(Duration::ZERO),
            collections: Mutex::new(HashMap::new()),
        }
    }

    /// Simulate the server going away (or coming back). While offline every
    /// request, ping included, fails.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, AtomicOrdering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(AtomicOrdering::SeqCst)
    }

    /// Make every ping take `latency` before answering
    pub fn set_ping_latency(&self, latency: Duration) {
        *self.ping_latency.lock() = latency;
    }

    fn namespace(&self, collection: &str) -> String {
        format!("{}.{}", self.database_name, collection)
    }

    fn ensure_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(DocRelayError::Store(format!(
                "connection to {} closed",
                self.database_name
            )))
        }
    }

    fn update(
        &self,
        collection: &str,
        filter: &BsonDocument,
        update: &BsonDocument,
        upsert: bool,
        many: bool,
    ) -> Result<(UpdateOutcome, Option<BsonDocument>)> {
        self.ensure_online()?;
        validate_update(update)?;
        let namespace = self.namespace(collection);
        let mut collections = self.collections.lock();
        let coll = collections
            .entry(collection.to_string())
            .or_insert_with(MemoryCollection::new);

        let positions: Vec<usize> = coll
            .documents
            .iter()
            .enumerate()
            .filter(|(_, d)| matches(d, filter))
            .map(|(i, _)| i)
            .take(if many { usize::MAX } else { 1 })
            .collect();

        if positions.is_empty() {
            if !upsert {
                return Ok((UpdateOutcome::default(), None));
            }
            let mut created = seed_from_filter(filter);
            apply_update(&mut created, update, true)?;
            let id = ensure_id(&mut created);
            coll.check_unique(&namespace, &created, None)?;
            coll.documents.push(created.clone());
            let outcome = UpdateOutcome {
                upserted_id: Some(id),
                ..UpdateOutcome::default()
            };
            return Ok((outcome, Some(created)));
        }

        let mut outcome = UpdateOutcome::default();
        let mut last = None;
        for position in positions {
            let mut updated = coll.documents[position].clone();
            apply_update(&mut updated, update, false)?;
            coll.check_unique(&namespace, &updated, Some(position))?;
            outcome.matched_count += 1;
            if updated != coll.documents[position] {
                outcome.modified_count += 1;
                coll.documents[position] = updated.clone();
            }
            last = Some(updated);
        }
        Ok((outcome, last))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn database_name(&self) -> &str {
        &self.database_name
    }

    async fn ping(&self) -> Result<()> {
        let latency = *self.ping_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.ensure_online()
            .map_err(|e| DocRelayError::Connection(format!("Ping failed: {}", e)))
    }

    async fn find(
        &self,
        collection: &str,
        filter: BsonDocument,
        options: FindOptions,
    ) -> Result<Vec<BsonDocument>> {
        self.ensure_online()?;
        let collections = self.collections.lock();
        let Some(coll) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let skip = options.skip.unwrap_or(0) as usize;
        let limit = match options.limit {
            Some(n) if n != 0 => n.unsigned_abs() as usize,
            _ => usize::MAX,
        };
        coll.documents
            .iter()
            .filter(|d| matches(d, &filter))
            .skip(skip)
            .take(limit)
            .map(|d| match &options.projection {
                Some(projection) => project(d, projection),
                None => Ok(d.clone()),
            })
            .collect()
    }

    async fn count(&self, collection: &str, filter: BsonDocument) -> Result<u64> {
        self.ensure_online()?;
        let collections = self.collections.lock();
        Ok(collections
            .get(collection)
            .map(|c| c.documents.iter().filter(|d| matches(d, &filter)).count() as u64)
            .unwrap_or(0))
    }

    async fn insert_one(&self, collection: &str, mut document: BsonDocument) -> Result<Bson> {
        self.ensure_online()?;
        let namespace = self.namespace(collection);
        let mut collections = self.collections.lock();
        let coll = collections
            .entry(collection.to_string())
            .or_insert_with(MemoryCollection::new);
        let id = ensure_id(&mut document);
        coll.check_unique(&namespace, &document, None)?;
        coll.documents.push(document);
        Ok(id)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: BsonDocument,
        update: BsonDocument,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        Ok(self.update(collection, &filter, &update, upsert, false)?.0)
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: BsonDocument,
        update: BsonDocument,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        Ok(self.update(collection, &filter, &update, upsert, true)?.0)
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: BsonDocument,
        mut replacement: BsonDocument,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        self.ensure_online()?;
        if replacement.keys().any(|k| k.starts_with('$')) {
            return Err(DocRelayError::Store(
                "Replacement document must not contain atomic operators".to_string(),
            ));
        }
        let namespace = self.namespace(collection);
        let mut collections = self.collections.lock();
        let coll = collections
            .entry(collection.to_string())
            .or_insert_with(MemoryCollection::new);

        match coll.documents.iter().position(|d| matches(d, &filter)) {
            Some(position) => {
                if let Some(id) = coll.documents[position].get("_id").cloned() {
                    replacement.insert("_id", id);
                }
                coll.check_unique(&namespace, &replacement, Some(position))?;
                let modified = coll.documents[position] != replacement;
                coll.documents[position] = replacement;
                Ok(UpdateOutcome {
                    matched_count: 1,
                    modified_count: u64::from(modified),
                    upserted_id: None,
                })
            }
            None if upsert => {
                if !replacement.contains_key("_id") {
                    if let Some(id) = seed_from_filter(&filter).get("_id").cloned() {
                        replacement.insert("_id", id);
                    }
                }
                let id = ensure_id(&mut replacement);
                coll.check_unique(&namespace, &replacement, None)?;
                coll.documents.push(replacement);
                Ok(UpdateOutcome {
                    upserted_id: Some(id),
                    ..UpdateOutcome::default()
                })
            }
            None => Ok(UpdateOutcome::default()),
        }
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: BsonDocument,
        update: BsonDocument,
        upsert: bool,
    ) -> Result<Option<BsonDocument>> {
        Ok(self.update(collection, &filter, &update, upsert, false)?.1)
    }

    async fn delete_one(&self, collection: &str, filter: BsonDocument) -> Result<u64> {
        self.ensure_online()?;
        let mut collections = self.collections.lock();
        let Some(coll) = collections.get_mut(collection) else {
            return Ok(0);
        };
        match coll.documents.iter().position(|d| matches(d, &filter)) {
            Some(position) => {
                coll.documents.remove(position);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn delete_many(&self, collection: &str, filter: BsonDocument) -> Result<u64> {
        self.ensure_online()?;
        let mut collections = self.collections.lock();
        let Some(coll) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = coll.documents.len();
        coll.documents.retain(|d| !matches(d, &filter));
        Ok((before - coll.documents.len()) as u64)
    }

    async fn create_index(
        &self,
        collection: &str,
        keys: BsonDocument,
        options: IndexOptions,
    ) -> Result<String> {
        self.ensure_online()?;
        if keys.is_empty() {
            return Err(DocRelayError::Store("Index keys cannot be empty".to_string()));
        }
        let namespace = self.namespace(collection);
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| default_index_name(&keys));

        let mut collections = self.collections.lock();
        let coll = collections
            .entry(collection.to_string())
            .or_insert_with(MemoryCollection::new);

        if let Some(existing) = coll
            .indexes
            .iter()
            .find(|i| i.get_str("name").ok() == Some(name.as_str()))
        {
            if existing.get_document("key").ok() == Some(&keys) {
                return Ok(name);
            }
            return Err(DocRelayError::Store(format!(
                "Index with name: {} already exists with different options",
                name
            )));
        }

        let mut index = doc! { "v": 2, "key": keys, "name": name.as_str() };
        if options.background() {
            index.insert("background", true);
        }
        if options.unique {
            index.insert("unique", true);
        }
        if options.sparse {
            index.insert("sparse", true);
        }
        if let Some(seconds) = options.expire_after_seconds {
            index.insert("expireAfterSeconds", seconds as i64);
        }

        // Building a unique index over existing duplicates fails the same way
        // an insert would
        if options.unique {
            let mut scratch = MemoryCollection {
                documents: Vec::new(),
                indexes: vec![index.clone()],
            };
            for document in &coll.documents {
                scratch.check_unique(&namespace, document, None)?;
                scratch.documents.push(document.clone());
            }
        }

        coll.indexes.push(index);
        Ok(name)
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<BsonDocument>> {
        self.ensure_online()?;
        let collections = self.collections.lock();
        collections
            .get(collection)
            .map(|c| c.indexes.clone())
            .ok_or_else(|| {
                DocRelayError::Store(format!("ns does not exist: {}", self.namespace(collection)))
            })
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<BsonDocument>,
    ) -> Result<Vec<BsonDocument>> {
        self.ensure_online()?;
        let mut documents = {
            let collections = self.collections.lock();
            collections
                .get(collection)
                .map(|c| c.documents.clone())
                .unwrap_or_default()
        };

        for stage in &pipeline {
            let (name, spec) = match stage.iter().next() {
                Some(entry) if stage.len() == 1 => entry,
                _ => {
                    return Err(DocRelayError::Store(
                        "A pipeline stage specification object must contain exactly one field"
                            .to_string(),
                    ))
                }
            };
            documents = run_stage(documents, name, spec)?;
        }
        Ok(documents)
    }
}

fn run_stage(documents: Vec<BsonDocument>, name: &str, spec: &Bson) -> Result<Vec<BsonDocument>> {
    let stage_error = |detail: &str| DocRelayError::Store(format!("{} {}", name, detail));
    match name {
        "$match" => {
            let filter = spec.as_document().ok_or_else(|| stage_error("must be an object"))?;
            Ok(documents.into_iter().filter(|d| matches(d, filter)).collect())
        }
        "$sort" => {
            let keys = spec.as_document().ok_or_else(|| stage_error("must be an object"))?;
            let mut documents = documents;
            documents.sort_by(|a, b| {
                for (field, direction) in keys {
                    let left = get_path(a, field).unwrap_or(&Bson::Null);
                    let right = get_path(b, field).unwrap_or(&Bson::Null);
                    let ordering = compare_values(left, right);
                    let ordering = if as_f64(direction).unwrap_or(1.0) < 0.0 {
                        ordering.reverse()
                    } else {
                        ordering
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
            Ok(documents)
        }
        "$skip" => {
            let n = as_f64(spec).ok_or_else(|| stage_error("must be a number"))?;
            Ok(documents.into_iter().skip(n.max(0.0) as usize).collect())
        }
        "$limit" => {
            let n = as_f64(spec).ok_or_else(|| stage_error("must be a number"))?;
            if n <= 0.0 {
                return Err(stage_error("must be positive"));
            }
            Ok(documents.into_iter().take(n as usize).collect())
        }
        "$project" => {
            let projection = spec.as_document().ok_or_else(|| stage_error("must be an object"))?;
            documents.iter().map(|d| project(d, projection)).collect()
        }
        "$count" => {
            let field = spec.as_str().ok_or_else(|| stage_error("must be a string"))?;
            if documents.is_empty() {
                return Ok(Vec::new());
            }
            let mut counted = BsonDocument::new();
            counted.insert(field, documents.len() as i64);
            Ok(vec![counted])
        }
        other => Err(DocRelayError::Store(format!(
            "Unrecognized pipeline stage name: '{}'",
            other
        ))),
    }
}

/// Connector that hands out a shared [`MemoryStore`].
///
/// The same store is returned on every successful attempt so data survives
/// reconnects. Attempts can be made to fail on demand.
#[derive(Debug)]
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
    failures_remaining: AtomicUsize,
    attempts: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            failures_remaining: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, AtomicOrdering::SeqCst);
    }

    /// Number of connection attempts seen so far
    pub fn attempts(&self) -> usize {
        self.attempts.load(AtomicOrdering::SeqCst)
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<StoreHandle> {
        self.attempts.fetch_add(1, AtomicOrdering::SeqCst);
        let host = config.host().unwrap_or("memory");

        let failing = self
            .failures_remaining
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok();
        if failing || !self.store.is_online() {
            return Err(DocRelayError::Connection(format!(
                "connection refused: {}",
                host
            )));
        }
        Ok(self.store.clone())
    }
}

// --- document helpers -------------------------------------------------------

fn get_path<'a>(document: &'a BsonDocument, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut current = document.get(parts.next()?)?;
    for part in parts {
        current = current.as_document()?.get(part)?;
    }
    Some(current)
}

fn set_path(document: &mut BsonDocument, path: &str, value: Bson) -> Result<()> {
    match path.split_once('.') {
        None => {
            document.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            let child = document
                .entry(head.to_string())
                .or_insert_with(|| Bson::Document(BsonDocument::new()));
            match child {
                Bson::Document(inner) => set_path(inner, rest, value),
                other => Err(DocRelayError::Store(format!(
                    "Cannot create field '{}' in element {{{}: {}}}",
                    rest, head, other
                ))),
            }
        }
    }
}

fn remove_path(document: &mut BsonDocument, path: &str) {
    match path.split_once('.') {
        None => {
            document.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(inner)) = document.get_mut(head) {
                remove_path(inner, rest);
            }
        }
    }
}

fn ensure_id(document: &mut BsonDocument) -> Bson {
    if let Some(id) = document.get("_id") {
        return id.clone();
    }
    let id = Bson::ObjectId(ObjectId::new());
    // _id always leads the document
    let mut ordered = doc! { "_id": id.clone() };
    for (key, value) in std::mem::take(document) {
        ordered.insert(key, value);
    }
    *document = ordered;
    id
}

/// Equality fields of a filter become the fields of an upserted document
fn seed_from_filter(filter: &BsonDocument) -> BsonDocument {
    let mut seeded = BsonDocument::new();
    for (key, value) in filter {
        if key.starts_with('$') || is_operator_document(value) {
            continue;
        }
        let _ = set_path(&mut seeded, key, value.clone());
    }
    seeded
}

fn is_operator_document(value: &Bson) -> bool {
    value
        .as_document()
        .and_then(|d| d.keys().next())
        .is_some_and(|k| k.starts_with('$'))
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        _ => 12,
    }
}

fn compare_values(left: &Bson, right: &Bson) -> Ordering {
    if let (Some(a), Some(b)) = (as_f64(left), as_f64(right)) {
        return a.partial_cmp(&b).unwrap_or(Ordering::Equal);
    }
    match (left, right) {
        (Bson::String(a), Bson::String(b)) => a.cmp(b),
        (Bson::Boolean(a), Bson::Boolean(b)) => a.cmp(b),
        (Bson::DateTime(a), Bson::DateTime(b)) => a.cmp(b),
        (Bson::ObjectId(a), Bson::ObjectId(b)) => a.bytes().cmp(&b.bytes()),
        (Bson::Null, Bson::Null) => Ordering::Equal,
        _ if type_rank(left) != type_rank(right) => type_rank(left).cmp(&type_rank(right)),
        _ if left == right => Ordering::Equal,
        _ => left.to_string().cmp(&right.to_string()),
    }
}

fn values_equal(left: &Bson, right: &Bson) -> bool {
    type_rank(left) == type_rank(right) && compare_values(left, right) == Ordering::Equal
}

/// Equality the way a query sees it: a scalar matches an array containing it
fn field_equals(field: Option<&Bson>, expected: &Bson) -> bool {
    match field {
        None => matches!(expected, Bson::Null),
        Some(Bson::Array(items)) if !matches!(expected, Bson::Array(_)) => {
            items.iter().any(|item| values_equal(item, expected))
        }
        Some(value) => values_equal(value, expected),
    }
}

fn matches(document: &BsonDocument, filter: &BsonDocument) -> bool {
    filter.iter().all(|(key, condition)| match key.as_str() {
        "$and" => condition.as_array().is_some_and(|clauses| {
            clauses
                .iter()
                .all(|c| c.as_document().is_some_and(|c| matches(document, c)))
        }),
        "$or" => condition.as_array().is_some_and(|clauses| {
            clauses
                .iter()
                .any(|c| c.as_document().is_some_and(|c| matches(document, c)))
        }),
        _ => {
            let field = get_path(document, key);
            match condition {
                Bson::Document(ops) if is_operator_document(condition) => {
                    ops.iter().all(|(op, operand)| matches_operator(field, op, operand))
                }
                _ => field_equals(field, condition),
            }
        }
    })
}

fn matches_operator(field: Option<&Bson>, op: &str, operand: &Bson) -> bool {
    let ordered = |accept: fn(Ordering) -> bool| {
        let check = |v: &Bson| type_rank(v) == type_rank(operand) && accept(compare_values(v, operand));
        match field {
            Some(Bson::Array(items)) => items.iter().any(check),
            Some(value) => check(value),
            None => false,
        }
    };
    match op {
        "$eq" => field_equals(field, operand),
        "$ne" => !field_equals(field, operand),
        "$gt" => ordered(|o| o == Ordering::Greater),
        "$gte" => ordered(|o| o != Ordering::Less),
        "$lt" => ordered(|o| o == Ordering::Less),
        "$lte" => ordered(|o| o != Ordering::Greater),
        "$in" => operand
            .as_array()
            .is_some_and(|values| values.iter().any(|v| field_equals(field, v))),
        "$nin" => operand
            .as_array()
            .is_some_and(|values| !values.iter().any(|v| field_equals(field, v))),
        "$exists" => {
            let wanted = match operand {
                Bson::Boolean(b) => *b,
                other => as_f64(other).map_or(true, |n| n != 0.0),
            };
            field.is_some() == wanted
        }
        _ => false,
    }
}

fn validate_update(update: &BsonDocument) -> Result<()> {
    if update.is_empty() {
        return Err(DocRelayError::Store("Update document must not be empty".to_string()));
    }
    if let Some(key) = update.keys().find(|k| !k.starts_with('$')) {
        return Err(DocRelayError::Store(format!(
            "Update document requires atomic operators, found '{}'",
            key
        )));
    }
    Ok(())
}

fn apply_update(document: &mut BsonDocument, update: &BsonDocument, inserting: bool) -> Result<()> {
    for (operator, fields) in update {
        let fields = fields.as_document().ok_or_else(|| {
            DocRelayError::Store(format!("Modifiers operate on fields but {} was not an object", operator))
        })?;
        for (path, value) in fields {
            match operator.as_str() {
                "$set" => set_path(document, path, value.clone())?,
                "$setOnInsert" => {
                    if inserting {
                        set_path(document, path, value.clone())?;
                    }
                }
                "$unset" => remove_path(document, path),
                "$inc" => {
                    let delta = as_f64(value).ok_or_else(|| {
                        DocRelayError::Store(format!("Cannot increment with non-numeric argument: {{{}: {}}}", path, value))
                    })?;
                    let overflow = |current: i64| {
                        DocRelayError::Store(format!(
                            "Failed to apply $inc operations to current value ({}) for field '{}': integer overflow",
                            current, path
                        ))
                    };
                    let next = match get_path(document, path) {
                        None => value.clone(),
                        Some(Bson::Int32(current)) => match value {
                            Bson::Int32(d) => current
                                .checked_add(*d)
                                .map(Bson::Int32)
                                .unwrap_or(Bson::Int64(i64::from(*current) + i64::from(*d))),
                            Bson::Int64(d) => i64::from(*current)
                                .checked_add(*d)
                                .map(Bson::Int64)
                                .ok_or_else(|| overflow(i64::from(*current)))?,
                            _ => Bson::Double(f64::from(*current) + delta),
                        },
                        Some(Bson::Int64(current)) => match value {
                            Bson::Int32(d) => current
                                .checked_add(i64::from(*d))
                                .map(Bson::Int64)
                                .ok_or_else(|| overflow(*current))?,
                            Bson::Int64(d) => current
                                .checked_add(*d)
                                .map(Bson::Int64)
                                .ok_or_else(|| overflow(*current))?,
                            _ => Bson::Double(*current as f64 + delta),
                        },
                        Some(Bson::Double(current)) => Bson::Double(current + delta),
                        Some(other) => {
                            return Err(DocRelayError::Store(format!(
                                "Cannot apply $inc to a value of non-numeric type. Field '{}' has value {}",
                                path, other
                            )))
                        }
                    };
                    set_path(document, path, next)?;
                }
                "$push" => {
                    let additions = match value {
                        Bson::Document(d) if d.contains_key("$each") => d
                            .get_array("$each")
                            .map_err(|_| DocRelayError::Store("$each must be an array".to_string()))?
                            .clone(),
                        other => vec![other.clone()],
                    };
                    match get_path(document, path).cloned() {
                        None => set_path(document, path, Bson::Array(additions))?,
                        Some(Bson::Array(mut items)) => {
                            items.extend(additions);
                            set_path(document, path, Bson::Array(items))?;
                        }
                        Some(_) => {
                            return Err(DocRelayError::Store(format!(
                                "The field '{}' must be an array",
                                path
                            )))
                        }
                    }
                }
                "$pull" => {
                    if let Some(Bson::Array(items)) = get_path(document, path).cloned() {
                        let kept: Vec<Bson> = items
                            .into_iter()
                            .filter(|item| !pull_matches(item, value))
                            .collect();
                        set_path(document, path, Bson::Array(kept))?;
                    }
                }
                other => {
                    return Err(DocRelayError::Store(format!(
                        "Unknown modifier: {}",
                        other
                    )))
                }
            }
        }
    }
    Ok(())
}

fn pull_matches(item: &Bson, condition: &Bson) -> bool {
    match condition {
        Bson::Document(ops) if is_operator_document(condition) => ops
            .iter()
            .all(|(op, operand)| matches_operator(Some(item), op, operand)),
        Bson::Document(filter) => item.as_document().is_some_and(|d| matches(d, filter)),
        other => values_equal(item, other),
    }
}

fn project(document: &BsonDocument, projection: &BsonDocument) -> Result<BsonDocument> {
    let truthy = |v: &Bson| match v {
        Bson::Boolean(b) => *b,
        other => as_f64(other).map_or(true, |n| n != 0.0),
    };
    let include_id = projection.get("_id").map_or(true, truthy);
    let fields: Vec<(&String, bool)> = projection
        .iter()
        .filter(|(k, _)| k.as_str() != "_id")
        .map(|(k, v)| (k, truthy(v)))
        .collect();

    if fields.is_empty() {
        let mut out = document.clone();
        if !include_id {
            out.remove("_id");
        }
        return Ok(out);
    }

    let inclusive = fields[0].1;
    if fields.iter().any(|(_, include)| *include != inclusive) {
        return Err(DocRelayError::Store(
            "Cannot do exclusion and inclusion in the same projection".to_string(),
        ));
    }

    if inclusive {
        let mut out = BsonDocument::new();
        if include_id {
            if let Some(id) = document.get("_id") {
                out.insert("_id", id.clone());
            }
        }
        for (path, _) in fields {
            if let Some(value) = get_path(document, path) {
                set_path(&mut out, path, value.clone())?;
            }
        }
        Ok(out)
    } else {
        let mut out = document.clone();
        if !include_id {
            out.remove("_id");
        }
        for (path, _) in fields {
            remove_path(&mut out, path);
        }
        Ok(out)
    }
}
