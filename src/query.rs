//! Query execution engine.
//!
//! A `Query` runs one descriptor through its fetch policy: it reads the
//! cache, joins or starts the backend call, normalizes the response into the
//! store and records loading, success and error states.
//!
//! # Example
//!
//! ```ignore
//! let posts = connection.query(
//!   QueryDescriptor::find_many("Post", json!({"take": 10})),
//!   QueryOptions::default(),
//! );
//!
//! // Start fetching; the work is spawned and progresses on its own
//! let pending = posts.fetch()?;
//!
//! // Await the pending handle when the result is needed
//! pending.await?;
//! match posts.status() {
//!   QueryStatus::Success => render(posts.data()),
//!   QueryStatus::Error => render_error(posts.error()),
//!   _ => {}
//! }
//! ```

use chrono::Duration;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::cache::{merge_page, EntityId, FieldSnapshot, Page, QueryResult, Transaction};
use crate::connection::Connection;
use crate::descriptor::{Operation, OperationKind, QueryDescriptor};
use crate::error::{QueryError, QueryWarning, TransportError};
use crate::schema::{CollectionShape, Schema};

/// How a query balances the cache against the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchPolicy {
  /// Always fetch, then overwrite the cached result
  CacheAndNetwork,
  /// Fetch and normalize entities, but never cache the result
  NoCache,
  /// Fetch and keep the result on the query only
  NetworkOnly,
  /// Never touch the network
  CacheOnly,
  /// Serve a cached result if there is one, otherwise fetch
  CacheFirst,
}

impl FetchPolicy {
  /// Policy used when the options name none. Custom actions have no default.
  pub fn default_for(operation: &Operation) -> Option<Self> {
    match operation.kind()? {
      OperationKind::Read => Some(Self::CacheAndNetwork),
      OperationKind::Write => Some(Self::NoCache),
    }
  }

  fn writes_cache(self) -> bool {
    matches!(self, Self::CacheAndNetwork | Self::CacheFirst)
  }
}

impl fmt::Display for FetchPolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::CacheAndNetwork => "cache-and-network",
      Self::NoCache => "no-cache",
      Self::NetworkOnly => "network-only",
      Self::CacheOnly => "cache-only",
      Self::CacheFirst => "cache-first",
    })
  }
}

impl FromStr for FetchPolicy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "cache-and-network" => Ok(Self::CacheAndNetwork),
      "no-cache" => Ok(Self::NoCache),
      "network-only" => Ok(Self::NetworkOnly),
      "cache-only" => Ok(Self::CacheOnly),
      "cache-first" => Ok(Self::CacheFirst),
      other => Err(format!("unknown fetch policy '{}'", other)),
    }
  }
}

/// Per-query options.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
  /// Overrides the operation's default policy
  pub fetch_policy: Option<FetchPolicy>,
  /// Apply `payload.data` to the store before an `update` call returns
  pub optimistic: bool,
  /// With `cache-first`, cached results older than this count as missing
  pub stale_time: Option<Duration>,
}

impl QueryOptions {
  pub fn with_policy(mut self, policy: FetchPolicy) -> Self {
    self.fetch_policy = Some(policy);
    self
  }

  pub fn optimistic(mut self) -> Self {
    self.optimistic = true;
    self
  }

  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = Some(stale_time);
    self
  }
}

/// Lifecycle of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// Query has not been started
  Idle,
  /// A backend call is outstanding
  Loading,
  Success,
  Error,
}

/// Handle on a running fetch. Cloneable; every clone resolves once with the
/// same outcome.
pub type Pending = Shared<BoxFuture<'static, Result<(), QueryError>>>;

struct QueryState {
  status: QueryStatus,
  error: Option<QueryError>,
  /// Result kept on the query when the policy does not write the cache
  response: Option<QueryResult>,
  pending: Option<Pending>,
}

/// Fields captured before an optimistic write.
struct Rollback {
  snapshot: FieldSnapshot,
}

/// A descriptor bound to a connection, with its own status and error.
///
/// Clones share state, so a clone handed to another task observes the same
/// transitions.
#[derive(Clone)]
pub struct Query {
  connection: Connection,
  descriptor: QueryDescriptor,
  policy: FetchPolicy,
  optimistic: bool,
  stale_time: Option<Duration>,
  warning: Option<QueryWarning>,
  state: Arc<Mutex<QueryState>>,
}

impl Query {
  pub fn new(connection: Connection, descriptor: QueryDescriptor, options: QueryOptions) -> Self {
    let resolved = options
      .fetch_policy
      .or_else(|| FetchPolicy::default_for(descriptor.operation()));
    let (policy, warning) = match resolved {
      Some(policy) => (policy, None),
      None => {
        let warning = QueryWarning::UnresolvedPolicy {
          key: descriptor.key().to_string(),
          operation: descriptor.operation().to_string(),
        };
        warn!("{}", warning);
        (FetchPolicy::NetworkOnly, Some(warning))
      }
    };

    Self {
      connection,
      descriptor,
      policy,
      optimistic: options.optimistic,
      stale_time: options.stale_time,
      warning,
      state: Arc::new(Mutex::new(QueryState {
        status: QueryStatus::Idle,
        error: None,
        response: None,
        pending: None,
      })),
    }
  }

  fn lock(&self) -> MutexGuard<'_, QueryState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn descriptor(&self) -> &QueryDescriptor {
    &self.descriptor
  }

  pub fn key(&self) -> &str {
    self.descriptor.key()
  }

  pub fn policy(&self) -> FetchPolicy {
    self.policy
  }

  pub fn warning(&self) -> Option<&QueryWarning> {
    self.warning.as_ref()
  }

  pub fn status(&self) -> QueryStatus {
    self.lock().status
  }

  pub fn is_loading(&self) -> bool {
    self.status() == QueryStatus::Loading
  }

  pub fn error(&self) -> Option<QueryError> {
    self.lock().error.clone()
  }

  /// Start the query according to its fetch policy.
  ///
  /// While a fetch is outstanding the existing handle is returned. A
  /// cache-only miss fails right away without entering `loading`.
  pub fn fetch(&self) -> Result<Pending, QueryError> {
    self.start(false)
  }

  /// Go to the network again, even when `cache-first` has a cached result.
  /// `cache-only` queries still only consult the cache.
  pub fn refetch(&self) -> Result<Pending, QueryError> {
    self.start(true)
  }

  /// Fetch and return the denormalized data once settled.
  pub async fn run(&self) -> Result<Option<Value>, QueryError> {
    self.fetch()?.await?;
    Ok(self.data())
  }

  fn start(&self, force_network: bool) -> Result<Pending, QueryError> {
    let mut state = self.lock();
    if state.status == QueryStatus::Loading {
      if let Some(pending) = &state.pending {
        return Ok(pending.clone());
      }
    }

    match self.policy {
      FetchPolicy::CacheOnly => {
        if !self.has_usable_cache() {
          let error = QueryError::CacheMiss {
            key: self.descriptor.cache_key().to_string(),
          };
          debug!(query = %self.descriptor, "cache-only miss");
          state.status = QueryStatus::Error;
          state.error = Some(error.clone());
          return Err(error);
        }
        return Ok(Self::settle_from_cache(&mut state));
      }
      FetchPolicy::CacheFirst if !force_network && self.has_usable_cache() => {
        debug!(query = %self.descriptor, "served from cache");
        return Ok(Self::settle_from_cache(&mut state));
      }
      _ => {}
    }

    debug!(query = %self.descriptor, policy = %self.policy, "loading");
    state.status = QueryStatus::Loading;
    let rollback = self.apply_optimistic();
    let response = self.connection.perform(&self.descriptor);

    let query = self.clone();
    let pending = async move {
      let outcome = response.await;
      query.settle(outcome, rollback)
    }
    .boxed()
    .shared();
    state.pending = Some(pending.clone());
    drop(state);

    tokio::spawn(pending.clone());
    Ok(pending)
  }

  fn settle_from_cache(state: &mut QueryState) -> Pending {
    state.status = QueryStatus::Success;
    state.error = None;
    future::ready(Ok(())).boxed().shared()
  }

  /// A later page is never served from the entry accumulated so far.
  fn has_usable_cache(&self) -> bool {
    if !self.descriptor.cursor_is_start() {
      return false;
    }
    let Some(cached) = self.connection.store().cached(self.descriptor.cache_key()) else {
      return false;
    };
    match self.stale_time {
      Some(stale_time) if self.policy == FetchPolicy::CacheFirst => !cached.is_stale(stale_time),
      _ => true,
    }
  }

  /// Write `payload.data` over the target entity, returning what it replaced.
  fn apply_optimistic(&self) -> Option<Rollback> {
    if !self.optimistic {
      return None;
    }
    if *self.descriptor.operation() != Operation::Update {
      debug!(query = %self.descriptor, "optimistic flag ignored for this operation");
      return None;
    }

    let collection = self.descriptor.collection();
    let schema = self.connection.store().schema();
    let shape = schema.get(collection)?;
    let id_field = shape.id_field().to_string();
    let id_value = self.descriptor.where_id(&id_field)?.clone();
    let id = EntityId::from_value(&id_value)?;
    let data = self.descriptor.data()?;
    let mut guess = as_references(schema, shape, data);
    guess.insert(id_field, id_value);

    self.connection.store().transact(|tx| {
      let snapshot = tx.snapshot_fields(collection, &id, data.keys().map(String::as_str))?;

      match tx.normalize(collection, &Value::Object(guess)) {
        Ok(_) => {
          debug!(collection, %id, "applied optimistic update");
          Some(Rollback { snapshot })
        }
        Err(e) => {
          tx.restore_fields(&snapshot);
          warn!(collection, %id, "optimistic update skipped: {}", e);
          None
        }
      }
    })
  }

  fn settle(
    &self,
    outcome: Result<Value, TransportError>,
    rollback: Option<Rollback>,
  ) -> Result<(), QueryError> {
    let applied = match outcome {
      Ok(raw) => self.apply_response(&raw),
      Err(e) => {
        warn!(query = %self.descriptor, "binding call failed: {}", e);
        Err(QueryError::Network(e))
      }
    };
    let applied = match (applied, rollback) {
      (Err(e), Some(rollback)) => Err(self.roll_back(rollback, e)),
      (applied, _) => applied,
    };

    let mut state = self.lock();
    state.pending = None;
    match applied {
      Ok(transient) => {
        if transient.is_some() {
          state.response = transient;
        }
        state.status = QueryStatus::Success;
        state.error = None;
        debug!(query = %self.descriptor, "success");
        Ok(())
      }
      Err(e) => {
        state.status = QueryStatus::Error;
        state.error = Some(e.clone());
        Err(e)
      }
    }
  }

  fn roll_back(&self, rollback: Rollback, cause: QueryError) -> QueryError {
    let snapshot = rollback.snapshot;
    if self.connection.store().transact(|tx| tx.restore_fields(&snapshot)) {
      info!(collection = %snapshot.collection, id = %snapshot.id, "rolled back optimistic update");
      cause
    } else {
      warn!(collection = %snapshot.collection, id = %snapshot.id, "optimistic rollback failed");
      QueryError::OptimisticRollback {
        collection: snapshot.collection,
        id: snapshot.id.to_string(),
      }
    }
  }

  /// Normalize a successful response and store the result per policy.
  ///
  /// Returns the result when it belongs on the query instead of the cache.
  fn apply_response(&self, raw: &Value) -> Result<Option<QueryResult>, QueryError> {
    let descriptor = &self.descriptor;
    let writes_cache = self.policy.writes_cache() && descriptor.operation().is_read();
    let transient = if writes_cache {
      None
    } else {
      self.lock().response.clone()
    };

    self.connection.store().transact(|tx| {
      let result = self.normalize_response(tx, raw)?;
      let result = match result {
        QueryResult::Page(page) => {
          let previous = if writes_cache {
            tx.cached(descriptor.cache_key()).and_then(|c| as_page(&c.result))
          } else {
            transient.as_ref().and_then(as_page)
          };
          QueryResult::Page(merge_page(previous, page, descriptor.cursor_is_start()))
        }
        other => other,
      };

      if writes_cache {
        tx.put_result(descriptor.cache_key(), descriptor.collection(), result);
        Ok(None)
      } else {
        Ok(Some(result))
      }
    })
  }

  fn normalize_response(&self, tx: &mut Transaction<'_>, raw: &Value) -> Result<QueryResult, QueryError> {
    let descriptor = &self.descriptor;
    let collection = descriptor.collection();

    if *descriptor.operation() == Operation::Delete {
      let target = tx
        .schema()
        .get(collection)
        .and_then(|shape| descriptor.where_id(shape.id_field()))
        .and_then(EntityId::from_value);
      if let Some(id) = target {
        if tx.delete(collection, &id) {
          debug!(collection, %id, "removed deleted entity");
        }
      }
    }
    // Delete, bulk and custom action responses are not entities of the collection
    let operation = descriptor.operation();
    if operation.is_delete() || operation.is_bulk() || operation.kind().is_none() {
      return Ok(QueryResult::Raw(raw.clone()));
    }
    if !tx.schema().contains(collection) {
      debug!(collection, "collection not registered, keeping raw response");
      return Ok(QueryResult::Raw(raw.clone()));
    }
    Ok(tx.normalize(collection, raw)?)
  }

  /// The result denormalized through the store: the cached entry if there is
  /// one, else the result kept on the query.
  pub fn data(&self) -> Option<Value> {
    let store = self.connection.store();
    if let Some(cached) = store.cached(self.descriptor.cache_key()) {
      return Some(store.denormalize(&cached.collection, &cached.result));
    }
    let response = self.lock().response.clone()?;
    Some(store.denormalize(self.descriptor.collection(), &response))
  }

  /// Forget the cached entry for this query and the result kept on it.
  pub fn clear_data(&self) {
    self.connection.store().clear_result(self.descriptor.cache_key());
    self.lock().response = None;
  }
}

/// `data` with embedded relation objects reduced to their ids, so an
/// optimistic guess writes only fields of the target entity and the
/// snapshot covers everything it changes.
fn as_references(schema: &Schema, shape: &CollectionShape, data: &Map<String, Value>) -> Map<String, Value> {
  data
    .iter()
    .map(|(field, value)| {
      let value = match shape.relation(field).and_then(|rel| schema.get(&rel.target)) {
        Some(target) => match value {
          Value::Array(items) => Value::Array(items.iter().map(|item| reference(target, item)).collect()),
          other => reference(target, other),
        },
        None => value.clone(),
      };
      (field.clone(), value)
    })
    .collect()
}

fn reference(target: &CollectionShape, value: &Value) -> Value {
  match value {
    Value::Object(obj) => target.id_of(obj).cloned().unwrap_or(Value::Null),
    other => other.clone(),
  }
}

fn as_page(result: &QueryResult) -> Option<&Page> {
  match result {
    QueryResult::Page(page) => Some(page),
    _ => None,
  }
}

impl fmt::Debug for Query {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.lock();
    f.debug_struct("Query")
      .field("descriptor", &self.descriptor)
      .field("policy", &self.policy)
      .field("status", &state.status)
      .field("error", &state.error)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::binding::testing::ScriptedBinding;
  use crate::binding::MemoryBinding;
  use crate::cache::Store;
  use serde_json::json;
  use std::time::Duration as StdDuration;

  fn schema() -> Schema {
    Schema::builder()
      .collection("User", |c| c.scalar("username"))
      .collection("Post", |c| {
        c.scalar("text").scalar("liked").relation("user", "User")
      })
      .build()
      .unwrap()
  }

  fn connection(binding: &Arc<ScriptedBinding>) -> Connection {
    Connection::with_binding(binding.clone(), Store::new(schema()))
  }

  fn post(id: u64, user: u64) -> Value {
    json!({"id": id, "text": format!("post {}", id), "user": {"id": user, "username": format!("u{}", user)}})
  }

  fn page(ids: &[u64], is_last: bool) -> Value {
    let last = ids.last().copied();
    json!({
      "pagination": {"cursor": {"id": last}, "isLast": is_last},
      "data": ids.iter().map(|&id| post(id, 1)).collect::<Vec<_>>(),
    })
  }

  fn post_ids(data: &Value) -> Vec<u64> {
    data["data"]
      .as_array()
      .unwrap()
      .iter()
      .map(|p| p["id"].as_u64().unwrap())
      .collect()
  }

  #[test]
  fn test_default_policies() {
    assert_eq!(
      FetchPolicy::default_for(&Operation::FindMany),
      Some(FetchPolicy::CacheAndNetwork)
    );
    assert_eq!(FetchPolicy::default_for(&Operation::Count), Some(FetchPolicy::CacheAndNetwork));
    assert_eq!(FetchPolicy::default_for(&Operation::Update), Some(FetchPolicy::NoCache));
    assert_eq!(FetchPolicy::default_for(&Operation::DeleteMany), Some(FetchPolicy::NoCache));
    assert_eq!(FetchPolicy::default_for(&Operation::Action("publish".into())), None);
    assert_eq!("cache-first".parse::<FetchPolicy>(), Ok(FetchPolicy::CacheFirst));
    assert!("sometimes".parse::<FetchPolicy>().is_err());
  }

  #[tokio::test]
  async fn test_read_populates_cache_and_store() {
    let binding = Arc::new(ScriptedBinding::new().respond(json!([post(1, 7), post(2, 7)])));
    let connection = connection(&binding);
    let query = connection.query(QueryDescriptor::find_many("Post", json!({})), QueryOptions::default());

    assert_eq!(query.status(), QueryStatus::Idle);
    let pending = query.fetch().unwrap();
    assert_eq!(query.status(), QueryStatus::Loading);
    pending.await.unwrap();

    assert_eq!(query.status(), QueryStatus::Success);
    assert_eq!(query.policy(), FetchPolicy::CacheAndNetwork);
    assert!(connection.store().has_cached(query.descriptor().cache_key()));
    assert_eq!(connection.store().entity_count("Post"), 2);
    assert_eq!(connection.store().entity_count("User"), 1);
    assert_eq!(query.data(), Some(json!([post(1, 7), post(2, 7)])));
  }

  #[tokio::test]
  async fn test_write_normalizes_without_caching() {
    let binding = Arc::new(ScriptedBinding::new().respond(post(3, 1)));
    let connection = connection(&binding);
    let query = connection.query(
      QueryDescriptor::create("Post", json!({"data": {"text": "post 3"}})),
      QueryOptions::default(),
    );

    query.run().await.unwrap();

    assert_eq!(query.policy(), FetchPolicy::NoCache);
    assert_eq!(connection.store().cached_query_count(), 0);
    assert!(connection.store().get("Post", &EntityId::from(3u64)).is_some());
    assert_eq!(query.data(), Some(post(3, 1)));
  }

  #[tokio::test]
  async fn test_concurrent_queries_share_one_call() {
    let binding = Arc::new(
      ScriptedBinding::with_delay(StdDuration::from_millis(20)).respond(json!([post(1, 1)])),
    );
    let connection = connection(&binding);
    let descriptor = QueryDescriptor::find_many("Post", json!({"take": 1}));
    let a = connection.query(descriptor.clone(), QueryOptions::default());
    let b = connection.query(descriptor, QueryOptions::default());

    let (ra, rb) = futures::join!(a.fetch().unwrap(), b.fetch().unwrap());

    assert_eq!(binding.calls(), 1);
    assert!(ra.is_ok() && rb.is_ok());
    assert_eq!(a.data(), b.data());
    assert!(connection.in_flight().is_empty());
  }

  #[tokio::test]
  async fn test_refetch_while_loading_returns_pending_handle() {
    let binding = Arc::new(
      ScriptedBinding::with_delay(StdDuration::from_millis(20))
        .respond(json!([]))
        .respond(json!([post(1, 1)])),
    );
    let connection = connection(&binding);
    let query = connection.query(QueryDescriptor::find_many("Post", json!({})), QueryOptions::default());

    let first = query.fetch().unwrap();
    let second = query.refetch().unwrap();
    first.await.unwrap();
    second.await.unwrap();
    assert_eq!(binding.calls(), 1);
    assert_eq!(query.data(), Some(json!([])));

    query.refetch().unwrap().await.unwrap();
    assert_eq!(binding.calls(), 2);
    assert_eq!(query.data(), Some(json!([post(1, 1)])));
  }

  #[tokio::test]
  async fn test_pages_accumulate_and_reset() {
    let binding = Arc::new(
      ScriptedBinding::new()
        .respond(page(&[1, 2, 3], false))
        .respond(page(&[4, 5], true))
        .respond(page(&[1, 2, 3], false)),
    );
    let connection = connection(&binding);
    let first = || QueryDescriptor::find_many("Post", json!({"cursor": {"id": null}, "take": 3}));

    let query = connection.query(first(), QueryOptions::default());
    query.run().await.unwrap();
    assert_eq!(post_ids(&query.data().unwrap()), vec![1, 2, 3]);

    let next = connection.query(
      QueryDescriptor::find_many("Post", json!({"cursor": {"id": 3}, "take": 3})),
      QueryOptions::default(),
    );
    let data = next.run().await.unwrap().unwrap();
    assert_eq!(post_ids(&data), vec![1, 2, 3, 4, 5]);
    assert_eq!(data["pagination"]["isLast"], json!(true));
    assert_eq!(query.data(), Some(data));

    let restart = connection.query(first(), QueryOptions::default());
    let data = restart.run().await.unwrap().unwrap();
    assert_eq!(post_ids(&data), vec![1, 2, 3]);
  }

  #[tokio::test]
  async fn test_repeated_page_is_not_appended_twice() {
    let binding = Arc::new(
      ScriptedBinding::new()
        .respond(page(&[1, 2], false))
        .respond(page(&[3, 4], false))
        .respond(page(&[3, 4], false)),
    );
    let connection = connection(&binding);
    let start = connection.query(
      QueryDescriptor::find_many("Post", json!({"take": 2})),
      QueryOptions::default(),
    );
    start.run().await.unwrap();

    let next = QueryDescriptor::find_many("Post", json!({"cursor": {"id": 2}, "take": 2}));
    connection.query(next.clone(), QueryOptions::default()).run().await.unwrap();
    let data = connection.query(next, QueryOptions::default()).run().await.unwrap().unwrap();

    assert_eq!(post_ids(&data), vec![1, 2, 3, 4]);
  }

  #[tokio::test]
  async fn test_optimistic_update_rolls_back_on_failure() {
    let binding = Arc::new(
      ScriptedBinding::with_delay(StdDuration::from_millis(20))
        .fail(TransportError::Backend("rejected".into())),
    );
    let connection = connection(&binding);
    let store = connection.store().clone();
    store.upsert("Post", &json!({"id": 1, "text": "hello", "liked": false})).unwrap();

    let query = connection.query(
      QueryDescriptor::update(
        "Post",
        json!({"where": {"id": 1}, "data": {"liked": true, "likedBy": 4}}),
      ),
      QueryOptions::default().optimistic(),
    );
    let pending = query.fetch().unwrap();

    let guess = store.get("Post", &EntityId::from(1u64)).unwrap();
    assert_eq!(guess["liked"], json!(true));
    assert_eq!(guess["likedBy"], json!(4));

    let err = pending.await.unwrap_err();
    assert_eq!(err, QueryError::Network(TransportError::Backend("rejected".into())));
    assert_eq!(query.status(), QueryStatus::Error);
    assert_eq!(query.error(), Some(err));

    let restored = store.get("Post", &EntityId::from(1u64)).unwrap();
    assert_eq!(restored["liked"], json!(false));
    assert!(!restored.contains_key("likedBy"));
    assert_eq!(restored["text"], json!("hello"));
  }

  #[tokio::test]
  async fn test_optimistic_relation_guess_is_fully_rolled_back() {
    let binding = Arc::new(
      ScriptedBinding::with_delay(StdDuration::from_millis(20))
        .fail(TransportError::Backend("rejected".into())),
    );
    let connection = connection(&binding);
    let store = connection.store().clone();
    store.upsert("Post", &post(1, 7)).unwrap();

    let query = connection.query(
      QueryDescriptor::update(
        "Post",
        json!({"where": {"id": 1}, "data": {"user": {"id": 8, "username": "u8"}}}),
      ),
      QueryOptions::default().optimistic(),
    );
    let pending = query.fetch().unwrap();

    assert_eq!(store.get("Post", &EntityId::from(1u64)).unwrap()["user"], json!(8));
    assert!(store.get("User", &EntityId::from(8u64)).is_none());

    pending.await.unwrap_err();

    assert_eq!(store.get("Post", &EntityId::from(1u64)).unwrap()["user"], json!(7));
    assert!(store.get("User", &EntityId::from(8u64)).is_none());
    assert_eq!(store.resolve("Post", &json!(1)), post(1, 7));
  }

  #[tokio::test]
  async fn test_optimistic_update_overwritten_by_response() {
    let binding = Arc::new(
      ScriptedBinding::new().respond(json!({"id": 1, "text": "edited", "liked": true})),
    );
    let connection = connection(&binding);
    let store = connection.store().clone();
    store.upsert("Post", &json!({"id": 1, "text": "hello", "liked": false})).unwrap();

    let query = connection.query(
      QueryDescriptor::update("Post", json!({"where": {"id": 1}, "data": {"text": "draft"}})),
      QueryOptions::default().optimistic(),
    );
    query.run().await.unwrap();

    let stored = store.get("Post", &EntityId::from(1u64)).unwrap();
    assert_eq!(stored["text"], json!("edited"));
    assert_eq!(stored["liked"], json!(true));
  }

  #[tokio::test]
  async fn test_rollback_fails_when_entity_vanished() {
    let binding = Arc::new(
      ScriptedBinding::with_delay(StdDuration::from_millis(20))
        .fail(TransportError::Backend("rejected".into())),
    );
    let connection = connection(&binding);
    let store = connection.store().clone();
    store.upsert("Post", &json!({"id": 1, "liked": false})).unwrap();

    let query = connection.query(
      QueryDescriptor::update("Post", json!({"where": {"id": 1}, "data": {"liked": true}})),
      QueryOptions::default().optimistic(),
    );
    let pending = query.fetch().unwrap();
    assert!(store.delete("Post", &EntityId::from(1u64)));

    let err = pending.await.unwrap_err();

    assert_eq!(
      err,
      QueryError::OptimisticRollback {
        collection: "Post".into(),
        id: "1".into()
      }
    );
    assert!(store.get("Post", &EntityId::from(1u64)).is_none());
  }

  #[tokio::test]
  async fn test_optimistic_skipped_for_missing_entity() {
    let binding = Arc::new(ScriptedBinding::new().fail(TransportError::NotFound {
      collection: "Post".into(),
      id: "9".into(),
    }));
    let connection = connection(&binding);

    let query = connection.query(
      QueryDescriptor::update("Post", json!({"where": {"id": 9}, "data": {"liked": true}})),
      QueryOptions::default().optimistic(),
    );
    let err = query.fetch().unwrap().await.unwrap_err();

    assert!(matches!(err, QueryError::Network(TransportError::NotFound { .. })));
    assert!(connection.store().get("Post", &EntityId::from(9u64)).is_none());
  }

  #[tokio::test]
  async fn test_cache_only_miss_fails_without_loading() {
    let binding = Arc::new(ScriptedBinding::new());
    let connection = connection(&binding);
    let query = connection.query(
      QueryDescriptor::find_many("Post", json!({})),
      QueryOptions::default().with_policy(FetchPolicy::CacheOnly),
    );

    let err = query.fetch().unwrap_err();

    assert!(matches!(err, QueryError::CacheMiss { .. }));
    assert_eq!(query.status(), QueryStatus::Error);
    assert_eq!(query.error(), Some(err));
    assert_eq!(binding.calls(), 0);
  }

  #[tokio::test]
  async fn test_cache_only_and_cache_first_hits_skip_network() {
    let binding = Arc::new(ScriptedBinding::new().respond(json!([post(1, 1)])));
    let connection = connection(&binding);
    let descriptor = QueryDescriptor::find_many("Post", json!({}));
    connection.query(descriptor.clone(), QueryOptions::default()).run().await.unwrap();

    for policy in [FetchPolicy::CacheOnly, FetchPolicy::CacheFirst] {
      let query = connection.query(descriptor.clone(), QueryOptions::default().with_policy(policy));
      query.fetch().unwrap().await.unwrap();
      assert_eq!(query.status(), QueryStatus::Success);
      assert_eq!(query.data(), Some(json!([post(1, 1)])));
    }
    assert_eq!(binding.calls(), 1);
  }

  #[tokio::test]
  async fn test_cache_first_miss_and_stale_entry_fetch() {
    let binding = Arc::new(
      ScriptedBinding::new()
        .respond(json!([post(1, 1)]))
        .respond(json!([post(2, 1)])),
    );
    let connection = connection(&binding);
    let descriptor = QueryDescriptor::find_many("Post", json!({}));

    let query = connection.query(
      descriptor.clone(),
      QueryOptions::default().with_policy(FetchPolicy::CacheFirst),
    );
    query.run().await.unwrap();
    assert_eq!(binding.calls(), 1);

    let stale = connection.query(
      descriptor,
      QueryOptions::default()
        .with_policy(FetchPolicy::CacheFirst)
        .with_stale_time(Duration::zero()),
    );
    tokio::time::sleep(StdDuration::from_millis(5)).await;
    let data = stale.run().await.unwrap();

    assert_eq!(binding.calls(), 2);
    assert_eq!(data, Some(json!([post(2, 1)])));
  }

  #[tokio::test]
  async fn test_later_page_is_fetched_under_cache_first() {
    let binding = Arc::new(
      ScriptedBinding::new()
        .respond(page(&[1, 2], false))
        .respond(page(&[3, 4], true)),
    );
    let connection = connection(&binding);
    let cache_first = || QueryOptions::default().with_policy(FetchPolicy::CacheFirst);

    connection
      .query(QueryDescriptor::find_many("Post", json!({"take": 2})), cache_first())
      .run()
      .await
      .unwrap();
    let data = connection
      .query(
        QueryDescriptor::find_many("Post", json!({"take": 2, "cursor": {"id": 2}})),
        cache_first(),
      )
      .run()
      .await
      .unwrap()
      .unwrap();

    assert_eq!(post_ids(&data), vec![1, 2, 3, 4]);
    assert_eq!(binding.calls(), 2);
    assert_eq!(binding.performed()[1].payload()["cursor"], json!({"id": 2}));

    let first_page = connection.query(QueryDescriptor::find_many("Post", json!({"take": 2})), cache_first());
    assert_eq!(post_ids(&first_page.run().await.unwrap().unwrap()), vec![1, 2, 3, 4]);
    assert_eq!(binding.calls(), 2);
  }

  #[tokio::test]
  async fn test_cache_only_later_page_is_a_miss() {
    let binding = Arc::new(ScriptedBinding::new().respond(page(&[1, 2], false)));
    let connection = connection(&binding);
    connection
      .query(QueryDescriptor::find_many("Post", json!({"take": 2})), QueryOptions::default())
      .run()
      .await
      .unwrap();
    let cache_only = || QueryOptions::default().with_policy(FetchPolicy::CacheOnly);

    let next = connection.query(
      QueryDescriptor::find_many("Post", json!({"take": 2, "cursor": {"id": 2}})),
      cache_only(),
    );
    assert!(matches!(next.fetch(), Err(QueryError::CacheMiss { .. })));

    let start = connection.query(QueryDescriptor::find_many("Post", json!({"take": 2})), cache_only());
    start.fetch().unwrap().await.unwrap();
    assert_eq!(post_ids(&start.data().unwrap()), vec![1, 2]);
    assert_eq!(binding.calls(), 1);
  }

  #[tokio::test]
  async fn test_network_only_keeps_result_on_query() {
    let binding = Arc::new(ScriptedBinding::new().respond(json!([post(1, 1)])));
    let connection = connection(&binding);
    let query = connection.query(
      QueryDescriptor::find_many("Post", json!({})),
      QueryOptions::default().with_policy(FetchPolicy::NetworkOnly),
    );

    query.run().await.unwrap();

    assert_eq!(connection.store().cached_query_count(), 0);
    assert_eq!(query.data(), Some(json!([post(1, 1)])));

    query.clear_data();
    assert_eq!(query.data(), None);
  }

  #[tokio::test]
  async fn test_failure_leaves_cached_result_untouched() {
    let binding = Arc::new(
      ScriptedBinding::new()
        .respond(json!([post(1, 1)]))
        .fail(TransportError::Request("offline".into())),
    );
    let connection = connection(&binding);
    let query = connection.query(QueryDescriptor::find_many("Post", json!({})), QueryOptions::default());
    query.run().await.unwrap();
    let version = connection.store().query_version(query.descriptor().cache_key());

    let err = query.refetch().unwrap().await.unwrap_err();

    assert!(matches!(err, QueryError::Network(TransportError::Request(_))));
    assert_eq!(query.status(), QueryStatus::Error);
    assert_eq!(query.data(), Some(json!([post(1, 1)])));
    assert_eq!(connection.store().query_version(query.descriptor().cache_key()), version);
  }

  #[tokio::test]
  async fn test_custom_action_falls_back_to_network_only() {
    let binding = Arc::new(ScriptedBinding::new().respond(json!({"published": 2})));
    let connection = connection(&binding);
    let query = connection.query(
      QueryDescriptor::new("Post", Operation::Action("publishAll".into()), json!({})),
      QueryOptions::default(),
    );

    assert_eq!(query.policy(), FetchPolicy::NetworkOnly);
    assert!(matches!(
      query.warning(),
      Some(QueryWarning::UnresolvedPolicy { operation, .. }) if operation == "action:publishAll"
    ));

    let data = query.run().await.unwrap();
    assert_eq!(connection.store().cached_query_count(), 0);
    assert_eq!(data, Some(json!({"published": 2})));
  }

  #[tokio::test]
  async fn test_delete_removes_entity_and_references() {
    let binding = Arc::new(
      ScriptedBinding::new()
        .respond(json!([post(1, 7), post(2, 8)]))
        .respond(json!({"id": 7})),
    );
    let connection = connection(&binding);
    let posts = connection.query(QueryDescriptor::find_many("Post", json!({})), QueryOptions::default());
    posts.run().await.unwrap();

    let delete = connection.query(
      QueryDescriptor::delete("User", json!({"where": {"id": 7}})),
      QueryOptions::default(),
    );
    let response = delete.run().await.unwrap();

    assert_eq!(response, Some(json!({"id": 7})));
    assert!(connection.store().get("User", &EntityId::from(7u64)).is_none());
    let data = posts.data().unwrap();
    assert_eq!(data[0]["user"], Value::Null);
    assert_eq!(data[1]["user"]["username"], json!("u8"));
  }

  #[tokio::test]
  async fn test_update_many_keeps_summary_response() {
    let binding = MemoryBinding::from_seed(&json!({
      "Post": [{"id": 1, "text": "a"}, {"id": 2, "text": "b"}]
    }))
    .unwrap();
    let connection = Connection::new(binding, Store::new(schema()));

    let update = connection.query(
      QueryDescriptor::update_many("Post", json!({"where": {}, "data": {"text": "z"}})),
      QueryOptions::default(),
    );
    let summary = update.run().await.unwrap();

    assert_eq!(update.status(), QueryStatus::Success);
    assert_eq!(summary, Some(json!({"count": 2})));
    assert_eq!(connection.store().cached_query_count(), 0);

    let posts = connection
      .query(QueryDescriptor::find_many("Post", json!({})), QueryOptions::default())
      .run()
      .await
      .unwrap();
    assert_eq!(posts, Some(json!([{"id": 1, "text": "z"}, {"id": 2, "text": "z"}])));
  }

  #[tokio::test]
  async fn test_count_is_cached_raw() {
    let binding = Arc::new(ScriptedBinding::new().respond(json!(12)));
    let connection = connection(&binding);
    let query = connection.query(QueryDescriptor::count("Post", json!({})), QueryOptions::default());

    assert_eq!(query.run().await.unwrap(), Some(json!(12)));
    assert!(connection.store().has_cached(query.descriptor().cache_key()));
  }
}
