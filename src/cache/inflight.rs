//! Table of outstanding binding calls, one per query key.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::TransportError;

/// A binding call that any number of waiters can await; all of them observe
/// the same single resolution.
pub type SharedResponse = Shared<BoxFuture<'static, Result<Value, TransportError>>>;

/// At most one pending call per query key. An entry is removed as soon as
/// its call settles, before any waiter sees the result.
#[derive(Default)]
pub struct InFlightTable {
  entries: Mutex<HashMap<String, (u64, SharedResponse)>>,
  generation: AtomicU64,
}

impl InFlightTable {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<String, (u64, SharedResponse)>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Join the pending call for `key`, or register the call built by `start`.
  ///
  /// Returns the handle and whether an existing call was joined.
  pub fn join_or_start<F>(self: &Arc<Self>, key: &str, start: F) -> (SharedResponse, bool)
  where
    F: FnOnce() -> BoxFuture<'static, Result<Value, TransportError>>,
  {
    let mut entries = self.lock();
    if let Some((_, pending)) = entries.get(key) {
      return (pending.clone(), true);
    }

    let generation = self.generation.fetch_add(1, Ordering::SeqCst);
    let table = Arc::clone(self);
    let owned_key = key.to_string();
    let call = start();
    let pending = async move {
      let result = call.await;
      table.release(&owned_key, generation);
      result
    }
    .boxed()
    .shared();

    entries.insert(key.to_string(), (generation, pending.clone()));
    (pending, false)
  }

  fn release(&self, key: &str, generation: u64) {
    let mut entries = self.lock();
    if entries.get(key).map(|(g, _)| *g) == Some(generation) {
      entries.remove(key);
    }
  }

  pub fn contains(&self, key: &str) -> bool {
    self.lock().contains_key(key)
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }
}
