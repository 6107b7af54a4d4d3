//! Scripted binding for engine tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{Binding, CollectionInfo};
use crate::descriptor::QueryDescriptor;
use crate::error::TransportError;

/// Answers calls in order from a queue of scripted outcomes, optionally
/// after a delay, and counts invocations.
#[derive(Default)]
pub(crate) struct ScriptedBinding {
  outcomes: Mutex<VecDeque<Result<Value, TransportError>>>,
  performed: Mutex<Vec<QueryDescriptor>>,
  calls: AtomicUsize,
  delay: Duration,
}

impl ScriptedBinding {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_delay(delay: Duration) -> Self {
    Self {
      delay,
      ..Self::default()
    }
  }

  pub fn respond(self, response: Value) -> Self {
    self.outcomes.lock().unwrap().push_back(Ok(response));
    self
  }

  pub fn fail(self, error: TransportError) -> Self {
    self.outcomes.lock().unwrap().push_back(Err(error));
    self
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn performed(&self) -> Vec<QueryDescriptor> {
    self.performed.lock().unwrap().clone()
  }
}

#[async_trait]
impl Binding for ScriptedBinding {
  async fn perform(&self, query: &QueryDescriptor) -> Result<Value, TransportError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    self.performed.lock().unwrap().push(query.clone());
    let outcome = self
      .outcomes
      .lock()
      .unwrap()
      .pop_front()
      .unwrap_or_else(|| Err(TransportError::Backend("no scripted response".into())));

    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    outcome
  }

  async fn get_all_collections(&self) -> Result<Vec<CollectionInfo>, TransportError> {
    Ok(Vec::new())
  }
}
