use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;

use crate::context::ExecutionContext;
use crate::outcome::Outcome;

/// An in-process component implementation.
///
/// `execute` receives the bound inputs (one value per satisfied input port),
/// the node's static params, and the sandboxed context. It must return an
/// [`Outcome`]; engine-level problems are expressed as internal failures,
/// never panics.
#[async_trait]
pub trait InlineComponent: Send + Sync {
  async fn execute(
    &self,
    inputs: serde_json::Map<String, serde_json::Value>,
    params: serde_json::Map<String, serde_json::Value>,
    ctx: ExecutionContext,
  ) -> Outcome;
}

type FnFuture = Pin<Box<dyn Future<Output = Outcome> + Send>>;
type FnExecute = dyn Fn(serde_json::Map<String, serde_json::Value>, serde_json::Map<String, serde_json::Value>, ExecutionContext) -> FnFuture
  + Send
  + Sync;

/// Closure-backed component, used by tests and embedders.
pub struct FnComponent {
  execute: Box<FnExecute>,
}

impl FnComponent {
  pub fn new<F, Fut>(f: F) -> Self
  where
    F: Fn(
        serde_json::Map<String, serde_json::Value>,
        serde_json::Map<String, serde_json::Value>,
        ExecutionContext,
      ) -> Fut
      + Send
      + Sync
      + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
  {
    Self {
      execute: Box::new(move |inputs, params, ctx| Box::pin(f(inputs, params, ctx))),
    }
  }
}

#[async_trait]
impl InlineComponent for FnComponent {
  async fn execute(
    &self,
    inputs: serde_json::Map<String, serde_json::Value>,
    params: serde_json::Map<String, serde_json::Value>,
    ctx: ExecutionContext,
  ) -> Outcome {
    (self.execute)(inputs, params, ctx).await
  }
}
