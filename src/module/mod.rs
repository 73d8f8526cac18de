//! Served module: the registry of functions a server exposes.
//!
//! Functions are registered by name at startup. A name maps either to a
//! plain value (returned as-is) or to a handler. Handlers return an
//! [`Output`], which is a single value or a lazy sequence.

pub mod builtin;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvocationError {
    #[error("Function not found: {0}")]
    UnknownFunction(String),

    #[error("Bad argument: {0}")]
    BadArgument(String),

    #[error("{0}")]
    Failed(String),

    #[error("Function panicked: {0}")]
    Panicked(String),

    #[error("Invocation timed out after {0:?}")]
    TimedOut(Duration),
}

impl InvocationError {
    /// Structured error result returned to the caller in place of a value.
    pub fn into_result(self, function: &str) -> Value {
        json!({
            "success": false,
            "error": self.to_string(),
            "fn": function,
        })
    }
}

/// Positional and keyword arguments of one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl CallArgs {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Fetch an argument by keyword, falling back to its position.
    pub fn get<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, InvocationError> {
        self.opt(index, name)?
            .ok_or_else(|| InvocationError::BadArgument(format!("missing argument '{}'", name)))
    }

    /// Like [`CallArgs::get`], but a missing argument is `None`.
    pub fn opt<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
    ) -> Result<Option<T>, InvocationError> {
        let raw = match self.kwargs.get(name).or_else(|| self.args.get(index)) {
            Some(Value::Null) | None => return Ok(None),
            Some(raw) => raw,
        };
        serde_json::from_value(raw.clone())
            .map(Some)
            .map_err(|e| InvocationError::BadArgument(format!("'{}': {}", name, e)))
    }
}

/// What a function produced.
pub enum Output {
    /// A single concrete result.
    Value(Value),
    /// A lazy, single-pass sequence of results.
    Sequence(BoxStream<'static, Value>),
}

impl Output {
    pub fn stream<S>(items: S) -> Self
    where
        S: Stream<Item = Value> + Send + 'static,
    {
        Self::Sequence(items.boxed())
    }

    pub fn iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Self::Sequence(stream::iter(items).boxed())
    }

    pub fn is_sequence(&self) -> bool {
        matches!(self, Self::Sequence(_))
    }
}

impl From<Value> for Output {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Sequence(_) => f.write_str("Sequence(..)"),
        }
    }
}

type AsyncHandler =
    dyn Fn(CallArgs) -> BoxFuture<'static, Result<Output, InvocationError>> + Send + Sync;
type BlockingHandler = dyn Fn(CallArgs) -> Result<Output, InvocationError> + Send + Sync;

#[derive(Clone)]
enum Handler {
    Value(Value),
    Async(Arc<AsyncHandler>),
    Blocking(Arc<BlockingHandler>),
}

impl Handler {
    fn kind(&self) -> &'static str {
        match self {
            Self::Value(_) => "value",
            Self::Async(_) | Self::Blocking(_) => "function",
        }
    }
}

/// Named set of functions served by one process.
#[derive(Clone)]
pub struct ServedModule {
    name: String,
    functions: BTreeMap<String, Handler>,
}

impl ServedModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a plain value.
    pub fn value(mut self, name: &str, value: Value) -> Self {
        self.insert_value(name, value);
        self
    }

    pub fn insert_value(&mut self, name: &str, value: Value) {
        self.functions.insert(name.to_string(), Handler::Value(value));
    }

    /// Register a synchronous function. It runs on the blocking pool.
    pub fn blocking<F, R>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(CallArgs) -> Result<R, InvocationError> + Send + Sync + 'static,
        R: Into<Output>,
    {
        let handler: Arc<BlockingHandler> = Arc::new(move |args| f(args).map(Into::into));
        self.functions
            .insert(name.to_string(), Handler::Blocking(handler));
        self
    }

    /// Register an async function.
    pub fn handler<F, Fut, R>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, InvocationError>> + Send + 'static,
        R: Into<Output>,
    {
        let handler: Arc<AsyncHandler> =
            Arc::new(move |args| f(args).map(|r| r.map(Into::into)).boxed());
        self.functions.insert(name.to_string(), Handler::Async(handler));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn functions(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }

    /// Map of name -> "function" | "value".
    pub fn schema(&self) -> Value {
        let entries = self
            .functions
            .iter()
            .map(|(name, handler)| (name.clone(), Value::from(handler.kind())))
            .collect::<Map<String, Value>>();
        Value::Object(entries)
    }

    /// Invoke `function`, capturing panics and enforcing `timeout`.
    pub async fn invoke(
        &self,
        function: &str,
        args: CallArgs,
        timeout: Duration,
    ) -> Result<Output, InvocationError> {
        let handler = self
            .functions
            .get(function)
            .ok_or_else(|| InvocationError::UnknownFunction(function.to_string()))?;

        match handler {
            Handler::Value(value) => Ok(Output::Value(value.clone())),
            Handler::Async(f) => {
                let future = std::panic::catch_unwind(AssertUnwindSafe(|| f(args)))
                    .map_err(|panic| InvocationError::Panicked(panic_message(panic.as_ref())))?;
                match tokio::time::timeout(timeout, AssertUnwindSafe(future).catch_unwind()).await
                {
                    Err(_) => Err(InvocationError::TimedOut(timeout)),
                    Ok(Err(panic)) => Err(InvocationError::Panicked(panic_message(panic.as_ref()))),
                    Ok(Ok(result)) => result,
                }
            }
            Handler::Blocking(f) => {
                let f = Arc::clone(f);
                let task = tokio::task::spawn_blocking(move || f(args));
                match tokio::time::timeout(timeout, task).await {
                    Err(_) => Err(InvocationError::TimedOut(timeout)),
                    Ok(Err(join)) if join.is_panic() => Err(InvocationError::Panicked(
                        panic_message(join.into_panic().as_ref()),
                    )),
                    Ok(Err(join)) => Err(InvocationError::Failed(join.to_string())),
                    Ok(Ok(result)) => result,
                }
            }
        }
    }
}

impl fmt::Debug for ServedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServedModule")
            .field("name", &self.name)
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn module() -> ServedModule {
        ServedModule::new("test")
            .value("version", json!("1.0"))
            .blocking("double", |call| {
                let n: i64 = call.get(0, "n")?;
                Ok(json!(n * 2))
            })
            .handler("greet", |call| async move {
                let name: String = call.get(0, "name")?;
                Ok::<_, InvocationError>(json!(format!("hello {}", name)))
            })
            .blocking("boom", |_| -> Result<Value, InvocationError> { panic!("kaboom") })
            .handler("async_boom", |_| async {
                if true {
                    panic!("async kaboom");
                }
                Ok::<_, InvocationError>(Value::Null)
            })
            .handler("slow", |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, InvocationError>(Value::Null)
            })
            .handler("numbers", |_| async {
                Ok::<_, InvocationError>(Output::iter((0..3).map(Value::from)))
            })
    }

    #[tokio::test]
    async fn test_plain_value_returned_as_is() {
        let out = module().invoke("version", CallArgs::default(), TIMEOUT).await.unwrap();
        assert!(matches!(out, Output::Value(v) if v == json!("1.0")));
    }

    #[tokio::test]
    async fn test_positional_and_keyword_args() {
        let m = module();
        let out = m
            .invoke("double", CallArgs::new(vec![json!(21)], Map::new()), TIMEOUT)
            .await
            .unwrap();
        assert!(matches!(out, Output::Value(v) if v == json!(42)));

        let mut kwargs = Map::new();
        kwargs.insert("name".into(), json!("bob"));
        let out = m.invoke("greet", CallArgs::new(vec![], kwargs), TIMEOUT).await.unwrap();
        assert!(matches!(out, Output::Value(v) if v == json!("hello bob")));
    }

    #[tokio::test]
    async fn test_unknown_function() {
        let result = module().invoke("missing", CallArgs::default(), TIMEOUT).await;
        assert_eq!(result.unwrap_err(), InvocationError::UnknownFunction("missing".into()));
    }

    #[tokio::test]
    async fn test_missing_argument() {
        let result = module().invoke("double", CallArgs::default(), TIMEOUT).await;
        assert!(matches!(result, Err(InvocationError::BadArgument(_))));
    }

    #[tokio::test]
    async fn test_blocking_panic_is_captured() {
        let result = module().invoke("boom", CallArgs::default(), TIMEOUT).await;
        assert_eq!(result.unwrap_err(), InvocationError::Panicked("kaboom".into()));
    }

    #[tokio::test]
    async fn test_async_panic_is_captured() {
        let result = module().invoke("async_boom", CallArgs::default(), TIMEOUT).await;
        assert_eq!(result.unwrap_err(), InvocationError::Panicked("async kaboom".into()));
    }

    #[tokio::test]
    async fn test_timeout() {
        let result = module()
            .invoke("slow", CallArgs::default(), Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(InvocationError::TimedOut(_))));
    }

    #[tokio::test]
    async fn test_sequence_output() {
        let out = module().invoke("numbers", CallArgs::default(), TIMEOUT).await.unwrap();
        let Output::Sequence(items) = out else {
            panic!("expected a sequence");
        };
        let items: Vec<Value> = items.collect().await;
        assert_eq!(items, vec![json!(0), json!(1), json!(2)]);
    }

    #[test]
    fn test_schema_lists_kinds() {
        let schema = module().schema();
        assert_eq!(schema["version"], "value");
        assert_eq!(schema["double"], "function");
    }

    #[test]
    fn test_error_result_shape() {
        let result = InvocationError::Failed("nope".into()).into_result("f");
        assert_eq!(result, json!({"success": false, "error": "nope", "fn": "f"}));
    }
}
