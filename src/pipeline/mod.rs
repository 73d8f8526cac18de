//! Request-handling pipeline.
//!
//! Every call goes through the same fixed sequence:
//!
//! 1. signature check (skipped in public mode)
//! 2. payload reconciliation (`data` wins over raw fields)
//! 3. deserialization
//! 4. freshness window
//! 5. access decision
//! 6. shape check (`args` present)
//! 7. invocation
//! 8. success classification
//! 9. encoding (signed value or chunk stream)
//! 10. history
//!
//! Failures in steps 1-6 end the call with an `{error}` body: nothing is
//! invoked and nothing is recorded. A failure during invocation is a result
//! like any other: it is signed, returned and recorded.

mod encoder;
mod envelope;
mod error;
mod observer;

pub use encoder::{
    drain, split_chunks, ChunkStream, EncodedResponse, ResultEncoder, StreamEnd,
    DEFAULT_CHUNK_SIZE,
};
pub use envelope::{DecodedCall, Envelope, VerifiedEnvelope};
pub use error::PipelineError;
pub use observer::{PipelineEvent, PipelineObserver, TracingObserver};

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio_util::task::TaskTracker;
use tracing::{Instrument, Span};

use crate::access::{AccessControl, AccessDecision, AccessRequest, AllowAll};
use crate::history::{HistoryRecord, HistoryStore};
use crate::identity::{ServerIdentity, SignedPayload};
use crate::module::{CallArgs, Output, ServedModule};
use crate::serializer::{JsonSerializer, Serializer};
use crate::telemetry::{RequestSpan, SpanExt};

/// Immutable pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Skip signature verification.
    pub public: bool,
    /// Calls at least this old are rejected.
    pub max_staleness: Duration,
    /// Stream sequence results instead of collecting them.
    pub streaming: bool,
    pub chunk_size: usize,
    pub save_history: bool,
    /// Invocation timeout.
    pub timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            public: false,
            max_staleness: Duration::from_secs(60),
            streaming: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            save_history: true,
            timeout: Duration::from_secs(256),
        }
    }
}

/// What the transport sends back.
#[derive(Debug)]
pub enum PipelineResponse {
    /// Single result, signed by the server key.
    Signed(SignedPayload),
    /// Sequence result, delivered chunk by chunk.
    Stream(ChunkStream),
    /// Access control said no; the decision is the body.
    Denied(AccessDecision),
    /// Rejected before invocation.
    Rejected(PipelineError),
}

impl PipelineResponse {
    /// Short label for logs.
    pub fn status(&self) -> &'static str {
        match self {
            Self::Signed(_) => "signed",
            Self::Stream(_) => "stream",
            Self::Denied(_) => "denied",
            Self::Rejected(e) => e.kind(),
        }
    }

    /// JSON body for non-streaming responses.
    pub fn body(&self) -> Option<Value> {
        match self {
            Self::Signed(payload) => serde_json::to_value(payload).ok(),
            Self::Denied(decision) => Some(decision.to_value()),
            Self::Rejected(error) => Some(error.to_body()),
            Self::Stream(_) => None,
        }
    }
}

/// Admission result of steps 1-6.
enum Admission {
    Admitted {
        call: DecodedCall,
        args: CallArgs,
        decision: AccessDecision,
    },
    Denied(DecodedCall, AccessDecision),
}

/// Orchestrates one call from envelope to response.
pub struct RequestPipeline {
    config: PipelineConfig,
    identity: Arc<ServerIdentity>,
    module: Arc<ServedModule>,
    access: Arc<dyn AccessControl>,
    serializer: Arc<dyn Serializer>,
    encoder: ResultEncoder,
    history: Option<HistoryStore>,
    observer: Arc<dyn PipelineObserver>,
    tasks: TaskTracker,
}

impl RequestPipeline {
    /// Pipeline with JSON encoding, no access restrictions and no history.
    pub fn new(
        config: PipelineConfig,
        identity: Arc<ServerIdentity>,
        module: Arc<ServedModule>,
    ) -> Self {
        let serializer: Arc<dyn Serializer> = Arc::new(JsonSerializer::default());
        let encoder = ResultEncoder::new(
            Arc::clone(&serializer),
            Arc::clone(&identity),
            config.chunk_size,
        );
        Self {
            config,
            identity,
            module,
            access: Arc::new(AllowAll),
            serializer,
            encoder,
            history: None,
            observer: Arc::new(TracingObserver),
            tasks: TaskTracker::new(),
        }
    }

    pub fn with_access(mut self, access: Arc<dyn AccessControl>) -> Self {
        self.access = access;
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.encoder = ResultEncoder::new(
            Arc::clone(&serializer),
            Arc::clone(&self.identity),
            self.config.chunk_size,
        );
        self.serializer = serializer;
        self
    }

    /// Record history in `store`. Ignored when `save_history` is off.
    pub fn with_history(mut self, store: HistoryStore) -> Self {
        if self.config.save_history {
            self.history = Some(store);
        }
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn module(&self) -> &ServedModule {
        &self.module
    }

    pub fn history(&self) -> Option<&HistoryStore> {
        self.history.as_ref()
    }

    /// Handle one call. Never fails: every outcome is a response.
    pub async fn handle(&self, function: &str, envelope: Envelope) -> PipelineResponse {
        let call_id = uuid::Uuid::new_v4().to_string();
        let span = RequestSpan::new(&call_id, function);
        let started = Instant::now();
        let response = self.run(function, envelope).instrument(span.clone()).await;
        if let PipelineResponse::Rejected(error) = &response {
            span.record_error(error);
        }
        span.record_outcome(response.status(), started.elapsed().as_millis() as u64);
        response
    }

    /// Parse a raw request body, then [`handle`](Self::handle) it.
    pub async fn handle_body(&self, function: &str, body: &[u8]) -> PipelineResponse {
        match Envelope::from_slice(body) {
            Ok(envelope) => self.handle(function, envelope).await,
            Err(error) => self.reject(function, error),
        }
    }

    /// Answer a call that never reached the pipeline proper.
    pub fn reject(&self, function: &str, error: PipelineError) -> PipelineResponse {
        self.observer
            .observe(&PipelineEvent::Rejected { function, error: &error });
        PipelineResponse::Rejected(error)
    }

    /// Wait for pending history writes.
    pub async fn flush_history(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// History writes not yet finished.
    pub fn pending_history(&self) -> usize {
        self.tasks.len()
    }

    async fn run(&self, function: &str, envelope: Envelope) -> PipelineResponse {
        match self.admit(function, envelope).await {
            Err(error) => self.reject(function, error),
            Ok(Admission::Denied(call, decision)) => {
                self.observer.observe(&PipelineEvent::Denied {
                    function,
                    caller: &call.address,
                    decision: &decision,
                });
                PipelineResponse::Denied(decision)
            }
            Ok(Admission::Admitted {
                call,
                args,
                decision,
            }) => self.dispatch(function, call, args, decision).await,
        }
    }

    /// Steps 1-6.
    async fn admit(&self, function: &str, envelope: Envelope) -> Result<Admission, PipelineError> {
        let verified = envelope.authenticate(self.config.public)?;
        Span::current().record("caller", verified.address());
        let signed = verified.is_signed();

        let (payload, address) = verified.into_payload();
        let payload = self
            .serializer
            .deserialize(payload)
            .map_err(|e| PipelineError::Decode(e.to_string()))?;
        let call = DecodedCall::from_value(payload, &address)?;

        self.check_freshness(&call, chrono::Utc::now().timestamp())?;

        let decision = self
            .access
            .verify(&AccessRequest::new(function, &call).authenticated(signed))
            .await;
        if !decision.success {
            return Ok(Admission::Denied(call, decision));
        }

        let args = call.call_args()?;
        Ok(Admission::Admitted {
            call,
            args,
            decision,
        })
    }

    fn check_freshness(&self, call: &DecodedCall, now: i64) -> Result<(), PipelineError> {
        let max = self.config.max_staleness.as_secs();
        let window = i64::try_from(max).unwrap_or(i64::MAX);
        let age = call.age(now);
        if age >= window {
            return Err(PipelineError::Stale { age, max });
        }
        if age <= -window {
            return Err(PipelineError::FromFuture { ahead: -age, max });
        }
        Ok(())
    }

    /// Steps 7-10.
    async fn dispatch(
        &self,
        function: &str,
        call: DecodedCall,
        args: CallArgs,
        decision: AccessDecision,
    ) -> PipelineResponse {
        let started = Instant::now();
        let output = match self
            .module
            .invoke(function, args.clone(), self.config.timeout)
            .await
        {
            Ok(Output::Sequence(items)) if !self.config.streaming => {
                match drain(items, self.config.timeout).await {
                    Ok(items) => Output::Value(items),
                    Err(e) => Output::Value(e.into_result(function)),
                }
            }
            Ok(output) => output,
            Err(e) => Output::Value(e.into_result(function)),
        };
        let latency = started.elapsed();

        let record = HistoryRecord {
            module: self.module.name().to_string(),
            function: function.to_string(),
            address: call.address.clone(),
            args: args.args,
            kwargs: args.kwargs,
            success: true,
            user: decision.to_value(),
            timestamp: call.timestamp,
            result: Value::Null,
            latency: latency.as_secs_f64(),
        };

        let (success, result) = match &output {
            Output::Value(result) => (is_success(result), result.clone()),
            Output::Sequence(_) => (true, Value::Null),
        };
        self.observer.observe(&PipelineEvent::Invoked {
            function,
            caller: &call.address,
            success,
            latency,
        });

        match self.encoder.encode(output) {
            Err(error) => self.reject(function, error),
            Ok(EncodedResponse::Signed(payload)) => {
                self.record(HistoryRecord {
                    success,
                    result,
                    ..record
                });
                PipelineResponse::Signed(payload)
            }
            Ok(EncodedResponse::Stream(stream)) => {
                let sink = self.history_sink();
                let observer = Arc::clone(&self.observer);
                let stream = stream.on_end(move |end| {
                    observer.observe(&PipelineEvent::StreamEnded {
                        function: &record.function,
                        caller: &record.address,
                        items: end.items,
                        chunks: end.chunks,
                        completed: end.completed,
                    });
                    // A stream the caller walked away from leaves no record
                    if !end.completed {
                        return;
                    }
                    if let Some(sink) = sink {
                        let mut result = json!({
                            "streamed": true,
                            "items": end.items,
                            "chunks": end.chunks,
                        });
                        if let Some(error) = &end.error {
                            result["error"] = Value::String(error.clone());
                        }
                        sink.submit(HistoryRecord {
                            success: end.error.is_none(),
                            result,
                            ..record
                        });
                    }
                });
                PipelineResponse::Stream(stream)
            }
        }
    }

    fn history_sink(&self) -> Option<HistorySink> {
        self.history.as_ref().map(|store| HistorySink {
            store: store.clone(),
            tasks: self.tasks.clone(),
            observer: Arc::clone(&self.observer),
        })
    }

    fn record(&self, record: HistoryRecord) {
        if let Some(sink) = self.history_sink() {
            sink.submit(record);
        }
    }
}

impl std::fmt::Debug for RequestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("config", &self.config)
            .field("module", &self.module)
            .field("history", &self.history)
            .finish()
    }
}

/// Writes records off the request path.
#[derive(Clone)]
struct HistorySink {
    store: HistoryStore,
    tasks: TaskTracker,
    observer: Arc<dyn PipelineObserver>,
}

impl HistorySink {
    fn submit(self, record: HistoryRecord) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let tasks = self.tasks.clone();
                tasks.spawn_blocking_on(move || self.write(record), &handle);
            }
            Err(_) => self.write(record),
        }
    }

    fn write(&self, record: HistoryRecord) {
        match self.store.append(&record) {
            Ok(path) => tracing::debug!(path = %path.display(), "call recorded"),
            Err(error) => self.observer.observe(&PipelineEvent::HistoryFailed {
                function: &record.function,
                error: &error,
            }),
        }
    }
}

/// A result is a failure when it is a mapping with an `error` key.
pub fn is_success(result: &Value) -> bool {
    !matches!(result, Value::Object(map) if map.contains_key("error"))
}
