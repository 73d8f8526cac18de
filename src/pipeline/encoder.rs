//! Result encoding: one signed payload, or a stream of text chunks.
//!
//! Each streamed item is encoded as `{"data": item}` and cut into pieces of
//! at most `chunk_size` bytes. Cuts fall on UTF-8 character boundaries, and
//! concatenating the pieces of one item gives back its encoding.

use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{BoxStream, Stream, StreamExt};
use serde_json::{json, Value};

use super::error::PipelineError;
use crate::identity::{ServerIdentity, SignedPayload};
use crate::module::{panic_message, InvocationError, Output};
use crate::serializer::Serializer;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// How a stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEnd {
    /// Items pulled from the sequence.
    pub items: u64,
    /// Chunks handed to the transport.
    pub chunks: u64,
    /// False when the stream was dropped before the sequence ended.
    pub completed: bool,
    /// Set when an item could not be produced or encoded; the stream stops
    /// there.
    pub error: Option<String>,
}

type EndHook = Box<dyn FnOnce(StreamEnd) + Send>;

/// Lazy stream of encoded chunks over a result sequence.
///
/// Pulls one item at a time, so a slow consumer slows the sequence down.
/// Dropping the stream stops the sequence; the end hook then reports
/// `completed: false`. A panic inside the sequence ends the stream with an
/// `{"error": ...}` chunk.
pub struct ChunkStream {
    items: BoxStream<'static, std::thread::Result<Value>>,
    serializer: Arc<dyn Serializer>,
    chunk_size: usize,
    pending: VecDeque<String>,
    items_seen: u64,
    chunks_sent: u64,
    exhausted: bool,
    error: Option<String>,
    on_end: Option<EndHook>,
}

impl ChunkStream {
    pub fn new(
        items: BoxStream<'static, Value>,
        serializer: Arc<dyn Serializer>,
        chunk_size: usize,
    ) -> Self {
        Self {
            items: AssertUnwindSafe(items).catch_unwind().boxed(),
            serializer,
            chunk_size: chunk_size.max(1),
            pending: VecDeque::new(),
            items_seen: 0,
            chunks_sent: 0,
            exhausted: false,
            error: None,
            on_end: None,
        }
    }

    /// Run `hook` once, when the stream ends or is dropped.
    pub fn on_end(mut self, hook: impl FnOnce(StreamEnd) + Send + 'static) -> Self {
        self.on_end = Some(Box::new(hook));
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Queue a terminal error chunk and stop pulling items.
    fn fail(&mut self, error: String) {
        let text = json!({ "error": error }).to_string();
        self.pending.extend(split_chunks(&text, self.chunk_size));
        self.error = Some(error);
        self.exhausted = true;
    }

    fn finish(&mut self, completed: bool) {
        if let Some(hook) = self.on_end.take() {
            hook(StreamEnd {
                items: self.items_seen,
                chunks: self.chunks_sent,
                completed,
                error: self.error.clone(),
            });
        }
    }
}

impl Stream for ChunkStream {
    type Item = String;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        let this = self.get_mut();
        loop {
            if let Some(chunk) = this.pending.pop_front() {
                this.chunks_sent += 1;
                return Poll::Ready(Some(chunk));
            }
            if this.exhausted {
                this.finish(true);
                return Poll::Ready(None);
            }
            match this.items.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => this.exhausted = true,
                Poll::Ready(Some(Err(panic))) => {
                    let error = InvocationError::Panicked(panic_message(panic.as_ref()));
                    tracing::warn!(error = %error, item = this.items_seen + 1, "sequence panicked");
                    this.fail(error.to_string());
                }
                Poll::Ready(Some(Ok(item))) => {
                    this.items_seen += 1;
                    match this.serializer.serialize(&json!({ "data": item })) {
                        Ok(text) => this.pending.extend(split_chunks(&text, this.chunk_size)),
                        Err(e) => {
                            tracing::warn!(error = %e, item = this.items_seen, "failed to encode streamed item");
                            this.fail(e.to_string());
                        }
                    }
                }
            }
        }
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        self.finish(false);
    }
}

impl fmt::Debug for ChunkStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkStream")
            .field("chunk_size", &self.chunk_size)
            .field("items_seen", &self.items_seen)
            .field("chunks_sent", &self.chunks_sent)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

/// Cut `text` into pieces of at most `chunk_size` bytes.
///
/// A piece only exceeds `chunk_size` when a single character is wider than
/// the limit.
pub fn split_chunks(text: &str, chunk_size: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    if text.len() <= chunk_size {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::with_capacity(text.len() / chunk_size + 1);
    let mut start = 0;
    while start < text.len() {
        let mut end = (start + chunk_size).min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            end = start + 1;
            while !text.is_char_boundary(end) {
                end += 1;
            }
        }
        chunks.push(text[start..end].to_string());
        start = end;
    }
    chunks
}

/// Collect a whole sequence into a JSON array, within `timeout`.
///
/// A panic inside the sequence stops collection and is returned as
/// [`InvocationError::Panicked`].
pub async fn drain(
    items: BoxStream<'static, Value>,
    timeout: Duration,
) -> Result<Value, InvocationError> {
    let collect = async move {
        let mut items = AssertUnwindSafe(items).catch_unwind();
        let mut values = Vec::new();
        while let Some(item) = items.next().await {
            let value = item
                .map_err(|panic| InvocationError::Panicked(panic_message(panic.as_ref())))?;
            values.push(value);
        }
        Ok::<_, InvocationError>(Value::Array(values))
    };
    tokio::time::timeout(timeout, collect)
        .await
        .map_err(|_| InvocationError::TimedOut(timeout))?
}

/// An encoded result, ready for the transport.
#[derive(Debug)]
pub enum EncodedResponse {
    Signed(SignedPayload),
    Stream(ChunkStream),
}

/// Signs single results and builds chunk streams, using the server key.
#[derive(Clone)]
pub struct ResultEncoder {
    serializer: Arc<dyn Serializer>,
    identity: Arc<ServerIdentity>,
    chunk_size: usize,
}

impl ResultEncoder {
    pub fn new(
        serializer: Arc<dyn Serializer>,
        identity: Arc<ServerIdentity>,
        chunk_size: usize,
    ) -> Self {
        Self {
            serializer,
            identity,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Sign a value, or wrap a sequence as a chunk stream.
    pub fn encode(&self, output: Output) -> Result<EncodedResponse, PipelineError> {
        match output {
            Output::Value(result) => self.sign(&result).map(EncodedResponse::Signed),
            Output::Sequence(items) => Ok(EncodedResponse::Stream(self.stream(items))),
        }
    }

    /// Serialize `result` and sign it with the server key.
    pub fn sign(&self, result: &Value) -> Result<SignedPayload, PipelineError> {
        let data = self.serializer.serialize(result)?;
        Ok(self.identity.keypair().sign_payload(data))
    }

    pub fn stream(&self, items: BoxStream<'static, Value>) -> ChunkStream {
        ChunkStream::new(items, Arc::clone(&self.serializer), self.chunk_size)
    }
}

impl fmt::Debug for ResultEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultEncoder")
            .field("chunk_size", &self.chunk_size)
            .field("key", &self.identity.key_address())
            .finish()
    }
}
