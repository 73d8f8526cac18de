//! End-to-end tests of the request pipeline: authentication, freshness,
//! access delegation, invocation and signed results.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use commune_server::access::{
    AccessConfig, AccessControl, AccessDecision, AccessPolicy, AccessRequest,
};
use commune_server::client::{open_response, CallBuilder};
use commune_server::history::HistoryStore;
use commune_server::identity::{Keypair, ServerIdentity, SignedPayload};
use commune_server::module::builtin::default_module;
use commune_server::module::{InvocationError, ServedModule};
use commune_server::pipeline::{
    Envelope, PipelineConfig, PipelineError, PipelineResponse, RequestPipeline,
};
use serde_json::{json, Value};
use tempfile::TempDir;

fn identity() -> Arc<ServerIdentity> {
    Arc::new(ServerIdentity::new(
        Keypair::generate(),
        "test",
        "127.0.0.1",
        8888,
    ))
}

fn counted_module(counter: Arc<AtomicUsize>) -> ServedModule {
    default_module("test").blocking("counted", move |call| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(json!(call.args))
    })
}

fn pipeline(config: PipelineConfig, module: ServedModule) -> RequestPipeline {
    RequestPipeline::new(config, identity(), Arc::new(module))
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn expect_signed(response: PipelineResponse) -> SignedPayload {
    match response {
        PipelineResponse::Signed(payload) => payload,
        other => panic!("expected signed response, got {}", other.status()),
    }
}

fn open(pipeline: &RequestPipeline, response: PipelineResponse) -> Value {
    let payload = expect_signed(response);
    open_response(&payload, &pipeline.identity().key_address()).unwrap()
}

struct DenyAll;

#[async_trait]
impl AccessControl for DenyAll {
    async fn verify(&self, request: &AccessRequest<'_>) -> AccessDecision {
        AccessDecision::deny("quota exhausted")
            .with("caller", request.caller())
            .with("remaining", 0)
    }
}

#[tokio::test]
async fn test_signed_echo_round_trip() {
    let caller = Keypair::generate();
    let pipeline = pipeline(PipelineConfig::default(), default_module("test"));

    let envelope = CallBuilder::new().arg(1).arg(2).sign(&caller);
    let result = open(&pipeline, pipeline.handle("echo", envelope).await);

    assert_eq!(result, json!({"args": [1, 2], "kwargs": {}}));
}

#[tokio::test]
async fn test_raw_fields_are_repackaged() {
    let caller = Keypair::generate();
    let pipeline = pipeline(PipelineConfig::default(), default_module("test"));

    let envelope = CallBuilder::new()
        .arg(2)
        .kwarg("b", 3)
        .sign_raw(&caller);
    assert!(envelope.data.is_none());
    let result = open(&pipeline, pipeline.handle("add", envelope).await);

    assert_eq!(result, json!(5.0));
}

#[tokio::test]
async fn test_stale_call_never_invoked() {
    let counter = Arc::new(AtomicUsize::new(0));
    let pipeline = pipeline(
        PipelineConfig {
            max_staleness: Duration::from_secs(60),
            ..Default::default()
        },
        counted_module(Arc::clone(&counter)),
    );
    let caller = Keypair::generate();

    let envelope = CallBuilder::new()
        .arg(1)
        .timestamp(now() - 3600)
        .sign(&caller);
    let response = pipeline.handle("counted", envelope).await;

    match response {
        PipelineResponse::Rejected(PipelineError::Stale { age, max }) => {
            assert!(age >= 3600);
            assert_eq!(max, 60);
        }
        other => panic!("expected staleness rejection, got {}", other.status()),
    }
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_stale_body_is_error_structure() {
    let pipeline = pipeline(PipelineConfig::default(), default_module("test"));
    let envelope = CallBuilder::new()
        .timestamp(now() - 3600)
        .sign(&Keypair::generate());

    let body = pipeline.handle("echo", envelope).await.body().unwrap();
    assert!(body["error"].as_str().unwrap().contains("too old"));
}

#[tokio::test]
async fn test_call_inside_window_is_accepted() {
    let counter = Arc::new(AtomicUsize::new(0));
    let pipeline = pipeline(PipelineConfig::default(), counted_module(Arc::clone(&counter)));

    let envelope = CallBuilder::new()
        .arg(1)
        .timestamp(now() - 30)
        .sign(&Keypair::generate());
    let result = open(&pipeline, pipeline.handle("counted", envelope).await);

    assert_eq!(result, json!([1]));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_tampered_envelope_rejected() {
    let counter = Arc::new(AtomicUsize::new(0));
    let pipeline = pipeline(PipelineConfig::default(), counted_module(Arc::clone(&counter)));
    let caller = Keypair::generate();

    let mut envelope = CallBuilder::new().arg(1).sign_raw(&caller);
    envelope.args = Some(json!([2]));
    let response = pipeline.handle("counted", envelope).await;

    assert!(matches!(
        response,
        PipelineResponse::Rejected(PipelineError::Integrity(_))
    ));
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_signature_rejected() {
    let pipeline = pipeline(PipelineConfig::default(), default_module("test"));
    let envelope = CallBuilder::new().arg(1).unsigned(&Keypair::generate().address());

    let body = pipeline.handle("echo", envelope).await.body().unwrap();
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("signature invalid"));
}

#[tokio::test]
async fn test_borrowed_address_rejected() {
    let pipeline = pipeline(PipelineConfig::default(), default_module("test"));
    let signer = Keypair::generate();
    let victim = Keypair::generate();

    let mut envelope = CallBuilder::new().arg(1).sign(&signer);
    envelope.address = victim.address();
    let response = pipeline.handle("echo", envelope).await;

    assert!(matches!(
        response,
        PipelineResponse::Rejected(PipelineError::Integrity(_))
    ));
}

#[tokio::test]
async fn test_public_mode_ignores_signatures() {
    let pipeline = pipeline(
        PipelineConfig {
            public: true,
            ..Default::default()
        },
        default_module("test"),
    );

    for signature in [None, Some("00".to_string()), Some("not hex".to_string())] {
        let envelope = Envelope {
            signature,
            ..CallBuilder::new().arg("hi").unsigned("anyone")
        };
        let result = open(&pipeline, pipeline.handle("echo", envelope).await);
        assert_eq!(result, json!({"args": ["hi"], "kwargs": {}}));
    }
}

/// Pipeline whose policy blacklists `counted` and names the server key as
/// admin.
fn admin_pipeline(public: bool, counter: Arc<AtomicUsize>) -> RequestPipeline {
    let identity = identity();
    let access = AccessPolicy::new(AccessConfig {
        blacklist: vec!["counted".into()],
        ..Default::default()
    })
    .with_admin(identity.key_address());
    RequestPipeline::new(
        PipelineConfig {
            public,
            ..Default::default()
        },
        identity,
        Arc::new(counted_module(counter)),
    )
    .with_access(Arc::new(access))
}

#[tokio::test]
async fn test_public_mode_grants_no_admin_to_claimed_server_key() {
    let counter = Arc::new(AtomicUsize::new(0));
    let pipeline = admin_pipeline(true, Arc::clone(&counter));
    let server_key = pipeline.identity().key_address();

    let envelope = CallBuilder::new().arg(1).unsigned(&server_key);
    let response = pipeline.handle("counted", envelope).await;

    let PipelineResponse::Denied(decision) = response else {
        panic!("expected denial");
    };
    assert!(decision.info["error"].as_str().unwrap().contains("blacklisted"));
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_server_key_signature_grants_admin() {
    let counter = Arc::new(AtomicUsize::new(0));
    let pipeline = admin_pipeline(false, Arc::clone(&counter));

    let envelope = CallBuilder::new()
        .arg(1)
        .sign(pipeline.identity().keypair());
    let result = open(&pipeline, pipeline.handle("counted", envelope).await);

    assert_eq!(result, json!([1]));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_denial_returned_verbatim() {
    let counter = Arc::new(AtomicUsize::new(0));
    let pipeline = pipeline(PipelineConfig::default(), counted_module(Arc::clone(&counter)))
        .with_access(Arc::new(DenyAll));
    let caller = Keypair::generate();

    let response = pipeline
        .handle("counted", CallBuilder::new().arg(1).sign(&caller))
        .await;

    let PipelineResponse::Denied(decision) = response else {
        panic!("expected denial");
    };
    let expected = AccessDecision::deny("quota exhausted")
        .with("caller", caller.address())
        .with("remaining", 0);
    assert_eq!(decision, expected);
    assert_eq!(
        decision.to_value(),
        json!({"success": false, "error": "quota exhausted", "caller": caller.address(), "remaining": 0})
    );
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_args_is_shape_error() {
    let counter = Arc::new(AtomicUsize::new(0));
    let pipeline = pipeline(PipelineConfig::default(), counted_module(Arc::clone(&counter)));
    let caller = Keypair::generate();

    let mut envelope = Envelope {
        kwargs: Some(json!({})),
        timestamp: Some(json!(now())),
        address: caller.address(),
        ..Default::default()
    };
    envelope.signature = Some(caller.sign(envelope.signed_message().as_bytes()));
    let response = pipeline.handle("counted", envelope).await;

    assert!(matches!(
        response,
        PipelineResponse::Rejected(PipelineError::Shape(_))
    ));
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_malformed_body_is_decode_error() {
    let pipeline = pipeline(PipelineConfig::default(), default_module("test"));
    let response = pipeline.handle_body("echo", b"{not json").await;
    assert!(matches!(
        response,
        PipelineResponse::Rejected(PipelineError::Decode(_))
    ));
}

#[tokio::test]
async fn test_unknown_function_is_failed_result() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(PipelineConfig::default(), default_module("test"))
        .with_history(HistoryStore::new(dir.path(), "test"));
    let caller = Keypair::generate();

    let result = open(
        &pipeline,
        pipeline
            .handle("missing", CallBuilder::new().sign(&caller))
            .await,
    );
    assert_eq!(result["success"], json!(false));
    assert_eq!(result["fn"], json!("missing"));
    assert!(result["error"].as_str().unwrap().contains("not found"));

    pipeline.flush_history().await;
    let records = pipeline.history().unwrap().list(None).unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].record.success);
    assert!(records.iter().all(|e| !e.record.success));
}

#[tokio::test]
async fn test_function_failure_is_signed_and_recorded() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(PipelineConfig::default(), default_module("test"))
        .with_history(HistoryStore::new(dir.path(), "test"));
    let caller = Keypair::generate();

    let result = open(
        &pipeline,
        pipeline
            .handle("fail", CallBuilder::new().arg("boom").sign(&caller))
            .await,
    );
    assert_eq!(result, json!({"success": false, "error": "boom", "fn": "fail"}));

    pipeline.flush_history().await;
    let records = pipeline
        .history()
        .unwrap()
        .list(Some(&caller.address()))
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].record.function, "fail");
    assert_eq!(records[0].record.args, vec![json!("boom")]);
    assert_eq!(records[0].record.result, result);
}

#[tokio::test]
async fn test_panicking_function_is_contained() {
    let module = ServedModule::new("test").blocking("explode", |_| -> Result<Value, InvocationError> {
        panic!("kaboom")
    });
    let pipeline = pipeline(PipelineConfig::default(), module);

    let result = open(
        &pipeline,
        pipeline
            .handle("explode", CallBuilder::new().sign(&Keypair::generate()))
            .await,
    );
    assert_eq!(result["success"], json!(false));
    assert!(result["error"].as_str().unwrap().contains("kaboom"));
}

#[tokio::test]
async fn test_plain_value_returned_as_is() {
    let module = ServedModule::new("test").value("motd", json!({"text": "hello"}));
    let pipeline = pipeline(PipelineConfig::default(), module);

    let result = open(
        &pipeline,
        pipeline
            .handle("motd", CallBuilder::new().sign(&Keypair::generate()))
            .await,
    );
    assert_eq!(result, json!({"text": "hello"}));
}

#[tokio::test]
async fn test_successful_call_records_decision_and_latency() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(PipelineConfig::default(), default_module("test"))
        .with_history(HistoryStore::new(dir.path(), "test"));
    let caller = Keypair::generate();
    let timestamp = now();

    pipeline
        .handle(
            "echo",
            CallBuilder::new()
                .arg(7)
                .kwarg("k", "v")
                .timestamp(timestamp)
                .sign(&caller),
        )
        .await;
    pipeline.flush_history().await;

    let entries = pipeline.history().unwrap().list(None).unwrap();
    assert_eq!(entries.len(), 1);
    let record = &entries[0].record;
    assert_eq!(record.module, "test");
    assert_eq!(record.address, caller.address());
    assert_eq!(record.timestamp, timestamp);
    assert_eq!(record.kwargs.get("k"), Some(&json!("v")));
    assert_eq!(record.user, json!({"success": true}));
    assert!(record.success);
    assert!(record.latency >= 0.0);
    assert!(entries[0]
        .path
        .starts_with(dir.path().join("test").join(caller.address())));
}

#[tokio::test]
async fn test_history_disabled_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(
        PipelineConfig {
            save_history: false,
            ..Default::default()
        },
        default_module("test"),
    )
    .with_history(HistoryStore::new(dir.path(), "test"));

    pipeline
        .handle("ping", CallBuilder::new().sign(&Keypair::generate()))
        .await;
    pipeline.flush_history().await;

    assert!(pipeline.history().is_none());
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn test_rejected_calls_leave_no_history() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(PipelineConfig::default(), default_module("test"))
        .with_history(HistoryStore::new(dir.path(), "test"))
        .with_access(Arc::new(DenyAll));
    let caller = Keypair::generate();

    pipeline
        .handle("echo", CallBuilder::new().sign(&caller))
        .await;
    pipeline
        .handle(
            "echo",
            CallBuilder::new().timestamp(now() - 3600).sign(&caller),
        )
        .await;
    pipeline.flush_history().await;

    assert!(pipeline.history().unwrap().list(None).unwrap().is_empty());
}
