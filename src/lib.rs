//! commune-server
//!
//! Serves a module of named functions over HTTP. Every call is checked
//! for a valid caller signature and a fresh timestamp, authorized by an
//! access collaborator, invoked, answered with a server-signed result (or a
//! chunk stream for sequences), and recorded in a write-once history.
//!
//! # Security Boundaries
//!
//! - Callers are identified by their ed25519 public key (hex address).
//! - Envelopes older than the freshness window are rejected.
//! - Responses are signed by the server key; streamed chunks are not.
//! - History paths are built from sanitized components only.

pub mod access;
pub mod cli;
pub mod client;
pub mod config;
pub mod history;
pub mod http;
pub mod identity;
pub mod module;
pub mod pipeline;
pub mod serializer;
pub mod shutdown;
pub mod telemetry;

use std::sync::Arc;

use axum::Router;
use serde_json::Value;
use tokio::net::TcpListener;

use access::AccessPolicy;
use config::{ConfigError, EnvConfig};
use history::HistoryStore;
use http::{AppState, ServeError};
use identity::ServerIdentity;
use module::ServedModule;
use pipeline::RequestPipeline;
use shutdown::{ShutdownCoordinator, ShutdownResult};

/// Values registered on every served module.
pub const HELPERS: [&str; 2] = ["info", "schema"];

/// A configured server: identity, pipeline and shutdown coordination.
pub struct Server {
    config: EnvConfig,
    pipeline: Arc<RequestPipeline>,
    shutdown: ShutdownCoordinator,
}

impl Server {
    /// Assemble a server for `module` from `config`.
    ///
    /// Registers the `info` and `schema` helper values on the module, keeps
    /// them callable under any whitelist, and admits callers signing with
    /// the server's own key as admin.
    pub fn new(config: EnvConfig, module: ServedModule) -> Result<Self, ConfigError> {
        let keypair = config.keypair()?;
        let identity = Arc::new(ServerIdentity::new(
            keypair,
            config.name.clone(),
            &config.ip,
            config.port,
        ));
        let module = with_helpers(module, &identity);

        let access = AccessPolicy::new(config.access.clone())
            .with_admin(identity.key_address())
            .with_helpers(HELPERS);
        let pipeline = RequestPipeline::new(config.pipeline.clone(), identity, Arc::new(module))
            .with_access(Arc::new(access))
            .with_history(HistoryStore::new(&config.history_path, &config.name));

        Ok(Self {
            config,
            pipeline: Arc::new(pipeline),
            shutdown: ShutdownCoordinator::new(),
        })
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Arc<RequestPipeline> {
        &self.pipeline
    }

    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    pub fn router(&self) -> Router {
        http::router(
            AppState {
                pipeline: Arc::clone(&self.pipeline),
                shutdown: self.shutdown.clone(),
            },
            self.config.max_body,
        )
    }

    /// Bind the configured address and serve until Ctrl+C.
    pub async fn run(self) -> Result<ShutdownResult, ServeError> {
        let listener = http::bind(&self.config.bind_address()).await?;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                shutdown.begin();
            }
        });
        self.run_on(listener).await
    }

    /// Serve on `listener` until shutdown is requested, then drain in-flight
    /// calls and pending history writes.
    pub async fn run_on(self, listener: TcpListener) -> Result<ShutdownResult, ServeError> {
        tracing::info!(
            name = %self.config.name,
            key = %self.pipeline.identity().key_address(),
            public = self.config.pipeline.public,
            "server starting"
        );
        http::serve(listener, self.router(), self.shutdown.clone()).await?;

        let result = self.shutdown.initiate(self.config.shutdown_timeout).await;
        if let ShutdownResult::Timeout { remaining } = &result {
            tracing::warn!(remaining, "shutdown timed out with calls in flight");
        }
        self.pipeline.flush_history().await;
        tracing::info!("server stopped");
        Ok(result)
    }
}

/// Register the `info` and `schema` helper values.
fn with_helpers(mut module: ServedModule, identity: &ServerIdentity) -> ServedModule {
    let mut info = identity.state();
    info["module"] = Value::String(module.name().to_string());
    module.insert_value("info", info);

    let mut schema = module.schema();
    schema["schema"] = Value::from("value");
    module.insert_value("schema", schema);
    module
}
