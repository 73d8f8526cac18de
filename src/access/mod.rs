//! Access decisions for inbound calls.
//!
//! The pipeline asks an [`AccessControl`] implementation whether a caller
//! may invoke a function. A denial is a value, not an error: the decision
//! itself is returned to the caller.

mod rate_limit;

pub use rate_limit::{RateLimitConfig, RateLimited, RateLimiter};

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::pipeline::DecodedCall;

/// What the access collaborator sees: `{fn, data}`.
#[derive(Debug, Clone, Copy)]
pub struct AccessRequest<'a> {
    pub function: &'a str,
    pub call: &'a DecodedCall,
    /// The caller's signature was verified. An unauthenticated address is a
    /// claim and must not carry privilege.
    pub authenticated: bool,
}

impl<'a> AccessRequest<'a> {
    /// An unauthenticated request.
    pub fn new(function: &'a str, call: &'a DecodedCall) -> Self {
        Self {
            function,
            call,
            authenticated: false,
        }
    }

    pub fn authenticated(mut self, authenticated: bool) -> Self {
        self.authenticated = authenticated;
        self
    }

    pub fn caller(&self) -> &str {
        &self.call.address
    }

    pub fn to_value(&self) -> Value {
        json!({ "fn": self.function, "data": self.call })
    }
}

/// Outcome of an access check. Serialized flat: `{success, ...info}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub success: bool,
    #[serde(flatten)]
    pub info: Map<String, Value>,
}

impl AccessDecision {
    pub fn allow() -> Self {
        Self {
            success: true,
            info: Map::new(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        let mut info = Map::new();
        info.insert("error".into(), Value::String(reason.into()));
        Self {
            success: false,
            info,
        }
    }

    /// Attach an info field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.info.insert(key.to_string(), value.into());
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({ "success": self.success }))
    }
}

/// Decides whether a call may proceed. Must be safe for concurrent use.
#[async_trait]
pub trait AccessControl: Send + Sync {
    async fn verify(&self, request: &AccessRequest<'_>) -> AccessDecision;
}

/// Admits every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl AccessControl for AllowAll {
    async fn verify(&self, _request: &AccessRequest<'_>) -> AccessDecision {
        AccessDecision::allow()
    }
}

/// Function lists applied by [`AccessPolicy`].
#[derive(Debug, Clone, Default)]
pub struct AccessConfig {
    /// When non-empty, only these functions are callable.
    pub whitelist: Vec<String>,
    /// Never callable.
    pub blacklist: Vec<String>,
    pub rate_limit: RateLimitConfig,
}

/// Default access collaborator.
///
/// Order of checks: admin, blacklist, whitelist, rate limit.
pub struct AccessPolicy {
    admin: Option<String>,
    whitelist: HashSet<String>,
    helpers: HashSet<String>,
    blacklist: HashSet<String>,
    limiter: RateLimiter,
}

impl AccessPolicy {
    pub fn new(config: AccessConfig) -> Self {
        Self {
            admin: None,
            whitelist: config.whitelist.into_iter().collect(),
            helpers: HashSet::new(),
            blacklist: config.blacklist.into_iter().collect(),
            limiter: RateLimiter::new(config.rate_limit),
        }
    }

    /// Authenticated callers with this address bypass every check.
    pub fn with_admin(mut self, address: impl Into<String>) -> Self {
        self.admin = Some(address.into());
        self
    }

    /// Functions that pass the whitelist even when it does not name them.
    /// The blacklist and rate limit still apply.
    pub fn with_helpers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.helpers.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn whitelisted(&self, function: &str) -> bool {
        self.whitelist.is_empty()
            || self.whitelist.contains(function)
            || self.helpers.contains(function)
    }

    fn decide(&self, request: &AccessRequest<'_>) -> AccessDecision {
        let (function, caller) = (request.function, request.caller());
        if request.authenticated && self.admin.as_deref() == Some(caller) {
            return AccessDecision::allow().with("role", "admin");
        }
        if self.blacklist.contains(function) {
            return AccessDecision::deny(format!("function '{}' is blacklisted", function));
        }
        if !self.whitelisted(function) {
            return AccessDecision::deny(format!("function '{}' is not whitelisted", function));
        }

        let limit = self.limiter.config().max_requests;
        match self.limiter.check(caller) {
            Ok(rate) => AccessDecision::allow()
                .with("role", "user")
                .with("rate", rate)
                .with("rate_limit", limit),
            Err(RateLimited::Exceeded { rate, limit }) => {
                AccessDecision::deny(format!("rate limit exceeded ({}/{})", rate, limit))
                    .with("rate", rate)
                    .with("rate_limit", limit)
            }
            Err(RateLimited::TooManyCallers) => AccessDecision::deny("server is busy"),
        }
    }
}

#[async_trait]
impl AccessControl for AccessPolicy {
    async fn verify(&self, request: &AccessRequest<'_>) -> AccessDecision {
        self.decide(request)
    }
}
