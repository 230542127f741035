//! HTTP control-plane surface.
//!
//! Every `/api` request is classified and admitted before it reaches a
//! handler. Rejections answer `401 {"error":"unauthorized"}`; the internal
//! reason code only goes to the debug log.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::auth::whois::DEFAULT_WHOIS_CACHE_TTL;
use crate::auth::{
    AuthMethod, CachedWhois, ConfigError, Credentials, ReasonCode, RequestFacts,
    ResolvedAuthPolicy, TailscaleCliWhois, WhoisLookup, assert_configured, authorize,
    resolve_auth_policy, should_trust_localhost,
};
use crate::config::GatewayConfig;
use crate::ratelimit::LimiterRegistry;
use crate::types::UserLogin;

/// Shared state for the gateway routes.
#[derive(Clone)]
pub struct GatewayState {
    policy: Arc<ResolvedAuthPolicy>,
    trusted_proxies: Arc<[IpAddr]>,
    whois: Arc<dyn WhoisLookup>,
    limiters: Arc<LimiterRegistry>,
}

impl GatewayState {
    pub fn new(
        policy: ResolvedAuthPolicy,
        trusted_proxies: Vec<IpAddr>,
        whois: Arc<dyn WhoisLookup>,
        limiters: Arc<LimiterRegistry>,
    ) -> Self {
        Self {
            policy: Arc::new(policy),
            trusted_proxies: trusted_proxies.into(),
            whois,
            limiters,
        }
    }

    /// Resolve the auth policy and refuse to build state for a gateway no
    /// client could connect to.
    pub fn from_config(
        config: &GatewayConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let policy = resolve_auth_policy(
            &config.gateway.auth,
            config.gateway.tailscale.mode,
            env,
        );
        assert_configured(&policy)?;

        let whois = CachedWhois::new(TailscaleCliWhois::default(), DEFAULT_WHOIS_CACHE_TTL);

        Ok(Self::new(
            policy,
            config.gateway.trusted_proxies.clone(),
            Arc::new(whois),
            Arc::new(LimiterRegistry::new(config.rate_limits.clone())),
        ))
    }

    pub fn policy(&self) -> &ResolvedAuthPolicy {
        &self.policy
    }

    pub fn limiters(&self) -> &Arc<LimiterRegistry> {
        &self.limiters
    }
}

/// How a session got in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOrigin {
    Token,
    Password,
    Tailscale,
    TrustedLocalhost,
}

impl From<AuthMethod> for SessionOrigin {
    fn from(method: AuthMethod) -> Self {
        match method {
            AuthMethod::Token => Self::Token,
            AuthMethod::Password => Self::Password,
            AuthMethod::Tailscale => Self::Tailscale,
        }
    }
}

/// Admitted caller, attached to the request for handlers and audit logs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSession {
    pub origin: SessionOrigin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserLogin>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<IpAddr>,
}

fn bearer_credentials(headers: &HeaderMap) -> Credentials {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        })
        .filter(|v| !v.trim().is_empty())
        .map(Credentials::shared)
        .unwrap_or_else(Credentials::none)
}

/// Classify a request and decide whether it may proceed.
pub async fn admit(
    state: &GatewayState,
    peer: Option<SocketAddr>,
    headers: &HeaderMap,
) -> Result<AuthSession, ReasonCode> {
    let facts = RequestFacts::classify(peer, headers, &state.trusted_proxies);

    if should_trust_localhost(&state.policy, &facts) {
        debug!("Trusted local request from {:?}", facts.client_ip());
        return Ok(AuthSession {
            origin: SessionOrigin::TrustedLocalhost,
            user: None,
            client_ip: facts.client_ip(),
        });
    }

    let credentials = bearer_credentials(headers);
    let decision = authorize(&state.policy, &facts, &credentials, state.whois.as_ref()).await;

    match decision.method() {
        Some(method) if decision.ok() => Ok(AuthSession {
            origin: method.into(),
            user: decision.user().cloned(),
            client_ip: facts.client_ip(),
        }),
        _ => Err(decision.reason().unwrap_or(ReasonCode::Unauthorized)),
    }
}

async fn require_admission(
    State(state): State<GatewayState>,
    mut request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    match admit(&state, peer, request.headers()).await {
        Ok(session) => {
            request.extensions_mut().insert(session);
            next.run(request).await
        }
        Err(reason) => {
            debug!(
                "Rejected {} {} from {:?}: {}",
                request.method(),
                request.uri().path(),
                peer,
                reason
            );
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": reason.public_message() })),
            )
                .into_response()
        }
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn session_info(Extension(session): Extension<AuthSession>) -> Json<AuthSession> {
    Json(session)
}

async fn list_limits(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "aggregated": state.limiters.aggregated_metrics(),
        "limiters": state.limiters.snapshots(),
    }))
}

pub fn create_router(state: GatewayState) -> Router {
    let protected = Router::new()
        .route("/api/session", get(session_info))
        .route("/api/limits", get(list_limits))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_admission,
        ));

    Router::new()
        .route("/health", get(health_check))
        .merge(protected)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Could not install Ctrl-C handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

/// Serve the gateway on `bind` until Ctrl-C.
pub async fn start_gateway(state: GatewayState, bind: &str) -> anyhow::Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;

    info!("Gateway listening on http://{}", bind);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}
