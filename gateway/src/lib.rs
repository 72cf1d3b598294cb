//! Piercing gateway: a stateful HTTP middleware that pre-renders
//! independently fetched HTML fragments and stitches them into a shell
//! document, streaming the composite response.
//!
//! The registry of fragments is process-wide: populated at startup, read
//! concurrently by every request, torn down at shutdown. Shared message-bus
//! state travels in the `x-message-bus-state` header on every cross-boundary
//! hop and is seeded into the page as a global before any fragment runs.
//!
//! Three surfaces:
//! - `/piercing-fragment/:id` renders one fragment server-side, wrapped in
//!   its `<piercing-fragment-host>` element.
//! - `/_fragment/:id/*` proxies a fragment's static assets.
//! - every other HTML navigation may be augmented: fragments whose route
//!   globs match are fetched in parallel and injected before `</body>`,
//!   while the shell keeps streaming.

pub mod error;
pub mod fragment;
pub mod message_bus;
pub mod stream;

use std::sync::{Arc, RwLock};

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use http::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use http::{Method, StatusCode};
use log::warn;
use serde_json::Value;

use crate::error::{GatewayError, GwResult};
use crate::fragment::{routes_match, Fragment, FragmentRequest};
use crate::message_bus::{apply_state_header, state_from_headers, state_script};
use crate::stream::{concat, once_text, peek_nonempty, wrap_text, ByteStream};

/// Produces the shell document for a request.
#[async_trait::async_trait]
pub trait ShellProvider: Send + Sync {
    async fn shell_html(&self, request: &FragmentRequest) -> GwResult<String>;
}

/// A fixed shell, for simple deployments and tests.
pub struct StaticShell(pub String);

#[async_trait::async_trait]
impl ShellProvider for StaticShell {
    async fn shell_html(&self, _request: &FragmentRequest) -> GwResult<String> {
        Ok(self.0.clone())
    }
}

type StateHook = Box<dyn Fn(Value, &FragmentRequest) -> Value + Send + Sync>;
type EnableHook = Box<dyn Fn(&FragmentRequest) -> bool + Send + Sync>;

/// Gateway configuration beyond the hooks.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Module URL of the client runtime that registers the
    /// `piercing-fragment-host` custom element and the outlets.
    pub client_module_path: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig { client_module_path: "/_piercing/client.js".into() }
    }
}

/// The gateway itself. Cheap to share behind an `Arc`.
pub struct PiercingGateway {
    shell: Arc<dyn ShellProvider>,
    fragments: RwLock<Vec<Arc<dyn Fragment>>>,
    generate_state: Option<StateHook>,
    enabled: Option<EnableHook>,
    config: GatewayConfig,
}

impl PiercingGateway {
    pub fn new(shell: Arc<dyn ShellProvider>) -> Self {
        PiercingGateway {
            shell,
            fragments: RwLock::new(Vec::new()),
            generate_state: None,
            enabled: None,
            config: GatewayConfig::default(),
        }
    }

    pub fn with_config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Hook run over the request's message-bus state before piercing.
    pub fn with_state_hook(
        mut self,
        hook: impl Fn(Value, &FragmentRequest) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.generate_state = Some(Box::new(hook));
        self
    }

    /// Hook gating piercing per request (defaults to always on).
    pub fn with_enabled_hook(
        mut self,
        hook: impl Fn(&FragmentRequest) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.enabled = Some(Box::new(hook));
        self
    }

    /// Registers a fragment, replacing any previous one with the same id.
    pub fn register_fragment(&self, fragment: Arc<dyn Fragment>) {
        let mut fragments = self.fragments.write().expect("fragment registry poisoned");
        fragments.retain(|f| f.id() != fragment.id());
        fragments.push(fragment);
    }

    pub fn unregister_fragment(&self, id: &str) {
        let mut fragments = self.fragments.write().expect("fragment registry poisoned");
        fragments.retain(|f| f.id() != id);
    }

    pub fn fragment(&self, id: &str) -> Option<Arc<dyn Fragment>> {
        self.fragments
            .read()
            .expect("fragment registry poisoned")
            .iter()
            .find(|f| f.id() == id)
            .cloned()
    }

    fn has_fragments(&self) -> bool {
        !self.fragments.read().expect("fragment registry poisoned").is_empty()
    }

    fn piercing_enabled(&self, request: &FragmentRequest) -> bool {
        self.enabled.as_ref().map_or(true, |hook| hook(request))
    }

    /// Builds the child request for a fragment fetch: the optional
    /// `transform_request` hook runs first, then the state header is
    /// re-applied so it can never be dropped.
    fn child_request(
        fragment: &dyn Fragment,
        request: &FragmentRequest,
        state: &Value,
    ) -> FragmentRequest {
        let mut child = fragment.transform_request(request.clone());
        apply_state_header(&mut child.headers, state);
        child
    }

    /// Fetches one fragment body and wraps it in its host element. Fails on
    /// upstream errors and on empty bodies.
    async fn fetch_wrapped(
        &self,
        fragment: &Arc<dyn Fragment>,
        request: &FragmentRequest,
        state: &Value,
    ) -> GwResult<ByteStream> {
        let child = Self::child_request(fragment.as_ref(), request, state);
        let response = fragment.fetch_fragment(child).await?;
        let body = peek_nonempty(response.body)
            .await
            .map_err(|e| GatewayError::Upstream(e.to_string()))?
            .ok_or_else(|| GatewayError::EmptyBody(fragment.id().to_string()))?;

        let styles = fragment.pre_piercing_styles();
        let style_block = if styles.is_empty() {
            String::new()
        } else {
            format!("<style>{}</style>", styles)
        };
        Ok(wrap_text(
            format!(
                "<piercing-fragment-host fragment-id=\"{}\">{}",
                fragment.id(),
                style_block
            ),
            body,
            "</piercing-fragment-host>".into(),
        ))
    }

    /// Renders one fragment on demand (the `/piercing-fragment/:id` route).
    pub async fn render_fragment(
        &self,
        id: &str,
        request: &FragmentRequest,
    ) -> GwResult<Option<ByteStream>> {
        let Some(fragment) = self.fragment(id) else {
            return Ok(None);
        };
        if !fragment.should_be_included(request) {
            return Ok(None);
        }
        let state = state_from_headers(&request.headers);
        let wrapped = self.fetch_wrapped(&fragment, request, &state).await?;
        Ok(Some(wrapped))
    }

    /// Assembles the pierced shell response for an HTML navigation, or
    /// `None` when this request should pass through untouched.
    pub async fn pierce(&self, request: &FragmentRequest) -> GwResult<Option<ByteStream>> {
        if !self.has_fragments() || !self.piercing_enabled(request) {
            return Ok(None);
        }

        let mut state = state_from_headers(&request.headers);
        if let Some(hook) = &self.generate_state {
            state = hook(state, request);
        }

        let shell = self.shell.shell_html(request).await?;

        let selected: Vec<Arc<dyn Fragment>> = {
            let fragments = self.fragments.read().expect("fragment registry poisoned");
            fragments
                .iter()
                .filter(|f| routes_match(f.as_ref(), &request.path))
                .filter(|f| f.should_be_included(request))
                .cloned()
                .collect()
        };

        let fetches = selected
            .iter()
            .map(|fragment| self.fetch_wrapped(fragment, request, &state));
        let mut bodies = Vec::new();
        for (fragment, result) in selected.iter().zip(futures::future::join_all(fetches).await) {
            match result {
                Ok(body) => bodies.push(body),
                Err(err) => warn!("skipping pre-pierce fragment {}: {}", fragment.id(), err),
            }
        }

        let head_scripts = format!(
            "{}<script type=\"module\" src=\"{}\"></script>",
            state_script(&state),
            self.config.client_module_path
        );
        let shell = inject_into_head(&shell, &head_scripts);

        // Keep the output streaming: emit everything before </body>, then
        // the fragments, then the rest.
        let (pre, post) = match shell.find("</body>") {
            Some(pos) => (shell[..pos].to_string(), shell[pos..].to_string()),
            None => (shell, String::new()),
        };
        let mut parts = Vec::with_capacity(bodies.len() + 2);
        parts.push(once_text(pre));
        parts.extend(bodies);
        parts.push(once_text(post));
        Ok(Some(concat(parts)))
    }
}

/// Inserts `scripts` before `</head>`, falling back to just after the
/// opening `<body>` tag, then to prepending.
fn inject_into_head(shell: &str, scripts: &str) -> String {
    if let Some(pos) = shell.find("</head>") {
        let mut out = String::with_capacity(shell.len() + scripts.len());
        out.push_str(&shell[..pos]);
        out.push_str(scripts);
        out.push_str(&shell[pos..]);
        return out;
    }
    if let Some(open) = shell.find("<body") {
        if let Some(end) = shell[open..].find('>') {
            let pos = open + end + 1;
            let mut out = String::with_capacity(shell.len() + scripts.len());
            out.push_str(&shell[..pos]);
            out.push_str(scripts);
            out.push_str(&shell[pos..]);
            return out;
        }
    }
    format!("{}{}", scripts, shell)
}

fn fragment_request_from(req: &Request) -> FragmentRequest {
    FragmentRequest::new(
        req.method().clone(),
        req.uri().path(),
        req.uri().query().unwrap_or(""),
        req.headers().clone(),
    )
}

fn html_stream_response(body: ByteStream) -> Response {
    (
        [(CONTENT_TYPE, "text/html; charset=utf-8")],
        Body::from_stream(body),
    )
        .into_response()
}

async fn ssr_handler(
    State(gateway): State<Arc<PiercingGateway>>,
    Path(id): Path<String>,
    req: Request,
) -> Response {
    let request = fragment_request_from(&req);
    match gateway.render_fragment(&id, &request).await {
        Ok(Some(body)) => html_stream_response(body),
        Ok(None) => (StatusCode::NOT_FOUND, format!("unknown fragment {}", id)).into_response(),
        Err(err) => {
            warn!("fragment {} ssr failed: {}", id, err);
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

async fn asset_handler(
    State(gateway): State<Arc<PiercingGateway>>,
    Path((id, rest)): Path<(String, String)>,
    req: Request,
) -> Response {
    let Some(fragment) = gateway.fragment(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    // Rewrite the URL to the path remainder before handing it upstream.
    let request = FragmentRequest::new(
        req.method().clone(),
        &format!("/{}", rest),
        req.uri().query().unwrap_or(""),
        req.headers().clone(),
    );
    match fragment.serve_assets(request).await {
        Ok(Some(response)) => {
            let mut out = Response::builder().status(response.status);
            if let Some(headers) = out.headers_mut() {
                headers.extend(response.headers);
            }
            out.body(Body::from_stream(response.body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            warn!("fragment {} asset fetch failed: {}", id, err);
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

fn accepts_html(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("text/html"))
        .unwrap_or(false)
}

async fn pierce_middleware(
    State(gateway): State<Arc<PiercingGateway>>,
    req: Request,
    next: Next,
) -> Response {
    if req.method() != Method::GET || !accepts_html(req.headers()) {
        return next.run(req).await;
    }
    let request = fragment_request_from(&req);
    match gateway.pierce(&request).await {
        Ok(Some(body)) => html_stream_response(body),
        Ok(None) => next.run(req).await,
        Err(err) => {
            warn!("piercing failed for {}: {}", request.path, err);
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

/// Mounts the gateway: its two fragment routes plus the piercing middleware
/// wrapped around `app`'s HTML routes.
pub fn attach(gateway: Arc<PiercingGateway>, app: Router) -> Router {
    let fragment_routes = Router::new()
        .route("/piercing-fragment/:id", get(ssr_handler))
        .route("/_fragment/:id/*path", any(asset_handler))
        .with_state(gateway.clone());
    fragment_routes.merge(
        app.layer(axum::middleware::from_fn_with_state(gateway, pierce_middleware)),
    )
}
