//! Fragment definitions.
//!
//! A fragment is an independently rendered micro-frontend. The gateway only
//! needs its id, a way to fetch its HTML, and a handful of optional hooks;
//! everything else (frameworks, rendering) lives upstream.

use async_trait::async_trait;
use http::header::HeaderMap;
use http::{Method, StatusCode};
use log::debug;
use regex::Regex;

use crate::error::{GatewayError, GwResult};
use crate::stream::ByteStream;

/// The request view handed to fragment hooks: enough to route, filter, and
/// forward, without dragging a body along.
#[derive(Clone, Debug)]
pub struct FragmentRequest {
    pub method: Method,
    /// Path only, no query.
    pub path: String,
    /// Raw query string, without the `?`.
    pub query: String,
    pub headers: HeaderMap,
}

impl FragmentRequest {
    pub fn new(method: Method, path: &str, query: &str, headers: HeaderMap) -> Self {
        FragmentRequest {
            method,
            path: path.to_string(),
            query: query.to_string(),
            headers,
        }
    }

    /// Path plus query, as sent upstream.
    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }
}

/// An upstream response: status, headers, and a lazily consumed body.
pub struct FragmentResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl FragmentResponse {
    pub fn html(body: ByteStream) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("text/html; charset=utf-8"),
        );
        FragmentResponse { status: StatusCode::OK, headers, body }
    }
}

/// One registered micro-frontend.
#[async_trait]
pub trait Fragment: Send + Sync {
    /// Unique id; also the routing segment for SSR and asset paths.
    fn id(&self) -> &str;

    /// Fetches the fragment's rendered HTML from its upstream.
    async fn fetch_fragment(&self, request: FragmentRequest) -> GwResult<FragmentResponse>;

    /// Rewrites the child request before the fetch. The gateway re-applies
    /// the message-bus header afterwards, so this hook cannot lose it.
    fn transform_request(&self, request: FragmentRequest) -> FragmentRequest {
        request
    }

    /// Gates inclusion per request (feature flags, auth, ...).
    fn should_be_included(&self, _request: &FragmentRequest) -> bool {
        true
    }

    /// Serves the fragment's static assets; `None` means 404.
    async fn serve_assets(&self, _request: FragmentRequest) -> GwResult<Option<FragmentResponse>> {
        Ok(None)
    }

    /// Glob patterns for routes that get this fragment pre-pierced into the
    /// shell (`*` matches any run, `?` a single character).
    fn pre_pierce_routes(&self) -> Vec<String> {
        Vec::new()
    }

    /// CSS injected into the fragment host wrapper to avoid a flash of
    /// unstyled content before the client runtime adopts the element.
    fn pre_piercing_styles(&self) -> &str {
        ""
    }
}

/// Compiles a route glob (`/todos/*`) into an anchored regex.
pub(crate) fn glob_to_regex(glob: &str) -> Option<Regex> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            c if regex_syntax_meta(c) => {
                pattern.push('\\');
                pattern.push(c);
            }
            c => pattern.push(c),
        }
    }
    pattern.push('$');
    match Regex::new(&pattern) {
        Ok(re) => Some(re),
        Err(err) => {
            debug!("unusable route glob {:?}: {}", glob, err);
            None
        }
    }
}

fn regex_syntax_meta(c: char) -> bool {
    matches!(
        c,
        '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\'
    )
}

/// True when any of the fragment's route globs matches `path`.
pub(crate) fn routes_match(fragment: &dyn Fragment, path: &str) -> bool {
    fragment
        .pre_pierce_routes()
        .iter()
        .filter_map(|glob| glob_to_regex(glob))
        .any(|re| re.is_match(path))
}

/// A fragment backed by a plain HTTP upstream: SSR requests and asset
/// requests both proxy to `upstream`, preserving headers.
pub struct HttpFragment {
    pub id: String,
    /// Base URL of the upstream renderer, no trailing slash.
    pub upstream: String,
    pub routes: Vec<String>,
    pub styles: String,
    client: reqwest::Client,
}

impl HttpFragment {
    pub fn new(id: &str, upstream: &str, routes: Vec<String>, styles: &str) -> Self {
        HttpFragment {
            id: id.to_string(),
            upstream: upstream.trim_end_matches('/').to_string(),
            routes,
            styles: styles.to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn proxy(&self, request: FragmentRequest) -> GwResult<FragmentResponse> {
        let url = format!("{}{}", self.upstream, request.path_and_query());
        let mut upstream = self.client.request(request.method.clone(), &url);
        for (name, value) in request.headers.iter() {
            upstream = upstream.header(name, value);
        }
        let response = upstream
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(format!("{}: {}", url, e)))?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let mut headers = HeaderMap::new();
        for (name, value) in response.headers().iter() {
            if let (Ok(name), Ok(value)) = (
                http::header::HeaderName::from_bytes(name.as_str().as_bytes()),
                http::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.insert(name, value);
            }
        }
        let body: ByteStream = Box::pin(futures::TryStreamExt::map_err(
            response.bytes_stream(),
            |e| std::io::Error::new(std::io::ErrorKind::Other, e),
        ));
        Ok(FragmentResponse { status, headers, body })
    }
}

#[async_trait]
impl Fragment for HttpFragment {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch_fragment(&self, request: FragmentRequest) -> GwResult<FragmentResponse> {
        self.proxy(request).await
    }

    async fn serve_assets(&self, request: FragmentRequest) -> GwResult<Option<FragmentResponse>> {
        Ok(Some(self.proxy(request).await?))
    }

    fn pre_pierce_routes(&self) -> Vec<String> {
        self.routes.clone()
    }

    fn pre_piercing_styles(&self) -> &str {
        &self.styles
    }
}
