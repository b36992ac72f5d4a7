//! HTTP surface for a rivet site
//!
//! Architecture:
//! - axum on a multi-threaded Tokio runtime accepts connections
//! - every request goes through one fallback handler that matches the route table
//! - script routes are dispatched onto pooled engines, template routes are
//!   rendered directly
//! - Ctrl-C stops accepting connections, then stops every pooled engine

mod config;
mod routes;

pub use config::{ConfigError, ServerConfig};
pub use routes::{RouteMatch, RouteTable};

use crate::dispatch::{Dispatcher, session_id};
use crate::fs::{FsError, OsFs, VirtualFs};
use crate::pool::PoolRegistry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

pub use axum::{
    Router,
    body::Body,
    extract::Request,
    response::{IntoResponse, Response},
};
use axum::extract::{ConnectInfo, State};

/// Errors that can occur with the HTTP server
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Server failed to start: {0}")]
    StartError(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to load site: {0}")]
    Site(#[from] FsError),
}

/// Result type for server operations
pub type ServerResult<T> = Result<T, ServerError>;

/// Information about an incoming HTTP request
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    /// HTTP method (GET, POST, etc.)
    pub method: String,
    /// Path with query string
    pub url: String,
    pub path: String,
    /// Raw query string without the `?`
    pub query: String,
    /// Request headers, lowercased names
    pub headers: HashMap<String, String>,
    /// Parameters bound by dynamic route segments
    pub params: HashMap<String, String>,
    /// Request body (if any)
    pub body: Option<Vec<u8>>,
    /// Client IP address
    pub remote_addr: Option<String>,
}

impl RequestInfo {
    /// Get a header value by name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        let name_lower = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_lowercase() == name_lower)
            .map(|(_, v)| v.as_str())
    }

    /// Get the request body as a string
    pub fn text(&self) -> Option<String> {
        self.body.as_ref().map(|b| String::from_utf8_lossy(b).to_string())
    }
}

/// Builder for HTTP responses
#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl ResponseBuilder {
    pub fn new() -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.headers
            .insert("content-type".to_string(), "text/plain; charset=utf-8".to_string());
        self.body = text.into().into_bytes();
        self
    }
}

impl Default for ResponseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl IntoResponse for ResponseBuilder {
    fn into_response(self) -> Response {
        let mut response = Response::builder().status(self.status);

        for (name, value) in self.headers {
            response = response.header(name, value);
        }

        match response.body(Body::from(self.body)) {
            Ok(response) => response,
            Err(err) => {
                tracing::error!("invalid response: {err}");
                let mut fallback = Response::new(Body::from("Internal Server Error"));
                *fallback.status_mut() = axum::http::StatusCode::INTERNAL_SERVER_ERROR;
                fallback
            }
        }
    }
}

/// Shared state of the fallback handler
#[derive(Clone)]
struct AppState {
    routes: Arc<RouteTable>,
    dispatcher: Arc<Dispatcher>,
    max_body_size: usize,
}

impl AppState {
    /// Route and dispatch one request
    async fn respond(&self, mut request: RequestInfo) -> ResponseBuilder {
        let Some(matched) = self.routes.match_path(&request.path) else {
            return ResponseBuilder::new().status(404).text("Not Found");
        };
        request.params = matched.params;

        let dispatched = self.dispatcher.dispatch(matched.route, &request).await;
        if let Some(error) = &dispatched.error {
            let status = error.status();
            if status >= 500 {
                tracing::error!(
                    path = %matched.route.file_path,
                    method = %request.method,
                    status,
                    session = %session_id(&request),
                    "{error}"
                );
            } else {
                tracing::debug!(path = %matched.route.file_path, status, "{error}");
            }
        }
        dispatched.response
    }
}

/// HTTP server for one site
pub struct Server {
    config: ServerConfig,
    state: AppState,
    registry: Arc<PoolRegistry>,
}

impl Server {
    /// Serve the site at `config.root` from the host filesystem
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        config.validate()?;
        let fs: Arc<dyn VirtualFs> = Arc::new(OsFs::new(&config.root)?);
        Self::with_fs(config, fs)
    }

    /// Serve a site from any filesystem backing
    pub fn with_fs(config: ServerConfig, fs: Arc<dyn VirtualFs>) -> ServerResult<Self> {
        let routes = RouteTable::scan(fs.as_ref(), &config.routes_path())?;
        tracing::info!(routes = routes.len(), backing = fs.kind(), "routes loaded");

        let registry = Arc::new(PoolRegistry::new(config.pool_options()));
        let dispatcher = Dispatcher::new(registry.clone(), fs, config.version.clone())
            .with_config(config.dispatch_config());

        Ok(Self {
            state: AppState {
                routes: Arc::new(routes),
                dispatcher: Arc::new(dispatcher),
                max_body_size: config.max_body_size,
            },
            config,
            registry,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn routes(&self) -> &RouteTable {
        &self.state.routes
    }

    pub fn router(&self) -> Router {
        Router::new()
            .fallback(handle_request)
            .with_state(self.state.clone())
    }

    /// Start the server (blocking)
    pub fn start(self) -> ServerResult<()> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(num_cpus::get().max(2))
            .enable_all()
            .build()
            .map_err(|e| {
                ServerError::StartError(format!("Failed to create tokio runtime: {}", e))
            })?;

        rt.block_on(self.run_async())
    }

    /// Start the server asynchronously
    pub async fn run_async(self) -> ServerResult<()> {
        let addr = format!("{}:{}", self.config.hostname, self.config.port)
            .parse::<SocketAddr>()
            .map_err(|e| ServerError::InvalidAddress(e.to_string()))?;

        // Start the pool before the first request arrives
        if let Err(err) = self.state.dispatcher.pool() {
            return Err(ServerError::StartError(err.to_string()));
        }

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::StartError(format!("Failed to bind to {}: {}", addr, e)))?;

        tracing::info!(%addr, version = %self.config.version, "rivet listening on http://{addr}");

        let app = self.router();
        let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal())
            .await;

        self.registry.shutdown();
        tracing::info!("server stopped");
        served.map_err(|e| ServerError::StartError(e.to_string()))
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for Ctrl-C: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

async fn handle_request(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request,
) -> Response {
    let started = Instant::now();
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr.to_string());
    let request = match extract_request_info(req, state.max_body_size, remote_addr).await {
        Ok(request) => request,
        Err(response) => return response.into_response(),
    };
    let method = request.method.clone();
    let path = request.path.clone();

    let response = state.respond(request).await;
    tracing::info!(
        %method,
        %path,
        status = response.status,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response.into_response()
}

/// Extract request information from an Axum request
async fn extract_request_info(
    req: Request,
    max_body_size: usize,
    remote_addr: Option<String>,
) -> Result<RequestInfo, ResponseBuilder> {
    let method = req.method().to_string();
    let uri = req.uri();
    let path = uri.path().to_string();
    let query = uri.query().unwrap_or_default().to_string();
    let url = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    let mut headers: HashMap<String, String> = HashMap::new();
    for (name, value) in req.headers() {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        headers
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    let body = axum::body::to_bytes(req.into_body(), max_body_size)
        .await
        .map_err(|_| ResponseBuilder::new().status(413).text("Payload Too Large"))?;
    let body = (!body.is_empty()).then(|| body.to_vec());

    Ok(RequestInfo {
        method,
        url,
        path,
        query,
        headers,
        params: HashMap::new(),
        body,
        remote_addr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFs;

    #[test]
    fn test_response_builder() {
        let response = ResponseBuilder::new().status(200).text("Hello, World!");

        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"Hello, World!");
        assert_eq!(
            response.headers.get("content-type").unwrap(),
            "text/plain; charset=utf-8"
        );
    }

    #[test]
    fn test_request_info() {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());

        let req = RequestInfo {
            method: "POST".to_string(),
            url: "/api/test".to_string(),
            path: "/api/test".to_string(),
            headers,
            body: Some(br#"{"ok":true}"#.to_vec()),
            ..RequestInfo::default()
        };

        assert_eq!(req.header("content-type"), Some("application/json"));
        assert_eq!(req.text().as_deref(), Some(r#"{"ok":true}"#));
    }

    #[tokio::test]
    async fn test_extract_request_info() {
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/users/7?tab=posts")
            .header("Accept", "text/html")
            .header("Accept", "application/json")
            .body(Body::from("hello"))
            .unwrap();

        let info = extract_request_info(req, 1024, Some("10.0.0.1:5000".to_string()))
            .await
            .unwrap();
        assert_eq!(info.path, "/users/7");
        assert_eq!(info.query, "tab=posts");
        assert_eq!(info.url, "/users/7?tab=posts");
        assert_eq!(info.header("accept"), Some("text/html, application/json"));
        assert_eq!(info.text().as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_body_limit() {
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/")
            .body(Body::from(vec![b'x'; 64]))
            .unwrap();

        let response = extract_request_info(req, 16, None).await.unwrap_err();
        assert_eq!(response.status, 413);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_routes_and_dispatch() {
        let fs: Arc<dyn VirtualFs> = Arc::new(MemoryFs::with_files([
            (
                "/routes/users/[id].js",
                "exports.get = (req, res) => res.json({ id: req.params.id, tab: req.query });",
            ),
            ("/routes/about.html", "<h1>{{ .path }}</h1>"),
        ]));
        let config = ServerConfig {
            pool_size: 1,
            ..ServerConfig::default()
        };
        let server = Server::with_fs(config, fs).unwrap();
        assert_eq!(server.routes().len(), 2);

        let request = RequestInfo {
            method: "GET".to_string(),
            path: "/users/7".to_string(),
            query: "tab=posts".to_string(),
            ..RequestInfo::default()
        };
        let response = server.state.respond(request).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, br#"{"id":"7","tab":"tab=posts"}"#);

        let about = RequestInfo {
            method: "GET".to_string(),
            path: "/about".to_string(),
            ..RequestInfo::default()
        };
        let response = server.state.respond(about).await;
        assert_eq!(response.body, b"<h1>/about</h1>");

        let missing = RequestInfo {
            method: "GET".to_string(),
            path: "/nowhere".to_string(),
            ..RequestInfo::default()
        };
        assert_eq!(server.state.respond(missing).await.status, 404);
        server.registry.shutdown();
    }
}
