//! HTTP-side glue: parameter-mapping middleware, the PHP filesystem router,
//! and the gateway that replays a [`ResponsePipe`] onto a hyper response.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http::{HeaderMap, StatusCode};
use hyper::{Body, Request, Response};
use regex::Regex;
use tokio::sync::oneshot;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::client::{ClientConnInfo, ClientFactory, ClientHandle, FcgiRequest};
use crate::error::{Error, Result};
use crate::pipe::{HttpResponder, ResponsePipe};
use crate::protocol::Role;

/// Value of the `SERVER_SOFTWARE` parameter emitted by [`basic_params`].
pub const SERVER_SOFTWARE: &str = concat!("fcgx/", env!("CARGO_PKG_VERSION"));

/// Processes one request against a client: maps parameters, dispatches, or
/// rewrites the resulting pipe. Middleware wraps these.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, client: &dyn ClientHandle, req: FcgiRequest) -> Result<ResponsePipe>;
}

/// The innermost handler: dispatch the request as-is.
pub struct BasicHandler;

#[async_trait]
impl RequestHandler for BasicHandler {
    async fn handle(&self, client: &dyn ClientHandle, req: FcgiRequest) -> Result<ResponsePipe> {
        client.send(req).await
    }
}

/// Decorates a [`RequestHandler`] with another.
pub type Middleware = Box<dyn Fn(Arc<dyn RequestHandler>) -> Arc<dyn RequestHandler> + Send + Sync>;

/// Composes middlewares into one. The first middleware sees the request
/// first and the response pipe last.
pub fn chain(middlewares: Vec<Middleware>) -> Middleware {
    Box::new(move |inner| {
        middlewares
            .iter()
            .rev()
            .fold(inner, |handler, middleware| middleware(handler))
    })
}

/// Maps the basic HTTP protocol parameters onto `req.params`:
/// CONTENT_TYPE, CONTENT_LENGTH, GATEWAY_INTERFACE, HTTPS, REMOTE_ADDR,
/// REMOTE_PORT, SERVER_PORT, SERVER_NAME, SERVER_PROTOCOL, SERVER_SOFTWARE,
/// REDIRECT_STATUS, REQUEST_SCHEME, REQUEST_METHOD, REQUEST_URI and
/// QUERY_STRING.
pub fn basic_params() -> Middleware {
    Box::new(|inner| Arc::new(BasicParams { inner }))
}

struct BasicParams {
    inner: Arc<dyn RequestHandler>,
}

#[async_trait]
impl RequestHandler for BasicParams {
    async fn handle(
        &self,
        client: &dyn ClientHandle,
        mut req: FcgiRequest,
    ) -> Result<ResponsePipe> {
        if let Some(raw) = req.raw.take() {
            let conn = req.conn;
            let params = &mut req.params;
            let scheme = if conn.tls { "https" } else { "http" };

            if conn.tls {
                params.insert("HTTPS".into(), "on".into());
            }
            if let Some(remote) = conn.remote_addr {
                params.insert("REMOTE_ADDR".into(), remote.ip().to_string());
                params.insert("REMOTE_PORT".into(), remote.port().to_string());
            }

            let (server_name, server_port) = split_host_port(&raw.headers, conn);
            params.insert("SERVER_NAME".into(), server_name.into_owned());
            params.insert("SERVER_PORT".into(), server_port.into_owned());

            params.insert(
                "CONTENT_TYPE".into(),
                header_value(&raw.headers, "content-type"),
            );
            params.insert(
                "CONTENT_LENGTH".into(),
                header_value(&raw.headers, "content-length"),
            );
            params.insert("GATEWAY_INTERFACE".into(), "CGI/1.1".into());
            params.insert(
                "SERVER_PROTOCOL".into(),
                server_protocol(raw.version).into(),
            );
            params.insert("SERVER_SOFTWARE".into(), SERVER_SOFTWARE.into());
            params.insert("REDIRECT_STATUS".into(), "200".into());
            params.insert(
                "REQUEST_SCHEME".into(),
                raw.uri.scheme_str().unwrap_or(scheme).into(),
            );
            params.insert("REQUEST_METHOD".into(), raw.method.as_str().into());
            params.insert(
                "REQUEST_URI".into(),
                raw.uri
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or("/")
                    .into(),
            );
            params.insert(
                "QUERY_STRING".into(),
                raw.uri.query().unwrap_or("").into(),
            );

            req.raw = Some(raw);
        }
        self.inner.handle(client, req).await
    }
}

/// Maps every request header onto an `HTTP_`-prefixed parameter, uppercased
/// with `-` replaced by `_`. CONTENT_TYPE and CONTENT_LENGTH are never
/// doubled under `HTTP_`. Repeated headers are joined with a comma, per
/// RFC 7230 §3.2.2.
pub fn map_header() -> Middleware {
    Box::new(|inner| Arc::new(MapHeader { inner }))
}

struct MapHeader {
    inner: Arc<dyn RequestHandler>,
}

#[async_trait]
impl RequestHandler for MapHeader {
    async fn handle(
        &self,
        client: &dyn ClientHandle,
        mut req: FcgiRequest,
    ) -> Result<ResponsePipe> {
        let mut mapped = Vec::new();
        if let Some(raw) = &req.raw {
            for name in raw.headers.keys() {
                let formatted: String = name
                    .as_str()
                    .chars()
                    .map(|c| match c {
                        '-' => '_',
                        c => c.to_ascii_uppercase(),
                    })
                    .collect();
                if formatted == "CONTENT_TYPE" || formatted == "CONTENT_LENGTH" {
                    continue;
                }
                let value = raw
                    .headers
                    .get_all(name)
                    .iter()
                    .filter_map(|v| v.to_str().ok())
                    .collect::<Vec<_>>()
                    .join(",");
                mapped.push((format!("HTTP_{formatted}"), value));
            }
        }
        req.params.extend(mapped);
        self.inner.handle(client, req).await
    }
}

/// Routes requests to script files under a document root, the classic
/// Apache-plus-mod_php hosting layout. Produces PATH_INFO, PATH_TRANSLATED,
/// SCRIPT_NAME, SCRIPT_FILENAME, DOCUMENT_URI and DOCUMENT_ROOT.
pub struct FileSystemRouter {
    pub doc_root: PathBuf,
    pub exts: Vec<String>,
    pub dir_index: Vec<String>,
}

impl FileSystemRouter {
    pub fn new(doc_root: impl Into<PathBuf>) -> Self {
        FileSystemRouter {
            doc_root: doc_root.into(),
            exts: vec!["php".into()],
            dir_index: vec!["index.php".into()],
        }
    }

    pub fn router(self) -> Middleware {
        // `/app.php/extra/path` splits into the script and its PATH_INFO.
        let exts = if self.exts.is_empty() {
            "php".to_string()
        } else {
            self.exts
                .iter()
                .map(|ext| regex::escape(ext))
                .collect::<Vec<_>>()
                .join("|")
        };
        let path_info_re =
            Regex::new(&format!(r"^(.+\.(?:{exts}))(/?.+)$")).expect("path-info pattern");
        Box::new(move |inner| {
            Arc::new(FsRoute {
                inner,
                doc_root: self.doc_root.clone(),
                dir_index: self
                    .dir_index
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "index.php".into()),
                path_info_re: path_info_re.clone(),
            })
        })
    }
}

struct FsRoute {
    inner: Arc<dyn RequestHandler>,
    doc_root: PathBuf,
    dir_index: String,
    path_info_re: Regex,
}

#[async_trait]
impl RequestHandler for FsRoute {
    async fn handle(
        &self,
        client: &dyn ClientHandle,
        mut req: FcgiRequest,
    ) -> Result<ResponsePipe> {
        if let Some(url_path) = req.raw.as_ref().map(|raw| raw.uri.path().to_string()) {
            let mut script_name = url_path.clone();
            let mut path_info = String::new();
            if let Some(captures) = self.path_info_re.captures(&url_path) {
                script_name = captures[1].to_string();
                path_info = captures[2].to_string();
            }
            if script_name.ends_with('/') {
                script_name.push_str(&self.dir_index);
            }
            let script_filename = join_doc_root(&self.doc_root, &script_name);

            let params = &mut req.params;
            params.insert("PATH_INFO".into(), path_info);
            params.insert("PATH_TRANSLATED".into(), script_filename.clone());
            params.insert("SCRIPT_NAME".into(), script_name);
            params.insert("SCRIPT_FILENAME".into(), script_filename);
            params.insert("DOCUMENT_URI".into(), url_path);
            params.insert(
                "DOCUMENT_ROOT".into(),
                self.doc_root.to_string_lossy().into_owned(),
            );
        }
        self.inner.handle(client, req).await
    }
}

/// Routes every request to a single script file — applications that handle
/// their own routing behind one endpoint.
pub fn map_endpoint(endpoint_file: impl Into<PathBuf>) -> Middleware {
    let endpoint: PathBuf = endpoint_file.into();
    let doc_root = endpoint
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));
    let web_path = format!(
        "/{}",
        endpoint
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    );
    Box::new(move |inner| {
        Arc::new(EndpointRoute {
            inner,
            endpoint: endpoint.to_string_lossy().into_owned(),
            doc_root: doc_root.to_string_lossy().into_owned(),
            web_path: web_path.clone(),
        })
    })
}

struct EndpointRoute {
    inner: Arc<dyn RequestHandler>,
    endpoint: String,
    doc_root: String,
    web_path: String,
}

#[async_trait]
impl RequestHandler for EndpointRoute {
    async fn handle(
        &self,
        client: &dyn ClientHandle,
        mut req: FcgiRequest,
    ) -> Result<ResponsePipe> {
        let uri = req.raw.as_ref().map(|raw| raw.uri.clone());
        if let Some(uri) = uri {
            let params = &mut req.params;
            params.insert(
                "REQUEST_URI".into(),
                uri.path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or("/")
                    .into(),
            );
            params.insert("SCRIPT_NAME".into(), self.web_path.clone());
            params.insert("SCRIPT_FILENAME".into(), self.endpoint.clone());
            params.insert("DOCUMENT_URI".into(), uri.path().into());
            params.insert("DOCUMENT_ROOT".into(), self.doc_root.clone());
        }
        self.inner.handle(client, req).await
    }
}

/// The middleware stack a classic PHP hosting environment needs.
pub fn php_fs(doc_root: impl Into<PathBuf>) -> Middleware {
    chain(vec![
        basic_params(),
        map_header(),
        FileSystemRouter::new(doc_root).router(),
    ])
}

/// The middleware stack for a single-file application endpoint.
pub fn file_endpoint(endpoint_file: impl Into<PathBuf>) -> Middleware {
    chain(vec![basic_params(), map_header(), map_endpoint(endpoint_file)])
}

impl FcgiRequest {
    /// Builds a responder-role request from an incoming HTTP request,
    /// wiring the body in as the stdin stream.
    pub fn from_http(req: Request<Body>, conn: ClientConnInfo, cancel: CancellationToken) -> Self {
        let (parts, body) = req.into_parts();
        let stdin = StreamReader::new(
            body.map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err)),
        );
        FcgiRequest {
            raw: Some(parts),
            conn,
            role: Role::Responder,
            params: std::collections::HashMap::new(),
            stdin: Some(Box::new(stdin)),
            data: None,
            keep_conn: false,
            cancel,
        }
    }
}

/// Replays a parsed CGI response into a hyper response: the header block
/// through a oneshot, the body through a channel.
struct ChannelResponder {
    header_tx: Option<oneshot::Sender<(StatusCode, HeaderMap)>>,
    body: hyper::body::Sender,
}

#[async_trait]
impl HttpResponder for ChannelResponder {
    async fn send_header(&mut self, status: StatusCode, headers: HeaderMap) -> Result<()> {
        if let Some(tx) = self.header_tx.take() {
            let _ = tx.send((status, headers));
        }
        Ok(())
    }

    async fn send_body(&mut self, chunk: Bytes) -> Result<()> {
        self.body.send_data(chunk).await.map_err(|err| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                err,
            ))
        })
    }
}

/// Ties a client factory and a middleware-composed handler to hyper
/// request/response pairs.
pub struct Gateway {
    client_factory: Arc<dyn ClientFactory>,
    handler: Arc<dyn RequestHandler>,
    request_timeout: Option<tokio::time::Duration>,
}

impl Gateway {
    pub fn new(client_factory: Arc<dyn ClientFactory>, middleware: Middleware) -> Self {
        Gateway {
            client_factory,
            handler: middleware(Arc::new(BasicHandler)),
            request_timeout: None,
        }
    }

    /// Cancels in-flight requests after `timeout`; the response reader gives
    /// up and the stderr stream records `timeout or canceled`.
    pub fn with_timeout(mut self, timeout: tokio::time::Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Serves one HTTP request end to end. Failures become 502/500
    /// responses rather than errors: the hyper service seam is infallible.
    pub async fn serve(&self, req: Request<Body>, conn: ClientConnInfo) -> Response<Body> {
        let client = match self.client_factory.create().await {
            Ok(client) => client,
            Err(err) => {
                warn!(error = %err, "unable to connect to FastCGI application");
                return plain_response(
                    StatusCode::BAD_GATEWAY,
                    "failed to connect to FastCGI application",
                );
            }
        };

        let cancel = CancellationToken::new();
        if let Some(timeout) = self.request_timeout {
            let deadline = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                deadline.cancel();
            });
        }

        let fcgi_req = FcgiRequest::from_http(req, conn, cancel.clone());
        let pipe = match self.handler.handle(client.as_ref(), fcgi_req).await {
            Ok(pipe) => pipe,
            Err(err) => {
                warn!(error = %err, "unable to process request");
                let _ = client.close().await;
                return plain_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to process request",
                );
            }
        };

        let (header_tx, header_rx) = oneshot::channel();
        let (body_sender, body) = Body::channel();
        let mut responder = ChannelResponder {
            header_tx: Some(header_tx),
            body: body_sender,
        };

        tokio::spawn(async move {
            let mut stderr = Vec::new();
            if let Err(err) = pipe.write_to(&mut responder, &mut stderr).await {
                warn!(error = %err, "failed to write response stream");
            }
            if !stderr.is_empty() {
                warn!(
                    fastcgi_stderr = %String::from_utf8_lossy(&stderr),
                    "error stream from application process"
                );
            }
            if let Err(err) = client.close().await {
                warn!(error = %err, "error closing client");
            }
            // Late cancel: unblocks the reader task if the upstream never
            // sent EndRequest and the consumer is already gone.
            cancel.cancel();
        });

        match header_rx.await {
            Ok((status, headers)) => {
                let mut response = Response::new(body);
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                response
            }
            Err(_) => plain_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to write stream"),
        }
    }
}

fn plain_response(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
}

fn header_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

fn server_protocol(version: http::Version) -> &'static str {
    match version {
        http::Version::HTTP_09 => "HTTP/0.9",
        http::Version::HTTP_10 => "HTTP/1.0",
        http::Version::HTTP_11 => "HTTP/1.1",
        http::Version::HTTP_2 => "HTTP/2.0",
        http::Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

/// SERVER_NAME and SERVER_PORT come from the Host header (client-facing),
/// falling back to the accepting socket's port. Handles bracketed IPv6
/// hosts.
fn split_host_port<'a>(
    headers: &'a HeaderMap,
    conn: ClientConnInfo,
) -> (Cow<'a, str>, Cow<'a, str>) {
    let default_port = || {
        Cow::Owned(
            conn.local_port
                .unwrap_or(if conn.tls { 443 } else { 80 })
                .to_string(),
        )
    };
    let Some(host) = headers.get("host").and_then(|v| v.to_str().ok()) else {
        return (Cow::Borrowed("localhost"), default_port());
    };
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let name = &rest[..end];
            if let Some(port) = rest[end + 1..].strip_prefix(':') {
                return (Cow::Borrowed(name), Cow::Borrowed(port));
            }
            return (Cow::Borrowed(name), default_port());
        }
        return (Cow::Borrowed(host), default_port());
    }
    match host.rsplit_once(':') {
        Some((name, port)) => (Cow::Borrowed(name), Cow::Borrowed(port)),
        None => (Cow::Borrowed(host), default_port()),
    }
}

fn join_doc_root(doc_root: &Path, script_name: &str) -> String {
    doc_root
        .join(script_name.trim_start_matches('/'))
        .to_string_lossy()
        .into_owned()
}
