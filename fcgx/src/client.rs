//! Per-request orchestration: id allocation, the writer/reader/supervisor
//! task trio, and the client seams the pool and the HTTP bridge build on.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::conn::{ConnFactory, Connection, StreamSender};
use crate::error::{Error, Result};
use crate::pipe::ResponsePipe;
use crate::protocol::{self, Role};

/// A finite, single-pass byte stream fed to the upstream as stdin or data.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Peer metadata of the HTTP connection a request arrived on, for the
/// parameter-mapping middleware.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientConnInfo {
    pub remote_addr: Option<SocketAddr>,
    pub local_port: Option<u16>,
    pub tls: bool,
}

/// One FastCGI request.
pub struct FcgiRequest {
    /// Metadata of the originating HTTP request, kept for middleware access.
    pub raw: Option<http::request::Parts>,
    /// Peer info of the originating HTTP connection.
    pub conn: ClientConnInfo,
    pub role: Role,
    pub params: HashMap<String, String>,
    pub stdin: Option<ByteStream>,
    /// Extra data stream, framed as Data records. Only the Filter role
    /// consumes it.
    pub data: Option<ByteStream>,
    /// Sets the keep-connection flag on BeginRequest. Nothing in this crate
    /// sets it; the per-request connection is always dropped after
    /// EndRequest.
    pub keep_conn: bool,
    /// Fires when the caller gives up on the request; the response reader
    /// stops without waiting for EndRequest.
    pub cancel: CancellationToken,
}

impl FcgiRequest {
    pub fn new(role: Role) -> Self {
        FcgiRequest {
            raw: None,
            conn: ClientConnInfo::default(),
            role,
            params: HashMap::new(),
            stdin: None,
            data: None,
            keep_conn: false,
            cancel: CancellationToken::new(),
        }
    }
}

impl Default for FcgiRequest {
    fn default() -> Self {
        FcgiRequest::new(Role::Responder)
    }
}

/// Pool of 16-bit request ids in `[1, limit]`.
///
/// Allocation blocks until an id is free; release never waits on the pool's
/// backpressure. A background task seeds the ids once at construction.
pub struct IdPool {
    tx: mpsc::Sender<u16>,
    rx: Mutex<mpsc::Receiver<u16>>,
}

impl IdPool {
    /// `limit` caps outstanding ids; 0 (or anything larger) means 65,535.
    pub fn new(limit: u32) -> Self {
        let limit = if limit == 0 || limit > 65_535 {
            65_535
        } else {
            limit as u16
        };
        let (tx, rx) = mpsc::channel(limit as usize);
        let seed = tx.clone();
        tokio::spawn(async move {
            for id in 1..=limit {
                if seed.send(id).await.is_err() {
                    return;
                }
            }
        });
        IdPool {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub async fn alloc(&self) -> u16 {
        // The pool keeps its own sender, so the channel cannot close.
        self.rx
            .lock()
            .await
            .recv()
            .await
            .expect("id pool channel closed")
    }

    pub fn release(&self, id: u16) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(id).await;
        });
    }
}

/// FastCGI client: one connection, one live request at a time.
pub struct Client {
    conn: Mutex<Option<Arc<Connection>>>,
    conn_factory: Arc<dyn ConnFactory>,
    id_pool: Arc<IdPool>,
}

impl Client {
    /// `limit` bounds the request-id pool; 0 means the protocol maximum.
    pub fn new(conn_factory: Arc<dyn ConnFactory>, limit: u32) -> Self {
        Client {
            conn: Mutex::new(None),
            conn_factory,
            id_pool: Arc::new(IdPool::new(limit)),
        }
    }

    /// Dials through the connection factory and installs the connection.
    pub async fn connect(&self) -> Result<()> {
        let stream = self.conn_factory.connect().await?;
        *self.conn.lock().await = Some(Arc::new(Connection::new(stream)));
        Ok(())
    }

    /// Dispatches one request and returns the response pipe immediately so
    /// the caller can start consuming it without waiting for the upstream.
    ///
    /// Three tasks drive the request: a writer (BeginRequest, Params, stdin),
    /// a reader (Stdout/Stderr/EndRequest dispatch), and a supervisor that
    /// joins both, funnels their errors into the stderr side of the pipe,
    /// releases the request id and closes the pipe's writer endpoints.
    pub async fn send(&self, req: FcgiRequest) -> Result<ResponsePipe> {
        let conn = self
            .conn
            .lock()
            .await
            .clone()
            .ok_or(Error::ConnectionClosed)?;
        let request_id = self.id_pool.alloc().await;
        let (pipe, stdout_w, stderr_w) = ResponsePipe::new();
        let cancel = req.cancel.clone();

        let writer_conn = Arc::clone(&conn);
        let writer = tokio::spawn(write_request(writer_conn, request_id, req));

        let reader = tokio::spawn(async move {
            let mut stdout_w = stdout_w;
            let mut stderr_w = stderr_w;
            let res = read_response(&conn, cancel, &mut stdout_w, &mut stderr_w).await;
            (res, stdout_w, stderr_w)
        });

        let id_pool = Arc::clone(&self.id_pool);
        tokio::spawn(async move {
            let write_res: Result<()> = writer
                .await
                .unwrap_or_else(|err| {
                    Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        err,
                    )))
                });
            match reader.await {
                Ok((read_res, _stdout_w, mut stderr_w)) => {
                    for err in [write_res.err(), read_res.err()].into_iter().flatten() {
                        let _ = stderr_w.write_all(err.to_string().as_bytes()).await;
                    }
                    // Dropping the writer halves here signals EOF to the
                    // HTTP side of the pipe.
                }
                Err(err) => warn!(error = %err, "response reader task failed"),
            }
            id_pool.release(request_id);
        });

        Ok(pipe)
    }

    /// Drops the installed connection, if any. Closing a client without a
    /// connection is a no-op.
    pub async fn close_conn(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.close().await?;
        }
        Ok(())
    }

    /// Alias for [`close_conn`](Client::close_conn), so callers can treat
    /// plain and pooled clients uniformly at request end.
    pub async fn close(&self) -> Result<()> {
        self.close_conn().await
    }
}

async fn write_request(conn: Arc<Connection>, request_id: u16, req: FcgiRequest) -> Result<()> {
    let res = write_request_inner(&conn, request_id, req).await;
    if res.is_err() {
        // Tell the upstream to drop the request before surfacing the failure.
        let _ = conn.write_abort_request(request_id).await;
    }
    res
}

async fn write_request_inner(conn: &Connection, request_id: u16, req: FcgiRequest) -> Result<()> {
    let flags = if req.keep_conn {
        protocol::FCGI_KEEP_CONN
    } else {
        0
    };
    conn.write_begin_request(request_id, req.role, flags).await?;
    conn.write_pairs(protocol::FCGI_PARAMS, request_id, &req.params)
        .await?;
    match req.stdin {
        Some(stdin) => write_stream(conn, protocol::FCGI_STDIN, request_id, stdin).await?,
        // No body: just the end-of-stream record.
        None => {
            conn.write_record(protocol::FCGI_STDIN, request_id, &[])
                .await?
        }
    }
    if let Some(data) = req.data {
        write_stream(conn, protocol::FCGI_DATA, request_id, data).await?;
    }
    Ok(())
}

/// Reads `source` in chunks of at most 1,024 bytes and frames it as one
/// record stream, terminator included.
async fn write_stream(
    conn: &Connection,
    record_type: u8,
    request_id: u16,
    mut source: ByteStream,
) -> Result<()> {
    let mut sender = StreamSender::new(conn, record_type, request_id);
    let mut chunk = [0u8; 1024];
    loop {
        let n = source.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        sender.write(&chunk[..n]).await?;
    }
    sender.close().await
}

async fn read_response(
    conn: &Connection,
    cancel: CancellationToken,
    stdout: &mut DuplexStream,
    stderr: &mut DuplexStream,
) -> Result<()> {
    let read_loop = async {
        loop {
            let record = match conn.read_record().await {
                Ok(record) => record,
                // EOF, whether at a record boundary or mid-record, is the end
                // of the response.
                Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(())
                }
                Err(err) => return Err(err),
            };
            match record.header.record_type {
                protocol::FCGI_STDOUT => stdout.write_all(&record.content).await?,
                protocol::FCGI_STDERR => stderr.write_all(&record.content).await?,
                protocol::FCGI_END_REQUEST => {
                    if let Some(end) = protocol::EndRequest::parse(&record.content) {
                        if end.protocol_status != protocol::FCGI_REQUEST_COMPLETE {
                            debug!(
                                app_status = end.app_status,
                                protocol_status = end.protocol_status,
                                "request ended abnormally"
                            );
                        }
                    }
                    return Ok(());
                }
                other => {
                    let diag = format!("unexpected type {other} in read loop");
                    stderr.write_all(diag.as_bytes()).await?;
                }
            }
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = read_loop => res,
    }
}

/// The client surface the HTTP bridge and the pool program against: plain
/// clients and pooled clients both implement it.
#[async_trait]
pub trait ClientHandle: Send + Sync {
    /// Dispatches one request; see [`Client::send`].
    async fn send(&self, req: FcgiRequest) -> Result<ResponsePipe>;
    /// Establishes the upstream connection.
    async fn connect(&self) -> Result<()>;
    /// Drops the upstream connection, keeping the client reusable.
    async fn close_conn(&self) -> Result<()>;
    /// Releases the client. Pooled clients return to their pool here.
    async fn close(self: Box<Self>) -> Result<()>;
}

#[async_trait]
impl ClientHandle for Client {
    async fn send(&self, req: FcgiRequest) -> Result<ResponsePipe> {
        Client::send(self, req).await
    }

    async fn connect(&self) -> Result<()> {
        Client::connect(self).await
    }

    async fn close_conn(&self) -> Result<()> {
        Client::close_conn(self).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Client::close_conn(&self).await
    }
}

/// Builds clients for the HTTP bridge or the pool.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn ClientHandle>>;
}

/// Client factory that dials immediately, so the returned client carries a
/// live connection.
pub struct SimpleClientFactory {
    conn_factory: Arc<dyn ConnFactory>,
    limit: u32,
}

impl SimpleClientFactory {
    pub fn new(conn_factory: Arc<dyn ConnFactory>, limit: u32) -> Self {
        SimpleClientFactory { conn_factory, limit }
    }
}

#[async_trait]
impl ClientFactory for SimpleClientFactory {
    async fn create(&self) -> Result<Box<dyn ClientHandle>> {
        let client = Client::new(Arc::clone(&self.conn_factory), self.limit);
        client.connect().await?;
        Ok(Box::new(client))
    }
}

/// Client factory that defers dialing to [`ClientHandle::connect`]. The pool
/// stocks clients this way so idle stock holds no sockets.
pub struct LazyClientFactory {
    conn_factory: Arc<dyn ConnFactory>,
    limit: u32,
}

impl LazyClientFactory {
    pub fn new(conn_factory: Arc<dyn ConnFactory>, limit: u32) -> Self {
        LazyClientFactory { conn_factory, limit }
    }
}

#[async_trait]
impl ClientFactory for LazyClientFactory {
    async fn create(&self) -> Result<Box<dyn ClientHandle>> {
        Ok(Box::new(Client::new(Arc::clone(&self.conn_factory), self.limit)))
    }
}
