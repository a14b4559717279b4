//! Connection ownership and the outbound record path.

use std::collections::HashMap;
#[cfg(unix)]
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::protocol::{self, Record, RecordHeader, Role};

/// Bidirectional byte stream a connection runs over.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// Produces fresh connections to the upstream FastCGI server.
#[async_trait]
pub trait ConnFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Stream>>;
}

/// Upstream address: TCP `host:port` or a Unix socket path.
#[derive(Debug, Clone)]
pub enum Backend {
    Tcp {
        host: String,
        port: u16,
    },
    #[cfg(unix)]
    Unix {
        path: PathBuf,
    },
}

impl Backend {
    /// Parses `host:port` or `unix://path`.
    pub fn parse(raw: &str) -> Result<Backend> {
        if let Some(path) = raw.strip_prefix("unix://") {
            #[cfg(unix)]
            {
                return Ok(Backend::Unix {
                    path: PathBuf::from(path),
                });
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                return Err(Error::Protocol(
                    "unix FastCGI backends are not supported on this platform".into(),
                ));
            }
        }
        let Some((host, port)) = raw.rsplit_once(':') else {
            return Err(Error::Protocol(format!(
                "invalid FastCGI address (expected host:port or unix://path): {raw}"
            )));
        };
        let port: u16 = port
            .parse()
            .map_err(|_| Error::Protocol(format!("invalid FastCGI port in address: {raw}")))?;
        Ok(Backend::Tcp {
            host: host.to_string(),
            port,
        })
    }
}

/// The reference [`ConnFactory`]: dials a [`Backend`] with the platform
/// socket primitives.
pub struct SimpleConnFactory {
    backend: Backend,
}

impl SimpleConnFactory {
    pub fn new(backend: Backend) -> Self {
        SimpleConnFactory { backend }
    }
}

#[async_trait]
impl ConnFactory for SimpleConnFactory {
    async fn connect(&self) -> Result<Box<dyn Stream>> {
        match &self.backend {
            Backend::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(Error::Dial)?;
                let _ = stream.set_nodelay(true);
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Backend::Unix { path } => {
                let stream = UnixStream::connect(path).await.map_err(Error::Dial)?;
                Ok(Box::new(stream))
            }
        }
    }
}

struct SendHalf {
    io: WriteHalf<Box<dyn Stream>>,
    // Scratch for record assembly, reused across writes. Guarded by the same
    // mutex that serializes the writes themselves.
    buf: BytesMut,
}

/// One upstream connection.
///
/// Outbound records are serialized behind a mutex so concurrent writers can
/// never interleave bytes. Inbound records are read by exactly one task at a
/// time by construction (the reader of the owning request).
pub struct Connection {
    send: Mutex<SendHalf>,
    recv: Mutex<ReadHalf<Box<dyn Stream>>>,
}

impl Connection {
    pub fn new(stream: Box<dyn Stream>) -> Self {
        let (read, write) = tokio::io::split(stream);
        Connection {
            send: Mutex::new(SendHalf {
                io: write,
                buf: BytesMut::with_capacity(8 * 1024),
            }),
            recv: Mutex::new(read),
        }
    }

    /// Emits one framed record: header, content, padding, as a single write.
    pub async fn write_record(&self, record_type: u8, request_id: u16, content: &[u8]) -> Result<()> {
        debug_assert!(content.len() <= protocol::MAX_CONTENT);
        const PAD: [u8; 8] = [0u8; 8];

        let mut send = self.send.lock().await;
        let header = RecordHeader::new(record_type, request_id, content.len());
        let SendHalf { io, buf } = &mut *send;
        buf.clear();
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(content);
        buf.extend_from_slice(&PAD[..header.padding_length as usize]);
        io.write_all(&buf[..]).await?;
        io.flush().await?;
        Ok(())
    }

    pub async fn write_begin_request(&self, request_id: u16, role: Role, flags: u8) -> Result<()> {
        let body = protocol::begin_request_body(role, flags);
        self.write_record(protocol::FCGI_BEGIN_REQUEST, request_id, &body)
            .await
    }

    pub async fn write_abort_request(&self, request_id: u16) -> Result<()> {
        self.write_record(protocol::FCGI_ABORT_REQUEST, request_id, &[])
            .await
    }

    pub async fn write_end_request(
        &self,
        request_id: u16,
        app_status: u32,
        protocol_status: u8,
    ) -> Result<()> {
        let body = protocol::EndRequest {
            app_status,
            protocol_status,
        }
        .encode();
        self.write_record(protocol::FCGI_END_REQUEST, request_id, &body)
            .await
    }

    /// Frames a parameter map as one record stream of `record_type`,
    /// terminator included. Pair order follows map iteration order and is
    /// irrelevant to the upstream.
    pub async fn write_pairs(
        &self,
        record_type: u8,
        request_id: u16,
        pairs: &HashMap<String, String>,
    ) -> Result<()> {
        let mut sender = StreamSender::new(self, record_type, request_id);
        let mut lengths = BytesMut::with_capacity(8);
        for (name, value) in pairs {
            lengths.clear();
            protocol::put_nv_len(&mut lengths, name.len());
            protocol::put_nv_len(&mut lengths, value.len());
            sender.write(&lengths).await?;
            sender.write(name.as_bytes()).await?;
            sender.write(value.as_bytes()).await?;
        }
        sender.close().await
    }

    /// Reads the next record off the connection.
    pub async fn read_record(&self) -> Result<Record> {
        let mut recv = self.recv.lock().await;
        protocol::read_record(&mut *recv).await
    }

    /// Shuts the write side down. In-flight readers observe EOF.
    pub async fn close(&self) -> Result<()> {
        let mut send = self.send.lock().await;
        send.io.shutdown().await?;
        Ok(())
    }
}

/// Bytes-in / records-out adapter for the stream record types (Params,
/// Stdin, Data).
///
/// Writes are buffered so that many small caller writes coalesce into
/// full-size records; a record is emitted whenever [`MAX_CONTENT`]
/// (65,535) content bytes accumulate. [`close`](StreamSender::close) flushes
/// the remainder and emits the zero-length record that terminates the
/// stream — without it the upstream would wait for more data forever.
///
/// [`MAX_CONTENT`]: protocol::MAX_CONTENT
pub struct StreamSender<'a> {
    conn: &'a Connection,
    record_type: u8,
    request_id: u16,
    buf: BytesMut,
}

impl<'a> StreamSender<'a> {
    pub fn new(conn: &'a Connection, record_type: u8, request_id: u16) -> Self {
        StreamSender {
            conn,
            record_type,
            request_id,
            buf: BytesMut::with_capacity(protocol::MAX_CONTENT),
        }
    }

    /// Accepts `data` in full, emitting records as the buffer fills.
    pub async fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let room = protocol::MAX_CONTENT - self.buf.len();
            let take = room.min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == protocol::MAX_CONTENT {
                self.flush_record().await?;
            }
        }
        Ok(())
    }

    async fn flush_record(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.conn
            .write_record(self.record_type, self.request_id, &self.buf)
            .await?;
        self.buf.clear();
        Ok(())
    }

    /// Flushes buffered bytes and emits the end-of-stream record.
    pub async fn close(mut self) -> Result<()> {
        self.flush_record().await?;
        self.conn
            .write_record(self.record_type, self.request_id, &[])
            .await
    }
}
