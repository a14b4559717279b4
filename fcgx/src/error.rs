use thiserror::Error;

/// Error surface of the FastCGI client.
///
/// Errors raised inside a request's writer/reader tasks are not returned to
/// the caller; they are funneled into the stderr side of the
/// [`ResponsePipe`](crate::pipe::ResponsePipe) so that partial output already
/// produced by the upstream can still be delivered.
#[derive(Debug, Error)]
pub enum Error {
    /// The upstream connection could not be established.
    #[error("failed to dial FastCGI backend: {0}")]
    Dial(#[source] std::io::Error),

    /// A record arrived with a protocol version other than 1.
    #[error("invalid FastCGI header version {0}")]
    InvalidHeader(u8),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Malformed wire data outside the record header itself.
    #[error("{0}")]
    Protocol(String),

    /// The CGI response header block could not be parsed. The HTTP bridge
    /// turns this into a 500 when no header has been flushed yet.
    #[error("{0}")]
    HeaderParse(String),

    /// The caller's cancellation token fired before EndRequest arrived.
    #[error("timeout or canceled")]
    Cancelled,

    /// `send` was invoked on a client with no installed connection.
    #[error("client connection has been closed")]
    ConnectionClosed,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
