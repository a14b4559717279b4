//! The response pipe between a request's reader task and the HTTP writer,
//! and the CGI response parser that drives it.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, LOCATION};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, BufReader, DuplexStream};

use crate::error::{Error, Result};

/// In-memory buffer of each pipe; writers block once the consumer falls this
/// far behind.
const PIPE_CAPACITY: usize = 64 * 1024;

/// A CGI header line longer than this is fatal.
const MAX_HEADER_LINE: usize = 1024;

const BODY_CHUNK: usize = 16 * 1024;

/// Where the parsed CGI response is replayed. The HTTP gateway backs this
/// with a hyper response; tests use an in-memory implementation.
#[async_trait]
pub trait HttpResponder: Send {
    /// Sends the status line and response headers. Called at most once.
    async fn send_header(&mut self, status: StatusCode, headers: HeaderMap) -> Result<()>;
    /// Sends one chunk of the response body.
    async fn send_body(&mut self, chunk: Bytes) -> Result<()>;
}

/// The read ends of the two byte pipes carrying a request's upstream output.
///
/// The matching write ends live with the request's reader task; when the
/// supervisor drops them, both streams observe EOF.
pub struct ResponsePipe {
    stdout: DuplexStream,
    stderr: DuplexStream,
}

impl std::fmt::Debug for ResponsePipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponsePipe").finish_non_exhaustive()
    }
}

impl ResponsePipe {
    /// Returns the pipe plus the stdout and stderr writer endpoints.
    pub fn new() -> (ResponsePipe, DuplexStream, DuplexStream) {
        let (stdout_w, stdout_r) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_w, stderr_r) = tokio::io::duplex(PIPE_CAPACITY);
        (
            ResponsePipe {
                stdout: stdout_r,
                stderr: stderr_r,
            },
            stdout_w,
            stderr_w,
        )
    }

    /// Replays the upstream output: stdout through the CGI header parser
    /// into `responder`, stderr verbatim into `error_sink`. Both consumers
    /// run to completion; the first stdout-side error wins.
    pub async fn write_to<R, E>(self, responder: &mut R, error_sink: &mut E) -> Result<()>
    where
        R: HttpResponder,
        E: AsyncWrite + Send + Unpin,
    {
        let ResponsePipe { stdout, mut stderr } = self;
        let (out_res, err_res) = tokio::join!(write_response(stdout, responder), async {
            tokio::io::copy(&mut stderr, error_sink)
                .await
                .map_err(Error::Io)?;
            Ok(())
        });
        out_res.and(err_res)
    }
}

/// Parses the CGI header block off `stdout` and replays headers and body
/// onto `responder`.
///
/// On a malformed header block a 500 with no headers is emitted — the only
/// case where a status reaches the client before this function fails.
async fn write_response<R: HttpResponder>(stdout: DuplexStream, responder: &mut R) -> Result<()> {
    let mut reader = BufReader::with_capacity(MAX_HEADER_LINE, stdout);
    let mut headers = HeaderMap::new();
    let mut status_code: u16 = 0;
    let mut header_lines = 0usize;
    let mut saw_blank_line = false;

    let parse_res: Result<()> = loop {
        let line = match read_header_line(&mut reader).await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()), // EOF before a blank line
            Err(err) => break Err(err),
        };
        if line.is_empty() {
            saw_blank_line = true;
            break Ok(());
        }
        header_lines += 1;

        let text = String::from_utf8_lossy(&line);
        let Some((name, value)) = text.split_once(':') else {
            break Err(Error::HeaderParse(format!("bogus header line: {text}")));
        };
        let name = name.trim();
        let value = value.trim();

        if name == "Status" {
            // The synthetic status pseudo-header: the first three characters
            // carry the code, the rest is a free-form reason phrase.
            if value.len() < 3 {
                break Err(Error::HeaderParse(format!("bogus status (short): {value:?}")));
            }
            let code = value
                .get(..3)
                .and_then(|digits| digits.parse::<u16>().ok());
            match code {
                Some(code) => status_code = code,
                None => break Err(Error::HeaderParse(format!("bogus status: {value:?}"))),
            }
        } else {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => break Err(Error::HeaderParse(format!("bogus header line: {text}"))),
            }
        }
    };

    if let Err(err) = parse_res {
        let _ = responder
            .send_header(StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new())
            .await;
        return Err(err);
    }

    if header_lines == 0 || !saw_blank_line {
        let _ = responder
            .send_header(StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new())
            .await;
        return Err(Error::HeaderParse("no headers".into()));
    }

    if status_code == 0 && headers.get(LOCATION).is_some_and(|loc| !loc.is_empty()) {
        status_code = StatusCode::FOUND.as_u16();
    }
    if status_code == 0 && !headers.contains_key(CONTENT_TYPE) {
        let _ = responder
            .send_header(StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new())
            .await;
        return Err(Error::HeaderParse(
            "missing required Content-Type in headers".into(),
        ));
    }
    if status_code == 0 {
        status_code = StatusCode::OK.as_u16();
    }

    let status = match StatusCode::from_u16(status_code) {
        Ok(status) => status,
        Err(_) => {
            let _ = responder
                .send_header(StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new())
                .await;
            return Err(Error::HeaderParse(format!("bogus status code {status_code}")));
        }
    };
    responder.send_header(status, headers).await?;

    // The remainder of stdout is the body, copied verbatim.
    let mut chunk = [0u8; BODY_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        responder
            .send_body(Bytes::copy_from_slice(&chunk[..n]))
            .await?;
    }
}

/// Reads one header line, tolerating CRLF and bare LF line endings.
///
/// Returns `None` at EOF. A line longer than the reader's buffer is fatal —
/// the upstream is emitting something that is not a CGI header block.
async fn read_header_line(
    reader: &mut BufReader<DuplexStream>,
) -> Result<Option<Vec<u8>>> {
    let mut line: Vec<u8> = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            // EOF: hand back any unterminated trailing line first.
            if line.is_empty() {
                return Ok(None);
            }
            return Ok(Some(line));
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                line.extend_from_slice(&available[..pos]);
                reader.consume(pos + 1);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if line.len() > MAX_HEADER_LINE {
                    return Err(Error::HeaderParse(
                        "long header line from subprocess".into(),
                    ));
                }
                return Ok(Some(line));
            }
            None => {
                let n = available.len();
                line.extend_from_slice(available);
                reader.consume(n);
                if line.len() > MAX_HEADER_LINE {
                    return Err(Error::HeaderParse(
                        "long header line from subprocess".into(),
                    ));
                }
            }
        }
    }
}
