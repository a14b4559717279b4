//! End-to-end client tests against a mock FastCGI server: wire sequencing,
//! stdin chunking, error funneling and cancellation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fcgx::client::{Client, FcgiRequest, IdPool};
use fcgx::conn::{Backend, SimpleConnFactory};
use fcgx::pipe::HttpResponder;
use fcgx::protocol::Role;
use http::{HeaderMap, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const FCGI_BEGIN_REQUEST: u8 = 1;
const FCGI_END_REQUEST: u8 = 3;
const FCGI_PARAMS: u8 = 4;
const FCGI_STDIN: u8 = 5;
const FCGI_STDOUT: u8 = 6;
const FCGI_STDERR: u8 = 7;
const FCGI_REQUEST_COMPLETE: u8 = 0;

fn encode_record(record_type: u8, request_id: u16, content: &[u8]) -> Vec<u8> {
    let padding = (8 - (content.len() % 8)) % 8;
    let mut buf = Vec::with_capacity(8 + content.len() + padding);
    buf.push(1);
    buf.push(record_type);
    buf.extend_from_slice(&request_id.to_be_bytes());
    buf.extend_from_slice(&(content.len() as u16).to_be_bytes());
    buf.push(padding as u8);
    buf.push(0);
    buf.extend_from_slice(content);
    buf.extend(std::iter::repeat(0u8).take(padding));
    buf
}

/// Reads one record, returning (type, request id, content length, padding
/// length, content).
async fn read_raw_record(stream: &mut TcpStream) -> (u8, u16, usize, usize, Vec<u8>) {
    let mut hdr = [0u8; 8];
    stream.read_exact(&mut hdr).await.unwrap();
    assert_eq!(hdr[0], 1, "record version");
    let record_type = hdr[1];
    let request_id = u16::from_be_bytes([hdr[2], hdr[3]]);
    let content_len = u16::from_be_bytes([hdr[4], hdr[5]]) as usize;
    let padding_len = hdr[6] as usize;
    let mut body = vec![0u8; content_len + padding_len];
    if !body.is_empty() {
        stream.read_exact(&mut body).await.unwrap();
    }
    body.truncate(content_len);
    (record_type, request_id, content_len, padding_len, body)
}

/// Drains one record stream of `expected_type`, returning the non-empty
/// record contents in arrival order. The zero-length terminator must come
/// last.
async fn read_stream_records(stream: &mut TcpStream, expected_type: u8) -> Vec<Vec<u8>> {
    let mut records = Vec::new();
    loop {
        let (record_type, _, content_len, padding_len, content) = read_raw_record(stream).await;
        assert_eq!(record_type, expected_type);
        assert_eq!((content_len + padding_len) % 8, 0, "record body unaligned");
        if content.is_empty() {
            return records;
        }
        records.push(content);
    }
}

fn read_nv_len(data: &mut &[u8]) -> usize {
    let first = data[0];
    if first < 128 {
        *data = &data[1..];
        first as usize
    } else {
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) & 0x7fff_ffff;
        *data = &data[4..];
        len as usize
    }
}

fn decode_params(mut data: &[u8]) -> HashMap<String, String> {
    let mut params = HashMap::new();
    while !data.is_empty() {
        let name_len = read_nv_len(&mut data);
        let value_len = read_nv_len(&mut data);
        let name = String::from_utf8(data[..name_len].to_vec()).unwrap();
        let value = String::from_utf8(data[name_len..name_len + value_len].to_vec()).unwrap();
        data = &data[name_len + value_len..];
        params.insert(name, value);
    }
    params
}

#[derive(Default)]
struct MockResponder {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Vec<u8>,
}

#[async_trait]
impl HttpResponder for MockResponder {
    async fn send_header(
        &mut self,
        status: StatusCode,
        headers: HeaderMap,
    ) -> Result<(), fcgx::Error> {
        self.status = Some(status);
        self.headers = headers;
        Ok(())
    }

    async fn send_body(&mut self, chunk: Bytes) -> Result<(), fcgx::Error> {
        self.body.extend_from_slice(&chunk);
        Ok(())
    }
}

async fn connected_client(addr: std::net::SocketAddr) -> Client {
    let backend = Backend::parse(&addr.to_string()).unwrap();
    let client = Client::new(Arc::new(SimpleConnFactory::new(backend)), 0);
    client.connect().await.unwrap();
    client
}

#[tokio::test]
async fn minimal_get_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let (record_type, request_id, content_len, _, content) =
            read_raw_record(&mut stream).await;
        assert_eq!(record_type, FCGI_BEGIN_REQUEST);
        assert_eq!(content_len, 8);
        assert_eq!(u16::from_be_bytes([content[0], content[1]]), 1, "role");
        assert_eq!(content[2], 0, "keep-conn flag");

        let params_records = read_stream_records(&mut stream, FCGI_PARAMS).await;
        assert_eq!(params_records.len(), 1, "one non-empty Params record");
        let params = decode_params(&params_records[0]);
        assert_eq!(params.get("REQUEST_METHOD").map(String::as_str), Some("GET"));
        assert_eq!(
            params.get("SCRIPT_FILENAME").map(String::as_str),
            Some("/x.php")
        );

        let stdin_records = read_stream_records(&mut stream, FCGI_STDIN).await;
        assert!(stdin_records.is_empty(), "GET carries no stdin content");

        let cgi = b"Content-Type: text/plain\r\n\r\nok";
        stream
            .write_all(&encode_record(FCGI_STDOUT, request_id, cgi))
            .await
            .unwrap();
        stream
            .write_all(&encode_record(FCGI_STDOUT, request_id, &[]))
            .await
            .unwrap();
        let mut end = [0u8; 8];
        end[4] = FCGI_REQUEST_COMPLETE;
        stream
            .write_all(&encode_record(FCGI_END_REQUEST, request_id, &end))
            .await
            .unwrap();
    });

    let client = connected_client(addr).await;
    let mut req = FcgiRequest::new(Role::Responder);
    req.params.insert("REQUEST_METHOD".into(), "GET".into());
    req.params.insert("SCRIPT_FILENAME".into(), "/x.php".into());

    let pipe = client.send(req).await.unwrap();
    let mut responder = MockResponder::default();
    let mut stderr = Vec::new();
    pipe.write_to(&mut responder, &mut stderr).await.unwrap();

    assert_eq!(responder.status, Some(StatusCode::OK));
    assert_eq!(
        responder.headers.get("content-type").unwrap(),
        "text/plain"
    );
    assert_eq!(responder.body, b"ok");
    assert!(stderr.is_empty(), "stderr: {:?}", String::from_utf8_lossy(&stderr));

    server.await.unwrap();
}

#[tokio::test]
async fn post_body_becomes_one_stdin_record() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let (record_type, request_id, _, _, _) = read_raw_record(&mut stream).await;
        assert_eq!(record_type, FCGI_BEGIN_REQUEST);
        let params_records = read_stream_records(&mut stream, FCGI_PARAMS).await;
        let params = decode_params(&params_records.concat());
        assert_eq!(params.get("CONTENT_LENGTH").map(String::as_str), Some("5"));

        let stdin_records = read_stream_records(&mut stream, FCGI_STDIN).await;
        assert_eq!(stdin_records.len(), 1);
        assert_eq!(stdin_records[0], b"hello");

        let cgi = b"Content-Type: text/plain\r\n\r\ndone";
        stream
            .write_all(&encode_record(FCGI_STDOUT, request_id, cgi))
            .await
            .unwrap();
        let mut end = [0u8; 8];
        end[4] = FCGI_REQUEST_COMPLETE;
        stream
            .write_all(&encode_record(FCGI_END_REQUEST, request_id, &end))
            .await
            .unwrap();
    });

    let client = connected_client(addr).await;
    let mut req = FcgiRequest::new(Role::Responder);
    req.params.insert("REQUEST_METHOD".into(), "POST".into());
    req.params.insert("CONTENT_LENGTH".into(), "5".into());
    req.stdin = Some(Box::new(std::io::Cursor::new(b"hello".to_vec())));

    let pipe = client.send(req).await.unwrap();
    let mut responder = MockResponder::default();
    let mut stderr = Vec::new();
    pipe.write_to(&mut responder, &mut stderr).await.unwrap();
    assert_eq!(responder.body, b"done");

    server.await.unwrap();
}

#[tokio::test]
async fn oversize_body_splits_into_max_size_records() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let (record_type, request_id, _, _, _) = read_raw_record(&mut stream).await;
        assert_eq!(record_type, FCGI_BEGIN_REQUEST);
        read_stream_records(&mut stream, FCGI_PARAMS).await;

        let stdin_records = read_stream_records(&mut stream, FCGI_STDIN).await;
        let lengths: Vec<usize> = stdin_records.iter().map(Vec::len).collect();
        assert_eq!(lengths, vec![65_535, 65_535, 65_535, 3_395]);
        let total: usize = lengths.iter().sum();
        assert_eq!(total, 200_000);
        for record in &stdin_records {
            assert!(record.iter().all(|&b| b == 0x42));
        }

        let cgi = b"Content-Type: text/plain\r\n\r\n";
        stream
            .write_all(&encode_record(FCGI_STDOUT, request_id, cgi))
            .await
            .unwrap();
        let mut end = [0u8; 8];
        end[4] = FCGI_REQUEST_COMPLETE;
        stream
            .write_all(&encode_record(FCGI_END_REQUEST, request_id, &end))
            .await
            .unwrap();
    });

    let client = connected_client(addr).await;
    let mut req = FcgiRequest::new(Role::Responder);
    req.stdin = Some(Box::new(std::io::Cursor::new(vec![0x42u8; 200_000])));

    let pipe = client.send(req).await.unwrap();
    let mut responder = MockResponder::default();
    let mut stderr = Vec::new();
    pipe.write_to(&mut responder, &mut stderr).await.unwrap();
    assert_eq!(responder.status, Some(StatusCode::OK));

    server.await.unwrap();
}

#[tokio::test]
async fn stderr_only_response_is_a_500_with_the_error_delivered() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let (_, request_id, _, _, _) = read_raw_record(&mut stream).await;
        read_stream_records(&mut stream, FCGI_PARAMS).await;
        read_stream_records(&mut stream, FCGI_STDIN).await;

        stream
            .write_all(&encode_record(FCGI_STDERR, request_id, b"fatal"))
            .await
            .unwrap();
        let mut end = [0u8; 8];
        end[4] = FCGI_REQUEST_COMPLETE;
        stream
            .write_all(&encode_record(FCGI_END_REQUEST, request_id, &end))
            .await
            .unwrap();
    });

    let client = connected_client(addr).await;
    let pipe = client.send(FcgiRequest::new(Role::Responder)).await.unwrap();
    let mut responder = MockResponder::default();
    let mut stderr = Vec::new();
    let err = pipe.write_to(&mut responder, &mut stderr).await.unwrap_err();

    assert!(err.to_string().contains("no headers"), "err: {err}");
    assert_eq!(responder.status, Some(StatusCode::INTERNAL_SERVER_ERROR));
    assert!(String::from_utf8_lossy(&stderr).contains("fatal"));

    server.await.unwrap();
}

#[tokio::test]
async fn cancellation_reports_timeout_or_canceled() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // A server that accepts the request but never responds.
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_raw_record(&mut stream).await;
        read_stream_records(&mut stream, FCGI_PARAMS).await;
        read_stream_records(&mut stream, FCGI_STDIN).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let client = connected_client(addr).await;
    let req = FcgiRequest::new(Role::Responder);
    let cancel = req.cancel.clone();
    let pipe = client.send(req).await.unwrap();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let mut responder = MockResponder::default();
    let mut stderr = Vec::new();
    let result = timeout(
        Duration::from_secs(5),
        pipe.write_to(&mut responder, &mut stderr),
    )
    .await
    .expect("write_to did not finish after cancellation");

    assert!(result.is_err());
    assert!(
        String::from_utf8_lossy(&stderr).contains("timeout or canceled"),
        "stderr: {:?}",
        String::from_utf8_lossy(&stderr)
    );

    server.abort();
}

#[tokio::test]
async fn unexpected_record_type_is_diagnosed_not_fatal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (_, request_id, _, _, _) = read_raw_record(&mut stream).await;
        read_stream_records(&mut stream, FCGI_PARAMS).await;
        read_stream_records(&mut stream, FCGI_STDIN).await;

        // A Data record has no business in a responder's output.
        stream
            .write_all(&encode_record(8, request_id, b"bogus"))
            .await
            .unwrap();
        let cgi = b"Content-Type: text/plain\r\n\r\nstill fine";
        stream
            .write_all(&encode_record(FCGI_STDOUT, request_id, cgi))
            .await
            .unwrap();
        let mut end = [0u8; 8];
        end[4] = FCGI_REQUEST_COMPLETE;
        stream
            .write_all(&encode_record(FCGI_END_REQUEST, request_id, &end))
            .await
            .unwrap();
    });

    let client = connected_client(addr).await;
    let pipe = client.send(FcgiRequest::new(Role::Responder)).await.unwrap();
    let mut responder = MockResponder::default();
    let mut stderr = Vec::new();
    pipe.write_to(&mut responder, &mut stderr).await.unwrap();

    assert_eq!(responder.body, b"still fine");
    assert!(String::from_utf8_lossy(&stderr).contains("unexpected type 8 in read loop"));

    server.await.unwrap();
}

#[tokio::test]
async fn send_without_connection_fails_fast() {
    let backend = Backend::parse("127.0.0.1:1").unwrap();
    let client = Client::new(Arc::new(SimpleConnFactory::new(backend)), 0);
    let err = client
        .send(FcgiRequest::new(Role::Responder))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("connection has been closed"));
}

#[tokio::test]
async fn id_pool_hands_out_distinct_ids_and_reuses_released_ones() {
    let pool = Arc::new(IdPool::new(2));
    let first = pool.alloc().await;
    let second = pool.alloc().await;
    assert_ne!(first, second);

    // Both ids are out; the next allocation must block.
    let blocked = timeout(Duration::from_millis(100), pool.alloc()).await;
    assert!(blocked.is_err(), "alloc should block with no free ids");

    pool.release(first);
    let reused = timeout(Duration::from_secs(1), pool.alloc())
        .await
        .expect("release should unblock alloc");
    assert_eq!(reused, first);
}
