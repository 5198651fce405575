//! End-to-end tests against a live endpoint on a loopback socket.

use hearth::config::EndpointConfig;
use hearth::container::pipeline::PipelineError;
use hearth::container::{Container, RequestHandler};
use hearth::http::processor::Http11ConnectionHandler;
use hearth::http::request::{Request, Response};
use hearth::lifecycle::Lifecycle;
use hearth::net::endpoint::Endpoint;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

/// Echoes the request line and body back to the client.
struct EchoHandler;

impl RequestHandler for EchoHandler {
    fn handle(&self, request: &mut Request, response: &mut Response) -> Result<(), PipelineError> {
        response.set_header("content-type", "text/plain")?;
        response.write(request.method.as_bytes())?;
        response.write(b" ")?;
        response.write(request.uri.as_bytes())?;
        if !request.query.is_empty() {
            response.write(b"?")?;
            response.write(request.query.as_bytes())?;
        }
        if !request.body.is_empty() {
            response.write(b"|")?;
            response.write(&request.body)?;
        }
        Ok(())
    }
}

/// Serves a fixed file through the send-file path.
struct FileHandler {
    path: std::path::PathBuf,
    length: u64,
}

impl RequestHandler for FileHandler {
    fn handle(&self, _request: &mut Request, response: &mut Response) -> Result<(), PipelineError> {
        response.send_file(self.path.clone(), 0, self.length)?;
        Ok(())
    }
}

fn engine_with(handler: Arc<dyn RequestHandler>) -> Arc<Container> {
    let engine = Container::new_engine("test", "localhost", None);
    let host = Container::new_host("localhost", None);
    let context = Container::new_context("", None);

    context
        .add_child(Container::new_wrapper("default", handler, None))
        .unwrap();
    context.add_servlet_mapping("/", "default");

    host.add_child(context).unwrap();
    engine.add_child(host).unwrap();

    engine.init().unwrap();
    engine.start().unwrap();
    engine
}

fn test_config() -> EndpointConfig {
    EndpointConfig {
        address: "127.0.0.1".to_string(),
        port: 0,
        worker_threads: 4,
        selector_timeout_ms: 100,
        ..EndpointConfig::default()
    }
}

fn start(config: EndpointConfig, handler: Arc<dyn RequestHandler>) -> (Endpoint, SocketAddr) {
    let engine = engine_with(handler);
    let http = Http11ConnectionHandler::new(engine, config.clone(), None);
    let endpoint = Endpoint::new(config, Arc::new(http), None);

    endpoint.init().unwrap();
    endpoint.start().unwrap();

    let addr = endpoint.local_addr().expect("Endpoint must be bound");
    (endpoint, addr)
}

/// Minimal client-side response reader.
fn read_response(stream: &mut TcpStream) -> std::io::Result<(u16, HashMap<String, String>, Vec<u8>)> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        let count = stream.read(&mut byte)?;
        if count == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        head.push(byte[0]);
        if head.len() > 64 * 1024 {
            panic!("Response head too large");
        }
    }

    let text = String::from_utf8_lossy(&head);
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap();
    let status: u16 = status_line.split(' ').nth(1).unwrap().parse().unwrap();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let length: usize = headers
        .get("content-length")
        .map(|value| value.parse().unwrap())
        .unwrap_or(0);

    let mut body = vec![0u8; length];
    stream.read_exact(&mut body)?;

    Ok((status, headers, body))
}

fn read_to_end(stream: &mut TcpStream) -> Vec<u8> {
    let mut data = Vec::new();
    let _ = stream.read_to_end(&mut data);
    data
}

#[test]
fn test_simple_get_round_trip() {
    let (endpoint, addr) = start(test_config(), Arc::new(EchoHandler));

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .write_all(b"GET /x?q=1 HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    let (status, headers, body) = read_response(&mut client).unwrap();

    assert_eq!(status, 200);
    assert_eq!(headers.get("connection").map(String::as_str), Some("keep-alive"));
    assert_eq!(&body, b"GET /x?q=1");

    drop(client);
    endpoint.stop().unwrap();
}

#[test]
fn test_keep_alive_reuse_and_pipelining() {
    let (endpoint, addr) = start(test_config(), Arc::new(EchoHandler));

    let mut client = TcpStream::connect(addr).unwrap();

    // Sequential reuse.
    client
        .write_all(b"GET /one HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let (_, _, body) = read_response(&mut client).unwrap();
    assert_eq!(&body, b"GET /one");

    client
        .write_all(b"GET /two HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let (_, _, body) = read_response(&mut client).unwrap();
    assert_eq!(&body, b"GET /two");

    // Pipelined pair in one write.
    client
        .write_all(
            b"GET /a HTTP/1.1\r\nHost: localhost\r\n\r\nGET /b HTTP/1.1\r\nHost: localhost\r\n\r\n",
        )
        .unwrap();

    let (_, _, first) = read_response(&mut client).unwrap();
    let (_, _, second) = read_response(&mut client).unwrap();
    assert_eq!(&first, b"GET /a");
    assert_eq!(&second, b"GET /b");

    // The whole exchange rode one connection.
    assert_eq!(endpoint.connection_count(), 1);

    drop(client);
    endpoint.stop().unwrap();
}

#[test]
fn test_post_content_length_body() {
    let (endpoint, addr) = start(test_config(), Arc::new(EchoHandler));

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .write_all(b"POST /in HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello")
        .unwrap();

    let (status, _, body) = read_response(&mut client).unwrap();
    assert_eq!(status, 200);
    assert_eq!(&body, b"POST /in|hello");

    endpoint.stop().unwrap();
}

#[test]
fn test_post_chunked_body() {
    let (endpoint, addr) = start(test_config(), Arc::new(EchoHandler));

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .write_all(
            b"POST /c HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        )
        .unwrap();

    let (status, _, body) = read_response(&mut client).unwrap();
    assert_eq!(status, 200);
    assert_eq!(&body, b"POST /c|hello world");

    endpoint.stop().unwrap();
}

#[test]
fn test_bad_method_yields_400_and_close() {
    let (endpoint, addr) = start(test_config(), Arc::new(EchoHandler));

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"G(T / HTTP/1.1\r\n\r\n").unwrap();

    let (status, headers, _) = read_response(&mut client).unwrap();
    assert_eq!(status, 400);
    assert_eq!(headers.get("connection").map(String::as_str), Some("close"));

    // Server closes after the error response.
    assert!(read_to_end(&mut client).is_empty());

    endpoint.stop().unwrap();
}

#[test]
fn test_http_09_body_only() {
    let (endpoint, addr) = start(test_config(), Arc::new(EchoHandler));

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"GET /y\n").unwrap();

    // No status line, no headers; just the body, then EOF.
    let raw = read_to_end(&mut client);
    assert_eq!(&raw, b"GET /y");

    endpoint.stop().unwrap();
}

#[test]
fn test_http2_preface_closes_gracefully() {
    let (endpoint, addr) = start(test_config(), Arc::new(EchoHandler));

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .write_all(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n")
        .unwrap();

    // No upgrade handler installed; the connection ends without HTTP/1.1
    // bytes on the wire.
    assert!(read_to_end(&mut client).is_empty());

    endpoint.stop().unwrap();
}

#[test]
fn test_idle_timeout_restores_permit() {
    let config = EndpointConfig {
        connection_timeout_ms: 400,
        ..test_config()
    };
    let (endpoint, addr) = start(config, Arc::new(EchoHandler));

    let mut client = TcpStream::connect(addr).unwrap();
    // Partial request, then silence.
    client.write_all(b"GET / HTTP/1.1\r\n").unwrap();

    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(endpoint.connection_count(), 1);
    assert_eq!(endpoint.shared().connection_limit.current(), 1);

    // The sweep closes the connection after the timeout.
    let raw = read_to_end(&mut client);
    assert!(raw.is_empty() || raw.starts_with(b"HTTP/1.1 408"));

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(endpoint.connection_count(), 0);
    assert_eq!(endpoint.shared().connection_limit.current(), 0);

    endpoint.stop().unwrap();
}

#[test]
fn test_pause_resume() {
    let (endpoint, addr) = start(test_config(), Arc::new(EchoHandler));

    endpoint.pause();
    // Let the acceptor observe the gate.
    std::thread::sleep(Duration::from_millis(700));

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .write_all(b"GET /p HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    client
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    let mut probe = [0u8; 1];
    let blocked = matches!(
        client.read(&mut probe),
        Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock
            || err.kind() == std::io::ErrorKind::TimedOut
    );
    assert!(blocked, "paused endpoint must not serve new connections");

    endpoint.resume();

    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let (status, _, body) = read_response(&mut client).unwrap();
    assert_eq!(status, 200);
    assert_eq!(&body, b"GET /p");

    endpoint.stop().unwrap();
}

#[test]
fn test_max_connections_backpressure() {
    let config = EndpointConfig {
        max_connections: 1,
        ..test_config()
    };
    let (endpoint, addr) = start(config, Arc::new(EchoHandler));

    let mut first = TcpStream::connect(addr).unwrap();
    first
        .write_all(b"GET /1 HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let (_, _, body) = read_response(&mut first).unwrap();
    assert_eq!(&body, b"GET /1");

    // The single permit is held by the live keep-alive connection.
    let mut second = TcpStream::connect(addr).unwrap();
    second
        .write_all(b"GET /2 HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    second
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();

    let mut probe = [0u8; 1];
    let blocked = matches!(
        second.read(&mut probe),
        Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock
            || err.kind() == std::io::ErrorKind::TimedOut
    );
    assert!(blocked, "second connection must wait for a permit");

    // Releasing the first connection lets the second through.
    drop(first);
    second
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let (status, _, body) = read_response(&mut second).unwrap();
    assert_eq!(status, 200);
    assert_eq!(&body, b"GET /2");

    endpoint.stop().unwrap();
}

#[test]
fn test_sendfile_round_trip() {
    let path = std::env::temp_dir().join(format!("hearth-sendfile-{}.bin", std::process::id()));
    let payload: Vec<u8> = (0..64 * 1024u32).map(|value| value as u8).collect();
    std::fs::write(&path, &payload).unwrap();

    let handler = FileHandler {
        path: path.clone(),
        length: payload.len() as u64,
    };
    let (endpoint, addr) = start(test_config(), Arc::new(handler));

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .write_all(b"GET /file HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    let (status, headers, body) = read_response(&mut client).unwrap();
    assert_eq!(status, 200);
    assert_eq!(
        headers.get("content-length").map(String::as_str),
        Some("65536")
    );
    assert_eq!(body, payload);

    // The OPEN disposition leaves the connection usable.
    client
        .write_all(b"GET /file HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let (status, _, body) = read_response(&mut client).unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, payload);

    endpoint.stop().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_stop_closes_everything() {
    let (endpoint, addr) = start(test_config(), Arc::new(EchoHandler));

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .write_all(b"GET /live HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let (status, ..) = read_response(&mut client).unwrap();
    assert_eq!(status, 200);
    assert_eq!(endpoint.connection_count(), 1);

    endpoint.stop().unwrap();

    // No wrappers survive the stop; the permit ledger is balanced.
    assert_eq!(endpoint.connection_count(), 0);
    assert_eq!(endpoint.shared().connection_limit.current(), 0);

    // The kept-alive connection was closed under the client.
    assert!(read_to_end(&mut client).is_empty());
}

#[test]
fn test_header_too_large_400() {
    let config = EndpointConfig {
        max_http_header_size: 1024,
        ..test_config()
    };
    let (endpoint, addr) = start(config, Arc::new(EchoHandler));

    let mut client = TcpStream::connect(addr).unwrap();
    let mut raw = b"GET / HTTP/1.1\r\nHost: localhost\r\nPad: ".to_vec();
    raw.extend(std::iter::repeat(b'x').take(2048));
    raw.extend_from_slice(b"\r\n\r\n");
    client.write_all(&raw).unwrap();

    let (status, ..) = read_response(&mut client).unwrap();
    assert_eq!(status, 400);

    endpoint.stop().unwrap();
}
