use lectern_core::parser::Parser;
use lectern_core::{Routes, Server, ServerConfig, ShutdownHandle, syscalls};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

fn routes() -> Routes {
    let mut routes = Routes::new();
    routes.get("/plaintext", |_, _, res| {
        res.body_static(b"Hello, world!\n");
    });
    routes.post("/lessons/:id/answer", |req, params, res| {
        let id = params.get("id").unwrap_or("?");
        res.text(&format!("lesson {} got {} bytes: ", id, req.body().len()));
        res.body(req.body());
    });
    routes.get("/whoami", |req, _, res| {
        res.text(req.cookie("session").unwrap_or("anonymous"));
    });
    routes.get("/panic", |_, _, _| panic!("boom"));
    routes.get("/echo/*rest", |req, _, res| {
        // Re-emit the request head as the body.
        let mut head = format!("{} {} HTTP/1.1\r\n", req.method(), req.uri());
        for (name, value) in req.headers() {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("\r\n");
        res.content_type("message/http");
        res.body(head.as_bytes());
    });
    routes
}

struct TestServer {
    addr: SocketAddr,
    shutdown: ShutdownHandle,
    handle: Option<JoinHandle<lectern_core::LecternResult<()>>>,
    metrics: std::sync::Arc<lectern_core::ServerMetrics>,
}

impl TestServer {
    fn start() -> Self {
        Self::start_with(ServerConfig::default())
    }

    fn start_with(config: ServerConfig) -> Self {
        let config = config
            .port(0)
            .workers(2)
            .pin_workers(false)
            .handle_signals(false);
        let server = Server::bind(config).unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let metrics = server.metrics();
        let handle = thread::spawn(move || server.serve(routes()));
        Self {
            addr,
            shutdown,
            handle: Some(handle),
            metrics,
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.shutdown();
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap().unwrap();
        }
    }
}

struct Reply {
    head: String,
    body: Vec<u8>,
}

impl Reply {
    fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (k, v) = line.split_once(':')?;
            k.eq_ignore_ascii_case(name).then(|| v.trim())
        })
    }
}

/// Read one response; `head_only` skips the body for HEAD requests.
fn read_reply(stream: &mut TcpStream, head_only: bool) -> Reply {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).unwrap();
        assert_eq!(n, 1, "connection closed mid-head: {:?}", String::from_utf8_lossy(&raw));
        raw.push(byte[0]);
    }
    let mut reply = Reply {
        head: String::from_utf8(raw).unwrap(),
        body: Vec::new(),
    };
    let len: usize = reply.header("content-length").unwrap().parse().unwrap();
    if !head_only {
        reply.body = vec![0; len];
        stream.read_exact(&mut reply.body).unwrap();
    }
    reply
}

fn read_to_close(stream: &mut TcpStream) -> String {
    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    String::from_utf8_lossy(&out).into_owned()
}

#[test]
fn pipelined_gets_answered_in_order() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream
        .write_all(b"GET /plaintext HTTP/1.1\r\n\r\nGET /plaintext HTTP/1.1\r\n\r\n")
        .unwrap();

    for _ in 0..2 {
        let reply = read_reply(&mut stream, false);
        assert!(reply.head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(reply.body, b"Hello, world!\n");
        assert!(reply.header("connection").is_none());
        assert!(reply.header("date").is_some());
    }

    // Still open for a third request.
    stream.write_all(b"GET /plaintext HTTP/1.1\r\n\r\n").unwrap();
    assert_eq!(read_reply(&mut stream, false).body, b"Hello, world!\n");
}

#[test]
fn unknown_method_gets_405_and_close() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream.write_all(b"PUT / HTTP/1.1\r\n\r\n").unwrap();
    let out = read_to_close(&mut stream);
    assert!(out.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
    assert!(out.contains("Connection: close\r\n"));
    assert!(out.ends_with("\r\n\r\nMethod Not Allowed"));
}

#[test]
fn oversized_request_line_gets_413() {
    let size = syscalls::page_size();
    let server = TestServer::start_with(ServerConfig::default().buffer_size(size));
    let mut stream = server.connect();

    let mut raw = b"GET /".to_vec();
    raw.resize(size, b'x');
    stream.write_all(&raw).unwrap();

    let out = read_to_close(&mut stream);
    assert!(out.starts_with("HTTP/1.1 413 Request Entity Too Large\r\n"));
    assert!(out.contains("Connection: close\r\n"));
    assert_eq!(out.matches("HTTP/1.1 ").count(), 1);
    assert_no_further_replies(&mut stream);
}

/// Once the server has answered with an error, nothing else comes back.
fn assert_no_further_replies(stream: &mut TcpStream) {
    let _ = stream.write_all(b"GET /plaintext HTTP/1.1\r\n\r\n");
    let mut buf = [0u8; 64];
    if let Ok(n) = stream.read(&mut buf) {
        assert_eq!(n, 0, "unexpected data: {:?}", String::from_utf8_lossy(&buf[..n]));
    }
}

#[test]
fn declared_body_larger_than_buffer_gets_413() {
    let size = syscalls::page_size();
    let server = TestServer::start_with(ServerConfig::default().buffer_size(size));
    let mut stream = server.connect();
    let raw = format!(
        "POST /lessons/1/answer HTTP/1.1\r\nContent-Length: {}\r\n\r\nabc",
        size * 4
    );
    stream.write_all(raw.as_bytes()).unwrap();

    let out = read_to_close(&mut stream);
    assert!(out.starts_with("HTTP/1.1 413 Request Entity Too Large\r\n"));
    assert!(out.contains("Connection: close\r\n"));
    assert_eq!(out.matches("HTTP/1.1 ").count(), 1);
    assert_no_further_replies(&mut stream);
}

#[test]
fn overflowing_content_length_gets_400_and_worker_survives() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream
        .write_all(b"POST /lessons/1/answer HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n")
        .unwrap();
    let out = read_to_close(&mut stream);
    assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"));

    for _ in 0..4 {
        let mut stream = server.connect();
        stream.write_all(b"GET /plaintext HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(read_reply(&mut stream, false).body, b"Hello, world!\n");
    }
}

#[test]
fn malformed_request_gets_400() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream.write_all(b"GET / HTTP/one\r\n\r\n").unwrap();
    let out = read_to_close(&mut stream);
    assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(out.ends_with("Bad Request"));
}

#[test]
fn chunked_upload_gets_501() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream
        .write_all(b"POST /lessons/1/answer HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n")
        .unwrap();
    let out = read_to_close(&mut stream);
    assert!(out.starts_with("HTTP/1.1 501 Not Implemented\r\n"));
}

#[test]
fn post_body_and_params_reach_the_handler() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream
        .write_all(b"POST /lessons/42/answer HTTP/1.1\r\nContent-Length: 5\r\n\r\n")
        .unwrap();
    thread::sleep(Duration::from_millis(20));
    stream.write_all(b"a=b&c").unwrap();

    let reply = read_reply(&mut stream, false);
    assert_eq!(reply.body, b"lesson 42 got 5 bytes: a=b&c");
    assert_eq!(
        reply.header("content-type"),
        Some("text/plain; charset=utf-8")
    );
}

#[test]
fn head_omits_body_but_keeps_length() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream
        .write_all(b"HEAD /plaintext HTTP/1.1\r\n\r\nGET /plaintext HTTP/1.1\r\n\r\n")
        .unwrap();

    let head = read_reply(&mut stream, true);
    assert_eq!(head.header("content-length"), Some("14"));
    // The next bytes on the wire belong to the second response.
    let get = read_reply(&mut stream, false);
    assert!(get.head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(get.body, b"Hello, world!\n");
}

#[test]
fn unknown_path_is_404_and_keeps_connection() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream.write_all(b"GET /nowhere HTTP/1.1\r\n\r\n").unwrap();
    let reply = read_reply(&mut stream, false);
    assert!(reply.head.starts_with("HTTP/1.1 404 Not Found\r\n"));
    stream.write_all(b"GET /plaintext HTTP/1.1\r\n\r\n").unwrap();
    assert_eq!(read_reply(&mut stream, false).body, b"Hello, world!\n");
}

#[test]
fn handler_panic_becomes_500_and_worker_survives() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream.write_all(b"GET /panic HTTP/1.1\r\n\r\n").unwrap();
    let out = read_to_close(&mut stream);
    assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert!(out.contains("Connection: close\r\n"));

    let mut again = server.connect();
    again.write_all(b"GET /plaintext HTTP/1.1\r\n\r\n").unwrap();
    assert_eq!(read_reply(&mut again, false).body, b"Hello, world!\n");
}

#[test]
fn cookies_are_visible_to_handlers() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream
        .write_all(b"GET /whoami HTTP/1.1\r\nCookie: theme=dark; session=u-17\r\n\r\n")
        .unwrap();
    assert_eq!(read_reply(&mut stream, false).body, b"u-17");
}

#[test]
fn client_connection_close_is_honoured() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream
        .write_all(b"GET /plaintext HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let out = read_to_close(&mut stream);
    assert!(out.contains("Connection: close\r\n"));
    assert!(out.ends_with("Hello, world!\n"));
}

#[test]
fn echoed_request_head_parses_again() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream
        .write_all(b"GET /echo/a/b?x=1 HTTP/1.1\r\nHost: lectern\r\nAccept: */*\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut stream, false);

    let mut parser = Parser::new();
    let len = parser.advance(&reply.body).unwrap().unwrap();
    assert_eq!(len, reply.body.len());
    let req = lectern_core::Request::new(&reply.body, parser.head());
    assert_eq!(req.path(), "/echo/a/b");
    assert_eq!(req.query(), Some("x=1"));
    assert_eq!(req.header("host"), Some("lectern"));
    assert_eq!(req.header("accept"), Some("*/*"));
}

#[test]
fn shutdown_handle_stops_workers_and_keeps_counts() {
    let mut server = TestServer::start();
    let mut stream = server.connect();
    stream.write_all(b"GET /plaintext HTTP/1.1\r\n\r\n").unwrap();
    read_reply(&mut stream, false);

    server.shutdown.shutdown();
    server.handle.take().unwrap().join().unwrap().unwrap();
    let snap = server.metrics.snapshot();
    assert_eq!(snap.requests, 1);
    assert!(snap.bytes_written > 0);
    assert_eq!(snap.active_connections, 0);
}

#[test]
fn idle_connections_are_closed_when_enabled() {
    let server = TestServer::start_with(ServerConfig::default().idle_timeout_secs(1));
    let mut stream = server.connect();
    // No request; the per-second sweep closes the socket within a few ticks.
    let mut buf = [0u8; 1];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
}
