//! End-to-end tests over real sockets.

use async_trait::async_trait;
use shard_web::limits::{ListenerLimits, ServerLimits};
use shard_web::{
    Flow, Handler, HandlerError, Method, Middleware, Request, Response, Route, RouteGroup, Router,
    Server, ServerHandle, StatusCode, Version,
};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Once;

fn init_logs() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

struct EchoParam(&'static str);

#[async_trait]
impl Handler for EchoParam {
    async fn handle(&self, _req: &Request<'_>, resp: &mut Response) -> Result<(), HandlerError> {
        let value = resp.param(self.0).unwrap_or("missing").to_owned();
        resp.status(StatusCode::Ok).body(value);
        Ok(())
    }
}

struct EchoTail;

#[async_trait]
impl Handler for EchoTail {
    async fn handle(&self, _req: &Request<'_>, resp: &mut Response) -> Result<(), HandlerError> {
        // a catchall binds one "*" entry per trailing segment
        let tail = resp
            .params()
            .filter(|(name, _)| *name == "*")
            .map(|(_, value)| value)
            .collect::<Vec<_>>()
            .join("/");
        resp.status(StatusCode::Ok).body(tail);
        Ok(())
    }
}

struct EchoBody;

#[async_trait]
impl Handler for EchoBody {
    async fn handle(&self, req: &Request<'_>, resp: &mut Response) -> Result<(), HandlerError> {
        resp.status(StatusCode::Ok).body(req.body().to_vec());
        Ok(())
    }
}

struct Fails;

#[async_trait]
impl Handler for Fails {
    async fn handle(&self, _req: &Request<'_>, _resp: &mut Response) -> Result<(), HandlerError> {
        Err(HandlerError::msg("deliberate"))
    }
}

struct Teapot;

#[async_trait]
impl Handler for Teapot {
    async fn handle(&self, _req: &Request<'_>, resp: &mut Response) -> Result<(), HandlerError> {
        resp.status(StatusCode::ImaTeapot).body("short and stout");
        Ok(())
    }
}

struct Chunks;

#[async_trait]
impl Handler for Chunks {
    async fn handle(&self, _req: &Request<'_>, resp: &mut Response) -> Result<(), HandlerError> {
        let mut parts = vec![b"world".to_vec(), b"hello ".to_vec()];
        resp.status(StatusCode::Ok).stream(move || parts.pop());
        Ok(())
    }
}

struct EchoExt(&'static str);

#[async_trait]
impl Handler for EchoExt {
    async fn handle(&self, _req: &Request<'_>, resp: &mut Response) -> Result<(), HandlerError> {
        let value = resp.ext(self.0).unwrap_or("unset").to_owned();
        resp.status(StatusCode::Ok).body(value);
        Ok(())
    }
}

/// Tags every request it applies to and lets the chain continue.
struct Tagger;

impl Middleware for Tagger {
    fn applies(&self, req: &Request<'_>) -> bool {
        req.path() == "/tagged"
    }

    fn handle(&self, _req: &Request<'_>, resp: &mut Response) -> Flow {
        resp.set_ext("trace", "t-123");
        Flow::Continue
    }
}

/// Stops the chain with a 403 for anything under /gate.
struct Gatekeeper;

impl Middleware for Gatekeeper {
    fn applies(&self, req: &Request<'_>) -> bool {
        req.path().starts_with("/gate")
    }

    fn handle(&self, _req: &Request<'_>, resp: &mut Response) -> Flow {
        resp.status(StatusCode::Forbidden).body("blocked");
        Flow::Stop
    }
}

fn fixed(path: &str, body: &str) -> Route {
    let mut resp = Response::new(Version::Http11);
    resp.status(StatusCode::Ok).body(body);
    Route::fixed(Method::Get, Version::Http11, path, true, resp).unwrap()
}

fn base_router() -> Router {
    let mut about = Response::new(Version::Http11);
    about.status(StatusCode::Ok).body("about page");

    let mut router = Router::new();
    router
        .route(fixed("/ping", "pong"))
        .unwrap()
        .route(Route::fixed(Method::Get, Version::Http11, "/About", false, about).unwrap())
        .unwrap()
        .route(
            Route::dynamic(Method::Get, Version::Http11, "/users/:id", true, EchoParam("id"))
                .unwrap(),
        )
        .unwrap()
        .route(
            Route::dynamic(Method::Get, Version::Http11, "/files/*", true, EchoTail)
                .unwrap(),
        )
        .unwrap()
        .route(Route::dynamic(Method::Post, Version::Http11, "/echo", true, EchoBody).unwrap())
        .unwrap()
        .route(Route::dynamic(Method::Get, Version::Http11, "/fail", true, Fails).unwrap())
        .unwrap()
        .route(Route::dynamic(Method::Get, Version::Http11, "/stream", true, Chunks).unwrap())
        .unwrap()
        .route(Route::dynamic(Method::Get, Version::Http11, "/gate/in", true, EchoParam("none")).unwrap())
        .unwrap()
        .route(Route::dynamic(Method::Get, Version::Http11, "/tagged", true, EchoExt("trace")).unwrap())
        .unwrap()
        .group(
            RouteGroup::new("admin")
                .route(
                    Route::dynamic(Method::Get, Version::Http11, "/admin/:area", true, EchoParam("area"))
                        .unwrap(),
                )
                .unwrap(),
        )
        .middleware(Tagger)
        .middleware(Gatekeeper);
    router
}

fn start(router: Router) -> ServerHandle {
    init_logs();

    Server::builder(router)
        .listener_limits(ListenerLimits {
            port: 0,
            ..ListenerLimits::default()
        })
        .server_limits(ServerLimits {
            shards: 2,
            workers: 4,
            ..ServerLimits::default()
        })
        .build()
        .run()
        .unwrap()
}

/// One-shot exchange: write, half-close, read everything back.
fn send(addr: SocketAddr, raw: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(raw).unwrap();
    stream.shutdown(Shutdown::Write).unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).unwrap();
    String::from_utf8(reply).unwrap()
}

/// Reads exactly one content-length-framed response off the stream.
fn read_response(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];

    loop {
        if let Some(at) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = std::str::from_utf8(&buf[..at]).unwrap();
            let len: usize = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length: "))
                .map(|v| v.parse().unwrap())
                .unwrap_or(0);

            let total = at + 4 + len;
            while buf.len() < total {
                let n = stream.read(&mut tmp).unwrap();
                assert!(n > 0, "closed mid-body");
                buf.extend_from_slice(&tmp[..n]);
            }
            return String::from_utf8(buf[..total].to_vec()).unwrap();
        }

        let n = stream.read(&mut tmp).unwrap();
        assert!(n > 0, "closed mid-head");
        buf.extend_from_slice(&tmp[..n]);
    }
}

fn body_of(reply: &str) -> &str {
    reply.split("\r\n\r\n").nth(1).unwrap_or("")
}

#[test]
fn fixed_route_round_trip() {
    let handle = start(base_router());

    let reply = send(handle.local_addr(), b"GET /ping HTTP/1.1\r\nconnection: close\r\n\r\n");
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{reply}");
    assert_eq!(body_of(&reply), "pong");

    handle.shutdown();
}

#[test]
fn dynamic_route_binds_declared_params() {
    let handle = start(base_router());

    let reply = send(handle.local_addr(), b"GET /users/42 HTTP/1.1\r\nconnection: close\r\n\r\n");
    assert_eq!(body_of(&reply), "42");

    handle.shutdown();
}

#[test]
fn catchall_binds_the_remaining_segments() {
    let handle = start(base_router());

    let reply = send(
        handle.local_addr(),
        b"GET /files/a/b/c HTTP/1.1\r\nconnection: close\r\n\r\n",
    );
    assert_eq!(body_of(&reply), "a/b/c");

    handle.shutdown();
}

#[test]
fn insensitive_route_matches_any_case() {
    let handle = start(base_router());
    let addr = handle.local_addr();

    for raw in [
        b"GET /about HTTP/1.1\r\nconnection: close\r\n\r\n".as_slice(),
        b"GET /ABOUT HTTP/1.1\r\nconnection: close\r\n\r\n".as_slice(),
    ] {
        let reply = send(addr, raw);
        assert_eq!(body_of(&reply), "about page", "{reply}");
    }

    handle.shutdown();
}

#[test]
fn group_routes_resolve_after_the_root() {
    let handle = start(base_router());

    let reply = send(
        handle.local_addr(),
        b"GET /admin/billing HTTP/1.1\r\nconnection: close\r\n\r\n",
    );
    assert_eq!(body_of(&reply), "billing");

    handle.shutdown();
}

#[test]
fn unmatched_request_gets_the_canned_not_found() {
    let handle = start(base_router());

    let reply = send(
        handle.local_addr(),
        b"DELETE /nowhere HTTP/1.1\r\nconnection: close\r\n\r\n",
    );
    assert!(reply.starts_with("HTTP/1.1 404 Not Found\r\n"), "{reply}");
    assert!(reply.contains("connection: close"), "{reply}");

    handle.shutdown();
}

#[test]
fn configured_not_found_responder_takes_over() {
    let mut router = base_router();
    router.not_found(Teapot);
    let handle = start(router);

    let reply = send(
        handle.local_addr(),
        b"GET /nowhere HTTP/1.1\r\nconnection: close\r\n\r\n",
    );
    assert!(reply.starts_with("HTTP/1.1 418 "), "{reply}");
    assert_eq!(body_of(&reply), "short and stout");

    handle.shutdown();
}

#[test]
fn keep_alive_serves_sequential_requests() {
    let handle = start(base_router());

    let mut stream = TcpStream::connect(handle.local_addr()).unwrap();

    stream.write_all(b"GET /ping HTTP/1.1\r\n\r\n").unwrap();
    let first = read_response(&mut stream);
    assert!(first.contains("connection: keep-alive"), "{first}");
    assert_eq!(body_of(&first), "pong");

    stream.write_all(b"GET /users/7 HTTP/1.1\r\n\r\n").unwrap();
    let second = read_response(&mut stream);
    assert_eq!(body_of(&second), "7");

    drop(stream);
    handle.shutdown();
}

#[test]
fn middleware_extensions_reach_the_handler() {
    let handle = start(base_router());

    let reply = send(
        handle.local_addr(),
        b"GET /tagged HTTP/1.1\r\nconnection: close\r\n\r\n",
    );
    assert_eq!(body_of(&reply), "t-123");

    handle.shutdown();
}

#[test]
fn middleware_stop_short_circuits_the_handler() {
    let handle = start(base_router());

    let reply = send(
        handle.local_addr(),
        b"GET /gate/in HTTP/1.1\r\nconnection: close\r\n\r\n",
    );
    assert!(reply.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{reply}");
    assert_eq!(body_of(&reply), "blocked");

    handle.shutdown();
}

#[test]
fn failed_handler_without_responder_gets_a_500() {
    let handle = start(base_router());

    let reply = send(handle.local_addr(), b"GET /fail HTTP/1.1\r\n\r\n");
    assert!(reply.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{reply}");

    handle.shutdown();
}

#[test]
fn error_responder_renders_handler_failures() {
    let mut router = base_router();
    router.error_responder(Teapot);
    let handle = start(router);

    let reply = send(handle.local_addr(), b"GET /fail HTTP/1.1\r\n\r\n");
    assert!(reply.starts_with("HTTP/1.1 418 "), "{reply}");
    assert_eq!(body_of(&reply), "short and stout");
    // errored requests always close
    assert!(reply.contains("connection: close"), "{reply}");

    handle.shutdown();
}

#[test]
fn request_body_reaches_the_handler() {
    let handle = start(base_router());

    let reply = send(
        handle.local_addr(),
        b"POST /echo HTTP/1.1\r\ncontent-length: 11\r\nconnection: close\r\n\r\nhello world",
    );
    assert_eq!(body_of(&reply), "hello world");

    handle.shutdown();
}

#[test]
fn streamed_response_uses_chunked_encoding() {
    let handle = start(base_router());

    let reply = send(handle.local_addr(), b"GET /stream HTTP/1.1\r\nconnection: close\r\n\r\n");
    assert!(reply.contains("transfer-encoding: chunked"), "{reply}");
    assert!(reply.contains("6\r\nhello \r\n"), "{reply}");
    assert!(reply.contains("5\r\nworld\r\n"), "{reply}");
    assert!(reply.ends_with("0\r\n\r\n"), "{reply}");

    handle.shutdown();
}

#[test]
fn malformed_request_closes_without_a_reply() {
    let handle = start(base_router());

    let reply = send(handle.local_addr(), b"NOT A REQUEST\r\n\r\n");
    assert!(reply.is_empty(), "{reply}");

    handle.shutdown();
}
