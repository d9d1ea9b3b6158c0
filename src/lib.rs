//! shard_web - sharded, allocation-conscious HTTP/1.x server
//!
//! An HTTP server substrate built around a small number of fixed ideas:
//! connections are pinned to event-loop shards by file descriptor,
//! requests are parsed zero-copy out of a fixed per-connection buffer,
//! routes resolve through staged tables from cheapest to most general,
//! and responses are serialized into one exact-sized buffer.
//!
//! # Architecture
//!
//! - **Sharded reactor** - N mio-driven event loops, each owning the
//!   connections whose fd hashes to it
//! - **Fixed parse buffers** - sized once from [`limits::ReqLimits`],
//!   never resized during a request
//! - **Lazy request views** - headers and query pairs parse on first
//!   access and memoize, borrowing the connection buffer
//! - **Staged routing** - case-sensitive static, case-insensitive
//!   static, then dynamic patterns, then route groups in order
//! - **Fixed routes** - parameterless routes serialize once at
//!   registration and replay bytes per request
//!
//! # Examples
//!
//! ```no_run
//! use shard_web::{
//!     Handler, HandlerError, Method, Request, Response, Route, Router, Server, StatusCode,
//!     Version,
//! };
//!
//! struct UserName;
//!
//! #[async_trait::async_trait]
//! impl Handler for UserName {
//!     async fn handle(&self, _: &Request<'_>, resp: &mut Response) -> Result<(), HandlerError> {
//!         let id = resp.param("id").unwrap_or("unknown").to_owned();
//!         resp.status(StatusCode::Ok).body(id);
//!         Ok(())
//!     }
//! }
//!
//! let mut router = Router::new();
//! router
//!     .route(Route::dynamic(Method::Get, Version::Http11, "/users/:id", true, UserName).unwrap())
//!     .unwrap();
//!
//! let handle = Server::builder(router).build().run().unwrap();
//! // ... run until shutdown is requested ...
//! handle.shutdown();
//! ```
//!
//! Fixed routes skip parsing-adjacent work entirely:
//! ```
//! use shard_web::{Method, Response, Route, StatusCode, Version};
//!
//! let mut health = Response::new(Version::Http11);
//! health.status(StatusCode::Ok).body("ok");
//!
//! let route = Route::fixed(Method::Get, Version::Http11, "/healthz", true, health).unwrap();
//! ```

pub(crate) mod http {
    pub(crate) mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod net {
    pub(crate) mod reactor;
    pub(crate) mod socket;
}
pub(crate) mod route {
    pub(crate) mod middleware;
    pub(crate) mod route;
    pub(crate) mod router;
    pub(crate) mod table;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod server;
}
pub(crate) mod errors;
pub(crate) mod executor;
pub mod limits;

pub use crate::{
    errors::{HandlerError, ParseError, RegisterError, SetupError},
    http::{
        request::{BodyChunks, Request},
        response::{Body, ChunkSource, Response},
        types::{Method, StatusCode, Version},
    },
    route::{
        middleware::{Flow, Middleware},
        route::{Handler, Route},
        router::{RouteGroup, Router},
    },
    server::server::{Server, ServerBuilder, ServerHandle},
};
