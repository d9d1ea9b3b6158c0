//! Middleware chain primitives.

use crate::http::request::Request;
use crate::http::response::Response;

/// Chain control decision returned by each middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Ends the chain early. The response as built so far is
    /// serialized; the handler does not run. Not an error.
    Stop,
}

/// Synchronous middleware run between route resolution and the handler.
///
/// The chain runs in registration order and only for dynamically
/// dispatched requests; precomputed routes reply before the chain.
pub trait Middleware: Send + Sync {
    /// Cheap per-request filter. Skipped middleware does not break the
    /// chain.
    fn applies(&self, _req: &Request<'_>) -> bool {
        true
    }

    fn handle(&self, req: &Request<'_>, resp: &mut Response) -> Flow;
}
