//! Route declarations: path patterns, responders, and the handler trait.

use crate::errors::{HandlerError, RegisterError};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::http::types::{lower_cased, Method, Version};
use async_trait::async_trait;
use std::sync::Arc;

/// Application request handler.
///
/// Implementations run on the worker pool; one handler instance serves
/// every matching request concurrently.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: &Request<'_>, resp: &mut Response) -> Result<(), HandlerError>;
}

/// One segment of a route pattern.
#[derive(Debug, Clone)]
pub(crate) enum Segment {
    Literal(Box<str>),
    /// `:name` — matches any single segment, binds it under `name`.
    Param(Arc<str>),
    /// `*` — matches any suffix, binds each trailing segment.
    Catchall,
}

/// Parsed route pattern, e.g. `/users/:id/posts` or `/files/*`.
#[derive(Debug, Clone)]
pub(crate) struct PathPattern {
    raw: Box<str>,
    pub(crate) segments: Vec<Segment>,
    pub(crate) catchall: bool,
}

impl PathPattern {
    pub(crate) fn parse(path: &str) -> Result<Self, RegisterError> {
        let invalid = |reason| RegisterError::InvalidPattern {
            pattern: path.to_owned(),
            reason,
        };

        if !path.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }

        let mut segments = Vec::new();
        let mut catchall = false;

        if path != "/" {
            for raw in path[1..].split('/') {
                if catchall {
                    return Err(invalid("'*' must be the last segment"));
                }

                segments.push(match raw {
                    "" => {
                        // rejects both "//" and a trailing "/"
                        return Err(invalid("empty segment"));
                    }
                    "*" => {
                        catchall = true;
                        Segment::Catchall
                    }
                    _ if raw.starts_with(':') => {
                        if raw.len() == 1 {
                            return Err(invalid("empty parameter name"));
                        }
                        Segment::Param(Arc::from(&raw[1..]))
                    }
                    _ => Segment::Literal(raw.into()),
                });
            }
        }

        Ok(Self {
            raw: path.into(),
            segments,
            catchall,
        })
    }

    /// No parameters, no catchall: matchable by exact path key.
    pub(crate) fn is_exact(&self) -> bool {
        !self.catchall
            && self
                .segments
                .iter()
                .all(|s| matches!(s, Segment::Literal(_)))
    }

    pub(crate) fn raw(&self) -> &str {
        &self.raw
    }

    /// Segments before the catchall marker, or all of them.
    pub(crate) fn prefix_len(&self) -> usize {
        match self.catchall {
            true => self.segments.len() - 1,
            false => self.segments.len(),
        }
    }

    /// Matches pre-split request segments. For same-count buckets the
    /// lengths already agree; catchall patterns accept any suffix.
    pub(crate) fn matches(&self, segments: &[&str]) -> bool {
        let prefix = self.prefix_len();

        let count_ok = match self.catchall {
            true => segments.len() >= prefix,
            false => segments.len() == prefix,
        };
        if !count_ok {
            return false;
        }

        self.segments[..prefix]
            .iter()
            .zip(segments)
            .all(|(pattern, request)| match pattern {
                Segment::Literal(lit) => lit.as_ref() == *request,
                Segment::Param(_) => true,
                Segment::Catchall => false,
            })
    }

    /// Binds parameters in declared order; a catchall appends every
    /// trailing segment. Values are copied out of the request buffer.
    pub(crate) fn bind(&self, segments: &[&str]) -> Vec<(Arc<str>, Box<str>)> {
        let mut params = Vec::new();

        for (pattern, request) in self.segments.iter().zip(segments) {
            match pattern {
                Segment::Param(name) => params.push((name.clone(), (*request).into())),
                Segment::Catchall | Segment::Literal(_) => {}
            }
        }

        if self.catchall {
            for request in &segments[self.prefix_len()..] {
                params.push((CATCHALL_NAME.clone(), (*request).into()));
            }
        }

        params
    }

    /// Copy with literals and the raw path ASCII-lowercased, for the
    /// case-insensitive shelf.
    pub(crate) fn to_lowercase(&self) -> Self {
        Self {
            raw: lower_cased(&self.raw).into_boxed_str(),
            segments: self
                .segments
                .iter()
                .map(|s| match s {
                    Segment::Literal(lit) => Segment::Literal(lower_cased(lit).into_boxed_str()),
                    other => other.clone(),
                })
                .collect(),
            catchall: self.catchall,
        }
    }
}

static CATCHALL_NAME: once_cell::sync::Lazy<Arc<str>> =
    once_cell::sync::Lazy::new(|| Arc::from("*"));

/// How a matched route answers.
pub(crate) enum Responder {
    /// Precomputed wire bytes, written verbatim.
    Fixed(Arc<[u8]>),
    Dynamic(Arc<dyn Handler>),
}

/// One registered route.
pub struct Route {
    pub(crate) method: Method,
    pub(crate) version: Version,
    pub(crate) pattern: PathPattern,
    pub(crate) case_sensitive: bool,
    pub(crate) responder: Responder,
}

impl Route {
    /// A route whose response is serialized once at registration and
    /// replayed byte-for-byte. The pattern must be parameterless and
    /// the response must not stream.
    pub fn fixed(
        method: Method,
        version: Version,
        path: &str,
        case_sensitive: bool,
        response: Response,
    ) -> Result<Self, RegisterError> {
        let pattern = PathPattern::parse(path)?;
        if !pattern.is_exact() {
            return Err(RegisterError::InvalidPattern {
                pattern: path.to_owned(),
                reason: "fixed routes cannot have parameters",
            });
        }
        if response.is_stream() {
            return Err(RegisterError::Unrenderable(path.to_owned()));
        }

        let mut response = response;
        response.version = version;

        Ok(Self {
            method,
            version,
            pattern,
            case_sensitive,
            responder: Responder::Fixed(response.serialize().into()),
        })
    }

    /// A route dispatched to a handler at request time.
    pub fn dynamic(
        method: Method,
        version: Version,
        path: &str,
        case_sensitive: bool,
        handler: impl Handler + 'static,
    ) -> Result<Self, RegisterError> {
        Ok(Self {
            method,
            version,
            pattern: PathPattern::parse(path)?,
            case_sensitive,
            responder: Responder::Dynamic(Arc::new(handler)),
        })
    }

    pub(crate) fn handler(&self) -> Option<&Arc<dyn Handler>> {
        match &self.responder {
            Responder::Dynamic(handler) => Some(handler),
            Responder::Fixed(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::types::StatusCode;

    #[test]
    #[rustfmt::skip]
    fn pattern_shapes() {
        let cases: [(&str, bool, usize, bool); 6] = [
            // path, is_exact, segment count, catchall
            ("/",                true,  0, false),
            ("/health",          true,  1, false),
            ("/api/users",       true,  2, false),
            ("/users/:id",       false, 2, false),
            ("/users/:id/:post", false, 3, false),
            ("/files/*",         false, 2, true),
        ];

        for (path, exact, count, catchall) in cases {
            let pattern = PathPattern::parse(path).unwrap();
            assert_eq!(pattern.is_exact(), exact, "{path}");
            assert_eq!(pattern.segments.len(), count, "{path}");
            assert_eq!(pattern.catchall, catchall, "{path}");
        }
    }

    #[test]
    #[rustfmt::skip]
    fn pattern_rejects() {
        let cases = [
            "no-slash",
            "//double",
            "/trailing/",
            "/a//b",
            "/:",
            "/files/*/tail",
        ];

        for path in cases {
            assert!(
                matches!(PathPattern::parse(path), Err(RegisterError::InvalidPattern { .. })),
                "{path}"
            );
        }
    }

    #[test]
    fn matching_and_binding() {
        let pattern = PathPattern::parse("/users/:id/posts/:post").unwrap();

        assert!(pattern.matches(&["users", "42", "posts", "7"]));
        assert!(!pattern.matches(&["users", "42", "comments", "7"]));
        assert!(!pattern.matches(&["users", "42", "posts"]));

        let params = pattern.bind(&["users", "42", "posts", "7"]);
        let named: Vec<_> = params
            .iter()
            .map(|(n, v)| (n.as_ref(), v.as_ref()))
            .collect();
        assert_eq!(named, vec![("id", "42"), ("post", "7")]);
    }

    #[test]
    fn catchall_binds_trailing_segments() {
        let pattern = PathPattern::parse("/files/*").unwrap();

        assert!(pattern.matches(&["files"]));
        assert!(pattern.matches(&["files", "a"]));
        assert!(pattern.matches(&["files", "a", "b", "c"]));
        assert!(!pattern.matches(&["docs", "a"]));

        let params = pattern.bind(&["files", "a", "b", "c"]);
        let values: Vec<_> = params.iter().map(|(_, v)| v.as_ref()).collect();
        assert_eq!(values, vec!["a", "b", "c"]);
    }

    #[test]
    fn lowercased_copy() {
        let pattern = PathPattern::parse("/API/Users/:Id").unwrap();
        let lower = pattern.to_lowercase();

        assert_eq!(lower.raw(), "/api/users/:id");
        assert!(lower.matches(&["api", "users", "anything"]));

        // parameter names keep their case
        let params = lower.bind(&["api", "users", "42"]);
        assert_eq!(params[0].0.as_ref(), "Id");
    }

    #[test]
    fn fixed_route_precomputes() {
        let mut resp = Response::new(Version::Http11);
        resp.status(StatusCode::Ok).body("ready");

        let route = Route::fixed(Method::Get, Version::Http11, "/health", true, resp).unwrap();

        match &route.responder {
            Responder::Fixed(wire) => {
                assert!(wire.starts_with(b"HTTP/1.1 200 OK\r\n"));
                assert!(wire.ends_with(b"\r\nready"));
            }
            Responder::Dynamic(_) => panic!("expected precomputed bytes"),
        }
    }

    #[test]
    fn fixed_route_rejects_parameters() {
        let resp = Response::new(Version::Http11);
        let result = Route::fixed(Method::Get, Version::Http11, "/users/:id", true, resp);

        assert!(matches!(
            result,
            Err(RegisterError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn fixed_route_rejects_streams() {
        let mut resp = Response::new(Version::Http11);
        resp.stream(|| None);

        let result = Route::fixed(Method::Get, Version::Http11, "/feed", true, resp);
        assert!(matches!(result, Err(RegisterError::Unrenderable(_))));
    }
}
