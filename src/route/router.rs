//! Route resolution across the root table, groups, and fallbacks.

use crate::errors::RegisterError;
use crate::http::types::{lower_cased, Method, Version};
use crate::route::middleware::Middleware;
use crate::route::route::{Handler, Responder, Route};
use crate::route::table::RouteTable;
use std::sync::Arc;

/// Splits a request path into segments. `/` has none.
pub(crate) fn split_segments(path: &str) -> Vec<&str> {
    let rest = path.strip_prefix('/').unwrap_or(path);
    match rest.is_empty() {
        true => Vec::new(),
        false => rest.split('/').collect(),
    }
}

/// A named scope of routes resolved after the root table.
pub struct RouteGroup {
    name: Box<str>,
    table: RouteTable,
}

impl RouteGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().into_boxed_str(),
            table: RouteTable::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a route in the group. Any failure poisons nothing:
    /// the group simply does not gain the route, and the caller decides
    /// whether to abandon the whole group.
    pub fn route(mut self, route: Route) -> Result<Self, RegisterError> {
        self.table.insert(route, false)?;
        Ok(self)
    }

    pub fn route_override(mut self, route: Route) -> Result<Self, RegisterError> {
        self.table.insert(route, true)?;
        Ok(self)
    }
}

/// Outcome of route resolution.
pub(crate) enum Resolution {
    /// Precomputed wire bytes, written as-is.
    Fixed(Arc<[u8]>),
    /// A handler route with its bound parameters.
    Dynamic {
        route: Arc<Route>,
        params: Vec<(Arc<str>, Box<str>)>,
    },
    /// No route matched; holds the configured responder if any.
    NotFound(Option<Arc<dyn Handler>>),
}

/// The complete dispatch table, frozen before serving begins.
#[derive(Default)]
pub struct Router {
    root: RouteTable,
    groups: Vec<RouteGroup>,
    middleware: Vec<Arc<dyn Middleware>>,
    not_found: Option<Arc<dyn Handler>>,
    error_responder: Option<Arc<dyn Handler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a route. Duplicate keys (method, path, version, case
    /// mode) are rejected and the table stays unchanged.
    pub fn route(&mut self, route: Route) -> Result<&mut Self, RegisterError> {
        self.root.insert(route, false)?;
        Ok(self)
    }

    /// Like [Router::route] but replaces an existing registration.
    pub fn route_override(&mut self, route: Route) -> Result<&mut Self, RegisterError> {
        self.root.insert(route, true)?;
        Ok(self)
    }

    /// Appends a group. Groups resolve after the root table, in
    /// registration order.
    pub fn group(&mut self, group: RouteGroup) -> &mut Self {
        self.groups.push(group);
        self
    }

    /// Appends middleware to the end of the chain.
    pub fn middleware(&mut self, mw: impl Middleware + 'static) -> &mut Self {
        self.middleware.push(Arc::new(mw));
        self
    }

    /// Inserts middleware at a position in the chain, clamped to its
    /// current length.
    pub fn middleware_at(&mut self, index: usize, mw: impl Middleware + 'static) -> &mut Self {
        let at = index.min(self.middleware.len());
        self.middleware.insert(at, Arc::new(mw));
        self
    }

    /// Responder for unmatched requests, replacing the canned 404.
    pub fn not_found(&mut self, handler: impl Handler + 'static) -> &mut Self {
        self.not_found = Some(Arc::new(handler));
        self
    }

    /// Responder run when a handler fails, replacing the canned 500.
    pub fn error_responder(&mut self, handler: impl Handler + 'static) -> &mut Self {
        self.error_responder = Some(Arc::new(handler));
        self
    }

    pub(crate) fn middleware_chain(&self) -> &[Arc<dyn Middleware>] {
        &self.middleware
    }

    pub(crate) fn error_handler(&self) -> Option<&Arc<dyn Handler>> {
        self.error_responder.as_ref()
    }

    pub(crate) fn route_count(&self) -> usize {
        self.root.len() + self.groups.iter().map(|g| g.table.len()).sum::<usize>()
    }

    /// Resolution order, first match wins:
    /// case-sensitive fixed, case-insensitive fixed, case-sensitive
    /// dynamic, case-insensitive dynamic; then the same four stages per
    /// group in registration order; then the not-found responder.
    pub(crate) fn resolve(&self, method: Method, version: Version, path: &str) -> Resolution {
        let segments = split_segments(path);

        let lower = lower_cased(path);
        let lower_segments = split_segments(&lower);

        let scopes =
            std::iter::once(&self.root).chain(self.groups.iter().map(|group| &group.table));

        for table in scopes {
            if let Some(route) = table.sensitive().lookup_fixed(method, version, path) {
                return Self::found(route, &segments);
            }
            if let Some(route) = table.insensitive().lookup_fixed(method, version, &lower) {
                return Self::found(route, &segments);
            }
            if let Some(route) =
                table
                    .sensitive()
                    .lookup_dynamic(method, version, path, &segments)
            {
                return Self::found(route, &segments);
            }
            if let Some(route) =
                table
                    .insensitive()
                    .lookup_dynamic(method, version, &lower, &lower_segments)
            {
                // match on folded bytes, bind the original ones
                return Self::found(route, &segments);
            }
        }

        Resolution::NotFound(self.not_found.clone())
    }

    fn found(route: Arc<Route>, segments: &[&str]) -> Resolution {
        match &route.responder {
            Responder::Fixed(wire) => Resolution::Fixed(wire.clone()),
            Responder::Dynamic(_) => {
                let params = route.pattern.bind(segments);
                Resolution::Dynamic { route, params }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::HandlerError;
    use crate::http::request::Request;
    use crate::http::response::Response;
    use crate::http::types::StatusCode;
    use async_trait::async_trait;

    struct Tagged(&'static str);

    #[async_trait]
    impl Handler for Tagged {
        async fn handle(
            &self,
            _req: &Request<'_>,
            resp: &mut Response,
        ) -> Result<(), HandlerError> {
            resp.body(self.0);
            Ok(())
        }
    }

    fn fixed_route(path: &str, case_sensitive: bool, body: &str) -> Route {
        let mut resp = Response::new(Version::Http11);
        resp.status(StatusCode::Ok).body(body);
        Route::fixed(Method::Get, Version::Http11, path, case_sensitive, resp).unwrap()
    }

    fn dynamic_route(path: &str, case_sensitive: bool, tag: &'static str) -> Route {
        Route::dynamic(Method::Get, Version::Http11, path, case_sensitive, Tagged(tag)).unwrap()
    }

    fn resolve<'r>(router: &'r Router, path: &str) -> Resolution {
        router.resolve(Method::Get, Version::Http11, path)
    }

    fn dynamic_tag(resolution: &Resolution) -> &'static str {
        match resolution {
            Resolution::Dynamic { route, .. } => match route.pattern.raw() {
                "/users/:id" => "users",
                "/USERS/:id" | "/users/:id2" => "other",
                raw => panic!("unexpected route {raw}"),
            },
            _ => panic!("expected dynamic resolution"),
        }
    }

    #[test]
    fn stage_precedence() {
        // the same request path can hit four different registrations;
        // earlier stages must win
        let mut router = Router::new();
        router
            .route(dynamic_route("/Probe", false, "ci-dyn"))
            .unwrap();
        router
            .route(dynamic_route("/Probe", true, "cs-dyn"))
            .unwrap();
        router
            .route(fixed_route("/Probe", false, "ci-fixed"))
            .unwrap();
        router
            .route(fixed_route("/Probe", true, "cs-fixed"))
            .unwrap();

        match resolve(&router, "/Probe") {
            Resolution::Fixed(wire) => assert!(wire.ends_with(b"cs-fixed")),
            _ => panic!("expected the case-sensitive fixed route"),
        }

        // different case skips both case-sensitive stages
        match resolve(&router, "/PROBE") {
            Resolution::Fixed(wire) => assert!(wire.ends_with(b"ci-fixed")),
            _ => panic!("expected the case-insensitive fixed route"),
        }
    }

    #[test]
    fn dynamic_binding_through_resolution() {
        let mut router = Router::new();
        router
            .route(dynamic_route("/users/:id", true, "users"))
            .unwrap();

        match resolve(&router, "/users/42") {
            Resolution::Dynamic { params, .. } => {
                assert_eq!(params.len(), 1);
                assert_eq!(params[0].0.as_ref(), "id");
                assert_eq!(params[0].1.as_ref(), "42");
            }
            _ => panic!("expected dynamic resolution"),
        }
    }

    #[test]
    fn insensitive_match_binds_original_case() {
        let mut router = Router::new();
        router
            .route(dynamic_route("/users/:id", false, "users"))
            .unwrap();

        match resolve(&router, "/USERS/AbC") {
            Resolution::Dynamic { params, .. } => {
                assert_eq!(params[0].1.as_ref(), "AbC");
            }
            _ => panic!("expected dynamic resolution"),
        }
    }

    #[test]
    fn groups_resolve_in_registration_order() {
        let mut router = Router::new();

        let first = RouteGroup::new("first")
            .route(dynamic_route("/shared/:x", true, "users"))
            .unwrap();
        let second = RouteGroup::new("second")
            .route(dynamic_route("/shared/:x", true, "other"))
            .unwrap();

        router.group(first).group(second);

        match resolve(&router, "/shared/v") {
            Resolution::Dynamic { route, .. } => {
                assert_eq!(route.pattern.raw(), "/shared/:x");
            }
            _ => panic!("expected dynamic resolution"),
        }

        // root beats groups
        router
            .route(fixed_route("/shared/v", true, "root"))
            .unwrap();
        match resolve(&router, "/shared/v") {
            Resolution::Fixed(wire) => assert!(wire.ends_with(b"root")),
            _ => panic!("expected the root fixed route"),
        }
    }

    #[test]
    fn unmatched_reports_not_found() {
        let mut router = Router::new();
        router
            .route(dynamic_route("/users/:id", true, "users"))
            .unwrap();

        match router.resolve(Method::Delete, Version::Http11, "/unknown") {
            Resolution::NotFound(None) => {}
            _ => panic!("expected the canned not-found"),
        }

        router.not_found(Tagged("custom-404"));
        match router.resolve(Method::Delete, Version::Http11, "/unknown") {
            Resolution::NotFound(Some(_)) => {}
            _ => panic!("expected the configured responder"),
        }
    }

    #[test]
    fn catchall_through_resolution() {
        let mut router = Router::new();
        router
            .route(
                Route::dynamic(Method::Get, Version::Http11, "/files/*", true, Tagged("files"))
                    .unwrap(),
            )
            .unwrap();

        match resolve(&router, "/files/a/b/c") {
            Resolution::Dynamic { params, .. } => {
                let values: Vec<_> = params.iter().map(|(_, v)| v.as_ref()).collect();
                assert_eq!(values, vec!["a", "b", "c"]);
            }
            _ => panic!("expected dynamic resolution"),
        }
    }

    #[test]
    fn middleware_ordering() {
        use crate::route::middleware::Flow;

        struct Order(&'static str);

        impl Middleware for Order {
            fn handle(&self, _req: &Request<'_>, resp: &mut Response) -> Flow {
                resp.header("x-order", self.0);
                Flow::Continue
            }
        }

        let mut router = Router::new();
        router.middleware(Order("b"));
        router.middleware(Order("c"));
        router.middleware_at(0, Order("a"));
        router.middleware_at(99, Order("d")); // clamped to the end

        assert_eq!(router.middleware_chain().len(), 4);
    }

    #[test]
    fn route_count_spans_groups() {
        let mut router = Router::new();
        router.route(fixed_route("/a", true, "x")).unwrap();

        let group = RouteGroup::new("g")
            .route(dynamic_route("/b/:x", true, "users"))
            .unwrap();
        router.group(group);

        assert_eq!(router.route_count(), 2);
    }

    #[test]
    fn bucket_shadowing_prefers_first() {
        let mut router = Router::new();
        router
            .route(dynamic_route("/users/:id", true, "users"))
            .unwrap();
        router
            .route(dynamic_route("/users/:id2", true, "other"))
            .unwrap();

        let resolution = resolve(&router, "/users/9");
        assert_eq!(dynamic_tag(&resolution), "users");
    }
}
