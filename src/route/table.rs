//! Route storage, split by responder kind and match shape.
//!
//! Each shelf holds: precomputed routes by exact path, parameterless
//! dynamic routes by exact path, parameterized routes in buckets keyed
//! by segment count, and catchall routes in registration order. A
//! [RouteTable] holds two shelves, one per case-sensitivity mode; the
//! insensitive shelf stores patterns pre-lowercased so lookups only
//! lowercase the request path.

use crate::errors::RegisterError;
use crate::http::types::{Method, Version};
use crate::route::route::{Responder, Route};
use rustc_hash::FxHashMap;
use std::sync::Arc;

type ExactMap = FxHashMap<(Method, Version), FxHashMap<Box<str>, Arc<Route>>>;

#[derive(Default)]
pub(crate) struct Shelf {
    fixed: ExactMap,
    exact: ExactMap,
    buckets: FxHashMap<(Method, Version, usize), Vec<Arc<Route>>>,
    catchalls: Vec<Arc<Route>>,
}

impl Shelf {
    fn insert(&mut self, route: Arc<Route>, overwrite: bool) -> Result<(), RegisterError> {
        match &route.responder {
            Responder::Fixed(_) => {
                evict_twin(&mut self.exact, &route, overwrite)?;
                insert_exact(&mut self.fixed, route, overwrite)
            }
            Responder::Dynamic(_) if route.pattern.is_exact() => {
                evict_twin(&mut self.fixed, &route, overwrite)?;
                insert_exact(&mut self.exact, route, overwrite)
            }
            Responder::Dynamic(_) if route.pattern.catchall => {
                let found = self.catchalls.iter().position(|r| {
                    r.method == route.method
                        && r.version == route.version
                        && r.pattern.raw() == route.pattern.raw()
                });

                match found {
                    Some(_) if !overwrite => Err(duplicate(&route)),
                    Some(at) => {
                        self.catchalls[at] = route;
                        Ok(())
                    }
                    None => {
                        self.catchalls.push(route);
                        Ok(())
                    }
                }
            }
            Responder::Dynamic(_) => {
                let key = (
                    route.method,
                    route.version,
                    route.pattern.segments.len(),
                );
                let bucket = self.buckets.entry(key).or_default();

                let found = bucket
                    .iter()
                    .position(|r| r.pattern.raw() == route.pattern.raw());

                match found {
                    Some(_) if !overwrite => Err(duplicate(&route)),
                    Some(at) => {
                        bucket[at] = route;
                        Ok(())
                    }
                    None => {
                        bucket.push(route);
                        Ok(())
                    }
                }
            }
        }
    }

    #[inline]
    pub(crate) fn lookup_fixed(
        &self,
        method: Method,
        version: Version,
        path: &str,
    ) -> Option<Arc<Route>> {
        self.fixed.get(&(method, version))?.get(path).cloned()
    }

    /// Dynamic match: exact key probe, then the same-count bucket in
    /// registration order, then the catchall list.
    #[inline]
    pub(crate) fn lookup_dynamic(
        &self,
        method: Method,
        version: Version,
        path: &str,
        segments: &[&str],
    ) -> Option<Arc<Route>> {
        if let Some(route) = self.exact.get(&(method, version)).and_then(|m| m.get(path)) {
            return Some(route.clone());
        }

        if let Some(bucket) = self.buckets.get(&(method, version, segments.len())) {
            if let Some(route) = bucket.iter().find(|r| r.pattern.matches(segments)) {
                return Some(route.clone());
            }
        }

        self.catchalls
            .iter()
            .find(|r| {
                r.method == method && r.version == version && r.pattern.matches(segments)
            })
            .cloned()
    }

    fn len(&self) -> usize {
        let exacts = |map: &ExactMap| map.values().map(|m| m.len()).sum::<usize>();

        exacts(&self.fixed)
            + exacts(&self.exact)
            + self.buckets.values().map(|b| b.len()).sum::<usize>()
            + self.catchalls.len()
    }
}

// Fixed and exact dynamic routes share one key space even though they
// live in separate maps: the same key may exist in only one of the two.
fn evict_twin(
    other: &mut ExactMap,
    route: &Route,
    overwrite: bool,
) -> Result<(), RegisterError> {
    if let Some(by_path) = other.get_mut(&(route.method, route.version)) {
        if by_path.contains_key(route.pattern.raw()) {
            if !overwrite {
                return Err(duplicate(route));
            }
            by_path.remove(route.pattern.raw());
        }
    }
    Ok(())
}

fn insert_exact(
    map: &mut ExactMap,
    route: Arc<Route>,
    overwrite: bool,
) -> Result<(), RegisterError> {
    let by_path = map.entry((route.method, route.version)).or_default();
    let path: Box<str> = route.pattern.raw().into();

    if by_path.contains_key(&path) && !overwrite {
        return Err(duplicate(&route));
    }

    by_path.insert(path, route);
    Ok(())
}

fn duplicate(route: &Route) -> RegisterError {
    RegisterError::Duplicate(format!(
        "{} {}",
        route.method.as_str(),
        route.pattern.raw()
    ))
}

/// Both case-sensitivity shelves for one registration scope.
#[derive(Default)]
pub(crate) struct RouteTable {
    sensitive: Shelf,
    insensitive: Shelf,
}

impl RouteTable {
    /// On a duplicate without `overwrite` the table is left unchanged.
    pub(crate) fn insert(&mut self, route: Route, overwrite: bool) -> Result<(), RegisterError> {
        match route.case_sensitive {
            true => self.sensitive.insert(Arc::new(route), overwrite),
            false => {
                let route = Route {
                    pattern: route.pattern.to_lowercase(),
                    ..route
                };
                self.insensitive.insert(Arc::new(route), overwrite)
            }
        }
    }

    pub(crate) fn sensitive(&self) -> &Shelf {
        &self.sensitive
    }

    pub(crate) fn insensitive(&self) -> &Shelf {
        &self.insensitive
    }

    pub(crate) fn len(&self) -> usize {
        self.sensitive.len() + self.insensitive.len()
    }
}
