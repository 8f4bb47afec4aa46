// src/filter.rs
//
// A filter transforms or rejects the request before the handler runs and
// may transform the response afterwards. Filters compose in two modes:
//
//   embrace — `(f ∘ g)`: request through g then f, response through g
//             then f.
//   cross   — request through g then f, response through f then g. Used
//             when the outer filter must see the response before the
//             inner one records it (compression before statistics).

use std::sync::Arc;

use crate::http::{Request, Response};

pub type PostFilter = Box<dyn FnOnce(Response) -> Response>;

pub enum FilterOutcome {
    /// Continue to the handler with the (possibly rewritten) request and
    /// an optional response transform.
    Pass(Request, Option<PostFilter>),
    /// Short-circuit with this response; the handler never runs.
    Reject(Response),
}

#[derive(Clone)]
pub struct Filter {
    inner: Arc<dyn Fn(Request) -> FilterOutcome + Send + Sync>,
}

impl Filter {
    pub fn new(f: impl Fn(Request) -> FilterOutcome + Send + Sync + 'static) -> Self {
        Filter { inner: Arc::new(f) }
    }

    /// Request-only filter.
    pub fn before(f: impl Fn(Request) -> Result<Request, Response> + Send + Sync + 'static) -> Self {
        Filter::new(move |req| match f(req) {
            Ok(req) => FilterOutcome::Pass(req, None),
            Err(resp) => FilterOutcome::Reject(resp),
        })
    }

    /// Response-only filter.
    pub fn after(f: impl Fn(Response) -> Response + Send + Sync + 'static) -> Self {
        let f = Arc::new(f);
        Filter::new(move |req| {
            let f = f.clone();
            FilterOutcome::Pass(req, Some(Box::new(move |resp| f(resp))))
        })
    }

    pub(crate) fn apply(&self, req: Request) -> FilterOutcome {
        (self.inner)(req)
    }

    /// `self ∘ other`: request through `other` then `self`; response
    /// through `other` then `self`.
    pub fn embrace(self, other: Filter) -> Filter {
        compose(self, other, false)
    }

    /// Like embrace on the request path, but the response goes through
    /// `self` before `other`.
    pub fn cross(self, other: Filter) -> Filter {
        compose(self, other, true)
    }
}

fn compose(outer: Filter, inner: Filter, cross: bool) -> Filter {
    Filter::new(move |req| {
        let (req, inner_post) = match inner.apply(req) {
            FilterOutcome::Pass(r, p) => (r, p),
            FilterOutcome::Reject(resp) => return FilterOutcome::Reject(resp),
        };
        match outer.apply(req) {
            FilterOutcome::Pass(req, outer_post) => {
                let post: Option<PostFilter> = if inner_post.is_none() && outer_post.is_none() {
                    None
                } else {
                    Some(Box::new(move |resp| {
                        let (first, second) = if cross {
                            (outer_post, inner_post)
                        } else {
                            (inner_post, outer_post)
                        };
                        let resp = match first {
                            Some(f) => f(resp),
                            None => resp,
                        };
                        match second {
                            Some(f) => f(resp),
                            None => resp,
                        }
                    }))
                };
                FilterOutcome::Pass(req, post)
            }
            // The inner filter already saw the request; its response
            // transform still applies to the rejection.
            FilterOutcome::Reject(resp) => FilterOutcome::Reject(match inner_post {
                Some(f) => f(resp),
                None => resp,
            }),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(name: &'static str) -> Filter {
        Filter::after(move |mut resp| {
            let prev = resp.headers.get("X-Trace").unwrap_or("").to_string();
            resp.headers.set("X-Trace", format!("{}{}", prev, name));
            resp
        })
    }

    fn run(filter: &Filter, req: Request) -> Response {
        match filter.apply(req) {
            FilterOutcome::Pass(_, post) => {
                let resp = Response::new(200);
                match post {
                    Some(p) => p(resp),
                    None => resp,
                }
            }
            FilterOutcome::Reject(resp) => resp,
        }
    }

    fn dummy_request() -> Request {
        crate::conn::test_request("/x")
    }

    #[test]
    fn test_embrace_response_order() {
        // f.embrace(g): response through g then f.
        let composed = tag("f").embrace(tag("g"));
        let resp = run(&composed, dummy_request());
        assert_eq!(resp.headers.get("X-Trace"), Some("gf"));
    }

    #[test]
    fn test_cross_response_order() {
        // f.cross(g): response through f then g.
        let composed = tag("f").cross(tag("g"));
        let resp = run(&composed, dummy_request());
        assert_eq!(resp.headers.get("X-Trace"), Some("fg"));
    }

    #[test]
    fn test_reject_skips_handler_side() {
        let reject = Filter::before(|_req| Err(Response::forbidden()));
        let composed = reject.embrace(tag("g"));
        let resp = run(&composed, dummy_request());
        assert_eq!(resp.code, 403);
        // g ran on the request first, so its post transform applies.
        assert_eq!(resp.headers.get("X-Trace"), Some("g"));
    }
}
