// src/router.rs
//
// Typed route matching. A pattern is a chain of segment matchers built at
// registration time; dispatch picks the most specific matching route,
// with registration order breaking ties. Routes can be scoped to a
// listen address and to a Host header (virtual hosts).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::WeftResult;
use crate::filter::Filter;
use crate::http::{Method, Request, Response};
use crate::uri;

/// One segment matcher. Specificity ranks low-to-high: an exact literal
/// beats an integer binder beats a string binder beats a rest binder.
#[derive(Debug, Clone, PartialEq)]
pub enum Seg {
    Exact(String),
    Int,
    Str,
    Rest,
}

impl Seg {
    fn rank(&self) -> u8 {
        match self {
            Seg::Exact(_) => 0,
            Seg::Int => 1,
            Seg::Str => 2,
            Seg::Rest => 3,
        }
    }
}

/// A bound path variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Val {
    Int(i64),
    Str(String),
    Rest(Vec<String>),
}

#[derive(Debug, Clone, Default)]
pub struct Pattern {
    segs: Vec<Seg>,
}

impl Pattern {
    /// Matches only the empty path.
    pub fn root() -> Self {
        Pattern { segs: Vec::new() }
    }

    /// Literal segments from a static path: `"/hello/world"`.
    pub fn literal(path: &str) -> Self {
        let segs = uri::split_on_slash(path)
            .into_iter()
            .map(Seg::Exact)
            .collect();
        Pattern { segs }
    }

    pub fn lit(mut self, s: &str) -> Self {
        self.segs.push(Seg::Exact(s.to_string()));
        self
    }

    /// Consume one segment, binding an integer.
    pub fn int(mut self) -> Self {
        self.segs.push(Seg::Int);
        self
    }

    /// Consume one non-slash segment, binding a string.
    pub fn string(mut self) -> Self {
        self.segs.push(Seg::Str);
        self
    }

    /// Consume the remaining path, binding a list. Must be last.
    pub fn rest(mut self) -> Self {
        debug_assert!(!self.segs.iter().any(|s| *s == Seg::Rest));
        self.segs.push(Seg::Rest);
        self
    }

    fn rank(&self) -> Vec<u8> {
        self.segs.iter().map(Seg::rank).collect()
    }

    fn match_path(&self, path: &[String]) -> Option<Vec<Val>> {
        let mut vals = Vec::new();
        let mut i = 0;
        for seg in &self.segs {
            match seg {
                Seg::Exact(s) => {
                    if path.get(i)? != s {
                        return None;
                    }
                    i += 1;
                }
                Seg::Int => {
                    let n: i64 = path.get(i)?.parse().ok()?;
                    vals.push(Val::Int(n));
                    i += 1;
                }
                Seg::Str => {
                    vals.push(Val::Str(path.get(i)?.clone()));
                    i += 1;
                }
                Seg::Rest => {
                    vals.push(Val::Rest(path[i..].to_vec()));
                    i = path.len();
                }
            }
        }
        if i == path.len() {
            Some(vals)
        } else {
            None
        }
    }
}

// ---- Typed handler registration ----

pub trait ArgValue: Sized {
    fn from_val(v: Val) -> Option<Self>;
}

impl ArgValue for i64 {
    fn from_val(v: Val) -> Option<Self> {
        match v {
            Val::Int(n) => Some(n),
            _ => None,
        }
    }
}

impl ArgValue for String {
    fn from_val(v: Val) -> Option<Self> {
        match v {
            Val::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl ArgValue for Vec<String> {
    fn from_val(v: Val) -> Option<Self> {
        match v {
            Val::Rest(r) => Some(r),
            _ => None,
        }
    }
}

/// Conversion from the bound variables of a matched pattern to the typed
/// argument tuple of a handler. Arity is checked at registration time.
pub trait FromArgs: Sized {
    fn arity() -> usize;
    fn from_args(args: Vec<Val>) -> Option<Self>;
}

impl FromArgs for () {
    fn arity() -> usize {
        0
    }
    fn from_args(args: Vec<Val>) -> Option<Self> {
        if args.is_empty() {
            Some(())
        } else {
            None
        }
    }
}

macro_rules! impl_from_args {
    ($count:expr, $($name:ident),+) => {
        impl<$($name: ArgValue),+> FromArgs for ($($name,)+) {
            fn arity() -> usize {
                $count
            }
            fn from_args(args: Vec<Val>) -> Option<Self> {
                let mut it = args.into_iter();
                let out = ($($name::from_val(it.next()?)?,)+);
                if it.next().is_some() {
                    return None;
                }
                Some(out)
            }
        }
    };
}

impl_from_args!(1, A);
impl_from_args!(2, A, B);
impl_from_args!(3, A, B, C);
impl_from_args!(4, A, B, C, D);

pub type HandlerFuture = Pin<Box<dyn Future<Output = WeftResult<Response>> + 'static>>;

pub(crate) type BoxedHandler = Arc<dyn Fn(Request, Vec<Val>) -> HandlerFuture + Send + Sync>;

/// Route visibility: which accepting address and which virtual host the
/// route answers for. `None` matches everything.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub address: Option<usize>,
    pub host: Option<String>,
}

impl Scope {
    pub fn any() -> Self {
        Scope::default()
    }

    pub fn on_address(index: usize) -> Self {
        Scope {
            address: Some(index),
            host: None,
        }
    }

    pub fn on_host(host: impl Into<String>) -> Self {
        Scope {
            address: None,
            host: Some(host.into()),
        }
    }

    fn matches(&self, addr_index: usize, host: Option<&str>) -> bool {
        if let Some(a) = self.address {
            if a != addr_index {
                return false;
            }
        }
        if let Some(ref want) = self.host {
            // The Host header may carry a port; the scope never does.
            let got = match host {
                Some(h) => h.split(':').next().unwrap_or(h),
                None => return false,
            };
            if !got.eq_ignore_ascii_case(want) {
                return false;
            }
        }
        true
    }
}

struct RouteEntry {
    method: Method,
    pattern: Pattern,
    scope: Scope,
    filter: Option<Filter>,
    handler: BoxedHandler,
}

pub struct Router {
    routes: Vec<RouteEntry>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Router { routes: Vec::new() }
    }

    /// Full registration form. The handler's argument tuple must match
    /// the pattern's bound variables; a mismatch panics here rather than
    /// at dispatch time.
    pub fn register<A, F, Fut>(
        &mut self,
        method: Method,
        pattern: Pattern,
        scope: Scope,
        filter: Option<Filter>,
        f: F,
    ) where
        A: FromArgs + 'static,
        F: Fn(Request, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WeftResult<Response>> + 'static,
    {
        let bound = pattern
            .segs
            .iter()
            .filter(|s| !matches!(s, Seg::Exact(_)))
            .count();
        assert_eq!(
            bound,
            A::arity(),
            "handler arity {} does not match pattern variables {}",
            A::arity(),
            bound
        );
        let handler: BoxedHandler = Arc::new(move |req, vals| -> HandlerFuture {
            match A::from_args(vals) {
                Some(args) => Box::pin(f(req, args)),
                None => Box::pin(std::future::ready(Ok(Response::internal_error()))),
            }
        });
        self.routes.push(RouteEntry {
            method,
            pattern,
            scope,
            filter,
            handler,
        });
    }

    pub fn get<A, F, Fut>(&mut self, pattern: Pattern, f: F)
    where
        A: FromArgs + 'static,
        F: Fn(Request, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WeftResult<Response>> + 'static,
    {
        self.register(Method::Get, pattern, Scope::any(), None, f)
    }

    pub fn put<A, F, Fut>(&mut self, pattern: Pattern, f: F)
    where
        A: FromArgs + 'static,
        F: Fn(Request, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WeftResult<Response>> + 'static,
    {
        self.register(Method::Put, pattern, Scope::any(), None, f)
    }

    pub fn post<A, F, Fut>(&mut self, pattern: Pattern, f: F)
    where
        A: FromArgs + 'static,
        F: Fn(Request, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WeftResult<Response>> + 'static,
    {
        self.register(Method::Post, pattern, Scope::any(), None, f)
    }

    pub fn delete<A, F, Fut>(&mut self, pattern: Pattern, f: F)
    where
        A: FromArgs + 'static,
        F: Fn(Request, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WeftResult<Response>> + 'static,
    {
        self.register(Method::Delete, pattern, Scope::any(), None, f)
    }

    pub fn head<A, F, Fut>(&mut self, pattern: Pattern, f: F)
    where
        A: FromArgs + 'static,
        F: Fn(Request, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WeftResult<Response>> + 'static,
    {
        self.register(Method::Head, pattern, Scope::any(), None, f)
    }

    /// Find the most specific route for this request. HEAD falls back to
    /// GET routes when no HEAD route matches.
    pub(crate) fn dispatch(
        &self,
        method: Method,
        addr_index: usize,
        host: Option<&str>,
        path: &str,
    ) -> Option<(BoxedHandler, Vec<Val>, Option<Filter>)> {
        let segs = uri::split_on_slash(path);
        self.dispatch_segs(method, addr_index, host, &segs)
            .or_else(|| {
                if method == Method::Head {
                    self.dispatch_segs(Method::Get, addr_index, host, &segs)
                } else {
                    None
                }
            })
    }

    fn dispatch_segs(
        &self,
        method: Method,
        addr_index: usize,
        host: Option<&str>,
        segs: &[String],
    ) -> Option<(BoxedHandler, Vec<Val>, Option<Filter>)> {
        let mut best: Option<(Vec<u8>, &RouteEntry, Vec<Val>)> = None;
        for entry in &self.routes {
            if entry.method != method || !entry.scope.matches(addr_index, host) {
                continue;
            }
            if let Some(vals) = entry.pattern.match_path(segs) {
                let rank = entry.pattern.rank();
                let better = match &best {
                    Some((best_rank, _, _)) => rank < *best_rank,
                    None => true,
                };
                if better {
                    best = Some((rank, entry, vals));
                }
            }
        }
        best.map(|(_, e, vals)| (e.handler.clone(), vals, e.filter.clone()))
    }
}
