use crate::error::{Error, HandlerResult};
use crate::limit::Limit;
use crate::request::RequestContext;
use http::Method;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;
pub type Handler = Arc<dyn Fn(Arc<RequestContext>) -> HandlerFuture + Send + Sync>;

pub type MiddlewareFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>;
pub type Middleware = Arc<dyn Fn(Arc<RequestContext>) -> MiddlewareFuture + Send + Sync>;

/// Adapt an async fn into a boxed route handler.
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Adapt an async fn into a boxed controller middleware.
pub fn middleware<F, Fut>(f: F) -> Middleware
where
    F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Controller middleware that rejects anonymous calls before the handler
/// runs.
pub fn require_auth() -> Middleware {
    middleware(|ctx: Arc<RequestContext>| async move {
        ctx.must_user_id().await?;
        Ok(())
    })
}

/// One (method, relative path) pair bound to a handler and its per-route
/// limiters, evaluated in declaration order.
pub struct Route {
    pub method: Method,
    pub path: String,
    pub limits: Vec<Limit>,
    pub handler: Handler,
}

/// A path-prefixed group of routes with optional group-level middleware.
pub struct Controller {
    pub path: String,
    pub middleware: Option<Middleware>,
    pub routes: Vec<Route>,
}

/// What one registered route needs at dispatch time.
pub struct RouteEntry {
    pub middleware: Option<Middleware>,
    pub limits: Vec<Limit>,
    pub handler: Handler,
}

pub enum Dispatch<'a> {
    Matched(&'a RouteEntry),
    MethodNotAllowed,
    NotFound,
}

/// Static (method, path) → handler table. Built once during startup
/// registration and read-only afterward, so concurrent lookups need no
/// synchronization.
#[derive(Default)]
pub struct DispatchTable {
    table: HashMap<String, HashMap<Method, RouteEntry>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        base_path: &str,
        controllers: Vec<Controller>,
    ) -> Result<(), String> {
        for controller in controllers {
            let prefix = join_paths(base_path, &controller.path)?;

            for route in controller.routes {
                if !matches!(
                    route.method,
                    Method::GET | Method::POST | Method::PUT | Method::DELETE
                ) {
                    return Err(format!("method `{}` not supported", route.method));
                }

                let full_path = join_paths(&prefix, &route.path)?;
                let by_method = self.table.entry(full_path.clone()).or_default();
                if by_method.contains_key(&route.method) {
                    return Err(format!(
                        "duplicate route `{} {full_path}`",
                        route.method
                    ));
                }

                by_method.insert(
                    route.method,
                    RouteEntry {
                        middleware: controller.middleware.clone(),
                        limits: route.limits,
                        handler: route.handler,
                    },
                );
            }
        }

        Ok(())
    }

    /// Exact-match dispatch: unknown path is NotFound, known path with an
    /// unregistered method is MethodNotAllowed.
    pub fn lookup(&self, method: &Method, path: &str) -> Dispatch<'_> {
        match self.table.get(path) {
            None => Dispatch::NotFound,
            Some(by_method) => match by_method.get(method) {
                Some(entry) => Dispatch::Matched(entry),
                None => Dispatch::MethodNotAllowed,
            },
        }
    }
}

fn join_paths(prefix: &str, path: &str) -> Result<String, String> {
    if !path.is_empty() && !path.starts_with('/') {
        return Err(format!("path `{path}` must start with `/`"));
    }
    if path.len() > 1 && path.ends_with('/') {
        return Err(format!("path `{path}` must not end with `/`"));
    }

    let joined = format!("{}{}", prefix.trim_end_matches('/'), path);
    if joined.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(joined)
    }
}

#[cfg(test)]
mod tests {
    use super::{handler, Controller, Dispatch, DispatchTable, Route};
    use http::Method;
    use std::sync::Arc;

    fn noop_route(method: Method, path: &str) -> Route {
        Route {
            method,
            path: path.to_string(),
            limits: Vec::new(),
            handler: handler(|_ctx| async { Ok(None) }),
        }
    }

    fn table() -> DispatchTable {
        let mut table = DispatchTable::new();
        table
            .register(
                "/public",
                vec![Controller {
                    path: "/user".to_string(),
                    middleware: None,
                    routes: vec![
                        noop_route(Method::POST, "/login"),
                        noop_route(Method::GET, "/profile"),
                    ],
                }],
            )
            .expect("register should succeed");
        table
    }

    #[test]
    fn exact_match_dispatch() {
        let table = table();
        assert!(matches!(
            table.lookup(&Method::POST, "/public/user/login"),
            Dispatch::Matched(_)
        ));
    }

    #[test]
    fn unknown_path_is_not_found() {
        let table = table();
        assert!(matches!(
            table.lookup(&Method::POST, "/public/user/missing"),
            Dispatch::NotFound
        ));
        // Prefix matches alone do not dispatch.
        assert!(matches!(
            table.lookup(&Method::POST, "/public/user"),
            Dispatch::NotFound
        ));
    }

    #[test]
    fn wrong_method_is_method_not_allowed() {
        let table = table();
        assert!(matches!(
            table.lookup(&Method::GET, "/public/user/login"),
            Dispatch::MethodNotAllowed
        ));
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut table = table();
        let error = table
            .register(
                "/public",
                vec![Controller {
                    path: "/user".to_string(),
                    middleware: None,
                    routes: vec![noop_route(Method::POST, "/login")],
                }],
            )
            .expect_err("duplicate should fail");
        assert!(error.contains("duplicate route"));
    }

    #[test]
    fn unsupported_method_fails_registration() {
        let mut table = DispatchTable::new();
        let error = table
            .register(
                "",
                vec![Controller {
                    path: "/user".to_string(),
                    middleware: None,
                    routes: vec![noop_route(Method::PATCH, "/x")],
                }],
            )
            .expect_err("patch should fail");
        assert!(error.contains("not supported"));
    }

    #[test]
    fn handler_type_is_shareable() {
        let shared = handler(|_ctx| async { Ok(None) });
        let clone = Arc::clone(&shared);
        assert_eq!(Arc::strong_count(&clone), 2);
    }
}
