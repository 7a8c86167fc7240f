use crate::error::{Code, Data, Error};
use crate::i18n::I18n;
use crate::limit::{Limit, LimitType};
use crate::listener::Listener;
use crate::request::{client_ip, FaultDetail, RequestContext};
use crate::router::{Dispatch, DispatchTable, RouteEntry};
use crate::token::TokenStorage;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use futures_util::FutureExt;
use http::header::{CONTENT_TYPE, HOST, SET_COOKIE};
use http::HeaderValue;
use serde_json::json;
use std::any::Any;
use std::backtrace::Backtrace;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

const CONTENT_TYPE_JSON: &str = "application/json; charset=utf-8";

/// The per-call processing pipeline. Stages, outermost first: safety-net
/// recovery, primary recovery, body buffering, elapsed timer, global
/// per-IP limiter, controller middleware, per-route limiters, handler,
/// response build, listener log hook.
pub struct Pipeline {
    dispatch: DispatchTable,
    i18n: Arc<I18n>,
    listener: Arc<dyn Listener>,
    global_limit: Limit,
    storage: Arc<dyn TokenStorage>,
    cookie_name: String,
    header_name: String,
}

impl Pipeline {
    pub fn new(
        dispatch: DispatchTable,
        i18n: Arc<I18n>,
        listener: Arc<dyn Listener>,
        global_limit: Limit,
        storage: Arc<dyn TokenStorage>,
        cookie_name: String,
        header_name: String,
    ) -> Self {
        Self {
            dispatch,
            i18n,
            listener,
            global_limit,
            storage,
            cookie_name,
            header_name,
        }
    }

    /// Entry point. The outer boundary guarantees a response even when the
    /// inner stages (recovery and translation included) fault.
    pub async fn handle(&self, request: Request<Body>, peer: Option<SocketAddr>) -> Response<Body> {
        match AssertUnwindSafe(self.handle_inner(request, peer))
            .catch_unwind()
            .await
        {
            Ok(response) => response,
            Err(panic) => safety_net_response(panic),
        }
    }

    async fn handle_inner(
        &self,
        request: Request<Body>,
        peer: Option<SocketAddr>,
    ) -> Response<Body> {
        let (parts, body) = request.into_parts();

        let host = parts
            .headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("localhost");
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let uri = format!("http://{host}{path_and_query}");
        let ip = client_ip(&parts.headers, peer);
        let path = parts.uri.path().to_string();

        // Body buffering: read the raw body once so handlers and logging
        // both see it.
        let buffered = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) if bytes.is_empty() => None,
            Ok(bytes) => Some(bytes),
            Err(err) => {
                let ctx = Arc::new(RequestContext::new(
                    parts.method.clone(),
                    uri,
                    ip,
                    parts.headers,
                    None,
                    self.storage.clone(),
                    self.cookie_name.clone(),
                    self.header_name.clone(),
                ));
                let error = Error::with_message(Code::InternalError, err.to_string());
                return self.reply(&ctx, None, Some(error)).await;
            }
        };

        let ctx = Arc::new(RequestContext::new(
            parts.method,
            uri,
            ip,
            parts.headers,
            buffered,
            self.storage.clone(),
            self.cookie_name.clone(),
            self.header_name.clone(),
        ));

        let (data, error) = self.run_call(&ctx, &path, &path_and_query).await;
        self.reply(&ctx, data, error).await
    }

    /// Everything between the recovery boundaries and the response build.
    async fn run_call(
        &self,
        ctx: &Arc<RequestContext>,
        path: &str,
        path_and_query: &str,
    ) -> (Option<Data>, Option<Error>) {
        // Global per-IP limiter runs before any routing.
        match self.global_limit.add(ctx.ip()).await {
            Ok(true) => {}
            Ok(false) => {
                self.fire_on_limit(LimitType::Ip, ctx);
                return (
                    None,
                    Some(Error::with_argv(
                        Code::RateLimit,
                        vec![json!(ctx.uri()), json!(ctx.ip())],
                    )),
                );
            }
            Err(err) => {
                return (
                    None,
                    Some(Error::with_message(Code::ThirdPartyError, err.to_string())),
                );
            }
        }

        let entry = match self.dispatch.lookup(ctx.method(), path) {
            Dispatch::Matched(entry) => entry,
            Dispatch::NotFound => {
                return (
                    None,
                    Some(Error::with_argv(Code::NotFound, vec![json!(path_and_query)])),
                );
            }
            Dispatch::MethodNotAllowed => {
                return (
                    None,
                    Some(Error::with_argv(
                        Code::MethodNotAllowed,
                        vec![json!(path_and_query), json!(ctx.method().as_str())],
                    )),
                );
            }
        };

        // Primary recovery: a structured Error panic is forwarded as-is;
        // anything else becomes InternalError whose fault text and stack
        // stay on the listener side of the boundary.
        match AssertUnwindSafe(self.run_route(entry, ctx))
            .catch_unwind()
            .await
        {
            Ok(Ok(data)) => (data, None),
            Ok(Err(error)) => (None, Some(error)),
            Err(panic) => (None, Some(self.recover(ctx, panic))),
        }
    }

    async fn run_route(
        &self,
        entry: &RouteEntry,
        ctx: &Arc<RequestContext>,
    ) -> Result<Option<Data>, Error> {
        if let Some(middleware) = &entry.middleware {
            middleware(ctx.clone()).await?;
        }

        // Per-route limiters in declaration order; the first rejection
        // aborts the call without touching later limiters.
        for limit in &entry.limits {
            let key = match limit.limit_type() {
                LimitType::Ip => ctx.ip().to_string(),
                LimitType::UserId => format!("{}_{}", ctx.uri(), ctx.must_user_id().await?),
                _ => return Err(Error::new(Code::InternalError)),
            };

            let allowed = limit
                .add(&key)
                .await
                .map_err(|err| Error::with_message(Code::ThirdPartyError, err.to_string()))?;
            if !allowed {
                self.fire_on_limit(limit.limit_type(), ctx);
                return Err(Error::new(Code::RateLimit));
            }
        }

        (entry.handler)(ctx.clone()).await
    }

    fn recover(&self, ctx: &Arc<RequestContext>, panic: Box<dyn Any + Send>) -> Error {
        if let Some(error) = panic.downcast_ref::<Error>() {
            return error.clone();
        }

        ctx.set_fault(FaultDetail {
            text: panic_text(panic.as_ref()),
            backtrace: Backtrace::force_capture().to_string(),
        });
        Error::new(Code::InternalError)
    }

    /// Response build: success envelope or localized error envelope, then
    /// exactly one on_log.
    async fn reply(
        &self,
        ctx: &Arc<RequestContext>,
        data: Option<Data>,
        error: Option<Error>,
    ) -> Response<Body> {
        let mut response = match (&data, error) {
            (_, Some(mut error)) => {
                error.localize(ctx.lang(), &self.i18n);
                let response = json_response(StatusCode::BAD_REQUEST, &error);
                // Keep the localized form for the log record.
                let response = attach_cookies(response, ctx);
                self.fire_on_log(ctx, None, Some(&error)).await;
                return response;
            }
            (Some(data), None) => json_response(StatusCode::OK, data),
            (None, None) => empty_response(StatusCode::OK),
        };

        response = attach_cookies(response, ctx);
        self.fire_on_log(ctx, data.as_ref(), None).await;
        response
    }

    fn fire_on_limit(&self, limit_type: LimitType, ctx: &Arc<RequestContext>) {
        let listener = self.listener.clone();
        let ctx = ctx.clone();
        // A faulting listener must not take down the pipeline.
        let _ = std::panic::catch_unwind(AssertUnwindSafe(|| {
            listener.on_limit(limit_type, &ctx);
        }));
    }

    async fn fire_on_log(
        &self,
        ctx: &Arc<RequestContext>,
        data: Option<&Data>,
        error: Option<&Error>,
    ) {
        // Warm the identity cache so the record carries the user id
        // without the listener doing I/O.
        let _ = ctx.user_id().await;

        let _ = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.listener.on_log(ctx, data, error);
        }));
    }
}

fn json_response(status: StatusCode, payload: &impl serde::Serialize) -> Response<Body> {
    let body = serde_json::to_vec(payload).unwrap_or_default();
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_JSON));
    response
}

fn empty_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_JSON));
    response
}

fn attach_cookies(mut response: Response<Body>, ctx: &RequestContext) -> Response<Body> {
    for cookie in ctx.take_cookies() {
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }
    response
}

/// Baseline response for faults that escape the primary boundary,
/// including faults inside recovery, translation, or logging themselves.
/// No localization and no listener here; this stage must not be able to
/// fail.
fn safety_net_response(panic: Box<dyn Any + Send>) -> Response<Body> {
    let error = match panic.downcast_ref::<Error>() {
        Some(error) => error.clone(),
        None => Error::new(Code::InternalError),
    };
    json_response(StatusCode::BAD_REQUEST, &error)
}

fn panic_text(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::{panic_text, safety_net_response};
    use crate::error::{Code, Error};
    use axum::http::StatusCode;

    #[test]
    fn panic_text_handles_common_payloads() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_text(boxed.as_ref()), "boom");

        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom".to_string());
        assert_eq!(panic_text(boxed.as_ref()), "boom");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(42_u32);
        assert_eq!(panic_text(boxed.as_ref()), "unknown panic payload");
    }

    #[test]
    fn safety_net_forwards_structured_errors() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new(Error::new(Code::Conflict));
        let response = safety_net_response(boxed);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn safety_net_falls_back_to_internal_error() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new(());
        let response = safety_net_response(boxed);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
