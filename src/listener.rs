use crate::error::{Data, Error};
use crate::limit::LimitType;
use crate::request::RequestContext;
use std::fmt;

/// Observer hook around the pipeline. `on_limit` fires whenever any
/// limiter rejects; `on_log` fires exactly once per completed call, after
/// the response is built. Implementations must not panic; the pipeline
/// additionally guards these calls so a violation cannot reach the
/// safety-net stage.
pub trait Listener: Send + Sync {
    fn on_limit(&self, limit_type: LimitType, ctx: &RequestContext);
    fn on_log(&self, ctx: &RequestContext, data: Option<&Data>, error: Option<&Error>);
}

/// Text rendering of one completed call for internal logging.
pub struct RequestRecord {
    pub request_id: String,
    pub ip: String,
    pub uri: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub user_id: Option<String>,
    pub body: Option<String>,
    pub response: Option<String>,
    pub elapsed_ms: u64,
}

impl RequestRecord {
    pub fn from_call(
        ctx: &RequestContext,
        data: Option<&Data>,
        error: Option<&Error>,
    ) -> Self {
        let response = match (data, error) {
            (Some(data), _) => Some(data.to_string()),
            (None, Some(error)) => Some(error.to_string()),
            (None, None) => None,
        };

        let headers = ctx
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or("<binary>").to_string(),
                )
            })
            .collect();

        Self {
            request_id: ctx.request_id().to_string(),
            ip: ctx.ip().to_string(),
            uri: ctx.uri().to_string(),
            method: ctx.method().to_string(),
            headers,
            user_id: ctx.cached_user_id(),
            body: ctx.body_text(),
            response,
            elapsed_ms: ctx.elapsed_ms(),
        }
    }
}

impl fmt::Display for RequestRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.method, self.uri)?;
        for (name, value) in &self.headers {
            writeln!(f, "{name}: {value}")?;
        }
        writeln!(f)?;
        match &self.user_id {
            Some(user_id) => writeln!(f, "userId: {user_id}")?,
            None => writeln!(f, "userId: <null>")?,
        }
        writeln!(f)?;
        writeln!(f, "{}", self.body.as_deref().unwrap_or("<null>"))?;
        writeln!(f)?;
        writeln!(f, "{}", self.response.as_deref().unwrap_or("<null>"))?;
        writeln!(f)?;
        write!(f, "elapsed: {}ms", self.elapsed_ms)
    }
}

/// Default listener: renders the call through the tracing sink, debug for
/// successes and error for failures.
#[derive(Default)]
pub struct EchoListener;

impl EchoListener {
    pub fn new() -> Self {
        Self
    }
}

impl Listener for EchoListener {
    fn on_limit(&self, limit_type: LimitType, ctx: &RequestContext) {
        match limit_type {
            LimitType::UserId => tracing::error!(
                limit_type = %limit_type,
                ip = ctx.ip(),
                uri = ctx.uri(),
                user_id = ctx.cached_user_id().as_deref().unwrap_or("<null>"),
                "rate limit rejected call"
            ),
            _ => tracing::error!(
                limit_type = %limit_type,
                ip = ctx.ip(),
                uri = ctx.uri(),
                "rate limit rejected call"
            ),
        }
    }

    fn on_log(&self, ctx: &RequestContext, data: Option<&Data>, error: Option<&Error>) {
        let record = RequestRecord::from_call(ctx, data, error);

        if let Some(fault) = ctx.fault() {
            tracing::error!(
                request_id = %record.request_id,
                fault = %fault.text,
                backtrace = %fault.backtrace,
                "call recovered from fault\n{record}"
            );
            return;
        }

        if error.is_some() {
            tracing::error!(request_id = %record.request_id, "{record}");
        } else {
            tracing::debug!(request_id = %record.request_id, "{record}");
        }
    }
}
