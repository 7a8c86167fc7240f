use crate::error::{Code, Error};
use crate::token::{AuthPayload, TokenStorage};
use axum::body::Bytes;
use http::header::{ACCEPT_LANGUAGE, AUTHORIZATION, COOKIE};
use http::{HeaderMap, Method};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Negotiated response language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lang {
    En,
    ZhCn,
}

impl Lang {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::En => "en",
            Self::ZhCn => "zh-CN",
        }
    }

    /// Default "en"; "zh-CN" only when its identifier appears inside the
    /// Accept-Language value.
    pub fn negotiate(headers: &HeaderMap) -> Self {
        match headers.get(ACCEPT_LANGUAGE).and_then(|value| value.to_str().ok()) {
            Some(value) if value.contains(Self::ZhCn.as_str()) => Self::ZhCn,
            _ => Self::En,
        }
    }
}

/// Detail captured by the primary recovery stage. Available to the
/// listener; never serialized into the response body.
#[derive(Debug, Clone)]
pub struct FaultDetail {
    pub text: String,
    pub backtrace: String,
}

#[derive(Default)]
struct PropertyBag {
    token_value: Option<String>,
    user_id: Option<String>,
    fault: Option<FaultDetail>,
}

/// Per-call wrapper owned exclusively by one request: immutable facts
/// about the call, a mutable property bag, the outgoing cookie list, and
/// the token handle delegating persistence to the configured backend.
pub struct RequestContext {
    request_id: String,
    method: Method,
    uri: String,
    ip: String,
    headers: HeaderMap,
    body: Option<Bytes>,
    lang: Lang,
    started_at: Instant,
    storage: Arc<dyn TokenStorage>,
    cookie_name: String,
    header_name: String,
    props: Mutex<PropertyBag>,
    cookies_out: Mutex<Vec<String>>,
}

impl RequestContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        method: Method,
        uri: String,
        ip: String,
        headers: HeaderMap,
        body: Option<Bytes>,
        storage: Arc<dyn TokenStorage>,
        cookie_name: String,
        header_name: String,
    ) -> Self {
        let lang = Lang::negotiate(&headers);
        Self {
            request_id: uuid::Uuid::now_v7().to_string(),
            method,
            uri,
            ip,
            headers,
            body,
            lang,
            started_at: Instant::now(),
            storage,
            cookie_name,
            header_name,
            props: Mutex::new(PropertyBag::default()),
            cookies_out: Mutex::new(Vec::new()),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string)
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        let raw = self.headers.get(COOKIE)?.to_str().ok()?;
        for pair in raw.split(';') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            if key.trim() == name {
                return Some(value.trim().to_string());
            }
        }
        None
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn body_text(&self) -> Option<String> {
        self.body
            .as_ref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn lang(&self) -> Lang {
        self.lang
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    /// Deserialize call parameters: query string for GET, JSON body
    /// otherwise. Failures surface as ParameterError.
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let value = if self.method == Method::GET {
            let query = self.uri.split_once('?').map(|(_, query)| query).unwrap_or("");
            query_to_json(query)
        } else {
            match &self.body {
                Some(bytes) => serde_json::from_slice(bytes)
                    .map_err(|err| Error::with_message(Code::ParameterError, err.to_string()))?,
                None => {
                    return Err(Error::with_message(
                        Code::ParameterError,
                        "request body is empty",
                    ));
                }
            }
        };

        serde_json::from_value(value)
            .map_err(|err| Error::with_message(Code::ParameterError, err.to_string()))
    }

    /// Token value transport: cookie, then custom header, then
    /// `Authorization: Bearer`.
    pub fn token_value(&self) -> Option<String> {
        if let Some(cached) = self.props().token_value.clone() {
            return Some(cached);
        }

        if let Some(value) = self.cookie(&self.cookie_name) {
            return Some(value);
        }

        if let Some(value) = self.header(&self.header_name)
            && !value.trim().is_empty()
        {
            return Some(value.trim().to_string());
        }

        let authorization = self.headers.get(AUTHORIZATION)?.to_str().ok()?;
        parse_bearer_token(authorization).map(ToString::to_string)
    }

    /// Issue a token for `user_id`, write the transport cookie, and cache
    /// the resolved identity for the rest of the call.
    pub async fn set_user_id(&self, user_id: &str, max_age: Duration) -> Result<String, Error> {
        let payload = AuthPayload {
            user_id: user_id.to_string(),
        };
        let value = self.storage.set(&payload, max_age).await?;

        self.push_cookie(&value, max_age.as_secs());
        let mut props = self.props();
        props.token_value = Some(value.clone());
        props.user_id = Some(user_id.to_string());

        Ok(value)
    }

    /// Resolve the caller's user id, at most once per call.
    pub async fn user_id(&self) -> Result<Option<String>, Error> {
        if let Some(cached) = self.props().user_id.clone() {
            return Ok(Some(cached));
        }

        let Some(value) = self.token_value() else {
            return Ok(None);
        };

        let Some(payload) = self.storage.get(&value).await? else {
            return Ok(None);
        };

        let mut props = self.props();
        props.token_value = Some(value);
        props.user_id = Some(payload.user_id.clone());
        Ok(Some(payload.user_id))
    }

    /// Identity already resolved earlier in the call, without a backend
    /// round-trip. Used at logging time.
    pub fn cached_user_id(&self) -> Option<String> {
        self.props().user_id.clone()
    }

    pub async fn must_user_id(&self) -> Result<String, Error> {
        self.user_id()
            .await?
            .ok_or_else(|| Error::new(Code::NoAuth))
    }

    /// Revoke the session where the backend supports it and clear the
    /// transport cookie either way.
    pub async fn delete_user_id(&self) -> Result<(), Error> {
        if let Some(value) = self.token_value() {
            self.storage.delete(&value).await?;
        }

        self.push_expired_cookie();
        let mut props = self.props();
        props.token_value = None;
        props.user_id = None;
        Ok(())
    }

    pub(crate) fn set_fault(&self, fault: FaultDetail) {
        self.props().fault = Some(fault);
    }

    /// Fault captured by the recovery stages, if the call panicked.
    pub fn fault(&self) -> Option<FaultDetail> {
        self.props().fault.clone()
    }

    pub(crate) fn take_cookies(&self) -> Vec<String> {
        std::mem::take(
            &mut *self
                .cookies_out
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    fn props(&self) -> std::sync::MutexGuard<'_, PropertyBag> {
        self.props
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push_cookie(&self, value: &str, max_age_secs: u64) {
        self.cookies_out
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(format!(
                "{}={value}; Max-Age={max_age_secs}; Path=/; HttpOnly",
                self.cookie_name
            ));
    }

    fn push_expired_cookie(&self) {
        self.push_cookie("", 0);
    }
}

/// Client IP resolution: X-Forwarded-For first hop, then X-Real-IP, then
/// the socket peer address.
pub(crate) fn client_ip(headers: &HeaderMap, peer: Option<std::net::SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|value| value.to_str().ok())
        && let Some(first) = forwarded.split(',').next()
        && !first.trim().is_empty()
    {
        return first.trim().to_string();
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|value| value.to_str().ok())
        && !real_ip.trim().is_empty()
    {
        return real_ip.trim().to_string();
    }

    match peer {
        Some(addr) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}

fn parse_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

fn query_to_json(query: &str) -> Value {
    let mut map = serde_json::Map::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        map.insert(key.into_owned(), lenient_scalar(&value));
    }
    Value::Object(map)
}

/// Query parameters arrive untyped; favor the reading the target type is
/// most likely to expect.
fn lenient_scalar(text: &str) -> Value {
    if let Ok(number) = text.parse::<i64>() {
        return Value::from(number);
    }
    if let Ok(number) = text.parse::<f64>() {
        return Value::from(number);
    }
    match text {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(text.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::{client_ip, Lang, RequestContext};
    use crate::token::{SignedStorage, TokenStorage};
    use http::header::{ACCEPT_LANGUAGE, AUTHORIZATION, COOKIE};
    use http::{HeaderMap, HeaderValue, Method};
    use serde::Deserialize;
    use std::sync::Arc;
    use std::time::Duration;

    fn context(headers: HeaderMap) -> RequestContext {
        context_with_body(headers, None)
    }

    fn context_with_body(headers: HeaderMap, body: Option<&str>) -> RequestContext {
        RequestContext::new(
            Method::POST,
            "http://localhost/test".to_string(),
            "127.0.0.1".to_string(),
            headers,
            body.map(|text| axum::body::Bytes::copy_from_slice(text.as_bytes())),
            Arc::new(SignedStorage::new("secret")),
            "token".to_string(),
            "token".to_string(),
        )
    }

    #[test]
    fn negotiates_language_by_substring() {
        let mut headers = HeaderMap::new();
        assert_eq!(Lang::negotiate(&headers), Lang::En);

        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("zh-CN,zh;q=0.9"));
        assert_eq!(Lang::negotiate(&headers), Lang::ZhCn);

        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("fr-FR"));
        assert_eq!(Lang::negotiate(&headers), Lang::En);
    }

    #[test]
    fn token_transport_prefers_cookie_then_header_then_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-bearer"));
        assert_eq!(context(headers.clone()).token_value().as_deref(), Some("from-bearer"));

        headers.insert("token", HeaderValue::from_static("from-header"));
        assert_eq!(context(headers.clone()).token_value().as_deref(), Some("from-header"));

        headers.insert(COOKIE, HeaderValue::from_static("other=1; token=from-cookie"));
        assert_eq!(context(headers).token_value().as_deref(), Some("from-cookie"));
    }

    #[tokio::test]
    async fn set_then_get_user_id_roundtrip() {
        let ctx = context(HeaderMap::new());
        ctx.set_user_id("user-1", Duration::from_secs(3600))
            .await
            .expect("set should succeed");

        let user_id = ctx.user_id().await.expect("get should succeed");
        assert_eq!(user_id.as_deref(), Some("user-1"));

        let cookies = ctx.take_cookies();
        assert_eq!(cookies.len(), 1);
        assert!(cookies[0].starts_with("token="));
        assert!(cookies[0].contains("Max-Age=3600"));
    }

    #[tokio::test]
    async fn must_user_id_fails_with_no_auth() {
        let ctx = context(HeaderMap::new());
        let error = ctx.must_user_id().await.expect_err("should fail");
        assert_eq!(error.code, crate::error::Code::NoAuth);
    }

    #[tokio::test]
    async fn delete_user_id_clears_transport() {
        let ctx = context(HeaderMap::new());
        ctx.set_user_id("user-1", Duration::from_secs(3600))
            .await
            .expect("set should succeed");
        ctx.delete_user_id().await.expect("delete should succeed");

        assert_eq!(ctx.user_id().await.expect("get"), None);
        let cookies = ctx.take_cookies();
        assert!(cookies.last().expect("cookie").contains("Max-Age=0"));
    }

    #[tokio::test]
    async fn user_id_is_cached_after_first_resolution() {
        let storage: Arc<dyn TokenStorage> = Arc::new(SignedStorage::new("secret"));
        let value = storage
            .set(
                &crate::token::AuthPayload {
                    user_id: "user-9".to_string(),
                },
                Duration::from_secs(3600),
            )
            .await
            .expect("set should succeed");

        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("token={value}")).expect("header value"),
        );
        let ctx = RequestContext::new(
            Method::GET,
            "http://localhost/me".to_string(),
            "127.0.0.1".to_string(),
            headers,
            None,
            storage,
            "token".to_string(),
            "token".to_string(),
        );

        assert_eq!(ctx.user_id().await.expect("get").as_deref(), Some("user-9"));
        // Second resolution is served from the property bag.
        assert_eq!(ctx.user_id().await.expect("get").as_deref(), Some("user-9"));
    }

    #[test]
    fn bind_json_body() {
        #[derive(Debug, Deserialize)]
        struct Params {
            name: String,
        }

        let ctx = context_with_body(HeaderMap::new(), Some(r#"{"name":"alice"}"#));
        let params: Params = ctx.bind().expect("bind should succeed");
        assert_eq!(params.name, "alice");

        let ctx = context_with_body(HeaderMap::new(), Some("not json"));
        let error = ctx.bind::<Params>().expect_err("bind should fail");
        assert_eq!(error.code, crate::error::Code::ParameterError);
    }

    #[test]
    fn bind_query_for_get() {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Params {
            page: u64,
            page_size: u64,
            name: String,
        }

        let ctx = RequestContext::new(
            Method::GET,
            "http://localhost/list?page=2&pageSize=10&name=alice".to_string(),
            "127.0.0.1".to_string(),
            HeaderMap::new(),
            None,
            Arc::new(SignedStorage::new("secret")),
            "token".to_string(),
            "token".to_string(),
        );

        let params: Params = ctx.bind().expect("bind should succeed");
        assert_eq!(params.page, 2);
        assert_eq!(params.page_size, 10);
        assert_eq!(params.name, "alice");
    }

    #[test]
    fn client_ip_resolution_order() {
        let mut headers = HeaderMap::new();
        let peer = "10.0.0.9:4242".parse().ok();
        assert_eq!(client_ip(&headers, peer), "10.0.0.9");
        assert_eq!(client_ip(&headers, None), "unknown");

        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(client_ip(&headers, peer), "9.9.9.9");

        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4, 5.6.7.8"));
        assert_eq!(client_ip(&headers, peer), "1.2.3.4");
    }
}
