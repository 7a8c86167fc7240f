use crate::i18n::I18n;
use crate::request::Lang;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Stable error code tokens. These are the wire values and double as the
/// translation keys for localized messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Code {
    #[serde(rename = "OK")]
    Ok,
    NoContent,
    NotFound,
    NotMatch,
    NotImplemented,
    ParameterError,
    Conflict,
    ThirdPartyError,
    InternalError,
    MethodNotAllowed,
    RateLimit,
    Forbidden,
    NoAuth,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::NoContent => "NoContent",
            Self::NotFound => "NotFound",
            Self::NotMatch => "NotMatch",
            Self::NotImplemented => "NotImplemented",
            Self::ParameterError => "ParameterError",
            Self::Conflict => "Conflict",
            Self::ThirdPartyError => "ThirdPartyError",
            Self::InternalError => "InternalError",
            Self::MethodNotAllowed => "MethodNotAllowed",
            Self::RateLimit => "RateLimit",
            Self::Forbidden => "Forbidden",
            Self::NoAuth => "NoAuth",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured client-facing error. `message` is filled in at response time
/// by the i18n translator unless a literal message was attached.
#[derive(Debug, Clone, Serialize)]
pub struct Error {
    pub code: Code,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub argv: Vec<Value>,
}

impl Error {
    pub fn new(code: Code) -> Self {
        Self {
            code,
            message: None,
            argv: Vec::new(),
        }
    }

    pub fn with_message(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
            argv: Vec::new(),
        }
    }

    pub fn with_argv(code: Code, argv: Vec<Value>) -> Self {
        Self {
            code,
            message: None,
            argv,
        }
    }

    /// Resolve the client-facing message for the negotiated language.
    /// Positional argv formats the code's template; an attached literal
    /// message is kept unchanged.
    pub fn localize(&mut self, lang: Lang, i18n: &I18n) {
        if !self.argv.is_empty() {
            self.message = Some(i18n.translate_format(lang.as_str(), self.code.as_str(), &self.argv));
        } else if self.message.is_none() {
            self.message = Some(i18n.translate(lang.as_str(), self.code.as_str()));
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(text) => f.write_str(&text),
            Err(_) => Err(fmt::Error),
        }
    }
}

impl std::error::Error for Error {}

/// Pagination request parameters, 1-based.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub page: u64,
    pub page_size: u64,
}

/// Pagination echo attached to paged success envelopes.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u64,
    pub page_size: u64,
    pub total_pages: u64,
    pub total_size: u64,
}

/// Success envelope produced by handlers.
#[derive(Debug, Clone, Serialize)]
pub struct Data {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}

impl Data {
    pub fn new(data: impl Serialize) -> Self {
        Self {
            data: serde_json::to_value(data).ok(),
            pagination: None,
        }
    }

    pub fn with_pagination(data: impl Serialize, pagination: Pagination) -> Self {
        Self {
            data: serde_json::to_value(data).ok(),
            pagination: Some(pagination),
        }
    }
}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(text) => f.write_str(&text),
            Err(_) => Err(fmt::Error),
        }
    }
}

/// Handler contract: `Ok(Some(_))` is a success envelope, `Ok(None)` is an
/// explicit no-content success, `Err(_)` is a structured error.
pub type HandlerResult = Result<Option<Data>, Error>;
