//! Request and response shapes of the remote shortening API

use crate::errors::{RelayError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiAction {
    #[serde(rename = "shorturl")]
    Shorturl,
    #[serde(rename = "stats")]
    Stats,
    #[serde(rename = "db-stats")]
    DbStats,
}

impl ApiAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiAction::Shorturl => "shorturl",
            ApiAction::Stats => "stats",
            ApiAction::DbStats => "db-stats",
        }
    }
}

/// Form fields for one API call
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ApiRequest {
    signature: String,
    action: ApiAction,
    format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    keyword: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u32>,
}

impl ApiRequest {
    pub fn new(signature: &str, action: ApiAction) -> Self {
        Self {
            signature: signature.to_string(),
            action,
            format: "json",
            url: None,
            keyword: None,
            filter: None,
            limit: None,
        }
    }

    /// `shorturl` for `url`; a blank keyword is left out.
    pub fn shorten(signature: &str, url: &str, keyword: Option<&str>) -> Self {
        let mut request = Self::new(signature, ApiAction::Shorturl);
        request.url = Some(url.to_string());
        request.keyword = keyword
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string);
        request
    }

    pub fn with_filter(mut self, filter: &str, limit: u32) -> Self {
        self.filter = Some(filter.to_string());
        self.limit = Some(limit);
        self
    }

    pub fn action(&self) -> ApiAction {
        self.action
    }

    /// Url-encoded form body
    pub fn to_form(&self) -> Result<String> {
        serde_urlencoded::to_string(self)
            .map_err(|e| RelayError::InvalidInput(format!("cannot encode request: {}", e)))
    }
}

/// Decoded API response; fields this client does not read are kept in `extra`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shorturl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Value>,
    #[serde(default, rename = "db-stats", skip_serializing_if = "Option::is_none")]
    pub db_stats: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ApiResponse {
    pub fn from_value(data: Value) -> Result<Self> {
        serde_json::from_value(data)
            .map_err(|e| RelayError::Transport(format!("unexpected response shape: {}", e)))
    }

    pub fn is_success(&self) -> bool {
        self.status.as_deref() == Some("success")
    }

    pub fn is_fail(&self) -> bool {
        self.status.as_deref() == Some("fail")
    }

    /// Classified failure when the server reported `status: fail`
    pub fn failure(&self) -> Option<ApiFailure> {
        self.is_fail()
            .then(|| ApiFailure::classify(self.message.as_deref().unwrap_or("API Error")))
    }
}

/// Domain failure reported by the remote service.
///
/// Classification matches English substrings of the server's message, so a
/// reworded or translated server message lands in `Unknown`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApiFailure {
    MissingUrl,
    KeywordExists,
    UrlExists,
    Unknown(String),
}

impl ApiFailure {
    pub fn classify(message: &str) -> Self {
        if message.contains("Missing or malformed URL") {
            ApiFailure::MissingUrl
        } else if message.contains("Keyword already exists") {
            ApiFailure::KeywordExists
        } else if message.contains("already exists") {
            ApiFailure::UrlExists
        } else {
            ApiFailure::Unknown(message.to_string())
        }
    }
}

impl fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiFailure::MissingUrl => write!(f, "the URL is missing or malformed"),
            ApiFailure::KeywordExists => write!(f, "this keyword is already taken, choose another"),
            ApiFailure::UrlExists => write!(f, "this URL has already been shortened"),
            ApiFailure::Unknown(message) => write!(f, "unknown error: {}", message),
        }
    }
}
