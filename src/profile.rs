//! Server profiles and endpoint derivation

use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Path of the API script under a server's base URL
pub const API_ENTRY_POINT: &str = "yourls-api.php";

/// Path of the admin interface under a server's base URL
pub const ADMIN_PATH: &str = "admin";

/// Identity of a configured server, used for selection and as a cache key
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKey {
    #[default]
    Primary,
    Additional,
}

impl ServerKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerKey::Primary => "primary",
            ServerKey::Additional => "additional",
        }
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "primary" => Ok(ServerKey::Primary),
            "additional" | "secondary" => Ok(ServerKey::Additional),
            other => Err(format!("unknown server '{}', expected primary or additional", other)),
        }
    }
}

/// One configured shortening-service endpoint
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerProfile {
    pub base_url: String,
    pub credential: String,
    pub display_name: Option<String>,
    pub is_primary: bool,
}

impl ServerProfile {
    pub fn primary(base_url: &str, credential: &str) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            credential: credential.trim().to_string(),
            display_name: None,
            is_primary: true,
        }
    }

    pub fn additional(base_url: &str, credential: &str, display_name: &str) -> Self {
        let name = display_name.trim();
        Self {
            base_url: normalize_base_url(base_url),
            credential: credential.trim().to_string(),
            display_name: (!name.is_empty()).then(|| name.to_string()),
            is_primary: false,
        }
    }

    /// Both URL and credential are present
    pub fn is_complete(&self) -> bool {
        !self.base_url.is_empty() && !self.credential.is_empty()
    }

    pub fn key(&self) -> ServerKey {
        if self.is_primary {
            ServerKey::Primary
        } else {
            ServerKey::Additional
        }
    }

    pub fn api_endpoint(&self) -> String {
        api_endpoint(&self.base_url)
    }

    pub fn admin_url(&self) -> String {
        format!("{}{}", normalize_base_url(&self.base_url), ADMIN_PATH)
    }

    /// Label for display: the configured name, or the server key
    pub fn label(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| self.key().to_string())
    }
}

/// Trim a base URL and leave it with exactly one trailing slash.
///
/// Blank input stays blank so that callers can still detect a missing URL.
pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let without_slashes = trimmed.trim_end_matches('/');
    format!("{}/", without_slashes)
}

/// API endpoint for a base URL, with or without its trailing slash
pub fn api_endpoint(base_url: &str) -> String {
    format!("{}{}", normalize_base_url(base_url), API_ENTRY_POINT)
}

/// True when `candidate` parses as an absolute, hierarchical URL
pub fn is_absolute_url(candidate: &str) -> bool {
    match Url::parse(candidate.trim()) {
        Ok(url) => !url.cannot_be_a_base() && url.has_host(),
        Err(_) => false,
    }
}
