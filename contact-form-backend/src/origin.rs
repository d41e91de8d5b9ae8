use axum::http::{header, HeaderMap, HeaderValue};
use std::collections::HashSet;

/// Origins which may call the contact form endpoint from a browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedOrigins {
    Any,
    List(HashSet<String>),
}

impl AllowedOrigins {
    /// Parses `*` or a comma-separated list. An empty value allows every origin.
    pub fn parse(value: &str) -> Self {
        let origins: HashSet<String> = value
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(String::from)
            .collect();
        if origins.is_empty() || origins.contains("*") {
            AllowedOrigins::Any
        } else {
            AllowedOrigins::List(origins)
        }
    }

    pub fn evaluate(&self, declared_origin: Option<&HeaderValue>) -> OriginDecision {
        let Some(origin) = declared_origin else {
            // Not a cross-origin call.
            return OriginDecision {
                allowed: true,
                headers: HeaderMap::new(),
            };
        };
        let allowed = match self {
            AllowedOrigins::Any => true,
            AllowedOrigins::List(origins) => origin
                .to_str()
                .map(|origin| origins.contains(origin))
                .unwrap_or(false),
        };
        let mut headers = HeaderMap::new();
        if allowed {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static("POST, OPTIONS"),
            );
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("Content-Type"),
            );
            headers.insert(
                header::ACCESS_CONTROL_MAX_AGE,
                HeaderValue::from_static("86400"),
            );
        }
        OriginDecision { allowed, headers }
    }
}

pub struct OriginDecision {
    pub allowed: bool,
    /// CORS headers to attach to the response. Empty unless an allowed origin was declared.
    pub headers: HeaderMap,
}
