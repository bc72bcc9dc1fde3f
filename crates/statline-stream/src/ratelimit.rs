//! Rate-limit metadata carried in `/chat` response headers

use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";

/// Parsed `X-RateLimit-*` headers. Missing or unparsable headers are `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Unix timestamp (seconds) at which the window resets
    pub reset: Option<i64>,
}

impl RateLimitInfo {
    /// Extract rate-limit info from response headers, `None` if no header is present.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let info = Self {
            limit: parse_header(headers, LIMIT_HEADER),
            remaining: parse_header(headers, REMAINING_HEADER),
            reset: parse_header(headers, RESET_HEADER),
        };

        if info == Self::default() {
            None
        } else {
            Some(info)
        }
    }

    /// True when the server reported no remaining requests in this window
    pub fn is_exhausted(&self) -> bool {
        self.remaining == Some(0)
    }
}

fn parse_header<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}
