//! Sampling rules and request matching.

use serde::{Deserialize, Serialize};

/// Descriptor of an incoming request, matched against rule patterns.
///
/// Fields left empty still match wildcard (`*`) patterns, so a request
/// built with `Default::default()` falls through to catch-all rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SamplingRequest {
    /// Host header of the request.
    pub host: String,
    /// HTTP method.
    pub method: String,
    /// URL path.
    pub url_path: String,
    /// Logical name of the service handling the request.
    pub service_name: String,
}

impl SamplingRequest {
    /// Creates a descriptor carrying only the service name.
    pub fn for_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }
}

/// One prioritized sampling rule: a matcher over request attributes, a
/// per-second reservoir of guaranteed-sampled requests, and a fixed rate
/// applied once the reservoir is exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingRule {
    /// Human-readable rule name, used in logs.
    #[serde(default)]
    pub rule_name: String,
    /// Evaluation priority; lower wins, ties broken by declaration order.
    #[serde(default)]
    pub priority: u32,
    /// Wildcard pattern over the request host.
    #[serde(default = "match_all")]
    pub host: String,
    /// Wildcard pattern over the HTTP method.
    #[serde(default = "match_all")]
    pub http_method: String,
    /// Wildcard pattern over the URL path.
    #[serde(default = "match_all")]
    pub url_path: String,
    /// Wildcard pattern over the logical service name.
    #[serde(default = "match_all")]
    pub service_name: String,
    /// Fraction of requests sampled after the reservoir is spent, 0.0–1.0.
    #[serde(default)]
    pub fixed_rate: f64,
    /// Requests per second guaranteed sampled before rate-limiting.
    #[serde(default)]
    pub reservoir_size: u32,
}

fn match_all() -> String {
    "*".to_string()
}

impl SamplingRule {
    /// Creates a catch-all rule with the given name and priority.
    pub fn new(rule_name: impl Into<String>, priority: u32) -> Self {
        Self {
            rule_name: rule_name.into(),
            priority,
            host: match_all(),
            http_method: match_all(),
            url_path: match_all(),
            service_name: match_all(),
            fixed_rate: 0.0,
            reservoir_size: 0,
        }
    }

    /// Sets the host pattern.
    pub fn with_host(mut self, pattern: impl Into<String>) -> Self {
        self.host = pattern.into();
        self
    }

    /// Sets the HTTP method pattern.
    pub fn with_method(mut self, pattern: impl Into<String>) -> Self {
        self.http_method = pattern.into();
        self
    }

    /// Sets the URL path pattern.
    pub fn with_path(mut self, pattern: impl Into<String>) -> Self {
        self.url_path = pattern.into();
        self
    }

    /// Sets the service name pattern.
    pub fn with_service(mut self, pattern: impl Into<String>) -> Self {
        self.service_name = pattern.into();
        self
    }

    /// Sets the fixed rate, clamped to 0.0–1.0.
    pub fn with_fixed_rate(mut self, rate: f64) -> Self {
        self.fixed_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets the reservoir size.
    pub fn with_reservoir(mut self, size: u32) -> Self {
        self.reservoir_size = size;
        self
    }

    /// Returns `true` if every pattern matches the request descriptor.
    pub fn matches(&self, request: &SamplingRequest) -> bool {
        wildcard_match(&self.host, &request.host)
            && wildcard_match(&self.http_method, &request.method)
            && wildcard_match(&self.url_path, &request.url_path)
            && wildcard_match(&self.service_name, &request.service_name)
    }
}

/// Case-insensitive glob match: `*` matches any run of characters, `?`
/// matches exactly one.
pub(crate) fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().flat_map(char::to_lowercase).collect();
    let text: Vec<char> = text.chars().flat_map(char::to_lowercase).collect();

    let (mut pi, mut ti) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < text.len() {
        if pi < pattern.len() && (pattern[pi] == '?' || pattern[pi] == text[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < pattern.len() && pattern[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = backtrack {
            backtrack = Some((star_pi, star_ti + 1));
            pi = star_pi + 1;
            ti = star_ti + 1;
        } else {
            return false;
        }
    }
    while pi < pattern.len() && pattern[pi] == '*' {
        pi += 1;
    }
    pi == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_basics() {
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("", ""));
        assert!(!wildcard_match("", "x"));
        assert!(wildcard_match("?", "x"));
        assert!(!wildcard_match("?", ""));
        assert!(wildcard_match("a*c", "abc"));
        assert!(wildcard_match("a*c", "ac"));
        assert!(!wildcard_match("a*c", "ab"));
        assert!(wildcard_match("/api/*", "/api/users/42"));
        assert!(!wildcard_match("/api/*", "/health"));
        assert!(wildcard_match("*.example.com", "shop.example.com"));
    }

    #[test]
    fn wildcard_is_case_insensitive() {
        assert!(wildcard_match("GET", "get"));
        assert!(wildcard_match("*.Example.COM", "shop.example.com"));
    }

    #[test]
    fn rule_matches_all_four_attributes() {
        let rule = SamplingRule::new("checkout", 1)
            .with_host("*.example.com")
            .with_method("POST")
            .with_path("/checkout/*")
            .with_service("storefront");
        let mut request = SamplingRequest {
            host: "shop.example.com".to_string(),
            method: "POST".to_string(),
            url_path: "/checkout/cart".to_string(),
            service_name: "storefront".to_string(),
        };
        assert!(rule.matches(&request));
        request.method = "GET".to_string();
        assert!(!rule.matches(&request));
    }

    #[test]
    fn catch_all_rule_matches_empty_request() {
        let rule = SamplingRule::new("default", 100);
        assert!(rule.matches(&SamplingRequest::default()));
    }

    #[test]
    fn fixed_rate_is_clamped() {
        assert_eq!(SamplingRule::new("r", 1).with_fixed_rate(1.5).fixed_rate, 1.0);
        assert_eq!(SamplingRule::new("r", 1).with_fixed_rate(-0.5).fixed_rate, 0.0);
    }

    #[test]
    fn rules_deserialize_with_defaults() {
        let rule: SamplingRule =
            serde_json::from_str(r#"{"rule_name":"api","priority":5,"url_path":"/api/*","fixed_rate":0.1,"reservoir_size":10}"#)
                .unwrap();
        assert_eq!(rule.host, "*");
        assert_eq!(rule.http_method, "*");
        assert_eq!(rule.url_path, "/api/*");
        assert_eq!(rule.reservoir_size, 10);
    }
}
