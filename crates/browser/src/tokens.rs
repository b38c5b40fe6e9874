//! Parsing of session tokens from observed traffic and page HTML.

use once_cell::sync::Lazy;
use regex::Regex;

/// Path fragment of the batch-execution endpoint; a request to it means the app is signed in.
pub const BATCHEXECUTE_MARKER: &str = "/data/batchexecute";

static CSRF_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#""SNlM0e":"([^"]+)""#).unwrap());
static SESSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#""FdrFJe":"(-?\d+)""#).unwrap());
static SESSION_ALT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"f\.sid["\s:=]+["']?(-?\d+)"#).unwrap());
static BUILD_LABEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#""cfb2h":"([^"]+)""#).unwrap());
static EMAIL_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#""oPEP7c":"([^"]+@[^"]+)""#,
        r#"data-email="([^"]+)""#,
        r#""([a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,})""#,
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Tokens carried by the first batch-execution request after sign-in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoginSignal {
    pub session_id: Option<String>,
    pub build_label: Option<String>,
    pub csrf_token: Option<String>,
}

impl LoginSignal {
    /// `None` unless `url` targets the batch-execution endpoint.
    pub fn from_request(url: &str, post_data: Option<&str>) -> Option<Self> {
        if !url.contains(BATCHEXECUTE_MARKER) {
            return None;
        }
        let mut signal = LoginSignal::default();
        if let Ok(parsed) = url::Url::parse(url) {
            for (key, value) in parsed.query_pairs() {
                match key.as_ref() {
                    "f.sid" => signal.session_id = non_empty(&value),
                    "bl" => signal.build_label = non_empty(&value),
                    _ => {}
                }
            }
        }
        if let Some(body) = post_data {
            signal.csrf_token = url::form_urlencoded::parse(body.as_bytes())
                .find(|(k, _)| k == "at")
                .and_then(|(_, v)| non_empty(&v));
        }
        Some(signal)
    }

    /// Parse a `Network.requestWillBeSent` event's params.
    pub fn from_event(params: &serde_json::Value) -> Option<Self> {
        let request = params.get("request")?;
        let url = request.get("url")?.as_str()?;
        let post_data = request.get("postData").and_then(|v| v.as_str());
        Self::from_request(url, post_data)
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

pub fn extract_csrf_token(html: &str) -> Option<String> {
    CSRF_RE.captures(html).map(|c| c[1].to_string())
}

pub fn extract_session_id(html: &str) -> Option<String> {
    SESSION_RE
        .captures(html)
        .or_else(|| SESSION_ALT_RE.captures(html))
        .map(|c| c[1].to_string())
}

pub fn extract_build_label(html: &str) -> Option<String> {
    BUILD_LABEL_RE.captures(html).map(|c| c[1].to_string())
}

/// First plausible account email, skipping service-owned addresses.
pub fn extract_email(html: &str) -> Option<String> {
    for re in EMAIL_RES.iter() {
        for cap in re.captures_iter(html) {
            let candidate = &cap[1];
            if candidate.contains("@google.com") || candidate.contains("@gstatic") {
                continue;
            }
            if let Some((_, domain)) = candidate.rsplit_once('@') {
                if domain.contains('.') {
                    return Some(candidate.to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_signal_from_batchexecute_request() {
        let url = "https://notebooklm.google.com/_/LabsTailwindUi/data/batchexecute\
                   ?rpcids=wXbhsf&source-path=%2F&bl=boq_labs-tailwind-frontend_20260101.00_p0\
                   &f.sid=-123456789&hl=en&_reqid=1234&rt=c";
        let body = "f.req=%5B%5B%5B%22wXbhsf%22%5D%5D%5D&at=AJpMio%3A1700000000000&";
        let signal = LoginSignal::from_request(url, Some(body)).unwrap();
        assert_eq!(signal.session_id.as_deref(), Some("-123456789"));
        assert_eq!(
            signal.build_label.as_deref(),
            Some("boq_labs-tailwind-frontend_20260101.00_p0")
        );
        assert_eq!(signal.csrf_token.as_deref(), Some("AJpMio:1700000000000"));
    }

    #[test]
    fn test_non_batch_requests_are_not_signals() {
        assert!(LoginSignal::from_request("https://accounts.google.com/signin", None).is_none());
        let event = serde_json::json!({"request": {"url": "https://notebooklm.google.com/app.js"}});
        assert!(LoginSignal::from_event(&event).is_none());
    }

    #[test]
    fn test_signal_without_body_has_no_csrf() {
        let event = serde_json::json!({
            "request": {"url": "https://h/_/X/data/batchexecute?f.sid=1&bl="}
        });
        let signal = LoginSignal::from_event(&event).unwrap();
        assert_eq!(signal.session_id.as_deref(), Some("1"));
        assert!(signal.build_label.is_none());
        assert!(signal.csrf_token.is_none());
    }

    #[test]
    fn test_html_token_fallbacks() {
        let html = r#"<script>window.WIZ_global_data = {"SNlM0e":"tok:123","FdrFJe":"-987",
            "cfb2h":"boq_labs_20260105","oPEP7c":"alice@example.org"};</script>"#;
        assert_eq!(extract_csrf_token(html).as_deref(), Some("tok:123"));
        assert_eq!(extract_session_id(html).as_deref(), Some("-987"));
        assert_eq!(extract_build_label(html).as_deref(), Some("boq_labs_20260105"));
        assert_eq!(extract_email(html).as_deref(), Some("alice@example.org"));
        assert!(extract_csrf_token("<html></html>").is_none());
    }

    #[test]
    fn test_session_id_alternate_form() {
        assert_eq!(extract_session_id("var x = 'f.sid=4242';").as_deref(), Some("4242"));
    }

    #[test]
    fn test_email_skips_service_addresses() {
        let html = r#"{"a":"noreply@google.com","b":"icons@gstatic.com","c":"bob@corp.io"}"#;
        assert_eq!(extract_email(html).as_deref(), Some("bob@corp.io"));
        assert!(extract_email(r#"{"a":"x@google.com"}"#).is_none());
    }
}
