//! Request side of the batch-execution wire format.

use nlmkit_core::{Error, Result, ServiceConfig};
use serde_json::{json, Value};

/// One operation to invoke.
#[derive(Debug, Clone)]
pub struct RpcCall {
    pub operation_id: String,
    pub params: Value,
    /// Page path the call is made from; `/` when unset.
    pub source_path: Option<String>,
}

impl RpcCall {
    pub fn new(operation_id: impl Into<String>, params: Value) -> Self {
        Self {
            operation_id: operation_id.into(),
            params,
            source_path: None,
        }
    }

    pub fn at(mut self, source_path: impl Into<String>) -> Self {
        self.source_path = Some(source_path.into());
        self
    }

    pub fn source_path(&self) -> &str {
        self.source_path.as_deref().unwrap_or("/")
    }
}

/// `[[[op, "<params as JSON>", null, "generic"]]]`
pub fn encode_envelope(operation_id: &str, params: &Value) -> Value {
    json!([[[operation_id, params.to_string(), Value::Null, "generic"]]])
}

/// Form body: `f.req=<envelope>&at=<csrf>&`.
pub fn encode_body(operation_id: &str, params: &Value, csrf_token: Option<&str>) -> String {
    let envelope = encode_envelope(operation_id, params).to_string();
    let mut body = format!("f.req={}&", urlencoding::encode(&envelope));
    if let Some(csrf) = csrf_token.filter(|t| !t.is_empty()) {
        body.push_str(&format!("at={}&", urlencoding::encode(csrf)));
    }
    body
}

/// Query parameters that address one batch call.
#[derive(Debug, Clone)]
pub struct UrlParams<'a> {
    pub operation_id: &'a str,
    pub source_path: &'a str,
    pub build_label: &'a str,
    pub session_id: Option<&'a str>,
    pub request_id: u64,
}

pub fn build_url(service: &ServiceConfig, params: &UrlParams<'_>) -> Result<url::Url> {
    let mut url = url::Url::parse(&service.batchexecute_url())
        .map_err(|e| Error::Config(format!("Invalid service baseUrl: {}", e)))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("rpcids", params.operation_id);
        query.append_pair("source-path", params.source_path);
        query.append_pair("bl", params.build_label);
        if let Some(sid) = params.session_id.filter(|s| !s.is_empty()) {
            query.append_pair("f.sid", sid);
        }
        query.append_pair("hl", &service.language);
        query.append_pair("_reqid", &params.request_id.to_string());
        query.append_pair("rt", "c");
    }
    Ok(url)
}
