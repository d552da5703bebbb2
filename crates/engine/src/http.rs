//! HTTP backend over reqwest

use kwrun_common::{
    redact_text, redact_value, Action, Capability, Error, HttpConfig, Request, Result,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::backend::{Backend, ExecutionOutcome, Payload};
use crate::vars::render;

/// Executes `request` actions
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: Option<String>,
    headers: BTreeMap<String, String>,
}

impl HttpBackend {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(ms) = config.timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        let client = builder
            .build()
            .map_err(|e| Error::Backend(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            headers: config.headers.clone(),
        })
    }

    /// Absolute URLs pass through; relative ones are joined to the base URL
    pub fn url_for(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            return url.to_string();
        }
        match &self.base_url {
            Some(base) => format!(
                "{}/{}",
                base.trim_end_matches('/'),
                url.trim_start_matches('/')
            ),
            None => url.to_string(),
        }
    }

    fn build(&self, request: &Request) -> Result<reqwest::RequestBuilder> {
        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::Backend(format!("invalid HTTP method '{}'", request.method)))?;

        let mut builder = self.client.request(method, self.url_for(&request.url));
        for (name, value) in self.headers.iter().chain(request.headers.iter()) {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.params.is_empty() {
            let query: Vec<(&str, String)> = request
                .params
                .iter()
                .map(|(k, v)| (k.as_str(), render(v)))
                .collect();
            builder = builder.query(&query);
        }
        if let Some(json) = &request.json {
            builder = builder.json(json);
        } else if let Some(data) = &request.data {
            let form: Vec<(&str, String)> =
                data.iter().map(|(k, v)| (k.as_str(), render(v))).collect();
            builder = builder.form(&form);
        } else if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        if let Some(ms) = request.timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        Ok(builder)
    }
}

#[async_trait::async_trait]
impl Backend for HttpBackend {
    fn capability(&self) -> Capability {
        Capability::Request
    }

    async fn execute(&self, payload: &Payload) -> Result<ExecutionOutcome> {
        let Action::Request(request) = &payload.action else {
            return Err(Error::Backend(
                "HTTP backend only serves request actions".to_string(),
            ));
        };

        let url = self.url_for(&request.url);
        debug!("{} {} ({})", request.method, redact_text(&url), payload.case_name);

        let start = Instant::now();
        let response = self.build(request)?.send().await.map_err(map_reqwest)?;
        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let text = response.text().await.map_err(map_reqwest)?;
        let elapsed = start.elapsed();

        let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        let raw = exchange_record(&request.method, &url, status, &headers, &body, &text);

        Ok(ExecutionOutcome {
            status: Some(status),
            url: Some(url),
            body,
            text,
            headers,
            elements: BTreeMap::new(),
            elapsed,
            raw,
        })
    }
}

/// The exchange as kept in reports, credentials masked
fn exchange_record(
    method: &str,
    url: &str,
    status: u16,
    headers: &BTreeMap<String, String>,
    body: &Value,
    text: &str,
) -> Value {
    json!({
        "method": method,
        "url": redact_text(url),
        "status": status,
        "headers": redact_value(&json!(headers)),
        "body": if body.is_null() { Value::String(redact_text(text)) } else { redact_value(body) },
    })
}

fn map_reqwest(err: reqwest::Error) -> Error {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        Error::BackendTransport(err.to_string())
    } else {
        Error::Backend(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining() {
        let backend = HttpBackend::new(&HttpConfig {
            base_url: Some("http://api.local/".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(backend.url_for("/v1/ping"), "http://api.local/v1/ping");
        assert_eq!(backend.url_for("v1/ping"), "http://api.local/v1/ping");
        assert_eq!(backend.url_for("https://other/x"), "https://other/x");
    }

    #[test]
    fn test_exchange_record_masks_credentials() {
        let headers: BTreeMap<String, String> = [
            ("authorization".to_string(), "Bearer abc".to_string()),
            ("content-type".to_string(), "application/json".to_string()),
        ]
        .into_iter()
        .collect();
        let body = json!({"data": {"token": "abc", "user": "alice"}});
        let raw = exchange_record(
            "POST",
            "http://api.local/login?token=abc",
            200,
            &headers,
            &body,
            &body.to_string(),
        );

        assert_eq!(raw["url"], json!("http://api.local/login?token=***"));
        assert_eq!(raw["headers"]["authorization"], json!("***"));
        assert_eq!(raw["headers"]["content-type"], json!("application/json"));
        assert_eq!(raw["body"]["data"]["token"], json!("***"));
        assert_eq!(raw["body"]["data"]["user"], json!("alice"));

        let raw = exchange_record("GET", "/x", 500, &BTreeMap::new(), &Value::Null, "Bearer abc");
        assert_eq!(raw["body"], json!("Bearer ***"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let backend = HttpBackend::new(&HttpConfig {
            base_url: Some("http://127.0.0.1:9".to_string()),
            timeout_ms: Some(2000),
            ..Default::default()
        })
        .unwrap();
        let payload = Payload {
            case_name: "refused".into(),
            action: Action::Request(Request {
                method: "GET".into(),
                url: "/ping".into(),
                headers: Default::default(),
                params: Default::default(),
                json: None,
                data: None,
                body: None,
                timeout_ms: None,
            }),
            probes: vec![],
        };
        let err = backend.execute(&payload).await.unwrap_err();
        assert!(err.is_transport(), "unexpected error: {err}");
    }
}
