use futures::stream::BoxStream;
use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::traits::NodeHandler;
use weft_core::types::{output, NodeInvocation, OutputSnapshot};
use weft_core::ExecutionContext;

use super::emit_once;

const DEFAULT_MAX_LENGTH: usize = 100_000;

/// Fetches `url` (input, or parameter) and emits the status and body.
/// HTML bodies are reduced to plain text.
pub struct HttpFetchNode;

impl NodeHandler for HttpFetchNode {
    fn node_type(&self) -> &str {
        "http_fetch"
    }

    fn description(&self) -> &str {
        "Fetch `url` and emit `status` and `body`; HTML is stripped to text and truncated to `max_length`."
    }

    fn timeout_secs(&self) -> u64 {
        60
    }

    fn run(
        &self,
        invocation: NodeInvocation,
        _ctx: ExecutionContext,
    ) -> BoxStream<'static, Result<OutputSnapshot>> {
        emit_once(async move {
            let node_type = invocation.node_type.as_str();
            let url = invocation
                .input("url")
                .or_else(|| invocation.param("url"))
                .and_then(|v| v.as_str())
                .ok_or_else(|| WeftError::MissingInput {
                    node_type: node_type.to_string(),
                    slot: "url".to_string(),
                })?
                .to_string();
            let max_length = invocation
                .param_u64("max_length")
                .map(|n| n as usize)
                .unwrap_or(DEFAULT_MAX_LENGTH);

            debug!(url = %url, "Fetching URL");

            let client = reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .user_agent(concat!("weft/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|e| {
                    WeftError::handler(node_type, format!("Failed to create HTTP client: {}", e))
                })?;

            let resp = client
                .get(&url)
                .send()
                .await
                .map_err(|e| WeftError::handler(node_type, format!("Request failed: {}", e)))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(WeftError::handler(
                    node_type,
                    format!(
                        "HTTP {} {}",
                        status.as_u16(),
                        status.canonical_reason().unwrap_or("Unknown")
                    ),
                ));
            }

            let content_type = resp
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();

            let body = resp.text().await.map_err(|e| {
                WeftError::handler(node_type, format!("Failed to read response body: {}", e))
            })?;

            let text = if content_type.contains("html") {
                strip_html_tags(&body)
                    .map_err(|e| WeftError::handler(node_type, e.to_string()))?
            } else {
                body
            };

            Ok(output([
                ("url", Value::String(url)),
                ("status", json!(status.as_u16())),
                ("body", Value::String(truncate(text, max_length))),
            ]))
        })
    }
}

/// Cut `text` to at most `max_length` bytes on a char boundary.
fn truncate(mut text: String, max_length: usize) -> String {
    if text.len() <= max_length {
        return text;
    }
    let mut cut = max_length;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text
}

/// Basic HTML tag stripping using regex.
fn strip_html_tags(html: &str) -> std::result::Result<String, regex::Error> {
    // Script and style blocks go entirely
    let re_script = Regex::new(r"(?is)<script[^>]*>.*?</script>")?;
    let cleaned = re_script.replace_all(html, "");
    let re_style = Regex::new(r"(?is)<style[^>]*>.*?</style>")?;
    let cleaned = re_style.replace_all(&cleaned, "");

    let re_tags = Regex::new(r"<[^>]+>")?;
    let text = re_tags.replace_all(&cleaned, "");

    let text = text
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ");

    let re_whitespace = Regex::new(r"\n{3,}")?;
    let text = re_whitespace.replace_all(&text, "\n\n");

    Ok(text.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_strip_html_tags() {
        let html = "<html><head><style>p{}</style><script>alert(1)</script></head>\
                    <body><p>Tom &amp; Jerry</p>\n\n\n\n<p>&lt;3</p></body></html>";
        assert_eq!(strip_html_tags(html).unwrap(), "Tom & Jerry\n\n<3");
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        assert_eq!(truncate("héllo".to_string(), 2), "h");
        assert_eq!(truncate("short".to_string(), 100), "short");
    }

    #[tokio::test]
    async fn test_missing_url_fails_without_network() {
        let result = HttpFetchNode
            .run(NodeInvocation::new("f", "http_fetch"), ExecutionContext::new())
            .next()
            .await
            .unwrap();
        assert!(matches!(result, Err(WeftError::MissingInput { ref slot, .. }) if slot == "url"));
    }
}
