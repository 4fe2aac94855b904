use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::redirect::Policy;
use reqwest::{Client, Proxy, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl ChatCompletionResponse {
    /// Content of the first choice, if the model returned any
    pub fn first_content(&self) -> Option<&str> {
        self.choices
            .first()
            .map(|choice| choice.message.content.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Client for an OpenAI-compatible API.
///
/// Owns its own transport: base URL, optional proxy, redirect following and a
/// 60 second request timeout. Clones share the transport and the closed flag.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: Client,
    base_url: Url,
    closed: Arc<AtomicBool>,
}

impl OpenAiClient {
    pub fn new(api_key: &str, base_url: &str, proxy: Option<&str>) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .with_context(|| format!("Invalid OpenAI base URL: {}", base_url))?;
        // Url::join drops the last segment unless the path ends with a slash
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let mut auth = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .context("OpenAI API key contains invalid header characters")?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let mut builder = Client::builder()
            .default_headers(headers)
            .redirect(Policy::limited(MAX_REDIRECTS))
            .timeout(REQUEST_TIMEOUT);
        if let Some(proxy) = proxy {
            builder = builder
                .proxy(Proxy::all(proxy).with_context(|| format!("Invalid proxy URL: {}", proxy))?);
        }

        let http = builder
            .build()
            .context("Failed to create OpenAI HTTP client")?;

        info!("OpenAI client configured for {}", base_url);

        Ok(Self {
            http,
            base_url,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting requests on every clone; in-flight requests are left
    /// to finish and pooled connections go away with the last handle
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("OpenAI client already closed");
        } else {
            info!("OpenAI client closed");
        }
    }

    pub async fn chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse> {
        debug!(
            "Requesting chat completion: model={}, messages={}",
            request.model,
            request.messages.len()
        );
        self.post_json("chat/completions", request).await
    }

    pub async fn get_json<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        let url = self.endpoint(path)?;
        let response = self.http.get(url).send().await?;
        Self::decode(response).await
    }

    pub async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        let response = self.http.post(url).json(body).send().await?;
        Self::decode(response).await
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        if self.is_closed() {
            bail!("OpenAI client is closed");
        }
        self.base_url
            .join(path.trim_start_matches('/'))
            .with_context(|| format!("Invalid OpenAI API path: {}", path))
    }

    async fn decode<R: DeserializeOwned>(response: reqwest::Response) -> Result<R> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("OpenAI API returned {}: {}", status, body));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| anyhow!("Failed to decode OpenAI API response: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn completion_body() -> serde_json::Value {
        serde_json::json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "pong"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
        })
    }

    fn ping_request() -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![ChatMessage::user("ping")],
            temperature: None,
            max_tokens: Some(16),
        }
    }

    #[tokio::test]
    async fn chat_completion_sends_bearer_auth_under_base_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({"model": "gpt-4o-mini"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body()))
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenAiClient::new("sk-test", &format!("{}/v1", server.uri()), None).unwrap();
        let response = client.chat_completion(&ping_request()).await.unwrap();

        assert_eq!(response.first_content(), Some("pong"));
        assert_eq!(response.usage.map(|u| u.total_tokens), Some(4));
    }

    #[tokio::test]
    async fn error_status_is_reported_with_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let client = OpenAiClient::new("sk-wrong", &format!("{}/v1/", server.uri()), None).unwrap();
        let err = client
            .get_json::<serde_json::Value>("/models")
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("401"), "{}", message);
        assert!(message.contains("bad key"), "{}", message);
    }

    #[tokio::test]
    async fn requests_fail_after_close() {
        let client = OpenAiClient::new("sk-test", "http://127.0.0.1:9/v1", None).unwrap();
        let clone = client.clone();

        client.close();

        assert!(clone.is_closed());
        let err = clone.chat_completion(&ping_request()).await.unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[test]
    fn rejects_invalid_base_url() {
        assert!(OpenAiClient::new("sk-test", "not a url", None).is_err());
    }

    #[test]
    fn accepts_proxy_configuration() {
        let client =
            OpenAiClient::new("sk-test", "https://api.openai.com/v1", Some("http://proxy:3128"))
                .unwrap();

        assert_eq!(client.base_url().as_str(), "https://api.openai.com/v1/");
    }
}
