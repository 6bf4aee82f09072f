use crate::config::{default_base_url, ClientConfig};
use crate::error::{classify_error_response, extract_api_error, ChatError, Result};
use crate::streaming::{ChunkStream, HttpChunkStream};
use crate::types::{ChatRequest, ChatResponse};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use tracing::debug;

/// Sends chat requests. Implemented over HTTP by [`OpenAIClient`]; tests
/// substitute scripted transports.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Non-streaming completion. The `stream` flag of `request` is cleared.
    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Streaming completion. The `stream` flag of `request` is set and the
    /// returned stream yields the raw event-stream body.
    async fn stream(&self, request: &ChatRequest) -> Result<Box<dyn ChunkStream>>;
}

/// Trait for providing authentication headers
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn get_auth_headers(&self) -> Result<Vec<(String, String)>>;
}

/// Trait for customizing requests before sending
pub trait RequestCustomizer: Send + Sync {
    fn customize_request(&self, request: &mut Value) -> Result<()>;
    fn get_additional_headers(&self) -> Vec<(String, String)>;
    fn customize_url(&self, base_url: &str, streaming: bool) -> String;
}

/// Bearer token authentication, optionally scoped to an organization
pub struct ApiKeyAuth {
    api_key: String,
    organization: Option<String>,
}

impl ApiKeyAuth {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            organization: None,
        }
    }

    pub fn with_organization(mut self, organization: Option<String>) -> Self {
        self.organization = organization;
        self
    }
}

#[async_trait]
impl AuthProvider for ApiKeyAuth {
    async fn get_auth_headers(&self) -> Result<Vec<(String, String)>> {
        let mut headers = vec![(
            "Authorization".to_string(),
            format!("Bearer {}", self.api_key),
        )];
        if let Some(organization) = &self.organization {
            headers.push(("OpenAI-Organization".to_string(), organization.clone()));
        }
        Ok(headers)
    }
}

/// `api-key` header authentication used by Azure deployments
pub struct AzureKeyAuth {
    api_key: String,
}

impl AzureKeyAuth {
    pub fn new(api_key: String) -> Self {
        Self { api_key }
    }
}

#[async_trait]
impl AuthProvider for AzureKeyAuth {
    async fn get_auth_headers(&self) -> Result<Vec<(String, String)>> {
        Ok(vec![("api-key".to_string(), self.api_key.clone())])
    }
}

/// Default request customizer for the OpenAI API
pub struct DefaultRequestCustomizer;

impl RequestCustomizer for DefaultRequestCustomizer {
    fn customize_request(&self, _request: &mut Value) -> Result<()> {
        Ok(())
    }

    fn get_additional_headers(&self) -> Vec<(String, String)> {
        vec![("Content-Type".to_string(), "application/json".to_string())]
    }

    fn customize_url(&self, base_url: &str, _streaming: bool) -> String {
        format!("{}/chat/completions", base_url.trim_end_matches('/'))
    }
}

/// Routes requests to an Azure deployment. The deployment selects the model,
/// so the `model` field is dropped from the body.
pub struct AzureRequestCustomizer {
    deployment: String,
    api_version: String,
}

impl AzureRequestCustomizer {
    pub fn new(deployment: String, api_version: String) -> Self {
        Self {
            deployment,
            api_version,
        }
    }
}

impl RequestCustomizer for AzureRequestCustomizer {
    fn customize_request(&self, request: &mut Value) -> Result<()> {
        if let Some(object) = request.as_object_mut() {
            object.remove("model");
        }
        Ok(())
    }

    fn get_additional_headers(&self) -> Vec<(String, String)> {
        vec![("Content-Type".to_string(), "application/json".to_string())]
    }

    fn customize_url(&self, base_url: &str, _streaming: bool) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            base_url.trim_end_matches('/'),
            self.deployment,
            self.api_version
        )
    }
}

pub struct OpenAIClient {
    client: Client,
    base_url: String,
    // Customization points
    auth_provider: Box<dyn AuthProvider>,
    request_customizer: Box<dyn RequestCustomizer>,
}

impl OpenAIClient {
    pub fn default_base_url() -> String {
        default_base_url()
    }

    pub fn new(api_key: String, base_url: String) -> Self {
        Self::with_customization(
            base_url,
            Box::new(ApiKeyAuth::new(api_key)),
            Box::new(DefaultRequestCustomizer),
        )
    }

    pub fn with_customization(
        base_url: String,
        auth_provider: Box<dyn AuthProvider>,
        request_customizer: Box<dyn RequestCustomizer>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url,
            auth_provider,
            request_customizer,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        match &config.azure {
            Some(azure) => Self::with_customization(
                config.base_url.clone(),
                Box::new(AzureKeyAuth::new(config.api_key.clone())),
                Box::new(AzureRequestCustomizer::new(
                    azure.deployment.clone(),
                    azure.api_version.clone(),
                )),
            ),
            None => Self::with_customization(
                config.base_url.clone(),
                Box::new(
                    ApiKeyAuth::new(config.api_key.clone())
                        .with_organization(config.organization.clone()),
                ),
                Box::new(DefaultRequestCustomizer),
            ),
        }
    }

    fn get_url(&self, streaming: bool) -> String {
        self.request_customizer
            .customize_url(&self.base_url, streaming)
    }

    async fn build_request(&self, request: ChatRequest, streaming: bool) -> Result<RequestBuilder> {
        let mut request_json = serde_json::to_value(request)?;

        // Allow request customizer to modify the request
        self.request_customizer
            .customize_request(&mut request_json)?;

        let url = self.get_url(streaming);
        debug!("Sending request to {}: {}", url, request_json);

        let mut request_builder = self.client.post(url);

        for (key, value) in self.auth_provider.get_auth_headers().await? {
            request_builder = request_builder.header(key, value);
        }
        for (key, value) in self.request_customizer.get_additional_headers() {
            request_builder = request_builder.header(key, value);
        }
        if streaming {
            request_builder = request_builder.header("Accept", "text/event-stream");
        }

        Ok(request_builder.json(&request_json))
    }
}

/// Passes 2xx responses through and classifies everything else.
async fn check_response_error(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await?;
    debug!("Request failed with status {}: {}", status, body);
    Err(classify_error_response(status.as_u16(), &body))
}

/// Parses a successful JSON body, which may still carry an `error` member.
fn parse_json_body<T: serde::de::DeserializeOwned>(status: u16, body: &str) -> Result<T> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| ChatError::protocol(format!("Failed to parse response: {e}")))?;
    if let Some(error) = extract_api_error(&value, Some(status)) {
        return Err(error);
    }
    serde_json::from_value(value)
        .map_err(|e| ChatError::protocol(format!("Unexpected response shape: {e}")))
}

#[async_trait]
impl ChatTransport for OpenAIClient {
    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let response = self
            .build_request(request.clone().into_non_streaming(), false)
            .await?
            .send()
            .await?;
        let response = check_response_error(response).await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        parse_json_body(status, &body)
    }

    async fn stream(&self, request: &ChatRequest) -> Result<Box<dyn ChunkStream>> {
        let response = self
            .build_request(request.clone().into_streaming(), true)
            .await?
            .send()
            .await?;
        let response = check_response_error(response).await?;

        // Some proxies answer a streaming request with a plain JSON error.
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("application/json"));
        if is_json {
            let status = response.status().as_u16();
            let body = response.text().await?;
            parse_json_body::<Value>(status, &body)?;
            return Err(ChatError::protocol(format!(
                "Expected an event stream, got a JSON body: {body}"
            )));
        }

        Ok(Box::new(HttpChunkStream::new(response)))
    }
}
