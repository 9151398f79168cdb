//! HTTP provider for OpenAI-compatible chat-completion endpoints (Together AI by default).

use serde::{Deserialize, Serialize};
use std::fmt;
use tardis_types::{
    ChatMessage, CompletionRequest, CompletionResponse, LlmError, LlmProvider, TokenUsage,
};

const DEFAULT_URL: &str = "https://api.together.xyz/v1/chat/completions";
const DEFAULT_MODEL: &str = "meta-llama/Llama-3-8b-chat-hf";

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

/// Provider that posts to an OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    name: String,
    api_url: String,
    api_key: Option<String>,
    default_model: String,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        name: impl Into<String>,
        api_url: impl Into<String>,
        api_key: Option<String>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            name: name.into(),
            api_url: api_url.into(),
            api_key,
            default_model: default_model.into(),
        }
    }

    /// Together AI provider configured from `TOGETHER_API_URL`, `TOGETHER_API_KEY`
    /// and `TOGETHER_MODEL`.
    pub fn from_env() -> Self {
        let api_url =
            std::env::var("TOGETHER_API_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
        let api_key = std::env::var("TOGETHER_API_KEY").ok().filter(|k| !k.is_empty());
        let model = std::env::var("TOGETHER_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Self::new("together", api_url, api_key, model)
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }
}

impl fmt::Debug for OpenAiCompatibleProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiCompatibleProvider")
            .field("name", &self.name)
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

fn parse_completion(
    body: &str,
    provider: &str,
    requested_model: &str,
) -> Result<CompletionResponse, LlmError> {
    let parsed: ChatCompletionResponse =
        serde_json::from_str(body).map_err(|e| LlmError::Parse(e.to_string()))?;
    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or(LlmError::EmptyResponse)?;
    let usage = parsed.usage.map(|u| {
        let prompt = u.prompt_tokens.unwrap_or(0);
        let completion = u.completion_tokens.unwrap_or(0);
        TokenUsage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: u.total_tokens.unwrap_or(prompt + completion),
        }
    });
    Ok(CompletionResponse {
        content,
        model: parsed.model.unwrap_or_else(|| requested_model.to_string()),
        provider: provider.to_string(),
        usage,
    })
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let model = if req.model.is_empty() {
            self.default_model.as_str()
        } else {
            req.model.as_str()
        };
        let body = ChatCompletionRequest {
            model,
            messages: &req.messages,
            max_tokens: req.max_tokens,
            temperature: req.temperature,
        };
        let mut http = self.client.post(&self.api_url).json(&body);
        if let Some(ref key) = self.api_key {
            http = http.bearer_auth(key);
        }
        let res = http.send().await.map_err(|e| LlmError::Http(e.to_string()))?;
        let status = res.status();
        let text = res.text().await.map_err(|e| LlmError::Http(e.to_string()))?;
        if !status.is_success() {
            tracing::warn!(provider = %self.name, model, status = %status, "completion request failed");
            return Err(LlmError::Api {
                provider: self.name.clone(),
                status: status.as_u16(),
                body: text,
            });
        }
        parse_completion(&text, &self.name, model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_first_choice_and_usage() {
        let body = r#"{
            "model": "meta-llama/Llama-3-70b-chat-hf",
            "choices": [{"message": {"role": "assistant", "content": "Contain the host."}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 4}
        }"#;
        let resp = parse_completion(body, "together", "ignored").unwrap();
        assert_eq!(resp.content, "Contain the host.");
        assert_eq!(resp.model, "meta-llama/Llama-3-70b-chat-hf");
        assert_eq!(resp.provider, "together");
        assert_eq!(resp.usage.unwrap().total_tokens, 16);
    }

    #[test]
    fn empty_choices_are_an_error() {
        assert!(matches!(
            parse_completion(r#"{"choices": []}"#, "together", "m"),
            Err(LlmError::EmptyResponse)
        ));
        assert!(matches!(
            parse_completion("<html>", "together", "m"),
            Err(LlmError::Parse(_))
        ));
    }

    #[test]
    fn request_body_omits_unset_options() {
        let messages = vec![ChatMessage::user("hi")];
        let body = ChatCompletionRequest {
            model: "m",
            messages: &messages,
            max_tokens: None,
            temperature: Some(0.2),
        };
        let v = serde_json::to_value(&body).unwrap();
        assert!(v.get("max_tokens").is_none());
        assert_eq!(v["messages"][0]["role"], "user");
    }
}
