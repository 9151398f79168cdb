//! Scripted provider for tests: no network, configurable failures, call log.

use std::collections::HashSet;
use std::sync::Mutex;
use tardis_types::{CompletionRequest, CompletionResponse, LlmError, LlmProvider, TokenUsage};

#[derive(Default)]
struct Script {
    failing_models: HashSet<String>,
    fail_all: bool,
    max_input_chars: Option<usize>,
}

/// Provider that echoes the last user message and fails on demand.
pub struct MockProvider {
    name: String,
    script: Mutex<Script>,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(Script::default()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fail every request for `model`.
    pub fn fail_model(&self, model: impl Into<String>) {
        if let Ok(mut s) = self.script.lock() {
            s.failing_models.insert(model.into());
        }
    }

    /// Fail every request.
    pub fn fail_always(&self) {
        if let Ok(mut s) = self.script.lock() {
            s.fail_all = true;
        }
    }

    /// Fail requests whose messages total more than `chars` characters.
    pub fn fail_over_chars(&self, chars: usize) {
        if let Ok(mut s) = self.script.lock() {
            s.max_input_chars = Some(chars);
        }
    }

    pub fn recover(&self) {
        if let Ok(mut s) = self.script.lock() {
            *s = Script::default();
        }
    }

    pub fn calls(&self) -> Vec<CompletionRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(req.clone());
        }
        let input_chars: usize = req.messages.iter().map(|m| m.content.chars().count()).sum();
        let failure = {
            let s = self
                .script
                .lock()
                .map_err(|e| LlmError::Other(e.to_string()))?;
            if s.fail_all {
                Some("provider unavailable".to_string())
            } else if s.failing_models.contains(&req.model) {
                Some(format!("model {} unavailable", req.model))
            } else {
                match s.max_input_chars {
                    Some(max) if input_chars > max => {
                        Some(format!("input of {} chars exceeds {}", input_chars, max))
                    }
                    _ => None,
                }
            }
        };
        if let Some(body) = failure {
            return Err(LlmError::Api {
                provider: self.name.clone(),
                status: 503,
                body,
            });
        }
        let last_user = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("");
        let completion = format!("{} says: {}", self.name, last_user);
        let prompt_tokens = (input_chars / 4) as u32;
        let completion_tokens = (completion.chars().count() / 4) as u32;
        Ok(CompletionResponse {
            content: completion,
            model: req.model.clone(),
            provider: self.name.clone(),
            usage: Some(TokenUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            }),
        })
    }
}
