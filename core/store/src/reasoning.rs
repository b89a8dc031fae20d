use crate::error::{MemoryError, Result};
use async_trait::async_trait;
use recall_indexing::BackendError;
use recall_schemas::{MemoryRecord, OrganizeTask};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

/// Longest excerpt of a record sent to the reasoning service.
const MAX_CONTENT_CHARS: usize = 400;

/// External service that proposes how to reorganize a batch of records.
///
/// Implementations return raw text; the organizer parses it and ignores
/// anything it cannot understand.
#[async_trait]
pub trait ReasoningProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn is_available(&self) -> bool {
        true
    }

    async fn propose_organization(
        &self,
        records: &[MemoryRecord],
        tasks: &[OrganizeTask],
        model_hint: Option<&str>,
    ) -> std::result::Result<String, BackendError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum LlmBackend {
    Ollama,
    OpenAI,
}

/// Configuration for the LLM-backed reasoner
#[derive(Debug, Clone)]
pub struct ReasonerConfig {
    pub backend: LlmBackend,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        Self {
            backend: LlmBackend::Ollama,
            api_key: None,
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            timeout_secs: 60,
        }
    }
}

impl ReasonerConfig {
    /// Read the `RECALL_REASONER*` variables. `Ok(None)` when
    /// `RECALL_REASONER` is unset or `none`.
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let provider = get("RECALL_REASONER").map(|v| v.to_lowercase());
        let backend = match provider.as_deref() {
            None | Some("none") => return Ok(None),
            Some("ollama") => LlmBackend::Ollama,
            Some("openai") => LlmBackend::OpenAI,
            Some(other) => {
                return Err(MemoryError::InvalidArgument(format!(
                    "RECALL_REASONER={}: expected ollama, openai or none",
                    other
                )))
            }
        };

        let mut config = Self::default();
        if backend == LlmBackend::OpenAI {
            config.base_url = "https://api.openai.com".to_string();
            config.model = "gpt-4o-mini".to_string();
            config.api_key = Some(get("RECALL_REASONER_API_KEY").ok_or_else(|| {
                MemoryError::InvalidArgument("RECALL_REASONER_API_KEY is required for openai".into())
            })?);
        }
        config.backend = backend;

        if let Some(url) = get("RECALL_REASONER_URL") {
            config.base_url = url;
        }
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        if let Some(model) = get("RECALL_REASONER_MODEL") {
            config.model = model;
        }
        if let Some(raw) = get("RECALL_REASONER_TIMEOUT_SECS") {
            config.timeout_secs = raw.parse().map_err(|e| {
                MemoryError::InvalidArgument(format!("RECALL_REASONER_TIMEOUT_SECS={}: {}", raw, e))
            })?;
        }

        Ok(Some(config))
    }
}

/// Reasoner that prompts an Ollama or OpenAI-compatible chat model.
pub struct LlmReasoner {
    config: ReasonerConfig,
    client: Client,
}

impl LlmReasoner {
    pub fn new(config: ReasonerConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self { config, client }
    }

    /// The reasoner selected by `RECALL_REASONER`; `None` when it is
    /// disabled or misconfigured.
    pub fn from_env_optional() -> Option<Self> {
        match ReasonerConfig::from_env() {
            Ok(config) => config.map(Self::new),
            Err(e) => {
                warn!("Reasoning service disabled: {}", e);
                None
            }
        }
    }

    fn build_prompt(&self, records: &[MemoryRecord], tasks: &[OrganizeTask]) -> String {
        let listing: Vec<String> = records
            .iter()
            .map(|r| {
                format!(
                    "- id: {} | type: {} | importance: {:.2} | content: {}",
                    r.id,
                    r.memory_type,
                    r.importance,
                    r.content.chars().take(MAX_CONTENT_CHARS).collect::<String>()
                )
            })
            .collect();
        let task_names: Vec<&str> = tasks.iter().map(OrganizeTask::as_str).collect();

        format!(
            r#"You organize a personal memory collection. Tasks: {}.

Memories:
{}

Return a JSON object with only the keys for the requested tasks:
{{
  "duplicates": [{{"canonical": "id to keep", "duplicates": ["id", "..."]}}],
  "categories": [{{"id": "memory id", "memory_type": "fact|opinion|preference|event|other"}}],
  "associations": [{{"source": "id", "target": "id", "relation_type": "related_to|similar_to|contradicts|caused_by|part_of|precedes|supersedes|exemplifies", "weight": 0.0-1.0}}]
}}

Only reference ids from the list. Omit anything you are unsure about."#,
            task_names.join(", "),
            listing.join("\n")
        )
    }

    async fn call_ollama(&self, prompt: &str, model: &str) -> std::result::Result<String, BackendError> {
        let url = format!("{}/api/generate", self.config.base_url);

        let request_body = json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
            "format": "json",
            "options": {
                "temperature": 0.2,
                "num_predict": 2048,
            }
        });

        debug!("Calling Ollama at {}", url);

        let response = self
            .client
            .post(&url)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| transport_error("ollama", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(BackendError::failed(
                "ollama",
                format!("API error {}: {}", status, error_text),
            ));
        }

        #[derive(Deserialize)]
        struct OllamaResponse {
            response: String,
        }

        let ollama_response: OllamaResponse = response
            .json()
            .await
            .map_err(|e| BackendError::failed("ollama", format!("bad response: {}", e)))?;

        Ok(ollama_response.response)
    }

    async fn call_openai(&self, prompt: &str, model: &str) -> std::result::Result<String, BackendError> {
        let url = format!("{}/v1/chat/completions", self.config.base_url);

        let request_body = json!({
            "model": model,
            "messages": [
                {
                    "role": "system",
                    "content": "You are a memory organization assistant. Reply with valid JSON only."
                },
                {
                    "role": "user",
                    "content": prompt
                }
            ],
            "temperature": 0.2,
            "max_tokens": 2048,
            "response_format": { "type": "json_object" }
        });

        debug!("Calling OpenAI at {}", url);

        let mut request = self.client.post(&url).json(&request_body);

        if let Some(ref api_key) = self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error("openai", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(BackendError::failed(
                "openai",
                format!("API error {}: {}", status, error_text),
            ));
        }

        #[derive(Deserialize)]
        struct ChatMessage {
            content: Option<String>,
        }

        #[derive(Deserialize)]
        struct Choice {
            message: ChatMessage,
        }

        #[derive(Deserialize)]
        struct ChatResponse {
            choices: Vec<Choice>,
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::failed("openai", format!("bad response: {}", e)))?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| BackendError::failed("openai", "empty response"))
    }
}

fn transport_error(backend: &str, err: reqwest::Error) -> BackendError {
    if err.is_connect() {
        BackendError::unavailable(backend, err.to_string())
    } else {
        BackendError::failed(backend, err.to_string())
    }
}

#[async_trait]
impl ReasoningProvider for LlmReasoner {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn propose_organization(
        &self,
        records: &[MemoryRecord],
        tasks: &[OrganizeTask],
        model_hint: Option<&str>,
    ) -> std::result::Result<String, BackendError> {
        let prompt = self.build_prompt(records, tasks);
        let model = model_hint.unwrap_or(&self.config.model);

        match self.config.backend {
            LlmBackend::Ollama => self.call_ollama(&prompt, model).await,
            LlmBackend::OpenAI => self.call_openai(&prompt, model).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recall_schemas::MemoryType;

    #[test]
    fn test_prompt_lists_records_and_tasks() {
        let reasoner = LlmReasoner::new(ReasonerConfig::default());
        let record = MemoryRecord::new("User prefers tea", 0.7, MemoryType::Preference);
        let prompt = reasoner.build_prompt(
            std::slice::from_ref(&record),
            &[OrganizeTask::Categorize, OrganizeTask::FindDuplicates],
        );

        assert!(prompt.contains(&record.id.0));
        assert!(prompt.contains("categorize, find_duplicates"));
        assert!(prompt.contains("type: preference"));
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: std::collections::HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_reasoner_disabled_unless_selected() {
        assert!(ReasonerConfig::from_lookup(lookup(&[])).unwrap().is_none());
        assert!(ReasonerConfig::from_lookup(lookup(&[("RECALL_REASONER", "none")]))
            .unwrap()
            .is_none());
        assert!(ReasonerConfig::from_lookup(lookup(&[("RECALL_REASONER", "gemini")])).is_err());
    }

    #[test]
    fn test_reasoner_env_overrides() {
        let config = ReasonerConfig::from_lookup(lookup(&[
            ("RECALL_REASONER", "Ollama"),
            ("RECALL_REASONER_URL", "http://gpu-box:11434/"),
            ("RECALL_REASONER_MODEL", "qwen2.5:7b"),
            ("RECALL_REASONER_TIMEOUT_SECS", "15"),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(config.backend, LlmBackend::Ollama);
        assert_eq!(config.base_url, "http://gpu-box:11434");
        assert_eq!(config.model, "qwen2.5:7b");
        assert_eq!(config.timeout_secs, 15);

        let err = ReasonerConfig::from_lookup(lookup(&[("RECALL_REASONER", "openai")])).unwrap_err();
        assert!(matches!(err, MemoryError::InvalidArgument(_)));

        let openai = ReasonerConfig::from_lookup(lookup(&[
            ("RECALL_REASONER", "openai"),
            ("RECALL_REASONER_API_KEY", "sk-test"),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(openai.base_url, "https://api.openai.com");
        assert_eq!(openai.api_key.as_deref(), Some("sk-test"));
    }

    #[tokio::test]
    async fn test_unreachable_service_reports_unavailable() {
        let reasoner = LlmReasoner::new(ReasonerConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            timeout_secs: 2,
            ..ReasonerConfig::default()
        });
        let err = reasoner
            .propose_organization(&[], &[OrganizeTask::Categorize], None)
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
    }
}
