//! Category classification gateway backed by the OpenAI chat completions API.
//!
//! The contract is deliberately narrow: text plus candidate labels in, exactly
//! one of the candidates out. Every failure mode resolves to the first
//! candidate, so callers never see an error from this crate.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "kmbv-classify";

/// BMV rehearsal categories ("P_V_Art" for Ausrueckungsart "P"). The first
/// entry doubles as the deterministic fallback.
pub const REHEARSAL_CATEGORIES: [&str; 6] = [
    "Ensembleprobe",
    "Gesamtorchester Teilprobe",
    "Jugendorchester Vollprobe",
    "Gesamtorchester Vollprobe",
    "Jugendorchester Teilprobe",
    "Sitzung",
];

/// BMV event categories ("P_V_Art" for Ausrueckungsart "V").
pub const EVENT_CATEGORIES: [&str; 10] = [
    "Vereinseigene Konzerte",
    "Kirchliche Feierlichkeiten",
    "Wettbewerbe/Wertungsspiele",
    "Veranstaltungen privater Körperschaften",
    "Sonstige Anlässe",
    "Veranstaltungen von Tourismusverbänden",
    "Private Anlässe",
    "Öffentliche Anlässe (Gemeinde, Parteien)",
    "Begräbnisse",
    "Vereinseigene Musikfeste",
];

pub const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gpt-4";

/// Picks one of `categories` for `text`. Implementations must not fail: any
/// internal error resolves to the first category. Repeated calls with the
/// same input are not required to agree.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str, categories: &[&str]) -> String;
}

/// Always answers with the first candidate. Stands in when no API key is
/// configured and anchors tests that need a deterministic gateway.
#[derive(Debug, Default)]
pub struct FirstCategoryClassifier;

#[async_trait]
impl Classifier for FirstCategoryClassifier {
    async fn classify(&self, _text: &str, categories: &[&str]) -> String {
        categories.first().copied().unwrap_or_default().to_string()
    }
}

#[derive(Debug, Error)]
enum ClassifyError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("api status {0}")]
    Api(u16),
    #[error("response contained no choices")]
    EmptyResponse,
    #[error("unparseable category payload: {0}")]
    InvalidPayload(String),
    #[error("category {0:?} is not in the candidate list")]
    UnknownCategory(String),
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    pub api_url: String,
    pub timeout: Duration,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: String,
}

#[derive(Debug, Deserialize)]
struct CategoryPayload {
    category: String,
}

pub struct OpenAiClassifier {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiClassifier {
    pub fn new(config: OpenAiConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn prompt(text: &str, categories: &[&str]) -> String {
        let listed = categories
            .iter()
            .map(|category| format!("- {category}"))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            r#"You are a classification assistant. You are given some text describing a musical event or rehearsal:
"{text}"

You have these possible categories:
{listed}

Instructions:
1. Determine the SINGLE best category from the list.
2. Output ONLY valid JSON with the key "category". Example:
{{"category": "Sonstige Anlässe"}}

3. Do not include extra text or keys beyond {{"category": "..."}}.
4. If the name contains "Probe" and nothing like "Register", "Registerprobe", "Registerprobe Hohes Blech" etc., pick "Gesamtorchester Vollprobe" => its the most common category.
5. If unsure, pick the closest category.
"#
        )
    }

    async fn try_classify(
        &self,
        text: &str,
        categories: &[&str],
    ) -> Result<String, ClassifyError> {
        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages: vec![ChatMessage { role: "system", content: Self::prompt(text, categories) }],
            temperature: 0.0,
        };
        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClassifyError::Api(status.as_u16()));
        }
        let completion: ChatCompletionResponse = response.json().await?;
        let raw = completion
            .choices
            .first()
            .ok_or(ClassifyError::EmptyResponse)?
            .message
            .content
            .trim()
            .to_string();
        let payload: CategoryPayload = serde_json::from_str(&raw)
            .map_err(|err| ClassifyError::InvalidPayload(format!("{err}: {raw}")))?;
        let wanted = payload.category.trim().to_lowercase();
        categories
            .iter()
            .find(|category| category.to_lowercase() == wanted)
            .map(|category| category.to_string())
            .ok_or(ClassifyError::UnknownCategory(payload.category))
    }
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    async fn classify(&self, text: &str, categories: &[&str]) -> String {
        let Some(fallback) = categories.first() else {
            return String::new();
        };
        match self.try_classify(text, categories).await {
            Ok(category) => category,
            Err(err) => {
                warn!(error = %err, text, "classification failed; using fallback category");
                (*fallback).to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn classifier(server: &MockServer) -> OpenAiClassifier {
        let mut config = OpenAiConfig::new("test-api-key");
        config.api_url = format!("{}/v1/chat/completions", server.uri());
        config.timeout = Duration::from_secs(5);
        OpenAiClassifier::new(config).expect("classifier")
    }

    fn completion_body(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{ "message": { "content": content } }],
            "usage": { "total_tokens": 50, "prompt_tokens": 40, "completion_tokens": 10 }
        })
    }

    #[tokio::test]
    async fn returns_matched_category_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer test-api-key"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion_body(r#"{"category": "Sitzung"}"#)),
            )
            .mount(&server)
            .await;

        let label = classifier(&server).classify("Vorstandssitzung", &REHEARSAL_CATEGORIES).await;
        assert_eq!(label, "Sitzung");
    }

    #[tokio::test]
    async fn matches_categories_case_insensitively_with_canonical_casing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion_body(r#"{"category": "sonstige anlässe"}"#)),
            )
            .mount(&server)
            .await;

        let label = classifier(&server).classify("Frühschoppen", &EVENT_CATEGORIES).await;
        assert_eq!(label, "Sonstige Anlässe");
    }

    #[tokio::test]
    async fn falls_back_when_label_is_not_a_candidate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion_body(r#"{"category": "Etwas ganz anderes"}"#)),
            )
            .mount(&server)
            .await;

        let label = classifier(&server).classify("Probe", &REHEARSAL_CATEGORIES).await;
        assert_eq!(label, REHEARSAL_CATEGORIES[0]);
    }

    #[tokio::test]
    async fn falls_back_on_unparseable_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(completion_body("not valid json")),
            )
            .mount(&server)
            .await;

        let label = classifier(&server).classify("Probe", &REHEARSAL_CATEGORIES).await;
        assert_eq!(label, REHEARSAL_CATEGORIES[0]);
    }

    #[tokio::test]
    async fn falls_back_on_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let label = classifier(&server).classify("Konzert", &EVENT_CATEGORIES).await;
        assert_eq!(label, EVENT_CATEGORIES[0]);
    }

    #[tokio::test]
    async fn falls_back_when_the_endpoint_is_unreachable() {
        let mut config = OpenAiConfig::new("test-api-key");
        config.api_url = "http://127.0.0.1:1/v1/chat/completions".to_string();
        config.timeout = Duration::from_secs(1);
        let classifier = OpenAiClassifier::new(config).expect("classifier");

        let label = classifier.classify("Konzert", &EVENT_CATEGORIES).await;
        assert_eq!(label, EVENT_CATEGORIES[0]);
    }

    #[tokio::test]
    async fn first_category_classifier_is_deterministic() {
        let label = FirstCategoryClassifier.classify("whatever", &REHEARSAL_CATEGORIES).await;
        assert_eq!(label, "Ensembleprobe");
    }
}
