//! Classifier gateway — asks the LLM whether a message is a development request.
//!
//! Best-effort: any backend failure is logged and becomes "not relevant".
//! There is no retry; a missed classification only loses one notification.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::types::Classifier;

/// Output budget; the answer is a single literal.
const CLASSIFY_MAX_TOKENS: u32 = 5;

/// Deterministic answers.
const CLASSIFY_TEMPERATURE: f32 = 0.0;

const SYSTEM_PROMPT: &str = r#"Определи, указывает ли следующее сообщение на потребность в разработке Telegram-бота или сайта. Верни только "true" или "false".
Примеры релевантных:
- "Ищу разработчика для создания Telegram-бота для группы"
- "Нужен сайт для бизнеса, есть разработчики?"
- "Кто может сделать бота для автоматизации в Telegram?"
Нерелевантные:
- "Привет, как дела?"
- "Кто хочет встретиться за кофе?""#;

/// Why a backend answer could not be turned into a verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
enum VerdictError {
    Empty,
    Malformed(String),
}

/// Parse the model's answer into a verdict.
///
/// Accepts `true`/`false` in any case, surrounded by whitespace, quotes or
/// trailing punctuation.
fn parse_verdict(raw: &str) -> Result<bool, VerdictError> {
    let cleaned = raw
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`' || c == '.' || c == '!')
        .trim()
        .to_lowercase();

    match cleaned.as_str() {
        "" => Err(VerdictError::Empty),
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(VerdictError::Malformed(raw.to_string())),
    }
}

/// LLM-backed [`Classifier`].
pub struct ClassifierGateway {
    llm: Arc<dyn LlmProvider>,
}

impl ClassifierGateway {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    fn build_request(text: &str) -> CompletionRequest {
        CompletionRequest::new(vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(format!("Сообщение: {text}")),
        ])
        .with_temperature(CLASSIFY_TEMPERATURE)
        .with_max_tokens(CLASSIFY_MAX_TOKENS)
    }
}

#[async_trait]
impl Classifier for ClassifierGateway {
    async fn classify(&self, text: &str) -> bool {
        let response = match self.llm.complete(Self::build_request(text)).await {
            Ok(r) => r,
            Err(e) => {
                warn!(model = self.llm.model_name(), error = %e, "Classification request failed");
                return false;
            }
        };

        match parse_verdict(&response.content) {
            Ok(verdict) => {
                debug!(
                    verdict,
                    input_tokens = response.input_tokens,
                    output_tokens = response.output_tokens,
                    "Classified message"
                );
                verdict
            }
            Err(VerdictError::Empty) => {
                warn!(model = self.llm.model_name(), "Classifier returned an empty response");
                false
            }
            Err(VerdictError::Malformed(raw)) => {
                warn!(model = self.llm.model_name(), raw = %raw, "Classifier returned a malformed response");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::LlmError;
    use crate::llm::{CompletionResponse, Role};

    /// Replays a fixed answer and remembers the last request.
    struct ScriptedLlm {
        answer: Result<String, String>,
        last_request: Mutex<Option<CompletionRequest>>,
    }

    impl ScriptedLlm {
        fn answering(answer: &str) -> Arc<Self> {
            Arc::new(Self {
                answer: Ok(answer.to_string()),
                last_request: Mutex::new(None),
            })
        }

        fn failing(reason: &str) -> Arc<Self> {
            Arc::new(Self {
                answer: Err(reason.to_string()),
                last_request: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            *self.last_request.lock().unwrap() = Some(request);
            match &self.answer {
                Ok(content) => Ok(CompletionResponse {
                    content: content.clone(),
                    input_tokens: 10,
                    output_tokens: 1,
                }),
                Err(reason) => Err(LlmError::RequestFailed {
                    provider: "scripted".into(),
                    reason: reason.clone(),
                }),
            }
        }
    }

    #[test]
    fn parse_accepts_variants() {
        assert_eq!(parse_verdict("true"), Ok(true));
        assert_eq!(parse_verdict(" True\n"), Ok(true));
        assert_eq!(parse_verdict("\"false\""), Ok(false));
        assert_eq!(parse_verdict("FALSE."), Ok(false));
    }

    #[test]
    fn parse_rejects_other_text() {
        assert_eq!(parse_verdict(""), Err(VerdictError::Empty));
        assert_eq!(parse_verdict("  "), Err(VerdictError::Empty));
        assert!(matches!(parse_verdict("yes"), Err(VerdictError::Malformed(_))));
        assert!(matches!(parse_verdict("true or false"), Err(VerdictError::Malformed(_))));
    }

    #[tokio::test]
    async fn relevant_message_is_true() {
        let llm = ScriptedLlm::answering("true");
        let gateway = ClassifierGateway::new(llm.clone());
        assert!(gateway.classify("Ищу разработчика для бота").await);

        let request = llm.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.max_tokens, Some(CLASSIFY_MAX_TOKENS));
        assert_eq!(request.temperature, Some(0.0));
        assert_eq!(request.messages[0].role, Role::System);
        assert!(request.messages[1].content.contains("Ищу разработчика для бота"));
    }

    #[tokio::test]
    async fn transport_error_is_false() {
        let gateway = ClassifierGateway::new(ScriptedLlm::failing("timeout"));
        assert!(!gateway.classify("Нужен сайт").await);
    }

    #[tokio::test]
    async fn empty_and_malformed_are_false() {
        assert!(!ClassifierGateway::new(ScriptedLlm::answering("")).classify("x").await);
        assert!(!ClassifierGateway::new(ScriptedLlm::answering("maybe")).classify("x").await);
    }
}
