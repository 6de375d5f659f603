use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::action_map::ButtonToken;
use crate::config::OracleConfig;

/// One decision request: the fixed context preamble plus the observation JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleRequest {
    pub preamble: String,
    pub observation: String,
}

impl OracleRequest {
    /// The single user message sent to a chat model.
    pub fn prompt(&self) -> String {
        let schema = json!({
            "prev_reasoning": "what the last button did and what you learned",
            "next_reasoning": "why you are pressing the next button",
            "action_map_guess": {"btn1": "your current guess for btn1", "btn2": "..."},
            "choice": "the button to press, e.g. btn1",
        });
        format!(
            "<context>\n{}\nAnswer with a single JSON object following this schema:\n{}\n</context>\n<current_turn>\n{}\n</current_turn>\n",
            self.preamble, schema, self.observation
        )
    }
}

/// Built-in preamble for a run with the given buttons.
pub fn default_preamble(tokens: &[ButtonToken], door_buttons: bool) -> String {
    let names: Vec<&str> = tokens.iter().map(ButtonToken::as_str).collect();
    let door = if door_buttons {
        " The door may be open or closed."
    } else {
        ""
    };
    format!(
        "You are observing a simulation with several moving agents and a door.{door} \
         Each turn you can press one of {count} buttons: {list}. \
         One of the agents responds to your buttons; the others wander on their own. \
         You are not told what each button does or which agent you control. \
         Use the outcomes of each action to understand the system and act accordingly. \
         Your goal is to get the agents out through the door, with yours leaving last. \
         Below you will see a memory of previous turns: reason about what changed, \
         record what you learned about the buttons, then choose the next button. \
         Respond only with the JSON object, without explanations or markdown.",
        count = names.len(),
        list = names.join(", "),
    )
}

/// Transport-level failures. Any of these makes the current reply invalid.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    #[error("oracle api key is empty (set DOOR_WORLD_LLM_API_KEY or [oracle].api_key)")]
    MissingApiKey,
    #[error("client build failed: {message}")]
    BuildClient { message: String },
    #[error("http request failed: {message}")]
    Http { message: String },
    #[error("http status {code}: {message}")]
    HttpStatus { code: u16, message: String },
    #[error("decode response failed: {message}")]
    DecodeResponse { message: String },
    #[error("empty completion choice")]
    EmptyChoice,
    #[error("oracle task ended without a reply")]
    TaskLost,
}

/// Anything that can turn a request into reply text. Calls may block for a long time;
/// the decision protocol runs them off the tick thread.
pub trait OracleClient: Send + Sync {
    fn complete(&self, request: &OracleRequest) -> Result<String, OracleError>;

    /// Name used for log file naming.
    fn model_name(&self) -> &str {
        "oracle"
    }
}

/// OpenAI-compatible `chat/completions` client.
#[derive(Debug, Clone)]
pub struct HttpOracle {
    base_url: String,
    api_key: String,
    model: String,
    client: Client,
}

impl HttpOracle {
    pub fn from_config(config: &OracleConfig) -> Result<Self, OracleError> {
        if config.api_key.trim().is_empty() {
            return Err(OracleError::MissingApiKey);
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms.max(1)))
            .build()
            .map_err(|err| OracleError::BuildClient {
                message: err.to_string(),
            })?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            client,
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OracleClient for HttpOracle {
    fn complete(&self, request: &OracleRequest) -> Result<String, OracleError> {
        let url = format!("{}/chat/completions", self.base_url);
        let prompt = request.prompt();
        let payload = ChatCompletionRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: &prompt,
            }],
        };

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .map_err(|err| OracleError::Http {
                message: err.to_string(),
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            let message = response.text().unwrap_or_else(|_| "<no body>".to_string());
            return Err(OracleError::HttpStatus {
                code: status.as_u16(),
                message,
            });
        }

        let response: ChatCompletionResponse =
            response.json().map_err(|err| OracleError::DecodeResponse {
                message: err.to_string(),
            })?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(OracleError::EmptyChoice)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_wraps_context_and_turn() {
        let request = OracleRequest {
            preamble: "be brief".to_string(),
            observation: "{\"current_turn\":0}".to_string(),
        };
        let prompt = request.prompt();
        assert!(prompt.starts_with("<context>\nbe brief\n"));
        assert!(prompt.contains("\"choice\""));
        assert!(prompt.contains("\"action_map_guess\""));
        assert!(prompt.ends_with("<current_turn>\n{\"current_turn\":0}\n</current_turn>\n"));
    }

    #[test]
    fn preamble_lists_every_button() {
        let tokens: Vec<ButtonToken> = (1..=4).map(ButtonToken::numbered).collect();
        let preamble = default_preamble(&tokens, false);
        assert!(preamble.contains("one of 4 buttons: btn1, btn2, btn3, btn4."));
        assert!(!preamble.contains("open or closed"));
        assert!(default_preamble(&tokens, true).contains("open or closed"));
    }

    #[test]
    fn http_oracle_requires_api_key() {
        let config = OracleConfig::default();
        assert!(matches!(
            HttpOracle::from_config(&config),
            Err(OracleError::MissingApiKey)
        ));

        let config = OracleConfig {
            api_key: "key".to_string(),
            base_url: "http://localhost:8080/v1/".to_string(),
            ..OracleConfig::default()
        };
        let oracle = HttpOracle::from_config(&config).unwrap();
        assert_eq!(oracle.base_url, "http://localhost:8080/v1");
        assert_eq!(oracle.model_name(), config.model);
    }
}
