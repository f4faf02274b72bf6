//! Language-model collaborator: client, prompt families, code extraction.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Request deadline for a single completion.
pub const LLM_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

const MAX_COMPLETION_TOKENS: u32 = 10_240;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Http(String),
    #[error("model endpoint returned status {0}")]
    Status(u16),
    #[error("empty response from model")]
    Empty,
}

/// Text-in/text-out oracle the supervisor builds programs, rebuilds, and
/// titles from.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_completion_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// OpenAI-compatible chat-completions client.
pub struct ChatCompletionsClient {
    api_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl ChatCompletionsClient {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(LLM_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LlmError::Http(e.to_string()))?;
        Ok(Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }
}

#[async_trait]
impl LanguageModel for ChatCompletionsClient {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_completion_tokens: MAX_COMPLETION_TOKENS,
        };

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::Status(status.as_u16()));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or(LlmError::Empty)
    }
}

const PROGRAM_PROMPT_HEADER: &str = "You are a Go expert. Generate a Go program that meets the following requirements:
- Single Page Application with a web server; state lives in the process.
- Export a Shutdown() function with no arguments and no return values.
- Shutdown() must stop the server and release the port.
- Do NOT use syscall.
- Use fmt.Println or fmt.Printf for logs, and log the assigned port exactly as: PORT=<selected_port>
- Bind to a random available port and use http.NewServeMux for all routes.
- Register handlers at root paths; never include the runtime base path in handler registration.
- Return only the source code, no additional commentary; the program must compile and run as provided.";

/// Wrap a user prompt into the initial-program request.
///
/// Idempotent: a prompt that already carries the wrapper (the retry-exhaustion
/// path re-prepares with the stored prompt) is passed through unchanged.
pub fn initial_prompt(user_prompt: &str, id: &str) -> String {
    if user_prompt.contains(PROGRAM_PROMPT_HEADER) {
        return user_prompt.to_string();
    }
    format!(
        "{PROGRAM_PROMPT_HEADER}
- All HTML form actions must use the base path /runtime/{id}/ while the matching handlers stay at the root path.

Implement the above based on the user prompt:
{user_prompt}"
    )
}

/// Ask for a corrected program after a failure.
pub fn rebuild_prompt(prompt: &str, error: &str, code: &str) -> String {
    format!(
        "You are a Go expert. The following program was generated from a prompt but has an error. \
Correct the error while adhering to the original prompt.

ERROR:
{error}

ORIGINAL CODE:
{code}

ORIGINAL PROMPT:
{prompt}

REQUIREMENTS:
- The program must compile and run as provided.
- Use http.NewServeMux and bind to a random port.
- Ensure PORT=<port> is logged.
- Return only the corrected Go program."
    )
}

/// Ask for a short display title for a committed execution.
pub fn title_prompt(prompt: &str) -> String {
    format!(
        "You are a concise title generator. Generate a short, clear title for a \
program built from the prompt below.

Rules:
- 2 to 5 words, Title Case.
- No punctuation unless part of a recognized name (OAuth, JWT).
- Focus on the core functionality; use nouns or noun phrases.
- Return only the title, no extra commentary.

Prompt: {prompt}"
    )
}

/// Pull the program out of a model response.
///
/// Prefers a `go`-fenced code block; otherwise the raw response is returned
/// and left for the validator to reject if it is not a program.
pub fn extract_code(response: &str) -> String {
    static FENCED: OnceLock<Regex> = OnceLock::new();
    // (?s) so the block body may span lines.
    let fenced = FENCED.get_or_init(|| Regex::new(r"(?s)```go\n(.*?)```").expect("valid pattern"));
    if let Some(captures) = fenced.captures(response) {
        return captures[1].trim().to_string();
    }
    response.trim().to_string()
}

pub mod testing {
    //! Scripted model double; returns queued responses in order.

    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;

    pub struct ScriptedModel {
        responses: Mutex<VecDeque<String>>,
        fallback: String,
        title: Option<String>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        pub fn new(responses: Vec<&str>, fallback: &str) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().map(str::to_string).collect()),
                fallback: fallback.to_string(),
                title: None,
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn repeating(fallback: &str) -> Self {
            Self::new(Vec::new(), fallback)
        }

        /// Answer title-family prompts with `title` instead of the queue.
        pub fn with_title(mut self, title: &str) -> Self {
            self.title = Some(title.to_string());
            self
        }

        pub fn prompt_count(&self) -> usize {
            self.prompts.lock().len()
        }

        pub fn prompts_matching(&self, needle: &str) -> usize {
            self.prompts
                .lock()
                .iter()
                .filter(|p| p.contains(needle))
                .count()
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
            self.prompts.lock().push(prompt.to_string());
            if let Some(title) = &self.title {
                if prompt.contains("title generator") {
                    return Ok(title.clone());
                }
            }
            let next = self.responses.lock().pop_front();
            Ok(next.unwrap_or_else(|| self.fallback.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_go_block() {
        let response = "Here you go:\n```go\npackage main\n\nfunc main() {}\n```\nEnjoy!";
        assert_eq!(extract_code(response), "package main\n\nfunc main() {}");
    }

    #[test]
    fn falls_back_to_raw_response() {
        let response = "package main\nfunc main() {}";
        assert_eq!(extract_code(response), response);
    }

    #[test]
    fn first_fenced_block_wins() {
        let response = "```go\nfirst\n```\ntext\n```go\nsecond\n```";
        assert_eq!(extract_code(response), "first");
    }

    #[test]
    fn initial_prompt_embeds_runtime_base_path() {
        let id = "a".repeat(32);
        let prompt = initial_prompt("build a todo list", &id);
        assert!(prompt.contains(&format!("/runtime/{id}/")));
        assert!(prompt.contains("build a todo list"));
        assert!(prompt.contains("PORT=<selected_port>"));
    }

    #[test]
    fn initial_prompt_is_idempotent() {
        let id = "a".repeat(32);
        let once = initial_prompt("build a todo list", &id);
        let twice = initial_prompt(&once, &id);
        assert_eq!(once, twice);
    }

    #[test]
    fn rebuild_prompt_carries_error_and_code() {
        let prompt = rebuild_prompt("make an echo server", "port never logged", "package main");
        assert!(prompt.contains("port never logged"));
        assert!(prompt.contains("package main"));
        assert!(prompt.contains("make an echo server"));
    }
}
