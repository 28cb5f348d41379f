//! Summarization backends: a chat-completions API, a local CLI, and an
//! ordered fallback over both.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::prompt::SummaryRequest;
use crate::config::BackendConfig;
use crate::error::{Error, Result};

/// Set in the environment of CLI backend children. A stop hook firing
/// inside one of them must not start another extraction.
pub const EXTRACTING_ENV: &str = "KEEPSAKE_EXTRACTING";

/// Something that turns a summary request into a raw text reply
#[async_trait]
pub trait SummarizationBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn summarize(&self, request: &SummaryRequest) -> Result<String>;
}

/// OpenAI-compatible chat completions endpoint
pub struct ApiBackend {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl ApiBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.api_timeout_secs.max(1)))
            .build()
            .map_err(|e| Error::backend(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            model: config.api_model.clone(),
            api_key: config.api_key(),
            client,
        })
    }
}

fn parse_completion_content(body: &str) -> Result<String> {
    let value: Value = serde_json::from_str(body)?;
    value
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::backend("missing choices[0].message.content in completion response"))
}

#[async_trait]
impl SummarizationBackend for ApiBackend {
    fn name(&self) -> &str {
        "api"
    }

    async fn summarize(&self, request: &SummaryRequest) -> Result<String> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| Error::backend("no API key configured"))?;

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&json!({
                "model": self.model,
                "max_tokens": request.max_tokens,
                "temperature": 0.1,
                "messages": [
                    {"role": "system", "content": request.system},
                    {"role": "user", "content": request.prompt}
                ]
            }))
            .send()
            .await
            .map_err(|e| Error::backend(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::backend(format!("failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(Error::backend(format!(
                "API returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        parse_completion_content(&body)
    }
}

/// Local command that reads the prompt on stdin and prints the reply
pub struct CliBackend {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CliBackend {
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(
            config.cli_command.clone(),
            config.cli_args.clone(),
            Duration::from_secs(config.cli_timeout_secs.max(1)),
        )
    }
}

#[async_trait]
impl SummarizationBackend for CliBackend {
    fn name(&self) -> &str {
        "cli"
    }

    async fn summarize(&self, request: &SummaryRequest) -> Result<String> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .env(EXTRACTING_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::backend(format!("failed to spawn {}: {}", self.command, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let input = format!("{}\n\n{}", request.system, request.prompt);
            stdin.write_all(input.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                Error::backend(format!(
                    "{} timed out after {}s",
                    self.command,
                    self.timeout.as_secs()
                ))
            })??;

        if !output.status.success() {
            return Err(Error::backend(format!(
                "{} exited with {}",
                self.command, output.status
            )));
        }

        let reply = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if reply.is_empty() {
            return Err(Error::backend(format!("{} produced no output", self.command)));
        }
        Ok(reply)
    }
}

/// Tries each backend in order and returns the first success
pub struct FallbackBackend {
    backends: Vec<Box<dyn SummarizationBackend>>,
}

impl FallbackBackend {
    pub fn new(backends: Vec<Box<dyn SummarizationBackend>>) -> Self {
        Self { backends }
    }

    /// API first, then CLI, each only if enabled
    pub fn from_config(config: &BackendConfig) -> Self {
        let mut backends: Vec<Box<dyn SummarizationBackend>> = Vec::new();
        if config.api_enabled {
            match ApiBackend::new(config) {
                Ok(api) => backends.push(Box::new(api)),
                Err(e) => warn!(error = %e, "API backend unavailable"),
            }
        }
        if config.cli_enabled {
            backends.push(Box::new(CliBackend::from_config(config)));
        }
        Self::new(backends)
    }
}

#[async_trait]
impl SummarizationBackend for FallbackBackend {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn summarize(&self, request: &SummaryRequest) -> Result<String> {
        for backend in &self.backends {
            match backend.summarize(request).await {
                Ok(reply) => {
                    debug!(backend = backend.name(), "summarization succeeded");
                    return Ok(reply);
                }
                Err(e) => warn!(backend = backend.name(), error = %e, "summarization backend failed"),
            }
        }
        Err(Error::backend("all summarization backends failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn request() -> SummaryRequest {
        SummaryRequest {
            system: "system".to_string(),
            prompt: "prompt body".to_string(),
            max_tokens: 256,
        }
    }

    struct Stub {
        reply: Option<&'static str>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SummarizationBackend for Stub {
        fn name(&self) -> &str {
            "stub"
        }

        async fn summarize(&self, _request: &SummaryRequest) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply
                .map(str::to_string)
                .ok_or_else(|| Error::backend("stub failure"))
        }
    }

    #[tokio::test]
    async fn fallback_uses_second_backend_after_failure() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let backend = FallbackBackend::new(vec![
            Box::new(Stub { reply: None, calls: first.clone() }),
            Box::new(Stub { reply: Some("[]"), calls: second.clone() }),
        ]);

        assert_eq!(backend.summarize(&request()).await.unwrap(), "[]");
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fallback_fails_when_every_backend_fails() {
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = FallbackBackend::new(vec![
            Box::new(Stub { reply: None, calls: calls.clone() }),
            Box::new(Stub { reply: None, calls: calls.clone() }),
        ]);
        assert!(matches!(
            backend.summarize(&request()).await,
            Err(Error::Backend(_))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn api_backend_without_key_fails_fast() {
        let config = BackendConfig {
            api_key_env: "KEEPSAKE_TEST_UNSET_KEY".to_string(),
            ..Default::default()
        };
        let api = ApiBackend::new(&config).unwrap();
        assert!(matches!(api.summarize(&request()).await, Err(Error::Backend(_))));
    }

    #[test]
    fn completion_content_is_extracted() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"[]"}}]}"#;
        assert_eq!(parse_completion_content(body).unwrap(), "[]");
        assert!(parse_completion_content(r#"{"choices":[]}"#).is_err());
    }

    #[tokio::test]
    async fn cli_backend_pipes_prompt_and_marks_env() {
        let echo = CliBackend::new("cat", Vec::new(), Duration::from_secs(5));
        let reply = echo.summarize(&request()).await.unwrap();
        assert_eq!(reply, "system\n\nprompt body");

        let env = CliBackend::new(
            "sh",
            vec!["-c".to_string(), format!("cat >/dev/null; printf %s \"${}\"", EXTRACTING_ENV)],
            Duration::from_secs(5),
        );
        assert_eq!(env.summarize(&request()).await.unwrap(), "1");
    }

    #[tokio::test]
    async fn cli_backend_reports_failures() {
        let failing = CliBackend::new("false", Vec::new(), Duration::from_secs(5));
        assert!(failing.summarize(&request()).await.is_err());

        let missing = CliBackend::new("keepsake-no-such-binary", Vec::new(), Duration::from_secs(5));
        assert!(missing.summarize(&request()).await.is_err());
    }
}
