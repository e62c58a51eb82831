// LLM 适配：OpenAI 兼容的 Chat Completions 调用，生成 SQL 与兜底提示。
use crate::config::LlmConfig;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::warn;

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

const SQL_SYSTEM_PROMPT: &str = "You are a senior data analyst who writes PostgreSQL queries.\n\
Rules:\n\
- Produce exactly one read-only statement that starts with SELECT or WITH.\n\
- Only use tables and columns listed in the schema context.\n\
- Never write INSERT, UPDATE, DELETE, DDL or multiple statements.\n\
- If the request cannot be answered from the schema, set sql to a message starting with \"ERROR:\" that explains what is missing.\n\
Answer with a JSON object: {\"sql\": \"...\", \"reasoning\": \"...\"}.";

const GUIDANCE_SYSTEM_PROMPT: &str = "You help users phrase questions about a relational database.\n\
The previous attempt to translate the question into SQL failed. Explain briefly, in the user's language, \
what information is missing or which tables might be relevant, and suggest how to rephrase the question. \
Do not write SQL.";

const DEBUG_SYSTEM_PROMPT: &str = "You debug PostgreSQL queries that failed against a read-only warehouse.\n\
Use the schema context to find the cause of the error and propose a corrected read-only query.\n\
Answer with a JSON object: {\"analysis_text\": \"...\", \"suggested_sql\": \"...\", \"explanation\": \"...\"}.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    /// 网络/连接层故障，不做兜底。
    Transport(String),
    Timeout,
    /// 上游返回错误状态或无法解析的内容。
    Upstream(String),
}

impl LlmError {
    pub fn is_transport(&self) -> bool {
        matches!(self, LlmError::Transport(_))
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Transport(message) => write!(f, "LLM transport failure: {message}"),
            LlmError::Timeout => f.write_str("LLM request timed out"),
            LlmError::Upstream(message) => write!(f, "LLM request failed: {message}"),
        }
    }
}

impl std::error::Error for LlmError {}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else if err.is_connect() || err.is_request() || err.is_body() {
            LlmError::Transport(err.to_string())
        } else {
            LlmError::Upstream(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlDraft {
    pub sql: String,
    pub reasoning: String,
}

/// 失败语句的诊断建议。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SqlDebugAdvice {
    pub analysis_text: String,
    pub suggested_sql: String,
    pub explanation: String,
}

/// 生成 SQL 所需的全部上下文；记忆片段放在表结构之前，便于模型理解省略的追问。
#[derive(Debug, Clone, Default)]
pub struct SqlPrompt {
    pub query: String,
    pub schema_context: String,
    pub memory_context: String,
    pub extra_context: Option<String>,
}

impl SqlPrompt {
    pub fn user_message(&self) -> String {
        let mut message = String::new();
        if !self.memory_context.trim().is_empty() {
            message.push_str("Recent conversation in this session:\n");
            message.push_str(self.memory_context.trim_end());
            message.push_str("\n\n");
        }
        message.push_str(self.schema_context.trim_end());
        message.push_str("\n\n");
        if let Some(extra) = self
            .extra_context
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            message.push_str("Additional context:\n");
            message.push_str(extra);
            message.push_str("\n\n");
        }
        message.push_str("Question: ");
        message.push_str(self.query.trim());
        message
    }
}

pub fn debug_message(sql: &str, error: &str, schema_context: &str) -> String {
    format!(
        "{}\n\nFailed SQL:\n{}\n\nError message: {}",
        schema_context.trim_end(),
        sql.trim(),
        error.trim()
    )
}

pub fn guidance_message(query: &str, schema_context: &str, issue: &str) -> String {
    format!(
        "{}\n\nQuestion: {}\n\nProblem with the previous attempt: {}",
        schema_context.trim_end(),
        query.trim(),
        issue.trim()
    )
}

/// 流式增量回调，按到达顺序逐段转发。
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn on_chunk(&self, text: &str);
}

#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate_sql(&self, prompt: &SqlPrompt) -> Result<SqlDraft, LlmError>;

    async fn generate_sql_stream(
        &self,
        prompt: &SqlPrompt,
        sink: &dyn ChunkSink,
    ) -> Result<SqlDraft, LlmError>;

    async fn generate_guidance(
        &self,
        query: &str,
        schema_context: &str,
        issue: &str,
    ) -> Result<String, LlmError>;

    async fn debug_sql(
        &self,
        sql: &str,
        error: &str,
        schema_context: &str,
    ) -> Result<SqlDebugAdvice, LlmError>;
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Clone)]
pub struct OpenAiSqlGenerator {
    http: Client,
    config: LlmConfig,
}

impl OpenAiSqlGenerator {
    pub fn new(config: LlmConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.timeout_s.unwrap_or(120).max(1));
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, config })
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .and_then(normalize_base_url)
            .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string());
        format!("{base}/chat/completions")
    }

    fn headers(&self) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(api_key) = &self.config.api_key {
            let api_key = api_key.trim();
            if !api_key.is_empty() {
                if let Ok(value) = format!("Bearer {api_key}").parse() {
                    headers.insert(reqwest::header::AUTHORIZATION, value);
                }
            }
        }
        headers
    }

    fn build_payload(&self, messages: &[ChatMessage], stream: bool) -> Value {
        let temperature = round_f32(self.config.temperature.unwrap_or(0.1));
        let mut payload = json!({
            "model": self
                .config
                .model
                .clone()
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            "messages": messages,
            "temperature": temperature,
            "stream": stream,
        });
        if let Some(max_output) = self.config.max_output {
            if max_output > 0 {
                payload["max_tokens"] = json!(max_output);
            }
        }
        payload
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let response = self
            .http
            .post(self.endpoint())
            .headers(self.headers())
            .json(&self.build_payload(messages, false))
            .send()
            .await?;
        let status = response.status();
        let body_text = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Upstream(format!(
                "{status} {}",
                truncate_text(&body_text, 2048)
            )));
        }
        let body = serde_json::from_str::<Value>(&body_text).map_err(|err| {
            warn!(
                "LLM response json parse failed: {err}, body={}",
                truncate_text(&body_text, 2048)
            );
            LlmError::Upstream(format!("invalid response body: {err}"))
        })?;
        Ok(body
            .get("choices")
            .and_then(|value| value.get(0))
            .and_then(|value| value.get("message"))
            .and_then(|value| value.get("content"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string())
    }

    async fn stream_complete(
        &self,
        messages: &[ChatMessage],
        sink: &dyn ChunkSink,
    ) -> Result<String, LlmError> {
        let response = self
            .http
            .post(self.endpoint())
            .headers(self.headers())
            .json(&self.build_payload(messages, true))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Upstream(format!(
                "{status} {}",
                truncate_text(&text, 2048)
            )));
        }
        let mut stream = response.bytes_stream();
        let mut lines = SseLineBuffer::default();
        let mut combined = String::new();
        let mut saw_done = false;
        'read: while let Some(item) = stream.next().await {
            let bytes = item?;
            for line in lines.push(&bytes) {
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    saw_done = true;
                    break 'read;
                }
                match serde_json::from_str::<Value>(data) {
                    Ok(payload) => {
                        let delta = payload
                            .get("choices")
                            .and_then(|value| value.get(0))
                            .and_then(|value| value.get("delta"))
                            .and_then(|value| value.get("content"))
                            .and_then(Value::as_str)
                            .unwrap_or("");
                        if !delta.is_empty() {
                            combined.push_str(delta);
                            sink.on_chunk(delta).await;
                        }
                    }
                    Err(err) => {
                        warn!(
                            "LLM stream json parse failed: {err}, data={}",
                            truncate_text(data, 512)
                        );
                    }
                }
            }
        }
        if !saw_done {
            warn!("LLM stream ended without [DONE]");
        }
        Ok(combined)
    }

    fn sql_messages(prompt: &SqlPrompt) -> Vec<ChatMessage> {
        vec![
            ChatMessage {
                role: "system",
                content: SQL_SYSTEM_PROMPT.to_string(),
            },
            ChatMessage {
                role: "user",
                content: prompt.user_message(),
            },
        ]
    }
}

#[async_trait]
impl SqlGenerator for OpenAiSqlGenerator {
    async fn generate_sql(&self, prompt: &SqlPrompt) -> Result<SqlDraft, LlmError> {
        let content = self.complete(&Self::sql_messages(prompt)).await?;
        Ok(parse_sql_draft(&content))
    }

    async fn generate_sql_stream(
        &self,
        prompt: &SqlPrompt,
        sink: &dyn ChunkSink,
    ) -> Result<SqlDraft, LlmError> {
        let content = self
            .stream_complete(&Self::sql_messages(prompt), sink)
            .await?;
        Ok(parse_sql_draft(&content))
    }

    async fn generate_guidance(
        &self,
        query: &str,
        schema_context: &str,
        issue: &str,
    ) -> Result<String, LlmError> {
        let messages = vec![
            ChatMessage {
                role: "system",
                content: GUIDANCE_SYSTEM_PROMPT.to_string(),
            },
            ChatMessage {
                role: "user",
                content: guidance_message(query, schema_context, issue),
            },
        ];
        let hint = self.complete(&messages).await?;
        let hint = hint.trim();
        if hint.is_empty() {
            return Err(LlmError::Upstream("empty guidance".to_string()));
        }
        Ok(hint.to_string())
    }

    async fn debug_sql(
        &self,
        sql: &str,
        error: &str,
        schema_context: &str,
    ) -> Result<SqlDebugAdvice, LlmError> {
        let messages = vec![
            ChatMessage {
                role: "system",
                content: DEBUG_SYSTEM_PROMPT.to_string(),
            },
            ChatMessage {
                role: "user",
                content: debug_message(sql, error, schema_context),
            },
        ];
        let content = self.complete(&messages).await?;
        if content.trim().is_empty() {
            return Err(LlmError::Upstream("empty debug answer".to_string()));
        }
        Ok(parse_debug_advice(&content))
    }
}

/// 优先解析 JSON；否则把代码块当作建议语句，其余文字作为分析。
pub fn parse_debug_advice(content: &str) -> SqlDebugAdvice {
    let trimmed = content.trim();
    let parsed = trimmed
        .find('{')
        .zip(trimmed.rfind('}'))
        .filter(|(start, end)| start < end)
        .and_then(|(start, end)| serde_json::from_str::<Value>(&trimmed[start..=end]).ok())
        .filter(|value| value.get("analysis_text").is_some() || value.get("suggested_sql").is_some());
    if let Some(value) = parsed {
        let field = |name: &str| {
            value
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_string()
        };
        return SqlDebugAdvice {
            analysis_text: field("analysis_text"),
            suggested_sql: field("suggested_sql"),
            explanation: field("explanation"),
        };
    }
    match split_fenced_block(trimmed) {
        Some((before, block, after)) => SqlDebugAdvice {
            analysis_text: before.trim().to_string(),
            suggested_sql: block.trim().to_string(),
            explanation: after.trim().to_string(),
        },
        None => SqlDebugAdvice {
            analysis_text: trimmed.to_string(),
            ..SqlDebugAdvice::default()
        },
    }
}

/// 按字节缓存 SSE 数据，只有遇到换行才解码，避免多字节字符被网络分块截断。
#[derive(Default)]
struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    /// 追加一块数据，返回其中已完整的非空行。
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|byte| *byte == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }
}

/// 解析模型输出：优先 JSON `{sql, reasoning}`，其次 ```sql 代码块，最后整段视为 SQL。
pub fn parse_sql_draft(content: &str) -> SqlDraft {
    let trimmed = content.trim();
    if let Some(draft) = parse_json_draft(trimmed) {
        return draft;
    }
    if let Some((before, block, after)) = split_fenced_block(trimmed) {
        let reasoning = [before.trim(), after.trim()]
            .iter()
            .filter(|part| !part.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");
        return SqlDraft {
            sql: block.trim().to_string(),
            reasoning,
        };
    }
    SqlDraft {
        sql: trimmed.to_string(),
        reasoning: String::new(),
    }
}

fn parse_json_draft(content: &str) -> Option<SqlDraft> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
        return None;
    }
    let value = serde_json::from_str::<Value>(&content[start..=end]).ok()?;
    let sql = value.get("sql").and_then(Value::as_str)?;
    let reasoning = value
        .get("reasoning")
        .and_then(Value::as_str)
        .unwrap_or("");
    Some(SqlDraft {
        sql: sql.trim().to_string(),
        reasoning: reasoning.trim().to_string(),
    })
}

fn split_fenced_block(content: &str) -> Option<(&str, &str, &str)> {
    let open = content.find("```")?;
    let after_open = &content[open + 3..];
    let body_start = after_open.find('\n').map(|pos| pos + 1).unwrap_or(0);
    let body = &after_open[body_start..];
    let close = body.find("```")?;
    Some((&content[..open], &body[..close], &body[close + 3..]))
}

fn normalize_base_url(base_url: &str) -> Option<String> {
    let cleaned = base_url.trim().trim_end_matches('/');
    if cleaned.is_empty() {
        return None;
    }
    if cleaned.ends_with("/v1") {
        Some(cleaned.to_string())
    } else {
        Some(format!("{cleaned}/v1"))
    }
}

fn round_f32(value: f32) -> f64 {
    const DECIMALS: i32 = 6;
    let factor = 10_f64.powi(DECIMALS);
    ((value as f64) * factor).round() / factor
}

fn truncate_text(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut output = text[..end].to_string();
    output.push_str("...");
    output
}
