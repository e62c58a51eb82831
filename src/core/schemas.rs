// 对外数据结构：生成请求/结果、流式帧、执行与导出请求、进度条目。
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationSource {
    Template,
    Llm,
    AssistantHint,
}

impl GenerationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationSource::Template => "template",
            GenerationSource::Llm => "llm",
            GenerationSource::AssistantHint => "assistant_hint",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "template" => Some(GenerationSource::Template),
            "llm" => Some(GenerationSource::Llm),
            "assistant_hint" => Some(GenerationSource::AssistantHint),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStage {
    Pending,
    Received,
    TemplateMatched,
    PrepareContext,
    MemoryLoaded,
    LlmCall,
    Guidance,
    Completed,
    Failed,
}

impl GenerationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStage::Pending => "pending",
            GenerationStage::Received => "received",
            GenerationStage::TemplateMatched => "template_matched",
            GenerationStage::PrepareContext => "prepare_context",
            GenerationStage::MemoryLoaded => "memory_loaded",
            GenerationStage::LlmCall => "llm_call",
            GenerationStage::Guidance => "guidance",
            GenerationStage::Completed => "completed",
            GenerationStage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, GenerationStage::Completed | GenerationStage::Failed)
    }
}

/// REST 与 WebSocket 共用的入参。
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateSqlRequest {
    pub query: String,
    #[serde(default)]
    pub table_names: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
}

/// 归一化后的生成请求，接收后不再修改。
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub user_id: String,
    pub query: String,
    pub table_names: Vec<String>,
    pub session_id: String,
    pub request_id: String,
    pub context: Option<String>,
}

impl GenerationRequest {
    /// 查询为空时返回 `None`；会话缺省为调用方身份，请求 ID 缺省时由服务端生成。
    pub fn normalize(user_id: &str, raw: GenerateSqlRequest) -> Option<Self> {
        let query = raw.query.trim().to_string();
        if query.is_empty() {
            return None;
        }
        let session_id = raw
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(user_id)
            .to_string();
        let request_id = raw
            .request_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let table_names = parse_table_names(raw.table_names.as_deref());
        let context = raw
            .context
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        Some(Self {
            user_id: user_id.to_string(),
            query,
            table_names,
            session_id,
            request_id,
            context,
        })
    }
}

pub fn parse_table_names(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub sql: String,
    pub reasoning: String,
    pub source: GenerationSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    pub used_memory: bool,
    pub request_id: String,
}

impl GenerationResult {
    /// 写入聊天记录的格式：SQL + 空行 + Reasoning。
    pub fn transcript_text(&self) -> String {
        let mut message = self.sql.trim().to_string();
        let reasoning = self.reasoning.trim();
        if !reasoning.is_empty() {
            if !message.is_empty() {
                message.push_str("\n\n");
            }
            message.push_str("Reasoning:\n");
            message.push_str(reasoning);
        }
        if message.is_empty() {
            message = "The result has been returned, see the hint above.".to_string();
        }
        message
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    Progress {
        stage: GenerationStage,
        message: String,
    },
    Chunk {
        text: String,
    },
    Complete {
        sql: String,
        reasoning: String,
        source: GenerationSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        template_id: Option<String>,
        used_memory: bool,
        request_id: String,
    },
    Error {
        message: String,
    },
}

impl StreamFrame {
    pub fn complete(result: &GenerationResult) -> Self {
        StreamFrame::Complete {
            sql: result.sql.clone(),
            reasoning: result.reasoning.clone(),
            source: result.source,
            template_id: result.template_id.clone(),
            used_memory: result.used_memory,
            request_id: result.request_id.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamFrame::Complete { .. } | StreamFrame::Error { .. })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteSqlRequest {
    pub sql: String,
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub page_size: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DebugSqlRequest {
    pub sql: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportSqlRequest {
    pub sql: String,
    #[serde(default)]
    pub format: Option<String>,
    /// 缺省或非正数按 1000 处理，上限 5000。
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    pub exec_time_ms: u64,
    pub page: usize,
    pub page_size: usize,
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub masked_columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(reason.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub request_id: String,
    pub stage: GenerationStage,
    pub message: String,
    pub done: bool,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub query: String,
    pub sql: String,
    pub reasoning: String,
    pub source: GenerationSource,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub keywords: Vec<String>,
    pub sql: String,
    #[serde(default)]
    pub is_system: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessageRecord {
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub last_used: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_fills_defaults() {
        let raw = GenerateSqlRequest {
            query: "  top stores  ".to_string(),
            table_names: Some(" stores , ,orders".to_string()),
            session_id: Some("  ".to_string()),
            request_id: None,
            context: Some("   ".to_string()),
        };
        let request = GenerationRequest::normalize("alice", raw).expect("non-empty query");
        assert_eq!(request.query, "top stores");
        assert_eq!(request.session_id, "alice");
        assert_eq!(request.table_names, vec!["stores", "orders"]);
        assert!(!request.request_id.is_empty());
        assert!(request.context.is_none());
    }

    #[test]
    fn normalize_rejects_blank_query() {
        let raw = GenerateSqlRequest {
            query: " \n ".to_string(),
            table_names: None,
            session_id: None,
            request_id: None,
            context: None,
        };
        assert!(GenerationRequest::normalize("alice", raw).is_none());
    }

    #[test]
    fn transcript_text_layout() {
        let mut result = GenerationResult {
            sql: "SELECT 1".to_string(),
            reasoning: "trivial".to_string(),
            source: GenerationSource::Llm,
            template_id: None,
            used_memory: false,
            request_id: "r1".to_string(),
        };
        assert_eq!(result.transcript_text(), "SELECT 1\n\nReasoning:\ntrivial");
        result.sql.clear();
        assert_eq!(result.transcript_text(), "Reasoning:\ntrivial");
        result.reasoning.clear();
        assert!(!result.transcript_text().is_empty());
    }

    #[test]
    fn stream_frames_are_tagged() {
        let frame = StreamFrame::Progress {
            stage: GenerationStage::LlmCall,
            message: "calling".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({ "type": "progress", "stage": "llm_call", "message": "calling" })
        );
        let frame = StreamFrame::Chunk {
            text: "SEL".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({ "type": "chunk", "text": "SEL" })
        );
        assert!(!frame.is_terminal());
        assert!(StreamFrame::Error {
            message: "x".to_string()
        }
        .is_terminal());
    }
}
