// 生成编排：模版短路、表结构与记忆装配、模型调用、护栏复查与提示兜底。
use crate::config::GenerationConfig;
use crate::llm::{LlmError, SqlDebugAdvice, SqlDraft, SqlGenerator, SqlPrompt};
use crate::memory::{MemoryAssembler, MemoryContext};
use crate::monitor::MonitorState;
use crate::progress::ProgressTracker;
use crate::schema_context::SchemaContextBuilder;
use crate::schemas::{GenerationRequest, GenerationResult, GenerationSource, GenerationStage};
use crate::storage::{run_blocking, StorageBackend};
use crate::templates::TemplateMatcher;
use crate::warehouse::Warehouse;
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

mod error;
mod guidance;
mod sink;

pub use error::{OrchestratorError, GENERATION_FAILED, TIMEOUT, TRANSPORT_FAILURE};
pub use guidance::needs_guidance;
pub use sink::{BufferedSink, FrameSink, GenerationSink};
use sink::SinkChunks;

const ROLE_USER: &str = "user";
const ROLE_ASSISTANT: &str = "assistant";

pub struct OrchestratorDeps {
    pub storage: Arc<dyn StorageBackend>,
    pub warehouse: Arc<dyn Warehouse>,
    pub llm: Arc<dyn SqlGenerator>,
    pub memory: Arc<MemoryAssembler>,
    pub progress: Arc<ProgressTracker>,
    pub monitor: Arc<MonitorState>,
}

pub struct Orchestrator {
    storage: Arc<dyn StorageBackend>,
    templates: TemplateMatcher,
    schema: SchemaContextBuilder,
    llm: Arc<dyn SqlGenerator>,
    memory: Arc<MemoryAssembler>,
    progress: Arc<ProgressTracker>,
    monitor: Arc<MonitorState>,
    timeout: Duration,
    guidance_timeout: Duration,
}

/// 触发提示路径的原因。
enum GuidanceCause {
    /// 模型给出的文本没通过护栏复查。
    Guardrail(String),
    Failure(LlmError),
}

impl GuidanceCause {
    fn issue(&self) -> String {
        match self {
            GuidanceCause::Guardrail(text) if text.trim().is_empty() => {
                "the model returned an empty answer".to_string()
            }
            GuidanceCause::Guardrail(text) => text.trim().to_string(),
            GuidanceCause::Failure(err) => err.to_string(),
        }
    }
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps, config: &GenerationConfig) -> Self {
        Self {
            templates: TemplateMatcher::new(deps.storage.clone(), config.template_min_hits),
            schema: SchemaContextBuilder::new(deps.warehouse, &config.schema),
            storage: deps.storage,
            llm: deps.llm,
            memory: deps.memory,
            progress: deps.progress,
            monitor: deps.monitor,
            timeout: Duration::from_secs(config.timeout_s.max(1)),
            guidance_timeout: Duration::from_secs(config.guidance_timeout_s.max(1)),
        }
    }

    /// 单一流水线，REST 与 WebSocket 仅 sink 不同。
    /// 每次调用恰好产生一次终态（进度、sink 回调与指标各一次）。
    pub async fn run(
        &self,
        request: &GenerationRequest,
        sink: &dyn GenerationSink,
        event: &str,
    ) -> Result<GenerationResult, OrchestratorError> {
        let started = std::time::Instant::now();
        let outcome = self.pipeline(request, sink).await;
        let mut metadata = Map::new();
        metadata.insert("session_id".to_string(), json!(request.session_id));
        metadata.insert("request_id".to_string(), json!(request.request_id));
        match &outcome {
            Ok(result) => {
                self.persist(request, result).await;
                self.progress
                    .complete(&request.request_id, completion_message(result.source));
                sink.on_complete(result).await;
                metadata.insert("source".to_string(), json!(result.source.as_str()));
                if let Some(template_id) = &result.template_id {
                    metadata.insert("template_id".to_string(), json!(template_id));
                }
                info!(
                    "SQL 生成完成: request_id={}, source={}, used_memory={}",
                    request.request_id,
                    result.source.as_str(),
                    result.used_memory
                );
            }
            Err(err) => {
                self.progress.fail(&request.request_id, err.message());
                self.save_chat(
                    request,
                    ROLE_ASSISTANT,
                    &format!("生成失败：{}", err.message()),
                )
                .await;
                sink.on_error(err).await;
                metadata.insert("error".to_string(), json!(err.code()));
                warn!(
                    "SQL 生成失败: request_id={}, code={}, {}",
                    request.request_id,
                    err.code(),
                    err.message()
                );
            }
        }
        self.monitor
            .record(event, started.elapsed(), outcome.is_ok(), metadata);
        outcome
    }

    /// 基于全库元数据请模型分析失败语句；元数据与模型调用各自使用一份完整预算。
    pub async fn debug(&self, sql: &str, error: &str) -> Result<SqlDebugAdvice, OrchestratorError> {
        let schema_context = self
            .schema
            .build_context(&[], Instant::now() + self.timeout)
            .await;
        let advice = tokio::time::timeout(
            self.timeout,
            self.llm.debug_sql(sql, error, &schema_context),
        )
        .await
        .unwrap_or(Err(LlmError::Timeout));
        match advice {
            Ok(advice) => Ok(advice),
            Err(err) if err.is_transport() => {
                Err(OrchestratorError::transport_failure(err.to_string()))
            }
            Err(LlmError::Timeout) => Err(OrchestratorError::timeout(LlmError::Timeout.to_string())),
            Err(err) => Err(OrchestratorError::generation_failed(err.to_string(), None)),
        }
    }

    async fn pipeline(
        &self,
        request: &GenerationRequest,
        sink: &dyn GenerationSink,
    ) -> Result<GenerationResult, OrchestratorError> {
        self.save_chat(request, ROLE_USER, &request.query).await;
        self.progress
            .init(&request.request_id, GenerationStage::Received, "已收到生成请求");
        sink.on_progress(GenerationStage::Received, "已收到生成请求")
            .await;

        if let Some(hit) = self.templates.find_match(&request.query).await {
            let message = format!("命中模版：{}", hit.template.name);
            self.advance(request, sink, GenerationStage::TemplateMatched, &message)
                .await;
            return Ok(GenerationResult {
                sql: hit.template.sql.clone(),
                reasoning: format!("matched built-in template: {}", hit.template.name),
                source: GenerationSource::Template,
                template_id: Some(hit.template.id.clone()),
                used_memory: false,
                request_id: request.request_id.clone(),
            });
        }

        let deadline = Instant::now() + self.timeout;
        self.advance(
            request,
            sink,
            GenerationStage::PrepareContext,
            "正在加载数据库元数据",
        )
        .await;
        let schema_context = self
            .schema
            .build_context(&request.table_names, deadline)
            .await;

        let memory = self.memory.load(&request.user_id, &request.session_id).await;
        let message = format!("命中 {} 条历史记忆", memory.entries.len());
        self.advance(request, sink, GenerationStage::MemoryLoaded, &message)
            .await;

        self.advance(request, sink, GenerationStage::LlmCall, "LLM 正在生成 SQL")
            .await;
        let prompt = SqlPrompt {
            query: request.query.clone(),
            schema_context,
            memory_context: memory.text.clone(),
            extra_context: request.context.clone(),
        };
        let cause = match self.draft_sql(&prompt, sink, deadline).await {
            Ok(draft) if !needs_guidance(&draft.sql) => {
                return Ok(GenerationResult {
                    sql: draft.sql.trim().to_string(),
                    reasoning: draft.reasoning,
                    source: GenerationSource::Llm,
                    template_id: None,
                    used_memory: memory.used(),
                    request_id: request.request_id.clone(),
                });
            }
            Ok(draft) => {
                info!("模型输出未通过护栏复查，转为提示: {}", request.request_id);
                GuidanceCause::Guardrail(draft.sql)
            }
            Err(err) if err.is_transport() => {
                return Err(OrchestratorError::transport_failure(err.to_string()));
            }
            Err(err) => {
                warn!("模型生成失败，尝试提示兜底: {}, {err}", request.request_id);
                GuidanceCause::Failure(err)
            }
        };
        self.guidance(request, sink, &prompt, &memory, cause).await
    }

    async fn draft_sql(
        &self,
        prompt: &SqlPrompt,
        sink: &dyn GenerationSink,
        deadline: Instant,
    ) -> Result<SqlDraft, LlmError> {
        let call = async {
            if sink.streaming() {
                self.llm
                    .generate_sql_stream(prompt, &SinkChunks(sink))
                    .await
            } else {
                self.llm.generate_sql(prompt).await
            }
        };
        match tokio::time::timeout_at(deadline, call).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout),
        }
    }

    /// 提示请求使用独立的新预算。
    async fn guidance(
        &self,
        request: &GenerationRequest,
        sink: &dyn GenerationSink,
        prompt: &SqlPrompt,
        memory: &MemoryContext,
        cause: GuidanceCause,
    ) -> Result<GenerationResult, OrchestratorError> {
        self.advance(request, sink, GenerationStage::Guidance, "正在生成提示")
            .await;
        let issue = cause.issue();
        let hint = tokio::time::timeout(
            self.guidance_timeout,
            self.llm
                .generate_guidance(&request.query, &prompt.schema_context, &issue),
        )
        .await
        .unwrap_or(Err(LlmError::Timeout));
        match hint {
            Ok(hint) if !hint.trim().is_empty() => Ok(GenerationResult {
                sql: String::new(),
                reasoning: hint.trim().to_string(),
                source: GenerationSource::AssistantHint,
                template_id: None,
                used_memory: memory.used(),
                request_id: request.request_id.clone(),
            }),
            Ok(_) => Err(guidance_failure(cause, "guidance response was empty".to_string())),
            Err(err) if err.is_transport() => {
                Err(OrchestratorError::transport_failure(err.to_string()))
            }
            Err(err) => Err(guidance_failure(cause, err.to_string())),
        }
    }

    async fn advance(
        &self,
        request: &GenerationRequest,
        sink: &dyn GenerationSink,
        stage: GenerationStage,
        message: &str,
    ) {
        self.progress.update(&request.request_id, stage, message);
        sink.on_progress(stage, message).await;
    }

    /// 提示只进聊天记录，不进入记忆，避免污染后续追问的上下文。
    async fn persist(&self, request: &GenerationRequest, result: &GenerationResult) {
        if result.source != GenerationSource::AssistantHint {
            if let Err(err) = self
                .memory
                .record(&request.user_id, &request.session_id, &request.query, result)
                .await
            {
                warn!("写入会话记忆失败: {}, {err}", request.request_id);
            }
        }
        self.save_chat(request, ROLE_ASSISTANT, &result.transcript_text())
            .await;
    }

    async fn save_chat(&self, request: &GenerationRequest, role: &str, content: &str) {
        let owner = (request.user_id.clone(), request.session_id.clone());
        let (role, content) = (role.to_string(), content.to_string());
        let saved = run_blocking(&self.storage, move |storage| {
            storage.append_chat_message(&owner.0, &owner.1, &role, &content)
        })
        .await;
        if let Err(err) = saved {
            warn!("写入聊天记录失败: {}, {err}", request.request_id);
        }
    }
}

fn completion_message(source: GenerationSource) -> &'static str {
    match source {
        GenerationSource::Template => "生成完成（模版）",
        GenerationSource::AssistantHint => "生成完成（提示）",
        GenerationSource::Llm => "生成完成",
    }
}

fn guidance_failure(cause: GuidanceCause, guidance_error: String) -> OrchestratorError {
    let detail = Some(json!({ "guidance_error": guidance_error }));
    match cause {
        GuidanceCause::Failure(LlmError::Timeout) => {
            OrchestratorError::timeout(LlmError::Timeout.to_string())
        }
        GuidanceCause::Failure(err) => OrchestratorError::generation_failed(err.to_string(), detail),
        GuidanceCause::Guardrail(text) => OrchestratorError::generation_failed(
            "unable to generate SQL for this question".to_string(),
            Some(json!({
                "model_output": text,
                "guidance_error": guidance_error,
            })),
        ),
    }
}
