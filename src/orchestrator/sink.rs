// 结果投递：同一条生成流水线通过 sink 适配 REST 与 WebSocket 两种出口。
use super::OrchestratorError;
use crate::llm::ChunkSink;
use crate::schemas::{GenerationResult, GenerationStage, StreamFrame};
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait GenerationSink: Send + Sync {
    /// 为 true 时调用流式生成接口并逐段转发增量。
    fn streaming(&self) -> bool {
        false
    }

    async fn on_progress(&self, stage: GenerationStage, message: &str);

    async fn on_chunk(&self, text: &str);

    async fn on_complete(&self, result: &GenerationResult);

    async fn on_error(&self, error: &OrchestratorError);
}

/// REST 出口：等待最终结果，过程事件全部丢弃。
pub struct BufferedSink;

#[async_trait]
impl GenerationSink for BufferedSink {
    async fn on_progress(&self, _stage: GenerationStage, _message: &str) {}

    async fn on_chunk(&self, _text: &str) {}

    async fn on_complete(&self, _result: &GenerationResult) {}

    async fn on_error(&self, _error: &OrchestratorError) {}
}

/// 流式出口：每个事件转成一帧写入通道，由连接侧的写任务发送。
/// 接收端已关闭时静默丢弃，生成流程照常走完并落库。
pub struct FrameSink {
    frames: mpsc::Sender<StreamFrame>,
}

impl FrameSink {
    pub fn new(frames: mpsc::Sender<StreamFrame>) -> Self {
        Self { frames }
    }

    async fn push(&self, frame: StreamFrame) {
        let _ = self.frames.send(frame).await;
    }
}

#[async_trait]
impl GenerationSink for FrameSink {
    fn streaming(&self) -> bool {
        true
    }

    async fn on_progress(&self, stage: GenerationStage, message: &str) {
        self.push(StreamFrame::Progress {
            stage,
            message: message.to_string(),
        })
        .await;
    }

    async fn on_chunk(&self, text: &str) {
        self.push(StreamFrame::Chunk {
            text: text.to_string(),
        })
        .await;
    }

    async fn on_complete(&self, result: &GenerationResult) {
        self.push(StreamFrame::complete(result)).await;
    }

    async fn on_error(&self, error: &OrchestratorError) {
        self.push(StreamFrame::Error {
            message: error.message().to_string(),
        })
        .await;
    }
}

/// 把模型的增量回调接到 sink 上，不做额外缓冲。
pub(super) struct SinkChunks<'a>(pub(super) &'a dyn GenerationSink);

#[async_trait]
impl ChunkSink for SinkChunks<'_> {
    async fn on_chunk(&self, text: &str) {
        if !text.is_empty() {
            self.0.on_chunk(text).await;
        }
    }
}
