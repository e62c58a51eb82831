// 生成进度：按请求 ID 记录阶段，供轮询接口与编排流程共享。
use crate::schemas::{GenerationStage, ProgressEntry};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const PENDING_MESSAGE: &str = "任务排队中";
pub const FAILED_MESSAGE: &str = "请求失败";

/// 单把互斥锁串行化所有写入；条目很小，轮询读远多于写。
#[derive(Default)]
pub struct ProgressTracker {
    entries: Mutex<HashMap<String, ProgressEntry>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已存在时不覆盖，重复的初始化调用无副作用。
    pub fn init(&self, request_id: &str, stage: GenerationStage, message: &str) {
        let mut entries = self.entries.lock();
        if entries.contains_key(request_id) {
            return;
        }
        entries.insert(
            request_id.to_string(),
            ProgressEntry {
                request_id: request_id.to_string(),
                stage,
                message: message.to_string(),
                done: false,
                success: false,
                error: None,
                updated_at: Utc::now(),
            },
        );
    }

    /// 未知或已结束的请求忽略更新，保证阶段单调推进。
    pub fn update(&self, request_id: &str, stage: GenerationStage, message: &str) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(request_id) else {
            return;
        };
        if entry.done {
            return;
        }
        entry.stage = stage;
        entry.message = message.to_string();
        entry.updated_at = Utc::now();
    }

    pub fn complete(&self, request_id: &str, message: &str) {
        self.finish(request_id, true, message, None);
    }

    pub fn fail(&self, request_id: &str, error: &str) {
        self.finish(request_id, false, FAILED_MESSAGE, Some(error.to_string()));
    }

    fn finish(&self, request_id: &str, success: bool, message: &str, error: Option<String>) {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(request_id.to_string())
            .or_insert_with(|| ProgressEntry {
                request_id: request_id.to_string(),
                stage: GenerationStage::Received,
                message: String::new(),
                done: false,
                success: false,
                error: None,
                updated_at: Utc::now(),
            });
        if entry.done {
            return;
        }
        entry.stage = if success {
            GenerationStage::Completed
        } else {
            GenerationStage::Failed
        };
        entry.message = message.to_string();
        entry.done = true;
        entry.success = success;
        entry.error = error;
        entry.updated_at = Utc::now();
    }

    /// 返回副本；未知 ID 返回合成的 pending 条目而不是报错。
    pub fn get(&self, request_id: &str) -> ProgressEntry {
        if let Some(entry) = self.entries.lock().get(request_id) {
            return entry.clone();
        }
        ProgressEntry {
            request_id: request_id.to_string(),
            stage: GenerationStage::Pending,
            message: PENDING_MESSAGE.to_string(),
            done: false,
            success: false,
            error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// 删除超过保留时长未更新的条目，返回删除数量。
    pub fn cleanup(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.updated_at >= cutoff);
        before - entries.len()
    }

    /// 后台定期清理；`interval` 为 0 时不启动。
    pub fn spawn_sweeper(
        self: Arc<Self>,
        retention: Duration,
        interval: Duration,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if interval.is_zero() {
            return None;
        }
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = self.cleanup(retention);
                if removed > 0 {
                    debug!("清理过期进度条目: {removed}");
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_id_is_synthetic_pending() {
        let tracker = ProgressTracker::new();
        let entry = tracker.get("missing");
        assert_eq!(entry.stage, GenerationStage::Pending);
        assert_eq!(entry.message, PENDING_MESSAGE);
        assert!(!entry.done);
        assert!(tracker.is_empty());
    }

    #[test]
    fn init_is_idempotent() {
        let tracker = ProgressTracker::new();
        tracker.init("r1", GenerationStage::Received, "received");
        tracker.update("r1", GenerationStage::LlmCall, "calling");
        tracker.init("r1", GenerationStage::Received, "again");
        assert_eq!(tracker.get("r1").stage, GenerationStage::LlmCall);
    }

    #[test]
    fn no_transition_after_done() {
        let tracker = ProgressTracker::new();
        tracker.init("r1", GenerationStage::Received, "received");
        tracker.complete("r1", "done");
        tracker.update("r1", GenerationStage::LlmCall, "late");
        tracker.fail("r1", "late failure");
        let entry = tracker.get("r1");
        assert_eq!(entry.stage, GenerationStage::Completed);
        assert!(entry.done && entry.success);
        assert!(entry.error.is_none());
    }

    #[test]
    fn fail_records_error_even_without_init() {
        let tracker = ProgressTracker::new();
        tracker.update("r2", GenerationStage::LlmCall, "ignored");
        assert!(tracker.is_empty());
        tracker.fail("r2", "boom");
        let entry = tracker.get("r2");
        assert_eq!(entry.stage, GenerationStage::Failed);
        assert_eq!(entry.message, FAILED_MESSAGE);
        assert_eq!(entry.error.as_deref(), Some("boom"));
        assert!(entry.done && !entry.success);
    }

    #[test]
    fn get_returns_copy() {
        let tracker = ProgressTracker::new();
        tracker.init("r1", GenerationStage::Received, "received");
        let mut copy = tracker.get("r1");
        copy.message = "mutated".to_string();
        assert_eq!(tracker.get("r1").message, "received");
    }

    #[test]
    fn cleanup_drops_stale_entries() {
        let tracker = ProgressTracker::new();
        tracker.init("old", GenerationStage::Received, "received");
        std::thread::sleep(Duration::from_millis(20));
        tracker.init("new", GenerationStage::Received, "received");
        assert_eq!(tracker.cleanup(Duration::from_millis(10)), 1);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.get("new").stage, GenerationStage::Received);
    }
}
