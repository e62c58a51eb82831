// 运行监控：记录指标事件（耗时、成败与附加字段），保留最近若干条供查询。
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::info;

pub const EVENT_GENERATE_REST: &str = "generate_rest";
pub const EVENT_GENERATE_WS: &str = "generate_ws";
pub const EVENT_EXECUTE_SQL: &str = "execute_sql";
pub const EVENT_DEBUG_SQL: &str = "debug_sql";
pub const EVENT_EXPORT_SQL: &str = "export_sql";
pub const EVENT_DATABASE_INFO: &str = "database_info";
pub const EVENT_CHAT_SESSIONS: &str = "chat_sessions";
pub const EVENT_CHAT_MESSAGES: &str = "chat_messages";
pub const EVENT_CHAT_EXPORT: &str = "chat_export";

const DEFAULT_EVENT_LIMIT: usize = 500;

#[derive(Debug, Clone, Serialize)]
pub struct MetricEvent {
    pub event: String,
    pub duration_ms: u64,
    pub success: bool,
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

pub struct MonitorState {
    events: Mutex<VecDeque<MetricEvent>>,
    limit: usize,
}

impl MonitorState {
    pub fn new(limit: usize) -> Self {
        let limit = if limit == 0 { DEFAULT_EVENT_LIMIT } else { limit };
        Self {
            events: Mutex::new(VecDeque::with_capacity(limit.min(1024))),
            limit,
        }
    }

    /// 只写日志和内存环形缓冲，不会失败也不会阻塞调用方。
    pub fn record(&self, event: &str, duration: Duration, success: bool, metadata: Map<String, Value>) {
        let duration_ms = duration.as_millis() as u64;
        let metadata_text = Value::Object(metadata.clone()).to_string();
        info!(
            target: "sqlpilot::metrics",
            event,
            duration_ms,
            success,
            metadata = %metadata_text,
            "metric"
        );
        let mut events = self.events.lock();
        while events.len() >= self.limit {
            events.pop_front();
        }
        events.push_back(MetricEvent {
            event: event.to_string(),
            duration_ms,
            success,
            metadata,
            timestamp: Utc::now(),
        });
    }

    /// 最近的事件，最新的在前。
    pub fn recent(&self, limit: Option<usize>) -> Vec<MetricEvent> {
        let events = self.events.lock();
        let take = limit.unwrap_or(events.len()).min(events.len());
        events.iter().rev().take(take).cloned().collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|item| item.event == event)
            .count()
    }
}

impl Default for MonitorState {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_LIMIT)
    }
}
