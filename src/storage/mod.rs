// 存储模块：对话记忆、SQL 模板与聊天记录的持久化接口。

mod sqlite;

use crate::config::StorageConfig;
use crate::schemas::{ChatMessageRecord, MemoryEntry, SessionSummary, SqlTemplate};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub use sqlite::SqliteStorage;

pub trait StorageBackend: Send + Sync {
    fn ensure_initialized(&self) -> Result<()>;

    fn append_memory(&self, user_id: &str, session_id: &str, entry: &MemoryEntry) -> Result<()>;
    /// 最近的 `limit` 条记忆，按时间倒序返回。
    fn load_recent_memory(
        &self,
        user_id: &str,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>>;
    /// 整个会话的记忆，按时间正序返回。
    fn load_session_memory(&self, user_id: &str, session_id: &str) -> Result<Vec<MemoryEntry>>;
    fn list_memory_sessions(&self, user_id: &str) -> Result<Vec<SessionSummary>>;
    fn delete_memory_before(&self, before: DateTime<Utc>) -> Result<i64>;

    fn list_templates(&self) -> Result<Vec<SqlTemplate>>;
    fn upsert_template(&self, template: &SqlTemplate) -> Result<()>;

    fn append_chat_message(
        &self,
        user_id: &str,
        session_id: &str,
        role: &str,
        content: &str,
    ) -> Result<()>;
    /// 最近的 `limit` 条聊天记录，按时间正序返回；`keyword` 为内容子串过滤。
    fn load_chat_messages(
        &self,
        user_id: &str,
        session_id: &str,
        limit: Option<i64>,
        keyword: Option<&str>,
    ) -> Result<Vec<ChatMessageRecord>>;
    fn list_chat_sessions(&self, user_id: &str) -> Result<Vec<SessionSummary>>;
}

/// 在阻塞线程池中执行同步存储调用。
pub async fn run_blocking<T, F>(storage: &Arc<dyn StorageBackend>, task: F) -> Result<T>
where
    F: FnOnce(&dyn StorageBackend) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let storage = storage.clone();
    tokio::task::spawn_blocking(move || task(storage.as_ref()))
        .await
        .map_err(|err| anyhow!("storage task failed: {err}"))?
}

pub fn build_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    let storage = Arc::new(SqliteStorage::new(config.db_path.trim().to_string()));
    storage.ensure_initialized()?;
    Ok(storage)
}
