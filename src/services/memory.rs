// 会话记忆：读取最近若干轮问答并渲染成提示词片段，同时负责写回与清理。
use crate::schemas::{GenerationResult, MemoryEntry, SessionSummary};
use crate::storage::{run_blocking, StorageBackend};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_MEMORY_WINDOW: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct MemoryContext {
    /// 按时间正序排列。
    pub entries: Vec<MemoryEntry>,
    pub text: String,
}

impl MemoryContext {
    pub fn used(&self) -> bool {
        !self.entries.is_empty()
    }
}

pub struct MemoryAssembler {
    storage: Arc<dyn StorageBackend>,
    window: usize,
}

impl MemoryAssembler {
    pub fn new(storage: Arc<dyn StorageBackend>, window: usize) -> Self {
        Self {
            storage,
            window: if window == 0 {
                DEFAULT_MEMORY_WINDOW
            } else {
                window
            },
        }
    }

    /// 存储按倒序返回，这里翻转回正序再渲染；读取失败时视为没有记忆。
    pub async fn load(&self, user_id: &str, session_id: &str) -> MemoryContext {
        let owner = (user_id.to_string(), session_id.to_string());
        let window = self.window;
        let loaded = run_blocking(&self.storage, move |storage| {
            storage.load_recent_memory(&owner.0, &owner.1, window)
        })
        .await;
        let mut entries = match loaded {
            Ok(entries) => entries,
            Err(err) => {
                warn!("读取会话记忆失败: {user_id}/{session_id}, {err}");
                Vec::new()
            }
        };
        entries.reverse();
        let text = render_memory(&entries);
        MemoryContext { entries, text }
    }

    pub async fn record(
        &self,
        user_id: &str,
        session_id: &str,
        query: &str,
        result: &GenerationResult,
    ) -> Result<()> {
        let entry = MemoryEntry {
            query: query.to_string(),
            sql: result.sql.clone(),
            reasoning: result.reasoning.clone(),
            source: result.source,
            created_at: Utc::now(),
        };
        let owner = (user_id.to_string(), session_id.to_string());
        run_blocking(&self.storage, move |storage| {
            storage.append_memory(&owner.0, &owner.1, &entry)
        })
        .await
    }

    pub async fn session(&self, user_id: &str, session_id: &str) -> Result<Vec<MemoryEntry>> {
        let owner = (user_id.to_string(), session_id.to_string());
        run_blocking(&self.storage, move |storage| {
            storage.load_session_memory(&owner.0, &owner.1)
        })
        .await
    }

    pub async fn sessions(&self, user_id: &str) -> Result<Vec<SessionSummary>> {
        let user_id = user_id.to_string();
        run_blocking(&self.storage, move |storage| {
            storage.list_memory_sessions(&user_id)
        })
        .await
    }

    pub async fn cleanup(&self, older_than: Duration) -> Result<i64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        run_blocking(&self.storage, move |storage| storage.delete_memory_before(cutoff)).await
    }
}

pub fn render_memory(entries: &[MemoryEntry]) -> String {
    let mut output = String::new();
    for (index, entry) in entries.iter().enumerate() {
        output.push_str(&format!("{}) USER: {}\n", index + 1, entry.query));
        output.push_str("   SQL: ");
        output.push_str(&entry.sql);
        output.push('\n');
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::GenerationSource;
    use crate::storage::SqliteStorage;

    #[test]
    fn render_is_numbered_turns() {
        let entries = vec![
            MemoryEntry {
                query: "top stores".to_string(),
                sql: "SELECT * FROM stores".to_string(),
                reasoning: String::new(),
                source: GenerationSource::Llm,
                created_at: Utc::now(),
            },
            MemoryEntry {
                query: "only north".to_string(),
                sql: "SELECT * FROM stores WHERE area = 'north'".to_string(),
                reasoning: String::new(),
                source: GenerationSource::Llm,
                created_at: Utc::now(),
            },
        ];
        assert_eq!(
            render_memory(&entries),
            "1) USER: top stores\n   SQL: SELECT * FROM stores\n2) USER: only north\n   SQL: SELECT * FROM stores WHERE area = 'north'\n"
        );
        assert_eq!(render_memory(&[]), "");
    }

    #[tokio::test]
    async fn load_returns_chronological_window() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage: Arc<dyn StorageBackend> = Arc::new(SqliteStorage::new(
            dir.path().join("memory.db").to_string_lossy().to_string(),
        ));
        let assembler = MemoryAssembler::new(storage, 2);
        assert!(!assembler.load("alice", "s1").await.used());
        for query in ["first", "second", "third"] {
            let result = GenerationResult {
                sql: format!("SELECT '{query}'"),
                reasoning: String::new(),
                source: GenerationSource::Llm,
                template_id: None,
                used_memory: false,
                request_id: query.to_string(),
            };
            assembler.record("alice", "s1", query, &result).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let context = assembler.load("alice", "s1").await;
        let queries: Vec<_> = context.entries.iter().map(|item| item.query.as_str()).collect();
        assert_eq!(queries, vec!["second", "third"]);
        assert!(context.text.starts_with("1) USER: second\n"));
        assert!(context.used());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn storage_calls_leave_the_runtime_thread() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage: Arc<dyn StorageBackend> = Arc::new(SqliteStorage::new(
            dir.path().join("memory.db").to_string_lossy().to_string(),
        ));
        let runtime_thread = std::thread::current().id();
        let worker_thread = run_blocking(&storage, |_| Ok(std::thread::current().id()))
            .await
            .unwrap();
        assert_ne!(runtime_thread, worker_thread);

        let assembler = MemoryAssembler::new(storage, 5);
        let result = GenerationResult {
            sql: "SELECT 1".to_string(),
            reasoning: String::new(),
            source: GenerationSource::Llm,
            template_id: None,
            used_memory: false,
            request_id: "r1".to_string(),
        };
        assembler.record("alice", "s1", "one", &result).await.unwrap();
        let sessions = assembler.sessions("alice").await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(assembler.session("alice", "s1").await.unwrap().len(), 1);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(assembler.cleanup(Duration::ZERO).await.unwrap(), 1);
    }
}
