// SQLite 存储实现：对话记忆、模板与聊天记录共用一个数据库文件。
use crate::schemas::{
    ChatMessageRecord, GenerationSource, MemoryEntry, SessionSummary, SqlTemplate,
};
use crate::storage::StorageBackend;
use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct SqliteStorage {
    db_path: PathBuf,
    initialized: AtomicBool,
    init_guard: Mutex<()>,
}

impl SqliteStorage {
    pub fn new(db_path: String) -> Self {
        let path = if db_path.trim().is_empty() {
            PathBuf::from("./data/sqlpilot.db")
        } else {
            PathBuf::from(db_path)
        };
        Self {
            db_path: path,
            initialized: AtomicBool::new(false),
            init_guard: Mutex::new(()),
        }
    }

    fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn open(&self) -> Result<Connection> {
        self.ensure_db_dir()?;
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Ok(conn)
    }

    fn to_ts(value: DateTime<Utc>) -> f64 {
        value.timestamp_millis() as f64 / 1000.0
    }

    fn from_ts(value: f64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis((value * 1000.0).round() as i64).unwrap_or_default()
    }

    fn parse_keywords(raw: &str) -> Vec<String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        if let Ok(items) = serde_json::from_str::<Vec<String>>(trimmed) {
            return items
                .into_iter()
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect();
        }
        trimmed
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    }

    fn memory_from_row(row: &Row<'_>) -> rusqlite::Result<MemoryEntry> {
        let source: String = row.get(3)?;
        Ok(MemoryEntry {
            query: row.get(0)?,
            sql: row.get(1)?,
            reasoning: row.get(2)?,
            source: GenerationSource::parse(&source).unwrap_or(GenerationSource::Llm),
            created_at: Self::from_ts(row.get(4)?),
        })
    }
}

impl StorageBackend for SqliteStorage {
    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_guard.lock();
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS conversation_memory (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              user_id TEXT NOT NULL,
              session_id TEXT NOT NULL,
              query_text TEXT NOT NULL,
              sql_text TEXT NOT NULL,
              reasoning TEXT NOT NULL,
              source TEXT NOT NULL,
              created_time REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversation_memory_session
              ON conversation_memory (user_id, session_id, created_time);
            CREATE TABLE IF NOT EXISTS sql_templates (
              id TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              description TEXT NOT NULL,
              keywords TEXT NOT NULL,
              sql_text TEXT NOT NULL,
              is_system INTEGER NOT NULL DEFAULT 0,
              created_time REAL NOT NULL,
              updated_time REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS chat_messages (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              user_id TEXT NOT NULL,
              session_id TEXT NOT NULL,
              role TEXT NOT NULL,
              content TEXT NOT NULL,
              created_time REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chat_messages_session
              ON chat_messages (user_id, session_id, id);
            "#,
        )?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn append_memory(&self, user_id: &str, session_id: &str, entry: &MemoryEntry) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO conversation_memory (user_id, session_id, query_text, sql_text, reasoning, source, created_time) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                user_id,
                session_id,
                entry.query,
                entry.sql,
                entry.reasoning,
                entry.source.as_str(),
                Self::to_ts(entry.created_at)
            ],
        )?;
        Ok(())
    }

    fn load_recent_memory(
        &self,
        user_id: &str,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT query_text, sql_text, reasoning, source, created_time FROM conversation_memory \
             WHERE user_id = ? AND session_id = ? ORDER BY created_time DESC, id DESC LIMIT ?",
        )?;
        let entries = stmt
            .query_map(params![user_id, session_id, limit as i64], Self::memory_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn load_session_memory(&self, user_id: &str, session_id: &str) -> Result<Vec<MemoryEntry>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT query_text, sql_text, reasoning, source, created_time FROM conversation_memory \
             WHERE user_id = ? AND session_id = ? ORDER BY created_time ASC, id ASC",
        )?;
        let entries = stmt
            .query_map(params![user_id, session_id], Self::memory_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn list_memory_sessions(&self, user_id: &str) -> Result<Vec<SessionSummary>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, MAX(created_time) AS last_used FROM conversation_memory \
             WHERE user_id = ? GROUP BY session_id ORDER BY last_used DESC",
        )?;
        let sessions = stmt
            .query_map(params![user_id], |row| {
                Ok(SessionSummary {
                    session_id: row.get(0)?,
                    last_used: Self::from_ts(row.get(1)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    fn delete_memory_before(&self, before: DateTime<Utc>) -> Result<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let affected = conn.execute(
            "DELETE FROM conversation_memory WHERE created_time < ?",
            params![Self::to_ts(before)],
        )?;
        Ok(affected as i64)
    }

    fn list_templates(&self) -> Result<Vec<SqlTemplate>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, description, keywords, sql_text, is_system FROM sql_templates \
             ORDER BY created_time ASC, id ASC",
        )?;
        let templates = stmt
            .query_map([], |row| {
                let keywords: String = row.get(3)?;
                let is_system: i64 = row.get(5)?;
                Ok(SqlTemplate {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    keywords: Self::parse_keywords(&keywords),
                    sql: row.get(4)?,
                    is_system: is_system != 0,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(templates)
    }

    fn upsert_template(&self, template: &SqlTemplate) -> Result<()> {
        self.ensure_initialized()?;
        let keywords =
            serde_json::to_string(&template.keywords).unwrap_or_else(|_| "[]".to_string());
        let now = Self::to_ts(Utc::now());
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO sql_templates (id, name, description, keywords, sql_text, is_system, created_time, updated_time) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, description = excluded.description, \
             keywords = excluded.keywords, sql_text = excluded.sql_text, is_system = excluded.is_system, \
             updated_time = excluded.updated_time",
            params![
                template.id,
                template.name,
                template.description,
                keywords,
                template.sql,
                if template.is_system { 1 } else { 0 },
                now,
                now
            ],
        )?;
        Ok(())
    }

    fn append_chat_message(
        &self,
        user_id: &str,
        session_id: &str,
        role: &str,
        content: &str,
    ) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO chat_messages (user_id, session_id, role, content, created_time) VALUES (?, ?, ?, ?, ?)",
            params![user_id, session_id, role, content, Self::to_ts(Utc::now())],
        )?;
        Ok(())
    }

    fn load_chat_messages(
        &self,
        user_id: &str,
        session_id: &str,
        limit: Option<i64>,
        keyword: Option<&str>,
    ) -> Result<Vec<ChatMessageRecord>> {
        self.ensure_initialized()?;
        let limit_value = limit.filter(|value| *value > 0).unwrap_or(-1);
        let pattern = keyword
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| format!("%{}%", escape_like(value)));
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, role, content, created_time FROM chat_messages \
             WHERE user_id = ? AND session_id = ? AND (? IS NULL OR content LIKE ? ESCAPE '\\') \
             ORDER BY id DESC LIMIT ?",
        )?;
        let mut records = stmt
            .query_map(
                params![user_id, session_id, pattern, pattern, limit_value],
                |row| {
                    Ok(ChatMessageRecord {
                        session_id: row.get(0)?,
                        role: row.get(1)?,
                        content: row.get(2)?,
                        created_at: Self::from_ts(row.get(3)?),
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        records.reverse();
        Ok(records)
    }

    fn list_chat_sessions(&self, user_id: &str) -> Result<Vec<SessionSummary>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, MAX(created_time) AS last_used FROM chat_messages \
             WHERE user_id = ? GROUP BY session_id ORDER BY last_used DESC",
        )?;
        let sessions = stmt
            .query_map(params![user_id], |row| {
                Ok(SessionSummary {
                    session_id: row.get(0)?,
                    last_used: Self::from_ts(row.get(1)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sessions)
    }
}

fn escape_like(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            output.push('\\');
        }
        output.push(ch);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn temp_storage() -> (tempfile::TempDir, SqliteStorage) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sqlpilot.db");
        let storage = SqliteStorage::new(path.to_string_lossy().to_string());
        storage.ensure_initialized().expect("init");
        (dir, storage)
    }

    fn entry(query: &str, created_at: DateTime<Utc>) -> MemoryEntry {
        MemoryEntry {
            query: query.to_string(),
            sql: format!("SELECT '{query}'"),
            reasoning: String::new(),
            source: GenerationSource::Llm,
            created_at,
        }
    }

    #[test]
    fn recent_memory_is_newest_first_and_scoped() {
        let (_dir, storage) = temp_storage();
        let base = Utc::now() - Duration::minutes(10);
        for index in 0..4 {
            storage
                .append_memory("alice", "s1", &entry(&format!("q{index}"), base + Duration::seconds(index)))
                .unwrap();
        }
        storage
            .append_memory("bob", "s1", &entry("other", base))
            .unwrap();

        let recent = storage.load_recent_memory("alice", "s1", 3).unwrap();
        let queries: Vec<_> = recent.iter().map(|item| item.query.as_str()).collect();
        assert_eq!(queries, vec!["q3", "q2", "q1"]);

        let session = storage.load_session_memory("alice", "s1").unwrap();
        assert_eq!(session.first().map(|item| item.query.as_str()), Some("q0"));
        assert_eq!(session.len(), 4);
        assert!(storage.load_recent_memory("carol", "s1", 5).unwrap().is_empty());
    }

    #[test]
    fn memory_cleanup_and_sessions() {
        let (_dir, storage) = temp_storage();
        let old = Utc::now() - Duration::days(40);
        storage.append_memory("alice", "old", &entry("q", old)).unwrap();
        storage
            .append_memory("alice", "new", &entry("q", Utc::now()))
            .unwrap();
        let sessions = storage.list_memory_sessions("alice").unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, "new");

        let removed = storage
            .delete_memory_before(Utc::now() - Duration::days(30))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(storage.list_memory_sessions("alice").unwrap().len(), 1);
    }

    #[test]
    fn templates_upsert_in_insertion_order() {
        let (_dir, storage) = temp_storage();
        let mut first = SqlTemplate {
            id: "a".to_string(),
            name: "A".to_string(),
            description: String::new(),
            keywords: vec!["store".to_string()],
            sql: "SELECT 1".to_string(),
            is_system: true,
        };
        storage.upsert_template(&first).unwrap();
        let second = SqlTemplate {
            id: "b".to_string(),
            ..first.clone()
        };
        storage.upsert_template(&second).unwrap();
        first.sql = "SELECT 2".to_string();
        storage.upsert_template(&first).unwrap();

        let templates = storage.list_templates().unwrap();
        assert_eq!(templates.len(), 2);
        assert_eq!(templates[0].id, "a");
        assert_eq!(templates[0].sql, "SELECT 2");
        assert_eq!(templates[0].keywords, vec!["store"]);
    }

    #[test]
    fn chat_messages_are_chronological() {
        let (_dir, storage) = temp_storage();
        storage.append_chat_message("alice", "s1", "user", "hi").unwrap();
        storage
            .append_chat_message("alice", "s1", "assistant", "SELECT 1")
            .unwrap();
        let all = storage.load_chat_messages("alice", "s1", None, None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].role, "user");
        let last = storage.load_chat_messages("alice", "s1", Some(1), None).unwrap();
        assert_eq!(last[0].content, "SELECT 1");
    }

    #[test]
    fn chat_keyword_filter_is_literal_substring() {
        let (_dir, storage) = temp_storage();
        for content in ["top stores", "100% coverage", "stores_by_area", "other"] {
            storage.append_chat_message("alice", "s1", "user", content).unwrap();
        }
        let hits = storage
            .load_chat_messages("alice", "s1", None, Some("stores"))
            .unwrap();
        assert_eq!(hits.len(), 2);
        let percent = storage
            .load_chat_messages("alice", "s1", None, Some("%"))
            .unwrap();
        assert_eq!(percent.len(), 1);
        assert_eq!(percent[0].content, "100% coverage");
        let underscore = storage
            .load_chat_messages("alice", "s1", None, Some("s_b"))
            .unwrap();
        assert_eq!(underscore[0].content, "stores_by_area");
        assert_eq!(underscore.len(), 1);
        let blank = storage
            .load_chat_messages("alice", "s1", Some(2), Some("  "))
            .unwrap();
        assert_eq!(blank.len(), 2);
    }

    #[test]
    fn chat_sessions_are_latest_first() {
        let (_dir, storage) = temp_storage();
        storage.append_chat_message("alice", "older", "user", "a").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        storage.append_chat_message("alice", "newer", "user", "b").unwrap();
        storage.append_chat_message("bob", "hidden", "user", "c").unwrap();
        let sessions = storage.list_chat_sessions("alice").unwrap();
        let ids: Vec<_> = sessions.iter().map(|item| item.session_id.as_str()).collect();
        assert_eq!(ids, vec!["newer", "older"]);
    }
}
