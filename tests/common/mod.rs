#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use parking_lot::Mutex;
use regex::Regex;
use sqlpilot_server::config::Config;
use sqlpilot_server::llm::{
    ChunkSink, LlmError, SqlDebugAdvice, SqlDraft, SqlGenerator, SqlPrompt,
};
use sqlpilot_server::state::AppState;
use sqlpilot_server::warehouse::{
    ColumnInfo, DatabaseInfo, QueryRows, TableSchema, Warehouse, WarehouseError,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const API_KEY: &str = "integration-api-key";
pub const LLM_SQL: &str = "SELECT store_code, phone FROM stores ORDER BY store_code";

/// 按内层 SQL 中的表名返回固定数据，并按窗口子查询里的 LIMIT/偏移切片。
pub struct FakeWarehouse {
    pub stores: usize,
    pub executed: Mutex<Vec<String>>,
}

impl FakeWarehouse {
    pub fn new(stores: usize) -> Self {
        Self {
            stores,
            executed: Mutex::new(Vec::new()),
        }
    }

    fn store_rows(&self) -> Vec<Vec<Option<String>>> {
        (1..=self.stores)
            .map(|index| {
                vec![
                    Some(format!("S{index:03}")),
                    Some(format!("1380000{index:04}")),
                    if index % 2 == 0 {
                        None
                    } else {
                        Some("north".to_string())
                    },
                ]
            })
            .collect()
    }
}

fn window_bounds(sql: &str) -> (usize, usize) {
    let pattern = Regex::new(r"LIMIT (\d+)\) numbered WHERE sqlpilot_rnum > (\d+)")
        .expect("invalid window regex");
    let captures = pattern.captures(sql).expect("windowed sql");
    let total = captures[1].parse().expect("limit");
    let offset = captures[2].parse().expect("offset");
    (offset, total)
}

#[async_trait]
impl Warehouse for FakeWarehouse {
    async fn list_tables(&self) -> Result<Vec<String>, WarehouseError> {
        Ok(vec!["stores".to_string(), "orders".to_string()])
    }

    async fn table_schema(&self, table: &str) -> Result<TableSchema, WarehouseError> {
        if table == "orders" {
            return Err(WarehouseError::Statement("permission denied".to_string()));
        }
        Ok(TableSchema {
            name: table.to_string(),
            comment: "门店".to_string(),
            columns: vec![
                ColumnInfo {
                    name: "store_code".to_string(),
                    data_type: "text".to_string(),
                    comment: "门店编码".to_string(),
                },
                ColumnInfo {
                    name: "phone".to_string(),
                    data_type: "text".to_string(),
                    comment: "联系电话".to_string(),
                },
            ],
        })
    }

    async fn query(&self, sql: &str, _timeout: Duration) -> Result<QueryRows, WarehouseError> {
        self.executed.lock().push(sql.to_string());
        if sql.contains("FROM offline") {
            return Err(WarehouseError::Connection("connection refused".to_string()));
        }
        if sql.contains("FROM missing") {
            return Err(WarehouseError::Statement(
                "relation \"missing\" does not exist".to_string(),
            ));
        }
        let mut data = if sql.contains("FROM stores") {
            self.store_rows()
        } else {
            Vec::new()
        };
        let (offset, total) = window_bounds(sql);
        data.truncate(total);
        let rows = data
            .into_iter()
            .enumerate()
            .skip(offset)
            .map(|(index, mut row)| {
                row.push(Some((index + 1).to_string()));
                row
            })
            .collect();
        Ok(QueryRows {
            columns: vec![
                "store_code".to_string(),
                "phone".to_string(),
                "area".to_string(),
                "sqlpilot_rnum".to_string(),
            ],
            rows,
        })
    }

    async fn column_comments(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, String>, WarehouseError> {
        let known = [("STORE_CODE", "门店编码"), ("PHONE", "联系电话")];
        Ok(known
            .iter()
            .filter(|(name, _)| names.iter().any(|item| item == name))
            .map(|(name, comment)| (name.to_string(), comment.to_string()))
            .collect())
    }

    async fn database_info(&self, _timeout: Duration) -> Result<DatabaseInfo, WarehouseError> {
        Ok(DatabaseInfo {
            database_version: "PostgreSQL 16.2".to_string(),
            current_user: "reporter".to_string(),
        })
    }
}

/// 按提问内容选择脚本化回复。
#[derive(Default)]
pub struct FakeGenerator {
    pub prompts: Mutex<Vec<String>>,
}

impl FakeGenerator {
    fn reply(&self, prompt: &SqlPrompt) -> Result<SqlDraft, LlmError> {
        self.prompts.lock().push(prompt.user_message());
        let query = prompt.query.to_lowercase();
        if query.contains("refund") {
            return Ok(SqlDraft {
                sql: "ERROR: table not found".to_string(),
                reasoning: String::new(),
            });
        }
        if query.contains("unreachable") {
            return Err(LlmError::Transport("connection refused".to_string()));
        }
        if query.contains("garbled") {
            return Err(LlmError::Upstream("invalid response".to_string()));
        }
        Ok(SqlDraft {
            sql: LLM_SQL.to_string(),
            reasoning: "stores table holds the codes".to_string(),
        })
    }
}

#[async_trait]
impl SqlGenerator for FakeGenerator {
    async fn generate_sql(&self, prompt: &SqlPrompt) -> Result<SqlDraft, LlmError> {
        self.reply(prompt)
    }

    async fn generate_sql_stream(
        &self,
        prompt: &SqlPrompt,
        sink: &dyn ChunkSink,
    ) -> Result<SqlDraft, LlmError> {
        let draft = self.reply(prompt)?;
        let (head, tail) = draft.sql.split_at(draft.sql.len() / 2);
        sink.on_chunk(head).await;
        sink.on_chunk(tail).await;
        Ok(draft)
    }

    async fn generate_guidance(
        &self,
        query: &str,
        _schema_context: &str,
        _issue: &str,
    ) -> Result<String, LlmError> {
        if query.to_lowercase().contains("garbled") {
            return Err(LlmError::Upstream("still invalid".to_string()));
        }
        Ok("No refunds table exists; try asking about orders instead.".to_string())
    }

    async fn debug_sql(
        &self,
        sql: &str,
        error: &str,
        schema_context: &str,
    ) -> Result<SqlDebugAdvice, LlmError> {
        self.prompts
            .lock()
            .push(format!("{schema_context}\n{sql}\n{error}"));
        if sql.contains("unreachable") {
            return Err(LlmError::Transport("connection refused".to_string()));
        }
        Ok(SqlDebugAdvice {
            analysis_text: format!("{error}: the column is called store_code"),
            suggested_sql: "SELECT store_code FROM stores".to_string(),
            explanation: "use the documented column".to_string(),
        })
    }
}

pub struct TestApp {
    pub state: Arc<AppState>,
    pub router: Router,
    pub warehouse: Arc<FakeWarehouse>,
    pub llm: Arc<FakeGenerator>,
    _dir: tempfile::TempDir,
}

pub fn test_config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.storage.db_path = dir
        .path()
        .join("sqlpilot.db")
        .to_string_lossy()
        .to_string();
    config.execution.sensitive_columns = vec!["phone".to_string()];
    config.execution.default_page_size = 3;
    config.execution.max_page_size = 5;
    config.generation.timeout_s = 10;
    config.generation.schema.table_timeout_ms = 500;
    config
}

pub fn build_app(configure: impl FnOnce(&mut Config)) -> TestApp {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(&dir);
    configure(&mut config);
    let warehouse = Arc::new(FakeWarehouse::new(7));
    let llm = Arc::new(FakeGenerator::default());
    let state = Arc::new(
        AppState::new(config, warehouse.clone(), llm.clone()).expect("build app state"),
    );
    let router = sqlpilot_server::build_router(state.clone());
    TestApp {
        state,
        router,
        warehouse,
        llm,
        _dir: dir,
    }
}
