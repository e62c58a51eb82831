// 表结构上下文：在预算内抓取表/列元数据，拼成给模型看的文本。
use crate::config::SchemaContextConfig;
use crate::warehouse::{TableSchema, Warehouse};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const SCHEMA_UNAVAILABLE: &str = "Database schema metadata is unavailable.";

pub struct SchemaContextBuilder {
    warehouse: Arc<dyn Warehouse>,
    max_tables: usize,
    max_attempts: usize,
    table_timeout: Duration,
}

impl SchemaContextBuilder {
    pub fn new(warehouse: Arc<dyn Warehouse>, config: &SchemaContextConfig) -> Self {
        Self {
            warehouse,
            max_tables: config.max_tables.max(1),
            max_attempts: config.max_attempts.max(1),
            table_timeout: Duration::from_millis(config.table_timeout_ms.max(1)),
        }
    }

    /// 元数据取不到时降级为提示文本，从不返回错误；到达 `deadline` 立即返回已拼好的部分。
    pub async fn build_context(&self, table_filter: &[String], deadline: Instant) -> String {
        let started = std::time::Instant::now();
        let mut targets: Vec<String> = table_filter
            .iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();
        if targets.is_empty() {
            match tokio::time::timeout_at(deadline, self.warehouse.list_tables()).await {
                Ok(Ok(tables)) => targets = tables,
                Ok(Err(err)) => {
                    warn!("列出数据表失败: {err}");
                    return SCHEMA_UNAVAILABLE.to_string();
                }
                Err(_) => {
                    warn!("列出数据表超时");
                    return SCHEMA_UNAVAILABLE.to_string();
                }
            }
        }
        if targets.is_empty() {
            warn!("数据表列表为空");
            return SCHEMA_UNAVAILABLE.to_string();
        }

        let mut output = String::from("Available tables in the database:\n");
        let mut successes = 0usize;
        let mut attempts = 0usize;
        let mut restricted: Vec<String> = Vec::new();

        for table in &targets {
            if Instant::now() >= deadline {
                warn!("表结构上下文构建到达截止时间");
                break;
            }
            if attempts >= self.max_attempts && successes > 0 {
                warn!("表结构抓取次数达到上限: attempts={attempts}, included={successes}");
                break;
            }
            if successes >= self.max_tables {
                output.push_str("\n... and more\n");
                break;
            }

            // 单表超时与整体截止时间取较早者。
            let table_deadline = (Instant::now() + self.table_timeout).min(deadline);
            let fetched =
                tokio::time::timeout_at(table_deadline, self.warehouse.table_schema(table)).await;
            attempts += 1;
            match fetched {
                Ok(Ok(schema)) => {
                    render_table(&mut output, &schema);
                    successes += 1;
                    debug!("已收集表结构: {}, 列数 {}", schema.name, schema.columns.len());
                }
                Ok(Err(err)) => {
                    warn!("表结构不可用: {table}, {err}");
                    restricted.push(table.clone());
                }
                Err(_) => {
                    warn!("表结构抓取超时: {table}");
                    restricted.push(table.clone());
                }
            }
        }

        if successes == 0 && !restricted.is_empty() {
            output.push_str(
                "\nMetadata for specific tables is restricted. Known table names include:\n",
            );
            for table in restricted.iter().take(self.max_tables) {
                output.push_str(&format!("  - {table}\n"));
            }
        }

        info!(
            "表结构上下文构建完成: requested={}, included={successes}, attempted={attempts}, elapsed_ms={}",
            targets.len(),
            started.elapsed().as_millis()
        );
        output
    }
}

fn render_table(output: &mut String, schema: &TableSchema) {
    output.push_str(&format!("\nTable: {}\n", schema.name));
    if !schema.comment.trim().is_empty() {
        output.push_str(&format!("Comment: {}\n", schema.comment.trim()));
    }
    output.push_str("Columns:\n");
    for column in &schema.columns {
        output.push_str(&format!("  - {} ({})", column.name, column.data_type));
        if !column.comment.trim().is_empty() {
            output.push_str(&format!(" - {}", column.comment.trim()));
        }
        output.push('\n');
    }
}
