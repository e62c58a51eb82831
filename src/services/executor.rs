// 分页执行引擎：校验 → 窗口化子查询 → 去除行号列 → 列注释装饰 → 敏感列脱敏。
use crate::comment_cache::ColumnCommentCache;
use crate::config::ExecutionConfig;
use crate::schemas::{ExecuteSqlRequest, ExecutionResult};
use crate::validator;
use crate::warehouse::{DatabaseInfo, QueryRows, Warehouse, WarehouseError};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

pub const ROW_NUMBER_COLUMN: &str = "sqlpilot_rnum";
const MAX_TIMEOUT_S: i64 = 300;
pub const MAX_EXPORT_ROWS: usize = 5000;

pub struct SqlExecutor {
    warehouse: Arc<dyn Warehouse>,
    comments: Arc<ColumnCommentCache>,
    default_page_size: usize,
    max_page_size: usize,
    default_timeout: Duration,
    sensitive_columns: HashSet<String>,
    mask_token: String,
}

impl SqlExecutor {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        comments: Arc<ColumnCommentCache>,
        config: &ExecutionConfig,
    ) -> Self {
        let default_page_size = if config.default_page_size == 0 {
            50
        } else {
            config.default_page_size
        };
        let max_page_size = if config.max_page_size == 0 {
            200
        } else {
            config.max_page_size
        }
        .max(default_page_size);
        let default_timeout_s = if config.default_timeout_s == 0 {
            30
        } else {
            config.default_timeout_s
        };
        let sensitive_columns = config
            .sensitive_columns
            .iter()
            .map(|name| name.trim().to_uppercase())
            .filter(|name| !name.is_empty())
            .collect();
        let mask_token = if config.mask_token.is_empty() {
            "***".to_string()
        } else {
            config.mask_token.clone()
        };
        Self {
            warehouse,
            comments,
            default_page_size,
            max_page_size,
            default_timeout: Duration::from_secs(default_timeout_s),
            sensitive_columns,
            mask_token,
        }
    }

    pub fn max_page_size(&self) -> usize {
        self.max_page_size
    }

    /// 校验失败与语句级错误都写入结果；只有连接级故障以 `Err` 返回。
    pub async fn execute(
        &self,
        request: &ExecuteSqlRequest,
    ) -> Result<ExecutionResult, WarehouseError> {
        let (page, page_size) = self.resolve_page(request.page, request.page_size);
        let timeout = self.resolve_timeout(request.timeout_seconds);
        self.run(&request.sql, page, page_size, timeout).await
    }

    /// 导出取前 `limit` 行（限制在 1..=5000），不受分页上限约束；脱敏规则与分页执行一致。
    pub async fn export(&self, sql: &str, limit: usize) -> Result<ExecutionResult, WarehouseError> {
        let limit = limit.clamp(1, MAX_EXPORT_ROWS);
        self.run(sql, 1, limit, self.default_timeout).await
    }

    pub async fn database_info(&self) -> Result<DatabaseInfo, WarehouseError> {
        self.warehouse.database_info(self.default_timeout).await
    }

    async fn run(
        &self,
        sql: &str,
        page: usize,
        page_size: usize,
        timeout: Duration,
    ) -> Result<ExecutionResult, WarehouseError> {
        if let Err(err) = validator::validate(sql) {
            debug!("SQL 校验未通过: {err}");
            let mut result = ExecutionResult::rejected(err.reason());
            result.page = page;
            result.page_size = page_size;
            return Ok(result);
        }
        let Some((offset, total)) = page_window(page, page_size) else {
            let mut result = ExecutionResult::rejected("page out of range");
            result.page = page;
            result.page_size = page_size;
            return Ok(result);
        };
        let started = Instant::now();
        let windowed = window_sql(sql, offset, total);
        let outcome = self.warehouse.query(&windowed, timeout).await;
        let exec_time_ms = started.elapsed().as_millis() as u64;

        let rows = match outcome {
            Ok(rows) => rows,
            Err(err) if err.is_connectivity() => {
                error!("数据仓库连接失败: {err}");
                return Err(err);
            }
            Err(err) => {
                error!("SQL 执行失败: {err}, sql: {}", sql.trim());
                return Ok(ExecutionResult {
                    success: false,
                    page,
                    page_size,
                    exec_time_ms,
                    error: Some(err.to_string()),
                    ..Default::default()
                });
            }
        };

        let QueryRows { columns, mut rows } = strip_row_number(rows);
        let has_more = rows.len() > page_size;
        rows.truncate(page_size);
        let budget = timeout.saturating_sub(started.elapsed());
        let columns = self
            .comments
            .decorate(self.warehouse.as_ref(), &columns, budget)
            .await;
        let mut result = ExecutionResult {
            success: true,
            row_count: rows.len(),
            rows: rows
                .into_iter()
                .map(|row| {
                    row.into_iter()
                        .map(|cell| cell.map(Value::String).unwrap_or(Value::Null))
                        .collect()
                })
                .collect(),
            columns,
            exec_time_ms,
            page,
            page_size,
            has_more,
            masked_columns: Vec::new(),
            error: None,
        };
        self.apply_masking(&mut result);
        Ok(result)
    }

    fn resolve_page(&self, page: Option<i64>, page_size: Option<i64>) -> (usize, usize) {
        let page = page.filter(|value| *value > 0).unwrap_or(1) as usize;
        let page_size = page_size
            .filter(|value| *value > 0)
            .map(|value| value as usize)
            .unwrap_or(self.default_page_size)
            .min(self.max_page_size);
        (page, page_size)
    }

    fn resolve_timeout(&self, timeout_seconds: Option<i64>) -> Duration {
        match timeout_seconds {
            Some(value) if (1..=MAX_TIMEOUT_S).contains(&value) => {
                Duration::from_secs(value as u64)
            }
            _ => self.default_timeout,
        }
    }

    fn apply_masking(&self, result: &mut ExecutionResult) {
        if !result.success || self.sensitive_columns.is_empty() {
            return;
        }
        let mut indexes = Vec::new();
        for (index, column) in result.columns.iter().enumerate() {
            if masking_keys(column)
                .iter()
                .any(|key| self.sensitive_columns.contains(key))
            {
                indexes.push(index);
                result.masked_columns.push(column.clone());
            }
        }
        if indexes.is_empty() {
            return;
        }
        for row in result.rows.iter_mut() {
            for index in &indexes {
                if let Some(cell) = row.get_mut(*index) {
                    if !cell.is_null() {
                        *cell = Value::String(self.mask_token.clone());
                    }
                }
            }
        }
    }
}

/// 计算窗口的起始偏移与取数上限（多取一行用于判断 `has_more`），
/// 结果必须能放进数据库的 BIGINT。
pub fn page_window(page: usize, page_size: usize) -> Option<(usize, usize)> {
    let offset = page.checked_sub(1)?.checked_mul(page_size)?;
    let total = offset.checked_add(page_size)?.checked_add(1)?;
    if i64::try_from(total).is_err() {
        return None;
    }
    Some((offset, total))
}

/// 用行号子查询包住原语句，只保留 `offset` 之后、`total` 以内的行。
pub fn window_sql(sql: &str, offset: usize, total: usize) -> String {
    let inner = sql.trim().trim_end_matches(|ch: char| ch == ';' || ch.is_whitespace());
    format!(
        "SELECT * FROM (SELECT inner_query.*, ROW_NUMBER() OVER () AS {ROW_NUMBER_COLUMN} \
         FROM (\n{inner}\n) inner_query LIMIT {total}) numbered WHERE {ROW_NUMBER_COLUMN} > {offset}"
    )
}

fn strip_row_number(mut rows: QueryRows) -> QueryRows {
    let position = rows
        .columns
        .iter()
        .position(|column| column.eq_ignore_ascii_case(ROW_NUMBER_COLUMN));
    if let Some(index) = position {
        rows.columns.remove(index);
        for row in rows.rows.iter_mut() {
            if index < row.len() {
                row.remove(index);
            }
        }
    }
    rows
}

/// 装饰后的列名 `注释(原名)` 同时按整体和括号内原名匹配。
fn masking_keys(column: &str) -> Vec<String> {
    let column = column.trim();
    let upper = column.to_uppercase();
    if !column.ends_with(')') {
        return vec![upper];
    }
    let Some(open) = column.rfind('(') else {
        return vec![upper];
    };
    let original = column[open + 1..column.len() - 1].trim();
    if original.is_empty() {
        return vec![upper];
    }
    vec![upper, original.to_uppercase()]
}
