// 数据仓库访问抽象：元数据查询、只读语句执行与列注释批量查询。
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

mod postgres;

pub use postgres::PostgresWarehouse;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub comment: String,
    pub columns: Vec<ColumnInfo>,
}

/// 语句结果：列名与文本化的单元格，`None` 表示 NULL。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarehouseError {
    /// 连接池耗尽、网络断开等连接级故障。
    Connection(String),
    /// 语句本身出错（列不存在、权限不足等）。
    Statement(String),
    Timeout(Duration),
}

/// 数据库版本与当前连接用户。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatabaseInfo {
    pub database_version: String,
    pub current_user: String,
}

const DATABASE_INFO_SQL: &str = "SELECT version() AS database_version, current_user AS current_user";

impl WarehouseError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, WarehouseError::Connection(_))
    }
}

impl fmt::Display for WarehouseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WarehouseError::Connection(message) => write!(f, "warehouse unavailable: {message}"),
            WarehouseError::Statement(message) => f.write_str(message),
            WarehouseError::Timeout(limit) => {
                write!(f, "query timed out after {}s", limit.as_secs_f64())
            }
        }
    }
}

impl std::error::Error for WarehouseError {}

#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn list_tables(&self) -> Result<Vec<String>, WarehouseError>;

    async fn table_schema(&self, table: &str) -> Result<TableSchema, WarehouseError>;

    /// 执行只读语句；超时后必须取消仍在运行的语句。
    async fn query(&self, sql: &str, timeout: Duration) -> Result<QueryRows, WarehouseError>;

    /// 按列名（大写）批量查询注释，调用方负责控制单批数量。
    async fn column_comments(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, String>, WarehouseError>;

    async fn database_info(&self, timeout: Duration) -> Result<DatabaseInfo, WarehouseError> {
        let rows = self.query(DATABASE_INFO_SQL, timeout).await?;
        let mut cells = rows
            .rows
            .into_iter()
            .next()
            .unwrap_or_default()
            .into_iter()
            .map(Option::unwrap_or_default);
        Ok(DatabaseInfo {
            database_version: cells.next().unwrap_or_default(),
            current_user: cells.next().unwrap_or_default(),
        })
    }
}
