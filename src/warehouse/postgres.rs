use super::{ColumnInfo, QueryRows, TableSchema, Warehouse, WarehouseError};
use crate::config::WarehouseConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, PoolError, RecyclingMethod, Runtime};
use std::collections::HashMap;
use std::time::Duration;
use tokio_postgres::{NoTls, SimpleQueryMessage};
use tracing::{debug, warn};

const LIST_TABLES_SQL: &str = "SELECT table_name::text FROM information_schema.tables \
     WHERE table_schema = $1 AND table_type IN ('BASE TABLE', 'VIEW') ORDER BY table_name";

const TABLE_LOOKUP_SQL: &str = "SELECT t.table_name::text, \
     COALESCE(obj_description(to_regclass(format('%I.%I', t.table_schema, t.table_name))::oid, 'pg_class'), '') \
     FROM information_schema.tables t \
     WHERE t.table_schema = $1 AND lower(t.table_name::text) = lower($2) LIMIT 1";

const TABLE_COLUMNS_SQL: &str = "SELECT c.column_name::text, c.data_type::text, \
     COALESCE(col_description(to_regclass(format('%I.%I', c.table_schema, c.table_name))::oid, c.ordinal_position::int), '') \
     FROM information_schema.columns c \
     WHERE c.table_schema = $1 AND c.table_name::text = $2 ORDER BY c.ordinal_position";

const COLUMN_COMMENTS_SQL: &str = "SELECT upper(c.column_name::text), \
     MAX(COALESCE(col_description(to_regclass(format('%I.%I', c.table_schema, c.table_name))::oid, c.ordinal_position::int), '')) \
     FROM information_schema.columns c \
     WHERE c.table_schema = $1 AND upper(c.column_name::text) = ANY($2) GROUP BY 1";

/// 基于 deadpool 连接池的 PostgreSQL 数据仓库，由启动流程显式构建并向下传递。
pub struct PostgresWarehouse {
    pool: Pool,
    schema: String,
}

impl PostgresWarehouse {
    pub fn new(config: &WarehouseConfig) -> Result<Self> {
        let cleaned = config.dsn.trim();
        if cleaned.is_empty() {
            return Err(anyhow!("warehouse dsn is empty"));
        }
        let timeout = Duration::from_secs(config.connect_timeout_s.max(1));
        let mut pg_config = cleaned.parse::<tokio_postgres::Config>()?;
        pg_config.connect_timeout(timeout);
        if config.read_only {
            // 会话级只读：即便校验器被绕过，写语句也会被数据库拒绝。
            pg_config.options("-c default_transaction_read_only=on");
        }
        let manager = Manager::from_config(pg_config, NoTls, manager_config());
        let pool = Pool::builder(manager)
            .max_size(config.pool_size.max(1))
            .runtime(Runtime::Tokio1)
            .wait_timeout(Some(timeout))
            .create_timeout(Some(timeout))
            .build()?;
        Ok(Self {
            pool,
            schema: config.schema_name(),
        })
    }

    async fn client(&self) -> Result<deadpool_postgres::Client, WarehouseError> {
        self.pool.get().await.map_err(map_pool_error)
    }
}

/// 归还连接时执行 `DISCARD ALL`，会话参数不会被下一个借用者继承。
fn manager_config() -> ManagerConfig {
    ManagerConfig {
        recycling_method: RecyclingMethod::Clean,
    }
}

fn map_pool_error(err: PoolError) -> WarehouseError {
    WarehouseError::Connection(err.to_string())
}

fn map_pg_error(err: tokio_postgres::Error) -> WarehouseError {
    match err.as_db_error() {
        Some(db_error) => WarehouseError::Statement(db_error.message().to_string()),
        None if err.is_closed() => WarehouseError::Connection(err.to_string()),
        None => WarehouseError::Statement(err.to_string()),
    }
}

fn collect_rows(messages: Vec<SimpleQueryMessage>) -> QueryRows {
    let mut output = QueryRows::default();
    for message in messages {
        match message {
            SimpleQueryMessage::RowDescription(columns) => {
                if output.columns.is_empty() {
                    output.columns = columns
                        .iter()
                        .map(|column| column.name().to_string())
                        .collect();
                }
            }
            SimpleQueryMessage::Row(row) => {
                if output.columns.is_empty() {
                    output.columns = row
                        .columns()
                        .iter()
                        .map(|column| column.name().to_string())
                        .collect();
                }
                let cells = (0..row.len())
                    .map(|index| row.get(index).map(str::to_string))
                    .collect();
                output.rows.push(cells);
            }
            _ => {}
        }
    }
    output
}

#[async_trait]
impl Warehouse for PostgresWarehouse {
    async fn list_tables(&self) -> Result<Vec<String>, WarehouseError> {
        let client = self.client().await?;
        let rows = client
            .query(LIST_TABLES_SQL, &[&self.schema])
            .await
            .map_err(map_pg_error)?;
        Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
    }

    async fn table_schema(&self, table: &str) -> Result<TableSchema, WarehouseError> {
        let client = self.client().await?;
        let table_param = table.trim().to_string();
        let found = client
            .query_opt(TABLE_LOOKUP_SQL, &[&self.schema, &table_param])
            .await
            .map_err(map_pg_error)?;
        let Some(found) = found else {
            return Err(WarehouseError::Statement(format!("table {table} not found")));
        };
        let name: String = found.get(0);
        let comment: String = found.get(1);
        let rows = client
            .query(TABLE_COLUMNS_SQL, &[&self.schema, &name])
            .await
            .map_err(map_pg_error)?;
        let columns = rows
            .iter()
            .map(|row| ColumnInfo {
                name: row.get(0),
                data_type: row.get(1),
                comment: row.get(2),
            })
            .collect();
        Ok(TableSchema {
            name,
            comment,
            columns,
        })
    }

    /// 每条语句独占一个只读事务并始终回滚，语句内对会话参数的修改随之撤销。
    async fn query(&self, sql: &str, timeout: Duration) -> Result<QueryRows, WarehouseError> {
        let mut client = self.client().await?;
        let cancel_token = client.cancel_token();
        let run = async {
            let transaction = client.build_transaction().read_only(true).start().await?;
            let outcome = transaction.simple_query(sql).await;
            let rollback = transaction.rollback().await;
            let messages = outcome?;
            rollback?;
            Ok::<_, tokio_postgres::Error>(messages)
        };
        match tokio::time::timeout(timeout, run).await {
            Ok(result) => result.map(collect_rows).map_err(map_pg_error),
            Err(_) => {
                debug!("查询超时，取消执行中的语句");
                if let Err(err) = cancel_token.cancel_query(NoTls).await {
                    warn!("取消超时语句失败: {err}");
                }
                Err(WarehouseError::Timeout(timeout))
            }
        }
    }

    async fn column_comments(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, String>, WarehouseError> {
        if names.is_empty() {
            return Ok(HashMap::new());
        }
        let client = self.client().await?;
        let keys: Vec<String> = names.iter().map(|name| name.to_uppercase()).collect();
        let rows = client
            .query(COLUMN_COMMENTS_SQL, &[&self.schema, &keys])
            .await
            .map_err(map_pg_error)?;
        Ok(rows
            .iter()
            .map(|row| (row.get::<_, String>(0), row.get::<_, String>(1)))
            .collect())
    }
}
