// 列注释缓存：进程级共享，读多写少。
use crate::warehouse::Warehouse;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::warn;

/// 单次元数据查询的列名上限，对齐常见引擎 IN 列表的限制。
pub const COMMENT_LOOKUP_CHUNK: usize = 900;

/// 键为大写列名，值为注释；查不到注释的列缓存为空串，避免重复查询。
///
/// 读路径只持有读锁；未命中时先在锁外查询数据库，再一次性持写锁回填，
/// 锁从不跨越 `.await`。
#[derive(Default)]
pub struct ColumnCommentCache {
    entries: RwLock<HashMap<String, String>>,
}

impl ColumnCommentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn get(&self, column: &str) -> Option<String> {
        self.entries.read().get(&column.to_uppercase()).cloned()
    }

    /// 返回 `注释(原列名)` 形式的列名，无注释时保持原样。
    ///
    /// 未命中的查询必须在 `budget` 内完成；超时的批次不写缓存，对应列保持原名。
    pub async fn decorate(
        &self,
        warehouse: &dyn Warehouse,
        columns: &[String],
        budget: Duration,
    ) -> Vec<String> {
        let missing = self.missing_keys(columns);
        if !missing.is_empty()
            && tokio::time::timeout(budget, self.resolve(warehouse, missing))
                .await
                .is_err()
        {
            warn!("列注释查询超时（{}ms），跳过装饰", budget.as_millis());
        }
        let entries = self.entries.read();
        columns
            .iter()
            .map(|column| {
                let comment = entries
                    .get(&column.to_uppercase())
                    .map(String::as_str)
                    .unwrap_or_default();
                decorate_name(column, comment)
            })
            .collect()
    }

    fn missing_keys(&self, columns: &[String]) -> Vec<String> {
        let entries = self.entries.read();
        let mut seen = HashSet::new();
        columns
            .iter()
            .map(|column| column.to_uppercase())
            .filter(|key| !entries.contains_key(key) && seen.insert(key.clone()))
            .collect()
    }

    async fn resolve(&self, warehouse: &dyn Warehouse, missing: Vec<String>) {
        for chunk in missing.chunks(COMMENT_LOOKUP_CHUNK) {
            match warehouse.column_comments(chunk).await {
                Ok(found) => {
                    let mut entries = self.entries.write();
                    for key in chunk {
                        let comment = found
                            .get(key)
                            .map(|value| value.trim().to_string())
                            .unwrap_or_default();
                        entries.insert(key.clone(), comment);
                    }
                }
                Err(err) => {
                    // 查询失败不写缓存，下次请求重试。
                    warn!("列注释查询失败: {err}");
                }
            }
        }
    }
}

pub fn decorate_name(column: &str, comment: &str) -> String {
    let comment = comment.trim();
    if comment.is_empty() {
        column.to_string()
    } else {
        format!("{comment}({column})")
    }
}
