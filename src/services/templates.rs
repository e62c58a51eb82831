// SQL 模板：内置模板播种与关键词匹配。
use crate::schemas::SqlTemplate;
use crate::storage::{run_blocking, StorageBackend};
use anyhow::Result;
use std::sync::Arc;
use tracing::warn;

pub const DEFAULT_MIN_HITS: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct TemplateMatch {
    pub template: SqlTemplate,
    pub score: usize,
}

pub struct TemplateMatcher {
    storage: Arc<dyn StorageBackend>,
    min_hits: usize,
}

impl TemplateMatcher {
    pub fn new(storage: Arc<dyn StorageBackend>, min_hits: usize) -> Self {
        Self {
            storage,
            min_hits: min_hits.max(1),
        }
    }

    pub async fn list(&self) -> Result<Vec<SqlTemplate>> {
        run_blocking(&self.storage, |storage| storage.list_templates()).await
    }

    /// 模板读取失败时视为未命中，继续走模型生成。
    pub async fn find_match(&self, query: &str) -> Option<TemplateMatch> {
        let templates = match self.list().await {
            Ok(templates) => templates,
            Err(err) => {
                warn!("读取 SQL 模板失败: {err}");
                return None;
            }
        };
        best_match(query, &templates, self.min_hits)
    }
}

/// 得分严格更高才替换，同分保留先出现的模板。
pub fn best_match(query: &str, templates: &[SqlTemplate], min_hits: usize) -> Option<TemplateMatch> {
    let normalized = query.to_lowercase();
    let mut best: Option<TemplateMatch> = None;
    for template in templates {
        let score = match_score(&normalized, &template.keywords);
        let current = best.as_ref().map(|item| item.score).unwrap_or(0);
        if score > current {
            best = Some(TemplateMatch {
                template: template.clone(),
                score,
            });
        }
    }
    best.filter(|item| item.score >= min_hits)
}

fn match_score(normalized_query: &str, keywords: &[String]) -> usize {
    keywords
        .iter()
        .map(|keyword| keyword.trim().to_lowercase())
        .filter(|keyword| !keyword.is_empty() && normalized_query.contains(keyword.as_str()))
        .count()
}

pub fn builtin_templates() -> Vec<SqlTemplate> {
    vec![SqlTemplate {
        id: "store_recent_activity".to_string(),
        name: "门店近30天新建记录".to_string(),
        description: "列出最近 30 天内新增的门店及其基础信息".to_string(),
        keywords: ["门店", "最近30天", "报表", "store", "新增"]
            .iter()
            .map(|item| item.to_string())
            .collect(),
        sql: "SELECT store_code,\n       store_full_name,\n       area,\n       status,\n       created_at\nFROM stores\nWHERE created_at >= NOW() - INTERVAL '30 days'\nORDER BY created_at DESC\nLIMIT 50".to_string(),
        is_system: true,
    }]
}

/// 启动时写入内置模板，已存在则覆盖为最新版本。
pub fn seed_builtin_templates(storage: &dyn StorageBackend) -> Result<()> {
    for template in builtin_templates() {
        storage.upsert_template(&template)?;
    }
    Ok(())
}
