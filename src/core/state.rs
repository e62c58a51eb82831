// 全局应用状态：组合根，集中构造各服务并注入数据仓库与模型能力。

use crate::comment_cache::ColumnCommentCache;
use crate::config::Config;
use crate::executor::SqlExecutor;
use crate::llm::SqlGenerator;
use crate::memory::MemoryAssembler;
use crate::monitor::MonitorState;
use crate::orchestrator::{Orchestrator, OrchestratorDeps};
use crate::progress::ProgressTracker;
use crate::storage::{build_storage, StorageBackend};
use crate::templates::{seed_builtin_templates, TemplateMatcher};
use crate::warehouse::Warehouse;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const MEMORY_CLEANUP_INTERVAL: Duration = Duration::from_secs(6 * 3600);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub storage: Arc<dyn StorageBackend>,
    pub monitor: Arc<MonitorState>,
    pub progress: Arc<ProgressTracker>,
    pub memory: Arc<MemoryAssembler>,
    pub templates: Arc<TemplateMatcher>,
    pub executor: Arc<SqlExecutor>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    /// 数据仓库与模型客户端由调用方显式构造后传入，测试可替换为进程内实现。
    pub fn new(
        config: Config,
        warehouse: Arc<dyn Warehouse>,
        llm: Arc<dyn SqlGenerator>,
    ) -> Result<Self> {
        let storage = build_storage(&config.storage).context("初始化存储失败")?;
        seed_builtin_templates(storage.as_ref()).context("写入内置模板失败")?;

        let monitor = Arc::new(MonitorState::new(config.observability.monitor_event_limit));
        let progress = Arc::new(ProgressTracker::new());
        let memory = Arc::new(MemoryAssembler::new(
            storage.clone(),
            config.generation.memory_window,
        ));
        let templates = Arc::new(TemplateMatcher::new(
            storage.clone(),
            config.generation.template_min_hits,
        ));
        let comments = Arc::new(ColumnCommentCache::new());
        let executor = Arc::new(SqlExecutor::new(
            warehouse.clone(),
            comments,
            &config.execution,
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            OrchestratorDeps {
                storage: storage.clone(),
                warehouse,
                llm,
                memory: memory.clone(),
                progress: progress.clone(),
                monitor: monitor.clone(),
            },
            &config.generation,
        ));
        Ok(Self {
            config: Arc::new(config),
            storage,
            monitor,
            progress,
            memory,
            templates,
            executor,
            orchestrator,
        })
    }

    /// 启动进度条目的后台清理任务。
    pub fn spawn_progress_sweeper(&self) -> Option<JoinHandle<()>> {
        let settings = &self.config.progress;
        self.progress.clone().spawn_sweeper(
            Duration::from_secs(settings.retention_s),
            Duration::from_secs(settings.sweep_interval_s),
        )
    }

    /// 定期删除超过保留期的会话记忆；保留天数为 0 时不启动。
    pub fn spawn_memory_cleanup(&self) -> Option<JoinHandle<()>> {
        let days = self.config.generation.memory_retention_days;
        if days == 0 {
            return None;
        }
        let retention = Duration::from_secs(days * 24 * 3600);
        let memory = self.memory.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MEMORY_CLEANUP_INTERVAL);
            loop {
                ticker.tick().await;
                match memory.cleanup(retention).await {
                    Ok(0) => {}
                    Ok(removed) => info!("清理过期会话记忆: {removed}"),
                    Err(err) => warn!("清理会话记忆失败: {err}"),
                }
            }
        }))
    }
}
