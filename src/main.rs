// Rust 入口：加载配置、构造数据仓库与模型客户端，挂载 API 路由。
use anyhow::Context;
use clap::Parser;
use sqlpilot_server::config::{load_config, resolve_config_path, Config};
use sqlpilot_server::llm::OpenAiSqlGenerator;
use sqlpilot_server::shutdown::shutdown_signal;
use sqlpilot_server::state::AppState;
use sqlpilot_server::warehouse::PostgresWarehouse;
use std::sync::Arc;
use tracing::{info, warn};

/// SQLPilot 服务：自然语言生成 SQL 并安全执行。
#[derive(Debug, Parser)]
#[command(author, version, bin_name = "sqlpilot-server")]
struct Cli {
    /// Config file path / 配置文件路径，默认读取 SQLPILOT_CONFIG_PATH。
    #[arg(long, value_name = "PATH")]
    config: Option<String>,

    /// Print the resolved configuration and exit / 打印解析后的配置（已脱敏）并退出。
    #[arg(long = "check-config")]
    check_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config.as_deref());
    let config = load_config(&config_path);
    if cli.check_config {
        println!("{}", serde_yaml::to_string(&config.redacted())?);
        return Ok(());
    }
    init_tracing(&config);
    info!("已加载配置: {config_path}");

    // 连接池由组合根显式持有，服务层只拿到句柄。
    let warehouse =
        Arc::new(PostgresWarehouse::new(&config.warehouse).context("初始化数据仓库连接池失败")?);
    let llm = Arc::new(OpenAiSqlGenerator::new(config.llm.clone()).context("初始化 LLM 客户端失败")?);
    let state = Arc::new(AppState::new(config.clone(), warehouse, llm)?);
    let sweeper = state.spawn_progress_sweeper();
    let cleanup = state.spawn_memory_cleanup();

    let app = sqlpilot_server::build_router(state.clone());
    let addr = bind_address(&config);
    let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
    info!("SQLPilot 服务已启动: http://{addr}");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        warn!("服务退出异常: {err}");
    }
    for handle in [sweeper, cleanup].into_iter().flatten() {
        handle.abort();
    }
    Ok(())
}

fn init_tracing(config: &Config) {
    let default_level = config.observability.log_level.trim();
    let default_level = if default_level.is_empty() {
        "info".to_string()
    } else {
        default_level.to_lowercase()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn bind_address(config: &Config) -> String {
    // 保留环境变量覆盖，便于容器化部署。
    let host = std::env::var("SQLPILOT_HOST").unwrap_or_else(|_| config.server.host.clone());
    let port = std::env::var("SQLPILOT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(config.server.port);
    format!("{host}:{port}")
}
