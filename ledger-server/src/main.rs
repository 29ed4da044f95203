use ledger_server::{Config, ServerState, setup_environment};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. 设置环境 (dotenv, 工作目录, 日志)
    setup_environment()?;

    tracing::info!("Ledger server starting...");

    // 2. 加载配置
    let config = Config::from_env();

    // 3. 初始化服务状态
    let state = ServerState::initialize(&config).await?;

    // 4. 启动后台任务
    let tasks = state.start_background_tasks()?;
    tasks.log_summary();

    // 5. 等待关闭信号
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    tasks.shutdown(config.shutdown_timeout()).await;
    state.db.close().await;

    let stats = state.counters.snapshot();
    tracing::info!(
        entries_created = stats.entries_created_total,
        published = stats.outbox_published_total,
        applied = stats.app_entries_processed_total,
        dead_lettered = stats.messages_dead_lettered_total,
        "Ledger server stopped"
    );
    Ok(())
}
