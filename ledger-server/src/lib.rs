//! Ledger Server - 账本事件可靠性管道
//!
//! # 架构概述
//!
//! - **账本** (`ledger`): 条目与 outbox 记录在同一事务中写入
//! - **Outbox** (`outbox`): 定时排空、发布确认、退避重试与毒化
//! - **消息** (`message`): broker 抽象、进程内 broker、投递重试与死信
//! - **投影** (`projection`): 幂等应用、按日余额查询、区间重建
//! - **数据库** (`db`): SQLite (sqlx) 连接池与仓储
//!
//! # 模块结构
//!
//! ```text
//! ledger-server/src/
//! ├── core/          # 配置、状态、后台任务
//! ├── db/            # 数据库层
//! ├── ledger/        # 条目记录
//! ├── message/       # broker 与投递
//! ├── observer.rs    # 指标观察者
//! ├── outbox/        # 发布与排空
//! ├── projection/    # 余额投影
//! └── utils/         # 日志
//! ```

pub mod core;
pub mod db;
pub mod ledger;
pub mod message;
pub mod observer;
pub mod outbox;
pub mod projection;
pub mod utils;

// Re-export 公共类型
pub use core::{BackgroundTasks, Config, ServerState, TaskKind};
pub use ledger::EntryRecorder;
pub use message::{BrokerChannel, BrokerSignal, MessageBroker};
pub use observer::{PipelineCounters, PipelineObserver, PipelineStats};
pub use outbox::{DrainReport, EventPublisher, OutboxDrainScheduler, OutboxPublisher};
pub use projection::{BalanceQueryService, LedgerEventConsumer, RebuildJobs, RebuildService};
pub use shared::error::{AppError, AppResult, ErrorCode};

// Re-export logger functions
pub use utils::logger::init_logger_with_file;

/// 设置运行环境: 加载 .env、初始化日志
pub fn setup_environment() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config = Config::from_env();
    std::fs::create_dir_all(&config.work_dir)?;

    let log_dir = config.log_dir();
    std::fs::create_dir_all(&log_dir)?;
    init_logger_with_file(
        Some(&config.log_level),
        Some(config.log_json || config.is_production()),
        log_dir.to_str(),
    )?;

    Ok(())
}
