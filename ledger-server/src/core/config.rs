use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use shared::error::{AppError, AppResult, ErrorCode};

use crate::message::DeliveryConfig;
use crate::outbox::{DrainConfig, PublisherConfig};

/// 服务配置 - 账本管道的所有配置项
///
/// # 环境变量
///
/// 所有配置项都可以通过环境变量覆盖：
///
/// | 环境变量 | 默认值 | 说明 |
/// |----------|--------|------|
/// | WORK_DIR | ./data | 工作目录 (数据库、日志) |
/// | DATABASE_PATH | {WORK_DIR}/ledger.db | SQLite 文件路径 |
/// | LOG_LEVEL | info | 日志级别 (RUST_LOG 优先) |
/// | LOG_JSON | false | JSON 日志格式 |
/// | ENVIRONMENT | development | 运行环境 |
/// | OUTBOX_DRAIN_INTERVAL_MS | 1000 | 排空周期(毫秒) |
/// | OUTBOX_BATCH_SIZE | 200 | 每周期最多处理条数 |
/// | OUTBOX_MAX_ATTEMPTS | 20 | 毒化前最大发布次数 |
/// | OUTBOX_LEASE_MS | 60000 | 认领租约时长(毫秒) |
/// | PUBLISH_CONFIRM_TIMEOUT_MS | 10000 | 发布确认超时(毫秒) |
/// | CONSUMER_PREFETCH | 8 | 消费并发上限 |
/// | DELIVERY_MAX_ATTEMPTS | 5 | 投递重试次数(含首次) |
/// | DELIVERY_INITIAL_BACKOFF_MS | 200 | 投递重试初始退避(毫秒) |
/// | DELIVERY_MAX_BACKOFF_MS | 5000 | 投递重试最大退避(毫秒) |
/// | SHUTDOWN_TIMEOUT_MS | 10000 | 关闭超时(毫秒) |
///
/// # 示例
///
/// ```ignore
/// WORK_DIR=/data/ledger OUTBOX_MAX_ATTEMPTS=10 cargo run
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// 工作目录
    pub work_dir: String,
    /// SQLite 数据库文件
    pub database_path: String,
    pub log_level: String,
    pub log_json: bool,
    /// 运行环境: development | staging | production
    pub environment: String,

    // === Outbox ===
    pub drain_interval_ms: u64,
    pub outbox_batch_size: u32,
    pub outbox_max_attempts: i64,
    /// 必须大于发布确认超时，否则租约可能在确认前过期
    pub outbox_lease_ms: u64,
    pub publish_confirm_timeout_ms: u64,

    // === Consumer ===
    pub consumer_prefetch: usize,
    pub delivery_max_attempts: u32,
    pub delivery_initial_backoff_ms: u64,
    pub delivery_max_backoff_ms: u64,

    /// 关闭超时时间 (毫秒)
    pub shutdown_timeout_ms: u64,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// 从环境变量加载配置
    ///
    /// 如果环境变量未设置或无法解析，使用默认值
    pub fn from_env() -> Self {
        let work_dir = std::env::var("WORK_DIR").unwrap_or_else(|_| "./data".into());
        let database_path = std::env::var("DATABASE_PATH")
            .unwrap_or_else(|_| format!("{}/ledger.db", work_dir.trim_end_matches('/')));

        Self {
            work_dir,
            database_path,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            log_json: env_or("LOG_JSON", false),
            environment: std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".into()),

            drain_interval_ms: env_or("OUTBOX_DRAIN_INTERVAL_MS", 1000),
            outbox_batch_size: env_or("OUTBOX_BATCH_SIZE", 200),
            outbox_max_attempts: env_or("OUTBOX_MAX_ATTEMPTS", 20),
            outbox_lease_ms: env_or("OUTBOX_LEASE_MS", 60_000),
            publish_confirm_timeout_ms: env_or("PUBLISH_CONFIRM_TIMEOUT_MS", 10_000),

            consumer_prefetch: env_or("CONSUMER_PREFETCH", 8),
            delivery_max_attempts: env_or("DELIVERY_MAX_ATTEMPTS", 5),
            delivery_initial_backoff_ms: env_or("DELIVERY_INITIAL_BACKOFF_MS", 200),
            delivery_max_backoff_ms: env_or("DELIVERY_MAX_BACKOFF_MS", 5000),

            shutdown_timeout_ms: env_or("SHUTDOWN_TIMEOUT_MS", 10_000),
        }
    }

    /// 使用自定义工作目录覆盖配置
    ///
    /// 常用于测试场景，数据库路径跟随工作目录
    pub fn with_overrides(work_dir: impl Into<String>) -> Self {
        let mut config = Self::from_env();
        config.work_dir = work_dir.into();
        config.database_path = format!("{}/ledger.db", config.work_dir.trim_end_matches('/'));
        config
    }

    pub fn log_dir(&self) -> PathBuf {
        PathBuf::from(&self.work_dir).join("logs")
    }

    /// 是否生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// 校验配置项之间的约束
    ///
    /// 租约必须长于发布确认超时，否则确认还在等待时记录就会被其他 worker 重新认领
    pub fn validate(&self) -> AppResult<()> {
        if self.outbox_lease_ms <= self.publish_confirm_timeout_ms {
            return Err(AppError::with_message(
                ErrorCode::ConfigError,
                format!(
                    "OUTBOX_LEASE_MS ({}) must be greater than PUBLISH_CONFIRM_TIMEOUT_MS ({})",
                    self.outbox_lease_ms, self.publish_confirm_timeout_ms
                ),
            ));
        }
        if self.outbox_batch_size == 0 || self.outbox_max_attempts < 1 {
            return Err(AppError::with_message(
                ErrorCode::ConfigError,
                "OUTBOX_BATCH_SIZE and OUTBOX_MAX_ATTEMPTS must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn drain_config(&self) -> DrainConfig {
        DrainConfig {
            interval: Duration::from_millis(self.drain_interval_ms),
            batch_size: self.outbox_batch_size,
            max_attempts: self.outbox_max_attempts,
            lease: Duration::from_millis(self.outbox_lease_ms),
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            confirm_timeout: Duration::from_millis(self.publish_confirm_timeout_ms),
            ..PublisherConfig::default()
        }
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            prefetch: self.consumer_prefetch.max(1),
            max_attempts: self.delivery_max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.delivery_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.delivery_max_backoff_ms),
            ..DeliveryConfig::default()
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
