use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use shared::error::{AppError, AppResult, ErrorCode};

use crate::core::{BackgroundTasks, Config, TaskKind};
use crate::db::DbService;
use crate::ledger::EntryRecorder;
use crate::message::topology::{ENTRY_RECORDED_QUEUE, declare_ledger_topology};
use crate::message::{BrokerError, BrokerSignal, DeliveryHandler, MessageBroker};
use crate::observer::PipelineCounters;
use crate::outbox::{OutboxDrainScheduler, OutboxPublisher};
use crate::projection::{
    BalanceProjection, BalanceQueryService, LedgerEventConsumer, RebuildJobs, RebuildService,
};

fn broker_error(e: BrokerError) -> AppError {
    AppError::with_message(ErrorCode::BrokerUnavailable, e.to_string())
}

/// 服务状态 - 持有管道所有组件的共享引用
///
/// | 字段 | 说明 |
/// |------|------|
/// | config | 配置项 (不可变) |
/// | db | SQLite 连接池 |
/// | broker | 进程内 broker (拓扑已声明) |
/// | publisher | outbox 发布者 |
/// | recorder | 条目记录 (写入 entry + outbox) |
/// | projection | 投影写入 |
/// | consumer | 事件消费者 |
/// | rebuilds | 重建任务注册表 |
/// | queries | 余额查询 |
/// | counters | 管道计数器 |
#[derive(Clone)]
pub struct ServerState {
    pub config: Config,
    pub db: DbService,
    pub broker: MessageBroker,
    pub publisher: Arc<OutboxPublisher>,
    pub recorder: EntryRecorder,
    pub projection: BalanceProjection,
    pub consumer: LedgerEventConsumer,
    pub rebuilds: RebuildJobs,
    pub queries: BalanceQueryService,
    pub counters: Arc<PipelineCounters>,
    /// 发布信号流，由信号监听任务取走
    signals: Arc<Mutex<Option<mpsc::UnboundedReceiver<BrokerSignal>>>>,
}

impl ServerState {
    /// 初始化服务状态
    ///
    /// 按顺序初始化：
    /// 1. 数据库 (执行迁移)
    /// 2. broker 拓扑与发布通道
    /// 3. 各组件 (recorder, projection, consumer, rebuild, query)
    pub async fn initialize(config: &Config) -> AppResult<Self> {
        config.validate()?;

        // 1. Database
        let db = DbService::new(&config.database_path).await?;
        let pool = db.pool.clone();

        // 2. Broker
        let broker = MessageBroker::new();
        declare_ledger_topology(&broker).map_err(broker_error)?;
        let (channel, signals) = broker.open_channel();

        // 3. Components
        let counters = Arc::new(PipelineCounters::new());
        let publisher = Arc::new(OutboxPublisher::new(
            Arc::new(channel),
            config.publisher_config(),
            counters.clone(),
        ));
        let recorder = EntryRecorder::new(pool.clone(), counters.clone());
        let projection = BalanceProjection::new(pool.clone());
        let consumer = LedgerEventConsumer::new(projection.clone(), counters.clone());
        let rebuilds = RebuildJobs::new(RebuildService::new(pool.clone()));
        let queries = BalanceQueryService::new(pool);

        tracing::info!(
            database = %config.database_path,
            environment = %config.environment,
            "Server state initialized"
        );

        Ok(Self {
            config: config.clone(),
            db,
            broker,
            publisher,
            recorder,
            projection,
            consumer,
            rebuilds,
            queries,
            counters,
            signals: Arc::new(Mutex::new(Some(signals))),
        })
    }

    /// 启动后台任务
    ///
    /// - 发布信号监听 (Listener)
    /// - outbox 排空 (Periodic)
    /// - 账本队列消费 (Worker)
    ///
    /// 只能调用一次：信号流只有一个接收端。
    pub fn start_background_tasks(&self) -> AppResult<BackgroundTasks> {
        let signals = self
            .signals
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or_else(|| AppError::internal("Background tasks already started"))?;

        let mut tasks = BackgroundTasks::new();
        let token = tasks.shutdown_token();

        let publisher = self.publisher.clone();
        let listener_token = token.clone();
        tasks.spawn("publisher_signals", TaskKind::Listener, async move {
            publisher.run_signal_listener(signals, listener_token).await;
        });

        let scheduler = OutboxDrainScheduler::new(
            self.db.pool.clone(),
            self.publisher.clone(),
            self.config.drain_config(),
            self.counters.clone(),
        );
        tasks.spawn("outbox_drain", TaskKind::Periodic, scheduler.run(token.clone()));

        let handler = DeliveryHandler::new(
            self.broker.clone(),
            ENTRY_RECORDED_QUEUE,
            Arc::new(self.consumer.clone()),
            self.config.delivery_config(),
            self.counters.clone(),
            token,
        )
        .map_err(broker_error)?;
        tasks.spawn("ledger_consumer", TaskKind::Worker, handler.run());

        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::EntryType;
    use shared::models::RecordEntry;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pipeline_runs_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::with_overrides(dir.path().to_string_lossy());
        config.drain_interval_ms = 20;
        let state = ServerState::initialize(&config).await.unwrap();
        let tasks = state.start_background_tasks().unwrap();
        assert_eq!(tasks.len(), 3);
        assert!(state.start_background_tasks().is_err());

        state
            .recorder
            .record(RecordEntry {
                occurred_on: "2024-09-09".parse().unwrap(),
                amount_cents: 4200,
                entry_type: EntryType::Credit,
                description: "invoice".into(),
                idempotency_key: "inv-1".into(),
                request_id: None,
            })
            .await
            .unwrap();

        let day = "2024-09-09".parse().unwrap();
        let mut balance = 0;
        for _ in 0..200 {
            balance = state.queries.daily(day).await.unwrap().balance_cents;
            if balance != 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(balance, 4200);

        tasks.shutdown(Duration::from_secs(2)).await;
        state.db.close().await;
    }
}
