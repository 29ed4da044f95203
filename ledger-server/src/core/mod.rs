//! 核心模块 - 配置、状态与后台任务
//!
//! - [`Config`] - 服务配置
//! - [`ServerState`] - 服务状态 (所有组件的共享引用)
//! - [`BackgroundTasks`] - 后台任务管理

pub mod config;
pub mod state;
pub mod tasks;

pub use config::Config;
pub use state::ServerState;
pub use tasks::{BackgroundTasks, TaskKind};
