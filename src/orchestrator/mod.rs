//! 会话编排服务：总线、路由、状态机与空闲计时器的主循环。

mod engine;
mod error;

pub mod scheduler;

pub use engine::{OrchestratorSettings, SessionOrchestrator};
pub use error::OrchestratorError;
pub use scheduler::{IdleTimeout, TimeoutScheduler};
