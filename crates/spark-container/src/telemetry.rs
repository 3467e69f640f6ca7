//! 宿主进程的 `tracing` 安装入口。
//!
//! # 教案式说明
//! - **意图 (Why)**：容器与隔离层只依赖 `tracing` 门面输出结构化事件，由宿主决定何时、以何种过滤级别落地；
//! - **逻辑 (How)**：`registry + EnvFilter + fmt` 组装全局 Subscriber，`RUST_LOG` 优先于调用方给出的默认指令；
//! - **契约 (What)**：进程内只允许成功安装一次，外部已设置 Subscriber 时拒绝覆盖。

use std::sync::OnceLock;

use thiserror::Error;
use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

static INSTALLED: OnceLock<String> = OnceLock::new();

/// 安装阶段的失败路径。
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("tracing has already been installed by spark-container")]
    AlreadyInstalled,
    #[error("a global tracing subscriber is already set")]
    SubscriberAlreadySet,
    #[error("invalid log directive `{directive}`: {reason}")]
    InvalidDirective { directive: String, reason: String },
    #[error("failed to set global tracing subscriber: {0}")]
    SetGlobal(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// 安装全局 Subscriber。
///
/// - `default_directive` 仅在未设置 `RUST_LOG` 时生效，例如 `"info,spark_isolation=debug"`；
/// - 返回实际生效的过滤指令，便于宿主在启动日志中回显。
pub fn install_tracing(default_directive: &str) -> Result<String, TelemetryError> {
    if INSTALLED.get().is_some() {
        return Err(TelemetryError::AlreadyInstalled);
    }
    if dispatcher::has_been_set() {
        return Err(TelemetryError::SubscriberAlreadySet);
    }

    let filter = build_env_filter(default_directive)?;
    let effective = filter.to_string();
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());
    tracing::subscriber::set_global_default(subscriber)?;

    INSTALLED
        .set(effective.clone())
        .map_err(|_| TelemetryError::AlreadyInstalled)?;
    Ok(effective)
}

/// 已安装时返回生效中的过滤指令。
pub fn installed_directive() -> Option<&'static str> {
    INSTALLED.get().map(String::as_str)
}

fn build_env_filter(default_directive: &str) -> Result<EnvFilter, TelemetryError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(default_directive).map_err(|error| TelemetryError::InvalidDirective {
        directive: default_directive.to_owned(),
        reason: error.to_string(),
    })
}
