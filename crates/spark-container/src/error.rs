//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义容器对外暴露的错误语义：致命的启动失败、可恢复的查找失败与编程错误需要能被调用方区分；
//! - 组件自身的 `initialize`/`finish` 失败统一折叠为 [`ComponentError`]，由容器决定是升级为致命错误还是仅写入审计轨迹。
//!
//! ## 设计要求（What）
//! - 全部错误派生 `thiserror::Error`，携带结构化字段（请求类型、组件标签、循环路径），便于日志与告警维度对齐。

use thiserror::Error;

use crate::request::{ComponentId, RequestType};

/// 组件实现可携带的任意底层错误。
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 组件构造、初始化或收尾阶段返回的错误。
///
/// - **意图 (Why)**：组件实现只需给出人类可读的描述与可选的底层原因，无需感知容器的错误分类；
/// - **契约 (What)**：`message` 始终非空，`source` 保留完整错误链。
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ComponentError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl ComponentError {
    /// 以描述文本构造错误。
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// 附带底层原因构造错误。
    pub fn with_source(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 依赖槽位无法满足：目标组件未注册、未初始化或已失败。
    pub fn unsatisfied(slot: &str, request_type: &RequestType) -> Self {
        Self::new(format!(
            "unsatisfied dependency `{slot}`: no initialized component provides `{request_type}`"
        ))
    }

    /// 错误描述。
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// 容器错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：对应启动、查找、配置三条路径上的全部失败分支；
/// - **契约 (What)**：
///   - `CyclicDependency` 与 `ComponentInitialization` 为致命错误，出现后容器永久不可用；
///   - `NoSuchComponent` 可恢复，调用方应先用 `has_component` 探测；
///   - `NotInitialized` / `AlreadyStarted` 表示调用时机错误，属于编程错误。
#[derive(Debug, Error)]
pub enum ContainerError {
    /// 依赖图存在环，整个启动流程在实例化任何组件之前即失败。
    #[error("cyclic dependency detected: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// 必需组件初始化失败，已完成逆序回滚。
    #[error("component `{component}` failed to initialize: {source}")]
    ComponentInitialization {
        component: String,
        #[source]
        source: ComponentError,
    },

    /// 请求类型未注册，或对应组件未能初始化。
    #[error("no component available for request type `{request_type}`")]
    NoSuchComponent { request_type: RequestType },

    /// 私有组件标识不存在或未能初始化。
    #[error("no private component with id {id}")]
    NoSuchPrivateComponent { id: ComponentId },

    /// 容器从未成功启动、启动失败或已经关闭。
    #[error("container `{container}` is not initialized")]
    NotInitialized { container: String },

    /// 容器已经离开装配阶段，拒绝再次注册或启动。
    #[error("container `{container}` has already left the configuring phase")]
    AlreadyStarted { container: String },

    /// 组件实例不是调用方期望的具体类型或接口。
    #[error("component for `{request_type}` is not a `{expected}`")]
    TypeMismatch {
        request_type: RequestType,
        expected: &'static str,
    },

    /// 配置导入时引用了目录中不存在的实现。
    #[error("implementation `{name}` is not present in the catalog")]
    UnknownImplementation { name: String },
}
