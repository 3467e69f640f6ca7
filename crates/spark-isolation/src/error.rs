//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义隔离层对外暴露的错误语义：部署、解析、权限与宿主配置四类；
//! - 每个变体携带出错的名称（部署名、单元名、权限声明），便于运维直接定位。
//!
//! ## 分类约定（What）
//! - `DuplicateDeployment` 与独立的 [`AccessDenied`] 可恢复；
//! - `UndeployVeto` 是预期的业务结果，不代表缺陷；
//! - `PluginUndeployed` 对同一句柄是终态，不应重试。

use std::io;

use spark_container::ComponentError;
use thiserror::Error;

use crate::permission::Permission;

/// 权限检查失败。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("domain `{domain}` is not granted `{permission}`")]
pub struct AccessDenied {
    pub domain: String,
    pub permission: Permission,
}

/// 权限声明文本的解析失败原因。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PermissionParseErrorKind {
    #[error("expected `class|target[|actions]`, found {fields} field(s)")]
    FieldCount { fields: usize },
    #[error("capability class is empty")]
    EmptyClass,
    #[error("target is empty")]
    EmptyTarget,
    #[error("unterminated `${{` substitution")]
    UnterminatedVariable,
    #[error("environment variable `{name}` is not defined")]
    UndefinedVariable { name: String },
}

/// 权限声明解析错误，`line` 从 1 开始计数。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("permission declaration line {line}: {kind}")]
pub struct PermissionParseError {
    pub line: usize,
    #[source]
    pub kind: PermissionParseErrorKind,
}

/// 隔离域解析错误。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DomainError {
    /// 名称不在本域，且可见性过滤阻止或父级同样缺失。
    #[error("`{name}` is not visible from domain `{domain}`")]
    NotFound { domain: String, name: String },
    /// 域已被释放，不再提供任何单元或资源。
    #[error("domain `{domain}` has been released")]
    Released { domain: String },
}

/// 部署管理错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：覆盖 deploy / get_plugin / undeploy 三条路径上的全部失败分支；
/// - **契约 (What)**：`UndeployVeto` 出现时部署保持原样，可以原样重试；`PluginUndeployed` 出现时句柄已失效。
#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error("deployment `{name}` already exists")]
    DuplicateDeployment { name: String },

    #[error("deployment `{name}` does not exist")]
    NoSuchDeployment { name: String },

    #[error("undeploy of `{name}` vetoed: {reason}")]
    UndeployVeto { name: String, reason: String },

    #[error("deployment `{name}` has been undeployed")]
    PluginUndeployed { name: String },

    #[error("plugin `{unit}` cannot be loaded from deployment `{name}`: {source}")]
    PluginNotFound {
        name: String,
        unit: String,
        #[source]
        source: DomainError,
    },

    #[error("plugin `{unit}` in deployment `{name}` does not expose `{expected}`")]
    InterfaceMismatch {
        name: String,
        unit: String,
        expected: &'static str,
    },

    #[error("plugin `{unit}` in deployment `{name}` failed to instantiate: {source}")]
    Instantiation {
        name: String,
        unit: String,
        #[source]
        source: ComponentError,
    },

    /// 同一线程在创建某单元的过程中再次请求该单元。
    #[error("plugin `{unit}` in deployment `{name}` was requested while it is being created")]
    ReentrantInstantiation { name: String, unit: String },

    #[error("deployment manager has been shut down")]
    ShutDown,

    #[error("finalization observer failed to start: {source}")]
    Observer {
        #[source]
        source: io::Error,
    },
}

/// 宿主配置加载错误。
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("host settings are not valid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("access log pattern is not a valid regex: {0}")]
    InvalidPattern(#[from] regex::Error),
    #[error("host settings cannot be read: {0}")]
    Io(#[from] io::Error),
}

/// 从文件存储加载权限声明时的错误。
#[derive(Debug, Error)]
pub enum PermissionSourceError {
    #[error("permission source `{path}` cannot be read: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("permission source `{path}` is malformed: {source}")]
    Parse {
        path: String,
        #[source]
        source: PermissionParseError,
    },
}
