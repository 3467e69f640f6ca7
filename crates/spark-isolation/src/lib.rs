#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "spark-isolation: 插件隔离域与热部署生命周期。"]
#![doc = ""]
#![doc = "== 设计初衷 =="]
#![doc = "- **Why**：宿主需要在不重启进程的前提下装卸插件，并保证插件只能看见被允许的命名空间、只能行使被授予的能力；"]
#![doc = "- **What**：提供子优先解析的隔离域、声明式权限模型、两阶段可否决卸载与释放后的回收观测；"]
#![doc = "- **How**：插件能力以显式 `Capabilities` 对象随 `PluginContext` 注入，不依赖任何进程级全局状态。"]

pub mod collaborators;
pub mod deployment;
pub mod domain;
pub mod error;
pub mod observer;
pub mod permission;
pub mod settings;

pub use collaborators::{
    ArtifactCoordinates, ArtifactResolver, FileStore, FolderEntry, InMemoryFileStore,
    InvalidCoordinates, LocalFileStore, deployment_name_from_folder,
};
pub use deployment::{
    DeploymentBuilder, DeploymentHandle, DeploymentListener, DeploymentManager, PluginContext,
    PluginHook, Veto,
};
pub use domain::{
    DomainId, DomainKind, HostBoundary, IsolationDomain, LoadedUnit, Resource, UnitSet,
    VisibilityFilter,
};
pub use error::{
    AccessDenied, DeploymentError, DomainError, PermissionParseError, PermissionParseErrorKind,
    PermissionSourceError, SettingsError,
};
pub use observer::{FinalizationObserver, ObserverSettings, OutstandingDomain};
pub use permission::{
    ALL_CLASS, AccessLogFilter, Capabilities, EnvLookup, HOST_DOMAIN, Permission,
    PermissionRegistry, PermissionSet, ProcessEnv,
};
pub use settings::{ContainerSection, HostSettings, IsolationSection};
