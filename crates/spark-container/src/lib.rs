#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "spark-container: 以依赖图驱动的组件容器。"]
#![doc = ""]
#![doc = "== 设计初衷 =="]
#![doc = "- **Why**：宿主需要一组长寿服务按依赖顺序启动、逆序关闭，并在启动半途失败时干净回滚；"]
#![doc = "- **What**：提供组件注册表、依赖解析器、生命周期控制器与只读审计轨迹；"]
#![doc = "- **How**：所有结构性变更串行于单把互斥锁，读取路径则走 `ArcSwap` 发布的不可变快照。"]

pub mod audit;
pub mod configuration;
pub mod container;
pub mod error;
pub mod factory;
pub mod implementation;
pub mod instance;
pub mod lifecycle;
pub mod registry;
pub mod request;
pub mod resolver;
pub mod telemetry;

pub use audit::{InfoRecord, InfoStatus};
pub use configuration::{ConfigurationError, ContainerConfiguration};
pub use container::{ComponentContainer, ContainerHandle, ContainerPhase};
pub use error::{BoxError, ComponentError, ContainerError};
pub use factory::{DefaultObjectFactory, ObjectFactory, TracingObjectFactory};
pub use implementation::{
    Dependencies, DependencySlot, DependencyTarget, Implementation, ImplementationBuilder,
    ImplementationCatalog,
};
pub use instance::{Component, Instance};
pub use lifecycle::{ComponentState, Injection, LifecycleController, LifecycleListener};
pub use registry::{ComponentConfiguration, ComponentRegistry};
pub use request::{ComponentId, RequestType};
pub use resolver::{DependencyResolver, InitializationOrder};
pub use telemetry::{TelemetryError, install_tracing, installed_directive};
