//! # 组件容器
//!
//! ## 核心意图（Why）
//! - 把注册表、依赖解析与生命周期控制串成一个显式构造的对象，取代全局单例；
//! - 保证调用方只会观察到“启动前”或“启动后”两种一致状态，永远看不到半启动的容器。
//!
//! ## 架构定位（Where）
//! - 结构性操作（`register`、`initialize`、`shutdown`）串行于 `parking_lot::Mutex`；
//! - 查找操作（`has_component`、`get_component`）只读取 `ArcSwap` 中的不可变快照，不接触转换锁。
//!
//! ## 行为契约（What）
//! - 必需组件初始化失败：已初始化组件逆序各收尾一次，容器永久进入 `Failed`，任何查找都返回 `NotInitialized`；
//! - 可选组件初始化失败：记入审计轨迹后继续，查找该请求类型返回 `NoSuchComponent`；
//! - 关闭逆序执行，个别组件收尾失败不影响其余组件。
//!
//! ## 风险提示（Trade-offs）
//! - 启停期间持锁调用用户回调，回调若耗时会阻塞其他结构性操作；这是串行语义的直接代价。

use core::fmt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditTrail, InfoRecord, InfoStatus};
use crate::configuration::ContainerConfiguration;
use crate::error::{ComponentError, ContainerError};
use crate::factory::{DefaultObjectFactory, ObjectFactory};
use crate::implementation::{Dependencies, DependencyTarget, Implementation, ImplementationCatalog};
use crate::instance::{Component, Instance};
use crate::lifecycle::{ComponentState, Injection, LifecycleController, LifecycleListener};
use crate::registry::{ComponentRegistry, Registration};
use crate::request::{ComponentId, RequestType};
use crate::resolver::{DependencyResolver, InitializationOrder};

/// 容器整体阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerPhase {
    /// 接受注册，尚未启动。
    Configuring,
    /// 启动成功，可查找组件。
    Running,
    /// 启动失败，永久不可用。
    Failed,
    /// 已关闭。
    Stopped,
}

/// 查找路径读取的不可变快照。
struct Snapshot {
    phase: ContainerPhase,
    registered: HashSet<RequestType>,
    public: HashMap<RequestType, Instance>,
    private: HashMap<ComponentId, Instance>,
}

impl Snapshot {
    fn empty() -> Self {
        Self {
            phase: ContainerPhase::Configuring,
            registered: HashSet::new(),
            public: HashMap::new(),
            private: HashMap::new(),
        }
    }
}

struct LiveComponent {
    id: ComponentId,
    label: String,
    request_type: Option<RequestType>,
    instance: Instance,
}

struct TransitionState {
    phase: ContainerPhase,
    registry: ComponentRegistry,
    listeners: Vec<Arc<dyn LifecycleListener>>,
    states: HashMap<ComponentId, ComponentState>,
    order: InitializationOrder,
    live: Vec<LiveComponent>,
}

impl TransitionState {
    fn transition(&mut self, id: ComponentId, next: ComponentState) {
        let previous = self.states.insert(id, next);
        debug_assert!(
            previous.is_none_or(|current| current.can_transition_to(next)),
            "illegal component transition {previous:?} -> {next:?}"
        );
    }
}

struct ContainerInner {
    name: String,
    controller: LifecycleController,
    transitions: Mutex<TransitionState>,
    snapshot: ArcSwap<Snapshot>,
    audit: AuditTrail,
}

impl ContainerInner {
    fn publish(&self, state: &TransitionState) {
        let registered = state.registry.request_types().cloned().collect();
        let mut public = HashMap::new();
        let mut private = HashMap::new();
        if state.phase == ContainerPhase::Running {
            for component in &state.live {
                match &component.request_type {
                    Some(request_type) => {
                        public.insert(request_type.clone(), component.instance.clone());
                    }
                    None => {
                        private.insert(component.id, component.instance.clone());
                    }
                }
            }
        }
        self.snapshot.store(Arc::new(Snapshot {
            phase: state.phase,
            registered,
            public,
            private,
        }));
    }

    fn has_component(&self, request_type: &RequestType) -> bool {
        self.snapshot.load().registered.contains(request_type)
    }

    fn get_component(&self, request_type: &RequestType) -> Result<Instance, ContainerError> {
        let snapshot = self.snapshot.load();
        if snapshot.phase != ContainerPhase::Running {
            return Err(ContainerError::NotInitialized {
                container: self.name.clone(),
            });
        }
        snapshot
            .public
            .get(request_type)
            .cloned()
            .ok_or_else(|| ContainerError::NoSuchComponent {
                request_type: request_type.clone(),
            })
    }

    fn get_private(&self, id: ComponentId) -> Result<Instance, ContainerError> {
        let snapshot = self.snapshot.load();
        if snapshot.phase != ContainerPhase::Running {
            return Err(ContainerError::NotInitialized {
                container: self.name.clone(),
            });
        }
        snapshot
            .private
            .get(&id)
            .cloned()
            .ok_or(ContainerError::NoSuchPrivateComponent { id })
    }
}

fn downcast<T: Component>(
    request_type: &RequestType,
    instance: Instance,
) -> Result<Arc<T>, ContainerError> {
    instance
        .downcast::<T>()
        .ok_or_else(|| ContainerError::TypeMismatch {
            request_type: request_type.clone(),
            expected: core::any::type_name::<T>(),
        })
}

fn interface<I>(request_type: &RequestType, instance: Instance) -> Result<Arc<I>, ContainerError>
where
    I: ?Sized + Send + Sync + 'static,
{
    instance
        .interface::<I>()
        .ok_or_else(|| ContainerError::TypeMismatch {
            request_type: request_type.clone(),
            expected: core::any::type_name::<I>(),
        })
}

/// 组件容器。
///
/// # 教案级注释
/// - **设计目的 (Why)**
///   - 以显式对象承载组件图，测试与多宿主场景可以各自构造独立容器；
///   - 启动是一次性的：容器实例化出的组件不会在同一容器内被重建。
/// - **关键流程 (How)**
///   1. `register*`：装配阶段登记组件；
///   2. `initialize`：解析顺序 → 逐个注入、实例化、初始化 → 发布快照 → `post_initialize`；
///   3. `shutdown`：`pre_destroy` → 发布停止快照 → 逆序收尾。
/// - **契约说明 (What)**
///   - 克隆 `ComponentContainer` 得到的是同一容器的另一个句柄。
#[derive(Clone)]
pub struct ComponentContainer {
    inner: Arc<ContainerInner>,
}

impl fmt::Debug for ComponentContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.inner.snapshot.load();
        f.debug_struct("ComponentContainer")
            .field("name", &self.inner.name)
            .field("phase", &snapshot.phase)
            .field("public_components", &snapshot.public.len())
            .finish()
    }
}

impl ComponentContainer {
    /// 使用默认对象工厂构造容器。
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_factory(name, Arc::new(DefaultObjectFactory))
    }

    /// 使用自定义对象工厂构造容器。
    pub fn with_factory(name: impl Into<String>, factory: Arc<dyn ObjectFactory>) -> Self {
        Self {
            inner: Arc::new(ContainerInner {
                name: name.into(),
                controller: LifecycleController::new(factory),
                transitions: Mutex::new(TransitionState {
                    phase: ContainerPhase::Configuring,
                    registry: ComponentRegistry::new(),
                    listeners: Vec::new(),
                    states: HashMap::new(),
                    order: InitializationOrder::default(),
                    live: Vec::new(),
                }),
                snapshot: ArcSwap::from_pointee(Snapshot::empty()),
                audit: AuditTrail::default(),
            }),
        }
    }

    /// 容器名称。
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 当前阶段。
    pub fn phase(&self) -> ContainerPhase {
        self.inner.snapshot.load().phase
    }

    /// 弱引用句柄，供组件回查容器。
    pub fn handle(&self) -> ContainerHandle {
        ContainerHandle {
            name: Arc::from(self.inner.name.as_str()),
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// 登记组件；`request_type` 为 `None` 即私有组件。
    pub fn register(
        &self,
        request_type: Option<RequestType>,
        implementation: Implementation,
        fail_on_error: bool,
    ) -> Result<ComponentId, ContainerError> {
        let mut state = self.inner.transitions.lock();
        if state.phase != ContainerPhase::Configuring {
            return Err(ContainerError::AlreadyStarted {
                container: self.inner.name.clone(),
            });
        }
        let id = state
            .registry
            .register(request_type, implementation, fail_on_error);
        self.inner.publish(&state);
        Ok(id)
    }

    /// 登记必需的公开组件。
    pub fn register_public(
        &self,
        request_type: RequestType,
        implementation: Implementation,
    ) -> Result<ComponentId, ContainerError> {
        self.register(Some(request_type), implementation, true)
    }

    /// 登记可选的公开组件。
    pub fn register_optional(
        &self,
        request_type: RequestType,
        implementation: Implementation,
    ) -> Result<ComponentId, ContainerError> {
        self.register(Some(request_type), implementation, false)
    }

    /// 登记必需的私有组件。
    pub fn register_private(
        &self,
        implementation: Implementation,
    ) -> Result<ComponentId, ContainerError> {
        self.register(None, implementation, true)
    }

    /// 按配置与实现目录批量登记。
    ///
    /// 先把全部实现名解析完毕再写入注册表，任一名称缺失时不产生部分注册。
    pub fn register_configuration(
        &self,
        configuration: &ContainerConfiguration,
        catalog: &ImplementationCatalog,
    ) -> Result<Vec<ComponentId>, ContainerError> {
        let resolved = configuration
            .components
            .iter()
            .map(|component| {
                catalog
                    .get(&component.implementation)
                    .cloned()
                    .map(|implementation| (component, implementation))
                    .ok_or_else(|| ContainerError::UnknownImplementation {
                        name: component.implementation.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut state = self.inner.transitions.lock();
        if state.phase != ContainerPhase::Configuring {
            return Err(ContainerError::AlreadyStarted {
                container: self.inner.name.clone(),
            });
        }
        let ids = resolved
            .into_iter()
            .map(|(component, implementation)| {
                state.registry.register(
                    component.request_type.clone(),
                    implementation,
                    component.fail_on_error,
                )
            })
            .collect();
        self.inner.publish(&state);
        Ok(ids)
    }

    /// 导出当前活动注册的配置。
    pub fn configuration(&self) -> ContainerConfiguration {
        ContainerConfiguration {
            components: self.inner.transitions.lock().registry.configurations(),
        }
    }

    /// 添加生命周期监听器。
    pub fn add_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.inner.transitions.lock().listeners.push(listener);
    }

    /// 请求类型是否已登记。
    pub fn has_component(&self, request_type: &RequestType) -> bool {
        self.inner.has_component(request_type)
    }

    /// 按请求类型查找组件。
    pub fn get_component(&self, request_type: &RequestType) -> Result<Instance, ContainerError> {
        self.inner.get_component(request_type)
    }

    /// 按请求类型查找并转换为具体类型。
    pub fn get<T: Component>(&self, request_type: &RequestType) -> Result<Arc<T>, ContainerError> {
        downcast(request_type, self.get_component(request_type)?)
    }

    /// 按请求类型查找并取回接口视图。
    pub fn get_interface<I>(&self, request_type: &RequestType) -> Result<Arc<I>, ContainerError>
    where
        I: ?Sized + Send + Sync + 'static,
    {
        interface(request_type, self.get_component(request_type)?)
    }

    /// 按注册标识查找私有组件。
    pub fn get_private(&self, id: ComponentId) -> Result<Instance, ContainerError> {
        self.inner.get_private(id)
    }

    /// 组件的当前生命周期状态；未进入启动流程时返回 `None`。
    pub fn component_state(&self, id: ComponentId) -> Option<ComponentState> {
        self.inner.transitions.lock().states.get(&id).copied()
    }

    /// 最近一次启动解析出的顺序。
    pub fn initialization_order(&self) -> InitializationOrder {
        self.inner.transitions.lock().order.clone()
    }

    /// 审计轨迹副本，按写入顺序。
    pub fn info_records(&self) -> Vec<InfoRecord> {
        self.inner.audit.records()
    }

    /// 启动容器。
    ///
    /// # 教案级注释
    /// - **前置条件**：容器处于 `Configuring`；否则返回 [`ContainerError::AlreadyStarted`]；
    /// - **执行逻辑 (How)**：
    ///   1. 解析启动顺序，发现环立即失败，此时尚未实例化任何组件；
    ///   2. 为全部组件写入 `PENDING` 审计记录；
    ///   3. 逐个组件：注入已初始化的依赖 → 工厂实例化 → `initialize`；
    ///   4. 必需组件失败时逆序收尾已初始化组件并返回原始错误；可选组件失败时记录后继续；
    ///   5. 发布运行期快照并通知监听器。
    /// - **后置条件**：成功时阶段为 `Running`；失败时为 `Failed` 且不可恢复。
    pub fn initialize(&self) -> Result<(), ContainerError> {
        let inner = &self.inner;
        let mut state = inner.transitions.lock();
        if state.phase != ContainerPhase::Configuring {
            return Err(ContainerError::AlreadyStarted {
                container: inner.name.clone(),
            });
        }

        info!(
            container = %inner.name,
            components = state.registry.len(),
            "container startup initiated"
        );

        let order = match DependencyResolver::resolve(&state.registry) {
            Ok(order) => order,
            Err(error) => {
                error!(container = %inner.name, error = %error, "dependency resolution failed");
                state.phase = ContainerPhase::Failed;
                inner.publish(&state);
                return Err(error);
            }
        };

        let registrations: Vec<Registration> = order
            .iter()
            .filter_map(|id| state.registry.get(id).cloned())
            .collect();
        for registration in &registrations {
            state.transition(registration.id(), ComponentState::Pending);
            inner
                .audit
                .append(&registration.label(), InfoStatus::Pending, None);
        }
        state.order = order;

        let handle = self.handle();
        let mut provided: HashMap<RequestType, Instance> = HashMap::new();
        let mut live: Vec<LiveComponent> = Vec::with_capacity(registrations.len());

        for registration in &registrations {
            let label = registration.label();
            let request_type = registration.configuration().request_type.clone();
            state.transition(registration.id(), ComponentState::Initializing);

            let outcome = inner
                .controller
                .inject(
                    registration.implementation(),
                    Dependencies::new(),
                    |slot| match slot.target() {
                        DependencyTarget::Container => Ok(Injection::Container(handle.clone())),
                        DependencyTarget::Request(wanted) => provided
                            .get(wanted)
                            .cloned()
                            .map(Injection::Instance)
                            .ok_or_else(|| ComponentError::unsatisfied(slot.name(), wanted)),
                    },
                )
                .and_then(|dependencies| {
                    inner.controller.activate(
                        request_type.as_ref(),
                        registration.implementation(),
                        &dependencies,
                    )
                });

            match outcome {
                Ok(instance) => {
                    state.transition(registration.id(), ComponentState::Initialized);
                    inner.audit.append(&label, InfoStatus::Initialized, None);
                    debug!(container = %inner.name, component = %label, "component ready");
                    if let Some(request_type) = &request_type {
                        provided.insert(request_type.clone(), instance.clone());
                    }
                    live.push(LiveComponent {
                        id: registration.id(),
                        label,
                        request_type,
                        instance,
                    });
                }
                Err(source) => {
                    state.transition(registration.id(), ComponentState::Failed);
                    inner
                        .audit
                        .append(&label, InfoStatus::Failed, Some(source.to_string()));

                    if !registration.configuration().fail_on_error {
                        warn!(
                            container = %inner.name,
                            component = %label,
                            error = %source,
                            "optional component failed to initialize; continuing startup"
                        );
                        continue;
                    }

                    error!(
                        container = %inner.name,
                        component = %label,
                        error = %source,
                        rollback = live.len(),
                        "required component failed to initialize; rolling back"
                    );
                    self.finish_in_reverse(&mut state, live);
                    state.phase = ContainerPhase::Failed;
                    inner.publish(&state);
                    return Err(ContainerError::ComponentInitialization {
                        component: label,
                        source,
                    });
                }
            }
        }

        state.live = live;
        state.phase = ContainerPhase::Running;
        inner.publish(&state);

        for listener in &state.listeners {
            if let Err(error) = listener.post_initialize(&handle) {
                warn!(container = %inner.name, error = %error, "post_initialize listener failed");
            }
        }

        info!(
            container = %inner.name,
            initialized = state.live.len(),
            "container started"
        );
        Ok(())
    }

    /// 关闭容器。
    ///
    /// - **契约 (What)**：仅在 `Running` 时生效，其余阶段为空操作；无条件按启动逆序收尾全部已初始化组件，
    ///   单个组件失败只记录日志；完成后阶段为 `Stopped`，查找返回 `NotInitialized`。
    pub fn shutdown(&self) {
        let inner = &self.inner;
        let mut state = inner.transitions.lock();
        if state.phase != ContainerPhase::Running {
            debug!(container = %inner.name, phase = ?state.phase, "shutdown ignored; container not running");
            return;
        }

        info!(container = %inner.name, components = state.live.len(), "container shutdown initiated");
        let handle = self.handle();
        for listener in &state.listeners {
            if let Err(error) = listener.pre_destroy(&handle) {
                warn!(container = %inner.name, error = %error, "pre_destroy listener failed");
            }
        }

        state.phase = ContainerPhase::Stopped;
        inner.publish(&state);
        let live = std::mem::take(&mut state.live);
        self.finish_in_reverse(&mut state, live);
        info!(container = %inner.name, "container stopped");
    }

    fn finish_in_reverse(&self, state: &mut TransitionState, live: Vec<LiveComponent>) {
        for component in live.into_iter().rev() {
            state.transition(component.id, ComponentState::Finishing);
            let failure = self
                .inner
                .controller
                .finish(&component.label, &component.instance);
            state.transition(component.id, ComponentState::Finished);
            self.inner
                .audit
                .append(&component.label, InfoStatus::Finished, failure);
        }
    }
}

/// 容器的弱引用句柄。
///
/// - **意图 (Why)**：组件通过“容器自身”槽位拿到句柄做服务定位，弱引用避免组件与容器互相持有；
/// - **契约 (What)**：查找走无锁快照；容器已被释放时返回 `NotInitialized`。
#[derive(Clone)]
pub struct ContainerHandle {
    name: Arc<str>,
    inner: Weak<ContainerInner>,
}

impl fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("name", &self.name)
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl ContainerHandle {
    fn upgrade(&self) -> Result<Arc<ContainerInner>, ContainerError> {
        self.inner.upgrade().ok_or_else(|| ContainerError::NotInitialized {
            container: self.name.to_string(),
        })
    }

    /// 容器名称。
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 请求类型是否已登记。
    pub fn has_component(&self, request_type: &RequestType) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.has_component(request_type))
    }

    /// 按请求类型查找组件。
    pub fn get_component(&self, request_type: &RequestType) -> Result<Instance, ContainerError> {
        self.upgrade()?.get_component(request_type)
    }

    /// 按请求类型查找并转换为具体类型。
    pub fn get<T: Component>(&self, request_type: &RequestType) -> Result<Arc<T>, ContainerError> {
        downcast(request_type, self.get_component(request_type)?)
    }

    /// 按请求类型查找并取回接口视图。
    pub fn get_interface<I>(&self, request_type: &RequestType) -> Result<Arc<I>, ContainerError>
    where
        I: ?Sized + Send + Sync + 'static,
    {
        interface(request_type, self.get_component(request_type)?)
    }
}
