//! # 部署管理器
//!
//! ## 核心意图（Why）
//! - 让运维在不重启宿主的前提下装卸插件：每个部署得到一个插件隔离域、一份不可变能力集与一组按需实例化的插件；
//! - 卸载分两阶段：先广播可否决的意向，再提交不可中断的拆除，调用方只会观察到卸载前或卸载后的一致状态。
//!
//! ## 架构定位（Where）
//! - deploy / undeploy / shutdown 串行于 `parking_lot::Mutex`；查询走 `ArcSwap` 快照；
//! - 插件实例缓存在各部署自己的 `DashMap` 中，首次创建由单元级闸门保证只发生一次；
//!   闸门只串行同一单元，钩子与构造函数可以请求同一部署的其它单元。
//!
//! ## 行为契约（What）
//! - 任一监听器否决即返回 [`DeploymentError::UndeployVeto`]，部署保持原样；
//! - 提交阶段逆序收尾插件实例、吊销能力、释放隔离域并交给回收观测器，最后广播 `undeployed`；
//! - 卸载后通过旧句柄访问插件返回终态错误 [`DeploymentError::PluginUndeployed`]。
//!
//! ## 风险提示（Trade-offs）
//! - 监听器同步执行且没有超时，卡住的监听器会卡住整个卸载调用；
//! - 插件构造期间不要回调本管理器的结构性操作（deploy / undeploy / shutdown），否则与卸载的加锁顺序相反；
//! - 同一线程在创建某单元时再次请求该单元会得到 [`DeploymentError::ReentrantInstantiation`]。

use core::fmt;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use spark_container::{
    BoxError, ComponentError, ContainerHandle, DefaultObjectFactory, Dependencies,
    DependencySlot, DependencyTarget, Injection, Instance, LifecycleController, ObjectFactory,
};
use tracing::{debug, info, warn};

use crate::domain::{
    DomainId, HostBoundary, IsolationDomain, LoadedUnit, Resource, UnitSet, VisibilityFilter,
};
use crate::error::{AccessDenied, DeploymentError, DomainError, SettingsError};
use crate::observer::{FinalizationObserver, ObserverSettings};
use crate::permission::{AccessLogFilter, Capabilities, Permission, PermissionRegistry, PermissionSet};
use crate::settings::HostSettings;

/// 卸载意向阶段共享的否决标记。
#[derive(Debug, Default)]
pub struct Veto {
    reason: Mutex<Option<String>>,
}

impl Veto {
    fn new() -> Self {
        Self::default()
    }

    /// 否决本次卸载；只保留第一个理由。
    pub fn veto(&self, reason: impl Into<String>) {
        let mut slot = self.reason.lock();
        if slot.is_none() {
            *slot = Some(reason.into());
        }
    }

    pub fn is_vetoed(&self) -> bool {
        self.reason.lock().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

/// 部署事件监听器，按注册顺序同步调用。
pub trait DeploymentListener: Send + Sync {
    fn deployed(&self, deployment: &DeploymentHandle) -> Result<(), BoxError> {
        let _ = deployment;
        Ok(())
    }

    /// 卸载意向；调用 [`Veto::veto`] 即可中止本次卸载。
    fn undeploying(&self, deployment: &DeploymentHandle, veto: &Veto) {
        let _ = (deployment, veto);
    }

    fn undeployed(&self, name: &str) -> Result<(), BoxError> {
        let _ = name;
        Ok(())
    }
}

/// 插件首次实例化前后的钩子。
pub trait PluginHook: Send + Sync {
    /// 返回错误即放弃本次实例化。
    fn before_create(&self, context: &PluginContext, unit: &LoadedUnit) -> Result<(), ComponentError> {
        let _ = (context, unit);
        Ok(())
    }

    fn after_create(&self, context: &PluginContext, instance: &Instance) {
        let _ = (context, instance);
    }
}

/// 插件实例构造时可见的上下文，经依赖包的扩展对象注入。
///
/// - **契约 (What)**：携带部署名、能力对象与所属隔离域；插件面向的特权操作一律经 `capabilities` 检查；
/// - **风险 (Trade-offs)**：上下文持有隔离域的强引用，插件在卸载后仍保留上下文会让回收观测器报告泄漏。
#[derive(Clone, Debug)]
pub struct PluginContext {
    deployment: Arc<str>,
    capabilities: Capabilities,
    domain: IsolationDomain,
}

impl PluginContext {
    pub fn deployment(&self) -> &str {
        &self.deployment
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn domain_id(&self) -> DomainId {
        self.domain.id()
    }

    pub fn check(&self, permission: &Permission) -> Result<(), AccessDenied> {
        self.capabilities.check(permission)
    }

    /// 按本域的解析规则读取资源。
    pub fn resource(&self, name: &str) -> Result<Resource, DomainError> {
        self.domain.load_resource(name)
    }
}

struct DeploymentRecord {
    name: Arc<str>,
    domain_id: DomainId,
    capabilities: Capabilities,
    live: RwLock<Option<IsolationDomain>>,
    plugins: DashMap<String, Instance>,
    gates: DashMap<String, Arc<CreationGate>>,
    creation_order: Mutex<Vec<String>>,
}

/// 单元级创建闸门：`lock` 串行同一单元的首次创建，`owner` 记录持有线程以识别重入。
#[derive(Default)]
struct CreationGate {
    lock: Mutex<()>,
    owner: Mutex<Option<ThreadId>>,
}

struct OwnerMark<'a>(&'a CreationGate);

impl Drop for OwnerMark<'_> {
    fn drop(&mut self) {
        *self.0.owner.lock() = None;
    }
}

/// 部署句柄；卸载后句柄仍可持有，但不再提供任何插件。
#[derive(Clone)]
pub struct DeploymentHandle {
    record: Arc<DeploymentRecord>,
}

impl fmt::Debug for DeploymentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentHandle")
            .field("name", &self.record.name)
            .field("domain", &self.record.domain_id)
            .field("undeployed", &self.is_undeployed())
            .field("plugins", &self.record.plugins.len())
            .finish()
    }
}

impl DeploymentHandle {
    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn domain_id(&self) -> DomainId {
        self.record.domain_id
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.record.capabilities
    }

    pub fn is_undeployed(&self) -> bool {
        self.record.live.read().is_none()
    }

    /// 已实例化的插件单元名，按创建顺序。
    pub fn plugin_names(&self) -> Vec<String> {
        self.record.creation_order.lock().clone()
    }

    fn undeployed_error(&self) -> DeploymentError {
        DeploymentError::PluginUndeployed {
            name: self.name().to_owned(),
        }
    }
}

#[derive(Default)]
struct Snapshot {
    by_name: HashMap<Arc<str>, DeploymentHandle>,
    order: Vec<Arc<str>>,
}

struct ManagerState {
    listeners: Vec<Arc<dyn DeploymentListener>>,
    stopped: bool,
}

/// [`DeploymentManager`] 的装配器。
pub struct DeploymentBuilder {
    shared_name: String,
    host_units: UnitSet,
    shared_units: UnitSet,
    shared_visibility: VisibilityFilter,
    plugin_visibility: VisibilityFilter,
    access_log: Option<AccessLogFilter>,
    observer: ObserverSettings,
    factory: Arc<dyn ObjectFactory>,
    host_container: Option<ContainerHandle>,
}

impl Default for DeploymentBuilder {
    fn default() -> Self {
        Self {
            shared_name: "shared".to_owned(),
            host_units: UnitSet::new(),
            shared_units: UnitSet::new(),
            shared_visibility: VisibilityFilter::allow_all(),
            plugin_visibility: VisibilityFilter::allow_all(),
            access_log: None,
            observer: ObserverSettings::default(),
            factory: Arc::new(DefaultObjectFactory),
            host_container: None,
        }
    }
}

impl DeploymentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以宿主配置预填可见性、审计过滤与观测参数。
    pub fn from_settings(settings: &HostSettings) -> Result<Self, SettingsError> {
        Ok(Self {
            shared_name: format!("{}-shared", settings.container.name),
            shared_visibility: settings.shared_visibility(),
            plugin_visibility: settings.plugin_visibility(),
            access_log: settings.access_log_filter()?,
            observer: settings.observer(),
            ..Self::default()
        })
    }

    pub fn shared_name(mut self, name: impl Into<String>) -> Self {
        self.shared_name = name.into();
        self
    }

    /// 宿主边界上的单元，共享域按父优先解析它们。
    pub fn host_units(mut self, units: UnitSet) -> Self {
        self.host_units = units;
        self
    }

    pub fn shared_units(mut self, units: UnitSet) -> Self {
        self.shared_units = units;
        self
    }

    pub fn shared_visibility(mut self, visibility: VisibilityFilter) -> Self {
        self.shared_visibility = visibility;
        self
    }

    pub fn plugin_visibility(mut self, visibility: VisibilityFilter) -> Self {
        self.plugin_visibility = visibility;
        self
    }

    pub fn access_log(mut self, filter: AccessLogFilter) -> Self {
        self.access_log = Some(filter);
        self
    }

    pub fn observer(mut self, settings: ObserverSettings) -> Self {
        self.observer = settings;
        self
    }

    pub fn factory(mut self, factory: Arc<dyn ObjectFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// 插件依赖槽位从该宿主容器解析。
    pub fn host_container(mut self, container: ContainerHandle) -> Self {
        self.host_container = Some(container);
        self
    }

    pub fn build(self) -> Result<DeploymentManager, DeploymentError> {
        let observer = FinalizationObserver::start(self.observer)
            .map_err(|source| DeploymentError::Observer { source })?;
        let shared = IsolationDomain::shared(
            self.shared_name,
            Arc::new(HostBoundary::new(self.host_units)),
            self.shared_units,
            self.shared_visibility,
        );
        Ok(DeploymentManager {
            shared,
            plugin_visibility: self.plugin_visibility,
            permissions: PermissionRegistry::new(self.access_log),
            observer,
            controller: LifecycleController::new(self.factory),
            host_container: self.host_container,
            transitions: Mutex::new(ManagerState {
                listeners: Vec::new(),
                stopped: false,
            }),
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
        })
    }
}

/// 部署管理器。
///
/// # 教案级注释
/// - **设计目的 (Why)**：以显式对象承载全部部署，测试与多宿主场景可以各自构造；
/// - **关键流程 (How)**：
///   1. `deploy`：建插件域 → 登记能力 → 发布快照 → `deployed`；
///   2. `get_plugin`：快照取部署 → 缓存命中直接返回，否则在该单元的创建闸门内加载并实例化；
///   3. `undeploy`：意向广播（可否决）→ 提交拆除 → `undeployed`。
pub struct DeploymentManager {
    shared: IsolationDomain,
    plugin_visibility: VisibilityFilter,
    permissions: PermissionRegistry,
    observer: FinalizationObserver,
    controller: LifecycleController,
    host_container: Option<ContainerHandle>,
    transitions: Mutex<ManagerState>,
    snapshot: ArcSwap<Snapshot>,
}

impl fmt::Debug for DeploymentManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentManager")
            .field("shared", &self.shared)
            .field("deployments", &self.deployment_names())
            .field("observer", &self.observer)
            .finish()
    }
}

impl DeploymentManager {
    pub fn builder() -> DeploymentBuilder {
        DeploymentBuilder::new()
    }

    pub fn shared_domain(&self) -> &IsolationDomain {
        &self.shared
    }

    pub fn permissions(&self) -> &PermissionRegistry {
        &self.permissions
    }

    pub fn host_capabilities(&self) -> Capabilities {
        self.permissions.host()
    }

    pub fn observer(&self) -> &FinalizationObserver {
        &self.observer
    }

    pub fn add_listener(&self, listener: Arc<dyn DeploymentListener>) {
        self.transitions.lock().listeners.push(listener);
    }

    pub fn deployment(&self, name: &str) -> Option<DeploymentHandle> {
        self.snapshot.load().by_name.get(name).cloned()
    }

    /// 当前部署名，按部署顺序。
    pub fn deployment_names(&self) -> Vec<String> {
        self.snapshot
            .load()
            .order
            .iter()
            .map(|name| name.to_string())
            .collect()
    }

    pub fn is_deployed(&self, name: &str) -> bool {
        self.snapshot.load().by_name.contains_key(name)
    }

    /// 部署一组单元。
    ///
    /// - **错误**：同名部署存在时返回 [`DeploymentError::DuplicateDeployment`]；管理器已关闭时返回 `ShutDown`。
    pub fn deploy(
        &self,
        name: &str,
        units: UnitSet,
        permissions: PermissionSet,
    ) -> Result<DeploymentHandle, DeploymentError> {
        let state = self.transitions.lock();
        if state.stopped {
            return Err(DeploymentError::ShutDown);
        }
        if self.is_deployed(name) {
            return Err(DeploymentError::DuplicateDeployment {
                name: name.to_owned(),
            });
        }

        let unit_count = units.len();
        let domain = IsolationDomain::plugin(
            name.to_owned(),
            &self.shared,
            units,
            self.plugin_visibility.clone(),
        );
        let capabilities = self.permissions.register(name, permissions);
        let handle = DeploymentHandle {
            record: Arc::new(DeploymentRecord {
                name: Arc::from(name),
                domain_id: domain.id(),
                capabilities,
                live: RwLock::new(Some(domain)),
                plugins: DashMap::new(),
                gates: DashMap::new(),
                creation_order: Mutex::new(Vec::new()),
            }),
        };

        let current = self.snapshot.load();
        let mut by_name = current.by_name.clone();
        let mut order = current.order.clone();
        by_name.insert(Arc::clone(&handle.record.name), handle.clone());
        order.push(Arc::clone(&handle.record.name));
        self.snapshot.store(Arc::new(Snapshot { by_name, order }));

        info!(
            deployment = %name,
            domain = %handle.domain_id(),
            units = unit_count,
            grants = handle.capabilities().permissions().len(),
            "deployment registered"
        );
        for listener in &state.listeners {
            if let Err(error) = listener.deployed(&handle) {
                warn!(deployment = %name, error = %error, "deployed listener failed");
            }
        }
        Ok(handle)
    }

    /// 两阶段卸载。
    ///
    /// # 教案级注释
    /// - **意向阶段**：按注册顺序同步通知监听器，首个否决即中止，部署、插件与能力均保持原样；
    /// - **提交阶段**：不可中止，逐步拆除，个别插件收尾失败只记录日志；
    /// - **后置条件**：成功后 `is_deployed(name)` 为假，旧句柄的 `get_plugin` 返回 `PluginUndeployed`。
    pub fn undeploy(&self, name: &str) -> Result<(), DeploymentError> {
        let state = self.transitions.lock();
        let handle = self
            .deployment(name)
            .ok_or_else(|| DeploymentError::NoSuchDeployment {
                name: name.to_owned(),
            })?;

        let veto = Veto::new();
        for listener in &state.listeners {
            listener.undeploying(&handle, &veto);
            if let Some(reason) = veto.reason() {
                info!(deployment = %name, reason = %reason, "undeploy vetoed");
                return Err(DeploymentError::UndeployVeto {
                    name: name.to_owned(),
                    reason,
                });
            }
        }

        self.commit_undeploy(&handle);
        for listener in &state.listeners {
            if let Err(error) = listener.undeployed(name) {
                warn!(deployment = %name, error = %error, "undeployed listener failed");
            }
        }
        Ok(())
    }

    fn commit_undeploy(&self, handle: &DeploymentHandle) {
        let record = &handle.record;
        let domain = record.live.write().take();
        {
            let created = record.creation_order.lock();
            for unit in created.iter().rev() {
                if let Some((_, instance)) = record.plugins.remove(unit) {
                    let label = format!("{}/{}", record.name, unit);
                    self.controller.finish(&label, &instance);
                }
            }
            record.plugins.clear();
        }
        record.gates.clear();
        self.permissions.revoke(&record.name);

        if let Some(domain) = domain {
            domain.release();
            self.observer.watch(&domain);
            debug!(
                deployment = %record.name,
                handles = domain.handle_count(),
                "handing released domain to finalization observer"
            );
        }

        let current = self.snapshot.load();
        let mut by_name = current.by_name.clone();
        by_name.remove(&record.name);
        let order = current
            .order
            .iter()
            .filter(|candidate| **candidate != record.name)
            .cloned()
            .collect();
        self.snapshot.store(Arc::new(Snapshot { by_name, order }));
        info!(deployment = %record.name, domain = %record.domain_id, "deployment undeployed");
    }

    /// 强制卸载全部部署（不经否决阶段，逆部署顺序），随后停止回收观测器。
    pub fn shutdown(&self) {
        let mut state = self.transitions.lock();
        if state.stopped {
            return;
        }
        state.stopped = true;
        let names = self.deployment_names();
        info!(deployments = names.len(), "deployment manager shutting down");
        for name in names.iter().rev() {
            if let Some(handle) = self.deployment(name) {
                self.commit_undeploy(&handle);
                for listener in &state.listeners {
                    if let Err(error) = listener.undeployed(name) {
                        warn!(deployment = %name, error = %error, "undeployed listener failed");
                    }
                }
            }
        }
        self.observer.stop();
    }

    /// 按部署名取插件接口。
    pub fn get_plugin_by_name<I>(&self, deployment: &str, unit: &str) -> Result<Arc<I>, DeploymentError>
    where
        I: ?Sized + Send + Sync + 'static,
    {
        let handle = self
            .deployment(deployment)
            .ok_or_else(|| DeploymentError::NoSuchDeployment {
                name: deployment.to_owned(),
            })?;
        self.get_plugin(&handle, unit, None)
    }

    /// 取插件接口视图，首次访问时实例化并缓存。
    pub fn get_plugin<I>(
        &self,
        deployment: &DeploymentHandle,
        unit: &str,
        hook: Option<&dyn PluginHook>,
    ) -> Result<Arc<I>, DeploymentError>
    where
        I: ?Sized + Send + Sync + 'static,
    {
        let instance = self.get_plugin_instance(deployment, unit, hook)?;
        instance
            .interface::<I>()
            .ok_or_else(|| DeploymentError::InterfaceMismatch {
                name: deployment.name().to_owned(),
                unit: unit.to_owned(),
                expected: core::any::type_name::<I>(),
            })
    }

    /// 取类型擦除的插件实例。
    ///
    /// 首次请求在该单元的闸门内完成创建；钩子与构造函数可以安全地请求同一部署的其它单元。
    pub fn get_plugin_instance(
        &self,
        deployment: &DeploymentHandle,
        unit: &str,
        hook: Option<&dyn PluginHook>,
    ) -> Result<Instance, DeploymentError> {
        let record = &deployment.record;
        if deployment.is_undeployed() {
            return Err(deployment.undeployed_error());
        }
        if let Some(instance) = record.plugins.get(unit).map(|entry| entry.value().clone()) {
            return Ok(instance);
        }

        let gate = Arc::clone(
            record
                .gates
                .entry(unit.to_owned())
                .or_default()
                .value(),
        );
        let current = thread::current().id();
        if *gate.owner.lock() == Some(current) {
            return Err(DeploymentError::ReentrantInstantiation {
                name: deployment.name().to_owned(),
                unit: unit.to_owned(),
            });
        }
        let _serial = gate.lock.lock();
        *gate.owner.lock() = Some(current);
        let _mark = OwnerMark(&gate);

        if let Some(instance) = record.plugins.get(unit).map(|entry| entry.value().clone()) {
            return Ok(instance);
        }
        let domain = record
            .live
            .read()
            .clone()
            .ok_or_else(|| deployment.undeployed_error())?;

        let instantiation = |source: ComponentError| DeploymentError::Instantiation {
            name: deployment.name().to_owned(),
            unit: unit.to_owned(),
            source,
        };
        let loaded = domain
            .load_unit(unit)
            .map_err(|source| DeploymentError::PluginNotFound {
                name: deployment.name().to_owned(),
                unit: unit.to_owned(),
                source,
            })?;
        let context = PluginContext {
            deployment: Arc::clone(&record.name),
            capabilities: record.capabilities.clone(),
            domain,
        };
        if let Some(hook) = hook {
            hook.before_create(&context, &loaded).map_err(instantiation)?;
        }

        let mut base = Dependencies::new();
        base.insert_extension(Arc::new(context.clone()));
        let instance = self
            .controller
            .inject(&loaded.implementation, base, |slot| self.resolve_host_slot(slot))
            .and_then(|dependencies| {
                self.controller
                    .activate(None, &loaded.implementation, &dependencies)
            })
            .map_err(instantiation)?;

        if let Some(hook) = hook {
            hook.after_create(&context, &instance);
        }

        // 卸载先取走 live 再锁 creation_order，两者在此处的次序决定由谁收尾新实例。
        let mut created = record.creation_order.lock();
        if record.live.read().is_none() {
            drop(created);
            let label = format!("{}/{}", record.name, unit);
            self.controller.finish(&label, &instance);
            return Err(deployment.undeployed_error());
        }
        record.plugins.insert(unit.to_owned(), instance.clone());
        created.push(unit.to_owned());
        drop(created);
        debug!(
            deployment = %record.name,
            unit = %unit,
            origin = %loaded.origin,
            "plugin instantiated"
        );
        Ok(instance)
    }

    fn resolve_host_slot(&self, slot: &DependencySlot) -> Result<Injection, ComponentError> {
        let Some(container) = &self.host_container else {
            return Err(ComponentError::new(format!(
                "slot `{}` needs the host container, but none is attached",
                slot.name()
            )));
        };
        match slot.target() {
            DependencyTarget::Container => Ok(Injection::Container(container.clone())),
            DependencyTarget::Request(request_type) => container
                .get_component(request_type)
                .map(Injection::Instance)
                .map_err(|error| {
                    ComponentError::with_source(
                        format!("unsatisfied dependency `{}` ({request_type})", slot.name()),
                        error,
                    )
                }),
        }
    }
}
