//! # 生命周期控制器
//!
//! ## 核心意图（Why）
//! - 把“组装依赖 → 经工厂实例化 → 调用 `initialize`”与“尽力而为地调用 `finish`”封装为可复用的步骤，
//!   容器启动与插件实例化共用同一套逻辑；
//! - 组件状态机显式建模，非法跃迁在调试构建中即被发现。
//!
//! ## 行为契约（What）
//! - 状态机：`Pending → Initializing → Initialized → Finishing → Finished`，另有 `Initializing → Failed`；
//! - `finish` 失败只记录日志，永不向上升级，保证一个坏组件不会阻塞其余组件的收尾。

use std::sync::Arc;

use tracing::{debug, warn};

use crate::container::ContainerHandle;
use crate::error::ComponentError;
use crate::factory::ObjectFactory;
use crate::implementation::{Dependencies, DependencySlot, Implementation};
use crate::instance::Instance;
use crate::request::RequestType;

/// 单个组件的生命周期状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ComponentState {
    Pending,
    Initializing,
    Initialized,
    Failed,
    Finishing,
    Finished,
}

impl ComponentState {
    /// 状态机是否允许 `self → next`。
    pub fn can_transition_to(self, next: ComponentState) -> bool {
        use ComponentState::*;
        matches!(
            (self, next),
            (Pending, Initializing)
                | (Initializing, Initialized)
                | (Initializing, Failed)
                | (Initialized, Finishing)
                | (Finishing, Finished)
        )
    }

    /// 是否为终态。
    pub fn is_terminal(self) -> bool {
        matches!(self, ComponentState::Failed | ComponentState::Finished)
    }
}

/// 槽位解析结果。
#[derive(Clone, Debug)]
pub enum Injection {
    /// 注入组件实例。
    Instance(Instance),
    /// 注入容器句柄。
    Container(ContainerHandle),
}

/// 容器批量启停前后的回调。
///
/// - **契约 (What)**：`post_initialize` 在全部组件初始化成功后调用一次，`pre_destroy` 在逆序收尾前调用一次；
///   回调期间容器的转换锁仍被持有，回调内只能做只读查找，不能再注册或启停。
/// - 回调失败仅记录 WARN 日志。
pub trait LifecycleListener: Send + Sync {
    /// 启动完成后回调。
    fn post_initialize(&self, container: &ContainerHandle) -> Result<(), ComponentError> {
        let _ = container;
        Ok(())
    }

    /// 关闭开始前回调。
    fn pre_destroy(&self, container: &ContainerHandle) -> Result<(), ComponentError> {
        let _ = container;
        Ok(())
    }
}

/// 生命周期控制器：依赖注入、实例化与收尾的执行者。
#[derive(Clone)]
pub struct LifecycleController {
    factory: Arc<dyn ObjectFactory>,
}

impl core::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("factory", &"ObjectFactory{...}")
            .finish()
    }
}

impl LifecycleController {
    /// 以给定工厂构造控制器。
    pub fn new(factory: Arc<dyn ObjectFactory>) -> Self {
        Self { factory }
    }

    /// 按实现声明的槽位组装依赖包。
    ///
    /// # 教案式说明
    /// - **输入**：`base` 为宿主预先放入的扩展对象；`resolve` 负责把槽位映射为实例或容器句柄；
    /// - **执行逻辑 (How)**：逐槽位解析，实例先交给工厂的 `inject_field`，工厂未接管时执行内置注入；
    /// - **错误 (What)**：任一槽位解析失败立即返回，不做部分注入。
    pub fn inject<R>(
        &self,
        implementation: &Implementation,
        mut base: Dependencies,
        mut resolve: R,
    ) -> Result<Dependencies, ComponentError>
    where
        R: FnMut(&DependencySlot) -> Result<Injection, ComponentError>,
    {
        for slot in implementation.slots() {
            match resolve(slot)? {
                Injection::Instance(value) => {
                    if !self.factory.inject_field(slot, &mut base, &value) {
                        base.insert(slot.name(), value);
                    }
                }
                Injection::Container(handle) => base.insert_container(slot.name(), handle),
            }
        }
        Ok(base)
    }

    /// 经工厂创建实例；公开组件额外生成对外引用。
    pub fn create(
        &self,
        request_type: Option<&RequestType>,
        implementation: &Implementation,
        dependencies: &Dependencies,
    ) -> Result<Instance, ComponentError> {
        match request_type {
            Some(request_type) => {
                let created =
                    self.factory
                        .create_public(request_type, implementation, dependencies)?;
                Ok(self.factory.create_public_reference(request_type, created))
            }
            None => self.factory.create_private(implementation, dependencies),
        }
    }

    /// 创建并初始化实例。
    pub fn activate(
        &self,
        request_type: Option<&RequestType>,
        implementation: &Implementation,
        dependencies: &Dependencies,
    ) -> Result<Instance, ComponentError> {
        let instance = self.create(request_type, implementation, dependencies)?;
        instance.lifecycle().initialize()?;
        debug!(
            implementation = implementation.name(),
            "component initialized"
        );
        Ok(instance)
    }

    /// 尽力而为地收尾单个实例，失败时记录日志并返回错误描述。
    pub fn finish(&self, label: &str, instance: &Instance) -> Option<String> {
        match instance.lifecycle().finish() {
            Ok(()) => {
                debug!(component = label, "component finished");
                None
            }
            Err(error) => {
                warn!(component = label, error = %error, "component finish failed; continuing teardown");
                Some(error.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::DefaultObjectFactory;
    use crate::instance::Component;

    struct Leaf;
    impl Component for Leaf {}

    struct Broken;
    impl Component for Broken {
        fn finish(&self) -> Result<(), ComponentError> {
            Err(ComponentError::new("disk gone"))
        }
    }

    #[test]
    fn state_machine_accepts_only_documented_edges() {
        use ComponentState::*;
        assert!(Pending.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Initialized));
        assert!(!Failed.can_transition_to(Finishing));
        assert!(!Finished.can_transition_to(Initializing));
        assert!(Failed.is_terminal() && Finished.is_terminal());
    }

    #[test]
    fn inject_uses_builtin_injection_when_factory_declines() {
        let controller = LifecycleController::new(Arc::new(DefaultObjectFactory));
        let implementation = Implementation::builder("needs-leaf", |deps| {
            deps.get::<Leaf>("leaf")?;
            Ok(Leaf)
        })
        .depends_on("leaf", RequestType::new("svc.leaf"))
        .build();
        let leaf = Instance::new("leaf", Arc::new(Leaf));

        let deps = controller
            .inject(&implementation, Dependencies::new(), |_| {
                Ok(Injection::Instance(leaf.clone()))
            })
            .expect("注入应成功");
        assert!(deps.instance("leaf").is_ok());
        assert!(controller.activate(None, &implementation, &deps).is_ok());
    }

    #[test]
    fn finish_failure_is_reported_not_raised() {
        let controller = LifecycleController::new(Arc::new(DefaultObjectFactory));
        let broken = Instance::new("broken", Arc::new(Broken));
        assert_eq!(controller.finish("broken", &broken).as_deref(), Some("disk gone"));
    }
}
