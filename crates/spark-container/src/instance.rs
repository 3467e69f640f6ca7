//! 组件实例与类型擦除视图。
//!
//! ## 核心意图（Why）
//! - 容器需要以统一形态持有不同具体类型的组件，同时允许调用方按具体类型或接口（`dyn Trait`）取回；
//! - Rust 无法从 `dyn Any` 直接转换到任意 trait object，因此接口视图在构造时由实现显式登记（见
//!   [`ImplementationBuilder::expose`](crate::ImplementationBuilder::expose)）。
//!
//! ## 行为契约（What）
//! - [`Instance`] 克隆廉价（全部字段为 `Arc`），克隆体指向同一组件；
//! - `downcast` 取回具体类型，`interface` 取回登记过的接口视图，未登记返回 `None`。

use core::any::{Any, TypeId};
use core::fmt;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ComponentError;

/// 由容器托管生命周期的长寿服务。
///
/// - **契约 (What)**：`initialize` 在依赖全部就绪后恰好调用一次；`finish` 仅对成功初始化的实例调用，
///   且同样至多一次。两者默认空实现。
/// - **风险 (Trade-offs)**：两个回调同步执行并阻塞串行的启停流程，耗时操作应自行拆分到后台。
pub trait Component: Any + Send + Sync {
    /// 初始化钩子。
    fn initialize(&self) -> Result<(), ComponentError> {
        Ok(())
    }

    /// 收尾钩子。
    fn finish(&self) -> Result<(), ComponentError> {
        Ok(())
    }
}

pub(crate) type View = Arc<dyn Any + Send + Sync>;

/// 容器持有的组件实例句柄。
#[derive(Clone)]
pub struct Instance {
    implementation: Arc<str>,
    lifecycle: Arc<dyn Component>,
    concrete: Arc<dyn Any + Send + Sync>,
    views: Arc<HashMap<TypeId, View>>,
}

impl Instance {
    /// 包装一个已构造的组件。
    pub fn new<T: Component>(implementation: impl Into<Arc<str>>, value: Arc<T>) -> Self {
        let lifecycle: Arc<dyn Component> = value.clone();
        Self {
            implementation: implementation.into(),
            lifecycle,
            concrete: value,
            views: Arc::new(HashMap::new()),
        }
    }

    pub(crate) fn with_views(mut self, views: HashMap<TypeId, View>) -> Self {
        self.views = Arc::new(views);
        self
    }

    /// 替换生命周期回调的目标，保留具体类型与接口视图。
    ///
    /// 供 [`ObjectFactory::create_public_reference`](crate::ObjectFactory::create_public_reference)
    /// 在实例外包一层（例如计时、追踪）而不影响类型化查找。
    pub fn wrap_lifecycle(&self, lifecycle: Arc<dyn Component>) -> Self {
        Self {
            implementation: Arc::clone(&self.implementation),
            lifecycle,
            concrete: Arc::clone(&self.concrete),
            views: Arc::clone(&self.views),
        }
    }

    /// 实现名称。
    pub fn implementation(&self) -> &str {
        &self.implementation
    }

    /// 生命周期回调目标。
    pub fn lifecycle(&self) -> &Arc<dyn Component> {
        &self.lifecycle
    }

    /// 按具体类型取回组件。
    pub fn downcast<T: Component>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.concrete).downcast::<T>().ok()
    }

    /// 按接口取回组件视图。
    pub fn interface<I>(&self) -> Option<Arc<I>>
    where
        I: ?Sized + Send + Sync + 'static,
    {
        self.views
            .get(&TypeId::of::<I>())
            .and_then(|view| view.downcast_ref::<Arc<I>>())
            .cloned()
    }

    /// 是否登记了给定接口。
    pub fn exposes<I>(&self) -> bool
    where
        I: ?Sized + 'static,
    {
        self.views.contains_key(&TypeId::of::<I>())
    }

    /// 两个句柄是否指向同一组件。
    pub fn same_instance(&self, other: &Instance) -> bool {
        core::ptr::addr_eq(Arc::as_ptr(&self.concrete), Arc::as_ptr(&other.concrete))
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("implementation", &self.implementation)
            .field("interfaces", &self.views.len())
            .finish()
    }
}
