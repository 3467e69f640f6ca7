//! 可插拔对象工厂。
//!
//! ## 角色定位（Why）
//! - 控制器不直接调用实现的构造函数，而是经由 [`ObjectFactory`]，以便宿主在实例化前后插入代理、计时或追踪；
//! - `inject_field` 允许工厂接管单个槽位的注入，返回 `false` 时由控制器执行内置注入。

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use crate::error::ComponentError;
use crate::implementation::{Dependencies, DependencySlot, Implementation};
use crate::instance::{Component, Instance};
use crate::request::RequestType;

/// 组件实例化策略。
///
/// # 契约说明 (What)
/// - `create_public` / `create_private`：返回新实例，默认直接调用实现的构造函数；
/// - `create_public_reference`：为公开组件生成对外引用，默认原样返回，可包装生命周期回调；
/// - `inject_field`：接管槽位注入，返回 `true` 表示已自行写入 `target`。
pub trait ObjectFactory: Send + Sync {
    /// 创建公开组件实例。
    fn create_public(
        &self,
        request_type: &RequestType,
        implementation: &Implementation,
        dependencies: &Dependencies,
    ) -> Result<Instance, ComponentError> {
        let _ = request_type;
        implementation.construct(dependencies)
    }

    /// 创建私有组件实例。
    fn create_private(
        &self,
        implementation: &Implementation,
        dependencies: &Dependencies,
    ) -> Result<Instance, ComponentError> {
        implementation.construct(dependencies)
    }

    /// 生成公开组件的对外引用。
    fn create_public_reference(&self, request_type: &RequestType, instance: Instance) -> Instance {
        let _ = request_type;
        instance
    }

    /// 接管槽位注入。
    fn inject_field(
        &self,
        slot: &DependencySlot,
        target: &mut Dependencies,
        value: &Instance,
    ) -> bool {
        let _ = (slot, target, value);
        false
    }
}

/// 全部采用默认行为的工厂。
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultObjectFactory;

impl ObjectFactory for DefaultObjectFactory {}

/// 为每次实例化与生命周期回调输出 `tracing` 事件的装饰工厂。
///
/// 公开组件的对外引用会被 [`TracedComponent`] 包裹，`initialize`/`finish` 的耗时以 DEBUG 级别记录。
#[derive(Clone, Debug, Default)]
pub struct TracingObjectFactory<F = DefaultObjectFactory> {
    inner: F,
}

impl<F: ObjectFactory> TracingObjectFactory<F> {
    /// 装饰给定工厂。
    pub fn new(inner: F) -> Self {
        Self { inner }
    }
}

impl<F: ObjectFactory> ObjectFactory for TracingObjectFactory<F> {
    fn create_public(
        &self,
        request_type: &RequestType,
        implementation: &Implementation,
        dependencies: &Dependencies,
    ) -> Result<Instance, ComponentError> {
        debug!(
            request_type = %request_type,
            implementation = implementation.name(),
            slots = dependencies.len(),
            "creating public component"
        );
        self.inner
            .create_public(request_type, implementation, dependencies)
    }

    fn create_private(
        &self,
        implementation: &Implementation,
        dependencies: &Dependencies,
    ) -> Result<Instance, ComponentError> {
        debug!(
            implementation = implementation.name(),
            slots = dependencies.len(),
            "creating private component"
        );
        self.inner.create_private(implementation, dependencies)
    }

    fn create_public_reference(&self, request_type: &RequestType, instance: Instance) -> Instance {
        let instance = self.inner.create_public_reference(request_type, instance);
        let traced = TracedComponent {
            label: request_type.to_string(),
            inner: Arc::clone(instance.lifecycle()),
        };
        instance.wrap_lifecycle(Arc::new(traced))
    }

    fn inject_field(
        &self,
        slot: &DependencySlot,
        target: &mut Dependencies,
        value: &Instance,
    ) -> bool {
        trace!(
            slot = slot.name(),
            implementation = value.implementation(),
            "injecting dependency"
        );
        self.inner.inject_field(slot, target, value)
    }
}

struct TracedComponent {
    label: String,
    inner: Arc<dyn Component>,
}

impl Component for TracedComponent {
    fn initialize(&self) -> Result<(), ComponentError> {
        let started = Instant::now();
        let result = self.inner.initialize();
        debug!(
            component = %self.label,
            elapsed_us = started.elapsed().as_micros() as u64,
            ok = result.is_ok(),
            "component initialize returned"
        );
        result
    }

    fn finish(&self) -> Result<(), ComponentError> {
        let started = Instant::now();
        let result = self.inner.finish();
        debug!(
            component = %self.label,
            elapsed_us = started.elapsed().as_micros() as u64,
            ok = result.is_ok(),
            "component finish returned"
        );
        result
    }
}
