//! 组件实现描述、依赖槽位与依赖包。
//!
//! ## 核心意图（Why）
//! - 依赖关系在注册时静态声明：每个实现列出若干具名槽位，槽位指向某个请求类型或容器自身；
//! - 解析器只读取槽位即可建图，不需要反射实例字段；控制器按槽位组装 [`Dependencies`] 后一次性交给构造函数。
//!
//! ## 行为契约（What）
//! - 注入只发生在构造时，槽位之后不会重新解析；
//! - 构造函数只能看到自身声明过的槽位与宿主附加的扩展对象。

use core::any::{Any, TypeId};
use core::fmt;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::container::ContainerHandle;
use crate::error::ComponentError;
use crate::instance::{Component, Instance, View};
use crate::request::RequestType;

/// 依赖槽位的指向。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DependencyTarget {
    /// 需要某个公开请求类型的组件。
    Request(RequestType),
    /// 需要容器自身的句柄。
    Container,
}

/// 具名依赖槽位。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DependencySlot {
    name: String,
    target: DependencyTarget,
}

impl DependencySlot {
    /// 构造槽位。
    pub fn new(name: impl Into<String>, target: DependencyTarget) -> Self {
        Self {
            name: name.into(),
            target,
        }
    }

    /// 槽位名称。
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 槽位指向。
    pub fn target(&self) -> &DependencyTarget {
        &self.target
    }

    /// 若槽位指向请求类型则返回之。
    pub fn request_type(&self) -> Option<&RequestType> {
        match &self.target {
            DependencyTarget::Request(request) => Some(request),
            DependencyTarget::Container => None,
        }
    }
}

type Constructor = dyn Fn(&Dependencies) -> Result<Instance, ComponentError> + Send + Sync;
type TypedConstructor<T> = dyn Fn(&Dependencies) -> Result<T, ComponentError> + Send + Sync;
type ViewFactory<T> = dyn Fn(&Arc<T>) -> (TypeId, View) + Send + Sync;

/// 类型擦除后的组件实现。
///
/// # 教案式说明
/// - **意图 (Why)**：注册表、解析器与工厂只关心“名称 + 槽位 + 如何构造”，不需要知道具体类型；
/// - **契约 (What)**：`name` 在一个 [`ImplementationCatalog`] 内唯一，用于配置的序列化往返；
///   克隆廉价，多个注册可共享同一实现。
#[derive(Clone)]
pub struct Implementation {
    name: Arc<str>,
    slots: Arc<[DependencySlot]>,
    constructor: Arc<Constructor>,
}

impl Implementation {
    /// 以具体类型的构造函数开始描述一个实现。
    pub fn builder<T, F>(name: impl Into<String>, constructor: F) -> ImplementationBuilder<T>
    where
        T: Component,
        F: Fn(&Dependencies) -> Result<T, ComponentError> + Send + Sync + 'static,
    {
        ImplementationBuilder {
            name: name.into(),
            slots: Vec::new(),
            constructor: Arc::new(constructor),
            views: Vec::new(),
        }
    }

    /// 实现名称。
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 全部依赖槽位，按声明顺序。
    pub fn slots(&self) -> &[DependencySlot] {
        &self.slots
    }

    /// 指向请求类型的依赖，按声明顺序。
    pub fn dependencies(&self) -> impl Iterator<Item = &RequestType> {
        self.slots.iter().filter_map(DependencySlot::request_type)
    }

    /// 以组装好的依赖包调用构造函数。
    pub fn construct(&self, dependencies: &Dependencies) -> Result<Instance, ComponentError> {
        (self.constructor)(dependencies)
    }
}

impl fmt::Debug for Implementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Implementation")
            .field("name", &self.name)
            .field("slots", &self.slots)
            .finish()
    }
}

/// [`Implementation`] 的类型化构建器。
pub struct ImplementationBuilder<T> {
    name: String,
    slots: Vec<DependencySlot>,
    constructor: Arc<TypedConstructor<T>>,
    views: Vec<Arc<ViewFactory<T>>>,
}

impl<T: Component> ImplementationBuilder<T> {
    /// 声明一个指向请求类型的依赖槽位。
    pub fn depends_on(mut self, slot: impl Into<String>, request_type: RequestType) -> Self {
        self.slots
            .push(DependencySlot::new(slot, DependencyTarget::Request(request_type)));
        self
    }

    /// 声明一个注入容器自身句柄的槽位。
    pub fn depends_on_container(mut self, slot: impl Into<String>) -> Self {
        self.slots
            .push(DependencySlot::new(slot, DependencyTarget::Container));
        self
    }

    /// 登记接口视图，使实例可以 `interface::<I>()` 的形式被取回。
    ///
    /// - **用法**：`.expose::<dyn Greeter>(|this| this)`，闭包完成 `Arc<T>` 到 `Arc<dyn Greeter>` 的非定长转换；
    /// - **约束**：`I` 需为 `Send + Sync`，即 trait 应以它们为父 trait。
    pub fn expose<I, F>(mut self, view: F) -> Self
    where
        I: ?Sized + Send + Sync + 'static,
        F: Fn(Arc<T>) -> Arc<I> + Send + Sync + 'static,
    {
        self.views.push(Arc::new(move |value: &Arc<T>| {
            let erased: View = Arc::new(view(Arc::clone(value)));
            (TypeId::of::<I>(), erased)
        }));
        self
    }

    /// 完成描述并擦除具体类型。
    pub fn build(self) -> Implementation {
        let name: Arc<str> = Arc::from(self.name);
        let instance_name = Arc::clone(&name);
        let constructor = self.constructor;
        let views = self.views;
        Implementation {
            name,
            slots: Arc::from(self.slots),
            constructor: Arc::new(move |dependencies: &Dependencies| {
                let value = Arc::new(constructor(dependencies)?);
                let mut registered = HashMap::with_capacity(views.len());
                for view in &views {
                    let (type_id, erased) = view(&value);
                    registered.insert(type_id, erased);
                }
                Ok(Instance::new(Arc::clone(&instance_name), value).with_views(registered))
            }),
        }
    }
}

/// 构造函数可见的依赖包。
///
/// - **契约 (What)**：按槽位名称取值；取不到时返回描述清晰的 [`ComponentError`]，构造函数可以直接 `?` 传播；
/// - 扩展对象按类型索引，供宿主附加上下文（例如插件的能力对象）。
#[derive(Clone, Default)]
pub struct Dependencies {
    instances: HashMap<String, Instance>,
    containers: HashMap<String, ContainerHandle>,
    extensions: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Dependencies {
    /// 空依赖包。
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入槽位实例。
    pub fn insert(&mut self, slot: impl Into<String>, instance: Instance) {
        self.instances.insert(slot.into(), instance);
    }

    /// 写入容器句柄。
    pub fn insert_container(&mut self, slot: impl Into<String>, handle: ContainerHandle) {
        self.containers.insert(slot.into(), handle);
    }

    /// 附加扩展对象，同类型后写覆盖先写。
    pub fn insert_extension<E: Any + Send + Sync>(&mut self, value: Arc<E>) {
        self.extensions.insert(TypeId::of::<E>(), value);
    }

    /// 读取槽位实例。
    pub fn instance(&self, slot: &str) -> Result<&Instance, ComponentError> {
        self.instances
            .get(slot)
            .ok_or_else(|| ComponentError::new(format!("dependency slot `{slot}` was not injected")))
    }

    /// 按具体类型读取槽位。
    pub fn get<T: Component>(&self, slot: &str) -> Result<Arc<T>, ComponentError> {
        self.instance(slot)?.downcast::<T>().ok_or_else(|| {
            ComponentError::new(format!(
                "dependency slot `{slot}` does not hold a `{}`",
                core::any::type_name::<T>()
            ))
        })
    }

    /// 按接口读取槽位。
    pub fn interface<I>(&self, slot: &str) -> Result<Arc<I>, ComponentError>
    where
        I: ?Sized + Send + Sync + 'static,
    {
        self.instance(slot)?.interface::<I>().ok_or_else(|| {
            ComponentError::new(format!(
                "dependency slot `{slot}` does not expose `{}`",
                core::any::type_name::<I>()
            ))
        })
    }

    /// 读取容器句柄槽位。
    pub fn container(&self, slot: &str) -> Result<ContainerHandle, ComponentError> {
        self.containers
            .get(slot)
            .cloned()
            .ok_or_else(|| ComponentError::new(format!("container slot `{slot}` was not injected")))
    }

    /// 读取扩展对象。
    pub fn extension<E: Any + Send + Sync>(&self) -> Option<Arc<E>> {
        self.extensions
            .get(&TypeId::of::<E>())
            .and_then(|value| Arc::clone(value).downcast::<E>().ok())
    }

    /// 已注入的槽位数量（不含扩展对象）。
    pub fn len(&self) -> usize {
        self.instances.len() + self.containers.len()
    }

    /// 是否没有任何槽位被注入。
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 实现目录：按名称索引，供配置反序列化时把名称还原为实现。
#[derive(Clone, Debug, Default)]
pub struct ImplementationCatalog {
    entries: BTreeMap<String, Implementation>,
}

impl ImplementationCatalog {
    /// 空目录。
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记实现；同名实现后写覆盖先写并返回旧值。
    pub fn insert(&mut self, implementation: Implementation) -> Option<Implementation> {
        self.entries
            .insert(implementation.name().to_owned(), implementation)
    }

    /// 链式登记。
    pub fn with(mut self, implementation: Implementation) -> Self {
        self.insert(implementation);
        self
    }

    /// 按名称查找。
    pub fn get(&self, name: &str) -> Option<&Implementation> {
        self.entries.get(name)
    }

    /// 已登记的名称，按字典序。
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}
