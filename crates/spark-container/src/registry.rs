//! # 组件注册表
//!
//! ## 核心意图（Why）
//! - 在容器启动前收集全部组件配置：公开组件以请求类型为键，同一请求类型后注册者胜出；
//! - 私有组件没有请求类型，每次注册都得到独立的 [`ComponentId`]，彼此永不覆盖。
//!
//! ## 行为契约（What）
//! - 注册顺序由单调递增的序号表达；覆盖公开组件时，新注册取得新的序号，旧候选被移出活动集合；
//! - 注册表本身不做并发控制，由容器的转换锁串行保护。

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::implementation::Implementation;
use crate::request::{ComponentId, RequestType};

const fn default_fail_on_error() -> bool {
    true
}

/// 组件配置：可序列化的注册记录。
///
/// - `request_type` 为 `None` 即私有组件；
/// - `fail_on_error` 为 `true` 时初始化失败将终止整个启动流程。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_type: Option<RequestType>,
    pub implementation: String,
    #[serde(default = "default_fail_on_error")]
    pub fail_on_error: bool,
}

impl ComponentConfiguration {
    /// 公开组件配置。
    pub fn public(
        request_type: RequestType,
        implementation: impl Into<String>,
        fail_on_error: bool,
    ) -> Self {
        Self {
            request_type: Some(request_type),
            implementation: implementation.into(),
            fail_on_error,
        }
    }

    /// 私有组件配置。
    pub fn private(implementation: impl Into<String>, fail_on_error: bool) -> Self {
        Self {
            request_type: None,
            implementation: implementation.into(),
            fail_on_error,
        }
    }

    /// 是否为公开组件。
    pub fn is_public(&self) -> bool {
        self.request_type.is_some()
    }
}

/// 注册表中的一条活动注册。
#[derive(Clone, Debug)]
pub struct Registration {
    id: ComponentId,
    configuration: ComponentConfiguration,
    implementation: Implementation,
}

impl Registration {
    /// 注册标识。
    pub fn id(&self) -> ComponentId {
        self.id
    }

    /// 注册配置。
    pub fn configuration(&self) -> &ComponentConfiguration {
        &self.configuration
    }

    /// 组件实现。
    pub fn implementation(&self) -> &Implementation {
        &self.implementation
    }

    /// 日志与审计使用的组件标签：公开组件取请求类型，私有组件取 `实现名#序号`。
    pub fn label(&self) -> String {
        match &self.configuration.request_type {
            Some(request_type) => request_type.to_string(),
            None => format!("{}{}", self.implementation.name(), self.id),
        }
    }
}

/// 组件注册表。
#[derive(Clone, Debug, Default)]
pub struct ComponentRegistry {
    next_sequence: u64,
    entries: BTreeMap<ComponentId, Registration>,
    public: HashMap<RequestType, ComponentId>,
}

impl ComponentRegistry {
    /// 空注册表。
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记组件。
    ///
    /// # 教案式说明
    /// - **输入**：`request_type` 为 `None` 表示私有组件；`implementation` 决定构造方式与依赖槽位；
    /// - **执行逻辑 (How)**：
    ///   1. 分配新的注册序号；
    ///   2. 公开组件若已有同请求类型的候选，移除旧候选（后注册者胜出）；
    ///   3. 写入活动集合。
    /// - **返回 (What)**：新注册的 [`ComponentId`]。
    pub fn register(
        &mut self,
        request_type: Option<RequestType>,
        implementation: Implementation,
        fail_on_error: bool,
    ) -> ComponentId {
        let id = ComponentId::new(self.next_sequence);
        self.next_sequence += 1;

        if let Some(request_type) = &request_type
            && let Some(previous) = self.public.insert(request_type.clone(), id)
            && let Some(replaced) = self.entries.remove(&previous)
        {
            debug!(
                request_type = %request_type,
                replaced = replaced.implementation.name(),
                implementation = implementation.name(),
                "public component registration overridden"
            );
        }

        let configuration = ComponentConfiguration {
            request_type,
            implementation: implementation.name().to_owned(),
            fail_on_error,
        };
        self.entries.insert(
            id,
            Registration {
                id,
                configuration,
                implementation,
            },
        );
        id
    }

    /// 请求类型是否有活动候选。
    pub fn has_public(&self, request_type: &RequestType) -> bool {
        self.public.contains_key(request_type)
    }

    /// 请求类型当前的活动候选。
    pub fn provider_of(&self, request_type: &RequestType) -> Option<ComponentId> {
        self.public.get(request_type).copied()
    }

    /// 按标识读取注册。
    pub fn get(&self, id: ComponentId) -> Option<&Registration> {
        self.entries.get(&id)
    }

    /// 活动注册，按注册顺序。
    pub fn iter(&self) -> impl Iterator<Item = &Registration> {
        self.entries.values()
    }

    /// 全部公开请求类型。
    pub fn request_types(&self) -> impl Iterator<Item = &RequestType> {
        self.public.keys()
    }

    /// 导出活动注册的配置，按注册顺序。
    pub fn configurations(&self) -> Vec<ComponentConfiguration> {
        self.entries
            .values()
            .map(|registration| registration.configuration.clone())
            .collect()
    }

    /// 活动注册数量。
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
