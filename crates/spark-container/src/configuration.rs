//! 容器配置的序列化形态。
//!
//! # 教案式说明
//! - **意图 (Why)**：组件装配清单需要能被宿主以 JSON 或 TOML 保存、审阅并在下一次启动时重放；
//! - **契约 (What)**：配置只记录“请求类型 → 实现名 + 失败策略”，实现本身由宿主在
//!   [`ImplementationCatalog`](crate::implementation::ImplementationCatalog) 中按名称提供；
//! - **顺序 (How)**：`components` 保持注册顺序，重放时同名请求类型仍遵循“后者覆盖前者”。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::ComponentConfiguration;

/// 一个容器的全部组件配置。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfiguration {
    #[serde(default, rename = "component")]
    pub components: Vec<ComponentConfiguration>,
}

/// 配置编解码错误。
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("container configuration is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("container configuration cannot be rendered as TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("container configuration is not valid TOML: {0}")]
    TomlDeserialize(#[from] toml::de::Error),
}

impl ContainerConfiguration {
    /// 以组件列表构造配置。
    pub fn new(components: Vec<ComponentConfiguration>) -> Self {
        Self { components }
    }

    /// 追加一条组件配置。
    pub fn push(&mut self, component: ComponentConfiguration) {
        self.components.push(component);
    }

    /// 渲染为带缩进的 JSON。
    pub fn to_json(&self) -> Result<String, ConfigurationError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// 从 JSON 文本解析。
    pub fn from_json(text: &str) -> Result<Self, ConfigurationError> {
        Ok(serde_json::from_str(text)?)
    }

    /// 渲染为 TOML，每个组件是一张 `[[component]]` 表。
    pub fn to_toml(&self) -> Result<String, ConfigurationError> {
        Ok(toml::to_string(self)?)
    }

    /// 从 TOML 文本解析。
    pub fn from_toml(text: &str) -> Result<Self, ConfigurationError> {
        Ok(toml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestType;

    #[test]
    fn toml_uses_component_tables_and_defaults_fail_on_error() {
        let parsed = ContainerConfiguration::from_toml(
            r#"
            [[component]]
            request_type = "store"
            implementation = "memory-store"

            [[component]]
            implementation = "janitor"
            fail_on_error = false
            "#,
        )
        .expect("合法 TOML 应能解析");

        assert_eq!(parsed.components.len(), 2);
        assert_eq!(
            parsed.components[0],
            ComponentConfiguration::public(RequestType::new("store"), "memory-store", true)
        );
        assert!(!parsed.components[1].is_public());
        assert!(!parsed.components[1].fail_on_error);
    }

    #[test]
    fn malformed_json_is_reported() {
        let error = ContainerConfiguration::from_json("{ component: ")
            .expect_err("非法 JSON 必须报错");
        assert!(matches!(error, ConfigurationError::Json(_)));
    }
}
