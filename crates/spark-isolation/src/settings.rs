//! 宿主配置：容器名称与隔离层参数，以 TOML 书写，全部字段都有默认值。
//!
//! ```toml
//! [container]
//! name = "edge-host"
//!
//! [isolation]
//! shared_visible_prefixes = ["spark."]
//! plugin_visible_prefixes = ["spark.api.", "lib."]
//! access_log_pattern = "^billing"
//! leak_warning_ms = 30000
//! observer_poll_ms = 1000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::collaborators::FileStore;
use crate::domain::VisibilityFilter;
use crate::error::SettingsError;
use crate::observer::ObserverSettings;
use crate::permission::AccessLogFilter;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSection {
    pub name: String,
}

impl Default for ContainerSection {
    fn default() -> Self {
        Self {
            name: "spark-host".to_owned(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationSection {
    /// 共享域可从宿主边界解析的名称前缀。
    pub shared_visible_prefixes: Vec<String>,
    /// 插件域可委托给共享域的名称前缀。
    pub plugin_visible_prefixes: Vec<String>,
    /// 权限审计日志按域名过滤的正则；缺省时不记录。
    pub access_log_pattern: Option<String>,
    pub leak_warning_ms: u64,
    pub observer_poll_ms: u64,
}

impl Default for IsolationSection {
    fn default() -> Self {
        let observer = ObserverSettings::default();
        Self {
            shared_visible_prefixes: vec![String::new()],
            plugin_visible_prefixes: vec![String::new()],
            access_log_pattern: None,
            leak_warning_ms: observer.leak_warning.as_millis() as u64,
            observer_poll_ms: observer.poll_interval.as_millis() as u64,
        }
    }
}

/// 宿主配置根。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    pub container: ContainerSection,
    pub isolation: IsolationSection,
}

impl HostSettings {
    pub fn from_toml(text: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(store: &dyn FileStore, path: &Path) -> Result<Self, SettingsError> {
        let bytes = store.read(path)?;
        Self::from_toml(&String::from_utf8_lossy(&bytes))
    }

    pub fn shared_visibility(&self) -> VisibilityFilter {
        VisibilityFilter::new(self.isolation.shared_visible_prefixes.iter().cloned())
    }

    pub fn plugin_visibility(&self) -> VisibilityFilter {
        VisibilityFilter::new(self.isolation.plugin_visible_prefixes.iter().cloned())
    }

    /// 编译审计过滤正则；未配置时返回 `None`。
    pub fn access_log_filter(&self) -> Result<Option<AccessLogFilter>, SettingsError> {
        self.isolation
            .access_log_pattern
            .as_deref()
            .map(AccessLogFilter::new)
            .transpose()
            .map_err(SettingsError::from)
    }

    pub fn observer(&self) -> ObserverSettings {
        ObserverSettings {
            leak_warning: Duration::from_millis(self.isolation.leak_warning_ms),
            poll_interval: Duration::from_millis(self.isolation.observer_poll_ms.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let settings = HostSettings::from_toml(
            r#"
            [isolation]
            plugin_visible_prefixes = ["lib."]
            leak_warning_ms = 250
            "#,
        )
        .expect("合法 TOML");
        assert_eq!(settings.container.name, "spark-host");
        assert!(settings.plugin_visibility().allows("lib.json"));
        assert!(!settings.plugin_visibility().allows("host.secret"));
        assert!(settings.shared_visibility().allows("anything"));
        assert_eq!(settings.observer().leak_warning, Duration::from_millis(250));
        assert!(settings.access_log_filter().expect("未配置").is_none());
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let settings = HostSettings::from_toml("[isolation]\naccess_log_pattern = \"(unclosed\"")
            .expect("合法 TOML");
        assert!(matches!(
            settings.access_log_filter(),
            Err(SettingsError::InvalidPattern(_))
        ));
    }
}
