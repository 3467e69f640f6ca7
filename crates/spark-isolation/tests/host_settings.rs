//! 宿主配置贯通：文件存储中的 TOML → `HostSettings` → 部署管理器的可见性、审计过滤与观测参数。

use std::path::Path;
use std::time::Duration;

use spark_container::{Component, Implementation};
use spark_isolation::{
    DeploymentBuilder, DeploymentError, DomainError, HostSettings, InMemoryFileStore,
    PermissionSet, SettingsError, UnitSet,
};
use tracing_test::traced_test;

const HOST_TOML: &str = r#"
[container]
name = "edge"

[isolation]
plugin_visible_prefixes = ["lib."]
access_log_pattern = "^billing"
leak_warning_ms = 40
observer_poll_ms = 5
"#;

struct Plain;
impl Component for Plain {}

fn plain(name: &'static str) -> Implementation {
    Implementation::builder(name, |_| Ok(Plain)).build()
}

#[test]
#[traced_test]
fn settings_file_drives_visibility_audit_and_observer() {
    let store = InMemoryFileStore::new().with_file("conf/host.toml", HOST_TOML);
    let settings = HostSettings::load(&store, Path::new("conf/host.toml")).expect("配置可读");
    let manager = DeploymentBuilder::from_settings(&settings)
        .expect("审计正则合法")
        .shared_units(
            UnitSet::new()
                .with_unit(plain("lib.json"))
                .with_unit(plain("internal.secrets")),
        )
        .build()
        .expect("管理器可构建");

    assert_eq!(manager.shared_domain().name(), "edge-shared");
    let observer = manager.observer().settings();
    assert_eq!(observer.leak_warning, Duration::from_millis(40));
    assert_eq!(observer.poll_interval, Duration::from_millis(5));

    let billing = manager
        .deploy("billing", UnitSet::new(), PermissionSet::empty())
        .expect("部署 billing");
    let search = manager
        .deploy("search", UnitSet::new(), PermissionSet::empty())
        .expect("部署 search");

    assert!(manager.get_plugin_instance(&billing, "lib.json", None).is_ok());
    match manager.get_plugin_instance(&billing, "internal.secrets", None) {
        Err(DeploymentError::PluginNotFound { unit, source, .. }) => {
            assert_eq!(unit, "internal.secrets");
            assert!(matches!(source, DomainError::NotFound { .. }));
        }
        other => panic!("前缀之外的共享单元不应可见: {other:?}"),
    }

    assert!(search.capabilities().check_action("net", "db", "connect").is_err());
    assert!(!logs_contain("permission check"));
    assert!(billing.capabilities().check_action("net", "db", "connect").is_err());
    assert!(logs_contain("permission check"));
    assert!(logs_contain("granted=false"));

    manager.shutdown();
}

#[test]
fn missing_settings_file_and_bad_pattern_are_reported() {
    let store = InMemoryFileStore::new();
    assert!(matches!(
        HostSettings::load(&store, Path::new("absent.toml")),
        Err(SettingsError::Io(_))
    ));

    let settings = HostSettings::from_toml("[isolation]\naccess_log_pattern = \"(unclosed\"")
        .expect("TOML 本身合法");
    assert!(matches!(
        DeploymentBuilder::from_settings(&settings),
        Err(SettingsError::InvalidPattern(_))
    ));
}
