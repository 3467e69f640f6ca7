//! 部署管理器契约测试：否决、提交、插件缓存、能力检查与回收观测。

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use spark_container::{
    Component, ComponentContainer, ComponentError, Implementation, Instance, RequestType,
};
use spark_isolation::{
    DeploymentError, DeploymentHandle, DeploymentListener, DeploymentManager, LoadedUnit,
    ObserverSettings, Permission, PermissionSet, PluginContext, PluginHook, UnitSet, Veto,
};
use tracing_test::traced_test;

#[derive(Clone, Default)]
struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

trait Greeter: Send + Sync {
    fn greet(&self) -> String;
}

struct Hello {
    unit: &'static str,
    deployment: String,
    journal: Journal,
    _context: Option<Arc<PluginContext>>,
}

impl Component for Hello {
    fn finish(&self) -> Result<(), ComponentError> {
        self.journal.push(format!("finish:{}:{}", self.deployment, self.unit));
        Ok(())
    }
}

impl Greeter for Hello {
    fn greet(&self) -> String {
        format!("{} from {}", self.unit, self.deployment)
    }
}

fn hello(unit: &'static str, journal: &Journal, retain_context: bool) -> Implementation {
    let journal = journal.clone();
    Implementation::builder(unit, move |deps| {
        let context = deps
            .extension::<PluginContext>()
            .ok_or_else(|| ComponentError::new("plugin context missing"))?;
        journal.push(format!("construct:{}:{unit}", context.deployment()));
        Ok(Hello {
            unit,
            deployment: context.deployment().to_owned(),
            journal: journal.clone(),
            _context: retain_context.then_some(context),
        })
    })
    .expose::<dyn Greeter, _>(|this| this as Arc<dyn Greeter>)
    .build()
}

fn manager() -> DeploymentManager {
    DeploymentManager::builder()
        .observer(ObserverSettings {
            leak_warning: Duration::from_millis(30),
            poll_interval: Duration::from_millis(5),
        })
        .build()
        .expect("管理器可构建")
}

struct Gatekeeper {
    journal: Journal,
    veto: Mutex<bool>,
}

impl DeploymentListener for Gatekeeper {
    fn deployed(&self, deployment: &DeploymentHandle) -> Result<(), spark_container::BoxError> {
        self.journal.push(format!("deployed:{}", deployment.name()));
        Ok(())
    }

    fn undeploying(&self, deployment: &DeploymentHandle, veto: &Veto) {
        self.journal.push(format!("undeploying:{}", deployment.name()));
        if *self.veto.lock() {
            veto.veto("session still active");
        }
    }

    fn undeployed(&self, name: &str) -> Result<(), spark_container::BoxError> {
        self.journal.push(format!("undeployed:{name}"));
        Err("listener failures are only logged".into())
    }
}

struct Bystander(Journal);

impl DeploymentListener for Bystander {
    fn undeploying(&self, deployment: &DeploymentHandle, _veto: &Veto) {
        self.0.push(format!("bystander:{}", deployment.name()));
    }
}

#[test]
#[traced_test]
fn vetoed_undeploy_changes_nothing_and_commit_is_terminal() {
    let journal = Journal::default();
    let manager = manager();
    let gatekeeper = Arc::new(Gatekeeper {
        journal: journal.clone(),
        veto: Mutex::new(true),
    });
    manager.add_listener(gatekeeper.clone());
    manager.add_listener(Arc::new(Bystander(journal.clone())));

    let handle = manager
        .deploy(
            "billing",
            UnitSet::new()
                .with_unit(hello("invoice", &journal, false))
                .with_unit(hello("ledger", &journal, false)),
            PermissionSet::empty(),
        )
        .expect("首次部署成功");
    let before = manager
        .get_plugin::<dyn Greeter>(&handle, "invoice", None)
        .expect("插件可用");
    manager
        .get_plugin::<dyn Greeter>(&handle, "ledger", None)
        .expect("插件可用");

    match manager.undeploy("billing") {
        Err(DeploymentError::UndeployVeto { name, reason }) => {
            assert_eq!(name, "billing");
            assert_eq!(reason, "session still active");
        }
        other => panic!("应被否决: {other:?}"),
    }
    assert!(manager.is_deployed("billing"));
    assert!(!journal.entries().iter().any(|e| e.starts_with("bystander")));
    let after = manager
        .get_plugin::<dyn Greeter>(&handle, "invoice", None)
        .expect("否决后插件照常可用");
    assert!(Arc::ptr_eq(&before, &after));
    assert!(logs_contain("undeploy vetoed"));

    *gatekeeper.veto.lock() = false;
    manager.undeploy("billing").expect("无否决时卸载成功");
    assert!(!manager.is_deployed("billing"));
    assert!(handle.is_undeployed());
    assert!(matches!(
        manager.get_plugin::<dyn Greeter>(&handle, "invoice", None),
        Err(DeploymentError::PluginUndeployed { .. })
    ));
    assert!(matches!(
        manager.get_plugin_by_name::<dyn Greeter>("billing", "invoice"),
        Err(DeploymentError::NoSuchDeployment { .. })
    ));

    let entries = journal.entries();
    let position = |needle: &str| {
        entries
            .iter()
            .position(|e| e == needle)
            .unwrap_or_else(|| panic!("缺少事件 {needle}: {entries:?}"))
    };
    assert!(position("finish:billing:ledger") < position("finish:billing:invoice"));
    assert!(position("finish:billing:invoice") < position("undeployed:billing"));
    assert!(position("bystander:billing") < position("finish:billing:ledger"));
    assert!(logs_contain("undeployed listener failed"));

    drop(before);
    drop(after);
    assert!(
        manager
            .observer()
            .wait_reclaimed(handle.domain_id(), Duration::from_secs(5))
    );
}

#[test]
fn duplicate_names_are_rejected_until_undeployed() {
    let journal = Journal::default();
    let manager = manager();
    manager
        .deploy("search", UnitSet::new(), PermissionSet::empty())
        .expect("首次部署");
    assert!(matches!(
        manager.deploy("search", UnitSet::new(), PermissionSet::empty()),
        Err(DeploymentError::DuplicateDeployment { .. })
    ));
    manager.undeploy("search").expect("卸载");
    let again = manager
        .deploy(
            "search",
            UnitSet::new().with_unit(hello("query", &journal, false)),
            PermissionSet::empty(),
        )
        .expect("卸载后可重新部署");
    let greeting = manager
        .get_plugin::<dyn Greeter>(&again, "query", None)
        .expect("新部署的插件可用")
        .greet();
    assert_eq!(greeting, "query from search");
    assert!(matches!(
        manager.undeploy("missing"),
        Err(DeploymentError::NoSuchDeployment { .. })
    ));
}

struct CountingHook(Journal);

impl PluginHook for CountingHook {
    fn before_create(&self, context: &PluginContext, unit: &LoadedUnit) -> Result<(), ComponentError> {
        self.0
            .push(format!("before:{}:{}", context.deployment(), unit.implementation.name()));
        Ok(())
    }

    fn after_create(&self, context: &PluginContext, instance: &Instance) {
        self.0
            .push(format!("after:{}:{}", context.deployment(), instance.implementation()));
    }
}

#[test]
fn hooks_run_once_around_first_instantiation() {
    let journal = Journal::default();
    let manager = manager();
    let handle = manager
        .deploy(
            "reports",
            UnitSet::new().with_unit(hello("daily", &journal, false)),
            PermissionSet::empty(),
        )
        .expect("部署");
    let hook = CountingHook(journal.clone());
    for _ in 0..3 {
        manager
            .get_plugin::<dyn Greeter>(&handle, "daily", Some(&hook))
            .expect("插件可用");
    }
    assert_eq!(
        journal.entries(),
        [
            "before:reports:daily",
            "construct:reports:daily",
            "after:reports:daily"
        ]
    );
    assert_eq!(handle.plugin_names(), ["daily"]);
    assert!(matches!(
        manager.get_plugin::<dyn Greeter>(&handle, "weekly", None),
        Err(DeploymentError::PluginNotFound { .. })
    ));
    assert!(matches!(
        manager.get_plugin::<dyn std::fmt::Debug + Send + Sync>(&handle, "daily", None),
        Err(DeploymentError::InterfaceMismatch { .. })
    ));
}

/// 在 `invoice` 的前置钩子里请求同一部署的 `ledger`，并尝试重入 `invoice` 本身。
struct SiblingLoader {
    manager: Arc<DeploymentManager>,
    journal: Journal,
}

impl PluginHook for SiblingLoader {
    fn before_create(&self, context: &PluginContext, unit: &LoadedUnit) -> Result<(), ComponentError> {
        if unit.implementation.name() != "invoice" {
            return Ok(());
        }
        let handle = self
            .manager
            .deployment(context.deployment())
            .ok_or_else(|| ComponentError::new("deployment vanished"))?;
        let sibling = self
            .manager
            .get_plugin::<dyn Greeter>(&handle, "ledger", None)
            .map_err(|error| ComponentError::new(error.to_string()))?;
        self.journal.push(format!("sibling:{}", sibling.greet()));
        match self.manager.get_plugin_instance(&handle, "invoice", None) {
            Err(DeploymentError::ReentrantInstantiation { unit, .. }) => {
                self.journal.push(format!("reentrant:{unit}"))
            }
            Err(other) => self.journal.push(format!("unexpected:{other}")),
            Ok(_) => self.journal.push("unexpected:instance"),
        }
        Ok(())
    }
}

#[test]
fn hooks_may_request_sibling_units_of_the_same_deployment() {
    let journal = Journal::default();
    let manager = Arc::new(manager());
    let handle = manager
        .deploy(
            "billing",
            UnitSet::new()
                .with_unit(hello("invoice", &journal, false))
                .with_unit(hello("ledger", &journal, false)),
            PermissionSet::empty(),
        )
        .expect("部署");

    let loader = SiblingLoader {
        manager: Arc::clone(&manager),
        journal: journal.clone(),
    };
    let worker_manager = Arc::clone(&manager);
    let worker_handle = handle.clone();
    let (done, outcome) = flume::bounded(1);
    std::thread::spawn(move || {
        let result = worker_manager
            .get_plugin::<dyn Greeter>(&worker_handle, "invoice", Some(&loader))
            .map(|greeter| greeter.greet());
        let _ = done.send(result);
    });

    let greeting = outcome
        .recv_timeout(Duration::from_secs(5))
        .expect("钩子内请求兄弟单元不应阻塞")
        .expect("invoice 创建成功");
    assert_eq!(greeting, "invoice from billing");
    assert_eq!(
        journal.entries(),
        [
            "construct:billing:ledger",
            "sibling:ledger from billing",
            "reentrant:invoice",
            "construct:billing:invoice"
        ]
    );
    assert_eq!(handle.plugin_names(), ["ledger", "invoice"]);
    manager.shutdown();
}

struct Exporter;
impl Component for Exporter {}

fn exporter() -> Implementation {
    Implementation::builder("exporter", |deps| {
        let context = deps
            .extension::<PluginContext>()
            .ok_or_else(|| ComponentError::new("plugin context missing"))?;
        context
            .check(&Permission::new("file", "/srv/exports/daily.csv", "write"))
            .map_err(|denied| ComponentError::with_source("export target not writable", denied))?;
        Ok(Exporter)
    })
    .build()
}

#[test]
fn capabilities_are_checked_through_the_plugin_context() {
    let manager = manager();
    let granted = manager
        .deploy(
            "granted",
            UnitSet::new().with_unit(exporter()),
            PermissionSet::from_permissions([Permission::new("file", "/srv/exports/*", "read,write")]),
        )
        .expect("部署");
    let denied = manager
        .deploy(
            "denied",
            UnitSet::new().with_unit(exporter()),
            PermissionSet::from_permissions([Permission::new("file", "/srv/exports/*", "read")]),
        )
        .expect("部署");

    assert!(manager.get_plugin_instance(&granted, "exporter", None).is_ok());
    match manager.get_plugin_instance(&denied, "exporter", None) {
        Err(DeploymentError::Instantiation { unit, source, .. }) => {
            assert_eq!(unit, "exporter");
            assert!(source.message().contains("not writable"));
        }
        other => panic!("应因权限不足失败: {other:?}"),
    }
    assert!(manager.host_capabilities().is_unrestricted());
    assert!(manager.permissions().is_registered("denied"));
    manager.undeploy("denied").expect("卸载");
    assert!(!manager.permissions().is_registered("denied"));
}

struct Clock;
impl Component for Clock {}

struct Scheduler;
impl Component for Scheduler {}

#[test]
fn plugin_slots_resolve_against_the_host_container() {
    let host = ComponentContainer::new("host");
    host.register_public(
        RequestType::new("clock"),
        Implementation::builder("system-clock", |_| Ok(Clock)).build(),
    )
    .expect("注册宿主组件");
    host.initialize().expect("宿主容器启动");

    let manager = DeploymentManager::builder()
        .host_container(host.handle())
        .build()
        .expect("管理器可构建");
    let scheduler = Implementation::builder("scheduler", |deps| {
        deps.get::<Clock>("clock")?;
        deps.container("host")?;
        Ok(Scheduler)
    })
    .depends_on("clock", RequestType::new("clock"))
    .depends_on_container("host")
    .build();
    let orphan = Implementation::builder("orphan", |_| Ok(Scheduler))
        .depends_on("queue", RequestType::new("queue"))
        .build();
    let handle = manager
        .deploy(
            "cron",
            UnitSet::new().with_unit(scheduler).with_unit(orphan),
            PermissionSet::empty(),
        )
        .expect("部署");

    let instance = manager
        .get_plugin_instance(&handle, "scheduler", None)
        .expect("宿主依赖可注入");
    assert!(instance.downcast::<Scheduler>().is_some());
    assert!(matches!(
        manager.get_plugin_instance(&handle, "orphan", None),
        Err(DeploymentError::Instantiation { .. })
    ));
}

#[test]
#[traced_test]
fn retained_plugin_reference_is_reported_until_dropped() {
    let journal = Journal::default();
    let manager = manager();
    let handle = manager
        .deploy(
            "sticky",
            UnitSet::new().with_unit(hello("holder", &journal, true)),
            PermissionSet::empty(),
        )
        .expect("部署");
    let leaked = manager
        .get_plugin::<dyn Greeter>(&handle, "holder", None)
        .expect("插件可用");

    manager.undeploy("sticky").expect("卸载同步完成");
    let observer = manager.observer();
    assert!(!observer.wait_reclaimed(handle.domain_id(), Duration::from_millis(150)));
    assert!(observer.is_outstanding(handle.domain_id()));
    assert!(logs_contain("not reclaimed after release"));
    assert_eq!(leaked.greet(), "holder from sticky");

    drop(leaked);
    assert!(observer.wait_reclaimed(handle.domain_id(), Duration::from_secs(5)));
    assert!(observer.reclaimed_count() >= 1);
    assert!(logs_contain("isolation domain reclaimed"));
}

#[test]
fn shutdown_forces_reverse_undeploy_and_refuses_new_work() {
    let journal = Journal::default();
    let manager = manager();
    let gatekeeper = Arc::new(Gatekeeper {
        journal: journal.clone(),
        veto: Mutex::new(true),
    });
    manager.add_listener(gatekeeper);
    for name in ["first", "second", "third"] {
        manager
            .deploy(name, UnitSet::new(), PermissionSet::empty())
            .expect("部署");
    }
    assert_eq!(manager.deployment_names(), ["first", "second", "third"]);
    assert!(manager.deployment("second").is_some());

    manager.shutdown();
    manager.shutdown();
    assert!(manager.deployment_names().is_empty());
    let undeployed: Vec<String> = journal
        .entries()
        .into_iter()
        .filter(|entry| entry.starts_with("undeployed:"))
        .collect();
    assert_eq!(
        undeployed,
        ["undeployed:third", "undeployed:second", "undeployed:first"]
    );
    assert!(!journal.entries().iter().any(|e| e.starts_with("undeploying")));
    assert!(matches!(
        manager.deploy("late", UnitSet::new(), PermissionSet::empty()),
        Err(DeploymentError::ShutDown)
    ));
}
