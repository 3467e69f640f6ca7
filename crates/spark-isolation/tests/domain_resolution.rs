//! 隔离域解析规则：子优先、父优先、可见性过滤与磁盘/制品资源装配。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use spark_container::{BoxError, Component, Implementation};
use spark_isolation::{
    ArtifactCoordinates, ArtifactResolver, DomainError, DomainKind, FileStore, HostBoundary,
    InMemoryFileStore, IsolationDomain, LocalFileStore, UnitSet, VisibilityFilter,
    deployment_name_from_folder,
};

struct Library(&'static str);
impl Component for Library {}

fn library(name: &'static str, version: &'static str) -> Implementation {
    Implementation::builder(name, move |_| Ok(Library(version))).build()
}

fn version_of(domain: &IsolationDomain, unit: &str) -> &'static str {
    let loaded = domain.load_unit(unit).expect("单元可解析");
    loaded
        .implementation
        .construct(&Default::default())
        .expect("构造成功")
        .downcast::<Library>()
        .expect("类型匹配")
        .0
}

fn hierarchy(plugin_visibility: VisibilityFilter) -> (IsolationDomain, IsolationDomain) {
    let host = Arc::new(HostBoundary::new(
        UnitSet::new()
            .with_unit(library("host.internal.secrets", "host"))
            .with_unit(library("lib.json", "host-json")),
    ));
    let shared = IsolationDomain::shared(
        "shared",
        host,
        UnitSet::new()
            .with_unit(library("lib.json", "shared-json"))
            .with_unit(library("lib.xml", "shared-xml"))
            .with_resource("host.internal/config.toml", "secret = true")
            .with_resource("lib.xml/schema.xsd", "<xsd/>"),
        VisibilityFilter::new(["lib.", "host.internal."]),
    );
    let plugin = IsolationDomain::plugin(
        "billing",
        &shared,
        UnitSet::new()
            .with_unit(library("lib.json", "plugin-json"))
            .with_unit(library("billing.core", "billing")),
        plugin_visibility,
    );
    (shared, plugin)
}

#[test]
fn plugin_prefers_its_own_copy_and_falls_back_to_shared() {
    let (shared, plugin) = hierarchy(VisibilityFilter::new(["lib."]));
    assert_eq!(plugin.kind(), DomainKind::Plugin);
    assert_eq!(shared.kind(), DomainKind::Shared);
    assert_eq!(plugin.parent().map(IsolationDomain::id), Some(shared.id()));

    assert_eq!(version_of(&plugin, "lib.json"), "plugin-json");
    assert_eq!(plugin.load_unit("lib.json").expect("自有").origin.as_ref(), "billing");
    assert_eq!(version_of(&plugin, "lib.xml"), "shared-xml");
    assert_eq!(plugin.load_unit("lib.xml").expect("委托").origin.as_ref(), "shared");
    assert_eq!(version_of(&plugin, "billing.core"), "billing");
}

#[test]
fn shared_domain_resolves_parent_first_against_the_host() {
    let (shared, _plugin) = hierarchy(VisibilityFilter::deny_all());
    assert_eq!(version_of(&shared, "lib.json"), "host-json");
    assert_eq!(shared.load_unit("lib.json").expect("宿主").origin.as_ref(), "host");
    assert_eq!(version_of(&shared, "lib.xml"), "shared-xml");
}

#[test]
fn visibility_hides_parent_entries_but_never_own_units() {
    let (_shared, plugin) = hierarchy(VisibilityFilter::new(["lib."]));
    assert_eq!(
        plugin.load_unit("host.internal.secrets").expect_err("宿主内部不可见"),
        DomainError::NotFound {
            domain: "billing".to_owned(),
            name: "host.internal.secrets".to_owned(),
        }
    );
    assert!(matches!(
        plugin.load_resource("host.internal/config.toml"),
        Err(DomainError::NotFound { .. })
    ));
    let schema = plugin
        .load_resource("lib.xml/schema.xsd")
        .expect("前缀允许的资源可见");
    assert_eq!(schema.contents.as_ref(), b"<xsd/>");
    assert_eq!(schema.origin.as_ref(), "shared");

    let (_shared, sealed) = hierarchy(VisibilityFilter::deny_all());
    assert_eq!(version_of(&sealed, "billing.core"), "billing");
    assert!(sealed.load_unit("lib.xml").is_err());
}

#[test]
fn resources_are_collected_recursively_from_a_folder() {
    let store = InMemoryFileStore::new()
        .with_file("plugins/billing/plugin.toml", "name = 'billing'")
        .with_file("plugins/billing/templates/invoice.html", "<html/>")
        .with_file("plugins/other/readme", "x");
    let folder = Path::new("plugins/billing");
    let units = UnitSet::new()
        .with_resources_from_dir(&store, folder)
        .expect("目录可枚举");
    let names: Vec<&str> = units.resource_names().collect();
    assert_eq!(names, ["plugin.toml", "templates/invoice.html"]);
    assert_eq!(deployment_name_from_folder(folder).as_deref(), Some("billing"));

    let missing = UnitSet::new().with_resources_from_dir(&store, Path::new("plugins/none"));
    assert!(missing.is_err());
}

#[test]
fn local_store_round_trips_through_the_file_system() {
    let root = std::env::temp_dir().join(format!("spark-isolation-{}", std::process::id()));
    let store = LocalFileStore::new(&root);
    store
        .write(Path::new("bundle/conf/app.toml"), b"port = 8080")
        .expect("写入");
    store
        .rename(Path::new("bundle/conf/app.toml"), Path::new("bundle/app.toml"))
        .expect("重命名");
    let units = UnitSet::new()
        .with_resources_from_dir(&store, Path::new("bundle"))
        .expect("目录可枚举");
    assert_eq!(
        units.resource("app.toml").map(|bytes| bytes.as_ref()),
        Some(&b"port = 8080"[..])
    );
    assert!(units.resource("conf/app.toml").is_none());
    std::fs::remove_dir_all(&root).expect("清理临时目录");
}

struct FixedResolver;

impl ArtifactResolver for FixedResolver {
    fn resolve(&self, coordinates: &ArtifactCoordinates) -> Result<Vec<PathBuf>, BoxError> {
        if coordinates.artifact != "billing" {
            return Err(format!("unknown artifact {coordinates}").into());
        }
        Ok(vec![PathBuf::from("repo/billing-1.0.zip")])
    }
}

#[test]
fn artifact_files_become_resources() {
    let store = InMemoryFileStore::new().with_file("repo/billing-1.0.zip", "PK");
    let coordinates: ArtifactCoordinates = "org.example:billing:1.0".parse().expect("坐标合法");
    let units = UnitSet::new()
        .with_artifact(&store, &FixedResolver, &coordinates)
        .expect("制品可解析");
    assert_eq!(units.resource("billing-1.0.zip").map(|b| b.len()), Some(2));

    let unknown: ArtifactCoordinates = "org.example:search:1.0:zip".parse().expect("坐标合法");
    assert!(UnitSet::new().with_artifact(&store, &FixedResolver, &unknown).is_err());
}
