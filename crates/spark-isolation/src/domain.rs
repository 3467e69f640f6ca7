//! # 隔离域
//!
//! ## 核心意图（Why）
//! - 每个插件部署拥有独立的命名空间，可以携带与宿主共享域不同版本的单元；
//! - 可见性前缀阻止插件经由父级触达宿主内部命名空间。
//!
//! ## 解析规则（What）
//! - **插件域**：子优先，先查自身单元，未命中且名称通过可见性过滤时才委托父域；
//! - **共享域**：父优先，名称通过过滤时先查宿主边界，再查自身单元；
//! - 可见性只约束向父级的委托，域自身的单元始终可见；
//! - 释放后的域对任何请求返回 [`DomainError::Released`]。
//!
//! ## 回收观测（How）
//! - 释放时挂上一张回收通知，域的最后一个引用被丢弃时通知经 `flume` 发往观测线程；
//! - 观测是旁路的，释放本身同步完成，不等待回收。

use core::fmt;
use std::collections::BTreeMap;
use std::io;
use std::path::{Component as PathComponent, Path};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use spark_container::{BoxError, Implementation};
use tracing::debug;

use crate::collaborators::{ArtifactCoordinates, ArtifactResolver, FileStore};
use crate::error::DomainError;
use crate::observer::ReclaimNotice;
use crate::permission::HOST_DOMAIN;

static NEXT_DOMAIN: AtomicU64 = AtomicU64::new(1);

/// 进程内唯一的域标识；同名部署重新部署后得到新的标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainId(u64);

impl DomainId {
    fn next() -> Self {
        Self(NEXT_DOMAIN.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "domain#{}", self.0)
    }
}

/// 域的两种形态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DomainKind {
    /// 宿主范围内唯一，进程生命周期。
    Shared,
    /// 每个部署一个，卸载成功后销毁。
    Plugin,
}

/// 已解析的资源。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resource {
    pub name: Arc<str>,
    pub contents: Bytes,
    /// 实际提供资源的域名称，宿主边界为 `host`。
    pub origin: Arc<str>,
}

/// 已解析的单元。
#[derive(Clone, Debug)]
pub struct LoadedUnit {
    pub implementation: Implementation,
    pub origin: Arc<str>,
}

/// 一组可装入域的单元与资源。
#[derive(Clone, Debug, Default)]
pub struct UnitSet {
    units: BTreeMap<String, Implementation>,
    resources: BTreeMap<String, Bytes>,
}

impl UnitSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以实现名作为单元名登记。
    pub fn with_unit(mut self, implementation: Implementation) -> Self {
        self.insert_unit(implementation);
        self
    }

    pub fn insert_unit(&mut self, implementation: Implementation) -> Option<Implementation> {
        self.units
            .insert(implementation.name().to_owned(), implementation)
    }

    pub fn with_resource(mut self, name: impl Into<String>, contents: impl Into<Bytes>) -> Self {
        self.resources.insert(name.into(), contents.into());
        self
    }

    /// 把 `dir` 下的全部文件登记为资源，资源名为以 `/` 连接的相对路径。
    pub fn with_resources_from_dir(mut self, store: &dyn FileStore, dir: &Path) -> io::Result<Self> {
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            for entry in store.list(&current)? {
                if entry.is_dir {
                    pending.push(entry.path);
                    continue;
                }
                let contents = store.read(&entry.path)?;
                let name = relative_name(dir, &entry.path);
                self.resources.insert(name, contents);
            }
        }
        Ok(self)
    }

    /// 经制品解析服务取回文件，按文件名登记为资源。
    pub fn with_artifact(
        mut self,
        store: &dyn FileStore,
        resolver: &dyn ArtifactResolver,
        coordinates: &ArtifactCoordinates,
    ) -> Result<Self, BoxError> {
        for path in resolver.resolve(coordinates)? {
            let contents = store.read(&path)?;
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string_lossy().into_owned());
            self.resources.insert(name, contents);
        }
        Ok(self)
    }

    pub fn unit(&self, name: &str) -> Option<&Implementation> {
        self.units.get(name)
    }

    pub fn resource(&self, name: &str) -> Option<&Bytes> {
        self.resources.get(name)
    }

    pub fn unit_names(&self) -> impl Iterator<Item = &str> {
        self.units.keys().map(String::as_str)
    }

    pub fn resource_names(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.units.len() + self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn relative_name(base: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(base).unwrap_or(path);
    relative
        .components()
        .filter_map(|component| match component {
            PathComponent::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// 允许向父级委托的名称前缀集合。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VisibilityFilter {
    prefixes: Arc<[String]>,
}

impl VisibilityFilter {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }

    /// 空前缀匹配一切名称。
    pub fn allow_all() -> Self {
        Self::new([""])
    }

    /// 不允许任何委托。
    pub fn deny_all() -> Self {
        Self::default()
    }

    pub fn allows(&self, name: &str) -> bool {
        self.prefixes.iter().any(|prefix| name.starts_with(prefix.as_str()))
    }

    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        self.prefixes.iter().map(String::as_str)
    }
}

/// 共享域之上的宿主命名空间。
#[derive(Debug, Default)]
pub struct HostBoundary {
    units: UnitSet,
}

impl HostBoundary {
    pub fn new(units: UnitSet) -> Self {
        Self { units }
    }

    pub fn units(&self) -> &UnitSet {
        &self.units
    }
}

enum Parent {
    Host(Arc<HostBoundary>),
    Domain(IsolationDomain),
}

struct DomainInner {
    id: DomainId,
    name: Arc<str>,
    kind: DomainKind,
    parent: Parent,
    visibility: VisibilityFilter,
    contents: RwLock<Option<UnitSet>>,
    reclaim: Mutex<Option<ReclaimNotice>>,
}

impl Drop for DomainInner {
    fn drop(&mut self) {
        if let Some(notice) = self.reclaim.get_mut().take() {
            notice.fire();
        }
    }
}

/// 隔离域句柄，克隆即共享同一个域。
#[derive(Clone)]
pub struct IsolationDomain {
    inner: Arc<DomainInner>,
}

impl fmt::Debug for IsolationDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolationDomain")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("released", &self.is_released())
            .finish()
    }
}

impl IsolationDomain {
    /// 构造父优先的共享域。
    pub fn shared(
        name: impl Into<Arc<str>>,
        host: Arc<HostBoundary>,
        units: UnitSet,
        visibility: VisibilityFilter,
    ) -> Self {
        Self::build(name.into(), DomainKind::Shared, Parent::Host(host), units, visibility)
    }

    /// 构造子优先的插件域。
    pub fn plugin(
        name: impl Into<Arc<str>>,
        parent: &IsolationDomain,
        units: UnitSet,
        visibility: VisibilityFilter,
    ) -> Self {
        Self::build(
            name.into(),
            DomainKind::Plugin,
            Parent::Domain(parent.clone()),
            units,
            visibility,
        )
    }

    fn build(
        name: Arc<str>,
        kind: DomainKind,
        parent: Parent,
        units: UnitSet,
        visibility: VisibilityFilter,
    ) -> Self {
        Self {
            inner: Arc::new(DomainInner {
                id: DomainId::next(),
                name,
                kind,
                parent,
                visibility,
                contents: RwLock::new(Some(units)),
                reclaim: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> DomainId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> DomainKind {
        self.inner.kind
    }

    pub fn visibility(&self) -> &VisibilityFilter {
        &self.inner.visibility
    }

    /// 父域；共享域的父级是宿主边界，返回 `None`。
    pub fn parent(&self) -> Option<&IsolationDomain> {
        match &self.inner.parent {
            Parent::Domain(parent) => Some(parent),
            Parent::Host(_) => None,
        }
    }

    pub fn is_released(&self) -> bool {
        self.inner.contents.read().is_none()
    }

    /// 当前持有该域的句柄数量，供泄漏排查使用。
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// 本域自身的单元名称；已释放时为空。
    pub fn unit_names(&self) -> Vec<String> {
        self.inner
            .contents
            .read()
            .as_ref()
            .map(|units| units.unit_names().map(str::to_owned).collect())
            .unwrap_or_default()
    }

    pub fn load_unit(&self, name: &str) -> Result<LoadedUnit, DomainError> {
        self.lookup(name, &|units, name| units.unit(name).cloned())
            .map(|(implementation, origin)| LoadedUnit {
                implementation,
                origin,
            })
    }

    pub fn load_resource(&self, name: &str) -> Result<Resource, DomainError> {
        self.lookup(name, &|units, name| units.resource(name).cloned())
            .map(|(contents, origin)| Resource {
                name: Arc::from(name),
                contents,
                origin,
            })
    }

    fn lookup<T>(
        &self,
        name: &str,
        pick: &dyn Fn(&UnitSet, &str) -> Option<T>,
    ) -> Result<(T, Arc<str>), DomainError> {
        let own = {
            let contents = self.inner.contents.read();
            let units = contents.as_ref().ok_or_else(|| DomainError::Released {
                domain: self.name().to_owned(),
            })?;
            pick(units, name)
        };
        let delegate = self.inner.visibility.allows(name);
        let not_found = || DomainError::NotFound {
            domain: self.name().to_owned(),
            name: name.to_owned(),
        };

        match &self.inner.parent {
            Parent::Domain(parent) => {
                if let Some(found) = own {
                    return Ok((found, Arc::clone(&self.inner.name)));
                }
                if !delegate {
                    return Err(not_found());
                }
                parent.lookup(name, pick).map_err(|error| match error {
                    DomainError::NotFound { .. } => not_found(),
                    other => other,
                })
            }
            Parent::Host(host) => {
                if delegate && let Some(found) = pick(host.units(), name) {
                    return Ok((found, Arc::from(HOST_DOMAIN)));
                }
                own.map(|found| (found, Arc::clone(&self.inner.name)))
                    .ok_or_else(not_found)
            }
        }
    }

    /// 释放自身单元；返回本次调用是否真正完成释放。
    pub fn release(&self) -> bool {
        let released = self.inner.contents.write().take();
        if let Some(units) = &released {
            debug!(
                domain = %self.name(),
                id = %self.id(),
                units = units.len(),
                "isolation domain released"
            );
        }
        released.is_some()
    }

    pub(crate) fn attach_reclaim_notice(&self, notice: ReclaimNotice) {
        *self.inner.reclaim.lock() = Some(notice);
    }
}
