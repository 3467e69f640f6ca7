//! # 权限模型
//!
//! ## 核心意图（Why）
//! - 以紧凑文本声明插件可行使的能力，部署时一次性解析为不可变集合；
//! - 能力以显式对象 [`Capabilities`] 交给插件面向的 API，检查时不查询任何全局状态。
//!
//! ## 声明语法（What）
//! - 每行一条：`class|target[|actions]`，字段两侧空白忽略；
//! - `#` 开头的行与空行被忽略；`${NAME}` 在解析时按 [`EnvLookup`] 替换，未定义即报错；
//! - `target` 为 `*` 匹配任意目标，以 `*` 结尾则按前缀匹配；
//! - `actions` 以逗号分隔，`*` 表示全部动作；能力类 `all` 蕴含一切请求。
//!
//! ## 审计（How）
//! - 配置了 [`AccessLogFilter`] 时，域名匹配该正则的检查结果以 INFO 级别记录，其余域保持静默。

use core::fmt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use tracing::info;

use crate::collaborators::FileStore;
use crate::error::{
    AccessDenied, PermissionParseError, PermissionParseErrorKind, PermissionSourceError,
};

/// 蕴含一切请求的能力类。
pub const ALL_CLASS: &str = "all";
const WILDCARD: &str = "*";
/// 宿主自身的能力域名称。
pub const HOST_DOMAIN: &str = "host";

/// 单条权限：能力类 + 目标 + 动作集合。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Permission {
    class: String,
    target: String,
    actions: BTreeSet<String>,
}

impl Permission {
    /// `actions` 为逗号分隔的动作列表，可以为空。
    pub fn new(class: impl Into<String>, target: impl Into<String>, actions: &str) -> Self {
        Self {
            class: class.into(),
            target: target.into(),
            actions: actions
                .split(',')
                .map(str::trim)
                .filter(|action| !action.is_empty())
                .map(str::to_owned)
                .collect(),
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.actions.iter().map(String::as_str)
    }

    /// 本条授权是否覆盖 `requested`。
    pub fn implies(&self, requested: &Permission) -> bool {
        if self.class == ALL_CLASS {
            return true;
        }
        self.class == requested.class
            && target_matches(&self.target, &requested.target)
            && (self.actions.contains(WILDCARD) || requested.actions.is_subset(&self.actions))
    }
}

fn target_matches(granted: &str, requested: &str) -> bool {
    match granted.strip_suffix('*') {
        Some(prefix) => requested.starts_with(prefix),
        None => granted == requested,
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.class, self.target)?;
        if !self.actions.is_empty() {
            let actions: Vec<&str> = self.actions().collect();
            write!(f, "|{}", actions.join(","))?;
        }
        Ok(())
    }
}

/// 环境变量查询，解析 `${NAME}` 时使用。
pub trait EnvLookup {
    fn var(&self, name: &str) -> Option<String>;
}

/// 读取当前进程环境。
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessEnv;

impl EnvLookup for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl EnvLookup for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

impl EnvLookup for BTreeMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// 解析完成的不可变权限集合。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PermissionSet {
    grants: Arc<[Permission]>,
    unrestricted: bool,
}

impl PermissionSet {
    /// 不授予任何能力。
    pub fn empty() -> Self {
        Self::default()
    }

    /// 宿主代码路径使用的无限制集合。
    pub fn unrestricted() -> Self {
        Self {
            grants: Arc::from(Vec::new()),
            unrestricted: true,
        }
    }

    pub fn from_permissions(grants: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            grants: grants.into_iter().collect(),
            unrestricted: false,
        }
    }

    /// 解析声明文本。
    pub fn parse(text: &str, env: &dyn EnvLookup) -> Result<Self, PermissionParseError> {
        let mut grants = Vec::new();
        for (index, raw) in text.lines().enumerate() {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }
            let fail = |kind| PermissionParseError {
                line: index + 1,
                kind,
            };
            let expanded = substitute(line, env).map_err(fail)?;
            let fields: Vec<&str> = expanded.split('|').map(str::trim).collect();
            let (class, target, actions) = match fields.as_slice() {
                [class, target] => (*class, *target, ""),
                [class, target, actions] => (*class, *target, *actions),
                _ => {
                    return Err(fail(PermissionParseErrorKind::FieldCount {
                        fields: fields.len(),
                    }));
                }
            };
            if class.is_empty() {
                return Err(fail(PermissionParseErrorKind::EmptyClass));
            }
            if target.is_empty() {
                return Err(fail(PermissionParseErrorKind::EmptyTarget));
            }
            grants.push(Permission::new(class, target, actions));
        }
        Ok(Self::from_permissions(grants))
    }

    /// 从文件存储读取并解析声明文本。
    pub fn load(
        store: &dyn FileStore,
        path: &Path,
        env: &dyn EnvLookup,
    ) -> Result<Self, PermissionSourceError> {
        let display = path.display().to_string();
        let bytes = store.read(path).map_err(|source| PermissionSourceError::Io {
            path: display.clone(),
            source,
        })?;
        let text = String::from_utf8_lossy(&bytes);
        Self::parse(&text, env).map_err(|source| PermissionSourceError::Parse {
            path: display,
            source,
        })
    }

    pub fn implies(&self, requested: &Permission) -> bool {
        self.unrestricted || self.grants.iter().any(|grant| grant.implies(requested))
    }

    pub fn is_unrestricted(&self) -> bool {
        self.unrestricted
    }

    pub fn iter(&self) -> impl Iterator<Item = &Permission> {
        self.grants.iter()
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty() && !self.unrestricted
    }
}

/// 行首或空白之后的 `#` 开始注释，一直到行尾。
fn strip_comment(line: &str) -> &str {
    let mut previous = None;
    for (index, ch) in line.char_indices() {
        if ch == '#' && previous.is_none_or(char::is_whitespace) {
            return &line[..index];
        }
        previous = Some(ch);
    }
    line
}

fn substitute(line: &str, env: &dyn EnvLookup) -> Result<String, PermissionParseErrorKind> {
    let mut output = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or(PermissionParseErrorKind::UnterminatedVariable)?;
        let name = &after[..end];
        let value = env
            .var(name)
            .ok_or_else(|| PermissionParseErrorKind::UndefinedVariable {
                name: name.to_owned(),
            })?;
        output.push_str(&value);
        rest = &after[end + 1..];
    }
    output.push_str(rest);
    Ok(output)
}

/// 按域名过滤权限审计日志。
#[derive(Clone, Debug)]
pub struct AccessLogFilter {
    pattern: Regex,
}

impl AccessLogFilter {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn matches(&self, domain: &str) -> bool {
        self.pattern.is_match(domain)
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }
}

/// 某个域持有的能力对象。
///
/// # 教案式说明
/// - **意图 (Why)**：插件面向的每个特权操作都通过它做检查，检查依据只来自对象本身；
/// - **契约 (What)**：克隆廉价，内容在部署期间不可变。
#[derive(Clone, Debug)]
pub struct Capabilities {
    domain: Arc<str>,
    permissions: PermissionSet,
    log: Option<AccessLogFilter>,
}

impl Capabilities {
    pub fn new(
        domain: impl Into<Arc<str>>,
        permissions: PermissionSet,
        log: Option<AccessLogFilter>,
    ) -> Self {
        Self {
            domain: domain.into(),
            permissions,
            log,
        }
    }

    /// 宿主代码路径的无限制能力。
    pub fn host(log: Option<AccessLogFilter>) -> Self {
        Self::new(HOST_DOMAIN, PermissionSet::unrestricted(), log)
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn permissions(&self) -> &PermissionSet {
        &self.permissions
    }

    pub fn is_unrestricted(&self) -> bool {
        self.permissions.is_unrestricted()
    }

    /// 检查请求的权限，未授予时返回 [`AccessDenied`]。
    pub fn check(&self, requested: &Permission) -> Result<(), AccessDenied> {
        let granted = self.permissions.implies(requested);
        if let Some(filter) = &self.log
            && filter.matches(&self.domain)
        {
            info!(
                domain = %self.domain,
                permission = %requested,
                granted,
                "permission check"
            );
        }
        if granted {
            Ok(())
        } else {
            Err(AccessDenied {
                domain: self.domain.to_string(),
                permission: requested.clone(),
            })
        }
    }

    /// `check` 的便捷形式。
    pub fn check_action(&self, class: &str, target: &str, action: &str) -> Result<(), AccessDenied> {
        self.check(&Permission::new(class, target, action))
    }
}

/// 域名到能力对象的登记表。
#[derive(Debug, Default)]
pub struct PermissionRegistry {
    grants: DashMap<String, Capabilities>,
    log: Option<AccessLogFilter>,
}

impl PermissionRegistry {
    pub fn new(log: Option<AccessLogFilter>) -> Self {
        Self {
            grants: DashMap::new(),
            log,
        }
    }

    /// 为域登记权限集合并返回其能力对象；重复登记覆盖旧值。
    pub fn register(&self, domain: &str, permissions: PermissionSet) -> Capabilities {
        let capabilities = Capabilities::new(domain, permissions, self.log.clone());
        self.grants.insert(domain.to_owned(), capabilities.clone());
        capabilities
    }

    /// 域的能力对象；未登记的域不持有任何能力。
    pub fn capabilities(&self, domain: &str) -> Capabilities {
        self.grants
            .get(domain)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| Capabilities::new(domain, PermissionSet::empty(), self.log.clone()))
    }

    pub fn host(&self) -> Capabilities {
        Capabilities::host(self.log.clone())
    }

    pub fn revoke(&self, domain: &str) -> Option<Capabilities> {
        self.grants.remove(domain).map(|(_, capabilities)| capabilities)
    }

    pub fn is_registered(&self, domain: &str) -> bool {
        self.grants.contains_key(domain)
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}
