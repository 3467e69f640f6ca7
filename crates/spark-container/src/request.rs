use core::fmt;

use serde::{Deserialize, Serialize};

/// 公开组件的查找标识。
///
/// - **意图 (Why)**：请求类型是组件对外的“接口身份”，容器以它建立依赖边与查找表；
/// - **契约 (What)**：以字符串承载，便于序列化配置；[`RequestType::of`] 以 Rust 类型名派生稳定标识，
///   同一进程内对同一类型多次调用结果一致。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestType(String);

impl RequestType {
    /// 以显式名称构造请求类型。
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// 以 Rust 类型（通常是 `dyn Trait`）派生请求类型。
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self(core::any::type_name::<T>().to_owned())
    }

    /// 返回名称。
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RequestType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// 注册序号，同时充当组件的生成式身份。
///
/// 序号在单个注册表内单调递增；无排序约束的组件按序号决定启动先后。
/// 私有组件没有请求类型，只能通过该标识寻址。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(u64);

impl ComponentId {
    pub(crate) const fn new(sequence: u64) -> Self {
        Self(sequence)
    }

    /// 原始序号。
    pub const fn sequence(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
