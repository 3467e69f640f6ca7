use std::time::SystemTime;

use parking_lot::Mutex;
use serde::Serialize;

/// 审计轨迹中的组件状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InfoStatus {
    /// 已纳入启动顺序，尚未开始初始化。
    Pending,
    /// 初始化成功。
    Initialized,
    /// 构造、注入或初始化失败。
    Failed,
    /// 收尾完成（含收尾失败，失败原因记入 `detail`）。
    Finished,
}

/// 一条审计记录。
///
/// - **契约 (What)**：`sequence` 在单个容器内严格递增，与写入时间同序；记录一经写入不再修改。
#[derive(Clone, Debug, Serialize)]
pub struct InfoRecord {
    pub sequence: u64,
    pub component: String,
    pub status: InfoStatus,
    pub detail: Option<String>,
    #[serde(skip)]
    pub at: SystemTime,
}

/// 只追加的审计轨迹。
///
/// 写入只发生在持有容器转换锁期间；读取返回副本，调用方无法改写历史。
#[derive(Debug, Default)]
pub(crate) struct AuditTrail {
    records: Mutex<Vec<InfoRecord>>,
}

impl AuditTrail {
    pub(crate) fn append(&self, component: &str, status: InfoStatus, detail: Option<String>) {
        let mut records = self.records.lock();
        let sequence = records.len() as u64;
        records.push(InfoRecord {
            sequence,
            component: component.to_owned(),
            status,
            detail,
            at: SystemTime::now(),
        });
    }

    pub(crate) fn records(&self) -> Vec<InfoRecord> {
        self.records.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_follow_append_order() {
        let trail = AuditTrail::default();
        trail.append("a", InfoStatus::Pending, None);
        trail.append("a", InfoStatus::Failed, Some("boom".into()));
        let records = trail.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sequence, 0);
        assert_eq!(records[1].status, InfoStatus::Failed);
        assert_eq!(records[1].detail.as_deref(), Some("boom"));
        assert!(records[0].at <= records[1].at);
    }
}
