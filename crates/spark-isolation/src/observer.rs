//! # 回收观测器
//!
//! ## 核心意图（Why）
//! - 插件域释放后，宿主或其他插件仍可能持有其句柄，导致域无法真正回收；
//! - 观测器记录每个已释放域从释放到最后一个引用消失的耗时，超过阈值时告警一次。
//!
//! ## 架构定位（Where）
//! - 独立的后台线程阻塞在 `flume` 通道上；域的最后一个引用被丢弃时，`ReclaimNotice` 投递一条回收事件；
//! - 纯旁路诊断，卸载流程从不等待它。
//!
//! ## 风险提示（Trade-offs）
//! - 告警判定依赖轮询间隔，实际告警时间最多晚一个 `poll_interval`。

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{Span, debug, info, info_span, warn};

use crate::domain::{DomainId, IsolationDomain};

/// 观测器参数。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObserverSettings {
    /// 释放后超过该时长仍未回收即告警。
    pub leak_warning: Duration,
    /// 无事件时的巡检间隔。
    pub poll_interval: Duration,
}

impl Default for ObserverSettings {
    fn default() -> Self {
        Self {
            leak_warning: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// 已释放但尚未回收的域。
#[derive(Clone, Debug)]
pub struct OutstandingDomain {
    pub id: DomainId,
    pub name: String,
    pub released_at: Instant,
    pub warned: bool,
}

enum ObserverEvent {
    Reclaimed { id: DomainId, at: Instant },
    Stop,
}

/// 域释放时挂载的回收通知，随域的最后一个引用一起被丢弃。
pub(crate) struct ReclaimNotice {
    id: DomainId,
    sender: Sender<ObserverEvent>,
}

impl ReclaimNotice {
    pub(crate) fn fire(self) {
        let event = ObserverEvent::Reclaimed {
            id: self.id,
            at: Instant::now(),
        };
        if self.sender.send(event).is_err() {
            debug!(id = %self.id, "finalization observer stopped; reclaim notice dropped");
        }
    }
}

#[derive(Default)]
struct Tracking {
    outstanding: BTreeMap<DomainId, OutstandingDomain>,
    reclaimed: u64,
}

#[derive(Default)]
struct ObserverState {
    tracking: Mutex<Tracking>,
    changed: Condvar,
}

/// 后台回收观测器。
///
/// # 教案式说明
/// - **契约 (What)**：`watch` 同步登记域并挂载通知；`outstanding`/`reclaimed_count`/`wait_reclaimed`
///   供运维与测试查询；`stop` 幂等，`Drop` 时自动调用。
pub struct FinalizationObserver {
    settings: ObserverSettings,
    state: Arc<ObserverState>,
    sender: Sender<ObserverEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl core::fmt::Debug for FinalizationObserver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FinalizationObserver")
            .field("settings", &self.settings)
            .field("outstanding", &self.state.tracking.lock().outstanding.len())
            .field("running", &self.worker.lock().is_some())
            .finish()
    }
}

impl FinalizationObserver {
    /// 启动观测线程；线程内事件挂在调用方当前 span 之下。
    pub fn start(settings: ObserverSettings) -> io::Result<Self> {
        let (sender, receiver) = flume::unbounded();
        let state = Arc::new(ObserverState::default());
        let worker_state = Arc::clone(&state);
        let span = info_span!(parent: &Span::current(), "finalization_observer");
        let worker = thread::Builder::new()
            .name("spark-finalizer".to_owned())
            .spawn(move || {
                let _entered = span.enter();
                observe(receiver, worker_state, settings)
            })?;
        Ok(Self {
            settings,
            state,
            sender,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn settings(&self) -> ObserverSettings {
        self.settings
    }

    /// 登记一个刚释放的域。
    ///
    /// 先登记再挂载通知，回收事件因此不会早于登记到达。
    pub fn watch(&self, domain: &IsolationDomain) {
        self.state.tracking.lock().outstanding.insert(
            domain.id(),
            OutstandingDomain {
                id: domain.id(),
                name: domain.name().to_owned(),
                released_at: Instant::now(),
                warned: false,
            },
        );
        domain.attach_reclaim_notice(ReclaimNotice {
            id: domain.id(),
            sender: self.sender.clone(),
        });
    }

    pub fn outstanding(&self) -> Vec<OutstandingDomain> {
        self.state
            .tracking
            .lock()
            .outstanding
            .values()
            .cloned()
            .collect()
    }

    pub fn is_outstanding(&self, id: DomainId) -> bool {
        self.state.tracking.lock().outstanding.contains_key(&id)
    }

    pub fn reclaimed_count(&self) -> u64 {
        self.state.tracking.lock().reclaimed
    }

    /// 阻塞等待指定域被回收；超时返回 `false`。
    pub fn wait_reclaimed(&self, id: DomainId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut tracking = self.state.tracking.lock();
        while tracking.outstanding.contains_key(&id) {
            if self
                .state
                .changed
                .wait_until(&mut tracking, deadline)
                .timed_out()
            {
                return !tracking.outstanding.contains_key(&id);
            }
        }
        true
    }

    /// 停止观测线程；之后到达的回收通知被丢弃。
    pub fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        if self.sender.send(ObserverEvent::Stop).is_err() {
            debug!("finalization observer already disconnected");
        }
        if worker.join().is_err() {
            warn!("finalization observer thread panicked");
        }
    }
}

impl Drop for FinalizationObserver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn observe(receiver: Receiver<ObserverEvent>, state: Arc<ObserverState>, settings: ObserverSettings) {
    debug!(
        leak_warning_ms = settings.leak_warning.as_millis() as u64,
        "finalization observer started"
    );
    loop {
        match receiver.recv_timeout(settings.poll_interval) {
            Ok(ObserverEvent::Reclaimed { id, at }) => record_reclaim(&state, id, at),
            Ok(ObserverEvent::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        warn_overdue(&state, settings.leak_warning);
    }
    debug!("finalization observer stopped");
}

fn record_reclaim(state: &ObserverState, id: DomainId, at: Instant) {
    let mut tracking = state.tracking.lock();
    match tracking.outstanding.remove(&id) {
        Some(domain) => {
            tracking.reclaimed += 1;
            info!(
                domain = %domain.name,
                id = %id,
                elapsed_ms = at.saturating_duration_since(domain.released_at).as_millis() as u64,
                "isolation domain reclaimed"
            );
        }
        None => debug!(id = %id, "reclaim notice for untracked domain"),
    }
    drop(tracking);
    state.changed.notify_all();
}

fn warn_overdue(state: &ObserverState, threshold: Duration) {
    let now = Instant::now();
    let mut tracking = state.tracking.lock();
    for domain in tracking.outstanding.values_mut() {
        let waited = now.saturating_duration_since(domain.released_at);
        if !domain.warned && waited >= threshold {
            domain.warned = true;
            warn!(
                domain = %domain.name,
                id = %domain.id,
                waited_ms = waited.as_millis() as u64,
                "isolation domain not reclaimed after release; something still holds a handle"
            );
        }
    }
}
