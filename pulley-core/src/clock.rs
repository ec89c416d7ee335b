//! 时间抽象
//!
//! 引擎不直接调用 `Instant::now()` 或 `tokio::time::sleep`，
//! 所有时间操作都经过 [`Clock`]，测试可以在虚拟时间上运行

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// 时间和延迟的来源
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// 单调时钟的当前时刻
    fn now(&self) -> Instant;

    /// 墙上时间，用于对外暴露的时间戳
    fn wall_clock(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

/// 基于 `tokio::time` 的生产时钟
///
/// 遵循 tokio 的暂停时间，`#[tokio::test(start_paused = true)]` 的测试直接得到虚拟时间
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// 手动时钟中等待触发的定时器
struct PendingTimer {
    deadline: Instant,
    seq: u64,
    tx: oneshot::Sender<()>,
}

impl Eq for PendingTimer {}

impl PartialEq for PendingTimer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Ord for PendingTimer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // 反向比较，得到最小堆
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PendingTimer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct ManualState {
    now: Instant,
    elapsed: Duration,
    next_seq: u64,
    timers: BinaryHeap<PendingTimer>,
}

impl ManualState {
    /// 移除 sleep future 已被丢弃的定时器
    fn prune_dropped(&mut self) {
        self.timers.retain(|timer| !timer.tx.is_closed());
    }
}

/// 测试用的虚拟时钟
///
/// 只有调用 [`ManualClock::advance`] 时间才会前进。sleep 注册一个定时器，
/// 时间推进到截止点后触发；时长为0的 sleep 立即完成。
/// 被丢弃的 sleep 不再计入等待中的定时器
#[derive(Clone)]
pub struct ManualClock {
    started_at: DateTime<Utc>,
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            state: Arc::new(Mutex::new(ManualState {
                now: Instant::now(),
                elapsed: Duration::ZERO,
                next_seq: 0,
                timers: BinaryHeap::new(),
            })),
        }
    }

    /// 推进时间并唤醒所有到期的定时器
    pub fn advance(&self, duration: Duration) {
        let mut state = self.state.lock();
        state.now += duration;
        state.elapsed += duration;
        let now = state.now;

        while state.timers.peek().is_some_and(|timer| timer.deadline <= now) {
            if let Some(timer) = state.timers.pop() {
                let _ = timer.tx.send(());
            }
        }
    }

    /// 创建以来推进的虚拟时间总量
    pub fn elapsed(&self) -> Duration {
        self.state.lock().elapsed
    }

    /// 仍在等待时间推进的 sleep 数量
    pub fn pending_timer_count(&self) -> usize {
        let mut state = self.state.lock();
        state.prune_dropped();
        state.timers.len()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManualClock")
            .field("elapsed", &state.elapsed)
            .field("pending_timers", &state.timers.len())
            .finish()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.state.lock().now
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        let elapsed = self.state.lock().elapsed;
        chrono::Duration::from_std(elapsed)
            .ok()
            .and_then(|delta| self.started_at.checked_add_signed(delta))
            .unwrap_or(self.started_at)
    }

    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }

        let rx = {
            let mut state = self.state.lock();
            state.prune_dropped();
            let (tx, rx) = oneshot::channel();
            let deadline = state.now + duration;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.timers.push(PendingTimer { deadline, seq, tx });
            rx
        };

        // 只有时钟本身被丢弃时发送端才会关闭，视为到期
        let _ = rx.await;
    }
}
