//! 每个服务器独立的熔断器
//!
//! ```text
//! Closed   -> Open:     连续失败次数达到阈值
//! Open     -> HalfOpen: 重置超时后的第一次获取
//! HalfOpen -> Closed:   试探请求成功
//! HalfOpen -> Open:     试探请求失败，重新计时
//! ```
//!
//! 所有状态转换都在同一把锁内完成，并发调用方不会同时观察到
//! 同一个熔断器被打开或重置。
//!
//! 熔断状态只为注册过的服务器记录，服务器移除后迟到的结果被忽略

use parking_lot::{Mutex, RwLock};
use pulley_core::{Clock, LoadBalancerError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// 记录一次结果后熔断器发生的转换
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    None,
    Opened { consecutive_failures: u32 },
    HalfOpened,
    Reset,
    Reopened,
}

/// 熔断器的只读快照，用于诊断
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
}

#[derive(Debug, Clone)]
struct BreakerEntry {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// 半开状态下唯一的试探请求进行中时设置
    trial_started_at: Option<Instant>,
}

impl BreakerEntry {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_started_at: None,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_started_at = None;
    }

    fn reset_timeout_elapsed(&self, now: Instant, reset_timeout: Duration) -> bool {
        self.opened_at
            .is_some_and(|opened_at| now.saturating_duration_since(opened_at) >= reset_timeout)
    }

    /// 没有回报结果的试探请求（例如被取消）在一个重置超时后失效
    fn trial_in_flight(&self, now: Instant, reset_timeout: Duration) -> bool {
        self.trial_started_at
            .is_some_and(|started| now.saturating_duration_since(started) < reset_timeout)
    }
}

#[derive(Debug, Clone, Copy)]
struct BreakerSettings {
    enabled: bool,
    threshold: u32,
    reset_timeout: Duration,
}

/// 按服务器id索引的熔断器集合
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, BreakerEntry>>,
    settings: RwLock<BreakerSettings>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerRegistry {
    pub fn new(
        enabled: bool,
        threshold: u32,
        reset_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            settings: RwLock::new(BreakerSettings {
                enabled,
                threshold: threshold.max(1),
                reset_timeout,
            }),
            clock,
        }
    }

    /// 应用新设置，关闭时所有熔断器回到 Closed
    pub fn configure(&self, enabled: bool, threshold: u32, reset_timeout: Duration) {
        *self.settings.write() = BreakerSettings {
            enabled,
            threshold: threshold.max(1),
            reset_timeout,
        };

        if !enabled {
            self.reset_all();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.read().enabled
    }

    /// 服务器能否进入候选集，不修改状态
    pub fn is_selectable(&self, server_id: &str) -> bool {
        let settings = *self.settings.read();
        if !settings.enabled {
            return true;
        }

        let now = self.clock.now();
        match self.breakers.lock().get(server_id) {
            None => true,
            Some(entry) => match entry.state {
                CircuitState::Closed => true,
                CircuitState::Open => entry.reset_timeout_elapsed(now, settings.reset_timeout),
                CircuitState::HalfOpen => !entry.trial_in_flight(now, settings.reset_timeout),
            },
        }
    }

    /// 申请向服务器发送请求
    ///
    /// 重置超时后第一个调用方把熔断器切到 HalfOpen 并成为试探请求，
    /// 试探结果返回前其他调用方得到 `CircuitOpen`
    pub fn try_acquire(&self, server_id: &str) -> Result<CircuitTransition> {
        let settings = *self.settings.read();
        if !settings.enabled {
            return Ok(CircuitTransition::None);
        }

        let now = self.clock.now();
        let mut breakers = self.breakers.lock();
        let Some(entry) = breakers.get_mut(server_id) else {
            return Ok(CircuitTransition::None);
        };

        match entry.state {
            CircuitState::Closed => Ok(CircuitTransition::None),
            CircuitState::Open => {
                if entry.reset_timeout_elapsed(now, settings.reset_timeout) {
                    entry.state = CircuitState::HalfOpen;
                    entry.trial_started_at = Some(now);
                    info!(
                        "Circuit breaker for server {} is half-open, sending trial request",
                        server_id
                    );
                    Ok(CircuitTransition::HalfOpened)
                } else {
                    Err(LoadBalancerError::CircuitOpen(server_id.to_string()))
                }
            }
            CircuitState::HalfOpen => {
                if entry.trial_in_flight(now, settings.reset_timeout) {
                    Err(LoadBalancerError::CircuitOpen(server_id.to_string()))
                } else {
                    entry.trial_started_at = Some(now);
                    Ok(CircuitTransition::None)
                }
            }
        }
    }

    pub fn record_success(&self, server_id: &str) -> CircuitTransition {
        if !self.is_enabled() {
            return CircuitTransition::None;
        }

        let mut breakers = self.breakers.lock();
        let Some(entry) = breakers.get_mut(server_id) else {
            return CircuitTransition::None;
        };

        match entry.state {
            CircuitState::Closed => {
                entry.consecutive_failures = 0;
                CircuitTransition::None
            }
            CircuitState::HalfOpen => {
                *entry = BreakerEntry::closed();
                info!("Circuit breaker for server {} reset to closed", server_id);
                CircuitTransition::Reset
            }
            CircuitState::Open => {
                // 熔断前发出的请求晚到的成功，不改变状态
                debug!(
                    "Ignoring late success for server {} while circuit is open",
                    server_id
                );
                CircuitTransition::None
            }
        }
    }

    pub fn record_failure(&self, server_id: &str) -> CircuitTransition {
        let settings = *self.settings.read();
        if !settings.enabled {
            return CircuitTransition::None;
        }

        let now = self.clock.now();
        let mut breakers = self.breakers.lock();
        let Some(entry) = breakers.get_mut(server_id) else {
            debug!("Ignoring failure for unregistered server {}", server_id);
            return CircuitTransition::None;
        };
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);

        match entry.state {
            CircuitState::Closed => {
                if entry.consecutive_failures >= settings.threshold {
                    entry.open(now);
                    warn!(
                        "Circuit breaker opened for server {} after {} consecutive failures",
                        server_id, entry.consecutive_failures
                    );
                    CircuitTransition::Opened {
                        consecutive_failures: entry.consecutive_failures,
                    }
                } else {
                    debug!(
                        "Server {} failure count: {}/{}",
                        server_id, entry.consecutive_failures, settings.threshold
                    );
                    CircuitTransition::None
                }
            }
            CircuitState::HalfOpen => {
                entry.open(now);
                warn!("Trial request to server {} failed, circuit re-opened", server_id);
                CircuitTransition::Reopened
            }
            CircuitState::Open => CircuitTransition::None,
        }
    }

    pub fn state(&self, server_id: &str) -> CircuitState {
        self.breakers
            .lock()
            .get(server_id)
            .map(|entry| entry.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, server_id: &str) -> CircuitBreakerSnapshot {
        let breakers = self.breakers.lock();
        match breakers.get(server_id) {
            Some(entry) => CircuitBreakerSnapshot {
                state: entry.state,
                consecutive_failures: entry.consecutive_failures,
                opened_at: entry.opened_at,
            },
            None => CircuitBreakerSnapshot {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            },
        }
    }

    /// 为新服务器建立一个 Closed 熔断器，已有的状态被覆盖
    pub fn register(&self, server_id: &str) {
        self.breakers
            .lock()
            .insert(server_id.to_string(), BreakerEntry::closed());
    }

    pub fn remove(&self, server_id: &str) -> bool {
        self.breakers.lock().remove(server_id).is_some()
    }

    /// 所有熔断器回到 Closed，保留注册关系
    pub fn reset_all(&self) {
        for entry in self.breakers.lock().values_mut() {
            *entry = BreakerEntry::closed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulley_core::ManualClock;

    const RESET_TIMEOUT: Duration = Duration::from_secs(30);

    fn create_test_breakers(threshold: u32) -> (CircuitBreakerRegistry, ManualClock) {
        let clock = ManualClock::new();
        let breakers =
            CircuitBreakerRegistry::new(true, threshold, RESET_TIMEOUT, Arc::new(clock.clone()));
        breakers.register("a");
        (breakers, clock)
    }

    #[test]
    fn test_opens_after_threshold_consecutive_failures() {
        let (breakers, _clock) = create_test_breakers(3);

        assert_eq!(breakers.record_failure("a"), CircuitTransition::None);
        assert_eq!(breakers.record_failure("a"), CircuitTransition::None);
        assert_eq!(
            breakers.record_failure("a"),
            CircuitTransition::Opened {
                consecutive_failures: 3
            }
        );

        assert_eq!(breakers.state("a"), CircuitState::Open);
        assert!(!breakers.is_selectable("a"));
        assert!(matches!(
            breakers.try_acquire("a"),
            Err(LoadBalancerError::CircuitOpen(_))
        ));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let (breakers, _clock) = create_test_breakers(3);

        breakers.record_failure("a");
        breakers.record_failure("a");
        breakers.record_success("a");
        breakers.record_failure("a");
        breakers.record_failure("a");

        assert_eq!(breakers.state("a"), CircuitState::Closed);
        assert_eq!(breakers.snapshot("a").consecutive_failures, 2);
    }

    #[test]
    fn test_half_open_trial_success_closes_circuit() {
        let (breakers, clock) = create_test_breakers(1);

        breakers.record_failure("a");
        assert!(!breakers.is_selectable("a"));

        clock.advance(RESET_TIMEOUT);
        assert!(breakers.is_selectable("a"));
        assert_eq!(breakers.try_acquire("a").unwrap(), CircuitTransition::HalfOpened);
        assert_eq!(breakers.state("a"), CircuitState::HalfOpen);

        // 试探请求进行中，其他请求被拒绝
        assert!(!breakers.is_selectable("a"));
        assert!(breakers.try_acquire("a").is_err());

        assert_eq!(breakers.record_success("a"), CircuitTransition::Reset);
        assert_eq!(breakers.state("a"), CircuitState::Closed);
        assert_eq!(breakers.snapshot("a").consecutive_failures, 0);
        assert!(breakers.is_selectable("a"));
    }

    #[test]
    fn test_half_open_trial_failure_restarts_timeout() {
        let (breakers, clock) = create_test_breakers(1);

        breakers.record_failure("a");
        clock.advance(RESET_TIMEOUT);
        breakers.try_acquire("a").unwrap();

        assert_eq!(breakers.record_failure("a"), CircuitTransition::Reopened);
        assert_eq!(breakers.state("a"), CircuitState::Open);
        assert!(!breakers.is_selectable("a"));

        clock.advance(RESET_TIMEOUT - Duration::from_secs(1));
        assert!(!breakers.is_selectable("a"));

        clock.advance(Duration::from_secs(1));
        assert!(breakers.is_selectable("a"));
    }

    #[test]
    fn test_abandoned_trial_expires() {
        let (breakers, clock) = create_test_breakers(1);

        breakers.record_failure("a");
        clock.advance(RESET_TIMEOUT);
        breakers.try_acquire("a").unwrap();
        assert!(!breakers.is_selectable("a"));

        clock.advance(RESET_TIMEOUT);
        assert!(breakers.is_selectable("a"));
        assert_eq!(breakers.try_acquire("a").unwrap(), CircuitTransition::None);
    }

    #[test]
    fn test_only_one_concurrent_caller_gets_the_trial() {
        let (breakers, clock) = create_test_breakers(1);
        let breakers = Arc::new(breakers);

        breakers.record_failure("a");
        clock.advance(RESET_TIMEOUT);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let breakers = breakers.clone();
                std::thread::spawn(move || breakers.try_acquire("a").is_ok())
            })
            .collect();

        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|granted| *granted)
            .count();
        assert_eq!(granted, 1);
    }

    #[test]
    fn test_disabled_breaker_is_pass_through() {
        let (breakers, _clock) = create_test_breakers(1);
        breakers.record_failure("a");
        assert_eq!(breakers.state("a"), CircuitState::Open);

        breakers.configure(false, 1, RESET_TIMEOUT);

        assert_eq!(breakers.state("a"), CircuitState::Closed);
        assert_eq!(breakers.record_failure("a"), CircuitTransition::None);
        assert!(breakers.is_selectable("a"));
        assert_eq!(breakers.try_acquire("a").unwrap(), CircuitTransition::None);
    }

    #[test]
    fn test_remove_purges_state() {
        let (breakers, _clock) = create_test_breakers(1);
        breakers.record_failure("a");

        assert!(breakers.remove("a"));
        assert!(!breakers.remove("a"));
        assert_eq!(breakers.snapshot("a").state, CircuitState::Closed);
        assert!(breakers.is_selectable("a"));
    }

    #[test]
    fn test_outcomes_for_removed_server_are_ignored() {
        let (breakers, _clock) = create_test_breakers(1);
        breakers.remove("a");

        // 移除后才返回的失败不能重新建立熔断状态
        assert_eq!(breakers.record_failure("a"), CircuitTransition::None);
        assert_eq!(breakers.record_success("a"), CircuitTransition::None);
        assert_eq!(breakers.state("a"), CircuitState::Closed);
        assert!(!breakers.remove("a"));

        breakers.register("a");
        assert_eq!(breakers.snapshot("a").consecutive_failures, 0);
        assert_eq!(
            breakers.record_failure("a"),
            CircuitTransition::Opened {
                consecutive_failures: 1
            }
        );
    }

    #[test]
    fn test_reenabling_keeps_registered_servers() {
        let (breakers, _clock) = create_test_breakers(1);
        breakers.configure(false, 1, RESET_TIMEOUT);
        breakers.configure(true, 1, RESET_TIMEOUT);

        assert!(matches!(
            breakers.record_failure("a"),
            CircuitTransition::Opened { .. }
        ));
        assert_eq!(breakers.state("a"), CircuitState::Open);
    }
}
