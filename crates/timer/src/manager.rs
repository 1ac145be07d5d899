//! `TimerManager`: the live set of countdown timers.
//!
//! Each timer is two tokio tasks: a one-shot expiry and a 1-second tick.
//! State machine per timer: `Running -> {Expired, Cancelled}`.
//!
//! Removal from the live set under the lock is the single point where a
//! timer's fate is decided.  `cancel` and the expiry task both try to remove
//! the entry; whoever removes it emits its terminal event, the other side
//! finds nothing and does nothing.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bus::EventBus;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{FallbackAction, Mode, TimerError};

const TICK_PERIOD: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Opaque timer handle, `"<flow>_<node>_<seq>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimerId(String);

impl TimerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What to count down and what to apply when the countdown ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerConfig {
    pub flow_id: String,
    pub node_id: String,
    pub timeout_s: f64,
    /// Fallback action name, see [`FallbackAction`].
    pub action: String,
    /// Mode of the originating node; namespaces the lifecycle events.
    pub mode: Mode,
}

/// Read-only view of a live timer.
#[derive(Debug, Clone)]
pub struct TimerInfo {
    pub id: TimerId,
    pub config: TimerConfig,
    pub remaining: Duration,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Timer {
    config: TimerConfig,
    timeout: Duration,
    started_at: Instant,
    expiry: Option<JoinHandle<()>>,
    tick: Option<JoinHandle<()>>,
    cancelled: bool,
}

impl Timer {
    fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.started_at.elapsed())
    }

    fn abort_handles(&mut self) {
        if let Some(handle) = self.expiry.take() {
            handle.abort();
        }
        if let Some(handle) = self.tick.take() {
            handle.abort();
        }
    }
}

struct Inner {
    bus: EventBus,
    seq: AtomicU64,
    live: Mutex<HashMap<TimerId, Timer>>,
}

impl Inner {
    fn expire(&self, id: &TimerId) {
        let timer = {
            let mut live = self.live.lock();
            match live.get(id) {
                Some(t) if !t.cancelled => live.remove(id),
                _ => None,
            }
        };
        let Some(mut timer) = timer else {
            debug!(timer_id = %id, "expiry lost race to cancellation");
            return;
        };

        // Running inside the expiry task: detach it, stop only the tick.
        timer.expiry.take();
        if let Some(tick) = timer.tick.take() {
            tick.abort();
        }

        let config = timer.config;
        let result = FallbackAction::parse(&config.action).resolve();
        info!(
            timer_id = %id,
            flow = %config.flow_id,
            node = %config.node_id,
            action = %config.action,
            "default action applied"
        );
        self.bus.emit(
            &config.mode.default_event("applied"),
            json!({
                "flow": config.flow_id,
                "node": config.node_id,
                "timer_id": id,
                "action": config.action,
                "result": result,
            }),
        );
    }

    fn remaining(&self, id: &TimerId) -> Option<Duration> {
        self.live.lock().get(id).map(Timer::remaining)
    }
}

// ---------------------------------------------------------------------------
// TimerManager
// ---------------------------------------------------------------------------

/// Owns every live countdown.  Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TimerManager {
    inner: Arc<Inner>,
}

impl TimerManager {
    pub fn new(bus: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                seq: AtomicU64::new(0),
                live: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Reserve the id of a timer for `config` without arming anything.
    ///
    /// Lets a caller record the id before [`start_with_id`](Self::start_with_id)
    /// emits the `started` event.
    pub fn allocate(&self, config: &TimerConfig) -> TimerId {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed) + 1;
        TimerId(format!("{}_{}_{}", config.flow_id, config.node_id, seq))
    }

    /// Arm a new timer and emit `"<mode>.default.started"`.
    ///
    /// # Errors
    /// See [`start_with_id`](Self::start_with_id).
    pub fn start(&self, config: TimerConfig) -> Result<TimerId, TimerError> {
        let id = self.allocate(&config);
        self.start_with_id(id, config)
    }

    /// Arm a timer under an id obtained from [`allocate`](Self::allocate).
    ///
    /// # Errors
    /// - [`TimerError::InvalidTimeout`] for negative or non-finite timeouts.
    /// - [`TimerError::NoRuntime`] when called outside a tokio runtime.
    /// - [`TimerError::AlreadyRunning`] when `id` is still live.
    pub fn start_with_id(&self, id: TimerId, config: TimerConfig) -> Result<TimerId, TimerError> {
        if !config.timeout_s.is_finite() || config.timeout_s < 0.0 {
            return Err(TimerError::InvalidTimeout {
                node_id: config.node_id,
                timeout_s: config.timeout_s,
            });
        }
        let runtime = Handle::try_current().map_err(|_| TimerError::NoRuntime {
            node_id: config.node_id.clone(),
        })?;

        let timeout = Duration::from_secs_f64(config.timeout_s);
        let started_at = Instant::now();

        {
            let mut live = self.inner.live.lock();
            if live.contains_key(&id) {
                return Err(TimerError::AlreadyRunning { timer_id: id.0 });
            }
            live.insert(
                id.clone(),
                Timer {
                    config: config.clone(),
                    timeout,
                    started_at,
                    expiry: None,
                    tick: None,
                    cancelled: false,
                },
            );
        }

        info!(
            timer_id = %id,
            flow = %config.flow_id,
            node = %config.node_id,
            timeout_s = config.timeout_s,
            "timer started"
        );
        self.inner.bus.emit(
            &config.mode.default_event("started"),
            json!({
                "flow": config.flow_id,
                "node": config.node_id,
                "timer_id": id,
                "timeout_s": config.timeout_s,
                "action": config.action,
            }),
        );

        // A `started` listener may already have cancelled it.
        if !self.inner.live.lock().contains_key(&id) {
            return Ok(id);
        }

        let expiry = runtime.spawn({
            let inner = Arc::clone(&self.inner);
            let id = id.clone();
            async move {
                tokio::time::sleep_until(started_at + timeout).await;
                inner.expire(&id);
            }
        });

        let tick = runtime.spawn({
            let inner = Arc::clone(&self.inner);
            let id = id.clone();
            let flow = config.flow_id.clone();
            let node = config.node_id.clone();
            async move {
                let mut interval = tokio::time::interval_at(started_at + TICK_PERIOD, TICK_PERIOD);
                loop {
                    interval.tick().await;
                    let Some(remaining) = inner.remaining(&id) else {
                        break;
                    };
                    inner.bus.emit(
                        "ui.countdown.tick",
                        json!({
                            "flow": flow,
                            "node": node,
                            "timer_id": id,
                            "remaining": remaining.as_secs_f64().ceil() as u64,
                        }),
                    );
                    // The expiry task decides completion; the tick only stops.
                    if remaining.is_zero() {
                        break;
                    }
                }
            }
        });

        let mut live = self.inner.live.lock();
        match live.get_mut(&id) {
            Some(timer) => {
                timer.expiry = Some(expiry);
                timer.tick = Some(tick);
            }
            None => {
                // Settled before the handles landed.
                expiry.abort();
                tick.abort();
            }
        }
        Ok(id)
    }

    /// Cancel a running timer and emit `"<mode>.default.cancelled"`.
    ///
    /// Returns `false` if the timer already expired or was cancelled.
    pub fn cancel(&self, id: &TimerId, reason: &str) -> bool {
        let timer = {
            let mut live = self.inner.live.lock();
            if let Some(timer) = live.get_mut(id) {
                timer.cancelled = true;
            }
            live.remove(id)
        };
        let Some(mut timer) = timer else {
            debug!(timer_id = %id, reason, "cancel ignored, timer not live");
            return false;
        };
        timer.abort_handles();

        let config = timer.config;
        info!(
            timer_id = %id,
            flow = %config.flow_id,
            node = %config.node_id,
            reason,
            "timer cancelled"
        );
        self.inner.bus.emit(
            &config.mode.default_event("cancelled"),
            json!({
                "flow": config.flow_id,
                "node": config.node_id,
                "timer_id": id,
                "reason": reason,
            }),
        );
        true
    }

    /// Cancel every live timer.  Returns how many were cancelled.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let ids: Vec<TimerId> = self.inner.live.lock().keys().cloned().collect();
        ids.iter().filter(|id| self.cancel(id, reason)).count()
    }

    pub fn get_active_timers(&self) -> Vec<TimerInfo> {
        self.inner
            .live
            .lock()
            .iter()
            .map(|(id, t)| TimerInfo {
                id: id.clone(),
                config: t.config.clone(),
                remaining: t.remaining(),
            })
            .collect()
    }

    /// Time left before expiry, from wall-clock elapsed time.
    pub fn get_remaining_time(&self, id: &TimerId) -> Option<Duration> {
        self.inner.remaining(id)
    }

    pub fn is_active(&self, id: &TimerId) -> bool {
        self.inner.live.lock().contains_key(id)
    }
}

impl fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerManager")
            .field("live", &self.inner.live.lock().len())
            .finish()
    }
}
