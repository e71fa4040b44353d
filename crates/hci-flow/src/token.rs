//! # Token Ledger
//!
//! Tags each chunk of outbound data with a move-only [`Token`] for as long as
//! it is in flight, keeps aggregate in-flight counters, and feeds every
//! retirement into the [`RetirementLog`].
//!
//! The ledger and its tokens belong to one execution domain: state lives in an
//! `Rc<RefCell<_>>` and each token holds only a `Weak` reference to it, so a
//! token that outlives its ledger retires as a no-op.
//!
//! Threshold alerts are one-shot. Callbacks run after the ledger state has been
//! released and receive the ledger, so they may inspect counters, issue tokens
//! or re-subscribe. A subscription added from inside a callback is first
//! evaluated on the next issue/retire, never on the event that fired it.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use quanta::{Clock, Instant};
use serde::Serialize;
use slab::Slab;
use tracing::trace;

use crate::stats::RetirementLog;

// ─── Ids & Alerts ────────────────────────────────────────────────────────────

/// Ledger-local token id. Ids are dense and reused after retirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenId(usize);

impl TokenId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Threshold a subscription waits for. Met means observed value ≥ threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertThreshold {
    /// Checked on issue.
    TokensInFlight(usize),
    /// Checked on issue.
    BytesInFlight(u64),
    /// Checked on retire against the retired token's age.
    Age(Duration),
}

impl AlertThreshold {
    fn checked_on_issue(self) -> bool {
        matches!(
            self,
            AlertThreshold::TokensInFlight(_) | AlertThreshold::BytesInFlight(_)
        )
    }
}

/// What a callback is told when its subscription fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alert {
    /// The threshold that was met.
    pub threshold: AlertThreshold,
    pub tokens_in_flight: usize,
    pub bytes_in_flight: u64,
    /// Age of the retired token, for retirement-triggered alerts.
    pub age: Option<Duration>,
}

type AlertCallback = Box<dyn FnOnce(&TokenLedger, &Alert)>;

struct Subscription {
    thresholds: Vec<AlertThreshold>,
    callback: AlertCallback,
}

// ─── Ledger State ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct LiveToken {
    byte_count: u64,
    issued_at: Instant,
}

struct LedgerState {
    clock: Clock,
    live: Slab<LiveToken>,
    bytes_issued: u64,
    tokens_issued: u64,
    bytes_in_flight: u64,
    log: RetirementLog,
    subscriptions: Vec<Subscription>,
}

#[derive(Clone, Copy)]
enum Trigger {
    Issue,
    Retire(Duration),
}

impl LedgerState {
    /// Remove every subscription with a threshold met by `trigger`, pairing
    /// its callback with the alert to deliver.
    fn take_fired(&mut self, trigger: Trigger) -> Vec<(AlertCallback, Alert)> {
        let tokens_in_flight = self.live.len();
        let bytes_in_flight = self.bytes_in_flight;
        let mut fired = Vec::new();
        let mut i = 0;
        while i < self.subscriptions.len() {
            let hit = self.subscriptions[i]
                .thresholds
                .iter()
                .copied()
                .find(|t| match (&trigger, *t) {
                    (Trigger::Issue, AlertThreshold::TokensInFlight(n)) => tokens_in_flight >= n,
                    (Trigger::Issue, AlertThreshold::BytesInFlight(n)) => bytes_in_flight >= n,
                    (Trigger::Retire(age), AlertThreshold::Age(max)) => *age >= max,
                    _ => false,
                });
            match hit {
                Some(threshold) => {
                    let sub = self.subscriptions.remove(i);
                    let age = match trigger {
                        Trigger::Retire(age) => Some(age),
                        Trigger::Issue => None,
                    };
                    fired.push((
                        sub.callback,
                        Alert {
                            threshold,
                            tokens_in_flight,
                            bytes_in_flight,
                            age,
                        },
                    ));
                }
                None => i += 1,
            }
        }
        fired
    }
}

// ─── TokenLedger ─────────────────────────────────────────────────────────────

/// Issues and retires in-flight tokens.
pub struct TokenLedger {
    state: Rc<RefCell<LedgerState>>,
}

/// Serializable view of the ledger counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSnapshot {
    pub bytes_issued: u64,
    pub tokens_issued: u64,
    pub bytes_in_flight: u64,
    pub tokens_in_flight: usize,
    pub bytes_retired: u64,
    pub tokens_retired: u64,
    pub log_depth: usize,
}

impl TokenLedger {
    /// Create a ledger that records retirements into `log`.
    pub fn new(log: RetirementLog) -> Self {
        Self::with_clock(log, Clock::new())
    }

    /// Create a ledger timed by `clock` (a mock clock in tests).
    pub fn with_clock(log: RetirementLog, clock: Clock) -> Self {
        TokenLedger {
            state: Rc::new(RefCell::new(LedgerState {
                clock,
                live: Slab::new(),
                bytes_issued: 0,
                tokens_issued: 0,
                bytes_in_flight: 0,
                log,
                subscriptions: Vec::new(),
            })),
        }
    }

    /// The clock ages are measured with.
    pub fn clock(&self) -> Clock {
        self.state.borrow().clock.clone()
    }

    /// Start tracking `byte_count` bytes and hand back the token that ends it.
    pub fn issue(&self, byte_count: u64) -> Token {
        let (token, fired) = {
            let mut state = self.state.borrow_mut();
            let issued_at = state.clock.now();
            let key = state.live.insert(LiveToken {
                byte_count,
                issued_at,
            });
            state.bytes_issued += byte_count;
            state.tokens_issued += 1;
            state.bytes_in_flight += byte_count;
            let token = Token {
                id: Some(TokenId(key)),
                byte_count,
                issued_at,
                ledger: Rc::downgrade(&self.state),
            };
            (token, state.take_fired(Trigger::Issue))
        };
        self.deliver(fired);
        token
    }

    fn retire_id(&self, id: TokenId) {
        let fired = {
            let mut state = self.state.borrow_mut();
            if !state.live.contains(id.0) {
                return;
            }
            let live = state.live.remove(id.0);
            state.bytes_in_flight -= live.byte_count;
            let age = state.clock.now().duration_since(live.issued_at);
            state.log.retire(live.byte_count, age);
            trace!(token = id.0, bytes = live.byte_count, ?age, "token retired");
            state.take_fired(Trigger::Retire(age))
        };
        self.deliver(fired);
    }

    fn deliver(&self, fired: Vec<(AlertCallback, Alert)>) {
        for (callback, alert) in fired {
            callback(self, &alert);
        }
    }

    /// Subscribe `callback` to a single threshold. Fires at most once.
    pub fn set_alert<F>(&self, threshold: AlertThreshold, callback: F)
    where
        F: FnOnce(&TokenLedger, &Alert) + 'static,
    {
        self.set_alerts(callback, [threshold]);
    }

    /// Subscribe `callback` to several thresholds. The first one met fires the
    /// callback and ends the whole subscription.
    pub fn set_alerts<F, I>(&self, callback: F, thresholds: I)
    where
        F: FnOnce(&TokenLedger, &Alert) + 'static,
        I: IntoIterator<Item = AlertThreshold>,
    {
        let thresholds: Vec<AlertThreshold> = thresholds.into_iter().collect();
        if thresholds.is_empty() {
            return;
        }
        self.state.borrow_mut().subscriptions.push(Subscription {
            thresholds,
            callback: Box::new(callback),
        });
    }

    /// Number of subscriptions waiting to fire.
    pub fn pending_alerts(&self) -> usize {
        self.state.borrow().subscriptions.len()
    }

    /// Whether any pending subscription watches issue-time thresholds.
    pub fn has_issue_alerts(&self) -> bool {
        self.state
            .borrow()
            .subscriptions
            .iter()
            .any(|s| s.thresholds.iter().any(|t| t.checked_on_issue()))
    }

    pub fn bytes_issued(&self) -> u64 {
        self.state.borrow().bytes_issued
    }

    pub fn tokens_issued(&self) -> u64 {
        self.state.borrow().tokens_issued
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.state.borrow().bytes_in_flight
    }

    pub fn tokens_in_flight(&self) -> usize {
        self.state.borrow().live.len()
    }

    pub fn bytes_retired(&self) -> u64 {
        let state = self.state.borrow();
        state.bytes_issued - state.bytes_in_flight
    }

    pub fn tokens_retired(&self) -> u64 {
        let state = self.state.borrow();
        state.tokens_issued - state.live.len() as u64
    }

    /// Samples currently held by the retirement log.
    pub fn depth(&self) -> usize {
        self.state.borrow().log.depth()
    }

    /// See [`RetirementLog::byte_count_quantiles`].
    pub fn byte_count_quantiles(&self, partitions: &[f64]) -> Option<Vec<u64>> {
        self.state.borrow_mut().log.byte_count_quantiles(partitions)
    }

    /// See [`RetirementLog::age_quantiles`].
    pub fn age_quantiles(&self, partitions: &[f64]) -> Option<Vec<Duration>> {
        self.state.borrow_mut().log.age_quantiles(partitions)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.borrow();
        LedgerSnapshot {
            bytes_issued: state.bytes_issued,
            tokens_issued: state.tokens_issued,
            bytes_in_flight: state.bytes_in_flight,
            tokens_in_flight: state.live.len(),
            bytes_retired: state.bytes_issued - state.bytes_in_flight,
            tokens_retired: state.tokens_issued - state.live.len() as u64,
            log_depth: state.log.depth(),
        }
    }
}

impl fmt::Debug for TokenLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenLedger")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

// ─── Token ───────────────────────────────────────────────────────────────────

/// Lifetime handle for one in-flight chunk of data.
///
/// Not `Clone`. Retiring is idempotent and also happens on drop.
#[derive(Debug)]
pub struct Token {
    id: Option<TokenId>,
    byte_count: u64,
    issued_at: Instant,
    ledger: Weak<RefCell<LedgerState>>,
}

impl Token {
    /// Id while the token is live; `None` once retired.
    pub fn id(&self) -> Option<TokenId> {
        self.id
    }

    pub fn byte_count(&self) -> u64 {
        self.byte_count
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    /// Whether the token is unretired and its ledger still exists.
    pub fn is_live(&self) -> bool {
        self.id.is_some() && self.ledger.strong_count() > 0
    }

    /// End the token's lifetime and record it in the ledger's log.
    pub fn retire(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let Some(state) = self.ledger.upgrade() else {
            return;
        };
        TokenLedger { state }.retire_id(id);
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        self.retire();
    }
}
