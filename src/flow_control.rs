//! Flow-control accounting: outbound credit and inbound demand.
//!
//! Two pieces live here, one per direction of the credit protocol:
//!
//! - [`Limiter`] enforces the bounded policy on an emitter: a credit
//!   counter seeded by the request frame's initial request count,
//!   decremented per emission, incremented by REQUEST_N frames. Emission
//!   suspends (the producing task, not the connection) while credit is
//!   exhausted and resumes when credit is granted. An emitter never sends
//!   a payload frame while its credit is zero.
//! - [`RequestStrategy`] decides how much credit a receiving stream asks
//!   for: [`PrefetchStrategy`] keeps a window topped up in bursts, and
//!   [`ManualStrategy`] leaves every grant beyond the initial one to
//!   explicit `request_n` calls.

use std::sync::Mutex;

use tokio::sync::Notify;

use crate::error::{RSocketError, Result};

/// What ended a limiter's life; determines the error waiters observe.
#[derive(Debug, Clone)]
enum FailureKind {
    Cancelled,
    Closed,
    Errored(crate::error::ErrorCode, String),
}

impl FailureKind {
    fn to_error(&self) -> RSocketError {
        match self {
            FailureKind::Cancelled => RSocketError::canceled("stream was cancelled"),
            FailureKind::Closed => RSocketError::ConnectionClosed,
            FailureKind::Errored(code, message) => RSocketError::Stream {
                code: *code,
                message: message.clone(),
            },
        }
    }
}

#[derive(Debug)]
struct LimiterState {
    credit: i64,
    failure: Option<FailureKind>,
}

/// Credit counter for one outbound payload stream.
///
/// Emitters call [`acquire`](Limiter::acquire) before every payload frame;
/// the inbound dispatch loop calls [`grant`](Limiter::grant) when a
/// REQUEST_N frame arrives. Terminating the stream
/// ([`fail_cancelled`](Limiter::fail_cancelled) /
/// [`fail_closed`](Limiter::fail_closed)) wakes and fails any suspended
/// emitter deterministically.
#[derive(Debug)]
pub struct Limiter {
    state: Mutex<LimiterState>,
    notify: Notify,
}

impl Limiter {
    /// Create a limiter with `initial` credits.
    pub fn new(initial: u32) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                credit: i64::from(initial),
                failure: None,
            }),
            notify: Notify::new(),
        }
    }

    /// Consume one credit, suspending until one is available.
    ///
    /// Cancellation-safe: dropping the returned future leaves no stale
    /// state behind.
    pub async fn acquire(&self) -> Result<()> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(kind) = &state.failure {
                    return Err(kind.to_error());
                }
                if state.credit > 0 {
                    state.credit -= 1;
                    if state.credit > 0 {
                        // More credit left: pass the wakeup on to the next
                        // waiter, if any.
                        self.notify.notify_one();
                    }
                    return Ok(());
                }
            }
            self.notify.notified().await;
        }
    }

    /// Grant `n` additional credits, resuming a suspended emitter.
    ///
    /// Grants of zero are ignored.
    pub fn grant(&self, n: u32) {
        if n == 0 {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if state.failure.is_some() {
            return;
        }
        state.credit = state.credit.saturating_add(i64::from(n));
        drop(state);
        self.notify.notify_one();
    }

    /// Terminate with the cancellation signal; waiters observe `Canceled`.
    pub fn fail_cancelled(&self) {
        self.fail(FailureKind::Cancelled);
    }

    /// Terminate because the stream or connection closed.
    pub fn fail_closed(&self) {
        self.fail(FailureKind::Closed);
    }

    /// Terminate because the peer errored the stream; waiters observe the
    /// carried error.
    pub fn fail_errored(&self, code: crate::error::ErrorCode, message: String) {
        self.fail(FailureKind::Errored(code, message));
    }

    fn fail(&self, kind: FailureKind) {
        let mut state = self.state.lock().unwrap();
        if state.failure.is_none() {
            state.failure = Some(kind);
        }
        drop(state);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Current credit; may be observed mid-flight, for diagnostics only.
    pub fn available(&self) -> i64 {
        self.state.lock().unwrap().credit
    }
}

/// Decides how much credit a receiving stream requests from its peer.
pub trait RequestStrategy: Send + Sync + 'static {
    /// Credit carried in the request frame's initial request count.
    fn first_request(&mut self) -> u32;

    /// Additional credit to grant after one payload was delivered; zero
    /// means no REQUEST_N frame is sent.
    fn next_request(&mut self) -> u32;
}

impl RequestStrategy for Box<dyn RequestStrategy> {
    fn first_request(&mut self) -> u32 {
        (**self).first_request()
    }

    fn next_request(&mut self) -> u32 {
        (**self).next_request()
    }
}

/// Buffered window strategy: request `request_size` up front and another
/// `request_size` whenever only `request_on` requested items remain, so
/// delivery stays smooth without unbounded buffering.
#[derive(Debug, Clone)]
pub struct PrefetchStrategy {
    request_size: u32,
    request_on: u32,
    outstanding: u32,
}

impl PrefetchStrategy {
    /// # Panics
    ///
    /// Panics unless `request_size > request_on`.
    pub fn new(request_size: u32, request_on: u32) -> Self {
        assert!(
            request_size > request_on,
            "request_size must be greater than request_on"
        );
        Self {
            request_size,
            request_on,
            outstanding: request_size,
        }
    }
}

impl Default for PrefetchStrategy {
    fn default() -> Self {
        Self::new(64, 16)
    }
}

impl RequestStrategy for PrefetchStrategy {
    fn first_request(&mut self) -> u32 {
        self.outstanding = self.request_size;
        self.request_size
    }

    fn next_request(&mut self) -> u32 {
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.outstanding != self.request_on {
            return 0;
        }
        self.outstanding += self.request_size;
        self.request_size
    }
}

/// Fixed initial credit, no automatic refill; further credit is granted
/// only through explicit `request_n` calls on the receiving stream.
#[derive(Debug, Clone)]
pub struct ManualStrategy {
    initial: u32,
}

impl ManualStrategy {
    pub fn new(initial: u32) -> Self {
        Self { initial }
    }
}

impl RequestStrategy for ManualStrategy {
    fn first_request(&mut self) -> u32 {
        self.initial
    }

    fn next_request(&mut self) -> u32 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_acquire_within_credit() {
        let limiter = Limiter::new(3);
        for _ in 0..3 {
            limiter.acquire().await.unwrap();
        }
        assert_eq!(limiter.available(), 0);
    }

    #[tokio::test]
    async fn test_acquire_suspends_at_zero_credit() {
        let limiter = Limiter::new(1);
        limiter.acquire().await.unwrap();

        let blocked = timeout(Duration::from_millis(20), limiter.acquire()).await;
        assert!(blocked.is_err(), "acquire must suspend without credit");
    }

    #[tokio::test]
    async fn test_grant_resumes_suspended_emitter() {
        let limiter = Arc::new(Limiter::new(0));

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        limiter.grant(1);
        waiter.await.unwrap().unwrap();
        assert_eq!(limiter.available(), 0);
    }

    #[tokio::test]
    async fn test_emissions_never_exceed_granted_credit() {
        // Interleave grants and emissions; the emission count may never
        // exceed the cumulative grant at any point.
        let limiter = Arc::new(Limiter::new(2));
        let mut granted: u64 = 2;
        let mut emitted: u64 = 0;

        for round in 0..20u32 {
            while timeout(Duration::from_millis(5), limiter.acquire())
                .await
                .is_ok()
            {
                emitted += 1;
                assert!(emitted <= granted, "emitted {emitted} > granted {granted}");
            }
            assert_eq!(emitted, granted);

            let n = round % 3;
            limiter.grant(n);
            granted += u64::from(n);
        }
    }

    #[tokio::test]
    async fn test_fail_cancelled_wakes_waiter_with_canceled() {
        let limiter = Arc::new(Limiter::new(0));
        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        limiter.fail_cancelled();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_canceled());

        // Grants after failure are ignored; acquire keeps failing.
        limiter.grant(5);
        assert!(limiter.acquire().await.is_err());
    }

    #[tokio::test]
    async fn test_fail_closed_observed_as_connection_closed() {
        let limiter = Limiter::new(0);
        limiter.fail_closed();
        assert!(matches!(
            limiter.acquire().await.unwrap_err(),
            RSocketError::ConnectionClosed
        ));
    }

    #[test]
    fn test_prefetch_refill_arithmetic() {
        let mut strategy = PrefetchStrategy::new(30, 10);
        assert_eq!(strategy.first_request(), 30);

        // 19 deliveries leave 11 outstanding: no refill yet.
        for _ in 0..19 {
            assert_eq!(strategy.next_request(), 0);
        }
        // The 20th delivery hits the low-water mark and refills.
        assert_eq!(strategy.next_request(), 30);
        // Counter is topped back up; next deliveries stay quiet.
        assert_eq!(strategy.next_request(), 0);
    }

    #[test]
    fn test_manual_strategy_never_refills() {
        let mut strategy = ManualStrategy::new(2);
        assert_eq!(strategy.first_request(), 2);
        for _ in 0..10 {
            assert_eq!(strategy.next_request(), 0);
        }
    }

    #[test]
    #[should_panic(expected = "request_size must be greater")]
    fn test_prefetch_validates_window() {
        let _ = PrefetchStrategy::new(10, 10);
    }
}
