//! Readiness polling policy.

use core::time::Duration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::{Error, Result};

/// How long, and how often, to poll the status register while the device is busy.
///
/// The default policy polls back-to-back forever, so a device which never
/// becomes ready hangs the caller. Use [`PollPolicy::bounded`] to give up
/// with [`Error::Unresponsive`] instead.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    /// Give up once this much time has passed since polling started.
    pub timeout: Option<Duration>,
    /// Sleep between the first two polls. Zero polls back-to-back.
    pub backoff: Duration,
    /// The sleep doubles after each poll up to this limit.
    pub max_backoff: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy::unbounded()
    }
}

impl PollPolicy {
    pub const fn unbounded() -> Self {
        PollPolicy {
            timeout: None,
            backoff: Duration::from_millis(0),
            max_backoff: Duration::from_millis(0),
        }
    }

    /// Poll for at most `timeout`, sleeping `backoff` after the first busy
    /// poll and doubling the sleep up to ten times `backoff`.
    pub fn bounded(timeout: Duration, backoff: Duration) -> Self {
        PollPolicy { timeout: Some(timeout), backoff, max_backoff: backoff * 10 }
    }

    /// Begin a wait, observing `cancel`.
    pub(crate) fn start<'c>(&self, cancel: &'c CancelToken) -> PollState<'c> {
        PollState { policy: *self, cancel, t0: Instant::now(), next: self.backoff, polls: 0 }
    }
}

/// One wait in progress.
pub(crate) struct PollState<'c> {
    policy: PollPolicy,
    cancel: &'c CancelToken,
    t0: Instant,
    next: Duration,
    polls: usize,
}

impl<'c> PollState<'c> {
    /// Called after each busy poll. Returns how long to sleep before
    /// polling again, or an error if the wait must end.
    pub fn next_wait(&mut self) -> Result<Duration> {
        self.polls += 1;
        if self.cancel.is_cancelled() {
            log::error!("Wait cancelled after {} polls", self.polls);
            return Err(Error::Cancelled);
        }
        if let Some(timeout) = self.policy.timeout {
            let waited = self.t0.elapsed();
            if waited >= timeout {
                log::error!("Device still busy after {} polls over {:?}", self.polls, waited);
                return Err(Error::Unresponsive { waited });
            }
        }
        let wait = self.next;
        self.next = core::cmp::min(self.next * 2, self.policy.max_backoff);
        Ok(wait)
    }

    pub fn polls(&self) -> usize {
        self.polls
    }
}

/// Shared flag which aborts a readiness wait from another thread.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[test]
fn test_backoff_doubles_to_limit() {
    let cancel = CancelToken::new();
    let policy = PollPolicy::bounded(Duration::from_secs(60), Duration::from_millis(2));
    let mut state = policy.start(&cancel);
    let waits: Vec<u128> = (0..6).map(|_| state.next_wait().unwrap().as_millis()).collect();
    assert_eq!(waits, vec![2, 4, 8, 16, 20, 20]);
    assert_eq!(state.polls(), 6);
}

#[test]
fn test_unbounded_never_expires() {
    let cancel = CancelToken::new();
    let mut state = PollPolicy::default().start(&cancel);
    for _ in 0..10_000 {
        assert_eq!(state.next_wait().unwrap(), Duration::from_millis(0));
    }
}

#[test]
fn test_timeout_and_cancel() {
    let cancel = CancelToken::new();
    let policy = PollPolicy::bounded(Duration::from_millis(0), Duration::from_millis(0));
    match policy.start(&cancel).next_wait() {
        Err(Error::Unresponsive { .. }) => (),
        other => panic!("expected Unresponsive, got {:?}", other),
    }

    cancel.clone().cancel();
    match PollPolicy::default().start(&cancel).next_wait() {
        Err(Error::Cancelled) => (),
        other => panic!("expected Cancelled, got {:?}", other),
    }
}
