//! Publisher-confirm tracking
//!
//! In confirm mode every publish is assigned a monotonically increasing
//! sequence number, in the same total order the frames enter the wire;
//! the writer task therefore assigns sequences, not the publishing caller.
//! Outstanding publishes keep their frames so an involuntary disconnect can
//! replay them after recovery.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use coney_codec::Frame;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::Error;

/// Outcome of a publish in confirm mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// The server took responsibility for the message
    Ack,
    /// The server refused responsibility, e.g. an internal error
    Nack,
}

/// Completion handle for one tracked publish
#[derive(Debug)]
pub(crate) struct ConfirmHandle(oneshot::Sender<Result<ConfirmOutcome, Error>>);

impl ConfirmHandle {
    pub(crate) fn resolve(self, outcome: ConfirmOutcome) {
        // the receiver may have been dropped (detached publish); fine
        let _ = self.0.send(Ok(outcome));
    }

    pub(crate) fn fail(self, error: Error) {
        let _ = self.0.send(Err(error));
    }
}

/// Future resolving when the server confirms (or refuses) a publish
///
/// Outside confirm mode the future resolves [`ConfirmOutcome::Ack`]
/// immediately. Dropping the future detaches the completion; the sequence
/// stays tracked until the server settles it.
#[derive(Debug)]
pub struct Confirmation {
    inner: ConfirmationInner,
}

#[derive(Debug)]
enum ConfirmationInner {
    Resolved(Option<ConfirmOutcome>),
    Pending(oneshot::Receiver<Result<ConfirmOutcome, Error>>),
}

impl Confirmation {
    /// An already-settled confirmation, used outside confirm mode
    pub(crate) fn resolved(outcome: ConfirmOutcome) -> Self {
        Self {
            inner: ConfirmationInner::Resolved(Some(outcome)),
        }
    }

    /// A pending confirmation plus the handle that settles it
    pub(crate) fn pending() -> (Self, ConfirmHandle) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                inner: ConfirmationInner::Pending(rx),
            },
            ConfirmHandle(tx),
        )
    }
}

impl Future for Confirmation {
    type Output = Result<ConfirmOutcome, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            ConfirmationInner::Resolved(outcome) => Poll::Ready(Ok(outcome
                .take()
                .expect("Confirmation polled after completion"))),
            ConfirmationInner::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                // tracker dropped without settling: the channel died
                Poll::Ready(Err(_)) => Poll::Ready(Err(Error::OperationInterrupted)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// One tracked publish: its completion handle and the frames to replay
/// if the transport drops before the server settles it
#[derive(Debug)]
pub(crate) struct PendingPublish {
    pub handle: Option<ConfirmHandle>,
    pub frames: Vec<Frame>,
}

#[derive(Debug)]
struct TrackerInner {
    enabled: bool,
    next_publish_seq: u64,
    pending: BTreeMap<u64, PendingPublish>,
}

/// Per-channel publisher-confirm state
#[derive(Debug)]
pub(crate) struct ConfirmTracker {
    inner: Mutex<TrackerInner>,
}

impl ConfirmTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                enabled: false,
                next_publish_seq: 1,
                pending: BTreeMap::new(),
            }),
        }
    }

    /// Flips the channel into confirm mode; called on `confirm.select-ok`
    pub fn enable(&self) {
        self.inner.lock().enabled = true;
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    /// The sequence the next tracked publish will receive
    pub fn next_publish_seq(&self) -> u64 {
        self.inner.lock().next_publish_seq
    }

    /// Assigns the next sequence to a publish. Writer-path only: the
    /// sequence order must equal the wire order.
    pub fn assign(&self, publish: PendingPublish) -> u64 {
        let mut inner = self.inner.lock();
        let seq = inner.next_publish_seq;
        inner.next_publish_seq += 1;
        inner.pending.insert(seq, publish);
        seq
    }

    /// Resolves `basic.ack` from the server
    pub fn on_ack(&self, delivery_tag: u64, multiple: bool) {
        self.settle(delivery_tag, multiple, ConfirmOutcome::Ack);
    }

    /// Resolves `basic.nack` from the server
    pub fn on_nack(&self, delivery_tag: u64, multiple: bool) {
        self.settle(delivery_tag, multiple, ConfirmOutcome::Nack);
    }

    fn settle(&self, delivery_tag: u64, multiple: bool, outcome: ConfirmOutcome) {
        let settled = {
            let mut inner = self.inner.lock();
            if multiple {
                let rest = inner.pending.split_off(&(delivery_tag + 1));
                std::mem::replace(&mut inner.pending, rest)
            } else {
                let mut single = BTreeMap::new();
                if let Some(publish) = inner.pending.remove(&delivery_tag) {
                    single.insert(delivery_tag, publish);
                }
                single
            }
        };
        for (_, publish) in settled {
            if let Some(handle) = publish.handle {
                handle.resolve(outcome);
            }
        }
    }

    /// Fails every outstanding publish, e.g. when the channel closes
    pub fn fail_outstanding(&self, mut error: impl FnMut() -> Error) {
        let pending = std::mem::take(&mut self.inner.lock().pending);
        for (_, publish) in pending {
            if let Some(handle) = publish.handle {
                handle.fail(error());
            }
        }
    }

    /// Drains unsettled publishes for replay after recovery and resets
    /// the tracker to its pre-`confirm.select` state
    pub fn take_unconfirmed(&self) -> Vec<PendingPublish> {
        let mut inner = self.inner.lock();
        inner.enabled = false;
        inner.next_publish_seq = 1;
        std::mem::take(&mut inner.pending)
            .into_values()
            .collect()
    }

    #[cfg(test)]
    pub fn unconfirmed_seqs(&self) -> Vec<u64> {
        self.inner.lock().pending.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked(tracker: &ConfirmTracker) -> (u64, Confirmation) {
        let (confirmation, handle) = Confirmation::pending();
        let seq = tracker.assign(PendingPublish {
            handle: Some(handle),
            frames: Vec::new(),
        });
        (seq, confirmation)
    }

    #[tokio::test]
    async fn sequences_start_at_one_and_increase() {
        let tracker = ConfirmTracker::new();
        tracker.enable();
        let (s1, _c1) = tracked(&tracker);
        let (s2, _c2) = tracked(&tracker);
        assert_eq!((s1, s2), (1, 2));
        assert_eq!(tracker.next_publish_seq(), 3);
    }

    #[tokio::test]
    async fn single_ack_settles_only_that_sequence() {
        let tracker = ConfirmTracker::new();
        tracker.enable();
        let (_s1, c1) = tracked(&tracker);
        let (_s2, _c2) = tracked(&tracker);

        tracker.on_ack(1, false);
        assert_eq!(c1.await.unwrap(), ConfirmOutcome::Ack);
        assert_eq!(tracker.unconfirmed_seqs(), vec![2]);
    }

    #[tokio::test]
    async fn cumulative_ack_settles_a_prefix() {
        let tracker = ConfirmTracker::new();
        tracker.enable();
        let confirmations: Vec<_> = (0..5).map(|_| tracked(&tracker).1).collect();

        tracker.on_ack(3, true);
        for c in confirmations.into_iter().take(3) {
            assert_eq!(c.await.unwrap(), ConfirmOutcome::Ack);
        }
        // the unresolved set is a contiguous suffix
        assert_eq!(tracker.unconfirmed_seqs(), vec![4, 5]);
    }

    #[tokio::test]
    async fn nack_resolves_with_nack() {
        let tracker = ConfirmTracker::new();
        tracker.enable();
        let (_s, c) = tracked(&tracker);
        tracker.on_nack(1, false);
        assert_eq!(c.await.unwrap(), ConfirmOutcome::Nack);
    }

    #[tokio::test]
    async fn fail_outstanding_interrupts_every_pending_publish() {
        let tracker = ConfirmTracker::new();
        tracker.enable();
        let (_s1, c1) = tracked(&tracker);
        let (_s2, c2) = tracked(&tracker);
        tracker.fail_outstanding(|| Error::OperationInterrupted);
        assert!(matches!(c1.await, Err(Error::OperationInterrupted)));
        assert!(matches!(c2.await, Err(Error::OperationInterrupted)));
        assert!(tracker.unconfirmed_seqs().is_empty());
    }

    #[tokio::test]
    async fn detached_confirmation_keeps_sequence_tracked() {
        let tracker = ConfirmTracker::new();
        tracker.enable();
        let (_seq, confirmation) = tracked(&tracker);
        drop(confirmation);
        assert_eq!(tracker.unconfirmed_seqs(), vec![1]);
        // settling a detached publish must not panic
        tracker.on_ack(1, false);
        assert!(tracker.unconfirmed_seqs().is_empty());
    }

    #[tokio::test]
    async fn take_unconfirmed_resets_the_tracker() {
        let tracker = ConfirmTracker::new();
        tracker.enable();
        let (_s1, _c1) = tracked(&tracker);
        let (_s2, _c2) = tracked(&tracker);
        let replay = tracker.take_unconfirmed();
        assert_eq!(replay.len(), 2);
        assert!(!tracker.is_enabled());
        assert_eq!(tracker.next_publish_seq(), 1);
    }

    #[tokio::test]
    async fn non_confirm_mode_resolves_immediately() {
        let confirmation = Confirmation::resolved(ConfirmOutcome::Ack);
        assert_eq!(confirmation.await.unwrap(), ConfirmOutcome::Ack);
    }
}
