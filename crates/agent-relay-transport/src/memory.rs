//! In-process event-log transport.
//!
//! Models the properties the session layer relies on: a single ordered
//! inbound stream, and outbound submissions gated by a strictly increasing
//! ordering token (gaps allowed, reuse rejected). Useful for tests, demos
//! and single-process deployments.

use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

use agent_relay_core::{
    Confirmation, Submission, Transport, TransportEvent,
    traits::{EventStream, TransportError},
};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

struct Ledger {
    last_token: Option<u64>,
    submissions: Vec<Submission>,
    fail_next: usize,
}

/// Loopback transport backed by in-memory channels.
pub struct MemoryTransport {
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    outbound: broadcast::Sender<Submission>,
    ledger: Mutex<Ledger>,
    latency: Option<Duration>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Create a new in-memory transport.
    #[must_use]
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound, _) = broadcast::channel(1024);
        Self {
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            outbound,
            ledger: Mutex::new(Ledger {
                last_token: None,
                submissions: Vec::new(),
                fail_next: 0,
            }),
            latency: None,
        }
    }

    /// Delay every submission, widening the window for concurrent senders.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Append an agent-written event to the inbound log.
    ///
    /// # Errors
    /// Returns `TransportError::SubscriptionClosed` after [`Self::close`].
    pub fn publish(&self, event: TransportEvent) -> Result<(), TransportError> {
        let guard = self.inbound_tx.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = guard.as_ref().ok_or(TransportError::SubscriptionClosed)?;
        tx.send(event).map_err(|_| TransportError::SubscriptionClosed)
    }

    /// End the inbound stream once buffered events are drained.
    pub fn close(&self) {
        self.inbound_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Make the next `n` submissions fail without consuming a token.
    pub fn fail_next_submissions(&self, n: usize) {
        self.ledger().fail_next = n;
    }

    /// Accepted submissions in acceptance order.
    #[must_use]
    pub fn submissions(&self) -> Vec<Submission> {
        self.ledger().submissions.clone()
    }

    /// Number of accepted submissions.
    #[must_use]
    pub fn submission_count(&self) -> usize {
        self.ledger().submissions.len()
    }

    /// Live feed of accepted submissions, as agents would observe them.
    #[must_use]
    pub fn subscribe_outbound(&self) -> broadcast::Receiver<Submission> {
        self.outbound.subscribe()
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn subscribe(&self) -> Result<EventStream, TransportError> {
        let rx = self
            .inbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| TransportError::Subscription("already subscribed".into()))?;

        Ok(UnboundedReceiverStream::new(rx)
            .map(Ok::<_, TransportError>)
            .boxed())
    }

    async fn submit(&self, submission: Submission) -> Result<Confirmation, TransportError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let token = submission.ordering_token;
        {
            let mut ledger = self.ledger();
            if ledger.fail_next > 0 {
                ledger.fail_next -= 1;
                return Err(TransportError::Submit("injected failure".into()));
            }
            if let Some(last) = ledger.last_token {
                if token <= last {
                    return Err(TransportError::OutOfOrder {
                        expected: last + 1,
                        got: token,
                    });
                }
            }
            ledger.last_token = Some(token);
            ledger.submissions.push(submission.clone());
        }

        tracing::trace!(agent_id = %submission.agent_id, token, "submission accepted");
        let _ = self.outbound.send(submission);

        Ok(Confirmation {
            ordering_token: token,
            receipt: Uuid::new_v4().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_pending, assert_ready, task};

    use super::*;

    fn submission(token: u64) -> Submission {
        Submission {
            agent_id: "a1".into(),
            seq: token + 1,
            payload: "{}".into(),
            ordering_token: token,
            final_fragment: true,
            encrypted: false,
        }
    }

    fn event(seq: u64) -> TransportEvent {
        TransportEvent {
            agent_id: "a1".into(),
            seq,
            data: "x".into(),
            final_fragment: true,
            encrypted: false,
        }
    }

    #[tokio::test]
    async fn test_subscribe_delivers_in_order() {
        let transport = MemoryTransport::new();
        transport.publish(event(1)).unwrap();
        transport.publish(event(2)).unwrap();
        transport.close();

        let seqs: Vec<u64> = transport
            .subscribe()
            .unwrap()
            .map(|e| e.unwrap().seq)
            .collect()
            .await;
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn test_subscription_waits_for_events() {
        let transport = MemoryTransport::new();
        let mut events = task::spawn(transport.subscribe().unwrap());
        assert_pending!(events.poll_next());

        transport.publish(event(4)).unwrap();
        assert!(events.is_woken());
        let received = assert_ready!(events.poll_next()).unwrap().unwrap();
        assert_eq!(received.seq, 4);
    }

    #[test]
    fn test_subscribe_is_not_restartable() {
        let transport = MemoryTransport::new();
        assert!(transport.subscribe().is_ok());
        assert!(matches!(
            transport.subscribe(),
            Err(TransportError::Subscription(_))
        ));
    }

    #[test]
    fn test_publish_after_close_fails() {
        let transport = MemoryTransport::new();
        transport.close();
        assert!(matches!(
            transport.publish(event(1)),
            Err(TransportError::SubscriptionClosed)
        ));
    }

    #[tokio::test]
    async fn test_token_reuse_rejected_gaps_allowed() {
        let transport = MemoryTransport::new();
        transport.submit(submission(0)).await.unwrap();
        transport.submit(submission(2)).await.unwrap();

        let err = transport.submit(submission(2)).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::OutOfOrder {
                expected: 3,
                got: 2
            }
        ));
        assert_eq!(transport.submission_count(), 2);
    }

    #[tokio::test]
    async fn test_injected_failure_consumes_nothing() {
        let transport = MemoryTransport::new();
        transport.fail_next_submissions(1);
        assert!(matches!(
            transport.submit(submission(0)).await,
            Err(TransportError::Submit(_))
        ));
        let confirmation = transport.submit(submission(1)).await.unwrap();
        assert_eq!(confirmation.ordering_token, 1);
        assert_eq!(transport.submission_count(), 1);
    }

    #[tokio::test]
    async fn test_outbound_feed() {
        let transport = MemoryTransport::new();
        let mut rx = transport.subscribe_outbound();
        transport.submit(submission(5)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().ordering_token, 5);
    }
}
