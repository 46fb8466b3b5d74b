//! Fan-out of chat payloads to every registered client but the sender.
//!
//! A broadcast takes a snapshot of the registry, releases the registry lock,
//! and then queues the payload on each recipient's outbox. Nothing here
//! waits on a socket: each session's writer task does the I/O, so a client
//! that stops reading only delays itself.

use std::io;

use bytes::Bytes;

use crate::registry::ClientRegistry;
use crate::session::{Session, SessionId};

/// Consecutive failed deliveries after which a recipient is asked to close.
pub const DEFAULT_WRITE_FAILURE_THRESHOLD: usize = 3;

/// Outcome of a single [`Broadcaster::broadcast`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

impl BroadcastReport {
    pub fn recipients(&self) -> usize {
        self.delivered + self.failed
    }
}

#[derive(Clone)]
pub struct Broadcaster {
    registry: ClientRegistry,
    /// `0` disables the threshold.
    failure_threshold: usize,
}

impl Broadcaster {
    pub fn new(registry: ClientRegistry) -> Self {
        Self::with_failure_threshold(registry, DEFAULT_WRITE_FAILURE_THRESHOLD)
    }

    pub fn with_failure_threshold(registry: ClientRegistry, failure_threshold: usize) -> Self {
        Self {
            registry,
            failure_threshold,
        }
    }

    /// Deliver `payload` to every registered session except `sender`.
    ///
    /// A recipient whose outbox is full or closed counts as failed; delivery
    /// to the others carries on, and the failing recipient stays registered
    /// until its own handler notices and cleans up. Nothing is retried.
    pub fn broadcast(&self, sender: SessionId, payload: &[u8]) -> BroadcastReport {
        let recipients = self.registry.snapshot_for_broadcast(sender);
        if recipients.is_empty() {
            return BroadcastReport::default();
        }

        let payload = Bytes::copy_from_slice(payload);
        let mut report = BroadcastReport::default();
        for recipient in &recipients {
            match self.deliver(recipient, payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(_) => report.failed += 1,
            }
        }
        tracing::trace!(
            %sender,
            bytes = payload.len(),
            delivered = report.delivered,
            failed = report.failed,
            "broadcast queued"
        );
        report
    }

    /// Deliver `payload` to a single session, with the same failure
    /// accounting as a broadcast.
    pub fn send_to(&self, recipient: &Session, payload: impl Into<Bytes>) -> io::Result<()> {
        self.deliver(recipient, payload.into())
    }

    fn deliver(&self, recipient: &Session, payload: Bytes) -> io::Result<()> {
        match recipient.send(payload) {
            Ok(()) => {
                recipient.reset_write_failures();
                Ok(())
            }
            Err(e) => {
                let failures = recipient.record_write_failure();
                tracing::debug!(
                    session = %recipient.id(),
                    name = recipient.name(),
                    failures,
                    ?e,
                    "delivery failed"
                );
                if self.failure_threshold > 0
                    && failures >= self.failure_threshold
                    && !recipient.is_close_requested()
                {
                    tracing::warn!(
                        name = recipient.name(),
                        failures,
                        "write failure threshold reached, closing session"
                    );
                    recipient.request_close();
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::RecordingWriter;
    use crate::session::OUTBOX_CAPACITY;
    use std::sync::atomic::Ordering;

    fn register(registry: &ClientRegistry, name: &str, writer: &RecordingWriter) -> Session {
        let session = Session::new(name, None, writer.boxed());
        registry.register(&session).unwrap();
        session
    }

    /// Broadcast to a stalled recipient until its outbox overflows once.
    fn fill_outbox(broadcaster: &Broadcaster, sender: SessionId) {
        for _ in 0..=OUTBOX_CAPACITY + 1 {
            if broadcaster.broadcast(sender, b"x\n").failed > 0 {
                return;
            }
        }
        panic!("outbox never filled up");
    }

    #[tokio::test]
    async fn broadcast_reaches_everyone_but_sender() {
        let registry = ClientRegistry::new();
        let broadcaster = Broadcaster::new(registry.clone());
        let writers: Vec<RecordingWriter> = (0..4).map(|_| RecordingWriter::new()).collect();
        let sessions: Vec<Session> = writers
            .iter()
            .enumerate()
            .map(|(i, w)| register(&registry, &format!("user{i}"), w))
            .collect();

        let report = broadcaster.broadcast(sessions[1].id(), b"[user1]: hi\n");

        assert_eq!(report, BroadcastReport { delivered: 3, failed: 0 });
        for (i, w) in writers.iter().enumerate().filter(|(i, _)| *i != 1) {
            w.wait_for_len(12).await;
            assert_eq!(w.text(), "[user1]: hi\n", "recipient {i} missed the payload");
        }
        assert!(writers[1].contents().is_empty(), "sender must not receive its own message");
    }

    #[tokio::test]
    async fn broadcast_with_no_other_members_is_empty() {
        let registry = ClientRegistry::new();
        let broadcaster = Broadcaster::new(registry.clone());
        let writer = RecordingWriter::new();
        let alone = register(&registry, "alone", &writer);

        let report = broadcaster.broadcast(alone.id(), b"anyone?\n");
        assert_eq!(report.recipients(), 0);
        assert!(writer.contents().is_empty());
    }

    #[tokio::test]
    async fn partial_writes_still_deliver_everything() {
        let registry = ClientRegistry::new();
        let broadcaster = Broadcaster::new(registry.clone());
        let sender = register(&registry, "sender", &RecordingWriter::new());
        let slow = RecordingWriter::chunked(5);
        register(&registry, "slow", &slow);

        let payload = b"[sender]: this message is longer than five bytes\n";
        let report = broadcaster.broadcast(sender.id(), payload);
        slow.wait_for_len(payload.len()).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(slow.contents(), payload.to_vec());
        assert_eq!(slow.writes.load(Ordering::SeqCst), payload.len().div_ceil(5));
    }

    #[tokio::test]
    async fn failing_recipient_does_not_block_others() {
        let registry = ClientRegistry::new();
        let broadcaster = Broadcaster::new(registry.clone());
        let sender = register(&registry, "a", &RecordingWriter::new());
        let broken = register(&registry, "b", &RecordingWriter::failing());
        let healthy = RecordingWriter::new();
        register(&registry, "c", &healthy);

        broadcaster.broadcast(sender.id(), b"[a]: hello\n");
        healthy.wait_for_len(11).await;
        assert_eq!(healthy.text(), "[a]: hello\n");

        // The broken socket asks for its session to close; removal is the
        // session's own handler's job
        tokio::time::timeout(std::time::Duration::from_secs(1), broken.close_requested())
            .await
            .unwrap();
        assert!(registry.get(broken.id()).is_some());

        let report = broadcaster.broadcast(sender.id(), b"[a]: again\n");
        assert_eq!(report, BroadcastReport { delivered: 1, failed: 1 });
        healthy.wait_for_len(22).await;
    }

    #[tokio::test]
    async fn stalled_recipient_does_not_block_others() {
        let registry = ClientRegistry::new();
        let broadcaster = Broadcaster::with_failure_threshold(registry.clone(), 0);
        let sender = register(&registry, "a", &RecordingWriter::new());
        register(&registry, "stuck", &RecordingWriter::stalled());
        let healthy = RecordingWriter::new();
        register(&registry, "c", &healthy);

        // Well past the stuck client's outbox; the healthy one keeps up
        for round in 1..=OUTBOX_CAPACITY * 2 {
            broadcaster.broadcast(sender.id(), b"x\n");
            healthy.wait_for_len(round * 2).await;
        }
    }

    #[tokio::test]
    async fn threshold_requests_close() {
        let registry = ClientRegistry::new();
        let broadcaster = Broadcaster::with_failure_threshold(registry.clone(), 2);
        let sender = register(&registry, "a", &RecordingWriter::new());
        let stuck = register(&registry, "b", &RecordingWriter::stalled());

        fill_outbox(&broadcaster, sender.id());
        assert_eq!(stuck.write_failures(), 1);
        assert!(!stuck.is_close_requested());

        broadcaster.broadcast(sender.id(), b"two\n");
        assert!(stuck.is_close_requested());
        assert!(!stuck.is_closed());
    }

    #[tokio::test]
    async fn zero_threshold_never_requests_close() {
        let registry = ClientRegistry::new();
        let broadcaster = Broadcaster::with_failure_threshold(registry.clone(), 0);
        let sender = register(&registry, "a", &RecordingWriter::new());
        let stuck = register(&registry, "b", &RecordingWriter::stalled());

        fill_outbox(&broadcaster, sender.id());
        for _ in 0..9 {
            broadcaster.broadcast(sender.id(), b"x\n");
        }
        assert_eq!(stuck.write_failures(), 10);
        assert!(!stuck.is_close_requested());
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let registry = ClientRegistry::new();
        let broadcaster = Broadcaster::new(registry.clone());
        let session = register(&registry, "a", &RecordingWriter::new());
        session.record_write_failure();
        session.record_write_failure();

        broadcaster.send_to(&session, &b"ok\n"[..]).unwrap();
        assert_eq!(session.write_failures(), 0);
    }

    #[tokio::test]
    async fn closed_recipient_counts_as_failed() {
        let registry = ClientRegistry::new();
        let broadcaster = Broadcaster::new(registry.clone());
        let sender = register(&registry, "a", &RecordingWriter::new());
        let gone = Session::new("b", None, RecordingWriter::new().boxed());
        gone.close(&registry).await;

        let err = broadcaster.send_to(&gone, &b"hello\n"[..]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert_eq!(broadcaster.broadcast(sender.id(), b"x\n").recipients(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_broadcasts_do_not_interleave() {
        let registry = ClientRegistry::new();
        let broadcaster = Broadcaster::new(registry.clone());
        let a = register(&registry, "a", &RecordingWriter::new());
        let b = register(&registry, "b", &RecordingWriter::new());
        let sink = RecordingWriter::chunked(2);
        register(&registry, "sink", &sink);

        let line_a = b"[a]: aaaaaaaaaaaaaaaaaaaa\n".to_vec();
        let line_b = b"[b]: bbbbbbbbbbbbbbbbbbbb\n".to_vec();
        let mut handles = Vec::new();
        for _ in 0..20 {
            let (bc, id, line) = (broadcaster.clone(), a.id(), line_a.clone());
            handles.push(tokio::spawn(async move { bc.broadcast(id, &line) }));
            let (bc, id, line) = (broadcaster.clone(), b.id(), line_b.clone());
            handles.push(tokio::spawn(async move { bc.broadcast(id, &line) }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        sink.wait_for_len(20 * line_a.len() + 20 * line_b.len()).await;

        let text = sink.text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 40);
        for line in lines {
            assert!(
                line == "[a]: aaaaaaaaaaaaaaaaaaaa" || line == "[b]: bbbbbbbbbbbbbbbbbbbb",
                "interleaved line: {line:?}"
            );
        }
    }

    #[tokio::test]
    async fn sequential_broadcasts_keep_order_per_recipient() {
        let registry = ClientRegistry::new();
        let broadcaster = Broadcaster::new(registry.clone());
        let sender = register(&registry, "a", &RecordingWriter::new());
        let rx = RecordingWriter::chunked(3);
        register(&registry, "b", &rx);

        for i in 0..10 {
            broadcaster.broadcast(sender.id(), format!("msg-{i}\n").as_bytes());
        }
        let expected: String = (0..10).map(|i| format!("msg-{i}\n")).collect();
        rx.wait_for_len(expected.len()).await;
        assert_eq!(rx.text(), expected);
    }
}
