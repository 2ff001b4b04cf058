//! Scripted transport and recording applier for testing the session.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use walrelay_core::{ApplyOutcome, StatementKind};

use crate::apply::ChangeApplier;
use crate::error::{PgError, PgResult};
use crate::replication::{CopyRead, ReplicationTransport};

/// Ordered log of calls made on the mocks, shared between them.
#[derive(Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    /// Number of entries equal to `entry`.
    pub fn count(&self, entry: &str) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.as_str() == entry)
            .count()
    }
}

/// One scripted step of the inbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    /// A CopyData body.
    Frame(Bytes),
    /// Nothing available right now.
    WouldBlock,
    /// Server ended the COPY stream.
    End,
    /// Hard connection failure.
    Fail(String),
    /// Nothing available and the socket never becomes readable.
    /// Stays at the head of the script.
    Stall,
}

/// A mock replication transport driven by a script of [`MockEvent`]s.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<TransportState>>,
    journal: Journal,
}

#[derive(Default)]
struct TransportState {
    script: VecDeque<MockEvent>,
    sent: Vec<Bytes>,
    closed: bool,
    fail_sends: bool,
}

impl MockTransport {
    pub fn new(journal: Journal) -> Self {
        Self {
            state: Arc::new(Mutex::new(TransportState::default())),
            journal,
        }
    }

    /// Make every send fail.
    pub fn failing_sends(self) -> Self {
        self.state.lock().unwrap().fail_sends = true;
        self
    }

    pub fn push(&self, event: MockEvent) {
        self.state.lock().unwrap().script.push_back(event);
    }

    pub fn push_frame(&self, frame: Bytes) {
        self.push(MockEvent::Frame(frame));
    }

    /// All CopyData bodies sent to the origin.
    pub fn sent(&self) -> Vec<Bytes> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn is_stalled(&self) -> bool {
        let state = self.state.lock().unwrap();
        matches!(state.script.front(), None | Some(MockEvent::Stall))
    }
}

impl ReplicationTransport for MockTransport {
    fn try_next_frame(&mut self) -> PgResult<CopyRead> {
        let mut state = self.state.lock().unwrap();
        match state.script.pop_front() {
            None | Some(MockEvent::WouldBlock) => Ok(CopyRead::WouldBlock),
            Some(MockEvent::Stall) => {
                state.script.push_front(MockEvent::Stall);
                Ok(CopyRead::WouldBlock)
            }
            Some(MockEvent::Frame(data)) => Ok(CopyRead::Data(data)),
            Some(MockEvent::End) => Ok(CopyRead::Done),
            Some(MockEvent::Fail(message)) => Err(PgError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                message,
            ))),
        }
    }

    async fn wait_readable(&mut self) -> PgResult<()> {
        self.journal.record("wait");
        if self.is_stalled() {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn consume_input(&mut self) -> PgResult<()> {
        Ok(())
    }

    async fn send_copy_data(&mut self, data: &[u8]) -> PgResult<()> {
        self.journal.record("feedback");
        let mut state = self.state.lock().unwrap();
        if state.fail_sends {
            return Err(PgError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "could not send data",
            )));
        }
        state.sent.push(Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn close(&mut self) {
        self.journal.record("close");
        self.state.lock().unwrap().closed = true;
    }
}

/// A mock applier that records statements per committed batch.
#[derive(Clone)]
pub struct MockApplier {
    state: Arc<Mutex<ApplierState>>,
    journal: Journal,
}

#[derive(Default)]
struct ApplierState {
    open: Option<Vec<String>>,
    committed: Vec<Vec<String>>,
    /// Statements that ran successfully, in order, across all batches.
    effects: Vec<String>,
    failing: HashSet<String>,
}

impl MockApplier {
    pub fn new(journal: Journal) -> Self {
        Self {
            state: Arc::new(Mutex::new(ApplierState::default())),
            journal,
        }
    }

    /// Make `statement` fail like an SQL error would.
    pub fn fail_on(&self, statement: impl Into<String>) {
        self.state.lock().unwrap().failing.insert(statement.into());
    }

    /// Statements of every committed batch.
    pub fn committed(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().committed.clone()
    }

    pub fn effects(&self) -> Vec<String> {
        self.state.lock().unwrap().effects.clone()
    }

    pub fn in_transaction(&self) -> bool {
        self.state.lock().unwrap().open.is_some()
    }
}

impl ChangeApplier for MockApplier {
    async fn begin(&mut self) -> PgResult<()> {
        self.journal.record("begin");
        self.state.lock().unwrap().open = Some(Vec::new());
        Ok(())
    }

    async fn apply(&mut self, statement: &str) -> PgResult<ApplyOutcome> {
        self.journal.record(format!("apply {}", statement));
        let mut state = self.state.lock().unwrap();
        let Some(batch) = state.open.as_mut() else {
            return Err(PgError::Apply("no transaction is open".into()));
        };
        batch.push(statement.to_string());

        if state.failing.contains(statement) {
            return Ok(ApplyOutcome::Other);
        }
        state.effects.push(statement.to_string());
        Ok(StatementKind::classify(statement).outcome())
    }

    async fn commit(&mut self) -> PgResult<()> {
        self.journal.record("commit");
        let mut state = self.state.lock().unwrap();
        let batch = state
            .open
            .take()
            .ok_or_else(|| PgError::Apply("commit without begin".into()))?;
        state.committed.push(batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_transport_follows_script() {
        let journal = Journal::default();
        let mut transport = MockTransport::new(journal.clone());
        transport.push_frame(Bytes::from_static(b"k"));
        transport.push(MockEvent::WouldBlock);
        transport.push(MockEvent::End);

        assert_eq!(
            transport.try_next_frame().unwrap(),
            CopyRead::Data(Bytes::from_static(b"k"))
        );
        assert_eq!(transport.try_next_frame().unwrap(), CopyRead::WouldBlock);
        assert_eq!(transport.try_next_frame().unwrap(), CopyRead::Done);
        assert_eq!(transport.try_next_frame().unwrap(), CopyRead::WouldBlock);
    }

    #[tokio::test]
    async fn test_mock_transport_stall_is_sticky() {
        let mut transport = MockTransport::new(Journal::default());
        transport.push(MockEvent::Stall);
        transport.push_frame(Bytes::from_static(b"w"));

        assert_eq!(transport.try_next_frame().unwrap(), CopyRead::WouldBlock);
        assert_eq!(transport.try_next_frame().unwrap(), CopyRead::WouldBlock);

        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(20), transport.wait_readable())
                .await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_mock_applier_records_batches() {
        let journal = Journal::default();
        let mut applier = MockApplier::new(journal.clone());
        applier.fail_on("BROKEN");

        applier.begin().await.unwrap();
        assert_eq!(
            applier.apply("INSERT INTO t VALUES (1)").await.unwrap(),
            ApplyOutcome::Inserted
        );
        assert_eq!(applier.apply("BROKEN").await.unwrap(), ApplyOutcome::Other);
        applier.commit().await.unwrap();

        assert_eq!(
            applier.committed(),
            vec![vec!["INSERT INTO t VALUES (1)".to_string(), "BROKEN".to_string()]]
        );
        assert_eq!(applier.effects(), vec!["INSERT INTO t VALUES (1)"]);
        assert_eq!(
            journal.entries(),
            vec!["begin", "apply INSERT INTO t VALUES (1)", "apply BROKEN", "commit"]
        );
    }

    #[tokio::test]
    async fn test_mock_applier_requires_transaction() {
        let mut applier = MockApplier::new(Journal::default());
        assert!(applier.apply("INSERT INTO t VALUES (1)").await.is_err());
        assert!(applier.commit().await.is_err());
    }
}
