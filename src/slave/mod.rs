//! Slave agent.
//!
//! Maintains a single outbound link to the master, applies everything the
//! master sends to the local store, and recovers missing schema on demand. A
//! supervisor redials on a fixed interval whenever the link drops; apply
//! failures never terminate the link.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{NetworkError, Result};
use crate::protocol::{LineCodec, Message, TableCount, RESULT_END};
use crate::storage::{sql, SharedStorage};
use crate::verify::{self, VerificationReport};

/// Queued statements per table before further arrivals are refused.
const PENDING_CAP: usize = 256;
/// Replay attempts per queued statement before it is dropped.
const REPLAY_ATTEMPTS: u8 = 3;

/// Link state of the slave's master connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live link; the supervisor is waiting to redial
    Disconnected,
    /// Dialing the master
    Connecting,
    /// Link up, bootstrap snapshot still streaming
    Bootstrapping,
    /// Bootstrap complete, applying live traffic
    Steady,
}

/// Events surfaced to the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum SlaveEvent {
    /// Bootstrap finished and the link entered steady state
    BootstrapComplete,
    /// Informational text from the master
    Notification(String),
    /// An `error:` line from the master
    MasterError(String),
    /// The master dropped the database
    DatabaseDropped(String),
    /// A query-result sub-block, rows as raw strings
    QueryResult {
        /// Column names
        columns: Vec<String>,
        /// Row data
        rows: Vec<Vec<String>>,
    },
    /// A completed consistency check
    Verification(VerificationReport),
}

/// Slave configuration.
#[derive(Debug, Clone)]
pub struct SlaveConfig {
    /// Master address to dial
    pub master_addr: String,
    /// Fixed redial interval; no backoff growth
    pub retry_interval: Duration,
}

impl SlaveConfig {
    /// Creates a configuration with the default 5 second retry interval.
    pub fn new(master_addr: impl Into<String>) -> Self {
        Self {
            master_addr: master_addr.into(),
            retry_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct PendingStatement {
    statement: String,
    attempts: u8,
}

struct AgentInner {
    config: SlaveConfig,
    storage: SharedStorage,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SlaveEvent>,
    /// Write half of the live link. The receive task (recovery requests) and
    /// the embedding application (interactive requests) both write here; the
    /// lock keeps their lines from interleaving.
    writer: Mutex<Option<FramedWrite<OwnedWriteHalf, LineCodec>>>,
    /// Statements that failed on a missing table, keyed by table name,
    /// replayed once the matching create_table applies.
    pending: parking_lot::Mutex<HashMap<String, VecDeque<PendingStatement>>>,
    replicating: AtomicBool,
}

/// The slave side of a replication deployment.
#[derive(Clone)]
pub struct SlaveAgent {
    inner: Arc<AgentInner>,
    shutdown: CancellationToken,
}

impl SlaveAgent {
    /// Creates an agent over the given store.
    pub fn new(config: SlaveConfig, storage: SharedStorage) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(AgentInner {
                config,
                storage,
                state_tx,
                events,
                writer: Mutex::new(None),
                pending: parking_lot::Mutex::new(HashMap::new()),
                replicating: AtomicBool::new(false),
            }),
            shutdown: CancellationToken::new(),
        }
    }

    /// Watches the link state.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribes to agent events.
    pub fn subscribe(&self) -> broadcast::Receiver<SlaveEvent> {
        self.inner.events.subscribe()
    }

    /// Whether a bootstrap snapshot is currently streaming.
    pub fn replicating(&self) -> bool {
        self.inner.replicating.load(Ordering::SeqCst)
    }

    /// Queued statements waiting for a table's schema, for inspection.
    pub fn pending_statements(&self, table: &str) -> usize {
        self.inner
            .pending
            .lock()
            .get(table)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Stops the supervisor after the current link drops.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Sends a request line to the master over the live link.
    pub async fn send_request(&self, msg: Message) -> Result<()> {
        self.inner.send_line(msg.encode()).await
    }

    /// Asks the master for a verification report; the resulting
    /// [`SlaveEvent::Verification`] arrives via [`SlaveAgent::subscribe`].
    pub async fn request_verification(&self) -> Result<()> {
        self.send_request(Message::VerifyReplication).await
    }

    /// Runs the dial-and-receive supervisor until [`SlaveAgent::shutdown`].
    ///
    /// Redials on a fixed interval with no cap and no backoff growth.
    pub async fn run(&self) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            self.inner.set_state(ConnectionState::Connecting);
            match TcpStream::connect(&self.inner.config.master_addr).await {
                Ok(stream) => {
                    info!(master = %self.inner.config.master_addr, "connected to master");
                    if let Err(e) = self.run_link(stream).await {
                        warn!(error = %e, "link failed");
                    } else {
                        info!("master closed the link");
                    }
                }
                Err(e) => {
                    debug!(master = %self.inner.config.master_addr, error = %e, "dial failed");
                }
            }
            self.inner.set_state(ConnectionState::Disconnected);
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.inner.config.retry_interval) => {}
            }
        }
    }

    async fn run_link(&self, stream: TcpStream) -> Result<()> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, LineCodec::default());
        *self.inner.writer.lock().await =
            Some(FramedWrite::new(write_half, LineCodec::default()));
        self.inner.set_state(ConnectionState::Bootstrapping);

        let result = self.receive_loop(&mut reader).await;

        *self.inner.writer.lock().await = None;
        self.inner.replicating.store(false, Ordering::SeqCst);
        result
    }

    async fn receive_loop(
        &self,
        reader: &mut FramedRead<OwnedReadHalf, LineCodec>,
    ) -> Result<()> {
        loop {
            let line = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                line = reader.next() => line,
            };
            let line = match line {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    warn!(error = %e, "failed to decode line");
                    continue;
                }
                None => return Ok(()),
            };

            let msg = match Message::parse(&line) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(error = %e, "malformed line skipped");
                    continue;
                }
            };

            // Sub-blocks are consumed to completion here before any other
            // dispatch happens on this connection.
            match msg {
                Message::Success { ref detail } => match msg.column_count() {
                    Some(columns) => self.read_query_result(reader, columns).await,
                    None => debug!(detail = %detail, "master ack"),
                },
                Message::VerificationBegin => self.read_verification(reader).await,
                other => self.inner.handle_message(other).await,
            }
        }
    }

    /// Reads a query-result sub-block and surfaces it as an event.
    async fn read_query_result(
        &self,
        reader: &mut FramedRead<OwnedReadHalf, LineCodec>,
        expected_columns: usize,
    ) {
        let Some(header) = next_line(reader).await else {
            warn!("link closed inside a query-result block");
            return;
        };
        let columns: Vec<String> = header.split(',').map(str::to_string).collect();
        if columns.len() != expected_columns {
            debug!(
                expected = expected_columns,
                got = columns.len(),
                "column header count differs from announcement"
            );
        }

        let mut rows = Vec::new();
        loop {
            match next_line(reader).await {
                Some(line) if line == RESULT_END => break,
                Some(line) => rows.push(line.split(',').map(str::to_string).collect()),
                None => {
                    warn!("link closed inside a query-result block");
                    return;
                }
            }
        }
        self.inner.emit(SlaveEvent::QueryResult { columns, rows });
    }

    /// Reads a verification report sub-block, compares it against local
    /// counts, and surfaces the result.
    async fn read_verification(&self, reader: &mut FramedRead<OwnedReadHalf, LineCodec>) {
        let mut counts: Vec<TableCount> = Vec::new();
        loop {
            let Some(line) = next_line(reader).await else {
                warn!("link closed inside a verification block");
                return;
            };
            if let Ok(Message::VerificationEnd) = Message::parse(&line) {
                break;
            }
            match TableCount::parse(&line) {
                Ok(entry) => counts.push(entry),
                Err(e) => warn!(error = %e, "malformed report line skipped"),
            }
        }

        let local = match verify::local_counts(self.inner.storage.as_ref()).await {
            Ok(local) => local,
            Err(e) => {
                warn!(error = %e, "failed to collect local counts");
                return;
            }
        };
        let report = VerificationReport::compare(&counts, &local);
        info!(synchronized = report.synchronized(), "verification complete");
        self.inner.emit(SlaveEvent::Verification(report));
    }
}

impl AgentInner {
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: SlaveEvent) {
        // No receivers is fine; events are advisory.
        let _ = self.events.send(event);
    }

    async fn send_line(&self, line: String) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(w) => w.send(line).await,
            None => Err(NetworkError::ConnectionClosed("no live master link".to_string()).into()),
        }
    }

    /// Applies one decoded message. Failures are logged; the link stays up.
    async fn handle_message(&self, msg: Message) {
        match msg {
            Message::InitReplication { database } => {
                self.replicating.store(true, Ordering::SeqCst);
                info!(database = %database, "bootstrap started");
                if let Err(e) = self.storage.create_database(&database).await {
                    warn!(error = %e, "failed to select database");
                }
            }
            Message::CreateDb { database } => {
                if let Err(e) = self.storage.create_database(&database).await {
                    warn!(error = %e, "failed to create database");
                }
            }
            Message::CreateTable { ddl } => self.apply_create_table(&ddl).await,
            Message::SyncData { statement } | Message::ReplicateQuery { statement } => {
                self.apply_statement(&statement).await
            }
            Message::ReplicationComplete => {
                self.replicating.store(false, Ordering::SeqCst);
                self.set_state(ConnectionState::Steady);
                info!("bootstrap complete");
                self.emit(SlaveEvent::BootstrapComplete);
            }
            Message::DropDatabase { database } => {
                if let Err(e) = self.storage.drop_database(&database).await {
                    warn!(error = %e, "failed to drop database");
                }
                self.emit(SlaveEvent::DatabaseDropped(database));
            }
            Message::Notification { text } => {
                info!(text = %text, "master notification");
                self.emit(SlaveEvent::Notification(text));
            }
            Message::ErrorReply { detail } => {
                warn!(detail = %detail, "master reported an error");
                self.emit(SlaveEvent::MasterError(detail));
            }
            // Sub-block openers are consumed by the receive loop.
            Message::Success { .. } | Message::VerificationBegin | Message::VerificationEnd => {}
            other => {
                // Request types belong on the master side of the link.
                warn!(kind = other.kind(), "unexpected message from master");
            }
        }
    }

    async fn apply_create_table(&self, ddl: &str) {
        match self.storage.execute(ddl).await {
            Ok(_) => {
                debug!("schema applied");
                if let Some(table) = sql::create_table_name(ddl) {
                    self.replay_pending(&table).await;
                }
            }
            Err(e) => warn!(error = %e, "failed to apply schema"),
        }
    }

    /// Applies a replicated statement; a missing-table failure queues it and
    /// requests the table's schema instead of dropping it.
    async fn apply_statement(&self, statement: &str) {
        let err = match self.storage.execute(statement).await {
            Ok(_) => return,
            Err(err) => err,
        };
        match err.missing_table() {
            Some(hint) => {
                let table = hint
                    .map(str::to_string)
                    .or_else(|| sql::insert_target_table(statement));
                match table {
                    Some(table) => self.queue_for_recovery(&table, statement).await,
                    None => {
                        warn!(error = %err, "missing table but no table name recoverable")
                    }
                }
            }
            None => warn!(error = %err, "failed to apply replicated statement"),
        }
    }

    async fn queue_for_recovery(&self, table: &str, statement: &str) {
        let request_schema = {
            let mut pending = self.pending.lock();
            let queue = pending.entry(table.to_string()).or_default();
            if queue.len() >= PENDING_CAP {
                warn!(table, "pending queue full, statement dropped");
                return;
            }
            queue.push_back(PendingStatement {
                statement: statement.to_string(),
                attempts: 0,
            });
            // Only the statement that opened the queue triggers a request.
            queue.len() == 1
        };

        if request_schema {
            info!(table, "requesting schema for missing table");
            let request = Message::GetTableSchema {
                table: table.to_string(),
            };
            if let Err(e) = self.send_line(request.encode()).await {
                warn!(table, error = %e, "failed to request schema");
            }
        }
    }

    /// Replays statements queued for a table after its schema arrived.
    async fn replay_pending(&self, table: &str) {
        let mut queue = match self.pending.lock().remove(table) {
            Some(queue) => queue,
            None => return,
        };
        info!(table, queued = queue.len(), "replaying pending statements");

        while let Some(mut item) = queue.pop_front() {
            match self.storage.execute(&item.statement).await {
                Ok(_) => {}
                Err(e) if e.missing_table().is_some() => {
                    item.attempts += 1;
                    if item.attempts >= REPLAY_ATTEMPTS {
                        warn!(table, "replay attempts exhausted, statement dropped");
                        continue;
                    }
                    // Table still absent; put everything back and wait for
                    // the next create_table.
                    let mut pending = self.pending.lock();
                    let restored = pending.entry(table.to_string()).or_default();
                    restored.push_back(item);
                    while let Some(rest) = queue.pop_front() {
                        restored.push_back(rest);
                    }
                    return;
                }
                Err(e) => warn!(table, error = %e, "pending statement dropped"),
            }
        }
    }
}

/// Next decoded line, skipping decode failures. `None` means the link closed.
async fn next_line(reader: &mut FramedRead<OwnedReadHalf, LineCodec>) -> Option<String> {
    loop {
        match reader.next().await {
            Some(Ok(line)) => return Some(line),
            Some(Err(e)) => warn!(error = %e, "failed to decode line"),
            None => return None,
        }
    }
}
