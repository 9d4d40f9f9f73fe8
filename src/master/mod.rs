//! Master coordinator.
//!
//! Owns the listening socket and the registry of connected slaves. Each
//! accepted connection gets a read task that bootstraps the slave and serves
//! its steady-state requests, plus a writer task that owns the socket's write
//! half and drains an outbound line queue. Broadcasts enqueue to every other
//! slave's queue while the registry lock is held, so any two statements reach
//! all slaves in the same relative order without ever waiting on a slow
//! peer's socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, NetworkError, Result};
use crate::protocol::{LineCodec, Message, TableCount, RESULT_END};
use crate::storage::{sql, SharedStorage, Value};

mod snapshot;

/// Outbound line queue of one slave connection.
///
/// The connection's own task, broadcasts from other connection tasks, and
/// admin operations all enqueue here; a dedicated writer task drains the
/// queue onto the socket. Enqueueing never blocks, so a connection whose
/// socket is slow (or still bootstrapping) cannot stall anyone else. A batch
/// is written as one uninterrupted run of lines, which keeps multi-line
/// sub-blocks atomic on the wire.
#[derive(Clone)]
struct Outbound {
    tx: mpsc::UnboundedSender<Vec<String>>,
}

impl Outbound {
    fn send(&self, line: String) -> Result<()> {
        self.send_many(vec![line])
    }

    fn send_many(&self, lines: Vec<String>) -> Result<()> {
        self.tx
            .send(lines)
            .map_err(|_| NetworkError::ConnectionClosed("connection writer gone".to_string()).into())
    }
}

/// Drains one connection's outbound queue onto its write half.
///
/// Exits when every queue handle is dropped (the queue is drained first, so
/// lines enqueued before a force-close still go out) or when the socket
/// fails.
async fn run_writer(
    mut rx: mpsc::UnboundedReceiver<Vec<String>>,
    write_half: OwnedWriteHalf,
    addr: SocketAddr,
) {
    let mut writer = FramedWrite::new(write_half, LineCodec::default());
    while let Some(batch) = rx.recv().await {
        for line in batch {
            if let Err(e) = writer.feed(line).await {
                debug!(slave = %addr, error = %e, "write failed, dropping connection output");
                return;
            }
        }
        if let Err(e) = SinkExt::<String>::flush(&mut writer).await {
            debug!(slave = %addr, error = %e, "flush failed, dropping connection output");
            return;
        }
    }
}

struct SlaveHandle {
    outbound: Outbound,
    cancel: CancellationToken,
}

/// Registry of connected slaves, keyed by peer address.
///
/// One exclusive lock guards both membership and broadcast iteration, so a
/// broadcast sees a stable membership snapshot and any two broadcasts are
/// enqueued in the same relative order on every slave's queue.
#[derive(Default)]
pub struct SlaveRegistry {
    inner: Mutex<HashMap<SocketAddr, SlaveHandle>>,
}

impl SlaveRegistry {
    async fn register(&self, addr: SocketAddr, handle: SlaveHandle) {
        self.inner.lock().await.insert(addr, handle);
    }

    async fn deregister(&self, addr: SocketAddr) {
        self.inner.lock().await.remove(&addr);
    }

    /// Number of registered slaves.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Addresses of all registered slaves.
    pub async fn addrs(&self) -> Vec<SocketAddr> {
        self.inner.lock().await.keys().copied().collect()
    }

    /// Enqueues one line to every registered slave, optionally skipping the
    /// connection the triggering request arrived on.
    ///
    /// Only the enqueue happens under the lock; the per-connection writer
    /// tasks do the socket I/O. A failed enqueue means the writer is already
    /// gone; the connection's own read loop deregisters it.
    async fn broadcast(&self, line: &str, except: Option<SocketAddr>) {
        let map = self.inner.lock().await;
        for (addr, handle) in map.iter() {
            if Some(*addr) == except {
                continue;
            }
            if handle.outbound.send(line.to_string()).is_err() {
                warn!(slave = %addr, "broadcast enqueue failed, connection closing");
            }
        }
    }

    /// Force-closes every connection and clears the registry.
    async fn shutdown_all(&self) {
        let mut map = self.inner.lock().await;
        for (_, handle) in map.drain() {
            handle.cancel.cancel();
        }
    }
}

/// Master configuration.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Address to listen on
    pub bind_addr: String,
    /// Name of the replicated database
    pub database: String,
}

impl MasterConfig {
    /// Creates a configuration for the given bind address and database name.
    pub fn new(bind_addr: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            database: database.into(),
        }
    }
}

/// The master side of a replication deployment.
#[derive(Clone)]
pub struct MasterCoordinator {
    config: MasterConfig,
    storage: SharedStorage,
    registry: Arc<SlaveRegistry>,
}

impl MasterCoordinator {
    /// Creates a coordinator over the given store.
    pub fn new(config: MasterConfig, storage: SharedStorage) -> Self {
        Self {
            config,
            storage,
            registry: Arc::new(SlaveRegistry::default()),
        }
    }

    /// The slave registry, for inspection.
    pub fn registry(&self) -> &SlaveRegistry {
        &self.registry
    }

    /// Addresses of currently connected slaves.
    pub async fn connected_slaves(&self) -> Vec<SocketAddr> {
        self.registry.addrs().await
    }

    /// Binds the configured address and serves connections until the task is
    /// dropped.
    pub async fn serve(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| NetworkError::AddressError(e.to_string()))?;
        info!(addr = %self.config.bind_addr, "master listening");
        self.serve_listener(listener).await
    }

    /// Serves connections on an already bound listener.
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;
            let coordinator = self.clone();
            tokio::spawn(async move {
                coordinator.handle_connection(stream, addr).await;
            });
        }
    }

    /// Runs one slave connection: register, bootstrap, steady-state loop,
    /// deregister.
    async fn handle_connection(self, stream: TcpStream, addr: SocketAddr) {
        info!(slave = %addr, "slave connected");
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, LineCodec::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let outbound = Outbound { tx };
        let cancel = CancellationToken::new();

        tokio::spawn(run_writer(rx, write_half, addr));

        self.registry
            .register(
                addr,
                SlaveHandle {
                    outbound: outbound.clone(),
                    cancel: cancel.clone(),
                },
            )
            .await;

        // Bootstrap enqueues onto this connection's own queue; broadcasts to
        // other slaves proceed concurrently, and broadcasts to this slave
        // land behind whatever bootstrap lines are already queued.
        if let Err(e) = snapshot::send_bootstrap(self.storage.as_ref(), &outbound, &self.config.database).await {
            error!(slave = %addr, error = %e, "bootstrap failed");
            self.registry.deregister(addr).await;
            return;
        }
        info!(slave = %addr, "bootstrap complete");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                line = reader.next() => match line {
                    Some(Ok(line)) => {
                        if let Err(e) = self.dispatch(&line, addr, &outbound).await {
                            warn!(slave = %addr, error = %e, "request handling failed");
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        // Malformed framing is logged and skipped.
                        warn!(slave = %addr, error = %e, "failed to decode line");
                    }
                    None => break,
                }
            }
        }

        self.registry.deregister(addr).await;
        info!(slave = %addr, "slave disconnected");
    }

    fn reply_error(&self, outbound: &Outbound, detail: impl Into<String>) -> Result<()> {
        outbound.send(
            Message::ErrorReply {
                detail: detail.into(),
            }
            .encode(),
        )
    }

    /// Handles one steady-state request line.
    ///
    /// Only transport failures propagate; request-level failures are
    /// reported back to the slave as `error:` lines.
    async fn dispatch(&self, line: &str, origin: SocketAddr, outbound: &Outbound) -> Result<()> {
        let msg = match Message::parse(line) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(slave = %origin, error = %e, "malformed request");
                // A line without a separator is unparseable; a parseable
                // line with an unknown type is merely unsupported.
                let detail = if line.contains(':') {
                    "unsupported operation"
                } else {
                    "invalid request format"
                };
                return self.reply_error(outbound, detail);
            }
        };

        match msg {
            Message::Insert { statement }
            | Message::Update { statement }
            | Message::Delete { statement } => {
                self.execute_and_broadcast(&statement, origin, outbound).await
            }
            Message::Select { statement } => self.execute_select(&statement, outbound).await,
            Message::VerifyReplication => self.send_verification(outbound).await,
            Message::GetTableSchema { table } => self.resync_table(&table, outbound).await,
            other => {
                debug!(slave = %origin, kind = other.kind(), "unsupported operation");
                self.reply_error(outbound, "unsupported operation")
            }
        }
    }

    /// Applies a mutation locally, acks the origin, and broadcasts it to
    /// every other slave.
    async fn execute_and_broadcast(
        &self,
        statement: &str,
        origin: SocketAddr,
        outbound: &Outbound,
    ) -> Result<()> {
        match self.storage.execute(statement).await {
            Ok(rows) => {
                debug!(slave = %origin, rows, "statement applied");
                // The origin is acked before the broadcast so its reply is
                // never reordered behind replicated lines.
                outbound.send(
                    Message::Success {
                        detail: "query executed".to_string(),
                    }
                    .encode(),
                )?;
                self.registry
                    .broadcast(
                        &Message::ReplicateQuery {
                            statement: statement.to_string(),
                        }
                        .encode(),
                        Some(origin),
                    )
                    .await;
                Ok(())
            }
            Err(e) => self.reply_error(outbound, e.to_string()),
        }
    }

    /// Runs a SELECT and enqueues the result sub-block as one batch.
    async fn execute_select(&self, statement: &str, outbound: &Outbound) -> Result<()> {
        match self.storage.query(statement).await {
            Ok(result) => {
                let mut lines = Vec::with_capacity(result.rows.len() + 3);
                lines.push(
                    Message::Success {
                        detail: result.columns.len().to_string(),
                    }
                    .encode(),
                );
                lines.push(result.columns.join(","));
                for row in &result.rows {
                    lines.push(row.iter().map(Value::render_raw).collect::<Vec<_>>().join(","));
                }
                lines.push(RESULT_END.to_string());
                outbound.send_many(lines)
            }
            Err(e) => self.reply_error(outbound, e.to_string()),
        }
    }

    /// Enqueues the verification report sub-block as one batch.
    async fn send_verification(&self, outbound: &Outbound) -> Result<()> {
        // Counts are collected before the block opens so a storage failure
        // produces a plain error line instead of a truncated sub-block.
        let counts = match self.table_counts().await {
            Ok(counts) => counts,
            Err(e) => return self.reply_error(outbound, e.to_string()),
        };

        let mut lines = Vec::with_capacity(counts.len() + 2);
        lines.push(Message::VerificationBegin.encode());
        for entry in &counts {
            lines.push(entry.encode());
        }
        lines.push(Message::VerificationEnd.encode());
        outbound.send_many(lines)
    }

    async fn table_counts(&self) -> Result<Vec<TableCount>> {
        let mut counts = Vec::new();
        for table in self.storage.list_tables().await? {
            let rows = self.storage.row_count(&table).await?;
            counts.push(TableCount { table, rows });
        }
        Ok(counts)
    }

    /// Resends one table's DDL and full data, for schema recovery.
    async fn resync_table(&self, table: &str, outbound: &Outbound) -> Result<()> {
        match self.storage.table_exists(table).await {
            Ok(true) => {
                snapshot::send_table_schema(self.storage.as_ref(), outbound, table).await?;
                snapshot::send_table_data(self.storage.as_ref(), outbound, table).await?;
                Ok(())
            }
            Ok(false) => self.reply_error(outbound, format!("no such table: {table}")),
            Err(e) => self.reply_error(outbound, e.to_string()),
        }
    }

    /// Creates a table locally and replicates its normalized DDL.
    ///
    /// The broadcast carries the engine's own rendering of the schema, not
    /// the hand-written statement, since the engine may normalize it.
    pub async fn create_table(&self, ddl: &str) -> Result<()> {
        self.storage.execute(ddl).await?;
        let table = sql::create_table_name(ddl)
            .ok_or_else(|| Error::storage("cannot determine created table name"))?;
        let normalized = self.storage.show_create_table(&table).await?;
        self.registry
            .broadcast(&Message::CreateTable { ddl: normalized }.encode(), None)
            .await;
        self.registry
            .broadcast(
                &Message::Notification {
                    text: format!("Table created: {table}"),
                }
                .encode(),
                None,
            )
            .await;
        Ok(())
    }

    /// Drops a table locally and replicates the drop.
    pub async fn drop_table(&self, table: &str) -> Result<()> {
        let statement = format!("DROP TABLE {table}");
        self.storage.execute(&statement).await?;
        self.registry
            .broadcast(&Message::ReplicateQuery { statement }.encode(), None)
            .await;
        self.registry
            .broadcast(
                &Message::Notification {
                    text: format!("Table dropped: {table}"),
                }
                .encode(),
                None,
            )
            .await;
        Ok(())
    }

    /// Drops the database locally, tells every slave to do the same, then
    /// force-closes all connections and clears the registry.
    ///
    /// The drop notice is enqueued before the force-close; writer tasks
    /// drain their queues before closing, so it still reaches every slave.
    pub async fn drop_database(&self, name: &str) -> Result<()> {
        self.storage.drop_database(name).await?;
        self.registry
            .broadcast(
                &Message::DropDatabase {
                    database: name.to_string(),
                }
                .encode(),
                None,
            )
            .await;
        self.registry.shutdown_all().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Column, QueryResult, SqliteStorage, StorageAdapter};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_util::codec::Framed;

    type Client = Framed<TcpStream, LineCodec>;

    async fn seeded_storage() -> SharedStorage {
        let store = SqliteStorage::open_in_memory().unwrap();
        store
            .execute("CREATE TABLE users (id INT, name TEXT)")
            .await
            .unwrap();
        store
            .execute("INSERT INTO users VALUES (1, 'alice')")
            .await
            .unwrap();
        Arc::new(store)
    }

    async fn start_master(storage: SharedStorage) -> (MasterCoordinator, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let coordinator =
            MasterCoordinator::new(MasterConfig::new(addr.to_string(), "shop"), storage);
        let serving = coordinator.clone();
        tokio::spawn(async move {
            let _ = serving.serve_listener(listener).await;
        });
        (coordinator, addr)
    }

    async fn recv(client: &mut Client) -> String {
        timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for line")
            .expect("stream closed")
            .expect("decode failed")
    }

    // Connects and drains the bootstrap sequence, returning its lines.
    async fn connect_drained(addr: SocketAddr) -> (Client, Vec<String>) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = Framed::new(stream, LineCodec::default());
        let mut lines = Vec::new();
        loop {
            let line = recv(&mut client).await;
            let done = line == "replication_complete:done";
            lines.push(line);
            if done {
                break;
            }
        }
        (client, lines)
    }

    // Wraps a store and slows schema introspection when told to, so a
    // bootstrap can be held open while other connections stay busy.
    struct DelayedSchemaStorage {
        inner: SharedStorage,
        delay: Arc<AtomicBool>,
    }

    #[async_trait]
    impl StorageAdapter for DelayedSchemaStorage {
        async fn execute(&self, statement: &str) -> Result<u64> {
            self.inner.execute(statement).await
        }

        async fn query(&self, statement: &str) -> Result<QueryResult> {
            self.inner.query(statement).await
        }

        async fn list_tables(&self) -> Result<Vec<String>> {
            self.inner.list_tables().await
        }

        async fn describe_table(&self, table: &str) -> Result<Vec<Column>> {
            self.inner.describe_table(table).await
        }

        async fn show_create_table(&self, table: &str) -> Result<String> {
            if self.delay.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            self.inner.show_create_table(table).await
        }

        async fn row_count(&self, table: &str) -> Result<u64> {
            self.inner.row_count(table).await
        }

        async fn table_exists(&self, table: &str) -> Result<bool> {
            self.inner.table_exists(table).await
        }

        async fn create_database(&self, name: &str) -> Result<()> {
            self.inner.create_database(name).await
        }

        async fn drop_database(&self, name: &str) -> Result<()> {
            self.inner.drop_database(name).await
        }
    }

    #[tokio::test]
    async fn test_bootstrap_on_connect() {
        let (_coordinator, addr) = start_master(seeded_storage().await).await;
        let (_client, lines) = connect_drained(addr).await;

        assert_eq!(lines[0], "init_replication:shop");
        assert_eq!(lines[1], "create_db:shop");
        assert!(lines[2].starts_with("create_table:CREATE TABLE users"));
        assert_eq!(
            lines[3],
            "sync_data:INSERT INTO users (id, name) VALUES (1, 'alice')"
        );
        assert_eq!(lines[4], "replication_complete:done");
    }

    #[tokio::test]
    async fn test_mutation_acked_and_broadcast_to_others() {
        let (coordinator, addr) = start_master(seeded_storage().await).await;
        let (mut origin, _) = connect_drained(addr).await;
        let (mut observer, _) = connect_drained(addr).await;
        assert_eq!(coordinator.connected_slaves().await.len(), 2);

        let statement = "INSERT INTO users VALUES (2, 'bob')";
        origin.send(format!("insert:{statement}")).await.unwrap();

        assert_eq!(recv(&mut origin).await, "success:query executed");
        assert_eq!(recv(&mut observer).await, format!("replicate_query:{statement}"));

        // The origin never sees its own statement echoed back.
        origin.send("select:SELECT id FROM users WHERE id = 2".to_string()).await.unwrap();
        assert_eq!(recv(&mut origin).await, "success:1");
    }

    #[tokio::test]
    async fn test_failed_mutation_not_broadcast() {
        let (_coordinator, addr) = start_master(seeded_storage().await).await;
        let (mut origin, _) = connect_drained(addr).await;
        let (mut observer, _) = connect_drained(addr).await;

        origin
            .send("insert:INSERT INTO ghosts VALUES (1)".to_string())
            .await
            .unwrap();
        let reply = recv(&mut origin).await;
        assert!(reply.starts_with("error:"), "got {reply}");

        // The observer sees the next broadcast, not the failed statement.
        origin
            .send("insert:INSERT INTO users VALUES (3, 'carol')".to_string())
            .await
            .unwrap();
        assert_eq!(recv(&mut origin).await, "success:query executed");
        assert_eq!(
            recv(&mut observer).await,
            "replicate_query:INSERT INTO users VALUES (3, 'carol')"
        );
    }

    #[tokio::test]
    async fn test_concurrent_submissions_broadcast_in_one_order() {
        let (_coordinator, addr) = start_master(seeded_storage().await).await;
        let (origin_a, _) = connect_drained(addr).await;
        let (origin_b, _) = connect_drained(addr).await;
        let (mut observer_1, _) = connect_drained(addr).await;
        let (mut observer_2, _) = connect_drained(addr).await;

        async fn submit(mut client: Client, tag: &'static str) {
            for i in 0..20 {
                client
                    .send(format!("insert:INSERT INTO users VALUES ({i}, '{tag}')"))
                    .await
                    .unwrap();
                // The other submitter's broadcasts interleave with our acks.
                let mut line = recv(&mut client).await;
                while line.starts_with("replicate_query:") {
                    line = recv(&mut client).await;
                }
                assert_eq!(line, "success:query executed");
            }
        }
        let a = tokio::spawn(submit(origin_a, "a"));
        let b = tokio::spawn(submit(origin_b, "b"));
        a.await.unwrap();
        b.await.unwrap();

        // Submitters interleave arbitrarily, but both pure observers see the
        // same relative order.
        let mut seen_1 = Vec::new();
        let mut seen_2 = Vec::new();
        for _ in 0..40 {
            seen_1.push(recv(&mut observer_1).await);
            seen_2.push(recv(&mut observer_2).await);
        }
        assert_eq!(seen_1, seen_2);
        assert!(seen_1.iter().all(|l| l.starts_with("replicate_query:")));
    }

    #[tokio::test]
    async fn test_slow_bootstrap_does_not_stall_broadcasts() {
        let delay = Arc::new(AtomicBool::new(false));
        let storage: SharedStorage = Arc::new(DelayedSchemaStorage {
            inner: seeded_storage().await,
            delay: delay.clone(),
        });
        let (_coordinator, addr) = start_master(storage).await;
        let (mut origin, _) = connect_drained(addr).await;
        let (mut observer, _) = connect_drained(addr).await;

        // A third slave connects and gets stuck mid-bootstrap.
        delay.store(true, Ordering::SeqCst);
        let _straggler = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let statement = "INSERT INTO users VALUES (2, 'bob')";
        origin.send(format!("insert:{statement}")).await.unwrap();
        assert_eq!(recv(&mut origin).await, "success:query executed");

        // The healthy observer gets the broadcast well before the unrelated
        // bootstrap finishes.
        let line = timeout(Duration::from_millis(1000), observer.next())
            .await
            .expect("broadcast was stalled by an unrelated bootstrap")
            .expect("stream closed")
            .expect("decode failed");
        assert_eq!(line, format!("replicate_query:{statement}"));
    }

    #[tokio::test]
    async fn test_select_result_subblock() {
        let (_coordinator, addr) = start_master(seeded_storage().await).await;
        let (mut client, _) = connect_drained(addr).await;

        client
            .send("select:SELECT id, name FROM users ORDER BY id".to_string())
            .await
            .unwrap();
        assert_eq!(recv(&mut client).await, "success:2");
        assert_eq!(recv(&mut client).await, "id,name");
        assert_eq!(recv(&mut client).await, "1,alice");
        assert_eq!(recv(&mut client).await, "END");
    }

    #[tokio::test]
    async fn test_select_empty_result_still_framed() {
        let (_coordinator, addr) = start_master(seeded_storage().await).await;
        let (mut client, _) = connect_drained(addr).await;

        client
            .send("select:SELECT id, name FROM users WHERE id > 100".to_string())
            .await
            .unwrap();
        assert_eq!(recv(&mut client).await, "success:2");
        assert_eq!(recv(&mut client).await, "id,name");
        assert_eq!(recv(&mut client).await, "END");
    }

    #[tokio::test]
    async fn test_malformed_and_unsupported_requests() {
        let (_coordinator, addr) = start_master(seeded_storage().await).await;
        let (mut client, _) = connect_drained(addr).await;

        client.send("garbage without separator".to_string()).await.unwrap();
        assert_eq!(recv(&mut client).await, "error:invalid request format");

        client.send("create_db:shop".to_string()).await.unwrap();
        assert_eq!(recv(&mut client).await, "error:unsupported operation");

        // The connection survives both.
        client.send("select:SELECT id FROM users".to_string()).await.unwrap();
        assert_eq!(recv(&mut client).await, "success:1");
    }

    #[tokio::test]
    async fn test_verification_subblock() {
        let (_coordinator, addr) = start_master(seeded_storage().await).await;
        let (mut client, _) = connect_drained(addr).await;

        client.send("verify_replication:request".to_string()).await.unwrap();
        assert_eq!(recv(&mut client).await, "verification_data:begin");
        assert_eq!(recv(&mut client).await, "table:users:1");
        assert_eq!(recv(&mut client).await, "verification_data:end");
    }

    #[tokio::test]
    async fn test_table_resync_request() {
        let (_coordinator, addr) = start_master(seeded_storage().await).await;
        let (mut client, _) = connect_drained(addr).await;

        client.send("get_table_schema:users".to_string()).await.unwrap();
        assert!(recv(&mut client).await.starts_with("create_table:CREATE TABLE users"));
        assert_eq!(
            recv(&mut client).await,
            "sync_data:INSERT INTO users (id, name) VALUES (1, 'alice')"
        );

        client.send("get_table_schema:ghosts".to_string()).await.unwrap();
        assert_eq!(recv(&mut client).await, "error:no such table: ghosts");
    }

    #[tokio::test]
    async fn test_admin_create_table_broadcasts_normalized_ddl() {
        let (coordinator, addr) = start_master(seeded_storage().await).await;
        let (mut client, _) = connect_drained(addr).await;

        coordinator
            .create_table("CREATE TABLE orders (id INT, total FLOAT)")
            .await
            .unwrap();
        assert!(recv(&mut client).await.starts_with("create_table:CREATE TABLE orders"));
        assert_eq!(recv(&mut client).await, "notification:Table created: orders");

        coordinator.drop_table("orders").await.unwrap();
        assert_eq!(recv(&mut client).await, "replicate_query:DROP TABLE orders");
        assert_eq!(recv(&mut client).await, "notification:Table dropped: orders");
    }

    #[tokio::test]
    async fn test_drop_database_closes_all_connections() {
        let storage = seeded_storage().await;
        let (coordinator, addr) = start_master(storage.clone()).await;
        let (mut client, _) = connect_drained(addr).await;

        coordinator.drop_database("shop").await.unwrap();
        assert_eq!(recv(&mut client).await, "drop_database:shop");

        // The connection is force-closed and the registry cleared.
        let eof = timeout(Duration::from_secs(5), client.next()).await.unwrap();
        assert!(eof.is_none());
        assert!(coordinator.registry().is_empty().await);
        assert!(storage.list_tables().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_deregisters() {
        let (coordinator, addr) = start_master(seeded_storage().await).await;
        let (client, _) = connect_drained(addr).await;
        assert_eq!(coordinator.registry().len().await, 1);

        drop(client);
        // The read loop notices EOF and removes the entry.
        for _ in 0..50 {
            if coordinator.registry().is_empty().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("slave was not deregistered after disconnect");
    }
}
