//! Request/response RPC over the hypervisor's control socket.
//!
//! One background task owns the read half of the socket and frames inbound
//! newline-delimited JSON. Replies are correlated to callers strictly by
//! arrival order: QMP guarantees in-order replies on a single connection,
//! so the head of the pending queue always matches the next reply. The
//! optional `id` field is echoed back for callers that set one but is never
//! used for correlation.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use qemukit_core::{Error, Result};
use serde_json::{Map, Value};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::wire::{QmpCommand, QmpEvent, QmpGreeting, QmpResponse, QueryStatus};

const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const CONNECT_BACKOFF_CAP: Duration = Duration::from_secs(1);

pub(crate) trait MonitorIo: AsyncRead + AsyncWrite + Unpin {}
impl<T: AsyncRead + AsyncWrite + Unpin> MonitorIo for T {}

type MonitorStream = Box<dyn MonitorIo + Send>;
type PendingSender = oneshot::Sender<Result<QmpResponse>>;

struct Shared {
    connected: AtomicBool,
    pending: Mutex<VecDeque<PendingSender>>,
    greeting: Mutex<Option<oneshot::Sender<Result<QmpGreeting>>>>,
}

impl Shared {
    /// Marks the channel dead and releases everyone waiting on it.
    fn channel_down(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(tx) = self.greeting.lock().unwrap().take() {
            let _ = tx.send(Err(Error::ConnectionLost));
        }
        let waiters: Vec<_> = self.pending.lock().unwrap().drain(..).collect();
        for tx in waiters {
            let _ = tx.send(Err(Error::ConnectionLost));
        }
    }
}

/// Client half of one QMP session.
pub struct QmpClient {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Option<WriteHalf<MonitorStream>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl QmpClient {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                connected: AtomicBool::new(false),
                pending: Mutex::new(VecDeque::new()),
                greeting: Mutex::new(None),
            }),
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    /// Connects to the monitor's UNIX socket and performs the handshake.
    ///
    /// The hypervisor creates the socket file slightly before it is ready
    /// to accept, so initial connect failures are retried with capped
    /// exponential backoff before giving up.
    pub async fn connect_unix(&self, path: impl AsRef<Path>) -> Result<()> {
        if self.is_connected() {
            return Err(Error::NotConnected);
        }
        let path = path.as_ref();
        let mut delay = CONNECT_BACKOFF_INITIAL;
        let mut attempt = 1;
        let stream = loop {
            match UnixStream::connect(path).await {
                Ok(stream) => break stream,
                Err(e) if attempt < CONNECT_ATTEMPTS => {
                    debug!(attempt, error = %e, "monitor connect failed, retrying");
                    sleep(delay).await;
                    delay = (delay * 2).min(CONNECT_BACKOFF_CAP);
                    attempt += 1;
                }
                Err(e) => {
                    debug!(error = %e, "monitor connect failed, giving up");
                    return Err(Error::ConnectionLost);
                }
            }
        };
        self.handshake(Box::new(stream)).await
    }

    /// Connects to a monitor served over TCP and performs the handshake.
    pub async fn connect_tcp(&self, host: &str, port: u16) -> Result<()> {
        if self.is_connected() {
            return Err(Error::NotConnected);
        }
        let stream = TcpStream::connect((host, port)).await.map_err(|e| {
            debug!(error = %e, "monitor connect failed");
            Error::ConnectionLost
        })?;
        self.handshake(Box::new(stream)).await
    }

    /// Reads the greeting, then negotiates capabilities to bring the
    /// session into command mode. Any failure tears the session back down
    /// so the client can be reconnected.
    async fn handshake(&self, stream: MonitorStream) -> Result<()> {
        let greeting_rx = {
            let mut writer_slot = self.writer.lock().await;
            if writer_slot.is_some() && self.is_connected() {
                return Err(Error::NotConnected);
            }

            let (read_half, write_half) = tokio::io::split(stream);
            let (greeting_tx, greeting_rx) = oneshot::channel();
            *self.shared.greeting.lock().unwrap() = Some(greeting_tx);
            self.shared.pending.lock().unwrap().clear();
            self.shared.connected.store(true, Ordering::SeqCst);

            let handle = tokio::spawn(read_loop(read_half, self.shared.clone()));
            if let Some(stale) = self.reader.lock().unwrap().replace(handle) {
                stale.abort();
            }
            *writer_slot = Some(write_half);
            greeting_rx
        };

        let greeting = match greeting_rx.await {
            Ok(Ok(greeting)) => greeting,
            Ok(Err(e)) => {
                self.disconnect().await;
                return Err(e);
            }
            Err(_) => {
                self.disconnect().await;
                return Err(Error::ConnectionLost);
            }
        };
        debug!(
            major = greeting.qmp.version.qemu.major,
            minor = greeting.qmp.version.qemu.minor,
            micro = greeting.qmp.version.qemu.micro,
            "connected to monitor"
        );

        if let Err(e) = self.execute("qmp_capabilities", None).await {
            self.disconnect().await;
            return Err(e);
        }
        Ok(())
    }

    /// Whether a live monitor session exists.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Tears the session down. Safe to call when not connected; every
    /// caller still waiting on a reply is released with `ConnectionLost`.
    pub async fn disconnect(&self) {
        let mut writer_slot = self.writer.lock().await;
        if let Some(mut writer) = writer_slot.take() {
            let _ = writer.shutdown().await;
        }
        drop(writer_slot);
        if let Some(handle) = self.reader.lock().unwrap().take() {
            handle.abort();
        }
        self.shared.channel_down();
    }

    /// Submits one command and awaits its correlated reply, returning the
    /// `return` payload.
    pub async fn execute(
        &self,
        command: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<Value> {
        let command = QmpCommand {
            execute: command.to_string(),
            arguments,
            id: None,
        };
        self.submit(command).await?.into_result()
    }

    /// Submits a pre-built command, e.g. one carrying a correlation id, and
    /// awaits the raw reply.
    pub async fn submit(&self, command: QmpCommand) -> Result<QmpResponse> {
        let mut line =
            serde_json::to_vec(&command).map_err(|e| Error::Io(std::io::Error::other(e)))?;
        line.push(b'\n');

        // The waiter is enqueued and the bytes written under the same lock,
        // so queue order always matches wire order.
        let rx = {
            let mut writer_slot = self.writer.lock().await;
            let writer = match writer_slot.as_mut() {
                Some(writer) if self.is_connected() => writer,
                _ => return Err(Error::NotConnected),
            };
            let (tx, rx) = oneshot::channel();
            self.shared.pending.lock().unwrap().push_back(tx);
            if let Err(e) = writer.write_all(&line).await {
                debug!(error = %e, "monitor write failed");
                self.shared.channel_down();
                return Err(Error::ConnectionLost);
            }
            rx
        };

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionLost),
        }
    }

    /// Runs `query-status` and validates the reply's shape.
    pub async fn query_status(&self) -> Result<QueryStatus> {
        let value = self.execute("query-status", None).await?;
        serde_json::from_value(value)
            .map_err(|e| Error::InvalidResponse(format!("malformed query-status reply: {e}")))
    }

    /// Resumes guest execution.
    pub async fn cont(&self) -> Result<()> {
        self.execute("cont", None).await.map(|_| ())
    }

    /// Halts the guest's vCPUs at the hypervisor level.
    pub async fn stop(&self) -> Result<()> {
        self.execute("stop", None).await.map(|_| ())
    }

    /// Asks the guest to power down via ACPI.
    pub async fn system_powerdown(&self) -> Result<()> {
        self.execute("system_powerdown", None).await.map(|_| ())
    }

    /// Hard-resets the guest.
    pub async fn system_reset(&self) -> Result<()> {
        self.execute("system_reset", None).await.map(|_| ())
    }

    /// Tells the hypervisor process to exit.
    pub async fn quit(&self) -> Result<()> {
        self.execute("quit", None).await.map(|_| ())
    }

    /// Creates a block backend node for a host file.
    pub async fn blockdev_add(
        &self,
        node_name: &str,
        filename: &str,
        read_only: bool,
    ) -> Result<()> {
        let mut args = Map::new();
        args.insert("node-name".to_string(), Value::String(node_name.to_string()));
        args.insert("driver".to_string(), Value::String("file".to_string()));
        args.insert("filename".to_string(), Value::String(filename.to_string()));
        args.insert("read-only".to_string(), Value::Bool(read_only));
        self.execute("blockdev-add", Some(args)).await.map(|_| ())
    }

    /// Deletes a block backend node.
    pub async fn blockdev_del(&self, node_name: &str) -> Result<()> {
        let mut args = Map::new();
        args.insert("node-name".to_string(), Value::String(node_name.to_string()));
        self.execute("blockdev-del", Some(args)).await.map(|_| ())
    }

    /// Attaches a guest-visible frontend device.
    pub async fn device_add(&self, args: Map<String, Value>) -> Result<()> {
        self.execute("device_add", Some(args)).await.map(|_| ())
    }

    /// Detaches a frontend device. Removal completes asynchronously; the
    /// hypervisor fires a DEVICE_DELETED event once the guest has released
    /// the device.
    pub async fn device_del(&self, id: &str) -> Result<()> {
        let mut args = Map::new();
        args.insert("id".to_string(), Value::String(id.to_string()));
        self.execute("device_del", Some(args)).await.map(|_| ())
    }

    /// Lists block devices; each entry is passed through untouched.
    pub async fn query_block(&self) -> Result<Vec<Value>> {
        match self.execute("query-block", None).await? {
            Value::Array(devices) => Ok(devices),
            other => Err(Error::InvalidResponse(format!(
                "query-block returned a non-array: {other}"
            ))),
        }
    }
}

impl Default for QmpClient {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_loop(read_half: ReadHalf<MonitorStream>, shared: Arc<Shared>) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                dispatch(&line, &shared);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "monitor read failed");
                break;
            }
        }
    }
    shared.channel_down();
}

/// Classifies one inbound message by which top-level keys are present and
/// routes it: greeting to the handshake waiter, events to the log, replies
/// to the head of the pending queue, anything else to the log.
fn dispatch(line: &str, shared: &Shared) {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            // Before the greeting has been seen, an undecodable line means
            // the handshake cannot proceed.
            if let Some(tx) = shared.greeting.lock().unwrap().take() {
                let _ = tx.send(Err(Error::InvalidResponse(format!(
                    "malformed greeting: {e}"
                ))));
            } else {
                warn!(line, "discarding undecodable monitor message");
            }
            return;
        }
    };
    let Some(obj) = value.as_object() else {
        warn!(line, "discarding unknown monitor message");
        return;
    };

    if obj.contains_key("QMP") {
        let parsed = serde_json::from_value::<QmpGreeting>(value.clone())
            .map_err(|e| Error::InvalidResponse(format!("malformed greeting: {e}")));
        match shared.greeting.lock().unwrap().take() {
            Some(tx) => {
                let _ = tx.send(parsed);
            }
            None => warn!("unexpected greeting after handshake"),
        }
    } else if obj.contains_key("event") {
        match serde_json::from_value::<QmpEvent>(value.clone()) {
            Ok(event) => debug!(event = %event.event, "monitor event"),
            Err(_) => debug!(line, "monitor event with unexpected shape"),
        }
    } else if obj.contains_key("return") || obj.contains_key("error") {
        let response = QmpResponse::from_object(obj);
        match shared.pending.lock().unwrap().pop_front() {
            Some(tx) => {
                if tx.send(Ok(response)).is_err() {
                    debug!("dropping reply for a caller that went away");
                }
            }
            None => warn!(line, "reply with no pending request"),
        }
    } else {
        warn!(line, "discarding unknown monitor message");
    }
}
