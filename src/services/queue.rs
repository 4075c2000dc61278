//! Hand-off between the broker thread and the processing workers.
//!
//! `WorkQueue` is the seam towards a durable transport; `ChannelQueue` is the
//! in-process bounded implementation used by the binary. The broker callback only
//! ever calls `enqueue`, which never blocks.

use crate::services::processor::{MetadataStore, PayloadProcessor, ReadingSink};
use chrono::{DateTime, Utc};
use core::fmt;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use diesel::prelude::*;
use diesel::PgConnection;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const DB_RETRY_DELAY: Duration = Duration::from_secs(3);

/// One inbound broker message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub topic: String,
    pub payload: String,
    pub retained: bool,
    /// Wall-clock receipt time; default timestamp of the resulting readings.
    pub received_at: DateTime<Utc>,
}

impl QueueMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        QueueMessage {
            topic: topic.into(),
            payload: payload.into(),
            retained: false,
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// Queue at capacity; the message was not accepted
    Full,
    /// No consumer is left
    Closed,
}

impl Display for EnqueueError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::Full => write!(f, "work queue is full"),
            EnqueueError::Closed => write!(f, "work queue is closed"),
        }
    }
}

impl Error for EnqueueError {}

pub trait WorkQueue {
    /// Must return promptly: it runs on the broker's network thread.
    fn enqueue(&self, msg: QueueMessage) -> Result<(), EnqueueError>;
}

#[derive(Debug, Clone)]
pub struct ChannelQueue {
    tx: Sender<QueueMessage>,
}

pub fn channel(capacity: usize) -> (ChannelQueue, Receiver<QueueMessage>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (ChannelQueue { tx }, rx)
}

impl ChannelQueue {
    /// Waits for room instead of failing; for producers that are not on a keep-alive path.
    pub fn send_blocking(&self, msg: QueueMessage) -> Result<(), EnqueueError> {
        self.tx.send(msg).map_err(|_| EnqueueError::Closed)
    }
}

impl WorkQueue for ChannelQueue {
    fn enqueue(&self, msg: QueueMessage) -> Result<(), EnqueueError> {
        self.tx.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Disconnected(_) => EnqueueError::Closed,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ProducerLine {
    t: String,
    p: Value,
}

/// Parse one `{"t": "<topic>", "p": <payload>}` line. A non-string `p` is
/// forwarded as its JSON text.
pub fn parse_producer_line(line: &str) -> Result<QueueMessage, String> {
    let de = &mut serde_json::Deserializer::from_str(line);
    let parsed: ProducerLine = serde_path_to_error::deserialize(de)
        .map_err(|e| format!("malformed input line at '{}': {}", e.path(), e.inner()))?;
    let payload = match parsed.p {
        Value::String(s) => s,
        other => other.to_string(),
    };
    Ok(QueueMessage::new(parsed.t, payload))
}

/// Process messages until the channel is closed and drained.
///
/// `connect` is called whenever the worker has no usable store; a failed
/// connection attempt is retried after `retry_delay` without dropping the message.
pub fn run_worker<S, F>(
    name: &str,
    rx: &Receiver<QueueMessage>,
    processor: PayloadProcessor,
    retry_delay: Duration,
    mut connect: F,
) where
    S: MetadataStore + ReadingSink,
    F: FnMut() -> Result<S, String>,
{
    let mut store: Option<S> = None;
    for msg in rx.iter() {
        if store.is_none() {
            store = Some(connect_with_retry(name, retry_delay, &mut connect));
        }
        let Some(conn) = store.as_mut() else { continue };

        match processor.handle(conn, &msg) {
            Ok(rows) => debug!("{}: handled {} ({} reading(s) stored)", name, msg.topic, rows),
            Err(e) => {
                error!("{}: dropped message on {}: {}", name, msg.topic, e);
                if !conn.is_alive() {
                    warn!("{}: database connection lost; reconnecting", name);
                    store = None;
                }
            }
        }
    }
    info!("{}: queue closed, worker exiting", name);
}

fn connect_with_retry<S, F>(name: &str, retry_delay: Duration, connect: &mut F) -> S
where
    F: FnMut() -> Result<S, String>,
{
    loop {
        match connect() {
            Ok(s) => {
                debug!("{}: connected to database", name);
                return s;
            }
            Err(e) => {
                error!("{}: {}; retrying in {}s", name, e, retry_delay.as_secs());
                thread::sleep(retry_delay);
            }
        }
    }
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers sharing `rx`, each with its own Postgres connection.
    pub fn spawn(
        count: usize,
        rx: Receiver<QueueMessage>,
        database_url: &str,
        processor: PayloadProcessor,
    ) -> Result<Self, String> {
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let name = format!("worker-{}", i);
            let rx = rx.clone();
            let url = database_url.to_string();
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    run_worker(&name, &rx, processor, DB_RETRY_DELAY, || {
                        PgConnection::establish(&url).map_err(|e| format!("DB connection failed: {}", e))
                    })
                })
                .map_err(|e| format!("spawning worker {} failed: {}", i, e))?;
            handles.push(handle);
        }
        info!("Started {} processing worker(s)", count);
        Ok(WorkerPool { handles })
    }

    /// Wait for every worker; they return once all queue senders are dropped.
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}
