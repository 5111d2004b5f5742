use std::str::FromStr;
use std::time::Duration;

use conveyor_graceful_shutdown::ShutdownListener;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{event, Level};

use crate::{error::Error, Queue};

/// Every kind of entry the transition scripts append to the per-queue
/// event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Active,
    Progress,
    Completed,
    Failed,
    Delayed,
    Stalled,
    Removed,
    Paused,
    Resumed,
    Drained,
    Waiting,
    WaitingChildren,
    Duplicated,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Added => "added",
            EventKind::Active => "active",
            EventKind::Progress => "progress",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::Delayed => "delayed",
            EventKind::Stalled => "stalled",
            EventKind::Removed => "removed",
            EventKind::Paused => "paused",
            EventKind::Resumed => "resumed",
            EventKind::Drained => "drained",
            EventKind::Waiting => "waiting",
            EventKind::WaitingChildren => "waiting-children",
            EventKind::Duplicated => "duplicated",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "added" => EventKind::Added,
            "active" => EventKind::Active,
            "progress" => EventKind::Progress,
            "completed" => EventKind::Completed,
            "failed" => EventKind::Failed,
            "delayed" => EventKind::Delayed,
            "stalled" => EventKind::Stalled,
            "removed" => EventKind::Removed,
            "paused" => EventKind::Paused,
            "resumed" => EventKind::Resumed,
            "drained" => EventKind::Drained,
            "waiting" => EventKind::Waiting,
            "waiting-children" => EventKind::WaitingChildren,
            "duplicated" => EventKind::Duplicated,
            _ => return Err(()),
        })
    }
}

/// One entry from the queue's event stream. The stream id gives a total
/// order of transitions per queue.
#[derive(Debug, Clone)]
pub struct QueueEvent {
    pub stream_id: String,
    pub kind: EventKind,
    pub job_id: Option<String>,
    pub ts: i64,
    pub prev: Option<String>,
    pub returnvalue: Option<String>,
    pub failed_reason: Option<String>,
    pub progress: Option<u8>,
}

/// Parse an XRANGE reply into events. Entries with an unknown `event`
/// field are skipped rather than failing the whole read.
pub(crate) fn parse_xrange(reply: redis::Value) -> Result<Vec<QueueEvent>, Error> {
    let entries = match reply {
        redis::Value::Bulk(entries) => entries,
        redis::Value::Nil => return Ok(Vec::new()),
        _ => return Ok(Vec::new()),
    };

    let mut events = Vec::with_capacity(entries.len());
    for entry in entries {
        let parts = match entry {
            redis::Value::Bulk(parts) => parts,
            _ => continue,
        };
        let mut parts = parts.into_iter();
        let stream_id = match parts.next() {
            Some(redis::Value::Data(raw)) => String::from_utf8(raw)?,
            _ => continue,
        };
        let fields = match parts.next() {
            Some(redis::Value::Bulk(fields)) => fields,
            _ => continue,
        };

        let mut kind = None;
        let mut job_id = None;
        let mut ts = 0i64;
        let mut prev = None;
        let mut returnvalue = None;
        let mut failed_reason = None;
        let mut progress = None;

        let mut iter = fields.into_iter();
        while let (Some(name), Some(value)) = (iter.next(), iter.next()) {
            let name = match name {
                redis::Value::Data(raw) => String::from_utf8(raw)?,
                _ => continue,
            };
            let value = match value {
                redis::Value::Data(raw) => String::from_utf8(raw)?,
                _ => continue,
            };
            match name.as_str() {
                "event" => kind = EventKind::from_str(&value).ok(),
                "jobId" => job_id = Some(value),
                "ts" => ts = value.parse().unwrap_or(0),
                "prev" => prev = Some(value),
                "returnvalue" => returnvalue = Some(value),
                "failedReason" => failed_reason = Some(value),
                "progress" => progress = value.parse().ok(),
                _ => {}
            }
        }

        if let Some(kind) = kind {
            events.push(QueueEvent {
                stream_id,
                kind,
                job_id,
                ts,
                prev,
                returnvalue,
                failed_reason,
                progress,
            });
        }
    }

    Ok(events)
}

/// Unwrap an XREAD reply (one stream) down to its entries and parse them.
pub(crate) fn parse_xread(reply: redis::Value) -> Result<Vec<QueueEvent>, Error> {
    let streams = match reply {
        redis::Value::Bulk(streams) => streams,
        _ => return Ok(Vec::new()),
    };
    match streams.into_iter().next() {
        Some(redis::Value::Bulk(parts)) => match parts.into_iter().nth(1) {
            Some(entries) => parse_xrange(entries),
            None => Ok(Vec::new()),
        },
        _ => Ok(Vec::new()),
    }
}

/// A polled tail of the event stream, in transition order.
pub struct EventStream {
    rx: mpsc::Receiver<QueueEvent>,
    task: JoinHandle<()>,
}

impl EventStream {
    pub async fn next(&mut self) -> Option<QueueEvent> {
        self.rx.recv().await
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

pub(crate) fn start_event_stream(
    queue: Queue,
    mut shutdown: ShutdownListener,
    poll_interval: Duration,
    from_start: bool,
) -> EventStream {
    let (tx, rx) = mpsc::channel(256);

    let task = tokio::spawn(async move {
        let _task_guard = shutdown.task_guard();
        let shutdown_fut = shutdown.wait_for_shutdown();
        tokio::pin!(shutdown_fut);

        // "0" replays history; "$"-style tailing is approximated by taking
        // the current last id first.
        let mut last_id: Option<String> = if from_start {
            None
        } else {
            match queue.last_event_id().await {
                Ok(id) => id,
                Err(e) => {
                    event!(Level::ERROR, queue=%queue.name(), error=%e, "Error reading event stream head");
                    None
                }
            }
        };

        let mut interval = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown_fut => break,
                _ = interval.tick() => {},
            };

            match queue.read_events(last_id.as_deref(), 128).await {
                Ok(batch) => {
                    for ev in batch {
                        last_id = Some(ev.stream_id.clone());
                        if tx.send(ev).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    event!(Level::ERROR, queue=%queue.name(), error=%e, "Error reading event stream");
                }
            }
        }
    });

    EventStream { rx, task }
}
