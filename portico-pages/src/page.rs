//! Pages: long-lived per-user objects kept alive across WS frames, and
//! their bounded outbound queues.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use portico_core::ServerError;
use tokio::sync::Notify;

use crate::protocol::RpcMessage;

/// Where an overflowing outbound queue sheds load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the oldest non-critical frame to make room.
    DropOldest,
    /// Ask the connection driver to close the socket.
    CloseConnection,
}

impl OverflowPolicy {
    /// Parse the `ws.overflow_policy` config value.
    pub fn parse(value: &str) -> OverflowPolicy {
        match value {
            "close" => OverflowPolicy::CloseConnection,
            _ => OverflowPolicy::DropOldest,
        }
    }
}

/// A page id with its process-affinity tag: `<ulid>|p<NN>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PageId {
    raw: String,
    worker: usize,
}

impl PageId {
    /// Mint a fresh id owned by `worker`.
    pub fn mint(worker: usize) -> PageId {
        PageId {
            raw: format!("{}|p{worker:02}", ulid::Ulid::new()),
            worker,
        }
    }

    /// Parse and validate an id presented by a client. The affinity tag is
    /// mandatory; a malformed id is a protocol error.
    pub fn parse(raw: &str) -> Result<PageId, ServerError> {
        let (head, tag) = raw.split_once('|').ok_or_else(|| {
            ServerError::Protocol(format!("page id {raw:?} lacks an affinity tag"))
        })?;
        let digits = tag.strip_prefix('p').ok_or_else(|| {
            ServerError::Protocol(format!("page id {raw:?} has a malformed affinity tag"))
        })?;
        let worker: usize = digits.parse().map_err(|_| {
            ServerError::Protocol(format!("page id {raw:?} has a malformed affinity tag"))
        })?;
        if head.is_empty() {
            return Err(ServerError::Protocol(format!("page id {raw:?} is empty")));
        }
        Ok(PageId {
            raw: raw.to_string(),
            worker,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Index of the owning worker.
    pub fn worker(&self) -> usize {
        self.worker
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// One frame waiting for the connection writer.
#[derive(Debug)]
pub struct OutboundFrame {
    pub message: RpcMessage,
    /// Critical frames (responses, errors, pongs) are never shed by the
    /// drop-oldest policy.
    pub critical: bool,
}

/// What `enqueue` did with the frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enqueued {
    Delivered,
    /// Made room by shedding an older non-critical frame.
    DroppedOldest,
    /// Queue full under the close policy; the caller closes the socket.
    Overflow,
    /// The page is gone.
    Closed,
}

struct QueueInner {
    frames: VecDeque<OutboundFrame>,
    closed: bool,
}

/// Bounded single-consumer queue toward the WS connection writer.
struct OutboundQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    depth: usize,
    policy: OverflowPolicy,
}

impl OutboundQueue {
    fn new(depth: usize, policy: OverflowPolicy) -> OutboundQueue {
        OutboundQueue {
            inner: Mutex::new(QueueInner {
                frames: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            depth: depth.max(1),
            policy,
        }
    }

    fn push(&self, frame: OutboundFrame) -> Enqueued {
        let outcome = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Enqueued::Closed;
            }
            if inner.frames.len() < self.depth {
                inner.frames.push_back(frame);
                Enqueued::Delivered
            } else {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        let victim = inner.frames.iter().position(|f| !f.critical);
                        match victim {
                            Some(at) => {
                                inner.frames.remove(at);
                                inner.frames.push_back(frame);
                                Enqueued::DroppedOldest
                            }
                            // Every queued frame is critical; shedding is
                            // not allowed, treat as overflow.
                            None => Enqueued::Overflow,
                        }
                    }
                    OverflowPolicy::CloseConnection => Enqueued::Overflow,
                }
            }
        };
        self.notify.notify_one();
        outcome
    }

    async fn pop(&self) -> Option<OutboundFrame> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(frame) = inner.frames.pop_front() {
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

/// A long-lived per-user page object.
pub struct Page {
    id: PageId,
    user_id: String,
    created_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    outbound: OutboundQueue,
    state: Mutex<serde_json::Value>,
}

impl Page {
    pub fn new(
        id: PageId,
        user_id: &str,
        queue_depth: usize,
        policy: OverflowPolicy,
    ) -> Page {
        Page {
            id,
            user_id: user_id.to_string(),
            created_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
            outbound: OutboundQueue::new(queue_depth, policy),
            state: Mutex::new(serde_json::Value::Null),
        }
    }

    pub fn id(&self) -> &PageId {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    /// Refresh the last-activity stamp.
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// User-defined page state.
    pub fn state(&self) -> serde_json::Value {
        self.state.lock().unwrap().clone()
    }

    pub fn set_state(&self, value: serde_json::Value) {
        *self.state.lock().unwrap() = value;
    }

    /// Queue a frame for the connection writer.
    pub fn enqueue(&self, message: RpcMessage, critical: bool) -> Enqueued {
        self.outbound.push(OutboundFrame { message, critical })
    }

    /// Next frame for the writer; `None` once the page is closed and the
    /// queue is drained.
    pub async fn next_outbound(&self) -> Option<OutboundFrame> {
        self.outbound.pop().await
    }

    /// Close the outbound channel. Required before dropping the page.
    pub fn close(&self) {
        self.outbound.close();
    }
}
