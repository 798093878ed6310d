//! Ordered, cancellable event channels.
//!
//! A [`StreamBroker`] turns an [`EventSource`] into an [`EventChannel`]: the
//! source runs on its own task and pushes [`AgentUpdate`]s through an
//! [`Emitter`]; a pump task numbers them, injects heartbeats and forwards them
//! to the channel. The broker never looks inside an update beyond its name.
//!
//! Dropping the channel cancels everything behind it: the pump, the heartbeat
//! timer and the source (which in turn kills any running process).

mod command;
mod subscription;

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

pub use command::CommandSource;
pub use subscription::WorkspaceSubscription;

use crate::event::{AgentUpdate, SourceKind, StreamEvent};
use crate::workspace::TaskId;

/// Produces the updates of one channel.
///
/// Sources must emit `start` first and finish with `complete` or `error`;
/// the channel closes after that terminal update. Relayed updates (see
/// [`Emitter::relay`]) never close the channel.
#[async_trait]
pub trait EventSource: Send + 'static {
    /// What this source streams.
    fn kind(&self) -> SourceKind;

    /// Whether idle periods should be filled with heartbeats.
    fn heartbeats(&self) -> bool {
        false
    }

    /// Produce updates until done or until `cancel` fires.
    async fn run(self: Box<Self>, emitter: Emitter, cancel: CancellationToken);
}

/// The channel was closed by its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClosed;

impl fmt::Display for ChannelClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("event channel closed")
    }
}

impl std::error::Error for ChannelClosed {}

#[derive(Debug)]
struct Emitted {
    task_id: Option<TaskId>,
    update: AgentUpdate,
    relayed: bool,
}

/// Handle a source uses to push updates into its channel.
#[derive(Debug, Clone)]
pub struct Emitter {
    tx: mpsc::Sender<Emitted>,
    task_id: Option<TaskId>,
}

impl Emitter {
    /// Tag every update emitted through this handle with `task_id`.
    pub fn for_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Emit one of the channel's own updates.
    pub async fn emit(&self, update: AgentUpdate) -> Result<(), ChannelClosed> {
        self.tx
            .send(Emitted {
                task_id: self.task_id,
                update,
                relayed: false,
            })
            .await
            .map_err(|_| ChannelClosed)
    }

    /// Forward an update that belongs to some other task. Terminal relayed
    /// updates do not end the channel.
    pub async fn relay(&self, task_id: TaskId, update: AgentUpdate) -> Result<(), ChannelClosed> {
        self.tx
            .send(Emitted {
                task_id: Some(task_id),
                update,
                relayed: true,
            })
            .await
            .map_err(|_| ChannelClosed)
    }

    /// Whether the consumer is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving end of a stream. Dropping it cancels the producer.
pub struct EventChannel {
    rx: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl EventChannel {
    /// Wait for the next event. `None` once the channel is finished.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Cancel the producer without dropping the channel.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A token that fires when this channel is cancelled or dropped.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Stream for EventChannel {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Settings for [`StreamBroker`].
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Interval between heartbeats on channels that want them.
    pub heartbeat_interval: Duration,
    /// Buffered events per channel before producers wait.
    pub capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            capacity: 256,
        }
    }
}

/// Opens event channels.
#[derive(Debug, Clone, Default)]
pub struct StreamBroker {
    config: BrokerConfig,
}

impl StreamBroker {
    /// Create a broker.
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    /// Start `source` and return the channel its updates arrive on.
    ///
    /// Must be called within a tokio runtime.
    pub fn open<S: EventSource>(&self, source: S) -> EventChannel {
        let cancel = CancellationToken::new();
        let capacity = self.config.capacity.max(1);
        let (inner_tx, inner_rx) = mpsc::channel(capacity);
        let (outer_tx, outer_rx) = mpsc::channel(capacity);

        let heartbeat = source
            .heartbeats()
            .then_some(self.config.heartbeat_interval)
            .filter(|d| !d.is_zero());
        tracing::debug!(source = ?source.kind(), "opening event channel");

        let emitter = Emitter {
            tx: inner_tx,
            task_id: None,
        };
        tokio::spawn(Box::new(source).run(emitter, cancel.clone()));
        tokio::spawn(pump(inner_rx, outer_tx, heartbeat, cancel.clone()));

        EventChannel {
            rx: outer_rx,
            cancel: cancel.clone(),
            _guard: cancel.drop_guard(),
        }
    }
}

async fn pump(
    mut inner: mpsc::Receiver<Emitted>,
    outer: mpsc::Sender<StreamEvent>,
    heartbeat: Option<Duration>,
    cancel: CancellationToken,
) {
    let mut ticker = heartbeat.map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });
    let mut seq = 0u64;
    let mut started = false;

    loop {
        let tick = async {
            match ticker.as_mut() {
                Some(interval) => {
                    interval.tick().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        let (task_id, update, closes) = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            emitted = inner.recv() => match emitted {
                Some(e) => {
                    let closes = !e.relayed && e.update.is_terminal();
                    (e.task_id, e.update, closes)
                }
                None => break,
            },
            _ = tick, if started => (None, AgentUpdate::heartbeat(), false),
        };
        started = true;

        let event = StreamEvent {
            seq,
            task_id,
            update,
        };
        seq += 1;
        // The consumer going away is a cancellation.
        let delivered = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            sent = outer.send(event) => sent.is_ok(),
        };
        if !delivered {
            cancel.cancel();
            break;
        }
        if closes {
            break;
        }
    }
    // Anything still running behind a finished channel has nobody to talk to.
    cancel.cancel();
}
