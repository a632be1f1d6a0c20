//! Poller actor fetching queue state on an interval.

use std::sync::Arc;
use std::time::{Duration, Instant};

use queue_client::QueueServer;
use queue_core::{MonitorEvent, QueueSnapshot};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::broadcast;

use crate::error::ReconcileError;
use crate::messages::{PollerMessage, ProjectionMessage};
use crate::projection_actor::remote_call;

/// Poller actor arguments.
pub struct PollerArgs {
    pub server: Arc<dyn QueueServer>,
    pub projection: ActorRef<ProjectionMessage>,
    pub interval: Duration,
    pub remote_timeout: Duration,
    pub event_tx: broadcast::Sender<MonitorEvent>,
}

/// State for the poller actor.
pub struct PollerState {
    server: Arc<dyn QueueServer>,
    projection: ActorRef<ProjectionMessage>,
    interval: Duration,
    remote_timeout: Duration,
    event_tx: broadcast::Sender<MonitorEvent>,
    /// `None` until the first poll finishes.
    connected: Option<bool>,
    last_poll: Option<Instant>,
    ticker: Option<tokio::task::JoinHandle<()>>,
}

impl PollerState {
    fn new(args: PollerArgs) -> Self {
        Self {
            server: args.server,
            projection: args.projection,
            interval: args.interval,
            remote_timeout: args.remote_timeout,
            event_tx: args.event_tx,
            connected: None,
            last_poll: None,
            ticker: None,
        }
    }

    /// A tick right after an explicit poll has nothing new to show.
    fn tick_due(&self) -> bool {
        self.last_poll
            .is_none_or(|at| at.elapsed() >= self.interval / 2)
    }

    async fn fetch(&self) -> Result<(queue_core::ServerStatus, QueueSnapshot), ReconcileError> {
        let server = self.server.as_ref();
        let (status, queue, history) = futures_util::future::join3(
            remote_call(self.remote_timeout, server.status()),
            remote_call(self.remote_timeout, server.fetch_queue()),
            remote_call(self.remote_timeout, server.fetch_history()),
        )
        .await;
        let (status, queue, history) = (status?, queue?, history?);
        let snapshot = QueueSnapshot::from_raw(queue.items, queue.running_item, history.items);
        Ok((status, snapshot))
    }

    /// Fetch and forward a snapshot. A failure is reported once per lost
    /// connection, and on every `explicit` poll so that callers waiting on a
    /// refresh always hear back.
    async fn poll(&mut self, explicit: bool) -> Result<(), ActorProcessingErr> {
        self.last_poll = Some(Instant::now());

        match self.fetch().await {
            Ok((status, snapshot)) => {
                if self.connected != Some(true) {
                    tracing::info!("Connected to {}", self.server.endpoint());
                    let _ = self.event_tx.send(MonitorEvent::status_message(format!(
                        "Connected to {}",
                        self.server.endpoint()
                    )));
                }
                self.connected = Some(true);
                let _ = self.event_tx.send(MonitorEvent::server_status(status));
                self.projection.send_message(ProjectionMessage::ApplySnapshot {
                    snapshot: Box::new(snapshot),
                })?;
            }
            Err(e) => {
                if explicit || self.connected != Some(false) {
                    tracing::warn!("Lost contact with {}: {}", self.server.endpoint(), e);
                    let _ = self.event_tx.send(MonitorEvent::Disconnected {
                        error: e.to_string(),
                        timestamp: chrono::Utc::now(),
                    });
                } else {
                    tracing::debug!("Poll of {} failed: {}", self.server.endpoint(), e);
                }
                self.connected = Some(false);
            }
        }
        Ok(())
    }
}

/// Poller actor feeding snapshots to the projection.
pub struct PollerActor;

impl Actor for PollerActor {
    type Msg = PollerMessage;
    type State = PollerState;
    type Arguments = PollerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            "Starting poller for {} every {:?}",
            args.server.endpoint(),
            args.interval
        );

        let mut state = PollerState::new(args);

        let interval = state.interval;
        let myself_clone = myself.clone();
        state.ticker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if myself_clone.send_message(PollerMessage::Tick).is_err() {
                    break;
                }
            }
        }));

        Ok(state)
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(ticker) = state.ticker.take() {
            ticker.abort();
        }
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            PollerMessage::Tick => {
                if state.tick_due() {
                    state.poll(false).await?;
                }
            }

            PollerMessage::PollNow => {
                state.poll(true).await?;
            }

            PollerMessage::SetServer { server } => {
                tracing::info!("Poller now talking to {}", server.endpoint());
                state.server = server;
                state.connected = None;
                state.poll(true).await?;
            }

            PollerMessage::Shutdown => {
                tracing::info!("Shutting down poller");
                myself.stop(None);
            }
        }

        Ok(())
    }
}
