//! Supervisor actor owning the projection and the poller.

use std::sync::Arc;

use queue_client::QueueServer;
use queue_core::MonitorEvent;
use ractor::{Actor, ActorProcessingErr, ActorRef, SupervisionEvent};
use tokio::sync::broadcast;

use crate::config::MonitorConfig;
use crate::messages::{PollerMessage, ProjectionMessage, SupervisorMessage};
use crate::poller::{PollerActor, PollerArgs};
use crate::projection_actor::{ProjectionActor, ProjectionArgs};
use crate::registry::global_registry;

/// Supervisor arguments.
pub struct SupervisorArgs {
    pub config: MonitorConfig,
    pub server: Arc<dyn QueueServer>,
    pub event_tx: broadcast::Sender<MonitorEvent>,
}

/// State for the supervisor actor.
pub struct SupervisorState {
    pub projection: ActorRef<ProjectionMessage>,
    pub poller: ActorRef<PollerMessage>,
    pub event_tx: broadcast::Sender<MonitorEvent>,
}

/// Supervisor actor that starts and stops the monitor's children.
pub struct Supervisor;

impl Actor for Supervisor {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = SupervisorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting queue monitor for {}", args.server.endpoint());

        let (projection, _) = Actor::spawn_linked(
            None,
            ProjectionActor,
            ProjectionArgs {
                server: args.server.clone(),
                aliases: args.config.roi_key_map.clone(),
                remote_timeout: args.config.remote_timeout(),
                event_tx: args.event_tx.clone(),
            },
            myself.get_cell(),
        )
        .await
        .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn projection: {}", e)))?;

        let (poller, _) = Actor::spawn_linked(
            None,
            PollerActor,
            PollerArgs {
                server: args.server,
                projection: projection.clone(),
                interval: args.config.poll_interval(),
                remote_timeout: args.config.remote_timeout(),
                event_tx: args.event_tx.clone(),
            },
            myself.get_cell(),
        )
        .await
        .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn poller: {}", e)))?;

        projection.send_message(ProjectionMessage::AttachPoller {
            poller: poller.clone(),
        })?;

        Ok(SupervisorState {
            projection,
            poller,
            event_tx: args.event_tx,
        })
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(name) = myself.get_name() {
            global_registry().unregister(&name);
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
            SupervisorMessage::GetProjection { reply } => {
                let _ = reply.send(state.projection.clone());
            }

            SupervisorMessage::ReplaceServer { server } => {
                state.projection.send_message(ProjectionMessage::ReplaceServer {
                    server: server.clone(),
                })?;
                state
                    .poller
                    .send_message(PollerMessage::SetServer { server })?;
            }

            SupervisorMessage::PollNow => {
                state.poller.send_message(PollerMessage::PollNow)?;
            }

            SupervisorMessage::Subscribe { sender } => {
                let mut rx = state.event_tx.subscribe();
                tokio::spawn(async move {
                    while let Ok(event) = rx.recv().await {
                        if sender.send(event).is_err() {
                            break;
                        }
                    }
                });
            }

            SupervisorMessage::Shutdown => {
                tracing::info!("Shutting down queue monitor");
                let _ = state.poller.send_message(PollerMessage::Shutdown);
                let _ = state.projection.send_message(ProjectionMessage::Shutdown);
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                tracing::debug!("Child actor {} stopped: {:?}", cell.get_id(), reason);
            }
            SupervisionEvent::ActorFailed(cell, err) => {
                tracing::error!("Child actor {} failed: {}", cell.get_id(), err);
                let _ = state.event_tx.send(MonitorEvent::status_message(format!(
                    "Monitor stopped after an internal failure: {}",
                    err
                )));
                let _ = state.poller.send_message(PollerMessage::Shutdown);
                let _ = state.projection.send_message(ProjectionMessage::Shutdown);
                myself.stop(Some("child failed".to_string()));
            }
            _ => {}
        }
        Ok(())
    }
}
