//! NATS request/reply intake for caller commands.
//!
//! # Subject Convention
//!
//! - **Request:** `weft.commands.{command}` with the JSON command body
//! - **Reply:** the JSON response, or `{"error": ..., "transient": ...}`
//!
//! | Command | Body | Reply |
//! |---------|------|-------|
//! | `create_entity` | `CreateEntity` | `WriteResponse` |
//! | `update_entity` | `UpdateEntity` | `WriteResponse` |
//! | `retire_entity` | `RetireEntity` | `WriteResponse` |
//! | `propose_relationship` | `ProposeRelationship` | `ProposeResponse` |
//! | `supply_input` | `SupplyInput` | `SupplyInputResponse` |
//! | `cancel_workflow` | `CancelWorkflow` | `WorkflowRecord` |
//! | `get_workflow` | `{"workflow_id": ...}` | `WorkflowRecord` |
//!
//! Each request is served on its own task; a reply is sent only when the
//! request carries a reply subject.

use std::sync::Arc;

use futures::StreamExt as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use weft_core::CommitService;
use weft_types::{
    CancelWorkflow, CreateEntity, ProposeRelationship, RetireEntity, SupplyInput, UpdateEntity,
    WorkflowId,
};

use crate::error::{EngineError, IntakeError};

/// Wildcard subject the intake listens on.
pub const COMMAND_SUBJECTS: &str = "weft.commands.*";

const COMMAND_PREFIX: &str = "weft.commands.";

#[derive(Debug, Deserialize)]
struct WorkflowLookup {
    workflow_id: WorkflowId,
}

#[derive(Debug, Serialize)]
struct ErrorReply {
    error: String,
    transient: bool,
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, IntakeError> {
    serde_json::from_slice(payload).map_err(IntakeError::Decode)
}

fn encode<T: Serialize>(reply: &T) -> Result<Vec<u8>, IntakeError> {
    serde_json::to_vec(reply).map_err(IntakeError::Encode)
}

async fn handle(
    service: &CommitService,
    command: &str,
    payload: &[u8],
) -> Result<Vec<u8>, IntakeError> {
    match command {
        "create_entity" => encode(&service.create_entity(decode::<CreateEntity>(payload)?).await?),
        "update_entity" => encode(&service.update_entity(decode::<UpdateEntity>(payload)?).await?),
        "retire_entity" => {
            let cmd: RetireEntity = decode(payload)?;
            encode(&service.retire_entity(cmd.entity_id, &cmd.reason).await?)
        }
        "propose_relationship" => encode(
            &service
                .propose_relationship(decode::<ProposeRelationship>(payload)?)
                .await?,
        ),
        "supply_input" => encode(&service.supply_input(decode::<SupplyInput>(payload)?).await?),
        "cancel_workflow" => {
            encode(&service.cancel_workflow(decode::<CancelWorkflow>(payload)?).await?)
        }
        "get_workflow" => {
            let lookup: WorkflowLookup = decode(payload)?;
            encode(&service.workflow(lookup.workflow_id).await?)
        }
        other => Err(IntakeError::UnknownCommand(other.to_owned())),
    }
}

/// Serve one command and produce the reply body. Never fails: errors
/// become an error reply.
pub async fn dispatch(service: &CommitService, command: &str, payload: &[u8]) -> Vec<u8> {
    match handle(service, command, payload).await {
        Ok(body) => body,
        Err(e) => {
            debug!(command, error = %e, "Command refused");
            let reply = ErrorReply {
                error: e.to_string(),
                transient: e.is_transient(),
            };
            serde_json::to_vec(&reply)
                .unwrap_or_else(|_| br#"{"error":"internal","transient":true}"#.to_vec())
        }
    }
}

/// Listens on [`COMMAND_SUBJECTS`] and forwards to the commit service.
pub struct CommandIntake {
    client: async_nats::Client,
    service: Arc<CommitService>,
}

impl CommandIntake {
    /// Connect a dedicated client for the intake.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Nats`] if the connection fails.
    pub async fn connect(url: &str, service: Arc<CommitService>) -> Result<Self, EngineError> {
        let client = async_nats::connect(url).await.map_err(|e| EngineError::Nats {
            message: format!("failed to connect intake client to {url}: {e}"),
        })?;
        Ok(Self { client, service })
    }

    /// Serve requests until `shutdown` flips to `true` or the subscription
    /// ends. Returns the number of requests received.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Nats`] if the subscription cannot be made.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<u64, EngineError> {
        let mut subscriber = self
            .client
            .subscribe(COMMAND_SUBJECTS)
            .await
            .map_err(|e| EngineError::Nats {
                message: format!("failed to subscribe to {COMMAND_SUBJECTS}: {e}"),
            })?;
        info!(subject = COMMAND_SUBJECTS, "Command intake listening");

        let mut received: u64 = 0;
        loop {
            let message = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                message = subscriber.next() => message,
            };
            let Some(message) = message else {
                warn!("Command subscription ended");
                break;
            };
            received = received.saturating_add(1);

            let Some(reply_to) = message.reply.clone() else {
                warn!(subject = %message.subject, "Command without reply subject; ignoring");
                continue;
            };
            let command = message
                .subject
                .as_str()
                .strip_prefix(COMMAND_PREFIX)
                .unwrap_or_default()
                .to_owned();
            let client = self.client.clone();
            let service = Arc::clone(&self.service);
            tokio::spawn(async move {
                let body = dispatch(&service, &command, &message.payload).await;
                if let Err(e) = client.publish(reply_to, body.into()).await {
                    warn!(command, error = %e, "Failed to send command reply");
                }
            });
        }

        let _ = subscriber.unsubscribe().await;
        info!(received, "Command intake stopped");
        Ok(received)
    }
}

impl std::fmt::Debug for CommandIntake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandIntake").finish_non_exhaustive()
    }
}
