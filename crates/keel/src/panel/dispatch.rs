//! Execution of panel commands against the controller.

use keel_protocol::{AgentMessage, PanelMessage, PowerAction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::workload::{ControllerError, ControllerResult, WorkloadController, WorkloadSpec};

/// Run one inbound panel message. Session frames produce no reply.
pub async fn dispatch(controller: &WorkloadController, message: PanelMessage) -> Option<AgentMessage> {
    let request_id = message.request_id().map(str::to_string);
    let outcome = match message {
        PanelMessage::AuthOk | PanelMessage::AuthError { .. } => {
            debug!("Ignoring session frame after authentication");
            return None;
        }
        PanelMessage::Power {
            workload_id,
            action,
            ..
        } => power(controller, workload_id, action).await,
        PanelMessage::Command {
            workload_id,
            command,
            ..
        } => {
            let mut line = command;
            if !line.ends_with('\n') {
                line.push('\n');
            }
            controller.send_input(workload_id, &line).await
        }
        PanelMessage::Install { workload_id, .. } => {
            controller.install(workload_id).await.map(|_| ())
        }
        PanelMessage::Create {
            workload_id, spec, ..
        } => create(controller, workload_id, spec).await,
        PanelMessage::Delete { workload_id, .. } => controller.delete(workload_id).await,
    };

    Some(result(request_id, outcome))
}

async fn power(
    controller: &WorkloadController,
    id: Uuid,
    action: PowerAction,
) -> ControllerResult<()> {
    info!("Panel requested {:?} for {}", action, id);
    match action {
        PowerAction::Start => controller.start(id, None, Vec::new()).await,
        PowerAction::Stop => controller.stop(id, None).await,
        PowerAction::Restart => controller.restart(id).await,
        PowerAction::Kill => controller.kill(id).await,
    }
    .map(|_| ())
}

async fn create(
    controller: &WorkloadController,
    id: Uuid,
    spec: serde_json::Value,
) -> ControllerResult<()> {
    let mut spec: WorkloadSpec = serde_json::from_value(spec)
        .map_err(|e| ControllerError::Validation(format!("invalid workload spec: {e}")))?;
    spec.id = Some(id);
    controller.create(spec).await.map(|_| ())
}

pub fn result(request_id: Option<String>, outcome: ControllerResult<()>) -> AgentMessage {
    match outcome {
        Ok(()) => AgentMessage::Result {
            request_id,
            ok: true,
            error: None,
        },
        Err(e) => AgentMessage::Result {
            request_id,
            ok: false,
            error: Some(e.to_string()),
        },
    }
}
