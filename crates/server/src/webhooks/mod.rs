//! Provider webhook ingestion.
//!
//! Every signed route runs the same pipeline: verify the signature over the
//! raw body, parse the envelope, drop events already processed, route by
//! kind, then record the event id. Failures before the route step have no
//! side effects. Handler failures roll back and leave the event unrecorded
//! so the provider's redelivery retries it.

mod hosted;
mod messages;
mod voice;
mod voice_ai;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use ringback_agent::ConversationProcessor;
use ringback_core::compliance::{AckKind, ComplianceEngine, MessagePurpose};
use ringback_core::domain::event::PROVIDER_TELNYX;
use ringback_core::domain::OrgId;
use ringback_core::envelope::{parse_envelope, EventKind, ProviderEvent};
use ringback_core::errors::{ApplicationError, DomainError, InterfaceError};
use ringback_core::phone::normalize_e164;
use ringback_core::signature::{WebhookVerifier, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use ringback_db::repositories::{
    ClinicRoute, LeadRepository, ProcessedEventStore, RepositoryError, SqlMessagingStore,
};

use crate::outbound::{OutboundMessage, OutboundMessenger};
use crate::publisher::ConversationPublisher;
use crate::voice_session::VoiceSessionCache;

const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct WebhookState {
    pub store: SqlMessagingStore,
    pub processed: Arc<dyn ProcessedEventStore>,
    pub leads: Arc<dyn LeadRepository>,
    pub compliance: Arc<ComplianceEngine>,
    /// `None` disables signature checks.
    pub verifier: Option<WebhookVerifier>,
    pub messenger: OutboundMessenger,
    pub publisher: ConversationPublisher,
    /// Inline processor for voice turns; `None` queues them instead.
    pub voice_processor: Option<Arc<dyn ConversationProcessor>>,
    pub voice_sessions: Arc<VoiceSessionCache>,
    pub demo_org_id: Option<OrgId>,
    pub processor_timeout: Duration,
    pub handler_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WebhookAck {
    pub status: &'static str,
    pub event_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WebhookError {
    pub error: &'static str,
    pub correlation_id: String,
}

type WebhookResult = Result<(StatusCode, Json<WebhookAck>), (StatusCode, Json<WebhookError>)>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WebhookOutcome {
    Processed,
    /// The underlying message or call was already handled under another
    /// event id.
    Duplicate,
    Ignored,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhooks/messages", post(ingest))
        .route("/webhooks/hosted", post(ingest))
        .route("/webhooks/voice", post(ingest))
        .route("/webhooks/voice/ai", post(voice_ai::voice_ai))
        .with_state(state)
}

async fn ingest(State(state): State<WebhookState>, headers: HeaderMap, body: Bytes) -> WebhookResult {
    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Some(verifier) = &state.verifier {
        let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());
        if let Err(signature_error) =
            verifier.verify(header(TIMESTAMP_HEADER), header(SIGNATURE_HEADER), &body, Utc::now())
        {
            return Err(reject(ApplicationError::Signature(signature_error), &request_id));
        }
    }

    let event = parse_envelope(&body)
        .map_err(|envelope_error| reject(DomainError::from(envelope_error).into(), &request_id))?;

    let seen = state
        .processed
        .already_processed(PROVIDER_TELNYX, &event.id)
        .await
        .map_err(|repo_error| reject(storage_error(repo_error), &event.id))?;
    if seen {
        info!(
            event_name = "webhook.event.duplicate",
            correlation_id = %request_id,
            event_id = %event.id,
            event_type = %event.event_type,
            "webhook event already processed"
        );
        return Ok(ack("duplicate", &event));
    }

    let outcome = match tokio::time::timeout(state.handler_timeout, route(&state, &event)).await {
        Ok(Ok(WebhookOutcome::Ignored)) => {
            info!(
                event_name = "webhook.event.ignored",
                correlation_id = %request_id,
                event_id = %event.id,
                event_type = %event.event_type,
                "webhook event type not handled"
            );
            return Ok(ack("ignored", &event));
        }
        Ok(Ok(outcome)) => outcome,
        Ok(Err(app_error)) => return Err(reject(app_error, &event.id)),
        Err(_) => {
            let timeout = ApplicationError::Integration(format!(
                "webhook handler exceeded {}s",
                state.handler_timeout.as_secs()
            ));
            return Err(reject(timeout, &event.id));
        }
    };

    if let Err(repo_error) = state.processed.mark_processed(PROVIDER_TELNYX, &event.id).await {
        error!(
            event_name = "webhook.event.mark_failed",
            correlation_id = %request_id,
            event_id = %event.id,
            error = %repo_error,
            "failed to record processed webhook event"
        );
    }

    info!(
        event_name = "webhook.event.processed",
        correlation_id = %request_id,
        event_id = %event.id,
        event_type = %event.event_type,
        outcome = ?outcome,
        "webhook event processed"
    );
    let status = if outcome == WebhookOutcome::Duplicate { "duplicate" } else { "ok" };
    Ok(ack(status, &event))
}

async fn route(state: &WebhookState, event: &ProviderEvent) -> Result<WebhookOutcome, ApplicationError> {
    match event.kind {
        EventKind::MessageReceived => messages::message_received(state, event).await,
        EventKind::DeliveryStatus => messages::delivery_status(state, event).await,
        EventKind::HostedOrder => hosted::hosted_order(state, event).await,
        EventKind::Call => voice::call_event(state, event).await,
        // Left unrecorded so a later release that handles the type still
        // sees redeliveries.
        EventKind::Unknown => Ok(WebhookOutcome::Ignored),
    }
}

fn ack(status: &'static str, event: &ProviderEvent) -> (StatusCode, Json<WebhookAck>) {
    (StatusCode::OK, Json(WebhookAck { status, event_id: event.id.clone() }))
}

fn status_for(interface: &InterfaceError) -> StatusCode {
    match interface {
        InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        InterfaceError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
        InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
        InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(app_error: ApplicationError, correlation_id: &str) -> (StatusCode, Json<WebhookError>) {
    let detail = app_error.to_string();
    let interface = app_error.into_interface(correlation_id);
    let status = status_for(&interface);
    if status.is_server_error() {
        error!(
            event_name = "webhook.request.failed",
            correlation_id,
            status = status.as_u16(),
            error = %detail,
            "webhook processing failed"
        );
    } else {
        warn!(
            event_name = "webhook.request.rejected",
            correlation_id,
            status = status.as_u16(),
            error = %detail,
            "webhook rejected"
        );
    }
    (
        status,
        Json(WebhookError {
            error: interface.user_message(),
            correlation_id: interface.correlation_id().to_string(),
        }),
    )
}

pub(crate) fn storage_error(repo_error: RepositoryError) -> ApplicationError {
    match repo_error {
        RepositoryError::Validation(message) => DomainError::InvariantViolation(message).into(),
        other => ApplicationError::Persistence(other.to_string()),
    }
}

/// Tenant owning `number`, or the demo tenant when one is configured.
pub(crate) async fn resolve_tenant(
    state: &WebhookState,
    number: &str,
) -> Result<ClinicRoute, ApplicationError> {
    if let Some(route) = state.store.lookup_clinic_by_number(number).await.map_err(storage_error)? {
        return Ok(route);
    }
    match &state.demo_org_id {
        Some(org_id) => Ok(ClinicRoute { org_id: org_id.clone(), clinic_name: None }),
        None => Err(DomainError::UnknownTenant(number.to_string()).into()),
    }
}

/// Renders and sends an acknowledgment on a background task. Failures are
/// logged and never reach the webhook response.
pub(crate) fn spawn_ack(
    state: &WebhookState,
    route: &ClinicRoute,
    clinic_number: &str,
    patient_number: &str,
    kind: AckKind,
    correlation_id: &str,
) {
    let body = match state.compliance.render_ack(kind, route.clinic_name.as_deref()) {
        Ok(body) => body,
        Err(render_error) => {
            error!(
                event_name = "messaging.ack.render_failed",
                correlation_id,
                kind = kind.as_str(),
                error = %render_error,
                "acknowledgment template failed"
            );
            return;
        }
    };
    let purpose = match kind {
        AckKind::Stop | AckKind::Help | AckKind::Start => MessagePurpose::Compliance,
        AckKind::Sms | AckKind::MissedCall | AckKind::Card => MessagePurpose::Transactional,
    };

    let messenger = state.messenger.clone();
    let org_id = route.org_id.clone();
    let from = normalize_e164(clinic_number);
    let to = normalize_e164(patient_number);
    let correlation_id = correlation_id.to_string();
    tokio::spawn(async move {
        let template_name = format!("{}_ack", kind.as_str());
        let delivery = messenger
            .deliver(OutboundMessage {
                org_id: &org_id,
                from: &from,
                to: &to,
                body: &body,
                purpose,
                template_name: Some(&template_name),
                correlation_id: Some(&correlation_id),
            })
            .await;
        if let Err(send_error) = delivery {
            warn!(
                event_name = "messaging.ack.failed",
                correlation_id = %correlation_id,
                org_id = %org_id,
                kind = kind.as_str(),
                error = %send_error,
                "acknowledgment could not be sent"
            );
        }
    });
}
