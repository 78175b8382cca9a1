use std::collections::BTreeMap;

use tracing::info;

use ringback_core::compliance::AckKind;
use ringback_core::domain::conversation::{sms_conversation_id, Channel, StartRequest};
use ringback_core::domain::lead::SOURCE_VOICE;
use ringback_core::envelope::{CallEvent, ProviderEvent};
use ringback_core::errors::{ApplicationError, DomainError};
use ringback_core::phone::normalize_e164;

use super::{resolve_tenant, spawn_ack, storage_error, WebhookOutcome, WebhookState};
use crate::publisher::{EnqueueOptions, EnqueueOutcome};

const MISSED_CALL_INTRO: &str = "We just missed your call. I can help you book an appointment or answer questions right here.";

/// A missed call opens an SMS conversation with the caller. Answered and
/// in-progress calls need nothing.
pub(super) async fn call_event(
    state: &WebhookState,
    event: &ProviderEvent,
) -> Result<WebhookOutcome, ApplicationError> {
    let call = CallEvent::from_payload(&event.payload).map_err(DomainError::from)?;
    if !call.is_missed() {
        info!(
            event_name = "voice.call.observed",
            event_id = %event.id,
            call_id = %call.call_id,
            status = %call.status,
            "call event needs no follow-up"
        );
        return Ok(WebhookOutcome::Processed);
    }

    let route = resolve_tenant(state, &call.to).await?;
    let lead = state
        .leads
        .get_or_create_by_phone(&route.org_id, &call.from, SOURCE_VOICE, "")
        .await
        .map_err(storage_error)?;

    let caller_e164 = normalize_e164(&call.from);
    let metadata = BTreeMap::from([
        ("call_id".to_string(), call.call_id.clone()),
        ("call_status".to_string(), call.status.clone()),
        ("provider_event_id".to_string(), event.id.clone()),
    ]);
    // The missed-call ack below is the opening turn, so the engine starts
    // silently and answers on the caller's first SMS.
    let request = StartRequest {
        org_id: route.org_id.to_string(),
        lead_id: lead.id.0.clone(),
        conversation_id: sms_conversation_id(route.org_id.as_str(), &call.from),
        channel: Channel::Sms,
        from: caller_e164.clone(),
        to: normalize_e164(&call.to),
        intro: MISSED_CALL_INTRO.to_string(),
        source: SOURCE_VOICE.to_string(),
        silent: true,
        metadata,
    };

    let job_id = format!("voice:{}", call.call_id);
    let enqueued = state
        .publisher
        .enqueue_start(&job_id, request, EnqueueOptions::default())
        .await
        .map_err(|publish_error| ApplicationError::Integration(publish_error.to_string()))?;
    if let EnqueueOutcome::AlreadyQueued(_) = enqueued {
        info!(
            event_name = "voice.missed_call.duplicate",
            event_id = %event.id,
            call_id = %call.call_id,
            "missed call already handled under another event"
        );
        return Ok(WebhookOutcome::Duplicate);
    }

    let unsubscribed = state
        .store
        .is_unsubscribed(&route.org_id, &caller_e164)
        .await
        .map_err(storage_error)?;
    if !unsubscribed {
        spawn_ack(state, &route, &call.to, &call.from, AckKind::MissedCall, &event.id);
    }

    info!(
        event_name = "voice.missed_call.handled",
        event_id = %event.id,
        call_id = %call.call_id,
        org_id = %route.org_id,
        lead_id = %lead.id.0,
        ack_sent = !unsubscribed,
        "missed call turned into a text conversation"
    );
    Ok(WebhookOutcome::Processed)
}
