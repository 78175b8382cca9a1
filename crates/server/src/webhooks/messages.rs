use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{info, warn};

use ringback_core::compliance::{AckKind, Keyword};
use ringback_core::domain::conversation::{sms_conversation_id, Channel, MessageRequest};
use ringback_core::domain::event::{
    clinic_stream, CanonicalEvent, ConsentChangedV1, MessageReceivedV1, PROVIDER_TELNYX,
};
use ringback_core::domain::lead::SOURCE_SMS;
use ringback_core::domain::message::MessageRecord;
use ringback_core::envelope::{DeliveryUpdate, InboundMessage, ProviderEvent};
use ringback_core::errors::{ApplicationError, DomainError};
use ringback_core::phone::normalize_e164;
use ringback_db::repositories::{InsertOutcome, ReceiptOutcome, RepositoryError};

use super::{resolve_tenant, spawn_ack, storage_error, WebhookOutcome, WebhookState};
use crate::publisher::EnqueueOptions;

const OPT_OUT_REASON: &str = "STOP";

pub(super) async fn message_received(
    state: &WebhookState,
    event: &ProviderEvent,
) -> Result<WebhookOutcome, ApplicationError> {
    let inbound = InboundMessage::from_payload(&event.payload).map_err(DomainError::from)?;
    let route = resolve_tenant(state, &inbound.to).await?;
    let assessment = state.compliance.assess_inbound(&inbound.text);
    let received_at = event.occurred_at.unwrap_or_else(Utc::now);
    let from_e164 = normalize_e164(&inbound.from);
    let to_e164 = normalize_e164(&inbound.to);

    // Keywords always get through; anything else from an opted-out sender is
    // stored but never answered.
    let unsubscribed = assessment.keyword == Keyword::None
        && state.store.is_unsubscribed(&route.org_id, &from_e164).await.map_err(storage_error)?;

    let lead = state
        .leads
        .get_or_create_by_phone(&route.org_id, &inbound.from, SOURCE_SMS, "")
        .await
        .map_err(storage_error)?;

    let record = MessageRecord::inbound(
        route.org_id.clone(),
        &inbound.provider_message_id,
        &from_e164,
        &to_e164,
        &assessment.redaction.text,
        inbound.media_urls.clone(),
        received_at,
    );

    let mut tx = state.store.begin().await.map_err(storage_error)?;
    let message_id = match state.store.insert_message(&mut tx, &record).await.map_err(storage_error)? {
        InsertOutcome::Inserted(message_id) => message_id,
        InsertOutcome::Duplicate => {
            info!(
                event_name = "messaging.inbound.duplicate",
                event_id = %event.id,
                provider_message_id = %inbound.provider_message_id,
                org_id = %route.org_id,
                "inbound message already stored under another event"
            );
            return Ok(WebhookOutcome::Duplicate);
        }
    };

    let stream = clinic_stream(route.org_id.as_str());
    let received = CanonicalEvent::MessageReceived(MessageReceivedV1 {
        message_id: message_id.0.clone(),
        clinic_id: route.org_id.to_string(),
        from_e164: from_e164.clone(),
        to_e164: to_e164.clone(),
        body: record.body.clone(),
        media_urls: record.media.clone(),
        provider: PROVIDER_TELNYX.to_string(),
        received_at,
        provider_event_id: Some(event.id.clone()),
    });
    state
        .store
        .append_canonical_event(&mut tx, &stream, &event.id, &received, Some(&event.id))
        .await
        .map_err(storage_error)?;

    let consent = ConsentChangedV1 {
        clinic_id: route.org_id.to_string(),
        recipient_e164: from_e164.clone(),
        reason: OPT_OUT_REASON.to_string(),
        recorded_at: received_at,
    };
    match assessment.keyword {
        Keyword::Stop => {
            state
                .store
                .insert_unsubscribe(&mut tx, &route.org_id, &from_e164, OPT_OUT_REASON)
                .await
                .map_err(storage_error)?;
            state
                .store
                .append_canonical_event(
                    &mut tx,
                    &stream,
                    &format!("{}:opt_out", event.id),
                    &CanonicalEvent::OptOutRecorded(consent),
                    Some(&event.id),
                )
                .await
                .map_err(storage_error)?;
        }
        Keyword::Start => {
            state
                .store
                .delete_unsubscribe(&mut tx, &route.org_id, &from_e164)
                .await
                .map_err(storage_error)?;
            let opt_in = ConsentChangedV1 { reason: "START".to_string(), ..consent };
            state
                .store
                .append_canonical_event(
                    &mut tx,
                    &stream,
                    &format!("{}:opt_in", event.id),
                    &CanonicalEvent::OptInRecorded(opt_in),
                    Some(&event.id),
                )
                .await
                .map_err(storage_error)?;
        }
        Keyword::Help | Keyword::None => {}
    }
    tx.commit().await.map_err(|error| storage_error(RepositoryError::from(error)))?;

    info!(
        event_name = "messaging.inbound.stored",
        event_id = %event.id,
        message_id = %message_id.0,
        org_id = %route.org_id,
        keyword = assessment.keyword.as_str(),
        card_detected = assessment.redaction.card_detected,
        "inbound message stored"
    );

    if unsubscribed {
        info!(
            event_name = "messaging.inbound.suppressed",
            event_id = %event.id,
            org_id = %route.org_id,
            "sender is opted out, no reply"
        );
        return Ok(WebhookOutcome::Processed);
    }
    // Keyword and card acknowledgments replace the conversation turn.
    if let Some(kind) = assessment.compliance_ack() {
        spawn_ack(state, &route, &inbound.to, &inbound.from, kind, &event.id);
        return Ok(WebhookOutcome::Processed);
    }

    spawn_ack(state, &route, &inbound.to, &inbound.from, AckKind::Sms, &event.id);

    let metadata = BTreeMap::from([
        ("direction".to_string(), "inbound".to_string()),
        ("provider_event_id".to_string(), event.id.clone()),
        ("provider_message_id".to_string(), inbound.provider_message_id.clone()),
    ]);
    let request = MessageRequest {
        org_id: route.org_id.to_string(),
        lead_id: lead.id.0.clone(),
        conversation_id: sms_conversation_id(route.org_id.as_str(), &inbound.from),
        channel: Channel::Sms,
        from: from_e164,
        to: to_e164,
        message: assessment.redaction.text,
        metadata,
    };
    let job_id = format!("{PROVIDER_TELNYX}:{}", inbound.provider_message_id);
    if let Err(publish_error) =
        state.publisher.enqueue_message(&job_id, request, EnqueueOptions::default()).await
    {
        warn!(
            event_name = "conversation.enqueue.failed",
            event_id = %event.id,
            job_id = %job_id,
            error = %publish_error,
            "failed to hand inbound message to the conversation engine"
        );
    }
    Ok(WebhookOutcome::Processed)
}

pub(super) async fn delivery_status(
    state: &WebhookState,
    event: &ProviderEvent,
) -> Result<WebhookOutcome, ApplicationError> {
    let update = DeliveryUpdate::from_payload(&event.payload).map_err(DomainError::from)?;
    let at = event.occurred_at.unwrap_or_else(Utc::now);
    let outcome = state
        .store
        .update_delivery_status(&update.provider_message_id, &update.status, at, state.messenger.policy())
        .await
        .map_err(storage_error)?;

    match outcome {
        ReceiptOutcome::Applied { status } if update.is_failed() => warn!(
            event_name = "messaging.delivery.failed",
            event_id = %event.id,
            provider_message_id = %update.provider_message_id,
            provider_status = %update.status,
            status = %status,
            "provider reported a failed delivery"
        ),
        ReceiptOutcome::Applied { status } => info!(
            event_name = "messaging.delivery.updated",
            event_id = %event.id,
            provider_message_id = %update.provider_message_id,
            status = %status,
            "delivery status recorded"
        ),
        ReceiptOutcome::Stale { current } => info!(
            event_name = "messaging.delivery.stale",
            event_id = %event.id,
            provider_message_id = %update.provider_message_id,
            status = %update.status,
            current = %current,
            "receipt arrived after the message settled"
        ),
        ReceiptOutcome::Unmatched => info!(
            event_name = "messaging.delivery.unmatched",
            event_id = %event.id,
            provider_message_id = %update.provider_message_id,
            status = %update.status,
            "delivery status for unknown message"
        ),
    }
    Ok(WebhookOutcome::Processed)
}
