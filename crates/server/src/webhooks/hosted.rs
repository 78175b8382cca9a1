use chrono::Utc;
use tracing::info;

use ringback_core::domain::event::{clinic_stream, CanonicalEvent, HostedOrderActivatedV1};
use ringback_core::domain::provisioning::HostedNumberOrder;
use ringback_core::domain::OrgId;
use ringback_core::envelope::{HostedOrderUpdate, ProviderEvent};
use ringback_core::errors::{ApplicationError, DomainError};
use ringback_core::phone::normalize_e164;
use ringback_db::repositories::RepositoryError;

use super::{storage_error, WebhookOutcome, WebhookState};

/// Upserts the order and, on activation, emits `HostedOrderActivatedV1` in
/// the same transaction.
pub(super) async fn hosted_order(
    state: &WebhookState,
    event: &ProviderEvent,
) -> Result<WebhookOutcome, ApplicationError> {
    let update = HostedOrderUpdate::from_payload(&event.payload).map_err(DomainError::from)?;
    let updated_at = event.occurred_at.unwrap_or_else(Utc::now);
    let activated = update.is_activated();
    let order = HostedNumberOrder {
        provider_order_id: update.order_id,
        org_id: OrgId(update.org_id),
        phone_number: update.phone_number,
        status: update.status,
        last_error: update.last_error,
        updated_at,
    };

    let mut tx = state.store.begin().await.map_err(storage_error)?;
    state.store.upsert_hosted_order(&mut tx, &order).await.map_err(storage_error)?;
    if activated {
        let activation = CanonicalEvent::HostedOrderActivated(HostedOrderActivatedV1 {
            order_id: order.provider_order_id.clone(),
            clinic_id: order.org_id.to_string(),
            e164_number: normalize_e164(&order.phone_number),
            activated_at: updated_at,
        });
        state
            .store
            .append_canonical_event(
                &mut tx,
                &clinic_stream(order.org_id.as_str()),
                &event.id,
                &activation,
                Some(&event.id),
            )
            .await
            .map_err(storage_error)?;
    }
    tx.commit().await.map_err(|error| storage_error(RepositoryError::from(error)))?;

    info!(
        event_name = "provisioning.hosted_order.updated",
        event_id = %event.id,
        order_id = %order.provider_order_id,
        org_id = %order.org_id,
        status = %order.status,
        activated,
        "hosted number order updated"
    );
    Ok(WebhookOutcome::Processed)
}
