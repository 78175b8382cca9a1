//! Transactional messaging store.
//!
//! Mutating operations take a `&mut SqliteConnection` so the caller can run
//! several of them, plus the canonical event append, inside one transaction
//! opened with [`SqlMessagingStore::begin`]. Dropping the transaction without
//! committing rolls everything back.

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, Sqlite, SqliteConnection, Transaction};
use uuid::Uuid;

use ringback_core::domain::event::CanonicalEvent;
use ringback_core::compliance::MessagePurpose;
use ringback_core::domain::message::{
    is_failure_receipt, is_settled_status, MessageDirection, MessageId, MessageRecord,
    STATUS_DELIVERED, STATUS_FAILED, STATUS_RETRY_PENDING, STATUS_SUPPRESSED,
};
use ringback_core::retry::RetryPolicy;
use ringback_core::domain::provisioning::{
    BrandRecord, CampaignRecord, HostedNumberOrder, HOSTED_STATUS_ACTIVATED,
};
use ringback_core::domain::OrgId;
use ringback_core::phone::{lookup_variants, normalize_e164_digits};

use super::{
    format_timestamp, parse_optional_timestamp, parse_timestamp, parse_u32, RepositoryError,
};
use crate::DbPool;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(MessageId),
    /// The provider message id was already stored; the caller has nothing
    /// left to do.
    Duplicate,
}

/// What a provider delivery receipt did to the stored message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReceiptOutcome {
    Applied { status: String },
    /// The receipt arrived after the message had already settled.
    Stale { current: String },
    Unmatched,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    AlreadyRecorded,
}

/// Tenant that owns an inbound number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClinicRoute {
    pub org_id: OrgId,
    pub clinic_name: Option<String>,
}

#[derive(Clone)]
pub struct SqlMessagingStore {
    pool: DbPool,
}

impl SqlMessagingStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, RepositoryError> {
        Ok(self.pool.begin().await?)
    }

    pub async fn upsert_organization(&self, org_id: &OrgId, name: &str) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO organizations (id, name, created_at) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        )
        .bind(org_id.as_str())
        .bind(name)
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Resolves the tenant owning an activated hosted number. An unmapped
    /// number is `Ok(None)`.
    pub async fn lookup_clinic_by_number(
        &self,
        number: &str,
    ) -> Result<Option<ClinicRoute>, RepositoryError> {
        let variants = lookup_variants(number);
        if variants.is_empty() {
            return Ok(None);
        }

        let placeholders = vec!["?"; variants.len()].join(", ");
        let sql = format!(
            "SELECT h.org_id AS org_id, o.name AS clinic_name
             FROM hosted_number_orders h
             LEFT JOIN organizations o ON o.id = h.org_id
             WHERE h.e164_number IN ({placeholders}) AND h.status = ?
             ORDER BY h.updated_at DESC
             LIMIT 1"
        );
        let mut query = sqlx::query(&sql);
        for variant in &variants {
            query = query.bind(variant);
        }
        let row = query.bind(HOSTED_STATUS_ACTIVATED).fetch_optional(&self.pool).await?;

        row.map(|row| -> Result<ClinicRoute, RepositoryError> {
            Ok(ClinicRoute {
                org_id: OrgId(row.try_get("org_id")?),
                clinic_name: row.try_get("clinic_name")?,
            })
        })
        .transpose()
    }

    pub async fn insert_message(
        &self,
        conn: &mut SqliteConnection,
        record: &MessageRecord,
    ) -> Result<InsertOutcome, RepositoryError> {
        let media_json = serde_json::to_string(&record.media)
            .map_err(|error| RepositoryError::Decode(format!("media encode: {error}")))?;

        let result = sqlx::query(
            "INSERT INTO messages (
                id,
                org_id,
                direction,
                from_e164,
                to_e164,
                body,
                media_json,
                purpose,
                provider_status,
                provider_message_id,
                send_attempts,
                last_attempt_at,
                next_retry_at,
                delivered_at,
                failed_at,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id.0)
        .bind(record.org_id.as_str())
        .bind(record.direction.as_str())
        .bind(&record.from)
        .bind(&record.to)
        .bind(&record.body)
        .bind(media_json)
        .bind(record.purpose.as_str())
        .bind(&record.provider_status)
        .bind(record.provider_message_id.as_deref())
        .bind(i64::from(record.send_attempts))
        .bind(record.last_attempt_at.map(format_timestamp))
        .bind(record.next_retry_at.map(format_timestamp))
        .bind(record.delivered_at.map(format_timestamp))
        .bind(record.failed_at.map(format_timestamp))
        .bind(format_timestamp(record.created_at))
        .execute(&mut *conn)
        .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted(record.id.clone())),
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                Ok(InsertOutcome::Duplicate)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Idempotent; returns whether a new opt-out row was written.
    pub async fn insert_unsubscribe(
        &self,
        conn: &mut SqliteConnection,
        org_id: &OrgId,
        recipient: &str,
        reason: &str,
    ) -> Result<bool, RepositoryError> {
        let recipient = canonical_recipient(recipient)?;
        let result = sqlx::query(
            "INSERT INTO unsubscribes (org_id, recipient, reason, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(org_id, recipient) DO NOTHING",
        )
        .bind(org_id.as_str())
        .bind(recipient)
        .bind(reason)
        .bind(format_timestamp(Utc::now()))
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete-if-exists; returns whether an opt-out row was removed.
    pub async fn delete_unsubscribe(
        &self,
        conn: &mut SqliteConnection,
        org_id: &OrgId,
        recipient: &str,
    ) -> Result<bool, RepositoryError> {
        let recipient = canonical_recipient(recipient)?;
        let result = sqlx::query("DELETE FROM unsubscribes WHERE org_id = ? AND recipient = ?")
            .bind(org_id.as_str())
            .bind(recipient)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn is_unsubscribed(
        &self,
        org_id: &OrgId,
        recipient: &str,
    ) -> Result<bool, RepositoryError> {
        let recipient = canonical_recipient(recipient)?;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM unsubscribes WHERE org_id = ? AND recipient = ?",
        )
        .bind(org_id.as_str())
        .bind(recipient)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn upsert_hosted_order(
        &self,
        conn: &mut SqliteConnection,
        order: &HostedNumberOrder,
    ) -> Result<(), RepositoryError> {
        let number = canonical_recipient(&order.phone_number)?;
        let updated_at = format_timestamp(order.updated_at);
        sqlx::query(
            "INSERT INTO hosted_number_orders (
                id,
                org_id,
                e164_number,
                provider_order_id,
                status,
                last_error,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(org_id, e164_number) DO UPDATE SET
                provider_order_id = excluded.provider_order_id,
                status = excluded.status,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(order.org_id.as_str())
        .bind(number)
        .bind(&order.provider_order_id)
        .bind(&order.status)
        .bind(order.last_error.as_deref())
        .bind(&updated_at)
        .bind(&updated_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn insert_brand(
        &self,
        conn: &mut SqliteConnection,
        brand: &BrandRecord,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO ten_dlc_brands (brand_id, org_id, status, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(brand_id) DO UPDATE SET status = excluded.status",
        )
        .bind(&brand.brand_id)
        .bind(brand.org_id.as_str())
        .bind(&brand.status)
        .bind(format_timestamp(brand.created_at))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn insert_campaign(
        &self,
        conn: &mut SqliteConnection,
        campaign: &CampaignRecord,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO ten_dlc_campaigns (campaign_id, brand_id, org_id, use_case, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(campaign_id) DO UPDATE SET status = excluded.status",
        )
        .bind(&campaign.campaign_id)
        .bind(&campaign.brand_id)
        .bind(campaign.org_id.as_str())
        .bind(&campaign.use_case)
        .bind(&campaign.status)
        .bind(format_timestamp(campaign.created_at))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Appends to the canonical log and the outbox. The `(stream,
    /// idempotency key)` pair is unique, so a replay is reported rather than
    /// written twice.
    pub async fn append_canonical_event(
        &self,
        conn: &mut SqliteConnection,
        stream_id: &str,
        idempotency_key: &str,
        event: &CanonicalEvent,
        correlation_id: Option<&str>,
    ) -> Result<AppendOutcome, RepositoryError> {
        let payload = event
            .payload()
            .map_err(|error| RepositoryError::Decode(format!("event encode: {error}")))?;
        let payload_json = payload.to_string();
        let event_id = Uuid::new_v4().to_string();
        let now = format_timestamp(Utc::now());

        let appended = sqlx::query(
            "INSERT INTO canonical_events (id, stream_id, idempotency_key, event_type, payload_json, occurred_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(stream_id, idempotency_key) DO NOTHING",
        )
        .bind(&event_id)
        .bind(stream_id)
        .bind(idempotency_key)
        .bind(event.event_type())
        .bind(&payload_json)
        .bind(&now)
        .execute(&mut *conn)
        .await?;
        if appended.rows_affected() == 0 {
            return Ok(AppendOutcome::AlreadyRecorded);
        }

        sqlx::query(
            "INSERT INTO outbox (id, aggregate, event_type, payload_json, correlation_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&event_id)
        .bind(stream_id)
        .bind(event.event_type())
        .bind(&payload_json)
        .bind(correlation_id)
        .bind(&now)
        .execute(&mut *conn)
        .await?;

        Ok(AppendOutcome::Appended)
    }

    /// Applies a delivery receipt. Unknown provider ids are a no-op, and a
    /// late non-final receipt never reopens a settled message. A failure
    /// receipt puts the message back on the retry schedule until the policy
    /// ceiling is reached.
    pub async fn update_delivery_status(
        &self,
        provider_message_id: &str,
        status: &str,
        at: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<ReceiptOutcome, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT id, provider_status, send_attempts FROM messages WHERE provider_message_id = ?",
        )
        .bind(provider_message_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(ReceiptOutcome::Unmatched);
        };
        let id: String = row.try_get("id")?;
        let current: String = row.try_get("provider_status")?;
        let attempts = parse_u32("send_attempts", row.try_get("send_attempts")?)?;

        let failure = is_failure_receipt(status);
        let stale = current == STATUS_DELIVERED
            || (status != STATUS_DELIVERED && is_settled_status(&current));
        if stale {
            return Ok(ReceiptOutcome::Stale { current });
        }

        let at_text = format_timestamp(at);
        let (applied, next_retry_at, delivered_at, failed_at) = if status == STATUS_DELIVERED {
            (STATUS_DELIVERED.to_string(), None, Some(at_text.clone()), None)
        } else if failure && attempts < policy.max_attempts {
            let next = at + policy.next_delay(attempts.saturating_sub(1));
            (STATUS_RETRY_PENDING.to_string(), Some(format_timestamp(next)), None, Some(at_text.clone()))
        } else if failure {
            (STATUS_FAILED.to_string(), None, None, Some(at_text.clone()))
        } else {
            (status.to_string(), None, None, None)
        };

        sqlx::query(
            "UPDATE messages SET
                provider_status = ?,
                next_retry_at = ?,
                delivered_at = COALESCE(?, delivered_at),
                failed_at = COALESCE(?, failed_at)
             WHERE id = ?",
        )
        .bind(&applied)
        .bind(next_retry_at)
        .bind(delivered_at)
        .bind(failed_at)
        .bind(&id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(ReceiptOutcome::Applied { status: applied })
    }

    /// Closes a pending resend that must no longer go out.
    pub async fn mark_suppressed(
        &self,
        conn: &mut SqliteConnection,
        id: &MessageId,
    ) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE messages SET provider_status = ?, next_retry_at = NULL WHERE id = ?")
            .bind(STATUS_SUPPRESSED)
            .bind(&id.0)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Records one more failed attempt. `next_retry_at = None` means no
    /// further retry will be made.
    pub async fn schedule_retry(
        &self,
        conn: &mut SqliteConnection,
        id: &MessageId,
        status: &str,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let now = format_timestamp(now);
        let failed_at = (status == STATUS_FAILED).then_some(now.as_str());
        sqlx::query(
            "UPDATE messages SET
                send_attempts = send_attempts + 1,
                provider_status = ?,
                last_attempt_at = ?,
                next_retry_at = ?,
                failed_at = COALESCE(?, failed_at)
             WHERE id = ?",
        )
        .bind(status)
        .bind(&now)
        .bind(next_retry_at.map(format_timestamp))
        .bind(failed_at)
        .bind(&id.0)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn mark_sent(
        &self,
        conn: &mut SqliteConnection,
        id: &MessageId,
        provider_message_id: &str,
        status: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE messages SET
                send_attempts = send_attempts + 1,
                provider_status = ?,
                provider_message_id = ?,
                last_attempt_at = ?,
                next_retry_at = NULL
             WHERE id = ?",
        )
        .bind(status)
        .bind(provider_message_id)
        .bind(format_timestamp(now))
        .bind(&id.0)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Outbound messages waiting for another send attempt, oldest due first.
    pub async fn list_retry_candidates(
        &self,
        limit: u32,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<MessageRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{MESSAGE_COLUMNS}
             WHERE direction = 'outbound'
               AND provider_status IN ('failed', 'retry_pending')
               AND send_attempts < ?
               AND (next_retry_at IS NULL OR next_retry_at <= ?)
             ORDER BY next_retry_at ASC, created_at ASC
             LIMIT ?"
        ))
        .bind(i64::from(max_attempts))
        .bind(format_timestamp(now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(message_from_row).collect()
    }

    pub async fn get_message(&self, id: &MessageId) -> Result<Option<MessageRecord>, RepositoryError> {
        let row = sqlx::query(&format!("{MESSAGE_COLUMNS} WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(message_from_row).transpose()
    }

    pub async fn find_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<MessageRecord>, RepositoryError> {
        let row = sqlx::query(&format!("{MESSAGE_COLUMNS} WHERE provider_message_id = ?"))
            .bind(provider_message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(message_from_row).transpose()
    }

    pub async fn list_messages(
        &self,
        org_id: &OrgId,
        direction: Option<MessageDirection>,
    ) -> Result<Vec<MessageRecord>, RepositoryError> {
        let rows = match direction {
            Some(direction) => {
                sqlx::query(&format!(
                    "{MESSAGE_COLUMNS} WHERE org_id = ? AND direction = ? ORDER BY created_at ASC"
                ))
                .bind(org_id.as_str())
                .bind(direction.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!("{MESSAGE_COLUMNS} WHERE org_id = ? ORDER BY created_at ASC"))
                    .bind(org_id.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(message_from_row).collect()
    }

    pub async fn count_messages(&self) -> Result<i64, RepositoryError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM messages").fetch_one(&self.pool).await?)
    }
}

const MESSAGE_COLUMNS: &str = "SELECT
        id,
        org_id,
        direction,
        from_e164,
        to_e164,
        body,
        media_json,
        purpose,
        provider_status,
        provider_message_id,
        send_attempts,
        last_attempt_at,
        next_retry_at,
        delivered_at,
        failed_at,
        created_at
     FROM messages";

fn canonical_recipient(raw: &str) -> Result<String, RepositoryError> {
    let digits = normalize_e164_digits(raw);
    if digits.is_empty() {
        return Err(RepositoryError::Validation(format!("no usable phone number in `{raw}`")));
    }
    Ok(digits)
}

fn message_from_row(row: SqliteRow) -> Result<MessageRecord, RepositoryError> {
    let direction_raw = row.try_get::<String, _>("direction")?;
    let direction = MessageDirection::parse(&direction_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown message direction `{direction_raw}`"))
    })?;
    let media_json = row.try_get::<String, _>("media_json")?;
    let media = serde_json::from_str(&media_json)
        .map_err(|error| RepositoryError::Decode(format!("invalid media_json: {error}")))?;
    let purpose_raw = row.try_get::<String, _>("purpose")?;
    let purpose = MessagePurpose::parse(&purpose_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown message purpose `{purpose_raw}`"))
    })?;

    Ok(MessageRecord {
        id: MessageId(row.try_get("id")?),
        org_id: OrgId(row.try_get("org_id")?),
        direction,
        from: row.try_get("from_e164")?,
        to: row.try_get("to_e164")?,
        body: row.try_get("body")?,
        media,
        purpose,
        provider_status: row.try_get("provider_status")?,
        provider_message_id: row.try_get("provider_message_id")?,
        send_attempts: parse_u32("send_attempts", row.try_get("send_attempts")?)?,
        last_attempt_at: parse_optional_timestamp("last_attempt_at", row.try_get("last_attempt_at")?)?,
        next_retry_at: parse_optional_timestamp("next_retry_at", row.try_get("next_retry_at")?)?,
        delivered_at: parse_optional_timestamp("delivered_at", row.try_get("delivered_at")?)?,
        failed_at: parse_optional_timestamp("failed_at", row.try_get("failed_at")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use ringback_core::domain::event::{clinic_stream, CanonicalEvent, MessageReceivedV1};
    use ringback_core::domain::message::{MessageRecord, STATUS_RETRY_PENDING};
    use ringback_core::domain::provisioning::HostedNumberOrder;
    use ringback_core::domain::OrgId;
    use ringback_core::retry::RetryPolicy;

    use super::{AppendOutcome, InsertOutcome, ReceiptOutcome, SqlMessagingStore};
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("timestamp").with_timezone(&Utc)
    }

    fn received_event(message_id: &str) -> CanonicalEvent {
        CanonicalEvent::MessageReceived(MessageReceivedV1 {
            message_id: message_id.to_string(),
            clinic_id: "org-1".to_string(),
            from_e164: "+15550001111".to_string(),
            to_e164: "+15559998888".to_string(),
            body: "Need info".to_string(),
            media_urls: Vec::new(),
            provider: "telnyx".to_string(),
            received_at: parse_ts("2026-02-23T12:00:00Z"),
            provider_event_id: None,
        })
    }

    async fn activate_number(store: &SqlMessagingStore, org: &str, number: &str) {
        let mut tx = store.begin().await.expect("begin");
        store
            .upsert_hosted_order(
                &mut tx,
                &HostedNumberOrder {
                    provider_order_id: format!("ord-{org}"),
                    org_id: OrgId::from(org),
                    phone_number: number.to_string(),
                    status: "activated".to_string(),
                    last_error: None,
                    updated_at: parse_ts("2026-02-23T12:00:00Z"),
                },
            )
            .await
            .expect("upsert order");
        tx.commit().await.expect("commit");
    }

    #[tokio::test]
    async fn number_lookup_matches_any_spelling_of_activated_numbers() {
        let pool = setup_pool().await;
        let store = SqlMessagingStore::new(pool.clone());
        store.upsert_organization(&OrgId::from("org-1"), "Glow Med Spa").await.expect("org");
        activate_number(&store, "org-1", "+1 (555) 999-8888").await;

        let route = store.lookup_clinic_by_number("5559998888").await.expect("lookup");
        let route = route.expect("route");
        assert_eq!(route.org_id, OrgId::from("org-1"));
        assert_eq!(route.clinic_name.as_deref(), Some("Glow Med Spa"));

        assert_eq!(store.lookup_clinic_by_number("+15550000000").await.expect("lookup"), None);
        assert_eq!(store.lookup_clinic_by_number("").await.expect("lookup"), None);

        pool.close().await;
    }

    #[tokio::test]
    async fn pending_hosted_order_does_not_route() {
        let pool = setup_pool().await;
        let store = SqlMessagingStore::new(pool.clone());
        let mut tx = store.begin().await.expect("begin");
        store
            .upsert_hosted_order(
                &mut tx,
                &HostedNumberOrder {
                    provider_order_id: "ord-1".to_string(),
                    org_id: OrgId::from("org-1"),
                    phone_number: "+15559998888".to_string(),
                    status: "pending".to_string(),
                    last_error: Some("awaiting LOA".to_string()),
                    updated_at: parse_ts("2026-02-23T12:00:00Z"),
                },
            )
            .await
            .expect("upsert");
        tx.commit().await.expect("commit");

        assert_eq!(store.lookup_clinic_by_number("+15559998888").await.expect("lookup"), None);
        pool.close().await;
    }

    #[tokio::test]
    async fn duplicate_provider_message_id_is_reported_not_raised() {
        let pool = setup_pool().await;
        let store = SqlMessagingStore::new(pool.clone());
        let now = parse_ts("2026-02-23T12:00:00Z");

        let first = MessageRecord::inbound(
            OrgId::from("org-1"),
            "msg-1",
            "+15550001111",
            "+15559998888",
            "Need info",
            Vec::new(),
            now,
        );
        let replay = MessageRecord::inbound(
            OrgId::from("org-1"),
            "msg-1",
            "+15550001111",
            "+15559998888",
            "Need info",
            Vec::new(),
            now,
        );

        let mut tx = store.begin().await.expect("begin");
        let outcome = store.insert_message(&mut tx, &first).await.expect("insert");
        assert_eq!(outcome, InsertOutcome::Inserted(first.id.clone()));
        tx.commit().await.expect("commit");

        let mut tx = store.begin().await.expect("begin");
        let outcome = store.insert_message(&mut tx, &replay).await.expect("insert replay");
        assert_eq!(outcome, InsertOutcome::Duplicate);
        drop(tx);

        assert_eq!(store.count_messages().await.expect("count"), 1);
        let stored = store.get_message(&first.id).await.expect("find").expect("message");
        assert_eq!(stored, first);
        pool.close().await;
    }

    #[tokio::test]
    async fn dropped_transaction_leaves_no_rows() {
        let pool = setup_pool().await;
        let store = SqlMessagingStore::new(pool.clone());
        let now = parse_ts("2026-02-23T12:00:00Z");
        let record = MessageRecord::inbound(
            OrgId::from("org-1"),
            "msg-rollback",
            "+15550001111",
            "+15559998888",
            "hello",
            Vec::new(),
            now,
        );

        {
            let mut tx = store.begin().await.expect("begin");
            store.insert_message(&mut tx, &record).await.expect("insert");
            store
                .append_canonical_event(&mut tx, &clinic_stream("org-1"), "evt-1", &received_event("msg-rollback"), None)
                .await
                .expect("append");
        }

        assert_eq!(store.count_messages().await.expect("count"), 0);
        let events: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM canonical_events")
            .fetch_one(&pool)
            .await
            .expect("count events");
        assert_eq!(events, 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn canonical_event_append_is_idempotent_per_stream() {
        let pool = setup_pool().await;
        let store = SqlMessagingStore::new(pool.clone());
        let stream = clinic_stream("org-1");

        let mut tx = store.begin().await.expect("begin");
        let first = store
            .append_canonical_event(&mut tx, &stream, "evt-1", &received_event("m-1"), Some("corr-1"))
            .await
            .expect("append");
        let second = store
            .append_canonical_event(&mut tx, &stream, "evt-1", &received_event("m-1"), Some("corr-1"))
            .await
            .expect("append again");
        let other_stream = store
            .append_canonical_event(&mut tx, &clinic_stream("org-2"), "evt-1", &received_event("m-1"), None)
            .await
            .expect("append other stream");
        tx.commit().await.expect("commit");

        assert_eq!(first, AppendOutcome::Appended);
        assert_eq!(second, AppendOutcome::AlreadyRecorded);
        assert_eq!(other_stream, AppendOutcome::Appended);

        let outbox: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
            .fetch_one(&pool)
            .await
            .expect("count outbox");
        assert_eq!(outbox, 2);
        pool.close().await;
    }

    #[tokio::test]
    async fn unsubscribe_insert_and_delete_are_idempotent() {
        let pool = setup_pool().await;
        let store = SqlMessagingStore::new(pool.clone());
        let org = OrgId::from("org-1");

        let mut tx = store.begin().await.expect("begin");
        assert!(store.insert_unsubscribe(&mut tx, &org, "+15550001111", "STOP").await.expect("insert"));
        assert!(!store.insert_unsubscribe(&mut tx, &org, "555-000-1111", "STOP").await.expect("insert"));
        tx.commit().await.expect("commit");

        assert!(store.is_unsubscribed(&org, "(555) 000-1111").await.expect("check"));
        assert!(!store.is_unsubscribed(&OrgId::from("org-2"), "+15550001111").await.expect("check"));

        let mut tx = store.begin().await.expect("begin");
        assert!(store.delete_unsubscribe(&mut tx, &org, "+15550001111").await.expect("delete"));
        assert!(!store.delete_unsubscribe(&mut tx, &org, "+15550001111").await.expect("delete"));
        tx.commit().await.expect("commit");

        assert!(!store.is_unsubscribed(&org, "+15550001111").await.expect("check"));
        pool.close().await;
    }

    #[tokio::test]
    async fn retry_candidates_respect_due_time_and_ceiling() {
        let pool = setup_pool().await;
        let store = SqlMessagingStore::new(pool.clone());
        let now = parse_ts("2026-02-23T12:00:00Z");
        let org = OrgId::from("org-1");

        let mut due = MessageRecord::outbound(org.clone(), "+15559998888", "+15550001111", "due", now);
        due.provider_status = STATUS_RETRY_PENDING.to_string();
        due.send_attempts = 1;
        due.next_retry_at = Some(now - Duration::minutes(1));

        let mut later = MessageRecord::outbound(org.clone(), "+15559998888", "+15550001111", "later", now);
        later.provider_status = STATUS_RETRY_PENDING.to_string();
        later.send_attempts = 1;
        later.next_retry_at = Some(now + Duration::minutes(5));

        let mut exhausted = MessageRecord::outbound(org.clone(), "+15559998888", "+15550001111", "spent", now);
        exhausted.provider_status = "failed".to_string();
        exhausted.send_attempts = 5;

        let mut tx = store.begin().await.expect("begin");
        for record in [&due, &later, &exhausted] {
            store.insert_message(&mut tx, record).await.expect("insert");
        }
        tx.commit().await.expect("commit");

        let candidates = store.list_retry_candidates(25, 5, now).await.expect("candidates");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, due.id);

        let mut tx = store.begin().await.expect("begin");
        store
            .schedule_retry(&mut tx, &due.id, STATUS_RETRY_PENDING, Some(now + Duration::minutes(10)), now)
            .await
            .expect("schedule");
        tx.commit().await.expect("commit");

        let rescheduled = store.get_message(&due.id).await.expect("find").expect("message");
        assert_eq!(rescheduled.send_attempts, 2);
        assert_eq!(rescheduled.last_attempt_at, Some(now));
        assert_eq!(rescheduled.next_retry_at, Some(now + Duration::minutes(10)));
        assert!(store.list_retry_candidates(25, 5, now).await.expect("candidates").is_empty());
        pool.close().await;
    }

    #[tokio::test]
    async fn delivery_receipt_sets_terminal_timestamps() {
        let pool = setup_pool().await;
        let store = SqlMessagingStore::new(pool.clone());
        let now = parse_ts("2026-02-23T12:00:00Z");

        let mut sent = MessageRecord::outbound(OrgId::from("org-1"), "+15559998888", "+15550001111", "hi", now);
        sent.provider_message_id = Some("out-1".to_string());
        sent.provider_status = "sent".to_string();
        let mut tx = store.begin().await.expect("begin");
        store.insert_message(&mut tx, &sent).await.expect("insert");
        tx.commit().await.expect("commit");

        let delivered_at = now + Duration::seconds(4);
        let policy = RetryPolicy::default();
        assert_eq!(
            store.update_delivery_status("out-1", "delivered", delivered_at, &policy).await.expect("update"),
            ReceiptOutcome::Applied { status: "delivered".to_string() }
        );
        assert_eq!(
            store.update_delivery_status("missing", "delivered", delivered_at, &policy).await.expect("update"),
            ReceiptOutcome::Unmatched
        );

        let stored = store.find_by_provider_message_id("out-1").await.expect("find").expect("message");
        assert_eq!(stored.provider_status, "delivered");
        assert_eq!(stored.delivered_at, Some(delivered_at));
        assert_eq!(stored.failed_at, None);
        pool.close().await;
    }

    async fn sent_message(store: &SqlMessagingStore, provider_message_id: &str, now: DateTime<Utc>) {
        let mut sent = MessageRecord::outbound(OrgId::from("org-1"), "+15559998888", "+15550001111", "hi", now);
        sent.provider_message_id = Some(provider_message_id.to_string());
        sent.provider_status = "sent".to_string();
        sent.send_attempts = 1;
        sent.last_attempt_at = Some(now);
        let mut tx = store.begin().await.expect("begin");
        store.insert_message(&mut tx, &sent).await.expect("insert");
        tx.commit().await.expect("commit");
    }

    #[tokio::test]
    async fn late_receipt_never_reopens_a_delivered_message() {
        let pool = setup_pool().await;
        let store = SqlMessagingStore::new(pool.clone());
        let policy = RetryPolicy::default();
        let now = parse_ts("2026-02-23T12:00:00Z");
        sent_message(&store, "out-2", now).await;

        store.update_delivery_status("out-2", "delivered", now, &policy).await.expect("delivered");
        let late = store
            .update_delivery_status("out-2", "sent", now + Duration::seconds(2), &policy)
            .await
            .expect("late");
        assert_eq!(late, ReceiptOutcome::Stale { current: "delivered".to_string() });

        let stored = store.find_by_provider_message_id("out-2").await.expect("find").expect("message");
        assert_eq!(stored.provider_status, "delivered");
        assert_eq!(stored.delivered_at, Some(now));
        pool.close().await;
    }

    #[tokio::test]
    async fn failure_receipt_waits_out_the_backoff_before_a_resend() {
        let pool = setup_pool().await;
        let store = SqlMessagingStore::new(pool.clone());
        let policy = RetryPolicy::default();
        let now = parse_ts("2026-02-23T12:00:00Z");
        sent_message(&store, "out-3", now).await;

        let failed = store
            .update_delivery_status("out-3", "undelivered", now, &policy)
            .await
            .expect("failed");
        assert_eq!(failed, ReceiptOutcome::Applied { status: STATUS_RETRY_PENDING.to_string() });

        let stored = store.find_by_provider_message_id("out-3").await.expect("find").expect("message");
        assert_eq!(stored.next_retry_at, Some(now + Duration::minutes(5)));
        assert_eq!(stored.failed_at, Some(now));
        assert!(store.list_retry_candidates(25, 5, now).await.expect("candidates").is_empty());
        assert_eq!(
            store.list_retry_candidates(25, 5, now + Duration::minutes(5)).await.expect("due").len(),
            1
        );

        let late = store
            .update_delivery_status("out-3", "queued", now + Duration::seconds(1), &policy)
            .await
            .expect("late");
        assert_eq!(late, ReceiptOutcome::Stale { current: STATUS_RETRY_PENDING.to_string() });
        pool.close().await;
    }

    #[tokio::test]
    async fn failure_receipt_at_the_ceiling_is_final() {
        let pool = setup_pool().await;
        let store = SqlMessagingStore::new(pool.clone());
        let policy = RetryPolicy { max_attempts: 1, ..RetryPolicy::default() };
        let now = parse_ts("2026-02-23T12:00:00Z");
        sent_message(&store, "out-4", now).await;

        let failed = store.update_delivery_status("out-4", "failed", now, &policy).await.expect("failed");
        assert_eq!(failed, ReceiptOutcome::Applied { status: "failed".to_string() });
        let stored = store.find_by_provider_message_id("out-4").await.expect("find").expect("message");
        assert!(stored.next_retry_at.is_none());
        assert!(store.list_retry_candidates(25, 1, now + Duration::days(1)).await.expect("due").is_empty());
        pool.close().await;
    }
}
