use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};
use uuid::Uuid;

use ringback_core::domain::lead::{DepositStatus, Lead, LeadId, SchedulingPreferences};
use ringback_core::domain::OrgId;
use ringback_core::phone::normalize_e164_digits;

use super::{
    format_timestamp, lead_display_name, parse_timestamp, LeadRepository, RepositoryError,
};
use crate::DbPool;

const LEAD_COLUMNS: &str = "SELECT
        id,
        org_id,
        name,
        email,
        phone,
        source,
        message,
        service_interest,
        patient_type,
        preferred_days,
        preferred_times,
        notes,
        deposit_status,
        priority_level,
        created_at
     FROM leads";

#[derive(Clone)]
pub struct SqlLeadRepository {
    pool: DbPool,
}

impl SqlLeadRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn find_by_phone(&self, org_id: &OrgId, phone: &str) -> Result<Option<Lead>, RepositoryError> {
        let row = sqlx::query(&format!("{LEAD_COLUMNS} WHERE org_id = ? AND phone = ?"))
            .bind(org_id.as_str())
            .bind(phone)
            .fetch_optional(&self.pool)
            .await?;
        row.map(lead_from_row).transpose()
    }
}

#[async_trait]
impl LeadRepository for SqlLeadRepository {
    async fn get_or_create_by_phone(
        &self,
        org_id: &OrgId,
        phone: &str,
        source: &str,
        default_name: &str,
    ) -> Result<Lead, RepositoryError> {
        if org_id.as_str().trim().is_empty() {
            return Err(RepositoryError::Validation("lead org_id is required".to_string()));
        }
        let phone = normalize_e164_digits(phone);
        if phone.is_empty() {
            return Err(RepositoryError::Validation("lead phone is required".to_string()));
        }
        let name = lead_display_name(default_name, &phone);

        // The unique (org_id, phone) index makes concurrent creators converge
        // on a single row: losers hit the conflict and read the winner.
        let now = format_timestamp(Utc::now());
        sqlx::query(
            "INSERT INTO leads (id, org_id, name, phone, source, deposit_status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, 'none', ?, ?)
             ON CONFLICT(org_id, phone) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(org_id.as_str())
        .bind(&name)
        .bind(&phone)
        .bind(source)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.find_by_phone(org_id, &phone).await?.ok_or_else(|| {
            RepositoryError::Decode(format!("lead for {phone} vanished after insert"))
        })
    }

    async fn find_by_id(&self, org_id: &OrgId, id: &LeadId) -> Result<Option<Lead>, RepositoryError> {
        let row = sqlx::query(&format!("{LEAD_COLUMNS} WHERE org_id = ? AND id = ?"))
            .bind(org_id.as_str())
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(lead_from_row).transpose()
    }

    async fn update_scheduling_preferences(
        &self,
        id: &LeadId,
        preferences: SchedulingPreferences,
    ) -> Result<bool, RepositoryError> {
        // Absent fields keep their stored value.
        let result = sqlx::query(
            "UPDATE leads SET
                service_interest = COALESCE(?, service_interest),
                patient_type = COALESCE(?, patient_type),
                preferred_days = COALESCE(?, preferred_days),
                preferred_times = COALESCE(?, preferred_times),
                notes = COALESCE(?, notes),
                updated_at = ?
             WHERE id = ?",
        )
        .bind(preferences.service_interest)
        .bind(preferences.patient_type)
        .bind(preferences.preferred_days)
        .bind(preferences.preferred_times)
        .bind(preferences.notes)
        .bind(format_timestamp(Utc::now()))
        .bind(&id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_deposit_status(
        &self,
        id: &LeadId,
        status: DepositStatus,
        priority_level: Option<String>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE leads SET
                deposit_status = ?,
                priority_level = COALESCE(?, priority_level),
                updated_at = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(priority_level)
        .bind(format_timestamp(Utc::now()))
        .bind(&id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn lead_from_row(row: SqliteRow) -> Result<Lead, RepositoryError> {
    let deposit_raw = row.try_get::<String, _>("deposit_status")?;
    let deposit_status = DepositStatus::parse(&deposit_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown deposit status `{deposit_raw}`")))?;

    Ok(Lead {
        id: LeadId(row.try_get("id")?),
        org_id: OrgId(row.try_get("org_id")?),
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        source: row.try_get("source")?,
        message: row.try_get("message")?,
        preferences: SchedulingPreferences {
            service_interest: row.try_get("service_interest")?,
            patient_type: row.try_get("patient_type")?,
            preferred_days: row.try_get("preferred_days")?,
            preferred_times: row.try_get("preferred_times")?,
            notes: row.try_get("notes")?,
        },
        deposit_status,
        priority_level: row.try_get("priority_level")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}
