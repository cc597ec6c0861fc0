//! Contacts, leads and the deal pipeline.

pub mod scoring;

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{Deal, DealStage, Lead};
use scoring::LeadSignals;

/// Recompute and store a lead's score
pub async fn rescore_lead(pool: &PgPool, user_id: Uuid, lead_id: Uuid) -> Result<Lead> {
    let signals = sqlx::query_as::<_, LeadSignals>(
        r#"
        SELECT l.source, l.status, l.estimated_value_cents,
               c.email, c.phone, c.job_title, c.company_id,
               (SELECT COUNT(*) FROM activities a
                WHERE l.contact_id IS NOT NULL AND a.contact_id = l.contact_id) AS activity_count
        FROM leads l
        LEFT JOIN contacts c ON c.id = l.contact_id
        WHERE l.id = $1 AND l.user_id = $2
        "#,
    )
    .bind(lead_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or(AppError::NotFound("Lead"))?;

    let score = scoring::score(&signals);

    let lead = sqlx::query_as::<_, Lead>(
        "UPDATE leads SET score = $1, updated_at = NOW() WHERE id = $2 RETURNING *",
    )
    .bind(score)
    .bind(lead_id)
    .fetch_one(pool)
    .await?;

    tracing::debug!("Lead {} scored {}", lead_id, score);
    Ok(lead)
}

/// Move a deal to `stage` and record the transition
///
/// Probability follows the stage default and `closed_at` is set when the
/// deal closes (cleared when it is reopened). Both writes share one
/// transaction.
pub async fn change_deal_stage(
    pool: &PgPool,
    user_id: Uuid,
    deal_id: Uuid,
    stage: DealStage,
) -> Result<Deal> {
    let mut tx = pool.begin().await?;

    let current: String = sqlx::query_scalar(
        "SELECT stage FROM deals WHERE id = $1 AND user_id = $2 FOR UPDATE",
    )
    .bind(deal_id)
    .bind(user_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(AppError::NotFound("Deal"))?;

    let deal = sqlx::query_as::<_, Deal>(
        r#"
        UPDATE deals
        SET stage = $1,
            probability = $2,
            closed_at = CASE WHEN $3::BOOLEAN THEN COALESCE(closed_at, NOW()) ELSE NULL END,
            updated_at = NOW()
        WHERE id = $4
        RETURNING *
        "#,
    )
    .bind(stage.as_str())
    .bind(stage.default_probability())
    .bind(stage.is_closed())
    .bind(deal_id)
    .fetch_one(&mut *tx)
    .await?;

    if current != stage.as_str() {
        sqlx::query(
            r#"
            INSERT INTO deal_stage_history (id, deal_id, from_stage, to_stage)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(deal_id)
        .bind(&current)
        .bind(stage.as_str())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    tracing::info!("Deal {} moved from {} to {}", deal_id, current, stage.as_str());
    Ok(deal)
}
