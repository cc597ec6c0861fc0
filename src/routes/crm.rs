use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use super::auth::MessageResponse;
use super::calendar::escape_like;
use super::validation::{non_blank, one_of};
use crate::auth::AuthUser;
use crate::crm::{change_deal_stage, rescore_lead};
use crate::error::{AppError, Result};
use crate::models::crm::{ACTIVITY_TYPES, LEAD_STATUSES, TASK_PRIORITIES, TASK_STATUSES};
use crate::models::{
    Activity, Company, Contact, CrmTask, Deal, DealStage, DealStageChange, Lead,
};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/companies", get(list_companies).post(create_company))
        .route("/companies/:id", put(update_company).delete(delete_company))
        .route("/contacts", get(list_contacts).post(create_contact))
        .route(
            "/contacts/:id",
            get(get_contact).put(update_contact).delete(delete_contact),
        )
        .route("/leads", get(list_leads).post(create_lead))
        .route("/leads/:id", put(update_lead).delete(delete_lead))
        .route("/leads/:id/score", post(score_lead))
        .route("/deals", get(list_deals).post(create_deal))
        .route("/deals/:id", put(update_deal).delete(delete_deal))
        .route("/deals/:id/stage", put(update_deal_stage))
        .route("/deals/:id/history", get(deal_history))
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/:id", put(update_task).delete(delete_task))
        .route("/tasks/:id/complete", post(complete_task))
        .route("/activities", get(list_activities).post(create_activity))
        .route("/dashboard", get(dashboard))
}

/// Referenced rows must belong to the caller
async fn ensure_owned(
    pool: &PgPool,
    table: &'static str,
    what: &'static str,
    id: Option<Uuid>,
    user_id: Uuid,
) -> Result<()> {
    let Some(id) = id else {
        return Ok(());
    };

    let exists: bool = sqlx::query_scalar(&format!(
        "SELECT EXISTS(SELECT 1 FROM {} WHERE id = $1 AND user_id = $2)",
        table
    ))
    .bind(id)
    .bind(user_id)
    .fetch_one(pool)
    .await?;

    if exists {
        Ok(())
    } else {
        Err(AppError::NotFound(what))
    }
}

async fn delete_owned(
    pool: &PgPool,
    table: &'static str,
    what: &'static str,
    id: Uuid,
    user_id: Uuid,
) -> Result<Json<MessageResponse>> {
    let removed = sqlx::query(&format!("DELETE FROM {} WHERE id = $1 AND user_id = $2", table))
        .bind(id)
        .bind(user_id)
        .execute(pool)
        .await?
        .rows_affected();

    if removed == 0 {
        return Err(AppError::NotFound(what));
    }
    Ok(MessageResponse::ok(format!("{} deleted", what)))
}

fn required(field: &str, value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AppError::InvalidInput(format!("{} is required", field)));
    }
    Ok(value.to_string())
}

fn non_negative(field: &str, value: Option<i64>) -> Result<()> {
    if value.is_some_and(|v| v < 0) {
        return Err(AppError::InvalidInput(format!("{} must not be negative", field)));
    }
    Ok(())
}

// =============================================================================
// Companies
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CompanyRequest {
    pub name: Option<String>,
    pub industry: Option<String>,
    pub website: Option<String>,
    pub size: Option<String>,
}

pub async fn list_companies(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<Company>>> {
    let companies =
        sqlx::query_as::<_, Company>("SELECT * FROM companies WHERE user_id = $1 ORDER BY name")
            .bind(user.id)
            .fetch_all(&state.pool)
            .await?;

    Ok(Json(companies))
}

pub async fn create_company(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CompanyRequest>,
) -> Result<(StatusCode, Json<Company>)> {
    let name = required("name", payload.name.as_deref().unwrap_or_default())?;

    let company = sqlx::query_as::<_, Company>(
        r#"
        INSERT INTO companies (id, user_id, name, industry, website, size)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user.id)
    .bind(name)
    .bind(non_blank(payload.industry))
    .bind(non_blank(payload.website))
    .bind(non_blank(payload.size))
    .fetch_one(&state.pool)
    .await?;

    Ok((StatusCode::CREATED, Json(company)))
}

pub async fn update_company(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<CompanyRequest>,
) -> Result<Json<Company>> {
    let company = sqlx::query_as::<_, Company>(
        r#"
        UPDATE companies
        SET name = COALESCE($1, name),
            industry = COALESCE($2, industry),
            website = COALESCE($3, website),
            size = COALESCE($4, size),
            updated_at = NOW()
        WHERE id = $5 AND user_id = $6
        RETURNING *
        "#,
    )
    .bind(non_blank(payload.name))
    .bind(payload.industry)
    .bind(payload.website)
    .bind(payload.size)
    .bind(id)
    .bind(user.id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or(AppError::NotFound("Company"))?;

    Ok(Json(company))
}

pub async fn delete_company(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<MessageResponse>> {
    delete_owned(&state.pool, "companies", "Company", id, user.id).await
}

// =============================================================================
// Contacts
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ContactQuery {
    pub q: Option<String>,
    pub company_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ContactRequest {
    pub company_id: Option<Uuid>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub job_title: Option<String>,
    pub notes: Option<String>,
}

fn validate_contact_email(email: &Option<String>) -> Result<()> {
    match email.as_deref().map(str::trim) {
        Some(email) if !email.is_empty() && !email.contains('@') => {
            Err(AppError::InvalidInput("Invalid contact email".to_string()))
        }
        _ => Ok(()),
    }
}

pub async fn list_contacts(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ContactQuery>,
) -> Result<Json<Vec<Contact>>> {
    let pattern = non_blank(query.q).map(|q| format!("%{}%", escape_like(&q)));

    let contacts = sqlx::query_as::<_, Contact>(
        r#"
        SELECT * FROM contacts
        WHERE user_id = $1
          AND ($2::TEXT IS NULL
               OR first_name ILIKE $2 OR last_name ILIKE $2
               OR email ILIKE $2 OR job_title ILIKE $2)
          AND ($3::UUID IS NULL OR company_id = $3)
        ORDER BY first_name, last_name
        "#,
    )
    .bind(user.id)
    .bind(pattern)
    .bind(query.company_id)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(contacts))
}

pub async fn create_contact(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<ContactRequest>,
) -> Result<(StatusCode, Json<Contact>)> {
    let first_name = required("first_name", payload.first_name.as_deref().unwrap_or_default())?;
    validate_contact_email(&payload.email)?;
    ensure_owned(&state.pool, "companies", "Company", payload.company_id, user.id).await?;

    let contact = sqlx::query_as::<_, Contact>(
        r#"
        INSERT INTO contacts
            (id, user_id, company_id, first_name, last_name, email, phone, job_title, notes)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user.id)
    .bind(payload.company_id)
    .bind(first_name)
    .bind(non_blank(payload.last_name))
    .bind(non_blank(payload.email))
    .bind(non_blank(payload.phone))
    .bind(non_blank(payload.job_title))
    .bind(non_blank(payload.notes))
    .fetch_one(&state.pool)
    .await?;

    Ok((StatusCode::CREATED, Json(contact)))
}

pub async fn get_contact(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Contact>> {
    let contact =
        sqlx::query_as::<_, Contact>("SELECT * FROM contacts WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user.id)
            .fetch_optional(&state.pool)
            .await?
            .ok_or(AppError::NotFound("Contact"))?;

    Ok(Json(contact))
}

pub async fn update_contact(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<ContactRequest>,
) -> Result<Json<Contact>> {
    validate_contact_email(&payload.email)?;
    ensure_owned(&state.pool, "companies", "Company", payload.company_id, user.id).await?;

    let contact = sqlx::query_as::<_, Contact>(
        r#"
        UPDATE contacts
        SET company_id = COALESCE($1, company_id),
            first_name = COALESCE($2, first_name),
            last_name = COALESCE($3, last_name),
            email = COALESCE($4, email),
            phone = COALESCE($5, phone),
            job_title = COALESCE($6, job_title),
            notes = COALESCE($7, notes),
            updated_at = NOW()
        WHERE id = $8 AND user_id = $9
        RETURNING *
        "#,
    )
    .bind(payload.company_id)
    .bind(non_blank(payload.first_name))
    .bind(payload.last_name)
    .bind(payload.email)
    .bind(payload.phone)
    .bind(payload.job_title)
    .bind(payload.notes)
    .bind(id)
    .bind(user.id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or(AppError::NotFound("Contact"))?;

    Ok(Json(contact))
}

pub async fn delete_contact(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<MessageResponse>> {
    delete_owned(&state.pool, "contacts", "Contact", id, user.id).await
}

// =============================================================================
// Leads
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct LeadQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LeadRequest {
    pub contact_id: Option<Uuid>,
    pub source: Option<String>,
    pub status: Option<String>,
    pub estimated_value_cents: Option<i64>,
    pub notes: Option<String>,
}

pub async fn list_leads(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<LeadQuery>,
) -> Result<Json<Vec<Lead>>> {
    let status = non_blank(query.status);
    if let Some(status) = &status {
        one_of("status", status, &LEAD_STATUSES)?;
    }

    let leads = sqlx::query_as::<_, Lead>(
        r#"
        SELECT * FROM leads
        WHERE user_id = $1 AND ($2::TEXT IS NULL OR status = $2)
        ORDER BY score DESC, created_at DESC
        "#,
    )
    .bind(user.id)
    .bind(status)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(leads))
}

pub async fn create_lead(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<LeadRequest>,
) -> Result<(StatusCode, Json<Lead>)> {
    let status = non_blank(payload.status).unwrap_or_else(|| "new".to_string());
    one_of("status", &status, &LEAD_STATUSES)?;
    non_negative("estimated_value_cents", payload.estimated_value_cents)?;
    ensure_owned(&state.pool, "contacts", "Contact", payload.contact_id, user.id).await?;

    let lead_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO leads (id, user_id, contact_id, source, status, estimated_value_cents, notes)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(lead_id)
    .bind(user.id)
    .bind(payload.contact_id)
    .bind(non_blank(payload.source).unwrap_or_else(|| "other".to_string()))
    .bind(status)
    .bind(payload.estimated_value_cents)
    .bind(non_blank(payload.notes))
    .execute(&state.pool)
    .await?;

    let lead = rescore_lead(&state.pool, user.id, lead_id).await?;
    Ok((StatusCode::CREATED, Json(lead)))
}

pub async fn update_lead(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<LeadRequest>,
) -> Result<Json<Lead>> {
    let status = non_blank(payload.status);
    if let Some(status) = &status {
        one_of("status", status, &LEAD_STATUSES)?;
    }
    non_negative("estimated_value_cents", payload.estimated_value_cents)?;
    ensure_owned(&state.pool, "contacts", "Contact", payload.contact_id, user.id).await?;

    let updated = sqlx::query(
        r#"
        UPDATE leads
        SET contact_id = COALESCE($1, contact_id),
            source = COALESCE($2, source),
            status = COALESCE($3, status),
            estimated_value_cents = COALESCE($4, estimated_value_cents),
            notes = COALESCE($5, notes),
            updated_at = NOW()
        WHERE id = $6 AND user_id = $7
        "#,
    )
    .bind(payload.contact_id)
    .bind(non_blank(payload.source))
    .bind(status)
    .bind(payload.estimated_value_cents)
    .bind(payload.notes)
    .bind(id)
    .bind(user.id)
    .execute(&state.pool)
    .await?
    .rows_affected();

    if updated == 0 {
        return Err(AppError::NotFound("Lead"));
    }

    Ok(Json(rescore_lead(&state.pool, user.id, id).await?))
}

pub async fn delete_lead(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<MessageResponse>> {
    delete_owned(&state.pool, "leads", "Lead", id, user.id).await
}

pub async fn score_lead(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Lead>> {
    Ok(Json(rescore_lead(&state.pool, user.id, id).await?))
}

// =============================================================================
// Deals
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct DealRequest {
    pub title: Option<String>,
    pub contact_id: Option<Uuid>,
    pub company_id: Option<Uuid>,
    pub value_cents: Option<i64>,
    pub stage: Option<String>,
    pub probability: Option<i32>,
    pub expected_close_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct StageRequest {
    pub stage: String,
}

fn parse_stage(raw: &str) -> Result<DealStage> {
    raw.trim().parse().map_err(|_| {
        let stages: Vec<&str> = DealStage::ALL.iter().map(DealStage::as_str).collect();
        AppError::InvalidInput(format!("stage must be one of: {}", stages.join(", ")))
    })
}

fn validate_probability(probability: Option<i32>) -> Result<()> {
    if probability.is_some_and(|p| !(0..=100).contains(&p)) {
        return Err(AppError::InvalidInput(
            "probability must be between 0 and 100".to_string(),
        ));
    }
    Ok(())
}

pub async fn list_deals(State(state): State<AppState>, user: AuthUser) -> Result<Json<Vec<Deal>>> {
    let deals = sqlx::query_as::<_, Deal>(
        "SELECT * FROM deals WHERE user_id = $1 ORDER BY created_at DESC",
    )
    .bind(user.id)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(deals))
}

/// Create a deal; its first stage is recorded in the history
pub async fn create_deal(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<DealRequest>,
) -> Result<(StatusCode, Json<Deal>)> {
    let title = required("title", payload.title.as_deref().unwrap_or_default())?;
    let stage = match payload.stage.as_deref() {
        Some(raw) => parse_stage(raw)?,
        None => DealStage::Prospecting,
    };
    validate_probability(payload.probability)?;
    non_negative("value_cents", payload.value_cents)?;
    ensure_owned(&state.pool, "contacts", "Contact", payload.contact_id, user.id).await?;
    ensure_owned(&state.pool, "companies", "Company", payload.company_id, user.id).await?;

    let mut tx = state.pool.begin().await?;

    let deal = sqlx::query_as::<_, Deal>(
        r#"
        INSERT INTO deals
            (id, user_id, contact_id, company_id, title, value_cents, stage, probability,
             expected_close_date, closed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, CASE WHEN $10::BOOLEAN THEN NOW() END)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user.id)
    .bind(payload.contact_id)
    .bind(payload.company_id)
    .bind(title)
    .bind(payload.value_cents.unwrap_or(0))
    .bind(stage.as_str())
    .bind(payload.probability.unwrap_or_else(|| stage.default_probability()))
    .bind(payload.expected_close_date)
    .bind(stage.is_closed())
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO deal_stage_history (id, deal_id, from_stage, to_stage) VALUES ($1, $2, NULL, $3)",
    )
    .bind(Uuid::new_v4())
    .bind(deal.id)
    .bind(stage.as_str())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok((StatusCode::CREATED, Json(deal)))
}

/// Update deal details; stage changes go through `/deals/:id/stage`
pub async fn update_deal(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<DealRequest>,
) -> Result<Json<Deal>> {
    if payload.stage.is_some() {
        return Err(AppError::InvalidInput(
            "Use PUT /deals/:id/stage to change the stage".to_string(),
        ));
    }
    validate_probability(payload.probability)?;
    non_negative("value_cents", payload.value_cents)?;
    ensure_owned(&state.pool, "contacts", "Contact", payload.contact_id, user.id).await?;
    ensure_owned(&state.pool, "companies", "Company", payload.company_id, user.id).await?;

    let deal = sqlx::query_as::<_, Deal>(
        r#"
        UPDATE deals
        SET title = COALESCE($1, title),
            contact_id = COALESCE($2, contact_id),
            company_id = COALESCE($3, company_id),
            value_cents = COALESCE($4, value_cents),
            probability = COALESCE($5, probability),
            expected_close_date = COALESCE($6, expected_close_date),
            updated_at = NOW()
        WHERE id = $7 AND user_id = $8
        RETURNING *
        "#,
    )
    .bind(non_blank(payload.title))
    .bind(payload.contact_id)
    .bind(payload.company_id)
    .bind(payload.value_cents)
    .bind(payload.probability)
    .bind(payload.expected_close_date)
    .bind(id)
    .bind(user.id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or(AppError::NotFound("Deal"))?;

    Ok(Json(deal))
}

pub async fn update_deal_stage(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<StageRequest>,
) -> Result<Json<Deal>> {
    let stage = parse_stage(&payload.stage)?;
    Ok(Json(change_deal_stage(&state.pool, user.id, id, stage).await?))
}

pub async fn deal_history(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<DealStageChange>>> {
    ensure_owned(&state.pool, "deals", "Deal", Some(id), user.id).await?;

    let history = sqlx::query_as::<_, DealStageChange>(
        "SELECT * FROM deal_stage_history WHERE deal_id = $1 ORDER BY changed_at, id",
    )
    .bind(id)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(history))
}

pub async fn delete_deal(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<MessageResponse>> {
    delete_owned(&state.pool, "deals", "Deal", id, user.id).await
}

// =============================================================================
// Tasks
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct TaskQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TaskRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub contact_id: Option<Uuid>,
    pub deal_id: Option<Uuid>,
    pub due_date: Option<DateTime<Utc>>,
    pub priority: Option<String>,
    pub status: Option<String>,
}

pub async fn list_tasks(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<TaskQuery>,
) -> Result<Json<Vec<CrmTask>>> {
    let status = non_blank(query.status);
    if let Some(status) = &status {
        one_of("status", status, &TASK_STATUSES)?;
    }

    let tasks = sqlx::query_as::<_, CrmTask>(
        r#"
        SELECT * FROM crm_tasks
        WHERE user_id = $1 AND ($2::TEXT IS NULL OR status = $2)
        ORDER BY due_date NULLS LAST, created_at
        "#,
    )
    .bind(user.id)
    .bind(status)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(tasks))
}

pub async fn create_task(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<TaskRequest>,
) -> Result<(StatusCode, Json<CrmTask>)> {
    let title = required("title", payload.title.as_deref().unwrap_or_default())?;
    let priority = non_blank(payload.priority).unwrap_or_else(|| "medium".to_string());
    one_of("priority", &priority, &TASK_PRIORITIES)?;
    ensure_owned(&state.pool, "contacts", "Contact", payload.contact_id, user.id).await?;
    ensure_owned(&state.pool, "deals", "Deal", payload.deal_id, user.id).await?;

    let task = sqlx::query_as::<_, CrmTask>(
        r#"
        INSERT INTO crm_tasks (id, user_id, contact_id, deal_id, title, description, due_date, priority)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user.id)
    .bind(payload.contact_id)
    .bind(payload.deal_id)
    .bind(title)
    .bind(non_blank(payload.description))
    .bind(payload.due_date)
    .bind(priority)
    .fetch_one(&state.pool)
    .await?;

    Ok((StatusCode::CREATED, Json(task)))
}

/// Partial update; moving to `completed` stamps `completed_at`
pub async fn update_task(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<TaskRequest>,
) -> Result<Json<CrmTask>> {
    let priority = non_blank(payload.priority);
    if let Some(priority) = &priority {
        one_of("priority", priority, &TASK_PRIORITIES)?;
    }
    let status = non_blank(payload.status);
    if let Some(status) = &status {
        one_of("status", status, &TASK_STATUSES)?;
    }
    ensure_owned(&state.pool, "contacts", "Contact", payload.contact_id, user.id).await?;
    ensure_owned(&state.pool, "deals", "Deal", payload.deal_id, user.id).await?;

    let task = sqlx::query_as::<_, CrmTask>(
        r#"
        UPDATE crm_tasks
        SET title = COALESCE($1, title),
            description = COALESCE($2, description),
            contact_id = COALESCE($3, contact_id),
            deal_id = COALESCE($4, deal_id),
            due_date = COALESCE($5, due_date),
            priority = COALESCE($6, priority),
            status = COALESCE($7, status),
            completed_at = CASE
                WHEN COALESCE($7, status) = 'completed' THEN COALESCE(completed_at, NOW())
                ELSE NULL
            END,
            updated_at = NOW()
        WHERE id = $8 AND user_id = $9
        RETURNING *
        "#,
    )
    .bind(non_blank(payload.title))
    .bind(payload.description)
    .bind(payload.contact_id)
    .bind(payload.deal_id)
    .bind(payload.due_date)
    .bind(priority)
    .bind(status)
    .bind(id)
    .bind(user.id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or(AppError::NotFound("Task"))?;

    Ok(Json(task))
}

pub async fn complete_task(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<CrmTask>> {
    let task = sqlx::query_as::<_, CrmTask>(
        r#"
        UPDATE crm_tasks
        SET status = 'completed',
            completed_at = COALESCE(completed_at, NOW()),
            updated_at = NOW()
        WHERE id = $1 AND user_id = $2
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(user.id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or(AppError::NotFound("Task"))?;

    Ok(Json(task))
}

pub async fn delete_task(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<MessageResponse>> {
    delete_owned(&state.pool, "crm_tasks", "Task", id, user.id).await
}

// =============================================================================
// Activities
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ActivityQuery {
    pub contact_id: Option<Uuid>,
    pub deal_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ActivityRequest {
    pub activity_type: String,
    pub subject: String,
    pub description: Option<String>,
    pub contact_id: Option<Uuid>,
    pub deal_id: Option<Uuid>,
    pub occurred_at: Option<DateTime<Utc>>,
}

pub async fn list_activities(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ActivityQuery>,
) -> Result<Json<Vec<Activity>>> {
    let activities = sqlx::query_as::<_, Activity>(
        r#"
        SELECT * FROM activities
        WHERE user_id = $1
          AND ($2::UUID IS NULL OR contact_id = $2)
          AND ($3::UUID IS NULL OR deal_id = $3)
        ORDER BY occurred_at DESC
        LIMIT 200
        "#,
    )
    .bind(user.id)
    .bind(query.contact_id)
    .bind(query.deal_id)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(activities))
}

pub async fn create_activity(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<ActivityRequest>,
) -> Result<(StatusCode, Json<Activity>)> {
    let activity_type = payload.activity_type.trim().to_ascii_lowercase();
    one_of("activity_type", &activity_type, &ACTIVITY_TYPES)?;
    let subject = required("subject", &payload.subject)?;
    ensure_owned(&state.pool, "contacts", "Contact", payload.contact_id, user.id).await?;
    ensure_owned(&state.pool, "deals", "Deal", payload.deal_id, user.id).await?;

    let activity = sqlx::query_as::<_, Activity>(
        r#"
        INSERT INTO activities
            (id, user_id, contact_id, deal_id, activity_type, subject, description, occurred_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, COALESCE($8, NOW()))
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user.id)
    .bind(payload.contact_id)
    .bind(payload.deal_id)
    .bind(activity_type)
    .bind(subject)
    .bind(non_blank(payload.description))
    .bind(payload.occurred_at)
    .fetch_one(&state.pool)
    .await?;

    Ok((StatusCode::CREATED, Json(activity)))
}

// =============================================================================
// Dashboard
// =============================================================================

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct StageSummary {
    pub stage: String,
    pub count: i64,
    pub value_cents: i64,
}

#[derive(Debug, Serialize)]
pub struct Dashboard {
    pub contacts: i64,
    pub companies: i64,
    pub open_leads: i64,
    pub open_deals: i64,
    pub open_pipeline_cents: i64,
    pub weighted_pipeline_cents: i64,
    pub won_value_cents: i64,
    pub by_stage: Vec<StageSummary>,
    pub open_tasks: i64,
    pub overdue_tasks: i64,
}

pub async fn dashboard(State(state): State<AppState>, user: AuthUser) -> Result<Json<Dashboard>> {
    let (contacts, companies, open_leads): (i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
            (SELECT COUNT(*) FROM contacts WHERE user_id = $1),
            (SELECT COUNT(*) FROM companies WHERE user_id = $1),
            (SELECT COUNT(*) FROM leads
             WHERE user_id = $1 AND status NOT IN ('converted', 'unqualified'))
        "#,
    )
    .bind(user.id)
    .fetch_one(&state.pool)
    .await?;

    let (open_deals, open_pipeline_cents, weighted_pipeline_cents, won_value_cents): (
        i64,
        i64,
        i64,
        i64,
    ) = sqlx::query_as(
        r#"
        SELECT
            COUNT(*) FILTER (WHERE closed_at IS NULL),
            COALESCE(SUM(value_cents) FILTER (WHERE closed_at IS NULL), 0)::BIGINT,
            COALESCE(SUM(value_cents * probability / 100) FILTER (WHERE closed_at IS NULL), 0)::BIGINT,
            COALESCE(SUM(value_cents) FILTER (WHERE stage = 'closed_won'), 0)::BIGINT
        FROM deals
        WHERE user_id = $1
        "#,
    )
    .bind(user.id)
    .fetch_one(&state.pool)
    .await?;

    let by_stage = sqlx::query_as::<_, StageSummary>(
        r#"
        SELECT stage, COUNT(*) AS count, COALESCE(SUM(value_cents), 0)::BIGINT AS value_cents
        FROM deals
        WHERE user_id = $1
        GROUP BY stage
        ORDER BY stage
        "#,
    )
    .bind(user.id)
    .fetch_all(&state.pool)
    .await?;

    let (open_tasks, overdue_tasks): (i64, i64) = sqlx::query_as(
        r#"
        SELECT
            COUNT(*) FILTER (WHERE status IN ('pending', 'in_progress')),
            COUNT(*) FILTER (WHERE status IN ('pending', 'in_progress') AND due_date < NOW())
        FROM crm_tasks
        WHERE user_id = $1
        "#,
    )
    .bind(user.id)
    .fetch_one(&state.pool)
    .await?;

    Ok(Json(Dashboard {
        contacts,
        companies,
        open_leads,
        open_deals,
        open_pipeline_cents,
        weighted_pipeline_cents,
        won_value_cents,
        by_stage,
        open_tasks,
        overdue_tasks,
    }))
}
