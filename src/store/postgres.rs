//! Postgres-backed claim store.
//!
//! Acquiring a claim is one conditional `UPDATE … RETURNING`: the flag test,
//! the stage guard and the flag write happen in a single statement, so
//! concurrent acquirers serialize on the row lock and all but one see the
//! flag already set. Commits run in a transaction that locks the claimed
//! row, checks the token, applies the mutation and clears the flag.

use std::fmt::Display;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use super::{Candidate, Claim, ClaimStore, EligibleFilter, FailureRecord, InsertReport, Mutation};
use crate::error::{FailureKind, StageFailure, StoreError};
use crate::state_machine::{
    Application, ApplicationForm, ApplicationStatus, ClaimHold, Classification, EntityKind,
    FormField, FormState, Job, JobDraft, JobState, Lifecycle, Review, Stage, Subject, UnknownState,
};

/// Column list for `jobs` queries.
const JOB_COLUMNS: &str = "\
    id, external_id, title, company, location, min_salary, max_salary, \
    employment_type, date_posted, description, listing_url, direct_url, \
    state, classification, rationale, manual, \
    review_claim_token, review_claim_at, \
    create_app_claim_token, create_app_claim_at, \
    expiration_check_claim_token, expiration_check_claim_at, \
    created_at, updated_at";

/// Column list for `applications` queries.
const APPLICATION_COLUMNS: &str = "\
    id, job_id, form_id, url, referred, status, submitted_at, \
    submission_claim_token, submission_claim_at, created_at, updated_at";

/// Column list for `application_forms` queries.
const FORM_COLUMNS: &str = "\
    id, application_id, state, fields, prepare_claim_token, prepare_claim_at, \
    created_at, updated_at";

fn table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Job => "jobs",
        EntityKind::ApplicationForm => "application_forms",
        EntityKind::Application => "applications",
    }
}

fn state_column(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Application => "status",
        _ => "state",
    }
}

/// The stage guard as a predicate over the row of the stage's entity.
fn guard(stage: Stage) -> &'static str {
    match stage {
        Stage::Review => "state = 'pending'",
        Stage::CreateApp => "state IN ('reviewed', 'approved')",
        Stage::ExpirationCheck => "state NOT IN ('expired', 'discarded')",
        Stage::Prepare => "state = 'scraped'",
        Stage::Submit => {
            "status = 'ready' AND EXISTS (\
                SELECT 1 FROM application_forms f \
                WHERE f.id = applications.form_id AND f.state = 'approved')"
        }
    }
}

/// Excludes jobs whose application already carries a form past CREATED.
const WITHOUT_FORM: &str = " AND NOT EXISTS (\
    SELECT 1 FROM applications a JOIN application_forms f ON f.id = a.form_id \
    WHERE a.job_id = jobs.id AND f.state <> 'created')";

/// The url a sweep candidate is routed by.
fn candidate_url(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Job => "COALESCE(direct_url, listing_url)",
        EntityKind::Application => "url",
        EntityKind::ApplicationForm => {
            "(SELECT a.url FROM applications a WHERE a.id = application_forms.application_id)"
        }
    }
}

fn hold(token: Option<Uuid>, at: Option<DateTime<Utc>>) -> Option<ClaimHold> {
    token
        .zip(at)
        .map(|(token, claimed_at)| ClaimHold { token, claimed_at })
}

fn corrupt(e: impl Display) -> StoreError {
    StoreError::Corrupt(e.to_string())
}

fn ensure_advance<S: Lifecycle>(id: Uuid, from: S, to: S) -> Result<(), StoreError> {
    if from.can_advance_to(to) {
        Ok(())
    } else {
        Err(StoreError::IllegalTransition {
            id,
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    external_id: String,
    title: String,
    company: String,
    location: Option<String>,
    min_salary: Option<f64>,
    max_salary: Option<f64>,
    employment_type: Option<String>,
    date_posted: Option<String>,
    description: Option<String>,
    listing_url: Option<String>,
    direct_url: Option<String>,
    state: String,
    classification: Option<String>,
    rationale: Option<String>,
    manual: bool,
    review_claim_token: Option<Uuid>,
    review_claim_at: Option<DateTime<Utc>>,
    create_app_claim_token: Option<Uuid>,
    create_app_claim_at: Option<DateTime<Utc>>,
    expiration_check_claim_token: Option<Uuid>,
    expiration_check_claim_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let review = match row.classification {
            Some(raw) => Some(Review {
                classification: Classification::parse(&raw)
                    .ok_or_else(|| corrupt(format!("unknown classification: {raw}")))?,
                rationale: row.rationale.unwrap_or_default(),
            }),
            None => None,
        };
        Ok(Job {
            id: row.id,
            external_id: row.external_id,
            title: row.title,
            company: row.company,
            location: row.location,
            min_salary: row.min_salary,
            max_salary: row.max_salary,
            employment_type: row.employment_type,
            date_posted: row.date_posted,
            description: row.description,
            listing_url: row.listing_url,
            direct_url: row.direct_url,
            state: row.state.parse().map_err(corrupt)?,
            review,
            manual: row.manual,
            review_claim: hold(row.review_claim_token, row.review_claim_at),
            create_app_claim: hold(row.create_app_claim_token, row.create_app_claim_at),
            expiration_check_claim: hold(
                row.expiration_check_claim_token,
                row.expiration_check_claim_at,
            ),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ApplicationRow {
    id: Uuid,
    job_id: Uuid,
    form_id: Option<Uuid>,
    url: String,
    referred: bool,
    status: String,
    submitted_at: Option<DateTime<Utc>>,
    submission_claim_token: Option<Uuid>,
    submission_claim_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ApplicationRow> for Application {
    type Error = StoreError;

    fn try_from(row: ApplicationRow) -> Result<Self, Self::Error> {
        Ok(Application {
            id: row.id,
            job_id: row.job_id,
            form_id: row.form_id,
            url: row.url,
            referred: row.referred,
            status: row.status.parse().map_err(corrupt)?,
            submitted_at: row.submitted_at,
            submission_claim: hold(row.submission_claim_token, row.submission_claim_at),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct FormRow {
    id: Uuid,
    application_id: Uuid,
    state: String,
    fields: Json<Vec<FormField>>,
    prepare_claim_token: Option<Uuid>,
    prepare_claim_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<FormRow> for ApplicationForm {
    type Error = StoreError;

    fn try_from(row: FormRow) -> Result<Self, Self::Error> {
        Ok(ApplicationForm {
            id: row.id,
            application_id: row.application_id,
            state: row.state.parse().map_err(corrupt)?,
            fields: row.fields.0,
            prepare_claim: hold(row.prepare_claim_token, row.prepare_claim_at),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct FailureRow {
    id: Uuid,
    entity_id: Uuid,
    stage: String,
    kind: String,
    message: String,
    failed_at: DateTime<Utc>,
}

impl TryFrom<FailureRow> for FailureRecord {
    type Error = StoreError;

    fn try_from(row: FailureRow) -> Result<Self, Self::Error> {
        let kind = match row.kind.as_str() {
            "transient" => FailureKind::Transient,
            "permanent" => FailureKind::Permanent,
            other => return Err(corrupt(format!("unknown failure kind: {other}"))),
        };
        Ok(FailureRecord {
            id: row.id,
            entity_id: row.entity_id,
            stage: Stage::from_str(&row.stage).map_err(corrupt)?,
            kind,
            message: row.message,
            failed_at: row.failed_at,
        })
    }
}

/// Claim store on a shared Postgres pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// Lock the claimed row and check the claim still holds it.
async fn fence(conn: &mut PgConnection, claim: &Claim) -> Result<(), StoreError> {
    let kind = claim.stage.entity();
    let query = format!(
        "SELECT {flag}_token FROM {table} WHERE id = $1 FOR UPDATE",
        flag = claim.stage.flag(),
        table = table(kind),
    );
    let token: Option<Option<Uuid>> = sqlx::query_scalar(&query)
        .bind(claim.entity_id)
        .fetch_optional(&mut *conn)
        .await?;
    match token {
        None => Err(StoreError::NotFound {
            kind,
            id: claim.entity_id,
        }),
        Some(Some(token)) if token == claim.token => Ok(()),
        Some(_) => Err(StoreError::ClaimLost {
            stage: claim.stage,
            id: claim.entity_id,
        }),
    }
}

async fn clear_flag(conn: &mut PgConnection, stage: Stage, id: Uuid) -> Result<(), StoreError> {
    let query = format!(
        "UPDATE {table} SET {flag} = FALSE, {flag}_token = NULL, {flag}_at = NULL WHERE id = $1",
        flag = stage.flag(),
        table = table(stage.entity()),
    );
    sqlx::query(&query).bind(id).execute(&mut *conn).await?;
    Ok(())
}

async fn locked_state<S>(conn: &mut PgConnection, kind: EntityKind, id: Uuid) -> Result<S, StoreError>
where
    S: FromStr<Err = UnknownState>,
{
    let query = format!(
        "SELECT {column} FROM {table} WHERE id = $1 FOR UPDATE",
        column = state_column(kind),
        table = table(kind),
    );
    let raw: Option<String> = sqlx::query_scalar(&query)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    raw.ok_or(StoreError::NotFound { kind, id })?
        .parse()
        .map_err(corrupt)
}

async fn apply(conn: &mut PgConnection, id: Uuid, mutation: Mutation) -> Result<(), StoreError> {
    match mutation {
        Mutation::Unchanged => {}
        Mutation::Reviewed(review) => {
            let state: JobState = locked_state(conn, EntityKind::Job, id).await?;
            ensure_advance(id, state, JobState::Reviewed)?;
            sqlx::query(
                "UPDATE jobs SET state = $2, classification = $3, rationale = $4, updated_at = NOW() \
                 WHERE id = $1",
            )
            .bind(id)
            .bind(JobState::Reviewed.as_str())
            .bind(review.classification.as_str())
            .bind(&review.rationale)
            .execute(&mut *conn)
            .await?;
        }
        Mutation::Expired => {
            let state: JobState = locked_state(conn, EntityKind::Job, id).await?;
            ensure_advance(id, state, JobState::Expired)?;
            sqlx::query("UPDATE jobs SET state = $2, updated_at = NOW() WHERE id = $1")
                .bind(id)
                .bind(JobState::Expired.as_str())
                .execute(&mut *conn)
                .await?;
        }
        Mutation::ApplicationCreated { url, fields } => {
            attach_form(conn, id, &url, fields).await?;
        }
        Mutation::Prepared(fields) => {
            let state: FormState = locked_state(conn, EntityKind::ApplicationForm, id).await?;
            ensure_advance(id, state, FormState::Prepared)?;
            sqlx::query(
                "UPDATE application_forms SET state = $2, fields = $3, updated_at = NOW() WHERE id = $1",
            )
            .bind(id)
            .bind(FormState::Prepared.as_str())
            .bind(Json(fields))
            .execute(&mut *conn)
            .await?;
        }
        Mutation::Submitted { at } => {
            let status: ApplicationStatus =
                locked_state(conn, EntityKind::Application, id).await?;
            ensure_advance(id, status, ApplicationStatus::Submitted)?;
            sqlx::query(
                "UPDATE applications SET status = $2, submitted_at = $3, updated_at = NOW() WHERE id = $1",
            )
            .bind(id)
            .bind(ApplicationStatus::Submitted.as_str())
            .bind(at)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

/// Upsert the job's application and give it a scraped form. A form that has
/// moved past `CREATED` is never overwritten.
async fn attach_form(
    conn: &mut PgConnection,
    job_id: Uuid,
    url: &str,
    fields: Vec<FormField>,
) -> Result<(), StoreError> {
    let existing: Option<(Uuid, Option<Uuid>)> =
        sqlx::query_as("SELECT id, form_id FROM applications WHERE job_id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut *conn)
            .await?;

    let mut reusable_form = None;
    if let Some(form_id) = existing.and_then(|(_, form_id)| form_id) {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT state FROM application_forms WHERE id = $1 FOR UPDATE")
                .bind(form_id)
                .fetch_optional(&mut *conn)
                .await?;
        if let Some(raw) = raw {
            let state: FormState = raw.parse().map_err(corrupt)?;
            if state != FormState::Created {
                return Err(StoreError::IllegalTransition {
                    id: form_id,
                    from: state.to_string(),
                    to: FormState::Scraped.to_string(),
                });
            }
            reusable_form = Some(form_id);
        }
    }

    let app_id: Uuid = sqlx::query_scalar(
        "INSERT INTO applications (id, job_id, url, status) VALUES ($1, $2, $3, $4) \
         ON CONFLICT (job_id) DO UPDATE SET url = EXCLUDED.url, updated_at = NOW() \
         RETURNING id",
    )
    .bind(Uuid::new_v4())
    .bind(job_id)
    .bind(url)
    .bind(ApplicationStatus::Started.as_str())
    .fetch_one(&mut *conn)
    .await?;

    match reusable_form {
        Some(form_id) => {
            sqlx::query(
                "UPDATE application_forms SET state = $2, fields = $3, updated_at = NOW() WHERE id = $1",
            )
            .bind(form_id)
            .bind(FormState::Scraped.as_str())
            .bind(Json(fields))
            .execute(&mut *conn)
            .await?;
        }
        None => {
            let form_id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO application_forms (id, application_id, state, fields) VALUES ($1, $2, $3, $4)",
            )
            .bind(form_id)
            .bind(app_id)
            .bind(FormState::Scraped.as_str())
            .bind(Json(fields))
            .execute(&mut *conn)
            .await?;
            sqlx::query("UPDATE applications SET form_id = $2 WHERE id = $1")
                .bind(app_id)
                .bind(form_id)
                .execute(&mut *conn)
                .await?;
        }
    }
    Ok(())
}

/// Lock a job for a manual transition. Returns its state and whether any
/// claim is held.
async fn lock_job(conn: &mut PgConnection, id: Uuid) -> Result<(JobState, bool), StoreError> {
    let row: Option<(String, bool)> = sqlx::query_as(
        "SELECT state, (review_claim OR create_app_claim OR expiration_check_claim) \
         FROM jobs WHERE id = $1 FOR UPDATE",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    let (state, busy) = row.ok_or(StoreError::NotFound {
        kind: EntityKind::Job,
        id,
    })?;
    Ok((state.parse().map_err(corrupt)?, busy))
}

#[async_trait]
impl ClaimStore for PgStore {
    async fn try_claim(&self, stage: Stage, entity_id: Uuid) -> Result<Option<Claim>, StoreError> {
        let query = format!(
            "UPDATE {table} SET {flag} = TRUE, {flag}_token = $2, {flag}_at = NOW() \
             WHERE id = $1 AND {flag} = FALSE AND {guard} \
             RETURNING {flag}_at",
            flag = stage.flag(),
            table = table(stage.entity()),
            guard = guard(stage),
        );
        let token = Uuid::new_v4();
        let acquired: Option<DateTime<Utc>> = sqlx::query_scalar(&query)
            .bind(entity_id)
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        Ok(acquired.map(|acquired_at| Claim {
            stage,
            entity_id,
            token,
            acquired_at,
        }))
    }

    async fn commit(&self, claim: &Claim, mutation: Mutation) -> Result<(), StoreError> {
        if !mutation.fits(claim.stage) {
            return Err(StoreError::MutationMismatch { stage: claim.stage });
        }
        let mut tx = self.pool.begin().await?;
        fence(&mut tx, claim).await?;
        apply(&mut tx, claim.entity_id, mutation).await?;
        clear_flag(&mut tx, claim.stage, claim.entity_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn release(&self, claim: &Claim) -> Result<(), StoreError> {
        let query = format!(
            "UPDATE {table} SET {flag} = FALSE, {flag}_token = NULL, {flag}_at = NULL \
             WHERE id = $1 AND {flag}_token = $2",
            flag = claim.stage.flag(),
            table = table(claim.stage.entity()),
        );
        let result = sqlx::query(&query)
            .bind(claim.entity_id)
            .bind(claim.token)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ClaimLost {
                stage: claim.stage,
                id: claim.entity_id,
            });
        }
        Ok(())
    }

    async fn subject(&self, stage: Stage, entity_id: Uuid) -> Result<Subject, StoreError> {
        let kind = stage.entity();
        let not_found = || StoreError::NotFound {
            kind,
            id: entity_id,
        };
        let (job_id, application) = match kind {
            EntityKind::Job => (entity_id, self.application_for_job(entity_id).await?),
            EntityKind::ApplicationForm => {
                let form = self.form(entity_id).await?.ok_or_else(not_found)?;
                let app = self
                    .application(form.application_id)
                    .await?
                    .ok_or_else(|| corrupt(format!("form {entity_id} has no application")))?;
                (app.job_id, Some(app))
            }
            EntityKind::Application => {
                let app = self.application(entity_id).await?.ok_or_else(not_found)?;
                (app.job_id, Some(app))
            }
        };
        let job = match self.job(job_id).await? {
            Some(job) => job,
            None if kind == EntityKind::Job => return Err(not_found()),
            None => return Err(corrupt(format!("{kind} {entity_id} has no job"))),
        };
        let form = match application.as_ref().and_then(|a| a.form_id) {
            Some(form_id) => self.form(form_id).await?,
            None => None,
        };
        Ok(Subject {
            job,
            application,
            form,
        })
    }

    async fn eligible(&self, stage: Stage, filter: &EligibleFilter) -> Result<Vec<Candidate>, StoreError> {
        let kind = stage.entity();
        let mut query = format!(
            "SELECT id, {url} AS url FROM {table} \
             WHERE {flag} = FALSE AND {guard} \
             AND ($1::timestamptz IS NULL OR created_at < $1)",
            url = candidate_url(kind),
            table = table(kind),
            flag = stage.flag(),
            guard = guard(stage),
        );
        if kind == EntityKind::Job {
            if filter.require_listing_url {
                query.push_str(" AND listing_url IS NOT NULL");
            }
            if filter.approved_only {
                query.push_str(" AND state = 'approved'");
            }
            if filter.without_form {
                query.push_str(WITHOUT_FORM);
            }
        }
        query.push_str(" ORDER BY created_at ASC LIMIT $2");

        let limit = filter.limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX));
        let rows: Vec<(Uuid, Option<String>)> = sqlx::query_as(&query)
            .bind(filter.created_before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(id, url)| Candidate { id, url })
            .collect())
    }

    async fn release_stale(&self, stage: Stage, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let query = format!(
            "UPDATE {table} SET {flag} = FALSE, {flag}_token = NULL, {flag}_at = NULL \
             WHERE {flag} = TRUE AND {flag}_at < $1",
            flag = stage.flag(),
            table = table(stage.entity()),
        );
        let result = sqlx::query(&query)
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_jobs(&self, drafts: Vec<JobDraft>) -> Result<InsertReport, StoreError> {
        let mut report = InsertReport::default();
        for draft in drafts {
            let inserted: Option<Uuid> = sqlx::query_scalar(
                "INSERT INTO jobs (id, external_id, title, company, location, min_salary, max_salary, \
                 employment_type, date_posted, description, listing_url, direct_url, state) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
                 ON CONFLICT (external_id) DO NOTHING \
                 RETURNING id",
            )
            .bind(Uuid::new_v4())
            .bind(&draft.external_id)
            .bind(&draft.title)
            .bind(&draft.company)
            .bind(&draft.location)
            .bind(draft.min_salary)
            .bind(draft.max_salary)
            .bind(&draft.employment_type)
            .bind(&draft.date_posted)
            .bind(&draft.description)
            .bind(&draft.listing_url)
            .bind(&draft.direct_url)
            .bind(JobState::Pending.as_str())
            .fetch_optional(&self.pool)
            .await?;
            match inserted {
                Some(id) => report.inserted.push(id),
                None => report.duplicates += 1,
            }
        }
        Ok(report)
    }

    async fn job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn application(&self, id: Uuid) -> Result<Option<Application>, StoreError> {
        let query = format!("SELECT {APPLICATION_COLUMNS} FROM applications WHERE id = $1");
        sqlx::query_as::<_, ApplicationRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Application::try_from)
            .transpose()
    }

    async fn application_for_job(&self, job_id: Uuid) -> Result<Option<Application>, StoreError> {
        let query = format!("SELECT {APPLICATION_COLUMNS} FROM applications WHERE job_id = $1");
        sqlx::query_as::<_, ApplicationRow>(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Application::try_from)
            .transpose()
    }

    async fn form(&self, id: Uuid) -> Result<Option<ApplicationForm>, StoreError> {
        let query = format!("SELECT {FORM_COLUMNS} FROM application_forms WHERE id = $1");
        sqlx::query_as::<_, FormRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(ApplicationForm::try_from)
            .transpose()
    }

    async fn form_for_application(&self, application_id: Uuid) -> Result<Option<ApplicationForm>, StoreError> {
        let query = format!(
            "SELECT {FORM_COLUMNS} FROM application_forms \
             WHERE id = (SELECT form_id FROM applications WHERE id = $1)"
        );
        sqlx::query_as::<_, FormRow>(&query)
            .bind(application_id)
            .fetch_optional(&self.pool)
            .await?
            .map(ApplicationForm::try_from)
            .transpose()
    }

    async fn failures(&self, limit: usize) -> Result<Vec<FailureRecord>, StoreError> {
        let rows: Vec<FailureRow> = sqlx::query_as(
            "SELECT id, entity_id, stage, kind, message, failed_at FROM stage_failures \
             ORDER BY failed_at DESC LIMIT $1",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(FailureRecord::try_from).collect()
    }

    async fn approve_job(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let (state, busy) = lock_job(&mut tx, id).await?;
        if busy {
            return Err(StoreError::Busy {
                kind: EntityKind::Job,
                id,
            });
        }
        if state != JobState::Reviewed {
            return Ok(false);
        }
        sqlx::query("UPDATE jobs SET state = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(JobState::Approved.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn discard_job(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let (state, busy) = lock_job(&mut tx, id).await?;
        if busy {
            return Err(StoreError::Busy {
                kind: EntityKind::Job,
                id,
            });
        }
        if !state.can_advance_to(JobState::Discarded) {
            return Ok(false);
        }
        sqlx::query("UPDATE jobs SET state = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(JobState::Discarded.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn approve_form(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let form: Option<(String, bool, Uuid)> = sqlx::query_as(
            "SELECT state, prepare_claim, application_id FROM application_forms \
             WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let (state, form_busy, app_id) = form.ok_or(StoreError::NotFound {
            kind: EntityKind::ApplicationForm,
            id,
        })?;
        let app: Option<(String, bool)> = sqlx::query_as(
            "SELECT status, submission_claim FROM applications WHERE id = $1 FOR UPDATE",
        )
        .bind(app_id)
        .fetch_optional(&mut *tx)
        .await?;
        let (status, app_busy) =
            app.ok_or_else(|| corrupt(format!("form {id} has no application")))?;
        if form_busy || app_busy {
            return Err(StoreError::Busy {
                kind: EntityKind::ApplicationForm,
                id,
            });
        }

        let state: FormState = state.parse().map_err(corrupt)?;
        let status: ApplicationStatus = status.parse().map_err(corrupt)?;
        let promotable = matches!(
            status,
            ApplicationStatus::Started | ApplicationStatus::Ready
        );
        if state != FormState::Prepared || !promotable {
            return Ok(false);
        }

        sqlx::query("UPDATE application_forms SET state = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(FormState::Approved.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE applications SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(app_id)
            .bind(ApplicationStatus::Ready.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn discard_form(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row: Option<(String, bool)> = sqlx::query_as(
            "SELECT state, prepare_claim FROM application_forms WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let (state, busy) = row.ok_or(StoreError::NotFound {
            kind: EntityKind::ApplicationForm,
            id,
        })?;
        if busy {
            return Err(StoreError::Busy {
                kind: EntityKind::ApplicationForm,
                id,
            });
        }
        let state: FormState = state.parse().map_err(corrupt)?;
        if !state.can_advance_to(FormState::Discarded) {
            return Ok(false);
        }
        sqlx::query("UPDATE application_forms SET state = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(FormState::Discarded.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn advance_application(&self, id: Uuid, status: ApplicationStatus) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row: Option<(String, bool)> = sqlx::query_as(
            "SELECT status, submission_claim FROM applications WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let (current, busy) = row.ok_or(StoreError::NotFound {
            kind: EntityKind::Application,
            id,
        })?;
        if busy {
            return Err(StoreError::Busy {
                kind: EntityKind::Application,
                id,
            });
        }
        let current: ApplicationStatus = current.parse().map_err(corrupt)?;
        if !(current >= ApplicationStatus::Submitted) || !current.can_advance_to(status) {
            return Ok(false);
        }
        sqlx::query("UPDATE applications SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn record_failure(&self, failure: &StageFailure) -> Result<(), StoreError> {
        let record = FailureRecord::from(failure);
        sqlx::query(
            "INSERT INTO stage_failures (id, entity_id, stage, kind, message, failed_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(record.id)
        .bind(record.entity_id)
        .bind(record.stage.as_str())
        .bind(record.kind.to_string())
        .bind(&record.message)
        .bind(record.failed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_row(state: &str) -> JobRow {
        let now = Utc::now();
        JobRow {
            id: Uuid::new_v4(),
            external_id: "li-1".into(),
            title: "Rust Engineer".into(),
            company: "Acme".into(),
            location: None,
            min_salary: None,
            max_salary: None,
            employment_type: None,
            date_posted: None,
            description: None,
            listing_url: Some("https://www.linkedin.com/jobs/view/1".into()),
            direct_url: None,
            state: state.into(),
            classification: None,
            rationale: None,
            manual: false,
            review_claim_token: None,
            review_claim_at: None,
            create_app_claim_token: None,
            create_app_claim_at: None,
            expiration_check_claim_token: None,
            expiration_check_claim_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn job_row_converts_review_and_claims() {
        let mut row = job_row("reviewed");
        row.classification = Some("reach".into());
        row.rationale = Some("stretch role".into());
        let token = Uuid::new_v4();
        row.review_claim_token = Some(token);
        row.review_claim_at = Some(Utc::now());

        let job = Job::try_from(row).unwrap();
        assert_eq!(job.state, JobState::Reviewed);
        assert_eq!(job.review.unwrap().classification, Classification::Reach);
        assert_eq!(job.review_claim.map(|h| h.token), Some(token));
        assert!(job.create_app_claim.is_none());
    }

    #[test]
    fn unknown_state_is_corrupt() {
        let result = Job::try_from(job_row("archived"));
        assert!(matches!(result, Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn half_written_claim_is_no_claim() {
        assert!(hold(Some(Uuid::new_v4()), None).is_none());
        assert!(hold(None, Some(Utc::now())).is_none());
    }

    #[test]
    fn guards_target_their_entity_table() {
        for stage in Stage::ALL {
            let predicate = guard(stage);
            let column = state_column(stage.entity());
            assert!(predicate.starts_with(column), "{stage}: {predicate}");
        }
        assert_eq!(table(Stage::Prepare.entity()), "application_forms");
    }

    #[test]
    fn failure_row_parses_kind_and_stage() {
        let row = FailureRow {
            id: Uuid::new_v4(),
            entity_id: Uuid::nil(),
            stage: "create_app".into(),
            kind: "transient".into(),
            message: "timed out".into(),
            failed_at: Utc::now(),
        };
        let record = FailureRecord::try_from(row).unwrap();
        assert_eq!(record.stage, Stage::CreateApp);
        assert_eq!(record.kind, FailureKind::Transient);
    }

    async fn seed_job(store: &PgStore, state: JobState) -> Uuid {
        let report = store
            .insert_jobs(vec![crate::testing::draft(&format!("li-{}", Uuid::new_v4()))])
            .await
            .unwrap();
        let id = report.inserted[0];
        sqlx::query("UPDATE jobs SET state = $2 WHERE id = $1")
            .bind(id)
            .bind(state.as_str())
            .execute(&store.pool)
            .await
            .unwrap();
        id
    }

    /// Approved job with a scraped form, built through the create_app claim.
    async fn seed_scraped(store: &PgStore) -> (Uuid, Application) {
        let job_id = seed_job(store, JobState::Approved).await;
        let claim = store.try_claim(Stage::CreateApp, job_id).await.unwrap().unwrap();
        let created = Mutation::ApplicationCreated {
            url: "https://jobs.ashbyhq.com/acme/1".into(),
            fields: vec![FormField::text("Email")],
        };
        store.commit(&claim, created).await.unwrap();
        let application = store.application_for_job(job_id).await.unwrap().unwrap();
        (job_id, application)
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn concurrent_claims_have_one_winner(pool: PgPool) {
        let store = PgStore::new(pool);
        let id = seed_job(&store, JobState::Pending).await;

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.try_claim(Stage::Review, id).await })
            })
            .collect();
        let mut won = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_some() {
                won += 1;
            }
        }
        assert_eq!(won, 1);
        assert!(store.job(id).await.unwrap().unwrap().review_claim.is_some());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn claim_is_refused_when_the_guard_fails(pool: PgPool) {
        let store = PgStore::new(pool);
        let approved = seed_job(&store, JobState::Approved).await;
        assert!(store.try_claim(Stage::Review, approved).await.unwrap().is_none());
        assert!(store.try_claim(Stage::Review, Uuid::new_v4()).await.unwrap().is_none());

        let (_, application) = seed_scraped(&store).await;
        assert!(store.try_claim(Stage::Submit, application.id).await.unwrap().is_none());

        let form_id = application.form_id.unwrap();
        sqlx::query("UPDATE application_forms SET state = 'approved' WHERE id = $1")
            .bind(form_id)
            .execute(&store.pool)
            .await
            .unwrap();
        sqlx::query("UPDATE applications SET status = 'ready' WHERE id = $1")
            .bind(application.id)
            .execute(&store.pool)
            .await
            .unwrap();
        assert!(store.try_claim(Stage::Submit, application.id).await.unwrap().is_some());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn commit_and_release_are_fenced_by_token(pool: PgPool) {
        let store = PgStore::new(pool);
        let id = seed_job(&store, JobState::Pending).await;
        let claim = store.try_claim(Stage::Review, id).await.unwrap().unwrap();
        let review = || {
            Mutation::Reviewed(Review {
                classification: Classification::Target,
                rationale: "strong overlap".into(),
            })
        };

        let stale = Claim {
            token: Uuid::new_v4(),
            ..claim
        };
        assert!(matches!(
            store.commit(&stale, review()).await,
            Err(StoreError::ClaimLost { .. })
        ));
        assert!(matches!(store.release(&stale).await, Err(StoreError::ClaimLost { .. })));

        store.commit(&claim, review()).await.unwrap();
        let job = store.job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Reviewed);
        assert!(job.review_claim.is_none());

        assert!(matches!(
            store.commit(&claim, review()).await,
            Err(StoreError::ClaimLost { .. })
        ));
        assert!(matches!(store.release(&claim).await, Err(StoreError::ClaimLost { .. })));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn release_stale_frees_only_old_claims(pool: PgPool) {
        let store = PgStore::new(pool);
        let old = seed_job(&store, JobState::Pending).await;
        let fresh = seed_job(&store, JobState::Pending).await;
        let old_claim = store.try_claim(Stage::Review, old).await.unwrap().unwrap();
        store.try_claim(Stage::Review, fresh).await.unwrap().unwrap();
        sqlx::query("UPDATE jobs SET review_claim_at = NOW() - INTERVAL '1 hour' WHERE id = $1")
            .bind(old)
            .execute(&store.pool)
            .await
            .unwrap();

        let freed = store
            .release_stale(Stage::Review, Utc::now() - chrono::Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(freed, 1);
        assert!(store.job(old).await.unwrap().unwrap().review_claim.is_none());
        assert!(store.job(fresh).await.unwrap().unwrap().review_claim.is_some());

        // The reclaimed holder can no longer commit.
        let late = store
            .commit(
                &old_claim,
                Mutation::Reviewed(Review {
                    classification: Classification::Reach,
                    rationale: "late".into(),
                }),
            )
            .await;
        assert!(matches!(late, Err(StoreError::ClaimLost { .. })));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn eligible_without_form_skips_applied_jobs(pool: PgPool) {
        let store = PgStore::new(pool);
        let bare = seed_job(&store, JobState::Approved).await;
        let (applied, _) = seed_scraped(&store).await;

        let filter = EligibleFilter {
            approved_only: true,
            ..EligibleFilter::default()
        };
        let all = store.eligible(Stage::CreateApp, &filter).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|c| c.id == applied));

        let filter = EligibleFilter {
            without_form: true,
            ..filter
        };
        let ids: Vec<Uuid> = store
            .eligible(Stage::CreateApp, &filter)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![bare]);
    }
}
