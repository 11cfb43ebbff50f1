use crate::config::{normalize_database_url, LedgerConfig};
use crate::error::{IntakeError, Result};
use crate::submission::{
    NewSubmission, NewVolunteer, StatusChange, StorageObject, Submission, SubmissionStatus,
    Volunteer,
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Result of recording a submission
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// New record; `attempt` is above 1 when an earlier attempt failed
    Created(Submission),
    /// The telegram file is in flight or done; nothing new was written
    Duplicate(Submission),
}

impl CreateOutcome {
    pub fn submission(&self) -> &Submission {
        match self {
            CreateOutcome::Created(s) | CreateOutcome::Duplicate(s) => s,
        }
    }
}

/// Query parameters for submission listing
#[derive(Debug, Clone, Default)]
pub struct SubmissionQuery {
    /// Filter by status
    pub status: Option<SubmissionStatus>,
    /// Filter by sender
    pub volunteer_id: Option<i64>,
    /// Maximum number of results
    pub limit: Option<i64>,
    /// Offset for pagination
    pub offset: Option<i64>,
}

/// Number of submissions in one status
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusCount {
    pub status: SubmissionStatus,
    pub count: i64,
}

/// Durable bookkeeping of submissions.
///
/// Each `update_status` is atomic per submission id and only applies
/// forward transitions; concurrent valid updates are last-writer-wins.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubmissionLedger: Send + Sync {
    /// Record a new submission, or return the live one for the same telegram file.
    /// A file whose latest attempt failed gets a fresh attempt.
    async fn create(&self, submission: NewSubmission) -> Result<CreateOutcome>;

    async fn update_status(&self, id: Uuid, change: StatusChange) -> Result<Submission>;

    async fn get(&self, id: Uuid) -> Result<Submission>;

    async fn list(&self, query: &SubmissionQuery) -> Result<Vec<Submission>>;

    async fn count_by_status(&self) -> Result<Vec<StatusCount>>;

    /// Reachability probe for the health surface
    async fn check(&self) -> Result<()>;
}

/// Known senders, auto-registered on first submission
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VolunteerRegistry: Send + Sync {
    async fn find(&self, id: i64) -> Result<Option<Volunteer>>;

    /// Insert or refresh a volunteer keyed by telegram user id
    async fn register(&self, volunteer: NewVolunteer) -> Result<Volunteer>;
}

const SUBMISSION_COLUMNS: &str = r#"
    id, volunteer_id, chat_id, message_id, telegram_file_id, attempt,
    file_name, mime_type, size_bytes, storage_bucket, storage_key,
    status, failure_reason, output_location,
    created_at, updated_at, completed_at
"#;

#[derive(Debug, FromRow)]
struct SubmissionRow {
    id: Uuid,
    volunteer_id: i64,
    chat_id: i64,
    message_id: i32,
    telegram_file_id: String,
    attempt: i32,
    file_name: Option<String>,
    mime_type: Option<String>,
    size_bytes: Option<i64>,
    storage_bucket: Option<String>,
    storage_key: Option<String>,
    status: String,
    failure_reason: Option<String>,
    output_location: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<SubmissionRow> for Submission {
    type Error = IntakeError;

    fn try_from(row: SubmissionRow) -> Result<Self> {
        let status = row.status.parse().map_err(IntakeError::Ledger)?;
        let storage = match (row.storage_bucket, row.storage_key) {
            (Some(bucket), Some(key)) => Some(StorageObject { bucket, key }),
            _ => None,
        };

        Ok(Submission {
            id: row.id,
            volunteer_id: row.volunteer_id,
            chat_id: row.chat_id,
            message_id: row.message_id,
            telegram_file_id: row.telegram_file_id,
            attempt: row.attempt,
            file_name: row.file_name,
            mime_type: row.mime_type,
            size_bytes: row.size_bytes,
            storage,
            status,
            failure_reason: row.failure_reason,
            output_location: row.output_location,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

/// PostgreSQL-backed submission ledger
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    /// Create a new ledger with connection pool
    pub async fn new(config: &LedgerConfig) -> anyhow::Result<Self> {
        let url = normalize_database_url(&config.url)?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Most recent attempt for a telegram file
    async fn fetch_latest_attempt(&self, telegram_file_id: &str) -> Result<Option<Submission>> {
        let row = sqlx::query_as::<_, SubmissionRow>(&format!(
            r#"
            SELECT {} FROM video_submissions
            WHERE telegram_file_id = $1
            ORDER BY attempt DESC
            LIMIT 1
            "#,
            SUBMISSION_COLUMNS
        ))
        .bind(telegram_file_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Submission::try_from).transpose()
    }
}

#[async_trait]
impl SubmissionLedger for PgLedger {
    #[instrument(skip(self, submission), fields(telegram_file_id = %submission.telegram_file_id))]
    async fn create(&self, submission: NewSubmission) -> Result<CreateOutcome> {
        let attempt = match self
            .fetch_latest_attempt(&submission.telegram_file_id)
            .await?
        {
            Some(existing) if existing.status != SubmissionStatus::Failed => {
                warn!(
                    submission_id = %existing.id,
                    status = %existing.status,
                    "Duplicate submission for telegram file"
                );
                return Ok(CreateOutcome::Duplicate(existing));
            }
            Some(failed) => failed.attempt + 1,
            None => 1,
        };
        let id = Uuid::new_v4();

        // A concurrent insert of the same attempt turns this into an empty insert
        let inserted = sqlx::query_as::<_, SubmissionRow>(&format!(
            r#"
            INSERT INTO video_submissions (
                id, volunteer_id, chat_id, message_id, telegram_file_id, attempt,
                file_name, mime_type, size_bytes, status, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, 'received', NOW(), NOW()
            )
            ON CONFLICT (telegram_file_id, attempt) DO NOTHING
            RETURNING {}
            "#,
            SUBMISSION_COLUMNS
        ))
        .bind(id)
        .bind(submission.volunteer_id)
        .bind(submission.chat_id)
        .bind(submission.message_id)
        .bind(&submission.telegram_file_id)
        .bind(attempt)
        .bind(&submission.file_name)
        .bind(&submission.mime_type)
        .bind(submission.size_bytes)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            debug!(submission_id = %id, attempt, "Submission recorded");
            return Ok(CreateOutcome::Created(row.try_into()?));
        }

        let existing = self
            .fetch_latest_attempt(&submission.telegram_file_id)
            .await?
            .ok_or_else(|| {
                IntakeError::Ledger("conflicting submission vanished during insert".to_string())
            })?;

        warn!(
            submission_id = %existing.id,
            "Duplicate submission for telegram file"
        );
        Ok(CreateOutcome::Duplicate(existing))
    }

    #[instrument(skip(self, change), fields(status = %change.status))]
    async fn update_status(&self, id: Uuid, change: StatusChange) -> Result<Submission> {
        let predecessors: Vec<String> = change
            .allowed_from()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let (bucket, key) = match &change.storage {
            Some(object) => (Some(object.bucket.clone()), Some(object.key.clone())),
            None => (None, None),
        };

        let updated = sqlx::query_as::<_, SubmissionRow>(&format!(
            r#"
            UPDATE video_submissions SET
                status = $2,
                storage_bucket = COALESCE(storage_bucket, $3),
                storage_key = COALESCE(storage_key, $4),
                size_bytes = COALESCE($5, size_bytes),
                failure_reason = COALESCE($6, failure_reason),
                output_location = COALESCE($7, output_location),
                updated_at = NOW(),
                completed_at = CASE
                    WHEN $2::text IN ('completed', 'failed') THEN NOW()
                    ELSE completed_at
                END
            WHERE id = $1 AND status = ANY($8)
            RETURNING {}
            "#,
            SUBMISSION_COLUMNS
        ))
        .bind(id)
        .bind(change.status.as_str())
        .bind(bucket)
        .bind(key)
        .bind(change.size_bytes)
        .bind(&change.reason)
        .bind(&change.output_location)
        .bind(&predecessors)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return row.try_into();
        }

        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM video_submissions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        match current {
            None => Err(IntakeError::NotFound(id)),
            Some((status,)) => Err(IntakeError::InvalidTransition {
                from: status.parse().map_err(IntakeError::Ledger)?,
                to: change.status,
            }),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Submission> {
        let row = sqlx::query_as::<_, SubmissionRow>(&format!(
            "SELECT {} FROM video_submissions WHERE id = $1",
            SUBMISSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(IntakeError::NotFound(id))?.try_into()
    }

    #[instrument(skip(self))]
    async fn list(&self, query: &SubmissionQuery) -> Result<Vec<Submission>> {
        let rows = sqlx::query_as::<_, SubmissionRow>(&format!(
            r#"
            SELECT {} FROM video_submissions
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::bigint IS NULL OR volunteer_id = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
            SUBMISSION_COLUMNS
        ))
        .bind(query.status.map(|s| s.as_str()))
        .bind(query.volunteer_id)
        .bind(query.limit.unwrap_or(50))
        .bind(query.offset.unwrap_or(0))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Submission::try_from).collect()
    }

    async fn count_by_status(&self) -> Result<Vec<StatusCount>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM video_submissions GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let counts: HashMap<String, i64> = rows.into_iter().collect();
        Ok(SubmissionStatus::ALL
            .iter()
            .map(|status| StatusCount {
                status: *status,
                count: counts.get(status.as_str()).copied().unwrap_or(0),
            })
            .collect())
    }

    async fn check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl VolunteerRegistry for PgLedger {
    async fn find(&self, id: i64) -> Result<Option<Volunteer>> {
        let volunteer = sqlx::query_as::<_, Volunteer>(
            r#"
            SELECT id, first_name, last_name, username, phone_number, created_at, updated_at
            FROM volunteers
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(volunteer)
    }

    #[instrument(skip(self, volunteer), fields(volunteer_id = volunteer.id))]
    async fn register(&self, volunteer: NewVolunteer) -> Result<Volunteer> {
        let registered = sqlx::query_as::<_, Volunteer>(
            r#"
            INSERT INTO volunteers (
                id, first_name, last_name, username, phone_number, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, NOW(), NOW())
            ON CONFLICT (id) DO UPDATE SET
                username = COALESCE(EXCLUDED.username, volunteers.username),
                phone_number = COALESCE(EXCLUDED.phone_number, volunteers.phone_number),
                updated_at = EXCLUDED.updated_at
            RETURNING id, first_name, last_name, username, phone_number, created_at, updated_at
            "#,
        )
        .bind(volunteer.id)
        .bind(&volunteer.first_name)
        .bind(&volunteer.last_name)
        .bind(&volunteer.username)
        .bind(&volunteer.phone_number)
        .fetch_one(&self.pool)
        .await?;

        info!(volunteer_id = registered.id, "Volunteer registered");
        Ok(registered)
    }
}

#[derive(Default)]
struct MemoryState {
    submissions: HashMap<Uuid, Submission>,
    /// Latest attempt per telegram file
    by_file_id: HashMap<String, Uuid>,
    volunteers: HashMap<i64, Volunteer>,
}

/// In-process ledger for local runs and tests; nothing survives a restart
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<MemoryState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubmissionLedger for MemoryLedger {
    async fn create(&self, submission: NewSubmission) -> Result<CreateOutcome> {
        let mut state = self.state.lock();

        let attempt = match state.by_file_id.get(&submission.telegram_file_id) {
            Some(latest) => {
                let existing = state
                    .submissions
                    .get(latest)
                    .cloned()
                    .ok_or(IntakeError::NotFound(*latest))?;
                if existing.status != SubmissionStatus::Failed {
                    return Ok(CreateOutcome::Duplicate(existing));
                }
                existing.attempt + 1
            }
            None => 1,
        };

        let id = Uuid::new_v4();
        let record = submission.into_submission(id, attempt, Utc::now());
        state
            .by_file_id
            .insert(record.telegram_file_id.clone(), id);
        state.submissions.insert(id, record.clone());
        Ok(CreateOutcome::Created(record))
    }

    async fn update_status(&self, id: Uuid, change: StatusChange) -> Result<Submission> {
        let mut state = self.state.lock();
        let submission = state
            .submissions
            .get_mut(&id)
            .ok_or(IntakeError::NotFound(id))?;
        change.apply(submission, Utc::now())?;
        Ok(submission.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Submission> {
        self.state
            .lock()
            .submissions
            .get(&id)
            .cloned()
            .ok_or(IntakeError::NotFound(id))
    }

    async fn list(&self, query: &SubmissionQuery) -> Result<Vec<Submission>> {
        let state = self.state.lock();
        let mut matching: Vec<Submission> = state
            .submissions
            .values()
            .filter(|s| query.status.map_or(true, |status| s.status == status))
            .filter(|s| query.volunteer_id.map_or(true, |v| s.volunteer_id == v))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let offset = query.offset.unwrap_or(0).max(0) as usize;
        let limit = query.limit.unwrap_or(50).max(0) as usize;
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn count_by_status(&self) -> Result<Vec<StatusCount>> {
        let state = self.state.lock();
        Ok(SubmissionStatus::ALL
            .iter()
            .map(|status| StatusCount {
                status: *status,
                count: state
                    .submissions
                    .values()
                    .filter(|s| s.status == *status)
                    .count() as i64,
            })
            .collect())
    }

    async fn check(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl VolunteerRegistry for MemoryLedger {
    async fn find(&self, id: i64) -> Result<Option<Volunteer>> {
        Ok(self.state.lock().volunteers.get(&id).cloned())
    }

    async fn register(&self, volunteer: NewVolunteer) -> Result<Volunteer> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let entry = state
            .volunteers
            .entry(volunteer.id)
            .or_insert_with(|| Volunteer {
                id: volunteer.id,
                first_name: volunteer.first_name.clone(),
                last_name: volunteer.last_name.clone(),
                username: None,
                phone_number: None,
                created_at: now,
                updated_at: now,
            });
        if volunteer.username.is_some() {
            entry.username = volunteer.username;
        }
        if volunteer.phone_number.is_some() {
            entry.phone_number = volunteer.phone_number;
        }
        entry.updated_at = now;
        Ok(entry.clone())
    }
}
