//! Submission records and the status lifecycle they move through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Processing stage of a submission.
///
/// Stages only move forward: `received -> uploaded -> processing ->
/// completed | failed`. `failed` may be entered from any non-terminal
/// stage, `completed` only once the bytes are stored; terminal stages have
/// no exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Received,
    Uploaded,
    Processing,
    Completed,
    Failed,
}

impl SubmissionStatus {
    pub const ALL: [SubmissionStatus; 5] = [
        SubmissionStatus::Received,
        SubmissionStatus::Uploaded,
        SubmissionStatus::Processing,
        SubmissionStatus::Completed,
        SubmissionStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Received => "received",
            SubmissionStatus::Uploaded => "uploaded",
            SubmissionStatus::Processing => "processing",
            SubmissionStatus::Completed => "completed",
            SubmissionStatus::Failed => "failed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            SubmissionStatus::Received => 0,
            SubmissionStatus::Uploaded => 1,
            SubmissionStatus::Processing => 2,
            SubmissionStatus::Completed | SubmissionStatus::Failed => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubmissionStatus::Completed | SubmissionStatus::Failed)
    }

    /// Whether a submission in this stage may move to `next`
    pub fn can_transition_to(&self, next: SubmissionStatus) -> bool {
        if self.is_terminal() || next.rank() <= self.rank() {
            return false;
        }
        !(*self == SubmissionStatus::Received && next == SubmissionStatus::Completed)
    }

    /// Stages from which `self` may be entered
    pub fn predecessors(&self) -> Vec<SubmissionStatus> {
        Self::ALL
            .iter()
            .copied()
            .filter(|s| s.can_transition_to(*self))
            .collect()
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "received" => Ok(SubmissionStatus::Received),
            "uploaded" => Ok(SubmissionStatus::Uploaded),
            "processing" => Ok(SubmissionStatus::Processing),
            "completed" => Ok(SubmissionStatus::Completed),
            "failed" => Ok(SubmissionStatus::Failed),
            other => Err(format!("unknown submission status: {}", other)),
        }
    }
}

/// Reference to uploaded bytes owned by the storage service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageObject {
    pub bucket: String,
    pub key: String,
}

impl StorageObject {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for StorageObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// One video-processing request tracked end to end
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Submission {
    pub id: Uuid,
    /// Telegram user id of the sender
    pub volunteer_id: i64,
    /// Chat the video arrived in; notifications go here
    pub chat_id: i64,
    pub message_id: i32,
    pub telegram_file_id: String,
    /// 1 for the first submission of a file, +1 for each resend after a failure
    pub attempt: i32,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub size_bytes: Option<i64>,
    pub storage: Option<StorageObject>,
    pub status: SubmissionStatus,
    pub failure_reason: Option<String>,
    pub output_location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields known when a submission is first recorded
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubmission {
    pub volunteer_id: i64,
    pub chat_id: i64,
    pub message_id: i32,
    pub telegram_file_id: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub size_bytes: Option<i64>,
}

impl NewSubmission {
    /// Build the record in `received` state
    pub fn into_submission(self, id: Uuid, attempt: i32, now: DateTime<Utc>) -> Submission {
        Submission {
            id,
            volunteer_id: self.volunteer_id,
            chat_id: self.chat_id,
            message_id: self.message_id,
            telegram_file_id: self.telegram_file_id,
            attempt,
            file_name: self.file_name,
            mime_type: self.mime_type,
            size_bytes: self.size_bytes,
            storage: None,
            status: SubmissionStatus::Received,
            failure_reason: None,
            output_location: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// A requested status change plus the data that travels with it
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub status: SubmissionStatus,
    pub storage: Option<StorageObject>,
    pub size_bytes: Option<i64>,
    pub reason: Option<String>,
    pub output_location: Option<String>,
    /// Only applies to submissions whose bytes are already stored
    pub requires_upload: bool,
}

impl StatusChange {
    pub fn to(status: SubmissionStatus) -> Self {
        Self {
            status,
            storage: None,
            size_bytes: None,
            reason: None,
            output_location: None,
            requires_upload: false,
        }
    }

    /// Mark uploaded with the object that now holds the bytes
    pub fn uploaded(object: StorageObject, size_bytes: i64) -> Self {
        Self {
            storage: Some(object),
            size_bytes: Some(size_bytes),
            ..Self::to(SubmissionStatus::Uploaded)
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::to(SubmissionStatus::Failed)
        }
    }

    pub fn with_output(mut self, location: Option<String>) -> Self {
        self.output_location = location;
        self
    }

    pub fn after_upload(mut self) -> Self {
        self.requires_upload = true;
        self
    }

    /// Stages this change may be applied from
    pub fn allowed_from(&self) -> Vec<SubmissionStatus> {
        let mut from = self.status.predecessors();
        if self.requires_upload {
            from.retain(|s| *s != SubmissionStatus::Received);
        }
        from
    }

    /// Apply to an existing record, enforcing the forward-only lifecycle
    pub fn apply(
        &self,
        submission: &mut Submission,
        now: DateTime<Utc>,
    ) -> crate::error::Result<()> {
        if !self.allowed_from().contains(&submission.status) {
            return Err(crate::error::IntakeError::InvalidTransition {
                from: submission.status,
                to: self.status,
            });
        }

        submission.status = self.status;
        if submission.storage.is_none() {
            submission.storage = self.storage.clone();
        }
        if let Some(size) = self.size_bytes {
            submission.size_bytes = Some(size);
        }
        if self.reason.is_some() {
            submission.failure_reason = self.reason.clone();
        }
        if self.output_location.is_some() {
            submission.output_location = self.output_location.clone();
        }
        submission.updated_at = now;
        if self.status.is_terminal() {
            submission.completed_at = Some(now);
        }
        Ok(())
    }
}

/// Outcome reported by the external processing pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingResult {
    pub submission_id: Uuid,
    pub status: ResultStatus,
    #[serde(default)]
    pub output_location: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    Failed,
}

impl ProcessingResult {
    /// Ledger change implied by this result; never applies before the upload
    pub fn to_status_change(&self) -> StatusChange {
        let change = match self.status {
            ResultStatus::Completed => StatusChange::to(SubmissionStatus::Completed)
                .with_output(self.output_location.clone()),
            ResultStatus::Failed => StatusChange::failed(
                self.error
                    .clone()
                    .unwrap_or_else(|| "processing failed".to_string()),
            ),
        };
        change.after_upload()
    }
}

/// Telegram user who submits videos
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct Volunteer {
    pub id: i64,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub phone_number: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewVolunteer {
    pub id: i64,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub phone_number: Option<String>,
}

impl NewVolunteer {
    /// Split a display name into first and last name
    pub fn from_display_name(
        id: i64,
        display_name: &str,
        username: Option<String>,
        phone_number: Option<String>,
    ) -> Self {
        let display_name = display_name.trim();
        let (first, last) = match display_name.split_once(' ') {
            Some((first, rest)) => (first.to_string(), Some(rest.trim().to_string())),
            None => (display_name.to_string(), None),
        };
        let first_name = if first.is_empty() {
            "Unknown User".to_string()
        } else {
            first
        };

        Self {
            id,
            first_name,
            last_name: last.filter(|l| !l.is_empty()),
            username,
            phone_number,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_submission() -> Submission {
        NewSubmission {
            volunteer_id: 42,
            chat_id: 42,
            message_id: 7,
            telegram_file_id: "5012".to_string(),
            file_name: Some("clip.mp4".to_string()),
            mime_type: Some("video/mp4".to_string()),
            size_bytes: Some(1024),
        }
        .into_submission(Uuid::new_v4(), 1, Utc::now())
    }

    #[test]
    fn test_forward_transitions() {
        use SubmissionStatus::*;
        assert!(Received.can_transition_to(Uploaded));
        assert!(Uploaded.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Uploaded.can_transition_to(Completed));
        assert!(Received.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Failed));
    }

    #[test]
    fn test_no_backward_or_terminal_exits() {
        use SubmissionStatus::*;
        assert!(!Uploaded.can_transition_to(Received));
        assert!(!Processing.can_transition_to(Uploaded));
        assert!(!Uploaded.can_transition_to(Uploaded));
        assert!(!Received.can_transition_to(Completed));
        for next in SubmissionStatus::ALL {
            assert!(!Completed.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
        }
    }

    #[test]
    fn test_predecessors() {
        use SubmissionStatus::*;
        assert_eq!(Uploaded.predecessors(), vec![Received]);
        assert_eq!(Completed.predecessors(), vec![Uploaded, Processing]);
        assert_eq!(Failed.predecessors(), vec![Received, Uploaded, Processing]);
        assert!(Received.predecessors().is_empty());
    }

    #[test]
    fn test_status_round_trips_through_text() {
        for status in SubmissionStatus::ALL {
            assert_eq!(status.as_str().parse::<SubmissionStatus>(), Ok(status));
        }
        assert!("PROCESSING".parse::<SubmissionStatus>().is_ok());
        assert!("declined".parse::<SubmissionStatus>().is_err());
    }

    #[test]
    fn test_apply_sets_storage_once() {
        let mut submission = new_submission();
        let first = StorageObject::new("videos", "temp_videos/a.mp4");
        StatusChange::uploaded(first.clone(), 2048)
            .apply(&mut submission, Utc::now())
            .unwrap();

        let mut later = StatusChange::to(SubmissionStatus::Processing);
        later.storage = Some(StorageObject::new("videos", "temp_videos/b.mp4"));
        later.apply(&mut submission, Utc::now()).unwrap();

        assert_eq!(submission.storage, Some(first));
        assert_eq!(submission.size_bytes, Some(2048));
        assert_eq!(submission.status, SubmissionStatus::Processing);
    }

    #[test]
    fn test_apply_rejects_backward_move() {
        let mut submission = new_submission();
        StatusChange::failed("upload interrupted")
            .apply(&mut submission, Utc::now())
            .unwrap();
        assert!(submission.completed_at.is_some());

        let err = StatusChange::to(SubmissionStatus::Processing)
            .apply(&mut submission, Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::IntakeError::InvalidTransition { .. }
        ));
        assert_eq!(submission.failure_reason.as_deref(), Some("upload interrupted"));
    }

    #[test]
    fn test_processing_result_mapping() {
        let result: ProcessingResult = serde_json::from_value(serde_json::json!({
            "submission_id": "550e8400-e29b-41d4-a716-446655440000",
            "status": "failed"
        }))
        .unwrap();
        let change = result.to_status_change();
        assert_eq!(change.status, SubmissionStatus::Failed);
        assert_eq!(change.reason.as_deref(), Some("processing failed"));
        assert_eq!(
            change.allowed_from(),
            vec![SubmissionStatus::Uploaded, SubmissionStatus::Processing]
        );
    }

    #[test]
    fn test_pipeline_result_needs_stored_bytes() {
        let mut submission = new_submission();
        let result = ProcessingResult {
            submission_id: submission.id,
            status: ResultStatus::Failed,
            output_location: None,
            error: Some("decoder crashed".to_string()),
        };

        let err = result
            .to_status_change()
            .apply(&mut submission, Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::IntakeError::InvalidTransition {
                from: SubmissionStatus::Received,
                to: SubmissionStatus::Failed,
            }
        ));
        assert_eq!(submission.status, SubmissionStatus::Received);
        assert!(submission.storage.is_none());
    }

    #[test]
    fn test_volunteer_from_display_name() {
        let v = NewVolunteer::from_display_name(1, "Ada  King Lovelace", None, None);
        assert_eq!(v.first_name, "Ada");
        assert_eq!(v.last_name.as_deref(), Some("King Lovelace"));

        let v = NewVolunteer::from_display_name(2, "  ", None, None);
        assert_eq!(v.first_name, "Unknown User");
        assert_eq!(v.last_name, None);
    }
}
