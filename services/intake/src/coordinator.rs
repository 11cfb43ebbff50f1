//! Drives one submission from an accepted message to a triggered pipeline,
//! and closes it out when the pipeline reports back.

use crate::dispatch::{DispatchRequest, PipelineTrigger};
use crate::error::{IntakeError, Result};
use crate::health::ServiceHealth;
use crate::ingress::{IncomingVideo, VideoHandler, VideoMessage};
use crate::ledger::{CreateOutcome, SubmissionLedger, VolunteerRegistry};
use crate::notifier::{deliver, Notice, Notifier};
use crate::submission::{
    NewSubmission, NewVolunteer, ProcessingResult, StatusChange, Submission, SubmissionStatus,
};
use crate::transfer::{
    content_type_for, object_key, object_metadata, sanitize_extension, VideoStorage, VideoStream,
};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// What happened to an accepted video
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Uploaded and handed to the pipeline
    Dispatched(Submission),
    /// Same telegram file seen before; nothing was uploaded
    Duplicate(Submission),
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub key_prefix: String,
    pub progress_updates: bool,
    pub max_concurrent_submissions: usize,
}

/// External collaborators of the coordinator
#[derive(Clone)]
pub struct Adapters {
    pub ledger: Arc<dyn SubmissionLedger>,
    pub volunteers: Arc<dyn VolunteerRegistry>,
    pub storage: Arc<dyn VideoStorage>,
    pub trigger: Arc<dyn PipelineTrigger>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Clone)]
pub struct SubmissionCoordinator {
    adapters: Adapters,
    health: Arc<ServiceHealth>,
    key_prefix: Arc<str>,
    progress_updates: bool,
    permits: Arc<Semaphore>,
}

impl SubmissionCoordinator {
    pub fn new(adapters: Adapters, health: Arc<ServiceHealth>, settings: CoordinatorSettings) -> Self {
        Self {
            adapters,
            health,
            key_prefix: settings.key_prefix.into(),
            progress_updates: settings.progress_updates,
            permits: Arc::new(Semaphore::new(settings.max_concurrent_submissions.max(1))),
        }
    }

    pub fn ledger(&self) -> &Arc<dyn SubmissionLedger> {
        &self.adapters.ledger
    }

    /// Record, upload and dispatch one video
    #[instrument(skip(self, video), fields(
        sender_id = video.message.sender_id,
        telegram_file_id = %video.message.telegram_file_id
    ))]
    pub async fn process(&self, video: IncomingVideo) -> Result<ProcessOutcome> {
        let IncomingVideo { message, content } = video;

        let newly_registered = match self.ensure_volunteer(&message).await {
            Ok(registered) => registered,
            Err(e) => {
                self.fail(None, message.chat_id, &e).await;
                return Err(e);
            }
        };

        let created = self
            .adapters
            .ledger
            .create(NewSubmission {
                volunteer_id: message.sender_id,
                chat_id: message.chat_id,
                message_id: message.message_id,
                telegram_file_id: message.telegram_file_id.clone(),
                file_name: message.file_name.clone(),
                mime_type: message.mime_type.clone(),
                size_bytes: message.declared_size,
            })
            .await;

        let submission = match created {
            Ok(CreateOutcome::Created(submission)) => submission,
            Ok(CreateOutcome::Duplicate(existing)) => {
                info!(
                    submission_id = %existing.id,
                    status = %existing.status,
                    "Duplicate video ignored"
                );
                return Ok(ProcessOutcome::Duplicate(existing));
            }
            Err(e) => {
                self.fail(None, message.chat_id, &e).await;
                return Err(e);
            }
        };

        if self.progress_updates {
            if newly_registered {
                let name = message.sender_name.as_deref().unwrap_or("there");
                self.notify(message.chat_id, &Notice::welcome(name)).await;
            }
            self.notify(
                message.chat_id,
                &Notice::received(message.file_name.as_deref(), submission.id),
            )
            .await;
        }

        match self.upload_and_dispatch(&submission, &message, content).await {
            Ok(updated) => {
                self.health.record_success();
                if self.progress_updates && updated.status == SubmissionStatus::Processing {
                    self.notify(message.chat_id, &Notice::processing_started(updated.id))
                        .await;
                }
                Ok(ProcessOutcome::Dispatched(updated))
            }
            Err(e) => {
                self.fail(Some(submission.id), message.chat_id, &e).await;
                Err(e)
            }
        }
    }

    async fn upload_and_dispatch(
        &self,
        submission: &Submission,
        message: &VideoMessage,
        content: VideoStream,
    ) -> Result<Submission> {
        let file_name = message.file_name.as_deref();
        let key = object_key(&self.key_prefix, submission.id, file_name);
        let content_type = content_type_for(
            &sanitize_extension(file_name),
            message.mime_type.as_deref(),
        );
        let metadata = object_metadata(
            submission.id,
            message.sender_id,
            message.declared_size,
            message.sender_name.as_deref(),
            Utc::now(),
        );

        let receipt = self
            .adapters
            .storage
            .upload_stream(key, content_type, metadata, content)
            .await?;

        let uploaded = self
            .adapters
            .ledger
            .update_status(
                submission.id,
                StatusChange::uploaded(receipt.object.clone(), receipt.bytes_written as i64),
            )
            .await?;

        let ack = self
            .adapters
            .trigger
            .dispatch(&DispatchRequest {
                submission_id: uploaded.id,
                volunteer_id: uploaded.volunteer_id,
                object: receipt.object,
                sender_name: message.sender_name.clone(),
            })
            .await?;
        debug!(status_code = ack.status_code, "Dispatch acknowledged");

        match self
            .adapters
            .ledger
            .update_status(uploaded.id, StatusChange::to(SubmissionStatus::Processing))
            .await
        {
            Ok(processing) => Ok(processing),
            // The pipeline already reported back
            Err(IntakeError::InvalidTransition { from, .. }) if from.is_terminal() => {
                self.adapters.ledger.get(uploaded.id).await
            }
            Err(e) => Err(e),
        }
    }

    /// Register unknown senders; true when the sender is new
    async fn ensure_volunteer(&self, message: &VideoMessage) -> Result<bool> {
        if self
            .adapters
            .volunteers
            .find(message.sender_id)
            .await?
            .is_some()
        {
            return Ok(false);
        }

        let volunteer = self
            .adapters
            .volunteers
            .register(NewVolunteer::from_display_name(
                message.sender_id,
                message.sender_name.as_deref().unwrap_or_default(),
                message.sender_username.clone(),
                message.sender_phone.clone(),
            ))
            .await?;
        info!(
            volunteer_id = volunteer.id,
            first_name = %volunteer.first_name,
            "Auto-registered new volunteer"
        );
        Ok(true)
    }

    /// Mark failed, record for health and tell the sender
    async fn fail(&self, submission_id: Option<Uuid>, chat_id: i64, err: &IntakeError) {
        metrics::counter!("intake.submissions.failed").increment(1);
        self.health.record_failure(err);
        error!(
            submission_id = ?submission_id,
            stage = err.stage(),
            error = %err,
            "Submission failed"
        );

        if let Some(id) = submission_id {
            if let Err(e) = self
                .adapters
                .ledger
                .update_status(id, StatusChange::failed(err.to_string()))
                .await
            {
                warn!(submission_id = %id, error = %e, "Could not mark submission failed");
                if matches!(e, IntakeError::InvalidTransition { from, .. } if from.is_terminal()) {
                    return;
                }
            }
        }

        self.notify(chat_id, &Notice::failed(submission_id, err.stage()))
            .await;
    }

    /// Close out a submission with the pipeline's result
    #[instrument(skip(self, result), fields(status = ?result.status))]
    pub async fn apply_result(&self, id: Uuid, result: ProcessingResult) -> Result<Submission> {
        let updated = self
            .adapters
            .ledger
            .update_status(id, result.to_status_change())
            .await?;

        match updated.status {
            SubmissionStatus::Completed => {
                metrics::counter!("intake.submissions.completed").increment(1);
                info!(submission_id = %id, "Submission completed");
                self.notify(
                    updated.chat_id,
                    &Notice::completed(id, updated.output_location.as_deref()),
                )
                .await;
            }
            SubmissionStatus::Failed => {
                metrics::counter!("intake.submissions.failed").increment(1);
                warn!(
                    submission_id = %id,
                    reason = updated.failure_reason.as_deref().unwrap_or("-"),
                    "Processing failed"
                );
                self.notify(updated.chat_id, &Notice::failed(Some(id), "processing"))
                    .await;
            }
            _ => {}
        }

        Ok(updated)
    }

    async fn notify(&self, chat_id: i64, notice: &Notice) {
        deliver(self.adapters.notifier.as_ref(), chat_id, notice).await;
    }
}

#[async_trait]
impl VideoHandler for SubmissionCoordinator {
    async fn accept(&self, video: IncomingVideo) {
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Coordinator closed, dropping video");
                return;
            }
        };

        let coordinator = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = coordinator.process(video).await {
                debug!(error = %e, "Submission ended with error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchAck, MockPipelineTrigger};
    use crate::ledger::MemoryLedger;
    use crate::notifier::{MockNotifier, NoticeKind};
    use crate::submission::{ResultStatus, StorageObject};
    use crate::transfer::{MockVideoStorage, UploadReceipt};
    use bytes::Bytes;
    use futures::StreamExt;

    fn video(file_id: &str) -> IncomingVideo {
        IncomingVideo {
            message: VideoMessage {
                sender_id: 4242,
                sender_name: Some("Ada Lovelace".to_string()),
                sender_username: Some("ada".to_string()),
                sender_phone: None,
                chat_id: 4242,
                chat_title: Some("Ada Lovelace".to_string()),
                message_id: 9,
                date: Utc::now(),
                telegram_file_id: file_id.to_string(),
                file_name: Some("walk.mp4".to_string()),
                mime_type: Some("video/mp4".to_string()),
                declared_size: Some(6),
            },
            content: futures::stream::iter(vec![
                Ok(Bytes::from_static(b"abc")),
                Ok(Bytes::from_static(b"def")),
            ])
            .boxed(),
        }
    }

    fn uploading_storage(times: usize) -> MockVideoStorage {
        let mut storage = MockVideoStorage::new();
        storage
            .expect_upload_stream()
            .times(times)
            .returning(|key, _, _, _| {
                Ok(UploadReceipt {
                    object: StorageObject::new("videos", key),
                    bytes_written: 6,
                    parts: 1,
                })
            });
        storage
    }

    fn accepting_trigger(times: usize) -> MockPipelineTrigger {
        let mut trigger = MockPipelineTrigger::new();
        trigger.expect_dispatch().times(times).returning(|_| {
            Ok(DispatchAck {
                status_code: 202,
                request_id: None,
            })
        });
        trigger
    }

    fn coordinator(
        ledger: Arc<MemoryLedger>,
        storage: MockVideoStorage,
        trigger: MockPipelineTrigger,
        notifier: MockNotifier,
        progress_updates: bool,
    ) -> SubmissionCoordinator {
        SubmissionCoordinator::new(
            Adapters {
                ledger: ledger.clone(),
                volunteers: ledger,
                storage: Arc::new(storage),
                trigger: Arc::new(trigger),
                notifier: Arc::new(notifier),
            },
            Arc::new(ServiceHealth::new()),
            CoordinatorSettings {
                key_prefix: "temp_videos".to_string(),
                progress_updates,
                max_concurrent_submissions: 4,
            },
        )
    }

    #[tokio::test]
    async fn test_valid_video_completes_with_one_notification() {
        let ledger = Arc::new(MemoryLedger::new());
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(|chat_id, notice| *chat_id == 4242 && notice.kind == NoticeKind::Success)
            .times(1)
            .returning(|_, _| Ok(()));

        let coordinator = coordinator(
            ledger.clone(),
            uploading_storage(1),
            accepting_trigger(1),
            notifier,
            false,
        );

        let outcome = coordinator.process(video("doc-1")).await.unwrap();
        let submission = match outcome {
            ProcessOutcome::Dispatched(s) => s,
            other => panic!("expected Dispatched, got {:?}", other),
        };
        assert_eq!(submission.status, SubmissionStatus::Processing);
        let object = submission.storage.clone().unwrap();
        assert_eq!(object.key, format!("temp_videos/{}.mp4", submission.id));

        let done = coordinator
            .apply_result(
                submission.id,
                ProcessingResult {
                    submission_id: submission.id,
                    status: ResultStatus::Completed,
                    output_location: Some("s3://results/walk.json".to_string()),
                    error: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(done.status, SubmissionStatus::Completed);
        assert_eq!(done.storage, Some(object));
    }

    #[tokio::test]
    async fn test_upload_failure_skips_dispatch() {
        let ledger = Arc::new(MemoryLedger::new());
        let mut storage = MockVideoStorage::new();
        storage
            .expect_upload_stream()
            .times(1)
            .returning(|_, _, _, _| Err(IntakeError::Transfer("connection reset".into())));
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(|_, notice| notice.kind == NoticeKind::Error && notice.text.contains("transfer"))
            .times(1)
            .returning(|_, _| Ok(()));

        let coordinator = coordinator(ledger.clone(), storage, accepting_trigger(0), notifier, false);

        let err = coordinator.process(video("doc-1")).await.unwrap_err();
        assert!(matches!(err, IntakeError::Transfer(_)));

        let stored = ledger.list(&Default::default()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, SubmissionStatus::Failed);
        assert!(stored[0].storage.is_none());
        assert!(stored[0].failure_reason.as_deref().unwrap().contains("connection reset"));
        assert!(coordinator.health.snapshot().degraded);
    }

    #[tokio::test]
    async fn test_dispatch_failure_marks_failed() {
        let ledger = Arc::new(MemoryLedger::new());
        let mut trigger = MockPipelineTrigger::new();
        trigger
            .expect_dispatch()
            .times(1)
            .returning(|_| Err(IntakeError::Dispatch("status 500".into())));
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().times(1).returning(|_, _| Ok(()));

        let coordinator = coordinator(ledger.clone(), uploading_storage(1), trigger, notifier, false);

        assert!(coordinator.process(video("doc-1")).await.is_err());
        let stored = ledger.list(&Default::default()).await.unwrap();
        assert_eq!(stored[0].status, SubmissionStatus::Failed);
        assert!(stored[0].storage.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_file_is_not_uploaded_twice() {
        let ledger = Arc::new(MemoryLedger::new());
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().times(0);

        let coordinator = coordinator(
            ledger.clone(),
            uploading_storage(1),
            accepting_trigger(1),
            notifier,
            false,
        );

        let first = coordinator.process(video("doc-1")).await.unwrap();
        let second = coordinator.process(video("doc-1")).await.unwrap();

        let first_id = match first {
            ProcessOutcome::Dispatched(s) => s.id,
            other => panic!("expected Dispatched, got {:?}", other),
        };
        match second {
            ProcessOutcome::Duplicate(s) => assert_eq!(s.id, first_id),
            other => panic!("expected Duplicate, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resend_after_failure_is_processed_again() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let ledger = Arc::new(MemoryLedger::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut storage = MockVideoStorage::new();
        let counter = calls.clone();
        storage
            .expect_upload_stream()
            .times(2)
            .returning(move |key, _, _, _| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(IntakeError::Transfer("reset".into()));
                }
                Ok(UploadReceipt {
                    object: StorageObject::new("videos", key),
                    bytes_written: 6,
                    parts: 1,
                })
            });
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(|_, notice| notice.kind == NoticeKind::Error)
            .times(1)
            .returning(|_, _| Ok(()));

        let coordinator = coordinator(ledger.clone(), storage, accepting_trigger(1), notifier, false);

        assert!(coordinator.process(video("doc-1")).await.is_err());
        let retried = match coordinator.process(video("doc-1")).await.unwrap() {
            ProcessOutcome::Dispatched(s) => s,
            other => panic!("expected Dispatched, got {:?}", other),
        };

        assert_eq!(retried.attempt, 2);
        assert_eq!(retried.status, SubmissionStatus::Processing);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(ledger.list(&Default::default()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_result_before_upload_is_rejected() {
        let ledger = Arc::new(MemoryLedger::new());
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().times(0);

        let coordinator = coordinator(
            ledger.clone(),
            uploading_storage(0),
            accepting_trigger(0),
            notifier,
            false,
        );

        let id = ledger
            .create(NewSubmission {
                volunteer_id: 4242,
                chat_id: 4242,
                message_id: 9,
                telegram_file_id: "doc-1".to_string(),
                file_name: None,
                mime_type: None,
                size_bytes: None,
            })
            .await
            .unwrap()
            .submission()
            .id;

        let result = coordinator
            .apply_result(
                id,
                ProcessingResult {
                    submission_id: id,
                    status: ResultStatus::Completed,
                    output_location: None,
                    error: None,
                },
            )
            .await;
        assert!(matches!(
            result,
            Err(IntakeError::InvalidTransition {
                from: SubmissionStatus::Received,
                ..
            })
        ));
        assert_eq!(ledger.get(id).await.unwrap().status, SubmissionStatus::Received);
    }

    #[tokio::test]
    async fn test_progress_updates_when_enabled() {
        let ledger = Arc::new(MemoryLedger::new());
        let mut notifier = MockNotifier::new();
        // welcome, received, processing started
        notifier.expect_notify().times(3).returning(|_, _| Ok(()));

        let coordinator = coordinator(
            ledger.clone(),
            uploading_storage(1),
            accepting_trigger(1),
            notifier,
            true,
        );

        coordinator.process(video("doc-1")).await.unwrap();
        let volunteer = ledger.find(4242).await.unwrap().unwrap();
        assert_eq!(volunteer.first_name, "Ada");
        assert_eq!(volunteer.last_name.as_deref(), Some("Lovelace"));
    }

    #[tokio::test]
    async fn test_result_for_unknown_or_closed_submission() {
        let ledger = Arc::new(MemoryLedger::new());
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(|_, notice| notice.kind == NoticeKind::Error)
            .times(1)
            .returning(|_, _| Ok(()));

        let coordinator = coordinator(
            ledger.clone(),
            uploading_storage(1),
            accepting_trigger(1),
            notifier,
            false,
        );

        let missing = Uuid::new_v4();
        let failed = ProcessingResult {
            submission_id: missing,
            status: ResultStatus::Failed,
            output_location: None,
            error: Some("decoder crashed".to_string()),
        };
        assert!(matches!(
            coordinator.apply_result(missing, failed.clone()).await,
            Err(IntakeError::NotFound(_))
        ));

        let id = match coordinator.process(video("doc-1")).await.unwrap() {
            ProcessOutcome::Dispatched(s) => s.id,
            other => panic!("expected Dispatched, got {:?}", other),
        };
        let closed = coordinator.apply_result(id, failed.clone()).await.unwrap();
        assert_eq!(closed.failure_reason.as_deref(), Some("decoder crashed"));

        assert!(matches!(
            coordinator.apply_result(id, failed).await,
            Err(IntakeError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_accept_processes_in_background() {
        let ledger = Arc::new(MemoryLedger::new());
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().times(0);

        let coordinator = coordinator(
            ledger.clone(),
            uploading_storage(1),
            accepting_trigger(1),
            notifier,
            false,
        );

        coordinator.accept(video("doc-1")).await;

        for _ in 0..50 {
            let stored = ledger.list(&Default::default()).await.unwrap();
            if stored.first().map(|s| s.status) == Some(SubmissionStatus::Processing) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("submission was not processed");
    }
}
