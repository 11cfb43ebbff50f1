//! Video Intake Service
//!
//! Receives videos that volunteers send to a Telegram account, streams them
//! into S3 and hands them to the video processing function. Every video is
//! tracked as a submission in PostgreSQL from receipt to completion, and the
//! sender is told how it went.
//!
//! ## Features
//!
//! - **MTProto Ingress**: Runs as a regular Telegram account over MTProto, so
//!   videos are not capped by the Bot API download limit
//! - **Streaming Uploads**: Content flows from Telegram into S3 multipart
//!   uploads one part at a time, never touching local disk
//! - **Submission Ledger**: Forward-only status lifecycle with duplicate
//!   detection on the Telegram file id
//! - **Notifications**: Bot API messages on completion or failure
//! - **Health Surface**: Dependency probes, session status and a callback
//!   endpoint for the processing pipeline
//!
//! ## Architecture
//!
//! ```text
//!  Telegram (MTProto)          S3 Bucket                 Lambda
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ Incoming     │           │ temp_videos/ │          │ Video        │
//! │ Messages     │           │   {id}.{ext} │          │ Processor    │
//! └──────────────┘           └──────────────┘          └──────────────┘
//!        │                          ▲                         ▲   │
//!        ▼                          │                         │   │ result
//! ┌──────────────┐           ┌──────────────┐                 │   │ callback
//! │ Ingress      │──────────▶│ Submission   │─────────────────┘   │
//! │ (classify)   │           │ Coordinator  │                     │
//! └──────────────┘           └──────────────┘                     ▼
//!                              │         │                 ┌──────────────┐
//!                              ▼         ▼                 │ HTTP API     │
//!                       ┌──────────┐ ┌──────────┐          │ /health      │
//!                       │ Ledger   │ │ Notifier │          │ /status      │
//!                       │ (sqlx)   │ │ (Bot API)│          └──────────────┘
//!                       └──────────┘ └──────────┘
//! ```

pub mod api;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod ingress;
pub mod ledger;
pub mod notifier;
pub mod submission;
pub mod transfer;

pub use api::{start_api_server, AppState};
pub use config::Config;
pub use coordinator::{Adapters, CoordinatorSettings, ProcessOutcome, SubmissionCoordinator};
pub use dispatch::{DispatchRequest, LambdaTrigger, PipelineTrigger};
pub use error::{IntakeError, Result};
pub use health::ServiceHealth;
pub use ingress::{ConnectionState, IncomingVideo, MtProtoSession, SessionStatus, VideoHandler};
pub use ledger::{CreateOutcome, MemoryLedger, PgLedger, SubmissionLedger, VolunteerRegistry};
pub use notifier::{BotApiNotifier, Notice, NoticeKind, Notifier};
pub use submission::{ProcessingResult, StorageObject, Submission, SubmissionStatus, Volunteer};
pub use transfer::{S3Uploader, UploadReceipt, VideoStorage};
