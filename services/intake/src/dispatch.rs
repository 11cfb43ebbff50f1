use crate::config::LambdaConfig;
use crate::error::{IntakeError, Result};
use crate::submission::StorageObject;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_lambda::config::Builder as LambdaConfigBuilder;
use aws_sdk_lambda::error::DisplayErrorContext;
use aws_sdk_lambda::operation::RequestId;
use aws_sdk_lambda::primitives::Blob;
use aws_sdk_lambda::types::InvocationType;
use aws_sdk_lambda::Client as LambdaClient;
use aws_types::region::Region;
use serde::Serialize;
use tracing::{info, instrument};
use uuid::Uuid;

/// Status code Lambda returns for an accepted asynchronous invocation
const ACCEPTED: i32 = 202;

/// Everything the processing function needs to find the upload
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub submission_id: Uuid,
    pub volunteer_id: i64,
    pub object: StorageObject,
    pub sender_name: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
struct InvokePayload<'a> {
    submission_id: String,
    volunteer_id: i64,
    s3_key: &'a str,
    bucket: &'a str,
    video_title: String,
}

impl DispatchRequest {
    pub fn video_title(&self) -> String {
        let sender = match self.sender_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.volunteer_id.to_string(),
        };
        format!("MTProto Submission from {}", sender)
    }

    fn payload(&self) -> InvokePayload<'_> {
        InvokePayload {
            submission_id: self.submission_id.to_string(),
            volunteer_id: self.volunteer_id,
            s3_key: &self.object.key,
            bucket: &self.object.bucket,
            video_title: self.video_title(),
        }
    }
}

/// The pipeline accepted the event. Processing has not finished.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchAck {
    pub status_code: i32,
    pub request_id: Option<String>,
}

/// Hands uploaded videos to the external processing pipeline
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PipelineTrigger: Send + Sync {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchAck>;
}

/// Fire-and-forget invocation of the video processor function
pub struct LambdaTrigger {
    client: LambdaClient,
    function_name: String,
}

impl LambdaTrigger {
    pub async fn new(config: &LambdaConfig, default_region: &str) -> anyhow::Result<Self> {
        let region = config
            .region
            .clone()
            .unwrap_or_else(|| default_region.to_string());
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.clone()))
            .load()
            .await;

        let mut builder = LambdaConfigBuilder::from(&aws_config);
        if let Some(ref endpoint_url) = config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }

        info!(
            function = %config.function_name,
            region = %region,
            "Lambda trigger initialized"
        );

        Ok(Self {
            client: LambdaClient::from_conf(builder.build()),
            function_name: config.function_name.clone(),
        })
    }
}

#[async_trait]
impl PipelineTrigger for LambdaTrigger {
    #[instrument(skip(self, request), fields(submission_id = %request.submission_id))]
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchAck> {
        let payload = serde_json::to_vec(&request.payload())
            .map_err(|e| IntakeError::Dispatch(format!("failed to encode payload: {}", e)))?;

        let output = self
            .client
            .invoke()
            .function_name(&self.function_name)
            .invocation_type(InvocationType::Event)
            .payload(Blob::new(payload))
            .send()
            .await
            .map_err(|e| {
                IntakeError::Dispatch(format!("invoke failed: {}", DisplayErrorContext(&e)))
            })?;

        let status_code = output.status_code();
        if status_code != ACCEPTED {
            return Err(IntakeError::Dispatch(format!(
                "function {} returned status {}",
                self.function_name, status_code
            )));
        }

        info!(
            function = %self.function_name,
            s3_key = %request.object.key,
            "Processing pipeline triggered"
        );

        Ok(DispatchAck {
            status_code,
            request_id: output.request_id().map(String::from),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(sender_name: Option<&str>) -> DispatchRequest {
        DispatchRequest {
            submission_id: Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap(),
            volunteer_id: 314,
            object: StorageObject::new(
                "videos",
                "temp_videos/550e8400-e29b-41d4-a716-446655440000.mp4",
            ),
            sender_name: sender_name.map(String::from),
        }
    }

    #[test]
    fn test_video_title_uses_sender_name() {
        assert_eq!(
            request(Some("Ada Lovelace")).video_title(),
            "MTProto Submission from Ada Lovelace"
        );
    }

    #[test]
    fn test_video_title_falls_back_to_volunteer_id() {
        assert_eq!(request(None).video_title(), "MTProto Submission from 314");
        assert_eq!(request(Some("  ")).video_title(), "MTProto Submission from 314");
    }

    #[test]
    fn test_payload_shape() {
        let req = request(Some("Ada"));
        let value = serde_json::to_value(req.payload()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "submission_id": "550e8400-e29b-41d4-a716-446655440000",
                "volunteer_id": 314,
                "s3_key": "temp_videos/550e8400-e29b-41d4-a716-446655440000.mp4",
                "bucket": "videos",
                "video_title": "MTProto Submission from Ada"
            })
        );
    }
}
