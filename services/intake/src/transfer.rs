use crate::config::S3Config;
use crate::error::{IntakeError, Result};
use crate::submission::StorageObject;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Content of an incoming video, chunk by chunk
pub type VideoStream = BoxStream<'static, Result<Bytes>>;

/// User metadata stored alongside the uploaded object
pub type ObjectMetadata = BTreeMap<String, String>;

const DEFAULT_EXTENSION: &str = "mp4";
const MAX_EXTENSION_LEN: usize = 8;

/// What a finished upload produced
#[derive(Debug, Clone, PartialEq)]
pub struct UploadReceipt {
    pub object: StorageObject,
    pub bytes_written: u64,
    /// 1 for a single `put_object`
    pub parts: u32,
}

/// Object storage for submitted videos
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VideoStorage: Send + Sync {
    /// Stream `body` into `key`; the object is verified before returning
    async fn upload_stream(
        &self,
        key: String,
        content_type: String,
        metadata: ObjectMetadata,
        body: VideoStream,
    ) -> Result<UploadReceipt>;

    /// Reachability probe for the health surface
    async fn check(&self) -> Result<()>;
}

/// Destination of one upload, as seen by the part-buffering loop
#[async_trait]
trait PartSink: Send + Sync {
    /// Whole object in one request
    async fn put_single(&self, body: Bytes) -> Result<()>;

    /// Start a multipart upload and return its id
    async fn create(&self) -> Result<String>;

    async fn upload_part(&self, upload_id: &str, part_number: i32, body: Bytes)
        -> Result<CompletedPart>;

    async fn complete(&self, upload_id: &str, parts: Vec<CompletedPart>) -> Result<()>;

    async fn abort(&self, upload_id: &str);
}

/// Move `body` into `sink`, holding at most one part plus one chunk in memory.
///
/// Streams that end within the first part go up with a single put; longer
/// ones become a multipart upload of `part_size` parts and a short last part.
/// Any failure after the upload was created aborts it.
async fn stream_to_sink<S: PartSink>(
    sink: &S,
    body: &mut VideoStream,
    part_size: usize,
) -> Result<(u64, u32)> {
    let mut buffer = BytesMut::with_capacity(part_size);
    let mut exhausted = false;

    while buffer.len() <= part_size {
        match body.next().await {
            Some(chunk) => buffer.extend_from_slice(&chunk?),
            None => {
                exhausted = true;
                break;
            }
        }
    }

    if exhausted {
        if buffer.is_empty() {
            return Err(IntakeError::Transfer("content stream was empty".to_string()));
        }
        let len = buffer.len() as u64;
        debug!(size_bytes = len, "Using single put_object");
        sink.put_single(buffer.freeze()).await?;
        return Ok((len, 1));
    }

    debug!("Using multipart upload");
    let upload_id = sink.create().await?;

    let (parts, written) = match upload_parts(sink, &upload_id, buffer, body, part_size).await {
        Ok(done) => done,
        Err(e) => {
            sink.abort(&upload_id).await;
            return Err(e);
        }
    };
    let part_count = parts.len() as u32;

    if let Err(e) = sink.complete(&upload_id, parts).await {
        sink.abort(&upload_id).await;
        return Err(e);
    }

    Ok((written, part_count))
}

async fn upload_parts<S: PartSink>(
    sink: &S,
    upload_id: &str,
    mut buffer: BytesMut,
    body: &mut VideoStream,
    part_size: usize,
) -> Result<(Vec<CompletedPart>, u64)> {
    let mut parts = Vec::new();
    let mut written = 0u64;
    let mut finished = false;

    loop {
        while buffer.len() >= part_size {
            let chunk = buffer.split_to(part_size).freeze();
            written += chunk.len() as u64;
            let part_number = parts.len() as i32 + 1;
            parts.push(sink.upload_part(upload_id, part_number, chunk).await?);
        }

        if finished {
            break;
        }

        match body.next().await {
            Some(chunk) => buffer.extend_from_slice(&chunk?),
            None => finished = true,
        }

        if finished && !buffer.is_empty() {
            let last = buffer.split().freeze();
            written += last.len() as u64;
            let part_number = parts.len() as i32 + 1;
            parts.push(sink.upload_part(upload_id, part_number, last).await?);
        }
    }

    Ok((parts, written))
}

/// One object in the configured bucket
struct S3Target<'a> {
    client: &'a S3Client,
    bucket: &'a str,
    key: &'a str,
    content_type: &'a str,
    metadata: &'a ObjectMetadata,
}

#[async_trait]
impl PartSink for S3Target<'_> {
    async fn put_single(&self, body: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(self.bucket)
            .key(self.key)
            .body(ByteStream::from(body))
            .content_type(self.content_type)
            .set_metadata(Some(self.metadata.clone().into_iter().collect()))
            .send()
            .await
            .map_err(|e| {
                IntakeError::Transfer(format!("put_object failed: {}", DisplayErrorContext(&e)))
            })?;
        Ok(())
    }

    async fn create(&self) -> Result<String> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(self.bucket)
            .key(self.key)
            .content_type(self.content_type)
            .set_metadata(Some(self.metadata.clone().into_iter().collect()))
            .send()
            .await
            .map_err(|e| {
                IntakeError::Transfer(format!(
                    "create_multipart_upload failed: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        created
            .upload_id()
            .map(String::from)
            .ok_or_else(|| IntakeError::Transfer("no upload id in response".to_string()))
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPart> {
        let response = self
            .client
            .upload_part()
            .bucket(self.bucket)
            .key(self.key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                IntakeError::Transfer(format!(
                    "upload_part {} failed: {}",
                    part_number,
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(CompletedPart::builder()
            .part_number(part_number)
            .e_tag(response.e_tag().unwrap_or_default())
            .build())
    }

    async fn complete(&self, upload_id: &str, parts: Vec<CompletedPart>) -> Result<()> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(self.bucket)
            .key(self.key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| {
                IntakeError::Transfer(format!(
                    "complete_multipart_upload failed: {}",
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }

    async fn abort(&self, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(self.bucket)
            .key(self.key)
            .upload_id(upload_id)
            .send()
            .await
        {
            warn!(
                key = %self.key,
                error = %DisplayErrorContext(&e),
                "Failed to abort multipart upload"
            );
        }
    }
}

/// S3 uploader streaming video content through multipart uploads
pub struct S3Uploader {
    client: S3Client,
    bucket: String,
    part_size: usize,
}

impl S3Uploader {
    /// Create a new S3 uploader
    pub async fn new(config: &S3Config) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            part_size = config.effective_part_size(),
            "S3 uploader initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            part_size: config.effective_part_size(),
        })
    }

    /// Confirm the object exists with the expected size
    async fn verify(&self, key: &str, expected: u64) -> Result<()> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                IntakeError::Transfer(format!(
                    "uploaded object not found: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        match head.content_length() {
            Some(len) if len as u64 != expected => Err(IntakeError::Transfer(format!(
                "size mismatch after upload: expected {} bytes, found {}",
                expected, len
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl VideoStorage for S3Uploader {
    #[instrument(skip(self, metadata, body), fields(bucket = %self.bucket, key = %key))]
    async fn upload_stream(
        &self,
        key: String,
        content_type: String,
        metadata: ObjectMetadata,
        mut body: VideoStream,
    ) -> Result<UploadReceipt> {
        let started = Instant::now();
        let target = S3Target {
            client: &self.client,
            bucket: &self.bucket,
            key: &key,
            content_type: &content_type,
            metadata: &metadata,
        };
        let (bytes_written, parts) = stream_to_sink(&target, &mut body, self.part_size).await?;

        self.verify(&key, bytes_written).await?;

        let elapsed = started.elapsed();
        metrics::counter!("intake.upload.bytes").increment(bytes_written);
        metrics::histogram!("intake.upload.duration_seconds").record(elapsed.as_secs_f64());

        info!(
            size_bytes = bytes_written,
            parts,
            duration_ms = elapsed.as_millis() as u64,
            "Video uploaded"
        );

        Ok(UploadReceipt {
            object: StorageObject::new(&self.bucket, key),
            bytes_written,
            parts,
        })
    }

    async fn check(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| {
                IntakeError::Transfer(format!("head_bucket failed: {}", DisplayErrorContext(&e)))
            })?;
        Ok(())
    }
}

/// Object key for a submission: `{prefix}/{id}.{ext}`
pub fn object_key(prefix: &str, submission_id: Uuid, file_name: Option<&str>) -> String {
    let ext = sanitize_extension(file_name);
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}.{}", submission_id, ext)
    } else {
        format!("{}/{}.{}", prefix, submission_id, ext)
    }
}

/// Lowercase alphanumeric extension of `file_name`, `mp4` when unusable
pub fn sanitize_extension(file_name: Option<&str>) -> String {
    file_name
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| {
            ext.chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .map(|c| c.to_ascii_lowercase())
                .collect::<String>()
        })
        .filter(|ext| !ext.is_empty() && ext.len() <= MAX_EXTENSION_LEN)
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

/// Content type for an upload, by extension first and then by declared MIME type
pub fn content_type_for(ext: &str, mime_type: Option<&str>) -> String {
    let by_ext = match ext {
        "mp4" | "m4v" => Some("video/mp4"),
        "mov" => Some("video/quicktime"),
        "mkv" => Some("video/x-matroska"),
        "webm" => Some("video/webm"),
        "avi" => Some("video/x-msvideo"),
        "3gp" => Some("video/3gpp"),
        _ => None,
    };

    if let Some(ct) = by_ext {
        return ct.to_string();
    }
    match mime_type {
        Some(mime) if mime.to_ascii_lowercase().starts_with("video/") => mime.to_string(),
        _ => "application/octet-stream".to_string(),
    }
}

/// S3 user metadata must be printable ASCII
fn sanitize_metadata_value(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .collect();
    cleaned.trim().to_string()
}

/// Metadata attached to every uploaded video
pub fn object_metadata(
    submission_id: Uuid,
    volunteer_id: i64,
    declared_size: Option<i64>,
    sender_name: Option<&str>,
    uploaded_at: DateTime<Utc>,
) -> ObjectMetadata {
    let mut metadata = ObjectMetadata::new();
    metadata.insert("submission-id".to_string(), submission_id.to_string());
    metadata.insert("volunteer-id".to_string(), volunteer_id.to_string());
    metadata.insert("uploaded-at".to_string(), uploaded_at.to_rfc3339());
    metadata.insert("source".to_string(), "mtproto".to_string());
    metadata.insert(
        "original-size".to_string(),
        declared_size.unwrap_or(0).to_string(),
    );
    if let Some(name) = sender_name {
        metadata.insert("sender-name".to_string(), sanitize_metadata_value(name));
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum SinkCall {
        Put(usize),
        Create,
        Part(i32, usize),
        Complete(usize),
        Abort,
    }

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<SinkCall>>,
        fail_complete: bool,
    }

    impl RecordingSink {
        fn calls(&self) -> Vec<SinkCall> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl PartSink for RecordingSink {
        async fn put_single(&self, body: Bytes) -> Result<()> {
            self.calls.lock().push(SinkCall::Put(body.len()));
            Ok(())
        }

        async fn create(&self) -> Result<String> {
            self.calls.lock().push(SinkCall::Create);
            Ok("upload-1".to_string())
        }

        async fn upload_part(
            &self,
            _upload_id: &str,
            part_number: i32,
            body: Bytes,
        ) -> Result<CompletedPart> {
            self.calls.lock().push(SinkCall::Part(part_number, body.len()));
            Ok(CompletedPart::builder().part_number(part_number).build())
        }

        async fn complete(&self, _upload_id: &str, parts: Vec<CompletedPart>) -> Result<()> {
            self.calls.lock().push(SinkCall::Complete(parts.len()));
            if self.fail_complete {
                return Err(IntakeError::Transfer("complete rejected".to_string()));
            }
            Ok(())
        }

        async fn abort(&self, _upload_id: &str) {
            self.calls.lock().push(SinkCall::Abort);
        }
    }

    fn chunks(sizes: &[usize]) -> VideoStream {
        let items: Vec<Result<Bytes>> = sizes
            .iter()
            .map(|n| Ok(Bytes::from(vec![7u8; *n])))
            .collect();
        futures::stream::iter(items).boxed()
    }

    #[tokio::test]
    async fn test_short_stream_uses_single_put() {
        let sink = RecordingSink::default();
        let result = stream_to_sink(&sink, &mut chunks(&[2, 1]), 4).await.unwrap();

        assert_eq!(result, (3, 1));
        assert_eq!(sink.calls(), vec![SinkCall::Put(3)]);
    }

    #[tokio::test]
    async fn test_stream_of_exactly_one_part_uses_single_put() {
        let sink = RecordingSink::default();
        let result = stream_to_sink(&sink, &mut chunks(&[2, 2]), 4).await.unwrap();

        assert_eq!(result, (4, 1));
        assert_eq!(sink.calls(), vec![SinkCall::Put(4)]);
    }

    #[tokio::test]
    async fn test_long_stream_splits_into_parts() {
        let sink = RecordingSink::default();
        let result = stream_to_sink(&sink, &mut chunks(&[3, 3, 3, 1]), 4)
            .await
            .unwrap();

        assert_eq!(result, (10, 3));
        assert_eq!(
            sink.calls(),
            vec![
                SinkCall::Create,
                SinkCall::Part(1, 4),
                SinkCall::Part(2, 4),
                SinkCall::Part(3, 2),
                SinkCall::Complete(3),
            ]
        );
    }

    #[tokio::test]
    async fn test_large_chunk_is_cut_at_part_boundaries() {
        let sink = RecordingSink::default();
        let result = stream_to_sink(&sink, &mut chunks(&[9]), 4).await.unwrap();

        assert_eq!(result, (9, 3));
        assert_eq!(
            sink.calls(),
            vec![
                SinkCall::Create,
                SinkCall::Part(1, 4),
                SinkCall::Part(2, 4),
                SinkCall::Part(3, 1),
                SinkCall::Complete(3),
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_error_after_first_part_aborts() {
        let sink = RecordingSink::default();
        let items: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from(vec![1u8; 5])),
            Err(IntakeError::Connection("download interrupted".to_string())),
        ];
        let mut body: VideoStream = futures::stream::iter(items).boxed();

        let err = stream_to_sink(&sink, &mut body, 4).await.unwrap_err();

        assert!(matches!(err, IntakeError::Connection(_)));
        assert_eq!(
            sink.calls(),
            vec![SinkCall::Create, SinkCall::Part(1, 4), SinkCall::Abort]
        );
    }

    #[tokio::test]
    async fn test_failed_completion_aborts() {
        let sink = RecordingSink {
            fail_complete: true,
            ..Default::default()
        };
        let err = stream_to_sink(&sink, &mut chunks(&[6]), 4).await.unwrap_err();

        assert!(matches!(err, IntakeError::Transfer(_)));
        assert_eq!(sink.calls().last(), Some(&SinkCall::Abort));
    }

    #[tokio::test]
    async fn test_empty_stream_is_a_transfer_error() {
        let sink = RecordingSink::default();
        let err = stream_to_sink(&sink, &mut chunks(&[]), 4).await.unwrap_err();

        assert!(matches!(err, IntakeError::Transfer(_)));
        assert!(sink.calls().is_empty());
    }

    #[test]
    fn test_object_key() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(
            object_key("temp_videos", id, Some("Holiday.MOV")),
            "temp_videos/550e8400-e29b-41d4-a716-446655440000.mov"
        );
        assert_eq!(
            object_key("/temp_videos/", id, None),
            "temp_videos/550e8400-e29b-41d4-a716-446655440000.mp4"
        );
        assert_eq!(
            object_key("", id, Some("clip.webm")),
            "550e8400-e29b-41d4-a716-446655440000.webm"
        );
    }

    #[test]
    fn test_sanitize_extension() {
        assert_eq!(sanitize_extension(Some("video.MP4")), "mp4");
        assert_eq!(sanitize_extension(Some("noext")), "mp4");
        assert_eq!(sanitize_extension(Some("trailing.")), "mp4");
        assert_eq!(sanitize_extension(Some("../../etc.p/a$ss")), "pass");
        assert_eq!(sanitize_extension(Some("x.averyverylongext")), "mp4");
        assert_eq!(sanitize_extension(None), "mp4");
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("mp4", None), "video/mp4");
        assert_eq!(content_type_for("mov", Some("application/zip")), "video/quicktime");
        assert_eq!(content_type_for("bin", Some("video/x-flv")), "video/x-flv");
        assert_eq!(
            content_type_for("bin", Some("application/octet-stream")),
            "application/octet-stream"
        );
        assert_eq!(content_type_for("zip", None), "application/octet-stream");
    }

    #[test]
    fn test_object_metadata() {
        let id = Uuid::nil();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let metadata = object_metadata(id, 77, Some(1024), Some("Zoë Smith\n"), at);

        assert_eq!(metadata["submission-id"], id.to_string());
        assert_eq!(metadata["volunteer-id"], "77");
        assert_eq!(metadata["source"], "mtproto");
        assert_eq!(metadata["original-size"], "1024");
        assert_eq!(metadata["uploaded-at"], "2024-03-01T12:00:00+00:00");
        assert_eq!(metadata["sender-name"], "Zo_ Smith_");
        assert!(metadata["sender-name"].is_ascii());
    }

    #[test]
    fn test_metadata_without_sender() {
        let metadata = object_metadata(Uuid::nil(), 1, None, None, Utc::now());
        assert_eq!(metadata["original-size"], "0");
        assert!(!metadata.contains_key("sender-name"));
    }
}
