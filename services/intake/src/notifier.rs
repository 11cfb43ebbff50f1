//! User-facing notifications sent through the Telegram Bot API.

use crate::config::NotifierConfig;
use crate::error::{IntakeError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

/// Severity of a notice; decides the leading emoji
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Info,
    Success,
    Error,
    Warning,
}

impl NoticeKind {
    pub fn emoji(&self) -> &'static str {
        match self {
            NoticeKind::Info => "ℹ️",
            NoticeKind::Success => "✅",
            NoticeKind::Error => "❌",
            NoticeKind::Warning => "⚠️",
        }
    }
}

/// A Markdown message for one chat
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub text: String,
}

impl Notice {
    pub fn new(kind: NoticeKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    /// Final text as sent to the chat
    pub fn render(&self) -> String {
        format!("{} {}", self.kind.emoji(), self.text)
    }

    pub fn welcome(first_name: &str) -> Self {
        Self::new(
            NoticeKind::Success,
            format!(
                "*Welcome!* Hi {}.\n\nYou are now registered. Send a video any time and we will process it.",
                escape_markdown(first_name)
            ),
        )
    }

    pub fn received(file_name: Option<&str>, submission_id: Uuid) -> Self {
        Self::new(
            NoticeKind::Info,
            format!(
                "*Video received!*\n\nFile: `{}`\nSubmission ID: `{}`\n\nUploading for processing...",
                code_span(file_name.unwrap_or("video")),
                submission_id
            ),
        )
    }

    pub fn processing_started(submission_id: Uuid) -> Self {
        Self::new(
            NoticeKind::Info,
            format!(
                "*Processing started*\n\nSubmission `{}` is being processed. You will get a message when it is done.",
                submission_id
            ),
        )
    }

    pub fn completed(submission_id: Uuid, output_location: Option<&str>) -> Self {
        let mut text = format!(
            "*Processing complete!*\n\nSubmission `{}` has been processed.",
            submission_id
        );
        if let Some(location) = output_location {
            text.push_str(&format!("\nResult: `{}`", code_span(location)));
        }
        Self::new(NoticeKind::Success, text)
    }

    pub fn failed(submission_id: Option<Uuid>, stage: &str) -> Self {
        let subject = match submission_id {
            Some(id) => format!("Submission `{}`", id),
            None => "Your video".to_string(),
        };
        Self::new(
            NoticeKind::Error,
            format!(
                "*Processing failed*\n\n{} could not be processed (failed during {}). Please try sending it again.",
                subject, stage
            ),
        )
    }
}

/// Escape user text placed outside any Markdown entity
pub fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '_' | '*' | '`' | '[') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Legacy Markdown has no escapes inside code spans
fn code_span(text: &str) -> String {
    text.replace('`', "'")
}

/// Delivers notices to chats
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, chat_id: i64, notice: &Notice) -> Result<()>;
}

/// Send a notice, logging instead of failing
pub async fn deliver(notifier: &dyn Notifier, chat_id: i64, notice: &Notice) {
    if let Err(e) = notifier.notify(chat_id, notice).await {
        metrics::counter!("intake.notifications.failed").increment(1);
        warn!(chat_id, error = %e, "Failed to send notification");
    }
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

#[derive(Deserialize)]
struct BotApiResponse {
    ok: bool,
    description: Option<String>,
}

/// `sendMessage` over HTTPS
pub struct BotApiNotifier {
    http: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl BotApiNotifier {
    pub fn new(config: &NotifierConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        if config.bot_token.is_none() {
            warn!("No bot token configured; notifications are disabled");
        }

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: config.bot_token.clone().filter(|t| !t.is_empty()),
        })
    }

    fn send_message_url(&self, token: &str) -> String {
        format!("{}/bot{}/sendMessage", self.api_base, token)
    }
}

#[async_trait]
impl Notifier for BotApiNotifier {
    async fn notify(&self, chat_id: i64, notice: &Notice) -> Result<()> {
        let Some(token) = self.token.as_deref() else {
            warn!(chat_id, "Bot token missing, notification skipped");
            return Ok(());
        };

        let text = notice.render();
        let response = self
            .http
            .post(self.send_message_url(token))
            .json(&SendMessage {
                chat_id,
                text: &text,
                parse_mode: "Markdown",
                disable_web_page_preview: true,
            })
            .send()
            .await
            .map_err(|e| IntakeError::Notification(e.without_url().to_string()))?;

        let status = response.status();
        let body: BotApiResponse = response
            .json()
            .await
            .map_err(|e| IntakeError::Notification(format!("invalid Bot API response: {}", e.without_url())))?;

        if !status.is_success() || !body.ok {
            return Err(IntakeError::Notification(format!(
                "Bot API returned {}: {}",
                status,
                body.description.unwrap_or_default()
            )));
        }

        debug!(chat_id, "Notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_prefixes_emoji() {
        let notice = Notice::new(NoticeKind::Warning, "careful");
        assert_eq!(notice.render(), "⚠️ careful");
        assert!(Notice::welcome("Ada").render().starts_with("✅ *Welcome!* Hi Ada."));
    }

    #[test]
    fn test_user_text_cannot_break_markdown() {
        assert_eq!(escape_markdown("snake_case*[x]`"), "snake\\_case\\*\\[x]\\`");

        let welcome = Notice::welcome("_ada_");
        assert!(welcome.text.contains("Hi \\_ada\\_."));

        let received = Notice::received(Some("my`clip`.mp4"), Uuid::nil());
        assert_eq!(received.text.matches('`').count(), 4);
        assert!(received.text.contains("`my'clip'.mp4`"));
    }

    #[test]
    fn test_completed_mentions_output() {
        let id = Uuid::nil();
        let notice = Notice::completed(id, Some("s3://results/1.json"));
        assert_eq!(notice.kind, NoticeKind::Success);
        assert!(notice.text.contains("s3://results/1.json"));
        assert!(!Notice::completed(id, None).text.contains("Result:"));
    }

    #[test]
    fn test_failed_names_stage() {
        let notice = Notice::failed(None, "transfer");
        assert_eq!(notice.kind, NoticeKind::Error);
        assert!(notice.text.contains("Your video"));
        assert!(notice.text.contains("failed during transfer"));
    }

    #[test]
    fn test_send_message_url() {
        let notifier = BotApiNotifier::new(&NotifierConfig {
            bot_token: Some("123:abc".to_string()),
            api_base: "https://api.telegram.org/".to_string(),
            ..NotifierConfig::default()
        })
        .unwrap();
        assert_eq!(
            notifier.send_message_url("123:abc"),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
    }

    #[tokio::test]
    async fn test_missing_token_is_not_an_error() {
        let notifier = BotApiNotifier::new(&NotifierConfig::default()).unwrap();
        let notice = Notice::completed(Uuid::nil(), None);
        tokio_test::assert_ok!(notifier.notify(1, &notice).await);
    }

    #[tokio::test]
    async fn test_deliver_swallows_errors() {
        let mut mock = MockNotifier::new();
        mock.expect_notify()
            .times(1)
            .returning(|_, _| Err(IntakeError::Notification("chat not found".into())));

        deliver(&mock, 42, &Notice::new(NoticeKind::Info, "hello")).await;
    }
}
