//! Opaque notification sink (§6): `notify(user_id, channel, message,
//! metadata)`, used by expiry warnings (C8) and disk-quarantine notices
//! (C9). The real delivery channel (email, Slack, in-app) is external;
//! this crate only fixes the trait boundary and a logging default, the
//! same relationship `disk_reconciler.py`'s `_notify_user_quarantine`
//! stub has to its real caller in the original source.

use async_trait::async_trait;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationChannel {
    ExpiryWarning,
    DiskQuarantine,
}

impl NotificationChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationChannel::ExpiryWarning => "expiry_warning",
            NotificationChannel::DiskQuarantine => "disk_quarantine",
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(
        &self,
        user_id: &str,
        channel: NotificationChannel,
        message: &str,
        metadata: serde_json::Value,
    );
}

/// Default sink: structured log line only. A deployment wires a real
/// channel (email/Slack/webhook) behind the same trait without touching
/// any caller.
#[derive(Debug, Default, Clone)]
pub struct LoggingNotificationSink;

#[async_trait]
impl NotificationSink for LoggingNotificationSink {
    async fn notify(
        &self,
        user_id: &str,
        channel: NotificationChannel,
        message: &str,
        metadata: serde_json::Value,
    ) {
        info!(
            user_id,
            channel = channel.as_str(),
            message,
            %metadata,
            "notification"
        );
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub struct RecordedNotification {
        pub user_id: String,
        pub channel: NotificationChannel,
        pub message: String,
        pub metadata: serde_json::Value,
    }

    #[derive(Debug, Default)]
    pub struct RecordingNotificationSink {
        pub sent: Mutex<Vec<RecordedNotification>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingNotificationSink {
        async fn notify(
            &self,
            user_id: &str,
            channel: NotificationChannel,
            message: &str,
            metadata: serde_json::Value,
        ) {
            self.sent.lock().unwrap().push(RecordedNotification {
                user_id: user_id.to_string(),
                channel,
                message: message.to_string(),
                metadata,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::RecordingNotificationSink;
    use super::*;

    #[tokio::test]
    async fn recording_sink_captures_notifications() {
        let sink = RecordingNotificationSink::default();
        sink.notify(
            "u1",
            NotificationChannel::ExpiryWarning,
            "expires in 30 minutes",
            serde_json::json!({"reservation_id": "r1"}),
        )
        .await;

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].user_id, "u1");
        assert_eq!(sent[0].channel, NotificationChannel::ExpiryWarning);
    }
}
