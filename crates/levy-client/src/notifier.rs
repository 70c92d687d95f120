use std::time::Duration;

use levy_core::error::AppError;
use levy_core::notify::JobNotification;
use levy_core::traits::Notifier;
use reqwest::Client;

use crate::fetcher::{build_client, classify_status, request_error, validate_url};

/// POSTs job notifications as JSON to the job's callback URL.
///
/// Any non-2xx response counts as a failed delivery.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    timeout: Duration,
    ssrf_protection: bool,
}

impl WebhookNotifier {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(10))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        Ok(Self {
            client: build_client(timeout)?,
            timeout,
            ssrf_protection: true,
        })
    }

    /// Allow callbacks to private/reserved addresses (local receivers).
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }
}

impl Notifier for WebhookNotifier {
    async fn notify(&self, target: &str, notification: &JobNotification) -> Result<(), AppError> {
        if self.ssrf_protection {
            validate_url(target).await?;
        }

        let response = self
            .client
            .post(target)
            .json(notification)
            .send()
            .await
            .map_err(|e| request_error(e, self.timeout))?;

        match classify_status(response.status(), target) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use levy_core::job::JobStatus;
    use uuid::Uuid;

    use super::*;

    fn notification() -> JobNotification {
        JobNotification {
            job_id: Uuid::new_v4(),
            status: JobStatus::Completed,
            completed_at: Some(Utc::now()),
            total: 10,
            successful: 8,
            failed: 2,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_private_callback_rejected() {
        let notifier = WebhookNotifier::new().unwrap();
        let err = notifier
            .notify("http://127.0.0.1:9/hook", &notification())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_unreachable_receiver_is_network_failure() {
        let notifier = WebhookNotifier::with_timeout(Duration::from_secs(2))
            .unwrap()
            .allow_private_urls();
        // Port 9 (discard) is closed on test hosts.
        let err = notifier
            .notify("http://127.0.0.1:9/hook", &notification())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NetworkError(_) | AppError::Timeout(_)));
    }

    #[test]
    fn test_payload_shape() {
        let value = serde_json::to_value(notification()).unwrap();
        assert_eq!(value["status"], "completed");
        assert_eq!(value["successful"], 8);
        assert!(value.get("error").is_none());
    }
}
