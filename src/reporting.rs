//! Best-effort HTTP notification of newly created steps.
//!
//! When a step is created with an [`EventReporting`] target, the task posts
//! `{"action": "new-progress-step", "name": <step>}` to the target URL.
//! The token travels in `x-access-token` when it parses as a JWT and in
//! `Authorization` otherwise. Failures are logged and never reach the caller.

use std::time::Duration;

use serde::Serialize;

use crate::constants::NEW_STEP_ACTION;
use crate::store::StorageError;
use crate::types::task::EventReporting;

const REPORT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct NewStepEvent<'a> {
    action: &'static str,
    name: &'a str,
}

/// Header carrying `token`: `x-access-token` for JWTs, `Authorization`
/// otherwise.
///
/// # Examples
///
/// ```
/// use task_logger::reporting::token_header;
///
/// assert_eq!(token_header("opaque-api-key"), "Authorization");
/// ```
pub fn token_header(token: &str) -> &'static str {
    if jsonwebtoken::decode_header(token).is_ok() {
        "x-access-token"
    } else {
        "Authorization"
    }
}

/// Posts new-step notifications.
#[derive(Debug, Clone)]
pub struct StepEventReporter {
    http: reqwest::Client,
}

impl Default for StepEventReporter {
    fn default() -> Self {
        let http = reqwest::Client::builder()
            .timeout(REPORT_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "falling back to default http client for event reporting");
                reqwest::Client::new()
            });
        Self { http }
    }
}

impl StepEventReporter {
    /// Creates a reporter from an existing client.
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Posts the notification for step `name` and waits for the answer.
    ///
    /// # Errors
    ///
    /// [`StorageError::Backend`] when the request fails or the endpoint
    /// answers with a non-success status.
    pub async fn notify(&self, target: &EventReporting, name: &str) -> Result<(), StorageError> {
        let event = NewStepEvent {
            action: NEW_STEP_ACTION,
            name,
        };
        let response = self
            .http
            .post(&target.url)
            .header(token_header(&target.token), &target.token)
            .json(&event)
            .send()
            .await
            .map_err(|e| StorageError::Backend {
                message: format!("failed to report new step {name}: {e}"),
                source: Some(Box::new(e)),
            })?;
        if !response.status().is_success() {
            return Err(StorageError::Backend {
                message: format!(
                    "event endpoint answered {} for new step {name}",
                    response.status()
                ),
                source: None,
            });
        }
        tracing::debug!(step = name, url = %target.url, "reported new step");
        Ok(())
    }

    /// Fires [`notify`](Self::notify) on the runtime without waiting.
    pub fn spawn_notify(&self, target: EventReporting, name: String) {
        let reporter = self.clone();
        tokio::spawn(async move {
            if let Err(e) = reporter.notify(&target, &name).await {
                tracing::warn!(step = %name, error = %e, "new step notification failed");
            }
        });
    }
}
