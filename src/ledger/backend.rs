use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::UploadBatch;
use crate::error::{ApiErrorCode, BackendError};
use crate::offline::SessionValue;

const UPLOAD_ENDPOINT: &str = "upload/";
const RESTORE_ENDPOINT: &str = "restore/";
const CONFIRM_RESTORE_ENDPOINT: &str = "restore/confirm/";

/// Upload and key-restore operations on the lock backend.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    /// Uploads all batches in one request.
    async fn upload(&self, batches: &[UploadBatch]) -> Result<(), BackendError>;

    /// Fetches the `+`-delimited restore command string for a session.
    async fn restore(&self, session: &SessionValue, mac: &str) -> Result<String, BackendError>;

    async fn confirm_restore(&self, command_id: u8, mac: &str) -> Result<(), BackendError>;
}

/// Which backend deployment to talk to.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub enum ApiEnvironment {
    Sandbox,
    Production,
    #[default]
    Develop,
    /// Self-hosted backend rooted at the given URL.
    Custom(String),
}

impl ApiEnvironment {
    fn base_url(&self) -> Result<String, BackendError> {
        let url = match self {
            Self::Sandbox => "https://coreapi-sandbox.appspot.com/",
            Self::Production => "https://coreapi-beta.appspot.com/",
            Self::Develop => "https://lock-api-dev.appspot.com/",
            Self::Custom(url) => url.as_str(),
        };
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(BackendError::InvalidUrl {
                url: url.to_string(),
            });
        }
        Ok(format!("{}/", url.trim_end_matches('/')))
    }
}

/// Settings for the HTTP backend.
#[derive(Debug, Clone, Builder)]
pub struct BackendConfig {
    #[builder(default)]
    environment: ApiEnvironment,
    /// Bearer token issued for the mobile API.
    #[builder(into)]
    api_key: String,
    #[builder(default = Duration::from_secs(30))]
    request_timeout: Duration,
}

/// JSON-over-HTTPS backend client.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct UploadRequest<'a> {
    logs: &'a [UploadBatch],
}

#[derive(Debug, Serialize)]
struct RestoreRequest<'a> {
    session: &'a SessionValue,
    mac: &'a str,
}

#[derive(Debug, Serialize)]
struct ConfirmRestoreRequest<'a> {
    command_id: u8,
    mac: &'a str,
}

#[derive(Debug, Deserialize)]
struct RestoreData {
    commands: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    #[serde(default)]
    error_code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

impl<T> ApiResponse<T> {
    fn into_result(self) -> Result<Option<T>, BackendError> {
        if self.error_code == 0 {
            return Ok(self.data);
        }
        let message = if self.message.is_empty() {
            ApiErrorCode::from_repr(self.error_code)
                .unwrap_or(ApiErrorCode::Unknown)
                .to_string()
        } else {
            self.message
        };
        Err(BackendError::Api {
            code: self.error_code,
            message,
        })
    }
}

impl HttpBackend {
    /// Builds a client for the configured environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is not HTTP(S) or the HTTP client
    /// cannot be constructed.
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let base_url = config.environment.base_url()?;
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            client,
            base_url,
            api_key: config.api_key,
        })
    }

    async fn post<B, T>(&self, endpoint: &str, body: &B) -> Result<Option<T>, BackendError>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{endpoint}", self.base_url);
        debug!(%url, "posting to backend");
        let response: ApiResponse<T> = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?
            .json()
            .await?;
        response.into_result()
    }
}

#[async_trait]
impl LedgerBackend for HttpBackend {
    #[instrument(skip_all, level = "debug", fields(batches = batches.len()))]
    async fn upload(&self, batches: &[UploadBatch]) -> Result<(), BackendError> {
        self.post::<_, serde_json::Value>(UPLOAD_ENDPOINT, &UploadRequest { logs: batches })
            .await?;
        Ok(())
    }

    #[instrument(skip(self, session), level = "debug")]
    async fn restore(&self, session: &SessionValue, mac: &str) -> Result<String, BackendError> {
        let data: Option<RestoreData> = self
            .post(RESTORE_ENDPOINT, &RestoreRequest { session, mac })
            .await?;
        data.and_then(|data| data.commands)
            .filter(|commands| !commands.is_empty())
            .ok_or(BackendError::MissingCommands)
    }

    #[instrument(skip(self), level = "debug")]
    async fn confirm_restore(&self, command_id: u8, mac: &str) -> Result<(), BackendError> {
        self.post::<_, serde_json::Value>(
            CONFIRM_RESTORE_ENDPOINT,
            &ConfirmRestoreRequest { command_id, mac },
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(ApiEnvironment::Sandbox, "https://coreapi-sandbox.appspot.com/")]
    #[case(ApiEnvironment::Production, "https://coreapi-beta.appspot.com/")]
    #[case(ApiEnvironment::Develop, "https://lock-api-dev.appspot.com/")]
    #[case(
        ApiEnvironment::Custom("https://locks.example.com/api".to_string()),
        "https://locks.example.com/api/"
    )]
    fn environments_resolve_base_urls(#[case] environment: ApiEnvironment, #[case] expected: &str) {
        assert_eq!(
            expected,
            environment.base_url().expect("base URL should resolve")
        );
    }

    #[test]
    fn custom_environment_requires_http_scheme() {
        let result = ApiEnvironment::Custom("locks.example.com".to_string()).base_url();
        assert_matches!(result, Err(BackendError::InvalidUrl { .. }));
    }

    #[test]
    fn zero_error_code_is_success() {
        let response: ApiResponse<RestoreData> = serde_json::from_str(
            r#"{"error_code":0,"message":"ok","data":{"commands":"aa+bb"}}"#,
        )
        .expect("response should parse");

        let data = response
            .into_result()
            .expect("response should succeed")
            .expect("data should be present");
        assert_eq!(Some("aa+bb".to_string()), data.commands);
    }

    #[test]
    fn non_zero_error_code_keeps_backend_message() {
        let response: ApiResponse<serde_json::Value> =
            serde_json::from_str(r#"{"error_code":7,"message":"bad session"}"#)
                .expect("response should parse");

        assert_matches!(
            response.into_result(),
            Err(BackendError::Api { code: 7, message }) if message == "bad session"
        );
    }

    #[test]
    fn missing_message_falls_back_to_code_description() {
        let response: ApiResponse<serde_json::Value> =
            serde_json::from_str(r#"{"error_code":2}"#).expect("response should parse");

        assert_matches!(
            response.into_result(),
            Err(BackendError::Api { code: 2, message }) if message == "invalid API key"
        );
    }

    #[test]
    fn upload_request_wraps_batches_in_logs() {
        let batch = UploadBatch {
            session: SessionValue::new([0x01; 20]),
            responses: vec!["50".repeat(20)],
            mac: "AA:BB:CC:DD:EE:FF".to_string(),
            received_time: 1_700_000_000,
        };

        let json = serde_json::to_value(UploadRequest {
            logs: std::slice::from_ref(&batch),
        })
        .expect("request should serialise");

        assert_eq!(
            serde_json::json!({
                "logs": [{
                    "session": "01".repeat(20),
                    "responses": ["50".repeat(20)],
                    "mac": "AA:BB:CC:DD:EE:FF",
                    "received_time": 1_700_000_000,
                }]
            }),
            json
        );
    }
}
