//! JSON-over-HTTP client for the `ward-api` RPC surface

use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{
    AcceptInboxResponse, CheckInboxResponse, DeclineInboxResponse, EmptyTrashRequest,
    EmptyTrashResponse, HeartbeatRequest, HeartbeatResponse, InboxActionRequest, LoadRequest,
    LoadResponse, MoveToTrashRequest, MoveToTrashResponse, PushAck, PushRequest, RejectCode,
    RemoteApi, RemoteChange, RemoteError, RemoteResult, RestoreFromTrashRequest,
    RestoreFromTrashResponse, SaveOutcome, SaveRequest, SaveResponse, SendPatientRequest,
    SendPatientResponse, Subscription,
};
use crate::models::RecordKind;
use crate::util::{compact_text, is_http_url, normalize_text_option};

/// Header carrying the account the request acts for
pub const USER_HEADER: &str = "x-ward-user";

const SUBSCRIPTION_BUFFER: usize = 8;

#[derive(Clone)]
pub struct HttpRemote {
    base_url: String,
    user: String,
    device_id: String,
    poll_interval: Duration,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpRemote {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemote")
            .field("base_url", &self.base_url)
            .field("user", &self.user)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl HttpRemote {
    /// Build a client for `base_url` (scheme required, trailing `/` ignored)
    pub fn new(
        base_url: impl Into<String>,
        user: impl Into<String>,
        device_id: impl Into<String>,
        timeout: Duration,
    ) -> RemoteResult<Self> {
        let base_url = normalize_text_option(Some(base_url.into()))
            .filter(|url| is_http_url(url))
            .ok_or_else(|| {
                RemoteError::Protocol("remote URL must include http:// or https://".to_string())
            })?
            .trim_end_matches('/')
            .to_string();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| RemoteError::Network(error.to_string()))?;
        Ok(Self {
            base_url,
            user: user.into(),
            device_id: device_id.into(),
            poll_interval: Duration::from_secs(15),
            client,
        })
    }

    /// Interval at which [`RemoteApi::subscribe`] polls for new revisions
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, rpc: &str) -> String {
        format!("{}/v1/rpc/{rpc}", self.base_url)
    }

    async fn call<Req, Resp>(&self, rpc: &str, request: &Req) -> RemoteResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let response = self
            .client
            .post(self.endpoint(rpc))
            .header(USER_HEADER, &self.user)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status_error(status, &body));
        }

        response
            .json::<Resp>()
            .await
            .map_err(|error| RemoteError::Protocol(format!("{rpc}: {error}")))
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
    code: Option<String>,
}

fn map_transport_error(error: reqwest::Error) -> RemoteError {
    if error.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Network(error.to_string())
    }
}

fn map_status_error(status: StatusCode, body: &str) -> RemoteError {
    let parsed = serde_json::from_str::<ErrorBody>(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|payload| payload.message.clone().or_else(|| payload.error.clone()))
        .unwrap_or_else(|| {
            let trimmed = compact_text(body);
            if trimmed.is_empty() {
                format!("HTTP {}", status.as_u16())
            } else {
                trimmed
            }
        });

    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        return RemoteError::Unavailable {
            status: status.as_u16(),
        };
    }

    let code = parsed
        .and_then(|payload| payload.code)
        .and_then(|code| RejectCode::parse(&code))
        .unwrap_or(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RejectCode::PermissionDenied,
            StatusCode::NOT_FOUND => RejectCode::NotFound,
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                RejectCode::FailedPrecondition
            }
            _ => RejectCode::InvalidArgument,
        });
    RemoteError::Rejected { code, message }
}

impl RemoteApi for HttpRemote {
    async fn load_data(&self, request: LoadRequest) -> RemoteResult<LoadResponse> {
        self.call("loadData", &request).await
    }

    async fn save_data(&self, request: SaveRequest) -> RemoteResult<SaveOutcome> {
        let response: SaveResponse = self.call("saveData", &request).await?;
        SaveOutcome::try_from(response)
    }

    async fn push_mutation(&self, request: PushRequest) -> RemoteResult<PushAck> {
        self.call("pushMutation", &request).await
    }

    async fn move_to_trash(&self, request: MoveToTrashRequest) -> RemoteResult<MoveToTrashResponse> {
        self.call("moveToTrash", &request).await
    }

    async fn restore_from_trash(
        &self,
        request: RestoreFromTrashRequest,
    ) -> RemoteResult<RestoreFromTrashResponse> {
        self.call("restoreFromTrash", &request).await
    }

    async fn empty_trash(&self, request: EmptyTrashRequest) -> RemoteResult<EmptyTrashResponse> {
        self.call("emptyTrash", &request).await
    }

    async fn send_patient(&self, request: SendPatientRequest) -> RemoteResult<SendPatientResponse> {
        self.call("sendPatient", &request).await
    }

    async fn check_inbox(&self) -> RemoteResult<CheckInboxResponse> {
        self.call("checkInbox", &serde_json::json!({})).await
    }

    async fn accept_inbox_patient(
        &self,
        request: InboxActionRequest,
    ) -> RemoteResult<AcceptInboxResponse> {
        self.call("acceptInboxPatient", &request).await
    }

    async fn decline_inbox_patient(
        &self,
        request: InboxActionRequest,
    ) -> RemoteResult<DeclineInboxResponse> {
        self.call("declineInboxPatient", &request).await
    }

    async fn heartbeat(&self, request: HeartbeatRequest) -> RemoteResult<HeartbeatResponse> {
        self.call("heartbeat", &request).await
    }

    /// Poll `loadData` and emit a snapshot whenever the revision moves
    fn subscribe(&self, kind: RecordKind, client_rev: u64) -> RemoteResult<Subscription> {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let remote = self.clone();
        let task = tokio::spawn(async move {
            let mut seen_rev = client_rev;
            let mut ticker = tokio::time::interval(remote.poll_interval);
            loop {
                ticker.tick().await;
                let request = LoadRequest {
                    client_rev: seen_rev,
                    device_id: remote.device_id.clone(),
                };
                let change = match remote.load_data(request).await {
                    Ok(LoadResponse {
                        data: Some(data),
                        rev,
                        up_to_date: false,
                    }) => {
                        seen_rev = rev;
                        RemoteChange::Snapshot {
                            kind,
                            records: data.records(kind),
                            rev,
                        }
                    }
                    Ok(_) => continue,
                    Err(error) => RemoteChange::Error(error),
                };
                if sender.send(change).await.is_err() {
                    break;
                }
            }
        });
        Ok(Subscription::new(kind, receiver, task))
    }
}
