use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};
use url::Url;

use crate::auth::{AuthError, AuthInfo};
use crate::trace::DebugTrace;

/// Where the provisioning endpoints live.
#[derive(Clone, Debug)]
pub struct ProvisionConfig {
    base_url: Url,
}

impl ProvisionConfig {
    pub fn new(base_url: Url) -> Self {
        Self { base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

/// Lifecycle of the remote rendering instance assigned to this user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Idle,
    Creating,
    Ready,
    Error,
}

#[derive(Debug, Clone)]
pub struct InstanceData {
    pub status: InstanceStatus,
    pub instance_id: Option<String>,
    pub session_id: Option<String>,
    pub public_ip: Option<String>,
    pub url: Option<String>,
    pub last_updated: OffsetDateTime,
}

impl Default for InstanceData {
    fn default() -> Self {
        Self {
            status: InstanceStatus::Idle,
            instance_id: None,
            session_id: None,
            public_ip: None,
            url: None,
            last_updated: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("authentication required: {0}")]
    Auth(#[from] AuthError),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("invalid provisioning endpoint: {0}")]
    InvalidConfig(String),
}

/// Obtains and tracks the address of a remote rendering instance for the
/// current user. One per signed-in identity; UI consumers read snapshots.
pub struct InstanceManager {
    config: Arc<ProvisionConfig>,
    backend: Arc<dyn ProvisionBackend>,
    state: Mutex<ManagerState>,
    trace: DebugTrace,
}

#[derive(Default)]
struct ManagerState {
    data: InstanceData,
    error: Option<String>,
}

impl InstanceManager {
    pub fn new(config: ProvisionConfig) -> Result<Self, ProvisionError> {
        let backend = Arc::new(ReqwestProvisionBackend::new()?);
        Ok(Self::with_backend(config, backend))
    }

    pub(crate) fn with_backend(config: ProvisionConfig, backend: Arc<dyn ProvisionBackend>) -> Self {
        Self {
            config: Arc::new(config),
            backend,
            state: Mutex::new(ManagerState::default()),
            trace: DebugTrace::default(),
        }
    }

    pub fn snapshot(&self) -> InstanceData {
        self.state.lock().data.clone()
    }

    pub fn status(&self) -> InstanceStatus {
        self.state.lock().data.status
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    pub fn trace(&self) -> &DebugTrace {
        &self.trace
    }

    /// Request an instance for this identity. One shot, no automatic retry:
    /// a failure is surfaced to the caller for an explicit retry affordance,
    /// and a CREATING result is advanced by the polling loop.
    pub async fn start_provisioning(
        &self,
        identity: &AuthInfo,
    ) -> Result<InstanceStatus, ProvisionError> {
        let (user_id, session_id) = identity.require_authenticated()?;
        let request = InstanceRequest {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
        };
        self.trace
            .push(format!("provisioning requested for {user_id}"));

        match self
            .backend
            .request_instance(self.config.base_url(), &request)
            .await
        {
            Ok(response) => {
                self.apply_initial(response)?;
                Ok(self.status())
            }
            Err(err) => {
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    /// Advance a CREATING instance. No-ops (without any network request)
    /// unless the instance is still CREATING and the identity is
    /// authenticated. A 502 is the backing compute layer still warming up:
    /// no state change, no error, the next tick retries.
    pub async fn poll_instance_status(
        &self,
        identity: &AuthInfo,
    ) -> Result<InstanceStatus, ProvisionError> {
        if self.status() != InstanceStatus::Creating || !identity.is_authenticated {
            return Ok(self.status());
        }
        let (user_id, session_id) = identity.require_authenticated()?;
        let request = InstanceRequest {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
        };

        match self
            .backend
            .poll_instance(self.config.base_url(), &request)
            .await
        {
            Ok(response) => {
                self.apply_poll(response)?;
                Ok(self.status())
            }
            Err(ProvisionError::HttpStatus(StatusCode::BAD_GATEWAY)) => {
                info!(
                    target = "fitspace::provision",
                    "502 from provisioning backend; instance still warming up"
                );
                self.trace.push("poll hit 502; retrying on next tick");
                Ok(InstanceStatus::Creating)
            }
            Err(err) => {
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    /// Forget the current instance (logout or retry-from-scratch).
    pub fn clear_instance(&self) {
        let mut state = self.state.lock();
        state.data = InstanceData::default();
        state.error = None;
        drop(state);
        self.trace.push("instance cleared");
    }

    fn apply_initial(&self, response: InstanceResponse) -> Result<(), ProvisionError> {
        let mut state = self.state.lock();
        state.error = None;
        state.data.last_updated = OffsetDateTime::now_utc();
        state.data.instance_id = response.instance_id.clone();
        state.data.session_id = response.session_id.clone();
        match response.status {
            WireStatus::Creating => {
                state.data.status = InstanceStatus::Creating;
                drop(state);
                self.trace.push(format!(
                    "instance {} creating",
                    response.instance_id.as_deref().unwrap_or("<unassigned>")
                ));
                Ok(())
            }
            WireStatus::Ready => {
                let url = non_empty(response.url.clone()).ok_or_else(|| {
                    state.data.status = InstanceStatus::Error;
                    state.error = Some("READY response without a streaming url".into());
                    ProvisionError::InvalidResponse("READY response without a streaming url".into())
                })?;
                state.data.status = InstanceStatus::Ready;
                state.data.public_ip = response.public_ip.clone();
                state.data.url = Some(url.clone());
                drop(state);
                self.trace.push(format!("instance ready at {url}"));
                Ok(())
            }
        }
    }

    fn apply_poll(&self, response: InstanceResponse) -> Result<(), ProvisionError> {
        let mut state = self.state.lock();
        state.data.last_updated = OffsetDateTime::now_utc();

        // Guard against a backend racing up a second instance for the same
        // user: the originally assigned id stays authoritative.
        if let (Some(stored), Some(reported)) = (
            state.data.instance_id.as_deref(),
            response.instance_id.as_deref(),
        ) {
            if stored != reported {
                warn!(
                    target = "fitspace::provision",
                    stored, reported, "poll reported a different instance id; keeping original"
                );
                self.trace.push(format!(
                    "instance id mismatch: kept {stored}, server reported {reported}"
                ));
            }
        }

        match response.status {
            // Still creating: only the timestamp refreshes.
            WireStatus::Creating => Ok(()),
            WireStatus::Ready => {
                let url = non_empty(response.url.clone()).ok_or_else(|| {
                    state.data.status = InstanceStatus::Error;
                    state.error = Some("READY response without a streaming url".into());
                    ProvisionError::InvalidResponse("READY response without a streaming url".into())
                })?;
                state.data.status = InstanceStatus::Ready;
                state.data.public_ip = response.public_ip.clone();
                state.data.url = Some(url.clone());
                if state.data.session_id.is_none() {
                    state.data.session_id = response.session_id.clone();
                }
                drop(state);
                self.trace.push(format!("instance ready at {url}"));
                Ok(())
            }
        }
    }

    fn record_failure(&self, err: &ProvisionError) {
        let message = err.to_string();
        let mut state = self.state.lock();
        state.data.status = InstanceStatus::Error;
        state.data.last_updated = OffsetDateTime::now_utc();
        state.error = Some(message.clone());
        drop(state);
        self.trace.push(format!("provisioning failed: {message}"));
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InstanceRequest {
    user_id: String,
    session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InstanceResponse {
    status: WireStatus,
    #[serde(default)]
    instance_id: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    public_ip: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
pub(crate) enum WireStatus {
    #[serde(rename = "CREATING")]
    Creating,
    #[serde(rename = "READY")]
    Ready,
}

#[async_trait]
pub(crate) trait ProvisionBackend: Send + Sync {
    async fn request_instance(
        &self,
        base_url: &Url,
        request: &InstanceRequest,
    ) -> Result<InstanceResponse, ProvisionError>;

    async fn poll_instance(
        &self,
        base_url: &Url,
        request: &InstanceRequest,
    ) -> Result<InstanceResponse, ProvisionError>;
}

pub(crate) struct ReqwestProvisionBackend {
    client: reqwest::Client,
}

impl ReqwestProvisionBackend {
    pub(crate) fn new() -> Result<Self, ProvisionError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }

    async fn post(
        &self,
        base_url: &Url,
        path: &str,
        request: &InstanceRequest,
    ) -> Result<InstanceResponse, ProvisionError> {
        let endpoint = base_url.join(path).map_err(|err| {
            ProvisionError::InvalidConfig(format!("invalid endpoint {path}: {err}"))
        })?;
        let response = self.client.post(endpoint).json(request).send().await?;
        if !response.status().is_success() {
            return Err(ProvisionError::HttpStatus(response.status()));
        }
        let payload = response.json::<InstanceResponse>().await?;
        Ok(payload)
    }
}

#[async_trait]
impl ProvisionBackend for ReqwestProvisionBackend {
    async fn request_instance(
        &self,
        base_url: &Url,
        request: &InstanceRequest,
    ) -> Result<InstanceResponse, ProvisionError> {
        self.post(base_url, "instances", request).await
    }

    async fn poll_instance(
        &self,
        base_url: &Url,
        request: &InstanceRequest,
    ) -> Result<InstanceResponse, ProvisionError> {
        self.post(base_url, "instances/status", request).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn creating(instance_id: &str, session_id: &str) -> InstanceResponse {
        InstanceResponse {
            status: WireStatus::Creating,
            instance_id: Some(instance_id.to_string()),
            session_id: Some(session_id.to_string()),
            public_ip: None,
            url: None,
        }
    }

    pub(crate) fn ready(instance_id: &str, public_ip: &str, url: &str) -> InstanceResponse {
        InstanceResponse {
            status: WireStatus::Ready,
            instance_id: Some(instance_id.to_string()),
            session_id: None,
            public_ip: Some(public_ip.to_string()),
            url: Some(url.to_string()),
        }
    }

    pub(crate) fn ready_without_url(instance_id: &str) -> InstanceResponse {
        InstanceResponse {
            status: WireStatus::Ready,
            instance_id: Some(instance_id.to_string()),
            session_id: None,
            public_ip: None,
            url: None,
        }
    }

    #[derive(Default)]
    pub(crate) struct MockProvisionBackend {
        create_responses: Mutex<VecDeque<Result<InstanceResponse, ProvisionError>>>,
        poll_responses: Mutex<VecDeque<Result<InstanceResponse, ProvisionError>>>,
        create_calls: AtomicUsize,
        poll_calls: AtomicUsize,
    }

    impl MockProvisionBackend {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn push_create(&self, response: Result<InstanceResponse, ProvisionError>) {
            self.create_responses.lock().push_back(response);
        }

        pub(crate) fn push_poll(&self, response: Result<InstanceResponse, ProvisionError>) {
            self.poll_responses.lock().push_back(response);
        }

        pub(crate) fn create_calls(&self) -> usize {
            self.create_calls.load(Ordering::SeqCst)
        }

        pub(crate) fn poll_calls(&self) -> usize {
            self.poll_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProvisionBackend for MockProvisionBackend {
        async fn request_instance(
            &self,
            _base_url: &Url,
            _request: &InstanceRequest,
        ) -> Result<InstanceResponse, ProvisionError> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            self.create_responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(ProvisionError::InvalidResponse("no scripted response".into())))
        }

        async fn poll_instance(
            &self,
            _base_url: &Url,
            _request: &InstanceRequest,
        ) -> Result<InstanceResponse, ProvisionError> {
            self.poll_calls.fetch_add(1, Ordering::SeqCst);
            self.poll_responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(ProvisionError::InvalidResponse("no scripted response".into())))
        }
    }

    pub(crate) fn manager_with(backend: Arc<MockProvisionBackend>) -> InstanceManager {
        let config = ProvisionConfig::new(Url::parse("http://provision.test").unwrap());
        InstanceManager::with_backend(config, backend)
    }
}
