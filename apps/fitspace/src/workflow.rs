use parking_lot::Mutex;
use pixelstream::session::{ConnectionState, SessionError, StreamingSession};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::auth::AuthInfo;
use crate::provision::{InstanceManager, InstanceStatus, ProvisionError};

const POLL_INTERVAL: Duration = Duration::from_secs(3);
const CONNECT_COOLDOWN: Duration = Duration::from_secs(5);

/// Drives provisioning for one signed-in identity: a single kick-off
/// request, then a background poll loop that runs only while the instance
/// is still CREATING.
pub struct ProvisioningWorkflow {
    manager: Arc<InstanceManager>,
    identity: AuthInfo,
    poll_interval: Duration,
    started: AtomicBool,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl ProvisioningWorkflow {
    pub fn new(manager: Arc<InstanceManager>, identity: AuthInfo) -> Self {
        Self::with_poll_interval(manager, identity, POLL_INTERVAL)
    }

    pub fn with_poll_interval(
        manager: Arc<InstanceManager>,
        identity: AuthInfo,
        poll_interval: Duration,
    ) -> Self {
        Self {
            manager,
            identity,
            poll_interval,
            started: AtomicBool::new(false),
            poller: Mutex::new(None),
        }
    }

    pub fn manager(&self) -> &Arc<InstanceManager> {
        &self.manager
    }

    /// Kick off provisioning exactly once. Later calls (including concurrent
    /// ones) return the current status without issuing another request. A
    /// failed kick-off re-arms the guard so the operator can retry.
    pub async fn ensure_started(&self) -> Result<InstanceStatus, ProvisionError> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!(
                target = "fitspace::workflow",
                "provisioning already started; ignoring"
            );
            return Ok(self.manager.status());
        }

        let status = match self.manager.start_provisioning(&self.identity).await {
            Ok(status) => status,
            Err(err) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        if status == InstanceStatus::Creating {
            self.spawn_poller();
        }
        Ok(status)
    }

    fn spawn_poller(&self) {
        let manager = self.manager.clone();
        let identity = self.identity.clone();
        let poll_interval = self.poll_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick of an interval completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match manager.poll_instance_status(&identity).await {
                    Ok(InstanceStatus::Creating) => continue,
                    Ok(status) => {
                        info!(
                            target = "fitspace::workflow",
                            ?status,
                            "instance left CREATING; polling stopped"
                        );
                        break;
                    }
                    Err(err) => {
                        warn!(
                            target = "fitspace::workflow",
                            error = %err,
                            "polling aborted"
                        );
                        break;
                    }
                }
            }
        });
        *self.poller.lock() = Some(handle);
    }

    /// Stop the poll loop; the stored instance state is left intact.
    pub fn shutdown(&self) {
        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for ProvisioningWorkflow {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Attempt {
    url: String,
    at: Instant,
}

/// Connects the streaming session to the instance once it is READY.
/// Re-invocations inside the cooldown window for the same URL are
/// swallowed so a flapping status feed cannot hammer the engine.
pub struct ConnectionBridge {
    session: Arc<StreamingSession>,
    manager: Arc<InstanceManager>,
    cooldown: Duration,
    last_attempt: Mutex<Option<Attempt>>,
}

impl ConnectionBridge {
    pub fn new(session: Arc<StreamingSession>, manager: Arc<InstanceManager>) -> Self {
        Self::with_cooldown(session, manager, CONNECT_COOLDOWN)
    }

    pub fn with_cooldown(
        session: Arc<StreamingSession>,
        manager: Arc<InstanceManager>,
        cooldown: Duration,
    ) -> Self {
        Self {
            session,
            manager,
            cooldown,
            last_attempt: Mutex::new(None),
        }
    }

    /// Connect if the instance is READY with a usable URL and the session
    /// is neither connecting nor connected. Returns whether a connect was
    /// actually issued.
    pub async fn maybe_connect(&self) -> Result<bool, SessionError> {
        let data = self.manager.snapshot();
        if data.status != InstanceStatus::Ready {
            return Ok(false);
        }
        let Some(url) = data.url.filter(|url| !url.trim().is_empty()) else {
            return Ok(false);
        };
        if matches!(
            self.session.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return Ok(false);
        }
        {
            let last = self.last_attempt.lock();
            if let Some(attempt) = last.as_ref() {
                if attempt.url == url && attempt.at.elapsed() < self.cooldown {
                    debug!(
                        target = "fitspace::workflow",
                        url = %url,
                        "connect suppressed by cooldown"
                    );
                    return Ok(false);
                }
            }
        }

        *self.last_attempt.lock() = Some(Attempt {
            url: url.clone(),
            at: Instant::now(),
        });
        info!(target = "fitspace::workflow", url = %url, "connecting to instance");
        self.session.connect(Some(&url)).await?;
        Ok(true)
    }

    /// Manual retry affordance: forget the cooldown window.
    pub fn reset(&self) {
        *self.last_attempt.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthInfo;
    use crate::provision::ProvisionError;
    use crate::provision::testing::*;
    use pixelstream::settings::{SettingsHandle, StreamSettings};
    use pixelstream::transport::mock::MockConnector;
    use reqwest::StatusCode;

    fn workflow_with(backend: Arc<MockProvisionBackend>) -> Arc<ProvisioningWorkflow> {
        let manager = Arc::new(manager_with(backend));
        Arc::new(ProvisioningWorkflow::with_poll_interval(
            manager,
            AuthInfo::guest(),
            Duration::from_secs(3),
        ))
    }

    #[tokio::test]
    async fn concurrent_starts_issue_one_request() {
        let backend = Arc::new(MockProvisionBackend::new());
        backend.push_create(Ok(creating("i-1", "s-1")));
        let workflow = workflow_with(backend.clone());

        let (a, b) = tokio::join!(workflow.ensure_started(), workflow.ensure_started());
        a.unwrap();
        b.unwrap();
        workflow.ensure_started().await.unwrap();

        assert_eq!(backend.create_calls(), 1);
    }

    #[tokio::test]
    async fn failed_start_rearms_the_guard() {
        let backend = Arc::new(MockProvisionBackend::new());
        backend.push_create(Err(ProvisionError::HttpStatus(
            StatusCode::INTERNAL_SERVER_ERROR,
        )));
        backend.push_create(Ok(creating("i-1", "s-1")));
        let workflow = workflow_with(backend.clone());

        workflow.ensure_started().await.unwrap_err();
        let status = workflow.ensure_started().await.unwrap();

        assert_eq!(status, InstanceStatus::Creating);
        assert_eq!(backend.create_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_runs_every_interval_until_ready() {
        let backend = Arc::new(MockProvisionBackend::new());
        backend.push_create(Ok(creating("i-1", "s-1")));
        backend.push_poll(Ok(creating("i-1", "s-1")));
        backend.push_poll(Ok(ready("i-1", "1.2.3.4", "wss://1.2.3.4/ws")));
        let workflow = workflow_with(backend.clone());

        workflow.ensure_started().await.unwrap();
        // Two ticks at 3s and 6s; the second flips to READY and stops the loop.
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(workflow.manager().status(), InstanceStatus::Ready);
        assert_eq!(backend.poll_calls(), 2);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(backend.poll_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_stops_on_hard_failure() {
        let backend = Arc::new(MockProvisionBackend::new());
        backend.push_create(Ok(creating("i-1", "s-1")));
        backend.push_poll(Err(ProvisionError::HttpStatus(
            StatusCode::INTERNAL_SERVER_ERROR,
        )));
        let workflow = workflow_with(backend.clone());

        workflow.ensure_started().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(workflow.manager().status(), InstanceStatus::Error);
        assert_eq!(backend.poll_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_502_keeps_the_loop_alive() {
        let backend = Arc::new(MockProvisionBackend::new());
        backend.push_create(Ok(creating("i-1", "s-1")));
        backend.push_poll(Err(ProvisionError::HttpStatus(StatusCode::BAD_GATEWAY)));
        backend.push_poll(Ok(ready("i-1", "1.2.3.4", "wss://1.2.3.4/ws")));
        let workflow = workflow_with(backend.clone());

        workflow.ensure_started().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(workflow.manager().status(), InstanceStatus::Ready);
        assert_eq!(backend.poll_calls(), 2);
    }

    async fn ready_manager() -> Arc<InstanceManager> {
        let backend = Arc::new(MockProvisionBackend::new());
        backend.push_create(Ok(ready("i-1", "1.2.3.4", "wss://1.2.3.4/ws")));
        let manager = Arc::new(manager_with(backend));
        manager.start_provisioning(&AuthInfo::guest()).await.unwrap();
        manager
    }

    fn session_with(connector: Arc<MockConnector>) -> Arc<StreamingSession> {
        Arc::new(StreamingSession::new(
            connector,
            SettingsHandle::new(StreamSettings::default()),
        ))
    }

    #[tokio::test]
    async fn bridge_skips_until_instance_is_ready() {
        let backend = Arc::new(MockProvisionBackend::new());
        backend.push_create(Ok(creating("i-1", "s-1")));
        let manager = Arc::new(manager_with(backend));
        manager.start_provisioning(&AuthInfo::guest()).await.unwrap();
        let connector = Arc::new(MockConnector::new());
        let bridge = ConnectionBridge::new(session_with(connector.clone()), manager);

        assert!(!bridge.maybe_connect().await.unwrap());
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn bridge_connects_once_ready() {
        let manager = ready_manager().await;
        let connector = Arc::new(MockConnector::new());
        let session = session_with(connector.clone());
        let bridge = ConnectionBridge::new(session.clone(), manager);

        assert!(bridge.maybe_connect().await.unwrap());
        assert_eq!(connector.connect_count(), 1);
        assert_eq!(session.state(), ConnectionState::Connecting);

        // Already connecting: skipped regardless of cooldown.
        assert!(!bridge.maybe_connect().await.unwrap());
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_suppresses_rapid_reattempts() {
        let manager = ready_manager().await;
        let connector = Arc::new(MockConnector::new());
        let session = session_with(connector.clone());
        let bridge =
            ConnectionBridge::with_cooldown(session.clone(), manager, Duration::from_secs(5));

        assert!(bridge.maybe_connect().await.unwrap());
        session.disconnect().await;

        // Same URL inside the window: suppressed.
        assert!(!bridge.maybe_connect().await.unwrap());
        assert_eq!(connector.connect_count(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(bridge.maybe_connect().await.unwrap());
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_the_cooldown_window() {
        let manager = ready_manager().await;
        let connector = Arc::new(MockConnector::new());
        let session = session_with(connector.clone());
        let bridge =
            ConnectionBridge::with_cooldown(session.clone(), manager, Duration::from_secs(5));

        assert!(bridge.maybe_connect().await.unwrap());
        session.disconnect().await;
        assert!(!bridge.maybe_connect().await.unwrap());

        bridge.reset();
        assert!(bridge.maybe_connect().await.unwrap());
        assert_eq!(connector.connect_count(), 2);
    }
}
