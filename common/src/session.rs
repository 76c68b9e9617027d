use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use log::{info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::{
    attributes::SHARED_ATTRIBUTE_KEYS,
    config::{CloudConfig, NetworkConfig, SessionConfig, SessionRecovery, TaskTimings},
    hal::NetworkDiagnostics,
    topics::{
        attribute_request_topic, TOPIC_ATTRIBUTES, TOPIC_ATTRIBUTE_RESPONSE_FILTER,
        TOPIC_RPC_REQUEST_FILTER, TOPIC_TELEMETRY,
    },
    types::{IdentityAttributes, SharedAttributeRequest},
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect to {server}:{port}: {reason}")]
    Connect {
        server: String,
        port: u16,
        reason: String,
    },
    #[error("session not connected, dropping publish to `{topic}`")]
    NotConnected { topic: String },
    #[error("subscribe to `{topic}` failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("publish to `{topic}` failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
#[error("link establishment failed: {0}")]
pub struct LinkError(pub String);

/// Publish/subscribe transport to the cloud service.
pub trait CloudSession: Send + Sync {
    fn connect(&self, cloud: &CloudConfig) -> Result<(), SessionError>;
    fn disconnect(&self);
    fn is_connected(&self) -> bool;
    fn subscribe(&self, topic_filter: &str) -> Result<(), SessionError>;
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SessionError>;
}

pub trait Link: Send + Sync {
    fn is_up(&self) -> bool;
    fn establish(&self, network: &NetworkConfig) -> Result<(), LinkError>;
    fn diagnostics(&self) -> NetworkDiagnostics;
    fn mac_address(&self) -> String;
}

pub struct CloudClient<S> {
    session: S,
    next_request_id: AtomicU32,
}

impl<S: CloudSession> CloudClient<S> {
    pub fn new(session: S) -> Self {
        Self {
            session,
            next_request_id: AtomicU32::new(1),
        }
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn send_telemetry<T: Serialize>(&self, payload: &T) -> Result<(), SessionError> {
        self.publish_json(TOPIC_TELEMETRY, payload)
    }

    pub fn send_attributes<T: Serialize>(&self, payload: &T) -> Result<(), SessionError> {
        self.publish_json(TOPIC_ATTRIBUTES, payload)
    }

    pub fn subscribe_rpc(&self) -> Result<(), SessionError> {
        self.session.subscribe(TOPIC_RPC_REQUEST_FILTER)
    }

    pub fn subscribe_shared_attributes(&self) -> Result<(), SessionError> {
        self.session.subscribe(TOPIC_ATTRIBUTES)
    }

    pub fn request_shared_attributes(&self, keys: &[&str]) -> Result<(), SessionError> {
        self.session.subscribe(TOPIC_ATTRIBUTE_RESPONSE_FILTER)?;
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.publish_json(
            &attribute_request_topic(request_id),
            &SharedAttributeRequest::for_keys(keys),
        )
    }

    pub fn publish_raw(&self, topic: &str, payload: Vec<u8>) -> Result<(), SessionError> {
        if !self.session.is_connected() {
            return Err(SessionError::NotConnected {
                topic: topic.to_string(),
            });
        }
        self.session.publish(topic, payload)
    }

    fn publish_json<T: Serialize>(&self, topic: &str, payload: &T) -> Result<(), SessionError> {
        let body = serde_json::to_vec(payload)?;
        self.publish_raw(topic, body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCheck {
    Up,
    Restored,
    Down,
}

impl LinkCheck {
    pub fn next_delay_ms(self, timings: &TaskTimings) -> u64 {
        match self {
            LinkCheck::Down => timings.link_retry_ms,
            LinkCheck::Up | LinkCheck::Restored => timings.link_check_ms,
        }
    }
}

/// Link-check worker: fixed retry period, no backoff or attempt limit.
pub struct LinkSupervisor<L> {
    link: Arc<L>,
    network: NetworkConfig,
    failed_attempts: u32,
}

impl<L: Link> LinkSupervisor<L> {
    pub fn new(link: Arc<L>, network: NetworkConfig) -> Self {
        Self {
            link,
            network,
            failed_attempts: 0,
        }
    }

    pub fn check(&mut self) -> LinkCheck {
        if self.link.is_up() {
            return LinkCheck::Up;
        }

        if self.failed_attempts == 0 {
            warn!("link to `{}` is down, reconnecting", self.network.wifi_ssid);
        }

        match self.link.establish(&self.network) {
            Ok(()) => {
                info!(
                    "link to `{}` established after {} failed attempt(s)",
                    self.network.wifi_ssid, self.failed_attempts
                );
                self.failed_attempts = 0;
                LinkCheck::Restored
            }
            Err(err) => {
                self.failed_attempts = self.failed_attempts.saturating_add(1);
                warn!("{err}");
                LinkCheck::Down
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    initial_ms: u64,
    max_ms: u64,
    next_ms: u64,
}

impl Backoff {
    pub fn new(initial_ms: u64, max_ms: u64) -> Self {
        Self {
            initial_ms,
            max_ms,
            next_ms: initial_ms,
        }
    }

    pub fn next_delay_ms(&mut self) -> u64 {
        let delay = self.next_ms;
        self.next_ms = self.next_ms.saturating_mul(2).min(self.max_ms);
        delay
    }

    pub fn reset(&mut self) {
        self.next_ms = self.initial_ms;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStep {
    Connect,
    SubscribeRpc,
    SubscribeAttributes,
    RequestAttributes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCheck {
    Connected,
    Established,
    Waiting { retry_in_ms: u64 },
    Failed { step: SetupStep, retry_in_ms: u64 },
    /// The worker must stop.
    Abandoned { step: SetupStep },
}

/// Re-runs the full setup sequence whenever the session is down.
pub struct SessionSupervisor<S, L> {
    cloud: Arc<CloudClient<S>>,
    link: Arc<L>,
    config: CloudConfig,
    recovery: SessionRecovery,
    backoff: Backoff,
    retry_at_ms: Option<u64>,
}

impl<S: CloudSession, L: Link> SessionSupervisor<S, L> {
    pub fn new(
        cloud: Arc<CloudClient<S>>,
        link: Arc<L>,
        config: CloudConfig,
        session: &SessionConfig,
    ) -> Self {
        Self {
            cloud,
            link,
            config,
            recovery: session.recovery,
            backoff: Backoff::new(session.initial_backoff_ms, session.max_backoff_ms),
            retry_at_ms: None,
        }
    }

    pub fn check(&mut self, now_ms: u64) -> SessionCheck {
        if self.cloud.session().is_connected() {
            return SessionCheck::Connected;
        }

        if let Some(retry_at_ms) = self.retry_at_ms {
            if now_ms < retry_at_ms {
                return SessionCheck::Waiting {
                    retry_in_ms: retry_at_ms - now_ms,
                };
            }
        }

        match self.establish() {
            Ok(()) => {
                info!("cloud session established");
                self.backoff.reset();
                self.retry_at_ms = None;
                SessionCheck::Established
            }
            Err((step, err)) => {
                warn!("session setup failed at {step:?}: {err}");
                self.cloud.session().disconnect();
                match self.recovery {
                    SessionRecovery::Abandon => {
                        warn!("session worker stopping; cloud connectivity needs a restart");
                        SessionCheck::Abandoned { step }
                    }
                    SessionRecovery::Backoff => {
                        let retry_in_ms = self.backoff.next_delay_ms();
                        self.retry_at_ms = Some(now_ms.saturating_add(retry_in_ms));
                        SessionCheck::Failed { step, retry_in_ms }
                    }
                }
            }
        }
    }

    fn establish(&self) -> Result<(), (SetupStep, SessionError)> {
        info!("connecting to {}:{}", self.config.server, self.config.port);
        self.cloud
            .session()
            .connect(&self.config)
            .map_err(|err| (SetupStep::Connect, err))?;

        let identity = IdentityAttributes {
            mac_address: self.link.mac_address(),
        };
        if let Err(err) = self.cloud.send_attributes(&identity) {
            warn!("identity attribute publish failed: {err}");
        }

        self.cloud
            .subscribe_rpc()
            .map_err(|err| (SetupStep::SubscribeRpc, err))?;
        self.cloud
            .subscribe_shared_attributes()
            .map_err(|err| (SetupStep::SubscribeAttributes, err))?;
        self.cloud
            .request_shared_attributes(&SHARED_ATTRIBUTE_KEYS)
            .map_err(|err| (SetupStep::RequestAttributes, err))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::{
        testing::{FakeLink, RecordingSession},
        topics::TOPIC_ATTRIBUTE_REQUEST_PREFIX,
    };

    fn supervisor(
        recovery: SessionRecovery,
    ) -> (
        SessionSupervisor<RecordingSession, FakeLink>,
        Arc<CloudClient<RecordingSession>>,
    ) {
        let cloud = Arc::new(CloudClient::new(RecordingSession::default()));
        let session = SessionConfig {
            recovery,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 4_000,
        };
        let supervisor = SessionSupervisor::new(
            cloud.clone(),
            Arc::new(FakeLink::up()),
            CloudConfig::default(),
            &session,
        );
        (supervisor, cloud)
    }

    #[test]
    fn setup_runs_every_step_once_per_connection() {
        let (mut supervisor, cloud) = supervisor(SessionRecovery::Backoff);

        assert_eq!(supervisor.check(0), SessionCheck::Established);
        assert_eq!(supervisor.check(1_000), SessionCheck::Connected);
        assert_eq!(supervisor.check(2_000), SessionCheck::Connected);

        let session = cloud.session();
        assert_eq!(session.connects.load(Ordering::SeqCst), 1);
        assert_eq!(
            *session.subscriptions.lock().unwrap(),
            vec![
                TOPIC_RPC_REQUEST_FILTER.to_string(),
                TOPIC_ATTRIBUTES.to_string(),
                TOPIC_ATTRIBUTE_RESPONSE_FILTER.to_string(),
            ]
        );
        assert_eq!(
            session.published_on(TOPIC_ATTRIBUTES),
            vec![json!({ "macAddress": "24:0A:C4:00:01:FF" })]
        );
        assert_eq!(
            session.published_on(&format!("{TOPIC_ATTRIBUTE_REQUEST_PREFIX}1")),
            vec![json!({ "sharedKeys": "ledState,blinkingInterval" })]
        );
    }

    #[test]
    fn reconnect_repeats_subscriptions() {
        let (mut supervisor, cloud) = supervisor(SessionRecovery::Backoff);
        assert_eq!(supervisor.check(0), SessionCheck::Established);

        cloud.session().set_connected(false);
        assert_eq!(supervisor.check(1_000), SessionCheck::Established);

        let session = cloud.session();
        assert_eq!(session.connects.load(Ordering::SeqCst), 2);
        assert_eq!(session.subscriptions.lock().unwrap().len(), 6);
        assert_eq!(
            session
                .published_on(&format!("{TOPIC_ATTRIBUTE_REQUEST_PREFIX}2"))
                .len(),
            1
        );
    }

    #[test]
    fn abandon_policy_stops_on_first_failure() {
        let (mut supervisor, cloud) = supervisor(SessionRecovery::Abandon);
        cloud.session().fail_topic(Some(TOPIC_RPC_REQUEST_FILTER));

        assert_eq!(
            supervisor.check(0),
            SessionCheck::Abandoned {
                step: SetupStep::SubscribeRpc
            }
        );
        assert!(!cloud.session().is_connected());
    }

    #[test]
    fn backoff_policy_retries_with_growing_delay() {
        let (mut supervisor, cloud) = supervisor(SessionRecovery::Backoff);
        cloud.session().refuse_connect(true);

        assert_eq!(
            supervisor.check(0),
            SessionCheck::Failed {
                step: SetupStep::Connect,
                retry_in_ms: 1_000
            }
        );
        assert_eq!(
            supervisor.check(400),
            SessionCheck::Waiting { retry_in_ms: 600 }
        );
        assert_eq!(
            supervisor.check(1_000),
            SessionCheck::Failed {
                step: SetupStep::Connect,
                retry_in_ms: 2_000
            }
        );
        assert_eq!(
            supervisor.check(3_000),
            SessionCheck::Failed {
                step: SetupStep::Connect,
                retry_in_ms: 4_000
            }
        );
        assert_eq!(
            supervisor.check(7_000),
            SessionCheck::Failed {
                step: SetupStep::Connect,
                retry_in_ms: 4_000
            }
        );

        cloud.session().refuse_connect(false);
        assert_eq!(supervisor.check(11_000), SessionCheck::Established);
        assert_eq!(cloud.session().connects.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn failed_request_tears_down_partial_session() {
        let (mut supervisor, cloud) = supervisor(SessionRecovery::Backoff);
        cloud.session().fail_topic(Some(TOPIC_ATTRIBUTE_RESPONSE_FILTER));

        assert_eq!(
            supervisor.check(0),
            SessionCheck::Failed {
                step: SetupStep::RequestAttributes,
                retry_in_ms: 1_000
            }
        );
        assert_eq!(cloud.session().disconnects.load(Ordering::SeqCst), 1);
        assert!(!cloud.session().is_connected());
    }

    #[test]
    fn identity_publish_failure_does_not_abort_setup() {
        let (mut supervisor, cloud) = supervisor(SessionRecovery::Abandon);
        cloud.session().fail_topic(Some(TOPIC_ATTRIBUTES));

        // The shared attribute subscription shares the topic, so it fails next.
        assert_eq!(
            supervisor.check(0),
            SessionCheck::Abandoned {
                step: SetupStep::SubscribeAttributes
            }
        );
        assert_eq!(
            *cloud.session().subscriptions.lock().unwrap(),
            vec![TOPIC_RPC_REQUEST_FILTER.to_string()]
        );
    }

    #[test]
    fn publishing_while_disconnected_is_refused() {
        let cloud = CloudClient::new(RecordingSession::default());
        let err = cloud.send_telemetry(&json!({ "light": 1.0 })).unwrap_err();
        assert!(matches!(err, SessionError::NotConnected { .. }));
        assert!(cloud.session().published.lock().unwrap().is_empty());
    }

    #[test]
    fn link_supervisor_retries_until_up() {
        let link = Arc::new(FakeLink::default());
        link.establish_failures.store(2, Ordering::SeqCst);
        let mut supervisor = LinkSupervisor::new(
            link.clone(),
            NetworkConfig {
                wifi_ssid: "lab".to_string(),
                wifi_pass: "secret".to_string(),
            },
        );

        assert_eq!(supervisor.check(), LinkCheck::Down);
        assert_eq!(supervisor.check(), LinkCheck::Down);
        assert_eq!(supervisor.check(), LinkCheck::Restored);
        assert_eq!(supervisor.check(), LinkCheck::Up);
        assert_eq!(link.establish_calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn down_link_is_rechecked_on_the_retry_period() {
        let timings = TaskTimings::default();
        assert_eq!(LinkCheck::Down.next_delay_ms(&timings), 500);
        assert_eq!(LinkCheck::Restored.next_delay_ms(&timings), 30_000);
        assert_eq!(LinkCheck::Up.next_delay_ms(&timings), 30_000);
    }

    #[test]
    fn backoff_resets_to_initial_delay() {
        let mut backoff = Backoff::new(100, 250);
        assert_eq!(backoff.next_delay_ms(), 100);
        assert_eq!(backoff.next_delay_ms(), 200);
        assert_eq!(backoff.next_delay_ms(), 250);
        backoff.reset();
        assert_eq!(backoff.next_delay_ms(), 100);
    }
}
