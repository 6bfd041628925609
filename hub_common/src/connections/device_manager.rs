//! # Connection Resilience Manager
//!
//! Owns the single session to the device proxy. Callers never see the
//! session itself; they call [`ConnectionResilienceManager::read_state`] and
//! [`ConnectionResilienceManager::write_state`], which connect on demand.
//!
//! ## Core Components:
//!
//! - **Fast path**: an atomic liveness hint checked without taking any lock.
//!   It may be stale; a stale hint costs one failed call, never a wrong value.
//!
//! - **Connect section**: an async mutex around the session slot. Exactly one
//!   task connects at a time and every waiter re-checks liveness once it gets
//!   in, so concurrent callers trigger one connect, not many.
//!
//! - **Retry task**: at most one background task per manager, started after a
//!   failed connect or a lost session. It sleeps the reconnect interval, tries
//!   again and exits on success or cancellation. It runs under a child of the
//!   manager's shutdown token, never under the token of the call that spawned it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::device_source::DeviceStateSource;
use super::error::DeviceError;
use super::session::{DeviceSession, EndpointParams, ItemStatus, SessionConnector, TagReading};
use crate::configs::config_hub::DeviceSettings;
use crate::core::snapshot::{ExtensionMap, ExtensionValue, DEVICE_NAME_KEY, DEVICE_STATUS_KEY};

/// Extension key for the proxy's connected flag.
pub const KEY_CONNECTED: &str = "opc.connected";
/// Extension key for the conveyor running flag.
pub const KEY_RUNNING: &str = "opc.conveyor.running";
/// Extension key for the conveyor speed.
pub const KEY_SPEED: &str = "opc.conveyor.speed";

const STATUS_ONLINE: &str = "Online";
const STATUS_OFFLINE: &str = "Offline";

struct RetryTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RetryTask {
    fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && !self.handle.is_finished()
    }
}

/// Node ids resolved once from settings.
struct NodeIds {
    connected: String,
    running: String,
    speed: String,
    control_command: String,
}

struct ManagerInner {
    settings: DeviceSettings,
    nodes: NodeIds,
    device_name: String,
    connector: Arc<dyn SessionConnector>,
    // Held while the session slot is replaced. Never held across a read or write.
    connect_section: tokio::sync::Mutex<()>,
    session: RwLock<Option<Arc<dyn DeviceSession>>>,
    live_hint: AtomicBool,
    retry: Mutex<Option<RetryTask>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    connect_attempts: AtomicU64,
    retry_tasks_started: AtomicU64,
}

/// # Connection Resilience Manager
///
/// Thread-safe; share it behind an `Arc`. Dropping it cancels its retry task.
pub struct ConnectionResilienceManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionResilienceManager {
    /// Creates a manager with no session yet. `shutdown` is the process-wide
    /// token; the manager and its retry task stop when it fires.
    pub fn new(
        settings: DeviceSettings,
        connector: Arc<dyn SessionConnector>,
        shutdown: &CancellationToken,
    ) -> Self {
        let nodes = NodeIds {
            connected: settings.node_id(&settings.tags.connected),
            running: settings.node_id(&settings.tags.running),
            speed: settings.node_id(&settings.tags.speed),
            control_command: settings.node_id(&settings.tags.control_command),
        };
        let device_name = settings.device_name();

        Self {
            inner: Arc::new(ManagerInner {
                settings,
                nodes,
                device_name,
                connector,
                connect_section: tokio::sync::Mutex::new(()),
                session: RwLock::new(None),
                live_hint: AtomicBool::new(false),
                retry: Mutex::new(None),
                shutdown: shutdown.child_token(),
                closed: AtomicBool::new(false),
                connect_attempts: AtomicU64::new(0),
                retry_tasks_started: AtomicU64::new(0),
            }),
        }
    }

    /// Returns once a live session exists, connecting if needed. A failed
    /// connect schedules the background retry before the error is returned.
    pub async fn ensure_connected(&self, shutdown: &CancellationToken) -> Result<(), DeviceError> {
        self.inner.ensure_connected(shutdown).await.map(|_| ())
    }

    /// Best-effort shutdown: stops the retry task and closes the session.
    /// Calling it again is a no-op.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let task = inner.retry_slot().take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                tracing::debug!(error = %e, "Retry task ended abnormally during close");
            }
        }
        inner.shutdown.cancel();

        let _section = inner.connect_section.lock().await;
        if let Some(session) = inner.take_session() {
            if let Err(e) = inner.timed("close", session.close()).await {
                tracing::debug!(error = %e, "Ignoring error while closing device session");
            }
        }
        inner.live_hint.store(false, Ordering::Release);
        tracing::info!("Connection manager closed");
    }

    /// Value of the liveness hint. May lag the real session state.
    pub fn is_live(&self) -> bool {
        self.inner.live_hint.load(Ordering::Acquire)
    }

    /// Whether a background reconnect task is currently active.
    pub fn is_retrying(&self) -> bool {
        self.inner
            .retry_slot()
            .as_ref()
            .is_some_and(RetryTask::is_active)
    }

    /// Number of connect attempts issued to the connector so far.
    pub fn connect_attempts(&self) -> u64 {
        self.inner.connect_attempts.load(Ordering::Relaxed)
    }

    /// Number of retry tasks spawned over the manager's lifetime.
    pub fn retry_tasks_started(&self) -> u64 {
        self.inner.retry_tasks_started.load(Ordering::Relaxed)
    }
}

impl Drop for ConnectionResilienceManager {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

#[async_trait]
impl DeviceStateSource for ConnectionResilienceManager {
    async fn read_state(&self, shutdown: &CancellationToken) -> Result<ExtensionMap, DeviceError> {
        let inner = &self.inner;
        let session = inner.ensure_connected(shutdown).await?;

        let nodes = [
            inner.nodes.connected.clone(),
            inner.nodes.running.clone(),
            inner.nodes.speed.clone(),
        ];
        match inner.bounded("read", shutdown, session.read(&nodes)).await {
            Ok(readings) => Ok(inner.project(&nodes, &readings)),
            Err(e) => Err(inner.on_call_failure(session.as_ref(), e)),
        }
    }

    async fn write_state(&self, device_id: &str, payload: &str) -> Result<(), DeviceError> {
        let inner = &self.inner;
        // Writes have no caller token; they stop with the manager.
        let token = inner.shutdown.clone();
        let session = inner.ensure_connected(&token).await?;

        let node = inner.nodes.control_command.clone();
        let value = ExtensionValue::Text(payload.to_string());
        match inner.bounded("write", &token, session.write(&node, value)).await {
            Ok(ItemStatus::Good) => {
                tracing::debug!(device_id = %device_id, node = %node, "Control command written");
                Ok(())
            }
            Ok(ItemStatus::Bad(status)) => {
                tracing::warn!(device_id = %device_id, node = %node, status = %status, "Control command rejected by device proxy");
                Err(DeviceError::WriteRejected { tag: node, status })
            }
            Err(e) => Err(inner.on_call_failure(session.as_ref(), e)),
        }
    }
}

impl ManagerInner {
    fn retry_slot(&self) -> MutexGuard<'_, Option<RetryTask>> {
        self.retry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_session(&self) -> Option<Arc<dyn DeviceSession>> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_session(&self) -> Option<Arc<dyn DeviceSession>> {
        self.session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn store_session(&self, session: Arc<dyn DeviceSession>) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(session);
    }

    async fn ensure_connected(
        self: &Arc<Self>,
        shutdown: &CancellationToken,
    ) -> Result<Arc<dyn DeviceSession>, DeviceError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DeviceError::NotConnected);
        }
        if self.live_hint.load(Ordering::Acquire) {
            if let Some(session) = self.current_session() {
                if session.is_connected() {
                    return Ok(session);
                }
            }
        }

        match self.connect_slow(shutdown).await {
            Ok(session) => Ok(session),
            Err(DeviceError::Cancelled) => Err(DeviceError::Cancelled),
            Err(e) => {
                tracing::warn!(error = %e, endpoint = %self.settings.endpoint_url, "Connect to device proxy failed");
                self.start_retry();
                Err(e)
            }
        }
    }

    async fn connect_slow(
        self: &Arc<Self>,
        token: &CancellationToken,
    ) -> Result<Arc<dyn DeviceSession>, DeviceError> {
        let _section = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(DeviceError::Cancelled),
            _ = self.shutdown.cancelled() => return Err(DeviceError::Cancelled),
            guard = self.connect_section.lock() => guard,
        };

        if self.closed.load(Ordering::Acquire) {
            return Err(DeviceError::NotConnected);
        }

        // Someone else may have connected while we waited.
        if let Some(session) = self.current_session() {
            if session.is_connected() {
                self.live_hint.store(true, Ordering::Release);
                self.stop_retry();
                return Ok(session);
            }
        }

        if let Some(stale) = self.take_session() {
            self.live_hint.store(false, Ordering::Release);
            if let Err(e) = self.timed("close", stale.close()).await {
                tracing::debug!(error = %e, "Ignoring error while closing stale session");
            }
        }

        let params = EndpointParams::from(&self.settings);
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(endpoint = %params.endpoint_url, session = %params.session_name, "Connecting to device proxy");

        let session: Arc<dyn DeviceSession> =
            Arc::from(self.bounded("connect", token, self.connector.connect(&params)).await?);
        self.store_session(Arc::clone(&session));
        self.live_hint.store(true, Ordering::Release);
        tracing::info!(endpoint = %params.endpoint_url, "Connected to device proxy");

        self.stop_retry();
        Ok(session)
    }

    /// Spawns the retry task unless one is already active.
    fn start_retry(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) || self.shutdown.is_cancelled() {
            return;
        }

        let mut slot = self.retry_slot();
        if slot.as_ref().is_some_and(RetryTask::is_active) {
            return;
        }

        let cancel = self.shutdown.child_token();
        let token = cancel.clone();
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move { inner.retry_loop(token).await });
        *slot = Some(RetryTask { cancel, handle });
        self.retry_tasks_started.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            interval_ms = self.settings.reconnect_interval_ms,
            "Background reconnect scheduled"
        );
    }

    /// Cancels and detaches the retry task. Never awaits it: the caller may be
    /// the retry task itself.
    fn stop_retry(&self) {
        let task = self.retry_slot().take();
        if let Some(task) = task {
            task.cancel.cancel();
            tracing::debug!("Background reconnect stopped");
        }
    }

    async fn retry_loop(self: Arc<Self>, token: CancellationToken) {
        let interval = self.settings.reconnect_interval();
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            match self.connect_slow(&token).await {
                Ok(_) => {
                    tracing::info!("Reconnected to device proxy");
                    return;
                }
                Err(DeviceError::Cancelled) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "Reconnect attempt failed, will retry");
                }
            }
        }
    }

    /// Handles a failed read or write. Only a session that reports itself
    /// disconnected invalidates the hint and schedules a reconnect.
    fn on_call_failure(self: &Arc<Self>, session: &dyn DeviceSession, error: DeviceError) -> DeviceError {
        if error.is_transport() && !session.is_connected() {
            self.live_hint.store(false, Ordering::Release);
            tracing::warn!(error = %error, "Device session lost");
            self.start_retry();
        }
        error
    }

    /// Runs `fut` under the connection timeout, giving up early when either
    /// `token` or the manager shutdown fires.
    async fn bounded<T, F>(
        &self,
        operation: &'static str,
        token: &CancellationToken,
        fut: F,
    ) -> Result<T, DeviceError>
    where
        F: Future<Output = Result<T, DeviceError>>,
    {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(DeviceError::Cancelled),
            _ = self.shutdown.cancelled() => Err(DeviceError::Cancelled),
            res = self.timed(operation, fut) => res,
        }
    }

    async fn timed<T, F>(&self, operation: &'static str, fut: F) -> Result<T, DeviceError>
    where
        F: Future<Output = Result<T, DeviceError>>,
    {
        let after: Duration = self.settings.connection_timeout();
        match tokio::time::timeout(after, fut).await {
            Ok(res) => res,
            Err(_) => Err(DeviceError::Timeout { operation, after }),
        }
    }

    fn project(&self, nodes: &[String], readings: &[TagReading]) -> ExtensionMap {
        let good = |i: usize| {
            let value = readings.get(i).and_then(TagReading::good_value);
            if value.is_none() {
                tracing::debug!(node = %nodes[i], "Bad or missing item in bulk read, using default");
            }
            value
        };

        let connected = good(0).and_then(ExtensionValue::as_bool).unwrap_or(false);
        let running = good(1).and_then(ExtensionValue::as_bool).unwrap_or(false);
        let speed = good(2).and_then(ExtensionValue::as_f64).unwrap_or(0.0);

        let status = if connected { STATUS_ONLINE } else { STATUS_OFFLINE };

        let mut map = ExtensionMap::new();
        map.insert(KEY_CONNECTED.to_string(), connected.into());
        map.insert(KEY_RUNNING.to_string(), running.into());
        map.insert(KEY_SPEED.to_string(), speed.into());
        map.insert(DEVICE_NAME_KEY.to_string(), self.device_name.clone().into());
        map.insert(DEVICE_STATUS_KEY.to_string(), status.into());
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::simulated::{SimulatedConnector, SimulatedDevice};

    fn settings() -> DeviceSettings {
        DeviceSettings {
            reconnect_interval_ms: 1_000,
            connection_timeout_ms: 500,
            ..DeviceSettings::default()
        }
    }

    fn manager(device: &Arc<SimulatedDevice>, token: &CancellationToken) -> ConnectionResilienceManager {
        let connector = Arc::new(SimulatedConnector::new(Arc::clone(device)));
        ConnectionResilienceManager::new(settings(), connector, token)
    }

    #[tokio::test(start_paused = true)]
    async fn read_projects_tags_into_extensions() {
        let token = CancellationToken::new();
        let device = SimulatedDevice::seeded(&settings());
        let mgr = manager(&device, &token);

        let state = mgr.read_state(&token).await.unwrap();

        assert_eq!(state[KEY_CONNECTED], ExtensionValue::Bool(true));
        assert_eq!(state[KEY_RUNNING], ExtensionValue::Bool(true));
        assert_eq!(state[KEY_SPEED], ExtensionValue::Number(0.8));
        assert_eq!(state[DEVICE_NAME_KEY], ExtensionValue::from("Kepware_Channel1_Device1"));
        assert_eq!(state[DEVICE_STATUS_KEY], ExtensionValue::from("Online"));
        assert!(mgr.is_live());
        assert_eq!(mgr.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bad_items_fall_back_to_defaults() {
        let token = CancellationToken::new();
        let s = settings();
        let device = SimulatedDevice::seeded(&s);
        device.set_bad(&s.node_id("Connected"), "BadCommunicationError");
        device.set_bad(&s.node_id("Speed"), "BadWaitingForInitialData");
        let mgr = manager(&device, &token);

        let state = mgr.read_state(&token).await.unwrap();

        assert_eq!(state[KEY_CONNECTED], ExtensionValue::Bool(false));
        assert_eq!(state[KEY_SPEED], ExtensionValue::Number(0.0));
        // The good item in the same bulk read keeps its real value.
        assert_eq!(state[KEY_RUNNING], ExtensionValue::Bool(true));
        assert_eq!(state[DEVICE_STATUS_KEY], ExtensionValue::from("Offline"));
    }

    #[tokio::test(start_paused = true)]
    async fn bad_flags_read_false_while_the_speed_survives() {
        let token = CancellationToken::new();
        let s = settings();
        let device = SimulatedDevice::seeded(&s);
        device.set_tag(&s.node_id("Speed"), 0.35);
        device.set_bad(&s.node_id("Connected"), "BadCommunicationError");
        device.set_bad(&s.node_id("Running"), "BadNodeIdUnknown");
        let mgr = manager(&device, &token);

        let state = mgr.read_state(&token).await.unwrap();

        assert_eq!(state[KEY_CONNECTED], ExtensionValue::Bool(false));
        assert_eq!(state[KEY_RUNNING], ExtensionValue::Bool(false));
        assert_eq!(state[KEY_SPEED], ExtensionValue::Number(0.35));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_connect() {
        let token = CancellationToken::new();
        let device = SimulatedDevice::seeded(&settings());
        device.set_connect_delay(Duration::from_millis(100));
        let mgr = Arc::new(manager(&device, &token));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let mgr = Arc::clone(&mgr);
            let token = token.clone();
            tasks.push(tokio::spawn(async move { mgr.read_state(&token).await }));
        }
        for t in tasks {
            assert!(t.await.unwrap().is_ok());
        }

        assert_eq!(device.connect_attempts(), 1);
        assert_eq!(mgr.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_starts_one_retry_that_recovers() {
        let token = CancellationToken::new();
        let device = SimulatedDevice::seeded(&settings());
        device.set_reachable(false);
        let mgr = manager(&device, &token);

        let err = mgr.read_state(&token).await.unwrap_err();
        assert!(err.is_transport());
        assert!(mgr.is_retrying());

        // A second failure while the retry runs does not spawn another.
        assert!(mgr.read_state(&token).await.is_err());
        assert_eq!(mgr.retry_tasks_started(), 1);

        device.set_reachable(true);
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        assert!(!mgr.is_retrying());
        assert!(mgr.is_live());
        assert!(mgr.read_state(&token).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn lost_session_during_read_schedules_reconnect() {
        let token = CancellationToken::new();
        let device = SimulatedDevice::seeded(&settings());
        let mgr = manager(&device, &token);
        mgr.read_state(&token).await.unwrap();

        device.sever_on_next_read();
        let err = mgr.read_state(&token).await.unwrap_err();

        assert!(matches!(err, DeviceError::Transport(_)));
        assert!(!mgr.is_live());
        assert!(mgr.is_retrying());
        assert_eq!(mgr.retry_tasks_started(), 1);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(mgr.is_live());
        assert!(!mgr.is_retrying());
        assert_eq!(mgr.connect_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_proxy_fails_the_next_read() {
        let token = CancellationToken::new();
        let device = SimulatedDevice::seeded(&settings());
        let mgr = manager(&device, &token);
        mgr.read_state(&token).await.unwrap();

        device.set_reachable(false);
        let err = mgr.read_state(&token).await.unwrap_err();

        assert!(err.is_transport());
        assert!(!mgr.is_live());
        assert_eq!(mgr.retry_tasks_started(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_write_is_not_retried() {
        let token = CancellationToken::new();
        let s = settings();
        let device = SimulatedDevice::seeded(&s);
        device.set_read_only(&s.node_id("ControlCommand"));
        let mgr = manager(&device, &token);

        let err = mgr.write_state("Device1", r#"{"cmd":"start"}"#).await.unwrap_err();

        assert!(matches!(err, DeviceError::WriteRejected { ref status, .. } if status == "BadNotWritable"));
        assert!(!mgr.is_retrying());
        assert_eq!(mgr.retry_tasks_started(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn write_forwards_the_payload_verbatim() {
        let token = CancellationToken::new();
        let s = settings();
        let device = SimulatedDevice::seeded(&s);
        let mgr = manager(&device, &token);

        mgr.write_state("Device1", "SPEED=0.4;RUN").await.unwrap();

        assert_eq!(
            device.written(&s.node_id("ControlCommand")),
            Some(ExtensionValue::from("SPEED=0.4;RUN"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_connect_times_out() {
        let token = CancellationToken::new();
        let device = SimulatedDevice::seeded(&settings());
        device.set_connect_delay(Duration::from_secs(10));
        let mgr = manager(&device, &token);

        let err = mgr.read_state(&token).await.unwrap_err();

        assert!(matches!(err, DeviceError::Timeout { operation: "connect", .. }));
        assert!(mgr.is_retrying());
        mgr.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn hung_call_on_a_connected_session_keeps_the_session() {
        let token = CancellationToken::new();
        let device = SimulatedDevice::seeded(&settings());
        let mgr = manager(&device, &token);
        mgr.read_state(&token).await.unwrap();

        device.set_call_delay(Duration::from_secs(10));
        let err = mgr.write_state("Device1", "RUN").await.unwrap_err();
        assert!(matches!(err, DeviceError::Timeout { operation: "write", .. }));
        let err = mgr.read_state(&token).await.unwrap_err();
        assert!(matches!(err, DeviceError::Timeout { operation: "read", .. }));

        // The session still reports connected, so nothing is invalidated.
        assert!(mgr.is_live());
        assert!(!mgr.is_retrying());
        assert_eq!(mgr.retry_tasks_started(), 0);
        assert_eq!(mgr.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_connect_cancels_without_retry() {
        let token = CancellationToken::new();
        let device = SimulatedDevice::seeded(&settings());
        device.set_connect_delay(Duration::from_secs(10));
        let mgr = manager(&device, &token);

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = mgr.read_state(&token).await.unwrap_err();

        assert_eq!(err, DeviceError::Cancelled);
        assert!(!mgr.is_retrying());
        assert_eq!(mgr.retry_tasks_started(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent_and_stops_the_retry() {
        let token = CancellationToken::new();
        let device = SimulatedDevice::seeded(&settings());
        device.set_reachable(false);
        let mgr = manager(&device, &token);
        assert!(mgr.read_state(&token).await.is_err());
        assert!(mgr.is_retrying());

        mgr.close().await;
        mgr.close().await;

        assert!(!mgr.is_retrying());
        assert!(!mgr.is_live());
        assert_eq!(mgr.read_state(&token).await.unwrap_err(), DeviceError::NotConnected);
    }
}
