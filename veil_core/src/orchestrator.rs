//! The connection orchestrator: single source of truth for the macro
//! connection state.
//!
//! All operations and backend signals are serialized onto one owned
//! task via a command channel; the published state can therefore never
//! tear. Connect supersession is enforced with a monotonically
//! increasing attempt id: results belonging to an attempt that is no
//! longer current are discarded, and an orphaned tunnel a stale attempt
//! managed to start is force-stopped. Disconnects escalate through a
//! bounded two-stage timer ladder and never claim Idle without an
//! engine confirmation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use veil_common::config::ClientConfig;
use veil_common::time::epoch_millis;

use crate::backend::{BackendStreams, VpnBackendAdapter};
use crate::consent::{ConsentGate, ConsentStatus};
use crate::error::ConnectError;
use crate::gateway::GatewayConfigService;
use crate::types::{
    ActiveConnection, ConnectionState, EndpointInfo, MacroState, TargetKind, TrafficSample,
    TunnelProtocol, TunnelSignal,
};

const COMMAND_CAPACITY: usize = 64;

/// Timing knobs for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Wait for a graceful disconnect confirmation before escalating.
    pub disconnect_timeout: Duration,
    /// Wait after a force-stop before declaring the disconnect failed.
    pub force_disconnect_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        OrchestratorSettings {
            disconnect_timeout: Duration::from_millis(3000),
            force_disconnect_timeout: Duration::from_millis(2000),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        OrchestratorSettings {
            disconnect_timeout: config.disconnect_timeout(),
            force_disconnect_timeout: config.force_disconnect_timeout(),
        }
    }
}

/// A backend adapter plus the streams it emits on.
pub struct BackendRegistration {
    pub adapter: Arc<dyn VpnBackendAdapter>,
    pub streams: BackendStreams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DisconnectStage {
    Graceful,
    Forced,
}

enum Command {
    Connect {
        target_id: String,
        kind: TargetKind,
    },
    Disconnect,
    ConsentResult {
        granted: bool,
    },
    Signal {
        protocol: TunnelProtocol,
        signal: TunnelSignal,
    },
    Traffic {
        protocol: TunnelProtocol,
        sample: TrafficSample,
    },
    Endpoints {
        protocol: TunnelProtocol,
        info: EndpointInfo,
    },
    AttemptFinished {
        attempt: u64,
        outcome: Result<TunnelProtocol, String>,
    },
    DisconnectDeadline {
        epoch: u64,
        stage: DisconnectStage,
    },
    QueryActive {
        reply: oneshot::Sender<Option<ActiveConnection>>,
    },
}

struct PendingTarget {
    id: String,
    name: String,
    kind: TargetKind,
    attempt: u64,
}

/// Handle to the orchestrator task.
pub struct ConnectionOrchestrator {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<MacroState>,
    task: JoinHandle<()>,
}

impl ConnectionOrchestrator {
    /// Spawn the orchestrator task and the forwarders funneling backend
    /// streams into it.
    pub fn spawn(
        config_service: Arc<dyn GatewayConfigService>,
        consent: Arc<dyn ConsentGate>,
        registrations: Vec<BackendRegistration>,
        settings: OrchestratorSettings,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (state_tx, state_rx) = watch::channel(MacroState::Idle);

        let mut backends: HashMap<TunnelProtocol, Arc<dyn VpnBackendAdapter>> = HashMap::new();
        for registration in registrations {
            let protocol = registration.adapter.protocol();
            spawn_forwarders(protocol, registration.streams, cmd_tx.clone());
            backends.insert(protocol, registration.adapter);
        }

        let core = Core {
            settings,
            config_service,
            consent,
            backends: Arc::new(backends),
            cmd_tx: cmd_tx.clone(),
            state_tx,
            state: MacroState::Idle,
            connections: HashMap::new(),
            current_target: None,
            attempt: 0,
            current_attempt: Arc::new(AtomicU64::new(0)),
            attempt_task: None,
            started_protocol: None,
            stashed_signals: Vec::new(),
            pending_consent: None,
            disconnect_requested: false,
            disconnect_epoch: 0,
            disconnect_timer: None,
        };

        let task = tokio::spawn(core.run(cmd_rx));

        ConnectionOrchestrator {
            cmd_tx,
            state_rx,
            task,
        }
    }

    /// Request a connection to a target; supersedes any unresolved
    /// previous request.
    pub async fn connect(&self, target_id: impl Into<String>, kind: TargetKind) {
        let _ = self
            .cmd_tx
            .send(Command::Connect {
                target_id: target_id.into(),
                kind,
            })
            .await;
    }

    /// Request a disconnect. A no-op when Idle.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect).await;
    }

    /// Report the outcome of the platform consent dialog. Results with
    /// no pending wait (superseded or duplicate) are discarded.
    pub async fn consent_result(&self, granted: bool) {
        let _ = self.cmd_tx.send(Command::ConsentResult { granted }).await;
    }

    /// Current macro state.
    pub fn state(&self) -> MacroState {
        self.state_rx.borrow().clone()
    }

    /// Subscribe to macro state changes.
    pub fn watch_state(&self) -> watch::Receiver<MacroState> {
        self.state_rx.clone()
    }

    /// Snapshot of the active connection record, if any.
    pub async fn active_connection(&self) -> Option<ActiveConnection> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::QueryActive { reply })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Stop the orchestrator task. Tunnels are not torn down; call
    /// [`disconnect`](Self::disconnect) first for a clean shutdown.
    pub fn shutdown(self) {
        self.task.abort();
    }
}

fn spawn_forwarders(
    protocol: TunnelProtocol,
    streams: BackendStreams,
    cmd_tx: mpsc::Sender<Command>,
) {
    let BackendStreams {
        mut signals,
        mut traffic,
        mut endpoints,
    } = streams;

    let tx = cmd_tx.clone();
    tokio::spawn(async move {
        while let Some(signal) = signals.recv().await {
            if tx.send(Command::Signal { protocol, signal }).await.is_err() {
                break;
            }
        }
    });

    let tx = cmd_tx.clone();
    tokio::spawn(async move {
        while let Some(sample) = traffic.recv().await {
            if tx.send(Command::Traffic { protocol, sample }).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        while let Some(info) = endpoints.recv().await {
            if cmd_tx
                .send(Command::Endpoints { protocol, info })
                .await
                .is_err()
            {
                break;
            }
        }
    });
}

struct Core {
    settings: OrchestratorSettings,
    config_service: Arc<dyn GatewayConfigService>,
    consent: Arc<dyn ConsentGate>,
    backends: Arc<HashMap<TunnelProtocol, Arc<dyn VpnBackendAdapter>>>,
    cmd_tx: mpsc::Sender<Command>,
    state_tx: watch::Sender<MacroState>,

    state: MacroState,
    /// Connection records for the current target; cleared on Idle.
    connections: HashMap<String, ActiveConnection>,
    current_target: Option<String>,

    /// Monotonic attempt id; anything tagged with an older id is stale.
    attempt: u64,
    /// Shared mirror of `attempt`, read by in-flight attempt bodies so a
    /// superseded attempt can skip invoking `start()` it has not reached
    /// yet. A start already invoked still runs to completion.
    current_attempt: Arc<AtomicU64>,
    /// Join handle of the last spawned attempt body; the next attempt
    /// awaits it so an invoked `start()` always runs to completion
    /// before another one dispatches.
    attempt_task: Option<JoinHandle<()>>,
    /// Backend whose `start()` succeeded for the current attempt.
    started_protocol: Option<TunnelProtocol>,
    /// Signals that raced ahead of the current attempt's completion
    /// notice; replayed once the attempt lands.
    stashed_signals: Vec<(TunnelProtocol, TunnelSignal)>,

    /// Single consent wait slot; a newer connect overwrites it.
    pending_consent: Option<PendingTarget>,

    /// A disconnect arrived while the attempt was still dispatching;
    /// honored as soon as the attempt lands.
    disconnect_requested: bool,
    disconnect_epoch: u64,
    disconnect_timer: Option<JoinHandle<()>>,
}

impl Core {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        debug!("Connection orchestrator task started");
        while let Some(command) = cmd_rx.recv().await {
            match command {
                Command::Connect { target_id, kind } => self.handle_connect(target_id, kind),
                Command::Disconnect => self.handle_disconnect().await,
                Command::ConsentResult { granted } => self.handle_consent(granted),
                Command::Signal { protocol, signal } => self.handle_signal(protocol, signal),
                Command::Traffic { protocol, sample } => self.handle_traffic(protocol, sample),
                Command::Endpoints { protocol, info } => self.handle_endpoints(protocol, info),
                Command::AttemptFinished { attempt, outcome } => {
                    self.handle_attempt_finished(attempt, outcome).await
                }
                Command::DisconnectDeadline { epoch, stage } => {
                    self.handle_disconnect_deadline(epoch, stage).await
                }
                Command::QueryActive { reply } => {
                    let _ = reply.send(self.current_connection().cloned());
                }
            }
        }
        debug!("Connection orchestrator task finished");
    }

    fn set_state(&mut self, state: MacroState) {
        if self.state != state {
            info!(from = ?self.state, to = ?state, "Macro state transition");
            self.state = state.clone();
            let _ = self.state_tx.send(state);
        }
    }

    fn current_connection(&self) -> Option<&ActiveConnection> {
        self.current_target
            .as_ref()
            .and_then(|id| self.connections.get(id))
    }

    fn current_connection_mut(&mut self) -> Option<&mut ActiveConnection> {
        let id = self.current_target.clone()?;
        self.connections.get_mut(&id)
    }

    fn to_idle(&mut self) {
        self.cancel_disconnect_timer();
        self.connections.clear();
        self.current_target = None;
        self.started_protocol = None;
        self.stashed_signals.clear();
        self.disconnect_requested = false;
        self.set_state(MacroState::Idle);
    }

    fn to_error(&mut self, message: String) {
        // Partial connection state does not survive a surfaced error.
        self.cancel_disconnect_timer();
        self.connections.clear();
        self.current_target = None;
        self.stashed_signals.clear();
        self.set_state(MacroState::Error { message });
    }

    // ---- connect ------------------------------------------------------

    fn handle_connect(&mut self, target_id: String, kind: TargetKind) {
        self.attempt += 1;
        self.current_attempt.store(self.attempt, Ordering::SeqCst);
        let attempt = self.attempt;
        let correlation = Uuid::new_v4();

        // Last request wins: any parked consent target is overwritten
        // and a pending disconnect-on-dispatch is void.
        self.pending_consent = None;
        self.disconnect_requested = false;
        self.cancel_disconnect_timer();

        let name = self
            .config_service
            .display_name(&target_id)
            .unwrap_or_else(|| target_id.clone());

        info!(
            target_id = %target_id,
            name = %name,
            kind = ?kind,
            attempt,
            correlation = %correlation,
            "Connect requested"
        );

        if self.consent.status() == ConsentStatus::Required {
            self.pending_consent = Some(PendingTarget {
                id: target_id,
                name,
                kind,
                attempt,
            });
            self.set_state(MacroState::PermissionRequired);
            return;
        }

        self.begin_attempt(target_id, name, kind, attempt);
    }

    fn handle_consent(&mut self, granted: bool) {
        let Some(pending) = self.pending_consent.take() else {
            debug!("Discarding consent result with no pending wait");
            return;
        };
        if pending.attempt != self.attempt {
            debug!(attempt = pending.attempt, "Discarding superseded consent result");
            return;
        }
        if granted {
            self.begin_attempt(pending.id, pending.name, pending.kind, pending.attempt);
        } else {
            warn!(target_id = %pending.id, "VPN consent denied");
            self.to_error(ConnectError::PermissionDenied.to_string());
        }
    }

    fn begin_attempt(&mut self, id: String, name: String, kind: TargetKind, attempt: u64) {
        self.connections.clear();
        self.connections
            .insert(id.clone(), ActiveConnection::new(id.clone(), name.clone(), kind));
        self.current_target = Some(id.clone());
        self.stashed_signals.clear();
        self.set_state(MacroState::Connecting {
            id: id.clone(),
            name,
        });

        // The currently live backend (if any) belongs to a superseded
        // target; the attempt body stops it before starting the new one.
        let previous_protocol = self.started_protocol.take();
        let previous_task = self.attempt_task.take();
        let config_service = Arc::clone(&self.config_service);
        let backends = Arc::clone(&self.backends);
        let cmd_tx = self.cmd_tx.clone();
        let current_attempt = Arc::clone(&self.current_attempt);

        let task = tokio::spawn(async move {
            // An invoked start() runs to completion before the next
            // attempt dispatches.
            if let Some(previous) = previous_task {
                let _ = previous.await;
            }
            if let Some(protocol) = previous_protocol {
                if let Some(backend) = backends.get(&protocol) {
                    if let Err(e) = backend.force_stop().await {
                        warn!(%protocol, error = %e, "Stopping superseded tunnel failed");
                    }
                }
            }

            let outcome = dispatch_attempt(&id, attempt, current_attempt, config_service, backends).await;
            let _ = cmd_tx
                .send(Command::AttemptFinished { attempt, outcome })
                .await;
        });
        self.attempt_task = Some(task);
    }

    async fn handle_attempt_finished(
        &mut self,
        attempt: u64,
        outcome: Result<TunnelProtocol, String>,
    ) {
        if attempt != self.attempt {
            // Superseded. A tunnel the stale attempt started anyway is
            // orphaned; tear it down in the background.
            if let Ok(protocol) = outcome {
                warn!(attempt, %protocol, "Stale attempt started a tunnel, force-stopping it");
                if let Some(backend) = self.backends.get(&protocol).cloned() {
                    tokio::spawn(async move {
                        let _ = backend.force_stop().await;
                    });
                }
            }
            return;
        }

        match outcome {
            Ok(protocol) => {
                self.started_protocol = Some(protocol);
                if let Some(conn) = self.current_connection_mut() {
                    conn.protocol = Some(protocol);
                }
                let stashed = std::mem::take(&mut self.stashed_signals);
                for (stashed_protocol, signal) in stashed {
                    self.handle_signal(stashed_protocol, signal);
                }
                if self.disconnect_requested {
                    self.disconnect_requested = false;
                    // Unless a replayed signal already finished the job.
                    if self.started_protocol.is_some() {
                        self.set_state(MacroState::Disconnecting);
                        self.begin_disconnect().await;
                    }
                }
            }
            Err(message) => {
                error!(attempt, error = %message, "Connect attempt failed");
                if self.disconnect_requested {
                    // Nothing started; the requested disconnect is
                    // trivially complete.
                    self.to_idle();
                } else {
                    self.to_error(message);
                }
            }
        }
    }

    // ---- disconnect ---------------------------------------------------

    async fn handle_disconnect(&mut self) {
        match &self.state {
            MacroState::Idle => {
                debug!("Disconnect while idle is a no-op");
            }
            MacroState::Disconnecting => {
                debug!("Disconnect already in progress");
            }
            MacroState::PermissionRequired => {
                // Nothing was started; drop the parked target.
                self.pending_consent = None;
                self.to_idle();
            }
            MacroState::Connecting { .. } | MacroState::Connected { .. } | MacroState::Error { .. } => {
                if self.started_protocol.is_some() {
                    self.set_state(MacroState::Disconnecting);
                    self.begin_disconnect().await;
                } else if self.attempt_task.is_some()
                    && matches!(self.state, MacroState::Connecting { .. })
                {
                    // The attempt is still dispatching; honor the
                    // disconnect once its start() lands.
                    self.disconnect_requested = true;
                    self.set_state(MacroState::Disconnecting);
                } else {
                    self.to_idle();
                }
            }
        }
    }

    async fn begin_disconnect(&mut self) {
        let Some(protocol) = self.started_protocol else {
            self.to_idle();
            return;
        };
        let Some(backend) = self.backends.get(&protocol).cloned() else {
            self.to_idle();
            return;
        };

        self.disconnect_epoch += 1;
        let epoch = self.disconnect_epoch;

        if let Err(e) = backend.stop().await {
            warn!(%protocol, error = %e, "Graceful stop failed, awaiting escalation");
        }
        self.arm_disconnect_timer(epoch, DisconnectStage::Graceful, self.settings.disconnect_timeout);
    }

    fn arm_disconnect_timer(&mut self, epoch: u64, stage: DisconnectStage, delay: Duration) {
        self.cancel_disconnect_timer();
        let cmd_tx = self.cmd_tx.clone();
        self.disconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = cmd_tx
                .send(Command::DisconnectDeadline { epoch, stage })
                .await;
        }));
    }

    fn cancel_disconnect_timer(&mut self) {
        if let Some(timer) = self.disconnect_timer.take() {
            timer.abort();
        }
    }

    async fn handle_disconnect_deadline(&mut self, epoch: u64, stage: DisconnectStage) {
        if epoch != self.disconnect_epoch || self.state != MacroState::Disconnecting {
            debug!(epoch, ?stage, "Ignoring cancelled disconnect deadline");
            return;
        }

        match stage {
            DisconnectStage::Graceful => {
                let Some(protocol) = self.started_protocol else {
                    return;
                };
                warn!(%protocol, "No disconnect confirmation, escalating to force-stop");
                if let Some(backend) = self.backends.get(&protocol).cloned() {
                    if let Err(e) = backend.force_stop().await {
                        warn!(%protocol, error = %e, "Force-stop failed");
                    }
                }
                self.arm_disconnect_timer(
                    epoch,
                    DisconnectStage::Forced,
                    self.settings.force_disconnect_timeout,
                );
            }
            DisconnectStage::Forced => {
                error!("Disconnect unconfirmed after force-stop; tunnel state unknown");
                self.cancel_disconnect_timer();
                // Never claim Idle over an unconfirmed tunnel: the
                // record stays, the state is a terminal error.
                if let Some(conn) = self.current_connection_mut() {
                    conn.state = ConnectionState::Failed;
                }
                self.set_state(MacroState::Error {
                    message: ConnectError::DisconnectTimeout.to_string(),
                });
            }
        }
    }

    // ---- backend signals ----------------------------------------------

    fn handle_signal(&mut self, protocol: TunnelProtocol, signal: TunnelSignal) {
        if self.started_protocol != Some(protocol) {
            // Either a signal racing ahead of the attempt-finished
            // notice, or residue of a superseded/stopped tunnel. A
            // Disconnected can only be residue here: nothing of the
            // current attempt has started yet.
            if self.started_protocol.is_none()
                && self.attempt_task.is_some()
                && signal != TunnelSignal::Disconnected
                && matches!(self.state, MacroState::Connecting { .. } | MacroState::Disconnecting)
            {
                self.stashed_signals.push((protocol, signal));
            } else {
                debug!(%protocol, ?signal, "Ignoring signal from inactive backend");
            }
            return;
        }

        if self.state == MacroState::Disconnecting {
            // Only full teardown confirmation transitions; everything
            // else arriving mid-disconnect is swallowed.
            if signal == TunnelSignal::Disconnected {
                info!("Disconnect confirmed by engine");
                self.to_idle();
            } else {
                debug!(?signal, "Swallowing signal during disconnect");
            }
            return;
        }

        match signal {
            TunnelSignal::Connected => match self.state.clone() {
                MacroState::Connecting { id, name } | MacroState::Connected { id, name } => {
                    if let Some(conn) = self.current_connection_mut() {
                        conn.state = ConnectionState::Connected;
                        if conn.connected_at.is_none() {
                            conn.connected_at = Some(epoch_millis());
                        }
                    }
                    self.set_state(MacroState::Connected { id, name });
                }
                _ => debug!("Ignoring connected signal outside a connection"),
            },
            TunnelSignal::Connecting => match self.state.clone() {
                MacroState::Connecting { .. } => {
                    if let Some(conn) = self.current_connection_mut() {
                        conn.state = ConnectionState::Connecting;
                    }
                }
                MacroState::Connected { id, name } => {
                    // The engine is renegotiating; reflect it.
                    if let Some(conn) = self.current_connection_mut() {
                        conn.state = ConnectionState::Connecting;
                    }
                    self.set_state(MacroState::Connecting { id, name });
                }
                _ => debug!("Ignoring connecting signal outside a connection"),
            },
            // Outside Disconnecting a Disconnected signal is residue of
            // an earlier tunnel generation (a superseded attempt's
            // teardown confirms whenever it pleases); an engine losing a
            // live tunnel reports it through an Error signal.
            TunnelSignal::Disconnected => debug!("Ignoring residual disconnected signal"),
            TunnelSignal::Error(message) => match self.state {
                MacroState::Connecting { .. } | MacroState::Connected { .. } => {
                    self.started_protocol = None;
                    self.to_error(message);
                }
                _ => debug!(error = %message, "Ignoring engine error signal"),
            },
        }
    }

    fn handle_traffic(&mut self, protocol: TunnelProtocol, sample: TrafficSample) {
        if self.started_protocol != Some(protocol) {
            return;
        }
        if let Some(conn) = self.current_connection_mut() {
            conn.bytes_in = sample.bytes_in;
            conn.bytes_out = sample.bytes_out;
        }
    }

    fn handle_endpoints(&mut self, protocol: TunnelProtocol, info: EndpointInfo) {
        if self.started_protocol != Some(protocol) {
            return;
        }
        if let Some(conn) = self.current_connection_mut() {
            if info.local_ip.is_some() {
                conn.local_ip = info.local_ip;
            }
            if info.remote_endpoint.is_some() {
                conn.remote_endpoint = info.remote_endpoint;
            }
        }
    }
}

/// The attempt body: fetch the profile, pick the backend, start it.
/// Fetch failures never invoke a backend, and neither does an attempt
/// that was superseded before reaching its start.
async fn dispatch_attempt(
    target_id: &str,
    attempt: u64,
    current_attempt: Arc<AtomicU64>,
    config_service: Arc<dyn GatewayConfigService>,
    backends: Arc<HashMap<TunnelProtocol, Arc<dyn VpnBackendAdapter>>>,
) -> Result<TunnelProtocol, String> {
    let profile = config_service
        .resolve(target_id)
        .await
        .map_err(|e| ConnectError::ConfigFetch(e.to_string()).to_string())?;

    let backend = backends
        .get(&profile.protocol)
        .ok_or_else(|| ConnectError::UnsupportedProtocol(profile.protocol).to_string())?;

    if current_attempt.load(Ordering::SeqCst) != attempt {
        // The outcome is discarded as stale either way; skipping the
        // start just avoids bringing up a tunnel nobody wants.
        return Err("connect attempt superseded".to_string());
    }

    backend
        .start(&profile.config)
        .await
        .map_err(|e| e.to_string())?;

    Ok(profile.protocol)
}
