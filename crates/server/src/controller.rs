//! The controller task: single owner of the pump status board and the
//! profile schedule. Operator requests, inbound status messages and
//! scheduler ticks are all funneled through one `select!` loop, so every
//! state mutation happens in one total order without locks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use pumplab_core::calc::blended_concentration;
use pumplab_core::pump::CommandError;
use pumplab_core::topics::{parse_status_topic, status_topic};
use pumplab_core::{OutputProfile, ProfileSummary, PumpCommand, PumpId, PumpStatus, StatusBoard};
use pumplab_mqtt::{MqttEvent, MqttService};

use crate::config::ControllerConfig;
use crate::Metrics;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("command transport failed: {0}")]
    Transport(String),
}

/// Seam to the backend device driver. The production impl publishes to the
/// pump's MQTT command topic; tests record the commands instead.
pub trait CommandSink: Send + 'static {
    fn send_command(
        &self,
        pump_id: PumpId,
        command: &PumpCommand,
    ) -> impl Future<Output = Result<(), SinkError>> + Send;
}

impl CommandSink for MqttService {
    fn send_command(
        &self,
        pump_id: PumpId,
        command: &PumpCommand,
    ) -> impl Future<Output = Result<(), SinkError>> + Send {
        let service = self.clone();
        let command = command.clone();
        async move {
            service
                .publish_command(pump_id, &command)
                .await
                .map_err(|err| SinkError::Transport(err.to_string()))
        }
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("unknown pump id {0}")]
    UnknownPump(PumpId),
    #[error("invalid command: {0}")]
    InvalidCommand(#[from] CommandError),
    #[error("unknown profile '{0}'")]
    UnknownProfile(String),
    #[error("no profile selected")]
    NoProfileSelected,
    #[error("a profile is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Backend(#[from] SinkError),
    #[error("controller is shut down")]
    Closed,
}

/// Reconciled status change, forwarded to WebSocket subscribers in the
/// `{topic, payload}` shape the frontend consumes.
#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    pub topic: String,
    pub payload: PumpStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleSnapshot {
    pub selected: Option<String>,
    pub running: bool,
    pub phase_index: usize,
    pub phase_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowReading {
    pub pump_id: PumpId,
    pub flow_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConcentrationReading {
    pub flows: Vec<FlowReading>,
    pub concentration: f64,
}

pub enum ControllerRequest {
    Dispatch {
        pump_id: PumpId,
        command: PumpCommand,
        reply: oneshot::Sender<Result<(), ControllerError>>,
    },
    ReadStatus {
        pump_id: PumpId,
        reply: oneshot::Sender<Result<PumpStatus, ControllerError>>,
    },
    ReadAll {
        reply: oneshot::Sender<Vec<PumpStatus>>,
    },
    SelectProfile {
        id: String,
        reply: oneshot::Sender<Result<(), ControllerError>>,
    },
    StartProfile {
        reply: oneshot::Sender<Result<(), ControllerError>>,
    },
    StopProfile {
        reply: oneshot::Sender<Result<(), ControllerError>>,
    },
    Schedule {
        reply: oneshot::Sender<ScheduleSnapshot>,
    },
    Profiles {
        reply: oneshot::Sender<Vec<ProfileSummary>>,
    },
    Concentration {
        reply: oneshot::Sender<ConcentrationReading>,
    },
}

#[derive(Clone)]
pub struct ControllerHandle {
    requests: mpsc::Sender<ControllerRequest>,
    updates: broadcast::Sender<StatusUpdate>,
}

impl ControllerHandle {
    pub async fn dispatch(
        &self,
        pump_id: PumpId,
        command: PumpCommand,
    ) -> Result<(), ControllerError> {
        self.request(|reply| ControllerRequest::Dispatch {
            pump_id,
            command,
            reply,
        })
        .await?
    }

    pub async fn read_status(&self, pump_id: PumpId) -> Result<PumpStatus, ControllerError> {
        self.request(|reply| ControllerRequest::ReadStatus { pump_id, reply })
            .await?
    }

    pub async fn read_all(&self) -> Result<Vec<PumpStatus>, ControllerError> {
        self.request(|reply| ControllerRequest::ReadAll { reply }).await
    }

    pub async fn select_profile(&self, id: impl Into<String>) -> Result<(), ControllerError> {
        let id = id.into();
        self.request(|reply| ControllerRequest::SelectProfile { id, reply })
            .await?
    }

    pub async fn start_profile(&self) -> Result<(), ControllerError> {
        self.request(|reply| ControllerRequest::StartProfile { reply })
            .await?
    }

    pub async fn stop_profile(&self) -> Result<(), ControllerError> {
        self.request(|reply| ControllerRequest::StopProfile { reply })
            .await?
    }

    pub async fn schedule(&self) -> Result<ScheduleSnapshot, ControllerError> {
        self.request(|reply| ControllerRequest::Schedule { reply }).await
    }

    pub async fn profiles(&self) -> Result<Vec<ProfileSummary>, ControllerError> {
        self.request(|reply| ControllerRequest::Profiles { reply }).await
    }

    pub async fn concentration(&self) -> Result<ConcentrationReading, ControllerError> {
        self.request(|reply| ControllerRequest::Concentration { reply })
            .await
    }

    pub fn updates(&self) -> broadcast::Receiver<StatusUpdate> {
        self.updates.subscribe()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ControllerRequest,
    ) -> Result<T, ControllerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(build(reply_tx))
            .await
            .map_err(|_| ControllerError::Closed)?;
        reply_rx.await.map_err(|_| ControllerError::Closed)
    }
}

/// Spawn the controller task and hand back its handle. The ticker lives
/// inside the task, so dropping every handle tears the timer down with it.
pub fn spawn<S: CommandSink>(
    config: ControllerConfig,
    sink: S,
    events: broadcast::Receiver<MqttEvent>,
    metrics: Arc<Metrics>,
) -> ControllerHandle {
    let (requests_tx, requests_rx) = mpsc::channel(64);
    let controller = Controller::new(config, sink, metrics);
    let handle = ControllerHandle {
        requests: requests_tx,
        updates: controller.updates_tx.clone(),
    };
    tokio::spawn(controller.run(requests_rx, Some(events)));
    handle
}

struct Controller<S> {
    config: ControllerConfig,
    board: StatusBoard,
    sink: S,
    metrics: Arc<Metrics>,
    selected: Option<OutputProfile>,
    running: bool,
    phase_index: usize,
    ticker: Option<Interval>,
    updates_tx: broadcast::Sender<StatusUpdate>,
}

enum Input {
    Request(ControllerRequest),
    Event(MqttEvent),
    Tick,
}

impl<S: CommandSink> Controller<S> {
    fn new(config: ControllerConfig, sink: S, metrics: Arc<Metrics>) -> Self {
        let board = StatusBoard::new(&config.pump_ids);
        let (updates_tx, _) = broadcast::channel(256);
        Self {
            config,
            board,
            sink,
            metrics,
            selected: None,
            running: false,
            phase_index: 0,
            ticker: None,
            updates_tx,
        }
    }

    async fn run(
        mut self,
        mut requests: mpsc::Receiver<ControllerRequest>,
        mut events: Option<broadcast::Receiver<MqttEvent>>,
    ) {
        info!(
            pumps = self.config.pump_ids.len(),
            profiles = self.config.profiles.len(),
            "controller started"
        );
        loop {
            let input = tokio::select! {
                biased;
                event = recv_event(&mut events) => match event {
                    Some(event) => Input::Event(event),
                    None => continue, // lagged or closed, already logged
                },
                _ = next_tick(&mut self.ticker) => Input::Tick,
                request = requests.recv() => match request {
                    Some(request) => Input::Request(request),
                    // Every handle dropped: stop, taking the ticker with us.
                    None => break,
                },
            };
            match input {
                Input::Request(request) => self.handle_request(request).await,
                Input::Event(MqttEvent::Publish { topic, payload }) => {
                    self.handle_status_message(&topic, &payload)
                }
                Input::Event(MqttEvent::Connected) => self.metrics.mqtt_connected.set(1),
                Input::Event(MqttEvent::Disconnected) => self.metrics.mqtt_connected.set(0),
                Input::Tick => self.handle_tick().await,
            }
        }
        debug!("controller stopped");
    }

    async fn handle_request(&mut self, request: ControllerRequest) {
        match request {
            ControllerRequest::Dispatch {
                pump_id,
                command,
                reply,
            } => {
                let _ = reply.send(self.dispatch(pump_id, command).await);
            }
            ControllerRequest::ReadStatus { pump_id, reply } => {
                let result = self
                    .board
                    .read(pump_id)
                    .ok_or(ControllerError::UnknownPump(pump_id));
                let _ = reply.send(result);
            }
            ControllerRequest::ReadAll { reply } => {
                let _ = reply.send(self.board.all());
            }
            ControllerRequest::SelectProfile { id, reply } => {
                let _ = reply.send(self.select_profile(id).await);
            }
            ControllerRequest::StartProfile { reply } => {
                let _ = reply.send(self.start().await);
            }
            ControllerRequest::StopProfile { reply } => {
                let _ = reply.send(self.stop().await);
            }
            ControllerRequest::Schedule { reply } => {
                let _ = reply.send(self.schedule_snapshot());
            }
            ControllerRequest::Profiles { reply } => {
                let _ = reply.send(self.config.profiles.summaries());
            }
            ControllerRequest::Concentration { reply } => {
                let _ = reply.send(self.concentration());
            }
        }
    }

    /// Validate, apply the optimistic update, then hand the command to the
    /// backend. A backend failure is returned to the caller but the
    /// optimistic update stays until a real status message corrects it.
    async fn dispatch(
        &mut self,
        pump_id: PumpId,
        command: PumpCommand,
    ) -> Result<(), ControllerError> {
        command.validate()?;
        let updated = self
            .board
            .apply_command(pump_id, &command)
            .ok_or(ControllerError::UnknownPump(pump_id))?;
        self.publish_update(updated);
        self.sink.send_command(pump_id, &command).await?;
        self.metrics.commands_published_total.inc();
        Ok(())
    }

    fn handle_status_message(&mut self, topic: &str, payload: &[u8]) {
        let Some(pump_id) = parse_status_topic(topic) else {
            debug!(topic, "ignoring non-status topic");
            return;
        };
        let mut status: PumpStatus = match serde_json::from_slice(payload) {
            Ok(status) => status,
            Err(err) => {
                warn!(%pump_id, %err, "dropping malformed status payload");
                self.metrics.status_dropped_total.inc();
                return;
            }
        };
        // The topic id is authoritative; bridges may echo payloads without it.
        status.pump_id = pump_id;
        if let Err(err) = status.validate() {
            warn!(%pump_id, %err, "dropping out-of-range status");
            self.metrics.status_dropped_total.inc();
            return;
        }
        match self.board.apply_status(status) {
            Some(updated) => {
                self.metrics.status_messages_total.inc();
                debug!(%pump_id, "status reconciled");
                self.publish_update(updated);
            }
            None => {
                warn!(%pump_id, "dropping status for unconfigured pump");
                self.metrics.status_dropped_total.inc();
            }
        }
    }

    async fn select_profile(&mut self, id: String) -> Result<(), ControllerError> {
        let profile = self
            .config
            .profiles
            .get(&id)
            .cloned()
            .ok_or(ControllerError::UnknownProfile(id))?;
        // Reselection while running stops the current run first; the new
        // selection never auto-starts.
        if self.running {
            self.stop().await?;
        }
        info!(profile = %profile.id, "profile selected");
        self.selected = Some(profile);
        Ok(())
    }

    async fn start(&mut self) -> Result<(), ControllerError> {
        if self.running {
            return Err(ControllerError::AlreadyRunning);
        }
        let profile = self.selected.clone().ok_or(ControllerError::NoProfileSelected)?;
        self.running = true;
        self.phase_index = 0;
        self.apply_phase(0).await;

        let period = Duration::from_secs_f64(profile.parameters.interval_secs);
        let mut ticker = interval_at(Instant::now() + period, period);
        // A late tick advances one phase when it fires, never a burst.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
        info!(
            profile = %profile.id,
            interval_secs = profile.parameters.interval_secs,
            phases = profile.phase_count(),
            "profile started"
        );
        Ok(())
    }

    async fn handle_tick(&mut self) {
        if !self.running {
            // A tick that raced a stop; expected under cancellation.
            return;
        }
        let Some(phase_count) = self.selected.as_ref().map(|p| p.phase_count()) else {
            return;
        };
        self.phase_index = (self.phase_index + 1) % phase_count;
        debug!(phase = self.phase_index, "advancing profile phase");
        self.apply_phase(self.phase_index).await;
    }

    /// No-op from Idle. From Running: cancel the timer, then force both
    /// pumps off regardless of what the current phase says.
    async fn stop(&mut self) -> Result<(), ControllerError> {
        if !self.running {
            return Ok(());
        }
        self.ticker = None;
        self.running = false;
        self.phase_index = 0;
        for pump_id in self.config.pump_ids.clone() {
            if let Err(err) = self.dispatch(pump_id, PumpCommand::disable()).await {
                warn!(%pump_id, %err, "disable on stop failed");
            }
        }
        info!("profile stopped");
        Ok(())
    }

    async fn apply_phase(&mut self, phase_index: usize) {
        let Some(profile) = self.selected.as_ref() else {
            return;
        };
        let Some(phase) = profile.parameters.phases.get(phase_index) else {
            return;
        };
        let targets: Vec<(PumpId, PumpCommand)> = self
            .config
            .pump_ids
            .iter()
            .copied()
            .zip([phase.pump1.clone(), phase.pump2.clone()])
            .collect();
        for (pump_id, command) in targets {
            if let Err(err) = self.dispatch(pump_id, command).await {
                warn!(%pump_id, phase = phase_index, %err, "scheduled dispatch failed");
            }
        }
    }

    fn schedule_snapshot(&self) -> ScheduleSnapshot {
        ScheduleSnapshot {
            selected: self.selected.as_ref().map(|p| p.id.clone()),
            running: self.running,
            phase_index: self.phase_index,
            phase_count: self.selected.as_ref().map_or(0, |p| p.phase_count()),
        }
    }

    /// Live blended output concentration from the first two configured
    /// pumps. A disabled pump contributes zero flow whatever its rpm.
    fn concentration(&self) -> ConcentrationReading {
        let flows: Vec<FlowReading> = self
            .board
            .all()
            .iter()
            .map(|status| FlowReading {
                pump_id: status.pump_id,
                flow_rate: if status.enable {
                    self.config.calibration.flow_rate(status.rpm)
                } else {
                    0.0
                },
            })
            .collect();
        let concentration = match flows.as_slice() {
            [first, second, ..] => blended_concentration(
                first.flow_rate,
                self.config.concentration_for(first.pump_id),
                second.flow_rate,
                self.config.concentration_for(second.pump_id),
            ),
            _ => 0.0,
        };
        ConcentrationReading {
            flows,
            concentration,
        }
    }

    fn publish_update(&self, status: PumpStatus) {
        let _ = self.updates_tx.send(StatusUpdate {
            topic: status_topic(status.pump_id),
            payload: status,
        });
    }
}

async fn recv_event(events: &mut Option<broadcast::Receiver<MqttEvent>>) -> Option<MqttEvent> {
    let Some(rx) = events.as_mut() else {
        return std::future::pending().await;
    };
    match rx.recv().await {
        Ok(event) => Some(event),
        Err(broadcast::error::RecvError::Lagged(missed)) => {
            warn!(missed, "status stream lagged; continuing from newest");
            None
        }
        Err(broadcast::error::RecvError::Closed) => {
            warn!("status stream closed");
            *events = None;
            None
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker.as_mut() {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use pumplab_core::calc::PumpCalibration;
    use pumplab_core::ProfileLibrary;

    #[derive(Clone, Default)]
    struct RecordingSink {
        sent: Arc<Mutex<Vec<(PumpId, PumpCommand)>>>,
        fail: Arc<AtomicBool>,
    }

    impl RecordingSink {
        fn sent(&self) -> Vec<(PumpId, PumpCommand)> {
            self.sent.lock().unwrap().clone()
        }

        fn clear(&self) {
            self.sent.lock().unwrap().clear();
        }
    }

    impl CommandSink for RecordingSink {
        fn send_command(
            &self,
            pump_id: PumpId,
            command: &PumpCommand,
        ) -> impl Future<Output = Result<(), SinkError>> + Send {
            let sent = self.sent.clone();
            let fail = self.fail.clone();
            let command = command.clone();
            async move {
                if fail.load(Ordering::Relaxed) {
                    return Err(SinkError::Transport("injected failure".into()));
                }
                sent.lock().unwrap().push((pump_id, command));
                Ok(())
            }
        }
    }

    fn test_config() -> ControllerConfig {
        ControllerConfig {
            pump_ids: vec![PumpId(1), PumpId(2)],
            calibration: PumpCalibration::default(),
            reservoir_conc: [(PumpId(1), 10.0), (PumpId(2), 20.0)].into_iter().collect(),
            profiles: ProfileLibrary::builtin(),
        }
    }

    fn controller() -> (Controller<RecordingSink>, RecordingSink) {
        let sink = RecordingSink::default();
        let controller = Controller::new(test_config(), sink.clone(), Metrics::new());
        (controller, sink)
    }

    fn rpm_command(rpm: f64) -> PumpCommand {
        PumpCommand {
            rpm: Some(rpm),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn dispatch_applies_optimistic_update_and_sends() {
        let (mut ctl, sink) = controller();
        ctl.dispatch(PumpId(1), rpm_command(100.0)).await.unwrap();

        let status = ctl.board.read(PumpId(1)).unwrap();
        assert_eq!(status.rpm, 100.0);
        assert!(!status.enable); // absent field untouched

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, PumpId(1));
        assert_eq!(sent[0].1.rpm, Some(100.0));
    }

    #[tokio::test]
    async fn dispatch_rejects_invalid_input_without_state_change() {
        let (mut ctl, sink) = controller();

        let err = ctl.dispatch(PumpId(1), rpm_command(-5.0)).await.unwrap_err();
        assert!(matches!(err, ControllerError::InvalidCommand(_)));
        assert_eq!(ctl.board.read(PumpId(1)).unwrap().rpm, 0.0);

        let err = ctl.dispatch(PumpId(9), rpm_command(10.0)).await.unwrap_err();
        assert!(matches!(err, ControllerError::UnknownPump(PumpId(9))));

        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn backend_failure_keeps_optimistic_update() {
        let (mut ctl, sink) = controller();
        sink.fail.store(true, Ordering::Relaxed);

        let err = ctl.dispatch(PumpId(1), rpm_command(80.0)).await.unwrap_err();
        assert!(matches!(err, ControllerError::Backend(_)));
        // No rollback: the operator sees their input until reconciled.
        assert_eq!(ctl.board.read(PumpId(1)).unwrap().rpm, 80.0);
    }

    #[tokio::test]
    async fn authoritative_status_wins_over_optimistic() {
        let (mut ctl, _sink) = controller();
        ctl.dispatch(PumpId(1), rpm_command(100.0)).await.unwrap();

        ctl.handle_status_message(
            "pump/1/status",
            br#"{"enable":true,"direction":true,"rpm":120.0,"microstep":0}"#,
        );

        let status = ctl.board.read(PumpId(1)).unwrap();
        assert_eq!(status.rpm, 120.0);
        assert!(status.enable);
    }

    #[tokio::test]
    async fn malformed_status_messages_are_dropped() {
        let (mut ctl, _sink) = controller();
        let before = ctl.board.read(PumpId(1)).unwrap();

        ctl.handle_status_message("pump/one/status", b"{}");
        ctl.handle_status_message("pump/1/status", b"not json");
        ctl.handle_status_message(
            "pump/1/status",
            br#"{"enable":true,"direction":true,"rpm":-4.0,"microstep":0}"#,
        );
        ctl.handle_status_message(
            "pump/9/status",
            br#"{"enable":true,"direction":true,"rpm":10.0,"microstep":0}"#,
        );

        assert_eq!(ctl.board.read(PumpId(1)).unwrap(), before);
    }

    #[tokio::test]
    async fn start_applies_phase_zero_immediately() {
        let (mut ctl, sink) = controller();
        ctl.select_profile("alternating-square".into()).await.unwrap();
        ctl.start().await.unwrap();

        let snapshot = ctl.schedule_snapshot();
        assert!(snapshot.running);
        assert_eq!(snapshot.phase_index, 0);
        assert!(ctl.ticker.is_some());

        // Phase 0: pump 1 on at 100 rpm, pump 2 off.
        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, PumpId(1));
        assert_eq!(sent[0].1.enable, Some(true));
        assert_eq!(sent[0].1.rpm, Some(100.0));
        assert_eq!(sent[1].0, PumpId(2));
        assert_eq!(sent[1].1.enable, Some(false));

        assert!(matches!(
            ctl.start().await.unwrap_err(),
            ControllerError::AlreadyRunning
        ));
    }

    #[tokio::test]
    async fn start_requires_a_selection() {
        let (mut ctl, sink) = controller();
        assert!(matches!(
            ctl.start().await.unwrap_err(),
            ControllerError::NoProfileSelected
        ));
        assert!(sink.sent().is_empty());
        assert!(ctl.ticker.is_none());
    }

    #[tokio::test]
    async fn ticks_advance_exactly_one_phase_modulo_len() {
        let (mut ctl, _sink) = controller();
        ctl.select_profile("alternating-square".into()).await.unwrap();
        ctl.start().await.unwrap();

        for n in 1..=5usize {
            ctl.handle_tick().await;
            assert_eq!(ctl.phase_index, n % 2);
        }
    }

    #[tokio::test]
    async fn tick_dispatches_the_new_phase() {
        let (mut ctl, sink) = controller();
        ctl.select_profile("alternating-square".into()).await.unwrap();
        ctl.start().await.unwrap();
        sink.clear();

        ctl.handle_tick().await;

        // Phase 1: pump 1 off, pump 2 on.
        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1.enable, Some(false));
        assert_eq!(sent[1].1.enable, Some(true));
        assert_eq!(sent[1].1.rpm, Some(100.0));
    }

    #[tokio::test]
    async fn stop_cancels_timer_and_disables_both_pumps() {
        let (mut ctl, sink) = controller();
        ctl.select_profile("alternating-square".into()).await.unwrap();
        ctl.start().await.unwrap();
        sink.clear();

        ctl.stop().await.unwrap();

        assert!(ctl.ticker.is_none());
        assert!(!ctl.running);
        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent
            .iter()
            .all(|(_, command)| *command == PumpCommand::disable()));
        // Selection survives a stop so the operator can restart.
        assert_eq!(ctl.selected.as_ref().unwrap().id, "alternating-square");

        // stop from Idle is a no-op.
        sink.clear();
        ctl.stop().await.unwrap();
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn tick_after_stop_is_a_noop() {
        let (mut ctl, sink) = controller();
        ctl.select_profile("alternating-square".into()).await.unwrap();
        ctl.start().await.unwrap();
        ctl.stop().await.unwrap();
        sink.clear();

        ctl.handle_tick().await;

        assert!(sink.sent().is_empty());
        assert_eq!(ctl.phase_index, 0);
    }

    #[tokio::test]
    async fn reselect_while_running_stops_first_and_does_not_autostart() {
        let (mut ctl, sink) = controller();
        ctl.select_profile("alternating-square".into()).await.unwrap();
        ctl.start().await.unwrap();
        sink.clear();

        ctl.select_profile("alternating-square".into()).await.unwrap();

        // The running profile was stopped: both pumps disabled.
        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent
            .iter()
            .all(|(_, command)| *command == PumpCommand::disable()));
        assert!(!ctl.running);
        assert!(ctl.ticker.is_none());
        assert!(ctl.selected.is_some());
    }

    #[tokio::test]
    async fn unknown_profile_is_rejected() {
        let (mut ctl, _sink) = controller();
        assert!(matches!(
            ctl.select_profile("missing".into()).await.unwrap_err(),
            ControllerError::UnknownProfile(_)
        ));
    }

    #[tokio::test]
    async fn concentration_blends_enabled_flows() {
        let (mut ctl, _sink) = controller();

        // Both pumps idle: zero total flow saturates to zero.
        assert_eq!(ctl.concentration().concentration, 0.0);

        ctl.dispatch(
            PumpId(1),
            PumpCommand {
                enable: Some(true),
                rpm: Some(100.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        // Only pump 1 flowing: output equals its reservoir concentration.
        let reading = ctl.concentration();
        assert_eq!(reading.concentration, 10.0);
        assert!(reading.flows[0].flow_rate > 0.0);
        assert_eq!(reading.flows[1].flow_rate, 0.0);
    }

    #[tokio::test]
    async fn spawned_controller_serializes_events_before_requests() {
        let sink = RecordingSink::default();
        let (events_tx, events_rx) = broadcast::channel(16);
        let handle = spawn(test_config(), sink.clone(), events_rx, Metrics::new());

        handle.dispatch(PumpId(1), rpm_command(100.0)).await.unwrap();

        // Queue an authoritative status, then read: the biased select
        // drains the status stream first, so the read observes it.
        events_tx
            .send(MqttEvent::Publish {
                topic: "pump/1/status".into(),
                payload: br#"{"enable":true,"direction":true,"rpm":120.0,"microstep":0}"#.to_vec(),
            })
            .unwrap();

        let status = handle.read_status(PumpId(1)).await.unwrap();
        assert_eq!(status.rpm, 120.0);
        assert!(status.enable);
    }

    #[tokio::test]
    async fn updates_are_broadcast_to_subscribers() {
        let sink = RecordingSink::default();
        let (_events_tx, events_rx) = broadcast::channel(16);
        let handle = spawn(test_config(), sink, events_rx, Metrics::new());

        let mut updates = handle.updates();
        handle.dispatch(PumpId(2), rpm_command(60.0)).await.unwrap();

        let update = updates.recv().await.unwrap();
        assert_eq!(update.topic, "pump/2/status");
        assert_eq!(update.payload.rpm, 60.0);
    }

    #[tokio::test]
    async fn live_timer_fires_and_advances_phases() {
        let sink = RecordingSink::default();
        let (_events_tx, events_rx) = broadcast::channel(16);
        let mut config = test_config();
        config.profiles = ProfileLibrary::from_json_str(
            r#"[{
                "id": "fast",
                "name": "Fast",
                "description": "",
                "parameters": {
                    "interval_secs": 0.02,
                    "phases": [
                        {"pump1": {"enable": true}, "pump2": {"enable": false}},
                        {"pump1": {"enable": false}, "pump2": {"enable": true}}
                    ]
                }
            }]"#,
        )
        .unwrap();
        let handle = spawn(config, sink.clone(), events_rx, Metrics::new());

        handle.select_profile("fast").await.unwrap();
        handle.start_profile().await.unwrap();
        tokio::time::sleep(Duration::from_millis(70)).await;
        handle.stop_profile().await.unwrap();

        // Phase 0 immediately (2 commands), at least one tick (2 more),
        // plus 2 disables from stop.
        let sent = sink.sent();
        assert!(sent.len() >= 6, "expected >= 6 commands, got {}", sent.len());
        let snapshot = handle.schedule().await.unwrap();
        assert!(!snapshot.running);
    }
}
