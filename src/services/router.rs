//! Event router: owns the inbound connection and turns frames into notifications.
//!
//! Notes
//! - One thread per router reads frames and handles them one at a time, in arrival order.
//! - Field snapshots reach subscribers through the store, so anything merged into the store
//!   (by the router or by the host) is fanned out the same way.
//! - Status notifications are published only when the status actually changes.
//! - Stopping closes the live connection and cancels a pending reconnect delay.

use crate::models::field::{FieldId, FieldState};
use crate::models::notice::{Alert, AlertKind, Diagnostic, DiagnosticKind};
use crate::models::reading::RangeTable;
use crate::models::wire::{ConnectionStatus, InboundFrame, Recommendation, RecommendationBody, RecommendationParts};
use crate::services::fanout::{Dispatcher, Notification, Topic};
use crate::services::normalizer::ReadingNormalizer;
use crate::services::store::{FieldFilter, FieldStateStore, FieldUpdate};
use crate::services::subscription::Subscription;
use crate::services::transport::{Frame, FrameSource, Transport, TransportError};
use crate::utils::{self, coerce_finite, non_empty_str};
use chrono::Utc;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, info, warn};
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Capped exponential backoff with multiplicative jitter.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// 0.2 means each delay lands within ±20 % of the nominal value.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial: Duration::from_millis(1000),
            max: Duration::from_millis(30_000),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let nominal = self.initial.saturating_mul(factor).min(self.max);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return nominal;
        }
        let scale = rand::rng().random_range(1.0 - jitter..=1.0 + jitter);
        nominal.mul_f64(scale).min(self.max)
    }
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub default_field_id: FieldId,
    /// Lowercased MAC address to field.
    pub device_fields: HashMap<String, FieldId>,
    pub normalizer: ReadingNormalizer,
    pub ranges: Arc<RangeTable>,
    pub backoff: BackoffPolicy,
    pub battery_low_pct: f64,
    pub queue_warn: usize,
}

impl RouterSettings {
    pub fn new(default_field_id: FieldId) -> Self {
        RouterSettings {
            default_field_id,
            device_fields: HashMap::new(),
            normalizer: ReadingNormalizer::default(),
            ranges: Arc::new(RangeTable::defaults()),
            backoff: BackoffPolicy::default(),
            battery_low_pct: 20.0,
            queue_warn: 1024,
        }
    }

    pub fn with_device(mut self, mac_address: &str, field_id: FieldId) -> Self {
        self.device_fields
            .insert(mac_address.trim().to_ascii_lowercase(), field_id);
        self
    }
}

/// What one frame produced. Everything in here has already been published.
#[derive(Debug, Clone, Default)]
pub struct FrameOutcome {
    pub snapshot: Option<Arc<FieldState>>,
    pub recommendation: Option<Arc<Recommendation>>,
    pub diagnostics: Vec<DiagnosticKind>,
    pub alerts: usize,
}

enum SessionEnd {
    Stopped,
    Closed,
    Failed(TransportError),
}

pub struct EventRouter {
    store: FieldStateStore,
    dispatcher: Arc<Dispatcher>,
    settings: RouterSettings,
    state: Mutex<ConnectionState>,
    last_status: Mutex<Option<ConnectionStatus>>,
    store_feed: Subscription,
}

impl EventRouter {
    pub fn new(store: FieldStateStore, settings: RouterSettings) -> Arc<Self> {
        let dispatcher = Dispatcher::new(settings.queue_warn);
        let feed = Arc::clone(&dispatcher);
        let store_feed = store.subscribe(FieldFilter::All, move |snapshot| {
            feed.publish(Notification::Field(Arc::clone(snapshot)));
        });
        Arc::new(EventRouter {
            store,
            dispatcher,
            settings,
            state: Mutex::new(ConnectionState::Disconnected),
            last_status: Mutex::new(None),
            store_feed,
        })
    }

    pub fn subscribe<F>(&self, topic: Topic, callback: F) -> Subscription
    where
        F: Fn(&Notification) + Send + 'static,
    {
        self.dispatcher.subscribe(topic, callback)
    }

    pub fn store(&self) -> &FieldStateStore {
        &self.store
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    pub fn connection_state(&self) -> ConnectionState {
        *utils::lock(&self.state)
    }

    pub fn last_status(&self) -> Option<ConnectionStatus> {
        *utils::lock(&self.last_status)
    }

    /// Stops forwarding store snapshots and detaches every subscriber. Also runs on drop.
    pub fn shutdown(&self) {
        self.store_feed.unsubscribe();
        self.dispatcher.close();
    }

    /// Spawns the connection thread. The router keeps reconnecting until the handle is stopped.
    pub fn start(self: &Arc<Self>, transport: Box<dyn Transport>) -> io::Result<RouterHandle> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let router = Arc::clone(self);
        let thread = thread::Builder::new()
            .name("event-router".to_string())
            .spawn(move || router.run(transport, stop_rx))?;
        Ok(RouterHandle {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Handles one text frame. Never fails: problems become diagnostics.
    pub fn handle_frame(&self, raw: &str) -> FrameOutcome {
        let received_at = Utc::now();
        let mut outcome = FrameOutcome::default();

        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                self.diagnose(&mut outcome, DiagnosticKind::MalformedFrame, format!("invalid JSON: {}", e), raw);
                return outcome;
            }
        };
        if !value.is_object() {
            self.diagnose(&mut outcome, DiagnosticKind::MalformedFrame, "frame is not a JSON object", raw);
            return outcome;
        }
        let frame: InboundFrame = match serde_json::from_value(value) {
            Ok(f) => f,
            Err(e) => {
                self.diagnose(&mut outcome, DiagnosticKind::MalformedFrame, e.to_string(), raw);
                return outcome;
            }
        };
        if !frame.is_sensor_event() && !frame.is_recommendation() {
            debug!("Ignoring frame without sensor data or recommendation");
            return outcome;
        }

        let mut field_id = explicit_field(frame.field_id.as_ref());
        let mut phase = None;

        if let Some(sensor_data) = &frame.sensor_data {
            match self.settings.normalizer.normalize(sensor_data, received_at) {
                Ok(event) => {
                    let target = field_id
                        .clone()
                        .or_else(|| {
                            explicit_field(sensor_data.get("fieldId").or_else(|| sensor_data.get("field_id")))
                        })
                        .or_else(|| self.device_field(event.mac_address.as_deref()))
                        .unwrap_or_else(|| self.settings.default_field_id.clone());
                    if event.dropped > 0 {
                        debug!("Field {}: {} reading(s) dropped from event", target, event.dropped);
                    }
                    let battery_level = event
                        .battery_level
                        .or_else(|| frame.battery_level.as_ref().and_then(coerce_finite));

                    if !event.readings.is_empty() || battery_level.is_some() {
                        let update = FieldUpdate {
                            readings: &event.readings,
                            battery_level,
                            mac_address: event.mac_address.as_deref(),
                            phase: event.phase.as_deref(),
                        };
                        outcome.snapshot = self.apply(&target, update, &mut outcome.alerts);
                    }
                    phase = event.phase;
                    field_id = Some(target);
                }
                Err(e) => {
                    self.diagnose(&mut outcome, DiagnosticKind::MalformedEvent, e.to_string(), raw);
                }
            }
        }

        if frame.is_recommendation() {
            let details = frame.recommandations.clone().unwrap_or(Value::Null);
            let body = if details.is_null() {
                RecommendationBody::default()
            } else {
                match RecommendationBody::decode(&details) {
                    Ok(body) => body,
                    Err(e) => {
                        let detail = format!("{} at {}", e.inner(), e.path());
                        self.diagnose(&mut outcome, DiagnosticKind::MalformedRecommendation, detail, raw);
                        RecommendationBody::default()
                    }
                }
            };
            let snapshot = outcome.snapshot.clone().or_else(|| {
                field_id
                    .as_ref()
                    .and_then(|id| self.store.get(id.as_str()).ok())
                    .filter(|s| !s.is_empty())
            });
            let recommendation = Arc::new(Recommendation::assemble(RecommendationParts {
                id: frame.recommendation_id.clone(),
                body,
                details,
                evaluation: frame.evaluation.clone(),
                phase: phase.or_else(|| snapshot.as_ref().and_then(|s| s.phase.clone())),
                field_id,
                snapshot,
                received_at,
            }));
            info!("Recommendation {} received: {}", recommendation.id, recommendation.title);
            self.dispatcher
                .publish(Notification::Recommendation(Arc::clone(&recommendation)));
            outcome.recommendation = Some(recommendation);
        }

        outcome
    }

    fn apply(&self, field_id: &FieldId, update: FieldUpdate<'_>, alerts: &mut usize) -> Option<Arc<FieldState>> {
        match self.store.merge_tracked(field_id.as_str(), update, &self.settings.ranges) {
            Ok(merged) => {
                *alerts += self.raise_alerts(&merged.before, &merged.after);
                Some(merged.after)
            }
            Err(e) => {
                warn!("Dropping update: {}", e);
                None
            }
        }
    }

    /// Alerts fire when a condition starts, not while it persists.
    fn raise_alerts(&self, previous: &FieldState, current: &FieldState) -> usize {
        let mut raised = Vec::new();
        let threshold = self.settings.battery_low_pct;

        if let Some(level) = current.battery_level
            && level < threshold
            && !previous.battery_level.is_some_and(|p| p < threshold)
        {
            raised.push(AlertKind::BatteryLow { level, threshold });
        }

        for (sensor_type, slot) in &current.readings {
            let Some(limit) = self.settings.ranges.critical_limit(*sensor_type) else {
                continue;
            };
            let value = slot.current.value;
            let was_over = previous.current_value(*sensor_type).is_some_and(|v| v > limit);
            if value > limit && !was_over {
                raised.push(AlertKind::CriticalLevel {
                    sensor_type: *sensor_type,
                    value,
                    limit,
                });
            }
        }

        let count = raised.len();
        for kind in raised {
            let alert = Alert {
                field_id: current.field_id.clone(),
                kind,
                raised_at: Utc::now(),
            };
            warn!("Alert: {}", alert.message());
            self.dispatcher.publish(Notification::Alert(Arc::new(alert)));
        }
        count
    }

    fn device_field(&self, mac_address: Option<&str>) -> Option<FieldId> {
        let mac = mac_address?.trim().to_ascii_lowercase();
        self.settings.device_fields.get(&mac).cloned()
    }

    fn diagnose(&self, outcome: &mut FrameOutcome, kind: DiagnosticKind, detail: impl Into<String>, raw: &str) {
        let diagnostic = Diagnostic::new(kind, detail, Some(raw));
        warn!("{:?}: {}", diagnostic.kind, diagnostic.detail);
        outcome.diagnostics.push(kind);
        self.dispatcher.publish(Notification::Diagnostic(Arc::new(diagnostic)));
    }

    fn set_state(&self, state: ConnectionState) {
        *utils::lock(&self.state) = state;
    }

    fn emit_status(&self, status: ConnectionStatus) {
        {
            let mut last = utils::lock(&self.last_status);
            if *last == Some(status) {
                return;
            }
            *last = Some(status);
        }
        info!("Connection status: {}", status);
        self.dispatcher.publish(Notification::Status(status));
    }

    fn run(&self, mut transport: Box<dyn Transport>, stop: Receiver<()>) {
        info!("Event router starting on {}", transport.describe());
        let mut attempt: u32 = 0;

        loop {
            if stop_requested(&stop) {
                break;
            }
            self.set_state(ConnectionState::Connecting);
            match transport.connect() {
                Ok(mut source) => {
                    attempt = 0;
                    self.set_state(ConnectionState::Connected);
                    info!("Connected to {}", transport.describe());
                    self.emit_status(ConnectionStatus::Connected);

                    let end = self.pump(source.as_mut(), &stop);
                    source.close();
                    self.set_state(ConnectionState::Disconnected);
                    match end {
                        SessionEnd::Stopped => {
                            self.emit_status(ConnectionStatus::Disconnected);
                            break;
                        }
                        SessionEnd::Closed => {
                            info!("Stream {} closed by peer", transport.describe());
                            self.emit_status(ConnectionStatus::Disconnected);
                        }
                        SessionEnd::Failed(e) => {
                            warn!("Stream {} failed: {}", transport.describe(), e);
                            self.emit_status(ConnectionStatus::Error);
                        }
                    }
                }
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    warn!("Could not connect to {}: {}", transport.describe(), e);
                    self.emit_status(ConnectionStatus::Error);
                }
            }

            let delay = self.settings.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!("Reconnecting in {} ms", delay.as_millis());
            match stop.recv_timeout(delay) {
                Err(RecvTimeoutError::Timeout) => continue,
                _ => break,
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Event router stopped");
    }

    fn pump(&self, source: &mut dyn FrameSource, stop: &Receiver<()>) -> SessionEnd {
        loop {
            if stop_requested(stop) {
                return SessionEnd::Stopped;
            }
            match source.next_frame() {
                Ok(Frame::Text(text)) => {
                    self.handle_frame(&text);
                }
                Ok(Frame::Idle) => continue,
                Ok(Frame::Closed) => return SessionEnd::Closed,
                Err(e) => return SessionEnd::Failed(e),
            }
        }
    }
}

impl Drop for EventRouter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn explicit_field(value: Option<&Value>) -> Option<FieldId> {
    value
        .and_then(non_empty_str)
        .and_then(|s| FieldId::new(s).ok())
}

fn stop_requested(stop: &Receiver<()>) -> bool {
    !matches!(stop.try_recv(), Err(TryRecvError::Empty))
}

/// Stops the connection thread when told to or when dropped.
pub struct RouterHandle {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl RouterHandle {
    pub fn stop(&mut self) {
        // dropping the sender wakes both the read loop and a pending backoff
        self.stop_tx.take();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("Event router thread panicked");
        }
    }

    /// Blocks until the connection thread exits on its own.
    pub fn wait(mut self) {
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("Event router thread panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for RouterHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::reading::SensorType;
    use std::collections::VecDeque;
    use std::time::Instant;

    /// How a scripted session ends once its frames run out.
    #[derive(Clone, Copy)]
    enum Ending {
        Close,
        Reset,
        /// Idle until stopped.
        Linger,
    }

    struct ScriptedSource {
        frames: VecDeque<Frame>,
        ending: Ending,
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<Frame, TransportError> {
            if let Some(frame) = self.frames.pop_front() {
                return Ok(frame);
            }
            match self.ending {
                Ending::Close => Ok(Frame::Closed),
                Ending::Reset => Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                ))),
                Ending::Linger => {
                    thread::sleep(Duration::from_millis(5));
                    Ok(Frame::Idle)
                }
            }
        }
    }

    enum Session {
        Refused,
        Frames(Vec<Frame>, Ending),
    }

    fn closing(frames: Vec<Frame>) -> Session {
        Session::Frames(frames, Ending::Close)
    }

    /// Each connect takes the next session. Once the script is exhausted every connect yields
    /// an idle session.
    struct ScriptedTransport {
        sessions: VecDeque<Session>,
    }

    impl ScriptedTransport {
        fn new(sessions: Vec<Session>) -> Box<Self> {
            Box::new(ScriptedTransport {
                sessions: sessions.into(),
            })
        }
    }

    impl Transport for ScriptedTransport {
        fn connect(&mut self) -> Result<Box<dyn FrameSource>, TransportError> {
            match self.sessions.pop_front() {
                Some(Session::Frames(frames, ending)) => Ok(Box::new(ScriptedSource {
                    frames: frames.into(),
                    ending,
                })),
                Some(Session::Refused) => Err(TransportError::Connect("refused".to_string())),
                None => Ok(Box::new(ScriptedSource {
                    frames: VecDeque::new(),
                    ending: Ending::Linger,
                })),
            }
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    fn settings() -> RouterSettings {
        let mut settings = RouterSettings::new(FieldId::new("field-1").unwrap());
        settings.backoff = BackoffPolicy {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(40),
            jitter: 0.2,
        };
        settings
    }

    fn router() -> Arc<EventRouter> {
        EventRouter::new(FieldStateStore::new(), settings())
    }

    fn text(s: &str) -> Frame {
        Frame::Text(s.to_string())
    }

    fn collect(router: &EventRouter, topic: Topic) -> (Subscription, Receiver<Notification>) {
        let (tx, rx) = channel::unbounded();
        let sub = router.subscribe(topic, move |n| {
            let _ = tx.send(n.clone());
        });
        (sub, rx)
    }

    fn statuses(rx: &Receiver<Notification>, n: usize) -> Vec<ConnectionStatus> {
        (0..n)
            .map(|_| match rx.recv_timeout(Duration::from_secs(2)) {
                Ok(Notification::Status(s)) => s,
                other => panic!("expected a status, got {:?}", other),
            })
            .collect()
    }

    #[test]
    fn ph_event_lands_in_default_field() {
        let router = router();
        let outcome = router.handle_frame(r#"{"sensor_data":{"readings":[{"type":"PH","value":6.2,"unit":"pH"}]}}"#);
        assert!(outcome.diagnostics.is_empty());
        let state = router.store().get("field-1").unwrap();
        assert_eq!(state.current_value(SensorType::Ph), Some(6.2));
        assert_eq!(outcome.snapshot.map(|s| s.revision), Some(1));
    }

    #[test]
    fn non_numeric_value_skips_merge_without_error() {
        let router = router();
        let (_sub, rx) = collect(&router, Topic::Fields(FieldFilter::All));
        let outcome = router.handle_frame(r#"{"sensor_data":{"readings":[{"type":"ph","value":"not-a-number"}]}}"#);
        assert!(outcome.snapshot.is_none());
        assert!(outcome.diagnostics.is_empty());
        assert!(router.store().get("field-1").unwrap().is_empty());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn invalid_json_becomes_a_diagnostic() {
        let router = router();
        let (_sub, rx) = collect(&router, Topic::Diagnostics);
        let outcome = router.handle_frame("{not json");
        assert_eq!(outcome.diagnostics, vec![DiagnosticKind::MalformedFrame]);
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(Notification::Diagnostic(d)) => {
                assert_eq!(d.kind, DiagnosticKind::MalformedFrame);
                assert_eq!(d.excerpt.as_deref(), Some("{not json"));
            }
            other => panic!("expected a diagnostic, got {:?}", other),
        }

        let outcome = router.handle_frame("[1, 2, 3]");
        assert_eq!(outcome.diagnostics, vec![DiagnosticKind::MalformedFrame]);
    }

    #[test]
    fn frames_without_known_keys_are_ignored() {
        let router = router();
        let outcome = router.handle_frame(r#"{"heartbeat": 1}"#);
        assert!(outcome.diagnostics.is_empty());
        assert!(outcome.snapshot.is_none() && outcome.recommendation.is_none());
    }

    #[test]
    fn bad_sensor_data_does_not_block_the_recommendation() {
        let router = router();
        let outcome = router.handle_frame(r#"{"sensor_data":{"macAddress":"x"},"recommendation_id":"r1","recommandations":{"resume_vocal":"water now"}}"#);
        assert_eq!(outcome.diagnostics, vec![DiagnosticKind::MalformedEvent]);
        let rec = outcome.recommendation.expect("recommendation still delivered");
        assert_eq!(rec.id, "r1");
        assert_eq!(rec.description, "water now");
    }

    #[test]
    fn undecodable_recommendation_body_falls_back() {
        let router = router();
        let outcome = router.handle_frame(
            r#"{"sensor_data":{"readings":[{"type":"moisture","value":30}]},"recommandations":{"risques_detectes":"none"}}"#,
        );
        assert_eq!(outcome.diagnostics, vec![DiagnosticKind::MalformedRecommendation]);
        assert!(outcome.snapshot.is_some());
        let rec = outcome.recommendation.unwrap();
        assert!(rec.risks.is_empty());
        assert_eq!(rec.details["risques_detectes"], "none");
    }

    #[test]
    fn full_frame_fixture_merges_and_publishes_recommendation() {
        let raw = std::fs::read_to_string("tests/data/recommendation-frame.json").unwrap();
        let router = EventRouter::new(
            FieldStateStore::new(),
            RouterSettings {
                normalizer: ReadingNormalizer::with_aliases([("plomb", SensorType::Lead)]),
                ..settings()
            }
            .with_device("a4:cf:12:9b:3e:01", FieldId::new("north").unwrap()),
        );
        let (_fields, field_rx) = collect(&router, Topic::Fields(FieldFilter::All));
        let (_recs, rec_rx) = collect(&router, Topic::Recommendations);

        let outcome = router.handle_frame(&raw);
        assert!(outcome.diagnostics.is_empty(), "{:?}", outcome.diagnostics);

        let state = router.store().get("north").unwrap();
        assert_eq!(state.readings.len(), 10);
        assert_eq!(state.current_value(SensorType::Moisture), Some(31.5));
        assert_eq!(state.current_value(SensorType::Ph), Some(6.4));
        assert_eq!(state.current_value(SensorType::Lead), Some(0.02));
        assert_eq!(state.battery_level, Some(64.0));
        assert_eq!(state.phase.as_deref(), Some("flowering"));

        match field_rx.recv_timeout(Duration::from_secs(1)) {
            Ok(Notification::Field(s)) => assert_eq!(s.field_id.as_str(), "north"),
            other => panic!("expected a field snapshot, got {:?}", other),
        }
        match rec_rx.recv_timeout(Duration::from_secs(1)) {
            Ok(Notification::Recommendation(rec)) => {
                assert_eq!(rec.id, "rec-2025-05-15-001");
                assert_eq!(rec.title, "Recommendation for flowering");
                assert_eq!(rec.description, "Irrigate lightly tonight and watch for mildew.");
                assert_eq!(rec.actions.len(), 2);
                assert_eq!(rec.field_id.as_ref().map(FieldId::as_str), Some("north"));
                let derived = rec.derived_from_reading_snapshot.as_ref().unwrap();
                assert_eq!(derived.revision, state.revision);
            }
            other => panic!("expected a recommendation, got {:?}", other),
        }
    }

    #[test]
    fn explicit_field_id_wins_over_device_map() {
        let router = EventRouter::new(
            FieldStateStore::new(),
            settings().with_device("AA:BB", FieldId::new("mapped").unwrap()),
        );
        router.handle_frame(r#"{"fieldId":"explicit","sensor_data":{"macAddress":"aa:bb","readings":[{"type":"tds","value":250}]}}"#);
        router.handle_frame(r#"{"sensor_data":{"macAddress":"aa:bb","readings":[{"type":"tds","value":260}]}}"#);
        router.handle_frame(r#"{"sensor_data":{"macAddress":"cc:dd","readings":[{"type":"tds","value":270}]}}"#);

        let store = router.store();
        assert_eq!(store.get("explicit").unwrap().current_value(SensorType::Tds), Some(250.0));
        assert_eq!(store.get("mapped").unwrap().current_value(SensorType::Tds), Some(260.0));
        assert_eq!(store.get("field-1").unwrap().current_value(SensorType::Tds), Some(270.0));
    }

    #[test]
    fn battery_alert_fires_once_per_crossing() {
        let router = router();
        let (_sub, rx) = collect(&router, Topic::Alerts);
        let frame = |level: u32| format!(r#"{{"sensor_data":{{"readings":[]}},"batteryLevel":{}}}"#, level);

        assert_eq!(router.handle_frame(&frame(50)).alerts, 0);
        assert_eq!(router.handle_frame(&frame(15)).alerts, 1);
        assert_eq!(router.handle_frame(&frame(12)).alerts, 0);
        assert_eq!(router.handle_frame(&frame(80)).alerts, 0);
        assert_eq!(router.handle_frame(&frame(10)).alerts, 1);

        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(Notification::Alert(alert)) => {
                assert_eq!(alert.kind, AlertKind::BatteryLow { level: 15.0, threshold: 20.0 });
            }
            other => panic!("expected an alert, got {:?}", other),
        }
    }

    #[test]
    fn heavy_metal_over_limit_raises_critical_alert() {
        let router = router();
        let outcome = router.handle_frame(r#"{"sensor_data":{"readings":[{"type":"lead","value":0.3},{"type":"arsenic","value":0.01}]}}"#);
        assert_eq!(outcome.alerts, 1);
        let outcome = router.handle_frame(r#"{"sensor_data":{"readings":[{"type":"lead","value":0.4}]}}"#);
        assert_eq!(outcome.alerts, 0);
    }

    #[test]
    fn reconnect_publishes_one_disconnected_then_one_connected() {
        let router = router();
        let (_status, status_rx) = collect(&router, Topic::Status);
        let (_fields, field_rx) = collect(&router, Topic::Fields(FieldFilter::All));

        let transport = ScriptedTransport::new(vec![closing(vec![
            text(r#"{"sensor_data":{"readings":[{"type":"humidity","value":55}]}}"#),
            Frame::Idle,
        ])]);
        let mut handle = router.start(transport).unwrap();

        assert_eq!(
            statuses(&status_rx, 3),
            vec![
                ConnectionStatus::Connected,
                ConnectionStatus::Disconnected,
                ConnectionStatus::Connected
            ]
        );
        // only the one data frame produced a snapshot; the drop itself did not
        assert!(matches!(field_rx.recv_timeout(Duration::from_secs(1)), Ok(Notification::Field(_))));
        assert!(field_rx.recv_timeout(Duration::from_millis(100)).is_err());

        handle.stop();
        assert_eq!(router.connection_state(), ConnectionState::Disconnected);
        assert_eq!(statuses(&status_rx, 1), vec![ConnectionStatus::Disconnected]);
    }

    #[test]
    fn mid_stream_failure_reports_error_then_reconnects() {
        let router = router();
        let (_status, status_rx) = collect(&router, Topic::Status);
        let (_fields, field_rx) = collect(&router, Topic::Fields(FieldFilter::All));

        let transport = ScriptedTransport::new(vec![Session::Frames(
            vec![text(r#"{"sensor_data":{"readings":[{"type":"ph","value":6.1}]}}"#)],
            Ending::Reset,
        )]);
        let mut handle = router.start(transport).unwrap();

        assert_eq!(
            statuses(&status_rx, 3),
            vec![
                ConnectionStatus::Connected,
                ConnectionStatus::Error,
                ConnectionStatus::Connected
            ]
        );
        assert_eq!(router.connection_state(), ConnectionState::Connected);
        // the frame read before the reset was kept
        assert!(matches!(field_rx.recv_timeout(Duration::from_secs(1)), Ok(Notification::Field(_))));
        assert_eq!(router.store().get("field-1").unwrap().current_value(SensorType::Ph), Some(6.1));

        handle.stop();
        assert_eq!(statuses(&status_rx, 1), vec![ConnectionStatus::Disconnected]);
    }

    #[test]
    fn dropping_the_router_detaches_it_from_a_shared_store() {
        let store = FieldStateStore::new();
        let router = EventRouter::new(store.clone(), settings());
        let (sub, rx) = collect(&router, Topic::Fields(FieldFilter::All));
        assert_eq!(store.subscriber_count(), 1);

        drop(router);
        assert_eq!(store.subscriber_count(), 0);
        assert!(!sub.is_active());

        let update = FieldUpdate {
            battery_level: Some(50.0),
            ..Default::default()
        };
        store.merge("field-1", update, &RangeTable::defaults()).unwrap();
        // the worker exited with the router, so the channel closes without a delivery
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(1)),
            Err(RecvTimeoutError::Disconnected)
        ));
    }

    #[test]
    fn refused_connection_reports_error_then_recovers() {
        let router = router();
        let (_status, status_rx) = collect(&router, Topic::Status);
        let mut handle = router
            .start(ScriptedTransport::new(vec![Session::Refused, Session::Refused]))
            .unwrap();

        // two refusals in a row publish a single error
        assert_eq!(
            statuses(&status_rx, 2),
            vec![ConnectionStatus::Error, ConnectionStatus::Connected]
        );
        assert_eq!(router.connection_state(), ConnectionState::Connected);
        handle.stop();
    }

    #[test]
    fn stop_interrupts_backoff_promptly() {
        let mut settings = settings();
        settings.backoff = BackoffPolicy {
            initial: Duration::from_secs(30),
            max: Duration::from_secs(30),
            jitter: 0.0,
        };
        let router = EventRouter::new(FieldStateStore::new(), settings);
        let (_status, status_rx) = collect(&router, Topic::Status);
        let mut handle = router.start(ScriptedTransport::new(vec![Session::Refused])).unwrap();
        assert_eq!(statuses(&status_rx, 1), vec![ConnectionStatus::Error]);

        let started = Instant::now();
        handle.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!handle.is_running());
    }

    #[test]
    fn slow_field_subscriber_does_not_hold_up_others() {
        let router = router();
        let _slow = router.subscribe(Topic::Fields(FieldFilter::All), |_| thread::sleep(Duration::from_millis(500)));
        let (_fast, rx) = collect(&router, Topic::Fields(FieldFilter::All));

        let started = Instant::now();
        router.handle_frame(r#"{"fieldId":"north","sensor_data":{"readings":[{"type":"ph","value":6.5}]}}"#);
        router.handle_frame(r#"{"fieldId":"south","sensor_data":{"readings":[{"type":"ph","value":6.6}]}}"#);
        for _ in 0..2 {
            rx.recv_timeout(Duration::from_millis(300)).expect("fast subscriber served");
        }
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            jitter: 0.2,
        };
        for _ in 0..20 {
            let first = policy.delay(0);
            assert!(first >= Duration::from_millis(80) && first <= Duration::from_millis(120));
            let third = policy.delay(2);
            assert!(third >= Duration::from_millis(320) && third <= Duration::from_millis(480));
            assert!(policy.delay(30) <= Duration::from_millis(1000));
        }
        let fixed = BackoffPolicy { jitter: 0.0, ..policy };
        assert_eq!(fixed.delay(1), Duration::from_millis(200));
    }
}
