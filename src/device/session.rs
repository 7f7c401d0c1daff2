//! The breath sensor session: connection state machine, calibration, and
//! the public command/property/subscription surface.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cancel::CancelScope;
use crate::config::SessionConfig;
use crate::device::constants::{
    make_melody_smart_data_uuid, make_melody_smart_service_uuid, BREATH_RANGE,
    COMMAND_REQUEST_BREATH,
};
use crate::device::signal::{interpret, mean, parse_breath_frame};
use crate::device::types::ReadyState;
use crate::error::{CalibrationAbort, CancelReason, SessionError};
use crate::events::{EventRegistry, ListenerId};
use crate::ticker::Ticker;
use crate::transport::{
    Characteristic as _, CharacteristicOf, Connection as _, ConnectionOf, Device as _,
    DeviceFilter, DeviceOf, NotificationsOf, Service as _, Transport, TransportError,
};

/// One session with a single breath sensor peripheral: device selection,
/// connection upkeep with automatic reconnection, breath polling,
/// dead-zone conditioning and calibration.
///
/// Listeners registered through the `on_*` methods run synchronously on
/// the task that emits the event; they must not call back into the
/// session.
pub struct BreathSession<T: Transport> {
    shared: Arc<Shared<T>>,
}

struct Shared<T: Transport> {
    transport: T,
    config: SessionConfig,
    ticker: Ticker,
    inner: Mutex<Inner<T>>,
}

struct Link<T: Transport> {
    connection: ConnectionOf<T>,
    characteristic: CharacteristicOf<T>,
}

struct Reader {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Calibration {
    samples: Vec<f64>,
    offset: f64,
    pending: Option<oneshot::Sender<Result<(), SessionError>>>,
}

struct Inner<T: Transport> {
    ready_state: ReadyState,
    device: Option<DeviceOf<T>>,
    link: Option<Link<T>>,
    reader: Option<Reader>,
    last_attempt: Option<Instant>,
    dead_zone: f64,
    // cancels everything tied to the current connect/poll cycle; replaced
    // by each connect() call so a stale cancellation cannot reach a newer
    // attempt
    cancel: CancellationToken,
    breath_value: Option<f64>,
    calibration: Calibration,
    connected: Option<oneshot::Sender<Result<(), SessionError>>>,
    events: EventRegistry,
}

impl<T: Transport> Inner<T> {
    /// Apply a state change: validate the transition, clear the last
    /// reading, notify observers.
    ///
    /// # Panics
    ///
    /// Panics on a transition outside the session lifecycle graph; that is
    /// a defect, not a recoverable condition.
    fn transition(&mut self, to: ReadyState) {
        let from = self.ready_state;
        assert!(
            from.valid_transition(to),
            "illegal ready-state transition: {from:?} -> {to:?}"
        );

        debug!("Ready state {:?} -> {:?}", from, to);
        self.ready_state = to;
        self.breath_value = None;
        self.events.emit_ready_state_change(to);
    }

    fn abort_calibration(&mut self, reason: CalibrationAbort) {
        self.calibration.samples.clear();

        if let Some(pending) = self.calibration.pending.take() {
            let _ = pending.send(Err(SessionError::CalibrationAborted { reason }));
            self.events.emit_calibration_state_change(false);
        }
    }

    /// Cancel the notification reader and hand its task back for joining.
    fn stop_reader(&mut self) -> Option<Reader> {
        let reader = self.reader.take()?;
        reader.cancel.cancel();
        Some(reader)
    }
}

impl<T: Transport> BreathSession<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, SessionConfig::default())
    }

    /// # Panics
    ///
    /// Panics if the configured dead zone is not a fraction in `[0, 1)`.
    pub fn with_config(transport: T, config: SessionConfig) -> Self {
        let dead_zone = config.dead_zone;
        assert!(
            (0.0..1.0).contains(&dead_zone),
            "dead zone must be a fraction in [0, 1)"
        );

        let ticker = Ticker::new(Duration::from_millis(config.tick_interval));

        BreathSession {
            shared: Arc::new(Shared {
                transport,
                ticker,
                inner: Mutex::new(Inner {
                    ready_state: ReadyState::NoDevice,
                    device: None,
                    link: None,
                    reader: None,
                    last_attempt: None,
                    dead_zone,
                    cancel: CancellationToken::new(),
                    breath_value: None,
                    calibration: Calibration {
                        samples: Vec::new(),
                        offset: 0.0,
                        pending: None,
                    },
                    connected: None,
                    events: EventRegistry::default(),
                }),
                config,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.shared.inner.lock().unwrap()
    }

    pub fn ready_state(&self) -> ReadyState {
        self.lock().ready_state
    }

    /// The last normalized reading, cleared on every state change.
    pub fn breath_value(&self) -> Option<f64> {
        self.lock().breath_value
    }

    pub fn dead_zone(&self) -> f64 {
        self.lock().dead_zone
    }

    /// # Panics
    ///
    /// Panics if `value` is not a fraction in `[0, 1)`.
    pub fn set_dead_zone(&self, value: f64) {
        assert!(
            (0.0..1.0).contains(&value),
            "dead zone must be a fraction in [0, 1)"
        );
        self.lock().dead_zone = value;
    }

    pub fn can_request_device(&self) -> bool {
        self.lock().ready_state.can_request_device()
    }

    pub fn can_connect(&self) -> bool {
        self.lock().ready_state.can_connect()
    }

    pub fn can_disconnect(&self) -> bool {
        self.lock().ready_state.can_disconnect()
    }

    pub fn on_ready_state_change(
        &self,
        listener: impl Fn(ReadyState) + Send + 'static,
    ) -> ListenerId {
        self.lock().events.on_ready_state_change(listener)
    }

    pub fn on_breath(&self, listener: impl Fn(f64) + Send + 'static) -> ListenerId {
        self.lock().events.on_breath(listener)
    }

    pub fn on_calibration_state_change(
        &self,
        listener: impl Fn(bool) + Send + 'static,
    ) -> ListenerId {
        self.lock().events.on_calibration_state_change(listener)
    }

    pub fn on_error(&self, listener: impl Fn(&SessionError) + Send + 'static) -> ListenerId {
        self.lock().events.on_error(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.lock().events.unsubscribe(id)
    }

    /// Select the peripheral for this session. Aborts any pending
    /// calibration and resets the learned neutral offset: the physical
    /// peripheral identity may change.
    pub async fn request_device(&self) -> Result<(), SessionError> {
        {
            let mut inner = self.lock();
            if !inner.ready_state.can_request_device() {
                return Err(SessionError::DeviceRequestUnavailable {
                    state: inner.ready_state,
                });
            }

            inner.abort_calibration(CalibrationAbort::DeviceChanged);
            inner.calibration.offset = 0.0;
            inner.device = None;
            inner.transition(ReadyState::RequestingDevice);
        }

        let filter = DeviceFilter {
            service: make_melody_smart_service_uuid(),
        };
        let result = self.shared.transport.request_device(filter).await;

        let mut inner = self.lock();
        match result {
            Err(source) => {
                inner.transition(ReadyState::NoDevice);
                Err(SessionError::DeviceRequestFailed { source })
            }
            Ok(device) if !device.connectable() => {
                inner.transition(ReadyState::NoDevice);
                Err(SessionError::NotConnectable)
            }
            Ok(device) => {
                inner.device = Some(device);
                inner.transition(ReadyState::HaveDevice);
                Ok(())
            }
        }
    }

    /// Establish the connection and start the polling cycle. Resolves once
    /// the first successful connection completes; reconnection afterwards
    /// is automatic. A `disconnect()` while this is pending rejects it
    /// with a disconnect-requested cancellation.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let receiver = {
            let mut inner = self.lock();
            match inner.ready_state {
                ReadyState::HaveDevice => {}
                ReadyState::NoDevice | ReadyState::RequestingDevice => {
                    return Err(SessionError::NoDeviceSelected);
                }
                state => return Err(SessionError::AlreadyActive { state }),
            }

            // a zeroed retry clock makes the very next tick attempt
            // immediately
            inner.last_attempt = None;
            inner.cancel = CancellationToken::new();
            let (tx, rx) = oneshot::channel();
            inner.connected = Some(tx);
            inner.transition(ReadyState::Connecting);

            let shared = Arc::clone(&self.shared);
            self.shared.ticker.start(move || tick(Arc::clone(&shared)));

            rx
        };

        match receiver.await {
            Ok(result) => result,
            // the sender is only dropped without a verdict if the runtime
            // tears the tick task down
            Err(_) => Err(SessionError::Cancelled {
                reason: CancelReason::DisconnectRequested,
            }),
        }
    }

    /// Tear the session down to `HaveDevice`. Pending tick work observes
    /// cancellation, a pending calibration is rejected, the scheduler is
    /// stopped and settled, and the transport-level disconnect is
    /// best-effort within its deadline.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let (link, reader) = {
            let mut inner = self.lock();
            if !inner.ready_state.can_disconnect() {
                return Err(SessionError::NotConnected {
                    state: inner.ready_state,
                });
            }

            inner.cancel.cancel();
            inner.abort_calibration(CalibrationAbort::Disconnected);

            if let Some(connected) = inner.connected.take() {
                let _ = connected.send(Err(SessionError::Cancelled {
                    reason: CancelReason::DisconnectRequested,
                }));
            }

            (inner.link.take(), inner.stop_reader())
        };

        self.shared.ticker.stop().await;

        if let Some(reader) = reader {
            if let Err(err) = reader.handle.await {
                warn!("Notification reader did not settle cleanly: {err}");
            }
        }

        if let Some(link) = link {
            let deadline = Duration::from_millis(self.shared.config.disconnect_deadline);
            match tokio::time::timeout(deadline, link.connection.disconnect()).await {
                Err(_) => warn!("Disconnecting from the peripheral took too long"),
                Ok(Err(err)) => warn!("Failed to disconnect from the peripheral: {err}"),
                Ok(Ok(())) => info!("Disconnected from peripheral"),
            }
        }

        let mut inner = self.lock();
        if inner.ready_state.can_disconnect() {
            inner.transition(ReadyState::HaveDevice);
        }
        Ok(())
    }

    /// Learn the peripheral's neutral offset: divert the next
    /// `calibration_samples` raw readings into a sample window and store
    /// their rounded mean. Resolves when the window fills; rejects if the
    /// session disconnects, the device is re-requested, or a newer
    /// calibration supersedes this one. A transient link loss does not
    /// abort it — sampling resumes after the automatic reconnect.
    pub async fn calibrate(&self) -> Result<(), SessionError> {
        let receiver = {
            let mut inner = self.lock();
            if !inner.ready_state.can_disconnect() {
                return Err(SessionError::NotConnected {
                    state: inner.ready_state,
                });
            }

            inner.abort_calibration(CalibrationAbort::Superseded);

            let (tx, rx) = oneshot::channel();
            inner.calibration.pending = Some(tx);
            inner.events.emit_calibration_state_change(true);

            rx
        };

        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(SessionError::CalibrationAborted {
                reason: CalibrationAbort::Disconnected,
            }),
        }
    }
}

/// What a tick decided to do while it held the lock.
enum TickPlan<T: Transport> {
    Idle,
    Defect(ReadyState),
    Attempt {
        device: DeviceOf<T>,
        cancel: CancellationToken,
    },
    Poll {
        connection: ConnectionOf<T>,
        characteristic: CharacteristicOf<T>,
        cancel: CancellationToken,
    },
}

/// One scheduled invocation: advance the connection or poll for a fresh
/// reading. Transport I/O happens outside the lock; results are applied
/// only if the cycle's token is still live.
async fn tick<T: Transport>(shared: Arc<Shared<T>>) -> Result<(), SessionError> {
    let now = Instant::now();

    let plan = {
        let mut inner = shared.inner.lock().unwrap();
        match inner.ready_state {
            state @ (ReadyState::NoDevice | ReadyState::RequestingDevice) => {
                TickPlan::<T>::Defect(state)
            }
            ReadyState::HaveDevice => TickPlan::Idle,
            ReadyState::Connecting => {
                let due = match inner.last_attempt {
                    None => true,
                    Some(at) => {
                        now.duration_since(at)
                            >= Duration::from_millis(shared.config.retry_delay)
                    }
                };

                if !due {
                    TickPlan::Idle
                } else {
                    // stamp up front so a failed attempt still paces the
                    // next one
                    inner.last_attempt = Some(now);
                    let device = inner
                        .device
                        .clone()
                        .expect("Connecting state without a stored device");
                    TickPlan::Attempt {
                        device,
                        cancel: inner.cancel.clone(),
                    }
                }
            }
            ReadyState::Ready => {
                let link = inner.link.as_ref().expect("Ready state without an active link");
                TickPlan::Poll {
                    connection: link.connection.clone(),
                    characteristic: link.characteristic.clone(),
                    cancel: inner.cancel.clone(),
                }
            }
        }
    };

    match plan {
        TickPlan::Idle => Ok(()),
        TickPlan::Defect(state) => {
            let inner = shared.inner.lock().unwrap();
            inner.events.emit_error(&SessionError::UnexpectedTick { state });
            Ok(())
        }
        TickPlan::Attempt { device, cancel } => attempt_connect(&shared, device, cancel).await,
        TickPlan::Poll {
            connection,
            characteristic,
            cancel,
        } => poll_breath(&shared, connection, characteristic, cancel, now).await,
    }
}

/// Map one cancellable sub-step: cancellation wins the race, a transport
/// failure is wrapped with its context.
async fn run_step<V>(
    scope: &CancelScope,
    context: &'static str,
    step: impl Future<Output = Result<V, TransportError>>,
) -> Result<V, SessionError> {
    match scope.run(step).await {
        Err(cancelled) => Err(cancelled),
        Ok(Err(source)) => Err(SessionError::Transport { context, source }),
        Ok(Ok(value)) => Ok(value),
    }
}

/// One bounded connect -> discover service -> discover characteristic ->
/// subscribe sequence. Failure keeps the session in `Connecting`; the
/// ticker retries after the configured delay.
async fn attempt_connect<T: Transport>(
    shared: &Arc<Shared<T>>,
    device: DeviceOf<T>,
    cancel: CancellationToken,
) -> Result<(), SessionError> {
    let scope = CancelScope::with_timeout(
        cancel.clone(),
        Duration::from_millis(shared.config.init_deadline),
    );

    let result = async {
        let connection = run_step(&scope, "Connecting to peripheral", device.connect()).await?;
        let service = run_step(
            &scope,
            "Discovering service",
            connection.service(make_melody_smart_service_uuid()),
        )
        .await?;
        let characteristic = run_step(
            &scope,
            "Discovering characteristic",
            service.characteristic(make_melody_smart_data_uuid()),
        )
        .await?;
        let notifications = run_step(
            &scope,
            "Subscribing to characteristic",
            characteristic.subscribe(),
        )
        .await?;

        Ok::<_, SessionError>((connection, characteristic, notifications))
    }
    .await;

    let mut inner = shared.inner.lock().unwrap();
    match result {
        Err(err) => {
            warn!("Connection attempt failed: {err}");
            inner.events.emit_error(&err);
            Ok(())
        }
        Ok((connection, characteristic, notifications)) => {
            if cancel.is_cancelled() {
                // disconnect() won the race after the last step; the fresh
                // link is abandoned
                let err = SessionError::Cancelled {
                    reason: CancelReason::DisconnectRequested,
                };
                inner.events.emit_error(&err);
                return Ok(());
            }

            let reader_cancel = cancel.child_token();
            let handle =
                spawn_notification_reader(Arc::clone(shared), notifications, reader_cancel.clone());

            // a reader from a previous link unwinds on its own token
            inner.stop_reader();
            inner.reader = Some(Reader {
                cancel: reader_cancel,
                handle,
            });
            inner.link = Some(Link {
                connection,
                characteristic,
            });
            inner.transition(ReadyState::Ready);
            info!("Peripheral ready");

            if let Some(connected) = inner.connected.take() {
                let _ = connected.send(Ok(()));
            }

            Ok(())
        }
    }
}

/// `Ready` upkeep: verify the link is still up, then request one fresh
/// reading.
async fn poll_breath<T: Transport>(
    shared: &Arc<Shared<T>>,
    connection: ConnectionOf<T>,
    characteristic: CharacteristicOf<T>,
    cancel: CancellationToken,
    now: Instant,
) -> Result<(), SessionError> {
    let alive = CancelScope::new(cancel.clone())
        .run(connection.is_connected())
        .await;

    let connected = match alive {
        // disconnect() is tearing the cycle down; nothing left to do here
        Err(_) => return Ok(()),
        Ok(connected) => connected,
    };

    if !connected {
        warn!("Connection lost");
        let mut inner = shared.inner.lock().unwrap();
        if inner.ready_state == ReadyState::Ready && !cancel.is_cancelled() {
            // pace the reconnect a full retry delay from the moment the
            // loss was observed; the attempt itself belongs to a later tick
            inner.last_attempt = Some(now);
            inner.link = None;
            inner.stop_reader();
            inner.transition(ReadyState::Connecting);
        }
        return Ok(());
    }

    let scope = CancelScope::with_timeout(
        cancel,
        Duration::from_millis(shared.config.write_deadline),
    );
    let request = run_step(
        &scope,
        "Requesting breath value",
        characteristic.write(&COMMAND_REQUEST_BREATH),
    )
    .await;

    if let Err(err) = request {
        warn!("Failed to request a breath value: {err}");
        let inner = shared.inner.lock().unwrap();
        inner.events.emit_error(&err);
    }

    Ok(())
}

fn spawn_notification_reader<T: Transport>(
    shared: Arc<Shared<T>>,
    mut notifications: NotificationsOf<T>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = notifications.next() => match frame {
                    // the stream ends with the link; the next tick notices
                    None => break,
                    Some(frame) => handle_frame(&shared, &frame),
                },
            }
        }

        debug!("Notification reader stopped");
    })
}

/// A reply to COMMAND_REQUEST_BREATH: divert it into a pending calibration
/// window, or condition it into a normalized breath value.
fn handle_frame<T: Transport>(shared: &Arc<Shared<T>>, frame: &[u8]) {
    let mut inner = shared.inner.lock().unwrap();

    let raw = match parse_breath_frame(frame, BREATH_RANGE) {
        Err(err) => {
            warn!("Failed to decode breath value: {err}");
            inner.events.emit_error(&err);
            return;
        }
        Ok(raw) => f64::from(raw),
    };

    if inner.calibration.pending.is_some() {
        inner.calibration.samples.push(raw - f64::from(BREATH_RANGE));

        if inner.calibration.samples.len() >= shared.config.calibration_samples {
            let offset = mean(&inner.calibration.samples).round();
            inner.calibration.offset = offset;
            inner.calibration.samples.clear();
            info!("Calibrated neutral offset: {offset}");

            if let Some(pending) = inner.calibration.pending.take() {
                let _ = pending.send(Ok(()));
            }
            inner.events.emit_calibration_state_change(false);
        }

        return;
    }

    let value = interpret(
        raw,
        f64::from(BREATH_RANGE),
        inner.dead_zone,
        inner.calibration.offset,
    );
    inner.breath_value = Some(value);
    inner.events.emit_breath(value);
}
