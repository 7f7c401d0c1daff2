//! Scripted in-memory transport for driving the session without radio
//! hardware, plus event-capture helpers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use uuid::Uuid;

use groovtube_ble::transport::{
    Characteristic, Connection, Device, DeviceFilter, Service, Transport, TransportError,
};
use groovtube_ble::{BreathSession, ReadyState};

/// Where a scripted hang applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Connect,
    DiscoverService,
    DiscoverCharacteristic,
    Subscribe,
}

/// Shared control block: every mock handle points back here.
pub struct MockCtl {
    pub connect_calls: AtomicUsize,
    /// How many connect attempts fail before one succeeds.
    pub connect_failures: AtomicUsize,
    pub fail_request_device: AtomicBool,
    pub connectable: AtomicBool,
    /// What `is_connected` reports; a successful connect sets it back.
    pub connected: AtomicBool,
    /// A step that never completes until the session cancels it.
    hang: Mutex<Option<Step>>,
    /// Pinged when the hung step is reached.
    pub step_entered: Notify,
    writes: Mutex<Vec<Vec<u8>>>,
    notif_tx: Mutex<Option<UnboundedSender<Vec<u8>>>>,
}

impl MockCtl {
    fn new() -> Arc<Self> {
        Arc::new(MockCtl {
            connect_calls: AtomicUsize::new(0),
            connect_failures: AtomicUsize::new(0),
            fail_request_device: AtomicBool::new(false),
            connectable: AtomicBool::new(true),
            connected: AtomicBool::new(true),
            hang: Mutex::new(None),
            step_entered: Notify::new(),
            writes: Mutex::new(Vec::new()),
            notif_tx: Mutex::new(None),
        })
    }

    pub fn hang_at(&self, step: Step) {
        *self.hang.lock().unwrap() = Some(step);
    }

    /// Push one breath frame as the hex text the peripheral sends.
    pub fn send_raw(&self, raw: u16) {
        self.send_frame(format!("{raw:04x}").into_bytes());
    }

    pub fn send_frame(&self, frame: Vec<u8>) {
        let tx = self.notif_tx.lock().unwrap();
        tx.as_ref()
            .expect("no active subscription")
            .unbounded_send(frame)
            .expect("notification reader is gone");
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    async fn gate(&self, step: Step) {
        let hung = *self.hang.lock().unwrap() == Some(step);
        if hung {
            self.step_entered.notify_one();
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Clone)]
pub struct MockTransport {
    ctl: Arc<MockCtl>,
}

impl MockTransport {
    pub fn new() -> (Self, Arc<MockCtl>) {
        let ctl = MockCtl::new();
        (
            MockTransport {
                ctl: Arc::clone(&ctl),
            },
            ctl,
        )
    }
}

impl Transport for MockTransport {
    type Device = MockDevice;

    async fn request_device(&self, _filter: DeviceFilter) -> Result<MockDevice, TransportError> {
        if self.ctl.fail_request_device.load(Ordering::SeqCst) {
            return Err("the user declined device selection".into());
        }

        Ok(MockDevice {
            ctl: Arc::clone(&self.ctl),
        })
    }
}

#[derive(Clone)]
pub struct MockDevice {
    ctl: Arc<MockCtl>,
}

impl Device for MockDevice {
    type Connection = MockConnection;

    fn connectable(&self) -> bool {
        self.ctl.connectable.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<MockConnection, TransportError> {
        self.ctl.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.ctl.gate(Step::Connect).await;

        if self.ctl.connect_failures.load(Ordering::SeqCst) > 0 {
            self.ctl.connect_failures.fetch_sub(1, Ordering::SeqCst);
            return Err("the peripheral refused the connection".into());
        }

        self.ctl.connected.store(true, Ordering::SeqCst);
        Ok(MockConnection {
            ctl: Arc::clone(&self.ctl),
        })
    }
}

#[derive(Clone)]
pub struct MockConnection {
    ctl: Arc<MockCtl>,
}

impl Connection for MockConnection {
    type Service = MockService;

    async fn service(&self, _id: Uuid) -> Result<MockService, TransportError> {
        self.ctl.gate(Step::DiscoverService).await;
        Ok(MockService {
            ctl: Arc::clone(&self.ctl),
        })
    }

    async fn is_connected(&self) -> bool {
        self.ctl.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.ctl.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockService {
    ctl: Arc<MockCtl>,
}

impl Service for MockService {
    type Characteristic = MockCharacteristic;

    async fn characteristic(&self, _id: Uuid) -> Result<MockCharacteristic, TransportError> {
        self.ctl.gate(Step::DiscoverCharacteristic).await;
        Ok(MockCharacteristic {
            ctl: Arc::clone(&self.ctl),
        })
    }
}

#[derive(Clone)]
pub struct MockCharacteristic {
    ctl: Arc<MockCtl>,
}

impl Characteristic for MockCharacteristic {
    type Notifications = UnboundedReceiver<Vec<u8>>;

    async fn subscribe(&self) -> Result<Self::Notifications, TransportError> {
        self.ctl.gate(Step::Subscribe).await;

        let (tx, rx) = mpsc::unbounded();
        *self.ctl.notif_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.ctl.writes.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }
}

/// Session events captured through the subscription surface.
#[derive(Clone, Default)]
pub struct Recorder {
    states: Arc<Mutex<Vec<ReadyState>>>,
    breaths: Arc<Mutex<Vec<f64>>>,
    calibrating: Arc<Mutex<Vec<bool>>>,
    errors: Arc<Mutex<Vec<(String, bool)>>>,
}

impl Recorder {
    pub fn states(&self) -> Vec<ReadyState> {
        self.states.lock().unwrap().clone()
    }

    pub fn breaths(&self) -> Vec<f64> {
        self.breaths.lock().unwrap().clone()
    }

    pub fn calibrating(&self) -> Vec<bool> {
        self.calibrating.lock().unwrap().clone()
    }

    /// Each error as its message plus whether it carried a cancellation
    /// cause.
    pub fn errors(&self) -> Vec<(String, bool)> {
        self.errors.lock().unwrap().clone()
    }
}

pub fn record(session: &BreathSession<MockTransport>) -> Recorder {
    let recorder = Recorder::default();

    {
        let states = Arc::clone(&recorder.states);
        session.on_ready_state_change(move |state| states.lock().unwrap().push(state));
    }
    {
        let breaths = Arc::clone(&recorder.breaths);
        session.on_breath(move |value| breaths.lock().unwrap().push(value));
    }
    {
        let calibrating = Arc::clone(&recorder.calibrating);
        session.on_calibration_state_change(move |on| calibrating.lock().unwrap().push(on));
    }
    {
        let errors = Arc::clone(&recorder.errors);
        session.on_error(move |err| {
            errors
                .lock()
                .unwrap()
                .push((err.to_string(), err.is_cancellation()));
        });
    }

    recorder
}

/// Poll until `cond` holds, advancing the paused clock in 1ms steps.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..5000 {
        if cond() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }

    panic!("condition not reached within 5 simulated seconds");
}
