//! Explicit publish/subscribe registry for session notifications.

use indexmap::IndexMap;

use crate::device::types::ReadyState;
use crate::error::SessionError;

/// Handle returned by the subscription methods; pass it to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<A> = Box<dyn Fn(A) + Send>;

/// One insertion-ordered listener map per event kind. Listeners run
/// synchronously, in registration order, at the moment of emission, so an
/// observer always sees a state change before the call that caused it
/// returns.
#[derive(Default)]
pub(crate) struct EventRegistry {
    next_id: u64,
    ready_state: IndexMap<ListenerId, Listener<ReadyState>>,
    breath: IndexMap<ListenerId, Listener<f64>>,
    calibration: IndexMap<ListenerId, Listener<bool>>,
    error: IndexMap<ListenerId, Box<dyn Fn(&SessionError) + Send>>,
}

impl EventRegistry {
    fn next_id(&mut self) -> ListenerId {
        self.next_id += 1;
        ListenerId(self.next_id)
    }

    pub fn on_ready_state_change(
        &mut self,
        listener: impl Fn(ReadyState) + Send + 'static,
    ) -> ListenerId {
        let id = self.next_id();
        self.ready_state.insert(id, Box::new(listener));
        id
    }

    pub fn on_breath(&mut self, listener: impl Fn(f64) + Send + 'static) -> ListenerId {
        let id = self.next_id();
        self.breath.insert(id, Box::new(listener));
        id
    }

    pub fn on_calibration_state_change(
        &mut self,
        listener: impl Fn(bool) + Send + 'static,
    ) -> ListenerId {
        let id = self.next_id();
        self.calibration.insert(id, Box::new(listener));
        id
    }

    pub fn on_error(&mut self, listener: impl Fn(&SessionError) + Send + 'static) -> ListenerId {
        let id = self.next_id();
        self.error.insert(id, Box::new(listener));
        id
    }

    /// Remove a listener; `shift_remove` keeps the remaining registration
    /// order intact. Returns whether the id was known.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.ready_state.shift_remove(&id).is_some()
            || self.breath.shift_remove(&id).is_some()
            || self.calibration.shift_remove(&id).is_some()
            || self.error.shift_remove(&id).is_some()
    }

    pub fn emit_ready_state_change(&self, state: ReadyState) {
        for listener in self.ready_state.values() {
            listener(state);
        }
    }

    pub fn emit_breath(&self, value: f64) {
        for listener in self.breath.values() {
            listener(value);
        }
    }

    pub fn emit_calibration_state_change(&self, calibrating: bool) {
        for listener in self.calibration.values() {
            listener(calibrating);
        }
    }

    pub fn emit_error(&self, error: &SessionError) {
        for listener in self.error.values() {
            listener(error);
        }
    }
}
