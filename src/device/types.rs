/// The lifecycle state of a breath sensor session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    NoDevice,
    RequestingDevice,
    HaveDevice,
    Connecting,
    Ready,
}

impl ReadyState {
    /// Whether moving from `self` to `to` follows the session lifecycle
    /// graph. Any other move is a defect.
    pub fn valid_transition(self, to: ReadyState) -> bool {
        use ReadyState::*;

        matches!(
            (self, to),
            (NoDevice, RequestingDevice)
                | (RequestingDevice, NoDevice)
                | (RequestingDevice, HaveDevice)
                | (HaveDevice, Connecting)
                | (HaveDevice, RequestingDevice)
                | (Connecting, HaveDevice)
                | (Connecting, Ready)
                | (Ready, Connecting)
                | (Ready, HaveDevice)
        )
    }

    pub fn can_request_device(self) -> bool {
        matches!(self, ReadyState::NoDevice | ReadyState::HaveDevice)
    }

    pub fn can_connect(self) -> bool {
        matches!(self, ReadyState::HaveDevice)
    }

    pub fn can_disconnect(self) -> bool {
        matches!(self, ReadyState::Connecting | ReadyState::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::ReadyState::{self, *};

    const ALL: [ReadyState; 5] = [NoDevice, RequestingDevice, HaveDevice, Connecting, Ready];

    const VALID: [(ReadyState, ReadyState); 9] = [
        (NoDevice, RequestingDevice),
        (RequestingDevice, NoDevice),
        (RequestingDevice, HaveDevice),
        (HaveDevice, Connecting),
        (HaveDevice, RequestingDevice),
        (Connecting, HaveDevice),
        (Connecting, Ready),
        (Ready, Connecting),
        (Ready, HaveDevice),
    ];

    #[test]
    fn transition_graph_is_exact() {
        for from in ALL {
            for to in ALL {
                let expected = VALID.contains(&(from, to));
                assert_eq!(from.valid_transition(to), expected, "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn request_device_is_available_without_an_active_connection() {
        assert!(NoDevice.can_request_device());
        assert!(HaveDevice.can_request_device());
        assert!(!RequestingDevice.can_request_device());
        assert!(!Connecting.can_request_device());
        assert!(!Ready.can_request_device());
    }

    #[test]
    fn disconnect_is_available_while_connecting_or_ready() {
        assert!(Connecting.can_disconnect());
        assert!(Ready.can_disconnect());
        assert!(!NoDevice.can_disconnect());
        assert!(!RequestingDevice.can_disconnect());
        assert!(!HaveDevice.can_disconnect());
    }
}
