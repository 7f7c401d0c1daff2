//! The consumed wireless capability: device selection and GATT access.
//!
//! The session core is generic over these seams; [`ble`] carries the
//! production btleplug implementation, and tests drive the core through a
//! scripted in-memory one.

use std::error::Error;
use std::future::Future;

use futures::Stream;
use uuid::Uuid;

pub mod ble;

/// Error produced by a transport implementation.
pub type TransportError = Box<dyn Error + Send + Sync>;

/// Criteria for selecting a peripheral.
#[derive(Debug, Clone)]
pub struct DeviceFilter {
    /// GATT service the peripheral must advertise.
    pub service: Uuid,
}

/// Entry point of the capability: hands out a device matching a filter.
/// The discovery strategy is the implementation's business.
pub trait Transport: Send + Sync + 'static {
    type Device: Device;

    fn request_device(
        &self,
        filter: DeviceFilter,
    ) -> impl Future<Output = Result<Self::Device, TransportError>> + Send;
}

/// A selected peripheral. Handles are cheap clones of the same underlying
/// device.
pub trait Device: Clone + Send + Sync + 'static {
    type Connection: Connection;

    /// Whether the device exposes a connectable transport handle at all.
    fn connectable(&self) -> bool;

    fn connect(&self) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;
}

/// An established link: GATT access and teardown.
pub trait Connection: Clone + Send + Sync + 'static {
    type Service: Service;

    fn service(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Self::Service, TransportError>> + Send;

    /// Best-effort link state; implementations bound a hung query
    /// themselves and report it as disconnected.
    fn is_connected(&self) -> impl Future<Output = bool> + Send;

    fn disconnect(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

pub trait Service: Send + Sync + 'static {
    type Characteristic: Characteristic;

    fn characteristic(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Self::Characteristic, TransportError>> + Send;
}

/// An addressable data point, here used to request and receive breath
/// frames.
pub trait Characteristic: Clone + Send + Sync + 'static {
    type Notifications: Stream<Item = Vec<u8>> + Send + Unpin + 'static;

    fn subscribe(
        &self,
    ) -> impl Future<Output = Result<Self::Notifications, TransportError>> + Send;

    fn write(&self, bytes: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Shorthand for the handle types reached through a transport.
pub type DeviceOf<T> = <T as Transport>::Device;
pub type ConnectionOf<T> = <DeviceOf<T> as Device>::Connection;
pub type ServiceOf<T> = <ConnectionOf<T> as Connection>::Service;
pub type CharacteristicOf<T> = <ServiceOf<T> as Service>::Characteristic;
pub type NotificationsOf<T> = <CharacteristicOf<T> as Characteristic>::Notifications;
