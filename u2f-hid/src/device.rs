use async_trait::async_trait;
use std::fmt::Debug;
use std::hash::Hash;
use std::io;
use thiserror::Error;

/// Failure of raw report I/O. Disconnection is kept apart from other I/O errors so a vanished
/// device can be forgotten instead of retried.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Device disconnected")]
    Disconnected,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// An open HID device exchanging fixed-size reports. Dropping the device closes it.
#[async_trait]
pub trait HidDevice: Send {
    /// Size of input and output reports, excluding any report id prefix.
    fn report_len(&self) -> usize;

    async fn send_report(&mut self, report: &[u8]) -> Result<usize, ReportError>;

    async fn receive_report(&mut self) -> Result<Vec<u8>, ReportError>;
}

#[async_trait]
impl<D: HidDevice + ?Sized> HidDevice for Box<D> {
    fn report_len(&self) -> usize {
        (**self).report_len()
    }

    async fn send_report(&mut self, report: &[u8]) -> Result<usize, ReportError> {
        (**self).send_report(report).await
    }

    async fn receive_report(&mut self) -> Result<Vec<u8>, ReportError> {
        (**self).receive_report().await
    }
}

/// Identifies a device that may be opened. Only ever compared, never interpreted.
pub trait KeyIdentity: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> KeyIdentity for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Result of trying to open a device that was visible during discovery.
#[derive(Debug)]
pub enum OpenOutcome<D> {
    Opened(D),
    /// Another process holds the device, try again shortly.
    Busy,
}

/// Discovery and opening of security key devices.
#[async_trait]
pub trait DeviceFactory: Send + Sync + 'static {
    type Identity: KeyIdentity;
    type Device: HidDevice + 'static;

    async fn find_all(&self) -> Result<Vec<Self::Identity>, ReportError>;

    async fn open(
        &self,
        identity: &Self::Identity,
    ) -> Result<OpenOutcome<Self::Device>, ReportError>;
}
