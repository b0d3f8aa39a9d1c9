//! U2F register and sign across every connected security key.
//!
//! A [Client] polls a [DeviceFactory](u2f_hid::DeviceFactory) for keys and runs the operation
//! on each of them concurrently. The first key to produce a successful result wins and the
//! operations on all other keys are cancelled.

pub mod apdu;
mod client;
mod config;
mod coordinator;
mod error;
pub mod operation;

pub use apdu::{KeyHandle, RegisterRequest, RegisterResponse, SignRequest, SignResponse};
pub use client::Client;
pub use config::ClientConfig;
pub use coordinator::Coordinator;
pub use error::Error;
pub use operation::{
    ApduOperations, KeyOperations, OperationResult, OperationStatus, RegisterResult, SignResult,
};
