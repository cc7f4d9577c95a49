//! Device-side core of the Hublink IoT platform client.
//!
//! The crate implements the engine a constrained device uses to exchange
//! telemetry, cloud-to-device messages, twin properties, direct methods
//! and file uploads with a cloud hub. All I/O is driven by the
//! cooperative [`DeviceClient::do_work`] tick; wire protocols plug in
//! through the [`transport::Transport`] trait, with the HTTP dialect
//! provided in [`transport::http`].

pub mod httpapi;
pub mod properties;
pub mod tick;
pub mod transport;
pub mod upload;

mod auth;
mod client;
mod error;
mod message;

pub use auth::{CredentialKind, Credentials};
pub use client::{ClientConfig, ClientOption, DeviceClient, DeviceConfig, MessageInfo, Protocol};
pub use error::{ClientError, ConfirmationStatus, ConnectionStatus, ConnectionStatusReason};
pub use message::{BodyKind, Disposition, Message, Properties, SystemProperties};
pub use transport::{MethodId, RetryPolicy, SendStatus, TwinUpdateKind};
