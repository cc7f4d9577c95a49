//! The capability contract every wire protocol implementation satisfies.
//!
//! The device client depends on transports only through [`Transport`]; the
//! transport reaches back into the client through [`TransportContext`],
//! which is handed to every [`Transport::do_work`] tick. There is no
//! transport-specific code in the client core.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::auth::Credentials;
use crate::error::{ClientError, ConfirmationStatus, ConnectionStatus, ConnectionStatusReason};
use crate::message::{Disposition, Message};

pub mod http;

/// Identifies a device registration inside a transport. Registrations are
/// arena slots; the handle stays valid until `unregister`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceHandle(pub usize);

/// Identifies an inbound method invocation until the response is routed
/// back through the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MethodId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
    Idle,
    Busy,
}

/// Result of pushing an out-of-band item (a reported-state update) into
/// the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessItemStatus {
    /// The transport accepted the item; completion arrives through
    /// [`TransportContext::on_reported_state_complete`].
    Ok,
    /// Not processed this tick; try again on the next one.
    Continue,
    /// The transport is not connected; the item stays queued.
    NotConnected,
    /// The transport failed to accept the item; the item stays queued.
    Error,
}

/// Shape of a twin payload handed to the twin callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TwinUpdateKind {
    /// The full `{"desired":…,"reported":…}` envelope.
    Complete,
    /// A desired-only patch; the root object is the desired fragment.
    Partial,
}

/// Outcome of [`Transport::set_option`], kept apart from `ClientError`
/// because the client combines transport and upload results.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptionResult {
    Ok,
    /// The option is not meaningful for this transport.
    NotRecognized,
    Error,
}

/// Retry policies a transport may apply between failed attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryPolicy {
    None,
    Immediate,
    Interval,
    ExponentialBackoff,
    ExponentialBackoffWithJitter,
    LinearBackoff,
    Random,
}

/// Options the client forwards to its transport. Transports answer
/// [`OptionResult::NotRecognized`] for options outside their dialect.
#[derive(Clone, Debug)]
pub enum TransportOption {
    Batching(bool),
    /// Floor, in seconds, between two cloud-to-device polls.
    MinPollingTime(u64),
    Proxy {
        host: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
    },
    TrustedCerts(String),
    X509Cert(String),
    X509PrivateKey(String),
    OpensslPrivateKeyType(String),
    OpensslEngine(String),
    NetworkInterface(String),
    Verbose(bool),
    /// Replacement product-info string used for the User-Agent header.
    ProductInfo(String),
}

/// Callback invoked exactly once with the fate of a queued message.
pub type SendConfirmationCallback = Box<dyn FnOnce(ConfirmationStatus)>;

/// A queued telemetry message together with its bookkeeping.
pub struct SendRequest {
    pub message: Message,
    pub callback: Option<SendConfirmationCallback>,
    /// Tick at which the message entered the queue.
    pub enqueued_ms: u64,
    /// Per-message timeout in milliseconds; 0 disables the timeout.
    pub timeout_ms: u64,
}

impl std::fmt::Debug for SendRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendRequest")
            .field("enqueued_ms", &self.enqueued_ms)
            .field("timeout_ms", &self.timeout_ms)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// The waiting-to-send queue. Owned by the client, drained by the
/// transport during `do_work`; the transport may reorder entries but every
/// removal must flow through the completion pathway.
pub type SendQueue = Rc<RefCell<VecDeque<SendRequest>>>;

/// Opaque wire-level acknowledgement state of a received message.
#[derive(Clone, Debug)]
pub struct DispositionContext {
    pub(crate) device: DeviceHandle,
    pub(crate) etag: String,
}

impl DispositionContext {
    pub fn device(&self) -> DeviceHandle {
        self.device
    }

    /// The wire-level delivery tag the transport acknowledges with; the
    /// ETag in the HTTP dialect.
    pub fn token(&self) -> &str {
        &self.etag
    }
}

/// A received message on its way to the application, still carrying the
/// state needed to acknowledge it on the wire.
#[derive(Debug)]
pub struct ReceivedMessage {
    pub message: Message,
    pub(crate) context: DispositionContext,
}

impl ReceivedMessage {
    /// Packages a message pulled off the wire; `token` identifies the
    /// delivery for the later disposition call.
    pub fn new(message: Message, device: DeviceHandle, token: impl Into<String>) -> Self {
        ReceivedMessage {
            message,
            context: DispositionContext {
                device,
                etag: token.into(),
            },
        }
    }

    /// Splits the message from its acknowledgement state, for transports
    /// that complete the disposition later.
    pub fn into_parts(self) -> (Message, DispositionContext) {
        (self.message, self.context)
    }
}

/// Per-device configuration handed to [`Transport::register`].
#[derive(Clone, Debug)]
pub struct DeviceRegistration {
    pub device_id: String,
    pub credentials: Credentials,
}

/// The callback table the transport uses to reach the client. Implemented
/// by the client's inner state and passed to every `do_work` tick.
pub trait TransportContext {
    /// Reports the fate of a batch of claimed send requests, in queue
    /// order. The context dispatches the stored confirmation callbacks.
    fn on_send_complete(&mut self, completed: Vec<SendRequest>, status: ConfirmationStatus);

    /// Delivers an inbound message. `Some(disposition)` means a
    /// synchronous handler answered and the transport should acknowledge
    /// on the wire now; `None` means the message was taken for deferred
    /// disposition through the client API.
    fn on_message(&mut self, message: ReceivedMessage) -> Option<Disposition>;

    /// Delivers an inbound method invocation. `Some((status, payload))`
    /// is an immediate response; `None` defers until
    /// `device_method_response` is called with the same [`MethodId`].
    fn on_method(&mut self, name: &str, payload: &[u8], method: MethodId)
        -> Option<(i32, Vec<u8>)>;

    /// Delivers a twin document or patch.
    fn on_twin_update(&mut self, kind: TwinUpdateKind, payload: &[u8]);

    /// Completes a reported-state item previously accepted by
    /// [`Transport::process_item`].
    fn on_reported_state_complete(&mut self, item_id: u32, status_code: i32);

    fn on_connection_status(&mut self, status: ConnectionStatus, reason: ConnectionStatusReason);

    /// Current product-info string for the User-Agent header.
    fn product_info(&self) -> String;
}

/// A wire protocol implementation. All methods are non-blocking apart
/// from bounded per-request I/O inside [`Transport::do_work`].
pub trait Transport {
    /// Registers a device and hands over the queue the transport will
    /// drain from. A device id may be registered at most once per
    /// transport.
    fn register(
        &mut self,
        device: DeviceRegistration,
        waiting_to_send: SendQueue,
    ) -> Result<DeviceHandle, ClientError>;

    fn unregister(&mut self, device: DeviceHandle);

    fn subscribe_messages(&mut self, device: DeviceHandle) -> Result<(), ClientError>;
    fn unsubscribe_messages(&mut self, device: DeviceHandle);

    fn subscribe_twin(&mut self, device: DeviceHandle) -> Result<(), ClientError>;
    fn unsubscribe_twin(&mut self, device: DeviceHandle);

    fn subscribe_methods(&mut self, device: DeviceHandle) -> Result<(), ClientError>;
    fn unsubscribe_methods(&mut self, device: DeviceHandle);

    /// Advances all outstanding activity: drains send queues, polls the
    /// inbox, completes timers.
    fn do_work(&mut self, ctx: &mut dyn TransportContext);

    /// Offers a reported-state item. On [`ProcessItemStatus::Ok`] the
    /// client moves the item to its in-flight list and waits for
    /// [`TransportContext::on_reported_state_complete`].
    fn process_item(&mut self, device: DeviceHandle, item_id: u32, state: &[u8])
        -> ProcessItemStatus;

    /// Issues a one-shot full-twin read.
    fn request_twin(&mut self, device: DeviceHandle) -> Result<(), ClientError>;

    fn send_message_disposition(
        &mut self,
        context: &DispositionContext,
        disposition: Disposition,
    ) -> Result<(), ClientError>;

    fn device_method_response(
        &mut self,
        device: DeviceHandle,
        method: MethodId,
        status: i32,
        payload: &[u8],
    ) -> Result<(), ClientError>;

    /// `Busy` iff the device's waiting-to-send queue is non-empty.
    fn send_status(&self, device: DeviceHandle) -> SendStatus;

    /// The bit-exact hostname this transport talks to.
    fn hostname(&self) -> &str;

    fn set_option(&mut self, option: &TransportOption) -> OptionResult;

    /// `timeout_secs == 0` means no upper limit on retrying.
    fn set_retry_policy(&mut self, policy: RetryPolicy, timeout_secs: u64)
        -> Result<(), ClientError>;
}

/// A transport shared between the application and one or more clients
/// created through `DeviceClient::with_transport`.
pub type SharedTransport = Rc<RefCell<dyn Transport>>;
