//! The device-client core: handle lifecycle, send queue, callback
//! dispatch, timeouts, retry policy and the cooperative work loop.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::auth::Credentials;
use crate::error::{ClientError, ConfirmationStatus, ConnectionStatus, ConnectionStatusReason};
use crate::message::{Disposition, Message};
use crate::tick::{MonotonicClock, TickSource};
use crate::transport::http::HttpTransport;
use crate::transport::{
    DeviceHandle, DeviceRegistration, DispositionContext, MethodId, OptionResult, ProcessItemStatus,
    ReceivedMessage, RetryPolicy, SendConfirmationCallback, SendQueue, SendRequest, SendStatus,
    SharedTransport, Transport, TransportContext, TransportOption, TwinUpdateKind,
};
use crate::upload::{BlockInput, UploadClient, UploadOption};

mod connection_string;
mod diagnostics;
mod retry;

pub(crate) use retry::RetryControl;

use diagnostics::DiagnosticControl;

/// User-agent reported when no product info has been configured.
pub(crate) const DEFAULT_USER_AGENT: &str = concat!("hublink/", env!("CARGO_PKG_VERSION"));

pub(crate) fn compose_user_agent(product_info: Option<&str>) -> String {
    match product_info {
        Some(info) => format!("{info} {DEFAULT_USER_AGENT}"),
        None => DEFAULT_USER_AGENT.to_owned(),
    }
}

/// Wire protocols the client can construct an owned transport for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Http,
}

/// Per-device identity and clock configuration.
pub struct DeviceConfig {
    pub device_id: String,
    pub credentials: Credentials,
    /// Overrides the tick source; mostly useful in tests. `None` installs
    /// a monotonic clock.
    pub clock: Option<Rc<dyn TickSource>>,
}

impl DeviceConfig {
    pub fn new(device_id: impl Into<String>, credentials: Credentials) -> Self {
        DeviceConfig {
            device_id: device_id.into(),
            credentials,
            clock: None,
        }
    }
}

/// Full configuration for a client that owns its transport.
pub struct ClientConfig {
    pub hub_name: String,
    pub hub_suffix: String,
    /// Overrides the effective hostname, for example for an edge gateway.
    pub gateway_hostname: Option<String>,
    pub device: DeviceConfig,
}

impl ClientConfig {
    /// The hostname the transport will actually talk to.
    pub fn hostname(&self) -> String {
        match &self.gateway_hostname {
            Some(gateway) => gateway.clone(),
            None => format!("{}.{}", self.hub_name, self.hub_suffix),
        }
    }
}

/// The full set of runtime options recognized by [`DeviceClient::set_option`].
///
/// Transport- and upload-facing options are forwarded to both parties;
/// the call succeeds when at least one of them recognizes the option and
/// neither fails applying it.
#[derive(Clone, Debug)]
pub enum ClientOption {
    /// Default per-message timeout in milliseconds for newly enqueued
    /// messages; 0 disables the timeout. Messages already queued keep
    /// their original setting.
    MessageTimeout(u64),
    /// Product information prepended to the default user agent. May be
    /// set repeatedly; each call replaces the previous value.
    ProductInfo(String),
    /// Percentage (0..=100) of telemetry messages annotated with
    /// diagnostic properties.
    DiagnosticSamplingPercentage(u32),
    /// Hint for the HTTP transport to combine queued telemetry into
    /// batched requests.
    Batching(bool),
    /// Floor, in seconds, between two cloud-to-device polls.
    MinPollingTime(u64),
    X509Cert(String),
    X509PrivateKey(String),
    OpensslPrivateKeyType(String),
    OpensslEngine(String),
    /// PEM bundle of additional trusted root certificates.
    TrustedCerts(String),
    HttpProxy {
        host: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
    },
    CurlVerbose(bool),
    BlobUploadTimeoutSecs(u64),
    NetworkInterface(String),
    BlobUploadTlsRenegotiation(bool),
}

/// A received message taken over by an asynchronous handler. The
/// application acknowledges it later through
/// [`DeviceClient::send_message_disposition`].
pub struct MessageInfo {
    message: Message,
    context: DispositionContext,
}

impl MessageInfo {
    pub fn message(&self) -> &Message {
        &self.message
    }
}

impl std::fmt::Debug for MessageInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageInfo")
            .field("context", &self.context)
            .finish()
    }
}

enum MessageHandler {
    None,
    Sync(Box<dyn FnMut(&Message) -> Disposition>),
    Async(Box<dyn FnMut(MessageInfo)>),
}

enum MethodHandler {
    None,
    Sync(Box<dyn FnMut(&str, &[u8]) -> (i32, Vec<u8>)>),
    Async(Box<dyn FnMut(&str, &[u8], MethodId)>),
}

struct TwinQueueItem {
    item_id: u32,
    state: Vec<u8>,
    callback: Option<Box<dyn FnOnce(i32)>>,
}

struct Confirmation {
    request: SendRequest,
    status: ConfirmationStatus,
}

/// The client-side end of the transport callback table, plus the lists
/// the work loop drains. Kept separate from [`DeviceClient`] so it can be
/// lent to the transport while the client still holds the transport
/// borrow.
struct ClientState {
    message_handler: MessageHandler,
    method_handler: MethodHandler,
    twin_handler: Option<Box<dyn FnMut(TwinUpdateKind, &[u8])>>,
    twin_oneshots: VecDeque<Box<dyn FnOnce(TwinUpdateKind, &[u8])>>,
    connection_status_handler: Option<Box<dyn FnMut(ConnectionStatus, ConnectionStatusReason)>>,
    confirmations: VecDeque<Confirmation>,
    twin_inflight: Vec<TwinQueueItem>,
    product_info: String,
}

impl ClientState {
    fn new() -> Self {
        ClientState {
            message_handler: MessageHandler::None,
            method_handler: MethodHandler::None,
            twin_handler: None,
            twin_oneshots: VecDeque::new(),
            connection_status_handler: None,
            confirmations: VecDeque::new(),
            twin_inflight: Vec::new(),
            product_info: compose_user_agent(None),
        }
    }
}

impl TransportContext for ClientState {
    fn on_send_complete(&mut self, completed: Vec<SendRequest>, status: ConfirmationStatus) {
        for request in completed {
            self.confirmations.push_back(Confirmation { request, status });
        }
    }

    fn on_message(&mut self, message: ReceivedMessage) -> Option<Disposition> {
        let (message, context) = message.into_parts();
        match &mut self.message_handler {
            MessageHandler::Sync(handler) => Some(handler(&message)),
            MessageHandler::Async(handler) => {
                handler(MessageInfo { message, context });
                None
            }
            MessageHandler::None => {
                log::warn!("Received a message without a registered handler, abandoning it");
                Some(Disposition::Abandoned)
            }
        }
    }

    fn on_method(
        &mut self,
        name: &str,
        payload: &[u8],
        method: MethodId,
    ) -> Option<(i32, Vec<u8>)> {
        match &mut self.method_handler {
            MethodHandler::Sync(handler) => Some(handler(name, payload)),
            MethodHandler::Async(handler) => {
                handler(name, payload, method);
                None
            }
            MethodHandler::None => {
                log::warn!("Received method invocation '{name}' without a registered handler");
                Some((500, Vec::new()))
            }
        }
    }

    fn on_twin_update(&mut self, kind: TwinUpdateKind, payload: &[u8]) {
        if kind == TwinUpdateKind::Complete {
            if let Some(oneshot) = self.twin_oneshots.pop_front() {
                oneshot(kind, payload);
                return;
            }
        }
        match &mut self.twin_handler {
            Some(handler) => handler(kind, payload),
            None => log::warn!("Received a twin update without a registered handler"),
        }
    }

    fn on_reported_state_complete(&mut self, item_id: u32, status_code: i32) {
        match self
            .twin_inflight
            .iter()
            .position(|item| item.item_id == item_id)
        {
            Some(index) => {
                let item = self.twin_inflight.remove(index);
                if let Some(callback) = item.callback {
                    callback(status_code);
                }
            }
            None => log::warn!("Reported-state completion for unknown item {item_id}"),
        }
    }

    fn on_connection_status(&mut self, status: ConnectionStatus, reason: ConnectionStatusReason) {
        if let Some(handler) = &mut self.connection_status_handler {
            handler(status, reason);
        }
    }

    fn product_info(&self) -> String {
        self.product_info.clone()
    }
}

/// A device client bound to one transport registration.
///
/// All outgoing activity is queued and advanced by [`DeviceClient::do_work`];
/// no public call blocks on the network apart from the upload-to-blob entry
/// points. The handle is deliberately single-threaded: call every method
/// from the same thread, or serialize access externally.
pub struct DeviceClient {
    transport: SharedTransport,
    device: DeviceHandle,
    clock: Rc<dyn TickSource>,
    waiting_to_send: SendQueue,
    state: ClientState,
    twin_queue: VecDeque<TwinQueueItem>,
    twin_subscribed: bool,
    next_twin_item: u32,
    default_timeout_ms: u64,
    retry: RetryControl,
    diagnostics: DiagnosticControl,
    upload: UploadClient,
}

impl DeviceClient {
    /// Parses a connection string and builds a client owning a transport
    /// for the given protocol.
    pub fn from_connection_string(
        connection_string: &str,
        protocol: Protocol,
    ) -> Result<Self, ClientError> {
        let config = connection_string::parse(connection_string)?;
        Self::new(config, protocol)
    }

    /// Builds a client owning a freshly created transport.
    pub fn new(config: ClientConfig, protocol: Protocol) -> Result<Self, ClientError> {
        let hostname = config.hostname();
        let transport: SharedTransport = match protocol {
            Protocol::Http => Rc::new(RefCell::new(HttpTransport::new(hostname))),
        };
        Self::attach(transport, config.device)
    }

    /// Builds a client on a transport owned by the application and
    /// possibly shared with other clients. The transport is never torn
    /// down by this client, not even when registration fails.
    pub fn with_transport(
        transport: SharedTransport,
        device: DeviceConfig,
    ) -> Result<Self, ClientError> {
        Self::attach(transport, device)
    }

    fn attach(transport: SharedTransport, device: DeviceConfig) -> Result<Self, ClientError> {
        let clock = device
            .clock
            .unwrap_or_else(|| Rc::new(MonotonicClock::new()));
        let waiting_to_send: SendQueue = Rc::new(RefCell::new(VecDeque::new()));

        let hostname = transport.borrow().hostname().to_owned();
        let upload = UploadClient::new(
            hostname,
            device.device_id.clone(),
            device.credentials.clone(),
        );

        let handle = transport.borrow_mut().register(
            DeviceRegistration {
                device_id: device.device_id,
                credentials: device.credentials,
            },
            waiting_to_send.clone(),
        )?;

        let mut client = DeviceClient {
            transport,
            device: handle,
            clock,
            waiting_to_send,
            state: ClientState::new(),
            twin_queue: VecDeque::new(),
            twin_subscribed: false,
            next_twin_item: 0,
            default_timeout_ms: 0,
            retry: RetryControl::new(RetryPolicy::ExponentialBackoffWithJitter, 0),
            diagnostics: DiagnosticControl::default(),
            upload,
        };
        client.set_retry_policy(RetryPolicy::ExponentialBackoffWithJitter, 0)?;

        Ok(client)
    }

    // Telemetry
    // --------------------------------------------------------------------

    /// Enqueues a message for sending. The message is cloned; the caller
    /// keeps the original. Messages of a single device travel strictly
    /// FIFO from here to the transport pickup.
    pub fn send_event_async(
        &mut self,
        message: &Message,
        callback: Option<SendConfirmationCallback>,
    ) -> Result<(), ClientError> {
        let enqueued_ms = self.clock.now_ms()?;

        let mut message = message.clone();
        self.diagnostics.annotate(&mut message);

        self.waiting_to_send.borrow_mut().push_back(SendRequest {
            message,
            callback,
            enqueued_ms,
            timeout_ms: self.default_timeout_ms,
        });
        Ok(())
    }

    /// `Busy` while the waiting-to-send queue is non-empty.
    pub fn send_status(&self) -> Result<SendStatus, ClientError> {
        Ok(self.transport.borrow().send_status(self.device))
    }

    // Cloud-to-device messages
    // --------------------------------------------------------------------

    /// Registers a synchronous message handler that answers with a
    /// disposition. Fails while an asynchronous handler is active.
    pub fn set_message_callback(
        &mut self,
        callback: impl FnMut(&Message) -> Disposition + 'static,
    ) -> Result<(), ClientError> {
        if matches!(self.state.message_handler, MessageHandler::Async(_)) {
            return Err(ClientError::failed(
                "an asynchronous message handler is active; clear it first",
            ));
        }
        if matches!(self.state.message_handler, MessageHandler::None) {
            self.transport.borrow_mut().subscribe_messages(self.device)?;
        }
        self.state.message_handler = MessageHandler::Sync(Box::new(callback));
        Ok(())
    }

    /// Registers an asynchronous message handler. The handler takes
    /// ownership of the message and acknowledges it later through
    /// [`DeviceClient::send_message_disposition`]. Fails while a
    /// synchronous handler is active.
    pub fn set_message_callback_ex(
        &mut self,
        callback: impl FnMut(MessageInfo) + 'static,
    ) -> Result<(), ClientError> {
        if matches!(self.state.message_handler, MessageHandler::Sync(_)) {
            return Err(ClientError::failed(
                "a synchronous message handler is active; clear it first",
            ));
        }
        if matches!(self.state.message_handler, MessageHandler::None) {
            self.transport.borrow_mut().subscribe_messages(self.device)?;
        }
        self.state.message_handler = MessageHandler::Async(Box::new(callback));
        Ok(())
    }

    /// Unsubscribes from cloud-to-device messages. Fails when no handler
    /// is registered.
    pub fn clear_message_callback(&mut self) -> Result<(), ClientError> {
        if matches!(self.state.message_handler, MessageHandler::None) {
            return Err(ClientError::failed("no message handler is registered"));
        }
        self.transport.borrow_mut().unsubscribe_messages(self.device);
        self.state.message_handler = MessageHandler::None;
        Ok(())
    }

    /// Completes a deferred message. The wrapper is consumed regardless of
    /// whether the transport accepted the disposition.
    pub fn send_message_disposition(
        &mut self,
        message: MessageInfo,
        disposition: Disposition,
    ) -> Result<(), ClientError> {
        self.transport
            .borrow_mut()
            .send_message_disposition(&message.context, disposition)
    }

    // Connection status and retries
    // --------------------------------------------------------------------

    pub fn set_connection_status_callback(
        &mut self,
        callback: impl FnMut(ConnectionStatus, ConnectionStatusReason) + 'static,
    ) {
        self.state.connection_status_handler = Some(Box::new(callback));
    }

    /// Stores the retry policy and forwards it to the transport.
    /// `timeout_secs == 0` means no upper limit.
    pub fn set_retry_policy(
        &mut self,
        policy: RetryPolicy,
        timeout_secs: u64,
    ) -> Result<(), ClientError> {
        self.transport
            .borrow_mut()
            .set_retry_policy(policy, timeout_secs)?;
        self.retry = RetryControl::new(policy, timeout_secs);
        Ok(())
    }

    pub fn retry_policy(&self) -> (RetryPolicy, u64) {
        (self.retry.policy(), self.retry.timeout_secs())
    }

    // Twin
    // --------------------------------------------------------------------

    /// Subscribes for twin traffic and registers the update handler.
    pub fn set_device_twin_callback(
        &mut self,
        callback: impl FnMut(TwinUpdateKind, &[u8]) + 'static,
    ) -> Result<(), ClientError> {
        self.subscribe_twin()?;
        self.state.twin_handler = Some(Box::new(callback));
        Ok(())
    }

    /// Drops the twin handler and unsubscribes. Fails when no handler was
    /// registered.
    pub fn clear_device_twin_callback(&mut self) -> Result<(), ClientError> {
        if self.state.twin_handler.is_none() {
            return Err(ClientError::failed("no twin handler is registered"));
        }
        self.transport.borrow_mut().unsubscribe_twin(self.device);
        self.twin_subscribed = false;
        self.state.twin_handler = None;
        Ok(())
    }

    /// Queues a reported-state update. The bytes are copied into an
    /// immutable buffer; the callback receives the hub status code once
    /// the transport acknowledges the update.
    pub fn send_reported_state(
        &mut self,
        reported_state: &[u8],
        callback: Option<Box<dyn FnOnce(i32)>>,
    ) -> Result<(), ClientError> {
        self.subscribe_twin()?;

        self.next_twin_item += 1;
        self.twin_queue.push_back(TwinQueueItem {
            item_id: self.next_twin_item,
            state: reported_state.to_vec(),
            callback,
        });
        Ok(())
    }

    /// Issues a one-shot full-twin read; the callback receives the raw
    /// twin document.
    pub fn get_twin_async(
        &mut self,
        callback: impl FnOnce(TwinUpdateKind, &[u8]) + 'static,
    ) -> Result<(), ClientError> {
        self.transport.borrow_mut().request_twin(self.device)?;
        self.state.twin_oneshots.push_back(Box::new(callback));
        Ok(())
    }

    fn subscribe_twin(&mut self) -> Result<(), ClientError> {
        if !self.twin_subscribed {
            self.transport.borrow_mut().subscribe_twin(self.device)?;
            self.twin_subscribed = true;
        }
        Ok(())
    }

    // Methods
    // --------------------------------------------------------------------

    /// Registers a synchronous method handler returning `(status,
    /// payload)`. Fails while an asynchronous handler is active.
    pub fn set_device_method_callback(
        &mut self,
        callback: impl FnMut(&str, &[u8]) -> (i32, Vec<u8>) + 'static,
    ) -> Result<(), ClientError> {
        if matches!(self.state.method_handler, MethodHandler::Async(_)) {
            return Err(ClientError::failed(
                "an asynchronous method handler is active; clear it first",
            ));
        }
        if matches!(self.state.method_handler, MethodHandler::None) {
            self.transport.borrow_mut().subscribe_methods(self.device)?;
        }
        self.state.method_handler = MethodHandler::Sync(Box::new(callback));
        Ok(())
    }

    /// Registers an asynchronous method handler; the application answers
    /// later through [`DeviceClient::device_method_response`]. Fails while
    /// a synchronous handler is active.
    pub fn set_device_method_callback_ex(
        &mut self,
        callback: impl FnMut(&str, &[u8], MethodId) + 'static,
    ) -> Result<(), ClientError> {
        if matches!(self.state.method_handler, MethodHandler::Sync(_)) {
            return Err(ClientError::failed(
                "a synchronous method handler is active; clear it first",
            ));
        }
        if matches!(self.state.method_handler, MethodHandler::None) {
            self.transport.borrow_mut().subscribe_methods(self.device)?;
        }
        self.state.method_handler = MethodHandler::Async(Box::new(callback));
        Ok(())
    }

    /// Unsubscribes from method invocations. Fails when no handler is
    /// registered.
    pub fn clear_device_method_callback(&mut self) -> Result<(), ClientError> {
        if matches!(self.state.method_handler, MethodHandler::None) {
            return Err(ClientError::failed("no method handler is registered"));
        }
        self.transport.borrow_mut().unsubscribe_methods(self.device);
        self.state.method_handler = MethodHandler::None;
        Ok(())
    }

    /// Completes a deferred method invocation.
    pub fn device_method_response(
        &mut self,
        method: MethodId,
        status: i32,
        payload: &[u8],
    ) -> Result<(), ClientError> {
        self.transport
            .borrow_mut()
            .device_method_response(self.device, method, status, payload)
    }

    // Upload to blob
    // --------------------------------------------------------------------

    /// Uploads a complete buffer as one blob, chunked into blocks.
    pub fn upload_to_blob(&mut self, blob_name: &str, data: &[u8]) -> Result<(), ClientError> {
        self.upload.upload_buffer(blob_name, data)
    }

    /// Uploads a blob from a pull-style source that yields successive
    /// blocks.
    pub fn upload_multiple_blocks_to_blob(
        &mut self,
        blob_name: &str,
        source: &mut dyn FnMut() -> BlockInput,
    ) -> Result<(), ClientError> {
        self.upload.upload_stream(blob_name, source)
    }

    /// Access to the upload sub-client for applications that drive the
    /// block protocol themselves.
    pub fn upload_client(&mut self) -> &mut UploadClient {
        &mut self.upload
    }

    // Options and the work loop
    // --------------------------------------------------------------------

    /// Applies one runtime option; see [`ClientOption`] for the catalog.
    pub fn set_option(&mut self, option: ClientOption) -> Result<(), ClientError> {
        match option {
            ClientOption::MessageTimeout(timeout_ms) => {
                self.default_timeout_ms = timeout_ms;
                Ok(())
            }
            ClientOption::ProductInfo(info) => {
                self.state.product_info = compose_user_agent(Some(&info));
                let transport = self
                    .transport
                    .borrow_mut()
                    .set_option(&TransportOption::ProductInfo(info.clone()));
                let upload = self.upload.set_option(&UploadOption::ProductInfo(info));
                combine_option_results(transport, upload)
            }
            ClientOption::DiagnosticSamplingPercentage(percentage) => {
                if percentage > 100 {
                    return Err(ClientError::failed(
                        "diagnostic sampling percentage must be at most 100",
                    ));
                }
                self.diagnostics.set_percentage(percentage);
                Ok(())
            }
            ClientOption::Batching(enabled) => self.transport_only(TransportOption::Batching(enabled)),
            ClientOption::MinPollingTime(secs) => {
                self.transport_only(TransportOption::MinPollingTime(secs))
            }
            ClientOption::X509Cert(pem) => self.forward_both(
                TransportOption::X509Cert(pem.clone()),
                UploadOption::X509Cert(pem),
            ),
            ClientOption::X509PrivateKey(pem) => self.forward_both(
                TransportOption::X509PrivateKey(pem.clone()),
                UploadOption::X509PrivateKey(pem),
            ),
            ClientOption::OpensslPrivateKeyType(kind) => self.forward_both(
                TransportOption::OpensslPrivateKeyType(kind.clone()),
                UploadOption::OpensslPrivateKeyType(kind),
            ),
            ClientOption::OpensslEngine(engine) => self.forward_both(
                TransportOption::OpensslEngine(engine.clone()),
                UploadOption::OpensslEngine(engine),
            ),
            ClientOption::TrustedCerts(bundle) => self.forward_both(
                TransportOption::TrustedCerts(bundle.clone()),
                UploadOption::TrustedCerts(bundle),
            ),
            ClientOption::HttpProxy {
                host,
                port,
                username,
                password,
            } => self.forward_both(
                TransportOption::Proxy {
                    host: host.clone(),
                    port,
                    username: username.clone(),
                    password: password.clone(),
                },
                UploadOption::Proxy {
                    host,
                    port,
                    username,
                    password,
                },
            ),
            ClientOption::CurlVerbose(enabled) => self.forward_both(
                TransportOption::Verbose(enabled),
                UploadOption::Verbose(enabled),
            ),
            ClientOption::NetworkInterface(interface) => self.forward_both(
                TransportOption::NetworkInterface(interface.clone()),
                UploadOption::NetworkInterface(interface),
            ),
            ClientOption::BlobUploadTimeoutSecs(secs) => combine_option_results(
                OptionResult::NotRecognized,
                self.upload.set_option(&UploadOption::TimeoutSecs(secs)),
            ),
            ClientOption::BlobUploadTlsRenegotiation(enabled) => combine_option_results(
                OptionResult::NotRecognized,
                self.upload
                    .set_option(&UploadOption::TlsRenegotiation(enabled)),
            ),
        }
    }

    fn transport_only(&mut self, option: TransportOption) -> Result<(), ClientError> {
        let result = self.transport.borrow_mut().set_option(&option);
        combine_option_results(result, OptionResult::NotRecognized)
    }

    fn forward_both(
        &mut self,
        transport_option: TransportOption,
        upload_option: UploadOption,
    ) -> Result<(), ClientError> {
        let transport = self.transport.borrow_mut().set_option(&transport_option);
        let upload = self.upload.set_option(&upload_option);
        combine_option_results(transport, upload)
    }

    /// One cooperative tick: expires timed-out queue entries, pushes the
    /// twin queue into the transport, lets the transport advance all I/O,
    /// then dispatches the accumulated confirmation callbacks.
    pub fn do_work(&mut self) {
        if let Ok(now) = self.clock.now_ms() {
            self.expire_waiting(now);
        }

        self.push_twin_queue();

        {
            let mut transport = self.transport.borrow_mut();
            transport.do_work(&mut self.state);
        }

        self.flush_confirmations();
    }

    fn expire_waiting(&mut self, now_ms: u64) {
        let mut queue = self.waiting_to_send.borrow_mut();
        let mut kept = VecDeque::with_capacity(queue.len());
        while let Some(request) = queue.pop_front() {
            let expired = request.timeout_ms > 0
                && now_ms.saturating_sub(request.enqueued_ms) > request.timeout_ms;
            if expired {
                if request.callback.is_some() {
                    self.state.confirmations.push_back(Confirmation {
                        request,
                        status: ConfirmationStatus::MessageTimeout,
                    });
                }
                // Entries without a callback are dropped silently.
            } else {
                kept.push_back(request);
            }
        }
        *queue = kept;
    }

    fn push_twin_queue(&mut self) {
        let mut transport = self.transport.borrow_mut();
        let mut index = 0;
        while index < self.twin_queue.len() {
            let item = &self.twin_queue[index];
            match transport.process_item(self.device, item.item_id, &item.state) {
                ProcessItemStatus::Ok => {
                    let item = self
                        .twin_queue
                        .remove(index)
                        .expect("index is checked against the queue length");
                    self.state.twin_inflight.push(item);
                }
                // Continue, NotConnected and Error all leave the item in
                // place for the next tick.
                _ => index += 1,
            }
        }
    }

    fn flush_confirmations(&mut self) {
        while let Some(confirmation) = self.state.confirmations.pop_front() {
            if let Some(callback) = confirmation.request.callback {
                callback(confirmation.status);
            }
        }
    }
}

fn combine_option_results(
    transport: OptionResult,
    upload: OptionResult,
) -> Result<(), ClientError> {
    match (transport, upload) {
        (OptionResult::Error, _) | (_, OptionResult::Error) => {
            Err(ClientError::failed("applying the option failed"))
        }
        (OptionResult::Ok, _) | (_, OptionResult::Ok) => Ok(()),
        (OptionResult::NotRecognized, OptionResult::NotRecognized) => Err(ClientError::InvalidArg(
            "the option is not recognized by the transport",
        )),
    }
}

impl Drop for DeviceClient {
    fn drop(&mut self) {
        log::debug!("Device client is being dropped");

        // Callbacks whose outcome is already known keep that outcome.
        self.flush_confirmations();

        // Everything still waiting drains as destroyed-before-send.
        let drained: Vec<SendRequest> = self.waiting_to_send.borrow_mut().drain(..).collect();
        for request in drained {
            if let Some(callback) = request.callback {
                callback(ConfirmationStatus::Destroyed);
            }
        }

        self.transport.borrow_mut().unregister(self.device);
    }
}
