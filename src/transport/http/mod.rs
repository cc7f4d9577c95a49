//! The HTTP rendition of the transport contract: batched or single event
//! POSTs, polled cloud-to-device GETs with an ETag-based disposition
//! flow, and per-request SAS authorization.
//!
//! Twin traffic and direct methods are not part of the HTTP dialect; the
//! corresponding capabilities answer with an error so the client keeps
//! those items queued or fails the subscription upfront.

use std::rc::Rc;

use anyhow::{anyhow, Result};

use crate::auth::AuthModule;
use crate::client::{compose_user_agent, RetryControl, DEFAULT_USER_AGENT};
use crate::error::{ClientError, ConfirmationStatus, ConnectionStatus, ConnectionStatusReason};
use crate::httpapi::{Connector, HttpConnection, HttpOptions, HttpRequest, HttpResponse, ProxyOptions, TlsConnector};
use crate::message::{Disposition, Message};
use crate::tick::{MonotonicClock, TickSource};
use crate::transport::{
    DeviceHandle, DeviceRegistration, DispositionContext, MethodId, OptionResult,
    ProcessItemStatus, ReceivedMessage, RetryPolicy, SendQueue, SendStatus, Transport,
    TransportContext, TransportOption,
};

mod batch;

use batch::{build_batch, message_size, BatchOutcome, IOTHUB_APP_PREFIX, MAXIMUM_MESSAGE_SIZE};

const API_VERSION: &str = "?api-version=2016-11-14";
const EVENT_ENDPOINT: &str = "/messages/events";
const MESSAGE_ENDPOINT: &str = "/messages/devicebound";

/// Minimum seconds between two cloud-to-device polls unless overridden.
const DEFAULT_MIN_POLLING_TIME_SECS: u64 = 25 * 60;

const CONTENT_TYPE: &str = "Content-Type";
const APPLICATION_OCTET_STREAM: &str = "application/octet-stream";
const APPLICATION_VND_IOTHUB_JSON: &str = "application/vnd.microsoft.iothub.json";

const IOTHUB_MESSAGE_ID: &str = "iothub-messageid";
const IOTHUB_CORRELATION_ID: &str = "iothub-correlationid";
const IOTHUB_CONTENT_TYPE_D2C: &str = "iothub-contenttype";
const IOTHUB_CONTENT_ENCODING_D2C: &str = "iothub-contentencoding";
const CONTENT_TYPE_C2D: &str = "contenttype";
const CONTENT_ENCODING_C2D: &str = "contentencoding";

struct HttpDevice {
    auth: AuthModule,
    /// `/devices/<id>/messages/events?api-version=…`
    event_path: String,
    /// Value of the `iothub-to` header.
    event_target: String,
    /// `/devices/<id>/messages/devicebound?api-version=…`
    message_path: String,
    /// `/devices/<id>/messages/devicebound/`; the ETag and the verb
    /// suffix are appended per disposition.
    disposition_prefix: String,
    waiting_to_send: SendQueue,
    subscribed: bool,
    /// Tick of the previous poll; `None` allows the next poll
    /// unconditionally.
    last_poll_ms: Option<u64>,
}

/// HTTP transport instance; may be shared by several device clients.
pub struct HttpTransport {
    hostname: String,
    connector: Box<dyn Connector>,
    connection: Option<Box<dyn HttpConnection>>,
    options: HttpOptions,
    batching: bool,
    min_polling_secs: u64,
    user_agent: String,
    clock: Rc<dyn TickSource>,
    devices: Vec<Option<HttpDevice>>,
    retry: RetryControl,
    retry_expired_reported: bool,
    last_status: Option<ConnectionStatus>,
}

impl HttpTransport {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self::with_connector(hostname, Box::new(TlsConnector))
    }

    /// Builds the transport on a custom connection factory; the seam the
    /// tests use to observe the wire traffic.
    pub fn with_connector(hostname: impl Into<String>, connector: Box<dyn Connector>) -> Self {
        HttpTransport {
            hostname: hostname.into(),
            connector,
            connection: None,
            options: HttpOptions::default(),
            batching: false,
            min_polling_secs: DEFAULT_MIN_POLLING_TIME_SECS,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            clock: Rc::new(MonotonicClock::new()),
            devices: Vec::new(),
            retry: RetryControl::new(RetryPolicy::ExponentialBackoffWithJitter, 0),
            retry_expired_reported: false,
            last_status: None,
        }
    }

    /// Replaces the clock used for the polling floor; for tests.
    pub fn with_clock(mut self, clock: Rc<dyn TickSource>) -> Self {
        self.clock = clock;
        self
    }

    fn execute(
        &mut self,
        method: http::Method,
        path: &str,
        headers: &[(String, String)],
        body: Option<&[u8]>,
    ) -> Result<HttpResponse> {
        if self.connection.is_none() {
            let connection = self.connector.connect(&self.hostname, &self.options)?;
            self.connection = Some(connection);
        }
        let connection = self
            .connection
            .as_mut()
            .expect("the connection was just created");
        connection.execute(&HttpRequest {
            method,
            path,
            headers,
            body,
        })
    }

    fn authorization(&self, device: &HttpDevice) -> Result<Option<String>> {
        device.auth.authorization_header(&self.hostname)
    }

    fn event_headers(&self, device: &HttpDevice) -> Result<Vec<(String, String)>> {
        let mut headers = vec![("iothub-to".to_owned(), device.event_target.clone())];
        if let Some(authorization) = self.authorization(device)? {
            headers.push(("Authorization".to_owned(), authorization));
        }
        headers.push(("Accept".to_owned(), "application/json".to_owned()));
        headers.push(("Connection".to_owned(), "Keep-Alive".to_owned()));
        headers.push(("User-Agent".to_owned(), self.user_agent.clone()));
        Ok(headers)
    }

    fn receive_headers(&self, device: &HttpDevice) -> Result<Vec<(String, String)>> {
        let mut headers = Vec::new();
        if let Some(authorization) = self.authorization(device)? {
            headers.push(("Authorization".to_owned(), authorization));
        }
        headers.push(("User-Agent".to_owned(), self.user_agent.clone()));
        Ok(headers)
    }

    fn disposition_headers(&self, device: &HttpDevice, etag: &str) -> Result<Vec<(String, String)>> {
        let mut headers = Vec::new();
        if let Some(authorization) = self.authorization(device)? {
            headers.push(("Authorization".to_owned(), authorization));
        }
        headers.push(("If-Match".to_owned(), format!("\"{etag}\"")));
        headers.push(("User-Agent".to_owned(), self.user_agent.clone()));
        Ok(headers)
    }

    fn report_connected(&mut self, ctx: &mut dyn TransportContext) {
        self.retry.record_success();
        self.retry_expired_reported = false;
        if self.last_status != Some(ConnectionStatus::Authenticated) {
            self.last_status = Some(ConnectionStatus::Authenticated);
            ctx.on_connection_status(ConnectionStatus::Authenticated, ConnectionStatusReason::Ok);
        }
    }

    fn report_disconnected(
        &mut self,
        ctx: &mut dyn TransportContext,
        reason: ConnectionStatusReason,
        now: Option<u64>,
    ) {
        if let Some(now) = now {
            self.retry.record_failure(now);
        }
        if self.last_status != Some(ConnectionStatus::Unauthenticated) {
            self.last_status = Some(ConnectionStatus::Unauthenticated);
            ctx.on_connection_status(ConnectionStatus::Unauthenticated, reason);
        }
    }

    /// Whether event sends may be attempted this tick under the retry
    /// policy. Also surfaces `RetryExpired` once when the retry window is
    /// exhausted.
    fn sends_allowed(&mut self, ctx: &mut dyn TransportContext, now: Option<u64>) -> bool {
        let Some(now) = now else {
            return true;
        };
        if self.retry.expired(now) {
            if !self.retry_expired_reported {
                self.retry_expired_reported = true;
                self.last_status = Some(ConnectionStatus::Unauthenticated);
                ctx.on_connection_status(
                    ConnectionStatus::Unauthenticated,
                    ConnectionStatusReason::RetryExpired,
                );
            }
            return false;
        }
        self.retry.attempt_due(now)
    }

    fn do_event(&mut self, index: usize, ctx: &mut dyn TransportContext, now: Option<u64>) {
        let Some(device) = self.devices[index].take() else {
            return;
        };

        if !device.waiting_to_send.borrow().is_empty() && self.sends_allowed(ctx, now) {
            if self.batching {
                self.send_batched(&device, ctx, now);
            } else {
                self.send_single(&device, ctx, now);
            }
        }

        self.devices[index] = Some(device);
    }

    fn send_batched(
        &mut self,
        device: &HttpDevice,
        ctx: &mut dyn TransportContext,
        now: Option<u64>,
    ) {
        let outcome = build_batch(&mut device.waiting_to_send.borrow_mut());
        let (body, requests) = match outcome {
            BatchOutcome::Empty => return,
            BatchOutcome::OversizedFirst(request) => {
                log::error!("A queued message alone exceeds the transport size cap; failing it");
                ctx.on_send_complete(vec![request], ConfirmationStatus::Error);
                return;
            }
            BatchOutcome::Batch { body, requests } => (body, requests),
        };

        let mut headers = match self.event_headers(device) {
            Ok(headers) => headers,
            Err(e) => {
                log::error!("Unable to build event headers: {e:?}");
                requeue_front(&device.waiting_to_send, requests);
                self.report_disconnected(ctx, ConnectionStatusReason::BadCredential, now);
                return;
            }
        };
        headers.push((CONTENT_TYPE.to_owned(), APPLICATION_VND_IOTHUB_JSON.to_owned()));

        match self.execute(http::Method::POST, &device.event_path, &headers, Some(&body)) {
            Ok(response) if is_success(response.status) => {
                self.report_connected(ctx);
                ctx.on_send_complete(requests, ConfirmationStatus::Ok);
            }
            Ok(response) => {
                log::error!(
                    "Batched event POST failed with status code {}",
                    response.status
                );
                if response.status == 401 {
                    self.report_disconnected(ctx, ConnectionStatusReason::ExpiredSasToken, now);
                }
                ctx.on_send_complete(requests, ConfirmationStatus::Error);
            }
            Err(e) => {
                log::warn!("Batched event POST did not complete: {e:?}");
                requeue_front(&device.waiting_to_send, requests);
                self.report_disconnected(ctx, ConnectionStatusReason::CommunicationError, now);
            }
        }
    }

    fn send_single(
        &mut self,
        device: &HttpDevice,
        ctx: &mut dyn TransportContext,
        now: Option<u64>,
    ) {
        loop {
            let Some(request) = device.waiting_to_send.borrow_mut().pop_front() else {
                return;
            };

            if message_size(&request.message) > MAXIMUM_MESSAGE_SIZE {
                log::error!("A queued message alone exceeds the transport size cap; failing it");
                ctx.on_send_complete(vec![request], ConfirmationStatus::Error);
                continue;
            }

            let mut headers = match self.event_headers(device) {
                Ok(headers) => headers,
                Err(e) => {
                    log::error!("Unable to build event headers: {e:?}");
                    requeue_front(&device.waiting_to_send, vec![request]);
                    self.report_disconnected(ctx, ConnectionStatusReason::BadCredential, now);
                    return;
                }
            };
            headers.push((CONTENT_TYPE.to_owned(), APPLICATION_OCTET_STREAM.to_owned()));
            append_message_headers(&mut headers, &request.message);

            let body = match request.message.body_kind() {
                crate::message::BodyKind::Binary => request
                    .message
                    .binary()
                    .expect("a binary message always yields its bytes")
                    .to_vec(),
                crate::message::BodyKind::Text => request
                    .message
                    .text()
                    .expect("a text message always yields its text")
                    .as_bytes()
                    .to_vec(),
            };

            match self.execute(http::Method::POST, &device.event_path, &headers, Some(&body)) {
                Ok(response) if is_success(response.status) => {
                    self.report_connected(ctx);
                    ctx.on_send_complete(vec![request], ConfirmationStatus::Ok);
                }
                Ok(response) => {
                    log::error!("Event POST failed with status code {}", response.status);
                    if response.status == 401 {
                        self.report_disconnected(ctx, ConnectionStatusReason::ExpiredSasToken, now);
                    }
                    ctx.on_send_complete(vec![request], ConfirmationStatus::Error);
                }
                Err(e) => {
                    log::warn!("Event POST did not complete: {e:?}");
                    requeue_front(&device.waiting_to_send, vec![request]);
                    self.report_disconnected(ctx, ConnectionStatusReason::CommunicationError, now);
                    return;
                }
            }
        }
    }

    fn do_receive(&mut self, index: usize, ctx: &mut dyn TransportContext, now: Option<u64>) {
        let Some(mut device) = self.devices[index].take() else {
            return;
        };

        if device.subscribed && poll_allowed(device.last_poll_ms, now, self.min_polling_secs) {
            device.last_poll_ms = now;
            self.poll_inbox(index, &device, ctx, now);
        }

        self.devices[index] = Some(device);
    }

    fn poll_inbox(
        &mut self,
        index: usize,
        device: &HttpDevice,
        ctx: &mut dyn TransportContext,
        now: Option<u64>,
    ) {
        let headers = match self.receive_headers(device) {
            Ok(headers) => headers,
            Err(e) => {
                log::error!("Unable to build receive headers: {e:?}");
                self.report_disconnected(ctx, ConnectionStatusReason::BadCredential, now);
                return;
            }
        };

        let response = match self.execute(http::Method::GET, &device.message_path, &headers, None) {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Cloud-to-device poll did not complete: {e:?}");
                self.report_disconnected(ctx, ConnectionStatusReason::CommunicationError, now);
                return;
            }
        };

        match response.status {
            204 => {
                self.report_connected(ctx);
            }
            200 => {
                self.report_connected(ctx);
                let Some(etag) = extract_etag(&response) else {
                    log::error!("Received a message without a usable ETag; dropping it");
                    return;
                };

                let message = build_received_message(&response);
                let context = DispositionContext {
                    device: DeviceHandle(index),
                    etag,
                };

                let disposition = ctx.on_message(ReceivedMessage {
                    message,
                    context: context.clone(),
                });
                if let Some(disposition) = disposition {
                    if let Err(e) = self.dispose(device, &context.etag, disposition) {
                        log::warn!("Unable to send message disposition: {e:?}");
                    }
                }
            }
            status => {
                log::warn!("Cloud-to-device poll answered with status code {status}");
            }
        }
    }

    fn dispose(
        &mut self,
        device: &HttpDevice,
        etag: &str,
        disposition: Disposition,
    ) -> Result<()> {
        let (method, path) = match disposition {
            Disposition::Accepted => (
                http::Method::DELETE,
                format!("{}{}{}", device.disposition_prefix, etag, API_VERSION),
            ),
            Disposition::Rejected => (
                http::Method::DELETE,
                format!("{}{}{}&reject", device.disposition_prefix, etag, API_VERSION),
            ),
            Disposition::Abandoned => (
                http::Method::POST,
                format!("{}{}/abandon{}", device.disposition_prefix, etag, API_VERSION),
            ),
        };

        let headers = self.disposition_headers(device, etag)?;
        let response = self.execute(method, &path, &headers, None)?;
        if response.status != 204 {
            return Err(anyhow!(
                "disposition request answered with status code {}",
                response.status
            ));
        }
        Ok(())
    }

    fn device(&self, handle: DeviceHandle) -> Result<&HttpDevice, ClientError> {
        self.devices
            .get(handle.0)
            .and_then(Option::as_ref)
            .ok_or(ClientError::InvalidArg("unknown device handle"))
    }

    fn device_mut(&mut self, handle: DeviceHandle) -> Result<&mut HttpDevice, ClientError> {
        self.devices
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .ok_or(ClientError::InvalidArg("unknown device handle"))
    }

    /// Drops the pooled connection so the next request renegotiates with
    /// the current TLS and proxy options.
    fn invalidate_connection(&mut self) {
        self.connection = None;
    }
}

impl Transport for HttpTransport {
    fn register(
        &mut self,
        device: DeviceRegistration,
        waiting_to_send: SendQueue,
    ) -> Result<DeviceHandle, ClientError> {
        let duplicate = self.devices.iter().flatten().any(|registered| {
            registered.auth.device_id() == device.device_id
        });
        if duplicate {
            return Err(ClientError::failed(format!(
                "device '{}' is already registered with this transport",
                device.device_id
            )));
        }

        let encoded = urlencoding::encode(&device.device_id).into_owned();
        let auth = AuthModule::new(device.device_id, device.credentials);
        log::debug!(
            "Registering device '{}' with {:?} credentials",
            auth.device_id(),
            auth.kind()
        );

        // Certificate material supplied with the credentials goes straight
        // to the TLS layer; the options may override it later.
        if let Some((cert, private_key)) = auth.x509_material() {
            if let (Some(cert), Some(private_key)) = (cert, private_key) {
                self.options.x509_cert = Some(cert.to_owned());
                self.options.x509_private_key = Some(private_key.to_owned());
                self.invalidate_connection();
            }
        }

        let registration = HttpDevice {
            auth,
            event_path: format!("/devices/{encoded}{EVENT_ENDPOINT}{API_VERSION}"),
            event_target: format!("/devices/{encoded}{EVENT_ENDPOINT}"),
            message_path: format!("/devices/{encoded}{MESSAGE_ENDPOINT}{API_VERSION}"),
            disposition_prefix: format!("/devices/{encoded}{MESSAGE_ENDPOINT}/"),
            waiting_to_send,
            subscribed: false,
            last_poll_ms: None,
        };

        let index = match self.devices.iter().position(Option::is_none) {
            Some(free) => {
                self.devices[free] = Some(registration);
                free
            }
            None => {
                self.devices.push(Some(registration));
                self.devices.len() - 1
            }
        };
        Ok(DeviceHandle(index))
    }

    fn unregister(&mut self, device: DeviceHandle) {
        if let Some(slot) = self.devices.get_mut(device.0) {
            *slot = None;
        }
    }

    fn subscribe_messages(&mut self, device: DeviceHandle) -> Result<(), ClientError> {
        self.device_mut(device)?.subscribed = true;
        Ok(())
    }

    fn unsubscribe_messages(&mut self, device: DeviceHandle) {
        if let Ok(device) = self.device_mut(device) {
            device.subscribed = false;
        }
    }

    fn subscribe_twin(&mut self, _device: DeviceHandle) -> Result<(), ClientError> {
        log::error!("The HTTP transport does not support twin traffic");
        Err(ClientError::failed(
            "twin traffic is not supported by the HTTP transport",
        ))
    }

    fn unsubscribe_twin(&mut self, _device: DeviceHandle) {
        log::error!("The HTTP transport does not support twin traffic");
    }

    fn subscribe_methods(&mut self, _device: DeviceHandle) -> Result<(), ClientError> {
        log::error!("The HTTP transport does not support direct methods");
        Err(ClientError::failed(
            "direct methods are not supported by the HTTP transport",
        ))
    }

    fn unsubscribe_methods(&mut self, _device: DeviceHandle) {
        log::error!("The HTTP transport does not support direct methods");
    }

    fn do_work(&mut self, ctx: &mut dyn TransportContext) {
        // Product info may have changed since the last tick; rebuild the
        // cached User-Agent so every request of this tick carries it.
        self.user_agent = ctx.product_info();
        let now = self.clock.now_ms().ok();

        for index in 0..self.devices.len() {
            self.do_event(index, ctx, now);
            self.do_receive(index, ctx, now);
        }
    }

    fn process_item(
        &mut self,
        _device: DeviceHandle,
        _item_id: u32,
        _state: &[u8],
    ) -> ProcessItemStatus {
        log::error!("The HTTP transport does not support reported-state updates");
        ProcessItemStatus::Error
    }

    fn request_twin(&mut self, _device: DeviceHandle) -> Result<(), ClientError> {
        Err(ClientError::failed(
            "twin reads are not supported by the HTTP transport",
        ))
    }

    fn send_message_disposition(
        &mut self,
        context: &DispositionContext,
        disposition: Disposition,
    ) -> Result<(), ClientError> {
        let device = self.devices.get_mut(context.device.0).and_then(Option::take);
        let Some(device) = device else {
            return Err(ClientError::InvalidArg("unknown device handle"));
        };
        let result = self.dispose(&device, &context.etag, disposition);
        self.devices[context.device.0] = Some(device);
        result.map_err(ClientError::from)
    }

    fn device_method_response(
        &mut self,
        _device: DeviceHandle,
        _method: MethodId,
        _status: i32,
        _payload: &[u8],
    ) -> Result<(), ClientError> {
        Err(ClientError::failed(
            "direct methods are not supported by the HTTP transport",
        ))
    }

    fn send_status(&self, device: DeviceHandle) -> SendStatus {
        match self.device(device) {
            Ok(device) if !device.waiting_to_send.borrow().is_empty() => SendStatus::Busy,
            _ => SendStatus::Idle,
        }
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn set_option(&mut self, option: &TransportOption) -> OptionResult {
        match option {
            TransportOption::Batching(enabled) => self.batching = *enabled,
            TransportOption::MinPollingTime(secs) => self.min_polling_secs = *secs,
            TransportOption::Proxy {
                host,
                port,
                username,
                password,
            } => {
                self.options.proxy = Some(ProxyOptions {
                    host: host.clone(),
                    port: *port,
                    username: username.clone(),
                    password: password.clone(),
                });
                self.invalidate_connection();
            }
            TransportOption::TrustedCerts(bundle) => {
                self.options.trusted_certs = Some(bundle.clone());
                self.invalidate_connection();
            }
            TransportOption::X509Cert(pem) => {
                self.options.x509_cert = Some(pem.clone());
                self.invalidate_connection();
            }
            TransportOption::X509PrivateKey(pem) => {
                self.options.x509_private_key = Some(pem.clone());
                self.invalidate_connection();
            }
            TransportOption::OpensslPrivateKeyType(kind) => {
                self.options.openssl_private_key_type = Some(kind.clone());
            }
            TransportOption::OpensslEngine(engine) => {
                self.options.openssl_engine = Some(engine.clone());
            }
            TransportOption::NetworkInterface(interface) => {
                self.options.network_interface = Some(interface.clone());
                self.invalidate_connection();
            }
            TransportOption::Verbose(enabled) => {
                self.options.verbose = *enabled;
                self.invalidate_connection();
            }
            TransportOption::ProductInfo(info) => {
                self.user_agent = compose_user_agent(Some(info));
            }
        }
        OptionResult::Ok
    }

    fn set_retry_policy(
        &mut self,
        policy: RetryPolicy,
        timeout_secs: u64,
    ) -> Result<(), ClientError> {
        self.retry = RetryControl::new(policy, timeout_secs);
        self.retry_expired_reported = false;
        Ok(())
    }
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// First poll is always allowed; a failing tick source also counts as a
/// first poll.
fn poll_allowed(last_poll_ms: Option<u64>, now: Option<u64>, min_polling_secs: u64) -> bool {
    match (last_poll_ms, now) {
        (None, _) | (_, None) => true,
        (Some(last), Some(now)) => now.saturating_sub(last) > min_polling_secs * 1_000,
    }
}

fn requeue_front(queue: &SendQueue, requests: Vec<crate::transport::SendRequest>) {
    let mut queue = queue.borrow_mut();
    for request in requests.into_iter().rev() {
        queue.push_front(request);
    }
}

fn append_message_headers(headers: &mut Vec<(String, String)>, message: &Message) {
    let system = message.system_properties();
    if let Some(message_id) = &system.message_id {
        headers.push((IOTHUB_MESSAGE_ID.to_owned(), message_id.clone()));
    }
    if let Some(correlation_id) = &system.correlation_id {
        headers.push((IOTHUB_CORRELATION_ID.to_owned(), correlation_id.clone()));
    }
    if let Some(content_type) = &system.content_type {
        headers.push((IOTHUB_CONTENT_TYPE_D2C.to_owned(), content_type.clone()));
    }
    if let Some(content_encoding) = &system.content_encoding {
        headers.push((IOTHUB_CONTENT_ENCODING_D2C.to_owned(), content_encoding.clone()));
    }
    for (name, value) in message.properties().iter() {
        headers.push((format!("{IOTHUB_APP_PREFIX}{name}"), value.to_owned()));
    }
}

/// The ETag must be a quoted string of length at least two; the quotes
/// are stripped.
fn extract_etag(response: &HttpResponse) -> Option<String> {
    let etag = response.header("etag")?;
    if etag.len() >= 2 && etag.starts_with('"') && etag.ends_with('"') {
        Some(etag[1..etag.len() - 1].to_owned())
    } else {
        None
    }
}

/// Rebuilds a [`Message`] from a cloud-to-device response: the body
/// becomes the payload, `iothub-app-*` headers become application
/// properties and the documented system headers are mapped back.
fn build_received_message(response: &HttpResponse) -> Message {
    let mut message = Message::from_binary(response.body.clone());
    for (name, value) in &response.headers {
        if let Some(property) = name.strip_prefix(IOTHUB_APP_PREFIX) {
            if !property.is_empty() {
                message.properties_mut().add_or_update(property, value.clone());
            }
        } else if name == IOTHUB_MESSAGE_ID {
            message.system_properties_mut().message_id = Some(value.clone());
        } else if name == IOTHUB_CORRELATION_ID {
            message.system_properties_mut().correlation_id = Some(value.clone());
        } else if name == CONTENT_TYPE_C2D {
            message.system_properties_mut().content_type = Some(value.clone());
        } else if name == CONTENT_ENCODING_C2D {
            message.system_properties_mut().content_encoding = Some(value.clone());
        }
    }
    message
}
