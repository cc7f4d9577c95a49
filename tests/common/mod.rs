#![allow(dead_code)]

//! Test doubles shared by the integration tests: a scripted transport
//! for driving the client core and a recording HTTP connection for
//! driving the wire dialects.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use hublink::httpapi::{Connector, HttpConnection, HttpOptions, HttpRequest, HttpResponse};
use hublink::transport::{
    DeviceHandle, DeviceRegistration, MethodId, OptionResult, ProcessItemStatus, ReceivedMessage,
    RetryPolicy, SendQueue, SendStatus, Transport, TransportContext, TwinUpdateKind,
};
use hublink::{
    ClientError, ConfirmationStatus, ConnectionStatus, ConnectionStatusReason, Disposition,
    Message,
};

pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .is_test(true)
        .try_init();
}

// Scripted transport
// ================================================================================

/// A fully scripted transport: completes queued sends when told to,
/// injects inbound traffic and records everything the client forwards.
#[derive(Default)]
pub struct MockTransport {
    pub devices: Vec<(String, SendQueue)>,
    /// When true, `do_work` drains every queue and confirms with `Ok`.
    pub complete_sends: bool,
    pub fail_subscribe: bool,
    pub subscribe_calls: Vec<&'static str>,
    pub unsubscribe_calls: Vec<&'static str>,
    pub process_item_result: Option<ProcessItemStatus>,
    pub accepted_items: Vec<u32>,
    /// `(item_id, status)` pairs delivered through
    /// `on_reported_state_complete` on the next tick.
    pub pending_acks: Vec<(u32, i32)>,
    /// `(message, token)` pairs delivered through `on_message` on the
    /// next tick.
    pub inbound_messages: Vec<(Message, String)>,
    /// `(name, payload, method id)` triples delivered through `on_method`
    /// on the next tick.
    pub inbound_methods: Vec<(String, Vec<u8>, u64)>,
    pub inbound_twins: Vec<(TwinUpdateKind, Vec<u8>)>,
    pub inbound_status: Vec<(ConnectionStatus, ConnectionStatusReason)>,
    /// Messages the transport completed, cloned before confirmation.
    pub completed_messages: Vec<Message>,
    /// Wire-level dispositions: `(token, disposition)`.
    pub dispositions: Vec<(String, Disposition)>,
    pub method_responses: Vec<(u64, i32, Vec<u8>)>,
    pub twin_requests: usize,
    pub option_result: Option<OptionResult>,
    pub options_seen: Vec<String>,
    pub retry_policies: Vec<(RetryPolicy, u64)>,
    pub unregistered: bool,
    pub product_info_seen: Option<String>,
}

impl MockTransport {
    pub fn new() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(MockTransport {
            complete_sends: true,
            ..MockTransport::default()
        }))
    }
}

impl Transport for MockTransport {
    fn register(
        &mut self,
        device: DeviceRegistration,
        waiting_to_send: SendQueue,
    ) -> Result<DeviceHandle, ClientError> {
        if self.devices.iter().any(|(id, _)| *id == device.device_id) {
            return Err(ClientError::Other(anyhow::anyhow!(
                "device is already registered"
            )));
        }
        self.devices.push((device.device_id, waiting_to_send));
        Ok(DeviceHandle(self.devices.len() - 1))
    }

    fn unregister(&mut self, _device: DeviceHandle) {
        self.unregistered = true;
    }

    fn subscribe_messages(&mut self, _device: DeviceHandle) -> Result<(), ClientError> {
        if self.fail_subscribe {
            return Err(ClientError::Other(anyhow::anyhow!("subscribe failed")));
        }
        self.subscribe_calls.push("messages");
        Ok(())
    }

    fn unsubscribe_messages(&mut self, _device: DeviceHandle) {
        self.unsubscribe_calls.push("messages");
    }

    fn subscribe_twin(&mut self, _device: DeviceHandle) -> Result<(), ClientError> {
        if self.fail_subscribe {
            return Err(ClientError::Other(anyhow::anyhow!("subscribe failed")));
        }
        self.subscribe_calls.push("twin");
        Ok(())
    }

    fn unsubscribe_twin(&mut self, _device: DeviceHandle) {
        self.unsubscribe_calls.push("twin");
    }

    fn subscribe_methods(&mut self, _device: DeviceHandle) -> Result<(), ClientError> {
        if self.fail_subscribe {
            return Err(ClientError::Other(anyhow::anyhow!("subscribe failed")));
        }
        self.subscribe_calls.push("methods");
        Ok(())
    }

    fn unsubscribe_methods(&mut self, _device: DeviceHandle) {
        self.unsubscribe_calls.push("methods");
    }

    fn do_work(&mut self, ctx: &mut dyn TransportContext) {
        self.product_info_seen = Some(ctx.product_info());

        if self.complete_sends {
            for (_, queue) in &self.devices {
                let drained: Vec<_> = queue.borrow_mut().drain(..).collect();
                if drained.is_empty() {
                    continue;
                }
                for request in &drained {
                    self.completed_messages.push(request.message.clone());
                }
                ctx.on_send_complete(drained, ConfirmationStatus::Ok);
            }
        }

        for (message, token) in self.inbound_messages.drain(..) {
            let received = ReceivedMessage::new(message, DeviceHandle(0), token.clone());
            if let Some(disposition) = ctx.on_message(received) {
                self.dispositions.push((token, disposition));
            }
        }

        for (name, payload, method_id) in self.inbound_methods.drain(..) {
            if let Some((status, response)) = ctx.on_method(&name, &payload, MethodId(method_id)) {
                self.method_responses.push((method_id, status, response));
            }
        }

        for (kind, payload) in self.inbound_twins.drain(..) {
            ctx.on_twin_update(kind, &payload);
        }

        for (item_id, status) in self.pending_acks.drain(..) {
            ctx.on_reported_state_complete(item_id, status);
        }

        for (status, reason) in self.inbound_status.drain(..) {
            ctx.on_connection_status(status, reason);
        }
    }

    fn process_item(
        &mut self,
        _device: DeviceHandle,
        item_id: u32,
        _state: &[u8],
    ) -> ProcessItemStatus {
        let result = self.process_item_result.unwrap_or(ProcessItemStatus::Ok);
        if result == ProcessItemStatus::Ok {
            self.accepted_items.push(item_id);
        }
        result
    }

    fn request_twin(&mut self, _device: DeviceHandle) -> Result<(), ClientError> {
        self.twin_requests += 1;
        Ok(())
    }

    fn send_message_disposition(
        &mut self,
        context: &hublink::transport::DispositionContext,
        disposition: Disposition,
    ) -> Result<(), ClientError> {
        self.dispositions
            .push((context.token().to_owned(), disposition));
        Ok(())
    }

    fn device_method_response(
        &mut self,
        _device: DeviceHandle,
        method: MethodId,
        status: i32,
        payload: &[u8],
    ) -> Result<(), ClientError> {
        self.method_responses.push((method.0, status, payload.to_vec()));
        Ok(())
    }

    fn send_status(&self, device: DeviceHandle) -> SendStatus {
        match self.devices.get(device.0) {
            Some((_, queue)) if !queue.borrow().is_empty() => SendStatus::Busy,
            _ => SendStatus::Idle,
        }
    }

    fn hostname(&self) -> &str {
        "mock.example.net"
    }

    fn set_option(&mut self, option: &hublink::transport::TransportOption) -> OptionResult {
        self.options_seen.push(format!("{option:?}"));
        self.option_result.unwrap_or(OptionResult::Ok)
    }

    fn set_retry_policy(
        &mut self,
        policy: RetryPolicy,
        timeout_secs: u64,
    ) -> Result<(), ClientError> {
        self.retry_policies.push((policy, timeout_secs));
        Ok(())
    }
}

// Recording HTTP connection
// ================================================================================

pub struct RecordedRequest {
    pub host: String,
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_string(&self) -> String {
        String::from_utf8(self.body.clone().unwrap_or_default()).expect("body is UTF-8")
    }
}

pub enum ScriptedResponse {
    Response(HttpResponse),
    TransportError,
}

#[derive(Default)]
pub struct HttpLog {
    pub requests: Vec<RecordedRequest>,
    pub responses: VecDeque<ScriptedResponse>,
    pub connected_hosts: Vec<String>,
}

impl HttpLog {
    pub fn push_status(&mut self, status: u16) {
        self.responses.push_back(ScriptedResponse::Response(HttpResponse {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }));
    }

    pub fn push_response(&mut self, status: u16, headers: Vec<(String, String)>, body: Vec<u8>) {
        self.responses.push_back(ScriptedResponse::Response(HttpResponse {
            status,
            headers,
            body,
        }));
    }

    pub fn push_transport_error(&mut self) {
        self.responses.push_back(ScriptedResponse::TransportError);
    }
}

/// Connector handing out connections that share one request log and one
/// response script. Responses are consumed in order; an exhausted script
/// answers 204.
pub struct FakeConnector {
    pub log: Rc<RefCell<HttpLog>>,
}

impl FakeConnector {
    pub fn new() -> (Self, Rc<RefCell<HttpLog>>) {
        let log = Rc::new(RefCell::new(HttpLog::default()));
        (FakeConnector { log: log.clone() }, log)
    }
}

impl Connector for FakeConnector {
    fn connect(
        &self,
        host: &str,
        _options: &HttpOptions,
    ) -> anyhow::Result<Box<dyn HttpConnection>> {
        self.log.borrow_mut().connected_hosts.push(host.to_owned());
        Ok(Box::new(FakeConnection {
            host: host.to_owned(),
            log: self.log.clone(),
        }))
    }
}

struct FakeConnection {
    host: String,
    log: Rc<RefCell<HttpLog>>,
}

impl HttpConnection for FakeConnection {
    fn execute(&mut self, request: &HttpRequest<'_>) -> anyhow::Result<HttpResponse> {
        let mut log = self.log.borrow_mut();
        log.requests.push(RecordedRequest {
            host: self.host.clone(),
            method: request.method.to_string(),
            path: request.path.to_owned(),
            headers: request.headers.to_vec(),
            body: request.body.map(<[u8]>::to_vec),
        });

        match log.responses.pop_front() {
            Some(ScriptedResponse::Response(response)) => Ok(response),
            Some(ScriptedResponse::TransportError) => {
                Err(anyhow::anyhow!("scripted transport error"))
            }
            None => Ok(HttpResponse {
                status: 204,
                headers: Vec::new(),
                body: Vec::new(),
            }),
        }
    }
}
