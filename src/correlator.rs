//! Request correlation by CoAP message ID.
//!
//! The [`Correlator`] owns every outstanding request: it allocates message
//! IDs, builds the outbound frame, and settles each request exactly once when
//! a matching response arrives, its deadline passes, it is cancelled, or the
//! connection is lost.
//!
//! It is plain synchronous state. The client event loop is its only owner and
//! drives it with inbound messages and the clock.
//!
//! # Deadlines
//!
//! Deadlines sit in a min-heap keyed by `(deadline, message_id, generation)`.
//! Settling a request does not touch the heap; stale entries are skipped when
//! they reach the top.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{oneshot, OwnedSemaphorePermit};
use tokio::time::Instant;

use crate::coap::{CoapMessage, CoapOption, ContentFormat, MessageType, Method, Payload, ResponseCode};
use crate::error::{Mup1Error, Result};
use crate::protocol::Frame;

/// Highest number of requests that can be outstanding at once.
pub const MAX_OUTSTANDING: usize = u16::MAX as usize;

/// Deadline offset used when `now + timeout` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// A request to send to the device.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    /// Path with optional query, e.g. `/c?d=a`.
    pub uri: String,
    pub payload: Option<Payload>,
    /// Content-Format announced for the payload.
    pub content_format: ContentFormat,
    pub accept: Option<ContentFormat>,
    /// Overrides the client's default request timeout.
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            payload: None,
            content_format: ContentFormat::Cbor,
            accept: None,
            timeout: None,
        }
    }

    pub fn get(uri: impl Into<String>) -> Self {
        Self::new(Method::Get, uri)
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_content_format(mut self, format: ContentFormat) -> Self {
        self.content_format = format;
        self
    }

    pub fn with_accept(mut self, format: ContentFormat) -> Self {
        self.accept = Some(format);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// CoAP message for this request under `message_id`.
    pub fn to_message(&self, message_id: u16) -> CoapMessage {
        let mut message = CoapMessage::request(self.method, message_id, &self.uri);
        if let Some(payload) = &self.payload {
            message = message.with_payload(payload.clone(), self.content_format);
        }
        if let Some(accept) = self.accept {
            message = message.with_accept(accept);
        }
        message
    }
}

/// A successful (class 2) response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub message_id: u16,
    pub code: ResponseCode,
    pub options: Vec<CoapOption>,
    pub payload: Option<Payload>,
    /// Time from registration to settlement.
    pub latency: Duration,
}

impl Response {
    pub fn content_format(&self) -> Option<ContentFormat> {
        self.options
            .iter()
            .find(|o| o.number == crate::coap::number::CONTENT_FORMAT)
            .and_then(CoapOption::as_uint)
            .map(|id| ContentFormat::from_id(id as u16))
    }

    pub fn into_payload(self) -> Option<Payload> {
        self.payload
    }

    /// Deserialize the payload. A missing payload is an error.
    pub fn deserialize<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        match &self.payload {
            Some(payload) => payload.deserialize(),
            None => Err(Mup1Error::MissingPayload {
                message_id: self.message_id,
            }),
        }
    }
}

/// Receiving half of a request's one-shot settlement.
pub type ResponseReceiver = oneshot::Receiver<Result<Response>>;

/// Sending half of a request's settlement; consumed on use.
#[derive(Debug)]
struct Settle(oneshot::Sender<Result<Response>>);

impl Settle {
    fn fulfil(self, response: Response) {
        self.complete(Ok(response));
    }

    fn reject(self, error: Mup1Error) {
        self.complete(Err(error));
    }

    fn complete(self, outcome: Result<Response>) {
        if self.0.send(outcome).is_err() {
            tracing::trace!("request settled after its caller went away");
        }
    }
}

/// Bookkeeping for one outstanding request.
#[derive(Debug)]
struct PendingRequest {
    method: Method,
    uri: String,
    created_at: Instant,
    timeout: Duration,
    generation: u64,
    settle: Settle,
    /// In-flight slot, released when the request settles.
    _permit: Option<OwnedSemaphorePermit>,
}

/// A registered request ready for transmission.
#[derive(Debug)]
pub struct OutboundRequest {
    pub message_id: u16,
    /// Encoded MUP1 frame.
    pub frame: Bytes,
    pub response: ResponseReceiver,
}

/// Pending-request table, message-ID allocator and deadline queue.
#[derive(Debug)]
pub struct Correlator {
    pending: HashMap<u16, PendingRequest>,
    deadlines: BinaryHeap<Reverse<(Instant, u16, u64)>>,
    next_id: u16,
    generation: u64,
    capacity: usize,
}

impl Correlator {
    /// Create a correlator that allows the full message-ID space to be in use.
    pub fn new() -> Self {
        Self::with_capacity(MAX_OUTSTANDING)
    }

    /// Create a correlator that refuses to hold more than `capacity` requests.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pending: HashMap::new(),
            deadlines: BinaryHeap::new(),
            next_id: 1,
            generation: 0,
            capacity: capacity.clamp(1, MAX_OUTSTANDING),
        }
    }

    /// Start allocating at `id` (0 is mapped to 1).
    pub fn starting_at(mut self, id: u16) -> Self {
        self.next_id = id.max(1);
        self
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// True if `message_id` has a live request.
    pub fn is_pending(&self, message_id: u16) -> bool {
        self.pending.contains_key(&message_id)
    }

    /// Next message ID in [1, 65535] not held by a live request.
    fn allocate_id(&mut self) -> Result<u16> {
        if self.pending.len() >= self.capacity {
            return Err(Mup1Error::TooManyOutstanding(self.pending.len()));
        }

        loop {
            let id = self.next_id;
            self.next_id = if id == u16::MAX { 1 } else { id + 1 };
            if !self.pending.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    /// Register `request` and encode its frame.
    ///
    /// The request expires at `now + timeout`, or about thirty years out if
    /// that overflows. `permit` is held until the
    /// request settles.
    pub fn send(
        &mut self,
        request: &Request,
        timeout: Duration,
        permit: Option<OwnedSemaphorePermit>,
        now: Instant,
    ) -> Result<OutboundRequest> {
        let message_id = self.allocate_id()?;
        let coap = request.to_message(message_id).encode()?;
        let frame = Frame::coap(coap).encode();

        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + FAR_FUTURE);

        let (tx, rx) = oneshot::channel();
        self.generation += 1;
        self.deadlines
            .push(Reverse((deadline, message_id, self.generation)));
        self.pending.insert(
            message_id,
            PendingRequest {
                method: request.method,
                uri: request.uri.clone(),
                created_at: now,
                timeout,
                generation: self.generation,
                settle: Settle(tx),
                _permit: permit,
            },
        );
        self.compact_deadlines();

        tracing::debug!(
            "request {} registered: {} {} (timeout {:?})",
            message_id,
            request.method,
            request.uri,
            timeout
        );

        Ok(OutboundRequest {
            message_id,
            frame: Bytes::from(frame),
            response: rx,
        })
    }

    /// Match an inbound CoAP message against the pending table.
    ///
    /// Returns the settled message ID, or `None` if the message settled
    /// nothing (stray, duplicate, late, empty ACK or a device request).
    pub fn on_coap_message(&mut self, message: CoapMessage) -> Option<u16> {
        let message_id = message.message_id;
        let code = message.response_code();

        if message.message_type == MessageType::Reset {
            let pending = self.take(message_id, "reset")?;
            tracing::debug!("request {} reset by device", message_id);
            pending.settle.reject(Mup1Error::Reset { message_id });
            return Some(message_id);
        }

        if code.is_empty() {
            tracing::debug!("empty {:?} for message {}", message.message_type, message_id);
            return None;
        }
        if code.class() == 0 {
            tracing::debug!("ignoring device request {} (code {})", message_id, code);
            return None;
        }

        let pending = self.take(message_id, "response")?;
        let latency = Instant::now().saturating_duration_since(pending.created_at);
        tracing::debug!(
            "request {} ({} {}) settled with {} after {:?}",
            message_id,
            pending.method,
            pending.uri,
            code,
            latency
        );

        if code.is_success() {
            pending.settle.fulfil(Response {
                message_id,
                code,
                options: message.options,
                payload: message.payload,
                latency,
            });
        } else {
            pending.settle.reject(Mup1Error::DeviceError {
                code,
                payload: message.payload,
            });
        }
        Some(message_id)
    }

    fn take(&mut self, message_id: u16, what: &str) -> Option<PendingRequest> {
        let pending = self.pending.remove(&message_id);
        if pending.is_none() {
            tracing::debug!("dropping {} for unknown message {}", what, message_id);
        }
        pending
    }

    /// Reject every request whose deadline is at or before `now`.
    ///
    /// Returns the number of requests that timed out.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;

        while let Some(&Reverse((deadline, message_id, generation))) = self.deadlines.peek() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();

            if !self.is_live(message_id, generation) {
                continue;
            }
            if let Some(pending) = self.pending.remove(&message_id) {
                tracing::warn!(
                    "request {} ({} {}) timed out after {:?}",
                    message_id,
                    pending.method,
                    pending.uri,
                    pending.timeout
                );
                pending.settle.reject(Mup1Error::Timeout {
                    message_id,
                    after: pending.timeout,
                });
                expired += 1;
            }
        }

        expired
    }

    /// Cancel a request. Returns false if it was not pending.
    ///
    /// The frame already written is not recalled; a late response is dropped.
    pub fn cancel(&mut self, message_id: u16) -> bool {
        match self.pending.remove(&message_id) {
            Some(pending) => {
                tracing::debug!("request {} cancelled", message_id);
                pending.settle.reject(Mup1Error::Cancelled { message_id });
                true
            }
            None => false,
        }
    }

    /// Reject every outstanding request with `ConnectionLost`.
    pub fn fail_all(&mut self, reason: &str) -> usize {
        self.reject_all(|| Mup1Error::ConnectionLost(reason.to_string()))
    }

    /// Reject every outstanding request with `ConnectionClosed`.
    pub fn close_all(&mut self) -> usize {
        self.reject_all(|| Mup1Error::ConnectionClosed)
    }

    fn reject_all(&mut self, error: impl Fn() -> Mup1Error) -> usize {
        let count = self.pending.len();
        for (message_id, pending) in self.pending.drain() {
            let error = error();
            tracing::debug!("request {} failed: {}", message_id, error);
            pending.settle.reject(error);
        }
        self.deadlines.clear();
        count
    }

    /// Earliest live deadline, for the event loop timer.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(&Reverse((deadline, message_id, generation))) = self.deadlines.peek() {
            if self.is_live(message_id, generation) {
                return Some(deadline);
            }
            self.deadlines.pop();
        }
        None
    }

    fn is_live(&self, message_id: u16, generation: u64) -> bool {
        self.pending
            .get(&message_id)
            .is_some_and(|p| p.generation == generation)
    }

    /// Rebuild the heap once stale entries dominate it.
    fn compact_deadlines(&mut self) {
        if self.deadlines.len() <= 2 * self.pending.len() + 64 {
            return;
        }
        let pending = &self.pending;
        self.deadlines.retain(|Reverse((_, id, generation))| {
            pending.get(id).is_some_and(|p| p.generation == *generation)
        });
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ciborium::Value;
    use std::sync::Arc;
    use tokio::sync::oneshot::error::TryRecvError;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn response(message_id: u16, code: ResponseCode, payload: Option<Payload>) -> CoapMessage {
        CoapMessage {
            message_type: MessageType::Acknowledgement,
            code: code.0,
            message_id,
            token: Bytes::new(),
            options: Vec::new(),
            payload,
        }
    }

    fn send(correlator: &mut Correlator, uri: &str, now: Instant) -> OutboundRequest {
        correlator.send(&Request::get(uri), TIMEOUT, None, now).unwrap()
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let mut correlator = Correlator::new();
        let now = Instant::now();

        assert_eq!(send(&mut correlator, "/a", now).message_id, 1);
        assert_eq!(send(&mut correlator, "/b", now).message_id, 2);
        assert_eq!(correlator.len(), 2);
    }

    #[test]
    fn test_ids_wrap_to_one_and_skip_live() {
        let mut correlator = Correlator::new().starting_at(u16::MAX - 1);
        let now = Instant::now();

        let a = send(&mut correlator, "/a", now);
        let b = send(&mut correlator, "/b", now);
        assert_eq!((a.message_id, b.message_id), (65534, 65535));

        let c = send(&mut correlator, "/c", now);
        assert_eq!(c.message_id, 1);

        // Counter wraps again and must step over the live IDs.
        let mut correlator = correlator.starting_at(65535);
        let d = send(&mut correlator, "/d", now);
        assert_eq!(d.message_id, 2);
    }

    #[test]
    fn test_capacity_refuses_new_ids() {
        let mut correlator = Correlator::with_capacity(2);
        let now = Instant::now();
        let _a = send(&mut correlator, "/a", now);
        let _b = send(&mut correlator, "/b", now);

        let err = correlator
            .send(&Request::get("/c"), TIMEOUT, None, now)
            .unwrap_err();
        assert!(matches!(err, Mup1Error::TooManyOutstanding(2)));
    }

    #[test]
    fn test_frame_carries_coap_request() {
        let mut correlator = Correlator::new();
        let out = send(&mut correlator, "/ietf-interfaces:interfaces", Instant::now());

        let frame = Frame::decode(&out.frame).unwrap();
        assert_eq!(frame.frame_type, crate::protocol::FrameType::CoapRequest);
        let message = CoapMessage::parse(frame.payload()).unwrap();
        assert_eq!(message.message_id, out.message_id);
        assert_eq!(message.uri_path(), vec!["ietf-interfaces:interfaces"]);
    }

    #[test]
    fn test_success_fulfils() {
        let mut correlator = Correlator::new();
        let mut out = send(&mut correlator, "/a", Instant::now());

        let payload = Payload::Cbor(Value::Bool(true));
        let settled = correlator.on_coap_message(response(
            out.message_id,
            ResponseCode::CONTENT,
            Some(payload.clone()),
        ));

        assert_eq!(settled, Some(out.message_id));
        let response = out.response.try_recv().unwrap().unwrap();
        assert_eq!(response.code, ResponseCode::CONTENT);
        assert_eq!(response.payload, Some(payload));
        assert!(correlator.is_empty());
    }

    #[test]
    fn test_deserialize_without_payload() {
        let mut correlator = Correlator::new();
        let mut out = send(&mut correlator, "/a", Instant::now());
        correlator.on_coap_message(response(out.message_id, ResponseCode::CHANGED, None));

        let response = out.response.try_recv().unwrap().unwrap();
        assert!(matches!(
            response.deserialize::<String>(),
            Err(Mup1Error::MissingPayload { message_id }) if message_id == out.message_id
        ));
    }

    #[test]
    fn test_error_class_rejects_with_code_and_payload() {
        let mut correlator = Correlator::new();
        let mut out = send(&mut correlator, "/missing", Instant::now());

        let diagnostic = Payload::Cbor(Value::Text("no such node".into()));
        correlator.on_coap_message(response(
            out.message_id,
            ResponseCode::NOT_FOUND,
            Some(diagnostic.clone()),
        ));

        match out.response.try_recv().unwrap() {
            Err(Mup1Error::DeviceError { code, payload }) => {
                assert_eq!(code, ResponseCode::NOT_FOUND);
                assert_eq!(payload, Some(diagnostic));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_reset_rejects() {
        let mut correlator = Correlator::new();
        let mut out = send(&mut correlator, "/a", Instant::now());

        let mut rst = response(out.message_id, ResponseCode::EMPTY, None);
        rst.message_type = MessageType::Reset;
        assert_eq!(correlator.on_coap_message(rst), Some(out.message_id));

        assert!(matches!(
            out.response.try_recv().unwrap(),
            Err(Mup1Error::Reset { .. })
        ));
    }

    #[test]
    fn test_empty_ack_does_not_settle() {
        let mut correlator = Correlator::new();
        let mut out = send(&mut correlator, "/a", Instant::now());

        let ack = response(out.message_id, ResponseCode::EMPTY, None);
        assert_eq!(correlator.on_coap_message(ack), None);
        assert_eq!(out.response.try_recv().unwrap_err(), TryRecvError::Empty);
        assert!(correlator.is_pending(out.message_id));
    }

    #[test]
    fn test_stray_response_dropped() {
        let mut correlator = Correlator::new();
        assert_eq!(
            correlator.on_coap_message(response(999, ResponseCode::CONTENT, None)),
            None
        );
    }

    #[test]
    fn test_reverse_order_settles_each_request() {
        let mut correlator = Correlator::new();
        let now = Instant::now();
        let mut requests: Vec<_> = (0..5).map(|i| send(&mut correlator, &format!("/{}", i), now)).collect();

        for (i, out) in requests.iter().enumerate().rev() {
            let payload = Payload::Cbor(Value::Integer((i as u64).into()));
            correlator.on_coap_message(response(out.message_id, ResponseCode::CONTENT, Some(payload)));
        }

        for (i, out) in requests.iter_mut().enumerate() {
            let response = out.response.try_recv().unwrap().unwrap();
            assert_eq!(response.message_id, out.message_id);
            assert_eq!(
                response.payload,
                Some(Payload::Cbor(Value::Integer((i as u64).into())))
            );
        }
    }

    #[test]
    fn test_expire_only_elapsed_and_late_response_dropped() {
        let mut correlator = Correlator::new();
        let now = Instant::now();

        let mut short = correlator
            .send(&Request::get("/short"), Duration::from_millis(50), None, now)
            .unwrap();
        let mut long = send(&mut correlator, "/long", now);

        assert_eq!(correlator.next_deadline(), Some(now + Duration::from_millis(50)));
        assert_eq!(correlator.expire(now + Duration::from_millis(49)), 0);
        assert_eq!(correlator.expire(now + Duration::from_millis(50)), 1);

        assert!(matches!(
            short.response.try_recv().unwrap(),
            Err(Mup1Error::Timeout { after, .. }) if after == Duration::from_millis(50)
        ));
        assert_eq!(long.response.try_recv().unwrap_err(), TryRecvError::Empty);

        // Late answer to the expired request finds nothing.
        assert_eq!(
            correlator.on_coap_message(response(short.message_id, ResponseCode::CONTENT, None)),
            None
        );
        assert_eq!(correlator.next_deadline(), Some(now + TIMEOUT));
    }

    #[test]
    fn test_unrepresentable_timeout_never_expires() {
        let mut correlator = Correlator::new();
        let now = Instant::now();

        let mut out = correlator
            .send(&Request::get("/forever"), Duration::MAX, None, now)
            .unwrap();

        let deadline = correlator.next_deadline().unwrap();
        assert!(deadline > now + Duration::from_secs(86_400 * 365));
        assert_eq!(correlator.expire(now + Duration::from_secs(86_400 * 365)), 0);
        assert_eq!(out.response.try_recv().unwrap_err(), TryRecvError::Empty);

        correlator.on_coap_message(response(out.message_id, ResponseCode::CONTENT, None));
        assert!(out.response.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_settled_request_leaves_no_live_deadline() {
        let mut correlator = Correlator::new();
        let now = Instant::now();
        let out = send(&mut correlator, "/a", now);

        correlator.on_coap_message(response(out.message_id, ResponseCode::CHANGED, None));

        assert_eq!(correlator.next_deadline(), None);
        assert_eq!(correlator.expire(now + TIMEOUT), 0);
    }

    #[test]
    fn test_reused_id_keeps_its_own_deadline() {
        let mut correlator = Correlator::with_capacity(1);
        let now = Instant::now();

        let first = send(&mut correlator, "/a", now);
        correlator.on_coap_message(response(first.message_id, ResponseCode::CONTENT, None));

        let mut correlator = correlator.starting_at(first.message_id);
        let mut second = correlator
            .send(&Request::get("/b"), Duration::from_secs(60), None, now)
            .unwrap();
        assert_eq!(second.message_id, first.message_id);

        // The first request's deadline must not expire the second.
        assert_eq!(correlator.expire(now + TIMEOUT), 0);
        assert_eq!(second.response.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[test]
    fn test_cancel() {
        let mut correlator = Correlator::new();
        let mut out = send(&mut correlator, "/a", Instant::now());

        assert!(correlator.cancel(out.message_id));
        assert!(!correlator.cancel(out.message_id));
        assert!(matches!(
            out.response.try_recv().unwrap(),
            Err(Mup1Error::Cancelled { message_id }) if message_id == out.message_id
        ));
    }

    #[test]
    fn test_fail_all() {
        let mut correlator = Correlator::new();
        let now = Instant::now();
        let mut a = send(&mut correlator, "/a", now);
        let mut b = send(&mut correlator, "/b", now);

        assert_eq!(correlator.fail_all("serial port unplugged"), 2);
        for out in [&mut a, &mut b] {
            assert!(matches!(
                out.response.try_recv().unwrap(),
                Err(Mup1Error::ConnectionLost(ref reason)) if reason == "serial port unplugged"
            ));
        }
        assert!(correlator.is_empty());
        assert_eq!(correlator.next_deadline(), None);
    }

    #[test]
    fn test_permit_released_on_settlement() {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(1));
        let permit = semaphore.clone().try_acquire_owned().unwrap();

        let mut correlator = Correlator::new();
        let out = correlator
            .send(&Request::get("/a"), TIMEOUT, Some(permit), Instant::now())
            .unwrap();
        assert_eq!(semaphore.available_permits(), 0);

        correlator.cancel(out.message_id);
        assert_eq!(semaphore.available_permits(), 1);
    }

    #[test]
    fn test_stale_deadlines_are_compacted() {
        let mut correlator = Correlator::new();
        let now = Instant::now();

        for _ in 0..500 {
            let out = send(&mut correlator, "/a", now);
            correlator.on_coap_message(response(out.message_id, ResponseCode::CONTENT, None));
        }
        assert!(correlator.deadlines.len() <= 66);
    }
}
