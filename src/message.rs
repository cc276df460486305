//! Request/Response message model.
//!
//! Outgoing messages ([`Request`], [`Response`]) are plain mutable values:
//! set properties, body and flags freely, then hand them to the connection.
//! Sending consumes the value, which is what freezes it; there is no
//! runtime "is mutable" state to check.
//!
//! Incoming messages ([`IncomingRequest`], [`IncomingResponse`]) are
//! read-only views produced by the demultiplexer once reassembly completes.
//!
//! A [`ResponseHandle`] is the not-yet-complete response returned by
//! `Connection::send`; a [`ReplyContext`] is the exactly-once token a
//! handler uses to answer an incoming request (or defer the answer).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::{FramewireError, Result};
use crate::properties::{self, Properties};
use crate::protocol::FrameKind;
use crate::writer::{OutgoingMessage, WriterHandle};

/// Error-Domain value for errors generated by this crate.
pub const ERROR_DOMAIN_FRAMEWIRE: &str = "framewire";

/// Well-known error codes carried in the `Error-Code` property of error
/// responses.
pub mod error_codes {
    /// The request was malformed.
    pub const BAD_REQUEST: u16 = 400;
    /// The peer refused the request.
    pub const FORBIDDEN: u16 = 403;
    /// No handler matched the request.
    pub const NOT_FOUND: u16 = 404;
    /// A range/parameter was out of bounds.
    pub const BAD_RANGE: u16 = 416;
    /// A handler failed while producing the response.
    pub const HANDLER_FAILED: u16 = 501;
    /// The receiver is over its incoming-message capacity.
    pub const BUSY: u16 = 503;
    /// The peer sent no detailed error information.
    pub const UNSPECIFIED: u16 = 599;
}

/// An outgoing request, mutable until sent.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub(crate) properties: Properties,
    pub(crate) body: Vec<u8>,
    pub(crate) compressed: bool,
    pub(crate) urgent: bool,
    pub(crate) no_reply: bool,
}

impl Request {
    /// Create an empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a request with a body.
    pub fn with_body(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    /// The request's properties.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Mutable access to the properties.
    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    /// Set the `Profile` property, which by convention identifies the
    /// purpose of the request.
    pub fn set_profile(&mut self, profile: impl Into<String>) -> &mut Self {
        self.properties.set(properties::PROFILE, profile);
        self
    }

    /// Set the `Content-Type` property.
    pub fn set_content_type(&mut self, content_type: impl Into<String>) -> &mut Self {
        self.properties.set(properties::CONTENT_TYPE, content_type);
        self
    }

    /// Replace the body.
    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) -> &mut Self {
        self.body = body.into();
        self
    }

    /// Append data to the body.
    pub fn append_body(&mut self, data: &[u8]) -> &mut Self {
        self.body.extend_from_slice(data);
        self
    }

    /// Compress the body with gzip before framing.
    pub fn set_compressed(&mut self, compressed: bool) -> &mut Self {
        self.compressed = compressed;
        self
    }

    /// Schedule this request on the urgent lane.
    pub fn set_urgent(&mut self, urgent: bool) -> &mut Self {
        self.urgent = urgent;
        self
    }

    /// Mark that no response is expected; the peer will not allocate a
    /// response slot at all.
    pub fn set_no_reply(&mut self, no_reply: bool) -> &mut Self {
        self.no_reply = no_reply;
        self
    }
}

/// An outgoing response, mutable until sent through a [`ReplyContext`].
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub(crate) properties: Properties,
    pub(crate) body: Vec<u8>,
    pub(crate) compressed: bool,
    pub(crate) urgent: bool,
    pub(crate) is_error: bool,
}

impl Response {
    /// Create an empty success response.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a success response with a body.
    pub fn with_body(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    /// Create an error response carrying `Error-Code`/`Error-Domain`
    /// properties and the message as body.
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        let mut response = Self::new();
        response.properties.set(properties::ERROR_CODE, code.to_string());
        response
            .properties
            .set(properties::ERROR_DOMAIN, ERROR_DOMAIN_FRAMEWIRE);
        response.body = message.into().into_bytes();
        response.is_error = true;
        response
    }

    /// The response's properties.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Mutable access to the properties.
    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    /// Replace the body.
    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) -> &mut Self {
        self.body = body.into();
        self
    }

    /// Compress the body with gzip before framing.
    pub fn set_compressed(&mut self, compressed: bool) -> &mut Self {
        self.compressed = compressed;
        self
    }

    /// Schedule this response on the urgent lane. Responses to urgent
    /// requests ride the urgent lane regardless.
    pub fn set_urgent(&mut self, urgent: bool) -> &mut Self {
        self.urgent = urgent;
        self
    }

    /// Whether this is an error response.
    pub fn is_error(&self) -> bool {
        self.is_error
    }
}

/// A completely received request, read-only.
#[derive(Debug)]
pub struct IncomingRequest {
    pub(crate) number: u32,
    pub(crate) properties: Properties,
    pub(crate) body: Bytes,
    pub(crate) compressed: bool,
    pub(crate) urgent: bool,
    pub(crate) no_reply: bool,
}

impl IncomingRequest {
    /// The request's serial number on this connection.
    pub fn number(&self) -> u32 {
        self.number
    }

    /// The request's properties.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Shortcut for the `Profile` property.
    pub fn profile(&self) -> Option<&str> {
        self.properties.get(properties::PROFILE)
    }

    /// Shortcut for the `Content-Type` property.
    pub fn content_type(&self) -> Option<&str> {
        self.properties.get(properties::CONTENT_TYPE)
    }

    /// The reassembled (and decompressed) body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The body as UTF-8 text.
    pub fn body_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.body)
            .map_err(|_| FramewireError::BadData("body is not UTF-8".to_string()))
    }

    /// Whether the body arrived compressed.
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Whether the sender marked the request urgent.
    pub fn is_urgent(&self) -> bool {
        self.urgent
    }

    /// Whether the sender expects no reply.
    pub fn is_no_reply(&self) -> bool {
        self.no_reply
    }
}

/// The error carried by an incoming error response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseError {
    /// Numeric code from the `Error-Code` property; `UNSPECIFIED` (599)
    /// when the peer sent none.
    pub code: u16,
    /// Domain from the `Error-Domain` property.
    pub domain: String,
    /// Human-readable message (the response body).
    pub message: String,
}

impl ResponseError {
    pub(crate) fn from_wire(props: &Properties, body: &[u8]) -> Self {
        let code = props
            .get(properties::ERROR_CODE)
            .and_then(|v| v.parse().ok())
            .unwrap_or(error_codes::UNSPECIFIED);
        let domain = props
            .get(properties::ERROR_DOMAIN)
            .unwrap_or(ERROR_DOMAIN_FRAMEWIRE)
            .to_string();
        Self {
            code,
            domain,
            message: String::from_utf8_lossy(body).into_owned(),
        }
    }
}

impl std::fmt::Display for ResponseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} error {}: {}", self.domain, self.code, self.message)
    }
}

/// A completely received response, read-only.
#[derive(Debug)]
pub struct IncomingResponse {
    pub(crate) number: u32,
    pub(crate) properties: Properties,
    pub(crate) body: Bytes,
    pub(crate) error: Option<ResponseError>,
}

impl IncomingResponse {
    /// The number of the request this response answers.
    pub fn number(&self) -> u32 {
        self.number
    }

    /// The response's properties.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// The reassembled (and decompressed) body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The body as UTF-8 text.
    pub fn body_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.body)
            .map_err(|_| FramewireError::BadData("body is not UTF-8".to_string()))
    }

    /// Whether the peer answered with an error.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The error, if the peer answered with one.
    pub fn error(&self) -> Option<&ResponseError> {
        self.error.as_ref()
    }
}

/// The pending response returned by `Connection::send`.
///
/// Await [`ResponseHandle::response`] to receive the peer's answer. The
/// handle resolves with [`FramewireError::Disconnected`] if the connection
/// closes first; a pending response is never left hanging.
pub struct ResponseHandle {
    number: u32,
    rx: oneshot::Receiver<Result<IncomingResponse>>,
}

impl ResponseHandle {
    pub(crate) fn new(number: u32, rx: oneshot::Receiver<Result<IncomingResponse>>) -> Self {
        Self { number, rx }
    }

    /// The number assigned to the request.
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Wait for the response.
    pub async fn response(self) -> Result<IncomingResponse> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(FramewireError::Disconnected),
        }
    }
}

/// Exactly-once reply token for an incoming request.
///
/// Handlers receive one alongside the request. Clones share the same
/// respond-once slot, so a handler may clone the context, return
/// [`Outcome::Deferred`](crate::dispatcher::Outcome::Deferred), and answer
/// later from elsewhere. If no one responds and nothing was deferred, the
/// framework sends an implicit empty success response.
#[derive(Clone)]
pub struct ReplyContext {
    number: u32,
    request_urgent: bool,
    no_reply: bool,
    responded: Arc<AtomicBool>,
    writer: Option<WriterHandle>,
    max_frame_payload: usize,
    max_properties_size: usize,
}

impl ReplyContext {
    pub(crate) fn new(
        number: u32,
        request_urgent: bool,
        no_reply: bool,
        writer: WriterHandle,
        max_frame_payload: usize,
        max_properties_size: usize,
    ) -> Self {
        Self {
            number,
            request_urgent,
            no_reply,
            responded: Arc::new(AtomicBool::new(false)),
            writer: Some(writer),
            max_frame_payload,
            max_properties_size,
        }
    }

    /// A context without a writer, for exercising handlers in isolation.
    #[cfg(test)]
    pub(crate) fn detached(number: u32, no_reply: bool) -> Self {
        Self {
            number,
            request_urgent: false,
            no_reply,
            responded: Arc::new(AtomicBool::new(false)),
            writer: None,
            max_frame_payload: crate::protocol::DEFAULT_MAX_FRAME_PAYLOAD,
            max_properties_size: crate::protocol::DEFAULT_MAX_FRAME_PAYLOAD,
        }
    }

    /// The number of the request being answered.
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Whether the request was sent with noReply (no response slot exists).
    pub fn is_no_reply(&self) -> bool {
        self.no_reply
    }

    /// Whether a response has already been sent through this context or a
    /// clone of it.
    pub fn has_responded(&self) -> bool {
        self.responded.load(Ordering::Acquire)
    }

    /// Send the response for this request.
    ///
    /// Fails with [`FramewireError::NoReplyExpected`] if the request was
    /// sent noReply, and [`FramewireError::AlreadyResponded`] on a second
    /// call.
    pub async fn respond(&self, response: Response) -> Result<()> {
        if self.no_reply {
            return Err(FramewireError::NoReplyExpected);
        }
        if self.responded.swap(true, Ordering::AcqRel) {
            return Err(FramewireError::AlreadyResponded);
        }

        let result = self.send_response(response).await;
        if result.is_err() {
            // The slot was not consumed; allow a later error response.
            self.responded.store(false, Ordering::Release);
        }
        result
    }

    /// Send an error response with the given code and message.
    pub async fn respond_error(&self, code: u16, message: impl Into<String>) -> Result<()> {
        self.respond(Response::error(code, message)).await
    }

    /// Send the implicit empty success response, unless one was already
    /// sent or the request expects no reply. No-op in those cases.
    pub async fn respond_default(&self) -> Result<()> {
        if self.no_reply || self.has_responded() {
            return Ok(());
        }
        match self.respond(Response::new()).await {
            Err(FramewireError::AlreadyResponded) => Ok(()),
            other => other,
        }
    }

    async fn send_response(&self, response: Response) -> Result<()> {
        let writer = match &self.writer {
            Some(w) => w,
            None => return Ok(()),
        };

        let kind = if response.is_error {
            FrameKind::Error
        } else {
            FrameKind::Reply
        };
        // Responses to urgent requests inherit the urgent lane.
        let urgent = response.urgent || self.request_urgent;

        let msg = OutgoingMessage::encode(
            self.number,
            kind,
            &response.properties,
            response.body,
            response.compressed,
            urgent,
            false,
            self.max_frame_payload,
            self.max_properties_size,
        )?;
        writer.enqueue(msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder_style() {
        let mut request = Request::with_body(b"payload".to_vec());
        request
            .set_profile("chat")
            .set_content_type("text/plain; charset=UTF-8")
            .set_urgent(true)
            .set_no_reply(true);

        assert_eq!(request.properties().get("Profile"), Some("chat"));
        assert!(request.urgent);
        assert!(request.no_reply);
        assert_eq!(request.body, b"payload");
    }

    #[test]
    fn test_request_append_body() {
        let mut request = Request::new();
        request.append_body(b"hello ");
        request.append_body(b"world");
        assert_eq!(request.body, b"hello world");
    }

    #[test]
    fn test_error_response_carries_code_and_domain() {
        let response = Response::error(error_codes::NOT_FOUND, "no such profile");
        assert!(response.is_error());
        assert_eq!(response.properties().get("Error-Code"), Some("404"));
        assert_eq!(
            response.properties().get("Error-Domain"),
            Some(ERROR_DOMAIN_FRAMEWIRE)
        );
        assert_eq!(response.body, b"no such profile");
    }

    #[test]
    fn test_response_error_from_wire() {
        let mut props = Properties::new();
        props.set("Error-Code", "403");
        props.set("Error-Domain", "app");
        let error = ResponseError::from_wire(&props, b"denied");

        assert_eq!(error.code, 403);
        assert_eq!(error.domain, "app");
        assert_eq!(error.message, "denied");
    }

    #[test]
    fn test_response_error_without_code_is_unspecified() {
        let error = ResponseError::from_wire(&Properties::new(), b"");
        assert_eq!(error.code, error_codes::UNSPECIFIED);
    }

    #[tokio::test]
    async fn test_reply_context_responds_once() {
        let ctx = ReplyContext::detached(1, false);

        assert!(!ctx.has_responded());
        ctx.respond(Response::new()).await.unwrap();
        assert!(ctx.has_responded());

        let second = ctx.respond(Response::new()).await;
        assert!(matches!(second, Err(FramewireError::AlreadyResponded)));
    }

    #[tokio::test]
    async fn test_reply_context_no_reply() {
        let ctx = ReplyContext::detached(1, true);

        let result = ctx.respond(Response::new()).await;
        assert!(matches!(result, Err(FramewireError::NoReplyExpected)));

        // The implicit default is a silent no-op for noReply requests.
        ctx.respond_default().await.unwrap();
        assert!(!ctx.has_responded());
    }

    #[tokio::test]
    async fn test_reply_context_clone_shares_slot() {
        let ctx = ReplyContext::detached(1, false);
        let clone = ctx.clone();

        ctx.respond(Response::new()).await.unwrap();
        let result = clone.respond(Response::new()).await;
        assert!(matches!(result, Err(FramewireError::AlreadyResponded)));
    }

    #[tokio::test]
    async fn test_respond_default_after_respond_is_noop() {
        let ctx = ReplyContext::detached(1, false);
        ctx.respond(Response::with_body(b"real".to_vec()))
            .await
            .unwrap();
        ctx.respond_default().await.unwrap();
    }

    #[test]
    fn test_incoming_request_accessors() {
        let mut props = Properties::new();
        props.set("Profile", "sync");
        let request = IncomingRequest {
            number: 9,
            properties: props,
            body: Bytes::from_static(b"text body"),
            compressed: false,
            urgent: true,
            no_reply: false,
        };

        assert_eq!(request.number(), 9);
        assert_eq!(request.profile(), Some("sync"));
        assert_eq!(request.body_str().unwrap(), "text body");
        assert!(request.is_urgent());
    }

    #[test]
    fn test_body_str_rejects_non_utf8() {
        let request = IncomingRequest {
            number: 1,
            properties: Properties::new(),
            body: Bytes::from_static(&[0xFF, 0xFE]),
            compressed: false,
            urgent: false,
            no_reply: false,
        };
        assert!(matches!(
            request.body_str(),
            Err(FramewireError::BadData(_))
        ));
    }
}
