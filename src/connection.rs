//! Per-connection I/O runtime
//!
//! Each open connection owns a transport, a monotonically increasing
//! message-id allocator, and a registry of response acceptors keyed by
//! message id. In the default (threaded) mode a dedicated reader task owns
//! the inbound half of the stream: it frames BER messages, decodes them and
//! routes them to the acceptor registered for their message id. Writers are
//! many; the send lock covers only encode+write.
//!
//! Synchronous mode collapses reader and sender into the calling thread:
//! one operation at a time, no background resources.

use crate::error::{DisconnectReason, Error, LdapError};
use crate::filter::AttributeValueAssertion;
use crate::ldap::*;
use crate::options::ConnectionOptions;
use crate::referral::{self, LdapUrl};
use crate::sasl::{SaslMechanism, SaslStep};
use crate::stream::{ConnectionStream, StreamConnector, TcpConnector};
use asn1_rs::nom::Err as NomErr;
use asn1_rs::{FromBer, Header};
use log::{debug, warn};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Open,
    Closed(DisconnectReason),
}

/// What a response acceptor receives
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    Message(LdapMessage),
    Disconnected(DisconnectReason),
}

/// Callback shape used by asynchronous callers; invoked on the reader thread
pub type ResponseListener = Arc<dyn Fn(ResponseEvent) + Send + Sync>;

/// Handler for unsolicited notifications (extended responses with message
/// id zero)
pub type UnsolicitedNotificationHandler = Arc<dyn Fn(&ExtendedResponse) + Send + Sync>;

/// Handler invoked once when the connection leaves the `Open` state
pub type DisconnectHandler = Arc<dyn Fn(&DisconnectReason) + Send + Sync>;

/// Builds a replacement connection when chasing a referral
pub type ReferralConnector =
    Arc<dyn Fn(&LdapUrl) -> Result<LdapConnection, Error> + Send + Sync>;

#[derive(Clone)]
enum Acceptor {
    Queue(Sender<ResponseEvent>),
    Listener(ResponseListener),
}

impl Acceptor {
    fn deliver(&self, event: ResponseEvent) {
        match self {
            // a dropped receiver means the caller gave up (timeout); fine
            Acceptor::Queue(tx) => {
                let _ = tx.send(event);
            }
            Acceptor::Listener(listener) => listener(event),
        }
    }
}

enum Transport {
    Closed,
    Threaded {
        writer: Box<dyn Write + Send>,
        shutdown: Box<dyn Fn() + Send + Sync>,
    },
    Synchronous {
        stream: Box<dyn ConnectionStream>,
        frame: FrameBuffer,
    },
}

/// Accumulated inbound bytes plus the absolute stream offset, for decode
/// error reporting
struct FrameBuffer {
    buf: Vec<u8>,
    offset: u64,
}

impl FrameBuffer {
    fn new() -> Self {
        FrameBuffer {
            buf: Vec::with_capacity(4096),
            offset: 0,
        }
    }
}

struct Shared {
    id: u64,
    host: String,
    port: u16,
    options: ConnectionOptions,
    connector: Arc<dyn StreamConnector>,
    post_connect: Vec<Arc<dyn PostConnectProcessor>>,
    next_message_id: AtomicU32,
    generation: AtomicU64,
    state: Mutex<ConnectionState>,
    transport: Mutex<Transport>,
    acceptors: Mutex<HashMap<u32, Acceptor>>,
    sync_in_flight: AtomicBool,
    connect_guard: Mutex<()>,
    unsolicited_handler: Mutex<Option<UnsolicitedNotificationHandler>>,
    disconnect_handler: Mutex<Option<DisconnectHandler>>,
    referral_connector: Mutex<Option<ReferralConnector>>,
}

/// A client connection to one directory server
pub struct LdapConnection {
    shared: Arc<Shared>,
}

impl Drop for LdapConnection {
    fn drop(&mut self) {
        // releases the socket and stops the reader task; a no-op when the
        // connection is already closed
        self.close();
    }
}

impl std::fmt::Debug for LdapConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapConnection")
            .field("id", &self.shared.id)
            .field("host", &self.shared.host)
            .field("port", &self.shared.port)
            .field("state", &self.state())
            .finish()
    }
}

/// Result of a non-search operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    pub result: LdapResult,
    pub controls: Vec<Control>,
}

impl OperationResult {
    pub fn result_code(&self) -> ResultCode {
        self.result.result_code
    }
}

/// Result of a bind operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindResult {
    pub result: LdapResult,
    pub server_sasl_creds: Option<Vec<u8>>,
    pub controls: Vec<Control>,
}

/// Result of a compare operation; TRUE/FALSE are its success codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareResult {
    pub result: LdapResult,
    pub controls: Vec<Control>,
}

impl CompareResult {
    /// `Some(true)` for compareTrue, `Some(false)` for compareFalse,
    /// `None` for anything else
    pub fn value(&self) -> Option<bool> {
        match self.result.result_code {
            ResultCode::CompareTrue => Some(true),
            ResultCode::CompareFalse => Some(false),
            _ => None,
        }
    }
}

/// Result of an extended operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedResult {
    pub result: LdapResult,
    pub response_name: Option<LdapOID>,
    pub response_value: Option<Vec<u8>>,
    /// Intermediate responses received ahead of the terminal response
    pub intermediate_responses: Vec<IntermediateResponse>,
    pub controls: Vec<Control>,
}

/// Collected result of a search operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    pub result: LdapResult,
    pub entries: Vec<SearchResultEntry>,
    pub references: Vec<Vec<LdapString>>,
    pub controls: Vec<Control>,
}

/// Streaming consumer for search responses. Entries arrive in server order;
/// a blocking implementation slows the reader for the whole connection.
pub trait SearchResultListener: Send + Sync {
    fn entry_received(&self, entry: SearchResultEntry);
    fn reference_received(&self, reference: Vec<LdapString>);
}

/// Context handed to post-connect processors
pub struct ConnectContext<'a> {
    pub host: &'a str,
    pub port: u16,
    pub options: &'a ConnectionOptions,
    next_message_id: &'a AtomicU32,
}

impl ConnectContext<'_> {
    pub fn next_message_id(&self) -> MessageID {
        MessageID(self.next_message_id.fetch_add(1, Ordering::SeqCst))
    }
}

/// Runs immediately after the transport is connected, before any bind and
/// before the reader task starts. May replace the stream, e.g. to wrap it
/// in TLS after a StartTLS exchange.
pub trait PostConnectProcessor: Send + Sync {
    fn process(
        &self,
        stream: Box<dyn ConnectionStream>,
        ctx: &ConnectContext<'_>,
    ) -> Result<Box<dyn ConnectionStream>, Error>;
}

impl LdapConnection {
    /// Connect over plain TCP with default options
    pub fn connect(host: &str, port: u16) -> Result<Self, Error> {
        Self::connect_with_options(host, port, ConnectionOptions::default())
    }

    /// Connect over plain TCP
    pub fn connect_with_options(
        host: &str,
        port: u16,
        options: ConnectionOptions,
    ) -> Result<Self, Error> {
        Self::connect_with(Arc::new(TcpConnector), host, port, options, Vec::new())
    }

    /// Connect through an explicit stream connector and post-connect chain
    pub fn connect_with(
        connector: Arc<dyn StreamConnector>,
        host: &str,
        port: u16,
        options: ConnectionOptions,
        post_connect: Vec<Arc<dyn PostConnectProcessor>>,
    ) -> Result<Self, Error> {
        let shared = Arc::new(Shared {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            host: host.to_string(),
            port,
            options,
            connector,
            post_connect,
            next_message_id: AtomicU32::new(1),
            generation: AtomicU64::new(0),
            state: Mutex::new(ConnectionState::Unconnected),
            transport: Mutex::new(Transport::Closed),
            acceptors: Mutex::new(HashMap::new()),
            sync_in_flight: AtomicBool::new(false),
            connect_guard: Mutex::new(()),
            unsolicited_handler: Mutex::new(None),
            disconnect_handler: Mutex::new(None),
            referral_connector: Mutex::new(None),
        });
        Shared::establish(&shared)?;
        Ok(LdapConnection { shared })
    }

    pub fn host(&self) -> &str {
        &self.shared.host
    }

    pub fn port(&self) -> u16 {
        self.shared.port
    }

    /// Unique local id of this connection
    pub fn connection_id(&self) -> u64 {
        self.shared.id
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.shared.options
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.lock().unwrap().clone()
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state(), ConnectionState::Open)
    }

    /// Install the handler for unsolicited notifications (message id 0)
    pub fn set_unsolicited_notification_handler(&self, handler: UnsolicitedNotificationHandler) {
        *self.shared.unsolicited_handler.lock().unwrap() = Some(handler);
    }

    /// Install the handler invoked once per disconnect
    pub fn set_disconnect_handler(&self, handler: DisconnectHandler) {
        *self.shared.disconnect_handler.lock().unwrap() = Some(handler);
    }

    /// Install the connector used to build connections while chasing
    /// referrals; the default reconnects with this connection's settings
    pub fn set_referral_connector(&self, connector: ReferralConnector) {
        *self.shared.referral_connector.lock().unwrap() = Some(connector);
    }

    // ----------------------- operations -----------------------

    /// Simple bind (RFC 4513 5.1)
    pub fn simple_bind(&self, dn: &str, password: &str) -> Result<BindResult, Error> {
        if self.shared.options.bind_dn_requires_password && !dn.is_empty() && password.is_empty() {
            return Err(Error::local(
                "simple bind with a non-empty DN requires a password",
            ));
        }
        let op = ProtocolOp::BindRequest(BindRequest {
            version: 3,
            name: LdapDN(dn.to_string()),
            authentication: AuthenticationChoice::Simple(password.as_bytes().to_vec()),
        });
        let msg = self.single_response(op, None, None)?;
        into_bind_result(msg)
    }

    /// SASL bind: drives the mechanism's challenge/response loop over
    /// repeated bind requests until the server leaves saslBindInProgress
    pub fn sasl_bind(
        &self,
        dn: &str,
        mechanism: &mut dyn SaslMechanism,
    ) -> Result<BindResult, Error> {
        let mut challenge: Option<Vec<u8>> = None;
        loop {
            let credentials = match mechanism.step(challenge.as_deref())? {
                SaslStep::Respond(bytes) => Some(bytes),
                SaslStep::Complete => None,
            };
            let op = ProtocolOp::BindRequest(BindRequest {
                version: 3,
                name: LdapDN(dn.to_string()),
                authentication: AuthenticationChoice::Sasl(SaslCredentials {
                    mechanism: LdapString(mechanism.name().to_string()),
                    credentials,
                }),
            });
            let msg = self.single_response(op, None, None)?;
            let bind = into_bind_result(msg)?;
            if bind.result.result_code != ResultCode::SaslBindInProgress {
                return Ok(bind);
            }
            challenge = Some(bind.server_sasl_creds.clone().unwrap_or_default());
        }
    }

    /// Search, collecting every entry and reference
    pub fn search(&self, request: &SearchRequest) -> Result<SearchResult, Error> {
        self.search_inner(request, 0)
    }

    fn search_inner(&self, request: &SearchRequest, depth: u32) -> Result<SearchResult, Error> {
        let messages =
            self.request(ProtocolOp::SearchRequest(request.clone()), None, None)?;
        let mut entries = Vec::new();
        let mut references = Vec::new();
        let mut done = None;
        for msg in messages {
            let controls = msg.controls.unwrap_or_default();
            match msg.protocol_op {
                ProtocolOp::SearchResultEntry(entry) => entries.push(entry),
                ProtocolOp::SearchResultReference(uris) => references.push(uris),
                ProtocolOp::SearchResultDone(result) => {
                    done = Some(SearchResult {
                        result,
                        entries: std::mem::take(&mut entries),
                        references: std::mem::take(&mut references),
                        controls,
                    })
                }
                other => return Err(unexpected_response(&other)),
            }
        }
        let outcome = done.ok_or_else(|| {
            Error::ServerDown(DisconnectReason::ServerClosedWithoutNotice)
        })?;
        if outcome.result.result_code == ResultCode::Referral
            && self.shared.options.follow_referrals
        {
            return Ok(self.follow_search_referral(request, outcome, depth));
        }
        Ok(outcome)
    }

    fn follow_search_referral(
        &self,
        request: &SearchRequest,
        outcome: SearchResult,
        depth: u32,
    ) -> SearchResult {
        let urls = match &outcome.result.referral {
            Some(urls) => urls.clone(),
            None => return outcome,
        };
        match referral::follow(self, &urls, depth, |conn, url, next_depth| {
            let mut rebuilt = request.clone();
            if !url.base_dn.is_empty() {
                rebuilt.base_object = LdapDN(url.base_dn.clone());
            }
            conn.search_inner(&rebuilt, next_depth)
        }) {
            referral::FollowOutcome::Followed(result) => result,
            referral::FollowOutcome::HopLimit => {
                let mut limited = outcome;
                limited.result.result_code = ResultCode::ReferralLimitExceeded;
                limited
            }
            referral::FollowOutcome::NotFollowed => outcome,
        }
    }

    /// Search, streaming entries to `listener` as they arrive
    pub fn search_with_listener(
        &self,
        request: &SearchRequest,
        listener: Arc<dyn SearchResultListener>,
    ) -> Result<SearchResult, Error> {
        if self.shared.options.use_synchronous_mode {
            // no reader thread to stream from: collect, then replay in order
            let collected = self.search(request)?;
            for entry in &collected.entries {
                listener.entry_received(entry.clone());
            }
            for reference in &collected.references {
                listener.reference_received(reference.clone());
            }
            return Ok(collected);
        }

        let (tx, rx) = mpsc::channel::<Result<LdapMessage, DisconnectReason>>();
        let tx = Mutex::new(tx);
        let stream_listener = Arc::clone(&listener);
        let acceptor: ResponseListener = Arc::new(move |event| match event {
            ResponseEvent::Message(msg) => match msg.protocol_op {
                ProtocolOp::SearchResultEntry(entry) => stream_listener.entry_received(entry),
                ProtocolOp::SearchResultReference(uris) => {
                    stream_listener.reference_received(uris)
                }
                _ => {
                    let _ = tx.lock().unwrap().send(Ok(msg));
                }
            },
            ResponseEvent::Disconnected(reason) => {
                let _ = tx.lock().unwrap().send(Err(reason));
            }
        });
        let id = self.send_with_acceptor(
            ProtocolOp::SearchRequest(request.clone()),
            None,
            Acceptor::Listener(acceptor),
        )?;
        let timeout = self.shared.options.response_timeout;
        match rx.recv_timeout(timeout) {
            Ok(Ok(msg)) => match msg.protocol_op {
                ProtocolOp::SearchResultDone(result) => Ok(SearchResult {
                    result,
                    entries: Vec::new(),
                    references: Vec::new(),
                    controls: msg.controls.unwrap_or_default(),
                }),
                other => Err(unexpected_response(&other)),
            },
            Ok(Err(reason)) => Err(Error::ServerDown(reason)),
            Err(RecvTimeoutError::Timeout) => {
                self.shared.acceptors.lock().unwrap().remove(&id.0);
                Err(Error::Timeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::ServerDown(DisconnectReason::Other))
            }
        }
    }

    /// Compare an attribute value assertion against an entry
    pub fn compare(&self, dn: &str, attribute: &str, value: &[u8]) -> Result<CompareResult, Error> {
        let op = ProtocolOp::CompareRequest(CompareRequest {
            entry: LdapDN(dn.to_string()),
            ava: AttributeValueAssertion::new(attribute, value),
        });
        let msg = self.single_response(op, None, None)?;
        let controls = msg.controls.unwrap_or_default();
        match msg.protocol_op {
            ProtocolOp::CompareResponse(result) => Ok(CompareResult { result, controls }),
            other => Err(unexpected_response(&other)),
        }
    }

    /// Add an entry
    pub fn add(&self, request: &AddRequest) -> Result<OperationResult, Error> {
        self.result_operation(ProtocolOp::AddRequest(request.clone()), 0)
    }

    /// Add a directory entry
    pub fn add_entry(&self, entry: &crate::entry::Entry) -> Result<OperationResult, Error> {
        self.add(&AddRequest {
            entry: LdapDN(entry.dn().to_string()),
            attributes: entry.into(),
        })
    }

    /// Delete an entry by DN
    pub fn delete(&self, dn: &str) -> Result<OperationResult, Error> {
        self.result_operation(ProtocolOp::DelRequest(LdapDN(dn.to_string())), 0)
    }

    /// Apply an ordered list of modifications
    pub fn modify(&self, request: &ModifyRequest) -> Result<OperationResult, Error> {
        self.result_operation(ProtocolOp::ModifyRequest(request.clone()), 0)
    }

    /// Rename and/or move an entry
    pub fn modify_dn(&self, request: &ModDnRequest) -> Result<OperationResult, Error> {
        self.result_operation(ProtocolOp::ModDnRequest(request.clone()), 0)
    }

    /// Issue an extended operation, collecting any intermediate responses
    pub fn extended(&self, oid: &str, value: Option<Vec<u8>>) -> Result<ExtendedResult, Error> {
        let op = ProtocolOp::ExtendedRequest(ExtendedRequest {
            request_name: LdapOID(oid.to_string()),
            request_value: value,
        });
        let messages = self.request(op, None, None)?;
        let mut intermediate_responses = Vec::new();
        for msg in messages {
            let controls = msg.controls.unwrap_or_default();
            match msg.protocol_op {
                ProtocolOp::IntermediateResponse(resp) => intermediate_responses.push(resp),
                ProtocolOp::ExtendedResponse(resp) => {
                    return Ok(ExtendedResult {
                        result: resp.result,
                        response_name: resp.response_name,
                        response_value: resp.response_value,
                        intermediate_responses,
                        controls,
                    })
                }
                other => return Err(unexpected_response(&other)),
            }
        }
        Err(Error::ServerDown(DisconnectReason::ServerClosedWithoutNotice))
    }

    /// Tell the server to stop processing an operation. No response is
    /// generated; the local acceptor (if any) stays until it times out.
    pub fn abandon(&self, message_id: MessageID) -> Result<(), Error> {
        let id = self.next_message_id();
        let msg = LdapMessage::new(id, ProtocolOp::AbandonRequest(message_id));
        self.send_message(&msg)
    }

    /// Send an unbind request and close the connection
    pub fn unbind(&self) {
        let id = self.next_message_id();
        let msg = LdapMessage::new(id, ProtocolOp::UnbindRequest);
        // best effort: the server never answers an unbind
        let _ = self.send_message(&msg);
        self.shared
            .close_with_reason(DisconnectReason::UnbindRequested, self.current_generation());
    }

    /// Close without unbinding. Every outstanding acceptor fails with
    /// server-down.
    pub fn close(&self) {
        self.shared
            .close_with_reason(DisconnectReason::LocalProblem, self.current_generation());
    }

    // ----------------------- generic request plumbing -----------------------

    fn result_operation(&self, op: ProtocolOp, depth: u32) -> Result<OperationResult, Error> {
        let msg = self.single_response(op.clone(), None, None)?;
        let controls = msg.controls.clone().unwrap_or_default();
        let result = msg
            .protocol_op
            .result()
            .cloned()
            .ok_or_else(|| unexpected_response(&msg.protocol_op))?;
        let outcome = OperationResult { result, controls };
        if outcome.result.result_code == ResultCode::Referral
            && self.shared.options.follow_referrals
        {
            if let Some(urls) = outcome.result.referral.clone() {
                return Ok(self.follow_result_referral(op, outcome, urls, depth));
            }
        }
        Ok(outcome)
    }

    fn follow_result_referral(
        &self,
        op: ProtocolOp,
        outcome: OperationResult,
        urls: Vec<LdapString>,
        depth: u32,
    ) -> OperationResult {
        match referral::follow(self, &urls, depth, |conn, url, next_depth| {
            let rebuilt = rebuild_for_referral(&op, url);
            conn.result_operation(rebuilt, next_depth)
        }) {
            referral::FollowOutcome::Followed(result) => result,
            referral::FollowOutcome::HopLimit => {
                let mut limited = outcome;
                limited.result.result_code = ResultCode::ReferralLimitExceeded;
                limited
            }
            referral::FollowOutcome::NotFollowed => outcome,
        }
    }

    pub(crate) fn referral_connection(&self, url: &LdapUrl) -> Result<LdapConnection, Error> {
        let custom = self.shared.referral_connector.lock().unwrap().clone();
        match custom {
            Some(connector) => connector(url),
            None => LdapConnection::connect_with(
                Arc::clone(&self.shared.connector),
                &url.host,
                url.port,
                self.shared.options,
                self.shared.post_connect.clone(),
            ),
        }
    }

    /// Allocate the next message id; ids increase monotonically and stay
    /// unique while the operation is in flight
    fn next_message_id(&self) -> MessageID {
        MessageID(self.shared.next_message_id.fetch_add(1, Ordering::SeqCst))
    }

    fn current_generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Issue an operation expecting exactly one terminal response
    fn single_response(
        &self,
        op: ProtocolOp,
        controls: Option<Vec<Control>>,
        timeout: Option<Duration>,
    ) -> Result<LdapMessage, Error> {
        let mut messages = self.request(op, controls, timeout)?;
        match messages.len() {
            1 => Ok(messages.remove(0)),
            _ => Err(Error::decode(0, LdapError::InvalidMessageType)),
        }
    }

    /// Issue an operation and collect every response message through the
    /// terminal one. The per-operation `timeout` defaults to the
    /// connection's response timeout. On expiry the server keeps working;
    /// the caller may [`abandon`](Self::abandon) the operation, or use
    /// [`request_abandon_on_timeout`](Self::request_abandon_on_timeout) to
    /// have that happen automatically.
    pub fn request(
        &self,
        op: ProtocolOp,
        controls: Option<Vec<Control>>,
        timeout: Option<Duration>,
    ) -> Result<Vec<LdapMessage>, Error> {
        self.request_inner(op, controls, timeout, false)
    }

    /// Like [`request`](Self::request), except that when the response wait
    /// expires the connection sends an abandon request for the operation
    /// before surfacing the timeout, telling the server to stop processing
    /// it. The timeout stays non-fatal: the connection remains open.
    pub fn request_abandon_on_timeout(
        &self,
        op: ProtocolOp,
        controls: Option<Vec<Control>>,
        timeout: Option<Duration>,
    ) -> Result<Vec<LdapMessage>, Error> {
        self.request_inner(op, controls, timeout, true)
    }

    fn request_inner(
        &self,
        op: ProtocolOp,
        controls: Option<Vec<Control>>,
        timeout: Option<Duration>,
        abandon_on_timeout: bool,
    ) -> Result<Vec<LdapMessage>, Error> {
        if self.shared.options.use_synchronous_mode {
            return self.request_synchronous(op, controls, timeout, abandon_on_timeout);
        }
        let timeout = timeout.unwrap_or(self.shared.options.response_timeout);
        let (tx, rx) = mpsc::channel();
        let id = self.send_with_acceptor(op, controls, Acceptor::Queue(tx))?;
        let deadline = Instant::now() + timeout;
        let mut responses = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(ResponseEvent::Message(msg)) => {
                    let terminal = msg.protocol_op.terminates_operation();
                    responses.push(msg);
                    if terminal {
                        return Ok(responses);
                    }
                }
                Ok(ResponseEvent::Disconnected(reason)) => {
                    return Err(Error::ServerDown(reason))
                }
                Err(RecvTimeoutError::Timeout) => {
                    // drop the acceptor; the connection stays open
                    self.shared.acceptors.lock().unwrap().remove(&id.0);
                    if abandon_on_timeout {
                        // best effort: an abandon never gets a response
                        let _ = self.abandon(id);
                    }
                    return Err(Error::Timeout(timeout));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::ServerDown(DisconnectReason::Other))
                }
            }
        }
    }

    /// Register an asynchronous listener and send; responses arrive on the
    /// reader thread. Returns the allocated message id.
    pub fn send_async(
        &self,
        op: ProtocolOp,
        controls: Option<Vec<Control>>,
        listener: ResponseListener,
    ) -> Result<MessageID, Error> {
        if self.shared.options.use_synchronous_mode {
            return Err(Error::local(
                "asynchronous operations are not available in synchronous mode",
            ));
        }
        self.send_with_acceptor(op, controls, Acceptor::Listener(listener))
    }

    /// Acceptor registration happens before the write so a fast response
    /// cannot race the registry
    fn send_with_acceptor(
        &self,
        op: ProtocolOp,
        controls: Option<Vec<Control>>,
        acceptor: Acceptor,
    ) -> Result<MessageID, Error> {
        self.ensure_open()?;
        let id = self.next_message_id();
        self.shared
            .acceptors
            .lock()
            .unwrap()
            .insert(id.0, acceptor);
        let msg = LdapMessage {
            message_id: id,
            protocol_op: op,
            controls,
        };
        if let Err(e) = self.send_message(&msg) {
            self.shared.acceptors.lock().unwrap().remove(&id.0);
            return Err(e);
        }
        Ok(id)
    }

    /// Serialize and write under the send lock
    fn send_message(&self, msg: &LdapMessage) -> Result<(), Error> {
        let bytes = msg.to_bytes();
        let write_result = {
            let mut transport = self.shared.transport.lock().unwrap();
            match &mut *transport {
                Transport::Threaded { writer, .. } => {
                    writer.write_all(&bytes).and_then(|_| writer.flush())
                }
                Transport::Synchronous { stream, .. } => {
                    stream.write_all(&bytes).and_then(|_| stream.flush())
                }
                Transport::Closed => {
                    return Err(Error::ServerDown(self.closed_reason()));
                }
            }
        };
        match write_result {
            Ok(()) => Ok(()),
            Err(e) => {
                self.shared.close_with_reason(
                    DisconnectReason::IoError,
                    self.current_generation(),
                );
                Err(e.into())
            }
        }
    }

    fn closed_reason(&self) -> DisconnectReason {
        match self.state() {
            ConnectionState::Closed(reason) => reason,
            _ => DisconnectReason::Other,
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        let state = self.state();
        match state {
            ConnectionState::Open => Ok(()),
            ConnectionState::Closed(reason) => {
                let unexpected = matches!(
                    reason,
                    DisconnectReason::ServerClosedConnection
                        | DisconnectReason::ServerClosedWithoutNotice
                        | DisconnectReason::IoError
                        | DisconnectReason::DecodeError
                );
                if unexpected && self.shared.options.auto_reconnect {
                    debug!(
                        "ldap connection {} auto-reconnecting after {}",
                        self.shared.id, reason
                    );
                    Shared::establish(&self.shared)
                } else {
                    Err(Error::ServerDown(reason))
                }
            }
            _ => Err(Error::ServerDown(DisconnectReason::Other)),
        }
    }

    // ----------------------- synchronous mode -----------------------

    fn request_synchronous(
        &self,
        op: ProtocolOp,
        controls: Option<Vec<Control>>,
        timeout: Option<Duration>,
        abandon_on_timeout: bool,
    ) -> Result<Vec<LdapMessage>, Error> {
        if self
            .shared
            .sync_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::local(
                "a synchronous-mode connection allows one operation at a time",
            ));
        }
        let outcome = self.request_synchronous_locked(op, controls, timeout, abandon_on_timeout);
        self.shared.sync_in_flight.store(false, Ordering::SeqCst);
        if let Err(e) = &outcome {
            if e.is_fatal() {
                self.shared.close_with_reason(
                    fatal_reason(e),
                    self.current_generation(),
                );
            }
        }
        outcome
    }

    fn request_synchronous_locked(
        &self,
        op: ProtocolOp,
        controls: Option<Vec<Control>>,
        timeout: Option<Duration>,
        abandon_on_timeout: bool,
    ) -> Result<Vec<LdapMessage>, Error> {
        self.ensure_open()?;
        let timeout = timeout.unwrap_or(self.shared.options.response_timeout);
        let deadline = Instant::now() + timeout;
        let id = self.next_message_id();
        let msg = LdapMessage {
            message_id: id,
            protocol_op: op,
            controls,
        };
        let bytes = msg.to_bytes();

        let mut transport = self.shared.transport.lock().unwrap();
        let (stream, frame) = match &mut *transport {
            Transport::Synchronous { stream, frame } => (stream, frame),
            Transport::Closed => return Err(Error::ServerDown(self.closed_reason())),
            Transport::Threaded { .. } => {
                return Err(Error::local("connection is not in synchronous mode"))
            }
        };
        stream.write_all(&bytes)?;
        stream.flush()?;

        let mut responses = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                if abandon_on_timeout {
                    send_abandon_inline(stream, &self.shared.next_message_id, id);
                }
                return Err(Error::Timeout(timeout));
            }
            stream.set_read_timeout(Some(remaining))?;
            let frame_bytes = match read_frame(
                stream.as_mut(),
                &mut frame.buf,
                &mut frame.offset,
                self.shared.options.max_message_size,
            ) {
                Ok(bytes) => bytes,
                Err(Error::Io(e))
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    if abandon_on_timeout {
                        send_abandon_inline(stream, &self.shared.next_message_id, id);
                    }
                    return Err(Error::Timeout(timeout));
                }
                Err(e) => return Err(e),
            };
            let frame_offset = frame.offset - frame_bytes.len() as u64;
            let parsed = decode_frame(&frame_bytes, frame_offset)?;
            if parsed.message_id.0 == 0 {
                if let Some(reason) = self.shared.handle_unsolicited(&parsed) {
                    return Err(Error::ServerDown(reason));
                }
                continue;
            }
            if parsed.message_id != id {
                // response to an earlier, abandoned-by-timeout operation
                debug!(
                    "ldap connection {} discarding stale response for message id {}",
                    self.shared.id, parsed.message_id.0
                );
                continue;
            }
            let terminal = parsed.protocol_op.terminates_operation();
            responses.push(parsed);
            if terminal {
                return Ok(responses);
            }
        }
    }
}

/// Write an abandon request directly on a synchronous-mode stream after a
/// timeout; failures are ignored, the operation is already being given up
fn send_abandon_inline(
    stream: &mut Box<dyn ConnectionStream>,
    message_ids: &AtomicU32,
    target: MessageID,
) {
    let msg = LdapMessage::new(
        MessageID(message_ids.fetch_add(1, Ordering::SeqCst)),
        ProtocolOp::AbandonRequest(target),
    );
    let _ = stream
        .write_all(&msg.to_bytes())
        .and_then(|_| stream.flush());
}

fn fatal_reason(e: &Error) -> DisconnectReason {
    match e {
        Error::Decode { .. } | Error::MessageTooLarge { .. } => DisconnectReason::DecodeError,
        Error::Io(_) => DisconnectReason::IoError,
        Error::ServerDown(reason) => reason.clone(),
        _ => DisconnectReason::Other,
    }
}

fn unexpected_response(op: &ProtocolOp) -> Error {
    Error::local(format!("unexpected response type {}", op.tag()))
}

fn into_bind_result(msg: LdapMessage) -> Result<BindResult, Error> {
    let controls = msg.controls.unwrap_or_default();
    match msg.protocol_op {
        ProtocolOp::BindResponse(resp) => Ok(BindResult {
            result: resp.result,
            server_sasl_creds: resp.server_sasl_creds,
            controls,
        }),
        other => Err(unexpected_response(&other)),
    }
}

/// Rebuild a request for the referral target, swapping in the URL's DN when
/// it names one
fn rebuild_for_referral(op: &ProtocolOp, url: &LdapUrl) -> ProtocolOp {
    let mut op = op.clone();
    if url.base_dn.is_empty() {
        return op;
    }
    let dn = LdapDN(url.base_dn.clone());
    match &mut op {
        ProtocolOp::AddRequest(req) => req.entry = dn,
        ProtocolOp::DelRequest(target) => *target = dn,
        ProtocolOp::ModifyRequest(req) => req.object = dn,
        ProtocolOp::ModDnRequest(req) => req.entry = dn,
        ProtocolOp::CompareRequest(req) => req.entry = dn,
        ProtocolOp::SearchRequest(req) => req.base_object = dn,
        _ => {}
    }
    op
}

impl Shared {
    /// Open (or reopen) the transport, run the post-connect chain, and start
    /// the reader task
    fn establish(shared: &Arc<Shared>) -> Result<(), Error> {
        let _guard = shared.connect_guard.lock().unwrap();
        if matches!(*shared.state.lock().unwrap(), ConnectionState::Open) {
            return Ok(());
        }
        *shared.state.lock().unwrap() = ConnectionState::Connecting;

        let connected = shared
            .connector
            .connect(&shared.host, shared.port, &shared.options);
        let mut stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                *shared.state.lock().unwrap() =
                    ConnectionState::Closed(DisconnectReason::IoError);
                return Err(e);
            }
        };
        let ctx = ConnectContext {
            host: &shared.host,
            port: shared.port,
            options: &shared.options,
            next_message_id: &shared.next_message_id,
        };
        for processor in &shared.post_connect {
            stream = match processor.process(stream, &ctx) {
                Ok(stream) => stream,
                Err(e) => {
                    *shared.state.lock().unwrap() =
                        ConnectionState::Closed(DisconnectReason::LocalProblem);
                    return Err(e);
                }
            };
        }

        let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if shared.options.use_synchronous_mode {
            *shared.transport.lock().unwrap() = Transport::Synchronous {
                stream,
                frame: FrameBuffer::new(),
            };
        } else {
            let halves = match stream.into_halves() {
                Ok(halves) => halves,
                Err(e) => {
                    *shared.state.lock().unwrap() =
                        ConnectionState::Closed(DisconnectReason::IoError);
                    return Err(e.into());
                }
            };
            let reader_half = halves.reader;
            *shared.transport.lock().unwrap() = Transport::Threaded {
                writer: halves.writer,
                shutdown: halves.shutdown,
            };
            let reader_shared = Arc::clone(shared);
            let spawned = thread::Builder::new()
                .name(format!("ldap-reader-{}", shared.id))
                .spawn(move || reader_loop(reader_shared, reader_half, generation));
            if let Err(e) = spawned {
                *shared.transport.lock().unwrap() = Transport::Closed;
                *shared.state.lock().unwrap() =
                    ConnectionState::Closed(DisconnectReason::LocalProblem);
                return Err(Error::Io(e));
            }
        }
        *shared.state.lock().unwrap() = ConnectionState::Open;
        debug!(
            "ldap connection {} open to {}:{} (generation {})",
            shared.id, shared.host, shared.port, generation
        );
        Ok(())
    }

    /// Transition to `Closed(reason)` exactly once per generation: shut the
    /// transport, fail every registered acceptor with server-down, and
    /// notify the disconnect handler.
    fn close_with_reason(&self, reason: DisconnectReason, generation: u64) {
        {
            let mut state = self.state.lock().unwrap();
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if matches!(*state, ConnectionState::Closed(_)) {
                return;
            }
            *state = ConnectionState::Closed(reason.clone());
        }
        {
            let mut transport = self.transport.lock().unwrap();
            if let Transport::Threaded { shutdown, .. } = &*transport {
                shutdown();
            }
            *transport = Transport::Closed;
        }
        let drained: Vec<Acceptor> = self
            .acceptors
            .lock()
            .unwrap()
            .drain()
            .map(|(_, acceptor)| acceptor)
            .collect();
        for acceptor in drained {
            acceptor.deliver(ResponseEvent::Disconnected(reason.clone()));
        }
        let handler = self.disconnect_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(&reason);
        }
        debug!("ldap connection {} closed: {}", self.id, reason);
    }

    /// Route an unsolicited notification; returns a close reason when the
    /// notification implies the server is going away
    fn handle_unsolicited(&self, msg: &LdapMessage) -> Option<DisconnectReason> {
        match &msg.protocol_op {
            ProtocolOp::ExtendedResponse(resp) => {
                let handler = self.unsolicited_handler.lock().unwrap().clone();
                if let Some(handler) = handler {
                    handler(resp);
                } else {
                    debug!(
                        "ldap connection {} unsolicited notification {:?}",
                        self.id, resp.response_name
                    );
                }
                if resp.is_notice_of_disconnection() {
                    Some(DisconnectReason::ServerClosedConnection)
                } else {
                    None
                }
            }
            other => {
                warn!(
                    "ldap connection {} message id 0 with unexpected op {}",
                    self.id,
                    other.tag()
                );
                None
            }
        }
    }

    /// Deliver one inbound message to its acceptor
    fn dispatch(&self, msg: LdapMessage) {
        let id = msg.message_id.0;
        let terminal = msg.protocol_op.terminates_operation();
        let acceptor = {
            let mut acceptors = self.acceptors.lock().unwrap();
            if terminal {
                acceptors.remove(&id)
            } else {
                acceptors.get(&id).cloned()
            }
        };
        match acceptor {
            // delivered outside the registry lock: a slow queue must not
            // stall acceptor registration
            Some(acceptor) => acceptor.deliver(ResponseEvent::Message(msg)),
            None => warn!(
                "ldap connection {} response for unknown message id {}",
                self.id, id
            ),
        }
    }
}

/// The dedicated reader task: frames inbound bytes, decodes messages, and
/// routes them until EOF or a fatal error closes the connection.
fn reader_loop(shared: Arc<Shared>, mut reader: Box<dyn Read + Send>, generation: u64) {
    let mut buf = Vec::with_capacity(4096);
    let mut offset: u64 = 0;
    loop {
        let frame = match read_frame(
            &mut *reader,
            &mut buf,
            &mut offset,
            shared.options.max_message_size,
        ) {
            Ok(frame) => frame,
            Err(e) => {
                shared.close_with_reason(fatal_reason(&e), generation);
                return;
            }
        };
        let frame_offset = offset - frame.len() as u64;
        let msg = match decode_frame(&frame, frame_offset) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("ldap connection {} fatal decode error: {}", shared.id, e);
                shared.close_with_reason(DisconnectReason::DecodeError, generation);
                return;
            }
        };
        if msg.message_id.0 == 0 {
            if let Some(reason) = shared.handle_unsolicited(&msg) {
                shared.close_with_reason(reason, generation);
                return;
            }
            continue;
        }
        shared.dispatch(msg);
    }
}

/// Read one complete BER element from the stream, accumulating into `buf`.
/// `offset` tracks the absolute stream position for error reporting.
pub(crate) fn read_frame<R: Read + ?Sized>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    offset: &mut u64,
    max_message_size: usize,
) -> Result<Vec<u8>, Error> {
    let mut chunk = [0u8; 4096];
    loop {
        if !buf.is_empty() {
            match Header::from_ber(buf) {
                Ok((rem, header)) => {
                    let header_len = buf.len() - rem.len();
                    let content_len = header
                        .length()
                        .definite()
                        .map_err(|e| Error::decode(*offset, LdapError::Ber(e)))?;
                    let total = header_len + content_len;
                    if total > max_message_size {
                        return Err(Error::MessageTooLarge {
                            size: total,
                            limit: max_message_size,
                        });
                    }
                    if buf.len() >= total {
                        let frame: Vec<u8> = buf.drain(..total).collect();
                        *offset += total as u64;
                        return Ok(frame);
                    }
                }
                Err(NomErr::Incomplete(_)) => {}
                Err(NomErr::Error(e)) | Err(NomErr::Failure(e)) => {
                    return Err(Error::decode(*offset, LdapError::Ber(e)))
                }
            }
        }
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            return Err(if buf.is_empty() {
                Error::ServerDown(DisconnectReason::ServerClosedWithoutNotice)
            } else {
                Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-message",
                ))
            });
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn decode_frame(frame: &[u8], frame_offset: u64) -> Result<LdapMessage, Error> {
    match LdapMessage::from_ber(frame) {
        Ok((rem, msg)) if rem.is_empty() => Ok(msg),
        Ok((_, _)) => Err(Error::decode(frame_offset, LdapError::InvalidMessageType)),
        Err(NomErr::Error(e)) | Err(NomErr::Failure(e)) => Err(Error::decode(frame_offset, e)),
        Err(NomErr::Incomplete(_)) => Err(Error::decode(frame_offset, LdapError::Unknown)),
    }
}

/// One blocking request/response exchange on a raw stream; used by
/// post-connect processors before the reader task exists
pub fn synchronous_exchange(
    stream: &mut dyn ConnectionStream,
    msg: &LdapMessage,
    options: &ConnectionOptions,
) -> Result<LdapMessage, Error> {
    stream.set_read_timeout(Some(options.response_timeout))?;
    stream.write_all(&msg.to_bytes())?;
    stream.flush()?;
    let mut buf = Vec::with_capacity(4096);
    let mut offset = 0u64;
    loop {
        let frame = read_frame(stream, &mut buf, &mut offset, options.max_message_size)?;
        let frame_offset = offset - frame.len() as u64;
        let parsed = decode_frame(&frame, frame_offset)?;
        if parsed.message_id.0 == 0 {
            if let ProtocolOp::ExtendedResponse(resp) = &parsed.protocol_op {
                if resp.is_notice_of_disconnection() {
                    return Err(Error::ServerDown(DisconnectReason::ServerClosedConnection));
                }
            }
            continue;
        }
        if parsed.message_id == msg.message_id {
            return Ok(parsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encoded(msg: &LdapMessage) -> Vec<u8> {
        msg.to_bytes()
    }

    #[test]
    fn test_read_frame_splits_pipelined_messages() {
        let first = encoded(&LdapMessage::new(MessageID(1), ProtocolOp::UnbindRequest));
        let second = encoded(&LdapMessage::new(
            MessageID(2),
            ProtocolOp::DelResponse(LdapResult::success()),
        ));
        let mut data = first.clone();
        data.extend_from_slice(&second);
        let mut cursor = Cursor::new(data);
        let mut buf = Vec::new();
        let mut offset = 0u64;
        let frame1 = read_frame(&mut cursor, &mut buf, &mut offset, 1024).unwrap();
        assert_eq!(frame1, first);
        let frame2 = read_frame(&mut cursor, &mut buf, &mut offset, 1024).unwrap();
        assert_eq!(frame2, second);
        assert_eq!(offset, (frame1.len() + frame2.len()) as u64);
    }

    #[test]
    fn test_read_frame_eof_between_messages_is_server_down() {
        let mut cursor = Cursor::new(Vec::new());
        let mut buf = Vec::new();
        let mut offset = 0u64;
        match read_frame(&mut cursor, &mut buf, &mut offset, 1024) {
            Err(Error::ServerDown(DisconnectReason::ServerClosedWithoutNotice)) => {}
            other => panic!("unexpected outcome {:?}", other.err()),
        }
    }

    #[test]
    fn test_read_frame_eof_mid_message_is_io_error() {
        let full = encoded(&LdapMessage::new(MessageID(1), ProtocolOp::UnbindRequest));
        let mut cursor = Cursor::new(full[..3].to_vec());
        let mut buf = Vec::new();
        let mut offset = 0u64;
        match read_frame(&mut cursor, &mut buf, &mut offset, 1024) {
            Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected outcome {:?}", other.err()),
        }
    }

    #[test]
    fn test_read_frame_enforces_max_message_size() {
        let msg = LdapMessage::new(
            MessageID(1),
            ProtocolOp::SearchResultEntry(SearchResultEntry {
                object_name: LdapDN("cn=big".to_string()),
                attributes: vec![crate::filter::PartialAttribute {
                    attr_type: LdapString("data".to_string()),
                    attr_vals: vec![crate::filter::AttributeValue(vec![0u8; 2048])],
                }],
            }),
        );
        let mut cursor = Cursor::new(encoded(&msg));
        let mut buf = Vec::new();
        let mut offset = 0u64;
        match read_frame(&mut cursor, &mut buf, &mut offset, 1024) {
            Err(Error::MessageTooLarge { limit: 1024, .. }) => {}
            other => panic!("unexpected outcome {:?}", other.err()),
        }
    }

    #[test]
    fn test_decode_frame_reports_offset() {
        // valid header, garbage content
        let garbage = vec![0x30, 0x03, 0xff, 0xff, 0xff];
        match decode_frame(&garbage, 17) {
            Err(Error::Decode { offset: 17, .. }) => {}
            other => panic!("unexpected outcome {:?}", other.err()),
        }
    }

    #[test]
    fn test_rebuild_for_referral_swaps_dn() {
        let op = ProtocolOp::DelRequest(LdapDN("cn=old,dc=example,dc=com".to_string()));
        let url = LdapUrl {
            scheme: "ldap".to_string(),
            host: "other.example.com".to_string(),
            port: 389,
            base_dn: "cn=old,dc=other,dc=com".to_string(),
        };
        match rebuild_for_referral(&op, &url) {
            ProtocolOp::DelRequest(dn) => assert_eq!(dn.0, "cn=old,dc=other,dc=com"),
            other => panic!("unexpected op {:?}", other),
        }

        let bare = LdapUrl {
            scheme: "ldap".to_string(),
            host: "other.example.com".to_string(),
            port: 389,
            base_dn: String::new(),
        };
        match rebuild_for_referral(&op, &bare) {
            ProtocolOp::DelRequest(dn) => assert_eq!(dn.0, "cn=old,dc=example,dc=com"),
            other => panic!("unexpected op {:?}", other),
        }
    }
}
