//! Server sets: polymorphic sources of connections
//!
//! A server set abstracts a group of candidate directory servers behind one
//! capability: produce a connection, optionally vetted by a health check.
//! Three strategies ship: single server, round-robin load balancing, and
//! ordered failover.

use crate::connection::{
    synchronous_exchange, ConnectContext, LdapConnection, PostConnectProcessor,
};
use crate::error::Error;
use crate::health::HealthCheck;
use crate::ldap::{
    ExtendedRequest, LdapMessage, LdapOID, ProtocolOp, ResultCode, START_TLS_OID,
};
use crate::options::ConnectionOptions;
use crate::stream::{ConnectionStream, StreamConnector, TcpConnector, TlsUpgrader};
use log::debug;
use std::sync::{Arc, Mutex};

/// A source of connections to one or more candidate servers
pub trait ServerSet: Send + Sync {
    fn get_connection(&self) -> Result<LdapConnection, Error>;

    /// Produce a connection and run the new-connection health check hook;
    /// a failing hook discards the connection and surfaces the error
    fn get_connection_with_health_check(
        &self,
        health_check: Option<&dyn HealthCheck>,
    ) -> Result<LdapConnection, Error> {
        let conn = self.get_connection()?;
        if let Some(health_check) = health_check {
            if let Err(e) = health_check.ensure_new_connection_valid(&conn) {
                conn.close();
                return Err(e);
            }
        }
        Ok(conn)
    }
}

/// Shared connect machinery for the concrete sets
struct ConnectSettings {
    connector: Arc<dyn StreamConnector>,
    options: ConnectionOptions,
    post_connect: Vec<Arc<dyn PostConnectProcessor>>,
}

impl ConnectSettings {
    fn defaults() -> Self {
        ConnectSettings {
            connector: Arc::new(TcpConnector),
            options: ConnectionOptions::default(),
            post_connect: Vec::new(),
        }
    }

    fn attempt(&self, host: &str, port: u16) -> Result<LdapConnection, Error> {
        LdapConnection::connect_with(
            Arc::clone(&self.connector),
            host,
            port,
            self.options,
            self.post_connect.clone(),
        )
    }
}

/// Every call opens a new connection to the same address
pub struct SingleServerSet {
    host: String,
    port: u16,
    settings: ConnectSettings,
}

impl SingleServerSet {
    pub fn new(host: &str, port: u16) -> Self {
        SingleServerSet {
            host: host.to_string(),
            port,
            settings: ConnectSettings::defaults(),
        }
    }

    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.settings.options = options;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn StreamConnector>) -> Self {
        self.settings.connector = connector;
        self
    }

    pub fn with_post_connect(mut self, processor: Arc<dyn PostConnectProcessor>) -> Self {
        self.settings.post_connect.push(processor);
        self
    }
}

impl ServerSet for SingleServerSet {
    fn get_connection(&self) -> Result<LdapConnection, Error> {
        self.settings.attempt(&self.host, self.port)
    }
}

/// Rotates across an ordered server list. The cursor advance and the
/// forward scan over remaining slots run under one lock, so concurrent
/// callers see a strictly serialized rotation.
pub struct RoundRobinServerSet {
    servers: Vec<(String, u16)>,
    cursor: Mutex<usize>,
    settings: ConnectSettings,
}

impl RoundRobinServerSet {
    pub fn new(servers: &[(&str, u16)]) -> Self {
        assert!(!servers.is_empty(), "server set requires at least one server");
        RoundRobinServerSet {
            servers: servers
                .iter()
                .map(|(host, port)| (host.to_string(), *port))
                .collect(),
            cursor: Mutex::new(0),
            settings: ConnectSettings::defaults(),
        }
    }

    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.settings.options = options;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn StreamConnector>) -> Self {
        self.settings.connector = connector;
        self
    }

    pub fn with_post_connect(mut self, processor: Arc<dyn PostConnectProcessor>) -> Self {
        self.settings.post_connect.push(processor);
        self
    }
}

impl ServerSet for RoundRobinServerSet {
    fn get_connection(&self) -> Result<LdapConnection, Error> {
        let mut cursor = self.cursor.lock().unwrap();
        let n = self.servers.len();
        let start = *cursor;
        *cursor = (start + 1) % n;
        let mut last_err = None;
        for i in 0..n {
            let (host, port) = &self.servers[(start + i) % n];
            match self.settings.attempt(host, *port) {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    debug!("round-robin attempt against {}:{} failed: {}", host, port, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("non-empty server list"))
    }
}

/// Always starts at the head of the list and walks forward until a server
/// accepts
pub struct FailoverServerSet {
    servers: Vec<(String, u16)>,
    settings: ConnectSettings,
}

impl FailoverServerSet {
    pub fn new(servers: &[(&str, u16)]) -> Self {
        assert!(!servers.is_empty(), "server set requires at least one server");
        FailoverServerSet {
            servers: servers
                .iter()
                .map(|(host, port)| (host.to_string(), *port))
                .collect(),
            settings: ConnectSettings::defaults(),
        }
    }

    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.settings.options = options;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn StreamConnector>) -> Self {
        self.settings.connector = connector;
        self
    }

    pub fn with_post_connect(mut self, processor: Arc<dyn PostConnectProcessor>) -> Self {
        self.settings.post_connect.push(processor);
        self
    }
}

impl ServerSet for FailoverServerSet {
    fn get_connection(&self) -> Result<LdapConnection, Error> {
        let mut last_err = None;
        for (host, port) in &self.servers {
            match self.settings.attempt(host, *port) {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    debug!("failover attempt against {}:{} failed: {}", host, port, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("non-empty server list"))
    }
}

/// Issues the StartTLS extended operation (RFC 4511 4.14) on the freshly
/// connected stream, then hands it to the application's TLS upgrader. Runs
/// before any bind and before the reader task starts.
pub struct StartTlsPostConnectProcessor {
    upgrader: Arc<dyn TlsUpgrader>,
}

impl StartTlsPostConnectProcessor {
    pub fn new(upgrader: Arc<dyn TlsUpgrader>) -> Self {
        StartTlsPostConnectProcessor { upgrader }
    }
}

impl PostConnectProcessor for StartTlsPostConnectProcessor {
    fn process(
        &self,
        mut stream: Box<dyn ConnectionStream>,
        ctx: &ConnectContext<'_>,
    ) -> Result<Box<dyn ConnectionStream>, Error> {
        let msg = LdapMessage::new(
            ctx.next_message_id(),
            ProtocolOp::ExtendedRequest(ExtendedRequest {
                request_name: LdapOID(START_TLS_OID.to_string()),
                request_value: None,
            }),
        );
        let response = synchronous_exchange(stream.as_mut(), &msg, ctx.options)?;
        match response.protocol_op {
            ProtocolOp::ExtendedResponse(resp)
                if resp.result.result_code == ResultCode::Success =>
            {
                self.upgrader.upgrade(stream, ctx.host)
            }
            ProtocolOp::ExtendedResponse(resp) => Err(Error::local(format!(
                "StartTLS refused: {:?} {}",
                resp.result.result_code, resp.result.diagnostic_message.0
            ))),
            other => Err(Error::local(format!(
                "unexpected StartTLS response type {}",
                other.tag()
            ))),
        }
    }
}
