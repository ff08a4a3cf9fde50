//! Connection health checks
//!
//! A health check hooks into four points of a connection's pooled life:
//! right after creation, at checkout, at release, and periodically while
//! idle. Any failing hook makes the calling path discard the connection and
//! arrange a replacement.

use crate::connection::LdapConnection;
use crate::error::Error;
use crate::filter::Filter;
use crate::ldap::{ResultCode, SearchRequest, SearchScope};

pub trait HealthCheck: Send + Sync {
    fn ensure_new_connection_valid(&self, conn: &LdapConnection) -> Result<(), Error> {
        let _ = conn;
        Ok(())
    }

    fn ensure_connection_valid_for_checkout(&self, conn: &LdapConnection) -> Result<(), Error> {
        let _ = conn;
        Ok(())
    }

    fn ensure_connection_valid_for_release(&self, conn: &LdapConnection) -> Result<(), Error> {
        let _ = conn;
        Ok(())
    }

    fn ensure_connection_valid_for_continued_use(
        &self,
        conn: &LdapConnection,
    ) -> Result<(), Error> {
        let _ = conn;
        Ok(())
    }
}

/// Probes the server with a fixed search and requires a success result.
/// The default probe reads the root DSE.
pub struct SearchHealthCheck {
    request: SearchRequest,
    check_on_checkout: bool,
    check_on_release: bool,
}

impl SearchHealthCheck {
    pub fn new(request: SearchRequest) -> Self {
        SearchHealthCheck {
            request,
            check_on_checkout: false,
            check_on_release: false,
        }
    }

    /// Base-scope search against the root DSE
    pub fn root_dse() -> Self {
        Self::new(SearchRequest::new(
            "",
            SearchScope::BaseObject,
            Filter::present("objectClass"),
        ))
    }

    /// Also probe on every checkout (off by default: it adds a round trip
    /// to each borrow)
    pub fn check_on_checkout(mut self, enabled: bool) -> Self {
        self.check_on_checkout = enabled;
        self
    }

    /// Also probe on every release
    pub fn check_on_release(mut self, enabled: bool) -> Self {
        self.check_on_release = enabled;
        self
    }

    fn probe(&self, conn: &LdapConnection) -> Result<(), Error> {
        let result = conn.search(&self.request)?;
        if result.result.result_code == ResultCode::Success {
            Ok(())
        } else {
            Err(Error::local(format!(
                "health-check search failed with {:?}",
                result.result.result_code
            )))
        }
    }
}

impl HealthCheck for SearchHealthCheck {
    fn ensure_new_connection_valid(&self, conn: &LdapConnection) -> Result<(), Error> {
        self.probe(conn)
    }

    fn ensure_connection_valid_for_checkout(&self, conn: &LdapConnection) -> Result<(), Error> {
        if self.check_on_checkout {
            self.probe(conn)
        } else {
            Ok(())
        }
    }

    fn ensure_connection_valid_for_release(&self, conn: &LdapConnection) -> Result<(), Error> {
        if self.check_on_release {
            self.probe(conn)
        } else {
            Ok(())
        }
    }

    fn ensure_connection_valid_for_continued_use(
        &self,
        conn: &LdapConnection,
    ) -> Result<(), Error> {
        self.probe(conn)
    }
}
