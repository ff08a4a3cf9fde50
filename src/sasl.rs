//! SASL bind contract (RFC 4422)
//!
//! The wire layer carries SASL exchanges as repeated bind requests whose
//! credentials come from an external mechanism implementation. The contract
//! is small: given the server's latest challenge, produce the next client
//! response or signal that authentication is complete on the client side.
//! Concrete mechanisms (EXTERNAL, CRAM-MD5, GSSAPI, ...) live outside this
//! crate; their configuration is passed to their constructors, never read
//! from process globals.

use crate::error::Error;

/// Output of one mechanism step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslStep {
    /// Send these credentials in the next bind request
    Respond(Vec<u8>),
    /// Nothing further to send; bind without credentials
    Complete,
}

/// A SASL client mechanism
pub trait SaslMechanism: Send {
    /// IANA-registered mechanism name, e.g. `EXTERNAL` or `CRAM-MD5`
    fn name(&self) -> &str;

    /// Produce the next client response. The first call receives `None`;
    /// subsequent calls receive the server's challenge from the preceding
    /// bind response.
    fn step(&mut self, challenge: Option<&[u8]>) -> Result<SaslStep, Error>;
}

/// The EXTERNAL mechanism (RFC 4422 appendix A): authentication is taken
/// from the transport (e.g. a TLS client certificate), optionally naming an
/// authorization identity.
pub struct ExternalSaslMechanism {
    authorization_id: Option<String>,
}

impl ExternalSaslMechanism {
    pub fn new() -> Self {
        ExternalSaslMechanism {
            authorization_id: None,
        }
    }

    pub fn with_authorization_id(authorization_id: &str) -> Self {
        ExternalSaslMechanism {
            authorization_id: Some(authorization_id.to_string()),
        }
    }
}

impl Default for ExternalSaslMechanism {
    fn default() -> Self {
        Self::new()
    }
}

impl SaslMechanism for ExternalSaslMechanism {
    fn name(&self) -> &str {
        "EXTERNAL"
    }

    fn step(&mut self, _challenge: Option<&[u8]>) -> Result<SaslStep, Error> {
        match &self.authorization_id {
            Some(id) => Ok(SaslStep::Respond(id.as_bytes().to_vec())),
            None => Ok(SaslStep::Complete),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_without_authzid() {
        let mut mech = ExternalSaslMechanism::new();
        assert_eq!(mech.name(), "EXTERNAL");
        assert_eq!(mech.step(None).unwrap(), SaslStep::Complete);
    }

    #[test]
    fn test_external_with_authzid() {
        let mut mech = ExternalSaslMechanism::with_authorization_id("u:jane");
        assert_eq!(
            mech.step(None).unwrap(),
            SaslStep::Respond(b"u:jane".to_vec())
        );
    }
}
