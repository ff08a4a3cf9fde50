//! Response-control decoding
//!
//! Response controls are matched by OID against a registry of decoder
//! functions. Known control families decode into typed variants; anything
//! else falls back to the raw control bytes. The simple-paged-results
//! control (RFC 2696) ships as the built-in family.

use crate::ber::{BerWriter, TAG_SEQUENCE};
use crate::error::{Error, LdapError};
use crate::ldap::Control;
use asn1_rs::nom::Err;
use asn1_rs::{FromBer, Sequence};
use std::collections::HashMap;

/// OID of the simple-paged-results control (RFC 2696)
pub const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";

/// A response control after registry decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedControl {
    PagedResults(PagedResultsControl),
    /// No decoder registered for the OID: raw control carried through
    Raw(Control),
}

/// realSearchControlValue ::= SEQUENCE {
///         size            INTEGER,
///         cookie          OCTET STRING }
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagedResultsControl {
    pub size: u32,
    pub cookie: Vec<u8>,
}

impl PagedResultsControl {
    /// Request control asking for pages of `size` entries. An empty cookie
    /// starts the sequence; later pages echo the server's cookie back.
    pub fn request(size: u32, cookie: &[u8], criticality: bool) -> Control {
        let mut w = BerWriter::new();
        let seq = w.begin(TAG_SEQUENCE);
        w.write_integer(i64::from(size));
        w.write_octet_string(cookie);
        w.end(seq);
        Control::new(PAGED_RESULTS_OID, criticality, Some(w.into_bytes()))
    }

    fn decode(control: &Control) -> Result<DecodedControl, Error> {
        let value = control
            .control_value
            .as_deref()
            .ok_or_else(|| Error::decode(0, LdapError::InvalidMessageType))?;
        let (_, decoded) = Sequence::from_ber_and_then(value, |i| {
            let (i, size) = u32::from_ber(i).map_err(Err::convert)?;
            let (i, cookie) = <&[u8]>::from_ber(i).map_err(Err::convert)?;
            Ok((
                i,
                PagedResultsControl {
                    size,
                    cookie: cookie.to_vec(),
                },
            ))
        })
        .map_err(|e: Err<LdapError>| Error::decode(0, unwrap_parse_error(e)))?;
        Ok(DecodedControl::PagedResults(decoded))
    }

    /// True when the server reports more pages
    pub fn has_more(&self) -> bool {
        !self.cookie.is_empty()
    }
}

fn unwrap_parse_error(e: Err<LdapError>) -> LdapError {
    match e {
        Err::Error(e) | Err::Failure(e) => e,
        Err::Incomplete(_) => LdapError::Unknown,
    }
}

type ControlDecoder = Box<dyn Fn(&Control) -> Result<DecodedControl, Error> + Send + Sync>;

/// OID-keyed registry of response-control decoders
pub struct ControlRegistry {
    decoders: HashMap<String, ControlDecoder>,
}

impl Default for ControlRegistry {
    fn default() -> Self {
        let mut registry = ControlRegistry {
            decoders: HashMap::new(),
        };
        registry.register(PAGED_RESULTS_OID, PagedResultsControl::decode);
        registry
    }
}

impl std::fmt::Debug for ControlRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut oids: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        oids.sort_unstable();
        f.debug_struct("ControlRegistry").field("oids", &oids).finish()
    }
}

impl ControlRegistry {
    /// Register (or replace) the decoder for an OID
    pub fn register<F>(&mut self, oid: &str, decoder: F)
    where
        F: Fn(&Control) -> Result<DecodedControl, Error> + Send + Sync + 'static,
    {
        self.decoders.insert(oid.to_string(), Box::new(decoder));
    }

    /// Decode a response control. Unknown OIDs come back as
    /// [`DecodedControl::Raw`]; a registered decoder that rejects its input
    /// surfaces the decode error.
    pub fn decode(&self, control: &Control) -> Result<DecodedControl, Error> {
        match self.decoders.get(&control.control_type.0) {
            Some(decoder) => decoder(control),
            None => Ok(DecodedControl::Raw(control.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paged_results_roundtrip() {
        let control = PagedResultsControl::request(100, b"cookie", false);
        assert_eq!(control.control_type.0, PAGED_RESULTS_OID);
        let registry = ControlRegistry::default();
        match registry.decode(&control).unwrap() {
            DecodedControl::PagedResults(paged) => {
                assert_eq!(paged.size, 100);
                assert_eq!(paged.cookie, b"cookie");
                assert!(paged.has_more());
            }
            other => panic!("unexpected decode {:?}", other),
        }
    }

    #[test]
    fn test_unknown_oid_falls_back_to_raw() {
        let control = Control::new("1.2.3.4.5", false, Some(vec![0x01, 0x02]));
        let registry = ControlRegistry::default();
        assert_eq!(
            registry.decode(&control).unwrap(),
            DecodedControl::Raw(control)
        );
    }

    #[test]
    fn test_malformed_value_is_an_error() {
        let control = Control::new(PAGED_RESULTS_OID, false, Some(vec![0xff]));
        let registry = ControlRegistry::default();
        assert!(registry.decode(&control).is_err());

        let control = Control::new(PAGED_RESULTS_OID, false, None);
        assert!(registry.decode(&control).is_err());
    }
}
