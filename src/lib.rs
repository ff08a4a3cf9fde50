//! # LDAP Client
//!
//! A Lightweight Directory Access Protocol (LDAP, [RFC4511]) client library:
//! the BER wire codec, typed protocol messages, the textual codecs for
//! distinguished names ([RFC4514]), search filters ([RFC4515]) and LDIF
//! ([RFC2849]), a multiplexing per-connection I/O runtime, and a pooling
//! layer with pluggable server-selection strategies.
//!
//! Message decoding is implemented with the [nom](https://github.com/Geal/nom)
//! parser combinator framework through `asn1-rs`, in pure Rust with care
//! taken around malformed input: a framing or decoding error on the wire
//! fails the whole connection rather than resynchronizing. Protocol-level
//! failures (non-success result codes) are returned structurally for the
//! caller to inspect, never as errors.
//!
//! ```no_run
//! use ldap_client::connection::LdapConnection;
//! use ldap_client::filter_string::parse_filter;
//! use ldap_client::ldap::{SearchRequest, SearchScope};
//!
//! # fn main() -> Result<(), ldap_client::error::Error> {
//! let conn = LdapConnection::connect("ldap.example.com", 389)?;
//! let bind = conn.simple_bind("cn=admin,dc=example,dc=com", "password")?;
//! assert!(bind.result.result_code == ldap_client::ldap::ResultCode::Success);
//!
//! let request = SearchRequest::new(
//!     "dc=example,dc=com",
//!     SearchScope::WholeSubtree,
//!     parse_filter("(objectClass=person)")?,
//! );
//! for entry in conn.search(&request)?.entries {
//!     println!("{}", entry.object_name.0);
//! }
//! conn.unbind();
//! # Ok(())
//! # }
//! ```

#![deny(/*missing_docs,*/
        unstable_features,
        unused_import_braces, unused_qualifications)]
#![warn(
    missing_debug_implementations,
    /* missing_docs,
    rust_2018_idioms,*/
    unreachable_pub
)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod writer;
pub mod ber;
pub mod connection;
pub mod controls;
pub mod dn;
pub mod entry;
pub mod error;
pub mod filter;
pub mod filter_string;
pub mod health;
pub mod ldap;
pub mod ldif;
pub mod options;
pub mod parser;
pub mod pool;
pub mod referral;
pub mod sasl;
pub mod server_set;
pub mod stream;

pub extern crate nom;
pub use asn1_rs::FromBer;
pub use nom::{Err, IResult};
