//! LDAP errors

use nom::error::{ErrorKind, FromExternalError, ParseError};
use nom::IResult;

/// Holds the result of parsing functions (LDAP)
///
/// Note that this type is also a `Result`, so usual functions (`map`, `unwrap` etc.) are available.
///
/// Note that this type is not named `LdapResult` to avoid conflicts with LDAP standard type
pub type Result<'a, T> = IResult<&'a [u8], T, LdapError>;

/// An error that can occur while decoding a protocol element
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum LdapError {
    #[error("Invalid LDAP String encoding")]
    InvalidString,

    #[error("Invalid LDAP Authentication Type")]
    InvalidAuthenticationType,

    #[error("Invalid DN encoding")]
    InvalidDN,

    #[error("Invalid Substring Type")]
    InvalidSubstring,

    #[error("Invalid Type for Filter")]
    InvalidFilterType,
    #[error("Invalid Type for Message")]
    InvalidMessageType,

    #[error("Unknown error")]
    Unknown,

    #[error("BER error: {0}")]
    Ber(#[from] asn1_rs::Error),
    #[error("nom error: {0:?}")]
    NomError(ErrorKind),
}

impl From<LdapError> for nom::Err<LdapError> {
    fn from(e: LdapError) -> nom::Err<LdapError> {
        nom::Err::Error(e)
    }
}

impl From<ErrorKind> for LdapError {
    fn from(e: ErrorKind) -> LdapError {
        LdapError::NomError(e)
    }
}

impl<I> ParseError<I> for LdapError {
    fn from_error_kind(_input: I, kind: ErrorKind) -> Self {
        LdapError::NomError(kind)
    }
    fn append(_input: I, kind: ErrorKind, _other: Self) -> Self {
        LdapError::NomError(kind)
    }
}

impl<I, E> FromExternalError<I, E> for LdapError {
    fn from_external_error(_input: I, kind: ErrorKind, _e: E) -> LdapError {
        LdapError::NomError(kind)
    }
}

/// Why a connection left the `Open` state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client sent an unbind request and closed the connection
    UnbindRequested,
    /// The server sent a notice of disconnection before closing
    ServerClosedConnection,
    /// The stream reached EOF without any notice from the server
    ServerClosedWithoutNotice,
    /// A socket-level failure terminated the connection
    IoError,
    /// Malformed framing terminated the connection
    DecodeError,
    /// A client-side problem forced the close
    LocalProblem,
    /// The connection was closed while following a referral
    Referral,
    /// Anything else
    Other,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DisconnectReason::UnbindRequested => "unbind requested",
            DisconnectReason::ServerClosedConnection => "server closed connection",
            DisconnectReason::ServerClosedWithoutNotice => "server closed connection without notice",
            DisconnectReason::IoError => "I/O error",
            DisconnectReason::DecodeError => "decoding error",
            DisconnectReason::LocalProblem => "local problem",
            DisconnectReason::Referral => "referral",
            DisconnectReason::Other => "other",
        };
        f.write_str(s)
    }
}

/// An error surfaced by the client runtime (connections, pools, codecs at the
/// I/O boundary).
///
/// Protocol-level failures (non-success result codes) are *not* errors: they
/// are returned structurally inside the operation result, and callers inspect
/// the result code. The variants here drive caller behavior: decode and I/O
/// errors are fatal to the connection they occurred on, timeouts are not.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed BER or unexpected structure, with the absolute stream offset
    /// at which the offending frame started
    #[error("decoding error at stream offset {offset}: {source}")]
    Decode {
        offset: u64,
        #[source]
        source: LdapError,
    },

    /// Socket-level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The per-operation response wait expired. The connection stays open;
    /// the caller may abandon the operation.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The connection is closed or was never established
    #[error("server down: {0}")]
    ServerDown(DisconnectReason),

    /// An inbound frame exceeded the configured maximum message size
    #[error("inbound message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    /// A referral chain exceeded the configured hop limit
    #[error("referral hop limit ({0}) exceeded")]
    ReferralLimitExceeded(u32),

    /// Invalid text form (DN, filter, LDIF, LDAP URL)
    #[error("invalid {kind}: {detail}")]
    InvalidText { kind: &'static str, detail: String },

    /// Programmer or resource error (invalid argument, interrupted wait,
    /// concurrent use of a synchronous-mode connection, exhausted pool)
    #[error("local error: {0}")]
    Local(String),
}

impl Error {
    pub(crate) fn decode(offset: u64, source: LdapError) -> Self {
        Error::Decode { offset, source }
    }

    pub(crate) fn invalid_text(kind: &'static str, detail: impl Into<String>) -> Self {
        Error::InvalidText {
            kind,
            detail: detail.into(),
        }
    }

    pub(crate) fn local(detail: impl Into<String>) -> Self {
        Error::Local(detail.into())
    }

    /// True when the error is fatal to the connection it occurred on
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Decode { .. }
                | Error::Io(_)
                | Error::ServerDown(_)
                | Error::MessageTooLarge { .. }
        )
    }
}
