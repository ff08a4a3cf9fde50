//! BER decoders for LDAP messages (RFC 4511, IMPLICIT tags)
//!
//! The read side of the wire codec. Everything funnels through
//! [`LdapMessage::from_ber`]: the outer SEQUENCE is opened, the message id
//! read, and the protocol op selected by peeking the next application tag.
//! Decoded values are owned, so a message can outlive the read buffer and
//! cross the reader thread into an acceptor queue.

use crate::error::*;
use crate::filter::*;
use crate::ldap::*;
use asn1_rs::nom;
use asn1_rs::{
    Any, Class, Enumerated, FromBer, Header, OptTaggedImplicit, OptTaggedParser, ParseResult,
    Sequence, Set, Tag, TaggedParser,
};
use nom::combinator::{complete, map, opt, verify};
use nom::multi::{many0, many1};
use nom::Err;

//
// ----------------------- scalar helpers -----------------------
//

fn utf8_owned(raw: &[u8], kind: fn() -> LdapError) -> std::result::Result<String, Err<LdapError>> {
    match std::str::from_utf8(raw) {
        Ok(s) => Ok(s.to_string()),
        Err(_) => Err(Err::Error(kind())),
    }
}

fn invalid_string() -> LdapError {
    LdapError::InvalidString
}

fn invalid_dn() -> LdapError {
    LdapError::InvalidDN
}

// OCTET STRING, owned
fn take_octets(i: &[u8]) -> Result<Vec<u8>> {
    let (i, raw) = <&[u8]>::from_ber(i).map_err(Err::convert)?;
    Ok((i, raw.to_vec()))
}

// LDAPString ::= OCTET STRING -- UTF-8 encoded
fn take_utf8(i: &[u8]) -> Result<String> {
    let (i, raw) = <&[u8]>::from_ber(i).map_err(Err::convert)?;
    Ok((i, utf8_owned(raw, invalid_string)?))
}

#[inline]
fn ldap_string(i: &[u8]) -> Result<LdapString> {
    map(take_utf8, LdapString)(i)
}

// LDAPDN / RelativeLDAPDN report their own error kind
fn take_dn(i: &[u8]) -> Result<LdapDN> {
    let (i, raw) = <&[u8]>::from_ber(i).map_err(Err::convert)?;
    Ok((i, LdapDN(utf8_owned(raw, invalid_dn)?)))
}

fn take_rdn(i: &[u8]) -> Result<RelativeLdapDN> {
    let (i, raw) = <&[u8]>::from_ber(i).map_err(Err::convert)?;
    Ok((i, RelativeLdapDN(utf8_owned(raw, invalid_dn)?)))
}

#[inline]
fn take_u32(i: &[u8]) -> Result<u32> {
    <u32>::from_ber(i).map_err(Err::convert)
}

fn take_enum(i: &[u8]) -> Result<u32> {
    let (i, value) = Enumerated::from_ber(i).map_err(Err::convert)?;
    Ok((i, value.0))
}

#[inline]
fn take_bool(i: &[u8]) -> Result<bool> {
    <bool>::from_ber(i).map_err(Err::convert)
}

//
// ----------------------- tagged helpers -----------------------
//

/// `[APPLICATION tag]` constructed wrapper around `content`
fn app<'a, T, F>(tag: u32, i: &'a [u8], content: F) -> Result<'a, T>
where
    F: FnOnce(&'a [u8]) -> Result<'a, T>,
{
    TaggedParser::from_ber_and_then(Class::Application, tag, i, content)
}

/// `[APPLICATION tag]` primitive element, returned whole
fn app_primitive(tag: u32, i: &[u8]) -> Result<&[u8]> {
    let (rem, any) = Any::from_ber(i).map_err(Err::convert)?;
    any.class()
        .assert_eq(Class::Application)
        .map_err(|e| Err::Error(e.into()))?;
    if any.tag().0 != tag {
        return Err(Err::Error(LdapError::InvalidMessageType));
    }
    Ok((rem, any.data))
}

/// `[tag] OCTET STRING OPTIONAL` (context class, implicit)
fn opt_ctx_octets(tag: u32, i: &[u8]) -> Result<Option<Vec<u8>>> {
    OptTaggedParser::new(Class::ContextSpecific, Tag(tag))
        .parse_ber(i, |_, content| Ok((&b""[..], content.to_vec())))
}

/// `[tag] UTF-8 string OPTIONAL` (context class, implicit)
fn opt_ctx_utf8(tag: u32, i: &[u8]) -> Result<Option<String>> {
    OptTaggedParser::new(Class::ContextSpecific, Tag(tag)).parse_ber(i, |_, content| {
        Ok((&b""[..], utf8_owned(content, invalid_string)?))
    })
}

/// `[tag] LDAPOID OPTIONAL` (context class, implicit)
fn opt_ctx_oid(tag: u32, i: &[u8]) -> Result<Option<LdapOID>> {
    let (i, raw) = opt_ctx_utf8(tag, i)?;
    Ok((i, raw.map(LdapOID)))
}

//
// ----------------------- message framing -----------------------
//

// LDAPMessage ::= SEQUENCE {
//      messageID       MessageID,
//      protocolOp      CHOICE { ... },
//      controls       [0] Controls OPTIONAL }
impl<'a> FromBer<'a, LdapError> for LdapMessage {
    fn from_ber(bytes: &'a [u8]) -> ParseResult<'a, Self, LdapError> {
        Sequence::from_ber_and_then(bytes, |i| {
            let (i, message_id) = map(take_u32, MessageID)(i)?;
            // peek the next tag to select the op
            let (_, header) = Header::from_ber(i).map_err(Err::convert)?;
            let (i, protocol_op) = decode_protocol_op(header.tag().0, i)?;
            let (i, controls) = OptTaggedParser::new(Class::ContextSpecific, Tag(0))
                .parse_ber(i, |_, inner| many0(complete(control))(inner))?;
            let msg = LdapMessage {
                message_id,
                protocol_op,
                controls,
            };
            Ok((i, msg))
        })
    }
}

/// Parse a buffer holding one or more complete LDAP messages
pub fn parse_ldap_messages(i: &[u8]) -> Result<Vec<LdapMessage>> {
    many1(complete(LdapMessage::from_ber))(i)
}

/// One protocol op per application tag. Requests and responses decode here
/// alike; the library is a client, but its tests speak both directions.
fn decode_protocol_op(tag: u32, i: &[u8]) -> Result<ProtocolOp> {
    match tag {
        // BindRequest ::= [APPLICATION 0] SEQUENCE { version, name, authentication }
        0 => app(0, i, |i| {
            let (i, version) = verify(u8::from_ber, |&v| v < 128)(i).map_err(Err::convert)?;
            let (i, name) = take_dn(i)?;
            let (i, authentication) = authentication_choice(i)?;
            let req = BindRequest {
                version,
                name,
                authentication,
            };
            Ok((i, ProtocolOp::BindRequest(req)))
        }),
        // BindResponse ::= [APPLICATION 1] SEQUENCE {
        //      COMPONENTS OF LDAPResult, serverSaslCreds [7] OPTIONAL }
        1 => app(1, i, |i| {
            let (i, result) = result_content(i)?;
            let (i, server_sasl_creds) = opt_ctx_octets(7, i)?;
            let resp = BindResponse {
                result,
                server_sasl_creds,
            };
            Ok((i, ProtocolOp::BindResponse(resp)))
        }),
        // UnbindRequest ::= [APPLICATION 2] NULL
        2 => {
            let (rem, content) = app_primitive(2, i)?;
            if !content.is_empty() {
                return Err(Err::Error(LdapError::InvalidMessageType));
            }
            Ok((rem, ProtocolOp::UnbindRequest))
        }
        // SearchRequest ::= [APPLICATION 3] SEQUENCE { ... }
        3 => app(3, i, search_request_content),
        // SearchResultEntry ::= [APPLICATION 4] SEQUENCE { objectName, attributes }
        4 => app(4, i, |i| {
            let (i, object_name) = take_dn(i)?;
            let (i, attributes) =
                Sequence::from_ber_and_then(i, many0(complete(partial_attribute)))?;
            let entry = SearchResultEntry {
                object_name,
                attributes,
            };
            Ok((i, ProtocolOp::SearchResultEntry(entry)))
        }),
        // SearchResultDone ::= [APPLICATION 5] LDAPResult
        5 => result_response(5, i, ProtocolOp::SearchResultDone),
        // ModifyRequest ::= [APPLICATION 6] SEQUENCE { object, changes }
        6 => app(6, i, |i| {
            let (i, object) = take_dn(i)?;
            let (i, changes) = Sequence::from_ber_and_then(i, many1(complete(change)))?;
            Ok((i, ProtocolOp::ModifyRequest(ModifyRequest { object, changes })))
        }),
        // ModifyResponse ::= [APPLICATION 7] LDAPResult
        7 => result_response(7, i, |result| {
            ProtocolOp::ModifyResponse(ModifyResponse { result })
        }),
        // AddRequest ::= [APPLICATION 8] SEQUENCE { entry, attributes }
        8 => app(8, i, |i| {
            let (i, entry) = take_dn(i)?;
            let (i, attributes) = Sequence::from_ber_and_then(i, many0(complete(attribute)))?;
            Ok((i, ProtocolOp::AddRequest(AddRequest { entry, attributes })))
        }),
        // AddResponse ::= [APPLICATION 9] LDAPResult
        9 => result_response(9, i, ProtocolOp::AddResponse),
        // DelRequest ::= [APPLICATION 10] LDAPDN (primitive)
        10 => {
            let (rem, content) = app_primitive(10, i)?;
            let dn = LdapDN(utf8_owned(content, invalid_dn)?);
            Ok((rem, ProtocolOp::DelRequest(dn)))
        }
        // DelResponse ::= [APPLICATION 11] LDAPResult
        11 => result_response(11, i, ProtocolOp::DelResponse),
        // ModifyDNRequest ::= [APPLICATION 12] SEQUENCE {
        //      entry, newrdn, deleteoldrdn, newSuperior [0] OPTIONAL }
        12 => app(12, i, |i| {
            let (i, entry) = take_dn(i)?;
            let (i, newrdn) = take_rdn(i)?;
            let (i, deleteoldrdn) = take_bool(i)?;
            let (i, newsuperior) = OptTaggedParser::new(Class::ContextSpecific, Tag(0))
                .parse_ber(i, |_, content| {
                    Ok((&b""[..], LdapDN(utf8_owned(content, invalid_dn)?)))
                })?;
            let req = ModDnRequest {
                entry,
                newrdn,
                deleteoldrdn,
                newsuperior,
            };
            Ok((i, ProtocolOp::ModDnRequest(req)))
        }),
        // ModifyDNResponse ::= [APPLICATION 13] LDAPResult
        13 => result_response(13, i, ProtocolOp::ModDnResponse),
        // CompareRequest ::= [APPLICATION 14] SEQUENCE { entry, ava }
        14 => app(14, i, |i| {
            let (i, entry) = take_dn(i)?;
            let (i, ava) = Sequence::from_ber_and_then(i, ava_content)?;
            Ok((i, ProtocolOp::CompareRequest(CompareRequest { entry, ava })))
        }),
        // CompareResponse ::= [APPLICATION 15] LDAPResult
        15 => result_response(15, i, ProtocolOp::CompareResponse),
        // AbandonRequest ::= [APPLICATION 16] MessageID (implicit INTEGER)
        16 => {
            let (rem, content) = app_primitive(16, i)?;
            if content.is_empty() || content.len() > 4 {
                return Err(Err::Error(LdapError::InvalidMessageType));
            }
            let id = content.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
            Ok((rem, ProtocolOp::AbandonRequest(MessageID(id))))
        }
        // SearchResultReference ::= [APPLICATION 19] SEQUENCE SIZE (1..MAX) OF URI
        19 => app(19, i, |i| {
            map(
                many1(complete(ldap_string)),
                ProtocolOp::SearchResultReference,
            )(i)
        }),
        // ExtendedRequest ::= [APPLICATION 23] SEQUENCE {
        //      requestName [0], requestValue [1] OPTIONAL }
        23 => app(23, i, |i| {
            let (i, request_name) =
                TaggedParser::from_ber_and_then(Class::ContextSpecific, 0, i, |content| {
                    Ok((&b""[..], LdapOID(utf8_owned(content, invalid_string)?)))
                })?;
            let (i, request_value) = opt_ctx_octets(1, i)?;
            let req = ExtendedRequest {
                request_name,
                request_value,
            };
            Ok((i, ProtocolOp::ExtendedRequest(req)))
        }),
        // ExtendedResponse ::= [APPLICATION 24] SEQUENCE {
        //      COMPONENTS OF LDAPResult, responseName [10], responseValue [11] }
        24 => app(24, i, |i| {
            let (i, result) = result_content(i)?;
            let (i, response_name) = opt_ctx_oid(10, i)?;
            let (i, response_value) = opt_ctx_octets(11, i)?;
            let resp = ExtendedResponse {
                result,
                response_name,
                response_value,
            };
            Ok((i, ProtocolOp::ExtendedResponse(resp)))
        }),
        // IntermediateResponse ::= [APPLICATION 25] SEQUENCE {
        //      responseName [0] OPTIONAL, responseValue [1] OPTIONAL }
        25 => app(25, i, |i| {
            let (i, response_name) = opt_ctx_oid(0, i)?;
            let (i, response_value) = opt_ctx_octets(1, i)?;
            let resp = IntermediateResponse {
                response_name,
                response_value,
            };
            Ok((i, ProtocolOp::IntermediateResponse(resp)))
        }),
        _ => Err(Err::Error(LdapError::InvalidMessageType)),
    }
}

/// The shared shape of every `[APPLICATION n] LDAPResult` response
fn result_response(
    tag: u32,
    i: &[u8],
    wrap: impl FnOnce(LdapResult) -> ProtocolOp,
) -> Result<ProtocolOp> {
    app(tag, i, |i| {
        let (i, result) = result_content(i)?;
        Ok((i, wrap(result)))
    })
}

// LDAPResult ::= SEQUENCE {
//      resultCode         ENUMERATED { ... },
//      matchedDN          LDAPDN,
//      diagnosticMessage  LDAPString,
//      referral           [3] SEQUENCE SIZE (1..MAX) OF URI OPTIONAL }
fn result_content(i: &[u8]) -> Result<LdapResult> {
    let (i, result_code) = map(take_enum, ResultCode)(i)?;
    let (i, matched_dn) = take_dn(i)?;
    let (i, diagnostic_message) = ldap_string(i)?;
    let (i, referral) = OptTaggedParser::new(Class::ContextSpecific, Tag(3))
        .parse_ber(i, |_, inner| many1(complete(ldap_string))(inner))?;
    let result = LdapResult {
        result_code,
        matched_dn,
        diagnostic_message,
        referral,
    };
    Ok((i, result))
}

// AuthenticationChoice ::= CHOICE { simple [0] OCTET STRING, sasl [3] SaslCredentials }
fn authentication_choice(i: &[u8]) -> Result<AuthenticationChoice> {
    let (rem, any) = Any::from_ber(i).map_err(Err::convert)?;
    any.class()
        .assert_eq(Class::ContextSpecific)
        .map_err(|e| Err::Error(e.into()))?;
    match any.tag().0 {
        0 => Ok((rem, AuthenticationChoice::Simple(any.data.to_vec()))),
        3 => {
            let (_, credentials) = sasl_credentials(any.data)?;
            Ok((rem, AuthenticationChoice::Sasl(credentials)))
        }
        _ => Err(Err::Error(LdapError::InvalidAuthenticationType)),
    }
}

// SaslCredentials ::= SEQUENCE { mechanism LDAPString, credentials OCTET STRING OPTIONAL }
fn sasl_credentials(i: &[u8]) -> Result<SaslCredentials> {
    let (i, mechanism) = ldap_string(i)?;
    let (i, credentials) = opt(complete(take_octets))(i)?;
    let creds = SaslCredentials {
        mechanism,
        credentials,
    };
    Ok((i, creds))
}

// SearchRequest ::= [APPLICATION 3] SEQUENCE {
//      baseObject, scope, derefAliases, sizeLimit, timeLimit, typesOnly,
//      filter, attributes }
fn search_request_content(i: &[u8]) -> Result<ProtocolOp> {
    let (i, base_object) = take_dn(i)?;
    let (i, scope) = map(take_enum, SearchScope)(i)?;
    let (i, deref_aliases) = map(take_enum, DerefAliases)(i)?;
    let (i, size_limit) = take_u32(i)?;
    let (i, time_limit) = take_u32(i)?;
    let (i, types_only) = take_bool(i)?;
    let (i, filter) = decode_filter(i)?;
    // AttributeSelection ::= SEQUENCE OF LDAPString
    let (i, attributes) = Sequence::from_ber_and_then(i, many0(complete(ldap_string)))?;
    let req = SearchRequest {
        base_object,
        scope,
        deref_aliases,
        size_limit,
        time_limit,
        types_only,
        filter,
        attributes,
    };
    Ok((i, ProtocolOp::SearchRequest(req)))
}

//
// ----------------------- filters -----------------------
//

impl<'a> FromBer<'a, LdapError> for Filter {
    fn from_ber(bytes: &'a [u8]) -> ParseResult<'a, Self, LdapError> {
        decode_filter(bytes)
    }
}

// Filter ::= CHOICE {
//     and [0], or [1], not [2], equalityMatch [3], substrings [4],
//     greaterOrEqual [5], lessOrEqual [6], present [7], approxMatch [8],
//     extensibleMatch [9] }
// -- all context-specific IMPLICIT
fn decode_filter(bytes: &[u8]) -> Result<Filter> {
    let (rem, any) = Any::from_ber(bytes).map_err(Err::convert)?;
    any.class()
        .assert_eq(Class::ContextSpecific)
        .map_err(|e| Err::Error(e.into()))?;
    let tag = any.tag().0;
    let content = any.data;
    let filter = match tag {
        0 | 1 => {
            let (_, children) = many1(complete(decode_filter))(content)?;
            if tag == 0 {
                Filter::And(children)
            } else {
                Filter::Or(children)
            }
        }
        2 => {
            let (_, inner) = decode_filter(content)?;
            Filter::Not(Box::new(inner))
        }
        3 | 5 | 6 | 8 => {
            let (_, ava) = ava_content(content)?;
            match tag {
                3 => Filter::EqualityMatch(ava),
                5 => Filter::GreaterOrEqual(ava),
                6 => Filter::LessOrEqual(ava),
                _ => Filter::ApproxMatch(ava),
            }
        }
        4 => {
            let (_, substrings) = substring_filter_content(content)?;
            Filter::Substrings(substrings)
        }
        7 => Filter::Present(LdapString(utf8_owned(content, invalid_string)?)),
        9 => {
            let (_, assertion) = matching_rule_assertion_content(content)?;
            Filter::ExtensibleMatch(assertion)
        }
        _ => return Err(Err::Error(LdapError::InvalidFilterType)),
    };
    Ok((rem, filter))
}

// AttributeValueAssertion ::= SEQUENCE { attributeDesc, assertionValue }
// (also the content of the implicit-tagged filter alternatives)
fn ava_content(i: &[u8]) -> Result<AttributeValueAssertion> {
    let (i, attribute_desc) = ldap_string(i)?;
    let (i, assertion_value) = take_octets(i)?;
    let ava = AttributeValueAssertion {
        attribute_desc,
        assertion_value,
    };
    Ok((i, ava))
}

// SubstringFilter ::= SEQUENCE {
//      type, substrings SEQUENCE SIZE (1..MAX) OF CHOICE {
//           initial [0], any [1], final [2] } }
fn substring_filter_content(i: &[u8]) -> Result<SubstringFilter> {
    let (i, filter_type) = ldap_string(i)?;
    let (i, substrings) =
        Sequence::from_ber_and_then(i, many1(complete(substring_element)))?;
    let filter = SubstringFilter {
        filter_type,
        substrings,
    };
    Ok((i, filter))
}

fn substring_element(bytes: &[u8]) -> Result<Substring> {
    let (rem, any) = Any::from_ber(bytes).map_err(Err::convert)?;
    let make = match any.tag().0 {
        0 => Substring::Initial,
        1 => Substring::Any,
        2 => Substring::Final,
        _ => return Err(Err::Error(LdapError::InvalidSubstring)),
    };
    Ok((rem, make(AssertionValue(any.data.to_vec()))))
}

// MatchingRuleAssertion ::= SEQUENCE {
//     matchingRule [1] OPTIONAL, type [2] OPTIONAL,
//     matchValue [3], dnAttributes [4] BOOLEAN DEFAULT FALSE }
fn matching_rule_assertion_content(i: &[u8]) -> Result<MatchingRuleAssertion> {
    let (i, matching_rule) = opt_ctx_utf8(1, i)?;
    let (i, rule_type) = opt_ctx_utf8(2, i)?;
    let (i, assertion_value) =
        TaggedParser::from_ber_and_then(Class::ContextSpecific, 3, i, |content| {
            Ok((&b""[..], AssertionValue(content.to_vec())))
        })?;
    let (i, dn_attributes) =
        OptTaggedImplicit::<bool, asn1_rs::Error, 4>::from_ber(i).map_err(Err::convert)?;
    let assertion = MatchingRuleAssertion {
        matching_rule: matching_rule.map(LdapString),
        rule_type: rule_type.map(AttributeDescription),
        assertion_value,
        dn_attributes: dn_attributes.map(|t| t.into_inner()),
    };
    Ok((i, assertion))
}

//
// ----------------------- attributes and controls -----------------------
//

// PartialAttribute ::= SEQUENCE { type, vals SET OF AttributeValue }
fn partial_attribute(bytes: &[u8]) -> Result<PartialAttribute> {
    let (rem, (attr_type, attr_vals)) = attribute_content(bytes)?;
    let attr = PartialAttribute {
        attr_type,
        attr_vals,
    };
    Ok((rem, attr))
}

// Attribute ::= PartialAttribute (WITH COMPONENTS { vals (SIZE(1..MAX)) })
fn attribute(bytes: &[u8]) -> Result<Attribute> {
    let (rem, (attr_type, attr_vals)) = attribute_content(bytes)?;
    if attr_vals.is_empty() {
        return Err(Err::Error(LdapError::InvalidMessageType));
    }
    let attr = Attribute {
        attr_type,
        attr_vals,
    };
    Ok((rem, attr))
}

fn attribute_content(bytes: &[u8]) -> Result<(LdapString, Vec<AttributeValue>)> {
    Sequence::from_ber_and_then(bytes, |i| {
        let (i, attr_type) = ldap_string(i)?;
        let (i, attr_vals) =
            Set::from_ber_and_then(i, many0(complete(map(take_octets, AttributeValue))))?;
        Ok((i, (attr_type, attr_vals)))
    })
}

// change SEQUENCE { operation ENUMERATED, modification PartialAttribute }
fn change(bytes: &[u8]) -> Result<Change> {
    Sequence::from_ber_and_then(bytes, |i| {
        let (i, operation) = map(take_enum, Operation)(i)?;
        let (i, modification) = partial_attribute(i)?;
        let change = Change {
            operation,
            modification,
        };
        Ok((i, change))
    })
}

// Control ::= SEQUENCE {
//     controlType LDAPOID, criticality BOOLEAN DEFAULT FALSE,
//     controlValue OCTET STRING OPTIONAL }
fn control(bytes: &[u8]) -> Result<Control> {
    Sequence::from_ber_and_then(bytes, |i| {
        let (i, control_type) = map(take_utf8, LdapOID)(i)?;
        let (i, criticality) = <Option<bool>>::from_ber(i).map_err(Err::convert)?;
        let (i, control_value) = opt(complete(take_octets))(i)?;
        let control = Control {
            control_type,
            criticality: criticality.unwrap_or(false),
            control_value,
        };
        Ok((i, control))
    })
}

//
//
//
//
//
// ----------------------- TESTS -----------------------
//
//
//
//
//
//

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn parse_one(data: &[u8]) -> LdapMessage {
        let (rem, msg) = LdapMessage::from_ber(data).expect("parsing failed");
        assert!(rem.is_empty());
        msg
    }

    #[test]
    fn test_parse_simple_bind_request() {
        // id 1, version 3, name "cn=admin,dc=example,dc=com", password "secret"
        const DATA: &[u8] = &hex!(
            "30 2c 02 01 01 60 27 02 01 03 04 1a 63 6e 3d 61"
            "64 6d 69 6e 2c 64 63 3d 65 78 61 6d 70 6c 65 2c"
            "64 63 3d 63 6f 6d 80 06 73 65 63 72 65 74"
        );
        let msg = parse_one(DATA);
        assert_eq!(msg.message_id, MessageID(1));
        match msg.protocol_op {
            ProtocolOp::BindRequest(req) => {
                assert_eq!(req.version, 3);
                assert_eq!(&req.name.0, "cn=admin,dc=example,dc=com");
                assert_eq!(
                    req.authentication,
                    AuthenticationChoice::Simple(b"secret".to_vec())
                );
            }
            other => panic!("unexpected op {:?}", other.tag()),
        }
    }

    #[test]
    fn test_parse_sasl_bind_request() {
        // id 1, empty name, mechanism "EXTERNAL", no credentials
        const DATA: &[u8] = &hex!(
            "30 16 02 01 01 60 11 02 01 03 04 00 a3 0a 04 08"
            "45 58 54 45 52 4e 41 4c"
        );
        let msg = parse_one(DATA);
        match msg.protocol_op {
            ProtocolOp::BindRequest(req) => {
                assert_eq!(&req.name.0, "");
                match req.authentication {
                    AuthenticationChoice::Sasl(creds) => {
                        assert_eq!(&creds.mechanism.0, "EXTERNAL");
                        assert!(creds.credentials.is_none());
                    }
                    other => panic!("unexpected authentication {:?}", other),
                }
            }
            other => panic!("unexpected op {:?}", other.tag()),
        }
    }

    #[test]
    fn test_parse_bind_response_long_form_length() {
        // the op length is valid long-form BER even though below 128
        const DATA: &[u8] = &hex!("30 10 02 01 02 61 84 00 00 00 07 0a 01 00 04 00 04 00");
        let msg = parse_one(DATA);
        match msg.protocol_op {
            ProtocolOp::BindResponse(resp) => {
                assert_eq!(resp.result.result_code, ResultCode::Success);
                assert!(resp.server_sasl_creds.is_none());
            }
            other => panic!("unexpected op {:?}", other.tag()),
        }
    }

    #[test]
    fn test_parse_bind_response_sasl_creds() {
        const DATA: &[u8] = &hex!("30 11 02 01 01 61 0c 0a 01 00 04 00 04 00 87 03 61 62 63");
        let msg = parse_one(DATA);
        match msg.protocol_op {
            ProtocolOp::BindResponse(resp) => {
                assert_eq!(resp.server_sasl_creds.as_deref(), Some(&b"abc"[..]));
            }
            other => panic!("unexpected op {:?}", other.tag()),
        }
    }

    #[test]
    fn test_parse_unbind_request() {
        const DATA: &[u8] = &hex!("30 05 02 01 03 42 00");
        let msg = parse_one(DATA);
        assert_eq!(msg.protocol_op, ProtocolOp::UnbindRequest);
    }

    #[test]
    fn test_parse_abandon_request() {
        const DATA: &[u8] = &hex!("30 06 02 01 06 50 01 05");
        let msg = parse_one(DATA);
        assert_eq!(msg.message_id, MessageID(6));
        assert_eq!(
            msg.protocol_op,
            ProtocolOp::AbandonRequest(MessageID(5))
        );
    }

    #[test]
    fn test_parse_compare_response_true() {
        const DATA: &[u8] = &hex!("30 0c 02 01 05 6f 07 0a 01 06 04 00 04 00");
        let msg = parse_one(DATA);
        match msg.protocol_op {
            ProtocolOp::CompareResponse(result) => {
                assert_eq!(result.result_code, ResultCode::CompareTrue);
            }
            other => panic!("unexpected op {:?}", other.tag()),
        }
    }

    #[test]
    fn test_parse_extended_response() {
        const DATA: &[u8] = &hex!("30 0c 02 01 04 78 07 0a 01 00 04 00 04 00");
        let msg = parse_one(DATA);
        match msg.protocol_op {
            ProtocolOp::ExtendedResponse(resp) => {
                assert_eq!(resp.result.result_code, ResultCode::Success);
                assert!(resp.response_name.is_none());
            }
            other => panic!("unexpected op {:?}", other.tag()),
        }
    }

    #[test]
    fn test_parse_intermediate_response() {
        // responseName [0] "1.2.3.4", responseValue [1] 0x00
        const DATA: &[u8] = &hex!("30 11 02 01 07 79 0c 80 07 31 2e 32 2e 33 2e 34 81 01 00");
        let msg = parse_one(DATA);
        match msg.protocol_op {
            ProtocolOp::IntermediateResponse(resp) => {
                assert_eq!(resp.response_name.unwrap().0, "1.2.3.4");
                assert_eq!(resp.response_value.as_deref(), Some(&[0x00][..]));
            }
            other => panic!("unexpected op {:?}", other.tag()),
        }
    }

    #[test]
    fn test_parse_result_with_referral() {
        // referral(10), empty matchedDN/diagnostic, one URI
        const DATA: &[u8] = &hex!(
            "0a 01 0a 04 00 04 00 a3 23 04 21 6c 64 61 70 3a"
            "2f 2f 6f 74 68 65 72 2e 65 78 61 6d 70 6c 65 2e"
            "63 6f 6d 2f 64 63 3d 63 6f 6d 3f 3f"
        );
        let (rem, result) = result_content(DATA).expect("parsing failed");
        assert!(rem.is_empty());
        assert_eq!(result.result_code, ResultCode::Referral);
        let referral = result.referral.expect("referral missing");
        assert_eq!(referral.len(), 1);
        assert_eq!(&referral[0].0, "ldap://other.example.com/dc=com??");
    }

    #[test]
    fn test_parse_filter_composite() {
        // (&(objectClass=person)(cn=J*an*)) as implicit-tagged BER
        const DATA: &[u8] = &hex!(
            "a0 26 a3 15 04 0b 6f 62 6a 65 63 74 43 6c 61 73"
            "73 04 06 70 65 72 73 6f 6e a4 0d 04 02 63 6e 30"
            "07 80 01 4a 81 02 61 6e"
        );
        let (rem, filter) = decode_filter(DATA).expect("parsing failed");
        assert!(rem.is_empty());
        match filter {
            Filter::And(children) => {
                assert_eq!(children.len(), 2);
                assert_eq!(
                    children[0],
                    Filter::equality("objectClass", b"person")
                );
                match &children[1] {
                    Filter::Substrings(sub) => {
                        assert_eq!(&sub.filter_type.0, "cn");
                        assert_eq!(
                            sub.substrings,
                            vec![
                                Substring::Initial(AssertionValue(b"J".to_vec())),
                                Substring::Any(AssertionValue(b"an".to_vec())),
                            ]
                        );
                    }
                    other => panic!("unexpected filter {:?}", other),
                }
            }
            other => panic!("unexpected filter {:?}", other),
        }
    }

    #[test]
    fn test_attribute_requires_a_value() {
        // SEQUENCE { "cn", SET {} } is a valid PartialAttribute but not an Attribute
        const DATA: &[u8] = &hex!("30 06 04 02 63 6e 31 00");
        assert!(partial_attribute(DATA).is_ok());
        assert!(attribute(DATA).is_err());
    }

    #[test]
    fn test_reject_unknown_op_tag() {
        // application tag 17 is unassigned
        const DATA: &[u8] = &hex!("30 05 02 01 01 51 00");
        assert!(LdapMessage::from_ber(DATA).is_err());
    }
}
