//! Wire encoders for LDAP messages
//!
//! Mirror image of the `parser` module: one writer per protocol op, each
//! emitting its application-tagged element into a [`BerWriter`]. Tags follow
//! RFC 4511 section 4.1 (IMPLICIT tagging).

use crate::ber::{BerWriter, TAG_SEQUENCE, TAG_SET};
use crate::filter::*;
use crate::ldap::*;

// application-class identifier bytes
const TAG_BIND_REQUEST: u8 = 0x60;
const TAG_BIND_RESPONSE: u8 = 0x61;
const TAG_UNBIND_REQUEST: u8 = 0x42;
const TAG_SEARCH_REQUEST: u8 = 0x63;
const TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
const TAG_SEARCH_RESULT_DONE: u8 = 0x65;
const TAG_SEARCH_RESULT_REFERENCE: u8 = 0x73;
const TAG_MODIFY_REQUEST: u8 = 0x66;
const TAG_MODIFY_RESPONSE: u8 = 0x67;
const TAG_ADD_REQUEST: u8 = 0x68;
const TAG_ADD_RESPONSE: u8 = 0x69;
const TAG_DEL_REQUEST: u8 = 0x4a;
const TAG_DEL_RESPONSE: u8 = 0x6b;
const TAG_MODDN_REQUEST: u8 = 0x6c;
const TAG_MODDN_RESPONSE: u8 = 0x6d;
const TAG_COMPARE_REQUEST: u8 = 0x6e;
const TAG_COMPARE_RESPONSE: u8 = 0x6f;
const TAG_ABANDON_REQUEST: u8 = 0x50;
const TAG_EXTENDED_REQUEST: u8 = 0x77;
const TAG_EXTENDED_RESPONSE: u8 = 0x78;
const TAG_INTERMEDIATE_RESPONSE: u8 = 0x79;
const TAG_CONTROLS: u8 = 0xa0;

impl LdapMessage {
    /// Serialize the message into a fresh buffer
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = BerWriter::with_capacity(128);
        self.write(&mut w);
        w.into_bytes()
    }

    /// Serialize the message into `w`
    pub fn write(&self, w: &mut BerWriter) {
        let msg = w.begin(TAG_SEQUENCE);
        w.write_integer(i64::from(self.message_id.0));
        write_protocol_op(w, &self.protocol_op);
        if let Some(controls) = &self.controls {
            let ctl_seq = w.begin(TAG_CONTROLS);
            for control in controls {
                write_control(w, control);
            }
            w.end(ctl_seq);
        }
        w.end(msg);
    }
}

fn write_protocol_op(w: &mut BerWriter, op: &ProtocolOp) {
    match op {
        ProtocolOp::BindRequest(req) => write_bind_request(w, req),
        ProtocolOp::BindResponse(resp) => {
            let scope = w.begin(TAG_BIND_RESPONSE);
            write_ldap_result_content(w, &resp.result);
            if let Some(creds) = &resp.server_sasl_creds {
                w.write_primitive(0x87, creds);
            }
            w.end(scope);
        }
        ProtocolOp::UnbindRequest => w.write_primitive(TAG_UNBIND_REQUEST, &[]),
        ProtocolOp::SearchRequest(req) => write_search_request(w, req),
        ProtocolOp::SearchResultEntry(entry) => write_search_result_entry(w, entry),
        ProtocolOp::SearchResultDone(result) => {
            write_tagged_result(w, TAG_SEARCH_RESULT_DONE, result)
        }
        ProtocolOp::SearchResultReference(uris) => {
            let scope = w.begin(TAG_SEARCH_RESULT_REFERENCE);
            for uri in uris {
                w.write_str(&uri.0);
            }
            w.end(scope);
        }
        ProtocolOp::ModifyRequest(req) => write_modify_request(w, req),
        ProtocolOp::ModifyResponse(resp) => {
            write_tagged_result(w, TAG_MODIFY_RESPONSE, &resp.result)
        }
        ProtocolOp::AddRequest(req) => write_add_request(w, req),
        ProtocolOp::AddResponse(result) => write_tagged_result(w, TAG_ADD_RESPONSE, result),
        ProtocolOp::DelRequest(dn) => w.write_primitive(TAG_DEL_REQUEST, dn.0.as_bytes()),
        ProtocolOp::DelResponse(result) => write_tagged_result(w, TAG_DEL_RESPONSE, result),
        ProtocolOp::ModDnRequest(req) => write_moddn_request(w, req),
        ProtocolOp::ModDnResponse(result) => write_tagged_result(w, TAG_MODDN_RESPONSE, result),
        ProtocolOp::CompareRequest(req) => write_compare_request(w, req),
        ProtocolOp::CompareResponse(result) => {
            write_tagged_result(w, TAG_COMPARE_RESPONSE, result)
        }
        ProtocolOp::AbandonRequest(id) => {
            w.write_tagged_integer(TAG_ABANDON_REQUEST, i64::from(id.0))
        }
        ProtocolOp::ExtendedRequest(req) => write_extended_request(w, req),
        ProtocolOp::ExtendedResponse(resp) => write_extended_response(w, resp),
        ProtocolOp::IntermediateResponse(resp) => write_intermediate_response(w, resp),
    }
}

// LDAPResult ::= SEQUENCE {
//      resultCode         ENUMERATED { ... },
//      matchedDN          LDAPDN,
//      diagnosticMessage  LDAPString,
//      referral           [3] Referral OPTIONAL }
fn write_ldap_result_content(w: &mut BerWriter, result: &LdapResult) {
    w.write_enumerated(result.result_code.0);
    w.write_str(&result.matched_dn.0);
    w.write_str(&result.diagnostic_message.0);
    if let Some(referral) = &result.referral {
        let scope = w.begin(0xa3);
        for uri in referral {
            w.write_str(&uri.0);
        }
        w.end(scope);
    }
}

fn write_tagged_result(w: &mut BerWriter, tag: u8, result: &LdapResult) {
    let scope = w.begin(tag);
    write_ldap_result_content(w, result);
    w.end(scope);
}

// BindRequest ::= [APPLICATION 0] SEQUENCE {
//      version                 INTEGER (1 ..  127),
//      name                    LDAPDN,
//      authentication          AuthenticationChoice }
fn write_bind_request(w: &mut BerWriter, req: &BindRequest) {
    let scope = w.begin(TAG_BIND_REQUEST);
    w.write_integer(i64::from(req.version));
    w.write_str(&req.name.0);
    match &req.authentication {
        AuthenticationChoice::Simple(password) => w.write_primitive(0x80, password),
        AuthenticationChoice::Sasl(creds) => {
            let sasl = w.begin(0xa3);
            w.write_str(&creds.mechanism.0);
            if let Some(credentials) = &creds.credentials {
                w.write_octet_string(credentials);
            }
            w.end(sasl);
        }
    }
    w.end(scope);
}

// SearchRequest ::= [APPLICATION 3] SEQUENCE { ... }
fn write_search_request(w: &mut BerWriter, req: &SearchRequest) {
    let scope = w.begin(TAG_SEARCH_REQUEST);
    w.write_str(&req.base_object.0);
    w.write_enumerated(req.scope.0);
    w.write_enumerated(req.deref_aliases.0);
    w.write_integer(i64::from(req.size_limit));
    w.write_integer(i64::from(req.time_limit));
    w.write_boolean(req.types_only);
    write_filter(w, &req.filter);
    let attrs = w.begin(TAG_SEQUENCE);
    for attr in &req.attributes {
        w.write_str(&attr.0);
    }
    w.end(attrs);
    w.end(scope);
}

// SearchResultEntry ::= [APPLICATION 4] SEQUENCE {
//     objectName      LDAPDN,
//     attributes      PartialAttributeList }
fn write_search_result_entry(w: &mut BerWriter, entry: &SearchResultEntry) {
    let scope = w.begin(TAG_SEARCH_RESULT_ENTRY);
    w.write_str(&entry.object_name.0);
    let attrs = w.begin(TAG_SEQUENCE);
    for attr in &entry.attributes {
        write_partial_attribute(w, attr);
    }
    w.end(attrs);
    w.end(scope);
}

// PartialAttribute ::= SEQUENCE {
//      type       AttributeDescription,
//      vals       SET OF value AttributeValue }
fn write_partial_attribute(w: &mut BerWriter, attr: &PartialAttribute) {
    let scope = w.begin(TAG_SEQUENCE);
    w.write_str(&attr.attr_type.0);
    let vals = w.begin(TAG_SET);
    for val in &attr.attr_vals {
        w.write_octet_string(&val.0);
    }
    w.end(vals);
    w.end(scope);
}

// ModifyRequest ::= [APPLICATION 6] SEQUENCE {
//     object          LDAPDN,
//     changes         SEQUENCE OF change SEQUENCE { ... } }
//
// Change order is preserved on the wire.
fn write_modify_request(w: &mut BerWriter, req: &ModifyRequest) {
    let scope = w.begin(TAG_MODIFY_REQUEST);
    w.write_str(&req.object.0);
    let changes = w.begin(TAG_SEQUENCE);
    for change in &req.changes {
        let ch = w.begin(TAG_SEQUENCE);
        w.write_enumerated(change.operation.0);
        write_partial_attribute(w, &change.modification);
        w.end(ch);
    }
    w.end(changes);
    w.end(scope);
}

// AddRequest ::= [APPLICATION 8] SEQUENCE {
//     entry           LDAPDN,
//     attributes      AttributeList }
fn write_add_request(w: &mut BerWriter, req: &AddRequest) {
    let scope = w.begin(TAG_ADD_REQUEST);
    w.write_str(&req.entry.0);
    let attrs = w.begin(TAG_SEQUENCE);
    for attr in &req.attributes {
        let a = w.begin(TAG_SEQUENCE);
        w.write_str(&attr.attr_type.0);
        let vals = w.begin(TAG_SET);
        for val in &attr.attr_vals {
            w.write_octet_string(&val.0);
        }
        w.end(vals);
        w.end(a);
    }
    w.end(attrs);
    w.end(scope);
}

// ModifyDNRequest ::= [APPLICATION 12] SEQUENCE {
//     entry           LDAPDN,
//     newrdn          RelativeLDAPDN,
//     deleteoldrdn    BOOLEAN,
//     newSuperior     [0] LDAPDN OPTIONAL }
fn write_moddn_request(w: &mut BerWriter, req: &ModDnRequest) {
    let scope = w.begin(TAG_MODDN_REQUEST);
    w.write_str(&req.entry.0);
    w.write_str(&req.newrdn.0);
    w.write_boolean(req.deleteoldrdn);
    if let Some(superior) = &req.newsuperior {
        w.write_primitive(0x80, superior.0.as_bytes());
    }
    w.end(scope);
}

// CompareRequest ::= [APPLICATION 14] SEQUENCE {
//     entry           LDAPDN,
//     ava             AttributeValueAssertion }
fn write_compare_request(w: &mut BerWriter, req: &CompareRequest) {
    let scope = w.begin(TAG_COMPARE_REQUEST);
    w.write_str(&req.entry.0);
    let ava = w.begin(TAG_SEQUENCE);
    w.write_str(&req.ava.attribute_desc.0);
    w.write_octet_string(&req.ava.assertion_value);
    w.end(ava);
    w.end(scope);
}

// ExtendedRequest ::= [APPLICATION 23] SEQUENCE {
//     requestName      [0] LDAPOID,
//     requestValue     [1] OCTET STRING OPTIONAL }
fn write_extended_request(w: &mut BerWriter, req: &ExtendedRequest) {
    let scope = w.begin(TAG_EXTENDED_REQUEST);
    w.write_primitive(0x80, req.request_name.0.as_bytes());
    if let Some(value) = &req.request_value {
        w.write_primitive(0x81, value);
    }
    w.end(scope);
}

// ExtendedResponse ::= [APPLICATION 24] SEQUENCE {
//     COMPONENTS OF LDAPResult,
//     responseName     [10] LDAPOID OPTIONAL,
//     responseValue    [11] OCTET STRING OPTIONAL }
fn write_extended_response(w: &mut BerWriter, resp: &ExtendedResponse) {
    let scope = w.begin(TAG_EXTENDED_RESPONSE);
    write_ldap_result_content(w, &resp.result);
    if let Some(name) = &resp.response_name {
        w.write_primitive(0x8a, name.0.as_bytes());
    }
    if let Some(value) = &resp.response_value {
        w.write_primitive(0x8b, value);
    }
    w.end(scope);
}

// IntermediateResponse ::= [APPLICATION 25] SEQUENCE {
//      responseName     [0] LDAPOID OPTIONAL,
//      responseValue    [1] OCTET STRING OPTIONAL }
fn write_intermediate_response(w: &mut BerWriter, resp: &IntermediateResponse) {
    let scope = w.begin(TAG_INTERMEDIATE_RESPONSE);
    if let Some(name) = &resp.response_name {
        w.write_primitive(0x80, name.0.as_bytes());
    }
    if let Some(value) = &resp.response_value {
        w.write_primitive(0x81, value);
    }
    w.end(scope);
}

// Control ::= SEQUENCE {
//     controlType             LDAPOID,
//     criticality             BOOLEAN DEFAULT FALSE,
//     controlValue            OCTET STRING OPTIONAL }
fn write_control(w: &mut BerWriter, control: &Control) {
    let scope = w.begin(TAG_SEQUENCE);
    w.write_str(&control.control_type.0);
    // DEFAULT FALSE is omitted
    if control.criticality {
        w.write_boolean(true);
    }
    if let Some(value) = &control.control_value {
        w.write_octet_string(value);
    }
    w.end(scope);
}

// Filter ::= CHOICE {
//     and             [0] SET SIZE (1..MAX) OF filter Filter,
//     or              [1] SET SIZE (1..MAX) OF filter Filter,
//     not             [2] Filter,
//     equalityMatch   [3] AttributeValueAssertion,
//     substrings      [4] SubstringFilter,
//     greaterOrEqual  [5] AttributeValueAssertion,
//     lessOrEqual     [6] AttributeValueAssertion,
//     present         [7] AttributeDescription,
//     approxMatch     [8] AttributeValueAssertion,
//     extensibleMatch [9] MatchingRuleAssertion,
//     ...  }
pub(crate) fn write_filter(w: &mut BerWriter, filter: &Filter) {
    match filter {
        Filter::And(children) => write_filter_set(w, 0xa0, children),
        Filter::Or(children) => write_filter_set(w, 0xa1, children),
        Filter::Not(child) => {
            let scope = w.begin(0xa2);
            write_filter(w, child);
            w.end(scope);
        }
        Filter::EqualityMatch(ava) => write_filter_ava(w, 0xa3, ava),
        Filter::Substrings(sub) => {
            let scope = w.begin(0xa4);
            w.write_str(&sub.filter_type.0);
            let seq = w.begin(TAG_SEQUENCE);
            for substring in &sub.substrings {
                match substring {
                    Substring::Initial(v) => w.write_primitive(0x80, &v.0),
                    Substring::Any(v) => w.write_primitive(0x81, &v.0),
                    Substring::Final(v) => w.write_primitive(0x82, &v.0),
                }
            }
            w.end(seq);
            w.end(scope);
        }
        Filter::GreaterOrEqual(ava) => write_filter_ava(w, 0xa5, ava),
        Filter::LessOrEqual(ava) => write_filter_ava(w, 0xa6, ava),
        Filter::Present(attr) => w.write_primitive(0x87, attr.0.as_bytes()),
        Filter::ApproxMatch(ava) => write_filter_ava(w, 0xa8, ava),
        Filter::ExtensibleMatch(mra) => {
            let scope = w.begin(0xa9);
            if let Some(rule) = &mra.matching_rule {
                w.write_primitive(0x81, rule.0.as_bytes());
            }
            if let Some(rule_type) = &mra.rule_type {
                w.write_primitive(0x82, rule_type.0.as_bytes());
            }
            w.write_primitive(0x83, &mra.assertion_value.0);
            if let Some(dn_attributes) = mra.dn_attributes {
                w.write_primitive(0x84, &[if dn_attributes { 0xff } else { 0x00 }]);
            }
            w.end(scope);
        }
    }
}

fn write_filter_set(w: &mut BerWriter, tag: u8, children: &[Filter]) {
    let scope = w.begin(tag);
    for child in children {
        write_filter(w, child);
    }
    w.end(scope);
}

fn write_filter_ava(w: &mut BerWriter, tag: u8, ava: &AttributeValueAssertion) {
    let scope = w.begin(tag);
    w.write_str(&ava.attribute_desc.0);
    w.write_octet_string(&ava.assertion_value);
    w.end(scope);
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
