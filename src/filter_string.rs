//! Search-filter string codec (RFC 4515)
//!
//! Parses the textual filter grammar into the wire [`Filter`] variant and
//! prints it back. Emitted values normalize every escape to the `\NN` hex
//! form; parsed AND/OR children keep their textual order (equality up to
//! ordering goes through [`Filter::eq_ignoring_child_order`]).

use crate::error::Error;
use crate::filter::*;
use crate::ldap::LdapString;
use std::fmt;
use std::str::FromStr;

/// Parse an RFC 4515 filter string.
///
/// The outer parentheses may be omitted for a single item
/// (`objectClass=person`), matching common client behavior.
pub fn parse_filter(input: &str) -> Result<Filter, Error> {
    let mut p = FilterParser {
        input: input.trim().as_bytes(),
        pos: 0,
        original: input,
    };
    let filter = if p.peek() == Some(b'(') {
        p.parse_filter()?
    } else {
        p.parse_item(p.input.len())?
    };
    if p.pos != p.input.len() {
        return Err(p.error("trailing characters after filter"));
    }
    Ok(filter)
}

impl FromStr for Filter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_filter(s)
    }
}

struct FilterParser<'a> {
    input: &'a [u8],
    pos: usize,
    original: &'a str,
}

impl<'a> FilterParser<'a> {
    fn error(&self, detail: &str) -> Error {
        Error::invalid_text(
            "filter",
            format!("{} at offset {} in {:?}", detail, self.pos, self.original),
        )
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, b: u8) -> Result<(), Error> {
        if self.peek() == Some(b) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected {:?}", b as char)))
        }
    }

    // filter = "(" filtercomp ")"
    fn parse_filter(&mut self) -> Result<Filter, Error> {
        self.expect(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.parse_filter_list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.parse_filter_list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.parse_filter()?))
            }
            Some(_) => {
                let end = self.find_close_paren()?;
                self.parse_item(end)?
            }
            None => return Err(self.error("unterminated filter")),
        };
        self.expect(b')')?;
        Ok(filter)
    }

    // filterlist = 1*filter
    fn parse_filter_list(&mut self) -> Result<Vec<Filter>, Error> {
        let mut children = Vec::new();
        while self.peek() == Some(b'(') {
            children.push(self.parse_filter()?);
        }
        if children.is_empty() {
            return Err(self.error("empty AND/OR filter list"));
        }
        Ok(children)
    }

    /// Position of the ')' closing the current item
    fn find_close_paren(&self) -> Result<usize, Error> {
        let mut i = self.pos;
        while i < self.input.len() {
            match self.input[i] {
                b')' => return Ok(i),
                b'(' => break,
                b'\\' => i += 3, // \NN
                _ => i += 1,
            }
        }
        Err(self.error("unterminated filter item"))
    }

    // item = simple / present / substring / extensible
    // operator detected by scanning the assertion for '=', '>=', '<=', '~=', ':='
    fn parse_item(&mut self, end: usize) -> Result<Filter, Error> {
        let eq = self.input[self.pos..end]
            .iter()
            .position(|&b| b == b'=')
            .map(|i| self.pos + i)
            .ok_or_else(|| self.error("missing '=' in filter item"))?;
        if eq == self.pos {
            return Err(self.error("missing attribute name"));
        }

        // character before '=' selects the operator
        let (attr_end, kind) = match self.input[eq - 1] {
            b'>' => (eq - 1, ItemKind::GreaterOrEqual),
            b'<' => (eq - 1, ItemKind::LessOrEqual),
            b'~' => (eq - 1, ItemKind::ApproxMatch),
            b':' => (eq, ItemKind::Extensible),
            _ => {
                // a ':' in the attribute portion only belongs to ":="
                if self.input[self.pos..eq].contains(&b':') {
                    return Err(self.error("malformed extensible match"));
                }
                (eq, ItemKind::Equality)
            }
        };

        if kind == ItemKind::Extensible {
            let head =
                std::str::from_utf8(&self.input[self.pos..eq - 1]).map_err(|_| {
                    self.error("invalid UTF-8 in extensible match")
                })?;
            let value = self.decode_value(eq + 1, end)?;
            self.pos = end;
            return self.build_extensible(head, value);
        }

        let attr = std::str::from_utf8(&self.input[self.pos..attr_end])
            .map_err(|_| self.error("invalid UTF-8 in attribute name"))?
            .trim()
            .to_string();
        if attr.is_empty() {
            return Err(self.error("missing attribute name"));
        }

        let value_start = eq + 1;
        match kind {
            ItemKind::Equality => {
                // presence if the RHS is exactly a single asterisk
                if &self.input[value_start..end] == b"*" {
                    self.pos = end;
                    return Ok(Filter::Present(LdapString(attr)));
                }
                // substring if the RHS contains an unescaped asterisk
                if self.contains_unescaped_star(value_start, end) {
                    let segments = self.split_on_stars(value_start, end)?;
                    self.pos = end;
                    return self.build_substrings(attr, segments);
                }
                let value = self.decode_value(value_start, end)?;
                self.pos = end;
                Ok(Filter::EqualityMatch(AttributeValueAssertion {
                    attribute_desc: LdapString(attr),
                    assertion_value: value,
                }))
            }
            ItemKind::GreaterOrEqual | ItemKind::LessOrEqual | ItemKind::ApproxMatch => {
                let value = self.decode_value(value_start, end)?;
                self.pos = end;
                let ava = AttributeValueAssertion {
                    attribute_desc: LdapString(attr),
                    assertion_value: value,
                };
                Ok(match kind {
                    ItemKind::GreaterOrEqual => Filter::GreaterOrEqual(ava),
                    ItemKind::LessOrEqual => Filter::LessOrEqual(ava),
                    _ => Filter::ApproxMatch(ava),
                })
            }
            ItemKind::Extensible => unreachable!(),
        }
    }

    // extensible = ( attr [dnattrs] [matchingrule] ":=" assertionvalue )
    //              / ( [dnattrs] matchingrule ":=" assertionvalue )
    fn build_extensible(&self, head: &str, value: Vec<u8>) -> Result<Filter, Error> {
        let mut parts = head.split(':');
        let attr = parts.next().unwrap_or("");
        let mut dn_attributes = None;
        let mut matching_rule = None;
        for part in parts {
            if part.eq_ignore_ascii_case("dn") {
                dn_attributes = Some(true);
            } else if !part.is_empty() && matching_rule.is_none() {
                matching_rule = Some(LdapString(part.to_string()));
            } else {
                return Err(self.error("malformed extensible match"));
            }
        }
        if attr.is_empty() && matching_rule.is_none() {
            return Err(self.error("extensible match needs an attribute or a matching rule"));
        }
        Ok(Filter::ExtensibleMatch(MatchingRuleAssertion {
            matching_rule,
            rule_type: if attr.is_empty() {
                None
            } else {
                Some(AttributeDescription(attr.to_string()))
            },
            assertion_value: AssertionValue(value),
            dn_attributes,
        }))
    }

    fn build_substrings(
        &self,
        attr: String,
        segments: Vec<Option<Vec<u8>>>,
    ) -> Result<Filter, Error> {
        // segments: text between asterisks; None marks an empty segment
        let n = segments.len();
        let mut substrings = Vec::new();
        for (i, segment) in segments.into_iter().enumerate() {
            match segment {
                Some(bytes) => {
                    let value = AssertionValue(bytes);
                    let sub = if i == 0 {
                        Substring::Initial(value)
                    } else if i == n - 1 {
                        Substring::Final(value)
                    } else {
                        Substring::Any(value)
                    };
                    substrings.push(sub);
                }
                None => {
                    // leading/trailing stars simply omit initial/final
                    if i != 0 && i != n - 1 {
                        return Err(self.error("empty substring component"));
                    }
                }
            }
        }
        Ok(Filter::Substrings(SubstringFilter {
            filter_type: LdapString(attr),
            substrings,
        }))
    }

    fn contains_unescaped_star(&self, start: usize, end: usize) -> bool {
        let mut i = start;
        while i < end {
            match self.input[i] {
                b'*' => return true,
                b'\\' => i += 3,
                _ => i += 1,
            }
        }
        false
    }

    fn split_on_stars(&self, start: usize, end: usize) -> Result<Vec<Option<Vec<u8>>>, Error> {
        let mut segments = Vec::new();
        let mut current_start = start;
        let mut i = start;
        while i < end {
            match self.input[i] {
                b'*' => {
                    segments.push(self.segment(current_start, i)?);
                    i += 1;
                    current_start = i;
                }
                b'\\' => i += 3,
                _ => i += 1,
            }
        }
        segments.push(self.segment(current_start, end)?);
        Ok(segments)
    }

    fn segment(&self, start: usize, end: usize) -> Result<Option<Vec<u8>>, Error> {
        if start >= end {
            Ok(None)
        } else {
            self.decode_value(start, end).map(Some)
        }
    }

    /// Decode assertion-value escapes: backslash followed by two hex digits
    fn decode_value(&self, start: usize, end: usize) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(end - start);
        let mut i = start;
        while i < end {
            let b = self.input[i];
            match b {
                b'\\' => {
                    if i + 3 > end {
                        return Err(self.error("truncated hex escape"));
                    }
                    let hex = self
                        .input
                        .get(i + 1..i + 3)
                        .filter(|h| h.iter().all(u8::is_ascii_hexdigit))
                        .and_then(|h| std::str::from_utf8(h).ok())
                        .and_then(|h| u8::from_str_radix(h, 16).ok())
                        .ok_or_else(|| self.error("invalid hex escape"))?;
                    out.push(hex);
                    i += 3;
                }
                b'*' | b'(' | b')' => {
                    return Err(self.error("unescaped special character in value"))
                }
                _ => {
                    out.push(b);
                    i += 1;
                }
            }
        }
        Ok(out)
    }
}

#[derive(PartialEq, Clone, Copy)]
enum ItemKind {
    Equality,
    GreaterOrEqual,
    LessOrEqual,
    ApproxMatch,
    Extensible,
}

/// Escape an assertion value for the text form, normalizing to `\NN`
fn write_value(f: &mut fmt::Formatter<'_>, value: &[u8]) -> fmt::Result {
    for &b in value {
        match b {
            b'*' | b'(' | b')' | b'\\' | 0x00 => write!(f, "\\{:02x}", b)?,
            0x01..=0x1f | 0x7f..=0xff => write!(f, "\\{:02x}", b)?,
            _ => write!(f, "{}", b as char)?,
        }
    }
    Ok(())
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(children) => {
                f.write_str("(&")?;
                for child in children {
                    fmt::Display::fmt(child, f)?;
                }
                f.write_str(")")
            }
            Filter::Or(children) => {
                f.write_str("(|")?;
                for child in children {
                    fmt::Display::fmt(child, f)?;
                }
                f.write_str(")")
            }
            Filter::Not(child) => write!(f, "(!{})", child),
            Filter::EqualityMatch(ava) => {
                write!(f, "({}=", ava.attribute_desc.0)?;
                write_value(f, &ava.assertion_value)?;
                f.write_str(")")
            }
            Filter::GreaterOrEqual(ava) => {
                write!(f, "({}>=", ava.attribute_desc.0)?;
                write_value(f, &ava.assertion_value)?;
                f.write_str(")")
            }
            Filter::LessOrEqual(ava) => {
                write!(f, "({}<=", ava.attribute_desc.0)?;
                write_value(f, &ava.assertion_value)?;
                f.write_str(")")
            }
            Filter::ApproxMatch(ava) => {
                write!(f, "({}~=", ava.attribute_desc.0)?;
                write_value(f, &ava.assertion_value)?;
                f.write_str(")")
            }
            Filter::Present(attr) => write!(f, "({}=*)", attr.0),
            Filter::Substrings(sub) => {
                write!(f, "({}=", sub.filter_type.0)?;
                let mut wrote_initial = false;
                for (i, substring) in sub.substrings.iter().enumerate() {
                    match substring {
                        Substring::Initial(v) => {
                            write_value(f, &v.0)?;
                            f.write_str("*")?;
                            wrote_initial = true;
                        }
                        Substring::Any(v) => {
                            if i == 0 && !wrote_initial {
                                f.write_str("*")?;
                            }
                            write_value(f, &v.0)?;
                            f.write_str("*")?;
                        }
                        Substring::Final(v) => {
                            if i == 0 && !wrote_initial {
                                f.write_str("*")?;
                            }
                            write_value(f, &v.0)?;
                        }
                    }
                }
                f.write_str(")")
            }
            Filter::ExtensibleMatch(mra) => {
                f.write_str("(")?;
                if let Some(rule_type) = &mra.rule_type {
                    f.write_str(&rule_type.0)?;
                }
                if mra.dn_attributes == Some(true) {
                    f.write_str(":dn")?;
                }
                if let Some(rule) = &mra.matching_rule {
                    write!(f, ":{}", rule.0)?;
                }
                f.write_str(":=")?;
                write_value(f, &mra.assertion_value.0)?;
                f.write_str(")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Filter {
        parse_filter(s).expect("parsing failed")
    }

    #[test]
    fn test_parse_present() {
        assert_eq!(parse("(objectClass=*)"), Filter::present("objectClass"));
    }

    #[test]
    fn test_parse_equality() {
        assert_eq!(parse("(cn=Jane)"), Filter::equality("cn", b"Jane"));
    }

    #[test]
    fn test_parse_relational() {
        assert_eq!(
            parse("(uidNumber>=1000)"),
            Filter::GreaterOrEqual(AttributeValueAssertion::new("uidNumber", b"1000"))
        );
        assert_eq!(
            parse("(uidNumber<=2000)"),
            Filter::LessOrEqual(AttributeValueAssertion::new("uidNumber", b"2000"))
        );
        assert_eq!(
            parse("(cn~=jane)"),
            Filter::ApproxMatch(AttributeValueAssertion::new("cn", b"jane"))
        );
    }

    #[test]
    fn test_parse_composite() {
        let filter = parse("(&(objectClass=person)(|(cn=Jane*)(sn=Doe)))");
        let expected = Filter::And(vec![
            Filter::equality("objectClass", b"person"),
            Filter::Or(vec![
                Filter::Substrings(SubstringFilter {
                    filter_type: LdapString("cn".to_string()),
                    substrings: vec![Substring::Initial(AssertionValue(b"Jane".to_vec()))],
                }),
                Filter::equality("sn", b"Doe"),
            ]),
        ]);
        assert_eq!(filter, expected);

        // serialize and re-parse: structurally equal
        let reparsed = parse(&filter.to_string());
        assert!(reparsed.eq_ignoring_child_order(&filter));
    }

    #[test]
    fn test_parse_not() {
        assert_eq!(
            parse("(!(cn=Jane))"),
            Filter::Not(Box::new(Filter::equality("cn", b"Jane")))
        );
    }

    #[test]
    fn test_parse_substrings() {
        let filter = parse("(cn=Ja*n*e)");
        assert_eq!(
            filter,
            Filter::Substrings(SubstringFilter {
                filter_type: LdapString("cn".to_string()),
                substrings: vec![
                    Substring::Initial(AssertionValue(b"Ja".to_vec())),
                    Substring::Any(AssertionValue(b"n".to_vec())),
                    Substring::Final(AssertionValue(b"e".to_vec())),
                ],
            })
        );
        assert_eq!(filter.to_string(), "(cn=Ja*n*e)");

        assert_eq!(parse("(cn=*ane)").to_string(), "(cn=*ane)");
        assert_eq!(parse("(cn=Jan*)").to_string(), "(cn=Jan*)");
        assert_eq!(parse("(cn=*a*)").to_string(), "(cn=*a*)");
    }

    #[test]
    fn test_parse_escapes() {
        // escaped asterisk is a literal in an equality value
        assert_eq!(parse("(cn=a\\2ab)"), Filter::equality("cn", b"a*b"));
        // escaped parenthesis
        assert_eq!(parse("(cn=a\\28b\\29)"), Filter::equality("cn", b"a(b)"));
        // emit normalizes to hex form
        assert_eq!(
            Filter::equality("cn", b"a*b").to_string(),
            "(cn=a\\2ab)"
        );
    }

    #[test]
    fn test_parse_extensible() {
        assert_eq!(
            parse("(cn:dn:2.5.13.2:=Jane)"),
            Filter::ExtensibleMatch(MatchingRuleAssertion {
                matching_rule: Some(LdapString("2.5.13.2".to_string())),
                rule_type: Some(AttributeDescription("cn".to_string())),
                assertion_value: AssertionValue(b"Jane".to_vec()),
                dn_attributes: Some(true),
            })
        );
        assert_eq!(
            parse("(:2.5.13.2:=Jane)"),
            Filter::ExtensibleMatch(MatchingRuleAssertion {
                matching_rule: Some(LdapString("2.5.13.2".to_string())),
                rule_type: None,
                assertion_value: AssertionValue(b"Jane".to_vec()),
                dn_attributes: None,
            })
        );
        let f = parse("(cn:dn:2.5.13.2:=Jane)");
        assert_eq!(parse(&f.to_string()), f);
    }

    #[test]
    fn test_parse_bare_item() {
        assert_eq!(parse("objectClass=person"), Filter::equality("objectClass", b"person"));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_filter("(cn=Jane").is_err());
        assert!(parse_filter("(&)").is_err());
        assert!(parse_filter("(=x)").is_err());
        assert!(parse_filter("(cn=a(b)").is_err());
        assert!(parse_filter("(cn=a\\zzb)").is_err());
        assert!(parse_filter("()").is_err());
    }

    #[test]
    fn test_roundtrip_preserves_structure() {
        for s in [
            "(objectClass=*)",
            "(&(a=1)(b=2)(c=3))",
            "(|(!(a=1))(b>=2))",
            "(cn=Ja*n*e)",
            "(cn:dn:=x)",
        ] {
            let f = parse(s);
            assert_eq!(parse(&f.to_string()), f, "roundtrip of {}", s);
        }
    }
}
