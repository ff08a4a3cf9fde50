//! Distinguished-name string codec (RFC 4514)
//!
//! Parses the canonical string form into a structured [`Dn`] and prints it
//! back with canonical escaping. Equality is a trimmed, case-folded string
//! comparison on attribute names and values: enough for routing decisions,
//! not a full X.500 matching-rule evaluation.

use crate::error::Error;
use std::fmt;
use std::str::FromStr;

/// Characters that must be backslash-escaped anywhere in an RDN value
const ESCAPED_CHARS: &[char] = &['"', '+', ',', ';', '<', '>', '\\'];

/// One attribute-value pair inside an RDN
#[derive(Debug, Clone)]
pub struct Ava {
    pub attribute: String,
    pub value: String,
}

impl Ava {
    pub fn new(attribute: &str, value: &str) -> Self {
        Ava {
            attribute: attribute.to_string(),
            value: value.to_string(),
        }
    }

    fn normalized(&self) -> (String, String) {
        (
            self.attribute.trim().to_ascii_lowercase(),
            self.value.trim().to_lowercase(),
        )
    }
}

impl PartialEq for Ava {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for Ava {}

/// A relative distinguished name: an unordered set of attribute-value pairs
#[derive(Debug, Clone)]
pub struct Rdn {
    pub avas: Vec<Ava>,
}

impl Rdn {
    pub fn single(attribute: &str, value: &str) -> Self {
        Rdn {
            avas: vec![Ava::new(attribute, value)],
        }
    }

    /// Parse one RDN (no unescaped commas allowed)
    pub fn parse(s: &str) -> Result<Rdn, Error> {
        let dn = Dn::parse(s)?;
        if dn.rdns.len() != 1 {
            return Err(Error::invalid_text("RDN", format!("not a single RDN: {:?}", s)));
        }
        Ok(dn.rdns.into_iter().next().unwrap())
    }
}

impl PartialEq for Rdn {
    fn eq(&self, other: &Self) -> bool {
        // multi-valued RDNs are unordered
        if self.avas.len() != other.avas.len() {
            return false;
        }
        let mut remaining: Vec<&Ava> = other.avas.iter().collect();
        for ava in &self.avas {
            match remaining.iter().position(|o| *o == ava) {
                Some(idx) => {
                    remaining.swap_remove(idx);
                }
                None => return false,
            }
        }
        true
    }
}

impl Eq for Rdn {}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, ava) in self.avas.iter().enumerate() {
            if i > 0 {
                f.write_str("+")?;
            }
            write!(f, "{}={}", ava.attribute, escape_value(&ava.value))?;
        }
        Ok(())
    }
}

/// A distinguished name: a sequence of RDNs, most specific first
#[derive(Debug, Clone, Default)]
pub struct Dn {
    pub rdns: Vec<Rdn>,
}

impl Dn {
    /// The zero-RDN name (the root DSE)
    pub fn empty() -> Self {
        Dn { rdns: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.rdns.is_empty()
    }

    /// The DN with the leading RDN removed, or `None` at the root
    pub fn parent(&self) -> Option<Dn> {
        if self.rdns.is_empty() {
            None
        } else {
            Some(Dn {
                rdns: self.rdns[1..].to_vec(),
            })
        }
    }

    /// Parse the canonical string form.
    ///
    /// Whitespace around `=` and `,` is accepted and normalized away;
    /// escaped characters (including `\NN` hex pairs) are decoded; a value
    /// beginning with `#` (BER hex form) is preserved literally.
    pub fn parse(s: &str) -> Result<Dn, Error> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Dn::empty());
        }
        let mut rdns = Vec::new();
        let mut avas = Vec::new();
        let mut chars = s.chars().peekable();
        loop {
            let ava = parse_ava(&mut chars, s)?;
            avas.push(ava);
            match chars.next() {
                Some('+') => continue,
                Some(',') => {
                    rdns.push(Rdn { avas: std::mem::take(&mut avas) });
                    continue;
                }
                None => {
                    rdns.push(Rdn { avas });
                    break;
                }
                Some(c) => {
                    return Err(Error::invalid_text(
                        "DN",
                        format!("unexpected character {:?} in {:?}", c, s),
                    ))
                }
            }
        }
        Ok(Dn { rdns })
    }
}

impl FromStr for Dn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dn::parse(s)
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.rdns == other.rdns
    }
}

impl Eq for Dn {}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rdn) in self.rdns.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            fmt::Display::fmt(rdn, f)?;
        }
        Ok(())
    }
}

fn parse_ava(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    original: &str,
) -> Result<Ava, Error> {
    // attribute name, up to '='
    let mut attribute = String::new();
    loop {
        match chars.next() {
            Some('=') => break,
            Some(c) if c == ',' || c == '+' => {
                return Err(Error::invalid_text(
                    "DN",
                    format!("attribute without value in {:?}", original),
                ))
            }
            Some(c) => attribute.push(c),
            None => {
                return Err(Error::invalid_text(
                    "DN",
                    format!("missing '=' in {:?}", original),
                ))
            }
        }
    }
    let attribute = attribute.trim().to_string();
    if attribute.is_empty() {
        return Err(Error::invalid_text(
            "DN",
            format!("empty attribute name in {:?}", original),
        ));
    }

    // value, up to an unescaped ',' or '+'
    let mut bytes: Vec<u8> = Vec::new();
    // length of the value up to the last character that cannot be trimmed
    let mut keep = 0;
    let mut started = false;
    let mut utf8 = [0u8; 4];
    while let Some(&c) = chars.peek() {
        if c == ',' || c == '+' {
            break;
        }
        chars.next();
        if c == '\\' {
            let escaped = decode_escape(chars, original)?;
            bytes.push(escaped);
            started = true;
            keep = bytes.len();
        } else if c == ' ' {
            if started {
                // kept only if a significant character follows
                bytes.push(b' ');
            }
            // leading unescaped spaces are skipped
        } else {
            bytes.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
            started = true;
            keep = bytes.len();
        }
    }
    bytes.truncate(keep);
    let value = String::from_utf8(bytes)
        .map_err(|_| Error::invalid_text("DN", format!("invalid UTF-8 value in {:?}", original)))?;
    Ok(Ava { attribute, value })
}

fn decode_escape(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    original: &str,
) -> Result<u8, Error> {
    let c = chars.next().ok_or_else(|| {
        Error::invalid_text("DN", format!("dangling backslash in {:?}", original))
    })?;
    if c.is_ascii_hexdigit() {
        // \NN hex pair
        let lo = chars.next().filter(|c| c.is_ascii_hexdigit()).ok_or_else(|| {
            Error::invalid_text("DN", format!("truncated hex escape in {:?}", original))
        })?;
        let hi = c.to_digit(16).unwrap() as u8;
        let lo = lo.to_digit(16).unwrap() as u8;
        Ok((hi << 4) | lo)
    } else if c.is_ascii() {
        Ok(c as u8)
    } else {
        Err(Error::invalid_text(
            "DN",
            format!("invalid escape {:?} in {:?}", c, original),
        ))
    }
}

/// Escape an RDN value for the canonical string form
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let last = value.chars().count().saturating_sub(1);
    for (i, c) in value.chars().enumerate() {
        let leading = i == 0;
        let trailing = i == last;
        if ESCAPED_CHARS.contains(&c)
            || (leading && (c == ' ' || c == '#'))
            || (trailing && c == ' ')
        {
            out.push('\\');
            out.push(c);
        } else if c.is_control() {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).as_bytes() {
                out.push_str(&format!("\\{:02x}", b));
            }
        } else {
            out.push(c);
        }
    }
    out
}
