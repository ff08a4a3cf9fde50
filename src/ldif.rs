//! LDIF reader and writer (RFC 2849)
//!
//! Line-oriented records separated by blank lines; continuation lines start
//! with a single space. Values are plain (`name: value`), base64
//! (`name:: encoded`) or URL references (`name:< url`, `file://` only).

use crate::entry::Entry;
use crate::error::Error;
use crate::ldap::Operation;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::io::Write;

const WRAP_COLUMN: usize = 76;

/// One record of an LDIF stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LdifRecord {
    /// A plain entry record
    Entry(Entry),
    /// A change record (`changetype:` present)
    Change(ChangeRecord),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub dn: String,
    pub change: LdifChange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LdifChange {
    Add(Entry),
    Delete,
    Modify(Vec<ModifySpec>),
    ModDn {
        newrdn: String,
        deleteoldrdn: bool,
        newsuperior: Option<String>,
    },
}

/// One `add/delete/replace/increment: attr` group of a modify change record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifySpec {
    pub operation: Operation,
    pub attribute: String,
    pub values: Vec<Vec<u8>>,
}

/// Parse a whole LDIF stream into records
pub fn parse_ldif(input: &str) -> Result<Vec<LdifRecord>, Error> {
    let mut lines = unfold_lines(input);
    // optional version-spec line ahead of the first record
    if lines
        .first()
        .and_then(|l| l.text.split(':').next())
        .map(|n| n.trim().eq_ignore_ascii_case("version"))
        .unwrap_or(false)
    {
        lines.remove(0);
    }
    let mut records = Vec::new();
    let mut record: Vec<&UnfoldedLine> = Vec::new();
    for line in &lines {
        if line.text.is_empty() {
            if !record.is_empty() {
                records.push(parse_record(&record)?);
                record.clear();
            }
        } else {
            record.push(line);
        }
    }
    if !record.is_empty() {
        records.push(parse_record(&record)?);
    }
    Ok(records)
}

struct UnfoldedLine {
    text: String,
    number: usize,
}

/// Join continuation lines and drop comments
fn unfold_lines(input: &str) -> Vec<UnfoldedLine> {
    let mut out: Vec<UnfoldedLine> = Vec::new();
    let mut in_comment = false;
    for (idx, raw) in input.lines().enumerate() {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(continuation) = line.strip_prefix(' ') {
            if in_comment {
                continue;
            }
            if let Some(last) = out.last_mut() {
                last.text.push_str(continuation);
            }
            continue;
        }
        in_comment = line.starts_with('#');
        if in_comment {
            continue;
        }
        out.push(UnfoldedLine {
            text: line.to_string(),
            number: idx + 1,
        });
    }
    out
}

fn line_error(line: &UnfoldedLine, detail: &str) -> Error {
    Error::invalid_text("LDIF", format!("line {}: {}", line.number, detail))
}

/// Split a line into attribute name and decoded value
fn parse_attr_line(line: &UnfoldedLine) -> Result<(String, Vec<u8>), Error> {
    let colon = line
        .text
        .find(':')
        .ok_or_else(|| line_error(line, "missing ':'"))?;
    let name = line.text[..colon].trim().to_string();
    if name.is_empty() {
        return Err(line_error(line, "empty attribute name"));
    }
    let rest = &line.text[colon + 1..];
    let value = if let Some(encoded) = rest.strip_prefix(':') {
        BASE64
            .decode(encoded.trim())
            .map_err(|e| line_error(line, &format!("bad base64: {}", e)))?
    } else if let Some(url) = rest.strip_prefix('<') {
        read_url_value(url.trim()).map_err(|e| line_error(line, &format!("bad URL value: {}", e)))?
    } else {
        rest.strip_prefix(' ').unwrap_or(rest).as_bytes().to_vec()
    };
    Ok((name, value))
}

fn read_url_value(spec: &str) -> Result<Vec<u8>, String> {
    let url = url::Url::parse(spec).map_err(|e| e.to_string())?;
    if url.scheme() != "file" {
        return Err(format!("unsupported URL scheme {:?}", url.scheme()));
    }
    let path = url
        .to_file_path()
        .map_err(|_| "not a local file path".to_string())?;
    std::fs::read(path).map_err(|e| e.to_string())
}

fn utf8_value(line: &UnfoldedLine, value: Vec<u8>) -> Result<String, Error> {
    String::from_utf8(value).map_err(|_| line_error(line, "value is not valid UTF-8"))
}

fn parse_record(lines: &[&UnfoldedLine]) -> Result<LdifRecord, Error> {
    let first = lines[0];
    let (name, dn_value) = parse_attr_line(first)?;
    if !name.eq_ignore_ascii_case("dn") {
        return Err(line_error(first, "record does not start with dn:"));
    }
    let dn = utf8_value(first, dn_value)?;

    let body = &lines[1..];
    let is_change = body
        .first()
        .map(|l| {
            l.text
                .split(':')
                .next()
                .map(|n| n.trim().eq_ignore_ascii_case("changetype"))
                .unwrap_or(false)
        })
        .unwrap_or(false);
    if !is_change {
        let mut entry = Entry::new(&dn);
        for line in body {
            let (name, value) = parse_attr_line(line)?;
            entry.add(&name, &[value]);
        }
        return Ok(LdifRecord::Entry(entry));
    }

    let (_, kind) = parse_attr_line(body[0])?;
    let kind = utf8_value(body[0], kind)?;
    let rest = &body[1..];
    let change = match kind.to_ascii_lowercase().as_str() {
        "add" => {
            let mut entry = Entry::new(&dn);
            for line in rest {
                let (name, value) = parse_attr_line(line)?;
                entry.add(&name, &[value]);
            }
            LdifChange::Add(entry)
        }
        "delete" => {
            if let Some(line) = rest.first() {
                return Err(line_error(line, "unexpected data after changetype: delete"));
            }
            LdifChange::Delete
        }
        "modify" => LdifChange::Modify(parse_modify_body(rest)?),
        "moddn" | "modrdn" => parse_moddn_body(body[0], rest)?,
        other => {
            return Err(line_error(
                body[0],
                &format!("unknown changetype {:?}", other),
            ))
        }
    };
    Ok(LdifRecord::Change(ChangeRecord { dn, change }))
}

fn parse_modify_body(lines: &[&UnfoldedLine]) -> Result<Vec<ModifySpec>, Error> {
    let mut specs = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let header = lines[i];
        let (op_name, attr) = parse_attr_line(header)?;
        let operation = match op_name.to_ascii_lowercase().as_str() {
            "add" => Operation::Add,
            "delete" => Operation::Delete,
            "replace" => Operation::Replace,
            "increment" => Operation::Increment,
            other => {
                return Err(line_error(
                    header,
                    &format!("unknown modify operation {:?}", other),
                ))
            }
        };
        let attribute = utf8_value(header, attr)?;
        let mut values = Vec::new();
        i += 1;
        // values until the '-' terminator (optional on the final group)
        while i < lines.len() {
            if lines[i].text == "-" {
                i += 1;
                break;
            }
            let (name, value) = parse_attr_line(lines[i])?;
            if !name.eq_ignore_ascii_case(&attribute) {
                return Err(line_error(
                    lines[i],
                    &format!("value for {:?} inside {:?} group", name, attribute),
                ));
            }
            values.push(value);
            i += 1;
        }
        specs.push(ModifySpec {
            operation,
            attribute,
            values,
        });
    }
    Ok(specs)
}

fn parse_moddn_body(header: &UnfoldedLine, lines: &[&UnfoldedLine]) -> Result<LdifChange, Error> {
    let mut newrdn = None;
    let mut deleteoldrdn = None;
    let mut newsuperior = None;
    for line in lines {
        let (name, value) = parse_attr_line(line)?;
        let value = utf8_value(line, value)?;
        match name.to_ascii_lowercase().as_str() {
            "newrdn" => newrdn = Some(value),
            "deleteoldrdn" => {
                deleteoldrdn = Some(match value.trim() {
                    "0" => false,
                    "1" => true,
                    other => {
                        return Err(line_error(
                            line,
                            &format!("deleteoldrdn must be 0 or 1, got {:?}", other),
                        ))
                    }
                })
            }
            "newsuperior" => newsuperior = Some(value),
            other => {
                return Err(line_error(
                    line,
                    &format!("unexpected field {:?} in moddn record", other),
                ))
            }
        }
    }
    Ok(LdifChange::ModDn {
        newrdn: newrdn.ok_or_else(|| line_error(header, "moddn record without newrdn"))?,
        deleteoldrdn: deleteoldrdn
            .ok_or_else(|| line_error(header, "moddn record without deleteoldrdn"))?,
        newsuperior,
    })
}

/// True when the value must be base64-encoded on output
fn needs_base64(value: &[u8]) -> bool {
    if value.is_empty() {
        return false;
    }
    match value[0] {
        b' ' | b':' | b'<' => return true,
        _ => {}
    }
    if *value.last().unwrap() == b' ' {
        return true;
    }
    value
        .iter()
        .any(|&b| b == 0x00 || b == b'\r' || b == b'\n' || b < 0x20 || b >= 0x7f)
}

/// Streaming LDIF writer with 76-column folding
pub struct LdifWriter<W: Write> {
    out: W,
}

impl<W: Write> LdifWriter<W> {
    pub fn new(out: W) -> Self {
        LdifWriter { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_folded(&mut self, line: &str) -> std::io::Result<()> {
        let bytes = line.as_bytes();
        if bytes.len() <= WRAP_COLUMN {
            writeln!(self.out, "{}", line)?;
            return Ok(());
        }
        let mut start = 0;
        let mut width = WRAP_COLUMN;
        while start < bytes.len() {
            let mut end = (start + width).min(bytes.len());
            // never split inside a UTF-8 sequence
            while end < bytes.len() && bytes[end] & 0xc0 == 0x80 {
                end -= 1;
            }
            if start == 0 {
                writeln!(self.out, "{}", &line[start..end])?;
            } else {
                writeln!(self.out, " {}", &line[start..end])?;
            }
            start = end;
            // continuation lines lose one column to the leading space
            width = WRAP_COLUMN - 1;
        }
        Ok(())
    }

    fn write_attr(&mut self, name: &str, value: &[u8]) -> std::io::Result<()> {
        let line = if needs_base64(value) {
            format!("{}:: {}", name, BASE64.encode(value))
        } else {
            // guarded by needs_base64
            format!("{}: {}", name, std::str::from_utf8(value).unwrap())
        };
        self.write_folded(&line)
    }

    /// Write an entry record followed by a blank separator line
    pub fn write_entry(&mut self, entry: &Entry) -> std::io::Result<()> {
        self.write_attr("dn", entry.dn().as_bytes())?;
        for attr in entry.attributes() {
            for value in attr.values() {
                self.write_attr(attr.name(), value)?;
            }
        }
        writeln!(self.out)
    }

    /// Write a change record followed by a blank separator line
    pub fn write_change(&mut self, record: &ChangeRecord) -> std::io::Result<()> {
        self.write_attr("dn", record.dn.as_bytes())?;
        match &record.change {
            LdifChange::Add(entry) => {
                self.write_attr("changetype", b"add")?;
                for attr in entry.attributes() {
                    for value in attr.values() {
                        self.write_attr(attr.name(), value)?;
                    }
                }
            }
            LdifChange::Delete => self.write_attr("changetype", b"delete")?,
            LdifChange::Modify(specs) => {
                self.write_attr("changetype", b"modify")?;
                for spec in specs {
                    let op = match spec.operation {
                        Operation::Add => "add",
                        Operation::Delete => "delete",
                        Operation::Replace => "replace",
                        Operation::Increment => "increment",
                        _ => "replace",
                    };
                    self.write_attr(op, spec.attribute.as_bytes())?;
                    for value in &spec.values {
                        self.write_attr(&spec.attribute, value)?;
                    }
                    writeln!(self.out, "-")?;
                }
            }
            LdifChange::ModDn {
                newrdn,
                deleteoldrdn,
                newsuperior,
            } => {
                self.write_attr("changetype", b"moddn")?;
                self.write_attr("newrdn", newrdn.as_bytes())?;
                self.write_attr(
                    "deleteoldrdn",
                    if *deleteoldrdn { b"1" } else { b"0" },
                )?;
                if let Some(superior) = newsuperior {
                    self.write_attr("newsuperior", superior.as_bytes())?;
                }
            }
        }
        writeln!(self.out)
    }
}

/// Render entries as an LDIF string
pub fn to_ldif(entries: &[Entry]) -> String {
    let mut writer = LdifWriter::new(Vec::new());
    for entry in entries {
        // writes to Vec<u8> cannot fail
        writer.write_entry(entry).unwrap();
    }
    String::from_utf8(writer.into_inner()).unwrap()
}
