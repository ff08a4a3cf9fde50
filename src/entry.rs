//! Directory entries
//!
//! An [`Entry`] is a distinguished name plus an ordered collection of
//! attributes. Attribute names are compared case-insensitively but written
//! case-preserving; values are ordered and duplicate-suppressed.

use crate::filter::{Attribute as WireAttribute, AttributeValue, PartialAttribute};
use crate::ldap::{LdapDN, LdapString, SearchResultEntry};

/// A named attribute with its values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    name: String,
    values: Vec<Vec<u8>>,
}

impl Attribute {
    pub fn new(name: &str) -> Self {
        Attribute {
            name: name.to_string(),
            values: Vec::new(),
        }
    }

    pub fn with_values<T: AsRef<[u8]>>(name: &str, values: &[T]) -> Self {
        let mut attr = Attribute::new(name);
        for value in values {
            attr.add_value(value.as_ref());
        }
        attr
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when `name` matches this attribute's name, ignoring ASCII case
    pub fn has_name(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    pub fn values(&self) -> &[Vec<u8>] {
        &self.values
    }

    /// Values that are valid UTF-8, lossy otherwise
    pub fn string_values(&self) -> Vec<String> {
        self.values
            .iter()
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    pub fn first_value(&self) -> Option<&[u8]> {
        self.values.first().map(|v| v.as_slice())
    }

    /// Append a value unless an identical one is already present
    pub fn add_value(&mut self, value: &[u8]) -> bool {
        if self.values.iter().any(|v| v == value) {
            return false;
        }
        self.values.push(value.to_vec());
        true
    }

    pub fn remove_value(&mut self, value: &[u8]) -> bool {
        match self.values.iter().position(|v| v == value) {
            Some(idx) => {
                self.values.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }
}

/// A directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    dn: String,
    attributes: Vec<Attribute>,
}

impl Entry {
    pub fn new(dn: &str) -> Self {
        Entry {
            dn: dn.to_string(),
            attributes: Vec::new(),
        }
    }

    pub fn dn(&self) -> &str {
        &self.dn
    }

    pub fn set_dn(&mut self, dn: &str) {
        self.dn = dn.to_string();
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Look up an attribute by name, ignoring ASCII case
    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.has_name(name))
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Add values to an attribute, creating it if absent. Returns the number
    /// of values actually added (duplicates are suppressed).
    pub fn add<T: AsRef<[u8]>>(&mut self, name: &str, values: &[T]) -> usize {
        let idx = match self.attributes.iter().position(|a| a.has_name(name)) {
            Some(idx) => idx,
            None => {
                self.attributes.push(Attribute::new(name));
                self.attributes.len() - 1
            }
        };
        let attr = &mut self.attributes[idx];
        values
            .iter()
            .filter(|v| attr.add_value(v.as_ref()))
            .count()
    }

    /// Remove the whole attribute
    pub fn remove(&mut self, name: &str) -> Option<Attribute> {
        let idx = self.attributes.iter().position(|a| a.has_name(name))?;
        Some(self.attributes.remove(idx))
    }

    /// First value of the named attribute, as a string
    pub fn get_value(&self, name: &str) -> Option<String> {
        self.get(name)
            .and_then(Attribute::first_value)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }
}

impl From<SearchResultEntry> for Entry {
    fn from(wire: SearchResultEntry) -> Self {
        let mut entry = Entry::new(&wire.object_name.0);
        for attr in wire.attributes {
            let values: Vec<Vec<u8>> = attr.attr_vals.into_iter().map(|v| v.0).collect();
            entry.add(&attr.attr_type.0, &values);
        }
        entry
    }
}

impl From<&Entry> for SearchResultEntry {
    fn from(entry: &Entry) -> Self {
        SearchResultEntry {
            object_name: LdapDN(entry.dn.clone()),
            attributes: entry
                .attributes
                .iter()
                .map(|attr| PartialAttribute {
                    attr_type: LdapString(attr.name.clone()),
                    attr_vals: attr
                        .values
                        .iter()
                        .map(|v| AttributeValue(v.clone()))
                        .collect(),
                })
                .collect(),
        }
    }
}

impl From<&Entry> for Vec<WireAttribute> {
    fn from(entry: &Entry) -> Self {
        entry
            .attributes
            .iter()
            .map(|attr| WireAttribute {
                attr_type: LdapString(attr.name.clone()),
                attr_vals: attr
                    .values
                    .iter()
                    .map(|v| AttributeValue(v.clone()))
                    .collect(),
            })
            .collect()
    }
}
