//! Definition for types used in LDAP filters

use crate::ldap::LdapString;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    EqualityMatch(AttributeValueAssertion),
    Substrings(SubstringFilter),
    GreaterOrEqual(AttributeValueAssertion),
    LessOrEqual(AttributeValueAssertion),
    Present(LdapString),
    ApproxMatch(AttributeValueAssertion),
    ExtensibleMatch(MatchingRuleAssertion),
}

impl Filter {
    /// Presence filter for the given attribute
    pub fn present(attr: &str) -> Self {
        Filter::Present(LdapString(attr.to_string()))
    }

    /// Equality filter `attr = value`
    pub fn equality(attr: &str, value: &[u8]) -> Self {
        Filter::EqualityMatch(AttributeValueAssertion::new(attr, value))
    }

    /// Structural equality up to AND/OR child ordering.
    ///
    /// AND and OR carry an unordered set of children: two filters whose
    /// children are permutations of each other are considered equal. All
    /// other variants compare field-by-field.
    pub fn eq_ignoring_child_order(&self, other: &Filter) -> bool {
        match (self, other) {
            (Filter::And(a), Filter::And(b)) | (Filter::Or(a), Filter::Or(b)) => {
                if a.len() != b.len() {
                    return false;
                }
                let mut remaining: Vec<&Filter> = b.iter().collect();
                for f in a {
                    match remaining
                        .iter()
                        .position(|g| f.eq_ignoring_child_order(g))
                    {
                        Some(idx) => {
                            remaining.swap_remove(idx);
                        }
                        None => return false,
                    }
                }
                true
            }
            (Filter::Not(a), Filter::Not(b)) => a.eq_ignoring_child_order(b),
            _ => self == other,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartialAttribute {
    pub attr_type: LdapString,
    pub attr_vals: Vec<AttributeValue>,
}

impl PartialAttribute {
    pub fn new(attr_type: &str, attr_vals: &[&[u8]]) -> Self {
        PartialAttribute {
            attr_type: LdapString(attr_type.to_string()),
            attr_vals: attr_vals
                .iter()
                .map(|v| AttributeValue(v.to_vec()))
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Attribute {
    pub attr_type: LdapString,
    pub attr_vals: Vec<AttributeValue>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttributeValueAssertion {
    pub attribute_desc: LdapString,
    pub assertion_value: Vec<u8>,
}

impl AttributeValueAssertion {
    pub fn new(attribute_desc: &str, assertion_value: &[u8]) -> Self {
        AttributeValueAssertion {
            attribute_desc: LdapString(attribute_desc.to_string()),
            assertion_value: assertion_value.to_vec(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttributeDescription(pub String);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MatchingRuleAssertion {
    pub matching_rule: Option<LdapString>,
    pub rule_type: Option<AttributeDescription>,
    pub assertion_value: AssertionValue,
    pub dn_attributes: Option<bool>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MatchingRuleId(pub String);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubstringFilter {
    pub filter_type: LdapString,
    pub substrings: Vec<Substring>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Substring {
    Initial(AssertionValue),
    Any(AssertionValue),
    Final(AssertionValue),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AssertionValue(pub Vec<u8>);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttributeValue(pub Vec<u8>);

#[cfg(test)]
mod tests {
    use super::*;

    fn eq(attr: &str, val: &str) -> Filter {
        Filter::equality(attr, val.as_bytes())
    }

    #[test]
    fn test_and_children_unordered() {
        let a = Filter::And(vec![eq("cn", "x"), eq("sn", "y"), Filter::present("uid")]);
        let b = Filter::And(vec![Filter::present("uid"), eq("cn", "x"), eq("sn", "y")]);
        assert!(a.eq_ignoring_child_order(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_and_children_multiset() {
        // {x, x, y} != {x, y, y}
        let a = Filter::And(vec![eq("cn", "x"), eq("cn", "x"), eq("cn", "y")]);
        let b = Filter::And(vec![eq("cn", "x"), eq("cn", "y"), eq("cn", "y")]);
        assert!(!a.eq_ignoring_child_order(&b));
    }

    #[test]
    fn test_nested_unordered() {
        let a = Filter::Not(Box::new(Filter::Or(vec![eq("a", "1"), eq("b", "2")])));
        let b = Filter::Not(Box::new(Filter::Or(vec![eq("b", "2"), eq("a", "1")])));
        assert!(a.eq_ignoring_child_order(&b));
    }
}
