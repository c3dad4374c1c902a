//! Ordered, immutable addresses.

use crate::element::PathElement;
use crate::error::{AddressError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Wire form: a list of single-entry maps, `[{"subsystem": "logging"}]`.
type WireAddress = Vec<BTreeMap<String, String>>;

/// An ordered sequence of [`PathElement`]s with unique keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "WireAddress", into = "WireAddress")]
pub struct PathAddress {
    elements: Vec<PathElement>,
}

impl PathAddress {
    /// The root address.
    pub const EMPTY: Self = Self {
        elements: Vec::new(),
    };

    /// Build an address, rejecting duplicate keys.
    pub fn new(elements: impl IntoIterator<Item = PathElement>) -> Result<Self> {
        let elements: Vec<PathElement> = elements.into_iter().collect();
        let mut seen = HashSet::with_capacity(elements.len());
        for element in &elements {
            if !seen.insert(element.key()) {
                return Err(AddressError::DuplicateKey {
                    key: element.key().to_string(),
                });
            }
        }
        Ok(Self { elements })
    }

    /// Build an address from `(key, value)` pairs.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Result<Self>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let elements = pairs
            .into_iter()
            .map(|(k, v)| PathElement::new(k, v))
            .collect::<Result<Vec<_>>>()?;
        Self::new(elements)
    }

    /// Concatenate two addresses.
    ///
    /// Keys are not re-checked: duplication is only rejected within a
    /// single construction call.
    pub fn append(&self, other: &PathAddress) -> PathAddress {
        let mut elements = self.elements.clone();
        elements.extend(other.elements.iter().cloned());
        Self { elements }
    }

    pub fn append_element(&self, element: PathElement) -> PathAddress {
        let mut elements = self.elements.clone();
        elements.push(element);
        Self { elements }
    }

    /// Elements from `from` to the end.
    pub fn sub_address(&self, from: usize) -> PathAddress {
        self.sub_address_range(from, self.elements.len())
    }

    /// Elements in `from..to`, clamped to the address length.
    pub fn sub_address_range(&self, from: usize, to: usize) -> PathAddress {
        let to = to.min(self.elements.len());
        let from = from.min(to);
        Self {
            elements: self.elements[from..to].to_vec(),
        }
    }

    pub fn get(&self, index: usize) -> Option<&PathElement> {
        self.elements.get(index)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PathElement> {
        self.elements.iter()
    }

    pub fn elements(&self) -> &[PathElement] {
        &self.elements
    }

    pub fn last_element(&self) -> Option<&PathElement> {
        self.elements.last()
    }

    /// Address without its last element; the root is its own parent.
    pub fn parent(&self) -> PathAddress {
        self.sub_address_range(0, self.elements.len().saturating_sub(1))
    }

    /// Whether any element is a wildcard.
    pub fn is_multi_target(&self) -> bool {
        self.elements.iter().any(PathElement::is_wildcard)
    }

    /// Same length and every element matches, wildcards included.
    pub fn matches(&self, pattern: &PathAddress) -> bool {
        self.len() == pattern.len() && self.starts_with(pattern)
    }

    /// Wildcard-aware prefix test.
    pub fn starts_with(&self, prefix: &PathAddress) -> bool {
        prefix.len() <= self.len()
            && prefix
                .elements
                .iter()
                .zip(&self.elements)
                .all(|(p, e)| p.matches(e))
    }

    /// A bidirectional cursor positioned before the first element.
    pub fn cursor(&self) -> PathCursor<'_> {
        PathCursor {
            elements: &self.elements,
            position: 0,
        }
    }
}

impl fmt::Display for PathAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.elements.is_empty() {
            return f.write_str("/");
        }
        for element in &self.elements {
            write!(f, "/{element}")?;
        }
        Ok(())
    }
}

impl FromStr for PathAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed == "/" {
            return Ok(Self::EMPTY);
        }
        let Some(body) = trimmed.strip_prefix('/') else {
            return Err(AddressError::Malformed {
                input: s.to_string(),
                reason: "address must start with '/'".to_string(),
            });
        };
        let elements = body
            .split('/')
            .map(str::parse::<PathElement>)
            .collect::<Result<Vec<_>>>()?;
        Self::new(elements)
    }
}

impl<'a> IntoIterator for &'a PathAddress {
    type Item = &'a PathElement;
    type IntoIter = std::slice::Iter<'a, PathElement>;

    fn into_iter(self) -> Self::IntoIter {
        self.elements.iter()
    }
}

impl TryFrom<WireAddress> for PathAddress {
    type Error = AddressError;

    fn try_from(wire: WireAddress) -> Result<Self> {
        let mut elements = Vec::with_capacity(wire.len());
        for entry in wire {
            if entry.len() != 1 {
                return Err(AddressError::Malformed {
                    input: format!("{entry:?}"),
                    reason: "each address entry must hold exactly one key".to_string(),
                });
            }
            for (key, value) in entry {
                elements.push(PathElement::new(key, value)?);
            }
        }
        Self::new(elements)
    }
}

impl From<PathAddress> for WireAddress {
    fn from(address: PathAddress) -> Self {
        address
            .elements
            .into_iter()
            .map(|e| BTreeMap::from([(e.key().to_string(), e.value().to_string())]))
            .collect()
    }
}

/// Cursor over an address that can step back one element at a time.
///
/// Registry lookup walks forward and pushes an element back when an
/// exact branch turns out to have no registration, so the wildcard
/// branch can be tried from the same position.
#[derive(Debug, Clone)]
pub struct PathCursor<'a> {
    elements: &'a [PathElement],
    position: usize,
}

impl<'a> PathCursor<'a> {
    /// Step back and return the element that is now next.
    pub fn previous(&mut self) -> Option<&'a PathElement> {
        if self.position == 0 {
            return None;
        }
        self.position -= 1;
        self.elements.get(self.position)
    }

    pub fn peek(&self) -> Option<&'a PathElement> {
        self.elements.get(self.position)
    }

    pub fn has_next(&self) -> bool {
        self.position < self.elements.len()
    }

    pub fn has_previous(&self) -> bool {
        self.position > 0
    }

    /// Number of elements consumed so far.
    pub fn index(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> &'a [PathElement] {
        &self.elements[self.position..]
    }
}

impl<'a> Iterator for PathCursor<'a> {
    type Item = &'a PathElement;

    fn next(&mut self) -> Option<Self::Item> {
        let element = self.elements.get(self.position)?;
        self.position += 1;
        Some(element)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn el(key: &str, value: &str) -> PathElement {
        PathElement::new(key, value).unwrap()
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let err = PathAddress::new([el("a", "1"), el("a", "2")]).unwrap_err();
        assert_eq!(
            err,
            AddressError::DuplicateKey {
                key: "a".to_string()
            }
        );
    }

    #[test]
    fn test_append_permits_repeated_keys() {
        let first = PathAddress::new([el("a", "1")]).unwrap();
        let second = PathAddress::new([el("a", "2")]).unwrap();
        let joined = first.append(&second);
        assert_eq!(joined.len(), 2);
        assert_eq!(joined.to_string(), "/a=1/a=2");
    }

    #[test]
    fn test_empty_is_canonical() {
        assert_eq!(PathAddress::new([]).unwrap(), PathAddress::EMPTY);
        assert_eq!(PathAddress::EMPTY.to_string(), "/");
        assert_eq!("/".parse::<PathAddress>().unwrap(), PathAddress::EMPTY);
        assert_eq!(PathAddress::EMPTY.parent(), PathAddress::EMPTY);
    }

    #[test]
    fn test_sub_address() {
        let address: PathAddress = "/host=a/server=b/subsystem=c".parse().unwrap();
        assert_eq!(address.sub_address(1).to_string(), "/server=b/subsystem=c");
        assert_eq!(address.sub_address_range(0, 2).to_string(), "/host=a/server=b");
        assert_eq!(address.sub_address(9), PathAddress::EMPTY);
        assert_eq!(address.parent().to_string(), "/host=a/server=b");
        assert_eq!(address.last_element(), Some(&el("subsystem", "c")));
    }

    #[test]
    fn test_wildcard_matching() {
        let concrete: PathAddress = "/subsystem=logging/handler=console".parse().unwrap();
        let pattern: PathAddress = "/subsystem=logging/handler=*".parse().unwrap();
        let prefix: PathAddress = "/subsystem=*".parse().unwrap();

        assert!(concrete.matches(&pattern));
        assert!(!concrete.matches(&prefix));
        assert!(concrete.starts_with(&prefix));
        assert!(pattern.is_multi_target());
        assert!(!concrete.is_multi_target());
        assert_ne!(concrete, pattern);
    }

    #[test]
    fn test_cursor_push_back() {
        let address: PathAddress = "/a=1/b=2".parse().unwrap();
        let mut cursor = address.cursor();

        assert_eq!(cursor.next(), Some(&el("a", "1")));
        assert_eq!(cursor.next(), Some(&el("b", "2")));
        assert!(!cursor.has_next());
        assert_eq!(cursor.index(), 2);
        assert_eq!(cursor.previous(), Some(&el("b", "2")));
        assert_eq!(cursor.index(), 1);
        assert_eq!(cursor.peek(), Some(&el("b", "2")));
        assert_eq!(cursor.next(), Some(&el("b", "2")));
        assert_eq!(cursor.next(), None);
    }

    #[test]
    fn test_cursor_index_through_mut_reference() {
        let address: PathAddress = "/a=1/b=2/c=3".parse().unwrap();
        let mut cursor = address.cursor();
        let borrowed: &mut PathCursor<'_> = &mut cursor;
        borrowed.next();
        borrowed.next();
        let index = borrowed.index();
        assert_eq!(index, 2);
        borrowed.previous();
        assert_eq!(borrowed.index(), 1);
        assert_eq!(borrowed.remaining().len(), 2);
    }

    #[test]
    fn test_parse_errors() {
        assert!("subsystem=foo".parse::<PathAddress>().is_err());
        assert!("/subsystem".parse::<PathAddress>().is_err());
        assert!("/a=1/a=2".parse::<PathAddress>().is_err());
    }

    #[test]
    fn test_wire_format() {
        let address: PathAddress = "/subsystem=foo/child=bar".parse().unwrap();
        let json = serde_json::to_value(&address).unwrap();
        assert_eq!(
            json,
            serde_json::json!([{"subsystem": "foo"}, {"child": "bar"}])
        );

        let back: PathAddress = serde_json::from_value(json).unwrap();
        assert_eq!(back, address);

        let bad = serde_json::json!([{"a": "1", "b": "2"}]);
        assert!(serde_json::from_value::<PathAddress>(bad).is_err());
    }
}
