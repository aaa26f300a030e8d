//! Typed message envelope.
//!
//! A [`Message`] is a numeric type tag followed by an ordered list of typed
//! [`Element`]s. Messages are plain values: they are cloned freely and moved
//! into a channel when sent, which freezes them from the sender's point of view.
//!
//! # Example
//!
//! ```
//! use eanp_core::Message;
//!
//! let mut msg = Message::new(7);
//! msg.add_u64(1).add_string("hello");
//!
//! assert_eq!(msg.u64_at(0).unwrap(), 1);
//! assert_eq!(msg.str_at(1).unwrap(), "hello");
//! assert!(msg.u32_at(1).is_err());
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Type tag of a message element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementKind {
    /// 32-bit unsigned integer.
    U32,
    /// 64-bit unsigned integer.
    U64,
    /// UTF-8 string.
    Str,
    /// Opaque binary blob.
    Bytes,
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementKind::U32 => "u32",
            ElementKind::U64 => "u64",
            ElementKind::Str => "string",
            ElementKind::Bytes => "bytes",
        };
        f.write_str(name)
    }
}

/// A single typed value carried by a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Element {
    /// 32-bit unsigned integer.
    U32(u32),
    /// 64-bit unsigned integer.
    U64(u64),
    /// UTF-8 string.
    Str(String),
    /// Opaque binary blob.
    Bytes(Vec<u8>),
}

impl Element {
    /// The tag recorded for this element.
    pub fn kind(&self) -> ElementKind {
        match self {
            Element::U32(_) => ElementKind::U32,
            Element::U64(_) => ElementKind::U64,
            Element::Str(_) => ElementKind::Str,
            Element::Bytes(_) => ElementKind::Bytes,
        }
    }
}

impl From<u32> for Element {
    fn from(value: u32) -> Self {
        Element::U32(value)
    }
}

impl From<u64> for Element {
    fn from(value: u64) -> Self {
        Element::U64(value)
    }
}

impl From<String> for Element {
    fn from(value: String) -> Self {
        Element::Str(value)
    }
}

impl From<&str> for Element {
    fn from(value: &str) -> Self {
        Element::Str(value.to_string())
    }
}

impl From<Vec<u8>> for Element {
    fn from(value: Vec<u8>) -> Self {
        Element::Bytes(value)
    }
}

/// Errors raised when reading elements out of a message.
///
/// Both variants indicate that the reader disagrees with the producer about
/// the message layout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    /// The element at `index` was stored with a different tag.
    #[error("element {index} is {found}, not {expected}")]
    TypeMismatch {
        /// Position of the element.
        index: usize,
        /// Tag requested by the accessor.
        expected: ElementKind,
        /// Tag recorded at insertion time.
        found: ElementKind,
    },

    /// The message has fewer than `index + 1` elements.
    #[error("element {index} out of range (message has {len} elements)")]
    IndexOutOfRange {
        /// Requested position.
        index: usize,
        /// Number of elements in the message.
        len: usize,
    },
}

/// Typed envelope: a numeric type tag plus ordered elements.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Message {
    kind: u32,
    elements: Vec<Element>,
}

impl Message {
    /// Create an empty message with the given type tag.
    pub fn new(kind: u32) -> Self {
        Self {
            kind,
            elements: Vec::new(),
        }
    }

    /// The message type tag.
    pub fn kind(&self) -> u32 {
        self.kind
    }

    /// All elements in insertion order.
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the message carries no elements.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Append an element of any supported type.
    pub fn push(&mut self, element: impl Into<Element>) -> &mut Self {
        self.elements.push(element.into());
        self
    }

    /// Append a `u32`.
    pub fn add_u32(&mut self, value: u32) -> &mut Self {
        self.push(Element::U32(value))
    }

    /// Append a `u64`.
    pub fn add_u64(&mut self, value: u64) -> &mut Self {
        self.push(Element::U64(value))
    }

    /// Append a string.
    pub fn add_string(&mut self, value: impl Into<String>) -> &mut Self {
        self.push(Element::Str(value.into()))
    }

    /// Append a binary blob.
    pub fn add_bytes(&mut self, value: impl Into<Vec<u8>>) -> &mut Self {
        self.push(Element::Bytes(value.into()))
    }

    /// Consuming variant of [`Message::push`] for building messages inline.
    pub fn with(mut self, element: impl Into<Element>) -> Self {
        self.elements.push(element.into());
        self
    }

    /// The element at `index`, whatever its type.
    pub fn element(&self, index: usize) -> Result<&Element, MessageError> {
        self.elements
            .get(index)
            .ok_or(MessageError::IndexOutOfRange {
                index,
                len: self.elements.len(),
            })
    }

    /// Read a `u32` element.
    pub fn u32_at(&self, index: usize) -> Result<u32, MessageError> {
        match self.element(index)? {
            Element::U32(v) => Ok(*v),
            other => Err(mismatch(index, ElementKind::U32, other)),
        }
    }

    /// Read a `u64` element.
    pub fn u64_at(&self, index: usize) -> Result<u64, MessageError> {
        match self.element(index)? {
            Element::U64(v) => Ok(*v),
            other => Err(mismatch(index, ElementKind::U64, other)),
        }
    }

    /// Read a string element.
    pub fn str_at(&self, index: usize) -> Result<&str, MessageError> {
        match self.element(index)? {
            Element::Str(v) => Ok(v),
            other => Err(mismatch(index, ElementKind::Str, other)),
        }
    }

    /// Read a binary element.
    pub fn bytes_at(&self, index: usize) -> Result<&[u8], MessageError> {
        match self.element(index)? {
            Element::Bytes(v) => Ok(v),
            other => Err(mismatch(index, ElementKind::Bytes, other)),
        }
    }
}

fn mismatch(index: usize, expected: ElementKind, found: &Element) -> MessageError {
    MessageError::TypeMismatch {
        index,
        expected,
        found: found.kind(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elements_keep_insertion_order() {
        let mut msg = Message::new(3);
        msg.add_u32(1)
            .add_u64(2)
            .add_string("three")
            .add_bytes(vec![4u8]);

        assert_eq!(msg.kind(), 3);
        assert_eq!(msg.len(), 4);
        assert_eq!(msg.u32_at(0), Ok(1));
        assert_eq!(msg.u64_at(1), Ok(2));
        assert_eq!(msg.str_at(2), Ok("three"));
        assert_eq!(msg.bytes_at(3), Ok(&[4u8][..]));
    }

    #[test]
    fn test_type_mismatch_reports_both_tags() {
        let msg = Message::new(0).with(5u64);

        let err = msg.u32_at(0).expect_err("tag mismatch");
        assert_eq!(
            err,
            MessageError::TypeMismatch {
                index: 0,
                expected: ElementKind::U32,
                found: ElementKind::U64,
            }
        );
        assert_eq!(err.to_string(), "element 0 is u64, not u32");
    }

    #[test]
    fn test_index_out_of_range() {
        let msg = Message::new(0).with("only");
        assert_eq!(
            msg.str_at(1),
            Err(MessageError::IndexOutOfRange { index: 1, len: 1 })
        );
    }

    #[test]
    fn test_clone_is_independent() {
        let mut original = Message::new(1).with(1u32);
        let copy = original.clone();
        original.add_u32(2);

        assert_eq!(copy.len(), 1);
        assert_eq!(original.len(), 2);
    }
}
