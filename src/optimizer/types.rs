//! The abstract value lattice.
//!
//! A runtime value is described by a [`Tag`] bitset over the handful of
//! kinds the VM distinguishes, plus an optional identity token used to
//! recognize "the same saved offset flowing through the code". Identities
//! are small integers minted from a per-rule counter; comparing them is
//! integer equality, so any operation that could change the concrete value
//! must mint a fresh one.

use core::cell::Cell;
use core::fmt;
use core::ops::{BitAnd, BitOr};
use std::rc::Rc;

/// Bitset of possible runtime kinds for one abstract value.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Tag(pub u8);

impl Tag {
    pub const UNDEFINED: Tag = Tag(1 << 0);
    pub const NULL: Tag = Tag(1 << 1);
    pub const FAILED: Tag = Tag(1 << 2);
    pub const OFFSET: Tag = Tag(1 << 3);
    pub const ARRAY: Tag = Tag(1 << 4);
    pub const STRING: Tag = Tag(1 << 5);
    pub const ANY: Tag = Tag(0b11_1111);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Exactly one kind left.
    pub fn is_single(self) -> bool {
        self.0.is_power_of_two()
    }

    pub fn without(self, mask: Tag) -> Tag {
        Tag(self.0 & !mask.0)
    }
}

impl BitOr for Tag {
    type Output = Tag;
    fn bitor(self, rhs: Tag) -> Tag {
        Tag(self.0 | rhs.0)
    }
}

impl BitAnd for Tag {
    type Output = Tag;
    fn bitand(self, rhs: Tag) -> Tag {
        Tag(self.0 & rhs.0)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let names = [
            (Tag::UNDEFINED, "undefined"),
            (Tag::NULL, "null"),
            (Tag::FAILED, "failed"),
            (Tag::OFFSET, "offset"),
            (Tag::ARRAY, "array"),
            (Tag::STRING, "string"),
        ];
        let mut first = true;
        for (bit, name) in names {
            if self.0 & bit.0 != 0 {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Identity token for value recognition.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Debug for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Per-rule identity counter, shared by every clone of an interpreter state
/// so branch and loop copies never reuse an id within one path.
#[derive(Clone, Debug)]
pub struct IdGen(Rc<Cell<u32>>);

impl IdGen {
    pub fn new() -> IdGen {
        IdGen(Rc::new(Cell::new(0)))
    }

    pub fn mint(&self) -> ValueId {
        let next = self.0.get();
        self.0.set(next + 1);
        ValueId(next)
    }
}

impl Default for IdGen {
    fn default() -> IdGen {
        IdGen::new()
    }
}

/// One abstract stack value.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Value {
    pub tag: Tag,
    pub id: Option<ValueId>,
}

impl Value {
    pub fn new(tag: Tag) -> Value {
        Value { tag, id: None }
    }

    pub fn with_id(tag: Tag, id: ValueId) -> Value {
        Value { tag, id: Some(id) }
    }

    /// The value is certainly one of the kinds in `mask`.
    pub fn must_be(self, mask: Tag) -> bool {
        !self.tag.is_empty() && self.tag.without(mask).is_empty()
    }

    /// The value may be one of the kinds in `mask`.
    pub fn could_be(self, mask: Tag) -> bool {
        !(self.tag & mask).is_empty()
    }

    /// Arrays and the failure sentinel always test truthy in the host VM.
    pub fn must_be_true(self) -> bool {
        self.must_be(Tag::ARRAY | Tag::FAILED)
    }

    pub fn must_be_false(self) -> bool {
        self.must_be(Tag::NULL | Tag::UNDEFINED)
    }

    /// Join of two values. The identity survives only when both sides carry
    /// the same one and the joined tag still names a single kind.
    pub fn union(a: Value, b: Value) -> Value {
        let tag = a.tag | b.tag;
        let id = if a.id == b.id && tag.is_single() { a.id } else { None };
        Value { tag, id }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "{}{}", self.tag, id),
            None => write!(f, "{}", self.tag),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_must_could_be() {
        let v = Value::new(Tag::OFFSET | Tag::FAILED);
        assert!(v.must_be(Tag::OFFSET | Tag::FAILED | Tag::NULL));
        assert!(!v.must_be(Tag::OFFSET));
        assert!(v.could_be(Tag::OFFSET));
        assert!(!v.could_be(Tag::STRING));
        assert!(!Value::new(Tag(0)).must_be(Tag::ANY));
    }

    #[test]
    fn test_truthiness() {
        assert!(Value::new(Tag::ARRAY).must_be_true());
        assert!(Value::new(Tag::FAILED).must_be_true());
        assert!(Value::new(Tag::NULL).must_be_false());
        // a string may be empty, an offset may be zero
        assert!(!Value::new(Tag::STRING).must_be_true());
        assert!(!Value::new(Tag::OFFSET).must_be_false());
    }

    #[test]
    fn test_union_identity() {
        let ids = IdGen::new();
        let id = ids.mint();
        let a = Value::with_id(Tag::OFFSET, id);
        assert_eq!(Value::union(a, a).id, Some(id));
        // different ids collapse
        let b = Value::with_id(Tag::OFFSET, ids.mint());
        assert_eq!(Value::union(a, b).id, None);
        // a widened tag loses the id even when ids agree
        let c = Value::with_id(Tag::STRING, id);
        let joined = Value::union(a, c);
        assert_eq!(joined.tag, Tag::OFFSET | Tag::STRING);
        assert_eq!(joined.id, None);
    }
}
