#![allow(unknown_lints)]
#![warn(rust_2018_idioms)]
#[cfg(feature = "serde_support")]
mod serde_support;

#[cfg(feature = "rusqlite_support")]
mod rusqlite_support;

#[cfg(feature = "random")]
mod random;

use std::{fmt, ops, str};

/// A type used to represent the opaque identifiers used throughout the sync
/// engine: record primary keys, pending-op ids, op ids. It has several
/// benefits over using a bare `String`:
///
/// 1. It's more explicit about what is being stored, and prevents bugs where
///    an arbitrary string is passed to a function expecting an identifier.
/// 2. Guids are immutable once constructed.
/// 3. Short guids (uuids, base64url ids up to 14 bytes) are stored inline
///    without a heap allocation.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Guid(Repr);

#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
enum Repr {
    // see FastGuid for invariants
    Fast(FastGuid),
    // invariants:
    // - _0.len() <= MAX_GUID_LEN
    // - _0.bytes().all(|&b| Guid::is_valid_byte(b))
    Slow(String),
}

#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
struct FastGuid {
    len: u8,
    data: [u8; MAX_FAST_GUID_LEN],
}

// uuid-v4-as-hyphenated-string is 36 bytes, so inline storage needs to cover
// that case without falling back to the heap for the common id shapes this
// crate sees (pending-op ids, op ids, record pks).
const MAX_FAST_GUID_LEN: usize = 36;

impl FastGuid {
    #[inline]
    fn from_slice(bytes: &[u8]) -> Self {
        debug_assert!(can_use_fast(bytes), "caller failed to check can_use_fast");
        let mut data = [0u8; MAX_FAST_GUID_LEN];
        data[0..bytes.len()].copy_from_slice(bytes);
        FastGuid {
            len: bytes.len() as u8,
            data,
        }
    }

    #[inline]
    fn as_str(&self) -> &str {
        str::from_utf8(self.bytes()).unwrap()
    }

    #[inline]
    fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    fn bytes(&self) -> &[u8] {
        &self.data[0..self.len()]
    }
}

#[inline]
fn can_use_fast<T: ?Sized + AsRef<[u8]>>(bytes: &T) -> bool {
    bytes.as_ref().len() <= MAX_FAST_GUID_LEN
}

impl Guid {
    #[inline]
    fn from_string(s: String) -> Self {
        Guid::from_vec(s.into_bytes())
    }

    #[inline]
    fn from_slice(b: &[u8]) -> Self {
        if can_use_fast(b) {
            Guid(Repr::Fast(FastGuid::from_slice(b)))
        } else {
            debug_assert!(b.iter().all(|v| v.is_ascii()));
            Guid(Repr::Slow(String::from_utf8(b.into()).unwrap()))
        }
    }

    #[inline]
    fn from_vec(v: Vec<u8>) -> Self {
        if can_use_fast(&v) {
            Guid(Repr::Fast(FastGuid::from_slice(&v)))
        } else {
            debug_assert!(v.iter().all(|b| b.is_ascii()));
            Guid(Repr::Slow(String::from_utf8(v).unwrap()))
        }
    }

    /// Get the data backing this `Guid` as a `&[u8]`.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match &self.0 {
            Repr::Fast(rep) => rep.bytes(),
            Repr::Slow(rep) => rep.as_ref(),
        }
    }

    /// Get the data backing this `Guid` as a `&str`.
    #[inline]
    pub fn as_str(&self) -> &str {
        match &self.0 {
            Repr::Fast(rep) => rep.as_str(),
            Repr::Slow(rep) => rep.as_ref(),
        }
    }

    /// Convert this `Guid` into a `String`, consuming it in the process.
    #[inline]
    pub fn into_string(self) -> String {
        match self.0 {
            Repr::Fast(rep) => rep.as_str().into(),
            Repr::Slow(rep) => rep,
        }
    }

    /// Returns true if the byte `b` is a character that is allowed to appear
    /// in an identifier (printable ASCII).
    #[inline]
    pub fn is_valid_byte(b: u8) -> bool {
        (b' '..=b'~').contains(&b)
    }
}

impl<'a> From<&'a str> for Guid {
    #[inline]
    fn from(s: &'a str) -> Guid {
        Guid::from_slice(s.as_ref())
    }
}

impl<'a> From<&'a [u8]> for Guid {
    #[inline]
    fn from(s: &'a [u8]) -> Guid {
        Guid::from_slice(s)
    }
}

impl From<String> for Guid {
    #[inline]
    fn from(s: String) -> Guid {
        Guid::from_string(s)
    }
}

impl From<Vec<u8>> for Guid {
    #[inline]
    fn from(v: Vec<u8>) -> Guid {
        Guid::from_vec(v)
    }
}

impl From<Guid> for String {
    #[inline]
    fn from(guid: Guid) -> String {
        guid.into_string()
    }
}

impl AsRef<str> for Guid {
    #[inline]
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl AsRef<[u8]> for Guid {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl ops::Deref for Guid {
    type Target = str;
    #[inline]
    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({:?})", self.as_str())
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.as_str(), f)
    }
}

macro_rules! impl_guid_eq {
    ($($other: ty),+) => {$(
        impl<'a> PartialEq<$other> for Guid {
            #[inline]
            fn eq(&self, other: &$other) -> bool {
                PartialEq::eq(AsRef::<[u8]>::as_ref(self), AsRef::<[u8]>::as_ref(other))
            }
        }

        impl<'a> PartialEq<Guid> for $other {
            #[inline]
            fn eq(&self, other: &Guid) -> bool {
                PartialEq::eq(AsRef::<[u8]>::as_ref(self), AsRef::<[u8]>::as_ref(other))
            }
        }
    )+}
}

impl_guid_eq![str, &'a str, String, [u8], &'a [u8], Vec<u8>];
