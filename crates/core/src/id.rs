//! The `Id` type and related functions

use std::{
    fmt::{self, Display},
    ops::Deref,
    str::FromStr,
};

use binrw::{BinRead, BinWrite};
use derive_more::Constructor;
use rand::{thread_rng, RngCore};
use serde_derive::{Deserialize, Serialize};

use crate::{error::IdErrorKind, VaultResult};

pub(super) mod constants {
    /// The length of the hash in bytes
    pub(crate) const LEN: usize = 32;
    /// The length of the hash in hexadecimal characters
    pub(super) const HEX_LEN: usize = LEN * 2;
}

/// Defines a newtype around [`Id`] for one kind of object.
///
/// The generated type is serialized exactly like an [`Id`] and displays as
/// the shortened hex form.
#[macro_export]
macro_rules! define_new_id_struct {
    ($a:ident, $b: expr) => {
        #[doc = concat!("An Id identifying a ", stringify!($b))]
        #[derive(
            Debug,
            Clone,
            Copy,
            Default,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            derive_more::Deref,
            derive_more::Display,
            derive_more::From,
            serde_derive::Serialize,
            serde_derive::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $a($crate::Id);

        impl $a {
            /// Returns the underlying [`Id`]
            #[must_use]
            pub const fn into_inner(self) -> $crate::Id {
                self.0
            }
        }
    };
}

/// `Id` is a 256 bit hash.
///
/// Blocks, volumes and runs are all identified by an `Id`, wrapped into their
/// own newtype.
#[derive(
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Constructor,
    BinWrite,
    BinRead,
)]
pub struct Id(
    /// The actual hash
    #[serde(serialize_with = "hex::serde::serialize")]
    #[serde(deserialize_with = "hex::serde::deserialize")]
    [u8; constants::LEN],
);

impl FromStr for Id {
    type Err = IdErrorKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s).map_err(|_| IdErrorKind::ParsingIdFromStringFailed(s.to_string()))
    }
}

impl Display for Id {
    /// Format the `Id` as a shortened hexadecimal string
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = &self.to_hex()[0..8];

        write!(f, "{id}")
    }
}

impl Id {
    /// Parse an `Id` from a hexadecimal string
    ///
    /// # Arguments
    ///
    /// * `s` - The hexadecimal string to parse
    ///
    /// # Errors
    ///
    /// * [`IdErrorKind::EmptyHexString`] - If the string is empty
    /// * [`IdErrorKind::NonAsciiHexString`] - If the string contains non-ascii characters
    /// * [`IdErrorKind::HexError`] - If the string is not a valid hexadecimal string
    ///
    /// # Examples
    ///
    /// ```
    /// use blockvault_core::Id;
    ///
    /// let id = Id::from_hex("0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef").unwrap();
    ///
    /// assert_eq!(id.to_hex().as_str(),
    /// "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef");
    /// ```
    ///
    /// [`IdErrorKind::EmptyHexString`]: crate::error::IdErrorKind::EmptyHexString
    /// [`IdErrorKind::NonAsciiHexString`]: crate::error::IdErrorKind::NonAsciiHexString
    /// [`IdErrorKind::HexError`]: crate::error::IdErrorKind::HexError
    pub fn from_hex(s: &str) -> VaultResult<Self> {
        if s.is_empty() {
            return Err(IdErrorKind::EmptyHexString.into());
        }

        if !s.is_ascii() {
            return Err(IdErrorKind::NonAsciiHexString.into());
        }

        let mut id = Self::default();

        hex::decode_to_slice(s, &mut id.0).map_err(IdErrorKind::HexError)?;

        Ok(id)
    }

    /// Generate a random `Id`.
    #[must_use]
    pub fn random() -> Self {
        let mut id = Self::default();
        thread_rng().fill_bytes(&mut id.0);
        id
    }

    /// The raw bytes of this `Id`
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; constants::LEN] {
        &self.0
    }

    /// Convert to [`HexId`].
    ///
    /// # Examples
    ///
    /// ```
    /// use blockvault_core::Id;
    ///
    /// let id = Id::from_hex("0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef").unwrap();
    ///
    /// assert_eq!(id.to_hex().as_str(), "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef");
    /// ```
    #[must_use]
    pub fn to_hex(self) -> HexId {
        let mut hex_id = HexId::EMPTY;

        // the target is exactly twice as long as the source, so this cannot fail
        if hex::encode_to_slice(self.0, &mut hex_id.0).is_err() {
            return HexId::EMPTY;
        }

        hex_id
    }

    /// Checks if the [`Id`] is zero
    #[must_use]
    pub fn is_null(&self) -> bool {
        self == &Self::default()
    }
}

impl fmt::Debug for Id {
    /// Format the `Id` as a hexadecimal string
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = &self.to_hex()[0..32];

        write!(f, "{id}")
    }
}

/// An `Id` in hexadecimal format
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HexId([u8; constants::HEX_LEN]);

impl From<Id> for HexId {
    fn from(id: Id) -> Self {
        id.to_hex()
    }
}

impl PartialEq<str> for HexId {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl HexId {
    /// An empty [`HexId`]
    const EMPTY: Self = Self([b'0'; constants::HEX_LEN]);

    /// Get the string representation of a [`HexId`]
    #[must_use]
    pub fn as_str(&self) -> &str {
        // only ever filled with ascii hex digits
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl Deref for HexId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}
