//! Leaf labels and tree geometry.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a leaf in the credential tree.
///
/// The low `height * bits_per_level` bits are the path from the root, most
/// significant level first: the top `bits_per_level` bits select the root's
/// child, the lowest bits select the leaf among its siblings.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Label(pub u64);

impl Label {
    /// Returns the raw label value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for Label {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Shape of the credential tree: fan-out `2^bits_per_level`, `height` levels
/// of inner nodes above the leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TreeGeometry {
    /// Bits of the label consumed per level.
    pub bits_per_level: u8,
    /// Number of levels between leaves and root.
    pub height: u8,
}

impl TreeGeometry {
    /// Largest supported `bits_per_level`.
    pub const MAX_BITS_PER_LEVEL: u8 = 4;
    /// Largest supported label width in bits.
    pub const MAX_LABEL_BITS: u32 = 32;

    /// Creates a geometry, checking the supported bounds.
    ///
    /// # Errors
    ///
    /// Returns a description of the violated bound.
    pub fn new(bits_per_level: u8, height: u8) -> Result<Self, String> {
        let geometry = Self {
            bits_per_level,
            height,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Checks `bits_per_level` is in `1..=4`, `height >= 1` and the label
    /// fits in 32 bits.
    ///
    /// # Errors
    ///
    /// Returns a description of the violated bound.
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=Self::MAX_BITS_PER_LEVEL).contains(&self.bits_per_level) {
            return Err(format!(
                "bits_per_level must be between 1 and {}, got {}",
                Self::MAX_BITS_PER_LEVEL,
                self.bits_per_level
            ));
        }
        if self.height == 0 {
            return Err("height must be at least 1".to_string());
        }
        if self.label_bits() > Self::MAX_LABEL_BITS {
            return Err(format!(
                "height * bits_per_level must not exceed {}, got {}",
                Self::MAX_LABEL_BITS,
                self.label_bits()
            ));
        }
        Ok(())
    }

    /// Children per inner node.
    #[must_use]
    pub const fn fan_out(&self) -> u64 {
        1 << self.bits_per_level
    }

    /// Number of label bits.
    #[must_use]
    pub const fn label_bits(&self) -> u32 {
        self.bits_per_level as u32 * self.height as u32
    }

    /// Number of leaf slots.
    #[must_use]
    pub const fn leaf_count(&self) -> u64 {
        1 << self.label_bits()
    }

    /// Returns `true` if `label` addresses a slot in this tree.
    #[must_use]
    pub const fn contains(&self, label: Label) -> bool {
        label.0 < self.leaf_count()
    }

    /// Index of the ancestor of `label` at `level` (0 = the leaf itself,
    /// `height` = the root).
    #[must_use]
    pub const fn node_index(&self, label: Label, level: u8) -> u64 {
        let shift = self.bits_per_level as u32 * level as u32;
        if shift >= u64::BITS {
            0
        } else {
            label.0 >> shift
        }
    }

    /// Position of a node among its siblings.
    #[must_use]
    pub const fn child_position(&self, node_index: u64) -> u64 {
        node_index & (self.fan_out() - 1)
    }

    /// Number of auxiliary hashes a proof for one leaf carries.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn aux_len(&self) -> usize {
        (self.fan_out() as usize - 1) * self.height as usize
    }
}

impl Default for TreeGeometry {
    fn default() -> Self {
        Self {
            bits_per_level: 2,
            height: 7,
        }
    }
}

impl fmt::Display for TreeGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.fan_out(), self.height)
    }
}
