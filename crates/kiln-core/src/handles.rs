//! Asset and object handles.
//!
//! Handles are plain indices into tables owned by the asset layer or the
//! renderer. The all-ones value is reserved as the invalid sentinel for
//! every handle type.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

macro_rules! define_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord,
            Pod, Zeroable, Serialize, Deserialize,
        )]
        #[repr(transparent)]
        pub struct $name(pub u32);

        impl $name {
            /// Sentinel for "no resource".
            pub const INVALID: Self = Self(u32::MAX);

            /// Returns true if this handle refers to a resource.
            #[inline]
            pub const fn is_valid(self) -> bool {
                self.0 != u32::MAX
            }

            /// The handle as a table index.
            #[inline]
            pub const fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

define_handle!(
    /// Identifies a model in the asset store.
    ModelId
);
define_handle!(
    /// Identifies a material in the asset store.
    MaterialId
);
define_handle!(
    /// Identifies a texture in the asset store.
    TextureId
);
define_handle!(
    /// Identifies a shader program in the shader library.
    ProgramId
);
define_handle!(
    /// Identifies one submitted entity within a frame.
    ObjectId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_sentinel() {
        assert!(!MaterialId::INVALID.is_valid());
        assert!(MaterialId(0).is_valid());
        assert!(TextureId(17).is_valid());
    }

    #[test]
    fn default_is_valid_zero() {
        assert_eq!(ModelId::default(), ModelId(0));
        assert!(ModelId::default().is_valid());
    }
}
