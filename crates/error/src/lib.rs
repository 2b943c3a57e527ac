//! Kernel error handling infrastructure.
//!
//! Every subsystem declares its failure modes with [`define_kernel_error!`].
//! The generated enum carries a 16-bit code, `(subsystem << 8) | variant`,
//! so a single hex number in a boot log identifies both the component and
//! the failure.
//!
//! ## Subsystem codes
//!
//! | Code | Subsystem                     |
//! |------|-------------------------------|
//! | 0x01 | Page table manager (`MmuError`) |
//! | 0x02 | Frame allocator (`FrameError`)  |
//! | 0x03 | Slab allocator (`SlabError`)    |
//! | 0x04 | Virtual regions (`VmError`)     |
//! | 0x05 | Boot sequence (`MmError`)       |
//!
//! ## Usage
//!
//! ### Simple errors
//! ```ignore
//! define_kernel_error! {
//!     pub enum FrameError(0x02) {
//!         OutOfMemory = 0x01 => "No free block of sufficient order",
//!         BadOrder = 0x02 => "Order out of range",
//!     }
//! }
//! ```
//!
//! ### Nested errors
//! A variant may wrap the error of a lower layer. The macro also emits
//! `From<Inner>` for such variants so `?` converts automatically; declare at
//! most one variant per inner type.
//! ```ignore
//! define_kernel_error! {
//!     pub enum VmError(0x04) {
//!         Mmu(MmuError) = 0x05 => "Page table operation failed",
//!     }
//! }
//! ```

#![no_std]

/// Define a kernel error enum with codes, names and `Display`.
#[macro_export]
macro_rules! define_kernel_error {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident($subsystem:literal) {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident $(($inner:ty))? = $code:literal => $desc:literal
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $name {
            $(
                $(#[$variant_meta])*
                $variant $(($inner))?,
            )*
        }

        impl $name {
            /// Subsystem identifier for this error type.
            pub const SUBSYSTEM: u8 = $subsystem;

            /// Numeric error code, `(subsystem << 8) | variant`.
            pub const fn code(&self) -> u16 {
                match self {
                    $(
                        $crate::define_kernel_error!(@pattern $variant $(($inner))? _unused) => {
                            (($subsystem as u16) << 8) | $code
                        }
                    )*
                }
            }

            /// Short description for diagnostics.
            pub const fn name(&self) -> &'static str {
                match self {
                    $(
                        $crate::define_kernel_error!(@pattern $variant $(($inner))? _unused) => {
                            $desc
                        }
                    )*
                }
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match self {
                    $(
                        $crate::define_kernel_error!(@pattern $variant $(($inner))? inner) => {
                            $crate::define_kernel_error!(@display_body self f $desc $(($inner))? inner)
                        }
                    )*
                }
            }
        }

        impl core::error::Error for $name {}

        $(
            $crate::define_kernel_error!(@from $name $variant $(($inner))?);
        )*
    };

    (@pattern $variant:ident ($inner:ty) $bind:ident) => { Self::$variant($bind) };
    (@pattern $variant:ident $bind:ident) => { Self::$variant };

    (@display_body $self:ident $f:ident $desc:literal ($inner:ty) $bind:ident) => {
        write!($f, "E{:04X}: {} ({})", $self.code(), $desc, $bind)
    };
    (@display_body $self:ident $f:ident $desc:literal $bind:ident) => {
        write!($f, "E{:04X}: {}", $self.code(), $desc)
    };

    (@from $name:ident $variant:ident ($inner:ty)) => {
        impl From<$inner> for $name {
            fn from(inner: $inner) -> Self {
                Self::$variant(inner)
            }
        }
    };
    (@from $name:ident $variant:ident) => {};
}

#[cfg(test)]
mod tests {
    extern crate std;
    use std::format;

    define_kernel_error! {
        /// Leaf error used by the tests
        pub enum LeafError(0x21) {
            /// First failure
            Exhausted = 0x01 => "Pool exhausted",
            /// Second failure
            Misaligned = 0x02 => "Address not aligned",
        }
    }

    define_kernel_error! {
        pub enum OuterError(0x22) {
            Leaf(LeafError) = 0x01 => "Lower layer failed",
            NoSlot = 0x02 => "No descriptor slot",
        }
    }

    fn lower() -> Result<(), LeafError> {
        Err(LeafError::Misaligned)
    }

    fn upper() -> Result<(), OuterError> {
        lower()?;
        Ok(())
    }

    #[test]
    fn codes_combine_subsystem_and_variant() {
        assert_eq!(LeafError::Exhausted.code(), 0x2101);
        assert_eq!(LeafError::Misaligned.code(), 0x2102);
        assert_eq!(OuterError::Leaf(LeafError::Exhausted).code(), 0x2201);
        assert_eq!(OuterError::NoSlot.code(), 0x2202);
    }

    #[test]
    fn names_are_descriptions() {
        assert_eq!(LeafError::Exhausted.name(), "Pool exhausted");
        assert_eq!(OuterError::Leaf(LeafError::Exhausted).name(), "Lower layer failed");
    }

    #[test]
    fn display_includes_inner_cause() {
        assert_eq!(format!("{}", LeafError::Exhausted), "E2101: Pool exhausted");
        assert_eq!(
            format!("{}", OuterError::Leaf(LeafError::Misaligned)),
            "E2201: Lower layer failed (E2102: Address not aligned)"
        );
    }

    #[test]
    fn question_mark_wraps_nested_variant() {
        assert_eq!(upper(), Err(OuterError::Leaf(LeafError::Misaligned)));
    }

    #[test]
    fn subsystem_constant() {
        assert_eq!(LeafError::SUBSYSTEM, 0x21);
        assert_eq!(OuterError::SUBSYSTEM, 0x22);
    }
}
