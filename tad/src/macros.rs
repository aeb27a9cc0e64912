/// Define an enumeration with known variants and an unknown representation.
///
/// Most network protocols define fields where not all bit-patterns are standardized values. In
/// some cases these are invalid while others allocate them through some registrar (such as IANA).
/// This macro makes it more ergonomic to define a representation for such fields by providing
/// converters to and from an underlying representation derived from the definition.
///
/// # Example
///
/// ```ignore
/// enum_with_unknown! {
///     /// Ethernet protocol type.
///     pub enum EtherType(u16) {
///         Ipv4 = 0x0800,
///         Arp  = 0x0806,
///     }
/// }
/// ```
// Copyright (C) 2016 whitequark@whitequark.org
macro_rules! enum_with_unknown {
    (
        $( #[$enum_attr:meta] )*
        pub enum $name:ident($ty:ty) {
            $( $variant:ident = $value:expr ),+ $(,)*
        }
    ) => {
        enum_with_unknown! {
            $( #[$enum_attr] )*
            pub doc enum $name($ty) {
                $( $variant = $value ),+
            }
        }
    };
    (
        $( #[$enum_attr:meta] )*
        pub doc enum $name:ident($ty:ty) {
            $(
              $( #[$variant_attr:meta] )*
              $variant:ident = $value:expr $(,)*
            ),+
        }
    ) => {
        #[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
        $( #[$enum_attr] )*
        pub enum $name {
            $(
              $( #[$variant_attr] )*
              $variant
            ),*,
            /// A value whose interpretation was not determined.
            ///
            /// There are two common cases where this is necessary: To represent a parsed valued
            /// from an unknown source which might be faulty or from an unsupported standard
            /// version; Or to encode an arbitrary user supplied value in such fields to allow
            /// extensions that are not supported by a layer itself.
            Unknown($ty)
        }

        impl ::core::convert::From<$ty> for $name {
            fn from(value: $ty) -> Self {
                match value {
                    $( $value => $name::$variant ),*,
                    other => $name::Unknown(other)
                }
            }
        }

        impl ::core::convert::From<$name> for $ty {
            fn from(value: $name) -> Self {
                match value {
                    $( $name::$variant => $value ),*,
                    $name::Unknown(other) => other
                }
            }
        }
    }
}

/// Declare a dynamically sized byte wrapper.
///
/// Use this to create byte slices with inner invariants. This macro performs two basic actions:
/// * Define a type with the indicated structure, documentation, attributes. The type can not have
///   any generic arguments and can only wrap a simple byte slice.
/// * Define two new private methods for conversion from a byte slice:
///   - `fn __from_macro_new_unchecked(&[u8]) -> &Self`
///   - `fn __from_macro_new_unchecked_mut(&mut [u8]) -> &mut Self`
///
/// ## Usage
///
/// You can currently only use a tuple type with a single member, a `[u8]`.
///
/// ```ignore
/// byte_wrapper! {
///     /// An ethernet frame.
///     pub struct ethernet([u8]);
/// }
///
/// impl ethernet {
///     pub fn new_unchecked(slice: &[u8]) -> &Self {
///         Self::__from_macro_new_unchecked(slice)
///     }
/// }
/// ```
macro_rules! byte_wrapper {
    (
        pub struct $name:ident([u8])$(;)*
    ) => {
        byte_wrapper! {
            @pub struct $name([u8])
        }
    };
    (
        $( #[$attr:meta] )*
        pub struct $name:ident([u8])$(;)*
    ) => {
        byte_wrapper! {
            @$( #[$attr] )*
            pub struct $name([u8])
        }
    };
    (
        @$( #[$attr:meta] )*
        pub struct $name:ident([u8])
    ) => {
        #[allow(non_camel_case_types)]
        #[repr(transparent)]
        $( #[$attr] )*
        pub struct $name([u8]);

        impl $name {
            #[allow(dead_code)]
            fn __from_macro_new_unchecked(data: &[u8]) -> &Self {
                // SAFETY: this is safe due to repr(transparent)
                unsafe { &*(data as *const _ as *const Self) }
            }

            #[allow(dead_code)]
            fn __from_macro_new_unchecked_mut(data: &mut [u8]) -> &mut Self {
                // SAFETY: this is safe due to repr(transparent)
                unsafe { &mut *(data as *mut _ as *mut Self) }
            }
        }
    }
}

/// Declare a small set of named bits.
///
/// Generates a `Copy` newtype over the integer with one associated constant per bit, the usual
/// set operations and a `Debug` listing the names of the set bits.
///
/// ```ignore
/// bit_set! {
///     /// What the worker is asked to do.
///     pub struct Command(u8) {
///         SEND = 0x01,
///         STOP = 0x02,
///     }
/// }
/// ```
macro_rules! bit_set {
    (
        $( #[$attr:meta] )*
        pub struct $name:ident($ty:ty) {
            $(
              $( #[$bit_attr:meta] )*
              $bit:ident = $value:expr
            ),+ $(,)*
        }
    ) => {
        #[derive(PartialEq, Eq, Hash, Clone, Copy, Default)]
        $( #[$attr] )*
        pub struct $name($ty);

        impl $name {
            $(
              $( #[$bit_attr] )*
              pub const $bit: $name = $name($value);
            )+

            /// The set without any bit.
            pub const EMPTY: $name = $name(0);

            /// Whether all bits of `other` are set.
            pub fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            /// Whether any bit of `other` is set.
            pub fn intersects(self, other: $name) -> bool {
                self.0 & other.0 != 0
            }

            /// Set the bits of `other`.
            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            /// Clear the bits of `other`.
            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }

            /// Whether no bit is set.
            pub fn is_empty(self) -> bool {
                self.0 == 0
            }

            /// Number of set bits.
            pub fn count(self) -> u32 {
                self.0.count_ones()
            }

            /// The raw representation.
            pub fn bits(self) -> $ty {
                self.0
            }
        }

        impl ::core::ops::BitOr for $name {
            type Output = $name;

            fn bitor(self, other: $name) -> $name {
                $name(self.0 | other.0)
            }
        }

        impl ::core::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
                let mut set = f.debug_set();
                $(
                  if self.contains($name::$bit) {
                      set.entry(&stringify!($bit));
                  }
                )+
                set.finish()
            }
        }
    }
}
