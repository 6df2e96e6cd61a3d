// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// This file is for CPU architecture-specific things.

use ::static_assertions::const_assert_eq;
use ::std::ops::Deref;

// ------------------------
// CPU Data Cache Line Size
// ------------------------
cfg_if! {
    if #[cfg(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64"))] {
        pub const CPU_DATA_CACHE_LINE_SIZE: usize = 64;

        /// Pads and aligns a value to its own data cache line.
        #[repr(align(64))]
        #[derive(Debug, Default)]
        pub struct CacheAligned<T>(pub T);
    } else {
        pub const CPU_DATA_CACHE_LINE_SIZE: usize = 128;

        /// Pads and aligns a value to its own data cache line.
        #[repr(align(128))]
        #[derive(Debug, Default)]
        pub struct CacheAligned<T>(pub T);
    }
}

const_assert_eq!(::std::mem::align_of::<CacheAligned<u8>>(), CPU_DATA_CACHE_LINE_SIZE);

impl<T> Deref for CacheAligned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}
