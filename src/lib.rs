#![doc = include_str!("../README.md")]
#![no_std]
#![deny(missing_docs)]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]

extern crate alloc;

use cfg_if::cfg_if;

mod block;
mod error;
mod index;
mod zone;

pub use error::ZoneError;
pub use zone::{ZoneAllocator, DEFAULT_BLOCK_SIZE, ZONE_ALIGN};

cfg_if! {
    if #[cfg(feature = "shared_zone")] {
        mod shared;
        pub use shared::SharedZone;
    }
}

cfg_if! {
    if #[cfg(feature = "allocator_api")] {
        pub use alloc::alloc::Global;
        pub use core::alloc::{AllocError, Allocator};
    } else if #[cfg(feature = "allocator_api2")] {
        pub use allocator_api2::alloc::{AllocError, Allocator, Global};
    } else {
        compile_error!("Must enable one of the `allocator_api` or `allocator_api2` cargo features");
    }
}
