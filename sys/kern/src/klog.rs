// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel trace logging.
//!
//! Lowered to `defmt::trace!` when the `defmt` feature is enabled and to
//! nothing otherwise, so instrumented paths cost zero bytes in production
//! images that don't want them.

macro_rules! ktrace {
    ($($arg:tt)*) => {
        #[cfg(feature = "defmt")]
        defmt::trace!($($arg)*);
    };
}

pub(crate) use ktrace;
