// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Integrity checks too expensive even for ordinary debug builds.

/// Assert only when the `extra_assertions` cargo feature is enabled.
///
/// The gate is a `cfg!` constant rather than a pair of cfg'd-out macro
/// definitions, so the asserted expression always type-checks and the
/// whole branch folds away when the feature is off.
macro_rules! extra_assert {
    ( $( $arg:tt )+ ) => {
        if cfg!(feature = "extra_assertions") {
            assert!($( $arg )+);
        }
    };
}
