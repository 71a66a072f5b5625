// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Image feature bits

use crate::error::Error;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    #[derive(
        Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
    )]
    pub struct Features: u64 {
        /// The image may be used as the parent of clones
        const LAYERING = 1 << 0;
        const STRIPINGV2 = 1 << 1;
        const EXCLUSIVE_LOCK = 1 << 2;
        const OBJECT_MAP = 1 << 3;
        const FAST_DIFF = 1 << 4;
        const DEEP_FLATTEN = 1 << 5;
        const JOURNALING = 1 << 6;
        /// Data objects live in a separate pool from the header
        const DATA_POOL = 1 << 7;
    }
}

impl Features {
    /// Features a clone may enable even when its parent lacks them
    ///
    /// `DATA_POOL` is additionally gated on a data pool actually being
    /// configured for the clone.
    pub const CLONE_ADDABLE: Features = Features::EXCLUSIVE_LOCK
        .union(Features::OBJECT_MAP)
        .union(Features::FAST_DIFF)
        .union(Features::JOURNALING)
        .union(Features::DATA_POOL);

    /// Features that must be disabled before an image's objects are removed
    pub const DISABLE_BEFORE_REMOVE: Features =
        Features::JOURNALING
            .union(Features::OBJECT_MAP)
            .union(Features::FAST_DIFF);

    /// Parse a raw bitmask, rejecting bits this implementation does not know
    pub fn from_raw(bits: u64) -> Result<Features, Error> {
        Features::from_bits(bits).ok_or_else(|| Error::Unsupported {
            message: format!(
                "requested features {:#x} include unknown bits {:#x}",
                bits,
                bits & !Features::all().bits()
            ),
        })
    }

    /// Check that every feature's prerequisites are also enabled
    pub fn check_dependencies(self) -> Result<(), Error> {
        const RULES: [(Features, Features, &str); 3] = [
            (
                Features::OBJECT_MAP,
                Features::EXCLUSIVE_LOCK,
                "object-map requires exclusive-lock",
            ),
            (
                Features::FAST_DIFF,
                Features::OBJECT_MAP,
                "fast-diff requires object-map",
            ),
            (
                Features::JOURNALING,
                Features::EXCLUSIVE_LOCK,
                "journaling requires exclusive-lock",
            ),
        ];

        for (feature, requires, message) in RULES {
            if self.contains(feature) && !self.contains(requires) {
                return Err(Error::invalid_value("features", message));
            }
        }
        Ok(())
    }
}
