// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated object store and image handle
//!
//! These keep all state in memory, record every call, and accept one-shot
//! injected failures, so sagas can be exercised end to end without a real
//! store.

mod image;
mod store;

pub use image::{ImageOp, SimImage};
pub use store::{SimStore, StoreOp};
