// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client-side sagas for creating, cloning, and removing images in a
//! distributed object store
//!
//! The store only offers single-object atomic operations.  The requests in
//! this crate string those operations together and, on failure, undo what
//! they already did.  The main entry point is [`CloneRequest`], which
//! derives a new child image from a protected snapshot of a parent image.

pub mod clone;
pub mod config;
pub mod create;
pub mod error;
pub mod features;
pub mod image;
pub mod options;
pub mod remove;
pub mod request;
pub mod sim;
pub mod store;
pub mod types;
pub mod work_queue;

pub use clone::{CloneRequest, StepHistory};
pub use error::{result_code, Error};
pub use features::Features;
pub use image::ImageCtx;
pub use options::ImageOptions;
pub use request::{ImageFactory, Request, StoreImageFactory};
pub use store::{IoCtx, ObjectStore};
pub use work_queue::OpWorkQueue;
