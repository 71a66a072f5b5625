// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the remote object store
//!
//! Each method is a single-object atomic operation.  Nothing coordinates
//! operations across objects; that is the job of the sagas built on top.

use crate::error::Error;
use crate::features::Features;
use crate::types::{
    GroupSpec, ImageHeader, ImageId, MirrorImage, ParentSpec, PoolId,
    ProtectionStatus, SnapId, Watcher,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Free-form key/value metadata attached to an image header
pub type Metadata = BTreeMap<String, Vec<u8>>;

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Look up the id of the image called `name`
    async fn get_id(&self, pool: PoolId, name: &str) -> Result<ImageId, Error>;

    /// Create the name -> id object for a new image.  Fails with
    /// `ObjectAlreadyExists` if `name` is taken.
    async fn create_id(
        &self,
        pool: PoolId,
        name: &str,
        id: &ImageId,
    ) -> Result<(), Error>;

    async fn remove_id(&self, pool: PoolId, name: &str) -> Result<(), Error>;

    /// Map `name` to `id` in the pool directory.  Fails with
    /// `ObjectAlreadyExists` if either is already present.
    async fn dir_add_image(
        &self,
        pool: PoolId,
        name: &str,
        id: &ImageId,
    ) -> Result<(), Error>;

    /// Remove the `name` -> `id` directory entry.  Fails with `NotFound` if
    /// absent.
    async fn dir_remove_image(
        &self,
        pool: PoolId,
        name: &str,
        id: &ImageId,
    ) -> Result<(), Error>;

    async fn dir_list(
        &self,
        pool: PoolId,
    ) -> Result<BTreeMap<String, ImageId>, Error>;

    async fn create_header(
        &self,
        pool: PoolId,
        header: &ImageHeader,
    ) -> Result<(), Error>;

    async fn get_header(
        &self,
        pool: PoolId,
        id: &ImageId,
    ) -> Result<ImageHeader, Error>;

    async fn remove_header(
        &self,
        pool: PoolId,
        id: &ImageId,
    ) -> Result<(), Error>;

    /// Write the parent link and overlap into the child's header
    ///
    /// Succeeds without change if the identical link is already present;
    /// fails with `ObjectAlreadyExists` if a different link is present.
    async fn set_parent(
        &self,
        pool: PoolId,
        id: &ImageId,
        parent: &ParentSpec,
        size: u64,
    ) -> Result<(), Error>;

    /// Replace the bits selected by `mask` with those of `features`
    async fn set_features(
        &self,
        pool: PoolId,
        id: &ImageId,
        features: Features,
        mask: Features,
    ) -> Result<(), Error>;

    async fn get_snap_protection_status(
        &self,
        pool: PoolId,
        id: &ImageId,
        snap_id: SnapId,
    ) -> Result<ProtectionStatus, Error>;

    /// Register `child` under `parent` in the pool's children index
    ///
    /// Additive: registering an already-registered child succeeds.
    async fn add_child(
        &self,
        pool: PoolId,
        parent: &ParentSpec,
        child: &ImageId,
    ) -> Result<(), Error>;

    /// Unregister `child`.  Fails with `NotFound` if it is not registered.
    async fn remove_child(
        &self,
        pool: PoolId,
        parent: &ParentSpec,
        child: &ImageId,
    ) -> Result<(), Error>;

    async fn get_children(
        &self,
        pool: PoolId,
        parent: &ParentSpec,
    ) -> Result<BTreeSet<ImageId>, Error>;

    /// List up to `max` metadata pairs with keys strictly greater than
    /// `start_after`, in key order
    async fn metadata_list(
        &self,
        pool: PoolId,
        id: &ImageId,
        start_after: &str,
        max: usize,
    ) -> Result<Metadata, Error>;

    /// Set every pair in `pairs` in one atomic update
    async fn metadata_set(
        &self,
        pool: PoolId,
        id: &ImageId,
        pairs: &Metadata,
    ) -> Result<(), Error>;

    async fn mirror_image_get(
        &self,
        pool: PoolId,
        id: &ImageId,
    ) -> Result<MirrorImage, Error>;

    async fn mirror_image_set(
        &self,
        pool: PoolId,
        id: &ImageId,
        mirror_image: &MirrorImage,
    ) -> Result<(), Error>;

    async fn mirror_image_remove(
        &self,
        pool: PoolId,
        id: &ImageId,
    ) -> Result<(), Error>;

    /// Whether this site owns the image's journal (i.e., is the mirroring
    /// primary)
    async fn journal_is_tag_owner(
        &self,
        pool: PoolId,
        id: &ImageId,
    ) -> Result<bool, Error>;

    async fn watch(&self, pool: PoolId, id: &ImageId) -> Result<u64, Error>;

    async fn unwatch(
        &self,
        pool: PoolId,
        id: &ImageId,
        cookie: u64,
    ) -> Result<(), Error>;

    async fn list_watchers(
        &self,
        pool: PoolId,
        id: &ImageId,
    ) -> Result<Vec<Watcher>, Error>;

    async fn image_get_group(
        &self,
        pool: PoolId,
        id: &ImageId,
    ) -> Result<Option<GroupSpec>, Error>;

    /// Remove a single data object.  Fails with `NotFound` if absent.
    async fn remove_object(&self, pool: PoolId, oid: &str) -> Result<(), Error>;
}

/// A handle on one pool of the object store
///
/// Cheap to clone; every clone refers to the same store.
#[derive(Clone)]
pub struct IoCtx {
    pool: PoolId,
    store: Arc<dyn ObjectStore>,
}

impl IoCtx {
    pub fn new(pool: PoolId, store: Arc<dyn ObjectStore>) -> IoCtx {
        IoCtx { pool, store }
    }

    pub fn pool(&self) -> PoolId {
        self.pool
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// A handle on another pool of the same store
    pub fn with_pool(&self, pool: PoolId) -> IoCtx {
        IoCtx { pool, store: Arc::clone(&self.store) }
    }
}

impl fmt::Debug for IoCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoCtx").field("pool", &self.pool).finish_non_exhaustive()
    }
}

/// Name of the data object holding object number `object_no` of an image
pub fn data_object_name(object_prefix: &str, object_no: u64) -> String {
    format!("{object_prefix}.{object_no:016x}")
}
