// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Identifiers and on-store records shared by the image sagas

use crate::features::Features;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Length of a generated image id, in hex characters
const IMAGE_ID_LEN: usize = 12;

/// Identifies a pool within the object store
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PoolId(pub i64);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a snapshot within an image
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SnapId(pub u64);

impl fmt::Display for SnapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The store-assigned, immutable identifier of an image
///
/// Unlike the image name, the id never changes over the lifetime of the
/// image and is what all per-image objects are keyed on.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ImageId(String);

impl ImageId {
    pub fn new(id: impl Into<String>) -> ImageId {
        ImageId(id.into())
    }

    /// Allocate a fresh, random image id
    pub fn generate() -> ImageId {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(IMAGE_ID_LEN);
        ImageId(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix of the data objects belonging to this image
    pub fn object_prefix(&self) -> String {
        format!("rbd_data.{}", self.0)
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies the parent snapshot of a cloned image
///
/// This is the key of the children registration: every child cloned from
/// the same snapshot is registered under the same `ParentSpec`.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ParentSpec {
    pub pool_id: PoolId,
    pub image_id: ImageId,
    pub snap_id: SnapId,
}

impl fmt::Display for ParentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.pool_id, self.image_id, self.snap_id)
    }
}

/// The parent link stored in a child's header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub spec: ParentSpec,
    /// Portion of the child (in bytes) that is still backed by the parent
    pub overlap: u64,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum ProtectionStatus {
    Unprotected,
    Unprotecting,
    Protected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapInfo {
    pub name: String,
    pub size: u64,
    pub protection: ProtectionStatus,
}

/// The structured header of an image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHeader {
    pub id: ImageId,
    pub size: u64,
    pub order: u8,
    pub features: Features,
    pub stripe_unit: u64,
    pub stripe_count: u64,
    pub data_pool: Option<PoolId>,
    pub object_prefix: String,
    pub parent: Option<ParentLink>,
    pub snapshots: BTreeMap<SnapId, SnapInfo>,
}

impl ImageHeader {
    pub fn object_size(&self) -> u64 {
        1u64 << self.order
    }

    /// Number of data objects needed to back `size` bytes
    pub fn object_count(&self, size: u64) -> u64 {
        size.div_ceil(self.object_size())
    }
}

/// Mirroring record for an image replicated across sites
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorImage {
    pub global_image_id: String,
    /// Set on records created on behalf of a remote primary
    pub primary_mirror_uuid: Option<String>,
}

/// Provenance of a clone created as a replica of a remote primary
///
/// When both fields are `None`, the clone is an ordinary primary-side clone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorProvenance {
    pub non_primary_global_image_id: Option<String>,
    pub primary_mirror_uuid: Option<String>,
}

impl MirrorProvenance {
    pub fn is_non_primary(&self) -> bool {
        self.non_primary_global_image_id.is_some()
    }
}

/// A client watching an image header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watcher {
    pub address: String,
    pub cookie: u64,
}

/// Consistency group an image belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub pool_id: PoolId,
    pub group_id: String,
}
