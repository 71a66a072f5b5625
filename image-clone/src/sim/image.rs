// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory implementation of [`ImageCtx`]

use crate::error::{Error, ResourceType};
use crate::image::ImageCtx;
use crate::store::Metadata;
use crate::types::{ImageHeader, PoolId, ProtectionStatus, SnapId};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::Mutex;

/// Every operation of [`ImageCtx`] that may fail, for call logs and fault
/// injection
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum ImageOp {
    Open,
    Close,
    Refresh,
    IsPrimary,
    SnapProtectionStatus,
    MetadataList,
    MetadataSet,
}

/// State that changes underneath the handle, as another client's writes
/// would
struct Live {
    protection: BTreeMap<SnapId, ProtectionStatus>,
    metadata: Metadata,
    primary: bool,
    faults: BTreeMap<ImageOp, VecDeque<Error>>,
    calls: Vec<ImageOp>,
}

/// A simulated image handle that owns its header outright
///
/// Created open.  Snapshot protection and metadata are "live": changes made
/// with [`SimImage::set_protection`] are seen by
/// [`ImageCtx::snap_protection_status`] but not by the cached header.
pub struct SimImage {
    name: String,
    pool: PoolId,
    snap_id: Option<SnapId>,
    old_format: bool,
    header: ImageHeader,
    open: bool,
    live: Mutex<Live>,
}

impl SimImage {
    pub fn new(
        name: &str,
        pool: PoolId,
        header: ImageHeader,
        snap_id: Option<SnapId>,
    ) -> SimImage {
        let protection = header
            .snapshots
            .iter()
            .map(|(id, snap)| (*id, snap.protection))
            .collect();
        SimImage {
            name: name.to_string(),
            pool,
            snap_id,
            old_format: false,
            header,
            open: true,
            live: Mutex::new(Live {
                protection,
                metadata: Metadata::new(),
                primary: true,
                faults: BTreeMap::new(),
                calls: Vec::new(),
            }),
        }
    }

    pub fn with_old_format(mut self) -> SimImage {
        self.old_format = true;
        self
    }

    pub fn set_metadata(&self, key: &str, value: &[u8]) {
        self.live
            .lock()
            .unwrap()
            .metadata
            .insert(key.to_string(), value.to_vec());
    }

    pub fn set_primary(&self, primary: bool) {
        self.live.lock().unwrap().primary = primary;
    }

    /// Make the next call to `op` fail with `error`
    pub fn inject_error(&self, op: ImageOp, error: Error) {
        self.live
            .lock()
            .unwrap()
            .faults
            .entry(op)
            .or_default()
            .push_back(error);
    }

    pub fn calls(&self) -> Vec<ImageOp> {
        self.live.lock().unwrap().calls.clone()
    }

    fn begin(&self, op: ImageOp) -> Result<(), Error> {
        let mut live = self.live.lock().unwrap();
        live.calls.push(op);
        match live.faults.get_mut(&op).and_then(|queue| queue.pop_front()) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.open {
            Ok(())
        } else {
            Err(Error::invalid_request(&format!(
                "image {} is not open",
                self.name
            )))
        }
    }
}

#[async_trait]
impl ImageCtx for SimImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn pool(&self) -> PoolId {
        self.pool
    }

    fn snap_id(&self) -> Option<SnapId> {
        self.snap_id
    }

    fn old_format(&self) -> bool {
        self.old_format
    }

    fn header(&self) -> Option<&ImageHeader> {
        self.open.then_some(&self.header)
    }

    async fn open(&mut self) -> Result<(), Error> {
        self.begin(ImageOp::Open)?;
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.begin(ImageOp::Close)?;
        self.open = false;
        Ok(())
    }

    async fn refresh(&mut self) -> Result<(), Error> {
        self.begin(ImageOp::Refresh)?;
        self.check_open()?;
        let live = self.live.lock().unwrap();
        for (snap_id, protection) in &live.protection {
            if let Some(snap) = self.header.snapshots.get_mut(snap_id) {
                snap.protection = *protection;
            }
        }
        Ok(())
    }

    async fn is_primary(&self) -> Result<bool, Error> {
        self.begin(ImageOp::IsPrimary)?;
        self.check_open()?;
        Ok(self.live.lock().unwrap().primary)
    }

    async fn snap_protection_status(
        &self,
        snap_id: SnapId,
    ) -> Result<ProtectionStatus, Error> {
        self.begin(ImageOp::SnapProtectionStatus)?;
        self.check_open()?;
        self.live.lock().unwrap().protection.get(&snap_id).copied().ok_or_else(
            || {
                Error::not_found(
                    ResourceType::Snapshot,
                    format!("{}@{}", self.name, snap_id),
                )
            },
        )
    }

    async fn metadata_list(
        &self,
        start_after: &str,
        max: usize,
    ) -> Result<Metadata, Error> {
        self.begin(ImageOp::MetadataList)?;
        self.check_open()?;
        Ok(self
            .live
            .lock()
            .unwrap()
            .metadata
            .range::<str, _>((Bound::Excluded(start_after), Bound::Unbounded))
            .take(max)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn metadata_set(&self, pairs: &Metadata) -> Result<(), Error> {
        self.begin(ImageOp::MetadataSet)?;
        self.check_open()?;
        self.live
            .lock()
            .unwrap()
            .metadata
            .extend(pairs.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}
