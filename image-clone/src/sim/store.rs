// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory implementation of [`ObjectStore`]

use crate::error::{Error, ResourceType};
use crate::features::Features;
use crate::store::{Metadata, ObjectStore};
use crate::types::{
    GroupSpec, ImageHeader, ImageId, MirrorImage, ParentLink, ParentSpec,
    PoolId, ProtectionStatus, SnapId, SnapInfo, Watcher,
};
use async_trait::async_trait;
use slog::{debug, Logger};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};

/// Every operation of [`ObjectStore`], for call logs and fault injection
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum StoreOp {
    GetId,
    CreateId,
    RemoveId,
    DirAddImage,
    DirRemoveImage,
    DirList,
    CreateHeader,
    GetHeader,
    RemoveHeader,
    SetParent,
    SetFeatures,
    GetSnapProtectionStatus,
    AddChild,
    RemoveChild,
    GetChildren,
    MetadataList,
    MetadataSet,
    MirrorImageGet,
    MirrorImageSet,
    MirrorImageRemove,
    JournalIsTagOwner,
    Watch,
    Unwatch,
    ListWatchers,
    ImageGetGroup,
    RemoveObject,
}

/// A header object and the auxiliary state stored alongside it
struct HeaderRecord {
    header: ImageHeader,
    metadata: Metadata,
    watchers: BTreeMap<u64, Watcher>,
    tag_owner: bool,
    group: Option<GroupSpec>,
}

#[derive(Default)]
struct PoolState {
    ids: BTreeMap<String, ImageId>,
    directory: BTreeMap<String, ImageId>,
    headers: BTreeMap<ImageId, HeaderRecord>,
    children: BTreeMap<ParentSpec, BTreeSet<ImageId>>,
    mirror_images: BTreeMap<ImageId, MirrorImage>,
    data_objects: BTreeSet<String>,
    metadata_unsupported: bool,
}

impl PoolState {
    fn record(&self, id: &ImageId) -> Result<&HeaderRecord, Error> {
        self.headers
            .get(id)
            .ok_or_else(|| Error::not_found(ResourceType::ImageHeader, id))
    }

    fn record_mut(&mut self, id: &ImageId) -> Result<&mut HeaderRecord, Error> {
        self.headers
            .get_mut(id)
            .ok_or_else(|| Error::not_found(ResourceType::ImageHeader, id))
    }
}

#[derive(Default)]
struct Inner {
    pools: BTreeMap<PoolId, PoolState>,
    faults: BTreeMap<StoreOp, VecDeque<Error>>,
    calls: Vec<StoreOp>,
    next_cookie: u64,
}

impl Inner {
    fn pool(&mut self, pool: PoolId) -> &mut PoolState {
        self.pools.entry(pool).or_default()
    }
}

/// Simulated object store
///
/// Pools spring into existence on first use.
pub struct SimStore {
    log: Logger,
    inner: Mutex<Inner>,
}

impl SimStore {
    pub fn new(log: &Logger) -> SimStore {
        SimStore {
            log: log.new(slog::o!("component" => "SimStore")),
            inner: Mutex::new(Inner { next_cookie: 1, ..Default::default() }),
        }
    }

    /// Record a call to `op` and fail it if a fault is queued for it
    fn begin(&self, op: StoreOp) -> Result<MutexGuard<'_, Inner>, Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(op);
        if let Some(error) =
            inner.faults.get_mut(&op).and_then(|queue| queue.pop_front())
        {
            debug!(self.log, "injecting failure"; "op" => %op, "error" => %error);
            return Err(error);
        }
        Ok(inner)
    }

    /// Make the next call to `op` fail with `error`
    ///
    /// Faults for the same operation are consumed in the order injected.
    pub fn inject_error(&self, op: StoreOp, error: Error) {
        let mut inner = self.inner.lock().unwrap();
        inner.faults.entry(op).or_default().push_back(error);
    }

    /// Every operation issued so far, in order
    pub fn calls(&self) -> Vec<StoreOp> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, op: StoreOp) -> usize {
        self.inner.lock().unwrap().calls.iter().filter(|c| **c == op).count()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().unwrap().calls.clear();
    }

    /// Create an image directly, bypassing the call log
    ///
    /// The image gets a fresh id, a directory entry, and a header with 4 MiB
    /// objects and default striping.
    pub fn seed_image(
        &self,
        pool: PoolId,
        name: &str,
        features: Features,
        size: u64,
    ) -> ImageId {
        let id = ImageId::generate();
        let header = ImageHeader {
            id: id.clone(),
            size,
            order: 22,
            features,
            stripe_unit: 1 << 22,
            stripe_count: 1,
            data_pool: None,
            object_prefix: id.object_prefix(),
            parent: None,
            snapshots: BTreeMap::new(),
        };
        let mut inner = self.inner.lock().unwrap();
        let state = inner.pool(pool);
        state.ids.insert(name.to_string(), id.clone());
        state.directory.insert(name.to_string(), id.clone());
        state.headers.insert(
            id.clone(),
            HeaderRecord {
                header,
                metadata: Metadata::new(),
                watchers: BTreeMap::new(),
                tag_owner: true,
                group: None,
            },
        );
        id
    }

    fn with_record<T>(
        &self,
        pool: PoolId,
        id: &ImageId,
        f: impl FnOnce(&mut HeaderRecord) -> T,
    ) -> T {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .pool(pool)
            .headers
            .get_mut(id)
            .unwrap_or_else(|| panic!("no image {id} in pool {pool}"));
        f(record)
    }

    /// Add a protected snapshot at the image's current size
    ///
    /// Panics if the image does not exist.
    pub fn seed_snapshot(
        &self,
        pool: PoolId,
        id: &ImageId,
        snap_id: SnapId,
        name: &str,
    ) {
        self.with_record(pool, id, |record| {
            let size = record.header.size;
            record.header.snapshots.insert(
                snap_id,
                SnapInfo {
                    name: name.to_string(),
                    size,
                    protection: ProtectionStatus::Protected,
                },
            );
        })
    }

    /// Panics if the image or snapshot does not exist.
    pub fn set_snap_protection(
        &self,
        pool: PoolId,
        id: &ImageId,
        snap_id: SnapId,
        protection: ProtectionStatus,
    ) {
        self.with_record(pool, id, |record| {
            record
                .header
                .snapshots
                .get_mut(&snap_id)
                .unwrap_or_else(|| panic!("no snapshot {snap_id} of {id}"))
                .protection = protection;
        })
    }

    pub fn seed_metadata(
        &self,
        pool: PoolId,
        id: &ImageId,
        key: &str,
        value: &[u8],
    ) {
        self.with_record(pool, id, |record| {
            record.metadata.insert(key.to_string(), value.to_vec());
        })
    }

    /// Set whether this site owns the image's journal
    pub fn set_tag_owner(&self, pool: PoolId, id: &ImageId, owner: bool) {
        self.with_record(pool, id, |record| record.tag_owner = owner)
    }

    pub fn set_group(&self, pool: PoolId, id: &ImageId, group: GroupSpec) {
        self.with_record(pool, id, |record| record.group = Some(group))
    }

    /// Make metadata listing in `pool` fail with `NotSupported`, as an old
    /// store would
    pub fn set_metadata_unsupported(&self, pool: PoolId, unsupported: bool) {
        self.inner.lock().unwrap().pool(pool).metadata_unsupported = unsupported;
    }

    pub fn seed_data_object(&self, pool: PoolId, oid: &str) {
        self.inner.lock().unwrap().pool(pool).data_objects.insert(oid.to_string());
    }

    pub fn data_object_count(&self, pool: PoolId) -> usize {
        self.inner.lock().unwrap().pool(pool).data_objects.len()
    }
}

#[async_trait]
impl ObjectStore for SimStore {
    async fn get_id(&self, pool: PoolId, name: &str) -> Result<ImageId, Error> {
        let mut inner = self.begin(StoreOp::GetId)?;
        inner
            .pool(pool)
            .ids
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(ResourceType::ImageId, name))
    }

    async fn create_id(
        &self,
        pool: PoolId,
        name: &str,
        id: &ImageId,
    ) -> Result<(), Error> {
        let mut inner = self.begin(StoreOp::CreateId)?;
        let ids = &mut inner.pool(pool).ids;
        if ids.contains_key(name) {
            return Err(Error::already_exists(ResourceType::ImageId, name));
        }
        ids.insert(name.to_string(), id.clone());
        Ok(())
    }

    async fn remove_id(&self, pool: PoolId, name: &str) -> Result<(), Error> {
        let mut inner = self.begin(StoreOp::RemoveId)?;
        inner
            .pool(pool)
            .ids
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(ResourceType::ImageId, name))
    }

    async fn dir_add_image(
        &self,
        pool: PoolId,
        name: &str,
        id: &ImageId,
    ) -> Result<(), Error> {
        let mut inner = self.begin(StoreOp::DirAddImage)?;
        let directory = &mut inner.pool(pool).directory;
        if directory.contains_key(name) {
            return Err(Error::already_exists(ResourceType::DirectoryEntry, name));
        }
        if directory.values().any(|existing| existing == id) {
            return Err(Error::already_exists(ResourceType::DirectoryEntry, id));
        }
        directory.insert(name.to_string(), id.clone());
        Ok(())
    }

    async fn dir_remove_image(
        &self,
        pool: PoolId,
        name: &str,
        id: &ImageId,
    ) -> Result<(), Error> {
        let mut inner = self.begin(StoreOp::DirRemoveImage)?;
        let directory = &mut inner.pool(pool).directory;
        match directory.get(name) {
            Some(existing) if existing == id => {
                directory.remove(name);
                Ok(())
            }
            _ => Err(Error::not_found(
                ResourceType::DirectoryEntry,
                format!("{name} -> {id}"),
            )),
        }
    }

    async fn dir_list(
        &self,
        pool: PoolId,
    ) -> Result<BTreeMap<String, ImageId>, Error> {
        let mut inner = self.begin(StoreOp::DirList)?;
        Ok(inner.pool(pool).directory.clone())
    }

    async fn create_header(
        &self,
        pool: PoolId,
        header: &ImageHeader,
    ) -> Result<(), Error> {
        let mut inner = self.begin(StoreOp::CreateHeader)?;
        let headers = &mut inner.pool(pool).headers;
        if headers.contains_key(&header.id) {
            return Err(Error::already_exists(
                ResourceType::ImageHeader,
                &header.id,
            ));
        }
        headers.insert(
            header.id.clone(),
            HeaderRecord {
                header: header.clone(),
                metadata: Metadata::new(),
                watchers: BTreeMap::new(),
                tag_owner: true,
                group: None,
            },
        );
        Ok(())
    }

    async fn get_header(
        &self,
        pool: PoolId,
        id: &ImageId,
    ) -> Result<ImageHeader, Error> {
        let mut inner = self.begin(StoreOp::GetHeader)?;
        Ok(inner.pool(pool).record(id)?.header.clone())
    }

    async fn remove_header(
        &self,
        pool: PoolId,
        id: &ImageId,
    ) -> Result<(), Error> {
        let mut inner = self.begin(StoreOp::RemoveHeader)?;
        inner
            .pool(pool)
            .headers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(ResourceType::ImageHeader, id))
    }

    async fn set_parent(
        &self,
        pool: PoolId,
        id: &ImageId,
        parent: &ParentSpec,
        size: u64,
    ) -> Result<(), Error> {
        let mut inner = self.begin(StoreOp::SetParent)?;
        let header = &mut inner.pool(pool).record_mut(id)?.header;
        let link = ParentLink { spec: parent.clone(), overlap: size };
        if let Some(existing) = &header.parent {
            if *existing == link {
                return Ok(());
            }
            return Err(Error::already_exists(
                ResourceType::ImageHeader,
                format!("{id} already has parent {}", existing.spec),
            ));
        }
        header.parent = Some(link);
        Ok(())
    }

    async fn set_features(
        &self,
        pool: PoolId,
        id: &ImageId,
        features: Features,
        mask: Features,
    ) -> Result<(), Error> {
        let mut inner = self.begin(StoreOp::SetFeatures)?;
        let header = &mut inner.pool(pool).record_mut(id)?.header;
        header.features = (header.features - mask) | (features & mask);
        Ok(())
    }

    async fn get_snap_protection_status(
        &self,
        pool: PoolId,
        id: &ImageId,
        snap_id: SnapId,
    ) -> Result<ProtectionStatus, Error> {
        let mut inner = self.begin(StoreOp::GetSnapProtectionStatus)?;
        inner
            .pool(pool)
            .record(id)?
            .header
            .snapshots
            .get(&snap_id)
            .map(|snap| snap.protection)
            .ok_or_else(|| {
                Error::not_found(ResourceType::Snapshot, format!("{id}@{snap_id}"))
            })
    }

    async fn add_child(
        &self,
        pool: PoolId,
        parent: &ParentSpec,
        child: &ImageId,
    ) -> Result<(), Error> {
        let mut inner = self.begin(StoreOp::AddChild)?;
        inner
            .pool(pool)
            .children
            .entry(parent.clone())
            .or_default()
            .insert(child.clone());
        Ok(())
    }

    async fn remove_child(
        &self,
        pool: PoolId,
        parent: &ParentSpec,
        child: &ImageId,
    ) -> Result<(), Error> {
        let mut inner = self.begin(StoreOp::RemoveChild)?;
        let children = &mut inner.pool(pool).children;
        let removed = children
            .get_mut(parent)
            .is_some_and(|set| set.remove(child));
        if !removed {
            return Err(Error::not_found(
                ResourceType::ChildRegistration,
                format!("{child} under {parent}"),
            ));
        }
        if children.get(parent).is_some_and(|set| set.is_empty()) {
            children.remove(parent);
        }
        Ok(())
    }

    async fn get_children(
        &self,
        pool: PoolId,
        parent: &ParentSpec,
    ) -> Result<BTreeSet<ImageId>, Error> {
        let mut inner = self.begin(StoreOp::GetChildren)?;
        Ok(inner.pool(pool).children.get(parent).cloned().unwrap_or_default())
    }

    async fn metadata_list(
        &self,
        pool: PoolId,
        id: &ImageId,
        start_after: &str,
        max: usize,
    ) -> Result<Metadata, Error> {
        let mut inner = self.begin(StoreOp::MetadataList)?;
        let state = inner.pool(pool);
        if state.metadata_unsupported {
            return Err(Error::NotSupported {
                message: "metadata_list".to_string(),
            });
        }
        Ok(state
            .record(id)?
            .metadata
            .range::<str, _>((Bound::Excluded(start_after), Bound::Unbounded))
            .take(max)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn metadata_set(
        &self,
        pool: PoolId,
        id: &ImageId,
        pairs: &Metadata,
    ) -> Result<(), Error> {
        let mut inner = self.begin(StoreOp::MetadataSet)?;
        let record = inner.pool(pool).record_mut(id)?;
        record
            .metadata
            .extend(pairs.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn mirror_image_get(
        &self,
        pool: PoolId,
        id: &ImageId,
    ) -> Result<MirrorImage, Error> {
        let mut inner = self.begin(StoreOp::MirrorImageGet)?;
        inner
            .pool(pool)
            .mirror_images
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(ResourceType::MirrorImage, id))
    }

    async fn mirror_image_set(
        &self,
        pool: PoolId,
        id: &ImageId,
        mirror_image: &MirrorImage,
    ) -> Result<(), Error> {
        let mut inner = self.begin(StoreOp::MirrorImageSet)?;
        inner.pool(pool).mirror_images.insert(id.clone(), mirror_image.clone());
        Ok(())
    }

    async fn mirror_image_remove(
        &self,
        pool: PoolId,
        id: &ImageId,
    ) -> Result<(), Error> {
        let mut inner = self.begin(StoreOp::MirrorImageRemove)?;
        inner
            .pool(pool)
            .mirror_images
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(ResourceType::MirrorImage, id))
    }

    async fn journal_is_tag_owner(
        &self,
        pool: PoolId,
        id: &ImageId,
    ) -> Result<bool, Error> {
        let mut inner = self.begin(StoreOp::JournalIsTagOwner)?;
        Ok(inner.pool(pool).record(id)?.tag_owner)
    }

    async fn watch(&self, pool: PoolId, id: &ImageId) -> Result<u64, Error> {
        let mut inner = self.begin(StoreOp::Watch)?;
        let cookie = inner.next_cookie;
        inner.next_cookie += 1;
        inner.pool(pool).record_mut(id)?.watchers.insert(
            cookie,
            Watcher { address: format!("sim-client.{cookie}"), cookie },
        );
        Ok(cookie)
    }

    async fn unwatch(
        &self,
        pool: PoolId,
        id: &ImageId,
        cookie: u64,
    ) -> Result<(), Error> {
        let mut inner = self.begin(StoreOp::Unwatch)?;
        // Watches die with their header.
        let Some(record) = inner.pool(pool).headers.get_mut(id) else {
            return Ok(());
        };
        record.watchers.remove(&cookie);
        Ok(())
    }

    async fn list_watchers(
        &self,
        pool: PoolId,
        id: &ImageId,
    ) -> Result<Vec<Watcher>, Error> {
        let mut inner = self.begin(StoreOp::ListWatchers)?;
        Ok(inner.pool(pool).record(id)?.watchers.values().cloned().collect())
    }

    async fn image_get_group(
        &self,
        pool: PoolId,
        id: &ImageId,
    ) -> Result<Option<GroupSpec>, Error> {
        let mut inner = self.begin(StoreOp::ImageGetGroup)?;
        Ok(inner.pool(pool).record(id)?.group.clone())
    }

    async fn remove_object(&self, pool: PoolId, oid: &str) -> Result<(), Error> {
        let mut inner = self.begin(StoreOp::RemoveObject)?;
        if inner.pool(pool).data_objects.remove(oid) {
            Ok(())
        } else {
            Err(Error::not_found(ResourceType::DataObject, oid))
        }
    }
}
