// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Handles on open images

use crate::error::{Error, ResourceType};
use crate::features::Features;
use crate::store::{IoCtx, Metadata};
use crate::types::{ImageHeader, ImageId, PoolId, ProtectionStatus, SnapId};
use async_trait::async_trait;
use slog::{debug, o, warn, Logger};
use slog_error_chain::InlineErrorChain;

/// The capabilities the image sagas need from an image handle
///
/// Header accessors answer from the handle's cached copy and never touch the
/// store; the async methods may issue remote calls.
#[async_trait]
pub trait ImageCtx: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn pool(&self) -> PoolId;

    /// The snapshot this handle was opened at, or `None` for the head
    fn snap_id(&self) -> Option<SnapId>;

    /// Whether the image uses the original, pre-layering on-store format
    fn old_format(&self) -> bool;

    /// The cached header, if the image is open
    fn header(&self) -> Option<&ImageHeader>;

    async fn open(&mut self) -> Result<(), Error>;

    async fn close(&mut self) -> Result<(), Error>;

    /// Re-read the header from the store
    async fn refresh(&mut self) -> Result<(), Error>;

    /// Whether this site is the mirroring primary for the image
    async fn is_primary(&self) -> Result<bool, Error>;

    /// Current protection status of a snapshot, read from the store rather
    /// than the cached header
    async fn snap_protection_status(
        &self,
        snap_id: SnapId,
    ) -> Result<ProtectionStatus, Error>;

    async fn metadata_list(
        &self,
        start_after: &str,
        max: usize,
    ) -> Result<Metadata, Error>;

    async fn metadata_set(&self, pairs: &Metadata) -> Result<(), Error>;
}

/// An image handle backed by an [`crate::store::ObjectStore`]
pub struct StoreImageCtx {
    log: Logger,
    io_ctx: IoCtx,
    name: String,
    id: Option<ImageId>,
    snap_id: Option<SnapId>,
    header: Option<ImageHeader>,
    watch_cookie: Option<u64>,
}

impl StoreImageCtx {
    /// Create a closed handle on the image `name`
    ///
    /// If `id` is `None` it is looked up by name on open.
    pub fn new(
        log: &Logger,
        io_ctx: IoCtx,
        name: impl Into<String>,
        id: Option<ImageId>,
        snap_id: Option<SnapId>,
    ) -> StoreImageCtx {
        let name = name.into();
        let log = log.new(o!(
            "image" => name.clone(),
            "pool" => io_ctx.pool().to_string(),
        ));
        StoreImageCtx {
            log,
            io_ctx,
            name,
            id,
            snap_id,
            header: None,
            watch_cookie: None,
        }
    }

    pub fn id(&self) -> Option<&ImageId> {
        self.id.as_ref()
    }

    /// Cookie of this handle's own watch, while open
    pub fn watch_cookie(&self) -> Option<u64> {
        self.watch_cookie
    }

    pub fn io_ctx(&self) -> &IoCtx {
        &self.io_ctx
    }

    fn open_id(&self) -> Result<&ImageId, Error> {
        match (&self.id, &self.header) {
            (Some(id), Some(_)) => Ok(id),
            _ => Err(Error::invalid_request(&format!(
                "image {} is not open",
                self.name
            ))),
        }
    }
}

#[async_trait]
impl ImageCtx for StoreImageCtx {
    fn name(&self) -> &str {
        &self.name
    }

    fn pool(&self) -> PoolId {
        self.io_ctx.pool()
    }

    fn snap_id(&self) -> Option<SnapId> {
        self.snap_id
    }

    fn old_format(&self) -> bool {
        false
    }

    fn header(&self) -> Option<&ImageHeader> {
        self.header.as_ref()
    }

    async fn open(&mut self) -> Result<(), Error> {
        let store = self.io_ctx.store();
        let pool = self.io_ctx.pool();
        let id = match &self.id {
            Some(id) => id.clone(),
            None => store.get_id(pool, &self.name).await?,
        };

        let header = store.get_header(pool, &id).await?;
        if let Some(snap_id) = self.snap_id {
            if !header.snapshots.contains_key(&snap_id) {
                return Err(Error::not_found(
                    ResourceType::Snapshot,
                    format!("{}@{}", self.name, snap_id),
                ));
            }
        }

        let cookie = store.watch(pool, &id).await?;
        debug!(self.log, "opened image"; "id" => %id, "cookie" => cookie);
        self.id = Some(id);
        self.header = Some(header);
        self.watch_cookie = Some(cookie);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.header = None;
        let (Some(id), Some(cookie)) = (&self.id, self.watch_cookie.take())
        else {
            return Ok(());
        };

        let result =
            self.io_ctx.store().unwatch(self.io_ctx.pool(), id, cookie).await;
        match &result {
            Ok(()) => debug!(self.log, "closed image"),
            Err(error) => warn!(
                self.log,
                "failed to unregister watch on close";
                "error" => %InlineErrorChain::new(error),
            ),
        }
        result
    }

    async fn refresh(&mut self) -> Result<(), Error> {
        let id = self.open_id()?.clone();
        let header =
            self.io_ctx.store().get_header(self.io_ctx.pool(), &id).await?;
        debug!(self.log, "refreshed image"; "parent" => ?header.parent);
        self.header = Some(header);
        Ok(())
    }

    async fn is_primary(&self) -> Result<bool, Error> {
        let id = self.open_id()?;
        let journaling = self
            .header
            .as_ref()
            .is_some_and(|h| h.features.contains(Features::JOURNALING));
        if !journaling {
            return Ok(true);
        }
        self.io_ctx.store().journal_is_tag_owner(self.io_ctx.pool(), id).await
    }

    async fn snap_protection_status(
        &self,
        snap_id: SnapId,
    ) -> Result<ProtectionStatus, Error> {
        let id = self.open_id()?;
        self.io_ctx
            .store()
            .get_snap_protection_status(self.io_ctx.pool(), id, snap_id)
            .await
    }

    async fn metadata_list(
        &self,
        start_after: &str,
        max: usize,
    ) -> Result<Metadata, Error> {
        let id = self.open_id()?;
        self.io_ctx
            .store()
            .metadata_list(self.io_ctx.pool(), id, start_after, max)
            .await
    }

    async fn metadata_set(&self, pairs: &Metadata) -> Result<(), Error> {
        let id = self.open_id()?;
        self.io_ctx.store().metadata_set(self.io_ctx.pool(), id, pairs).await
    }
}
