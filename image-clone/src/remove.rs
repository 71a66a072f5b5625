// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Store-backed removal of an image, and the smaller requests it composes
//!
//! Removal is ordered so that an interrupted remove can be retried: data
//! objects go first, then the header and its registrations, and the
//! directory entry (which makes the image visible by name) goes last.

use crate::error::Error;
use crate::features::Features;
use crate::image::{ImageCtx, StoreImageCtx};
use crate::request::{run_subrequest, ProgressContext, RemoveArgs, Request};
use crate::store::{data_object_name, IoCtx};
use crate::types::{ImageHeader, ImageId};
use async_trait::async_trait;
use slog::{debug, info, o, warn, Logger};
use slog_error_chain::InlineErrorChain;
use std::sync::Arc;

/// Removes every data object of an image, reporting progress per object
pub struct TrimRequest {
    log: Logger,
    io_ctx: IoCtx,
    object_prefix: String,
    object_count: u64,
    progress: Arc<dyn ProgressContext>,
}

impl TrimRequest {
    pub fn new(
        log: &Logger,
        io_ctx: IoCtx,
        object_prefix: String,
        object_count: u64,
        progress: Arc<dyn ProgressContext>,
    ) -> TrimRequest {
        let log = log.new(o!("request" => "trim"));
        TrimRequest { log, io_ctx, object_prefix, object_count, progress }
    }
}

#[async_trait]
impl Request for TrimRequest {
    async fn execute(self: Box<Self>) -> Result<(), Error> {
        let store = self.io_ctx.store();
        let pool = self.io_ctx.pool();
        for object_no in 0..self.object_count {
            let oid = data_object_name(&self.object_prefix, object_no);
            match store.remove_object(pool, &oid).await {
                // Sparse images never wrote most of their objects.
                Ok(()) => {}
                Err(error) if error.is_not_found() => {}
                Err(error) => return Err(error),
            }
            self.progress.update_progress(object_no + 1, self.object_count);
        }
        debug!(self.log, "trimmed data objects"; "count" => self.object_count);
        Ok(())
    }
}

/// Clears feature bits from an image header
pub struct DisableFeaturesRequest {
    log: Logger,
    io_ctx: IoCtx,
    id: ImageId,
    features: Features,
}

impl DisableFeaturesRequest {
    pub fn new(
        log: &Logger,
        io_ctx: IoCtx,
        id: ImageId,
        features: Features,
    ) -> DisableFeaturesRequest {
        let log = log.new(o!("request" => "disable_features"));
        DisableFeaturesRequest { log, io_ctx, id, features }
    }
}

#[async_trait]
impl Request for DisableFeaturesRequest {
    async fn execute(self: Box<Self>) -> Result<(), Error> {
        self.io_ctx
            .store()
            .set_features(
                self.io_ctx.pool(),
                &self.id,
                Features::empty(),
                self.features,
            )
            .await?;
        debug!(self.log, "disabled features"; "features" => ?self.features);
        Ok(())
    }
}

pub struct RemoveRequest {
    log: Logger,
    io_ctx: IoCtx,
    args: RemoveArgs,
}

impl RemoveRequest {
    pub fn new(log: &Logger, io_ctx: IoCtx, args: RemoveArgs) -> RemoveRequest {
        let log = log.new(o!("saga" => "remove", "image" => args.name.clone()));
        RemoveRequest { log, io_ctx, args }
    }

    /// Clean up after an image whose header is already gone
    async fn remove_dangling(&self) -> Result<(), Error> {
        let store = self.io_ctx.store();
        let pool = self.io_ctx.pool();
        let id = match &self.args.id {
            Some(id) => Some(id.clone()),
            None => store.dir_list(pool).await?.remove(&self.args.name),
        };
        let Some(id) = id else {
            return Ok(());
        };
        info!(self.log, "image already gone; removing directory entry";
            "id" => %id);
        tolerate_not_found(
            store.dir_remove_image(pool, &self.args.name, &id).await,
        )
    }

    /// Preconditions checked with the image open
    async fn check_removable(
        &self,
        image: &StoreImageCtx,
        header: &ImageHeader,
        id: &ImageId,
    ) -> Result<(), Error> {
        let store = self.io_ctx.store();
        let pool = self.io_ctx.pool();

        if !header.snapshots.is_empty() {
            return Err(Error::NotEmpty {
                message: format!(
                    "image {} has {} snapshot(s)",
                    self.args.name,
                    header.snapshots.len()
                ),
            });
        }

        let ours = image.watch_cookie();
        let others = store
            .list_watchers(pool, id)
            .await?
            .into_iter()
            .filter(|w| Some(w.cookie) != ours)
            .count();
        if others > 0 {
            if !self.args.force {
                return Err(Error::Busy {
                    message: format!(
                        "image {} has {} other watcher(s)",
                        self.args.name, others
                    ),
                });
            }
            warn!(self.log, "removing image with watchers"; "count" => others);
        }

        if let Some(group) = store.image_get_group(pool, id).await? {
            return Err(Error::invalid_request(&format!(
                "image {} belongs to group {}",
                self.args.name, group.group_id
            )));
        }
        Ok(())
    }

    /// Steps that need the image open: checks, trim, feature disable
    async fn prepare(
        &self,
        image: &StoreImageCtx,
        header: &ImageHeader,
        id: &ImageId,
    ) -> Result<(), Error> {
        self.check_removable(image, header, id).await?;

        let data_io_ctx = match header.data_pool {
            Some(pool) => self.io_ctx.with_pool(pool),
            None => self.io_ctx.clone(),
        };
        run_subrequest(Box::new(TrimRequest::new(
            &self.log,
            data_io_ctx,
            header.object_prefix.clone(),
            header.object_count(header.size),
            self.args.progress.clone(),
        )))
        .await?;

        let disable = header.features & Features::DISABLE_BEFORE_REMOVE;
        if !disable.is_empty() {
            run_subrequest(Box::new(DisableFeaturesRequest::new(
                &self.log,
                self.io_ctx.clone(),
                id.clone(),
                disable,
            )))
            .await?;
        }
        Ok(())
    }

    async fn run(&self) -> Result<(), Error> {
        let store = self.io_ctx.store();
        let pool = self.io_ctx.pool();

        let mut image = StoreImageCtx::new(
            &self.log,
            self.io_ctx.clone(),
            self.args.name.clone(),
            self.args.id.clone(),
            None,
        );
        match image.open().await {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {
                return self.remove_dangling().await;
            }
            Err(error) => return Err(error),
        }
        let (Some(header), Some(id)) =
            (image.header().cloned(), image.id().cloned())
        else {
            return Err(Error::internal_error("opened image has no header"));
        };

        if let Err(error) = self.prepare(&image, &header, &id).await {
            if let Err(close_error) = image.close().await {
                warn!(
                    self.log,
                    "failed to close image after aborted remove";
                    "error" => %InlineErrorChain::new(&close_error),
                );
            }
            return Err(error);
        }
        image.close().await?;

        if let Some(parent) = &header.parent {
            tolerate_not_found(store.remove_child(pool, &parent.spec, &id).await)?;
        }
        store.remove_header(pool, &id).await?;

        match store.mirror_image_get(pool, &id).await {
            Ok(_) => store.mirror_image_remove(pool, &id).await?,
            Err(error) if error.is_not_found() => {}
            Err(error) => return Err(error),
        }

        tolerate_not_found(store.remove_id(pool, &self.args.name).await)?;
        tolerate_not_found(
            store.dir_remove_image(pool, &self.args.name, &id).await,
        )?;
        Ok(())
    }
}

#[async_trait]
impl Request for RemoveRequest {
    async fn execute(self: Box<Self>) -> Result<(), Error> {
        debug!(self.log, "removing image"; "force" => self.args.force);
        match self.run().await {
            Ok(()) => {
                info!(self.log, "removed image");
                Ok(())
            }
            Err(error) => {
                warn!(
                    self.log,
                    "failed to remove image";
                    "error" => %InlineErrorChain::new(&error),
                );
                Err(error)
            }
        }
    }
}

fn tolerate_not_found(result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Err(error) if error.is_not_found() => Ok(()),
        other => other,
    }
}
