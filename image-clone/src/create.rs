// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Store-backed creation of a new image
//!
//! Each step records how to undo itself.  If a later step fails, the recorded
//! undo actions run newest-first and the failure is reported, so a failed
//! create leaves nothing behind.

use crate::error::Error;
use crate::request::{CreateArgs, Request};
use crate::store::IoCtx;
use crate::types::{ImageHeader, MirrorImage};
use async_trait::async_trait;
use slog::{debug, info, o, warn, Logger};
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeMap;

/// Compensating actions for the create steps that have completed
#[derive(Debug, strum::Display)]
#[strum(serialize_all = "snake_case")]
enum Undo {
    RemoveId,
    DirRemoveImage,
    RemoveHeader,
    MirrorImageRemove,
}

pub struct CreateRequest {
    log: Logger,
    io_ctx: IoCtx,
    args: CreateArgs,
    undo: Vec<Undo>,
}

impl CreateRequest {
    pub fn new(log: &Logger, io_ctx: IoCtx, args: CreateArgs) -> CreateRequest {
        let log = log.new(o!(
            "saga" => "create",
            "image" => args.name.clone(),
            "id" => args.id.to_string(),
        ));
        CreateRequest { log, io_ctx, args, undo: Vec::new() }
    }

    fn header(&self) -> ImageHeader {
        let options = &self.args.options;
        ImageHeader {
            id: self.args.id.clone(),
            size: self.args.size,
            order: options.order,
            features: options.features,
            stripe_unit: options.stripe_unit,
            stripe_count: options.stripe_count,
            data_pool: options.data_pool,
            object_prefix: self.args.id.object_prefix(),
            parent: self.args.parent.clone(),
            snapshots: BTreeMap::new(),
        }
    }

    async fn run_forward(&mut self) -> Result<(), Error> {
        let store = self.io_ctx.store().clone();
        let pool = self.io_ctx.pool();
        let name = self.args.name.clone();
        let id = self.args.id.clone();

        store.create_id(pool, &name, &id).await?;
        self.undo.push(Undo::RemoveId);

        store.dir_add_image(pool, &name, &id).await?;
        self.undo.push(Undo::DirRemoveImage);

        store.create_header(pool, &self.header()).await?;
        self.undo.push(Undo::RemoveHeader);

        let mirror = &self.args.mirror;
        if let Some(global_image_id) = &mirror.non_primary_global_image_id {
            let record = MirrorImage {
                global_image_id: global_image_id.clone(),
                primary_mirror_uuid: mirror.primary_mirror_uuid.clone(),
            };
            store.mirror_image_set(pool, &id, &record).await?;
            self.undo.push(Undo::MirrorImageRemove);
        }

        self.args.progress.update_progress(1, 1);
        Ok(())
    }

    async fn unwind(&mut self) {
        let store = self.io_ctx.store().clone();
        let pool = self.io_ctx.pool();
        while let Some(undo) = self.undo.pop() {
            let result = match undo {
                Undo::RemoveId => store.remove_id(pool, &self.args.name).await,
                Undo::DirRemoveImage => {
                    store
                        .dir_remove_image(pool, &self.args.name, &self.args.id)
                        .await
                }
                Undo::RemoveHeader => {
                    store.remove_header(pool, &self.args.id).await
                }
                Undo::MirrorImageRemove => {
                    store.mirror_image_remove(pool, &self.args.id).await
                }
            };
            match result {
                Ok(()) => {
                    debug!(self.log, "undid create step"; "step" => %undo)
                }
                Err(error) if error.is_not_found() => {}
                Err(error) => warn!(
                    self.log,
                    "failed to undo create step";
                    "step" => %undo,
                    "error" => %InlineErrorChain::new(&error),
                ),
            }
        }
    }
}

#[async_trait]
impl Request for CreateRequest {
    async fn execute(mut self: Box<Self>) -> Result<(), Error> {
        debug!(self.log, "creating image"; "size" => self.args.size);
        match self.run_forward().await {
            Ok(()) => {
                info!(self.log, "created image");
                Ok(())
            }
            Err(error) => {
                warn!(
                    self.log,
                    "create failed; undoing completed steps";
                    "error" => %InlineErrorChain::new(&error),
                );
                self.unwind().await;
                Err(error)
            }
        }
    }
}
