// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The asynchronous request contract shared by all image sagas
//!
//! A request is started once and reports exactly one result.  Requests
//! compose: a saga owns at most one outstanding sub-request at a time and
//! awaits its result before issuing the next step.

use crate::error::Error;
use crate::image::{ImageCtx, StoreImageCtx};
use crate::options::ResolvedOptions;
use crate::store::IoCtx;
use crate::types::{ImageId, MirrorProvenance, ParentLink, SnapId};
use crate::work_queue::OpWorkQueue;
use async_trait::async_trait;
use slog::Logger;
use std::sync::Arc;

/// The one-shot callback through which a request reports its result
pub type Completion = Box<dyn FnOnce(Result<(), Error>) + Send + 'static>;

#[async_trait]
pub trait Request: Send + 'static {
    /// Run the request to completion
    async fn execute(self: Box<Self>) -> Result<(), Error>;
}

/// Start `request` in the background and deliver its result to `on_finish`
/// through `work_queue`
///
/// Must be called from within a tokio runtime.
pub fn send_request(
    request: Box<dyn Request>,
    work_queue: &OpWorkQueue,
    on_finish: Completion,
) {
    let work_queue = work_queue.clone();
    tokio::spawn(async move {
        let result = request.execute().await;
        work_queue.queue_completion(on_finish, result);
    });
}

/// Run `request` as a separate task and wait for its result
///
/// A panicking sub-request is reported as an internal error rather than
/// tearing down the caller.
pub async fn run_subrequest(request: Box<dyn Request>) -> Result<(), Error> {
    tokio::spawn(request.execute()).await.map_err(|error| {
        Error::internal_error(&format!("sub-request task failed: {error}"))
    })?
}

/// Receives progress reports from long-running requests
pub trait ProgressContext: Send + Sync {
    fn update_progress(&self, offset: u64, total: u64);
}

/// A [`ProgressContext`] that discards all reports
#[derive(Debug, Default)]
pub struct NoOpProgress;

impl ProgressContext for NoOpProgress {
    fn update_progress(&self, _offset: u64, _total: u64) {}
}

/// Arguments to the create sub-saga
pub struct CreateArgs {
    pub name: String,
    pub id: ImageId,
    pub size: u64,
    /// Options after defaulting and validation, never the caller's raw
    /// options
    pub options: ResolvedOptions,
    /// Parent link to materialize directly in the new header, if any
    pub parent: Option<ParentLink>,
    pub mirror: MirrorProvenance,
    pub progress: Arc<dyn ProgressContext>,
}

/// Arguments to the remove sub-saga
pub struct RemoveArgs {
    pub name: String,
    /// Known id of the image; looked up by name if `None`
    pub id: Option<ImageId>,
    /// Remove even if other clients are watching the image
    pub force: bool,
    pub progress: Arc<dyn ProgressContext>,
}

/// Builds image handles and the sub-requests the clone saga composes
pub trait ImageFactory: Send + Sync + 'static {
    type Image: ImageCtx;

    /// A closed handle on the image `name` (at the head)
    fn image(
        &self,
        io_ctx: &IoCtx,
        name: &str,
        id: Option<ImageId>,
    ) -> Self::Image;

    fn create_request(
        &self,
        io_ctx: &IoCtx,
        args: CreateArgs,
    ) -> Box<dyn Request>;

    fn remove_request(
        &self,
        io_ctx: &IoCtx,
        args: RemoveArgs,
    ) -> Box<dyn Request>;
}

/// The [`ImageFactory`] for images that live in an
/// [`crate::store::ObjectStore`]
pub struct StoreImageFactory {
    log: Logger,
}

impl StoreImageFactory {
    pub fn new(log: &Logger) -> StoreImageFactory {
        StoreImageFactory { log: log.clone() }
    }

    /// A closed handle on the image `name`, at snapshot `snap_id` if given
    pub fn image_at(
        &self,
        io_ctx: &IoCtx,
        name: &str,
        snap_id: Option<SnapId>,
    ) -> StoreImageCtx {
        StoreImageCtx::new(&self.log, io_ctx.clone(), name, None, snap_id)
    }
}

impl ImageFactory for StoreImageFactory {
    type Image = StoreImageCtx;

    fn image(
        &self,
        io_ctx: &IoCtx,
        name: &str,
        id: Option<ImageId>,
    ) -> StoreImageCtx {
        StoreImageCtx::new(&self.log, io_ctx.clone(), name, id, None)
    }

    fn create_request(
        &self,
        io_ctx: &IoCtx,
        args: CreateArgs,
    ) -> Box<dyn Request> {
        Box::new(crate::create::CreateRequest::new(
            &self.log,
            io_ctx.clone(),
            args,
        ))
    }

    fn remove_request(
        &self,
        io_ctx: &IoCtx,
        args: RemoveArgs,
    ) -> Box<dyn Request> {
        Box::new(crate::remove::RemoveRequest::new(
            &self.log,
            io_ctx.clone(),
            args,
        ))
    }
}
