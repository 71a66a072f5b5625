// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cloning an image from a protected snapshot of a parent image
//!
//! A clone touches several independent objects in the store: the child's id
//! and directory entry, its header (with the parent link), the parent's
//! children registration, and the child's metadata.  None of these updates
//! are atomic with respect to each other, so [`CloneSaga`] runs them as a
//! saga: the steps chosen by [`fsm::transition`] run one at a time, and a
//! failure unwinds what was already done so that the clone either fully
//! exists or doesn't exist at all.

pub mod fsm;

use crate::config::CloneConfig;
use crate::error::{Error, ResourceType};
use crate::features::Features;
use crate::image::ImageCtx;
use crate::options::{resolve_clone_options, ImageOptions, ResolvedOptions};
use crate::request::{
    run_subrequest, send_request, Completion, CreateArgs, ImageFactory,
    NoOpProgress, RemoveArgs, Request,
};
use crate::store::{IoCtx, Metadata};
use crate::types::{
    ImageId, MirrorProvenance, ParentLink, ParentSpec, ProtectionStatus,
};
use crate::work_queue::OpWorkQueue;
use async_trait::async_trait;
use fsm::{transition, CloneStep, NextAction, SagaState, StepOutcome};
use serde::Serialize;
use slog::{debug, info, o, warn, Logger};
use slog_error_chain::InlineErrorChain;
use std::sync::{Arc, Mutex};

/// One executed step and what came of it
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StepRecord {
    pub step: CloneStep,
    pub outcome: RecordedOutcome,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordedOutcome {
    Done,
    MetadataPage { fetched: usize, more: bool },
    Failed { errno: i32, message: String },
}

impl From<&StepOutcome> for RecordedOutcome {
    fn from(outcome: &StepOutcome) -> Self {
        match outcome {
            StepOutcome::Done => RecordedOutcome::Done,
            StepOutcome::MetadataPage { fetched, more } => {
                RecordedOutcome::MetadataPage { fetched: *fetched, more: *more }
            }
            StepOutcome::Failed(error) => RecordedOutcome::Failed {
                errno: error.errno(),
                message: error.to_string(),
            },
        }
    }
}

/// Shared, append-only log of the steps a saga has run
#[derive(Clone, Debug, Default)]
pub struct StepHistory(Arc<Mutex<Vec<StepRecord>>>);

impl StepHistory {
    pub fn new() -> StepHistory {
        StepHistory::default()
    }

    fn push(&self, record: StepRecord) {
        self.0.lock().unwrap().push(record);
    }

    pub fn records(&self) -> Vec<StepRecord> {
        self.0.lock().unwrap().clone()
    }

    /// Just the steps, in the order they ran
    pub fn steps(&self) -> Vec<CloneStep> {
        self.0.lock().unwrap().iter().map(|r| r.step).collect()
    }
}

/// The clone saga and everything it has learned so far
pub struct CloneSaga<P: ImageCtx, F: ImageFactory> {
    log: Logger,
    factory: Arc<F>,
    parent: Arc<P>,
    io_ctx: IoCtx,
    name: String,
    opts: ImageOptions,
    mirror: MirrorProvenance,
    config: CloneConfig,
    work_queue: OpWorkQueue,
    history: Option<StepHistory>,

    // Filled in as the saga progresses.
    parent_spec: Option<ParentSpec>,
    size: u64,
    resolved: Option<ResolvedOptions>,
    id: Option<ImageId>,
    image: Option<F::Image>,
    metadata: Metadata,
    last_key: String,
}

impl<P: ImageCtx, F: ImageFactory> CloneSaga<P, F> {
    async fn run_step(&mut self, step: CloneStep) -> StepOutcome {
        let result = match step {
            CloneStep::ValidateParent => self.validate_parent().await,
            CloneStep::ValidateChild => self.validate_child().await,
            CloneStep::CreateImage => self.create_image().await,
            CloneStep::OpenImage => self.open_image().await,
            CloneStep::SetParentInHeader => self.set_parent().await,
            CloneStep::UpdateDirChildren => self.add_child().await,
            CloneStep::Refresh => self.refresh().await,
            CloneStep::GetMetasInParent => return self.get_metadata().await,
            CloneStep::SetMetasInChild => self.set_metadata().await,
            CloneStep::CloseImage => self.close_image().await,
            CloneStep::CleanDirChildren => self.remove_child().await,
            CloneStep::SwitchThreadContext => {
                self.work_queue.switch_context().await;
                Ok(())
            }
            CloneStep::RemoveImage => self.remove_image().await,
        };
        match result {
            Ok(()) => StepOutcome::Done,
            Err(error) => StepOutcome::Failed(error),
        }
    }

    fn parent_spec(&self) -> Result<&ParentSpec, Error> {
        self.parent_spec
            .as_ref()
            .ok_or_else(|| Error::internal_error("parent was not validated"))
    }

    fn child_id(&self) -> Result<&ImageId, Error> {
        self.id
            .as_ref()
            .ok_or_else(|| Error::internal_error("child image was not created"))
    }

    fn image_mut(&mut self) -> Result<&mut F::Image, Error> {
        self.image
            .as_mut()
            .ok_or_else(|| Error::internal_error("child image is not open"))
    }

    async fn validate_parent(&mut self) -> Result<(), Error> {
        let opts = self.opts.or_defaults(&self.config.default_options);
        opts.preflight()?;
        self.opts = opts;

        let parent = &self.parent;
        let header = parent.header().ok_or_else(|| {
            Error::invalid_request(&format!(
                "parent image {} is not open",
                parent.name()
            ))
        })?;
        let Some(snap_id) = parent.snap_id() else {
            return Err(Error::invalid_request(
                "parent image must be opened at a snapshot",
            ));
        };
        if parent.old_format() {
            return Err(Error::invalid_request(
                "parent image must be in the new format",
            ));
        }
        if !header.features.contains(Features::LAYERING) {
            return Err(Error::unsupported("parent image must support layering"));
        }
        let snap = header.snapshots.get(&snap_id).ok_or_else(|| {
            Error::not_found(
                ResourceType::Snapshot,
                format!("{}@{}", parent.name(), snap_id),
            )
        })?;
        if snap.protection != ProtectionStatus::Protected {
            return Err(Error::invalid_request(
                "parent snapshot must be protected",
            ));
        }

        let parent_spec = ParentSpec {
            pool_id: parent.pool(),
            image_id: header.id.clone(),
            snap_id,
        };
        let size = snap.size;

        debug!(self.log, "validated parent"; "parent" => %parent_spec,
            "size" => size);
        self.parent_spec = Some(parent_spec);
        self.size = size;
        Ok(())
    }

    async fn validate_child(&mut self) -> Result<(), Error> {
        let header = self.parent.header().ok_or_else(|| {
            Error::invalid_request("parent image was closed during clone")
        })?;
        let resolved =
            resolve_clone_options(&self.opts, header, self.io_ctx.pool())?;

        // Asking the store about mirroring is the first remote call, so it
        // comes after the options have been checked.
        let journaling = header.features.contains(Features::JOURNALING);
        if journaling
            && !self.mirror.is_non_primary()
            && !self.parent.is_primary().await?
        {
            return Err(Error::invalid_request(
                "parent is non-primary mirrored image",
            ));
        }

        match self.io_ctx.store().get_id(self.io_ctx.pool(), &self.name).await {
            Ok(_) => {
                return Err(Error::already_exists(
                    ResourceType::Image,
                    &self.name,
                ));
            }
            Err(error) if error.is_not_found() => {}
            Err(error) => return Err(error),
        }

        debug!(self.log, "validated child"; "options" => ?resolved);
        self.resolved = Some(resolved);
        Ok(())
    }

    async fn create_image(&mut self) -> Result<(), Error> {
        let options = self.resolved.clone().ok_or_else(|| {
            Error::internal_error("child options were not resolved")
        })?;
        let id = ImageId::generate();
        self.id = Some(id.clone());
        let request = self.factory.create_request(
            &self.io_ctx,
            CreateArgs {
                name: self.name.clone(),
                id,
                size: self.size,
                options,
                // The link is written by set-parent, after the child is open.
                parent: None,
                mirror: self.mirror.clone(),
                progress: Arc::new(NoOpProgress),
            },
        );
        run_subrequest(request).await
    }

    async fn open_image(&mut self) -> Result<(), Error> {
        let id = self.child_id()?.clone();
        let mut image = self.factory.image(&self.io_ctx, &self.name, Some(id));
        image.open().await?;
        self.image = Some(image);
        Ok(())
    }

    async fn set_parent(&mut self) -> Result<(), Error> {
        let store = self.io_ctx.store();
        store
            .set_parent(
                self.io_ctx.pool(),
                self.child_id()?,
                self.parent_spec()?,
                self.size,
            )
            .await
    }

    async fn add_child(&mut self) -> Result<(), Error> {
        let store = self.io_ctx.store();
        store
            .add_child(self.io_ctx.pool(), self.parent_spec()?, self.child_id()?)
            .await
    }

    async fn refresh(&mut self) -> Result<(), Error> {
        let expected = ParentLink {
            spec: self.parent_spec()?.clone(),
            overlap: self.size,
        };
        let image = self.image_mut()?;
        image.refresh().await?;
        let linked = image
            .header()
            .and_then(|header| header.parent.as_ref())
            .is_some_and(|link| *link == expected);
        if !linked {
            return Err(Error::internal_error(
                "child header does not link to the parent snapshot",
            ));
        }

        // Someone may have unprotected the snapshot while we were working;
        // the cached parent header would not show it.
        let status =
            self.parent.snap_protection_status(expected.spec.snap_id).await?;
        if status != ProtectionStatus::Protected {
            warn!(self.log, "parent snapshot is no longer protected";
                "status" => %status);
            return Err(Error::invalid_request(
                "parent snapshot was unprotected during clone",
            ));
        }
        Ok(())
    }

    async fn get_metadata(&mut self) -> StepOutcome {
        let page_size = self.config.metadata_page_size.max(1);
        match self.parent.metadata_list(&self.last_key, page_size).await {
            Ok(pairs) => {
                let fetched = pairs.len();
                if let Some((key, _)) = pairs.last_key_value() {
                    self.last_key = key.clone();
                }
                self.metadata.extend(pairs);
                StepOutcome::MetadataPage { fetched, more: fetched == page_size }
            }
            Err(Error::NotSupported { message }) => {
                info!(self.log, "parent does not support metadata; not copying";
                    "message" => message);
                StepOutcome::MetadataPage { fetched: 0, more: false }
            }
            Err(error) => StepOutcome::Failed(error),
        }
    }

    async fn set_metadata(&mut self) -> Result<(), Error> {
        let metadata = std::mem::take(&mut self.metadata);
        debug!(self.log, "copying metadata"; "count" => metadata.len());
        self.image_mut()?.metadata_set(&metadata).await
    }

    async fn close_image(&mut self) -> Result<(), Error> {
        match self.image.take() {
            Some(mut image) => image.close().await,
            None => Ok(()),
        }
    }

    async fn remove_child(&mut self) -> Result<(), Error> {
        let store = self.io_ctx.store();
        store
            .remove_child(
                self.io_ctx.pool(),
                self.parent_spec()?,
                self.child_id()?,
            )
            .await
    }

    async fn remove_image(&mut self) -> Result<(), Error> {
        let request = self.factory.remove_request(
            &self.io_ctx,
            RemoveArgs {
                name: self.name.clone(),
                id: self.id.clone(),
                force: false,
                progress: Arc::new(NoOpProgress),
            },
        );
        run_subrequest(request).await
    }
}

#[async_trait]
impl<P: ImageCtx, F: ImageFactory> Request for CloneSaga<P, F> {
    async fn execute(mut self: Box<Self>) -> Result<(), Error> {
        let mut state = SagaState::new();
        loop {
            let step = state.step;
            debug!(self.log, "running step"; "step" => %step);
            let outcome = self.run_step(step).await;
            if let Some(history) = &self.history {
                history.push(StepRecord {
                    step,
                    outcome: RecordedOutcome::from(&outcome),
                });
            }
            if let StepOutcome::Failed(error) = &outcome {
                if !state.is_unwinding() {
                    warn!(self.log, "step failed; unwinding";
                        "step" => %step,
                        "error" => %InlineErrorChain::new(error));
                }
            }

            let t = transition(&state, outcome);
            if let Some(error) = &t.discarded {
                warn!(self.log, "failure during unwind";
                    "step" => %step,
                    "error" => %InlineErrorChain::new(error));
            }
            state = t.state;
            match t.next {
                NextAction::Run(_) => {}
                NextAction::Finish(result) => {
                    match &result {
                        Ok(()) => info!(self.log, "clone complete";
                            "id" => ?self.id),
                        Err(error) => warn!(self.log, "clone failed";
                            "error" => %InlineErrorChain::new(error)),
                    }
                    return result;
                }
            }
        }
    }
}

/// The caller-facing clone operation
///
/// Build with [`CloneRequest::new`] and start with [`CloneRequest::send`].
/// The completion is invoked exactly once, on the work queue, with the
/// saga's result.
pub struct CloneRequest<P: ImageCtx, F: ImageFactory> {
    saga: CloneSaga<P, F>,
    on_finish: Completion,
}

impl<P: ImageCtx, F: ImageFactory> CloneRequest<P, F> {
    /// `parent` must be open at the snapshot to clone from.  The child is
    /// created as `name` in `io_ctx`'s pool.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log: &Logger,
        factory: Arc<F>,
        parent: Arc<P>,
        io_ctx: &IoCtx,
        name: &str,
        opts: ImageOptions,
        mirror: MirrorProvenance,
        work_queue: &OpWorkQueue,
        config: &CloneConfig,
        on_finish: Completion,
    ) -> CloneRequest<P, F> {
        let log = log.new(o!(
            "saga" => "clone",
            "child" => name.to_string(),
            "pool" => io_ctx.pool().to_string(),
        ));
        CloneRequest {
            saga: CloneSaga {
                log,
                factory,
                parent,
                io_ctx: io_ctx.clone(),
                name: name.to_string(),
                opts,
                mirror,
                config: config.clone(),
                work_queue: work_queue.clone(),
                history: None,
                parent_spec: None,
                size: 0,
                resolved: None,
                id: None,
                image: None,
                metadata: Metadata::new(),
                last_key: String::new(),
            },
            on_finish,
        }
    }

    /// Record every step the saga runs into `history`
    pub fn with_history(mut self, history: StepHistory) -> Self {
        self.saga.history = Some(history);
        self
    }

    /// Start the saga.  Must be called from within a tokio runtime.
    pub fn send(self) {
        let work_queue = self.saga.work_queue.clone();
        send_request(Box::new(self.saga), &work_queue, self.on_finish);
    }
}
