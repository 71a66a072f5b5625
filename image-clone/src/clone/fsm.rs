// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The clone saga as an explicit state machine
//!
//! [`transition`] is a pure function from the current [`SagaState`] and the
//! outcome of the step that just ran to the next action and state.  It does
//! no I/O; the async driver in the parent module runs the steps it asks for.
//!
//! Forward path:
//!
//! ```text
//! ValidateParent -> ValidateChild -> CreateImage -> OpenImage
//!   -> SetParentInHeader -> UpdateDirChildren -> Refresh
//!   -> GetMetasInParent (repeated per page) [-> SetMetasInChild]
//!   -> CloseImage -> finish
//! ```
//!
//! Unwind path, entered at the point reached:
//!
//! ```text
//! [CleanDirChildren] -> [CloseImage] -> SwitchThreadContext -> RemoveImage
//!   -> finish(first error)
//! ```
//!
//! The first forward failure is saved and is what the caller sees.  Failures
//! while unwinding are handed back as `discarded` for logging, except that a
//! failed remove is surfaced as [`Error::CleanupFailed`]: at that point the
//! child exists without having been fully set up and someone needs to know.

use crate::error::Error;
use serde::{Deserialize, Serialize};

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum CloneStep {
    ValidateParent,
    ValidateChild,
    CreateImage,
    OpenImage,
    SetParentInHeader,
    UpdateDirChildren,
    Refresh,
    GetMetasInParent,
    SetMetasInChild,
    CloseImage,
    CleanDirChildren,
    SwitchThreadContext,
    RemoveImage,
}

impl CloneStep {
    /// Steps that only ever run while unwinding
    pub fn is_unwind_only(self) -> bool {
        matches!(
            self,
            CloneStep::CleanDirChildren
                | CloneStep::SwitchThreadContext
                | CloneStep::RemoveImage
        )
    }
}

/// Everything the saga needs to remember between steps
#[derive(Clone, Debug, PartialEq)]
pub struct SagaState {
    /// The step whose outcome is next fed to [`transition`]
    pub step: CloneStep,
    /// The first forward failure, set at most once
    pub saved: Option<Error>,
    /// Whether the child image handle is open
    pub image_open: bool,
    /// Metadata pairs collected from the parent so far
    pub metadata_pairs: usize,
}

impl SagaState {
    pub fn new() -> SagaState {
        SagaState {
            step: CloneStep::ValidateParent,
            saved: None,
            image_open: false,
            metadata_pairs: 0,
        }
    }

    pub fn is_unwinding(&self) -> bool {
        self.saved.is_some()
    }
}

impl Default for SagaState {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of running one step
#[derive(Clone, Debug, PartialEq)]
pub enum StepOutcome {
    Done,
    /// One page of parent metadata was read
    MetadataPage {
        fetched: usize,
        more: bool,
    },
    Failed(Error),
}

#[derive(Clone, Debug, PartialEq)]
pub enum NextAction {
    Run(CloneStep),
    Finish(Result<(), Error>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub next: NextAction,
    pub state: SagaState,
    /// A failure that did not change the saga's result and should be logged
    pub discarded: Option<Error>,
}

impl Transition {
    fn run(step: CloneStep, mut state: SagaState) -> Transition {
        state.step = step;
        Transition { next: NextAction::Run(step), state, discarded: None }
    }

    fn finish(result: Result<(), Error>, state: SagaState) -> Transition {
        Transition { next: NextAction::Finish(result), state, discarded: None }
    }

    fn discarding(mut self, error: Option<Error>) -> Transition {
        self.discarded = error;
        self
    }
}

/// Compute the next action from the outcome of `state.step`
pub fn transition(state: &SagaState, outcome: StepOutcome) -> Transition {
    let mut next = state.clone();

    // Only metadata listing reports pages.
    let outcome = match outcome {
        StepOutcome::MetadataPage { .. }
            if state.step != CloneStep::GetMetasInParent =>
        {
            StepOutcome::Failed(Error::internal_error(&format!(
                "step {} reported a metadata page",
                state.step
            )))
        }
        outcome => outcome,
    };

    if state.is_unwinding() {
        return unwind(next, outcome);
    }

    let error = match outcome {
        StepOutcome::Done => return forward(next, 0, false),
        StepOutcome::MetadataPage { fetched, more } => {
            return forward(next, fetched, more);
        }
        StepOutcome::Failed(error) => error,
    };

    match state.step {
        // Nothing to undo: validation is read-only and a failed create cleans
        // up after itself.
        CloneStep::ValidateParent
        | CloneStep::ValidateChild
        | CloneStep::CreateImage => Transition::finish(Err(error), next),
        CloneStep::OpenImage => {
            next.saved = Some(error);
            next.image_open = false;
            Transition::run(CloneStep::RemoveImage, next)
        }
        // The child is not yet registered under its parent.
        CloneStep::SetParentInHeader | CloneStep::UpdateDirChildren => {
            next.saved = Some(error);
            Transition::run(CloneStep::CloseImage, next)
        }
        CloneStep::Refresh
        | CloneStep::GetMetasInParent
        | CloneStep::SetMetasInChild => {
            next.saved = Some(error);
            Transition::run(CloneStep::CleanDirChildren, next)
        }
        CloneStep::CloseImage => {
            // Whatever the handle's state, it is not ours to close again.
            next.saved = Some(error);
            next.image_open = false;
            Transition::run(CloneStep::CleanDirChildren, next)
        }
        step @ (CloneStep::CleanDirChildren
        | CloneStep::SwitchThreadContext
        | CloneStep::RemoveImage) => Transition::finish(
            Err(Error::internal_error(&format!(
                "unwind step {step} ran on the forward path"
            ))),
            next,
        ),
    }
}

fn forward(mut next: SagaState, fetched: usize, more: bool) -> Transition {
    let step = match next.step {
        CloneStep::ValidateParent => CloneStep::ValidateChild,
        CloneStep::ValidateChild => CloneStep::CreateImage,
        CloneStep::CreateImage => CloneStep::OpenImage,
        CloneStep::OpenImage => {
            next.image_open = true;
            CloneStep::SetParentInHeader
        }
        CloneStep::SetParentInHeader => CloneStep::UpdateDirChildren,
        CloneStep::UpdateDirChildren => CloneStep::Refresh,
        CloneStep::Refresh => {
            next.metadata_pairs = 0;
            CloneStep::GetMetasInParent
        }
        CloneStep::GetMetasInParent => {
            next.metadata_pairs += fetched;
            if more {
                CloneStep::GetMetasInParent
            } else if next.metadata_pairs == 0 {
                CloneStep::CloseImage
            } else {
                CloneStep::SetMetasInChild
            }
        }
        CloneStep::SetMetasInChild => CloneStep::CloseImage,
        CloneStep::CloseImage => {
            next.image_open = false;
            return Transition::finish(Ok(()), next);
        }
        step @ (CloneStep::CleanDirChildren
        | CloneStep::SwitchThreadContext
        | CloneStep::RemoveImage) => {
            return Transition::finish(
                Err(Error::internal_error(&format!(
                    "unwind step {step} ran on the forward path"
                ))),
                next,
            );
        }
    };
    Transition::run(step, next)
}

fn unwind(mut next: SagaState, outcome: StepOutcome) -> Transition {
    let failure = match outcome {
        StepOutcome::Failed(error) => Some(error),
        StepOutcome::Done | StepOutcome::MetadataPage { .. } => None,
    };

    match next.step {
        CloneStep::CleanDirChildren => {
            // Already unregistered is as good as unregistered.
            let discarded = failure.filter(|error| !error.is_not_found());
            let step = if next.image_open {
                CloneStep::CloseImage
            } else {
                CloneStep::SwitchThreadContext
            };
            Transition::run(step, next).discarding(discarded)
        }
        CloneStep::CloseImage => {
            next.image_open = false;
            Transition::run(CloneStep::SwitchThreadContext, next)
                .discarding(failure)
        }
        CloneStep::SwitchThreadContext => {
            Transition::run(CloneStep::RemoveImage, next).discarding(failure)
        }
        CloneStep::RemoveImage => {
            let saved = next.saved.clone().unwrap_or_else(|| {
                Error::internal_error("unwound without a saved error")
            });
            let result = match failure {
                None => saved,
                Some(error) if error.is_not_found() => saved,
                Some(error) => Error::cleanup_failed(saved, error),
            };
            Transition::finish(Err(result), next)
        }
        // A forward step cannot be running while unwinding.  Don't lose the
        // saved error over it.
        step => {
            let saved = next.saved.clone().unwrap_or_else(|| {
                Error::internal_error("unwound without a saved error")
            });
            Transition::finish(Err(saved), next).discarding(Some(
                Error::internal_error(&format!(
                    "forward step {step} ran while unwinding"
                )),
            ))
        }
    }
}
