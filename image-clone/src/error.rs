// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling facilities for image sagas
//!
//! Every step of every saga reports failure with an [`Error`].  Callers that
//! speak in integer result codes (0 for success, a negated errno otherwise)
//! can convert with [`Error::errno`] or [`result_code`].

use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;

/// The kind of object an error refers to
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, strum::Display,
)]
#[strum(serialize_all = "kebab-case")]
pub enum ResourceType {
    Image,
    ImageId,
    ImageHeader,
    DirectoryEntry,
    ChildRegistration,
    MirrorImage,
    Snapshot,
    DataObject,
}

/// An error that can be generated by an image saga or one of the remote
/// operations it issues
///
/// Where possible, reuse existing variants rather than inventing new ones to
/// distinguish cases that no programmatic consumer needs to distinguish.
#[derive(Clone, Debug, Deserialize, thiserror::Error, PartialEq, Serialize)]
pub enum Error {
    /// An object needed as part of this operation was not found.
    #[error("{type_name} not found: {name}")]
    NotFound { type_name: ResourceType, name: String },

    /// An object already exists with the specified name or identifier.
    #[error("{type_name} already exists: {object_name}")]
    ObjectAlreadyExists { type_name: ResourceType, object_name: String },

    /// The request was well-formed, but the operation cannot be completed
    /// given the current state of the system.
    #[error("Invalid Request: {message}")]
    InvalidRequest { message: String },

    /// The specified option is not valid.
    #[error("Invalid Value: {label}, {message}")]
    InvalidValue { label: String, message: String },

    /// The request asked for something this implementation does not support
    /// at all (e.g., unknown feature bits).
    #[error("Unsupported: {message}")]
    Unsupported { message: String },

    /// The remote service does not implement the requested method.
    #[error("Operation not supported by remote service: {message}")]
    NotSupported { message: String },

    #[error("Permission denied: {message}")]
    PermissionDenied { message: String },

    /// The object is in use by someone else.
    #[error("Busy: {message}")]
    Busy { message: String },

    /// The object still has dependents (e.g., snapshots) and cannot be
    /// removed.
    #[error("Not empty: {message}")]
    NotEmpty { message: String },

    /// A generic I/O failure talking to the remote service.
    #[error("I/O error: {message}")]
    Io { message: String },

    /// The system encountered an unhandled operational error.
    #[error("Internal Error: {internal_message}")]
    InternalError { internal_message: String },

    /// A saga failed and its rollback could not complete.  Remote state may
    /// be inconsistent and requires manual intervention.
    #[error(
        "cleanup after failure did not complete ({cleanup}); \
         original failure: {original}"
    )]
    CleanupFailed { original: Box<Error>, cleanup: Box<Error> },
}

impl Error {
    /// Returns the negated errno corresponding to this error
    pub fn errno(&self) -> i32 {
        -match self {
            Error::NotFound { .. } => libc::ENOENT,
            Error::ObjectAlreadyExists { .. } => libc::EEXIST,
            Error::InvalidRequest { .. } | Error::InvalidValue { .. } => {
                libc::EINVAL
            }
            Error::Unsupported { .. } => libc::ENOSYS,
            Error::NotSupported { .. } => libc::EOPNOTSUPP,
            Error::PermissionDenied { .. } => libc::EACCES,
            Error::Busy { .. } => libc::EBUSY,
            Error::NotEmpty { .. } => libc::ENOTEMPTY,
            Error::Io { .. } | Error::InternalError { .. } => libc::EIO,
            Error::CleanupFailed { .. } => libc::ENOTRECOVERABLE,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn not_found(type_name: ResourceType, name: impl Display) -> Error {
        Error::NotFound { type_name, name: name.to_string() }
    }

    pub fn already_exists(
        type_name: ResourceType,
        object_name: impl Display,
    ) -> Error {
        Error::ObjectAlreadyExists {
            type_name,
            object_name: object_name.to_string(),
        }
    }

    /// Generates an [`Error::InvalidRequest`] error with the specific message
    ///
    /// This should be used for failures due possibly to invalid client input
    /// or a precondition on remote state that does not hold.
    pub fn invalid_request(message: &str) -> Error {
        Error::InvalidRequest { message: message.to_owned() }
    }

    pub fn invalid_value(label: &str, message: impl Display) -> Error {
        Error::InvalidValue {
            label: label.to_owned(),
            message: message.to_string(),
        }
    }

    pub fn unsupported(message: &str) -> Error {
        Error::Unsupported { message: message.to_owned() }
    }

    /// Generates an [`Error::InternalError`] error with the specific message
    ///
    /// InternalError should be used for operational conditions that should
    /// not happen but that we cannot reasonably handle at runtime.
    pub fn internal_error(internal_message: &str) -> Error {
        Error::InternalError { internal_message: internal_message.to_owned() }
    }

    /// Wrap a failed rollback around the failure that triggered it
    pub fn cleanup_failed(original: Error, cleanup: Error) -> Error {
        Error::CleanupFailed {
            original: Box::new(original),
            cleanup: Box::new(cleanup),
        }
    }
}

/// Converts a saga result into the integer result code delivered to callers
/// that expect one: 0 on success, a negated errno on failure.
pub fn result_code(result: &Result<(), Error>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(error) => error.errno(),
    }
}
