//! The disk space pre-allocation facilities.
//!
//! The native allocation entry points are not linked statically. Instead,
//! every operation family (`fallocate`, `posix_fallocate` and their
//! descriptor-taking counterparts) is resolved once, at first use, by probing
//! an ordered [`chain`] of candidates and binding to the first one the host
//! actually provides.
//!
//! The calls themselves are blocking. The [`sync`] module runs them on the
//! calling thread, while the [`delegation`] module ships them to a long-lived
//! worker process (see the [`worker`] loop) and completes the caller
//! asynchronously.
//!
//! Every failure, whatever strategy produced it, is reported as an
//! [`AllocationError`] with a symbolic code resolved by the [`errors`]
//! module.

use std::path::PathBuf;

pub mod chain;
pub mod delegation;
pub mod errors;
mod scalar;
pub mod strategy;
pub mod sync;
pub mod wire;
pub mod worker;

pub use errors::AllocationError;
pub use scalar::Scalar;
pub use sync::Method;

/// Allocate the disk space for the file at `path` via the process-wide
/// worker, using the `fallocate` family.
///
/// Resolves with the `path` once the worker reports success.
/// The `mode` defaults to zero when `None`.
pub async fn fallocate(
    path: impl Into<PathBuf>,
    offset: impl Into<Scalar>,
    length: impl Into<Scalar>,
    mode: Option<Scalar>,
) -> Result<PathBuf, AllocationError> {
    delegation::global()
        .schedule(Method::Fallocate, path, offset, length, mode)
        .await
}

/// Allocate the disk space for the file at `path` via the process-wide
/// worker, using the `posix_fallocate` family.
///
/// The `mode`, if supplied, must be zero.
pub async fn posix_fallocate(
    path: impl Into<PathBuf>,
    offset: impl Into<Scalar>,
    length: impl Into<Scalar>,
    mode: Option<Scalar>,
) -> Result<PathBuf, AllocationError> {
    delegation::global()
        .schedule(Method::PosixFallocate, path, offset, length, mode)
        .await
}
