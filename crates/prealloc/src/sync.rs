//! The synchronous façade.
//!
//! These calls block the calling thread for as long as the native allocation
//! takes. Use the [`crate::delegation`] facilities to get them off the
//! calling thread.

use std::{fs::OpenOptions, path::Path};

use crate::{
    errors::AllocationError,
    strategy::{Family, RawFd, StrategyKind},
    Scalar,
};

/// The allocation method, as requested from the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Use the `fallocate` family.
    Fallocate,
    /// Use the `posix_fallocate` family.
    PosixFallocate,
}

impl Method {
    /// The family this method resolves against.
    pub fn family(self) -> Family {
        match self {
            Method::Fallocate => Family::Fallocate,
            Method::PosixFallocate => Family::PosixFallocate,
        }
    }

    /// Allocate the disk space for the file at `path` with this method.
    pub fn invoke(
        self,
        path: &Path,
        offset: Scalar,
        length: Scalar,
        mode: Option<Scalar>,
    ) -> Result<(), AllocationError> {
        with_fd(path, |fd| self.family().invoke(fd, offset, length, mode))
    }
}

/// Allocate the disk space for the file at `path` via `fallocate`.
///
/// The file is created if it does not exist.
pub fn fallocate(
    path: impl AsRef<Path>,
    offset: impl Into<Scalar>,
    length: impl Into<Scalar>,
    mode: Option<Scalar>,
) -> Result<(), AllocationError> {
    Method::Fallocate.invoke(
        path.as_ref(),
        offset.into(),
        length.into(),
        mode,
    )
}

/// Allocate the disk space for the file at `path` via `posix_fallocate`.
///
/// The file is created if it does not exist. The `mode`, if supplied, must
/// be zero.
pub fn posix_fallocate(
    path: impl AsRef<Path>,
    offset: impl Into<Scalar>,
    length: impl Into<Scalar>,
    mode: Option<Scalar>,
) -> Result<(), AllocationError> {
    Method::PosixFallocate.invoke(
        path.as_ref(),
        offset.into(),
        length.into(),
        mode,
    )
}

/// Allocate the disk space for an open file via `fallocate`.
#[cfg(unix)]
pub fn ffallocate(
    fd: impl std::os::fd::AsFd,
    offset: impl Into<Scalar>,
    length: impl Into<Scalar>,
    mode: Option<Scalar>,
) -> Result<(), AllocationError> {
    use std::os::fd::AsRawFd;

    Family::FFallocate.invoke(
        fd.as_fd().as_raw_fd(),
        offset.into(),
        length.into(),
        mode,
    )
}

/// Allocate the disk space for an open file via `posix_fallocate`.
///
/// The `mode`, if supplied, must be zero.
#[cfg(unix)]
pub fn fposix_fallocate(
    fd: impl std::os::fd::AsFd,
    offset: impl Into<Scalar>,
    length: impl Into<Scalar>,
    mode: Option<Scalar>,
) -> Result<(), AllocationError> {
    use std::os::fd::AsRawFd;

    Family::FPosixFallocate.invoke(
        fd.as_fd().as_raw_fd(),
        offset.into(),
        length.into(),
        mode,
    )
}

/// The strategy kinds every family has been resolved to.
pub fn strategies() -> impl Iterator<Item = (&'static str, Option<StrategyKind>)> {
    Family::ALL.into_iter().map(|family| {
        let kind = family.strategy().map(|resolved| resolved.value.kind());
        (family.name(), kind)
    })
}

/// Open the file at `path` for appending, creating it if necessary, and hand
/// its descriptor to `f`.
///
/// The file is closed when this returns, whatever the outcome.
fn with_fd<T>(
    path: &Path,
    f: impl FnOnce(RawFd) -> Result<T, AllocationError>,
) -> Result<T, AllocationError> {
    let file = OpenOptions::new().append(true).create(true).open(path)?;

    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            use std::os::fd::AsRawFd;
            f(file.as_raw_fd())
        } else {
            let _ = (file, f);
            Err(AllocationError::not_implemented())
        }
    }
}
