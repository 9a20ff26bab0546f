//! Unix-specific implementation.
//! Binds the allocation entry points exported by the C library at runtime.

use std::os::raw::c_int;

use libloading::Library;
use nix::errno::Errno;

use super::{Extent, RawFd, StrategyKind};
use crate::{
    chain::{self, ProbeError},
    errors::AllocationError,
};

/// The `off_t` of the host, guessed from the pointer width.
#[cfg(target_pointer_width = "64")]
type GuessedOff = i64;
/// The `off_t` of the host, guessed from the pointer width.
#[cfg(not(target_pointer_width = "64"))]
type GuessedOff = i32;

type FallocateFn<Off> = unsafe extern "C" fn(c_int, c_int, Off, Off) -> c_int;
type PosixFallocateFn<Off> = unsafe extern "C" fn(c_int, Off, Off) -> c_int;

#[derive(Debug, Clone, Copy)]
enum Entry {
    Fallocate64(FallocateFn<i64>),
    Fallocate(FallocateFn<GuessedOff>),
    PosixFallocate64(PosixFallocateFn<i64>),
    PosixFallocate(PosixFallocateFn<GuessedOff>),
}

/// A native entry point along with the library that exports it.
#[derive(Debug)]
pub(super) struct Native {
    entry: Entry,
    /// Keeps the entry point valid.
    _library: Library,
}

impl Native {
    /// Look up the entry point for the `kind` in the `library`.
    pub(super) fn bind(kind: StrategyKind, library: Option<&str>) -> Result<Self, ProbeError> {
        let library = chain::open_library(library)?;
        // SAFETY: the types match the C library declarations, and the library
        // is stored next to the entry point.
        let entry = unsafe {
            match kind {
                StrategyKind::Fallocate64 => {
                    Entry::Fallocate64(chain::symbol(&library, "fallocate64")?)
                }
                StrategyKind::Fallocate => Entry::Fallocate(chain::symbol(&library, "fallocate")?),
                StrategyKind::PosixFallocate64 => {
                    Entry::PosixFallocate64(chain::symbol(&library, "posix_fallocate64")?)
                }
                StrategyKind::PosixFallocate => {
                    Entry::PosixFallocate(chain::symbol(&library, "posix_fallocate")?)
                }
                StrategyKind::PosixOverFallocate | StrategyKind::Unavailable => {
                    return Err(ProbeError::Unavailable("native entry point"))
                }
            }
        };
        Ok(Self {
            entry,
            _library: library,
        })
    }

    /// The largest offset and length the entry point accepts.
    pub(super) fn limit(&self) -> i64 {
        match self.entry {
            Entry::Fallocate64(_) | Entry::PosixFallocate64(_) => i64::MAX,
            Entry::Fallocate(_) | Entry::PosixFallocate(_) => GuessedOff::MAX.into(),
        }
    }

    /// Whether the entry point follows the `posix_fallocate` conventions.
    pub(super) fn is_posix(&self) -> bool {
        matches!(
            self.entry,
            Entry::PosixFallocate64(_) | Entry::PosixFallocate(_)
        )
    }

    /// Call the entry point.
    pub(super) fn call(&self, fd: RawFd, extent: Extent) -> Result<(), AllocationError> {
        let Extent {
            offset,
            length,
            mode,
        } = extent;
        // SAFETY: the entry points were resolved with these exact signatures
        // and take no pointers.
        match self.entry {
            Entry::Fallocate64(fallocate64) => {
                check_errno(|| unsafe { fallocate64(fd, mode, offset, length) })
            }
            Entry::Fallocate(fallocate) => {
                let (offset, length) = narrow(offset, length)?;
                check_errno(|| unsafe { fallocate(fd, mode, offset, length) })
            }
            Entry::PosixFallocate64(posix_fallocate64) => {
                check_return(unsafe { posix_fallocate64(fd, offset, length) })
            }
            Entry::PosixFallocate(posix_fallocate) => {
                let (offset, length) = narrow(offset, length)?;
                check_return(unsafe { posix_fallocate(fd, offset, length) })
            }
        }
    }
}

/// Convert the validated values to the native offset type.
fn narrow(offset: i64, length: i64) -> Result<(GuessedOff, GuessedOff), AllocationError> {
    let offset =
        GuessedOff::try_from(offset).map_err(|_| AllocationError::local("Invalid offset"))?;
    let length =
        GuessedOff::try_from(length).map_err(|_| AllocationError::local("Invalid length"))?;
    Ok((offset, length))
}

/// Interpret the result of the entry points that report the failure
/// via `errno`.
fn check_errno(call: impl FnOnce() -> c_int) -> Result<(), AllocationError> {
    Errno::clear();
    let rv = call();
    if rv == 0 {
        return Ok(());
    }
    let errno = match Errno::last() as i32 {
        0 => rv,
        errno => errno,
    };
    Err(AllocationError::new(errno, "Allocation failed"))
}

/// Interpret the result of the entry points that return the error number.
fn check_return(rv: c_int) -> Result<(), AllocationError> {
    if rv == 0 {
        return Ok(());
    }
    Err(AllocationError::new(rv, "Allocation failed"))
}
