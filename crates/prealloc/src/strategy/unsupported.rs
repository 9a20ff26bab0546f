//! The fallback implementation.
//! No native entry points are probed, so every chain ends up unavailable.

use super::{Extent, RawFd, StrategyKind};
use crate::{chain::ProbeError, errors::AllocationError};

/// Never constructed.
#[derive(Debug)]
pub(super) enum Native {}

impl Native {
    pub(super) fn bind(_kind: StrategyKind, _library: Option<&str>) -> Result<Self, ProbeError> {
        Err(ProbeError::Unsupported)
    }

    pub(super) fn limit(&self) -> i64 {
        match *self {}
    }

    pub(super) fn is_posix(&self) -> bool {
        match *self {}
    }

    pub(super) fn call(&self, _fd: RawFd, _extent: Extent) -> Result<(), AllocationError> {
        match *self {}
    }
}
