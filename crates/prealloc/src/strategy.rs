//! The allocation strategies and the validation contract they share.

use std::os::raw::c_int;

use once_cell::sync::Lazy;

use crate::{
    chain::{self, Candidate, Probe, ProbeError, Resolved},
    errors::AllocationError,
    Scalar,
};

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod native;
        use self::native as implementation;
    } else {
        mod unsupported;
        use self::unsupported as implementation;
    }
}

/// The raw file descriptor, as passed to the native entry points.
pub type RawFd = c_int;

/// The libraries to look the native entry points up in, in the order of
/// preference.
const LIBRARIES: [Option<&str>; 3] = [None, Some("libc.so.6"), Some("c")];

/// The strategy variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// `fallocate64`, 64-bit offsets.
    Fallocate64,
    /// `fallocate`, native `off_t` offsets.
    Fallocate,
    /// `posix_fallocate64`, 64-bit offsets.
    PosixFallocate64,
    /// `posix_fallocate`, native `off_t` offsets.
    PosixFallocate,
    /// `posix_fallocate` semantics on top of the resolved `ffallocate`.
    PosixOverFallocate,
    /// Nothing is bound, every call fails.
    Unavailable,
}

/// A bound allocation strategy.
#[derive(Debug)]
pub struct Strategy {
    kind: StrategyKind,
    binding: Binding,
}

#[derive(Debug)]
enum Binding {
    Native(implementation::Native),
    PosixOverFallocate,
    Unavailable,
}

impl Probe for Strategy {
    type Kind = StrategyKind;

    fn probe(kind: Self::Kind, library: Option<&str>) -> Result<Self, ProbeError> {
        let binding = match kind {
            StrategyKind::PosixOverFallocate => {
                let has_native_fallocate = Family::FFallocate
                    .strategy()
                    .map_or(false, |resolved| resolved.value.is_native());
                if !has_native_fallocate {
                    return Err(ProbeError::Unavailable("fallocate"));
                }
                Binding::PosixOverFallocate
            }
            StrategyKind::Unavailable => Binding::Unavailable,
            native => Binding::Native(implementation::Native::bind(native, library)?),
        };
        Ok(Self { kind, binding })
    }
}

impl Strategy {
    /// The variant of this strategy.
    pub fn kind(&self) -> StrategyKind {
        self.kind
    }

    /// Whether a native entry point is bound.
    pub fn is_native(&self) -> bool {
        matches!(self.binding, Binding::Native(_))
    }

    /// Validate the arguments and invoke the bound entry point on the `fd`.
    pub fn call(
        &self,
        fd: RawFd,
        offset: Scalar,
        length: Scalar,
        mode: Option<Scalar>,
    ) -> Result<(), AllocationError> {
        let limit = match &self.binding {
            Binding::Native(native) => native.limit(),
            Binding::PosixOverFallocate => i64::MAX,
            Binding::Unavailable => return Err(AllocationError::not_implemented()),
        };
        let extent = Extent::validate(offset, length, mode, limit)?;

        match &self.binding {
            Binding::Native(native) => {
                if native.is_posix() {
                    reject_posix_mode(extent.mode)?;
                }
                native.call(fd, extent)
            }
            Binding::PosixOverFallocate => {
                reject_posix_mode(extent.mode)?;
                Family::FFallocate.invoke(fd, extent.offset.into(), extent.length.into(), None)
            }
            Binding::Unavailable => Err(AllocationError::not_implemented()),
        }
    }
}

/// Invoke the `resolved` strategy, failing when there is none.
pub fn invoke(
    resolved: Option<&Resolved<Strategy>>,
    fd: RawFd,
    offset: Scalar,
    length: Scalar,
    mode: Option<Scalar>,
) -> Result<(), AllocationError> {
    let Some(resolved) = resolved else {
        return Err(AllocationError::not_implemented());
    };
    resolved.value.call(fd, offset, length, mode)
}

fn reject_posix_mode(mode: c_int) -> Result<(), AllocationError> {
    if mode != 0 {
        return Err(AllocationError::local(
            "Invalid mode supplied for posix_fallocate",
        ));
    }
    Ok(())
}

/// The validated arguments of an allocation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// The offset to allocate at, non-negative.
    pub offset: i64,
    /// The amount of bytes to allocate, positive.
    pub length: i64,
    /// The mode flags, zero unless supplied.
    pub mode: c_int,
}

impl Extent {
    /// Validate the raw arguments.
    ///
    /// The `offset` and the `length` must be exact integers not exceeding
    /// the `limit` of the native offset type, the `length` must be positive.
    /// The `mode`, if supplied, must be an exact integer that fits a C `int`.
    pub fn validate(
        offset: Scalar,
        length: Scalar,
        mode: Option<Scalar>,
        limit: i64,
    ) -> Result<Self, AllocationError> {
        let offset = offset
            .as_exact_integer()
            .filter(|offset| (0..=limit).contains(offset))
            .ok_or_else(|| AllocationError::local("Invalid offset"))?;
        let length = length
            .as_exact_integer()
            .filter(|length| (1..=limit).contains(length))
            .ok_or_else(|| AllocationError::local("Invalid length"))?;
        let mode = match mode {
            None => 0,
            Some(mode) => mode
                .as_exact_integer()
                .and_then(|mode| c_int::try_from(mode).ok())
                .ok_or_else(|| AllocationError::local("Invalid mode"))?,
        };
        Ok(Self {
            offset,
            length,
            mode,
        })
    }
}

/// The operation families, each resolved to its own strategy once per
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// `fallocate` on a path.
    Fallocate,
    /// `posix_fallocate` on a path.
    PosixFallocate,
    /// `fallocate` on a file descriptor.
    FFallocate,
    /// `posix_fallocate` on a file descriptor.
    FPosixFallocate,
}

static FALLOCATE: Lazy<Option<Resolved<Strategy>>> = Lazy::new(|| Family::Fallocate.resolve());
static POSIX_FALLOCATE: Lazy<Option<Resolved<Strategy>>> =
    Lazy::new(|| Family::PosixFallocate.resolve());
static FFALLOCATE: Lazy<Option<Resolved<Strategy>>> = Lazy::new(|| Family::FFallocate.resolve());
static FPOSIX_FALLOCATE: Lazy<Option<Resolved<Strategy>>> =
    Lazy::new(|| Family::FPosixFallocate.resolve());

impl Family {
    /// All the families.
    pub const ALL: [Family; 4] = [
        Family::Fallocate,
        Family::PosixFallocate,
        Family::FFallocate,
        Family::FPosixFallocate,
    ];

    /// The operation name.
    pub fn name(self) -> &'static str {
        match self {
            Family::Fallocate => "fallocate",
            Family::PosixFallocate => "posix_fallocate",
            Family::FFallocate => "ffallocate",
            Family::FPosixFallocate => "fposix_fallocate",
        }
    }

    fn is_posix(self) -> bool {
        matches!(self, Family::PosixFallocate | Family::FPosixFallocate)
    }

    /// The ordered candidates for this family.
    pub fn candidates(self) -> Vec<Candidate<StrategyKind>> {
        let natives: &[StrategyKind] = if self.is_posix() {
            &[StrategyKind::PosixFallocate64, StrategyKind::PosixFallocate]
        } else {
            &[StrategyKind::Fallocate64, StrategyKind::Fallocate]
        };

        let mut candidates: Vec<_> = natives
            .iter()
            .flat_map(|&kind| {
                LIBRARIES
                    .iter()
                    .map(move |&library| Candidate::new(library, kind))
            })
            .collect();
        if self.is_posix() {
            candidates.push(Candidate::new(None, StrategyKind::PosixOverFallocate));
        }
        candidates.push(Candidate::new(None, StrategyKind::Unavailable));
        candidates
    }

    fn resolve(self) -> Option<Resolved<Strategy>> {
        chain::pick_one(self.name(), &self.candidates())
    }

    /// The strategy resolved for this family.
    pub fn strategy(self) -> Option<&'static Resolved<Strategy>> {
        match self {
            Family::Fallocate => FALLOCATE.as_ref(),
            Family::PosixFallocate => POSIX_FALLOCATE.as_ref(),
            Family::FFallocate => FFALLOCATE.as_ref(),
            Family::FPosixFallocate => FPOSIX_FALLOCATE.as_ref(),
        }
    }

    /// Invoke the strategy resolved for this family.
    pub fn invoke(
        self,
        fd: RawFd,
        offset: Scalar,
        length: Scalar,
        mode: Option<Scalar>,
    ) -> Result<(), AllocationError> {
        invoke(self.strategy(), fd, offset, length, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn routine(
        offset: impl Into<Scalar>,
        length: impl Into<Scalar>,
        mode: Option<Scalar>,
        expected: Result<Extent, &str>,
    ) {
        let actual = Extent::validate(offset.into(), length.into(), mode, i64::MAX);
        match (actual, expected) {
            (Ok(actual), Ok(expected)) => assert_eq!(actual, expected),
            (Err(err), Err(expected_message)) => {
                assert_eq!(err.errno, -1);
                assert_eq!(err.code, "EGENERIC");
                assert_eq!(err.message, expected_message);
            }
            (actual, expected) => panic!("got {actual:?}, expected {expected:?}"),
        }
    }

    fn extent(offset: i64, length: i64, mode: c_int) -> Result<Extent, &'static str> {
        Ok(Extent {
            offset,
            length,
            mode,
        })
    }

    #[test]
    fn valid() {
        routine(0, 1, None, extent(0, 1, 0));
        routine(4096, 1 << 20, Some(3.into()), extent(4096, 1 << 20, 3));
        routine(2.0, 8.0, Some(0.0.into()), extent(2, 8, 0));
    }

    #[test]
    fn invalid_offsets() {
        routine(-1, 1, None, Err("Invalid offset"));
        routine(f64::NAN, 1, None, Err("Invalid offset"));
        routine(1.09, 1, None, Err("Invalid offset"));
        routine(f64::INFINITY, 1, None, Err("Invalid offset"));
    }

    #[test]
    fn invalid_lengths() {
        routine(0, -1, None, Err("Invalid length"));
        routine(0, 0, None, Err("Invalid length"));
        routine(0, f64::NAN, None, Err("Invalid length"));
        routine(0, 1.09, None, Err("Invalid length"));
        routine(0, f64::INFINITY, None, Err("Invalid length"));
    }

    #[test]
    fn invalid_modes() {
        routine(0, 1, Some(1.5.into()), Err("Invalid mode"));
        routine(0, 1, Some(f64::NAN.into()), Err("Invalid mode"));
        routine(0, 1, Some(i64::MAX.into()), Err("Invalid mode"));
    }

    #[test]
    fn offset_checked_before_length() {
        routine(-1, -1, Some(1.5.into()), Err("Invalid offset"));
        routine(0, -1, Some(1.5.into()), Err("Invalid length"));
    }

    #[test]
    fn limit_applies() {
        let err = Extent::validate(Scalar::Integer(1 << 40), 1.into(), None, i32::MAX.into())
            .unwrap_err();
        assert_eq!(err.message, "Invalid offset");
        let err = Extent::validate(0.into(), Scalar::Integer(1 << 40), None, i32::MAX.into())
            .unwrap_err();
        assert_eq!(err.message, "Invalid length");
    }

    #[test]
    fn unavailable_is_not_implemented() {
        let strategy = Strategy::probe(StrategyKind::Unavailable, None).unwrap();
        assert!(!strategy.is_native());
        // Even with invalid arguments, the missing implementation goes first.
        let err = strategy
            .call(-1, Scalar::Integer(-1), Scalar::Integer(0), None)
            .unwrap_err();
        assert_eq!(err.message, "Not implemented");
        assert_eq!(err.errno, -1);
        assert_eq!(err.code, "EGENERIC");
    }

    #[test]
    fn absent_strategy_is_not_implemented() {
        let err = invoke(None, -1, 0.into(), 1.into(), None).unwrap_err();
        assert_eq!(err.message, "Not implemented");
        assert_eq!(err.errno, -1);
        assert_eq!(err.code, "EGENERIC");
    }

    #[test]
    fn candidate_order() {
        let kinds: Vec<_> = Family::FPosixFallocate
            .candidates()
            .into_iter()
            .map(|candidate| candidate.kind)
            .collect();
        assert_eq!(
            kinds,
            [
                StrategyKind::PosixFallocate64,
                StrategyKind::PosixFallocate64,
                StrategyKind::PosixFallocate64,
                StrategyKind::PosixFallocate,
                StrategyKind::PosixFallocate,
                StrategyKind::PosixFallocate,
                StrategyKind::PosixOverFallocate,
                StrategyKind::Unavailable,
            ]
        );
        assert_eq!(
            Family::Fallocate.candidates().last(),
            Some(&Candidate::new(None, StrategyKind::Unavailable))
        );
    }

    #[test]
    fn families_always_resolve() {
        for family in Family::ALL {
            let resolved = family.strategy().unwrap();
            assert_eq!(resolved.name, family.name());
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_binds_natively() {
        for family in Family::ALL {
            assert!(family.strategy().unwrap().value.is_native(), "{family:?}");
        }
    }
}
