//! The error classification.
//!
//! Raw system error numbers are mapped to a symbolic code and a human readable
//! description. When libuv is around we ask it, as it knows the names the rest
//! of the ecosystem uses. Otherwise a built-in table is consulted.

use std::{
    ffi::CStr,
    fmt, io,
    os::raw::{c_char, c_int},
};

use libloading::Library;
use once_cell::sync::Lazy;

use crate::chain::{self, Candidate, Probe, ProbeError, Resolved};

/// The raw error value reserved for the failures that never reached the
/// native layer.
pub const LOCAL_FAILURE: i32 = -1;

/// The code reported for [`LOCAL_FAILURE`].
pub const GENERIC_CODE: &str = "EGENERIC";

/// The code reported for the error numbers nobody knows about.
pub const UNKNOWN_CODE: &str = "ERROR";

/// The symbolic form of a raw error number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The symbolic code, like `ENOSPC`.
    pub code: String,
    /// The human readable description, might be empty.
    pub description: String,
}

impl Resolution {
    fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: description.into(),
        }
    }

    fn generic() -> Self {
        Self::new(GENERIC_CODE, "")
    }

    fn unknown() -> Self {
        Self::new(UNKNOWN_CODE, "")
    }
}

/// Resolve the raw error number to its symbolic code and description.
pub fn resolve(errno: i32) -> Resolution {
    if errno == LOCAL_FAILURE {
        return Resolution::generic();
    }
    match backend() {
        Some(resolved) => resolved.value.resolve(errno),
        None => Backend::Table.resolve(errno),
    }
}

/// The error resolution backend in use, if any has been resolved.
pub fn backend() -> Option<&'static Resolved<Backend>> {
    BACKEND.as_ref()
}

/// The error produced by the allocation operations.
///
/// Carries the raw error number along with its resolved symbolic form.
/// A raw value of [`LOCAL_FAILURE`] means the failure was detected locally
/// (invalid arguments, unavailable implementation) and no native call was
/// made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationError {
    /// The symbolic code, like `ENOSPC` or `EGENERIC`.
    pub code: String,
    /// The description of the error number, might be empty.
    pub description: String,
    /// The raw error number.
    pub errno: i32,
    /// The message supplied at the failure site.
    pub message: String,
}

impl AllocationError {
    /// Create a new error for the raw `errno`, resolving its symbolic form.
    pub fn new(errno: i32, message: impl Into<String>) -> Self {
        let Resolution { code, description } = resolve(errno);
        Self {
            code,
            description,
            errno,
            message: message.into(),
        }
    }

    /// Create a new error for a failure detected before any native call.
    pub fn local(message: impl Into<String>) -> Self {
        Self::new(LOCAL_FAILURE, message)
    }

    /// The error for the operations that have no implementation on this host.
    pub fn not_implemented() -> Self {
        Self::local("Not implemented")
    }

    /// Create a new error from an I/O error, keeping its OS error number
    /// if there is one.
    pub fn from_io(err: io::Error) -> Self {
        Self::new(err.raw_os_error().unwrap_or(LOCAL_FAILURE), err.to_string())
    }

    /// The error for a request that never made it to the worker, or whose
    /// reply never made it back.
    pub fn transport(err: io::Error) -> Self {
        tracing::debug!(message = "transport failure", error = %err);
        Self::from_io(err)
    }

    /// Whether the failure was detected locally.
    pub fn is_local(&self) -> bool {
        self.errno == LOCAL_FAILURE
    }
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = if self.description.is_empty() {
            &self.message
        } else {
            &self.description
        };
        write!(f, "{} ({}, {})", text, self.errno, self.code)
    }
}

impl std::error::Error for AllocationError {}

impl From<io::Error> for AllocationError {
    fn from(err: io::Error) -> Self {
        Self::from_io(err)
    }
}

/// The candidates for the error resolution backend, in the order of
/// preference. The table always constructs, so it goes last.
const BACKEND_CANDIDATES: &[Candidate<BackendKind>] = &[
    Candidate::new(None, BackendKind::Libuv),
    Candidate::new(Some("libuv.so.1"), BackendKind::Libuv),
    Candidate::new(Some("uv"), BackendKind::Libuv),
    Candidate::new(None, BackendKind::Table),
];

static BACKEND: Lazy<Option<Resolved<Backend>>> =
    Lazy::new(|| chain::pick_one("resolve_error", BACKEND_CANDIDATES));

/// The kinds of the error resolution backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Ask libuv.
    Libuv,
    /// Look the value up in the built-in table.
    Table,
}

/// The error resolution backend.
#[derive(Debug)]
pub enum Backend {
    /// Bound to libuv.
    Libuv(Libuv),
    /// The built-in table only.
    Table,
}

impl Probe for Backend {
    type Kind = BackendKind;

    fn probe(kind: Self::Kind, library: Option<&str>) -> Result<Self, ProbeError> {
        match kind {
            BackendKind::Libuv => Libuv::load(library).map(Backend::Libuv),
            BackendKind::Table => Ok(Backend::Table),
        }
    }
}

impl Backend {
    /// The kind of this backend.
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Libuv(_) => BackendKind::Libuv,
            Backend::Table => BackendKind::Table,
        }
    }

    /// Resolve via the richer facility first, then via the table.
    fn resolve(&self, errno: i32) -> Resolution {
        let rich = match self {
            Backend::Libuv(libuv) => libuv.resolve(errno),
            Backend::Table => Err(Unresolved),
        };
        rich.or_else(|Unresolved| table_lookup(errno))
            .unwrap_or_else(|Unresolved| Resolution::unknown())
    }
}

/// The resolution attempt yielded nothing usable.
#[derive(Debug)]
struct Unresolved;

type TranslateSysErrorFn = unsafe extern "C" fn(c_int) -> c_int;
type ErrTextFn = unsafe extern "C" fn(c_int) -> *const c_char;

/// The libuv error naming facilities.
#[derive(Debug)]
pub struct Libuv {
    translate_sys_error: TranslateSysErrorFn,
    err_name: ErrTextFn,
    strerror: ErrTextFn,
    /// Keeps the symbols above valid.
    _library: Library,
}

impl Libuv {
    fn load(library: Option<&str>) -> Result<Self, ProbeError> {
        let library = chain::open_library(library)?;
        // SAFETY: the types match the libuv declarations, and the library is
        // stored next to the symbols.
        unsafe {
            Ok(Self {
                translate_sys_error: chain::symbol(&library, "uv_translate_sys_error")?,
                err_name: chain::symbol(&library, "uv_err_name")?,
                strerror: chain::symbol(&library, "uv_strerror")?,
                _library: library,
            })
        }
    }

    fn resolve(&self, errno: i32) -> Result<Resolution, Unresolved> {
        // SAFETY: the functions accept any value, and return either null or
        // a pointer to a nul-terminated string.
        unsafe {
            let translated = (self.translate_sys_error)(errno);
            let code = c_text((self.err_name)(translated))?;
            let description = c_text((self.strerror)(translated))?;
            Ok(Resolution::new(code, description))
        }
    }
}

/// Copy out the nul-terminated string.
///
/// # Safety
///
/// The `ptr` must be either null or point to a valid nul-terminated string.
unsafe fn c_text(ptr: *const c_char) -> Result<String, Unresolved> {
    if ptr.is_null() {
        return Err(Unresolved);
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map(str::to_owned)
        .map_err(|_| Unresolved)
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn table_lookup(errno: i32) -> Result<Resolution, Unresolved> {
            use nix::errno::Errno;

            match Errno::from_i32(errno) {
                Errno::UnknownErrno => Err(Unresolved),
                known => Ok(Resolution::new(format!("{known:?}"), known.desc())),
            }
        }
    } else {
        fn table_lookup(_errno: i32) -> Result<Resolution, Unresolved> {
            Err(Unresolved)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn local_failure() {
        assert_eq!(resolve(LOCAL_FAILURE), Resolution::new("EGENERIC", ""));
    }

    #[cfg(unix)]
    #[test]
    fn known_errno() {
        let resolution = resolve(nix::libc::ENOSPC);
        assert_eq!(resolution.code, "ENOSPC");
        assert!(!resolution.description.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn table_backend() {
        let resolution = Backend::Table.resolve(nix::libc::EBADF);
        assert_eq!(resolution.code, "EBADF");
        assert_eq!(resolution.description, "Bad file number");
    }

    #[test]
    fn unknown_errno() {
        assert_eq!(Backend::Table.resolve(0), Resolution::unknown());
        assert_eq!(Backend::Table.resolve(987_654), Resolution::unknown());
    }

    #[test]
    fn backend_always_resolves() {
        assert!(backend().is_some());
    }

    #[test]
    fn display_local() {
        let err = AllocationError::local("Invalid offset");
        assert_eq!(err.code, "EGENERIC");
        assert_eq!(err.errno, -1);
        assert!(err.is_local());
        assert_eq!(err.to_string(), "Invalid offset (-1, EGENERIC)");
    }

    #[cfg(unix)]
    #[test]
    fn display_native() {
        let err = AllocationError::new(nix::libc::ENOSPC, "Allocation failed");
        assert!(!err.is_local());
        assert!(err.to_string().ends_with(&format!("({}, ENOSPC)", nix::libc::ENOSPC)));
        assert!(!err.to_string().starts_with("Allocation failed"));
    }

    #[cfg(unix)]
    #[test]
    fn from_io() {
        let err = AllocationError::from_io(io::Error::from_raw_os_error(nix::libc::ENOENT));
        assert_eq!(err.code, "ENOENT");
        assert_eq!(err.errno, nix::libc::ENOENT);

        let err = AllocationError::from_io(io::Error::new(io::ErrorKind::Other, "pipe gone"));
        assert_eq!(err.code, "EGENERIC");
        assert_eq!(err.message, "pipe gone");
    }
}
