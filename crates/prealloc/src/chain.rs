//! Capability resolution via an ordered fallback chain.
//!
//! Native facilities differ from host to host, so instead of linking against
//! them we try a list of candidates in priority order and keep the first one
//! that can be constructed.

use std::{ffi::OsString, fmt};

use libloading::Library;

/// A single entry of a fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate<K> {
    /// The library to bind against.
    /// `None` stands for the running process image, i.e. the default system
    /// library.
    pub library: Option<&'static str>,
    /// What to construct.
    pub kind: K,
}

impl<K> Candidate<K> {
    /// Create a new candidate.
    pub const fn new(library: Option<&'static str>, kind: K) -> Self {
        Self { library, kind }
    }
}

/// A value that can be constructed from a [`Candidate`], failing when the
/// host does not provide what the candidate requires.
pub trait Probe: Sized {
    /// The variants a candidate can ask for.
    type Kind: Copy + fmt::Debug;

    /// Attempt the construction.
    fn probe(kind: Self::Kind, library: Option<&str>) -> Result<Self, ProbeError>;
}

/// An error that prevents a candidate from being constructed.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// The library could not be loaded.
    #[error("unable to load library: {0}")]
    Library(#[source] libloading::Error),
    /// The library does not export the required symbol.
    #[error("symbol {symbol} not found: {source}")]
    Symbol {
        /// The name of the missing symbol.
        symbol: &'static str,
        /// The underlying loader error.
        #[source]
        source: libloading::Error,
    },
    /// Native bindings are not supported on this platform.
    #[error("native bindings are not supported on this platform")]
    Unsupported,
    /// A facility this candidate depends on is not available.
    #[error("{0} is not available")]
    Unavailable(&'static str),
}

/// The winner of a fallback chain.
#[derive(Debug)]
pub struct Resolved<T: Probe> {
    /// The name of the operation this value was resolved for.
    pub name: &'static str,
    /// The candidate that has been constructed.
    pub candidate: Candidate<T::Kind>,
    /// The constructed value.
    pub value: T,
}

/// Go through the `candidates` in order and return the first one that
/// constructs successfully, or `None` if none of them does.
///
/// Failed candidates are skipped silently.
pub fn pick_one<T: Probe>(
    name: &'static str,
    candidates: &[Candidate<T::Kind>],
) -> Option<Resolved<T>> {
    candidates.iter().find_map(|&candidate| {
        let value = T::probe(candidate.kind, candidate.library).ok()?;
        tracing::debug!(
            message = "resolved",
            %name,
            kind = ?candidate.kind,
            library = ?candidate.library,
        );
        Some(Resolved {
            name,
            candidate,
            value,
        })
    })
}

/// Open the library with the given name, or the running process image for
/// `None`.
///
/// Names without a dot are treated as bare library names and expanded to
/// the platform-specific file name (`c` -> `libc.so`).
pub(crate) fn open_library(library: Option<&str>) -> Result<Library, ProbeError> {
    let Some(name) = library else {
        return open_self();
    };
    let file_name: OsString = if name.contains('.') {
        name.into()
    } else {
        libloading::library_filename(name)
    };
    // SAFETY: only system libraries (libc, libuv) are ever listed as
    // candidates, their initializers are safe to run.
    unsafe { Library::new(file_name) }.map_err(ProbeError::Library)
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn open_self() -> Result<Library, ProbeError> {
            Ok(libloading::os::unix::Library::this().into())
        }
    } else {
        fn open_self() -> Result<Library, ProbeError> {
            libloading::os::windows::Library::this()
                .map(Into::into)
                .map_err(ProbeError::Library)
        }
    }
}

/// Look up the symbol `name` in the `library` and copy it out.
///
/// # Safety
///
/// `F` must match the actual type of the symbol, and the returned value must
/// not outlive the `library`.
pub(crate) unsafe fn symbol<F: Copy>(
    library: &Library,
    name: &'static str,
) -> Result<F, ProbeError> {
    let symbol = library
        .get::<F>(name.as_bytes())
        .map_err(|source| ProbeError::Symbol {
            symbol: name,
            source,
        })?;
    Ok(*symbol)
}
