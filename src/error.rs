use thiserror::Error;

/// Type-erased source error, mirroring how the rest of this codebase boxes
/// causes instead of threading a generic error parameter everywhere.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The seven error kinds named by the orchestration core's failure model.
///
/// Every variant's `Display` is the context phrase a caller should log or
/// show; `#[source]` carries the underlying cause so `anyhow`-style `{:#}`
/// formatting (or `std::error::Error::source` chains) still reach it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("spawning bootstrap helper")]
    Spawn(#[source] BoxError),

    #[error("{phase}")]
    Io {
        phase: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("bootstrap helper {0}")]
    HelperExit(String),

    #[error("applying cgroup configuration")]
    Cgroup(#[source] BoxError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("running prestart hook {index}")]
    Hook {
        index: usize,
        #[source]
        source: BoxError,
    },

    #[error("synchronization failure: {0}")]
    Synchronization(String),
}

impl Error {
    pub fn io<E: Into<BoxError>>(phase: &'static str, source: E) -> Self {
        Error::Io {
            phase,
            source: source.into(),
        }
    }

    pub fn cgroup<E: Into<BoxError>>(source: E) -> Self {
        Error::Cgroup(source.into())
    }

    pub fn hook<E: Into<BoxError>>(index: usize, source: E) -> Self {
        Error::Hook {
            index,
            source: source.into(),
        }
    }
}

/// Attaches a phase name to a fallible step, turning any error into
/// [`Error::Io`]. Each call site names the phrase for the step it covers
/// ("starting init process command", "reading pid record", ...).
pub(crate) trait Context<T> {
    fn context(self, phase: &'static str) -> Result<T, Error>;
}

impl<T, E> Context<T> for Result<T, E>
where
    E: Into<BoxError>,
{
    fn context(self, phase: &'static str) -> Result<T, Error> {
        self.map_err(|e| Error::io(phase, e))
    }
}
