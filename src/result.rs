use std::{
    cmp::PartialEq,
    error::Error as StdError,
    fmt::{self, Display},
    io,
};

/// The top-level result type for dealing with
/// the allocator.
pub type Result<T> = std::result::Result<T, Error>;

/// An Error type encapsulating various issues that may come up
/// in both the expected and unexpected operation of the allocator.
#[derive(Debug)]
pub enum Error {
    /// Every write-buffer stripe slot is bound to a stripe. An
    /// existing stripe must be finalized before another can open.
    NoFreeWbStripe,
    /// Every user-area segment is allocated.
    NoFreeSegment,
    /// Block allocation is currently turned off, either globally or
    /// for the requested stream. No tail was modified.
    AllocationSuspended,
    /// The system has been used in an unsupported way.
    Unsupported(String),
    /// An internal invariant has been violated. Please open an issue!
    ReportableBug(String),
    /// A read or write error has happened when interacting with the
    /// metadata backend.
    Io(io::Error),
    /// A persisted context failed its checksum or geometry check.
    Corruption {
        /// The metadata file that failed validation.
        file: String,
    },
    /// Loading or formatting contexts during `init` failed.
    Startup {
        /// The metadata file being loaded.
        file: String,
        /// The underlying backend failure.
        cause: io::Error,
    },
    /// Dumping a context section to a diagnostic archive failed.
    ArchiveStore {
        /// The archive file being written.
        file: String,
        /// The underlying backend failure.
        cause: io::Error,
    },
    /// Restoring a context section from a diagnostic archive failed.
    ArchiveLoad {
        /// The archive file being read.
        file: String,
        /// The underlying backend failure.
        cause: io::Error,
    },
}

fn clone_io(ioe: &io::Error) -> io::Error {
    io::Error::new(ioe.kind(), format!("{:?}", ioe))
}

impl Clone for Error {
    fn clone(&self) -> Self {
        use self::Error::*;

        match self {
            NoFreeWbStripe => NoFreeWbStripe,
            NoFreeSegment => NoFreeSegment,
            AllocationSuspended => AllocationSuspended,
            Unsupported(why) => Unsupported(why.clone()),
            ReportableBug(what) => ReportableBug(what.clone()),
            Io(ioe) => Io(clone_io(ioe)),
            Corruption { file } => Corruption { file: file.clone() },
            Startup { file, cause } => {
                Startup { file: file.clone(), cause: clone_io(cause) }
            }
            ArchiveStore { file, cause } => {
                ArchiveStore { file: file.clone(), cause: clone_io(cause) }
            }
            ArchiveLoad { file, cause } => {
                ArchiveLoad { file: file.clone(), cause: clone_io(cause) }
            }
        }
    }
}

impl Eq for Error {}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        use self::Error::*;

        match (self, other) {
            (NoFreeWbStripe, NoFreeWbStripe)
            | (NoFreeSegment, NoFreeSegment)
            | (AllocationSuspended, AllocationSuspended) => true,
            (Unsupported(l), Unsupported(r)) => l == r,
            (ReportableBug(l), ReportableBug(r)) => l == r,
            (Corruption { file: l }, Corruption { file: r }) => l == r,
            (Startup { file: l, .. }, Startup { file: r, .. })
            | (ArchiveStore { file: l, .. }, ArchiveStore { file: r, .. })
            | (ArchiveLoad { file: l, .. }, ArchiveLoad { file: r, .. }) => {
                l == r
            }
            // io errors carry no meaningful equality
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        Error::Io(io_error)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        use self::Error::*;

        match self {
            Io(cause)
            | Startup { cause, .. }
            | ArchiveStore { cause, .. }
            | ArchiveLoad { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

impl Display for Error {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> std::result::Result<(), fmt::Error> {
        use self::Error::*;

        match *self {
            NoFreeWbStripe => {
                write!(f, "no free write-buffer stripe is available")
            }
            NoFreeSegment => write!(f, "no free user-area segment is available"),
            AllocationSuspended => {
                write!(f, "block allocation is currently turned off")
            }
            Unsupported(ref e) => write!(f, "Unsupported: {}", e),
            ReportableBug(ref e) => write!(
                f,
                "Unexpected bug has happened: {}. \
                 PLEASE REPORT THIS BUG!",
                e
            ),
            Io(ref e) => write!(f, "IO error: {}", e),
            Corruption { ref file } => {
                write!(f, "Read corrupted allocator context from {}", file)
            }
            Startup { ref file, ref cause } => write!(
                f,
                "failed to load allocator context from {}: {}",
                file, cause
            ),
            ArchiveStore { ref file, ref cause } => write!(
                f,
                "failed to store allocator meta archive to {}: {}",
                file, cause
            ),
            ArchiveLoad { ref file, ref cause } => write!(
                f,
                "failed to load allocator meta archive from {}: {}",
                file, cause
            ),
        }
    }
}

/// Bails out of the current function with `Error::ReportableBug`
/// when an internal invariant does not hold.
macro_rules! bug_unless {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            let msg = format!($($arg)+);
            log::error!("{}", msg);
            return Err($crate::Error::ReportableBug(msg));
        }
    };
}

pub(crate) use bug_unless;
