use std::{error::Error, fmt, io};

/// The gradient server's result type.
pub type Result<T> = std::result::Result<T, ServerErr>;

/// Failures surfaced by the gradient server's core and its sessions.
#[derive(Debug)]
pub enum ServerErr {
    Io(io::Error),
    DimensionMismatch { expected: usize, got: usize },
    IndexOutOfBounds { index: usize, len: usize },
    UnknownSender { rank: usize, workers: usize },
    UnsupportedMessageKind { kind: &'static str },
    UnauthorizedLearningRate { rank: usize },
    InvalidSpec(String),
}

impl fmt::Display for ServerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerErr::Io(e) => write!(f, "io error: {e}"),
            ServerErr::DimensionMismatch { expected, got } => {
                write!(f, "dimension mismatch: got {got}, expected {expected}")
            }
            ServerErr::IndexOutOfBounds { index, len } => {
                write!(f, "sparse index {index} out of bounds for length {len}")
            }
            ServerErr::UnknownSender { rank, workers } => {
                write!(f, "unknown sender rank {rank}, workers hold ranks 1..{workers}")
            }
            ServerErr::UnsupportedMessageKind { kind } => {
                write!(f, "unsupported message kind: {kind}")
            }
            ServerErr::UnauthorizedLearningRate { rank } => {
                write!(f, "rank {rank} is not allowed to set the learning rate")
            }
            ServerErr::InvalidSpec(detail) => write!(f, "invalid server spec: {detail}"),
        }
    }
}

impl Error for ServerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ServerErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ServerErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<ServerErr> for io::Error {
    fn from(value: ServerErr) -> Self {
        match value {
            ServerErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
