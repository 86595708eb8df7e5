use std::fmt;

use crate::backend::Rotation;

#[derive(Debug)]
pub enum CaptureError {
    /// The requested logical monitor index does not exist, even after a
    /// fresh enumeration.
    MonitorIndexOutOfRange {
        index: usize,
        available: usize,
    },

    InvalidConfig(String),

    /// An operation was called in a manager/source state that cannot
    /// service it (e.g. capturing before a duplication is bound).
    InvalidState(&'static str),

    /// The output is rotated. Rotated desktops are not captured; pick
    /// another output.
    UnsupportedRotation(Rotation),

    BackendUnavailable(String),

    /// Frame metadata reported a non-zero size but no rectangle storage
    /// was populated for it.
    CorruptedMetadata,

    /// Growing the metadata or pointer shape buffer failed. The frame's
    /// change data has been discarded.
    OutOfMemory(&'static str),

    /// A region copy was requested without an acquired frame.
    NoFrame,

    WorkerDead,

    /// The graphics device was removed, reset, or ran out of memory. The
    /// device and duplication must be rebuilt.
    DeviceRemoved,

    /// The duplication interface lost access to the output (mode change,
    /// secure desktop, fullscreen switch). The duplication must be rebuilt.
    AccessLost,

    BufferOverflow,

    Platform(anyhow::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureErrorClass {
    InvalidInput,
    Unsupported,
    Transient,
    DeviceLost,
    Fatal,
}

impl CaptureError {
    pub fn class(&self) -> CaptureErrorClass {
        match self {
            Self::MonitorIndexOutOfRange { .. } | Self::InvalidConfig(_) | Self::InvalidState(_) => {
                CaptureErrorClass::InvalidInput
            }
            Self::UnsupportedRotation(_) | Self::BackendUnavailable(_) => {
                CaptureErrorClass::Unsupported
            }
            Self::CorruptedMetadata | Self::OutOfMemory(_) | Self::NoFrame | Self::WorkerDead => {
                CaptureErrorClass::Transient
            }
            Self::DeviceRemoved | Self::AccessLost => CaptureErrorClass::DeviceLost,
            Self::BufferOverflow | Self::Platform(_) => CaptureErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), CaptureErrorClass::Transient)
    }

    /// Whether the device and duplication binding must be torn down and
    /// rebuilt before capturing again.
    pub fn requires_reinitialization(&self) -> bool {
        matches!(self.class(), CaptureErrorClass::DeviceLost)
    }

    /// Create a string-based copy of this error suitable for sending
    /// through channels. The `Platform` variant loses its inner
    /// `anyhow::Error` chain and becomes a formatted string.
    pub fn to_sendable(&self) -> Self {
        match self {
            Self::MonitorIndexOutOfRange { index, available } => Self::MonitorIndexOutOfRange {
                index: *index,
                available: *available,
            },
            Self::InvalidConfig(s) => Self::InvalidConfig(s.clone()),
            Self::InvalidState(s) => Self::InvalidState(s),
            Self::UnsupportedRotation(r) => Self::UnsupportedRotation(*r),
            Self::BackendUnavailable(s) => Self::BackendUnavailable(s.clone()),
            Self::CorruptedMetadata => Self::CorruptedMetadata,
            Self::OutOfMemory(what) => Self::OutOfMemory(what),
            Self::NoFrame => Self::NoFrame,
            Self::WorkerDead => Self::WorkerDead,
            Self::DeviceRemoved => Self::DeviceRemoved,
            Self::AccessLost => Self::AccessLost,
            Self::BufferOverflow => Self::BufferOverflow,
            Self::Platform(inner) => Self::Platform(anyhow::anyhow!("{inner:#}")),
        }
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MonitorIndexOutOfRange { index, available } => write!(
                f,
                "monitor index {index} is out of range ({available} outputs enumerated)"
            ),
            Self::InvalidConfig(message) => write!(f, "invalid capture configuration: {message}"),
            Self::InvalidState(message) => write!(f, "invalid capture state: {message}"),
            Self::UnsupportedRotation(rotation) => {
                write!(f, "output rotation {rotation:?} is not supported")
            }
            Self::BackendUnavailable(message) => {
                write!(f, "no available backend implementation: {message}")
            }
            Self::CorruptedMetadata => {
                write!(f, "frame reported metadata but no rectangle data was produced")
            }
            Self::OutOfMemory(what) => write!(f, "failed to allocate memory for {what}"),
            Self::NoFrame => write!(f, "no acquired frame is available"),
            Self::WorkerDead => write!(f, "capture worker is not running"),
            Self::DeviceRemoved => write!(f, "graphics device was removed or reset"),
            Self::AccessLost => write!(f, "desktop duplication access lost"),
            Self::BufferOverflow => write!(f, "frame buffer size overflow"),
            Self::Platform(inner) => write!(f, "{inner}"),
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Platform(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

pub type CaptureResult<T> = Result<T, CaptureError>;
