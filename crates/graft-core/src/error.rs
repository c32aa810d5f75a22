use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid pattern token '{token}': {reason}")]
    InvalidPatternToken { token: String, reason: String },

    #[error("Pattern text is empty")]
    EmptyPattern,

    #[error("Pattern '{pattern}' not found in scanned region")]
    PatternNotFound { pattern: String },

    #[error("Pattern entry '{0}' not found in set")]
    UnknownPatternEntry(String),

    #[error("Scan region at {address:#x} ({size} bytes) is not readable")]
    UnreadableRegion { address: usize, size: usize },

    #[error("Hook '{0}' is already registered")]
    DuplicateHook(String),

    #[error("Hook '{name}' at {address:#x} overlaps an existing patch")]
    OverlappingHook { name: String, address: usize },

    #[error("Hook target address is null")]
    NullTarget,

    #[error("Detour function pointer is null")]
    NullDetour,

    #[error("Code allocation failed near {address:#x}")]
    BadAllocation { address: usize },

    #[error("Failed to decode instruction at {address:#x}")]
    DecodeFailed { address: usize },

    #[error("Short jump in relocated prologue at {address:#x}")]
    ShortJumpInPrologue { address: usize },

    #[error("IP-relative operand out of range at {address:#x}")]
    IpRelativeOutOfRange { address: usize },

    #[error("Unsupported instruction in relocated prologue at {address:#x}")]
    UnsupportedInstruction { address: usize },

    #[error("Failed to change page protection at {address:#x}")]
    ProtectFailed { address: usize },

    #[error("Not enough space for patch at {address:#x}")]
    NotEnoughSpace { address: usize },

    #[error("A probe is already armed at {address:#x}")]
    ProbeAlreadyArmed { address: usize },

    #[error("Trap length must be at least 1 byte")]
    ZeroTrapLength,

    #[error("Failed to register the process fault filter")]
    FilterRegistration,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The code address a hook/probe failure refers to, when there is one.
    pub fn faulting_address(&self) -> Option<usize> {
        match self {
            Error::UnreadableRegion { address, .. }
            | Error::OverlappingHook { address, .. }
            | Error::BadAllocation { address }
            | Error::DecodeFailed { address }
            | Error::ShortJumpInPrologue { address }
            | Error::IpRelativeOutOfRange { address }
            | Error::UnsupportedInstruction { address }
            | Error::ProtectFailed { address }
            | Error::NotEnoughSpace { address }
            | Error::ProbeAlreadyArmed { address } => Some(*address),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_faulting_address_present() {
        let err = Error::DecodeFailed { address: 0x1400_0100 };
        assert_eq!(err.faulting_address(), Some(0x1400_0100));
    }

    #[test]
    fn test_faulting_address_absent() {
        let err = Error::EmptyPattern;
        assert_eq!(err.faulting_address(), None);
    }

    #[test]
    fn test_display_includes_address() {
        let err = Error::NotEnoughSpace { address: 0xdead };
        assert!(err.to_string().contains("0xdead"));
    }
}
