use thiserror::Error;

/// Recoverable failures surfaced by the JIT.
///
/// Broken internal invariants (no spillable register, destroying a block twice, a lookup
/// table pointing at an invalid way) are bugs and panic instead.
#[derive(Debug, Error)]
pub enum JitError {
    #[error("failed to map or protect code memory")]
    CodeMemory(#[from] std::io::Error),

    #[error("code space exhausted in {region} region")]
    CodeSpaceExhausted { region: &'static str },

    #[error("invalid JIT configuration: {0}")]
    InvalidConfig(String),

    #[error("block compiler failed at {address:#010x}: {reason}")]
    Compile { address: u32, reason: String },
}

pub type Result<T, E = JitError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = JitError::CodeSpaceExhausted { region: "near" };
        assert_eq!(err.to_string(), "code space exhausted in near region");

        let err = JitError::Compile { address: 0x8000_3100, reason: "bad opcode".into() };
        assert_eq!(err.to_string(), "block compiler failed at 0x80003100: bad opcode");
    }

    #[test]
    fn test_io_error_converts() {
        fn fails() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "mprotect"))?
        }
        assert!(matches!(fails(), Err(JitError::CodeMemory(_))));
    }
}
