//! ABI version handling.
//!
//! The ABI version is a packed `(major << 16) | minor` u32 carried in every
//! shared structure. A reader accepts any minor revision of its own major
//! (minor bumps are additive: new flags, new reserved-field meanings) but
//! must reject a foreign major outright.

use thiserror::Error;

pub const ABI_MAJOR: u32 = 1;
pub const ABI_MINOR: u32 = 0;

/// Packed version word written into every shared structure.
pub const ABI_VERSION: u32 = (ABI_MAJOR << 16) | ABI_MINOR;

pub const fn abi_major(version: u32) -> u32 {
    version >> 16
}

pub const fn abi_minor(version: u32) -> u32 {
    version & 0xFFFF
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AbiError {
    #[error("unsupported ABI major {found} (supported major: {ABI_MAJOR})")]
    UnsupportedMajor { found: u32 },
}

/// Accepts any minor revision; rejects a foreign (or zero) major.
pub fn validate_abi_version(version: u32) -> Result<(), AbiError> {
    let major = abi_major(version);
    if major != ABI_MAJOR {
        return Err(AbiError::UnsupportedMajor { found: major });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_same_major_any_minor() {
        assert!(validate_abi_version(ABI_VERSION).is_ok());
        assert!(validate_abi_version((ABI_MAJOR << 16) | (ABI_MINOR + 999)).is_ok());
    }

    #[test]
    fn rejects_foreign_major() {
        assert_eq!(
            validate_abi_version(((ABI_MAJOR + 1) << 16) | ABI_MINOR),
            Err(AbiError::UnsupportedMajor {
                found: ABI_MAJOR + 1
            })
        );
        // A zeroed version word is a garbled structure, not "version 0.x".
        assert!(validate_abi_version(0).is_err());
    }

    #[test]
    fn version_word_packs_major_minor() {
        assert_eq!(abi_major(ABI_VERSION), ABI_MAJOR);
        assert_eq!(abi_minor(ABI_VERSION), ABI_MINOR);
    }
}
