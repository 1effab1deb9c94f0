//! Platform capability policy.
//!
//! Some OS releases are known to take the host down when handed certain
//! command variants. Those combinations are refused here, before anything
//! reaches the kernel.

use std::fmt;

/// Windows NT version number as reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OsVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
}

impl OsVersion {
    pub const fn new(major: u32, minor: u32, build: u32) -> Self {
        Self {
            major,
            minor,
            build,
        }
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

/// First NT release whose ATA pass-through handles 48-bit commands.
const FIRST_SAFE_EXTENDED_ATA: u32 = 6;

/// 48-bit ATA pass-through crashes NT 5.x (XP, Server 2003).
pub fn extended_ata_permitted(version: OsVersion) -> bool {
    version.major >= FIRST_SAFE_EXTENDED_ATA
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extended_ata_policy() {
        assert!(!extended_ata_permitted(OsVersion::new(5, 1, 2600)));
        assert!(!extended_ata_permitted(OsVersion::new(5, 2, 3790)));
        assert!(extended_ata_permitted(OsVersion::new(6, 0, 6000)));
        assert!(extended_ata_permitted(OsVersion::new(10, 0, 19045)));
    }
}
