//! Node identity.
//!
//! A [`PeerName`] is a 48-bit identifier, conventionally written like a MAC
//! address (`aa:bb:cc:dd:ee:ff`). When no explicit name is configured the
//! local identity is taken from the first hardware address of the host.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SwarmError;

const NAME_MASK: u64 = 0x0000_ffff_ffff_ffff;
const NAME_OCTETS: usize = 6;
const SYS_CLASS_NET: &str = "/sys/class/net";

/// Unique identifier of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerName(u64);

impl PeerName {
    /// Creates a name from its numeric form. Only the low 48 bits are kept.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value & NAME_MASK)
    }

    /// Creates a name from its numeric form, or `None` if any of the high
    /// 16 bits are set.
    #[must_use]
    pub const fn try_new(value: u64) -> Option<Self> {
        if value & !NAME_MASK == 0 {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Returns the numeric form of the name.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Generates a random non-zero name.
    #[must_use]
    pub fn random() -> Self {
        loop {
            let name = Self::new(rand::random::<u64>());
            if name.0 != 0 {
                return name;
            }
        }
    }

    /// Derives the local name from the host's hardware address, falling back
    /// to a random name when none can be read.
    #[must_use]
    pub fn from_hardware() -> Self {
        match first_hardware_name(Path::new(SYS_CLASS_NET)) {
            Ok(Some(name)) => {
                debug!(name = %name, "using hardware address as node name");
                name
            }
            Ok(None) => {
                let name = Self::random();
                warn!(name = %name, "no hardware address found, using random node name");
                name
            }
            Err(e) => {
                let name = Self::random();
                warn!(name = %name, error = %e, "cannot read interfaces, using random node name");
                name
            }
        }
    }

    /// Resolves the local identity: the configured name when it parses,
    /// otherwise the hardware-derived one.
    #[must_use]
    pub fn local(configured: Option<&str>) -> Self {
        match configured.map(str::parse::<Self>) {
            Some(Ok(name)) => name,
            Some(Err(e)) => {
                warn!(error = %e, "invalid node name, deriving one from hardware");
                Self::from_hardware()
            }
            None => Self::from_hardware(),
        }
    }
}

impl From<u64> for PeerName {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_be_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]
        )
    }
}

impl FromStr for PeerName {
    type Err = SwarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| SwarmError::Config(format!("invalid peer name '{s}': {reason}"));

        let mut value = 0u64;
        let mut octets = 0;
        for part in s.split(':') {
            if part.is_empty() || part.len() > 2 {
                return Err(invalid("each octet must be one or two hex digits"));
            }
            let octet = u8::from_str_radix(part, 16).map_err(|_| invalid("not hexadecimal"))?;
            value = (value << 8) | u64::from(octet);
            octets += 1;
        }

        if octets != NAME_OCTETS {
            return Err(invalid("expected six octets"));
        }
        Ok(Self(value))
    }
}

/// Reads the first non-loopback, non-zero interface address under `root`.
/// Interfaces whose address is unreadable or malformed are skipped.
fn first_hardware_name(root: &Path) -> Result<Option<PeerName>, SwarmError> {
    let mut interfaces = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let path = entry?.path();
        if path.file_name().is_some_and(|n| n != "lo") {
            interfaces.push(path);
        }
    }
    interfaces.sort();

    Ok(interfaces
        .iter()
        .filter_map(|path| std::fs::read_to_string(path.join("address")).ok())
        .filter_map(|addr| addr.trim().parse::<PeerName>().ok())
        .find(|name| name.0 != 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn display_is_colon_hex() {
        let name = PeerName::new(0x0000_0a0b_0c0d_0e0f);
        assert_eq!(name.to_string(), "0a:0b:0c:0d:0e:0f");
    }

    #[test]
    fn new_masks_high_bits() {
        assert_eq!(PeerName::new(u64::MAX).as_u64(), NAME_MASK);
    }

    #[test]
    fn try_new_rejects_high_bits() {
        assert_eq!(PeerName::try_new(0x1234), Some(PeerName::new(0x1234)));
        assert_eq!(PeerName::try_new(NAME_MASK), Some(PeerName::new(NAME_MASK)));
        assert!(PeerName::try_new(1 << 48).is_none());
    }

    #[test]
    fn parse_display_roundtrip() {
        let name: PeerName = "12:34:56:78:9a:bc".parse().expect("valid name");
        assert_eq!(name.as_u64(), 0x1234_5678_9abc);
        assert_eq!(name.to_string(), "12:34:56:78:9a:bc");
    }

    #[test]
    fn parse_accepts_short_octets() {
        let name: PeerName = "0:0:0:0:0:2".parse().expect("valid name");
        assert_eq!(name.as_u64(), 2);
    }

    #[test_case("" ; "empty")]
    #[test_case("12:34:56:78:9a" ; "too few octets")]
    #[test_case("12:34:56:78:9a:bc:de" ; "too many octets")]
    #[test_case("12:34:56:78:9a:zz" ; "not hex")]
    #[test_case("123:4:56:78:9a:bc" ; "octet too long")]
    fn parse_rejects(input: &str) {
        assert!(input.parse::<PeerName>().is_err());
    }

    #[test]
    fn local_prefers_configured_name() {
        let name = PeerName::local(Some("00:00:00:00:00:07"));
        assert_eq!(name.as_u64(), 7);
    }

    #[test]
    fn local_falls_back_on_invalid_name() {
        let name = PeerName::local(Some("not-a-name"));
        assert_ne!(name.as_u64(), 0);
    }

    #[test]
    fn random_is_non_zero_and_masked() {
        for _ in 0..64 {
            let name = PeerName::random();
            assert_ne!(name.as_u64(), 0);
            assert_eq!(name.as_u64() & !NAME_MASK, 0);
        }
    }

    #[test]
    fn hardware_name_from_missing_root_is_io_error() {
        let err = first_hardware_name(Path::new("/nonexistent/sys/class/net"))
            .expect_err("missing directory");
        assert!(matches!(err, SwarmError::Io(_)));
    }

    #[test]
    fn hardware_name_skips_loopback_and_zero() {
        let root = std::env::temp_dir().join(format!("mesh-swarm-net-{}", std::process::id()));
        for (iface, addr) in [
            ("lo", "00:00:00:00:00:01"),
            ("eth0", "00:00:00:00:00:00"),
            ("eth1", "02:42:ac:11:00:02"),
        ] {
            std::fs::create_dir_all(root.join(iface)).expect("create iface dir");
            std::fs::write(root.join(iface).join("address"), format!("{addr}\n"))
                .expect("write address");
        }

        let name = first_hardware_name(&root).expect("readable root");
        std::fs::remove_dir_all(&root).expect("cleanup");
        assert_eq!(name, Some(PeerName::new(0x0242_ac11_0002)));
    }
}
