//! Coordinator address resolution.
//!
//! Client frames may carry the all-zero sentinel instead of a literal
//! device address, meaning "the network coordinator". Before forwarding,
//! the tunnels substitute it with a concrete IPv6 address obtained from a
//! [`CoordinatorResolver`]. Exactly one candidate coordinator must exist;
//! zero or several is an error and the packet in flight is dropped.

use std::io;
use std::net::Ipv6Addr;
use std::path::PathBuf;

use thiserror::Error;

/// Record file maintained by the 6LoWPAN border router daemon, holding the
/// coordinator's IPv6 address as a single line of text.
pub const DEFAULT_COORDINATOR_FILE: &str = "/tmp/6LoWPANd.addr";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no coordinator address is known")]
    NotFound,

    #[error("found {0} candidate coordinators, expected exactly one")]
    Ambiguous(usize),

    #[error("coordinator record is not a valid IPv6 address: {0:?}")]
    Invalid(String),

    #[error("failed to read coordinator record: {0}")]
    Io(#[from] io::Error),
}

/// Maps the coordinator sentinel to a real IPv6 unicast address.
///
/// Called from the UDP worker and from every TCP session concurrently, so
/// implementations must be safe for shared use.
pub trait CoordinatorResolver: Send + Sync {
    fn coordinator_address(&self) -> Result<Ipv6Addr, ResolveError>;
}

/// Substitutes the sentinel with the coordinator's address; concrete
/// addresses pass through unchanged.
pub fn resolve_destination(
    address: Ipv6Addr,
    resolver: &dyn CoordinatorResolver,
) -> Result<Ipv6Addr, ResolveError> {
    if address.is_unspecified() {
        resolver.coordinator_address()
    } else {
        Ok(address)
    }
}

/// Reads the coordinator address from the border router's record file.
pub struct FileResolver {
    path: PathBuf,
}

impl FileResolver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileResolver { path: path.into() }
    }
}

impl CoordinatorResolver for FileResolver {
    fn coordinator_address(&self) -> Result<Ipv6Addr, ResolveError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(ResolveError::NotFound),
            Err(e) => return Err(ResolveError::Io(e)),
        };

        let mut records = contents.lines().map(str::trim).filter(|l| !l.is_empty());
        let record = records.next().ok_or(ResolveError::NotFound)?;
        let extra = records.count();
        if extra > 0 {
            return Err(ResolveError::Ambiguous(1 + extra));
        }

        record
            .parse()
            .map_err(|_| ResolveError::Invalid(record.to_string()))
    }
}

/// Resolver over a fixed candidate list, for deployments with a cached
/// discovery result. Enforces the exactly-one-coordinator contract.
pub struct StaticResolver {
    candidates: Vec<Ipv6Addr>,
}

impl StaticResolver {
    pub fn new(candidates: Vec<Ipv6Addr>) -> Self {
        StaticResolver { candidates }
    }
}

impl CoordinatorResolver for StaticResolver {
    fn coordinator_address(&self) -> Result<Ipv6Addr, ResolveError> {
        match self.candidates.as_slice() {
            [] => Err(ResolveError::NotFound),
            [address] => Ok(*address),
            candidates => Err(ResolveError::Ambiguous(candidates.len())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_record(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("jipd-test-{name}-{}", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn concrete_address_passes_through() {
        let resolver = StaticResolver::new(vec![]);
        let addr: Ipv6Addr = "fd00::42".parse().unwrap();
        assert_eq!(resolve_destination(addr, &resolver).unwrap(), addr);
    }

    #[test]
    fn sentinel_invokes_resolver() {
        let coordinator: Ipv6Addr = "fd00::1".parse().unwrap();
        let resolver = StaticResolver::new(vec![coordinator]);
        assert_eq!(
            resolve_destination(Ipv6Addr::UNSPECIFIED, &resolver).unwrap(),
            coordinator
        );
    }

    #[test]
    fn no_candidates_is_not_found() {
        let resolver = StaticResolver::new(vec![]);
        assert!(matches!(
            resolve_destination(Ipv6Addr::UNSPECIFIED, &resolver),
            Err(ResolveError::NotFound)
        ));
    }

    #[test]
    fn several_candidates_is_ambiguous() {
        let resolver = StaticResolver::new(vec![
            "fd00::1".parse().unwrap(),
            "fd00::2".parse().unwrap(),
        ]);
        assert!(matches!(
            resolver.coordinator_address(),
            Err(ResolveError::Ambiguous(2))
        ));
    }

    #[test]
    fn file_resolver_parses_record() {
        let path = temp_record("single", "  fd00::1\t\n");
        let resolver = FileResolver::new(&path);
        assert_eq!(
            resolver.coordinator_address().unwrap(),
            "fd00::1".parse::<Ipv6Addr>().unwrap()
        );
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn file_resolver_rejects_several_records() {
        let path = temp_record("multi", "fd00::1\nfd00::2\n");
        let resolver = FileResolver::new(&path);
        assert!(matches!(
            resolver.coordinator_address(),
            Err(ResolveError::Ambiguous(2))
        ));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn file_resolver_rejects_garbage() {
        let path = temp_record("garbage", "not-an-address\n");
        let resolver = FileResolver::new(&path);
        assert!(matches!(
            resolver.coordinator_address(),
            Err(ResolveError::Invalid(_))
        ));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn file_resolver_missing_file_is_not_found() {
        let resolver = FileResolver::new("/nonexistent/jipd-no-such-record");
        assert!(matches!(
            resolver.coordinator_address(),
            Err(ResolveError::NotFound)
        ));
    }
}
