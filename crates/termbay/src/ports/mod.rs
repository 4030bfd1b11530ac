//! Exclusive host-port allocation for session terminals.
//!
//! Every session owns a [`PortPair`]: the primary ("claude") terminal port and
//! the secondary ("manual") terminal port. The [`PortAllocator`] hands pairs
//! out of a fixed range and guarantees no port is owned twice.

use std::collections::BTreeSet;
use std::fmt;

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

/// Result type for port operations.
pub type PortResult<T> = Result<T, PortError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    /// Fewer than two free ports remain.
    #[error("port pool exhausted: {available} free port(s) in {range}, need 2")]
    ResourceExhausted { available: usize, range: PortRange },

    #[error("invalid port pair {claude}/{manual}: {reason}")]
    InvalidPair {
        claude: u16,
        manual: u16,
        reason: String,
    },

    #[error("invalid port range {start}-{end}")]
    InvalidRange { start: u16, end: u16 },
}

/// Inclusive range of allocatable host ports. Always non-empty and never
/// includes port 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPortRange", into = "RawPortRange")]
pub struct PortRange {
    start: u16,
    end: u16,
}

#[derive(Serialize, Deserialize)]
struct RawPortRange {
    start: u16,
    end: u16,
}

impl TryFrom<RawPortRange> for PortRange {
    type Error = PortError;

    fn try_from(raw: RawPortRange) -> PortResult<Self> {
        Self::new(raw.start, raw.end)
    }
}

impl From<PortRange> for RawPortRange {
    fn from(range: PortRange) -> Self {
        Self {
            start: range.start,
            end: range.end,
        }
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 7681,
            end: 7780,
        }
    }
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> PortResult<Self> {
        if start == 0 || end < start {
            return Err(PortError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn len(&self) -> usize {
        usize::from(self.end.saturating_sub(self.start)) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// The two host ports bound to one session container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortPair {
    claude_port: u16,
    manual_port: u16,
}

impl PortPair {
    /// Build a pair; both ports must be distinct and inside `range`.
    pub fn new(claude_port: u16, manual_port: u16, range: &PortRange) -> PortResult<Self> {
        let invalid = |reason: String| PortError::InvalidPair {
            claude: claude_port,
            manual: manual_port,
            reason,
        };

        if claude_port == manual_port {
            return Err(invalid("ports must differ".to_string()));
        }
        for port in [claude_port, manual_port] {
            if !range.contains(port) {
                return Err(invalid(format!("port {} outside {}", port, range)));
            }
        }

        Ok(Self {
            claude_port,
            manual_port,
        })
    }

    /// Rebuild a pair read back from storage, where the range is unknown.
    pub(crate) fn from_stored(claude_port: u16, manual_port: u16) -> PortResult<Self> {
        Self::new(claude_port, manual_port, &PortRange {
            start: 1,
            end: u16::MAX,
        })
    }

    pub fn claude_port(&self) -> u16 {
        self.claude_port
    }

    pub fn manual_port(&self) -> u16 {
        self.manual_port
    }

    pub fn ports(&self) -> [u16; 2] {
        [self.claude_port, self.manual_port]
    }
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.claude_port, self.manual_port)
    }
}

/// Process-wide allocator over a fixed port range.
///
/// All claims and releases go through one mutex, so concurrent callers can
/// never observe and take the same port.
#[derive(Debug)]
pub struct PortAllocator {
    range: PortRange,
    allocated: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            allocated: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Claim the two lowest free ports as one pair.
    ///
    /// All-or-nothing: if only one port could be claimed it is returned to the
    /// pool before `ResourceExhausted` is reported.
    pub async fn allocate_pair(&self) -> PortResult<PortPair> {
        let mut allocated = self.allocated.lock().await;

        let Some(claude) = self.claim_lowest(&mut allocated) else {
            return Err(self.exhausted(&allocated));
        };
        let Some(manual) = self.claim_lowest(&mut allocated) else {
            allocated.remove(&claude);
            return Err(self.exhausted(&allocated));
        };

        match PortPair::new(claude, manual, &self.range) {
            Ok(pair) => {
                debug!("Allocated port pair {}", pair);
                Ok(pair)
            }
            Err(e) => {
                allocated.remove(&claude);
                allocated.remove(&manual);
                Err(e)
            }
        }
    }

    /// Return both ports to the pool. Releasing free ports is a no-op.
    pub async fn release_pair(&self, pair: &PortPair) {
        let mut allocated = self.allocated.lock().await;
        for port in pair.ports() {
            allocated.remove(&port);
        }
        debug!("Released port pair {}", pair);
    }

    /// Mark an existing pair as allocated (startup reconciliation).
    ///
    /// Returns `false` without claiming anything when either port is outside
    /// the range or already taken.
    pub async fn reserve_pair(&self, pair: &PortPair) -> bool {
        let mut allocated = self.allocated.lock().await;
        let free = pair
            .ports()
            .iter()
            .all(|p| self.range.contains(*p) && !allocated.contains(p));
        if free {
            allocated.extend(pair.ports());
        }
        free
    }

    pub async fn available_count(&self) -> usize {
        let allocated = self.allocated.lock().await;
        self.range.len() - allocated.len()
    }

    pub async fn is_available(&self, port: u16) -> bool {
        self.range.contains(port) && !self.allocated.lock().await.contains(&port)
    }

    fn claim_lowest(&self, allocated: &mut BTreeSet<u16>) -> Option<u16> {
        let port = (self.range.start..=self.range.end).find(|p| !allocated.contains(p))?;
        allocated.insert(port);
        Some(port)
    }

    fn exhausted(&self, allocated: &BTreeSet<u16>) -> PortError {
        PortError::ResourceExhausted {
            available: self.range.len() - allocated.len(),
            range: self.range,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn allocator(start: u16, end: u16) -> PortAllocator {
        PortAllocator::new(PortRange::new(start, end).unwrap())
    }

    #[test]
    fn port_pair_rejects_equal_or_out_of_range_ports() {
        let range = PortRange::new(7681, 7684).unwrap();
        assert!(PortPair::new(7681, 7682, &range).is_ok());
        assert!(matches!(
            PortPair::new(7681, 7681, &range),
            Err(PortError::InvalidPair { .. })
        ));
        assert!(PortPair::new(7680, 7682, &range).is_err());
        assert!(PortPair::new(7681, 7685, &range).is_err());
    }

    #[test]
    fn port_range_validation() {
        assert!(PortRange::new(10, 9).is_err());
        assert!(PortRange::new(0, 9).is_err());
        let range = PortRange::new(7681, 7684).unwrap();
        assert_eq!(range.len(), 4);
        assert!(!range.is_empty());
        assert_eq!((range.start(), range.end()), (7681, 7684));
    }

    #[test]
    fn deserialized_port_range_is_validated() {
        let range: PortRange = serde_json::from_str(r#"{"start":7681,"end":7690}"#).unwrap();
        assert_eq!(range.len(), 10);

        let err = serde_json::from_str::<PortRange>(r#"{"start":10,"end":5}"#).unwrap_err();
        assert!(err.to_string().contains("invalid port range 10-5"), "{err}");
        assert!(serde_json::from_str::<PortRange>(r#"{"start":0,"end":5}"#).is_err());
    }

    #[tokio::test]
    async fn allocates_lowest_ports_first() {
        let alloc = allocator(7681, 7684);
        let a = alloc.allocate_pair().await.unwrap();
        let b = alloc.allocate_pair().await.unwrap();
        assert_eq!((a.claude_port(), a.manual_port()), (7681, 7682));
        assert_eq!((b.claude_port(), b.manual_port()), (7683, 7684));
        assert!(matches!(
            alloc.allocate_pair().await,
            Err(PortError::ResourceExhausted { available: 0, .. })
        ));

        alloc.release_pair(&a).await;
        let c = alloc.allocate_pair().await.unwrap();
        assert_eq!(c, a);
    }

    #[tokio::test]
    async fn failed_second_claim_restores_first_port() {
        let alloc = allocator(7681, 7683);
        alloc.allocate_pair().await.unwrap();
        assert_eq!(alloc.available_count().await, 1);

        let err = alloc.allocate_pair().await.unwrap_err();
        assert_eq!(
            err,
            PortError::ResourceExhausted {
                available: 1,
                range: PortRange::new(7681, 7683).unwrap()
            }
        );
        assert_eq!(alloc.available_count().await, 1);
        assert!(alloc.is_available(7683).await);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let alloc = allocator(7681, 7690);
        let pair = alloc.allocate_pair().await.unwrap();
        alloc.release_pair(&pair).await;
        alloc.release_pair(&pair).await;
        assert_eq!(alloc.available_count().await, 10);

        let foreign = PortPair::new(7689, 7690, &alloc.range()).unwrap();
        alloc.release_pair(&foreign).await;
        assert_eq!(alloc.available_count().await, 10);
    }

    #[tokio::test]
    async fn reserve_pair_marks_ports_taken() {
        let alloc = allocator(7681, 7690);
        let pair = PortPair::new(7681, 7682, &alloc.range()).unwrap();
        assert!(alloc.reserve_pair(&pair).await);
        assert!(!alloc.reserve_pair(&pair).await);
        assert!(!alloc.is_available(7681).await);

        let next = alloc.allocate_pair().await.unwrap();
        assert_eq!(next.ports(), [7683, 7684]);

        let outside = PortPair::from_stored(9000, 9001).unwrap();
        assert!(!alloc.reserve_pair(&outside).await);
    }

    #[tokio::test]
    async fn concurrent_allocations_never_share_ports() {
        let alloc = Arc::new(allocator(20000, 20099));
        let mut handles = Vec::new();
        for i in 0..80 {
            let alloc = alloc.clone();
            handles.push(tokio::spawn(async move {
                let pair = alloc.allocate_pair().await;
                if i % 3 == 0
                    && let Ok(ref pair) = pair
                {
                    alloc.release_pair(pair).await;
                    return None;
                }
                pair.ok()
            }));
        }

        let mut held = HashSet::new();
        let mut held_pairs = 0;
        for handle in handles {
            if let Some(pair) = handle.await.unwrap() {
                held_pairs += 1;
                for port in pair.ports() {
                    assert!(held.insert(port), "port {port} handed out twice");
                }
            }
        }

        assert_eq!(alloc.available_count().await, 100 - held_pairs * 2);
    }
}
