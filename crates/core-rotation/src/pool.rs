//! Hot-reloadable pool of verified upstream addresses.

use rand::{rngs::OsRng, RngCore};
use std::net::{IpAddr, Ipv6Addr};
use std::ops::Deref;
use std::sync::{Arc, PoisonError, RwLock};

/// Ordered list of validated upstream IPv6 addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationSet {
    addrs: Vec<Ipv6Addr>,
}

impl DestinationSet {
    pub fn new(addrs: Vec<Ipv6Addr>) -> Self {
        Self { addrs }
    }

    /// Parse the plain-text list format: one IPv6 literal per line, blank lines
    /// and `#` comments ignored. Lines that are not acceptable IPv6 literals are
    /// dropped; source order is preserved.
    pub fn parse_list(text: &str) -> Self {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(parse_destination)
            .collect()
    }

    pub fn addresses(&self) -> &[Ipv6Addr] {
        &self.addrs
    }
}

impl Deref for DestinationSet {
    type Target = [Ipv6Addr];

    fn deref(&self) -> &Self::Target {
        &self.addrs
    }
}

impl FromIterator<Ipv6Addr> for DestinationSet {
    fn from_iter<I: IntoIterator<Item = Ipv6Addr>>(iter: I) -> Self {
        Self {
            addrs: iter.into_iter().collect(),
        }
    }
}

/// A single line of the destination list, as an IPv6 literal.
///
/// IPv4 literals and IPv4-mapped addresses (`::ffff:a.b.c.d`) are refused since
/// the dialer only ever connects over IPv6.
pub fn parse_destination(line: &str) -> Option<Ipv6Addr> {
    match line.parse::<IpAddr>().ok()? {
        IpAddr::V6(v6) if v6.to_ipv4_mapped().is_none() => Some(v6),
        _ => None,
    }
}

/// Read side of the pool as seen by the dialer.
pub trait DestinationPicker: Send + Sync {
    fn pick(&self) -> Option<Ipv6Addr>;
}

/// The current [`DestinationSet`] behind a reader/writer lock.
///
/// Readers clone the `Arc` and drop the lock before sampling, and the writer
/// only holds it for the pointer swap, so a reader sees either the old set or
/// the new one in full.
#[derive(Debug, Default)]
pub struct DestinationPool {
    current: RwLock<Arc<DestinationSet>>,
}

impl DestinationPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_set(set: DestinationSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(set)),
        }
    }

    pub fn snapshot(&self) -> Arc<DestinationSet> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Uniform random member of the current set, `None` while the set is empty.
    pub fn pick(&self) -> Option<Ipv6Addr> {
        let set = self.snapshot();
        if set.is_empty() {
            return None;
        }
        let idx = secure_index(set.len()).unwrap_or(0);
        set.get(idx).copied()
    }

    /// Swap in a freshly validated set. Empty sets are ignored; returns whether
    /// the swap happened.
    pub fn replace(&self, set: DestinationSet) -> bool {
        if set.is_empty() {
            return false;
        }
        let next = Arc::new(set);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next;
        true
    }
}

impl DestinationPicker for DestinationPool {
    fn pick(&self) -> Option<Ipv6Addr> {
        DestinationPool::pick(self)
    }
}

/// Unbiased index in `0..len` from the OS random source.
///
/// Draws that fall in the incomplete tail of the `u64` range are rejected and
/// redrawn. `None` if `len` is zero or the random source fails.
pub(crate) fn secure_index(len: usize) -> Option<usize> {
    let n = len as u64;
    if n == 0 {
        return None;
    }
    // 2^64 mod n; draws above u64::MAX - tail would favor low indices.
    let tail = (u64::MAX % n + 1) % n;
    let limit = u64::MAX - tail;
    let mut buf = [0u8; 8];
    loop {
        OsRng.try_fill_bytes(&mut buf).ok()?;
        let r = u64::from_le_bytes(buf);
        if r <= limit {
            return Some((r % n) as usize);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn set(addrs: &[&str]) -> DestinationSet {
        addrs.iter().map(|a| a.parse().unwrap()).collect()
    }

    #[test]
    fn parse_list_skips_comments_blanks_and_non_ipv6() {
        let text = "\
# upstream endpoints
2001:4860:4860::1

  2001:4860:4860::2
8.8.8.8
::ffff:8.8.4.4
not-an-ip
#2001:db8::dead
2001:db8::1%eth0
2404:6800:4003:c00::5f
";
        let parsed = DestinationSet::parse_list(text);
        assert_eq!(
            parsed,
            set(&["2001:4860:4860::1", "2001:4860:4860::2", "2404:6800:4003:c00::5f"])
        );
    }

    #[test]
    fn empty_pool_picks_nothing() {
        let pool = DestinationPool::new();
        assert!(pool.is_empty());
        assert_eq!(pool.pick(), None);
    }

    #[test]
    fn replace_with_empty_is_noop() {
        let original = set(&["2001:db8::1", "2001:db8::2"]);
        let pool = DestinationPool::with_set(original.clone());
        assert!(!pool.replace(DestinationSet::default()));
        assert_eq!(*pool.snapshot(), original);
        for _ in 0..100 {
            assert!(original.contains(&pool.pick().unwrap()));
        }
    }

    #[test]
    fn replace_swaps_whole_set() {
        let pool = DestinationPool::with_set(set(&["2001:db8::1"]));
        assert!(pool.replace(set(&["2001:db8::a", "2001:db8::b"])));
        assert_eq!(pool.len(), 2);
        let picked = pool.pick().unwrap();
        assert!(picked == "2001:db8::a".parse::<Ipv6Addr>().unwrap()
            || picked == "2001:db8::b".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn two_member_split_is_even() {
        let members = set(&["2001:4860:4860::1", "2001:4860:4860::2"]);
        let pool = DestinationPool::with_set(members.clone());
        let mut first = 0;
        for _ in 0..1000 {
            let picked = pool.pick().unwrap();
            assert!(members.contains(&picked));
            if picked == members[0] {
                first += 1;
            }
        }
        assert!((450..=550).contains(&first), "first member picked {first}/1000");
    }

    #[test]
    fn picks_are_uniform_over_awkward_sizes() {
        // 7 does not divide 2^64, so this exercises the rejection path's bias fix.
        let members: DestinationSet = (1..=7u16)
            .map(|i| Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, i))
            .collect();
        let pool = DestinationPool::with_set(members.clone());
        let mut counts = [0u32; 7];
        let draws = 7000;
        for _ in 0..draws {
            let picked = pool.pick().unwrap();
            let idx = members.iter().position(|m| *m == picked).unwrap();
            counts[idx] += 1;
        }
        for count in counts {
            assert!((800..=1200).contains(&count), "counts {counts:?}");
        }
    }

    #[test]
    fn secure_index_bounds() {
        assert_eq!(secure_index(0), None);
        assert_eq!(secure_index(1), Some(0));
        for _ in 0..1000 {
            assert!(secure_index(3).unwrap() < 3);
        }
    }

    #[test]
    fn concurrent_readers_never_see_mixed_sets() {
        let old: DestinationSet = (0..64u16)
            .map(|i| Ipv6Addr::new(0x2001, 0xdb8, 0xa, 0, 0, 0, 0, i))
            .collect();
        let new: DestinationSet = (0..48u16)
            .map(|i| Ipv6Addr::new(0x2001, 0xdb8, 0xb, 0, 0, 0, 0, i))
            .collect();
        let pool = Arc::new(DestinationPool::with_set(old.clone()));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..20_000 {
                        let snap = pool.snapshot();
                        let tag = snap[0].segments()[2];
                        assert!(snap.iter().all(|a| a.segments()[2] == tag));
                        assert!(snap.len() == 64 || snap.len() == 48);
                        let picked = pool.pick().unwrap();
                        assert!(matches!(picked.segments()[2], 0xa | 0xb));
                    }
                })
            })
            .collect();

        for i in 0..200 {
            let next = if i % 2 == 0 { new.clone() } else { old.clone() };
            assert!(pool.replace(next));
        }

        for r in readers {
            r.join().unwrap();
        }
    }
}
