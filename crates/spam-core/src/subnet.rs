//! Free-space CIDR allocation inside the subnet pool.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Pool every generated subnet is carved from.
pub const POOL: Block = Block {
    start: 0xC000_0000,
    prefix: 8,
};

pub const MIN_PREFIX: u8 = 16;
pub const MAX_PREFIX: u8 = 29;

/// An aligned IPv4 range in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Block {
    start: u32,
    prefix: u8,
}

impl Block {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Option<Self> {
        if prefix > 32 {
            return None;
        }
        let mask = mask(prefix);
        Some(Self {
            start: u32::from(addr) & mask,
            prefix,
        })
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn first(&self) -> u32 {
        self.start
    }

    pub fn last(&self) -> u32 {
        self.start | !mask(self.prefix)
    }

    pub fn overlaps(&self, other: &Block) -> bool {
        self.first() <= other.last() && other.first() <= self.last()
    }
}

fn mask(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p => u32::MAX << (32 - u32::from(p)),
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.start), self.prefix)
    }
}

impl FromStr for Block {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s.split_once('/').ok_or_else(|| format!("not a CIDR: {s}"))?;
        let addr: Ipv4Addr = addr.parse().map_err(|e| format!("{s}: {e}"))?;
        let prefix: u8 = prefix.parse().map_err(|e| format!("{s}: {e}"))?;
        Block::new(addr, prefix).ok_or_else(|| format!("prefix out of range: {s}"))
    }
}

/// Lowest block of size `/prefix` inside [`POOL`] that overlaps none of
/// `taken`. `None` when the pool is exhausted or `prefix` is outside
/// [`MIN_PREFIX`]..=[`MAX_PREFIX`].
pub fn allocate(taken: &[Block], prefix: u8) -> Option<Block> {
    if !(MIN_PREFIX..=MAX_PREFIX).contains(&prefix) {
        return None;
    }
    let size = 1u64 << (32 - u32::from(prefix));
    let pool_end = u64::from(POOL.last());
    let mut taken: Vec<(u64, u64)> = taken
        .iter()
        .map(|b| (u64::from(b.first()), u64::from(b.last())))
        .collect();
    taken.sort_unstable();

    let mut candidate = u64::from(POOL.first());
    loop {
        candidate = candidate.div_ceil(size) * size;
        let end = candidate + size - 1;
        if end > pool_end {
            return None;
        }
        match taken.iter().find(|(s, e)| *s <= end && *e >= candidate) {
            Some((_, e)) => candidate = e + 1,
            None => {
                return Some(Block {
                    start: candidate as u32,
                    prefix,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocks(list: &[&str]) -> Vec<Block> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn empty_pool_starts_at_base() {
        assert_eq!(allocate(&[], 24).unwrap().to_string(), "192.0.0.0/24");
    }

    #[test]
    fn skips_taken_ranges_and_stays_aligned() {
        let taken = blocks(&["192.0.0.0/24", "192.0.1.0/28"]);
        let got = allocate(&taken, 24).unwrap();
        assert_eq!(got.to_string(), "192.0.2.0/24");
        assert!(taken.iter().all(|t| !t.overlaps(&got)));
    }

    #[test]
    fn fills_gap_between_ranges() {
        let taken = blocks(&["192.0.0.0/29", "192.0.0.16/28"]);
        assert_eq!(allocate(&taken, 29).unwrap().to_string(), "192.0.0.8/29");
    }

    #[test]
    fn ranges_outside_pool_are_ignored() {
        let taken = blocks(&["10.0.0.0/8"]);
        assert_eq!(allocate(&taken, 16).unwrap().to_string(), "192.0.0.0/16");
    }

    #[test]
    fn exhausted_pool_returns_none() {
        assert_eq!(allocate(&[POOL], 24), None);
        assert_eq!(allocate(&[], 8), None);
    }

    #[test]
    fn parse_normalizes_host_bits() {
        let b: Block = "192.0.3.77/24".parse().unwrap();
        assert_eq!(b.to_string(), "192.0.3.0/24");
        assert!("192.0.3.0".parse::<Block>().is_err());
    }
}
