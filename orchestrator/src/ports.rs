//! Worker port allocation.

use std::collections::HashSet;

use crate::error::{Error, Result};

/// Pick the lowest port in `base..=max` that is not in `used`.
///
/// `used` is the union of the ports of local handles and of every record
/// visible in the registry. The scan is deterministic: identical inputs give
/// identical results.
pub fn allocate(used: &HashSet<u16>, base: u16, max: u16) -> Result<u16> {
    (base..=max)
        .find(|port| !used.contains(port))
        .ok_or(Error::PortExhausted { base, max })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_allocate_starts_at_base() {
        assert_eq!(allocate(&HashSet::new(), 4000, 4999).unwrap(), 4000);
    }

    #[test]
    fn test_allocate_skips_used_ports() {
        let used: HashSet<u16> = [4000, 4001, 4003].into_iter().collect();
        assert_eq!(allocate(&used, 4000, 4999).unwrap(), 4002);
    }

    #[test]
    fn test_allocate_ignores_ports_below_base() {
        let used: HashSet<u16> = [3998, 3999].into_iter().collect();
        assert_eq!(allocate(&used, 4000, 4999).unwrap(), 4000);
    }

    #[test]
    fn test_allocate_exhausted() {
        let used: HashSet<u16> = (4000..=4002).collect();
        match allocate(&used, 4000, 4002) {
            Err(Error::PortExhausted { base, max }) => {
                assert_eq!(base, 4000);
                assert_eq!(max, 4002);
            }
            other => panic!("Expected PortExhausted, got {:?}", other),
        }
    }

    #[test]
    fn test_allocate_top_of_range() {
        let used: HashSet<u16> = (65000..u16::MAX).collect();
        assert_eq!(allocate(&used, 65000, u16::MAX).unwrap(), u16::MAX);
    }

    #[test]
    fn test_allocate_never_returns_used_port() {
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let base = rng.gen_range(1024..60000u16);
            let max = base + rng.gen_range(0..64u16);
            let used: HashSet<u16> = (0..rng.gen_range(0..80))
                .map(|_| rng.gen_range(base.saturating_sub(8)..=max))
                .collect();

            match allocate(&used, base, max) {
                Ok(port) => {
                    assert!(!used.contains(&port));
                    assert!((base..=max).contains(&port));
                    assert!((base..port).all(|p| used.contains(&p)));
                }
                Err(Error::PortExhausted { .. }) => {
                    assert!((base..=max).all(|p| used.contains(&p)));
                }
                Err(e) => panic!("unexpected error {:?}", e),
            }
        }
    }

    #[test]
    fn test_allocate_is_deterministic() {
        let used: HashSet<u16> = [4000, 4002, 4004].into_iter().collect();
        let first = allocate(&used, 4000, 4010).unwrap();
        for _ in 0..10 {
            assert_eq!(allocate(&used, 4000, 4010).unwrap(), first);
        }
    }
}
