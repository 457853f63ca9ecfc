//! Spreads replicas across physical devices: at each step, prefer the
//! candidate whose base device has the fewest replicas chosen so far.
//! Spec §4.3.

use super::rank_select;
use crate::annotated_id::AnnotatedId;

pub fn select(available: &[AnnotatedId], required: &[AnnotatedId], size: usize) -> Vec<AnnotatedId> {
    rank_select(available, required, size, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replicas(base: &str, count: u32) -> Vec<AnnotatedId> {
        (0..count).map(|k| AnnotatedId::replica(base, k)).collect()
    }

    #[test]
    fn spreads_two_picks_across_two_devices() {
        let mut available = replicas("GPU-A", 4);
        available.extend(replicas("GPU-B", 4));
        let result = select(&available, &[], 2);
        let bases: std::collections::HashSet<&str> = result.iter().map(|id| id.base()).collect();
        assert_eq!(bases.len(), 2);
    }

    #[test]
    fn spreads_four_picks_evenly_across_two_devices() {
        let mut available = replicas("GPU-A", 4);
        available.extend(replicas("GPU-B", 4));
        let result = select(&available, &[], 4);
        let mut counts = std::collections::HashMap::new();
        for id in &result {
            *counts.entry(id.base().to_string()).or_insert(0) += 1;
        }
        let max = *counts.values().max().unwrap();
        let min = *counts.values().min().unwrap();
        assert!(max - min <= 1);
        assert_eq!(result.len(), 4);
    }

    #[test]
    fn max_minus_min_count_per_device_never_exceeds_one() {
        let mut available = replicas("GPU-A", 6);
        available.extend(replicas("GPU-B", 6));
        available.extend(replicas("GPU-C", 6));
        for size in 1..=9 {
            let result = select(&available, &[], size);
            let mut counts = std::collections::HashMap::new();
            for id in &result {
                *counts.entry(id.base().to_string()).or_insert(0) += 1;
            }
            if counts.len() > 1 {
                let max = *counts.values().max().unwrap();
                let min = *counts.values().min().unwrap();
                assert!(max - min <= 1, "size={} counts={:?}", size, counts);
            }
        }
    }
}
