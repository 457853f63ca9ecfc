//! Consolidates replicas onto the fewest physical devices: at each step,
//! prefer the candidate whose base device has the most replicas chosen so
//! far. Spec §4.3.

use super::rank_select;
use crate::annotated_id::AnnotatedId;

pub fn select(available: &[AnnotatedId], required: &[AnnotatedId], size: usize) -> Vec<AnnotatedId> {
    rank_select(available, required, size, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replicas(base: &str, count: u32) -> Vec<AnnotatedId> {
        (0..count).map(|k| AnnotatedId::replica(base, k)).collect()
    }

    #[test]
    fn packs_four_picks_onto_one_device_when_capacity_allows() {
        let mut available = replicas("GPU-A", 4);
        available.extend(replicas("GPU-B", 4));
        let result = select(&available, &[], 4);
        let bases: std::collections::HashSet<&str> = result.iter().map(|id| id.base()).collect();
        assert_eq!(bases.len(), 1);
    }

    #[test]
    fn spills_onto_second_device_when_first_is_exhausted() {
        let mut available = replicas("GPU-A", 2);
        available.extend(replicas("GPU-B", 2));
        let result = select(&available, &[], 3);
        let mut counts = std::collections::HashMap::new();
        for id in &result {
            *counts.entry(id.base().to_string()).or_insert(0) += 1;
        }
        assert_eq!(counts.get("GPU-A"), Some(&2));
        assert_eq!(counts.get("GPU-B"), Some(&1));
    }

    #[test]
    fn ties_break_lexicographically() {
        let available = vec![
            AnnotatedId::replica("GPU-B", 0),
            AnnotatedId::replica("GPU-A", 0),
        ];
        let result = select(&available, &[], 1);
        assert_eq!(result[0].base(), "GPU-A");
    }
}
