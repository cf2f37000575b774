use std::collections::HashMap;

use crate::domain::Rank;

/// Reciprocal Rank Fusion constant. Standard value from the literature.
pub const RRF_K: usize = 60;

/// Above this many fused candidates, keep only the top half.
/// A tuning heuristic, not load-bearing.
pub const FUSION_CUTOFF_THRESHOLD: usize = 100;

/// Fuse two ranked chunk-id lists for one sub-query.
///
/// Each list contributes `1/(RRF_K + rank)` per id, rank 0-based; absence
/// from a list contributes nothing, so an id present in both lists always
/// outscores the same position in only one. The fused list is sorted by
/// descending score (ties broken by ascending id so results are stable),
/// then cut to the top half when more than `FUSION_CUTOFF_THRESHOLD`
/// candidates survive.
pub fn rr_fusion(semantic: &[u32], lexical: &[u32]) -> Vec<Rank> {
    let mut scores: HashMap<u32, f64> = HashMap::new();
    for ranking in [semantic, lexical] {
        for (rank, chunk_id) in ranking.iter().enumerate() {
            *scores.entry(*chunk_id).or_insert(0.0) += 1.0 / (RRF_K + rank) as f64;
        }
    }

    let mut fused: Vec<Rank> = scores
        .into_iter()
        .map(|(chunk_id, score)| Rank { chunk_id, score })
        .collect();
    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.chunk_id.cmp(&b.chunk_id))
    });

    if fused.len() > FUSION_CUTOFF_THRESHOLD {
        fused.truncate(fused.len() / 2);
    }
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_input_id_appears_when_under_cutoff() {
        let sem = vec![1, 2, 3];
        let lex = vec![3, 4];
        let fused = rr_fusion(&sem, &lex);
        let ids: Vec<u32> = fused.iter().map(|r| r.chunk_id).collect();
        for id in [1, 2, 3, 4] {
            assert!(ids.contains(&id), "missing {id}");
        }
        assert_eq!(fused.len(), 4);
    }

    #[test]
    fn id_in_both_lists_outscores_single_list() {
        // id 3 sits at rank 2 semantically and rank 0 lexically; id 1
        // holds the best single-list position.
        let fused = rr_fusion(&[1, 2, 3], &[3, 4]);
        assert_eq!(fused[0].chunk_id, 3);
        let both = fused.iter().find(|r| r.chunk_id == 3).unwrap().score;
        let single = fused.iter().find(|r| r.chunk_id == 1).unwrap().score;
        assert!(both > single);
    }

    #[test]
    fn scores_follow_rank_positions() {
        let fused = rr_fusion(&[7, 8], &[]);
        let first = fused.iter().find(|r| r.chunk_id == 7).unwrap().score;
        let second = fused.iter().find(|r| r.chunk_id == 8).unwrap().score;
        assert!((first - 1.0 / 60.0).abs() < 1e-12);
        assert!((second - 1.0 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn cutoff_keeps_top_half_over_threshold() {
        let sem: Vec<u32> = (0..80).collect();
        let lex: Vec<u32> = (100..160).collect();
        // 140 distinct candidates, over the threshold.
        let fused = rr_fusion(&sem, &lex);
        assert_eq!(fused.len(), 70);
    }

    #[test]
    fn no_cutoff_at_threshold_or_below() {
        let sem: Vec<u32> = (0..60).collect();
        let lex: Vec<u32> = (60..100).collect();
        let fused = rr_fusion(&sem, &lex);
        assert_eq!(fused.len(), 100);
    }

    #[test]
    fn empty_inputs_fuse_to_empty() {
        assert!(rr_fusion(&[], &[]).is_empty());
    }

    #[test]
    fn ties_break_by_ascending_id() {
        // Symmetric positions produce equal scores.
        let fused = rr_fusion(&[5], &[9]);
        assert_eq!(fused[0].chunk_id, 5);
        assert_eq!(fused[1].chunk_id, 9);
    }
}
