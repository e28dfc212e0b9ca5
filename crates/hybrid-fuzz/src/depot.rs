use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use indexmap::IndexMap;
use rand::seq::SliceRandom;

use crate::{
    condition::{CondNode, CondTable, EDGE_FEATURE_DIM},
    config::{
        BYTE_ORDER, ByteOrder, CANDIDATE_NUM, CRACK_SEED_MAX, CRACK_UPPER_LIMIT, MAP_SIZE,
    },
    regressor::SgdRegressor,
    seed,
};

/// Learning and bookkeeping state accumulated across rounds.
///
/// Seeds are traced at most once and solved at most once; every
/// `(edge, seed)` pair is cracked at most once and every edge at most
/// `CRACK_UPPER_LIMIT` times overall.
#[derive(Debug)]
pub struct StateDepot {
    pub cov_state: CondTable,
    regressor: SgdRegressor,
    bb_hit: Vec<u32>,
    init_phase: bool,
    pub traced_seeds: HashSet<String>,
    pub solved_seeds: HashSet<String>,
    cracked_seed: HashSet<(u64, String)>,
    cracked_addr: HashMap<u64, usize>,
}

impl Default for StateDepot {
    fn default() -> Self {
        Self::new()
    }
}

impl StateDepot {
    pub fn new() -> Self {
        Self {
            cov_state: CondTable::new(),
            regressor: SgdRegressor::new(),
            bb_hit: vec![0; MAP_SIZE],
            init_phase: true,
            traced_seeds: HashSet::new(),
            solved_seeds: HashSet::new(),
            cracked_seed: HashSet::new(),
            cracked_addr: HashMap::new(),
        }
    }

    /// Reload the per-block hit counters from the fuzzer's `bb_bitmap`.
    pub fn resolve_fuzz_hits(&mut self, bb_bitmap: &Path) -> anyhow::Result<()> {
        let raw = fs::read(bb_bitmap)
            .with_context(|| format!("Reading {}", bb_bitmap.display()))?;
        self.bb_hit = parse_hit_counters(&raw);
        Ok(())
    }

    fn bb_hit_of(&self, addr: u64) -> f64 {
        self.bb_hit.get(addr as usize).copied().unwrap_or(0) as f64
    }

    fn feature_of(&self, node: &CondNode) -> [f64; EDGE_FEATURE_DIM] {
        node.feature(self.bb_hit_of(node.addr))
    }

    /// Before the first model update every uncovered edge is a
    /// candidate, in random order.
    fn init_edges<R: rand::Rng>(&self, rng: &mut R) -> Vec<u64> {
        let mut candidates: Vec<u64> = self
            .cov_state
            .iter()
            .filter(|(_, node)| !node.is_covered())
            .map(|(&addr, _)| addr)
            .collect();
        candidates.shuffle(rng);
        candidates
    }

    /// Rank uncovered edges by predicted fitness, best first. Edges that
    /// spent their crack budget are skipped; ties keep insertion order.
    fn edge_predict(&self) -> Vec<u64> {
        let mut scored: Vec<(u64, f64)> = self
            .cov_state
            .iter()
            .filter(|(addr, node)| {
                !node.is_covered()
                    && self.cracked_addr.get(addr).copied().unwrap_or(0) < CRACK_UPPER_LIMIT
            })
            .map(|(&addr, node)| (addr, self.regressor.predict(&self.feature_of(node))))
            .collect();
        scored.sort_by(|lhs, rhs| {
            rhs.1
                .partial_cmp(&lhs.1)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.into_iter().map(|(addr, _)| addr).collect()
    }

    /// Pick up to `CRACK_SEED_MAX` seeds exercising `addr`, preferring
    /// ones that were never concolic-solved.
    fn select_seeds<R: rand::Rng>(&self, addr: u64, rng: &mut R) -> Vec<PathBuf> {
        let Some(node) = self.cov_state.get(&addr) else {
            return Vec::new();
        };
        let mut solved = Vec::new();
        let mut unsolved = Vec::new();
        for seed_path in &node.belongs {
            let name = seed::seed_name(seed_path);
            if self.cracked_seed.contains(&(addr, name.clone())) {
                continue;
            }
            if self.solved_seeds.contains(&name) {
                solved.push(seed_path.clone());
            } else {
                unsolved.push(seed_path.clone());
            }
        }
        if unsolved.len() >= CRACK_SEED_MAX {
            return unsolved
                .choose_multiple(rng, CRACK_SEED_MAX)
                .cloned()
                .collect();
        }
        let extra = (CRACK_SEED_MAX - unsolved.len()).min(solved.len());
        unsolved.extend(solved.choose_multiple(rng, extra).cloned());
        unsolved
    }

    /// Join the edge ranking with per-edge seed selection, spending the
    /// crack budgets. At most `CANDIDATE_NUM` edges contribute.
    pub fn concolic_candidate(&mut self) -> IndexMap<PathBuf, Vec<u64>> {
        let mut rng = rand::thread_rng();
        let addr_candidate = if self.init_phase {
            self.init_edges(&mut rng)
        } else {
            self.edge_predict()
        };

        let mut candidate: IndexMap<PathBuf, Vec<u64>> = IndexMap::new();
        let mut edge_cnt = 0;
        for addr in addr_candidate {
            for seed_path in self.select_seeds(addr, &mut rng) {
                let name = seed::seed_name(&seed_path);
                candidate.entry(seed_path).or_default().push(addr);
                self.cracked_seed.insert((addr, name));
                *self.cracked_addr.entry(addr).or_insert(0) += 1;
            }
            edge_cnt += 1;
            if edge_cnt >= CANDIDATE_NUM {
                break;
            }
        }
        candidate
    }

    /// One gradient step from the per-edge coverage gains observed this
    /// round. The first non-empty update ends the init phase.
    pub fn update_model(&mut self, label_cov: &IndexMap<u64, usize>) {
        if label_cov.is_empty() {
            return;
        }
        self.init_phase = false;
        let batch: Vec<([f64; EDGE_FEATURE_DIM], f64)> = label_cov
            .iter()
            .filter_map(|(addr, cov)| {
                self.cov_state
                    .get(addr)
                    .map(|node| (self.feature_of(node), *cov as f64))
            })
            .collect();
        self.regressor.partial_fit(&batch);
    }
}

/// Group the raw counter file into 4-byte integers and compress each
/// nonzero count to `floor(log2(count))`.
fn parse_hit_counters(raw: &[u8]) -> Vec<u32> {
    raw.chunks(4)
        .map(|chunk| {
            let mut buf = [0u8; 4];
            buf[..chunk.len()].copy_from_slice(chunk);
            let hits = match BYTE_ORDER {
                ByteOrder::Little => u32::from_le_bytes(buf),
                ByteOrder::Big => u32::from_be_bytes(buf),
            };
            if hits > 0 { 31 - hits.leading_zeros() } else { 0 }
        })
        .collect()
}
