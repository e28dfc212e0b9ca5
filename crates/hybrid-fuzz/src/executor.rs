use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::Context;
use indexmap::IndexMap;
use tempfile::TempDir;
use tracing::{info, warn};

use crate::{
    afl::{AflConfig, ShowmapStatus},
    concolic::ConcolicDriver,
    config::{PutConfig, RAND_SOLVE_NUM},
    coverage::CoverageMap,
    depot::StateDepot,
    sampler::{CrackSampler, walk::WalkKind},
    seed::{self, SolvePriority},
    trace::CorpusTracer,
    utils,
};

/// Counters reported at shutdown. Ids within each class are unique and
/// strictly increasing.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncCounters {
    pub interesting: u64,
    pub hangs: u64,
    pub crashes: u64,
}

/// Output file name for a synchronized testcase.
fn output_name(idx: u64, src_id: i64, op: &str) -> String {
    format!("id:{idx:06},src:{src_id},op:{op}")
}

/// The round-based coordination loop: trace new fuzzer seeds, rank
/// uncovered edges, crack and solve the chosen (seed, edge) pairs and
/// feed everything interesting back to the fuzzer.
#[derive(Debug)]
pub struct HybridExecutor {
    afl: AflConfig,
    coverage: CoverageMap,
    depot: StateDepot,
    tracer: CorpusTracer,
    concolic: ConcolicDriver,
    sampler: CrackSampler,
    queue_dir: PathBuf,
    hangs_dir: PathBuf,
    crashes_dir: PathBuf,
    counters: SyncCounters,
    stop: Arc<AtomicBool>,
    /// Scratch space for cur_input, maps and sampler output; removed on
    /// drop.
    work_dir: TempDir,
}

impl HybridExecutor {
    pub fn new(
        put: &PutConfig,
        fuzz_out: &Path,
        concolic_out: &Path,
        walk: WalkKind,
        stop: Arc<AtomicBool>,
    ) -> anyhow::Result<Self> {
        let afl = AflConfig::new(fuzz_out)?;
        let coverage = CoverageMap::new(Some(afl.fuzz_bitmap.clone()))?;
        let work_dir = TempDir::new().context("Creating scratch directory")?;
        let concolic = ConcolicDriver::new(
            work_dir.path(),
            work_dir.path().join("concolic"),
            put.concolic_bin.clone(),
            put.argument.clone(),
        );
        let tracer = CorpusTracer::new(put.trace_bin.clone(), put.argument.clone());
        let sampler = CrackSampler::new(walk, work_dir.path().join("sample"));

        let queue_dir = concolic_out.join("queue");
        let hangs_dir = concolic_out.join("hangs");
        let crashes_dir = concolic_out.join("crashes");
        for dir in [&queue_dir, &hangs_dir, &crashes_dir] {
            utils::init_dir(dir)?;
        }

        Ok(Self {
            afl,
            coverage,
            depot: StateDepot::new(),
            tracer,
            concolic,
            sampler,
            queue_dir,
            hangs_dir,
            crashes_dir,
            counters: SyncCounters::default(),
            stop,
            work_dir,
        })
    }

    pub fn counters(&self) -> SyncCounters {
        self.counters
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Run rounds until the stop flag is raised.
    pub fn run(&mut self) -> anyhow::Result<()> {
        info!(scratch = %self.work_dir.path().display(), "hybrid executor started");
        while !self.stopped() {
            self.run_round()?;
        }
        Ok(())
    }

    fn run_round(&mut self) -> anyhow::Result<()> {
        let trace_list = self.seek_trace_seeds()?;
        self.tracer.trace_corpus(&mut self.depot.cov_state, &trace_list);
        info!(seeds = trace_list.len(), "finished tracing");

        if let Err(err) = self.depot.resolve_fuzz_hits(&self.afl.bb_bitmap) {
            warn!(%err, "could not refresh basic-block hit counters");
        }

        let candidate = self.depot.concolic_candidate();
        info!(size = candidate.len(), "candidate map built");
        if candidate.is_empty() {
            info!("no candidate, concolic execute random seed");
            return self.solve_random();
        }

        let mut label_cov: IndexMap<u64, usize> = IndexMap::new();
        for (seed_input, crack_addrs) in candidate {
            if self.stopped() {
                return Ok(());
            }
            let cov_count = self.crack_seed(&seed_input, &crack_addrs)?;
            for (addr, cov) in cov_count {
                *label_cov.entry(addr).or_insert(0) += cov;
            }
            self.solve_seed(&seed_input)?;
        }
        self.depot.update_model(&label_cov);
        Ok(())
    }

    /// Fuzzer queue entries that were never traced. Marks them traced.
    fn seek_trace_seeds(&mut self) -> anyhow::Result<Vec<PathBuf>> {
        let mut trace_list = Vec::new();
        for seed_path in self.afl.queue_seeds()? {
            let name = seed::seed_name(&seed_path);
            if self.depot.traced_seeds.contains(&name) {
                continue;
            }
            self.depot.traced_seeds.insert(name);
            trace_list.push(seed_path);
        }
        Ok(trace_list)
    }

    /// Classify one generated testcase via showmap and keep it when it
    /// expands coverage, hangs or crashes. Returns the coverage delta.
    fn sync_seed(&mut self, testcase: &Path, src_id: i64, op: &str) -> anyhow::Result<usize> {
        let (bitmap, status) = self.afl.exec_showmap(testcase)?;
        match status {
            ShowmapStatus::Normal => {
                let cov_increase = self.coverage.is_interesting(&bitmap);
                if cov_increase != 0 {
                    let name = output_name(self.counters.interesting, src_id, op);
                    fs::copy(testcase, self.queue_dir.join(&name))
                        .with_context(|| format!("Keeping testcase {name}"))?;
                    info!(seed = %name, "interesting seed");
                    self.counters.interesting += 1;
                }
                Ok(cov_increase)
            }
            ShowmapStatus::Hang => {
                let name = output_name(self.counters.hangs, src_id, op);
                fs::copy(testcase, self.hangs_dir.join(&name))
                    .with_context(|| format!("Keeping hang {name}"))?;
                self.counters.hangs += 1;
                Ok(0)
            }
            ShowmapStatus::Crash => {
                let name = output_name(self.counters.crashes, src_id, op);
                fs::copy(testcase, self.crashes_dir.join(&name))
                    .with_context(|| format!("Keeping crash {name}"))?;
                self.counters.crashes += 1;
                Ok(0)
            }
            ShowmapStatus::Ignored => Ok(0),
        }
    }

    /// Concolic-solve one seed, at most once per seed name.
    fn solve_seed(&mut self, seed_input: &Path) -> anyhow::Result<()> {
        let seed_name = seed::seed_name(seed_input);
        if self.depot.solved_seeds.contains(&seed_name) {
            return Ok(());
        }
        info!(input = %seed_name, "concolic execution");
        let (testcases, killed) = match self.concolic.solve(seed_input) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(%err, input = %seed_name, "concolic solve failed");
                (Vec::new(), false)
            }
        };
        if killed {
            info!(input = %seed_name, "concolic execution timed out");
        }
        // Pick up edges the fuzzer found in the meantime before judging.
        if let Err(err) = self.coverage.update() {
            warn!(%err, "could not refresh the fuzzer bitmap");
        }
        let before = self.counters.interesting;
        let src_id = seed::seed_id(&seed_name);
        for mutant in &testcases {
            self.sync_seed(mutant, src_id, "concolic")?;
        }
        info!(
            generated = testcases.len(),
            new = self.counters.interesting - before,
            "concolic testcases synchronized"
        );
        self.depot.solved_seeds.insert(seed_name);
        Ok(())
    }

    /// Crack one seed against the chosen addresses and sample mutants
    /// from every recovered constraint. Returns the per-address
    /// coverage gain.
    fn crack_seed(
        &mut self,
        seed_input: &Path,
        crack_addrs: &[u64],
    ) -> anyhow::Result<IndexMap<u64, usize>> {
        let seed_name = seed::seed_name(seed_input);
        let src_id = seed::seed_id(&seed_name);
        info!(input = %seed_name, addrs = ?crack_addrs, "cracking");
        let constraint_log = match self.concolic.crack(seed_input, crack_addrs) {
            Ok(log) => log,
            Err(err) => {
                warn!(%err, input = %seed_name, "concolic crack failed");
                return Ok(IndexMap::new());
            }
        };
        let constraint_dict = CrackSampler::parse_constraints(&constraint_log);
        if let Err(err) = self.coverage.update() {
            warn!(%err, "could not refresh the fuzzer bitmap");
        }

        let mut cov_count: IndexMap<u64, usize> = IndexMap::new();
        for (addr, constraints) in constraint_dict {
            for constraint in constraints {
                let mutants = self.sampler.crack_target(seed_input, &constraint);
                for mutant in mutants {
                    let cov_increase = self.sync_seed(&mutant, src_id, "crack")?;
                    *cov_count.entry(addr).or_insert(0) += cov_increase;
                }
            }
        }
        Ok(cov_count)
    }

    /// Fallback when no candidate exists: solve the most promising
    /// unsolved queue entries, or idle until the fuzzer makes progress.
    fn solve_random(&mut self) -> anyhow::Result<()> {
        let mut unsolved: Vec<PathBuf> = self
            .afl
            .queue_seeds()?
            .into_iter()
            .filter(|seed_path| {
                !self
                    .depot
                    .solved_seeds
                    .contains(&seed::seed_name(seed_path))
            })
            .collect();
        if unsolved.is_empty() {
            info!("waiting for new testcases...");
            // Sleep in slices so Ctrl-C stays responsive.
            for _ in 0..60 {
                if self.stopped() {
                    return Ok(());
                }
                thread::sleep(Duration::from_secs(1));
            }
            return Ok(());
        }
        unsolved.sort_by_cached_key(|seed_path| std::cmp::Reverse(SolvePriority::of(seed_path)));
        for seed_input in unsolved.iter().take(RAND_SOLVE_NUM) {
            if self.stopped() {
                break;
            }
            self.solve_seed(seed_input)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::output_name;

    #[test]
    fn output_names_are_zero_padded_and_tagged() {
        assert_eq!(output_name(0, 42, "concolic"), "id:000000,src:42,op:concolic");
        assert_eq!(output_name(123456, -1, "crack"), "id:123456,src:-1,op:crack");
    }
}
