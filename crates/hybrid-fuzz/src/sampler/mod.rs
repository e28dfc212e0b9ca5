pub mod polytope;
pub mod walk;

use std::{
    fs,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use anyhow::Context;
use indexmap::IndexMap;
use regex::Regex;
use tracing::{debug, warn};
use z3::{
    Config, Context as Z3Context, Optimize, SatResult, Solver,
    ast::{BV, Bool},
};

use crate::{
    config::{BIT_VER_WIDTH, DEFAULT_SAMPLER_NUM, SOLVER_TIMEOUT},
    sampler::{polytope::Polytope, walk::WalkKind},
    utils,
};

static CRACK_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[STAT\] CRACK:(?P<src>\d+),(?P<dest>\d+)$").unwrap());
static SEXPR_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*\(.*$").unwrap());
static OFFSET_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^k!(?P<idx>\d+)0$").unwrap());

const CRACK_END: &str = "CRACK-END";

/// Turns crack-mode constraint logs into concrete mutated inputs.
///
/// Each constraint is solved once for a model, then abstracted into a
/// box polytope from the per-variable optima and sampled with the
/// configured random walk for more diverse solutions.
#[derive(Debug)]
pub struct CrackSampler {
    kind: WalkKind,
    sample_dir: PathBuf,
    sample_id: u64,
}

impl CrackSampler {
    pub fn new(kind: WalkKind, sample_dir: PathBuf) -> Self {
        z3::set_global_param("timeout", &SOLVER_TIMEOUT.to_string());
        z3::set_global_param("opt.priority", "box");
        Self {
            kind,
            sample_dir,
            sample_id: 0,
        }
    }

    /// Group the S-expression payloads of a crack log by source block.
    ///
    /// The scanner has three states: outside a record, looking for a
    /// `[STAT] CRACK:src,dest` header; recording, collecting every line
    /// that opens with `(`; and flushing on `CRACK-END`. Undecodable
    /// bytes are skipped.
    pub fn parse_constraints(log: &[u8]) -> IndexMap<u64, Vec<String>> {
        let mut constraints: IndexMap<u64, Vec<String>> = IndexMap::new();
        let mut src_bb = 0u64;
        let mut recording = false;
        let mut expressions: Vec<String> = Vec::new();
        for raw in log.split(|&byte| byte == b'\n') {
            let Ok(line) = std::str::from_utf8(raw) else {
                continue;
            };
            let line = line.strip_suffix('\r').unwrap_or(line);
            if let Some(caps) = CRACK_START.captures(line) {
                let Ok(src) = caps["src"].parse() else {
                    continue;
                };
                src_bb = src;
                recording = true;
                expressions.clear();
                continue;
            }
            if recording && SEXPR_LINE.is_match(line) {
                expressions.push(line.to_owned());
                continue;
            }
            if recording && line == CRACK_END {
                constraints
                    .entry(src_bb)
                    .or_default()
                    .push(expressions.join("\n"));
                expressions.clear();
                recording = false;
            }
        }
        constraints
    }

    /// Produce mutants of `seed` satisfying (or near) one constraint.
    /// Failures inside the solver pipeline are contained: whatever was
    /// materialized before the failure is still returned.
    pub fn crack_target(&mut self, seed: &Path, constraint: &str) -> Vec<PathBuf> {
        if let Err(err) = utils::init_dir(&self.sample_dir) {
            warn!(%err, "could not reset the sample directory");
            return Vec::new();
        }
        // The solver bindings abort by panicking on malformed constraint
        // text; that must not take the whole loop down.
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.sample_constraint(seed, constraint)
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(%err, "constraint sampling stopped early"),
            Err(_) => warn!("solver rejected the constraint text"),
        }
        let mut mutants: Vec<PathBuf> = match fs::read_dir(&self.sample_dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .collect(),
            Err(_) => Vec::new(),
        };
        mutants.sort();
        mutants
    }

    fn sample_constraint(&mut self, seed: &Path, constraint: &str) -> anyhow::Result<()> {
        let cfg = Config::new();
        let ctx = Z3Context::new(&cfg);
        let solver = Solver::new(&ctx);
        solver.from_string(constraint);
        anyhow::ensure!(
            solver.check() == SatResult::Sat,
            "path constraint is not satisfiable"
        );
        let model = solver.get_model().context("Solver produced no model")?;

        let mut offsets = Vec::new();
        let mut values = Vec::new();
        for decl in model.iter() {
            let constant = decl.apply(&[]);
            let value = model
                .eval(&constant, true)
                .and_then(|value| value.as_bv())
                .and_then(|bv| bv.as_u64())
                .context("Model value is not a bitvector constant")?;
            offsets.push(decl.name());
            values.push(value as i64);
        }
        if offsets.is_empty() {
            return Ok(());
        }
        self.save_mutant(seed, &offsets, &values)?;

        // Polyhedral abstraction: independent per-variable bounds.
        let assertions = solver.get_assertions();
        let mut bounds = Vec::with_capacity(offsets.len());
        for name in &offsets {
            let upper = optimize_bound(&ctx, &assertions, name, true)?;
            let lower = optimize_bound(&ctx, &assertions, name, false)?;
            bounds.push((lower as f64, upper as f64));
        }
        let polytope = Polytope::from_box_bounds(&bounds);
        let mut rng = rand::thread_rng();
        let samples =
            walk::sample_polytope(self.kind, &polytope, DEFAULT_SAMPLER_NUM, &mut rng)?;
        for point in &samples {
            let values: Vec<i64> = point.iter().map(|value| *value as i64).collect();
            self.save_mutant(seed, &offsets, &values)?;
        }
        Ok(())
    }

    /// Copy the seed and overwrite one byte per `k!<offset>0` variable.
    fn save_mutant(&mut self, seed: &Path, offsets: &[String], values: &[i64]) -> anyhow::Result<()> {
        let mut data =
            fs::read(seed).with_context(|| format!("Reading seed {}", seed.display()))?;
        for (name, &value) in offsets.iter().zip(values) {
            let Some(caps) = OFFSET_NAME.captures(name) else {
                continue;
            };
            let offset: usize = caps["idx"].parse()?;
            let byte = u8::try_from(value)
                .with_context(|| format!("Value {value} for {name} is not a byte"))?;
            let slot = data
                .get_mut(offset)
                .with_context(|| format!("Offset {offset} is beyond the seed size"))?;
            *slot = byte;
        }
        let mutant = self.sample_dir.join(format!("id:{}", self.sample_id));
        self.sample_id += 1;
        fs::write(&mutant, data)
            .with_context(|| format!("Writing mutant {}", mutant.display()))?;
        Ok(())
    }
}

/// Optimize a single `BIT_VER_WIDTH`-wide variable under the given
/// assertions and read the optimum back from the model.
fn optimize_bound<'ctx>(
    ctx: &'ctx Z3Context,
    assertions: &[Bool<'ctx>],
    name: &str,
    maximize: bool,
) -> anyhow::Result<u64> {
    let optimize = Optimize::new(ctx);
    for assertion in assertions {
        optimize.assert(assertion);
    }
    let variable = BV::new_const(ctx, name, BIT_VER_WIDTH);
    if maximize {
        optimize.maximize(&variable);
    } else {
        optimize.minimize(&variable);
    }
    anyhow::ensure!(
        optimize.check(&[]) == SatResult::Sat,
        "Optimizer found no solution for {name}"
    );
    let model = optimize.get_model().context("Optimizer produced no model")?;
    model
        .eval(&variable, true)
        .and_then(|value| value.as_u64())
        .with_context(|| format!("No optimum value for {name}"))
}

#[cfg(test)]
mod tests {
    use super::{CrackSampler, OFFSET_NAME};
    use crate::sampler::walk::WalkKind;

    #[test]
    fn crack_records_are_grouped_by_source_block() {
        let log = b"[STAT] CRACK:7,8\n  (assert (= k!00 #x41))\n  (check-sat)\nCRACK-END\n";
        let constraints = CrackSampler::parse_constraints(log);
        assert_eq!(constraints.len(), 1);
        assert_eq!(
            constraints[&7],
            vec!["  (assert (= k!00 #x41))\n  (check-sat)".to_owned()]
        );
    }

    #[test]
    fn multiple_records_for_one_block_accumulate() {
        let log = b"[STAT] CRACK:3,4\n(assert a)\nCRACK-END\n[STAT] CRACK:3,9\n(assert b)\nCRACK-END\n";
        let constraints = CrackSampler::parse_constraints(log);
        assert_eq!(constraints[&3].len(), 2);
    }

    #[test]
    fn lines_outside_records_are_ignored() {
        let log = b"(assert stray)\nnoise\n[STAT] CRACK:1,2\nprose is skipped\n(assert kept)\nCRACK-END\n";
        let constraints = CrackSampler::parse_constraints(log);
        assert_eq!(constraints[&1], vec!["(assert kept)".to_owned()]);
    }

    #[test]
    fn unterminated_record_is_dropped() {
        let log = b"[STAT] CRACK:5,6\n(assert lost)\n";
        assert!(CrackSampler::parse_constraints(log).is_empty());
    }

    #[test]
    fn invalid_utf8_lines_are_skipped() {
        let log = b"[STAT] CRACK:2,3\n\xff\xfe(garbage)\n(assert ok)\nCRACK-END\n";
        let constraints = CrackSampler::parse_constraints(log);
        assert_eq!(constraints[&2], vec!["(assert ok)".to_owned()]);
    }

    #[test]
    fn offset_names_encode_byte_positions() {
        let caps = OFFSET_NAME.captures("k!120").unwrap();
        assert_eq!(&caps["idx"], "12");
        assert_eq!(&OFFSET_NAME.captures("k!00").unwrap()["idx"], "0");
        assert!(OFFSET_NAME.captures("k!12").is_none());
        assert!(OFFSET_NAME.captures("x!120").is_none());
    }

    #[test]
    fn mutants_overwrite_the_encoded_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let seed = dir.path().join("id:000001,orig:a");
        std::fs::write(&seed, b"abcdef").unwrap();
        let mut sampler = CrackSampler::new(WalkKind::HitAndRun, dir.path().join("sample"));
        crate::utils::init_dir(&dir.path().join("sample")).unwrap();

        sampler
            .save_mutant(
                &seed,
                &["k!00".to_owned(), "k!30".to_owned(), "other".to_owned()],
                &[0x41, 0x42, 0x43],
            )
            .unwrap();
        let mutant = std::fs::read(dir.path().join("sample").join("id:0")).unwrap();
        // Offsets 0 and 3 were rewritten, the unrecognized name skipped.
        assert_eq!(mutant, b"AbcBef");
    }

    #[test]
    fn out_of_range_offsets_abort_the_mutant() {
        let dir = tempfile::tempdir().unwrap();
        let seed = dir.path().join("id:000002,orig:b");
        std::fs::write(&seed, b"ab").unwrap();
        let mut sampler = CrackSampler::new(WalkKind::HitAndRun, dir.path().join("sample"));
        crate::utils::init_dir(&dir.path().join("sample")).unwrap();

        let result = sampler.save_mutant(&seed, &["k!90".to_owned()], &[1]);
        assert!(result.is_err());
    }
}
