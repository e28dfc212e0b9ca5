use std::path::{Path, PathBuf};

use anyhow::Context;
use ini::Ini;

/// Size of the AFL edge-coverage bitmap in bytes.
pub const MAP_SIZE: usize = 65536;

/// Execution timeout handed to `afl-showmap -t`, in milliseconds.
pub const SHOWMAP_TIMEOUT: u64 = 1000;

/// Wall-clock budget for one concolic child, in seconds. Enforced by
/// wrapping the child in `timeout -k 5`.
pub const CONCOLIC_TIMEOUT: u64 = 90;

/// Timeout for the SMT solver and optimizer, in milliseconds.
pub const SOLVER_TIMEOUT: u32 = 5000;

/// Bit width of the byte-level variables appearing in crack constraints.
pub const BIT_VER_WIDTH: u32 = 8;

/// Upper bound of ranked edges considered in one round.
pub const CANDIDATE_NUM: usize = 40;

/// Seeds attached to a single edge in one round.
pub const CRACK_SEED_MAX: usize = 3;

/// Global crack budget per edge, across all seeds.
pub const CRACK_UPPER_LIMIT: usize = 16;

/// Seeds solved per random-solve fallback round.
pub const RAND_SOLVE_NUM: usize = 4;

/// Points drawn from the polytope for each cracked constraint.
pub const DEFAULT_SAMPLER_NUM: usize = 20;

/// File name under which the current concolic input is staged.
pub const CUR_INPUT: &str = ".cur_input";

/// Default name of the coordinator instance directory.
pub const DEFAULT_INSTANCE_NAME: &str = "concolic";

/// Default log file name, relative to the instance directory.
pub const DEFAULT_LOG_FILE: &str = "hybrid.log";

/// Byte order of the 4-byte basic-block counters in `bb_bitmap`.
pub const BYTE_ORDER: ByteOrder = ByteOrder::Little;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

/// Program-under-test section of the configuration file.
///
/// ```ini
/// [put]
/// trace_bin = /path/to/target.trace
/// cohuzz_bin = /path/to/target.concolic
/// argument = -a @@
/// ```
#[derive(Debug, Clone)]
pub struct PutConfig {
    pub trace_bin: PathBuf,
    pub concolic_bin: PathBuf,
    /// Target arguments with `@@` marking the input file position.
    pub argument: String,
}

impl PutConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let conf = Ini::load_from_file(path)
            .with_context(|| format!("Reading config file {}", path.display()))?;
        let put = conf
            .section(Some("put"))
            .context("Config file has no [put] section")?;
        let trace_bin = valid_path(put.get("trace_bin").context("Missing put.trace_bin")?)?;
        let concolic_bin = valid_path(put.get("cohuzz_bin").context("Missing put.cohuzz_bin")?)?;
        let argument = put
            .get("argument")
            .context("Missing put.argument")?
            .to_owned();
        anyhow::ensure!(
            argument.contains("@@"),
            "put.argument must contain the @@ input placeholder"
        );
        Ok(Self {
            trace_bin,
            concolic_bin,
            argument,
        })
    }
}

/// Resolve a path that must already exist on disk.
pub fn valid_path(path: &str) -> anyhow::Result<PathBuf> {
    Path::new(path)
        .canonicalize()
        .with_context(|| format!("{path} does not exist"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::PutConfig;

    #[test]
    fn loads_put_section() {
        let dir = tempfile::tempdir().unwrap();
        let trace = dir.path().join("trace");
        let concolic = dir.path().join("concolic");
        std::fs::write(&trace, b"").unwrap();
        std::fs::write(&concolic, b"").unwrap();
        let mut cfg = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            cfg,
            "[put]\ntrace_bin = {}\ncohuzz_bin = {}\nargument = -d @@",
            trace.display(),
            concolic.display()
        )
        .unwrap();

        let put = PutConfig::load(cfg.path()).unwrap();
        assert_eq!(put.argument, "-d @@");
        assert!(put.trace_bin.ends_with("trace"));
    }

    #[test]
    fn rejects_argument_without_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let trace = dir.path().join("trace");
        std::fs::write(&trace, b"").unwrap();
        let mut cfg = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            cfg,
            "[put]\ntrace_bin = {0}\ncohuzz_bin = {0}\nargument = -d input",
            trace.display()
        )
        .unwrap();

        let err = PutConfig::load(cfg.path()).unwrap_err();
        assert!(err.to_string().contains("@@"));
    }

    #[test]
    fn rejects_missing_section() {
        let mut cfg = tempfile::NamedTempFile::new().unwrap();
        writeln!(cfg, "[other]\nkey = value").unwrap();
        assert!(PutConfig::load(cfg.path()).is_err());
    }
}
