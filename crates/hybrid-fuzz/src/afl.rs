use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::LazyLock,
};

use anyhow::Context;
use itertools::Itertools;
use regex::Regex;
use tempfile::NamedTempFile;

use crate::config::SHOWMAP_TIMEOUT;

static COMMAND_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^command_line\s*:(?P<cmd>.*)$").unwrap());
static TARGET_CMD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^.*--(?P<cmd>.*)$").unwrap());

/// How `afl-showmap` classified one execution of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowmapStatus {
    Normal,
    Hang,
    Crash,
    /// Any other exit; the testcase is dropped.
    Ignored,
}

impl ShowmapStatus {
    fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => ShowmapStatus::Normal,
            Some(1) => ShowmapStatus::Hang,
            Some(2) => ShowmapStatus::Crash,
            _ => ShowmapStatus::Ignored,
        }
    }
}

/// View of the external fuzzer's output directory, derived from its
/// `fuzzer_stats` file.
#[derive(Debug)]
pub struct AflConfig {
    pub queue: PathBuf,
    pub fuzz_bitmap: PathBuf,
    pub bb_bitmap: PathBuf,
    showmap: PathBuf,
    /// Target command with `@@` marking the input file position.
    target_cmd: String,
    qemu_mode: bool,
}

impl AflConfig {
    pub fn new(fuzz_out: &Path) -> anyhow::Result<Self> {
        let output = fuzz_out
            .canonicalize()
            .with_context(|| format!("Fuzzer output {} does not exist", fuzz_out.display()))?;
        let afl_cmd = Self::parse_fuzzer_stats(&output.join("fuzzer_stats"))?;
        let target_cmd = Self::parse_target_cmd(&afl_cmd)?;
        let afl_bin = afl_cmd
            .split_whitespace()
            .next()
            .context("Empty fuzzer command line")?;
        let afl_dir = Path::new(afl_bin).parent().unwrap_or(Path::new(""));
        Ok(Self {
            queue: output.join("queue"),
            fuzz_bitmap: output.join("fuzz_bitmap"),
            bb_bitmap: output.join("bb_bitmap"),
            showmap: afl_dir.join("afl-showmap"),
            qemu_mode: afl_cmd.split_whitespace().any(|token| token == "-Q"),
            target_cmd,
        })
    }

    fn parse_fuzzer_stats(stats_file: &Path) -> anyhow::Result<String> {
        let stats = fs::read_to_string(stats_file)
            .with_context(|| format!("Reading {}", stats_file.display()))?;
        stats
            .lines()
            .find_map(|line| COMMAND_LINE.captures(line))
            .map(|caps| caps["cmd"].trim().to_owned())
            .context("fuzzer_stats has no command_line entry")
    }

    /// The target command is everything after the last `--` separator.
    fn parse_target_cmd(afl_cmd: &str) -> anyhow::Result<String> {
        TARGET_CMD
            .captures(afl_cmd)
            .map(|caps| caps["cmd"].trim().to_owned())
            .with_context(|| format!("Invalid target command: {afl_cmd}"))
    }

    /// Seeds currently in the fuzzer queue, sorted by name.
    pub fn queue_seeds(&self) -> anyhow::Result<Vec<PathBuf>> {
        let seeds = fs::read_dir(&self.queue)
            .with_context(|| format!("Listing fuzzer queue {}", self.queue.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .map(|name| name.to_string_lossy().starts_with("id:"))
                    .unwrap_or(false)
            })
            .sorted()
            .collect();
        Ok(seeds)
    }

    /// Run the target under `afl-showmap` and return the per-input
    /// bitmap along with the exit classification.
    pub fn exec_showmap(&self, testcase: &Path) -> anyhow::Result<(Vec<u8>, ShowmapStatus)> {
        let output_tmp = NamedTempFile::new().context("Creating showmap output file")?;
        let testcase_arg = testcase.to_string_lossy();

        let mut cmd = Command::new(&self.showmap);
        cmd.arg("-t")
            .arg(SHOWMAP_TIMEOUT.to_string())
            .args(["-m", "none", "-q", "-b"]);
        if self.qemu_mode {
            cmd.arg("-Q");
        }
        cmd.arg("-o").arg(output_tmp.path()).arg("--");
        cmd.args(
            self.target_cmd
                .split_whitespace()
                .map(|token| token.replace("@@", &testcase_arg)),
        );
        let status = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .with_context(|| format!("Running {}", self.showmap.display()))?;

        let bitmap = fs::read(output_tmp.path()).unwrap_or_default();
        Ok((bitmap, ShowmapStatus::from_code(status.code())))
    }
}

#[cfg(test)]
mod tests {
    use super::{AflConfig, ShowmapStatus};

    #[test]
    fn parses_command_line_and_target() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("queue")).unwrap();
        std::fs::write(
            dir.path().join("fuzzer_stats"),
            "start_time        : 1\ncommand_line      : /opt/afl/afl-fuzz -i in -o out -- /bin/target -x @@\n",
        )
        .unwrap();

        let afl = AflConfig::new(dir.path()).unwrap();
        assert_eq!(afl.target_cmd, "/bin/target -x @@");
        assert!(afl.showmap.ends_with("afl-showmap"));
        assert!(afl.showmap.starts_with("/opt/afl"));
        assert!(!afl.qemu_mode);
    }

    #[test]
    fn last_separator_wins() {
        let cmd = "/opt/afl/afl-fuzz -i in -o out -- wrapper -- /bin/target @@";
        assert_eq!(
            AflConfig::parse_target_cmd(cmd).unwrap(),
            "/bin/target @@"
        );
    }

    #[test]
    fn detects_qemu_mode() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("fuzzer_stats"),
            "command_line : /opt/afl/afl-fuzz -Q -i in -o out -- /bin/target @@\n",
        )
        .unwrap();
        let afl = AflConfig::new(dir.path()).unwrap();
        assert!(afl.qemu_mode);
    }

    #[test]
    fn stats_without_command_line_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fuzzer_stats"), "cycles_done : 5\n").unwrap();
        assert!(AflConfig::new(dir.path()).is_err());
    }

    #[test]
    fn queue_listing_keeps_only_seed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let queue = dir.path().join("queue");
        std::fs::create_dir(&queue).unwrap();
        std::fs::write(
            dir.path().join("fuzzer_stats"),
            "command_line : afl-fuzz -i in -o out -- target @@\n",
        )
        .unwrap();
        std::fs::write(queue.join("id:000000,orig:a"), b"x").unwrap();
        std::fs::write(queue.join("id:000001,+cov"), b"y").unwrap();
        std::fs::write(queue.join(".state"), b"z").unwrap();

        let afl = AflConfig::new(dir.path()).unwrap();
        let seeds = afl.queue_seeds().unwrap();
        assert_eq!(seeds.len(), 2);
        assert!(seeds[0].ends_with("id:000000,orig:a"));
    }

    #[test]
    fn status_classification() {
        assert_eq!(ShowmapStatus::from_code(Some(0)), ShowmapStatus::Normal);
        assert_eq!(ShowmapStatus::from_code(Some(1)), ShowmapStatus::Hang);
        assert_eq!(ShowmapStatus::from_code(Some(2)), ShowmapStatus::Crash);
        assert_eq!(ShowmapStatus::from_code(Some(42)), ShowmapStatus::Ignored);
        assert_eq!(ShowmapStatus::from_code(None), ShowmapStatus::Ignored);
    }
}
