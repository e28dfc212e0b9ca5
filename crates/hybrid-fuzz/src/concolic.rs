use std::{
    fs,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use anyhow::Context;

use crate::{
    config::{CONCOLIC_TIMEOUT, CUR_INPUT, MAP_SIZE},
    utils,
};

/// Drives the concolic binary in its two modes. Every invocation runs
/// under `timeout -k 5` so a wedged child cannot stall the main loop.
#[derive(Debug)]
pub struct ConcolicDriver {
    /// Coverage map handed to the child via `SYMCC_AFL_COVERAGE_MAP`.
    bitmap: PathBuf,
    crackmap: PathBuf,
    cur_input: PathBuf,
    /// Where solve mode collects generated testcases.
    output_dir: PathBuf,
    concolic_bin: PathBuf,
    put_args: String,
}

impl ConcolicDriver {
    pub fn new(
        work_dir: &Path,
        output_dir: PathBuf,
        concolic_bin: PathBuf,
        put_args: String,
    ) -> Self {
        Self {
            bitmap: work_dir.join("bitmap"),
            crackmap: work_dir.join("crackmap"),
            cur_input: work_dir.join(CUR_INPUT),
            output_dir,
            concolic_bin,
            put_args,
        }
    }

    fn command(&self) -> Command {
        let input_arg = self.cur_input.to_string_lossy();
        let mut cmd = Command::new("timeout");
        cmd.arg("-k")
            .arg("5")
            .arg(CONCOLIC_TIMEOUT.to_string())
            .arg(&self.concolic_bin);
        cmd.args(
            self.put_args
                .split_whitespace()
                .map(|token| token.replace("@@", &input_arg)),
        );
        cmd.env("SYMCC_ENABLE_LINEARIZATION", "1")
            .env("SYMCC_AFL_COVERAGE_MAP", &self.bitmap)
            .env("SYMCC_INPUT_FILE", &self.cur_input)
            .stdin(Stdio::null());
        cmd
    }

    fn stage_input(&self, input: &Path) -> anyhow::Result<()> {
        fs::copy(input, &self.cur_input)
            .with_context(|| format!("Staging concolic input {}", input.display()))?;
        Ok(())
    }

    /// All map slots default to 255; listed addresses are zeroed. This
    /// inverted encoding is the contract with the concolic binary.
    fn dump_crack_map(&self, crack_addrs: &[u64]) -> anyhow::Result<()> {
        let mut map = vec![0xFFu8; MAP_SIZE];
        for &addr in crack_addrs {
            if let Some(slot) = map.get_mut(addr as usize) {
                *slot = 0;
            }
        }
        fs::write(&self.crackmap, map)
            .with_context(|| format!("Writing crack map {}", self.crackmap.display()))
    }

    /// Run one full concolic exploration of `input`. Returns the files
    /// the child wrote and whether it was killed by the timeout.
    pub fn solve(&self, input: &Path) -> anyhow::Result<(Vec<PathBuf>, bool)> {
        utils::init_dir(&self.output_dir)?;
        self.stage_input(input)?;
        let status = self
            .command()
            .env("SYMCC_OUTPUT_DIR", &self.output_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .context("Running concolic solve")?;
        let killed = status.code() == Some(124) || status.signal() == Some(9);

        let mut testcases: Vec<PathBuf> = fs::read_dir(&self.output_dir)
            .with_context(|| format!("Listing {}", self.output_dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .collect();
        testcases.sort();
        Ok((testcases, killed))
    }

    /// Ask the child to emit constraints for the listed addresses.
    /// Returns its stderr, which carries the crack records. A nonzero
    /// exit is a normal outcome.
    pub fn crack(&self, input: &Path, crack_addrs: &[u64]) -> anyhow::Result<Vec<u8>> {
        self.dump_crack_map(crack_addrs)?;
        self.stage_input(input)?;
        let output = self
            .command()
            .env("SYMCC_ENABLE_CRACKING", "1")
            .env("SYMCC_CRACK_MAP", &self.crackmap)
            .stdout(Stdio::null())
            .output()
            .context("Running concolic crack")?;
        Ok(output.stderr)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::ConcolicDriver;
    use crate::config::MAP_SIZE;

    #[test]
    fn crack_map_zeroes_only_targets() {
        let dir = tempfile::tempdir().unwrap();
        let driver = ConcolicDriver::new(
            dir.path(),
            dir.path().join("out"),
            PathBuf::from("/nonexistent/concolic"),
            "@@".to_owned(),
        );
        driver.dump_crack_map(&[0, 17, MAP_SIZE as u64 + 5]).unwrap();

        let map = std::fs::read(dir.path().join("crackmap")).unwrap();
        assert_eq!(map.len(), MAP_SIZE);
        assert_eq!(map[0], 0);
        assert_eq!(map[17], 0);
        assert_eq!(map[1], 0xFF);
        assert_eq!(map.iter().filter(|&&byte| byte == 0).count(), 2);
    }
}
