use std::{
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::LazyLock,
};

use anyhow::Context;
use derive_new::new as New;
use regex::Regex;
use tracing::debug;

use crate::condition::{CondNode, CondTable};

static TRACE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[\*\]\s\((?P<condition>.*)\): (?P<src>\d+),(?P<dest>\d+).*$").unwrap()
});

/// Replays seeds through the trace binary and folds the branch records
/// printed on stderr into the condition-node table.
#[derive(Debug, New)]
pub struct CorpusTracer {
    trace_bin: PathBuf,
    /// Target arguments with `@@` marking the input file position.
    put_args: String,
}

impl CorpusTracer {
    /// Trace every seed in the list. A failing trace run contributes
    /// nothing and is not fatal.
    pub fn trace_corpus(&self, table: &mut CondTable, seeds: &[PathBuf]) {
        for seed in seeds {
            match self.run_trace(seed) {
                Ok(stderr) => self.dump_trace(table, seed, &stderr),
                Err(err) => debug!(seed = %seed.display(), %err, "trace run failed"),
            }
        }
    }

    fn run_trace(&self, seed: &Path) -> anyhow::Result<Vec<u8>> {
        let seed_arg = seed.to_string_lossy();
        let output = Command::new(&self.trace_bin)
            .args(
                self.put_args
                    .split_whitespace()
                    .map(|token| token.replace("@@", &seed_arg)),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Running trace binary {}", self.trace_bin.display()))?;
        Ok(output.stderr)
    }

    /// Fold one trace into the table. The line counter doubles as the
    /// distance from the trace root; non-UTF8 and unmatched lines are
    /// skipped.
    fn dump_trace(&self, table: &mut CondTable, seed: &Path, trace_info: &[u8]) {
        let mut line_cnt = 0;
        for raw in trace_info.split(|&byte| byte == b'\n') {
            let Ok(line) = std::str::from_utf8(raw) else {
                continue;
            };
            let line = line.strip_suffix('\r').unwrap_or(line);
            line_cnt += 1;
            let Some(caps) = TRACE_LINE.captures(line) else {
                continue;
            };
            let (Ok(src_bb), Ok(dest_bb)) = (caps["src"].parse(), caps["dest"].parse::<u64>())
            else {
                continue;
            };
            let node = table
                .entry(src_bb)
                .or_insert_with(|| CondNode::new(src_bb, &caps["condition"], line_cnt));
            node.children.insert(dest_bb);
            node.belongs.insert(seed.to_path_buf());
            node.update_dist(line_cnt);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use indexmap::IndexMap;

    use super::CorpusTracer;

    fn tracer() -> CorpusTracer {
        CorpusTracer::new(PathBuf::from("/nonexistent/trace"), "@@".to_owned())
    }

    #[test]
    fn both_successors_cover_a_branch() {
        let mut table = IndexMap::new();
        let seed = Path::new("id:000001,orig:a");
        let log = b"[*] (Br_true_icmp eq _i8 pred@3): 10,20\n[*] (Br_false_icmp eq _i8 pred@3): 10,30\n";
        tracer().dump_trace(&mut table, seed, log);

        let node = &table[&10];
        assert!(node.children.contains(&20));
        assert!(node.children.contains(&30));
        assert!(node.is_covered());
        assert!(node.belongs.contains(seed));
        assert_eq!(node.min_dist, 1);
    }

    #[test]
    fn garbage_lines_are_skipped_but_counted() {
        let mut table = IndexMap::new();
        let seed = Path::new("id:000002,orig:b");
        let log = b"noise\n\xff\xfe\n[*] (Br_true_x): 7,8\n";
        tracer().dump_trace(&mut table, seed, log);

        // The invalid UTF-8 line does not advance the counter; the noise
        // line does.
        assert_eq!(table[&7].min_dist, 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn distance_is_the_minimum_over_traces() {
        let mut table = IndexMap::new();
        let first = Path::new("id:000003,orig:c");
        let second = Path::new("id:000004,orig:d");
        tracer().dump_trace(
            &mut table,
            first,
            b"x\ny\nz\n[*] (Br_true_x): 5,6\n",
        );
        tracer().dump_trace(&mut table, second, b"[*] (Br_true_x): 5,9\n");

        let node = &table[&5];
        assert_eq!(node.min_dist, 1);
        assert_eq!(node.belongs.len(), 2);
        assert_eq!(node.children.len(), 2);
    }

    #[test]
    fn trailing_fields_after_dest_are_tolerated() {
        let mut table = IndexMap::new();
        let log = b"[*] (Switch_i16_8): 42,43 extra payload\n";
        tracer().dump_trace(&mut table, Path::new("id:000005,x"), log);
        assert_eq!(table[&42].kind.successor_count(), 8);
    }
}
