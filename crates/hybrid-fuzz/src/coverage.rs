use std::{fs, path::PathBuf};

use anyhow::Context;

use crate::config::MAP_SIZE;

/// Accumulated edge-coverage map shared with the mutational fuzzer.
///
/// AFL's on-disk `fuzz_bitmap` stores a zero bit wherever an edge
/// bucket was hit, so bytes are complemented on load. Per-input bitmaps
/// produced by `afl-showmap -b` use the direct encoding and are merged
/// with a plain bytewise OR.
#[derive(Debug)]
pub struct CoverageMap {
    bitmap_file: Option<PathBuf>,
    bitmap: Vec<u8>,
}

impl CoverageMap {
    pub fn new(bitmap_file: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut map = Self {
            bitmap_file,
            bitmap: vec![0; MAP_SIZE],
        };
        if let Some(file) = map.bitmap_file.clone() {
            if file.exists() {
                let raw = fs::read(&file)
                    .with_context(|| format!("Reading fuzzer bitmap {}", file.display()))?;
                anyhow::ensure!(
                    raw.len() == MAP_SIZE,
                    "Fuzzer bitmap is {} bytes, expected {MAP_SIZE}",
                    raw.len()
                );
                for (acc, byte) in map.bitmap.iter_mut().zip(&raw) {
                    *acc = byte ^ 0xFF;
                }
            }
        }
        Ok(map)
    }

    /// Re-read the fuzzer's bitmap and fold newly hit buckets into the
    /// accumulated map.
    pub fn update(&mut self) -> anyhow::Result<()> {
        if let Some(file) = self.bitmap_file.clone() {
            if file.exists() {
                let raw = fs::read(&file)
                    .with_context(|| format!("Reading fuzzer bitmap {}", file.display()))?;
                for (acc, byte) in self.bitmap.iter_mut().zip(&raw) {
                    *acc |= byte ^ 0xFF;
                }
            }
        }
        Ok(())
    }

    /// Merge a per-input bitmap and count the indices whose accumulated
    /// byte changed. The merge is committed even when the caller ends up
    /// dropping the testcase, so repeating the same input yields zero.
    pub fn is_interesting(&mut self, input_bitmap: &[u8]) -> usize {
        let mut increase = 0;
        for (acc, byte) in self.bitmap.iter_mut().zip(input_bitmap) {
            let merged = *acc | byte;
            if merged != *acc {
                *acc = merged;
                increase += 1;
            }
        }
        increase
    }
}
