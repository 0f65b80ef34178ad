//! Batch sizing for detector calls.
//!
//! Small documents go to the detector in one call. Larger ones are split into
//! fixed-size batches picked from a short table of breakpoints, and backends
//! with a tight memory budget (unified-memory GPUs) further cap every call.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

/// Default per-call ceiling for [`BackendMemoryClass::Constrained`].
pub const DEFAULT_CONSTRAINED_CEILING: usize = 2;

/// How much detector input a backend can hold at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackendMemoryClass {
    /// Batches are sent as planned.
    #[default]
    Standard,
    /// No call may carry more than `ceiling` canvases.
    Constrained { ceiling: usize },
}

impl BackendMemoryClass {
    pub fn constrained() -> Self {
        BackendMemoryClass::Constrained {
            ceiling: DEFAULT_CONSTRAINED_CEILING,
        }
    }

    /// Per-call cap, if any. A zero ceiling is treated as one.
    pub fn ceiling(&self) -> Option<usize> {
        match self {
            BackendMemoryClass::Standard => None,
            BackendMemoryClass::Constrained { ceiling } => Some((*ceiling).max(1)),
        }
    }
}

/// Batch size for a document of `total_pages`.
fn base_batch_size(total_pages: usize) -> usize {
    match total_pages {
        0..=4 => total_pages,
        5..=8 => 4,
        9..=16 => 6,
        _ => 8,
    }
}

/// Split `total_pages` into consecutive batch sizes.
///
/// ```
/// use edgequake_detect::pipeline::batch::{plan_batches, BackendMemoryClass};
///
/// assert_eq!(plan_batches(3, BackendMemoryClass::Standard), vec![3]);
/// assert_eq!(plan_batches(8, BackendMemoryClass::Standard), vec![4, 4]);
/// assert_eq!(plan_batches(20, BackendMemoryClass::Standard), vec![8, 8, 4]);
/// ```
pub fn plan_batches(total_pages: usize, class: BackendMemoryClass) -> Vec<usize> {
    if total_pages == 0 {
        return Vec::new();
    }
    let mut size = base_batch_size(total_pages);
    if let Some(ceiling) = class.ceiling() {
        size = size.min(ceiling);
    }
    chunk_sizes(total_pages, size)
}

/// Split one planned batch into detector calls.
pub fn plan_sub_batches(batch_len: usize, class: BackendMemoryClass) -> Vec<usize> {
    if batch_len == 0 {
        return Vec::new();
    }
    match class.ceiling() {
        None => vec![batch_len],
        Some(ceiling) => chunk_sizes(batch_len, ceiling),
    }
}

/// [`plan_batches`] as index ranges into the page list.
pub fn batch_ranges(total_pages: usize, class: BackendMemoryClass) -> Vec<Range<usize>> {
    sizes_to_ranges(&plan_batches(total_pages, class))
}

/// Turn a list of sizes into consecutive ranges starting at 0.
pub fn sizes_to_ranges(sizes: &[usize]) -> Vec<Range<usize>> {
    let mut start = 0;
    sizes
        .iter()
        .map(|&n| {
            let r = start..start + n;
            start += n;
            r
        })
        .collect()
}

fn chunk_sizes(total: usize, size: usize) -> Vec<usize> {
    let size = size.max(1);
    let mut out = vec![size; total / size];
    if total % size != 0 {
        out.push(total % size);
    }
    out
}

// ── Device ───────────────────────────────────────────────────────────────

/// Compute backend the detector runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cuda,
    Mps,
    #[default]
    Cpu,
}

impl Device {
    /// Unified-memory GPUs share RAM with the host and are capped per call.
    pub fn memory_class(&self) -> BackendMemoryClass {
        match self {
            Device::Mps => BackendMemoryClass::constrained(),
            Device::Cuda | Device::Cpu => BackendMemoryClass::Standard,
        }
    }

    /// Read `EDGEQUAKE_DEVICE`, falling back to CPU when unset or unknown.
    pub fn detect() -> Self {
        std::env::var("EDGEQUAKE_DEVICE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Device::Cuda => "cuda",
            Device::Mps => "mps",
            Device::Cpu => "cpu",
        })
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Ok(Device::Cuda),
            "mps" | "metal" => Ok(Device::Mps),
            "cpu" => Ok(Device::Cpu),
            other => Err(format!("unknown device '{other}' (expected cuda, mps, cpu)")),
        }
    }
}
