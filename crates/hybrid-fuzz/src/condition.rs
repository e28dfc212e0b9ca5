use std::{
    path::PathBuf,
    sync::LazyLock,
};

use indexmap::{IndexMap, IndexSet};
use regex::Regex;

/// Condition nodes keyed by basic-block address, in discovery order.
pub type CondTable = IndexMap<u64, CondNode>;

/// Dimension of the edge feature vector fed to the ranking model.
pub const EDGE_FEATURE_DIM: usize = 5;

static BR_COND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Br_(?P<value>true|false)_(?P<br_cond>.*)$").unwrap());
static SWITCH_COND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Switch_i(?P<width>\d+)_(?P<case_num>\d+)$").unwrap());
static PRED_TYPE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"pred@(?P<type>\d+)").unwrap());
static COND_WIDTH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"_i(?P<width>\d+)").unwrap());

/// Substring classes checked in order when a branch condition carries no
/// `pred@` marker.
const EDGE_CLASSES: [(&str, u32); 6] = [
    ("strcmp", 42),
    ("strncmp", 43),
    ("memcmp", 44),
    ("phi", 45),
    ("call@", 46),
    ("constInst", 47),
];

const SWITCH_EDGE_TYPE: u32 = 48;

/// Kind of conditional statement terminating a basic block.
#[derive(Debug, Clone, PartialEq)]
pub enum CondKind {
    /// Two-way conditional branch.
    Branch {
        cond_value: bool,
        edge_type: u32,
        cond_width: f64,
    },
    /// Multi-way switch over an integer of the given width.
    Switch { case_num: usize, cond_width: f64 },
    /// A trace line we could not classify. Never a crack candidate.
    Unknown,
}

impl CondKind {
    pub fn parse(cond_str: &str) -> Self {
        if let Some(caps) = BR_COND.captures(cond_str) {
            let br_cond = &caps["br_cond"];
            return CondKind::Branch {
                cond_value: &caps["value"] == "true",
                edge_type: parse_edge_type(br_cond),
                cond_width: parse_cond_width(br_cond),
            };
        }
        if let Some(caps) = SWITCH_COND.captures(cond_str) {
            let width: u64 = match caps["width"].parse() {
                Ok(width) => width,
                Err(_) => return CondKind::Unknown,
            };
            let case_num = match caps["case_num"].parse() {
                Ok(num) => num,
                Err(_) => return CondKind::Unknown,
            };
            return CondKind::Switch {
                case_num,
                cond_width: log2_or_zero(width as f64),
            };
        }
        CondKind::Unknown
    }

    /// Number of successor blocks this conditional can reach.
    pub fn successor_count(&self) -> usize {
        match self {
            CondKind::Branch { .. } => 2,
            CondKind::Switch { case_num, .. } => *case_num,
            CondKind::Unknown => 0,
        }
    }

    pub fn edge_type(&self) -> u32 {
        match self {
            CondKind::Branch { edge_type, .. } => *edge_type,
            CondKind::Switch { .. } => SWITCH_EDGE_TYPE,
            CondKind::Unknown => 0,
        }
    }

    pub fn cond_width(&self) -> f64 {
        match self {
            CondKind::Branch { cond_width, .. } | CondKind::Switch { cond_width, .. } => {
                *cond_width
            }
            CondKind::Unknown => 0.0,
        }
    }
}

fn parse_edge_type(condition: &str) -> u32 {
    if let Some(caps) = PRED_TYPE.captures(condition) {
        if let Ok(pred) = caps["type"].parse() {
            return pred;
        }
    }
    EDGE_CLASSES
        .iter()
        .find(|(marker, _)| condition.contains(*marker))
        .map(|(_, edge_type)| *edge_type)
        .unwrap_or(0)
}

fn parse_cond_width(condition: &str) -> f64 {
    COND_WIDTH
        .captures(condition)
        .and_then(|caps| caps["width"].parse::<u64>().ok())
        .map(|width| log2_or_zero(width as f64))
        .unwrap_or(0.0)
}

fn log2_or_zero(value: f64) -> f64 {
    if value > 0.0 { value.log2() } else { 0.0 }
}

/// One conditional basic block observed by the tracer.
#[derive(Debug)]
pub struct CondNode {
    pub addr: u64,
    /// Smallest line distance from the trace root at which this node was
    /// seen. Always at least 1.
    pub min_dist: usize,
    pub kind: CondKind,
    /// Destination blocks reached so far.
    pub children: IndexSet<u64>,
    /// Seeds whose traces pass through this node.
    pub belongs: IndexSet<PathBuf>,
}

impl CondNode {
    pub fn new(addr: u64, cond_str: &str, edge_dist: usize) -> Self {
        Self {
            addr,
            min_dist: edge_dist.max(1),
            kind: CondKind::parse(cond_str),
            children: IndexSet::new(),
            belongs: IndexSet::new(),
        }
    }

    pub fn update_dist(&mut self, edge_dist: usize) {
        if edge_dist < self.min_dist {
            self.min_dist = edge_dist.max(1);
        }
    }

    /// All reachable successors have been observed.
    pub fn is_covered(&self) -> bool {
        self.children.len() >= self.kind.successor_count()
    }

    /// `[edge_type, cond_width, uncovered siblings, log2(root distance),
    /// basic-block hits]`.
    pub fn feature(&self, bb_hit: f64) -> [f64; EDGE_FEATURE_DIM] {
        let sibling_uncover =
            self.kind.successor_count() as f64 - self.children.len() as f64;
        [
            self.kind.edge_type() as f64,
            self.kind.cond_width(),
            sibling_uncover,
            log2_or_zero(self.min_dist as f64),
            bb_hit,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::{CondKind, CondNode};

    #[test]
    fn branch_with_predicate_marker() {
        let kind = CondKind::parse("Br_true_icmp eq _i32 pred@5");
        let CondKind::Branch {
            cond_value,
            edge_type,
            cond_width,
        } = kind
        else {
            panic!("expected a branch");
        };
        assert!(cond_value);
        assert_eq!(edge_type, 5);
        assert_eq!(cond_width, 5.0);
    }

    #[test]
    fn branch_class_by_first_matching_substring() {
        let kind = CondKind::parse("Br_false_call@strcmp (i8* %a, i8* %b)");
        assert_eq!(kind.edge_type(), 42);
        let CondKind::Branch { cond_value, .. } = kind else {
            panic!("expected a branch");
        };
        assert!(!cond_value);
    }

    #[test]
    fn switch_condition() {
        let kind = CondKind::parse("Switch_i16_8");
        assert_eq!(kind.edge_type(), 48);
        assert_eq!(kind.successor_count(), 8);
        assert_eq!(kind.cond_width(), 4.0);
    }

    #[test]
    fn unclassified_lines_have_no_successors() {
        let kind = CondKind::parse("something else entirely");
        assert_eq!(kind.successor_count(), 0);
        assert_eq!(kind.edge_type(), 0);
        assert_eq!(kind.cond_width(), 0.0);
    }

    #[test]
    fn feature_vector_is_deterministic() {
        let mut node = CondNode::new(10, "Br_true_icmp ult _i8 pred@3", 4);
        node.children.insert(20);
        let feature = node.feature(6.0);
        assert_eq!(feature, [3.0, 3.0, 1.0, 2.0, 6.0]);
        assert_eq!(feature, node.feature(6.0));
    }

    #[test]
    fn branch_covered_after_both_successors() {
        let mut node = CondNode::new(10, "Br_true_icmp eq _i8 pred@3", 1);
        node.children.insert(20);
        assert!(!node.is_covered());
        node.children.insert(30);
        assert!(node.is_covered());
    }

    #[test]
    fn distance_only_shrinks() {
        let mut node = CondNode::new(10, "Br_true_x", 9);
        node.update_dist(12);
        assert_eq!(node.min_dist, 9);
        node.update_dist(3);
        assert_eq!(node.min_dist, 3);
    }
}
