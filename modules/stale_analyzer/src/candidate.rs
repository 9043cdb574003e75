//! Stale candidate records and branch conflict classification.

use forkscout_common::{BlockHash, OutPoint, TxData, TxId, TxOutput};
use std::collections::{BTreeSet, HashMap};

/// One competing branch, rooted at the contested height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchSummary {
    pub root: BlockHash,
    pub tip: BlockHash,
    pub length: usize,
    /// Blocks on the branch, root first.
    pub blocks: Vec<BlockHash>,
}

/// A transaction conflict between the two branches of one race.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// Transaction on the shorter branch.
    pub original: TxId,
    /// Transaction spending the same outpoint on the longer branch.
    pub replacement: TxId,
    /// Total output value of the original transaction.
    pub amount: u64,
}

/// A same-height block race and its transaction conflict classification.
#[derive(Debug, Clone)]
pub struct StaleCandidate {
    pub height: u64,
    pub branches: Vec<BranchSummary>,
    /// Txids confirmed on one branch only.
    pub confirmed_in_one_branch: Vec<TxId>,
    pub confirmed_in_one_branch_total: u64,
    /// Conflicts spending an outpoint on both branches with different txids.
    pub double_spent_in_one_branch: Vec<Conflict>,
    pub double_spent_total: u64,
    /// The subset of conflicts that look like fee bumps.
    pub rbf: Vec<Conflict>,
    pub rbf_total: u64,
    /// Fleet best height at the last completed classification. None until
    /// classified, or when transaction data was incomplete.
    pub height_processed: Option<u64>,
    /// A branch block lacked transaction data on the last pass.
    pub missing_transactions: bool,
}

impl StaleCandidate {
    pub fn new(height: u64) -> Self {
        Self {
            height,
            branches: Vec::new(),
            confirmed_in_one_branch: Vec::new(),
            confirmed_in_one_branch_total: 0,
            double_spent_in_one_branch: Vec::new(),
            double_spent_total: 0,
            rbf: Vec::new(),
            rbf_total: 0,
            height_processed: None,
            missing_transactions: false,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Classification {
    pub confirmed_in_one_branch: Vec<TxId>,
    pub confirmed_total: u64,
    pub double_spent: Vec<Conflict>,
    pub double_spent_total: u64,
    pub rbf: Vec<Conflict>,
    pub rbf_total: u64,
}

/// Classify conflicts between the shorter and longer branch of a race.
///
/// With equal-length branches there is no losing side yet, so the
/// one-branch-only set is the symmetric difference.
pub(crate) fn classify(
    shortest: &[&TxData],
    longest: &[&TxData],
    equal_length: bool,
    tolerance: u64,
) -> Classification {
    let shortest_ids: BTreeSet<TxId> = shortest.iter().map(|t| t.txid).collect();
    let longest_ids: BTreeSet<TxId> = longest.iter().map(|t| t.txid).collect();

    let confirmed: Vec<TxId> = if equal_length {
        shortest_ids.symmetric_difference(&longest_ids).copied().collect()
    } else {
        shortest_ids.difference(&longest_ids).copied().collect()
    };
    let mut amounts: HashMap<TxId, u64> = HashMap::new();
    for tx in shortest.iter().chain(longest.iter()) {
        amounts.entry(tx.txid).or_insert_with(|| tx.total_output());
    }
    let confirmed_total = confirmed.iter().filter_map(|id| amounts.get(id)).sum();

    // outpoint -> spending tx per branch; a later block's spend of an
    // already-seen outpoint wins, as in a reorg replay
    let mut shortest_spends: HashMap<OutPoint, &TxData> = HashMap::new();
    for tx in shortest {
        for input in &tx.inputs {
            shortest_spends.insert(*input, tx);
        }
    }
    let mut longest_spends: HashMap<OutPoint, &TxData> = HashMap::new();
    for tx in longest {
        for input in &tx.inputs {
            longest_spends.insert(*input, tx);
        }
    }

    let mut double_spent = Vec::new();
    let mut rbf = Vec::new();
    // one conflict per tx pair even when several inputs collide
    let mut seen_pairs: BTreeSet<(TxId, TxId)> = BTreeSet::new();
    for (outpoint, original) in &shortest_spends {
        let Some(replacement) = longest_spends.get(outpoint) else {
            continue;
        };
        if replacement.txid == original.txid {
            continue;
        }
        if !seen_pairs.insert((original.txid, replacement.txid)) {
            continue;
        }
        let conflict = Conflict {
            original: original.txid,
            replacement: replacement.txid,
            amount: original.total_output(),
        };
        if is_fee_bump(original, replacement, tolerance) {
            rbf.push(conflict.clone());
        }
        double_spent.push(conflict);
    }
    double_spent.sort_by_key(|c| (c.original, c.replacement));
    rbf.sort_by_key(|c| (c.original, c.replacement));
    let double_spent_total = double_spent.iter().map(|c| c.amount).sum();
    let rbf_total = rbf.iter().map(|c| c.amount).sum();

    Classification {
        confirmed_in_one_branch: confirmed,
        confirmed_total,
        double_spent,
        double_spent_total,
        rbf,
        rbf_total,
    }
}

/// A conflict is a fee bump when the replacement pays exactly the same
/// output scripts and each value moved by at most `tolerance`. An added
/// change output disqualifies it.
pub(crate) fn is_fee_bump(original: &TxData, replacement: &TxData, tolerance: u64) -> bool {
    if original.outputs.len() != replacement.outputs.len() {
        return false;
    }
    let mut ours: Vec<&TxOutput> = original.outputs.iter().collect();
    let mut theirs: Vec<&TxOutput> = replacement.outputs.iter().collect();
    ours.sort_by(|a, b| a.script_pubkey.cmp(&b.script_pubkey));
    theirs.sort_by(|a, b| a.script_pubkey.cmp(&b.script_pubkey));
    ours.iter()
        .zip(theirs.iter())
        .all(|(a, b)| a.script_pubkey == b.script_pubkey && a.value.abs_diff(b.value) <= tolerance)
}
