//! Stale candidate analysis: spots same-height block races near the tip and
//! classifies transaction conflicts between the competing branches.

mod candidate;

pub use candidate::{BranchSummary, Conflict, StaleCandidate};

use anyhow::Result;
use candidate::classify;
use config::Config;
use forkscout_common::alerts::{AlertSink, Finding};
use forkscout_common::{BlockHash, BlockVerbosity, ReplicaRpc, TxData};
use forkscout_graph::BlockGraph;
use std::collections::BTreeMap;
use tracing::{debug, info, info_span, warn};

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StaleConfig {
    /// Trailing heights below the fleet best scanned for races.
    pub stale_window: u64,
    /// Branch depth considered for conflict classification.
    pub double_spend_range: u64,
    /// Most recent candidates re-examined per pass.
    pub max_candidates: usize,
    /// Per-output value slack for treating a conflict as a fee bump.
    pub rbf_tolerance: u64,
}

impl StaleConfig {
    pub fn try_load(config: &Config) -> Result<Self> {
        let full_config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config.clone())
            .build()?;
        Ok(full_config.try_deserialize()?)
    }
}

/// Tracks block races and their conflict classification across passes.
pub struct StaleCandidateAnalyzer {
    config: StaleConfig,
    candidates: BTreeMap<u64, StaleCandidate>,
}

impl StaleCandidateAnalyzer {
    pub fn new(config: StaleConfig) -> Self {
        Self {
            config,
            candidates: BTreeMap::new(),
        }
    }

    pub fn candidates(&self) -> impl Iterator<Item = &StaleCandidate> {
        self.candidates.values()
    }

    pub fn candidate_at(&self, height: u64) -> Option<&StaleCandidate> {
        self.candidates.get(&height)
    }

    /// Record new same-height races within the trailing window. One
    /// candidate per contiguous race, and none where the contest is a
    /// validity dispute rather than a propagation race.
    pub fn scan(&mut self, graph: &BlockGraph, alerts: &AlertSink) {
        let Some(best) = graph.best_height() else {
            return;
        };
        let span = info_span!("stale_scan", best);
        let _guard = span.enter();
        let floor = best.saturating_sub(self.config.stale_window);
        for height in (floor + 1)..=best {
            let contenders = graph.blocks_at_height(height).len();
            if contenders < 2 {
                continue;
            }
            if graph.blocks_at_height(height.saturating_sub(1)).len() > 1 {
                continue;
            }
            if Self::disputed_at(graph, height) {
                debug!(height, "contested height is a validity dispute, not a race");
                continue;
            }
            if self.candidates.contains_key(&height) {
                continue;
            }
            info!(height, contenders, "new stale candidate");
            self.candidates.insert(height, StaleCandidate::new(height));
            alerts.raise(Finding::StaleCandidate {
                height,
                branch_count: contenders,
            });
        }
    }

    fn disputed_at(graph: &BlockGraph, height: u64) -> bool {
        graph.blocks_at_height(height).iter().any(|h| {
            graph
                .get(h)
                .is_some_and(|b| !b.marked_valid_by.is_empty() && !b.marked_invalid_by.is_empty())
        })
    }

    /// Fetch verbose bodies for candidate branch blocks that lack them.
    /// Fetch failures are left for the next pass.
    pub async fn fetch_transactions(&self, graph: &mut BlockGraph, rpc: &dyn ReplicaRpc) {
        for height in self.recent_heights() {
            let mut wanted: Vec<BlockHash> = Vec::new();
            for root in graph.blocks_at_height(height).to_vec() {
                wanted.push(root);
                if let Ok(descendants) = graph.descendants(&root, self.config.double_spend_range) {
                    wanted.extend(descendants);
                }
            }
            for hash in wanted {
                let needs = graph
                    .get(&hash)
                    .is_some_and(|b| !b.has_transactions() && !b.headers_only && !b.pruned);
                if !needs {
                    continue;
                }
                match rpc.get_block(&hash, BlockVerbosity::WithTransactions).await {
                    Ok(data) => {
                        if let Some(txs) = data.transactions {
                            if let Err(e) = graph.attach_transactions(&hash, txs) {
                                warn!(%hash, error = %e, "failed to attach transactions");
                            }
                        }
                    }
                    Err(e) => warn!(%hash, error = %e, "failed to fetch block transactions"),
                }
            }
        }
    }

    /// Rebuild branches and classify conflicts for the most recent
    /// candidates whose window saw new blocks since the last pass.
    pub fn process(&mut self, graph: &BlockGraph) {
        let Some(best) = graph.best_height() else {
            return;
        };
        for height in self.recent_heights() {
            let Some(candidate) = self.candidates.get_mut(&height) else {
                continue;
            };
            if let Some(processed) = candidate.height_processed {
                if processed >= best || processed > height + self.config.stale_window {
                    continue;
                }
            }
            Self::process_candidate(candidate, graph, best, &self.config);
        }
    }

    fn recent_heights(&self) -> Vec<u64> {
        self.candidates
            .keys()
            .rev()
            .take(self.config.max_candidates)
            .copied()
            .collect()
    }

    fn process_candidate(
        candidate: &mut StaleCandidate,
        graph: &BlockGraph,
        best: u64,
        config: &StaleConfig,
    ) {
        let limit = candidate.height + config.double_spend_range;
        let mut roots: Vec<BlockHash> = graph.blocks_at_height(candidate.height).to_vec();
        roots.sort();
        candidate.branches = roots
            .iter()
            .map(|root| trace_branch(graph, *root, limit))
            .collect();

        candidate.confirmed_in_one_branch.clear();
        candidate.confirmed_in_one_branch_total = 0;
        candidate.double_spent_in_one_branch.clear();
        candidate.double_spent_total = 0;
        candidate.rbf.clear();
        candidate.rbf_total = 0;
        candidate.missing_transactions = false;

        if candidate.branches.len() != 2 {
            debug!(
                height = candidate.height,
                branches = candidate.branches.len(),
                "conflict classification needs exactly two branches"
            );
            candidate.height_processed = Some(best);
            return;
        }
        let mut ordered: Vec<&BranchSummary> = candidate.branches.iter().collect();
        ordered.sort_by_key(|b| b.length);
        let (shortest, longest) = (ordered[0], ordered[1]);
        let equal_length = shortest.length == longest.length;

        let (Some(shortest_txs), Some(longest_txs)) = (
            branch_transactions(graph, shortest),
            branch_transactions(graph, longest),
        ) else {
            debug!(height = candidate.height, "branch transaction data incomplete");
            candidate.missing_transactions = true;
            candidate.height_processed = None;
            return;
        };

        let result = classify(&shortest_txs, &longest_txs, equal_length, config.rbf_tolerance);
        candidate.confirmed_in_one_branch = result.confirmed_in_one_branch;
        candidate.confirmed_in_one_branch_total = result.confirmed_total;
        candidate.double_spent_in_one_branch = result.double_spent;
        candidate.double_spent_total = result.double_spent_total;
        candidate.rbf = result.rbf;
        candidate.rbf_total = result.rbf_total;
        candidate.height_processed = Some(best);
    }
}

/// Follow the most-worked child path from `root`, stopping at `limit`.
fn trace_branch(graph: &BlockGraph, root: BlockHash, limit: u64) -> BranchSummary {
    let mut blocks = vec![root];
    let mut current = root;
    while let Some(block) = graph.get(&current) {
        let next = block
            .children
            .iter()
            .filter_map(|child| graph.get(child))
            .filter(|child| child.height <= limit)
            .max_by(|a, b| (a.work.as_ref(), a.hash).cmp(&(b.work.as_ref(), b.hash)));
        match next {
            Some(child) => {
                blocks.push(child.hash);
                current = child.hash;
            }
            None => break,
        }
    }
    let tip = blocks.last().copied().unwrap_or(root);
    BranchSummary {
        root,
        tip,
        length: blocks.len(),
        blocks,
    }
}

/// All transactions on a branch, or None when any block's data is missing.
fn branch_transactions<'g>(
    graph: &'g BlockGraph,
    branch: &BranchSummary,
) -> Option<Vec<&'g TxData>> {
    let mut txs = Vec::new();
    for hash in &branch.blocks {
        let block = graph.get(hash)?;
        if block.headers_only {
            return None;
        }
        let block_txs = block.transactions.as_deref()?;
        if block_txs.is_empty() {
            return None;
        }
        txs.extend(block_txs);
    }
    Some(txs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkscout_common::{BlockData, ChainWork, OutPoint, ReplicaId, TxOutput};
    use forkscout_test_utils::{hash, txid, MockReplica};

    fn test_config() -> StaleConfig {
        StaleConfig {
            stale_window: 100,
            double_spend_range: 30,
            max_candidates: 3,
            rbf_tolerance: 10_000,
        }
    }

    fn data(n: u8, height: u64, parent: Option<u8>) -> BlockData {
        BlockData {
            hash: hash(n),
            height,
            previous_block_hash: parent.map(hash),
            chain_work: Some(ChainWork::from(height + 1)),
            time: 1_600_000_000 + height,
            median_time: None,
            version: 0x2000_0000,
            tx_count: 1,
            size: 250,
            transactions: None,
        }
    }

    fn tx(id: u8, spends: &[(u8, u32)], outputs: &[(u64, &[u8])]) -> TxData {
        TxData {
            txid: txid(id),
            inputs: spends
                .iter()
                .map(|&(t, vout)| OutPoint { txid: txid(t), vout })
                .collect(),
            outputs: outputs
                .iter()
                .map(|&(value, script)| TxOutput {
                    value,
                    script_pubkey: script.to_vec(),
                })
                .collect(),
            coinbase_tag: None,
        }
    }

    /// Chain 1-2-3 at heights 100-102 with blocks 4 and 5 racing at 103.
    fn forked_graph() -> BlockGraph {
        let mut graph = BlockGraph::new(100);
        graph.upsert_block(&data(1, 100, None), None).unwrap();
        graph.upsert_block(&data(2, 101, Some(1)), None).unwrap();
        graph.upsert_block(&data(3, 102, Some(2)), None).unwrap();
        graph.upsert_block(&data(4, 103, Some(3)), None).unwrap();
        graph.upsert_block(&data(5, 103, Some(3)), None).unwrap();
        graph
    }

    #[test]
    fn records_one_candidate_per_race() {
        let mut graph = forked_graph();
        // The race continues at 104 on both sides
        graph.upsert_block(&data(6, 104, Some(4)), None).unwrap();
        graph.upsert_block(&data(7, 104, Some(5)), None).unwrap();

        let alerts = AlertSink::new();
        let mut rx = alerts.subscribe();
        let mut analyzer = StaleCandidateAnalyzer::new(test_config());
        analyzer.scan(&graph, &alerts);

        assert!(analyzer.candidate_at(103).is_some());
        assert!(analyzer.candidate_at(104).is_none());
        assert_eq!(
            rx.try_recv().unwrap(),
            Finding::StaleCandidate {
                height: 103,
                branch_count: 2
            }
        );
        // A second pass adds nothing
        analyzer.scan(&graph, &alerts);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn validity_dispute_is_not_a_race() {
        let mut graph = forked_graph();
        graph.mark_valid(&hash(4), ReplicaId(1)).unwrap();
        graph.mark_invalid(&hash(4), ReplicaId(2)).unwrap();

        let alerts = AlertSink::new();
        let mut analyzer = StaleCandidateAnalyzer::new(test_config());
        analyzer.scan(&graph, &alerts);

        assert!(analyzer.candidate_at(103).is_none());
    }

    #[test]
    fn classifies_conflicts_between_two_branches() {
        let mut graph = forked_graph();
        // Branch rooted at 5 grows one block; branch rooted at 4 stays short
        graph.upsert_block(&data(6, 104, Some(5)), None).unwrap();
        graph
            .attach_transactions(
                &hash(4),
                vec![
                    tx(10, &[], &[(5_000_000_000, b"miner-a")]),
                    tx(11, &[(81, 0)], &[(2_000, b"unique")]),
                    tx(12, &[(90, 0)], &[(5_000, b"victim")]),
                    tx(13, &[(91, 0)], &[(100_000, b"payee")]),
                    tx(14, &[(82, 0)], &[(1_000, b"shared")]),
                ],
            )
            .unwrap();
        graph
            .attach_transactions(
                &hash(5),
                vec![
                    tx(20, &[], &[(5_000_000_000, b"miner-b")]),
                    tx(14, &[(82, 0)], &[(1_000, b"shared")]),
                ],
            )
            .unwrap();
        graph
            .attach_transactions(
                &hash(6),
                vec![
                    tx(21, &[], &[(5_000_000_000, b"miner-b")]),
                    tx(22, &[(90, 0)], &[(5_000, b"thief")]),
                    tx(23, &[(91, 0)], &[(99_500, b"payee")]),
                ],
            )
            .unwrap();

        let alerts = AlertSink::new();
        let mut analyzer = StaleCandidateAnalyzer::new(test_config());
        analyzer.scan(&graph, &alerts);
        analyzer.process(&graph);

        let candidate = analyzer.candidate_at(103).unwrap();
        assert_eq!(candidate.branches.len(), 2);
        assert_eq!(candidate.height_processed, Some(104));
        assert!(!candidate.missing_transactions);
        assert_eq!(
            candidate.confirmed_in_one_branch,
            vec![txid(10), txid(11), txid(12), txid(13)]
        );
        assert_eq!(
            candidate.double_spent_in_one_branch,
            vec![
                Conflict { original: txid(12), replacement: txid(22), amount: 5_000 },
                Conflict { original: txid(13), replacement: txid(23), amount: 100_000 },
            ]
        );
        assert_eq!(
            candidate.rbf,
            vec![Conflict { original: txid(13), replacement: txid(23), amount: 100_000 }]
        );
    }

    #[test]
    fn missing_transactions_defer_classification() {
        let mut graph = forked_graph();
        graph
            .attach_transactions(&hash(4), vec![tx(10, &[], &[(5_000_000_000, b"miner-a")])])
            .unwrap();

        let alerts = AlertSink::new();
        let mut analyzer = StaleCandidateAnalyzer::new(test_config());
        analyzer.scan(&graph, &alerts);
        analyzer.process(&graph);

        let candidate = analyzer.candidate_at(103).unwrap();
        assert!(candidate.missing_transactions);
        assert_eq!(candidate.height_processed, None);
        assert!(candidate.confirmed_in_one_branch.is_empty());

        // Data arrives; the next pass classifies
        graph
            .attach_transactions(&hash(5), vec![tx(20, &[], &[(5_000_000_000, b"miner-b")])])
            .unwrap();
        analyzer.process(&graph);
        let candidate = analyzer.candidate_at(103).unwrap();
        assert!(!candidate.missing_transactions);
        assert_eq!(candidate.height_processed, Some(103));
        assert_eq!(candidate.confirmed_in_one_branch, vec![txid(10), txid(20)]);
    }

    #[test]
    fn three_roots_skip_conflict_classification() {
        let mut graph = forked_graph();
        graph.upsert_block(&data(6, 103, Some(3)), None).unwrap();
        for n in [4u8, 5, 6] {
            graph
                .attach_transactions(&hash(n), vec![tx(n + 10, &[], &[(1_000, b"miner")])])
                .unwrap();
        }

        let alerts = AlertSink::new();
        let mut analyzer = StaleCandidateAnalyzer::new(test_config());
        analyzer.scan(&graph, &alerts);
        analyzer.process(&graph);

        let candidate = analyzer.candidate_at(103).unwrap();
        assert_eq!(candidate.branches.len(), 3);
        assert!(candidate.confirmed_in_one_branch.is_empty());
        assert!(candidate.double_spent_in_one_branch.is_empty());
        assert_eq!(candidate.height_processed, Some(103));
    }

    #[test]
    fn reprocesses_when_a_branch_grows() {
        let mut graph = forked_graph();
        for n in [4u8, 5] {
            graph
                .attach_transactions(&hash(n), vec![tx(n + 10, &[], &[(1_000, b"miner")])])
                .unwrap();
        }
        let alerts = AlertSink::new();
        let mut analyzer = StaleCandidateAnalyzer::new(test_config());
        analyzer.scan(&graph, &alerts);
        analyzer.process(&graph);
        assert_eq!(
            analyzer.candidate_at(103).unwrap().branches[0].length,
            1
        );

        graph.upsert_block(&data(6, 104, Some(4)), None).unwrap();
        graph
            .attach_transactions(&hash(6), vec![tx(16, &[], &[(1_000, b"miner")])])
            .unwrap();
        analyzer.process(&graph);
        let candidate = analyzer.candidate_at(103).unwrap();
        assert_eq!(candidate.branches[0].length, 2);
        assert_eq!(candidate.branches[0].tip, hash(6));
        assert_eq!(candidate.height_processed, Some(104));
    }

    #[tokio::test]
    async fn fetches_missing_branch_transactions() {
        let mut graph = forked_graph();
        let replica = MockReplica::new();
        replica.add_block(4, 103, Some(3));
        replica.add_block(5, 103, Some(3));
        replica.set_transactions(&hash(4), vec![tx(10, &[], &[(1_000, b"miner-a")])]);
        replica.set_transactions(&hash(5), vec![tx(20, &[], &[(1_000, b"miner-b")])]);

        let alerts = AlertSink::new();
        let mut analyzer = StaleCandidateAnalyzer::new(test_config());
        analyzer.scan(&graph, &alerts);
        analyzer.fetch_transactions(&mut graph, &replica).await;

        assert!(graph.get(&hash(4)).unwrap().has_transactions());
        assert!(graph.get(&hash(5)).unwrap().has_transactions());
        analyzer.process(&graph);
        assert_eq!(analyzer.candidate_at(103).unwrap().height_processed, Some(103));
    }
}
