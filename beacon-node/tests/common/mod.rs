use std::{sync::Arc, time::Duration};

use beacon_core::{
    operator::OperatorKey,
    tests::helpers::{operator_ids, operator_keys, uniform_pool},
    ChainParameters, GroupParameters, OperatorId, ProtocolTimings, Seed,
};
use beacon_node::{
    config::{BackoffPolicy, LoggingConfig},
    local::{LocalChain, LocalTransport},
    logging, GroupStatus, Node, NodeConfig, NodeError, NodeHandle,
};
use rand::SeedableRng;
use tokio::task::JoinHandle;

pub const GROUP_SIZE: u16 = 5;
pub const HONEST_THRESHOLD: u16 = 3;

pub fn timings() -> ProtocolTimings {
    ProtocolTimings {
        round_delay_blocks: 1,
        round_active_blocks: 10,
        result_signing_blocks: 5,
        submission_window_blocks: 4,
        challenge_period_blocks: 5,
        approval_precedence_blocks: 3,
        relay_entry_soft_timeout_blocks: 8,
        relay_entry_hard_timeout_blocks: 20,
        group_lifetime_blocks: 10_000,
        dkg_retry_delay_blocks: 3,
        inactivity_claim_delay_step_blocks: 1,
    }
}

fn config() -> NodeConfig {
    NodeConfig {
        retry: BackoffPolicy {
            initial_delay_ms: 5,
            max_delay_ms: 50,
            multiplier: 2,
            max_attempts: 8,
        },
        logging: LoggingConfig {
            filter: "beacon_node=debug".into(),
            ansi: false,
        },
        ..NodeConfig::default()
    }
}

/// Nodes of every operator in a pool, sharing one chain and transport.
pub struct Network {
    pub chain: LocalChain,
    pub transport: Arc<LocalTransport>,
    pub operators: Vec<OperatorId>,
    pub handles: Vec<NodeHandle>,
    tasks: Vec<JoinHandle<Result<(), NodeError>>>,
}

impl Network {
    /// A chain with a pool of `pool_size` equally weighted operators.
    pub fn new(pool_size: usize) -> (Self, Vec<OperatorKey>) {
        Self::with_threshold(pool_size, HONEST_THRESHOLD)
    }

    /// As [`Network::new`], with groups of `honest_threshold` instead of the
    /// default.
    pub fn with_threshold(pool_size: usize, honest_threshold: u16) -> (Self, Vec<OperatorKey>) {
        // Several tests install logging in the same process; only the first wins.
        let _ = logging::init(&config().logging);

        let mut rng = rand_chacha::ChaCha20Rng::seed_from_u64(pool_size as u64);
        let keys = operator_keys(pool_size, &mut rng);
        let operators = operator_ids(&keys);
        let params = ChainParameters::new(
            GroupParameters::with_default_quorum(GROUP_SIZE, honest_threshold).unwrap(),
            timings(),
        )
        .unwrap();
        let chain = LocalChain::new(params, uniform_pool(&operators, 1));
        let network = Self {
            chain,
            transport: Arc::new(LocalTransport::new()),
            operators,
            handles: Vec::new(),
            tasks: Vec::new(),
        };
        (network, keys)
    }

    /// Start a node for every key.
    pub fn start(&mut self, keys: Vec<OperatorKey>) {
        for key in keys {
            let client = self.chain.client(key.operator_id());
            let (node, handle) = Node::new(config(), key, client, self.transport.clone());
            self.tasks.push(tokio::spawn(node.run()));
            self.handles.push(handle);
        }
    }

    /// The handle of `operator`'s node.
    pub fn handle(&self, operator: &OperatorId) -> &NodeHandle {
        self.handles
            .iter()
            .find(|handle| handle.operator_id() == *operator)
            .expect("every operator runs a node")
    }

    /// Group status of every node that is a member of the group of `seed`.
    pub fn group_statuses(&self, seed: &Seed) -> Vec<(OperatorId, GroupStatus)> {
        self.handles
            .iter()
            .filter_map(|handle| {
                handle
                    .group_status(seed)
                    .map(|status| (handle.operator_id(), status))
            })
            .collect()
    }

    /// Mine blocks until `done` holds, at most `max_blocks` of them.
    pub async fn mine_until(&self, max_blocks: u64, done: impl Fn(&Self) -> bool) -> bool {
        for _ in 0..max_blocks {
            if done(self) {
                return true;
            }
            self.chain.mine();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        done(self)
    }

    /// Stop every node and wait for them.
    pub async fn shutdown(self) {
        for handle in &self.handles {
            handle.shutdown();
        }
        for task in self.tasks {
            let result = task.await.expect("node task panicked");
            assert_eq!(result, Ok(()));
        }
    }
}
