// Copyright 2020 Kodebox, Inc.
// This file is part of Lattice.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::time::Duration;

use ltypes::{Amount, NetworkConstants};

/// Runtime tunables for every core subsystem, built once at startup and
/// passed around explicitly. Test networks get aggressively short timings.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub network: NetworkConstants,

    // Block processing
    pub block_processor_batch_max_time: Duration,
    pub block_processor_verification_size: usize,
    pub block_processor_full_size: usize,
    pub signature_checker_threads: usize,
    /// Backpressure log cadence for the block processor queues
    pub log_interval: Duration,
    /// Per missing dependency, how many dependents the unchecked table keeps
    pub unchecked_per_dependency_max: usize,

    // Confirmation height
    pub conf_height_batch_write_size: u64,
    pub conf_height_target_write_time: Duration,
    /// Below this many uncemented blocks the unbounded walker is preferred
    pub conf_height_unbounded_cutoff: u64,

    // Votes
    pub vote_generator_delay: Duration,
    pub vote_processor_capacity: usize,
    pub votes_cache_size: usize,
    pub votes_cache_entries_max: usize,
    pub online_weight_minimum: Amount,
    pub max_weight_samples: u64,

    // Request aggregator
    pub aggregator_small_delay: Duration,
    pub aggregator_max_delay: Duration,
    pub aggregator_max_channel_requests: usize,

    // Bootstrap
    pub bootstrap_connections: usize,
    pub bootstrap_connections_max: usize,
    pub bootstrap_fraction_numerator: u32,
    pub bootstrap_pull_retry_limit: u32,
    pub bootstrap_lazy_max_time: Duration,
    pub gap_cache_bootstrap_start_interval: Duration,
    pub disable_lazy_bootstrap: bool,
    pub disable_legacy_bootstrap: bool,
}

impl NodeConfig {
    pub fn new(network: NetworkConstants) -> NodeConfig {
        let is_test = network.is_test_network();
        NodeConfig {
            network,
            block_processor_batch_max_time: if is_test {
                Duration::from_millis(100)
            } else {
                Duration::from_millis(250)
            },
            block_processor_verification_size: 2048,
            block_processor_full_size: 65536,
            signature_checker_threads: if is_test {
                0
            } else {
                4
            },
            log_interval: if is_test {
                Duration::from_millis(500)
            } else {
                Duration::from_secs(15)
            },
            unchecked_per_dependency_max: 64,
            conf_height_batch_write_size: 16384,
            conf_height_target_write_time: Duration::from_millis(250),
            conf_height_unbounded_cutoff: 16384,
            vote_generator_delay: Duration::from_millis(100),
            vote_processor_capacity: if is_test {
                48
            } else {
                144 * 1024
            },
            votes_cache_size: 4096,
            votes_cache_entries_max: 64,
            online_weight_minimum: Amount::from(1000u64),
            max_weight_samples: if is_test {
                288
            } else {
                4032
            },
            aggregator_small_delay: if is_test {
                Duration::from_millis(10)
            } else {
                Duration::from_millis(50)
            },
            aggregator_max_delay: if is_test {
                Duration::from_millis(50)
            } else {
                Duration::from_millis(250)
            },
            aggregator_max_channel_requests: if is_test {
                8
            } else {
                4096
            },
            bootstrap_connections: 4,
            bootstrap_connections_max: if is_test {
                4
            } else {
                64
            },
            bootstrap_fraction_numerator: 1,
            bootstrap_pull_retry_limit: 16,
            bootstrap_lazy_max_time: if is_test {
                Duration::from_secs(2)
            } else {
                Duration::from_secs(7200)
            },
            gap_cache_bootstrap_start_interval: Duration::from_millis(200),
            disable_lazy_bootstrap: false,
            disable_legacy_bootstrap: false,
        }
    }

    pub fn test_default() -> NodeConfig {
        NodeConfig::new(NetworkConstants::test())
    }
}
