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

extern crate crossbeam_channel;
extern crate kvdb;
extern crate kvdb_memorydb;
extern crate lattice_key as lkey;
#[macro_use]
extern crate lattice_logger as llogger;
extern crate lattice_network as lnetwork;
extern crate lattice_timer as ltimer;
extern crate lattice_types as ltypes;
extern crate linked_hash_map;
#[macro_use]
extern crate log;
extern crate parking_lot;
extern crate rand;
extern crate rlp;

mod block_processor;
mod config;
mod confirmation_height;
mod confirmation_solicitor;
mod election;
mod gap_cache;
mod ledger;
mod online_reps;
mod rep_weights;
mod request_aggregator;
mod signatures;
mod state_block_signature_verification;
mod store;
pub mod testing;
mod vote_processor;
mod voting;
mod write_queue;

pub use crate::block_processor::{BlockObserver, BlockProcessor, BlockProcessorObservers};
pub use crate::config::NodeConfig;
pub use crate::confirmation_height::{
    AlreadyCementedObserver, CementedObserver, ConfirmationHeightMode, ConfirmationHeightProcessor,
};
pub use crate::confirmation_solicitor::ConfirmationSolicitor;
pub use crate::election::{ActiveTransactions, Election, Representative, RepresentativesProvider, VoteInfo};
pub use crate::gap_cache::{BootstrapStarter, GapCache, GapInformation};
pub use crate::ledger::{seconds_since_epoch, Ledger, ProcessResult};
pub use crate::online_reps::OnlineReps;
pub use crate::rep_weights::RepWeights;
pub use crate::request_aggregator::RequestAggregator;
pub use crate::signatures::{
    SignatureCheckSet, SignatureChecker, BATCH_SIZE, VERIFICATION_INVALID, VERIFICATION_UNKNOWN, VERIFICATION_VALID,
};
pub use crate::state_block_signature_verification::{
    BlocksVerifiedCallback, StateBlockSignatureVerification, TransitionInactiveCallback,
};
pub use crate::store::{ReadTransaction, Store, Transaction, WriteTransaction};
pub use crate::vote_processor::{VoteCode, VoteObserver, VoteProcessor};
pub use crate::voting::{VoteGenerator, VoteGeneratorSession, VoteSink, VotesCache};
pub use crate::write_queue::{WriteDatabaseQueue, WriteGuard, Writer};
