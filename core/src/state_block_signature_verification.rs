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

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

use ltypes::{Block, BlockHash, Epochs, Signature, UncheckedInfo};
use parking_lot::{Condvar, Mutex};

use crate::signatures::{SignatureCheckSet, SignatureChecker};

pub type BlocksVerifiedCallback =
    Box<dyn Fn(Vec<UncheckedInfo>, Vec<i8>, Vec<BlockHash>, Vec<Signature>) + Send + Sync>;
pub type TransitionInactiveCallback = Box<dyn Fn() + Send + Sync>;

struct State {
    state_blocks: VecDeque<UncheckedInfo>,
    stopped: bool,
    active: bool,
}

struct Shared {
    state: Mutex<State>,
    condition: Condvar,
    checker: Arc<SignatureChecker>,
    epochs: Arc<Epochs>,
    blocks_verified_callback: Mutex<Option<BlocksVerifiedCallback>>,
    transition_inactive_callback: Mutex<Option<TransitionInactiveCallback>>,
}

/// Background stage the block processor feeds its state blocks through.
/// Epoch blocks are checked against the configured epoch signer, everything
/// else against its own account key.
pub struct StateBlockSignatureVerification {
    shared: Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl StateBlockSignatureVerification {
    pub fn new(
        checker: Arc<SignatureChecker>,
        epochs: Arc<Epochs>,
        verification_size: usize,
    ) -> StateBlockSignatureVerification {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                state_blocks: VecDeque::new(),
                stopped: false,
                active: false,
            }),
            condition: Condvar::new(),
            checker,
            epochs,
            blocks_verified_callback: Mutex::new(None),
            transition_inactive_callback: Mutex::new(None),
        });
        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("state blk sig".to_string())
                .spawn(move || Self::run(&shared, verification_size))
                .unwrap()
        };
        StateBlockSignatureVerification {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    pub fn set_blocks_verified_callback(&self, callback: BlocksVerifiedCallback) {
        *self.shared.blocks_verified_callback.lock() = Some(callback);
    }

    pub fn set_transition_inactive_callback(&self, callback: TransitionInactiveCallback) {
        *self.shared.transition_inactive_callback.lock() = Some(callback);
    }

    pub fn add(&self, info: UncheckedInfo) {
        {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return
            }
            state.state_blocks.push_back(info);
        }
        self.shared.condition.notify_one();
    }

    pub fn size(&self) -> usize {
        self.shared.state.lock().state_blocks.len()
    }

    pub fn is_active(&self) -> bool {
        self.shared.state.lock().active
    }

    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stopped = true;
        }
        self.shared.condition.notify_all();
        if let Some(thread) = self.thread.lock().take() {
            thread.join().unwrap();
        }
    }

    fn run(shared: &Shared, verification_size: usize) {
        let mut state = shared.state.lock();
        while !state.stopped {
            if !state.state_blocks.is_empty() {
                let max = verification_size.max(crate::signatures::BATCH_SIZE);
                let count = state.state_blocks.len().min(max);
                let items: Vec<UncheckedInfo> = state.state_blocks.drain(..count).collect();
                state.active = true;
                drop(state);
                Self::verify_state_blocks(shared, items);
                state = shared.state.lock();
                state.active = false;
                if state.state_blocks.is_empty() {
                    drop(state);
                    if let Some(callback) = shared.transition_inactive_callback.lock().as_ref() {
                        callback();
                    }
                    state = shared.state.lock();
                }
            } else {
                shared.condition.wait(&mut state);
            }
        }
    }

    fn verify_state_blocks(shared: &Shared, items: Vec<UncheckedInfo>) {
        if items.is_empty() {
            return
        }
        let mut hashes = Vec::with_capacity(items.len());
        let mut messages = Vec::with_capacity(items.len());
        let mut pub_keys = Vec::with_capacity(items.len());
        let mut signatures = Vec::with_capacity(items.len());
        for item in &items {
            let block = item.block.as_ref();
            let hash = block.hash();
            let signer = match block {
                Block::State(state) if shared.epochs.is_epoch_link(&state.link) => {
                    let epoch = shared.epochs.epoch(&state.link).expect("Checked as an epoch link");
                    *shared.epochs.signer(epoch).expect("Registered epochs have signers")
                }
                _ => block.account_field().unwrap_or_default(),
            };
            hashes.push(hash);
            messages.push(hash);
            pub_keys.push(signer);
            signatures.push(*block.signature());
        }
        let mut check_set = SignatureCheckSet::new(messages, pub_keys, signatures.clone());
        shared.checker.verify(&mut check_set);
        if let Some(callback) = shared.blocks_verified_callback.lock().as_ref() {
            callback(items, check_set.verifications, hashes, signatures);
        }
    }
}

impl Drop for StateBlockSignatureVerification {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;
    use std::time::Duration;

    use ltypes::{Account, Amount, Link, SignatureVerification, StateBlock};

    use super::*;
    use crate::signatures::VERIFICATION_VALID;
    use crate::testing::LedgerContext;

    #[test]
    fn verifies_state_blocks_and_reports() {
        let ctx = LedgerContext::new();
        let checker = Arc::new(SignatureChecker::new(0));
        let verification = StateBlockSignatureVerification::new(checker, Arc::clone(&ctx.ledger.epochs), 2048);
        let (sender, receiver) = channel();
        verification.set_blocks_verified_callback(Box::new(move |items, verifications, hashes, _signatures| {
            sender.send((items.len(), verifications, hashes)).unwrap();
        }));

        let key = LedgerContext::keypair(10);
        let good = ctx.state_send(&ctx.genesis_key, *key.public(), Amount::from(1u64));
        verification.add(UncheckedInfo::new(good.clone(), Account::zero(), 0, SignatureVerification::Unknown));

        let (count, verifications, hashes) = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(count, 1);
        assert_eq!(verifications, vec![VERIFICATION_VALID]);
        assert_eq!(hashes, vec![good.hash()]);
        verification.stop();
    }

    #[test]
    fn epoch_blocks_check_against_epoch_signer() {
        let ctx = LedgerContext::new();
        let checker = Arc::new(SignatureChecker::new(0));
        let verification = StateBlockSignatureVerification::new(checker, Arc::clone(&ctx.ledger.epochs), 2048);
        let (sender, receiver) = channel();
        verification.set_blocks_verified_callback(Box::new(move |_, verifications, _, _| {
            sender.send(verifications).unwrap();
        }));

        let genesis = *ctx.genesis_key.public();
        let upgrade = ctx.epoch_upgrade(&genesis, ltypes::Epoch::Epoch1);
        verification.add(UncheckedInfo::new(upgrade, Account::zero(), 0, SignatureVerification::Unknown));
        let verifications = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        // Signed by the epoch signer, not the account, and still valid
        assert_eq!(verifications, vec![VERIFICATION_VALID]);
        verification.stop();
    }

    #[test]
    fn bad_signature_is_flagged() {
        let ctx = LedgerContext::new();
        let checker = Arc::new(SignatureChecker::new(0));
        let verification = StateBlockSignatureVerification::new(checker, Arc::clone(&ctx.ledger.epochs), 2048);
        let (sender, receiver) = channel();
        verification.set_blocks_verified_callback(Box::new(move |_, verifications, _, _| {
            sender.send(verifications).unwrap();
        }));

        let wrong = LedgerContext::keypair(30);
        let forged = Arc::new(Block::State(StateBlock::new(
            *ctx.genesis_key.public(),
            BlockHash::from_low_u64_be(1),
            *ctx.genesis_key.public(),
            Amount::from(1u64),
            Link::zero(),
            wrong.secret(),
            0,
        )));
        verification.add(UncheckedInfo::new(forged, Account::zero(), 0, SignatureVerification::Unknown));
        let verifications = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(verifications, vec![crate::signatures::VERIFICATION_INVALID]);
        verification.stop();
    }
}
