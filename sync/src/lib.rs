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

extern crate lattice_core as lcore;
#[macro_use]
extern crate lattice_logger as llogger;
extern crate lattice_network as lnetwork;
extern crate lattice_timer as ltimer;
extern crate lattice_types as ltypes;
#[macro_use]
extern crate log;
extern crate parking_lot;
extern crate rand;

mod attempt;
mod connections;
mod frontier;
mod lazy;
mod legacy;
mod peer;
mod pull;
mod push;
pub mod testing;
mod wallet;

pub use crate::attempt::{BootstrapAttempt, BootstrapInitiator, BootstrapMode, BootstrapStrategy};
pub use crate::connections::{BootstrapClient, BootstrapConnections, PullInfo};
pub use crate::frontier::{FrontierDiff, FrontierReqClient};
pub use crate::lazy::LazyAttempt;
pub use crate::legacy::LegacyAttempt;
pub use crate::peer::{BlockStream, BootstrapPeer, FrontierStream, PeerConnector, PeerError, PendingStream};
pub use crate::pull::{BulkPullAccountClient, BulkPullClient};
pub use crate::push::BulkPushClient;
pub use crate::wallet::WalletAttempt;
