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

extern crate ctrlc;
extern crate lattice_core as lcore;
#[macro_use]
extern crate lattice_logger as llogger;
extern crate lattice_network as lnetwork;
extern crate lattice_sync as lsync;
extern crate lattice_timer as ltimer;
extern crate lattice_types as ltypes;
#[macro_use]
extern crate log;

mod node;

use std::env;
use std::sync::mpsc::channel;

use ltypes::NetworkConstants;

use crate::node::Node;

fn network_from_env() -> NetworkConstants {
    match env::var("LATTICE_NETWORK").as_deref() {
        Ok("live") => NetworkConstants::live(),
        Ok("beta") => NetworkConstants::beta(),
        _ => NetworkConstants::test(),
    }
}

fn main() {
    llogger::init(&llogger::LoggerConfig::new(0)).expect("Logger initializes once");
    let constants = network_from_env();
    linfo!(CLIENT, "Starting lattice node on the {:?} network", constants.network);

    let node = Node::start(constants);

    let (interrupt_sender, interrupt_receiver) = channel();
    ctrlc::set_handler(move || {
        let _ = interrupt_sender.send(());
    })
    .expect("Handler installs once");
    interrupt_receiver.recv().expect("Interrupt sender outlives the wait");

    linfo!(SHUTDOWN, "Interrupted, stopping node");
    node.stop();
}
