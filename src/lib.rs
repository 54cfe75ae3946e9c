/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/lib.rs
*
* Library root of the Samsahai operator. The binary in `main.rs` only wires
* these modules to a live cluster; everything it runs is reachable from here
* so the state machines can be driven in-process by the tests.
*
* SPDX-License-Identifier: Apache-2.0
*/

pub mod admission;
pub mod clock;
pub mod config_controller;
pub mod context;
pub mod crds;
pub mod deploy_engine;
pub mod deploy_queue;
pub mod environment;
pub mod errors;
pub mod history;
pub mod image_checker;
pub mod metrics;
pub mod ordering;
pub mod reporter;
pub mod settings;
pub mod store;
pub mod test_runner;
pub mod timeout;

pub mod controllers {
    pub mod active_promotion_controller;
    pub mod pull_request_queue_controller;
    pub mod pull_request_trigger_controller;
    pub mod queue_controller;
    pub mod utils;
}

#[cfg(test)]
mod testing;
