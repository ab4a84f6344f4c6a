// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Integration tests against a running vmapi server with simulated
//! collaborators

mod common;
mod fabric;
mod jobs;
mod migrate;
mod queries;
mod tags;
mod vms;
