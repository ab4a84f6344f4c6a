// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The VM store: persisted records and the queries over them

pub mod datastore;
pub mod filter;
pub mod model;

pub use datastore::Datastore;
