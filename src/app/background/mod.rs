// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common facilities for background tasks

pub mod reconciler;

use futures::future::BoxFuture;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// A periodically activated background task.  `activate` returns a status
/// value that lands in the debug log.
pub trait BackgroundTask: Send + Sync {
    fn activate<'a>(&'a self) -> BoxFuture<'a, serde_json::Value>;
}

/// Drives registered background tasks on their periods; dropping the
/// driver stops them.
pub struct Driver {
    log: Logger,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Driver {
    pub fn new(log: Logger) -> Driver {
        Driver { log, tasks: Vec::new() }
    }

    pub fn register(
        &mut self,
        name: &'static str,
        period: Duration,
        imp: Arc<dyn BackgroundTask>,
    ) {
        let log = self.log.new(o!("background_task" => name));
        self.tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut iteration: u64 = 0;
            loop {
                interval.tick().await;
                iteration += 1;
                let status = imp.activate().await;
                debug!(log, "activated";
                    "iteration" => iteration,
                    "status" => %status);
            }
        }));
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
