// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Coordination kernel: waitlist tickets
//!
//! Tickets serialize pipeline sections that must not overlap.  A ticket is a
//! lease on a (scope, key) pair, `vm:<uuid>` or `allocation:<server>`, with
//! at most one active holder per pair at any instant and FIFO ordering among
//! waiters.  Tickets are released on success, error, and cancel paths alike;
//! a stale active ticket past its lease is expired when the next waiter
//! checks the queue.

use crate::db::model::Ticket;
use crate::db::model::TicketScope;
use crate::db::model::TicketState;
use chrono::Utc;
use slog::Logger;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

struct Entry {
    ticket: Ticket,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct Queues {
    queues: HashMap<String, VecDeque<Entry>>,
}

pub struct Waitlist {
    log: Logger,
    lease: chrono::Duration,
    inner: Mutex<Queues>,
}

fn queue_name(scope: TicketScope, key: &str) -> String {
    format!("{}:{}", scope, key)
}

impl Waitlist {
    pub fn new(log: Logger, lease: Duration) -> Waitlist {
        Waitlist {
            log,
            lease: chrono::Duration::from_std(lease)
                .unwrap_or_else(|_| chrono::Duration::seconds(600)),
            inner: Mutex::new(Queues::default()),
        }
    }

    /// Enqueues a ticket for `holder` and waits until it reaches the front
    /// of its queue.  Waiters are woken in FIFO order.
    pub async fn acquire(
        &self,
        scope: TicketScope,
        key: &str,
        holder: Uuid,
    ) -> Ticket {
        let name = queue_name(scope, key);
        let id = Uuid::new_v4();
        let notify = Arc::new(Notify::new());
        {
            let mut inner = self.inner.lock().unwrap();
            let queue = inner.queues.entry(name.clone()).or_default();
            queue.push_back(Entry {
                ticket: Ticket {
                    id,
                    scope,
                    key: key.to_string(),
                    state: TicketState::Queued,
                    holder,
                    created_at: Utc::now(),
                    acquired_at: None,
                },
                notify: Arc::clone(&notify),
            });
            debug!(self.log, "ticket enqueued";
                "ticket" => %id, "queue" => &name, "holder" => %holder);
        }
        loop {
            // Register interest before re-checking the queue so a release
            // between the check and the await cannot be missed.
            let notified = notify.notified();
            if let Some(ticket) = self.try_activate(&name, id) {
                debug!(self.log, "ticket active";
                    "ticket" => %id, "queue" => &name);
                return ticket;
            }
            notified.await;
        }
    }

    fn try_activate(&self, name: &str, id: Uuid) -> Option<Ticket> {
        let mut inner = self.inner.lock().unwrap();
        let queue = inner.queues.get_mut(name)?;

        // Expire a stale holder whose lease ran out.
        if let Some(front) = queue.front() {
            if front.ticket.state == TicketState::Active {
                let expired = front
                    .ticket
                    .acquired_at
                    .map(|at| at + self.lease < Utc::now())
                    .unwrap_or(false);
                if expired {
                    let entry = queue.pop_front().unwrap();
                    warn!(self.log, "expiring stale ticket";
                        "ticket" => %entry.ticket.id,
                        "holder" => %entry.ticket.holder,
                        "queue" => name);
                    if let Some(next) = queue.front() {
                        next.notify.notify_one();
                    }
                }
            }
        }

        let front = queue.front_mut()?;
        if front.ticket.id != id {
            return None;
        }
        if front.ticket.state == TicketState::Queued {
            front.ticket.state = TicketState::Active;
            front.ticket.acquired_at = Some(Utc::now());
        }
        Some(front.ticket.clone())
    }

    /// Releases one ticket.  An active holder hands the queue to the next
    /// waiter; a queued waiter is simply removed.
    pub fn release(&self, ticket: &Ticket) {
        self.release_by_id(ticket.scope, &ticket.key, ticket.id);
    }

    fn release_by_id(&self, scope: TicketScope, key: &str, id: Uuid) {
        let name = queue_name(scope, key);
        let mut inner = self.inner.lock().unwrap();
        let Some(queue) = inner.queues.get_mut(&name) else { return };
        let Some(position) = queue.iter().position(|e| e.ticket.id == id)
        else {
            return;
        };
        queue.remove(position);
        debug!(self.log, "ticket released"; "ticket" => %id, "queue" => &name);
        if let Some(next) = queue.front() {
            next.notify.notify_one();
        } else {
            inner.queues.remove(&name);
        }
    }

    /// Releases every ticket held or awaited by `job`, returning how many
    /// were dropped.  Used by the reconciler as the terminal-state backstop.
    pub fn release_for_job(&self, job: Uuid) -> usize {
        let held: Vec<(TicketScope, String, Uuid)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .queues
                .values()
                .flatten()
                .filter(|e| e.ticket.holder == job)
                .map(|e| (e.ticket.scope, e.ticket.key.clone(), e.ticket.id))
                .collect()
        };
        let released = held.len();
        for (scope, key, id) in held {
            self.release_by_id(scope, &key, id);
        }
        released
    }

    /// Current queue contents for a (scope, key), front first.
    pub fn tickets(&self, scope: TicketScope, key: &str) -> Vec<Ticket> {
        let inner = self.inner.lock().unwrap();
        inner
            .queues
            .get(&queue_name(scope, key))
            .map(|q| q.iter().map(|e| e.ticket.clone()).collect())
            .unwrap_or_default()
    }
}
