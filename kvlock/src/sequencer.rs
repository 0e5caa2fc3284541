//! Orders acquisition passes issued by one manager.
//!
//! Each lane is a FIFO: a pass waits until every pass queued before it in
//! the same lane has finished, whatever way it finished. Lanes are created on
//! first use and dropped once nobody is running or waiting in them.

use crate::{config::Sequencing, Result};
use parking_lot::Mutex;
use std::{collections::HashMap, future::Future, sync::Arc};
use tracing::{trace, warn};

const GLOBAL_LANE: &str = "";

#[derive(Debug, Default)]
struct Lane {
    turn: tokio::sync::Mutex<()>,
}

#[derive(Debug, Default)]
pub struct Sequencer {
    scope: Sequencing,
    lanes: Arc<Mutex<HashMap<String, Arc<Lane>>>>,
}

impl Sequencer {
    pub fn new(scope: Sequencing) -> Self {
        Self {
            scope,
            lanes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn scope(&self) -> Sequencing {
        self.scope
    }

    /// Number of lanes currently holding a running or queued pass.
    pub fn active_lanes(&self) -> usize {
        self.lanes.lock().len()
    }

    /// Runs `pass` once every earlier pass in `name`'s lane has completed.
    ///
    /// A failed pass is logged here and its error handed back to this
    /// caller only; the lane moves on to the next pass either way.
    pub async fn run<F, T>(&self, name: &str, pass: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let ticket = self.enter(name);
        let result = {
            let _turn = ticket.lane.turn.lock().await;
            trace!(lane = %ticket.key, "Running pass");
            pass.await
        };
        if let Err(e) = &result {
            warn!(lane = %ticket.key, error = %e, "Acquisition pass failed");
        }
        result
    }

    fn enter(&self, name: &str) -> LaneTicket {
        let key = match self.scope {
            Sequencing::PerName => name.to_string(),
            Sequencing::Global => GLOBAL_LANE.to_string(),
        };
        let lane = self.lanes.lock().entry(key.clone()).or_default().clone();
        LaneTicket {
            key,
            lane,
            lanes: self.lanes.clone(),
        }
    }
}

/// A caller's place in a lane. Dropping the last ticket of a lane removes
/// the lane, including when the pass panicked or its future was dropped.
struct LaneTicket {
    key: String,
    lane: Arc<Lane>,
    lanes: Arc<Mutex<HashMap<String, Arc<Lane>>>>,
}

impl Drop for LaneTicket {
    fn drop(&mut self) {
        let mut lanes = self.lanes.lock();
        // One reference in the map, one here: nobody else is queued.
        if Arc::strong_count(&self.lane) == 2 {
            lanes.remove(&self.key);
        }
    }
}
