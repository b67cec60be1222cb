use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::debug;

use crate::graph::Scheduler;

/// One OS thread of the graph worker pool.
///
/// The main thread bootstraps the first cycle; after that every thread runs
/// the same loop.
pub(crate) struct GraphThread {
    id: usize,
    is_main: bool,
    scheduler: Arc<Scheduler>,
}

impl GraphThread {
    pub(crate) fn new(id: usize, is_main: bool, scheduler: Arc<Scheduler>) -> Self {
        Self {
            id,
            is_main,
            scheduler,
        }
    }

    pub(crate) fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("graph-worker-{}", self.id))
            .spawn(move || self.run())
    }

    fn run(self) {
        debug!(id = self.id, main = self.is_main, "graph thread started");
        if self.is_main {
            self.scheduler.main_loop();
        } else {
            self.scheduler.worker_loop();
        }
        debug!(id = self.id, "graph thread exiting");
    }
}
