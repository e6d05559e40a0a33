//! One task per source, sharing a cancellation token.

use log::{error, info};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{PollJob, RunExit};

pub struct Scheduler {
    tasks: JoinSet<(String, RunExit)>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            tasks: JoinSet::new(),
            cancel,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn spawn(&mut self, job: Arc<dyn PollJob>) {
        let cancel = self.cancel.child_token();
        info!("spawning source {}", job.source_id());
        self.tasks.spawn(async move {
            let exit = job.run(cancel).await;
            (job.source_id().to_string(), exit)
        });
    }

    /// Wait for every job to end on its own (finished) or through the token.
    /// A panicking job is logged and does not affect its siblings.
    pub async fn join(mut self) -> Vec<(String, RunExit)> {
        let mut exits = Vec::new();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((source_id, exit)) => {
                    info!("source {} exited: {:?}", source_id, exit);
                    exits.push((source_id, exit));
                }
                Err(e) => error!("source task failed: {}", e),
            }
        }
        exits
    }

    /// Cancel every job and wait for all of them.
    pub async fn shutdown(self) -> Vec<(String, RunExit)> {
        info!("shutting down {} sources", self.tasks.len());
        self.cancel.cancel();
        self.join().await
    }
}
