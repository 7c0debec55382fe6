/*!
 * Deferred Calls
 *
 * Fire-and-forget jobs run on dedicated worker threads. The done flag is
 * stored with release ordering after the reply is complete and read with
 * acquire ordering, so a poller that sees `true` also sees the result.
 */

use super::types::Reply;
use crate::core::errors::{AgentError, Result, RpcErrno};
use crate::core::handles::{AtomicGenerator, IdGenerator};
use crate::core::types::JobId;
use ahash::HashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

struct Job {
    name: &'static str,
    done: Arc<AtomicBool>,
    handle: JoinHandle<Reply>,
}

/// Jobs started in fire-and-forget mode and not yet collected
pub struct DeferredJobs {
    jobs: Mutex<HashMap<JobId, Job>>,
    ids: AtomicGenerator<u64>,
}

impl DeferredJobs {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::default()),
            ids: AtomicGenerator::new(1),
        }
    }

    /// Start `work` on a worker thread and return its job id
    pub fn spawn<F>(&self, name: &'static str, work: F) -> Result<JobId>
    where
        F: FnOnce(JobId) -> Reply + Send + 'static,
    {
        let id = self.ids.next();
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);

        let handle = std::thread::Builder::new()
            .name(format!("rpc-job-{}", id))
            .spawn(move || {
                let reply = work(id);
                flag.store(true, Ordering::Release);
                reply
            })
            .map_err(|e| AgentError::rpc(RpcErrno::NoMemory, format!("cannot start worker: {}", e)))?;

        self.jobs.lock().insert(id, Job { name, done, handle });
        debug!(jobid = id, rpc = name, "deferred call started");
        Ok(id)
    }

    /// Non-blocking completion check; None for an unknown job
    pub fn is_done(&self, id: JobId) -> Option<bool> {
        self.jobs.lock().get(&id).map(|job| job.done.load(Ordering::Acquire))
    }

    /// Wait for the job and take its reply
    pub fn join(&self, id: JobId) -> Result<Reply> {
        let job = self
            .jobs
            .lock()
            .remove(&id)
            .ok_or_else(|| AgentError::rpc(RpcErrno::NoEntry, format!("no deferred call {}", id)))?;

        match job.handle.join() {
            Ok(reply) => {
                debug!(jobid = id, rpc = job.name, "deferred call collected");
                Ok(reply)
            }
            Err(_) => {
                warn!(jobid = id, rpc = job.name, "deferred call panicked");
                Ok(Reply::error(RpcErrno::Unknown, format!("{} panicked", job.name)))
            }
        }
    }

    /// Forget the job; it keeps running and its reply is dropped
    pub fn cancel(&self, id: JobId) -> bool {
        match self.jobs.lock().remove(&id) {
            Some(job) => {
                info!(jobid = id, rpc = job.name, "deferred call detached");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DeferredJobs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::types::RpcOutput;
    use std::time::Duration;

    #[test]
    fn test_spawn_poll_join() {
        let jobs = DeferredJobs::new();
        let id = jobs
            .spawn("test", |id| {
                std::thread::sleep(Duration::from_millis(50));
                Reply {
                    output: RpcOutput::Count(id),
                    ..Reply::default()
                }
            })
            .unwrap();

        assert_eq!(jobs.is_done(id), Some(false));
        let reply = jobs.join(id).unwrap();
        assert_eq!(reply.output, RpcOutput::Count(id));
        assert_eq!(jobs.is_done(id), None);
    }

    #[test]
    fn test_unknown_job() {
        let jobs = DeferredJobs::new();
        assert_eq!(jobs.is_done(77), None);
        assert!(jobs.join(77).is_err());
        assert!(!jobs.cancel(77));
    }

    #[test]
    fn test_cancel_detaches() {
        let jobs = DeferredJobs::new();
        let id = jobs.spawn("test", |_| Reply::default()).unwrap();
        assert!(jobs.cancel(id));
        assert!(jobs.is_empty());
    }
}
