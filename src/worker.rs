//! Resident pipeline behind a request queue.
//!
//! Loading a pipeline takes seconds to minutes, so service surfaces keep it
//! alive on a dedicated blocking thread and feed it requests through an
//! mpsc channel with oneshot replies. Requests are processed strictly
//! sequentially — the same single-worker semantics the batch tools get for
//! free by being one process per run.
//!
//! # Example
//!
//! ```no_run
//! use mediagen::worker::Worker;
//!
//! #[tokio::main]
//! async fn main() {
//!     let worker = Worker::spawn(|n: u32| Ok(n * 2));
//!     let doubled = worker.submit(21).await.unwrap();
//!     assert_eq!(doubled, 42);
//! }
//! ```

use candle_core::Device;
use tokio::sync::{mpsc, oneshot};

use crate::{Error, Result};

struct Job<Req, Resp> {
    request: Req,
    reply: oneshot::Sender<Result<Resp>>,
}

/// Handle for submitting requests to a resident worker.
pub struct Worker<Req, Resp> {
    tx: mpsc::Sender<Job<Req, Resp>>,
}

impl<Req, Resp> Clone for Worker<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<Req, Resp> Worker<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Spawn the worker loop on a blocking thread.
    ///
    /// `serve` owns the pipeline; it is called once per request, in
    /// submission order. The loop ends when every handle is dropped.
    pub fn spawn<F>(mut serve: F) -> Self
    where
        F: FnMut(Req) -> Result<Resp> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Job<Req, Resp>>(64);
        tokio::task::spawn_blocking(move || {
            while let Some(job) = rx.blocking_recv() {
                let result = serve(job.request);
                // Ignore send errors — the caller may have given up.
                let _ = job.reply.send(result);
            }
            tracing::info!("worker shut down");
        });
        Self { tx }
    }

    /// Submit a request and wait for its result.
    pub async fn submit(&self, request: Req) -> Result<Resp> {
        let (reply_tx, reply_rx) = oneshot::channel::<Result<Resp>>();
        self.tx
            .send(Job {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Worker("worker has shut down".into()))?;

        reply_rx
            .await
            .map_err(|_| Error::Worker("worker dropped reply channel".into()))?
    }
}

/// Return the preferred device: CUDA if available, otherwise CPU.
pub fn preferred_device(cuda_ordinal: usize) -> Device {
    Device::cuda_if_available(cuda_ordinal).unwrap_or(Device::Cpu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_worker_round_trip() {
        let worker = Worker::spawn(|n: u64| Ok(n + 1));
        assert_eq!(worker.submit(1).await.unwrap(), 2);
        assert_eq!(worker.submit(41).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_worker_propagates_errors() {
        let worker = Worker::spawn(|_: ()| -> Result<()> {
            Err(Error::Worker("boom".into()))
        });
        let err = worker.submit(()).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_worker_preserves_order() {
        let worker = Worker::spawn(|n: u32| Ok(n));
        let mut results = Vec::new();
        for n in 0..16 {
            results.push(worker.submit(n).await.unwrap());
        }
        assert_eq!(results, (0..16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_worker_survives_handle_clone_drop() {
        let worker = Worker::spawn(|n: u32| Ok(n * 10));
        let clone = worker.clone();
        drop(worker);
        assert_eq!(clone.submit(3).await.unwrap(), 30);
    }
}
