//! Runs the optimizer off the caller's task.
//!
//! Requests travel to a worker task over a channel, each tagged with an id.
//! Replies come back on a shared channel and a supervisor routes them to the
//! waiting caller through the pending table, so any number of conversions
//! can be in flight from the same client.
//!
//! The supervisor also sends a periodic no-op probe and listens on the fault
//! channel. A faulted worker is discarded, its outstanding requests fail
//! with `WorkerUnavailable`, and a fresh worker takes over. There is no
//! per-request timeout.

use crate::{
    context::PipelineContext,
    models::media_type::MediaType,
    services::optimizer::{
        self, Compressed, CompressionTarget, ImageEncoder, OptimizeError, ResizeMode,
    },
};
use image::DynamicImage;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, RwLock, mpsc, oneshot},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

const QUEUE_DEPTH: usize = 32;

/// One conversion request.
pub struct OptimizeJob {
    pub image: DynamicImage,
    pub mode: ResizeMode,
    pub target: CompressionTarget,
}

enum WorkerMessage {
    Optimize { id: u64, job: OptimizeJob },
    Ping,
}

struct WorkerReply {
    id: u64,
    result: Result<Compressed, OptimizeError>,
}

struct WorkerFault {
    generation: u64,
    reason: String,
}

struct Pending {
    generation: u64,
    reply: oneshot::Sender<Result<Compressed, OptimizeError>>,
}

struct WorkerHandle {
    generation: u64,
    sender: mpsc::Sender<WorkerMessage>,
}

#[derive(Clone)]
pub struct OptimizerClient {
    shared: Arc<Shared>,
}

struct Shared {
    ctx: PipelineContext,
    encoder: Arc<dyn ImageEncoder>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Pending>>,
    worker: RwLock<WorkerHandle>,
    replies: mpsc::UnboundedSender<WorkerReply>,
    faults: mpsc::UnboundedSender<WorkerFault>,
}

impl OptimizerClient {
    /// Start a worker and its supervisor. Both stop when `ctx` shuts down.
    pub fn spawn(
        ctx: PipelineContext,
        encoder: Arc<dyn ImageEncoder>,
        probe_interval: Duration,
    ) -> Self {
        let (replies, reply_rx) = mpsc::unbounded_channel();
        let (faults, fault_rx) = mpsc::unbounded_channel();
        let sender = start_worker(
            0,
            encoder.clone(),
            replies.clone(),
            faults.clone(),
            ctx.shutdown_token(),
        );
        ctx.set_optimizer_alive(true);

        let shared = Arc::new(Shared {
            ctx,
            encoder,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            worker: RwLock::new(WorkerHandle {
                generation: 0,
                sender,
            }),
            replies,
            faults,
        });
        tokio::spawn(supervise(shared.clone(), reply_rx, fault_rx, probe_interval));
        info!("optimizer worker started");
        Self { shared }
    }

    /// The type every successful conversion produces.
    pub fn media_type(&self) -> MediaType {
        self.shared.encoder.media_type()
    }

    /// Submit a conversion and wait for its result.
    pub async fn submit(&self, job: OptimizeJob) -> Result<Compressed, OptimizeError> {
        if self.shared.ctx.is_shut_down() {
            return Err(OptimizeError::WorkerUnavailable);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (generation, sender) = {
            let worker = self.shared.worker.read().await;
            (worker.generation, worker.sender.clone())
        };
        let (reply, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .await
            .insert(id, Pending { generation, reply });

        // the supervisor fails everything pending once it sees the cancel;
        // an entry made after that pass would never be answered
        if self.shared.ctx.is_shut_down() {
            self.shared.pending.lock().await.remove(&id);
            return Err(OptimizeError::WorkerUnavailable);
        }

        if sender
            .send(WorkerMessage::Optimize { id, job })
            .await
            .is_err()
        {
            self.shared.pending.lock().await.remove(&id);
            return Err(OptimizeError::WorkerUnavailable);
        }
        debug!(id, generation, "optimize request queued");

        rx.await.unwrap_or(Err(OptimizeError::WorkerUnavailable))
    }
}

fn start_worker(
    generation: u64,
    encoder: Arc<dyn ImageEncoder>,
    replies: mpsc::UnboundedSender<WorkerReply>,
    faults: mpsc::UnboundedSender<WorkerFault>,
    shutdown: CancellationToken,
) -> mpsc::Sender<WorkerMessage> {
    let (tx, mut rx) = mpsc::channel(QUEUE_DEPTH);
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            let (id, job) = match message {
                WorkerMessage::Ping => {
                    trace!(generation, "probe");
                    continue;
                }
                WorkerMessage::Optimize { id, job } => (id, job),
            };

            let encoder = encoder.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                optimizer::optimize(&job.image, job.mode, &job.target, encoder.as_ref())
            })
            .await;

            match outcome {
                Ok(result) => {
                    let _ = replies.send(WorkerReply { id, result });
                }
                Err(err) => {
                    // refuse new work, then answer whatever was queued behind
                    // the crash; the supervisor may already have failed the
                    // pending entries of this generation
                    rx.close();
                    while let Some(message) = rx.recv().await {
                        if let WorkerMessage::Optimize { id, .. } = message {
                            let _ = replies.send(WorkerReply {
                                id,
                                result: Err(OptimizeError::WorkerUnavailable),
                            });
                        }
                    }
                    let _ = faults.send(WorkerFault {
                        generation,
                        reason: err.to_string(),
                    });
                    return;
                }
            }
        }
        debug!(generation, "optimizer worker stopped");
    });
    tx
}

async fn supervise(
    shared: Arc<Shared>,
    mut replies: mpsc::UnboundedReceiver<WorkerReply>,
    mut faults: mpsc::UnboundedReceiver<WorkerFault>,
    probe_interval: Duration,
) {
    let shutdown = shared.ctx.shutdown_token();
    let mut probe = tokio::time::interval(probe_interval);
    probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // replies first: a worker sends its last reply before its fault
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(reply) = replies.recv() => shared.deliver(reply).await,
            Some(fault) = faults.recv() => shared.restart(fault).await,
            _ = probe.tick() => shared.probe().await,
        }
    }

    shared.fail_pending(|_| true).await;
    debug!("optimizer supervisor stopped");
}

impl Shared {
    async fn deliver(&self, reply: WorkerReply) {
        match self.pending.lock().await.remove(&reply.id) {
            Some(pending) => {
                let _ = pending.reply.send(reply.result);
            }
            None => debug!(id = reply.id, "reply for a request nobody is waiting on"),
        }
    }

    async fn probe(&self) {
        // fire and forget; faults surface on the fault channel
        let worker = self.worker.read().await;
        let _ = worker.sender.try_send(WorkerMessage::Ping);
    }

    async fn restart(&self, fault: WorkerFault) {
        let mut worker = self.worker.write().await;
        if worker.generation != fault.generation {
            return;
        }
        warn!(
            generation = fault.generation,
            reason = %fault.reason,
            "optimizer worker faulted, replacing it"
        );
        self.ctx.set_optimizer_alive(false);

        let next = fault.generation + 1;
        worker.sender = start_worker(
            next,
            self.encoder.clone(),
            self.replies.clone(),
            self.faults.clone(),
            self.ctx.shutdown_token(),
        );
        worker.generation = next;
        drop(worker);

        self.fail_pending(|generation| generation == fault.generation)
            .await;
        if !self.ctx.is_shut_down() {
            self.ctx.set_optimizer_alive(true);
        }
    }

    async fn fail_pending(&self, matches: impl Fn(u64) -> bool) {
        let mut pending = self.pending.lock().await;
        let ids: Vec<u64> = pending
            .iter()
            .filter(|(_, p)| matches(p.generation))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(p) = pending.remove(&id) {
                let _ = p.reply.send(Err(OptimizeError::WorkerUnavailable));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::optimizer::EncodeError;
    use crate::services::optimizer::tests::LinearEncoder;

    /// Panics on 13-pixel-wide images, otherwise `quality * 1000` bytes.
    struct FragileEncoder;

    impl ImageEncoder for FragileEncoder {
        fn media_type(&self) -> MediaType {
            MediaType::Jpeg
        }

        fn encode(&self, image: &DynamicImage, quality: f32) -> Result<Vec<u8>, EncodeError> {
            assert_ne!(image.width(), 13, "simulated encoder crash");
            Ok(vec![0u8; (quality * 1000.0) as usize])
        }
    }

    fn job(edge: u32, min_bytes: usize, max_bytes: usize) -> OptimizeJob {
        OptimizeJob {
            image: DynamicImage::new_rgb8(32, 32),
            mode: ResizeMode::Crop,
            target: CompressionTarget::square(edge, min_bytes, max_bytes),
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_correlated() {
        let ctx = PipelineContext::new(4);
        let client = OptimizerClient::spawn(
            ctx.clone(),
            Arc::new(LinearEncoder::new(1000.0)),
            DEFAULT_PROBE_INTERVAL,
        );
        assert!(ctx.optimizer_alive());

        let (small, window, low) = tokio::join!(
            client.submit(job(8, 2000, 3000)),
            client.submit(job(8, 600, 800)),
            client.submit(job(8, 100, 300)),
        );

        let small = small.unwrap();
        assert_eq!(small.quality, optimizer::MAX_QUALITY);
        assert_eq!(small.attempts, 1);
        assert!((600..=800).contains(&window.unwrap().size()));
        assert!(low.unwrap().size() <= 300);

        ctx.shutdown();
    }

    #[tokio::test]
    async fn test_faulted_worker_is_replaced() {
        let ctx = PipelineContext::new(4);
        let client = OptimizerClient::spawn(
            ctx.clone(),
            Arc::new(FragileEncoder),
            DEFAULT_PROBE_INTERVAL,
        );

        let crashed = client.submit(job(13, 600, 800)).await;
        assert_eq!(crashed.unwrap_err(), OptimizeError::WorkerUnavailable);

        let recovered = client.submit(job(8, 600, 800)).await.unwrap();
        assert!((600..=800).contains(&recovered.size()));
        assert!(ctx.optimizer_alive());

        ctx.shutdown();
    }

    #[tokio::test]
    async fn test_crashed_worker_answers_queued_requests() {
        let (replies, mut reply_rx) = mpsc::unbounded_channel();
        let (faults, mut fault_rx) = mpsc::unbounded_channel();
        let sender = start_worker(
            7,
            Arc::new(FragileEncoder),
            replies,
            faults,
            CancellationToken::new(),
        );

        // both queued before the worker task first runs
        sender
            .try_send(WorkerMessage::Optimize {
                id: 1,
                job: job(13, 600, 800),
            })
            .unwrap_or_else(|_| panic!("queue full"));
        sender
            .try_send(WorkerMessage::Optimize {
                id: 2,
                job: job(8, 600, 800),
            })
            .unwrap_or_else(|_| panic!("queue full"));

        let fault = fault_rx.recv().await.unwrap();
        assert_eq!(fault.generation, 7);

        let reply = reply_rx.recv().await.unwrap();
        assert_eq!(reply.id, 2);
        assert_eq!(reply.result.unwrap_err(), OptimizeError::WorkerUnavailable);

        // nothing can be queued on the dead worker any more
        assert!(
            sender
                .send(WorkerMessage::Optimize {
                    id: 3,
                    job: job(8, 600, 800),
                })
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let ctx = PipelineContext::new(4);
        let client = OptimizerClient::spawn(
            ctx.clone(),
            Arc::new(LinearEncoder::new(1000.0)),
            Duration::from_millis(10),
        );
        ctx.shutdown();

        assert_eq!(
            client.submit(job(8, 600, 800)).await.unwrap_err(),
            OptimizeError::WorkerUnavailable
        );
    }
}
