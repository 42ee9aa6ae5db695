use super::backend::{CollectiveBackend, CollectiveError, PendingReduce, Result};
use crate::tensor::{Tensor, TensorElem, TensorError};
use crossbeam::channel::{self, Receiver, Sender};
use std::any::Any;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace};

/// A message travelling between neighbouring ranks.
///
/// Payloads are type-erased on the wire and downcast on receipt, so a rank that receives data
/// from a different collective gets [`CollectiveError::PayloadMismatch`] instead of garbage.
pub type Payload = Box<dyn Any + Send>;

type Job = Box<dyn FnOnce(&RingLinks) + Send>;

/// The two channel ends a rank owns in the ring.
struct RingLinks {
    rank: usize,
    world_size: usize,
    left_rx: Receiver<Payload>, // Receive from rank - 1
    right_tx: Sender<Payload>,  // Send to rank + 1
}

impl RingLinks {
    fn left(&self) -> usize {
        (self.rank + self.world_size - 1) % self.world_size
    }

    fn right(&self) -> usize {
        (self.rank + 1) % self.world_size
    }

    /// Index of the chunk `offset` positions before this rank, modulo the world size.
    fn behind(&self, offset: usize) -> usize {
        (self.rank + self.world_size - offset % self.world_size) % self.world_size
    }

    fn send<P: Any + Send>(&self, payload: P) -> Result<()> {
        self.right_tx
            .send(Box::new(payload))
            .map_err(|_| CollectiveError::Disconnected { rank: self.right() })
    }

    fn recv<P: Any + Send>(&self) -> Result<P> {
        let payload = self
            .left_rx
            .recv()
            .map_err(|_| CollectiveError::Disconnected { rank: self.left() })?;
        payload
            .downcast::<P>()
            .map(|p| *p)
            .map_err(|_| CollectiveError::PayloadMismatch { rank: self.rank })
    }

    /// **Ring All-Reduce**: reduce-scatter followed by all-gather, `2 · (P - 1)` steps in total.
    ///
    /// The buffer is cut into `P` chunks. After the reduce-scatter each rank holds one fully
    /// reduced chunk; the all-gather then circulates those, so every rank ends with the same bits.
    fn all_reduce<T: TensorElem>(&self, data: &mut [T]) -> Result<()> {
        let total = data.len();
        let chunk_size = total.div_ceil(self.world_size);
        let bounds = |idx: usize| {
            let start = (idx * chunk_size).min(total);
            (start, (start + chunk_size).min(total))
        };

        // Phase 1: Scatter-Reduce
        for step in 0..self.world_size - 1 {
            let (start, end) = bounds(self.behind(step));
            self.send(data[start..end].to_vec())?;

            let (start, end) = bounds(self.behind(step + 1));
            let received: Vec<T> = self.recv()?;
            if received.len() != end - start {
                return Err(CollectiveError::LengthMismatch {
                    rank: self.rank,
                    expected: end - start,
                    got: received.len(),
                });
            }
            for (d, v) in data[start..end].iter_mut().zip(received) {
                *d += v;
            }
        }

        // Phase 2: All-Gather
        for step in 0..self.world_size - 1 {
            let (start, end) = bounds((self.rank + 1 + self.world_size - step) % self.world_size);
            self.send(data[start..end].to_vec())?;

            let (start, end) = bounds(self.behind(step));
            let received: Vec<T> = self.recv()?;
            if received.len() != end - start {
                return Err(CollectiveError::LengthMismatch {
                    rank: self.rank,
                    expected: end - start,
                    got: received.len(),
                });
            }
            data[start..end].copy_from_slice(&received);
        }

        Ok(())
    }

    /// Ring all-gather: each step forwards the part received in the previous one.
    fn all_gather<T: TensorElem, const RANK: usize>(
        &self,
        local: Tensor<T, RANK>,
    ) -> Result<Vec<Tensor<T, RANK>>> {
        let mut parts: Vec<Option<Tensor<T, RANK>>> = vec![None; self.world_size];
        let mut outgoing = local.clone();
        parts[self.rank] = Some(local);

        for step in 0..self.world_size - 1 {
            self.send(outgoing)?;
            let received: Tensor<T, RANK> = self.recv()?;
            parts[self.behind(step + 1)] = Some(received.clone());
            outgoing = received;
        }

        parts
            .into_iter()
            .enumerate()
            .map(|(rank, p)| p.ok_or(CollectiveError::Disconnected { rank }))
            .collect()
    }

    /// Ring broadcast: the root sends, everyone else receives and forwards until the message
    /// would return to the root.
    fn broadcast<T: TensorElem, const RANK: usize>(
        &self,
        tensor: Tensor<T, RANK>,
        root: usize,
    ) -> Result<Tensor<T, RANK>> {
        if self.world_size == 1 {
            return Ok(tensor);
        }
        if self.rank == root {
            self.send(tensor.clone())?;
            return Ok(tensor);
        }

        let received: Tensor<T, RANK> = self.recv()?;
        if self.right() != root {
            self.send(received.clone())?;
        }
        if received.shape() != tensor.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: tensor.shape().to_vec(),
                got: received.shape().to_vec(),
            }
            .into());
        }
        Ok(received)
    }
}

/// A CPU-based collective backend.
///
/// Ranks are connected in a ring by `crossbeam` channels. Each rank owns a communication worker
/// thread that runs its collectives one at a time, in the order they were issued, the way a
/// communication stream does on a GPU. Synchronous collectives are an issue followed by a wait;
/// [`CollectiveBackend::all_reduce_sum_async`] returns right after the issue.
///
/// ```rust
/// use tp_linear::distributed::{CollectiveBackend, CpuBackend};
/// use tp_linear::tensor::Tensor;
///
/// let sums = tp_linear::distributed::launch(3, |group: &CpuBackend| {
///     let t = Tensor::<f32, 1>::full([4], (group.rank() + 1) as f32);
///     group.all_reduce_sum(&t).unwrap()
/// })
/// .unwrap();
/// assert!(sums.iter().all(|s| s.data() == &[6.0; 4]));
/// ```
pub struct CpuBackend {
    rank: usize,
    world_size: usize,
    jobs: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl CpuBackend {
    /// Starts the communication worker of `rank`.
    ///
    /// `left_rx` must receive what rank `rank - 1` sends, and `right_tx` must deliver to rank
    /// `rank + 1` (both modulo `world_size`). [`CpuBackend::ring`] does this wiring.
    pub fn new(
        rank: usize,
        world_size: usize,
        left_rx: Receiver<Payload>,
        right_tx: Sender<Payload>,
    ) -> Result<Self> {
        if world_size == 0 {
            return Err(CollectiveError::EmptyGroup);
        }

        let links = RingLinks {
            rank,
            world_size,
            left_rx,
            right_tx,
        };
        let (jobs_tx, jobs_rx) = channel::unbounded::<Job>();
        let worker = thread::Builder::new()
            .name(format!("tp-comm-{rank}"))
            .spawn(move || {
                debug!(rank, world_size, "communication worker started");
                for job in jobs_rx {
                    job(&links);
                }
                debug!(rank, "communication worker stopped");
            })?;

        Ok(Self {
            rank,
            world_size,
            jobs: Some(jobs_tx),
            worker: Some(worker),
        })
    }

    /// Builds a complete group of `world_size` ranks, returned in rank order.
    pub fn ring(world_size: usize) -> Result<Vec<Self>> {
        if world_size == 0 {
            return Err(CollectiveError::EmptyGroup);
        }

        // Channel i carries rank i -> rank i + 1.
        let (txs, rxs): (Vec<_>, Vec<_>) = (0..world_size).map(|_| channel::unbounded()).unzip();
        (0..world_size)
            .map(|rank| {
                let right_tx = txs[rank].clone();
                let left_rx = rxs[(rank + world_size - 1) % world_size].clone();
                Self::new(rank, world_size, left_rx, right_tx)
            })
            .collect()
    }

    /// Queues `op` on the communication worker and returns the receiver of its result.
    fn submit<R, F>(&self, op: F) -> Result<Receiver<Result<R>>>
    where
        R: Send + 'static,
        F: FnOnce(&RingLinks) -> Result<R> + Send + 'static,
    {
        let (done_tx, done_rx) = channel::bounded(1);
        let job: Job = Box::new(move |links| {
            // The issuer may have dropped its handle; the collective still ran.
            let _ = done_tx.send(op(links));
        });
        self.jobs
            .as_ref()
            .ok_or(CollectiveError::Shutdown { rank: self.rank })?
            .send(job)
            .map_err(|_| CollectiveError::Shutdown { rank: self.rank })?;
        Ok(done_rx)
    }

    fn run<R, F>(&self, op: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&RingLinks) -> Result<R> + Send + 'static,
    {
        let rank = self.rank;
        self.submit(op)?
            .recv()
            .map_err(|_| CollectiveError::Shutdown { rank })?
    }
}

impl CollectiveBackend for CpuBackend {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum_async<T: TensorElem, const RANK: usize>(
        &self,
        tensor: Tensor<T, RANK>,
    ) -> Result<PendingReduce<T, RANK>> {
        trace!(rank = self.rank, len = tensor.size(), "issue all-reduce");
        let rank = self.rank;
        let done = self.submit(move |links| {
            let shape = *tensor.shape();
            let mut data = tensor.into_data();
            links.all_reduce(&mut data)?;
            Ok(Tensor::new(data, shape)?)
        })?;
        Ok(PendingReduce::deferred(move || {
            done.recv().map_err(|_| CollectiveError::Shutdown { rank })?
        }))
    }

    fn all_gather<T: TensorElem, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK>,
        dim: usize,
    ) -> Result<Tensor<T, RANK>> {
        if dim >= RANK {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![dim],
                shape: tensor.shape().to_vec(),
            }
            .into());
        }
        trace!(rank = self.rank, dim, "all-gather");
        let local = tensor.clone();
        let parts = self.run(move |links| links.all_gather(local))?;
        Ok(Tensor::cat(&parts, dim)?)
    }

    fn broadcast<T: TensorElem, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK>,
        root: usize,
    ) -> Result<Tensor<T, RANK>> {
        if root >= self.world_size {
            return Err(CollectiveError::InvalidRoot {
                root,
                world_size: self.world_size,
            });
        }
        trace!(rank = self.rank, root, "broadcast");
        let local = tensor.clone();
        self.run(move |links| links.broadcast(local, root))
    }
}

impl Drop for CpuBackend {
    fn drop(&mut self) {
        // Closing the queue ends the worker loop once pending collectives have run.
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for CpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuBackend")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish()
    }
}

/// Runs `f` once per rank of a fresh `world_size` ring, each on its own thread, and returns the
/// results in rank order.
///
/// Every rank thread starts with its own ambient random state and owns its backend, so a rank
/// that panics tears down its end of the ring and its peers' pending collectives fail with
/// [`CollectiveError::Disconnected`] instead of blocking. The first panic is resumed on the
/// caller once all rank threads have finished.
pub fn launch<F, R>(world_size: usize, f: F) -> Result<Vec<R>>
where
    F: Fn(&CpuBackend) -> R + Sync,
    R: Send,
{
    let backends = CpuBackend::ring(world_size)?;
    let f = &f;
    thread::scope(|s| {
        let handles = backends
            .into_iter()
            .map(|backend| {
                thread::Builder::new()
                    .name(format!("tp-rank-{}", backend.rank()))
                    .spawn_scoped(s, move || f(&backend))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join()).collect();
        Ok(outcomes
            .into_iter()
            .map(|o| o.unwrap_or_else(|e| std::panic::resume_unwind(e)))
            .collect())
    })
}
