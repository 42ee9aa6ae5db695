#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use tp_linear::distributed::backend::Result;
use tp_linear::distributed::{CollectiveBackend, PendingReduce};
use tp_linear::tensor::{Tensor, TensorElem};
use tracing_subscriber::EnvFilter;

/// Installs a test-writer subscriber once per test binary. `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub type CallLog = Arc<Mutex<Vec<&'static str>>>;

/// A backend that records which collectives are issued instead of communicating.
///
/// Results have the right shapes but not the right values: reductions return the local tensor
/// and gathers repeat it `world_size` times.
pub struct RecordingBackend {
    pub rank: usize,
    pub world_size: usize,
    pub log: CallLog,
}

impl RecordingBackend {
    pub fn new(rank: usize, world_size: usize) -> Self {
        Self {
            rank,
            world_size,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.log.lock().unwrap().clear();
    }

    fn record(&self, call: &'static str) {
        self.log.lock().unwrap().push(call);
    }
}

impl CollectiveBackend for RecordingBackend {
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
        self.record("issue_all_reduce");
        let log = self.log.clone();
        Ok(PendingReduce::deferred(move || {
            log.lock().unwrap().push("wait_all_reduce");
            Ok(tensor)
        }))
    }

    fn all_reduce_sum<T: TensorElem, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK>,
    ) -> Result<Tensor<T, RANK>> {
        self.record("all_reduce");
        Ok(tensor.clone())
    }

    fn all_gather<T: TensorElem, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK>,
        dim: usize,
    ) -> Result<Tensor<T, RANK>> {
        self.record("all_gather");
        let parts = vec![tensor.clone(); self.world_size];
        Ok(Tensor::cat(&parts, dim)?)
    }

    fn broadcast<T: TensorElem, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK>,
        _root: usize,
    ) -> Result<Tensor<T, RANK>> {
        self.record("broadcast");
        Ok(tensor.clone())
    }
}
