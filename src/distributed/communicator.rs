use std::sync::Arc;

use half::f16;
use parking_lot::{Condvar, Mutex};

use super::CollectiveError;

/// Values exchanged by a collective, either full precision or fp16 compressed.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Full(Vec<f32>),
    Half(Vec<f16>),
}

impl Payload {
    pub fn compress(values: &[f32], fp16: bool) -> Self {
        if fp16 {
            Payload::Half(values.iter().map(|&v| f16::from_f32(v)).collect())
        } else {
            Payload::Full(values.to_vec())
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Full(v) => v.len(),
            Payload::Half(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_half(&self) -> bool {
        matches!(self, Payload::Half(_))
    }

    pub fn into_f32(self) -> Vec<f32> {
        match self {
            Payload::Full(v) => v,
            Payload::Half(v) => v.into_iter().map(f16::to_f32).collect(),
        }
    }

    fn zeros_like(&self) -> Self {
        match self {
            Payload::Full(v) => Payload::Full(vec![0.0; v.len()]),
            Payload::Half(v) => Payload::Half(vec![f16::ZERO; v.len()]),
        }
    }
}

/// Collective operations over a fixed group of workers running in lockstep.
/// Every member must issue the same sequence of calls with equally sized
/// payloads; a call returns once the whole group has contributed.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Elementwise sum over all members. The result keeps the precision of
    /// the contributions.
    fn all_reduce_sum(&self, payload: Payload) -> Result<Payload, CollectiveError>;

    /// Replaces every member's payload with the one held by `root`.
    fn broadcast(&self, payload: Payload, root: usize) -> Result<Payload, CollectiveError> {
        if root >= self.world_size() {
            return Err(CollectiveError::InvalidRoot(root));
        }

        let contribution = if self.rank() == root {
            payload
        } else {
            payload.zeros_like()
        };

        self.all_reduce_sum(contribution)
    }

    /// Fails every pending and future collective of the group.
    fn abort(&self);
}

/// A group of one. Every collective is the identity.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, payload: Payload) -> Result<Payload, CollectiveError> {
        Ok(payload)
    }

    fn abort(&self) {}
}

#[derive(Default)]
struct Round {
    generation: u64,
    arrived: usize,
    half: bool,
    sum: Option<Vec<f32>>,
    result: Option<Arc<Payload>>,
    aborted: bool,
}

struct Rendezvous {
    world_size: usize,
    round: Mutex<Round>,
    ready: Condvar,
}

/// Member of an in-process group: one worker thread per device, meeting at a
/// shared rendezvous for each collective.
pub struct LocalCommunicator {
    rank: usize,
    shared: Arc<Rendezvous>,
}

pub struct LocalGroup;

impl LocalGroup {
    pub fn new(world_size: usize) -> Vec<LocalCommunicator> {
        let shared = Arc::new(Rendezvous {
            world_size,
            round: Mutex::new(Round::default()),
            ready: Condvar::new(),
        });

        (0..world_size)
            .map(|rank| LocalCommunicator {
                rank,
                shared: shared.clone(),
            })
            .collect()
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_reduce_sum(&self, payload: Payload) -> Result<Payload, CollectiveError> {
        let mut guard = self.shared.round.lock();
        let round = &mut *guard;

        if round.aborted {
            return Err(CollectiveError::Aborted);
        }

        let half = payload.is_half();
        let values = payload.into_f32();

        match round.sum.as_mut() {
            None => {
                round.half = half;
                round.sum = Some(values);
            }
            Some(sum) if sum.len() == values.len() && round.half == half => {
                sum.iter_mut().zip(values).for_each(|(acc, v)| *acc += v);
            }
            Some(sum) => {
                let expected = sum.len();
                round.aborted = true;
                self.shared.ready.notify_all();
                return Err(CollectiveError::Mismatch {
                    rank: self.rank,
                    expected,
                    got: values.len(),
                });
            }
        }

        round.arrived += 1;
        let generation = round.generation;

        if round.arrived == self.shared.world_size {
            let sum = round.sum.take().unwrap_or_default();
            let result = Arc::new(Payload::compress(&sum, round.half));
            round.result = Some(result.clone());
            round.arrived = 0;
            round.generation += 1;
            self.shared.ready.notify_all();
            return Ok((*result).clone());
        }

        while guard.generation == generation && !guard.aborted {
            self.shared.ready.wait(&mut guard);
        }

        if guard.generation == generation {
            return Err(CollectiveError::Aborted);
        }

        guard
            .result
            .as_ref()
            .map(|result| (**result).clone())
            .ok_or(CollectiveError::Aborted)
    }

    fn abort(&self) {
        let mut round = self.shared.round.lock();
        round.aborted = true;
        self.shared.ready.notify_all();
    }
}
