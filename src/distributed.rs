//! Gradient synchronization between data-parallel training workers.
//!
//! Every worker calls [`Collective::all_reduce`] exactly once per training
//! step, even when its local computation failed, so no worker is left waiting
//! on a barrier. A failed worker contributes a poisoned (non-finite)
//! contribution, which makes the reduced result non-finite on every rank.

use std::sync::{Arc, Barrier};

use ndarray::{ArrayD, Zip};
use parking_lot::Mutex;

use crate::denoiser::ParamSet;
use crate::error::{Error, Result};

/// Loss and gradients of one worker, or their average over all workers.
#[derive(Debug, Clone, PartialEq)]
pub struct Reduction {
    /// Mean loss.
    pub loss: f64,
    /// Mean gradients.
    pub grads: ParamSet,
}

impl Reduction {
    /// A contribution that marks a failed local step.
    #[must_use]
    pub fn poisoned(layout: &ParamSet) -> Self {
        let mut grads = layout.zeros_like();
        for (_, tensor) in grads.iter_mut() {
            tensor.fill(f32::NAN);
        }
        Self {
            loss: f64::NAN,
            grads,
        }
    }
}

/// Collective operations over a fixed group of training workers.
pub trait Collective: Send + Sync {
    /// Index of this worker in `0..world_size`.
    fn rank(&self) -> usize;

    /// Number of workers in the group.
    fn world_size(&self) -> usize;

    /// Replace `params` on every rank with rank 0's copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the ranks disagree on the parameter layout.
    fn broadcast(&self, params: &mut ParamSet) -> Result<()>;

    /// Average loss and gradients over all ranks.
    ///
    /// `step` is this worker's step counter; all ranks must pass the same
    /// value. Every rank receives an identical result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockstepViolation`] if the step counters differ, or
    /// [`Error::ShapeMismatch`] if gradient layouts differ.
    fn all_reduce(&self, step: u64, local: Reduction) -> Result<Reduction>;
}

/// A group of one.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn broadcast(&self, _params: &mut ParamSet) -> Result<()> {
        Ok(())
    }

    fn all_reduce(&self, _step: u64, local: Reduction) -> Result<Reduction> {
        Ok(local)
    }
}

struct Contribution {
    step: u64,
    reduction: Reduction,
}

struct Shared {
    barrier: Barrier,
    slots: Vec<Mutex<Option<Contribution>>>,
    broadcast: Mutex<Option<ParamSet>>,
}

/// Shared-memory group for workers running as threads of one process.
///
/// Each rank writes its contribution into its own slot, waits on the barrier,
/// reduces all slots in rank order, then waits again before the slots can be
/// reused by the next step.
#[derive(Clone)]
pub struct LocalGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LocalGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalGroup")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish_non_exhaustive()
    }
}

impl LocalGroup {
    /// Create one handle per rank. Hand each handle to its worker thread.
    ///
    /// # Errors
    ///
    /// Returns an error if `world_size` is zero.
    pub fn new(world_size: usize) -> Result<Vec<Self>> {
        if world_size == 0 {
            return Err(Error::config("world_size", "must be greater than 0"));
        }

        let shared = Arc::new(Shared {
            barrier: Barrier::new(world_size),
            slots: (0..world_size).map(|_| Mutex::new(None)).collect(),
            broadcast: Mutex::new(None),
        });

        Ok((0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect())
    }

    /// Reduce every slot in rank order.
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn reduce_slots(&self, step: u64) -> Result<Reduction> {
        let slots: Vec<_> = self.shared.slots.iter().map(|slot| slot.lock()).collect();

        let mut contributions = Vec::with_capacity(self.world_size);
        for (rank, slot) in slots.iter().enumerate() {
            let contribution = slot.as_ref().ok_or_else(|| Error::LockstepViolation {
                rank,
                expected: step,
                found: u64::MAX,
            })?;
            contributions.push(contribution);
        }

        let expected = contributions[0].step;
        if let Some((rank, c)) = contributions
            .iter()
            .enumerate()
            .find(|(_, c)| c.step != expected)
        {
            return Err(Error::LockstepViolation {
                rank,
                expected,
                found: c.step,
            });
        }

        let layout = &contributions[0].reduction.grads;
        if let Some(c) = contributions
            .iter()
            .find(|c| !c.reduction.grads.same_layout(layout))
        {
            return Err(Error::shape(
                format!("{} gradient tensors", layout.len()),
                c.reduction.grads.len(),
            ));
        }

        let world = self.world_size as f64;
        let loss = contributions.iter().map(|c| c.reduction.loss).sum::<f64>() / world;

        let grads = layout
            .iter()
            .map(|(name, tensor)| {
                let mut acc = ArrayD::<f64>::zeros(tensor.raw_dim());
                for c in &contributions {
                    if let Some(g) = c.reduction.grads.get(name) {
                        Zip::from(&mut acc)
                            .and(g)
                            .for_each(|a, &v| *a += f64::from(v));
                    }
                }
                (name.to_string(), acc.mapv(|v| (v / world) as f32))
            })
            .collect();

        Ok(Reduction { loss, grads })
    }
}

impl Collective for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn broadcast(&self, params: &mut ParamSet) -> Result<()> {
        if self.rank == 0 {
            *self.shared.broadcast.lock() = Some(params.clone());
        }
        self.shared.barrier.wait();

        let result = match self.shared.broadcast.lock().as_ref() {
            Some(source) if source.same_layout(params) => {
                if self.rank != 0 {
                    params.clone_from(source);
                }
                Ok(())
            }
            Some(source) => Err(Error::shape(
                format!("{} parameter tensors", source.len()),
                params.len(),
            )),
            None => Err(Error::shape("broadcast parameters", "none")),
        };

        self.shared.barrier.wait();
        if self.rank == 0 {
            *self.shared.broadcast.lock() = None;
        }
        result
    }

    fn all_reduce(&self, step: u64, local: Reduction) -> Result<Reduction> {
        *self.shared.slots[self.rank].lock() = Some(Contribution {
            step,
            reduction: local,
        });
        self.shared.barrier.wait();

        let result = self.reduce_slots(step);

        // Nobody may overwrite a slot until every rank has read all of them.
        self.shared.barrier.wait();
        result
    }
}
