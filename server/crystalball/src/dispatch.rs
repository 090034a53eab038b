//! Dispatch/merge controller: fan work units out to a pool of worker threads
//! and fold their partial results into one run-level `UnitResult`.
//!
//! Protocol per worker: one `Configure` (frozen `RunContext`), then any number
//! of `ProcessUnit`, each answered by exactly one `PartialResult`, then
//! `Shutdown`. Units are handed out greedily as workers go idle. Workers share
//! nothing mutable; every exchange is a message.
//!
//! Failure policy: a worker that panics, fails to open its unit, or holds one
//! unit longer than `unit_timeout` aborts the whole run with `WorkerFailure`.
//! Units are not retried.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::error::EngineError;
use crate::merge::Merge;
use crate::pipeline::{self, RunContext, UnitResult};
use crate::source::{RecordSource, WorkUnit};

/// Controller -> worker.
#[derive(Debug)]
pub enum ControlMessage {
  Configure(Arc<RunContext>),
  ProcessUnit(WorkUnit),
  Shutdown,
}

/// Worker -> controller.
#[derive(Debug)]
pub enum WorkerMessage {
  PartialResult {
    worker: usize,
    unit: WorkUnit,
    /// `RunContext::fingerprint` the worker was configured with.
    fingerprint: String,
    result: Result<UnitResult, EngineError>,
  },
  /// Sent when a worker thread exits, including by panic.
  Disconnected { worker: usize, panicked: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
  Idle,
  Configured,
  Busy(WorkUnit),
  Disconnected,
}

struct Worker {
  id: usize,
  tx: Sender<ControlMessage>,
  state: WorkerState,
  /// When the current unit was handed out.
  dispatched_at: Option<Instant>,
  handle: Option<JoinHandle<()>>,
}

impl Worker {
  fn spawn(
    id: usize,
    source: Arc<dyn RecordSource>,
    results: Sender<WorkerMessage>,
  ) -> Result<Self, EngineError> {
    let (tx, rx) = mpsc::channel();
    let handle = thread::Builder::new()
      .name(format!("crystalball-worker-{}", id))
      .spawn(move || worker_loop(id, rx, results, source))?;
    Ok(Self {
      id,
      tx,
      state: WorkerState::Idle,
      dispatched_at: None,
      handle: Some(handle),
    })
  }

  fn send(&mut self, msg: ControlMessage) -> Result<(), EngineError> {
    if self.tx.send(msg).is_err() {
      self.state = WorkerState::Disconnected;
      return Err(EngineError::worker(self.id, "worker channel closed"));
    }
    Ok(())
  }

  fn configure(&mut self, ctx: &Arc<RunContext>) -> Result<(), EngineError> {
    self.send(ControlMessage::Configure(Arc::clone(ctx)))?;
    self.state = WorkerState::Configured;
    Ok(())
  }

  fn assign(&mut self, unit: WorkUnit) -> Result<(), EngineError> {
    tracing::debug!(worker = self.id, unit = %unit, "dispatching unit");
    self.send(ControlMessage::ProcessUnit(unit.clone()))?;
    self.state = WorkerState::Busy(unit);
    self.dispatched_at = Some(Instant::now());
    Ok(())
  }
}

/// Notifies the controller when the worker thread ends, panicking or not.
struct DisconnectGuard {
  worker: usize,
  tx: Sender<WorkerMessage>,
}

impl Drop for DisconnectGuard {
  fn drop(&mut self) {
    let _ = self.tx.send(WorkerMessage::Disconnected {
      worker: self.worker,
      panicked: thread::panicking(),
    });
  }
}

fn worker_loop(
  id: usize,
  rx: Receiver<ControlMessage>,
  tx: Sender<WorkerMessage>,
  source: Arc<dyn RecordSource>,
) {
  let _guard = DisconnectGuard {
    worker: id,
    tx: tx.clone(),
  };

  let ctx = match rx.recv() {
    Ok(ControlMessage::Configure(ctx)) => ctx,
    Ok(ControlMessage::ProcessUnit(unit)) => {
      let _ = tx.send(WorkerMessage::PartialResult {
        worker: id,
        unit,
        fingerprint: String::new(),
        result: Err(EngineError::worker(id, "unit dispatched before Configure")),
      });
      return;
    }
    Ok(ControlMessage::Shutdown) | Err(_) => return,
  };
  tracing::debug!(worker = id, fingerprint = ctx.fingerprint(), "worker configured");

  while let Ok(msg) = rx.recv() {
    match msg {
      ControlMessage::ProcessUnit(unit) => {
        let result = pipeline::process_unit(&ctx, source.as_ref(), &unit);
        let reply = WorkerMessage::PartialResult {
          worker: id,
          unit,
          fingerprint: ctx.fingerprint().to_string(),
          result,
        };
        if tx.send(reply).is_err() {
          return;
        }
      }
      ControlMessage::Configure(_) => {
        tracing::warn!(worker = id, "ignoring second Configure; run context is frozen");
      }
      ControlMessage::Shutdown => break,
    }
  }
  tracing::debug!(worker = id, "worker exiting");
}

/// Runs one job: owns the frozen run context and the record source.
pub struct Controller {
  ctx: Arc<RunContext>,
  source: Arc<dyn RecordSource>,
}

impl Controller {
  pub fn new(ctx: RunContext, source: Arc<dyn RecordSource>) -> Self {
    Self {
      ctx: Arc::new(ctx),
      source,
    }
  }

  pub fn context(&self) -> &RunContext {
    &self.ctx
  }

  /// Process every unit and return the merged result.
  pub fn run(&self, units: Vec<WorkUnit>) -> Result<UnitResult, EngineError> {
    let mut queue: VecDeque<WorkUnit> = units.into();
    if queue.is_empty() {
      return Ok(UnitResult::default());
    }

    let size = self.ctx.config.workers().min(queue.len());
    tracing::info!(units = queue.len(), workers = size, "starting run");

    let (results_tx, results_rx) = mpsc::channel();
    let mut pool = Vec::with_capacity(size);
    for id in 0..size {
      pool.push(Worker::spawn(id, Arc::clone(&self.source), results_tx.clone())?);
    }
    drop(results_tx);

    let outcome = self.drive(&mut pool, &mut queue, &results_rx);
    shutdown(pool);
    let merged = outcome?;

    tracing::info!(
      units = merged.stats.units,
      records = merged.stats.records,
      dropped = merged.stats.dropped_no_channel,
      parse_errors = merged.stats.parse_errors,
      "run finished"
    );
    Ok(merged)
  }

  fn drive(
    &self,
    pool: &mut [Worker],
    queue: &mut VecDeque<WorkUnit>,
    results: &Receiver<WorkerMessage>,
  ) -> Result<UnitResult, EngineError> {
    for worker in pool.iter_mut() {
      worker.configure(&self.ctx)?;
    }

    let mut outstanding = 0usize;
    for worker in pool.iter_mut() {
      match queue.pop_front() {
        Some(unit) => {
          worker.assign(unit)?;
          outstanding += 1;
        }
        None => break,
      }
    }

    let mut acc = UnitResult::default();
    while outstanding > 0 {
      match self.next_message(pool, results)? {
        WorkerMessage::PartialResult {
          worker,
          unit,
          fingerprint,
          result,
        } => {
          let slot = pool
            .get_mut(worker)
            .ok_or_else(|| EngineError::worker(worker, "unknown worker id"))?;
          if slot.state != WorkerState::Busy(unit.clone()) {
            return Err(EngineError::worker(
              worker,
              format!("unexpected result for unit {} in state {:?}", unit, slot.state),
            ));
          }
          if fingerprint != self.ctx.fingerprint() {
            return Err(EngineError::worker(worker, "partial result from a different configuration"));
          }
          let partial = result.map_err(|e| EngineError::worker(worker, format!("unit {}: {}", unit, e)))?;
          outstanding -= 1;
          Merge::merge(&mut acc, partial);
          tracing::debug!(worker, unit = %unit, outstanding, queued = queue.len(), "merged partial result");

          match queue.pop_front() {
            Some(next) => {
              slot.assign(next)?;
              outstanding += 1;
            }
            None => {
              slot.state = WorkerState::Idle;
              slot.dispatched_at = None;
            }
          }
        }
        WorkerMessage::Disconnected { worker, panicked } => {
          let Some(slot) = pool.get_mut(worker) else {
            continue;
          };
          let previous = std::mem::replace(&mut slot.state, WorkerState::Disconnected);
          if let WorkerState::Busy(unit) = previous {
            let how = if panicked { "panicked" } else { "exited" };
            return Err(EngineError::worker(worker, format!("{} while processing unit {}", how, unit)));
          }
        }
      }
    }
    Ok(acc)
  }

  /// Wait for the next message. With `unit_timeout` set, the wait ends when
  /// the unit held longest by any worker runs out of time.
  fn next_message(
    &self,
    pool: &[Worker],
    results: &Receiver<WorkerMessage>,
  ) -> Result<WorkerMessage, EngineError> {
    let oldest = oldest_busy(pool);
    let disconnected = || EngineError::worker(oldest.map_or(0, |(id, _, _)| id), "all workers disconnected");
    let (Some(timeout), Some((worker, unit, since))) = (self.ctx.config.unit_timeout, oldest) else {
      return results.recv().map_err(|_| disconnected());
    };
    let remaining = (since + timeout).saturating_duration_since(Instant::now());
    results.recv_timeout(remaining).map_err(|e| match e {
      RecvTimeoutError::Timeout => EngineError::worker(
        worker,
        format!("no partial result for unit {} within {:?}", unit, timeout),
      ),
      RecvTimeoutError::Disconnected => disconnected(),
    })
  }
}

/// The busy worker whose unit was dispatched first.
fn oldest_busy(pool: &[Worker]) -> Option<(usize, &WorkUnit, Instant)> {
  pool
    .iter()
    .filter_map(|w| match (&w.state, w.dispatched_at) {
      (WorkerState::Busy(unit), Some(at)) => Some((w.id, unit, at)),
      _ => None,
    })
    .min_by_key(|(_, _, at)| *at)
}

/// Ask every worker to stop and join those that are not stuck mid-unit.
fn shutdown(pool: Vec<Worker>) {
  for mut worker in pool {
    let _ = worker.tx.send(ControlMessage::Shutdown);
    let Some(handle) = worker.handle.take() else {
      continue;
    };
    match worker.state {
      WorkerState::Busy(ref unit) => {
        tracing::warn!(worker = worker.id, unit = %unit, "abandoning busy worker");
      }
      _ => {
        if handle.join().is_err() {
          tracing::warn!(worker = worker.id, "worker panicked during shutdown");
        }
      }
    }
  }
}
