//! Pause/resume hooks at named points of the donor state machine.
//!
//! A test arms a [`Checkpoint`], waits until a session reaches it, inspects
//! or mutates the world, then releases it. Gates are single-shot: the first
//! session to reach an armed point consumes the gate. Unarmed points cost one
//! lock acquisition and are recorded in the visit history.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::types::{MigrationState, SessionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Checkpoint {
    /// Entered the given donor state.
    Enter(MigrationState),
    /// A clone batch was acknowledged by the recipient.
    AfterCloneBatch,
    /// Writes to the range are blocked and the final drain is about to run.
    CriticalSection,
}

struct Gate {
    reached: watch::Sender<Option<SessionId>>,
    released: watch::Sender<bool>,
}

#[derive(Default)]
struct CheckpointsInner {
    gates: BTreeMap<Checkpoint, Arc<Gate>>,
    history: Vec<(SessionId, Checkpoint)>,
}

#[derive(Default)]
pub struct Checkpoints {
    inner: Mutex<CheckpointsInner>,
}

impl Checkpoints {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CheckpointsInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm `point`, replacing any gate still armed there.
    pub fn arm(&self, point: Checkpoint) -> PausePoint {
        let (reached, _) = watch::channel(None);
        let (released, _) = watch::channel(false);
        let gate = Arc::new(Gate { reached, released });
        self.lock().gates.insert(point, gate.clone());
        PausePoint { point, gate }
    }

    /// Every point visited so far, in order.
    pub fn history(&self) -> Vec<(SessionId, Checkpoint)> {
        self.lock().history.clone()
    }

    pub fn visited(&self, session_id: &SessionId) -> Vec<Checkpoint> {
        self.lock()
            .history
            .iter()
            .filter(|(id, _)| id == session_id)
            .map(|(_, point)| *point)
            .collect()
    }

    /// Record the visit and park if the point is armed.
    pub(crate) async fn reach(&self, session_id: &SessionId, point: Checkpoint) {
        let gate = {
            let mut inner = self.lock();
            inner.history.push((session_id.clone(), point));
            inner.gates.remove(&point)
        };
        let Some(gate) = gate else {
            return;
        };
        tracing::debug!(session_id = %session_id, point = ?point, "paused at checkpoint");
        let mut released = gate.released.subscribe();
        gate.reached.send_replace(Some(session_id.clone()));
        // The gate owns the sender, so the channel cannot close while we wait.
        let _ = released.wait_for(|released| *released).await;
    }
}

/// Handle to one armed checkpoint. Dropping it releases the gate.
pub struct PausePoint {
    point: Checkpoint,
    gate: Arc<Gate>,
}

impl PausePoint {
    pub fn point(&self) -> Checkpoint {
        self.point
    }

    /// Wait until a session parks at this point and return its id.
    pub async fn wait_reached(&self) -> SessionId {
        let mut rx = self.gate.reached.subscribe();
        loop {
            if let Some(id) = rx.borrow_and_update().clone() {
                return id;
            }
            let _ = rx.changed().await;
        }
    }

    pub fn release(&self) {
        self.gate.released.send_replace(true);
    }
}

impl Drop for PausePoint {
    fn drop(&mut self) {
        self.release();
    }
}
