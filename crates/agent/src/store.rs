//! In-process session table.
//!
//! Each session id owns a slot guarded by its own async mutex, so turns for
//! one call are serialized while different calls proceed in parallel. A
//! closed session leaves a tombstone behind so a late webhook retry is
//! answered from the terminal status instead of starting a fresh call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use callquote_core::domain::session::{Session, SessionId, SessionStatus};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug)]
enum SlotState {
    Vacant,
    Live(Box<Session>),
    Closed { status: SessionStatus, closed_at: DateTime<Utc> },
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    evicted: bool,
}

/// Exclusive access to one session id for the duration of a turn.
pub struct SessionLease {
    id: SessionId,
    guard: OwnedMutexGuard<Slot>,
}

impl SessionLease {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn session(&self) -> Option<&Session> {
        match &self.guard.state {
            SlotState::Live(session) => Some(session),
            _ => None,
        }
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        match &mut self.guard.state {
            SlotState::Live(session) => Some(session),
            _ => None,
        }
    }

    /// Terminal status left behind by a session that already closed.
    pub fn closed_status(&self) -> Option<SessionStatus> {
        match self.guard.state {
            SlotState::Closed { status, .. } => Some(status),
            _ => None,
        }
    }

    pub fn is_vacant(&self) -> bool {
        matches!(self.guard.state, SlotState::Vacant)
    }

    /// Places a fresh session in the slot, replacing whatever was there.
    pub fn insert(&mut self, session: Session) {
        self.guard.state = SlotState::Live(Box::new(session));
    }

    /// Removes the live session and leaves a tombstone with its status.
    pub fn close(&mut self) -> Option<Session> {
        let state = std::mem::replace(&mut self.guard.state, SlotState::Vacant);
        match state {
            SlotState::Live(session) => {
                self.guard.state = SlotState::Closed { status: session.status, closed_at: Utc::now() };
                Some(*session)
            }
            other => {
                self.guard.state = other;
                None
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct SweepReport {
    /// Sessions that went idle and were marked abandoned.
    pub abandoned: Vec<Session>,
    pub evicted: usize,
}

#[derive(Default)]
pub struct SessionStore {
    slots: Mutex<HashMap<SessionId, Arc<Mutex<Slot>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `id`, creating an empty slot if needed.
    pub async fn acquire(&self, id: &SessionId) -> SessionLease {
        loop {
            let slot = {
                let mut slots = self.slots.lock().await;
                slots
                    .entry(id.clone())
                    .or_insert_with(|| {
                        Arc::new(Mutex::new(Slot { state: SlotState::Vacant, evicted: false }))
                    })
                    .clone()
            };
            let guard = slot.lock_owned().await;
            if guard.evicted {
                continue;
            }
            return SessionLease { id: id.clone(), guard };
        }
    }

    /// Number of slots holding a live session, counting slots leased right now.
    pub async fn live_count(&self) -> usize {
        let slots = self.slots.lock().await;
        slots
            .values()
            .filter(|slot| match slot.try_lock() {
                Ok(guard) => matches!(guard.state, SlotState::Live(_)),
                Err(_) => true,
            })
            .count()
    }

    /// Marks a live session abandoned, e.g. when the carrier reports hangup.
    pub async fn abandon(&self, id: &SessionId) -> Option<Session> {
        let mut lease = self.acquire(id).await;
        let session = lease.session_mut()?;
        if let Err(error) = session.transition_to(SessionStatus::Abandoned) {
            warn!(
                event_name = "session.abandon_rejected",
                correlation_id = %id,
                error = %error,
                "session could not be marked abandoned"
            );
            return None;
        }
        info!(event_name = "session.abandoned", correlation_id = %id, "caller hung up mid-conversation");
        lease.close()
    }

    /// Abandons sessions idle longer than `max_idle` and evicts tombstones
    /// and empty slots of the same age. Slots leased by an in-flight turn
    /// are skipped.
    pub async fn sweep_idle(&self, max_idle: Duration) -> SweepReport {
        let max_idle = chrono::Duration::from_std(max_idle).unwrap_or_else(|_| chrono::Duration::days(3650));
        let now = Utc::now();
        let mut report = SweepReport::default();
        let mut slots = self.slots.lock().await;

        let mut evict = Vec::new();
        for (id, slot) in slots.iter() {
            let Ok(mut guard) = slot.clone().try_lock_owned() else {
                continue;
            };
            match &mut guard.state {
                SlotState::Live(session) if now - session.last_activity_at >= max_idle => {
                    if session.transition_to(SessionStatus::Abandoned).is_ok() {
                        report.abandoned.push((**session).clone());
                    }
                    guard.state = SlotState::Closed { status: SessionStatus::Abandoned, closed_at: now };
                }
                SlotState::Live(_) => {}
                SlotState::Closed { closed_at, .. } if now - *closed_at >= max_idle => {
                    guard.evicted = true;
                    evict.push(id.clone());
                }
                SlotState::Closed { .. } => {}
                SlotState::Vacant => {
                    guard.evicted = true;
                    evict.push(id.clone());
                }
            }
        }
        for id in &evict {
            slots.remove(id);
        }
        report.evicted = evict.len();

        if !report.abandoned.is_empty() || report.evicted > 0 {
            info!(
                event_name = "session.sweep_completed",
                abandoned = report.abandoned.len(),
                evicted = report.evicted,
                remaining = slots.len(),
                "idle session sweep finished"
            );
        } else {
            debug!(event_name = "session.sweep_completed", remaining = slots.len(), "nothing to sweep");
        }
        report
    }
}
