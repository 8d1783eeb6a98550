//! Peer identity admission and seat reservation.
//!
//! The pool holds every identity not currently in use. In open mode an
//! admitted peer receives the next free identity regardless of what it
//! claimed; in seat mode a peer must claim an identity that was reserved
//! for it beforehand.

use easycom_protocol::PeerId;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;

/// Largest supported number of concurrent connections.
pub const MAX_CONNECTIONS_LIMIT: usize = 32_000;

/// Why a handshake was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("identity {0} is already connected")]
    Duplicate(PeerId),

    #[error("identity {0} has no reserved seat")]
    Unexpected(PeerId),

    #[error("no free identity available")]
    Exhausted,
}

#[derive(Debug)]
struct Pool {
    capacity: usize,
    free: VecDeque<PeerId>,
    seats: HashSet<PeerId>,
    assigned: HashSet<PeerId>,
    slots: usize,
}

impl Pool {
    fn refill(&mut self) {
        self.free = (0..self.capacity as PeerId).collect();
        self.seats.clear();
        self.assigned.clear();
    }
}

/// Identity pool, seat set and connection slot counter of one server.
#[derive(Debug)]
pub struct Admission {
    seat_mode: bool,
    pool: Mutex<Pool>,
}

/// A connection slot, held from accept until the connection is gone.
///
/// Dropping the slot frees it.
#[derive(Debug)]
pub struct Slot {
    admission: Arc<Admission>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        let mut pool = self.admission.pool.lock();
        pool.slots = pool.slots.saturating_sub(1);
    }
}

impl Admission {
    /// Creates a pool of `max_connections` identities, capped at
    /// [`MAX_CONNECTIONS_LIMIT`].
    pub fn new(max_connections: usize, seat_mode: bool) -> Self {
        let capacity = max_connections.min(MAX_CONNECTIONS_LIMIT);
        if capacity < max_connections {
            tracing::warn!(
                "Cannot serve more than {} concurrent connections, using {}",
                MAX_CONNECTIONS_LIMIT,
                capacity
            );
        }

        let mut pool = Pool {
            capacity,
            free: VecDeque::new(),
            seats: HashSet::new(),
            assigned: HashSet::new(),
            slots: 0,
        };
        pool.refill();

        Self {
            seat_mode,
            pool: Mutex::new(pool),
        }
    }

    pub fn seat_mode(&self) -> bool {
        self.seat_mode
    }

    pub fn capacity(&self) -> usize {
        self.pool.lock().capacity
    }

    /// Claims a connection slot, or `None` when every slot is taken.
    pub fn try_acquire_slot(self: &Arc<Self>) -> Option<Slot> {
        let mut pool = self.pool.lock();
        if pool.slots >= pool.capacity {
            return None;
        }
        pool.slots += 1;
        Some(Slot {
            admission: self.clone(),
        })
    }

    /// Decides which identity a handshaking peer that claimed `claimed`
    /// is admitted under.
    pub fn admit(&self, claimed: PeerId) -> Result<PeerId, AdmissionError> {
        let mut pool = self.pool.lock();

        if !self.seat_mode {
            let id = pool.free.pop_front().ok_or(AdmissionError::Exhausted)?;
            pool.assigned.insert(id);
            return Ok(id);
        }

        if pool.assigned.contains(&claimed) {
            return Err(AdmissionError::Duplicate(claimed));
        }
        if !pool.seats.remove(&claimed) {
            return Err(AdmissionError::Unexpected(claimed));
        }
        pool.assigned.insert(claimed);
        Ok(claimed)
    }

    /// Returns the identity of a disconnected peer to the pool.
    pub fn reclaim(&self, peer: PeerId) {
        let mut pool = self.pool.lock();
        if pool.assigned.remove(&peer) {
            pool.free.push_back(peer);
        }
    }

    /// Takes an identity out of the pool and reserves it for a future peer.
    pub fn reserve_seat(&self) -> Option<PeerId> {
        let mut pool = self.pool.lock();
        let id = pool.free.pop_front()?;
        pool.seats.insert(id);
        Some(id)
    }

    /// Cancels a reservation and returns the identity to the pool.
    pub fn release_seat(&self, peer: PeerId) -> bool {
        let mut pool = self.pool.lock();
        if pool.seats.remove(&peer) {
            pool.free.push_back(peer);
            true
        } else {
            false
        }
    }

    pub fn is_reserved(&self, peer: PeerId) -> bool {
        self.pool.lock().seats.contains(&peer)
    }

    /// Reserved identities, in ascending order.
    pub fn reserved_seats(&self) -> Vec<PeerId> {
        let mut seats: Vec<_> = self.pool.lock().seats.iter().copied().collect();
        seats.sort_unstable();
        seats
    }

    pub fn free_identities(&self) -> usize {
        self.pool.lock().free.len()
    }

    pub fn active_slots(&self) -> usize {
        self.pool.lock().slots
    }

    /// Drops every seat and assignment and refills the pool.
    pub fn reset(&self) {
        self.pool.lock().refill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_mode_assigns_from_pool() {
        let admission = Admission::new(3, false);
        assert_eq!(admission.admit(500), Ok(0));
        assert_eq!(admission.admit(500), Ok(1));
        assert_eq!(admission.admit(-1), Ok(2));
        assert_eq!(admission.admit(0), Err(AdmissionError::Exhausted));

        admission.reclaim(1);
        assert_eq!(admission.admit(9), Ok(1));
    }

    #[test]
    fn test_slots_bound_connections() {
        let admission = Arc::new(Admission::new(2, false));
        let first = admission.try_acquire_slot().unwrap();
        let _second = admission.try_acquire_slot().unwrap();
        assert!(admission.try_acquire_slot().is_none());

        drop(first);
        assert_eq!(admission.active_slots(), 1);
        assert!(admission.try_acquire_slot().is_some());
    }

    #[test]
    fn test_seat_admitted_once() {
        let admission = Admission::new(4, true);
        let seat = admission.reserve_seat().unwrap();
        assert!(admission.is_reserved(seat));

        assert_eq!(admission.admit(seat), Ok(seat));
        assert!(!admission.is_reserved(seat));
        assert_eq!(admission.admit(seat), Err(AdmissionError::Duplicate(seat)));
    }

    #[test]
    fn test_unreserved_identity_rejected() {
        let admission = Admission::new(4, true);
        assert_eq!(admission.admit(3), Err(AdmissionError::Unexpected(3)));
    }

    #[test]
    fn test_disconnected_seat_returns_to_pool() {
        let admission = Admission::new(1, true);
        let seat = admission.reserve_seat().unwrap();
        assert!(admission.reserve_seat().is_none());

        admission.admit(seat).unwrap();
        admission.reclaim(seat);
        assert_eq!(admission.free_identities(), 1);
        assert_eq!(admission.reserve_seat(), Some(seat));
    }

    #[test]
    fn test_release_seat() {
        let admission = Admission::new(4, true);
        let a = admission.reserve_seat().unwrap();
        let b = admission.reserve_seat().unwrap();

        assert!(admission.release_seat(a));
        assert!(!admission.release_seat(a));
        assert_eq!(admission.reserved_seats(), vec![b]);
        assert_eq!(admission.free_identities(), 3);
    }

    #[test]
    fn test_reclaim_ignores_unknown() {
        let admission = Admission::new(2, false);
        admission.reclaim(1);
        assert_eq!(admission.free_identities(), 2);
    }

    #[test]
    fn test_capacity_clamped() {
        let admission = Admission::new(100_000, false);
        assert_eq!(admission.capacity(), MAX_CONNECTIONS_LIMIT);
        assert_eq!(admission.free_identities(), MAX_CONNECTIONS_LIMIT);
    }

    #[test]
    fn test_reset() {
        let admission = Admission::new(3, true);
        admission.reserve_seat();
        admission.reset();
        assert!(admission.reserved_seats().is_empty());
        assert_eq!(admission.free_identities(), 3);
    }
}
