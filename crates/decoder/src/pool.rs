//! Multi-planar buffer pools with an explicit per-slot state machine.
//!
//! Every hardware buffer slot cycles through exactly one path:
//!
//! ```text
//! Free ──queue──▶ Queued ──dequeue──▶ Completed ──requeue──▶ Queued
//!   ▲                                     │
//!   └────────────── release ──────────────┘
//! ```
//!
//! A slot is owned by at most one party at a time — the device while
//! `Queued`, a single consumer (caller or bridge) while `Completed`.
//! Illegal transitions are contract violations and surface as
//! [`PoolError::IllegalTransition`] instead of being silently ignored.
//!
//! ## Plane ownership
//!
//! Plane memory is either `Mapped` (owned by the pool that mapped it)
//! or `Imported` (a reference into another pool's mapping, used when
//! the converter's OUTPUT queue consumes decoder CAPTURE buffers by
//! reference). An importing pool never frees imported planes; dropping
//! it merely drops the refcount.

use std::sync::Arc;

use parking_lot::Mutex;

use m2m_common::PoolError;

use crate::device::{MappedBuffer, QueuedPlane};

// ---------------------------------------------------------------------------
// Plane memory
// ---------------------------------------------------------------------------

/// One contiguous plane of buffer memory.
///
/// Stands in for an mmapped region: fixed capacity for the life of the
/// pool, shared by refcount between the mapping pool, an importing
/// pool, and frames handed to the caller.
pub struct PlaneMemory {
    bytes: Mutex<Vec<u8>>,
    capacity: usize,
}

impl PlaneMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0u8; capacity]),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy `data` into the plane starting at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= self.capacity);
        self.bytes.lock()[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Snapshot the first `len` bytes of the plane.
    pub fn read(&self, len: usize) -> Vec<u8> {
        let bytes = self.bytes.lock();
        bytes[..len.min(self.capacity)].to_vec()
    }
}

impl std::fmt::Debug for PlaneMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaneMemory")
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Who owns a slot's plane memory.
pub enum PlaneBacking {
    /// Mapped by (and owned by) this pool.
    Mapped(Arc<PlaneMemory>),
    /// Borrowed from another pool's mapping; never freed here.
    Imported(Arc<PlaneMemory>),
}

impl PlaneBacking {
    pub fn memory(&self) -> &Arc<PlaneMemory> {
        match self {
            Self::Mapped(m) | Self::Imported(m) => m,
        }
    }

    pub fn is_imported(&self) -> bool {
        matches!(self, Self::Imported(_))
    }
}

// ---------------------------------------------------------------------------
// Slot state machine
// ---------------------------------------------------------------------------

/// Ownership state of one buffer slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Not with the device, not held by any consumer.
    Free,
    /// Owned by the device.
    Queued,
    /// Dequeued and held by exactly one consumer.
    Completed,
}

impl SlotState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Free => "Free",
            Self::Queued => "Queued",
            Self::Completed => "Completed",
        }
    }
}

/// One plane of a slot: backing memory plus the meaningful byte count.
pub struct Plane {
    pub backing: PlaneBacking,
    pub bytes_used: usize,
}

/// One buffer slot. The index is its position in the pool and is
/// stable for the life of the session.
pub struct BufferSlot {
    pub index: u32,
    pub planes: Vec<Plane>,
    state: SlotState,
}

impl BufferSlot {
    pub fn state(&self) -> SlotState {
        self.state
    }
}

// ---------------------------------------------------------------------------
// Buffer pool
// ---------------------------------------------------------------------------

/// A fixed-size, index-addressed pool of buffer slots.
///
/// The size is set once by the driver's REQBUFS answer and never
/// changes; every index a device dequeue returns must be a valid index
/// into the pool that produced it.
pub struct BufferPool {
    name: &'static str,
    slots: Vec<BufferSlot>,
}

impl BufferPool {
    /// Build a pool from the device's mapped buffers. With
    /// `auto_queued`, every slot starts life owned by the device.
    pub fn from_mapped(name: &'static str, mapped: Vec<MappedBuffer>, auto_queued: bool) -> Self {
        let state = if auto_queued {
            SlotState::Queued
        } else {
            SlotState::Free
        };
        let slots = mapped
            .into_iter()
            .map(|buf| BufferSlot {
                index: buf.index,
                planes: buf
                    .planes
                    .into_iter()
                    .map(|memory| Plane {
                        backing: PlaneBacking::Mapped(memory),
                        bytes_used: 0,
                    })
                    .collect(),
                state,
            })
            .collect();
        Self { name, slots }
    }

    /// Build an import pool mirroring `source` slot-for-slot. Planes
    /// are shared by reference; this pool never owns them. All slots
    /// start `Free` — nothing has been handed to the importer yet.
    pub fn import_from(name: &'static str, source: &BufferPool) -> Self {
        let slots = source
            .slots
            .iter()
            .map(|src| BufferSlot {
                index: src.index,
                planes: src
                    .planes
                    .iter()
                    .map(|plane| Plane {
                        backing: PlaneBacking::Imported(plane.backing.memory().clone()),
                        bytes_used: 0,
                    })
                    .collect(),
                state: SlotState::Free,
            })
            .collect();
        Self { name, slots }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn state(&self, index: u32) -> Result<SlotState, PoolError> {
        Ok(self.slot(index)?.state)
    }

    /// Lowest-index slot not currently queued or held. Deliberately a
    /// linear scan from 0 — earliest-free-slot, not round-robin.
    pub fn first_free(&self) -> Option<u32> {
        self.slots
            .iter()
            .find(|s| s.state == SlotState::Free)
            .map(|s| s.index)
    }

    pub fn count_in(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|s| s.state == state).count()
    }

    // ── transitions ──────────────────────────────────────────────

    /// Free|Completed → Queued.
    pub fn mark_queued(&mut self, index: u32) -> Result<(), PoolError> {
        self.transition(index, SlotState::Queued, |s| {
            matches!(s, SlotState::Free | SlotState::Completed)
        })
    }

    /// Queued → Completed.
    pub fn mark_completed(&mut self, index: u32) -> Result<(), PoolError> {
        self.transition(index, SlotState::Completed, |s| s == SlotState::Queued)
    }

    /// Completed → Free.
    pub fn mark_free(&mut self, index: u32) -> Result<(), PoolError> {
        self.transition(index, SlotState::Free, |s| s == SlotState::Completed)
    }

    fn transition(
        &mut self,
        index: u32,
        to: SlotState,
        legal_from: impl Fn(SlotState) -> bool,
    ) -> Result<(), PoolError> {
        let slot = self.slot_mut(index)?;
        if !legal_from(slot.state) {
            return Err(PoolError::IllegalTransition {
                index,
                from: slot.state.name(),
                to: to.name(),
            });
        }
        slot.state = to;
        Ok(())
    }

    // ── data access ──────────────────────────────────────────────

    /// Concatenate `chunks` into plane 0 of a slot and record the byte
    /// count. The slot must not be queued with the device.
    pub fn fill_plane(&mut self, index: u32, chunks: &[&[u8]]) -> Result<usize, PoolError> {
        let slot = self.slot_mut(index)?;
        if slot.state == SlotState::Queued {
            return Err(PoolError::SlotQueued { index });
        }
        let plane = &mut slot.planes[0];
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        let capacity = plane.backing.memory().capacity();
        if total > capacity {
            return Err(PoolError::PlaneOverflow {
                index,
                plane: 0,
                written: total,
                capacity,
            });
        }
        let mut offset = 0;
        for chunk in chunks {
            plane.backing.memory().write_at(offset, chunk);
            offset += chunk.len();
        }
        plane.bytes_used = total;
        Ok(total)
    }

    /// Plane payloads for a device submission of this slot.
    pub fn queued_planes(&self, index: u32) -> Result<Vec<QueuedPlane>, PoolError> {
        let slot = self.slot(index)?;
        Ok(slot
            .planes
            .iter()
            .map(|plane| QueuedPlane {
                memory: plane.backing.memory().clone(),
                bytes_used: plane.bytes_used,
            })
            .collect())
    }

    /// Shared references to a slot's plane memory, for handing a
    /// decoded frame to the caller.
    pub fn plane_memories(&self, index: u32) -> Result<Vec<Arc<PlaneMemory>>, PoolError> {
        let slot = self.slot(index)?;
        Ok(slot
            .planes
            .iter()
            .map(|plane| plane.backing.memory().clone())
            .collect())
    }

    fn slot(&self, index: u32) -> Result<&BufferSlot, PoolError> {
        self.slots
            .get(index as usize)
            .ok_or(PoolError::IndexOutOfRange {
                index,
                len: self.slots.len(),
            })
    }

    fn slot_mut(&mut self, index: u32) -> Result<&mut BufferSlot, PoolError> {
        let len = self.slots.len();
        self.slots
            .get_mut(index as usize)
            .ok_or(PoolError::IndexOutOfRange { index, len })
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("name", &self.name)
            .field("len", &self.slots.len())
            .field("queued", &self.count_in(SlotState::Queued))
            .field("completed", &self.count_in(SlotState::Completed))
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────────
