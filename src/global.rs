//! Global arrays: a logical byte array striped over every rank, addressed
//! through a handle instead of a registered pointer.
//!
//! Allocation is collective. Each rank allocates a slice of `⌈A/P⌉` bytes
//! and registers it; because every rank allocates in the same order, the
//! slices bind to the same registration serial everywhere and a handle plus
//! an offset is enough to reach any byte of the logical array. Reads and
//! writes walk the covered slice range and turn into one put/get per
//! touched rank.
//!
//! A bounded ring of handles is kept; once it has wrapped, allocation scans
//! for recycled slots.

use crate::defaults::MAX_GLOBAL_ARRAYS;
use crate::engine::BspState;
use crate::error::{BspError, Result};

/// Opaque handle to a global array, valid group-wide.
pub type GlobalHandle = usize;

#[derive(Debug)]
struct GlobalArray {
    /// Logical size of the whole array.
    total: usize,
    /// This rank's slice, length `⌈total / P⌉`.
    local: Vec<u8>,
}

/// Per-process table of live global arrays.
#[derive(Debug)]
pub struct GlobalArrays {
    slots: Vec<Option<GlobalArray>>,
    next: usize,
    overflow: bool,
    /// Freed slices parked until the pop_reg that retires them has been
    /// replayed at a barrier.
    graveyard: Vec<Vec<u8>>,
}

impl GlobalArrays {
    pub fn new() -> Self {
        GlobalArrays {
            slots: (0..MAX_GLOBAL_ARRAYS).map(|_| None).collect(),
            next: 0,
            overflow: false,
            graveyard: Vec::new(),
        }
    }

    /// Allocate and register this rank's slice of a `total`-byte array.
    pub fn alloc(&mut self, state: &mut BspState, total: usize) -> Result<GlobalHandle> {
        if total == 0 {
            return Err(BspError::Internal(
                "global array of zero bytes".to_string(),
            ));
        }
        if self.overflow {
            let mut scanned = 0;
            while self.slots[self.next].is_some() {
                self.next = (self.next + 1) % MAX_GLOBAL_ARRAYS;
                scanned += 1;
                if scanned > MAX_GLOBAL_ARRAYS {
                    return Err(BspError::Internal(
                        "ran out of global array handles".to_string(),
                    ));
                }
            }
        }

        let local_size = (total + state.nprocs() - 1) / state.nprocs();
        let mut local = Vec::new();
        local
            .try_reserve_exact(local_size)
            .map_err(|_| BspError::OutOfMemory {
                requested: local_size,
            })?;
        local.resize(local_size, 0);
        // The slice is owned by the slot table and never reallocated, so the
        // registered address is stable for the array's lifetime.
        unsafe {
            state.push_reg(local.as_ptr() as usize, local_size)?;
        }

        let handle = self.next;
        self.slots[handle] = Some(GlobalArray { total, local });
        self.next = (self.next + 1) % MAX_GLOBAL_ARRAYS;
        if self.next == 0 {
            self.overflow = true;
        }
        Ok(handle)
    }

    /// Retire a global array. The registration is popped at the next
    /// barrier; the slice stays allocated until then.
    pub fn free(&mut self, state: &mut BspState, handle: GlobalHandle) -> Result<()> {
        let array = self
            .slots
            .get_mut(handle)
            .and_then(Option::take)
            .ok_or_else(|| {
                BspError::Internal(format!("global array handle {handle} is not live"))
            })?;
        state.pop_reg(array.local.as_ptr() as usize)?;
        self.graveyard.push(array.local);
        Ok(())
    }

    /// Drop slices whose retiring pop has been replayed. Called after every
    /// barrier.
    pub fn drain_graveyard(&mut self) {
        self.graveyard.clear();
    }

    fn array(&self, handle: GlobalHandle) -> Result<&GlobalArray> {
        self.slots
            .get(handle)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                BspError::Internal(format!("global array handle {handle} is not live"))
            })
    }

    fn check_range(array: &GlobalArray, offset: usize, nbytes: usize) -> Result<()> {
        if offset + nbytes > array.total {
            return Err(BspError::Internal(format!(
                "global access of {nbytes} bytes at offset {offset} exceeds array of {} bytes",
                array.total
            )));
        }
        Ok(())
    }

    /// Write `src` at logical `offset`, splitting over the covered slices.
    pub fn put(
        &self,
        state: &mut BspState,
        src: &[u8],
        handle: GlobalHandle,
        offset: usize,
    ) -> Result<()> {
        let array = self.array(handle)?;
        Self::check_range(array, offset, src.len())?;
        let local_size = array.local.len();
        let base = array.local.as_ptr() as usize;

        let mut p = offset / local_size;
        let mut idx = offset % local_size;
        let mut pos = 0;
        while pos < src.len() {
            let todo = (src.len() - pos).min(local_size - idx);
            state.put(p, &src[pos..pos + todo], base, idx)?;
            pos += todo;
            p += 1;
            idx = 0;
        }
        Ok(())
    }

    /// Read `nbytes` at logical `offset` into local memory at `dst`,
    /// splitting over the covered slices. The bytes land at the next
    /// barrier; the caller upholds the raw-destination contract.
    pub fn get(
        &self,
        state: &mut BspState,
        handle: GlobalHandle,
        offset: usize,
        dst: usize,
        nbytes: usize,
    ) -> Result<()> {
        let array = self.array(handle)?;
        Self::check_range(array, offset, nbytes)?;
        let local_size = array.local.len();
        let base = array.local.as_ptr() as usize;

        let mut p = offset / local_size;
        let mut idx = offset % local_size;
        let mut pos = 0;
        while pos < nbytes {
            let todo = (nbytes - pos).min(local_size - idx);
            unsafe {
                state.get(p, base, idx, dst + pos, todo)?;
            }
            pos += todo;
            p += 1;
            idx = 0;
        }
        Ok(())
    }
}

impl Default for GlobalArrays {
    fn default() -> Self {
        GlobalArrays::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_rejects_empty_arrays() {
        let mut state = BspState::new(1, 0).unwrap();
        let mut globals = GlobalArrays::new();
        assert!(globals.alloc(&mut state, 0).is_err());
    }

    #[test]
    fn handles_recycle_after_wraparound() {
        let mut state = BspState::new(1, 0).unwrap();
        let mut globals = GlobalArrays::new();
        let mut handles = Vec::new();
        for _ in 0..MAX_GLOBAL_ARRAYS {
            handles.push(globals.alloc(&mut state, 8).unwrap());
        }
        // Table is full; freeing one slot makes exactly that slot available.
        globals.free(&mut state, handles[3]).unwrap();
        let recycled = globals.alloc(&mut state, 8).unwrap();
        assert_eq!(recycled, handles[3]);

        let err = globals.alloc(&mut state, 8).unwrap_err();
        assert!(matches!(err, BspError::Internal(_)));
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let mut state = BspState::new(2, 0).unwrap();
        let mut globals = GlobalArrays::new();
        let h = globals.alloc(&mut state, 10).unwrap();
        let err = globals.put(&mut state, &[0u8; 4], h, 8).unwrap_err();
        assert!(matches!(err, BspError::Internal(_)));
    }
}
