//! Tag and fid allocation.
//!
//! Both pools are slot tables sized at build time; the slot index is the
//! wire identifier, so `NOTAG` and `NOFID` can never be issued.

use crate::error::Error;
use crate::utils::Result;

/// Outstanding requests a session can hold tags for.
pub const MAX_TAGS: usize = 16;

/// Fids a session can keep in service at once.
pub const MAX_FIDS: usize = 32;

/// Allocator for 16-bit request tags.
#[derive(Debug)]
pub struct TagPool {
    live: [bool; MAX_TAGS],
}

impl TagPool {
    pub fn new() -> TagPool {
        TagPool {
            live: [false; MAX_TAGS],
        }
    }

    /// Reserve a free tag. It stays live until passed back to `free`.
    pub fn alloc(&mut self) -> Result<u16> {
        for (slot, live) in self.live.iter_mut().enumerate() {
            if !*live {
                *live = true;
                return Ok(slot as u16);
            }
        }
        Err(Error::TagsExhausted)
    }

    /// Release a tag issued by `alloc`. Freeing a dead tag is a
    /// programming error.
    pub fn free(&mut self, tag: u16) {
        let slot = tag as usize;
        debug_assert!(
            slot < MAX_TAGS && self.live[slot],
            "free of dead tag {}",
            tag
        );
        if let Some(live) = self.live.get_mut(slot) {
            *live = false;
        }
    }
}

impl Default for TagPool {
    fn default() -> Self {
        Self::new()
    }
}

/// What a fid slot is currently doing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum FidState {
    Free,
    InService,
    Open { iounit: u32 },
}

/// Allocator for 32-bit fids, tracking per-fid open state.
#[derive(Debug)]
pub struct FidPool {
    slots: [FidState; MAX_FIDS],
}

impl FidPool {
    pub fn new() -> FidPool {
        FidPool {
            slots: [FidState::Free; MAX_FIDS],
        }
    }

    /// Put a free fid into service.
    pub fn alloc(&mut self) -> Result<u32> {
        for (slot, state) in self.slots.iter_mut().enumerate() {
            if *state == FidState::Free {
                *state = FidState::InService;
                return Ok(slot as u32);
            }
        }
        Err(Error::FidsExhausted)
    }

    /// Retire a fid. Freeing a fid that is not in service is a
    /// programming error.
    pub fn free(&mut self, fid: u32) {
        let slot = fid as usize;
        debug_assert!(
            slot < MAX_FIDS && self.slots[slot] != FidState::Free,
            "free of dead fid {}",
            fid
        );
        if let Some(state) = self.slots.get_mut(slot) {
            *state = FidState::Free;
        }
    }

    /// Whether the fid is currently in service (opened or not).
    pub fn contains(&self, fid: u32) -> bool {
        self.slots
            .get(fid as usize)
            .is_some_and(|state| *state != FidState::Free)
    }

    /// Record a successful open, with the iounit read and write chunks
    /// are clipped to.
    pub fn set_open(&mut self, fid: u32, iounit: u32) {
        let slot = fid as usize;
        debug_assert!(
            slot < MAX_FIDS && self.slots[slot] != FidState::Free,
            "open of dead fid {}",
            fid
        );
        if let Some(state) = self.slots.get_mut(slot) {
            *state = FidState::Open { iounit };
        }
    }

    /// The iounit of an opened fid, `None` when the fid was never opened
    /// or is not in service.
    pub fn iounit(&self, fid: u32) -> Option<u32> {
        match self.slots.get(fid as usize) {
            Some(FidState::Open { iounit }) => Some(*iounit),
            _ => None,
        }
    }
}

impl Default for FidPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcall::{NOFID, NOTAG};

    #[test]
    fn tags_exhaust_and_recycle() {
        let mut pool = TagPool::new();
        let mut tags = Vec::new();
        for _ in 0..MAX_TAGS {
            let tag = pool.alloc().unwrap();
            assert_ne!(tag, NOTAG);
            tags.push(tag);
        }
        assert!(matches!(pool.alloc(), Err(Error::TagsExhausted)));

        pool.free(tags[3]);
        assert_eq!(pool.alloc().unwrap(), tags[3]);
    }

    #[test]
    fn fids_exhaust_and_recycle() {
        let mut pool = FidPool::new();
        for _ in 0..MAX_FIDS {
            assert_ne!(pool.alloc().unwrap(), NOFID);
        }
        assert!(matches!(pool.alloc(), Err(Error::FidsExhausted)));

        pool.free(7);
        assert!(!pool.contains(7));
        assert_eq!(pool.alloc().unwrap(), 7);
    }

    #[test]
    fn open_state_follows_the_fid() {
        let mut pool = FidPool::new();
        let fid = pool.alloc().unwrap();
        assert_eq!(pool.iounit(fid), None);

        pool.set_open(fid, 4096);
        assert_eq!(pool.iounit(fid), Some(4096));
        assert!(pool.contains(fid));

        pool.free(fid);
        assert_eq!(pool.iounit(fid), None);
        assert!(!pool.contains(fid));
    }
}
