//! Segmented recency list backing the FBR policy.
//!
//! Blocks live in an index-stable arena and are threaded into one doubly
//! linked list, most recently used at the front. Two boundary markers split
//! the list, front to back, into the New, Middle and Old segments:
//!
//! ```text
//!   head                                                      tail
//!    | New ........ new_tail | Middle ......... | old_head ..... Old |
//! ```
//!
//! Every structural change ends with [`SegmentedList::rebalance`], which
//! pushes overflow out of New into Middle and tops Old up from the tail of
//! Middle, so that New holds at most `max_new` of the most recently touched
//! blocks and Old holds at most `max_old` of the least recently touched ones.

use fbr_block::Block;
use serde::{Deserialize, Serialize};

/// Index of a block's slot in the arena. Stable for the block's lifetime.
pub(crate) type SlotId = usize;

/// Which part of the recency list a resident block is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Segment {
    New,
    Middle,
    Old,
}

/// Current size of each segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentLens {
    pub new: usize,
    pub middle: usize,
    pub old: usize,
}

impl SegmentLens {
    #[must_use]
    pub fn total(&self) -> usize {
        self.new + self.middle + self.old
    }

    fn add(&mut self, segment: Segment) {
        match segment {
            Segment::New => self.new += 1,
            Segment::Middle => self.middle += 1,
            Segment::Old => self.old += 1,
        }
    }

    fn sub(&mut self, segment: Segment) {
        match segment {
            Segment::New => self.new -= 1,
            Segment::Middle => self.middle -= 1,
            Segment::Old => self.old -= 1,
        }
    }
}

#[derive(Debug)]
struct Node {
    /// `None` while the slot is on the free list.
    block: Option<Block>,
    segment: Segment,
    prev: Option<SlotId>,
    next: Option<SlotId>,
}

impl Node {
    fn occupied(block: Block) -> Self {
        Self {
            block: Some(block),
            segment: Segment::New,
            prev: None,
            next: None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct SegmentedList {
    slots: Vec<Node>,
    free: Vec<SlotId>,
    head: Option<SlotId>,
    tail: Option<SlotId>,
    /// Last (least recent) block of New.
    new_tail: Option<SlotId>,
    /// First (most recent) block of Old.
    old_head: Option<SlotId>,
    lens: SegmentLens,
    max_new: usize,
    max_old: usize,
}

impl SegmentedList {
    pub(crate) fn new(max_new: usize, max_old: usize, capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: None,
            tail: None,
            new_tail: None,
            old_head: None,
            lens: SegmentLens::default(),
            max_new,
            max_old,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lens.total()
    }

    pub(crate) fn lens(&self) -> SegmentLens {
        self.lens
    }

    pub(crate) fn block(&self, slot: SlotId) -> Option<&Block> {
        self.slots.get(slot).and_then(|node| node.block.as_ref())
    }

    pub(crate) fn segment(&self, slot: SlotId) -> Option<Segment> {
        self.slots
            .get(slot)
            .filter(|node| node.block.is_some())
            .map(|node| node.segment)
    }

    /// Admit a block at the head of New.
    pub(crate) fn push_new(&mut self, block: Block) -> SlotId {
        let slot = if let Some(slot) = self.free.pop() {
            self.slots[slot] = Node::occupied(block);
            slot
        } else {
            self.slots.push(Node::occupied(block));
            self.slots.len() - 1
        };
        self.link_new(slot);
        self.rebalance();
        slot
    }

    /// Record an access to a resident block.
    ///
    /// A block in New moves to the head of New and is not credited. A block
    /// in Middle or Old is credited one reference and moves to the head of
    /// Middle. Returns whether the counter was incremented.
    pub(crate) fn touch(&mut self, slot: SlotId) -> bool {
        let Some(segment) = self.segment(slot) else {
            return false;
        };
        let credited = match segment {
            Segment::New => {
                if self.head != Some(slot) {
                    self.unlink(slot);
                    self.link_new(slot);
                }
                false
            }
            Segment::Middle | Segment::Old => {
                if let Some(block) = self.slots[slot].block.as_mut() {
                    block.increment_counter();
                }
                self.unlink(slot);
                self.link_middle(slot);
                true
            }
        };
        self.rebalance();
        credited
    }

    /// Remove a block from the list and release its slot.
    pub(crate) fn remove(&mut self, slot: SlotId) -> Option<Block> {
        if self.block(slot).is_none() {
            return None;
        }
        self.unlink(slot);
        let block = self.slots[slot].block.take();
        self.free.push(slot);
        self.rebalance();
        block
    }

    /// Eviction candidate: the Old block with the smallest counter, taking the
    /// least recently used one on ties. Falls back to the overall least
    /// recently used block when Old is empty.
    pub(crate) fn victim(&self) -> Option<SlotId> {
        let mut best: Option<(SlotId, u64)> = None;
        let mut cursor = self.tail;
        while let Some(slot) = cursor {
            let node = &self.slots[slot];
            if node.segment != Segment::Old {
                break;
            }
            let counter = node.block.as_ref().map_or(0, Block::counter);
            if best.is_none_or(|(_, lowest)| counter < lowest) {
                best = Some((slot, counter));
            }
            cursor = node.prev;
        }
        best.map(|(slot, _)| slot).or(self.tail)
    }

    /// Resident blocks, most recently used first.
    pub(crate) fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.new_tail = None;
        self.old_head = None;
        self.lens = SegmentLens::default();
    }

    fn link_after(&mut self, slot: SlotId, after: Option<SlotId>) {
        let next = match after {
            Some(prev) => self.slots[prev].next,
            None => self.head,
        };
        self.slots[slot].prev = after;
        self.slots[slot].next = next;
        match after {
            Some(prev) => self.slots[prev].next = Some(slot),
            None => self.head = Some(slot),
        }
        match next {
            Some(next) => self.slots[next].prev = Some(slot),
            None => self.tail = Some(slot),
        }
    }

    fn link_new(&mut self, slot: SlotId) {
        self.link_after(slot, None);
        self.slots[slot].segment = Segment::New;
        self.lens.add(Segment::New);
        if self.new_tail.is_none() {
            self.new_tail = Some(slot);
        }
    }

    fn link_middle(&mut self, slot: SlotId) {
        self.link_after(slot, self.new_tail);
        self.slots[slot].segment = Segment::Middle;
        self.lens.add(Segment::Middle);
    }

    fn unlink(&mut self, slot: SlotId) {
        let Node {
            prev,
            next,
            segment,
            ..
        } = self.slots[slot];
        match prev {
            Some(prev) => self.slots[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.slots[next].prev = prev,
            None => self.tail = prev,
        }
        if self.new_tail == Some(slot) {
            self.new_tail = prev;
        }
        if self.old_head == Some(slot) {
            self.old_head = next;
        }
        self.lens.sub(segment);
        self.slots[slot].prev = None;
        self.slots[slot].next = None;
    }

    fn move_boundary(&mut self, slot: SlotId, to: Segment) {
        let from = self.slots[slot].segment;
        self.slots[slot].segment = to;
        self.lens.sub(from);
        self.lens.add(to);
        tracing::trace!(
            target: "fbr::cache",
            slot,
            from = ?from,
            to = ?to,
            "segment_boundary_move"
        );
    }

    /// Re-establish the segment bounds after a structural change.
    fn rebalance(&mut self) {
        while self.lens.new > self.max_new {
            let Some(slot) = self.new_tail else { break };
            self.new_tail = self.slots[slot].prev;
            self.move_boundary(slot, Segment::Middle);
        }
        while self.lens.old > self.max_old {
            let Some(slot) = self.old_head else { break };
            self.old_head = self.slots[slot].next;
            self.move_boundary(slot, Segment::Middle);
        }
        while self.lens.old < self.max_old && self.lens.middle > 0 {
            let candidate = match self.old_head {
                Some(old_head) => self.slots[old_head].prev,
                None => self.tail,
            };
            let Some(slot) = candidate else { break };
            if self.slots[slot].segment != Segment::Middle {
                break;
            }
            self.old_head = Some(slot);
            self.move_boundary(slot, Segment::Old);
        }
    }

    /// Walk the list and confirm links, ordering, boundaries and counts.
    pub(crate) fn check(&self) -> Result<(), String> {
        let mut seen = SegmentLens::default();
        let mut prev: Option<SlotId> = None;
        let mut last_segment = Segment::New;
        let mut last_new = None;
        let mut first_old = None;
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            let node = self
                .slots
                .get(slot)
                .ok_or_else(|| format!("slot {slot} out of range"))?;
            if node.block.is_none() {
                return Err(format!("slot {slot} is linked but vacant"));
            }
            if node.prev != prev {
                return Err(format!("slot {slot} has a broken back link"));
            }
            if node.segment < last_segment {
                return Err(format!(
                    "slot {slot} in {:?} follows {last_segment:?}",
                    node.segment
                ));
            }
            if node.segment == Segment::New {
                last_new = Some(slot);
            }
            if node.segment == Segment::Old && first_old.is_none() {
                first_old = Some(slot);
            }
            last_segment = node.segment;
            seen.add(node.segment);
            if seen.total() > self.slots.len() {
                return Err("cycle in recency list".to_owned());
            }
            prev = Some(slot);
            cursor = node.next;
        }
        if self.tail != prev {
            return Err("tail does not match the last linked slot".to_owned());
        }
        if seen != self.lens {
            return Err(format!(
                "segment counts drifted: walked {seen:?}, recorded {:?}",
                self.lens
            ));
        }
        if self.new_tail != last_new {
            return Err("New boundary marker is stale".to_owned());
        }
        if self.old_head != first_old {
            return Err("Old boundary marker is stale".to_owned());
        }
        if seen.new > self.max_new || seen.old > self.max_old {
            return Err(format!(
                "segment bounds exceeded: {seen:?} max_new={} max_old={}",
                self.max_new, self.max_old
            ));
        }
        let occupied = self.slots.iter().filter(|node| node.block.is_some()).count();
        if occupied != seen.total() || occupied + self.free.len() != self.slots.len() {
            return Err("arena occupancy does not match the list".to_owned());
        }
        Ok(())
    }
}

/// Iterator over resident blocks, most recently used first.
pub(crate) struct Iter<'a> {
    list: &'a SegmentedList,
    cursor: Option<SlotId>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a Block, Segment);

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.cursor?;
        let node = &self.list.slots[slot];
        self.cursor = node.next;
        node.block.as_ref().map(|block| (block, node.segment))
    }
}
