//! On-demand request/response service.
//!
//! Grounded in `examples/original_source/include/tree_mpi.h`: `getCell`,
//! `getBodies`, `processIncomingMessage`, `recvAll`, `sendFlushRequest`. A rank
//! that needs a cell or subtree its static LET omitted asks the owning rank
//! directly; while waiting for the reply it keeps servicing *other* ranks'
//! incoming requests so two ranks blocked on each other can't deadlock.

use std::collections::HashMap;

use mpi::topology::{Rank, UserCommunicator};
use mpi::traits::*;

use crate::body::Body;
use crate::cell::{Cell, NONE};
use crate::morton::MortonKey;
use crate::octree::LocalTree;

/// Message types, 4 bits (spec §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    Cell = 0,
    ChildCell = 1,
    Body = 2,
    Level = 3,
    Flush = 4,
    Null = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

const MSG_SHIFT: u32 = 0;
const GRAIN_SHIFT: u32 = 4;
const LEVEL_SHIFT: u32 = 12;
const DIR_SHIFT: u32 = 20;

/// Pack `(message_type, grain_size, level, direction)` into the bit layout
/// described in spec §6. `grain_size` and `level` are truncated to 8 bits each.
pub fn encode_tag(message_type: MessageType, grain_size: u8, level: u8, direction: Direction) -> i32 {
    let dir_bit = match direction {
        Direction::Send => 0,
        Direction::Receive => 1,
    };
    ((message_type as u32) << MSG_SHIFT
        | (grain_size as u32) << GRAIN_SHIFT
        | (level as u32) << LEVEL_SHIFT
        | dir_bit << DIR_SHIFT) as i32
}

pub fn toggle_direction(tag: i32) -> i32 {
    tag ^ (1 << DIR_SHIFT)
}

fn message_type_of(tag: i32) -> Option<MessageType> {
    match (tag as u32 >> MSG_SHIFT) & 0xF {
        0 => Some(MessageType::Cell),
        1 => Some(MessageType::ChildCell),
        2 => Some(MessageType::Body),
        3 => Some(MessageType::Level),
        4 => Some(MessageType::Flush),
        5 => Some(MessageType::Null),
        _ => None,
    }
}

/// Per-rank memoization of remote fetches, so each `(peer, key, kind)` incurs at
/// most one round trip per evaluation.
#[derive(Default)]
pub struct Caches {
    pub cells_map: HashMap<MortonKey, Cell>,
    pub children_map: HashMap<MortonKey, Vec<Cell>>,
    pub body_map: HashMap<MortonKey, Vec<Body>>,
}

impl Caches {
    pub fn clear(&mut self) {
        self.cells_map.clear();
        self.children_map.clear();
        self.body_map.clear();
    }
}

/// Tracks how many peers have signaled completion via `FlushTag` (spec §4.5
/// termination: `recv_all` exits once every other rank has flushed).
pub struct RequestService<'a> {
    world: &'a UserCommunicator,
    my_rank: Rank,
    mpisize: Rank,
    tree: &'a LocalTree,
    flushed_peers: usize,
}

impl<'a> RequestService<'a> {
    pub fn new(world: &'a UserCommunicator, tree: &'a LocalTree) -> Self {
        RequestService {
            world,
            my_rank: world.rank(),
            mpisize: world.size(),
            tree,
            flushed_peers: 0,
        }
    }

    /// Request a single cell from `target_rank`, consulting and populating
    /// `caches.cells_map`. While waiting, services any other incoming request.
    pub fn get_cell(&mut self, caches: &mut Caches, key: MortonKey, target_rank: Rank, level: u64) -> Option<Cell> {
        if let Some(cached) = caches.cells_map.get(&key) {
            return Some(cached.clone());
        }

        let req_tag = encode_tag(MessageType::Cell, 0, level as u8, Direction::Send);
        self.world.process_at_rank(target_rank).send_with_tag(&key, req_tag);

        let resp_tag = toggle_direction(req_tag);
        loop {
            let (status, source) = self.probe_any();
            if source == target_rank && status.tag() == resp_tag {
                let msg_type = message_type_of(status.tag());
                return match msg_type {
                    Some(MessageType::Null) => {
                        let mut discard = [0u8; 1];
                        self.world.process_at_rank(source).receive_into_with_tag(&mut discard, status.tag());
                        None
                    }
                    _ => {
                        let (cell, _) = self.world.process_at_rank(source).receive_with_tag::<Cell>(status.tag());
                        caches.cells_map.insert(key, cell.clone());
                        Some(cell)
                    }
                };
            }
            self.service_one(caches, status, source);
        }
    }

    /// Request the bodies under leaf cell `key` from `target_rank`. The owning
    /// rank knows `nbody` from its own tree; the requester learns the reply's
    /// length from the probed `Status` rather than sending it up front.
    pub fn get_bodies(&mut self, caches: &mut Caches, key: MortonKey, target_rank: Rank, level: u64) -> Vec<Body> {
        if let Some(cached) = caches.body_map.get(&key) {
            return cached.clone();
        }

        let req_tag = encode_tag(MessageType::Body, 0, level as u8, Direction::Send);
        self.world.process_at_rank(target_rank).send_with_tag(&key, req_tag);

        let resp_tag = toggle_direction(req_tag);
        loop {
            let (status, source) = self.probe_any();
            if source == target_rank && status.tag() == resp_tag {
                if message_type_of(status.tag()) == Some(MessageType::Null) {
                    let mut discard = [0u8; 1];
                    self.world.process_at_rank(source).receive_into_with_tag(&mut discard, status.tag());
                    caches.body_map.insert(key, Vec::new());
                    return Vec::new();
                }
                let count = status.count(Body::equivalent_datatype()) as usize;
                let mut buf = vec![Body::default(); count];
                self.world.process_at_rank(source).receive_into_with_tag(&mut buf[..], status.tag());
                caches.body_map.insert(key, buf.clone());
                return buf;
            }
            self.service_one(caches, status, source);
        }
    }

    /// Request a packed subtree rooted at `key`, `grain_size` levels deep, and
    /// rebuild `caches.children_map` for every cell visited. `pack_subtree`
    /// always emits the wire payload in parent-then-children (depth-first)
    /// order; which order the *receiver* walks it back into `children_map` is a
    /// compile-time choice (the `dfs` feature, spec §4.5/§9) resolved by
    /// `reconstruct_subtree`.
    pub fn get_children(&mut self, caches: &mut Caches, key: MortonKey, grain_size: u8, target_rank: Rank, level: u64) -> Vec<Cell> {
        if let Some(cached) = caches.children_map.get(&key) {
            return cached.clone();
        }

        let req_tag = encode_tag(MessageType::ChildCell, grain_size, level as u8, Direction::Send);
        self.world.process_at_rank(target_rank).send_with_tag(&key, req_tag);

        let resp_tag = toggle_direction(req_tag);
        loop {
            let (status, source) = self.probe_any();
            if source == target_rank && status.tag() == resp_tag {
                if message_type_of(status.tag()) == Some(MessageType::Null) {
                    let mut discard = [0u8; 1];
                    self.world.process_at_rank(source).receive_into_with_tag(&mut discard, status.tag());
                    caches.children_map.insert(key, Vec::new());
                    return Vec::new();
                }
                let count = status.count(Cell::equivalent_datatype()) as usize;
                let mut buf = vec![Cell::default(); count];
                self.world.process_at_rank(source).receive_into_with_tag(&mut buf[..], status.tag());
                let buf = reconstruct_subtree(buf);
                caches.children_map.insert(key, buf.clone());
                return buf;
            }
            self.service_one(caches, status, source);
        }
    }

    /// Broadcast `FlushTag` to every other rank, signaling this rank has no more
    /// requests to make.
    pub fn send_flush_request(&self) {
        let flush_tag = encode_tag(MessageType::Flush, 0, 0, Direction::Send);
        for rank in 0..self.mpisize {
            if rank != self.my_rank {
                self.world.process_at_rank(rank).send_with_tag(&0u8, flush_tag);
            }
        }
    }

    /// Service the receive loop until every other rank has flushed.
    pub fn recv_all(&mut self, caches: &mut Caches) {
        while self.flushed_peers < (self.mpisize - 1) as usize {
            let (status, source) = self.probe_any();
            self.service_one(caches, status, source);
        }
    }

    fn probe_any(&self) -> (mpi::point_to_point::Status, Rank) {
        let status = self.world.any_process().probe();
        let source = status.source_rank();
        (status, source)
    }

    /// Dispatch one incoming message. Request-side replies (direction bit set)
    /// are left alone here — the waiting `get_cell`/`get_bodies`/`get_children`
    /// call consumes those directly by matching on `resp_tag`.
    fn service_one(&mut self, caches: &mut Caches, status: mpi::point_to_point::Status, source: Rank) {
        let tag = status.tag();
        let is_response = (tag >> DIR_SHIFT) & 1 == 1;
        if is_response {
            // Not ours to handle; the original requester will match on this tag.
            return;
        }

        match message_type_of(tag) {
            Some(MessageType::Cell) => self.handle_cell_request(caches, status, source, tag),
            Some(MessageType::Body) => self.handle_body_request(status, source, tag),
            Some(MessageType::ChildCell) => self.handle_child_request(status, source, tag),
            Some(MessageType::Level) => self.handle_level_request(status, source, tag),
            Some(MessageType::Flush) => {
                let mut discard = [0u8; 1];
                self.world.process_at_rank(source).receive_into_with_tag(&mut discard, tag);
                self.flushed_peers += 1;
            }
            _ => {
                let mut discard = [0u8; 1];
                self.world.process_at_rank(source).receive_into_with_tag(&mut discard, tag);
            }
        }
    }

    fn handle_cell_request(&self, _caches: &mut Caches, _status: mpi::point_to_point::Status, source: Rank, tag: i32) {
        let (key, _) = self.world.process_at_rank(source).receive_with_tag::<MortonKey>(tag);
        let resp_tag = toggle_direction(tag);
        match self.tree.cells.iter().find(|c| c.icell == key) {
            Some(cell) => self.world.process_at_rank(source).send_with_tag(cell, resp_tag),
            None => {
                let null_tag = (resp_tag as u32 & !0xF | MessageType::Null as u32) as i32;
                self.world.process_at_rank(source).send_with_tag(&0u8, null_tag);
            }
        }
    }

    fn handle_body_request(&self, status: mpi::point_to_point::Status, source: Rank, tag: i32) {
        let (key, _) = self.world.process_at_rank(source).receive_with_tag::<MortonKey>(tag);
        let resp_tag = toggle_direction(tag);
        let found = self.tree.cells.iter().find(|c| c.icell == key && c.is_leaf());
        match found {
            Some(cell) if cell.nbody > 0 => {
                let start = cell.ibody as usize;
                let end = start + cell.nbody as usize;
                self.world
                    .process_at_rank(source)
                    .send_with_tag(&self.tree.bodies[start..end], resp_tag);
            }
            _ => {
                let null_tag = (resp_tag as u32 & !0xF | MessageType::Null as u32) as i32;
                self.world.process_at_rank(source).send_with_tag(&0u8, null_tag);
            }
        }
        let _ = status;
    }

    /// Pack the subtree rooted at the requested cell, `grain_size` levels deep,
    /// in depth-first order, and send it. See `get_children` for the matching
    /// unpacker.
    fn handle_child_request(&self, status: mpi::point_to_point::Status, source: Rank, tag: i32) {
        let grain_size = ((tag as u32 >> GRAIN_SHIFT) & 0xFF).max(1);
        let (key, _) = self.world.process_at_rank(source).receive_with_tag::<MortonKey>(tag);
        let resp_tag = toggle_direction(tag);

        let root_idx = self.tree.cells.iter().position(|c| c.icell == key);
        let mut packed = Vec::new();
        if let Some(idx) = root_idx {
            if !self.tree.cells[idx].is_leaf() {
                pack_subtree(self.tree, idx, grain_size, &mut packed);
            }
        }

        if packed.is_empty() {
            let null_tag = (resp_tag as u32 & !0xF | MessageType::Null as u32) as i32;
            self.world.process_at_rank(source).send_with_tag(&0u8, null_tag);
        } else {
            self.world.process_at_rank(source).send_with_tag(&packed[..], resp_tag);
        }
        let _ = status;
    }

    /// `level` is carried on the wire for layout compatibility with spec §6 but
    /// is not currently consulted by the dispatcher — the root cell is always
    /// the response, matching the original's unused-field behavior rather than
    /// silently dropping the field (spec §9, Open Question 3).
    fn handle_level_request(&self, status: mpi::point_to_point::Status, source: Rank, tag: i32) {
        let mut discard = [0u8; 1];
        self.world.process_at_rank(source).receive_into_with_tag(&mut discard, tag);
        let resp_tag = toggle_direction(tag);
        self.world.process_at_rank(source).send_with_tag(&self.tree.cells[0], resp_tag);
        let _ = status;
    }
}

/// Walk `cells` depth-first from `root_idx`, up to `grain_size` levels deep,
/// rewriting `iparent`/`ichild` to indices within `out` so the receiver can
/// reconstruct the subtree without seeing the sender's full array.
fn pack_subtree(tree: &LocalTree, root_idx: usize, grain_size: u8, out: &mut Vec<Cell>) {
    fn recurse(tree: &LocalTree, idx: usize, depth: u8, grain_size: u8, parent_out_idx: i64, out: &mut Vec<Cell>) {
        let cell = &tree.cells[idx];
        let out_idx = out.len();
        let mut packed = cell.clone();
        packed.iparent = parent_out_idx;
        out.push(packed);

        if depth >= grain_size || cell.is_leaf() {
            out[out_idx].ichild = NONE;
            out[out_idx].nchild = 0;
            return;
        }

        let first_out_child = out.len();
        out[out_idx].ichild = first_out_child as i64;
        for offset in 0..cell.nchild as usize {
            recurse(tree, cell.ichild as usize + offset, depth + 1, grain_size, out_idx as i64, out);
        }
    }

    recurse(tree, root_idx, 0, grain_size, NONE, out);
}

/// Reorder a `pack_subtree` payload into the form `Caches::children_map` is
/// built from. `pack_subtree` always writes parent-then-children order with
/// `iparent`/`ichild` already rewritten to `out`-local indices, so the
/// depth-first variant is a straight pass-through. The breadth-first variant
/// ignores that ordering and walks the payload purely via each record's
/// `iparent` back-pointer, re-emitting level by level (spec §4.5: "breadth-
/// first walks it using each record's IPARENT back-pointer"); both variants
/// produce the same parent->children associations, just built up differently,
/// so mixing them across ranks built with different settings is unsafe (spec
/// §9) only insofar as a rank expecting one `out` index convention must not
/// receive the other.
#[cfg(feature = "dfs")]
fn reconstruct_subtree(buf: Vec<Cell>) -> Vec<Cell> {
    buf
}

#[cfg(not(feature = "dfs"))]
fn reconstruct_subtree(buf: Vec<Cell>) -> Vec<Cell> {
    if buf.is_empty() {
        return buf;
    }

    // Group children by parent's *old* index using the IPARENT back-pointer
    // `pack_subtree` wrote.
    let mut children_of: HashMap<i64, Vec<usize>> = HashMap::new();
    let mut root_old_idx = 0usize;
    for (old_idx, cell) in buf.iter().enumerate() {
        if cell.iparent == NONE {
            root_old_idx = old_idx;
        } else {
            children_of.entry(cell.iparent).or_default().push(old_idx);
        }
    }

    // Breadth-first walk over old indices, assigning new indices level by level.
    let mut order = vec![root_old_idx];
    let mut frontier = vec![root_old_idx];
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for old_idx in frontier {
            if let Some(kids) = children_of.get(&(old_idx as i64)) {
                next.extend(kids.iter().copied());
            }
        }
        order.extend(next.iter().copied());
        frontier = next;
    }

    let mut new_index_of = vec![0usize; buf.len()];
    for (new_idx, &old_idx) in order.iter().enumerate() {
        new_index_of[old_idx] = new_idx;
    }

    let mut out = vec![Cell::default(); buf.len()];
    for (new_idx, &old_idx) in order.iter().enumerate() {
        let mut cell = buf[old_idx].clone();
        cell.iparent = if cell.iparent == NONE {
            NONE
        } else {
            new_index_of[cell.iparent as usize] as i64
        };
        if let Some(kids) = children_of.get(&(old_idx as i64)) {
            if !kids.is_empty() {
                let first_new_child = new_index_of[kids[0]];
                cell.ichild = first_new_child as i64;
                cell.nchild = kids.len() as u32;
            }
        }
        out[new_idx] = cell;
    }

    out
}
