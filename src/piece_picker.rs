//! The block-level download planner.
//!
//! `Picker` owns every piece's verification/ownership state and the
//! availability index. It is deliberately synchronous and lock-free on its
//! own: the torrent that owns one wraps it in a single `tokio::sync::RwLock`
//! (shared for the read-only observers, exclusive for everything else),
//! following a "single exclusive lock, never held across an await" rule.

use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use rand::seq::SliceRandom;

use crate::{
    bitfield::Bitfield, block_count, block_len, conf::PieceDownloadStrategy, BlockInfo,
    PieceIndex, Sha1Hash,
};

/// A peer address, used as the picker's notion of peer identity. Connection
/// objects live elsewhere (the peer manager's registry); the picker only
/// ever needs the address to key its owner sets.
pub(crate) type PeerAddr = SocketAddr;

/// A block assignment the picker hands back to a peer session to turn into
/// a wire `Request` message.
pub(crate) type Request = BlockInfo;

/// Emitted by [`Picker::on_block_received`] for every owner other than the
/// one that delivered the block (endgame duplicates that are now moot).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Cancel {
    pub peer: PeerAddr,
    pub piece_index: PieceIndex,
    pub begin: u32,
}

/// Emitted by the periodic timeout scan for a request that went
/// unanswered past `request_timeout`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TimedOutRequest {
    pub peer: PeerAddr,
    pub piece_index: PieceIndex,
    pub begin: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockStatus {
    Want,
    Inflight,
    Done,
}

#[derive(Clone, Copy, Debug)]
struct Owner {
    sent_at: Instant,
}

#[derive(Clone, Debug)]
struct BlockState {
    status: BlockStatus,
    owners: HashMap<PeerAddr, Owner>,
}

impl BlockState {
    fn new() -> Self {
        Self {
            status: BlockStatus::Want,
            owners: HashMap::new(),
        }
    }
}

/// Per-piece state: verification status and the dense array of its blocks.
#[derive(Clone, Debug)]
pub(crate) struct PieceState {
    pub index: PieceIndex,
    pub len: u32,
    pub expected_hash: Sha1Hash,
    /// Number of currently connected peers that advertise this piece.
    pub availability: usize,
    done_blocks: usize,
    pub verified: bool,
    blocks: Vec<BlockState>,
}

impl PieceState {
    fn new(index: PieceIndex, len: u32, expected_hash: Sha1Hash) -> Self {
        let blocks = (0..block_count(len)).map(|_| BlockState::new()).collect();
        Self {
            index,
            len,
            expected_hash,
            availability: 0,
            done_blocks: 0,
            verified: false,
            blocks,
        }
    }

    pub(crate) fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

/// A dense mapping from availability level to the set of unverified piece
/// indices currently at that level, with a cached pointer to the lowest
/// non-empty level so rarest-first lookup doesn't have to rescan from zero
/// on every call in the common case.
struct AvailabilityBuckets {
    levels: Vec<Vec<PieceIndex>>,
    piece_level: Vec<usize>,
    min_nonempty: Option<usize>,
}

impl AvailabilityBuckets {
    fn new(piece_count: usize, max_level: usize) -> Self {
        Self {
            levels: vec![Vec::new(); max_level + 1],
            piece_level: vec![0; piece_count],
            min_nonempty: None,
        }
    }

    fn insert_at_zero(&mut self, piece: PieceIndex) {
        self.levels[0].push(piece);
        self.piece_level[piece] = 0;
        self.recompute_min_after_insert(0);
    }

    fn recompute_min_after_insert(&mut self, level: usize) {
        self.min_nonempty = Some(match self.min_nonempty {
            Some(current) => current.min(level),
            None => level,
        });
    }

    fn remove_from_level(&mut self, level: &mut Vec<PieceIndex>, piece: PieceIndex) {
        if let Some(pos) = level.iter().position(|&p| p == piece) {
            level.swap_remove(pos);
        }
    }

    fn bump(&mut self, piece: PieceIndex) {
        let old_level = self.piece_level[piece];
        let new_level = (old_level + 1).min(self.levels.len() - 1);
        if new_level == old_level {
            return;
        }
        self.move_piece(piece, old_level, new_level);
    }

    fn drop_one(&mut self, piece: PieceIndex) {
        let old_level = self.piece_level[piece];
        if old_level == 0 {
            return;
        }
        self.move_piece(piece, old_level, old_level - 1);
    }

    fn move_piece(&mut self, piece: PieceIndex, old_level: usize, new_level: usize) {
        {
            let level = &mut self.levels[old_level];
            self.remove_from_level_inline(level, piece);
        }
        self.levels[new_level].push(piece);
        self.piece_level[piece] = new_level;

        if self.levels[old_level].is_empty() && self.min_nonempty == Some(old_level) {
            self.min_nonempty = self.find_next_nonempty(old_level);
        }
        self.recompute_min_after_insert(new_level);
    }

    fn remove_from_level_inline(&self, level: &mut Vec<PieceIndex>, piece: PieceIndex) {
        if let Some(pos) = level.iter().position(|&p| p == piece) {
            level.swap_remove(pos);
        }
    }

    fn find_next_nonempty(&self, from: usize) -> Option<usize> {
        self.levels
            .iter()
            .enumerate()
            .skip(from)
            .find(|(_, pieces)| !pieces.is_empty())
            .map(|(level, _)| level)
    }

    /// Removes a piece from the index entirely (it has just been verified).
    fn remove(&mut self, piece: PieceIndex) {
        let level = self.piece_level[piece];
        let bucket = &mut self.levels[level];
        self.remove_from_level(bucket, piece);
        if self.levels[level].is_empty() && self.min_nonempty == Some(level) {
            self.min_nonempty = self.find_next_nonempty(level);
        }
    }

    fn rarest_nonempty_levels(&self) -> impl Iterator<Item = &Vec<PieceIndex>> {
        let start = self.min_nonempty.unwrap_or(self.levels.len());
        self.levels.iter().skip(start)
    }
}

/// Optional per-peer/global pipeline caps and strategy knobs the picker
/// needs; a subset of [`crate::conf::TorrentConf`] so tests can build one
/// without constructing a full `Conf`.
#[derive(Clone, Debug)]
pub(crate) struct PickerConf {
    pub strategy: PieceDownloadStrategy,
    pub max_global_inflight: usize,
    pub max_inflight_per_peer: usize,
    pub max_requests_per_block: usize,
    pub endgame_threshold: usize,
    pub endgame_dup_per_block: usize,
    pub request_timeout: Duration,
    /// How many verified pieces before `Random` switches to rarest-first.
    pub random_first_threshold: usize,
}

/// A peer's current advertised view, passed into [`Picker::next_for_peer`].
pub(crate) struct PeerView<'a> {
    pub peer: PeerAddr,
    pub has: &'a Bitfield,
    pub unchoked: bool,
}

pub(crate) struct Picker {
    pieces: Vec<PieceState>,
    buckets: AvailabilityBuckets,
    /// Reverse index: for each peer, the set of (piece, block) keys it
    /// currently owns, packed as `(piece_idx << 32) | block_idx`.
    peer_assignments: HashMap<PeerAddr, std::collections::HashSet<u64>>,
    peer_inflight_count: HashMap<PeerAddr, usize>,
    global_inflight: usize,
    remaining_blocks: usize,
    endgame: bool,
    verified_count: usize,
    wanted: Option<Bitfield>,
    conf: PickerConf,
    seq_next_piece: PieceIndex,
    seq_next_block: usize,
}

fn pack_key(piece_index: PieceIndex, block_index: usize) -> u64 {
    ((piece_index as u64) << 32) | block_index as u64
}

fn unpack_key(key: u64) -> (PieceIndex, usize) {
    ((key >> 32) as PieceIndex, (key & 0xffff_ffff) as usize)
}

impl Picker {
    /// Builds a picker for a torrent with `piece_count` pieces, each
    /// `piece_len` bytes except the last (`last_piece_len`), verified
    /// against `piece_hashes` (one 20-byte hash per piece, in order).
    pub(crate) fn new(
        piece_count: usize,
        piece_len: u32,
        last_piece_len: u32,
        piece_hashes: &[Sha1Hash],
        max_peers: usize,
        conf: PickerConf,
    ) -> Self {
        debug_assert_eq!(piece_hashes.len(), piece_count);
        let pieces: Vec<PieceState> = (0..piece_count)
            .map(|i| {
                let len = if i == piece_count - 1 {
                    last_piece_len
                } else {
                    piece_len
                };
                PieceState::new(i, len, piece_hashes[i])
            })
            .collect();
        let remaining_blocks = pieces.iter().map(|p| p.block_count()).sum();
        let mut buckets = AvailabilityBuckets::new(piece_count, max_peers);
        for i in 0..piece_count {
            buckets.insert_at_zero(i);
        }
        Self {
            pieces,
            buckets,
            peer_assignments: HashMap::new(),
            peer_inflight_count: HashMap::new(),
            global_inflight: 0,
            remaining_blocks,
            endgame: false,
            verified_count: 0,
            wanted: None,
            conf,
            seq_next_piece: 0,
            seq_next_block: 0,
        }
    }

    /// Restricts assignment to the given set of wanted pieces (selective
    /// download). `None` (the default) wants everything.
    pub(crate) fn set_wanted(&mut self, wanted: Option<Bitfield>) {
        self.wanted = wanted;
    }

    fn is_wanted(&self, piece_index: PieceIndex) -> bool {
        self.wanted.as_ref().map(|w| w.has(piece_index)).unwrap_or(true)
    }

    // -- availability -----------------------------------------------------

    /// Adopts a peer's full bitfield, incrementing availability for every
    /// piece it has. Does not assign any blocks.
    pub(crate) fn on_peer_bitfield(&mut self, bf: &Bitfield) {
        for i in 0..self.pieces.len() {
            // only update when the peer actually has the piece -- seeing
            // this spelled out explicitly matters, because a past version
            // of this logic updated availability unconditionally here,
            // which overcounted every peer as having every piece.
            if bf.has(i) {
                self.pieces[i].availability += 1;
                if !self.pieces[i].verified {
                    self.buckets.bump(i);
                }
            }
        }
    }

    /// A peer just announced (via Have) that it now has `idx`.
    pub(crate) fn on_peer_have(&mut self, idx: PieceIndex) {
        if let Some(piece) = self.pieces.get_mut(idx) {
            piece.availability += 1;
            if !piece.verified {
                self.buckets.bump(idx);
            }
        }
    }

    /// A peer disconnected. Decrements availability for every piece in its
    /// (final known) bitfield and releases every block it owned back to
    /// `Want`, reclaiming the sequential cursor if possible.
    pub(crate) fn on_peer_gone(&mut self, peer: PeerAddr, bf: &Bitfield) {
        for i in 0..self.pieces.len() {
            if bf.has(i) {
                let piece = &mut self.pieces[i];
                piece.availability = piece.availability.saturating_sub(1);
                if !piece.verified {
                    self.buckets.drop_one(i);
                }
            }
        }

        if let Some(keys) = self.peer_assignments.remove(&peer) {
            for key in keys {
                let (piece_index, block_index) = unpack_key(key);
                if let Some(piece) = self.pieces.get_mut(piece_index) {
                    if let Some(block) = piece.blocks.get_mut(block_index) {
                        if block.owners.remove(&peer).is_some()
                            && block.owners.is_empty()
                            && block.status == BlockStatus::Inflight
                        {
                            block.status = BlockStatus::Want;
                            self.global_inflight = self.global_inflight.saturating_sub(1);
                            // retreat the sequential cursor only if this
                            // freed block is strictly earlier: both the
                            // piece and block index must be checked, to
                            // avoid retreating across an already-verified
                            // piece that happens to share a lower piece
                            // index coincidentally.
                            if piece_index < self.seq_next_piece
                                || (piece_index == self.seq_next_piece
                                    && block_index < self.seq_next_block)
                            {
                                self.seq_next_piece = piece_index;
                                self.seq_next_block = block_index;
                            }
                        }
                    }
                }
            }
        }
        self.peer_inflight_count.remove(&peer);
    }

    // -- receiving blocks ---------------------------------------------------

    /// A block finished downloading from `peer`. Returns whether its piece
    /// is now fully downloaded, plus cancels to send to every other owner
    /// (endgame duplicates that are now redundant).
    pub(crate) fn on_block_received(
        &mut self,
        peer: PeerAddr,
        piece_index: PieceIndex,
        begin: u32,
    ) -> (bool, Vec<Cancel>) {
        let block_index = (begin / crate::BLOCK_LEN) as usize;
        let mut cancels = Vec::new();

        let piece = match self.pieces.get_mut(piece_index) {
            Some(p) => p,
            None => return (false, cancels),
        };
        let block = match piece.blocks.get_mut(block_index) {
            Some(b) => b,
            None => return (false, cancels),
        };
        if block.status == BlockStatus::Done {
            // already delivered by another owner before this one arrived
            return (piece.done_blocks == piece.blocks.len(), cancels);
        }

        for (owner, _) in block.owners.drain() {
            self.global_inflight = self.global_inflight.saturating_sub(1);
            if let Some(count) = self.peer_inflight_count.get_mut(&owner) {
                *count = count.saturating_sub(1);
            }
            if let Some(keys) = self.peer_assignments.get_mut(&owner) {
                keys.remove(&pack_key(piece_index, block_index));
            }
            if owner != peer {
                cancels.push(Cancel {
                    peer: owner,
                    piece_index,
                    begin,
                });
            }
        }
        block.status = BlockStatus::Done;
        piece.done_blocks += 1;
        self.remaining_blocks = self.remaining_blocks.saturating_sub(1);
        self.update_endgame();

        (piece.done_blocks == piece.blocks.len(), cancels)
    }

    /// A specific request timed out without a reply.
    pub(crate) fn on_timeout(&mut self, peer: PeerAddr, piece_index: PieceIndex, begin: u32) {
        let block_index = (begin / crate::BLOCK_LEN) as usize;
        if let Some(piece) = self.pieces.get_mut(piece_index) {
            if let Some(block) = piece.blocks.get_mut(block_index) {
                if block.owners.remove(&peer).is_some() {
                    self.global_inflight = self.global_inflight.saturating_sub(1);
                    if let Some(count) = self.peer_inflight_count.get_mut(&peer) {
                        *count = count.saturating_sub(1);
                    }
                    if let Some(keys) = self.peer_assignments.get_mut(&peer) {
                        keys.remove(&pack_key(piece_index, block_index));
                    }
                    if block.owners.is_empty() && block.status == BlockStatus::Inflight {
                        block.status = BlockStatus::Want;
                    }
                }
            }
        }
    }

    /// Scans every in-flight block for owners whose request has been
    /// outstanding longer than `request_timeout`, calling [`Self::on_timeout`]
    /// for each and returning a record per timed-out owner so the caller can
    /// emit a CANCEL on the wire.
    pub(crate) fn scan_timeouts(&mut self, now: Instant) -> Vec<TimedOutRequest> {
        let timeout = self.conf.request_timeout;
        let mut timed_out = Vec::new();
        for piece in &self.pieces {
            if piece.verified {
                continue;
            }
            for (block_index, block) in piece.blocks.iter().enumerate() {
                for (&peer, owner) in &block.owners {
                    if now.saturating_duration_since(owner.sent_at) > timeout {
                        timed_out.push(TimedOutRequest {
                            peer,
                            piece_index: piece.index,
                            begin: block_index as u32 * crate::BLOCK_LEN,
                        });
                    }
                }
            }
        }
        for t in &timed_out {
            self.on_timeout(t.peer, t.piece_index, t.begin);
        }
        timed_out
    }

    /// Marks the outcome of verifying a flushed piece. On success, the
    /// piece becomes terminal and is dropped from the availability index.
    /// On failure every block reverts to `Want` (owners must already be
    /// empty -- a piece is only flushed once all its blocks are `Done`).
    pub(crate) fn mark_piece_verified(&mut self, idx: PieceIndex, ok: bool) {
        let piece = match self.pieces.get_mut(idx) {
            Some(p) => p,
            None => return,
        };
        if ok {
            piece.verified = true;
            self.verified_count += 1;
            self.buckets.remove(idx);
            if idx == self.seq_next_piece {
                self.seq_next_piece += 1;
                self.seq_next_block = 0;
            }
        } else {
            debug_assert!(piece.blocks.iter().all(|b| b.owners.is_empty()));
            let was_done = piece.done_blocks;
            for block in &mut piece.blocks {
                block.status = BlockStatus::Want;
            }
            piece.done_blocks = 0;
            self.remaining_blocks += was_done;
            self.update_endgame();
        }
    }

    fn update_endgame(&mut self) {
        self.endgame = self.remaining_blocks <= self.conf.endgame_threshold;
    }

    // -- observers ----------------------------------------------------------

    pub(crate) fn piece_states(&self) -> &[PieceState] {
        &self.pieces
    }

    /// The bitfield of verified pieces.
    pub(crate) fn bitfield(&self) -> Bitfield {
        let mut bf = Bitfield::new(self.pieces.len());
        for piece in &self.pieces {
            if piece.verified {
                bf.set(piece.index);
            }
        }
        bf
    }

    /// The lowest-indexed unverified piece, if any remain.
    pub(crate) fn current_piece_index(&self) -> Option<PieceIndex> {
        self.pieces.iter().find(|p| !p.verified).map(|p| p.index)
    }

    /// Total bytes across pieces that have not yet been verified, the
    /// `left` field of a tracker announce.
    pub(crate) fn bytes_left(&self) -> u64 {
        self.pieces
            .iter()
            .filter(|p| !p.verified)
            .map(|p| p.len as u64)
            .sum()
    }

    /// Whether every piece has been verified.
    pub(crate) fn is_complete(&self) -> bool {
        self.verified_count == self.pieces.len()
    }

    pub(crate) fn capacity_for_peer(&self, peer: PeerAddr) -> usize {
        let per_peer_left = self
            .conf
            .max_inflight_per_peer
            .saturating_sub(*self.peer_inflight_count.get(&peer).unwrap_or(&0));
        let global_left = self
            .conf
            .max_global_inflight
            .saturating_sub(self.global_inflight);
        per_peer_left.min(global_left)
    }

    pub(crate) fn has_any_wanted_piece(&self, bf: &Bitfield) -> bool {
        self.pieces
            .iter()
            .any(|p| !p.verified && bf.has(p.index) && self.is_wanted(p.index))
    }

    pub(crate) fn is_endgame(&self) -> bool {
        self.endgame
    }

    // -- selection ------------------------------------------------------

    fn block_eligible(&self, piece: &PieceState, block_index: usize) -> bool {
        let block = &piece.blocks[block_index];
        match block.status {
            BlockStatus::Want => block.owners.len() < self.conf.max_requests_per_block.max(1),
            BlockStatus::Inflight => {
                self.endgame && block.owners.len() < self.conf.endgame_dup_per_block
            }
            BlockStatus::Done => false,
        }
    }

    fn piece_eligible(&self, piece: &PieceState, has: &Bitfield) -> bool {
        !piece.verified && has.has(piece.index) && self.is_wanted(piece.index)
    }

    fn assign_block(
        &mut self,
        peer: PeerAddr,
        piece_index: PieceIndex,
        block_index: usize,
        now: Instant,
    ) -> Request {
        let piece = &mut self.pieces[piece_index];
        let block = &mut piece.blocks[block_index];
        block.status = BlockStatus::Inflight;
        block.owners.insert(peer, Owner { sent_at: now });

        self.peer_assignments
            .entry(peer)
            .or_default()
            .insert(pack_key(piece_index, block_index));
        *self.peer_inflight_count.entry(peer).or_insert(0) += 1;
        self.global_inflight += 1;

        let offset = block_index as u32 * crate::BLOCK_LEN;
        let len = block_len(piece.len, block_index);
        BlockInfo {
            piece_index,
            offset,
            len,
        }
    }

    /// Returns up to `capacity_for_peer(view.peer)` new block assignments
    /// for `view`'s peer, dispatching on the configured strategy.
    pub(crate) fn next_for_peer(&mut self, view: PeerView<'_>) -> Vec<Request> {
        if !view.unchoked {
            return Vec::new();
        }
        let limit = self.capacity_for_peer(view.peer);
        if limit == 0 {
            return Vec::new();
        }

        let effective_strategy = if self.conf.strategy == PieceDownloadStrategy::Random
            && self.verified_count >= self.conf.random_first_threshold
        {
            PieceDownloadStrategy::RarestFirst
        } else {
            self.conf.strategy
        };

        match effective_strategy {
            PieceDownloadStrategy::Sequential => self.next_sequential(view, limit),
            PieceDownloadStrategy::RarestFirst => self.next_rarest_first(view, limit),
            PieceDownloadStrategy::Random => self.next_random_first(view, limit),
        }
    }

    fn next_sequential(&mut self, view: PeerView<'_>, limit: usize) -> Vec<Request> {
        let now = Instant::now();
        let mut out = Vec::new();

        while self.seq_next_piece < self.pieces.len()
            && self.pieces[self.seq_next_piece].verified
        {
            self.seq_next_piece += 1;
            self.seq_next_block = 0;
        }

        let mut piece_index = self.seq_next_piece;
        let mut block_index = self.seq_next_block;
        while piece_index < self.pieces.len() {
            if self.piece_eligible(&self.pieces[piece_index], view.has) {
                let block_count = self.pieces[piece_index].block_count();
                while block_index < block_count && out.len() < limit {
                    if self.block_eligible(&self.pieces[piece_index], block_index) {
                        out.push(self.assign_block(view.peer, piece_index, block_index, now));
                    }
                    block_index += 1;
                }
            }
            // A piece that yielded at least one assignment this call is
            // where the scan stops for this peer, even if `limit` isn't
            // exhausted -- this call stays within the current piece so a
            // second peer's call can pick up wherever this one left off,
            // rather than one peer draining every remaining piece. Only a
            // piece that offered nothing this call (already fully owned,
            // or the peer lacks it) is skipped in search of the next one.
            if !out.is_empty() {
                break;
            }
            piece_index += 1;
            block_index = 0;
        }

        self.seq_next_piece = piece_index;
        self.seq_next_block = block_index;

        out
    }

    fn next_rarest_first(&mut self, view: PeerView<'_>, limit: usize) -> Vec<Request> {
        let now = Instant::now();
        let mut out = Vec::new();
        let mut rng = rand::thread_rng();

        let candidate_pieces: Vec<PieceIndex> = {
            let mut levels: Vec<PieceIndex> = self
                .buckets
                .rarest_nonempty_levels()
                .flatten()
                .copied()
                .collect();
            levels.shuffle(&mut rng);
            levels
        };

        for piece_index in candidate_pieces {
            if out.len() >= limit {
                break;
            }
            if !self.piece_eligible(&self.pieces[piece_index], view.has) {
                continue;
            }
            let block_count = self.pieces[piece_index].block_count();
            for block_index in 0..block_count {
                if out.len() >= limit {
                    break;
                }
                if self.block_eligible(&self.pieces[piece_index], block_index) {
                    out.push(self.assign_block(view.peer, piece_index, block_index, now));
                }
            }
        }
        out
    }

    fn next_random_first(&mut self, view: PeerView<'_>, limit: usize) -> Vec<Request> {
        let now = Instant::now();
        let mut out = Vec::new();
        let mut rng = rand::thread_rng();

        let mut candidates: Vec<PieceIndex> = self
            .pieces
            .iter()
            .filter(|p| self.piece_eligible(p, view.has))
            .map(|p| p.index)
            .collect();
        candidates.shuffle(&mut rng);

        for piece_index in candidates {
            if out.len() >= limit {
                break;
            }
            let block_count = self.pieces[piece_index].block_count();
            for block_index in 0..block_count {
                if out.len() >= limit {
                    break;
                }
                if self.block_eligible(&self.pieces[piece_index], block_index) {
                    out.push(self.assign_block(view.peer, piece_index, block_index, now));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> PeerAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn conf(strategy: PieceDownloadStrategy) -> PickerConf {
        PickerConf {
            strategy,
            max_global_inflight: 100,
            max_inflight_per_peer: 100,
            max_requests_per_block: 1,
            endgame_threshold: 32,
            endgame_dup_per_block: 2,
            request_timeout: Duration::from_secs(30),
            random_first_threshold: 4,
        }
    }

    fn two_piece_picker(strategy: PieceDownloadStrategy) -> Picker {
        // 2 pieces, 32 KiB each, 2 blocks of 16 KiB per piece
        let hashes = [[0u8; 20], [1u8; 20]];
        let mut picker = Picker::new(2, 32 * 1024, 32 * 1024, &hashes, 10, conf(strategy));
        let bf = Bitfield::new(2).tap_all_set();
        picker.on_peer_bitfield(&bf);
        picker
    }

    trait TapAllSet {
        fn tap_all_set(self) -> Self;
    }
    impl TapAllSet for Bitfield {
        fn tap_all_set(mut self) -> Self {
            for i in 0..self.len() {
                self.set(i);
            }
            self
        }
    }

    #[test]
    fn sequential_assigns_in_piece_order_per_peer() {
        let mut picker = two_piece_picker(PieceDownloadStrategy::Sequential);
        let bf = Bitfield::new(2).tap_all_set();

        let a = addr(1);
        let reqs_a = picker.next_for_peer(PeerView {
            peer: a,
            has: &bf,
            unchoked: true,
        });
        assert_eq!(
            reqs_a,
            vec![
                BlockInfo { piece_index: 0, offset: 0, len: 16384 },
                BlockInfo { piece_index: 0, offset: 16384, len: 16384 },
            ]
        );

        let b = addr(2);
        let reqs_b = picker.next_for_peer(PeerView {
            peer: b,
            has: &bf,
            unchoked: true,
        });
        assert_eq!(
            reqs_b,
            vec![
                BlockInfo { piece_index: 1, offset: 0, len: 16384 },
                BlockInfo { piece_index: 1, offset: 16384, len: 16384 },
            ]
        );
    }

    #[test]
    fn endgame_cancel_on_duplicate_owners() {
        let mut picker = two_piece_picker(PieceDownloadStrategy::Sequential);
        // force endgame so duplicate assignment is permitted
        picker.remaining_blocks = 1;
        picker.update_endgame();
        assert!(picker.is_endgame());

        let a = addr(1);
        let b = addr(2);
        let now = Instant::now();
        picker.assign_block(a, 0, 0, now);
        picker.assign_block(b, 0, 0, now);

        let (complete, cancels) = picker.on_block_received(a, 0, 0);
        assert!(!complete);
        assert_eq!(cancels, vec![Cancel { peer: b, piece_index: 0, begin: 0 }]);
        assert_eq!(picker.global_inflight, 0);
        assert_eq!(picker.peer_inflight_count.get(&a).copied().unwrap_or(0), 0);
        assert_eq!(picker.peer_inflight_count.get(&b).copied().unwrap_or(0), 0);
    }

    #[test]
    fn peer_gone_releases_blocks_and_availability() {
        let hashes = [[0u8; 20], [1u8; 20]];
        let mut picker = Picker::new(
            2,
            32 * 1024,
            32 * 1024,
            &hashes,
            10,
            conf(PieceDownloadStrategy::Sequential),
        );
        let a = addr(1);
        let bf = Bitfield::new(2).tap_all_set();
        picker.on_peer_bitfield(&bf);

        let now = Instant::now();
        picker.assign_block(a, 0, 0, now);
        picker.assign_block(a, 1, 1, now);

        picker.on_peer_gone(a, &bf);

        assert_eq!(picker.pieces[0].availability, 0);
        assert_eq!(picker.pieces[1].availability, 0);
        assert_eq!(picker.pieces[0].blocks[0].status, BlockStatus::Want);
        assert!(picker.pieces[0].blocks[0].owners.is_empty());
        assert_eq!(picker.pieces[1].blocks[1].status, BlockStatus::Want);
        assert!(!picker.peer_assignments.contains_key(&a));
        assert!(!picker.peer_inflight_count.contains_key(&a));
    }

    #[test]
    fn verified_piece_leaves_availability_index() {
        let mut picker = two_piece_picker(PieceDownloadStrategy::RarestFirst);
        picker.mark_piece_verified(0, true);
        assert!(picker.pieces[0].verified);
        assert_eq!(picker.current_piece_index(), Some(1));
        assert!(picker.bitfield().has(0));
        assert!(!picker.bitfield().has(1));
    }

    #[test]
    fn failed_verification_resets_blocks_to_want() {
        let mut picker = two_piece_picker(PieceDownloadStrategy::Sequential);
        let a = addr(1);
        let now = Instant::now();
        let req0 = picker.assign_block(a, 0, 0, now);
        let req1 = picker.assign_block(a, 0, 1, now);
        picker.on_block_received(a, 0, req0.offset);
        picker.on_block_received(a, 0, req1.offset);
        assert_eq!(picker.pieces[0].done_blocks, 2);

        picker.mark_piece_verified(0, false);
        assert!(!picker.pieces[0].verified);
        assert_eq!(picker.pieces[0].done_blocks, 0);

        let statuses: Vec<BlockStatus> =
            picker.pieces[0].blocks.iter().map(|b| b.status).collect();
        pretty_assertions::assert_eq!(
            statuses,
            vec![BlockStatus::Want; picker.pieces[0].blocks.len()]
        );
    }

    #[test]
    fn choked_peer_gets_nothing() {
        let mut picker = two_piece_picker(PieceDownloadStrategy::Sequential);
        let bf = Bitfield::new(2).tap_all_set();
        let reqs = picker.next_for_peer(PeerView {
            peer: addr(1),
            has: &bf,
            unchoked: false,
        });
        assert!(reqs.is_empty());
    }
}
