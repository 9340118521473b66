//! The piece scheduler: decides which blocks to request from which peer.
//!
//! The scheduler runs as a pass over the torrent's shared state, once a
//! second and always on the torrent task. It assigns whole pieces to single
//! sessions; blocks that exceed a session's request queue wait in the
//! assignment and are topped up on later passes. Re-running a pass is
//! idempotent: claimed pieces are not claimed again and a block pending on
//! a session is never re-sent.
//!
//! Peer bitmaps and choke flags are read through snapshots and atomics that
//! may lag the sessions; a session getting a request volley while choked
//! simply gives the blocks back.

use std::{
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
};

use crate::{
    peer::{PeerHandle, SessionCommand},
    torrent::{PieceAssignment, TorrentContext},
    BlockInfo, PieceIndex,
};

/// No more than this much data is kept on the wire across all sessions.
const MAX_OUTSTANDING_BYTES: u64 = 1 << 30;

/// Until this many pieces are verified, pieces are picked in index order no
/// matter the configured mode. The first pieces complete faster that way,
/// while the swarm view is still too thin for rarity to mean much.
const BOOTSTRAP_PIECES: usize = 4;

/// Runs one scheduling pass over the torrent.
pub(crate) fn schedule(ctx: &TorrentContext) {
    // sessions sorted by address, so that ties in piece placement always
    // resolve the same way
    let mut peers: Vec<(SocketAddr, Arc<PeerHandle>)> = ctx
        .peers
        .read()
        .unwrap()
        .iter()
        .map(|(addr, handle)| (*addr, Arc::clone(handle)))
        .collect();
    peers.sort_by_key(|(addr, _)| *addr);
    if peers.is_empty() {
        return;
    }

    top_up_assignments(ctx, &peers);
    place_new_pieces(ctx, &peers);
}

/// Sends the still-unplaced blocks of claimed pieces to their owners, as
/// far as their request queues allow. Claims whose owner is gone or choking
/// are released so the piece can be reassigned.
fn top_up_assignments(ctx: &TorrentContext, peers: &[(SocketAddr, Arc<PeerHandle>)]) {
    let mut assignments = ctx.assignments.lock().unwrap();
    let mut released: Vec<PieceIndex> = Vec::new();

    for (piece_index, assignment) in assignments.iter_mut() {
        let owner = peers
            .iter()
            .find(|(addr, _)| *addr == assignment.owner)
            .map(|(_, handle)| handle);
        let owner = match owner {
            Some(handle) if !handle.is_choking_us() => handle,
            // a choked owner has already drained its pending set, so the
            // whole piece is safe to hand to someone else
            _ => {
                released.push(*piece_index);
                continue;
            }
        };
        if assignment.unplaced.is_empty() {
            continue;
        }

        let volley = request_volley(owner, &mut assignment.unplaced);
        if !volley.is_empty() {
            let _ = owner.cmd.send(SessionCommand::Request(volley));
        }
    }

    for piece_index in released {
        assignments.remove(&piece_index);
    }
}

/// Claims not-yet-assigned pieces for eligible sessions, in the order the
/// torrent's mode dictates, until the outstanding-work cap is reached.
fn place_new_pieces(ctx: &TorrentContext, peers: &[(SocketAddr, Arc<PeerHandle>)]) {
    let own = ctx.own_pieces.snapshot();
    let order = piece_order(ctx, peers);

    let mut assignments = ctx.assignments.lock().unwrap();
    let mut outstanding =
        assignments.len() as u64 * ctx.storage.piece_len as u64;

    for piece_index in order {
        if outstanding >= MAX_OUTSTANDING_BYTES {
            break;
        }
        if own[piece_index] || assignments.contains_key(&piece_index) {
            continue;
        }

        for (addr, handle) in peers {
            if handle.is_choking_us() {
                continue;
            }
            if !handle.pieces.get(piece_index).unwrap_or_default() {
                continue;
            }

            let mut blocks = match ctx.storage.block_requests(piece_index) {
                Ok(blocks) => blocks,
                Err(_) => break,
            };
            // keep the canonical order: requests go out front-to-back and
            // the remainder waits
            blocks.reverse();
            let volley = request_volley(handle, &mut blocks);
            if volley.is_empty() {
                // the session's queue is full, try the next one
                continue;
            }
            let _ = handle.cmd.send(SessionCommand::Request(volley));
            assignments.insert(
                piece_index,
                PieceAssignment {
                    owner: *addr,
                    unplaced: blocks,
                },
            );
            outstanding += ctx.storage.piece_len as u64;
            break;
        }
    }
}

/// Moves as many blocks as the session's queue has room for from the
/// given stack (popped from the back) into its pending set. Blocks already
/// pending are dropped rather than re-sent.
fn request_volley(handle: &Arc<PeerHandle>, blocks: &mut Vec<BlockInfo>) -> Vec<BlockInfo> {
    let cap = handle.request_queue_len.load(Ordering::Relaxed);
    let mut pending = handle.pending.lock().unwrap();
    let mut volley = Vec::new();
    while pending.len() < cap {
        let block = match blocks.pop() {
            Some(block) => block,
            None => break,
        };
        if pending.insert(block) {
            volley.push(block);
        }
    }
    volley
}

/// The order in which missing pieces are considered: index order while
/// bootstrapping or when configured sequential, ascending rarity
/// otherwise. Ties always break towards the lower index.
fn piece_order(
    ctx: &TorrentContext,
    peers: &[(SocketAddr, Arc<PeerHandle>)],
) -> Vec<PieceIndex> {
    let piece_count = ctx.storage.piece_count;
    if ctx.sequential || ctx.own_pieces.count() < BOOTSTRAP_PIECES {
        return (0..piece_count).collect();
    }

    let mut weights = vec![0u32; piece_count];
    for (_, handle) in peers {
        let pieces = handle.pieces.snapshot();
        if pieces.not_any() {
            continue;
        }
        for piece_index in pieces.iter_ones() {
            weights[piece_index] += 1;
        }
    }

    let mut order: Vec<PieceIndex> = (0..piece_count)
        .filter(|index| weights[*index] > 0)
        .collect();
    order.sort_by_key(|index| (weights[*index], *index));
    order
}
