//! LET collective exchange.
//!
//! Grounded in `examples/original_source/include/tree_mpi.h`'s `commBodies`,
//! `commCells`, and `alltoallv_p2p`: one collective round to learn how much each
//! peer will send (`exchange_counts`), then either a collective `Alltoallv` or a
//! pairwise non-blocking `Isend`/`Irecv` sweep to move the payload itself.

use mpi::collective::SystemOperation;
use mpi::datatype::{Partition, PartitionMut};
use mpi::topology::{Rank, UserCommunicator};
use mpi::traits::*;
use mpi::Count;

use crate::body::Body;
use crate::cell::Cell;

/// All-to-all exchange of per-rank counts; returns what each peer will send us.
pub fn exchange_counts(world: &UserCommunicator, send_counts: &[Count]) -> Vec<Count> {
    let mut recv_counts = vec![0 as Count; send_counts.len()];
    world.all_to_all_into(send_counts, &mut recv_counts[..]);
    recv_counts
}

fn displacements(counts: &[Count]) -> Vec<Count> {
    let mut displs = Vec::with_capacity(counts.len());
    let mut running = 0;
    for &c in counts {
        displs.push(running);
        running += c;
    }
    displs
}

/// Collective `Alltoallv` exchange of a per-rank-partitioned body buffer.
pub fn alltoallv_bodies(world: &UserCommunicator, send: &[Vec<Body>]) -> Vec<Body> {
    let send_counts: Vec<Count> = send.iter().map(|v| v.len() as Count).collect();
    let send_displs = displacements(&send_counts);
    let send_flat: Vec<Body> = send.iter().flatten().copied().collect();

    let recv_counts = exchange_counts(world, &send_counts);
    let recv_displs = displacements(&recv_counts);
    let total_recv: Count = recv_counts.iter().sum();

    let mut recv_flat = vec![Body::default(); total_recv as usize];

    let send_partition = Partition::new(&send_flat[..], send_counts, &send_displs[..]);
    let mut recv_partition = PartitionMut::new(&mut recv_flat[..], recv_counts, &recv_displs[..]);
    world.all_to_all_varcount_into(&send_partition, &mut recv_partition);

    recv_flat
}

/// Collective `Alltoallv` exchange of a per-rank-partitioned cell buffer.
///
/// Cells are not rewritten here: each rank's segment already has `iparent`/
/// `ichild` expressed relative to its own segment (see `let_select.rs`); the
/// attacher (`attach.rs`) is responsible for offsetting them once segment
/// boundaries are known on the receiving side.
pub fn alltoallv_cells(world: &UserCommunicator, send: &[Vec<Cell>]) -> (Vec<Cell>, Vec<Count>, Vec<Count>) {
    let send_counts: Vec<Count> = send.iter().map(|v| v.len() as Count).collect();
    let send_displs = displacements(&send_counts);
    let send_flat: Vec<Cell> = send.iter().flatten().cloned().collect();

    let recv_counts = exchange_counts(world, &send_counts);
    let recv_displs = displacements(&recv_counts);
    let total_recv: Count = recv_counts.iter().sum();

    let mut recv_flat = vec![Cell::default(); total_recv as usize];

    let send_partition = Partition::new(&send_flat[..], send_counts, &send_displs[..]);
    let mut recv_partition = PartitionMut::new(&mut recv_flat[..], recv_counts, &recv_displs[..]);
    world.all_to_all_varcount_into(&send_partition, &mut recv_partition);

    (recv_flat, recv_counts, recv_displs)
}

/// Tracks whether `recv_bodies` already holds a full shuffle's worth of valid
/// data from a prior `alltoall`, the precondition the self-partition fast path
/// in `alltoallv_p2p` relies on (spec §9, Open Question 2).
#[derive(Default)]
pub struct BodyExchangeState {
    pub recv_bodies: Vec<Body>,
    pub populated: bool,
}

/// Point-to-point alternative to `alltoallv_bodies`: posts non-blocking receives,
/// then non-blocking sends, copies the self segment locally, then waits on both.
/// Better overlap with compute than a collective when most peers have nothing to
/// exchange with most other peers.
///
/// Short-circuits (returns the cached `state.recv_bodies` unchanged) only when
/// both (a) this rank's full local body count equals `send[my_rank].len()` and
/// (b) `state.populated` is already `true` — i.e. a prior `alltoall` already
/// established the receive buffer, so a full reshuffle is a no-op.
pub fn alltoallv_p2p(
    world: &UserCommunicator,
    send: &[Vec<Body>],
    recv_counts: &[Count],
    state: &mut BodyExchangeState,
) {
    let my_rank = world.rank() as usize;
    let send_total: Count = send.iter().map(|v| v.len() as Count).sum();
    let recv_total: Count = recv_counts.iter().sum();

    if state.populated
        && recv_total == send[my_rank].len() as Count
        && send_total == send[my_rank].len() as Count
    {
        return;
    }

    let recv_displs = displacements(recv_counts);
    let mut recv_flat = vec![Body::default(); recv_total as usize];

    // Split the flat receive buffer into genuinely disjoint per-rank slices up
    // front (recv_displs is increasing in rank order), so the borrow checker can
    // see that every posted receive owns a distinct region.
    let mut recv_slices: Vec<Option<&mut [Body]>> = Vec::with_capacity(recv_counts.len());
    let mut rest: &mut [Body] = &mut recv_flat[..];
    for &count in recv_counts {
        let (head, tail) = rest.split_at_mut(count as usize);
        recv_slices.push(Some(head));
        rest = tail;
    }

    mpi::request::scope(|scope| {
        let mut requests = Vec::new();

        for (rank, slot) in recv_slices.iter_mut().enumerate() {
            if rank == my_rank {
                continue;
            }
            if let Some(slice) = slot.take() {
                if slice.is_empty() {
                    continue;
                }
                let process = world.process_at_rank(rank as Rank);
                requests.push(process.immediate_receive_into(scope, slice));
            }
        }

        for (rank, segment) in send.iter().enumerate() {
            if rank == my_rank || segment.is_empty() {
                continue;
            }
            let process = world.process_at_rank(rank as Rank);
            requests.push(process.immediate_send(scope, &segment[..]));
        }

        for request in requests {
            request.wait();
        }
    });

    let self_start = recv_displs[my_rank] as usize;
    let self_len = send[my_rank].len();
    recv_flat[self_start..self_start + self_len].copy_from_slice(&send[my_rank]);

    state.recv_bodies = recv_flat;
    state.populated = true;
}

/// `MPI_Allreduce` over `SystemOperation::sum()`, used by the request service to
/// check how many peers have flushed.
pub fn allreduce_sum(world: &UserCommunicator, value: Count) -> Count {
    let mut total = 0;
    world.all_reduce_into(&value, &mut total, SystemOperation::sum());
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displacements_are_a_prefix_sum() {
        let counts = vec![3, 0, 2, 5];
        let displs = displacements(&counts);
        assert_eq!(displs, vec![0, 3, 3, 5]);
    }
}
