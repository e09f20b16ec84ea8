//! Collective operations built on the point-to-point primitives.
//!
//! The reduction protocol is gather-to-root then broadcast, each step on its
//! own reserved tag. Every rank of the world must enter the collective with
//! the same tag pair or the ranks deadlock; the scheduler allocates tags
//! from a counter that advances identically on every rank (same graph, same
//! phase order), which is what makes the rendezvous deterministic.

use crate::comm::{Communicator, Wait};
use crate::task::ReductionOp;
use crate::warehouse::{bytes_to_scalars, scalars_to_bytes};
use bytes::Bytes;

/// Combine `local` across all ranks with `op`; every rank returns the same
/// result. Contributions may differ in length; shorter ones are padded with
/// the op identity.
pub fn reduce_scalars<C: Communicator>(
    comm: &C,
    op: ReductionOp,
    local: &[f64],
    gather_tag: u16,
    bcast_tag: u16,
) -> Vec<f64> {
    let size = comm.size();
    if size == 1 {
        return local.to_vec();
    }
    if comm.rank() == 0 {
        let mut acc = local.to_vec();
        for src in 1..size {
            let raw = comm.irecv(src, gather_tag).wait();
            let part = bytes_to_scalars(&Bytes::from(raw));
            combine_into(op, &mut acc, &part);
        }
        let payload = scalars_to_bytes(&acc);
        let mut sends = Vec::with_capacity(size - 1);
        for dst in 1..size {
            sends.push(comm.isend(dst, bcast_tag, &payload));
        }
        for s in sends {
            s.wait();
        }
        acc
    } else {
        let send = comm.isend(0, gather_tag, &scalars_to_bytes(local));
        send.wait();
        let raw = comm.irecv(0, bcast_tag).wait();
        bytes_to_scalars(&Bytes::from(raw))
    }
}

fn combine_into(op: ReductionOp, acc: &mut Vec<f64>, part: &[f64]) {
    if part.len() > acc.len() {
        acc.resize(part.len(), op.identity());
    }
    for (a, &p) in acc.iter_mut().zip(part) {
        *a = op.combine(*a, p);
    }
}

/// Logical-OR all-reduce of one flag, used to propagate the cooperative
/// restart decision.
pub fn allreduce_or<C: Communicator>(
    comm: &C,
    flag: bool,
    gather_tag: u16,
    bcast_tag: u16,
) -> bool {
    let size = comm.size();
    if size == 1 {
        return flag;
    }
    if comm.rank() == 0 {
        let mut acc = flag;
        for src in 1..size {
            let raw = comm.irecv(src, gather_tag).wait();
            acc |= raw.first().copied().unwrap_or(0) != 0;
        }
        let payload = [u8::from(acc)];
        let mut sends = Vec::with_capacity(size - 1);
        for dst in 1..size {
            sends.push(comm.isend(dst, bcast_tag, &payload));
        }
        for s in sends {
            s.wait();
        }
        acc
    } else {
        comm.isend(0, gather_tag, &[u8::from(flag)]).wait();
        let raw = comm.irecv(0, bcast_tag).wait();
        raw.first().copied().unwrap_or(0) != 0
    }
}
