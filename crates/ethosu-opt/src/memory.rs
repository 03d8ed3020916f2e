//! Memory planning for activation buffers.
//!
//! Computes the live interval of every activation buffer over the
//! operation list and assigns pool offsets with a greedy first-fit
//! allocator. Buffers whose lifetimes do not overlap may share memory.
//! Pools are tried in configuration order; the constant blob is pinned to
//! offset 0 of the first constants pool.

use ethosu_backend_core::{BackendError, HardwareConfig};

/// Placement granularity in bytes.
pub const ALIGNMENT: usize = 16;

/// Rounds `n` up to the placement granularity.
pub fn align(n: usize) -> usize {
    n.div_ceil(ALIGNMENT) * ALIGNMENT
}

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

/// Inclusive lifetime of a buffer, in operation steps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LiveInterval {
    /// Step that writes the buffer (0 for program inputs).
    pub start: usize,
    /// Last step that reads the buffer.
    pub end: usize,
}

impl LiveInterval {
    pub fn overlaps(&self, other: &LiveInterval) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// An activation buffer to place.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferRequest {
    /// Tensor name, reported on exhaustion.
    pub name: String,
    pub size_bytes: usize,
    pub live: LiveInterval,
}

/// Where a buffer landed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    /// Index into the configuration's pool table.
    pub pool: usize,
    pub offset: usize,
}

/// Result of memory planning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryPlan {
    /// One placement per request, in request order.
    pub placements: Vec<Placement>,
    /// High-water mark per pool, constants included.
    pub used: Vec<usize>,
    /// Pool holding the constant blob.
    pub constants_pool: usize,
}

// ---------------------------------------------------------------------------
// Greedy allocator
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
struct Active {
    offset: usize,
    size: usize,
    end: usize,
}

/// First offset at or after `base` where `size` bytes fit between the
/// active allocations.
fn first_fit(active: &mut [Active], base: usize, size: usize) -> usize {
    active.sort_by_key(|a| a.offset);
    let mut offset = base;
    for a in active.iter() {
        if offset + size <= a.offset {
            break;
        }
        offset = offset.max(align(a.offset + a.size));
    }
    offset
}

/// Plans memory for `requests` under `config`, reserving `constants_bytes`
/// at the start of the constants pool.
pub fn plan_memory(
    requests: &[BufferRequest],
    config: &HardwareConfig,
    constants_bytes: usize,
) -> Result<MemoryPlan, BackendError> {
    let constants_pool = config.constants_pool().ok_or_else(|| BackendError::ResourceExhausted {
        tensor: "constants".into(),
        required: constants_bytes,
        available: 0,
    })?;

    let mut base = vec![0usize; config.pools.len()];
    let mut used = vec![0usize; config.pools.len()];
    let capacity = config.pools[constants_pool].capacity;
    if constants_bytes > capacity {
        return Err(BackendError::ResourceExhausted {
            tensor: "constants".into(),
            required: constants_bytes,
            available: capacity,
        });
    }
    base[constants_pool] = align(constants_bytes);
    used[constants_pool] = constants_bytes;

    // Process by start step, larger buffers first.
    let mut order: Vec<usize> = (0..requests.len()).collect();
    order.sort_by(|&a, &b| {
        let (ra, rb) = (&requests[a], &requests[b]);
        ra.live
            .start
            .cmp(&rb.live.start)
            .then(rb.size_bytes.cmp(&ra.size_bytes))
            .then(a.cmp(&b))
    });

    let mut active: Vec<Vec<Active>> = vec![Vec::new(); config.pools.len()];
    let mut placements = vec![Placement { pool: 0, offset: 0 }; requests.len()];

    for index in order {
        let request = &requests[index];
        for pool in active.iter_mut() {
            pool.retain(|a| a.end >= request.live.start);
        }

        let mut best_available = 0usize;
        let mut placed = None;
        for (p, pool) in config.pools.iter().enumerate() {
            if !pool.activations {
                continue;
            }
            let offset = first_fit(&mut active[p], base[p], request.size_bytes);
            if offset + request.size_bytes <= pool.capacity {
                placed = Some(Placement { pool: p, offset });
                break;
            }
            best_available = best_available.max(pool.capacity.saturating_sub(offset));
        }

        let Some(placement) = placed else {
            return Err(BackendError::ResourceExhausted {
                tensor: request.name.clone(),
                required: request.size_bytes,
                available: best_available,
            });
        };
        active[placement.pool].push(Active {
            offset: placement.offset,
            size: request.size_bytes,
            end: request.live.end,
        });
        used[placement.pool] = used[placement.pool].max(placement.offset + request.size_bytes);
        placements[index] = placement;
    }

    log::debug!(
        "memory plan: {} buffer(s), {} constant byte(s), usage {:?}",
        requests.len(),
        constants_bytes,
        used
    );
    Ok(MemoryPlan {
        placements,
        used,
        constants_pool,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
