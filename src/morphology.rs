// src/morphology.rs - Topology-preserving 3D thinning to a curve skeleton

use log::debug;
use rayon::prelude::*;

use crate::volume::{foreground_voxels, offset_index, BinaryVolume, Idx3d, Offset3d};

/// Reduces a binary volume to a 1-voxel-wide, connectivity-preserving skeleton
pub trait Skeletonizer {
    fn skeletonize(&self, mask: &BinaryVolume) -> BinaryVolume;
}

/// Directional border thinning.
///
/// Each pass peels simple, non-end border voxels facing one of six
/// directions. Candidates of a pass are collected in parallel, then
/// re-checked and removed sequentially.
/// Thinning stops after a full cycle of directions removes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectionalThinning;

/// Border directions in peeling order: north, south, east, west, up, down
const BORDER_DIRECTIONS: [Offset3d; 6] = [
    (0, -1, 0),
    (0, 1, 0),
    (0, 0, 1),
    (0, 0, -1),
    (1, 0, 0),
    (-1, 0, 0),
];

impl Skeletonizer for DirectionalThinning {
    fn skeletonize(&self, mask: &BinaryVolume) -> BinaryVolume {
        let mut volume = mask.clone();
        let mut remaining = foreground_voxels(&volume);
        let mut cycles = 0usize;

        loop {
            cycles += 1;
            let mut removed = 0usize;

            for &direction in &BORDER_DIRECTIONS {
                let candidates: Vec<Idx3d> = remaining
                    .par_iter()
                    .copied()
                    .filter(|&idx| {
                        is_border(&volume, idx, direction)
                            && !is_end_voxel(&volume, idx)
                            && is_simple(&volume, idx)
                    })
                    .collect();

                for idx in candidates {
                    if !is_end_voxel(&volume, idx) && is_simple(&volume, idx) {
                        volume[idx] = false;
                        removed += 1;
                    }
                }
                remaining.retain(|&idx| volume[idx]);
            }

            debug!("Thinning cycle {}: removed {} voxels", cycles, removed);
            if removed == 0 {
                break;
            }
        }

        volume
    }
}

#[inline]
fn is_foreground(volume: &BinaryVolume, idx: Idx3d, offset: Offset3d) -> bool {
    offset_index(idx, offset, volume.dim())
        .map(|n| volume[n])
        .unwrap_or(false)
}

#[inline]
fn is_border(volume: &BinaryVolume, idx: Idx3d, direction: Offset3d) -> bool {
    !is_foreground(volume, idx, direction)
}

/// Foreground 3×3×3 neighbourhood as a bit set, centre excluded.
/// Bit `(dz+1)*9 + (dy+1)*3 + (dx+1)`; outside the volume is background.
fn neighbourhood_bits(volume: &BinaryVolume, idx: Idx3d) -> u32 {
    let mut bits = 0u32;
    for (bit, &(dz, dy, dx)) in CUBE_OFFSETS.iter().enumerate() {
        if bit != CENTRE && is_foreground(volume, idx, (dz, dy, dx)) {
            bits |= 1 << bit;
        }
    }
    bits
}

/// A voxel with exactly one foreground neighbour ends a curve
fn is_end_voxel(volume: &BinaryVolume, idx: Idx3d) -> bool {
    neighbourhood_bits(volume, idx).count_ones() == 1
}

/// Simple-point test through topological numbers: the voxel's foreground
/// neighbours form one 26-component, and the background of its 18-
/// neighbourhood has exactly one 6-component touching a face of the voxel.
pub fn is_simple(volume: &BinaryVolume, idx: Idx3d) -> bool {
    let foreground = neighbourhood_bits(volume, idx);
    if count_components(foreground, &ADJACENT_26, u32::MAX) != 1 {
        return false;
    }
    let background = !foreground & N18_MASK;
    count_components(background, &ADJACENT_6, N6_MASK) == 1
}

/// Components of `set` under `adjacency` that intersect `anchor`
fn count_components(set: u32, adjacency: &[u32; 27], anchor: u32) -> usize {
    let mut remaining = set;
    let mut count = 0;
    while remaining != 0 {
        let seed = remaining.trailing_zeros() as usize;
        let mut component = 1u32 << seed;
        let mut frontier = component;
        while frontier != 0 {
            let i = frontier.trailing_zeros() as usize;
            frontier &= frontier - 1;
            let grown = adjacency[i] & remaining & !component;
            component |= grown;
            frontier |= grown;
        }
        remaining &= !component;
        if component & anchor != 0 {
            count += 1;
        }
    }
    count
}

const CENTRE: usize = 13;

const CUBE_OFFSETS: [Offset3d; 27] = build_cube_offsets();

const fn build_cube_offsets() -> [Offset3d; 27] {
    let mut out = [(0, 0, 0); 27];
    let mut i = 0;
    while i < 27 {
        out[i] = ((i / 9) as isize - 1, ((i / 3) % 3) as isize - 1, (i % 3) as isize - 1);
        i += 1;
    }
    out
}

const fn manhattan(i: usize) -> usize {
    let (dz, dy, dx) = CUBE_OFFSETS[i];
    (dz.unsigned_abs()) + (dy.unsigned_abs()) + (dx.unsigned_abs())
}

const fn neighbourhood_mask(max_manhattan: usize) -> u32 {
    let mut mask = 0u32;
    let mut i = 0;
    while i < 27 {
        let m = manhattan(i);
        if m >= 1 && m <= max_manhattan {
            mask |= 1 << i;
        }
        i += 1;
    }
    mask
}

/// Face neighbours of the centre
const N6_MASK: u32 = neighbourhood_mask(1);
/// Face and edge neighbours of the centre
const N18_MASK: u32 = neighbourhood_mask(2);

const ADJACENT_26: [u32; 27] = build_adjacency(3);
const ADJACENT_6: [u32; 27] = build_adjacency(1);

/// For each cube position, the positions within `max_manhattan` steps whose
/// per-axis difference is at most one
const fn build_adjacency(max_manhattan: usize) -> [u32; 27] {
    let mut table = [0u32; 27];
    let mut i = 0;
    while i < 27 {
        let mut j = 0;
        while j < 27 {
            let (az, ay, ax) = CUBE_OFFSETS[i];
            let (bz, by, bx) = CUBE_OFFSETS[j];
            let dz = (az - bz).unsigned_abs();
            let dy = (ay - by).unsigned_abs();
            let dx = (ax - bx).unsigned_abs();
            let sum = dz + dy + dx;
            if i != j && dz <= 1 && dy <= 1 && dx <= 1 && sum <= max_manhattan {
                table[i] |= 1 << j;
            }
            j += 1;
        }
        i += 1;
    }
    table
}

/// Skeleton of `mask` with the default thinning
pub fn skeletonize(mask: &BinaryVolume) -> BinaryVolume {
    DirectionalThinning.skeletonize(mask)
}
