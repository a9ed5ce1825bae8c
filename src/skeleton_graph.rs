// src/skeleton_graph.rs - Skeleton graph extraction, pruning and branch metrics

use log::debug;
use nalgebra::Point3;
use ndarray::Array3;
use std::collections::{HashMap, HashSet};

use crate::distance::DistanceField;
use crate::volume::{foreground_voxels, neighbours_26, BinaryVolume, Calibration, Idx3d};

/// Tag written for slab and end-point voxels
pub const SLAB_TAG: u8 = 40;
/// Tag written for junction voxels
pub const JUNCTION_TAG: u8 = 200;

/// Role of a skeleton voxel from its foreground neighbour count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoxelClass {
    /// Fewer than two neighbours
    End,
    /// Exactly two neighbours
    Slab,
    /// More than two neighbours
    Junction,
}

fn classify(skeleton: &BinaryVolume, idx: Idx3d) -> VoxelClass {
    match skeleton_neighbours(skeleton, idx).count() {
        0 | 1 => VoxelClass::End,
        2 => VoxelClass::Slab,
        _ => VoxelClass::Junction,
    }
}

fn skeleton_neighbours(skeleton: &BinaryVolume, idx: Idx3d) -> impl Iterator<Item = Idx3d> + '_ {
    neighbours_26(idx, skeleton.dim()).filter(move |&n| skeleton[n])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexKind {
    End,
    Junction,
    /// Arbitrary voxel standing in for a vertex on a closed slab loop
    Loop,
}

#[derive(Debug, Clone)]
pub struct Vertex {
    pub kind: VertexKind,
    pub voxels: Vec<Idx3d>,
}

/// Voxel chain between two vertices
#[derive(Debug, Clone)]
pub struct Edge {
    pub v1: usize,
    pub v2: usize,
    /// Vertex voxel the chain leaves from
    pub start: Idx3d,
    /// Vertex voxel the chain arrives at
    pub end: Idx3d,
    /// Slab voxels in path order
    pub slab: Vec<Idx3d>,
    /// Calibrated path length from `start` to `end`, µm
    pub length: f64,
}

/// Mean, sample standard deviation and range of a set of diameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiameterStats {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

impl DiameterStats {
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let std = if samples.len() > 1 {
            (samples.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
        } else {
            0.0
        };
        let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(Self { mean, std, min, max })
    }

    pub fn nan() -> Self {
        Self {
            mean: f64::NAN,
            std: f64::NAN,
            min: f64::NAN,
            max: f64::NAN,
        }
    }
}

/// Aggregate network measurements; all zero when the graph has no edge
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SkeletonMetrics {
    pub branch_count: usize,
    pub junction_count: usize,
    pub endpoint_count: usize,
    pub total_length: f64,
    pub mean_length: f64,
    pub longest_branch: f64,
    pub mean_diameter: f64,
    pub std_diameter: f64,
    pub min_diameter: f64,
    pub max_diameter: f64,
}

/// Per-branch measurements in physical units
#[derive(Debug, Clone, Copy)]
pub struct BranchStats {
    pub length: f64,
    pub diameter: DiameterStats,
    pub start_um: Point3<f64>,
    pub end_um: Point3<f64>,
}

#[derive(Debug, Clone)]
pub struct SkeletonGraph {
    vertices: Vec<Vertex>,
    edges: Vec<Edge>,
    calibration: Calibration,
}

impl SkeletonGraph {
    /// Extract vertices and edges from a 1-voxel-wide skeleton.
    ///
    /// End voxels are single vertices, 26-connected junction voxels are
    /// merged into one vertex. Edges follow slab voxels from a vertex until
    /// another vertex is met; adjacent vertices are joined by an edge without
    /// slab. Remaining slab loops get a stand-in vertex.
    pub fn build(skeleton: &BinaryVolume, calibration: Calibration) -> Self {
        let voxels = foreground_voxels(skeleton);
        let classes: HashMap<Idx3d, VoxelClass> =
            voxels.iter().map(|&v| (v, classify(skeleton, v))).collect();

        let mut vertices: Vec<Vertex> = Vec::new();
        let mut vertex_of: HashMap<Idx3d, usize> = HashMap::new();

        for &v in &voxels {
            match classes[&v] {
                VoxelClass::End => {
                    vertex_of.insert(v, vertices.len());
                    vertices.push(Vertex { kind: VertexKind::End, voxels: vec![v] });
                }
                VoxelClass::Junction if !vertex_of.contains_key(&v) => {
                    let id = vertices.len();
                    let mut cluster = vec![v];
                    let mut stack = vec![v];
                    vertex_of.insert(v, id);
                    while let Some(current) = stack.pop() {
                        for n in skeleton_neighbours(skeleton, current) {
                            if classes[&n] == VoxelClass::Junction && !vertex_of.contains_key(&n) {
                                vertex_of.insert(n, id);
                                cluster.push(n);
                                stack.push(n);
                            }
                        }
                    }
                    cluster.sort_unstable();
                    vertices.push(Vertex { kind: VertexKind::Junction, voxels: cluster });
                }
                _ => {}
            }
        }

        let mut edges = Vec::new();
        let mut visited: HashSet<Idx3d> = HashSet::new();

        for id in 0..vertices.len() {
            let members = vertices[id].voxels.clone();
            for v in members {
                for n in skeleton_neighbours(skeleton, v) {
                    match vertex_of.get(&n) {
                        Some(&other) => {
                            // Direct vertex contact, recorded once from the lower voxel
                            if other != id && v < n {
                                edges.push(Edge {
                                    v1: id,
                                    v2: other,
                                    start: v,
                                    end: n,
                                    slab: Vec::new(),
                                    length: calibration.distance(v, n),
                                });
                            }
                        }
                        None if !visited.contains(&n) => {
                            if let Some(edge) =
                                trace_edge(skeleton, id, v, n, &vertex_of, &mut visited, &calibration)
                            {
                                edges.push(edge);
                            }
                        }
                        None => {}
                    }
                }
            }
        }

        // Slab voxels not reached from any vertex lie on closed loops
        for &v in &voxels {
            if classes[&v] != VoxelClass::Slab || visited.contains(&v) || vertex_of.contains_key(&v) {
                continue;
            }
            let id = vertices.len();
            vertex_of.insert(v, id);
            visited.insert(v);
            vertices.push(Vertex { kind: VertexKind::Loop, voxels: vec![v] });

            let first = skeleton_neighbours(skeleton, v).find(|n| !visited.contains(n));
            if let Some(first) = first {
                if let Some(edge) =
                    trace_edge(skeleton, id, v, first, &vertex_of, &mut visited, &calibration)
                {
                    edges.push(edge);
                }
            }
        }

        debug!(
            "Skeleton graph: {} voxels, {} vertices, {} edges",
            voxels.len(),
            vertices.len(),
            edges.len()
        );
        Self { vertices, edges, calibration }
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn junction_count(&self) -> usize {
        self.count_vertices(VertexKind::Junction)
    }

    pub fn endpoint_count(&self) -> usize {
        self.count_vertices(VertexKind::End)
    }

    fn count_vertices(&self, kind: VertexKind) -> usize {
        self.vertices.iter().filter(|v| v.kind == kind).count()
    }

    pub fn total_length(&self) -> f64 {
        self.edges.iter().map(|e| e.length).sum()
    }

    /// Network metrics; diameters are `2 ×` the normal field at slab voxels
    pub fn metrics(&self, normal: &DistanceField) -> SkeletonMetrics {
        if self.edges.is_empty() {
            return SkeletonMetrics::default();
        }

        let total_length = self.total_length();
        let longest_branch = self.edges.iter().map(|e| e.length).fold(0.0, f64::max);
        let samples: Vec<f64> = self
            .edges
            .iter()
            .flat_map(|e| diameter_samples(&e.slab, normal))
            .collect();
        let diameter = DiameterStats::from_samples(&samples).unwrap_or(DiameterStats {
            mean: 0.0,
            std: 0.0,
            min: 0.0,
            max: 0.0,
        });

        SkeletonMetrics {
            branch_count: self.edges.len(),
            junction_count: self.junction_count(),
            endpoint_count: self.endpoint_count(),
            total_length,
            mean_length: total_length / self.edges.len() as f64,
            longest_branch,
            mean_diameter: diameter.mean,
            std_diameter: diameter.std,
            min_diameter: diameter.min,
            max_diameter: diameter.max,
        }
    }

    /// One entry per edge; diameters are NaN for edges without slab samples
    pub fn branch_stats(&self, normal: &DistanceField) -> Vec<BranchStats> {
        self.edges
            .iter()
            .map(|e| {
                let samples: Vec<f64> = diameter_samples(&e.slab, normal).collect();
                BranchStats {
                    length: e.length,
                    diameter: DiameterStats::from_samples(&samples).unwrap_or_else(DiameterStats::nan),
                    start_um: self.calibration.to_physical(e.start),
                    end_um: self.calibration.to_physical(e.end),
                }
            })
            .collect()
    }

    /// Volume with slab and end voxels at [`SLAB_TAG`] and junctions at [`JUNCTION_TAG`]
    pub fn tag_volume(&self, shape: Idx3d) -> Array3<u8> {
        let mut tags = Array3::<u8>::zeros(shape);
        for edge in &self.edges {
            for &v in &edge.slab {
                tags[v] = SLAB_TAG;
            }
        }
        for vertex in &self.vertices {
            let tag = match vertex.kind {
                VertexKind::Junction => JUNCTION_TAG,
                VertexKind::End | VertexKind::Loop => SLAB_TAG,
            };
            for &v in &vertex.voxels {
                tags[v] = tag;
            }
        }
        tags
    }
}

fn trace_edge(
    skeleton: &BinaryVolume,
    from: usize,
    start: Idx3d,
    first: Idx3d,
    vertex_of: &HashMap<Idx3d, usize>,
    visited: &mut HashSet<Idx3d>,
    calibration: &Calibration,
) -> Option<Edge> {
    let mut slab = vec![first];
    visited.insert(first);
    let mut length = calibration.distance(start, first);
    let mut previous = start;
    let mut current = first;

    loop {
        let next = skeleton_neighbours(skeleton, current)
            .find(|&n| n != previous && (vertex_of.contains_key(&n) || !visited.contains(&n)));

        let Some(next) = next else {
            debug!("Slab chain from {:?} ends without a vertex at {:?}", start, current);
            return None;
        };

        length += calibration.distance(current, next);
        if let Some(&to) = vertex_of.get(&next) {
            return Some(Edge {
                v1: from,
                v2: to,
                start,
                end: next,
                slab,
                length,
            });
        }

        visited.insert(next);
        slab.push(next);
        previous = current;
        current = next;
    }
}

fn diameter_samples<'a>(slab: &'a [Idx3d], normal: &'a DistanceField) -> impl Iterator<Item = f64> + 'a {
    slab.iter()
        .filter_map(move |&v| normal.get(v))
        .filter(|&d| d > 0.0 && d < f32::MAX)
        .map(|d| 2.0 * d as f64)
}

/// Remove dangling branches shorter than `min_length_um`.
///
/// A branch is dangling when at least one of its vertices is an end point.
/// Its slab voxels and end-point voxels are cleared; junctions stay. One
/// pass only. Returns the pruned skeleton and the number of branches removed.
pub fn prune_short_branches(
    skeleton: &BinaryVolume,
    calibration: &Calibration,
    min_length_um: f64,
) -> (BinaryVolume, usize) {
    let graph = SkeletonGraph::build(skeleton, *calibration);
    let mut pruned = skeleton.clone();
    let mut removed = 0;

    for edge in graph.edges() {
        let ends: Vec<&Vertex> = [edge.v1, edge.v2]
            .iter()
            .map(|&id| &graph.vertices()[id])
            .filter(|v| v.kind == VertexKind::End)
            .collect();
        if ends.is_empty() || edge.length >= min_length_um {
            continue;
        }

        for &v in &edge.slab {
            pruned[v] = false;
        }
        for vertex in ends {
            for &v in &vertex.voxels {
                pruned[v] = false;
            }
        }
        removed += 1;
    }

    debug!("Pruned {} branches shorter than {} µm", removed, min_length_um);
    (pruned, removed)
}
