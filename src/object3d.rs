// src/object3d.rs - Volumetric objects, populations and bounding-box nearest-voxel search

use log::debug;
use nalgebra::Point3;
use ndarray::Array3;
use std::collections::BTreeMap;

use crate::labeling::label_components;
use crate::volume::{offset_index, BinaryVolume, Calibration, Idx3d, OFFSETS_6};

/// One connected 3D structure: a label and its voxel set.
///
/// Voxels are kept sorted in raster order so membership tests are a binary
/// search. Only the label changes after construction (relabelling).
#[derive(Debug, Clone, PartialEq)]
pub struct VolumetricObject {
    label: u32,
    voxels: Vec<Idx3d>,
    bbox_min: Idx3d,
    bbox_max: Idx3d,
}

impl VolumetricObject {
    /// Build an object from its voxels. Returns `None` for an empty voxel set.
    pub fn new(label: u32, mut voxels: Vec<Idx3d>) -> Option<Self> {
        if voxels.is_empty() {
            return None;
        }
        voxels.sort_unstable();
        voxels.dedup();

        let (bbox_min, bbox_max) = bounding_box(&voxels)?;
        Some(Self { label, voxels, bbox_min, bbox_max })
    }

    pub fn label(&self) -> u32 {
        self.label
    }

    pub(crate) fn set_label(&mut self, label: u32) {
        self.label = label;
    }

    pub fn voxels(&self) -> &[Idx3d] {
        &self.voxels
    }

    pub fn voxel_count(&self) -> usize {
        self.voxels.len()
    }

    /// Inclusive `(min, max)` corners in `(z, y, x)`
    pub fn bounding_box(&self) -> (Idx3d, Idx3d) {
        (self.bbox_min, self.bbox_max)
    }

    pub fn contains(&self, idx: Idx3d) -> bool {
        self.voxels.binary_search(&idx).is_ok()
    }

    /// Calibrated volume in µm³
    pub fn volume(&self, calibration: &Calibration) -> f64 {
        self.voxels.len() as f64 * calibration.voxel_volume()
    }

    /// Mean voxel position in voxel units, as `(x, y, z)`
    pub fn centroid_voxel_space(&self) -> Point3<f64> {
        let n = self.voxels.len() as f64;
        let (sx, sy, sz) = self.voxels.iter().fold((0.0, 0.0, 0.0), |(sx, sy, sz), &(z, y, x)| {
            (sx + x as f64, sy + y as f64, sz + z as f64)
        });
        Point3::new(sx / n, sy / n, sz / n)
    }

    /// Calibrated centroid `(x, y, z)` in µm
    pub fn centroid(&self, calibration: &Calibration) -> Point3<f64> {
        let c = self.centroid_voxel_space();
        Point3::new(
            c.x * calibration.pixel_width_um,
            c.y * calibration.pixel_height_um(),
            c.z * calibration.pixel_depth_um,
        )
    }

    /// Voxel holding the centroid, rounded to the nearest index
    pub fn centroid_voxel(&self) -> Idx3d {
        let c = self.centroid_voxel_space();
        (
            c.z.round() as usize,
            c.y.round() as usize,
            c.x.round() as usize,
        )
    }

    /// Number of distinct z-planes the object occupies
    pub fn plane_count(&self) -> usize {
        let mut planes: Vec<usize> = self.voxels.iter().map(|v| v.0).collect();
        planes.dedup();
        planes.len()
    }

    /// Number of object voxels set in `mask`
    pub fn overlap_count(&self, mask: &BinaryVolume) -> usize {
        self.voxels
            .iter()
            .filter(|&&v| mask.get(v).copied().unwrap_or(false))
            .count()
    }

    /// Voxels with at least one face neighbour outside the object
    pub fn surface_voxels(&self) -> Vec<Idx3d> {
        let unbounded = (usize::MAX, usize::MAX, usize::MAX);
        self.voxels
            .iter()
            .copied()
            .filter(|&v| {
                OFFSETS_6.iter().any(|&d| match offset_index(v, d, unbounded) {
                    Some(n) => !self.contains(n),
                    None => true,
                })
            })
            .collect()
    }

    /// Write `value` at every voxel of the object that lies inside `volume`
    pub fn draw<T: Clone>(&self, volume: &mut Array3<T>, value: T) {
        for &v in &self.voxels {
            if let Some(cell) = volume.get_mut(v) {
                *cell = value.clone();
            }
        }
    }
}

fn bounding_box(voxels: &[Idx3d]) -> Option<(Idx3d, Idx3d)> {
    let first = *voxels.first()?;
    Some(voxels.iter().fold((first, first), |(lo, hi), &(z, y, x)| {
        (
            (lo.0.min(z), lo.1.min(y), lo.2.min(x)),
            (hi.0.max(z), hi.1.max(y), hi.2.max(x)),
        )
    }))
}

/// Insertion-ordered collection of objects sharing one calibration
#[derive(Debug, Clone)]
pub struct ObjectPopulation {
    objects: Vec<VolumetricObject>,
    calibration: Calibration,
}

impl ObjectPopulation {
    pub fn new(calibration: Calibration) -> Self {
        Self { objects: Vec::new(), calibration }
    }

    pub fn from_objects(objects: Vec<VolumetricObject>, calibration: Calibration) -> Self {
        Self { objects, calibration }
    }

    /// 26-connected components of every non-background voxel.
    ///
    /// An all-background volume yields an empty population.
    pub fn from_labeled_volume<T>(volume: &Array3<T>, calibration: Calibration) -> Self
    where
        T: PartialEq + Default,
    {
        let background = T::default();
        let (labels, count) = label_components(volume, |v| *v != background);
        if count == 0 {
            debug!("Volume is entirely background, population is empty");
            return Self::new(calibration);
        }

        let mut buckets: Vec<Vec<Idx3d>> = vec![Vec::new(); count as usize];
        for (idx, &label) in labels.indexed_iter() {
            if label != 0 {
                buckets[(label - 1) as usize].push(idx);
            }
        }

        let objects = buckets
            .into_iter()
            .zip(1u32..)
            .filter_map(|(voxels, label)| VolumetricObject::new(label, voxels))
            .collect();
        Self { objects, calibration }
    }

    /// One object per distinct non-zero value of an instance-labelled volume,
    /// ordered by label value. Labels are kept as found.
    pub fn from_label_values<T>(volume: &Array3<T>, calibration: Calibration) -> Self
    where
        T: Copy + Into<u32>,
    {
        let mut buckets: BTreeMap<u32, Vec<Idx3d>> = BTreeMap::new();
        for (idx, &value) in volume.indexed_iter() {
            let label: u32 = value.into();
            if label != 0 {
                buckets.entry(label).or_default().push(idx);
            }
        }

        let objects = buckets
            .into_iter()
            .filter_map(|(label, voxels)| VolumetricObject::new(label, voxels))
            .collect();
        Self { objects, calibration }
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn objects(&self) -> &[VolumetricObject] {
        &self.objects
    }

    pub fn iter(&self) -> impl Iterator<Item = &VolumetricObject> {
        self.objects.iter()
    }

    pub fn push(&mut self, object: VolumetricObject) {
        self.objects.push(object);
    }

    /// Remove objects whose calibrated volume is outside `[min, max]`,
    /// then relabel the survivors `1..=N`.
    pub fn filter_by_size(&mut self, min: f64, max: f64) {
        let calibration = self.calibration;
        self.objects.retain(|o| {
            let volume = o.volume(&calibration);
            volume >= min && volume <= max
        });
        self.relabel();
    }

    /// Remove objects lying in a single z-plane, then relabel `1..=N`
    pub fn filter_single_plane(&mut self) {
        self.objects.retain(|o| o.plane_count() > 1);
        self.relabel();
    }

    /// Renumber objects `1..=N` in their current order
    pub fn relabel(&mut self) {
        self.relabel_from(1);
    }

    /// Renumber objects `first..` in their current order and return the
    /// next unused label
    pub fn relabel_from(&mut self, first: u32) -> u32 {
        let mut next = first;
        for object in self.objects.iter_mut() {
            object.set_label(next);
            next += 1;
        }
        next
    }

    /// Draw every object into a fresh binary mask
    pub fn to_mask(&self, shape: Idx3d) -> BinaryVolume {
        let mut mask = BinaryVolume::from_elem(shape, false);
        for object in &self.objects {
            object.draw(&mut mask, true);
        }
        mask
    }

    /// Draw every object with its own label into a fresh label volume
    pub fn to_label_volume(&self, shape: Idx3d) -> Array3<u32> {
        let mut labels = Array3::<u32>::zeros(shape);
        for object in &self.objects {
            object.draw(&mut labels, object.label());
        }
        labels
    }

    pub fn total_volume(&self) -> f64 {
        self.objects.iter().map(|o| o.volume(&self.calibration)).sum()
    }
}

/// Closest voxel pair found by [`BoxedVoxelIndex::nearest`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NearestPair {
    pub query: Idx3d,
    pub target: Idx3d,
    pub distance: f64,
}

/// Edge length, in voxels, of the blocks the index groups target voxels into
const CHUNK_EDGE: usize = 8;

#[derive(Debug, Clone)]
struct VoxelChunk {
    min: Idx3d,
    max: Idx3d,
    voxels: Vec<Idx3d>,
}

/// Target voxels grouped into small blocks with bounding boxes.
///
/// A nearest query visits blocks by increasing box-to-box lower bound and
/// stops once the bound reaches the best distance found, so the answer is
/// the exact minimum voxel-centre distance.
#[derive(Debug, Clone)]
pub struct BoxedVoxelIndex {
    chunks: Vec<VoxelChunk>,
    calibration: Calibration,
}

impl BoxedVoxelIndex {
    pub fn new<I>(voxels: I, calibration: Calibration) -> Self
    where
        I: IntoIterator<Item = Idx3d>,
    {
        let mut blocks: BTreeMap<Idx3d, Vec<Idx3d>> = BTreeMap::new();
        for v in voxels {
            let key = (v.0 / CHUNK_EDGE, v.1 / CHUNK_EDGE, v.2 / CHUNK_EDGE);
            blocks.entry(key).or_default().push(v);
        }

        let chunks = blocks
            .into_values()
            .filter_map(|voxels| {
                let (min, max) = bounding_box(&voxels)?;
                Some(VoxelChunk { min, max, voxels })
            })
            .collect();
        Self { chunks, calibration }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.iter().map(|c| c.voxels.len()).sum()
    }

    /// Exact closest pair between `query` and the indexed voxels
    pub fn nearest(&self, query: &[Idx3d]) -> Option<NearestPair> {
        let (q_min, q_max) = bounding_box(query)?;

        let mut order: Vec<(f64, &VoxelChunk)> = self
            .chunks
            .iter()
            .map(|c| (self.box_gap_squared(q_min, q_max, c.min, c.max), c))
            .collect();
        order.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut best_sq = f64::INFINITY;
        let mut best: Option<(Idx3d, Idx3d)> = None;

        for (lower_bound, chunk) in order {
            if lower_bound >= best_sq {
                break;
            }
            for &target in &chunk.voxels {
                if self.box_gap_squared(q_min, q_max, target, target) >= best_sq {
                    continue;
                }
                for &q in query {
                    let d = self.calibration.distance_squared(q, target);
                    if d < best_sq {
                        best_sq = d;
                        best = Some((q, target));
                    }
                }
            }
        }

        best.map(|(query, target)| NearestPair {
            query,
            target,
            distance: best_sq.sqrt(),
        })
    }

    /// Squared calibrated gap between two inclusive boxes (0 when they overlap)
    fn box_gap_squared(&self, a_min: Idx3d, a_max: Idx3d, b_min: Idx3d, b_max: Idx3d) -> f64 {
        let [sz, sy, sx] = self.calibration.spacing();
        let gz = axis_gap(a_min.0, a_max.0, b_min.0, b_max.0) as f64 * sz;
        let gy = axis_gap(a_min.1, a_max.1, b_min.1, b_max.1) as f64 * sy;
        let gx = axis_gap(a_min.2, a_max.2, b_min.2, b_max.2) as f64 * sx;
        gz * gz + gy * gy + gx * gx
    }
}

#[inline]
fn axis_gap(a_min: usize, a_max: usize, b_min: usize, b_max: usize) -> usize {
    if a_max < b_min {
        b_min - a_max
    } else if b_max < a_min {
        a_min - b_max
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn cube(origin: Idx3d, edge: usize) -> Vec<Idx3d> {
        let mut voxels = Vec::new();
        for z in 0..edge {
            for y in 0..edge {
                for x in 0..edge {
                    voxels.push((origin.0 + z, origin.1 + y, origin.2 + x));
                }
            }
        }
        voxels
    }

    fn population_of_cubes(edges: &[usize]) -> ObjectPopulation {
        let mut volume = Array3::<bool>::from_elem((6, 6, 40), false);
        let mut x = 0;
        for &edge in edges {
            for v in cube((0, 0, x), edge) {
                volume[v] = true;
            }
            x += edge + 2;
        }
        ObjectPopulation::from_labeled_volume(&volume, Calibration::new(1.0, 1.0))
    }

    #[test]
    fn volume_and_centroid_are_calibrated() {
        let object = VolumetricObject::new(1, cube((2, 4, 6), 3)).unwrap();
        let cal = Calibration::new(0.5, 2.0);
        assert_approx_eq!(object.volume(&cal), 27.0 * 0.5);
        let c = object.centroid(&cal);
        assert_approx_eq!(c.x, 7.0 * 0.5);
        assert_approx_eq!(c.y, 5.0 * 0.5);
        assert_approx_eq!(c.z, 3.0 * 2.0);
        assert_eq!(object.centroid_voxel(), (3, 5, 7));
        assert_eq!(object.plane_count(), 3);
    }

    #[test]
    fn empty_voxel_set_is_not_an_object() {
        assert!(VolumetricObject::new(1, Vec::new()).is_none());
    }

    #[test]
    fn surface_of_solid_cube_excludes_the_core() {
        let object = VolumetricObject::new(1, cube((0, 0, 0), 3)).unwrap();
        let surface = object.surface_voxels();
        assert_eq!(surface.len(), 26);
        assert!(!surface.contains(&(1, 1, 1)));
    }

    #[test]
    fn size_filter_keeps_bounds_inclusive_and_relabels() {
        // Volumes 1, 8, 27, 64
        let mut population = population_of_cubes(&[1, 2, 3, 4]);
        assert_eq!(population.len(), 4);

        population.filter_by_size(8.0, 27.0);
        assert_eq!(population.len(), 2);
        let labels: Vec<u32> = population.iter().map(|o| o.label()).collect();
        assert_eq!(labels, vec![1, 2]);
        for object in population.iter() {
            let v = object.volume(population.calibration());
            assert!((8.0..=27.0).contains(&v));
        }
    }

    #[test]
    fn relabel_from_continues_a_counter() {
        let mut population = population_of_cubes(&[1, 2, 3]);
        let next = population.relabel_from(7);
        assert_eq!(next, 10);
        let labels: Vec<u32> = population.iter().map(|o| o.label()).collect();
        assert_eq!(labels, vec![7, 8, 9]);
    }

    #[test]
    fn single_plane_objects_are_dropped() {
        let mut objects = vec![
            VolumetricObject::new(4, vec![(0, 0, 0), (0, 0, 1)]).unwrap(),
            VolumetricObject::new(9, vec![(0, 3, 3), (1, 3, 3)]).unwrap(),
        ];
        objects.reverse();
        let mut population = ObjectPopulation::from_objects(objects, Calibration::new(1.0, 1.0));
        population.filter_single_plane();
        assert_eq!(population.len(), 1);
        assert_eq!(population.objects()[0].label(), 1);
        assert_eq!(population.objects()[0].plane_count(), 2);
    }

    #[test]
    fn label_values_are_grouped_without_merging_touching_objects() {
        let mut volume = Array3::<u16>::zeros((1, 1, 4));
        volume[(0, 0, 0)] = 5;
        volume[(0, 0, 1)] = 5;
        volume[(0, 0, 2)] = 2;
        let population = ObjectPopulation::from_label_values(&volume, Calibration::new(1.0, 1.0));
        assert_eq!(population.len(), 2);
        assert_eq!(population.objects()[0].label(), 2);
        assert_eq!(population.objects()[1].voxel_count(), 2);

        let merged = ObjectPopulation::from_labeled_volume(&volume, Calibration::new(1.0, 1.0));
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn mask_round_trip_preserves_voxel_count() {
        let population = population_of_cubes(&[2, 3]);
        let mask = population.to_mask((6, 6, 40));
        assert_eq!(mask.iter().filter(|&&v| v).count(), 8 + 27);
    }

    #[test]
    fn boxed_search_matches_brute_force() {
        let cal = Calibration::new(0.7, 1.9);
        let targets: Vec<Idx3d> = (0..60).map(|i| (i % 7, (i * 5) % 23, (i * 11) % 31)).collect();
        let query = cube((3, 10, 40), 2);
        let index = BoxedVoxelIndex::new(targets.iter().copied(), cal);

        let brute = targets
            .iter()
            .flat_map(|&t| query.iter().map(move |&q| (q, t)))
            .map(|(q, t)| cal.distance(q, t))
            .fold(f64::INFINITY, f64::min);

        let found = index.nearest(&query).unwrap();
        assert_approx_eq!(found.distance, brute);
        assert_approx_eq!(cal.distance(found.query, found.target), brute);
    }

    #[test]
    fn nearest_on_empty_index_is_none() {
        let index = BoxedVoxelIndex::new(Vec::new(), Calibration::new(1.0, 1.0));
        assert!(index.is_empty());
        assert!(index.nearest(&[(0, 0, 0)]).is_none());
    }
}
