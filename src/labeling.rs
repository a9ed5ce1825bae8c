// src/labeling.rs - 26-connected component labelling of 3D volumes

use ndarray::Array3;

use crate::volume::{neighbours_26, Idx3d};

/// Label the 26-connected foreground components of `volume`.
///
/// Components are numbered `1..=n` in raster `(z, y, x)` order of their first
/// voxel; background stays 0. Returns the label volume and `n`.
pub fn label_components<T, F>(volume: &Array3<T>, is_foreground: F) -> (Array3<u32>, u32)
where
    F: Fn(&T) -> bool,
{
    let shape: Idx3d = volume.dim();
    let mut labels = Array3::<u32>::zeros(shape);
    let mut next_label = 0u32;
    let mut stack: Vec<Idx3d> = Vec::new();

    for (seed, value) in volume.indexed_iter() {
        if !is_foreground(value) || labels[seed] != 0 {
            continue;
        }

        next_label += 1;
        labels[seed] = next_label;
        stack.push(seed);

        // Depth-first flood fill; every pushed voxel is already labelled
        while let Some(current) = stack.pop() {
            for neighbour in neighbours_26(current, shape) {
                if labels[neighbour] == 0 && is_foreground(&volume[neighbour]) {
                    labels[neighbour] = next_label;
                    stack.push(neighbour);
                }
            }
        }
    }

    (labels, next_label)
}
