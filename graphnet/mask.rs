use crate::error::{GraphnetError, Result};
use crate::io::{Volume, VolumeSource};
use ndarray::{Array1, Array3, ArrayView1, ArrayView4, Axis};
use std::path::Path;

/// A spatial voxel selection replicated once per trial offset.
///
/// Every replica shares the same shape and the same selected voxels, so the
/// voxel count is fixed when the mask is built.
#[derive(Clone, Debug)]
pub struct VolumeMask {
    offsets: Vec<Array3<bool>>,
    voxels: Vec<[usize; 3]>,
    /// Voxel size of the mask image, reused when maps are written back out.
    pixdim: [f32; 3],
}

impl VolumeMask {
    /// Loads the mask image at `mask_path` and replicates it `num_offsets` times.
    pub fn build<S: VolumeSource>(
        source: &S,
        mask_path: &Path,
        num_offsets: usize,
    ) -> Result<Self> {
        let volume = source.load_volume(mask_path)?;
        if volume.num_timepoints() == 0 {
            return Err(GraphnetError::resource(
                mask_path.display().to_string(),
                "mask image has no volumes",
            ));
        }
        if volume.num_timepoints() > 1 {
            log::warn!(
                "Mask {} has {} volumes; only the first is used",
                mask_path.display(),
                volume.num_timepoints()
            );
        }
        let selection = volume
            .data
            .index_axis(Axis(3), 0)
            .mapv(|v| v.is_finite() && v != 0.0);
        Self::from_selection(selection, num_offsets)
            .map(|mask| Self {
                pixdim: volume.pixdim,
                ..mask
            })
            .map_err(|e| match e {
                GraphnetError::Resource { reason, .. } => {
                    GraphnetError::resource(mask_path.display().to_string(), reason)
                }
                other => other,
            })
    }

    pub fn from_selection(selection: Array3<bool>, num_offsets: usize) -> Result<Self> {
        if num_offsets == 0 {
            return Err(GraphnetError::InvalidConfig(
                "a mask needs at least one trial offset".to_string(),
            ));
        }
        let voxels: Vec<[usize; 3]> = selection
            .indexed_iter()
            .filter(|(_, selected)| **selected)
            .map(|((x, y, z), _)| [x, y, z])
            .collect();
        if voxels.is_empty() {
            return Err(GraphnetError::resource("<mask>", "mask selects zero voxels"));
        }
        log::info!(
            "Mask selects {} voxels of {:?}, replicated for {} offsets",
            voxels.len(),
            selection.shape(),
            num_offsets
        );
        Ok(Self {
            offsets: vec![selection; num_offsets],
            voxels,
            pixdim: [1.0; 3],
        })
    }

    pub fn num_offsets(&self) -> usize {
        self.offsets.len()
    }

    pub fn num_voxels(&self) -> usize {
        self.voxels.len()
    }

    pub fn spatial_shape(&self) -> [usize; 3] {
        let shape = self.offsets[0].shape();
        [shape[0], shape[1], shape[2]]
    }

    pub fn pixdim(&self) -> [f32; 3] {
        self.pixdim
    }

    pub fn offset_slices(&self) -> &[Array3<bool>] {
        &self.offsets
    }

    /// Masked voxel values of `volume` at timepoint `t`, in mask order.
    pub fn extract(&self, volume: &Volume, t: usize) -> Array1<f64> {
        self.gather(volume.data.view(), t)
    }

    pub fn gather(&self, data: ArrayView4<f32>, t: usize) -> Array1<f64> {
        self.voxels
            .iter()
            .map(|&[x, y, z]| data[[x, y, z, t]] as f64)
            .collect()
    }

    /// Writes `values` (one per selected voxel) back into a zero-filled volume.
    pub fn scatter(&self, values: ArrayView1<f64>) -> Array3<f32> {
        let mut out = Array3::zeros(self.offsets[0].raw_dim());
        for (&[x, y, z], value) in self.voxels.iter().zip(values.iter()) {
            out[[x, y, z]] = *value as f32;
        }
        out
    }
}
