//! Thin adapters between the numerical core and the filesystem.
//!
//! The core only ever sees the [`VolumeSource`] trait. [`NiftiVolumeSource`] reads
//! single-file NIfTI-1 images (optionally gzip-compressed) and AFNI-style `.1D`
//! marker vectors; [`InMemoryVolumeSource`] serves synthetic data to tests.

use crate::error::{GraphnetError, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use ndarray::{Array4, ArrayView4, ShapeBuilder};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const NIFTI1_HEADER_SIZE: usize = 348;
const NIFTI1_DATA_OFFSET: usize = 352;
const DT_UINT8: i16 = 2;
const DT_INT16: i16 = 4;
const DT_INT32: i16 = 8;
const DT_FLOAT32: i16 = 16;
const DT_FLOAT64: i16 = 64;
const DT_INT8: i16 = 256;
const DT_UINT16: i16 = 512;
const DT_UINT32: i16 = 768;

/// A 4D image indexed `[x, y, z, t]`. Purely spatial images have `t == 1`.
#[derive(Clone, Debug, PartialEq)]
pub struct Volume {
    pub data: Array4<f32>,
    /// Voxel sizes along x, y, z.
    pub pixdim: [f32; 3],
}

impl Volume {
    pub fn new(data: Array4<f32>) -> Self {
        Self {
            data,
            pixdim: [1.0; 3],
        }
    }

    pub fn spatial_shape(&self) -> [usize; 3] {
        let shape = self.data.shape();
        [shape[0], shape[1], shape[2]]
    }

    pub fn num_timepoints(&self) -> usize {
        self.data.shape()[3]
    }
}

/// The I/O collaborator consumed by mask and design construction.
pub trait VolumeSource {
    fn load_volume(&self, path: &Path) -> Result<Volume>;
    fn load_markers(&self, path: &Path) -> Result<Vec<f64>>;
}

/// Reads volumes and markers from disk.
#[derive(Clone, Copy, Debug, Default)]
pub struct NiftiVolumeSource;

impl VolumeSource for NiftiVolumeSource {
    fn load_volume(&self, path: &Path) -> Result<Volume> {
        read_nifti(path)
    }

    fn load_markers(&self, path: &Path) -> Result<Vec<f64>> {
        let text = fs::read_to_string(path)
            .map_err(|e| GraphnetError::resource(path.display().to_string(), e.to_string()))?;
        parse_markers(&text)
            .map_err(|reason| GraphnetError::resource(path.display().to_string(), reason))
    }
}

/// Serves pre-built volumes keyed by path.
#[derive(Clone, Debug, Default)]
pub struct InMemoryVolumeSource {
    volumes: HashMap<PathBuf, Volume>,
    markers: HashMap<PathBuf, Vec<f64>>,
}

impl InMemoryVolumeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_volume(&mut self, path: impl Into<PathBuf>, volume: Volume) {
        self.volumes.insert(path.into(), volume);
    }

    pub fn insert_markers(&mut self, path: impl Into<PathBuf>, markers: Vec<f64>) {
        self.markers.insert(path.into(), markers);
    }
}

impl VolumeSource for InMemoryVolumeSource {
    fn load_volume(&self, path: &Path) -> Result<Volume> {
        self.volumes
            .get(path)
            .cloned()
            .ok_or_else(|| GraphnetError::resource(path.display().to_string(), "no such volume"))
    }

    fn load_markers(&self, path: &Path) -> Result<Vec<f64>> {
        self.markers
            .get(path)
            .cloned()
            .ok_or_else(|| {
                GraphnetError::resource(path.display().to_string(), "no such marker file")
            })
    }
}

/// Parses an AFNI `.1D` column: whitespace-separated numbers, `#` starts a comment.
pub fn parse_markers(text: &str) -> std::result::Result<Vec<f64>, String> {
    let mut values = Vec::new();
    for (line_number, line) in text.lines().enumerate() {
        let content = line.split('#').next().unwrap_or("");
        for token in content.split_whitespace() {
            let value: f64 = token
                .parse()
                .map_err(|_| format!("line {}: '{token}' is not a number", line_number + 1))?;
            values.push(value);
        }
    }
    Ok(values)
}

/// Lists subdirectories of `top_dir` whose names start with one of `prefixes`
/// (every subdirectory when `prefixes` is empty),
/// in natural order.
pub fn discover_subject_dirs(top_dir: &Path, prefixes: &[String]) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(top_dir)
        .map_err(|e| GraphnetError::resource(top_dir.display().to_string(), e.to_string()))?;

    let mut found: Vec<(String, PathBuf)> = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if prefixes.is_empty() || prefixes.iter().any(|prefix| name.starts_with(prefix.as_str())) {
            found.push((name, entry.path()));
        }
    }
    found.sort_by(|a, b| natord::compare(&a.0, &b.0));
    log::info!(
        "Discovered {} subject directories under {}",
        found.len(),
        top_dir.display()
    );
    Ok(found.into_iter().map(|(_, path)| path).collect())
}

/// Reads a single-file NIfTI-1 image, gunzipping `.gz` files transparently.
pub fn read_nifti(path: &Path) -> Result<Volume> {
    let describe =
        |e: std::io::Error| GraphnetError::resource(path.display().to_string(), e.to_string());
    let mut file = File::open(path).map_err(describe)?;
    let mut bytes = Vec::new();
    if is_gzip_path(path) {
        GzDecoder::new(file).read_to_end(&mut bytes).map_err(describe)?;
    } else {
        file.read_to_end(&mut bytes).map_err(describe)?;
    }
    decode_nifti(&bytes)
        .map_err(|reason| GraphnetError::resource(path.display().to_string(), reason))
}

/// Writes `data` (`[x, y, z, k]`) as a float32 NIfTI-1 image and returns the
/// path written. A missing extension becomes `.nii`.
pub fn save_volume(data: ArrayView4<f32>, pixdim: [f32; 3], output_name: &Path) -> Result<PathBuf> {
    let path = if output_name.extension().is_none() {
        output_name.with_extension("nii")
    } else {
        output_name.to_path_buf()
    };

    let mut bytes = encode_nifti_header(data.shape(), pixdim).map_err(|reason| {
        GraphnetError::resource(path.display().to_string(), reason)
    })?;
    bytes.reserve(data.len() * 4);
    // NIfTI stores x fastest; iterating the reversed-axes view in logical order yields that.
    for value in data.t().iter() {
        bytes.extend_from_slice(&value.to_le_bytes());
    }

    let file = File::create(&path)?;
    if is_gzip_path(&path) {
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        encoder.write_all(&bytes)?;
        encoder.finish()?.flush()?;
    } else {
        let mut writer = BufWriter::new(file);
        writer.write_all(&bytes)?;
        writer.flush()?;
    }
    log::info!("Saved volume {:?} to {}", data.shape(), path.display());
    Ok(path)
}

fn is_gzip_path(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

struct HeaderReader<'a> {
    bytes: &'a [u8],
    big_endian: bool,
}

impl HeaderReader<'_> {
    fn array<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[offset..offset + N]);
        if self.big_endian {
            out.reverse();
        }
        out
    }

    fn i16_at(&self, offset: usize) -> i16 {
        i16::from_le_bytes(self.array(offset))
    }

    fn i32_at(&self, offset: usize) -> i32 {
        i32::from_le_bytes(self.array(offset))
    }

    fn f32_at(&self, offset: usize) -> f32 {
        f32::from_le_bytes(self.array(offset))
    }
}

fn decode_nifti(bytes: &[u8]) -> std::result::Result<Volume, String> {
    if bytes.len() < NIFTI1_HEADER_SIZE {
        return Err(format!("file is {} bytes, shorter than a NIfTI-1 header", bytes.len()));
    }

    let mut header = HeaderReader {
        bytes,
        big_endian: false,
    };
    if header.i32_at(0) != NIFTI1_HEADER_SIZE as i32 {
        header.big_endian = true;
        if header.i32_at(0) != NIFTI1_HEADER_SIZE as i32 {
            return Err("sizeof_hdr is not 348; not a NIfTI-1 file".to_string());
        }
    }
    if &bytes[344..347] != b"n+1" {
        return Err("only single-file NIfTI-1 images (magic 'n+1') are supported".to_string());
    }

    let ndim = header.i16_at(40);
    if !(1..=7).contains(&ndim) {
        return Err(format!("dim[0] = {ndim} is outside 1..=7"));
    }
    let mut dims = [1usize; 7];
    for (axis, dim) in dims.iter_mut().enumerate().take(ndim as usize) {
        let value = header.i16_at(42 + 2 * axis);
        if value < 0 {
            return Err(format!("dim[{}] = {value} is negative", axis + 1));
        }
        *dim = (value as usize).max(1);
    }
    if dims[4..].iter().any(|&d| d > 1) {
        return Err(format!("images with more than 4 dimensions are not supported: {dims:?}"));
    }
    let shape = (dims[0], dims[1], dims[2], dims[3]);

    let datatype = header.i16_at(70);
    let bytes_per_voxel = match datatype {
        DT_UINT8 | DT_INT8 => 1,
        DT_INT16 | DT_UINT16 => 2,
        DT_INT32 | DT_UINT32 | DT_FLOAT32 => 4,
        DT_FLOAT64 => 8,
        other => return Err(format!("unsupported NIfTI datatype code {other}")),
    };

    let vox_offset = header.f32_at(108);
    if !vox_offset.is_finite() || vox_offset < NIFTI1_HEADER_SIZE as f32 {
        return Err(format!("invalid vox_offset {vox_offset}"));
    }
    if vox_offset as f64 > bytes.len() as f64 {
        return Err(format!(
            "vox_offset {vox_offset} lies beyond the end of a {}-byte file",
            bytes.len()
        ));
    }
    let start = vox_offset as usize;
    let payload = dims[..4]
        .iter()
        .try_fold(bytes_per_voxel, |acc: usize, &d| acc.checked_mul(d))
        .ok_or_else(|| format!("voxel payload of shape {dims:?} overflows the address space"))?;
    let end = start
        .checked_add(payload)
        .ok_or_else(|| format!("voxel payload of {payload} bytes after offset {start} overflows"))?;
    if bytes.len() < end {
        return Err(format!(
            "expected {payload} bytes of voxel data after offset {start}, found {}",
            bytes.len() - start
        ));
    }

    let data = HeaderReader {
        bytes: &bytes[start..end],
        big_endian: header.big_endian,
    };
    let count = payload / bytes_per_voxel;
    let mut values = Vec::with_capacity(count);
    for index in 0..count {
        let at = index * bytes_per_voxel;
        let value = match datatype {
            DT_UINT8 => data.bytes[at] as f32,
            DT_INT8 => data.bytes[at] as i8 as f32,
            DT_INT16 => data.i16_at(at) as f32,
            DT_UINT16 => u16::from_le_bytes(data.array(at)) as f32,
            DT_INT32 => data.i32_at(at) as f32,
            DT_UINT32 => u32::from_le_bytes(data.array(at)) as f32,
            DT_FLOAT32 => data.f32_at(at),
            _ => f64::from_le_bytes(data.array(at)) as f32,
        };
        values.push(value);
    }

    let slope = header.f32_at(112);
    let inter = header.f32_at(116);
    if slope != 0.0 && !(slope == 1.0 && inter == 0.0) {
        for value in values.iter_mut() {
            *value = *value * slope + inter;
        }
    }

    let data = Array4::from_shape_vec(shape.f(), values).map_err(|e| e.to_string())?;
    let pixdim = [
        header.f32_at(80).abs().max(f32::MIN_POSITIVE),
        header.f32_at(84).abs().max(f32::MIN_POSITIVE),
        header.f32_at(88).abs().max(f32::MIN_POSITIVE),
    ];
    Ok(Volume { data, pixdim })
}

fn encode_nifti_header(shape: &[usize], pixdim: [f32; 3]) -> std::result::Result<Vec<u8>, String> {
    let mut extents = [0i16; 4];
    for (axis, (extent, &len)) in extents.iter_mut().zip(shape).enumerate() {
        *extent = i16::try_from(len).map_err(|_| {
            format!("dim[{}] = {len} exceeds the NIfTI-1 limit of {}", axis + 1, i16::MAX)
        })?;
    }

    let mut header = vec![0u8; NIFTI1_DATA_OFFSET];
    let mut put = |offset: usize, bytes: &[u8]| {
        header[offset..offset + bytes.len()].copy_from_slice(bytes);
    };

    put(0, &(NIFTI1_HEADER_SIZE as i32).to_le_bytes());
    let [nx, ny, nz, nt] = extents;
    let dims: [i16; 8] = [4, nx, ny, nz, nt, 1, 1, 1];
    for (axis, dim) in dims.iter().enumerate() {
        put(40 + 2 * axis, &dim.to_le_bytes());
    }
    put(70, &DT_FLOAT32.to_le_bytes());
    put(72, &32i16.to_le_bytes());
    let pixdims: [f32; 8] = [1.0, pixdim[0], pixdim[1], pixdim[2], 1.0, 1.0, 1.0, 1.0];
    for (axis, value) in pixdims.iter().enumerate() {
        put(76 + 4 * axis, &value.to_le_bytes());
    }
    put(108, &(NIFTI1_DATA_OFFSET as f32).to_le_bytes());
    put(112, &1.0f32.to_le_bytes());
    // millimetres and seconds
    put(123, &[10u8]);
    put(148, b"graphnet coefficient map");
    put(254, &1i16.to_le_bytes());
    let srows: [[f32; 4]; 3] = [
        [pixdim[0], 0.0, 0.0, 0.0],
        [0.0, pixdim[1], 0.0, 0.0],
        [0.0, 0.0, pixdim[2], 0.0],
    ];
    for (row, values) in srows.iter().enumerate() {
        for (col, value) in values.iter().enumerate() {
            put(280 + 16 * row + 4 * col, &value.to_le_bytes());
        }
    }
    put(344, b"n+1\0");
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;
    use tempfile::tempdir;

    fn ramp_volume() -> Array4<f32> {
        Array4::from_shape_fn((3, 2, 2, 4), |(x, y, z, t)| {
            (x + 10 * y + 100 * z) as f32 + 0.25 * t as f32
        })
    }

    #[test]
    fn nifti_round_trip_preserves_voxel_layout() {
        let dir = tempdir().unwrap();
        let data = ramp_volume();
        let written = save_volume(data.view(), [2.0, 2.0, 3.0], &dir.path().join("ramp")).unwrap();
        assert_eq!(written.extension().unwrap(), "nii");

        let volume = read_nifti(&written).unwrap();
        assert_eq!(volume.data, data);
        assert_eq!(volume.pixdim, [2.0, 2.0, 3.0]);
        assert_eq!(volume.spatial_shape(), [3, 2, 2]);
        assert_eq!(volume.num_timepoints(), 4);
    }

    #[test]
    fn gzip_round_trip() {
        let dir = tempdir().unwrap();
        let data = ramp_volume();
        let path = save_volume(data.view(), [1.0; 3], &dir.path().join("ramp.nii.gz")).unwrap();
        let volume = NiftiVolumeSource.load_volume(&path).unwrap();
        assert_eq!(volume.data, data);
    }

    #[test]
    fn truncated_file_is_a_resource_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.nii");
        fs::write(&path, [0u8; 100]).unwrap();
        let err = read_nifti(&path).unwrap_err();
        assert!(matches!(err, GraphnetError::Resource { .. }));
    }

    fn header_with(vox_offset: f32, dims: [i16; 4]) -> Vec<u8> {
        let mut bytes = encode_nifti_header(&[1, 1, 1, 1], [1.0; 3]).unwrap();
        for (axis, dim) in dims.iter().enumerate() {
            bytes[42 + 2 * axis..44 + 2 * axis].copy_from_slice(&dim.to_le_bytes());
        }
        bytes[108..112].copy_from_slice(&vox_offset.to_le_bytes());
        bytes
    }

    #[test]
    fn absurd_vox_offset_is_rejected_without_panicking() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("far_offset.nii");
        fs::write(&path, header_with(1e20, [2, 2, 2, 1])).unwrap();
        let err = read_nifti(&path).unwrap_err();
        assert!(matches!(err, GraphnetError::Resource { .. }));
        assert!(err.to_string().contains("vox_offset"), "{err}");

        let near = header_with(400.0, [2, 2, 2, 1]);
        assert!(decode_nifti(&near).unwrap_err().contains("vox_offset"));
    }

    #[test]
    fn huge_dimensions_report_missing_payload() {
        let mut bytes = header_with(352.0, [i16::MAX, i16::MAX, i16::MAX, i16::MAX]);
        bytes[70..72].copy_from_slice(&DT_FLOAT64.to_le_bytes());
        let reason = decode_nifti(&bytes).unwrap_err();
        assert!(reason.contains("bytes of voxel data"), "{reason}");
    }

    #[test]
    fn oversized_extents_are_refused_on_write() {
        let dir = tempdir().unwrap();
        let wide = Array4::<f32>::zeros((i16::MAX as usize + 1, 1, 1, 1));
        let err = save_volume(wide.view(), [1.0; 3], &dir.path().join("wide")).unwrap_err();
        assert!(matches!(err, GraphnetError::Resource { .. }));
        assert!(err.to_string().contains("32767"), "{err}");
        assert!(!dir.path().join("wide.nii").exists());
    }

    #[test]
    fn missing_file_is_a_resource_error() {
        let err = NiftiVolumeSource
            .load_volume(Path::new("/definitely/not/here.nii"))
            .unwrap_err();
        assert!(matches!(err, GraphnetError::Resource { .. }));
    }

    #[test]
    fn markers_skip_comments_and_blank_lines() {
        let text = "# onset vector\n0\n1\n\n0 -1 # trailing\n0\n";
        assert_eq!(parse_markers(text).unwrap(), vec![0.0, 1.0, 0.0, -1.0, 0.0]);
        assert!(parse_markers("0\nbuy\n").is_err());
    }

    #[test]
    fn subject_dirs_are_filtered_and_naturally_sorted() {
        let dir = tempdir().unwrap();
        for name in ["jr10", "jr9", "jk160415", "other"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        fs::write(dir.path().join("jr_not_a_dir.txt"), "x").unwrap();

        let prefixes = vec!["jr".to_string(), "jk".to_string()];
        let found = discover_subject_dirs(dir.path(), &prefixes).unwrap();
        let names: Vec<String> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["jk160415", "jr9", "jr10"]);
    }

    #[test]
    fn in_memory_source_reports_missing_entries() {
        let mut source = InMemoryVolumeSource::new();
        source.insert_markers("s1/markers.1D", vec![0.0, 1.0]);
        assert_eq!(
            source.load_markers(Path::new("s1/markers.1D")).unwrap(),
            vec![0.0, 1.0]
        );
        assert!(source.load_volume(Path::new("s1/func.nii")).is_err());
    }
}
