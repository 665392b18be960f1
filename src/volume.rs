use crate::enums::Orientation;
use crate::geometry::Vector3D;
use crate::planner::OutputVolumeParams;

use image::GrayImage;
use image::ImageBuffer;
use ndarray::Array3;
use ndarray::ArrayView2;
use ndarray::s;
use rayon::prelude::*;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Reconstructed volume. Zero voxels carry no data.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputVolume {
    data: Array3<u8>,
    params: OutputVolumeParams,
}

impl OutputVolume {
    /// Zero-filled volume for the planned grid.
    pub fn empty(params: OutputVolumeParams) -> Self {
        let [x, y, z] = params.dim;
        Self {
            data: Array3::zeros((z, y, x)),
            params,
        }
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<u8> {
        &self.data
    }

    /// Get a mutable reference to the underlying data
    pub fn data_mut(&mut self) -> &mut Array3<u8> {
        &mut self.data
    }

    pub fn params(&self) -> &OutputVolumeParams {
        &self.params
    }

    /// Centre of voxel (z, y, x) in patient reference space.
    pub fn voxel_position(&self, z: usize, y: usize, x: usize) -> Vector3D {
        let sp = self.params.spacing;
        self.params
            .orientation
            .coord(&Vector3D::new(x as f64 * sp, y as f64 * sp, z as f64 * sp))
    }

    pub fn filled_voxel_count(&self) -> usize {
        self.data.par_iter().filter(|&&v| v != 0).count()
    }

    pub fn get_slice_from_axis(
        &self,
        index: usize,
        orientation: &Orientation,
    ) -> Option<ArrayView2<'_, u8>> {
        if !self.is_valid_index(index, orientation) {
            return None;
        }
        let slice_result = match orientation {
            Orientation::Axial => self.data().slice(s![index, .., ..]),
            Orientation::Coronal => self.data().slice(s![.., index, ..]),
            Orientation::Sagittal => self.data().slice(s![.., .., index]),
        };
        Some(slice_result)
    }

    fn slice_to_image(slice: &ArrayView2<'_, u8>) -> Option<GrayImage> {
        let (height, width) = slice.dim();
        let pixel_data: Vec<u8> = slice.into_par_iter().copied().collect();
        ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
    }

    /// Slice `index` along `orientation` as an 8-bit image. Voxels are
    /// isotropic, so no resampling is needed.
    pub fn get_image_from_axis(&self, index: usize, orientation: Orientation) -> Option<GrayImage> {
        let slice = self.get_slice_from_axis(index, &orientation)?;
        Self::slice_to_image(&slice)
    }

    pub fn is_valid_index(&self, index: usize, orientation: &Orientation) -> bool {
        let dim = self.data.dim();
        let max_index = match orientation {
            Orientation::Axial => dim.0,
            Orientation::Coronal => dim.1,
            Orientation::Sagittal => dim.2,
        };
        index < max_index
    }

    /// Write a MetaImage header to `path` and the voxels next to it with a
    /// `.raw` extension.
    pub fn save_metaimage(&self, path: &Path) -> io::Result<()> {
        let raw_path = path.with_extension("raw");
        let raw_name = raw_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid output file name"))?;

        let p = &self.params;
        let origin = p.origin();
        let linear = p.orientation.linear();
        let [x, y, z] = p.dim;

        let mut header = BufWriter::new(File::create(path)?);
        writeln!(header, "ObjectType = Image")?;
        writeln!(header, "NDims = 3")?;
        writeln!(header, "BinaryData = True")?;
        writeln!(header, "BinaryDataByteOrderMSB = False")?;
        writeln!(header, "CompressedData = False")?;
        // direction cosines, one axis after the other
        write!(header, "TransformMatrix =")?;
        for col in 0..3 {
            for row in 0..3 {
                write!(header, " {}", linear[(row, col)])?;
            }
        }
        writeln!(header)?;
        writeln!(header, "Offset = {} {} {}", origin.x, origin.y, origin.z)?;
        writeln!(header, "CenterOfRotation = 0 0 0")?;
        writeln!(header, "ElementSpacing = {0} {0} {0}", p.spacing)?;
        writeln!(header, "DimSize = {x} {y} {z}")?;
        writeln!(header, "ElementType = MET_UCHAR")?;
        writeln!(header, "ElementDataFile = {raw_name}")?;
        header.flush()?;

        let mut raw = BufWriter::new(File::create(&raw_path)?);
        match self.data.as_slice() {
            Some(bytes) => raw.write_all(bytes)?,
            None => raw.write_all(&self.data.iter().copied().collect::<Vec<u8>>())?,
        }
        raw.flush()?;
        log::info!("Saved volume {x}x{y}x{z} to {}", path.display());
        Ok(())
    }
}
