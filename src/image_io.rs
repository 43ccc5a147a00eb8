use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use image::DynamicImage;
use log::{debug, info};
use ndarray::Array2;
use ndarray_npy::{ReadNpyError, ReadNpyExt, ReadableElement};
use num_traits::ToPrimitive;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::ColorType;

use crate::errors::{Result, SpatialQuantError};
use crate::image_utils::{labels_from_view, LabelMask};

/// Extensions recognized as multiplexed image containers
pub const IMAGE_EXTENSIONS: [&str; 3] = ["tiff", "tif", "qptiff"];

/// Sample type of the source image, kept so a stack can be written back unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelDepth {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

/// A loaded multi-channel image with its metadata
#[derive(Debug, Clone)]
pub struct ChannelStack {
    /// One (rows, cols) plane per channel, channel-major
    ///
    /// Samples are widened to f64, which is exact for every source type
    /// except 64-bit integers above 2^53.
    pub planes: Vec<Array2<f64>>,
    pub depth: PixelDepth,
    pub path: PathBuf,
    pub sample_name: String,
}

impl ChannelStack {
    pub fn channel_count(&self) -> usize {
        self.planes.len()
    }

    /// (rows, cols) of the planes, None for an empty stack
    pub fn dimensions(&self) -> Option<(usize, usize)> {
        self.planes.first().map(|plane| plane.dim())
    }
}

/// Lower-cased extension of a path, empty when absent
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

/// True for `.tif`, `.tiff` and `.qptiff` files
pub fn is_tiff_path(path: &Path) -> bool {
    IMAGE_EXTENSIONS.contains(&extension_of(path).as_str())
}

/// File stem of a path, used as the sample name
pub fn sample_name_of(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
        .ok_or_else(|| SpatialQuantError::InvalidPath(path.to_path_buf()))
}

fn open_tiff(path: &Path) -> Result<Decoder<BufReader<File>>> {
    let file = File::open(path)?;
    Ok(Decoder::new(BufReader::new(file))?.with_limits(Limits::unlimited()))
}

fn samples_per_pixel(color_type: ColorType) -> Result<usize> {
    match color_type {
        ColorType::Gray(_) => Ok(1),
        ColorType::GrayA(_) => Ok(2),
        ColorType::RGB(_) => Ok(3),
        ColorType::RGBA(_) => Ok(4),
        other => Err(SpatialQuantError::UnsupportedFormat(format!(
            "TIFF color type {:?}",
            other
        ))),
    }
}

fn decoding_to_f64(result: DecodingResult) -> (Vec<f64>, PixelDepth) {
    match result {
        DecodingResult::U8(buf) => (buf.into_iter().map(f64::from).collect(), PixelDepth::U8),
        DecodingResult::U16(buf) => (buf.into_iter().map(f64::from).collect(), PixelDepth::U16),
        DecodingResult::U32(buf) => (buf.into_iter().map(f64::from).collect(), PixelDepth::U32),
        DecodingResult::U64(buf) => (buf.into_iter().map(|v| v as f64).collect(), PixelDepth::U64),
        DecodingResult::I8(buf) => (buf.into_iter().map(f64::from).collect(), PixelDepth::I8),
        DecodingResult::I16(buf) => (buf.into_iter().map(f64::from).collect(), PixelDepth::I16),
        DecodingResult::I32(buf) => (buf.into_iter().map(f64::from).collect(), PixelDepth::I32),
        DecodingResult::I64(buf) => (buf.into_iter().map(|v| v as f64).collect(), PixelDepth::I64),
        DecodingResult::F32(buf) => (buf.into_iter().map(f64::from).collect(), PixelDepth::F32),
        DecodingResult::F64(buf) => (buf, PixelDepth::F64),
    }
}

/// Split interleaved samples into one plane per sample
fn deinterleave(
    samples: Vec<f64>,
    rows: usize,
    cols: usize,
    samples_per_pixel: usize,
) -> Result<Vec<Array2<f64>>> {
    if samples_per_pixel == 1 {
        return Ok(vec![Array2::from_shape_vec((rows, cols), samples)?]);
    }

    let interleaved = Array2::from_shape_vec((rows * cols, samples_per_pixel), samples)?;
    (0..samples_per_pixel)
        .map(|sample| -> Result<Array2<f64>> {
            let plane = interleaved.column(sample).to_owned();
            Ok(plane.into_shape_with_order((rows, cols))?)
        })
        .collect()
}

fn load_tiff_stack(path: &Path) -> Result<(Vec<Array2<f64>>, PixelDepth)> {
    let mut decoder = open_tiff(path)?;
    let (width, height) = decoder.dimensions()?;

    let mut planes = Vec::new();
    let mut depth = None;

    loop {
        let spp = samples_per_pixel(decoder.colortype()?)?;
        let (samples, page_depth) = decoding_to_f64(decoder.read_image()?);
        depth.get_or_insert(page_depth);
        planes.extend(deinterleave(samples, height as usize, width as usize, spp)?);

        if !decoder.more_images() {
            break;
        }
        decoder.next_image()?;

        // Thumbnails and reduced-resolution levels follow the full-resolution channels
        if decoder.dimensions()? != (width, height) {
            debug!("Stopping at first page with different dimensions in {}", path.display());
            break;
        }
    }

    Ok((planes, depth.unwrap_or(PixelDepth::F64)))
}

fn load_raster_stack(path: &Path) -> Result<(Vec<Array2<f64>>, PixelDepth)> {
    let img = image::open(path)?;
    let (rows, cols) = (img.height() as usize, img.width() as usize);

    let (samples, spp, depth): (Vec<f64>, usize, PixelDepth) = match img {
        DynamicImage::ImageLuma8(buf) => (buf.into_raw().into_iter().map(f64::from).collect(), 1, PixelDepth::U8),
        DynamicImage::ImageLumaA8(buf) => (buf.into_raw().into_iter().map(f64::from).collect(), 2, PixelDepth::U8),
        DynamicImage::ImageRgb8(buf) => (buf.into_raw().into_iter().map(f64::from).collect(), 3, PixelDepth::U8),
        DynamicImage::ImageRgba8(buf) => (buf.into_raw().into_iter().map(f64::from).collect(), 4, PixelDepth::U8),
        DynamicImage::ImageLuma16(buf) => (buf.into_raw().into_iter().map(f64::from).collect(), 1, PixelDepth::U16),
        DynamicImage::ImageLumaA16(buf) => (buf.into_raw().into_iter().map(f64::from).collect(), 2, PixelDepth::U16),
        DynamicImage::ImageRgb16(buf) => (buf.into_raw().into_iter().map(f64::from).collect(), 3, PixelDepth::U16),
        DynamicImage::ImageRgba16(buf) => (buf.into_raw().into_iter().map(f64::from).collect(), 4, PixelDepth::U16),
        DynamicImage::ImageRgb32F(buf) => (buf.into_raw().into_iter().map(f64::from).collect(), 3, PixelDepth::F32),
        DynamicImage::ImageRgba32F(buf) => (buf.into_raw().into_iter().map(f64::from).collect(), 4, PixelDepth::F32),
        other => {
            return Err(SpatialQuantError::UnsupportedFormat(format!(
                "{:?} in {}",
                other.color(),
                path.display()
            )))
        }
    };

    Ok((deinterleave(samples, rows, cols, spp)?, depth))
}

/// Load a channel-major image stack
///
/// TIFF containers (including QPTIFF) yield one plane per full-resolution
/// page; other raster formats yield one plane per color sample.
pub fn load_channel_stack<P: AsRef<Path>>(path: P) -> Result<ChannelStack> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(SpatialQuantError::InvalidPath(path.to_path_buf()));
    }

    let sample_name = sample_name_of(path)?;

    let (planes, depth) = if is_tiff_path(path) {
        load_tiff_stack(path)?
    } else {
        load_raster_stack(path)?
    };

    info!("Loaded {} channels from {}", planes.len(), path.display());

    Ok(ChannelStack {
        planes,
        depth,
        path: path.to_path_buf(),
        sample_name,
    })
}

/// Try one `.npy` element type; None when the file stores a different dtype
fn try_read_npy_mask<T>(path: &Path) -> Result<Option<LabelMask>>
where
    T: ReadableElement + ToPrimitive + Copy,
{
    let reader = BufReader::new(File::open(path)?);
    match Array2::<T>::read_npy(reader) {
        Ok(array) => labels_from_view(array.view()).map(Some),
        Err(ReadNpyError::WrongDescriptor(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn load_npy_mask(path: &Path) -> Result<LabelMask> {
    macro_rules! try_dtypes {
        ($($t:ty),+) => {
            $(
                if let Some(mask) = try_read_npy_mask::<$t>(path)? {
                    return Ok(mask);
                }
            )+
        };
    }

    try_dtypes!(i32, i64, u32, u16, u64, i16, u8, i8);

    Err(SpatialQuantError::UnsupportedFormat(format!(
        "{} is not an integer .npy array",
        path.display()
    )))
}

fn load_tiff_mask(path: &Path) -> Result<LabelMask> {
    let mut decoder = open_tiff(path)?;
    let (width, height) = decoder.dimensions()?;
    let shape = (height as usize, width as usize);

    if samples_per_pixel(decoder.colortype()?)? != 1 {
        return Err(SpatialQuantError::UnsupportedFormat(format!(
            "segmentation mask {} must be single-channel",
            path.display()
        )));
    }

    match decoder.read_image()? {
        DecodingResult::U8(buf) => labels_from_view(Array2::from_shape_vec(shape, buf)?.view()),
        DecodingResult::U16(buf) => labels_from_view(Array2::from_shape_vec(shape, buf)?.view()),
        DecodingResult::U32(buf) => Ok(Array2::from_shape_vec(shape, buf)?),
        DecodingResult::U64(buf) => labels_from_view(Array2::from_shape_vec(shape, buf)?.view()),
        DecodingResult::I8(buf) => labels_from_view(Array2::from_shape_vec(shape, buf)?.view()),
        DecodingResult::I16(buf) => labels_from_view(Array2::from_shape_vec(shape, buf)?.view()),
        DecodingResult::I32(buf) => labels_from_view(Array2::from_shape_vec(shape, buf)?.view()),
        DecodingResult::I64(buf) => labels_from_view(Array2::from_shape_vec(shape, buf)?.view()),
        DecodingResult::F32(_) | DecodingResult::F64(_) => Err(SpatialQuantError::UnsupportedFormat(
            format!("segmentation mask {} stores floating-point samples", path.display()),
        )),
    }
}

fn load_raster_mask(path: &Path) -> Result<LabelMask> {
    let img = image::open(path)?;
    let shape = (img.height() as usize, img.width() as usize);

    match img {
        DynamicImage::ImageLuma8(buf) => labels_from_view(Array2::from_shape_vec(shape, buf.into_raw())?.view()),
        DynamicImage::ImageLuma16(buf) => labels_from_view(Array2::from_shape_vec(shape, buf.into_raw())?.view()),
        other => Err(SpatialQuantError::UnsupportedFormat(format!(
            "segmentation mask {} has color type {:?}",
            path.display(),
            other.color()
        ))),
    }
}

/// Load a 2-D integer segmentation mask from `.npy`, TIFF or a grayscale raster
pub fn load_mask<P: AsRef<Path>>(path: P) -> Result<LabelMask> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(SpatialQuantError::InvalidPath(path.to_path_buf()));
    }

    let mask = match extension_of(path).as_str() {
        "npy" => load_npy_mask(path)?,
        _ if is_tiff_path(path) => load_tiff_mask(path)?,
        _ => load_raster_mask(path)?,
    };

    info!("Loaded {:?} segmentation mask from {}", mask.dim(), path.display());

    Ok(mask)
}

/// Write planes as a multi-page grayscale TIFF with the given sample type
///
/// Values are cast back to the sample type; out-of-range values saturate.
pub fn save_channel_stack<P: AsRef<Path>>(
    planes: &[Array2<f64>],
    depth: PixelDepth,
    path: P,
) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut encoder = TiffEncoder::new(File::create(path)?)?;

    for plane in planes {
        let (rows, cols) = plane.dim();
        let (width, height) = (cols as u32, rows as u32);
        // iter() walks logical row-major order regardless of memory layout
        let samples = plane.iter().copied();

        match depth {
            PixelDepth::U8 => {
                let data: Vec<u8> = samples.map(|v| v as u8).collect();
                encoder.write_image::<colortype::Gray8>(width, height, &data)?;
            }
            PixelDepth::U16 => {
                let data: Vec<u16> = samples.map(|v| v as u16).collect();
                encoder.write_image::<colortype::Gray16>(width, height, &data)?;
            }
            PixelDepth::U32 => {
                let data: Vec<u32> = samples.map(|v| v as u32).collect();
                encoder.write_image::<colortype::Gray32>(width, height, &data)?;
            }
            PixelDepth::U64 => {
                let data: Vec<u64> = samples.map(|v| v as u64).collect();
                encoder.write_image::<colortype::Gray64>(width, height, &data)?;
            }
            PixelDepth::I8 => {
                let data: Vec<i8> = samples.map(|v| v as i8).collect();
                encoder.write_image::<colortype::GrayI8>(width, height, &data)?;
            }
            PixelDepth::I16 => {
                let data: Vec<i16> = samples.map(|v| v as i16).collect();
                encoder.write_image::<colortype::GrayI16>(width, height, &data)?;
            }
            PixelDepth::I32 => {
                let data: Vec<i32> = samples.map(|v| v as i32).collect();
                encoder.write_image::<colortype::GrayI32>(width, height, &data)?;
            }
            PixelDepth::I64 => {
                let data: Vec<i64> = samples.map(|v| v as i64).collect();
                encoder.write_image::<colortype::GrayI64>(width, height, &data)?;
            }
            PixelDepth::F32 => {
                let data: Vec<f32> = samples.map(|v| v as f32).collect();
                encoder.write_image::<colortype::Gray32Float>(width, height, &data)?;
            }
            PixelDepth::F64 => {
                let data: Vec<f64> = samples.collect();
                encoder.write_image::<colortype::Gray64Float>(width, height, &data)?;
            }
        }
    }

    Ok(())
}

/// List the image containers directly inside a directory, sorted by path
pub fn get_image_files_in_dir<P: AsRef<Path>>(dir_path: P) -> Result<Vec<PathBuf>> {
    let dir_path = dir_path.as_ref();

    if !dir_path.is_dir() {
        return Err(SpatialQuantError::InvalidPath(dir_path.to_path_buf()));
    }

    let mut image_files = Vec::new();
    for entry in fs::read_dir(dir_path)? {
        let path = entry?.path();
        if path.is_file() && is_tiff_path(&path) {
            image_files.push(path);
        }
    }
    image_files.sort();

    Ok(image_files)
}

/// Move every image container in `data_dir` to `data_dir/<sample>/data/<file>`
///
/// Returns the new locations.
pub fn prepare_input<P: AsRef<Path>>(data_dir: P) -> Result<Vec<PathBuf>> {
    let data_dir = data_dir.as_ref();
    let mut moved = Vec::new();

    for image_path in get_image_files_in_dir(data_dir)? {
        let sample_name = sample_name_of(&image_path)?;
        let file_name = image_path
            .file_name()
            .ok_or_else(|| SpatialQuantError::InvalidPath(image_path.clone()))?;

        let sample_dir = data_dir.join(&sample_name).join("data");
        fs::create_dir_all(&sample_dir)?;

        let destination = sample_dir.join(file_name);
        fs::rename(&image_path, &destination)?;
        info!("Moved {} -> {}", image_path.display(), destination.display());

        moved.push(destination);
    }

    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use ndarray_npy::WriteNpyExt;

    fn write_npy<T: ndarray_npy::WritableElement>(array: &Array2<T>, path: &Path) {
        let writer = File::create(path).unwrap();
        array.write_npy(writer).unwrap();
    }

    #[test]
    fn loads_npy_masks_of_any_integer_type() {
        let dir = tempfile::tempdir().unwrap();

        let wide = dir.path().join("wide.npy");
        write_npy(&array![[0i64, 3], [3, 5]], &wide);
        assert_eq!(load_mask(&wide).unwrap(), array![[0u32, 3], [3, 5]]);

        let narrow = dir.path().join("narrow.npy");
        write_npy(&array![[1u16, 0], [0, 2]], &narrow);
        assert_eq!(load_mask(&narrow).unwrap(), array![[1u32, 0], [0, 2]]);
    }

    #[test]
    fn rejects_negative_npy_labels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("negative.npy");
        write_npy(&array![[0i32, -1]], &path);

        assert!(matches!(load_mask(&path), Err(SpatialQuantError::NegativeLabel(-1))));
    }

    #[test]
    fn rejects_float_npy_masks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("float.npy");
        write_npy(&array![[0.0f64, 1.0]], &path);

        assert!(matches!(load_mask(&path), Err(SpatialQuantError::UnsupportedFormat(_))));
    }

    #[test]
    fn missing_mask_is_an_invalid_path() {
        assert!(matches!(
            load_mask("/definitely/not/here.npy"),
            Err(SpatialQuantError::InvalidPath(_))
        ));
    }

    #[test]
    fn tiff_stack_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.tif");
        let planes = vec![
            array![[1.0f64, 2.0, 3.0], [4.0, 5.0, 6.0]],
            array![[60.0f64, 50.0, 40.0], [30.0, 20.0, 10.0]],
        ];

        save_channel_stack(&planes, PixelDepth::U16, &path).unwrap();
        let stack = load_channel_stack(&path).unwrap();

        assert_eq!(stack.sample_name, "sample");
        assert_eq!(stack.depth, PixelDepth::U16);
        assert_eq!(stack.dimensions(), Some((2, 3)));
        assert_eq!(stack.planes, planes);
    }

    #[test]
    fn wide_samples_load_without_rounding() {
        let dir = tempfile::tempdir().unwrap();

        let float_path = dir.path().join("float64.tif");
        let mut encoder = TiffEncoder::new(File::create(&float_path).unwrap()).unwrap();
        encoder
            .write_image::<colortype::Gray64Float>(2, 1, &[0.1f64, 0.1])
            .unwrap();
        drop(encoder);

        let stack = load_channel_stack(&float_path).unwrap();
        assert_eq!(stack.depth, PixelDepth::F64);
        assert_eq!(stack.planes[0], array![[0.1f64, 0.1]]);

        let int_path = dir.path().join("uint32.tif");
        let mut encoder = TiffEncoder::new(File::create(&int_path).unwrap()).unwrap();
        encoder
            .write_image::<colortype::Gray32>(2, 1, &[16_777_217u32, 16_777_217])
            .unwrap();
        drop(encoder);

        let stack = load_channel_stack(&int_path).unwrap();
        assert_eq!(stack.depth, PixelDepth::U32);
        assert_eq!(stack.planes[0], array![[16_777_217.0f64, 16_777_217.0]]);
    }

    #[test]
    fn signed_stacks_keep_their_sample_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signed.tif");
        let planes = vec![array![[-300.0f64, 0.0], [12.0, 32_000.0]]];

        save_channel_stack(&planes, PixelDepth::I16, &path).unwrap();
        let stack = load_channel_stack(&path).unwrap();

        assert_eq!(stack.depth, PixelDepth::I16);
        assert_eq!(stack.planes, planes);
    }

    #[test]
    fn tiff_mask_keeps_raw_labels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.tiff");
        let labels = array![[0.0f64, 300.0], [7.0, 0.0]];

        save_channel_stack(&[labels], PixelDepth::U16, &path).unwrap();

        assert_eq!(load_mask(&path).unwrap(), array![[0u32, 300], [7, 0]]);
    }

    #[test]
    fn png_mask_is_not_rescaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.png");
        let buffer = image::GrayImage::from_raw(2, 2, vec![0, 4, 4, 9]).unwrap();
        buffer.save(&path).unwrap();

        assert_eq!(load_mask(&path).unwrap(), array![[0u32, 4], [4, 9]]);
    }

    #[test]
    fn rgb_raster_splits_into_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rgb.png");
        let buffer = image::RgbImage::from_raw(2, 1, vec![1, 2, 3, 4, 5, 6]).unwrap();
        buffer.save(&path).unwrap();

        let stack = load_channel_stack(&path).unwrap();

        assert_eq!(stack.channel_count(), 3);
        assert_eq!(stack.planes[0], array![[1.0f64, 4.0]]);
        assert_eq!(stack.planes[1], array![[2.0f64, 5.0]]);
        assert_eq!(stack.planes[2], array![[3.0f64, 6.0]]);
    }

    #[test]
    fn prepare_input_moves_only_images() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("slide_a.qptiff"), b"a").unwrap();
        fs::write(dir.path().join("slide_b.tif"), b"b").unwrap();
        fs::write(dir.path().join("notes.txt"), b"keep").unwrap();

        let moved = prepare_input(dir.path()).unwrap();

        assert_eq!(moved.len(), 2);
        assert!(dir.path().join("slide_a").join("data").join("slide_a.qptiff").is_file());
        assert!(dir.path().join("slide_b").join("data").join("slide_b.tif").is_file());
        assert!(dir.path().join("notes.txt").is_file());
        assert!(!dir.path().join("slide_a.qptiff").exists());
    }
}
