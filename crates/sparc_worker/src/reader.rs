//! Image reader for multi-page (OME-)TIFF files.
//!
//! Pages are grayscale planes. When the first page carries OME-XML in its
//! `ImageDescription`, `SizeC`/`SizeZ`/`SizeT` and `DimensionOrder` map pages
//! to `(c, z, t)`; channel names, physical pixel sizes and image ids
//! (scenes) come from the same document. Plain TIFFs are read as one
//! channel with one z-slice per page.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use ndarray::Array4;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use sparc_preprocess::{ImageVolume, VolumeData};
use sparc_protocol::ImageDims;
use thiserror::Error;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::tags::Tag;
use tiff::ColorType;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("Malformed OME-XML: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("{0}")]
    Format(String),
}

/// Physical pixel sizes as declared by the file, if any.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhysicalSizes {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageMetadata {
    /// One entry per channel; `None` where the file names no channel.
    pub channel_names: Vec<Option<String>>,
    pub physical_sizes: PhysicalSizes,
    pub scenes: Vec<String>,
    pub dims: ImageDims,
}

/// Source of CZYX imagery for ingestion and preprocessing.
pub trait ImageReader: Send + Sync {
    fn read_metadata(&self, path: &Path) -> Result<ImageMetadata, ReaderError>;

    /// Pixel data of the first timepoint as CZYX.
    fn read_volume(&self, path: &Path) -> Result<ImageVolume, ReaderError>;
}

#[derive(Debug, Clone, Default)]
pub struct OmeTiffReader;

#[derive(Debug, Clone, PartialEq)]
struct PageLayout {
    size_c: usize,
    size_z: usize,
    size_t: usize,
    /// Axis letters after `XY`, fastest varying first.
    order: String,
    channel_names: Vec<Option<String>>,
    physical_sizes: PhysicalSizes,
    scenes: Vec<String>,
}

impl PageLayout {
    fn plain(pages: usize) -> Self {
        Self {
            size_c: 1,
            size_z: pages,
            size_t: 1,
            order: "ZCT".to_string(),
            channel_names: vec![None],
            physical_sizes: PhysicalSizes::default(),
            scenes: vec!["Image:0".to_string()],
        }
    }

    /// Page holding plane `(c, z)` of the first timepoint.
    fn page_index(&self, c: usize, z: usize) -> usize {
        let mut index = 0;
        let mut stride = 1;
        for axis in self.order.chars() {
            let (position, size) = match axis {
                'C' => (c, self.size_c),
                'Z' => (z, self.size_z),
                _ => (0, self.size_t),
            };
            index += position * stride;
            stride *= size;
        }
        index
    }
}

/// Attributes of one element, entity references decoded.
fn attributes(tag: &BytesStart<'_>) -> Result<BTreeMap<String, String>, ReaderError> {
    let mut attrs = BTreeMap::new();
    for attr in tag.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        attrs.insert(key, attr.unescape_value()?.into_owned());
    }
    Ok(attrs)
}

fn parse_size(attrs: &BTreeMap<String, String>, key: &str) -> Result<usize, ReaderError> {
    match attrs.get(key) {
        None => Ok(1),
        Some(value) => value
            .trim()
            .parse::<usize>()
            .map_err(|_| ReaderError::Format(format!("Invalid OME {key} '{value}'"))),
    }
}

fn positive(attrs: &BTreeMap<String, String>, key: &str) -> Option<f64> {
    attrs
        .get(key)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v > 0.0)
}

/// Parse the first `<Image>` of an OME-XML document. `None` when the text
/// is not OME-XML.
fn parse_ome(xml: &str) -> Result<Option<PageLayout>, ReaderError> {
    let mut reader = Reader::from_str(xml);
    let mut pixel_attrs: Option<BTreeMap<String, String>> = None;
    let mut in_first_pixels = false;
    let mut channel_names: Vec<Option<String>> = Vec::new();
    let mut scenes: Vec<String> = Vec::new();

    loop {
        let (tag, opens_block) = match reader.read_event()? {
            Event::Start(tag) => (tag, true),
            Event::Empty(tag) => (tag, false),
            Event::End(tag) => {
                if tag.local_name().as_ref() == b"Pixels" {
                    in_first_pixels = false;
                }
                continue;
            }
            Event::Eof => break,
            _ => continue,
        };
        match tag.local_name().as_ref() {
            b"Image" => {
                let attrs = attributes(&tag)?;
                let scene = attrs
                    .get("ID")
                    .or_else(|| attrs.get("Name"))
                    .cloned()
                    .unwrap_or_else(|| format!("Image:{}", scenes.len()));
                scenes.push(scene);
            }
            b"Pixels" if pixel_attrs.is_none() => {
                pixel_attrs = Some(attributes(&tag)?);
                in_first_pixels = opens_block;
            }
            // Channels of the first Pixels block only.
            b"Channel" if in_first_pixels => {
                channel_names.push(attributes(&tag)?.get("Name").cloned());
            }
            _ => {}
        }
    }

    let Some(pixel_attrs) = pixel_attrs else {
        return Ok(None);
    };
    let size_c = parse_size(&pixel_attrs, "SizeC")?;
    let size_z = parse_size(&pixel_attrs, "SizeZ")?;
    let size_t = parse_size(&pixel_attrs, "SizeT")?;
    let dimension_order = pixel_attrs
        .get("DimensionOrder")
        .cloned()
        .unwrap_or_else(|| "XYCZT".to_string());
    let order: String = dimension_order.chars().skip(2).collect();
    if order.len() != 3 || !['C', 'Z', 'T'].iter().all(|a| order.contains(*a)) {
        return Err(ReaderError::Format(format!(
            "Unsupported DimensionOrder '{dimension_order}'"
        )));
    }
    channel_names.resize(size_c, None);

    Ok(Some(PageLayout {
        size_c,
        size_z,
        size_t,
        order,
        channel_names,
        physical_sizes: PhysicalSizes {
            x: positive(&pixel_attrs, "PhysicalSizeX"),
            y: positive(&pixel_attrs, "PhysicalSizeY"),
            z: positive(&pixel_attrs, "PhysicalSizeZ"),
        },
        scenes: if scenes.is_empty() {
            vec!["Image:0".to_string()]
        } else {
            scenes
        },
    }))
}

fn open_decoder(path: &Path) -> Result<Decoder<BufReader<File>>, ReaderError> {
    let file = File::open(path)?;
    Ok(Decoder::new(BufReader::new(file))?.with_limits(Limits::unlimited()))
}

/// Layout, plane size and page count of a file.
fn probe(decoder: &mut Decoder<BufReader<File>>) -> Result<(PageLayout, usize, usize), ReaderError> {
    let description = decoder.get_tag_ascii_string(Tag::ImageDescription).ok();
    let (width, height) = decoder.dimensions()?;
    let mut pages = 1;
    while decoder.more_images() {
        decoder.next_image()?;
        pages += 1;
    }

    let layout = match description.as_deref().map(parse_ome).transpose()?.flatten() {
        Some(layout) => layout,
        None => PageLayout::plain(pages),
    };
    let needed = layout.size_c * layout.size_z * layout.size_t;
    if needed == 0 || width == 0 || height == 0 {
        return Err(ReaderError::Format("Image has an empty dimension".to_string()));
    }
    if pages < needed {
        return Err(ReaderError::Format(format!(
            "Expected {needed} pages from OME metadata, found {pages}"
        )));
    }
    Ok((layout, height as usize, width as usize))
}

enum Samples {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl TryFrom<DecodingResult> for Samples {
    type Error = ReaderError;

    fn try_from(result: DecodingResult) -> Result<Self, Self::Error> {
        Ok(match result {
            DecodingResult::U8(v) => Samples::U8(v),
            DecodingResult::U16(v) => Samples::U16(v),
            DecodingResult::U32(v) => Samples::U32(v),
            DecodingResult::F32(v) => Samples::F32(v),
            DecodingResult::F64(v) => Samples::F64(v),
            _ => return Err(ReaderError::Format("Unsupported sample format".to_string())),
        })
    }
}

macro_rules! assemble {
    ($variant:ident, $planes:expr, $shape:expr) => {{
        let (c, z, y, x) = $shape;
        let mut data = Vec::with_capacity(c * z * y * x);
        for plane in $planes {
            match plane {
                Samples::$variant(values) => data.extend(values),
                _ => return Err(ReaderError::Format("Pages use mixed sample formats".to_string())),
            }
        }
        VolumeData::$variant(
            Array4::from_shape_vec($shape, data).map_err(|e| ReaderError::Format(e.to_string()))?,
        )
    }};
}

impl ImageReader for OmeTiffReader {
    fn read_metadata(&self, path: &Path) -> Result<ImageMetadata, ReaderError> {
        let mut decoder = open_decoder(path)?;
        let (layout, height, width) = probe(&mut decoder)?;
        Ok(ImageMetadata {
            channel_names: layout.channel_names,
            physical_sizes: layout.physical_sizes,
            scenes: layout.scenes,
            dims: ImageDims {
                c: layout.size_c,
                z: layout.size_z,
                y: height,
                x: width,
            },
        })
    }

    fn read_volume(&self, path: &Path) -> Result<ImageVolume, ReaderError> {
        let (layout, height, width) = probe(&mut open_decoder(path)?)?;

        let mut wanted: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
        for c in 0..layout.size_c {
            for z in 0..layout.size_z {
                wanted.insert(layout.page_index(c, z), (c, z));
            }
        }
        let last_page = wanted.keys().next_back().copied().unwrap_or(0);

        let mut decoder = open_decoder(path)?;
        let mut planes: BTreeMap<(usize, usize), Samples> = BTreeMap::new();
        for page in 0..=last_page {
            if page > 0 {
                decoder.next_image()?;
            }
            let Some(&plane) = wanted.get(&page) else {
                continue;
            };
            if !matches!(decoder.colortype()?, ColorType::Gray(_)) {
                return Err(ReaderError::Format(format!(
                    "Page {page} is not a single-channel grayscale image"
                )));
            }
            let (w, h) = decoder.dimensions()?;
            if (h as usize, w as usize) != (height, width) {
                return Err(ReaderError::Format(format!(
                    "Page {page} is {w}x{h}, expected {width}x{height}"
                )));
            }
            planes.insert(plane, Samples::try_from(decoder.read_image()?)?);
        }
        debug!(path = %path.display(), planes = planes.len(), "Decoded TIFF pages");

        let shape = (layout.size_c, layout.size_z, height, width);
        // BTreeMap order is (c, z), i.e. CZYX row-major.
        let mut ordered = planes.into_values().peekable();
        let data = match ordered.peek() {
            Some(Samples::U8(_)) => assemble!(U8, ordered, shape),
            Some(Samples::U16(_)) => assemble!(U16, ordered, shape),
            Some(Samples::U32(_)) => assemble!(U32, ordered, shape),
            Some(Samples::F32(_)) => assemble!(F32, ordered, shape),
            Some(Samples::F64(_)) => assemble!(F64, ordered, shape),
            None => return Err(ReaderError::Format("Image has no pages".to_string())),
        };
        Ok(ImageVolume::new(data))
    }
}
