// src/source.rs
use std::ffi::c_void;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

/// Affine transform from pixel/line space to georeferenced coordinates,
/// in the usual six-coefficient layout.
pub type GeoTransform = [f64; 6];

/// Identity transform used when a dataset carries no georeferencing.
pub const IDENTITY_GEO_TRANSFORM: GeoTransform = [0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

/// How a source is opened. Not part of the pool lookup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Read,
    Update,
}

/// Flags handed to the opener, derived from the access mode.
#[derive(Debug, Clone, Copy)]
pub struct OpenFlags {
    pub update: bool,
    pub raster: bool,
    pub verbose_errors: bool,
}

impl OpenFlags {
    pub fn for_access(access: AccessMode) -> Self {
        OpenFlags {
            update: access == AccessMode::Update,
            raster: true,
            verbose_errors: true,
        }
    }
}

/// Sample type of a raster band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterDataType {
    U8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

/// One ground control point tying a pixel/line position to a
/// georeferenced location.
#[derive(Debug, Clone, PartialEq)]
pub struct GroundControlPoint {
    pub id: String,
    pub info: String,
    pub pixel: f64,
    pub line: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorEntry {
    pub c1: i16,
    pub c2: i16,
    pub c3: i16,
    pub c4: i16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColorTable {
    pub entries: Vec<ColorEntry>,
}

/// An opened external raster data object; the thing the pool caches.
///
/// Closing a source is dropping it. Implementations live behind the
/// opener registered with [`crate::pool::register_opener`] and are
/// always driven through a pool reference, never held directly.
pub trait Source: Send {
    fn raster_size(&self) -> (usize, usize);
    fn access(&self) -> AccessMode;

    fn projection(&self) -> Option<String>;
    fn set_projection(&mut self, projection: &str) -> Result<()>;

    fn geo_transform(&self) -> Option<GeoTransform>;
    fn set_geo_transform(&mut self, transform: &GeoTransform) -> Result<()>;

    fn gcp_projection(&self) -> Option<String>;
    fn gcps(&self) -> &[GroundControlPoint];

    /// Metadata for a domain as a list of `KEY=VALUE` strings.
    fn metadata(&self, domain: Option<&str>) -> Option<Vec<String>>;
    fn metadata_item(&self, name: &str, domain: Option<&str>) -> Option<String>;

    fn band_count(&self) -> usize;
    /// Bands are numbered starting at 1.
    fn band(&self, band: usize) -> Option<&dyn SourceBand>;

    /// Driver-internal handle, if any. Only meaningful for debugging;
    /// the handle dies with the source.
    fn internal_handle(&self, request: Option<&str>) -> Option<*mut c_void> {
        let _ = request;
        None
    }
}

/// One band of a [`Source`].
pub trait SourceBand {
    fn band_size(&self) -> (usize, usize);
    fn block_size(&self) -> (usize, usize);
    fn data_type(&self) -> RasterDataType;

    fn overview_count(&self) -> usize;
    fn overview(&self, level: usize) -> Option<&dyn SourceBand>;
    fn mask_band(&self) -> Option<&dyn SourceBand>;

    fn category_names(&self) -> Option<Vec<String>>;
    fn unit_type(&self) -> Option<String>;
    fn color_table(&self) -> Option<ColorTable>;

    fn metadata(&self, domain: Option<&str>) -> Option<Vec<String>>;
    fn metadata_item(&self, name: &str, domain: Option<&str>) -> Option<String>;

    /// Read a window of samples as `f32`, row-major.
    fn read_region(&self, offset: (isize, isize), size: (usize, usize)) -> Result<Vec<f32>>;
}

/// Opens sources on behalf of the pool. The registered opener stands in
/// for the driver subsystem; it may itself create proxy datasets, which
/// re-enter the pool.
pub trait SourceOpener: Send + Sync {
    fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        open_options: &[String],
    ) -> Result<Box<dyn Source>>;
}

/// A cached open source as stored in the pool and handed to proxies.
pub type SharedSource = Arc<Mutex<Box<dyn Source>>>;
