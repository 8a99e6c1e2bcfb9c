// src/testing.rs
//! In-memory [`Source`] doubles used by the crate's tests and benches.
//!
//! [`MemoryOpener`] plays the driver subsystem: it hands out
//! [`MemorySource`] instances built from registered [`SourceSpec`]s and
//! records every open and close together with the responsible identity
//! observed at that moment.

use std::collections::{HashMap, HashSet};
use std::ffi::c_void;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;

use crate::proxy::ProxyDataset;
use crate::rid::{self, Rid};
use crate::source::{
    AccessMode, ColorTable, GeoTransform, GroundControlPoint, OpenFlags, RasterDataType, Source,
    SourceBand, SourceOpener,
};

#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    Opened { path: String, rid: Rid },
    Closed { path: String, rid: Rid },
}

pub type EventLog = Arc<Mutex<Vec<PoolEvent>>>;

/// Description of one band of a [`MemorySource`], including its
/// overview pyramid and mask.
#[derive(Debug, Clone)]
pub struct BandSpec {
    pub data_type: RasterDataType,
    pub size: (usize, usize),
    pub block_size: (usize, usize),
    pub unit_type: Option<String>,
    pub category_names: Option<Vec<String>>,
    pub color_table: Option<ColorTable>,
    pub metadata: HashMap<Option<String>, Vec<String>>,
    pub metadata_items: HashMap<(String, Option<String>), String>,
    pub fill_value: f32,
    pub overviews: Vec<BandSpec>,
    pub mask: Option<Box<BandSpec>>,
}

impl BandSpec {
    pub fn new(data_type: RasterDataType, size: (usize, usize)) -> Self {
        BandSpec {
            data_type,
            size,
            block_size: (size.0.min(256), size.1.min(256)),
            unit_type: None,
            category_names: None,
            color_table: None,
            metadata: HashMap::new(),
            metadata_items: HashMap::new(),
            fill_value: 0.0,
            overviews: Vec::new(),
            mask: None,
        }
    }
}

impl SourceBand for BandSpec {
    fn band_size(&self) -> (usize, usize) {
        self.size
    }

    fn block_size(&self) -> (usize, usize) {
        self.block_size
    }

    fn data_type(&self) -> RasterDataType {
        self.data_type
    }

    fn overview_count(&self) -> usize {
        self.overviews.len()
    }

    fn overview(&self, level: usize) -> Option<&dyn SourceBand> {
        self.overviews.get(level).map(|band| band as &dyn SourceBand)
    }

    fn mask_band(&self) -> Option<&dyn SourceBand> {
        self.mask.as_deref().map(|band| band as &dyn SourceBand)
    }

    fn category_names(&self) -> Option<Vec<String>> {
        self.category_names.clone()
    }

    fn unit_type(&self) -> Option<String> {
        self.unit_type.clone()
    }

    fn color_table(&self) -> Option<ColorTable> {
        self.color_table.clone()
    }

    fn metadata(&self, domain: Option<&str>) -> Option<Vec<String>> {
        self.metadata.get(&domain.map(str::to_owned)).cloned()
    }

    fn metadata_item(&self, name: &str, domain: Option<&str>) -> Option<String> {
        self.metadata_items
            .get(&(name.to_owned(), domain.map(str::to_owned)))
            .cloned()
    }

    fn read_region(&self, offset: (isize, isize), size: (usize, usize)) -> Result<Vec<f32>> {
        let (width, height) = self.size;
        if offset.0 < 0
            || offset.1 < 0
            || offset.0 as usize + size.0 > width
            || offset.1 as usize + size.1 > height
        {
            bail!("read window out of bounds");
        }
        Ok(vec![self.fill_value; size.0 * size.1])
    }
}

/// Description of a [`MemorySource`], registered with a
/// [`MemoryOpener`] under a path.
#[derive(Debug, Clone, Default)]
pub struct SourceSpec {
    pub raster_size: (usize, usize),
    pub projection: Option<String>,
    pub geo_transform: Option<GeoTransform>,
    pub gcp_projection: Option<String>,
    pub gcps: Vec<GroundControlPoint>,
    pub metadata: HashMap<Option<String>, Vec<String>>,
    pub metadata_items: HashMap<(String, Option<String>), String>,
    pub bands: Vec<BandSpec>,
}

impl SourceSpec {
    pub fn with_size(raster_size: (usize, usize)) -> Self {
        SourceSpec {
            raster_size,
            ..SourceSpec::default()
        }
    }
}

pub struct MemorySource {
    path: String,
    access: AccessMode,
    spec: SourceSpec,
    events: EventLog,
    /// Kept alive until this source closes; lets tests model cascaded
    /// proxies owned by an open source, whose final drop then happens
    /// inside a pool-performed close.
    retained: Vec<Arc<ProxyDataset>>,
}

impl MemorySource {
    pub fn retain(&mut self, dataset: Arc<ProxyDataset>) {
        self.retained.push(dataset);
    }
}

impl Source for MemorySource {
    fn raster_size(&self) -> (usize, usize) {
        self.spec.raster_size
    }

    fn access(&self) -> AccessMode {
        self.access
    }

    fn projection(&self) -> Option<String> {
        self.spec.projection.clone()
    }

    fn set_projection(&mut self, projection: &str) -> Result<()> {
        self.spec.projection = Some(projection.to_owned());
        Ok(())
    }

    fn geo_transform(&self) -> Option<GeoTransform> {
        self.spec.geo_transform
    }

    fn set_geo_transform(&mut self, transform: &GeoTransform) -> Result<()> {
        self.spec.geo_transform = Some(*transform);
        Ok(())
    }

    fn gcp_projection(&self) -> Option<String> {
        self.spec.gcp_projection.clone()
    }

    fn gcps(&self) -> &[GroundControlPoint] {
        &self.spec.gcps
    }

    fn metadata(&self, domain: Option<&str>) -> Option<Vec<String>> {
        self.spec.metadata.get(&domain.map(str::to_owned)).cloned()
    }

    fn metadata_item(&self, name: &str, domain: Option<&str>) -> Option<String> {
        self.spec
            .metadata_items
            .get(&(name.to_owned(), domain.map(str::to_owned)))
            .cloned()
    }

    fn band_count(&self) -> usize {
        self.spec.bands.len()
    }

    fn band(&self, band: usize) -> Option<&dyn SourceBand> {
        self.spec
            .bands
            .get(band.checked_sub(1)?)
            .map(|band| band as &dyn SourceBand)
    }

    fn internal_handle(&self, _request: Option<&str>) -> Option<*mut c_void> {
        Some(self as *const MemorySource as *mut c_void)
    }
}

impl Drop for MemorySource {
    fn drop(&mut self) {
        // Cascaded proxies go first, while the pool still considers
        // this close in progress.
        self.retained.clear();
        self.events.lock().push(PoolEvent::Closed {
            path: self.path.clone(),
            rid: rid::current(),
        });
    }
}

type OpenHook = Arc<dyn Fn(&mut MemorySource) + Send + Sync>;

/// Test driver registry: opens [`MemorySource`]s from registered specs,
/// records events, and optionally fails or hooks specific paths.
#[derive(Default)]
pub struct MemoryOpener {
    specs: Mutex<HashMap<String, SourceSpec>>,
    failing: Mutex<HashSet<String>>,
    open_hooks: Mutex<HashMap<String, OpenHook>>,
    options_seen: Mutex<HashMap<String, Vec<String>>>,
    events: EventLog,
}

impl MemoryOpener {
    pub fn new() -> Arc<MemoryOpener> {
        Arc::new(MemoryOpener::default())
    }

    pub fn add_source(&self, path: &str, spec: SourceSpec) {
        self.specs.lock().insert(path.to_owned(), spec);
    }

    /// Make every subsequent open of `path` fail.
    pub fn fail_path(&self, path: &str) {
        self.failing.lock().insert(path.to_owned());
    }

    /// Run `hook` on each freshly opened source for `path`, while the
    /// pool still considers the open in progress.
    pub fn set_open_hook<F>(&self, path: &str, hook: F)
    where
        F: Fn(&mut MemorySource) + Send + Sync + 'static,
    {
        self.open_hooks.lock().insert(path.to_owned(), Arc::new(hook));
    }

    pub fn events(&self) -> Vec<PoolEvent> {
        self.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    pub fn opens_of(&self, path: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, PoolEvent::Opened { path: p, .. } if p == path))
            .count()
    }

    pub fn closes_of(&self, path: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, PoolEvent::Closed { path: p, .. } if p == path))
            .count()
    }

    /// Open options observed on the most recent open of `path`.
    pub fn options_seen(&self, path: &str) -> Option<Vec<String>> {
        self.options_seen.lock().get(path).cloned()
    }
}

impl SourceOpener for MemoryOpener {
    fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        open_options: &[String],
    ) -> Result<Box<dyn Source>> {
        self.options_seen
            .lock()
            .insert(path.to_owned(), open_options.to_vec());
        if self.failing.lock().contains(path) {
            bail!("configured open failure for {path}");
        }
        let spec = self
            .specs
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("no such source: {path}"))?;
        self.events.lock().push(PoolEvent::Opened {
            path: path.to_owned(),
            rid: rid::current(),
        });
        let mut source = MemorySource {
            path: path.to_owned(),
            access: if flags.update {
                AccessMode::Update
            } else {
                AccessMode::Read
            },
            spec,
            events: self.events.clone(),
            retained: Vec::new(),
        };
        // Taken out of the map first: the hook may re-enter the pool
        // and open another source through this opener.
        let hook = self.open_hooks.lock().get(path).cloned();
        if let Some(hook) = hook {
            hook(&mut source);
        }
        Ok(Box::new(source))
    }
}
