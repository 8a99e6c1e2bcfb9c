// src/proxy/mod.rs
//
// Lightweight stand-ins for expensive-to-open raster sources. A proxy
// carries enough identity to answer spatial-reference queries without
// touching the underlying file, and borrows a pooled handle for
// everything else.

mod band;

pub use band::ProxyBand;

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::{Arc, OnceLock, Weak};

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::pool::{self, SourceRef};
use crate::rid::{self, Rid};
use crate::source::{AccessMode, GeoTransform, GroundControlPoint, RasterDataType};

/// Facade over a pooled source.
///
/// Construction takes a top-level pool reference; destruction releases
/// it and, unless the proxy is `shared`, closes the cached entry for
/// its path. Every operation references the underlying source afresh
/// through the pool, so the handle may be closed and reopened between
/// any two calls.
pub struct ProxyDataset {
    self_weak: Weak<ProxyDataset>,
    description: String,
    raster_size: (usize, usize),
    access: AccessMode,
    shared: bool,
    creator_rid: Rid,
    open_options: OnceLock<Vec<String>>,
    /// Pre-seeded spatial reference; served without opening the source
    /// until a write clears it.
    src_projection: Mutex<Option<String>>,
    src_geo_transform: Mutex<Option<GeoTransform>>,
    metadata_memo: Mutex<HashMap<Option<String>, Option<Vec<String>>>>,
    metadata_item_memo: Mutex<HashMap<(String, Option<String>), Option<String>>>,
    bands: Mutex<Vec<Arc<ProxyBand>>>,
}

impl ProxyDataset {
    /// Create a proxy for the source at `description`.
    ///
    /// `projection` and `geo_transform` pre-seed the overlays so the
    /// composite layer can answer georeferencing queries without an
    /// open. A `shared` proxy leaves its cached entry behind on drop
    /// for other proxies of the same path.
    pub fn create(
        description: &str,
        raster_x_size: usize,
        raster_y_size: usize,
        access: AccessMode,
        shared: bool,
        projection: Option<&str>,
        geo_transform: Option<GeoTransform>,
    ) -> Arc<ProxyDataset> {
        pool::ref_pool();
        Arc::new_cyclic(|self_weak| ProxyDataset {
            self_weak: self_weak.clone(),
            description: description.to_string(),
            raster_size: (raster_x_size, raster_y_size),
            access,
            shared,
            creator_rid: rid::current(),
            open_options: OnceLock::new(),
            src_projection: Mutex::new(projection.map(str::to_owned)),
            src_geo_transform: Mutex::new(geo_transform),
            metadata_memo: Mutex::new(HashMap::new()),
            metadata_item_memo: Mutex::new(HashMap::new()),
            bands: Mutex::new(Vec::new()),
        })
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn raster_size(&self) -> (usize, usize) {
        self.raster_size
    }

    pub fn access(&self) -> AccessMode {
        self.access
    }

    pub fn shared(&self) -> bool {
        self.shared
    }

    pub fn creator_rid(&self) -> Rid {
        self.creator_rid
    }

    /// Options forwarded to the opener. May be set at most once, before
    /// the first operation that opens the source.
    pub fn set_open_options(&self, options: Vec<String>) {
        let already_set = self.open_options.set(options).is_err();
        debug_assert!(!already_set, "open options may only be set once");
    }

    /// Reference the underlying source through the pool, opening it if
    /// needed. Opens are attributed to the creating thread's identity
    /// so that auxiliary shared opens are closed by the right owner,
    /// no matter which thread triggers them.
    pub fn ref_underlying(&self) -> Option<SourceRef> {
        let _rid = rid::impersonate(self.creator_rid);
        let options = self.open_options.get().map(Vec::as_slice).unwrap_or(&[]);
        match pool::ref_dataset(&self.description, self.access, options, self.shared) {
            Ok(source_ref) => Some(source_ref),
            Err(err) => {
                debug!(path = %self.description, error = %err, "cannot reference underlying source");
                None
            }
        }
    }

    pub fn projection(&self) -> Option<String> {
        if let Some(overlay) = self.src_projection.lock().clone() {
            return Some(overlay);
        }
        let source_ref = self.ref_underlying()?;
        let projection = source_ref.lock().projection();
        projection
    }

    /// Clears the overlay and writes through to the underlying source.
    pub fn set_projection(&self, projection: &str) -> Result<()> {
        *self.src_projection.lock() = None;
        let source_ref = self
            .ref_underlying()
            .ok_or_else(|| anyhow!("cannot open underlying source {}", self.description))?;
        let result = source_ref.lock().set_projection(projection);
        result
    }

    pub fn geo_transform(&self) -> Option<GeoTransform> {
        if let Some(overlay) = *self.src_geo_transform.lock() {
            return Some(overlay);
        }
        let source_ref = self.ref_underlying()?;
        let transform = source_ref.lock().geo_transform();
        transform
    }

    pub fn set_geo_transform(&self, transform: &GeoTransform) -> Result<()> {
        *self.src_geo_transform.lock() = None;
        let source_ref = self
            .ref_underlying()
            .ok_or_else(|| anyhow!("cannot open underlying source {}", self.description))?;
        let result = source_ref.lock().set_geo_transform(transform);
        result
    }

    /// Metadata for a domain. The first successful lookup per domain is
    /// stashed for the proxy's lifetime; later calls are served from
    /// the stash without touching the pool.
    pub fn metadata(&self, domain: Option<&str>) -> Option<Vec<String>> {
        let key = domain.map(str::to_owned);
        if let Some(stashed) = self.metadata_memo.lock().get(&key) {
            return stashed.clone();
        }
        let source_ref = self.ref_underlying()?;
        let fetched = source_ref.lock().metadata(domain);
        drop(source_ref);
        self.metadata_memo.lock().insert(key, fetched.clone());
        fetched
    }

    pub fn metadata_item(&self, name: &str, domain: Option<&str>) -> Option<String> {
        let key = (name.to_owned(), domain.map(str::to_owned));
        if let Some(stashed) = self.metadata_item_memo.lock().get(&key) {
            return stashed.clone();
        }
        let source_ref = self.ref_underlying()?;
        let fetched = source_ref.lock().metadata_item(name, domain);
        drop(source_ref);
        self.metadata_item_memo.lock().insert(key, fetched.clone());
        fetched
    }

    /// Unlike metadata, GCP accessors are refreshed from the underlying
    /// source on every call; the caller gets its own deep copy.
    pub fn gcp_projection(&self) -> Option<String> {
        let source_ref = self.ref_underlying()?;
        let fetched = source_ref.lock().gcp_projection();
        fetched
    }

    pub fn gcps(&self) -> Option<Vec<GroundControlPoint>> {
        let source_ref = self.ref_underlying()?;
        let fetched = source_ref.lock().gcps().to_vec();
        Some(fetched)
    }

    pub fn gcp_count(&self) -> Option<usize> {
        let source_ref = self.ref_underlying()?;
        let count = source_ref.lock().gcps().len();
        Some(count)
    }

    /// Driver-internal handle of the underlying source. The handle dies
    /// whenever the pool closes the source, so this is only usable for
    /// debugging.
    pub fn internal_handle(&self, request: Option<&str>) -> Option<*mut c_void> {
        warn!(
            path = %self.description,
            "internal_handle() cannot be used safely on a proxy dataset: \
             the returned handle may be invalidated at any time"
        );
        let source_ref = self.ref_underlying()?;
        let handle = source_ref.lock().internal_handle(request);
        handle
    }

    /// Describe one more source band. Bands are numbered from 1 in the
    /// order they are added and are never removed.
    pub fn add_src_band_description(
        &self,
        data_type: RasterDataType,
        block_size: (usize, usize),
    ) -> Arc<ProxyBand> {
        let mut bands = self.bands.lock();
        let number = bands.len() + 1;
        let band = ProxyBand::new_main(
            self.self_weak.clone(),
            number,
            data_type,
            self.raster_size,
            block_size,
        );
        bands.push(band.clone());
        band
    }

    pub fn band_count(&self) -> usize {
        self.bands.lock().len()
    }

    /// Band by 1-based number.
    pub fn band(&self, band: usize) -> Option<Arc<ProxyBand>> {
        self.bands.lock().get(band.checked_sub(1)?).cloned()
    }
}

impl Drop for ProxyDataset {
    fn drop(&mut self) {
        if !self.shared {
            pool::close_dataset(&self.description, self.access);
        }
        pool::unref_pool();
    }
}
