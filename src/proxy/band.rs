// src/proxy/band.rs
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{anyhow, Result};
use parking_lot::Mutex;

use crate::source::{ColorTable, RasterDataType, SourceBand};

use super::ProxyDataset;

/// How a proxy band reaches its underlying band.
enum BandKind {
    /// A described band of the proxy dataset, resolved by number.
    Main {
        dataset: Weak<ProxyDataset>,
        band: usize,
    },
    /// Overview `level` of a main band, resolved through that band.
    Overview {
        main: Weak<ProxyBand>,
        level: usize,
    },
    /// Mask of a main band, resolved through that band.
    Mask { main: Weak<ProxyBand> },
}

#[derive(Default)]
struct BandMemo {
    unit_type: Option<Option<String>>,
    category_names: Option<Option<Vec<String>>>,
    color_table: Option<Option<ColorTable>>,
    metadata: HashMap<Option<String>, Option<Vec<String>>>,
    metadata_items: HashMap<(String, Option<String>), Option<String>>,
}

#[derive(Default)]
struct BandChildren {
    overviews: Vec<Option<Arc<ProxyBand>>>,
    mask: Option<Arc<ProxyBand>>,
}

/// Facade over one band of a pooled source. Main bands delegate through
/// their owning [`ProxyDataset`]; overview and mask bands delegate
/// through their main band and descend from its underlying band, so a
/// single pool reference covers the whole chain.
pub struct ProxyBand {
    self_weak: Weak<ProxyBand>,
    kind: BandKind,
    number: usize,
    data_type: RasterDataType,
    raster_size: (usize, usize),
    block_size: (usize, usize),
    memo: Mutex<BandMemo>,
    children: Mutex<BandChildren>,
    /// Outstanding references taken on the main band's underlying
    /// dataset on behalf of this overview/mask band. Must be zero
    /// whenever no delegated call is in flight.
    main_refs: AtomicI32,
}

impl ProxyBand {
    pub(super) fn new_main(
        dataset: Weak<ProxyDataset>,
        number: usize,
        data_type: RasterDataType,
        raster_size: (usize, usize),
        block_size: (usize, usize),
    ) -> Arc<ProxyBand> {
        Self::new(
            BandKind::Main { dataset, band: number },
            number,
            data_type,
            raster_size,
            block_size,
        )
    }

    fn new(
        kind: BandKind,
        number: usize,
        data_type: RasterDataType,
        raster_size: (usize, usize),
        block_size: (usize, usize),
    ) -> Arc<ProxyBand> {
        Arc::new_cyclic(|self_weak| ProxyBand {
            self_weak: self_weak.clone(),
            kind,
            number,
            data_type,
            raster_size,
            block_size,
            memo: Mutex::new(BandMemo::default()),
            children: Mutex::new(BandChildren::default()),
            main_refs: AtomicI32::new(0),
        })
    }

    pub fn band_number(&self) -> usize {
        self.number
    }

    pub fn data_type(&self) -> RasterDataType {
        self.data_type
    }

    pub fn band_size(&self) -> (usize, usize) {
        self.raster_size
    }

    pub fn block_size(&self) -> (usize, usize) {
        self.block_size
    }

    /// Run `f` against the underlying band while a pool reference is
    /// held. Returns `None` when the source cannot be opened or the
    /// band does not exist; the reference is released either way.
    fn with_underlying<R>(&self, f: impl FnOnce(&dyn SourceBand) -> R) -> Option<R> {
        let mut f = Some(f);
        let mut out = None;
        self.with_underlying_dyn(&mut |band| {
            if let Some(f) = f.take() {
                out = Some(f(band));
            }
        });
        out
    }

    // Dispatch is dynamic so the overview/mask delegation can recurse
    // without monomorphizing a closure per nesting level.
    fn with_underlying_dyn(&self, f: &mut dyn FnMut(&dyn SourceBand)) {
        match &self.kind {
            BandKind::Main { dataset, band } => {
                let Some(dataset) = dataset.upgrade() else {
                    return;
                };
                let Some(source_ref) = dataset.ref_underlying() else {
                    return;
                };
                let source = source_ref.lock();
                if let Some(band) = source.band(*band) {
                    f(band);
                }
            }
            BandKind::Overview { main, level } => {
                let Some(main) = main.upgrade() else {
                    return;
                };
                let level = *level;
                self.main_refs.fetch_add(1, Ordering::Relaxed);
                main.with_underlying_dyn(&mut |underlying| {
                    if let Some(overview) = underlying.overview(level) {
                        f(overview);
                    }
                });
                self.main_refs.fetch_sub(1, Ordering::Relaxed);
            }
            BandKind::Mask { main } => {
                let Some(main) = main.upgrade() else {
                    return;
                };
                self.main_refs.fetch_add(1, Ordering::Relaxed);
                main.with_underlying_dyn(&mut |underlying| {
                    if let Some(mask) = underlying.mask_band() {
                        f(mask);
                    }
                });
                self.main_refs.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    pub fn metadata(&self, domain: Option<&str>) -> Option<Vec<String>> {
        let key = domain.map(str::to_owned);
        if let Some(stashed) = self.memo.lock().metadata.get(&key) {
            return stashed.clone();
        }
        let fetched = self.with_underlying(|band| band.metadata(domain))?;
        self.memo.lock().metadata.insert(key, fetched.clone());
        fetched
    }

    pub fn metadata_item(&self, name: &str, domain: Option<&str>) -> Option<String> {
        let key = (name.to_owned(), domain.map(str::to_owned));
        if let Some(stashed) = self.memo.lock().metadata_items.get(&key) {
            return stashed.clone();
        }
        let fetched = self.with_underlying(|band| band.metadata_item(name, domain))?;
        self.memo.lock().metadata_items.insert(key, fetched.clone());
        fetched
    }

    pub fn unit_type(&self) -> Option<String> {
        if let Some(stashed) = self.memo.lock().unit_type.clone() {
            return stashed;
        }
        let fetched = self.with_underlying(|band| band.unit_type())?;
        self.memo.lock().unit_type = Some(fetched.clone());
        fetched
    }

    pub fn category_names(&self) -> Option<Vec<String>> {
        if let Some(stashed) = self.memo.lock().category_names.clone() {
            return stashed;
        }
        let fetched = self.with_underlying(|band| band.category_names())?;
        self.memo.lock().category_names = Some(fetched.clone());
        fetched
    }

    /// The underlying band's color table, cloned into the proxy.
    pub fn color_table(&self) -> Option<ColorTable> {
        if let Some(stashed) = self.memo.lock().color_table.clone() {
            return stashed;
        }
        let fetched = self.with_underlying(|band| band.color_table())?;
        self.memo.lock().color_table = Some(fetched.clone());
        fetched
    }

    pub fn overview_count(&self) -> Option<usize> {
        self.with_underlying(|band| band.overview_count())
    }

    /// Proxy for overview `level`, built lazily from the underlying
    /// band's shape on first success and cached afterwards.
    pub fn overview(&self, level: usize) -> Option<Arc<ProxyBand>> {
        if let Some(existing) = self
            .children
            .lock()
            .overviews
            .get(level)
            .and_then(|slot| slot.clone())
        {
            return Some(existing);
        }

        let shape = self.with_underlying(|band| {
            band.overview(level)
                .map(|overview| (overview.data_type(), overview.band_size(), overview.block_size()))
        })??;

        let proxy = Self::new(
            BandKind::Overview {
                main: self.self_weak.clone(),
                level,
            },
            self.number,
            shape.0,
            shape.1,
            shape.2,
        );

        let mut children = self.children.lock();
        if children.overviews.len() <= level {
            children.overviews.resize(level + 1, None);
        }
        let slot = &mut children.overviews[level];
        if slot.is_none() {
            *slot = Some(proxy);
        }
        slot.clone()
    }

    /// Proxy for the band's mask, built lazily like [`Self::overview`].
    pub fn mask_band(&self) -> Option<Arc<ProxyBand>> {
        if let Some(existing) = self.children.lock().mask.clone() {
            return Some(existing);
        }

        let shape = self.with_underlying(|band| {
            band.mask_band()
                .map(|mask| (mask.data_type(), mask.band_size(), mask.block_size()))
        })??;

        let proxy = Self::new(
            BandKind::Mask {
                main: self.self_weak.clone(),
            },
            1,
            shape.0,
            shape.1,
            shape.2,
        );

        let mut children = self.children.lock();
        if children.mask.is_none() {
            children.mask = Some(proxy);
        }
        children.mask.clone()
    }

    /// Pre-seed the mask proxy from a description instead of opening
    /// the source to discover its shape.
    pub fn add_src_mask_band_description(
        &self,
        data_type: RasterDataType,
        block_size: (usize, usize),
    ) -> Arc<ProxyBand> {
        let mut children = self.children.lock();
        debug_assert!(children.mask.is_none(), "mask band already described");
        let proxy = Self::new(
            BandKind::Mask {
                main: self.self_weak.clone(),
            },
            1,
            data_type,
            self.raster_size,
            block_size,
        );
        children.mask = Some(proxy.clone());
        proxy
    }

    /// Read a window of samples through the pooled source.
    pub fn read_region(&self, offset: (isize, isize), size: (usize, usize)) -> Result<Vec<f32>> {
        self.with_underlying(|band| band.read_region(offset, size))
            .ok_or_else(|| anyhow!("cannot open underlying source for band {}", self.number))?
    }
}

impl Drop for ProxyBand {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.main_refs.load(Ordering::Relaxed),
            0,
            "proxy band dropped with a delegated reference in flight"
        );
    }
}
