//! Figure region detector.
//!
//! Per page, three strategies propose regions in order, sharing one
//! deduplication set keyed by the integer-rounded bounding box:
//!
//! 1. clusters of vector-drawing primitives ([`vector_regions`]);
//! 2. embedded image blocks;
//! 3. raw embedded raster images.
//!
//! Accepted regions are rendered, downscaled and numbered densely across the
//! document. Descriptions are not produced here: the orchestrator describes
//! the returned [`FigureCandidate`]s in a separate, concurrent phase.

use crate::config::FigureConfig;
use crate::error::DocrError;
use crate::output::BoundingBox;
use crate::pipeline::cluster::cluster_boxes;
use crate::pipeline::encode::fit_within;
use image::DynamicImage;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Minimum region area in square page units.
pub const MIN_REGION_AREA: f32 = 80.0 * 80.0;
/// Minimum width and height of a vector cluster.
pub const MIN_REGION_SIDE: f32 = 50.0;
/// Proximity threshold for drawing clustering.
pub const CLUSTER_GAP: f32 = 30.0;
/// Padding added around vector clusters before rendering.
pub const CLIP_PADDING: f32 = 10.0;
/// Raster images smaller than this many encoded bytes are decorations.
pub const MIN_ENCODED_BYTES: usize = 5000;
const MAX_ASPECT: f32 = 8.0;
const MIN_ASPECT: f32 = 0.125;
/// Clusters this dense survive the header/footer margin rule.
const DENSE_CLUSTER_MEMBERS: usize = 20;
const HEADER_FOOTER_MARGIN: f32 = 0.1;
/// Landscape pages with at least this many drawings and no qualifying
/// cluster are treated as one slide-sized figure.
const SLIDE_FALLBACK_MIN_DRAWINGS: usize = 10;

/// Orientation-dependent thresholds for vector clustering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorThresholds {
    pub min_drawings: usize,
    pub min_area_ratio: f32,
    pub max_area_ratio: f32,
}

impl VectorThresholds {
    pub fn for_page(landscape: bool) -> Self {
        if landscape {
            Self {
                min_drawings: 3,
                min_area_ratio: 0.025,
                max_area_ratio: 0.98,
            }
        } else {
            Self {
                min_drawings: 5,
                min_area_ratio: 0.05,
                max_area_ratio: 0.85,
            }
        }
    }
}

/// Reference to an embedded raster image on a page.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterImageRef {
    /// Position among the page's image objects.
    pub index: usize,
    /// Pixel dimensions of the stored image.
    pub width: u32,
    pub height: u32,
    /// False for stencil masks and images whose colour data cannot be decoded.
    pub has_color_space: bool,
    pub encoded_len: usize,
    /// Placement on the page, when known.
    pub bbox: Option<BoundingBox>,
}

/// Page-geometry collaborator for stage 4.
///
/// Coordinates are page units (points) with a top-left origin. Calls may
/// block; the orchestrator runs detection on the blocking pool.
pub trait PageGeometry: Send + Sync {
    /// Page `(width, height)`, `None` if the page does not exist.
    fn page_size(&self, page: usize) -> Option<(f32, f32)>;

    fn drawing_boxes(&self, page: usize) -> Vec<BoundingBox>;

    fn image_blocks(&self, page: usize) -> Vec<BoundingBox>;

    fn raster_images(&self, page: usize) -> Vec<RasterImageRef>;

    /// Render `clip` of `page` at `dpi`.
    fn render_clip(&self, page: usize, clip: &BoundingBox, dpi: u32)
        -> Result<DynamicImage, DocrError>;

    /// Decode an embedded raster image.
    fn load_raster(&self, page: usize, image: &RasterImageRef) -> Result<DynamicImage, DocrError>;
}

/// A vector region accepted for rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRegion {
    /// Region identity for deduplication.
    pub bbox: BoundingBox,
    /// Area to render, padded and clamped to the page.
    pub clip: BoundingBox,
    pub members: usize,
    /// Whole-slide region from the landscape fallback.
    pub slide_fallback: bool,
}

/// Cluster drawings and keep the clusters that look like figures.
///
/// Returns regions in top-to-bottom, left-to-right order. A landscape page
/// with many drawings but no qualifying cluster yields one region covering
/// the page interior.
pub fn vector_regions(drawings: &[BoundingBox], page_w: f32, page_h: f32) -> Vec<VectorRegion> {
    let landscape = page_w > page_h;
    let t = VectorThresholds::for_page(landscape);
    if drawings.len() < t.min_drawings {
        return Vec::new();
    }
    let page_area = page_w * page_h;

    let regions: Vec<VectorRegion> = cluster_boxes(drawings, CLUSTER_GAP)
        .into_iter()
        .filter(|c| {
            let b = &c.bbox;
            let area = b.area();
            let ratio = area / page_area;
            if area < MIN_REGION_AREA || b.width() < MIN_REGION_SIDE || b.height() < MIN_REGION_SIDE
            {
                return false;
            }
            if ratio < t.min_area_ratio || ratio > t.max_area_ratio {
                return false;
            }
            if c.members < t.min_drawings {
                return false;
            }
            if !landscape {
                let cy = b.center_y();
                let in_margin = cy < page_h * HEADER_FOOTER_MARGIN
                    || cy > page_h * (1.0 - HEADER_FOOTER_MARGIN);
                if in_margin && c.members < DENSE_CLUSTER_MEMBERS {
                    return false;
                }
            }
            true
        })
        .map(|c| VectorRegion {
            clip: BoundingBox::new(
                (c.bbox.x0 - CLIP_PADDING).max(0.0),
                (c.bbox.y0 - CLIP_PADDING).max(0.0),
                (c.bbox.x1 + CLIP_PADDING).min(page_w),
                (c.bbox.y1 + CLIP_PADDING).min(page_h),
            ),
            bbox: c.bbox,
            members: c.members,
            slide_fallback: false,
        })
        .collect();

    if regions.is_empty() && landscape && drawings.len() >= SLIDE_FALLBACK_MIN_DRAWINGS {
        let interior = BoundingBox::new(
            page_w * 0.05,
            page_h * 0.15,
            page_w * 0.95,
            page_h * 0.90,
        );
        return vec![VectorRegion {
            bbox: interior,
            clip: interior,
            members: drawings.len(),
            slide_fallback: true,
        }];
    }
    regions
}

/// Area and aspect-ratio filter shared by image blocks and raster images.
pub fn plausible_image(width: f32, height: f32) -> bool {
    let aspect = width / height.max(1.0);
    width * height >= MIN_REGION_AREA && (MIN_ASPECT..=MAX_ASPECT).contains(&aspect)
}

/// Which strategy found a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    VectorCluster,
    SlideFallback,
    ImageBlock,
    RasterImage,
}

/// A detected, rendered figure waiting for description.
#[derive(Debug, Clone)]
pub struct FigureCandidate {
    pub figure_num: usize,
    pub page_num: usize,
    pub image: DynamicImage,
    pub bbox: Option<BoundingBox>,
    pub context: String,
    pub image_path: Option<String>,
    pub strategy: Strategy,
}

/// Per-page input to detection: page index and its extracted text.
#[derive(Debug, Clone)]
pub struct PageContext {
    pub page_num: usize,
    pub text: String,
}

/// Runs the three strategies over a document under the configured caps.
#[derive(Debug, Clone)]
pub struct FigureDetector {
    config: FigureConfig,
}

struct PageRun<'a> {
    page_num: usize,
    context: &'a str,
    seen: HashSet<(i32, i32, i32, i32)>,
    accepted: usize,
}

impl FigureDetector {
    pub fn new(config: FigureConfig) -> Self {
        Self { config }
    }

    fn save_dir(&self) -> Option<&PathBuf> {
        self.config.save_dir.as_ref()
    }

    fn document_full(&self, next_num: usize) -> bool {
        next_num > self.config.max_total
    }

    fn caps_hit(&self, next_num: usize, run: &PageRun<'_>) -> bool {
        self.document_full(next_num) || run.accepted >= self.config.max_per_page
    }

    /// Detect and render figures across `pages`, in page order.
    pub fn extract(&self, geometry: &dyn PageGeometry, pages: &[PageContext]) -> Vec<FigureCandidate> {
        if let Some(dir) = self.save_dir() {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!("Cannot create figure directory {}: {}", dir.display(), e);
            }
        }

        let mut out = Vec::new();
        let mut next_num = 1;
        for page in pages {
            if self.document_full(next_num) {
                break;
            }
            let Some((w, h)) = geometry.page_size(page.page_num) else {
                debug!("Page {}: no geometry", page.page_num);
                continue;
            };
            let context: &str = match page.text.char_indices().nth(self.config.context_max_chars) {
                Some((i, _)) => &page.text[..i],
                None => &page.text,
            };
            let mut run = PageRun {
                page_num: page.page_num,
                context,
                seen: HashSet::new(),
                accepted: 0,
            };

            self.vector_strategy(geometry, w, h, &mut run, &mut next_num, &mut out);
            self.image_block_strategy(geometry, &mut run, &mut next_num, &mut out);
            self.raster_strategy(geometry, &mut run, &mut next_num, &mut out);

            if run.accepted > 0 {
                debug!("Page {}: {} figure(s)", page.page_num, run.accepted);
            }
        }
        out
    }

    fn vector_strategy(
        &self,
        geometry: &dyn PageGeometry,
        w: f32,
        h: f32,
        run: &mut PageRun<'_>,
        next_num: &mut usize,
        out: &mut Vec<FigureCandidate>,
    ) {
        let drawings = geometry.drawing_boxes(run.page_num);
        for region in vector_regions(&drawings, w, h) {
            if self.caps_hit(*next_num, run) {
                break;
            }
            if !run.seen.insert(region.bbox.region_key()) {
                continue;
            }
            let strategy = if region.slide_fallback {
                Strategy::SlideFallback
            } else {
                Strategy::VectorCluster
            };
            match geometry.render_clip(run.page_num, &region.clip, self.config.render_dpi) {
                Ok(img) => self.accept(img, Some(region.bbox), strategy, run, next_num, out),
                Err(e) => warn!("Page {}: vector figure render failed: {}", run.page_num, e),
            }
        }
    }

    fn image_block_strategy(
        &self,
        geometry: &dyn PageGeometry,
        run: &mut PageRun<'_>,
        next_num: &mut usize,
        out: &mut Vec<FigureCandidate>,
    ) {
        for bbox in geometry.image_blocks(run.page_num) {
            if self.caps_hit(*next_num, run) {
                break;
            }
            if !plausible_image(bbox.width(), bbox.height()) {
                continue;
            }
            if !run.seen.insert(bbox.region_key()) {
                continue;
            }
            match geometry.render_clip(run.page_num, &bbox, self.config.render_dpi) {
                Ok(img) => self.accept(img, Some(bbox), Strategy::ImageBlock, run, next_num, out),
                Err(e) => debug!("Page {}: image block render failed: {}", run.page_num, e),
            }
        }
    }

    fn raster_strategy(
        &self,
        geometry: &dyn PageGeometry,
        run: &mut PageRun<'_>,
        next_num: &mut usize,
        out: &mut Vec<FigureCandidate>,
    ) {
        for raster in geometry.raster_images(run.page_num) {
            if self.caps_hit(*next_num, run) {
                break;
            }
            if !plausible_image(raster.width as f32, raster.height as f32) {
                continue;
            }
            if raster.encoded_len < MIN_ENCODED_BYTES || !raster.has_color_space {
                continue;
            }
            if let Some(b) = &raster.bbox {
                if !run.seen.insert(b.region_key()) {
                    continue;
                }
            }
            match geometry.load_raster(run.page_num, &raster) {
                Ok(img) => {
                    self.accept(img, raster.bbox, Strategy::RasterImage, run, next_num, out)
                }
                Err(e) => debug!("Page {}: raster image decode failed: {}", run.page_num, e),
            }
        }
    }

    fn accept(
        &self,
        image: DynamicImage,
        bbox: Option<BoundingBox>,
        strategy: Strategy,
        run: &mut PageRun<'_>,
        next_num: &mut usize,
        out: &mut Vec<FigureCandidate>,
    ) {
        let image = DynamicImage::ImageRgb8(fit_within(image, self.config.max_dimension).to_rgb8());
        let figure_num = *next_num;

        let image_path = self.save_dir().and_then(|dir| {
            let path = dir.join(format!("figure_{}_page{}.png", figure_num, run.page_num));
            match image.save(&path) {
                Ok(()) => Some(path.to_string_lossy().into_owned()),
                Err(e) => {
                    warn!("Cannot save {}: {}", path.display(), e);
                    None
                }
            }
        });

        out.push(FigureCandidate {
            figure_num,
            page_num: run.page_num,
            image,
            bbox,
            context: run.context.to_string(),
            image_path,
            strategy,
        });
        *next_num += 1;
        run.accepted += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn bb(x0: f32, y0: f32, x1: f32, y1: f32) -> BoundingBox {
        BoundingBox::new(x0, y0, x1, y1)
    }

    /// Eight overlapping strips covering ~40% of a US-letter page.
    fn body_figure() -> Vec<BoundingBox> {
        (0..8)
            .map(|i| {
                let x0 = 86.0 + i as f32 * 55.0;
                bb(x0, 176.0, x0 + 60.0, 616.0)
            })
            .collect()
    }

    #[derive(Default)]
    struct StubGeometry {
        sizes: HashMap<usize, (f32, f32)>,
        drawings: HashMap<usize, Vec<BoundingBox>>,
        blocks: HashMap<usize, Vec<BoundingBox>>,
        rasters: HashMap<usize, Vec<RasterImageRef>>,
    }

    impl PageGeometry for StubGeometry {
        fn page_size(&self, page: usize) -> Option<(f32, f32)> {
            self.sizes.get(&page).copied()
        }
        fn drawing_boxes(&self, page: usize) -> Vec<BoundingBox> {
            self.drawings.get(&page).cloned().unwrap_or_default()
        }
        fn image_blocks(&self, page: usize) -> Vec<BoundingBox> {
            self.blocks.get(&page).cloned().unwrap_or_default()
        }
        fn raster_images(&self, page: usize) -> Vec<RasterImageRef> {
            self.rasters.get(&page).cloned().unwrap_or_default()
        }
        fn render_clip(
            &self,
            _page: usize,
            clip: &BoundingBox,
            dpi: u32,
        ) -> Result<DynamicImage, DocrError> {
            let scale = dpi as f32 / 72.0;
            Ok(DynamicImage::new_rgb8(
                (clip.width() * scale).max(1.0) as u32,
                (clip.height() * scale).max(1.0) as u32,
            ))
        }
        fn load_raster(&self, _page: usize, r: &RasterImageRef) -> Result<DynamicImage, DocrError> {
            Ok(DynamicImage::new_rgb8(r.width, r.height))
        }
    }

    fn letter(geometry: &mut StubGeometry, page: usize) {
        geometry.sizes.insert(page, (612.0, 792.0));
    }

    fn pages(n: usize) -> Vec<PageContext> {
        (1..=n)
            .map(|page_num| PageContext {
                page_num,
                text: format!("text of page {page_num}"),
            })
            .collect()
    }

    #[test]
    fn forty_percent_cluster_is_one_candidate() {
        let regions = vector_regions(&body_figure(), 612.0, 792.0);
        assert_eq!(regions.len(), 1);
        let ratio = regions[0].bbox.area() / (612.0 * 792.0);
        assert!((0.35..0.45).contains(&ratio), "ratio {ratio}");
        assert_eq!(regions[0].members, 8);
    }

    #[test]
    fn header_decoration_is_rejected() {
        let mut drawings = body_figure();
        drawings.push(bb(50.0, 10.0, 260.0, 70.0));
        drawings.push(bb(250.0, 10.0, 500.0, 70.0));
        let regions = vector_regions(&drawings, 612.0, 792.0);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].members, 8);
    }

    #[test]
    fn too_few_drawings_skips_page() {
        let drawings: Vec<_> = body_figure().into_iter().take(4).collect();
        assert!(vector_regions(&drawings, 612.0, 792.0).is_empty());
    }

    #[test]
    fn near_full_page_cluster_rejected_on_portrait() {
        let drawings: Vec<_> = (0..6)
            .map(|i| bb(i as f32 * 100.0, 0.0, i as f32 * 100.0 + 110.0, 792.0))
            .collect();
        assert!(vector_regions(&drawings, 612.0, 792.0).is_empty());
    }

    #[test]
    fn landscape_slide_fallback() {
        // Twelve small scattered marks: no cluster is large enough.
        let drawings: Vec<_> = (0..12)
            .map(|i| {
                let x = 20.0 + (i % 4) as f32 * 200.0;
                let y = 20.0 + (i / 4) as f32 * 180.0;
                bb(x, y, x + 10.0, y + 10.0)
            })
            .collect();
        let regions = vector_regions(&drawings, 792.0, 612.0);
        assert_eq!(regions.len(), 1);
        let r = &regions[0];
        assert!(r.slide_fallback);
        assert!((r.clip.x0 - 39.6).abs() < 0.01);
        assert!((r.clip.y0 - 91.8).abs() < 0.01);
        assert!((r.clip.y1 - 550.8).abs() < 0.01);
    }

    #[test]
    fn clip_is_padded_and_clamped() {
        let drawings: Vec<_> = (0..5)
            .map(|i| bb(0.0, 200.0 + i as f32 * 40.0, 300.0, 250.0 + i as f32 * 40.0))
            .collect();
        let regions = vector_regions(&drawings, 612.0, 792.0);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].clip.x0, 0.0);
        assert_eq!(regions[0].clip.y0, 190.0);
        assert_eq!(regions[0].clip.x1, 310.0);
    }

    #[test]
    fn aspect_filter() {
        assert!(plausible_image(200.0, 150.0));
        assert!(!plausible_image(900.0, 100.0));
        assert!(!plausible_image(60.0, 60.0));
    }

    #[test]
    fn dedup_across_strategies_and_numbering() {
        let mut g = StubGeometry::default();
        letter(&mut g, 1);
        letter(&mut g, 2);
        g.drawings.insert(1, body_figure());
        let figure_bbox = vector_regions(&body_figure(), 612.0, 792.0)[0].bbox;
        // The same region reported as an image block is skipped.
        g.blocks.insert(1, vec![figure_bbox, bb(100.0, 650.0, 300.0, 780.0)]);
        g.rasters.insert(
            2,
            vec![
                RasterImageRef {
                    index: 0,
                    width: 400,
                    height: 300,
                    has_color_space: true,
                    encoded_len: 20_000,
                    bbox: None,
                },
                RasterImageRef {
                    index: 1,
                    width: 400,
                    height: 300,
                    has_color_space: false,
                    encoded_len: 20_000,
                    bbox: None,
                },
                RasterImageRef {
                    index: 2,
                    width: 400,
                    height: 300,
                    has_color_space: true,
                    encoded_len: 1_000,
                    bbox: None,
                },
            ],
        );

        let found = FigureDetector::new(FigureConfig::default()).extract(&g, &pages(2));
        let summary: Vec<_> = found
            .iter()
            .map(|c| (c.figure_num, c.page_num, c.strategy))
            .collect();
        assert_eq!(
            summary,
            vec![
                (1, 1, Strategy::VectorCluster),
                (2, 1, Strategy::ImageBlock),
                (3, 2, Strategy::RasterImage),
            ]
        );
        assert_eq!(found[0].context, "text of page 1");
    }

    #[test]
    fn caps_are_enforced() {
        let mut g = StubGeometry::default();
        let blocks: Vec<_> = (0..5)
            .map(|i| bb(50.0, 50.0 + i as f32 * 140.0, 250.0, 170.0 + i as f32 * 140.0))
            .collect();
        for p in 1..=4 {
            letter(&mut g, p);
            g.blocks.insert(p, blocks.clone());
        }
        let config = FigureConfig {
            max_total: 7,
            max_per_page: 3,
            ..Default::default()
        };
        let found = FigureDetector::new(config).extract(&g, &pages(4));
        assert_eq!(found.len(), 7);
        let per_page: Vec<usize> = (1..=4)
            .map(|p| found.iter().filter(|c| c.page_num == p).count())
            .collect();
        assert_eq!(per_page, vec![3, 3, 1, 0]);
        let nums: Vec<usize> = found.iter().map(|c| c.figure_num).collect();
        assert_eq!(nums, (1..=7).collect::<Vec<_>>());
    }

    #[test]
    fn images_are_downscaled_and_saved() {
        let dir = tempfile::tempdir().unwrap();
        let mut g = StubGeometry::default();
        letter(&mut g, 1);
        g.blocks.insert(1, vec![bb(0.0, 0.0, 600.0, 500.0)]);
        let config = FigureConfig {
            render_dpi: 300,
            save_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let found = FigureDetector::new(config).extract(&g, &pages(1));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].image.width().max(found[0].image.height()), 1024);
        let path = found[0].image_path.as_deref().unwrap();
        assert!(path.ends_with("figure_1_page1.png"));
        assert!(std::path::Path::new(path).exists());
    }

    #[test]
    fn context_is_truncated() {
        let mut g = StubGeometry::default();
        letter(&mut g, 1);
        g.blocks.insert(1, vec![bb(0.0, 0.0, 200.0, 200.0)]);
        let config = FigureConfig {
            context_max_chars: 4,
            ..Default::default()
        };
        let found = FigureDetector::new(config).extract(&g, &pages(1));
        assert_eq!(found[0].context, "text");
    }
}
