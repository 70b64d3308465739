//! pdfium-backed page source and page geometry.
//!
//! pdfium is not async-safe, so every call runs on the blocking pool via
//! `tokio::task::spawn_blocking`. Page rasters are capped by
//! `max_rendered_pixels` on the longest edge so that an A0 poster does not
//! turn into a 12,000 px image.
//!
//! Geometry (page sizes, drawing and image boxes, embedded image metadata) is
//! read once when the document is opened. Raster pixels are only decoded
//! when the figure detector asks for them.

use crate::document::{Document, PageSource};
use crate::error::DocrError;
use crate::output::BoundingBox;
use crate::pipeline::figures::{plausible_image, PageGeometry, RasterImageRef};
use async_trait::async_trait;
use image::DynamicImage;
use once_cell::sync::OnceCell;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Environment variable naming the pdfium library file or its directory.
pub const PDFIUM_LIB_ENV: &str = "PDFIUM_LIB_PATH";

/// Bind pdfium: `$PDFIUM_LIB_PATH`, then the working directory, then the
/// system library path.
pub fn bind_pdfium() -> Result<Pdfium, DocrError> {
    let from_env = std::env::var_os(PDFIUM_LIB_ENV).map(PathBuf::from).map(|p| {
        if p.is_dir() {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(&p))
        } else {
            Pdfium::bind_to_library(&p)
        }
    });

    let bindings = match from_env {
        Some(Ok(b)) => Ok(b),
        Some(Err(e)) => {
            warn!("{} set but binding failed: {:?}", PDFIUM_LIB_ENV, e);
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
                .or_else(|_| Pdfium::bind_to_system_library())
        }
        None => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library()),
    }
    .map_err(|e| DocrError::PdfiumBindingFailed(format!("{e:?}")))?;

    Ok(Pdfium::new(bindings))
}

fn open<'a>(
    pdfium: &'a Pdfium,
    path: &Path,
    password: Option<&'a str>,
) -> Result<PdfDocument<'a>, DocrError> {
    if !path.exists() {
        return Err(DocrError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    pdfium.load_pdf_from_file(path, password).map_err(|e| {
        let err_str = format!("{:?}", e);
        if err_str.contains("Password") || err_str.contains("password") {
            DocrError::PasswordRequired {
                path: path.to_path_buf(),
            }
        } else {
            DocrError::CorruptPdf {
                path: path.to_path_buf(),
                detail: err_str,
            }
        }
    })
}

fn page_error(page: usize) -> impl Fn(PdfiumError) -> DocrError {
    move |e| DocrError::RasterisationFailed {
        page,
        detail: format!("{:?}", e),
    }
}

fn join_error(e: tokio::task::JoinError) -> DocrError {
    DocrError::Internal(format!("pdfium task panicked: {}", e))
}

/// Loads a PDF and rasterises every page.
#[derive(Debug, Clone)]
pub struct PdfiumPageSource {
    path: PathBuf,
    password: Option<String>,
    dpi: u32,
    max_rendered_pixels: u32,
}

impl PdfiumPageSource {
    pub fn new(path: impl Into<PathBuf>, dpi: u32, max_rendered_pixels: u32) -> Self {
        Self {
            path: path.into(),
            password: None,
            dpi,
            max_rendered_pixels,
        }
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read page geometry for figure detection.
    pub async fn geometry(&self) -> Result<PdfiumGeometry, DocrError> {
        let path = self.path.clone();
        let password = self.password.clone();
        tokio::task::spawn_blocking(move || PdfiumGeometry::open_blocking(path, password))
            .await
            .map_err(join_error)?
    }

    fn render_blocking(&self) -> Result<Vec<DynamicImage>, DocrError> {
        let pdfium = bind_pdfium()?;
        let document = open(&pdfium, &self.path, self.password.as_deref())?;
        let pages = document.pages();
        info!("PDF loaded: {} pages", pages.len());

        let render_config = PdfRenderConfig::new()
            .scale_page_by_factor(self.dpi as f32 / 72.0)
            .set_maximum_width(self.max_rendered_pixels as i32)
            .set_maximum_height(self.max_rendered_pixels as i32);

        let mut images = Vec::with_capacity(pages.len() as usize);
        for (idx, page) in pages.iter().enumerate() {
            let bitmap = page
                .render_with_config(&render_config)
                .map_err(page_error(idx + 1))?;
            let image = bitmap.as_image();
            debug!(
                "Rendered page {} → {}x{} px",
                idx + 1,
                image.width(),
                image.height()
            );
            images.push(image);
        }
        Ok(images)
    }
}

#[async_trait]
impl PageSource for PdfiumPageSource {
    async fn load(&self) -> Result<Document, DocrError> {
        let this = self.clone();
        let images = tokio::task::spawn_blocking(move || this.render_blocking())
            .await
            .map_err(join_error)??;
        Ok(Document::from_images(&self.path, images))
    }
}

#[derive(Debug, Clone, Default)]
struct PageShapes {
    width: f32,
    height: f32,
    drawings: Vec<BoundingBox>,
    image_blocks: Vec<BoundingBox>,
    rasters: Vec<RasterImageRef>,
}

/// Last page rendered for clipping, reused while the detector stays on it.
struct RenderedPage {
    page: usize,
    dpi: u32,
    image: Arc<DynamicImage>,
}

/// Page geometry read from a PDF's object tree.
///
/// Clip renders share one pdfium binding and one full-page render per page
/// and DPI, so several figures on a page cost a single render.
pub struct PdfiumGeometry {
    path: PathBuf,
    password: Option<String>,
    pages: Vec<PageShapes>,
    pdfium: OnceCell<Pdfium>,
    rendered: Mutex<Option<RenderedPage>>,
}

impl std::fmt::Debug for PdfiumGeometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PdfiumGeometry")
            .field("path", &self.path)
            .field("pages", &self.pages.len())
            .finish()
    }
}

/// Object bounds in top-left page coordinates.
fn object_box(object: &PdfPageObject, page_height: f32) -> Option<BoundingBox> {
    let bounds = object.bounds().ok()?;
    let b = BoundingBox::new(
        bounds.left().value,
        page_height - bounds.top().value,
        bounds.right().value,
        page_height - bounds.bottom().value,
    );
    (b.width() > 0.0 && b.height() > 0.0).then_some(b)
}

/// Stencil masks report no colour space.
fn usable_color_space(space: Option<PdfColorSpace>) -> bool {
    !matches!(space, None | Some(PdfColorSpace::Unknown))
}

/// Describe an embedded image from its metadata. The stored stream is only
/// read (for its length) when the image could pass the raster filters.
fn raster_ref(
    image: &PdfPageImageObject,
    index: usize,
    bbox: Option<BoundingBox>,
) -> RasterImageRef {
    let width = image.width().unwrap_or(0).max(0) as u32;
    let height = image.height().unwrap_or(0).max(0) as u32;
    let has_color_space = usable_color_space(image.color_space().ok());
    let encoded_len = if has_color_space && plausible_image(width as f32, height as f32) {
        image.get_raw_image_data().map(|raw| raw.len()).unwrap_or(0)
    } else {
        0
    };
    RasterImageRef {
        index,
        width,
        height,
        has_color_space,
        encoded_len,
        bbox,
    }
}

/// Cut `clip` (page units) out of a page rendered at `scale` pixels per unit.
fn crop_clip(
    full: &DynamicImage,
    clip: &BoundingBox,
    scale: f32,
    page: usize,
) -> Result<DynamicImage, DocrError> {
    let x = ((clip.x0.max(0.0) * scale) as u32).min(full.width());
    let y = ((clip.y0.max(0.0) * scale) as u32).min(full.height());
    let w = ((clip.x1 * scale).ceil().max(0.0) as u32)
        .min(full.width())
        .saturating_sub(x);
    let h = ((clip.y1 * scale).ceil().max(0.0) as u32)
        .min(full.height())
        .saturating_sub(y);
    if w == 0 || h == 0 {
        return Err(DocrError::RasterisationFailed {
            page,
            detail: format!("clip {:?} lies outside the page", clip),
        });
    }
    Ok(full.crop_imm(x, y, w, h))
}

impl PdfiumGeometry {
    fn with_pages(path: PathBuf, password: Option<String>, pages: Vec<PageShapes>) -> Self {
        Self {
            path,
            password,
            pages,
            pdfium: OnceCell::new(),
            rendered: Mutex::new(None),
        }
    }

    fn open_blocking(path: PathBuf, password: Option<String>) -> Result<Self, DocrError> {
        let mut geometry = Self::with_pages(path, password, Vec::new());
        geometry.pages = geometry.read_pages()?;
        debug!("Geometry read for {} pages", geometry.pages.len());
        Ok(geometry)
    }

    fn read_pages(&self) -> Result<Vec<PageShapes>, DocrError> {
        let document = open(self.pdfium()?, &self.path, self.password.as_deref())?;

        let mut pages = Vec::new();
        for page in document.pages().iter() {
            let width = page.width().value;
            let height = page.height().value;
            let mut shapes = PageShapes {
                width,
                height,
                ..Default::default()
            };

            let mut image_index = 0;
            for object in page.objects().iter() {
                match object.object_type() {
                    PdfPageObjectType::Path => {
                        if let Some(b) = object_box(&object, height) {
                            shapes.drawings.push(b);
                        }
                    }
                    PdfPageObjectType::Image => {
                        let bbox = object_box(&object, height);
                        if let Some(b) = bbox {
                            shapes.image_blocks.push(b);
                        }
                        if let Some(image) = object.as_image_object() {
                            shapes.rasters.push(raster_ref(image, image_index, bbox));
                        }
                        image_index += 1;
                    }
                    _ => {}
                }
            }
            pages.push(shapes);
        }
        Ok(pages)
    }

    fn pdfium(&self) -> Result<&Pdfium, DocrError> {
        self.pdfium.get_or_try_init(bind_pdfium)
    }

    fn shapes(&self, page: usize) -> Option<&PageShapes> {
        page.checked_sub(1).and_then(|i| self.pages.get(i))
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Full render of `page` at `dpi`, cached until another page or DPI is
    /// requested.
    fn page_render(&self, page: usize, dpi: u32) -> Result<Arc<DynamicImage>, DocrError> {
        let mut cache = self
            .rendered
            .lock()
            .map_err(|_| DocrError::Internal("page render cache poisoned".into()))?;
        if let Some(hit) = cache.as_ref().filter(|r| r.page == page && r.dpi == dpi) {
            return Ok(Arc::clone(&hit.image));
        }

        let document = open(self.pdfium()?, &self.path, self.password.as_deref())?;
        let pdf_page = document
            .pages()
            .get(page.saturating_sub(1) as u16)
            .map_err(page_error(page))?;
        let render_config = PdfRenderConfig::new().scale_page_by_factor(dpi as f32 / 72.0);
        let image = Arc::new(
            pdf_page
                .render_with_config(&render_config)
                .map_err(page_error(page))?
                .as_image(),
        );
        debug!("Page {} rendered at {} dpi for figure clips", page, dpi);
        *cache = Some(RenderedPage {
            page,
            dpi,
            image: Arc::clone(&image),
        });
        Ok(image)
    }
}

impl PageGeometry for PdfiumGeometry {
    fn page_size(&self, page: usize) -> Option<(f32, f32)> {
        self.shapes(page).map(|s| (s.width, s.height))
    }

    fn drawing_boxes(&self, page: usize) -> Vec<BoundingBox> {
        self.shapes(page).map(|s| s.drawings.clone()).unwrap_or_default()
    }

    fn image_blocks(&self, page: usize) -> Vec<BoundingBox> {
        self.shapes(page).map(|s| s.image_blocks.clone()).unwrap_or_default()
    }

    fn raster_images(&self, page: usize) -> Vec<RasterImageRef> {
        self.shapes(page).map(|s| s.rasters.clone()).unwrap_or_default()
    }

    fn render_clip(
        &self,
        page: usize,
        clip: &BoundingBox,
        dpi: u32,
    ) -> Result<DynamicImage, DocrError> {
        let full = self.page_render(page, dpi)?;
        crop_clip(&full, clip, dpi as f32 / 72.0, page)
    }

    fn load_raster(&self, page: usize, image: &RasterImageRef) -> Result<DynamicImage, DocrError> {
        let document = open(self.pdfium()?, &self.path, self.password.as_deref())?;
        let pdf_page = document
            .pages()
            .get(page.saturating_sub(1) as u16)
            .map_err(page_error(page))?;

        pdf_page
            .objects()
            .iter()
            .filter(|o| o.object_type() == PdfPageObjectType::Image)
            .nth(image.index)
            .and_then(|o| o.as_image_object().map(|i| i.get_raw_image()))
            .ok_or_else(|| DocrError::RasterisationFailed {
                page,
                detail: format!("image object {} not found", image.index),
            })?
            .map_err(page_error(page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_is_reported() {
        // Binding may fail on machines without pdfium; both errors are fine
        // as long as a missing file never reads as corrupt.
        let source = PdfiumPageSource::new("/nonexistent/file.pdf", 150, 2000);
        match source.load().await {
            Err(DocrError::FileNotFound { .. }) | Err(DocrError::PdfiumBindingFailed(_)) => {}
            other => panic!("unexpected: {:?}", other.map(|d| d.pages.len())),
        }
    }

    #[tokio::test]
    async fn missing_file_geometry_is_reported() {
        let source = PdfiumPageSource::new("/nonexistent/file.pdf", 150, 2000)
            .with_password(Some("secret".into()));
        match source.geometry().await {
            Err(DocrError::FileNotFound { .. }) | Err(DocrError::PdfiumBindingFailed(_)) => {}
            other => panic!("unexpected: {:?}", other.map(|g| g.page_count())),
        }
    }

    fn letter_geometry(path: &str) -> PdfiumGeometry {
        PdfiumGeometry::with_pages(
            PathBuf::from(path),
            None,
            vec![
                PageShapes {
                    width: 612.0,
                    height: 792.0,
                    ..Default::default()
                };
                2
            ],
        )
    }

    #[test]
    fn shapes_are_one_based() {
        let geometry = letter_geometry("x.pdf");
        assert_eq!(geometry.page_size(1), Some((612.0, 792.0)));
        assert_eq!(geometry.page_size(0), None);
        assert_eq!(geometry.page_size(3), None);
        assert!(geometry.drawing_boxes(3).is_empty());
    }

    #[test]
    fn masks_have_no_usable_color_space() {
        assert!(!usable_color_space(None));
        assert!(!usable_color_space(Some(PdfColorSpace::Unknown)));
        assert!(usable_color_space(Some(PdfColorSpace::DeviceRGB)));
        assert!(usable_color_space(Some(PdfColorSpace::DeviceGray)));
        assert!(usable_color_space(Some(PdfColorSpace::CalibratedICCProfile)));
    }

    #[test]
    fn crop_clip_scales_and_clamps() {
        // Letter page at 144 dpi.
        let full = DynamicImage::new_rgb8(1224, 1584);
        let crop = crop_clip(&full, &BoundingBox::new(100.0, 200.0, 300.0, 350.0), 2.0, 1).unwrap();
        assert_eq!((crop.width(), crop.height()), (400, 300));

        let edge = crop_clip(&full, &BoundingBox::new(500.0, 700.0, 700.0, 900.0), 2.0, 1).unwrap();
        assert_eq!((edge.width(), edge.height()), (224, 184));

        let outside = crop_clip(&full, &BoundingBox::new(650.0, 10.0, 700.0, 60.0), 2.0, 3);
        assert!(matches!(
            outside,
            Err(DocrError::RasterisationFailed { page: 3, .. })
        ));
    }

    #[test]
    fn clips_on_one_page_share_a_render() {
        // The file does not exist: only a cached render can satisfy a clip.
        let geometry = letter_geometry("/nonexistent/deck.pdf");
        *geometry.rendered.lock().unwrap() = Some(RenderedPage {
            page: 1,
            dpi: 144,
            image: Arc::new(DynamicImage::new_rgb8(1224, 1584)),
        });

        let a = geometry
            .render_clip(1, &BoundingBox::new(72.0, 72.0, 144.0, 108.0), 144)
            .unwrap();
        assert_eq!((a.width(), a.height()), (144, 72));
        let b = geometry
            .render_clip(1, &BoundingBox::new(0.0, 0.0, 36.0, 36.0), 144)
            .unwrap();
        assert_eq!((b.width(), b.height()), (72, 72));

        // Another page or DPI needs a fresh render.
        assert!(geometry
            .render_clip(2, &BoundingBox::new(0.0, 0.0, 36.0, 36.0), 144)
            .is_err());
        assert!(geometry
            .render_clip(1, &BoundingBox::new(0.0, 0.0, 36.0, 36.0), 200)
            .is_err());
    }
}
