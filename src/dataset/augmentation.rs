//! Data Augmentation Module
//!
//! Random geometric augmentation applied on the fly to training images,
//! and the deterministic rescale-only path used for validation.
//!
//! # Augmentation Strategy
//!
//! - **Training**: a random affine transform (rotation, shift, shear, zoom)
//!   followed by an optional horizontal/vertical flip, then rescale
//! - **Validation/Prediction**: resize and rescale only, no randomness
//!
//! Every image is resized to the target resolution first; the affine
//! transform is then sampled around the image centre with bilinear
//! interpolation, and pixels that fall outside the source are filled
//! according to [`FillMode`].

use image::{DynamicImage, Rgb, RgbImage};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::dataset::ImageSize;

/// Border policy for pixels sampled outside the source image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FillMode {
    /// `aaaa|abcd|dddd`: repeat the closest edge pixel
    #[default]
    Nearest,
    /// `kkkk|abcd|kkkk`: use `fill_value`
    Constant,
    /// `dcba|abcd|dcba`: mirror at the edge
    Reflect,
    /// `abcd|abcd|abcd`: tile the image
    Wrap,
}

/// Configuration for data augmentation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    /// Factor every pixel value is multiplied by after augmentation
    pub rescale: f32,
    /// Maximum rotation in degrees (applies ±rotation_range)
    pub rotation_range: f32,
    /// Maximum horizontal shift as a fraction of the width
    pub width_shift_range: f32,
    /// Maximum vertical shift as a fraction of the height
    pub height_shift_range: f32,
    /// Maximum shear angle in degrees, counter-clockwise
    pub shear_range: f32,
    /// Zoom factors are drawn per axis from [1 - zoom_range, 1 + zoom_range]
    pub zoom_range: f32,
    /// Randomly mirror left/right with probability 0.5
    pub horizontal_flip: bool,
    /// Randomly mirror top/bottom with probability 0.5
    pub vertical_flip: bool,
    /// How out-of-bounds pixels are filled
    pub fill_mode: FillMode,
    /// Pixel value (0-255 scale) used by [`FillMode::Constant`]
    pub fill_value: f32,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            rescale: 1.0 / 255.0,
            rotation_range: 20.0,
            width_shift_range: 0.2,
            height_shift_range: 0.2,
            shear_range: 0.2,
            zoom_range: 0.2,
            horizontal_flip: true,
            vertical_flip: false,
            fill_mode: FillMode::Nearest,
            fill_value: 0.0,
        }
    }
}

impl AugmentationConfig {
    /// No geometric augmentation, only the given rescale factor
    pub fn rescale_only(rescale: f32) -> Self {
        Self {
            rescale,
            rotation_range: 0.0,
            width_shift_range: 0.0,
            height_shift_range: 0.0,
            shear_range: 0.0,
            zoom_range: 0.0,
            horizontal_flip: false,
            vertical_flip: false,
            fill_mode: FillMode::Nearest,
            fill_value: 0.0,
        }
    }

    /// The same rescale factor with every random transform disabled
    pub fn to_validation(&self) -> Self {
        Self::rescale_only(self.rescale)
    }

    /// Whether no random transform is enabled
    pub fn is_deterministic(&self) -> bool {
        self.rotation_range == 0.0
            && self.width_shift_range == 0.0
            && self.height_shift_range == 0.0
            && self.shear_range == 0.0
            && self.zoom_range == 0.0
            && !self.horizontal_flip
            && !self.vertical_flip
    }

    /// Check ranges for values the sampler cannot use
    pub fn validate(&self) -> Result<(), String> {
        if !(self.rescale.is_finite() && self.rescale > 0.0) {
            return Err(format!("rescale must be positive, got {}", self.rescale));
        }
        let ranges = [
            ("rotation_range", self.rotation_range),
            ("width_shift_range", self.width_shift_range),
            ("height_shift_range", self.height_shift_range),
            ("shear_range", self.shear_range),
            ("zoom_range", self.zoom_range),
        ];
        for (name, value) in ranges {
            if !(value.is_finite() && value >= 0.0) {
                return Err(format!("{} must be non-negative, got {}", name, value));
            }
        }
        if self.zoom_range >= 1.0 {
            return Err(format!("zoom_range must be below 1.0, got {}", self.zoom_range));
        }
        Ok(())
    }
}

/// One random draw of the geometric parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformParams {
    pub rotation_deg: f32,
    /// Horizontal shift in pixels
    pub shift_x: f32,
    /// Vertical shift in pixels
    pub shift_y: f32,
    pub shear_deg: f32,
    pub zoom_x: f32,
    pub zoom_y: f32,
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
}

impl TransformParams {
    /// Parameters that leave the image untouched
    pub fn identity() -> Self {
        Self {
            rotation_deg: 0.0,
            shift_x: 0.0,
            shift_y: 0.0,
            shear_deg: 0.0,
            zoom_x: 1.0,
            zoom_y: 1.0,
            flip_horizontal: false,
            flip_vertical: false,
        }
    }

    fn has_affine(&self) -> bool {
        self.rotation_deg != 0.0
            || self.shift_x != 0.0
            || self.shift_y != 0.0
            || self.shear_deg != 0.0
            || self.zoom_x != 1.0
            || self.zoom_y != 1.0
    }

    /// Matrix mapping an output offset from the centre to a source offset.
    ///
    /// Composed as rotation · shift · shear · zoom, each acting on the
    /// source coordinates of the previous one.
    fn source_matrix(&self) -> Affine {
        let theta = self.rotation_deg.to_radians();
        let shear = self.shear_deg.to_radians();

        let rotation = Affine::new([
            [theta.cos(), theta.sin(), 0.0],
            [-theta.sin(), theta.cos(), 0.0],
        ]);
        let shift = Affine::new([[1.0, 0.0, self.shift_x], [0.0, 1.0, self.shift_y]]);
        let shear = Affine::new([[shear.cos(), 0.0, 0.0], [-shear.sin(), 1.0, 0.0]]);
        let zoom = Affine::new([[self.zoom_x, 0.0, 0.0], [0.0, self.zoom_y, 0.0]]);

        rotation.then(&shift).then(&shear).then(&zoom)
    }
}

/// 2x3 affine matrix over (x, y) pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
struct Affine {
    m: [[f32; 3]; 2],
}

impl Affine {
    fn new(m: [[f32; 3]; 2]) -> Self {
        Self { m }
    }

    /// `self · other`, i.e. apply `other` first
    fn then(&self, other: &Affine) -> Affine {
        let a = &self.m;
        let b = &other.m;
        let mut m = [[0.0f32; 3]; 2];
        for (r, row) in m.iter_mut().enumerate() {
            row[0] = a[r][0] * b[0][0] + a[r][1] * b[1][0];
            row[1] = a[r][0] * b[0][1] + a[r][1] * b[1][1];
            row[2] = a[r][0] * b[0][2] + a[r][1] * b[1][2] + a[r][2];
        }
        Affine { m }
    }

    fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.m[0][0] * x + self.m[0][1] * y + self.m[0][2],
            self.m[1][0] * x + self.m[1][1] * y + self.m[1][2],
        )
    }
}

/// Image augmenter that applies the configured transforms
#[derive(Debug, Clone)]
pub struct Augmenter {
    config: AugmentationConfig,
    image_size: ImageSize,
}

impl Augmenter {
    /// Create a new augmenter with the given configuration
    pub fn new(config: AugmentationConfig, image_size: ImageSize) -> Self {
        Self { config, image_size }
    }

    /// Create an augmenter that only resizes and rescales
    pub fn validation(rescale: f32, image_size: ImageSize) -> Self {
        Self::new(AugmentationConfig::rescale_only(rescale), image_size)
    }

    pub fn image_size(&self) -> ImageSize {
        self.image_size
    }

    /// Draw a fresh set of transform parameters
    pub fn sample_params(&self, rng: &mut ChaCha8Rng) -> TransformParams {
        let cfg = &self.config;
        let mut params = TransformParams::identity();

        if cfg.rotation_range > 0.0 {
            params.rotation_deg = rng.gen_range(-cfg.rotation_range..=cfg.rotation_range);
        }
        if cfg.height_shift_range > 0.0 {
            let fraction = rng.gen_range(-cfg.height_shift_range..=cfg.height_shift_range);
            params.shift_y = fraction * self.image_size.height as f32;
        }
        if cfg.width_shift_range > 0.0 {
            let fraction = rng.gen_range(-cfg.width_shift_range..=cfg.width_shift_range);
            params.shift_x = fraction * self.image_size.width as f32;
        }
        if cfg.shear_range > 0.0 {
            params.shear_deg = rng.gen_range(-cfg.shear_range..=cfg.shear_range);
        }
        if cfg.zoom_range > 0.0 {
            let (lo, hi) = (1.0 - cfg.zoom_range, 1.0 + cfg.zoom_range);
            params.zoom_x = rng.gen_range(lo..=hi);
            params.zoom_y = rng.gen_range(lo..=hi);
        }
        params.flip_horizontal = cfg.horizontal_flip && rng.gen_bool(0.5);
        params.flip_vertical = cfg.vertical_flip && rng.gen_bool(0.5);

        params
    }

    /// Apply one random draw of the configured transforms
    pub fn augment(&self, img: &RgbImage, rng: &mut ChaCha8Rng) -> RgbImage {
        let params = self.sample_params(rng);
        self.apply(img, &params)
    }

    /// Apply the given transform parameters to an image
    pub fn apply(&self, img: &RgbImage, params: &TransformParams) -> RgbImage {
        let mut result = if params.has_affine() {
            self.warp(img, params)
        } else {
            img.clone()
        };

        if params.flip_horizontal {
            image::imageops::flip_horizontal_in_place(&mut result);
        }
        if params.flip_vertical {
            image::imageops::flip_vertical_in_place(&mut result);
        }

        result
    }

    /// Inverse-map every output pixel through the affine transform
    fn warp(&self, img: &RgbImage, params: &TransformParams) -> RgbImage {
        let (width, height) = img.dimensions();
        let matrix = params.source_matrix();

        let cx = (width as f32 - 1.0) / 2.0;
        let cy = (height as f32 - 1.0) / 2.0;

        RgbImage::from_fn(width, height, |x, y| {
            let (sx, sy) = matrix.apply(x as f32 - cx, y as f32 - cy);
            self.bilinear_sample(img, sx + cx, sy + cy)
        })
    }

    /// Sample a pixel using bilinear interpolation and the fill mode
    fn bilinear_sample(&self, img: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
        let (width, height) = img.dimensions();

        let x0 = x.floor();
        let y0 = y.floor();
        let fx = x - x0;
        let fy = y - y0;
        let (x0, y0) = (x0 as i64, y0 as i64);

        let corners = [
            (x0, y0, (1.0 - fx) * (1.0 - fy)),
            (x0 + 1, y0, fx * (1.0 - fy)),
            (x0, y0 + 1, (1.0 - fx) * fy),
            (x0 + 1, y0 + 1, fx * fy),
        ];

        let mut acc = [0.0f32; 3];
        for (cx, cy, weight) in corners {
            if weight == 0.0 {
                continue;
            }
            let value = match (
                self.resolve(cx, width as i64),
                self.resolve(cy, height as i64),
            ) {
                (Some(px), Some(py)) => {
                    let p = img.get_pixel(px, py);
                    [p[0] as f32, p[1] as f32, p[2] as f32]
                }
                _ => [self.config.fill_value; 3],
            };
            for c in 0..3 {
                acc[c] += value[c] * weight;
            }
        }

        Rgb(acc.map(|v| v.round().clamp(0.0, 255.0) as u8))
    }

    /// Map a possibly out-of-range coordinate back into `0..len`.
    /// `None` means "use the constant fill value".
    fn resolve(&self, coord: i64, len: i64) -> Option<u32> {
        if (0..len).contains(&coord) {
            return Some(coord as u32);
        }
        let resolved = match self.config.fill_mode {
            FillMode::Constant => return None,
            FillMode::Nearest => coord.clamp(0, len - 1),
            FillMode::Wrap => coord.rem_euclid(len),
            FillMode::Reflect => {
                let period = 2 * len;
                let m = coord.rem_euclid(period);
                if m < len {
                    m
                } else {
                    period - 1 - m
                }
            }
        };
        Some(resolved as u32)
    }

    /// Resize image to the target size (always applied, not random)
    pub fn resize(&self, img: &DynamicImage) -> RgbImage {
        let (w, h) = (self.image_size.width, self.image_size.height);
        if img.width() == w && img.height() == h {
            return img.to_rgb8();
        }
        img.resize_exact(w, h, image::imageops::FilterType::Triangle)
            .to_rgb8()
    }

    /// Convert image to CHW float data multiplied by the rescale factor
    pub fn to_tensor_data(&self, img: &RgbImage) -> Vec<f32> {
        let (width, height) = img.dimensions();
        let plane = (width * height) as usize;
        let mut data = vec![0.0f32; 3 * plane];

        for (x, y, pixel) in img.enumerate_pixels() {
            let offset = (y * width + x) as usize;
            for c in 0..3 {
                data[c * plane + offset] = pixel[c] as f32 * self.config.rescale;
            }
        }

        data
    }

    /// Full preprocessing pipeline: resize, augment (when an RNG is given
    /// and a random transform is configured), rescale to CHW data
    pub fn preprocess(&self, img: &DynamicImage, rng: Option<&mut ChaCha8Rng>) -> Vec<f32> {
        let resized = self.resize(img);

        let result = match rng {
            Some(rng) if !self.config.is_deterministic() => self.augment(&resized, rng),
            _ => resized,
        };

        self.to_tensor_data(&result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageBuffer;
    use rand::SeedableRng;

    fn size(width: u32, height: u32) -> ImageSize {
        ImageSize { width, height }
    }

    fn create_test_image() -> DynamicImage {
        let img = ImageBuffer::from_fn(64, 48, |x, y| Rgb([(x * 4) as u8, (y * 5) as u8, 128]));
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_default_matches_training_recipe() {
        let cfg = AugmentationConfig::default();
        assert_eq!(cfg.rotation_range, 20.0);
        assert_eq!(cfg.width_shift_range, 0.2);
        assert_eq!(cfg.height_shift_range, 0.2);
        assert_eq!(cfg.shear_range, 0.2);
        assert_eq!(cfg.zoom_range, 0.2);
        assert!(cfg.horizontal_flip);
        assert_eq!(cfg.fill_mode, FillMode::Nearest);
        assert!(!cfg.is_deterministic());
        assert!(cfg.to_validation().is_deterministic());
        assert_eq!(cfg.to_validation().rescale, cfg.rescale);
    }

    #[test]
    fn test_validate_rejects_bad_ranges() {
        let mut cfg = AugmentationConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.zoom_range = 1.5;
        assert!(cfg.validate().is_err());
        cfg.zoom_range = 0.2;
        cfg.rotation_range = -1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_pipeline_is_deterministic_and_in_unit_range() {
        let aug = Augmenter::validation(1.0 / 255.0, size(32, 24));
        let img = create_test_image();
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        let a = aug.preprocess(&img, None);
        let b = aug.preprocess(&img, Some(&mut rng));

        assert_eq!(a.len(), 3 * 32 * 24);
        assert_eq!(a, b);
        assert!(a.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_validation_output_equals_plain_resize() {
        let aug = Augmenter::validation(1.0 / 255.0, size(64, 48));
        let img = create_test_image();
        let data = aug.preprocess(&img, None);

        let rgb = img.to_rgb8();
        let plane = 64 * 48;
        let p = rgb.get_pixel(10, 20);
        let offset = 20 * 64 + 10;
        let scale = 1.0f32 / 255.0;
        assert_eq!(data[offset], p[0] as f32 * scale);
        assert_eq!(data[plane + offset], p[1] as f32 * scale);
        assert_eq!(data[2 * plane + offset], p[2] as f32 * scale);
    }

    #[test]
    fn test_augment_keeps_dimensions() {
        let aug = Augmenter::new(AugmentationConfig::default(), size(64, 48));
        let img = create_test_image().to_rgb8();
        let mut rng = ChaCha8Rng::seed_from_u64(42);

        for _ in 0..5 {
            let result = aug.augment(&img, &mut rng);
            assert_eq!(result.dimensions(), (64, 48));
        }
    }

    #[test]
    fn test_augment_is_reproducible_per_seed() {
        let aug = Augmenter::new(AugmentationConfig::default(), size(64, 48));
        let img = create_test_image().to_rgb8();

        let a = aug.augment(&img, &mut ChaCha8Rng::seed_from_u64(3));
        let b = aug.augment(&img, &mut ChaCha8Rng::seed_from_u64(3));
        assert_eq!(a, b);
    }

    #[test]
    fn test_sampled_params_stay_in_range() {
        let aug = Augmenter::new(AugmentationConfig::default(), size(100, 50));
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        for _ in 0..200 {
            let p = aug.sample_params(&mut rng);
            assert!(p.rotation_deg.abs() <= 20.0);
            assert!(p.shift_x.abs() <= 20.0 + 1e-3);
            assert!(p.shift_y.abs() <= 10.0 + 1e-3);
            assert!(p.shear_deg.abs() <= 0.2);
            assert!((0.8..=1.2).contains(&p.zoom_x));
            assert!((0.8..=1.2).contains(&p.zoom_y));
            assert!(!p.flip_vertical);
        }
    }

    #[test]
    fn test_identity_params_leave_image_unchanged() {
        let aug = Augmenter::new(AugmentationConfig::default(), size(64, 48));
        let img = create_test_image().to_rgb8();
        assert_eq!(aug.apply(&img, &TransformParams::identity()), img);
    }

    #[test]
    fn test_horizontal_flip_mirrors_columns() {
        let aug = Augmenter::new(AugmentationConfig::default(), size(64, 48));
        let img = create_test_image().to_rgb8();
        let params = TransformParams {
            flip_horizontal: true,
            ..TransformParams::identity()
        };

        let flipped = aug.apply(&img, &params);
        assert_eq!(flipped.get_pixel(0, 5), img.get_pixel(63, 5));
        assert_eq!(flipped.get_pixel(63, 5), img.get_pixel(0, 5));
    }

    #[test]
    fn test_integer_shift_moves_pixels() {
        let aug = Augmenter::new(AugmentationConfig::default(), size(64, 48));
        let img = create_test_image().to_rgb8();
        let params = TransformParams {
            shift_x: 3.0,
            ..TransformParams::identity()
        };

        let shifted = aug.apply(&img, &params);
        // Output pixel x samples source pixel x + 3
        assert_eq!(shifted.get_pixel(10, 7), img.get_pixel(13, 7));
        // Past the right edge nearest fill repeats the last column
        assert_eq!(shifted.get_pixel(63, 7), img.get_pixel(63, 7));
    }

    #[test]
    fn test_constant_fill_uses_fill_value() {
        let cfg = AugmentationConfig {
            fill_mode: FillMode::Constant,
            fill_value: 0.0,
            ..AugmentationConfig::default()
        };
        let aug = Augmenter::new(cfg, size(64, 48));
        let img = ImageBuffer::from_pixel(64, 48, Rgb([200u8, 200, 200]));
        let params = TransformParams {
            shift_x: 10.0,
            ..TransformParams::identity()
        };

        let shifted = aug.apply(&img, &params);
        assert_eq!(*shifted.get_pixel(60, 10), Rgb([0, 0, 0]));
        assert_eq!(*shifted.get_pixel(5, 10), Rgb([200, 200, 200]));
    }

    #[test]
    fn test_fill_mode_coordinate_resolution() {
        let mut cfg = AugmentationConfig::default();
        let s = size(4, 4);

        cfg.fill_mode = FillMode::Nearest;
        let aug = Augmenter::new(cfg.clone(), s);
        assert_eq!(aug.resolve(-2, 4), Some(0));
        assert_eq!(aug.resolve(6, 4), Some(3));

        cfg.fill_mode = FillMode::Wrap;
        let aug = Augmenter::new(cfg.clone(), s);
        assert_eq!(aug.resolve(-1, 4), Some(3));
        assert_eq!(aug.resolve(5, 4), Some(1));

        cfg.fill_mode = FillMode::Reflect;
        let aug = Augmenter::new(cfg.clone(), s);
        assert_eq!(aug.resolve(-1, 4), Some(0));
        assert_eq!(aug.resolve(4, 4), Some(3));
        assert_eq!(aug.resolve(5, 4), Some(2));

        cfg.fill_mode = FillMode::Constant;
        let aug = Augmenter::new(cfg, s);
        assert_eq!(aug.resolve(-1, 4), None);
        assert_eq!(aug.resolve(2, 4), Some(2));
    }

    #[test]
    fn test_training_preprocess_stays_in_unit_range() {
        let aug = Augmenter::new(AugmentationConfig::default(), size(32, 32));
        let img = create_test_image();
        let mut rng = ChaCha8Rng::seed_from_u64(11);

        let data = aug.preprocess(&img, Some(&mut rng));
        assert_eq!(data.len(), 3 * 32 * 32);
        assert!(data.iter().all(|v| (0.0..=1.0).contains(v)));
    }
}
