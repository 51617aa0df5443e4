use convlab_core::HyperParameters;
use rand::Rng;

/// Real-time augmentation of training images: random shifts and horizontal flips.
///
/// Shifts are drawn uniformly from `[-range, range]` of the image size and
/// rounded to whole pixels; uncovered pixels repeat the nearest edge.
#[derive(Clone, Debug, PartialEq)]
pub struct Augmentation {
    width_shift_range: f64,
    height_shift_range: f64,
    horizontal_flip: bool,
}

impl Augmentation {
    pub fn new(width_shift_range: f64, height_shift_range: f64, horizontal_flip: bool) -> Self {
        Self {
            width_shift_range,
            height_shift_range,
            horizontal_flip,
        }
    }

    pub fn from_params(params: &HyperParameters) -> Self {
        Self::new(
            params.width_shift_range,
            params.height_shift_range,
            params.horizontal_flip,
        )
    }

    /// Augment one planar `[channels, height, width]` image in place.
    pub fn apply<R: Rng>(&self, image: &mut [f32], shape: [usize; 3], rng: &mut R) {
        let [_, height, width] = shape;
        let dy = sample_shift(rng, self.height_shift_range, height);
        let dx = sample_shift(rng, self.width_shift_range, width);
        if dy != 0 || dx != 0 {
            shift(image, shape, dy, dx);
        }
        if self.horizontal_flip && rng.gen_bool(0.5) {
            flip_horizontal(image, shape);
        }
    }
}

fn sample_shift<R: Rng>(rng: &mut R, range: f64, extent: usize) -> isize {
    if range <= 0.0 {
        return 0;
    }
    let fraction = rng.gen_range(-range..=range);
    (fraction * extent as f64).round() as isize
}

/// Move content by `dy` rows and `dx` columns, filling with the nearest edge pixel.
pub fn shift(image: &mut [f32], shape: [usize; 3], dy: isize, dx: isize) {
    let [channels, height, width] = shape;
    let source = image.to_vec();
    let clamp = |value: isize, extent: usize| value.clamp(0, extent as isize - 1) as usize;

    for c in 0..channels {
        let plane = c * height * width;
        for y in 0..height {
            let sy = clamp(y as isize - dy, height);
            for x in 0..width {
                let sx = clamp(x as isize - dx, width);
                image[plane + y * width + x] = source[plane + sy * width + sx];
            }
        }
    }
}

pub fn flip_horizontal(image: &mut [f32], shape: [usize; 3]) {
    let [_, _, width] = shape;
    for row in image.chunks_exact_mut(width) {
        row.reverse();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convlab_core::seeded_rng;

    // 1 channel, 2 rows, 3 columns
    const SHAPE: [usize; 3] = [1, 2, 3];

    #[test]
    fn flips_each_row() {
        let mut image = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        flip_horizontal(&mut image, SHAPE);
        assert_eq!(image, vec![3.0, 2.0, 1.0, 6.0, 5.0, 4.0]);
    }

    #[test]
    fn shift_right_repeats_the_left_edge() {
        let mut image = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        shift(&mut image, SHAPE, 0, 1);
        assert_eq!(image, vec![1.0, 1.0, 2.0, 4.0, 4.0, 5.0]);
    }

    #[test]
    fn shift_up_repeats_the_bottom_edge() {
        let mut image = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        shift(&mut image, SHAPE, -1, 0);
        assert_eq!(image, vec![4.0, 5.0, 6.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn shifts_every_channel() {
        let mut image = vec![1.0, 2.0, 3.0, 4.0];
        shift(&mut image, [2, 1, 2], 0, -1);
        assert_eq!(image, vec![2.0, 2.0, 4.0, 4.0]);
    }

    #[test]
    fn disabled_augmentation_is_identity() {
        let augmentation = Augmentation::new(0.0, 0.0, false);
        let original: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let mut image = original.clone();
        let mut rng = seeded_rng(0);
        for _ in 0..8 {
            augmentation.apply(&mut image, [2, 2, 3], &mut rng);
        }
        assert_eq!(image, original);
    }

    #[test]
    fn augmentation_preserves_pixel_values() {
        let augmentation = Augmentation::new(0.1, 0.1, true);
        let mut rng = seeded_rng(42);
        for _ in 0..16 {
            let mut image: Vec<f32> = (0..3 * 32 * 32).map(|v| (v % 7) as f32).collect();
            augmentation.apply(&mut image, [3, 32, 32], &mut rng);
            assert_eq!(image.len(), 3 * 32 * 32);
            assert!(image.iter().all(|v| (0.0..7.0).contains(v)));
        }
    }
}
