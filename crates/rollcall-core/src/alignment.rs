//! Face normalization to the canonical sample format.
//!
//! Every stored sample and every recognition probe passes through
//! [`normalize_face`], so enrollment and inference see identical crops:
//! 112×112 grayscale, landmark-aligned when the detector supplies the five
//! InsightFace points, otherwise a clamped box crop resized to size.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};

/// Side length of a normalized face sample.
pub const SAMPLE_SIZE: u32 = 112;

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

/// Produce the canonical crop for one detected face.
///
/// Returns `None` when the box does not overlap the image at all.
pub fn normalize_face(image: &GrayImage, face: &BoundingBox) -> Option<GrayImage> {
    match &face.landmarks {
        Some(landmarks) => {
            let matrix = similarity_transform(landmarks, &REFERENCE_LANDMARKS);
            Some(warp_affine(image, &matrix, SAMPLE_SIZE))
        }
        None => crop_resize(image, face, SAMPLE_SIZE),
    }
}

/// Crop the box (clamped to the frame) and resize to `size`×`size`.
fn crop_resize(image: &GrayImage, face: &BoundingBox, size: u32) -> Option<GrayImage> {
    let (w, h) = (image.width() as f32, image.height() as f32);
    let x0 = face.x.max(0.0).floor();
    let y0 = face.y.max(0.0).floor();
    let x1 = (face.x + face.width).min(w).ceil();
    let y1 = (face.y + face.height).min(h).ceil();

    if !(x1 - x0 >= 1.0 && y1 - y0 >= 1.0) {
        return None;
    }

    let crop = imageops::crop_imm(
        image,
        x0 as u32,
        y0 as u32,
        (x1 - x0) as u32,
        (y1 - y0) as u32,
    )
    .to_image();
    Some(imageops::resize(&crop, size, size, FilterType::Triangle))
}

/// Least-squares 4-DOF similarity transform (scale, rotation, translation)
/// mapping `src` points onto `dst` points.
///
/// Returns [a, -b, tx, b, a, ty] representing the matrix:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
fn similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> [f32; 6] {
    let n = src.len() as f32;
    let mean = |pts: &[(f32, f32); 5]| {
        let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
        (sx / n, sy / n)
    };
    let (smx, smy) = mean(src);
    let (dmx, dmy) = mean(dst);

    let mut dot = 0.0f32;
    let mut cross = 0.0f32;
    let mut energy = 0.0f32;
    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let (sx, sy) = (sx - smx, sy - smy);
        let (dx, dy) = (dx - dmx, dy - dmy);
        dot += sx * dx + sy * dy;
        cross += sx * dy - sy * dx;
        energy += sx * sx + sy * sy;
    }

    if energy < 1e-12 {
        // Degenerate landmarks: translate only.
        return [1.0, 0.0, dmx - smx, 0.0, 1.0, dmy - smy];
    }

    let a = dot / energy;
    let b = cross / energy;
    let tx = dmx - (a * smx - b * smy);
    let ty = dmy - (b * smx + a * smy);

    [a, -b, tx, b, a, ty]
}

/// Warp `image` through `matrix` into a `size`×`size` output.
///
/// Bilinear sampling; pixels mapping outside the source are black.
fn warp_affine(image: &GrayImage, matrix: &[f32; 6], size: u32) -> GrayImage {
    let (a, b, tx, ty) = (matrix[0], matrix[3], matrix[2], matrix[5]);

    let det = a * a + b * b;
    if det < 1e-12 {
        return GrayImage::new(size, size);
    }
    let ia = a / det;
    let ib = b / det;

    let (w, h) = (image.width() as i64, image.height() as i64);
    let pixel = |x: i64, y: i64| -> f32 {
        if x >= 0 && x < w && y >= 0 && y < h {
            image.get_pixel(x as u32, y as u32).0[0] as f32
        } else {
            0.0
        }
    };

    GrayImage::from_fn(size, size, |ox, oy| {
        // src = M⁻¹ · (dst - t)
        let dx = ox as f32 - tx;
        let dy = oy as f32 - ty;
        let sx = ia * dx + ib * dy;
        let sy = -ib * dx + ia * dy;

        let x0 = sx.floor() as i64;
        let y0 = sy.floor() as i64;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let val = pixel(x0, y0) * (1.0 - fx) * (1.0 - fy)
            + pixel(x0 + 1, y0) * fx * (1.0 - fy)
            + pixel(x0, y0 + 1) * (1.0 - fx) * fy
            + pixel(x0 + 1, y0 + 1) * fx * fy;

        Luma([val.round().clamp(0.0, 255.0) as u8])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        let m = similarity_transform(&REFERENCE_LANDMARKS, &REFERENCE_LANDMARKS);
        let expected = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        for (got, want) in m.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-3, "matrix {m:?}");
        }
    }

    #[test]
    fn test_scaled_transform() {
        // Source landmarks at 2x scale → a ≈ 0.5
        let src = REFERENCE_LANDMARKS.map(|(x, y)| (x * 2.0, y * 2.0));
        let m = similarity_transform(&src, &REFERENCE_LANDMARKS);
        assert!((m[0] - 0.5).abs() < 1e-3, "a = {}", m[0]);
        assert!(m[3].abs() < 1e-3, "b = {}", m[3]);
    }

    #[test]
    fn test_rotated_transform() {
        // Source rotated 90° about the origin: (x, y) → (-y, x)
        let src = REFERENCE_LANDMARKS.map(|(x, y)| (-y, x));
        let m = similarity_transform(&src, &REFERENCE_LANDMARKS);
        // Undoing +90° is a -90° rotation: a ≈ 0, b ≈ -1
        assert!(m[0].abs() < 1e-3, "a = {}", m[0]);
        assert!((m[3] + 1.0).abs() < 1e-3, "b = {}", m[3]);
    }

    #[test]
    fn test_aligned_output_is_canonical_size() {
        let frame = GrayImage::from_pixel(640, 480, Luma([128]));
        let mut face = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
        face.landmarks = Some(REFERENCE_LANDMARKS);
        let out = normalize_face(&frame, &face).unwrap();
        assert_eq!(out.dimensions(), (SAMPLE_SIZE, SAMPLE_SIZE));
    }

    #[test]
    fn test_landmark_lands_on_reference() {
        let mut frame = GrayImage::new(200, 200);
        let src: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        // Bright 5x5 patch on the left eye
        for y in 58..63 {
            for x in 78..83 {
                frame.put_pixel(x, y, Luma([255]));
            }
        }

        let mut face = BoundingBox::new(60.0, 40.0, 80.0, 90.0);
        face.landmarks = Some(src);
        let aligned = normalize_face(&frame, &face).unwrap();

        let rx = REFERENCE_LANDMARKS[0].0.round() as u32;
        let ry = REFERENCE_LANDMARKS[0].1.round() as u32;
        let max = (ry - 1..=ry + 1)
            .flat_map(|y| (rx - 1..=rx + 1).map(move |x| (x, y)))
            .map(|(x, y)| aligned.get_pixel(x, y).0[0])
            .max()
            .unwrap();
        assert!(max > 100, "expected bright patch near ({rx}, {ry}), max={max}");
    }

    #[test]
    fn test_box_crop_resized() {
        let frame = GrayImage::from_fn(300, 200, |x, _| Luma([if x < 150 { 0 } else { 255 }]));
        let out = normalize_face(&frame, &BoundingBox::new(160.0, 20.0, 60.0, 60.0)).unwrap();
        assert_eq!(out.dimensions(), (SAMPLE_SIZE, SAMPLE_SIZE));
        assert!(out.pixels().all(|p| p.0[0] == 255));
    }

    #[test]
    fn test_box_partially_outside_is_clamped() {
        let frame = GrayImage::from_pixel(100, 100, Luma([50]));
        let out = normalize_face(&frame, &BoundingBox::new(-20.0, 80.0, 60.0, 60.0)).unwrap();
        assert_eq!(out.dimensions(), (SAMPLE_SIZE, SAMPLE_SIZE));
    }

    #[test]
    fn test_box_outside_frame_skipped() {
        let frame = GrayImage::from_pixel(100, 100, Luma([50]));
        assert!(normalize_face(&frame, &BoundingBox::new(150.0, 150.0, 20.0, 20.0)).is_none());
    }
}
