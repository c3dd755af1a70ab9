//! Canonical face alignment for the embedding model.
//!
//! ArcFace expects faces warped to a fixed 112x112 layout. The warp is a
//! 4-DOF similarity transform (scale, rotation, translation) estimated by
//! least squares from the detector's five landmarks to the InsightFace
//! reference positions.

/// ArcFace reference landmarks for a 112x112 crop.
const REFERENCE_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

/// Side length of the aligned output crop.
pub const ALIGNED_SIZE: usize = 112;

/// Warp a face region of a grayscale frame into the canonical 112x112 crop.
pub fn align_face(
    frame: &[u8],
    width: u32,
    height: u32,
    landmarks: &[(f32, f32); 5],
) -> Vec<u8> {
    let m = similarity_transform(landmarks, &REFERENCE_LANDMARKS);
    warp_affine(frame, width as usize, height as usize, &m)
}

/// Estimate the 2x3 similarity transform mapping `src` onto `dst`.
///
/// Solves the overdetermined system for [a, b, tx, ty] where the matrix is
/// `[[a, -b, tx], [b, a, ty]]`, via normal equations and a 4x4 Gaussian
/// elimination. Returns the matrix row-major as [a, -b, tx, b, a, ty].
fn similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> [f32; 6] {
    let mut ata = [0.0f32; 16];
    let mut atb = [0.0f32; 4];

    for i in 0..5 {
        let (sx, sy) = src[i];
        let (dx, dy) = dst[i];

        // sx*a - sy*b + tx = dx   and   sy*a + sx*b + ty = dy
        let rows = [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)];
        for (row, rhs) in rows {
            for j in 0..4 {
                for k in 0..4 {
                    ata[j * 4 + k] += row[j] * row[k];
                }
                atb[j] += row[j] * rhs;
            }
        }
    }

    let [a, b, tx, ty] = solve_linear_4(&ata, &atb);
    [a, -b, tx, b, a, ty]
}

/// Solve a 4x4 linear system with partial pivoting.
///
/// A degenerate system (all landmarks collinear or coincident) falls back
/// to the identity solution rather than producing NaNs.
fn solve_linear_4(ata: &[f32; 16], atb: &[f32; 4]) -> [f32; 4] {
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        for j in 0..4 {
            m[i][j] = ata[i * 4 + j];
        }
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let mut pivot_row = col;
        for row in (col + 1)..4 {
            if m[row][col].abs() > m[pivot_row][col].abs() {
                pivot_row = row;
            }
        }
        m.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return [1.0, 0.0, 0.0, 0.0];
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }
    x
}

/// Apply the inverse of a 2x3 similarity warp, sampling with bilinear
/// interpolation. Pixels mapping outside the source are black.
fn warp_affine(frame: &[u8], src_width: usize, src_height: usize, matrix: &[f32; 6]) -> Vec<u8> {
    let (a, tx, b, ty) = (matrix[0], matrix[2], matrix[3], matrix[5]);

    // Inverse of [[a, -b], [b, a]] scaled by 1/(a^2 + b^2).
    let det = a * a + b * b;
    if det.abs() < 1e-12 {
        return vec![0u8; ALIGNED_SIZE * ALIGNED_SIZE];
    }
    let ia = a / det;
    let ib = b / det;

    let mut output = vec![0u8; ALIGNED_SIZE * ALIGNED_SIZE];

    let sample = |x: i32, y: i32| -> f32 {
        if x >= 0 && x < src_width as i32 && y >= 0 && y < src_height as i32 {
            frame[y as usize * src_width + x as usize] as f32
        } else {
            0.0
        }
    };

    for oy in 0..ALIGNED_SIZE {
        for ox in 0..ALIGNED_SIZE {
            let dx = ox as f32 - tx;
            let dy = oy as f32 - ty;
            let sx = ia * dx + ib * dy;
            let sy = -ib * dx + ia * dy;

            let x0 = sx.floor() as i32;
            let y0 = sy.floor() as i32;
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let val = sample(x0, y0) * (1.0 - fx) * (1.0 - fy)
                + sample(x0 + 1, y0) * fx * (1.0 - fy)
                + sample(x0, y0 + 1) * (1.0 - fx) * fy
                + sample(x0 + 1, y0 + 1) * fx * fy;

            output[oy * ALIGNED_SIZE + ox] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_when_src_equals_dst() {
        let m = similarity_transform(&REFERENCE_LANDMARKS, &REFERENCE_LANDMARKS);
        assert!((m[0] - 1.0).abs() < 1e-4, "a = {}", m[0]);
        assert!(m[1].abs() < 1e-4, "-b = {}", m[1]);
        assert!(m[2].abs() < 1e-3, "tx = {}", m[2]);
        assert!((m[4] - 1.0).abs() < 1e-4);
        assert!(m[5].abs() < 1e-3, "ty = {}", m[5]);
    }

    #[test]
    fn test_double_scale_source() {
        // Landmarks at 2x scale should estimate a ~0.5 scale factor.
        let src: [(f32, f32); 5] = std::array::from_fn(|i| {
            let (x, y) = REFERENCE_LANDMARKS[i];
            (x * 2.0, y * 2.0)
        });
        let m = similarity_transform(&src, &REFERENCE_LANDMARKS);
        assert!((m[0] - 0.5).abs() < 0.05, "a = {}", m[0]);
    }

    #[test]
    fn test_degenerate_landmarks_fall_back() {
        let src = [(10.0, 10.0); 5];
        let m = similarity_transform(&src, &REFERENCE_LANDMARKS);
        assert!(m.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_aligned_output_size() {
        let frame = vec![128u8; 640 * 480];
        let aligned = align_face(&frame, 640, 480, &REFERENCE_LANDMARKS);
        assert_eq!(aligned.len(), ALIGNED_SIZE * ALIGNED_SIZE);
    }

    #[test]
    fn test_bright_patch_lands_at_reference() {
        // Paint a patch at the source left-eye landmark and check it ends
        // up near the reference left-eye position after warping.
        let (w, h) = (200usize, 200usize);
        let mut frame = vec![0u8; w * h];

        let src: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];

        let (lx, ly) = (src[0].0 as usize, src[0].1 as usize);
        for dy in 0..5 {
            for dx in 0..5 {
                let px = lx - 2 + dx;
                let py = ly - 2 + dy;
                frame[py * w + px] = 255;
            }
        }

        let aligned = align_face(&frame, w as u32, h as u32, &src);

        let ref_x = REFERENCE_LANDMARKS[0].0.round() as usize;
        let ref_y = REFERENCE_LANDMARKS[0].1.round() as usize;
        let mut max_val = 0u8;
        for dy in 0..3 {
            for dx in 0..3 {
                let x = ref_x - 1 + dx;
                let y = ref_y - 1 + dy;
                if x < ALIGNED_SIZE && y < ALIGNED_SIZE {
                    max_val = max_val.max(aligned[y * ALIGNED_SIZE + x]);
                }
            }
        }
        assert!(max_val > 100, "expected bright patch near ({ref_x}, {ref_y}), max={max_val}");
    }
}
