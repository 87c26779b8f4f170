//! Screen / photo presentation heuristic for a single still image.
//!
//! Looks for the largest bright, rectangular, high-contrast region that could
//! be a phone or monitor held up to the camera, then scores it on four
//! independent cues:
//!
//! | cue        | signal                                                |
//! |------------|-------------------------------------------------------|
//! | uniformity | screens are brighter and flatter than skin            |
//! | border     | a bezel concentrates edges along the rectangle's rim  |
//! | moiré      | a photographed pixel grid aliases into spectral peaks |
//! | size       | a phone held close fills much of the frame            |
//!
//! Each cue scores 0–2 and only ever adds to the total. A cue that cannot be
//! computed scores 0. When no screen-like rectangle exists the image is never
//! flagged: a missed spoof is preferred over rejecting a genuine subject.

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::distance_transform::Norm;
use imageproc::geometry::{arc_length, contour_area};
use imageproc::point::Point;

use crate::extractor::FeatureExtractor;
use crate::policy::SpoofPolicy;
use crate::spectrum;

/// Axis-aligned bounds of the best screen-like region, in the coordinates of
/// the (possibly downscaled) analysis image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenCandidate {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Contour area as a fraction of the analysed frame.
    pub area_ratio: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SpoofScores {
    pub uniformity: u32,
    pub border: u32,
    pub moire: u32,
    pub size: u32,
}

impl SpoofScores {
    pub fn total(&self) -> u32 {
        self.uniformity + self.border + self.moire + self.size
    }
}

#[derive(Debug, Clone)]
pub struct SpoofReport {
    pub suspected: bool,
    pub face_present: bool,
    pub candidate: Option<ScreenCandidate>,
    pub scores: SpoofScores,
    /// Total the scores had to reach.
    pub threshold: u32,
}

/// Run the heuristic, detecting faces with `extractor` to pick the threshold.
pub fn check_image(
    extractor: &dyn FeatureExtractor,
    image: &DynamicImage,
    policy: &SpoofPolicy,
) -> SpoofReport {
    let face_present = !extractor.detect_faces(image).is_empty();
    analyze(image, face_present, policy)
}

/// Score one image. `face_present` selects the stricter threshold.
pub fn analyze(image: &DynamicImage, face_present: bool, policy: &SpoofPolicy) -> SpoofReport {
    let threshold = if face_present {
        policy.threshold_with_face
    } else {
        policy.threshold_without_face
    };
    let mut report = SpoofReport {
        suspected: false,
        face_present,
        candidate: None,
        scores: SpoofScores::default(),
        threshold,
    };

    let gray = downscale(image.to_luma8(), policy.max_dimension);
    // Edge detection needs a full 3×3 neighbourhood.
    if gray.width() < 3 || gray.height() < 3 {
        return report;
    }

    let blurred = if policy.blur_sigma > 0.0 {
        imageproc::filter::gaussian_blur_f32(&gray, policy.blur_sigma)
    } else {
        gray.clone()
    };
    let edges = imageproc::edges::canny(&blurred, policy.canny_low, policy.canny_high);
    // Bridge one-pixel gaps Canny leaves at corners so outlines trace closed.
    let outlines = imageproc::morphology::dilate(&edges, Norm::LInf, 1);

    let Some(candidate) = find_screen_candidate(&outlines, policy) else {
        return report;
    };

    let roi = image::imageops::crop_imm(
        &gray,
        candidate.x,
        candidate.y,
        candidate.width,
        candidate.height,
    )
    .to_image();
    let roi_edges = image::imageops::crop_imm(
        &edges,
        candidate.x,
        candidate.y,
        candidate.width,
        candidate.height,
    )
    .to_image();

    let scores = SpoofScores {
        uniformity: uniformity_score(&roi, policy),
        border: border_score(&roi_edges, policy),
        moire: moire_score(&roi, policy),
        size: tier(candidate.area_ratio, policy.area_ratio_tiers),
    };

    report.suspected = scores.total() >= threshold;
    report.candidate = Some(candidate);
    report.scores = scores;

    tracing::debug!(
        face_present,
        uniformity = scores.uniformity,
        border = scores.border,
        moire = scores.moire,
        size = scores.size,
        total = scores.total(),
        threshold,
        suspected = report.suspected,
        "spoof: screen candidate scored"
    );

    report
}

fn downscale(gray: GrayImage, max_dimension: u32) -> GrayImage {
    let (w, h) = gray.dimensions();
    let longest = w.max(h);
    if max_dimension == 0 || longest <= max_dimension {
        return gray;
    }
    let scale = max_dimension as f32 / longest as f32;
    let nw = ((w as f32 * scale) as u32).max(1);
    let nh = ((h as f32 * scale) as u32).max(1);
    image::imageops::resize(&gray, nw, nh, FilterType::Triangle)
}

/// Largest outer contour that is big enough, four-cornered, and shaped like a
/// phone or monitor.
fn find_screen_candidate(outlines: &GrayImage, policy: &SpoofPolicy) -> Option<ScreenCandidate> {
    let frame_area = (outlines.width() as f32) * (outlines.height() as f32);
    let mut best: Option<(f32, ScreenCandidate)> = None;

    for contour in find_contours::<i32>(outlines) {
        if !matches!(contour.border_type, BorderType::Outer) || contour.parent.is_some() {
            continue;
        }
        let area = contour_area(&contour.points) as f32;
        if area < policy.min_area_fraction * frame_area {
            continue;
        }

        let epsilon = policy.polygon_epsilon * arc_length(&contour.points, true) as f32;
        let points: Vec<(f32, f32)> = contour.points.iter().map(to_f32).collect();
        let polygon = approximate_closed_polygon(&points, epsilon);
        if polygon.len() != 4 {
            continue;
        }

        let (min_x, min_y, max_x, max_y) = bounds(&polygon);
        let width = (max_x - min_x) as u32 + 1;
        let height = (max_y - min_y) as u32 + 1;
        let aspect = width as f32 / height as f32;
        if aspect < policy.min_aspect || aspect > policy.max_aspect {
            continue;
        }

        if best.as_ref().map_or(true, |(a, _)| area > *a) {
            best = Some((
                area,
                ScreenCandidate {
                    x: min_x as u32,
                    y: min_y as u32,
                    width,
                    height,
                    area_ratio: area / frame_area,
                },
            ));
        }
    }

    best.map(|(_, candidate)| candidate)
}

fn uniformity_score(roi: &GrayImage, policy: &SpoofPolicy) -> u32 {
    let Some((mean, std)) = mean_std(roi) else {
        return 0;
    };
    let (mean_2, std_2) = policy.uniform_tier_2;
    let (mean_1, std_1) = policy.uniform_tier_1;
    if mean > mean_2 && std < std_2 {
        2
    } else if mean > mean_1 && std < std_1 {
        1
    } else {
        0
    }
}

/// Fraction of edge pixels in the outer band of the region.
fn border_score(roi_edges: &GrayImage, policy: &SpoofPolicy) -> u32 {
    let (w, h) = roi_edges.dimensions();
    let shorter = w.min(h);
    if shorter == 0 {
        return 0;
    }
    let band = ((shorter as f32 * policy.border_band_fraction) as u32)
        .max(policy.border_band_min_px)
        .min(shorter);

    let is_edge = |x: u32, y: u32| roi_edges.get_pixel(x, y).0[0] > 0;
    let mut edge_count = 0usize;
    for y in 0..band {
        for x in 0..w {
            edge_count += is_edge(x, y) as usize + is_edge(x, h - 1 - y) as usize;
        }
    }
    for x in 0..band {
        for y in 0..h {
            edge_count += is_edge(x, y) as usize + is_edge(w - 1 - x, y) as usize;
        }
    }
    let band_area = 2 * (band as usize) * (w as usize) + 2 * (band as usize) * (h as usize);
    let density = edge_count as f32 / band_area.max(1) as f32;
    tier(density, policy.border_density_tiers)
}

fn moire_score(roi: &GrayImage, policy: &SpoofPolicy) -> u32 {
    let peaks = spectrum::centred_grid(roi, policy.spectrum_size)
        .and_then(|grid| spectrum::shifted_magnitude(&grid))
        .map(|spec| {
            spectrum::count_peaks(
                &spec,
                policy.spectrum_mask_radius,
                policy.spectrum_peak_sigma,
                policy.spectrum_candidates,
            )
        })
        .unwrap_or(0);
    let (one, two) = policy.spectrum_peak_tiers;
    if peaks >= two {
        2
    } else if peaks >= one {
        1
    } else {
        0
    }
}

fn tier(value: f32, (level_1, level_2): (f32, f32)) -> u32 {
    if value > level_2 {
        2
    } else if value > level_1 {
        1
    } else {
        0
    }
}

fn mean_std(image: &GrayImage) -> Option<(f32, f32)> {
    let n = (image.width() as usize) * (image.height() as usize);
    if n == 0 {
        return None;
    }
    let (sum, sum_sq) = image.pixels().fold((0f64, 0f64), |(s, sq), p| {
        let v = p.0[0] as f64;
        (s + v, sq + v * v)
    });
    let mean = sum / n as f64;
    let var = (sum_sq / n as f64 - mean * mean).max(0.0);
    Some((mean as f32, var.sqrt() as f32))
}

// ── Geometry helpers ──────────────────────────────────────────────────────────

fn to_f32(p: &Point<i32>) -> (f32, f32) {
    (p.x as f32, p.y as f32)
}

fn bounds(points: &[(f32, f32)]) -> (f32, f32, f32, f32) {
    points.iter().fold(
        (f32::MAX, f32::MAX, f32::MIN, f32::MIN),
        |(min_x, min_y, max_x, max_y), p| {
            (min_x.min(p.0), min_y.min(p.1), max_x.max(p.0), max_y.max(p.1))
        },
    )
}

fn dist(a: (f32, f32), b: (f32, f32)) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// Distance from `p` to the line through `a` and `b`.
fn line_distance(p: (f32, f32), a: (f32, f32), b: (f32, f32)) -> f32 {
    let len = dist(a, b);
    if len <= f32::EPSILON {
        return dist(p, a);
    }
    ((b.0 - a.0) * (a.1 - p.1) - (a.0 - p.0) * (b.1 - a.1)).abs() / len
}

/// Douglas–Peucker simplification of a closed contour.
///
/// The contour is split at the point farthest from its start, each half is
/// simplified independently, and vertices left nearly collinear with their
/// neighbours (such as a start point in the middle of a side) are dropped.
fn approximate_closed_polygon(points: &[(f32, f32)], epsilon: f32) -> Vec<(f32, f32)> {
    if points.len() < 3 {
        return points.to_vec();
    }
    let start = points[0];
    let far = (1..points.len()).fold(0, |best, i| {
        if dist(start, points[i]) > dist(start, points[best]) {
            i
        } else {
            best
        }
    });
    if far == 0 {
        return vec![start];
    }

    let mut polygon = simplify_open(&points[..=far], epsilon);
    let mut back: Vec<(f32, f32)> = points[far..].to_vec();
    back.push(start);
    polygon.extend(simplify_open(&back, epsilon));

    // Drop vertices that sit on the segment joining their neighbours.
    let mut changed = true;
    while changed && polygon.len() > 3 {
        changed = false;
        for i in 0..polygon.len() {
            let n = polygon.len();
            let prev = polygon[(i + n - 1) % n];
            let next = polygon[(i + 1) % n];
            if line_distance(polygon[i], prev, next) <= epsilon {
                polygon.remove(i);
                changed = true;
                break;
            }
        }
    }
    polygon
}

/// Douglas–Peucker over an open polyline. Returns the kept vertices,
/// including the first point and excluding the last.
fn simplify_open(points: &[(f32, f32)], epsilon: f32) -> Vec<(f32, f32)> {
    let n = points.len();
    if n < 2 {
        return points.to_vec();
    }
    let mut keep = vec![false; n];
    keep[0] = true;
    let mut stack = vec![(0usize, n - 1)];
    while let Some((a, b)) = stack.pop() {
        if b <= a + 1 {
            continue;
        }
        let (index, dmax) = ((a + 1)..b).fold((a, 0.0f32), |(bi, bd), i| {
            let d = line_distance(points[i], points[a], points[b]);
            if d > bd {
                (i, d)
            } else {
                (bi, bd)
            }
        });
        if dmax > epsilon {
            keep[index] = true;
            stack.push((a, index));
            stack.push((index, b));
        }
    }
    points[..n - 1]
        .iter()
        .zip(keep.iter())
        .filter(|(_, k)| **k)
        .map(|(p, _)| *p)
        .collect()
}
