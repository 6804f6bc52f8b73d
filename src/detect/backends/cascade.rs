//! Classical cascade detector.
//!
//! A lightweight multi-scale sliding-window detector for devices where the
//! neural backend is unavailable or too expensive. Candidate windows pass
//! through a short cascade of cheap stages (texture variance, then edge
//! density); surviving windows are grouped by overlap and a group must reach
//! `min_neighbors` members to be reported, which rejects isolated noise the
//! same way `detectMultiScale`-style classifiers do.

use anyhow::{anyhow, Result};

use crate::detect::backend::{BackendDetection, DetectorBackend};
use crate::detect::result::{BoundingBox, ObjectClass};

/// Tuning parameters for one cascade instance.
#[derive(Clone, Copy, Debug)]
pub struct CascadeParams {
    /// Multiplier between successive window scales.
    pub scale_factor: f32,
    /// Minimum overlapping candidates required to report a detection.
    pub min_neighbors: usize,
    /// Smallest window side in pixels.
    pub min_size: u32,
    /// Largest window side in pixels.
    pub max_size: u32,
    /// Stage 1: minimum intensity variance inside the window.
    pub min_variance: f32,
    /// Stage 2: minimum fraction of high-gradient pixels inside the window.
    pub min_edge_density: f32,
}

impl CascadeParams {
    /// Stricter secondary profile.
    pub fn strict() -> Self {
        Self {
            scale_factor: 1.15,
            min_neighbors: 3,
            min_size: 30,
            max_size: 300,
            min_variance: 300.0,
            min_edge_density: 0.12,
        }
    }

    /// Looser tertiary profile: larger scale steps and fewer required
    /// neighbors, trading precision for recall and speed.
    pub fn permissive() -> Self {
        Self {
            scale_factor: 1.3,
            min_neighbors: 2,
            min_size: 40,
            max_size: 300,
            min_variance: 150.0,
            min_edge_density: 0.08,
        }
    }
}

pub struct CascadeBackend {
    name: &'static str,
    params: CascadeParams,
}

impl CascadeBackend {
    pub fn strict() -> Self {
        Self {
            name: "cascade-strict",
            params: CascadeParams::strict(),
        }
    }

    pub fn permissive() -> Self {
        Self {
            name: "cascade-permissive",
            params: CascadeParams::permissive(),
        }
    }

    pub fn with_params(name: &'static str, params: CascadeParams) -> Self {
        Self { name, params }
    }

    fn grayscale(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
        let expected = width as usize * height as usize * 3;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        Ok(pixels
            .chunks_exact(3)
            .map(|p| ((p[0] as u32 * 30 + p[1] as u32 * 59 + p[2] as u32 * 11) / 100) as u8)
            .collect())
    }

    fn window_passes(&self, gray: &[u8], width: usize, wx: usize, wy: usize, side: usize) -> bool {
        // Stage 1: texture variance on a sparse sample grid.
        let step = (side / 16).max(1);
        let mut sum = 0u64;
        let mut sum_sq = 0u64;
        let mut n = 0u64;
        for y in (wy..wy + side).step_by(step) {
            for x in (wx..wx + side).step_by(step) {
                let v = gray[y * width + x] as u64;
                sum += v;
                sum_sq += v * v;
                n += 1;
            }
        }
        if n == 0 {
            return false;
        }
        let mean = sum as f32 / n as f32;
        let variance = sum_sq as f32 / n as f32 - mean * mean;
        if variance < self.params.min_variance {
            return false;
        }

        // Stage 2: edge density via horizontal gradient magnitude.
        let mut edges = 0u64;
        let mut total = 0u64;
        for y in (wy..wy + side).step_by(step) {
            for x in (wx..wx + side.saturating_sub(step)).step_by(step) {
                let a = gray[y * width + x] as i32;
                let b = gray[y * width + x + step] as i32;
                if (a - b).abs() > 24 {
                    edges += 1;
                }
                total += 1;
            }
        }
        total > 0 && edges as f32 / total as f32 >= self.params.min_edge_density
    }

    /// Group overlapping candidates; a group must reach `min_neighbors`.
    fn group_candidates(&self, candidates: &[BoundingBox], frame_w: u32, frame_h: u32) -> Vec<BoundingBox> {
        let mut groups: Vec<(BoundingBox, usize)> = Vec::new();
        for cand in candidates {
            match groups.iter_mut().find(|(rep, _)| rep.iou(cand) > 0.3) {
                Some((rep, count)) => {
                    // Running average keeps the representative centered.
                    let k = *count as i32;
                    rep.x = (rep.x * k + cand.x) / (k + 1);
                    rep.y = (rep.y * k + cand.y) / (k + 1);
                    rep.width = (rep.width * k as u32 + cand.width) / (k as u32 + 1);
                    rep.height = (rep.height * k as u32 + cand.height) / (k as u32 + 1);
                    *count += 1;
                }
                None => groups.push((*cand, 1)),
            }
        }

        groups
            .into_iter()
            .filter(|(_, count)| *count >= self.params.min_neighbors)
            .map(|(mut rep, count)| {
                rep.confidence = self.score(&rep, count, frame_w, frame_h);
                rep
            })
            .collect()
    }

    /// Confidence from detection size, frame centrality, and neighbor support.
    fn score(&self, bbox: &BoundingBox, neighbors: usize, frame_w: u32, frame_h: u32) -> f32 {
        let (cx, cy) = bbox.center();
        let dx = cx as f32 - frame_w as f32 / 2.0;
        let dy = cy as f32 - frame_h as f32 / 2.0;
        let max_dist = ((frame_w as f32).powi(2) + (frame_h as f32).powi(2)).sqrt();
        let center_factor = 1.0 - (dx * dx + dy * dy).sqrt() / max_dist;

        let max_area = (self.params.max_size as f32).powi(2);
        let size_factor = (bbox.area() as f32 / max_area).min(1.0);

        let neighbor_bonus = ((neighbors - self.params.min_neighbors) as f32 * 0.02).min(0.1);

        (0.6 + 0.2 * center_factor + 0.2 * size_factor + neighbor_bonus).clamp(0.0, 1.0)
    }
}

impl DetectorBackend for CascadeBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<BackendDetection>> {
        let gray = Self::grayscale(pixels, width, height)?;
        let w = width as usize;
        let h = height as usize;

        let mut candidates = Vec::new();
        let mut side = self.params.min_size as usize;
        let max_side = (self.params.max_size as usize).min(w.min(h));

        while side <= max_side {
            let stride = (side / 4).max(1);
            let mut wy = 0;
            while wy + side <= h {
                let mut wx = 0;
                while wx + side <= w {
                    if self.window_passes(&gray, w, wx, wy, side) {
                        candidates.push(BoundingBox::new(
                            wx as i32,
                            wy as i32,
                            side as u32,
                            side as u32,
                            0.0,
                        ));
                    }
                    wx += stride;
                }
                wy += stride;
            }
            let next = (side as f32 * self.params.scale_factor) as usize;
            side = next.max(side + 1);
        }

        Ok(self
            .group_candidates(&candidates, width, height)
            .into_iter()
            .map(|bbox| BackendDetection {
                bbox,
                class: ObjectClass::Cat,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_frame(width: u32, height: u32, value: u8) -> Vec<u8> {
        vec![value; width as usize * height as usize * 3]
    }

    /// Frame with a textured square that the cascade stages respond to.
    fn textured_frame(width: u32, height: u32, x0: usize, y0: usize, side: usize) -> Vec<u8> {
        let mut pixels = flat_frame(width, height, 32);
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                // Checkerboard: high variance and high edge density.
                let v = if (x / 4 + y / 4) % 2 == 0 { 220 } else { 20 };
                let idx = (y * width as usize + x) * 3;
                pixels[idx] = v;
                pixels[idx + 1] = v;
                pixels[idx + 2] = v;
            }
        }
        pixels
    }

    #[test]
    fn flat_scene_produces_no_detections() {
        let mut backend = CascadeBackend::permissive();
        let out = backend.detect(&flat_frame(160, 120, 90), 160, 120).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn textured_region_is_detected_near_its_location() {
        let mut backend = CascadeBackend::permissive();
        let pixels = textured_frame(160, 120, 40, 30, 64);
        let out = backend.detect(&pixels, 160, 120).unwrap();
        assert!(!out.is_empty(), "expected at least one detection");

        let hit = out
            .iter()
            .any(|d| {
                let (cx, cy) = d.bbox.center();
                (40..=104).contains(&cx) && (30..=94).contains(&cy)
            });
        assert!(hit, "detection center should fall inside the textured square");
    }

    #[test]
    fn strict_profile_reports_no_more_than_permissive() {
        let pixels = textured_frame(160, 120, 40, 30, 64);
        let strict = CascadeBackend::strict().detect(&pixels, 160, 120).unwrap();
        let permissive = CascadeBackend::permissive().detect(&pixels, 160, 120).unwrap();
        assert!(strict.len() <= permissive.len());
    }

    #[test]
    fn neighbor_requirement_gates_reports() {
        let pixels = textured_frame(160, 120, 40, 30, 64);
        let mut lenient = CascadeBackend::with_params(
            "cascade-lenient",
            CascadeParams {
                min_neighbors: 1,
                ..CascadeParams::permissive()
            },
        );
        let mut demanding = CascadeBackend::with_params(
            "cascade-demanding",
            CascadeParams {
                min_neighbors: 500,
                ..CascadeParams::permissive()
            },
        );
        assert_eq!(lenient.name(), "cascade-lenient");
        assert!(!lenient.detect(&pixels, 160, 120).unwrap().is_empty());
        assert!(demanding.detect(&pixels, 160, 120).unwrap().is_empty());
    }

    #[test]
    fn rejects_wrong_buffer_size() {
        let mut backend = CascadeBackend::strict();
        assert!(backend.detect(&[0u8; 10], 160, 120).is_err());
    }
}
