use bytemuck::{Pod, Zeroable};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

/// Hard capacity of each GPU particle buffer. Buffers are always allocated at
/// this size; a smaller live population only narrows dispatch and draw extents.
pub const MAX_PARTICLES: usize = 100_000;

/// Population sizes offered by the settings UI.
pub const PRESET_COUNTS: [usize; 4] = [100, 1_000, 10_000, 100_000];

/// Opaque fully-saturated hues used by [`Coloring::Colorful`].
pub const COLORFUL_PALETTE: [[f32; 4]; 4] = [
    [1.0, 0.0, 0.0, 1.0],
    [1.0, 0.6, 0.2, 1.0],
    [0.0, 0.0, 1.0, 1.0],
    [1.0, 0.0, 1.0, 1.0],
];

/// White opacity levels used by [`Coloring::Monochrome`].
pub const MONOCHROME_ALPHAS: [f32; 4] = [0.2, 0.4, 0.6, 0.8];

/// One particle record, laid out to match the WGSL `Particle` struct
/// (vec4 color, vec2 position, vec2 velocity, f32 phase; 48-byte array stride).
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct Particle {
    pub color: [f32; 4],
    pub position: [f32; 2],
    pub velocity: [f32; 2],
    pub phase: f32,
    pub _pad: [f32; 3],
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Coloring {
    #[default]
    Colorful,
    Monochrome,
}

/// Immutable settings snapshot produced by the UI collaborator. Each apply
/// fully replaces the particle population; there is no incremental diff.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub coloring: Coloring,
    pub particle_count: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            coloring: Coloring::default(),
            particle_count: PRESET_COUNTS[1],
        }
    }
}

/// Render target size in device pixels. Spawn positions are bounded by it and
/// the render stage maps world coordinates through it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Half extents, truncated the way the spawn bounds are defined
    /// (integer halving before the float conversion).
    pub fn half_extent(&self) -> (f32, f32) {
        ((self.width / 2) as f32, (self.height / 2) as f32)
    }
}

/// Sample a fresh population for the given settings.
///
/// Pure value generation with no dependency on prior frames, unlike the
/// simulation pass. Safe to call from any thread.
pub fn spawn(settings: &Settings, viewport: Viewport) -> Vec<Particle> {
    let count = settings.particle_count.min(MAX_PARTICLES);
    let (half_w, half_h) = viewport.half_extent();
    let coloring = settings.coloring;
    (0..count)
        .into_par_iter()
        .map(|_| sample_one(coloring, half_w, half_h))
        .collect()
}

fn sample_one(coloring: Coloring, half_w: f32, half_h: f32) -> Particle {
    let color = match coloring {
        Coloring::Colorful => COLORFUL_PALETTE[fastrand::usize(..COLORFUL_PALETTE.len())],
        Coloring::Monochrome => {
            let alpha = MONOCHROME_ALPHAS[fastrand::usize(..MONOCHROME_ALPHAS.len())];
            [1.0, 1.0, 1.0, alpha]
        }
    };
    Particle {
        color,
        position: [
            uniform(-half_w, half_w),
            uniform(-half_h, half_h),
        ],
        velocity: [0.0, uniform(-10.0, -1.0)],
        phase: uniform(-std::f32::consts::PI, std::f32::consts::PI),
        _pad: [0.0; 3],
    }
}

fn uniform(lo: f32, hi: f32) -> f32 {
    lo + (hi - lo) * fastrand::f32()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn particle_stride_matches_shader_layout() {
        assert_eq!(std::mem::size_of::<Particle>(), 48);
    }

    #[test]
    fn spawn_produces_requested_count() {
        let settings = Settings {
            coloring: Coloring::Monochrome,
            particle_count: 257,
        };
        assert_eq!(spawn(&settings, Viewport::new(640, 480)).len(), 257);
    }

    #[test]
    fn spawn_clamps_to_capacity() {
        let settings = Settings {
            coloring: Coloring::Colorful,
            particle_count: MAX_PARTICLES + 1,
        };
        assert_eq!(spawn(&settings, Viewport::new(100, 100)).len(), MAX_PARTICLES);
    }

    #[test]
    fn spawn_with_zero_count_is_empty() {
        let settings = Settings {
            coloring: Coloring::Colorful,
            particle_count: 0,
        };
        assert!(spawn(&settings, Viewport::new(800, 600)).is_empty());
    }

    #[test]
    fn colorful_spawn_stays_in_bounds_with_palette_colors() {
        let settings = Settings {
            coloring: Coloring::Colorful,
            particle_count: 1000,
        };
        let population = spawn(&settings, Viewport::new(800, 600));
        assert_eq!(population.len(), 1000);
        for p in &population {
            assert!(p.position[0] >= -400.0 && p.position[0] < 400.0);
            assert!(p.position[1] >= -300.0 && p.position[1] < 300.0);
            assert!(
                COLORFUL_PALETTE.contains(&p.color),
                "color {:?} is not a palette entry",
                p.color
            );
            assert_eq!(p.color[3], 1.0);
            assert_eq!(p.velocity[0], 0.0);
            assert!(p.velocity[1] >= -10.0 && p.velocity[1] <= -1.0);
            assert!(p.phase >= -std::f32::consts::PI && p.phase <= std::f32::consts::PI);
        }
    }

    #[test]
    fn monochrome_spawn_is_white_at_fixed_opacities() {
        let settings = Settings {
            coloring: Coloring::Monochrome,
            particle_count: 500,
        };
        for p in spawn(&settings, Viewport::new(320, 240)) {
            assert_eq!(p.color[..3], [1.0, 1.0, 1.0]);
            assert!(MONOCHROME_ALPHAS.contains(&p.color[3]));
        }
    }

    #[test]
    fn resize_bounds_apply_to_the_next_spawn() {
        let settings = Settings {
            coloring: Coloring::Colorful,
            particle_count: 2000,
        };
        // A population sampled before a resize keeps the old bounds; only the
        // next sampling sees the new viewport.
        let before = spawn(&settings, Viewport::new(800, 600));
        let after = spawn(&settings, Viewport::new(1024, 768));
        for p in &before {
            assert!(p.position[0] >= -400.0 && p.position[0] < 400.0);
        }
        for p in &after {
            assert!(p.position[0] >= -512.0 && p.position[0] < 512.0);
            assert!(p.position[1] >= -384.0 && p.position[1] < 384.0);
        }
    }

    #[test]
    fn reapplying_settings_yields_fresh_but_equivalent_populations() {
        let settings = Settings {
            coloring: Coloring::Colorful,
            particle_count: 1000,
        };
        let viewport = Viewport::new(800, 600);
        let first = spawn(&settings, viewport);
        let second = spawn(&settings, viewport);
        assert_eq!(first.len(), second.len());
        for p in first.iter().chain(second.iter()) {
            assert!(COLORFUL_PALETTE.contains(&p.color));
        }
        // Sampling is random; two draws of 1000 particles are not bit-identical.
        assert_ne!(first, second);
    }
}
