//! Clip boundary selection
//!
//! Given a track's (authoritative, probed) duration and the session
//! settings, picks where the clip starts, how long it runs, and how long
//! its fades are. Selection is seedable so the same seed and inputs always
//! produce the same clip.

use crate::playlist::TrackId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use segue_common::{FadeCurve, Settings};
use std::time::Duration;

/// A fully resolved clip description
///
/// Invariants, enforced at construction:
/// - `start + length <= track duration`
/// - `fade_in <= length / 2` and `fade_out <= length / 2`
#[derive(Debug, Clone, PartialEq)]
pub struct ClipSpec {
    pub track_id: TrackId,
    pub start: Duration,
    pub length: Duration,
    pub fade_in: Duration,
    pub fade_out: Duration,
    pub curve: FadeCurve,
}

impl ClipSpec {
    pub fn end(&self) -> Duration {
        self.start + self.length
    }
}

/// Seedable clip selector
pub struct ClipSelector {
    rng: StdRng,
}

impl ClipSelector {
    /// Create a selector; a seed makes selection reproducible
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    /// Pick a clip from a track
    ///
    /// Full-song mode (no configured clip length, or the track is shorter
    /// than the configured length) plays from the top. Otherwise the start
    /// offset is drawn center-weighted within `[0, duration - length]`:
    /// clips from the middle of a song tend to carry its hook.
    pub fn select(
        &mut self,
        track_id: &TrackId,
        track_duration: Duration,
        settings: &Settings,
    ) -> ClipSpec {
        let (start, length) = match settings.clip_length() {
            Some(configured) if configured < track_duration => {
                let max_start = track_duration - configured;
                // Mean of two uniform draws: triangular, peaked at the center
                let t = (self.rng.gen::<f64>() + self.rng.gen::<f64>()) / 2.0;
                let start = Duration::from_secs_f64(max_start.as_secs_f64() * t);
                (start, configured)
            }
            _ => (Duration::ZERO, track_duration),
        };

        let half = length / 2;
        let fade = settings.crossfade().min(half);

        ClipSpec {
            track_id: track_id.clone(),
            start,
            length,
            fade_in: fade,
            fade_out: fade,
            curve: settings.fade_curve,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(clip_secs: f64, crossfade_secs: f64) -> Settings {
        Settings {
            clip_length_secs: clip_secs,
            crossfade_secs,
            ..Default::default()
        }
    }

    #[test]
    fn test_full_song_mode() {
        let mut selector = ClipSelector::new(Some(1));
        let duration = Duration::from_secs(200);

        let spec = selector.select(&TrackId::from("t"), duration, &settings(0.0, 4.0));
        assert_eq!(spec.start, Duration::ZERO);
        assert_eq!(spec.length, duration);
    }

    #[test]
    fn test_short_track_plays_in_full() {
        let mut selector = ClipSelector::new(Some(1));
        let duration = Duration::from_secs(20);

        let spec = selector.select(&TrackId::from("t"), duration, &settings(30.0, 4.0));
        assert_eq!(spec.start, Duration::ZERO);
        assert_eq!(spec.length, duration);
    }

    #[test]
    fn test_clip_stays_within_track_bounds() {
        let mut selector = ClipSelector::new(Some(42));
        let duration = Duration::from_secs(180);
        let config = settings(30.0, 5.0);

        for _ in 0..500 {
            let spec = selector.select(&TrackId::from("t"), duration, &config);
            assert_eq!(spec.length, Duration::from_secs(30));
            assert!(spec.end() <= duration, "clip end {:?} past track end", spec.end());
        }
    }

    #[test]
    fn test_seeded_selection_is_reproducible() {
        let duration = Duration::from_secs(240);
        let config = settings(30.0, 4.0);

        let mut a = ClipSelector::new(Some(7));
        let mut b = ClipSelector::new(Some(7));

        for _ in 0..20 {
            let spec_a = a.select(&TrackId::from("t"), duration, &config);
            let spec_b = b.select(&TrackId::from("t"), duration, &config);
            assert_eq!(spec_a, spec_b);
        }
    }

    #[test]
    fn test_different_seeds_diverge() {
        let duration = Duration::from_secs(240);
        let config = settings(30.0, 4.0);

        let mut a = ClipSelector::new(Some(1));
        let mut b = ClipSelector::new(Some(2));

        let diverged = (0..20).any(|_| {
            a.select(&TrackId::from("t"), duration, &config)
                != b.select(&TrackId::from("t"), duration, &config)
        });
        assert!(diverged);
    }

    #[test]
    fn test_fades_clamped_to_half_clip() {
        let mut selector = ClipSelector::new(Some(1));
        let duration = Duration::from_secs(100);

        // Crossfade of 4s against a 6s clip: fades clamp to 3s
        let spec = selector.select(&TrackId::from("t"), duration, &settings(6.0, 3.0));
        assert_eq!(spec.fade_in, Duration::from_secs(3));
        assert_eq!(spec.fade_out, Duration::from_secs(3));
        assert!(spec.fade_in + spec.fade_out <= spec.length);
    }

    #[test]
    fn test_fade_within_configured_crossfade() {
        let mut selector = ClipSelector::new(Some(1));
        let duration = Duration::from_secs(100);

        let spec = selector.select(&TrackId::from("t"), duration, &settings(30.0, 5.0));
        assert_eq!(spec.fade_in, Duration::from_secs(5));
        assert_eq!(spec.fade_out, Duration::from_secs(5));
    }
}
