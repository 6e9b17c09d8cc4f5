//! # Segue playback pipeline (segue-player)
//!
//! Turns an ordered playlist into a continuous, crossfaded audio stream:
//! tracks are downloaded and cached on demand, clips are excerpted and
//! pre-faded ahead of the playback cursor, and consecutive clips blend at
//! their boundaries with complementary envelopes.
//!
//! **Architecture:** background preparation (tokio tasks: reqwest download,
//! symphonia decode, rubato resample) feeding a real-time consumer (cpal
//! callback) through a lock-free ring buffer, with an HTTP/SSE control
//! surface on top.

pub mod api;
pub mod audio;
pub mod cache;
pub mod clip;
pub mod download;
pub mod error;
pub mod playback;
pub mod player;
pub mod playlist;
pub mod state;

pub use error::{Error, Result};
pub use player::Player;
pub use state::SharedState;
