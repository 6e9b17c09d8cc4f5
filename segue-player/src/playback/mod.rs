//! Playback pipeline: ordering, preparation, mixing, scheduling

pub mod mixer;
pub mod prebuffer;
pub mod ready_queue;
pub mod scheduler;
pub mod sequencer;

pub use mixer::CrossfadeMixer;
pub use prebuffer::PrebufferManager;
pub use ready_queue::ReadyQueue;
pub use scheduler::PlaybackScheduler;
pub use sequencer::Sequencer;
