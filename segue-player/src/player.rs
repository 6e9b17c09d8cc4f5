//! Pipeline assembly
//!
//! Wires cache, downloader, sequencer, prebuffer manager, and scheduler
//! into one [`Player`] and owns the playout ring buffer ends. The audio
//! device (cpal) is attached by the binary, since `cpal::Stream` is
//! thread-bound; the player itself stays headless and fully testable.

use crate::cache::CacheStore;
use crate::clip::{ClipProcessor, ClipSelector};
use crate::download::Downloader;
use crate::error::Result;
use crate::playback::{PlaybackScheduler, PrebufferManager, ReadyQueue, Sequencer};
use crate::playlist::Playlist;
use crate::state::SharedState;
use ringbuf::traits::Split;
use ringbuf::{HeapCons, HeapProd, HeapRb};
use segue_common::{EventBus, Settings};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::info;

/// Playout ring buffer length as a fraction of a second; small enough that
/// skip/seek latency stays imperceptible
const RING_SECONDS: f64 = 0.2;

/// Assembled playback pipeline
pub struct Player {
    pub state: Arc<SharedState>,
    pub settings: Arc<RwLock<Settings>>,
    pub scheduler: Arc<PlaybackScheduler>,
    pub prebuffer: Arc<PrebufferManager>,
    pub queue: Arc<ReadyQueue>,

    producer: Mutex<Option<HeapProd<f32>>>,
    consumer: Mutex<Option<HeapCons<f32>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Player {
    /// Build the pipeline for one session
    ///
    /// `seed` makes clip selection and shuffle order reproducible.
    pub async fn new(settings: Settings, playlist: Playlist, seed: Option<u64>) -> Result<Arc<Self>> {
        settings.validate().map_err(crate::error::Error::from)?;

        let events = EventBus::new(256);
        let state = Arc::new(SharedState::new(events.clone()));

        let cache = Arc::new(CacheStore::open(&settings.cache_dir).await?);
        let downloader = Arc::new(Downloader::new(
            Arc::clone(&cache),
            events.clone(),
            Duration::from_secs(settings.download_timeout_secs),
            settings.download_retries,
        ));

        let sequencer = Arc::new(Mutex::new(Sequencer::new(&playlist, &settings, seed)));
        let queue = Arc::new(ReadyQueue::new());
        let processor = ClipProcessor::new(settings.sample_rate, settings.channels);
        let selector = ClipSelector::new(seed);

        let sample_rate = settings.sample_rate;
        let channels = settings.channels;
        let playlist_len = playlist.len();
        let settings = Arc::new(RwLock::new(settings));

        let prebuffer = Arc::new(PrebufferManager::new(
            Arc::clone(&settings),
            Arc::clone(&sequencer),
            downloader,
            Arc::clone(&queue),
            events,
            processor,
            selector,
            playlist_len,
        ));
        // The fill gate opens on the first play command
        prebuffer.set_suspended(true);

        let scheduler = Arc::new(PlaybackScheduler::new(
            Arc::clone(&state),
            Arc::clone(&settings),
            Arc::clone(&queue),
            Arc::clone(&prebuffer),
            sequencer,
            channels,
        ));

        let ring_capacity =
            ((sample_rate as f64 * RING_SECONDS) as usize * channels as usize).max(1024);
        let (producer, consumer) = HeapRb::<f32>::new(ring_capacity).split();

        info!(
            "Player assembled: {} tracks, {} Hz, {} ch, {} sample ring",
            playlist_len, sample_rate, channels, ring_capacity
        );

        Ok(Arc::new(Self {
            state,
            settings,
            scheduler,
            prebuffer,
            queue,
            producer: Mutex::new(Some(producer)),
            consumer: Mutex::new(Some(consumer)),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Spawn the background tasks (fill loop + render loop)
    pub fn start(&self) {
        let producer = self
            .producer
            .lock()
            .unwrap()
            .take()
            .expect("player already started");

        let prebuffer = Arc::clone(&self.prebuffer);
        let scheduler = Arc::clone(&self.scheduler);

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(prebuffer.run()));
        tasks.push(tokio::spawn(scheduler.render_loop(producer)));
    }

    /// Take the ring buffer consumer for the audio device (or a test drain)
    pub fn take_consumer(&self) -> Option<HeapCons<f32>> {
        self.consumer.lock().unwrap().take()
    }

    /// Stop everything and abort the background tasks
    pub async fn shutdown(&self) {
        info!("Shutting down player");
        self.scheduler.stop().await;
        self.scheduler.shutdown();
        self.prebuffer.shutdown();

        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}
