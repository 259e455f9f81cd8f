//! Headless devices: simulated players, displays and participants.
//!
//! Paired with an accelerated [`dyadsync_timing::SimulatedTimer`] these run a
//! whole timeline in a fraction of its wall-clock length.

use crate::error::ResourceError;
use crate::phase::{P1_KEYS, P2_KEYS};
use crate::resources::{
    Content, DurationProbe, InputSource, KeyPress, PlaybackChannel, Prompt, ResourceProvider,
    Surfaces, VideoFrame,
};
use dyadsync_core::Participant;
use dyadsync_timing::{Nanos, SharedTimer, SyncTarget, to_nanos};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SimProvider {
    timer: SharedTimer,
    durations: HashMap<String, f64>,
    default_duration: f64,
    missing: HashSet<String>,
    load_delay: Duration,
    fps: f64,
    opened: Arc<AtomicUsize>,
}

impl SimProvider {
    pub fn new(timer: SharedTimer) -> Self {
        Self {
            timer,
            durations: HashMap::new(),
            default_duration: 2.0,
            missing: HashSet::new(),
            load_delay: Duration::ZERO,
            fps: 30.0,
            opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_duration(mut self, path: impl Into<String>, secs: f64) -> Self {
        self.durations.insert(path.into(), secs);
        self
    }

    pub fn with_default_duration(mut self, secs: f64) -> Self {
        self.default_duration = secs;
        self
    }

    pub fn with_missing(mut self, path: impl Into<String>) -> Self {
        self.missing.insert(path.into());
        self
    }

    /// Real time each channel spends in `prepare`.
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Channels created so far, shared between clones.
    pub fn channels_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    fn duration_of(&self, path: &str) -> f64 {
        self.durations
            .get(path)
            .copied()
            .unwrap_or(self.default_duration)
    }
}

impl ResourceProvider for SimProvider {
    fn create_channel(
        &self,
        path: &Path,
        output_index: usize,
    ) -> Result<Box<dyn PlaybackChannel>, ResourceError> {
        let key = path.to_string_lossy();
        if !self.media_exists(path) {
            return Err(ResourceError::MediaNotFound(path.to_path_buf()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimChannel {
            timer: self.timer.clone(),
            output: output_index,
            duration: self.duration_of(&key),
            fps: self.fps,
            load_delay: self.load_delay,
            prepared: false,
            armed: None,
            started: None,
            next_frame: 0,
            stopped: false,
        }))
    }

    fn media_exists(&self, path: &Path) -> bool {
        !self.missing.contains(path.to_string_lossy().as_ref())
    }
}

impl DurationProbe for SimProvider {
    fn probe(&self, path: &str) -> Option<f64> {
        (!self.missing.contains(path)).then(|| self.duration_of(path))
    }
}

#[derive(Debug)]
pub struct SimChannel {
    timer: SharedTimer,
    output: usize,
    duration: f64,
    fps: f64,
    load_delay: Duration,
    prepared: bool,
    armed: Option<Nanos>,
    started: Option<Nanos>,
    next_frame: u64,
    stopped: bool,
}

impl SimChannel {
    fn elapsed_secs(&self) -> Option<f64> {
        self.started
            .map(|s| self.timer.now().saturating_sub(s) as f64 / 1e9)
    }
}

impl SyncTarget for SimChannel {
    fn arm(&mut self, at: Nanos) {
        self.armed = Some(at);
    }

    fn armed_at(&self) -> Option<Nanos> {
        self.armed
    }

    fn trigger(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.armed = None;
        if !self.prepared {
            return Err(format!("output {} triggered before prepare", self.output).into());
        }
        self.started = Some(self.timer.now());
        Ok(())
    }
}

impl PlaybackChannel for SimChannel {
    fn prepare(&mut self) -> Result<(), ResourceError> {
        if !self.load_delay.is_zero() {
            std::thread::sleep(self.load_delay);
        }
        self.prepared = true;
        Ok(())
    }

    fn get_frame(&mut self) -> Option<VideoFrame> {
        let elapsed = self.elapsed_secs()?;
        if self.stopped || elapsed >= self.duration {
            return None;
        }
        let due = (elapsed * self.fps) as u64;
        if due < self.next_frame {
            return None;
        }
        self.next_frame = due + 1;
        Some(VideoFrame {
            index: due,
            pts: due as f64 / self.fps,
        })
    }

    fn is_finished(&self) -> bool {
        self.stopped || self.elapsed_secs().is_some_and(|e| e >= self.duration)
    }

    fn duration_secs(&self) -> Option<f64> {
        Some(self.duration)
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}

#[derive(Debug, Clone, Default)]
pub struct SurfaceRecord {
    pub shown: Vec<(Participant, Content)>,
    pub frames: [u64; 2],
}

/// Records what would have been drawn. Clones share one record.
#[derive(Debug, Clone, Default)]
pub struct SimSurfaces(Arc<Mutex<SurfaceRecord>>);

impl SimSurfaces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self) -> SurfaceRecord {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Surfaces for SimSurfaces {
    fn show(&mut self, who: Participant, content: Content) {
        let mut record = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        record.shown.push((who, content));
    }

    fn present(&mut self, who: Participant, _frame: &VideoFrame) {
        let mut record = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        record.frames[usize::from(who.number() - 1)] += 1;
    }
}

/// Replays key presses at fixed timer readings.
#[derive(Debug, Clone, Default)]
pub struct ScriptedInput {
    queue: Vec<KeyPress>,
}

impl ScriptedInput {
    pub fn new(presses: impl IntoIterator<Item = (Duration, &'static str)>) -> Self {
        let mut queue: Vec<KeyPress> = presses
            .into_iter()
            .map(|(at, key)| KeyPress::new(key, to_nanos(at)))
            .collect();
        queue.sort_by_key(|p| p.at);
        Self { queue }
    }
}

impl InputSource for ScriptedInput {
    fn poll(&mut self, now: Nanos) -> Vec<KeyPress> {
        let split = self.queue.partition_point(|p| p.at <= now);
        self.queue.drain(..split).collect()
    }
}

/// Answers every prompt after a fixed delay; rating values are drawn from a seeded generator.
#[derive(Debug, Clone)]
pub struct AutoResponder {
    rng: ChaCha8Rng,
    delay: Duration,
    pending: Vec<KeyPress>,
}

impl AutoResponder {
    pub fn new(seed: u64, delay: Duration) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            delay,
            pending: Vec::new(),
        }
    }
}

impl InputSource for AutoResponder {
    fn expect(&mut self, prompt: &Prompt, now: Nanos) {
        let at = now.saturating_add(to_nanos(self.delay));
        match prompt {
            Prompt::AnyKey => self.pending.push(KeyPress::new("space", at)),
            Prompt::Key(key) => self.pending.push(KeyPress::new(key.clone(), at)),
            Prompt::Rating {
                scale_min,
                scale_max,
            } => {
                let points = (scale_max - scale_min + 1).clamp(1, P1_KEYS.len() as i64) as usize;
                let p1 = self.rng.random_range(0..points);
                let p2 = self.rng.random_range(0..points);
                self.pending.push(KeyPress::new(P1_KEYS[p1], at));
                self.pending.push(KeyPress::new(P2_KEYS[p2], at + to_nanos(self.delay) / 2));
            }
        }
    }

    fn poll(&mut self, now: Nanos) -> Vec<KeyPress> {
        let (due, later): (Vec<_>, Vec<_>) = self.pending.drain(..).partition(|p| p.at <= now);
        self.pending = later;
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dyadsync_timing::{SimulatedTimer, Timer};

    #[test]
    fn channel_plays_for_its_duration() {
        let timer = SimulatedTimer::new();
        let provider = SimProvider::new(timer.shared()).with_duration("a.mp4", 1.0);
        let mut ch = provider.create_channel(Path::new("a.mp4"), 0).unwrap();
        assert!(ch.trigger().is_err());

        ch.prepare().unwrap();
        ch.arm(0);
        ch.trigger().unwrap();
        assert_eq!(ch.get_frame().map(|f| f.index), Some(0));
        assert!(ch.get_frame().is_none());

        timer.sleep(Duration::from_millis(500));
        assert_eq!(ch.get_frame().map(|f| f.index), Some(15));
        assert!(!ch.is_finished());
        timer.sleep(Duration::from_millis(500));
        assert!(ch.is_finished());
    }

    #[test]
    fn missing_media_fails_to_open() {
        let timer = SimulatedTimer::new();
        let provider = SimProvider::new(timer.shared()).with_missing("gone.mp4");
        assert!(matches!(
            provider.create_channel(Path::new("gone.mp4"), 1),
            Err(ResourceError::MediaNotFound(_))
        ));
        assert_eq!(provider.probe("gone.mp4"), None);
        assert_eq!(provider.probe("other.mp4"), Some(2.0));
    }

    #[test]
    fn scripted_input_releases_presses_in_time() {
        let mut input = ScriptedInput::new([
            (Duration::from_millis(20), "q"),
            (Duration::from_millis(10), "1"),
        ]);
        assert!(input.poll(5_000_000).is_empty());
        assert_eq!(input.poll(15_000_000)[0].key, "1");
        assert_eq!(input.poll(25_000_000)[0].key, "q");
    }

    #[test]
    fn auto_responder_answers_ratings_for_both() {
        let mut input = AutoResponder::new(3, Duration::from_millis(100));
        input.expect(&Prompt::Rating { scale_min: 1, scale_max: 7 }, 0);
        let first = input.poll(100_000_000);
        assert_eq!(first.len(), 1);
        assert!(P1_KEYS[..7].contains(&first[0].key.as_str()));
        let second = input.poll(150_000_000);
        assert!(P2_KEYS[..7].contains(&second[0].key.as_str()));
        assert!(input.poll(u64::MAX).is_empty());
    }
}
