use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::PlaybackError;

/// Notifications emitted by the playback element, named after the events UI
/// layers subscribe to
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    LoadStart,
    CanPlay,
    Play,
    Pause,
    Ended,
    Error(String),
    DurationKnown(f64),
    TimeUpdate(f64),
}

impl MediaEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MediaEvent::LoadStart => "load-start",
            MediaEvent::CanPlay => "can-play",
            MediaEvent::Play => "play",
            MediaEvent::Pause => "pause",
            MediaEvent::Ended => "ended",
            MediaEvent::Error(_) => "error",
            MediaEvent::DurationKnown(_) => "duration-known",
            MediaEvent::TimeUpdate(_) => "time-update",
        }
    }
}

pub type EventSender = broadcast::Sender<MediaEvent>;

/// The host's native player.
///
/// Implementations emit [`MediaEvent`]s on the sender passed to `attach`,
/// including for changes they were asked to make (a `play()` call produces a
/// `Play` event), exactly like a browser media element.
#[async_trait]
pub trait MediaElement: Send {
    fn attach(&mut self, events: EventSender);

    /// Assign a URL or file location, or detach with `None`
    fn set_source(&mut self, location: Option<&str>, duration_hint: Option<f64>);

    /// Start buffering the assigned source
    fn load(&mut self);

    async fn play(&mut self) -> Result<(), PlaybackError>;
    fn pause(&mut self);
    fn paused(&self) -> bool;

    fn current_time(&self) -> f64;
    fn set_current_time(&mut self, seconds: f64);
    fn duration(&self) -> Option<f64>;

    fn volume(&self) -> f64;
    fn set_volume(&mut self, volume: f64);
    fn playback_rate(&self) -> f64;
    fn set_playback_rate(&mut self, rate: f64);
}

/// Browsers fire `timeupdate` at roughly this pace
const TIME_UPDATE_INTERVAL: Duration = Duration::from_millis(250);

/// Clock-driven element without audio output.
///
/// Position advances with the Tokio clock while playing. The duration comes
/// from the hint given with the source. While playing, a clock task emits
/// `TimeUpdate` every tick and `Pause` plus `Ended` once the position reaches
/// the duration. `autoplay_switch` models hosts that refuse `play()` until
/// the user has interacted with the page.
pub struct HeadlessElement {
    events: Option<EventSender>,
    source: Option<String>,
    duration: Option<f64>,
    position: f64,
    playing_since: Option<Instant>,
    volume: f64,
    playback_rate: f64,
    autoplay_blocked: Arc<AtomicBool>,
    time_updates: Option<Duration>,
    clock: Option<JoinHandle<()>>,
}

impl HeadlessElement {
    pub fn new() -> Self {
        Self {
            events: None,
            source: None,
            duration: None,
            position: 0.0,
            playing_since: None,
            volume: 1.0,
            playback_rate: 1.0,
            autoplay_blocked: Arc::new(AtomicBool::new(false)),
            time_updates: Some(TIME_UPDATE_INTERVAL),
            clock: None,
        }
    }

    /// Change the `TimeUpdate` pace, or turn periodic updates off with
    /// `None`. The end of the source is announced either way.
    pub fn with_time_updates(mut self, interval: Option<Duration>) -> Self {
        self.time_updates = interval.filter(|i| !i.is_zero());
        self
    }

    /// Shared flag; while set, `play()` fails with `NotAllowed`
    pub fn autoplay_switch(&self) -> Arc<AtomicBool> {
        self.autoplay_blocked.clone()
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    fn emit(&self, event: MediaEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn clamp_to_duration(&self, seconds: f64) -> f64 {
        match self.duration {
            Some(duration) => seconds.min(duration),
            None => seconds,
        }
    }

    /// Fold elapsed play time into `position`
    fn settle(&mut self) {
        if self.playing_since.is_some() {
            self.position = self.current_time();
            self.playing_since = Some(Instant::now());
        }
    }

    /// Playing, but the clock has run past the end of the source
    fn has_ended(&self) -> bool {
        self.playing_since.is_some()
            && self
                .duration
                .is_some_and(|duration| self.current_time() >= duration)
    }

    /// (Re)start the clock task from the current position and rate
    fn start_clock(&mut self) {
        self.stop_clock();
        let (Some(events), Some(since)) = (self.events.clone(), self.playing_since) else {
            return;
        };
        self.clock = Some(tokio::spawn(run_clock(
            events,
            ClockStart {
                since,
                position: self.position,
                rate: self.playback_rate,
                duration: self.duration,
                interval: self.time_updates,
            },
        )));
    }

    fn stop_clock(&mut self) {
        if let Some(clock) = self.clock.take() {
            clock.abort();
        }
    }
}

impl Drop for HeadlessElement {
    fn drop(&mut self) {
        self.stop_clock();
    }
}

struct ClockStart {
    since: Instant,
    position: f64,
    rate: f64,
    duration: Option<f64>,
    interval: Option<Duration>,
}

async fn run_clock(events: EventSender, start: ClockStart) {
    let position_at = |now: Instant| {
        let position = start.position + (now - start.since).as_secs_f64() * start.rate;
        start.duration.map_or(position, |d| position.min(d))
    };
    let end_at = start
        .duration
        .filter(|_| start.rate > 0.0)
        .and_then(|d| Duration::try_from_secs_f64(((d - start.position) / start.rate).max(0.0)).ok())
        .and_then(|remaining| start.since.checked_add(remaining));
    let mut ticks = start.interval.map(|every| {
        let mut ticks = tokio::time::interval_at(start.since + every, every);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticks
    });

    loop {
        match (&mut ticks, end_at) {
            (Some(ticks), Some(end)) => tokio::select! {
                at = ticks.tick() => {
                    let _ = events.send(MediaEvent::TimeUpdate(position_at(at)));
                }
                _ = tokio::time::sleep_until(end) => break,
            },
            (Some(ticks), None) => {
                let at = ticks.tick().await;
                let _ = events.send(MediaEvent::TimeUpdate(position_at(at)));
            }
            (None, Some(end)) => {
                tokio::time::sleep_until(end).await;
                break;
            }
            (None, None) => return,
        }
    }

    if let Some(duration) = start.duration {
        let _ = events.send(MediaEvent::TimeUpdate(duration));
    }
    let _ = events.send(MediaEvent::Pause);
    let _ = events.send(MediaEvent::Ended);
}

impl Default for HeadlessElement {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaElement for HeadlessElement {
    fn attach(&mut self, events: EventSender) {
        self.events = Some(events);
        if self.playing_since.is_some() {
            self.start_clock();
        }
    }

    fn set_source(&mut self, location: Option<&str>, duration_hint: Option<f64>) {
        self.stop_clock();
        self.source = location.map(str::to_string);
        self.duration = location.and(duration_hint).filter(|d| d.is_finite() && *d > 0.0);
        self.position = 0.0;
        self.playing_since = None;
    }

    fn load(&mut self) {
        if self.source.is_none() {
            return;
        }
        self.emit(MediaEvent::LoadStart);
        if let Some(duration) = self.duration {
            self.emit(MediaEvent::DurationKnown(duration));
            self.emit(MediaEvent::CanPlay);
        }
    }

    async fn play(&mut self) -> Result<(), PlaybackError> {
        if self.source.is_none() {
            return Err(PlaybackError::NoSource);
        }
        if self.autoplay_blocked.load(Ordering::SeqCst) {
            return Err(PlaybackError::NotAllowed(
                "playback requires a user interaction first".to_string(),
            ));
        }
        // Playing a finished source starts it over
        if self.has_ended() {
            self.position = 0.0;
            self.playing_since = None;
        }
        if self.playing_since.is_none() {
            self.playing_since = Some(Instant::now());
            self.start_clock();
            self.emit(MediaEvent::Play);
        }
        Ok(())
    }

    fn pause(&mut self) {
        if self.playing_since.is_some() {
            let ended = self.has_ended();
            self.stop_clock();
            self.settle();
            self.playing_since = None;
            // the clock already announced the pause at the end
            if !ended {
                self.emit(MediaEvent::Pause);
            }
        }
    }

    fn paused(&self) -> bool {
        self.playing_since.is_none() || self.has_ended()
    }

    fn current_time(&self) -> f64 {
        let elapsed = self
            .playing_since
            .map_or(0.0, |since| since.elapsed().as_secs_f64() * self.playback_rate);
        self.clamp_to_duration(self.position + elapsed)
    }

    fn set_current_time(&mut self, seconds: f64) {
        let ended = self.has_ended();
        self.position = self.clamp_to_duration(seconds.max(0.0));
        if self.playing_since.is_some() {
            if ended {
                self.playing_since = None;
            } else {
                self.playing_since = Some(Instant::now());
                self.start_clock();
            }
        }
        self.emit(MediaEvent::TimeUpdate(self.position));
    }

    fn duration(&self) -> Option<f64> {
        self.duration
    }

    fn volume(&self) -> f64 {
        self.volume
    }

    fn set_volume(&mut self, volume: f64) {
        self.volume = volume;
    }

    fn playback_rate(&self) -> f64 {
        self.playback_rate
    }

    fn set_playback_rate(&mut self, rate: f64) {
        self.settle();
        self.playback_rate = rate;
        if self.playing_since.is_some() && !self.has_ended() {
            self.start_clock();
        }
    }
}
