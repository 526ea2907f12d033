//! **Filler cues** — mask inference latency with a short stalling clip.
//!
//! A one-shot timer is armed when a remote call starts. Fast answers disarm it and
//! nothing plays. If the timer fires first, a random clip plays; an answer that
//! lands while it is playing is held as the single [`PendingAnswer`] and released a
//! grace period after the clip ends.

use crate::config::FillerConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::inference::{InferenceReply, RequestOrigin};
use rand::seq::SliceRandom;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Timer state for one pending remote call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillerWindow {
    pub armed_at: Instant,
    pub fired_at: Option<Instant>,
    /// Clip currently playing
    pub active: bool,
}

/// A filler clip to play now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillerCue {
    /// Validated against late completion callbacks
    pub id: u64,
    pub clip: String,
}

/// Resolved reply waiting for the filler to finish
#[derive(Debug, Clone)]
pub struct PendingAnswer {
    pub turn: u64,
    pub origin: RequestOrigin,
    pub reply: InferenceReply,
}

pub struct FillerScheduler {
    config: FillerConfig,
    window: Option<FillerWindow>,
    current_cue: Option<u64>,
    next_cue: u64,
    played_this_turn: bool,
    pending: Option<PendingAnswer>,
    release_at: Option<Instant>,
}

impl FillerScheduler {
    pub fn new(config: FillerConfig) -> Self {
        Self {
            config,
            window: None,
            current_cue: None,
            next_cue: 0,
            played_this_turn: false,
            pending: None,
            release_at: None,
        }
    }

    /// Start the delay timer for a new remote call. Re-arming resets; it never stacks.
    pub fn arm(&mut self, now: Instant) {
        if self.window.is_some() {
            debug!("Filler: re-armed, previous window dropped");
        }
        self.window = Some(FillerWindow {
            armed_at: now,
            fired_at: None,
            active: false,
        });
        self.current_cue = None;
        self.played_this_turn = false;
        self.drop_pending();
    }

    /// The call resolved. Cancels the timer if it hasn't fired; a clip already
    /// playing keeps playing. Returns whether a clip is playing.
    pub fn disarm(&mut self) -> bool {
        match &self.window {
            Some(w) if w.active => true,
            Some(_) => {
                self.window = None;
                false
            }
            None => false,
        }
    }

    /// Fire the timer if due. `call_outstanding` and `paused` are checked at fire time.
    pub fn poll(&mut self, now: Instant, call_outstanding: bool, paused: bool) -> Option<FillerCue> {
        let window = self.window.as_mut()?;
        if window.fired_at.is_some()
            || now.saturating_duration_since(window.armed_at) < self.config.delay()
        {
            return None;
        }

        if !call_outstanding || paused {
            self.window = None;
            return None;
        }

        let Some(clip) = self.config.clips.choose(&mut rand::thread_rng()).cloned() else {
            warn!("Filler: timer fired but no clips are configured");
            self.window = None;
            return None;
        };

        window.fired_at = Some(now);
        window.active = true;
        self.next_cue += 1;
        self.current_cue = Some(self.next_cue);
        self.played_this_turn = true;

        info!("⏳ Filler cue {} ({})", self.next_cue, clip);
        Some(FillerCue {
            id: self.next_cue,
            clip,
        })
    }

    /// Route a resolved answer. Returns it back when it may play now; holds it while
    /// a clip is playing.
    pub fn hold(&mut self, answer: PendingAnswer) -> Option<PendingAnswer> {
        if !self.is_active() {
            return Some(answer);
        }
        if let Some(previous) = self.pending.replace(answer) {
            warn!("Filler: replacing pending answer for turn {}", previous.turn);
        }
        debug!("Filler: answer held until the clip ends");
        None
    }

    /// The clip with `id` finished. Stale ids are rejected.
    pub fn on_filler_ended(&mut self, id: u64, now: Instant) -> VoiceResult<()> {
        if self.current_cue != Some(id) {
            return Err(VoiceError::StaleEventIgnored {
                kind: "filler",
                got: id,
                current: self.current_cue,
            });
        }
        self.current_cue = None;
        if let Some(w) = self.window.as_mut() {
            w.active = false;
        }
        if self.pending.is_some() {
            self.release_at = Some(now + self.config.grace());
            debug!("Filler: pending answer released in {:?}", self.config.grace());
        }
        Ok(())
    }

    /// Take the held answer once its grace delay has passed.
    pub fn take_due(&mut self, now: Instant) -> Option<PendingAnswer> {
        match self.release_at {
            Some(at) if now >= at => {
                self.release_at = None;
                self.window = None;
                self.pending.take()
            }
            _ => None,
        }
    }

    /// Cancel everything: timer, clip bookkeeping and the pending answer.
    pub fn discard(&mut self) {
        self.window = None;
        self.current_cue = None;
        self.drop_pending();
    }

    fn drop_pending(&mut self) {
        if let Some(p) = self.pending.take() {
            debug!("Filler: discarded pending answer for turn {}", p.turn);
        }
        self.release_at = None;
    }

    /// A clip is playing right now
    pub fn is_active(&self) -> bool {
        self.window.as_ref().is_some_and(|w| w.active)
    }

    /// A timer is armed and has not fired yet
    pub fn is_armed(&self) -> bool {
        self.window.as_ref().is_some_and(|w| w.fired_at.is_none())
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn played_this_turn(&self) -> bool {
        self.played_this_turn
    }

    /// Id of the clip currently owed an end event
    pub fn current_cue(&self) -> Option<u64> {
        self.current_cue
    }

    pub fn window(&self) -> Option<&FillerWindow> {
        self.window.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::UtteranceMode;
    use std::time::Duration;

    fn answer(turn: u64) -> PendingAnswer {
        PendingAnswer {
            turn,
            origin: RequestOrigin::Voice(UtteranceMode::Normal),
            reply: InferenceReply {
                reply: format!("answer {turn}"),
                audio_url: Some("/audio/a.wav".into()),
                ..Default::default()
            },
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn fast_answer_plays_no_filler() {
        let t0 = Instant::now();
        let mut f = FillerScheduler::new(FillerConfig::default());
        f.arm(t0);
        assert!(f.poll(t0 + ms(5000), true, false).is_none());
        assert!(!f.disarm());
        assert!(f.poll(t0 + ms(6000), true, false).is_none());
        assert!(!f.played_this_turn());
    }

    #[test]
    fn double_arm_fires_once() {
        let t0 = Instant::now();
        let mut f = FillerScheduler::new(FillerConfig::default());
        f.arm(t0);
        f.arm(t0 + ms(1000));
        assert!(f.poll(t0 + ms(5300), true, false).is_none());
        let mut cues = 0;
        for step in 0..100 {
            if f.poll(t0 + ms(6300 + step * 16), true, false).is_some() {
                cues += 1;
            }
        }
        assert_eq!(cues, 1);
    }

    #[test]
    fn timer_skips_when_paused_or_resolved() {
        let t0 = Instant::now();
        let mut f = FillerScheduler::new(FillerConfig::default());
        f.arm(t0);
        assert!(f.poll(t0 + ms(5300), true, true).is_none());
        assert!(!f.is_armed());

        f.arm(t0);
        assert!(f.poll(t0 + ms(5300), false, false).is_none());
        assert!(!f.played_this_turn());
    }

    #[test]
    fn cue_picks_a_configured_clip() {
        let t0 = Instant::now();
        let config = FillerConfig::default();
        let mut f = FillerScheduler::new(config.clone());
        f.arm(t0);
        let cue = f.poll(t0 + ms(5300), true, false).unwrap();
        assert!(config.clips.contains(&cue.clip));
        assert!(f.is_active());
    }

    #[test]
    fn late_answer_waits_for_clip_end_plus_grace() {
        let t0 = Instant::now();
        let mut f = FillerScheduler::new(FillerConfig::default());
        f.arm(t0);
        let cue = f.poll(t0 + ms(5300), true, false).unwrap();

        // answer lands mid-clip
        assert!(f.disarm());
        assert!(f.hold(answer(1)).is_none());
        assert!(f.has_pending());
        assert!(f.take_due(t0 + ms(9000)).is_none());

        f.on_filler_ended(cue.id, t0 + ms(6500)).unwrap();
        assert!(f.take_due(t0 + ms(7499)).is_none());
        let released = f.take_due(t0 + ms(7500)).unwrap();
        assert_eq!(released.turn, 1);
        assert!(!f.has_pending());
        assert!(f.take_due(t0 + ms(8000)).is_none());
    }

    #[test]
    fn only_one_pending_answer() {
        let t0 = Instant::now();
        let mut f = FillerScheduler::new(FillerConfig::default());
        f.arm(t0);
        let cue = f.poll(t0 + ms(5300), true, false).unwrap();
        assert!(f.hold(answer(1)).is_none());
        assert!(f.hold(answer(2)).is_none());
        f.on_filler_ended(cue.id, t0 + ms(6000)).unwrap();
        assert_eq!(f.take_due(t0 + ms(7000)).unwrap().turn, 2);
        assert!(f.take_due(t0 + ms(7000)).is_none());
    }

    #[test]
    fn answer_after_clip_ended_plays_immediately() {
        let t0 = Instant::now();
        let mut f = FillerScheduler::new(FillerConfig::default());
        f.arm(t0);
        let cue = f.poll(t0 + ms(5300), true, false).unwrap();
        f.on_filler_ended(cue.id, t0 + ms(6000)).unwrap();
        assert!(f.hold(answer(3)).is_some());
    }

    #[test]
    fn stale_end_event_is_ignored() {
        let t0 = Instant::now();
        let mut f = FillerScheduler::new(FillerConfig::default());
        f.arm(t0);
        let old = f.poll(t0 + ms(5300), true, false).unwrap();
        f.arm(t0 + ms(6000));
        let err = f.on_filler_ended(old.id, t0 + ms(6100));
        assert!(matches!(err, Err(VoiceError::StaleEventIgnored { kind: "filler", .. })));
    }

    #[test]
    fn discard_drops_pending() {
        let t0 = Instant::now();
        let mut f = FillerScheduler::new(FillerConfig::default());
        f.arm(t0);
        let cue = f.poll(t0 + ms(5300), true, false).unwrap();
        f.hold(answer(1));
        f.discard();
        assert!(!f.has_pending());
        assert!(f.on_filler_ended(cue.id, t0 + ms(6000)).is_err());
        assert!(f.take_due(t0 + ms(9000)).is_none());
    }
}
