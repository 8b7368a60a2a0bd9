//! Presentation feedback and frame callbacks for painted windows.

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use tracing::trace;

use crate::geometry::Rectangle;
use crate::output::{OutputId, OutputInfo};
use crate::toplevel::WindowId;

/// Source of presentation timestamps.
///
/// Hardware timestamps handed to the compositor must be in the same domain.
pub trait Clock {
    fn now(&self) -> Duration;
}

#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<Duration>,
}

impl ManualClock {
    pub fn new(now: Duration) -> Self {
        Self {
            now: Cell::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }

    pub fn set(&self, now: Duration) {
        self.now.set(now);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.get()
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PresentationKind: u32 {
        const VSYNC = 0x1;
        const HW_CLOCK = 0x2;
        const HW_COMPLETION = 0x4;
        const ZERO_COPY = 0x8;
    }
}

/// Feedback in the split layout clients receive it in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentationFeedback {
    pub tv_sec_hi: u32,
    pub tv_sec_lo: u32,
    pub tv_nsec: u32,
    /// Refresh interval in nanoseconds.
    pub refresh: u32,
    pub seq_hi: u32,
    pub seq_lo: u32,
    pub flags: PresentationKind,
}

impl PresentationFeedback {
    pub fn new(timestamp: Duration, refresh: Duration, sequence: u64, flags: PresentationKind) -> Self {
        let secs = timestamp.as_secs();
        Self {
            tv_sec_hi: (secs >> 32) as u32,
            tv_sec_lo: secs as u32,
            tv_nsec: timestamp.subsec_nanos(),
            refresh: refresh.as_nanos().min(u32::MAX as u128) as u32,
            seq_hi: (sequence >> 32) as u32,
            seq_lo: sequence as u32,
            flags,
        }
    }

    pub fn timestamp(&self) -> Duration {
        let secs = ((self.tv_sec_hi as u64) << 32) | self.tv_sec_lo as u64;
        Duration::new(secs, self.tv_nsec)
    }

    pub fn sequence(&self) -> u64 {
        ((self.seq_hi as u64) << 32) | self.seq_lo as u64
    }
}

/// Receiver of per-window presentation events, usually the protocol layer.
pub trait FeedbackSink {
    fn presented(&mut self, window: WindowId, feedback: &PresentationFeedback);
    fn frame_done(&mut self, window: WindowId, time: Duration);
    /// The window's feedback will not be delivered.
    fn discarded(&mut self, window: WindowId);
}

#[derive(Debug, Default)]
pub struct Presentation {
    outputs: Vec<OutputInfo>,
    /// Windows whose feedback is delivered with the output's next presentation.
    locks: HashMap<OutputId, Vec<WindowId>>,
    /// Windows painted on the output since its last presentation.
    painted: HashMap<OutputId, Vec<WindowId>>,
    sequences: HashMap<OutputId, u64>,
}

impl Presentation {
    pub fn new(outputs: Vec<OutputInfo>) -> Self {
        Self {
            outputs,
            ..Default::default()
        }
    }

    pub fn set_outputs(&mut self, outputs: Vec<OutputInfo>) {
        let ids: HashSet<OutputId> = outputs.iter().map(|output| output.id).collect();
        self.locks.retain(|id, _| ids.contains(id));
        self.painted.retain(|id, _| ids.contains(id));
        self.outputs = outputs;
    }

    /// Output showing the largest part of `geometry`; the first one wins ties.
    pub fn max_coverage_output(&self, geometry: &Rectangle) -> Option<OutputId> {
        let mut best: Option<(OutputId, i64)> = None;
        for output in &self.outputs {
            let area = output
                .geometry
                .intersection(geometry)
                .map(|rect| rect.area())
                .unwrap_or(0);
            if area > best.map(|(_, area)| area).unwrap_or(0) {
                best = Some((output.id, area));
            }
        }
        best.map(|(id, _)| id)
    }

    /// Records the windows painted on `output`. Only windows this output
    /// covers the most are locked for feedback; locked windows that were not
    /// painted again lose their feedback.
    pub fn lock(
        &mut self,
        output: OutputId,
        windows: &[(WindowId, Rectangle)],
        sink: &mut dyn FeedbackSink,
    ) {
        let painted: Vec<WindowId> = windows.iter().map(|(id, _)| *id).collect();
        let locked = self.locks.entry(output).or_default();
        locked.retain(|id| {
            let keep = painted.contains(id);
            if !keep {
                sink.discarded(*id);
            }
            keep
        });

        let owners: Vec<WindowId> = windows
            .iter()
            .filter(|(_, geometry)| self.max_coverage_output(geometry) == Some(output))
            .map(|(id, _)| *id)
            .collect();
        let locked = self.locks.entry(output).or_default();
        for id in owners {
            if !locked.contains(&id) {
                locked.push(id);
            }
        }

        let frame = self.painted.entry(output).or_default();
        for id in painted {
            if !frame.contains(&id) {
                frame.push(id);
            }
        }
    }

    pub fn locked_windows(&self, output: OutputId) -> &[WindowId] {
        self.locks.get(&output).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Delivers feedback for a completed presentation on `output`.
    pub fn presented(
        &mut self,
        output: OutputId,
        timestamp: Duration,
        refresh: Duration,
        flags: PresentationKind,
        sink: &mut dyn FeedbackSink,
    ) -> PresentationFeedback {
        let sequence = self.sequences.entry(output).or_insert(0);
        *sequence += 1;
        let feedback = PresentationFeedback::new(timestamp, refresh, *sequence, flags);

        let locked = self.locks.remove(&output).unwrap_or_default();
        let painted = self.painted.remove(&output).unwrap_or_default();
        trace!(
            output,
            sequence = feedback.sequence(),
            locked = locked.len(),
            painted = painted.len(),
            "presented"
        );
        for &window in &locked {
            sink.presented(window, &feedback);
            sink.frame_done(window, timestamp);
        }
        for window in painted {
            if !locked.contains(&window) {
                sink.frame_done(window, timestamp);
            }
        }
        feedback
    }

    /// Presentation without hardware feedback, stamped with the current time.
    pub fn software_presented(
        &mut self,
        output: OutputId,
        now: Duration,
        kind: PresentationKind,
        sink: &mut dyn FeedbackSink,
    ) -> PresentationFeedback {
        let refresh = self
            .outputs
            .iter()
            .find(|info| info.id == output)
            .map(OutputInfo::refresh_interval)
            .unwrap_or_default();
        self.presented(output, now, refresh, kind, sink)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Debug, Default)]
    pub(crate) struct RecordingSink {
        pub presented: Vec<(WindowId, PresentationFeedback)>,
        pub frames: Vec<WindowId>,
        pub discarded: Vec<WindowId>,
    }

    impl FeedbackSink for RecordingSink {
        fn presented(&mut self, window: WindowId, feedback: &PresentationFeedback) {
            self.presented.push((window, *feedback));
        }

        fn frame_done(&mut self, window: WindowId, _time: Duration) {
            self.frames.push(window);
        }

        fn discarded(&mut self, window: WindowId) {
            self.discarded.push(window);
        }
    }

    fn two_outputs() -> Presentation {
        Presentation::new(vec![
            OutputInfo::new(1, "left", Rectangle::new(0, 0, 100, 100), 60_000),
            OutputInfo::new(2, "right", Rectangle::new(100, 0, 100, 100), 60_000),
        ])
    }

    #[test]
    fn test_feedback_goes_to_largest_output() {
        let mut presentation = two_outputs();
        let mut sink = RecordingSink::default();
        // 8000 px² on the left output, 500 px² on the right one
        let window = (7, Rectangle::new(20, 0, 85, 100));
        presentation.lock(1, &[window], &mut sink);
        presentation.lock(2, &[window], &mut sink);
        assert_eq!(presentation.locked_windows(1), &[7]);
        assert!(presentation.locked_windows(2).is_empty());

        presentation.presented(2, Duration::from_millis(16), Duration::from_millis(16), PresentationKind::VSYNC, &mut sink);
        assert!(sink.presented.is_empty());
        assert_eq!(sink.frames, vec![7]);

        let feedback = presentation.presented(
            1,
            Duration::from_millis(17),
            Duration::from_millis(16),
            PresentationKind::VSYNC | PresentationKind::HW_CLOCK,
            &mut sink,
        );
        assert_eq!(sink.presented.len(), 1);
        assert_eq!(sink.presented[0].0, 7);
        assert_eq!(feedback.sequence(), 1);
        assert_eq!(sink.frames, vec![7, 7]);
    }

    #[test]
    fn test_ties_go_to_first_output() {
        let presentation = two_outputs();
        let geometry = Rectangle::new(50, 0, 100, 10);
        assert_eq!(presentation.max_coverage_output(&geometry), Some(1));
        let outside = Rectangle::new(500, 500, 10, 10);
        assert_eq!(presentation.max_coverage_output(&outside), None);
    }

    #[test]
    fn test_unpainted_windows_are_discarded() {
        let mut presentation = two_outputs();
        let mut sink = RecordingSink::default();
        let a = (1, Rectangle::new(0, 0, 10, 10));
        let b = (2, Rectangle::new(10, 0, 10, 10));
        presentation.lock(1, &[a, b], &mut sink);
        presentation.lock(1, &[a], &mut sink);
        assert_eq!(sink.discarded, vec![2]);
        assert_eq!(presentation.locked_windows(1), &[1]);
    }

    #[test]
    fn test_sequence_increases_per_output() {
        let mut presentation = two_outputs();
        let mut sink = RecordingSink::default();
        let first = presentation.software_presented(1, Duration::from_secs(1), PresentationKind::VSYNC, &mut sink);
        let second = presentation.software_presented(1, Duration::from_secs(2), PresentationKind::VSYNC, &mut sink);
        let other = presentation.software_presented(2, Duration::from_secs(2), PresentationKind::VSYNC, &mut sink);
        assert_eq!(first.sequence(), 1);
        assert_eq!(second.sequence(), 2);
        assert_eq!(other.sequence(), 1);
        assert_eq!(first.refresh, 16_666_666);
    }

    #[test]
    fn test_feedback_splits_wide_values() {
        let timestamp = Duration::new((5u64 << 32) + 3, 42);
        let feedback = PresentationFeedback::new(timestamp, Duration::ZERO, (2u64 << 32) + 1, PresentationKind::empty());
        assert_eq!(feedback.tv_sec_hi, 5);
        assert_eq!(feedback.tv_sec_lo, 3);
        assert_eq!(feedback.seq_hi, 2);
        assert_eq!(feedback.seq_lo, 1);
        assert_eq!(feedback.timestamp(), timestamp);
    }
}
