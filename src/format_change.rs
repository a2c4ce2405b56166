//! Format-change orchestration (spec §4.6).
//!
//! `PlaybackController` abstracts over a real `cpal::Stream` so the atomic
//! reconfigure sequence can be exercised without opening an audio device —
//! grounded in the teacher's `OutputStreamHandle`, which already separates
//! "is a stream active" from "the stream object itself".

use crate::wire::AudioFormat;

/// Something that can be started, stopped, and rebuilt against a new format.
///
/// The adaptive buffer backing playback is deliberately untouched across a
/// reconfigure — residual data may play briefly as noise, by design.
pub trait PlaybackController {
    type Error;

    fn is_active(&self) -> bool;
    fn stop(&mut self) -> Result<(), Self::Error>;
    fn rebuild(&mut self, format: AudioFormat) -> Result<(), Self::Error>;
    fn start(&mut self) -> Result<(), Self::Error>;
}

/// Runs the atomic sequence from spec §4.6: stop if active, tear down and
/// rebuild the stream at `new_format`, then restart if it was active before.
pub fn apply_format_change<C: PlaybackController>(controller: &mut C, new_format: AudioFormat) -> Result<(), C::Error> {
    let was_active = controller.is_active();
    if was_active {
        controller.stop()?;
    }
    controller.rebuild(new_format)?;
    if was_active {
        controller.start()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Encoding;

    #[derive(Debug, Default)]
    struct FakeController {
        active: bool,
        current_format: Option<AudioFormat>,
        events: Vec<&'static str>,
    }

    impl PlaybackController for FakeController {
        type Error = std::convert::Infallible;

        fn is_active(&self) -> bool {
            self.active
        }

        fn stop(&mut self) -> Result<(), Self::Error> {
            self.events.push("stop");
            self.active = false;
            Ok(())
        }

        fn rebuild(&mut self, format: AudioFormat) -> Result<(), Self::Error> {
            self.events.push("rebuild");
            self.current_format = Some(format);
            Ok(())
        }

        fn start(&mut self) -> Result<(), Self::Error> {
            self.events.push("start");
            self.active = true;
            Ok(())
        }
    }

    fn format(rate: u32) -> AudioFormat {
        AudioFormat { encoding: Encoding::PcmF32Le, channels: 2, sample_rate: rate, bit_depth: 32 }
    }

    #[test]
    fn reconfigures_and_restarts_when_previously_active() {
        let mut controller = FakeController { active: true, current_format: Some(format(44_100)), events: vec![] };
        apply_format_change(&mut controller, format(48_000)).unwrap();

        assert_eq!(controller.events, vec!["stop", "rebuild", "start"]);
        assert_eq!(controller.current_format, Some(format(48_000)));
        assert!(controller.active);
    }

    #[test]
    fn rebuilds_without_starting_when_previously_inactive() {
        let mut controller = FakeController { active: false, current_format: None, events: vec![] };
        apply_format_change(&mut controller, format(48_000)).unwrap();

        assert_eq!(controller.events, vec!["rebuild"]);
        assert!(!controller.active);
    }
}
