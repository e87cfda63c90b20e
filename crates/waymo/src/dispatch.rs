//! Turns one [`Action`] into protocol events, honoring its timing.

use std::thread;
use std::time::{Duration, Instant};

use waymo_input::{KeySpec, Keymap, ProtocolSink, SinkError};

use crate::action::{Action, ActionOutcome};
use crate::cooldown::CooldownGovernor;

/// Owns the sink, the layout and the cooldown state of a running loop.
pub(crate) struct Dispatcher<S> {
    sink: S,
    keymap: Keymap,
    governor: CooldownGovernor,
}

fn pause(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}

impl<S: ProtocolSink> Dispatcher<S> {
    pub(crate) const fn new(sink: S, keymap: Keymap, cooldown: Duration) -> Self {
        Self {
            sink,
            keymap,
            governor: CooldownGovernor::new(cooldown),
        }
    }

    /// Let the sink process compositor traffic.
    pub(crate) fn service(&mut self) -> Result<(), SinkError> {
        self.sink.service()
    }

    /// Wait out the cooldown, run `action` to completion and record the
    /// dispatch time.
    ///
    /// Only a fatal sink error is returned as `Err`; everything else is
    /// folded into the [`ActionOutcome`].
    pub(crate) fn dispatch(&mut self, action: &Action) -> Result<ActionOutcome, SinkError> {
        self.governor.wait();
        let result = self.run(action);
        self.governor.mark(Instant::now());

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!(action = action.kind(), "Action skipped: {e}");
                Ok(ActionOutcome::Skipped {
                    reason: e.to_string(),
                })
            }
        }
    }

    fn resolve(&self, ch: char) -> Option<KeySpec> {
        let spec = self.keymap.lookup(ch);
        if spec.is_none() {
            tracing::warn!(
                ch = %ch.escape_debug(),
                layout = self.keymap.layout(),
                "No key for character in active layout"
            );
        }
        spec
    }

    fn key(&mut self, spec: KeySpec, down: bool) -> Result<(), SinkError> {
        self.sink.emit_key(spec.keycode, spec.modifiers, down)
    }

    fn run(&mut self, action: &Action) -> Result<ActionOutcome, SinkError> {
        tracing::trace!(?action, "Dispatching");
        match *action {
            Action::MoveMouse { x, y, relative } => {
                if !relative && (x < 0 || y < 0) {
                    tracing::warn!(x, y, "Negative absolute position ignored");
                    return Ok(ActionOutcome::Skipped {
                        reason: format!("absolute position ({x}, {y}) is negative"),
                    });
                }
                self.sink.emit_motion(x, y, relative)?;
            }
            Action::ClickMouse {
                button,
                clicks,
                hold,
            } => {
                for _ in 0..clicks {
                    self.sink.emit_button(button, true)?;
                    pause(hold);
                    self.sink.emit_button(button, false)?;
                }
            }
            Action::PressMouse { button, down } => {
                self.sink.emit_button(button, down)?;
            }
            Action::PressKey {
                key,
                interval,
                down,
            } => {
                let Some(spec) = self.resolve(key) else {
                    return Ok(ActionOutcome::Partial {
                        unresolved: vec![key],
                    });
                };
                pause(interval.unwrap_or_default());
                self.key(spec, down)?;
            }
            Action::HoldKey {
                key,
                interval,
                hold,
            } => {
                let Some(spec) = self.resolve(key) else {
                    return Ok(ActionOutcome::Partial {
                        unresolved: vec![key],
                    });
                };
                pause(interval.unwrap_or_default());
                self.key(spec, true)?;
                pause(hold);
                self.key(spec, false)?;
            }
            Action::TypeText { ref text, interval } => {
                return self.type_text(text, interval);
            }
        }
        Ok(ActionOutcome::Completed)
    }

    fn type_text(
        &mut self,
        text: &str,
        interval: Option<Duration>,
    ) -> Result<ActionOutcome, SinkError> {
        let interval = interval.unwrap_or_else(|| self.sink.default_type_interval());
        let mut unresolved = Vec::new();
        let mut typed_any = false;

        for ch in text.chars() {
            let Some(spec) = self.resolve(ch) else {
                unresolved.push(ch);
                continue;
            };
            if typed_any {
                pause(interval);
            }
            self.key(spec, true)?;
            self.key(spec, false)?;
            typed_any = true;
        }

        if unresolved.is_empty() {
            Ok(ActionOutcome::Completed)
        } else {
            Ok(ActionOutcome::Partial { unresolved })
        }
    }
}

#[cfg(test)]
mod tests {
    use waymo_input::{Connector, Modifiers, MouseButton};

    use super::*;
    use crate::testing::{
        test_keymap, Emitted, Recorder, RecordingConnector, RecordingSink, KEY_A, KEY_B, KEY_RETURN,
    };

    fn dispatcher(cooldown: Duration) -> (Dispatcher<RecordingSink>, Recorder) {
        let connector = RecordingConnector::new();
        let recorder = connector.recorder();
        let sink = connector.connect().unwrap();
        (Dispatcher::new(sink, test_keymap(), cooldown), recorder)
    }

    #[test]
    fn move_emits_one_motion() {
        let (mut d, rec) = dispatcher(Duration::ZERO);
        assert_eq!(
            d.dispatch(&Action::move_by(-5, 7)).unwrap(),
            ActionOutcome::Completed
        );
        assert_eq!(
            rec.events(),
            vec![Emitted::Motion {
                x: -5,
                y: 7,
                relative: true
            }]
        );
    }

    #[test]
    fn negative_absolute_move_is_skipped() {
        let (mut d, rec) = dispatcher(Duration::ZERO);
        let outcome = d.dispatch(&Action::move_to(-1, 10)).unwrap();
        assert!(matches!(outcome, ActionOutcome::Skipped { .. }));
        assert!(rec.events().is_empty());
    }

    #[test]
    fn click_emits_pairs_with_hold() {
        let (mut d, rec) = dispatcher(Duration::ZERO);
        let hold = Duration::from_millis(10);
        d.dispatch(&Action::click(MouseButton::Left, 3, hold)).unwrap();

        let timed = rec.timed();
        assert_eq!(timed.len(), 6);
        for pair in timed.chunks(2) {
            assert_eq!(
                pair[0].1,
                Emitted::Button {
                    button: MouseButton::Left,
                    down: true
                }
            );
            assert_eq!(
                pair[1].1,
                Emitted::Button {
                    button: MouseButton::Left,
                    down: false
                }
            );
            assert!(pair[1].0.duration_since(pair[0].0) >= hold);
        }
    }

    #[test]
    fn zero_clicks_emit_nothing() {
        let (mut d, rec) = dispatcher(Duration::ZERO);
        assert_eq!(
            d.dispatch(&Action::click(MouseButton::Right, 0, Duration::ZERO))
                .unwrap(),
            ActionOutcome::Completed
        );
        assert!(rec.events().is_empty());
    }

    #[test]
    fn type_text_spaces_characters() {
        let (mut d, rec) = dispatcher(Duration::ZERO);
        let interval = Duration::from_millis(5);
        let outcome = d
            .dispatch(&Action::type_text("ab").with_interval(interval))
            .unwrap();
        assert_eq!(outcome, ActionOutcome::Completed);

        let timed = rec.timed();
        let keys: Vec<_> = timed.iter().map(|(_, e)| e.clone()).collect();
        assert_eq!(
            keys,
            vec![
                Emitted::key(KEY_A, true),
                Emitted::key(KEY_A, false),
                Emitted::key(KEY_B, true),
                Emitted::key(KEY_B, false),
            ]
        );
        assert!(timed[2].0.duration_since(timed[1].0) >= interval);
    }

    #[test]
    fn unmapped_character_does_not_stop_the_rest() {
        let (mut d, rec) = dispatcher(Duration::ZERO);
        let outcome = d.dispatch(&Action::type_text("€b")).unwrap();
        assert_eq!(
            outcome,
            ActionOutcome::Partial {
                unresolved: vec!['€']
            }
        );
        assert_eq!(
            rec.events(),
            vec![Emitted::key(KEY_B, true), Emitted::key(KEY_B, false)]
        );
    }

    #[test]
    fn newline_types_return() {
        let (mut d, rec) = dispatcher(Duration::ZERO);
        d.dispatch(&Action::type_text("a\n").with_interval(Duration::ZERO))
            .unwrap();
        assert_eq!(
            rec.events(),
            vec![
                Emitted::key(KEY_A, true),
                Emitted::key(KEY_A, false),
                Emitted::key(KEY_RETURN, true),
                Emitted::key(KEY_RETURN, false),
            ]
        );
    }

    #[test]
    fn shifted_character_carries_modifiers() {
        let (mut d, rec) = dispatcher(Duration::ZERO);
        d.dispatch(&Action::press_key('A', true)).unwrap();
        assert_eq!(
            rec.events(),
            vec![Emitted::Key {
                keycode: KEY_A,
                modifiers: Modifiers::SHIFT,
                down: true
            }]
        );
    }

    #[test]
    fn press_key_interval_delays_transition() {
        let (mut d, rec) = dispatcher(Duration::ZERO);
        let start = Instant::now();
        d.dispatch(&Action::press_key('a', false).with_interval(Duration::from_millis(15)))
            .unwrap();
        let timed = rec.timed();
        assert_eq!(timed.len(), 1);
        assert!(timed[0].0.duration_since(start) >= Duration::from_millis(15));
    }

    #[test]
    fn hold_key_is_down_hold_up() {
        let (mut d, rec) = dispatcher(Duration::ZERO);
        let hold = Duration::from_millis(12);
        d.dispatch(&Action::hold_key('b', hold)).unwrap();
        let timed = rec.timed();
        assert_eq!(timed.len(), 2);
        assert_eq!(timed[0].1, Emitted::key(KEY_B, true));
        assert_eq!(timed[1].1, Emitted::key(KEY_B, false));
        assert!(timed[1].0.duration_since(timed[0].0) >= hold);
    }

    #[test]
    fn unresolved_press_key_emits_nothing() {
        let (mut d, rec) = dispatcher(Duration::ZERO);
        let outcome = d.dispatch(&Action::press_key('€', true)).unwrap();
        assert_eq!(
            outcome,
            ActionOutcome::Partial {
                unresolved: vec!['€']
            }
        );
        assert!(rec.events().is_empty());
    }

    #[test]
    fn cooldown_spaces_consecutive_actions() {
        let cooldown = Duration::from_millis(30);
        let (mut d, rec) = dispatcher(cooldown);
        d.dispatch(&Action::move_to(1, 1)).unwrap();
        d.dispatch(&Action::press_mouse(MouseButton::Middle, true)).unwrap();
        d.dispatch(&Action::type_text("a")).unwrap();

        let timed = rec.timed();
        assert_eq!(timed.len(), 4);
        assert!(timed[1].0.duration_since(timed[0].0) >= cooldown);
        assert!(timed[2].0.duration_since(timed[1].0) >= cooldown);
    }

    #[test]
    fn fatal_sink_error_is_returned() {
        let connector = RecordingConnector::new().disconnect_after(1);
        let sink = connector.connect().unwrap();
        let mut d = Dispatcher::new(sink, test_keymap(), Duration::ZERO);
        assert!(d.dispatch(&Action::move_to(1, 1)).is_ok());
        let err = d.dispatch(&Action::move_to(2, 2)).unwrap_err();
        assert!(err.is_fatal());
    }
}
