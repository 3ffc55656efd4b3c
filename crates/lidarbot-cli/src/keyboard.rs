//! Operator keyboard in raw mode, one key press per label.

use std::io;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;

use lidarbot_core::{KeyBindings, LabelEvent, LabelSource};

struct RawMode;

impl RawMode {
    fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Reads bound keys without waiting for Enter. Raw mode is restored when
/// this is dropped.
pub struct KeyboardLabels {
    bindings: KeyBindings,
    poll: Duration,
    _raw: RawMode,
}

impl KeyboardLabels {
    pub fn new(bindings: KeyBindings, poll: Duration) -> io::Result<Self> {
        Ok(Self { bindings, poll, _raw: RawMode::enable()? })
    }
}

impl LabelSource for KeyboardLabels {
    fn next_label(&mut self) -> io::Result<LabelEvent> {
        if !event::poll(self.poll)? {
            return Ok(LabelEvent::Ignore);
        }
        let event = match event::read()? {
            Event::Key(KeyEvent { code, modifiers, kind: KeyEventKind::Press, .. }) => match code {
                // raw mode swallows SIGINT
                KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => LabelEvent::Quit,
                KeyCode::Esc => LabelEvent::Quit,
                KeyCode::Char(c) => self.bindings.event_for(c),
                _ => LabelEvent::Ignore,
            },
            _ => LabelEvent::Ignore,
        };
        Ok(event)
    }
}
