// -----------------------------------------------------------------------------
// ----- SessionState ----------------------------------------------------------

/// Gates which client frames reach the backend. Audio is only forwarded
/// while `Listening`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Listening,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
    pub event: ControlEvent,
}

// -----------------------------------------------------------------------------
// ----- SessionState: Public --------------------------------------------------

impl SessionState {
    /// Transition table. `None` means the event is ignored in this state.
    pub fn apply(self, event: ControlEvent) -> Option<Transition> {
        let to = match (self, event) {
            (SessionState::Idle, ControlEvent::Start) => SessionState::Listening,
            (SessionState::Listening, ControlEvent::Stop) => SessionState::Idle,
            _ => return None,
        };

        Some(Transition {
            from: self,
            to,
            event,
        })
    }

    pub fn forwards_audio(self) -> bool {
        self == SessionState::Listening
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Listening => "listening",
        }
    }
}

impl Transition {
    /// Text frame sent to the client before the transition takes effect.
    pub fn closing_frame(&self) -> Option<&'static str> {
        match self.event {
            ControlEvent::Stop => Some(super::control::CLOSING_FRAME),
            ControlEvent::Start => None,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_from_idle_begins_listening() {
        let t = SessionState::Idle.apply(ControlEvent::Start).unwrap();
        assert_eq!(t.to, SessionState::Listening);
        assert!(t.to.forwards_audio());
        assert_eq!(t.closing_frame(), None);
    }

    #[test]
    fn stop_from_listening_returns_to_idle_with_closing_frame() {
        let t = SessionState::Listening.apply(ControlEvent::Stop).unwrap();
        assert_eq!(t.to, SessionState::Idle);
        assert!(!t.to.forwards_audio());
        assert_eq!(t.closing_frame(), Some("bye"));
    }

    #[test]
    fn other_events_are_ignored() {
        assert_eq!(SessionState::Idle.apply(ControlEvent::Stop), None);
        assert_eq!(SessionState::Listening.apply(ControlEvent::Start), None);
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
