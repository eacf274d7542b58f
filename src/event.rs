//! Host-facing event model.
//!
//! The engine never talks to the host application directly; everything it has
//! to say — navigation, presence, chat, diagnostics — flows through one
//! [`NavigationSink`] dispatch method as a [`NavEvent`]. The sink is handed a
//! mutable borrow of the engine alongside each event so that it may legally
//! call back in (say, to transmit a chat reply); a re-entrant *sync* transmit
//! is still refused with [`XmitError::Receiving`].

use thiserror::Error;

use crate::engine::BibleSync;
use crate::protocol::MessageType;

// ────────────────────────────────────────────────────────────────────────────
// Engine modes
// ────────────────────────────────────────────────────────────────────────────

/// The four engine modes. They gate which message types may be transmitted
/// and whether inbound sync is acted upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Sockets closed, nothing sent or received.
    Disabled,
    /// Bidirectional peer: transmits and follows navigation.
    Personal,
    /// Transmit-only: leads navigation, follows no one.
    Speaker,
    /// Receive-only for navigation; may still announce and chat.
    Audience,
}

impl Mode {
    /// Personal and speaker both emit beacons and may lead navigation.
    pub fn is_speaker_role(self) -> bool {
        matches!(self, Mode::Personal | Mode::Speaker)
    }

    /// Transmit gating per mode and message type.
    pub fn may_transmit(self, msg_type: MessageType) -> bool {
        match self {
            Mode::Disabled => false,
            Mode::Personal | Mode::Speaker => true,
            Mode::Audience => matches!(msg_type, MessageType::Announce | MessageType::Chat),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Events
// ────────────────────────────────────────────────────────────────────────────

/// What a [`NavEvent`] is telling the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Act on the navigation fields.
    Navigation,
    /// A peer announced its presence.
    Announce,
    /// A new speaker was discovered; `uuid` identifies it.
    NewSpeaker,
    /// A speaker aged out or the registry was cleared.
    SpeakerGone,
    /// A chat message; `alt` carries the text.
    Chat,
    /// Passphrase differs or the sender is not being listened to.
    Mismatch,
    /// Error or diagnostic; see `info` and `dump`.
    Error,
}

impl EventKind {
    /// The single-letter command code of the classic callback contract.
    pub fn code(self) -> char {
        match self {
            EventKind::Navigation => 'N',
            EventKind::Announce => 'A',
            EventKind::NewSpeaker => 'S',
            EventKind::SpeakerGone => 'D',
            EventKind::Chat => 'C',
            EventKind::Mismatch => 'M',
            EventKind::Error => 'E',
        }
    }
}

/// One event delivered to the host. All fields are UTF-8 strings; fields a
/// given event kind does not use are empty (or carry the `<>` filler for
/// dispatch-stage events). `dump` is a human-readable rendering of the
/// datagram behind the event, for diagnostics.
#[derive(Debug, Clone)]
pub struct NavEvent {
    pub kind: EventKind,
    /// Sender instance UUID in canonical hyphenated form.
    pub uuid: String,
    /// Bible abbreviation for navigation; user name for presence and chat.
    pub bible: String,
    /// Verse reference for navigation; source address for presence and chat.
    pub reference: String,
    /// Alternate reference for navigation; presence string for announce;
    /// message text for chat.
    pub alt: String,
    /// Synchronization group for navigation; `{app} {version}` for presence
    /// and chat.
    pub group: String,
    /// Sync domain for navigation; device description for presence and chat.
    pub domain: String,
    /// Human-readable summary.
    pub info: String,
    /// Raw-dump rendering of the datagram, where one exists.
    pub dump: String,
}

impl NavEvent {
    /// A diagnostic with no navigation payload.
    pub(crate) fn diagnostic(kind: EventKind, info: String, dump: String) -> Self {
        NavEvent {
            kind,
            uuid: String::new(),
            bible: String::new(),
            reference: String::new(),
            alt: String::new(),
            group: String::new(),
            domain: String::new(),
            info,
            dump,
        }
    }

    /// A speaker-departure notice; only the uuid is meaningful.
    pub(crate) fn departed(uuid: String) -> Self {
        NavEvent {
            kind: EventKind::SpeakerGone,
            uuid,
            bible: String::new(),
            reference: String::new(),
            alt: String::new(),
            group: String::new(),
            domain: String::new(),
            info: String::new(),
            dump: String::new(),
        }
    }
}

/// The host's end of the one-way event flow out of the engine.
///
/// Implemented for any `FnMut(&mut BibleSync, &NavEvent)` closure, so simple
/// hosts can pass a closure and stateful ones a struct.
pub trait NavigationSink {
    fn on_event(&mut self, engine: &mut BibleSync, event: &NavEvent);
}

impl<F> NavigationSink for F
where
    F: FnMut(&mut BibleSync, &NavEvent),
{
    fn on_event(&mut self, engine: &mut BibleSync, event: &NavEvent) {
        self(engine, event)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Transmit refusals
// ────────────────────────────────────────────────────────────────────────────

/// Why a transmit was refused or failed. Refusals leave the engine running;
/// [`XmitError::SendFailed`] is fatal and shuts it down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum XmitError {
    #[error("engine is disabled")]
    Disabled,
    #[error("sync transmit refused inside the receive callback")]
    Receiving,
    #[error("no transmit socket")]
    NoSocket,
    #[error("audience may not transmit sync or beacon")]
    AudienceXmit,
    #[error("multicast send failed; engine disabled")]
    SendFailed,
}
