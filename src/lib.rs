//! BibleSync — a peer-to-peer LAN protocol engine that keeps scripture-reading
//! applications on different machines navigating together.
//!
//! Peers discover one another over IPv4 UDP multicast, optionally follow a
//! designated speaker's navigation, and exchange short chat messages. Session
//! membership is cooperative: a shared passphrase gates participation, and an
//! instance UUID is weakly bound to the source address it was first heard
//! from so a borrowed UUID is rejected as a spoof.
//!
//! ## Architecture
//!
//! ```text
//!  ┌───────────────────────────────────────────────────────────────┐
//!  │                          host application                      │
//!  │        set_mode / transmit / receive_poll     NavigationSink   │
//!  └────────────────────┬──────────────────────────────▲───────────┘
//!                       │                              │ NavEvent
//!  ┌────────────────────▼──────────────────────────────┴───────────┐
//!  │                       engine::BibleSync                        │
//!  │                                                                │
//!  │   protocol (wire codec)      speakers (registry, aging)        │
//!  │   netif (interface pick)     event (modes, sink, refusals)     │
//!  └────────────────────┬──────────────────────────────▲───────────┘
//!                       │ sendto                       │ recvfrom
//!                 239.225.27.227:22272  (UDP multicast, both ways)
//! ```
//!
//! The engine is single-threaded and cooperative: the host calls
//! [`BibleSync::receive_poll`] a few times per second, and every piece of
//! state — the speaker registry, beacon cadence, mode machine — advances
//! inside that call or inside a synchronous [`BibleSync::transmit`]. There
//! are no background tasks and no locks, and receives never block.
//!
//! ## Quick start
//!
//! ```no_run
//! use biblesync::{BibleSync, EventKind, Mode, NavEvent};
//!
//! let mut engine = BibleSync::new("MyReader", "4.2", "alice");
//! engine.set_mode(
//!     Mode::Audience,
//!     Some(Box::new(|_: &mut BibleSync, event: &NavEvent| {
//!         if event.kind == EventKind::Navigation {
//!             println!("navigate to {} ({})", event.reference, event.bible);
//!         }
//!     })),
//!     "", // keep the default passphrase
//! );
//! // host timer, a few times per second:
//! while engine.receive_poll() {
//!     std::thread::sleep(std::time::Duration::from_millis(333));
//! }
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod engine;
pub mod event;
pub mod netif;
pub mod protocol;
pub mod speakers;

pub use engine::{BibleSync, SetupError};
pub use event::{EventKind, Mode, NavEvent, NavigationSink, XmitError};
pub use protocol::{MessageType, ProtocolError};
pub use speakers::{BeaconDisposition, SpeakerEntry, SpeakerRegistry};
