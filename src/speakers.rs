//! Speaker registry: the set of peers whose beacons this engine has accepted.
//!
//! Each entry pins the source address the peer's first beacon arrived from;
//! a later beacon carrying the same UUID from any other address is rejected
//! as a spoof and never touches the entry. Entries live on a countdown that
//! every beacon resets and every receive-poll tick decrements — a speaker
//! whose beacons stop is aged out after roughly three missed beacons.

use std::collections::HashMap;

use crate::protocol::{BEACON_INTERVAL_TICKS, BEACON_LIVENESS_MULTIPLIER};

/// Ticks of life granted by an accepted beacon.
const ENTRY_LIFETIME_TICKS: u32 = BEACON_INTERVAL_TICKS * BEACON_LIVENESS_MULTIPLIER;

/// One known speaker, keyed externally by its instance-UUID string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakerEntry {
    /// Source IPv4 address in dotted-quad form, pinned at first acceptance.
    pub addr: String,
    /// Whether this peer's sync messages are acted upon.
    pub listen: bool,
    /// Ticks until the entry expires.
    pub countdown: u32,
}

/// Outcome of feeding one received beacon into the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeaconDisposition {
    /// Passphrase did not match; the registry was not touched.
    Mismatch,
    /// First beacon from this UUID; an entry was created.
    NewSpeaker { listen: bool },
    /// Refreshed an existing entry; nothing to tell the host.
    Known,
    /// Same UUID from a different address than the pinned one; rejected.
    Spoof { pinned: String },
}

/// Registry of live speakers.
#[derive(Debug, Default)]
pub struct SpeakerRegistry {
    entries: HashMap<String, SpeakerEntry>,
}

impl SpeakerRegistry {
    pub fn new() -> Self {
        SpeakerRegistry::default()
    }

    /// Feed one received beacon through the pinning and liveness rules.
    ///
    /// `auto_follow` is false in speaker mode (a speaker listens to no one);
    /// otherwise the first speaker ever seen is followed automatically and
    /// later ones start out ignored, leaving further choices to the host.
    pub fn observe_beacon(
        &mut self,
        uuid: &str,
        source_addr: &str,
        passphrase_ok: bool,
        auto_follow: bool,
    ) -> BeaconDisposition {
        if !passphrase_ok {
            return BeaconDisposition::Mismatch;
        }
        match self.entries.get_mut(uuid) {
            Some(entry) if entry.addr != source_addr => BeaconDisposition::Spoof {
                pinned: entry.addr.clone(),
            },
            Some(entry) => {
                entry.countdown = ENTRY_LIFETIME_TICKS;
                BeaconDisposition::Known
            }
            None => {
                let listen = auto_follow && self.entries.is_empty();
                self.entries.insert(
                    uuid.to_owned(),
                    SpeakerEntry {
                        addr: source_addr.to_owned(),
                        listen,
                        countdown: ENTRY_LIFETIME_TICKS,
                    },
                );
                BeaconDisposition::NewSpeaker { listen }
            }
        }
    }

    /// Set the listen flag for a known speaker; unknown UUIDs are ignored.
    pub fn listen(&mut self, uuid: &str, listen: bool) {
        if let Some(entry) = self.entries.get_mut(uuid) {
            entry.listen = listen;
        }
    }

    /// Age every entry by one tick. Entries reaching zero are removed and
    /// their UUIDs returned so the caller can report the departures.
    /// Victims are collected before removal so the traversal stays valid.
    pub fn age_tick(&mut self) -> Vec<String> {
        let mut departed = Vec::new();
        for (uuid, entry) in &mut self.entries {
            entry.countdown -= 1;
            if entry.countdown == 0 {
                departed.push(uuid.clone());
            }
        }
        for uuid in &departed {
            self.entries.remove(uuid);
        }
        departed
    }

    /// Empty the registry, returning every UUID so the caller can report
    /// each departure.
    pub fn clear_all(&mut self) -> Vec<String> {
        self.entries.drain().map(|(uuid, _)| uuid).collect()
    }

    pub fn lookup(&self, uuid: &str) -> Option<&SpeakerEntry> {
        self.entries.get(uuid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
