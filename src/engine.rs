//! The BibleSync engine.
//!
//! One long-lived object owns the two multicast sockets, the speaker
//! registry, and the mode machine. The host drives it cooperatively:
//!
//! ```text
//!  ┌────────────────────────────────────────────────────────────┐
//!  │                        BibleSync                           │
//!  │                                                            │
//!  │  receive_poll ──► drain rx socket ──► validate ──► dispatch│
//!  │        │                                            │      │
//!  │        ├──► age speaker registry (departures)    NavEvent  │
//!  │        └──► beacon countdown ──► transmit beacon    │      │
//!  │                                                     ▼      │
//!  │  transmit ◄───────────────────────────────── NavigationSink│
//!  └────────────────────────────────────────────────────────────┘
//! ```
//!
//! There are no background tasks: every state change happens inside the
//! host's call to [`BibleSync::receive_poll`] or [`BibleSync::transmit`].
//! Receives are strictly non-blocking; the poll drains whatever datagrams
//! are queued and returns.

use std::collections::HashMap;
use std::env;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use log::{debug, warn};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use uuid::Uuid;

use crate::event::{EventKind, Mode, NavEvent, NavigationSink, XmitError};
use crate::netif;
use crate::protocol::{
    self, Header, MessageType, APP_DEVICE, APP_INSTANCE_UUID, APP_NAME, APP_OS, APP_USER,
    APP_VERSION, BEACON_INTERVAL_TICKS, HEADER_SIZE, MAX_DATAGRAM, MSG_CHAT, MSG_PASSPHRASE,
    MSG_SYNC_ALTVERSE, MSG_SYNC_BIBLEABBREV, MSG_SYNC_DOMAIN, MSG_SYNC_GROUP, MSG_SYNC_VERSE,
    MULTICAST_GROUP, MULTICAST_PORT,
};
use crate::speakers::{BeaconDisposition, SpeakerRegistry};

/// Prefix on every human-readable diagnostic produced by the engine.
const DIAG: &str = "BibleSync: ";

/// Default session passphrase.
const DEFAULT_PASSPHRASE: &str = "BibleSync";

/// Filler for dispatch-stage event fields a message type does not set.
const FILLER: &str = "<>";

// ────────────────────────────────────────────────────────────────────────────
// Setup errors
// ────────────────────────────────────────────────────────────────────────────

/// Socket lifecycle failures. Any of these aborts setup; the engine shuts
/// down cleanly and reports the failure as an `E` event.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("transmit socket: {0}")]
    TransmitSocket(io::Error),
    #[error("IP_MULTICAST_LOOP: {0}")]
    MulticastLoop(io::Error),
    #[error("IP_MULTICAST_IF {iface}: {source}")]
    MulticastIf { iface: Ipv4Addr, source: io::Error },
    #[error("transmit bind: {0}")]
    TransmitBind(io::Error),
    #[error("receive socket: {0}")]
    ReceiveSocket(io::Error),
    #[error("SO_REUSEADDR: {0}")]
    ReuseAddr(io::Error),
    #[error("nonblocking: {0}")]
    Nonblocking(io::Error),
    #[error("bind: {0}")]
    Bind(io::Error),
    #[error("IP_ADD_MEMBERSHIP: {0}")]
    Membership(io::Error),
}

// ────────────────────────────────────────────────────────────────────────────
// The engine
// ────────────────────────────────────────────────────────────────────────────

/// The protocol engine. See the crate docs for the overall contract.
pub struct BibleSync {
    application: String,
    version: String,
    user: String,
    device: String,
    passphrase: String,

    uuid: Uuid,
    uuid_string: String,

    mode: Mode,
    sink: Option<Box<dyn NavigationSink>>,
    speakers: SpeakerRegistry,

    /// Raised around each datagram's host callback; rejects re-entrant sync.
    receiving: bool,
    /// Poll ticks until the next outgoing beacon (speaker roles only).
    beacon_countdown: u32,

    tx_socket: Option<UdpSocket>,
    rx_socket: Option<UdpSocket>,
    interface_addr: Ipv4Addr,
    select_interface: Box<dyn Fn() -> Ipv4Addr>,
}

impl BibleSync {
    /// Create a disabled engine identified as `application`/`version`,
    /// operated by `user`. Sockets stay closed until [`set_mode`] selects an
    /// active mode.
    ///
    /// [`set_mode`]: BibleSync::set_mode
    pub fn new(application: &str, version: &str, user: &str) -> Self {
        let uuid = Uuid::new_v4();
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".into());
        let device = format!("{}: {} @ {}", env::consts::ARCH, env::consts::OS, host);

        BibleSync {
            application: application.to_owned(),
            version: version.to_owned(),
            user: user.to_owned(),
            device,
            passphrase: DEFAULT_PASSPHRASE.to_owned(),
            uuid,
            uuid_string: uuid.hyphenated().to_string(),
            mode: Mode::Disabled,
            sink: None,
            speakers: SpeakerRegistry::new(),
            receiving: false,
            beacon_countdown: 0,
            tx_socket: None,
            rx_socket: None,
            interface_addr: Ipv4Addr::LOCALHOST,
            select_interface: Box::new(netif::default_interface),
        }
    }

    /// This instance's UUID in canonical hyphenated form.
    pub fn uuid_string(&self) -> &str {
        &self.uuid_string
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Replace the outbound-interface helper (see [`netif`]); mostly useful
    /// for hosts that let the user pick an interface.
    pub fn set_interface_selector<F>(&mut self, selector: F)
    where
        F: Fn() -> Ipv4Addr + 'static,
    {
        self.select_interface = Box::new(selector);
    }

    /// Current registry state for one speaker.
    pub fn lookup_speaker(&self, uuid: &str) -> Option<&crate::speakers::SpeakerEntry> {
        self.speakers.lookup(uuid)
    }

    // ── Mode machine ────────────────────────────────────────────────────

    /// Switch modes, install the host sink, and (re)run socket setup.
    ///
    /// An empty `passphrase` keeps the current one. Switching between two
    /// active modes requires a sink; without one the engine falls back to
    /// disabled. Setup failure shuts the engine down after reporting an `E`
    /// event. Returns the mode actually in effect.
    pub fn set_mode(
        &mut self,
        mode: Mode,
        sink: Option<Box<dyn NavigationSink>>,
        passphrase: &str,
    ) -> Mode {
        if self.mode == Mode::Disabled || sink.is_some() {
            self.mode = mode;
            if !passphrase.is_empty() {
                self.passphrase = passphrase.to_owned();
            }
            self.sink = sink;
            if self.mode == Mode::Disabled {
                self.shutdown();
            }
        } else {
            // active-to-active change without a sink: nowhere to deliver.
            self.shutdown();
        }

        if let Err(err) = self.setup() {
            self.dispatch(NavEvent::diagnostic(
                EventKind::Error,
                format!("{DIAG}network setup errors."),
                err.to_string(),
            ));
            self.shutdown();
        }
        self.mode
    }

    /// Open sockets as needed and emit the entry traffic for the current
    /// mode: speaker roles beacon first — pinning our uuid to our address in
    /// every listener's registry before the uuid is advertised — then all
    /// active modes announce.
    fn setup(&mut self) -> Result<(), SetupError> {
        if self.mode == Mode::Disabled {
            self.shutdown();
            return Ok(());
        }

        self.interface_addr = (self.select_interface)();
        debug!(
            "setup: mode {:?}, interface {}, group {}:{}",
            self.mode, self.interface_addr, MULTICAST_GROUP, MULTICAST_PORT
        );

        if self.tx_socket.is_none() {
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
                .map_err(SetupError::TransmitSocket)?;
            // hear our own multicast back; the receive path filters the echo.
            socket
                .set_multicast_loop_v4(true)
                .map_err(SetupError::MulticastLoop)?;
            socket
                .set_multicast_if_v4(&self.interface_addr)
                .map_err(|source| SetupError::MulticastIf {
                    iface: self.interface_addr,
                    source,
                })?;
            let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
            socket
                .bind(&bind_addr.into())
                .map_err(SetupError::TransmitBind)?;
            self.tx_socket = Some(socket.into());
        }

        // a public mode makes "TTL 0" privacy meaningless.
        if matches!(self.mode, Mode::Speaker | Mode::Audience) {
            self.set_private(false);
        }

        if self.rx_socket.is_none() {
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
                .map_err(SetupError::ReceiveSocket)?;
            socket
                .set_reuse_address(true)
                .map_err(SetupError::ReuseAddr)?;
            // several engines on one host share the port where the platform
            // allows it.
            #[cfg(not(target_os = "windows"))]
            {
                if let Err(err) = socket.set_reuse_port(true) {
                    warn!("SO_REUSEPORT failed (non-fatal): {err}");
                }
            }
            socket
                .set_nonblocking(true)
                .map_err(SetupError::Nonblocking)?;
            let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MULTICAST_PORT);
            socket.bind(&bind_addr.into()).map_err(SetupError::Bind)?;
            socket
                .join_multicast_v4(&MULTICAST_GROUP, &self.interface_addr)
                .map_err(SetupError::Membership)?;
            self.rx_socket = Some(socket.into());
        }

        if self.mode.is_speaker_role() {
            let _ = self.transmit_internal(MessageType::Beacon, "", "", "", "", "");
            self.beacon_countdown = BEACON_INTERVAL_TICKS;
            if self.mode == Mode::Speaker {
                // a speaker listens to no one.
                self.clear_speakers();
            }
        } else {
            self.beacon_countdown = 0;
        }

        let _ = self.transmit_internal(MessageType::Announce, "", "", "", "", "");
        Ok(())
    }

    /// Close sockets, report every registered speaker as departed, and
    /// detach the sink. Idempotent.
    pub fn shutdown(&mut self) {
        self.clear_speakers();
        self.tx_socket = None;
        self.rx_socket = None;
        self.mode = Mode::Disabled;
        self.sink = None;
    }

    // ── Speaker registry operations ─────────────────────────────────────

    /// Follow or unfollow a speaker by the UUID given in its `S` event.
    pub fn listen_to(&mut self, uuid: &str, listen: bool) {
        self.speakers.listen(uuid, listen);
    }

    /// Wipe the registry, reporting each entry's departure first.
    pub fn clear_speakers(&mut self) {
        for uuid in self.speakers.clear_all() {
            self.dispatch(NavEvent::departed(uuid));
        }
    }

    // ── Privacy ─────────────────────────────────────────────────────────

    /// In personal mode, set multicast TTL 0 so packets stay on this host.
    /// Best effort only — some stacks still deliver to local listeners, and
    /// nothing about it is a security boundary. Any other mode forces TTL 1.
    pub fn set_private(&mut self, privacy: bool) -> bool {
        let privacy = privacy && self.mode == Mode::Personal;
        let ttl = u32::from(!privacy);
        match &self.tx_socket {
            Some(socket) => socket.set_multicast_ttl_v4(ttl).is_ok(),
            None => false,
        }
    }

    // ── Receive path ────────────────────────────────────────────────────

    /// Drain all queued datagrams, then run the periodic tick (speaker
    /// aging, beacon cadence). Never blocks. Returns `false` once the engine
    /// is disabled — the host should stop scheduling the poll.
    pub fn receive_poll(&mut self) -> bool {
        if self.mode == Mode::Disabled {
            return false;
        }
        if self.sink.is_none() || self.rx_socket.is_none() {
            return true;
        }

        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let received = match &self.rx_socket {
                Some(socket) => socket.recv_from(&mut buf),
                None => break, // closed from inside a callback
            };
            match received {
                Ok((len, SocketAddr::V4(source))) => {
                    self.handle_datagram(&buf[..len], *source.ip());
                }
                Ok((_, SocketAddr::V6(_))) => {} // cannot happen on an IPv4 socket
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    self.dispatch(NavEvent::diagnostic(
                        EventKind::Error,
                        format!("{DIAG}receive failed: {err}"),
                        String::new(),
                    ));
                    break;
                }
            }
            if self.mode == Mode::Disabled {
                return false;
            }
        }

        self.tick();
        self.mode != Mode::Disabled
    }

    /// Post-drain work: age the registry and keep the beacon cadence.
    fn tick(&mut self) {
        for uuid in self.speakers.age_tick() {
            self.dispatch(NavEvent::departed(uuid));
        }

        if self.mode.is_speaker_role() {
            self.beacon_countdown = self.beacon_countdown.saturating_sub(1);
            if self.beacon_countdown == 0 {
                let _ = self.transmit_internal(MessageType::Beacon, "", "", "", "", "");
                self.beacon_countdown = BEACON_INTERVAL_TICKS;
            }
        }
    }

    /// Validate and dispatch one received datagram.
    fn handle_datagram(&mut self, datagram: &[u8], source: Ipv4Addr) {
        let source_addr = source.to_string();

        let Some(header) = Header::read(datagram) else {
            self.dispatch(NavEvent::diagnostic(
                EventKind::Error,
                format!("{DIAG}{}", protocol::ProtocolError::ShortPacket),
                format!("[{source_addr}]\n{}-byte datagram", datagram.len()),
            ));
            return;
        };
        let body = &datagram[HEADER_SIZE..];
        let dump = protocol::render_dump(&source_addr, &header, body);

        let msg_type = match header.validate() {
            Ok(msg_type) => msg_type,
            Err(err) => {
                self.dispatch(NavEvent::diagnostic(
                    EventKind::Error,
                    format!("{DIAG}{err}"),
                    dump,
                ));
                return;
            }
        };

        let content = match protocol::parse_body(body) {
            Ok(content) => content,
            Err(err) => {
                self.dispatch(NavEvent::diagnostic(
                    EventKind::Error,
                    format!("{DIAG}{err}"),
                    dump,
                ));
                return;
            }
        };

        // report every missing required field, not just the first.
        let mut complete = true;
        for i in 0..protocol::required_count(msg_type) {
            let name = protocol::required_field(msg_type, i);
            if !content.contains_key(name) {
                complete = false;
                self.dispatch(NavEvent::diagnostic(
                    EventKind::Error,
                    format!("{DIAG}missing required header {name}."),
                    dump.clone(),
                ));
            }
        }
        if !complete {
            return;
        }

        // loopback is enabled, so our own datagrams come back; drop them.
        if header.uuid == *self.uuid.as_bytes() {
            return;
        }

        let field = |name: &str| content.get(name).cloned().unwrap_or_default();
        let pkt_uuid = field(APP_INSTANCE_UUID);

        // anti-spoof: a registered uuid is bound to the address its first
        // beacon came from, for every message type.
        let mut listening = false;
        if let Some(entry) = self.speakers.lookup(&pkt_uuid) {
            if entry.addr != source_addr {
                let mut event = NavEvent::diagnostic(
                    EventKind::Mismatch,
                    format!(
                        "{DIAG}Spoof stopped: {pkt_uuid} from {source_addr} instead of {}",
                        entry.addr
                    ),
                    dump,
                );
                event.uuid = pkt_uuid;
                self.dispatch(event);
                return;
            }
            listening = entry.listen;
        }

        let passphrase_ok = content.get(MSG_PASSPHRASE).map(String::as_str)
            == Some(self.passphrase.as_str());
        let user = field(APP_USER);
        let mut app_version = field(APP_VERSION);
        if app_version.is_empty() {
            app_version = "(version?)".into();
        }
        let display = format!("{} {}", field(APP_NAME), app_version);

        let mut bible = String::from(FILLER);
        let mut reference = String::from(FILLER);
        let mut alt = String::from(FILLER);
        let mut group = String::from(FILLER);
        let mut domain = String::from(FILLER);
        let mut info = String::from(FILLER);
        let kind;

        match msg_type {
            MessageType::Announce => {
                bible = user.clone();
                reference = source_addr.clone();
                group = display.clone();
                domain = field(APP_DEVICE);
                alt = format!("{DIAG}{user} present at {source_addr} using {display}.");
                info = format!("announce: {user} @ {source_addr}");
                kind = if passphrase_ok {
                    EventKind::Announce
                } else {
                    EventKind::Mismatch
                };
            }
            MessageType::Beacon => {
                bible = user.clone();
                reference = source_addr.clone();
                group = display.clone();
                domain = field(APP_DEVICE);
                info = format!("beacon: {user} @ {source_addr}");
                let auto_follow = self.mode != Mode::Speaker;
                match self
                    .speakers
                    .observe_beacon(&pkt_uuid, &source_addr, passphrase_ok, auto_follow)
                {
                    BeaconDisposition::Mismatch => kind = EventKind::Mismatch,
                    BeaconDisposition::NewSpeaker { .. } => kind = EventKind::NewSpeaker,
                    // known speaker refreshed: nothing the host needs to hear.
                    BeaconDisposition::Known => return,
                    BeaconDisposition::Spoof { pinned } => {
                        kind = EventKind::Mismatch;
                        info = format!(
                            "{DIAG}Spoof stopped: {pkt_uuid} from {source_addr} instead of {pinned}"
                        );
                    }
                }
            }
            MessageType::Sync => {
                bible = field(MSG_SYNC_BIBLEABBREV);
                reference = field(MSG_SYNC_VERSE);
                alt = field(MSG_SYNC_ALTVERSE);
                group = field(MSG_SYNC_GROUP);
                domain = field(MSG_SYNC_DOMAIN);
                if domain != "BIBLE-VERSE" {
                    kind = EventKind::Error;
                    info = format!("{DIAG}Domain not 'BIBLE-VERSE': {domain}");
                } else if group.len() != 1 || !matches!(group.as_bytes()[0], b'1'..=b'9') {
                    kind = EventKind::Error;
                    info = format!("{DIAG}Invalid group: {group}");
                } else if matches!(self.mode, Mode::Personal | Mode::Audience)
                    && listening
                    && passphrase_ok
                {
                    kind = EventKind::Navigation;
                } else {
                    kind = EventKind::Mismatch;
                    info = format!("sync: {user} @ {source_addr}");
                }
            }
            MessageType::Chat => {
                bible = user.clone();
                reference = source_addr.clone();
                group = display.clone();
                domain = field(APP_DEVICE);
                alt = field(MSG_CHAT);
                info = format!("chat: {user} @ {source_addr}");
                kind = if passphrase_ok {
                    EventKind::Chat
                } else {
                    EventKind::Mismatch
                };
            }
        }

        self.receiving = true;
        self.dispatch(NavEvent {
            kind,
            uuid: pkt_uuid,
            bible,
            reference,
            alt,
            group,
            domain,
            info,
            dump,
        });
        self.receiving = false;
    }

    // ── Transmit path ───────────────────────────────────────────────────

    /// Send one message. For chat, `bible` carries the message text (any
    /// embedded newline becomes a tab); the verse fields are unused. A send
    /// failure is fatal: the engine reports it and disables itself.
    pub fn transmit(
        &mut self,
        msg_type: MessageType,
        bible: &str,
        reference: &str,
        alt: &str,
        group: &str,
        domain: &str,
    ) -> Result<(), XmitError> {
        self.transmit_internal(msg_type, bible, reference, alt, group, domain)
    }

    fn transmit_internal(
        &mut self,
        msg_type: MessageType,
        bible: &str,
        reference: &str,
        alt: &str,
        group: &str,
        domain: &str,
    ) -> Result<(), XmitError> {
        if self.mode == Mode::Disabled {
            return Err(XmitError::Disabled);
        }
        // a host mirroring inbound navigation back out would loop the LAN.
        if self.receiving && msg_type == MessageType::Sync {
            return Err(XmitError::Receiving);
        }
        if self.tx_socket.is_none() {
            return Err(XmitError::NoSocket);
        }
        if !self.mode.may_transmit(msg_type) {
            return Err(XmitError::AudienceXmit);
        }

        let mut content: HashMap<&str, String> = HashMap::new();
        content.insert(APP_NAME, self.application.clone());
        content.insert(APP_VERSION, self.version.clone());
        content.insert(APP_INSTANCE_UUID, self.uuid_string.clone());
        content.insert(APP_OS, env::consts::OS.to_owned());
        content.insert(APP_DEVICE, self.device.clone());
        content.insert(APP_USER, self.user.clone());
        content.insert(MSG_PASSPHRASE, self.passphrase.clone());
        if msg_type == MessageType::Chat {
            content.insert(MSG_CHAT, protocol::sanitize_chat(bible));
        } else {
            content.insert(MSG_SYNC_BIBLEABBREV, bible.to_owned());
        }
        content.insert(MSG_SYNC_VERSE, reference.to_owned());
        content.insert(MSG_SYNC_ALTVERSE, alt.to_owned());
        content.insert(MSG_SYNC_GROUP, group.to_owned());
        content.insert(MSG_SYNC_DOMAIN, domain.to_owned());

        let datagram = protocol::encode(msg_type, self.uuid.as_bytes(), &content);
        let destination = SocketAddrV4::new(MULTICAST_GROUP, MULTICAST_PORT);

        let sent = match &self.tx_socket {
            Some(socket) => socket.send_to(&datagram, destination),
            None => return Err(XmitError::NoSocket),
        };
        match sent {
            Ok(_) => {
                debug!("sent {} ({} bytes)", msg_type.name(), datagram.len());
                Ok(())
            }
            Err(err) => {
                warn!("multicast send failed: {err}");
                self.dispatch(NavEvent::diagnostic(
                    EventKind::Error,
                    format!("{DIAG}Transmit failed."),
                    "Unable to multicast; BibleSync is now disabled. If your network \
                     connection changed while this program was active, it may be \
                     sufficient to re-enable."
                        .into(),
                ));
                self.shutdown();
                Err(XmitError::SendFailed)
            }
        }
    }

    // ── Event delivery ──────────────────────────────────────────────────

    /// Hand one event to the host sink. The sink is moved out for the call
    /// so it may re-enter the engine; it is not restored if the callback
    /// disabled the engine (which also detaches the sink).
    fn dispatch(&mut self, event: NavEvent) {
        if let Some(mut sink) = self.sink.take() {
            sink.on_event(self, &event);
            if self.sink.is_none() && self.mode != Mode::Disabled {
                self.sink = Some(sink);
            }
        }
    }
}

impl Drop for BibleSync {
    fn drop(&mut self) {
        if self.tx_socket.is_some() || self.rx_socket.is_some() {
            self.shutdown();
        }
    }
}
