//! BibleSync wire protocol: framing constants, the fixed 32-byte header, and
//! the `name=value\n` body dictionary.
//!
//! Every message is a single UDP datagram: header first, then up to
//! [`MAX_PAYLOAD`] bytes of body. The body is a flat list of `name=value`
//! records, one per line. Which fields a message must carry on receive, and
//! which fields it is filled with on transmit, depends on the message type —
//! the per-type tables live here so that every other module speaks the same
//! language.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use thiserror::Error;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Constants
// ────────────────────────────────────────────────────────────────────────────

/// Magic constant leading every datagram, big-endian on the wire.
pub const PROTOCOL_MAGIC: u32 = 0x409C_AF11;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 0x02;

/// Previous protocol version, still accepted on receive. It predates chat.
pub const COMPAT_VERSION: u8 = 0x01;

/// Well-known multicast group shared by every BibleSync participant.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 225, 27, 227);

/// Well-known UDP port on the multicast group.
pub const MULTICAST_PORT: u16 = 22272;

/// Size of the fixed header preceding the body.
pub const HEADER_SIZE: usize = 32;

/// Largest datagram ever transmitted; longer bodies are cut off.
pub const MAX_DATAGRAM: usize = 1280;

/// Body capacity left after the header.
pub const MAX_PAYLOAD: usize = MAX_DATAGRAM - HEADER_SIZE;

/// Receive-poll ticks between outgoing beacons while in a speaker role.
pub const BEACON_INTERVAL_TICKS: u32 = 10;

/// A speaker entry lives `BEACON_INTERVAL_TICKS * BEACON_LIVENESS_MULTIPLIER`
/// ticks past its latest beacon, i.e. roughly three missed beacons.
pub const BEACON_LIVENESS_MULTIPLIER: u32 = 3;

// ────────────────────────────────────────────────────────────────────────────
// Body field names
// ────────────────────────────────────────────────────────────────────────────

pub const APP_NAME: &str = "app.name";
pub const APP_VERSION: &str = "app.version";
pub const APP_INSTANCE_UUID: &str = "app.inst.uuid";
pub const APP_OS: &str = "app.os";
pub const APP_DEVICE: &str = "app.device";
pub const APP_USER: &str = "app.user";
pub const MSG_PASSPHRASE: &str = "msg.sync.passPhrase";
pub const MSG_SYNC_BIBLEABBREV: &str = "msg.sync.bibleAbbrev";
pub const MSG_SYNC_DOMAIN: &str = "msg.sync.domain";
pub const MSG_SYNC_VERSE: &str = "msg.sync.verse";
pub const MSG_SYNC_ALTVERSE: &str = "msg.sync.altVerse";
pub const MSG_SYNC_GROUP: &str = "msg.sync.group";
pub const MSG_CHAT: &str = "msg.chat";

// ────────────────────────────────────────────────────────────────────────────
// Message types
// ────────────────────────────────────────────────────────────────────────────

/// The four message types of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// One-shot presence advertisement.
    Announce,
    /// Navigation update: which scripture reference to display.
    Sync,
    /// Periodic liveness heartbeat from a transmitting peer.
    Beacon,
    /// Short free-text message.
    Chat,
}

impl MessageType {
    /// Decode the wire byte; `None` for anything out of range.
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Announce),
            2 => Some(MessageType::Sync),
            3 => Some(MessageType::Beacon),
            4 => Some(MessageType::Chat),
            _ => None,
        }
    }

    /// The byte this type is written as on the wire.
    pub fn to_wire(self) -> u8 {
        match self {
            MessageType::Announce => 1,
            MessageType::Sync => 2,
            MessageType::Beacon => 3,
            MessageType::Chat => 4,
        }
    }

    /// Symbolic name used in raw-dump renderings.
    pub fn name(self) -> &'static str {
        match self {
            MessageType::Announce => "announce",
            MessageType::Sync => "sync",
            MessageType::Beacon => "beacon",
            MessageType::Chat => "chat",
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Per-type field tables
// ────────────────────────────────────────────────────────────────────────────

// Chat is a near-superset of announce/beacon and sync a superset of chat;
// the chat-specific field substitutes for msg.sync.bibleAbbrev at a fixed
// index in both tables.

/// Required inbound fields, in diagnostic order. Sync requires all eight;
/// announce and beacon the first four; chat the first four plus `msg.chat`
/// in place of the abbreviation slot.
const INBOUND_REQUIRED: [&str; 8] = [
    APP_NAME,
    APP_INSTANCE_UUID,
    APP_USER,
    MSG_PASSPHRASE,
    MSG_SYNC_BIBLEABBREV,
    MSG_SYNC_DOMAIN,
    MSG_SYNC_VERSE,
    MSG_SYNC_GROUP,
];
const CHAT_INBOUND_INDEX: usize = 4;

/// Outbound fill order. Later fields are sacrificed first when the body
/// overflows [`MAX_PAYLOAD`]; the verse reference goes last because it is
/// the field most likely to grow long.
const OUTBOUND_FILL: [&str; 12] = [
    APP_NAME,
    APP_VERSION,
    APP_INSTANCE_UUID,
    APP_OS,
    APP_DEVICE,
    APP_USER,
    MSG_PASSPHRASE,
    MSG_SYNC_BIBLEABBREV,
    MSG_SYNC_DOMAIN,
    MSG_SYNC_GROUP,
    MSG_SYNC_ALTVERSE,
    MSG_SYNC_VERSE,
];
const CHAT_OUTBOUND_INDEX: usize = 7;

/// How many entries of the inbound table a message of this type must carry.
pub fn required_count(msg_type: MessageType) -> usize {
    match msg_type {
        MessageType::Announce | MessageType::Beacon => 4,
        MessageType::Chat => 5,
        MessageType::Sync => 8,
    }
}

/// The `index`-th required inbound field for this message type.
pub fn required_field(msg_type: MessageType, index: usize) -> &'static str {
    if msg_type == MessageType::Chat && index == CHAT_INBOUND_INDEX {
        MSG_CHAT
    } else {
        INBOUND_REQUIRED[index]
    }
}

/// How many entries of the outbound table a message of this type is filled
/// with.
pub fn fill_count(msg_type: MessageType) -> usize {
    match msg_type {
        MessageType::Sync => 12,
        _ => 8,
    }
}

/// The `index`-th outbound field for this message type.
pub fn fill_field(msg_type: MessageType, index: usize) -> &'static str {
    if msg_type == MessageType::Chat && index == CHAT_OUTBOUND_INDEX {
        MSG_CHAT
    } else {
        OUTBOUND_FILL[index]
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Per-datagram validation failures. None of these are fatal to the engine;
/// each is reported to the host and the datagram dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("short packet")]
    ShortPacket,
    #[error("bad magic")]
    BadMagic,
    #[error("bad protocol version")]
    BadVersion,
    #[error("bad msg type")]
    BadMsgType,
    #[error("chat unavailable in old protocol")]
    OldProtocolChat,
    #[error("bad packet count")]
    BadPacketCount,
    #[error("bad packet index")]
    BadPacketIndex,
    #[error("bad body format")]
    BadBodyFormat,
}

// ────────────────────────────────────────────────────────────────────────────
// Header
// ────────────────────────────────────────────────────────────────────────────

/// The fixed header, as read off the wire. Fields are kept raw so that a
/// rejected datagram can still be rendered for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub version: u8,
    pub msg_type: u8,
    pub num_packets: u8,
    pub index_packet: u8,
    pub uuid: [u8; 16],
}

impl Header {
    /// Read the header off the front of a datagram. `None` when the datagram
    /// is shorter than [`HEADER_SIZE`].
    pub fn read(datagram: &[u8]) -> Option<Self> {
        if datagram.len() < HEADER_SIZE {
            return None;
        }
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&datagram[8..24]);
        Some(Header {
            magic: u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]),
            version: datagram[4],
            msg_type: datagram[5],
            num_packets: datagram[6],
            index_packet: datagram[7],
            uuid,
        })
    }

    /// Check every fixed field, in diagnostic order. A version-1 datagram
    /// claiming to be chat is rejected: that version predates chat.
    pub fn validate(&self) -> Result<MessageType, ProtocolError> {
        if self.magic != PROTOCOL_MAGIC {
            return Err(ProtocolError::BadMagic);
        }
        if self.version != PROTOCOL_VERSION && self.version != COMPAT_VERSION {
            return Err(ProtocolError::BadVersion);
        }
        let msg_type = MessageType::from_wire(self.msg_type).ok_or(ProtocolError::BadMsgType)?;
        if self.version == COMPAT_VERSION && msg_type == MessageType::Chat {
            return Err(ProtocolError::OldProtocolChat);
        }
        if self.num_packets != 1 {
            return Err(ProtocolError::BadPacketCount);
        }
        if self.index_packet != 0 {
            return Err(ProtocolError::BadPacketIndex);
        }
        Ok(msg_type)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Encode / decode
// ────────────────────────────────────────────────────────────────────────────

/// Assemble a complete datagram: header, then the outbound fields for
/// `msg_type` in fill order, drawn from `content` (missing entries encode as
/// empty values). Bodies that would overflow [`MAX_PAYLOAD`] are cut in fill
/// order, and the cut lands only inside a value: a record that has no room
/// for even its `name=` and terminator is dropped along with everything
/// after it, so every record on the wire still parses. The final byte is
/// forced to `\n` as the datagram-level guarantee.
pub fn encode(msg_type: MessageType, uuid: &[u8; 16], content: &HashMap<&str, String>) -> Vec<u8> {
    let mut body = Vec::with_capacity(256);
    for i in 0..fill_count(msg_type) {
        let name = fill_field(msg_type, i);
        if body.len() + name.len() + 2 > MAX_PAYLOAD {
            break;
        }
        body.extend_from_slice(name.as_bytes());
        body.push(b'=');
        let value = content.get(name).map(String::as_str).unwrap_or("");
        let room = MAX_PAYLOAD - body.len() - 1; // keep a byte for the terminator
        body.extend_from_slice(&value.as_bytes()[..value.len().min(room)]);
        body.push(b'\n');
    }

    let mut datagram = Vec::with_capacity(HEADER_SIZE + body.len());
    datagram.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
    datagram.push(PROTOCOL_VERSION);
    datagram.push(msg_type.to_wire());
    datagram.push(1); // num_packets
    datagram.push(0); // index_packet
    datagram.extend_from_slice(uuid);
    datagram.extend_from_slice(&[0u8; 8]); // reserved
    datagram.extend_from_slice(&body);

    if let Some(last) = datagram.last_mut() {
        *last = b'\n';
    }
    datagram
}

/// Chat text travels in a single body record, so an embedded newline would
/// end the record early; it becomes a tab before transmission.
pub fn sanitize_chat(text: &str) -> String {
    text.replace('\n', "\t")
}

/// Parse a body into its `(name, value)` records. A record must contain an
/// `=` before its terminating `\n`; a duplicated name keeps its last value.
/// Bytes are decoded as UTF-8, lossily.
pub fn parse_body(body: &[u8]) -> Result<HashMap<String, String>, ProtocolError> {
    let mut fields = HashMap::new();
    let mut rest = body;
    while !rest.is_empty() {
        let newline = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(ProtocolError::BadBodyFormat)?;
        let record = &rest[..newline];
        rest = &rest[newline + 1..];

        let eq = record
            .iter()
            .position(|&b| b == b'=')
            .ok_or(ProtocolError::BadBodyFormat)?;
        let name = String::from_utf8_lossy(&record[..eq]).into_owned();
        let value = String::from_utf8_lossy(&record[eq + 1..]).into_owned();
        fields.insert(name, value);
    }
    Ok(fields)
}

/// Render a datagram for the `raw_dump` diagnostic field: source address,
/// decoded header, then the body verbatim.
pub fn render_dump(source_addr: &str, header: &Header, body: &[u8]) -> String {
    let type_name = MessageType::from_wire(header.msg_type)
        .map(MessageType::name)
        .unwrap_or("*???*");
    format!(
        "[{}]\nmagic: 0x{:08x}\nversion: 0x{:02x}\ntype: 0x{:02x} ({})\n\
         uuid: {}\n#pkt: {}\npkt index: {}\n\n-*- body -*-\n{}",
        source_addr,
        header.magic,
        header.version,
        header.msg_type,
        type_name,
        Uuid::from_bytes(header.uuid).hyphenated(),
        header.num_packets,
        header.index_packet,
        String::from_utf8_lossy(body),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content_for(pairs: &[(&'static str, &str)]) -> HashMap<&'static str, String> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn header_round_trips_through_encode() {
        let uuid = [7u8; 16];
        let datagram = encode(MessageType::Sync, &uuid, &HashMap::new());
        let header = Header::read(&datagram).unwrap();
        assert_eq!(header.magic, PROTOCOL_MAGIC);
        assert_eq!(header.version, PROTOCOL_VERSION);
        assert_eq!(header.uuid, uuid);
        assert_eq!(header.validate(), Ok(MessageType::Sync));
    }

    #[test]
    fn validate_rejects_each_bad_fixed_field() {
        let good = Header {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            msg_type: 2,
            num_packets: 1,
            index_packet: 0,
            uuid: [0; 16],
        };
        assert!(good.validate().is_ok());

        let mut h = good;
        h.magic = 0xdead_beef;
        assert_eq!(h.validate(), Err(ProtocolError::BadMagic));

        let mut h = good;
        h.version = 3;
        assert_eq!(h.validate(), Err(ProtocolError::BadVersion));

        let mut h = good;
        h.msg_type = 9;
        assert_eq!(h.validate(), Err(ProtocolError::BadMsgType));

        let mut h = good;
        h.num_packets = 2;
        assert_eq!(h.validate(), Err(ProtocolError::BadPacketCount));

        let mut h = good;
        h.index_packet = 1;
        assert_eq!(h.validate(), Err(ProtocolError::BadPacketIndex));
    }

    #[test]
    fn old_version_accepted_except_for_chat() {
        let mut h = Header {
            magic: PROTOCOL_MAGIC,
            version: COMPAT_VERSION,
            msg_type: 3,
            num_packets: 1,
            index_packet: 0,
            uuid: [0; 16],
        };
        assert_eq!(h.validate(), Ok(MessageType::Beacon));
        h.msg_type = 4;
        assert_eq!(h.validate(), Err(ProtocolError::OldProtocolChat));
    }

    #[test]
    fn body_parse_last_duplicate_wins() {
        let fields = parse_body(b"a=1\nb=2\na=3\n").unwrap();
        assert_eq!(fields["a"], "3");
        assert_eq!(fields["b"], "2");
    }

    #[test]
    fn body_parse_rejects_missing_separator_and_terminator() {
        assert_eq!(parse_body(b"a=1\nnope\n"), Err(ProtocolError::BadBodyFormat));
        assert_eq!(parse_body(b"a=1\nb=2"), Err(ProtocolError::BadBodyFormat));
        assert_eq!(parse_body(b"\n"), Err(ProtocolError::BadBodyFormat));
        assert!(parse_body(b"").unwrap().is_empty());
    }

    #[test]
    fn encode_ends_in_newline_and_respects_cap() {
        let long_verse = "x".repeat(4 * MAX_DATAGRAM);
        let content = content_for(&[
            (APP_NAME, "Test"),
            (MSG_PASSPHRASE, "BibleSync"),
            (MSG_SYNC_VERSE, &long_verse),
        ]);
        let datagram = encode(MessageType::Sync, &[0; 16], &content);
        assert_eq!(datagram.len(), MAX_DATAGRAM);
        assert_eq!(*datagram.last().unwrap(), b'\n');
        // everything before the overlong verse survived intact.
        let fields = parse_body(&datagram[HEADER_SIZE..]).unwrap();
        assert_eq!(fields[APP_NAME], "Test");
        assert_eq!(fields[MSG_PASSPHRASE], "BibleSync");
    }

    #[test]
    fn truncation_sacrifices_later_fields_first() {
        // a long group pushes altVerse and verse past the cap but stays
        // parseable because the forced final newline closes the cut field.
        let content = content_for(&[
            (APP_NAME, "Test"),
            (MSG_SYNC_GROUP, &"g".repeat(MAX_PAYLOAD)),
            (MSG_SYNC_VERSE, "Gen.1.1"),
        ]);
        let datagram = encode(MessageType::Sync, &[0; 16], &content);
        let fields = parse_body(&datagram[HEADER_SIZE..]).unwrap();
        assert_eq!(fields[APP_NAME], "Test");
        assert!(!fields.contains_key(MSG_SYNC_VERSE));
    }

    #[test]
    fn chat_fill_substitutes_chat_for_abbreviation() {
        let content = content_for(&[(MSG_CHAT, "hello there"), (APP_USER, "alice")]);
        let datagram = encode(MessageType::Chat, &[0; 16], &content);
        let fields = parse_body(&datagram[HEADER_SIZE..]).unwrap();
        assert_eq!(fields[MSG_CHAT], "hello there");
        assert!(!fields.contains_key(MSG_SYNC_BIBLEABBREV));
        // chat carries no verse fields at all.
        assert!(!fields.contains_key(MSG_SYNC_VERSE));
    }

    #[test]
    fn truncation_cut_never_lands_inside_a_name() {
        // sweep the overflow point across the record boundary after the
        // group field; a cut inside the next record's name would make the
        // whole body unparseable, so every sweep position must decode.
        for extra in 0..64 {
            let group = "g".repeat(MAX_PAYLOAD - 190 + extra);
            let content = content_for(&[
                (APP_NAME, "Test"),
                (MSG_SYNC_GROUP, &group),
                (MSG_SYNC_VERSE, "Gen.1.1"),
            ]);
            let datagram = encode(MessageType::Sync, &[0; 16], &content);
            assert!(datagram.len() <= MAX_DATAGRAM);
            let fields = parse_body(&datagram[HEADER_SIZE..])
                .unwrap_or_else(|err| panic!("unparseable body at extra={extra}: {err}"));
            assert_eq!(fields[APP_NAME], "Test");
        }
    }

    #[test]
    fn oversized_chat_truncates_cleanly_with_tabs_for_newlines() {
        let text = format!("line one\nline two\n{}", "y".repeat(2 * MAX_PAYLOAD));
        let content = content_for(&[
            (APP_NAME, "Test"),
            (APP_USER, "alice"),
            (MSG_PASSPHRASE, "BibleSync"),
            (MSG_CHAT, &sanitize_chat(&text)),
        ]);
        let datagram = encode(MessageType::Chat, &[0; 16], &content);
        assert_eq!(datagram.len(), MAX_DATAGRAM);
        assert_eq!(*datagram.last().unwrap(), b'\n');
        let fields = parse_body(&datagram[HEADER_SIZE..]).unwrap();
        let chat = &fields[MSG_CHAT];
        assert!(chat.starts_with("line one\tline two\t"));
        assert!(!chat.contains('\n'));
    }

    #[test]
    fn required_tables_match_type_supersets() {
        assert_eq!(required_count(MessageType::Announce), 4);
        assert_eq!(required_count(MessageType::Beacon), 4);
        assert_eq!(required_count(MessageType::Chat), 5);
        assert_eq!(required_count(MessageType::Sync), 8);
        assert_eq!(required_field(MessageType::Chat, 4), MSG_CHAT);
        assert_eq!(required_field(MessageType::Sync, 4), MSG_SYNC_BIBLEABBREV);
    }
}
