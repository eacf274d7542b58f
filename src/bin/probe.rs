//! `bsp-probe` — join a BibleSync session from a terminal and watch the
//! traffic. Handy for checking that two machines can see each other before
//! wiring up a real application, and for sending one-shot test messages:
//!
//! ```text
//! bsp-probe                         # join and log everything
//! bsp-probe --chat "hello room"     # also send one chat message
//! bsp-probe --sync KJV Gen.1.1      # also send one navigation (speaker roles)
//! ```
//!
//! Configuration is read from `probe.toml` in the working directory; a
//! commented template is written on first run.

use anyhow::{anyhow, Result};
use biblesync::config::Config;
use biblesync::{BibleSync, EventKind, MessageType, Mode, NavEvent};
use simplelog::{ColorChoice, LevelFilter, TermLogger, TerminalMode};
use std::time::Duration;

fn setup_logger() {
    TermLogger::init(
        LevelFilter::Info,
        simplelog::Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .ok();
}

/// One message to transmit once the engine is up.
enum OneShot {
    Chat(String),
    Sync { bible: String, verse: String },
}

fn parse_args() -> Result<Option<OneShot>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None => Ok(None),
        Some("--chat") => {
            let text = args
                .get(1)
                .ok_or_else(|| anyhow!("--chat needs the message text"))?;
            Ok(Some(OneShot::Chat(text.clone())))
        }
        Some("--sync") => {
            let bible = args
                .get(1)
                .ok_or_else(|| anyhow!("--sync needs <bible> <verse>"))?;
            let verse = args
                .get(2)
                .ok_or_else(|| anyhow!("--sync needs <bible> <verse>"))?;
            Ok(Some(OneShot::Sync {
                bible: bible.clone(),
                verse: verse.clone(),
            }))
        }
        Some(other) => Err(anyhow!("unknown argument: {other}")),
    }
}

fn log_event(event: &NavEvent) {
    match event.kind {
        EventKind::Navigation => {
            log::info!(
                "[N] {} navigate {} {} (group {})",
                event.uuid,
                event.bible,
                event.reference,
                event.group
            );
        }
        EventKind::Announce => log::info!("[A] {}", event.alt),
        EventKind::NewSpeaker => {
            log::info!("[S] new speaker {} at {}", event.uuid, event.reference)
        }
        EventKind::SpeakerGone => log::info!("[D] speaker {} departed", event.uuid),
        EventKind::Chat => log::info!("[C] {} says: {}", event.bible, event.alt),
        EventKind::Mismatch => log::info!("[M] {}", event.info),
        EventKind::Error => log::warn!("[E] {}\n{}", event.info, event.dump),
    }
}

fn main() -> Result<()> {
    setup_logger();

    let cfg = Config::load()?;
    let mode = cfg.mode()?;
    let one_shot = parse_args()?;

    let user = cfg.user.clone().unwrap_or_else(|| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "probe".into())
    });

    let mut engine = BibleSync::new("bsp-probe", env!("CARGO_PKG_VERSION"), &user);
    log::info!("instance uuid {}", engine.uuid_string());

    let effective = engine.set_mode(
        mode,
        Some(Box::new(|_: &mut BibleSync, event: &NavEvent| {
            log_event(event)
        })),
        &cfg.passphrase,
    );
    if effective == Mode::Disabled {
        return Err(anyhow!("engine setup failed; see log above"));
    }
    log::info!("joined as {:?} ({})", effective, user);

    if cfg.private {
        engine.set_private(true);
    }

    if let Some(one_shot) = one_shot {
        let result = match one_shot {
            OneShot::Chat(text) => engine.transmit(MessageType::Chat, &text, "", "", "", ""),
            OneShot::Sync { bible, verse } => engine.transmit(
                MessageType::Sync,
                &bible,
                &verse,
                "",
                "1",
                "BIBLE-VERSE",
            ),
        };
        if let Err(err) = result {
            log::warn!("one-shot transmit refused: {err}");
        }
    }

    let interval = Duration::from_millis(cfg.poll_interval_ms.max(50));
    while engine.receive_poll() {
        std::thread::sleep(interval);
    }
    log::info!("engine disabled; exiting");
    Ok(())
}
