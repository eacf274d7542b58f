//! Configuration for the bundled `bsp-probe` tool.
//!
//! Library hosts configure the engine through [`BibleSync::new`] and
//! [`BibleSync::set_mode`] directly; this file-based layer exists so the
//! probe can join a session without command-line ceremony.
//!
//! [`BibleSync::new`]: crate::engine::BibleSync::new
//! [`BibleSync::set_mode`]: crate::engine::BibleSync::set_mode

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::event::Mode;

const CONFIG_FILE: &str = "probe.toml";

const TEMPLATE: &str = "\
# bsp-probe configuration
# user = \"alice\"
# passphrase = \"BibleSync\"
# mode = \"audience\"  # personal | speaker | audience
# private = false     # personal mode: keep packets on this host
# poll_interval_ms = 333
";

fn default_passphrase() -> String {
    "BibleSync".to_string()
}

fn default_mode() -> String {
    "audience".to_string()
}

// A few polls per second keeps speaker expiry near the intended wall-clock
// feel of ten-second beacon intervals.
fn default_poll_interval_ms() -> u64 {
    333
}

#[derive(Deserialize)]
pub struct Config {
    /// Name shown to other participants; defaults to the local hostname.
    pub user: Option<String>,
    /// Shared session passphrase.
    #[serde(default = "default_passphrase")]
    pub passphrase: String,
    /// One of "personal", "speaker", "audience".
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Personal mode only: keep multicast on this host (TTL 0).
    #[serde(default)]
    pub private: bool,
    /// How often the engine is polled for received datagrams.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Config {
    /// Load `probe.toml` from the working directory. On the very first run
    /// there is nothing to load yet, so a commented template is dropped in
    /// place for the user to edit.
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::path()?;
        match fs::read_to_string(&path) {
            Ok(raw) => {
                toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                fs::write(&path, TEMPLATE)
                    .with_context(|| format!("writing template {}", path.display()))?;
                bail!("no configuration found; wrote {} — edit it and rerun", path.display());
            }
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    fn path() -> anyhow::Result<PathBuf> {
        Ok(std::env::current_dir()?.join(CONFIG_FILE))
    }

    pub fn mode(&self) -> anyhow::Result<Mode> {
        match self.mode.as_str() {
            "personal" => Ok(Mode::Personal),
            "speaker" => Ok(Mode::Speaker),
            "audience" => Ok(Mode::Audience),
            other => Err(anyhow::anyhow!(
                "unknown mode {other:?} (expected personal, speaker, or audience)"
            )),
        }
    }
}
