use crate::config::{Config, Timing};
use crate::crypto::xts::tweak_from_sequence;
use crate::escrow::{digest, rewrite_escrow};
use crate::keyboard::keys::KeyPress;
use crate::keyboard::timer::{InstantTimer, ManualTimer, Timer};
use crate::keyboard::{FixedKeyState, KeyStateProtocol};
use crate::plist::{self, CryptoUser};
use crate::volume::{KeySource, SectorKeySource, StaticKeySource};
use clap::{Args, Parser, Subcommand};
use either::Either;
use eyre::{bail, eyre, Result};
use log::{debug, info};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

const CONFIG_ENV_VAR: &str = "FV2_UNLOCK_CONFIG";

/// Scans a replay may take before it is given up on.
const MAX_SCANS: usize = 1_000_000;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML settings file
    #[arg(short, long, value_name = "PATH", env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Where the escrow file's wide-block key comes from.
#[derive(Args, Debug)]
struct KeyArgs {
    /// Wide-block key as hex, 32 or 64 bytes
    #[arg(
        long,
        value_name = "HEX",
        conflicts_with = "volume_header",
        required_unless_present = "volume_header"
    )]
    key: Option<String>,

    /// Image of the CoreStorage partition (or its first sector)
    #[arg(long, value_name = "PATH")]
    volume_header: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a CoreStorage volume header and describe it
    Header {
        #[arg(value_name = "IMAGE")]
        image: PathBuf,
    },
    /// List the CryptoUsers enrolled in an escrow file
    Users {
        #[command(flatten)]
        key: KeyArgs,
        #[arg(value_name = "ESCROW")]
        escrow: PathBuf,
    },
    /// Rewrite an escrow file down to its disk password entry
    Rewrite {
        #[command(flatten)]
        key: KeyArgs,
        #[arg(value_name = "ESCROW")]
        escrow: PathBuf,
        #[arg(value_name = "OUT")]
        out: PathBuf,
    },
    /// Show the key events the scripted keyboard produces for a password
    Replay {
        /// File holding the password, stdin when omitted
        #[arg(value_name = "PASSWORD_FILE")]
        password_file: Option<PathBuf>,

        /// Poll on the wall clock instead of simulated time
        #[arg(long)]
        realtime: bool,

        /// Interval between scans in milliseconds
        #[arg(long, default_value_t = 10)]
        poll_ms: u64,
    },
}

/// A change in the reported key state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub at: Duration,
    /// `None` when every key was released.
    pub pressed: Option<KeyPress>,
}

impl Cli {
    pub fn new() -> Self {
        Cli::parse()
    }

    pub fn run(&self) -> Result<&Self> {
        let config = self.config()?;
        match &self.command {
            Commands::Header { image } => self.show_header(image)?,
            Commands::Users { key, escrow } => self.show_users(key, escrow)?,
            Commands::Rewrite { key, escrow, out } => {
                self.rewrite(key, escrow, out, config.keep_user_type)?
            }
            Commands::Replay {
                password_file,
                realtime,
                poll_ms,
            } => self.show_replay(
                password_file.as_deref(),
                *realtime,
                Duration::from_millis(*poll_ms),
                config.timing,
            )?,
        };
        Ok(self)
    }

    fn config(&self) -> Result<Config> {
        match &self.config {
            Some(path) => {
                debug!("loading config from {}", path.display());
                Ok(Config::load(path)?)
            }
            None => Ok(Config::default()),
        }
    }

    fn show_header(&self, image: &Path) -> Result<()> {
        let header = SectorKeySource::new(File::open(image)?).header()?;
        println!("Volume size:       {}", header.volume_size);
        println!("Block size:        {}", header.block_size);
        println!("Encryption method: {}", header.encryption_method);
        println!("Key size:          {} bits", header.key_size() * 8);
        println!("Physical volume:   {}", header.physical_volume);
        println!("Volume group:      {}", header.volume_group);
        Ok(())
    }

    fn show_users(&self, key: &KeyArgs, escrow: &Path) -> Result<()> {
        for user in list_users(key.source()?.as_ref(), escrow)? {
            let ident = user
                .user_ident
                .map(|id| id.to_string().to_uppercase())
                .unwrap_or_else(|| "-".to_owned());
            let note = if user.is_disk_password() {
                " (disk password)"
            } else {
                ""
            };
            println!("{:#010x}  {}{}", user.user_type, ident, note);
        }
        Ok(())
    }

    fn rewrite(&self, key: &KeyArgs, escrow: &Path, out: &Path, keep_user_type: u32) -> Result<()> {
        let xts = key.source()?.wide_block_key()?;
        let mut buf = Zeroizing::new(std::fs::read(escrow)?);
        let before = buf.len();
        let len = rewrite_escrow(&xts, &mut buf, keep_user_type)?;
        std::fs::write(out, &buf[..len])?;
        info!(
            "rewrote {} ({} -> {} bytes, sha256 {})",
            escrow.display(),
            before,
            len,
            digest(&buf[..len])
        );
        Ok(())
    }

    fn show_replay(
        &self,
        password_file: Option<&Path>,
        realtime: bool,
        poll: Duration,
        timing: Timing,
    ) -> Result<()> {
        let password = read_password(password_file)?;
        let events = if realtime {
            let start = Instant::now();
            replay(&password, InstantTimer::default(), timing, || {
                std::thread::sleep(poll);
                start.elapsed()
            })?
        } else {
            let timer = ManualTimer::new();
            let clock = timer.clone();
            replay(&password, timer, timing, || {
                clock.advance(poll);
                clock.now()
            })?
        };
        for event in events {
            match event.pressed {
                Some(key) => println!(
                    "{:>8} ms  down {:#06x} modifiers {:#04x}",
                    event.at.as_millis(),
                    key.key_code,
                    key.modifiers
                ),
                None => println!("{:>8} ms  up", event.at.as_millis()),
            }
        }
        Ok(())
    }
}

impl KeyArgs {
    fn source(&self) -> Result<Box<dyn KeySource>> {
        match (&self.key, &self.volume_header) {
            (Some(key), _) => {
                let key = Zeroizing::new(hex::decode(key.trim())?);
                Ok(Box::new(StaticKeySource::new(key.to_vec())?))
            }
            (None, Some(path)) => Ok(Box::new(SectorKeySource::new(File::open(path)?))),
            (None, None) => Err(eyre!("one of --key or --volume-header is required")),
        }
    }
}

/// Decrypts an escrow file and lists its users.
fn list_users(source: &dyn KeySource, escrow: &Path) -> Result<Vec<CryptoUser>> {
    let xts = source.wide_block_key()?;
    let mut buf = Zeroizing::new(std::fs::read(escrow)?);
    xts.decrypt(&tweak_from_sequence(0), &mut buf)?;
    if !plist::is_xml(&buf) {
        bail!("{} does not decrypt to a property list", escrow.display());
    }
    Ok(plist::crypto_users(&buf))
}

fn read_password(path: Option<&Path>) -> Result<Zeroizing<Vec<u8>>> {
    let mut reader = match path {
        Some(path) => Either::Left(File::open(path)?),
        None => Either::Right(io::stdin()),
    };
    let mut password = Zeroizing::new(Vec::new());
    reader.read_to_end(&mut password)?;
    Ok(password)
}

/// Scans a scripted key state reader until it has typed `password`, calling
/// `tick` between scans to let time pass. Returns every change in the
/// reported key.
pub fn replay<T: Timer>(
    password: &[u8],
    timer: T,
    timing: Timing,
    mut tick: impl FnMut() -> Duration,
) -> Result<Vec<KeyEvent>> {
    let mut state = FixedKeyState::new(password, timer).with_timing(timing);
    let mut events = Vec::new();
    let mut previous = None;
    let mut at = Duration::ZERO;
    let mut keys = [0u16; 8];
    for _ in 0..MAX_SCANS {
        let pressed = state.read_key_state(&mut keys)?;
        let pressed = (pressed.count > 0).then_some(KeyPress {
            key_code: keys[0],
            modifiers: pressed.modifiers,
        });
        if pressed != previous {
            events.push(KeyEvent { at, pressed });
            previous = pressed;
        }
        if state.is_finished() && pressed.is_none() {
            return Ok(events);
        }
        at = tick();
    }
    bail!("key replay did not finish after {} scans", MAX_SCANS)
}
