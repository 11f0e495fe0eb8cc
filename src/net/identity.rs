//! Device identity and profile persistence
//!
//! Every session runs under a [`PeerIdentity`]: a fresh process-lifetime peer
//! id, a regenerable access code for direct rendezvous, and a display name
//! that survives restarts. The name is persisted redundantly through the
//! [`ProfileStore`], which keeps a JSON profile as the primary record and a
//! plain-text `display_name` file as the secondary; on load the primary wins,
//! then the secondary, then a `Device-XXXX` name is generated and saved.
//!
//! The store also holds the optional connection password (as a salted HMAC
//! tag, see [`crate::net::secure::password`]) and the last relay address the
//! user entered.
//!
//! # Design notes
//! - Config directory resolution honors `PEERDROP_CONFIG_DIR` for running
//!   multiple instances on one machine; the platform default is cached.
//! - The JSON profile is written with mode 0o600 on Unix since it carries
//!   the password tag.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use crate::net::connection::{DeviceClass, DiscoveredPeer};
use crate::net::secure::password::{self, StoredPassword};

/// Environment variable overriding the config directory.
pub const CONFIG_DIR_ENV: &str = "PEERDROP_CONFIG_DIR";

/// Directory name under the platform config root.
const CONFIG_DIR: &str = "peerdrop";

/// Primary profile record.
const PROFILE_FILE: &str = "profile.json";

/// Secondary display-name record.
const NAME_FILE: &str = "display_name";

/// Peer ids are 13 lowercase alphanumeric characters.
const PEER_ID_LEN: usize = 13;
const PEER_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Access codes are 12 characters from an alphabet without the ambiguous
/// glyphs I, L, O, 0 and 1.
pub const TOKEN_LEN: usize = 12;
const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Minimum trimmed display-name length.
const MIN_NAME_LEN: usize = 3;

/// Minimum length for the quick password path.
const MIN_QUICK_PASSWORD_LEN: usize = 4;

/// Passwords rejected outright by the checked path.
const COMMON_PASSWORDS: [&str; 10] = [
    "password", "123456", "12345678", "qwerty", "abc123", "111111", "123123", "admin", "letmein",
    "welcome",
];

static CONFIG_DIR_CACHE: OnceCell<PathBuf> = OnceCell::new();

/// Identity and profile errors. All recoverable; the operation that raised
/// one leaves persisted state untouched.
#[derive(Error, Debug)]
pub enum IdentityError {
    /// Display name shorter than three characters after trimming.
    #[error("display name must be at least 3 characters")]
    NameTooShort,

    /// Access code input did not normalize to 12 alphabet characters.
    #[error("access code must be 12 letters or digits")]
    InvalidToken,

    /// Password below the minimum length for the chosen path.
    #[error("password must be at least {min} characters")]
    PasswordTooShort { min: usize },

    /// Password and confirmation differ.
    #[error("password confirmation does not match")]
    ConfirmMismatch,

    /// Password failed one or more strength rules.
    #[error("password fails {failed_rules} strength rules")]
    WeakPassword { failed_rules: usize },

    /// Config directory could not be resolved.
    #[error("config directory: {0}")]
    ConfigDir(Arc<str>),
}

impl IdentityError {
    #[inline]
    fn config_dir(msg: impl Into<String>) -> Self {
        Self::ConfigDir(msg.into().into())
    }
}

// ===== Token helpers =====

/// Generates a fresh 12-character access code.
#[must_use]
pub fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    (0..TOKEN_LEN)
        .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

/// Generates a fresh 13-character peer id.
#[must_use]
pub fn generate_peer_id() -> String {
    let mut rng = rand::thread_rng();
    (0..PEER_ID_LEN)
        .map(|_| PEER_ID_ALPHABET[rng.gen_range(0..PEER_ID_ALPHABET.len())] as char)
        .collect()
}

/// Hyphen-groups a token for display: `ABCDEFGH2345` -> `ABCD-EFGH-2345`.
#[must_use]
pub fn format_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    chars
        .chunks(4)
        .map(|group| group.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}

/// Canonicalizes user token input: strips hyphens and whitespace, uppercases,
/// and validates length and alphabet.
///
/// Formatted (`ABCD-EFGH-2345`) and bare inputs normalize identically.
pub fn normalize_token(raw: &str) -> Result<String, IdentityError> {
    let cleaned: String = raw
        .chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    if cleaned.len() != TOKEN_LEN || !cleaned.bytes().all(|b| TOKEN_ALPHABET.contains(&b)) {
        return Err(IdentityError::InvalidToken);
    }
    Ok(cleaned)
}

// ===== Password strength =====

/// Counts failed strength rules for the checked password path: length of at
/// least 8, an uppercase letter, a lowercase letter, a digit, and not a
/// well-known password.
#[must_use]
pub fn password_strength_failures(pw: &str) -> usize {
    let mut failed = 0;
    if pw.chars().count() < 8 {
        failed += 1;
    }
    if !pw.chars().any(|c| c.is_ascii_uppercase()) {
        failed += 1;
    }
    if !pw.chars().any(|c| c.is_ascii_lowercase()) {
        failed += 1;
    }
    if !pw.chars().any(|c| c.is_ascii_digit()) {
        failed += 1;
    }
    if COMMON_PASSWORDS.contains(&pw.to_lowercase().as_str()) {
        failed += 1;
    }
    failed
}

// ===== Profile store =====

/// Persisted profile record. Unknown fields from newer builds are ignored;
/// absent fields default so older files keep loading.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password: Option<StoredPassword>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    relay_addr: Option<String>,
}

/// Config-directory-backed persistence for the device profile.
///
/// Cloning is cheap; all clones operate on the same directory.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    /// Opens the store in the resolved config directory, creating it if
    /// needed.
    pub async fn open() -> Result<Self> {
        let dir = Self::resolve_dir()?;
        fs::create_dir_all(&dir)
            .await
            .context("failed to create config directory")?;
        debug!(dir = %dir.display(), "Profile store opened");
        Ok(Self { dir })
    }

    /// Opens the store over an explicit directory. The directory must exist.
    #[must_use]
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory this store reads and writes.
    #[inline]
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resolves the config directory.
    ///
    /// `PEERDROP_CONFIG_DIR` wins on every call so test instances never share
    /// state; the platform default is computed once and cached.
    fn resolve_dir() -> Result<PathBuf> {
        if let Ok(custom) = std::env::var(CONFIG_DIR_ENV) {
            return Ok(PathBuf::from(custom));
        }

        CONFIG_DIR_CACHE
            .get_or_try_init(|| {
                dirs::config_dir()
                    .map(|p| p.join(CONFIG_DIR))
                    .ok_or_else(|| {
                        IdentityError::config_dir("could not determine config directory").into()
                    })
            })
            .cloned()
    }

    fn profile_path(&self) -> PathBuf {
        self.dir.join(PROFILE_FILE)
    }

    fn name_path(&self) -> PathBuf {
        self.dir.join(NAME_FILE)
    }

    /// Loads the profile record, treating a missing or unreadable file as
    /// empty. A corrupt profile is logged and discarded rather than blocking
    /// startup.
    async fn load_profile(&self) -> Profile {
        match fs::read(self.profile_path()).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(profile) => profile,
                Err(error) => {
                    warn!(%error, "Profile record corrupt, starting from empty");
                    Profile::default()
                }
            },
            Err(_) => Profile::default(),
        }
    }

    /// Writes the profile record. On Unix the file holds the password tag, so
    /// it is created with mode 0o600.
    async fn store_profile(&self, profile: &Profile) -> Result<()> {
        let bytes =
            serde_json::to_vec_pretty(profile).context("failed to encode profile record")?;
        let path = self.profile_path();

        #[cfg(unix)]
        {
            write_private(path, bytes).await?;
        }

        #[cfg(not(unix))]
        {
            fs::write(&path, &bytes)
                .await
                .context("failed to write profile record")?;
        }

        Ok(())
    }

    /// Returns the persisted display name, primary record first, then the
    /// plain-text fallback. Empty values count as absent.
    pub async fn load_name(&self) -> Option<String> {
        let profile = self.load_profile().await;
        if let Some(name) = profile.display_name {
            let trimmed = name.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }

        match fs::read_to_string(self.name_path()).await {
            Ok(contents) => {
                let trimmed = contents.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Err(_) => None,
        }
    }

    /// Validates and persists a display name to BOTH records, returning the
    /// canonical trimmed value. A too-short name changes nothing on disk.
    #[instrument(skip(self))]
    pub async fn save_name(&self, raw: &str) -> Result<String> {
        let trimmed = raw.trim();
        if trimmed.chars().count() < MIN_NAME_LEN {
            return Err(IdentityError::NameTooShort.into());
        }

        let mut profile = self.load_profile().await;
        profile.display_name = Some(trimmed.to_string());
        self.store_profile(&profile).await?;

        fs::write(self.name_path(), trimmed)
            .await
            .context("failed to write display name record")?;

        info!(name = %trimmed, "Display name saved");
        Ok(trimmed.to_string())
    }

    // ===== Connection password =====

    /// Sets the connection password with only a length floor. This is the
    /// inline quick path; the checked path enforces strength rules.
    pub async fn set_password_quick(&self, pw: &str) -> Result<()> {
        if pw.chars().count() < MIN_QUICK_PASSWORD_LEN {
            return Err(IdentityError::PasswordTooShort {
                min: MIN_QUICK_PASSWORD_LEN,
            }
            .into());
        }
        self.persist_password(pw).await
    }

    /// Sets the connection password through the confirmed path: confirmation
    /// must match and every strength rule must pass.
    pub async fn set_password_checked(&self, pw: &str, confirm: &str) -> Result<()> {
        if pw != confirm {
            return Err(IdentityError::ConfirmMismatch.into());
        }
        let failed_rules = password_strength_failures(pw);
        if failed_rules > 0 {
            return Err(IdentityError::WeakPassword { failed_rules }.into());
        }
        self.persist_password(pw).await
    }

    async fn persist_password(&self, pw: &str) -> Result<()> {
        let mut profile = self.load_profile().await;
        profile.password = Some(password::store(pw));
        self.store_profile(&profile).await?;
        info!("Connection password set");
        Ok(())
    }

    /// Clears the connection password.
    pub async fn remove_password(&self) -> Result<()> {
        let mut profile = self.load_profile().await;
        if profile.password.take().is_some() {
            self.store_profile(&profile).await?;
            info!("Connection password removed");
        }
        Ok(())
    }

    /// Whether inbound connections require a password.
    pub async fn has_password(&self) -> bool {
        self.load_profile().await.password.is_some()
    }

    /// Checks an attempt against the stored password in constant time.
    /// Returns true when no password is configured.
    pub async fn verify_password(&self, attempt: &str) -> bool {
        match self.load_profile().await.password {
            Some(stored) => password::verify(&stored, attempt),
            None => true,
        }
    }

    // ===== Saved relay address =====

    /// Remembers the last relay address the user connected to.
    pub async fn save_relay_addr(&self, addr: &str) -> Result<()> {
        let mut profile = self.load_profile().await;
        profile.relay_addr = Some(addr.to_string());
        self.store_profile(&profile).await
    }

    /// The remembered relay address, if any.
    pub async fn saved_relay_addr(&self) -> Option<String> {
        self.load_profile().await.relay_addr
    }

    /// Forgets the remembered relay address.
    pub async fn clear_relay_addr(&self) -> Result<()> {
        let mut profile = self.load_profile().await;
        if profile.relay_addr.take().is_some() {
            self.store_profile(&profile).await?;
        }
        Ok(())
    }
}

/// Writes a file with owner-only permissions.
#[cfg(unix)]
async fn write_private(path: PathBuf, bytes: Vec<u8>) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    tokio::task::spawn_blocking(move || {
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true).mode(0o600);

        let mut file = options
            .open(&path)
            .map_err(|e| anyhow::anyhow!("failed to open profile record: {}", e))?;

        file.write_all(&bytes)
            .map_err(|e| anyhow::anyhow!("failed to write profile record: {}", e))?;

        file.flush()
            .map_err(|e| anyhow::anyhow!("failed to flush profile record: {}", e))?;

        Ok::<_, anyhow::Error>(())
    })
    .await
    .context("profile write task failed")??;

    Ok(())
}

// ===== Identity =====

/// The local device identity advertised on every channel.
///
/// `id` lives for the process; `token` can be regenerated at any time, which
/// invalidates previously shared rendezvous payloads. `name` persists across
/// sessions through the [`ProfileStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub id: String,
    pub token: String,
    pub name: String,
    pub device_class: DeviceClass,
    pub browser_name: String,
    pub os_name: String,
}

impl PeerIdentity {
    /// Builds the session identity: fresh id and token, persisted name if one
    /// exists, otherwise a generated `Device-XXXX` name that is saved for
    /// next time.
    #[instrument(skip(store))]
    pub async fn load_or_create(store: &ProfileStore) -> Result<Self> {
        let name = match store.load_name().await {
            Some(name) => name,
            None => {
                let generated = generate_device_name();
                store.save_name(&generated).await?;
                info!(name = %generated, "Generated device name");
                generated
            }
        };

        let identity = Self {
            id: generate_peer_id(),
            token: generate_token(),
            name,
            device_class: DeviceClass::default(),
            browser_name: default_agent().to_string(),
            os_name: friendly_os().to_string(),
        };
        info!(peer = %identity.id, name = %identity.name, "Session identity ready");
        Ok(identity)
    }

    /// Replaces the access code, invalidating any payload built from the old
    /// one. Returns the new code.
    pub fn regenerate_token(&mut self) -> &str {
        self.token = generate_token();
        info!("Access code regenerated");
        &self.token
    }

    /// The access code grouped for display.
    #[must_use]
    pub fn formatted_token(&self) -> String {
        format_token(&self.token)
    }

    /// Rendezvous URL embedding the current token and peer id, suitable for
    /// QR encoding. Regenerate after [`Self::regenerate_token`].
    #[must_use]
    pub fn rendezvous_url(&self, base: &str) -> String {
        format!("{base}?t={}&p={}", self.token, self.id)
    }

    /// This identity as the peer-info shape sent on the wire.
    #[must_use]
    pub fn as_peer(&self) -> DiscoveredPeer {
        DiscoveredPeer::new(
            self.id.clone(),
            self.name.clone(),
            self.device_class,
            self.browser_name.clone(),
            self.os_name.clone(),
        )
    }
}

fn generate_device_name() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..4)
        .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect();
    format!("Device-{suffix}")
}

/// Agent label sent in the `browser` wire field.
fn default_agent() -> &'static str {
    "PeerDrop"
}

fn friendly_os() -> &'static str {
    match std::env::consts::OS {
        "linux" => "Linux",
        "macos" => "macOS",
        "windows" => "Windows",
        "android" => "Android",
        "ios" => "iOS",
        other => other,
    }
}
