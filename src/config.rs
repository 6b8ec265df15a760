use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde::de::{self, Deserializer, Visitor};

use crate::error::{Error, Result};
use crate::retention::RetentionPolicy;
use crate::selection::SelectionMode;

pub const DEFAULT_IMAGES_DIRECTORY: &str = "images";
pub const DEFAULT_MIRROR_DIRECTORY: &str = "profile-mirror";
pub const DEFAULT_SESSION: &str = "session";
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);

/// `anyhow::ensure!` with a typed [`Error::Config`] instead.
macro_rules! ensure {
    ($cond:expr, $msg:literal) => {
        if !$cond {
            return Err(Error::Config($msg.to_string()));
        }
    };
}

/// Return `true` for the accepted truthy spellings: `yes`, `true` and `1`.
///
/// Matching ignores ASCII case and surrounding whitespace. Anything else,
/// including the empty string, is `false`.
#[must_use]
pub fn parse_flag(value: &str) -> bool {
    let value = value.trim();
    ["yes", "true", "1"]
        .iter()
        .any(|accepted| value.eq_ignore_ascii_case(accepted))
}

/// Credentials handed to the identity connector when the session is opened.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_id: u32,
    pub api_hash: String,
    pub session: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_id", &self.api_id)
            .field("api_hash", &redacted(&self.api_hash))
            .field("session", &redacted(&self.session))
            .finish()
    }
}

fn redacted(value: &str) -> &'static str {
    if value.is_empty() { "<unset>" } else { "<redacted>" }
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Configuration {
    /// Application id issued by the identity service.
    pub api_id: u32,
    /// Application secret paired with `api_id`.
    pub api_hash: String,
    /// Reusable session token (or session name) identifying the account.
    pub session: String,
    /// Directory holding the candidate images. Read once at startup.
    pub images_directory: PathBuf,
    /// Fixed delay between rotation cycles.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Prune older profile photos after each upload.
    #[serde(deserialize_with = "deserialize_flag")]
    pub delete_old: bool,
    /// Number of most recent profile photos kept by the eviction pass.
    pub keep: usize,
    /// How the next image is picked from the pool.
    pub selection: SelectionMode,
    /// Optional deterministic seed for random selection.
    pub selection_seed: Option<u64>,
    /// Root of the filesystem-backed identity mirror.
    pub mirror_directory: PathBuf,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            api_id: 0,
            api_hash: String::new(),
            session: DEFAULT_SESSION.to_string(),
            images_directory: PathBuf::from(DEFAULT_IMAGES_DIRECTORY),
            interval: DEFAULT_INTERVAL,
            delete_old: true,
            keep: 1,
            selection: SelectionMode::default(),
            selection_seed: None,
            mirror_directory: PathBuf::from(DEFAULT_MIRROR_DIRECTORY),
        }
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("credentials", &self.credentials())
            .field("images_directory", &self.images_directory)
            .field("interval", &humantime::format_duration(self.interval).to_string())
            .field("delete_old", &self.delete_old)
            .field("keep", &self.keep)
            .field("selection", &self.selection)
            .field("selection_seed", &self.selection_seed)
            .field("mirror_directory", &self.mirror_directory)
            .finish()
    }
}

/// Values that take precedence over the YAML file, usually sourced from the
/// process environment or the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub api_id: Option<u32>,
    pub api_hash: Option<String>,
    pub session: Option<String>,
    pub images_directory: Option<PathBuf>,
    pub interval_secs: Option<u64>,
    pub delete_old: Option<bool>,
    pub keep: Option<usize>,
    pub selection: Option<SelectionMode>,
    pub selection_seed: Option<u64>,
    pub mirror_directory: Option<PathBuf>,
}

impl Configuration {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&s)
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        // An empty document means "all defaults".
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(s)?)
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        let Overrides {
            api_id,
            api_hash,
            session,
            images_directory,
            interval_secs,
            delete_old,
            keep,
            selection,
            selection_seed,
            mirror_directory,
        } = overrides;

        if let Some(v) = api_id {
            self.api_id = v;
        }
        if let Some(v) = api_hash {
            self.api_hash = v;
        }
        if let Some(v) = session {
            self.session = v;
        }
        if let Some(v) = images_directory {
            self.images_directory = v;
        }
        if let Some(secs) = interval_secs {
            self.interval = Duration::from_secs(secs);
        }
        if let Some(v) = delete_old {
            self.delete_old = v;
        }
        if let Some(v) = keep {
            self.keep = v;
        }
        if let Some(v) = selection {
            self.selection = v;
        }
        if selection_seed.is_some() {
            self.selection_seed = selection_seed;
        }
        if let Some(v) = mirror_directory {
            self.mirror_directory = v;
        }
        self
    }

    /// Validate runtime invariants that cannot be expressed via serde defaults alone.
    pub fn validated(self) -> Result<Self> {
        ensure!(self.api_id > 0, "api-id is required and must be positive");
        ensure!(!self.api_hash.trim().is_empty(), "api-hash is required");
        ensure!(!self.session.trim().is_empty(), "session must not be empty");
        ensure!(
            !self.images_directory.as_os_str().is_empty(),
            "images-directory must not be empty"
        );
        ensure!(!self.interval.is_zero(), "interval must be greater than zero");
        ensure!(
            !self.mirror_directory.as_os_str().is_empty(),
            "mirror-directory must not be empty"
        );
        Ok(self)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            api_id: self.api_id,
            api_hash: self.api_hash.clone(),
            session: self.session.clone(),
        }
    }

    /// Retention pass to run after each upload, or `None` when pruning is off.
    pub fn retention(&self) -> Option<RetentionPolicy> {
        self.delete_old.then(|| RetentionPolicy::new(self.keep))
    }
}

fn deserialize_flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    struct FlagVisitor;

    impl Visitor<'_> for FlagVisitor {
        type Value = bool;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a boolean or one of \"yes\", \"true\", \"1\"")
        }

        fn visit_bool<E>(self, value: bool) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value)
        }

        fn visit_u64<E>(self, value: u64) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value == 1)
        }

        fn visit_i64<E>(self, value: i64) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value == 1)
        }

        fn visit_str<E>(self, value: &str) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(parse_flag(value))
        }
    }

    deserializer.deserialize_any(FlagVisitor)
}
