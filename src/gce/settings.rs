//! Option parsing and SSH key material for the GCE provider.
//!
//! Every recognised option is resolved here, once, at construction.
//! Resolved zone, machine type, and network names are written back onto
//! the caller's configuration so later readers observe the effective
//! values. A malformed option is a fatal construction error, with one
//! long-standing exception: `DISK_SIZE` silently reverts to its default.

use std::time::Duration;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use openssl::rsa::Rsa;

use crate::config::ProviderConfig;

use super::error::ConfigError;

pub(super) const DEFAULT_ZONE: &str = "us-central1-a";
pub(super) const DEFAULT_MACHINE_TYPE: &str = "n1-standard-2";
pub(super) const DEFAULT_NETWORK: &str = "default";
const DEFAULT_DISK_SIZE: i64 = 20;
const DEFAULT_LANGUAGE: &str = "minimal";
const DEFAULT_IMAGE: &str = "travis-ci-mega.+";
const DEFAULT_BOOT_POLL_SLEEP: Duration = Duration::from_secs(3);
const DEFAULT_UPLOAD_RETRIES: u32 = 10;
const DEFAULT_UPLOAD_RETRY_SLEEP: Duration = Duration::from_secs(5);
const DEFAULT_HARD_TIMEOUT_MINUTES: i64 = 130;

/// Image selection strategy chosen through `IMAGE_SELECTOR_TYPE`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum SelectorType {
    Legacy,
    Env,
    Api,
}

/// Provider-level settings resolved from the configuration.
#[derive(Clone, Debug)]
pub(super) struct GceSettings {
    pub project_id: String,
    pub zone_name: String,
    pub machine_type_name: String,
    pub network_name: String,
    pub instance_group: Option<String>,
    pub image_selector: SelectorType,
    pub image_selector_url: Option<reqwest::Url>,
    pub default_language: String,
    pub default_image: String,
    pub boot_poll_sleep: Duration,
    pub upload_retries: u32,
    pub upload_retry_sleep: Duration,
}

/// Per-instance settings baked into every boot.
///
/// Immutable once the provider is constructed; the ssh key is held as a
/// decrypted PEM for in-memory public-key authentication.
#[derive(Clone, Debug)]
pub(super) struct InstanceConfig {
    pub disk_size: i64,
    pub ssh_key_pem: String,
    pub ssh_pub_key: String,
    pub auto_implode: bool,
    pub hard_timeout_minutes: i64,
}

/// Resolves all options, writing effective zone/machine-type/network names
/// back onto `cfg`.
pub(super) fn resolve(
    cfg: &mut ProviderConfig,
) -> Result<(GceSettings, InstanceConfig), ConfigError> {
    let project_id = require(cfg, "PROJECT_ID")?.to_owned();

    let key_path = require(cfg, "SSH_KEY_PATH")?.to_owned();
    let encrypted_key = read_ambient(&key_path)?;
    let pub_key_path = require(cfg, "SSH_PUB_KEY_PATH")?.to_owned();
    let ssh_pub_key = read_ambient(&pub_key_path)?;
    let passphrase = require(cfg, "SSH_KEY_PASSPHRASE")?.to_owned();
    let ssh_key_pem = decrypt_ssh_key(&encrypted_key, &passphrase)?;

    let zone_name = cfg.get_or("ZONE", DEFAULT_ZONE).to_owned();
    cfg.set("ZONE", zone_name.clone());
    let machine_type_name = cfg.get_or("MACHINE_TYPE", DEFAULT_MACHINE_TYPE).to_owned();
    cfg.set("MACHINE_TYPE", machine_type_name.clone());
    let network_name = cfg.get_or("NETWORK", DEFAULT_NETWORK).to_owned();
    cfg.set("NETWORK", network_name.clone());

    // DISK_SIZE keeps its historical behaviour: parse failures fall back to
    // the default instead of failing construction.
    let disk_size = cfg
        .get("DISK_SIZE")
        .and_then(|raw| raw.parse::<i64>().ok())
        .unwrap_or(DEFAULT_DISK_SIZE);

    let boot_poll_sleep = parse_duration(cfg, "BOOT_POLL_SLEEP", DEFAULT_BOOT_POLL_SLEEP)?;
    let upload_retries = parse_value(cfg, "UPLOAD_RETRIES", DEFAULT_UPLOAD_RETRIES)?;
    let upload_retry_sleep = parse_duration(cfg, "UPLOAD_RETRY_SLEEP", DEFAULT_UPLOAD_RETRY_SLEEP)?;
    let auto_implode = parse_value(cfg, "AUTO_IMPLODE", true)?;
    let hard_timeout_minutes =
        parse_value(cfg, "HARD_TIMEOUT_MINUTES", DEFAULT_HARD_TIMEOUT_MINUTES)?;

    let default_language = cfg.get_or("DEFAULT_LANGUAGE", DEFAULT_LANGUAGE).to_owned();
    let default_image = cfg.get_or("IMAGE_DEFAULT", DEFAULT_IMAGE).to_owned();

    let image_selector = match cfg.get_or("IMAGE_SELECTOR_TYPE", "legacy") {
        "legacy" => SelectorType::Legacy,
        "env" => SelectorType::Env,
        "api" => SelectorType::Api,
        other => return Err(ConfigError::InvalidSelectorType(other.to_owned())),
    };

    let image_selector_url = if image_selector == SelectorType::Api {
        let raw = cfg
            .get("IMAGE_SELECTOR_URL")
            .ok_or(ConfigError::MissingOption("IMAGE_SELECTOR_URL"))?;
        let url = reqwest::Url::parse(raw).map_err(|err| ConfigError::InvalidOption {
            name: "IMAGE_SELECTOR_URL",
            message: err.to_string(),
        })?;
        Some(url)
    } else {
        None
    };

    let instance_group = cfg
        .get("INSTANCE_GROUP")
        .filter(|group| !group.is_empty())
        .map(ToOwned::to_owned);

    let settings = GceSettings {
        project_id,
        zone_name,
        machine_type_name,
        network_name,
        instance_group,
        image_selector,
        image_selector_url,
        default_language,
        default_image,
        boot_poll_sleep,
        upload_retries,
        upload_retry_sleep,
    };
    let instance_config = InstanceConfig {
        disk_size,
        ssh_key_pem,
        ssh_pub_key,
        auto_implode,
        hard_timeout_minutes,
    };

    Ok((settings, instance_config))
}

fn require<'a>(cfg: &'a ProviderConfig, name: &'static str) -> Result<&'a str, ConfigError> {
    cfg.get(name).ok_or(ConfigError::MissingOption(name))
}

fn parse_value<T>(cfg: &ProviderConfig, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match cfg.get(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|err: T::Err| ConfigError::InvalidOption {
            name,
            message: err.to_string(),
        }),
    }
}

fn parse_duration(
    cfg: &ProviderConfig,
    name: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match cfg.get(name) {
        None => Ok(default),
        Some(raw) => humantime::parse_duration(raw).map_err(|err| ConfigError::InvalidOption {
            name,
            message: err.to_string(),
        }),
    }
}

/// Decrypts a passphrase-protected PKCS#1 key and re-encodes it as an
/// unencrypted PEM held in memory.
pub(super) fn decrypt_ssh_key(pem: &str, passphrase: &str) -> Result<String, ConfigError> {
    if !pem.contains("-----BEGIN") {
        return Err(ConfigError::InvalidPemBlock);
    }

    let rsa = Rsa::private_key_from_pem_passphrase(pem.as_bytes(), passphrase.as_bytes())
        .map_err(|err| ConfigError::KeyDecrypt(err.to_string()))?;
    let decrypted = rsa
        .private_key_to_pem()
        .map_err(|err| ConfigError::KeyDecrypt(err.to_string()))?;
    String::from_utf8(decrypted).map_err(|err| ConfigError::KeyDecrypt(err.to_string()))
}

/// Reads a UTF-8 file relative to the ambient filesystem.
pub(super) fn read_ambient(path: &str) -> Result<String, ConfigError> {
    let file_read = |message: String| ConfigError::FileRead {
        path: path.to_owned(),
        message,
    };

    let full = Utf8Path::new(path);
    let (dir_path, file_name) = if full.is_absolute() {
        let parent = full
            .parent()
            .ok_or_else(|| file_read(String::from("path has no parent directory")))?;
        let name = full
            .file_name()
            .ok_or_else(|| file_read(String::from("path has no file name")))?;
        (parent, Utf8Path::new(name))
    } else {
        (Utf8Path::new("."), full)
    };

    let dir = Dir::open_ambient_dir(dir_path, ambient_authority())
        .map_err(|err| file_read(err.to_string()))?;
    dir.read_to_string(file_name)
        .map_err(|err| file_read(err.to_string()))
}
