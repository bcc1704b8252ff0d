//! Registry of available backend providers.
//!
//! The worker looks providers up by name to render help output and to
//! decide which backend a configuration addresses. Construction itself
//! goes through the concrete provider types, so the registry only carries
//! metadata.

/// Help text for every option the GCE provider understands.
pub const GCE_HELP: &[(&str, &str)] = &[
    ("PROJECT_ID", "[REQUIRED] GCE project id"),
    (
        "ACCOUNT_JSON",
        "[REQUIRED] account JSON config, inline or as a file path",
    ),
    (
        "SSH_KEY_PATH",
        "[REQUIRED] path to ssh key used to access job vms",
    ),
    (
        "SSH_PUB_KEY_PATH",
        "[REQUIRED] path to ssh public key used to access job vms",
    ),
    (
        "SSH_KEY_PASSPHRASE",
        "[REQUIRED] passphrase for ssh key given as SSH_KEY_PATH",
    ),
    (
        "IMAGE_SELECTOR_TYPE",
        "image selector type (\"legacy\", \"env\" or \"api\", default \"legacy\")",
    ),
    (
        "IMAGE_SELECTOR_URL",
        "URL for image selector API, used only when image selector is \"api\"",
    ),
    ("ZONE", "zone name (default \"us-central1-a\")"),
    ("MACHINE_TYPE", "machine type name (default \"n1-standard-2\")"),
    ("NETWORK", "network name (default \"default\")"),
    ("DISK_SIZE", "boot disk size in GiB (default 20)"),
    (
        "LANGUAGE_MAP_{LANGUAGE}",
        "map a job language to the image of a different language, used only when image selector type is \"legacy\"",
    ),
    (
        "IMAGE_ALIASES",
        "comma-delimited strings used as stable names for images, used only when image selector type is \"env\"",
    ),
    (
        "IMAGE_[ALIAS_]{ALIAS}",
        "full name for a given alias, where the alias in the key is uppercased and non-alphanumerics are replaced with _",
    ),
    (
        "IMAGE_DEFAULT",
        "default image name to use when none found (default \"travis-ci-mega.+\")",
    ),
    (
        "DEFAULT_LANGUAGE",
        "default language to use when looking up an image (default \"minimal\")",
    ),
    (
        "INSTANCE_GROUP",
        "instance group name to which all inserted instances will be added (no default)",
    ),
    (
        "BOOT_POLL_SLEEP",
        "sleep interval between polling the server for instance status (default 3s)",
    ),
    (
        "UPLOAD_RETRIES",
        "number of times to attempt to upload the script before erroring (default 10)",
    ),
    (
        "UPLOAD_RETRY_SLEEP",
        "sleep interval between script upload attempts (default 5s)",
    ),
    (
        "AUTO_IMPLODE",
        "schedule a poweroff at HARD_TIMEOUT_MINUTES in the future (default true)",
    ),
    (
        "HARD_TIMEOUT_MINUTES",
        "minutes in the future when poweroff is scheduled if AUTO_IMPLODE is true (default 130)",
    ),
];

/// Metadata describing one registered provider.
#[derive(Clone, Copy, Debug)]
pub struct ProviderRegistration {
    /// Short name used in worker configuration.
    pub name: &'static str,
    /// Human readable description.
    pub description: &'static str,
    /// Option help table as `(name, description)` pairs.
    pub help: &'static [(&'static str, &'static str)],
}

/// Every provider this build of the worker can drive.
pub const PROVIDERS: &[ProviderRegistration] = &[ProviderRegistration {
    name: "gce",
    description: "Google Compute Engine",
    help: GCE_HELP,
}];

/// Looks a provider up by its registered name.
#[must_use]
pub fn lookup(name: &str) -> Option<&'static ProviderRegistration> {
    PROVIDERS.iter().find(|reg| reg.name == name)
}
