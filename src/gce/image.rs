//! Boot image resolution.
//!
//! Three strategies map job attributes to a concrete image: `legacy`
//! derives candidate languages and scans `travis-ci-{lang}` images, `env`
//! consults an alias table in the provider configuration, and `api` asks
//! an external image-selector service. Whatever the strategy, the final
//! lookup lists matching images and picks the lexicographically greatest
//! name, which by naming convention is the newest build.

use tracing::debug;

use crate::backend::StartAttributes;
use crate::config::ProviderConfig;

use super::api::{ComputeService, Image};
use super::error::GceError;
use super::settings::GceSettings;

/// Sentinel name selectors return when no specific image applies.
const DEFAULT_IMAGE_NAME: &str = "default";

/// Image selection strategy with its per-variant state.
#[derive(Clone, Debug)]
pub(super) enum ImageResolver {
    /// Candidate-language scan over `travis-ci-*` images.
    Legacy,
    /// Alias table lookup against the provider configuration.
    Env(EnvSelector),
    /// External image-selector service.
    Api(ApiSelector),
}

/// Resolves the boot image for a job.
pub(super) async fn select_image(
    compute: &dyn ComputeService,
    cfg: &ProviderConfig,
    settings: &GceSettings,
    resolver: &ImageResolver,
    attrs: &StartAttributes,
) -> Result<Image, GceError> {
    match resolver {
        ImageResolver::Legacy => legacy_select(compute, cfg, settings, attrs).await,
        ImageResolver::Env(selector) => {
            named_select(compute, settings, selector.select(attrs), attrs).await
        }
        ImageResolver::Api(selector) => {
            let name = selector.select(attrs).await?;
            named_select(compute, settings, name, attrs).await
        }
    }
}

async fn named_select(
    compute: &dyn ComputeService,
    settings: &GceSettings,
    name: String,
    attrs: &StartAttributes,
) -> Result<Image, GceError> {
    let name = if name == DEFAULT_IMAGE_NAME {
        settings.default_image.clone()
    } else {
        name
    };
    debug!(image = %name, language = %attrs.language, "resolved image name");
    image_by_filter(compute, &format!("name eq ^{name}")).await
}

async fn legacy_select(
    compute: &dyn ComputeService,
    cfg: &ProviderConfig,
    settings: &GceSettings,
    attrs: &StartAttributes,
) -> Result<Image, GceError> {
    let mut candidates = Vec::with_capacity(2);
    let mapped_key = format!("LANGUAGE_MAP_{}", attrs.language.to_uppercase());
    match cfg.get(&mapped_key) {
        Some(mapped) => {
            debug!(original = %attrs.language, mapped = %mapped, "using mapped language");
            candidates.push(mapped.to_owned());
        }
        None => candidates.push(attrs.language.clone()),
    }
    candidates.push(settings.default_language.clone());

    let mut last_err = GceError::NoImageFound(String::new());
    for language in candidates {
        debug!(original = %attrs.language, candidate = %language, "searching image for language");
        match image_by_filter(compute, &format!("name eq ^travis-ci-{language}.+")).await {
            Ok(image) => {
                debug!(candidate = %language, image = %image.name, "found image for language");
                return Ok(image);
            }
            Err(err) => last_err = err,
        }
    }

    Err(last_err)
}

/// Lists images matching `filter` and returns the lexicographically
/// greatest name.
pub(super) async fn image_by_filter(
    compute: &dyn ComputeService,
    filter: &str,
) -> Result<Image, GceError> {
    let images = compute.list_images(filter).await?;
    images
        .into_iter()
        .max_by(|lhs, rhs| lhs.name.cmp(&rhs.name))
        .ok_or_else(|| GceError::NoImageFound(filter.to_owned()))
}

/// Alias table selector over `IMAGE_ALIAS_{KEY}` / `IMAGE_{KEY}` options.
#[derive(Clone, Debug)]
pub(super) struct EnvSelector {
    cfg: ProviderConfig,
}

impl EnvSelector {
    pub(super) fn new(cfg: ProviderConfig) -> Self {
        Self { cfg }
    }

    /// Returns the aliased image name for the first matching candidate, or
    /// the `default` sentinel when no alias applies.
    pub(super) fn select(&self, attrs: &StartAttributes) -> String {
        for candidate in env_candidates(attrs) {
            let key = normalize_alias(&candidate);
            for option in [format!("IMAGE_ALIAS_{key}"), format!("IMAGE_{key}")] {
                if let Some(name) = self.cfg.get(&option) {
                    return name.to_owned();
                }
            }
        }
        String::from(DEFAULT_IMAGE_NAME)
    }
}

/// Alias candidates in precedence order, most specific first.
fn env_candidates(attrs: &StartAttributes) -> Vec<String> {
    let lang = &attrs.language;
    let mut candidates = Vec::new();

    if !attrs.osx_image.is_empty() {
        candidates.push(format!("osx_image_{}_{lang}", attrs.osx_image));
        candidates.push(format!("osx_image_{}", attrs.osx_image));
    }
    if !attrs.dist.is_empty() {
        candidates.push(format!("dist_{}_{lang}", attrs.dist));
        candidates.push(format!("dist_{}", attrs.dist));
    }
    if !attrs.group.is_empty() {
        candidates.push(format!("group_{}_{lang}", attrs.group));
        candidates.push(format!("group_{}", attrs.group));
    }
    candidates.push(format!("language_{lang}"));
    candidates.push(format!("default_{}", attrs.os));
    candidates
}

/// Uppercases an alias and replaces every non-alphanumeric with `_`.
fn normalize_alias(alias: &str) -> String {
    alias
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Client for the external image-selector service.
#[derive(Clone, Debug)]
pub(super) struct ApiSelector {
    base: reqwest::Url,
    http: reqwest::Client,
}

impl ApiSelector {
    pub(super) fn new(base: reqwest::Url) -> Self {
        Self {
            base,
            http: reqwest::Client::new(),
        }
    }

    /// Asks the image selector service for an image name.
    pub(super) async fn select(&self, attrs: &StartAttributes) -> Result<String, GceError> {
        let url = format!("{}/images", self.base.as_str().trim_end_matches('/'));
        let response = self
            .http
            .get(url)
            .query(&[
                ("infra", "gce"),
                ("language", attrs.language.as_str()),
                ("osx_image", attrs.osx_image.as_str()),
                ("dist", attrs.dist.as_str()),
                ("group", attrs.group.as_str()),
                ("os", attrs.os.as_str()),
            ])
            .send()
            .await
            .map_err(|err| GceError::ImageSelector(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GceError::ImageSelector(format!(
                "selector returned status {status}"
            )));
        }

        let name = response
            .text()
            .await
            .map_err(|err| GceError::ImageSelector(err.to_string()))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(GceError::ImageSelector(String::from(
                "selector returned an empty image name",
            )));
        }
        Ok(name.to_owned())
    }
}
