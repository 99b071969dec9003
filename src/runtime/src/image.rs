//! Image pulls and inspection through the manager's image store.
//!
//! The manager is the only image cache; this layer adds what the CRI
//! surface needs on top of it: reference normalization, transient-failure
//! retries inside a wall-clock budget, and coalescing of concurrent pulls
//! so one reference is fetched at most once at a time.

use std::time::Duration;

use tokio::time::Instant;

use podlx_core::error::{Result, ShimError};
use podlx_core::lock::KeyedLocks;

use crate::manager::types::{ImageAlias, ImageSource, ImagesPost};
use crate::manager::ManagerClient;

/// Default tag applied to tagless references.
const DEFAULT_TAG: &str = "latest";

/// Initial delay between pull retries; doubles per attempt.
const BACKOFF_INITIAL: Duration = Duration::from_millis(500);

/// Upper bound on a single retry delay.
const BACKOFF_CAP: Duration = Duration::from_secs(8);

/// A parsed image reference: an alias plus an optional content digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Human reference including tag, e.g. `busybox:latest`.
    pub alias: String,
    /// Hex fingerprint when the reference pins content (`@sha256:...`).
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parse `name[:tag][@sha256:<hex>]`. Tagless references get
    /// `:latest`; an empty reference is invalid.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ShimError::Invalid("empty image reference".to_string()));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name, digest_part)) => {
                let hex = digest_part.strip_prefix("sha256:").ok_or_else(|| {
                    ShimError::Invalid(format!(
                        "invalid digest in image reference '{}'",
                        reference
                    ))
                })?;
                if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(ShimError::Invalid(format!(
                        "invalid digest in image reference '{}'",
                        reference
                    )));
                }
                (name, Some(hex.to_string()))
            }
            None => (reference, None),
        };

        // Only the part after the last slash can carry a tag.
        let has_tag = name_tag
            .rsplit('/')
            .next()
            .map(|last| last.contains(':'))
            .unwrap_or(false);

        let alias = if has_tag || digest.is_some() {
            name_tag.to_string()
        } else {
            format!("{}:{}", name_tag, DEFAULT_TAG)
        };

        Ok(Self { alias, digest })
    }
}

/// Normalized image record handed to the CRI surface.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    /// Manager store fingerprint (hex, no prefix).
    pub fingerprint: String,
    pub size_bytes: u64,
    /// All aliases pointing at this image.
    pub tags: Vec<String>,
}

impl ImageRecord {
    /// Digest in the canonical `sha256:` form CRI reports.
    pub fn digest(&self) -> String {
        format!("sha256:{}", self.fingerprint)
    }
}

fn normalize(image: crate::manager::types::Image) -> ImageRecord {
    ImageRecord {
        fingerprint: image.fingerprint,
        size_bytes: image.size,
        tags: image.aliases.into_iter().map(|a| a.name).collect(),
    }
}

/// Image operations against the manager store.
#[derive(Clone)]
pub struct ImageService {
    client: ManagerClient,
    pull_budget: Duration,
    /// In-flight pull table: one keyed lock per canonical reference.
    pulls: KeyedLocks,
}

impl ImageService {
    pub fn new(client: ManagerClient, pull_budget: Duration) -> Self {
        Self {
            client,
            pull_budget,
            pulls: KeyedLocks::new(),
        }
    }

    /// Pull an image, coalescing with concurrent pulls of the same
    /// canonical reference and retrying transient failures until the
    /// wall-clock budget runs out.
    pub async fn pull(&self, reference: &str) -> Result<ImageRecord> {
        let parsed = ImageRef::parse(reference)?;
        let key = self.canonical_key(&parsed).await;

        let _guard = self.pulls.lock(&key).await;

        // A coalesced waiter finds the image already in the store.
        if let Some(record) = self.lookup(&parsed).await? {
            tracing::debug!(reference = %parsed.alias, "Image already in manager store");
            return Ok(record);
        }

        let fingerprint = self.pull_with_backoff(&parsed).await?;
        let image = self.client.get_image(&fingerprint).await?;
        Ok(normalize(image))
    }

    /// Look an image up without pulling. Returns `None` when absent.
    pub async fn lookup(&self, reference: &ImageRef) -> Result<Option<ImageRecord>> {
        let fingerprint = match &reference.digest {
            Some(digest) => digest.clone(),
            None => match self.client.resolve_alias(&reference.alias).await {
                Ok(fp) => fp,
                Err(e) if e.is_not_found() => return Ok(None),
                Err(e) => return Err(e),
            },
        };
        match self.client.get_image(&fingerprint).await {
            Ok(image) => Ok(Some(normalize(image))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Resolve a CRI reference to a manager container source fingerprint,
    /// as CreateContainer needs it. The image must already be in the
    /// store.
    pub async fn resolve(&self, reference: &str) -> Result<ImageRecord> {
        let parsed = ImageRef::parse(reference)?;
        self.lookup(&parsed).await?.ok_or_else(|| {
            ShimError::NotFound(format!("image '{}' not present in store", reference))
        })
    }

    pub async fn list(&self) -> Result<Vec<ImageRecord>> {
        Ok(self
            .client
            .list_images()
            .await?
            .into_iter()
            .map(normalize)
            .collect())
    }

    /// Remove an image from the store. Removing an absent image succeeds.
    pub async fn remove(&self, reference: &str) -> Result<()> {
        let parsed = ImageRef::parse(reference)?;
        match self.lookup(&parsed).await? {
            Some(record) => self.client.delete_image(&record.fingerprint).await,
            None => Ok(()),
        }
    }

    /// Total bytes held by the manager image store.
    pub async fn total_size(&self) -> Result<u64> {
        Ok(self
            .client
            .list_images()
            .await?
            .iter()
            .map(|i| i.size)
            .sum())
    }

    /// Key for the in-flight pull table: the content digest when the
    /// reference (or an existing alias) pins one, else the alias itself.
    async fn canonical_key(&self, reference: &ImageRef) -> String {
        if let Some(digest) = &reference.digest {
            return digest.clone();
        }
        match self.client.resolve_alias(&reference.alias).await {
            Ok(fingerprint) => fingerprint,
            Err(_) => reference.alias.clone(),
        }
    }

    async fn pull_with_backoff(&self, reference: &ImageRef) -> Result<String> {
        let deadline = Instant::now() + self.pull_budget;
        let mut delay = BACKOFF_INITIAL;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ShimError::Transient(format!(
                    "pull of '{}' exhausted its {}s budget",
                    reference.alias,
                    self.pull_budget.as_secs()
                )));
            }

            let request = ImagesPost {
                source: ImageSource {
                    kind: "image".to_string(),
                    server: None,
                    protocol: None,
                    alias: reference
                        .digest
                        .is_none()
                        .then(|| reference.alias.clone()),
                    fingerprint: reference.digest.clone(),
                },
                aliases: if reference.digest.is_none() {
                    vec![ImageAlias {
                        name: reference.alias.clone(),
                        description: String::new(),
                    }]
                } else {
                    Vec::new()
                },
            };

            match self.client.pull_image(&request, remaining).await {
                Ok(fingerprint) => {
                    tracing::info!(
                        reference = %reference.alias,
                        fingerprint = %fingerprint,
                        attempt,
                        "Image pulled"
                    );
                    return Ok(fingerprint);
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        reference = %reference.alias,
                        attempt,
                        error = %e,
                        "Transient pull failure, backing off"
                    );
                    let sleep = delay.min(deadline.saturating_duration_since(Instant::now()));
                    if sleep.is_zero() {
                        return Err(e);
                    }
                    tokio::time::sleep(sleep).await;
                    delay = (delay * 2).min(BACKOFF_CAP);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
