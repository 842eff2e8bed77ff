//! Platform selection.
//!
//! Picks the variants of one image a run should handle: every platform the
//! filter allows, plus attestation entries whose referenced platform was
//! itself allowed. Order follows the manifest.

use std::collections::HashSet;

use crate::image::{FilterSet, ImageSpec};
use crate::resolve::Candidate;

/// Something that can be admitted by a [`FilterSet`]
pub trait Selectable {
    fn digest(&self) -> &str;

    /// Digest of the platform image this entry attests to
    fn attested_digest(&self) -> Option<&str>;

    fn allowed_by(&self, filter: &FilterSet) -> bool;
}

impl Selectable for Candidate {
    fn digest(&self) -> &str {
        &self.digest
    }

    fn attested_digest(&self) -> Option<&str> {
        Candidate::attested_digest(self)
    }

    fn allowed_by(&self, filter: &FilterSet) -> bool {
        filter.allow_platform(&self.platform)
    }
}

impl Selectable for ImageSpec {
    fn digest(&self) -> &str {
        &self.manifest
    }

    fn attested_digest(&self) -> Option<&str> {
        self.annotations
            .get(crate::constants::annotation::REFERENCE_DIGEST)
            .map(String::as_str)
    }

    fn allowed_by(&self, filter: &FilterSet) -> bool {
        filter.allow(&self.arch, &self.os, &self.variant)
    }
}

/// Entries of `items` the run should handle, in their original order
pub fn select<'a, T: Selectable>(items: &'a [T], filter: &FilterSet) -> Vec<&'a T> {
    let allowed: HashSet<&str> = items
        .iter()
        .filter(|item| item.attested_digest().is_none() && item.allowed_by(filter))
        .map(Selectable::digest)
        .collect();

    items
        .iter()
        .filter(|item| match item.attested_digest() {
            Some(attested) => allowed.contains(attested),
            None => allowed.contains(item.digest()),
        })
        .collect()
}
