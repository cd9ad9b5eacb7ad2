//! Deterministic variant selection.
//!
//! Ties break toward the earlier playlist entry, so selection is stable
//! across invocations. `Iterator::max_by_key` keeps the *last* maximum and
//! would silently flip that rule; the folds below keep the first.

use tracing::debug;

use crate::config::VariantPreference;
use crate::error::DownloadError;
use crate::playlist::{MasterPlaylist, Variant};

pub fn select_variant<'a>(
    master: &'a MasterPlaylist,
    preference: &VariantPreference,
) -> Result<&'a Variant, DownloadError> {
    if master.variants.is_empty() {
        return Err(DownloadError::NoVariant);
    }

    let selected = if let Some((_, max_height)) = preference.resolution {
        select_by_resolution(&master.variants, max_height)
    } else if let Some(max_bandwidth) = preference.bandwidth {
        select_by_bandwidth(&master.variants, max_bandwidth)
    } else {
        best_by(&master.variants, |v| v.bandwidth)
    };

    debug!(
        uri = %selected.uri,
        bandwidth = selected.bandwidth,
        resolution = ?selected.resolution,
        "selected variant"
    );
    Ok(selected)
}

fn height(variant: &Variant) -> u32 {
    variant.resolution.map(|(_, h)| h).unwrap_or(0)
}

fn select_by_resolution(variants: &[Variant], max_height: u32) -> &Variant {
    let mut fitting = variants
        .iter()
        .filter(|v| v.resolution.is_none_or(|(_, h)| h <= max_height))
        .peekable();

    if fitting.peek().is_some() {
        // Best fit under the cap: tallest, then fastest.
        return best_of(fitting, |v| (height(v), v.bandwidth));
    }

    // Nothing fits: take the tallest rendition, then the fastest.
    best_of(variants.iter(), |v| (height(v), v.bandwidth))
}

fn select_by_bandwidth(variants: &[Variant], max_bandwidth: u64) -> &Variant {
    let mut fitting = variants
        .iter()
        .filter(|v| v.bandwidth <= max_bandwidth)
        .peekable();

    if fitting.peek().is_some() {
        return best_of(fitting, |v| v.bandwidth);
    }

    // Nothing fits: fall back to the cheapest rendition overall.
    best_of(variants.iter(), |v| std::cmp::Reverse(v.bandwidth))
}

fn best_by<K: Ord>(variants: &[Variant], key: impl Fn(&Variant) -> K) -> &Variant {
    best_of(variants.iter(), key)
}

/// First-wins maximum: a later variant only replaces the current best when
/// its key is strictly greater.
fn best_of<'a, K: Ord>(
    variants: impl Iterator<Item = &'a Variant>,
    key: impl Fn(&Variant) -> K,
) -> &'a Variant {
    let mut best: Option<(&Variant, K)> = None;
    for variant in variants {
        let k = key(variant);
        match &best {
            Some((_, best_k)) if k <= *best_k => {}
            _ => best = Some((variant, k)),
        }
    }
    best.expect("caller guarantees a non-empty iterator").0
}
