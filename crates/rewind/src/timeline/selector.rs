use std::{cmp::Ordering, fmt, str::FromStr};

use super::{Rendition, ResolveWarning, TrackType};
use crate::error::{RewindError, RewindResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Preference {
    #[default]
    Best,
    Worst,
}

/// A `filter+preference` rule such as `best`, `1080+best`, `720p+worst` or `fra+best`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityRule {
    pub filter: Option<String>,
    pub preference: Preference,
}

impl QualityRule {
    pub fn best() -> Self {
        Self {
            filter: None,
            preference: Preference::Best,
        }
    }

    /// Video renditions match on their height first (`1080`, `1080p`), every rendition
    /// matches when its quality label contains the filter, ignoring case.
    pub fn matches(&self, rendition: &Rendition) -> bool {
        let Some(filter) = &self.filter else {
            return true;
        };

        if rendition.track_type == TrackType::Video {
            let target = filter.strip_suffix('p').unwrap_or(filter);
            if let Some(height) = rendition.height {
                if height.to_string().contains(target) {
                    return true;
                }
            }
        }

        rendition
            .quality_label
            .to_lowercase()
            .contains(&filter.to_lowercase())
    }

    fn pick<'a>(&self, renditions: impl Iterator<Item = &'a Rendition>) -> Option<&'a Rendition> {
        // equal bitrates are ordered by id so that the pick is stable
        let by_bitrate = |a: &&Rendition, b: &&Rendition| -> Ordering {
            a.bitrate.cmp(&b.bitrate).then_with(|| b.id.cmp(&a.id))
        };

        let mut candidates = renditions.filter(|r| self.matches(r));
        match self.preference {
            Preference::Best => candidates.max_by(by_bitrate),
            Preference::Worst => candidates.min_by(by_bitrate),
        }
    }
}

impl FromStr for QualityRule {
    type Err = RewindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(RewindError::InvalidSelector(s.to_string()));
        }

        let (filter, preference) = match s.split_once('+') {
            Some((filter, preference)) => (Some(filter), preference),
            None => (None, s),
        };
        let filter = filter
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(ToString::to_string);

        let preference = match preference.trim().to_lowercase().as_str() {
            "worst" => Preference::Worst,
            "best" => Preference::Best,
            other => {
                tracing::warn!("Unknown preference {other}, using best.");
                Preference::Best
            }
        };

        Ok(Self { filter, preference })
    }
}

impl fmt::Display for QualityRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let preference = match self.preference {
            Preference::Best => "best",
            Preference::Worst => "worst",
        };
        match &self.filter {
            Some(filter) => write!(f, "{filter}+{preference}"),
            None => f.write_str(preference),
        }
    }
}

/// Ordered rules per track type. The first rule that matches a rendition wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSelector {
    pub video: Vec<QualityRule>,
    pub audio: Vec<QualityRule>,
    /// Additional audio renditions, fetched on a best-effort basis
    pub extra_audio: Vec<QualityRule>,
}

impl Default for TrackSelector {
    fn default() -> Self {
        Self {
            video: vec![QualityRule::best()],
            audio: vec![QualityRule::best()],
            extra_audio: Vec::new(),
        }
    }
}

impl TrackSelector {
    /// Picks the renditions to acquire. Primary picks are required, extra audio picks are not.
    pub fn select(
        &self,
        renditions: &[Rendition],
        warnings: &mut Vec<ResolveWarning>,
    ) -> RewindResult<Vec<Rendition>> {
        let mut selected = Vec::new();

        for (track_type, rules) in [
            (TrackType::Video, &self.video),
            (TrackType::Audio, &self.audio),
        ] {
            if rules.is_empty() {
                continue;
            }

            let rendition = select_family(track_type, rules, renditions, warnings)
                .ok_or(RewindError::NoRenditionSelected(track_type))?;
            tracing::info!(
                "{track_type} selected: {} ({}, {} kbps)",
                rendition.id,
                rendition.quality_label,
                rendition.bitrate / 1000
            );

            let mut rendition = rendition.clone();
            rendition.required = true;
            selected.push(rendition);
        }

        for rule in &self.extra_audio {
            let family = renditions.iter().filter(|r| {
                r.track_type == TrackType::Audio && !selected.iter().any(|s| s.id == r.id)
            });
            match rule.pick(family) {
                Some(rendition) => {
                    tracing::info!("extra audio selected: {}", rendition.id);
                    let mut rendition = rendition.clone();
                    rendition.required = false;
                    selected.push(rendition);
                }
                None => tracing::warn!("No extra audio rendition matches {rule}, skipped."),
            }
        }

        if selected.is_empty() {
            return Err(RewindError::InvalidSelector(
                "at least one video or audio rule is required".to_string(),
            ));
        }
        Ok(selected)
    }
}

fn select_family<'a>(
    track_type: TrackType,
    rules: &[QualityRule],
    renditions: &'a [Rendition],
    warnings: &mut Vec<ResolveWarning>,
) -> Option<&'a Rendition> {
    let family = || renditions.iter().filter(move |r| r.track_type == track_type);

    for (index, rule) in rules.iter().enumerate() {
        let Some(rendition) = rule.pick(family()) else {
            continue;
        };

        for skipped in &rules[..index] {
            warnings.push(ResolveWarning::SelectorFallback {
                track_type,
                skipped: skipped.to_string(),
                used: rule.to_string(),
            });
        }
        return Some(rendition);
    }
    None
}
