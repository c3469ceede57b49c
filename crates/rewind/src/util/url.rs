use url::Url;

use crate::error::RewindResult;

pub(crate) fn is_absolute_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://") || s.starts_with("file://")
}

/// Resolves `new` against `current`.
///
/// The query of `current` is carried over unless `new` brings its own, so tokenized
/// manifest URLs keep working for the media requests derived from them.
pub(crate) fn merge_baseurls(current: &Url, new: &str) -> RewindResult<Url> {
    if is_absolute_url(new) {
        return Ok(Url::parse(new)?);
    }

    let mut merged = current.join(new)?;
    if merged.query().is_none() {
        merged.set_query(current.query());
    }
    Ok(merged)
}
