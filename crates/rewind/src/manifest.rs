use std::{
    collections::{BTreeMap, HashMap},
    fmt::Display,
    io::Cursor,
    path::{Component, Path, PathBuf},
};

use quick_xml::{
    events::{BytesDecl, BytesEnd, BytesStart, Event},
    Writer,
};

use crate::{
    error::{RewindError, RewindResult},
    fetch::FetchReport,
    timeline::{ResolvedTimeline, ResolvedTrack, SegmentDescriptor, TrackType},
};

const MP4_PROTECTION_SCHEME: &str = "urn:mpeg:dash:mp4protection:2011";

fn xml_err(e: impl Display) -> RewindError {
    RewindError::ManifestError(e.to_string())
}

/// Where the segment references of a manifest point to.
#[derive(Debug, Clone, Copy)]
pub enum ManifestLocation<'a> {
    /// Provider URLs, for manifest-only runs
    Remote,
    /// Files of a finished fetch, relative to `relative_to` when below it
    Local {
        report: &'a FetchReport,
        relative_to: &'a Path,
    },
}

/// One `S` element of a generated segment timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimelineRun {
    t: Option<u64>,
    d: u64,
    r: u64,
}

/// Consecutive segments of equal duration share one run. `t` is only written when a
/// segment does not start where the previous one ended.
fn compact_timeline<'a>(segments: impl IntoIterator<Item = &'a SegmentDescriptor>) -> Vec<TimelineRun> {
    let mut runs: Vec<TimelineRun> = Vec::new();
    let mut next_time = None;

    for segment in segments {
        let contiguous = next_time == Some(segment.presentation_time);
        match runs.last_mut() {
            Some(run) if contiguous && run.d == segment.duration => run.r += 1,
            _ => runs.push(TimelineRun {
                t: (!contiguous).then_some(segment.presentation_time),
                d: segment.duration,
                r: 0,
            }),
        }
        next_time = Some(segment.end_time());
    }
    runs
}

fn duration_attr(seconds: f64) -> String {
    format!("PT{seconds:.3}S")
}

/// Renders a resolved window as a static DASH manifest.
pub struct ManifestBuilder<'a> {
    timeline: &'a ResolvedTimeline,
    location: ManifestLocation<'a>,
}

impl<'a> ManifestBuilder<'a> {
    pub fn new(timeline: &'a ResolvedTimeline) -> Self {
        Self {
            timeline,
            location: ManifestLocation::Remote,
        }
    }

    pub fn location(mut self, location: ManifestLocation<'a>) -> Self {
        self.location = location;
        self
    }

    pub fn build(&self) -> RewindResult<String> {
        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_err)?;

        let duration = self
            .timeline
            .tracks
            .iter()
            .map(|t| t.rendition.ticks_to_seconds(t.duration_ticks()))
            .fold(0., f64::max);

        let mut mpd = BytesStart::new("MPD");
        mpd.push_attribute(("xmlns", "urn:mpeg:dash:schema:mpd:2011"));
        mpd.push_attribute(("xmlns:cenc", "urn:mpeg:cenc:2013"));
        mpd.push_attribute(("type", "static"));
        mpd.push_attribute(("profiles", "urn:mpeg:dash:profile:isoff-live:2011"));
        mpd.push_attribute(("minBufferTime", "PT2.000S"));
        mpd.push_attribute(("mediaPresentationDuration", duration_attr(duration).as_str()));
        writer.write_event(Event::Start(mpd)).map_err(xml_err)?;

        let mut period = BytesStart::new("Period");
        period.push_attribute(("id", "0"));
        period.push_attribute(("start", "PT0S"));
        writer.write_event(Event::Start(period)).map_err(xml_err)?;

        let files = self.local_files();
        let mut adaptations: BTreeMap<(TrackType, Option<&str>), Vec<&ResolvedTrack>> =
            BTreeMap::new();
        for track in &self.timeline.tracks {
            if files.is_some() && !self.is_fetched(track) {
                continue;
            }
            let key = (track.rendition.track_type, track.rendition.language.as_deref());
            adaptations.entry(key).or_default().push(track);
        }

        for (id, ((track_type, lang), tracks)) in adaptations.into_iter().enumerate() {
            let mut adaptation = BytesStart::new("AdaptationSet");
            adaptation.push_attribute(("id", id.to_string().as_str()));
            adaptation.push_attribute(("contentType", track_type.to_string().as_str()));
            if let Some(first) = tracks.first() {
                adaptation.push_attribute(("mimeType", first.rendition.mime_type.as_str()));
            }
            if let Some(lang) = lang {
                adaptation.push_attribute(("lang", lang));
            }
            adaptation.push_attribute(("segmentAlignment", "true"));
            writer.write_event(Event::Start(adaptation)).map_err(xml_err)?;

            for track in tracks {
                self.write_representation(&mut writer, track, files.as_ref())?;
            }
            writer
                .write_event(Event::End(BytesEnd::new("AdaptationSet")))
                .map_err(xml_err)?;
        }

        writer
            .write_event(Event::End(BytesEnd::new("Period")))
            .map_err(xml_err)?;
        writer
            .write_event(Event::End(BytesEnd::new("MPD")))
            .map_err(xml_err)?;

        String::from_utf8(writer.into_inner().into_inner()).map_err(xml_err)
    }

    pub async fn write(&self, path: impl AsRef<Path>) -> RewindResult<()> {
        let path = path.as_ref();
        let manifest = self.build()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, manifest).await?;
        tracing::info!("Manifest written to {}", path.display());
        Ok(())
    }

    fn is_fetched(&self, track: &ResolvedTrack) -> bool {
        match self.location {
            ManifestLocation::Remote => true,
            ManifestLocation::Local { report, .. } => report.track(&track.rendition.id).is_some(),
        }
    }

    /// `(rendition, sequence)` to file reference, for local manifests.
    fn local_files(&self) -> Option<LocalFiles> {
        let ManifestLocation::Local {
            report,
            relative_to,
        } = self.location
        else {
            return None;
        };

        let mut files = LocalFiles::default();
        for track in &report.tracks {
            if let Some(init) = &track.init {
                files
                    .inits
                    .insert(track.rendition.id.clone(), reference(init, relative_to));
            }
            for result in track.segments.iter().filter(|r| r.is_ok()) {
                files.segments.insert(
                    (track.rendition.id.clone(), result.segment.sequence),
                    reference(&result.path, relative_to),
                );
            }
        }
        Some(files)
    }

    fn write_representation(
        &self,
        writer: &mut Writer<Cursor<Vec<u8>>>,
        track: &ResolvedTrack,
        files: Option<&LocalFiles>,
    ) -> RewindResult<()> {
        let rendition = &track.rendition;
        let mut representation = BytesStart::new("Representation");
        representation.push_attribute(("id", rendition.id.as_str()));
        representation.push_attribute(("bandwidth", rendition.bitrate.to_string().as_str()));
        if let Some(codec) = &rendition.codec {
            representation.push_attribute(("codecs", codec.as_str()));
        }
        if let (Some(width), Some(height)) = (rendition.width, rendition.height) {
            representation.push_attribute(("width", width.to_string().as_str()));
            representation.push_attribute(("height", height.to_string().as_str()));
        }
        writer
            .write_event(Event::Start(representation))
            .map_err(xml_err)?;

        if let Some(kid) = &rendition.key_id {
            let mut mp4protection = BytesStart::new("ContentProtection");
            mp4protection.push_attribute(("schemeIdUri", MP4_PROTECTION_SCHEME));
            mp4protection.push_attribute(("value", "cenc"));
            mp4protection.push_attribute(("cenc:default_KID", kid.to_uuid_string().as_str()));
            writer
                .write_event(Event::Empty(mp4protection))
                .map_err(xml_err)?;
        }

        // failed fragments of optional renditions are left out of local manifests
        let segments: Vec<(&SegmentDescriptor, String)> = track
            .segments
            .iter()
            .filter_map(|segment| match files {
                Some(files) => files
                    .segments
                    .get(&(rendition.id.clone(), segment.sequence))
                    .map(|path| (segment, path.clone())),
                None => Some((segment, segment.url.to_string())),
            })
            .collect();

        let mut segment_list = BytesStart::new("SegmentList");
        segment_list.push_attribute(("timescale", rendition.timescale.to_string().as_str()));
        if let Some((first, _)) = segments.first() {
            segment_list.push_attribute((
                "presentationTimeOffset",
                first.presentation_time.to_string().as_str(),
            ));
        }
        writer
            .write_event(Event::Start(segment_list))
            .map_err(xml_err)?;

        let init = match files {
            Some(files) => files.inits.get(&rendition.id).cloned(),
            None => track.init_url.as_ref().map(ToString::to_string),
        };
        if let Some(init) = init {
            let mut initialization = BytesStart::new("Initialization");
            initialization.push_attribute(("sourceURL", init.as_str()));
            writer
                .write_event(Event::Empty(initialization))
                .map_err(xml_err)?;
        }

        writer
            .write_event(Event::Start(BytesStart::new("SegmentTimeline")))
            .map_err(xml_err)?;
        for run in compact_timeline(segments.iter().map(|(s, _)| *s)) {
            let mut s = BytesStart::new("S");
            if let Some(t) = run.t {
                s.push_attribute(("t", t.to_string().as_str()));
            }
            s.push_attribute(("d", run.d.to_string().as_str()));
            if run.r > 0 {
                s.push_attribute(("r", run.r.to_string().as_str()));
            }
            writer.write_event(Event::Empty(s)).map_err(xml_err)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("SegmentTimeline")))
            .map_err(xml_err)?;

        for (segment, media) in &segments {
            let mut segment_url = BytesStart::new("SegmentURL");
            segment_url.push_attribute(("media", media.as_str()));
            // local files hold only the requested bytes
            if let (None, Some(range)) = (files, segment.byte_range) {
                segment_url.push_attribute(("mediaRange", range.to_string().as_str()));
            }
            writer
                .write_event(Event::Empty(segment_url))
                .map_err(xml_err)?;
        }

        writer
            .write_event(Event::End(BytesEnd::new("SegmentList")))
            .map_err(xml_err)?;
        writer
            .write_event(Event::End(BytesEnd::new("Representation")))
            .map_err(xml_err)?;
        Ok(())
    }
}

#[derive(Default)]
struct LocalFiles {
    inits: HashMap<String, String>,
    segments: HashMap<(String, u64), String>,
}

/// `path` relative to `base` with `/` separators, or the full path when it is not below it.
fn reference(path: &Path, base: &Path) -> String {
    let relative: PathBuf = match path.strip_prefix(base) {
        Ok(relative) => relative.to_path_buf(),
        Err(_) => path.to_path_buf(),
    };
    if relative.is_absolute() {
        return relative.display().to_string();
    }
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
