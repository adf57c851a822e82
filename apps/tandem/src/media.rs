use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tandem_proto::Features;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// A local capture track. Clones share the `enabled` flag, so muting is
/// visible to every connection the track was added to.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
    pub stream_id: String,
    enabled: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, stream_id: &str, enabled: bool) -> Self {
        Self {
            id: format!("{}-{}", kind.as_str(), uuid::Uuid::new_v4().simple()),
            kind,
            stream_id: stream_id.to_string(),
            enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// Tracks currently composed into the remote stream.
#[derive(Debug, Default, Clone)]
pub struct RemoteStream {
    known: Vec<RemoteTrack>,
    attached: Vec<String>,
}

impl RemoteStream {
    pub fn add(&mut self, track: RemoteTrack) {
        if !self.attached.contains(&track.id) {
            self.attached.push(track.id.clone());
        }
        self.known.retain(|t| t.kind != track.kind);
        self.known.push(track);
    }

    /// Attaches or detaches the last known track of `kind`. Returns false
    /// when no such track has arrived yet.
    pub fn set_attached(&mut self, kind: MediaKind, attached: bool) -> bool {
        let Some(track) = self.known.iter().find(|t| t.kind == kind) else {
            return false;
        };
        let present = self.attached.contains(&track.id);
        if attached && !present {
            self.attached.push(track.id.clone());
        } else if !attached && present {
            self.attached.retain(|id| id != &track.id);
        }
        true
    }

    pub fn is_attached(&self, kind: MediaKind) -> bool {
        self.known
            .iter()
            .any(|t| t.kind == kind && self.attached.contains(&t.id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFilter {
    Grayscale,
    Sepia,
    Noir,
    Psychedelic,
    None,
}

impl VideoFilter {
    pub fn name(self) -> &'static str {
        match self {
            VideoFilter::Grayscale => "grayscale",
            VideoFilter::Sepia => "sepia",
            VideoFilter::Noir => "noir",
            VideoFilter::Psychedelic => "psychedelic",
            VideoFilter::None => "none",
        }
    }
}

impl fmt::Display for VideoFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const FILTER_ORDER: [VideoFilter; 5] = [
    VideoFilter::Grayscale,
    VideoFilter::Sepia,
    VideoFilter::Noir,
    VideoFilter::Psychedelic,
    VideoFilter::None,
];

#[derive(Debug, Default, Clone)]
pub struct FilterCycle {
    position: usize,
}

impl FilterCycle {
    pub fn next_filter(&mut self) -> VideoFilter {
        let filter = FILTER_ORDER[self.position % FILTER_ORDER.len()];
        self.position = (self.position + 1) % FILTER_ORDER.len();
        filter
    }
}

/// Local capture state: the tracks, what the local preview shows, and the
/// filter cycle.
#[derive(Debug, Clone)]
pub struct LocalMedia {
    pub stream_id: String,
    audio: Option<LocalTrack>,
    video: Option<LocalTrack>,
    preview: Vec<MediaKind>,
    filters: FilterCycle,
}

impl LocalMedia {
    /// Audio starts muted unless `features.audio` is set.
    pub fn new(capture_audio: bool, capture_video: bool, features: &Features) -> Self {
        let stream_id = format!("tandem-{}", uuid::Uuid::new_v4().simple());
        let audio = capture_audio.then(|| LocalTrack::new(MediaKind::Audio, &stream_id, features.audio));
        let video = capture_video.then(|| LocalTrack::new(MediaKind::Video, &stream_id, features.video));
        let mut preview = Vec::new();
        if audio.is_some() {
            preview.push(MediaKind::Audio);
        }
        if video.as_ref().is_some_and(LocalTrack::enabled) {
            preview.push(MediaKind::Video);
        }
        Self {
            stream_id,
            audio,
            video,
            preview,
            filters: FilterCycle::default(),
        }
    }

    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.audio.iter().chain(self.video.iter()).cloned().collect()
    }

    /// Flips the microphone and mirrors the result into `features.audio`.
    pub fn toggle_mic(&mut self, features: &mut Features) -> bool {
        let enabled = match &self.audio {
            Some(track) => {
                let enabled = !track.enabled();
                track.set_enabled(enabled);
                enabled
            }
            None => !features.audio,
        };
        features.audio = enabled;
        enabled
    }

    /// Flips the camera, mirrors it into `features.video` and removes the
    /// video track from the local preview while off.
    pub fn toggle_cam(&mut self, features: &mut Features) -> bool {
        let enabled = match &self.video {
            Some(track) => {
                let enabled = !track.enabled();
                track.set_enabled(enabled);
                enabled
            }
            None => !features.video,
        };
        features.video = enabled;
        if enabled {
            if self.video.is_some() && !self.preview.contains(&MediaKind::Video) {
                self.preview.push(MediaKind::Video);
            }
        } else {
            self.preview.retain(|kind| *kind != MediaKind::Video);
        }
        enabled
    }

    pub fn previewing(&self, kind: MediaKind) -> bool {
        self.preview.contains(&kind)
    }

    pub fn cycle_filter(&mut self) -> VideoFilter {
        self.filters.next_filter()
    }
}
