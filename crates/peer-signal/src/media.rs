use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackInfo {
    pub track_id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

/// Remote track bookkeeping for one media connection.
///
/// Video tracks are announced to the connection owner; audio is only
/// recorded since it plays without further wiring.
#[derive(Debug)]
pub struct MediaTracks {
    remote: Vec<RemoteTrackInfo>,
    announcements: Option<mpsc::UnboundedSender<RemoteTrackInfo>>,
}

impl MediaTracks {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RemoteTrackInfo>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                remote: Vec::new(),
                announcements: Some(tx),
            },
            rx,
        )
    }

    pub fn track_added(&mut self, track: RemoteTrackInfo) {
        if self.remote.iter().any(|known| known.track_id == track.track_id) {
            return;
        }
        if track.kind == TrackKind::Video {
            if let Some(tx) = &self.announcements {
                let _ = tx.send(track.clone());
            }
        }
        self.remote.push(track);
    }

    pub fn remote_tracks(&self) -> &[RemoteTrackInfo] {
        &self.remote
    }

    pub fn release(&mut self) {
        self.remote.clear();
        self.announcements = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: &str, kind: TrackKind) -> RemoteTrackInfo {
        RemoteTrackInfo {
            track_id: id.into(),
            stream_id: "camera".into(),
            kind,
        }
    }

    #[tokio::test]
    async fn only_new_video_tracks_are_announced() {
        let (mut tracks, mut announced) = MediaTracks::new();
        tracks.track_added(track("mic", TrackKind::Audio));
        tracks.track_added(track("cam", TrackKind::Video));
        tracks.track_added(track("cam", TrackKind::Video));

        assert_eq!(tracks.remote_tracks().len(), 2);
        assert_eq!(announced.recv().await.map(|t| t.track_id), Some("cam".into()));

        tracks.release();
        assert!(tracks.remote_tracks().is_empty());
        assert!(announced.recv().await.is_none());
    }
}
