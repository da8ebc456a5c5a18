use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::Duration;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::rtc::{AUDIO_KIND, VIDEO_KIND};

const VIDEO_FRAME_INTERVAL: Duration = Duration::from_millis(33);
const AUDIO_FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// Local media for a broadcast. The synthetic source feeds placeholder
/// VP8 and Opus samples on camera-like timing, enough to drive real peer
/// connections without a capture device.
pub struct MediaSource {
    tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
    pumps: Vec<JoinHandle<()>>,
}

impl MediaSource {
    pub fn synthetic(stream_id: impl ToString) -> Self {
        let stream_id = stream_id.to_string();
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            VIDEO_KIND.to_owned(),
            stream_id.clone(),
        ));
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            AUDIO_KIND.to_owned(),
            stream_id,
        ));
        let pumps = vec![
            spawn_pump(video.clone(), VIDEO_FRAME_INTERVAL),
            spawn_pump(audio.clone(), AUDIO_FRAME_INTERVAL),
        ];
        MediaSource {
            tracks: vec![video, audio],
            pumps,
        }
    }

    pub fn tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        self.tracks.clone()
    }
}

impl Drop for MediaSource {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

fn spawn_pump(track: Arc<TrackLocalStaticSample>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            // write_sample is a no-op until a peer binds the track
            let _ = track
                .write_sample(&Sample {
                    data: bytes::Bytes::from_static(&[0u8; 16]),
                    duration: interval,
                    ..Default::default()
                })
                .await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_synthetic_source_has_video_and_audio() {
        let source = MediaSource::synthetic("demo");
        let tracks = source.tracks();
        assert_eq!(tracks.len(), 2);
        let ids: Vec<&str> = tracks.iter().map(|t| t.id()).collect();
        assert!(ids.contains(&VIDEO_KIND));
        assert!(ids.contains(&AUDIO_KIND));
    }
}
