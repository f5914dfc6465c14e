//! A pipeline backend without a decoder stack.
//!
//! It walks through the same callback sequence a real pipeline produces
//! (source setup, preroll, state changes, seek completion, stream discovery)
//! so the player logic can be driven end to end. URL loads present a fixed
//! clip; MediaSource appends are treated as fixed-length chunks.
//!
//! Encrypted fragments (`moof` with `senc`) are decrypted in place before
//! they count as buffered. Fragments that arrive before the first key are
//! held and decrypted once `add_key` delivers it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mediaproc_codec::CencDecryptor;
use mediaproc_transport::message::{media_error, AppendTimes, BufferedRange};
use tracing::{debug, warn};
use url::Url;

use crate::fmp4::{find_pssh, protected_samples};
use crate::gl::Sample;
use crate::pipeline::{
    Pipeline, PipelineError, PipelineEvent, PipelineEventSink, PipelineFactory, PipelineState,
    StreamInfo,
};
use crate::player::MEDIA_SOURCE_SCHEME;

const CLIP_DURATION: Duration = Duration::from_secs(10);
const CLIP_SIZE: (u32, u32) = (640, 360);
const CHUNK_DURATION: Duration = Duration::from_secs(1);
/// Textures cycle through a small pool the way a decoder's output does.
const TEXTURE_POOL: u32 = 3;

/// MSE codec prefix to the description a demuxer reports for it.
const BACKEND_CODECS: &[(&str, &str)] = &[("mp4a", "MPEG-4 AAC"), ("vp9", "On2 VP9")];

fn backend_codec(mse_codec: &str) -> String {
    BACKEND_CODECS
        .iter()
        .find(|(prefix, _)| mse_codec.starts_with(prefix))
        .map(|(_, backend)| backend.to_string())
        .unwrap_or_else(|| mse_codec.to_string())
}

#[derive(Debug, Default)]
struct HeadlessSource {
    media_type: String,
    codec: String,
    announced: bool,
    ended: bool,
    ranges: Vec<BufferedRange>,
    /// Encrypted fragments waiting for a key.
    held: Vec<(Vec<u8>, AppendTimes)>,
    /// The last fragment handed on to decoding, in the clear.
    last_payload: Vec<u8>,
}

impl HeadlessSource {
    fn add_chunk(&mut self, start: Duration) {
        let end = start + CHUNK_DURATION;
        match self.ranges.last_mut() {
            Some(last) if last.end >= start && last.start <= start => {
                last.end = last.end.max(end);
            }
            _ => {
                self.ranges.push(BufferedRange { start, end });
                self.ranges.sort_by_key(|r| r.start);
            }
        }
    }

    fn next_start(&self) -> Duration {
        self.ranges.last().map(|r| r.end).unwrap_or_default()
    }

    fn buffer(&mut self, source_id: &str, data: Vec<u8>, times: &AppendTimes) {
        let offset = Duration::from_micros(times.timestamp_offset_us.max(0) as u64);
        let start = offset.max(self.next_start());
        if times.append_window_end.is_some_and(|end| start >= end) {
            debug!(source_id, "headless: chunk outside append window");
        } else {
            self.add_chunk(start);
        }
        debug!(source_id, bytes = data.len(), "headless: buffer pushed");
        self.last_payload = data;
    }
}

/// Decrypt every protected sample of `data` in place. Clear fragments pass
/// through untouched.
fn decrypt_fragment(decryptor: &CencDecryptor, data: &mut [u8]) -> Result<(), PipelineError> {
    let Some(samples) = protected_samples(data)? else {
        return Ok(());
    };
    for sample in &samples {
        decryptor.decrypt(&mut data[sample.range.clone()], &sample.info)?;
    }
    Ok(())
}

pub struct HeadlessPipeline {
    sink: PipelineEventSink,
    uri: Option<Url>,
    media_source: bool,
    prerolled: bool,
    position: Duration,
    interval: Duration,
    next_texture: u32,
    last_sample: Option<Sample>,
    sources: HashMap<String, HeadlessSource>,
    decryptor: Arc<CencDecryptor>,
    /// Set by the first `add_key`; decrypts never block after that.
    has_key: bool,
}

impl HeadlessPipeline {
    fn new(sink: PipelineEventSink) -> Self {
        Self {
            sink,
            uri: None,
            media_source: false,
            prerolled: false,
            position: Duration::ZERO,
            interval: Duration::from_millis(250),
            next_texture: 1,
            last_sample: None,
            sources: HashMap::new(),
            decryptor: Arc::new(CencDecryptor::new()),
            has_key: false,
        }
    }

    fn post(&self, event: PipelineEvent) {
        if !self.sink.post(event) {
            debug!("headless: main thread gone, event dropped");
        }
    }

    fn decode_frame(&mut self) -> Sample {
        let texture_id = self.next_texture;
        self.next_texture = self.next_texture % TEXTURE_POOL + 1;
        let sample = Sample::new(texture_id, CLIP_SIZE.0, CLIP_SIZE.1);
        self.last_sample = Some(sample.clone());
        sample
    }

    fn preroll(&mut self) {
        self.post(PipelineEvent::SourceSetup);
        if !self.media_source {
            self.post(PipelineEvent::DurationChanged(CLIP_DURATION));
            self.post(PipelineEvent::VideoDimensionsChanged {
                width: CLIP_SIZE.0,
                height: CLIP_SIZE.1,
            });
            let frame = self.decode_frame();
            self.post(PipelineEvent::FrameReady(frame));
        }
        self.post(PipelineEvent::AsyncDone);
        self.prerolled = true;
    }
}

impl Pipeline for HeadlessPipeline {
    fn set_uri(&mut self, uri: &Url) -> Result<(), PipelineError> {
        self.media_source = uri.scheme() == MEDIA_SOURCE_SCHEME;
        self.uri = Some(uri.clone());
        self.prerolled = false;
        self.position = Duration::ZERO;
        self.sources.clear();
        debug!(uri = %uri, "headless: uri set");
        Ok(())
    }

    fn set_position_update_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    fn play(&mut self) -> Result<(), PipelineError> {
        if self.uri.is_none() {
            return Err(PipelineError::InvalidState("no uri"));
        }
        if !self.prerolled {
            self.preroll();
        }
        // The sink re-delivers the preroll buffer on the first render.
        if let Some(sample) = self.last_sample.clone() {
            self.post(PipelineEvent::FrameReady(sample));
        }
        self.post(PipelineEvent::StateChanged(PipelineState::Playing));
        self.post(PipelineEvent::PositionUpdated(self.position));
        Ok(())
    }

    fn pause(&mut self) -> Result<(), PipelineError> {
        if self.uri.is_none() {
            return Err(PipelineError::InvalidState("no uri"));
        }
        if !self.prerolled {
            self.preroll();
        }
        self.post(PipelineEvent::StateChanged(PipelineState::Paused));
        Ok(())
    }

    fn seek(&mut self, position: Duration) -> Result<(), PipelineError> {
        if self.uri.is_none() {
            return Err(PipelineError::InvalidState("no uri"));
        }
        self.position = if self.media_source {
            position
        } else {
            position.min(CLIP_DURATION)
        };
        self.post(PipelineEvent::SeekDone(Some(self.position)));
        Ok(())
    }

    fn add_source(
        &mut self,
        source_id: &str,
        media_type: &str,
        codec: &str,
    ) -> Result<(), PipelineError> {
        if self.sources.contains_key(source_id) {
            return Err(PipelineError::DuplicateSource(source_id.to_string()));
        }
        self.sources.insert(
            source_id.to_string(),
            HeadlessSource {
                media_type: media_type.to_string(),
                codec: codec.to_string(),
                ..Default::default()
            },
        );
        Ok(())
    }

    fn remove_source(&mut self, source_id: &str) {
        self.sources.remove(source_id);
    }

    fn push_buffer(
        &mut self,
        source_id: &str,
        data: Vec<u8>,
        times: &AppendTimes,
    ) -> Result<(), PipelineError> {
        let source = self
            .sources
            .get_mut(source_id)
            .ok_or_else(|| PipelineError::UnknownSource(source_id.to_string()))?;

        let mut events = Vec::new();
        if !source.announced {
            source.announced = true;
            let stream_type = source
                .media_type
                .split('/')
                .next()
                .unwrap_or_default()
                .to_string();
            events.push(PipelineEvent::MediaInfoUpdated(vec![StreamInfo {
                stream_type,
                codec: backend_codec(&source.codec),
            }]));
            if let Some((system_id, init_data)) = find_pssh(&data) {
                match self
                    .decryptor
                    .on_protection_event(&system_id, &init_data, "isobmff/cenc")
                {
                    Ok(request) => events.push(PipelineEvent::NeedKey {
                        system_id: request.system_id,
                        init_data: request.init_data,
                    }),
                    Err(e) => warn!(source_id, error = %e, "headless: protection ignored"),
                }
            }
        }

        let mut data = data;
        let outcome = match protected_samples(&data) {
            Ok(Some(_)) if !self.has_key => {
                debug!(source_id, bytes = data.len(), "headless: encrypted chunk held for key");
                source.held.push((data, *times));
                Ok(())
            }
            Ok(Some(_)) => decrypt_fragment(&self.decryptor, &mut data)
                .map(|()| source.buffer(source_id, data, times)),
            Ok(None) => {
                source.buffer(source_id, data, times);
                Ok(())
            }
            Err(e) => Err(e.into()),
        };
        match &outcome {
            Ok(()) => {
                source.ended = false;
                events.push(PipelineEvent::BufferedRanges {
                    source_id: source_id.to_string(),
                    ranges: source.ranges.clone(),
                });
            }
            Err(e) => {
                warn!(source_id, error = %e, "headless: append not decodable");
                events.push(PipelineEvent::Error(media_error::DECODE));
            }
        }

        for event in events {
            self.post(event);
        }
        outcome
    }

    fn abort(&mut self, source_id: &str) {
        debug!(source_id, "headless: abort");
    }

    fn remove_range(&mut self, source_id: &str, start: Duration, end: Duration) {
        let Some(source) = self.sources.get_mut(source_id) else { return };
        source.ranges.retain(|r| r.end <= start || r.start >= end);
    }

    fn end_of_stream(&mut self, source_id: &str) {
        let Some(source) = self.sources.get_mut(source_id) else { return };
        source.ended = true;
        if self.sources.values().all(|s| s.ended) {
            self.post(PipelineEvent::EndOfStream);
        }
    }

    fn set_duration(&mut self, duration: Duration) {
        self.post(PipelineEvent::DurationChanged(duration));
    }

    fn add_key(&mut self, _key_id: &[u8], key: &[u8]) -> Result<(), PipelineError> {
        self.decryptor.add_key(key)?;
        self.has_key = true;

        let mut events = Vec::new();
        for (source_id, source) in &mut self.sources {
            if source.held.is_empty() {
                continue;
            }
            for (mut data, times) in std::mem::take(&mut source.held) {
                match decrypt_fragment(&self.decryptor, &mut data) {
                    Ok(()) => source.buffer(source_id, data, &times),
                    Err(e) => {
                        warn!(source_id, error = %e, "headless: held chunk failed to decrypt");
                        events.push(PipelineEvent::Error(media_error::DECODE));
                    }
                }
            }
            events.push(PipelineEvent::BufferedRanges {
                source_id: source_id.clone(),
                ranges: source.ranges.clone(),
            });
        }
        for event in events {
            self.post(event);
        }
        Ok(())
    }
}

impl Drop for HeadlessPipeline {
    fn drop(&mut self) {
        self.decryptor.cancel();
    }
}

#[derive(Debug, Default)]
pub struct HeadlessPipelineFactory;

impl PipelineFactory for HeadlessPipelineFactory {
    fn create(&self, sink: PipelineEventSink) -> Result<Box<dyn Pipeline>, PipelineError> {
        Ok(Box::new(HeadlessPipeline::new(sink)))
    }
}

#[cfg(test)]
mod tests {
    use mediaproc_codec::cenc::CLEAR_KEY_SYSTEM_ID;
    use tokio::sync::mpsc;

    use super::*;
    use crate::child_thread::MainEvent;
    use crate::fmp4::find_pssh;

    fn pipeline() -> (HeadlessPipeline, mpsc::UnboundedReceiver<MainEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (HeadlessPipeline::new(PipelineEventSink::new(tx, 1, 2)), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<MainEvent>) -> Vec<PipelineEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let MainEvent::Pipeline {
                client_id, player_id, event,
            } = ev
            {
                assert_eq!((client_id, player_id), (1, 2));
                out.push(event);
            }
        }
        out
    }

    fn pssh_box() -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&32u32.to_be_bytes());
        b.extend_from_slice(b"pssh");
        b.extend_from_slice(&[0, 0, 0, 0]);
        b.extend_from_slice(&[
            0x58, 0x14, 0x7e, 0xc8, 0x04, 0x23, 0x46, 0x59, 0x92, 0xe6, 0xf5, 0x2c, 0x5c, 0xe8,
            0xc3, 0xcc,
        ]);
        b.extend_from_slice(&[0, 0, 0, 0]);
        b
    }

    #[test]
    fn url_preroll_sequence() {
        let (mut p, mut rx) = pipeline();
        p.set_uri(&Url::parse("https://example.com/clip.mp4").unwrap())
            .unwrap();
        p.pause().unwrap();
        let events = drain(&mut rx);
        assert!(matches!(events[0], PipelineEvent::SourceSetup));
        assert!(matches!(events[1], PipelineEvent::DurationChanged(d) if d == CLIP_DURATION));
        assert!(matches!(
            events[3],
            PipelineEvent::FrameReady(ref s) if s.texture_id() == 1
        ));
        assert!(matches!(events[4], PipelineEvent::AsyncDone));
        assert!(matches!(
            events[5],
            PipelineEvent::StateChanged(PipelineState::Paused)
        ));
    }

    #[test]
    fn play_redelivers_preroll_frame() {
        let (mut p, mut rx) = pipeline();
        p.set_uri(&Url::parse("file:///tmp/clip.webm").unwrap())
            .unwrap();
        p.pause().unwrap();
        drain(&mut rx);
        p.play().unwrap();
        let events = drain(&mut rx);
        assert!(matches!(
            events[0],
            PipelineEvent::FrameReady(ref s) if s.texture_id() == 1
        ));
        assert!(matches!(
            events[1],
            PipelineEvent::StateChanged(PipelineState::Playing)
        ));
    }

    #[test]
    fn commands_before_uri_are_rejected() {
        let (mut p, _rx) = pipeline();
        assert!(matches!(p.play(), Err(PipelineError::InvalidState(_))));
        assert!(matches!(
            p.seek(Duration::from_secs(1)),
            Err(PipelineError::InvalidState(_))
        ));
    }

    #[test]
    fn first_append_announces_stream_and_key_need() {
        let (mut p, mut rx) = pipeline();
        p.set_uri(&Url::parse("mediasourceblob:https://example.com/x").unwrap())
            .unwrap();
        p.add_source("a", "audio/mp4", "mp4a.40.2").unwrap();
        p.push_buffer("a", pssh_box(), &AppendTimes::default())
            .unwrap();
        let events = drain(&mut rx);
        match &events[0] {
            PipelineEvent::MediaInfoUpdated(streams) => {
                assert_eq!(streams[0].stream_type, "audio");
                assert_eq!(streams[0].codec, "MPEG-4 AAC");
            }
            other => panic!("unexpected {other:?}"),
        }
        match &events[1] {
            PipelineEvent::NeedKey { system_id, init_data } => {
                assert_eq!(system_id, CLEAR_KEY_SYSTEM_ID);
                assert_eq!(init_data.len(), 32);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(events[2], PipelineEvent::BufferedRanges { .. }));

        p.push_buffer("a", vec![0; 4], &AppendTimes::default())
            .unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            PipelineEvent::BufferedRanges { ranges, .. } => {
                assert_eq!(
                    ranges,
                    &[BufferedRange {
                        start: Duration::ZERO,
                        end: Duration::from_secs(2)
                    }]
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn end_of_stream_waits_for_every_source() {
        let (mut p, mut rx) = pipeline();
        p.set_uri(&Url::parse("mediasourceblob:https://example.com/x").unwrap())
            .unwrap();
        p.add_source("a", "audio/mp4", "mp4a").unwrap();
        p.add_source("v", "video/webm", "vp9").unwrap();
        p.end_of_stream("a");
        assert!(drain(&mut rx).is_empty());
        p.end_of_stream("v");
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [PipelineEvent::EndOfStream]
        ));
    }

    #[test]
    fn pssh_found_inside_moov() {
        let pssh = pssh_box();
        let mut moov = Vec::new();
        moov.extend_from_slice(&((pssh.len() + 8) as u32).to_be_bytes());
        moov.extend_from_slice(b"moov");
        moov.extend_from_slice(&pssh);
        let mut data = vec![0, 0, 0, 8];
        data.extend_from_slice(b"ftyp");
        data.extend_from_slice(&moov);
        let (system_id, init) = find_pssh(&data).unwrap();
        assert_eq!(system_id, CLEAR_KEY_SYSTEM_ID);
        assert_eq!(init, pssh);
        assert!(find_pssh(b"garbage").is_none());
    }

    const KEY: [u8; 16] = [7; 16];
    const IV: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];

    fn boxed(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut b = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
        b.extend_from_slice(kind);
        b.extend_from_slice(payload);
        b
    }

    /// A one-sample `cenc` fragment whose whole `mdat` is encrypted.
    fn encrypted_fragment(plain: &[u8]) -> Vec<u8> {
        let mut senc = vec![0, 0, 0, 0, 0, 0, 0, 1];
        senc.extend_from_slice(&IV);
        let moof = boxed(b"moof", &boxed(b"traf", &boxed(b"senc", &senc)));
        let mut cipher = plain.to_vec();
        mediaproc_codec::AesCtrState::new(&KEY, &IV)
            .unwrap()
            .apply_keystream(&mut cipher);
        [moof, boxed(b"mdat", &cipher)].concat()
    }

    fn mse_pipeline() -> (HeadlessPipeline, mpsc::UnboundedReceiver<MainEvent>) {
        let (mut p, rx) = pipeline();
        p.set_uri(&Url::parse("mediasourceblob:https://example.com/x").unwrap())
            .unwrap();
        p.add_source("v", "video/mp4", "avc1.42E01E").unwrap();
        (p, rx)
    }

    #[test]
    fn encrypted_append_waits_for_key_then_decrypts() {
        let (mut p, mut rx) = mse_pipeline();
        let plain = b"sixteen byte run plus a tail".to_vec();
        let fragment = encrypted_fragment(&plain);

        p.push_buffer("v", fragment.clone(), &AppendTimes::default())
            .unwrap();
        let held = drain(&mut rx);
        assert!(matches!(
            held.last(),
            Some(PipelineEvent::BufferedRanges { ranges, .. }) if ranges.is_empty()
        ));
        assert_eq!(p.sources["v"].held.len(), 1);

        p.add_key(&[0; 16], &KEY).unwrap();
        let events = drain(&mut rx);
        assert!(matches!(
            events.as_slice(),
            [PipelineEvent::BufferedRanges { ranges, .. }] if ranges.len() == 1
        ));
        let source = &p.sources["v"];
        assert!(source.held.is_empty());
        assert_eq!(source.last_payload.len(), fragment.len());
        assert!(source.last_payload.ends_with(&plain));
        assert!(!fragment.ends_with(&plain));
    }

    #[test]
    fn encrypted_append_after_key_decrypts_at_once() {
        let (mut p, mut rx) = mse_pipeline();
        p.add_key(&[0; 16], &KEY).unwrap();
        let plain = vec![0x42; 40];
        p.push_buffer("v", encrypted_fragment(&plain), &AppendTimes::default())
            .unwrap();
        assert!(p.sources["v"].last_payload.ends_with(&plain));
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, PipelineEvent::Error(_))));
    }

    #[test]
    fn undecodable_fragment_reports_decode_error() {
        let (mut p, mut rx) = mse_pipeline();
        p.add_key(&[0; 16], &KEY).unwrap();
        let mut senc = vec![0, 0, 0, 0, 0, 0, 0, 2];
        senc.extend_from_slice(&IV);
        senc.extend_from_slice(&IV);
        let moof = boxed(b"moof", &boxed(b"traf", &boxed(b"senc", &senc)));
        let data = [moof, boxed(b"mdat", &[0; 8])].concat();

        assert!(matches!(
            p.push_buffer("v", data, &AppendTimes::default()),
            Err(PipelineError::Fragment(_))
        ));
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, PipelineEvent::Error(code) if *code == media_error::DECODE)));
    }

    #[test]
    fn add_key_validates_length() {
        let (mut p, _rx) = pipeline();
        assert!(p.add_key(&[0; 16], &[1; 16]).is_ok());
        assert!(matches!(
            p.add_key(&[0; 16], &[1; 3]),
            Err(PipelineError::Decrypt(_))
        ));
    }
}
