//! Remux worker (component F): probes the H.264 input, opens the video
//! passthrough demuxer and the audio decode/resample/AC3-encode chain, and
//! pumps packets into a fragmented-MP4 muxer until the owning subscriber
//! stops it (spec §3/§4.F). Grounded on `velocut-media/src/encode.rs` for
//! the encoder-setup and packet-loop idiom and on
//! `original_source/ffmpeg_remuxer.cpp` for the exact remux state machine —
//! this crate copies video instead of transcoding it, and targets AC3
//! instead of AAC, but the open/steady-state/flush shape is the same one
//! `encode_clip`/`run_encode` already establish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec::{self, Id as CodecId};
use ffmpeg::encoder;
use ffmpeg::format::context::{Input, Output};
use ffmpeg::format::Sample;
use ffmpeg::media::Type as MediaType;
use ffmpeg::software::resampling;
use ffmpeg::util::channel_layout::ChannelLayout;
use ffmpeg::util::frame::audio::Audio as AudioFrame;
use ffmpeg::Packet;
use tracing::{debug, info, warn};

use foscam_core::PipeBuffer;

use crate::avio::{open_input_pipe, open_output_pipe, AvioHandle};
use crate::error::Error;

const AUDIO_SAMPLE_RATE: u32 = 8000;
const IDLE_SLEEP: Duration = Duration::from_millis(10);

pub struct WorkerConfig {
    pub probe_size: usize,
    pub video_buffer_size: usize,
    pub audio_buffer_size: usize,
    pub framerate: u32,
}

/// Mono sample FIFO feeding the AC3 encoder's fixed `frame_size`. Channel
/// count is always 1 here (the camera's audio is mono end to end), so a
/// single plane covers both packed and planar encoder formats.
struct AudioFifo {
    samples: Vec<f32>,
    frame_size: usize,
    format: Sample,
}

impl AudioFifo {
    fn new(frame_size: usize, format: Sample) -> Self {
        Self {
            samples: Vec::new(),
            frame_size,
            format,
        }
    }

    fn push(&mut self, frame: &AudioFrame) {
        let n = frame.samples();
        if n == 0 {
            return;
        }
        unsafe {
            let bytes = frame.data(0);
            let f32s = std::slice::from_raw_parts(bytes.as_ptr() as *const f32, n);
            self.samples.extend_from_slice(f32s);
        }
    }

    fn pop_frame(&mut self, pts: i64) -> Option<AudioFrame> {
        if self.samples.len() < self.frame_size {
            return None;
        }
        Some(self.build_frame(self.frame_size, pts))
    }

    /// Used only at shutdown: flushes a zero-padded tail frame so no
    /// buffered PCM is silently dropped.
    fn pop_tail(&mut self, pts: i64) -> Option<AudioFrame> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.build_frame(self.frame_size, pts))
    }

    fn build_frame(&mut self, n: usize, pts: i64) -> AudioFrame {
        let available = self.samples.len().min(n);
        let mut frame = AudioFrame::new(self.format, n, ChannelLayout::MONO);
        frame.set_rate(AUDIO_SAMPLE_RATE);
        frame.set_pts(Some(pts));
        unsafe {
            let data = frame.data_mut(0);
            let dst = std::slice::from_raw_parts_mut(data.as_mut_ptr() as *mut f32, n);
            dst[..available].copy_from_slice(&self.samples[..available]);
            if available < n {
                dst[available..].fill(0.0);
            }
        }
        self.samples.drain(..available);
        frame
    }
}

struct OpenState {
    video_input: Input,
    _video_avio: AvioHandle,
    audio_input: Input,
    _audio_avio: AvioHandle,
    audio_decoder: ffmpeg::decoder::audio::Audio,
    audio_encoder: ffmpeg::encoder::audio::Audio,
    resampler: resampling::Context,
    fifo: AudioFifo,
    octx: Output,
    _out_avio: AvioHandle,
    out_sample_idx: i64,
}

pub struct RemuxWorker {
    video_in: Arc<PipeBuffer>,
    audio_in: Arc<PipeBuffer>,
    remuxed_out: Arc<PipeBuffer>,
    stop: Arc<AtomicBool>,
    config: WorkerConfig,
    header_written: bool,
}

impl RemuxWorker {
    pub fn new(
        video_in: Arc<PipeBuffer>,
        audio_in: Arc<PipeBuffer>,
        remuxed_out: Arc<PipeBuffer>,
        stop: Arc<AtomicBool>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            video_in,
            audio_in,
            remuxed_out,
            stop,
            config,
            header_written: false,
        }
    }

    /// Blocking entry point; run on a dedicated thread per subscriber.
    /// Never panics on a codec-library error — any such error is logged
    /// and terminates the loop so the subscriber can be torn down cleanly
    /// without affecting the session or other subscribers (spec §7).
    pub fn run(mut self) {
        if let Err(e) = self.wait_for_probe_threshold() {
            warn!(error = %e, "remux worker stopped before probe threshold");
            return;
        }
        if self.stop.load(Ordering::SeqCst) {
            return;
        }

        let mut state = match self.open_streams() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "remux init failed");
                return;
            }
        };
        self.header_written = true;
        info!("remux worker streaming");

        if let Err(e) = self.steady_state(&mut state) {
            warn!(error = %e, "remux worker stopped on runtime error");
        }

        self.shutdown(state);
    }

    fn wait_for_probe_threshold(&self) -> Result<(), Error> {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Err(Error::RemuxInit("stopped before probe threshold".into()));
            }
            if self.video_in.read_available() >= self.config.probe_size {
                return Ok(());
            }
            std::thread::sleep(IDLE_SLEEP);
        }
    }

    fn open_streams(&self) -> Result<OpenState, Error> {
        let probe_size = self.config.probe_size.to_string();
        let framerate = self.config.framerate.to_string();
        let (video_input, video_avio) = open_input_pipe(
            Arc::clone(&self.video_in),
            "h264",
            self.config.video_buffer_size,
            &[("probesize2", &probe_size), ("framerate", &framerate)],
        )?;

        // `ar`/`ac` are ffmpeg CLI aliases, not demuxer-private AVOptions —
        // the raw PCM demuxer only recognizes `sample_rate`/`channels`
        // (libavformat/pcmdec.c). Passing the CLI names here left them
        // unconsumed in the dict and the demuxer fell back to 44100 Hz.
        let audio_rate = AUDIO_SAMPLE_RATE.to_string();
        let (audio_input, audio_avio) = open_input_pipe(
            Arc::clone(&self.audio_in),
            "s16le",
            self.config.audio_buffer_size,
            &[("sample_rate", &audio_rate), ("channels", "1")],
        )?;

        let audio_stream_idx = audio_input
            .streams()
            .best(MediaType::Audio)
            .ok_or_else(|| Error::RemuxInit("no audio stream in s16le demuxer".into()))?
            .index();
        let adec_ctx = codec::context::Context::from_parameters(
            audio_input.stream(audio_stream_idx).unwrap().parameters(),
        )
        .map_err(|e| Error::RemuxInit(format!("audio decoder context: {e}")))?;
        let audio_decoder = adec_ctx
            .decoder()
            .audio()
            .map_err(|e| Error::RemuxInit(format!("open PCM decoder: {e}")))?;

        let (mut octx, out_avio) =
            open_output_pipe(Arc::clone(&self.remuxed_out), self.config.video_buffer_size)?;

        let mut mux_opts = ffmpeg::Dictionary::new();
        mux_opts.set("movflags", "empty_moov+default_base_moof+frag_keyframe");

        let video_stream_idx = video_input
            .streams()
            .best(MediaType::Video)
            .ok_or_else(|| Error::RemuxInit("no video stream probed from H.264 input".into()))?
            .index();
        let video_in_stream = video_input.stream(video_stream_idx).unwrap();

        let mut ost_video = octx
            .add_stream(encoder::find(CodecId::H264))
            .map_err(|e| Error::RemuxInit(format!("add video stream: {e}")))?;
        ost_video.set_time_base(video_in_stream.time_base());
        // No safe `Stream::codecpar_mut()` in this version of
        // ffmpeg-the-third (same gap `encode.rs` works around) — index
        // the raw AVStream array directly.
        unsafe {
            let codecpar = (**(*octx.as_mut_ptr()).streams.add(0)).codecpar;
            let ret = ffmpeg::ffi::avcodec_parameters_copy(codecpar, video_in_stream.parameters().as_ptr());
            if ret < 0 {
                return Err(Error::RemuxInit(format!(
                    "copy video codec parameters failed: {ret}"
                )));
            }
            (*codecpar).codec_tag = 0;
        }

        let ac3 = encoder::find(CodecId::AC3)
            .ok_or_else(|| Error::RemuxInit("AC3 encoder not available".into()))?;
        let mut ost_audio = octx
            .add_stream(ac3)
            .map_err(|e| Error::RemuxInit(format!("add audio stream: {e}")))?;

        let aenc_ctx = codec::context::Context::new_with_codec(ac3);
        let mut audio_enc = aenc_ctx
            .encoder()
            .audio()
            .map_err(|e| Error::RemuxInit(format!("create AC3 encoder context: {e}")))?;
        audio_enc.set_rate(AUDIO_SAMPLE_RATE as i32);
        audio_enc.set_ch_layout(ChannelLayout::MONO);
        // Do not assume FLT here: the AC3 encoder historically negotiates
        // FLTP, not FLT (spec §9 open question). Query the opened
        // encoder's actual format below instead of trusting this request.
        audio_enc.set_format(Sample::F32(ffmpeg::format::sample::Type::Planar));

        let audio_encoder = audio_enc
            .open_as_with(ac3, ffmpeg::Dictionary::new())
            .map_err(|e| Error::RemuxInit(format!("open AC3 encoder: {e}")))?;
        let negotiated_format = audio_encoder.format();
        let frame_size = (audio_encoder.frame_size() as usize).max(1);

        let audio_tb = ffmpeg::util::rational::Rational::new(1, AUDIO_SAMPLE_RATE as i32);
        ost_audio.set_time_base(audio_tb);
        unsafe {
            let codecpar = (**(*octx.as_mut_ptr()).streams.add(1)).codecpar;
            let ret = ffmpeg::ffi::avcodec_parameters_from_context(
                codecpar,
                audio_encoder.as_ptr() as *mut ffmpeg::ffi::AVCodecContext,
            );
            if ret < 0 {
                return Err(Error::RemuxInit(format!(
                    "avcodec_parameters_from_context (audio) failed: {ret}"
                )));
            }
        }

        octx.write_header_with(mux_opts)
            .map_err(|e| Error::RemuxInit(format!("write container header: {e}")))?;

        let resampler = resampling::Context::get2(
            Sample::I16(ffmpeg::format::sample::Type::Packed),
            ChannelLayout::MONO,
            AUDIO_SAMPLE_RATE,
            negotiated_format,
            ChannelLayout::MONO,
            AUDIO_SAMPLE_RATE,
        )
        .map_err(|e| Error::RemuxInit(format!("create audio resampler: {e}")))?;

        Ok(OpenState {
            video_input,
            _video_avio: video_avio,
            audio_input,
            _audio_avio: audio_avio,
            audio_decoder,
            audio_encoder,
            resampler,
            fifo: AudioFifo::new(frame_size, negotiated_format),
            octx,
            _out_avio: out_avio,
            out_sample_idx: 0,
        })
    }

    fn steady_state(&self, state: &mut OpenState) -> Result<(), Error> {
        while !self.stop.load(Ordering::SeqCst) {
            let did_video = self.remux_video_packet(state)?;
            let did_audio = self.transcode_audio_packet(state)?;

            if !did_video && !did_audio && self.video_in.read_available() == 0 && self.audio_in.read_available() == 0 {
                std::thread::sleep(IDLE_SLEEP);
            }
        }
        Ok(())
    }

    fn remux_video_packet(&self, state: &mut OpenState) -> Result<bool, Error> {
        let mut pkt = Packet::empty();
        if !try_read_frame(&mut state.video_input, &mut pkt)? {
            return Ok(false);
        }
        let in_tb = state
            .video_input
            .stream(0)
            .map(|s| s.time_base())
            .unwrap_or(ffmpeg::util::rational::Rational::new(1, 1));
        let out_tb = state
            .octx
            .stream(0)
            .map(|s| s.time_base())
            .unwrap_or(in_tb);
        pkt.rescale_ts(in_tb, out_tb);
        pkt.set_stream(0);
        pkt.write_interleaved(&mut state.octx)
            .map_err(|e| Error::RemuxRuntime(format!("write video packet: {e}")))?;
        Ok(true)
    }

    fn transcode_audio_packet(&self, state: &mut OpenState) -> Result<bool, Error> {
        let mut pkt = Packet::empty();
        if !try_read_frame(&mut state.audio_input, &mut pkt)? {
            return Ok(false);
        }

        state
            .audio_decoder
            .send_packet(&pkt)
            .map_err(|e| Error::RemuxRuntime(format!("send audio packet to decoder: {e}")))?;

        let in_tb = state
            .audio_input
            .stream(0)
            .map(|s| s.time_base())
            .unwrap_or(ffmpeg::util::rational::Rational::new(1, AUDIO_SAMPLE_RATE as i32));

        let mut raw = AudioFrame::empty();
        while state.audio_decoder.receive_frame(&mut raw).is_ok() {
            let mut resampled = AudioFrame::empty();
            if state.resampler.run(&raw, &mut resampled).is_err() || resampled.samples() == 0 {
                continue;
            }
            state.fifo.push(&resampled);

            while let Some(frame) = state.fifo.pop_frame(state.out_sample_idx) {
                state.out_sample_idx += state.fifo.frame_size as i64;
                self.encode_and_write(state, frame, in_tb)?;
            }
        }
        Ok(true)
    }

    fn encode_and_write(
        &self,
        state: &mut OpenState,
        frame: AudioFrame,
        in_tb: ffmpeg::util::rational::Rational,
    ) -> Result<(), Error> {
        state
            .audio_encoder
            .send_frame(&frame)
            .map_err(|e| Error::RemuxRuntime(format!("send audio frame to encoder: {e}")))?;

        let out_tb = state
            .octx
            .stream(1)
            .map(|s| s.time_base())
            .unwrap_or(in_tb);

        let mut pkt = Packet::empty();
        while state.audio_encoder.receive_packet(&mut pkt).is_ok() {
            // Spec §9 open question: the original's filter-graph variant
            // rescales from the encoder's own time base instead. We
            // rescale from the input demuxer's time base as the main
            // spec text directs, verified empirically against monotone
            // output timestamps (invariant 7) — see DESIGN.md.
            pkt.rescale_ts(in_tb, out_tb);
            pkt.set_stream(1);
            pkt.write_interleaved(&mut state.octx)
                .map_err(|e| Error::RemuxRuntime(format!("write audio packet: {e}")))?;
        }
        Ok(())
    }

    fn shutdown(&self, mut state: OpenState) {
        if let Some(frame) = state.fifo.pop_tail(state.out_sample_idx) {
            let in_tb = ffmpeg::util::rational::Rational::new(1, AUDIO_SAMPLE_RATE as i32);
            let _ = self.encode_and_write(&mut state, frame, in_tb);
        }
        let _ = state.audio_encoder.send_eof();
        let mut pkt = Packet::empty();
        while state.audio_encoder.receive_packet(&mut pkt).is_ok() {
            let _ = pkt.write_interleaved(&mut state.octx);
        }

        if self.header_written {
            if let Err(e) = state.octx.write_trailer() {
                warn!(error = %e, "failed writing container trailer");
            } else {
                debug!("container trailer written");
            }
        }
        // `state` drops here, releasing demuxers/muxer/encoder/resampler
        // and the custom AVIOContexts in a fixed, deterministic order.
    }
}

fn try_read_frame(input: &mut Input, pkt: &mut Packet) -> Result<bool, Error> {
    let ret = unsafe { ffmpeg::ffi::av_read_frame(input.as_mut_ptr(), pkt.as_mut_ptr()) };
    if ret >= 0 {
        Ok(true)
    } else if ret == ffmpeg::ffi::AVERROR(ffmpeg::ffi::EAGAIN) || ret == ffmpeg::ffi::AVERROR_EOF {
        Ok(false)
    } else {
        Err(Error::RemuxRuntime(format!("av_read_frame failed: {ret}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_accumulates_until_frame_size_then_drains() {
        let mut fifo = AudioFifo::new(4, Sample::F32(ffmpeg::format::sample::Type::Planar));
        assert!(fifo.pop_frame(0).is_none());

        let mut frame = AudioFrame::new(
            Sample::F32(ffmpeg::format::sample::Type::Planar),
            4,
            ChannelLayout::MONO,
        );
        unsafe {
            let data = frame.data_mut(0);
            let dst = std::slice::from_raw_parts_mut(data.as_mut_ptr() as *mut f32, 4);
            dst.copy_from_slice(&[0.1, 0.2, 0.3, 0.4]);
        }
        fifo.push(&frame);

        let popped = fifo.pop_frame(0).expect("exactly one frame's worth buffered");
        assert_eq!(popped.samples(), 4);
        assert!(fifo.pop_frame(0).is_none());
    }

    #[test]
    fn tail_flush_zero_pads_partial_frame() {
        let mut fifo = AudioFifo::new(8, Sample::F32(ffmpeg::format::sample::Type::Planar));
        let mut frame = AudioFrame::new(
            Sample::F32(ffmpeg::format::sample::Type::Planar),
            3,
            ChannelLayout::MONO,
        );
        unsafe {
            let data = frame.data_mut(0);
            let dst = std::slice::from_raw_parts_mut(data.as_mut_ptr() as *mut f32, 3);
            dst.copy_from_slice(&[1.0, 1.0, 1.0]);
        }
        fifo.push(&frame);
        assert!(fifo.pop_frame(0).is_none()); // below frame_size, not yet flushed

        let tail = fifo.pop_tail(0).expect("partial tail should flush");
        assert_eq!(tail.samples(), 8);
    }
}
