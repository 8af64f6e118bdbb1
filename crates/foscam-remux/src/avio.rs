//! Custom `AVIOContext` trampolines over [`foscam_core::PipeBuffer`].
//!
//! `video_in`/`audio_in`/`remuxed_out` are in-memory byte pipes, not files,
//! so the demuxers and muxer can't be opened with `format::input`/`output`
//! the way `velocut-media/src/encode.rs` opens on-disk clips. This mirrors
//! `original_source/ffmpeg_remuxer.cpp`'s `InDataFunctor`/`OutStreamFunctor`
//! shape: an opaque pointer to the pipe plus a C read/write callback handed
//! to `avio_alloc_context`, reached through `ffmpeg-the-third`'s raw `ffi`
//! module the same way `encode.rs` drops to `ffi::avcodec_parameters_from_context`
//! when the safe wrapper has no equivalent.

use std::ffi::c_void;
use std::sync::Arc;
use std::time::Duration;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::ffi;
use ffmpeg::format::context::{Input, Output};

use foscam_core::PipeBuffer;

use crate::error::Error;

/// How long a single `wait_and_pop` call inside a read trampoline may block
/// before reporting EAGAIN-as-EOF back to the demuxer for this iteration.
const READ_WAIT: Duration = Duration::from_millis(100);

struct ReaderState {
    pipe: Arc<PipeBuffer>,
}

unsafe extern "C" fn read_packet(
    opaque: *mut c_void,
    buf: *mut u8,
    buf_size: i32,
) -> i32 {
    if opaque.is_null() || buf_size <= 0 {
        return ffi::AVERROR_EOF;
    }
    let state = &*(opaque as *const ReaderState);
    let dst = std::slice::from_raw_parts_mut(buf, buf_size as usize);
    let n = state.pipe.wait_and_pop(dst, READ_WAIT);
    if n == 0 {
        // No error has occurred; the producer may simply be idle. FFmpeg
        // treats EAGAIN from a blocking-style callback as "try again", but
        // avio_alloc_context callbacks are expected to block, so we signal
        // EOF only when asked to shut down (see `drop_reader`). Returning 0
        // here would be misread as a valid empty read by some demuxers, so
        // surface a short non-fatal value the caller loop retries on.
        return ffi::AVERROR(ffi::EAGAIN);
    }
    n as i32
}

struct WriterState {
    pipe: Arc<PipeBuffer>,
}

unsafe extern "C" fn write_packet(
    opaque: *mut c_void,
    buf: *const u8,
    buf_size: i32,
) -> i32 {
    if opaque.is_null() || buf_size < 0 {
        return ffi::AVERROR(ffi::EINVAL);
    }
    let state = &*(opaque as *const WriterState);
    let src = std::slice::from_raw_parts(buf, buf_size as usize);
    state.pipe.push(src);
    buf_size
}

enum OpaqueKind {
    Reader,
    Writer,
}

/// Owns the heap allocations an `AVIOContext` needs for its lifetime: the
/// internal read/write buffer and the boxed opaque state. Freed from
/// [`Drop`] so every exit path (normal or error) releases them, per the
/// scoped-holder discipline in spec §9.
pub struct AvioHandle {
    ctx: *mut ffi::AVIOContext,
    opaque: *mut c_void,
    opaque_kind: OpaqueKind,
}

impl AvioHandle {
    fn new_reader(pipe: Arc<PipeBuffer>, buffer_size: usize) -> Result<Self, Error> {
        let opaque = Box::into_raw(Box::new(ReaderState { pipe })) as *mut c_void;
        unsafe { Self::alloc(buffer_size, 0, opaque, OpaqueKind::Reader, Some(read_packet), None) }
    }

    fn new_writer(pipe: Arc<PipeBuffer>, buffer_size: usize) -> Result<Self, Error> {
        let opaque = Box::into_raw(Box::new(WriterState { pipe })) as *mut c_void;
        unsafe { Self::alloc(buffer_size, 1, opaque, OpaqueKind::Writer, None, Some(write_packet)) }
    }

    unsafe fn alloc(
        buffer_size: usize,
        write_flag: i32,
        opaque: *mut c_void,
        opaque_kind: OpaqueKind,
        read_fn: ffi::AVIOContextReadFn,
        write_fn: ffi::AVIOContextWriteFn,
    ) -> Result<Self, Error> {
        let buffer = ffi::av_malloc(buffer_size) as *mut u8;
        if buffer.is_null() {
            Self::free_opaque(opaque, &opaque_kind);
            return Err(Error::RemuxInit("av_malloc for AVIOContext buffer failed".into()));
        }
        let ctx = ffi::avio_alloc_context(
            buffer,
            buffer_size as i32,
            write_flag,
            opaque,
            read_fn,
            write_fn,
            None,
        );
        if ctx.is_null() {
            ffi::av_free(buffer as *mut c_void);
            Self::free_opaque(opaque, &opaque_kind);
            return Err(Error::RemuxInit("avio_alloc_context failed".into()));
        }
        Ok(Self {
            ctx,
            opaque,
            opaque_kind,
        })
    }

    unsafe fn free_opaque(opaque: *mut c_void, kind: &OpaqueKind) {
        if opaque.is_null() {
            return;
        }
        match kind {
            OpaqueKind::Reader => drop(Box::from_raw(opaque as *mut ReaderState)),
            OpaqueKind::Writer => drop(Box::from_raw(opaque as *mut WriterState)),
        }
    }

    pub fn as_ptr(&self) -> *mut ffi::AVIOContext {
        self.ctx
    }
}

impl Drop for AvioHandle {
    fn drop(&mut self) {
        unsafe {
            if !self.ctx.is_null() {
                let buffer = (*self.ctx).buffer;
                if !buffer.is_null() {
                    ffi::av_free(buffer as *mut c_void);
                }
                ffi::avio_context_free(&mut self.ctx);
            }
            Self::free_opaque(self.opaque, &self.opaque_kind);
        }
    }
}

/// Opens a demuxer over `pipe`, forcing the input format to `format_name`
/// (`"h264"` or `"s16le"`, per spec §4.F) with the given probe size.
/// `options` are demuxer private-data options (e.g. `probesize2`,
/// `framerate`, `ar`, `ac`), built directly as an `AVDictionary` rather
/// than through the safe wrapper, since ownership of the dict has to be
/// handed piecemeal to `avformat_open_input` (it frees unconsumed keys
/// itself on return).
pub fn open_input_pipe(
    pipe: Arc<PipeBuffer>,
    format_name: &str,
    buffer_size: usize,
    options: &[(&str, &str)],
) -> Result<(Input, AvioHandle), Error> {
    let handle = AvioHandle::new_reader(pipe, buffer_size)?;

    unsafe {
        let mut fmt_ctx = ffi::avformat_alloc_context();
        if fmt_ctx.is_null() {
            return Err(Error::RemuxInit("avformat_alloc_context failed".into()));
        }
        (*fmt_ctx).pb = handle.as_ptr();

        let iformat = find_input_format(format_name)?;
        (*fmt_ctx).iformat = iformat;

        let mut opts_ptr = build_av_dict(options);
        let ret = ffi::avformat_open_input(&mut fmt_ctx, std::ptr::null(), iformat, &mut opts_ptr);
        ffi::av_dict_free(&mut opts_ptr);

        if ret < 0 {
            ffi::avformat_free_context(fmt_ctx);
            return Err(Error::RemuxInit(format!(
                "avformat_open_input ({format_name}) failed: {ret}"
            )));
        }

        let ret = ffi::avformat_find_stream_info(fmt_ctx, std::ptr::null_mut());
        if ret < 0 {
            ffi::avformat_close_input(&mut fmt_ctx);
            return Err(Error::RemuxInit(format!(
                "avformat_find_stream_info ({format_name}) failed: {ret}"
            )));
        }

        Ok((Input::wrap(fmt_ctx), handle))
    }
}

unsafe fn build_av_dict(options: &[(&str, &str)]) -> *mut ffi::AVDictionary {
    let mut dict: *mut ffi::AVDictionary = std::ptr::null_mut();
    for (key, value) in options {
        let key = std::ffi::CString::new(*key).expect("option key has no interior nul");
        let value = std::ffi::CString::new(*value).expect("option value has no interior nul");
        ffi::av_dict_set(&mut dict, key.as_ptr(), value.as_ptr(), 0);
    }
    dict
}

unsafe fn find_input_format(name: &str) -> Result<*const ffi::AVInputFormat, Error> {
    let cname = std::ffi::CString::new(name).expect("format name has no interior nul");
    let iformat = ffi::av_find_input_format(cname.as_ptr());
    if iformat.is_null() {
        return Err(Error::RemuxInit(format!("unknown input format {name}")));
    }
    Ok(iformat)
}

/// Opens a fragmented-MP4 muxer writing into `pipe`.
pub fn open_output_pipe(
    pipe: Arc<PipeBuffer>,
    buffer_size: usize,
) -> Result<(Output, AvioHandle), Error> {
    let handle = AvioHandle::new_writer(pipe, buffer_size)?;

    unsafe {
        let mut fmt_ctx: *mut ffi::AVFormatContext = std::ptr::null_mut();
        let format_name = std::ffi::CString::new("mp4").unwrap();
        let ret = ffi::avformat_alloc_output_context2(
            &mut fmt_ctx,
            std::ptr::null(),
            format_name.as_ptr(),
            std::ptr::null(),
        );
        if ret < 0 || fmt_ctx.is_null() {
            return Err(Error::RemuxInit(format!(
                "avformat_alloc_output_context2 failed: {ret}"
            )));
        }
        (*fmt_ctx).pb = handle.as_ptr();
        (*fmt_ctx).flags |= ffi::AVFMT_FLAG_CUSTOM_IO as i32;

        Ok((Output::wrap(fmt_ctx), handle))
    }
}
