//! Little-endian, fixed-layout wire codec for the camera's server-push
//! protocol (spec §3/§4.B). Every record is a 12-byte header followed by a
//! command-specific body; decoding never allocates beyond the returned
//! value.

use crate::error::Error;

/// `u32::from_le_bytes(*b"FOSC")`, spelled out rather than hardcoded so the
/// byte origin of the constant is visible at the call site.
pub const MAGIC: u32 = u32::from_le_bytes(*b"FOSC");

pub const HEADER_LEN: usize = 12;

/// Protocol commands this crate gives full, typed bodies to. Values not
/// listed here (login, speaker, PTZ, motion notifications — present in the
/// camera's wider command set) decode to [`Command::Unknown`] and are
/// skipped by the reader's resync path (spec §4.B).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    VideoOnRequest,
    CloseConnection,
    AudioOnRequest,
    VideoOnReply,
    AudioOnReply,
    VideoData,
    AudioData,
    Unknown(u32),
}

impl Command {
    fn from_u32(v: u32) -> Self {
        match v {
            0x00 => Command::VideoOnRequest,
            0x01 => Command::CloseConnection,
            0x02 => Command::AudioOnRequest,
            0x10 => Command::VideoOnReply,
            0x12 => Command::AudioOnReply,
            0x1A => Command::VideoData,
            0x1B => Command::AudioData,
            other => Command::Unknown(other),
        }
    }

    fn to_u32(self) -> u32 {
        match self {
            Command::VideoOnRequest => 0x00,
            Command::CloseConnection => 0x01,
            Command::AudioOnRequest => 0x02,
            Command::VideoOnReply => 0x10,
            Command::AudioOnReply => 0x12,
            Command::VideoData => 0x1A,
            Command::AudioData => 0x1B,
            Command::Unknown(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Videostream {
    Main = 0,
    Sub = 1,
}

impl Videostream {
    fn from_u8(v: u8) -> Result<Self, Error> {
        match v {
            0 => Ok(Videostream::Main),
            1 => Ok(Videostream::Sub),
            other => Err(Error::Protocol(format!("invalid Videostream value {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: Command,
    pub size: u32,
}

impl Header {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.command.to_u32().to_le_bytes());
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_LEN {
            return Err(Error::ShortBuffer {
                needed: HEADER_LEN,
                have: buf.len(),
            });
        }
        let ty = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let magic = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let size = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if magic != MAGIC {
            return Err(Error::InvalidMagic);
        }
        Ok(Header {
            command: Command::from_u32(ty),
            size,
        })
    }
}

/// Writes `s` into a zero-initialized `len`-byte run, truncating at
/// `len - 1` bytes of content and always leaving the final byte zero.
fn write_fixed_string(out: &mut Vec<u8>, s: &str, len: usize) {
    let mut field = vec![0u8; len];
    let bytes = s.as_bytes();
    let n = bytes.len().min(len.saturating_sub(1));
    field[..n].copy_from_slice(&bytes[..n]);
    out.extend_from_slice(&field);
}

fn read_fixed_string(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

pub const VIDEO_ON_REQUEST_LEN: usize = 161;
pub const CLOSE_CONNECTION_LEN: usize = 129;
pub const AUDIO_ON_REQUEST_LEN: usize = 161;
pub const ON_REPLY_LEN: usize = 36;
pub const AUDIO_DATA_SUBHEADER_LEN: usize = 36;

#[derive(Debug, Clone)]
pub struct VideoOnRequest {
    pub stream: Videostream,
    pub username: String,
    pub password: String,
    pub uid: u32,
}

impl VideoOnRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(VIDEO_ON_REQUEST_LEN);
        body.push(self.stream as u8);
        write_fixed_string(&mut body, &self.username, 64);
        write_fixed_string(&mut body, &self.password, 64);
        body.extend_from_slice(&self.uid.to_le_bytes());
        body.extend_from_slice(&[0u8; 28]);
        debug_assert_eq!(body.len(), VIDEO_ON_REQUEST_LEN);
        body
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        expect_len(buf, VIDEO_ON_REQUEST_LEN)?;
        Ok(VideoOnRequest {
            stream: Videostream::from_u8(buf[0])?,
            username: read_fixed_string(&buf[1..65]),
            password: read_fixed_string(&buf[65..129]),
            uid: u32::from_le_bytes(buf[129..133].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct CloseConnection {
    pub username: String,
    pub password: String,
}

impl CloseConnection {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(CLOSE_CONNECTION_LEN);
        body.push(0);
        write_fixed_string(&mut body, &self.username, 64);
        write_fixed_string(&mut body, &self.password, 64);
        debug_assert_eq!(body.len(), CLOSE_CONNECTION_LEN);
        body
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        expect_len(buf, CLOSE_CONNECTION_LEN)?;
        Ok(CloseConnection {
            username: read_fixed_string(&buf[1..65]),
            password: read_fixed_string(&buf[65..129]),
        })
    }
}

#[derive(Debug, Clone)]
pub struct AudioOnRequest {
    pub username: String,
    pub password: String,
}

impl AudioOnRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(AUDIO_ON_REQUEST_LEN);
        body.push(0);
        write_fixed_string(&mut body, &self.username, 64);
        write_fixed_string(&mut body, &self.password, 64);
        body.extend_from_slice(&[0u8; 32]);
        debug_assert_eq!(body.len(), AUDIO_ON_REQUEST_LEN);
        body
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        expect_len(buf, AUDIO_ON_REQUEST_LEN)?;
        Ok(AudioOnRequest {
            username: read_fixed_string(&buf[1..65]),
            password: read_fixed_string(&buf[65..129]),
        })
    }
}

/// Shared shape of `VIDEO_ON_REPLY` and `AUDIO_ON_REPLY` (spec §3).
#[derive(Debug, Clone, Copy)]
pub struct OnReply {
    pub failed: u8,
}

impl OnReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(ON_REPLY_LEN);
        body.push(self.failed);
        body.extend_from_slice(&[0u8; 35]);
        body
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        expect_len(buf, ON_REPLY_LEN)?;
        Ok(OnReply { failed: buf[0] })
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

fn expect_len(buf: &[u8], expected: usize) -> Result<(), Error> {
    if buf.len() != expected {
        return Err(Error::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Builds a full `{header, body}` record for `VIDEO_ON_REQUEST`.
pub fn encode_video_on_request(req: &VideoOnRequest) -> Vec<u8> {
    let body = req.encode();
    encode_record(Command::VideoOnRequest, &body)
}

pub fn encode_close_connection(req: &CloseConnection) -> Vec<u8> {
    let body = req.encode();
    encode_record(Command::CloseConnection, &body)
}

pub fn encode_audio_on_request(req: &AudioOnRequest) -> Vec<u8> {
    let body = req.encode();
    encode_record(Command::AudioOnRequest, &body)
}

fn encode_record(command: Command, body: &[u8]) -> Vec<u8> {
    let header = Header {
        command,
        size: body.len() as u32,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    header.encode(&mut out);
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// S1: encode {type=VIDEO_DATA, magic=FOSC, size=0x1000} matches the
    /// spec's byte-exact vector.
    #[test]
    fn header_round_trip_video_data() {
        let header = Header {
            command: Command::VideoData,
            size: 0x1000,
        };
        let mut bytes = Vec::new();
        header.encode(&mut bytes);
        assert_eq!(
            bytes,
            vec![0x1A, 0x00, 0x00, 0x00, 0x46, 0x4F, 0x53, 0x43, 0x00, 0x10, 0x00, 0x00]
        );
        let decoded = Header::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn invalid_magic_rejected() {
        let mut bytes = vec![0x1A, 0, 0, 0, 0, 0, 0, 0, 0, 0x10, 0, 0];
        bytes[4..8].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(Header::decode(&bytes), Err(Error::InvalidMagic)));
    }

    #[test]
    fn short_buffer_rejected() {
        let bytes = vec![0u8; 4];
        assert!(matches!(
            Header::decode(&bytes),
            Err(Error::ShortBuffer { needed: 12, have: 4 })
        ));
    }

    #[test]
    fn unknown_command_falls_through_to_resync() {
        let header = Header {
            command: Command::Unknown(0x0c), // LOGIN_REQ, not fully specified here
            size: 4,
        };
        let mut bytes = Vec::new();
        header.encode(&mut bytes);
        let decoded = Header::decode(&bytes).unwrap();
        assert_eq!(decoded.command, Command::Unknown(0x0c));
    }

    #[test]
    fn video_on_request_round_trip() {
        let req = VideoOnRequest {
            stream: Videostream::Sub,
            username: "admin".into(),
            password: "hunter2".into(),
            uid: 1_700_000_000,
        };
        let body = req.encode();
        assert_eq!(body.len(), VIDEO_ON_REQUEST_LEN);
        let decoded = VideoOnRequest::decode(&body).unwrap();
        assert_eq!(decoded.stream, Videostream::Sub);
        assert_eq!(decoded.username, "admin");
        assert_eq!(decoded.password, "hunter2");
        assert_eq!(decoded.uid, 1_700_000_000);
    }

    #[test]
    fn fixed_string_truncates_and_nul_terminates() {
        let mut out = Vec::new();
        write_fixed_string(&mut out, &"x".repeat(100), 64);
        assert_eq!(out.len(), 64);
        assert_eq!(out[63], 0);
        assert_eq!(&out[0..63], "x".repeat(63).as_bytes());
    }

    #[test]
    fn on_reply_success_and_failure() {
        let ok = OnReply::decode(&OnReply { failed: 0 }.encode()).unwrap();
        assert!(ok.is_success());
        let bad = OnReply::decode(&OnReply { failed: 1 }.encode()).unwrap();
        assert!(!bad.is_success());
    }

    #[test]
    fn wrong_length_body_is_rejected() {
        let err = VideoOnRequest::decode(&[0u8; 10]).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidLength {
                expected: VIDEO_ON_REQUEST_LEN,
                actual: 10
            }
        ));
    }
}
