//! One-shot CGI client used once at session construction to learn the
//! camera's advertised frame rate for the configured stream type (spec
//! §4.C). Deliberately minimal: two blocking GETs, no connection reuse, no
//! retries — any failure is fatal to session construction.

use crate::error::Error;

/// Issues the two CGI round trips and returns the frame rate (fps) the
/// camera advertises for the stream type it reports as active.
pub fn fetch_framerate(host: &str, port: u16, user: &str, password: &str) -> Result<u32, Error> {
    let stream_type = fetch_stream_type(host, port, user, password)?;
    fetch_frame_rate_for(host, port, user, password, stream_type)
}

fn base_url(host: &str, port: u16) -> String {
    format!("http://{host}:{port}/cgi-bin/CGIProxy.fcgi")
}

fn fetch_stream_type(host: &str, port: u16, user: &str, password: &str) -> Result<u32, Error> {
    let url = base_url(host, port);
    let body = ureq::get(&url)
        .query("cmd", "getMainVideoStreamType")
        .query("usr", user)
        .query("pwd", password)
        .call()
        .map_err(|e| Error::Cgi(format!("getMainVideoStreamType request failed: {e}")))?
        .into_string()
        .map_err(|e| Error::Cgi(format!("reading getMainVideoStreamType body: {e}")))?;

    extract_uint(&body, "streamType")
}

fn fetch_frame_rate_for(
    host: &str,
    port: u16,
    user: &str,
    password: &str,
    stream_type: u32,
) -> Result<u32, Error> {
    let url = base_url(host, port);
    let body = ureq::get(&url)
        .query("cmd", "getVideoStreamParam")
        .query("usr", user)
        .query("pwd", password)
        .call()
        .map_err(|e| Error::Cgi(format!("getVideoStreamParam request failed: {e}")))?
        .into_string()
        .map_err(|e| Error::Cgi(format!("reading getVideoStreamParam body: {e}")))?;

    let key = format!("frameRate{stream_type}");
    extract_uint(&body, &key)
}

/// Parses `body` as XML rooted at `CGI_Result` and returns `key`'s text
/// content as an unsigned integer.
fn extract_uint(body: &str, key: &str) -> Result<u32, Error> {
    let doc = roxmltree::Document::parse(body)
        .map_err(|e| Error::Cgi(format!("malformed CGI_Result XML: {e}")))?;

    let root = doc.root_element();
    if root.tag_name().name() != "CGI_Result" {
        return Err(Error::Cgi(format!(
            "expected root element CGI_Result, found {}",
            root.tag_name().name()
        )));
    }

    let node = root
        .children()
        .find(|n| n.is_element() && n.tag_name().name() == key)
        .ok_or_else(|| Error::Cgi(format!("CGI_Result missing key {key}")))?;

    let text = node
        .text()
        .ok_or_else(|| Error::Cgi(format!("CGI_Result.{key} has no text content")))?;

    text.trim()
        .parse::<u32>()
        .map_err(|e| Error::Cgi(format!("CGI_Result.{key} is not an unsigned integer: {e}")))
}
