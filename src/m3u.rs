//! M3U playlist whose `tvg-id` values join against the XMLTV channel ids.

use crate::services::merge::MergedGuide;
use crate::xmltv::{channel_id, guide_number_from_channel_id};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::fmt::Write as _;

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8000";
const GROUP_TITLE: &str = "Channels";

/// A channel as the playlist sees it. `id` is the XMLTV channel id.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistChannel {
    pub id: String,
    pub name: String,
    pub icon: Option<String>,
}

impl PlaylistChannel {
    pub fn number(&self) -> &str {
        guide_number_from_channel_id(&self.id)
    }
}

pub fn channels_from_guide(guide: &MergedGuide) -> Vec<PlaylistChannel> {
    guide
        .channels
        .iter()
        .map(|c| PlaylistChannel {
            id: channel_id(&c.guide_number),
            name: c.guide_name.clone().unwrap_or_else(|| "Unknown".to_string()),
            icon: Some(c.image_url.clone()).filter(|s| !s.is_empty()),
        })
        .collect()
}

#[derive(PartialEq)]
enum State {
    Root,
    Channel,
    DisplayName,
}

/// Read the `<channel>` elements of an XMLTV document. Channels without an id or a
/// display-name are dropped.
pub fn channels_from_xmltv(xml: &str) -> Result<Vec<PlaylistChannel>, String> {
    // no trim_text: entity references split the text into several events
    let mut reader = Reader::from_str(xml);

    let mut channels = Vec::new();
    let mut state = State::Root;
    let mut id: Option<String> = None;
    let mut name: Option<String> = None;
    let mut icon: Option<String> = None;
    let mut text_buf = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"channel" => {
                    state = State::Channel;
                    id = get_attribute(e, b"id")?;
                    name = None;
                    icon = None;
                }
                b"display-name" if state == State::Channel && name.is_none() => {
                    state = State::DisplayName;
                    text_buf.clear();
                }
                _ => {}
            },
            Ok(Event::Empty(ref e)) if state == State::Channel && e.name().as_ref() == b"icon" => {
                icon = get_attribute(e, b"src")?;
            }
            Ok(Event::Text(e)) if state == State::DisplayName => {
                text_buf.push_str(&String::from_utf8_lossy(e.as_ref()));
            }
            Ok(Event::GeneralRef(e)) if state == State::DisplayName => {
                text_buf.push('&');
                text_buf.push_str(&String::from_utf8_lossy(e.as_ref()));
                text_buf.push(';');
            }
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"display-name" if state == State::DisplayName => {
                    name = Some(unescape(text_buf.trim())?);
                    state = State::Channel;
                }
                b"channel" if state == State::Channel => {
                    if let (Some(id), Some(name)) = (id.take(), name.take()) {
                        if !id.is_empty() && !name.is_empty() {
                            channels.push(PlaylistChannel {
                                id,
                                name,
                                icon: icon.take().filter(|s| !s.is_empty()),
                            });
                        }
                    }
                    state = State::Root;
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(format!("invalid XMLTV at byte {}: {}", reader.buffer_position(), e)),
        }
    }

    Ok(channels)
}

fn unescape(raw: &str) -> Result<String, String> {
    quick_xml::escape::unescape(raw)
        .map(|s| s.into_owned())
        .map_err(|e| format!("bad entity in {:?}: {}", raw, e))
}

fn get_attribute(e: &BytesStart, name: &[u8]) -> Result<Option<String>, String> {
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == name {
            let raw = String::from_utf8_lossy(attr.value.as_ref());
            return unescape(&raw).map(Some);
        }
    }
    Ok(None)
}

/// Render the playlist. Each entry streams from `{server_url}/auto/v{number}`.
pub fn render_playlist(channels: &[PlaylistChannel], server_url: &str) -> String {
    let server_url = server_url.trim_end_matches('/');
    let mut out = String::from("#EXTM3U\n");
    for channel in channels {
        let number = channel.number();
        let _ = write!(
            out,
            r#"#EXTINF:-1 tvg-id="{n}" channel-id="{n}" channel-number="{n}" tvg-name="{name}""#,
            n = number,
            name = channel.name
        );
        if let Some(icon) = &channel.icon {
            let _ = write!(out, r#" tvg-logo="{}""#, icon);
        }
        let _ = writeln!(out, r#" group-title="{}",{} {}"#, GROUP_TITLE, number, channel.name);
        let _ = writeln!(out, "{}/auto/v{}", server_url, number);
    }
    out
}
