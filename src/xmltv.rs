//! XMLTV rendering of a merged guide.
//!
//! Element order inside `<programme>` follows xmltv.dtd. Channel ids are `hdhomerun.` plus
//! the guide number; the playlist is keyed off the same function so the two files join.

use crate::models::hdhomerun::{FirstAiring, GuideNumber};
use crate::services::merge::{Channel, MergedGuide, Programme};
use chrono::{DateTime, Duration, NaiveDate, TimeZone};
use core::fmt;
use log::{debug, error, warn};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesText, Event};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;

pub const CHANNEL_ID_PREFIX: &str = "hdhomerun.";
pub const SOURCE_INFO_NAME: &str = "HDHomeRun";
pub const GENERATOR_INFO_NAME: &str = env!("CARGO_PKG_NAME");
pub const XMLTV_DOCTYPE: &str = r#"<!DOCTYPE tv SYSTEM "xmltv.dtd">"#;
const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S %z";
const LANG: (&str, &str) = ("lang", "en");

pub fn channel_id(guide_number: &GuideNumber) -> String {
    format!("{}{}", CHANNEL_ID_PREFIX, guide_number.as_str())
}

/// Inverse of [`channel_id`]; ids without the prefix are returned unchanged.
pub fn guide_number_from_channel_id(id: &str) -> &str {
    id.strip_prefix(CHANNEL_ID_PREFIX).unwrap_or(id)
}

/// Parse `S<n>E<m>` (both at least 1) into `(n, m)`.
pub fn parse_episode_number(raw: &str) -> Option<(u32, u32)> {
    let rest = raw.trim().strip_prefix(|c| c == 'S' || c == 's')?;
    let (season, episode) = rest.split_once(|c| c == 'E' || c == 'e')?;
    let season: u32 = season.parse().ok()?;
    let episode: u32 = episode.parse().ok()?;
    if season == 0 || episode == 0 {
        return None;
    }
    Some((season, episode))
}

/// Zero-based `xmltv_ns` form of an `S<n>E<m>` string, e.g. `S2E5` -> `1.4.0/0`.
pub fn xmltv_ns_episode(raw: &str) -> Option<String> {
    parse_episode_number(raw).map(|(s, e)| format!("{}.{}.0/0", s - 1, e - 1))
}

/// Put the XMLTV DOCTYPE on the line right after the XML declaration.
///
/// Handles a declaration followed by a newline, a declaration glued to the root element,
/// a bare declaration, and no declaration at all (one is added). A DOCTYPE already in place
/// is left alone.
pub fn add_doctype_declaration(xml: &str) -> String {
    let (declaration, rest) = match xml.strip_prefix("<?xml").and_then(|_| xml.find("?>")) {
        Some(end) => (&xml[..end + 2], &xml[end + 2..]),
        None => (XML_DECLARATION, xml),
    };
    let rest = rest.trim_start_matches(['\r', '\n']);
    if rest.starts_with("<!DOCTYPE") {
        return format!("{}\n{}", declaration, rest);
    }
    format!("{}\n{}\n{}", declaration, XMLTV_DOCTYPE, rest)
}

/// Why a single programme was left out of the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgrammeError {
    StartOutOfRange(i64),
    EndBeforeStart { start: i64, end: i64 },
    EndOutOfRange(i64),
    AirdateOutOfRange(i64),
}

impl Display for ProgrammeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ProgrammeError::StartOutOfRange(t) => write!(f, "start time {} is not a valid timestamp", t),
            ProgrammeError::EndBeforeStart { start, end } => write!(f, "end time {} is before start time {}", end, start),
            ProgrammeError::EndOutOfRange(t) => write!(f, "end time {} is not a valid timestamp", t),
            ProgrammeError::AirdateOutOfRange(t) => write!(f, "original airdate {} is not a valid timestamp", t),
        }
    }
}

impl Error for ProgrammeError {}

#[derive(Debug)]
pub enum EmitError {
    Io(io::Error),
    Xml(quick_xml::Error),
    Utf8(std::string::FromUtf8Error),
}

impl Display for EmitError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EmitError::Io(e) => write!(f, "io error: {}", e),
            EmitError::Xml(e) => write!(f, "xml error: {}", e),
            EmitError::Utf8(e) => write!(f, "output is not utf-8: {}", e),
        }
    }
}

impl Error for EmitError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            EmitError::Io(e) => Some(e),
            EmitError::Xml(e) => Some(e),
            EmitError::Utf8(e) => Some(e),
        }
    }
}

impl From<io::Error> for EmitError {
    fn from(value: io::Error) -> Self {
        EmitError::Io(value)
    }
}

impl From<quick_xml::Error> for EmitError {
    fn from(value: quick_xml::Error) -> Self {
        EmitError::Xml(value)
    }
}

#[derive(Debug, Clone)]
pub struct XmltvDocument {
    pub xml: String,
    pub channels: usize,
    pub programmes: usize,
    pub skipped: usize,
}

/// Validated, timezone-resolved values for one `<programme>`.
struct ProgrammeTimes<Tz: TimeZone> {
    start: DateTime<Tz>,
    stop: DateTime<Tz>,
    previously_shown: Option<PreviouslyShown>,
}

#[derive(Debug, PartialEq)]
enum PreviouslyShown {
    On(NaiveDate),
    Unknown,
}

pub struct XmltvWriter<Tz: TimeZone> {
    tz: Tz,
}

impl<Tz: TimeZone> XmltvWriter<Tz>
where
    Tz::Offset: Display,
{
    /// Timestamps are rendered in `tz`.
    pub fn new(tz: Tz) -> Self {
        XmltvWriter { tz }
    }

    pub fn render(&self, guide: &MergedGuide) -> Result<XmltvDocument, EmitError> {
        let mut written = 0usize;
        let mut skipped = 0usize;

        let mut writer = Writer::new_with_indent(Vec::new(), b'\t', 1);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        writer
            .create_element("tv")
            .with_attribute(("source-info-name", SOURCE_INFO_NAME))
            .with_attribute(("generator-info-name", GENERATOR_INFO_NAME))
            .write_inner_content(|w| {
                for channel in &guide.channels {
                    write_channel(w, channel)?;
                }
                for channel in &guide.channels {
                    for programme in guide.programmes_for(&channel.guide_number) {
                        match self.programme_times(programme) {
                            Ok(times) => {
                                self.write_programme(w, programme, &times)?;
                                written += 1;
                            }
                            Err(e) => {
                                error!("Error creating programme for {}: {}", programme.details.title, e);
                                skipped += 1;
                            }
                        }
                    }
                }
                Ok(())
            })?;

        let body = String::from_utf8(writer.into_inner()).map_err(EmitError::Utf8)?;
        Ok(XmltvDocument {
            xml: add_doctype_declaration(&body),
            channels: guide.channels.len(),
            programmes: written,
            skipped,
        })
    }

    fn programme_times(&self, programme: &Programme) -> Result<ProgrammeTimes<Tz>, ProgrammeError> {
        let details = &programme.details;
        let start_utc =
            DateTime::from_timestamp(details.start_time, 0).ok_or(ProgrammeError::StartOutOfRange(details.start_time))?;
        let end = details.end_time.unwrap_or(details.start_time);
        if end < details.start_time {
            return Err(ProgrammeError::EndBeforeStart {
                start: details.start_time,
                end,
            });
        }
        let start = start_utc.with_timezone(&self.tz);
        let stop = end
            .checked_sub(details.start_time)
            .and_then(Duration::try_seconds)
            .and_then(|d| start.clone().checked_add_signed(d))
            .ok_or(ProgrammeError::EndOutOfRange(end))?;

        let repeat = matches!(details.first, Some(FirstAiring(false)));
        let previously_shown = match details.original_airdate {
            Some(airdate) => {
                // airdates are midnight UTC of the original broadcast day
                let aired = DateTime::from_timestamp(airdate, 0)
                    .ok_or(ProgrammeError::AirdateOutOfRange(airdate))?
                    .date_naive();
                if aired != start.date_naive() {
                    Some(PreviouslyShown::On(aired))
                } else if repeat {
                    Some(PreviouslyShown::Unknown)
                } else {
                    None
                }
            }
            None if repeat => Some(PreviouslyShown::Unknown),
            None => None,
        };

        Ok(ProgrammeTimes {
            start,
            stop,
            previously_shown,
        })
    }

    fn write_programme(
        &self,
        w: &mut Writer<Vec<u8>>,
        programme: &Programme,
        times: &ProgrammeTimes<Tz>,
    ) -> io::Result<()> {
        let details = &programme.details;
        let start = times.start.format(TIMESTAMP_FORMAT).to_string();
        let stop = times.stop.format(TIMESTAMP_FORMAT).to_string();
        let channel = channel_id(&programme.guide_number);

        w.create_element("programme")
            .with_attribute(("start", start.as_str()))
            .with_attribute(("stop", stop.as_str()))
            .with_attribute(("channel", channel.as_str()))
            .write_inner_content(|w| {
                w.create_element("title")
                    .with_attribute(LANG)
                    .write_text_content(BytesText::new(&details.title))?;
                if let Some(sub_title) = &details.episode_title {
                    w.create_element("sub-title")
                        .with_attribute(LANG)
                        .write_text_content(BytesText::new(sub_title))?;
                }
                if let Some(desc) = &details.synopsis {
                    w.create_element("desc")
                        .with_attribute(LANG)
                        .write_text_content(BytesText::new(desc))?;
                }
                for category in details.filter.iter().flatten() {
                    w.create_element("category")
                        .with_attribute(LANG)
                        .write_text_content(BytesText::new(category))?;
                }
                if let Some(icon) = &details.image_url {
                    w.create_element("icon").with_attribute(("src", icon.as_str())).write_empty()?;
                }
                if let Some(raw) = &details.episode_number {
                    match xmltv_ns_episode(raw) {
                        Some(ns) => {
                            w.create_element("episode-num")
                                .with_attribute(("system", "onscreen"))
                                .write_text_content(BytesText::new(raw))?;
                            w.create_element("episode-num")
                                .with_attribute(("system", "xmltv_ns"))
                                .write_text_content(BytesText::new(&ns))?;
                        }
                        None => warn!("Invalid Series/Episode data {:?} for {}", raw, details.title),
                    }
                }
                match &times.previously_shown {
                    Some(PreviouslyShown::On(date)) => {
                        let aired = date.format("%Y%m%d").to_string();
                        w.create_element("previously-shown")
                            .with_attribute(("start", aired.as_str()))
                            .write_empty()?;
                    }
                    Some(PreviouslyShown::Unknown) => {
                        w.create_element("previously-shown").write_empty()?;
                    }
                    None => {}
                }
                if matches!(details.first, Some(FirstAiring(true))) {
                    w.create_element("new").write_empty()?;
                }
                Ok(())
            })?;

        debug!("Created programme: {}", details.title);
        Ok(())
    }
}

fn write_channel(w: &mut Writer<Vec<u8>>, channel: &Channel) -> io::Result<()> {
    let id = channel_id(&channel.guide_number);
    let name = channel.guide_name.as_deref().unwrap_or("Unknown");
    w.create_element("channel")
        .with_attribute(("id", id.as_str()))
        .write_inner_content(|w| {
            w.create_element("display-name").write_text_content(BytesText::new(name))?;
            if !channel.image_url.is_empty() {
                w.create_element("icon")
                    .with_attribute(("src", channel.image_url.as_str()))
                    .write_empty()?;
            }
            Ok(())
        })?;
    debug!("Created channel: {} (ID: {})", name, id);
    Ok(())
}
