//! Fold overlapping guide windows into one deduplicated channel and programme set.
//!
//! Only channels tuned on the local device survive. A programme is identified by
//! (guide number, start time, title); the first observation wins and later copies from
//! overlapping windows are dropped. Arrival order is kept as-is.
//!
//! Programme records are decoded only for tuned channels.

use crate::models::hdhomerun::{GuideNumber, GuideProgramme, GuideSegment, LineupEntry};
use core::fmt;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub guide_number: GuideNumber,
    pub guide_name: Option<String>,
    /// Stream URL from the lineup, when the device reported one.
    pub url: Option<String>,
    /// Set once, from the first guide segment that introduced the channel. Empty when absent.
    pub image_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Programme {
    pub guide_number: GuideNumber,
    pub details: GuideProgramme,
}

type ProgrammeKey = (GuideNumber, i64, String);

fn programme_key(guide_number: &GuideNumber, p: &GuideProgramme) -> ProgrammeKey {
    (guide_number.clone(), p.start_time, p.title.clone())
}

/// Result of merging: channels in first-seen order, programmes in arrival order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedGuide {
    pub channels: Vec<Channel>,
    pub programmes: Vec<Programme>,
}

impl MergedGuide {
    /// Programmes of one channel, in arrival order.
    pub fn programmes_for<'a>(&'a self, guide_number: &'a GuideNumber) -> impl Iterator<Item = &'a Programme> + 'a {
        self.programmes.iter().filter(move |p| &p.guide_number == guide_number)
    }
}

/// A programme record on a tuned channel that does not match the schema.
#[derive(Debug)]
pub struct MalformedProgramme {
    pub guide_number: GuideNumber,
    /// Position in the segment's `Guide` array.
    pub index: usize,
    pub error: serde_path_to_error::Error<serde_json::Error>,
}

impl Display for MalformedProgramme {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "channel {} Guide[{}]: ", self.guide_number, self.index)?;
        if self.error.path().iter().next().is_some() {
            write!(f, "{}: ", self.error.path())?;
        }
        write!(f, "{}", self.error.inner())
    }
}

impl Error for MalformedProgramme {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.error.inner())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub accepted: usize,
    pub untuned: usize,
    pub duplicates: usize,
}

pub struct GuideMerger<'a> {
    lineup: HashMap<&'a GuideNumber, &'a LineupEntry>,
    known_channels: HashSet<GuideNumber>,
    seen: HashSet<ProgrammeKey>,
    guide: MergedGuide,
    stats: MergeStats,
}

impl<'a> GuideMerger<'a> {
    pub fn new(lineup: &'a [LineupEntry]) -> Self {
        let mut index = HashMap::with_capacity(lineup.len());
        for entry in lineup {
            // a device listing the same number twice: the first entry is the one used
            index.entry(&entry.guide_number).or_insert(entry);
        }
        GuideMerger {
            lineup: index,
            known_channels: HashSet::new(),
            seen: HashSet::new(),
            guide: MergedGuide::default(),
            stats: MergeStats::default(),
        }
    }

    /// Merge one window's worth of segments, in order.
    ///
    /// Stops at the first malformed record on a tuned channel. Whatever was merged before
    /// it stays merged.
    pub fn merge_window(&mut self, segments: Vec<GuideSegment>) -> Result<(), MalformedProgramme> {
        for segment in segments {
            self.merge_segment(segment)?;
        }
        Ok(())
    }

    fn merge_segment(&mut self, segment: GuideSegment) -> Result<(), MalformedProgramme> {
        let GuideSegment {
            guide_number,
            image_url,
            guide,
            ..
        } = segment;

        let Some(entry) = self.lineup.get(&guide_number).copied() else {
            debug!("Skipping {} programme(s) for untuned channel {}", guide.len(), guide_number);
            self.stats.untuned += guide.len();
            return Ok(());
        };

        for (index, raw) in guide.into_iter().enumerate() {
            let programme = raw.decode().map_err(|error| MalformedProgramme {
                guide_number: guide_number.clone(),
                index,
                error,
            })?;
            let key = programme_key(&guide_number, &programme);
            if self.seen.contains(&key) {
                debug!(
                    "Skipping duplicate programme {} starting at {}",
                    programme.title, programme.start_time
                );
                self.stats.duplicates += 1;
                continue;
            }

            if !self.known_channels.contains(&guide_number) {
                self.known_channels.insert(guide_number.clone());
                self.guide.channels.push(Channel {
                    guide_number: guide_number.clone(),
                    guide_name: entry.guide_name.clone(),
                    url: entry.url.clone(),
                    image_url: image_url.clone().unwrap_or_default(),
                });
            }

            debug!(
                "Appending: {} from {} to {}",
                programme.title,
                programme.start_time,
                programme
                    .end_time
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
            self.seen.insert(key);
            self.guide.programmes.push(Programme {
                guide_number: guide_number.clone(),
                details: programme,
            });
            self.stats.accepted += 1;
        }
        Ok(())
    }

    pub fn stats(&self) -> MergeStats {
        self.stats
    }

    pub fn finish(self) -> MergedGuide {
        self.guide
    }
}

/// Merge a complete, ordered sequence of well-formed windows.
#[cfg(test)]
pub(crate) fn merge_windows<I>(lineup: &[LineupEntry], windows: I) -> MergedGuide
where
    I: IntoIterator<Item = Vec<GuideSegment>>,
{
    let mut merger = GuideMerger::new(lineup);
    for window in windows {
        merger.merge_window(window).expect("well-formed window");
    }
    merger.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::hdhomerun::RawProgramme;
    use std::collections::BTreeMap;

    fn lineup_entry(number: &str, name: &str) -> LineupEntry {
        LineupEntry {
            guide_number: GuideNumber::from(number),
            guide_name: Some(name.to_string()),
            url: None,
            extra: BTreeMap::new(),
        }
    }

    fn programme(title: &str, start: i64, end: i64) -> GuideProgramme {
        GuideProgramme {
            start_time: start,
            end_time: Some(end),
            title: title.to_string(),
            episode_number: None,
            episode_title: None,
            synopsis: None,
            original_airdate: None,
            image_url: None,
            filter: None,
            first: None,
            series_id: None,
        }
    }

    fn segment(number: &str, icon: Option<&str>, guide: Vec<GuideProgramme>) -> GuideSegment {
        GuideSegment {
            guide_number: GuideNumber::from(number),
            guide_name: None,
            affiliate: None,
            image_url: icon.map(str::to_string),
            guide: guide
                .into_iter()
                .map(|p| RawProgramme(serde_json::to_value(p).unwrap()))
                .collect(),
        }
    }

    fn raw_segment(number: &str, records: serde_json::Value) -> GuideSegment {
        serde_json::from_value(serde_json::json!({ "GuideNumber": number, "Guide": records })).unwrap()
    }

    fn load_fixture_window() -> Vec<GuideSegment> {
        let json = std::fs::read_to_string("tests/data/guide-window.json").expect("fixture present");
        serde_json::from_str(&json).expect("parse guide window")
    }

    fn load_fixture_lineup() -> Vec<LineupEntry> {
        let json = std::fs::read_to_string("tests/data/lineup.json").expect("fixture present");
        serde_json::from_str(&json).expect("parse lineup")
    }

    #[test]
    fn overlapping_windows_yield_one_copy() {
        let lineup = vec![lineup_entry("1", "Channel 1")];
        let first = vec![segment(
            "1",
            None,
            vec![programme("A", 100, 200), programme("B", 200, 300)],
        )];
        let second = vec![segment(
            "1",
            None,
            vec![programme("B", 200, 300), programme("C", 300, 400)],
        )];

        let mut merger = GuideMerger::new(&lineup);
        merger.merge_window(first).unwrap();
        merger.merge_window(second).unwrap();
        assert_eq!(merger.stats().duplicates, 1);

        let guide = merger.finish();
        let titles: Vec<_> = guide.programmes.iter().map(|p| p.details.title.as_str()).collect();
        assert_eq!(titles, ["A", "B", "C"]);

        let keys: HashSet<_> = guide
            .programmes
            .iter()
            .map(|p| programme_key(&p.guide_number, &p.details))
            .collect();
        assert_eq!(keys.len(), guide.programmes.len());
    }

    #[test]
    fn first_seen_copy_wins() {
        let lineup = vec![lineup_entry("1", "Channel 1")];
        let mut early = programme("A", 100, 200);
        early.synopsis = Some("first".into());
        let mut late = programme("A", 100, 250);
        late.synopsis = Some("second".into());

        let guide = merge_windows(&lineup, [vec![segment("1", None, vec![early])], vec![segment("1", None, vec![late])]]);
        assert_eq!(guide.programmes.len(), 1);
        assert_eq!(guide.programmes[0].details.synopsis.as_deref(), Some("first"));
        assert_eq!(guide.programmes[0].details.end_time, Some(200));
    }

    #[test]
    fn same_start_different_title_is_kept() {
        let lineup = vec![lineup_entry("1", "Channel 1")];
        let guide = merge_windows(
            &lineup,
            [vec![segment("1", None, vec![programme("A", 100, 200), programme("A2", 100, 200)])]],
        );
        assert_eq!(guide.programmes.len(), 2);
    }

    #[test]
    fn untuned_channels_contribute_nothing() {
        let lineup = vec![lineup_entry("1", "Channel 1")];
        let mut merger = GuideMerger::new(&lineup);
        merger
            .merge_window(vec![segment("2", Some("http://icon"), vec![programme("X", 1, 2)])])
            .unwrap();
        assert_eq!(merger.stats().untuned, 1);

        let guide = merger.finish();
        assert!(guide.channels.is_empty());
        assert!(guide.programmes.is_empty());
    }

    #[test]
    fn channel_copied_from_lineup_with_segment_icon() {
        let lineup = load_fixture_lineup();
        let guide = merge_windows(&lineup, [load_fixture_window()]);

        // 7.1 is tuned but has no guide data; 999 has guide data but is not tuned
        let numbers: Vec<_> = guide.channels.iter().map(|c| c.guide_number.as_str()).collect();
        assert_eq!(numbers, ["3.1", "501"]);
        assert_eq!(guide.channels[0].guide_name.as_deref(), Some("KTVU-HD"));
        assert_eq!(guide.channels[0].image_url, "https://img.hdhomerun.com/channels/ktvu.png");
        assert_eq!(guide.channels[1].image_url, "");
        assert_eq!(guide.channels[1].url.as_deref(), Some("http://192.168.1.50:5004/auto/v501"));

        for p in &guide.programmes {
            assert!(guide.channels.iter().any(|c| c.guide_number == p.guide_number));
        }
    }

    #[test]
    fn later_segment_icon_does_not_replace_first() {
        let lineup = vec![lineup_entry("1", "Channel 1")];
        let guide = merge_windows(
            &lineup,
            [
                vec![segment("1", Some("http://first"), vec![programme("A", 1, 2)])],
                vec![segment("1", Some("http://second"), vec![programme("B", 2, 3)])],
            ],
        );
        assert_eq!(guide.channels.len(), 1);
        assert_eq!(guide.channels[0].image_url, "http://first");
    }

    #[test]
    fn merging_is_deterministic() {
        let lineup = load_fixture_lineup();
        let windows = || vec![load_fixture_window(), load_fixture_window()];
        let a = merge_windows(&lineup, windows());
        let b = merge_windows(&lineup, windows());
        assert_eq!(a, b);
        assert_eq!(a.programmes.len(), 3);
    }

    #[test]
    fn programmes_for_filters_by_channel_in_arrival_order() {
        let lineup = vec![lineup_entry("1", "One"), lineup_entry("2", "Two")];
        let guide = merge_windows(
            &lineup,
            [vec![
                segment("1", None, vec![programme("A", 1, 2)]),
                segment("2", None, vec![programme("X", 1, 2)]),
                segment("1", None, vec![programme("B", 2, 3)]),
            ]],
        );
        let number = GuideNumber::from("1");
        let titles: Vec<_> = guide.programmes_for(&number).map(|p| p.details.title.as_str()).collect();
        assert_eq!(titles, ["A", "B"]);
    }

    #[test]
    fn broken_record_on_untuned_channel_is_ignored() {
        let lineup = vec![lineup_entry("1", "Channel 1")];
        let mut merger = GuideMerger::new(&lineup);
        merger
            .merge_window(vec![
                segment("1", None, vec![programme("A", 100, 200)]),
                raw_segment("999", serde_json::json!([{ "StartTime": 1700000000 }])),
                segment("1", None, vec![programme("B", 200, 300)]),
            ])
            .unwrap();
        assert_eq!(merger.stats().untuned, 1);

        let titles: Vec<_> = merger.finish().programmes.iter().map(|p| p.details.title.clone()).collect();
        assert_eq!(titles, ["A", "B"]);
    }

    #[test]
    fn broken_record_on_tuned_channel_stops_the_window() {
        let lineup = vec![lineup_entry("1", "Channel 1")];
        let mut merger = GuideMerger::new(&lineup);
        let err = merger
            .merge_window(vec![
                segment("1", None, vec![programme("A", 100, 200)]),
                raw_segment(
                    "1",
                    serde_json::json!([{ "StartTime": 200, "Title": "B" }, { "StartTime": 300 }]),
                ),
                segment("1", None, vec![programme("C", 400, 500)]),
            ])
            .unwrap_err();
        assert_eq!((err.guide_number.as_str(), err.index), ("1", 1));
        assert!(err.to_string().starts_with("channel 1 Guide[1]: "), "{err}");
        assert!(err.to_string().contains("Title"), "{err}");

        let titles: Vec<_> = merger.finish().programmes.iter().map(|p| p.details.title.clone()).collect();
        assert_eq!(titles, ["A", "B"]);
    }
}
