use crate::client::{HdHomeRunClient, HdHomeRunClientError};
use crate::models::hdhomerun::{DeviceAuth, GuideSegment};
use crate::services::merge::GuideMerger;
use chrono::{DateTime, Duration, Utc};
use core::fmt;
use log::{debug, error, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Anything that can return one guide window. Implemented by the real client and by test fakes.
pub trait GuideSource {
    fn fetch_window(&self, auth: &DeviceAuth, start: i64) -> Result<Vec<GuideSegment>, HdHomeRunClientError>;
}

impl GuideSource for HdHomeRunClient {
    fn fetch_window(&self, auth: &DeviceAuth, start: i64) -> Result<Vec<GuideSegment>, HdHomeRunClientError> {
        self.get_guide(auth, start)
    }
}

/// A guide API failure that is neither a rate limit nor a malformed body.
#[derive(Debug)]
pub struct GuideFetchError {
    pub window_start: DateTime<Utc>,
    pub source: HdHomeRunClientError,
}

impl Display for GuideFetchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "guide fetch for window starting {} failed: {}",
            self.window_start.format("%Y-%m-%d %H:%M:%S"),
            self.source
        )
    }
}

impl Error for GuideFetchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

/// Why the window loop stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchEnd {
    /// The cursor reached now + days.
    Horizon,
    /// The API answered 400 for the window starting at `at`.
    RateLimited { at: DateTime<Utc> },
    /// The window starting at `at` could not be read or decoded, or carried a malformed
    /// programme for a tuned channel.
    Malformed { at: DateTime<Utc>, message: String },
}

impl FetchEnd {
    pub fn is_partial(&self) -> bool {
        !matches!(self, FetchEnd::Horizon)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchSummary {
    /// Windows fetched and merged successfully.
    pub windows: usize,
    pub end: FetchEnd,
}

/// Request window parameters. `hours` must be at least 1 or the cursor never moves.
#[derive(Debug, Clone, Copy)]
pub struct WindowPlan {
    pub start: DateTime<Utc>,
    pub days: u32,
    pub hours: u32,
}

impl WindowPlan {
    pub fn starting_now(days: u32, hours: u32) -> Self {
        WindowPlan {
            start: Utc::now(),
            days,
            hours,
        }
    }

    pub fn horizon(&self) -> DateTime<Utc> {
        self.start + Duration::days(i64::from(self.days))
    }

    /// Every window start, in request order.
    pub fn cursors(&self) -> impl Iterator<Item = DateTime<Utc>> {
        let step = Duration::hours(i64::from(self.hours.max(1)));
        let horizon = self.horizon();
        std::iter::successors(Some(self.start), move |c| Some(*c + step)).take_while(move |c| *c < horizon)
    }
}

/// Walk the window cursor from `plan.start` towards the horizon, merging every window as it
/// arrives.
///
/// A rate limit, an unreadable or undecodable body, or a malformed programme on a tuned
/// channel stops the loop and keeps what `merger` already holds. Any other failure is
/// returned as an error.
pub fn fetch_guide<S: GuideSource>(
    source: &S,
    auth: &DeviceAuth,
    plan: WindowPlan,
    merger: &mut GuideMerger<'_>,
) -> Result<FetchSummary, GuideFetchError> {
    let mut windows = 0usize;

    for cursor in plan.cursors() {
        let start = cursor.timestamp();
        debug!("Fetching guide for all channels starting {} (Start={})", cursor, start);

        match source.fetch_window(auth, start) {
            Ok(segments) => {
                info!("Processing from {}", cursor.format("%Y-%m-%d %H:%M:%S"));
                if let Err(e) = merger.merge_window(segments) {
                    error!("Malformed programme in window starting {}: {}", cursor, e);
                    return Ok(FetchSummary {
                        windows,
                        end: FetchEnd::Malformed {
                            at: cursor,
                            message: e.to_string(),
                        },
                    });
                }
                windows += 1;
            }
            Err(e) if e.is_rate_limit() => {
                warn!(
                    "HTTP 400 at {} - API limit reached, stopping guide fetch with available data",
                    cursor.format("%Y-%m-%d %H:%M:%S")
                );
                return Ok(FetchSummary {
                    windows,
                    end: FetchEnd::RateLimited { at: cursor },
                });
            }
            Err(e @ (HdHomeRunClientError::Json { .. } | HdHomeRunClientError::Body(_))) => {
                error!("Error fetching guide for start time {}: {}", cursor, e);
                return Ok(FetchSummary {
                    windows,
                    end: FetchEnd::Malformed {
                        at: cursor,
                        message: e.to_string(),
                    },
                });
            }
            Err(e) => {
                error!("Guide request failed at {}: {}", cursor.format("%Y-%m-%d %H:%M:%S"), e);
                return Err(GuideFetchError {
                    window_start: cursor,
                    source: e,
                });
            }
        }
    }

    Ok(FetchSummary {
        windows,
        end: FetchEnd::Horizon,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::hdhomerun::{GuideNumber, GuideProgramme, LineupEntry, RawProgramme};
    use chrono::TimeZone;
    use std::cell::RefCell;
    use std::collections::{BTreeMap, VecDeque};

    /// Replays canned responses and records the requested start times.
    struct Scripted {
        responses: RefCell<VecDeque<Result<Vec<GuideSegment>, HdHomeRunClientError>>>,
        requested: RefCell<Vec<i64>>,
    }

    impl Scripted {
        fn new(responses: Vec<Result<Vec<GuideSegment>, HdHomeRunClientError>>) -> Self {
            Scripted {
                responses: RefCell::new(responses.into()),
                requested: RefCell::new(Vec::new()),
            }
        }
    }

    impl GuideSource for Scripted {
        fn fetch_window(&self, _auth: &DeviceAuth, start: i64) -> Result<Vec<GuideSegment>, HdHomeRunClientError> {
            self.requested.borrow_mut().push(start);
            self.responses.borrow_mut().pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn status(code: u16) -> HdHomeRunClientError {
        HdHomeRunClientError::Http {
            status: code,
            url: "https://api.hdhomerun.com/api/guide.php".into(),
        }
    }

    fn lineup() -> Vec<LineupEntry> {
        vec![LineupEntry {
            guide_number: GuideNumber::from("1"),
            guide_name: Some("Channel 1".into()),
            url: None,
            extra: BTreeMap::new(),
        }]
    }

    fn window() -> Vec<GuideSegment> {
        vec![GuideSegment {
            guide_number: GuideNumber::from("1"),
            guide_name: None,
            affiliate: None,
            image_url: None,
            guide: vec![raw(GuideProgramme {
                start_time: 1234567890,
                end_time: Some(1234567900),
                title: "Test Program".into(),
                episode_number: None,
                episode_title: None,
                synopsis: Some("Test synopsis".into()),
                original_airdate: None,
                image_url: None,
                filter: None,
                first: None,
                series_id: None,
            })],
        }]
    }

    fn raw(p: GuideProgramme) -> RawProgramme {
        RawProgramme(serde_json::to_value(p).unwrap())
    }

    fn segments(json: serde_json::Value) -> Vec<GuideSegment> {
        serde_json::from_value(json).unwrap()
    }

    fn plan(days: u32, hours: u32) -> WindowPlan {
        WindowPlan {
            start: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            days,
            hours,
        }
    }

    fn auth() -> DeviceAuth {
        DeviceAuth("test_auth_token".into())
    }

    #[test]
    fn cursor_advances_by_increment_until_horizon() {
        let p = plan(1, 5);
        let starts: Vec<_> = p.cursors().map(|c| c.timestamp()).collect();
        let base = p.start.timestamp();
        assert_eq!(starts, [base, base + 5 * 3600, base + 10 * 3600, base + 15 * 3600, base + 20 * 3600]);
    }

    #[test]
    fn requests_every_window_when_no_errors() {
        let lineup = lineup();
        let source = Scripted::new(vec![Ok(window()), Ok(window())]);
        let mut merger = GuideMerger::new(&lineup);

        let summary = fetch_guide(&source, &auth(), plan(1, 3), &mut merger).unwrap();
        assert_eq!(summary.windows, 8);
        assert_eq!(summary.end, FetchEnd::Horizon);
        assert_eq!(source.requested.borrow().len(), 8);
        assert_eq!(merger.finish().programmes.len(), 1);
    }

    #[test]
    fn bad_request_keeps_partial_result() {
        let lineup = lineup();
        let source = Scripted::new(vec![Ok(window()), Err(status(400))]);
        let mut merger = GuideMerger::new(&lineup);

        let summary = fetch_guide(&source, &auth(), plan(7, 3), &mut merger).unwrap();
        assert_eq!(summary.windows, 1);
        assert!(summary.end.is_partial());
        assert!(matches!(summary.end, FetchEnd::RateLimited { .. }));
        assert_eq!(source.requested.borrow().len(), 2);

        let guide = merger.finish();
        assert_eq!(guide.channels.len(), 1);
        assert_eq!(guide.programmes.len(), 1);
        assert_eq!(guide.programmes[0].details.title, "Test Program");
    }

    #[test]
    fn other_http_errors_abort() {
        let lineup = lineup();
        let source = Scripted::new(vec![Err(status(403))]);
        let mut merger = GuideMerger::new(&lineup);

        let err = fetch_guide(&source, &auth(), plan(7, 3), &mut merger).unwrap_err();
        assert!(matches!(err.source, HdHomeRunClientError::Http { status: 403, .. }));
        assert_eq!(source.requested.borrow().len(), 1);
    }

    #[test]
    fn malformed_window_stops_early_without_error() {
        let lineup = lineup();
        let de = &mut serde_json::Deserializer::from_str(r#"[{"Guide":[]}]"#);
        let bad = serde_path_to_error::deserialize::<_, Vec<GuideSegment>>(de).unwrap_err();
        let source = Scripted::new(vec![
            Ok(window()),
            Err(HdHomeRunClientError::Json {
                url: "guide".into(),
                error: bad,
            }),
        ]);
        let mut merger = GuideMerger::new(&lineup);

        let summary = fetch_guide(&source, &auth(), plan(7, 3), &mut merger).unwrap();
        assert!(matches!(summary.end, FetchEnd::Malformed { .. }));
        assert_eq!(merger.finish().programmes.len(), 1);
    }

    #[test]
    fn zero_days_requests_nothing() {
        let lineup = lineup();
        let source = Scripted::new(vec![]);
        let mut merger = GuideMerger::new(&lineup);

        let summary = fetch_guide(&source, &auth(), plan(0, 3), &mut merger).unwrap();
        assert_eq!(summary.windows, 0);
        assert!(source.requested.borrow().is_empty());
    }

    #[test]
    fn unreadable_body_stops_early_without_error() {
        let lineup = lineup();
        let source = Scripted::new(vec![
            Ok(window()),
            Err(HdHomeRunClientError::Body("body too large".into())),
        ]);
        let mut merger = GuideMerger::new(&lineup);

        let summary = fetch_guide(&source, &auth(), plan(7, 3), &mut merger).unwrap();
        assert_eq!(summary.windows, 1);
        assert!(matches!(summary.end, FetchEnd::Malformed { .. }));
        assert_eq!(source.requested.borrow().len(), 2);
    }

    #[test]
    fn broken_untuned_record_does_not_end_the_fetch() {
        let lineup = lineup();
        let mixed = segments(serde_json::json!([
            { "GuideNumber": "1", "Guide": [{ "StartTime": 1700000000, "EndTime": 1700001800, "Title": "Kept" }] },
            { "GuideNumber": "999", "Guide": [{ "StartTime": 1700000000 }] }
        ]));
        let source = Scripted::new(vec![Ok(mixed), Ok(window())]);
        let mut merger = GuideMerger::new(&lineup);

        let summary = fetch_guide(&source, &auth(), plan(1, 12), &mut merger).unwrap();
        assert_eq!(summary.end, FetchEnd::Horizon);
        assert_eq!(summary.windows, 2);
        let titles: Vec<_> = merger.finish().programmes.iter().map(|p| p.details.title.clone()).collect();
        assert_eq!(titles, ["Kept", "Test Program"]);
    }

    #[test]
    fn broken_tuned_record_ends_the_fetch_keeping_earlier_windows() {
        let lineup = lineup();
        let broken = segments(serde_json::json!([
            { "GuideNumber": "1", "Guide": [{ "StartTime": 1700000000 }] }
        ]));
        let source = Scripted::new(vec![Ok(window()), Ok(broken), Ok(window())]);
        let mut merger = GuideMerger::new(&lineup);

        let summary = fetch_guide(&source, &auth(), plan(7, 3), &mut merger).unwrap();
        assert_eq!(summary.windows, 1);
        match &summary.end {
            FetchEnd::Malformed { message, .. } => assert!(message.contains("Title"), "{message}"),
            other => panic!("unexpected end {other:?}"),
        }
        assert_eq!(source.requested.borrow().len(), 2);
        assert_eq!(merger.finish().programmes.len(), 1);
    }
}
