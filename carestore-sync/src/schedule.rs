//! Task schedules and occurrence computation
//!
//! A schedule is a set of repeating elements. Each element produces events by
//! stepping its interval forward from its start date; the schedule orders the
//! events of all elements by start date and numbers them from zero. That
//! number (the occurrence index) is what an outcome is attached to, so it must
//! never change for a given schedule.

use crate::entity::OutcomeValue;
use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, Duration, Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Highest occurrence index a schedule will compute.
///
/// Events are found by stepping through the schedule, so the cost of
/// `Schedule::event` grows with the index. A daily schedule reaches this
/// limit after roughly 270 years.
pub const MAX_OCCURRENCE: u32 = 100_000;

/// Calendar step between two events of an element
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleInterval {
    #[serde(default)]
    pub months: i32,
    #[serde(default)]
    pub days: i64,
    #[serde(default)]
    pub seconds: i64,
}

impl ScheduleInterval {
    pub fn days(days: i64) -> Self {
        Self { days, ..Self::default() }
    }

    pub fn weeks(weeks: i64) -> Self {
        Self::days(weeks.saturating_mul(7))
    }

    pub fn hours(hours: i64) -> Self {
        Self { seconds: hours.saturating_mul(3600), ..Self::default() }
    }

    pub fn months(months: i32) -> Self {
        Self { months, ..Self::default() }
    }

    /// Apply the interval to `date`. `None` when the result is out of range.
    pub fn advance(&self, date: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let shifted = if self.months >= 0 {
            date.checked_add_months(Months::new(u32::try_from(self.months).ok()?))?
        } else {
            date.checked_sub_months(Months::new(self.months.unsigned_abs()))?
        };

        shifted
            .checked_add_signed(Duration::try_days(self.days)?)?
            .checked_add_signed(Duration::try_seconds(self.seconds)?)
    }

    pub fn moves_forward_from(&self, date: DateTime<Utc>) -> bool {
        self.advance(date).map_or(false, |next| next > date)
    }
}

/// How long an event lasts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventDuration {
    /// Fills the whole (UTC) day the event starts on
    AllDay,
    Seconds(i64),
}

impl EventDuration {
    pub fn hours(hours: i64) -> Self {
        EventDuration::Seconds(hours.saturating_mul(3600))
    }

    pub fn minutes(minutes: i64) -> Self {
        EventDuration::Seconds(minutes.saturating_mul(60))
    }
}

impl Default for EventDuration {
    fn default() -> Self {
        EventDuration::hours(1)
    }
}

/// One computed occurrence of a schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEvent {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub occurrence: u32,
    /// Index of the element that produced the event
    pub element: usize,
}

/// A repeating block of events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleElement {
    pub start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    pub interval: ScheduleInterval,
    #[serde(default)]
    pub duration: EventDuration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_values: Vec<OutcomeValue>,
}

impl ScheduleElement {
    /// Build an element, rejecting intervals that do not move forward in time.
    pub fn new(
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        interval: ScheduleInterval,
        duration: EventDuration,
    ) -> StoreResult<Self> {
        let start = match duration {
            EventDuration::AllDay => start_of_day(start),
            EventDuration::Seconds(_) => start,
        };

        let element = Self {
            start,
            end,
            interval,
            duration,
            text: None,
            target_values: Vec::new(),
        };
        element.validate()?;
        Ok(element)
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_target_values(mut self, values: Vec<OutcomeValue>) -> Self {
        self.target_values = values;
        self
    }

    pub fn validate(&self) -> StoreResult<()> {
        if !self.interval.moves_forward_from(self.start) {
            return Err(StoreError::InvalidValue(format!(
                "schedule interval {:?} does not move forward in time",
                self.interval
            )));
        }
        if let EventDuration::Seconds(seconds) = self.duration {
            if seconds < 0 {
                return Err(StoreError::InvalidValue(format!(
                    "event duration must not be negative, got {} seconds",
                    seconds
                )));
            }
        }
        Ok(())
    }

    /// Events of this element, in order, for as long as `keep_going` accepts them
    /// and the element has not ended.
    fn events_while(
        &self,
        element: usize,
        mut keep_going: impl FnMut(&ScheduleEvent) -> bool,
    ) -> Vec<ScheduleEvent> {
        let mut events = Vec::new();
        let mut next = self.compute_event(self.start, 0, element);

        while let Some(event) = next {
            if !keep_going(&event) {
                break;
            }

            next = match (self.interval.advance(event.start), event.occurrence.checked_add(1)) {
                (Some(start), Some(occurrence)) if start > event.start => {
                    self.compute_event(start, occurrence, element)
                }
                _ => None,
            };
            events.push(event);
        }

        events
    }

    fn compute_event(
        &self,
        on: DateTime<Utc>,
        occurrence: u32,
        element: usize,
    ) -> Option<ScheduleEvent> {
        let (start, end) = match self.duration {
            EventDuration::AllDay => {
                let start = start_of_day(on);
                let end = start.checked_add_signed(Duration::try_seconds(86_399)?)?;
                (start, end)
            }
            EventDuration::Seconds(seconds) => {
                (on, on.checked_add_signed(Duration::try_seconds(seconds)?)?)
            }
        };

        // No events past the end of the element
        if let Some(limit) = self.end {
            if !self.is_event_start(start, limit) {
                return None;
            }
        }

        Some(ScheduleEvent { start, end, occurrence, element })
    }

    fn is_event_start(&self, event_start: DateTime<Utc>, limit: DateTime<Utc>) -> bool {
        let before_limit = event_start < limit;

        match self.duration {
            EventDuration::Seconds(_) => before_limit,
            // All-day events count if they fall on the same day as the (exclusive) limit
            EventDuration::AllDay => {
                let adjusted = limit.checked_sub_signed(Duration::seconds(1)).unwrap_or(limit);
                before_limit || event_start.date_naive() == adjusted.date_naive()
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub elements: Vec<ScheduleElement>,
}

impl Schedule {
    pub fn new(mut elements: Vec<ScheduleElement>) -> StoreResult<Self> {
        elements.sort_by_key(|element| element.start);
        let schedule = Self { elements };
        schedule.validate()?;
        Ok(schedule)
    }

    /// Repeats every day from `start`, forever.
    pub fn daily(start: DateTime<Utc>, duration: EventDuration) -> StoreResult<Self> {
        Self::new(vec![ScheduleElement::new(
            start,
            None,
            ScheduleInterval::days(1),
            duration,
        )?])
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.elements.is_empty() {
            return Err(StoreError::InvalidValue(
                "a schedule needs at least one element".to_string(),
            ));
        }
        self.elements.iter().try_for_each(ScheduleElement::validate)
    }

    pub fn start_date(&self) -> Option<DateTime<Utc>> {
        self.elements.iter().map(|element| element.start).min()
    }

    /// Latest element end, or `None` if any element repeats forever.
    pub fn end_date(&self) -> Option<DateTime<Utc>> {
        let ends: Option<Vec<_>> = self.elements.iter().map(|element| element.end).collect();
        ends.and_then(|ends| ends.into_iter().max())
    }

    /// The event with the given occurrence index, or `None` if the schedule
    /// ends before reaching it or the index is above [`MAX_OCCURRENCE`].
    pub fn event(&self, occurrence: u32) -> Option<ScheduleEvent> {
        if occurrence > MAX_OCCURRENCE {
            return None;
        }
        let count = occurrence.checked_add(1)?;

        // Each element's first `count` events are enough to find the
        // `occurrence`-th event of the whole schedule.
        let events = self
            .elements
            .iter()
            .enumerate()
            .flat_map(|(index, element)| {
                element.events_while(index, |event| event.occurrence < count)
            })
            .collect();

        let position = usize::try_from(occurrence).ok()?;
        renumber(events).into_iter().nth(position)
    }

    /// Events overlapping `[start, end)`, numbered from the start of the schedule.
    pub fn events_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<ScheduleEvent> {
        if start >= end {
            return Vec::new();
        }

        let events = self
            .elements
            .iter()
            .enumerate()
            .flat_map(|(index, element)| {
                element.events_while(index, |event| element.is_event_start(event.start, end))
            })
            .collect();

        renumber(events)
            .into_iter()
            .filter(|event| event.end >= start)
            .collect()
    }
}

/// Stable sort by start date and assign occurrence indices in that order.
fn renumber(mut events: Vec<ScheduleEvent>) -> Vec<ScheduleEvent> {
    events.sort_by_key(|event| event.start);
    for (occurrence, event) in (0u32..).zip(events.iter_mut()) {
        event.occurrence = occurrence;
    }
    events
}

fn start_of_day(date: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.date_naive().and_time(chrono::NaiveTime::MIN))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_zero_interval_is_invalid() {
        let result = ScheduleElement::new(
            at(1, 9),
            None,
            ScheduleInterval::default(),
            EventDuration::hours(1),
        );
        assert!(matches!(result, Err(StoreError::InvalidValue(_))));
    }

    #[test]
    fn test_backwards_interval_is_invalid() {
        let result = ScheduleElement::new(
            at(1, 9),
            None,
            ScheduleInterval::days(-1),
            EventDuration::hours(1),
        );
        assert!(matches!(result, Err(StoreError::InvalidValue(_))));
    }

    #[test]
    fn test_daily_occurrences() {
        let schedule = Schedule::daily(at(1, 9), EventDuration::hours(1)).unwrap();

        let first = schedule.event(0).unwrap();
        assert_eq!(first.start, at(1, 9));
        assert_eq!(first.end, at(1, 10));

        let fifth = schedule.event(4).unwrap();
        assert_eq!(fifth.start, at(5, 9));
        assert_eq!(fifth.occurrence, 4);
    }

    #[test]
    fn test_occurrence_above_limit_is_none() {
        let schedule = Schedule::daily(at(1, 9), EventDuration::hours(1)).unwrap();

        assert!(schedule.event(MAX_OCCURRENCE).is_some());
        assert!(schedule.event(MAX_OCCURRENCE + 1).is_none());
        assert!(schedule.event(u32::MAX).is_none());
    }

    #[test]
    fn test_event_past_end_is_none() {
        let element = ScheduleElement::new(
            at(1, 9),
            Some(at(3, 9)),
            ScheduleInterval::days(1),
            EventDuration::hours(1),
        )
        .unwrap();
        let schedule = Schedule::new(vec![element]).unwrap();

        assert!(schedule.event(1).is_some());
        // The third event would start exactly at the exclusive end
        assert!(schedule.event(2).is_none());
    }

    #[test]
    fn test_all_day_includes_end_day() {
        let element = ScheduleElement::new(
            at(1, 15),
            Some(at(3, 12)),
            ScheduleInterval::days(1),
            EventDuration::AllDay,
        )
        .unwrap();
        assert_eq!(element.start, at(1, 0));

        let schedule = Schedule::new(vec![element]).unwrap();
        let last = schedule.event(2).unwrap();
        assert_eq!(last.start, at(3, 0));
        assert_eq!(last.end, at(3, 23) + Duration::seconds(59 * 60 + 59));
        assert!(schedule.event(3).is_none());
    }

    #[test]
    fn test_interleaved_elements_are_renumbered() {
        let morning = ScheduleElement::new(
            at(1, 8),
            None,
            ScheduleInterval::days(1),
            EventDuration::hours(1),
        )
        .unwrap();
        let evening = ScheduleElement::new(
            at(1, 20),
            None,
            ScheduleInterval::days(1),
            EventDuration::hours(1),
        )
        .unwrap();
        let schedule = Schedule::new(vec![evening, morning]).unwrap();

        let starts: Vec<_> = (0..4).map(|i| schedule.event(i).unwrap().start).collect();
        assert_eq!(starts, vec![at(1, 8), at(1, 20), at(2, 8), at(2, 20)]);
    }

    #[test]
    fn test_events_between_keeps_global_numbering() {
        let schedule = Schedule::daily(at(1, 9), EventDuration::hours(1)).unwrap();
        let events = schedule.events_between(at(3, 0), at(5, 0));

        let occurrences: Vec<_> = events.iter().map(|event| event.occurrence).collect();
        assert_eq!(occurrences, vec![2, 3]);
    }

    #[test]
    fn test_monthly_interval() {
        let element = ScheduleElement::new(
            at(31, 9),
            None,
            ScheduleInterval::months(1),
            EventDuration::hours(1),
        )
        .unwrap();
        let schedule = Schedule::new(vec![element]).unwrap();
        let next = schedule.event(1).unwrap();
        assert_eq!(next.start, Utc.with_ymd_and_hms(2024, 4, 30, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_end_date() {
        let bounded = ScheduleElement::new(
            at(1, 9),
            Some(at(10, 9)),
            ScheduleInterval::days(1),
            EventDuration::hours(1),
        )
        .unwrap();
        let schedule = Schedule::new(vec![bounded.clone()]).unwrap();
        assert_eq!(schedule.end_date(), Some(at(10, 9)));

        let unbounded = Schedule::daily(at(1, 9), EventDuration::hours(1)).unwrap();
        let mixed = Schedule::new(vec![bounded, unbounded.elements[0].clone()]).unwrap();
        assert_eq!(mixed.end_date(), None);
    }
}
