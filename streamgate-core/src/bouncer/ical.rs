//! Calendar-gated bouncer.
//!
//! Lets clients in only while at least one event of an iCalendar file
//! is active. The granted keycard duration runs to the end of the
//! union of overlapping active events, clamped to a maximum.

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
#[allow(unused_imports)]
use icalendar::{
    Calendar, CalendarComponent, CalendarDateTime, Component, DatePerhapsTime, EventLike,
};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::{AuthOutcome, Bouncer, KeycardRegistry};
use crate::keycard::Keycard;
use crate::{Error, Result};

/// Ceiling on granted keycard durations.
const DEFAULT_MAX_KEYCARD_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy)]
struct EventWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

pub struct IcalBouncer {
    name: String,
    events: Vec<EventWindow>,
    max_keycard_duration: Duration,
    registry: KeycardRegistry,
}

fn to_utc(value: DatePerhapsTime) -> Result<DateTime<Utc>> {
    match value {
        DatePerhapsTime::Date(date) => {
            let naive = date
                .and_hms_opt(0, 0, 0)
                .ok_or_else(|| Error::Config("invalid calendar date".to_string()))?;
            floating_to_utc(naive)
        }
        DatePerhapsTime::DateTime(dt) => match dt {
            CalendarDateTime::Utc(dt) => Ok(dt),
            // No TZID: floating time, interpreted in the local zone.
            CalendarDateTime::Floating(naive) => floating_to_utc(naive),
            CalendarDateTime::WithTimezone { date_time, tzid } => {
                let tz: chrono_tz::Tz = tzid
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid TZID '{tzid}'")))?;
                tz.from_local_datetime(&date_time)
                    .earliest()
                    .map(|dt| dt.with_timezone(&Utc))
                    .ok_or_else(|| {
                        Error::Config(format!("nonexistent local time in zone {tzid}"))
                    })
            }
        },
    }
}

fn floating_to_utc(naive: NaiveDateTime) -> Result<DateTime<Utc>> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| Error::Config("nonexistent local time".to_string()))
}

impl IcalBouncer {
    pub fn from_file(
        name: &str,
        path: &Path,
        max_keycard_duration: Option<Duration>,
    ) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_ics(name, &contents, max_keycard_duration)
    }

    /// Parse the calendar; any parse failure or invalid TZID is fatal.
    pub fn from_ics(
        name: &str,
        ics: &str,
        max_keycard_duration: Option<Duration>,
    ) -> Result<Self> {
        let calendar: Calendar = ics
            .parse()
            .map_err(|e| Error::Config(format!("bad calendar: {e}")))?;

        let mut events = Vec::new();
        for component in &calendar.components {
            let CalendarComponent::Event(event) = component else {
                continue;
            };
            let (Some(start), Some(end)) = (event.get_start(), event.get_end()) else {
                debug!("event without dtstart or dtend, ignoring");
                continue;
            };
            let window = EventWindow {
                start: to_utc(start)?,
                end: to_utc(end)?,
            };
            debug!(start = %window.start, end = %window.end, "calendar event parsed");
            events.push(window);
        }
        events.sort_by_key(|w| w.start);

        Ok(Self {
            name: name.to_string(),
            events,
            max_keycard_duration: max_keycard_duration.unwrap_or(DEFAULT_MAX_KEYCARD_DURATION),
            registry: KeycardRegistry::new(),
        })
    }

    /// End of the union of events overlapping `now`, or None when no
    /// event is active.
    fn active_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut end = self
            .events
            .iter()
            .filter(|w| w.start <= now && w.end > now)
            .map(|w| w.end)
            .max()?;
        // Chain through events that begin before the running end.
        loop {
            let extended = self
                .events
                .iter()
                .filter(|w| w.start <= end && w.end > end)
                .map(|w| w.end)
                .max();
            match extended {
                Some(later) => end = later,
                None => break,
            }
        }
        Some(end)
    }

    fn decide(&self, keycard: Keycard, now: DateTime<Utc>) -> AuthOutcome {
        let Some(until) = self.active_until(now) else {
            info!("refused, outside scheduled hours");
            return AuthOutcome::Refused;
        };
        let granted = (until - now)
            .to_std()
            .unwrap_or_default()
            .min(self.max_keycard_duration);
        let mut keycard = keycard.authenticated();
        keycard.duration = granted.as_secs();
        self.registry.add(&mut keycard);
        info!(duration_s = keycard.duration, "authenticated login");
        AuthOutcome::Accepted(keycard)
    }
}

#[async_trait]
impl Bouncer for IcalBouncer {
    fn name(&self) -> &str {
        &self.name
    }

    fn registry(&self) -> &KeycardRegistry {
        &self.registry
    }

    async fn authenticate(&self, keycard: Keycard) -> AuthOutcome {
        self.decide(keycard, Utc::now())
    }
}
