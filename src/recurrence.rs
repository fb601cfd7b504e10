//! Recurring-slot expansion: a pure function from (template, date range,
//! weekday filter) to a lazy, finite sequence of slot specifications. No
//! store access here; the caller probes for duplicates and batch-persists.

use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use ulid::Ulid;

use crate::model::{RecurrenceFrequency, RecurrenceMeta, SlotType};

/// The time/capacity/type shape replicated across a date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTemplate {
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub capacity: u32,
    pub slot_type: SlotType,
}

/// One day's slot-creation request produced by `expand`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSpec {
    pub provider_id: Ulid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub capacity: u32,
    pub slot_type: SlotType,
    pub recurrence: RecurrenceMeta,
}

/// Walk `[from, until]` day by day and materialize the template on every
/// day that passes the weekday filter. `parent_slot_id` is stamped into
/// each spec's recurrence metadata when the run was seeded from an
/// existing slot.
pub fn expand(
    provider_id: Ulid,
    template: &SlotTemplate,
    from: NaiveDate,
    until: NaiveDate,
    days_of_week: Option<&[Weekday]>,
    parent_slot_id: Option<Ulid>,
) -> impl Iterator<Item = SlotSpec> + use<> {
    let template = *template;
    let days: Option<Vec<Weekday>> = days_of_week.map(<[Weekday]>::to_vec);
    let frequency = if days.is_some() {
        RecurrenceFrequency::Weekly
    } else {
        RecurrenceFrequency::Daily
    };

    from.iter_days()
        .take_while(move |d| *d <= until)
        .filter(move |d| match &days {
            Some(days) => days.contains(&d.weekday()),
            None => true,
        })
        .map(move |date| SlotSpec {
            provider_id,
            date,
            start_time: template.start_time,
            end_time: template.end_time,
            capacity: template.capacity,
            slot_type: template.slot_type,
            recurrence: RecurrenceMeta {
                frequency,
                until,
                parent_slot_id,
            },
        })
}
