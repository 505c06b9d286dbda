//! Aggregate statistics over the ledger and the local-day boundary they use.

use super::record::ResponseRecord;
use crate::core::UserId;
use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, NaiveTime, Offset, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Converts instants to the operator's local calendar.
pub trait LocalCalendar: Send + Sync {
    fn to_local(&self, instant: DateTime<Utc>) -> NaiveDateTime;

    /// Start (inclusive) and end (exclusive) of the local day containing `as_of`
    fn today_boundary(&self, as_of: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>);
}

/// Calendar with a fixed offset from UTC.
#[derive(Debug, Clone, Copy)]
pub struct FixedOffsetCalendar {
    offset: FixedOffset,
}

impl FixedOffsetCalendar {
    pub fn utc() -> Self {
        Self::from_minutes(0)
    }

    /// Offsets outside ±24h fall back to UTC.
    pub fn from_minutes(minutes: i32) -> Self {
        let offset = FixedOffset::east_opt(minutes * 60)
            .unwrap_or_else(|| Utc.fix());
        Self { offset }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }
}

impl LocalCalendar for FixedOffsetCalendar {
    fn to_local(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        instant.with_timezone(&self.offset).naive_local()
    }

    fn today_boundary(&self, as_of: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let midnight = self.to_local(as_of).date().and_time(NaiveTime::MIN);
        let start_utc = midnight - Duration::seconds(self.offset.local_minus_utc() as i64);
        let start = DateTime::<Utc>::from_naive_utc_and_offset(start_utc, Utc);
        (start, start + Duration::days(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserStats {
    pub user_id: UserId,
    pub count: usize,
    /// `None` when the user has no records
    pub average_latency: Option<f64>,
    pub count_today: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverallStats {
    pub total: usize,
    pub average_latency: Option<f64>,
    pub count_today: usize,
    pub active_users: usize,
}

#[derive(Default)]
struct Accumulator {
    count: usize,
    latency_sum: f64,
    count_today: usize,
}

impl Accumulator {
    fn add(&mut self, record: &ResponseRecord, today: &(DateTime<Utc>, DateTime<Utc>)) {
        self.count += 1;
        self.latency_sum += record.latency_seconds;
        if record.reply_timestamp >= today.0 && record.reply_timestamp < today.1 {
            self.count_today += 1;
        }
    }

    fn average(&self) -> Option<f64> {
        (self.count > 0).then(|| self.latency_sum / self.count as f64)
    }

    fn into_user_stats(self, user_id: UserId) -> UserStats {
        UserStats {
            user_id,
            count: self.count,
            average_latency: self.average(),
            count_today: self.count_today,
        }
    }
}

pub fn user_stats<'a>(
    user_id: UserId,
    records: impl IntoIterator<Item = &'a ResponseRecord>,
    calendar: &dyn LocalCalendar,
    as_of: DateTime<Utc>,
) -> UserStats {
    let today = calendar.today_boundary(as_of);
    let mut acc = Accumulator::default();
    for record in records {
        if record.target_user_id == user_id {
            acc.add(record, &today);
        }
    }
    acc.into_user_stats(user_id)
}

/// Stats for every tracked user, busiest first; ties go to the lower id.
pub fn all_user_stats<'a>(
    tracked: &BTreeSet<UserId>,
    records: impl IntoIterator<Item = &'a ResponseRecord>,
    calendar: &dyn LocalCalendar,
    as_of: DateTime<Utc>,
) -> Vec<UserStats> {
    let today = calendar.today_boundary(as_of);
    let mut per_user: BTreeMap<UserId, Accumulator> = tracked
        .iter()
        .map(|user_id| (*user_id, Accumulator::default()))
        .collect();
    for record in records {
        if let Some(acc) = per_user.get_mut(&record.target_user_id) {
            acc.add(record, &today);
        }
    }

    let mut stats = per_user
        .into_iter()
        .map(|(user_id, acc)| acc.into_user_stats(user_id))
        .collect::<Vec<_>>();
    stats.sort_by(|a, b| b.count.cmp(&a.count).then(a.user_id.cmp(&b.user_id)));
    stats
}

pub fn overall_stats<'a>(
    records: impl IntoIterator<Item = &'a ResponseRecord>,
    calendar: &dyn LocalCalendar,
    as_of: DateTime<Utc>,
) -> OverallStats {
    let today = calendar.today_boundary(as_of);
    let mut acc = Accumulator::default();
    let mut users = HashSet::new();
    for record in records {
        users.insert(record.target_user_id);
        acc.add(record, &today);
    }
    OverallStats {
        total: acc.count,
        average_latency: acc.average(),
        count_today: acc.count_today,
        active_users: users.len(),
    }
}
