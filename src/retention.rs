// Benji backup system.

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.

//! Retention policy enforcement.
//!
//! A policy is a comma-separated list of `<category><count>` elements where
//! the category is one of `latest`, `hours`, `days`, `weeks`, `months`,
//! `years`. Versions are grouped into natural time buckets in the local
//! timezone; within each bucket the oldest version is kept. `latestN` keeps
//! the N youngest versions outright. Versions too old for every category are
//! dismissed.

use time::{Date, OffsetDateTime, UtcOffset, Weekday};

use crate::errors::Error;
use crate::version::VersionUid;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    Latest,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

impl Category {
    const ALL: [Category; 6] = [
        Category::Latest,
        Category::Hours,
        Category::Days,
        Category::Weeks,
        Category::Months,
        Category::Years,
    ];

    fn parse(s: &str) -> Option<Category> {
        match s {
            "latest" => Some(Category::Latest),
            "hours" => Some(Category::Hours),
            "days" => Some(Category::Days),
            "weeks" => Some(Category::Weeks),
            "months" => Some(Category::Months),
            "years" => Some(Category::Years),
            _ => None,
        }
    }
}

/// A parsed retention policy. Categories are always applied youngest to
/// oldest, regardless of the order they were written in.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    rules: Vec<(Category, u32)>,
}

impl RetentionPolicy {
    pub fn parse(spec: &str) -> Result<RetentionPolicy> {
        let mut parsed: Vec<(Category, u32)> = Vec::new();
        for token in spec.split(',') {
            if token.is_empty() {
                return Err(Error::InvalidInput {
                    reason: "empty retention policy element".to_owned(),
                });
            }
            let split = token.find(|c: char| c.is_ascii_digit()).ok_or_else(|| {
                Error::InvalidInput {
                    reason: format!("invalid retention policy element {:?}", token),
                }
            })?;
            let (name, count) = token.split_at(split);
            let category = Category::parse(name).ok_or_else(|| Error::InvalidInput {
                reason: format!("unknown retention category {:?}", name),
            })?;
            let count: u32 = count.parse().map_err(|_| Error::InvalidInput {
                reason: format!("invalid count in retention policy element {:?}", token),
            })?;
            if count == 0 {
                return Err(Error::InvalidInput {
                    reason: format!("count of retention category {:?} must be positive", name),
                });
            }
            if parsed.iter().any(|(c, _)| *c == category) {
                return Err(Error::InvalidInput {
                    reason: format!("retention category {:?} listed more than once", name),
                });
            }
            parsed.push((category, count));
        }
        let mut rules = Vec::new();
        for category in Category::ALL {
            if let Some(&(_, count)) = parsed.iter().find(|(c, _)| *c == category) {
                rules.push((category, count));
            }
        }
        Ok(RetentionPolicy { rules })
    }

    /// Decide which versions to dismiss. Input versions belong to a single
    /// volume; the result lists the UIDs that fall outside the kept set.
    ///
    /// `reference` is "now" and `offset` the timezone used for bucket
    /// boundaries (hour at `:00`, week beginning Monday 00:00, and so on).
    pub fn dismissed(
        &self,
        versions: &[(VersionUid, OffsetDateTime)],
        reference: OffsetDateTime,
        offset: UtcOffset,
    ) -> Vec<VersionUid> {
        // Youngest first.
        let mut versions: Vec<(VersionUid, OffsetDateTime)> = versions.to_vec();
        versions.sort_by(|a, b| b.1.cmp(&a.1));

        let mut remaining = &versions[..];
        if let Some(&(_, count)) = self.rules.iter().find(|(c, _)| *c == Category::Latest) {
            let keep = (count as usize).min(remaining.len());
            remaining = &remaining[keep..];
        }

        let bucketed: Vec<(Category, u32)> = self
            .rules
            .iter()
            .copied()
            .filter(|(c, _)| *c != Category::Latest)
            .collect();

        let mut dismissed: Vec<VersionUid> = Vec::new();
        // (category, bucket index) -> the oldest version seen so far; because
        // input is youngest first, each newcomer displaces the previous
        // keeper into the dismissed set.
        let mut keepers: std::collections::HashMap<(Category, i64), VersionUid> =
            std::collections::HashMap::new();

        for &(uid, date) in remaining {
            if date > reference {
                // Err on the safe side with clock skew: never dismiss a
                // version from the future.
                tracing::warn!(%uid, "version is younger than the reference time, keeping it");
                continue;
            }
            let mut placed = false;
            for &(category, count) in &bucketed {
                let distance = bucket_distance(category, date, reference, offset);
                // "Keep one version per bucket for the last N buckets": the
                // reference bucket is distance 0, so N buckets span 0..N-1.
                if distance < i64::from(count) {
                    if let Some(previous) = keepers.insert((category, distance), uid) {
                        dismissed.push(previous);
                    }
                    placed = true;
                    break;
                }
            }
            if !placed {
                dismissed.push(uid);
            }
        }
        dismissed
    }
}

fn start_of_week(date: Date) -> Date {
    let mut d = date;
    while d.weekday() != Weekday::Monday {
        d = d.previous_day().expect("date within calendar range");
    }
    d
}

/// Number of whole buckets between a version's time and the reference time,
/// measured on bucket boundaries in the given timezone. Zero means the same
/// bucket as the reference.
fn bucket_distance(
    category: Category,
    t: OffsetDateTime,
    reference: OffsetDateTime,
    offset: UtcOffset,
) -> i64 {
    let t = t.to_offset(offset);
    let reference = reference.to_offset(offset);
    match category {
        Category::Latest => 0,
        Category::Hours => {
            let floor = |x: OffsetDateTime| x.replace_minute(0).unwrap().replace_second(0).unwrap()
                .replace_nanosecond(0).unwrap();
            (floor(reference) - floor(t)).whole_hours()
        }
        Category::Days => {
            (reference.date().to_julian_day() - t.date().to_julian_day()) as i64
        }
        Category::Weeks => {
            let delta = start_of_week(reference.date()).to_julian_day()
                - start_of_week(t.date()).to_julian_day();
            i64::from(delta) / 7
        }
        Category::Months => {
            let months = |d: Date| i64::from(d.year()) * 12 + i64::from(u8::from(d.month())) - 1;
            months(reference.date()) - months(t.date())
        }
        Category::Years => i64::from(reference.date().year()) - i64::from(t.date().year()),
    }
}
