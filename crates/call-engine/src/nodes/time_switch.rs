//! Time-switch node

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::call::CallContext;
use crate::error::{Error, Result};
use crate::flow::FlowNode;
use crate::nodes::NodeOutcome;
use crate::resolver::{Resolver, TimeRule};

/// Evaluate an ordered rule list at `now`, in `tz`. The first rule whose
/// day set and window match wins; windows with start > end span midnight.
/// Evaluation converts the UTC instant into local wall time, so skipped or
/// repeated local times during DST changes resolve to the single instant
/// the clock actually shows.
pub fn evaluate_rules(rules: &[TimeRule], tz: Tz, now: DateTime<Utc>) -> Option<String> {
    const DAYS: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];
    let local = now.with_timezone(&tz);
    let today = DAYS[local.weekday().num_days_from_monday() as usize];
    let minute_of_day = local.hour() * 60 + local.minute();

    for rule in rules {
        if !rule.days.iter().any(|d| d.eq_ignore_ascii_case(today)) {
            continue;
        }
        let (start, end) = match (parse_hhmm(&rule.start), parse_hhmm(&rule.end)) {
            (Some(start), Some(end)) => (start, end),
            _ => {
                warn!(label = %rule.label, "time rule has unparseable bounds");
                continue;
            }
        };
        let matched = if start <= end {
            start <= minute_of_day && minute_of_day < end
        } else {
            // Overnight range, e.g. 22:00–06:00.
            minute_of_day >= start || minute_of_day < end
        };
        if matched {
            return Some(rule.label.clone());
        }
    }
    None
}

fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    (h < 24 && m < 60).then_some(h * 60 + m)
}

pub async fn run(ctx: &mut CallContext, node: &FlowNode) -> Result<NodeOutcome> {
    let id = node
        .entity
        .as_ref()
        .map(|e| e.id)
        .ok_or_else(|| Error::NodeConfig(format!("node {} has no entity reference", node.id)))?;
    let switch = Resolver::time_switch(ctx.env.resolver.as_ref(), id).await?;

    let tz: Tz = switch.timezone.parse().unwrap_or_else(|_| {
        warn!(timezone = %switch.timezone, "unknown timezone, using UTC");
        chrono_tz::UTC
    });

    let port = evaluate_rules(&switch.rules, tz, Utc::now()).unwrap_or_else(|| "default".into());
    Ok(NodeOutcome::Port(port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn rules() -> Vec<TimeRule> {
        vec![
            TimeRule {
                label: "business_hours".into(),
                days: vec!["mon".into(), "tue".into(), "wed".into(), "thu".into(), "fri".into()],
                start: "08:30".into(),
                end: "17:00".into(),
            },
            TimeRule {
                label: "night_shift".into(),
                days: vec!["fri".into(), "sat".into()],
                start: "22:00".into(),
                end: "06:00".into(),
            },
        ]
    }

    fn sydney() -> Tz {
        "Australia/Sydney".parse().unwrap()
    }

    fn at(tz: Tz, y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        tz.with_ymd_and_hms(y, mo, d, h, mi, 0)
            .single()
            .or_else(|| tz.with_ymd_and_hms(y, mo, d, h, mi, 0).earliest())
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn weekday_business_hours_match() {
        // Monday 2025-06-16 10:00 Sydney.
        let now = at(sydney(), 2025, 6, 16, 10, 0);
        assert_eq!(
            evaluate_rules(&rules(), sydney(), now).as_deref(),
            Some("business_hours")
        );
    }

    #[test]
    fn saturday_misses_business_hours() {
        // Saturday 2025-06-21 10:00 Sydney: outside both rules.
        let now = at(sydney(), 2025, 6, 21, 10, 0);
        assert_eq!(evaluate_rules(&rules(), sydney(), now), None);
    }

    #[test]
    fn boundaries_are_start_inclusive_end_exclusive() {
        let tz = sydney();
        assert_eq!(
            evaluate_rules(&rules(), tz, at(tz, 2025, 6, 16, 8, 30)).as_deref(),
            Some("business_hours")
        );
        assert_eq!(evaluate_rules(&rules(), tz, at(tz, 2025, 6, 16, 17, 0)), None);
    }

    #[test]
    fn overnight_range_wraps_midnight() {
        let tz = sydney();
        // Friday 23:30 matches.
        assert_eq!(
            evaluate_rules(&rules(), tz, at(tz, 2025, 6, 20, 23, 30)).as_deref(),
            Some("night_shift")
        );
        // Saturday 01:00 also matches (same rule, next day listed).
        assert_eq!(
            evaluate_rules(&rules(), tz, at(tz, 2025, 6, 21, 1, 0)).as_deref(),
            Some("night_shift")
        );
        // Saturday 07:00 does not.
        assert_eq!(evaluate_rules(&rules(), tz, at(tz, 2025, 6, 21, 7, 0)), None);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let tz = sydney();
        let now = at(tz, 2025, 6, 16, 12, 0);
        let first = evaluate_rules(&rules(), tz, now);
        for _ in 0..10 {
            assert_eq!(evaluate_rules(&rules(), tz, now), first);
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let mut overlapping = rules();
        overlapping.insert(
            0,
            TimeRule {
                label: "override".into(),
                days: vec!["mon".into()],
                start: "00:00".into(),
                end: "23:59".into(),
            },
        );
        let now = at(sydney(), 2025, 6, 16, 10, 0);
        assert_eq!(
            evaluate_rules(&overlapping, sydney(), now).as_deref(),
            Some("override")
        );
    }
}
