use crate::helpers::duration::parse_go_duration;
use chrono::{FixedOffset, Local, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::str::FromStr;
use std::time::Duration as StdDuration;
use tokio::time::Instant;

static CLOCK_TIME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([01]?\d|2[0-3]):([0-5]\d)$").unwrap());

/// One configured refresh cadence, in the precedence order the scheduler
/// tries to parse it in: a clock-of-day time, a cron expression, then a
/// Go-style duration (spec §4.6, decision recorded in SPEC_FULL.md §9).
#[derive(Clone)]
pub enum Interval {
    ClockTime { hour: u32, minute: u32 },
    Cron(cron::Schedule),
    Fixed(StdDuration),
}

pub fn parse_interval(raw: &str) -> anyhow::Result<Interval> {
    let raw = raw.trim();

    if let Some(caps) = CLOCK_TIME_RE.captures(raw) {
        let hour: u32 = caps[1].parse()?;
        let minute: u32 = caps[2].parse()?;
        return Ok(Interval::ClockTime { hour, minute });
    }

    if let Ok(schedule) = cron::Schedule::from_str(raw) {
        return Ok(Interval::Cron(schedule));
    }

    if let Some(d) = parse_go_duration(raw) {
        return Ok(Interval::Fixed(d));
    }

    anyhow::bail!("could not parse interval {raw:?} as a clock time, cron expression, or duration")
}

/// How long to sleep before the next run, given `now`.
fn next_delay(interval: &Interval, now: chrono::DateTime<Local>) -> StdDuration {
    match interval {
        Interval::ClockTime { hour, minute } => {
            let today = now
                .date_naive()
                .and_hms_opt(*hour, *minute, 0)
                .expect("valid hour/minute");
            let today = Local.from_local_datetime(&today).single().unwrap_or(now);
            let target = if today > now {
                today
            } else {
                today + chrono::Duration::days(1)
            };
            (target - now).to_std().unwrap_or(StdDuration::from_secs(1))
        }
        Interval::Cron(schedule) => schedule
            .upcoming(Local)
            .next()
            .map(|next| (next - now).to_std().unwrap_or(StdDuration::from_secs(1)))
            .unwrap_or(StdDuration::from_secs(3600)),
        Interval::Fixed(d) => *d,
    }
}

/// Runs `task` repeatedly on `interval`, forever. Used for the per-provider
/// torrent refresh and download-link refresh jobs.
pub async fn run_interval<F, Fut>(name: String, interval: Interval, task: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>>,
{
    loop {
        let delay = next_delay(&interval, Local::now());
        tracing::debug!("{} sleeping {:?} until next run", name, delay);
        tokio::time::sleep(delay).await;

        let started = Instant::now();
        if let Err(e) = task().await {
            tracing::warn!("{} failed after {:?}: {}", name, started.elapsed(), e);
        }
    }
}

/// Fixed UTC+1 offset standing in for CET. The source system runs the daily
/// reset at 00:00 CET; without a timezone-database dependency this ignores
/// the CEST summer-time shift (noted in DESIGN.md).
fn cet_offset() -> FixedOffset {
    FixedOffset::east_opt(3600).expect("valid fixed offset")
}

/// Runs `task` once per day at 00:00 CET (approximated, see `cet_offset`).
/// Used for the account/token-rotation daily reset.
pub async fn run_daily_cet<F, Fut>(name: String, task: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    loop {
        let now_cet = Utc::now().with_timezone(&cet_offset());
        let midnight_today = now_cet
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("valid midnight");
        let midnight_today = cet_offset().from_local_datetime(&midnight_today).single().unwrap_or(now_cet);
        let target = if midnight_today > now_cet {
            midnight_today
        } else {
            midnight_today + chrono::Duration::days(1)
        };

        let delay = (target - now_cet).to_std().unwrap_or(StdDuration::from_secs(60));
        tracing::debug!("{} sleeping {:?} until next daily reset", name, delay);
        tokio::time::sleep(delay).await;

        task().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_time_takes_precedence_over_duration() {
        assert!(matches!(
            parse_interval("05:30").unwrap(),
            Interval::ClockTime { hour: 5, minute: 30 }
        ));
    }

    #[test]
    fn cron_expression_parses_when_not_clock_time() {
        assert!(matches!(parse_interval("0 0 * * * *").unwrap(), Interval::Cron(_)));
    }

    #[test]
    fn falls_back_to_go_duration() {
        assert!(matches!(parse_interval("15m").unwrap(), Interval::Fixed(d) if d == StdDuration::from_secs(900)));
    }

    #[test]
    fn rejects_garbage_interval() {
        assert!(parse_interval("not-an-interval").is_err());
    }
}
