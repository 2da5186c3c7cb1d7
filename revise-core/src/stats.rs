use crate::{StudySession, UserStats};
use chrono::{DateTime, Duration, NaiveDate, Utc};

/// Streak continuity after studying on `today`: consecutive days extend
/// the streak, a same-day re-study leaves it alone, any gap resets it.
pub fn streak_after(last: Option<NaiveDate>, current: u32, today: NaiveDate) -> u32 {
    match last {
        Some(d) if d == today => current,
        Some(d) if d + Duration::days(1) == today => current + 1,
        _ => 1,
    }
}

/// Folds a closed session into the user's stats. Called by the stores in
/// the same transaction that sets `ended_at`.
pub fn apply_session_close(stats: &mut UserStats, session: &StudySession, ended_at: DateTime<Utc>) {
    let today = ended_at.date_naive();
    stats.current_streak = streak_after(stats.last_study_date, stats.current_streak, today);
    stats.longest_streak = stats.longest_streak.max(stats.current_streak);
    stats.last_study_date = Some(today);
    stats.total_cards_studied += session.cards_studied;
    stats.total_time_spent_secs += (ended_at - session.started_at).num_seconds().max(0) as u64;
}
