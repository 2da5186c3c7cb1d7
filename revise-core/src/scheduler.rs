use crate::{CardProgress, CardStatus, Grade, EF_MIN};
use chrono::{DateTime, Duration, Utc};

/// An interval of zero means "due again within the session"; the card is
/// re-queued after this many minutes rather than a full day.
pub const RELEARN_DELAY_MINUTES: i64 = 10;

const AGAIN_EF_STEP: f64 = 0.20;
const HARD_EF_STEP: f64 = 0.15;
const EASY_EF_BONUS: f64 = 0.15;
const HARD_INTERVAL_FACTOR: f64 = 1.2;
const EASY_INTERVAL_FACTOR: f64 = 1.3;

fn floor_ef(x: f64) -> f64 {
    x.max(EF_MIN)
}

/// Computes the next scheduling state for a graded card. Pure; the stores
/// call this inside their own transaction and persist the result verbatim.
pub fn apply_grade(mut p: CardProgress, grade: Grade, now: DateTime<Utc>) -> CardProgress {
    match grade {
        Grade::Again => {
            p.status = match p.status {
                CardStatus::Review | CardStatus::Relearning => CardStatus::Relearning,
                CardStatus::New | CardStatus::Learning => CardStatus::Learning,
            };
            p.repetitions = 0;
            p.interval_days = 0;
            p.ease_factor = floor_ef(p.ease_factor - AGAIN_EF_STEP);
        }
        Grade::Hard => {
            if p.status == CardStatus::Review {
                p.repetitions += 1;
            } else if p.status == CardStatus::New {
                p.status = CardStatus::Learning;
            }
            p.interval_days = ((p.interval_days as f64) * HARD_INTERVAL_FACTOR)
                .round()
                .max(1.0) as u32;
            p.ease_factor = floor_ef(p.ease_factor - HARD_EF_STEP);
        }
        Grade::Good => {
            // Keyed on the repetition count rather than the status: the
            // 1-day and 6-day steps apply to the first two successes even
            // though the first already promotes the card to review.
            p.repetitions += 1;
            p.interval_days = match p.repetitions {
                1 => 1,
                2 => 6,
                _ => ((p.interval_days.max(1) as f64) * p.ease_factor).round() as u32,
            };
            p.status = CardStatus::Review;
        }
        Grade::Easy => {
            p.interval_days = ((p.interval_days as f64) * p.ease_factor * EASY_INTERVAL_FACTOR)
                .round()
                .max(1.0) as u32;
            p.ease_factor += EASY_EF_BONUS;
            p.repetitions += 1;
            p.status = CardStatus::Review;
        }
    }

    p.next_review_at = if p.interval_days == 0 {
        now + Duration::minutes(RELEARN_DELAY_MINUTES)
    } else {
        now + Duration::days(p.interval_days as i64)
    };
    p.last_reviewed_at = Some(now);
    p
}
