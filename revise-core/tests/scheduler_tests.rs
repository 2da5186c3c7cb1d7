use chrono::{Duration, Utc};
use revise_core::{apply_grade, CardProgress, CardStatus, Grade, EF_MIN, RELEARN_DELAY_MINUTES};
use uuid::Uuid;

fn fresh_progress() -> CardProgress {
    CardProgress::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Utc::now())
}

fn ef_close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[test]
fn good_progression_from_new() {
    let now = Utc::now();
    let p = fresh_progress();

    let p = apply_grade(p, Grade::Good, now);
    assert_eq!(p.status, CardStatus::Review);
    assert_eq!(p.interval_days, 1);
    assert_eq!(p.repetitions, 1);
    assert!(ef_close(p.ease_factor, 2.5));
    assert_eq!(p.next_review_at, now + Duration::days(1));
    assert_eq!(p.last_reviewed_at, Some(now));

    let next_day = now + Duration::days(1);
    let p = apply_grade(p, Grade::Good, next_day);
    assert_eq!(p.interval_days, 6);
    assert_eq!(p.repetitions, 2);

    let p = apply_grade(p, Grade::Good, next_day + Duration::days(6));
    assert_eq!(p.interval_days, 15); // round(6 * 2.5)
    assert_eq!(p.repetitions, 3);
    assert!(ef_close(p.ease_factor, 2.5));
}

#[test]
fn again_on_new_card_enters_learning() {
    let now = Utc::now();
    let p = apply_grade(fresh_progress(), Grade::Again, now);

    assert_eq!(p.status, CardStatus::Learning);
    assert_eq!(p.repetitions, 0);
    assert_eq!(p.interval_days, 0);
    assert!(ef_close(p.ease_factor, 2.3));
    assert_eq!(p.next_review_at, now + Duration::minutes(RELEARN_DELAY_MINUTES));
}

#[test]
fn again_lapses_review_card_into_relearning() {
    let now = Utc::now();
    let p = apply_grade(fresh_progress(), Grade::Good, now);
    assert_eq!(p.status, CardStatus::Review);

    let p = apply_grade(p, Grade::Again, now + Duration::days(1));
    assert_eq!(p.status, CardStatus::Relearning);
    assert_eq!(p.repetitions, 0);
    assert_eq!(p.interval_days, 0);
    assert!(ef_close(p.ease_factor, 2.3));
}

#[test]
fn relearning_card_graduates_like_learning() {
    let now = Utc::now();
    let p = apply_grade(fresh_progress(), Grade::Good, now);
    let p = apply_grade(p, Grade::Again, now + Duration::days(1));
    assert_eq!(p.status, CardStatus::Relearning);

    let p = apply_grade(p, Grade::Good, now + Duration::days(1));
    assert_eq!(p.status, CardStatus::Review);
    assert_eq!(p.interval_days, 1);
    assert_eq!(p.repetitions, 1);
}

#[test]
fn hard_on_new_card_moves_to_learning() {
    let now = Utc::now();
    let p = apply_grade(fresh_progress(), Grade::Hard, now);

    assert_eq!(p.status, CardStatus::Learning);
    assert_eq!(p.repetitions, 0);
    assert_eq!(p.interval_days, 1);
    assert!(ef_close(p.ease_factor, 2.35));
}

#[test]
fn hard_in_review_increments_repetitions() {
    let now = Utc::now();
    let p = apply_grade(fresh_progress(), Grade::Good, now);
    let p = apply_grade(p, Grade::Good, now + Duration::days(1));
    assert_eq!(p.interval_days, 6);
    assert_eq!(p.repetitions, 2);

    let p = apply_grade(p, Grade::Hard, now + Duration::days(7));
    assert_eq!(p.status, CardStatus::Review);
    assert_eq!(p.repetitions, 3);
    assert_eq!(p.interval_days, 7); // round(6 * 1.2)
    assert!(ef_close(p.ease_factor, 2.35));
}

#[test]
fn easy_on_new_card_promotes_with_minimum_interval() {
    let now = Utc::now();
    let p = apply_grade(fresh_progress(), Grade::Easy, now);

    assert_eq!(p.status, CardStatus::Review);
    assert_eq!(p.interval_days, 1);
    assert_eq!(p.repetitions, 1);
    assert!(ef_close(p.ease_factor, 2.65));
}

#[test]
fn easy_in_review_applies_bonus() {
    let now = Utc::now();
    let p = apply_grade(fresh_progress(), Grade::Good, now);
    let p = apply_grade(p, Grade::Good, now + Duration::days(1));
    assert_eq!(p.interval_days, 6);

    let p = apply_grade(p, Grade::Easy, now + Duration::days(7));
    assert_eq!(p.interval_days, 20); // round(6 * 2.5 * 1.3)
    assert_eq!(p.repetitions, 3);
    assert!(ef_close(p.ease_factor, 2.65));
}

#[test]
fn ease_floor_holds_under_repeated_failure() {
    let mut now = Utc::now();
    let mut p = fresh_progress();
    for _ in 0..25 {
        p = apply_grade(p, Grade::Again, now);
        assert!(p.ease_factor >= EF_MIN - 1e-5);
        assert_eq!(p.interval_days, 0);
        p = apply_grade(p, Grade::Hard, now);
        assert!(p.ease_factor >= EF_MIN - 1e-5);
        now += Duration::days(1);
    }
    assert!(ef_close(p.ease_factor, EF_MIN));
}

#[test]
fn good_and_easy_never_shrink_review_interval() {
    let mut now = Utc::now();
    let mut p = apply_grade(fresh_progress(), Grade::Good, now);
    for step in 0..12 {
        now += Duration::days(p.interval_days.max(1) as i64);
        let before = p.interval_days;
        let grade = if step % 3 == 0 { Grade::Easy } else { Grade::Good };
        let was_review = p.status == CardStatus::Review;
        p = apply_grade(p, grade, now);
        if was_review {
            assert!(p.interval_days >= before, "interval shrank: {before} -> {}", p.interval_days);
        }
    }
}
