//! Demographic classification of one Look person
//!
//! Age buckets: child < 13, teen 13-19, young adult 20-34, middle-aged 35-54,
//! senior 55+. Generations use the estimated birth year (year of entry minus
//! age). Estimates under the configured confidence floor count as unknown.

use crate::domain::rollup::{Demographics, PersonObservation};
use crate::domain::types::Gender;
use crate::services::occupancy::RollupSettings;
use chrono::Datelike;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgeBucket {
    Child,
    Teen,
    YoungAdult,
    MiddleAged,
    Senior,
}

impl AgeBucket {
    pub fn from_age(age: f32) -> Self {
        match age {
            a if a < 13.0 => AgeBucket::Child,
            a if a < 20.0 => AgeBucket::Teen,
            a if a < 35.0 => AgeBucket::YoungAdult,
            a if a < 55.0 => AgeBucket::MiddleAged,
            _ => AgeBucket::Senior,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    Silent,
    Boomer,
    GenX,
    Millennial,
    GenZ,
    Alpha,
}

impl Generation {
    pub fn from_birth_year(year: i32) -> Self {
        match year {
            ..=1945 => Generation::Silent,
            1946..=1964 => Generation::Boomer,
            1965..=1980 => Generation::GenX,
            1981..=1996 => Generation::Millennial,
            1997..=2012 => Generation::GenZ,
            _ => Generation::Alpha,
        }
    }
}

/// Counters for a single person: exactly one gender, age and (if age is known)
/// generation increment
pub fn classify(person: &PersonObservation, settings: &RollupSettings) -> Demographics {
    let mut d = Demographics::default();

    match person.gender {
        Gender::Male if person.gender_confidence >= settings.gender_confidence_min => d.male += 1,
        Gender::Female if person.gender_confidence >= settings.gender_confidence_min => d.female += 1,
        _ => d.gender_unknown += 1,
    }

    if person.age_confidence < settings.age_confidence_min || !person.age.is_finite() || person.age < 0.0 {
        d.age_unknown += 1;
        return d;
    }

    match AgeBucket::from_age(person.age) {
        AgeBucket::Child => d.child += 1,
        AgeBucket::Teen => d.teen += 1,
        AgeBucket::YoungAdult => d.young_adult += 1,
        AgeBucket::MiddleAged => d.middle_aged += 1,
        AgeBucket::Senior => d.senior += 1,
    }

    let birth_year = person.enter_time.year() - person.age.floor() as i32;
    match Generation::from_birth_year(birth_year) {
        Generation::Silent => d.silent += 1,
        Generation::Boomer => d.boomer += 1,
        Generation::GenX => d.gen_x += 1,
        Generation::Millennial => d.millennial += 1,
        Generation::GenZ => d.gen_z += 1,
        Generation::Alpha => d.gen_alpha += 1,
    }
    d
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeSet;

    fn observation(age: f32, age_confidence: f32, gender: Gender, gender_confidence: f32) -> PersonObservation {
        let enter = Utc.with_ymd_and_hms(2025, 3, 14, 10, 0, 0).unwrap();
        PersonObservation {
            enter_time: enter,
            exit_time: None,
            clean_exit: false,
            periods: BTreeSet::new(),
            seen_until: enter,
            age,
            age_confidence,
            gender,
            gender_confidence,
        }
    }

    #[test]
    fn test_age_bucket_edges() {
        assert_eq!(AgeBucket::from_age(12.9), AgeBucket::Child);
        assert_eq!(AgeBucket::from_age(13.0), AgeBucket::Teen);
        assert_eq!(AgeBucket::from_age(19.9), AgeBucket::Teen);
        assert_eq!(AgeBucket::from_age(20.0), AgeBucket::YoungAdult);
        assert_eq!(AgeBucket::from_age(35.0), AgeBucket::MiddleAged);
        assert_eq!(AgeBucket::from_age(55.0), AgeBucket::Senior);
    }

    #[test]
    fn test_generation_edges() {
        assert_eq!(Generation::from_birth_year(1945), Generation::Silent);
        assert_eq!(Generation::from_birth_year(1946), Generation::Boomer);
        assert_eq!(Generation::from_birth_year(1980), Generation::GenX);
        assert_eq!(Generation::from_birth_year(1981), Generation::Millennial);
        assert_eq!(Generation::from_birth_year(2012), Generation::GenZ);
        assert_eq!(Generation::from_birth_year(2013), Generation::Alpha);
    }

    #[test]
    fn test_classify_confident_person() {
        let settings = RollupSettings::default();
        let d = classify(&observation(31.5, 0.9, Gender::Female, 0.8), &settings);
        assert_eq!(d.female, 1);
        assert_eq!(d.young_adult, 1);
        // 2025 - 31 = 1994
        assert_eq!(d.millennial, 1);
        assert_eq!(d.gender_unknown + d.age_unknown, 0);
    }

    #[test]
    fn test_low_confidence_is_unknown() {
        let settings = RollupSettings::default();
        let d = classify(&observation(31.5, 0.1, Gender::Male, 0.2), &settings);
        assert_eq!(d.gender_unknown, 1);
        assert_eq!(d.age_unknown, 1);
        assert_eq!(d.male + d.young_adult + d.millennial, 0);
    }
}
