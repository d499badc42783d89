//! Digest simulator - synthetic Look/Move digests for local runs
//!
//! Generates visitors over a span of hours and slices them into digests
//! whose windows overlap, the way a proxy agent resends the tail of its
//! previous upload. Some digests are additionally sent twice.
//!
//! Usage:
//!   cargo run --bin digest-sim -- --hours 3 --output digests.jsonl

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use clap::Parser;
use facility_rollup::domain::types::{
    BorderCrossing, BorderDirection, DeviceDigest, DeviceId, DeviceType, DwellKind, DwellPing, Gender,
    HotspotCrossing, HotspotDirection, Interpretation, ObjectId, PersonDetection, TimePeriod, TriggerId,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smallvec::smallvec;
use std::fs::File;
use std::io::{BufWriter, Write};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "digest-sim")]
#[command(about = "Generate overlapping sensor digests as JSONL")]
struct Args {
    /// Output file
    #[arg(short, long, default_value = "digests.jsonl")]
    output: String,

    /// Hours of traffic to generate, ending at the current hour
    #[arg(long, default_value_t = 3)]
    hours: i64,

    /// Start of the first hour (RFC 3339); defaults to `hours` before now
    #[arg(long)]
    start: Option<DateTime<Utc>>,

    /// Look device ids
    #[arg(long, value_delimiter = ',', default_value = "look-1")]
    look: Vec<String>,

    /// Move device ids
    #[arg(long = "move", value_delimiter = ',', default_value = "move-1")]
    moves: Vec<String>,

    /// Visitors per device per hour
    #[arg(long, default_value_t = 40)]
    visitors: u32,

    /// Digest window length in minutes
    #[arg(long, default_value_t = 20)]
    window_minutes: i64,

    /// Minutes each window re-covers from the previous one
    #[arg(long, default_value_t = 5)]
    overlap_minutes: i64,

    /// Send every n-th digest twice (0 = never)
    #[arg(long, default_value_t = 4)]
    resend_every: usize,

    /// RNG seed for reproducible output
    #[arg(long, default_value_t = 7)]
    seed: u64,
}

/// One simulated visit, shared by both sensor families
#[derive(Debug, Clone)]
struct Visit {
    id: i64,
    enter: DateTime<Utc>,
    exit: DateTime<Utc>,
    age: f32,
    age_confidence: f32,
    gender: Gender,
    gender_confidence: f32,
    uses_till: bool,
    crosses_aisle: bool,
}

fn random_visits(rng: &mut StdRng, start: DateTime<Utc>, hours: i64, per_hour: u32) -> Vec<Visit> {
    let span_secs = hours * 3600;
    let count = (hours.max(0) as u64 * u64::from(per_hour)) as usize;
    let mut visits: Vec<Visit> = (0..count)
        .map(|i| {
            let enter = start + TimeDelta::seconds(rng.gen_range(0..span_secs.max(1)));
            let dwell = TimeDelta::seconds(rng.gen_range(2..45 * 60));
            Visit {
                id: i as i64 + 1,
                enter,
                exit: enter + dwell,
                age: rng.gen_range(4.0..85.0),
                age_confidence: rng.gen_range(0.2..1.0),
                gender: if rng.gen_bool(0.5) { Gender::Female } else { Gender::Male },
                gender_confidence: rng.gen_range(0.2..1.0),
                uses_till: rng.gen_bool(0.4),
                crosses_aisle: rng.gen_bool(0.3),
            }
        })
        .collect();
    visits.sort_by_key(|v| v.enter);
    visits
}

fn empty_digest(device: &str, device_type: DeviceType, from: DateTime<Utc>, to: DateTime<Utc>) -> DeviceDigest {
    DeviceDigest {
        device_id: DeviceId::new(device),
        device_type,
        collection_time: to,
        time_min: from,
        time_max: to,
        person_detections: vec![],
        border_crossings: vec![],
        hotspot_crossings: vec![],
        dwell_pings: vec![],
    }
}

fn look_digest(
    device: &str,
    session: &str,
    visits: &[Visit],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> DeviceDigest {
    let mut digest = empty_digest(device, DeviceType::Look, from, to);
    for v in visits.iter().filter(|v| v.enter <= to && v.exit >= from) {
        // Sessions still in view at collection time are reported open
        let exit = (v.exit <= to).then_some(v.exit);
        digest.person_detections.push(PersonDetection {
            person_id: v.id,
            session_id: session.to_string(),
            enter_time: v.enter,
            exit_time: exit,
            clean_exit: exit.is_some(),
            time_periods: smallvec![TimePeriod { enter_time: v.enter, exit_time: exit }],
            age: v.age,
            age_confidence: v.age_confidence,
            gender: v.gender,
            gender_confidence: v.gender_confidence,
        });
    }
    digest
}

fn move_digest(device: &str, visits: &[Visit], from: DateTime<Utc>, to: DateTime<Utc>) -> DeviceDigest {
    let mut digest = empty_digest(device, DeviceType::Move, from, to);
    let within = |t: DateTime<Utc>| t >= from && t <= to;

    for v in visits {
        let object_id = ObjectId(v.id);
        let door = |direction, time| BorderCrossing {
            border_id: TriggerId::new("door"),
            direction,
            interpretation: Interpretation::Entrance,
            is_outer_border: true,
            object_id,
            time,
        };
        if within(v.enter) {
            digest.border_crossings.push(door(BorderDirection::LeftToRight, v.enter));
            digest.dwell_pings.push(DwellPing { object_id, kind: DwellKind::Detected, time: v.enter });
        }
        if within(v.exit) {
            digest.border_crossings.push(door(BorderDirection::RightToLeft, v.exit));
            digest.dwell_pings.push(DwellPing { object_id, kind: DwellKind::Lost, time: v.exit });
        }

        let middle = v.enter + (v.exit - v.enter) / 2;
        if v.crosses_aisle && within(middle) {
            digest.border_crossings.push(BorderCrossing {
                border_id: TriggerId::new("aisle"),
                direction: BorderDirection::LeftToRight,
                interpretation: Interpretation::Internal,
                is_outer_border: false,
                object_id,
                time: middle,
            });
        }
        if v.uses_till {
            let till_out = middle + (v.exit - middle) / 2;
            for (direction_type, time) in [(HotspotDirection::In, middle), (HotspotDirection::Out, till_out)] {
                if within(time) {
                    digest.hotspot_crossings.push(HotspotCrossing {
                        hotspot_id: TriggerId::new("till"),
                        direction_type,
                        object_id,
                        time,
                    });
                }
            }
        }
    }
    digest
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut rng = StdRng::seed_from_u64(args.seed);

    let hours = args.hours.max(1);
    let start = match args.start {
        Some(start) => start,
        None => (Utc::now() - TimeDelta::hours(hours)).duration_trunc(TimeDelta::hours(1))?,
    };
    let end = start + TimeDelta::hours(hours);
    let window = TimeDelta::minutes(args.window_minutes.max(1));
    let step = TimeDelta::minutes((args.window_minutes - args.overlap_minutes).max(1));

    let mut digests = Vec::new();
    for device in &args.look {
        let visits = random_visits(&mut rng, start, hours, args.visitors);
        let session = Uuid::now_v7().to_string();
        let mut from = start;
        while from < end {
            let to = (from + window).min(end);
            digests.push(look_digest(device, &session, &visits, from, to));
            from += step;
        }
    }
    for device in &args.moves {
        let visits = random_visits(&mut rng, start, hours, args.visitors);
        let mut from = start;
        while from < end {
            let to = (from + window).min(end);
            digests.push(move_digest(device, &visits, from, to));
            from += step;
        }
    }
    digests.sort_by_key(|d| d.collection_time);

    let mut out = BufWriter::new(File::create(&args.output)?);
    let mut lines = 0usize;
    for (i, digest) in digests.iter().enumerate() {
        let line = serde_json::to_string(digest)?;
        writeln!(out, "{line}")?;
        lines += 1;
        if args.resend_every > 0 && (i + 1) % args.resend_every == 0 {
            writeln!(out, "{line}")?;
            lines += 1;
        }
    }
    out.flush()?;

    println!(
        "wrote {lines} digest lines ({} unique) for {} look and {} move devices, {start} to {end}, to {}",
        digests.len(),
        args.look.len(),
        args.moves.len(),
        args.output
    );
    Ok(())
}
