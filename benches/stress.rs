use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate, NaiveTime};
use ulid::Ulid;

use gymdesk::engine::{Engine, EngineError};
use gymdesk::model::*;
use gymdesk::notify::NotifyHub;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn base_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
}

/// The `i`-th one-hour window, filling 08:00-22:00 day after day.
fn hour_slot(i: u64) -> (NaiveDate, TimeRange) {
    let date = base_date() + Days::new(i / 14);
    let hour = 8 + (i % 14) as u32;
    let range = TimeRange::new(
        NaiveTime::from_hms_opt(hour, 0, 0).unwrap(),
        NaiveTime::from_hms_opt(hour + 1, 0, 0).unwrap(),
    );
    (date, range)
}

struct Club {
    engine: Arc<Engine>,
    members: Vec<Ulid>,
    courts: Vec<Ulid>,
    instructor: Ulid,
}

async fn setup(n_members: usize, n_courts: usize) -> Club {
    let dir = std::env::temp_dir().join(format!("gymdesk_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("gymdesk.wal"), Arc::new(NotifyHub::new())).unwrap());

    let plan = engine
        .create_plan(Plan {
            id: Ulid::new(),
            name: "Full".into(),
            description: None,
            price: 30_000,
            duration_days: 365,
            may_reserve_courts: true,
            may_reserve_classes: true,
        })
        .await
        .unwrap();

    let mut members = Vec::with_capacity(n_members);
    for i in 0..n_members {
        let m = engine
            .register_member(
                Ulid::new(),
                MemberProfile {
                    national_id: format!("{:09}", 100_000_000 + i),
                    first_name: format!("Member{i}"),
                    last_name: "Bench".into(),
                    second_last_name: None,
                    email: format!("member{i}@bench.example"),
                    phone: None,
                    birth_date: None,
                    fitness: Default::default(),
                },
            )
            .await
            .unwrap();
        engine.assign_plan(m.id, plan.id, base_date(), 30_000).await.unwrap();
        members.push(m.id);
    }

    let mut courts = Vec::with_capacity(n_courts);
    for i in 0..n_courts {
        let court = engine
            .create_court(Ulid::new(), format!("Court {i}"), CourtKind::Other)
            .await
            .unwrap();
        courts.push(court.id);
    }

    let instructor = engine
        .register_user(User {
            id: Ulid::new(),
            national_id: "999999999".into(),
            name: "Coach".into(),
            role: Role::Instructor,
            member_id: None,
        })
        .await
        .unwrap();

    println!("  {n_members} members, {n_courts} courts");
    Club {
        engine,
        members,
        courts,
        instructor: instructor.id,
    }
}

async fn phase1_sequential(club: &Club) {
    let n = 2000u64;
    let court = club.courts[0];
    let mut latencies = Vec::with_capacity(n as usize);
    let start = Instant::now();

    for i in 0..n {
        let member = club.members[i as usize % club.members.len()];
        let (date, range) = hour_slot(i);
        let t = Instant::now();
        club.engine
            .create_or_update_booking(member, court, date, range, None)
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(club: &Club) {
    let n_tasks = 10;
    let n_per_task = 200u64;

    let start = Instant::now();
    let mut handles = Vec::new();
    for i in 0..n_tasks {
        let engine = club.engine.clone();
        let member = club.members[i % club.members.len()];
        // Tasks share courts pairwise, so half the attempts collide.
        let court = club.courts[1 + (i / 2) % (club.courts.len() - 1)];
        handles.push(tokio::spawn(async move {
            let mut committed = 0u64;
            for j in 0..n_per_task {
                let (date, range) = hour_slot(j);
                match engine
                    .create_or_update_booking(member, court, date, range, None)
                    .await
                {
                    Ok(_) => committed += 1,
                    Err(EngineError::ScheduleConflict(_)) => {}
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            committed
        }));
    }

    let mut committed = 0;
    for h in handles {
        committed += h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks as u64 * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} attempts = {total} total in {:.2}s = {ops:.0} ops/sec, {committed} committed",
        elapsed.as_secs_f64()
    );
}

async fn phase3_enrollment_storm(club: &Club) {
    let capacity = 25;
    let class = club
        .engine
        .create_class(ClassDetails {
            name: "Spinning".into(),
            description: None,
            instructor_id: club.instructor,
            date: base_date(),
            range: hour_slot(0).1,
            capacity,
        })
        .await
        .unwrap();

    let class_id = class.id;
    let start = Instant::now();
    let mut handles = Vec::new();
    for &member in &club.members {
        let engine = club.engine.clone();
        handles.push(tokio::spawn(async move {
            let t = Instant::now();
            let result = engine.enroll_member(member, class_id).await;
            (result.is_ok(), t.elapsed())
        }));
    }

    let mut seated = 0;
    let mut latencies = Vec::with_capacity(handles.len());
    for h in handles {
        let (ok, latency) = h.await.unwrap();
        if ok {
            seated += 1;
        }
        latencies.push(latency);
    }
    println!(
        "  {} members raced for {capacity} seats in {:.2}ms, {seated} seated",
        club.members.len(),
        start.elapsed().as_secs_f64() * 1000.0
    );
    assert_eq!(seated, capacity);
    print_latency("enroll latency", &mut latencies);
}

async fn phase4_read_under_load(club: &Club) {
    let stop = Arc::new(AtomicBool::new(false));
    let court = club.courts[club.courts.len() - 1];

    let mut writer_handles = Vec::new();
    for w in 0..4u64 {
        let engine = club.engine.clone();
        let stop = stop.clone();
        let member = club.members[w as usize % club.members.len()];
        writer_handles.push(tokio::spawn(async move {
            let mut i = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let (date, range) = hour_slot(w * 100_000 + i);
                let _ = engine
                    .create_or_update_booking(member, court, date, range, None)
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let opening = TimeRange::new(
        NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
        NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
    );
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let engine = club.engine.clone();
        reader_handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let date = base_date() + Days::new(((r * reads_per_reader + i) % 60) as u64);
                let t = Instant::now();
                engine
                    .court_availability(court, date, opening, 60)
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut latencies = Vec::new();
    for h in reader_handles {
        latencies.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        h.await.unwrap();
    }
    print_latency("availability latency under write load", &mut latencies);
}

#[tokio::main]
async fn main() {
    println!("setup");
    let club = setup(200, 6).await;

    println!("phase 1: sequential bookings");
    phase1_sequential(&club).await;

    println!("phase 2: concurrent bookings");
    phase2_concurrent(&club).await;

    println!("phase 3: enrollment storm");
    phase3_enrollment_storm(&club).await;

    println!("phase 4: reads under write load");
    phase4_read_under_load(&club).await;

    let t = Instant::now();
    club.engine.compact_wal().await.unwrap();
    println!("compaction: {:.2}ms", t.elapsed().as_secs_f64() * 1000.0);
}
