use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use sailtrace::baseline::{build_baseline, detect_anomalies, CancelFlag};
use sailtrace::maneuver::UnresolvedReason;
use sailtrace::tactics::{start_line_bias, FavoredEnd, StartLine, TacticsParams};
use sailtrace::{
    analyze_session, analyze_sessions, compare_fleet, normalize, CourseConfig, GeoPoint, Metric,
    NormalizeParams, Params, SessionInput, TelemetryFix, WindReading,
};

const M_PER_DEG_LAT: f64 = 111_195.0;
const SETTLE: usize = 4;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

/// Dead-reckoned 1 Hz track from (heading, speed) steps, wind from north at 10 kn.
fn track(start: DateTime<Utc>, steps: &[(f64, f64)]) -> Vec<TelemetryFix> {
    let (mut lat, mut lon) = (50.0_f64, -1.0_f64);
    steps
        .iter()
        .enumerate()
        .map(|(i, &(heading, sog))| {
            let mut fix = TelemetryFix::new(start + Duration::seconds(i as i64), lat, lon, sog, heading);
            fix.heading_deg = Some(heading);
            fix.wind = Some(WindReading {
                direction_deg: 0.0,
                speed_kn: 10.0,
            });
            let metres = sog * 1852.0 / 3600.0;
            let h = heading.to_radians();
            lat += metres * h.cos() / M_PER_DEG_LAT;
            lon += metres * h.sin() / (M_PER_DEG_LAT * lat.to_radians().cos());
            fix
        })
        .collect()
}

/// Upwind beats alternating 315 and 45, tacking through 90 degrees in three
/// seconds. Returns the steps and the index of the last straight sample
/// before each tack; the boat settles on the new heading `SETTLE` samples later.
fn beats(tacks: usize, leg_s: usize) -> (Vec<(f64, f64)>, Vec<usize>) {
    let mut steps = Vec::new();
    let mut starts = Vec::new();
    let mut heading = 315.0;
    for _ in 0..tacks {
        steps.extend(std::iter::repeat((heading, 5.0)).take(leg_s));
        starts.push(steps.len() - 1);
        let dir = if heading == 315.0 { 30.0 } else { -30.0 };
        for k in 1..=3 {
            steps.push(((heading + dir * k as f64).rem_euclid(360.0), 4.0));
        }
        heading = (heading + 3.0 * dir).rem_euclid(360.0);
        steps.push((heading, 4.5));
    }
    steps.extend(std::iter::repeat((heading, 5.0)).take(leg_s));
    (steps, starts)
}

fn session(id: &str, sailor: &str, fixes: Vec<TelemetryFix>) -> SessionInput {
    SessionInput {
        session_id: id.into(),
        sailor_id: sailor.into(),
        course: CourseConfig::default(),
        fixes,
    }
}

#[test]
fn injected_tacks_found_within_one_sample() {
    let (steps, starts) = beats(4, 60);
    let input = session("beats", "alex", track(t0(), &steps));
    let analysis = analyze_session(&input, &Params::default(), None).unwrap();

    assert_eq!(analysis.maneuvers.tacks(), starts.len());
    for (m, &k) in analysis.maneuvers.maneuvers.iter().zip(&starts) {
        let injected = t0() + Duration::seconds(k as i64);
        assert!((m.start_ts - injected).num_seconds().abs() <= 1, "{} vs {}", m.start_ts, injected);
        let settled = injected + Duration::seconds(SETTLE as i64);
        assert!((m.end_ts - settled).num_seconds().abs() <= 1, "{} vs {}", m.end_ts, settled);
        assert!((m.heading_change_deg.abs() - 90.0).abs() < 1.0);
    }
    assert!(analysis.maneuvers.unresolved.is_empty());
}

#[test]
fn vmg_on_a_steady_beat_is_speed_times_cos_twa() {
    let input = session("beat", "alex", track(t0(), &vec![(315.0, 5.0); 90]));
    let analysis = analyze_session(&input, &Params::default(), None).unwrap();
    let expected = 5.0 * 45f64.to_radians().cos();
    for snap in &analysis.snapshots {
        let vmg = snap.vmg.defined().expect("wind present");
        assert!((vmg.twa_deg.abs() - 45.0).abs() < 1e-6);
        assert!((vmg.instantaneous_kn - expected).abs() < 1e-6);
    }
}

#[test]
fn reanalysis_is_byte_identical() {
    let (steps, _) = beats(3, 45);
    let input = session("s", "alex", track(t0(), &steps));
    let params = Params::default();
    let a = serde_json::to_string(&analyze_session(&input, &params, None).unwrap()).unwrap();
    let b = serde_json::to_string(&analyze_session(&input, &params, None).unwrap()).unwrap();
    assert_eq!(a, b);

    let batch = analyze_sessions(&[input.clone(), input], &params, None);
    for result in batch {
        assert_eq!(serde_json::to_string(&result.unwrap()).unwrap(), a);
    }
}

#[test]
fn no_maneuver_spans_a_dropout() {
    let (steps, starts) = beats(1, 60);
    let mut fixes = track(t0(), &steps);
    // Drop everything after the second turning sample and resume five minutes later.
    let cut = starts[0] + 3;
    let tail: Vec<_> = fixes.split_off(cut);
    fixes.extend(tail.into_iter().skip(2).map(|mut f| {
        f.timestamp += Duration::seconds(300);
        f
    }));

    let analysis = analyze_session(&session("gap", "alex", fixes), &Params::default(), None).unwrap();
    let gaps = analysis.series.gaps();
    assert_eq!(gaps.len(), 1);
    assert!(gaps[0].duration_s >= 300.0);
    for m in &analysis.maneuvers.maneuvers {
        assert!(!(m.start_ts <= gaps[0].start && m.end_ts >= gaps[0].end));
    }
    assert!(analysis
        .maneuvers
        .unresolved
        .iter()
        .any(|u| u.reason == UnresolvedReason::GapInterrupted));
}

#[test]
fn start_bias_sign_convention() {
    let line = StartLine {
        committee: GeoPoint::new(50.0, -1.0),
        pin: GeoPoint::new(50.0, -1.0014),
    };
    let bias = start_line_bias(Some(&line), Some(5.0), &TacticsParams::default());
    let Metric::Defined(bias) = bias else {
        panic!("bias should be defined");
    };
    assert!(bias.bias_deg < -4.9 && bias.bias_deg > -5.1);
    assert_eq!(bias.favored_end, FavoredEnd::Committee);
    let expected = bias.line_length_m * bias.bias_deg.abs().to_radians().sin();
    assert!((bias.advantage_m - expected).abs() < 1e-9);
}

#[test]
fn slower_session_flagged_against_own_baseline() {
    let params = Params::default();
    let history: Vec<_> = (0..3)
        .map(|d| {
            let fixes = track(t0() + Duration::days(d), &vec![(315.0, 5.0); 120]);
            let input = session(&format!("h{d}"), "alex", fixes);
            analyze_session(&input, &params, None).unwrap().historical().unwrap()
        })
        .collect();
    let baseline = build_baseline(&history, &params.baseline, &CancelFlag::new()).unwrap();

    let slow = session("slow", "alex", track(t0() + Duration::days(5), &vec![(315.0, 4.0); 120]));
    let slow = analyze_session(&slow, &params, None).unwrap().historical().unwrap();
    let report = detect_anomalies(&slow, &baseline, &params.baseline);
    assert!(!report.anomalies.is_empty());
    for a in &report.anomalies {
        assert!(a.z_score < 0.0);
        assert!((a.deviation_kn + 1.0).abs() < 1e-6);
    }
}

#[test]
fn fleet_ranks_faster_sailor_first_on_speed() {
    let params = Params::default();
    let fast = analyze_session(&session("f", "fast", track(t0(), &vec![(315.0, 6.0); 120])), &params, None).unwrap();
    let slow = analyze_session(&session("s", "slow", track(t0(), &vec![(315.0, 4.0); 120])), &params, None).unwrap();
    let result = compare_fleet(&[slow.fleet_entry(), fast.fleet_entry()], None, &params.fleet).unwrap();
    let sog = result
        .rankings
        .iter()
        .find(|r| r.metric == sailtrace::fleet::FleetMetric::AvgSog)
        .unwrap();
    assert_eq!(sog.ranking[0].sailor_id, "fast");
    assert_eq!(sog.ranking[0].rank, Some(1));
    assert_eq!(sog.ranking[1].rank, Some(2));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn arrival_order_does_not_change_the_series(
        fixes in Just(track(t0(), &vec![(315.0, 5.0); 40])).prop_shuffle()
    ) {
        let params = NormalizeParams::default();
        let sorted = normalize(&track(t0(), &vec![(315.0, 5.0); 40]), &params).unwrap();
        let shuffled = normalize(&fixes, &params).unwrap();
        prop_assert_eq!(sorted.samples(), shuffled.samples());
        prop_assert_eq!(sorted.gaps(), shuffled.gaps());
        for pair in shuffled.samples().windows(2) {
            prop_assert!(pair[0].timestamp < pair[1].timestamp);
        }
    }
}
