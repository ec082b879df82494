// =============================================================================
// SALAMA — Load Test Tool
// =============================================================================
// Mints driver JWTs, then posts JSON location updates to the core server at a
// configurable rate and reports acceptance/rejection/latency counters.
// =============================================================================

use clap::Parser;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "salama-loadtest")]
#[command(about = "Load test tool for the Salama core server")]
struct Args {
    /// Server base URL
    #[arg(long, default_value = "http://localhost:3001")]
    url: String,

    /// Location updates per second
    #[arg(long, default_value_t = 50)]
    rate: u32,

    /// Duration in seconds
    #[arg(long, default_value_t = 30)]
    duration: u64,

    /// Number of distinct simulated drivers
    #[arg(long, default_value_t = 10)]
    drivers: usize,

    /// JWT signing secret (must match the server's JWT_SECRET)
    #[arg(long, env = "JWT_SECRET")]
    jwt_secret: String,

    /// Centre latitude
    #[arg(long, default_value_t = -1.286)]
    lat: f64,

    /// Centre longitude
    #[arg(long, default_value_t = 36.817)]
    lon: f64,
}

#[derive(Serialize)]
struct Claims {
    sub: String,
    role: String,
    exp: i64,
}

struct Counters {
    sent: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    rate_limited: AtomicU64,
    network_error: AtomicU64,
    latency_sum_us: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            sent: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            network_error: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
        }
    }
}

fn mint_driver_token(secret: &str, driver_id: &str) -> String {
    let claims = Claims {
        sub: driver_id.to_string(),
        role: "driver".to_string(),
        exp: chrono::Utc::now().timestamp() + 3600,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("JWT encoding")
}

fn main() {
    let args = Args::parse();

    println!("=== Salama Load Test ===");
    println!("Target:   {}/api/security/location-update", args.url);
    println!("Rate:     {} updates/s", args.rate);
    println!("Duration: {}s", args.duration);
    println!("Drivers:  {}", args.drivers);
    println!("Centre:   lat={} lon={}", args.lat, args.lon);
    println!();

    // Pre-mint one token per simulated driver.
    let tokens: Vec<(String, String)> = (0..args.drivers)
        .map(|i| {
            let driver_id = format!("loadtest-driver-{i}");
            let token = mint_driver_token(&args.jwt_secret, &driver_id);
            (driver_id, token)
        })
        .collect();
    println!("Minted {} driver tokens", tokens.len());

    // Check server health first.
    let health_url = format!("{}/health", args.url);
    match reqwest::blocking::get(&health_url) {
        Ok(r) if r.status().is_success() => println!("Server health: OK"),
        Ok(r) => {
            eprintln!("Server health check failed: {}", r.status());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Cannot reach server: {}", e);
            std::process::exit(1);
        }
    }

    let counters = Arc::new(Counters::new());
    let update_url = format!("{}/api/security/location-update", args.url);

    let interval = Duration::from_micros(1_000_000 / args.rate as u64);
    let deadline = Instant::now() + Duration::from_secs(args.duration);

    println!("\nSending...\n");
    let start = Instant::now();

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("HTTP client");

    let mut rng = rand::thread_rng();
    let mut tick = 0u64;

    while Instant::now() < deadline {
        let (driver_id, token) = &tokens[(tick as usize) % tokens.len()];
        let body = json!({
            "deliveryId": format!("loadtest-delivery-{}", tick % 200),
            "driverId": driver_id,
            "latitude": args.lat + rng.gen_range(-0.01..0.01),
            "longitude": args.lon + rng.gen_range(-0.01..0.01),
        });

        let req_start = Instant::now();
        counters.sent.fetch_add(1, Ordering::Relaxed);

        match client
            .post(&update_url)
            .bearer_auth(token)
            .json(&body)
            .send()
        {
            Ok(resp) => {
                let latency = req_start.elapsed().as_micros() as u64;
                counters.latency_sum_us.fetch_add(latency, Ordering::Relaxed);

                match resp.status().as_u16() {
                    200 => {
                        counters.accepted.fetch_add(1, Ordering::Relaxed);
                    }
                    429 => {
                        counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                    }
                    other => {
                        counters.rejected.fetch_add(1, Ordering::Relaxed);
                        if tick < 5 {
                            eprintln!("Unexpected status: {}", other);
                        }
                    }
                }
            }
            Err(_) => {
                counters.network_error.fetch_add(1, Ordering::Relaxed);
            }
        }

        tick += 1;

        // Print progress every 500 updates.
        if tick % 500 == 0 {
            let elapsed = start.elapsed().as_secs_f64();
            let sent = counters.sent.load(Ordering::Relaxed);
            println!(
                "  [{:.1}s] sent={} accepted={} rejected={} rate_limited={} err={} ({:.0} upd/s)",
                elapsed,
                sent,
                counters.accepted.load(Ordering::Relaxed),
                counters.rejected.load(Ordering::Relaxed),
                counters.rate_limited.load(Ordering::Relaxed),
                counters.network_error.load(Ordering::Relaxed),
                sent as f64 / elapsed,
            );
        }

        // Rate pacing.
        let target = Duration::from_micros(tick * interval.as_micros() as u64);
        let actual = start.elapsed();
        if actual < target {
            std::thread::sleep(target - actual);
        }
    }

    let elapsed = start.elapsed();
    let sent = counters.sent.load(Ordering::Relaxed);
    let accepted = counters.accepted.load(Ordering::Relaxed);
    let avg_latency = if sent > 0 {
        counters.latency_sum_us.load(Ordering::Relaxed) / sent
    } else {
        0
    };

    println!("\n=== Results ===");
    println!("Duration:     {:.2}s", elapsed.as_secs_f64());
    println!("Total sent:   {}", sent);
    println!(
        "Accepted:     {} ({:.1}%)",
        accepted,
        accepted as f64 / sent.max(1) as f64 * 100.0
    );
    println!("Rejected:     {}", counters.rejected.load(Ordering::Relaxed));
    println!("Rate limited: {}", counters.rate_limited.load(Ordering::Relaxed));
    println!("Net errors:   {}", counters.network_error.load(Ordering::Relaxed));
    println!("Avg latency:  {} us", avg_latency);
    println!("Throughput:   {:.1} upd/s", sent as f64 / elapsed.as_secs_f64());
}
