//! # Seed Data Generator
//!
//! Populates the lead store with demo leads for development.
//!
//! ## Usage
//! ```bash
//! # Generate 500 leads for tenant "demo" (default)
//! cargo run -p funnel-db --bin seed
//!
//! # Generate custom amount for another tenant
//! cargo run -p funnel-db --bin seed -- --count 2000 --tenant acme
//!
//! # Specify database path
//! cargo run -p funnel-db --bin seed -- --db ./data/funnel.db
//! ```
//!
//! ## Generated Leads
//! Leads are spread over two demo pipelines whose stage ids match the
//! `FakeCrm` demo pipelines in funnel-sync:
//! - Pipeline 100 "Sales": stages 101..=105 (104 won, 105 lost)
//! - Pipeline 200 "Renewals": stages 201..=203
//!
//! Every 17th lead is flagged deleted, every 5th carries a "vip" tag.

use std::env;

use anyhow::Context;
use chrono::Utc;
use funnel_core::validation::validate_tenant_id;
use funnel_core::{Lead, Tag};
use funnel_db::{Database, DbConfig};

const SALES_STAGES: &[i64] = &[101, 102, 103, 104, 105];
const RENEWAL_STAGES: &[i64] = &[201, 202, 203];
const OWNERS: &[i64] = &[9001, 9002, 9003];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    let mut count: usize = 500;
    let mut db_path = String::from("./funnel_dev.db");
    let mut tenant_id = String::from("demo");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--count" | "-c" => {
                if i + 1 < args.len() {
                    count = args[i + 1].parse().unwrap_or(500);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--tenant" | "-t" => {
                if i + 1 < args.len() {
                    tenant_id = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Funnel Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --count <N>      Number of leads to generate (default: 500)");
                println!("  -d, --db <PATH>      Database file path (default: ./funnel_dev.db)");
                println!("  -t, --tenant <ID>    Tenant id (default: demo)");
                println!("  -h, --help           Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    validate_tenant_id(&tenant_id).context("invalid --tenant")?;

    println!("Funnel Seed Data Generator");
    println!("==========================");
    println!("Database: {}", db_path);
    println!("Tenant:   {}", tenant_id);
    println!("Leads:    {}", count);
    println!();

    let db = Database::new(DbConfig::new(&db_path))
        .await
        .with_context(|| format!("opening {db_path}"))?;

    println!("✓ Connected to database");
    println!("✓ Migrations applied");

    let existing = db.leads().count_all(&tenant_id).await?;
    if existing > 0 {
        println!("⚠ Tenant already has {} leads", existing);
        println!("  Skipping seed to avoid overwriting synced data.");
        return Ok(());
    }

    let now = Utc::now().timestamp();
    let leads: Vec<Lead> = (1..=count).map(|n| generate_lead(n as i64, now)).collect();

    let start = std::time::Instant::now();
    let report = db.leads().sync(&tenant_id, &leads, false).await?;

    println!();
    println!(
        "✓ Stored {} leads in {:?} ({} errors)",
        report.created,
        start.elapsed(),
        report.errors
    );

    let tallies = db.leads().funnel_counts(&tenant_id).await?;
    println!("  {} distinct (pipeline, stage, deleted) groups", tallies.len());

    db.close().await;
    println!();
    println!("✓ Seed complete!");

    Ok(())
}

/// Generates one deterministic demo lead.
fn generate_lead(n: i64, now: i64) -> Lead {
    let (pipeline_id, stages) = if n % 4 == 0 {
        (200, RENEWAL_STAGES)
    } else {
        (100, SALES_STAGES)
    };
    let status_id = stages[(n as usize * 7) % stages.len()];

    // Spread creation over the last ~90 days.
    let created_at = now - (n * 7919) % (90 * 86_400);

    let mut lead = Lead::new(n, pipeline_id, status_id)
        .with_created_at(created_at)
        .with_updated_at(created_at + 3600);

    lead.name = Some(format!("Demo lead #{n}"));
    lead.price = Some(500 + (n * 37) % 9_500);
    lead.responsible_user_id = Some(OWNERS[n as usize % OWNERS.len()]);

    if matches!(status_id, 104 | 105) {
        lead.closed_at = Some(created_at + 86_400);
    }
    if n % 5 == 0 {
        lead.tags.push(Tag {
            id: Some(1),
            name: "vip".to_string(),
        });
    }
    if n % 17 == 0 {
        lead = lead.deleted();
    }

    lead
}
