//! Inspects a stream's `events.blob`: per-device counts, index continuity and event previews.

use std::collections::BTreeMap;
use std::path::PathBuf;

use weapon::log_codec::{EventLogRecord, parse_device_counts, parse_event_log_records};

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <path-to-event-log-file>", args[0]);
        eprintln!("\nExample: {} ./.weapon/user-events/user__me/stream__reviews/events.blob", args[0]);
        std::process::exit(1);
    }

    let file_path = PathBuf::from(&args[1]);
    let bytes = match std::fs::read(&file_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Error reading file '{}': {}", file_path.display(), e);
            std::process::exit(1);
        }
    };

    println!("WeaponScope - Event Log Analyzer");
    println!("================================");
    println!("File: {}", file_path.display());
    println!(
        "Size: {} bytes ({:.2} KB)",
        bytes.len(),
        bytes.len() as f64 / 1024.0
    );
    println!();

    println!("Device Counts:");
    println!("--------------");
    let device_counts = parse_device_counts(&bytes);
    if device_counts.is_empty() {
        println!("  No devices found or invalid file format");
    } else {
        let total_events: usize = device_counts.values().sum();
        println!("  Total devices: {}", device_counts.len());
        println!("  Total contiguous events: {total_events}");
        for (device_id, count) in &device_counts {
            println!("  {device_id}: {count}");
        }
    }

    println!();
    println!("Event Details:");
    println!("--------------");
    let records = parse_event_log_records(&bytes);
    let mut events_by_device: BTreeMap<&str, Vec<&EventLogRecord>> = BTreeMap::new();
    for record in &records {
        events_by_device
            .entry(record.device_id.as_str())
            .or_default()
            .push(record);
    }
    println!("  Total parsed events: {}", records.len());

    for (device_id, device_records) in &events_by_device {
        println!();
        println!("  Device: {device_id}");
        let mut expected_index = 0;
        let mut problems = 0;
        for record in device_records {
            let index = record.within_device_events_index;
            let marker = if index < expected_index {
                problems += 1;
                " (BACKTRACK)"
            } else if index > expected_index {
                problems += 1;
                " (GAP)"
            } else {
                ""
            };
            println!(
                "    #{index}{marker} clock {} at {}: {}",
                record.event.logical_clock,
                record.event.timestamp,
                preview(&record.event.event)
            );
            expected_index = index + 1;
        }
        if problems == 0 {
            println!("    All indices are sequential");
        } else {
            println!("    WARNING: {problems} out-of-sequence record(s)");
        }
    }

    println!();
    println!("Summary:");
    println!("--------");
    let mut mismatch = false;
    for (device_id, device_records) in &events_by_device {
        let contiguous = device_counts.get(*device_id).copied().unwrap_or(0);
        if contiguous != device_records.len() {
            mismatch = true;
            println!(
                "  Device {device_id}: {} records, but only the first {contiguous} are usable",
                device_records.len()
            );
        }
    }
    if !mismatch {
        println!("  Every record is part of its device's contiguous prefix");
    }
}

fn preview(event: &serde_json::Value) -> String {
    let text = event.to_string();
    if text.chars().count() > 100 {
        format!("{}...", text.chars().take(100).collect::<String>())
    } else {
        text
    }
}
