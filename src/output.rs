use colored::Colorize;

use crate::models::{DeleteReport, RawResponse};

/// Print the outcome of a delete
pub fn print_report(report: &DeleteReport, tag_only: bool) {
    println!(
        "{} {} {}",
        "DELETED".red().bold(),
        report.image.bold(),
        truncate_digest(&report.digest).dimmed()
    );

    if !tag_only {
        println!(
            "  {} every tag pointing at this digest is gone; use --tag-only to keep the others",
            "NOTE:".yellow().bold()
        );
        return;
    }

    if report.lost_tags.is_empty() {
        println!("  {}", "No other tags shared this digest.".green());
        return;
    }

    for tag in &report.recreated {
        println!("  [{}] {}", "RECREATED".green().bold(), tag);
    }
    for tag in &report.failed {
        println!("  [{}] {}", "LOST".red().bold(), tag);
    }

    println!("{}", "─".repeat(60));
    println!(
        "{} {} of {} shared tags recreated",
        "SUMMARY:".bold(),
        report.recreated.len().to_string().green().bold(),
        report.lost_tags.len()
    );
}

/// Print a registry response verbatim (no colors).
pub fn print_raw(resp: &RawResponse, include_headers: bool) {
    let rendered = resp.render(include_headers);
    if rendered.ends_with('\n') {
        print!("{}", rendered);
    } else {
        println!("{}", rendered);
    }
}

fn truncate_digest(digest: &str) -> &str {
    if digest.len() > 19 {
        &digest[..19]
    } else {
        digest
    }
}
