use colored::Colorize;
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, ContentArrangement, Table};

use cairn_core::command::ExecuteCommand;
use cairn_core::{CleanReport, DeployReport, PlanBucket, PlanReport, ValidateReport};

fn new_table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.iter().map(Cell::new).collect::<Vec<_>>());
    table
}

/// Format the deploy plan as a colored table.
pub fn print_plan_table(report: &PlanReport) {
    println!(
        "{}",
        format!(
            "{} change(s) in source, {} recorded as deployed",
            report.source_changes, report.deployed_changes
        )
        .dimmed()
    );

    if report.commands.is_empty() {
        println!("{}", "Environment is up to date. Nothing to deploy.".green());
        return;
    }

    let mut table = new_table(&["#", "Bucket", "Command", "Objects"]);
    for command in &report.commands {
        table.add_row(vec![
            Cell::new(command.position),
            Cell::new(format_bucket(command.bucket)),
            Cell::new(&command.description),
            Cell::new(command.objects.join("\n")),
        ]);
    }

    println!("{table}");
}

fn format_bucket(bucket: PlanBucket) -> String {
    let text = bucket.to_string();
    match bucket {
        PlanBucket::Immediate => text.green().to_string(),
        PlanBucket::Deferred => text.dimmed().to_string(),
        PlanBucket::Audit => text.blue().to_string(),
        PlanBucket::Warning => text.yellow().to_string(),
        PlanBucket::Fatal => text.red().bold().to_string(),
    }
}

/// Print a deploy report summary.
pub fn print_deploy_summary(report: &DeployReport) {
    for warning in &report.warnings {
        println!("{} {}", "WARNING:".yellow().bold(), warning);
    }

    if report.executed.is_empty() && report.audits.is_empty() {
        println!("{}", "Environment is up to date. No deployment necessary.".green());
    } else if report.dry_run {
        println!(
            "{}",
            format!(
                "Dry run: {} command(s) and {} audit update(s) would be applied:",
                report.executed.len(),
                report.audits.len()
            )
            .yellow()
            .bold()
        );
        for detail in &report.executed {
            println!("  {} {}", "→".yellow(), detail.command);
        }
        for audit in &report.audits {
            println!("  {} {}", "→".blue(), audit);
        }
    } else {
        println!(
            "{}",
            format!(
                "Successfully executed {} command(s) (execution time {}ms)",
                report.executed.len(),
                report.total_time_ms
            )
            .green()
            .bold()
        );
        for detail in &report.executed {
            println!(
                "  {} {} ({}ms)",
                "→".green(),
                detail.command,
                detail.execution_time_ms
            );
        }
        for audit in &report.audits {
            println!("  {} {}", "→".blue(), audit);
        }
    }

    if report.deferred > 0 {
        println!(
            "{}",
            format!(
                "{} command(s) deferred to other changesets; use --changesets or --all-changesets to include them.",
                report.deferred
            )
            .dimmed()
        );
    }
}

/// Print a validate report.
pub fn print_validate_result(report: &ValidateReport) {
    if report.valid {
        println!("{}", "Successfully validated all deployed changes.".green().bold());
    }

    for warning in &report.warnings {
        println!("{} {}", "WARNING:".yellow().bold(), warning);
    }

    for issue in &report.issues {
        println!("{} {}", "ERROR:".red().bold(), issue);
    }
}

/// Print the drops a clean is about to run.
pub fn print_clean_plan(plan: &[ExecuteCommand]) {
    println!(
        "{}",
        format!("Clean will run {} drop command(s):", plan.len()).red().bold()
    );
    for command in plan {
        println!("  {} {}", "✗".red(), command);
    }
}

/// Print objects dropped by clean.
pub fn print_clean_result(report: &CleanReport) {
    if report.dropped.is_empty() {
        println!("{}", "Nothing to clean.".green());
        return;
    }

    println!(
        "{}",
        format!(
            "Successfully cleaned {}. Ran {} drop(s) in {} pass(es):",
            report.schemas.join(", "),
            report.dropped.len(),
            report.passes
        )
        .green()
        .bold()
    );
    for item in &report.dropped {
        println!("  {} {}", "✗".red(), item);
    }
}
