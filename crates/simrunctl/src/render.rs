//! Output rendering for simrunctl.

use chrono::{DateTime, Utc};
use simrun_core::{OutputSource, RunEvent, RunId, RunRecord, RunSummary};

pub fn print_run_submitted(id: &RunId) {
    println!("Submitted run: {id}");
}

/// Print runs in tabular format.
pub fn print_run_list(runs: &[RunSummary]) {
    if runs.is_empty() {
        println!("No runs found.");
        return;
    }

    println!(
        "{:<36}  {:<20}  {:<24}  {:<10}  {:<19}  {:<5}",
        "ID", "LABEL", "TARGET", "STATE", "SUBMITTED", "EXIT"
    );
    println!("{}", "-".repeat(124));

    for run in runs {
        println!(
            "{:<36}  {:<20}  {:<24}  {:<10}  {:<19}  {:<5}",
            run.id.0,
            truncate(&run.label, 20),
            truncate(&run.target, 24),
            run.state.as_str(),
            format_time(&run.submitted_at),
            run.exit_code.map_or_else(|| "-".to_string(), |c| c.to_string()),
        );
    }

    println!();
    println!("{} run(s)", runs.len());
}

/// Print the full record of one run.
pub fn print_run_details(run: &RunRecord) {
    let descriptor = &run.descriptor;
    println!("Run: {}", run.id);
    println!();
    println!("  Label:      {}", descriptor.display_label());
    println!("  State:      {}", run.state);
    println!("  Target:     {}", descriptor.target.summary());
    println!("  Command:    {}", descriptor.executable.display_command());
    println!("  Directory:  {}", descriptor.working_directory.display());
    if let Some(timeout_ms) = descriptor.timeout_ms {
        println!("  Timeout:    {}", format_duration(timeout_ms / 1000));
    }
    if let Some(code) = run.exit_code {
        println!("  Exit code:  {code}");
    }
    if let Some(reason) = &run.failure_reason {
        println!("  Cause:      {reason}");
    }

    println!();
    println!("  Submitted:  {}", format_time(&run.submitted_at));
    if let Some(started) = &run.started_at {
        println!("  Started:    {}", format_time(started));
    }
    if let Some(ended) = &run.ended_at {
        println!("  Ended:      {}", format_time(ended));
    }
    if let Some(elapsed) = run.elapsed(Utc::now()) {
        let secs = u64::try_from(elapsed.num_seconds()).unwrap_or(0);
        println!("  Elapsed:    {}", format_duration(secs));
    }

    if !descriptor.notification.is_empty() {
        println!();
        println!("  Notify ({}):", descriptor.notification.trigger.as_str());
        for channel in &descriptor.notification.channels {
            println!("    {channel}");
        }
    }

    if !run.warnings.is_empty() {
        println!();
        println!("  Warnings:");
        for warning in &run.warnings {
            println!("    {warning}");
        }
    }

    if !run.marker_hits.is_empty() {
        println!();
        println!("  Error markers:");
        for line in run.marker_hits.iter() {
            println!("    {}", line.text);
        }
    }

    if !run.output_tail.is_empty() {
        println!();
        println!("  Output (last {} lines):", run.output_tail.len());
        for line in run.output_tail.iter() {
            println!("    {}", line.text);
        }
    }
}

/// Print one streamed event: output lines verbatim, state changes as markers.
pub fn print_event(event: &RunEvent) {
    match event {
        RunEvent::Output { line, .. } => match line.source {
            OutputSource::Stdout => println!("{}", line.text),
            OutputSource::Stderr => eprintln!("{}", line.text),
        },
        RunEvent::StateChanged {
            state, reason, exit_code, ..
        } => {
            let mut text = format!("== {state}");
            if let Some(code) = exit_code {
                text.push_str(&format!(" (exit {code})"));
            }
            if let Some(reason) = reason {
                text.push_str(&format!(": {reason}"));
            }
            eprintln!("{text}");
        }
    }
}

/// `H:MM:SS` for runs that may take days.
pub fn format_duration(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours}:{minutes:02}:{seconds:02}")
}

fn format_time(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{kept}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_long_durations() {
        assert_eq!(format_duration(0), "0:00:00");
        assert_eq!(format_duration(3725), "1:02:05");
        assert_eq!(format_duration(90_000), "25:00:00");
    }

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncate("short", 20), "short");
        assert_eq!(truncate("ωωωωωωωωωω", 6), "ωωω...");
    }
}
