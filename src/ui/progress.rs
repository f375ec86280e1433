use crate::ui::icons::{CHECK, CROSS, GATE, SKIP, SPARKLE, WAIT};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

/// Terminal UI for an interactive `convoy start` run, rendered via `indicatif`.
///
/// Two bars are stacked vertically:
/// - Stage bar: how many stages have finished
/// - Iteration bar: spinner with the current iteration and model
pub struct PipelineUI {
    multi: MultiProgress,
    stage_bar: ProgressBar,
    iteration_bar: ProgressBar,
    /// Also print each iteration start above the bars
    verbose: bool,
}

impl PipelineUI {
    pub fn new(total_stages: u64, verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let stage_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");

        let stage_bar = multi.add(ProgressBar::new(total_stages));
        stage_bar.set_style(stage_style);
        stage_bar.set_prefix("Stages");

        let iteration_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");

        let iteration_bar = multi.add(ProgressBar::new_spinner());
        iteration_bar.set_style(iteration_style);
        iteration_bar.set_prefix("  Iter");

        Self {
            multi,
            stage_bar,
            iteration_bar,
            verbose,
        }
    }

    /// Print a line via `MultiProgress`, falling back to `eprintln!` if the rich UI fails.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    pub fn start_stage(&self, stage: &str, description: &str) {
        self.stage_bar
            .set_message(format!("{}: {}", style(stage).yellow(), description));
    }

    pub fn start_iteration(&self, iter: u32, max: u32, model: &str) {
        if self.verbose {
            self.print_line(format!("    {} iteration {}/{} ({})", style("→").dim(), iter, max, model));
        }
        self.iteration_bar.set_message(format!(
            "Running iteration {}/{} {}",
            style(iter).cyan(),
            max,
            style(format!("({})", model)).dim()
        ));
        self.iteration_bar
            .enable_steady_tick(Duration::from_millis(100));
    }

    pub fn iteration_failed(&self, iter: u32, reason: &str) {
        self.print_line(format!(
            "    {} Iteration {} failed: {}",
            CROSS,
            iter,
            style(reason).red()
        ));
    }

    pub fn stage_complete(&self, stage: &str) {
        self.iteration_bar.disable_steady_tick();
        self.stage_bar.inc(1);
        self.print_line(format!("{} {}", CHECK, style(stage).green().bold()));
    }

    pub fn stage_skipped(&self, stage: &str, reason: &str) {
        self.stage_bar.inc(1);
        self.print_line(format!(
            "{} {} {}",
            SKIP,
            style(stage).dim(),
            style(format!("({})", reason)).dim()
        ));
    }

    pub fn stage_failed(&self, stage: &str, error: &str) {
        self.iteration_bar.disable_steady_tick();
        self.print_line(format!(
            "{} {} {}",
            CROSS,
            style(stage).red().bold(),
            style(error).red()
        ));
    }

    pub fn waiting(&self, message: &str) {
        self.iteration_bar
            .set_message(format!("{} {}", WAIT, style(message).yellow()));
        self.print_line(format!("{} {}", WAIT, style(message).yellow().bold()));
    }

    pub fn gate_result(&self, passed: bool, score: u32, threshold: u32) {
        let verdict = if passed {
            style("passed".to_string()).green().bold()
        } else {
            style("failed".to_string()).red().bold()
        };
        self.print_line(format!(
            "    {} Quality gate {} (score {}/{})",
            GATE, verdict, score, threshold
        ));
    }

    /// Stop all bars and print the final verdict.
    pub fn finish(&self, success: bool, job_id: &str) {
        self.iteration_bar.finish_and_clear();
        if success {
            self.stage_bar
                .finish_with_message(format!("{} {} complete", SPARKLE, job_id));
        } else {
            self.stage_bar.abandon_with_message(format!(
                "{} {}",
                CROSS,
                style(format!("{} failed", job_id)).red()
            ));
        }
    }
}
