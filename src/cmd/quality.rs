//! `convoy quality`: the quality gate's operations on the current project.

use anyhow::{Result, bail};
use console::style;

use convoy::errors::PipelineError;
use convoy::quality::{self, Checklist, IterationHistory, QualityReport};
use convoy::ui::icons::{CROSS, GATE};

use super::super::QualityCommands;
use super::{Context, print_json};

pub async fn cmd_quality(ctx: &Context, command: QualityCommands) -> Result<()> {
    let config = &ctx.config.quality;

    // completion works from recorded history, not from fresh artifacts
    if let QualityCommands::Completion {
        stage,
        max_iterations,
    } = &command
    {
        let history = IterationHistory::load(&ctx.env, stage)?;
        let checklist = std::fs::read_to_string(ctx.paths().plan_file())
            .ok()
            .map(|md| Checklist::parse(&md));
        return print_json(&quality::completion(&history, checklist, *max_iterations));
    }

    let artifacts = quality::collect(&ctx.project_dir, config).await?;
    match command {
        QualityCommands::Validate => {
            let validation = quality::validate(&artifacts, config);
            print_json(&validation)?;
            if !validation.passed {
                let failed = validation.checks.iter().filter(|c| !c.passed).count();
                bail!("Validation failed: {} check(s) failed", failed);
            }
            Ok(())
        }
        QualityCommands::Audit => print_json(&quality::audit(
            &artifacts.added_lines,
            &artifacts.external_findings,
        )),
        QualityCommands::Score => {
            let audit = quality::audit(&artifacts.added_lines, &artifacts.external_findings);
            print_json(&quality::score(&artifacts, &audit, config))
        }
        QualityCommands::Gate => {
            let result = quality::gate(&artifacts, config);
            print_json(&result)?;
            if !result.passed {
                return Err(PipelineError::GateFailure {
                    score: result.score.overall_score,
                    threshold: result.score.threshold,
                    failed_checks: result.validation.checks.iter().filter(|c| !c.passed).count(),
                }
                .into());
            }
            Ok(())
        }
        QualityCommands::Report => {
            let result = quality::gate(&artifacts, config);
            let (json_path, md_path) = QualityReport::new(result.clone(), ctx.env.now()).write(&ctx.env)?;
            let verdict = if result.passed {
                style("PASS").green().bold()
            } else {
                style("FAIL").red().bold()
            };
            let icon = if result.passed { GATE } else { CROSS };
            println!(
                "{} Gate {}: score {} (threshold {})",
                icon, verdict, result.score.overall_score, result.score.threshold
            );
            println!("  {}", json_path.display());
            println!("  {}", md_path.display());
            Ok(())
        }
        QualityCommands::Completion { .. } => Ok(()),
    }
}
