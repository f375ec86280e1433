//! Integration tests for convoy
//!
//! These drive the binary end to end against temporary home and project directories.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// A project directory plus an isolated convoy home.
struct Sandbox {
    home: TempDir,
    project: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        Self {
            home: TempDir::new().unwrap(),
            project: TempDir::new().unwrap(),
        }
    }

    /// A convoy Command pointed at this sandbox.
    fn convoy(&self) -> Command {
        let mut cmd = cargo_bin_cmd!("convoy");
        cmd.arg("--home")
            .arg(self.home.path())
            .arg("--project-dir")
            .arg(self.project.path())
            .env_remove("CONVOY_HOME")
            .env_remove("CONVOY_MAX_PIPELINES");
        cmd
    }

    fn project(&self) -> &Path {
        self.project.path()
    }

    fn write_template(&self, name: &str, json: &str) {
        let dir = self.project().join(".convoy/templates");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("{}.json", name)), json).unwrap();
    }
}

const MINI_TEMPLATE: &str = r#"{
    "name": "mini",
    "description": "Intake, plan and build only",
    "stages": [
        { "id": "intake" },
        { "id": "plan" },
        { "id": "build", "config": { "max_iterations": 10 } }
    ]
}"#;

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        cargo_bin_cmd!("convoy")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("start"))
            .stdout(predicate::str::contains("daemon"))
            .stdout(predicate::str::contains("heartbeat"));
    }

    #[test]
    fn test_version() {
        cargo_bin_cmd!("convoy").arg("--version").assert().success();
    }

    #[test]
    fn test_status_on_empty_home() {
        let sb = Sandbox::new();
        sb.convoy().args(["status", "--json"]).assert().success();
    }
}

// =============================================================================
// Start / Dry Run
// =============================================================================

mod start {
    use super::*;

    #[test]
    fn test_dry_run_prints_plan_without_writing_state() {
        let sb = Sandbox::new();
        sb.write_template("mini", MINI_TEMPLATE);

        let output = sb
            .convoy()
            .args([
                "start",
                "--goal",
                "Update lodash to 4.17.21!",
                "--pipeline",
                "mini",
                "--dry-run",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("fix/update-lodash-to-4-17-21"))
            .stdout(predicate::str::contains("max 10 iterations"))
            .get_output()
            .stdout
            .clone();

        let stdout = String::from_utf8(output).unwrap();
        let intake = stdout.find("intake").unwrap();
        let plan = stdout.find("plan [").unwrap();
        let build = stdout.find("build").unwrap();
        assert!(intake < plan && plan < build, "stages out of order:\n{}", stdout);

        assert!(!sb.project().join(".convoy/pipeline-state.md").exists());
    }

    #[test]
    fn test_dry_run_json_marks_completed_stages() {
        let sb = Sandbox::new();
        sb.write_template("mini", MINI_TEMPLATE);

        let output = sb
            .convoy()
            .args([
                "start",
                "--issue",
                "42",
                "--pipeline",
                "mini",
                "--completed-stages",
                "intake,plan",
                "--dry-run",
                "--json",
            ])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();

        let plan: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(plan["job_id"], "pipeline-42");
        let stages = plan["stages"].as_array().unwrap();
        assert_eq!(stages.len(), 3);
        assert_eq!(stages[0]["already_complete"], true);
        assert_eq!(stages[1]["already_complete"], true);
        assert_eq!(stages[2]["already_complete"], false);
    }

    #[test]
    fn test_start_without_goal_fails() {
        let sb = Sandbox::new();
        sb.convoy()
            .args(["start", "--dry-run"])
            .assert()
            .failure()
            .code(1)
            .stderr(predicate::str::contains("Goal is required"));
    }

    #[test]
    fn test_start_with_unknown_template_fails() {
        let sb = Sandbox::new();
        sb.convoy()
            .args(["start", "--goal", "x", "--pipeline", "no-such-template", "--dry-run"])
            .assert()
            .failure()
            .code(1);
    }

    #[test]
    fn test_unknown_completed_stage_fails() {
        let sb = Sandbox::new();
        sb.write_template("mini", MINI_TEMPLATE);
        sb.convoy()
            .args([
                "start",
                "--goal",
                "x",
                "--pipeline",
                "mini",
                "--completed-stages",
                "deploy",
                "--dry-run",
            ])
            .assert()
            .failure();
    }

    #[test]
    fn test_run_executes_stage_commands_in_order() {
        let sb = Sandbox::new();
        sb.write_template(
            "scripted",
            r#"{
                "name": "scripted",
                "stages": [
                    { "id": "intake", "config": { "command": "echo intake >> trail.txt" } },
                    { "id": "build", "config": { "command": "echo build >> trail.txt", "max_iterations": 2 } }
                ]
            }"#,
        );

        sb.convoy()
            .args(["start", "--goal", "Add trail", "--pipeline", "scripted"])
            .assert()
            .success()
            .stdout(predicate::str::contains("complete"));

        let trail = fs::read_to_string(sb.project().join("trail.txt")).unwrap();
        assert_eq!(trail, "intake\nbuild\n");

        let state = fs::read_to_string(sb.project().join(".convoy/pipeline-state.md")).unwrap();
        assert!(state.contains("status: complete"), "state was:\n{}", state);
        // the heartbeat is removed once the run ends
        let leftover = fs::read_dir(sb.home.path().join("heartbeats"))
            .map(|dir| dir.filter_map(|e| e.ok()).count())
            .unwrap_or(0);
        assert_eq!(leftover, 0);
    }

    #[test]
    fn test_failing_stage_fails_the_run() {
        let sb = Sandbox::new();
        sb.write_template(
            "broken",
            r#"{
                "name": "broken",
                "stages": [
                    { "id": "build", "config": { "command": "exit 2", "max_iterations": 2 } },
                    { "id": "test", "config": { "command": "touch tested" } }
                ]
            }"#,
        );

        sb.convoy()
            .args(["start", "--goal", "Break it", "--pipeline", "broken"])
            .assert()
            .failure()
            .code(1)
            .stderr(predicate::str::contains("Stage build failed"));

        assert!(!sb.project().join("tested").exists());
        let state = fs::read_to_string(sb.project().join(".convoy/pipeline-state.md")).unwrap();
        assert!(state.contains("status: failed"), "state was:\n{}", state);
    }

    fn init_repo_with_commit(dir: &Path) -> git2::Repository {
        let repo = git2::Repository::init(dir).unwrap();
        fs::write(dir.join("README.md"), "hi\n").unwrap();
        {
            let mut index = repo.index().unwrap();
            index.add_path(Path::new("README.md")).unwrap();
            index.write().unwrap();
            let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
            let sig = git2::Signature::now("Test", "test@example.com").unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[]).unwrap();
        }
        repo
    }

    fn local_branches(repo: &git2::Repository) -> Vec<String> {
        let mut names: Vec<String> = repo
            .branches(Some(git2::BranchType::Local))
            .unwrap()
            .map(|b| b.unwrap().0.name().unwrap().unwrap().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_dry_run_in_repo_creates_no_branch_or_run_files() {
        let sb = Sandbox::new();
        let repo = init_repo_with_commit(sb.project());
        let branches = local_branches(&repo);
        let head = repo.head().unwrap().shorthand().unwrap().to_string();
        sb.write_template("mini", MINI_TEMPLATE);

        sb.convoy()
            .args(["start", "--goal", "Add retries", "--pipeline", "mini", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("fix/add-retries"));

        assert_eq!(local_branches(&repo), branches);
        assert_eq!(repo.head().unwrap().shorthand().unwrap(), head);
        assert!(!sb.home.path().join("heartbeats").exists());
        assert!(!sb.project().join(".convoy/checkpoints").exists());
        assert!(!sb.project().join(".convoy/pipeline-state.md").exists());
    }

    #[test]
    fn test_job_scope_keeps_run_state_apart() {
        let sb = Sandbox::new();
        sb.write_template(
            "one",
            r#"{ "name": "one", "stages": [ { "id": "build", "config": { "command": "true" } } ] }"#,
        );

        sb.convoy()
            .args(["--job-scope", "pipeline-42", "start", "--issue", "42", "--pipeline", "one"])
            .assert()
            .success();

        let scoped = sb.project().join(".convoy/jobs/pipeline-42/pipeline-state.md");
        let state = fs::read_to_string(&scoped).unwrap();
        assert!(state.contains("status: complete"), "state was:\n{}", state);
        assert!(!sb.project().join(".convoy/pipeline-state.md").exists());

        sb.convoy()
            .args(["--job-scope", "../escape", "start", "--issue", "42", "--pipeline", "one"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid job scope"));
    }
}

// =============================================================================
// Heartbeat
// =============================================================================

mod heartbeat {
    use super::*;

    #[test]
    fn test_write_list_check_clear() {
        let sb = Sandbox::new();
        let pid = std::process::id().to_string();

        sb.convoy()
            .args([
                "heartbeat",
                "write",
                "pipeline-123",
                "--pid",
                &pid,
                "--issue",
                "123",
                "--stage",
                "build",
                "--iteration",
                "3",
                "--activity",
                "running tests",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"iteration\": 3"));

        let output = sb
            .convoy()
            .args(["heartbeat", "list"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let list: serde_json::Value = serde_json::from_slice(&output).unwrap();
        let entries = list.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["job_id"], "pipeline-123");
        assert_eq!(entries[0]["stage"], "build");
        assert_eq!(entries[0]["alive"], true);

        sb.convoy()
            .args(["heartbeat", "check", "pipeline-123"])
            .assert()
            .success();

        sb.convoy()
            .args(["heartbeat", "clear", "pipeline-123"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Cleared 1 heartbeat(s)"));

        sb.convoy()
            .args(["heartbeat", "check", "pipeline-123"])
            .assert()
            .failure();
    }

    #[test]
    fn test_clear_requires_target() {
        let sb = Sandbox::new();
        sb.convoy()
            .args(["heartbeat", "clear"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--all"));
    }
}

// =============================================================================
// Checkpoint
// =============================================================================

mod checkpoint {
    use super::*;

    #[test]
    fn test_save_restore_clear() {
        let sb = Sandbox::new();

        sb.convoy()
            .args([
                "checkpoint",
                "save",
                "--stage",
                "build",
                "--iteration",
                "5",
                "--tests-passing",
                "--files",
                "src/a.rs,src/b.rs",
                "--git-sha",
                "abc123",
            ])
            .assert()
            .success();

        let output = sb
            .convoy()
            .args(["checkpoint", "restore", "build"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let cp: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(cp["iteration"], 5);
        assert_eq!(cp["tests_passing"], true);
        assert_eq!(cp["git_sha"], "abc123");
        assert_eq!(cp["files_modified"].as_array().unwrap().len(), 2);

        sb.convoy()
            .args(["checkpoint", "clear", "--all"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Cleared 1 checkpoint(s)"));

        sb.convoy()
            .args(["checkpoint", "restore", "build"])
            .assert()
            .failure();
    }

    #[test]
    fn test_restore_missing_fails() {
        let sb = Sandbox::new();
        sb.convoy()
            .args(["checkpoint", "restore", "test"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }
}

// =============================================================================
// Quality
// =============================================================================

mod quality {
    use super::*;

    #[test]
    fn test_gate_fails_without_tests_or_coverage() {
        let sb = Sandbox::new();
        sb.convoy()
            .args(["quality", "gate"])
            .assert()
            .failure()
            .code(1)
            .stdout(predicate::str::contains("no test command configured"))
            .stderr(predicate::str::contains("Quality gate failed"));
    }

    #[test]
    fn test_report_writes_files() {
        let sb = Sandbox::new();
        sb.convoy()
            .args(["quality", "report"])
            .assert()
            .success()
            .stdout(predicate::str::contains("FAIL"));
        assert!(sb.project().join(".convoy/quality/report.json").exists());
        assert!(sb.project().join(".convoy/quality/report.md").exists());
    }

    #[test]
    fn test_completion_with_no_history_continues() {
        let sb = Sandbox::new();
        sb.convoy()
            .args(["quality", "completion", "--stage", "build"])
            .assert()
            .success()
            .stdout(predicate::str::contains("continue"));
    }
}

// =============================================================================
// Templates, Config, Intervene, Daemon
// =============================================================================

mod templates {
    use super::*;

    #[test]
    fn test_list_includes_builtins_and_workspace() {
        let sb = Sandbox::new();
        sb.write_template("mini", MINI_TEMPLATE);
        sb.convoy()
            .args(["templates", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("standard"))
            .stdout(predicate::str::contains("mini"))
            .stdout(predicate::str::contains("workspace"));
    }

    #[test]
    fn test_show_builtin() {
        let sb = Sandbox::new();
        sb.convoy()
            .args(["templates", "show", "fast"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"intake\""));
    }
}

mod config {
    use super::*;

    #[test]
    fn test_init_then_validate() {
        let sb = Sandbox::new();
        sb.convoy().args(["config", "init"]).assert().success();
        assert!(sb.project().join(".convoy/convoy.toml").exists());

        sb.convoy()
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_show_reports_defaults() {
        let sb = Sandbox::new();
        sb.convoy()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_concurrent_pipelines = 2"));
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let sb = Sandbox::new();
        fs::create_dir_all(sb.project().join(".convoy")).unwrap();
        fs::write(sb.project().join(".convoy/convoy.toml"), "[daemon\n").unwrap();
        sb.convoy().args(["config", "show"]).assert().failure();
    }
}

mod intervene {
    use super::*;

    #[test]
    fn test_skip_unknown_stage_fails() {
        let sb = Sandbox::new();
        sb.convoy()
            .args(["intervene", "skip", "bogus"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown stage id"));
    }

    #[test]
    fn test_skip_writes_marker() {
        let sb = Sandbox::new();
        sb.convoy()
            .args(["intervene", "skip", "review"])
            .assert()
            .success();
        assert!(sb.project().join(".convoy/intervention/skip-review").exists());
    }

    #[test]
    fn test_message_and_release() {
        let sb = Sandbox::new();
        sb.convoy()
            .args(["intervene", "message", "hold on"])
            .assert()
            .success();
        assert!(sb.project().join(".convoy/intervention/human-message").exists());

        sb.convoy()
            .args(["intervene", "release"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Pause released"));
        assert!(!sb.project().join(".convoy/intervention/human-message").exists());
    }
}

mod daemon {
    use super::*;

    #[test]
    fn test_enqueue_writes_request() {
        let sb = Sandbox::new();
        sb.convoy()
            .args(["daemon", "enqueue", "--issue", "42", "--title", "Fix it"])
            .assert()
            .success()
            .stdout(predicate::str::contains("pipeline-42"));

        let requests: Vec<_> = fs::read_dir(sb.home.path().join("control/requests"))
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(requests.len(), 1);
        let body = fs::read_to_string(requests[0].path()).unwrap();
        assert!(body.contains("Fix it"));
    }

    #[test]
    fn test_stop_without_daemon_fails() {
        let sb = Sandbox::new();
        sb.convoy()
            .args(["daemon", "stop"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No convoy daemon is running"));
    }

    #[test]
    fn test_resume_writes_marker() {
        let sb = Sandbox::new();
        sb.convoy().args(["daemon", "resume"]).assert().success();
        assert!(sb.home.path().join("control/resume").exists());
    }
}
