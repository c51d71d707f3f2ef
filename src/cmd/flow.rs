//! Flow commands: create, advance, inspect and control flows.

use anyhow::Result;
use serde_json::{Map, Value};

use flowmaster::engine::{OutcomeKind, PhaseOutcome};
use flowmaster::flow::{FlowFilter, FlowStatus, LifecycleStatus, NewFlow};

use super::super::Cli;
use super::{App, parse_flow_id, parse_object, print_json};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Pause,
    Resume,
    Cancel,
    Recover,
}

pub async fn cmd_create(
    app: &App,
    cli: &Cli,
    flow_type: &str,
    client: &str,
    engagement: &str,
    user: &str,
    config_json: Option<&str>,
) -> Result<()> {
    let configuration = match config_json {
        Some(raw) => Value::Object(parse_object("--config-json", raw)?),
        None => Value::Object(Map::new()),
    };
    let request =
        NewFlow::new(flow_type, client, engagement, user).with_configuration(configuration);
    let record = app.engine.create_flow(&request).await?;

    if cli.json {
        return print_json(&record);
    }
    println!(
        "{} {} flow {} on phase {}",
        console::style("Created").green().bold(),
        record.master.flow_type,
        console::style(record.master.flow_id).cyan(),
        record.child.current_phase()
    );
    Ok(())
}

pub async fn cmd_advance(
    app: &App,
    cli: &Cli,
    flow_id: &str,
    phase: Option<&str>,
    input: Option<&str>,
    all: bool,
) -> Result<()> {
    let flow_id = parse_flow_id(flow_id)?;
    let overrides = match input {
        Some(raw) => parse_object("--input", raw)?,
        None => Map::new(),
    };

    let mut outcomes = Vec::new();
    loop {
        let outcome = app
            .engine
            .advance_phase(flow_id, phase, overrides.clone())
            .await?;
        let keep_going = all
            && matches!(outcome.kind, OutcomeKind::Advanced | OutcomeKind::Skipped { .. })
            && outcome.lifecycle_status.is_runnable();
        if !cli.json {
            print_outcome(&outcome);
        }
        outcomes.push(outcome);
        if !keep_going {
            break;
        }
    }

    if cli.json {
        if all {
            print_json(&outcomes)?;
        } else if let Some(outcome) = outcomes.first() {
            print_json(outcome)?;
        }
    }

    if let Some(PhaseOutcome {
        kind: OutcomeKind::Failed { error },
        executed_phase,
        ..
    }) = outcomes.last()
    {
        anyhow::bail!("Phase '{}' failed: {}", executed_phase, error);
    }
    Ok(())
}

fn print_outcome(outcome: &PhaseOutcome) {
    let label = match &outcome.kind {
        OutcomeKind::Advanced => console::style("advanced".to_string()).green(),
        OutcomeKind::Skipped { reason } => console::style(format!("skipped ({})", reason)).yellow(),
        OutcomeKind::Completed => console::style("completed".to_string()).green().bold(),
        OutcomeKind::RetryScheduled { reason } => {
            console::style(format!("retry later ({})", reason)).yellow()
        }
        OutcomeKind::Failed { error } => console::style(format!("failed ({})", error)).red(),
        OutcomeKind::Superseded => console::style("superseded".to_string()).yellow(),
    };
    println!(
        "{:<24} {} -> {}  [{} attempt(s), {}ms]",
        outcome.executed_phase,
        label,
        outcome.current_phase,
        outcome.attempts,
        outcome.duration_ms
    );
}

pub async fn cmd_status(app: &App, cli: &Cli, flow_id: &str, full: bool) -> Result<()> {
    let flow_id = parse_flow_id(flow_id)?;

    if full {
        let record = app.engine.get_flow(flow_id).await?;
        if cli.json {
            return print_json(&record);
        }
        print_status(&FlowStatus::from_records(&record.master, &record.child));
        let state = record.child.phase_state();
        println!("  completed: {}", state.completed_phases().join(", "));
        for skipped in state.skipped_phases() {
            println!("  skipped:   {} ({})", skipped.phase, skipped.reason);
        }
        let artifacts: Vec<&str> = state.artifacts().keys().map(String::as_str).collect();
        println!("  artifacts: {}", artifacts.join(", "));
        println!(
            "  runs:      {}",
            record.master.execution_metadata.phase_runs.len()
        );
        return Ok(());
    }

    let status = app.engine.get_status(flow_id).await?;
    if cli.json {
        return print_json(&status);
    }
    print_status(&status);
    Ok(())
}

fn print_status(status: &FlowStatus) {
    println!(
        "{} {:<12} {:<12} {}",
        console::style(status.flow_id).cyan(),
        status.flow_type,
        styled_lifecycle(status.lifecycle_status),
        status.current_phase
    );
    if let Some(error) = &status.last_error {
        println!("  last error: {}", console::style(error).red());
    }
}

fn styled_lifecycle(status: LifecycleStatus) -> console::StyledObject<&'static str> {
    let style = console::style(status.as_str());
    match status {
        LifecycleStatus::Completed => style.green(),
        LifecycleStatus::Failed => style.red(),
        LifecycleStatus::Paused | LifecycleStatus::Cancelled => style.yellow(),
        LifecycleStatus::Initialized | LifecycleStatus::Running => style,
    }
}

pub async fn cmd_list(
    app: &App,
    cli: &Cli,
    client: &str,
    engagement: &str,
    flow_type: Option<&str>,
    status: Option<&str>,
) -> Result<()> {
    let mut filter = FlowFilter::for_tenant(client, engagement);
    filter.flow_type = flow_type.map(str::to_string);
    filter.lifecycle_status = status
        .map(|s| s.parse::<LifecycleStatus>().map_err(anyhow::Error::msg))
        .transpose()?;

    let flows = app.engine.list_flows(&filter).await?;
    if cli.json {
        return print_json(&flows);
    }
    if flows.is_empty() {
        println!("No flows for {}/{}", client, engagement);
        return Ok(());
    }
    for status in &flows {
        print_status(status);
    }
    println!();
    println!("{} flow(s)", flows.len());
    Ok(())
}

pub async fn cmd_lifecycle(
    app: &App,
    cli: &Cli,
    flow_id: &str,
    action: LifecycleAction,
) -> Result<()> {
    let flow_id = parse_flow_id(flow_id)?;
    let status = match action {
        LifecycleAction::Pause => app.engine.pause(flow_id).await?,
        LifecycleAction::Resume => app.engine.resume(flow_id).await?,
        LifecycleAction::Cancel => app.engine.cancel(flow_id).await?,
        LifecycleAction::Recover => app.engine.recover(flow_id).await?,
    };
    if cli.json {
        return print_json(&status);
    }
    print_status(&status);
    Ok(())
}

pub async fn cmd_delete(app: &App, cli: &Cli, flow_id: &str, purge: bool) -> Result<()> {
    let flow_id = parse_flow_id(flow_id)?;
    if purge {
        app.engine.purge(flow_id).await?;
    } else {
        app.engine.soft_delete(flow_id).await?;
    }
    if cli.json {
        return print_json(&serde_json::json!({ "flow_id": flow_id, "purged": purge }));
    }
    println!(
        "{} flow {}",
        if purge { "Purged" } else { "Deleted" },
        console::style(flow_id).cyan()
    );
    Ok(())
}
