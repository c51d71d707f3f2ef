//! `flowmaster types`: registered flow types and their phases.

use anyhow::Result;

use flowmaster::registry::FlowTypeRegistry;

use super::super::Cli;
use super::print_json;

pub fn cmd_types(cli: &Cli) -> Result<()> {
    let registry = FlowTypeRegistry::with_builtin_types()?;
    let types = registry.list_all();

    if cli.json {
        let configs: Vec<_> = types.iter().map(|t| t.as_ref()).collect();
        return print_json(&configs);
    }

    println!();
    for config in &types {
        println!(
            "{} {} (v{}, table {})",
            console::style(&config.name).bold(),
            console::style(&config.display_name).dim(),
            config.version,
            config.child_table
        );
        for phase in &config.phases {
            let marker = if config.is_terminal(&phase.name) {
                console::style("■").green()
            } else {
                console::style("→").dim()
            };
            print!("  {} {:<24}", marker, phase.name);
            if !phase.required_inputs.is_empty() {
                print!(" needs [{}]", phase.required_inputs.join(", "));
            }
            if !phase.outputs.is_empty() {
                print!(" produces [{}]", phase.outputs.join(", "));
            }
            println!();
        }
        println!();
    }
    Ok(())
}
