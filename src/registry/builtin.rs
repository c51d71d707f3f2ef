//! Built-in migration flow types.
//!
//! Every type starts at `initialization` and ends at `finalization`. Required
//! inputs of a phase are always produced by an earlier phase of the same type.

use super::flow_type::{FlowTypeConfig, PhaseDefinition};

pub fn builtin_flow_types() -> Vec<FlowTypeConfig> {
    vec![
        discovery(),
        collection(),
        assessment(),
        planning(),
        execution(),
        modernize(),
        decommission(),
    ]
}

fn initialization() -> PhaseDefinition {
    PhaseDefinition::new("initialization", "Initialization").produces(&["flow_context"])
}

fn finalization(requires: &[&str]) -> PhaseDefinition {
    PhaseDefinition::new("finalization", "Finalization")
        .requires(requires)
        .produces(&["summary"])
}

fn discovery() -> FlowTypeConfig {
    FlowTypeConfig::sequential(
        "discovery",
        "Discovery",
        vec![
            initialization(),
            PhaseDefinition::new("data_import", "Data Import")
                .requires(&["flow_context"])
                .produces(&["raw_data"]),
            PhaseDefinition::new("field_mapping", "Field Mapping")
                .requires(&["raw_data"])
                .produces(&["field_mappings"]),
            PhaseDefinition::new("data_cleansing", "Data Cleansing")
                .requires(&["raw_data", "field_mappings"])
                .produces(&["cleansed_data"]),
            PhaseDefinition::new("asset_inventory", "Asset Inventory")
                .requires(&["cleansed_data"])
                .produces(&["assets"]),
            PhaseDefinition::new("dependency_analysis", "Dependency Analysis")
                .requires(&["assets"])
                .produces(&["dependencies"]),
            finalization(&["assets", "dependencies"]),
        ],
    )
}

fn collection() -> FlowTypeConfig {
    FlowTypeConfig::sequential(
        "collection",
        "Data Collection",
        vec![
            initialization(),
            PhaseDefinition::new("platform_detection", "Platform Detection")
                .produces(&["platforms"]),
            PhaseDefinition::new("automated_collection", "Automated Collection")
                .requires(&["platforms"])
                .produces(&["collected_data"]),
            PhaseDefinition::new("gap_analysis", "Gap Analysis")
                .requires(&["collected_data"])
                .produces(&["gaps"]),
            PhaseDefinition::new("manual_collection", "Manual Collection")
                .requires(&["gaps"])
                .produces(&["questionnaire_responses"]),
            PhaseDefinition::new("data_validation", "Data Validation")
                .requires(&["collected_data"])
                .produces(&["validation_report"]),
            finalization(&["validation_report"]),
        ],
    )
}

fn assessment() -> FlowTypeConfig {
    FlowTypeConfig::sequential(
        "assessment",
        "Assessment",
        vec![
            initialization(),
            PhaseDefinition::new("readiness_assessment", "Readiness Assessment")
                .produces(&["readiness"]),
            PhaseDefinition::new("complexity_analysis", "Complexity Analysis")
                .requires(&["readiness"])
                .produces(&["complexity_scores"]),
            PhaseDefinition::new("tech_debt_assessment", "Technical Debt Assessment")
                .produces(&["tech_debt"]),
            PhaseDefinition::new("risk_assessment", "Risk Assessment")
                .requires(&["complexity_scores"])
                .produces(&["risks"]),
            PhaseDefinition::new("recommendation_generation", "Recommendation Generation")
                .requires(&["complexity_scores", "risks"])
                .produces(&["sixr_recommendations"]),
            finalization(&["sixr_recommendations"]),
        ],
    )
}

fn planning() -> FlowTypeConfig {
    FlowTypeConfig::sequential(
        "planning",
        "Migration Planning",
        vec![
            initialization(),
            PhaseDefinition::new("wave_planning", "Wave Planning").produces(&["waves"]),
            PhaseDefinition::new("timeline_generation", "Timeline Generation")
                .requires(&["waves"])
                .produces(&["timeline"]),
            PhaseDefinition::new("resource_allocation", "Resource Allocation")
                .requires(&["waves"])
                .produces(&["allocations"]),
            finalization(&["timeline", "allocations"]),
        ],
    )
}

fn execution() -> FlowTypeConfig {
    FlowTypeConfig::sequential(
        "execution",
        "Migration Execution",
        vec![
            initialization(),
            PhaseDefinition::new("pre_migration", "Pre-Migration").produces(&["runbook"]),
            PhaseDefinition::new("migration_execution", "Migration Execution")
                .requires(&["runbook"])
                .produces(&["cutover_log"]),
            PhaseDefinition::new("post_migration", "Post-Migration")
                .requires(&["cutover_log"])
                .produces(&["validation_results"]),
            finalization(&["validation_results"]),
        ],
    )
}

fn modernize() -> FlowTypeConfig {
    FlowTypeConfig::sequential(
        "modernize",
        "Modernization",
        vec![
            initialization(),
            PhaseDefinition::new("modernization_assessment", "Modernization Assessment")
                .produces(&["candidates"]),
            PhaseDefinition::new("architecture_design", "Architecture Design")
                .requires(&["candidates"])
                .produces(&["target_architecture"]),
            PhaseDefinition::new("implementation_planning", "Implementation Planning")
                .requires(&["target_architecture"])
                .produces(&["implementation_plan"]),
            finalization(&["implementation_plan"]),
        ],
    )
}

fn decommission() -> FlowTypeConfig {
    FlowTypeConfig::sequential(
        "decommission",
        "Decommission",
        vec![
            initialization(),
            PhaseDefinition::new("decommission_planning", "Decommission Planning")
                .produces(&["decommission_plan"]),
            PhaseDefinition::new("data_migration", "Data Retention & Migration")
                .requires(&["decommission_plan"])
                .produces(&["archived_data"]),
            PhaseDefinition::new("system_shutdown", "System Shutdown")
                .requires(&["decommission_plan", "archived_data"])
                .produces(&["shutdown_report"]),
            finalization(&["shutdown_report"]),
        ],
    )
}
