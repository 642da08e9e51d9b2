//! Terminal tables for plans, reports and ledger contents.

use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL};
use stakewire_deploy::{
    ActionStatus, ExecutionReport, LedgerSnapshot, Plan, Registry, RunState, ValidatedTarget,
};

fn table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

fn or_dash<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

pub fn print_catalog(registry: &Registry, target: &ValidatedTarget) {
    let mut catalog = table(vec!["Module", "Contract", "Initializer", "Depends on", "Target"]);
    for descriptor in registry.descriptors() {
        let deps = descriptor
            .dependencies()
            .iter()
            .map(|k| k.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let role = if let Some(module) = target.modules.get(&descriptor.kind) {
            format!("v{}", module.version)
        } else if let Some(address) = target.pinned.get(&descriptor.kind) {
            format!("pinned {address}")
        } else {
            "-".to_string()
        };
        catalog.add_row(vec![
            descriptor.kind.to_string(),
            descriptor.contract.clone(),
            descriptor.initializer_signature().to_string(),
            deps,
            role,
        ]);
    }
    println!("{catalog}");
}

pub fn print_plan(plan: &Plan) {
    if plan.is_empty() {
        println!("Nothing to do: no module is targeted.");
        return;
    }

    let mut actions = table(vec!["#", "Action", "Module", "Details"]);
    for (index, action) in plan.actions().iter().enumerate() {
        actions.add_row(vec![
            (index + 1).to_string(),
            action.label().to_string(),
            action.kind().to_string(),
            action.to_string(),
        ]);
    }
    println!("{actions}");

    if plan.is_converged() {
        println!("The ledger already matches the target.");
    }
}

pub fn print_report(report: &ExecutionReport) {
    let mut entries = table(vec![
        "#", "Action", "Module", "Status", "Address", "Tx", "Attempts", "Error",
    ]);
    for entry in &report.entries {
        entries.add_row(vec![
            entry.position.to_string(),
            entry.action.label().to_string(),
            entry.action.kind().to_string(),
            entry.status.to_string(),
            or_dash(entry.result_address),
            or_dash(entry.tx_hash),
            entry.attempts.to_string(),
            or_dash(entry.error.as_deref()),
        ]);
    }
    println!("{entries}");

    match report.state {
        RunState::Completed => println!(
            "Completed: {} done, {} skipped.",
            report.count(ActionStatus::Done),
            report.count(ActionStatus::Skipped)
        ),
        RunState::Halted { position } => {
            println!("Halted at action #{position}.");
            if report.count(ActionStatus::Unconfirmed) > 0 {
                println!(
                    "The last transaction may have landed: check the chain, then run `stakewire reconcile <kind> landed|dropped` before re-running."
                );
            }
        }
    }
}

pub fn print_ledger(snapshot: &LedgerSnapshot) {
    if snapshot.is_empty() {
        println!("The ledger is empty.");
        return;
    }

    let mut ledger = table(vec![
        "Module",
        "Address",
        "Version",
        "Last updated",
        "Settings",
        "Pending",
    ]);
    for (kind, record) in snapshot.iter() {
        let version = if record.logic_version.is_empty() {
            "-".to_string()
        } else {
            record.logic_version.clone()
        };
        ledger.add_row(vec![
            kind.to_string(),
            or_dash(record.address),
            version,
            or_dash(record.last_updated.map(|t| t.to_rfc3339())),
            record.applied.keys().cloned().collect::<Vec<_>>().join("\n"),
            or_dash(record.pending.as_ref()),
        ]);
    }
    println!("{ledger}");
}
